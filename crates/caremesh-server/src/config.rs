//! Relay configuration loaded from environment variables.
//!
//! Every setting has a default, so a development relay starts with no
//! configuration at all.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use caremesh_gateway::GatewayConfig;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// HS256 secret shared with the credential issuer.
    /// Env: `CAREMESH_JWT_SECRET`
    pub jwt_secret: String,

    /// Env: `CAREMESH_DB_PATH`
    /// Default: `caremesh.db`
    pub db_path: PathBuf,

    /// Env: `CAREMESH_HOST` / `CAREMESH_PORT`
    pub host: String,
    pub port: u16,

    /// Connection-level settings handed to the gateway.
    /// Env: `CAREMESH_HEARTBEAT_SECS`, `CAREMESH_AUTH_TIMEOUT_SECS`,
    /// `CAREMESH_OUTBOUND_QUEUE`, `CAREMESH_HISTORY_LIMIT`, `CAREMESH_HISTORY_MAX`
    pub gateway: GatewayConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "dev-secret-change-me".to_string(),
            db_path: PathBuf::from("caremesh.db"),
            host: "0.0.0.0".to_string(),
            port: 3000,
            gateway: GatewayConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        match lookup("CAREMESH_JWT_SECRET") {
            Some(secret) => config.jwt_secret = secret,
            None => tracing::warn!("CAREMESH_JWT_SECRET not set, using the development secret"),
        }
        if let Some(path) = lookup("CAREMESH_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(host) = lookup("CAREMESH_HOST") {
            config.host = host;
        }
        parse_into(&lookup, "CAREMESH_PORT", &mut config.port);

        let gateway = &mut config.gateway;
        let mut secs = gateway.heartbeat_interval.as_secs();
        parse_into(&lookup, "CAREMESH_HEARTBEAT_SECS", &mut secs);
        gateway.heartbeat_interval = Duration::from_secs(secs.max(1));

        let mut secs = gateway.auth_timeout.as_secs();
        parse_into(&lookup, "CAREMESH_AUTH_TIMEOUT_SECS", &mut secs);
        gateway.auth_timeout = Duration::from_secs(secs.max(1));

        parse_into(&lookup, "CAREMESH_OUTBOUND_QUEUE", &mut gateway.outbound_queue);
        parse_into(&lookup, "CAREMESH_HISTORY_LIMIT", &mut gateway.history_limit);
        parse_into(&lookup, "CAREMESH_HISTORY_MAX", &mut gateway.history_max);
        if gateway.history_limit > gateway.history_max {
            tracing::warn!(
                limit = gateway.history_limit,
                max = gateway.history_max,
                "CAREMESH_HISTORY_LIMIT exceeds CAREMESH_HISTORY_MAX, clamping"
            );
            gateway.history_limit = gateway.history_max;
        }

        config
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Leave `slot` untouched when the variable is unset or does not parse.
fn parse_into<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(value) => *slot = value,
        Err(e) => tracing::warn!(value = %raw, error = %e, "Invalid {}, using default", key),
    }
}

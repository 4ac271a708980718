//! The caremesh relay: accepts persistent connections, authenticates them,
//! routes end-to-end encrypted message envelopes between conversation
//! members, and tracks presence. Message content is opaque here; the relay
//! only ever sees the sealed payload.

pub mod audit;
pub mod auth;
pub mod connection;
pub mod error;
pub mod presence;
pub mod registry;
pub mod router;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use crate::audit::AuditSink;
use crate::auth::CredentialVerifier;
use crate::registry::SessionRegistry;
use crate::router::Router;
use crate::store::Store;

pub use error::{RelayError, StoreError};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Sweep period, and how stale a silent connection must be to be evicted.
    pub heartbeat_interval: Duration,
    pub auth_timeout: Duration,
    /// Per-connection outbound queue capacity.
    pub outbound_queue: usize,
    pub history_limit: u32,
    pub history_max: u32,
    pub read_retry_attempts: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(10),
            outbound_queue: 256,
            history_limit: 50,
            history_max: 200,
            read_retry_attempts: 3,
        }
    }
}

/// Everything a connection task needs, cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    store: Arc<dyn Store>,
    registry: SessionRegistry,
    router: Router,
    verifier: Arc<dyn CredentialVerifier>,
    audit: Arc<dyn AuditSink>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(
        store: Arc<dyn Store>,
        verifier: Arc<dyn CredentialVerifier>,
        audit: Arc<dyn AuditSink>,
        config: GatewayConfig,
    ) -> Self {
        let registry = SessionRegistry::new(store.clone(), config.outbound_queue);
        let router = Router::new(
            store.clone(),
            registry.clone(),
            audit.clone(),
            config.clone(),
        );
        Self {
            inner: Arc::new(GatewayInner {
                store,
                registry,
                router,
                verifier,
                audit,
                config,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn verifier(&self) -> &dyn CredentialVerifier {
        self.inner.verifier.as_ref()
    }

    pub fn audit(&self) -> &dyn AuditSink {
        self.inner.audit.as_ref()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }
}

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// X25519 public keys are 32 bytes.
pub const PUBLIC_KEY_LEN: usize = 32;
/// AES-256-GCM nonce length.
pub const NONCE_LEN: usize = 12;
/// AES-256-GCM authentication tag length. Every sealed payload is at least this long.
pub const TAG_LEN: usize = 16;

pub const DEFAULT_MESSAGE_TYPE: &str = "text";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Patient,
    Doctor,
    Ops,
    It,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Doctor => "doctor",
            Role::Ops => "ops",
            Role::It => "it",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient" => Ok(Role::Patient),
            "doctor" => Ok(Role::Doctor),
            "ops" => Ok(Role::Ops),
            "it" => Ok(Role::It),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A user as seen by the relay. Identities are created by user management;
/// the relay only reads them and flips the presence flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: Uuid,
    pub display_name: String,
    pub role: Role,
    /// Base64 X25519 public key, absent until the client publishes one.
    pub public_key: Option<String>,
    pub online: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("{field} is not valid base64")]
    Encoding { field: &'static str },

    #[error("{field} must be {expected} bytes, got {actual}")]
    Length {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("ciphertext shorter than the authentication tag")]
    Truncated,
}

/// End-to-end sealed message content. This triple is the only form of
/// message content the relay stores or forwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub ephemeral_public_key: String,
    pub nonce: String,
}

/// Raw bytes of an [`EncryptedPayload`] after base64 decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadBytes {
    pub ciphertext: Vec<u8>,
    pub ephemeral_public_key: [u8; PUBLIC_KEY_LEN],
    pub nonce: [u8; NONCE_LEN],
}

impl EncryptedPayload {
    pub fn from_bytes(ciphertext: &[u8], ephemeral_public_key: &[u8], nonce: &[u8]) -> Self {
        Self {
            ciphertext: BASE64.encode(ciphertext),
            ephemeral_public_key: BASE64.encode(ephemeral_public_key),
            nonce: BASE64.encode(nonce),
        }
    }

    /// Structural check only: decodes each field and checks lengths. Says
    /// nothing about whether the seal verifies.
    pub fn decode(&self) -> Result<PayloadBytes, PayloadError> {
        let ciphertext = BASE64
            .decode(&self.ciphertext)
            .map_err(|_| PayloadError::Encoding { field: "ciphertext" })?;
        if ciphertext.len() < TAG_LEN {
            return Err(PayloadError::Truncated);
        }

        let ephemeral_public_key = decode_fixed::<PUBLIC_KEY_LEN>(
            "ephemeralPublicKey",
            &self.ephemeral_public_key,
        )?;
        let nonce = decode_fixed::<NONCE_LEN>("nonce", &self.nonce)?;

        Ok(PayloadBytes {
            ciphertext,
            ephemeral_public_key,
            nonce,
        })
    }
}

fn decode_fixed<const N: usize>(field: &'static str, encoded: &str) -> Result<[u8; N], PayloadError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| PayloadError::Encoding { field })?;
    let actual = bytes.len();
    bytes.try_into().map_err(|_| PayloadError::Length {
        field,
        expected: N,
        actual,
    })
}

/// Delivery state of a message. Transitions only move forward:
/// `Sent -> Delivered -> Read`, and `Sent -> Read` is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Sent,
    Delivered,
    Read,
}

impl DeliveryState {
    pub fn from_flags(delivered: bool, read: bool) -> Self {
        match (delivered, read) {
            (_, true) => DeliveryState::Read,
            (true, false) => DeliveryState::Delivered,
            (false, false) => DeliveryState::Sent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub encrypted_content: EncryptedPayload,
    #[serde(rename = "type")]
    pub message_type: String,
    pub delivered: bool,
    pub read: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_by: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn state(&self) -> DeliveryState {
        DeliveryState::from_flags(self.delivered, self.read)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub participants: Vec<Uuid>,
    pub creator_id: Uuid,
    pub is_group: bool,
    pub last_message_id: Option<Uuid>,
    pub unread_counts: HashMap<Uuid, u32>,
    pub last_read: HashMap<Uuid, Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_member(&self, identity: Uuid) -> bool {
        self.participants.contains(&identity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub id: Uuid,
    pub display_name: String,
    pub role: Role,
    pub public_key: Option<String>,
    pub online: bool,
}

/// A conversation as listed for one particular participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: Uuid,
    pub participants: Vec<ParticipantSummary>,
    pub last_message: Option<Message>,
    pub unread_count: u32,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_payload() -> EncryptedPayload {
        EncryptedPayload::from_bytes(&[7u8; 40], &[1u8; PUBLIC_KEY_LEN], &[2u8; NONCE_LEN])
    }

    #[test]
    fn decode_accepts_well_formed_payload() {
        let bytes = valid_payload().decode().unwrap();
        assert_eq!(bytes.ciphertext.len(), 40);
        assert_eq!(bytes.ephemeral_public_key, [1u8; PUBLIC_KEY_LEN]);
    }

    #[test]
    fn decode_rejects_short_nonce() {
        let mut payload = valid_payload();
        payload.nonce = BASE64.encode([0u8; 8]);
        assert_eq!(
            payload.decode(),
            Err(PayloadError::Length {
                field: "nonce",
                expected: NONCE_LEN,
                actual: 8
            })
        );
    }

    #[test]
    fn decode_rejects_truncated_ciphertext_and_bad_base64() {
        let mut payload = valid_payload();
        payload.ciphertext = BASE64.encode([0u8; 4]);
        assert_eq!(payload.decode(), Err(PayloadError::Truncated));

        let mut payload = valid_payload();
        payload.ephemeral_public_key = "not base64!".into();
        assert!(matches!(payload.decode(), Err(PayloadError::Encoding { .. })));
    }

    #[test]
    fn delivery_state_prefers_read() {
        assert_eq!(DeliveryState::from_flags(false, false), DeliveryState::Sent);
        assert_eq!(DeliveryState::from_flags(true, false), DeliveryState::Delivered);
        assert_eq!(DeliveryState::from_flags(false, true), DeliveryState::Read);
        assert!(DeliveryState::Sent < DeliveryState::Delivered);
        assert!(DeliveryState::Delivered < DeliveryState::Read);
    }

    #[test]
    fn role_round_trips_through_str() {
        for role in [Role::Patient, Role::Doctor, Role::Ops, Role::It, Role::Admin] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("nurse".parse::<Role>().is_err());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationSummary, DEFAULT_MESSAGE_TYPE, EncryptedPayload, Message};

/// Envelopes sent FROM client TO relay.
///
/// `auth` carries its token at the top level; every other envelope with a
/// body carries it under `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEnvelope {
    /// Authenticate the connection with a bearer credential
    Auth { token: String },

    GetConversations,

    GetMessages { data: GetMessagesData },

    SendMessage { data: SendMessageData },

    /// Typing indicator for a single recipient, never persisted
    Typing { data: TypingData },

    MarkAsRead { data: MarkAsReadData },

    CreateConversation { data: CreateConversationData },

    Ping,
}

impl ClientEnvelope {
    /// The wire discriminator, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::GetConversations => "get-conversations",
            Self::GetMessages { .. } => "get-messages",
            Self::SendMessage { .. } => "send-message",
            Self::Typing { .. } => "typing",
            Self::MarkAsRead { .. } => "mark-as-read",
            Self::CreateConversation { .. } => "create-conversation",
            Self::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMessagesData {
    pub conversation_id: Uuid,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageData {
    pub conversation_id: Uuid,
    pub encrypted_content: EncryptedPayload,
    #[serde(rename = "type", default = "default_message_type")]
    pub message_type: String,
    /// Echoed back in `message-sent` so the client can reconcile its optimistic state.
    #[serde(default, alias = "tempId")]
    pub client_correlation_id: Option<String>,
}

fn default_message_type() -> String {
    DEFAULT_MESSAGE_TYPE.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingData {
    pub conversation_id: Uuid,
    pub recipient_id: Uuid,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkAsReadData {
    pub conversation_id: Uuid,
    pub message_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationData {
    pub recipient_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Events pushed FROM relay TO client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    AuthSuccess {
        user_id: Uuid,
        display_name: String,
        role: crate::models::Role,
    },

    AuthError { message: String },

    ConversationsList(Vec<ConversationSummary>),

    MessagesHistory {
        conversation_id: Uuid,
        messages: Vec<Message>,
    },

    /// Acknowledgement to the sending connection
    MessageSent {
        client_correlation_id: Option<String>,
        message: Message,
    },

    NewMessage(Message),

    TypingStatus {
        conversation_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    },

    /// Sent to the original sender once the recipient reads its messages
    MessagesRead {
        conversation_id: Uuid,
        message_ids: Vec<Uuid>,
        read_by: Uuid,
        read_at: DateTime<Utc>,
    },

    ConversationCreated(ConversationSummary),

    UserStatus {
        user_id: Uuid,
        status: PresenceStatus,
    },

    OnlineUsers(Vec<Uuid>),

    Pong,

    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_correlation_id: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auth_token_sits_at_top_level() {
        let env: ClientEnvelope =
            serde_json::from_value(json!({"type": "auth", "token": "abc"})).unwrap();
        assert!(matches!(env, ClientEnvelope::Auth { token } if token == "abc"));
    }

    #[test]
    fn send_message_defaults_type_and_accepts_temp_id() {
        let env: ClientEnvelope = serde_json::from_value(json!({
            "type": "send-message",
            "data": {
                "conversationId": Uuid::nil(),
                "encryptedContent": {"ciphertext": "a", "ephemeralPublicKey": "b", "nonce": "c"},
                "tempId": "tmp-1"
            }
        }))
        .unwrap();

        match env {
            ClientEnvelope::SendMessage { data } => {
                assert_eq!(data.message_type, "text");
                assert_eq!(data.client_correlation_id.as_deref(), Some("tmp-1"));
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn unit_envelopes_ignore_stray_data() {
        let env: ClientEnvelope =
            serde_json::from_value(json!({"type": "get-conversations", "data": {}})).unwrap();
        assert_eq!(env.kind(), "get-conversations");
        let env: ClientEnvelope = serde_json::from_value(json!({"type": "mark-as-read", "data": {
            "conversationId": Uuid::nil(), "messageIds": []
        }}))
        .unwrap();
        assert_eq!(env.kind(), "mark-as-read");
    }

    #[test]
    fn unknown_or_missing_discriminator_is_rejected() {
        assert!(serde_json::from_value::<ClientEnvelope>(json!({"type": "shout"})).is_err());
        assert!(serde_json::from_value::<ClientEnvelope>(json!({"data": {}})).is_err());
    }

    #[test]
    fn server_events_use_kebab_discriminators() {
        let value = serde_json::to_value(ServerEvent::UserStatus {
            user_id: Uuid::nil(),
            status: PresenceStatus::Offline,
        })
        .unwrap();
        assert_eq!(value["type"], "user-status");
        assert_eq!(value["data"]["status"], "offline");
        assert_eq!(value["data"]["userId"], Uuid::nil().to_string());

        let value = serde_json::to_value(ServerEvent::Pong).unwrap();
        assert_eq!(value, json!({"type": "pong"}));
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use caremesh_types::events::{SendMessageData, ServerEvent, TypingData};
use caremesh_types::models::{ConversationSummary, Message};

use crate::GatewayConfig;
use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::error::RelayError;
use crate::presence;
use crate::registry::{ConnectionId, SessionRegistry};
use crate::store::{NewMessage, Store, StoreResult, blocking, read_with_retry};

/// Validates envelopes, enforces membership, persists through the [`Store`]
/// and fans results out through the [`SessionRegistry`].
pub struct Router {
    store: Arc<dyn Store>,
    registry: SessionRegistry,
    audit: Arc<dyn AuditSink>,
    config: GatewayConfig,
}

impl Router {
    pub fn new(
        store: Arc<dyn Store>,
        registry: SessionRegistry,
        audit: Arc<dyn AuditSink>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            store,
            registry,
            audit,
            config,
        }
    }

    pub async fn list_conversations(
        &self,
        identity: Uuid,
    ) -> Result<Vec<ConversationSummary>, RelayError> {
        self.read(move |s| s.list_conversations(identity)).await
    }

    /// The newest `limit` messages, oldest first. Membership is checked before
    /// anything is read.
    pub async fn get_messages(
        &self,
        identity: Uuid,
        conversation_id: Uuid,
        limit: Option<u32>,
    ) -> Result<Vec<Message>, RelayError> {
        self.require_member(identity, conversation_id).await?;

        let limit = limit
            .unwrap_or(self.config.history_limit)
            .min(self.config.history_max);
        self.read(move |s| s.get_messages(conversation_id, limit))
            .await
    }

    /// Persist, acknowledge to `conn`, then push to recipients. Delivery is
    /// best-effort: an offline recipient leaves the message in `sent`.
    pub async fn send_message(
        &self,
        conn: ConnectionId,
        sender: Uuid,
        data: SendMessageData,
    ) -> Result<Message, RelayError> {
        let conversation_id = data.conversation_id;
        let conversation = self
            .read(move |s| s.get_conversation(conversation_id))
            .await?
            .filter(|c| c.is_active && c.is_member(sender));
        let Some(conversation) = conversation else {
            self.deny(sender, conversation_id);
            return Err(RelayError::NotAMember);
        };

        let payload = data
            .encrypted_content
            .decode()
            .map_err(|e| RelayError::MalformedEnvelope(e.to_string()))?;

        let new = NewMessage {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: sender,
            payload,
            message_type: data.message_type,
            created_at: Utc::now(),
        };
        let mut message = blocking(&self.store, move |s| s.insert_message(&new))
            .await
            .map_err(|e| {
                warn!(%conversation_id, %sender, "Failed to persist message: {}", e);
                RelayError::PersistenceUnavailable
            })?;

        self.registry.push(
            conn,
            ServerEvent::MessageSent {
                client_correlation_id: data.client_correlation_id,
                message: message.clone(),
            },
        );

        let event = ServerEvent::NewMessage(message.clone());
        let mut reached = 0;
        for recipient in conversation.participants.iter().filter(|p| **p != sender) {
            reached += self.registry.push_to_identity(*recipient, &event).await;
        }

        if reached > 0 {
            let at = Utc::now();
            let message_id = message.id;
            match blocking(&self.store, move |s| s.mark_delivered(message_id, at)).await {
                Ok(true) => {
                    message.delivered = true;
                    message.delivered_at = Some(at);
                }
                Ok(false) => {}
                Err(e) => warn!(%message_id, "Failed to record delivery: {}", e),
            }
        } else {
            debug!(message_id = %message.id, %conversation_id, "No live recipient, message stays sent");
        }

        self.audit.emit(AuditEvent::new(
            Some(sender),
            AuditAction::MessageSent,
            Some(format!("message:{}", message.id)),
        ));
        Ok(message)
    }

    /// Flip the listed messages to read and tell each original sender about
    /// its own messages only. Returns how many messages flipped.
    pub async fn mark_read(
        &self,
        reader: Uuid,
        conversation_id: Uuid,
        message_ids: Vec<Uuid>,
    ) -> Result<usize, RelayError> {
        self.require_member(reader, conversation_id).await?;
        if message_ids.is_empty() {
            return Ok(0);
        }

        let read_at = Utc::now();
        let receipts = blocking(&self.store, move |s| {
            s.mark_read(conversation_id, reader, &message_ids, read_at)
        })
        .await
        .map_err(|e| {
            warn!(%conversation_id, %reader, "Failed to mark messages read: {}", e);
            RelayError::PersistenceUnavailable
        })?;

        let mut by_sender: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
        for receipt in &receipts {
            by_sender
                .entry(receipt.sender_id)
                .or_default()
                .push(receipt.message_id);
        }

        for (sender, message_ids) in by_sender {
            let event = ServerEvent::MessagesRead {
                conversation_id,
                message_ids,
                read_by: reader,
                read_at,
            };
            let reached = self.registry.push_to_identity(sender, &event).await;
            debug!(%sender, reached, "Read receipt pushed");
        }

        if !receipts.is_empty() {
            self.audit.emit(AuditEvent::new(
                Some(reader),
                AuditAction::MessagesRead,
                Some(format!("conversation:{conversation_id}")),
            ));
        }
        Ok(receipts.len())
    }

    /// Return the direct conversation between `creator` and `recipient`,
    /// creating it if needed. A new conversation is also pushed to the
    /// recipient's live connections.
    pub async fn create_conversation(
        &self,
        creator: Uuid,
        recipient: Uuid,
    ) -> Result<ConversationSummary, RelayError> {
        if creator == recipient {
            return Err(RelayError::InvalidRequest(
                "cannot start a conversation with yourself".into(),
            ));
        }
        if self
            .read(move |s| s.get_identity(recipient))
            .await?
            .is_none()
        {
            return Err(RelayError::UnknownIdentity);
        }

        let (conversation, created) =
            blocking(&self.store, move |s| s.find_or_create_direct(creator, recipient))
                .await
                .map_err(|e| {
                    warn!(%creator, %recipient, "Failed to create conversation: {}", e);
                    RelayError::PersistenceUnavailable
                })?;

        let conversation_id = conversation.id;
        let summary = self.summary_for(conversation_id, creator).await?;
        if !created {
            return Ok(summary);
        }

        info!(%conversation_id, %creator, %recipient, "Conversation created");
        self.audit.emit(AuditEvent::new(
            Some(creator),
            AuditAction::ConversationCreated,
            Some(format!("conversation:{conversation_id}")),
        ));

        match self.summary_for(conversation_id, recipient).await {
            Ok(theirs) => {
                self.registry
                    .push_to_identity(recipient, &ServerEvent::ConversationCreated(theirs))
                    .await;
            }
            Err(e) => warn!(%conversation_id, "Could not notify recipient: {}", e),
        }
        Ok(summary)
    }

    /// Fire-and-forget. Dropped silently unless both sides belong to the
    /// conversation and the recipient is online. A sender outside the
    /// conversation is still audited.
    pub async fn typing(&self, identity: Uuid, data: TypingData) {
        let conversation_id = data.conversation_id;
        let conversation =
            match blocking(&self.store, move |s| s.get_conversation(conversation_id)).await {
                Ok(Some(c)) => c,
                Ok(None) => return,
                Err(e) => {
                    debug!(%conversation_id, "Typing dropped: {}", e);
                    return;
                }
            };

        if !conversation.is_active || !conversation.is_member(identity) {
            self.deny(identity, conversation_id);
            return;
        }
        if !conversation.is_member(data.recipient_id) || data.recipient_id == identity {
            return;
        }

        presence::typing(
            &self.registry,
            conversation_id,
            identity,
            data.recipient_id,
            data.is_typing,
        )
        .await;
    }

    async fn require_member(&self, identity: Uuid, conversation_id: Uuid) -> Result<(), RelayError> {
        if self
            .read(move |s| s.is_member(conversation_id, identity))
            .await?
        {
            return Ok(());
        }
        self.deny(identity, conversation_id);
        Err(RelayError::NotAMember)
    }

    async fn summary_for(
        &self,
        conversation_id: Uuid,
        viewer: Uuid,
    ) -> Result<ConversationSummary, RelayError> {
        self.read(move |s| s.conversation_summary(conversation_id, viewer))
            .await?
            .ok_or(RelayError::PersistenceUnavailable)
    }

    fn deny(&self, identity: Uuid, conversation_id: Uuid) {
        warn!(%identity, %conversation_id, "Access denied: not a member");
        self.audit.emit(AuditEvent::new(
            Some(identity),
            AuditAction::AccessDenied,
            Some(format!("conversation:{conversation_id}")),
        ));
    }

    async fn read<T, F>(&self, f: F) -> Result<T, RelayError>
    where
        F: Fn(&dyn Store) -> StoreResult<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        read_with_retry(&self.store, self.config.read_retry_attempts, f)
            .await
            .map_err(|e| {
                warn!("Store read failed: {}", e);
                RelayError::from(e)
            })
    }
}

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use caremesh_types::events::{ClientEnvelope, ServerEvent};

use crate::Gateway;
use crate::audit::{AuditAction, AuditEvent};
use crate::error::RelayError;
use crate::registry::{ConnectionId, Outbound, Registration};
use crate::store::read_with_retry;

/// Policy violation. Used when authentication fails or times out.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// How long the writer gets to flush queued frames after the reader stops.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Per-connection protocol state. Envelopes are handled one at a time, in
/// arrival order; replies go through the registry's outbound queue.
pub struct Session {
    gateway: Gateway,
    conn: ConnectionId,
    identity: Option<Uuid>,
}

impl Session {
    pub fn new(gateway: Gateway, conn: ConnectionId) -> Self {
        Self {
            gateway,
            conn,
            identity: None,
        }
    }

    pub fn identity(&self) -> Option<Uuid> {
        self.identity
    }

    pub fn connection(&self) -> ConnectionId {
        self.conn
    }

    pub async fn handle_text(&mut self, text: &str) -> Flow {
        let envelope = match serde_json::from_str::<ClientEnvelope>(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    connection = %self.conn,
                    "Malformed envelope: {} -- {}",
                    e,
                    envelope_preview(text)
                );
                self.reply_error(RelayError::MalformedEnvelope(e.to_string()), None);
                return Flow::Continue;
            }
        };

        match (self.identity, envelope) {
            (None, ClientEnvelope::Auth { token }) => self.authenticate(&token).await,
            (None, other) => {
                debug!(connection = %self.conn, kind = other.kind(), "Envelope before auth");
                self.gateway.audit().emit(AuditEvent::new(
                    None,
                    AuditAction::AccessDenied,
                    Some(format!("envelope:{}", other.kind())),
                ));
                self.reply_error(RelayError::NotAuthenticated, None);
                Flow::Continue
            }
            (Some(identity), envelope) => {
                self.dispatch(identity, envelope).await;
                Flow::Continue
            }
        }
    }

    /// Binary frames carry nothing this protocol understands.
    pub fn handle_binary(&self) {
        self.reply_error(
            RelayError::MalformedEnvelope("binary frames are not supported".into()),
            None,
        );
    }

    async fn authenticate(&mut self, token: &str) -> Flow {
        let Some(identity) = self.gateway.verifier().verify(token) else {
            return self.reject(None, "invalid or expired credential");
        };

        let lookup = read_with_retry(
            self.gateway.store(),
            self.gateway.config().read_retry_attempts,
            move |s| s.get_identity(identity),
        )
        .await;
        let profile = match lookup {
            Ok(Some(profile)) => profile,
            Ok(None) => return self.reject(Some(identity), "unknown identity"),
            Err(e) => {
                warn!(%identity, "Identity lookup failed: {}", e);
                self.reply_error(RelayError::from(e), None);
                return Flow::Continue;
            }
        };

        let registry = self.gateway.registry();
        match registry.admit(self.conn, identity).await {
            Ok(()) => {}
            Err(RelayError::ConnectionClosed) => return Flow::Close,
            Err(e) => {
                self.reply_error(e, None);
                return Flow::Continue;
            }
        }
        self.identity = Some(identity);

        info!(%identity, connection = %self.conn, role = %profile.role, "Authenticated");
        self.gateway
            .audit()
            .emit(AuditEvent::new(Some(identity), AuditAction::Login, None));

        self.reply(ServerEvent::AuthSuccess {
            user_id: identity,
            display_name: profile.display_name,
            role: profile.role,
        });
        let online = registry.online_identities().await;
        self.reply(ServerEvent::OnlineUsers(online));
        Flow::Continue
    }

    fn reject(&self, identity: Option<Uuid>, reason: &str) -> Flow {
        warn!(connection = %self.conn, ?identity, "Authentication failed: {}", reason);
        self.gateway.audit().emit(AuditEvent::new(
            identity,
            AuditAction::AuthenticationFailed,
            None,
        ));
        self.reply(ServerEvent::AuthError {
            message: RelayError::AuthenticationFailed.to_string(),
        });
        self.gateway
            .registry()
            .close(self.conn, CLOSE_POLICY_VIOLATION, "authentication failed");
        Flow::Close
    }

    async fn dispatch(&self, identity: Uuid, envelope: ClientEnvelope) {
        let router = self.gateway.router();

        let result = match envelope {
            ClientEnvelope::Auth { .. } => Err(RelayError::AlreadyBound),

            ClientEnvelope::GetConversations => router
                .list_conversations(identity)
                .await
                .map(|list| Some(ServerEvent::ConversationsList(list))),

            ClientEnvelope::GetMessages { data } => {
                let conversation_id = data.conversation_id;
                router
                    .get_messages(identity, conversation_id, data.limit)
                    .await
                    .map(|messages| {
                        Some(ServerEvent::MessagesHistory {
                            conversation_id,
                            messages,
                        })
                    })
            }

            ClientEnvelope::SendMessage { data } => {
                let correlation = data.client_correlation_id.clone();
                if let Err(e) = router.send_message(self.conn, identity, data).await {
                    self.reply_error(e, correlation);
                }
                Ok(None)
            }

            ClientEnvelope::Typing { data } => {
                router.typing(identity, data).await;
                Ok(None)
            }

            ClientEnvelope::MarkAsRead { data } => router
                .mark_read(identity, data.conversation_id, data.message_ids)
                .await
                .map(|_| None),

            ClientEnvelope::CreateConversation { data } => router
                .create_conversation(identity, data.recipient_id)
                .await
                .map(|summary| Some(ServerEvent::ConversationCreated(summary))),

            ClientEnvelope::Ping => {
                self.gateway.registry().mark_heartbeat(self.conn);
                Ok(Some(ServerEvent::Pong))
            }
        };

        match result {
            Ok(Some(event)) => self.reply(event),
            Ok(None) => {}
            Err(e) => self.reply_error(e, None),
        }
    }

    fn reply(&self, event: ServerEvent) {
        if !self.gateway.registry().push(self.conn, event) {
            debug!(connection = %self.conn, "Reply dropped, connection gone");
        }
    }

    fn reply_error(&self, error: RelayError, client_correlation_id: Option<String>) {
        self.reply(ServerEvent::Error {
            code: error.code().to_string(),
            message: error.to_string(),
            client_correlation_id,
        });
    }
}

/// Serve one WebSocket until either side closes it or the registry evicts it.
pub async fn serve(socket: WebSocket, gateway: Gateway) {
    let registry = gateway.registry().clone();
    let Registration {
        id: conn,
        mut outbound,
        cancel,
    } = registry.register();
    let (mut sender, mut receiver) = socket.split();

    // Writer: drains the outbound queue. Queued frames are flushed before a
    // cancellation is honoured.
    let writer_cancel = cancel.clone();
    let mut writer = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                biased;
                msg = outbound.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = writer_cancel.cancelled() => break,
            };

            let frame = match msg {
                Outbound::Event(event) => match serde_json::to_string(&event) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        warn!("Failed to serialize event: {}", e);
                        continue;
                    }
                },
                Outbound::Ping => Message::Ping(Default::default()),
                Outbound::Close { code, reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::new(gateway.clone(), conn);
    let auth_deadline = tokio::time::sleep(gateway.config().auth_timeout);
    tokio::pin!(auth_deadline);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut auth_deadline, if session.identity().is_none() => {
                warn!(connection = %conn, "No authentication before timeout, closing");
                registry.close(conn, CLOSE_POLICY_VIOLATION, "authentication timeout");
                break;
            }
            frame = receiver.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                if session.handle_text(text.as_str()).await == Flow::Close {
                    break;
                }
            }
            Some(Ok(Message::Binary(_))) => session.handle_binary(),
            Some(Ok(Message::Pong(_))) => registry.mark_heartbeat(conn),
            Some(Ok(Message::Ping(_))) => {}
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!(connection = %conn, "Transport error: {}", e);
                break;
            }
        }
    }

    registry.remove(conn).await;
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    if let Some(identity) = session.identity() {
        gateway
            .audit()
            .emit(AuditEvent::new(Some(identity), AuditAction::Logout, None));
        info!(%identity, connection = %conn, "Disconnected");
    } else {
        debug!(connection = %conn, "Unauthenticated connection closed");
    }
}

// The envelope type only; never the token or payload.
fn envelope_preview(text: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => match value.get("type").and_then(|t| t.as_str()) {
            Some(kind) => format!("type={}", kind.chars().take(200).collect::<String>()),
            None => "no type field".to_string(),
        },
        Err(_) => format!("{} bytes, not JSON", text.len()),
    }
}

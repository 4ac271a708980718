use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Login,
    Logout,
    AuthenticationFailed,
    AccessDenied,
    MessageSent,
    MessagesRead,
    ConversationCreated,
    KeyRegistered,
    KeyRotated,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Login => "login",
            AuditAction::Logout => "logout",
            AuditAction::AuthenticationFailed => "authentication_failed",
            AuditAction::AccessDenied => "access_denied",
            AuditAction::MessageSent => "message_sent",
            AuditAction::MessagesRead => "messages_read",
            AuditAction::ConversationCreated => "conversation_created",
            AuditAction::KeyRegistered => "key_registered",
            AuditAction::KeyRotated => "key_rotated",
        }
    }
}

/// One security-relevant event. Never carries message content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub actor: Option<Uuid>,
    pub action: AuditAction,
    pub resource: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(actor: Option<Uuid>, action: AuditAction, resource: Option<String>) -> Self {
        Self {
            actor,
            action,
            resource,
            at: Utc::now(),
        }
    }
}

pub trait AuditSink: Send + Sync + 'static {
    fn emit(&self, event: AuditEvent);
}

/// Writes audit events to the `audit` tracing target.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        info!(
            target: "audit",
            action = event.action.as_str(),
            actor = ?event.actor,
            resource = event.resource.as_deref().unwrap_or("-"),
            at = %event.at,
            "audit"
        );
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn actions(&self) -> Vec<AuditAction> {
        self.events().into_iter().map(|e| e.action).collect()
    }
}

impl AuditSink for RecordingAuditSink {
    fn emit(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

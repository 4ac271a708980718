//! Presence and typing fan-out. Holds no state of its own; everything it
//! needs comes from the [`SessionRegistry`].

use tracing::debug;
use uuid::Uuid;

use caremesh_types::events::{PresenceStatus, ServerEvent};

use crate::registry::SessionRegistry;

/// Tell every other authenticated connection, system-wide, that `identity`
/// changed status. Returns the number of connections reached.
pub fn announce(registry: &SessionRegistry, identity: Uuid, status: PresenceStatus) -> usize {
    let event = ServerEvent::UserStatus {
        user_id: identity,
        status,
    };
    let reached = registry.push_to_all_except(identity, &event);
    debug!(%identity, ?status, reached, "Presence broadcast");
    reached
}

/// Relay a typing indicator to the single recipient it names. Nothing is
/// stored; an offline recipient simply gets nothing.
pub async fn typing(
    registry: &SessionRegistry,
    conversation_id: Uuid,
    from: Uuid,
    recipient: Uuid,
    is_typing: bool,
) -> usize {
    let event = ServerEvent::TypingStatus {
        conversation_id,
        user_id: from,
        is_typing,
    };
    registry.push_to_identity(recipient, &event).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use caremesh_db::Database;
    use tokio::sync::mpsc;

    use crate::registry::Outbound;

    fn events(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Outbound::Event(e) = msg {
                out.push(e);
            }
        }
        out
    }

    #[tokio::test]
    async fn status_skips_the_subject_and_unauthenticated() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let db = Database::open_in_memory().unwrap();
        db.create_identity(&a.to_string(), "A", "doctor").unwrap();
        db.create_identity(&b.to_string(), "B", "patient").unwrap();
        let registry = SessionRegistry::new(Arc::new(db), 16);

        let mut a_conn = registry.register();
        let mut b_conn = registry.register();
        let mut anonymous = registry.register();
        registry.admit(b_conn.id, b).await.unwrap();
        registry.admit(a_conn.id, a).await.unwrap();

        assert_eq!(
            events(&mut b_conn.outbound),
            vec![ServerEvent::UserStatus {
                user_id: a,
                status: PresenceStatus::Online
            }]
        );
        // B was announced before A was admitted.
        assert!(events(&mut a_conn.outbound).is_empty());
        assert!(events(&mut anonymous.outbound).is_empty());
    }

    #[tokio::test]
    async fn typing_reaches_only_the_recipient() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let db = Database::open_in_memory().unwrap();
        for id in [a, b, c] {
            db.create_identity(&id.to_string(), "x", "patient").unwrap();
        }
        let registry = SessionRegistry::new(Arc::new(db), 16);
        let mut b_conn = registry.register();
        let mut c_conn = registry.register();
        registry.admit(b_conn.id, b).await.unwrap();
        registry.admit(c_conn.id, c).await.unwrap();
        events(&mut b_conn.outbound);
        events(&mut c_conn.outbound);

        let conversation = Uuid::new_v4();
        assert_eq!(typing(&registry, conversation, a, b, true).await, 1);
        assert_eq!(
            events(&mut b_conn.outbound),
            vec![ServerEvent::TypingStatus {
                conversation_id: conversation,
                user_id: a,
                is_typing: true
            }]
        );
        assert!(events(&mut c_conn.outbound).is_empty());
        assert_eq!(typing(&registry, conversation, a, Uuid::new_v4(), true).await, 0);
    }
}

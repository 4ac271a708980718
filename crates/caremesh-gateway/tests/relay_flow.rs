use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use uuid::Uuid;

use caremesh_crypto::KeyManager;
use caremesh_crypto::storage::MemoryKeyStorage;
use caremesh_db::Database;
use caremesh_gateway::audit::{AuditAction, RecordingAuditSink};
use caremesh_gateway::auth::JwtVerifier;
use caremesh_gateway::connection::{CLOSE_POLICY_VIOLATION, Flow, Session};
use caremesh_gateway::registry::Outbound;
use caremesh_gateway::StoreError;
use caremesh_gateway::store::{KeyUpdate, NewMessage, ReadReceipt, Store, StoreResult};
use caremesh_gateway::{Gateway, GatewayConfig};
use caremesh_types::api::Claims;
use caremesh_types::events::{PresenceStatus, ServerEvent};
use caremesh_types::models::{
    Conversation, ConversationSummary, DeliveryState, EncryptedPayload, Identity, Message, Role,
};

const SECRET: &str = "test-secret";

struct Harness {
    gateway: Gateway,
    db: Arc<Database>,
    audit: Arc<RecordingAuditSink>,
}

impl Harness {
    fn new() -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store: Arc<dyn Store> = db.clone();
        Self::with_store(db, store)
    }

    fn failing() -> (Self, Arc<FailingStore>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = Arc::new(FailingStore::new(db.clone()));
        let dyn_store: Arc<dyn Store> = store.clone();
        (Self::with_store(db, dyn_store), store)
    }

    fn with_store(db: Arc<Database>, store: Arc<dyn Store>) -> Self {
        let audit = Arc::new(RecordingAuditSink::new());
        let gateway = Gateway::new(
            store,
            Arc::new(JwtVerifier::new(SECRET)),
            audit.clone(),
            GatewayConfig::default(),
        );
        Self { gateway, db, audit }
    }

    fn identity(&self, name: &str, role: Role) -> Uuid {
        let id = Uuid::new_v4();
        self.db
            .create_identity(&id.to_string(), name, role.as_str())
            .unwrap();
        id
    }

    fn connect(&self) -> Client {
        let reg = self.gateway.registry().register();
        Client {
            session: Session::new(self.gateway.clone(), reg.id),
            rx: reg.outbound,
        }
    }

    async fn login(&self, identity: Uuid) -> Client {
        let mut client = self.connect();
        let flow = client
            .send(json!({"type": "auth", "token": token(identity)}))
            .await;
        assert_eq!(flow, Flow::Continue);

        let events = client.events();
        assert!(
            matches!(&events[0], ServerEvent::AuthSuccess { user_id, .. } if *user_id == identity),
            "unexpected {events:?}"
        );
        assert!(matches!(&events[1], ServerEvent::OnlineUsers(ids) if ids.contains(&identity)));
        client
    }

    async fn disconnect(&self, client: &Client) {
        self.gateway
            .registry()
            .remove(client.session.connection())
            .await;
    }

    fn stored_message(&self, conversation: Uuid, id: Uuid) -> Message {
        Store::get_messages(self.db.as_ref(), conversation, 200)
            .unwrap()
            .into_iter()
            .find(|m| m.id == id)
            .unwrap()
    }
}

/// Wraps the SQLite store and fails on demand: listing fails with a
/// transient error a set number of times, and message inserts can be
/// switched off entirely.
struct FailingStore {
    db: Arc<Database>,
    list_failures: AtomicU32,
    list_calls: AtomicU32,
    refuse_inserts: AtomicBool,
}

impl FailingStore {
    fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            list_failures: AtomicU32::new(0),
            list_calls: AtomicU32::new(0),
            refuse_inserts: AtomicBool::new(false),
        }
    }

    fn fail_listing(&self, times: u32) {
        self.list_failures.store(times, Ordering::SeqCst);
        self.list_calls.store(0, Ordering::SeqCst);
    }

    fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn refuse_inserts(&self, refuse: bool) {
        self.refuse_inserts.store(refuse, Ordering::SeqCst);
    }
}

impl Store for FailingStore {
    fn get_identity(&self, id: Uuid) -> StoreResult<Option<Identity>> {
        Store::get_identity(self.db.as_ref(), id)
    }

    fn set_presence(&self, id: Uuid, online: bool) -> StoreResult<()> {
        Store::set_presence(self.db.as_ref(), id, online)
    }

    fn set_public_key(&self, id: Uuid, public_key: &str) -> StoreResult<KeyUpdate> {
        Store::set_public_key(self.db.as_ref(), id, public_key)
    }

    fn list_conversations(&self, identity: Uuid) -> StoreResult<Vec<ConversationSummary>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.list_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.list_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("database is locked".into()));
        }
        Store::list_conversations(self.db.as_ref(), identity)
    }

    fn conversation_summary(
        &self,
        conversation: Uuid,
        viewer: Uuid,
    ) -> StoreResult<Option<ConversationSummary>> {
        Store::conversation_summary(self.db.as_ref(), conversation, viewer)
    }

    fn get_conversation(&self, id: Uuid) -> StoreResult<Option<Conversation>> {
        Store::get_conversation(self.db.as_ref(), id)
    }

    fn is_member(&self, conversation: Uuid, identity: Uuid) -> StoreResult<bool> {
        Store::is_member(self.db.as_ref(), conversation, identity)
    }

    fn get_messages(&self, conversation: Uuid, limit: u32) -> StoreResult<Vec<Message>> {
        Store::get_messages(self.db.as_ref(), conversation, limit)
    }

    fn insert_message(&self, message: &NewMessage) -> StoreResult<Message> {
        if self.refuse_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk I/O error".into()));
        }
        Store::insert_message(self.db.as_ref(), message)
    }

    fn mark_delivered(&self, message: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        Store::mark_delivered(self.db.as_ref(), message, at)
    }

    fn mark_read(
        &self,
        conversation: Uuid,
        reader: Uuid,
        message_ids: &[Uuid],
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<ReadReceipt>> {
        Store::mark_read(self.db.as_ref(), conversation, reader, message_ids, at)
    }

    fn find_or_create_direct(
        &self,
        creator: Uuid,
        recipient: Uuid,
    ) -> StoreResult<(Conversation, bool)> {
        Store::find_or_create_direct(self.db.as_ref(), creator, recipient)
    }
}

struct Client {
    session: Session,
    rx: mpsc::Receiver<Outbound>,
}

impl Client {
    async fn send(&mut self, envelope: Value) -> Flow {
        self.session.handle_text(&envelope.to_string()).await
    }

    fn outbound(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn events(&mut self) -> Vec<ServerEvent> {
        self.outbound()
            .into_iter()
            .filter_map(|o| match o {
                Outbound::Event(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    async fn create_conversation(&mut self, recipient: Uuid) -> Uuid {
        self.send(json!({"type": "create-conversation", "data": {"recipientId": recipient}}))
            .await;
        self.events()
            .into_iter()
            .find_map(|e| match e {
                ServerEvent::ConversationCreated(summary) => Some(summary.id),
                _ => None,
            })
            .unwrap()
    }

    async fn send_payload(&mut self, conversation: Uuid, payload: &EncryptedPayload, temp: &str) {
        self.send(json!({
            "type": "send-message",
            "data": {
                "conversationId": conversation,
                "encryptedContent": payload,
                "tempId": temp
            }
        }))
        .await;
    }
}

fn token(identity: Uuid) -> String {
    let claims = Claims {
        sub: identity,
        role: Role::Patient,
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn opaque_payload() -> EncryptedPayload {
    EncryptedPayload::from_bytes(&[42u8; 32], &[7u8; 32], &[9u8; 12])
}

fn error_codes(events: &[ServerEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::Error { code, .. } => Some(code.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn end_to_end_encrypted_exchange() {
    let h = Harness::new();
    let alice = h.identity("Dr. Alice", Role::Doctor);
    let bob = h.identity("Bob", Role::Patient);

    let alice_keys = KeyManager::new(MemoryKeyStorage::new());
    let bob_keys = KeyManager::new(MemoryKeyStorage::new());
    let alice_public = alice_keys.initialize_keys().unwrap().public_key_base64();
    let bob_public = bob_keys.initialize_keys().unwrap().public_key_base64();
    Store::set_public_key(h.db.as_ref(), alice, &alice_public).unwrap();
    Store::set_public_key(h.db.as_ref(), bob, &bob_public).unwrap();

    let mut a = h.login(alice).await;
    let mut b = h.login(bob).await;
    a.events();

    // Alice learns Bob's published key from the conversation summary.
    a.send(json!({"type": "create-conversation", "data": {"recipientId": bob}}))
        .await;
    let summary = a
        .events()
        .into_iter()
        .find_map(|e| match e {
            ServerEvent::ConversationCreated(s) => Some(s),
            _ => None,
        })
        .unwrap();
    let published = summary
        .participants
        .iter()
        .find(|p| p.id == bob)
        .and_then(|p| p.public_key.clone())
        .unwrap();
    assert!(
        b.events()
            .iter()
            .any(|e| matches!(e, ServerEvent::ConversationCreated(s) if s.id == summary.id))
    );

    let payload = alice_keys.encrypt(b"hello", &published).unwrap();
    a.send_payload(summary.id, &payload, "tmp-1").await;

    let ack = a.events();
    let sent = ack
        .iter()
        .find_map(|e| match e {
            ServerEvent::MessageSent {
                client_correlation_id,
                message,
            } => Some((client_correlation_id.clone(), message.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(sent.0.as_deref(), Some("tmp-1"));
    assert_eq!(sent.1.state(), DeliveryState::Sent);

    let delivered = b
        .events()
        .into_iter()
        .find_map(|e| match e {
            ServerEvent::NewMessage(m) => Some(m),
            _ => None,
        })
        .unwrap();
    assert_eq!(delivered.id, sent.1.id);
    assert_eq!(bob_keys.decrypt_text(&delivered.encrypted_content).unwrap(), "hello");
    assert!(alice_keys.decrypt(&delivered.encrypted_content).is_err());
    assert_eq!(
        h.stored_message(summary.id, delivered.id).state(),
        DeliveryState::Delivered
    );

    b.send(json!({
        "type": "mark-as-read",
        "data": {"conversationId": summary.id, "messageIds": [delivered.id]}
    }))
    .await;
    let receipts: Vec<ServerEvent> = a
        .events()
        .into_iter()
        .filter(|e| matches!(e, ServerEvent::MessagesRead { .. }))
        .collect();
    assert_eq!(receipts.len(), 1);
    match &receipts[0] {
        ServerEvent::MessagesRead {
            conversation_id,
            message_ids,
            read_by,
            ..
        } => {
            assert_eq!(*conversation_id, summary.id);
            assert_eq!(message_ids, &vec![delivered.id]);
            assert_eq!(*read_by, bob);
        }
        _ => unreachable!(),
    }
    // The reader is not told about its own read.
    assert!(
        !b.events()
            .iter()
            .any(|e| matches!(e, ServerEvent::MessagesRead { .. }))
    );

    let actions = h.audit.actions();
    assert!(actions.contains(&AuditAction::MessageSent));
    assert!(actions.contains(&AuditAction::MessagesRead));
    assert!(actions.contains(&AuditAction::ConversationCreated));
}

#[tokio::test]
async fn presence_survives_until_last_device_closes() {
    let h = Harness::new();
    let watcher = h.identity("Ops", Role::Ops);
    let carol = h.identity("Carol", Role::Patient);
    let mut w = h.login(watcher).await;

    let phone = h.login(carol).await;
    let laptop = h.login(carol).await;
    let online: Vec<ServerEvent> = w.events();
    assert_eq!(
        online,
        vec![ServerEvent::UserStatus {
            user_id: carol,
            status: PresenceStatus::Online
        }]
    );

    h.disconnect(&phone).await;
    assert!(h.gateway.registry().is_online(carol).await);
    assert!(w.events().is_empty());
    assert!(Store::get_identity(h.db.as_ref(), carol).unwrap().unwrap().online);

    h.disconnect(&laptop).await;
    assert!(!h.gateway.registry().is_online(carol).await);
    assert_eq!(
        w.events(),
        vec![ServerEvent::UserStatus {
            user_id: carol,
            status: PresenceStatus::Offline
        }]
    );
    assert!(!Store::get_identity(h.db.as_ref(), carol).unwrap().unwrap().online);
}

#[tokio::test]
async fn outsiders_cannot_read_or_write() {
    let h = Harness::new();
    let alice = h.identity("Alice", Role::Doctor);
    let bob = h.identity("Bob", Role::Patient);
    let mallory = h.identity("Mallory", Role::Patient);

    let mut a = h.login(alice).await;
    let conversation = a.create_conversation(bob).await;
    a.send_payload(conversation, &opaque_payload(), "a-1").await;

    let mut m = h.login(mallory).await;
    m.send(json!({"type": "get-messages", "data": {"conversationId": conversation}}))
        .await;
    let events = m.events();
    assert_eq!(error_codes(&events), vec!["NOT_A_MEMBER"]);
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, ServerEvent::MessagesHistory { .. }))
    );

    m.send_payload(conversation, &opaque_payload(), "m-1").await;
    let events = m.events();
    assert!(matches!(
        &events[..],
        [ServerEvent::Error { code, client_correlation_id, .. }]
            if code == "NOT_A_MEMBER" && client_correlation_id.as_deref() == Some("m-1")
    ));
    assert_eq!(
        Store::get_messages(h.db.as_ref(), conversation, 50).unwrap().len(),
        1
    );
    assert!(h.audit.actions().contains(&AuditAction::AccessDenied));
}

#[tokio::test]
async fn conversation_creation_is_idempotent() {
    let h = Harness::new();
    let alice = h.identity("Alice", Role::Doctor);
    let bob = h.identity("Bob", Role::Patient);
    let mut a = h.login(alice).await;
    let mut b = h.login(bob).await;

    let first = a.create_conversation(bob).await;
    b.events();
    let second = a.create_conversation(bob).await;
    assert_eq!(first, second);
    // Only a new conversation is announced to the recipient.
    assert!(
        !b.events()
            .iter()
            .any(|e| matches!(e, ServerEvent::ConversationCreated(_)))
    );

    // Reverse direction resolves to the same conversation.
    let third = b.create_conversation(alice).await;
    assert_eq!(first, third);
    assert_eq!(Store::list_conversations(h.db.as_ref(), alice).unwrap().len(), 1);

    a.send(json!({"type": "create-conversation", "data": {"recipientId": alice}}))
        .await;
    assert_eq!(error_codes(&a.events()), vec!["INVALID_REQUEST"]);
    a.send(json!({"type": "create-conversation", "data": {"recipientId": Uuid::new_v4()}}))
        .await;
    assert_eq!(error_codes(&a.events()), vec!["UNKNOWN_IDENTITY"]);
}

#[tokio::test]
async fn offline_recipient_goes_straight_from_sent_to_read() {
    let h = Harness::new();
    let alice = h.identity("Alice", Role::Doctor);
    let bob = h.identity("Bob", Role::Patient);

    let mut a = h.login(alice).await;
    let conversation = a.create_conversation(bob).await;
    a.send_payload(conversation, &opaque_payload(), "t").await;
    let message_id = a
        .events()
        .into_iter()
        .find_map(|e| match e {
            ServerEvent::MessageSent { message, .. } => Some(message.id),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        h.stored_message(conversation, message_id).state(),
        DeliveryState::Sent
    );

    let mut b = h.login(bob).await;
    b.send(json!({"type": "get-conversations"})).await;
    let listed = b
        .events()
        .into_iter()
        .find_map(|e| match e {
            ServerEvent::ConversationsList(list) => Some(list),
            _ => None,
        })
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].unread_count, 1);

    b.send(json!({
        "type": "mark-as-read",
        "data": {"conversationId": conversation, "messageIds": [message_id]}
    }))
    .await;

    let stored = h.stored_message(conversation, message_id);
    assert_eq!(stored.state(), DeliveryState::Read);
    assert!(!stored.delivered);
    assert_eq!(stored.read_by, vec![bob]);

    // Marking again changes nothing and notifies nobody.
    a.events();
    b.send(json!({
        "type": "mark-as-read",
        "data": {"conversationId": conversation, "messageIds": [message_id]}
    }))
    .await;
    assert!(a.events().is_empty());

    let conversation_row = Store::get_conversation(h.db.as_ref(), conversation)
        .unwrap()
        .unwrap();
    assert_eq!(conversation_row.unread_counts.get(&bob), Some(&0));
    assert_eq!(conversation_row.last_read.get(&bob), Some(&message_id));
    assert_eq!(conversation_row.last_message_id, Some(message_id));
}

#[tokio::test]
async fn history_is_bounded_and_ordered() {
    let h = Harness::new();
    let alice = h.identity("Alice", Role::Doctor);
    let bob = h.identity("Bob", Role::Patient);
    let mut a = h.login(alice).await;
    let conversation = a.create_conversation(bob).await;

    let mut sent = Vec::new();
    for i in 0..5 {
        a.send_payload(conversation, &opaque_payload(), &format!("t{i}")).await;
        for e in a.events() {
            if let ServerEvent::MessageSent { message, .. } = e {
                sent.push(message.id);
            }
        }
    }

    a.send(json!({"type": "get-messages", "data": {"conversationId": conversation, "limit": 2}}))
        .await;
    let history = a
        .events()
        .into_iter()
        .find_map(|e| match e {
            ServerEvent::MessagesHistory { messages, .. } => Some(messages),
            _ => None,
        })
        .unwrap();
    let ids: Vec<Uuid> = history.iter().map(|m| m.id).collect();
    assert_eq!(ids, sent[3..].to_vec());
}

#[tokio::test]
async fn envelopes_before_auth_are_rejected_without_closing() {
    let h = Harness::new();
    let alice = h.identity("Alice", Role::Doctor);
    let mut client = h.connect();

    let flow = client.send(json!({"type": "get-conversations"})).await;
    assert_eq!(flow, Flow::Continue);
    assert_eq!(error_codes(&client.events()), vec!["NOT_AUTHENTICATED"]);

    client
        .send(json!({"type": "auth", "token": token(alice)}))
        .await;
    assert!(matches!(client.events()[0], ServerEvent::AuthSuccess { .. }));

    client
        .send(json!({"type": "auth", "token": token(alice)}))
        .await;
    assert_eq!(error_codes(&client.events()), vec!["ALREADY_BOUND"]);
}

#[tokio::test]
async fn failed_auth_sends_error_then_closes() {
    let h = Harness::new();
    let mut client = h.connect();

    let flow = client
        .send(json!({"type": "auth", "token": "forged"}))
        .await;
    assert_eq!(flow, Flow::Close);

    let out = client.outbound();
    assert!(matches!(&out[0], Outbound::Event(ServerEvent::AuthError { .. })));
    assert!(matches!(&out[1], Outbound::Close { code, .. } if *code == CLOSE_POLICY_VIOLATION));
    assert_eq!(h.audit.actions(), vec![AuditAction::AuthenticationFailed]);

    // A valid credential for an identity that does not exist fails the same way.
    let mut ghost = h.connect();
    let flow = ghost
        .send(json!({"type": "auth", "token": token(Uuid::new_v4())}))
        .await;
    assert_eq!(flow, Flow::Close);
}

#[tokio::test]
async fn malformed_input_keeps_the_connection_open() {
    let h = Harness::new();
    let alice = h.identity("Alice", Role::Doctor);
    let bob = h.identity("Bob", Role::Patient);
    let mut a = h.login(alice).await;
    let conversation = a.create_conversation(bob).await;

    assert_eq!(a.session.handle_text("{not json").await, Flow::Continue);
    a.send(json!({"type": "launch-missiles", "data": {}})).await;
    a.send(json!({"data": {}})).await;
    assert_eq!(
        error_codes(&a.events()),
        vec!["MALFORMED_ENVELOPE", "MALFORMED_ENVELOPE", "MALFORMED_ENVELOPE"]
    );

    // Structurally invalid payload: 5-byte nonce.
    let bad = EncryptedPayload::from_bytes(&[1u8; 32], &[2u8; 32], &[3u8; 5]);
    a.send_payload(conversation, &bad, "bad-1").await;
    let events = a.events();
    assert!(matches!(
        &events[..],
        [ServerEvent::Error { code, client_correlation_id, .. }]
            if code == "MALFORMED_ENVELOPE" && client_correlation_id.as_deref() == Some("bad-1")
    ));
    assert!(
        Store::get_messages(h.db.as_ref(), conversation, 50)
            .unwrap()
            .is_empty()
    );

    a.send(json!({"type": "ping"})).await;
    assert_eq!(a.events(), vec![ServerEvent::Pong]);
}

#[tokio::test]
async fn typing_is_scoped_to_members() {
    let h = Harness::new();
    let alice = h.identity("Alice", Role::Doctor);
    let bob = h.identity("Bob", Role::Patient);
    let eve = h.identity("Eve", Role::Patient);
    let mut a = h.login(alice).await;
    let mut b = h.login(bob).await;
    let mut e = h.login(eve).await;
    let conversation = a.create_conversation(bob).await;
    b.events();
    e.events();

    a.send(json!({"type": "typing", "data": {
        "conversationId": conversation, "recipientId": bob, "isTyping": true
    }}))
    .await;
    assert_eq!(
        b.events(),
        vec![ServerEvent::TypingStatus {
            conversation_id: conversation,
            user_id: alice,
            is_typing: true
        }]
    );

    let denied = |h: &Harness| {
        h.audit
            .actions()
            .into_iter()
            .filter(|action| *action == AuditAction::AccessDenied)
            .count()
    };
    let before = denied(&h);

    // Eve is not a member, so neither direction goes anywhere.
    e.send(json!({"type": "typing", "data": {
        "conversationId": conversation, "recipientId": bob, "isTyping": true
    }}))
    .await;
    assert_eq!(denied(&h), before + 1);

    a.send(json!({"type": "typing", "data": {
        "conversationId": conversation, "recipientId": eve, "isTyping": true
    }}))
    .await;
    assert_eq!(denied(&h), before + 1);

    assert!(b.events().is_empty());
    assert!(e.events().is_empty());
    assert!(a.events().is_empty());
}

#[tokio::test]
async fn transient_read_failures_are_retried_up_to_the_limit() {
    let (h, store) = Harness::failing();
    let alice = h.identity("Alice", Role::Doctor);
    let bob = h.identity("Bob", Role::Patient);
    let mut a = h.login(alice).await;
    a.create_conversation(bob).await;

    let attempts = h.gateway.config().read_retry_attempts;
    store.fail_listing(attempts);
    a.send(json!({"type": "get-conversations"})).await;
    let events = a.events();
    assert!(
        matches!(&events[..], [ServerEvent::ConversationsList(list)] if list.len() == 1),
        "unexpected {events:?}"
    );
    assert_eq!(store.list_calls(), attempts + 1);

    store.fail_listing(attempts + 1);
    a.send(json!({"type": "get-conversations"})).await;
    assert_eq!(error_codes(&a.events()), vec!["PERSISTENCE_UNAVAILABLE"]);
    assert_eq!(store.list_calls(), attempts + 1);
}

#[tokio::test]
async fn failed_send_is_reported_and_leaves_the_conversation_untouched() {
    let (h, store) = Harness::failing();
    let alice = h.identity("Alice", Role::Doctor);
    let bob = h.identity("Bob", Role::Patient);
    let mut a = h.login(alice).await;
    let mut b = h.login(bob).await;
    let conversation = a.create_conversation(bob).await;

    a.send_payload(conversation, &opaque_payload(), "tmp-ok").await;
    let first = a
        .events()
        .into_iter()
        .find_map(|e| match e {
            ServerEvent::MessageSent { message, .. } => Some(message),
            _ => None,
        })
        .unwrap();
    b.events();

    store.refuse_inserts(true);
    a.send_payload(conversation, &opaque_payload(), "tmp-lost").await;

    let events = a.events();
    assert_eq!(events.len(), 1, "unexpected {events:?}");
    match &events[0] {
        ServerEvent::Error {
            code,
            client_correlation_id,
            ..
        } => {
            assert_eq!(code, "PERSISTENCE_UNAVAILABLE");
            assert_eq!(client_correlation_id.as_deref(), Some("tmp-lost"));
        }
        other => panic!("expected an error, got {other:?}"),
    }
    assert!(b.events().is_empty());

    let summary = Store::conversation_summary(h.db.as_ref(), conversation, alice)
        .unwrap()
        .unwrap();
    assert_eq!(summary.last_message.map(|m| m.id), Some(first.id));
    assert_eq!(
        Store::get_messages(h.db.as_ref(), conversation, 200).unwrap().len(),
        1
    );
}

#[tokio::test]
async fn sweep_evicts_silent_sessions_and_announces_offline() {
    let h = Harness::new();
    let watcher = h.identity("Ops", Role::Ops);
    let dave = h.identity("Dave", Role::Patient);
    let mut w = h.login(watcher).await;
    let _d = h.login(dave).await;
    w.events();

    let registry = h.gateway.registry();
    assert!(registry.sweep_dead(std::time::Duration::ZERO).await.is_empty());
    assert!(w.outbound().contains(&Outbound::Ping));

    // The watcher answers its probe; Dave stays silent.
    w.send(json!({"type": "ping"})).await;
    w.outbound();
    let evicted = registry.sweep_dead(std::time::Duration::ZERO).await;
    assert_eq!(evicted.len(), 1);
    assert!(!registry.is_online(dave).await);
    assert!(registry.is_online(watcher).await);
    assert!(w.events().contains(&ServerEvent::UserStatus {
        user_id: dave,
        status: PresenceStatus::Offline
    }));
}

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use caremesh_db::Database;
use caremesh_db::models::{ConversationRow, IdentityRow, MemberRow, MessageRow};
use caremesh_db::timestamp;
use caremesh_types::models::{
    Conversation, ConversationSummary, EncryptedPayload, Identity, Message, ParticipantSummary,
    PayloadBytes, Role,
};

use crate::error::StoreError;

pub use caremesh_db::models::KeyUpdate;

pub type StoreResult<T> = Result<T, StoreError>;

/// A message about to be persisted. The payload has already passed the
/// structural check.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub payload: PayloadBytes,
    pub message_type: String,
    pub created_at: DateTime<Utc>,
}

/// A message that flipped to read, and who sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadReceipt {
    pub message_id: Uuid,
    pub sender_id: Uuid,
}

/// Durable state behind the relay. Calls block; async callers go through
/// [`blocking`] or [`read_with_retry`].
pub trait Store: Send + Sync + 'static {
    fn get_identity(&self, id: Uuid) -> StoreResult<Option<Identity>>;

    fn set_presence(&self, id: Uuid, online: bool) -> StoreResult<()>;

    fn set_public_key(&self, id: Uuid, public_key: &str) -> StoreResult<KeyUpdate>;

    /// Active conversations of `identity`, most recently updated first.
    fn list_conversations(&self, identity: Uuid) -> StoreResult<Vec<ConversationSummary>>;

    /// One conversation as `viewer` would see it in a listing.
    fn conversation_summary(
        &self,
        conversation: Uuid,
        viewer: Uuid,
    ) -> StoreResult<Option<ConversationSummary>>;

    fn get_conversation(&self, id: Uuid) -> StoreResult<Option<Conversation>>;

    /// Membership of an active conversation.
    fn is_member(&self, conversation: Uuid, identity: Uuid) -> StoreResult<bool>;

    /// Newest `limit` messages, oldest first.
    fn get_messages(&self, conversation: Uuid, limit: u32) -> StoreResult<Vec<Message>>;

    /// All-or-nothing: the message, the last-message pointer and the unread
    /// counters are written together or not at all.
    fn insert_message(&self, message: &NewMessage) -> StoreResult<Message>;

    fn mark_delivered(&self, message: Uuid, at: DateTime<Utc>) -> StoreResult<bool>;

    fn mark_read(
        &self,
        conversation: Uuid,
        reader: Uuid,
        message_ids: &[Uuid],
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<ReadReceipt>>;

    /// Returns the conversation and whether it was created by this call.
    fn find_or_create_direct(
        &self,
        creator: Uuid,
        recipient: Uuid,
    ) -> StoreResult<(Conversation, bool)>;
}

/// Run a store call on the blocking pool.
pub async fn blocking<T, F>(store: &Arc<dyn Store>, f: F) -> StoreResult<T>
where
    F: FnOnce(&dyn Store) -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StoreError::Failed(format!("store task failed: {e}")))?
}

/// Like [`blocking`], retrying transient failures with a linear backoff.
/// Only for reads; writes are never retried.
pub async fn read_with_retry<T, F>(store: &Arc<dyn Store>, retries: u32, f: F) -> StoreResult<T>
where
    F: Fn(&dyn Store) -> StoreResult<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    let f = Arc::new(f);
    let mut attempt: u32 = 0;
    loop {
        let call = f.clone();
        match blocking(store, move |s| call(s)).await {
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                warn!("Store read failed (attempt {}), retrying: {}", attempt, e);
                tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
            }
            result => return result,
        }
    }
}

/// Sort an `anyhow` error from `caremesh-db` into transient or permanent.
pub fn classify(err: anyhow::Error) -> StoreError {
    if let Some(rusqlite::Error::SqliteFailure(e, _)) = err.downcast_ref::<rusqlite::Error>() {
        if matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ) {
            return StoreError::Unavailable(err.to_string());
        }
    }
    let message = err.to_string();
    if message.contains("lock poisoned") {
        return StoreError::Unavailable(message);
    }
    StoreError::Failed(message)
}

impl Store for Database {
    fn get_identity(&self, id: Uuid) -> StoreResult<Option<Identity>> {
        Database::get_identity(self, &id.to_string())
            .map_err(classify)?
            .map(identity_from_row)
            .transpose()
    }

    fn set_presence(&self, id: Uuid, online: bool) -> StoreResult<()> {
        self.set_online(&id.to_string(), online).map_err(classify)?;
        Ok(())
    }

    fn set_public_key(&self, id: Uuid, public_key: &str) -> StoreResult<KeyUpdate> {
        Database::set_public_key(self, &id.to_string(), public_key).map_err(classify)
    }

    fn list_conversations(&self, identity: Uuid) -> StoreResult<Vec<ConversationSummary>> {
        let rows = Database::list_conversations(self, &identity.to_string()).map_err(classify)?;
        summarize(self, rows, identity)
    }

    fn conversation_summary(
        &self,
        conversation: Uuid,
        viewer: Uuid,
    ) -> StoreResult<Option<ConversationSummary>> {
        let Some(row) = Database::get_conversation(self, &conversation.to_string()).map_err(classify)?
        else {
            return Ok(None);
        };
        Ok(summarize(self, vec![row], viewer)?.pop())
    }

    fn get_conversation(&self, id: Uuid) -> StoreResult<Option<Conversation>> {
        let Some(row) = Database::get_conversation(self, &id.to_string()).map_err(classify)? else {
            return Ok(None);
        };
        let members = self.conversation_members(&row.id).map_err(classify)?;
        conversation_from_rows(row, &members).map(Some)
    }

    fn is_member(&self, conversation: Uuid, identity: Uuid) -> StoreResult<bool> {
        Database::is_member(self, &conversation.to_string(), &identity.to_string())
            .map_err(classify)
    }

    fn get_messages(&self, conversation: Uuid, limit: u32) -> StoreResult<Vec<Message>> {
        Database::get_messages(self, &conversation.to_string(), limit)
            .map_err(classify)?
            .into_iter()
            .map(message_from_row)
            .collect()
    }

    fn insert_message(&self, message: &NewMessage) -> StoreResult<Message> {
        let id = message.id.to_string();
        let conversation_id = message.conversation_id.to_string();
        let sender_id = message.sender_id.to_string();
        let created_at = timestamp(message.created_at);

        let row = Database::insert_message(
            self,
            &caremesh_db::models::NewMessage {
                id: &id,
                conversation_id: &conversation_id,
                sender_id: &sender_id,
                ciphertext: &message.payload.ciphertext,
                ephemeral_public_key: &message.payload.ephemeral_public_key,
                nonce: &message.payload.nonce,
                message_type: &message.message_type,
                created_at: &created_at,
            },
        )
        .map_err(classify)?;
        message_from_row(row)
    }

    fn mark_delivered(&self, message: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        Database::mark_delivered(self, &message.to_string(), &timestamp(at)).map_err(classify)
    }

    fn mark_read(
        &self,
        conversation: Uuid,
        reader: Uuid,
        message_ids: &[Uuid],
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<ReadReceipt>> {
        let ids: Vec<String> = message_ids.iter().map(Uuid::to_string).collect();
        Database::mark_read(
            self,
            &conversation.to_string(),
            &reader.to_string(),
            &ids,
            &timestamp(at),
        )
        .map_err(classify)?
        .into_iter()
        .map(|r| -> StoreResult<ReadReceipt> {
            Ok(ReadReceipt {
                message_id: parse_uuid(&r.message_id)?,
                sender_id: parse_uuid(&r.sender_id)?,
            })
        })
        .collect()
    }

    fn find_or_create_direct(
        &self,
        creator: Uuid,
        recipient: Uuid,
    ) -> StoreResult<(Conversation, bool)> {
        let (row, created) = Database::find_or_create_direct(
            self,
            &Uuid::new_v4().to_string(),
            &creator.to_string(),
            &recipient.to_string(),
            &timestamp(Utc::now()),
        )
        .map_err(classify)?;
        let members = self.conversation_members(&row.id).map_err(classify)?;
        Ok((conversation_from_rows(row, &members)?, created))
    }
}

// Build listing entries for `viewer`, fetching every participant once.
fn summarize(
    db: &Database,
    rows: Vec<ConversationRow>,
    viewer: Uuid,
) -> StoreResult<Vec<ConversationSummary>> {
    let viewer_key = viewer.to_string();
    let mut members_by_conversation = Vec::with_capacity(rows.len());
    let mut participant_ids = HashSet::new();
    for row in &rows {
        let members = db.conversation_members(&row.id).map_err(classify)?;
        participant_ids.extend(members.iter().map(|m| m.user_id.clone()));
        members_by_conversation.push(members);
    }

    let ids: Vec<String> = participant_ids.into_iter().collect();
    let identities: HashMap<String, IdentityRow> = db
        .get_identities(&ids)
        .map_err(classify)?
        .into_iter()
        .map(|i| (i.id.clone(), i))
        .collect();

    rows.into_iter()
        .zip(members_by_conversation)
        .map(|(row, members)| -> StoreResult<ConversationSummary> {
            let participants = members
                .iter()
                .filter_map(|m| identities.get(&m.user_id))
                .map(participant_from_row)
                .collect::<StoreResult<Vec<_>>>()?;

            let unread_count = members
                .iter()
                .find(|m| m.user_id == viewer_key)
                .map_or(0, |m| m.unread_count);

            let last_message = match &row.last_message_id {
                Some(id) => db
                    .get_message(id)
                    .map_err(classify)?
                    .map(message_from_row)
                    .transpose()?,
                None => None,
            };

            Ok(ConversationSummary {
                id: parse_uuid(&row.id)?,
                participants,
                last_message,
                unread_count,
                updated_at: parse_time(&row.updated_at)?,
            })
        })
        .collect()
}

fn conversation_from_rows(row: ConversationRow, members: &[MemberRow]) -> StoreResult<Conversation> {
    let mut participants = Vec::with_capacity(members.len());
    let mut unread_counts = HashMap::new();
    let mut last_read = HashMap::new();
    for member in members {
        let user = parse_uuid(&member.user_id)?;
        participants.push(user);
        unread_counts.insert(user, member.unread_count);
        if let Some(message) = &member.last_read_message_id {
            last_read.insert(user, parse_uuid(message)?);
        }
    }

    Ok(Conversation {
        id: parse_uuid(&row.id)?,
        participants,
        creator_id: parse_uuid(&row.creator_id)?,
        is_group: row.is_group,
        last_message_id: row.last_message_id.as_deref().map(parse_uuid).transpose()?,
        unread_counts,
        last_read,
        is_active: row.is_active,
        created_at: parse_time(&row.created_at)?,
        updated_at: parse_time(&row.updated_at)?,
    })
}

fn identity_from_row(row: IdentityRow) -> StoreResult<Identity> {
    Ok(Identity {
        id: parse_uuid(&row.id)?,
        role: parse_role(&row.role)?,
        display_name: row.display_name,
        public_key: row.public_key,
        online: row.online,
    })
}

fn participant_from_row(row: &IdentityRow) -> StoreResult<ParticipantSummary> {
    Ok(ParticipantSummary {
        id: parse_uuid(&row.id)?,
        display_name: row.display_name.clone(),
        role: parse_role(&row.role)?,
        public_key: row.public_key.clone(),
        online: row.online,
    })
}

fn message_from_row(row: MessageRow) -> StoreResult<Message> {
    Ok(Message {
        id: parse_uuid(&row.id)?,
        conversation_id: parse_uuid(&row.conversation_id)?,
        sender_id: parse_uuid(&row.sender_id)?,
        encrypted_content: EncryptedPayload::from_bytes(
            &row.ciphertext,
            &row.ephemeral_public_key,
            &row.nonce,
        ),
        message_type: row.message_type,
        delivered: row.delivered,
        read: row.read,
        delivered_at: row.delivered_at.as_deref().map(parse_time).transpose()?,
        read_at: row.read_at.as_deref().map(parse_time).transpose()?,
        read_by: row
            .read_by
            .iter()
            .map(|id| parse_uuid(id))
            .collect::<StoreResult<Vec<_>>>()?,
        created_at: parse_time(&row.created_at)?,
    })
}

fn parse_uuid(s: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::Failed(format!("corrupt id {s:?}: {e}")))
}

fn parse_time(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Failed(format!("corrupt timestamp {s:?}: {e}")))
}

fn parse_role(s: &str) -> StoreResult<Role> {
    s.parse().map_err(StoreError::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use caremesh_types::models::{NONCE_LEN, PUBLIC_KEY_LEN};

    fn seeded() -> (Database, Uuid, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let doctor = Uuid::new_v4();
        let patient = Uuid::new_v4();
        db.create_identity(&doctor.to_string(), "Dr. Ada", "doctor").unwrap();
        db.create_identity(&patient.to_string(), "Pat Smith", "patient").unwrap();
        (db, doctor, patient)
    }

    #[test]
    fn busy_database_is_retryable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(classify(anyhow::Error::from(busy)).is_retryable());

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(!classify(anyhow::Error::from(constraint)).is_retryable());
        assert!(!classify(anyhow::anyhow!("other")).is_retryable());
    }

    #[test]
    fn summary_reports_unread_for_the_viewer() {
        let (db, doctor, patient) = seeded();
        let (conversation, created) = Store::find_or_create_direct(&db, doctor, patient).unwrap();
        assert!(created);
        assert_eq!(conversation.participants.len(), 2);

        let message = NewMessage {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            sender_id: doctor,
            payload: PayloadBytes {
                ciphertext: vec![3u8; 24],
                ephemeral_public_key: [4u8; PUBLIC_KEY_LEN],
                nonce: [5u8; NONCE_LEN],
            },
            message_type: "text".into(),
            created_at: Utc::now(),
        };
        let stored = Store::insert_message(&db, &message).unwrap();
        assert_eq!(stored.encrypted_content.decode().unwrap(), message.payload);

        let for_patient = Store::list_conversations(&db, patient).unwrap();
        assert_eq!(for_patient.len(), 1);
        assert_eq!(for_patient[0].unread_count, 1);
        assert_eq!(for_patient[0].last_message.as_ref().map(|m| m.id), Some(message.id));
        assert_eq!(for_patient[0].participants.len(), 2);

        let for_doctor = Store::conversation_summary(&db, conversation.id, doctor)
            .unwrap()
            .unwrap();
        assert_eq!(for_doctor.unread_count, 0);
    }

    #[test]
    fn unknown_identity_is_none() {
        let (db, _, _) = seeded();
        assert!(Store::get_identity(&db, Uuid::new_v4()).unwrap().is_none());
    }

    #[tokio::test]
    async fn blocking_runs_against_the_store() {
        let (db, doctor, _) = seeded();
        let store: Arc<dyn Store> = Arc::new(db);
        let identity = read_with_retry(&store, 3, move |s| s.get_identity(doctor))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(identity.role, Role::Doctor);
    }
}

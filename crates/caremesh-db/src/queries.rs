use crate::Database;
use crate::models::{
    ConversationRow, IdentityRow, KeyUpdate, MemberRow, MessageRow, NewMessage, ReadReceiptRow,
};
use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, params};

const CONVERSATION_COLUMNS: &str =
    "c.id, c.creator_id, c.is_group, c.last_message_id, c.is_active, c.created_at, c.updated_at";

// read_by is folded in with a correlated subquery so one statement returns
// complete rows.
const MESSAGE_COLUMNS: &str = "m.id, m.conversation_id, m.sender_id, m.ciphertext, \
     m.ephemeral_public_key, m.nonce, m.message_type, m.is_delivered, m.delivered_at, \
     m.is_read, m.read_at, m.created_at, \
     (SELECT GROUP_CONCAT(r.user_id) FROM message_reads r WHERE r.message_id = m.id)";

/// Canonical key for a two-party conversation; the same for both orderings.
pub fn direct_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

impl Database {
    // -- Identities --

    pub fn create_identity(&self, id: &str, display_name: &str, role: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO identities (id, display_name, role) VALUES (?1, ?2, ?3)",
                (id, display_name, role),
            )?;
            Ok(())
        })
    }

    pub fn get_identity(&self, id: &str) -> Result<Option<IdentityRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, display_name, role, public_key, online FROM identities WHERE id = ?1",
                [id],
                map_identity,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Batch-fetch identities for a set of ids.
    pub fn get_identities(&self, ids: &[String]) -> Result<Vec<IdentityRow>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT id, display_name, role, public_key, online FROM identities WHERE id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(ids.iter()), map_identity)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Durable presence flag. Returns false if the identity does not exist.
    pub fn set_online(&self, id: &str, online: bool) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE identities SET online = ?2 WHERE id = ?1",
                params![id, online],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn set_public_key(&self, id: &str, public_key: &str) -> Result<KeyUpdate> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let previous: Option<Option<String>> = tx
                .query_row(
                    "SELECT public_key FROM identities WHERE id = ?1",
                    [id],
                    |row| row.get(0),
                )
                .optional()?;

            let update = match previous {
                None => return Ok(KeyUpdate::UnknownIdentity),
                Some(None) => KeyUpdate::Registered,
                Some(Some(_)) => KeyUpdate::Rotated,
            };

            tx.execute(
                "UPDATE identities SET public_key = ?2 WHERE id = ?1",
                params![id, public_key],
            )?;
            tx.commit()?;
            Ok(update)
        })
    }

    // -- Conversations --

    /// Return the two-party conversation between `creator_id` and
    /// `recipient_id`, creating it under `id` if none exists. The bool is true
    /// when a new conversation was created.
    pub fn find_or_create_direct(
        &self,
        id: &str,
        creator_id: &str,
        recipient_id: &str,
        now: &str,
    ) -> Result<(ConversationRow, bool)> {
        if creator_id == recipient_id {
            return Err(anyhow!("A direct conversation needs two distinct identities"));
        }
        let key = direct_key(creator_id, recipient_id);

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let existing = tx
                .query_row(
                    &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.direct_key = ?1"),
                    [&key],
                    map_conversation,
                )
                .optional()?;
            if let Some(existing) = existing {
                return Ok((existing, false));
            }

            tx.execute(
                "INSERT INTO conversations (id, creator_id, is_group, direct_key, created_at, updated_at)
                 VALUES (?1, ?2, 0, ?3, ?4, ?4)",
                params![id, creator_id, key, now],
            )?;
            tx.execute(
                "INSERT INTO conversation_members (conversation_id, user_id) VALUES (?1, ?2), (?1, ?3)",
                params![id, creator_id, recipient_id],
            )?;

            let row = query_conversation(&tx, id)?
                .ok_or_else(|| anyhow!("Conversation vanished after insert: {}", id))?;
            tx.commit()?;
            Ok((row, true))
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| query_conversation(conn, id))
    }

    /// Active conversations of `user_id`, most recently updated first.
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS}
                 FROM conversations c
                 JOIN conversation_members cm ON cm.conversation_id = c.id
                 WHERE cm.user_id = ?1 AND c.is_active = 1
                 ORDER BY c.updated_at DESC, c.id ASC"
            ))?;
            let rows = stmt
                .query_map([user_id], map_conversation)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn conversation_members(&self, conversation_id: &str) -> Result<Vec<MemberRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, user_id, unread_count, last_read_message_id
                 FROM conversation_members WHERE conversation_id = ?1
                 ORDER BY user_id",
            )?;
            let rows = stmt
                .query_map([conversation_id], |row| {
                    Ok(MemberRow {
                        conversation_id: row.get(0)?,
                        user_id: row.get(1)?,
                        unread_count: row.get(2)?,
                        last_read_message_id: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// True if `user_id` participates in the active conversation.
    pub fn is_member(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM conversation_members cm
                     JOIN conversations c ON c.id = cm.conversation_id
                     WHERE cm.conversation_id = ?1 AND cm.user_id = ?2 AND c.is_active = 1",
                    [conversation_id, user_id],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Soft-deactivate. Conversations are never deleted.
    pub fn deactivate_conversation(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE conversations SET is_active = 0 WHERE id = ?1 AND is_active = 1",
                [id],
            )?;
            Ok(changed > 0)
        })
    }

    // -- Messages --

    /// Insert a message, move the conversation's last-message pointer and bump
    /// the other participants' unread counters in one transaction.
    pub fn insert_message(&self, msg: &NewMessage<'_>) -> Result<MessageRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let active: Option<bool> = tx
                .query_row(
                    "SELECT is_active FROM conversations WHERE id = ?1",
                    [msg.conversation_id],
                    |row| row.get(0),
                )
                .optional()?;
            match active {
                Some(true) => {}
                Some(false) => return Err(anyhow!("Conversation is inactive: {}", msg.conversation_id)),
                None => return Err(anyhow!("Conversation not found: {}", msg.conversation_id)),
            }

            tx.execute(
                "INSERT INTO messages
                    (id, conversation_id, sender_id, ciphertext, ephemeral_public_key, nonce, message_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    msg.id,
                    msg.conversation_id,
                    msg.sender_id,
                    msg.ciphertext,
                    msg.ephemeral_public_key,
                    msg.nonce,
                    msg.message_type,
                    msg.created_at
                ],
            )?;
            tx.execute(
                "UPDATE conversations SET last_message_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![msg.conversation_id, msg.id, msg.created_at],
            )?;
            tx.execute(
                "UPDATE conversation_members SET unread_count = unread_count + 1
                 WHERE conversation_id = ?1 AND user_id != ?2",
                params![msg.conversation_id, msg.sender_id],
            )?;
            tx.commit()?;

            Ok(MessageRow {
                id: msg.id.to_string(),
                conversation_id: msg.conversation_id.to_string(),
                sender_id: msg.sender_id.to_string(),
                ciphertext: msg.ciphertext.to_vec(),
                ephemeral_public_key: msg.ephemeral_public_key.to_vec(),
                nonce: msg.nonce.to_vec(),
                message_type: msg.message_type.to_string(),
                delivered: false,
                delivered_at: None,
                read: false,
                read_at: None,
                read_by: vec![],
                created_at: msg.created_at.to_string(),
            })
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?1"),
                [id],
                map_message,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// The most recent `limit` messages, returned oldest first.
    pub fn get_messages(&self, conversation_id: &str, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT * FROM (
                    SELECT {MESSAGE_COLUMNS}, m.seq AS seq
                    FROM messages m
                    WHERE m.conversation_id = ?1
                    ORDER BY m.seq DESC
                    LIMIT ?2
                 ) ORDER BY seq ASC"
            ))?;
            let rows = stmt
                .query_map(params![conversation_id, limit], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// `sent -> delivered`. A message that is already delivered or read is
    /// left alone, so this never moves state backwards.
    pub fn mark_delivered(&self, id: &str, at: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET is_delivered = 1, delivered_at = ?2
                 WHERE id = ?1 AND is_delivered = 0 AND is_read = 0",
                params![id, at],
            )?;
            Ok(changed > 0)
        })
    }

    /// Flip `is_read` on the listed messages of `conversation_id` that were
    /// sent by someone other than `reader_id`. Already-read and unknown ids
    /// are skipped. Returns only the messages that actually flipped.
    pub fn mark_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
        message_ids: &[String],
        at: &str,
    ) -> Result<Vec<ReadReceiptRow>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut receipts = Vec::new();
            let mut newest: Option<(i64, String)> = None;

            {
                let mut select = tx.prepare(
                    "SELECT seq, sender_id FROM messages
                     WHERE id = ?1 AND conversation_id = ?2 AND sender_id != ?3 AND is_read = 0",
                )?;
                let mut update =
                    tx.prepare("UPDATE messages SET is_read = 1, read_at = ?2 WHERE id = ?1")?;
                let mut record = tx.prepare(
                    "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
                )?;

                for id in message_ids {
                    let Some((seq, sender_id)) = select
                        .query_row(params![id, conversation_id, reader_id], |row| {
                            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                        })
                        .optional()?
                    else {
                        continue;
                    };

                    update.execute(params![id, at])?;
                    record.execute(params![id, reader_id, at])?;

                    if newest.as_ref().is_none_or(|(s, _)| seq > *s) {
                        newest = Some((seq, id.clone()));
                    }
                    receipts.push(ReadReceiptRow {
                        message_id: id.clone(),
                        sender_id,
                    });
                }
            }

            // The marker only moves forward: reading an older message later
            // leaves it on the newest one read so far.
            if let Some((seq, last_read)) = &newest {
                tx.execute(
                    "UPDATE conversation_members
                     SET unread_count = (
                            SELECT COUNT(*) FROM messages
                            WHERE conversation_id = ?1 AND sender_id != ?2 AND is_read = 0
                         ),
                         last_read_message_id = CASE
                            WHEN COALESCE((
                                SELECT m.seq FROM messages m
                                WHERE m.id = conversation_members.last_read_message_id
                            ), -1) < ?4 THEN ?3
                            ELSE last_read_message_id
                         END
                     WHERE conversation_id = ?1 AND user_id = ?2",
                    params![conversation_id, reader_id, last_read, seq],
                )?;
            }

            tx.commit()?;
            Ok(receipts)
        })
    }
}

fn query_conversation(conn: &Connection, id: &str) -> Result<Option<ConversationRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1"),
            [id],
            map_conversation,
        )
        .optional()?;
    Ok(row)
}

fn map_identity(row: &Row<'_>) -> rusqlite::Result<IdentityRow> {
    Ok(IdentityRow {
        id: row.get(0)?,
        display_name: row.get(1)?,
        role: row.get(2)?,
        public_key: row.get(3)?,
        online: row.get(4)?,
    })
}

fn map_conversation(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        creator_id: row.get(1)?,
        is_group: row.get(2)?,
        last_message_id: row.get(3)?,
        is_active: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    let read_by: Option<String> = row.get(12)?;
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        ciphertext: row.get(3)?,
        ephemeral_public_key: row.get(4)?,
        nonce: row.get(5)?,
        message_type: row.get(6)?,
        delivered: row.get(7)?,
        delivered_at: row.get(8)?,
        read: row.get(9)?,
        read_at: row.get(10)?,
        created_at: row.get(11)?,
        read_by: read_by
            .map(|ids| ids.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
    })
}

/// Database row types, mapped directly from SQLite rows.
/// Distinct from caremesh-types models to keep the DB layer independent.

pub struct IdentityRow {
    pub id: String,
    pub display_name: String,
    pub role: String,
    pub public_key: Option<String>,
    pub online: bool,
}

pub struct ConversationRow {
    pub id: String,
    pub creator_id: String,
    pub is_group: bool,
    pub last_message_id: Option<String>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

pub struct MemberRow {
    pub conversation_id: String,
    pub user_id: String,
    pub unread_count: u32,
    pub last_read_message_id: Option<String>,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub ciphertext: Vec<u8>,
    pub ephemeral_public_key: Vec<u8>,
    pub nonce: Vec<u8>,
    pub message_type: String,
    pub delivered: bool,
    pub delivered_at: Option<String>,
    pub read: bool,
    pub read_at: Option<String>,
    pub read_by: Vec<String>,
    pub created_at: String,
}

/// Input for [`Database::insert_message`](crate::Database::insert_message).
pub struct NewMessage<'a> {
    pub id: &'a str,
    pub conversation_id: &'a str,
    pub sender_id: &'a str,
    pub ciphertext: &'a [u8],
    pub ephemeral_public_key: &'a [u8],
    pub nonce: &'a [u8],
    pub message_type: &'a str,
    pub created_at: &'a str,
}

/// A message that flipped to read, with the sender to notify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceiptRow {
    pub message_id: String,
    pub sender_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyUpdate {
    Registered,
    Rotated,
    UnknownIdentity,
}

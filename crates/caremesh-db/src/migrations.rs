use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS identities (
            id              TEXT PRIMARY KEY,
            display_name    TEXT NOT NULL,
            role            TEXT NOT NULL,
            public_key      TEXT,
            online          INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id               TEXT PRIMARY KEY,
            creator_id       TEXT NOT NULL REFERENCES identities(id),
            is_group         INTEGER NOT NULL DEFAULT 0,
            -- 'a:b' with a < b for two-party conversations, NULL for groups
            direct_key       TEXT UNIQUE,
            last_message_id  TEXT,
            is_active        INTEGER NOT NULL DEFAULT 1,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL,
            CHECK (is_group = 1 OR direct_key IS NOT NULL)
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_updated
            ON conversations(updated_at DESC, id);

        CREATE TABLE IF NOT EXISTS conversation_members (
            conversation_id       TEXT NOT NULL REFERENCES conversations(id),
            user_id               TEXT NOT NULL REFERENCES identities(id),
            unread_count          INTEGER NOT NULL DEFAULT 0,
            last_read_message_id  TEXT,
            PRIMARY KEY (conversation_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_members_user
            ON conversation_members(user_id);

        -- seq gives a strict creation order even when timestamps collide
        CREATE TABLE IF NOT EXISTS messages (
            seq                   INTEGER PRIMARY KEY AUTOINCREMENT,
            id                    TEXT NOT NULL UNIQUE,
            conversation_id       TEXT NOT NULL REFERENCES conversations(id),
            sender_id             TEXT NOT NULL REFERENCES identities(id),
            ciphertext            BLOB NOT NULL,
            ephemeral_public_key  BLOB NOT NULL,
            nonce                 BLOB NOT NULL,
            message_type          TEXT NOT NULL DEFAULT 'text',
            is_delivered          INTEGER NOT NULL DEFAULT 0,
            delivered_at          TEXT,
            is_read               INTEGER NOT NULL DEFAULT 0,
            read_at               TEXT,
            created_at            TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, seq);

        CREATE TABLE IF NOT EXISTS message_reads (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES identities(id),
            read_at     TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}

use crate::{
    Buddy, BuddyCategory, ConnRecord, Conversation, LoginRecord, PresenceStore, StoreError,
    StoreResult, User,
};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id          TEXT PRIMARY KEY NOT NULL,
    name        TEXT NOT NULL DEFAULT '',
    status      TEXT NOT NULL DEFAULT '0'
);
CREATE TABLE IF NOT EXISTS logins (
    token       TEXT PRIMARY KEY NOT NULL,
    id          TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE TABLE IF NOT EXISTS conns (
    key         TEXT PRIMARY KEY NOT NULL,
    user_id     TEXT NOT NULL,
    token       TEXT NOT NULL,
    updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_conns_token ON conns(token);
CREATE INDEX IF NOT EXISTS idx_conns_user_id ON conns(user_id);
CREATE TABLE IF NOT EXISTS conversations (
    id          TEXT PRIMARY KEY NOT NULL,
    sender      TEXT NOT NULL,
    receiver    TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_conversations_pair ON conversations(sender, receiver);
CREATE TABLE IF NOT EXISTS categories (
    id          TEXT PRIMARY KEY NOT NULL,
    user_id     TEXT NOT NULL,
    name        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS buddies (
    category_id TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    PRIMARY KEY (category_id, user_id)
);
";

/// SQLite-backed presence store.
///
/// The connection sits behind a `std::sync::Mutex`; callers are expected to
/// run these methods on a blocking thread.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        // WAL mode for better concurrent read performance
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;

        let users: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap_or(0);
        let stale: i64 = conn
            .query_row("SELECT COUNT(*) FROM conns", [], |row| row.get(0))
            .unwrap_or(0);
        if users > 0 {
            tracing::info!(users, stale_conns = stale, "loaded presence store");
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // ---- Provisioning ----

    pub fn add_user(&self, id: &str, name: &str, status: &str) -> StoreResult<()> {
        self.lock()?.execute(
            "INSERT INTO users (id, name, status) VALUES (?1, ?2, ?3)",
            params![id, name, status],
        )?;
        Ok(())
    }

    pub fn add_login(&self, id: &str, user_id: &str, token: &str) -> StoreResult<()> {
        self.lock()?.execute(
            "INSERT INTO logins (token, id, user_id) VALUES (?1, ?2, ?3)",
            params![token, id, user_id],
        )?;
        Ok(())
    }

    pub fn add_category(&self, id: &str, user_id: &str, name: &str) -> StoreResult<()> {
        self.lock()?.execute(
            "INSERT INTO categories (id, user_id, name) VALUES (?1, ?2, ?3)",
            params![id, user_id, name],
        )?;
        Ok(())
    }

    pub fn add_buddy(&self, category_id: &str, user_id: &str) -> StoreResult<()> {
        self.lock()?.execute(
            "INSERT OR IGNORE INTO buddies (category_id, user_id) VALUES (?1, ?2)",
            params![category_id, user_id],
        )?;
        Ok(())
    }

    pub fn user_by_id(&self, id: &str) -> StoreResult<Option<User>> {
        let conn = self.lock()?;
        let user = conn
            .query_row(
                "SELECT id, name, status FROM users WHERE id = ?1",
                [id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        status: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    fn keys(&self, sql: &str, arg: &str) -> StoreResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let keys = stmt
            .query_map([arg], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

impl PresenceStore for SqliteStore {
    fn login_by_token(&self, token: &str) -> StoreResult<Option<LoginRecord>> {
        let conn = self.lock()?;
        let login = conn
            .query_row(
                "SELECT id, user_id, token FROM logins WHERE token = ?1",
                [token],
                |row| {
                    Ok(LoginRecord {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        token: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(login)
    }

    fn user_by_token(&self, token: &str) -> StoreResult<Option<User>> {
        let conn = self.lock()?;
        let user = conn
            .query_row(
                "SELECT u.id, u.name, u.status
                   FROM users u JOIN logins l ON l.user_id = u.id
                  WHERE l.token = ?1",
                [token],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        status: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    fn update_user_status(&self, user_id: &str, status: &str) -> StoreResult<bool> {
        let n = self.lock()?.execute(
            "UPDATE users SET status = ?2 WHERE id = ?1",
            params![user_id, status],
        )?;
        Ok(n > 0)
    }

    fn conn_by_token(&self, token: &str) -> StoreResult<Option<ConnRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT key, user_id, token FROM conns WHERE token = ?1 LIMIT 1",
                [token],
                |row| {
                    Ok(ConnRecord {
                        key: row.get(0)?,
                        user_id: row.get(1)?,
                        token: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn add_conn(&self, key: &str, user_id: &str, token: &str) -> StoreResult<u64> {
        let n = self.lock()?.execute(
            "INSERT INTO conns (key, user_id, token) VALUES (?1, ?2, ?3)",
            params![key, user_id, token],
        )?;
        Ok(n as u64)
    }

    fn update_conn_by_token(&self, key: &str, user_id: &str, token: &str) -> StoreResult<u64> {
        let n = self.lock()?.execute(
            "UPDATE conns SET key = ?1, user_id = ?2, updated_at = datetime('now')
              WHERE token = ?3",
            params![key, user_id, token],
        )?;
        Ok(n as u64)
    }

    fn delete_conn_by_key(&self, key: &str) -> StoreResult<u64> {
        let n = self
            .lock()?
            .execute("DELETE FROM conns WHERE key = ?1", [key])?;
        Ok(n as u64)
    }

    fn count_conns_by_user(&self, user_id: &str) -> StoreResult<u64> {
        let count: i64 = self.lock()?.query_row(
            "SELECT COUNT(*) FROM conns WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn categories_by_token(&self, token: &str) -> StoreResult<Vec<BuddyCategory>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.name
               FROM categories c JOIN logins l ON l.user_id = c.user_id
              WHERE l.token = ?1
              ORDER BY c.name",
        )?;
        let categories = stmt
            .query_map([token], |row| {
                Ok(BuddyCategory {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    buddies: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(categories)
    }

    fn buddies_by_categories(
        &self,
        mut categories: Vec<BuddyCategory>,
    ) -> StoreResult<Vec<BuddyCategory>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT u.id, u.name, u.status
               FROM buddies b JOIN users u ON u.id = b.user_id
              WHERE b.category_id = ?1
              ORDER BY u.name",
        )?;
        for category in &mut categories {
            category.buddies = stmt
                .query_map([&category.id], |row| {
                    Ok(Buddy {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        status: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
        }
        Ok(categories)
    }

    fn buddy_keys_by_user_id(&self, user_id: &str) -> StoreResult<Vec<String>> {
        self.keys(
            "SELECT DISTINCT k.key
               FROM buddies b
               JOIN categories c ON c.id = b.category_id
               JOIN conns k ON k.user_id = c.user_id
              WHERE b.user_id = ?1",
            user_id,
        )
    }

    fn conversation_by_sender_receiver(
        &self,
        sender: &str,
        receiver: &str,
    ) -> StoreResult<Option<Conversation>> {
        let conn = self.lock()?;
        let conversation = conn
            .query_row(
                "SELECT id, sender, receiver FROM conversations
                  WHERE sender = ?1 AND receiver = ?2
                  ORDER BY created_at LIMIT 1",
                params![sender, receiver],
                |row| {
                    Ok(Conversation {
                        id: row.get(0)?,
                        sender: row.get(1)?,
                        receiver: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(conversation)
    }

    fn add_conversation(&self, sender: &str, receiver: &str) -> StoreResult<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.lock()?.execute(
            "INSERT INTO conversations (id, sender, receiver) VALUES (?1, ?2, ?3)",
            params![id, sender, receiver],
        )?;
        Ok(id)
    }

    fn conversation_by_id(&self, id: &str) -> StoreResult<Option<Conversation>> {
        let conn = self.lock()?;
        let conversation = conn
            .query_row(
                "SELECT id, sender, receiver FROM conversations WHERE id = ?1",
                [id],
                |row| {
                    Ok(Conversation {
                        id: row.get(0)?,
                        sender: row.get(1)?,
                        receiver: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(conversation)
    }

    fn receiver_keys_by_ticket(&self, ticket: &str) -> StoreResult<Vec<String>> {
        self.keys(
            "SELECT k.key
               FROM conversations v JOIN conns k ON k.user_id = v.receiver
              WHERE v.id = ?1",
            ticket,
        )
    }
}

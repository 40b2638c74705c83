//! Persistence gateway consumed by the relay core.
//!
//! Every call is synchronous. The relay runs them on the blocking pool and
//! awaits the result from its event loop.

mod sqlite;

pub use imrelay::protocol::{Buddy, BuddyCategory};
pub use sqlite::SqliteStore;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("blocking task failed: {0}")]
    Blocking(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A login issued to a user, identified by its token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRecord {
    pub id: String,
    pub user_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub status: String,
}

/// Binding between a live relay session key and a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnRecord {
    pub key: String,
    pub user_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub sender: String,
    pub receiver: String,
}

/// Lookups and updates the relay needs from persistent storage.
pub trait PresenceStore: Send + Sync {
    fn login_by_token(&self, token: &str) -> StoreResult<Option<LoginRecord>>;

    fn user_by_token(&self, token: &str) -> StoreResult<Option<User>>;

    /// Returns `true` when a user row was updated.
    fn update_user_status(&self, user_id: &str, status: &str) -> StoreResult<bool>;

    fn conn_by_token(&self, token: &str) -> StoreResult<Option<ConnRecord>>;

    /// Returns the number of rows written.
    fn add_conn(&self, key: &str, user_id: &str, token: &str) -> StoreResult<u64>;

    /// Rebind the connection record for `token` to a new key and user.
    fn update_conn_by_token(&self, key: &str, user_id: &str, token: &str) -> StoreResult<u64>;

    fn delete_conn_by_key(&self, key: &str) -> StoreResult<u64>;

    /// Connection records still held by a user.
    fn count_conns_by_user(&self, user_id: &str) -> StoreResult<u64>;

    /// Buddy groups of the user logged in with `token`, without members.
    fn categories_by_token(&self, token: &str) -> StoreResult<Vec<BuddyCategory>>;

    /// Fill in the members of each category.
    fn buddies_by_categories(&self, categories: Vec<BuddyCategory>)
    -> StoreResult<Vec<BuddyCategory>>;

    /// Connection keys of every user that lists `user_id` as a buddy.
    fn buddy_keys_by_user_id(&self, user_id: &str) -> StoreResult<Vec<String>>;

    fn conversation_by_sender_receiver(
        &self,
        sender: &str,
        receiver: &str,
    ) -> StoreResult<Option<Conversation>>;

    /// Create a conversation and return its id (the ticket).
    fn add_conversation(&self, sender: &str, receiver: &str) -> StoreResult<String>;

    fn conversation_by_id(&self, id: &str) -> StoreResult<Option<Conversation>>;

    /// Connection keys of the conversation's receiver.
    fn receiver_keys_by_ticket(&self, ticket: &str) -> StoreResult<Vec<String>>;
}

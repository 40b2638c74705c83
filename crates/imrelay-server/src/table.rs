use crate::session::ClientSession;
use imrelay::protocol::{Response, SessionKey};
use std::collections::HashMap;
use tracing::warn;

/// Live sessions keyed by session key. Only the dispatcher touches it.
#[derive(Default)]
pub struct ClientTable {
    sessions: HashMap<SessionKey, ClientSession>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&ClientSession> {
        self.sessions.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut ClientSession> {
        self.sessions.get_mut(key)
    }

    /// A fresh UUID v4 not held by any live session.
    pub fn generate_key(&self) -> SessionKey {
        loop {
            let key = uuid::Uuid::new_v4().to_string();
            if !self.sessions.contains_key(&key) {
                return key;
            }
        }
    }

    /// Register a session. A taken key hands the session back unregistered.
    pub fn insert(&mut self, session: ClientSession) -> Result<(), ClientSession> {
        if self.sessions.contains_key(session.key()) {
            return Err(session);
        }
        self.sessions.insert(session.key().to_string(), session);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<ClientSession> {
        self.sessions.remove(key)
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        self.sessions.keys().cloned().collect()
    }

    /// Queue a response for `key`. Returns whether it was queued.
    ///
    /// A session whose outbound queue is full or closed is terminated; it
    /// leaves the table through the normal quit path.
    pub fn deliver(&self, key: &str, response: Response) -> bool {
        let Some(session) = self.sessions.get(key) else {
            return false;
        };
        match session.put_out(response) {
            Ok(()) => true,
            Err(e) => {
                if !session.is_terminating() {
                    warn!(key = %key, peer = %session.peer(), err = %e, "dropping slow session");
                    session.terminate();
                }
                false
            }
        }
    }
}

use anyhow::Result;
use imrelay::protocol::SessionKey;
use imrelay_server::{RelayConfig, RelayHandle, spawn_relay};
use imrelay_store::{PresenceStore, SqliteStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;

/// A relay on a random local port, backed by a SQLite file in a temp dir.
///
/// Seeded directory:
///
/// | user | name  | tokens      | buddy groups              |
/// |------|-------|-------------|---------------------------|
/// | u1   | alice | tA, tA2     | friends: bob              |
/// | u2   | bob   | tB, tB2     | friends: alice            |
/// | u3   | carol | tC          | work: alice               |
/// | u4   | dave  | tD          |                           |
pub struct TestRelay {
    pub addr: SocketAddr,
    pub store: Arc<SqliteStore>,
    handle: Option<RelayHandle>,
    _data_dir: TempDir,
}

impl TestRelay {
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(RelayConfig::default()).await
    }

    /// Spawn with `config`; `listen` and `database` are replaced.
    pub async fn spawn_with(mut config: RelayConfig) -> Result<Self> {
        super::init_tracing();

        let data_dir = TempDir::new()?;
        let path = data_dir.path().join("presence.db");
        let store = Arc::new(SqliteStore::open(&path)?);
        seed(&store)?;

        config.listen = "127.0.0.1:0".to_string();
        config.database = Some(path);
        let shared: Arc<dyn PresenceStore> = store.clone();
        let handle = spawn_relay(&config, shared).await?;

        Ok(Self {
            addr: handle.addr(),
            store,
            handle: Some(handle),
            _data_dir: data_dir,
        })
    }

    pub fn relay_addr(&self) -> String {
        self.addr.to_string()
    }

    pub async fn session_keys(&self) -> Vec<SessionKey> {
        match &self.handle {
            Some(handle) => handle.session_keys().await.unwrap_or_default(),
            None => Vec::new(),
        }
    }

    pub fn status(&self, user_id: &str) -> String {
        self.store
            .user_by_id(user_id)
            .unwrap()
            .map(|u| u.status)
            .unwrap_or_default()
    }

    /// Drain and stop the relay. Returns the number of sessions drained.
    pub async fn shutdown(&mut self) -> Result<usize> {
        match self.handle.take() {
            Some(handle) => Ok(handle.shutdown().await?),
            None => Ok(0),
        }
    }
}

fn seed(store: &SqliteStore) -> Result<()> {
    for (id, name) in [("u1", "alice"), ("u2", "bob"), ("u3", "carol"), ("u4", "dave")] {
        store.add_user(id, name, "0")?;
    }
    for (id, user, token) in [
        ("l1", "u1", "tA"),
        ("l2", "u1", "tA2"),
        ("l3", "u2", "tB"),
        ("l4", "u2", "tB2"),
        ("l5", "u3", "tC"),
        ("l6", "u4", "tD"),
    ] {
        store.add_login(id, user, token)?;
    }
    store.add_category("c1", "u1", "friends")?;
    store.add_buddy("c1", "u2")?;
    store.add_category("c2", "u2", "friends")?;
    store.add_buddy("c2", "u1")?;
    store.add_category("c3", "u3", "work")?;
    store.add_buddy("c3", "u1")?;
    Ok(())
}

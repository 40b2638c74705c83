use anyhow::Context;
use clap::Parser;
use imrelay::DEFAULT_LISTEN_ADDR;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub listen: String,
    /// SQLite database file. `None` keeps everything in memory.
    pub database: Option<PathBuf>,
    pub max_clients: usize,
    /// Capacity of each dispatcher event queue.
    pub event_queue: usize,
    /// Capacity of each session's outbound queue.
    pub outbound_queue: usize,
}

impl RelayConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN_ADDR.to_string(),
            database: None,
            max_clients: 10_000,
            event_queue: 1024,
            outbound_queue: 256,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "imrelay presence-aware message relay")]
pub struct Args {
    /// TOML config file. Flags below override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub listen: Option<String>,
    /// SQLite database path.
    #[arg(long)]
    pub database: Option<PathBuf>,
    #[arg(long)]
    pub max_clients: Option<usize>,
}

impl Args {
    pub fn into_config(self) -> anyhow::Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)?,
            None => RelayConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(database) = self.database {
            config.database = Some(database);
        }
        if let Some(max_clients) = self.max_clients {
            config.max_clients = max_clients;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: RelayConfig = toml::from_str(
            r#"
            listen = "127.0.0.1:7000"
            outbound_queue = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.listen, "127.0.0.1:7000");
        assert_eq!(config.outbound_queue, 16);
        assert_eq!(config.max_clients, 10_000);
        assert!(config.database.is_none());
    }

    #[test]
    fn flags_override_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("relay.toml");
        std::fs::write(&path, "listen = \"127.0.0.1:7000\"\nmax_clients = 5\n").unwrap();

        let args = Args::parse_from([
            "imrelay-server",
            "--config",
            path.to_str().unwrap(),
            "--max-clients",
            "9",
            "--database",
            "/tmp/relay.db",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.listen, "127.0.0.1:7000");
        assert_eq!(config.max_clients, 9);
        assert_eq!(config.database, Some(PathBuf::from("/tmp/relay.db")));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = RelayConfig::load(Path::new("/nonexistent/relay.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }
}

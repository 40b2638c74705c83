//! Presence-aware message relay server.
//!
//! One dispatcher task owns every live session and serves the requests they
//! send. Sockets are read and written by per-session tasks that only talk to
//! the dispatcher through bounded queues.

pub mod acceptor;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod gateway;
pub mod router;
pub mod session;
pub mod shutdown;
pub mod table;

pub use config::{Args, RelayConfig};
pub use error::RelayError;

use dispatcher::Dispatcher;
use gateway::Gateway;
use imrelay::protocol::SessionKey;
use imrelay_store::PresenceStore;
use shutdown::ShutdownCoordinator;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A running relay: its bound address plus the tasks behind it.
pub struct RelayHandle {
    addr: SocketAddr,
    coordinator: ShutdownCoordinator,
    acceptor: JoinHandle<Result<(), RelayError>>,
    dispatcher: JoinHandle<()>,
}

impl RelayHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Keys of the sessions currently registered.
    pub async fn session_keys(&self) -> Result<Vec<SessionKey>, RelayError> {
        self.coordinator.snapshot().await
    }

    /// Stop accepting, quit every live session and wait for the dispatcher.
    pub async fn shutdown(self) -> Result<usize, RelayError> {
        self.acceptor.abort();
        let drained = self.coordinator.drain().await?;
        if let Err(e) = self.dispatcher.await {
            warn!(err = %e, "dispatcher task failed");
        }
        Ok(drained)
    }
}

/// Bind the listener and start the dispatcher and acceptor tasks.
pub async fn spawn_relay(
    config: &RelayConfig,
    store: Arc<dyn PresenceStore>,
) -> Result<RelayHandle, RelayError> {
    let listener = TcpListener::bind(&config.listen)
        .await
        .map_err(|source| RelayError::Bind {
            addr: config.listen.clone(),
            source,
        })?;
    let addr = listener.local_addr()?;

    let (joins, events, queues) = event::queues(config.event_queue);
    let coordinator = ShutdownCoordinator::new(events.control.clone());
    let dispatcher = Dispatcher::new(config, Gateway::new(store), events);

    let dispatcher = tokio::spawn(dispatcher.run(queues));
    let acceptor = tokio::spawn(acceptor::accept_loop(listener, joins));

    info!(
        addr = %addr,
        max_clients = config.max_clients,
        event_queue = config.event_queue,
        outbound_queue = config.outbound_queue,
        "imrelay listening"
    );

    Ok(RelayHandle {
        addr,
        coordinator,
        acceptor,
        dispatcher,
    })
}

enum Exit {
    Signal(&'static str),
    Acceptor(Result<Result<(), RelayError>, tokio::task::JoinError>),
}

/// Run the relay until a termination signal or a fatal acceptor error.
pub async fn run(config: RelayConfig, store: Arc<dyn PresenceStore>) -> anyhow::Result<()> {
    let mut handle = spawn_relay(&config, store).await?;

    let exit = tokio::select! {
        signal = shutdown::wait_for_signal() => Exit::Signal(signal?),
        res = &mut handle.acceptor => Exit::Acceptor(res),
    };

    match exit {
        Exit::Signal(name) => {
            info!(signal = name, "shutting down");
            let drained = handle.shutdown().await?;
            info!(sessions = drained, "shutdown complete");
            Ok(())
        }
        Exit::Acceptor(res) => {
            // Release live sessions before reporting the failure.
            if let Err(e) = handle.coordinator.drain().await {
                warn!(err = %e, "drain after acceptor exit failed");
            }
            res??;
            anyhow::bail!("acceptor stopped unexpectedly")
        }
    }
}

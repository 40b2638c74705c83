use crate::error::RelayError;
use crate::session::Connection;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Accept TCP connections and hand each one to the dispatcher as a join.
///
/// Accept errors are not retried. The loop ends quietly once the dispatcher
/// has gone away.
pub async fn accept_loop(
    listener: TcpListener,
    joins: mpsc::Sender<Connection>,
) -> Result<(), RelayError> {
    loop {
        let (stream, peer) = listener.accept().await.map_err(|e| {
            error!(err = %e, "accept failed");
            RelayError::Accept(e)
        })?;
        debug!(peer = %peer, "accepted connection");
        stream.set_nodelay(true).ok();

        if joins.send(Connection::tcp(stream, peer)).await.is_err() {
            debug!("dispatcher gone, acceptor exiting");
            return Ok(());
        }
    }
}

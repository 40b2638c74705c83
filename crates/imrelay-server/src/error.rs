use std::io;
use thiserror::Error;

/// Startup and infrastructure failures. These end the process.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("dispatcher is not running")]
    DispatcherGone,
}

/// Why a response could not be queued for a session.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("outbound queue is full")]
    Backlogged,

    #[error("session writer has stopped")]
    Closed,
}

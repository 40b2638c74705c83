pub mod client;
pub mod protocol;

/// Default TCP address the relay listens on.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9090";

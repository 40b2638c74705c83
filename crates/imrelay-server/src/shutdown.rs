use crate::error::RelayError;
use crate::event::Control;
use imrelay::protocol::SessionKey;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

/// Wait for SIGINT or SIGTERM and return the signal's name.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.map(|()| "SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

/// Drains live sessions through the dispatcher's control queue.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    control: mpsc::Sender<Control>,
}

impl ShutdownCoordinator {
    pub fn new(control: mpsc::Sender<Control>) -> Self {
        Self { control }
    }

    pub async fn snapshot(&self) -> Result<Vec<SessionKey>, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Snapshot(tx))
            .await
            .map_err(|_| RelayError::DispatcherGone)?;
        rx.await.map_err(|_| RelayError::DispatcherGone)
    }

    /// Quit every live session, wait until those quits are handled, then stop
    /// the dispatcher. Returns the number of sessions drained.
    pub async fn drain(&self) -> Result<usize, RelayError> {
        let keys = self.snapshot().await?;
        info!(sessions = keys.len(), "draining sessions");

        for key in &keys {
            self.send(Control::Quit(key.clone())).await?;
        }

        let (tx, rx) = oneshot::channel();
        self.send(Control::Flush(tx)).await?;
        rx.await.map_err(|_| RelayError::DispatcherGone)?;

        self.send(Control::Stop).await?;
        Ok(keys.len())
    }

    async fn send(&self, event: Control) -> Result<(), RelayError> {
        self.control
            .send(event)
            .await
            .map_err(|_| RelayError::DispatcherGone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_quits_snapshot_then_stops() {
        let (tx, mut rx) = mpsc::channel(16);
        let coordinator = ShutdownCoordinator::new(tx);

        let dispatcher = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(event) = rx.recv().await {
                match event {
                    Control::Snapshot(reply) => {
                        reply.send(vec!["a".to_string(), "b".to_string()]).unwrap();
                    }
                    Control::Quit(key) => seen.push(key),
                    Control::Flush(reply) => reply.send(()).unwrap(),
                    Control::Stop => break,
                }
            }
            seen
        });

        assert_eq!(coordinator.drain().await.unwrap(), 2);
        assert_eq!(dispatcher.await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn drain_without_dispatcher_fails() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = ShutdownCoordinator::new(tx).drain().await.unwrap_err();
        assert!(matches!(err, RelayError::DispatcherGone));
    }
}

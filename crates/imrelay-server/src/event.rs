use crate::session::Connection;
use imrelay::protocol::{CommandName, Envelope, Rejection, Request, SessionKey};
use tokio::sync::{mpsc, oneshot};

/// A decoded frame from one session, queued for the dispatcher.
#[derive(Debug)]
pub struct Inbound {
    pub key: SessionKey,
    /// Command name as sent, even when the payload failed validation.
    pub command: CommandName,
    pub request: Result<Request, Rejection>,
}

impl Inbound {
    pub fn decode(key: SessionKey, line: &str) -> Self {
        match serde_json::from_str::<Envelope>(line) {
            Ok(envelope) => Self {
                key,
                command: envelope.command,
                request: Request::decode(&envelope),
            },
            Err(e) => Self::rejected(key, Rejection::invalid(format!("invalid request: {e}"))),
        }
    }

    pub fn rejected(key: SessionKey, rejection: Rejection) -> Self {
        Self {
            key,
            command: CommandName::Unknown,
            request: Err(rejection),
        }
    }
}

/// Lifecycle events handled by the dispatcher.
#[derive(Debug)]
pub enum Control {
    /// A session's termination signal fired, or shutdown is draining it.
    Quit(SessionKey),
    /// Keys currently registered in the client table.
    Snapshot(oneshot::Sender<Vec<SessionKey>>),
    /// Answered once every control event queued before it has been handled.
    Flush(oneshot::Sender<()>),
    Stop,
}

/// Producer ends handed to each session's watchers.
#[derive(Clone)]
pub struct EventSender {
    pub inbound: mpsc::Sender<Inbound>,
    pub control: mpsc::Sender<Control>,
}

/// Consumer ends owned by the dispatcher loop.
pub struct Queues {
    pub joins: mpsc::Receiver<Connection>,
    pub control: mpsc::Receiver<Control>,
    pub inbound: mpsc::Receiver<Inbound>,
}

/// Create the three bounded event queues. Producers wait when a queue is full.
pub fn queues(capacity: usize) -> (mpsc::Sender<Connection>, EventSender, Queues) {
    let capacity = capacity.max(1);
    let (joins_tx, joins) = mpsc::channel(capacity);
    let (control_tx, control) = mpsc::channel(capacity);
    let (inbound_tx, inbound) = mpsc::channel(capacity);
    (
        joins_tx,
        EventSender {
            inbound: inbound_tx,
            control: control_tx,
        },
        Queues {
            joins,
            control,
            inbound,
        },
    )
}

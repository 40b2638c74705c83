use crate::error::DeliveryError;
use crate::event::{Control, EventSender, Inbound};
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use imrelay::protocol::{MAX_LINE_BYTES, Rejection, Response, SessionKey};
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type FrameWriter = FramedWrite<BoxWriter, LinesCodec>;

/// An accepted connection that has not been registered yet.
pub struct Connection {
    pub peer: String,
    reader: BoxReader,
    writer: BoxWriter,
}

impl Connection {
    pub fn new<R, W>(peer: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            peer: peer.into(),
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    pub fn tcp(stream: TcpStream, peer: SocketAddr) -> Self {
        let (r, w) = stream.into_split();
        Self::new(peer.to_string(), r, w)
    }

    /// Write a single frame and drop the connection without registering it.
    pub async fn refuse(self, response: Response) -> Result<()> {
        let mut writer = FramedWrite::new(self.writer, LinesCodec::new());
        write_frame(&mut writer, &response).await?;
        SinkExt::<String>::close(&mut writer).await?;
        Ok(())
    }
}

/// Identity bound to a session by a successful `GET_CONN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub id: String,
    pub user_id: String,
    pub token: String,
}

/// Server-side state for one live connection.
///
/// Owned by the dispatcher's client table. The read watcher, quit watcher and
/// writer tasks only hold channel ends and the two cancellation tokens.
pub struct ClientSession {
    key: SessionKey,
    peer: String,
    pub login: Option<Login>,
    outbound: mpsc::Sender<Response>,
    /// Termination signal: logout, disconnect, write failure or eviction.
    quit: CancellationToken,
    /// Teardown signal, fired once the dispatcher has dropped the session.
    closed: CancellationToken,
}

impl ClientSession {
    /// Start the session's watcher and writer tasks.
    pub fn spawn(
        key: SessionKey,
        conn: Connection,
        events: &EventSender,
        outbound_capacity: usize,
    ) -> Self {
        let quit = CancellationToken::new();
        let closed = CancellationToken::new();
        let (outbound, rx) = mpsc::channel(outbound_capacity.max(1));

        tokio::spawn(read_watcher(
            key.clone(),
            conn.reader,
            events.inbound.clone(),
            quit.clone(),
            closed.clone(),
        ));
        tokio::spawn(quit_watcher(
            key.clone(),
            events.control.clone(),
            quit.clone(),
            closed.clone(),
        ));
        tokio::spawn(write_loop(
            key.clone(),
            conn.writer,
            rx,
            quit.clone(),
            closed.clone(),
        ));

        Self {
            key,
            peer: conn.peer,
            login: None,
            outbound,
            quit,
            closed,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_authenticated(&self) -> bool {
        self.login.is_some()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.login.as_ref().map(|l| l.user_id.as_str())
    }

    /// Queue a response without waiting.
    pub fn put_out(&self, response: Response) -> Result<(), DeliveryError> {
        self.outbound.try_send(response).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Backlogged,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Fire the termination signal. The quit event reaches the dispatcher
    /// through the quit watcher.
    pub fn terminate(&self) {
        self.quit.cancel();
    }

    pub fn is_terminating(&self) -> bool {
        self.quit.is_cancelled()
    }

    /// Tear the session down. Queued responses are still flushed.
    pub fn close(self) {
        self.closed.cancel();
    }
}

async fn read_watcher(
    key: SessionKey,
    reader: BoxReader,
    inbound: mpsc::Sender<Inbound>,
    quit: CancellationToken,
    closed: CancellationToken,
) {
    let mut frames = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    // After a decode error the framed reader yields one `None` before it
    // resumes reading the stream.
    let mut recovering = false;

    loop {
        let line = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            _ = quit.cancelled() => break,
            line = frames.next() => line,
        };

        let event = match line {
            None if recovering => {
                recovering = false;
                continue;
            }
            None => {
                debug!(key = %key, "client disconnected");
                quit.cancel();
                break;
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                recovering = true;
                Inbound::rejected(
                    key.clone(),
                    Rejection::invalid(format!("frame exceeds {MAX_LINE_BYTES} bytes")),
                )
            }
            Some(Err(LinesCodecError::Io(e))) if e.kind() == ErrorKind::InvalidData => {
                recovering = true;
                Inbound::rejected(key.clone(), Rejection::invalid("frame is not valid UTF-8"))
            }
            Some(Err(LinesCodecError::Io(e))) => {
                debug!(key = %key, err = %e, "read error");
                quit.cancel();
                break;
            }
            Some(Ok(line)) if line.trim().is_empty() => continue,
            Some(Ok(line)) => Inbound::decode(key.clone(), &line),
        };

        if inbound.send(event).await.is_err() {
            break;
        }
    }
}

async fn quit_watcher(
    key: SessionKey,
    control: mpsc::Sender<Control>,
    quit: CancellationToken,
    closed: CancellationToken,
) {
    tokio::select! {
        biased;
        _ = closed.cancelled() => {}
        _ = quit.cancelled() => {
            debug!(key = %key, "termination signalled");
            let _ = control.send(Control::Quit(key)).await;
        }
    }
}

async fn write_loop(
    key: SessionKey,
    writer: BoxWriter,
    mut rx: mpsc::Receiver<Response>,
    quit: CancellationToken,
    closed: CancellationToken,
) {
    let mut frames: FrameWriter = FramedWrite::new(writer, LinesCodec::new());

    loop {
        let response = tokio::select! {
            biased;
            response = rx.recv() => match response {
                Some(response) => response,
                None => break,
            },
            _ = closed.cancelled() => break,
        };
        if let Err(e) = write_frame(&mut frames, &response).await {
            warn!(key = %key, err = %e, "write failed, closing session");
            quit.cancel();
            return;
        }
    }

    while let Ok(response) = rx.try_recv() {
        if write_frame(&mut frames, &response).await.is_err() {
            break;
        }
    }
    let _ = SinkExt::<String>::close(&mut frames).await;
}

async fn write_frame(writer: &mut FrameWriter, response: &Response) -> Result<()> {
    let line = serde_json::to_string(response)?;
    writer.send(line).await?;
    Ok(())
}

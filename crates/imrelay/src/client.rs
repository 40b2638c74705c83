use crate::protocol::{
    CommandName, Envelope, KeyInfo, MAX_LINE_BYTES, Request, Response, SessionKey,
};
use anyhow::{Context, Result, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Client for the relay's JSON-lines TCP protocol.
pub struct RelayClient {
    reader: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
    key: SessionKey,
}

impl RelayClient {
    /// Connect to the relay at `addr`.
    /// Waits for the `GET_KEY_RETURN` frame before returning.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        let (r, w) = stream.into_split();
        let reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

        let mut client = Self {
            reader,
            writer,
            key: String::new(),
        };

        let first = client.next_response().await?;
        if first.command != CommandName::GetKeyReturn {
            return Err(anyhow!("expected GET_KEY_RETURN, got {first:?}"));
        }
        if !first.is_ok() {
            bail!("relay refused connection ({}): {}", first.code, first.message);
        }
        let info: KeyInfo = first
            .payload("conn")
            .ok_or_else(|| anyhow!("GET_KEY_RETURN without conn.key"))?;
        client.key = info.key;
        Ok(client)
    }

    /// The key the relay assigned to this connection.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn send(&mut self, req: Request) -> Result<()> {
        self.send_envelope(&req.to_envelope()).await
    }

    /// Send a raw envelope, bypassing client-side validation.
    pub async fn send_envelope(&mut self, envelope: &Envelope) -> Result<()> {
        let line = serde_json::to_string(envelope)?;
        self.writer.send(line).await?;
        Ok(())
    }

    /// Send a pre-encoded line as-is.
    pub async fn send_raw(&mut self, line: &str) -> Result<()> {
        self.writer.send(line).await?;
        Ok(())
    }

    /// Read the next frame (reply or push) from the relay.
    pub async fn next_response(&mut self) -> Result<Response> {
        let Some(line) = self.reader.next().await else {
            bail!("relay disconnected");
        };
        Ok(serde_json::from_str(&line?)?)
    }

    /// Read frames until one carries `command`, dropping the others.
    pub async fn next_for(&mut self, command: CommandName) -> Result<Response> {
        loop {
            let resp = self.next_response().await?;
            if resp.command == command {
                return Ok(resp);
            }
        }
    }

    /// Log in with a token and wait for `GET_CONN_RETURN`.
    pub async fn login(&mut self, token: &str) -> Result<Response> {
        self.send(Request::GetConn {
            token: token.to_string(),
        })
        .await?;
        self.next_for(CommandName::GetConnReturn).await
    }
}

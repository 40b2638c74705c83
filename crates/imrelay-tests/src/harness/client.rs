use anyhow::{Result, bail};
use imrelay::client::RelayClient;
use imrelay::protocol::{BuddyCategory, CommandName, Request, Response, SessionTicket};
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Convenience wrapper over `RelayClient` for integration tests.
pub struct TestClient {
    inner: RelayClient,
}

impl TestClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        let inner = RelayClient::connect(addr).await?;
        Ok(Self { inner })
    }

    pub fn key(&self) -> &str {
        self.inner.key()
    }

    pub async fn login(&mut self, token: &str) -> Result<Response> {
        tokio::time::timeout(RECV_TIMEOUT, self.inner.login(token)).await?
    }

    pub async fn buddy_list(&mut self, token: &str) -> Result<Vec<BuddyCategory>> {
        self.inner
            .send(Request::GetBuddyList {
                token: token.to_string(),
            })
            .await?;
        let resp = self.next_for(CommandName::GetBuddyListReturn).await?;
        match resp.payload("categories") {
            Some(categories) => Ok(categories),
            None => bail!("buddy list failed ({}): {}", resp.code, resp.message),
        }
    }

    /// Open (or reuse) the conversation to `receiver` and return its ticket.
    pub async fn create_session(&mut self, sender: &str, receiver: &str, token: &str) -> Result<String> {
        self.inner
            .send(Request::CreateSession {
                sender: sender.to_string(),
                receiver: receiver.to_string(),
                token: token.to_string(),
            })
            .await?;
        let resp = self.next_for(CommandName::CreateSessionReturn).await?;
        match resp.payload::<SessionTicket>("session") {
            Some(session) => Ok(session.ticket),
            None => bail!("create session failed ({}): {}", resp.code, resp.message),
        }
    }

    pub async fn send_msg(&mut self, ticket: &str, content: &str) -> Result<()> {
        self.inner
            .send(Request::SendMsg {
                ticket: ticket.to_string(),
                content: content.to_string(),
            })
            .await
    }

    pub async fn set_status(&mut self, token: &str, status: &str) -> Result<()> {
        self.inner
            .send(Request::SendStatusChange {
                token: token.to_string(),
                status: status.to_string(),
            })
            .await
    }

    pub async fn logout(&mut self) -> Result<()> {
        self.inner.send(Request::LogoutRequest).await
    }

    pub async fn send_raw(&mut self, line: &str) -> Result<()> {
        self.inner.send_raw(line).await
    }

    pub async fn next(&mut self) -> Result<Response> {
        tokio::time::timeout(RECV_TIMEOUT, self.inner.next_response()).await?
    }

    pub async fn next_for(&mut self, command: CommandName) -> Result<Response> {
        tokio::time::timeout(RECV_TIMEOUT, self.inner.next_for(command)).await?
    }

    /// True if no frame arrives within `wait`.
    pub async fn is_silent_for(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.inner.next_response())
            .await
            .is_err()
    }

    /// Wait until the relay closes the connection.
    pub async fn wait_closed(&mut self) -> Result<()> {
        loop {
            match self.next().await {
                Ok(_) => continue,
                Err(e) if e.to_string().contains("disconnected") => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

use crate::config::RelayConfig;
use crate::event::{Control, EventSender, Inbound, Queues};
use crate::gateway::{Gateway, release_user};
use crate::router;
use crate::session::{ClientSession, Connection};
use crate::table::ClientTable;
use imrelay::protocol::{CommandName, Rejection, Response, code};
use serde_json::json;
use tracing::{debug, info, warn};

/// The relay's single event loop. Owns the client table; every join, quit and
/// request is handled here to completion before the next event is taken.
pub struct Dispatcher {
    clients: ClientTable,
    gateway: Gateway,
    events: EventSender,
    max_clients: usize,
    outbound_queue: usize,
}

impl Dispatcher {
    pub fn new(config: &RelayConfig, gateway: Gateway, events: EventSender) -> Self {
        Self {
            clients: ClientTable::new(),
            gateway,
            events,
            max_clients: config.max_clients,
            outbound_queue: config.outbound_queue,
        }
    }

    pub async fn run(mut self, queues: Queues) {
        let Queues {
            mut joins,
            mut control,
            mut inbound,
        } = queues;

        loop {
            tokio::select! {
                Some(conn) = joins.recv() => self.handle_join(conn),
                Some(event) = control.recv() => {
                    if !self.handle_control(event).await {
                        break;
                    }
                }
                Some(request) = inbound.recv() => self.handle_inbound(request).await,
                else => break,
            }
        }

        info!(remaining = self.clients.len(), "dispatcher stopped");
    }

    fn handle_join(&mut self, conn: Connection) {
        if self.clients.len() >= self.max_clients {
            warn!(peer = %conn.peer, max_clients = self.max_clients, "relay at capacity, refusing connection");
            let refusal = Rejection::new(code::AT_CAPACITY, "relay at capacity", CommandName::GetKeyReturn);
            tokio::spawn(async move {
                if let Err(e) = conn.refuse(refusal.into()).await {
                    debug!(err = %e, "failed to write refusal");
                }
            });
            return;
        }

        let key = self.clients.generate_key();
        let session = ClientSession::spawn(key.clone(), conn, &self.events, self.outbound_queue);
        info!(key = %key, peer = %session.peer(), clients = self.clients.len() + 1, "client joined");
        if let Err(session) = self.clients.insert(session) {
            session.close();
            return;
        }
        self.clients.deliver(
            &key,
            Response::with_data(CommandName::GetKeyReturn, "conn", json!({ "key": key })),
        );
    }

    /// Returns false when the loop should stop.
    async fn handle_control(&mut self, event: Control) -> bool {
        match event {
            Control::Quit(key) => self.handle_quit(&key).await,
            Control::Snapshot(reply) => {
                let _ = reply.send(self.clients.keys());
            }
            Control::Flush(reply) => {
                let _ = reply.send(());
            }
            Control::Stop => return false,
        }
        true
    }

    /// Tear down a session. A key that is no longer registered is ignored.
    async fn handle_quit(&mut self, key: &str) {
        let Some(session) = self.clients.remove(key) else {
            debug!(key = %key, "quit for unknown session ignored");
            return;
        };

        let owned_key = key.to_string();
        let user_id = session.user_id().map(str::to_string);
        let result = self
            .gateway
            .call(move |s| {
                s.delete_conn_by_key(&owned_key)?;
                match user_id {
                    Some(user_id) => release_user(s, &user_id),
                    None => Ok(false),
                }
            })
            .await;

        match result {
            Ok(went_offline) => {
                info!(key = %key, user_id = ?session.user_id(), went_offline, clients = self.clients.len(), "client quit")
            }
            Err(e) => warn!(key = %key, err = %e, "failed to clear presence on quit"),
        }
        session.close();
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        router::route(&mut self.clients, &self.gateway, inbound).await;
    }
}

//! Server half of the resilient channel
//!
//! Every request is acked on the session it arrived on as soon as it has been
//! queued for processing. The real reply goes out later via
//! [`ResilientServer::send_reply`] to the return address the client announced
//! in its handshake.

use crate::message::{Ack, Message, MessageKind};
use crate::transport::{Incoming, Transport};
use bytes::Bytes;
use cumulus_core::error::{CumulusError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How many recent (client tag, message id) pairs are remembered for
    /// duplicate suppression
    pub dedup_window: usize,
    /// Depth of the queue between the listener and the request handler
    pub queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            dedup_window: 10_000,
            queue_depth: 1024,
        }
    }
}

/// Bounded memory of recently delivered requests
struct RecentMessages {
    seen: HashSet<(String, Uuid)>,
    order: VecDeque<(String, Uuid)>,
    capacity: usize,
}

impl RecentMessages {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record a request; false if it was already seen
    fn insert(&mut self, client_tag: &str, message_id: Uuid) -> bool {
        let entry = (client_tag.to_string(), message_id);
        if !self.seen.insert(entry.clone()) {
            return false;
        }
        self.order.push_back(entry);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Accepts requests from resilient clients and pushes replies back
#[derive(Clone)]
pub struct ResilientServer {
    name: String,
    transport: Arc<dyn Transport>,
    /// client tag -> return address
    clients: Arc<Mutex<HashMap<String, String>>>,
}

impl ResilientServer {
    /// Listen on `address`; requests are delivered in arrival order on the
    /// returned receiver
    pub async fn bind(
        name: impl Into<String>,
        address: &str,
        transport: Arc<dyn Transport>,
        config: ServerConfig,
        halt: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<Message>)> {
        let name = name.into();
        let incoming = transport.bind_server(address).await?;
        let (tx, rx) = mpsc::channel(config.queue_depth);

        let server = Self {
            name,
            transport,
            clients: Arc::new(Mutex::new(HashMap::new())),
        };
        info!(server = %server.name, address, "Resilient server listening");

        let listener = server.clone();
        tokio::spawn(async move {
            listener.serve(incoming, tx, config, halt).await;
        });

        Ok((server, rx))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of clients that have completed a handshake
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    async fn serve(
        &self,
        mut incoming: mpsc::Receiver<Incoming>,
        requests: mpsc::Sender<Message>,
        config: ServerConfig,
        halt: CancellationToken,
    ) {
        let mut recent = RecentMessages::new(config.dedup_window);
        loop {
            let Incoming { message, ack } = tokio::select! {
                _ = halt.cancelled() => break,
                next = incoming.recv() => match next {
                    Some(next) => next,
                    None => break,
                },
            };

            let accepted = match &message.kind {
                MessageKind::ResilientServerHandshake => {
                    info!(
                        server = %self.name,
                        client = %message.client_tag,
                        address = %message.client_address,
                        "Client handshake"
                    );
                    self.clients
                        .lock()
                        .insert(message.client_tag.clone(), message.client_address.clone());
                    true
                }
                MessageKind::ResilientServerSignoff => {
                    info!(server = %self.name, client = %message.client_tag, "Client signoff");
                    self.clients.lock().remove(&message.client_tag);
                    true
                }
                MessageKind::Ping => true,
                MessageKind::ResilientServerAck(_) => {
                    warn!(server = %self.name, client = %message.client_tag, "Unexpected ack from client");
                    false
                }
                _ => {
                    if recent.insert(&message.client_tag, message.message_id) {
                        requests.send(message.clone()).await.is_ok()
                    } else {
                        debug!(
                            server = %self.name,
                            client = %message.client_tag,
                            message_id = %message.message_id,
                            message_type = message.kind.name(),
                            "Re-acking duplicate request"
                        );
                        true
                    }
                }
            };

            let reply = message.reply(
                MessageKind::ResilientServerAck(Ack {
                    incoming_type: message.kind.name().to_string(),
                    accepted,
                }),
                vec![],
            );
            // The client may already have given up on this session.
            let _ = ack.send(reply);
        }
        debug!(server = %self.name, "Resilient server stopped");
    }

    /// Push the reply to `request` to its client
    pub async fn send_reply(&self, request: &Message, kind: MessageKind, body: Vec<Bytes>) -> Result<()> {
        let address = self
            .clients
            .lock()
            .get(&request.client_tag)
            .cloned()
            .or_else(|| Some(request.client_address.clone()).filter(|a| !a.is_empty()))
            .ok_or_else(|| {
                CumulusError::Network(format!("no return address for client {}", request.client_tag))
            })?;
        self.transport.push(&address, request.reply(kind, body)).await
    }
}

//! Unreliable transports the resilient channel runs over
//!
//! Two legs exist between a client and a server:
//! - a request/ack session the client opens to the server's address
//! - a one-way push leg the server uses to deliver replies to the client's
//!   listening address
//!
//! Neither leg promises delivery. The resilient client and server add
//! handshakes, acks, timeouts and reconnects on top.

use crate::message::Message;
use async_trait::async_trait;
use cumulus_core::error::{CumulusError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Capacity of listener queues
pub const LISTENER_QUEUE_DEPTH: usize = 1024;

/// A request received on a server's address, with the slot for its ack
pub struct Incoming {
    pub message: Message,
    pub ack: oneshot::Sender<Message>,
}

/// Client side of a request/ack session
#[async_trait]
pub trait Connection: Send {
    /// Send one request
    async fn send(&mut self, message: Message) -> Result<()>;

    /// Wait for the ack of the last request sent
    async fn recv_ack(&mut self) -> Result<Message>;
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Listen for request/ack sessions on `address`
    async fn bind_server(&self, address: &str) -> Result<mpsc::Receiver<Incoming>>;

    /// Listen for pushed replies on `address`
    async fn bind_pull(&self, address: &str) -> Result<mpsc::Receiver<Message>>;

    /// Open a request/ack session to a server
    async fn connect(&self, address: &str) -> Result<Box<dyn Connection>>;

    /// Push one message to a listening address
    async fn push(&self, address: &str, message: Message) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    servers: HashMap<String, mpsc::Sender<Incoming>>,
    pulls: HashMap<String, mpsc::Sender<Message>>,
    unreachable: HashSet<String>,
    dropped_acks: HashMap<String, usize>,
}

/// In-process transport with fault injection
///
/// Cloning shares the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse connections and pushes to `address` until made reachable again
    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(address.to_string());
        } else {
            state.unreachable.remove(address);
        }
        debug!(address, unreachable, "Memory network reachability changed");
    }

    /// Lose the acks of the next `count` requests sent to `address`
    ///
    /// The requests themselves still arrive.
    pub fn drop_next_acks(&self, address: &str, count: usize) {
        *self
            .state
            .lock()
            .dropped_acks
            .entry(address.to_string())
            .or_insert(0) += count;
    }

    fn reachable(&self, address: &str) -> Result<()> {
        if self.state.lock().unreachable.contains(address) {
            return Err(CumulusError::Network(format!("{} unreachable", address)));
        }
        Ok(())
    }

    fn take_dropped_ack(&self, address: &str) -> bool {
        let mut state = self.state.lock();
        match state.dropped_acks.get_mut(address) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }
}

struct MemoryConnection {
    address: String,
    network: MemoryNetwork,
    server: mpsc::Sender<Incoming>,
    pending: Option<oneshot::Receiver<Message>>,
    lose_ack: bool,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&mut self, message: Message) -> Result<()> {
        self.network.reachable(&self.address)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.server
            .send(Incoming {
                message,
                ack: ack_tx,
            })
            .await
            .map_err(|_| CumulusError::Network(format!("{} closed", self.address)))?;
        self.lose_ack = self.network.take_dropped_ack(&self.address);
        self.pending = Some(ack_rx);
        Ok(())
    }

    async fn recv_ack(&mut self) -> Result<Message> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| CumulusError::Network("no request outstanding".to_string()))?;
        if self.lose_ack {
            debug!(address = %self.address, "Dropping ack");
            return std::future::pending().await;
        }
        pending
            .await
            .map_err(|_| CumulusError::Network(format!("{} dropped the request", self.address)))
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn bind_server(&self, address: &str) -> Result<mpsc::Receiver<Incoming>> {
        let (tx, rx) = mpsc::channel(LISTENER_QUEUE_DEPTH);
        self.state.lock().servers.insert(address.to_string(), tx);
        Ok(rx)
    }

    async fn bind_pull(&self, address: &str) -> Result<mpsc::Receiver<Message>> {
        let (tx, rx) = mpsc::channel(LISTENER_QUEUE_DEPTH);
        self.state.lock().pulls.insert(address.to_string(), tx);
        Ok(rx)
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn Connection>> {
        self.reachable(address)?;
        let server = self
            .state
            .lock()
            .servers
            .get(address)
            .cloned()
            .ok_or_else(|| CumulusError::Network(format!("connection refused: {}", address)))?;
        Ok(Box::new(MemoryConnection {
            address: address.to_string(),
            network: self.clone(),
            server,
            pending: None,
            lose_ack: false,
        }))
    }

    async fn push(&self, address: &str, message: Message) -> Result<()> {
        self.reachable(address)?;
        let pull = self
            .state
            .lock()
            .pulls
            .get(address)
            .cloned()
            .ok_or_else(|| CumulusError::Network(format!("nobody listening on {}", address)))?;
        pull.send(message)
            .await
            .map_err(|_| CumulusError::Network(format!("{} closed", address)))
    }
}

//! Client half of the resilient channel
//!
//! One background task per client owns the transport session and the send
//! queue. At most one request is outstanding at a time; the next one goes
//! out only after the server has acked the previous one.
//!
//! ```text
//!            request()                   ack (same session)
//!   caller ───────────► queue ──► task ◄──────────────────── server
//!     ▲                                                        │
//!     └──────── Deliverator ◄── reply listener ◄── push ───────┘
//! ```

use crate::deliverator::Deliverator;
use crate::message::{Ack, Message, MessageKind};
use crate::transport::{Connection, Transport};
use bytes::Bytes;
use cumulus_core::error::{CumulusError, Result};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Resilient client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for the server to ack one request
    pub ack_timeout: Duration,
    /// Pause before retrying a failed handshake or a dead session
    pub handshake_retry_interval: Duration,
    /// Close an idle session after this long
    pub max_idle: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(600),
            handshake_retry_interval: Duration::from_secs(60),
            max_idle: Duration::from_secs(1800),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Disconnected,
    Handshaking,
    Connected,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ClientStatus::Disconnected => "disconnected",
            ClientStatus::Handshaking => "handshaking",
            ClientStatus::Connected => "connected",
        };
        f.write_str(text)
    }
}

/// Who a client is and where it talks to
#[derive(Debug, Clone)]
pub struct ClientSpec {
    /// Stable identity presented in the handshake
    pub client_tag: String,
    /// Name of the node the server runs on
    pub server_name: String,
    pub server_address: String,
    /// Where the server should push replies
    pub reply_address: String,
}

/// Handle to one resilient client; cloning shares the same channel
#[derive(Clone)]
pub struct ResilientClient {
    spec: Arc<ClientSpec>,
    queue: mpsc::UnboundedSender<Message>,
    status: watch::Receiver<ClientStatus>,
    /// False once a handshake or ack has failed, until a handshake succeeds
    healthy: Arc<AtomicBool>,
    deliverator: Deliverator,
    halt: CancellationToken,
}

impl ResilientClient {
    /// Start the client task; it connects right away
    pub fn spawn(
        spec: ClientSpec,
        transport: Arc<dyn Transport>,
        deliverator: Deliverator,
        config: ClientConfig,
        halt: CancellationToken,
    ) -> Self {
        let spec = Arc::new(spec);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ClientStatus::Disconnected);
        let healthy = Arc::new(AtomicBool::new(false));

        let task = ClientTask {
            spec: spec.clone(),
            transport,
            config,
            incoming: queue_rx,
            queue: VecDeque::new(),
            connection: None,
            status: status_tx,
            healthy: healthy.clone(),
            halt: halt.clone(),
        };
        tokio::spawn(task.run());

        Self {
            spec,
            queue: queue_tx,
            status: status_rx,
            healthy,
            deliverator,
            halt,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.spec.server_name
    }

    pub fn client_tag(&self) -> &str {
        &self.spec.client_tag
    }

    pub fn status(&self) -> ClientStatus {
        *self.status.borrow()
    }

    /// True when the server is believed reachable
    ///
    /// A session closed for idleness still counts; it reopens on next use.
    pub fn connected(&self) -> bool {
        self.healthy.load(Ordering::Acquire) && !self.halt.is_cancelled()
    }

    /// Wait until the status equals `wanted` or `timeout` passes
    pub async fn wait_for_status(&self, wanted: ClientStatus, timeout: Duration) -> bool {
        let mut status = self.status.clone();
        tokio::time::timeout(timeout, status.wait_for(|s| *s == wanted))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    fn stamp(&self, kind: MessageKind, body: Vec<Bytes>) -> Message {
        let mut message = Message::new(kind, body);
        message.client_tag = self.spec.client_tag.clone();
        message.client_address = self.spec.reply_address.clone();
        message
    }

    /// Queue a request and wait up to `timeout` for its reply
    pub async fn request(&self, kind: MessageKind, body: Vec<Bytes>, timeout: Duration) -> Result<Message> {
        if self.halt.is_cancelled() {
            return Err(CumulusError::Halted);
        }
        let message = self.stamp(kind, body);
        let pending = self.deliverator.add_request(message.message_id);
        debug!(
            server = %self.spec.server_name,
            message_id = %message.message_id,
            message_type = message.kind.name(),
            "Queueing request"
        );
        self.queue.send(message).map_err(|_| CumulusError::Halted)?;

        tokio::select! {
            _ = self.halt.cancelled() => Err(CumulusError::Halted),
            reply = pending.wait(timeout) => reply,
        }
    }
}

struct ClientTask {
    spec: Arc<ClientSpec>,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    incoming: mpsc::UnboundedReceiver<Message>,
    queue: VecDeque<Message>,
    connection: Option<Box<dyn Connection>>,
    status: watch::Sender<ClientStatus>,
    healthy: Arc<AtomicBool>,
    halt: CancellationToken,
}

impl ClientTask {
    async fn run(mut self) {
        let mut want_connection = true;
        let mut last_activity = Instant::now();

        loop {
            if self.halt.is_cancelled() {
                break;
            }

            if self.connection.is_none() && (want_connection || !self.queue.is_empty()) {
                want_connection = true;
                self.status.send_replace(ClientStatus::Handshaking);
                match self.handshake().await {
                    Ok(connection) => {
                        info!(client = %self.spec.client_tag, server = %self.spec.server_name, "Connected");
                        self.connection = Some(connection);
                        self.healthy.store(true, Ordering::Release);
                        self.status.send_replace(ClientStatus::Connected);
                        last_activity = Instant::now();
                    }
                    Err(e) => {
                        if self.healthy.swap(false, Ordering::AcqRel) {
                            warn!(server = %self.spec.server_name, error = %e, "Handshake failed");
                        } else {
                            debug!(server = %self.spec.server_name, error = %e, "Handshake failed");
                        }
                        self.status.send_replace(ClientStatus::Disconnected);
                        if !self.pause(self.config.handshake_retry_interval).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            if let Some(message) = self.queue.pop_front() {
                match self.send_one(&message).await {
                    Ok(()) => {
                        last_activity = Instant::now();
                    }
                    Err(e) => {
                        warn!(
                            server = %self.spec.server_name,
                            message_id = %message.message_id,
                            error = %e,
                            "Send failed, reconnecting"
                        );
                        self.queue.push_front(message);
                        self.connection = None;
                        self.healthy.store(false, Ordering::Release);
                        self.status.send_replace(ClientStatus::Disconnected);
                        if !self.pause(self.config.handshake_retry_interval).await {
                            break;
                        }
                    }
                }
                continue;
            }

            let idle_deadline = last_activity + self.config.max_idle;
            let connected = self.connection.is_some();
            tokio::select! {
                _ = self.halt.cancelled() => break,
                next = self.incoming.recv() => match next {
                    Some(message) => self.queue.push_back(message),
                    None => break,
                },
                _ = tokio::time::sleep_until(idle_deadline), if connected => {
                    debug!(server = %self.spec.server_name, "Closing idle session");
                    self.sign_off().await;
                    want_connection = false;
                    self.status.send_replace(ClientStatus::Disconnected);
                }
            }
        }

        self.sign_off().await;
        self.status.send_replace(ClientStatus::Disconnected);
        debug!(client = %self.spec.client_tag, "Client stopped");
    }

    /// Sleep while still accepting queued messages; false if halted
    async fn pause(&mut self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            tokio::select! {
                _ = self.halt.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline) => return true,
                next = self.incoming.recv() => match next {
                    Some(message) => self.queue.push_back(message),
                    None => return false,
                },
            }
        }
    }

    async fn handshake(&mut self) -> Result<Box<dyn Connection>> {
        let mut connection = self.transport.connect(&self.spec.server_address).await?;
        let mut message = Message::new(MessageKind::ResilientServerHandshake, vec![]);
        message.client_tag = self.spec.client_tag.clone();
        message.client_address = self.spec.reply_address.clone();
        exchange(connection.as_mut(), &message, self.config.ack_timeout, &self.halt).await?;
        Ok(connection)
    }

    async fn send_one(&mut self, message: &Message) -> Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| CumulusError::Network("not connected".to_string()))?;
        exchange(connection.as_mut(), message, self.config.ack_timeout, &self.halt).await
    }

    async fn sign_off(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            let mut message = Message::new(MessageKind::ResilientServerSignoff, vec![]);
            message.client_tag = self.spec.client_tag.clone();
            message.client_address = self.spec.reply_address.clone();
            let grace = self.config.ack_timeout.min(Duration::from_secs(1));
            let _ = tokio::time::timeout(grace, async {
                connection.send(message).await?;
                connection.recv_ack().await
            })
            .await;
        }
    }
}

/// Send one message and wait for the server's ack
async fn exchange(
    connection: &mut dyn Connection,
    message: &Message,
    ack_timeout: Duration,
    halt: &CancellationToken,
) -> Result<()> {
    let round_trip = async {
        connection.send(message.clone()).await?;
        connection.recv_ack().await
    };
    let ack = tokio::select! {
        _ = halt.cancelled() => return Err(CumulusError::Halted),
        outcome = tokio::time::timeout(ack_timeout, round_trip) => outcome.map_err(|_| CumulusError::Timeout {
            what: format!("ack for {}", message.kind.name()),
            elapsed_ms: ack_timeout.as_millis() as u64,
        })??,
    };

    match ack.kind {
        MessageKind::ResilientServerAck(Ack { accepted: true, .. }) if ack.message_id == message.message_id => Ok(()),
        MessageKind::ResilientServerAck(Ack { accepted: false, .. }) => Err(CumulusError::Network(format!(
            "{} not accepted",
            message.kind.name()
        ))),
        other => Err(CumulusError::Network(format!(
            "expected ack for {}, got {}",
            message.message_id,
            other.name()
        ))),
    }
}

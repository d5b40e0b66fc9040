//! TCP transport
//!
//! Each frame is length-delimited and carries one encoded `Message`.

use crate::message::Message;
use crate::transport::{Connection, Incoming, Transport, LISTENER_QUEUE_DEPTH};
use async_trait::async_trait;
use bytes::Bytes;
use cumulus_core::error::{CumulusError, Result};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{Framed, FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Largest frame accepted, in bytes
    pub max_frame_length: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_frame_length: 64 * 1024 * 1024, // 64 MB
        }
    }
}

fn network_err(context: &str, e: impl std::fmt::Display) -> CumulusError {
    CumulusError::Network(format!("{}: {}", context, e))
}

/// Transport over plain TCP sockets
pub struct TcpTransport {
    config: TcpConfig,
    /// Push connections: address -> sink
    push_sinks: Mutex<HashMap<String, FramedWrite<TcpStream, LengthDelimitedCodec>>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::with_config(TcpConfig::default())
    }

    pub fn with_config(config: TcpConfig) -> Self {
        Self {
            config,
            push_sinks: Mutex::new(HashMap::new()),
        }
    }

    fn codec(&self) -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .max_frame_length(self.config.max_frame_length)
            .new_codec()
    }

    async fn open_stream(&self, address: &str) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| CumulusError::Timeout {
                what: format!("connect to {}", address),
                elapsed_ms: self.config.connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| network_err(&format!("connect to {}", address), e))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

async fn serve_session(stream: TcpStream, codec: LengthDelimitedCodec, incoming: mpsc::Sender<Incoming>) {
    let mut framed = Framed::new(stream, codec);
    while let Some(frame) = framed.next().await {
        let message = match frame.map_err(CumulusError::from).and_then(|f| Message::decode(&f)) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping session after bad frame");
                return;
            }
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if incoming.send(Incoming { message, ack: ack_tx }).await.is_err() {
            return;
        }
        let Ok(ack) = ack_rx.await else {
            return;
        };
        let sent = match ack.encode() {
            Ok(encoded) => framed.send(encoded).await.map_err(CumulusError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            debug!(error = %e, "Session closed while acking");
            return;
        }
    }
}

async fn serve_pull(stream: TcpStream, codec: LengthDelimitedCodec, pulled: mpsc::Sender<Message>) {
    let mut reader = FramedRead::new(stream, codec);
    while let Some(frame) = reader.next().await {
        match frame.map_err(CumulusError::from).and_then(|f| Message::decode(&f)) {
            Ok(message) => {
                if pulled.send(message).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "Dropping push connection after bad frame");
                return;
            }
        }
    }
}

struct TcpConnection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&mut self, message: Message) -> Result<()> {
        let encoded = message.encode()?;
        self.framed.send(encoded).await.map_err(|e| network_err("send", e))
    }

    async fn recv_ack(&mut self) -> Result<Message> {
        match self.framed.next().await {
            Some(Ok(frame)) => Message::decode(&frame),
            Some(Err(e)) => Err(network_err("receive ack", e)),
            None => Err(CumulusError::Network("session closed".to_string())),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn bind_server(&self, address: &str) -> Result<mpsc::Receiver<Incoming>> {
        let listener = TcpListener::bind(address).await?;
        info!(address, "Listening for requests");
        let (tx, rx) = mpsc::channel(LISTENER_QUEUE_DEPTH);
        let codec = self.codec();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "Accepted request session");
                            tokio::spawn(serve_session(stream, codec.clone(), tx.clone()));
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    },
                    _ = tx.closed() => break,
                }
            }
        });
        Ok(rx)
    }

    async fn bind_pull(&self, address: &str) -> Result<mpsc::Receiver<Message>> {
        let listener = TcpListener::bind(address).await?;
        info!(address, "Listening for replies");
        let (tx, rx) = mpsc::channel(LISTENER_QUEUE_DEPTH);
        let codec = self.codec();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            tokio::spawn(serve_pull(stream, codec.clone(), tx.clone()));
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    },
                    _ = tx.closed() => break,
                }
            }
        });
        Ok(rx)
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn Connection>> {
        let stream = self.open_stream(address).await?;
        Ok(Box::new(TcpConnection {
            framed: Framed::new(stream, self.codec()),
        }))
    }

    async fn push(&self, address: &str, message: Message) -> Result<()> {
        let encoded: Bytes = message.encode()?;
        let mut sinks = self.push_sinks.lock().await;

        if let Some(sink) = sinks.get_mut(address) {
            if sink.send(encoded.clone()).await.is_ok() {
                return Ok(());
            }
            debug!(address, "Cached push connection failed, reconnecting");
            sinks.remove(address);
        }

        let stream = self.open_stream(address).await?;
        let mut sink = FramedWrite::new(stream, self.codec());
        sink.send(encoded).await.map_err(|e| network_err("push", e))?;
        sinks.insert(address.to_string(), sink);
        Ok(())
    }
}

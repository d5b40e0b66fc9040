//! Cumulus Network Layer
//!
//! Reliable node-to-node messaging for Cumulus storage nodes:
//! - **Messages**: tagged control records plus binary body segments
//! - **Transports**: in-process (`MemoryNetwork`) and TCP (`TcpTransport`)
//! - **Resilient channel**: handshake, single outstanding request, ack
//!   timeouts, reconnect and duplicate suppression
//! - **Deliverator**: routes pushed replies back to waiting callers
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────── node A ────────────────┐      ┌──────── node B ─────────┐
//! │                                        │      │                         │
//! │  caller ──► ResilientClient ──────────────────────► ResilientServer     │
//! │    ▲         (queue, acks)   request/ack session     (dedup, acks)      │
//! │    │                                   │      │          │              │
//! │    │                                   │      │          ▼              │
//! │  Deliverator ◄── reply listener ◄──────────────── handler send_reply   │
//! │                    (pull address)   push      │                         │
//! └────────────────────────────────────────┘      └─────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use cumulus_network::{ClientSpec, Deliverator, MemoryNetwork, ResilientClient};
//! use std::sync::Arc;
//!
//! let transport = Arc::new(MemoryNetwork::new());
//! let deliverator = Deliverator::new();
//! let client = ResilientClient::spawn(spec, transport, deliverator, Default::default(), halt);
//! let reply = client.request(kind, body, timeout).await?;
//! ```

pub mod deliverator;
pub mod message;
pub mod resilient_client;
pub mod resilient_server;
pub mod tcp;
pub mod transport;

// Re-exports
pub use deliverator::{spawn_reply_listener, Deliverator, PendingDelivery};
pub use message::{
    Ack, ArchiveRequest, CancelActiveArchives, ConjoinedRequest, DestroyRequest, FileSummary,
    HandoffsReply, Message, MessageKind, PurgeRequest, RequestHandoffs, ResultCode, ResultReply,
    RetrieveReply, RetrieveRequest, SegmentRef,
};
pub use resilient_client::{ClientConfig, ClientSpec, ClientStatus, ResilientClient};
pub use resilient_server::{ResilientServer, ServerConfig};
pub use tcp::{TcpConfig, TcpTransport};
pub use transport::{Connection, Incoming, MemoryNetwork, Transport};

/// Network configuration
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub tcp: TcpConfig,
}

/// Client tag a node presents to one of a peer's services
pub fn client_tag(local_node: &str, service: &str, server_node: &str) -> String {
    format!("{}-{}-{}", local_node, service, server_node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_network_config_default() {
        let config = NetworkConfig::default();
        assert_eq!(config.client.ack_timeout, Duration::from_secs(600));
        assert_eq!(config.client.handshake_retry_interval, Duration::from_secs(60));
        assert_eq!(config.client.max_idle, Duration::from_secs(1800));
        assert!(config.server.dedup_window > 0);
    }

    #[test]
    fn test_client_tag() {
        assert_eq!(client_tag("node-01", "writer", "node-04"), "node-01-writer-node-04");
    }
}

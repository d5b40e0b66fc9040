//! Storage node assembly
//!
//! Opens local storage, starts the data writer and data reader services,
//! connects to every node in the cluster and builds the coordinators on top.

use crate::archiver::Archiver;
use crate::config::NodeConfig;
use crate::data_reader::DataReaderService;
use crate::data_writer::DataWriterService;
use crate::handoff::{HandoffClient, HandoffConfig};
use crate::links::{ClusterWriters, DataWriter};
use crate::metrics;
use crate::retriever::{DataReader, Retriever};
use chrono::Utc;
use cumulus_core::error::{CumulusError, Result};
use cumulus_core::{Segmenter, UnifiedIdFactory};
use cumulus_network::{
    client_tag, spawn_reply_listener, ClientSpec, Deliverator, ResilientClient, ResilientServer,
    Transport,
};
use cumulus_storage::{NodeStorage, Reader, VersionVisibility};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct StorageNode {
    name: String,
    storage: NodeStorage,
    archiver: Archiver,
    retriever: Retriever,
    handoff: Arc<HandoffClient>,
    writers: Vec<DataWriter>,
    readers: Vec<DataReader>,
    tasks: Vec<JoinHandle<()>>,
    halt: CancellationToken,
}

impl StorageNode {
    /// Start every service of one node
    ///
    /// `config` must already be validated. The node stops when `halt` is
    /// cancelled or [`StorageNode::shutdown`] is called.
    pub async fn start(config: &NodeConfig, transport: Arc<dyn Transport>, halt: CancellationToken) -> Result<Self> {
        let name = config.node.name.clone();
        let local = config
            .local_node()
            .ok_or_else(|| CumulusError::Configuration(format!("{} is not in the cluster list", name)))?
            .clone();
        let segment_num = config
            .segment_num()
            .ok_or_else(|| CumulusError::Configuration(format!("{} has no segment number", name)))?;
        let network = config.network_config();
        let started_at = Utc::now();

        let storage = NodeStorage::open(config.to_storage_config())?;
        let segmenter = Arc::new(Segmenter::new(config.cluster.min_segments, config.cluster.num_segments)?);
        let mut tasks = Vec::new();

        let (writer_server, writer_requests) = ResilientServer::bind(
            name.clone(),
            &local.writer_address,
            transport.clone(),
            network.server.clone(),
            halt.clone(),
        )
        .await?;
        let writer_service = DataWriterService::new(name.clone(), storage.writer(), writer_server);
        tasks.push(tokio::spawn(writer_service.run(writer_requests, halt.clone())));

        let (reader_server, reader_requests) = ResilientServer::bind(
            name.clone(),
            &local.reader_address,
            transport.clone(),
            network.server.clone(),
            halt.clone(),
        )
        .await?;
        let reader_service = DataReaderService::new(
            name.clone(),
            storage.reader(),
            reader_server,
            segmenter.encoded_block_size(config.archive.block_size),
        )
        .with_idle_timeout(config.retrieve.idle_timeout());
        tasks.push(tokio::spawn(reader_service.run(reader_requests, halt.clone())));

        let deliverator = Deliverator::new();
        let replies = transport.bind_pull(&local.reply_address).await?;
        tasks.push(spawn_reply_listener(replies, deliverator.clone(), halt.clone()));

        let mut writers = Vec::with_capacity(config.cluster.nodes.len());
        let mut readers = Vec::with_capacity(config.cluster.nodes.len());
        for (index, node) in config.cluster.nodes.iter().enumerate() {
            let peer_segment = (index + 1) as u8;
            let writer_client = ResilientClient::spawn(
                ClientSpec {
                    client_tag: client_tag(&name, "writer", &node.name),
                    server_name: node.name.clone(),
                    server_address: node.writer_address.clone(),
                    reply_address: local.reply_address.clone(),
                },
                transport.clone(),
                deliverator.clone(),
                network.client.clone(),
                halt.clone(),
            );
            writers.push(DataWriter::new(writer_client, peer_segment));

            let reader_client = ResilientClient::spawn(
                ClientSpec {
                    client_tag: client_tag(&name, "reader", &node.name),
                    server_name: node.name.clone(),
                    server_address: node.reader_address.clone(),
                    reply_address: local.reply_address.clone(),
                },
                transport.clone(),
                deliverator.clone(),
                network.client.clone(),
                halt.clone(),
            );
            readers.push(DataReader::new(reader_client, peer_segment));
        }

        let visibility: Arc<dyn VersionVisibility> = Arc::new(storage.visibility());
        let cluster_writers = ClusterWriters::new(name.clone(), config.cluster.min_connected, writers.clone());
        let archiver = Archiver::new(
            name.clone(),
            cluster_writers.clone(),
            segmenter.clone(),
            Arc::new(UnifiedIdFactory::new(segment_num as u64)?),
            visibility.clone(),
            config.archive.block_size,
            config.archive.timeout(),
        );
        let retriever = Retriever::new(
            readers.clone(),
            segmenter,
            visibility,
            config.archive.block_size,
            config.retrieve.timeout(),
        );

        let handoff = Arc::new(HandoffClient::new(
            name.clone(),
            writers.clone(),
            readers.clone(),
            storage.catalog.clone(),
            HandoffConfig {
                polling_interval: Duration::from_millis(config.handoff.polling_interval_ms),
                cache_size: config.handoff.cache_size,
                request_timeout: Duration::from_millis(config.handoff.request_timeout_ms),
            },
        ));
        if config.handoff.enabled {
            let handoff = handoff.clone();
            let halt = halt.clone();
            tasks.push(tokio::spawn(async move { handoff.run(halt).await }));
        }

        cluster_writers.announce_startup(started_at, config.archive.timeout());
        metrics::set_node_up(true);
        info!(
            node = %name,
            segment_num,
            writer = %local.writer_address,
            reader = %local.reader_address,
            "Storage node started"
        );

        Ok(Self {
            name,
            storage,
            archiver,
            retriever,
            handoff,
            writers,
            readers,
            tasks,
            halt,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn archiver(&self) -> &Archiver {
        &self.archiver
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn handoff(&self) -> &HandoffClient {
        &self.handoff
    }

    pub fn storage(&self) -> &NodeStorage {
        &self.storage
    }

    pub fn reader(&self) -> Reader {
        self.storage.reader()
    }

    /// Writers and readers currently reachable
    pub fn connected_count(&self) -> (usize, usize) {
        (
            self.writers.iter().filter(|w| w.connected()).count(),
            self.readers.iter().filter(|r| r.connected()).count(),
        )
    }

    /// Wait until at least `count` writers and readers are reachable
    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let (writers, readers) = self.connected_count();
            if writers >= count && readers >= count {
                metrics::set_connected_writers(writers);
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Halt every task and wait for the writer to close its value file
    pub async fn shutdown(self) {
        info!(node = %self.name, "Storage node shutting down");
        self.halt.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(node = %self.name, error = %e, "Task ended abnormally");
            }
        }
        if let Err(e) = self.storage.catalog.flush() {
            warn!(node = %self.name, error = %e, "Catalog flush failed");
        }
        metrics::set_node_up(false);
    }
}

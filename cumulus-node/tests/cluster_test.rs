//! End-to-end cluster tests
//!
//! Ten nodes run in one process over a `MemoryNetwork`. Nodes are made
//! unreachable by refusing every address they listen on.

use cumulus_core::{CumulusError, SegmentStatus};
use cumulus_network::{MemoryNetwork, Transport};
use cumulus_node::{ArchiveSpec, ForwardOutcome, NodeConfig, StorageNode};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const COLLECTION: u32 = 1;

fn node_config(index: usize, dir: &TempDir) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.name = config.cluster.nodes[index].name.clone();
    config.storage.data_dir = dir.path().to_path_buf();
    config.network.ack_timeout_ms = 5_000;
    config.network.handshake_retry_ms = 50;
    config.archive.timeout_ms = 30_000;
    config.retrieve.timeout_ms = 30_000;
    config.handoff.enabled = false;
    config.handoff.request_timeout_ms = 10_000;
    config
}

struct Cluster {
    network: MemoryNetwork,
    configs: Vec<NodeConfig>,
    nodes: Vec<StorageNode>,
    _dirs: Vec<TempDir>,
}

impl Cluster {
    /// Start ten nodes; the listed indexes cannot be reached by anyone
    async fn start(unreachable: &[usize]) -> Self {
        let network = MemoryNetwork::new();
        let dirs: Vec<TempDir> = (0..10).map(|_| TempDir::new().unwrap()).collect();
        let configs: Vec<NodeConfig> = dirs.iter().enumerate().map(|(i, d)| node_config(i, d)).collect();

        let mut cluster = Self {
            network,
            configs,
            nodes: Vec::new(),
            _dirs: dirs,
        };
        for &index in unreachable {
            cluster.set_reachable(index, false);
        }

        let transport: Arc<dyn Transport> = Arc::new(cluster.network.clone());
        for config in &cluster.configs {
            config.validate().unwrap();
            let node = StorageNode::start(config, transport.clone(), CancellationToken::new())
                .await
                .unwrap();
            cluster.nodes.push(node);
        }

        let expected = 10 - unreachable.len();
        assert!(
            cluster.nodes[0]
                .wait_for_connections(expected, Duration::from_secs(10))
                .await,
            "node-01 never reached {} peers",
            expected
        );
        cluster
    }

    fn set_reachable(&self, index: usize, reachable: bool) {
        let node = &self.configs[0].cluster.nodes[index];
        for address in [&node.writer_address, &node.reader_address, &node.reply_address] {
            self.network.set_unreachable(address, !reachable);
        }
    }

    async fn shutdown(self) {
        for node in self.nodes {
            node.shutdown().await;
        }
    }
}

fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_archive_with_two_nodes_down_then_handoff() {
    let cluster = Cluster::start(&[8, 9]).await;
    let node = &cluster.nodes[0];
    let data = test_data(10 * 1024 * 1024);

    let mut session = node
        .archiver()
        .begin(ArchiveSpec::new(COLLECTION, "big/file.bin"))
        .unwrap();
    for chunk in data.chunks(1024 * 1024) {
        session.write(chunk).await.unwrap();
    }
    let archived = session.finish(None).await.unwrap();
    assert_eq!(archived.checksum.size, data.len() as u64);

    let retrieved = node
        .retriever()
        .retrieve_all(COLLECTION, "big/file.bin", None)
        .await
        .unwrap();
    assert_eq!(retrieved.len(), data.len());
    assert!(retrieved.as_ref() == data.as_slice());

    // Backups hold node-09's share until it comes back.
    let held: usize = cluster
        .nodes
        .iter()
        .map(|n| n.storage().catalog.handoff_segments_for("node-09").unwrap().len())
        .sum();
    assert_eq!(held, 2);

    cluster.set_reachable(8, true);
    let returning = &cluster.nodes[8];
    assert!(returning.wait_for_connections(9, Duration::from_secs(10)).await);

    let report = returning.handoff().discover_once().await.unwrap();
    assert_eq!(report.segments, 2);
    let forwarded = returning.handoff().forward_next().await.unwrap();
    assert!(matches!(forwarded, Some(ForwardOutcome::Forwarded { .. })));
    assert!(returning.handoff().forward_next().await.unwrap().is_none());

    let rows = returning
        .reader()
        .get_all_segment_rows_for_key(COLLECTION, "big/file.bin")
        .unwrap();
    assert!(rows.iter().any(|row| {
        row.status == SegmentStatus::Final
            && row.handoff_node_name.is_none()
            && row.segment_num == 9
            && row.unified_id == archived.unified_id
    }));
    for peer in &cluster.nodes {
        assert!(peer
            .storage()
            .catalog
            .handoff_segments_for("node-09")
            .unwrap()
            .is_empty());
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_small_file_byte_range() {
    let cluster = Cluster::start(&[]).await;
    let node = &cluster.nodes[0];
    let data = test_data(100);

    node.archiver()
        .archive_entire(ArchiveSpec::new(COLLECTION, "small"), &data)
        .await
        .unwrap();

    let middle = node
        .retriever()
        .retrieve_bytes(COLLECTION, "small", None, 40, 20)
        .await
        .unwrap();
    assert_eq!(middle.as_ref(), &data[40..60]);

    let whole = node
        .retriever()
        .retrieve_all(COLLECTION, "small", None)
        .await
        .unwrap();
    assert_eq!(whole.as_ref(), data.as_slice());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_archive_is_not_visible() {
    let cluster = Cluster::start(&[]).await;
    let node = &cluster.nodes[0];

    let mut session = node
        .archiver()
        .begin(ArchiveSpec::new(COLLECTION, "abandoned"))
        .unwrap();
    session.write(&test_data(100 * 1024)).await.unwrap();
    session.cancel().await;

    for peer in &cluster.nodes {
        let rows = peer
            .reader()
            .get_all_segment_rows_for_key(COLLECTION, "abandoned")
            .unwrap();
        assert_eq!(rows.len(), 1, "{} rows", peer.name());
        assert_eq!(rows[0].status, SegmentStatus::Cancelled);
    }

    let err = node
        .retriever()
        .retrieve_all(COLLECTION, "abandoned", None)
        .await
        .unwrap_err();
    assert!(matches!(err, CumulusError::RetrieveFailed(_)));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_discovery_forwards_once() {
    let cluster = Cluster::start(&[9]).await;
    let node = &cluster.nodes[0];
    let data = test_data(5000);
    node.archiver()
        .archive_entire(ArchiveSpec::new(COLLECTION, "twice"), &data)
        .await
        .unwrap();

    cluster.set_reachable(9, true);
    let returning = &cluster.nodes[9];
    assert!(returning.wait_for_connections(10, Duration::from_secs(10)).await);

    returning.handoff().discover_once().await.unwrap();
    returning.handoff().discover_once().await.unwrap();
    assert_eq!(returning.handoff().pending_count(), 1);

    let first = returning.handoff().forward_next().await.unwrap();
    assert!(matches!(first, Some(ForwardOutcome::Forwarded { sequences: 1 })));
    assert!(returning.handoff().forward_next().await.unwrap().is_none());

    let report = returning.handoff().discover_once().await.unwrap();
    assert_eq!(report.segments, 0);

    // With node-10 back, all ten shares are available again.
    let whole = node
        .retriever()
        .retrieve_all(COLLECTION, "twice", None)
        .await
        .unwrap();
    assert_eq!(whole.as_ref(), data.as_slice());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_destroy_hides_key() {
    let cluster = Cluster::start(&[]).await;
    let node = &cluster.nodes[0];
    node.archiver()
        .archive_entire(ArchiveSpec::new(COLLECTION, "doomed"), b"short lived")
        .await
        .unwrap();

    node.archiver().destroy(COLLECTION, "doomed", None).await.unwrap();
    assert!(node
        .retriever()
        .retrieve_all(COLLECTION, "doomed", None)
        .await
        .is_err());

    let again = node.archiver().destroy(COLLECTION, "doomed", None).await;
    assert!(matches!(again, Err(CumulusError::NotFound(_))));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_too_few_writers_rejects_archive() {
    let cluster = Cluster::start(&[7, 8, 9]).await;
    let node = &cluster.nodes[0];

    let err = node
        .archiver()
        .archive_entire(ArchiveSpec::new(COLLECTION, "nope"), b"data")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CumulusError::QuorumNotMet {
            achieved: 7,
            required: 8
        }
    ));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conjoined_archive_with_node_down_then_handoff() {
    let cluster = Cluster::start(&[9]).await;
    let node = &cluster.nodes[0];
    let key = "multipart/video.mp4";
    let parts = [test_data(70 * 1024), test_data(5000)];

    let unified_id = node.archiver().start_conjoined(COLLECTION, key).await.unwrap();
    for (index, data) in parts.iter().enumerate() {
        let mut spec = ArchiveSpec::new(COLLECTION, key);
        spec.unified_id = Some(unified_id);
        spec.conjoined_part = index as u32 + 1;
        let archived = node.archiver().archive_entire(spec, data).await.unwrap();
        assert_eq!(archived.unified_id, unified_id);
    }
    node.archiver().finish_conjoined(COLLECTION, key, unified_id).await.unwrap();

    let whole: Vec<u8> = parts.concat();
    let retrieved = node.retriever().retrieve_all(COLLECTION, key, None).await.unwrap();
    assert_eq!(retrieved.as_ref(), whole.as_slice());

    cluster.set_reachable(9, true);
    let returning = &cluster.nodes[9];
    assert!(returning.wait_for_connections(10, Duration::from_secs(10)).await);

    // Two backups each hold both parts and the conjoined row.
    let report = returning.handoff().discover_once().await.unwrap();
    assert_eq!(report.segments, 4);
    assert_eq!(report.conjoined, 2);
    assert_eq!(returning.handoff().pending_count(), 2);
    for _ in 0..2 {
        let forwarded = returning.handoff().forward_next().await.unwrap();
        assert!(matches!(forwarded, Some(ForwardOutcome::Forwarded { .. })));
    }
    assert!(returning.handoff().forward_next().await.unwrap().is_none());

    let conjoined = returning
        .storage()
        .catalog
        .get_conjoined(unified_id, None)
        .unwrap()
        .unwrap();
    assert!(conjoined.is_complete());
    let rows = returning.reader().get_all_segment_rows_for_key(COLLECTION, key).unwrap();
    for part in [1, 2] {
        assert!(rows.iter().any(|row| {
            row.status == SegmentStatus::Final
                && row.handoff_node_name.is_none()
                && row.conjoined_part == part
                && row.segment_num == 10
        }));
    }
    for peer in &cluster.nodes {
        let catalog = &peer.storage().catalog;
        assert!(catalog.handoff_segments_for("node-10").unwrap().is_empty());
        assert!(catalog.handoff_conjoined_for("node-10").unwrap().is_empty());
    }

    let retrieved = returning.retriever().retrieve_all(COLLECTION, key, None).await.unwrap();
    assert_eq!(retrieved.as_ref(), whole.as_slice());

    cluster.shutdown().await;
}

//! Cumulus Storage Node Library
//!
//! Provides the components of one storage node in a Cumulus cluster:
//! - Configuration management
//! - Data writer and data reader services over local storage
//! - Archiver (write coordinator) and Retriever (read coordinator)
//! - Handoff discovery and forwarding for shares written while a node was down
//! - Prometheus metrics

pub mod archiver;
pub mod config;
pub mod data_reader;
pub mod data_writer;
pub mod handoff;
pub mod links;
pub mod metrics;
pub mod node;
pub mod retriever;

pub use archiver::{ArchiveOutcome, ArchiveSession, ArchiveSpec, Archiver};
pub use config::{
    ArchiveSettings, ClusterNode, ClusterSettings, ConfigError, HandoffSettings, LogSettings,
    MetricsSettings, NetworkSettings, NodeConfig, NodeIdentity, RetrieveSettings, StorageSettings,
};
pub use data_reader::DataReaderService;
pub use data_writer::DataWriterService;
pub use handoff::{DiscoveryReport, ForwardOutcome, HandoffClient, HandoffConfig};
pub use links::{ClusterWriters, DataWriter, HandoffWriter, WriterLink};
pub use metrics::init_metrics;
pub use node::StorageNode;
pub use retriever::{DataReader, Retrieval, Retriever};

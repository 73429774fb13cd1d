//! graphvault: continuous incremental backup and restore for a
//! knowledge-graph service
//!
//! Change notifications from request paths flow into a background worker
//! that flushes incremental snapshots on a fixed cadence and takes
//! periodic full backups of the graph and relational stores. Snapshots
//! are gzip-compressed JSON blobs in any [`store::BlobStore`], and the
//! restore engine replays them with graph-id remapping and user upserts.

pub mod config;
pub mod errors;
pub mod graph_export;
pub mod relational_export;
pub mod repository;
pub mod restore;
pub mod snapshot;
pub mod store;
pub mod worker;

pub use config::BackupConfig;
pub use errors::{BackupError, Result};
pub use graph_export::{GraphExporter, GraphSession, MemoryGraph};
pub use relational_export::{MemoryRelational, RelationalExporter, RelationalSession};
pub use repository::BackupRepository;
pub use restore::{RestoreEngine, RestoreOptions, RestoreSummary};
pub use snapshot::{BackupKind, ChangeEvent, ChangeType, SnapshotMetadata, SnapshotPayload};
pub use store::{BlobInfo, BlobStore, FsBlobStore, MemoryBlobStore};
pub use worker::{BackupWorker, WorkerState, WorkerStatus};

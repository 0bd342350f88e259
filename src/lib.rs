//! db-relay Library
//!
//! Batch lifecycle and conflict-resolving apply pipeline for database
//! replication between nodes. Exposed as a library for the binary and the
//! integration tests.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod protocol;

// Re-export commonly used types
pub use application::{AcknowledgeService, DataLoaderService, PushService, RouterService};
pub use config::load_config;
pub use domain::entities::{BatchAck, ChangeRecord, Conflict, IncomingBatch, Node, OutgoingBatch};
pub use domain::ports::{BatchRepository, ChangeLog, ClusterService, TargetDatabase, TransportManager};
pub use domain::services::{BatchAccumulator, BatchStateMachine, DatabaseWriter, WriterSettings};
pub use domain::value_objects::{BatchStatus, DataEventType, NodeId};

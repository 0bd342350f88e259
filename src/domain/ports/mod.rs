//! Ports - Interfaces between the domain and the outside world
//!
//! Outbound ports are implemented by adapters under `adapters::outbound`.

mod batch_repository;
mod change_log;
mod cluster_service;
mod node_repository;
mod parameter_store;
mod retransform;
mod script_engine;
mod target_database;
mod transport;
mod writer_listener;

pub use batch_repository::{BatchRepository, IncomingBatchRepository};
pub use change_log::{ChangeLog, UnbatchedEvent};
pub use cluster_service::{actions, ClusterService, COMMON_LOCK_ID};
pub use node_repository::NodeRepository;
pub use parameter_store::{keys, ParameterStore};
pub use retransform::Retransform;
pub use script_engine::{ScriptEngine, SOURCE_NODE_ID, TARGET_NODE_ID};
pub use target_database::{Assignments, TargetDatabase};
pub use transport::{OutgoingTransport, TransportManager};
pub use writer_listener::DatabaseWriterListener;

mod dashmap_parameter_store;
mod http_transport;
mod memory_node_repository;
mod sqlite_batch_store;
mod sqlite_cluster_service;
mod sqlite_target_database;

pub use dashmap_parameter_store::DashMapParameterStore;
pub use http_transport::{HttpPushTransport, HttpTransportConfig, HttpTransportManager};
pub use memory_node_repository::MemoryNodeRepository;
pub use sqlite_batch_store::SqliteBatchStore;
pub use sqlite_cluster_service::SqliteClusterService;
pub use sqlite_target_database::SqliteTargetDatabase;

//! Application layer - use cases over the domain ports

mod acknowledge_service;
mod data_loader_service;
mod push_service;
mod router_service;

pub use acknowledge_service::{AckSummary, AcknowledgeService};
pub use data_loader_service::DataLoaderService;
pub use push_service::{PushCycle, PushOutcome, PushService, RELOAD_CHANNEL};
pub use router_service::RouterService;

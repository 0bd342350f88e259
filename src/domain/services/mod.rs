//! Domain Services - Pure batch and apply logic
//!
//! Nothing here touches I/O directly; storage and the target database are
//! reached through the ports.

pub mod batch_accumulator;
pub mod batch_state;
pub mod column_transforms;
pub mod conflict_resolver;
pub mod database_writer;
pub mod transform_engine;

pub use batch_accumulator::{BatchAccumulator, BatchSelection};
pub use batch_state::BatchStateMachine;
pub use column_transforms::{ColumnTransformRegistry, TransformKind};
pub use conflict_resolver::{ConflictDetector, ConflictResolver, Resolution};
pub use database_writer::{BatchFailure, DatabaseWriter, RowChange, WriterSettings};
pub use transform_engine::{SourceRow, TransformEngine};

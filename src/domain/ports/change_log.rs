//! Change Log Port
//!
//! Append-only log the capture subsystem writes to.

use crate::domain::entities::{ChangeRecord, TableHistory};
use crate::domain::value_objects::NodeId;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// A change-log row routed to a node but not yet placed in a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct UnbatchedEvent {
    pub data_id: i64,
    pub channel_id: String,
    pub create_time: DateTime<Utc>,
}

pub trait ChangeLog: Send + Sync {
    /// Return the active snapshot for `trigger_id`, creating and activating
    /// a new one when the table shape changed.
    fn register_table_history(
        &self,
        trigger_id: &str,
        table: &str,
        columns: &[String],
        pk_columns: &[String],
    ) -> Result<Arc<TableHistory>>;

    /// Append a record routed to `targets`. Returns the assigned data id.
    fn append(&self, record: &ChangeRecord, targets: &[NodeId]) -> Result<i64>;

    /// Routed rows for `node_id` not yet in a batch, ascending data id.
    fn unbatched(&self, node_id: &NodeId) -> Result<Vec<UnbatchedEvent>>;
}

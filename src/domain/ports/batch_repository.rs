//! Batch Repository Ports
//!
//! Storage for outgoing batches, their history, and the receiving-side
//! ledger of loaded batches.

use crate::domain::entities::{BatchHistory, ChangeRecord, IncomingBatch, OutgoingBatch};
use crate::domain::value_objects::{BatchStatus, BatchType, NodeId};
use anyhow::Result;

/// Sending-side batch storage.
pub trait BatchRepository: Send + Sync {
    /// Batches for `node_id` in NEW or ERROR status, ordered by batch id.
    fn pending_batches(&self, node_id: &NodeId) -> Result<Vec<OutgoingBatch>>;

    fn get_batch(&self, batch_id: i64) -> Result<Option<OutgoingBatch>>;

    /// Records of a batch in extraction order (ascending data id).
    fn records_for_batch(&self, batch_id: i64) -> Result<Vec<ChangeRecord>>;

    /// Data id of the `line`th (1-based) record in extraction order.
    fn data_id_at_line(&self, batch_id: i64, line: i64) -> Result<Option<i64>>;

    /// Persist a terminal status and append its history row in one
    /// transaction. Returns the number of batch rows updated.
    fn record_outcome(&self, status: BatchStatus, history: &BatchHistory) -> Result<usize>;

    /// Mark a batch OK without sending it and bump its ignore count.
    fn mark_ignored(&self, batch: &OutgoingBatch) -> Result<()>;

    fn history(&self, batch_id: i64) -> Result<Vec<BatchHistory>>;

    /// Create a batch holding the given change-log rows.
    fn create_batch(
        &self,
        node_id: &NodeId,
        channel_id: &str,
        batch_type: BatchType,
        data_ids: &[i64],
    ) -> Result<OutgoingBatch>;
}

/// Receiving-side ledger.
pub trait IncomingBatchRepository: Send + Sync {
    fn find_incoming(&self, batch_id: i64, node_id: &NodeId) -> Result<Option<IncomingBatch>>;

    fn save_incoming(&self, batch: &IncomingBatch) -> Result<()>;
}

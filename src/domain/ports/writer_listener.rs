//! Database Writer Listener Port
//!
//! Callbacks invoked by the apply engine at fixed points of the pipeline.
//! Listeners run in registration order; every method has a no-op default.

use crate::domain::entities::{BatchContext, BatchStatistics, ChangeRecord, Table};
use crate::domain::errors::WriterError;

pub trait DatabaseWriterListener: Send + Sync {
    /// Name of the table to load into instead of `source`, if any.
    fn target_table_name(&self, _ctx: &BatchContext, _source: &Table) -> Option<String> {
        None
    }

    /// Called before a row is written. Returning `false` skips the row.
    fn before_write(&self, _ctx: &BatchContext, _table: &Table, _record: &ChangeRecord) -> bool {
        true
    }

    fn after_write(&self, _ctx: &BatchContext, _table: &Table, _record: &ChangeRecord) {}

    /// Called when a row fails. Returning `true` marks the error handled and
    /// the batch continues.
    fn handle_error(
        &self,
        _ctx: &BatchContext,
        _record: &ChangeRecord,
        _error: &WriterError,
    ) -> bool {
        false
    }

    fn early_commit(&self, _ctx: &BatchContext, _uncommitted_rows: usize) {}

    fn batch_complete(&self, _ctx: &BatchContext, _stats: &BatchStatistics) {}

    fn batch_committed(&self, _ctx: &BatchContext, _stats: &BatchStatistics) {}

    fn batch_rolled_back(&self, _ctx: &BatchContext, _stats: &BatchStatistics, _error: &WriterError) {}
}

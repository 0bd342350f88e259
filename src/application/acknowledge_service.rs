//! Acknowledge Service
//!
//! Applies the per-batch outcomes a remote node reported back. Outcomes are
//! processed in the order received; each status change and its history row
//! are written together.

use crate::domain::entities::BatchAck;
use crate::domain::ports::BatchRepository;
use crate::domain::services::BatchStateMachine;
use crate::domain::value_objects::BatchStatus;
use std::sync::Arc;

/// What happened to a list of acknowledgements.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AckSummary {
    pub ok: usize,
    pub error: usize,
    /// Unknown batches, already-OK batches and storage failures
    pub skipped: usize,
}

impl AckSummary {
    pub fn has_errors(&self) -> bool {
        self.error > 0
    }
}

#[derive(Clone)]
pub struct AcknowledgeService {
    batches: Arc<dyn BatchRepository>,
}

impl AcknowledgeService {
    pub fn new(batches: Arc<dyn BatchRepository>) -> Self {
        Self { batches }
    }

    pub fn ack(&self, acks: &[BatchAck]) -> AckSummary {
        let mut summary = AckSummary::default();
        for ack in acks {
            match self.ack_one(ack) {
                Ok(Some(BatchStatus::Ok)) => summary.ok += 1,
                Ok(Some(_)) => summary.error += 1,
                Ok(None) => summary.skipped += 1,
                Err(e) => {
                    tracing::error!("failed to record ack for batch {}: {:?}", ack.batch_id, e);
                    summary.skipped += 1;
                }
            }
        }
        summary
    }

    fn ack_one(&self, ack: &BatchAck) -> anyhow::Result<Option<BatchStatus>> {
        let Some(mut batch) = self.batches.get_batch(ack.batch_id)? else {
            tracing::warn!("ack for unknown batch {}, ignoring", ack.batch_id);
            return Ok(None);
        };

        let status = match BatchStateMachine::acknowledge(&mut batch, ack) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("ignoring ack: {}", e);
                return Ok(None);
            }
        };

        let failed_data_id = match (ack.ok, ack.localized_line()) {
            (false, Some(line)) => self
                .batches
                .data_id_at_line(batch.batch_id, line)?
                .unwrap_or(0),
            _ => 0,
        };
        let history = BatchStateMachine::history(&batch, ack, failed_data_id);

        let updated = self.batches.record_outcome(status, &history)?;
        if updated == 0 {
            tracing::warn!("batch {} vanished before its ack was recorded", batch.batch_id);
            return Ok(None);
        }

        if status == BatchStatus::Error {
            tracing::warn!(
                "batch {} for {} failed at line {} (data id {})",
                batch.batch_id,
                batch.node_id,
                history.failed_line_number,
                failed_data_id
            );
        } else {
            tracing::debug!("batch {} for {} acknowledged", batch.batch_id, batch.node_id);
        }
        Ok(Some(status))
    }
}

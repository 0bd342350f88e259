//! Batch State Machine
//!
//! `NEW -> SENDING -> {OK, ERROR}`, with ERROR re-entering SENDING on the
//! next pass. SENDING is held in memory by the push that owns the batch;
//! only the terminal states reach storage, each with a history row.

use crate::domain::entities::{BatchAck, BatchHistory, OutgoingBatch};
use crate::domain::errors::StateError;
use crate::domain::value_objects::BatchStatus;
use chrono::Utc;

pub struct BatchStateMachine;

impl BatchStateMachine {
    /// Claim `batches` for sending.
    pub fn begin_sending(batches: &mut [OutgoingBatch]) -> Result<(), StateError> {
        for batch in batches.iter_mut() {
            batch.transition_to(BatchStatus::Sending)?;
        }
        Ok(())
    }

    /// Fold an acknowledgement into `batch`.
    ///
    /// A stored NEW/ERROR batch is taken to be the one the current push
    /// marked SENDING in memory. A batch already OK refuses the
    /// acknowledgement.
    pub fn acknowledge(batch: &mut OutgoingBatch, ack: &BatchAck) -> Result<BatchStatus, StateError> {
        if batch.status.is_pending() {
            batch.transition_to(BatchStatus::Sending)?;
        }
        let next = if ack.ok { BatchStatus::Ok } else { BatchStatus::Error };
        batch.transition_to(next)?;
        Ok(next)
    }

    /// Acknowledge a batch on an ignored channel without sending it.
    pub fn ignore(batch: &mut OutgoingBatch) -> Result<(), StateError> {
        batch.transition_to(BatchStatus::Ok)?;
        batch.ignore_count += 1;
        Ok(())
    }

    /// History row for a terminal transition.
    pub fn history(batch: &OutgoingBatch, ack: &BatchAck, failed_data_id: i64) -> BatchHistory {
        let stats = ack.statistics.unwrap_or_default();
        BatchHistory {
            batch_id: batch.batch_id,
            node_id: batch.node_id.clone(),
            status: if ack.ok { BatchStatus::Ok } else { BatchStatus::Error },
            statement_count: stats.statement_count,
            fallback_insert_count: stats.fallback_insert_count,
            fallback_update_count: stats.fallback_update_count,
            missing_delete_count: stats.missing_delete_count,
            failed_line_number: if ack.ok { 0 } else { ack.localized_line().unwrap_or(0) },
            failed_data_id: if ack.ok { 0 } else { failed_data_id },
            create_time: Utc::now(),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::domain::entities::AckStatistics;
    use crate::domain::value_objects::NodeId;

    fn batch() -> OutgoingBatch {
        OutgoingBatch::new(42, NodeId::new("store-1"), "sales")
    }

    #[test]
    fn test_begin_sending() {
        let mut batches = vec![batch(), batch()];
        BatchStateMachine::begin_sending(&mut batches).unwrap();
        assert!(batches.iter().all(|b| b.status == BatchStatus::Sending));
        assert!(BatchStateMachine::begin_sending(&mut batches).is_err());
    }

    #[test]
    fn test_acknowledge_ok_and_error() {
        let mut b = batch();
        assert_eq!(BatchStateMachine::acknowledge(&mut b, &BatchAck::ok(42)).unwrap(), BatchStatus::Ok);
        assert!(BatchStateMachine::acknowledge(&mut b, &BatchAck::ok(42)).is_err());

        let mut b = batch();
        b.status = BatchStatus::Error;
        assert_eq!(
            BatchStateMachine::acknowledge(&mut b, &BatchAck::error(42, 2)).unwrap(),
            BatchStatus::Error
        );
        assert!(b.error_flag);
    }

    #[test]
    fn test_ignore() {
        let mut b = batch();
        BatchStateMachine::ignore(&mut b).unwrap();
        assert_eq!(b.status, BatchStatus::Ok);
        assert_eq!(b.ignore_count, 1);
    }

    #[test]
    fn test_history_rows() {
        let b = batch();
        let stats = AckStatistics {
            statement_count: 3,
            fallback_insert_count: 1,
            ..Default::default()
        };
        let ok = BatchStateMachine::history(&b, &BatchAck::ok(42).with_statistics(stats), 99);
        assert_eq!(ok.status, BatchStatus::Ok);
        assert_eq!(ok.statement_count, 3);
        assert_eq!(ok.failed_data_id, 0);

        let err = BatchStateMachine::history(&b, &BatchAck::error(42, 2), 1002);
        assert_eq!(err.status, BatchStatus::Error);
        assert_eq!(err.failed_line_number, 2);
        assert_eq!(err.failed_data_id, 1002);

        let unlocalized = BatchStateMachine::history(&b, &BatchAck::error(42, 0), 0);
        assert_eq!(unlocalized.failed_line_number, 0);
        assert_eq!(unlocalized.failed_data_id, 0);
    }
}

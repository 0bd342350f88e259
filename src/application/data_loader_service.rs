//! Data Loader Service
//!
//! Receiving side of a push: parses the payload, applies each batch through
//! a DatabaseWriter, records it in the incoming ledger and answers with
//! acknowledgement lines.

use crate::domain::entities::{AckStatistics, BatchAck, BatchContext, BatchStatistics, IncomingBatch};
use crate::domain::ports::{IncomingBatchRepository, ScriptEngine, TargetDatabase};
use crate::domain::services::{DatabaseWriter, TransformEngine, WriterSettings};
use crate::domain::value_objects::{BatchStatus, NodeId};
use crate::protocol::{encode_acks, read_payload, ParsedBatch};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

const UNKNOWN_NODE: &str = "unknown";

pub struct DataLoaderService {
    local_node_id: NodeId,
    target: Mutex<Box<dyn TargetDatabase>>,
    incoming: Arc<dyn IncomingBatchRepository>,
    settings: Arc<WriterSettings>,
    transforms: Option<Arc<TransformEngine>>,
    script_engine: Option<Arc<dyn ScriptEngine>>,
}

impl DataLoaderService {
    pub fn new(
        local_node_id: NodeId,
        target: Box<dyn TargetDatabase>,
        incoming: Arc<dyn IncomingBatchRepository>,
        settings: Arc<WriterSettings>,
    ) -> Self {
        Self {
            local_node_id,
            target: Mutex::new(target),
            incoming,
            settings,
            transforms: None,
            script_engine: None,
        }
    }

    pub fn with_transforms(mut self, engine: Arc<TransformEngine>) -> Self {
        self.transforms = Some(engine);
        self
    }

    pub fn with_script_engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.script_engine = Some(engine);
        self
    }

    /// Load a push payload and return the acknowledgement lines.
    pub fn load_payload(&self, payload: &str) -> Vec<String> {
        encode_acks(&self.load(payload))
    }

    /// Load a push payload, one acknowledgement per batch attempted.
    ///
    /// After a batch fails, later batches on the same channel are left
    /// unacknowledged so the sender resends them in order. A batch the
    /// payload broke off inside is acked as an error at row 0.
    pub fn load(&self, payload: &str) -> Vec<BatchAck> {
        let parsed = match read_payload(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::error!("rejecting unreadable payload: {}", e);
                return Vec::new();
            }
        };
        let source = parsed
            .source_node_id
            .unwrap_or_else(|| NodeId::new(UNKNOWN_NODE));

        let mut failed_channels: HashSet<String> = HashSet::new();
        let mut acks = Vec::with_capacity(parsed.batches.len());
        for batch in &parsed.batches {
            if failed_channels.contains(&batch.channel_id) {
                tracing::debug!(
                    "batch {} held back behind a failed batch on {}",
                    batch.batch_id,
                    batch.channel_id
                );
                continue;
            }
            let ack = self.load_batch(&source, batch);
            if !ack.ok {
                failed_channels.insert(batch.channel_id.clone());
            }
            acks.push(ack);
        }

        if let Some(error) = &parsed.error {
            tracing::error!("payload from {} stopped parsing: {}", source, error);
        }
        if let Some(failed) = &parsed.failed {
            if failed_channels.insert(failed.channel_id.clone()) {
                let mut ledger = IncomingBatch::new(failed.batch_id, source.clone(), failed.channel_id.clone());
                ledger.status = BatchStatus::Error;
                ledger.failed_row_number = 0;
                self.save(&ledger);
                acks.push(BatchAck::error(failed.batch_id, 0));
            }
        }
        acks
    }

    fn load_batch(&self, source: &NodeId, batch: &ParsedBatch) -> BatchAck {
        match self.incoming.find_incoming(batch.batch_id, source) {
            Ok(Some(done)) if done.status == BatchStatus::Ok => {
                tracing::info!("batch {} from {} already loaded", batch.batch_id, source);
                return BatchAck::ok(batch.batch_id).with_statistics(AckStatistics {
                    statement_count: done.statement_count,
                    fallback_insert_count: done.fallback_insert_count,
                    fallback_update_count: done.fallback_update_count,
                    missing_delete_count: done.missing_delete_count,
                });
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("incoming ledger lookup failed for batch {}: {:?}", batch.batch_id, e);
                return BatchAck::error(batch.batch_id, 0);
            }
        }

        let mut ledger = IncomingBatch::new(batch.batch_id, source.clone(), batch.channel_id.clone());
        if batch.ignored {
            ledger.ignore_count = 1;
            self.save(&ledger);
            return BatchAck::ok(batch.batch_id);
        }

        let ctx = BatchContext::new(
            batch.batch_id,
            batch.channel_id.clone(),
            source.clone(),
            self.local_node_id.clone(),
        );
        let result = {
            let mut target = self.target.lock();
            let mut writer = DatabaseWriter::new(target.as_mut(), self.settings.clone());
            if let Some(engine) = &self.transforms {
                writer = writer.with_transforms(engine.clone());
            }
            if let Some(engine) = &self.script_engine {
                writer = writer.with_script_engine(engine.clone());
            }
            writer.apply(ctx, &batch.records)
        };

        match result {
            Ok(stats) => {
                fill_ledger(&mut ledger, &stats);
                ledger.status = BatchStatus::Ok;
                self.save(&ledger);
                BatchAck::ok(batch.batch_id).with_statistics(stats.to_ack_statistics())
            }
            Err(failure) => {
                fill_ledger(&mut ledger, &failure.statistics);
                ledger.status = BatchStatus::Error;
                ledger.failed_row_number = failure.line_number;
                self.save(&ledger);
                BatchAck::error(batch.batch_id, failure.line_number)
                    .with_statistics(failure.statistics.to_ack_statistics())
            }
        }
    }

    fn save(&self, ledger: &IncomingBatch) {
        if let Err(e) = self.incoming.save_incoming(ledger) {
            tracing::error!("failed to record incoming batch {}: {:?}", ledger.batch_id, e);
        }
    }
}

fn fill_ledger(ledger: &mut IncomingBatch, stats: &BatchStatistics) {
    ledger.statement_count = stats.statement_count;
    ledger.fallback_insert_count = stats.fallback_insert_count;
    ledger.fallback_update_count = stats.fallback_update_count;
    ledger.missing_delete_count = stats.missing_delete_count;
    ledger.ignore_count = stats.ignore_row_count;
    ledger.last_update_time = Utc::now();
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::{SqliteBatchStore, SqliteTargetDatabase};
    use tempfile::NamedTempFile;

    const PAYLOAD: &str = "nodeid,corp\n\
        binary,NONE\n\
        channel,sales\n\
        batch,42\n\
        table,customer\n\
        keys,id\n\
        columns,id,name\n\
        insert,\"1\",\"ann\"\n\
        insert,\"2\",\"bob\"\n\
        commit,42\n";

    fn loader() -> (NamedTempFile, Arc<SqliteBatchStore>, DataLoaderService) {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(SqliteBatchStore::new(temp.path().to_str().unwrap()));
        store.init_db().unwrap();

        let target = SqliteTargetDatabase::open_in_memory().unwrap();
        target
            .connection()
            .execute_batch("CREATE TABLE customer (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();

        let service = DataLoaderService::new(
            NodeId::new("store-1"),
            Box::new(target),
            store.clone(),
            Arc::new(WriterSettings::default()),
        );
        (temp, store, service)
    }

    #[test]
    fn test_load_payload_acks_and_records_ledger() {
        let (_temp, store, service) = loader();
        let lines = service.load_payload(PAYLOAD);
        assert_eq!(lines[0], "42-ok");
        assert_eq!(lines[1], "42:2:0:0:0");

        let ledger = store.find_incoming(42, &NodeId::new("corp")).unwrap().unwrap();
        assert_eq!(ledger.status, BatchStatus::Ok);
        assert_eq!(ledger.statement_count, 2);
    }

    #[test]
    fn test_replay_of_loaded_batch_is_not_reapplied() {
        let (_temp, _store, service) = loader();
        service.load(PAYLOAD);
        let acks = service.load(PAYLOAD);
        assert!(acks[0].ok);
        // statistics come from the ledger, no fallbacks happened
        assert_eq!(acks[0].statistics.unwrap().fallback_insert_count, 0);
        assert_eq!(acks[0].statistics.unwrap().statement_count, 2);
    }

    #[test]
    fn test_failed_batch_holds_back_channel() {
        let (_temp, store, service) = loader();
        let payload = "nodeid,corp\n\
            channel,sales\n\
            batch,7\n\
            table,missing\n\
            keys,id\n\
            columns,id\n\
            insert,\"1\"\n\
            commit,7\n\
            batch,8\n\
            table,customer\n\
            keys,id\n\
            columns,id,name\n\
            insert,\"3\",\"cy\"\n\
            commit,8\n\
            channel,audit\n\
            batch,9\n\
            table,customer\n\
            keys,id\n\
            columns,id,name\n\
            insert,\"4\",\"di\"\n\
            commit,9\n";
        let acks = service.load(payload);
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0], BatchAck::error(7, 1).with_statistics(Default::default()));
        assert_eq!(acks[1].batch_id, 9);
        assert!(acks[1].ok);

        let ledger = store.find_incoming(7, &NodeId::new("corp")).unwrap().unwrap();
        assert_eq!(ledger.status, BatchStatus::Error);
        assert_eq!(ledger.failed_row_number, 1);
        assert!(store.find_incoming(8, &NodeId::new("corp")).unwrap().is_none());
    }

    #[test]
    fn test_unreadable_payload_acks_nothing() {
        let (_temp, _store, service) = loader();
        assert!(service.load("nodeid,corp\ninsert,\"1\"\n").is_empty());
    }

    #[test]
    fn test_malformed_batch_acks_row_zero_and_keeps_earlier_batch() {
        let (_temp, store, service) = loader();
        let payload = "nodeid,corp\n\
            channel,sales\n\
            batch,1\n\
            table,customer\n\
            keys,id\n\
            columns,id,name\n\
            insert,\"1\",\"ann\"\n\
            commit,1\n\
            channel,audit\n\
            batch,2\n\
            table,customer\n\
            keys,id\n\
            columns,id,name\n\
            insert,\"2\",\"bad\"x\n\
            commit,2\n";
        let acks = service.load(payload);
        assert_eq!(acks.len(), 2);
        assert!(acks[0].ok);
        assert_eq!(acks[0].batch_id, 1);
        assert_eq!(acks[1], BatchAck::error(2, 0));

        let corp = NodeId::new("corp");
        assert_eq!(store.find_incoming(1, &corp).unwrap().unwrap().status, BatchStatus::Ok);
        let failed = store.find_incoming(2, &corp).unwrap().unwrap();
        assert_eq!(failed.status, BatchStatus::Error);
        assert_eq!(failed.failed_row_number, 0);
        assert_eq!(service.load_payload("nodeid,corp\nbatch,3\n"), vec!["3-0".to_string(), String::new()]);
    }
}

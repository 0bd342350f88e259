//! Router Service
//!
//! Cuts routed change-log rows into outgoing batches, per node and channel.
//! A full batch is cut as soon as `max_batch_size` rows are waiting; the
//! remainder waits until its oldest row is older than the channel's flush
//! interval.

use crate::domain::entities::OutgoingBatch;
use crate::domain::ports::{BatchRepository, ChangeLog, NodeRepository, UnbatchedEvent};
use crate::domain::value_objects::BatchType;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::sync::Arc;

const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

pub struct RouterService {
    nodes: Arc<dyn NodeRepository>,
    change_log: Arc<dyn ChangeLog>,
    batches: Arc<dyn BatchRepository>,
}

impl RouterService {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        change_log: Arc<dyn ChangeLog>,
        batches: Arc<dyn BatchRepository>,
    ) -> Self {
        Self {
            nodes,
            change_log,
            batches,
        }
    }

    /// Batch waiting rows for every push target. Returns the batches created.
    pub fn route(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<OutgoingBatch>> {
        let mut created = Vec::new();
        for node in self.nodes.push_targets() {
            let events = self.change_log.unbatched(&node.node_id)?;
            if events.is_empty() {
                continue;
            }
            let channels = self.nodes.node_channels(&node.node_id);

            let mut by_channel: IndexMap<String, Vec<UnbatchedEvent>> = IndexMap::new();
            for event in events {
                by_channel.entry(event.channel_id.clone()).or_default().push(event);
            }

            for (channel_id, events) in by_channel {
                let policy = channels.iter().find(|c| c.channel_id == channel_id);
                let max_size = policy
                    .map(|c| c.max_batch_size)
                    .filter(|s| *s > 0)
                    .unwrap_or(DEFAULT_MAX_BATCH_SIZE);
                let flush_millis = policy.map(|c| c.batch_flush_millis).unwrap_or(0);

                for chunk in events.chunks(max_size) {
                    if chunk.len() < max_size && !flush_due(chunk, flush_millis, now) {
                        tracing::debug!(
                            "{} row(s) for {} on {} wait for a full batch",
                            chunk.len(),
                            node.node_id,
                            channel_id
                        );
                        continue;
                    }
                    let ids: Vec<i64> = chunk.iter().map(|e| e.data_id).collect();
                    let batch = self
                        .batches
                        .create_batch(&node.node_id, &channel_id, BatchType::Events, &ids)?;
                    tracing::debug!(
                        "routed {} row(s) to batch {} for {} on {}",
                        ids.len(),
                        batch.batch_id,
                        node.node_id,
                        channel_id
                    );
                    created.push(batch);
                }
            }
        }
        if !created.is_empty() {
            tracing::info!("created {} batch(es)", created.len());
        }
        Ok(created)
    }
}

fn flush_due(chunk: &[UnbatchedEvent], flush_millis: i64, now: DateTime<Utc>) -> bool {
    if flush_millis <= 0 {
        return true;
    }
    chunk
        .iter()
        .map(|e| e.create_time)
        .min()
        .map(|oldest| (now - oldest).num_milliseconds() >= flush_millis)
        .unwrap_or(false)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::{MemoryNodeRepository, SqliteBatchStore};
    use crate::domain::entities::{ChangeRecord, Node, NodeChannel};
    use crate::domain::value_objects::{DataEventType, NodeId};
    use chrono::Duration;
    use tempfile::NamedTempFile;

    fn setup(max_batch_size: usize, flush_millis: i64) -> (NamedTempFile, Arc<SqliteBatchStore>, RouterService) {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(SqliteBatchStore::new(temp.path().to_str().unwrap()));
        store.init_db().unwrap();

        let nodes = MemoryNodeRepository::new(Node::new("corp", "corp"));
        nodes.add_push_target(Node::new("store-1", "store"));
        let mut channel = NodeChannel::new(NodeId::new("store-1"), "sales", 1);
        channel.max_batch_size = max_batch_size;
        channel.batch_flush_millis = flush_millis;
        nodes.set_channel(channel);

        let router = RouterService::new(Arc::new(nodes), store.clone(), store.clone());
        (temp, store, router)
    }

    fn capture(store: &SqliteBatchStore, rows: usize, created: DateTime<Utc>) {
        let history = store
            .register_table_history("customer", "customer", &["id".into()], &["id".into()])
            .unwrap();
        for i in 0..rows {
            let record = ChangeRecord::new(DataEventType::Insert, history.clone())
                .with_row(vec![Some(i.to_string())])
                .with_channel("sales")
                .with_create_time(created);
            store.append(&record, &[NodeId::new("store-1")]).unwrap();
        }
    }

    #[test]
    fn test_full_batches_are_cut() {
        let (_temp, store, router) = setup(2, 60_000);
        let now = Utc::now();
        capture(&store, 5, now);

        let created = router.route(now).unwrap();
        assert_eq!(created.len(), 2);
        assert!(created.iter().all(|b| b.data_event_count == 2));
        // one row still waits
        assert_eq!(store.unbatched(&NodeId::new("store-1")).unwrap().len(), 1);
    }

    #[test]
    fn test_partial_batch_flushed_when_old() {
        let (_temp, store, router) = setup(10, 1_000);
        let created_at = Utc::now() - Duration::seconds(5);
        capture(&store, 3, created_at);

        let created = router.route(Utc::now()).unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].channel_id, "sales");
        assert_eq!(store.records_for_batch(created[0].batch_id).unwrap().len(), 3);
        assert!(router.route(Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn test_zero_flush_cuts_immediately() {
        let (_temp, store, router) = setup(10, 0);
        capture(&store, 1, Utc::now());
        assert_eq!(router.route(Utc::now()).unwrap().len(), 1);
    }
}

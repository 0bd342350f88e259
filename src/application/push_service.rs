//! Push Service
//!
//! One push cycle: take the PUSH lock, then for each target node select
//! pending batches, stream them over a transport and fold the returned
//! acknowledgements back into batch state. A failing node never stops the
//! cycle for the others.
//!
//! The lock, the batch store and ack recording are synchronous SQLite
//! calls, so they run on tokio's blocking pool.

use crate::application::AcknowledgeService;
use crate::domain::entities::{ChangeRecord, Node, OutgoingBatch};
use crate::domain::errors::TransportError;
use crate::domain::ports::{
    actions, BatchRepository, ChangeLog, ClusterService, NodeRepository, TransportManager,
};
use crate::domain::services::{BatchAccumulator, BatchStateMachine};
use crate::domain::value_objects::{BatchType, DataEventType};
use crate::protocol::{decode_acks, BatchStreamWriter};
use chrono::Utc;
use std::sync::Arc;

/// Channel reload requests travel on.
pub const RELOAD_CHANNEL: &str = "reload";
const RELOAD_TRIGGER: &str = "reload";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    Error,
    NothingToPush,
}

/// Result of one push cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushCycle {
    pub locked: bool,
    pub outcomes: Vec<(Node, PushOutcome)>,
}

impl PushCycle {
    /// At least one node received batches and none failed.
    pub fn had_useful_work(&self) -> bool {
        self.outcomes.iter().any(|(_, o)| *o == PushOutcome::Pushed)
            && !self.outcomes.iter().any(|(_, o)| *o == PushOutcome::Error)
    }
}

#[derive(Clone)]
pub struct PushService {
    nodes: Arc<dyn NodeRepository>,
    batches: Arc<dyn BatchRepository>,
    change_log: Arc<dyn ChangeLog>,
    cluster: Arc<dyn ClusterService>,
    transports: Arc<dyn TransportManager>,
    acknowledge: AcknowledgeService,
}

impl PushService {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        batches: Arc<dyn BatchRepository>,
        change_log: Arc<dyn ChangeLog>,
        cluster: Arc<dyn ClusterService>,
        transports: Arc<dyn TransportManager>,
    ) -> Self {
        let acknowledge = AcknowledgeService::new(batches.clone());
        Self {
            nodes,
            batches,
            change_log,
            cluster,
            transports,
            acknowledge,
        }
    }

    pub async fn push_data(&self) -> PushCycle {
        let local = self.nodes.identity();
        let scope = local.node_id.to_string();
        let lock_scope = scope.clone();
        match self.blocking(move |s| Ok(s.cluster.lock(actions::PUSH, &lock_scope))).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("push skipped, another worker holds the lock");
                return PushCycle::default();
            }
            Err(e) => {
                tracing::error!("failed to take the push lock: {:?}", e);
                return PushCycle::default();
            }
        }

        let mut cycle = PushCycle {
            locked: true,
            outcomes: Vec::new(),
        };
        for target in self.nodes.push_targets() {
            let outcome = self.push_to_node(&local, &target).await;
            cycle.outcomes.push((target, outcome));
        }

        let unlocked = self
            .blocking(move |s| {
                s.cluster.unlock(actions::PUSH, &scope);
                Ok(())
            })
            .await;
        if let Err(e) = unlocked {
            tracing::error!("failed to release the push lock: {:?}", e);
        }
        cycle
    }

    /// Push pending batches to one node.
    pub async fn push_to_node(&self, local: &Node, target: &Node) -> PushOutcome {
        let prepared = {
            let target = target.clone();
            self.blocking(move |s| s.prepare(&target)).await
        };
        let mut to_send = match prepared {
            Ok(batches) => batches,
            Err(e) => {
                tracing::error!("failed to prepare batches for {}: {:?}", target.node_id, e);
                return PushOutcome::Error;
            }
        };
        if to_send.is_empty() {
            return PushOutcome::NothingToPush;
        }
        if let Err(e) = BatchStateMachine::begin_sending(&mut to_send) {
            tracing::error!("cannot send to {}: {}", target.node_id, e);
            return PushOutcome::Error;
        }

        let rendered = {
            let (local, batches) = (local.clone(), to_send.clone());
            self.blocking(move |s| s.render(&local, &batches)).await
        };
        let payload = match rendered {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("failed to extract batches for {}: {:?}", target.node_id, e);
                return PushOutcome::Error;
            }
        };

        let lines = match self.send(local, target, &payload).await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!("push to {} failed: {}", target.node_id, e);
                return PushOutcome::Error;
            }
        };

        let acks = match decode_acks(&lines) {
            Ok(acks) => acks,
            Err(e) => {
                tracing::warn!("unreadable acknowledgement from {}: {}", target.node_id, e);
                return PushOutcome::Error;
            }
        };
        let summary = match self.blocking(move |s| Ok(s.acknowledge.ack(&acks))).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!("failed to record acknowledgements from {}: {:?}", target.node_id, e);
                return PushOutcome::Error;
            }
        };

        let now = Utc::now();
        let mut channels: Vec<&str> = to_send.iter().map(|b| b.channel_id.as_str()).collect();
        channels.sort_unstable();
        channels.dedup();
        for channel in channels {
            self.nodes.record_extract(&target.node_id, channel, now);
        }

        tracing::info!(
            "pushed {} batch(es) to {}: {} ok, {} error",
            to_send.len(),
            target.node_id,
            summary.ok,
            summary.error
        );
        if summary.has_errors() {
            PushOutcome::Error
        } else {
            PushOutcome::Pushed
        }
    }

    /// Batches to send now: reload batches first, then the accumulator's pick.
    /// Batches on ignored channels are acknowledged here without sending.
    fn prepare(&self, target: &Node) -> anyhow::Result<Vec<OutgoingBatch>> {
        self.queue_initial_load(target)?;

        let (reload, events): (Vec<_>, Vec<_>) = self
            .batches
            .pending_batches(&target.node_id)?
            .into_iter()
            .partition(|b| b.batch_type == BatchType::InitialLoad);

        let channels = self.nodes.node_channels(&target.node_id);
        let windows: Vec<_> = channels
            .iter()
            .flat_map(|c| self.nodes.channel_windows(&c.channel_id))
            .collect();
        let selection = BatchAccumulator::select(events, &channels, &windows, target, Utc::now());

        for mut batch in selection.ignored {
            BatchStateMachine::ignore(&mut batch)?;
            self.batches.mark_ignored(&batch)?;
            tracing::debug!("batch {} on ignored channel {} acknowledged", batch.batch_id, batch.channel_id);
        }

        let mut to_send = reload;
        to_send.extend(selection.to_send);
        Ok(to_send)
    }

    fn queue_initial_load(&self, target: &Node) -> anyhow::Result<()> {
        let Some(security) = self.nodes.node_security(&target.node_id) else {
            return Ok(());
        };
        if !security.initial_load_enabled {
            return Ok(());
        }
        let history = self
            .change_log
            .register_table_history(RELOAD_TRIGGER, RELOAD_TRIGGER, &[], &[])?;
        let record = ChangeRecord::new(DataEventType::Reload, history).with_channel(RELOAD_CHANNEL);
        let data_id = self
            .change_log
            .append(&record, std::slice::from_ref(&target.node_id))?;
        let batch = self.batches.create_batch(
            &target.node_id,
            RELOAD_CHANNEL,
            BatchType::InitialLoad,
            &[data_id],
        )?;
        self.nodes.clear_initial_load(&target.node_id);
        tracing::info!("queued initial load for {} in batch {}", target.node_id, batch.batch_id);
        Ok(())
    }

    fn render(&self, local: &Node, batches: &[OutgoingBatch]) -> anyhow::Result<String> {
        let mut writer = BatchStreamWriter::new(&local.node_id);
        for batch in batches {
            let records = self.batches.records_for_batch(batch.batch_id)?;
            writer.write_batch(batch, &records);
        }
        Ok(writer.finish())
    }

    async fn blocking<T, F>(&self, work: F) -> anyhow::Result<T>
    where
        F: FnOnce(PushService) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let service = self.clone();
        tokio::task::spawn_blocking(move || work(service)).await?
    }

    async fn send(&self, local: &Node, target: &Node, payload: &str) -> Result<Vec<String>, TransportError> {
        let mut transport = self.transports.open_push(target, local).await?;
        let result = match transport.write(payload) {
            Ok(()) => transport.read_response().await,
            Err(e) => Err(e),
        };
        transport.close().await;
        result
    }
}

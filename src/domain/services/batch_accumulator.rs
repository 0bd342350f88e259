//! Batch Accumulator
//!
//! Chooses which pending batches for a node go out on this pass, and in
//! what order.

use crate::domain::entities::{ChannelWindow, Node, NodeChannel, OutgoingBatch};
use crate::domain::value_objects::BatchStatus;
use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use std::collections::HashMap;

/// Result of one selection pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchSelection {
    /// Batches to send now, in send order
    pub to_send: Vec<OutgoingBatch>,
    /// Batches on ignored channels; acknowledge them without sending
    pub ignored: Vec<OutgoingBatch>,
}

pub struct BatchAccumulator;

impl BatchAccumulator {
    /// Order and filter `pending` for `target`.
    ///
    /// Channels holding an ERROR batch come first, oldest error first;
    /// the rest follow by processing order. Suspended, disabled, not-yet-due
    /// and out-of-window channels are deferred. Each channel keeps at most
    /// `max_batch_to_send` batches, lowest batch id first.
    pub fn select(
        pending: Vec<OutgoingBatch>,
        channels: &[NodeChannel],
        windows: &[ChannelWindow],
        target: &Node,
        now: DateTime<Utc>,
    ) -> BatchSelection {
        let mut by_channel: HashMap<String, Vec<OutgoingBatch>> = HashMap::new();
        for batch in pending {
            by_channel.entry(batch.channel_id.clone()).or_default().push(batch);
        }

        let mut ordered: Vec<(&NodeChannel, Option<DateTime<Utc>>)> = channels
            .iter()
            .filter(|c| by_channel.contains_key(&c.channel_id))
            .map(|c| {
                let oldest_error = by_channel[&c.channel_id]
                    .iter()
                    .filter(|b| b.status == BatchStatus::Error)
                    .map(|b| b.last_update_time)
                    .min();
                (c, oldest_error)
            })
            .collect();

        ordered.sort_by(|(a, a_err), (b, b_err)| match (a_err, b_err) {
            (Some(x), Some(y)) => x.cmp(y).then_with(|| a.channel_id.cmp(&b.channel_id)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a
                .processing_order
                .cmp(&b.processing_order)
                .then_with(|| a.channel_id.cmp(&b.channel_id)),
        });

        let local_time = local_time_at(target, now);
        let mut selection = BatchSelection::default();

        for (channel, _) in ordered {
            let Some(mut batches) = by_channel.remove(&channel.channel_id) else {
                continue;
            };
            batches.sort_by_key(|b| b.batch_id);

            if channel.ignored {
                selection.ignored.extend(batches);
                continue;
            }
            if channel.suspended || !channel.enabled {
                tracing::debug!("channel {} is suspended, deferring", channel.channel_id);
                continue;
            }
            if !channel.is_due(now) {
                tracing::debug!("channel {} is not due for extraction", channel.channel_id);
                continue;
            }
            if !in_window(&channel.channel_id, windows, local_time) {
                tracing::debug!(
                    "channel {} is outside its send windows at {}",
                    channel.channel_id,
                    local_time
                );
                continue;
            }
            if channel.max_batch_to_send > 0 {
                batches.truncate(channel.max_batch_to_send);
            }
            selection.to_send.extend(batches);
        }

        for channel_id in by_channel.keys() {
            tracing::debug!(
                "node {} has batches on unconfigured channel {}",
                target.node_id,
                channel_id
            );
        }

        selection
    }
}

fn in_window(channel_id: &str, windows: &[ChannelWindow], time: NaiveTime) -> bool {
    let mut configured = windows
        .iter()
        .filter(|w| w.enabled && w.channel_id == channel_id)
        .peekable();
    if configured.peek().is_none() {
        return true;
    }
    configured.any(|w| w.contains(time))
}

/// Wall-clock time at the target node.
pub fn local_time_at(node: &Node, now: DateTime<Utc>) -> NaiveTime {
    match node.timezone_offset.as_deref().and_then(parse_offset) {
        Some(offset) => now.with_timezone(&offset).time(),
        None => now.time(),
    }
}

/// Parse `+HH:MM`, `-HH:MM`, `+HHMM` or `Z`.
pub fn parse_offset(text: &str) -> Option<FixedOffset> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("z") || text.is_empty() {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match text.as_bytes().first()? {
        b'+' => (1, &text[1..]),
        b'-' => (-1, &text[1..]),
        _ => (1, text),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::domain::value_objects::NodeId;
    use chrono::{Duration, TimeZone};

    fn node() -> Node {
        Node::new("store-1", "store")
    }

    fn batch(id: i64, channel: &str, status: BatchStatus, updated: DateTime<Utc>) -> OutgoingBatch {
        let mut b = OutgoingBatch::new(id, NodeId::new("store-1"), channel);
        b.status = status;
        b.last_update_time = updated;
        b
    }

    fn channel(id: &str, order: i32) -> NodeChannel {
        NodeChannel::new(NodeId::new("store-1"), id, order)
    }

    #[test]
    fn test_error_channel_sorts_first() {
        let now = Utc::now();
        let pending = vec![
            batch(1, "audit", BatchStatus::New, now),
            batch(2, "sales", BatchStatus::Error, now - Duration::minutes(10)),
            batch(3, "sales", BatchStatus::New, now),
        ];
        let channels = vec![channel("audit", 1), channel("sales", 50)];
        let selection = BatchAccumulator::select(pending, &channels, &[], &node(), now);
        let order: Vec<_> = selection.to_send.iter().map(|b| b.channel_id.as_str()).collect();
        assert_eq!(order, vec!["sales", "sales", "audit"]);
    }

    #[test]
    fn test_oldest_error_first() {
        let now = Utc::now();
        let pending = vec![
            batch(1, "a", BatchStatus::Error, now - Duration::minutes(1)),
            batch(2, "b", BatchStatus::Error, now - Duration::minutes(30)),
        ];
        let channels = vec![channel("a", 1), channel("b", 2)];
        let selection = BatchAccumulator::select(pending, &channels, &[], &node(), now);
        assert_eq!(selection.to_send[0].channel_id, "b");
    }

    #[test]
    fn test_processing_order_without_errors() {
        let now = Utc::now();
        let pending = vec![batch(1, "late", BatchStatus::New, now), batch(2, "early", BatchStatus::New, now)];
        let channels = vec![channel("late", 10), channel("early", 1)];
        let selection = BatchAccumulator::select(pending, &channels, &[], &node(), now);
        assert_eq!(selection.to_send[0].channel_id, "early");
    }

    #[test]
    fn test_max_batch_to_send_keeps_lowest_ids() {
        let now = Utc::now();
        let pending = (1..=5).rev().map(|i| batch(i, "sales", BatchStatus::New, now)).collect();
        let mut sales = channel("sales", 1);
        sales.max_batch_to_send = 2;
        let selection = BatchAccumulator::select(pending, &[sales], &[], &node(), now);
        let ids: Vec<_> = selection.to_send.iter().map(|b| b.batch_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_suspended_and_ignored_channels() {
        let now = Utc::now();
        let pending = vec![batch(1, "held", BatchStatus::New, now), batch(2, "noise", BatchStatus::New, now)];
        let mut held = channel("held", 1);
        held.suspended = true;
        let mut noise = channel("noise", 2);
        noise.ignored = true;
        let selection = BatchAccumulator::select(pending, &[held, noise], &[], &node(), now);
        assert!(selection.to_send.is_empty());
        assert_eq!(selection.ignored.len(), 1);
        assert_eq!(selection.ignored[0].batch_id, 2);
    }

    #[test]
    fn test_inactive_channel_is_deferred() {
        let now = Utc::now();
        let mut sales = channel("sales", 1);
        sales.extract_period_millis = Some(60_000);
        sales.last_extract_time = Some(now - Duration::seconds(5));
        let selection =
            BatchAccumulator::select(vec![batch(1, "sales", BatchStatus::New, now)], &[sales], &[], &node(), now);
        assert!(selection.to_send.is_empty());
        assert!(selection.ignored.is_empty());
    }

    #[test]
    fn test_window_uses_target_timezone() {
        // 01:00 UTC is 03:00 at +02:00, inside a 02:00-04:00 window
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 1, 0, 0).unwrap();
        let window = ChannelWindow::new(
            "sales",
            NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
        );
        let pending = || vec![batch(1, "sales", BatchStatus::New, now)];

        let utc_node = node();
        let selection = BatchAccumulator::select(pending(), &[channel("sales", 1)], &[window.clone()], &utc_node, now);
        assert!(selection.to_send.is_empty());

        let shifted = node().with_timezone_offset("+02:00");
        let selection = BatchAccumulator::select(pending(), &[channel("sales", 1)], &[window], &shifted, now);
        assert_eq!(selection.to_send.len(), 1);
    }

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("+02:00").unwrap().local_minus_utc(), 7200);
        assert_eq!(parse_offset("-0530").unwrap().local_minus_utc(), -(5 * 3600 + 30 * 60));
        assert_eq!(parse_offset("Z").unwrap().local_minus_utc(), 0);
        assert!(parse_offset("bogus").is_none());
    }
}

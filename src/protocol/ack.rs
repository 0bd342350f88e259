//! Acknowledgement codec (Sans-IO).
//!
//! Two response lines. The first lists `batchId-status` tokens, where the
//! status is `ok` or the 1-based row that failed (`0` when unknown). The
//! second carries per-batch statistics as
//! `batchId:statements:fallbackInserts:fallbackUpdates:missingDeletes`.

use crate::domain::entities::{AckStatistics, BatchAck};
use crate::domain::errors::ProtocolError;

const OK: &str = "ok";

/// Encode acknowledgements as response lines.
pub fn encode_acks(acks: &[BatchAck]) -> Vec<String> {
    let status = acks
        .iter()
        .map(|a| {
            if a.ok {
                format!("{}-{}", a.batch_id, OK)
            } else {
                format!("{}-{}", a.batch_id, a.failed_line_number.unwrap_or(0))
            }
        })
        .collect::<Vec<_>>()
        .join(",");
    let extended = acks
        .iter()
        .filter_map(|a| {
            a.statistics.map(|s| {
                format!(
                    "{}:{}:{}:{}:{}",
                    a.batch_id,
                    s.statement_count,
                    s.fallback_insert_count,
                    s.fallback_update_count,
                    s.missing_delete_count
                )
            })
        })
        .collect::<Vec<_>>()
        .join(",");
    vec![status, extended]
}

/// Decode response lines, keeping the order of the status line.
pub fn decode_acks(lines: &[String]) -> Result<Vec<BatchAck>, ProtocolError> {
    let Some(status) = lines.first() else {
        return Ok(Vec::new());
    };
    let mut acks = Vec::new();
    for token in tokens(status) {
        acks.push(decode_status(token)?);
    }

    if let Some(extended) = lines.get(1) {
        for token in tokens(extended) {
            let (batch_id, stats) = decode_statistics(token)?;
            for ack in acks.iter_mut().filter(|a| a.batch_id == batch_id) {
                ack.statistics = Some(stats);
            }
        }
    }
    Ok(acks)
}

fn tokens(line: &str) -> impl Iterator<Item = &str> {
    line.split(',').map(str::trim).filter(|t| !t.is_empty())
}

fn decode_status(token: &str) -> Result<BatchAck, ProtocolError> {
    let invalid = || ProtocolError::InvalidAck(token.to_string());
    let (id, status) = token.split_once('-').ok_or_else(invalid)?;
    let batch_id: i64 = id.trim().parse().map_err(|_| invalid())?;
    let status = status.trim();
    if status.eq_ignore_ascii_case(OK) {
        return Ok(BatchAck::ok(batch_id));
    }
    if status.eq_ignore_ascii_case("er") {
        return Ok(BatchAck::error(batch_id, 0));
    }
    let line: i64 = status.parse().map_err(|_| invalid())?;
    Ok(BatchAck::error(batch_id, line))
}

fn decode_statistics(token: &str) -> Result<(i64, AckStatistics), ProtocolError> {
    let parts: Vec<i64> = token
        .split(':')
        .map(|p| p.trim().parse::<i64>())
        .collect::<Result<_, _>>()
        .map_err(|_| ProtocolError::InvalidAck(token.to_string()))?;
    match parts.as_slice() {
        [id, statements, inserts, updates, deletes] => Ok((
            *id,
            AckStatistics {
                statement_count: *statements,
                fallback_insert_count: *inserts,
                fallback_update_count: *updates,
                missing_delete_count: *deletes,
            },
        )),
        _ => Err(ProtocolError::InvalidAck(token.to_string())),
    }
}

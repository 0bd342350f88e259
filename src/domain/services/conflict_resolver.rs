//! Conflict detection and resolution policy for the apply engine.

use crate::domain::entities::{ColumnValues, Conflict, Table};
use crate::domain::services::database_writer::RowChange;
use crate::domain::value_objects::{DetectConflict, ResolveConflict};

/// What the writer does with a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Reapply matching by primary key only, inserting if the row vanished
    FallbackToKey,
    /// Drop the row and count it
    Ignore,
    /// Fail the batch
    Escalate,
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Most specific conflict matching `table` and `channel`, else `default`.
    pub fn pick<'c>(conflicts: &'c [Conflict], default: &'c Conflict, table: &str, channel: &str) -> &'c Conflict {
        conflicts
            .iter()
            .filter(|c| c.matches_table(table) && c.matches_channel(channel))
            .max_by_key(|c| c.specificity())
            .unwrap_or(default)
    }

    pub fn plan(conflict: &Conflict) -> Resolution {
        match conflict.resolve_type {
            ResolveConflict::Fallback => Resolution::FallbackToKey,
            ResolveConflict::Ignore => Resolution::Ignore,
            ResolveConflict::Manual => Resolution::Escalate,
        }
    }
}

pub struct ConflictDetector;

impl ConflictDetector {
    /// WHERE clause for an UPDATE or DELETE: the primary key plus whatever
    /// the detection strategy requires from the old image.
    pub fn filter(conflict: &Conflict, table: &Table, row: &RowChange) -> Vec<(String, Option<String>)> {
        let mut filter: Vec<(String, Option<String>)> =
            row.keys.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        if row.old.is_empty() {
            return filter;
        }
        match conflict.detect_type {
            DetectConflict::UsePkData => {}
            DetectConflict::UseOldData => {
                for (name, old) in &row.old {
                    if !contains_ci(&row.keys, name) && table.has_column(name) {
                        filter.push((name.clone(), old.clone()));
                    }
                }
            }
            DetectConflict::UseChangedData => {
                for (name, new) in &row.columns {
                    if contains_ci(&row.keys, name) {
                        continue;
                    }
                    if let Some(old) = get_ci(&row.old, name) {
                        if old != new {
                            filter.push((name.clone(), old.clone()));
                        }
                    }
                }
            }
            DetectConflict::UseVersion | DetectConflict::UseTimestamp => {
                let column = conflict
                    .detect_expression
                    .as_deref()
                    .filter(|c| table.has_column(c))
                    .and_then(|c| get_ci(&row.old, c).map(|v| (c.to_string(), v.clone())));
                match column {
                    Some(pair) => filter.push(pair),
                    None => tracing::error!(
                        "conflict {} on {}: detect column {:?} not available, matching by primary key",
                        conflict.conflict_id,
                        table.name,
                        conflict.detect_expression
                    ),
                }
            }
        }
        filter
    }
}

fn get_ci<'a>(map: &'a ColumnValues, name: &str) -> Option<&'a Option<String>> {
    map.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v)
}

fn contains_ci(map: &ColumnValues, name: &str) -> bool {
    map.keys().any(|k| k.eq_ignore_ascii_case(name))
}

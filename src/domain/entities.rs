//! Domain Entities - Core business objects
//!
//! These entities represent the core concepts of the replication domain.
//! They have no infrastructure dependencies and contain only business logic.

use crate::domain::errors::StateError;
use crate::domain::value_objects::{
    BatchStatus, BatchType, DataEventType, DeleteAction, DetectConflict, IncludeOn, NodeId,
    ResolveConflict, TransformPoint,
};
use chrono::{DateTime, NaiveTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Ordered column name to value map used throughout the transform pipeline.
pub type ColumnValues = IndexMap<String, Option<String>>;

// ---------------------------------------------------------------------------
// Captured changes
// ---------------------------------------------------------------------------

/// Versioned schema snapshot of a captured table, as of trigger-build time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableHistory {
    pub id: i64,
    pub trigger_id: String,
    pub source_catalog: Option<String>,
    pub source_schema: Option<String>,
    pub source_table: String,
    pub column_names: Vec<String>,
    pub pk_column_names: Vec<String>,
    /// Structural hash over table name, columns and keys
    pub table_hash: u32,
    /// Content hash of the trigger definition
    pub trigger_row_hash: u32,
    pub create_time: DateTime<Utc>,
    pub inactive_time: Option<DateTime<Utc>>,
}

impl TableHistory {
    pub fn new(
        id: i64,
        trigger_id: impl Into<String>,
        source_table: impl Into<String>,
        column_names: Vec<String>,
        pk_column_names: Vec<String>,
    ) -> Self {
        let trigger_id = trigger_id.into();
        let source_table = source_table.into();
        let table_hash = Self::structure_hash(&source_table, &column_names, &pk_column_names);
        let trigger_row_hash = crc32fast::hash(trigger_id.as_bytes()) ^ table_hash;
        Self {
            id,
            trigger_id,
            source_catalog: None,
            source_schema: None,
            source_table,
            column_names,
            pk_column_names,
            table_hash,
            trigger_row_hash,
            create_time: Utc::now(),
            inactive_time: None,
        }
    }

    pub fn with_qualifiers(mut self, catalog: Option<String>, schema: Option<String>) -> Self {
        self.source_catalog = catalog;
        self.source_schema = schema;
        self
    }

    /// CRC32 over the table's shape. Two snapshots with the same hash decode
    /// rows identically.
    pub fn structure_hash(table: &str, columns: &[String], pks: &[String]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(table.to_lowercase().as_bytes());
        for column in columns {
            hasher.update(b"|");
            hasher.update(column.to_lowercase().as_bytes());
        }
        hasher.update(b"#");
        for pk in pks {
            hasher.update(b"|");
            hasher.update(pk.to_lowercase().as_bytes());
        }
        hasher.finalize()
    }

    pub fn is_active(&self) -> bool {
        self.inactive_time.is_none()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Positions of the primary-key columns within the column list.
    pub fn pk_indexes(&self) -> Vec<usize> {
        self.pk_column_names
            .iter()
            .filter_map(|pk| self.column_index(pk))
            .collect()
    }
}

/// In-memory registry of table history snapshots.
///
/// Keeps exactly one active snapshot per trigger. Records keep the `Arc`
/// they were created with, so superseding never changes how in-flight
/// data is decoded.
#[derive(Debug, Default)]
pub struct TableHistoryRegistry {
    by_id: HashMap<i64, Arc<TableHistory>>,
    active: HashMap<String, i64>,
}

impl TableHistoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: i64) -> Option<Arc<TableHistory>> {
        self.by_id.get(&id).cloned()
    }

    pub fn active_for(&self, trigger_id: &str) -> Option<Arc<TableHistory>> {
        self.active
            .get(trigger_id)
            .and_then(|id| self.by_id.get(id))
            .cloned()
    }

    /// Install `history` as the active snapshot for its trigger, marking the
    /// previous one inactive. Returns the superseded snapshot id, if any.
    pub fn supersede(&mut self, history: TableHistory) -> Option<i64> {
        let now = Utc::now();
        let previous = self.active.insert(history.trigger_id.clone(), history.id);
        if let Some(prev_id) = previous {
            if let Some(prev) = self.by_id.get(&prev_id) {
                let mut retired = (**prev).clone();
                retired.inactive_time = Some(now);
                self.by_id.insert(prev_id, Arc::new(retired));
            }
        }
        self.by_id.insert(history.id, Arc::new(history));
        previous
    }

    /// Register a snapshot loaded from storage without touching active state
    /// unless it is itself active.
    pub fn load(&mut self, history: TableHistory) {
        if history.is_active() {
            self.active.insert(history.trigger_id.clone(), history.id);
        }
        self.by_id.insert(history.id, Arc::new(history));
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// One captured row mutation.
///
/// Value arrays align positionally with the table history the record was
/// captured under. Fields are private; the record never changes after
/// it is built.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    data_id: i64,
    event_type: DataEventType,
    catalog: Option<String>,
    schema: Option<String>,
    table_name: String,
    pk_values: Vec<Option<String>>,
    row_values: Vec<Option<String>>,
    old_values: Option<Vec<Option<String>>>,
    history: Arc<TableHistory>,
    create_time: DateTime<Utc>,
    channel_id: String,
}

impl ChangeRecord {
    /// Start a record against a table history snapshot. Consumes itself
    /// through the `with_*` methods.
    pub fn new(event_type: DataEventType, history: Arc<TableHistory>) -> Self {
        Self {
            data_id: 0,
            event_type,
            catalog: history.source_catalog.clone(),
            schema: history.source_schema.clone(),
            table_name: history.source_table.clone(),
            pk_values: Vec::new(),
            row_values: Vec::new(),
            old_values: None,
            history,
            create_time: Utc::now(),
            channel_id: "default".to_string(),
        }
    }

    pub fn with_data_id(mut self, data_id: i64) -> Self {
        self.data_id = data_id;
        self
    }

    pub fn with_row(mut self, values: Vec<Option<String>>) -> Self {
        self.row_values = values;
        self
    }

    pub fn with_pk(mut self, values: Vec<Option<String>>) -> Self {
        self.pk_values = values;
        self
    }

    pub fn with_old(mut self, values: Vec<Option<String>>) -> Self {
        self.old_values = Some(values);
        self
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = channel_id.into();
        self
    }

    pub fn with_create_time(mut self, time: DateTime<Utc>) -> Self {
        self.create_time = time;
        self
    }

    pub fn data_id(&self) -> i64 {
        self.data_id
    }

    pub fn event_type(&self) -> DataEventType {
        self.event_type
    }

    pub fn catalog(&self) -> Option<&str> {
        self.catalog.as_deref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn row_values(&self) -> &[Option<String>] {
        &self.row_values
    }

    pub fn old_values(&self) -> Option<&[Option<String>]> {
        self.old_values.as_deref()
    }

    pub fn history(&self) -> &Arc<TableHistory> {
        &self.history
    }

    pub fn create_time(&self) -> DateTime<Utc> {
        self.create_time
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Raw pk array as captured (empty for inserts).
    pub fn pk_values(&self) -> &[Option<String>] {
        &self.pk_values
    }

    /// Primary-key values identifying the target row: explicit pk data
    /// first, then the old image, then the new image.
    pub fn key_values(&self) -> Vec<Option<String>> {
        if !self.pk_values.is_empty() {
            return self.pk_values.clone();
        }
        let source = match &self.old_values {
            Some(old) if !old.is_empty() => old,
            _ => &self.row_values,
        };
        self.history
            .pk_indexes()
            .into_iter()
            .map(|i| source.get(i).cloned().flatten())
            .collect()
    }

    /// Payload of SQL/CREATE/BSH events.
    pub fn script(&self) -> Option<&str> {
        self.row_values.first().and_then(|v| v.as_deref())
    }

    /// Name/value pairs of the new image.
    pub fn row_map(&self) -> ColumnValues {
        zip_columns(&self.history.column_names, &self.row_values)
    }

    /// Name/value pairs of the old image (empty when absent).
    pub fn old_map(&self) -> ColumnValues {
        match &self.old_values {
            Some(old) => zip_columns(&self.history.column_names, old),
            None => ColumnValues::new(),
        }
    }

    /// Name/value pairs of the key image.
    pub fn key_map(&self) -> ColumnValues {
        zip_columns(&self.history.pk_column_names, &self.key_values())
    }
}

fn zip_columns(names: &[String], values: &[Option<String>]) -> ColumnValues {
    names
        .iter()
        .zip(values.iter())
        .map(|(n, v)| (n.clone(), v.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Target database model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub type_name: String,
    pub primary_key: bool,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, primary_key: bool) -> Self {
        Self {
            name: name.into(),
            type_name: String::new(),
            primary_key,
            nullable: !primary_key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub name: String,
    pub columns: Vec<Column>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            catalog: None,
            schema: None,
            name: name.into(),
            columns,
        }
    }

    /// Source-side table shape described by a history snapshot.
    pub fn from_history(history: &TableHistory) -> Self {
        let columns = history
            .column_names
            .iter()
            .map(|c| {
                let pk = history.pk_column_names.iter().any(|p| p.eq_ignore_ascii_case(c));
                Column::new(c.clone(), pk)
            })
            .collect();
        Self {
            catalog: history.source_catalog.clone(),
            schema: history.source_schema.clone(),
            name: history.source_table.clone(),
            columns,
        }
    }

    pub fn qualified_name(&self) -> String {
        let mut parts = Vec::with_capacity(3);
        if let Some(c) = &self.catalog {
            parts.push(c.as_str());
        }
        if let Some(s) = &self.schema {
            parts.push(s.as_str());
        }
        parts.push(self.name.as_str());
        parts.join(".")
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn pk_column_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

/// A unit of transport to one node on one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingBatch {
    pub batch_id: i64,
    pub node_id: NodeId,
    pub channel_id: String,
    pub status: BatchStatus,
    pub batch_type: BatchType,
    pub error_flag: bool,
    pub data_event_count: i64,
    pub ignore_count: i64,
    pub failed_data_id: i64,
    pub create_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
}

impl OutgoingBatch {
    pub fn new(batch_id: i64, node_id: NodeId, channel_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            batch_id,
            node_id,
            channel_id: channel_id.into(),
            status: BatchStatus::New,
            batch_type: BatchType::Events,
            error_flag: false,
            data_event_count: 0,
            ignore_count: 0,
            failed_data_id: 0,
            create_time: now,
            last_update_time: now,
        }
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow.
    pub fn transition_to(&mut self, next: BatchStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(next) {
            return Err(StateError::IllegalTransition {
                batch_id: self.batch_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.error_flag = next == BatchStatus::Error;
        self.last_update_time = Utc::now();
        Ok(())
    }
}

/// One status transition of a batch, appended on every move into OK or ERROR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchHistory {
    pub batch_id: i64,
    pub node_id: NodeId,
    pub status: BatchStatus,
    pub statement_count: i64,
    pub fallback_insert_count: i64,
    pub fallback_update_count: i64,
    pub missing_delete_count: i64,
    /// 1-based row at which processing failed, 0 when not row-attributable
    pub failed_line_number: i64,
    pub failed_data_id: i64,
    pub create_time: DateTime<Utc>,
}

/// Extended statistics reported by the receiving node for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckStatistics {
    pub statement_count: i64,
    pub fallback_insert_count: i64,
    pub fallback_update_count: i64,
    pub missing_delete_count: i64,
}

/// A per-batch outcome reported back by a remote node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAck {
    pub batch_id: i64,
    pub ok: bool,
    /// 1-based; `None` or `Some(0)` means the failure is not localized
    pub failed_line_number: Option<i64>,
    pub statistics: Option<AckStatistics>,
}

impl BatchAck {
    pub fn ok(batch_id: i64) -> Self {
        Self {
            batch_id,
            ok: true,
            failed_line_number: None,
            statistics: None,
        }
    }

    pub fn error(batch_id: i64, line: i64) -> Self {
        Self {
            batch_id,
            ok: false,
            failed_line_number: Some(line),
            statistics: None,
        }
    }

    pub fn with_statistics(mut self, statistics: AckStatistics) -> Self {
        self.statistics = Some(statistics);
        self
    }

    /// The failing line when it points at a real row.
    pub fn localized_line(&self) -> Option<i64> {
        self.failed_line_number.filter(|l| *l > 0)
    }
}

/// Receiving-side ledger entry for a batch that was loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingBatch {
    pub batch_id: i64,
    pub node_id: NodeId,
    pub channel_id: String,
    pub status: BatchStatus,
    pub statement_count: i64,
    pub fallback_insert_count: i64,
    pub fallback_update_count: i64,
    pub missing_delete_count: i64,
    pub ignore_count: i64,
    pub failed_row_number: i64,
    pub last_update_time: DateTime<Utc>,
}

impl IncomingBatch {
    pub fn new(batch_id: i64, node_id: NodeId, channel_id: impl Into<String>) -> Self {
        Self {
            batch_id,
            node_id,
            channel_id: channel_id.into(),
            status: BatchStatus::Ok,
            statement_count: 0,
            fallback_insert_count: 0,
            fallback_update_count: 0,
            missing_delete_count: 0,
            ignore_count: 0,
            failed_row_number: 0,
            last_update_time: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Topology and channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub node_group_id: String,
    pub sync_url: String,
    /// Offset such as `+02:00`; `None` means UTC
    pub timezone_offset: Option<String>,
    pub sync_enabled: bool,
}

impl Node {
    pub fn new(node_id: impl Into<NodeId>, node_group_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_group_id: node_group_id.into(),
            sync_url: String::new(),
            timezone_offset: None,
            sync_enabled: true,
        }
    }

    pub fn with_sync_url(mut self, url: impl Into<String>) -> Self {
        self.sync_url = url.into();
        self
    }

    pub fn with_timezone_offset(mut self, offset: impl Into<String>) -> Self {
        self.timezone_offset = Some(offset.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSecurity {
    pub node_id: NodeId,
    pub initial_load_enabled: bool,
    pub initial_load_time: Option<DateTime<Utc>>,
}

/// Per-node view of a channel's send policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeChannel {
    pub node_id: NodeId,
    pub channel_id: String,
    pub processing_order: i32,
    pub max_batch_to_send: usize,
    pub max_batch_size: usize,
    /// Cut a partial batch once its oldest row is this old
    pub batch_flush_millis: i64,
    pub extract_period_millis: Option<i64>,
    pub last_extract_time: Option<DateTime<Utc>>,
    pub suspended: bool,
    pub ignored: bool,
    pub enabled: bool,
}

impl NodeChannel {
    pub fn new(node_id: NodeId, channel_id: impl Into<String>, processing_order: i32) -> Self {
        Self {
            node_id,
            channel_id: channel_id.into(),
            processing_order,
            max_batch_to_send: 100,
            max_batch_size: 1000,
            batch_flush_millis: 0,
            extract_period_millis: None,
            last_extract_time: None,
            suspended: false,
            ignored: false,
            enabled: true,
        }
    }

    /// Whether the extract period has elapsed as of `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match (self.extract_period_millis, self.last_extract_time) {
            (None, _) | (Some(0), _) | (_, None) => true,
            (Some(period), Some(last)) => (now - last).num_milliseconds() >= period,
        }
    }
}

/// Daily send window for a channel. May wrap past midnight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelWindow {
    pub channel_id: String,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub enabled: bool,
}

impl ChannelWindow {
    pub fn new(channel_id: impl Into<String>, start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            channel_id: channel_id.into(),
            start,
            end,
            enabled: true,
        }
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

// ---------------------------------------------------------------------------
// Conflict configuration
// ---------------------------------------------------------------------------

/// Conflict policy for a target table pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: String,
    /// `None` matches any table
    pub target_table: Option<String>,
    pub target_channel_id: Option<String>,
    pub detect_type: DetectConflict,
    /// Column name for version/timestamp detection
    pub detect_expression: Option<String>,
    pub resolve_type: ResolveConflict,
    /// Only write changed columns when falling back to update
    pub resolve_changes_only: bool,
}

impl Conflict {
    pub fn new(
        conflict_id: impl Into<String>,
        detect_type: DetectConflict,
        resolve_type: ResolveConflict,
    ) -> Self {
        Self {
            conflict_id: conflict_id.into(),
            target_table: None,
            target_channel_id: None,
            detect_type,
            detect_expression: None,
            resolve_type,
            resolve_changes_only: false,
        }
    }

    pub fn for_table(mut self, table: impl Into<String>) -> Self {
        self.target_table = Some(table.into());
        self
    }

    pub fn for_channel(mut self, channel: impl Into<String>) -> Self {
        self.target_channel_id = Some(channel.into());
        self
    }

    pub fn with_detect_expression(mut self, expression: impl Into<String>) -> Self {
        self.detect_expression = Some(expression.into());
        self
    }

    /// Table patterns support a trailing `*` wildcard.
    pub fn matches_table(&self, table: &str) -> bool {
        match &self.target_table {
            None => true,
            Some(pattern) => match pattern.strip_suffix('*') {
                Some(prefix) => table.to_lowercase().starts_with(&prefix.to_lowercase()),
                None => pattern.eq_ignore_ascii_case(table),
            },
        }
    }

    pub fn matches_channel(&self, channel: &str) -> bool {
        self.target_channel_id
            .as_deref()
            .map(|c| c == channel)
            .unwrap_or(true)
    }

    /// Specificity used to pick the best match: table beats channel beats default.
    pub fn specificity(&self) -> u8 {
        let table = match &self.target_table {
            Some(t) if !t.ends_with('*') => 4,
            Some(_) => 2,
            None => 0,
        };
        table + u8::from(self.target_channel_id.is_some())
    }
}

impl Default for Conflict {
    fn default() -> Self {
        Self::new("default", DetectConflict::UsePkData, ResolveConflict::Fallback)
    }
}

// ---------------------------------------------------------------------------
// Transform configuration
// ---------------------------------------------------------------------------

/// Maps one source column (or none) to one target column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformColumn {
    pub source_column: Option<String>,
    pub target_column: String,
    pub pk: bool,
    pub transform_type: String,
    pub expression: Option<String>,
    pub include_on: IncludeOn,
}

impl TransformColumn {
    pub fn new(
        source_column: Option<&str>,
        target_column: impl Into<String>,
        pk: bool,
        transform_type: impl Into<String>,
    ) -> Self {
        Self {
            source_column: source_column.map(str::to_string),
            target_column: target_column.into(),
            pk,
            transform_type: transform_type.into(),
            expression: None,
            include_on: IncludeOn::All,
        }
    }

    /// Shorthand for a `copy` column.
    pub fn copy(source: &str, target: &str, pk: bool) -> Self {
        Self::new(Some(source), target, pk, "copy")
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    pub fn with_include_on(mut self, include_on: IncludeOn) -> Self {
        self.include_on = include_on;
        self
    }
}

/// Maps a source table and target node group to a target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformTable {
    pub transform_id: String,
    pub source_catalog: Option<String>,
    pub source_schema: Option<String>,
    pub source_table: String,
    pub target_catalog: Option<String>,
    pub target_schema: Option<String>,
    pub target_table: String,
    pub source_node_group_id: Option<String>,
    pub target_node_group_id: Option<String>,
    pub transform_point: TransformPoint,
    pub update_first: bool,
    pub delete_action: DeleteAction,
    pub transform_order: i32,
    pub columns: Vec<TransformColumn>,
}

impl TransformTable {
    pub fn new(
        transform_id: impl Into<String>,
        source_table: impl Into<String>,
        target_table: impl Into<String>,
    ) -> Self {
        Self {
            transform_id: transform_id.into(),
            source_catalog: None,
            source_schema: None,
            source_table: source_table.into(),
            target_catalog: None,
            target_schema: None,
            target_table: target_table.into(),
            source_node_group_id: None,
            target_node_group_id: None,
            transform_point: TransformPoint::Load,
            update_first: false,
            delete_action: DeleteAction::None,
            transform_order: 0,
            columns: Vec::new(),
        }
    }

    pub fn with_column(mut self, column: TransformColumn) -> Self {
        self.columns.push(column);
        self
    }

    pub fn with_delete_action(mut self, action: DeleteAction) -> Self {
        self.delete_action = action;
        self
    }

    pub fn with_update_first(mut self, update_first: bool) -> Self {
        self.update_first = update_first;
        self
    }

    pub fn with_target_node_group(mut self, group: impl Into<String>) -> Self {
        self.target_node_group_id = Some(group.into());
        self
    }

    pub fn primary_key_columns(&self) -> impl Iterator<Item = &TransformColumn> {
        self.columns.iter().filter(|c| c.pk)
    }

    pub fn has_primary_key(&self) -> bool {
        self.columns.iter().any(|c| c.pk)
    }

    /// Whether this rule applies to the given source table and routing context.
    pub fn matches(
        &self,
        catalog: Option<&str>,
        schema: Option<&str>,
        table: &str,
        target_node_group: Option<&str>,
    ) -> bool {
        fn qualifier_matches(rule: Option<&String>, actual: Option<&str>) -> bool {
            match rule {
                None => true,
                Some(r) => actual.map(|a| r.eq_ignore_ascii_case(a)).unwrap_or(false),
            }
        }
        self.source_table.eq_ignore_ascii_case(table)
            && qualifier_matches(self.source_catalog.as_ref(), catalog)
            && qualifier_matches(self.source_schema.as_ref(), schema)
            && match (&self.target_node_group_id, target_node_group) {
                (Some(rule), Some(group)) => rule == group,
                (Some(_), None) => false,
                (None, _) => true,
            }
    }

    pub fn target_table_model(&self) -> Table {
        let columns = self
            .columns
            .iter()
            .map(|c| Column::new(c.target_column.clone(), c.pk))
            .collect();
        Table {
            catalog: self.target_catalog.clone(),
            schema: self.target_schema.clone(),
            name: self.target_table.clone(),
            columns,
        }
    }
}

/// Target row being built from one source record by one transform rule.
///
/// Values are kept per include-on scope so that a retransform for a
/// different DML type can select a different column set.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedData {
    transformation: Arc<TransformTable>,
    source_dml: DataEventType,
    target_dml: DataEventType,
    source_key_values: ColumnValues,
    source_old_values: ColumnValues,
    source_values: ColumnValues,
    columns: HashMap<IncludeOn, ColumnValues>,
    keys: HashMap<IncludeOn, ColumnValues>,
    old_columns: HashMap<IncludeOn, ColumnValues>,
}

impl TransformedData {
    pub fn new(
        transformation: Arc<TransformTable>,
        source_dml: DataEventType,
        source_key_values: ColumnValues,
        source_old_values: ColumnValues,
        source_values: ColumnValues,
    ) -> Self {
        Self {
            transformation,
            source_dml,
            target_dml: source_dml,
            source_key_values,
            source_old_values,
            source_values,
            columns: HashMap::new(),
            keys: HashMap::new(),
            old_columns: HashMap::new(),
        }
    }

    pub fn put(&mut self, column: &TransformColumn, value: Option<String>, as_key: bool) {
        if as_key {
            self.keys
                .entry(column.include_on)
                .or_default()
                .insert(column.target_column.clone(), value.clone());
        }
        self.columns
            .entry(column.include_on)
            .or_default()
            .insert(column.target_column.clone(), value);
    }

    /// Target value the column had before the change.
    pub fn put_old(&mut self, column: &TransformColumn, value: Option<String>) {
        self.old_columns
            .entry(column.include_on)
            .or_default()
            .insert(column.target_column.clone(), value);
    }

    pub fn set_target_dml(&mut self, dml: DataEventType) {
        self.target_dml = dml;
    }

    pub fn transformation(&self) -> &Arc<TransformTable> {
        &self.transformation
    }

    pub fn source_dml(&self) -> DataEventType {
        self.source_dml
    }

    pub fn target_dml(&self) -> DataEventType {
        self.target_dml
    }

    pub fn source_key_values(&self) -> &ColumnValues {
        &self.source_key_values
    }

    pub fn source_old_values(&self) -> &ColumnValues {
        &self.source_old_values
    }

    pub fn source_values(&self) -> &ColumnValues {
        &self.source_values
    }

    fn merged(map: &HashMap<IncludeOn, ColumnValues>, dml: DataEventType) -> ColumnValues {
        let mut out = map.get(&IncludeOn::All).cloned().unwrap_or_default();
        let scoped = match dml {
            DataEventType::Insert => map.get(&IncludeOn::Insert),
            DataEventType::Update => map.get(&IncludeOn::Update),
            DataEventType::Delete => map.get(&IncludeOn::Delete),
            _ => None,
        };
        if let Some(scoped) = scoped {
            for (k, v) in scoped {
                out.insert(k.clone(), v.clone());
            }
        }
        out
    }

    /// Target columns visible to the source DML.
    pub fn target_columns(&self) -> ColumnValues {
        Self::merged(&self.columns, self.source_dml)
    }

    pub fn target_keys(&self) -> ColumnValues {
        Self::merged(&self.keys, self.source_dml)
    }

    /// Old image of the non-key target columns, where it could be derived.
    pub fn target_old_columns(&self) -> ColumnValues {
        Self::merged(&self.old_columns, self.source_dml)
    }

    pub fn has_columns(&self) -> bool {
        !self.target_columns().is_empty()
    }

    /// Target table model with key flags taken from the transform's keys.
    pub fn target_table(&self) -> Table {
        let keys = self.target_keys();
        let columns = self
            .target_columns()
            .keys()
            .map(|name| Column::new(name.clone(), keys.contains_key(name)))
            .collect();
        Table {
            catalog: self.transformation.target_catalog.clone(),
            schema: self.transformation.target_schema.clone(),
            name: self.transformation.target_table.clone(),
            columns,
        }
    }
}

// ---------------------------------------------------------------------------
// Apply-time context
// ---------------------------------------------------------------------------

/// Identity of the batch being applied, shared with listeners, transforms
/// and scripts.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchContext {
    pub batch_id: i64,
    pub channel_id: String,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    /// Extra variables bound into scripts
    pub variables: IndexMap<String, String>,
}

impl BatchContext {
    pub fn new(
        batch_id: i64,
        channel_id: impl Into<String>,
        source_node_id: NodeId,
        target_node_id: NodeId,
    ) -> Self {
        Self {
            batch_id,
            channel_id: channel_id.into(),
            source_node_id,
            target_node_id,
            variables: IndexMap::new(),
        }
    }
}

/// Per-table statement counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStatistics {
    pub inserts: i64,
    pub updates: i64,
    pub deletes: i64,
}

/// Running statistics of one applied batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStatistics {
    pub statement_count: i64,
    pub fallback_insert_count: i64,
    pub fallback_update_count: i64,
    pub missing_delete_count: i64,
    pub ignore_row_count: i64,
    pub script_count: i64,
    /// 1-based number of the row currently being applied
    pub line_number: i64,
    pub tables: IndexMap<String, TableStatistics>,
}

impl BatchStatistics {
    pub fn table(&mut self, name: &str) -> &mut TableStatistics {
        self.tables.entry(name.to_string()).or_default()
    }

    pub fn to_ack_statistics(&self) -> AckStatistics {
        AckStatistics {
            statement_count: self.statement_count,
            fallback_insert_count: self.fallback_insert_count,
            fallback_update_count: self.fallback_update_count,
            missing_delete_count: self.missing_delete_count,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn customer_history() -> Arc<TableHistory> {
        Arc::new(TableHistory::new(
            1,
            "customer",
            "customer",
            vec!["id".into(), "name".into(), "val".into()],
            vec!["id".into()],
        ))
    }

    #[test]
    fn test_structure_hash_stable() {
        let cols = vec!["id".to_string(), "name".to_string()];
        let pks = vec!["id".to_string()];
        let a = TableHistory::structure_hash("customer", &cols, &pks);
        let b = TableHistory::structure_hash("CUSTOMER", &cols, &pks);
        assert_eq!(a, b);
        let c = TableHistory::structure_hash("customer", &cols, &[]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_registry_supersede_keeps_one_active() {
        let mut registry = TableHistoryRegistry::new();
        let first = TableHistory::new(1, "t1", "customer", vec!["id".into()], vec!["id".into()]);
        let second = TableHistory::new(
            2,
            "t1",
            "customer",
            vec!["id".into(), "name".into()],
            vec!["id".into()],
        );
        assert_eq!(registry.supersede(first), None);
        let held = registry.get(1).unwrap();
        assert_eq!(registry.supersede(second), Some(1));

        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.active_for("t1").unwrap().id, 2);
        assert!(!registry.get(1).unwrap().is_active());
        // records built against the old snapshot still see its columns
        assert_eq!(held.column_names.len(), 1);
    }

    #[test]
    fn test_key_values_fall_back_to_row() {
        let record = ChangeRecord::new(DataEventType::Insert, customer_history())
            .with_row(vec![Some("1".into()), Some("a".into()), Some("10".into())]);
        assert_eq!(record.key_values(), vec![Some("1".to_string())]);

        let record = ChangeRecord::new(DataEventType::Delete, customer_history())
            .with_pk(vec![Some("7".into())]);
        assert_eq!(record.key_values(), vec![Some("7".to_string())]);
    }

    #[test]
    fn test_row_map_aligns_with_history() {
        let record = ChangeRecord::new(DataEventType::Update, customer_history())
            .with_row(vec![Some("1".into()), None, Some("20".into())])
            .with_old(vec![Some("1".into()), None, Some("10".into())]);
        let row = record.row_map();
        assert_eq!(row.get("val"), Some(&Some("20".to_string())));
        assert_eq!(record.old_map().get("val"), Some(&Some("10".to_string())));
        assert_eq!(row.get("name"), Some(&None));
    }

    #[test]
    fn test_batch_transition() {
        let mut batch = OutgoingBatch::new(42, NodeId::new("store-1"), "sales");
        batch.transition_to(BatchStatus::Sending).unwrap();
        batch.transition_to(BatchStatus::Error).unwrap();
        assert!(batch.error_flag);
        batch.transition_to(BatchStatus::Sending).unwrap();
        batch.transition_to(BatchStatus::Ok).unwrap();
        assert!(!batch.error_flag);
        assert!(batch.transition_to(BatchStatus::Sending).is_err());
    }

    #[test]
    fn test_channel_window_wraps_midnight() {
        let window = ChannelWindow::new(
            "sales",
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
        );
        assert!(window.contains(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(window.contains(NaiveTime::from_hms_opt(1, 0, 0).unwrap()));
        assert!(!window.contains(NaiveTime::from_hms_opt(3, 0, 0).unwrap()));
    }

    #[test]
    fn test_node_channel_is_due() {
        let now = Utc::now();
        let mut channel = NodeChannel::new(NodeId::new("n"), "sales", 1);
        assert!(channel.is_due(now));
        channel.extract_period_millis = Some(60_000);
        channel.last_extract_time = Some(now - chrono::Duration::seconds(10));
        assert!(!channel.is_due(now));
        channel.last_extract_time = Some(now - chrono::Duration::seconds(120));
        assert!(channel.is_due(now));
    }

    #[test]
    fn test_conflict_matching() {
        let conflict = Conflict::default().for_table("cust*");
        assert!(conflict.matches_table("customer"));
        assert!(!conflict.matches_table("orders"));
        assert!(Conflict::default().for_table("customer").specificity() > conflict.specificity());
    }

    #[test]
    fn test_transform_table_matches_group() {
        let t = TransformTable::new("t1", "customer", "client").with_target_node_group("store");
        assert!(t.matches(None, None, "CUSTOMER", Some("store")));
        assert!(!t.matches(None, None, "customer", Some("corp")));
        assert!(!t.matches(None, None, "orders", Some("store")));
    }

    #[test]
    fn test_transformed_data_scopes() {
        let table = Arc::new(TransformTable::new("t1", "customer", "client"));
        let mut data = TransformedData::new(
            table,
            DataEventType::Update,
            ColumnValues::new(),
            ColumnValues::new(),
            ColumnValues::new(),
        );
        data.put(&TransformColumn::copy("id", "client_id", true), Some("1".into()), true);
        data.put(
            &TransformColumn::copy("name", "created_by", false).with_include_on(IncludeOn::Insert),
            Some("x".into()),
            false,
        );
        data.put(
            &TransformColumn::copy("name", "updated_by", false).with_include_on(IncludeOn::Update),
            Some("y".into()),
            false,
        );
        let columns = data.target_columns();
        assert!(columns.contains_key("client_id"));
        assert!(columns.contains_key("updated_by"));
        assert!(!columns.contains_key("created_by"));
        assert_eq!(data.target_keys().len(), 1);
        assert!(data.target_table().column("client_id").unwrap().primary_key);
    }
}

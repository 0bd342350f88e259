//! Database Writer
//!
//! Applies the change records of one batch to a target database, table by
//! table in encounter order and row by row in stream order.
//!
//! Lifecycle: `start_batch` → (`start_table` → `write`* → `end_table`)* →
//! `end_batch`, or `fail_batch` on the first unhandled error. [`apply`]
//! drives the whole sequence for a slice of records.
//!
//! Listener hooks run in registration order at these points:
//! `target_table_name` when a table starts, `before_write`/`after_write`
//! around every data row, `handle_error` when a row fails, `early_commit`
//! after an intermediate commit, `batch_complete` + `batch_committed` on
//! success and `batch_rolled_back` on failure.
//!
//! [`apply`]: DatabaseWriter::apply

use crate::domain::entities::{
    BatchContext, BatchStatistics, ChangeRecord, ColumnValues, Conflict, Table, TransformedData,
};
use crate::domain::errors::{ConflictKind, WriterError};
use crate::domain::ports::{
    DatabaseWriterListener, Retransform, ScriptEngine, TargetDatabase, SOURCE_NODE_ID,
    TARGET_NODE_ID,
};
use crate::domain::services::conflict_resolver::{ConflictDetector, ConflictResolver, Resolution};
use crate::domain::services::transform_engine::TransformEngine;
use crate::domain::value_objects::DataEventType;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Apply-engine settings.
#[derive(Clone)]
pub struct WriterSettings {
    /// Commit after this many uncommitted rows; 0 commits once per batch
    pub max_rows_before_commit: usize,
    pub commit_sleep: Duration,
    pub default_conflict: Conflict,
    pub conflicts: Vec<Conflict>,
    /// Skip rows for tables the target does not have
    pub ignore_missing_tables: bool,
    /// Only SET columns whose value changed
    pub apply_changes_only: bool,
    pub log_conflict_resolution: bool,
    pub listeners: Vec<Arc<dyn DatabaseWriterListener>>,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            max_rows_before_commit: 10_000,
            commit_sleep: Duration::ZERO,
            default_conflict: Conflict::default(),
            conflicts: Vec::new(),
            ignore_missing_tables: false,
            apply_changes_only: false,
            log_conflict_resolution: false,
            listeners: Vec::new(),
        }
    }
}

impl WriterSettings {
    pub fn with_conflict(mut self, conflict: Conflict) -> Self {
        self.conflicts.push(conflict);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn DatabaseWriterListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn pick_conflict(&self, table: &str, channel: &str) -> &Conflict {
        ConflictResolver::pick(&self.conflicts, &self.default_conflict, table, channel)
    }
}

/// One row ready to be applied, with values keyed by target column name.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub data_id: i64,
    /// Event captured at the source
    pub source_event: DataEventType,
    /// Statement to run at the target
    pub event: DataEventType,
    pub columns: ColumnValues,
    pub old: ColumnValues,
    pub keys: ColumnValues,
    pub transformed: Option<TransformedData>,
}

impl RowChange {
    /// Map a captured record onto `target` by column name.
    pub fn from_record(record: &ChangeRecord, target: &Table) -> Result<Self, WriterError> {
        let event = record.event_type();
        let columns = if event == DataEventType::Delete {
            ColumnValues::new()
        } else {
            onto_target(record.row_map(), target)
        };
        let old = onto_target(record.old_map(), target);

        let key_image = record.key_map();
        let mut keys = ColumnValues::new();
        let target_pks = target.pk_column_names();
        if !target_pks.is_empty() {
            for pk in target_pks {
                let value = lookup_ci(&key_image, &pk)
                    .or_else(|| lookup_ci(&old, &pk))
                    .or_else(|| lookup_ci(&columns, &pk));
                if let Some(value) = value {
                    keys.insert(pk, value);
                }
            }
        } else {
            keys = onto_target(key_image, target);
            if keys.is_empty() {
                keys = if old.is_empty() { columns.clone() } else { old.clone() };
            }
        }
        if keys.is_empty() {
            return Err(WriterError::NoKeys(target.name.clone()));
        }

        Ok(Self {
            data_id: record.data_id(),
            source_event: event,
            event,
            columns,
            old,
            keys,
            transformed: None,
        })
    }

    /// Build a row from transform output.
    pub fn from_transformed(data: TransformedData, target: &Table, data_id: i64) -> Result<Self, WriterError> {
        let columns = onto_target(data.target_columns(), target);
        let keys = onto_target(data.target_keys(), target);
        let old = onto_target(data.target_old_columns(), target);
        if keys.is_empty() {
            return Err(WriterError::NoKeys(target.name.clone()));
        }
        Ok(Self {
            data_id,
            source_event: data.source_dml(),
            event: data.target_dml(),
            columns,
            old,
            keys,
            transformed: Some(data),
        })
    }

    /// Columns whose value differs from the old image. Without an old image
    /// every column counts as changed.
    pub fn changed_columns(&self) -> ColumnValues {
        if self.old.is_empty() {
            return self.columns.clone();
        }
        self.columns
            .iter()
            .filter(|(name, value)| lookup_ci(&self.old, name).as_ref() != Some(*value))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

fn onto_target(values: ColumnValues, target: &Table) -> ColumnValues {
    values
        .into_iter()
        .filter_map(|(name, value)| target.column(&name).map(|c| (c.name.clone(), value)))
        .collect()
}

fn lookup_ci(map: &ColumnValues, name: &str) -> Option<Option<String>> {
    map.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

fn pairs(map: &ColumnValues) -> Vec<(String, Option<String>)> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Why a batch stopped, and where.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    pub error: WriterError,
    /// 1-based row that failed, 0 when no row was reached
    pub line_number: i64,
    pub data_id: i64,
    pub statistics: BatchStatistics,
}

pub struct DatabaseWriter<'a> {
    db: &'a mut dyn TargetDatabase,
    settings: Arc<WriterSettings>,
    transforms: Option<Arc<TransformEngine>>,
    retransform: Option<Arc<dyn Retransform>>,
    script_engine: Option<Arc<dyn ScriptEngine>>,
    ctx: Option<BatchContext>,
    stats: BatchStatistics,
    source_table: Option<Table>,
    target_table: Option<Table>,
    table_cache: HashMap<String, Option<Table>>,
    missing_tables: HashSet<String>,
    uncommitted_rows: usize,
}

impl<'a> DatabaseWriter<'a> {
    pub fn new(db: &'a mut dyn TargetDatabase, settings: Arc<WriterSettings>) -> Self {
        Self {
            db,
            settings,
            transforms: None,
            retransform: None,
            script_engine: None,
            ctx: None,
            stats: BatchStatistics::default(),
            source_table: None,
            target_table: None,
            table_cache: HashMap::new(),
            missing_tables: HashSet::new(),
            uncommitted_rows: 0,
        }
    }

    /// Route rows through `engine`; conflicts on transformed rows are
    /// retried through the same engine.
    pub fn with_transforms(mut self, engine: Arc<TransformEngine>) -> Self {
        self.retransform = Some(engine.clone() as Arc<dyn Retransform>);
        self.transforms = Some(engine);
        self
    }

    pub fn with_retransform(mut self, retransform: Arc<dyn Retransform>) -> Self {
        self.retransform = Some(retransform);
        self
    }

    pub fn with_script_engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.script_engine = Some(engine);
        self
    }

    pub fn statistics(&self) -> &BatchStatistics {
        &self.stats
    }

    /// Apply `records` as one batch.
    pub fn apply(&mut self, ctx: BatchContext, records: &[ChangeRecord]) -> Result<BatchStatistics, BatchFailure> {
        self.start_batch(ctx);
        let mut current: Option<(Option<String>, Option<String>, String)> = None;

        for record in records {
            if record.event_type().requires_table() {
                let key = (
                    record.catalog().map(str::to_string),
                    record.schema().map(str::to_string),
                    record.table_name().to_string(),
                );
                if current.as_ref() != Some(&key) {
                    if current.is_some() {
                        self.end_table();
                    }
                    if let Err(e) = self.start_table(Table::from_history(record.history())) {
                        self.stats.line_number += 1;
                        return Err(self.fail(e, record.data_id()));
                    }
                    current = Some(key);
                }
            }
            if let Err(e) = self.write(record) {
                return Err(self.fail(e, record.data_id()));
            }
        }
        if current.is_some() {
            self.end_table();
        }
        match self.end_batch() {
            Ok(stats) => Ok(stats),
            Err(e) => Err(self.fail(e, 0)),
        }
    }

    pub fn start_batch(&mut self, ctx: BatchContext) {
        tracing::debug!("applying batch {} from {}", ctx.batch_id, ctx.source_node_id);
        self.ctx = Some(ctx);
        self.stats = BatchStatistics::default();
        self.uncommitted_rows = 0;
        self.source_table = None;
        self.target_table = None;
    }

    /// Resolve the target for `source`. Returns `false` when the target does
    /// not exist and missing tables are ignored.
    pub fn start_table(&mut self, source: Table) -> Result<bool, WriterError> {
        let ctx = self.ctx.clone().ok_or(WriterError::NoBatch)?;
        let name = self
            .settings
            .listeners
            .iter()
            .find_map(|l| l.target_table_name(&ctx, &source))
            .unwrap_or_else(|| source.name.clone());

        let transformed = self
            .transforms
            .as_ref()
            .map(|t| t.has_transforms_for(source.catalog.as_deref(), source.schema.as_deref(), &source.name))
            .unwrap_or(false);

        let target = if transformed {
            self.lookup_table(source.catalog.as_deref(), source.schema.as_deref(), &name)?
        } else {
            self.resolve_table(source.catalog.as_deref(), source.schema.as_deref(), &name)?
        };
        self.source_table = Some(source);
        self.target_table = target;
        Ok(self.target_table.is_some() || transformed)
    }

    pub fn end_table(&mut self) {
        self.source_table = None;
        self.target_table = None;
    }

    /// Apply one record of the current table.
    pub fn write(&mut self, record: &ChangeRecord) -> Result<(), WriterError> {
        let ctx = self.ctx.clone().ok_or(WriterError::NoBatch)?;
        self.stats.line_number += 1;

        match self.write_record(&ctx, record) {
            Ok(true) => self.row_applied(&ctx),
            Ok(false) => Ok(()),
            Err(e) => {
                let settings = self.settings.clone();
                if settings.listeners.iter().any(|l| l.handle_error(&ctx, record, &e)) {
                    tracing::warn!(
                        "batch {} line {}: error handled by listener: {}",
                        ctx.batch_id,
                        self.stats.line_number,
                        e
                    );
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Commit the remaining rows.
    pub fn end_batch(&mut self) -> Result<BatchStatistics, WriterError> {
        let ctx = self.ctx.clone().ok_or(WriterError::NoBatch)?;
        let settings = self.settings.clone();
        for l in &settings.listeners {
            l.batch_complete(&ctx, &self.stats);
        }
        self.db.commit()?;
        self.uncommitted_rows = 0;
        for l in &settings.listeners {
            l.batch_committed(&ctx, &self.stats);
        }
        tracing::debug!(
            "batch {} applied: {} statement(s), {} fallback insert(s), {} fallback update(s), {} missing delete(s)",
            ctx.batch_id,
            self.stats.statement_count,
            self.stats.fallback_insert_count,
            self.stats.fallback_update_count,
            self.stats.missing_delete_count
        );
        Ok(self.stats.clone())
    }

    /// Roll back the uncommitted segment.
    pub fn fail_batch(&mut self, error: &WriterError) {
        if let Err(e) = self.db.rollback() {
            tracing::error!("rollback failed: {}", e);
        }
        self.uncommitted_rows = 0;
        if let Some(ctx) = self.ctx.clone() {
            let settings = self.settings.clone();
            for l in &settings.listeners {
                l.batch_rolled_back(&ctx, &self.stats, error);
            }
        }
    }

    fn fail(&mut self, error: WriterError, data_id: i64) -> BatchFailure {
        let batch_id = self.ctx.as_ref().map(|c| c.batch_id).unwrap_or(0);
        tracing::error!(
            "batch {} failed at line {}: {}",
            batch_id,
            self.stats.line_number,
            error
        );
        self.fail_batch(&error);
        BatchFailure {
            error,
            line_number: self.stats.line_number,
            data_id,
            statistics: self.stats.clone(),
        }
    }

    fn row_applied(&mut self, ctx: &BatchContext) -> Result<(), WriterError> {
        self.uncommitted_rows += 1;
        let max = self.settings.max_rows_before_commit;
        if max > 0 && self.uncommitted_rows >= max {
            self.db.commit()?;
            let settings = self.settings.clone();
            for l in &settings.listeners {
                l.early_commit(ctx, self.uncommitted_rows);
            }
            tracing::debug!(
                "early commit of {} row(s) in batch {}",
                self.uncommitted_rows,
                ctx.batch_id
            );
            self.uncommitted_rows = 0;
            if !settings.commit_sleep.is_zero() {
                std::thread::sleep(settings.commit_sleep);
            }
        }
        Ok(())
    }

    /// Returns whether something was written.
    fn write_record(&mut self, ctx: &BatchContext, record: &ChangeRecord) -> Result<bool, WriterError> {
        match record.event_type() {
            DataEventType::Sql => {
                let sql = record
                    .script()
                    .ok_or_else(|| WriterError::Script("empty sql event".to_string()))?;
                self.db.execute(sql)?;
                self.stats.statement_count += 1;
                Ok(true)
            }
            DataEventType::Create => {
                let ddl = record
                    .script()
                    .ok_or_else(|| WriterError::Script("empty create event".to_string()))?;
                self.db.execute(ddl)?;
                self.table_cache.clear();
                self.missing_tables.clear();
                self.stats.statement_count += 1;
                Ok(true)
            }
            DataEventType::Bsh => {
                self.run_script(ctx, record)?;
                Ok(true)
            }
            DataEventType::Reload => {
                tracing::debug!("reload request in batch {} needs no apply", ctx.batch_id);
                Ok(false)
            }
            DataEventType::Insert | DataEventType::Update | DataEventType::Delete => {
                self.write_data(ctx, record)
            }
        }
    }

    fn write_data(&mut self, ctx: &BatchContext, record: &ChangeRecord) -> Result<bool, WriterError> {
        if self.source_table.is_none() {
            return Err(WriterError::TableNotFound(record.table_name().to_string()));
        }
        validate_columns(record)?;

        if let Some(engine) = self.transforms.clone() {
            if engine.has_transforms_for(record.catalog(), record.schema(), record.table_name()) {
                let datas = engine.transform_record(record, ctx, &mut *self.db)?;
                let mut wrote = false;
                for data in datas {
                    let t = data.transformation().clone();
                    let Some(table) =
                        self.resolve_table(t.target_catalog.as_deref(), t.target_schema.as_deref(), &t.target_table)?
                    else {
                        continue;
                    };
                    if !self.before_write(ctx, &table, record) {
                        continue;
                    }
                    let row = RowChange::from_transformed(data, &table, record.data_id())?;
                    self.apply_row(ctx, &table, &row)?;
                    self.after_write(ctx, &table, record);
                    wrote = true;
                }
                return Ok(wrote);
            }
        }

        let Some(table) = self.target_table.clone() else {
            return Ok(false);
        };
        if !self.before_write(ctx, &table, record) {
            return Ok(false);
        }
        let row = RowChange::from_record(record, &table)?;
        self.apply_row(ctx, &table, &row)?;
        self.after_write(ctx, &table, record);
        Ok(true)
    }

    fn before_write(&self, ctx: &BatchContext, table: &Table, record: &ChangeRecord) -> bool {
        self.settings
            .listeners
            .iter()
            .all(|l| l.before_write(ctx, table, record))
    }

    fn after_write(&self, ctx: &BatchContext, table: &Table, record: &ChangeRecord) {
        for l in &self.settings.listeners {
            l.after_write(ctx, table, record);
        }
    }

    fn run_script(&mut self, ctx: &BatchContext, record: &ChangeRecord) -> Result<(), WriterError> {
        let script = record
            .script()
            .ok_or_else(|| WriterError::Script("empty script".to_string()))?;
        let engine = self
            .script_engine
            .as_ref()
            .ok_or_else(|| WriterError::Script("no script engine configured".to_string()))?;
        let mut variables = IndexMap::new();
        variables.insert(SOURCE_NODE_ID.to_string(), ctx.source_node_id.to_string());
        variables.insert(TARGET_NODE_ID.to_string(), ctx.target_node_id.to_string());
        for (k, v) in &ctx.variables {
            variables.insert(k.clone(), v.clone());
        }
        engine.eval(script, &variables).map_err(WriterError::Script)?;
        self.stats.script_count += 1;
        Ok(())
    }

    fn lookup_table(
        &mut self,
        catalog: Option<&str>,
        schema: Option<&str>,
        name: &str,
    ) -> Result<Option<Table>, WriterError> {
        let key = [catalog.unwrap_or(""), schema.unwrap_or(""), name]
            .join(".")
            .to_lowercase();
        if let Some(cached) = self.table_cache.get(&key) {
            return Ok(cached.clone());
        }
        let table = self.db.find_table(catalog, schema, name)?;
        self.table_cache.insert(key, table.clone());
        Ok(table)
    }

    fn resolve_table(
        &mut self,
        catalog: Option<&str>,
        schema: Option<&str>,
        name: &str,
    ) -> Result<Option<Table>, WriterError> {
        match self.lookup_table(catalog, schema, name)? {
            Some(table) => Ok(Some(table)),
            None if self.settings.ignore_missing_tables => {
                if self.missing_tables.insert(name.to_lowercase()) {
                    tracing::warn!("table {} not found at target, ignoring its rows", name);
                }
                Ok(None)
            }
            None => Err(WriterError::TableNotFound(name.to_string())),
        }
    }

    fn apply_row(&mut self, ctx: &BatchContext, table: &Table, row: &RowChange) -> Result<(), WriterError> {
        match row.event {
            DataEventType::Insert => self.insert(ctx, table, row),
            DataEventType::Update => self.update(ctx, table, row),
            DataEventType::Delete => self.delete(ctx, table, row),
            _ => Ok(()),
        }
    }

    fn conflict_error(&self, kind: ConflictKind, table: &Table, row: &RowChange, conflict: &Conflict) -> WriterError {
        WriterError::Conflict {
            kind,
            table: table.name.clone(),
            event: row.event,
            detect: conflict.detect_type,
            data_id: row.data_id,
        }
    }

    fn log_resolution(&self, ctx: &BatchContext, table: &Table, conflict: &Conflict) {
        if self.settings.log_conflict_resolution {
            tracing::info!(
                "conflict {} in batch {} at line {} for table {} resolved with {:?}",
                conflict.conflict_id,
                ctx.batch_id,
                self.stats.line_number,
                table.name,
                conflict.resolve_type
            );
        }
    }

    /// Returns `false` on a duplicate key.
    fn try_insert(&mut self, table: &Table, row: &RowChange) -> Result<bool, WriterError> {
        if row.columns.is_empty() {
            return Err(WriterError::ColumnCountMismatch {
                table: table.name.clone(),
                expected: table.columns.len(),
                actual: 0,
            });
        }
        match self.db.insert(table, &pairs(&row.columns)) {
            Ok(_) => {
                self.stats.statement_count += 1;
                self.stats.table(&table.name).inserts += 1;
                Ok(true)
            }
            Err(e) if e.is_unique_violation() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn update_by_key(&mut self, table: &Table, row: &RowChange, changes_only: bool) -> Result<usize, WriterError> {
        let set = if changes_only { row.changed_columns() } else { row.columns.clone() };
        if set.is_empty() {
            return self.db.count(table, &pairs(&row.keys)).map_err(Into::into);
        }
        let updated = self.db.update(table, &pairs(&set), &pairs(&row.keys))?;
        if updated > 0 {
            self.stats.statement_count += 1;
            self.stats.table(&table.name).updates += 1;
        }
        Ok(updated)
    }

    /// Rows derived from `row` for `dml`: a retransform of the source when
    /// `row` came from a transform, else `row` itself.
    fn fallback_rows(
        &mut self,
        ctx: &BatchContext,
        table: &Table,
        row: &RowChange,
        dml: DataEventType,
    ) -> Result<Vec<(Table, RowChange)>, WriterError> {
        match (&row.transformed, self.retransform.clone()) {
            (Some(data), Some(retransform)) => {
                let datas = retransform.retransform(data, dml, ctx, &mut *self.db)?;
                let mut rows = Vec::with_capacity(datas.len());
                for data in datas {
                    let t = data.transformation().clone();
                    let Some(target) =
                        self.resolve_table(t.target_catalog.as_deref(), t.target_schema.as_deref(), &t.target_table)?
                    else {
                        continue;
                    };
                    let mut fallback = RowChange::from_transformed(data, &target, row.data_id)?;
                    fallback.event = dml;
                    rows.push((target, fallback));
                }
                Ok(rows)
            }
            _ => {
                let mut fallback = row.clone();
                fallback.event = dml;
                Ok(vec![(table.clone(), fallback)])
            }
        }
    }

    fn fallback_update(
        &mut self,
        ctx: &BatchContext,
        table: &Table,
        row: &RowChange,
        changes_only: bool,
    ) -> Result<usize, WriterError> {
        let mut updated = 0;
        for (target, fallback) in self.fallback_rows(ctx, table, row, DataEventType::Update)? {
            updated += self.update_by_key(&target, &fallback, changes_only)?;
        }
        Ok(updated)
    }

    fn fallback_insert(&mut self, ctx: &BatchContext, table: &Table, row: &RowChange) -> Result<usize, WriterError> {
        let mut inserted = 0;
        for (target, fallback) in self.fallback_rows(ctx, table, row, DataEventType::Insert)? {
            if self.try_insert(&target, &fallback)? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn insert(&mut self, ctx: &BatchContext, table: &Table, row: &RowChange) -> Result<(), WriterError> {
        if self.try_insert(table, row)? {
            return Ok(());
        }
        // duplicate key: the row is already there, apply as an update
        let conflict = self.settings.pick_conflict(&table.name, &ctx.channel_id).clone();
        tracing::debug!(
            "insert into {} hit an existing row in batch {}, falling back to update",
            table.name,
            ctx.batch_id
        );
        if self.fallback_update(ctx, table, row, false)? == 0 {
            return Err(self.conflict_error(ConflictKind::Unresolved, table, row, &conflict));
        }
        self.stats.fallback_insert_count += 1;
        Ok(())
    }

    fn update(&mut self, ctx: &BatchContext, table: &Table, row: &RowChange) -> Result<(), WriterError> {
        let set = if self.settings.apply_changes_only && !row.old.is_empty() {
            row.changed_columns()
        } else {
            row.columns.clone()
        };
        if set.is_empty() {
            tracing::debug!("update of {} in batch {} changes nothing", table.name, ctx.batch_id);
            return Ok(());
        }

        let conflict = self.settings.pick_conflict(&table.name, &ctx.channel_id).clone();
        let filter = ConflictDetector::filter(&conflict, table, row);
        let updated = self.db.update(table, &pairs(&set), &filter)?;
        if updated > 0 {
            self.stats.statement_count += 1;
            self.stats.table(&table.name).updates += 1;
            return Ok(());
        }

        if self.db.count(table, &pairs(&row.keys))? == 0 {
            if row.source_event == DataEventType::Delete {
                self.stats.missing_delete_count += 1;
                return Ok(());
            }
            if self.fallback_insert(ctx, table, row)? == 0 {
                return Err(self.conflict_error(ConflictKind::Unresolved, table, row, &conflict));
            }
            self.stats.fallback_update_count += 1;
            return Ok(());
        }

        tracing::debug!(
            "conflict {} detected on {} at line {} of batch {}",
            conflict.conflict_id,
            table.name,
            self.stats.line_number,
            ctx.batch_id
        );
        match ConflictResolver::plan(&conflict) {
            Resolution::FallbackToKey => {
                if self.fallback_update(ctx, table, row, conflict.resolve_changes_only)? == 0
                    && self.fallback_insert(ctx, table, row)? == 0
                {
                    return Err(self.conflict_error(ConflictKind::Unresolved, table, row, &conflict));
                }
                self.stats.fallback_update_count += 1;
            }
            Resolution::Ignore => self.stats.ignore_row_count += 1,
            Resolution::Escalate => {
                return Err(self.conflict_error(ConflictKind::Manual, table, row, &conflict));
            }
        }
        self.log_resolution(ctx, table, &conflict);
        Ok(())
    }

    fn delete(&mut self, ctx: &BatchContext, table: &Table, row: &RowChange) -> Result<(), WriterError> {
        let conflict = self.settings.pick_conflict(&table.name, &ctx.channel_id).clone();
        let filter = ConflictDetector::filter(&conflict, table, row);
        let deleted = self.db.delete(table, &filter)?;
        if deleted > 0 {
            self.stats.statement_count += 1;
            self.stats.table(&table.name).deletes += 1;
            return Ok(());
        }

        let keys = pairs(&row.keys);
        if self.db.count(table, &keys)? == 0 {
            self.stats.missing_delete_count += 1;
            return Ok(());
        }

        tracing::debug!(
            "conflict {} detected deleting from {} in batch {}",
            conflict.conflict_id,
            table.name,
            ctx.batch_id
        );
        match ConflictResolver::plan(&conflict) {
            Resolution::FallbackToKey => {
                if self.db.delete(table, &keys)? == 0 {
                    return Err(self.conflict_error(ConflictKind::Unresolved, table, row, &conflict));
                }
                self.stats.statement_count += 1;
                self.stats.table(&table.name).deletes += 1;
            }
            Resolution::Ignore => self.stats.ignore_row_count += 1,
            Resolution::Escalate => {
                return Err(self.conflict_error(ConflictKind::Manual, table, row, &conflict));
            }
        }
        self.log_resolution(ctx, table, &conflict);
        Ok(())
    }
}

/// Row images must line up with the table history they were captured with.
fn validate_columns(record: &ChangeRecord) -> Result<(), WriterError> {
    let history = record.history();
    let mismatch = |expected: usize, actual: usize| WriterError::ColumnCountMismatch {
        table: record.table_name().to_string(),
        expected,
        actual,
    };
    let columns = history.column_names.len();
    match record.event_type() {
        DataEventType::Insert | DataEventType::Update => {
            if record.row_values().len() != columns {
                return Err(mismatch(columns, record.row_values().len()));
            }
        }
        DataEventType::Delete => {
            let pks = history.pk_column_names.len();
            if !record.pk_values().is_empty() && record.pk_values().len() != pks {
                return Err(mismatch(pks, record.pk_values().len()));
            }
        }
        _ => {}
    }
    if let Some(old) = record.old_values() {
        if !old.is_empty() && old.len() != columns {
            return Err(mismatch(columns, old.len()));
        }
    }
    Ok(())
}

//! Transform Engine
//!
//! Reshapes source rows into target rows according to configured
//! [`TransformTable`] rules.
//!
//! Lookup and additive transforms read and write the target database
//! directly while a row is being transformed. Additive columns are applied
//! in place and then left out of the generated row.

use crate::domain::entities::{
    BatchContext, ChangeRecord, ColumnValues, TransformColumn, TransformTable, TransformedData,
};
use crate::domain::errors::TransformError;
use crate::domain::ports::{Retransform, TargetDatabase};
use crate::domain::services::column_transforms::{
    ColumnInput, ColumnOutcome, ColumnTransformRegistry, TransformKind,
};
use crate::domain::value_objects::{DataEventType, DeleteAction};
use parking_lot::RwLock;
use std::sync::Arc;

/// A transform rule with its column transform kinds resolved.
struct CompiledTransform {
    table: Arc<TransformTable>,
    kinds: Vec<TransformKind>,
}

/// Source row handed to [`TransformEngine::transform`].
#[derive(Debug, Clone, Copy)]
pub struct SourceRow<'a> {
    pub dml: DataEventType,
    pub catalog: Option<&'a str>,
    pub schema: Option<&'a str>,
    pub table: &'a str,
    pub values: &'a ColumnValues,
    pub key_values: Option<&'a ColumnValues>,
    pub old_values: Option<&'a ColumnValues>,
}

/// Rule-driven row reshaper.
pub struct TransformEngine {
    transforms: RwLock<Vec<CompiledTransform>>,
    registry: ColumnTransformRegistry,
    /// Node group of the routing target; rules for other groups are skipped
    target_node_group: Option<String>,
}

impl TransformEngine {
    pub fn new(registry: ColumnTransformRegistry, target_node_group: Option<String>) -> Self {
        Self {
            transforms: RwLock::new(Vec::new()),
            registry,
            target_node_group,
        }
    }

    /// Replace the active rules. Rules naming an unknown transform type are
    /// logged and skipped. Returns the number of rules loaded.
    pub fn set_transforms(&self, mut tables: Vec<TransformTable>) -> usize {
        tables.sort_by_key(|t| t.transform_order);
        let mut compiled = Vec::with_capacity(tables.len());
        'rules: for table in tables {
            let mut kinds = Vec::with_capacity(table.columns.len());
            for column in &table.columns {
                match self.registry.resolve(&column.transform_type) {
                    Ok(kind) => kinds.push(kind),
                    Err(e) => {
                        tracing::error!(
                            "skipping transform {}: column {}: {}",
                            table.transform_id,
                            column.target_column,
                            e
                        );
                        continue 'rules;
                    }
                }
            }
            compiled.push(CompiledTransform {
                table: Arc::new(table),
                kinds,
            });
        }
        let count = compiled.len();
        *self.transforms.write() = compiled;
        tracing::info!("loaded {} transform rule(s)", count);
        count
    }

    pub fn has_transforms_for(&self, catalog: Option<&str>, schema: Option<&str>, table: &str) -> bool {
        let group = self.target_node_group.as_deref();
        self.transforms
            .read()
            .iter()
            .any(|t| t.table.matches(catalog, schema, table, group))
    }

    /// Apply every matching rule to `row`. Returns no rows when nothing matches.
    pub fn transform(
        &self,
        row: SourceRow<'_>,
        ctx: &BatchContext,
        db: &mut dyn TargetDatabase,
    ) -> Result<Vec<TransformedData>, TransformError> {
        if !row.dml.is_transformable() {
            return Ok(Vec::new());
        }
        let group = self.target_node_group.as_deref();
        let rules: Vec<(Arc<TransformTable>, Vec<TransformKind>)> = self
            .transforms
            .read()
            .iter()
            .filter(|t| t.table.matches(row.catalog, row.schema, row.table, group))
            .map(|t| (t.table.clone(), t.kinds.clone()))
            .collect();
        if rules.is_empty() {
            return Ok(Vec::new());
        }

        let old_values = row.old_values.cloned().unwrap_or_default();
        let key_values = match row.key_values {
            Some(keys) if !keys.is_empty() => keys.clone(),
            _ => ColumnValues::new(),
        };
        // deletes carry their image in the old values, or only the key
        let values = if row.dml == DataEventType::Delete {
            if !old_values.is_empty() {
                old_values.clone()
            } else {
                key_values.clone()
            }
        } else {
            row.values.clone()
        };

        tracing::debug!(
            "{} transformation(s) for {} on {}",
            rules.len(),
            row.dml,
            row.table
        );

        let mut out = Vec::new();
        for (table, kinds) in rules {
            out.extend(self.apply_rule(
                &table,
                &kinds,
                row.dml,
                &key_values,
                &old_values,
                &values,
                ctx,
                db,
            )?);
        }
        Ok(out)
    }

    /// Transform a captured record, building its column maps from the
    /// table history it was captured with.
    pub fn transform_record(
        &self,
        record: &ChangeRecord,
        ctx: &BatchContext,
        db: &mut dyn TargetDatabase,
    ) -> Result<Vec<TransformedData>, TransformError> {
        let values = record.row_map();
        let old = record.old_map();
        let keys = record.key_map();
        self.transform(
            SourceRow {
                dml: record.event_type(),
                catalog: record.catalog(),
                schema: record.schema(),
                table: record.table_name(),
                values: &values,
                key_values: Some(&keys),
                old_values: Some(&old),
            },
            ctx,
            db,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_rule(
        &self,
        table: &Arc<TransformTable>,
        kinds: &[TransformKind],
        dml: DataEventType,
        key_values: &ColumnValues,
        old_values: &ColumnValues,
        values: &ColumnValues,
        ctx: &BatchContext,
        db: &mut dyn TargetDatabase,
    ) -> Result<Vec<TransformedData>, TransformError> {
        if !table.has_primary_key() {
            tracing::error!("no primary key defined for transform {}", table.transform_id);
            return Ok(Vec::new());
        }
        let seeded = match self.seed_keys(table, kinds, dml, key_values, old_values, values, ctx, db)? {
            Some(datas) => datas,
            None => {
                tracing::debug!(
                    "transform {} ignored the row while building its key",
                    table.transform_id
                );
                return Ok(Vec::new());
            }
        };

        let mut out = Vec::with_capacity(seeded.len());
        for data in seeded {
            if let Some(data) = self.perform(table, kinds, data, values, old_values, ctx, db)? {
                tracing::debug!(
                    "transform {} produced {} into {}",
                    table.transform_id,
                    data.target_dml(),
                    table.target_table
                );
                out.push(data);
            }
        }
        Ok(out)
    }

    /// Build target rows from the key columns. A key transform returning
    /// several values fans out into one row per value. `None` means the row
    /// is ignored for this rule.
    #[allow(clippy::too_many_arguments)]
    fn seed_keys(
        &self,
        table: &Arc<TransformTable>,
        kinds: &[TransformKind],
        dml: DataEventType,
        key_values: &ColumnValues,
        old_values: &ColumnValues,
        values: &ColumnValues,
        ctx: &BatchContext,
        db: &mut dyn TargetDatabase,
    ) -> Result<Option<Vec<TransformedData>>, TransformError> {
        let mut datas = vec![TransformedData::new(
            table.clone(),
            dml,
            key_values.clone(),
            old_values.clone(),
            values.clone(),
        )];

        for (column, kind) in table.columns.iter().zip(kinds) {
            if !column.pk || !column.include_on.includes(dml) {
                continue;
            }
            let outcome = self.evaluate(column, kind, &datas[0], values, old_values, ctx, db)?;
            match outcome {
                ColumnOutcome::Value(v) => {
                    for data in datas.iter_mut() {
                        data.put(column, v.clone(), true);
                    }
                }
                ColumnOutcome::Values(vs) => {
                    let Some((first, rest)) = vs.split_first() else {
                        return Ok(None);
                    };
                    let mut fanned = Vec::with_capacity(datas.len() * vs.len());
                    for data in &datas {
                        for v in rest {
                            let mut copy = data.clone();
                            copy.put(column, v.clone(), true);
                            fanned.push(copy);
                        }
                    }
                    for data in datas.iter_mut() {
                        data.put(column, first.clone(), true);
                    }
                    datas.extend(fanned);
                }
                ColumnOutcome::IgnoreColumn | ColumnOutcome::AlreadyApplied => {}
                ColumnOutcome::IgnoreRow => return Ok(None),
            }
        }
        Ok(Some(datas))
    }

    /// Evaluate the non-key columns and settle the target DML. Returns
    /// `None` when the row must not reach the target.
    #[allow(clippy::too_many_arguments)]
    fn perform(
        &self,
        table: &TransformTable,
        kinds: &[TransformKind],
        mut data: TransformedData,
        values: &ColumnValues,
        old_values: &ColumnValues,
        ctx: &BatchContext,
        db: &mut dyn TargetDatabase,
    ) -> Result<Option<TransformedData>, TransformError> {
        let dml = data.source_dml();
        for (column, kind) in table.columns.iter().zip(kinds) {
            if column.pk || !column.include_on.includes(dml) {
                continue;
            }
            if let Some(source) = &column.source_column {
                if !contains_ci(values, source) {
                    tracing::warn!(
                        "could not find source column {} for transform {}",
                        source,
                        table.transform_id
                    );
                    continue;
                }
            }
            if kind.is_pure() && old_values_cover(column, old_values) {
                match self.evaluate(column, kind, &data, old_values, old_values, ctx, db)? {
                    ColumnOutcome::Value(v) => data.put_old(column, v),
                    ColumnOutcome::Values(vs) => data.put_old(column, vs.into_iter().next().flatten()),
                    _ => {}
                }
            }
            match self.evaluate(column, kind, &data, values, old_values, ctx, db)? {
                ColumnOutcome::Value(v) => data.put(column, v, false),
                ColumnOutcome::Values(vs) => data.put(column, vs.into_iter().next().flatten(), false),
                ColumnOutcome::IgnoreColumn => {
                    tracing::debug!("transform ignored target column {}", column.target_column);
                }
                ColumnOutcome::AlreadyApplied => {}
                ColumnOutcome::IgnoreRow => {
                    tracing::debug!(
                        "transform {} ignored the row with key {:?}",
                        table.transform_id,
                        data.target_keys()
                    );
                    return Ok(None);
                }
            }
        }

        if !data.has_columns() {
            return Ok(None);
        }
        if data.target_dml() != DataEventType::Delete {
            if data.target_dml() == DataEventType::Insert && table.update_first {
                data.set_target_dml(DataEventType::Update);
            }
            return Ok(Some(data));
        }
        match table.delete_action {
            DeleteAction::DelRow => {
                data.set_target_dml(DataEventType::Delete);
                Ok(Some(data))
            }
            DeleteAction::UpdateCol => {
                data.set_target_dml(DataEventType::Update);
                Ok(Some(data))
            }
            DeleteAction::None => {
                tracing::debug!(
                    "transform {} does not delete rows; dropping the delete",
                    table.transform_id
                );
                Ok(None)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate(
        &self,
        column: &TransformColumn,
        kind: &TransformKind,
        data: &TransformedData,
        values: &ColumnValues,
        old_values: &ColumnValues,
        ctx: &BatchContext,
        db: &mut dyn TargetDatabase,
    ) -> Result<ColumnOutcome, TransformError> {
        let value = column
            .source_column
            .as_deref()
            .and_then(|c| get_ci(values, c));
        let old_value = column
            .source_column
            .as_deref()
            .and_then(|c| get_ci(old_values, c));
        let input = ColumnInput {
            ctx,
            column,
            data,
            value,
            old_value,
        };
        self.registry.apply(kind, &input, db)
    }
}

impl Retransform for TransformEngine {
    fn retransform(
        &self,
        data: &TransformedData,
        dml: DataEventType,
        ctx: &BatchContext,
        db: &mut dyn TargetDatabase,
    ) -> Result<Vec<TransformedData>, TransformError> {
        let table = data.transformation().clone();
        let kinds: Vec<TransformKind> = table
            .columns
            .iter()
            .map(|c| self.registry.resolve(&c.transform_type))
            .collect::<Result<_, _>>()?;
        let values = if dml == DataEventType::Delete && !data.source_old_values().is_empty() {
            data.source_old_values().clone()
        } else {
            data.source_values().clone()
        };
        self.apply_rule(
            &table,
            &kinds,
            dml,
            data.source_key_values(),
            data.source_old_values(),
            &values,
            ctx,
            db,
        )
    }
}

fn old_values_cover(column: &TransformColumn, old_values: &ColumnValues) -> bool {
    match &column.source_column {
        Some(source) => contains_ci(old_values, source),
        None => false,
    }
}

fn get_ci<'a>(map: &'a ColumnValues, name: &str) -> Option<&'a str> {
    map.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| v.as_deref())
}

fn contains_ci(map: &ColumnValues, name: &str) -> bool {
    map.keys().any(|k| k.eq_ignore_ascii_case(name))
}

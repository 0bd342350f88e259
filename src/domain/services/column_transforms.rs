//! Column Transforms
//!
//! Built-in column transform functions plus a registry for custom ones.
//! Transform type names are resolved to a [`TransformKind`] once, when
//! transform rules are loaded; applying a column is then a plain match.

use crate::domain::entities::{BatchContext, TransformColumn, TransformedData};
use crate::domain::errors::TransformError;
use crate::domain::ports::TargetDatabase;
use crate::domain::value_objects::DataEventType;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolved column transform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransformKind {
    Copy,
    Identity,
    Const,
    Lookup,
    Additive,
    Variable,
    Substr,
    Multiply,
    /// Registered through [`ColumnTransformRegistry::register`]
    Custom(String),
}

impl TransformKind {
    /// Built-in kind for `name`, if it is one.
    pub fn builtin(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "" | "copy" => Some(Self::Copy),
            "identity" => Some(Self::Identity),
            "const" => Some(Self::Const),
            "lookup" => Some(Self::Lookup),
            "additive" => Some(Self::Additive),
            "variable" => Some(Self::Variable),
            "substr" => Some(Self::Substr),
            "multiply" | "multiplier" => Some(Self::Multiply),
            _ => None,
        }
    }

    /// Kinds that only read their input, so they can be rerun over the
    /// old image without touching the target.
    pub fn is_pure(&self) -> bool {
        matches!(
            self,
            Self::Copy | Self::Identity | Self::Const | Self::Substr | Self::Multiply
        )
    }
}

/// What a column transform decided.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnOutcome {
    Value(Option<String>),
    /// Several values; on a key column each one yields its own target row
    Values(Vec<Option<String>>),
    /// Leave this target column out
    IgnoreColumn,
    /// Drop the whole target row for this rule
    IgnoreRow,
    /// The transform already wrote the target; the writer must not set it again
    AlreadyApplied,
}

/// Inputs to one column transform.
pub struct ColumnInput<'a> {
    pub ctx: &'a BatchContext,
    pub column: &'a TransformColumn,
    pub data: &'a TransformedData,
    pub value: Option<&'a str>,
    pub old_value: Option<&'a str>,
}

pub type CustomTransform = dyn Fn(&ColumnInput<'_>, &mut dyn TargetDatabase) -> Result<ColumnOutcome, TransformError>
    + Send
    + Sync;

/// Lookup table from transform names to implementations.
#[derive(Clone, Default)]
pub struct ColumnTransformRegistry {
    custom: HashMap<String, Arc<CustomTransform>>,
}

impl ColumnTransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom transform. Built-in names cannot be replaced;
    /// returns `false` when `name` is one of them.
    pub fn register<F>(&mut self, name: &str, transform: F) -> bool
    where
        F: Fn(&ColumnInput<'_>, &mut dyn TargetDatabase) -> Result<ColumnOutcome, TransformError>
            + Send
            + Sync
            + 'static,
    {
        if TransformKind::builtin(name).is_some() {
            return false;
        }
        self.custom.insert(name.to_lowercase(), Arc::new(transform));
        true
    }

    pub fn resolve(&self, name: &str) -> Result<TransformKind, TransformError> {
        if let Some(kind) = TransformKind::builtin(name) {
            return Ok(kind);
        }
        let key = name.trim().to_lowercase();
        if self.custom.contains_key(&key) {
            Ok(TransformKind::Custom(key))
        } else {
            Err(TransformError::UnknownTransform(name.to_string()))
        }
    }

    pub fn apply(
        &self,
        kind: &TransformKind,
        input: &ColumnInput<'_>,
        db: &mut dyn TargetDatabase,
    ) -> Result<ColumnOutcome, TransformError> {
        match kind {
            TransformKind::Copy | TransformKind::Identity => {
                Ok(ColumnOutcome::Value(input.value.map(str::to_string)))
            }
            TransformKind::Const => Ok(ColumnOutcome::Value(input.column.expression.clone())),
            TransformKind::Variable => variable(input),
            TransformKind::Lookup => lookup(input, db),
            TransformKind::Additive => additive(input, db),
            TransformKind::Substr => substr(input),
            TransformKind::Multiply => multiply(input),
            TransformKind::Custom(name) => match self.custom.get(name) {
                Some(f) => f(input, db),
                None => Err(TransformError::UnknownTransform(name.clone())),
            },
        }
    }
}

fn expression<'a>(input: &'a ColumnInput<'_>) -> Result<&'a str, TransformError> {
    input
        .column
        .expression
        .as_deref()
        .ok_or_else(|| TransformError::InvalidExpression {
            column: input.column.target_column.clone(),
            message: "expression required".to_string(),
        })
}

fn variable(input: &ColumnInput<'_>) -> Result<ColumnOutcome, TransformError> {
    let name = expression(input)?.trim().to_lowercase();
    let now = Utc::now();
    let value = match name.as_str() {
        "system_timestamp" => Some(now.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
        "system_date" => Some(now.format("%Y-%m-%d").to_string()),
        "source_node_id" => Some(input.ctx.source_node_id.to_string()),
        "target_node_id" => Some(input.ctx.target_node_id.to_string()),
        "batch_id" => Some(input.ctx.batch_id.to_string()),
        "old_column_value" => input.old_value.map(str::to_string),
        "null" => None,
        other => {
            return Err(TransformError::InvalidExpression {
                column: input.column.target_column.clone(),
                message: format!("unknown variable '{}'", other),
            })
        }
    };
    Ok(ColumnOutcome::Value(value))
}

/// Runs the expression as a query. Source columns bind as `:NAME`, old
/// values as `:OLD_NAME`.
fn lookup(input: &ColumnInput<'_>, db: &mut dyn TargetDatabase) -> Result<ColumnOutcome, TransformError> {
    let sql = expression(input)?;
    let mut params: Vec<(String, Option<String>)> = input
        .data
        .source_values()
        .iter()
        .map(|(k, v)| (k.to_uppercase(), v.clone()))
        .collect();
    params.extend(
        input
            .data
            .source_old_values()
            .iter()
            .map(|(k, v)| (format!("OLD_{}", k.to_uppercase()), v.clone())),
    );
    let values = db
        .query_values(sql, &params)
        .map_err(|e| TransformError::Lookup(e.to_string()))?;
    if input.column.pk {
        Ok(ColumnOutcome::Values(values))
    } else {
        Ok(ColumnOutcome::Value(values.into_iter().next().flatten()))
    }
}

fn parse_number(column: &str, value: Option<&str>) -> Result<f64, TransformError> {
    match value.map(str::trim) {
        None | Some("") => Ok(0.0),
        Some(v) => v.parse::<f64>().map_err(|_| TransformError::InvalidExpression {
            column: column.to_string(),
            message: format!("'{}' is not numeric", v),
        }),
    }
}

pub(crate) fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Adds `new - old` to the target column. When the target row exists the
/// increment is written here and the column is reported as applied; when it
/// does not, the delta becomes the inserted value.
fn additive(input: &ColumnInput<'_>, db: &mut dyn TargetDatabase) -> Result<ColumnOutcome, TransformError> {
    let column = &input.column.target_column;
    let new = match input.data.source_dml() {
        DataEventType::Delete => 0.0,
        _ => parse_number(column, input.value)?,
    };
    let old = match input.data.source_dml() {
        DataEventType::Insert => 0.0,
        DataEventType::Delete => parse_number(column, input.old_value.or(input.value))?,
        _ => parse_number(column, input.old_value)?,
    };
    let delta = new - old;

    let keys: Vec<(String, Option<String>)> = input.data.target_keys().into_iter().collect();
    if keys.is_empty() {
        return Err(TransformError::NoPrimaryKey(input.data.transformation().transform_id.clone()));
    }
    let table = input.data.transformation().target_table_model();
    if db.count(&table, &keys)? > 0 {
        if delta != 0.0 {
            db.increment(&table, column, delta, &keys)?;
        }
        Ok(ColumnOutcome::AlreadyApplied)
    } else {
        Ok(ColumnOutcome::Value(Some(format_number(delta))))
    }
}

/// `start[,end]` character offsets, clamped to the value.
fn substr(input: &ColumnInput<'_>) -> Result<ColumnOutcome, TransformError> {
    let Some(value) = input.value else {
        return Ok(ColumnOutcome::Value(None));
    };
    let invalid = |message: &str| TransformError::InvalidExpression {
        column: input.column.target_column.clone(),
        message: message.to_string(),
    };
    let expr = expression(input)?;
    let mut parts = expr.split(',').map(str::trim);
    let start: usize = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid("start offset must be a number"))?;
    let end: Option<usize> = match parts.next() {
        Some(e) => Some(e.parse().map_err(|_| invalid("end offset must be a number"))?),
        None => None,
    };
    let chars: Vec<char> = value.chars().collect();
    let start = start.min(chars.len());
    let end = end.unwrap_or(chars.len()).clamp(start, chars.len());
    Ok(ColumnOutcome::Value(Some(chars[start..end].iter().collect())))
}

fn multiply(input: &ColumnInput<'_>) -> Result<ColumnOutcome, TransformError> {
    let Some(value) = input.value else {
        return Ok(ColumnOutcome::Value(None));
    };
    let column = &input.column.target_column;
    let factor = parse_number(column, Some(expression(input)?))?;
    let value = parse_number(column, Some(value))?;
    Ok(ColumnOutcome::Value(Some(format_number(value * factor))))
}

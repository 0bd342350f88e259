//! Batch stream writer (Sans-IO).
//!
//! Renders outgoing batches as protocol lines. Row lines are numbered from 1
//! within each batch; the receiver reports failures by that number.

use super::csv::{format_names, format_row};
use super::tokens;
use crate::domain::entities::{ChangeRecord, OutgoingBatch};
use crate::domain::value_objects::{DataEventType, NodeId};
use std::fmt::Write as _;

/// Text payload for one push.
pub struct BatchStreamWriter {
    out: String,
    table: Option<(Option<String>, Option<String>, String, i64)>,
    rows: usize,
}

impl BatchStreamWriter {
    /// Start a payload sent by `source`.
    pub fn new(source: &NodeId) -> Self {
        let mut writer = Self {
            out: String::new(),
            table: None,
            rows: 0,
        };
        writer.line(&format!("{},{}", tokens::NODE_ID, source));
        writer.line(&format!("{},{}", tokens::BINARY, tokens::BINARY_NONE));
        writer
    }

    /// Append a batch and its records in extraction order.
    pub fn write_batch(&mut self, batch: &OutgoingBatch, records: &[ChangeRecord]) {
        self.line(&format!("{},{}", tokens::CHANNEL, batch.channel_id));
        self.line(&format!("{},{}", tokens::BATCH, batch.batch_id));
        self.table = None;
        self.rows = 0;
        for record in records {
            self.write_record(record);
        }
        self.line(&format!("{},{}", tokens::COMMIT, batch.batch_id));
    }

    /// Number of row lines in the last batch written.
    pub fn rows_in_batch(&self) -> usize {
        self.rows
    }

    pub fn finish(self) -> String {
        self.out
    }

    fn write_record(&mut self, record: &ChangeRecord) {
        let event = record.event_type();
        if event.requires_table() {
            self.table_header(record);
        }
        self.rows += 1;
        match event {
            DataEventType::Insert => {
                self.line(&format_row(tokens::INSERT, record.row_values()));
            }
            DataEventType::Update => {
                self.old_image(record);
                let mut values = record.row_values().to_vec();
                values.extend(record.key_values());
                self.line(&format_row(tokens::UPDATE, &values));
            }
            DataEventType::Delete => {
                self.old_image(record);
                self.line(&format_row(tokens::DELETE, &record.key_values()));
            }
            DataEventType::Sql => self.script_line(tokens::SQL, record),
            DataEventType::Create => self.script_line(tokens::CREATE, record),
            DataEventType::Bsh => self.script_line(tokens::BSH, record),
            DataEventType::Reload => self.line(tokens::RELOAD),
        }
    }

    fn table_header(&mut self, record: &ChangeRecord) {
        let history = record.history();
        let key = (
            record.catalog().map(str::to_string),
            record.schema().map(str::to_string),
            record.table_name().to_string(),
            history.id,
        );
        if self.table.as_ref() == Some(&key) {
            return;
        }
        if let Some(catalog) = &key.0 {
            self.line(&format!("{},{}", tokens::CATALOG, catalog));
        }
        if let Some(schema) = &key.1 {
            self.line(&format!("{},{}", tokens::SCHEMA, schema));
        }
        self.line(&format!("{},{}", tokens::TABLE, key.2));
        self.line(&format_names(tokens::KEYS, &history.pk_column_names));
        self.line(&format_names(tokens::COLUMNS, &history.column_names));
        self.table = Some(key);
    }

    fn old_image(&mut self, record: &ChangeRecord) {
        if let Some(old) = record.old_values() {
            if !old.is_empty() {
                self.line(&format_row(tokens::OLD, old));
            }
        }
    }

    fn script_line(&mut self, token: &str, record: &ChangeRecord) {
        let script = record.script().map(str::to_string);
        self.line(&format_row(token, &[script]));
    }

    fn line(&mut self, text: &str) {
        let _ = writeln!(self.out, "{}", text);
    }
}

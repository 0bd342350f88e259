//! Batch stream reader (Sans-IO).
//!
//! Parses a push payload back into batches of change records. Each record's
//! data id is its 1-based row number within the batch, the same number the
//! receiver reports in a failure acknowledgement.
//!
//! Parsing stops at the first bad line. Batches committed before it are
//! kept, and the batch that was open is reported so it can be acked as a
//! whole-batch failure.

use super::csv::split_line;
use super::tokens;
use crate::domain::entities::{ChangeRecord, TableHistory};
use crate::domain::errors::ProtocolError;
use crate::domain::value_objects::{DataEventType, NodeId};
use std::sync::Arc;

/// One batch as received.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBatch {
    pub batch_id: i64,
    pub channel_id: String,
    pub records: Vec<ChangeRecord>,
    /// Sender asked the batch to be acknowledged without loading
    pub ignored: bool,
}

/// Batch that was open when parsing stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedBatch {
    pub batch_id: i64,
    pub channel_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPayload {
    pub source_node_id: Option<NodeId>,
    /// Batches read up to their commit line
    pub batches: Vec<ParsedBatch>,
    pub failed: Option<FailedBatch>,
    /// Why parsing stopped early
    pub error: Option<ProtocolError>,
}

impl ParsedPayload {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Default)]
struct TableState {
    catalog: Option<String>,
    schema: Option<String>,
    name: Option<String>,
    keys: Vec<String>,
    columns: Vec<String>,
    history: Option<Arc<TableHistory>>,
}

struct Reader {
    payload: ParsedPayload,
    channel: String,
    batch: Option<ParsedBatch>,
    pending_catalog: Option<String>,
    pending_schema: Option<String>,
    table: TableState,
    old: Option<Vec<Option<String>>>,
    next_history_id: i64,
    placeholder: Arc<TableHistory>,
}

/// Parse a payload.
///
/// Fails only when the bad line left nothing to act on: no batch was
/// committed before it and no batch was open.
pub fn read_payload(text: &str) -> Result<ParsedPayload, ProtocolError> {
    let mut reader = Reader {
        payload: ParsedPayload::default(),
        channel: "default".to_string(),
        batch: None,
        pending_catalog: None,
        pending_schema: None,
        table: TableState::default(),
        old: None,
        next_history_id: 1,
        placeholder: Arc::new(TableHistory::new(0, "", "", Vec::new(), Vec::new())),
    };
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if let Err(e) = reader.read_line(index + 1, line) {
            return reader.stop(e);
        }
    }
    if let Some(batch_id) = reader.batch.as_ref().map(|b| b.batch_id) {
        let error = ProtocolError::Malformed {
            line: text.lines().count(),
            message: format!("batch {} was not committed", batch_id),
        };
        return reader.stop(error);
    }
    Ok(reader.payload)
}

impl Reader {
    fn stop(mut self, error: ProtocolError) -> Result<ParsedPayload, ProtocolError> {
        let failed = self.batch.take().map(|batch| FailedBatch {
            batch_id: batch.batch_id,
            channel_id: batch.channel_id,
        });
        if failed.is_none() && self.payload.batches.is_empty() {
            return Err(error);
        }
        self.payload.failed = failed;
        self.payload.error = Some(error);
        Ok(self.payload)
    }

    fn read_line(&mut self, line: usize, text: &str) -> Result<(), ProtocolError> {
        let malformed = |message: String| ProtocolError::Malformed { line, message };
        let mut fields = split_line(text).map_err(malformed)?;
        let token = match fields.first().cloned().flatten() {
            Some(t) => t,
            None => return Err(malformed("missing token".to_string())),
        };
        fields.remove(0);

        match token.as_str() {
            tokens::NODE_ID => {
                self.payload.source_node_id = first(&fields).map(NodeId::new);
            }
            tokens::BINARY => {}
            tokens::CHANNEL => {
                self.channel = first(&fields).unwrap_or_else(|| "default".to_string());
            }
            tokens::BATCH => {
                if let Some(open) = &self.batch {
                    return Err(malformed(format!("batch {} was not committed", open.batch_id)));
                }
                let batch_id = parse_id(&fields).ok_or_else(|| malformed("invalid batch id".to_string()))?;
                self.batch = Some(ParsedBatch {
                    batch_id,
                    channel_id: self.channel.clone(),
                    records: Vec::new(),
                    ignored: false,
                });
                self.table = TableState::default();
                self.old = None;
            }
            tokens::COMMIT => {
                let batch = self.batch.take().ok_or_else(|| ProtocolError::OutsideBatch {
                    line,
                    token: token.clone(),
                })?;
                if let Some(id) = parse_id(&fields) {
                    if id != batch.batch_id {
                        return Err(malformed(format!("commit {} does not close batch {}", id, batch.batch_id)));
                    }
                }
                self.payload.batches.push(batch);
            }
            tokens::IGNORE => {
                self.open_batch(line, &token)?.ignored = true;
            }
            tokens::CATALOG => self.pending_catalog = first(&fields),
            tokens::SCHEMA => self.pending_schema = first(&fields),
            tokens::TABLE => {
                let name = first(&fields).ok_or_else(|| malformed("missing table name".to_string()))?;
                self.table = TableState {
                    catalog: self.pending_catalog.take(),
                    schema: self.pending_schema.take(),
                    name: Some(name),
                    ..Default::default()
                };
                self.old = None;
            }
            tokens::KEYS => {
                self.table.keys = names(fields);
                self.table.history = None;
            }
            tokens::COLUMNS => {
                self.table.columns = names(fields);
                self.table.history = None;
            }
            tokens::OLD => self.old = Some(fields),
            tokens::INSERT => {
                let history = self.history(line)?;
                let record = ChangeRecord::new(DataEventType::Insert, history).with_row(fields);
                self.push(line, &token, record)?;
            }
            tokens::UPDATE => {
                let history = self.history(line)?;
                let key_count = history.pk_column_names.len();
                if fields.len() < key_count {
                    return Err(malformed(format!(
                        "update carries {} values, fewer than its {} key(s)",
                        fields.len(),
                        key_count
                    )));
                }
                let keys = fields.split_off(fields.len() - key_count);
                let mut record = ChangeRecord::new(DataEventType::Update, history)
                    .with_row(fields)
                    .with_pk(keys);
                if let Some(old) = self.old.take() {
                    record = record.with_old(old);
                }
                self.push(line, &token, record)?;
            }
            tokens::DELETE => {
                let history = self.history(line)?;
                let mut record = ChangeRecord::new(DataEventType::Delete, history).with_pk(fields);
                if let Some(old) = self.old.take() {
                    record = record.with_old(old);
                }
                self.push(line, &token, record)?;
            }
            tokens::SQL | tokens::CREATE | tokens::BSH => {
                let event = match token.as_str() {
                    tokens::SQL => DataEventType::Sql,
                    tokens::CREATE => DataEventType::Create,
                    _ => DataEventType::Bsh,
                };
                let record = ChangeRecord::new(event, self.placeholder.clone()).with_row(fields);
                self.push(line, &token, record)?;
            }
            tokens::RELOAD => {
                let record = ChangeRecord::new(DataEventType::Reload, self.placeholder.clone());
                self.push(line, &token, record)?;
            }
            other => tracing::debug!("skipping unknown protocol token '{}' on line {}", other, line),
        }
        Ok(())
    }

    fn open_batch(&mut self, line: usize, token: &str) -> Result<&mut ParsedBatch, ProtocolError> {
        self.batch.as_mut().ok_or_else(|| ProtocolError::OutsideBatch {
            line,
            token: token.to_string(),
        })
    }

    fn push(&mut self, line: usize, token: &str, record: ChangeRecord) -> Result<(), ProtocolError> {
        let channel = self.channel.clone();
        let batch = self.open_batch(line, token)?;
        let row = batch.records.len() as i64 + 1;
        batch.records.push(record.with_data_id(row).with_channel(channel));
        Ok(())
    }

    fn history(&mut self, line: usize) -> Result<Arc<TableHistory>, ProtocolError> {
        if let Some(history) = &self.table.history {
            return Ok(history.clone());
        }
        let name = self.table.name.clone().ok_or(ProtocolError::NoTable { line })?;
        let history = Arc::new(
            TableHistory::new(
                self.next_history_id,
                name.clone(),
                name,
                self.table.columns.clone(),
                self.table.keys.clone(),
            )
            .with_qualifiers(self.table.catalog.clone(), self.table.schema.clone()),
        );
        self.next_history_id += 1;
        self.table.history = Some(history.clone());
        Ok(history)
    }
}

fn first(fields: &[Option<String>]) -> Option<String> {
    fields.first().cloned().flatten()
}

fn parse_id(fields: &[Option<String>]) -> Option<i64> {
    first(fields).and_then(|v| v.trim().parse().ok())
}

fn names(fields: Vec<Option<String>>) -> Vec<String> {
    fields.into_iter().flatten().collect()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    const BATCH_42: &str = "nodeid,corp\n\
binary,NONE\n\
channel,sales\n\
batch,42\n\
table,customer\n\
keys,id\n\
columns,id,name\n\
insert,\"1\",\"ann\"\n\
old,\"1\",\"ann\"\n\
update,\"1\",\"bob\",\"1\"\n\
delete,\"1\"\n\
commit,42\n";

    #[test]
    fn test_read_batch_42() {
        let payload = read_payload(BATCH_42).unwrap();
        assert_eq!(payload.source_node_id, Some(NodeId::new("corp")));
        assert_eq!(payload.batches.len(), 1);

        let batch = &payload.batches[0];
        assert_eq!(batch.batch_id, 42);
        assert_eq!(batch.channel_id, "sales");
        let events: Vec<_> = batch.records.iter().map(|r| r.event_type()).collect();
        assert_eq!(events, vec![DataEventType::Insert, DataEventType::Update, DataEventType::Delete]);

        let update = &batch.records[1];
        assert_eq!(update.data_id(), 2);
        assert_eq!(update.row_values(), &[Some("1".to_string()), Some("bob".to_string())]);
        assert_eq!(update.pk_values(), &[Some("1".to_string())]);
        assert_eq!(update.old_values().map(|o| o.len()), Some(2));
        assert_eq!(update.channel_id(), "sales");
        assert!(batch.records[2].old_values().is_none());
    }

    #[test]
    fn test_qualifiers_and_nulls() {
        let text = "batch,1\ncatalog,main\nschema,shop\ntable,orders\nkeys,id\ncolumns,id,note\ninsert,\"7\",\ncommit,1\n";
        let payload = read_payload(text).unwrap();
        let record = &payload.batches[0].records[0];
        assert_eq!(record.catalog(), Some("main"));
        assert_eq!(record.schema(), Some("shop"));
        assert_eq!(record.row_values(), &[Some("7".to_string()), None]);
    }

    #[test]
    fn test_multiple_batches() {
        let text = "channel,a\nbatch,1\nsql,\"vacuum\"\ncommit,1\nchannel,b\nbatch,2\nignore\ncommit,2\n";
        let payload = read_payload(text).unwrap();
        assert_eq!(payload.batches.len(), 2);
        assert_eq!(payload.batches[0].records[0].script(), Some("vacuum"));
        assert_eq!(payload.batches[1].channel_id, "b");
        assert!(payload.batches[1].ignored);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            read_payload("insert,\"1\"\n"),
            Err(ProtocolError::NoTable { line: 1 })
        ));
        assert!(matches!(
            read_payload("table,t\ncolumns,id\ninsert,\"1\"\n"),
            Err(ProtocolError::OutsideBatch { line: 3, .. })
        ));
        assert!(matches!(
            read_payload("batch,x\n"),
            Err(ProtocolError::Malformed { line: 1, .. })
        ));
    }

    #[test]
    fn test_open_batch_is_reported_as_failed() {
        let payload = read_payload("channel,a\nbatch,1\ntable,t\n").unwrap();
        assert!(payload.batches.is_empty());
        assert_eq!(
            payload.failed,
            Some(FailedBatch {
                batch_id: 1,
                channel_id: "a".to_string()
            })
        );
        assert!(matches!(payload.error, Some(ProtocolError::Malformed { .. })));

        let payload = read_payload("batch,1\ncommit,2\n").unwrap();
        assert_eq!(payload.failed.map(|f| f.batch_id), Some(1));
        assert!(matches!(payload.error, Some(ProtocolError::Malformed { line: 2, .. })));
    }

    #[test]
    fn test_bad_line_keeps_committed_batches() {
        let text = "nodeid,corp\n\
channel,sales\n\
batch,1\n\
table,customer\n\
keys,id\n\
columns,id,name\n\
insert,\"1\",\"ann\"\n\
commit,1\n\
channel,audit\n\
batch,2\n\
table,customer\n\
keys,id\n\
columns,id,name\n\
insert,\"2\",\"bad\"x\n\
commit,2\n\
channel,sales\n\
batch,3\n\
commit,3\n";
        let payload = read_payload(text).unwrap();
        assert!(!payload.is_complete());
        assert_eq!(payload.batches.len(), 1);
        assert_eq!(payload.batches[0].batch_id, 1);
        assert_eq!(
            payload.failed,
            Some(FailedBatch {
                batch_id: 2,
                channel_id: "audit".to_string()
            })
        );
        assert!(matches!(payload.error, Some(ProtocolError::Malformed { line: 14, .. })));
    }

    #[test]
    fn test_bad_line_between_batches_keeps_earlier_ones() {
        let payload = read_payload("batch,1\ncommit,1\nbatch,oops\n").unwrap();
        assert_eq!(payload.batches.len(), 1);
        assert!(payload.failed.is_none());
        assert!(!payload.is_complete());
    }

    #[test]
    fn test_written_line_breaks_read_back() {
        use crate::domain::entities::OutgoingBatch;
        use crate::protocol::BatchStreamWriter;

        let history = Arc::new(TableHistory::new(
            3,
            "customer",
            "customer",
            vec!["id".into(), "name".into()],
            vec!["id".into()],
        ));
        let rows = [
            vec![Some("1".to_string()), Some("line one\nline two".to_string())],
            vec![Some("2".to_string()), Some("crlf\r\nend\r".to_string())],
        ];
        let records: Vec<_> = rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                ChangeRecord::new(DataEventType::Insert, history.clone())
                    .with_data_id(i as i64 + 1)
                    .with_row(row.clone())
            })
            .collect();
        let mut writer = BatchStreamWriter::new(&NodeId::new("corp"));
        writer.write_batch(&OutgoingBatch::new(5, NodeId::new("store-1"), "sales"), &records);

        let payload = read_payload(&writer.finish()).unwrap();
        assert!(payload.is_complete());
        let read: Vec<_> = payload.batches[0].records.iter().map(|r| r.row_values().to_vec()).collect();
        assert_eq!(read, rows.to_vec());
    }
}

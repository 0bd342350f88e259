//! SQLite Batch Store
//!
//! Runtime store of the sending and receiving sides: table history, the
//! change log and its routing rows, outgoing batches with their history,
//! and the incoming batch ledger. Ids come from AUTOINCREMENT sequences so
//! several workers sharing the file never hand out the same id.

use crate::domain::entities::{
    BatchHistory, ChangeRecord, IncomingBatch, OutgoingBatch, TableHistory, TableHistoryRegistry,
};
use crate::domain::ports::{BatchRepository, ChangeLog, IncomingBatchRepository, UnbatchedEvent};
use crate::domain::value_objects::{BatchStatus, BatchType, DataEventType, NodeId};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS table_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trigger_id TEXT NOT NULL,
    source_catalog TEXT,
    source_schema TEXT,
    source_table TEXT NOT NULL,
    column_names TEXT NOT NULL,
    pk_column_names TEXT NOT NULL,
    table_hash INTEGER NOT NULL,
    trigger_row_hash INTEGER NOT NULL,
    create_time TEXT NOT NULL,
    inactive_time TEXT
);
CREATE TABLE IF NOT EXISTS data (
    data_id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    event_type TEXT NOT NULL,
    row_data TEXT,
    pk_data TEXT,
    old_data TEXT,
    table_history_id INTEGER NOT NULL,
    channel_id TEXT NOT NULL,
    create_time TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS data_event (
    data_id INTEGER NOT NULL,
    node_id TEXT NOT NULL,
    batch_id INTEGER,
    PRIMARY KEY (data_id, node_id)
);
CREATE INDEX IF NOT EXISTS data_event_batch ON data_event (batch_id, data_id);
CREATE TABLE IF NOT EXISTS outgoing_batch (
    batch_id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    status TEXT NOT NULL,
    batch_type TEXT NOT NULL,
    error_flag INTEGER NOT NULL DEFAULT 0,
    data_event_count INTEGER NOT NULL DEFAULT 0,
    ignore_count INTEGER NOT NULL DEFAULT 0,
    failed_data_id INTEGER NOT NULL DEFAULT 0,
    create_time TEXT NOT NULL,
    last_update_time TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS outgoing_batch_hist (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id INTEGER NOT NULL,
    node_id TEXT NOT NULL,
    status TEXT NOT NULL,
    statement_count INTEGER NOT NULL,
    fallback_insert_count INTEGER NOT NULL,
    fallback_update_count INTEGER NOT NULL,
    missing_delete_count INTEGER NOT NULL,
    failed_line_number INTEGER NOT NULL,
    failed_data_id INTEGER NOT NULL,
    create_time TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS incoming_batch (
    batch_id INTEGER NOT NULL,
    node_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    status TEXT NOT NULL,
    statement_count INTEGER NOT NULL,
    fallback_insert_count INTEGER NOT NULL,
    fallback_update_count INTEGER NOT NULL,
    missing_delete_count INTEGER NOT NULL,
    ignore_count INTEGER NOT NULL,
    failed_row_number INTEGER NOT NULL,
    last_update_time TEXT NOT NULL,
    PRIMARY KEY (batch_id, node_id)
);
";

const BATCH_COLUMNS: &str = "batch_id, node_id, channel_id, status, batch_type, error_flag, \
     data_event_count, ignore_count, failed_data_id, create_time, last_update_time";

/// Change-log row as stored, before its arrays are decoded.
struct StoredData {
    data_id: i64,
    event_type: String,
    row_data: Option<String>,
    pk_data: Option<String>,
    old_data: Option<String>,
    table_history_id: i64,
    channel_id: String,
    create_time: DateTime<Utc>,
}

/// SQLite-backed batch store. Opens a connection per operation.
pub struct SqliteBatchStore {
    db_path: String,
    histories: RwLock<TableHistoryRegistry>,
}

impl SqliteBatchStore {
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            histories: RwLock::new(TableHistoryRegistry::new()),
        }
    }

    /// Create the schema and load table history snapshots.
    pub fn init_db(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(SCHEMA)?;

        let mut stmt = conn.prepare(
            "SELECT id, trigger_id, source_catalog, source_schema, source_table, column_names,
                    pk_column_names, table_hash, trigger_row_hash, create_time, inactive_time
             FROM table_history ORDER BY id",
        )?;
        let stored = stmt
            .query_map([], |row| Self::row_to_history(row))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut registry = self.histories.write();
        let count = stored.len();
        for history in stored {
            registry.load(history);
        }
        tracing::info!(
            "batch store ready at {} ({} table history snapshot(s))",
            self.db_path,
            count
        );
        Ok(())
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn row_to_history(row: &Row) -> rusqlite::Result<TableHistory> {
        let mut history = TableHistory::new(
            row.get(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(4)?,
            json_column(row, 5)?,
            json_column(row, 6)?,
        )
        .with_qualifiers(row.get(2)?, row.get(3)?);
        history.table_hash = row.get::<_, i64>(7)? as u32;
        history.trigger_row_hash = row.get::<_, i64>(8)? as u32;
        history.create_time = row.get(9)?;
        history.inactive_time = row.get(10)?;
        Ok(history)
    }

    fn row_to_batch(row: &Row) -> rusqlite::Result<OutgoingBatch> {
        Ok(OutgoingBatch {
            batch_id: row.get(0)?,
            node_id: NodeId::new(row.get::<_, String>(1)?),
            channel_id: row.get(2)?,
            status: BatchStatus::from_code(&row.get::<_, String>(3)?).unwrap_or(BatchStatus::New),
            batch_type: BatchType::from_code(&row.get::<_, String>(4)?),
            error_flag: row.get::<_, i64>(5)? != 0,
            data_event_count: row.get(6)?,
            ignore_count: row.get(7)?,
            failed_data_id: row.get(8)?,
            create_time: row.get(9)?,
            last_update_time: row.get(10)?,
        })
    }

    fn row_to_batch_history(row: &Row) -> rusqlite::Result<BatchHistory> {
        Ok(BatchHistory {
            batch_id: row.get(0)?,
            node_id: NodeId::new(row.get::<_, String>(1)?),
            status: BatchStatus::from_code(&row.get::<_, String>(2)?).unwrap_or(BatchStatus::Error),
            statement_count: row.get(3)?,
            fallback_insert_count: row.get(4)?,
            fallback_update_count: row.get(5)?,
            missing_delete_count: row.get(6)?,
            failed_line_number: row.get(7)?,
            failed_data_id: row.get(8)?,
            create_time: row.get(9)?,
        })
    }

    fn row_to_data(row: &Row) -> rusqlite::Result<StoredData> {
        Ok(StoredData {
            data_id: row.get(0)?,
            event_type: row.get(1)?,
            row_data: row.get(2)?,
            pk_data: row.get(3)?,
            old_data: row.get(4)?,
            table_history_id: row.get(5)?,
            channel_id: row.get(6)?,
            create_time: row.get(7)?,
        })
    }

    fn row_to_incoming(row: &Row) -> rusqlite::Result<IncomingBatch> {
        Ok(IncomingBatch {
            batch_id: row.get(0)?,
            node_id: NodeId::new(row.get::<_, String>(1)?),
            channel_id: row.get(2)?,
            status: BatchStatus::from_code(&row.get::<_, String>(3)?).unwrap_or(BatchStatus::Error),
            statement_count: row.get(4)?,
            fallback_insert_count: row.get(5)?,
            fallback_update_count: row.get(6)?,
            missing_delete_count: row.get(7)?,
            ignore_count: row.get(8)?,
            failed_row_number: row.get(9)?,
            last_update_time: row.get(10)?,
        })
    }

    /// Snapshot by id, from the cache or storage.
    fn history_by_id(&self, conn: &Connection, id: i64) -> Result<Arc<TableHistory>> {
        if let Some(history) = self.histories.read().get(id) {
            return Ok(history);
        }
        let history = conn
            .query_row(
                "SELECT id, trigger_id, source_catalog, source_schema, source_table, column_names,
                        pk_column_names, table_hash, trigger_row_hash, create_time, inactive_time
                 FROM table_history WHERE id = ?",
                [id],
                |row| Self::row_to_history(row),
            )
            .optional()?
            .ok_or_else(|| anyhow!("table history {} not found", id))?;
        let mut registry = self.histories.write();
        registry.load(history);
        registry
            .get(id)
            .ok_or_else(|| anyhow!("table history {} not found", id))
    }

    fn decode(&self, conn: &Connection, stored: StoredData) -> Result<ChangeRecord> {
        let event = DataEventType::from_code(&stored.event_type)
            .ok_or_else(|| anyhow!("unknown event type '{}' for data {}", stored.event_type, stored.data_id))?;
        let history = self.history_by_id(conn, stored.table_history_id)?;
        let mut record = ChangeRecord::new(event, history)
            .with_data_id(stored.data_id)
            .with_channel(stored.channel_id)
            .with_create_time(stored.create_time);
        if let Some(row) = stored.row_data {
            record = record.with_row(serde_json::from_str(&row)?);
        }
        if let Some(pk) = stored.pk_data {
            record = record.with_pk(serde_json::from_str(&pk)?);
        }
        if let Some(old) = stored.old_data {
            record = record.with_old(serde_json::from_str(&old)?);
        }
        Ok(record)
    }

    fn insert_history(conn: &Connection, history: &BatchHistory) -> Result<()> {
        conn.execute(
            "INSERT INTO outgoing_batch_hist
             (batch_id, node_id, status, statement_count, fallback_insert_count, fallback_update_count,
              missing_delete_count, failed_line_number, failed_data_id, create_time)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                history.batch_id,
                history.node_id.as_str(),
                history.status.code(),
                history.statement_count,
                history.fallback_insert_count,
                history.fallback_update_count,
                history.missing_delete_count,
                history.failed_line_number,
                history.failed_data_id,
                history.create_time,
            ],
        )?;
        Ok(())
    }
}

fn json_column(row: &Row, idx: usize) -> rusqlite::Result<Vec<String>> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn encode_values(values: &[Option<String>]) -> Result<Option<String>> {
    if values.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(values)?))
}

impl BatchRepository for SqliteBatchStore {
    fn pending_batches(&self, node_id: &NodeId) -> Result<Vec<OutgoingBatch>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM outgoing_batch WHERE node_id = ? AND status IN ('NE', 'ER') ORDER BY batch_id",
            BATCH_COLUMNS
        ))?;
        let batches = stmt
            .query_map([node_id.as_str()], |row| Self::row_to_batch(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(batches)
    }

    fn get_batch(&self, batch_id: i64) -> Result<Option<OutgoingBatch>> {
        let conn = self.connect()?;
        let batch = conn
            .query_row(
                &format!("SELECT {} FROM outgoing_batch WHERE batch_id = ?", BATCH_COLUMNS),
                [batch_id],
                |row| Self::row_to_batch(row),
            )
            .optional()?;
        Ok(batch)
    }

    fn records_for_batch(&self, batch_id: i64) -> Result<Vec<ChangeRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT d.data_id, d.event_type, d.row_data, d.pk_data, d.old_data, d.table_history_id,
                    d.channel_id, d.create_time
             FROM data_event e JOIN data d ON d.data_id = e.data_id
             WHERE e.batch_id = ?
             ORDER BY d.data_id",
        )?;
        let stored = stmt
            .query_map([batch_id], |row| Self::row_to_data(row))?
            .collect::<Result<Vec<_>, _>>()?;
        stored.into_iter().map(|s| self.decode(&conn, s)).collect()
    }

    fn data_id_at_line(&self, batch_id: i64, line: i64) -> Result<Option<i64>> {
        if line <= 0 {
            return Ok(None);
        }
        let conn = self.connect()?;
        let data_id = conn
            .query_row(
                "SELECT data_id FROM data_event WHERE batch_id = ? ORDER BY data_id LIMIT 1 OFFSET ?",
                params![batch_id, line - 1],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data_id)
    }

    fn record_outcome(&self, status: BatchStatus, history: &BatchHistory) -> Result<usize> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE outgoing_batch
             SET status = ?, error_flag = ?, failed_data_id = ?, last_update_time = ?
             WHERE batch_id = ? AND node_id = ?",
            params![
                status.code(),
                status == BatchStatus::Error,
                history.failed_data_id,
                Utc::now(),
                history.batch_id,
                history.node_id.as_str(),
            ],
        )?;
        if updated > 0 {
            Self::insert_history(&tx, history)?;
        }
        tx.commit()?;
        Ok(updated)
    }

    fn mark_ignored(&self, batch: &OutgoingBatch) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE outgoing_batch
             SET status = 'OK', error_flag = 0, ignore_count = ignore_count + 1, last_update_time = ?
             WHERE batch_id = ?",
            params![Utc::now(), batch.batch_id],
        )?;
        Self::insert_history(
            &tx,
            &BatchHistory {
                batch_id: batch.batch_id,
                node_id: batch.node_id.clone(),
                status: BatchStatus::Ok,
                statement_count: 0,
                fallback_insert_count: 0,
                fallback_update_count: 0,
                missing_delete_count: 0,
                failed_line_number: 0,
                failed_data_id: 0,
                create_time: Utc::now(),
            },
        )?;
        tx.commit()?;
        Ok(())
    }

    fn history(&self, batch_id: i64) -> Result<Vec<BatchHistory>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT batch_id, node_id, status, statement_count, fallback_insert_count, fallback_update_count,
                    missing_delete_count, failed_line_number, failed_data_id, create_time
             FROM outgoing_batch_hist WHERE batch_id = ? ORDER BY id",
        )?;
        let rows = stmt
            .query_map([batch_id], |row| Self::row_to_batch_history(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn create_batch(
        &self,
        node_id: &NodeId,
        channel_id: &str,
        batch_type: BatchType,
        data_ids: &[i64],
    ) -> Result<OutgoingBatch> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let now = Utc::now();
        tx.execute(
            "INSERT INTO outgoing_batch (node_id, channel_id, status, batch_type, data_event_count, create_time, last_update_time)
             VALUES (?, ?, 'NE', ?, ?, ?, ?)",
            params![node_id.as_str(), channel_id, batch_type.code(), data_ids.len() as i64, now, now],
        )?;
        let batch_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare("UPDATE data_event SET batch_id = ? WHERE data_id = ? AND node_id = ?")?;
            for data_id in data_ids {
                stmt.execute(params![batch_id, data_id, node_id.as_str()])?;
            }
        }
        tx.commit()?;

        let mut batch = OutgoingBatch::new(batch_id, node_id.clone(), channel_id);
        batch.batch_type = batch_type;
        batch.data_event_count = data_ids.len() as i64;
        batch.create_time = now;
        batch.last_update_time = now;
        Ok(batch)
    }
}

impl ChangeLog for SqliteBatchStore {
    fn register_table_history(
        &self,
        trigger_id: &str,
        table: &str,
        columns: &[String],
        pk_columns: &[String],
    ) -> Result<Arc<TableHistory>> {
        let hash = TableHistory::structure_hash(table, columns, pk_columns);
        if let Some(active) = self.histories.read().active_for(trigger_id) {
            if active.table_hash == hash {
                return Ok(active);
            }
        }

        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let now = Utc::now();
        tx.execute(
            "UPDATE table_history SET inactive_time = ? WHERE trigger_id = ? AND inactive_time IS NULL",
            params![now, trigger_id],
        )?;
        let draft = TableHistory::new(0, trigger_id, table, columns.to_vec(), pk_columns.to_vec());
        tx.execute(
            "INSERT INTO table_history
             (trigger_id, source_table, column_names, pk_column_names, table_hash, trigger_row_hash, create_time)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                trigger_id,
                table,
                serde_json::to_string(columns)?,
                serde_json::to_string(pk_columns)?,
                draft.table_hash as i64,
                draft.trigger_row_hash as i64,
                draft.create_time,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        let history = TableHistory { id, ..draft };
        let mut registry = self.histories.write();
        if let Some(previous) = registry.supersede(history) {
            tracing::info!(
                "table {} changed shape, history {} replaces {}",
                table,
                id,
                previous
            );
        }
        registry
            .get(id)
            .ok_or_else(|| anyhow!("table history {} not registered", id))
    }

    fn append(&self, record: &ChangeRecord, targets: &[NodeId]) -> Result<i64> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let old = match record.old_values() {
            Some(old) => encode_values(old)?,
            None => None,
        };
        tx.execute(
            "INSERT INTO data (table_name, event_type, row_data, pk_data, old_data, table_history_id, channel_id, create_time)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.table_name(),
                record.event_type().code(),
                encode_values(record.row_values())?,
                encode_values(record.pk_values())?,
                old,
                record.history().id,
                record.channel_id(),
                record.create_time(),
            ],
        )?;
        let data_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare("INSERT INTO data_event (data_id, node_id) VALUES (?, ?)")?;
            for target in targets {
                stmt.execute(params![data_id, target.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(data_id)
    }

    fn unbatched(&self, node_id: &NodeId) -> Result<Vec<UnbatchedEvent>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT d.data_id, d.channel_id, d.create_time
             FROM data_event e JOIN data d ON d.data_id = e.data_id
             WHERE e.node_id = ? AND e.batch_id IS NULL
             ORDER BY d.data_id",
        )?;
        let events = stmt
            .query_map([node_id.as_str()], |row| {
                Ok(UnbatchedEvent {
                    data_id: row.get(0)?,
                    channel_id: row.get(1)?,
                    create_time: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}

impl IncomingBatchRepository for SqliteBatchStore {
    fn find_incoming(&self, batch_id: i64, node_id: &NodeId) -> Result<Option<IncomingBatch>> {
        let conn = self.connect()?;
        let batch = conn
            .query_row(
                "SELECT batch_id, node_id, channel_id, status, statement_count, fallback_insert_count,
                        fallback_update_count, missing_delete_count, ignore_count, failed_row_number,
                        last_update_time
                 FROM incoming_batch WHERE batch_id = ? AND node_id = ?",
                params![batch_id, node_id.as_str()],
                |row| Self::row_to_incoming(row),
            )
            .optional()?;
        Ok(batch)
    }

    fn save_incoming(&self, batch: &IncomingBatch) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO incoming_batch
             (batch_id, node_id, channel_id, status, statement_count, fallback_insert_count,
              fallback_update_count, missing_delete_count, ignore_count, failed_row_number, last_update_time)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                batch.batch_id,
                batch.node_id.as_str(),
                batch.channel_id,
                batch.status.code(),
                batch.statement_count,
                batch.fallback_insert_count,
                batch.fallback_update_count,
                batch.missing_delete_count,
                batch.ignore_count,
                batch.failed_row_number,
                batch.last_update_time,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn store() -> (NamedTempFile, SqliteBatchStore) {
        let temp = NamedTempFile::new().unwrap();
        let store = SqliteBatchStore::new(temp.path().to_str().unwrap());
        store.init_db().unwrap();
        (temp, store)
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn vals(values: &[&str]) -> Vec<Option<String>> {
        values.iter().map(|v| Some(v.to_string())).collect()
    }

    #[test]
    fn test_table_history_supersede() {
        let (_temp, store) = store();
        let first = store
            .register_table_history("customer", "customer", &cols(&["id", "name"]), &cols(&["id"]))
            .unwrap();
        let same = store
            .register_table_history("customer", "customer", &cols(&["id", "name"]), &cols(&["id"]))
            .unwrap();
        assert_eq!(first.id, same.id);

        let widened = store
            .register_table_history("customer", "customer", &cols(&["id", "name", "val"]), &cols(&["id"]))
            .unwrap();
        assert_ne!(widened.id, first.id);
        assert!(widened.is_active());

        let again = store
            .register_table_history("customer", "customer", &cols(&["id", "name", "val"]), &cols(&["id"]))
            .unwrap();
        assert_eq!(again.id, widened.id);
    }

    #[test]
    fn test_history_survives_reopen() {
        let (temp, store) = store();
        let history = store
            .register_table_history("customer", "customer", &cols(&["id", "name"]), &cols(&["id"]))
            .unwrap();
        let record = ChangeRecord::new(DataEventType::Insert, history).with_row(vals(&["1", "ann"]));
        let node = NodeId::new("store-1");
        let data_id = store.append(&record, &[node.clone()]).unwrap();
        let batch = store.create_batch(&node, "default", BatchType::Events, &[data_id]).unwrap();

        let reopened = SqliteBatchStore::new(temp.path().to_str().unwrap());
        reopened.init_db().unwrap();
        let records = reopened.records_for_batch(batch.batch_id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].history().column_names, cols(&["id", "name"]));
        assert_eq!(records[0].row_values(), &vals(&["1", "ann"])[..]);
    }

    #[test]
    fn test_append_route_and_batch() {
        let (_temp, store) = store();
        let history = store
            .register_table_history("customer", "customer", &cols(&["id", "name"]), &cols(&["id"]))
            .unwrap();
        let a = NodeId::new("store-1");
        let b = NodeId::new("store-2");

        let insert = ChangeRecord::new(DataEventType::Insert, history.clone())
            .with_row(vals(&["1", "ann"]))
            .with_channel("sales");
        let delete = ChangeRecord::new(DataEventType::Delete, history)
            .with_pk(vals(&["1"]))
            .with_old(vals(&["1", "ann"]))
            .with_channel("sales");
        let first = store.append(&insert, &[a.clone(), b.clone()]).unwrap();
        let second = store.append(&delete, &[a.clone()]).unwrap();
        assert!(second > first);

        let unbatched = store.unbatched(&a).unwrap();
        assert_eq!(unbatched.iter().map(|e| e.data_id).collect::<Vec<_>>(), vec![first, second]);
        assert_eq!(store.unbatched(&b).unwrap().len(), 1);

        let batch = store.create_batch(&a, "sales", BatchType::Events, &[first, second]).unwrap();
        assert_eq!(batch.status, BatchStatus::New);
        assert!(store.unbatched(&a).unwrap().is_empty());
        assert_eq!(store.unbatched(&b).unwrap().len(), 1);

        let records = store.records_for_batch(batch.batch_id).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].event_type(), DataEventType::Delete);
        assert_eq!(records[1].old_values().map(|o| o.len()), Some(2));
        assert_eq!(records[1].channel_id(), "sales");

        assert_eq!(store.data_id_at_line(batch.batch_id, 2).unwrap(), Some(second));
        assert_eq!(store.data_id_at_line(batch.batch_id, 0).unwrap(), None);
        assert_eq!(store.data_id_at_line(batch.batch_id, 3).unwrap(), None);
    }

    #[test]
    fn test_record_outcome_and_history() {
        let (_temp, store) = store();
        let node = NodeId::new("store-1");
        let batch = store.create_batch(&node, "sales", BatchType::Events, &[]).unwrap();
        assert_eq!(store.pending_batches(&node).unwrap().len(), 1);

        let history = BatchHistory {
            batch_id: batch.batch_id,
            node_id: node.clone(),
            status: BatchStatus::Error,
            statement_count: 1,
            fallback_insert_count: 0,
            fallback_update_count: 0,
            missing_delete_count: 0,
            failed_line_number: 2,
            failed_data_id: 1002,
            create_time: Utc::now(),
        };
        assert_eq!(store.record_outcome(BatchStatus::Error, &history).unwrap(), 1);
        let stored = store.get_batch(batch.batch_id).unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Error);
        assert!(stored.error_flag);
        assert_eq!(stored.failed_data_id, 1002);
        assert_eq!(store.pending_batches(&node).unwrap().len(), 1);

        let rows = store.history(batch.batch_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].failed_line_number, 2);

        let unknown = BatchHistory { batch_id: 999, ..history };
        assert_eq!(store.record_outcome(BatchStatus::Ok, &unknown).unwrap(), 0);
        assert!(store.history(999).unwrap().is_empty());
    }

    #[test]
    fn test_mark_ignored() {
        let (_temp, store) = store();
        let node = NodeId::new("store-1");
        let batch = store.create_batch(&node, "noise", BatchType::Events, &[]).unwrap();
        store.mark_ignored(&batch).unwrap();
        let stored = store.get_batch(batch.batch_id).unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Ok);
        assert_eq!(stored.ignore_count, 1);
        assert_eq!(store.history(batch.batch_id).unwrap()[0].status, BatchStatus::Ok);
        assert!(store.pending_batches(&node).unwrap().is_empty());
    }

    #[test]
    fn test_incoming_ledger() {
        let (_temp, store) = store();
        let node = NodeId::new("corp");
        assert!(store.find_incoming(42, &node).unwrap().is_none());

        let mut incoming = IncomingBatch::new(42, node.clone(), "sales");
        incoming.statement_count = 3;
        store.save_incoming(&incoming).unwrap();
        incoming.status = BatchStatus::Error;
        incoming.failed_row_number = 2;
        store.save_incoming(&incoming).unwrap();

        let found = store.find_incoming(42, &node).unwrap().unwrap();
        assert_eq!(found.status, BatchStatus::Error);
        assert_eq!(found.failed_row_number, 2);
    }
}

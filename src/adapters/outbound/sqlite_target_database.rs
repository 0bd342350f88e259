//! SQLite Target Database
//!
//! Implements TargetDatabase over one rusqlite connection. Values are bound
//! as text and SQLite's column affinity converts them on the way in.

use crate::domain::entities::{Column, Table};
use crate::domain::errors::DbError;
use crate::domain::ports::{Assignments, TargetDatabase};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ToSql};

// Extended result codes
const SQLITE_CONSTRAINT_FOREIGNKEY: i32 = 787;
const SQLITE_CONSTRAINT_PRIMARYKEY: i32 = 1555;
const SQLITE_CONSTRAINT_UNIQUE: i32 = 2067;

pub struct SqliteTargetDatabase {
    conn: Connection,
}

impl SqliteTargetDatabase {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn begin(&mut self) -> Result<(), DbError> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN").map_err(|e| map_error("", e))?;
        }
        Ok(())
    }

    fn run(&mut self, table: &Table, sql: &str, params: &[&dyn ToSql]) -> Result<usize, DbError> {
        self.begin()?;
        tracing::trace!("{}", sql);
        self.conn
            .execute(sql, params)
            .map_err(|e| map_error(&table.name, e))
    }
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn qualified(table: &Table) -> String {
    match &table.schema {
        Some(schema) => format!("{}.{}", quote(schema), quote(&table.name)),
        None => quote(&table.name),
    }
}

/// `a = ? AND b IS NULL`, with the bound values in order.
fn where_clause(filter: &Assignments) -> (String, Vec<&Option<String>>) {
    let mut parts = Vec::with_capacity(filter.len());
    let mut values = Vec::with_capacity(filter.len());
    for (name, value) in filter {
        match value {
            Some(_) => {
                parts.push(format!("{} = ?", quote(name)));
                values.push(value);
            }
            None => parts.push(format!("{} IS NULL", quote(name))),
        }
    }
    if parts.is_empty() {
        ("1 = 1".to_string(), values)
    } else {
        (parts.join(" AND "), values)
    }
}

fn map_error(table: &str, error: rusqlite::Error) -> DbError {
    if let rusqlite::Error::SqliteFailure(code, message) = &error {
        let message = message.clone().unwrap_or_else(|| code.to_string());
        match code.extended_code {
            SQLITE_CONSTRAINT_PRIMARYKEY | SQLITE_CONSTRAINT_UNIQUE => {
                return DbError::UniqueViolation {
                    table: table.to_string(),
                    message,
                }
            }
            SQLITE_CONSTRAINT_FOREIGNKEY => {
                return DbError::ForeignKeyViolation {
                    table: table.to_string(),
                    message,
                }
            }
            _ => {}
        }
        if message.starts_with("no such table") {
            return DbError::TableNotFound(table.to_string());
        }
        return DbError::Sql(message);
    }
    DbError::Sql(error.to_string())
}

fn value_to_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
    }
}

impl TargetDatabase for SqliteTargetDatabase {
    fn find_table(
        &mut self,
        _catalog: Option<&str>,
        schema: Option<&str>,
        name: &str,
    ) -> Result<Option<Table>, DbError> {
        let pragma = match schema {
            Some(s) => format!("PRAGMA {}.table_info({})", quote(s), quote(name)),
            None => format!("PRAGMA table_info({})", quote(name)),
        };
        let mut stmt = self.conn.prepare(&pragma).map_err(|e| map_error(name, e))?;
        let columns = stmt
            .query_map([], |row| {
                Ok(Column {
                    name: row.get(1)?,
                    type_name: row.get(2)?,
                    nullable: row.get::<_, i64>(3)? == 0,
                    primary_key: row.get::<_, i64>(5)? > 0,
                })
            })
            .map_err(|e| map_error(name, e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_error(name, e))?;
        if columns.is_empty() {
            return Ok(None);
        }
        let mut table = Table::new(name, columns);
        table.schema = schema.map(str::to_string);
        Ok(Some(table))
    }

    fn insert(&mut self, table: &Table, values: &Assignments) -> Result<usize, DbError> {
        let names: Vec<String> = values.iter().map(|(n, _)| quote(n)).collect();
        let marks = vec!["?"; values.len()].join(", ");
        let sql = format!("INSERT INTO {} ({}) VALUES ({})", qualified(table), names.join(", "), marks);
        let params: Vec<&dyn ToSql> = values.iter().map(|(_, v)| v as &dyn ToSql).collect();
        self.run(table, &sql, &params)
    }

    fn update(&mut self, table: &Table, set: &Assignments, filter: &Assignments) -> Result<usize, DbError> {
        let assignments: Vec<String> = set.iter().map(|(n, _)| format!("{} = ?", quote(n))).collect();
        let (clause, filter_values) = where_clause(filter);
        let sql = format!("UPDATE {} SET {} WHERE {}", qualified(table), assignments.join(", "), clause);
        let mut params: Vec<&dyn ToSql> = set.iter().map(|(_, v)| v as &dyn ToSql).collect();
        params.extend(filter_values.into_iter().map(|v| v as &dyn ToSql));
        self.run(table, &sql, &params)
    }

    fn delete(&mut self, table: &Table, filter: &Assignments) -> Result<usize, DbError> {
        let (clause, values) = where_clause(filter);
        let sql = format!("DELETE FROM {} WHERE {}", qualified(table), clause);
        let params: Vec<&dyn ToSql> = values.into_iter().map(|v| v as &dyn ToSql).collect();
        self.run(table, &sql, &params)
    }

    fn count(&mut self, table: &Table, filter: &Assignments) -> Result<usize, DbError> {
        let (clause, values) = where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", qualified(table), clause);
        let params: Vec<&dyn ToSql> = values.into_iter().map(|v| v as &dyn ToSql).collect();
        let count: i64 = self
            .conn
            .query_row(&sql, params.as_slice(), |row| row.get(0))
            .map_err(|e| map_error(&table.name, e))?;
        Ok(count as usize)
    }

    fn increment(&mut self, table: &Table, column: &str, delta: f64, filter: &Assignments) -> Result<usize, DbError> {
        let (clause, values) = where_clause(filter);
        let sql = format!(
            "UPDATE {} SET {col} = COALESCE({col}, 0) + ? WHERE {}",
            qualified(table),
            clause,
            col = quote(column)
        );
        let mut params: Vec<&dyn ToSql> = vec![&delta];
        params.extend(values.into_iter().map(|v| v as &dyn ToSql));
        self.run(table, &sql, &params)
    }

    fn query_values(&mut self, sql: &str, params: &Assignments) -> Result<Vec<Option<String>>, DbError> {
        let mut stmt = self.conn.prepare(sql).map_err(|e| map_error("", e))?;
        for (name, value) in params {
            let index = stmt
                .parameter_index(&format!(":{}", name))
                .map_err(|e| map_error("", e))?;
            if let Some(index) = index {
                stmt.raw_bind_parameter(index, value).map_err(|e| map_error("", e))?;
            }
        }
        let mut rows = stmt.raw_query();
        let mut values = Vec::new();
        while let Some(row) = rows.next().map_err(|e| map_error("", e))? {
            values.push(value_to_text(row.get_ref(0).map_err(|e| map_error("", e))?));
        }
        Ok(values)
    }

    fn execute(&mut self, sql: &str) -> Result<usize, DbError> {
        self.begin()?;
        self.conn.execute_batch(sql).map_err(|e| map_error("", e))?;
        Ok(self.conn.changes() as usize)
    }

    fn commit(&mut self) -> Result<(), DbError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT").map_err(|e| map_error("", e))?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK").map_err(|e| map_error("", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn db() -> SqliteTargetDatabase {
        let db = SqliteTargetDatabase::open_in_memory().unwrap();
        db.connection()
            .execute_batch("CREATE TABLE customer (id INTEGER PRIMARY KEY, name TEXT, val INTEGER)")
            .unwrap();
        db
    }

    fn pairs(values: &[(&str, Option<&str>)]) -> Vec<(String, Option<String>)> {
        values.iter().map(|(k, v)| (k.to_string(), v.map(str::to_string))).collect()
    }

    #[test]
    fn test_find_table() {
        let mut db = db();
        let table = db.find_table(None, None, "customer").unwrap().unwrap();
        assert_eq!(table.column_names(), vec!["id", "name", "val"]);
        assert_eq!(table.pk_column_names(), vec!["id"]);
        assert!(db.find_table(None, None, "missing").unwrap().is_none());
    }

    #[test]
    fn test_crud_with_text_values() {
        let mut db = db();
        let table = db.find_table(None, None, "customer").unwrap().unwrap();
        db.insert(&table, &pairs(&[("id", Some("1")), ("name", Some("ann")), ("val", Some("10"))]))
            .unwrap();
        assert_eq!(db.count(&table, &pairs(&[("id", Some("1"))])).unwrap(), 1);
        assert_eq!(
            db.update(&table, &pairs(&[("val", Some("20"))]), &pairs(&[("id", Some("1")), ("val", Some("10"))]))
                .unwrap(),
            1
        );
        assert_eq!(
            db.update(&table, &pairs(&[("val", Some("30"))]), &pairs(&[("id", Some("1")), ("val", Some("10"))]))
                .unwrap(),
            0
        );
        db.commit().unwrap();
        let val: i64 = db.connection().query_row("SELECT val FROM customer", [], |r| r.get(0)).unwrap();
        assert_eq!(val, 20);
        assert_eq!(db.delete(&table, &pairs(&[("id", Some("1"))])).unwrap(), 1);
    }

    #[test]
    fn test_null_filter() {
        let mut db = db();
        let table = db.find_table(None, None, "customer").unwrap().unwrap();
        db.insert(&table, &pairs(&[("id", Some("1")), ("name", None)])).unwrap();
        assert_eq!(db.count(&table, &pairs(&[("name", None)])).unwrap(), 1);
        assert_eq!(db.count(&table, &pairs(&[("name", Some(""))])).unwrap(), 0);
    }

    #[test]
    fn test_duplicate_key_is_unique_violation() {
        let mut db = db();
        let table = db.find_table(None, None, "customer").unwrap().unwrap();
        let row = pairs(&[("id", Some("1")), ("name", Some("a"))]);
        db.insert(&table, &row).unwrap();
        let err = db.insert(&table, &row).unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[test]
    fn test_rollback() {
        let mut db = db();
        let table = db.find_table(None, None, "customer").unwrap().unwrap();
        db.insert(&table, &pairs(&[("id", Some("1"))])).unwrap();
        db.rollback().unwrap();
        assert_eq!(db.count(&table, &[]).unwrap(), 0);
    }

    #[test]
    fn test_increment_and_lookup() {
        let mut db = db();
        let table = db.find_table(None, None, "customer").unwrap().unwrap();
        db.insert(&table, &pairs(&[("id", Some("1")), ("name", Some("ann")), ("val", Some("5"))]))
            .unwrap();
        db.increment(&table, "val", 2.5, &pairs(&[("id", Some("1"))])).unwrap();
        let values = db
            .query_values("SELECT val FROM customer WHERE name = :NAME", &pairs(&[("NAME", Some("ann")), ("UNUSED", None)]))
            .unwrap();
        assert_eq!(values, vec![Some("7.5".to_string())]);
    }

    #[test]
    fn test_execute_and_missing_table() {
        let mut db = db();
        db.execute("CREATE TABLE audit (id INTEGER PRIMARY KEY)").unwrap();
        db.commit().unwrap();
        assert!(db.find_table(None, None, "audit").unwrap().is_some());

        let ghost = Table::new("ghost", vec![Column::new("id", true)]);
        let err = db.insert(&ghost, &pairs(&[("id", Some("1"))])).unwrap_err();
        assert!(matches!(err, DbError::TableNotFound(_)));
    }
}

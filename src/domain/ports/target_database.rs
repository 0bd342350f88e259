//! Target Database Port
//!
//! The apply engine talks to the database it loads into through this
//! interface. Values travel as text; the implementation binds them using
//! its own type affinity.

use crate::domain::entities::Table;
use crate::domain::errors::DbError;

/// A `(column, value)` list used for SET and WHERE clauses.
pub type Assignments = [(String, Option<String>)];

/// Connection to the database a batch is applied to.
///
/// Writes happen inside an implicit transaction opened on the first
/// statement and closed by `commit` or `rollback`.
pub trait TargetDatabase: Send {
    /// Resolve a table by name, returning `None` when it does not exist.
    fn find_table(
        &mut self,
        catalog: Option<&str>,
        schema: Option<&str>,
        name: &str,
    ) -> Result<Option<Table>, DbError>;

    fn insert(&mut self, table: &Table, values: &Assignments) -> Result<usize, DbError>;

    fn update(
        &mut self,
        table: &Table,
        set: &Assignments,
        filter: &Assignments,
    ) -> Result<usize, DbError>;

    fn delete(&mut self, table: &Table, filter: &Assignments) -> Result<usize, DbError>;

    /// Number of rows matching `filter`.
    fn count(&mut self, table: &Table, filter: &Assignments) -> Result<usize, DbError>;

    /// `SET column = column + delta` on the rows matching `filter`.
    fn increment(
        &mut self,
        table: &Table,
        column: &str,
        delta: f64,
        filter: &Assignments,
    ) -> Result<usize, DbError>;

    /// Run a query with `:name` parameters and return the first column of
    /// every row.
    fn query_values(
        &mut self,
        sql: &str,
        params: &Assignments,
    ) -> Result<Vec<Option<String>>, DbError>;

    /// Run raw SQL or DDL.
    fn execute(&mut self, sql: &str) -> Result<usize, DbError>;

    fn commit(&mut self) -> Result<(), DbError>;

    fn rollback(&mut self) -> Result<(), DbError>;
}

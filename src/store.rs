use crate::domain::{Filter, SourceRow, TargetRow, TargetValue};
use crate::error::MigrateError;

/// Read side: the legacy relational store holding the wide summary tables.
pub trait SourceStore: Send + Sync {
    /// Ordered column names of `table`; `UnknownSourceTable` if it does not
    /// exist.
    fn columns(&self, table: &str) -> Result<Vec<String>, MigrateError>;

    /// `limit` rows of `table` starting at `offset`, ordered by `order_key`.
    fn fetch_page(
        &self,
        table: &str,
        order_key: &[String],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SourceRow>, MigrateError>;
}

/// Write side: hands out one dedicated connection per worker.
pub trait TargetStore: Send + Sync {
    fn connect(&self) -> Result<Box<dyn TargetConnection>, MigrateError>;
}

pub trait TargetConnection: Send {
    fn select(&mut self, table: &str, filter: &Filter) -> Result<Vec<TargetRow>, MigrateError>;

    /// Inserts `rows` aligned to `columns`. With `returning`, the generated
    /// values of that column come back in the same order as `rows`.
    fn insert(
        &mut self,
        table: &str,
        columns: &[&str],
        rows: Vec<Vec<TargetValue>>,
        returning: Option<&str>,
    ) -> Result<Option<Vec<i64>>, MigrateError>;

    fn exists(&mut self, table: &str, column: &str, value: &TargetValue) -> Result<bool, MigrateError> {
        let rows = self.select(table, &Filter::Eq(column.to_string(), value.clone()))?;
        Ok(!rows.is_empty())
    }

    /// Like [`insert`](Self::insert) but fails when ids are not returned.
    fn insert_returning(
        &mut self,
        table: &str,
        columns: &[&str],
        rows: Vec<Vec<TargetValue>>,
        id_column: &str,
    ) -> Result<Vec<i64>, MigrateError> {
        let expected = rows.len();
        let ids = self
            .insert(table, columns, rows, Some(id_column))?
            .ok_or_else(|| MigrateError::Store(format!("insert into {table} returned no ids")))?;
        if ids.len() != expected {
            return Err(MigrateError::Store(format!(
                "insert into {table} returned {} ids for {expected} rows",
                ids.len()
            )));
        }
        Ok(ids)
    }
}

/// Primary key column of a Chado table.
pub fn id_column(table: &str) -> String {
    format!("{table}_id")
}

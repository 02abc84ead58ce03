use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::domain::{Filter, SourceRow, SourceValue, TargetRow, TargetValue};
use crate::error::MigrateError;
use crate::store::{SourceStore, TargetConnection, TargetStore, id_column};

/// Unique keys enforced by [`MemoryTargetStore`], mirroring the Chado
/// constraints the linker has to respect.
const UNIQUE_KEYS: &[(&str, &[&str])] = &[
    ("db", &["name"]),
    ("cv", &["name"]),
    ("project", &["name"]),
    ("organism", &["genus", "species"]),
    ("dbxref", &["db_id", "accession"]),
    ("cvterm", &["cv_id", "name"]),
    ("stock", &["organism_id", "uniquename", "type_id"]),
    ("stockprop", &["stock_id", "type_id", "rank"]),
    ("phenotype", &["uniquename"]),
    ("nd_geolocationprop", &["nd_geolocation_id", "type_id", "rank"]),
    ("contact", &["name"]),
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceTable {
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Option<SourceValue>>>,
}

/// Source tables held in memory, paged like the legacy store would.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySourceStore {
    #[serde(default)]
    pub tables: BTreeMap<String, SourceTable>,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(
        mut self,
        name: &str,
        columns: &[&str],
        rows: Vec<Vec<Option<SourceValue>>>,
    ) -> Self {
        self.tables.insert(
            name.to_string(),
            SourceTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
            },
        );
        self
    }

    fn table(&self, name: &str) -> Result<&SourceTable, MigrateError> {
        self.tables
            .get(name)
            .ok_or_else(|| MigrateError::UnknownSourceTable(name.to_string()))
    }
}

impl SourceStore for MemorySourceStore {
    fn columns(&self, table: &str) -> Result<Vec<String>, MigrateError> {
        Ok(self.table(table)?.columns.clone())
    }

    fn fetch_page(
        &self,
        table: &str,
        order_key: &[String],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SourceRow>, MigrateError> {
        let source = self.table(table)?;
        let key_indices = order_key
            .iter()
            .map(|column| {
                source
                    .columns
                    .iter()
                    .position(|name| name == column)
                    .ok_or_else(|| {
                        MigrateError::ConfigParse(format!(
                            "order key column {column} is not a column of {table}"
                        ))
                    })
            })
            .collect::<Result<Vec<_>, MigrateError>>()?;

        let mut order = (0..source.rows.len()).collect::<Vec<_>>();
        order.sort_by(|&a, &b| {
            key_indices
                .iter()
                .map(|&index| compare_cells(cell(&source.rows[a], index), cell(&source.rows[b], index)))
                .find(|ordering| *ordering != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });

        let schema: Arc<[String]> = source.columns.iter().cloned().collect();
        order
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|index| SourceRow::new(schema.clone(), source.rows[index].clone()))
            .collect()
    }
}

fn cell(row: &[Option<SourceValue>], index: usize) -> Option<&SourceValue> {
    row.get(index).and_then(Option::as_ref)
}

fn compare_cells(a: Option<&SourceValue>, b: Option<&SourceValue>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (SourceValue::Integer(x), SourceValue::Integer(y)) => x.cmp(y),
            (
                SourceValue::Integer(_) | SourceValue::Float(_),
                SourceValue::Integer(_) | SourceValue::Float(_),
            ) => numeric(a)
                .partial_cmp(&numeric(b))
                .unwrap_or(Ordering::Equal),
            (SourceValue::Date(x), SourceValue::Date(y)) => x.cmp(y),
            _ => a.to_text().cmp(&b.to_text()),
        },
    }
}

fn numeric(value: &SourceValue) -> f64 {
    match value {
        SourceValue::Integer(v) => *v as f64,
        SourceValue::Float(v) => *v,
        _ => f64::NAN,
    }
}

/// Chado-like tables plus the id sequence of each table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetTables {
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<TargetRow>>,
    #[serde(default)]
    pub sequences: BTreeMap<String, i64>,
}

impl TargetTables {
    fn next_id(&mut self, table: &str) -> i64 {
        let id_col = id_column(table);
        let current = match self.sequences.get(table) {
            Some(value) => *value,
            None => self
                .tables
                .get(table)
                .map(|rows| rows.iter().filter_map(|row| row.int(&id_col)).max().unwrap_or(0))
                .unwrap_or(0),
        };
        let next = current + 1;
        self.sequences.insert(table.to_string(), next);
        next
    }

    fn restore_sequence(&mut self, table: &str, saved: Option<i64>) {
        match saved {
            Some(value) => self.sequences.insert(table.to_string(), value),
            None => self.sequences.remove(table),
        };
    }

    fn insert(
        &mut self,
        table: &str,
        columns: &[&str],
        rows: Vec<Vec<TargetValue>>,
        returning: Option<&str>,
    ) -> Result<Option<Vec<i64>>, MigrateError> {
        let unique = UNIQUE_KEYS
            .iter()
            .find(|(name, _)| *name == table)
            .map(|(_, key)| *key);
        let mut seen = HashSet::new();
        if let Some(key) = unique {
            for row in self.tables.get(table).into_iter().flatten() {
                seen.insert(unique_key(row, key));
            }
        }

        let id_col = id_column(table);
        let saved_sequence = self.sequences.get(table).copied();
        let mut staged = Vec::with_capacity(rows.len());
        for values in rows {
            if values.len() != columns.len() {
                self.restore_sequence(table, saved_sequence);
                return Err(MigrateError::Store(format!(
                    "insert into {table}: {} values for {} columns",
                    values.len(),
                    columns.len()
                )));
            }
            let mut row = TargetRow::new();
            for (column, value) in columns.iter().zip(values) {
                row.set(column, value);
            }
            if row.get(&id_col).is_none() {
                let id = self.next_id(table);
                row.set(&id_col, TargetValue::Integer(id));
            }
            if let Some(key) = unique {
                let values = unique_key(&row, key);
                if !seen.insert(values.clone()) {
                    self.restore_sequence(table, saved_sequence);
                    return Err(MigrateError::Constraint {
                        table: table.to_string(),
                        message: format!("duplicate key ({}) = ({})", key.join(", "), values.join(", ")),
                    });
                }
            }
            staged.push(row);
        }

        let returned = returning.map(|column| {
            staged
                .iter()
                .map(|row| row.int(column).unwrap_or_default())
                .collect::<Vec<_>>()
        });
        self.tables.entry(table.to_string()).or_default().extend(staged);
        Ok(returned)
    }
}

fn unique_key(row: &TargetRow, key: &[&str]) -> Vec<String> {
    key.iter()
        .map(|column| row.get(column).map(TargetValue::to_text).unwrap_or_default())
        .collect()
}

/// Shared in-memory target; every connection sees the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryTargetStore {
    inner: Arc<Mutex<TargetTables>>,
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tables(tables: TargetTables) -> Self {
        Self {
            inner: Arc::new(Mutex::new(tables)),
        }
    }

    /// Inserts a row outside of any migration, e.g. reference data.
    pub fn seed(&self, table: &str, row: TargetRow) -> Result<i64, MigrateError> {
        let columns = row.columns().map(|(c, _)| c.clone()).collect::<Vec<_>>();
        let values = row.columns().map(|(_, v)| v.clone()).collect::<Vec<_>>();
        let columns = columns.iter().map(String::as_str).collect::<Vec<_>>();
        let id_col = id_column(table);
        let ids = lock(&self.inner)?.insert(table, &columns, vec![values], Some(&id_col))?;
        ids.and_then(|ids| ids.first().copied())
            .ok_or_else(|| MigrateError::Store(format!("seed into {table} returned no id")))
    }

    pub fn rows(&self, table: &str) -> Result<Vec<TargetRow>, MigrateError> {
        Ok(lock(&self.inner)?.tables.get(table).cloned().unwrap_or_default())
    }

    pub fn snapshot(&self) -> Result<TargetTables, MigrateError> {
        Ok(lock(&self.inner)?.clone())
    }
}

impl TargetStore for MemoryTargetStore {
    fn connect(&self) -> Result<Box<dyn TargetConnection>, MigrateError> {
        Ok(Box::new(MemoryConnection {
            inner: self.inner.clone(),
        }))
    }
}

pub struct MemoryConnection {
    inner: Arc<Mutex<TargetTables>>,
}

impl TargetConnection for MemoryConnection {
    fn select(&mut self, table: &str, filter: &Filter) -> Result<Vec<TargetRow>, MigrateError> {
        let guard = lock(&self.inner)?;
        Ok(guard
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|row| filter.matches(row)).cloned().collect())
            .unwrap_or_default())
    }

    fn insert(
        &mut self,
        table: &str,
        columns: &[&str],
        rows: Vec<Vec<TargetValue>>,
        returning: Option<&str>,
    ) -> Result<Option<Vec<i64>>, MigrateError> {
        lock(&self.inner)?.insert(table, columns, rows, returning)
    }
}

fn lock(inner: &Mutex<TargetTables>) -> Result<MutexGuard<'_, TargetTables>, MigrateError> {
    inner
        .lock()
        .map_err(|_| MigrateError::Store("target store lock poisoned".to_string()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn fetch_page_orders_by_key() {
        let store = MemorySourceStore::new().with_table(
            "T",
            &["ID", "NAME"],
            vec![
                vec![Some(3i64.into()), Some("c".into())],
                vec![Some(1i64.into()), Some("a".into())],
                vec![Some(2i64.into()), Some("b".into())],
            ],
        );
        let key = vec!["ID".to_string()];
        let page = store.fetch_page("T", &key, 1, 5).unwrap();
        let names = page.iter().map(|r| r.text("NAME").unwrap()).collect::<Vec<_>>();
        assert_eq!(names, vec!["b", "c"]);
        assert!(store.fetch_page("T", &key, 3, 5).unwrap().is_empty());
    }

    #[test]
    fn unknown_table_is_reported() {
        let store = MemorySourceStore::new();
        assert_matches!(store.columns("NOPE"), Err(MigrateError::UnknownSourceTable(_)));
    }

    #[test]
    fn insert_returns_ids_in_row_order() {
        let store = MemoryTargetStore::new();
        let mut conn = store.connect().unwrap();
        let ids = conn
            .insert_returning(
                "stock",
                &["name", "uniquename"],
                vec![vec!["A".into(), "A".into()], vec!["B".into(), "B".into()]],
                "stock_id",
            )
            .unwrap();
        assert_eq!(ids, vec![1, 2]);
        let rows = conn.select("stock", &Filter::eq("name", "B")).unwrap();
        assert_eq!(rows[0].int("stock_id"), Some(2));
    }

    #[test]
    fn unique_violation_applies_nothing() {
        let store = MemoryTargetStore::new();
        let mut conn = store.connect().unwrap();
        let err = conn
            .insert(
                "phenotype",
                &["uniquename"],
                vec![vec!["X".into()], vec!["X".into()]],
                None,
            )
            .unwrap_err();
        assert_matches!(err, MigrateError::Constraint { .. });
        assert!(store.rows("phenotype").unwrap().is_empty());
        let ids = conn
            .insert_returning("phenotype", &["uniquename"], vec![vec!["X".into()]], "phenotype_id")
            .unwrap();
        assert_eq!(ids, vec![1]);
    }
}

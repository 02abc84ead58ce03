use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{MigrateError, preview};
use crate::store::SourceStore;

/// Per-table column metadata of the source store, loaded lazily on first
/// access and kept for the lifetime of the catalog.
pub struct SchemaCatalog {
    source: Arc<dyn SourceStore>,
    columns: Mutex<HashMap<String, Arc<[String]>>>,
}

impl SchemaCatalog {
    pub fn new(source: Arc<dyn SourceStore>) -> Self {
        Self {
            source,
            columns: Mutex::new(HashMap::new()),
        }
    }

    pub fn columns(&self, table: &str) -> Result<Arc<[String]>, MigrateError> {
        let mut cache = self
            .columns
            .lock()
            .map_err(|_| MigrateError::Store("column cache lock poisoned".to_string()))?;
        if let Some(columns) = cache.get(table) {
            return Ok(columns.clone());
        }

        let loaded: Arc<[String]> = self.source.columns(table)?.into();
        debug!(
            table,
            columns = %preview(&loaded.join(", ")),
            "loaded column metadata"
        );
        cache.insert(table.to_string(), loaded.clone());
        Ok(loaded)
    }

    pub fn contains(&self, table: &str, column: &str) -> Result<bool, MigrateError> {
        Ok(self.columns(table)?.iter().any(|name| name == column))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::SourceRow;

    struct CountingSource {
        calls: AtomicUsize,
    }

    impl SourceStore for CountingSource {
        fn columns(&self, table: &str) -> Result<Vec<String>, MigrateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if table == "T" {
                Ok(vec!["A".to_string(), "B".to_string()])
            } else {
                Err(MigrateError::UnknownSourceTable(table.to_string()))
            }
        }

        fn fetch_page(
            &self,
            _table: &str,
            _order_key: &[String],
            _offset: usize,
            _limit: usize,
        ) -> Result<Vec<SourceRow>, MigrateError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn columns_are_loaded_once() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let catalog = SchemaCatalog::new(source.clone());
        assert_eq!(catalog.columns("T").unwrap().len(), 2);
        assert!(catalog.contains("T", "B").unwrap());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_table_is_fatal() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let catalog = SchemaCatalog::new(source);
        assert_matches!(catalog.columns("X"), Err(MigrateError::UnknownSourceTable(_)));
    }
}

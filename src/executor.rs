use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use serde::Serialize;
use tracing::{debug, warn};

use crate::batch::{RunStorage, Step, TaskContext};
use crate::error::MigrateError;
use crate::store::{TargetConnection, TargetStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Parallel groups run on one scoped thread per sibling.
    #[default]
    Concurrent,
    /// The same tree walked depth-first on a single connection.
    Sequential,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub tasks: usize,
    pub rows_written: usize,
    pub connections: usize,
}

#[derive(Default)]
struct Tally {
    tasks: AtomicUsize,
    rows: AtomicUsize,
    connections: AtomicUsize,
}

/// Interprets a [`Step`] tree against the target store.
pub struct BatchExecutor {
    store: Arc<dyn TargetStore>,
    mode: ExecutionMode,
}

impl BatchExecutor {
    pub fn new(store: Arc<dyn TargetStore>, mode: ExecutionMode) -> Self {
        Self { store, mode }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn execute(&self, step: Step, storage: &RunStorage) -> Result<ExecutionReport, MigrateError> {
        let tally = Tally::default();
        let mut conn = None;
        self.run(step, &mut conn, storage, &tally)?;
        Ok(ExecutionReport {
            tasks: tally.tasks.load(Ordering::SeqCst),
            rows_written: tally.rows.load(Ordering::SeqCst),
            connections: tally.connections.load(Ordering::SeqCst),
        })
    }

    fn run(
        &self,
        step: Step,
        conn: &mut Option<Box<dyn TargetConnection>>,
        storage: &RunStorage,
        tally: &Tally,
    ) -> Result<(), MigrateError> {
        match step {
            Step::Leaf(task) => {
                if task.is_noop() {
                    return Ok(());
                }
                let conn = self.connection(conn, tally)?;
                let name = task.name().to_string();
                let mut ctx = TaskContext {
                    conn: &mut **conn,
                    storage,
                };
                let rows = task.execute(&mut ctx)?;
                debug!(task = %name, rows, "task done");
                tally.tasks.fetch_add(1, Ordering::SeqCst);
                tally.rows.fetch_add(rows, Ordering::SeqCst);
                Ok(())
            }
            Step::Sequence(steps) => {
                for step in steps {
                    self.run(step, conn, storage, tally)?;
                }
                Ok(())
            }
            Step::Parallel(steps) if self.mode == ExecutionMode::Sequential || steps.len() < 2 => {
                let mut failures = Vec::new();
                for step in steps {
                    if let Err(err) = self.run(step, conn, storage, tally) {
                        failures.push(err);
                    }
                }
                collect_failures(failures)
            }
            Step::Parallel(steps) => {
                let failures = thread::scope(|scope| {
                    let handles = steps
                        .into_iter()
                        .map(|step| {
                            scope.spawn(move || {
                                // Every worker gets its own connection.
                                let mut own = None;
                                self.run(step, &mut own, storage, tally)
                            })
                        })
                        .collect::<Vec<_>>();
                    handles
                        .into_iter()
                        .filter_map(|handle| match handle.join() {
                            Ok(Ok(())) => None,
                            Ok(Err(err)) => Some(err),
                            Err(_) => Some(MigrateError::Store("task worker panicked".to_string())),
                        })
                        .collect::<Vec<_>>()
                });
                collect_failures(failures)
            }
        }
    }

    fn connection<'c>(
        &self,
        conn: &'c mut Option<Box<dyn TargetConnection>>,
        tally: &Tally,
    ) -> Result<&'c mut Box<dyn TargetConnection>, MigrateError> {
        if conn.is_none() {
            *conn = Some(self.store.connect()?);
            tally.connections.fetch_add(1, Ordering::SeqCst);
        }
        conn.as_mut()
            .ok_or_else(|| MigrateError::Store("no target connection".to_string()))
    }
}

/// Siblings all ran; a single failure is passed through unchanged.
fn collect_failures(mut failures: Vec<MigrateError>) -> Result<(), MigrateError> {
    match failures.len() {
        0 => Ok(()),
        1 => Err(failures.remove(0)),
        _ => {
            for err in &failures {
                warn!(error = %err, "concurrent task failed");
            }
            Err(MigrateError::BatchFailed {
                failures: failures.iter().map(ToString::to_string).collect(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::batch::{InsertTask, Joined, Slot};
    use crate::domain::{Filter, TargetRow};
    use crate::memory::MemoryTargetStore;

    fn insert_db(name: &str) -> Step {
        InsertTask::insert(name, "db", &["name"], vec![vec![name.into()]]).into()
    }

    #[test]
    fn parallel_siblings_use_their_own_connections() {
        let store = Arc::new(MemoryTargetStore::new());
        let executor = BatchExecutor::new(store.clone(), ExecutionMode::Concurrent);
        let step = Step::Parallel(vec![insert_db("a"), insert_db("b"), insert_db("c")]);
        let report = executor.execute(step, &RunStorage::new()).unwrap();
        assert_eq!(report.tasks, 3);
        assert_eq!(report.connections, 3);
        assert_eq!(store.rows("db").unwrap().len(), 3);
    }

    #[test]
    fn sequential_mode_uses_one_connection() {
        let store = Arc::new(MemoryTargetStore::new());
        let executor = BatchExecutor::new(store.clone(), ExecutionMode::Sequential);
        let step = Step::Parallel(vec![insert_db("a"), insert_db("b")]);
        let report = executor.execute(step, &RunStorage::new()).unwrap();
        assert_eq!(report.connections, 1);
        assert_eq!(report.rows_written, 2);
    }

    #[test]
    fn failure_stops_the_enclosing_sequence() {
        let store = Arc::new(MemoryTargetStore::new());
        let executor = BatchExecutor::new(store.clone(), ExecutionMode::Sequential);
        let step = Step::Sequence(vec![insert_db("a"), insert_db("a"), insert_db("b")]);
        assert_matches!(
            executor.execute(step, &RunStorage::new()),
            Err(MigrateError::Constraint { .. })
        );
        let names = store
            .rows("db")
            .unwrap()
            .iter()
            .filter_map(|row| row.text("name"))
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a".to_string()]);
    }

    #[test]
    fn several_failures_are_aggregated() {
        let store = Arc::new(MemoryTargetStore::new());
        let executor = BatchExecutor::new(store, ExecutionMode::Concurrent);
        let reader = |name: &str| -> Step {
            InsertTask::fetch_join_insert(
                name,
                "db",
                Filter::All,
                "cv",
                &["name"],
                |_rows: Vec<TargetRow>, storage: &RunStorage| -> Result<Joined, MigrateError> {
                    storage.get(&Slot::Stocks)?;
                    Ok(Joined::default())
                },
            )
            .into()
        };
        let step = Step::Parallel(vec![reader("x"), reader("y")]);
        assert_matches!(
            executor.execute(step, &RunStorage::new()),
            Err(MigrateError::BatchFailed { failures }) if failures.len() == 2
        );
    }
}

//! Deferred insert work and the ordered/concurrent tree it is arranged in.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::domain::{Filter, TargetRow, TargetValue};
use crate::error::{MigrateError, preview};
use crate::store::{TargetConnection, id_column};

/// Named slots of [`RunStorage`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    Stocks,
    Phenotypes,
    Experiments,
    Geolocations,
    Contacts,
    Dbxrefs(String),
    Cvterms(String),
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Stocks => write!(f, "stocks"),
            Slot::Phenotypes => write!(f, "phenotypes"),
            Slot::Experiments => write!(f, "experiments"),
            Slot::Geolocations => write!(f, "geolocations"),
            Slot::Contacts => write!(f, "contacts"),
            Slot::Dbxrefs(scope) => write!(f, "dbxrefs:{scope}"),
            Slot::Cvterms(scope) => write!(f, "cvterms:{scope}"),
        }
    }
}

/// Ordered `(key, id)` pairs captured from one insert.
pub type Captured = Arc<[(String, i64)]>;

/// Identifiers produced during one paging round, handed from the task that
/// inserted them to the tasks that link against them.
///
/// A slot is written exactly once per round; the ordering of the task tree
/// guarantees the writer finished before any reader runs.
#[derive(Debug, Default)]
pub struct RunStorage {
    slots: Mutex<HashMap<Slot, Captured>>,
}

impl RunStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) -> Result<(), MigrateError> {
        self.lock()?.clear();
        Ok(())
    }

    pub fn put(&self, slot: Slot, entries: Vec<(String, i64)>) -> Result<(), MigrateError> {
        let mut slots = self.lock()?;
        if slots.contains_key(&slot) {
            return Err(MigrateError::SlotOverwrite(slot.to_string()));
        }
        debug!(slot = %slot, ids = entries.len(), "slot filled");
        slots.insert(slot, entries.into());
        Ok(())
    }

    pub fn get(&self, slot: &Slot) -> Result<Captured, MigrateError> {
        self.lock()?
            .get(slot)
            .cloned()
            .ok_or_else(|| MigrateError::MissingSlot(slot.to_string()))
    }

    /// Slot contents as `key → id`; repeated keys are an invariant violation.
    pub fn ids(&self, slot: &Slot) -> Result<HashMap<String, i64>, MigrateError> {
        let entries = self.get(slot)?;
        let mut ids = HashMap::with_capacity(entries.len());
        for (key, id) in entries.iter() {
            if ids.insert(key.clone(), *id).is_some() {
                return Err(MigrateError::invariant(
                    slot.to_string(),
                    format!("key {} captured twice", preview(key)),
                ));
            }
        }
        Ok(ids)
    }

    pub fn contains(&self, slot: &Slot) -> Result<bool, MigrateError> {
        Ok(self.lock()?.contains_key(slot))
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Slot, Captured>>, MigrateError> {
        self.slots
            .lock()
            .map_err(|_| MigrateError::Store("run storage lock poisoned".to_string()))
    }
}

/// What a leaf sees while it runs: its own connection and the round's
/// storage.
pub struct TaskContext<'a> {
    pub conn: &'a mut dyn TargetConnection,
    pub storage: &'a RunStorage,
}

/// Rows ready for insertion after a fetch has been joined with the prepared
/// payload. `keys[i]` names `rows[i]` in the capture slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Joined {
    pub rows: Vec<Vec<TargetValue>>,
    pub keys: Vec<String>,
}

pub type JoinFn =
    Box<dyn FnOnce(Vec<TargetRow>, &RunStorage) -> Result<Joined, MigrateError> + Send>;

pub type TaskFn = Box<dyn FnOnce(&mut TaskContext<'_>) -> Result<usize, MigrateError> + Send>;

pub enum TaskKind {
    Noop,
    Insert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<TargetValue>>,
        capture: Option<(Slot, Vec<String>)>,
    },
    /// Select, join the result with prepared payloads, insert.
    FetchJoinInsert {
        fetch_table: String,
        filter: Filter,
        join: JoinFn,
        table: String,
        columns: Vec<String>,
        capture: Option<Slot>,
    },
    Custom(TaskFn),
}

/// A deferred unit of target-store work, consumed by exactly one execution.
pub struct InsertTask {
    name: String,
    kind: TaskKind,
}

impl InsertTask {
    pub fn noop(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TaskKind::Noop,
        }
    }

    pub fn insert(
        name: impl Into<String>,
        table: &str,
        columns: &[&str],
        rows: Vec<Vec<TargetValue>>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: TaskKind::Insert {
                table: table.to_string(),
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
                capture: None,
            },
        }
    }

    /// Captures the generated ids of an insert under `keys`, one per row.
    pub fn capturing(mut self, slot: Slot, keys: Vec<String>) -> Self {
        match &mut self.kind {
            TaskKind::Insert { capture, .. } => *capture = Some((slot, keys)),
            TaskKind::FetchJoinInsert { capture, .. } => *capture = Some(slot),
            TaskKind::Noop | TaskKind::Custom(_) => {}
        }
        self
    }

    pub fn fetch_join_insert<J>(
        name: impl Into<String>,
        fetch_table: &str,
        filter: Filter,
        table: &str,
        columns: &[&str],
        join: J,
    ) -> Self
    where
        J: FnOnce(Vec<TargetRow>, &RunStorage) -> Result<Joined, MigrateError> + Send + 'static,
    {
        Self {
            name: name.into(),
            kind: TaskKind::FetchJoinInsert {
                fetch_table: fetch_table.to_string(),
                filter,
                join: Box::new(join),
                table: table.to_string(),
                columns: columns.iter().map(|c| c.to_string()).collect(),
                capture: None,
            },
        }
    }

    pub fn custom<F>(name: impl Into<String>, job: F) -> Self
    where
        F: FnOnce(&mut TaskContext<'_>) -> Result<usize, MigrateError> + Send + 'static,
    {
        Self {
            name: name.into(),
            kind: TaskKind::Custom(Box::new(job)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_noop(&self) -> bool {
        matches!(self.kind, TaskKind::Noop)
    }

    /// Short description used when rendering a task tree.
    pub fn describe(&self) -> String {
        match &self.kind {
            TaskKind::Noop => format!("{} (no-op)", self.name),
            TaskKind::Insert { table, rows, capture, .. } => {
                let capture = capture
                    .as_ref()
                    .map(|(slot, _)| format!(" -> {slot}"))
                    .unwrap_or_default();
                format!("{}: insert {} row(s) into {table}{capture}", self.name, rows.len())
            }
            TaskKind::FetchJoinInsert {
                fetch_table,
                table,
                capture,
                ..
            } => {
                let capture = capture
                    .as_ref()
                    .map(|slot| format!(" -> {slot}"))
                    .unwrap_or_default();
                format!("{}: fetch {fetch_table}, join, insert into {table}{capture}", self.name)
            }
            TaskKind::Custom(_) => format!("{}: link", self.name),
        }
    }

    /// Runs the task; returns the number of rows written.
    pub fn execute(self, ctx: &mut TaskContext<'_>) -> Result<usize, MigrateError> {
        debug!(task = %preview(&self.describe()), "exec");
        match self.kind {
            TaskKind::Noop => Ok(0),
            TaskKind::Insert {
                table,
                columns,
                rows,
                capture,
            } => insert_rows(ctx, &table, &columns, rows, capture),
            TaskKind::FetchJoinInsert {
                fetch_table,
                filter,
                join,
                table,
                columns,
                capture,
            } => {
                let fetched = ctx.conn.select(&fetch_table, &filter)?;
                let joined = join(fetched, ctx.storage)?;
                if joined.keys.len() != joined.rows.len() && capture.is_some() {
                    return Err(MigrateError::invariant(
                        table,
                        format!(
                            "join produced {} rows but {} capture keys",
                            joined.rows.len(),
                            joined.keys.len()
                        ),
                    ));
                }
                let capture = capture.map(|slot| (slot, joined.keys));
                insert_rows(ctx, &table, &columns, joined.rows, capture)
            }
            TaskKind::Custom(job) => job(ctx),
        }
    }
}

impl fmt::Debug for InsertTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsertTask")
            .field("name", &self.name)
            .field("task", &self.describe())
            .finish()
    }
}

fn insert_rows(
    ctx: &mut TaskContext<'_>,
    table: &str,
    columns: &[String],
    rows: Vec<Vec<TargetValue>>,
    capture: Option<(Slot, Vec<String>)>,
) -> Result<usize, MigrateError> {
    let count = rows.len();
    let columns = columns.iter().map(String::as_str).collect::<Vec<_>>();
    match capture {
        Some((slot, keys)) => {
            if keys.len() != count {
                return Err(MigrateError::invariant(
                    table,
                    format!("{count} rows but {} capture keys", keys.len()),
                ));
            }
            let ids = if rows.is_empty() {
                Vec::new()
            } else {
                ctx.conn.insert_returning(table, &columns, rows, &id_column(table))?
            };
            ctx.storage.put(slot, keys.into_iter().zip(ids).collect())?;
        }
        None if rows.is_empty() => {}
        None => {
            ctx.conn.insert(table, &columns, rows, None)?;
        }
    }
    Ok(count)
}

/// `key_column → id_column` over fetched rows, rejecting duplicate keys.
pub fn index_unique(
    rows: &[TargetRow],
    table: &str,
    key_column: &str,
    id_column: &str,
) -> Result<HashMap<String, i64>, MigrateError> {
    let mut index = HashMap::with_capacity(rows.len());
    for row in rows {
        let (Some(key), Some(id)) = (row.text(key_column), row.int(id_column)) else {
            continue;
        };
        if index.insert(key.clone(), id).is_some() {
            return Err(MigrateError::invariant(
                table,
                format!("{key_column} {} matches several rows", preview(&key)),
            ));
        }
    }
    Ok(index)
}

/// Nested execution plan: a `Sequence` runs its steps in order, a
/// `Parallel` runs them on independent workers.
#[derive(Debug)]
pub enum Step {
    Leaf(InsertTask),
    Sequence(Vec<Step>),
    Parallel(Vec<Step>),
}

impl Step {
    pub fn noop(name: impl Into<String>) -> Self {
        Step::Leaf(InsertTask::noop(name))
    }

    pub fn is_noop(&self) -> bool {
        match self {
            Step::Leaf(task) => task.is_noop(),
            Step::Sequence(steps) | Step::Parallel(steps) => steps.iter().all(Step::is_noop),
        }
    }

    /// Number of leaves doing actual work.
    pub fn task_count(&self) -> usize {
        match self {
            Step::Leaf(task) => usize::from(!task.is_noop()),
            Step::Sequence(steps) | Step::Parallel(steps) => steps.iter().map(Step::task_count).sum(),
        }
    }

    /// One line per leaf. Steps of a sequence are indented one level
    /// further than the step before them; parallel siblings share a level.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        self.render_into(0, &mut lines);
        lines.join("\n")
    }

    fn render_into(&self, depth: usize, lines: &mut Vec<String>) -> usize {
        match self {
            Step::Leaf(task) => {
                lines.push(format!("{}> {}", "  ".repeat(depth), task.describe()));
                depth
            }
            Step::Parallel(steps) => {
                for step in steps {
                    step.render_into(depth, lines);
                }
                depth
            }
            Step::Sequence(steps) => {
                let mut current = depth;
                for step in steps {
                    step.render_into(current, lines);
                    current += 1;
                }
                depth
            }
        }
    }
}

impl From<InsertTask> for Step {
    fn from(task: InsertTask) -> Self {
        Step::Leaf(task)
    }
}

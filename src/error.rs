use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Longest slice of an offending value that ends up in an error message.
pub const PREVIEW_LEN: usize = 60;

#[derive(Debug, Error, Diagnostic)]
pub enum MigrateError {
    #[error("missing config file chado-migrate.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse config: {0}")]
    ConfigParse(String),

    #[error("translation config does not have section: {0}")]
    MissingSection(String),

    #[error("translation config for {table} has {} invalid entries:\n  {}", entries.len(), entries.join("\n  "))]
    #[diagnostic(help("every option must be a source column mapped to `table.attribute` or a `/* constant */`"))]
    Translation { table: String, entries: Vec<String> },

    #[error("source store has no table named {0}")]
    UnknownSourceTable(String),

    #[error("mandatory {kind} not found in target store: {name}")]
    MissingReference { kind: &'static str, name: String },

    #[error("[{concept}] invariant violated: {message}")]
    #[diagnostic(help("the page was abandoned; earlier steps of its ordered group may already be applied"))]
    Invariant { concept: String, message: String },

    #[error("run storage slot {0} was read before any task wrote it")]
    MissingSlot(String),

    #[error("run storage slot {0} was written twice in one round")]
    SlotOverwrite(String),

    #[error("target store failure: {0}")]
    Store(String),

    #[error("constraint violation on {table}: {message}")]
    Constraint { table: String, message: String },

    #[error("{} concurrent task(s) failed:\n  {}", failures.len(), failures.join("\n  "))]
    BatchFailed { failures: Vec<String> },

    #[error("page of {table} at offset {offset} failed")]
    #[diagnostic(help("restore the target store and re-run from offset {offset}"))]
    PageFailed {
        table: String,
        offset: usize,
        #[source]
        source: Box<MigrateError>,
    },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to parse snapshot: {0}")]
    SnapshotParse(String),
}

impl MigrateError {
    pub fn invariant(concept: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Invariant {
            concept: concept.into(),
            message: message.into(),
        }
    }

    /// True for deploy-time mistakes that must never be retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            MigrateError::MissingConfig
                | MigrateError::ConfigRead(_)
                | MigrateError::ConfigParse(_)
                | MigrateError::MissingSection(_)
                | MigrateError::Translation { .. }
                | MigrateError::UnknownSourceTable(_)
                | MigrateError::MissingReference { .. }
        )
    }
}

/// Truncates `value` to [`PREVIEW_LEN`] characters for log and error output.
pub fn preview(value: &str) -> String {
    if value.chars().count() <= PREVIEW_LEN {
        return value.to_string();
    }
    let head: String = value.chars().take(PREVIEW_LEN).collect();
    format!("{head}...")
}

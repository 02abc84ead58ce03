//! Paging loop: one round per source page. Every concept is resolved and
//! linked, the cvterms the plans asked for are created first, then the
//! combined plan runs.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::batch::{RunStorage, Slot, Step};
use crate::catalog::SchemaCatalog;
use crate::config::{DEFAULT_PAGE_SIZE, ResolvedConfig, TableRequest};
use crate::domain::{Concept, Filter, SourceRow};
use crate::error::{MigrateError, preview};
use crate::executor::{BatchExecutor, ExecutionMode};
use crate::linker::{ChadoRefs, EntityLinker};
use crate::ontology::OntologyIndex;
use crate::resolver::{ChangeSetResolver, PendingRow, TargetInventory};
use crate::store::{SourceStore, TargetConnection, TargetStore, id_column};
use crate::translation::{TranslationConfig, TranslationMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub page_size: usize,
    /// Stop after this many source rows.
    pub limit: Option<usize>,
    pub mode: ExecutionMode,
    /// Build and render plans without executing them.
    pub dry_run: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            limit: None,
            mode: ExecutionMode::Concurrent,
            dry_run: false,
        }
    }
}

/// Ids captured in one table's rounds, per slot kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreatedCounts {
    pub stocks: usize,
    pub geolocations: usize,
    pub contacts: usize,
    pub phenotypes: usize,
    pub experiments: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    pub table: String,
    pub rounds: usize,
    pub source_rows: usize,
    pub skipped_rows: usize,
    /// Change-set sizes summed over rounds.
    pub pending: BTreeMap<Concept, usize>,
    pub created: CreatedCounts,
    pub tasks: usize,
    pub rows_written: usize,
    pub connections: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plans: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub mode: ExecutionMode,
    pub refs: ChadoRefs,
    pub tables: Vec<TableSummary>,
}

/// Validated translation of one source table.
#[derive(Debug, Clone, Serialize)]
pub struct TableCheck {
    pub table: String,
    pub row_id_columns: Vec<String>,
    pub mappings: BTreeMap<Concept, usize>,
    pub translation: TranslationMap,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub ontology_terms: usize,
    pub tables: Vec<TableCheck>,
}

pub struct MigrationDriver {
    source: Arc<dyn SourceStore>,
    target: Arc<dyn TargetStore>,
    config: ResolvedConfig,
    translation: Arc<TranslationConfig>,
}

impl MigrationDriver {
    pub fn new(
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
        config: ResolvedConfig,
        translation: Arc<TranslationConfig>,
    ) -> Self {
        Self {
            source,
            target,
            config,
            translation,
        }
    }

    /// Loads the ontology and the translation config named by `config`.
    pub fn open(
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
        config: ResolvedConfig,
    ) -> Result<Self, MigrateError> {
        let catalog = Arc::new(SchemaCatalog::new(source.clone()));
        let ontology = Arc::new(OntologyIndex::load(source.as_ref(), &config.ontology_tables)?);
        info!(
            terms = ontology.len(),
            crop = ontology.crop().unwrap_or("-"),
            "ontology loaded"
        );
        let translation = Arc::new(TranslationConfig::from_path(
            &config.translation,
            catalog,
            ontology,
            config.ontology_tables.clone(),
        )?);
        Ok(Self::new(source, target, config, translation))
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn translation(&self) -> &Arc<TranslationConfig> {
        &self.translation
    }

    /// Validates the translation of `table`, or of every configured table,
    /// against the source metadata without touching the target.
    pub fn check(&self, table: Option<&str>) -> Result<CheckReport, MigrateError> {
        let names = match table {
            Some(table) => vec![table.to_string()],
            None if self.config.tables.is_empty() => self
                .translation
                .sections()
                .into_iter()
                .filter(|name| !self.config.ontology_tables.contains(name))
                .map(str::to_string)
                .collect(),
            None => self.config.tables.iter().map(|table| table.name.clone()).collect(),
        };

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let translation = self.translation.translation_for(&name)?;
            let mappings = Concept::ALL
                .into_iter()
                .map(|concept| (concept, translation.for_concept(concept).len()))
                .collect();
            tables.push(TableCheck {
                row_id_columns: self
                    .config
                    .table(&name)
                    .map(|request| request.row_id_columns.clone())
                    .unwrap_or_default(),
                table: name,
                mappings,
                translation: translation.as_ref().clone(),
            });
        }
        Ok(CheckReport {
            ontology_terms: self.translation.ontology().len(),
            tables,
        })
    }

    /// Resolves the reference rows every round depends on. Any of them
    /// missing is fatal.
    pub fn prerequisites(&self) -> Result<ChadoRefs, MigrateError> {
        let mut conn = self.target.connect()?;
        let names = &self.config.chado;
        let refs = ChadoRefs {
            db_id: lookup_id(&mut *conn, "db", "name", &names.db)?,
            cv_id: lookup_id(&mut *conn, "cv", "name", &names.cv)?,
            project_id: lookup_id(&mut *conn, "project", "name", &names.dataset)?,
            organism_id: lookup_id(&mut *conn, "organism", "common_name", &self.config.organism)?,
            germplasm_type: self.config.germplasm_type.clone(),
        };
        debug!(?refs, "prerequisites found");
        Ok(refs)
    }

    /// Every configured table, in order.
    pub fn run_all(&self, options: &RunOptions) -> Result<RunSummary, MigrateError> {
        let started_at = Utc::now();
        let refs = self.prerequisites()?;
        let mut tables = Vec::with_capacity(self.config.tables.len());
        for table in &self.config.tables {
            tables.push(self.run_table(table, &refs, options)?);
        }
        Ok(RunSummary {
            started_at,
            finished_at: Utc::now(),
            dry_run: options.dry_run,
            mode: options.mode,
            refs,
            tables,
        })
    }

    /// One configured table.
    pub fn run(&self, table: &str, options: &RunOptions) -> Result<RunSummary, MigrateError> {
        let started_at = Utc::now();
        let request = self.config.table(table).ok_or_else(|| {
            MigrateError::ConfigParse(format!("table {table} is not listed in the run config"))
        })?;
        let refs = self.prerequisites()?;
        let summary = self.run_table(request, &refs, options)?;
        Ok(RunSummary {
            started_at,
            finished_at: Utc::now(),
            dry_run: options.dry_run,
            mode: options.mode,
            refs,
            tables: vec![summary],
        })
    }

    fn run_table(
        &self,
        request: &TableRequest,
        refs: &ChadoRefs,
        options: &RunOptions,
    ) -> Result<TableSummary, MigrateError> {
        if request.row_id_columns.is_empty() {
            return Err(MigrateError::ConfigParse(format!(
                "table {} has no row_id_columns",
                request.name
            )));
        }
        if options.page_size == 0 {
            return Err(MigrateError::ConfigParse("page_size must be positive".to_string()));
        }
        // Unknown tables and broken sections fail before the first round.
        self.translation.translation_for(&request.name)?;

        let round = Round {
            request,
            resolver: ChangeSetResolver::new(self.translation.clone()),
            linker: EntityLinker::new(self.translation.ontology().clone(), refs.clone()),
            executor: BatchExecutor::new(self.target.clone(), options.mode),
            storage: RunStorage::new(),
            options,
        };

        let mut summary = TableSummary {
            table: request.name.clone(),
            ..TableSummary::default()
        };
        let mut offset = 0usize;
        loop {
            let page_size = match options.limit {
                Some(limit) => options.page_size.min(limit.saturating_sub(offset)),
                None => options.page_size,
            };
            if page_size == 0 {
                info!(table = %request.name, rows = offset, "row limit reached");
                break;
            }
            let page = self
                .source
                .fetch_page(&request.name, &request.row_id_columns, offset, page_size)?;
            if page.is_empty() {
                break;
            }
            summary.rounds += 1;
            info!(
                table = %request.name,
                round = summary.rounds,
                offset,
                rows = page.len(),
                "starting round"
            );

            let fetched = page.len();
            self.run_page(&round, page, &mut summary)
                .map_err(|err| page_failure(&request.name, offset, err))?;
            summary.source_rows += fetched;
            offset += fetched;
        }

        info!(
            table = %request.name,
            rounds = summary.rounds,
            rows = summary.source_rows,
            written = summary.rows_written,
            mode = ?round.executor.mode(),
            "table done"
        );
        Ok(summary)
    }

    fn run_page(
        &self,
        round: &Round<'_>,
        page: Vec<SourceRow>,
        summary: &mut TableSummary,
    ) -> Result<(), MigrateError> {
        let table = &round.request.name;
        round.storage.clear()?;
        round.linker.clear_terms()?;
        let (rows, skipped) = pending_rows(&round.request.row_id_columns, page);
        summary.skipped_rows += skipped;

        let mut conn = self.target.connect()?;
        summary.connections += 1;
        let mut plans = BTreeMap::new();
        for concept in Concept::ALL {
            let inventory = TargetInventory::load(concept, &mut *conn)?;
            let changeset = round.resolver.resolve(concept, table, &rows, &inventory)?;
            *summary.pending.entry(concept).or_default() += changeset.len();
            info!(table = %table, concept = %concept, rows = changeset.len(), "change set");
            plans.insert(concept, round.linker.build(&mut *conn, &changeset)?);
        }
        let terms = round.linker.take_terms(&mut *conn)?;
        drop(conn);

        let mut take = |concept: Concept| {
            plans
                .remove(&concept)
                .unwrap_or_else(|| Step::noop(concept.to_string()))
        };
        let plan = Step::Sequence(vec![
            terms,
            Step::Parallel(vec![
                take(Concept::Stock),
                take(Concept::Geolocation),
                take(Concept::Contact),
            ]),
            Step::Parallel(vec![take(Concept::Phenotype), take(Concept::Stockprop)]),
        ]);
        debug!(tasks = plan.task_count(), "round plan\n{}", plan.render());

        if round.options.dry_run {
            summary.plans.push(plan.render());
            return Ok(());
        }

        let storage = &round.storage;
        let report = round.executor.execute(plan, storage)?;
        summary.tasks += report.tasks;
        summary.rows_written += report.rows_written;
        summary.connections += report.connections;
        summary.created.stocks += slot_len(storage, &Slot::Stocks)?;
        summary.created.geolocations += slot_len(storage, &Slot::Geolocations)?;
        summary.created.contacts += slot_len(storage, &Slot::Contacts)?;
        summary.created.phenotypes += slot_len(storage, &Slot::Phenotypes)?;
        summary.created.experiments += slot_len(storage, &Slot::Experiments)?;
        Ok(())
    }
}

/// Collaborators shared by every round of one table.
struct Round<'a> {
    request: &'a TableRequest,
    resolver: ChangeSetResolver,
    linker: EntityLinker,
    executor: BatchExecutor,
    storage: RunStorage,
    options: &'a RunOptions,
}

/// Identifier of a source row: its key columns joined with `-`. A `-` or
/// `\` inside a value is escaped with `\`, so distinct keys never share an
/// id.
pub fn row_id(row: &SourceRow, columns: &[String]) -> Option<String> {
    let mut id = String::new();
    for (index, column) in columns.iter().enumerate() {
        let part = row.text(column)?;
        if index > 0 {
            id.push('-');
        }
        for ch in part.chars() {
            if ch == '-' || ch == '\\' {
                id.push('\\');
            }
            id.push(ch);
        }
    }
    Some(id)
}

/// Rows of a page with their ids; rows without a complete key are dropped.
fn pending_rows(columns: &[String], page: Vec<SourceRow>) -> (Vec<PendingRow>, usize) {
    let mut rows = Vec::with_capacity(page.len());
    let mut skipped = 0usize;
    let mut seen = HashSet::new();
    for row in page {
        match row_id(&row, columns) {
            Some(id) => {
                if !seen.insert(id.clone()) {
                    debug!(row_id = %preview(&id), "repeated row id in page");
                }
                rows.push(PendingRow { row_id: id, row });
            }
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(
            skipped,
            key = %columns.join(", "),
            "rows without a complete key skipped"
        );
    }
    (rows, skipped)
}

fn lookup_id(
    conn: &mut dyn TargetConnection,
    table: &'static str,
    column: &str,
    name: &str,
) -> Result<i64, MigrateError> {
    conn.select(table, &Filter::eq(column, name))?
        .first()
        .and_then(|row| row.int(&id_column(table)))
        .ok_or_else(|| MigrateError::MissingReference {
            kind: table,
            name: name.to_string(),
        })
}

fn slot_len(storage: &RunStorage, slot: &Slot) -> Result<usize, MigrateError> {
    if storage.contains(slot)? {
        Ok(storage.get(slot)?.len())
    } else {
        Ok(0)
    }
}

fn page_failure(table: &str, offset: usize, err: MigrateError) -> MigrateError {
    if err.is_configuration() {
        return err;
    }
    warn!(table, offset, error = %err, "round failed, page abandoned");
    MigrateError::PageFailed {
        table: table.to_string(),
        offset,
        source: Box::new(err),
    }
}

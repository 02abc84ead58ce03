//! Turns change sets into ordered insert plans for the Chado target.

pub mod contact;
pub mod cvterm;
pub mod geolocation;
pub mod phenotype;
pub mod stock;
pub mod stockprop;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::batch::{Step, index_unique};
use crate::domain::{Concept, Filter, TargetRow};
use crate::error::{MigrateError, preview};
use crate::ontology::OntologyIndex;
use crate::resolver::ChangeSet;
use crate::store::TargetConnection;

/// Reference rows every insert hangs off, resolved once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChadoRefs {
    pub db_id: i64,
    pub cv_id: i64,
    pub project_id: i64,
    pub organism_id: i64,
    pub germplasm_type: String,
}

/// Builds insert plans for one page. Cvterms the plans need are collected
/// while they are built and created by one leading step, see
/// [`EntityLinker::take_terms`].
pub struct EntityLinker {
    ontology: Arc<OntologyIndex>,
    refs: ChadoRefs,
    requested: Mutex<Vec<cvterm::RequestedTerm>>,
}

impl EntityLinker {
    pub fn new(ontology: Arc<OntologyIndex>, refs: ChadoRefs) -> Self {
        Self {
            ontology,
            refs,
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn refs(&self) -> &ChadoRefs {
        &self.refs
    }

    pub fn ontology(&self) -> &OntologyIndex {
        &self.ontology
    }

    /// Insert plan for one change set. Concepts without work yield a no-op
    /// step so callers always get the same tree shape.
    pub fn build(
        &self,
        conn: &mut dyn TargetConnection,
        changeset: &ChangeSet,
    ) -> Result<Step, MigrateError> {
        if changeset.is_empty() {
            return Ok(Step::noop(format!("{}: nothing to insert", changeset.concept)));
        }
        match changeset.concept {
            Concept::Stock => self.build_stock(conn, changeset),
            Concept::Geolocation => self.build_geolocation(conn, changeset),
            Concept::Contact => self.build_contact(conn, changeset),
            Concept::Stockprop => self.build_stockprop(conn, changeset),
            Concept::Phenotype => self.build_phenotype(conn, changeset),
        }
    }

    /// Cvterms of the run's cv with one of `names`.
    fn term_filter<I>(&self, names: I) -> Filter
    where
        I: IntoIterator<Item = String>,
    {
        Filter::eq("cv_id", self.refs.cv_id).and(Filter::any_of("name", names))
    }
}

/// `name → cvterm_id` for fetched cvterms, failing when one of `wanted`
/// has not been created.
fn term_ids(
    fetched: &[TargetRow],
    wanted: &[String],
    concept: &str,
) -> Result<HashMap<String, i64>, MigrateError> {
    let ids = index_unique(fetched, "cvterm", "name", "cvterm_id")?;
    if let Some(missing) = wanted.iter().find(|name| !ids.contains_key(*name)) {
        return Err(MigrateError::invariant(
            concept,
            format!("cvterm {} does not exist after creation", preview(missing)),
        ));
    }
    Ok(ids)
}

/// Keeps the first occurrence of every key, preserving order.
fn unique_by<T, K, F>(items: impl IntoIterator<Item = T>, mut key: F) -> Vec<T>
where
    K: Eq + std::hash::Hash,
    F: FnMut(&T) -> K,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(key(item)))
        .collect()
}

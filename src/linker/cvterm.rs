use std::collections::HashSet;
use std::sync::MutexGuard;

use tracing::{debug, warn};

use super::{EntityLinker, unique_by};
use crate::batch::{InsertTask, Joined, RunStorage, Slot, Step, index_unique};
use crate::domain::{Filter, TargetRow, TargetValue};
use crate::error::{MigrateError, preview};
use crate::store::TargetConnection;

/// Where a cvterm id comes from once the plan runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TermRef {
    Known(i64),
    /// Created by the cvterm batch of `scope` in the same page.
    Created { scope: String, name: String },
}

impl TermRef {
    pub fn resolve(&self, storage: &RunStorage) -> Result<i64, MigrateError> {
        match self {
            TermRef::Known(id) => Ok(*id),
            TermRef::Created { scope, name } => storage
                .ids(&Slot::Cvterms(scope.clone()))?
                .get(name)
                .copied()
                .ok_or_else(|| {
                    MigrateError::invariant("cvterm", format!("{} was not created", preview(name)))
                }),
        }
    }
}

/// Scope of the cvterm batch that opens every page plan.
pub const PAGE_TERMS: &str = "page";

/// A cvterm some concept needs and the target does not have yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct RequestedTerm {
    name: String,
    definition: Option<String>,
    requester: String,
}

impl EntityLinker {
    /// Handle on the id of a single term, requesting it when the run's cv
    /// lacks it.
    pub fn build_term(
        &self,
        conn: &mut dyn TargetConnection,
        name: &str,
        requester: &str,
    ) -> Result<TermRef, MigrateError> {
        let known = conn
            .select("cvterm", &self.term_filter([name.to_string()]))?
            .first()
            .and_then(|row| row.int("cvterm_id"));
        if let Some(id) = known {
            return Ok(TermRef::Known(id));
        }
        self.request_terms(conn, &[name.to_string()], requester)?;
        Ok(TermRef::Created {
            scope: PAGE_TERMS.to_string(),
            name: name.to_string(),
        })
    }

    /// Registers the cvterms among `names` that the run's cv does not have
    /// yet. A name requested twice in one page is created once, with the
    /// definition its first requester chose.
    ///
    /// Definitions come from the ontology only when it covers every name of
    /// the request; otherwise the request's terms are created bare.
    pub fn request_terms(
        &self,
        conn: &mut dyn TargetConnection,
        names: &[String],
        requester: &str,
    ) -> Result<(), MigrateError> {
        let candidates = unique_by(
            names.iter().filter(|name| !name.is_empty()).cloned(),
            |name| name.clone(),
        );
        if candidates.is_empty() {
            return Ok(());
        }

        let known: HashSet<String> = conn
            .select("cvterm", &self.term_filter(candidates.clone()))?
            .iter()
            .filter_map(|row| row.text("name"))
            .collect();
        let mut requested = self.lock_requests()?;
        let needed = candidates
            .into_iter()
            .filter(|name| !known.contains(name))
            .filter(|name| match requested.iter().find(|term| term.name == *name) {
                Some(term) => {
                    debug!(name = %name, requester, first = %term.requester, "cvterm already requested");
                    false
                }
                None => true,
            })
            .collect::<Vec<_>>();
        if needed.is_empty() {
            debug!(requester, "no new cvterms");
            return Ok(());
        }

        let definitions = self.term_definitions(&needed);
        if definitions.is_none() {
            warn!(
                requester,
                terms = %preview(&needed.join(", ")),
                "ontology does not cover every new cvterm, creating them without definitions"
            );
        }
        for (index, name) in needed.into_iter().enumerate() {
            requested.push(RequestedTerm {
                name,
                definition: definitions.as_ref().and_then(|all| all.get(index).cloned()),
                requester: requester.to_string(),
            });
        }
        Ok(())
    }

    /// Forgets the requests of an abandoned plan.
    pub fn clear_terms(&self) -> Result<(), MigrateError> {
        self.lock_requests()?.clear();
        Ok(())
    }

    /// Creates every cvterm requested since the last call, each with a
    /// dbxref accession of the same name, and empties the registry. The
    /// step has to run before any plan that joins on those terms.
    pub fn take_terms(&self, conn: &mut dyn TargetConnection) -> Result<Step, MigrateError> {
        let requested = std::mem::take(&mut *self.lock_requests()?);
        if requested.is_empty() {
            return Ok(Step::noop(format!("cvterms:{PAGE_TERMS}")));
        }
        let names = requested.iter().map(|term| term.name.clone()).collect::<Vec<_>>();

        let db_id = self.refs.db_id;
        let cv_id = self.refs.cv_id;
        let accession_filter =
            Filter::eq("db_id", db_id).and(Filter::any_of("accession", names.clone()));
        let known_accessions: HashSet<String> = conn
            .select("dbxref", &accession_filter)?
            .iter()
            .filter_map(|row| row.text("accession"))
            .collect();
        let fresh = names
            .iter()
            .filter(|name| !known_accessions.contains(*name))
            .cloned()
            .collect::<Vec<_>>();

        let slot = Slot::Dbxrefs(PAGE_TERMS.to_string());
        let dbxrefs = InsertTask::insert(
            format!("dbxref:{PAGE_TERMS}"),
            "dbxref",
            &["db_id", "accession"],
            fresh
                .iter()
                .map(|name| vec![TargetValue::Integer(db_id), name.as_str().into()])
                .collect(),
        )
        .capturing(slot.clone(), fresh);

        let count = requested.len();
        let join = move |fetched: Vec<TargetRow>, storage: &RunStorage| -> Result<Joined, MigrateError> {
            let accessions = index_unique(&fetched, "dbxref", "accession", "dbxref_id")?;
            for (accession, id) in storage.ids(&slot)? {
                if accessions.get(&accession) != Some(&id) {
                    return Err(MigrateError::invariant(
                        "cvterm",
                        format!("dbxref {} was not found under its inserted id", preview(&accession)),
                    ));
                }
            }
            let mut joined = Joined::default();
            for term in requested {
                let dbxref_id = accessions.get(&term.name).ok_or_else(|| {
                    MigrateError::invariant("cvterm", format!("no dbxref for {}", preview(&term.name)))
                })?;
                joined.rows.push(vec![
                    TargetValue::Integer(cv_id),
                    TargetValue::Integer(*dbxref_id),
                    term.name.as_str().into(),
                    term.definition.into(),
                    TargetValue::Integer(0),
                    TargetValue::Integer(0),
                ]);
                joined.keys.push(term.name);
            }
            Ok(joined)
        };
        let cvterms = InsertTask::fetch_join_insert(
            format!("cvterm:{PAGE_TERMS}"),
            "dbxref",
            accession_filter,
            "cvterm",
            &["cv_id", "dbxref_id", "name", "definition", "is_obsolete", "is_relationshiptype"],
            join,
        )
        .capturing(Slot::Cvterms(PAGE_TERMS.to_string()), Vec::new());

        debug!(new = count, "cvterm batch built");
        Ok(Step::Sequence(vec![dbxrefs.into(), cvterms.into()]))
    }

    fn lock_requests(&self) -> Result<MutexGuard<'_, Vec<RequestedTerm>>, MigrateError> {
        self.requested
            .lock()
            .map_err(|_| MigrateError::Store("cvterm registry lock poisoned".to_string()))
    }

    /// One definition per name, or `None` unless the ontology knows all of
    /// them.
    fn term_definitions(&self, names: &[String]) -> Option<Vec<String>> {
        let mut definitions = Vec::with_capacity(names.len());
        for name in names {
            let found = self.ontology.lookup_trait(name);
            let term = found.first()?;
            if found.len() > 1 {
                warn!(
                    name = %name,
                    candidates = found.len(),
                    "several ontology terms for one cvterm, using the first"
                );
            }
            definitions.push(term.definition());
        }
        Some(definitions)
    }
}

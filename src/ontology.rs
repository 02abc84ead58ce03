use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{AttributeRef, SourceRow};
use crate::error::MigrateError;
use crate::store::SourceStore;

const NAME_COLUMN: &str = "SPANISH";
const NAME_VARIABLE_COLUMN: &str = "VARIABLE_ID_BMS";
const TERM_VARIABLE_COLUMN: &str = "VARIABLE_ID";
const TRAIT_NAME_COLUMN: &str = "TRAIT_NAME";
const TRAIT_DESCRIPTION_COLUMN: &str = "TRAIT_DESCRIPTION";
const TRAIT_CLASS_COLUMN: &str = "TRAIT_CLASS";
const CROP_COLUMN: &str = "CROP";

/// Source tables holding the trait ontology: local column names and the
/// canonical trait terms they point to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OntologyTables {
    pub names: String,
    pub terms: String,
}

impl Default for OntologyTables {
    fn default() -> Self {
        Self {
            names: "V_ONTOLOGY_SPANISH".to_string(),
            terms: "V_ONTOLOGY".to_string(),
        }
    }
}

impl OntologyTables {
    pub fn contains(&self, table: &str) -> bool {
        self.names == table || self.terms == table
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OntologyTerm {
    pub source_name: String,
    pub trait_name: String,
    pub description: String,
    pub trait_class: String,
    pub crop: String,
}

impl OntologyTerm {
    /// Definition stored on a created cvterm.
    pub fn definition(&self) -> String {
        format!("{}: {}", self.trait_class, self.description)
    }
}

/// Read-only lookup from source column / trait names to canonical traits.
#[derive(Debug, Clone, Default)]
pub struct OntologyIndex {
    by_source: BTreeMap<String, Vec<OntologyTerm>>,
    terms: Vec<OntologyTerm>,
}

impl OntologyIndex {
    pub fn new(terms: Vec<OntologyTerm>) -> Self {
        let mut by_source = BTreeMap::<String, Vec<OntologyTerm>>::new();
        for term in &terms {
            by_source
                .entry(term.source_name.to_uppercase())
                .or_default()
                .push(term.clone());
        }
        Self { by_source, terms }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Joins the name table with the term table on their variable ids.
    /// Names without a matching term are unusable and dropped.
    pub fn load(source: &dyn SourceStore, tables: &OntologyTables) -> Result<Self, MigrateError> {
        let names = fetch_all(source, &tables.names)?;
        let terms = fetch_all(source, &tables.terms)?;

        let mut joined = Vec::new();
        let mut dropped = 0usize;
        for name in &names {
            let (Some(source_name), Some(variable)) =
                (name.text(NAME_COLUMN), name.text(NAME_VARIABLE_COLUMN))
            else {
                dropped += 1;
                continue;
            };
            let matches = terms
                .iter()
                .filter(|term| term.text(TERM_VARIABLE_COLUMN).as_deref() == Some(variable.as_str()))
                .collect::<Vec<_>>();
            if matches.is_empty() {
                dropped += 1;
                continue;
            }
            for term in matches {
                joined.push(OntologyTerm {
                    source_name: source_name.clone(),
                    trait_name: term.text(TRAIT_NAME_COLUMN).unwrap_or_default(),
                    description: term.text(TRAIT_DESCRIPTION_COLUMN).unwrap_or_default(),
                    trait_class: term.text(TRAIT_CLASS_COLUMN).unwrap_or_default(),
                    crop: term.text(CROP_COLUMN).unwrap_or_default(),
                });
            }
        }
        debug!(
            terms = joined.len(),
            dropped, "loaded ontology from {} and {}", tables.names, tables.terms
        );
        Ok(Self::new(joined))
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// First term known for a source column or local trait name,
    /// case-insensitive.
    pub fn lookup(&self, name: &str) -> Option<&OntologyTerm> {
        let found = self.by_source.get(&name.to_uppercase())?;
        if found.len() > 1 {
            warn!(
                name,
                candidates = found.len(),
                "ontology has several terms for one name, using the first"
            );
        }
        found.first()
    }

    pub fn trait_name(&self, name: &str) -> Option<&str> {
        self.lookup(name).map(|term| term.trait_name.as_str())
    }

    /// Terms whose canonical trait name equals `trait_name`,
    /// case-insensitive.
    pub fn lookup_trait(&self, trait_name: &str) -> Vec<&OntologyTerm> {
        let wanted = trait_name.to_lowercase();
        let mut seen = Vec::<&str>::new();
        let mut found = Vec::new();
        for term in &self.terms {
            if term.trait_name.to_lowercase() == wanted && !seen.contains(&term.source_name.as_str()) {
                seen.push(&term.source_name);
                found.push(term);
            }
        }
        found
    }

    /// Generic per-row mapping of every known source column to a phenotype
    /// value.
    pub fn translation(&self) -> BTreeMap<String, AttributeRef> {
        self.by_source
            .keys()
            .map(|name| (name.clone(), AttributeRef::new("phenotype", "value")))
            .collect()
    }

    pub fn crop(&self) -> Option<&str> {
        self.terms
            .first()
            .map(|term| term.crop.as_str())
            .filter(|crop| !crop.is_empty())
    }
}

fn fetch_all(source: &dyn SourceStore, table: &str) -> Result<Vec<SourceRow>, MigrateError> {
    source.fetch_page(table, &[], 0, usize::MAX)
}

//! Source column → target attribute translation.
//!
//! The translation config is an INI-style file with one section per source
//! table. Every option maps a source column (keys are upper-cased) either to
//! a `table.attribute` in the target schema or to a constant relationship
//! written as `/* ... */`. A leading underscore lets one column feed a second
//! attribute (`_NAME = stock.uniquename`).

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info};

use crate::catalog::SchemaCatalog;
use crate::domain::{AttributeRef, Concept};
use crate::error::{MigrateError, preview};
use crate::ontology::{OntologyIndex, OntologyTables};

#[derive(Debug, Clone, PartialEq, Eq)]
struct IniEntry {
    key: String,
    value: String,
    line: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct IniDocument {
    sections: Vec<(String, Vec<IniEntry>)>,
}

impl IniDocument {
    fn parse(text: &str) -> Result<Self, MigrateError> {
        let mut sections: Vec<(String, Vec<IniEntry>)> = Vec::new();
        let mut errors = Vec::new();
        let mut current = None;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }
            if let Some(name) = trimmed.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
                let name = name.trim().to_string();
                // Repeated sections continue the first one.
                current = match sections.iter().position(|(existing, _)| *existing == name) {
                    Some(position) => Some(position),
                    None => {
                        sections.push((name, Vec::new()));
                        Some(sections.len() - 1)
                    }
                };
                continue;
            }
            let Some(split) = trimmed.find(['=', ':']) else {
                errors.push(format!("line {line}: expected `key = value`: {}", preview(trimmed)));
                continue;
            };
            let (key, value) = (trimmed[..split].trim(), trimmed[split + 1..].trim());
            let Some((_, entries)) = current.and_then(|position| sections.get_mut(position)) else {
                errors.push(format!("line {line}: option outside of any section: {}", preview(key)));
                continue;
            };
            if key.is_empty() {
                errors.push(format!("line {line}: empty option name"));
                continue;
            }
            entries.push(IniEntry {
                key: key.to_uppercase(),
                value: value.to_string(),
                line,
            });
        }

        if !errors.is_empty() {
            return Err(MigrateError::ConfigParse(errors.join("; ")));
        }
        Ok(Self { sections })
    }

    fn section(&self, name: &str) -> Option<&[IniEntry]> {
        self.sections
            .iter()
            .find(|(section, _)| section == name)
            .map(|(_, entries)| entries.as_slice())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingOrigin {
    Config,
    Ontology,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnMapping {
    /// Option name as written in the config (upper-cased).
    pub key: String,
    /// Source column the value is read from.
    pub column: String,
    pub target: AttributeRef,
    pub origin: MappingOrigin,
}

/// A literal relationship that has to be resolved against the target store,
/// e.g. `/* stock.type_id = cultivar */`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConstantRelation {
    pub target: Option<AttributeRef>,
    pub value: String,
}

impl ConstantRelation {
    fn parse(content: &str) -> Self {
        if let Some((lhs, rhs)) = content.split_once('=') {
            if let Ok(target) = lhs.parse::<AttributeRef>() {
                return Self {
                    target: Some(target),
                    value: rhs.trim().to_string(),
                };
            }
        }
        Self {
            target: None,
            value: content.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslationMap {
    pub table: String,
    pub columns: Vec<ColumnMapping>,
    pub constants: BTreeMap<String, ConstantRelation>,
}

impl TranslationMap {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.constants.is_empty()
    }

    pub fn for_concept(&self, concept: Concept) -> Vec<&ColumnMapping> {
        let tables = concept.mapped_tables();
        self.columns
            .iter()
            .filter(|mapping| tables.contains(&mapping.target.table.as_str()))
            .collect()
    }

    pub fn constants_for(&self, concept: Concept) -> Vec<(&String, &ConstantRelation)> {
        let tables = concept.mapped_tables();
        self.constants
            .iter()
            .filter(|(_, constant)| {
                constant
                    .target
                    .as_ref()
                    .is_some_and(|target| tables.contains(&target.table.as_str()))
            })
            .collect()
    }

    /// Source column feeding `table.attribute`, first mapping wins.
    pub fn column_for(&self, table: &str, attribute: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|mapping| mapping.target.table == table && mapping.target.attribute == attribute)
            .map(|mapping| mapping.column.as_str())
    }

    pub fn constant_value(&self, table: &str, attribute: &str) -> Option<&str> {
        self.constants
            .values()
            .find(|constant| {
                constant
                    .target
                    .as_ref()
                    .is_some_and(|target| target.table == table && target.attribute == attribute)
            })
            .map(|constant| constant.value.as_str())
    }
}

/// Parsed translation config, validated per source table on first use.
pub struct TranslationConfig {
    document: IniDocument,
    catalog: Arc<SchemaCatalog>,
    ontology: Arc<OntologyIndex>,
    ontology_tables: OntologyTables,
    cache: Mutex<HashMap<String, Arc<TranslationMap>>>,
}

impl TranslationConfig {
    pub fn from_path(
        path: &Path,
        catalog: Arc<SchemaCatalog>,
        ontology: Arc<OntologyIndex>,
        ontology_tables: OntologyTables,
    ) -> Result<Self, MigrateError> {
        let text =
            fs::read_to_string(path).map_err(|_| MigrateError::ConfigRead(path.to_path_buf()))?;
        Self::parse(&text, catalog, ontology, ontology_tables)
    }

    pub fn parse(
        text: &str,
        catalog: Arc<SchemaCatalog>,
        ontology: Arc<OntologyIndex>,
        ontology_tables: OntologyTables,
    ) -> Result<Self, MigrateError> {
        Ok(Self {
            document: IniDocument::parse(text)?,
            catalog,
            ontology,
            ontology_tables,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn sections(&self) -> Vec<&str> {
        self.document
            .sections
            .iter()
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn ontology(&self) -> &Arc<OntologyIndex> {
        &self.ontology
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    pub fn translation_for(&self, table: &str) -> Result<Arc<TranslationMap>, MigrateError> {
        if let Some(map) = self.cached(table)? {
            return Ok(map);
        }
        let map = Arc::new(self.build(table)?);
        info!(
            table,
            mappings = map.columns.len(),
            constants = map.constants.len(),
            "translation ready"
        );
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| MigrateError::Store("translation cache lock poisoned".to_string()))?;
        Ok(cache.entry(table.to_string()).or_insert(map).clone())
    }

    fn cached(&self, table: &str) -> Result<Option<Arc<TranslationMap>>, MigrateError> {
        let cache = self
            .cache
            .lock()
            .map_err(|_| MigrateError::Store("translation cache lock poisoned".to_string()))?;
        Ok(cache.get(table).cloned())
    }

    fn build(&self, table: &str) -> Result<TranslationMap, MigrateError> {
        let entries = self
            .document
            .section(table)
            .ok_or_else(|| MigrateError::MissingSection(table.to_string()))?;
        let skip_column_check = self.ontology_tables.contains(table);

        let mut columns = Vec::new();
        let mut constants = BTreeMap::new();
        let mut errors = Vec::new();

        for entry in entries {
            let value = entry.value.trim();
            if let Some(content) = value.strip_prefix("/*").and_then(|rest| rest.strip_suffix("*/")) {
                let content = content.trim();
                if content.is_empty() {
                    errors.push(format!("line {}: {} = {} (empty constant)", entry.line, entry.key, value));
                } else {
                    constants.insert(entry.key.clone(), ConstantRelation::parse(content));
                }
                continue;
            }

            let target = match value.parse::<AttributeRef>() {
                Ok(target) => target,
                Err(reason) => {
                    errors.push(format!(
                        "line {}: {} = {} ({reason})",
                        entry.line,
                        entry.key,
                        preview(value)
                    ));
                    continue;
                }
            };

            let column = if skip_column_check || self.catalog.contains(table, &entry.key)? {
                entry.key.clone()
            } else {
                let stripped = entry.key.trim_start_matches('_');
                if stripped != entry.key && self.catalog.contains(table, stripped)? {
                    debug!(table, key = %entry.key, "leading underscore stripped from option");
                    stripped.to_string()
                } else {
                    errors.push(format!(
                        "line {}: {} = {} (not a column of {table})",
                        entry.line, entry.key, value
                    ));
                    continue;
                }
            };

            columns.push(ColumnMapping {
                key: entry.key.clone(),
                column,
                target,
                origin: MappingOrigin::Config,
            });
        }

        if !errors.is_empty() {
            return Err(MigrateError::Translation {
                table: table.to_string(),
                entries: errors,
            });
        }

        for (column, target) in self.ontology.translation() {
            if columns.iter().any(|mapping| mapping.key == column) {
                continue;
            }
            columns.push(ColumnMapping {
                key: column.clone(),
                column,
                target,
                origin: MappingOrigin::Ontology,
            });
        }

        Ok(TranslationMap {
            table: table.to_string(),
            columns,
            constants,
        })
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::MigrateError;
use crate::ontology::OntologyTables;

pub const DEFAULT_CONFIG: &str = "chado-migrate.json";
pub const DEFAULT_TRANSLATION: &str = "trans.conf";
pub const DEFAULT_CHADO_NAME: &str = "mcl_pheno";
pub const DEFAULT_ORGANISM: &str = "Cassava";
pub const DEFAULT_GERMPLASM_TYPE: &str = "cultivar";
/// Source rows per paging round.
pub const DEFAULT_PAGE_SIZE: usize = 600_000;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub translation: Option<String>,
    #[serde(default)]
    pub chado: Option<ChadoSection>,
    #[serde(default)]
    pub organism: Option<String>,
    #[serde(default)]
    pub germplasm_type: Option<String>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub ontology_tables: Option<OntologyTables>,
    /// Key columns for table entries that do not list their own.
    #[serde(default)]
    pub row_id_columns: Option<Vec<String>>,
    #[serde(default)]
    pub tables: Vec<TableEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ChadoSection {
    #[serde(default)]
    pub db: Option<String>,
    #[serde(default)]
    pub cv: Option<String>,
    #[serde(default)]
    pub dataset: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TableEntry {
    Shorthand(String),
    Detailed(TableEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TableEntryObject {
    pub name: String,
    #[serde(default)]
    pub row_id_columns: Vec<String>,
}

/// A source table to migrate and the columns identifying its rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRequest {
    pub name: String,
    pub row_id_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChadoNames {
    pub db: String,
    pub cv: String,
    pub dataset: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub translation: PathBuf,
    pub chado: ChadoNames,
    pub organism: String,
    pub germplasm_type: String,
    pub page_size: usize,
    pub ontology_tables: OntologyTables,
    pub tables: Vec<TableRequest>,
}

impl ResolvedConfig {
    pub fn table(&self, name: &str) -> Option<&TableRequest> {
        self.tables.iter().find(|table| table.name == name)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&Path>) -> Result<ResolvedConfig, MigrateError> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG),
        };

        if path.is_none() && !config_path.exists() {
            return Err(MigrateError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| MigrateError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| MigrateError::ConfigParse(err.to_string()))?;

        let base = config_path.parent().unwrap_or_else(|| Path::new(""));
        Self::resolve_config(config, base)
    }

    /// Applies defaults; a relative translation path is taken relative to
    /// `base`.
    pub fn resolve_config(config: Config, base: &Path) -> Result<ResolvedConfig, MigrateError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(MigrateError::ConfigParse(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let page_size = config.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size == 0 {
            return Err(MigrateError::ConfigParse("page_size must be positive".to_string()));
        }

        let translation = base.join(config.translation.as_deref().unwrap_or(DEFAULT_TRANSLATION));
        let chado = config.chado.unwrap_or_default();
        let chado = ChadoNames {
            db: chado.db.unwrap_or_else(|| DEFAULT_CHADO_NAME.to_string()),
            cv: chado.cv.unwrap_or_else(|| DEFAULT_CHADO_NAME.to_string()),
            dataset: chado.dataset.unwrap_or_else(|| DEFAULT_CHADO_NAME.to_string()),
        };

        let default_key = config.row_id_columns.unwrap_or_default();
        let tables = config
            .tables
            .into_iter()
            .map(|entry| {
                let (name, row_id_columns) = match entry {
                    TableEntry::Shorthand(name) => (name, Vec::new()),
                    TableEntry::Detailed(obj) => (obj.name, obj.row_id_columns),
                };
                if name.trim().is_empty() {
                    return Err(MigrateError::ConfigParse("table name must not be empty".to_string()));
                }
                let row_id_columns = if row_id_columns.is_empty() {
                    default_key.clone()
                } else {
                    row_id_columns
                };
                if row_id_columns.is_empty() {
                    return Err(MigrateError::ConfigParse(format!(
                        "table {name} has no row_id_columns, list them on the entry \
                         ({{ \"name\": \"{name}\", \"row_id_columns\": [...] }}) \
                         or set a top-level row_id_columns"
                    )));
                }
                Ok(TableRequest {
                    name,
                    row_id_columns: row_id_columns
                        .into_iter()
                        .map(|column| column.to_uppercase())
                        .collect(),
                })
            })
            .collect::<Result<Vec<_>, MigrateError>>()?;

        Ok(ResolvedConfig {
            schema_version,
            translation,
            chado,
            organism: config.organism.unwrap_or_else(|| DEFAULT_ORGANISM.to_string()),
            germplasm_type: config
                .germplasm_type
                .unwrap_or_else(|| DEFAULT_GERMPLASM_TYPE.to_string()),
            page_size,
            ontology_tables: config.ontology_tables.unwrap_or_default(),
            tables,
        })
    }
}

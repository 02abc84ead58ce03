#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use chado_pheno_migrate::catalog::SchemaCatalog;
use chado_pheno_migrate::config::{ConfigLoader, ResolvedConfig, TableEntry, TableEntryObject};
use chado_pheno_migrate::domain::{SourceValue, TargetRow};
use chado_pheno_migrate::linker::ChadoRefs;
use chado_pheno_migrate::memory::{MemorySourceStore, MemoryTargetStore};
use chado_pheno_migrate::ontology::{OntologyIndex, OntologyTables};
use chado_pheno_migrate::translation::TranslationConfig;

pub const TABLE: &str = "VM_RESUMEN_EVAL_AVANZADAS";

pub const TRANSLATION: &str = "\
# advanced trials
[VM_RESUMEN_EVAL_AVANZADAS]
germplasm = stock.name
_germplasm = stock.uniquename
site = nd_geolocation.description
latitud = nd_geolocation.latitude
longitud = nd_geolocation.longitude
altitud = nd_geolocation.altitude
pais = nd_geolocationprop.country
fecha_siembra = stockprop.planting_date
evaluador = contact.name
stock_type = /* stock.type_id = cultivar */
";

pub const COLUMNS: [&str; 12] = [
    "TRIAL",
    "PLOT",
    "GERMPLASM",
    "SITE",
    "LATITUD",
    "LONGITUD",
    "ALTITUD",
    "PAIS",
    "FECHA_SIEMBRA",
    "EVALUADOR",
    "ALTURA",
    "COLOR",
];

fn text(value: &str) -> Option<SourceValue> {
    Some(value.into())
}

/// One plot of the advanced trial at Palmira.
pub fn plot(plot: i64, germplasm: &str, height: Option<i64>, color: Option<&str>) -> Vec<Option<SourceValue>> {
    vec![
        text("T1"),
        Some(plot.into()),
        text(germplasm),
        text("Palmira"),
        text("666N"),
        text(" 73W"),
        text("1"),
        text("Colombia"),
        text("2015-03-01"),
        text("Ana"),
        height.map(SourceValue::from),
        color.map(SourceValue::from),
    ]
}

pub fn ontology_tables(store: MemorySourceStore) -> MemorySourceStore {
    store
        .with_table(
            "V_ONTOLOGY_SPANISH",
            &["SPANISH", "VARIABLE_ID_BMS"],
            vec![
                vec![text("Altura"), Some(1i64.into())],
                vec![text("Color"), Some(2i64.into())],
            ],
        )
        .with_table(
            "V_ONTOLOGY",
            &["VARIABLE_ID", "TRAIT_NAME", "TRAIT_DESCRIPTION", "TRAIT_CLASS", "CROP"],
            vec![
                vec![
                    Some(1i64.into()),
                    text("height"),
                    text("plant height"),
                    text("Agronomic"),
                    text("Cassava"),
                ],
                vec![
                    Some(2i64.into()),
                    text("color"),
                    text("leaf color"),
                    text("Morphological"),
                    text("Cassava"),
                ],
            ],
        )
}

/// Three plots: two of GM1 and one of GM2 without a color reading.
pub fn source() -> MemorySourceStore {
    ontology_tables(MemorySourceStore::new()).with_table(
        TABLE,
        &COLUMNS,
        vec![
            plot(1, "GM1", Some(12), Some("red")),
            plot(2, "GM1", Some(14), Some("green")),
            plot(3, "GM2", Some(9), None),
        ],
    )
}

/// Target holding only the reference rows a run requires.
pub fn target() -> MemoryTargetStore {
    let target = MemoryTargetStore::new();
    target
        .seed("db", TargetRow::new().with("name", "mcl_pheno"))
        .unwrap();
    target
        .seed("cv", TargetRow::new().with("name", "mcl_pheno"))
        .unwrap();
    target
        .seed("project", TargetRow::new().with("name", "mcl_pheno"))
        .unwrap();
    target
        .seed(
            "organism",
            TargetRow::new()
                .with("genus", "Manihot")
                .with("species", "esculenta")
                .with("common_name", "Cassava"),
        )
        .unwrap();
    target
}

/// Run config for [`TABLE`] keyed by trial and plot, translation written
/// into `dir`.
pub fn config(dir: &Path) -> ResolvedConfig {
    std::fs::write(dir.join("trans.conf"), TRANSLATION).unwrap();
    let config = chado_pheno_migrate::config::Config {
        tables: vec![TableEntry::Detailed(TableEntryObject {
            name: TABLE.to_string(),
            row_id_columns: vec!["trial".to_string(), "plot".to_string()],
        })],
        ..Default::default()
    };
    ConfigLoader::resolve_config(config, dir).unwrap()
}

pub fn translation(source: MemorySourceStore, text: &str) -> Arc<TranslationConfig> {
    let tables = OntologyTables::default();
    let ontology = Arc::new(OntologyIndex::load(&source, &tables).unwrap());
    let catalog = Arc::new(SchemaCatalog::new(Arc::new(source)));
    Arc::new(TranslationConfig::parse(text, catalog, ontology, tables).unwrap())
}

pub fn count(target: &MemoryTargetStore, table: &str) -> usize {
    target.rows(table).unwrap().len()
}

/// Reference ids of a target prepared by [`target`].
pub fn refs(target: &MemoryTargetStore) -> ChadoRefs {
    let id = |table: &str| {
        target.rows(table).unwrap()[0]
            .int(&format!("{table}_id"))
            .unwrap()
    };
    ChadoRefs {
        db_id: id("db"),
        cv_id: id("cv"),
        project_id: id("project"),
        organism_id: id("organism"),
        germplasm_type: "cultivar".to_string(),
    }
}

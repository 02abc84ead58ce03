use std::path::Path;

use assert_matches::assert_matches;

use chado_pheno_migrate::config::{
    Config, ConfigLoader, DEFAULT_PAGE_SIZE, TableEntry, TableEntryObject, TableRequest,
};
use chado_pheno_migrate::error::MigrateError;

#[test]
fn parse_config_shorthand() {
    let config = Config {
        tables: vec![
            TableEntry::Shorthand("VM_RESUMEN_ENFERMEDADES".to_string()),
            TableEntry::Detailed(TableEntryObject {
                name: "VM_RESUMEN_EVAL_AVANZADAS".to_string(),
                row_id_columns: vec!["trial".to_string(), "plot".to_string()],
            }),
        ],
        row_id_columns: Some(vec!["id".to_string()]),
        ..Config::default()
    };

    let resolved = ConfigLoader::resolve_config(config, Path::new("/etc/chado")).unwrap();
    assert_eq!(resolved.schema_version, 1);
    assert_eq!(resolved.page_size, DEFAULT_PAGE_SIZE);
    assert_eq!(resolved.translation, Path::new("/etc/chado/trans.conf"));
    assert_eq!(resolved.chado.db, "mcl_pheno");
    assert_eq!(resolved.germplasm_type, "cultivar");
    assert_eq!(resolved.ontology_tables.names, "V_ONTOLOGY_SPANISH");
    assert_eq!(resolved.tables.len(), 2);
    assert_eq!(resolved.tables[0].row_id_columns, vec!["ID".to_string()]);
    assert_eq!(
        resolved.table("VM_RESUMEN_EVAL_AVANZADAS"),
        Some(&TableRequest {
            name: "VM_RESUMEN_EVAL_AVANZADAS".to_string(),
            row_id_columns: vec!["TRIAL".to_string(), "PLOT".to_string()],
        })
    );
}

#[test]
fn resolve_reads_json_next_to_translation() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("chado-migrate.json");
    std::fs::write(
        &path,
        r#"{
            "translation": "conf/trans.conf",
            "chado": { "cv": "pheno_cv" },
            "organism": "Rice",
            "page_size": 500,
            "ontology_tables": { "names": "V_NAMES", "terms": "V_TERMS" },
            "row_id_columns": ["trial", "plot"],
            "tables": ["VM_A", { "name": "VM_B", "row_id_columns": ["ID"] }]
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(Some(path.as_path())).unwrap();
    assert_eq!(resolved.translation, temp.path().join("conf/trans.conf"));
    assert_eq!(resolved.chado.cv, "pheno_cv");
    assert_eq!(resolved.chado.dataset, "mcl_pheno");
    assert_eq!(resolved.organism, "Rice");
    assert_eq!(resolved.page_size, 500);
    assert_eq!(resolved.ontology_tables.terms, "V_TERMS");
    assert_eq!(resolved.tables[0].row_id_columns, vec!["TRIAL".to_string(), "PLOT".to_string()]);
    assert_eq!(resolved.tables[1].row_id_columns, vec!["ID".to_string()]);
}

#[test]
fn tables_without_a_key_fail_at_load() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("chado-migrate.json");
    std::fs::write(
        &path,
        r#"{ "tables": [{ "name": "VM_B", "row_id_columns": ["ID"] }, "VM_A"] }"#,
    )
    .unwrap();

    assert_matches!(
        ConfigLoader::resolve(Some(path.as_path())),
        Err(MigrateError::ConfigParse(message)) if message.starts_with("table VM_A has no row_id_columns")
    );
}

#[test]
fn unreadable_config_is_reported_with_its_path() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(Some(path.as_path())),
        Err(MigrateError::ConfigRead(reported)) if reported == path
    );
}

#[test]
fn malformed_config_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("chado-migrate.json");
    std::fs::write(&path, "{ \"tables\": 3 }").unwrap();
    assert_matches!(ConfigLoader::resolve(Some(path.as_path())), Err(MigrateError::ConfigParse(_)));
}

#[test]
fn unsupported_schema_version_is_rejected() {
    let config = Config {
        schema_version: Some(2),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config, Path::new("")),
        Err(MigrateError::ConfigParse(message)) if message.contains("schema_version")
    );
}

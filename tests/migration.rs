mod common;

use std::sync::Arc;

use assert_matches::assert_matches;

use chado_pheno_migrate::domain::{Concept, TargetRow, TargetValue};
use chado_pheno_migrate::driver::{MigrationDriver, RunOptions};
use chado_pheno_migrate::error::MigrateError;
use chado_pheno_migrate::executor::ExecutionMode;
use chado_pheno_migrate::memory::{MemorySourceStore, MemoryTargetStore};

use common::{TABLE, count};

fn driver(source: MemorySourceStore, target: &MemoryTargetStore, dir: &std::path::Path) -> MigrationDriver {
    MigrationDriver::open(Arc::new(source), Arc::new(target.clone()), common::config(dir)).unwrap()
}

fn options(page_size: usize) -> RunOptions {
    RunOptions {
        page_size,
        ..RunOptions::default()
    }
}

#[test]
fn full_run_links_every_concept() {
    let temp = tempfile::tempdir().unwrap();
    let target = common::target();
    let driver = driver(common::source(), &target, temp.path());

    let summary = driver.run(TABLE, &options(600)).unwrap();
    let table = &summary.tables[0];
    assert_eq!(table.rounds, 1);
    assert_eq!(table.source_rows, 3);
    assert_eq!(table.created.stocks, 2);
    assert_eq!(table.created.phenotypes, 5);
    assert_eq!(table.created.experiments, 3);

    assert_eq!(count(&target, "stock"), 2);
    assert_eq!(count(&target, "nd_geolocation"), 1);
    assert_eq!(count(&target, "nd_geolocationprop"), 1);
    assert_eq!(count(&target, "contact"), 1);
    assert_eq!(count(&target, "stockprop"), 2);
    assert_eq!(count(&target, "phenotype"), 5);
    assert_eq!(count(&target, "nd_experiment"), 3);
    assert_eq!(count(&target, "nd_experiment_phenotype"), 5);
    assert_eq!(count(&target, "nd_experiment_stock"), 3);
    assert_eq!(count(&target, "nd_experiment_project"), 3);

    let site = &target.rows("nd_geolocation").unwrap()[0];
    assert_eq!(site.get("latitude"), Some(&TargetValue::Float(666.0)));
    assert_eq!(site.get("longitude"), Some(&TargetValue::Float(-73.0)));
    assert_eq!(site.get("altitude"), Some(&TargetValue::Float(1.0)));

    let cvterms = target.rows("cvterm").unwrap();
    let height = cvterms
        .iter()
        .find(|row| row.text("name").as_deref() == Some("height"))
        .unwrap();
    assert_eq!(height.text("definition").as_deref(), Some("Agronomic: plant height"));
    assert_eq!(count(&target, "dbxref"), cvterms.len());
}

#[test]
fn rerun_writes_nothing_new() {
    let temp = tempfile::tempdir().unwrap();
    let target = common::target();
    let driver = driver(common::source(), &target, temp.path());

    driver.run(TABLE, &options(600)).unwrap();
    let before = target.snapshot().unwrap();

    let summary = driver.run(TABLE, &options(600)).unwrap();
    let table = &summary.tables[0];
    assert_eq!(table.rows_written, 0);
    assert!(table.pending.values().all(|pending| *pending == 0));
    assert_eq!(target.snapshot().unwrap().tables, before.tables);
}

#[test]
fn paging_matches_a_single_round() {
    let temp = tempfile::tempdir().unwrap();
    let paged = common::target();
    let summary = driver(common::source(), &paged, temp.path())
        .run(TABLE, &options(2))
        .unwrap();
    assert_eq!(summary.tables[0].rounds, 2);

    let whole = common::target();
    driver(common::source(), &whole, temp.path())
        .run(TABLE, &options(600))
        .unwrap();

    for table in ["stock", "phenotype", "nd_experiment", "nd_experiment_stock", "stockprop"] {
        assert_eq!(count(&paged, table), count(&whole, table), "{table}");
    }
}

#[test]
fn sequential_mode_produces_the_same_rows() {
    let temp = tempfile::tempdir().unwrap();
    let target = common::target();
    let options = RunOptions {
        mode: ExecutionMode::Sequential,
        ..options(600)
    };
    let summary = driver(common::source(), &target, temp.path())
        .run(TABLE, &options)
        .unwrap();
    assert_eq!(summary.mode, ExecutionMode::Sequential);
    assert_eq!(count(&target, "phenotype"), 5);
    assert_eq!(count(&target, "nd_experiment_phenotype"), 5);
}

#[test]
fn limit_caps_processed_rows() {
    let temp = tempfile::tempdir().unwrap();
    let target = common::target();
    let options = RunOptions {
        limit: Some(1),
        ..options(600)
    };
    let summary = driver(common::source(), &target, temp.path())
        .run(TABLE, &options)
        .unwrap();
    assert_eq!(summary.tables[0].source_rows, 1);
    assert_eq!(count(&target, "phenotype"), 2);
    assert_eq!(count(&target, "stock"), 1);
}

#[test]
fn dry_run_renders_without_writing() {
    let temp = tempfile::tempdir().unwrap();
    let target = common::target();
    let before = target.snapshot().unwrap();
    let options = RunOptions {
        dry_run: true,
        ..options(600)
    };
    let summary = driver(common::source(), &target, temp.path())
        .run(TABLE, &options)
        .unwrap();
    let table = &summary.tables[0];
    assert_eq!(table.plans.len(), 1);
    assert!(table.plans[0].contains("insert into stock"));
    assert!(table.plans[0].contains("insert into nd_experiment"));
    assert_eq!(table.pending.get(&Concept::Phenotype), Some(&3));
    assert_eq!(target.snapshot().unwrap(), before);
}

#[test]
fn missing_reference_rows_are_fatal() {
    let temp = tempfile::tempdir().unwrap();
    let target = MemoryTargetStore::new();
    let err = driver(common::source(), &target, temp.path())
        .run(TABLE, &options(600))
        .unwrap_err();
    assert_matches!(err, MigrateError::MissingReference { kind: "db", .. });
    assert!(err.is_configuration());
}

#[test]
fn duplicate_row_ids_abandon_the_page() {
    let temp = tempfile::tempdir().unwrap();
    let source = common::ontology_tables(MemorySourceStore::new()).with_table(
        TABLE,
        &common::COLUMNS,
        vec![
            common::plot(1, "GM1", Some(12), None),
            common::plot(1, "GM2", Some(14), None),
        ],
    );
    let target = common::target();
    let err = driver(source, &target, temp.path())
        .run(TABLE, &options(600))
        .unwrap_err();
    assert_matches!(err, MigrateError::PageFailed { offset: 0, ref source, .. } => {
        assert_matches!(**source, MigrateError::Invariant { .. });
    });
    assert_eq!(count(&target, "phenotype"), 0);
}

#[test]
fn unlisted_table_is_a_configuration_error() {
    let temp = tempfile::tempdir().unwrap();
    let target = common::target();
    let err = driver(common::source(), &target, temp.path())
        .run("VM_OTRA", &options(600))
        .unwrap_err();
    assert_matches!(err, MigrateError::ConfigParse(_));
}

#[test]
fn check_reports_resolved_mappings() {
    let temp = tempfile::tempdir().unwrap();
    let target = common::target();
    let report = driver(common::source(), &target, temp.path()).check(None).unwrap();
    assert_eq!(report.ontology_terms, 2);
    let table = &report.tables[0];
    assert_eq!(table.table, TABLE);
    assert_eq!(table.row_id_columns, vec!["TRIAL".to_string(), "PLOT".to_string()]);
    assert_eq!(table.mappings.get(&Concept::Stock), Some(&2));
    assert_eq!(table.mappings.get(&Concept::Phenotype), Some(&2));
    assert_eq!(count(&target, "stock"), 0);
}

#[test]
fn dashes_inside_key_values_keep_rows_apart() {
    let temp = tempfile::tempdir().unwrap();
    let mut first = common::plot(1, "GM1", Some(12), Some("red"));
    first[0] = Some("T1-2".into());
    first[1] = Some("3".into());
    let mut second = common::plot(2, "GM2", Some(9), Some("green"));
    second[0] = Some("T1".into());
    second[1] = Some("2-3".into());
    let source = common::ontology_tables(MemorySourceStore::new()).with_table(
        TABLE,
        &common::COLUMNS,
        vec![first, second],
    );

    let target = common::target();
    let summary = driver(source, &target, temp.path())
        .run(TABLE, &options(1))
        .unwrap();
    assert_eq!(summary.tables[0].rounds, 2);
    assert_eq!(count(&target, "nd_experiment"), 2);
    assert_eq!(count(&target, "phenotype"), 4);
    assert_eq!(count(&target, "nd_experiment_phenotype"), 4);
}

#[test]
fn a_site_seen_again_with_other_coordinates_is_not_reinserted() {
    let temp = tempfile::tempdir().unwrap();
    let first = common::plot(1, "GM1", Some(12), Some("red"));
    let mut second = common::plot(2, "GM2", Some(9), Some("green"));
    second[6] = None;
    let source = common::ontology_tables(MemorySourceStore::new()).with_table(
        TABLE,
        &common::COLUMNS,
        vec![first, second],
    );

    let target = common::target();
    driver(source, &target, temp.path())
        .run(TABLE, &options(1))
        .unwrap();
    assert_eq!(count(&target, "nd_geolocation"), 1);
    assert_eq!(count(&target, "nd_experiment"), 2);
    let site = &target.rows("nd_geolocation").unwrap()[0];
    assert_eq!(site.get("altitude"), Some(&TargetValue::Float(1.0)));
}

#[test]
fn duplicate_stored_sites_link_to_the_first() {
    let temp = tempfile::tempdir().unwrap();
    let target = common::target();
    let first = target
        .seed("nd_geolocation", TargetRow::new().with("description", "Palmira"))
        .unwrap();
    target
        .seed("nd_geolocation", TargetRow::new().with("description", "Palmira"))
        .unwrap();

    driver(common::source(), &target, temp.path())
        .run(TABLE, &options(600))
        .unwrap();
    assert_eq!(count(&target, "nd_geolocation"), 2);
    let experiments = target.rows("nd_experiment").unwrap();
    assert_eq!(experiments.len(), 3);
    assert!(experiments.iter().all(|row| row.int("nd_geolocation_id") == Some(first)));
}

#[test]
fn a_term_shared_by_sites_and_stock_properties_is_created_once() {
    let temp = tempfile::tempdir().unwrap();
    let target = common::target();
    let config = common::config(temp.path());
    std::fs::write(
        temp.path().join("trans.conf"),
        common::TRANSLATION.replace("stockprop.planting_date", "stockprop.country"),
    )
    .unwrap();
    let driver = MigrationDriver::open(
        Arc::new(common::source()),
        Arc::new(target.clone()),
        config,
    )
    .unwrap();

    for mode in [ExecutionMode::Sequential, ExecutionMode::Concurrent] {
        let options = RunOptions {
            mode,
            ..options(600)
        };
        driver.run(TABLE, &options).unwrap();
    }

    let countries = target
        .rows("cvterm")
        .unwrap()
        .into_iter()
        .filter(|row| row.text("name").as_deref() == Some("country"))
        .count();
    assert_eq!(countries, 1);
    assert_eq!(count(&target, "stockprop"), 2);
    assert_eq!(count(&target, "nd_geolocationprop"), 1);
}

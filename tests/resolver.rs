mod common;

use chado_pheno_migrate::domain::{Concept, SourceRow, TargetRow};
use chado_pheno_migrate::memory::MemorySourceStore;
use chado_pheno_migrate::resolver::{ChangeSetResolver, PendingRow, StockLink, TargetInventory};
use chado_pheno_migrate::store::SourceStore;

use common::TABLE;

fn page(source: &MemorySourceStore) -> Vec<PendingRow> {
    source
        .fetch_page(TABLE, &["PLOT".to_string()], 0, 100)
        .unwrap()
        .into_iter()
        .map(|row: SourceRow| PendingRow {
            row_id: format!("T1-{}", row.text("PLOT").unwrap()),
            row,
        })
        .collect()
}

fn resolver(source: MemorySourceStore, text: &str) -> ChangeSetResolver {
    ChangeSetResolver::new(common::translation(source, text))
}

#[test]
fn resolution_is_idempotent_without_inserts() {
    let source = common::source();
    let rows = page(&source);
    let resolver = resolver(source, common::TRANSLATION);
    let inventory = TargetInventory::new();

    for concept in Concept::ALL {
        let first = resolver.resolve(concept, TABLE, &rows, &inventory).unwrap();
        let second = resolver.resolve(concept, TABLE, &rows, &inventory).unwrap();
        assert_eq!(first, second, "{concept}");
    }
}

#[test]
fn absent_concept_yields_an_empty_change_set() {
    let source = common::source();
    let rows = page(&source);
    let resolver = resolver(
        source,
        "[VM_RESUMEN_EVAL_AVANZADAS]\ngermplasm = stock.name\n",
    );

    let changeset = resolver
        .resolve(Concept::Contact, TABLE, &rows, &TargetInventory::new())
        .unwrap();
    assert!(changeset.is_empty());
    assert!(changeset.mappings.is_empty());
}

#[test]
fn known_stocks_are_linked_not_reinserted() {
    let source = common::source();
    let rows = page(&source);
    let resolver = resolver(source, common::TRANSLATION);
    let inventory = TargetInventory::new().with_table(
        "stock",
        vec![
            TargetRow::new()
                .with("stock_id", 7i64)
                .with("name", "GM1")
                .with("uniquename", "GM1"),
        ],
    );

    let stocks = resolver.resolve(Concept::Stock, TABLE, &rows, &inventory).unwrap();
    assert_eq!(stocks.len(), 1);
    assert_eq!(stocks.stock_links.get("GM1"), Some(&StockLink::Known(7)));
    assert_eq!(
        stocks.stock_links.get("GM2"),
        Some(&StockLink::Pending("GM2".to_string()))
    );

    let phenotypes = resolver.resolve(Concept::Phenotype, TABLE, &rows, &inventory).unwrap();
    assert_eq!(phenotypes.len(), 3);
    assert_eq!(phenotypes.stock_links.get("GM1"), Some(&StockLink::Known(7)));
}

#[test]
fn existing_phenotypes_skip_their_rows() {
    let source = common::source();
    let rows = page(&source);
    let resolver = resolver(source, common::TRANSLATION);
    let inventory = TargetInventory::new().with_table(
        "phenotype",
        vec![TargetRow::new().with("uniquename", "T1-1__color")],
    );

    let changeset = resolver.resolve(Concept::Phenotype, TABLE, &rows, &inventory).unwrap();
    let ids = changeset
        .rows
        .iter()
        .map(|pending| pending.row_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["T1-2", "T1-3"]);
    let traits = changeset
        .traits
        .iter()
        .map(|column| column.trait_name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(traits, vec!["height", "color"]);
}

#[test]
fn mapped_columns_missing_from_rows_are_blacklisted() {
    let source = common::ontology_tables(MemorySourceStore::new()).with_table(
        TABLE,
        &["TRIAL", "PLOT", "GERMPLASM", "SITE"],
        vec![vec![
            Some("T1".into()),
            Some(1i64.into()),
            Some("GM1".into()),
            Some("Palmira".into()),
        ]],
    );
    let rows = page(&source);
    let catalog_text = "[VM_RESUMEN_EVAL_AVANZADAS]\n\
                        germplasm = stock.name\n\
                        site = nd_geolocation.description\n";
    let resolver = resolver(source, catalog_text);

    let changeset = resolver
        .resolve(Concept::Phenotype, TABLE, &rows, &TargetInventory::new())
        .unwrap();
    assert_eq!(changeset.blacklist, vec!["ALTURA".to_string(), "COLOR".to_string()]);
    assert!(changeset.is_empty());
}

#[test]
fn stock_properties_collapse_per_stock_and_type() {
    let source = common::source();
    let rows = page(&source);
    let resolver = resolver(source, common::TRANSLATION);

    let changeset = resolver
        .resolve(Concept::Stockprop, TABLE, &rows, &TargetInventory::new())
        .unwrap();
    let stocks = changeset
        .properties
        .iter()
        .map(|prop| (prop.stock.as_str(), prop.type_name.as_str(), prop.value.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        stocks,
        vec![
            ("GM1", "planting_date", "2015-03-01"),
            ("GM2", "planting_date", "2015-03-01"),
        ]
    );
}

#[test]
fn sites_are_known_by_description() {
    let source = common::source();
    let rows = page(&source);
    let resolver = resolver(source, common::TRANSLATION);
    let inventory = TargetInventory::new().with_table(
        "nd_geolocation",
        vec![
            TargetRow::new()
                .with("nd_geolocation_id", 4i64)
                .with("description", "Palmira")
                .with("altitude", 950.0),
        ],
    );

    let changeset = resolver
        .resolve(Concept::Geolocation, TABLE, &rows, &TargetInventory::new())
        .unwrap();
    assert_eq!(changeset.len(), 1);

    let changeset = resolver
        .resolve(Concept::Geolocation, TABLE, &rows, &inventory)
        .unwrap();
    assert!(changeset.is_empty());
}

#[test]
fn non_trait_phenotype_columns_are_blacklisted() {
    let source = common::source();
    let rows = page(&source);
    let text = format!("{}trial = phenotype.value\n", common::TRANSLATION);
    let resolver = resolver(source, &text);

    let changeset = resolver
        .resolve(Concept::Phenotype, TABLE, &rows, &TargetInventory::new())
        .unwrap();
    assert_eq!(changeset.blacklist, vec!["TRIAL".to_string()]);
    let traits = changeset
        .traits
        .iter()
        .map(|column| column.trait_name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(traits, vec!["height", "color"]);
    assert_eq!(changeset.len(), 3);
}

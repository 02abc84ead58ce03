//! Incremental-update engine: decides which source rows still have to be
//! written for a target concept.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{Concept, Filter, SourceRow, SourceValue, TargetRow, TargetValue};
use crate::error::{MigrateError, preview};
use crate::linker::geolocation::CoordinateNormalizer;
use crate::linker::phenotype::phenotype_uniquename;
use crate::store::TargetConnection;
use crate::translation::{ColumnMapping, TranslationConfig, TranslationMap};

/// One source row of the current page with its synthesized identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRow {
    pub row_id: String,
    pub row: SourceRow,
}

/// How a phenotype row reaches its stock: either the stock already exists
/// in the target, or it is created by this round's stock batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StockLink {
    Known(i64),
    Pending(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraitColumn {
    pub column: String,
    pub trait_name: String,
}

/// A `stockprop` still missing from the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyStub {
    pub stock: String,
    pub type_name: String,
    pub value: String,
}

/// Target rows a resolution compares against, loaded per concept.
#[derive(Debug, Clone, Default)]
pub struct TargetInventory {
    tables: BTreeMap<String, Vec<TargetRow>>,
}

impl TargetInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: &str, rows: Vec<TargetRow>) -> Self {
        self.tables.insert(table.to_string(), rows);
        self
    }

    /// Snapshot of every table `concept` is compared against.
    pub fn load(concept: Concept, conn: &mut dyn TargetConnection) -> Result<Self, MigrateError> {
        let tables: &[&str] = match concept {
            Concept::Stock => &["stock"],
            Concept::Geolocation => &["nd_geolocation"],
            Concept::Contact => &["contact"],
            Concept::Stockprop => &["stock", "stockprop", "cvterm"],
            Concept::Phenotype => &["phenotype", "stock"],
        };
        let mut inventory = Self::new();
        for table in tables {
            let rows = conn.select(table, &Filter::All)?;
            debug!(concept = %concept, table, rows = rows.len(), "loaded target inventory");
            inventory.tables.insert(table.to_string(), rows);
        }
        Ok(inventory)
    }

    pub fn table(&self, table: &str) -> &[TargetRow] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `key_column` → `id_column` over one table; first row wins.
    fn index(&self, table: &str, key_column: &str, id_column: &str) -> HashMap<String, i64> {
        let mut index = HashMap::new();
        for row in self.table(table) {
            if let (Some(key), Some(id)) = (row.text(key_column), row.int(id_column)) {
                index.entry(key).or_insert(id);
            }
        }
        index
    }
}

/// Rows of one page that are not yet represented in the target for one
/// concept, plus the join keys its linker needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub concept: Concept,
    pub table: String,
    pub mappings: Vec<ColumnMapping>,
    pub rows: Vec<PendingRow>,
    pub stock_column: Option<String>,
    pub site_column: Option<String>,
    pub stock_links: BTreeMap<String, StockLink>,
    pub traits: Vec<TraitColumn>,
    pub properties: Vec<PropertyStub>,
    /// Mapped columns the source rows do not have.
    pub blacklist: Vec<String>,
    translation: Option<Arc<TranslationMap>>,
}

impl ChangeSet {
    pub fn empty(concept: Concept, table: &str) -> Self {
        Self {
            concept,
            table: table.to_string(),
            mappings: Vec::new(),
            rows: Vec::new(),
            stock_column: None,
            site_column: None,
            stock_links: BTreeMap::new(),
            traits: Vec::new(),
            properties: Vec::new(),
            blacklist: Vec::new(),
            translation: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.properties.is_empty()
    }

    pub fn len(&self) -> usize {
        match self.concept {
            Concept::Stockprop => self.properties.len(),
            _ => self.rows.len(),
        }
    }

    pub fn translation(&self) -> Option<&TranslationMap> {
        self.translation.as_deref()
    }

    /// Active source column feeding `table.attribute`.
    pub fn column_for(&self, table: &str, attribute: &str) -> Option<&str> {
        self.mappings
            .iter()
            .find(|mapping| mapping.target.table == table && mapping.target.attribute == attribute)
            .map(|mapping| mapping.column.as_str())
    }

    pub fn mappings_for(&self, table: &str) -> impl Iterator<Item = &ColumnMapping> {
        self.mappings
            .iter()
            .filter(move |mapping| mapping.target.table == table)
    }

    pub fn value<'a>(&self, row: &'a SourceRow, table: &str, attribute: &str) -> Option<&'a SourceValue> {
        self.column_for(table, attribute).and_then(|column| row.get(column))
    }

    pub fn constant(&self, table: &str, attribute: &str) -> Option<&str> {
        self.translation
            .as_deref()
            .and_then(|map| map.constant_value(table, attribute))
    }
}

pub struct ChangeSetResolver {
    translation: Arc<TranslationConfig>,
}

impl ChangeSetResolver {
    pub fn new(translation: Arc<TranslationConfig>) -> Self {
        Self { translation }
    }

    pub fn resolve(
        &self,
        concept: Concept,
        table: &str,
        rows: &[PendingRow],
        inventory: &TargetInventory,
    ) -> Result<ChangeSet, MigrateError> {
        let map = self.translation.translation_for(table)?;
        let mut changeset = ChangeSet::empty(concept, table);

        let mappings: Vec<ColumnMapping> = map.for_concept(concept).into_iter().cloned().collect();
        if mappings.is_empty() && map.constants_for(concept).is_empty() {
            info!(table, concept = %concept, "no translation found, not uploading any related data");
            return Ok(changeset);
        }

        changeset.translation = Some(map.clone());
        changeset.stock_column = map.column_for("stock", "name").map(str::to_string);
        changeset.site_column = map
            .column_for("nd_geolocation", "description")
            .map(str::to_string);

        let (active, blacklist) = split_blacklist(mappings, rows);
        if !blacklist.is_empty() {
            warn!(
                table,
                concept = %concept,
                columns = %preview(&blacklist.join(", ")),
                "mapped columns missing from source, consider fixing these entries in the config or ontology"
            );
        }
        changeset.mappings = active;
        changeset.blacklist = blacklist;

        if changeset.mappings.is_empty() {
            return Ok(changeset);
        }

        match concept {
            Concept::Stock => self.resolve_stocks(&mut changeset, rows, inventory)?,
            Concept::Stockprop => self.resolve_stockprops(&mut changeset, rows, inventory)?,
            Concept::Phenotype => self.resolve_phenotypes(&mut changeset, rows, inventory)?,
            Concept::Geolocation | Concept::Contact => {
                self.resolve_by_attributes(&mut changeset, rows, inventory)?
            }
        }

        debug!(table, concept = %concept, new = changeset.len(), "change set resolved");
        Ok(changeset)
    }

    fn resolve_stocks(
        &self,
        changeset: &mut ChangeSet,
        rows: &[PendingRow],
        inventory: &TargetInventory,
    ) -> Result<(), MigrateError> {
        let Some(name_column) = changeset.column_for("stock", "name").map(str::to_string) else {
            warn!(table = %changeset.table, "stock.name is not mapped, not uploading stocks");
            changeset.mappings.clear();
            return Ok(());
        };
        let uniquename_column = changeset
            .column_for("stock", "uniquename")
            .unwrap_or(&name_column)
            .to_string();

        let known = inventory.index("stock", "uniquename", "stock_id");
        for pending in rows {
            let Some(name) = pending.row.text(&name_column) else {
                continue;
            };
            let uniquename = pending.row.text(&uniquename_column).unwrap_or_else(|| name.clone());
            if let Some(id) = known.get(&uniquename) {
                changeset
                    .stock_links
                    .entry(name)
                    .or_insert(StockLink::Known(*id));
                continue;
            }
            // Same-name rows later in the page resolve to the stock that is
            // about to be inserted.
            changeset
                .stock_links
                .entry(name.clone())
                .or_insert(StockLink::Pending(name));
            changeset.rows.push(pending.clone());
        }
        Ok(())
    }

    fn resolve_stockprops(
        &self,
        changeset: &mut ChangeSet,
        rows: &[PendingRow],
        inventory: &TargetInventory,
    ) -> Result<(), MigrateError> {
        let Some(stock_column) = changeset.stock_column.clone() else {
            warn!(table = %changeset.table, "stock.name is not mapped, not uploading stockprops");
            changeset.mappings.clear();
            return Ok(());
        };

        let stock_ids = inventory.index("stock", "name", "stock_id");
        let type_ids = inventory.index("cvterm", "name", "cvterm_id");
        let existing: HashSet<(i64, i64)> = inventory
            .table("stockprop")
            .iter()
            .filter_map(|row| Some((row.int("stock_id")?, row.int("type_id")?)))
            .collect();

        let properties = changeset
            .mappings_for("stockprop")
            .map(|mapping| (mapping.column.clone(), mapping.target.attribute.clone()))
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();
        let mut duplicates = 0usize;
        for pending in rows {
            let Some(stock) = pending.row.text(&stock_column) else {
                continue;
            };
            let mut row_is_new = false;
            for (column, type_name) in &properties {
                let Some(value) = pending.row.text(column) else {
                    continue;
                };
                let present = match (stock_ids.get(&stock), type_ids.get(type_name)) {
                    (Some(stock_id), Some(type_id)) => existing.contains(&(*stock_id, *type_id)),
                    _ => false,
                };
                if present {
                    continue;
                }
                if !seen.insert((stock.clone(), type_name.clone())) {
                    duplicates += 1;
                    continue;
                }
                row_is_new = true;
                changeset.properties.push(PropertyStub {
                    stock: stock.clone(),
                    type_name: type_name.clone(),
                    value,
                });
            }
            if row_is_new {
                changeset.rows.push(pending.clone());
            }
        }
        if duplicates > 0 {
            debug!(
                table = %changeset.table,
                duplicates,
                "collapsed repeated stock properties, keeping the first value"
            );
        }
        Ok(())
    }

    fn resolve_phenotypes(
        &self,
        changeset: &mut ChangeSet,
        rows: &[PendingRow],
        inventory: &TargetInventory,
    ) -> Result<(), MigrateError> {
        let ontology = self.translation.ontology();
        let mut unknown_traits = Vec::new();
        let value_mappings = changeset
            .mappings_for("phenotype")
            .filter(|mapping| mapping.target.attribute == "value")
            .cloned()
            .collect::<Vec<_>>();
        for mapping in value_mappings {
            match ontology.trait_name(&mapping.column) {
                Some(trait_name) => changeset.traits.push(TraitColumn {
                    trait_name: trait_name.to_string(),
                    column: mapping.column,
                }),
                None => unknown_traits.push(mapping.column),
            }
        }
        if !unknown_traits.is_empty() {
            warn!(
                table = %changeset.table,
                columns = %preview(&unknown_traits.join(", ")),
                "phenotype columns without ontology trait, consider fixing these entries in the config or ontology"
            );
            changeset.blacklist.extend(unknown_traits);
        }
        if changeset.traits.is_empty() {
            info!(table = %changeset.table, "no recognized trait columns, not uploading phenotypes");
            return Ok(());
        }
        let Some(site_column) = changeset.site_column.clone() else {
            warn!(
                table = %changeset.table,
                "nd_geolocation.description is not mapped, not uploading phenotypes"
            );
            changeset.traits.clear();
            return Ok(());
        };

        let existing: HashSet<String> = inventory
            .table("phenotype")
            .iter()
            .filter_map(|row| row.text("uniquename"))
            .collect();
        let stocks = inventory.index("stock", "name", "stock_id");

        let mut row_ids = HashSet::new();
        let mut without_site = 0usize;
        for pending in rows {
            if !row_ids.insert(pending.row_id.as_str()) {
                return Err(MigrateError::invariant(
                    "phenotype",
                    format!("row id {} is not unique in this page", preview(&pending.row_id)),
                ));
            }
            let uniquenames = changeset
                .traits
                .iter()
                .filter(|column| pending.row.get(&column.column).is_some())
                .map(|column| phenotype_uniquename(&pending.row_id, &column.trait_name))
                .collect::<Vec<_>>();
            if uniquenames.is_empty() {
                continue;
            }
            if uniquenames.iter().any(|name| existing.contains(name)) {
                continue;
            }
            if pending.row.get(&site_column).is_none() {
                without_site += 1;
                continue;
            }
            if let Some(stock_column) = &changeset.stock_column {
                if let Some(name) = pending.row.text(stock_column) {
                    let link = match stocks.get(&name) {
                        Some(id) => StockLink::Known(*id),
                        None => StockLink::Pending(name.clone()),
                    };
                    changeset.stock_links.entry(name).or_insert(link);
                }
            }
            changeset.rows.push(pending.clone());
        }
        if without_site > 0 {
            warn!(
                table = %changeset.table,
                skipped = without_site,
                "phenotype rows without site skipped"
            );
        }
        Ok(())
    }

    /// Generic rule: a row is known when some target row agrees on every
    /// mapped plain attribute of the concept's table. Sites are the
    /// exception: their description alone identifies them, and a stored site
    /// whose other attributes differ is kept as it is.
    fn resolve_by_attributes(
        &self,
        changeset: &mut ChangeSet,
        rows: &[PendingRow],
        inventory: &TargetInventory,
    ) -> Result<(), MigrateError> {
        let target_table = changeset.concept.target_table();
        let compared = changeset
            .mappings_for(target_table)
            .filter(|mapping| !mapping.target.attribute.ends_with("_id"))
            .map(|mapping| (mapping.column.clone(), mapping.target.attribute.clone()))
            .collect::<Vec<_>>();
        if compared.is_empty() {
            debug!(table = %changeset.table, concept = %changeset.concept, "nothing to compare");
            changeset.mappings.clear();
            return Ok(());
        }
        let identity = match changeset.concept {
            Concept::Geolocation => compared
                .iter()
                .position(|(_, attribute)| attribute == "description"),
            _ => None,
        };

        let normalizer = CoordinateNormalizer::new()?;
        let current = inventory.table(target_table);
        let mut seen: HashSet<Vec<Option<String>>> = HashSet::new();
        let mut ambiguous = 0usize;
        let mut drifted = 0usize;

        for pending in rows {
            let projected = compared
                .iter()
                .map(|(column, _)| pending.row.text(column))
                .collect::<Vec<_>>();
            let key = match identity {
                Some(index) if projected[index].is_none() => continue,
                Some(index) => vec![projected[index].clone()],
                None if projected.iter().all(Option::is_none) => continue,
                None => projected.clone(),
            };
            if !seen.insert(key) {
                continue;
            }

            let agrees = |target: &TargetRow, index: usize| {
                let attribute = compared[index].1.as_str();
                attribute_matches(&normalizer, attribute, projected[index].as_deref(), target.get(attribute))
            };
            let matching = current
                .iter()
                .filter(|target| match identity {
                    Some(index) => agrees(target, index),
                    None => (0..compared.len()).all(|index| agrees(target, index)),
                })
                .collect::<Vec<_>>();
            if matching.len() > 1 {
                ambiguous += 1;
            }
            match matching.first() {
                None => changeset.rows.push(pending.clone()),
                Some(first) => {
                    if !(0..compared.len()).all(|index| agrees(first, index)) {
                        drifted += 1;
                    }
                }
            }
        }
        if ambiguous > 0 {
            warn!(
                table = %changeset.table,
                concept = %changeset.concept,
                rows = ambiguous,
                "several target rows match one source row, using the first match"
            );
        }
        if drifted > 0 {
            warn!(
                table = %changeset.table,
                sites = drifted,
                "stored sites differ from the source in coordinates, keeping the stored values"
            );
        }
        Ok(())
    }
}

fn split_blacklist(
    mappings: Vec<ColumnMapping>,
    rows: &[PendingRow],
) -> (Vec<ColumnMapping>, Vec<String>) {
    let Some(first) = rows.first() else {
        return (mappings, Vec::new());
    };
    let mut blacklist = Vec::new();
    let active = mappings
        .into_iter()
        .filter(|mapping| {
            let present = first.row.has_column(&mapping.column);
            if !present && !blacklist.contains(&mapping.column) {
                blacklist.push(mapping.column.clone());
            }
            present
        })
        .collect();
    (active, blacklist)
}

fn attribute_matches(
    normalizer: &CoordinateNormalizer,
    attribute: &str,
    source: Option<&str>,
    target: Option<&TargetValue>,
) -> bool {
    let target = match target {
        None | Some(TargetValue::Null) => None,
        Some(value) => Some(value),
    };
    // Unparseable coordinates were stored as null.
    if CoordinateNormalizer::is_coordinate(attribute) {
        let source = source.and_then(|raw| normalizer.parse(raw));
        return source == target.and_then(TargetValue::as_f64);
    }
    match (source, target) {
        (None, None) => true,
        (None, Some(_)) | (Some(_), None) => false,
        (Some(source), Some(target)) => source == target.to_text(),
    }
}

use regex::Regex;
use tracing::{info, warn};

use super::{EntityLinker, term_ids, unique_by};
use crate::batch::{InsertTask, Joined, RunStorage, Slot, Step};
use crate::domain::{TargetRow, TargetValue};
use crate::error::{MigrateError, preview};
use crate::resolver::ChangeSet;
use crate::store::TargetConnection;

/// Property terms every site batch makes sure of.
pub const SITE_TERMS: [&str; 6] = ["type", "country", "state", "region", "address", "site_code"];

const COORDINATES: [&str; 3] = ["latitude", "longitude", "altitude"];

/// Rewrites legacy coordinate strings into signed decimals.
///
/// Rules apply in order: leading whitespace and zeros are stripped, a
/// trailing `N`/`E` becomes a `+` prefix, a trailing `S`/`W` becomes a `-`
/// prefix, and an empty result or a bare sign becomes `0`.
pub struct CoordinateNormalizer {
    leading: Regex,
    north_east: Regex,
    south_west: Regex,
    bare: Regex,
}

impl CoordinateNormalizer {
    pub fn new() -> Result<Self, MigrateError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|err| MigrateError::invariant("geolocation", err.to_string()))
        };
        Ok(Self {
            leading: compile(r"^[\s0]+")?,
            north_east: compile(r"^(.*)[NE]$")?,
            south_west: compile(r"^(.*)[SW]$")?,
            bare: compile(r"^[+-]?$")?,
        })
    }

    pub fn is_coordinate(attribute: &str) -> bool {
        COORDINATES.contains(&attribute)
    }

    pub fn normalize(&self, raw: &str) -> String {
        let value = self.leading.replace(raw, "");
        let value = self.north_east.replace(&value, "+${1}");
        let value = self.south_west.replace(&value, "-${1}");
        if self.bare.is_match(&value) {
            return "0".to_string();
        }
        value.into_owned()
    }

    pub fn parse(&self, raw: &str) -> Option<f64> {
        self.normalize(raw).parse().ok()
    }
}

pub fn normalize_coord(raw: &str) -> Result<String, MigrateError> {
    Ok(CoordinateNormalizer::new()?.normalize(raw))
}

#[derive(Debug, Clone, PartialEq)]
struct Site {
    description: String,
    coordinates: [TargetValue; 3],
    properties: Vec<(String, String)>,
}

impl EntityLinker {
    pub fn build_geolocation(
        &self,
        conn: &mut dyn TargetConnection,
        changeset: &ChangeSet,
    ) -> Result<Step, MigrateError> {
        let Some(description_column) = changeset.column_for("nd_geolocation", "description") else {
            warn!(table = %changeset.table, "nd_geolocation.description is not mapped, not uploading sites");
            return Ok(Step::noop("nd_geolocation: description not mapped"));
        };
        let normalizer = CoordinateNormalizer::new()?;
        let property_columns = changeset
            .mappings_for("nd_geolocationprop")
            .map(|mapping| (mapping.column.clone(), mapping.target.attribute.clone()))
            .collect::<Vec<_>>();

        let mut failures = 0usize;
        let mut sites = Vec::new();
        for pending in &changeset.rows {
            let Some(description) = pending.row.text(description_column) else {
                continue;
            };
            let coordinates = COORDINATES.map(|attribute| {
                let Some(column) = changeset.column_for("nd_geolocation", attribute) else {
                    return TargetValue::Null;
                };
                let parsed = pending
                    .row
                    .text(column)
                    .and_then(|raw| normalizer.parse(&raw));
                match parsed {
                    Some(value) => TargetValue::Float(value),
                    None => {
                        failures += 1;
                        TargetValue::Null
                    }
                }
            });
            let properties = property_columns
                .iter()
                .filter_map(|(column, type_name)| {
                    Some((type_name.clone(), pending.row.text(column)?))
                })
                .collect();
            sites.push(Site {
                description,
                coordinates,
                properties,
            });
        }
        if failures > 0 {
            warn!(
                table = %changeset.table,
                failures,
                "missing or malformed coordinates stored as null"
            );
        }

        let sites = unique_by(sites, |site| site.description.clone());
        info!(table = %changeset.table, sites = sites.len(), "site batch");
        if sites.is_empty() {
            return Ok(Step::noop("nd_geolocation: no named sites"));
        }

        let mut terms = SITE_TERMS.map(str::to_string).to_vec();
        terms.extend(property_columns.iter().map(|(_, type_name)| type_name.clone()));
        self.request_terms(conn, &terms, "nd_geolocation")?;

        let keys = sites.iter().map(|site| site.description.clone()).collect::<Vec<_>>();
        let rows = sites
            .iter()
            .map(|site| {
                let mut row = vec![TargetValue::Text(site.description.clone())];
                row.extend(site.coordinates.iter().cloned());
                row
            })
            .collect();
        let insert = InsertTask::insert(
            "nd_geolocation",
            "nd_geolocation",
            &["description", "latitude", "longitude", "altitude"],
            rows,
        )
        .capturing(Slot::Geolocations, keys);

        let mut steps = vec![insert.into()];
        let properties = sites
            .into_iter()
            .flat_map(|site| {
                let description = site.description;
                site.properties
                    .into_iter()
                    .map(move |(type_name, value)| (description.clone(), type_name, value))
            })
            .collect::<Vec<_>>();
        if !properties.is_empty() {
            let types = unique_by(
                properties.iter().map(|(_, type_name, _)| type_name.clone()),
                |name| name.clone(),
            );
            let filter = self.term_filter(types.clone());
            let join = move |fetched: Vec<TargetRow>, storage: &RunStorage| -> Result<Joined, MigrateError> {
                let type_ids = term_ids(&fetched, &types, "nd_geolocationprop")?;
                let site_ids = storage.ids(&Slot::Geolocations)?;
                let mut rows = Vec::with_capacity(properties.len());
                for (description, type_name, value) in properties {
                    let site_id = site_ids.get(&description).ok_or_else(|| {
                        MigrateError::invariant(
                            "nd_geolocationprop",
                            format!("site {} was not inserted", preview(&description)),
                        )
                    })?;
                    let type_id = type_ids.get(&type_name).copied().unwrap_or_default();
                    rows.push(vec![
                        TargetValue::Integer(*site_id),
                        TargetValue::Integer(type_id),
                        TargetValue::Text(value),
                        TargetValue::Integer(0),
                    ]);
                }
                Ok(Joined {
                    rows,
                    keys: Vec::new(),
                })
            };
            steps.push(
                InsertTask::fetch_join_insert(
                    "nd_geolocationprop",
                    "cvterm",
                    filter,
                    "nd_geolocationprop",
                    &["nd_geolocation_id", "type_id", "value", "rank"],
                    join,
                )
                .into(),
            );
        }

        Ok(Step::Sequence(steps))
    }
}

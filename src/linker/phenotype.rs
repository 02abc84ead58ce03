use std::collections::HashMap;

use tracing::{info, warn};

use super::cvterm::TermRef;
use super::{EntityLinker, term_ids, unique_by};
use crate::batch::{InsertTask, Joined, RunStorage, Slot, Step, TaskContext};
use crate::domain::{Filter, TargetRow, TargetValue};
use crate::error::{MigrateError, preview};
use crate::resolver::{ChangeSet, StockLink};
use crate::store::TargetConnection;

/// Experiment type of every phenotyping experiment and its stock links.
pub const EXPERIMENT_TYPE: &str = "phenotyping";

/// Uniquename of one observation: the row id, with `\` and `_` escaped,
/// followed by `__` and the trait name. Distinct inputs never collide.
pub fn phenotype_uniquename(row_id: &str, trait_name: &str) -> String {
    let mut escaped = String::with_capacity(row_id.len() + trait_name.len() + 2);
    for ch in row_id.chars() {
        if ch == '\\' || ch == '_' {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    format!("{escaped}__{trait_name}")
}

/// One phenotype value of one source row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub row_id: String,
    pub uniquename: String,
    pub trait_name: String,
    pub value: String,
}

/// Pairs every inserted phenotype with the experiment of its row.
///
/// Observations are grouped by row in insertion order, so the experiment
/// pointer only moves forward when the row id changes.
pub fn lockstep_links(
    observations: &[Observation],
    phenotypes: &[(String, i64)],
    experiments: &[(String, i64)],
) -> Result<Vec<(i64, i64)>, MigrateError> {
    if observations.len() != phenotypes.len() {
        return Err(MigrateError::invariant(
            "phenotype",
            format!(
                "{} observations but {} inserted phenotypes",
                observations.len(),
                phenotypes.len()
            ),
        ));
    }

    let mut links = Vec::with_capacity(observations.len());
    let mut experiment = 0usize;
    for (index, (observation, (uniquename, phenotype_id))) in
        observations.iter().zip(phenotypes).enumerate()
    {
        if index > 0 && observations[index - 1].row_id != observation.row_id {
            experiment += 1;
        }
        if *uniquename != observation.uniquename {
            return Err(MigrateError::invariant(
                "phenotype",
                format!(
                    "phenotype {} inserted where {} was expected",
                    preview(uniquename),
                    preview(&observation.uniquename)
                ),
            ));
        }
        let (row_id, experiment_id) = experiments.get(experiment).ok_or_else(|| {
            MigrateError::invariant(
                "phenotype",
                format!("no experiment left for row {}", preview(&observation.row_id)),
            )
        })?;
        if *row_id != observation.row_id {
            return Err(MigrateError::invariant(
                "phenotype",
                format!(
                    "row {} lined up with experiment of row {}",
                    preview(&observation.row_id),
                    preview(row_id)
                ),
            ));
        }
        links.push((*experiment_id, *phenotype_id));
    }

    let used = if observations.is_empty() { 0 } else { experiment + 1 };
    if used != experiments.len() {
        return Err(MigrateError::invariant(
            "phenotype",
            format!("{used} experiments linked but {} inserted", experiments.len()),
        ));
    }
    Ok(links)
}

impl EntityLinker {
    /// Phenotype values, one experiment per row, and the links between
    /// experiments, stocks, phenotypes and the dataset.
    pub fn build_phenotype(
        &self,
        conn: &mut dyn TargetConnection,
        changeset: &ChangeSet,
    ) -> Result<Step, MigrateError> {
        let Some(site_column) = changeset.site_column.as_deref() else {
            return Ok(Step::noop("phenotype: no site column"));
        };

        let mut observations = Vec::new();
        let mut sites = Vec::with_capacity(changeset.rows.len());
        let mut stock_links = HashMap::new();
        for pending in &changeset.rows {
            let Some(site) = pending.row.text(site_column) else {
                continue;
            };
            let before = observations.len();
            for column in &changeset.traits {
                let Some(value) = pending.row.text(&column.column) else {
                    continue;
                };
                observations.push(Observation {
                    row_id: pending.row_id.clone(),
                    uniquename: phenotype_uniquename(&pending.row_id, &column.trait_name),
                    trait_name: column.trait_name.clone(),
                    value,
                });
            }
            if observations.len() == before {
                continue;
            }
            sites.push((pending.row_id.clone(), site));
            let link = changeset
                .stock_column
                .as_deref()
                .and_then(|column| pending.row.text(column))
                .and_then(|name| changeset.stock_links.get(&name).cloned());
            if let Some(link) = link {
                stock_links.insert(pending.row_id.clone(), link);
            }
        }
        info!(
            table = %changeset.table,
            rows = sites.len(),
            phenotypes = observations.len(),
            "phenotype batch"
        );
        if observations.is_empty() {
            return Ok(Step::noop("phenotype: no values"));
        }

        let traits = unique_by(
            observations.iter().map(|observation| observation.trait_name.clone()),
            |name| name.clone(),
        );
        self.request_terms(conn, &traits, "phenotype")?;
        let values = self.phenotype_task(&traits, observations.clone());

        let experiment_type = self.build_term(conn, EXPERIMENT_TYPE, "nd_experiment")?;
        let experiments = experiment_task(sites, experiment_type.clone());

        let project_id = self.refs.project_id;
        let links = Step::Parallel(vec![
            stock_link_task(stock_links, experiment_type).into(),
            phenotype_link_task(observations).into(),
            project_link_task(project_id).into(),
        ]);

        Ok(Step::Sequence(vec![values.into(), experiments.into(), links]))
    }

    fn phenotype_task(&self, traits: &[String], observations: Vec<Observation>) -> InsertTask {
        let wanted = traits.to_vec();
        InsertTask::fetch_join_insert(
            "phenotype",
            "cvterm",
            self.term_filter(wanted.clone()),
            "phenotype",
            &["uniquename", "attr_id", "value"],
            move |fetched: Vec<TargetRow>, _storage: &RunStorage| -> Result<Joined, MigrateError> {
                let attr_ids = term_ids(&fetched, &wanted, "phenotype")?;
                let mut joined = Joined::default();
                for observation in observations {
                    let attr_id = attr_ids.get(&observation.trait_name).copied().unwrap_or_default();
                    joined.rows.push(vec![
                        TargetValue::Text(observation.uniquename.clone()),
                        TargetValue::Integer(attr_id),
                        TargetValue::Text(observation.value),
                    ]);
                    joined.keys.push(observation.uniquename);
                }
                Ok(joined)
            },
        )
        .capturing(Slot::Phenotypes, Vec::new())
    }
}

/// One experiment per row, keyed by row id, placed at the row's site.
fn experiment_task(sites: Vec<(String, String)>, experiment_type: TermRef) -> InsertTask {
    let descriptions = unique_by(sites.iter().map(|(_, site)| site.clone()), |site| site.clone());
    InsertTask::fetch_join_insert(
        "nd_experiment",
        "nd_geolocation",
        Filter::any_of("description", descriptions),
        "nd_experiment",
        &["nd_geolocation_id", "type_id"],
        move |fetched: Vec<TargetRow>, storage: &RunStorage| -> Result<Joined, MigrateError> {
            let type_id = experiment_type.resolve(storage)?;
            let site_ids = site_ids_by_description(&fetched);
            let mut joined = Joined::default();
            for (row_id, site) in sites {
                let site_id = site_ids.get(&site).ok_or_else(|| {
                    MigrateError::invariant(
                        "nd_experiment",
                        format!("site {} does not exist", preview(&site)),
                    )
                })?;
                joined
                    .rows
                    .push(vec![TargetValue::Integer(*site_id), TargetValue::Integer(type_id)]);
                joined.keys.push(row_id);
            }
            Ok(joined)
        },
    )
    .capturing(Slot::Experiments, Vec::new())
}

/// `description → nd_geolocation_id`. Sites sharing a description resolve
/// to the lowest id.
fn site_ids_by_description(fetched: &[TargetRow]) -> HashMap<String, i64> {
    let mut ids: HashMap<String, i64> = HashMap::new();
    let mut repeated = Vec::new();
    for row in fetched {
        let (Some(description), Some(id)) = (row.text("description"), row.int("nd_geolocation_id")) else {
            continue;
        };
        match ids.get_mut(&description) {
            Some(first) => {
                *first = (*first).min(id);
                repeated.push(description);
            }
            None => {
                ids.insert(description, id);
            }
        }
    }
    if !repeated.is_empty() {
        warn!(
            sites = %preview(&repeated.join(", ")),
            "several sites share a description, linking experiments to the first"
        );
    }
    ids
}

fn stock_link_task(
    links: HashMap<String, StockLink>,
    experiment_type: TermRef,
) -> InsertTask {
    InsertTask::custom(
        "nd_experiment_stock",
        move |ctx: &mut TaskContext<'_>| -> Result<usize, MigrateError> {
            let experiments = ctx.storage.get(&Slot::Experiments)?;
            let type_id = experiment_type.resolve(ctx.storage)?;
            let inserted = if links.values().any(|link| matches!(link, StockLink::Pending(_))) {
                ctx.storage.ids(&Slot::Stocks)?
            } else {
                HashMap::new()
            };

            let mut rows = Vec::with_capacity(experiments.len());
            for (row_id, experiment_id) in experiments.iter() {
                let stock_id = match links.get(row_id) {
                    None => continue,
                    Some(StockLink::Known(id)) => *id,
                    Some(StockLink::Pending(name)) => *inserted.get(name).ok_or_else(|| {
                        MigrateError::invariant(
                            "nd_experiment_stock",
                            format!("stock {} was neither known nor inserted", preview(name)),
                        )
                    })?,
                };
                rows.push(vec![
                    TargetValue::Integer(*experiment_id),
                    TargetValue::Integer(stock_id),
                    TargetValue::Integer(type_id),
                ]);
            }
            let count = rows.len();
            ctx.conn.insert(
                "nd_experiment_stock",
                &["nd_experiment_id", "stock_id", "type_id"],
                rows,
                None,
            )?;
            Ok(count)
        },
    )
}

fn phenotype_link_task(observations: Vec<Observation>) -> InsertTask {
    InsertTask::custom(
        "nd_experiment_phenotype",
        move |ctx: &mut TaskContext<'_>| -> Result<usize, MigrateError> {
            let phenotypes = ctx.storage.get(&Slot::Phenotypes)?;
            let experiments = ctx.storage.get(&Slot::Experiments)?;
            let rows = lockstep_links(&observations, &phenotypes, &experiments)?
                .into_iter()
                .map(|(experiment_id, phenotype_id)| {
                    vec![TargetValue::Integer(experiment_id), TargetValue::Integer(phenotype_id)]
                })
                .collect::<Vec<_>>();
            let count = rows.len();
            ctx.conn.insert(
                "nd_experiment_phenotype",
                &["nd_experiment_id", "phenotype_id"],
                rows,
                None,
            )?;
            Ok(count)
        },
    )
}

fn project_link_task(project_id: i64) -> InsertTask {
    InsertTask::custom(
        "nd_experiment_project",
        move |ctx: &mut TaskContext<'_>| -> Result<usize, MigrateError> {
            let rows = ctx
                .storage
                .get(&Slot::Experiments)?
                .iter()
                .map(|(_, experiment_id)| {
                    vec![TargetValue::Integer(*experiment_id), TargetValue::Integer(project_id)]
                })
                .collect::<Vec<_>>();
            let count = rows.len();
            ctx.conn.insert(
                "nd_experiment_project",
                &["nd_experiment_id", "project_id"],
                rows,
                None,
            )?;
            Ok(count)
        },
    )
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn observation(row_id: &str, trait_name: &str) -> Observation {
        Observation {
            row_id: row_id.to_string(),
            uniquename: phenotype_uniquename(row_id, trait_name),
            trait_name: trait_name.to_string(),
            value: "1".to_string(),
        }
    }

    fn ids(entries: &[(&str, i64)]) -> Vec<(String, i64)> {
        entries.iter().map(|(key, id)| (key.to_string(), *id)).collect()
    }

    #[test]
    fn uniquename_joins_row_and_trait() {
        assert_eq!(phenotype_uniquename("GY1", "height"), "GY1__height");
        assert_eq!(phenotype_uniquename("2015-A-3", "color"), "2015-A-3__color");
    }

    #[test]
    fn uniquenames_do_not_collide_across_separators() {
        let a = phenotype_uniquename("a_", "b");
        let b = phenotype_uniquename("a", "_b");
        let c = phenotype_uniquename("a", "b");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
        assert_ne!(phenotype_uniquename("a\\", "_b"), phenotype_uniquename("a", "\\_b"));
    }

    #[test]
    fn repeated_site_descriptions_resolve_to_the_lowest_id() {
        let site = |id: i64, description: &str| {
            TargetRow::new()
                .with("nd_geolocation_id", id)
                .with("description", description)
        };
        let ids = site_ids_by_description(&[site(9, "Palmira"), site(3, "Palmira"), site(5, "Quilichao")]);
        assert_eq!(ids.get("Palmira"), Some(&3));
        assert_eq!(ids.get("Quilichao"), Some(&5));
    }

    #[test]
    fn lockstep_advances_on_row_change() {
        let observations = vec![
            observation("GY1", "height"),
            observation("GY1", "color"),
            observation("GY2", "height"),
        ];
        let phenotypes = ids(&[
            ("GY1__height", 10),
            ("GY1__color", 11),
            ("GY2__height", 12),
        ]);
        let experiments = ids(&[("GY1", 100), ("GY2", 101)]);
        let links = lockstep_links(&observations, &phenotypes, &experiments).unwrap();
        assert_eq!(links, vec![(100, 10), (100, 11), (101, 12)]);
    }

    #[test]
    fn lockstep_rejects_misaligned_experiments() {
        let observations = vec![observation("GY1", "height"), observation("GY2", "height")];
        let phenotypes = ids(&[("GY1__height", 10), ("GY2__height", 11)]);
        let experiments = ids(&[("GY2", 100), ("GY1", 101)]);
        assert_matches!(
            lockstep_links(&observations, &phenotypes, &experiments),
            Err(MigrateError::Invariant { .. })
        );
    }

    #[test]
    fn lockstep_rejects_leftover_experiments() {
        let observations = vec![observation("GY1", "height")];
        let phenotypes = ids(&[("GY1__height", 10)]);
        let experiments = ids(&[("GY1", 100), ("GY2", 101)]);
        assert_matches!(
            lockstep_links(&observations, &phenotypes, &experiments),
            Err(MigrateError::Invariant { .. })
        );
    }
}

use tracing::{debug, info};

use super::{EntityLinker, term_ids, unique_by};
use crate::batch::{InsertTask, Joined, RunStorage, Slot, Step};
use crate::domain::{Filter, TargetRow, TargetValue};
use crate::error::MigrateError;
use crate::resolver::ChangeSet;
use crate::store::TargetConnection;

/// `(name, uniquename)` pairs with repeated names dropped first, then
/// repeated uniquenames.
pub fn dedupe_stocks(pairs: Vec<(String, String)>) -> Vec<(String, String)> {
    let by_name = unique_by(pairs, |(name, _)| name.clone());
    unique_by(by_name, |(_, uniquename)| uniquename.clone())
}

impl EntityLinker {
    pub fn build_stock(
        &self,
        conn: &mut dyn TargetConnection,
        changeset: &ChangeSet,
    ) -> Result<Step, MigrateError> {
        let Some(name_column) = changeset.column_for("stock", "name") else {
            return Ok(Step::noop("stock: stock.name not mapped"));
        };
        let uniquename_column = changeset
            .column_for("stock", "uniquename")
            .unwrap_or(name_column);

        let pairs = changeset
            .rows
            .iter()
            .filter_map(|pending| {
                let name = pending.row.text(name_column)?;
                let uniquename = pending
                    .row
                    .text(uniquename_column)
                    .unwrap_or_else(|| name.clone());
                Some((name, uniquename))
            })
            .collect::<Vec<_>>();
        let total = pairs.len();
        let stocks = dedupe_stocks(pairs);
        if stocks.len() < total {
            debug!(
                table = %changeset.table,
                dropped = total - stocks.len(),
                "collapsed stocks sharing a name or uniquename"
            );
        }
        info!(table = %changeset.table, stocks = stocks.len(), "stock batch");
        if stocks.is_empty() {
            return Ok(Step::noop("stock: no named rows"));
        }

        let organism_id = match changeset.constant("stock", "organism_id") {
            Some(common_name) => self.organism_by_common_name(conn, common_name)?,
            None => self.refs.organism_id,
        };
        let type_name = changeset
            .constant("stock", "type_id")
            .unwrap_or(&self.refs.germplasm_type)
            .to_string();

        self.request_terms(conn, std::slice::from_ref(&type_name), "stock")?;

        let filter = self.term_filter([type_name.clone()]);
        let wanted = vec![type_name.clone()];
        let keys = stocks.iter().map(|(name, _)| name.clone()).collect::<Vec<_>>();
        let join = move |fetched: Vec<TargetRow>, _storage: &RunStorage| -> Result<Joined, MigrateError> {
            let type_id = term_ids(&fetched, &wanted, "stock")?
                .get(&type_name)
                .copied()
                .ok_or_else(|| MigrateError::invariant("stock", format!("no cvterm {type_name}")))?;
            let rows = stocks
                .into_iter()
                .map(|(name, uniquename)| {
                    vec![
                        TargetValue::Integer(organism_id),
                        TargetValue::Text(name),
                        TargetValue::Text(uniquename),
                        TargetValue::Integer(type_id),
                    ]
                })
                .collect();
            Ok(Joined { rows, keys })
        };
        let insert = InsertTask::fetch_join_insert(
            "stock",
            "cvterm",
            filter,
            "stock",
            &["organism_id", "name", "uniquename", "type_id"],
            join,
        )
        .capturing(Slot::Stocks, Vec::new());

        Ok(insert.into())
    }

    fn organism_by_common_name(
        &self,
        conn: &mut dyn TargetConnection,
        common_name: &str,
    ) -> Result<i64, MigrateError> {
        conn.select("organism", &Filter::eq("common_name", common_name))?
            .first()
            .and_then(|row| row.int("organism_id"))
            .ok_or_else(|| MigrateError::MissingReference {
                kind: "organism",
                name: common_name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(name: &str, uniquename: &str) -> (String, String) {
        (name.to_string(), uniquename.to_string())
    }

    #[test]
    fn duplicate_names_collapse_to_one_stock() {
        let stocks = dedupe_stocks(vec![pair("GM1", "GM1"), pair("GM1", "GM1")]);
        assert_eq!(stocks, vec![pair("GM1", "GM1")]);
    }

    #[test]
    fn names_are_deduplicated_before_uniquenames() {
        let stocks = dedupe_stocks(vec![
            pair("A", "U1"),
            pair("A", "U2"),
            pair("B", "U1"),
            pair("C", "U3"),
        ]);
        assert_eq!(stocks, vec![pair("A", "U1"), pair("C", "U3")]);
    }
}

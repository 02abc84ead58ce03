use tracing::info;

use super::{EntityLinker, term_ids, unique_by};
use crate::batch::{InsertTask, Step, TaskContext};
use crate::domain::{Filter, TargetRow, TargetValue};
use crate::error::{MigrateError, preview};
use crate::resolver::{ChangeSet, PropertyStub};
use crate::store::TargetConnection;

/// Pairs prepared `(stock, value)` entries with fetched stock rows. Both
/// sides are sorted by stock name and must line up one to one.
pub fn align_stock_ids(
    mut prepared: Vec<(String, String)>,
    mut fetched: Vec<TargetRow>,
) -> Result<Vec<(i64, String)>, MigrateError> {
    prepared.sort_by(|a, b| a.0.cmp(&b.0));
    fetched.sort_by_key(|row| row.text("name"));

    if prepared.len() != fetched.len() {
        return Err(MigrateError::invariant(
            "stockprop",
            format!(
                "{} prepared properties but {} matching stocks",
                prepared.len(),
                fetched.len()
            ),
        ));
    }
    for window in prepared.windows(2) {
        if window[0].0 == window[1].0 {
            return Err(MigrateError::invariant(
                "stockprop",
                format!("stock {} has several values for one property", preview(&window[0].0)),
            ));
        }
    }

    prepared
        .into_iter()
        .zip(fetched)
        .map(|((stock, value), row)| {
            let name = row.text("name").unwrap_or_default();
            let id = row.int("stock_id");
            match id {
                Some(id) if name == stock => Ok((id, value)),
                _ => Err(MigrateError::invariant(
                    "stockprop",
                    format!(
                        "stock {} lined up with {}",
                        preview(&stock),
                        preview(&name)
                    ),
                )),
            }
        })
        .collect()
}

impl EntityLinker {
    pub fn build_stockprop(
        &self,
        conn: &mut dyn TargetConnection,
        changeset: &ChangeSet,
    ) -> Result<Step, MigrateError> {
        let types = unique_by(
            changeset.properties.iter().map(|prop| prop.type_name.clone()),
            |name| name.clone(),
        );
        info!(
            table = %changeset.table,
            properties = changeset.properties.len(),
            types = types.len(),
            "stockprop batch"
        );

        let mut branches = Vec::with_capacity(types.len());
        for type_name in types {
            let props = changeset
                .properties
                .iter()
                .filter(|prop| prop.type_name == type_name)
                .cloned()
                .collect::<Vec<_>>();
            self.request_terms(conn, std::slice::from_ref(&type_name), "stockprop")?;
            branches.push(self.stockprop_task(type_name, props).into());
        }
        Ok(Step::Parallel(branches))
    }

    fn stockprop_task(&self, type_name: String, props: Vec<PropertyStub>) -> InsertTask {
        let term_filter = self.term_filter([type_name.clone()]);
        let name = format!("stockprop:{type_name}");
        InsertTask::custom(
            name,
            move |ctx: &mut TaskContext<'_>| -> Result<usize, MigrateError> {
                let wanted = vec![type_name.clone()];
                let terms = ctx.conn.select("cvterm", &term_filter)?;
                let type_id = term_ids(&terms, &wanted, "stockprop")?
                    .get(&type_name)
                    .copied()
                    .unwrap_or_default();

                let prepared = props
                    .into_iter()
                    .map(|prop| (prop.stock, prop.value))
                    .collect::<Vec<_>>();
                let stocks = ctx.conn.select(
                    "stock",
                    &Filter::any_of("name", prepared.iter().map(|(stock, _)| stock.clone())),
                )?;
                let rows = align_stock_ids(prepared, stocks)?
                    .into_iter()
                    .map(|(stock_id, value)| {
                        vec![
                            TargetValue::Integer(stock_id),
                            TargetValue::Integer(type_id),
                            TargetValue::Text(value),
                            TargetValue::Integer(0),
                        ]
                    })
                    .collect::<Vec<_>>();
                let count = rows.len();
                ctx.conn
                    .insert("stockprop", &["stock_id", "type_id", "value", "rank"], rows, None)?;
                Ok(count)
            },
        )
    }
}

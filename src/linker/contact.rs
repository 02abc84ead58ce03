use tracing::info;

use super::{EntityLinker, term_ids, unique_by};
use crate::batch::{InsertTask, Joined, RunStorage, Slot, Step};
use crate::domain::{TargetRow, TargetValue};
use crate::error::MigrateError;
use crate::resolver::ChangeSet;
use crate::store::TargetConnection;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ContactStub {
    name: String,
    type_name: Option<String>,
    description: Option<String>,
}

impl EntityLinker {
    /// Contacts deduplicated by name; type terms are created on demand.
    pub fn build_contact(
        &self,
        conn: &mut dyn TargetConnection,
        changeset: &ChangeSet,
    ) -> Result<Step, MigrateError> {
        let Some(name_column) = changeset.column_for("contact", "name") else {
            return Ok(Step::noop("contact: contact.name not mapped"));
        };
        let type_column = changeset.column_for("contact", "type_id");
        let description_column = changeset.column_for("contact", "description");

        let contacts = unique_by(
            changeset.rows.iter().filter_map(|pending| {
                Some(ContactStub {
                    name: pending.row.text(name_column)?,
                    type_name: type_column.and_then(|column| pending.row.text(column)),
                    description: description_column.and_then(|column| pending.row.text(column)),
                })
            }),
            |contact| contact.name.clone(),
        );
        info!(table = %changeset.table, contacts = contacts.len(), "contact batch");
        if contacts.is_empty() {
            return Ok(Step::noop("contact: no named rows"));
        }

        let keys = contacts.iter().map(|contact| contact.name.clone()).collect::<Vec<_>>();
        let types = unique_by(
            contacts.iter().filter_map(|contact| contact.type_name.clone()),
            |name| name.clone(),
        );
        if types.is_empty() {
            let rows = contacts
                .into_iter()
                .map(|contact| vec![TargetValue::Text(contact.name), contact.description.into()])
                .collect();
            let insert = InsertTask::insert("contact", "contact", &["name", "description"], rows)
                .capturing(Slot::Contacts, keys);
            return Ok(insert.into());
        }

        self.request_terms(conn, &types, "contact")?;
        let filter = self.term_filter(types.clone());
        let insert = InsertTask::fetch_join_insert(
            "contact",
            "cvterm",
            filter,
            "contact",
            &["name", "type_id", "description"],
            move |fetched: Vec<TargetRow>, _storage: &RunStorage| -> Result<Joined, MigrateError> {
                let type_ids = term_ids(&fetched, &types, "contact")?;
                let rows = contacts
                    .into_iter()
                    .map(|contact| {
                        let type_id = contact
                            .type_name
                            .and_then(|name| type_ids.get(&name).copied());
                        vec![
                            TargetValue::Text(contact.name),
                            type_id.into(),
                            contact.description.into(),
                        ]
                    })
                    .collect();
                Ok(Joined { rows, keys })
            },
        )
        .capturing(Slot::Contacts, Vec::new());

        Ok(insert.into())
    }
}

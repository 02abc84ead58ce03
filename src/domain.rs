use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::MigrateError;

/// A single cell of a wide source table. Nulls are modelled as `None` at the
/// row level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceValue {
    Integer(i64),
    Float(f64),
    Date(NaiveDate),
    Text(String),
}

impl SourceValue {
    /// Text form used for comparisons, uniquenames and target payloads.
    pub fn to_text(&self) -> String {
        match self {
            SourceValue::Integer(value) => value.to_string(),
            SourceValue::Float(value) => value.to_string(),
            SourceValue::Date(value) => value.format("%Y-%m-%d").to_string(),
            SourceValue::Text(value) => value.clone(),
        }
    }

    pub fn to_target(&self) -> TargetValue {
        match self {
            SourceValue::Integer(value) => TargetValue::Integer(*value),
            SourceValue::Float(value) => TargetValue::Float(*value),
            SourceValue::Date(_) | SourceValue::Text(_) => TargetValue::Text(self.to_text()),
        }
    }
}

impl fmt::Display for SourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_text())
    }
}

impl From<&str> for SourceValue {
    fn from(value: &str) -> Self {
        SourceValue::Text(value.to_string())
    }
}

impl From<i64> for SourceValue {
    fn from(value: i64) -> Self {
        SourceValue::Integer(value)
    }
}

impl From<f64> for SourceValue {
    fn from(value: f64) -> Self {
        SourceValue::Float(value)
    }
}

/// One record of a wide source table together with its table's ordered
/// schema. Rows compare structurally.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    schema: Arc<[String]>,
    values: Vec<Option<SourceValue>>,
}

impl SourceRow {
    pub fn new(schema: Arc<[String]>, values: Vec<Option<SourceValue>>) -> Result<Self, MigrateError> {
        if schema.len() != values.len() {
            return Err(MigrateError::invariant(
                "source",
                format!(
                    "row has {} values but its schema has {} columns",
                    values.len(),
                    schema.len()
                ),
            ));
        }
        Ok(Self { schema, values })
    }

    pub fn values(&self) -> &[Option<SourceValue>] {
        &self.values
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.schema.iter().any(|name| name == column)
    }

    /// Value of `column`, `None` when the column is null or unknown.
    pub fn get(&self, column: &str) -> Option<&SourceValue> {
        self.schema
            .iter()
            .position(|name| name == column)
            .and_then(|index| self.values[index].as_ref())
    }

    pub fn text(&self, column: &str) -> Option<String> {
        self.get(column).map(SourceValue::to_text)
    }
}

/// A value written to or read from the target store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
}

impl TargetValue {
    pub fn to_text(&self) -> String {
        match self {
            TargetValue::Null => String::new(),
            TargetValue::Integer(value) => value.to_string(),
            TargetValue::Float(value) => value.to_string(),
            TargetValue::Text(value) => value.clone(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            TargetValue::Integer(value) => Some(*value),
            TargetValue::Float(value) if value.fract() == 0.0 => Some(*value as i64),
            TargetValue::Text(value) => value.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TargetValue::Integer(value) => Some(*value as f64),
            TargetValue::Float(value) => Some(*value),
            TargetValue::Text(value) => value.parse().ok(),
            TargetValue::Null => None,
        }
    }

    /// Equality with numeric coercion between integer and float cells.
    pub fn same_as(&self, other: &TargetValue) -> bool {
        match (self, other) {
            (TargetValue::Text(a), TargetValue::Text(b)) => a == b,
            (TargetValue::Null, TargetValue::Null) => true,
            (TargetValue::Null, _) | (_, TargetValue::Null) => false,
            (TargetValue::Text(_), _) | (_, TargetValue::Text(_)) => false,
            _ => self.as_f64() == other.as_f64(),
        }
    }
}

impl From<&str> for TargetValue {
    fn from(value: &str) -> Self {
        TargetValue::Text(value.to_string())
    }
}

impl From<String> for TargetValue {
    fn from(value: String) -> Self {
        TargetValue::Text(value)
    }
}

impl From<i64> for TargetValue {
    fn from(value: i64) -> Self {
        TargetValue::Integer(value)
    }
}

impl From<f64> for TargetValue {
    fn from(value: f64) -> Self {
        TargetValue::Float(value)
    }
}

impl<T: Into<TargetValue>> From<Option<T>> for TargetValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(TargetValue::Null)
    }
}

/// A row selected from the target store, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetRow(BTreeMap<String, TargetValue>);

impl TargetRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, value: impl Into<TargetValue>) -> Self {
        self.0.insert(column.to_string(), value.into());
        self
    }

    pub fn set(&mut self, column: &str, value: TargetValue) {
        self.0.insert(column.to_string(), value);
    }

    pub fn get(&self, column: &str) -> Option<&TargetValue> {
        self.0.get(column)
    }

    pub fn int(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(TargetValue::as_int)
    }

    pub fn text(&self, column: &str) -> Option<String> {
        match self.get(column) {
            None | Some(TargetValue::Null) => None,
            Some(value) => Some(value.to_text()),
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &TargetValue)> {
        self.0.iter()
    }
}

/// Row filter understood by every target store.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(String, TargetValue),
    In(String, Vec<TargetValue>),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<TargetValue>) -> Self {
        Filter::Eq(column.to_string(), value.into())
    }

    pub fn any_of<I, V>(column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<TargetValue>,
    {
        Filter::In(column.to_string(), values.into_iter().map(Into::into).collect())
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::All => other,
            Filter::And(mut parts) => {
                parts.push(other);
                Filter::And(parts)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    pub fn matches(&self, row: &TargetRow) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(column, value) => row.get(column).is_some_and(|cell| cell.same_as(value)),
            Filter::In(column, values) => row
                .get(column)
                .is_some_and(|cell| values.iter().any(|value| cell.same_as(value))),
            Filter::And(parts) => parts.iter().all(|part| part.matches(row)),
        }
    }
}

/// A dotted `table.attribute` reference into the target schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeRef {
    pub table: String,
    pub attribute: String,
}

impl AttributeRef {
    pub fn new(table: &str, attribute: &str) -> Self {
        Self {
            table: table.to_string(),
            attribute: attribute.to_string(),
        }
    }
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.attribute)
    }
}

impl FromStr for AttributeRef {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (table, attribute) = trimmed
            .split_once('.')
            .ok_or_else(|| format!("expected `table.attribute`, got `{trimmed}`"))?;
        let valid = |part: &str| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == ' ')
        };
        if !valid(table) || !valid(attribute) {
            return Err(format!("expected `table.attribute`, got `{trimmed}`"));
        }
        Ok(Self::new(table.trim(), attribute.trim()))
    }
}

/// Target concepts the migration knows how to populate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Concept {
    Stock,
    Geolocation,
    Contact,
    Stockprop,
    Phenotype,
}

impl Concept {
    pub const ALL: [Concept; 5] = [
        Concept::Stock,
        Concept::Geolocation,
        Concept::Contact,
        Concept::Stockprop,
        Concept::Phenotype,
    ];

    /// Target table whose attributes define equality for this concept.
    pub fn target_table(&self) -> &'static str {
        match self {
            Concept::Stock => "stock",
            Concept::Geolocation => "nd_geolocation",
            Concept::Contact => "contact",
            Concept::Stockprop => "stockprop",
            Concept::Phenotype => "phenotype",
        }
    }

    /// Every target table whose mappings feed this concept.
    pub fn mapped_tables(&self) -> &'static [&'static str] {
        match self {
            Concept::Stock => &["stock"],
            Concept::Geolocation => &["nd_geolocation", "nd_geolocationprop"],
            Concept::Contact => &["contact"],
            Concept::Stockprop => &["stockprop"],
            Concept::Phenotype => &["phenotype"],
        }
    }
}

impl fmt::Display for Concept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.target_table())
    }
}

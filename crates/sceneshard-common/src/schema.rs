//! Column type model for dynamic shard attributes
//!
//! Standard datasets share one fixed column set. Defect datasets carry an
//! attribute map per record; the resolver infers a column type for every
//! observed value and keeps the widest type seen per column:
//!
//! `boolean < integer < numeric < text`

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::naming::NameNormalizer;

/// Columns every shard table has. Dynamic attributes may not reuse them.
pub const BASE_COLUMNS: &[&str] = &[
    "id",
    "record_token",
    "data_name",
    "event_id",
    "source_id",
    "timestamp",
    "quality_flag",
    "created_at",
    "geometry",
];

/// Base columns plus the names the unified view adds on top of them.
pub const RESERVED_COLUMNS: &[&str] = &[
    "id",
    "record_token",
    "data_name",
    "event_id",
    "source_id",
    "timestamp",
    "quality_flag",
    "created_at",
    "geometry",
    "subdataset_name",
    "source_table",
    "uid",
];

/// Metadata keys that select the dataset kind
const KIND_KEYS: &[&str] = &["kind", "record_kind"];

const TRUE_KEYWORDS: &[&str] = &["true", "t", "yes"];
const FALSE_KEYWORDS: &[&str] = &["false", "f", "no"];

/// Inferred column type, ordered from narrowest to widest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Boolean,
    Integer,
    Numeric,
    Text,
}

impl ColumnType {
    /// The wider of two types.
    pub fn merge(self, other: ColumnType) -> ColumnType {
        self.max(other)
    }

    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Integer => "BIGINT",
            ColumnType::Numeric => "DOUBLE PRECISION",
            ColumnType::Text => "TEXT",
        }
    }

    /// Parse a PostgreSQL `information_schema` data type back into a column type.
    pub fn from_sql_type(data_type: &str) -> ColumnType {
        match data_type.to_lowercase().as_str() {
            "boolean" => ColumnType::Boolean,
            "bigint" | "integer" | "smallint" => ColumnType::Integer,
            "double precision" | "real" | "numeric" => ColumnType::Numeric,
            _ => ColumnType::Text,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Boolean => write!(f, "boolean"),
            ColumnType::Integer => write!(f, "integer"),
            ColumnType::Numeric => write!(f, "numeric"),
            ColumnType::Text => write!(f, "text"),
        }
    }
}

/// Infer the column type of a single attribute value. `null` carries no type.
pub fn infer_type(value: &Value) -> Option<ColumnType> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(ColumnType::Boolean),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(ColumnType::Integer),
        Value::Number(_) => Some(ColumnType::Numeric),
        Value::String(s) => Some(infer_text_type(s)),
        Value::Array(_) | Value::Object(_) => Some(ColumnType::Text),
    }
}

fn infer_text_type(raw: &str) -> ColumnType {
    let s = raw.trim();
    if parse_bool_keyword(s).is_some() {
        ColumnType::Boolean
    } else if s.parse::<i64>().is_ok() {
        ColumnType::Integer
    } else if s.parse::<f64>().is_ok_and(f64::is_finite) {
        ColumnType::Numeric
    } else {
        ColumnType::Text
    }
}

fn parse_bool_keyword(s: &str) -> Option<bool> {
    let lower = s.to_lowercase();
    if TRUE_KEYWORDS.contains(&lower.as_str()) {
        Some(true)
    } else if FALSE_KEYWORDS.contains(&lower.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Text form of `value` that PostgreSQL can cast to `column_type`.
/// `None` means SQL NULL.
pub fn render_value(value: &Value, column_type: ColumnType) -> Option<String> {
    match (value, column_type) {
        (Value::Null, _) => None,
        (Value::String(s), ColumnType::Boolean) => {
            Some(parse_bool_keyword(s.trim()).map_or_else(|| s.clone(), |b| b.to_string()))
        },
        // Widened boolean columns store flags as 1/0
        (Value::Bool(b), ColumnType::Integer | ColumnType::Numeric) => Some(u8::from(*b).to_string()),
        (Value::String(s), ColumnType::Integer | ColumnType::Numeric) => Some(
            parse_bool_keyword(s.trim()).map_or_else(|| s.trim().to_string(), |b| u8::from(b).to_string()),
        ),
        (Value::String(s), ColumnType::Text) => Some(s.clone()),
        (other, _) => Some(other.to_string()),
    }
}

/// Record variant of a source dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    /// Base columns only
    #[default]
    Standard,
    /// Base columns plus one column per observed attribute
    Defect,
}

impl DatasetKind {
    pub fn from_metadata(metadata: &HashMap<String, String>) -> DatasetKind {
        let is_defect = KIND_KEYS
            .iter()
            .filter_map(|key| metadata.get(*key))
            .any(|v| v.trim().eq_ignore_ascii_case("defect"));

        if is_defect {
            DatasetKind::Defect
        } else {
            DatasetKind::Standard
        }
    }
}

/// Dynamic columns of one shard: column name → type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSchema {
    columns: BTreeMap<String, ColumnType>,
}

impl ShardSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn get(&self, column: &str) -> Option<ColumnType> {
        self.columns.get(column).copied()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, ColumnType)> {
        self.columns.iter().map(|(name, ty)| (name.as_str(), *ty))
    }

    /// Widen `column` to at least `column_type`.
    pub fn observe(&mut self, column: &str, column_type: ColumnType) {
        self.columns
            .entry(column.to_string())
            .and_modify(|existing| *existing = existing.merge(column_type))
            .or_insert(column_type);
    }

    /// Add columns of `other` that this schema lacks. Types of existing
    /// columns are left alone. Returns the added columns.
    pub fn extend_with(&mut self, other: &ShardSchema) -> ShardSchema {
        let mut added = ShardSchema::new();
        for (name, ty) in other.columns() {
            if !self.columns.contains_key(name) {
                self.columns.insert(name.to_string(), ty);
                added.columns.insert(name.to_string(), ty);
            }
        }
        added
    }
}

impl FromIterator<(String, ColumnType)> for ShardSchema {
    fn from_iter<I: IntoIterator<Item = (String, ColumnType)>>(iter: I) -> Self {
        let mut schema = ShardSchema::new();
        for (name, ty) in iter {
            schema.observe(&name, ty);
        }
        schema
    }
}

/// Merge the observed attribute maps into a schema. Standard datasets always
/// resolve to the empty schema.
pub fn resolve_schema<'a, I>(records: I, kind: DatasetKind, names: &NameNormalizer) -> ShardSchema
where
    I: IntoIterator<Item = &'a BTreeMap<String, Value>>,
{
    let mut schema = ShardSchema::new();
    if kind == DatasetKind::Standard {
        return schema;
    }

    for attributes in records {
        for (key, value) in attributes {
            if let Some(ty) = infer_type(value) {
                schema.observe(&names.column_name(key), ty);
            }
        }
    }
    schema
}

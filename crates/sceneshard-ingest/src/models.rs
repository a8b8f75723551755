//! Domain models for scene ingestion

use chrono::{DateTime, Utc};
use sceneshard_common::{DatasetKind, NameNormalizer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Spatial reference of every shard geometry (WGS 84)
pub const SRID: i32 = 4326;

/// Logical grouping of records ingested under one source name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDataset {
    pub raw_name: String,
    pub normalized_name: String,
    pub shard_table_name: String,
    /// Record tokens in manifest order, without duplicates
    pub tokens: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub kind: DatasetKind,
}

impl SourceDataset {
    pub fn new(
        raw_name: &str,
        tokens: Vec<String>,
        metadata: HashMap<String, String>,
        names: &NameNormalizer,
    ) -> Self {
        let kind = DatasetKind::from_metadata(&metadata);
        Self {
            raw_name: raw_name.to_string(),
            normalized_name: names.normalize(raw_name),
            shard_table_name: names.shard_table_name(raw_name),
            tokens,
            metadata,
            kind,
        }
    }
}

/// One warehouse row for a token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneMetadata {
    pub token: String,
    /// Business key, unique per shard (`data_name` column)
    pub business_name: String,
    pub event_id: Option<String>,
    pub source_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Extra attributes; only persisted for defect datasets
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

/// Axis-aligned bounding box in SRID 4326 coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn is_valid(&self) -> bool {
        [self.min_x, self.min_y, self.max_x, self.max_y]
            .iter()
            .all(|v| v.is_finite())
            && self.min_x <= self.max_x
            && self.min_y <= self.max_y
    }
}

/// Shard geometry: polygon or point only
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Geometry {
    Point { x: f64, y: f64 },
    Polygon(BoundingBox),
}

impl Geometry {
    /// Envelope of an aggregated extent: a point when the extent has no
    /// width and no height, the bounding polygon otherwise.
    pub fn from_extent(bbox: BoundingBox) -> Self {
        if bbox.min_x == bbox.max_x && bbox.min_y == bbox.max_y {
            Geometry::Point {
                x: bbox.min_x,
                y: bbox.min_y,
            }
        } else {
            Geometry::Polygon(bbox)
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Geometry::Point { x, y } => x.is_finite() && y.is_finite(),
            Geometry::Polygon(bbox) => bbox.is_valid(),
        }
    }

    pub fn to_wkt(&self) -> String {
        match self {
            Geometry::Point { x, y } => format!("POINT({} {})", x, y),
            Geometry::Polygon(b) => format!(
                "POLYGON(({x0} {y0}, {x1} {y0}, {x1} {y1}, {x0} {y1}, {x0} {y0}))",
                x0 = b.min_x,
                y0 = b.min_y,
                x1 = b.max_x,
                y1 = b.max_y
            ),
        }
    }
}

/// Aggregated geometry for one business name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneGeometry {
    pub data_name: String,
    pub geometry: Geometry,
    pub point_count: i64,
    pub quality_flag: bool,
}

/// A fully merged row ready for its shard table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneRecord {
    pub token: String,
    pub data_name: String,
    pub event_id: Option<String>,
    pub source_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub quality_flag: bool,
    pub geometry: Geometry,
    /// Dynamic attributes keyed by column name
    pub attributes: BTreeMap<String, Value>,
}

/// Pipeline step a record failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    FetchMetadata,
    FetchBbox,
    Merge,
    CreateTable,
    DatabaseInsert,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::FetchMetadata => "fetch_metadata",
            Stage::FetchBbox => "fetch_bbox",
            Stage::Merge => "merge",
            Stage::CreateTable => "create_table",
            Stage::DatabaseInsert => "database_insert",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetch_metadata" => Ok(Stage::FetchMetadata),
            "fetch_bbox" => Ok(Stage::FetchBbox),
            "merge" => Ok(Stage::Merge),
            "create_table" => Ok(Stage::CreateTable),
            "database_insert" => Ok(Stage::DatabaseInsert),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// Where a single token is in the fetch → merge → insert pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum ItemState {
    Pending,
    MetadataFetched(SceneMetadata),
    GeometryFetched(SceneMetadata, SceneGeometry),
    Merged(SceneRecord),
    Inserted,
    Failed { stage: Stage, reason: String },
}

impl ItemState {
    pub fn fail(stage: Stage, reason: impl Into<String>) -> Self {
        ItemState::Failed {
            stage,
            reason: reason.into(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ItemState::Failed { .. })
    }
}

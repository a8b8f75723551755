//! Upstream sources: metadata warehouse and spatial aggregate store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::error::IngestResult;
use crate::models::{BoundingBox, Geometry, SceneGeometry, SceneMetadata};

/// Resolves record tokens to their warehouse metadata.
///
/// Tokens without a row are simply absent from the returned map; the caller
/// records them as `fetch_metadata` failures. An `Err` fails the whole batch.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch_metadata(&self, tokens: &[String]) -> IngestResult<HashMap<String, SceneMetadata>>;
}

/// Resolves business names to their aggregated scene geometry.
///
/// Names without a usable extent are absent from the returned map and fail
/// with stage `fetch_bbox`.
#[async_trait]
pub trait GeometrySource: Send + Sync {
    async fn fetch_geometry(&self, data_names: &[String]) -> IngestResult<HashMap<String, SceneGeometry>>;
}

pub(crate) fn metadata_query(table: &str) -> String {
    format!(
        "SELECT token, business_name, event_id, source_id, event_timestamp, attributes \
         FROM {} WHERE token = ANY($1)",
        table
    )
}

pub(crate) fn extent_query(table: &str) -> String {
    format!(
        "SELECT data_name, \
                ST_XMin(ext)::float8 AS min_x, ST_YMin(ext)::float8 AS min_y, \
                ST_XMax(ext)::float8 AS max_x, ST_YMax(ext)::float8 AS max_y, \
                point_count \
         FROM ( \
             SELECT data_name, ST_Extent(geom) AS ext, COUNT(*) AS point_count \
             FROM {} WHERE data_name = ANY($1) GROUP BY data_name \
         ) extents",
        table
    )
}

/// Warehouse metadata over PostgreSQL
#[derive(Clone)]
pub struct PgMetadataSource {
    pool: PgPool,
    table: String,
}

impl PgMetadataSource {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }
}

#[async_trait]
impl MetadataSource for PgMetadataSource {
    async fn fetch_metadata(&self, tokens: &[String]) -> IngestResult<HashMap<String, SceneMetadata>> {
        if tokens.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(&metadata_query(&self.table))
            .bind(tokens)
            .fetch_all(&self.pool)
            .await?;

        let mut found = HashMap::with_capacity(rows.len());
        for row in rows {
            let attributes = match row.try_get::<Option<Value>, _>("attributes")? {
                Some(Value::Object(map)) => map.into_iter().collect::<BTreeMap<_, _>>(),
                _ => BTreeMap::new(),
            };

            let metadata = SceneMetadata {
                token: row.try_get("token")?,
                business_name: row.try_get("business_name")?,
                event_id: row.try_get("event_id")?,
                source_id: row.try_get("source_id")?,
                timestamp: row.try_get::<Option<DateTime<Utc>>, _>("event_timestamp")?,
                attributes,
            };
            found.insert(metadata.token.clone(), metadata);
        }

        debug!(requested = tokens.len(), found = found.len(), "Fetched scene metadata");
        Ok(found)
    }
}

/// Scene extents aggregated from a PostGIS points table
#[derive(Clone)]
pub struct PgGeometrySource {
    pool: PgPool,
    table: String,
    min_points: i64,
}

impl PgGeometrySource {
    pub fn new(pool: PgPool, table: impl Into<String>, min_points: i64) -> Self {
        Self {
            pool,
            table: table.into(),
            min_points,
        }
    }
}

#[async_trait]
impl GeometrySource for PgGeometrySource {
    async fn fetch_geometry(&self, data_names: &[String]) -> IngestResult<HashMap<String, SceneGeometry>> {
        if data_names.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(&extent_query(&self.table))
            .bind(data_names)
            .fetch_all(&self.pool)
            .await?;

        let mut found = HashMap::with_capacity(rows.len());
        for row in rows {
            let data_name: String = row.try_get("data_name")?;
            let point_count: i64 = row.try_get("point_count")?;
            let corners = (
                row.try_get::<Option<f64>, _>("min_x")?,
                row.try_get::<Option<f64>, _>("min_y")?,
                row.try_get::<Option<f64>, _>("max_x")?,
                row.try_get::<Option<f64>, _>("max_y")?,
            );

            let (Some(min_x), Some(min_y), Some(max_x), Some(max_y)) = corners else {
                debug!(data_name = %data_name, "No extent for scene");
                continue;
            };

            if let Some(geometry) = scene_geometry(
                data_name.clone(),
                BoundingBox {
                    min_x,
                    min_y,
                    max_x,
                    max_y,
                },
                point_count,
                self.min_points,
            ) {
                found.insert(data_name, geometry);
            }
        }

        debug!(requested = data_names.len(), found = found.len(), "Fetched scene extents");
        Ok(found)
    }
}

/// Geometry for an aggregated extent, `None` when the extent is unusable
pub fn scene_geometry(
    data_name: String,
    bbox: BoundingBox,
    point_count: i64,
    min_points: i64,
) -> Option<SceneGeometry> {
    let geometry = Geometry::from_extent(bbox);
    if !geometry.is_valid() {
        return None;
    }

    Some(SceneGeometry {
        data_name,
        geometry,
        point_count,
        quality_flag: point_count >= min_points,
    })
}

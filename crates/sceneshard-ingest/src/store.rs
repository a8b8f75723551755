//! Shard table storage
//!
//! One PostGIS table per source dataset. Creation runs in three phases, each
//! in its own transaction because `AddGeometryColumn` has to see a committed
//! table:
//!
//! 1. base (and dynamic) columns
//! 2. geometry column plus a POLYGON/POINT type check
//! 3. indexes: GIST on geometry, unique on `data_name`, btree on
//!    `record_token` and `source_id`
//!
//! Every phase checks what already exists and tolerates "already exists"
//! errors from a concurrent creator. Existing tables are never migrated in
//! place apart from adding missing dynamic columns.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info, warn};

use crate::error::{is_already_exists, is_unique_violation, IngestError, IngestResult};
use crate::models::{SceneRecord, SourceDataset, SRID};
use crate::sql::{derived_identifier, quote_ident};
use crate::view::ViewPlan;
use sceneshard_common::schema::{render_value, BASE_COLUMNS};
use sceneshard_common::{ColumnType, ShardSchema};

/// PostgreSQL limit on bind parameters per statement
const MAX_BIND_PARAMS: usize = 65_535;

/// Fixed columns written on insert, before the geometry and dynamic columns
const INSERT_COLUMNS: &[&str] = &[
    "record_token",
    "data_name",
    "event_id",
    "source_id",
    "timestamp",
    "quality_flag",
    "geometry",
];

/// Per-row result of an insert call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Tokens of newly written rows
    pub inserted: Vec<String>,
    /// Tokens whose `data_name` was already stored
    pub already_present: Vec<String>,
    /// `(token, reason)` for rows that could not be written
    pub failed: Vec<(String, String)>,
}

impl InsertOutcome {
    pub fn merge(&mut self, other: InsertOutcome) {
        self.inserted.extend(other.inserted);
        self.already_present.extend(other.already_present);
        self.failed.extend(other.failed);
    }

    /// Tokens persisted by this call or an earlier one
    pub fn persisted(&self) -> impl Iterator<Item = &String> {
        self.inserted.iter().chain(self.already_present.iter())
    }
}

/// Storage backend for shard tables and the unified view
#[async_trait]
pub trait ShardStore: Send + Sync {
    async fn table_exists(&self, table: &str) -> IngestResult<bool>;

    /// Create the shard for `dataset` if missing. Returns the table name.
    async fn ensure_table(&self, dataset: &SourceDataset, schema: &ShardSchema) -> IngestResult<String>;

    /// Add dynamic columns the table lacks. Returns the table's dynamic
    /// columns with their stored types.
    async fn ensure_columns(&self, table: &str, schema: &ShardSchema) -> IngestResult<ShardSchema>;

    /// Write `rows` as one bulk statement where possible. Rows whose
    /// `data_name` already exists count as already present, other per-row
    /// errors as failed; only connection-level problems return `Err`.
    async fn insert_batch(
        &self,
        table: &str,
        schema: &ShardSchema,
        rows: &[SceneRecord],
    ) -> IngestResult<InsertOutcome>;

    /// Tables whose name starts with `prefix`, sorted
    async fn list_shards(&self, prefix: &str) -> IngestResult<Vec<String>>;

    /// Run the view statements in one transaction
    async fn apply_view_plan(&self, plan: &ViewPlan) -> IngestResult<()>;
}

pub(crate) fn create_table_sql(table: &str, schema: &ShardSchema) -> String {
    let mut columns = vec![
        "id BIGSERIAL PRIMARY KEY".to_string(),
        "record_token TEXT NOT NULL".to_string(),
        "data_name TEXT NOT NULL".to_string(),
        "event_id TEXT".to_string(),
        "source_id TEXT".to_string(),
        "\"timestamp\" TIMESTAMPTZ".to_string(),
        "quality_flag BOOLEAN NOT NULL DEFAULT FALSE".to_string(),
        "created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()".to_string(),
    ];
    columns.extend(
        schema
            .columns()
            .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.sql_type())),
    );

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote_ident(table),
        columns.join(",\n    ")
    )
}

/// `(name suffix, kind, definition)` of every shard index
const SHARD_INDEXES: &[(&str, &str, &str)] = &[
    ("geometry_gist", "INDEX", "USING GIST (geometry)"),
    ("data_name_key", "UNIQUE INDEX", "(data_name)"),
    ("record_token_idx", "INDEX", "(record_token)"),
    ("source_id_idx", "INDEX", "(source_id)"),
];

pub(crate) fn index_names(table: &str) -> Vec<String> {
    SHARD_INDEXES
        .iter()
        .map(|(suffix, _, _)| derived_identifier(table, suffix))
        .collect()
}

pub(crate) fn index_statements(table: &str) -> Vec<String> {
    let t = quote_ident(table);
    SHARD_INDEXES
        .iter()
        .map(|(suffix, kind, definition)| {
            format!(
                "CREATE {} IF NOT EXISTS {} ON {} {}",
                kind,
                quote_ident(&derived_identifier(table, suffix)),
                t,
                definition
            )
        })
        .collect()
}

/// Multi-row INSERT for `rows`. Geometry goes in as WKT, dynamic values as
/// text cast to the column type.
pub(crate) fn insert_query(
    table: &str,
    schema: &ShardSchema,
    rows: &[SceneRecord],
) -> QueryBuilder<'static, Postgres> {
    let dynamic: Vec<(String, ColumnType)> = schema
        .columns()
        .map(|(name, ty)| (name.to_string(), ty))
        .collect();

    let column_list = INSERT_COLUMNS
        .iter()
        .map(|c| quote_ident(c))
        .chain(dynamic.iter().map(|(name, _)| quote_ident(name)))
        .collect::<Vec<_>>()
        .join(", ");

    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        quote_ident(table),
        column_list
    ));

    builder.push_values(rows.iter(), |mut b, row| {
        b.push_bind(row.token.clone())
            .push_bind(row.data_name.clone())
            .push_bind(row.event_id.clone())
            .push_bind(row.source_id.clone())
            .push_bind(row.timestamp)
            .push_bind(row.quality_flag);

        b.push("ST_GeomFromText(")
            .push_bind_unseparated(row.geometry.to_wkt())
            .push_unseparated(format!(", {})", SRID));

        for (name, ty) in &dynamic {
            let value = row.attributes.get(name).and_then(|v| render_value(v, *ty));
            b.push_bind(value)
                .push_unseparated(format!("::{}", ty.sql_type()));
        }
    });

    builder
}

/// Rows per INSERT so that the statement stays under the bind limit
pub(crate) fn chunk_size(requested: usize, schema: &ShardSchema) -> usize {
    let params_per_row = INSERT_COLUMNS.len() + schema.len();
    requested.clamp(1, (MAX_BIND_PARAMS / params_per_row).max(1))
}

/// Shard storage over a PostgreSQL/PostGIS pool
#[derive(Clone)]
pub struct PgShardStore {
    pool: PgPool,
}

impl PgShardStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn column_exists(&self, table: &str, column: &str) -> IngestResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 AND column_name = $2)",
        )
        .bind(table)
        .bind(column)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn stored_schema(&self, table: &str) -> IngestResult<ShardSchema> {
        let rows = sqlx::query(
            "SELECT column_name::text AS column_name, data_type::text AS data_type \
             FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        let mut schema = ShardSchema::new();
        for row in rows {
            let name: String = row.try_get("column_name")?;
            let data_type: String = row.try_get("data_type")?;
            if !BASE_COLUMNS.contains(&name.as_str()) {
                schema.observe(&name, ColumnType::from_sql_type(&data_type));
            }
        }
        Ok(schema)
    }

    /// Phase 1: base and dynamic columns
    async fn create_base_table(&self, table: &str, schema: &ShardSchema) -> IngestResult<()> {
        let mut tx = self.pool.begin().await?;
        match sqlx::query(&create_table_sql(table, schema)).execute(&mut *tx).await {
            Ok(_) => tx.commit().await?,
            // a concurrent CREATE can trip pg_type's unique index instead of IF NOT EXISTS
            Err(e) if is_already_exists(&e) || is_unique_violation(&e) => {
                debug!(table = %table, "Shard table created concurrently");
                tx.rollback().await?;
            },
            Err(e) => return Err(IngestError::shard_creation(table, e)),
        }
        Ok(())
    }

    /// Phase 2: geometry column and its type check
    async fn add_geometry_column(&self, table: &str) -> IngestResult<()> {
        if self.column_exists(table, "geometry").await? {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let added = sqlx::query(
            "SELECT AddGeometryColumn(current_schema()::varchar, $1::varchar, 'geometry', $2, 'GEOMETRY', 2)",
        )
        .bind(table)
        .bind(SRID)
        .execute(&mut *tx)
        .await;

        if let Err(e) = added {
            tx.rollback().await?;
            if is_already_exists(&e) {
                return Ok(());
            }
            return Err(IngestError::shard_creation(table, e));
        }

        let check = format!(
            "ALTER TABLE {} ADD CONSTRAINT {} CHECK (GeometryType(geometry) IN ('POLYGON', 'POINT'))",
            quote_ident(table),
            quote_ident(&derived_identifier(table, "geometry_type_check"))
        );
        match sqlx::query(&check).execute(&mut *tx).await {
            Ok(_) => tx.commit().await?,
            Err(e) if is_already_exists(&e) => tx.rollback().await?,
            Err(e) => {
                tx.rollback().await?;
                return Err(IngestError::shard_creation(table, e));
            },
        }
        Ok(())
    }

    /// Phase 3: indexes
    async fn indexes_present(&self, table: &str) -> IngestResult<bool> {
        let expected = index_names(table);
        let present: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM pg_indexes \
             WHERE schemaname = current_schema() AND tablename = $1 AND indexname::text = ANY($2)",
        )
        .bind(table)
        .bind(&expected)
        .fetch_one(&self.pool)
        .await?;
        Ok(present == expected.len() as i64)
    }

    async fn create_indexes(&self, table: &str) -> IngestResult<()> {
        let mut tx = self.pool.begin().await?;
        for statement in index_statements(table) {
            if let Err(e) = sqlx::query(&statement).execute(&mut *tx).await {
                tx.rollback().await?;
                if is_already_exists(&e) || is_unique_violation(&e) {
                    debug!(table = %table, "Shard indexes created concurrently");
                    return Ok(());
                }
                return Err(IngestError::shard_creation(table, e));
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_chunk(
        &self,
        table: &str,
        schema: &ShardSchema,
        rows: &[SceneRecord],
    ) -> IngestResult<InsertOutcome> {
        let mut query = insert_query(table, schema, rows);
        match query.build().execute(&self.pool).await {
            Ok(_) => Ok(InsertOutcome {
                inserted: rows.iter().map(|r| r.token.clone()).collect(),
                ..InsertOutcome::default()
            }),
            Err(sqlx::Error::Database(db_err)) => {
                debug!(
                    table = %table,
                    rows = rows.len(),
                    error = %db_err,
                    "Bulk insert rejected, retrying row by row"
                );
                self.insert_rows_individually(table, schema, rows).await
            },
            Err(e) => Err(e.into()),
        }
    }

    /// One savepoint per row so a bad row cannot take the others down
    async fn insert_rows_individually(
        &self,
        table: &str,
        schema: &ShardSchema,
        rows: &[SceneRecord],
    ) -> IngestResult<InsertOutcome> {
        let mut outcome = InsertOutcome::default();
        let mut tx = self.pool.begin().await?;

        for row in rows {
            sqlx::query("SAVEPOINT row_savepoint").execute(&mut *tx).await?;

            let mut query = insert_query(table, schema, std::slice::from_ref(row));
            match query.build().execute(&mut *tx).await {
                Ok(_) => {
                    sqlx::query("RELEASE SAVEPOINT row_savepoint")
                        .execute(&mut *tx)
                        .await?;
                    outcome.inserted.push(row.token.clone());
                },
                Err(e) => {
                    sqlx::query("ROLLBACK TO SAVEPOINT row_savepoint")
                        .execute(&mut *tx)
                        .await?;
                    if is_unique_violation(&e) {
                        outcome.already_present.push(row.token.clone());
                    } else {
                        warn!(table = %table, token = %row.token, error = %e, "Row insert failed");
                        outcome.failed.push((row.token.clone(), e.to_string()));
                    }
                },
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }
}

#[async_trait]
impl ShardStore for PgShardStore {
    async fn table_exists(&self, table: &str) -> IngestResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1)",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn ensure_table(&self, dataset: &SourceDataset, schema: &ShardSchema) -> IngestResult<String> {
        let table = dataset.shard_table_name.as_str();
        if self.table_exists(table).await? && self.column_exists(table, "geometry").await? {
            // Without the unique index re-ingested rows would duplicate
            if !self.indexes_present(table).await? {
                warn!(table = %table, "Shard table is missing indexes, recreating");
                self.create_indexes(table).await?;
            }
            return Ok(table.to_string());
        }

        info!(table = %table, dataset = %dataset.raw_name, columns = schema.len(), "Creating shard table");
        self.create_base_table(table, schema).await?;
        self.add_geometry_column(table).await?;
        self.create_indexes(table).await?;

        Ok(table.to_string())
    }

    async fn ensure_columns(&self, table: &str, schema: &ShardSchema) -> IngestResult<ShardSchema> {
        let mut stored = self.stored_schema(table).await?;
        let added = stored.extend_with(schema);
        if added.is_empty() {
            return Ok(stored);
        }

        let mut tx = self.pool.begin().await?;
        for (name, ty) in added.columns() {
            let statement = format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                quote_ident(table),
                quote_ident(name),
                ty.sql_type()
            );
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        info!(table = %table, added = added.len(), "Added dynamic columns");
        // a racing writer may have added the same column with another type
        self.stored_schema(table).await
    }

    async fn insert_batch(
        &self,
        table: &str,
        schema: &ShardSchema,
        rows: &[SceneRecord],
    ) -> IngestResult<InsertOutcome> {
        let mut outcome = InsertOutcome::default();
        for chunk in rows.chunks(chunk_size(rows.len(), schema)) {
            outcome.merge(self.insert_chunk(table, schema, chunk).await?);
        }

        debug!(
            table = %table,
            inserted = outcome.inserted.len(),
            already_present = outcome.already_present.len(),
            failed = outcome.failed.len(),
            "Insert batch finished"
        );
        Ok(outcome)
    }

    async fn list_shards(&self, prefix: &str) -> IngestResult<Vec<String>> {
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT table_name::text AS table_name FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' \
               AND left(table_name, length($1)) = $1 \
             ORDER BY table_name",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(tables)
    }

    async fn apply_view_plan(&self, plan: &ViewPlan) -> IngestResult<()> {
        let mut tx = self.pool.begin().await?;
        for statement in &plan.statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

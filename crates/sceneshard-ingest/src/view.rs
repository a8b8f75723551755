//! Unified view over all shard tables
//!
//! The view is a plain `UNION ALL` of the base columns of every shard, with two
//! literal discriminator columns added per branch: `subdataset_name` (the
//! canonical dataset name) and `source_table`. It is always dropped and
//! recreated, never altered.
//!
//! Optional variants:
//! - `<name>_with_id`: the union wrapped with
//!   `row_number() OVER (ORDER BY source_table, id) AS uid`, for consumers that
//!   need a single-column key.
//! - `<name>_materialized`: the same query stored as a table with a primary key
//!   on `uid` and a GIST index. Stale until the next rebuild.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::IngestResult;
use crate::sql::{derived_identifier, quote_ident, quote_literal};
use crate::store::ShardStore;
use sceneshard_common::naming::{reserved_suffix, NamingRules};
use sceneshard_common::NameNormalizer;

const VIEW_COLUMNS: &str =
    "id, record_token, data_name, event_id, source_id, \"timestamp\", quality_flag, created_at, geometry";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ViewVariant {
    /// Plain UNION ALL view
    Plain,
    /// View with a row_number() key
    StableId,
    /// Physical table built from the stable-id query
    Materialized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewConfig {
    pub name: String,
    pub shard_prefix: String,
    pub variants: Vec<ViewVariant>,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            name: crate::config::DEFAULT_VIEW_NAME.to_string(),
            shard_prefix: NamingRules::default().shard_prefix,
            variants: vec![ViewVariant::Plain],
        }
    }
}

impl ViewConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_variants(mut self, variants: Vec<ViewVariant>) -> Self {
        self.variants = variants;
        self
    }

    pub fn stable_id_name(&self) -> String {
        derived_identifier(&self.name, "with_id")
    }

    pub fn materialized_name(&self) -> String {
        derived_identifier(&self.name, "materialized")
    }

    pub fn has(&self, variant: ViewVariant) -> bool {
        self.variants.contains(&variant)
    }

    /// Names of every relation the builder owns
    pub fn own_names(&self) -> [String; 3] {
        [self.name.clone(), self.stable_id_name(), self.materialized_name()]
    }
}

/// True when `table` is a shard the view should include
pub fn is_shard_table(table: &str, config: &ViewConfig) -> bool {
    table.starts_with(&config.shard_prefix)
        && table.len() > config.shard_prefix.len()
        && !config.own_names().iter().any(|own| own == table)
        && reserved_suffix(table).is_none()
}

/// `UNION ALL` over the base columns of `shards`
pub fn union_sql(shards: &[String], names: &NameNormalizer) -> String {
    shards
        .iter()
        .map(|table| {
            format!(
                "SELECT {}, {}::text AS subdataset_name, {}::text AS source_table FROM {}",
                VIEW_COLUMNS,
                quote_literal(names.dataset_from_table(table)),
                quote_literal(table),
                quote_ident(table)
            )
        })
        .collect::<Vec<_>>()
        .join("\nUNION ALL\n")
}

/// The union with a deterministic `uid` column in front
pub fn stable_id_sql(shards: &[String], names: &NameNormalizer) -> String {
    format!(
        "SELECT row_number() OVER (ORDER BY u.source_table, u.id) AS uid, u.*\nFROM (\n{}\n) u",
        union_sql(shards, names)
    )
}

/// Statements that bring the views in line with `shards`
#[derive(Debug, Clone, PartialEq)]
pub struct ViewPlan {
    pub shards: Vec<String>,
    pub statements: Vec<String>,
    /// Relations that exist after the plan ran
    pub created: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViewReport {
    pub shard_count: usize,
    pub created: Vec<String>,
}

pub struct UnifiedViewBuilder {
    config: ViewConfig,
    names: NameNormalizer,
}

impl UnifiedViewBuilder {
    pub fn new(config: ViewConfig, names: NameNormalizer) -> Self {
        Self { config, names }
    }

    pub fn config(&self) -> &ViewConfig {
        &self.config
    }

    pub fn is_shard_table(&self, table: &str) -> bool {
        is_shard_table(table, &self.config)
    }

    /// Plan the drop/create statements for the given candidate tables.
    ///
    /// Only the configured variants are touched. With no shards left the
    /// variants are dropped and nothing is recreated.
    pub fn plan(&self, tables: &[String]) -> ViewPlan {
        let mut shards: Vec<String> = tables
            .iter()
            .filter(|t| self.is_shard_table(t))
            .cloned()
            .collect();
        shards.sort();
        shards.dedup();

        let plain = self.config.name.clone();
        let stable = self.config.stable_id_name();
        let materialized = self.config.materialized_name();

        let mut statements = Vec::new();
        if self.config.has(ViewVariant::Materialized) {
            statements.push(format!("DROP TABLE IF EXISTS {}", quote_ident(&materialized)));
        }
        if self.config.has(ViewVariant::StableId) {
            statements.push(format!("DROP VIEW IF EXISTS {}", quote_ident(&stable)));
        }
        if self.config.has(ViewVariant::Plain) {
            statements.push(format!("DROP VIEW IF EXISTS {}", quote_ident(&plain)));
        }

        let mut created = Vec::new();
        if shards.is_empty() {
            return ViewPlan {
                shards,
                statements,
                created,
            };
        }

        if self.config.has(ViewVariant::Plain) {
            statements.push(format!(
                "CREATE VIEW {} AS\n{}",
                quote_ident(&plain),
                union_sql(&shards, &self.names)
            ));
            created.push(plain);
        }
        if self.config.has(ViewVariant::StableId) {
            statements.push(format!(
                "CREATE VIEW {} AS\n{}",
                quote_ident(&stable),
                stable_id_sql(&shards, &self.names)
            ));
            created.push(stable);
        }
        if self.config.has(ViewVariant::Materialized) {
            let table = quote_ident(&materialized);
            statements.push(format!(
                "CREATE TABLE {} AS\n{}",
                table,
                stable_id_sql(&shards, &self.names)
            ));
            statements.push(format!("ALTER TABLE {} ADD PRIMARY KEY (uid)", table));
            statements.push(format!(
                "CREATE INDEX {} ON {} USING GIST (geometry)",
                quote_ident(&derived_identifier(&materialized, "geometry_gist")),
                table
            ));
            created.push(materialized);
        }

        ViewPlan {
            shards,
            statements,
            created,
        }
    }

    /// List the shards in `store` and rebuild every configured variant
    pub async fn rebuild(&self, store: &dyn ShardStore) -> IngestResult<ViewReport> {
        let tables = store.list_shards(&self.config.shard_prefix).await?;
        let plan = self.plan(&tables);

        if plan.shards.is_empty() {
            warn!(view = %self.config.name, "No shard tables found; views dropped and not recreated");
        }

        store.apply_view_plan(&plan).await?;

        info!(
            view = %self.config.name,
            shards = plan.shards.len(),
            created = ?plan.created,
            "Unified view rebuilt"
        );

        Ok(ViewReport {
            shard_count: plan.shards.len(),
            created: plan.created,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(variants: Vec<ViewVariant>) -> UnifiedViewBuilder {
        UnifiedViewBuilder::new(
            ViewConfig::new("scenes_all").with_variants(variants),
            NameNormalizer::default(),
        )
    }

    #[test]
    fn test_is_shard_table_exclusions() {
        let config = ViewConfig::new("scenes_all");
        assert!(is_shard_table("scenes_highway", &config));
        assert!(!is_shard_table("scenes_all", &config));
        assert!(!is_shard_table("scenes_all_with_id", &config));
        assert!(!is_shard_table("scenes_all_materialized", &config));
        assert!(!is_shard_table("scenes_highway_backup", &config));
        assert!(!is_shard_table("scenes_highway_tmp", &config));
        assert!(!is_shard_table("scenes_daily_agg", &config));
        assert!(!is_shard_table("other_highway", &config));
        assert!(!is_shard_table("scenes_", &config));
    }

    #[test]
    fn test_generated_shard_names_are_included() {
        let config = ViewConfig::new("scenes_all");
        let names = NameNormalizer::default();
        for raw in ["PFX_lane_test", "PFX_night_all", "PFX_road_old", "PFX_city_tmp", "all"] {
            let table = names.shard_table_name(raw);
            assert!(is_shard_table(&table, &config), "{} -> {} left out", raw, table);
        }
    }

    #[test]
    fn test_custom_view_name_is_excluded() {
        let config = ViewConfig::new("scenes_unified");
        assert!(!is_shard_table("scenes_unified", &config));
        assert!(!is_shard_table("scenes_unified_with_id", &config));
        assert!(is_shard_table("scenes_all_roads", &config));
    }

    #[test]
    fn test_union_sql_branches() {
        let shards = vec!["scenes_a".to_string(), "scenes_b".to_string()];
        let sql = union_sql(&shards, &NameNormalizer::default());

        assert_eq!(sql.matches("UNION ALL").count(), 1);
        assert!(sql.contains("'a'::text AS subdataset_name, 'scenes_a'::text AS source_table FROM \"scenes_a\""));
        assert!(sql.contains("FROM \"scenes_b\""));
    }

    #[test]
    fn test_stable_id_sql_orders_by_source_and_id() {
        let sql = stable_id_sql(&["scenes_a".to_string()], &NameNormalizer::default());
        assert!(sql.starts_with("SELECT row_number() OVER (ORDER BY u.source_table, u.id) AS uid"));
    }

    #[test]
    fn test_plan_never_includes_itself() {
        let tables = vec![
            "scenes_b".to_string(),
            "scenes_all".to_string(),
            "scenes_a".to_string(),
            "scenes_a_old".to_string(),
        ];
        let plan = builder(vec![ViewVariant::Plain]).plan(&tables);

        assert_eq!(plan.shards, vec!["scenes_a", "scenes_b"]);
        assert_eq!(plan.statements[0], "DROP VIEW IF EXISTS \"scenes_all\"");
        assert!(plan.statements[1].starts_with("CREATE VIEW \"scenes_all\" AS"));
        assert!(!plan.statements[1].contains("FROM \"scenes_all\""));
        assert_eq!(plan.created, vec!["scenes_all"]);
    }

    #[test]
    fn test_plan_all_variants() {
        let plan = builder(vec![
            ViewVariant::Plain,
            ViewVariant::StableId,
            ViewVariant::Materialized,
        ])
        .plan(&["scenes_a".to_string()]);

        assert_eq!(
            plan.created,
            vec!["scenes_all", "scenes_all_with_id", "scenes_all_materialized"]
        );
        assert!(plan
            .statements
            .iter()
            .any(|s| s == "ALTER TABLE \"scenes_all_materialized\" ADD PRIMARY KEY (uid)"));
        assert!(plan.statements.iter().any(|s| s.contains("USING GIST (geometry)")));
    }

    #[test]
    fn test_plan_without_shards_only_drops() {
        let plan = builder(vec![ViewVariant::Plain, ViewVariant::StableId]).plan(&[]);
        assert!(plan.shards.is_empty());
        assert!(plan.created.is_empty());
        assert_eq!(plan.statements.len(), 2);
        assert!(plan.statements.iter().all(|s| s.starts_with("DROP VIEW IF EXISTS")));
    }
}

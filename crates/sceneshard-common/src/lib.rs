//! Sceneshard Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Database-free building blocks shared by the ingestion pipeline and by any
//! consumer of the sharded scene storage.
//!
//! # Overview
//!
//! - **Error Handling**: [`ShardError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber bootstrap ([`logging`])
//! - **Naming**: source-dataset name normalization and shard table naming ([`naming`])
//! - **Schema**: column type inference and widening for dynamic attributes ([`schema`])
//!
//! # Example
//!
//! ```
//! use sceneshard_common::naming::NameNormalizer;
//!
//! let normalizer = NameNormalizer::default();
//! assert_eq!(normalizer.normalize("PFX_abc__de___2024_01_02_03_04_05"), "abc_de");
//! assert_eq!(normalizer.shard_table_name("PFX_abc__de"), "scenes_abc_de");
//! ```

pub mod error;
pub mod logging;
pub mod naming;
pub mod schema;

// Re-export commonly used types
pub use error::{Result, ShardError};
pub use naming::{NameIssue, NameNormalizer, NamingRules};
pub use schema::{ColumnType, DatasetKind, ShardSchema};

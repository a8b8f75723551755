//! Source-dataset name normalization and shard table naming
//!
//! Raw dataset identifiers arrive with decoration that carries no grouping
//! meaning: a fixed source prefix, sub-run markers, content hashes and
//! capture timestamps. [`NameNormalizer::normalize`] strips that decoration and
//! [`NameNormalizer::shard_table_name`] turns the result into a PostgreSQL
//! identifier.
//!
//! Neither operation fails. Table names are deterministic but not guaranteed
//! collision-free; [`NameRegistry`] reports collisions, it does not resolve them.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::warn;

use crate::error::Result;
use crate::schema::RESERVED_COLUMNS;

/// PostgreSQL truncates identifiers longer than NAMEDATALEN - 1 bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

const FALLBACK_PLACEHOLDER: &str = "unnamed";

/// Table-name suffixes that mark helper relations (views, backups, scratch
/// tables) rather than shards. Shard names never end in one of these.
pub const RESERVED_TABLE_SUFFIXES: &[&str] = &[
    "_tmp",
    "_temp",
    "_backup",
    "_bak",
    "_old",
    "_test",
    "_all",
    "_union",
    "_with_id",
    "_materialized",
    "_agg",
];

/// Appended to a shard name that would otherwise end in a reserved suffix
const RESERVED_SUFFIX_GUARD: &str = "_ds";

/// The reserved suffix `name` ends with, if any
pub fn reserved_suffix(name: &str) -> Option<&'static str> {
    RESERVED_TABLE_SUFFIXES
        .iter()
        .find(|suffix| name.len() > suffix.len() && name.ends_with(*suffix))
        .copied()
}

/// Configurable normalization constants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingRules {
    /// Known source prefix, stripped (repeatedly) from the front
    pub strip_prefix: String,
    /// Everything from the first occurrence of this marker is discarded
    pub infix_marker: String,
    /// Hash-like infix token; the name is cut where it starts. Empty disables.
    pub hash_pattern: String,
    /// Trailing capture timestamp; removed while it matches. Empty disables.
    pub timestamp_pattern: String,
    pub separator: char,
    /// Used whenever normalization leaves nothing behind
    pub placeholder: String,
    /// Prefix of every shard table
    pub shard_prefix: String,
    pub max_identifier_len: usize,
    /// Prepended when a table name would start with a digit
    pub sanitize_char: char,
}

impl Default for NamingRules {
    fn default() -> Self {
        Self {
            strip_prefix: "PFX_".to_string(),
            infix_marker: "_sub_".to_string(),
            hash_pattern: r"(?i)_\d[0-9a-z]{4,}e2e(?:_|$)".to_string(),
            timestamp_pattern: r"(?:^|_)(?:\d{4}_\d{2}_\d{2}_\d{2}_\d{2}_\d{2}|\d{8}_\d{6})$"
                .to_string(),
            separator: '_',
            placeholder: FALLBACK_PLACEHOLDER.to_string(),
            shard_prefix: "scenes_".to_string(),
            max_identifier_len: MAX_IDENTIFIER_LEN,
            sanitize_char: 't',
        }
    }
}

/// A problem found by [`NameNormalizer::validate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameIssue {
    Empty,
    TooLong { len: usize, max: usize },
    InvalidStart(char),
    InvalidCharacter(char),
    ConsecutiveSeparators,
    LeadingSeparator,
    TrailingSeparator,
    MissingShardPrefix,
    ReservedSuffix(&'static str),
}

impl fmt::Display for NameIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameIssue::Empty => write!(f, "name is empty"),
            NameIssue::TooLong { len, max } => write!(f, "name is {} bytes, limit is {}", len, max),
            NameIssue::InvalidStart(c) => write!(f, "name must start with a-z, found '{}'", c),
            NameIssue::InvalidCharacter(c) => write!(f, "invalid character '{}'", c),
            NameIssue::ConsecutiveSeparators => write!(f, "consecutive separators"),
            NameIssue::LeadingSeparator => write!(f, "leading separator"),
            NameIssue::TrailingSeparator => write!(f, "trailing separator"),
            NameIssue::MissingShardPrefix => write!(f, "missing shard prefix"),
            NameIssue::ReservedSuffix(suffix) => write!(f, "ends with reserved suffix '{}'", suffix),
        }
    }
}

/// Maps raw source-dataset identifiers to canonical names and shard tables
#[derive(Debug, Clone)]
pub struct NameNormalizer {
    rules: NamingRules,
    hash: Option<Regex>,
    timestamp: Option<Regex>,
}

impl NameNormalizer {
    /// Compile the rule patterns.
    pub fn new(rules: NamingRules) -> Result<Self> {
        let hash = compile(&rules.hash_pattern)?;
        let timestamp = compile(&rules.timestamp_pattern)?;
        Ok(Self {
            rules,
            hash,
            timestamp,
        })
    }

    pub fn rules(&self) -> &NamingRules {
        &self.rules
    }

    /// Canonical dataset name. Idempotent: the rule chain is applied until it
    /// no longer changes the name.
    pub fn normalize(&self, raw: &str) -> String {
        let mut current = raw.to_string();
        // Every changing pass shortens the name, except the jump to the
        // placeholder, so this bound is never the exit in practice.
        for _ in 0..raw.len() + 8 {
            let mut next = self.apply_rules(&current);
            if next.is_empty() {
                next = self.rules.placeholder.clone();
            }
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    /// Shard table for a raw dataset identifier, always a valid identifier.
    pub fn shard_table_name(&self, raw: &str) -> String {
        let max_len = self.rules.max_identifier_len.clamp(8, MAX_IDENTIFIER_LEN);

        let mut body = sanitize_identifier(&self.normalize(raw));
        if body.is_empty() {
            body = sanitize_identifier(&self.rules.placeholder);
        }
        if body.is_empty() {
            body = FALLBACK_PLACEHOLDER.to_string();
        }

        let mut name = sanitize_identifier(&format!("{}{}", self.rules.shard_prefix, body));
        truncate_identifier(&mut name, max_len);

        if name.starts_with(|c: char| c.is_ascii_digit()) {
            let guard = if self.rules.sanitize_char.is_ascii_lowercase() {
                self.rules.sanitize_char
            } else {
                't'
            };
            name.insert(0, guard);
            truncate_identifier(&mut name, max_len);
        }

        if name.is_empty() {
            name = FALLBACK_PLACEHOLDER.to_string();
        }

        // `lane_test` would be mistaken for a helper table and left out of the view
        if reserved_suffix(&name).is_some() {
            truncate_identifier(&mut name, max_len - RESERVED_SUFFIX_GUARD.len());
            name.push_str(RESERVED_SUFFIX_GUARD);
        }
        name
    }

    /// Column identifier for a dynamic attribute key. Keys that would shadow a
    /// base column or start with a digit get an `attr_` prefix.
    pub fn column_name(&self, raw: &str) -> String {
        let mut name = sanitize_identifier(raw);
        if name.is_empty() {
            return "attr".to_string();
        }
        if RESERVED_COLUMNS.contains(&name.as_str())
            || name.starts_with(|c: char| c.is_ascii_digit())
        {
            name = format!("attr_{}", name);
        }
        truncate_identifier(&mut name, MAX_IDENTIFIER_LEN);
        name
    }

    /// Everything that makes `table_name` unusable as a shard table.
    pub fn validate(&self, table_name: &str) -> Vec<NameIssue> {
        let mut issues = Vec::new();
        let sep = self.rules.separator;

        let Some(first) = table_name.chars().next() else {
            issues.push(NameIssue::Empty);
            return issues;
        };

        let max = self.rules.max_identifier_len.clamp(8, MAX_IDENTIFIER_LEN);
        if table_name.len() > max {
            issues.push(NameIssue::TooLong {
                len: table_name.len(),
                max,
            });
        }
        if first == sep {
            issues.push(NameIssue::LeadingSeparator);
        } else if !first.is_ascii_lowercase() {
            issues.push(NameIssue::InvalidStart(first));
        }
        if let Some(bad) = table_name
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == sep))
        {
            issues.push(NameIssue::InvalidCharacter(bad));
        }
        if table_name.contains(&format!("{sep}{sep}")) {
            issues.push(NameIssue::ConsecutiveSeparators);
        }
        if table_name.len() > 1 && table_name.ends_with(sep) {
            issues.push(NameIssue::TrailingSeparator);
        }
        if !self.rules.shard_prefix.is_empty() && !table_name.starts_with(&self.rules.shard_prefix)
        {
            issues.push(NameIssue::MissingShardPrefix);
        }
        if let Some(suffix) = reserved_suffix(table_name) {
            issues.push(NameIssue::ReservedSuffix(suffix));
        }

        issues
    }

    /// Canonical name recovered from a shard table name.
    pub fn dataset_from_table<'a>(&self, table_name: &'a str) -> &'a str {
        let body = table_name
            .strip_prefix(self.rules.shard_prefix.as_str())
            .unwrap_or(table_name);
        match body.strip_suffix(RESERVED_SUFFIX_GUARD) {
            Some(guarded) if reserved_suffix(guarded).is_some() => guarded,
            _ => body,
        }
    }

    fn apply_rules(&self, name: &str) -> String {
        let mut rest = name;
        if !self.rules.strip_prefix.is_empty() {
            while let Some(stripped) = rest.strip_prefix(self.rules.strip_prefix.as_str()) {
                rest = stripped;
            }
        }

        let mut out = rest.to_string();
        if !self.rules.infix_marker.is_empty() {
            if let Some(idx) = out.find(self.rules.infix_marker.as_str()) {
                out.truncate(idx);
            }
        }
        if let Some(hash) = &self.hash {
            if let Some(m) = hash.find(&out) {
                out.truncate(m.start());
            }
        }
        if let Some(timestamp) = &self.timestamp {
            while let Some(m) = timestamp.find(&out) {
                if m.start() == out.len() {
                    break;
                }
                out.truncate(m.start());
            }
        }

        collapse_separators(&out, self.rules.separator)
    }
}

impl Default for NameNormalizer {
    fn default() -> Self {
        let rules = NamingRules::default();
        Self::new(rules.clone()).unwrap_or_else(|e| {
            warn!(error = %e, "Default naming patterns failed to compile, using literal rules only");
            Self {
                rules,
                hash: None,
                timestamp: None,
            }
        })
    }
}

/// Two or more raw dataset names that resolve to the same shard table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameCollision {
    pub table_name: String,
    pub raw_names: Vec<String>,
}

/// Raw-name → table bookkeeping for one run
#[derive(Debug, Default)]
pub struct NameRegistry {
    tables: BTreeMap<String, BTreeSet<String>>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mapping and return the table name. Distinct raw names sharing
    /// a table are logged; the shared table is still used.
    pub fn register(&mut self, raw: &str, table_name: &str) -> String {
        let raws = self.tables.entry(table_name.to_string()).or_default();
        if raws.insert(raw.to_string()) && raws.len() > 1 {
            warn!(
                table = %table_name,
                raw_names = ?raws,
                "Distinct source datasets map to the same shard table"
            );
        }
        table_name.to_string()
    }

    pub fn collisions(&self) -> Vec<NameCollision> {
        self.tables
            .iter()
            .filter(|(_, raws)| raws.len() > 1)
            .map(|(table, raws)| NameCollision {
                table_name: table.clone(),
                raw_names: raws.iter().cloned().collect(),
            })
            .collect()
    }
}

fn compile(pattern: &str) -> Result<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Ok(Some(Regex::new(pattern)?))
}

fn collapse_separators(input: &str, sep: char) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c == sep && out.ends_with(sep) {
            continue;
        }
        out.push(c);
    }
    out.trim_matches(sep).to_string()
}

/// Lower-case, replace everything outside `[a-z0-9]` with `_`, collapse and trim.
fn sanitize_identifier(input: &str) -> String {
    let mapped: String = input
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '_'
            }
        })
        .collect();
    collapse_separators(&mapped, '_')
}

/// Input must be ASCII (post-sanitize), so byte truncation is char-safe.
fn truncate_identifier(name: &mut String, max_len: usize) {
    if name.len() > max_len {
        name.truncate(max_len);
    }
    while name.ends_with('_') {
        name.pop();
    }
}

//! Input manifest loading
//!
//! A manifest lists record tokens grouped by source dataset name. The format
//! is picked from the file extension:
//!
//! | Extension          | Layout                                                   |
//! |--------------------|----------------------------------------------------------|
//! | `.json`            | `[{"name", "tokens", "metadata"}]` or `{"name": [tokens]}` |
//! | `.jsonl`, `.ndjson`| one `{"dataset", "token"}` object per line               |
//! | `.csv`, `.tsv`     | header with `dataset` and `token`; other columns become group metadata |
//! | anything else      | `dataset token [token...]` per line, `#` starts a comment |
//!
//! Tokens are de-duplicated per group keeping the first occurrence, and groups
//! keep the order in which they first appear (the object form of `.json` is
//! ordered by name).

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{IngestError, IngestResult};
use crate::models::SourceDataset;
use sceneshard_common::NameNormalizer;

/// Manifest file layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Json,
    JsonLines,
    Csv,
    Tsv,
    Text,
}

impl ManifestFormat {
    pub fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match extension.as_deref() {
            Some("json") => Self::Json,
            Some("jsonl") | Some("ndjson") => Self::JsonLines,
            Some("csv") => Self::Csv,
            Some("tsv") => Self::Tsv,
            _ => Self::Text,
        }
    }
}

/// Tokens of one source dataset
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestGroup {
    pub name: String,
    pub tokens: Vec<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub groups: Vec<ManifestGroup>,
}

impl Manifest {
    pub fn token_count(&self) -> usize {
        self.groups.iter().map(|g| g.tokens.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.token_count() == 0
    }

    /// Resolve group names into source datasets
    pub fn into_datasets(self, names: &NameNormalizer) -> Vec<SourceDataset> {
        self.groups
            .into_iter()
            .map(|g| SourceDataset::new(&g.name, g.tokens, g.metadata, names))
            .collect()
    }
}

/// Accumulates groups in first-appearance order
#[derive(Default)]
struct ManifestBuilder {
    groups: Vec<ManifestGroup>,
    index: HashMap<String, usize>,
    seen: Vec<HashSet<String>>,
}

impl ManifestBuilder {
    fn group(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.groups.len();
        self.groups.push(ManifestGroup {
            name: name.to_string(),
            ..ManifestGroup::default()
        });
        self.seen.push(HashSet::new());
        self.index.insert(name.to_string(), idx);
        idx
    }

    fn push_token(&mut self, name: &str, token: &str) {
        let token = token.trim();
        if token.is_empty() {
            return;
        }
        let idx = self.group(name);
        if self.seen[idx].insert(token.to_string()) {
            self.groups[idx].tokens.push(token.to_string());
        }
    }

    fn merge_metadata(&mut self, name: &str, metadata: HashMap<String, String>) {
        let idx = self.group(name);
        for (key, value) in metadata {
            self.groups[idx].metadata.entry(key).or_insert(value);
        }
    }

    fn build(self) -> Manifest {
        Manifest {
            groups: self
                .groups
                .into_iter()
                .filter(|g| !g.tokens.is_empty())
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct JsonGroup {
    #[serde(alias = "dataset")]
    name: String,
    #[serde(default)]
    tokens: Vec<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonManifest {
    Groups(Vec<JsonGroup>),
    ByName(std::collections::BTreeMap<String, Vec<String>>),
}

#[derive(Deserialize)]
struct JsonLine {
    #[serde(alias = "name")]
    dataset: String,
    token: String,
}

/// Load a manifest, detecting the format from the extension
pub fn load_manifest(path: &Path) -> IngestResult<Manifest> {
    let format = ManifestFormat::from_path(path);
    debug!(path = %path.display(), ?format, "Loading manifest");

    let manifest = match format {
        ManifestFormat::Json => parse_json(&read_to_string(path)?)?,
        ManifestFormat::JsonLines => load_json_lines(path)?,
        ManifestFormat::Csv => parse_delimited(read_to_string(path)?.as_bytes(), b',')?,
        ManifestFormat::Tsv => parse_delimited(read_to_string(path)?.as_bytes(), b'\t')?,
        ManifestFormat::Text => parse_text(&read_to_string(path)?)?,
    };

    if manifest.is_empty() {
        return Err(IngestError::manifest(format!(
            "manifest {} contains no tokens",
            path.display()
        )));
    }

    info!(
        path = %path.display(),
        groups = manifest.groups.len(),
        tokens = manifest.token_count(),
        "Manifest loaded"
    );

    Ok(manifest)
}

fn read_to_string(path: &Path) -> IngestResult<String> {
    fs::read_to_string(path).map_err(|e| {
        IngestError::manifest(format!("cannot read manifest {}: {}", path.display(), e))
    })
}

pub fn parse_json(content: &str) -> IngestResult<Manifest> {
    let parsed: JsonManifest = serde_json::from_str(content)
        .map_err(|e| IngestError::manifest(format!("invalid JSON manifest: {}", e)))?;

    let mut builder = ManifestBuilder::default();
    match parsed {
        JsonManifest::Groups(groups) => {
            for group in groups {
                builder.group(&group.name);
                builder.merge_metadata(&group.name, group.metadata);
                for token in &group.tokens {
                    builder.push_token(&group.name, token);
                }
            }
        },
        JsonManifest::ByName(map) => {
            for (name, tokens) in map {
                for token in &tokens {
                    builder.push_token(&name, token);
                }
            }
        },
    }
    Ok(builder.build())
}

fn load_json_lines(path: &Path) -> IngestResult<Manifest> {
    let content = read_to_string(path)?;

    let mut builder = ManifestBuilder::default();
    for (idx, raw) in content.lines().enumerate() {
        if raw.trim().is_empty() {
            continue;
        }
        let line: JsonLine = serde_json::from_str(raw).map_err(|e| {
            IngestError::manifest(format!("invalid JSON line {}: {}", idx + 1, e))
        })?;
        builder.push_token(&line.dataset, &line.token);
    }
    Ok(builder.build())
}

pub fn parse_delimited(content: &[u8], delimiter: u8) -> IngestResult<Manifest> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(content);

    let headers = reader.headers()?.clone();
    let position = |column: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(column));
    let dataset_idx = position("dataset")
        .or_else(|| position("name"))
        .ok_or_else(|| IngestError::manifest("manifest header lacks a 'dataset' column"))?;
    let token_idx =
        position("token").ok_or_else(|| IngestError::manifest("manifest header lacks a 'token' column"))?;

    let mut builder = ManifestBuilder::default();
    for record in reader.records() {
        let record = record?;
        let (Some(dataset), Some(token)) = (record.get(dataset_idx), record.get(token_idx)) else {
            continue;
        };
        if dataset.is_empty() {
            continue;
        }

        let extra: HashMap<String, String> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != dataset_idx && *i != token_idx)
            .filter_map(|(i, h)| {
                record
                    .get(i)
                    .filter(|v| !v.is_empty())
                    .map(|v| (h.to_string(), v.to_string()))
            })
            .collect();

        builder.merge_metadata(dataset, extra);
        builder.push_token(dataset, token);
    }
    Ok(builder.build())
}

pub fn parse_text(content: &str) -> IngestResult<Manifest> {
    let mut builder = ManifestBuilder::default();
    for (idx, raw_line) in content.lines().enumerate() {
        let line = raw_line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split_whitespace();
        let dataset = fields.next().unwrap_or_default();
        let tokens: Vec<&str> = fields.collect();
        if tokens.is_empty() {
            return Err(IngestError::manifest(format!(
                "line {}: expected '<dataset> <token>', got '{}'",
                idx + 1,
                line
            )));
        }
        for token in tokens {
            builder.push_token(dataset, token);
        }
    }
    Ok(builder.build())
}

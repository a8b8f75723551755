//! Durable per-dataset progress ledgers
//!
//! Every source dataset gets its own directory under the work dir holding two
//! CSV files:
//!
//! - `successful.csv`: `token,batch_number,recorded_at`, one row per token.
//!   Rewritten atomically (temp file + rename) on every flush; a token marked
//!   twice keeps its latest row.
//! - `failed.csv`: `token,stage,reason,batch_number,recorded_at`, append-only.
//!   Entries for tokens that later succeed stay in the file and are filtered
//!   out when listing still-failing tokens.
//!
//! Outcomes are buffered in memory and flushed when the buffer fills, on
//! [`ProgressTracker::finalize`], and on drop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

use crate::config::DEFAULT_PROGRESS_BUFFER;
use crate::error::IngestResult;
use crate::models::Stage;

pub const SUCCESS_LEDGER: &str = "successful.csv";
pub const FAILURE_LEDGER: &str = "failed.csv";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessEntry {
    pub token: String,
    pub batch_number: u64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub token: String,
    pub stage: Stage,
    pub reason: String,
    pub batch_number: u64,
    pub recorded_at: DateTime<Utc>,
}

/// File locations of one dataset's ledgers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerPaths {
    pub successful: PathBuf,
    pub failed: PathBuf,
}

impl LedgerPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            successful: dir.join(SUCCESS_LEDGER),
            failed: dir.join(FAILURE_LEDGER),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressStatistics {
    pub success_count: usize,
    /// Distinct tokens whose latest outcome is a failure
    pub failure_count: usize,
    pub failures_by_stage: BTreeMap<Stage, usize>,
}

impl ProgressStatistics {
    pub fn merge(&mut self, other: &ProgressStatistics) {
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        for (stage, count) in &other.failures_by_stage {
            *self.failures_by_stage.entry(*stage).or_default() += count;
        }
    }
}

impl fmt::Display for ProgressStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} successful, {} failed", self.success_count, self.failure_count)?;
        if !self.failures_by_stage.is_empty() {
            let stages: Vec<String> = self
                .failures_by_stage
                .iter()
                .map(|(stage, count)| format!("{}={}", stage, count))
                .collect();
            write!(f, " ({})", stages.join(", "))?;
        }
        Ok(())
    }
}

/// Buffered success/failure ledger for one source dataset.
///
/// Not shared between workers: each dataset is processed by exactly one
/// worker, which owns the tracker for its directory.
#[derive(Debug)]
pub struct ProgressTracker {
    dir: PathBuf,
    paths: LedgerPaths,
    buffer_size: usize,
    /// Latest success row per token, in first-success order
    successes: Vec<SuccessEntry>,
    success_index: HashMap<String, usize>,
    /// All failures, loaded and recorded; `failures[flushed_failures..]` are pending
    failures: Vec<FailureEntry>,
    flushed_failures: usize,
    pending_successes: usize,
}

impl ProgressTracker {
    /// Open (or create) the ledger directory `<work_dir>/<group>` and load
    /// what earlier runs recorded.
    pub fn open(work_dir: &Path, group: &str, buffer_size: usize) -> IngestResult<Self> {
        let dir = work_dir.join(group);
        fs::create_dir_all(&dir)?;
        let paths = LedgerPaths::in_dir(&dir);

        let mut tracker = Self {
            dir,
            buffer_size: buffer_size.max(1),
            successes: Vec::new(),
            success_index: HashMap::new(),
            failures: Vec::new(),
            flushed_failures: 0,
            pending_successes: 0,
            paths,
        };

        for entry in read_ledger::<SuccessEntry>(&tracker.paths.successful)? {
            tracker.upsert_success(entry);
        }
        tracker.failures = read_ledger::<FailureEntry>(&tracker.paths.failed)?;
        tracker.flushed_failures = tracker.failures.len();

        debug!(
            dir = %tracker.dir.display(),
            successful = tracker.successes.len(),
            failed = tracker.failures.len(),
            "Progress ledger loaded"
        );

        Ok(tracker)
    }

    pub fn with_default_buffer(work_dir: &Path, group: &str) -> IngestResult<Self> {
        Self::open(work_dir, group, DEFAULT_PROGRESS_BUFFER)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ledger_paths(&self) -> &LedgerPaths {
        &self.paths
    }

    pub fn is_successful(&self, token: &str) -> bool {
        self.success_index.contains_key(token)
    }

    /// Candidates not yet recorded as successful, in input order
    pub fn remaining<S: AsRef<str>>(&self, candidates: &[S]) -> Vec<String> {
        candidates
            .iter()
            .map(AsRef::as_ref)
            .filter(|t| !self.is_successful(t))
            .map(str::to_string)
            .collect()
    }

    pub fn mark_success<I, S>(&mut self, tokens: I, batch_number: u64) -> IngestResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let recorded_at = Utc::now();
        for token in tokens {
            self.upsert_success(SuccessEntry {
                token: token.into(),
                batch_number,
                recorded_at,
            });
            self.pending_successes += 1;
        }
        self.flush_if_full()
    }

    pub fn mark_failure(
        &mut self,
        token: &str,
        reason: &str,
        batch_number: u64,
        stage: Stage,
    ) -> IngestResult<()> {
        self.failures.push(FailureEntry {
            token: token.to_string(),
            stage,
            reason: reason.to_string(),
            batch_number,
            recorded_at: Utc::now(),
        });
        self.flush_if_full()
    }

    /// Latest failure per token that has not succeeded since, in
    /// first-failure order
    pub fn still_failing_entries(&self) -> Vec<&FailureEntry> {
        let mut order: Vec<&str> = Vec::new();
        let mut latest: HashMap<&str, &FailureEntry> = HashMap::new();

        for entry in &self.failures {
            if self.is_successful(&entry.token) {
                continue;
            }
            if latest.insert(entry.token.as_str(), entry).is_none() {
                order.push(entry.token.as_str());
            }
        }

        order.into_iter().filter_map(|t| latest.get(t).copied()).collect()
    }

    pub fn still_failing(&self) -> Vec<String> {
        self.still_failing_entries()
            .into_iter()
            .map(|e| e.token.clone())
            .collect()
    }

    pub fn statistics(&self) -> ProgressStatistics {
        let failing = self.still_failing_entries();
        let mut failures_by_stage = BTreeMap::new();
        for entry in &failing {
            *failures_by_stage.entry(entry.stage).or_default() += 1;
        }

        ProgressStatistics {
            success_count: self.successes.len(),
            failure_count: failing.len(),
            failures_by_stage,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending_successes + (self.failures.len() - self.flushed_failures)
    }

    /// Write buffered outcomes to disk
    pub fn flush(&mut self) -> IngestResult<()> {
        if self.pending_successes > 0 {
            self.rewrite_successes()?;
            self.pending_successes = 0;
        }

        if self.flushed_failures < self.failures.len() {
            self.append_failures()?;
            self.flushed_failures = self.failures.len();
        }

        Ok(())
    }

    /// Flush everything still buffered. Safe to call more than once.
    pub fn finalize(&mut self) -> IngestResult<()> {
        self.flush()?;
        debug!(dir = %self.dir.display(), "Progress ledger finalized");
        Ok(())
    }

    fn upsert_success(&mut self, entry: SuccessEntry) {
        match self.success_index.get(&entry.token) {
            Some(&idx) => self.successes[idx] = entry,
            None => {
                self.success_index.insert(entry.token.clone(), self.successes.len());
                self.successes.push(entry);
            },
        }
    }

    fn flush_if_full(&mut self) -> IngestResult<()> {
        if self.pending() >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    fn rewrite_successes(&self) -> IngestResult<()> {
        let tmp = self.dir.join(format!("{}.tmp", SUCCESS_LEDGER));
        {
            let mut writer = csv::Writer::from_path(&tmp)?;
            for entry in &self.successes {
                writer.serialize(entry)?;
            }
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.paths.successful)?;
        Ok(())
    }

    fn append_failures(&self) -> IngestResult<()> {
        let needs_header = fs::metadata(&self.paths.failed)
            .map(|m| m.len() == 0)
            .unwrap_or(true);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.paths.failed)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);

        for entry in &self.failures[self.flushed_failures..] {
            writer.serialize(entry)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        if self.pending() == 0 {
            return;
        }
        if let Err(e) = self.flush() {
            error!(dir = %self.dir.display(), error = %e, "Failed to flush progress ledger on drop");
        }
    }
}

/// Rows of one ledger file. Unparseable rows (for example a line cut short
/// by a crash) are skipped with a warning.
fn read_ledger<T: for<'de> Deserialize<'de>>(path: &Path) -> IngestResult<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let mut entries = Vec::new();
    for (idx, row) in reader.deserialize::<T>().enumerate() {
        match row {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(path = %path.display(), row = idx + 1, error = %e, "Skipping unreadable ledger row"),
        }
    }
    Ok(entries)
}

/// Statistics for every dataset directory under `work_dir`, sorted by name
pub fn aggregate_statistics(work_dir: &Path) -> IngestResult<Vec<(String, ProgressStatistics)>> {
    if !work_dir.exists() {
        return Ok(Vec::new());
    }

    let mut groups = Vec::new();
    for entry in fs::read_dir(work_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let paths = LedgerPaths::in_dir(&entry.path());
        if !paths.successful.exists() && !paths.failed.exists() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let tracker = ProgressTracker::open(work_dir, &name, DEFAULT_PROGRESS_BUFFER)?;
        groups.push((name, tracker.statistics()));
    }

    groups.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(groups)
}

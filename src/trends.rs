//! Persistent per-test failure counters.
//!
//! When `gather_trends` is on, every failed attempt increments a counter keyed
//! by the canonical test string (`<locator> @<browser>`). Counters accumulate
//! across runs in a JSON file, by default `.testfleet/trends.json`:
//!
//! ```json
//! {
//!   "tests/login.js @chrome": {
//!     "failures": 4,
//!     "last_failure": "2026-03-02T10:14:07Z"
//!   }
//! }
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use testfleet::trends::TrendStore;
//!
//! let path = Path::new(".testfleet/trends.json");
//! let mut run_counts = TrendStore::default();
//! run_counts.record_failure("tests/login.js @chrome");
//! run_counts.merge_into(path).unwrap();
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Failure history of one test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendEntry {
    pub failures: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
}

/// Map of test string → failure history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrendStore {
    entries: BTreeMap<String, TrendEntry>,
}

impl TrendStore {
    /// Loads the store from `path`.
    ///
    /// A missing or unreadable file yields an empty store.
    pub fn load(path: &Path) -> Self {
        tracing::debug!("Loading trends from: {}", path.display());

        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(entries) => Self { entries },
                Err(e) => {
                    tracing::warn!("Failed to parse trends file, starting fresh: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read trends file, starting fresh: {}", e);
                Self::default()
            }
        }
    }

    /// Writes the store to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let contents =
            serde_json::to_string_pretty(&self.entries).context("Failed to serialize trends")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write trends file {}", path.display()))?;

        tracing::debug!("Saved {} trend entries", self.entries.len());
        Ok(())
    }

    pub fn record_failure(&mut self, test: &str) {
        let entry = self.entries.entry(test.to_string()).or_default();
        entry.failures += 1;
        entry.last_failure = Some(Utc::now());
    }

    /// Adds another store's counters to this one.
    pub fn merge(&mut self, other: &TrendStore) {
        for (test, theirs) in &other.entries {
            let ours = self.entries.entry(test.clone()).or_default();
            ours.failures += theirs.failures;
            ours.last_failure = ours.last_failure.max(theirs.last_failure);
        }
    }

    /// Folds this run's counters into the file at `path`.
    pub fn merge_into(&self, path: &Path) -> Result<()> {
        let mut stored = Self::load(path);
        stored.merge(self);
        stored.save(path)
    }

    pub fn get(&self, test: &str) -> Option<&TrendEntry> {
        self.entries.get(test)
    }

    pub fn failures(&self, test: &str) -> u64 {
        self.get(test).map_or(0, |entry| entry.failures)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

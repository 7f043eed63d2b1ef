//! Extraction and persistence seams.
//!
//! The scheduler hands raw page content to an `Extractor` and writes
//! what comes back through a `RunStore`. Both are traits so tests and
//! alternative backends plug in without touching the dispatch path.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use pricewatch::{JobRun, ProductSnapshot};

use crate::error::{RuntimeError, RuntimeResult};

/// Extraction failure; carries enough context to log, never fatal to
/// the surrounding run.
#[derive(Debug, thiserror::Error)]
#[error("extraction failed for {url}: {reason}")]
pub struct ExtractError {
    pub url: String,
    pub reason: String,
}

/// Turns raw page content into product snapshots.
pub trait Extractor: Send + Sync {
    fn extract(
        &self,
        url: &str,
        raw: &str,
        captured_at: DateTime<Utc>,
    ) -> Result<Vec<ProductSnapshot>, ExtractError>;
}

/// Persistence for run records and extracted snapshots.
///
/// Writes are idempotent by natural key: `ProductSnapshot::key()` for
/// snapshots, `JobRun::key()` for runs. Re-writing the same key is a
/// no-op, so retried runs never duplicate rows.
pub trait RunStore: Send + Sync {
    fn write_snapshot(&self, snapshot: &ProductSnapshot) -> RuntimeResult<()>;
    fn write_run(&self, run: &JobRun) -> RuntimeResult<()>;
    fn snapshots(&self, product_id: &str) -> RuntimeResult<Vec<ProductSnapshot>>;
}

/// In-memory store for tests and the `validate` command.
#[derive(Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<String, ProductSnapshot>>,
    runs: Mutex<HashMap<String, JobRun>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_count(&self) -> usize {
        match self.runs.lock() {
            Ok(runs) => runs.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn runs(&self) -> Vec<JobRun> {
        let guard = match self.runs.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut runs: Vec<JobRun> = guard.values().cloned().collect();
        runs.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        runs
    }
}

impl RunStore for MemoryStore {
    fn write_snapshot(&self, snapshot: &ProductSnapshot) -> RuntimeResult<()> {
        let mut guard = self
            .snapshots
            .lock()
            .map_err(|_| RuntimeError::Store("snapshot lock poisoned".to_string()))?;
        guard.entry(snapshot.key()).or_insert_with(|| snapshot.clone());
        Ok(())
    }

    fn write_run(&self, run: &JobRun) -> RuntimeResult<()> {
        let mut guard = self
            .runs
            .lock()
            .map_err(|_| RuntimeError::Store("run lock poisoned".to_string()))?;
        guard.insert(run.key(), run.clone());
        Ok(())
    }

    fn snapshots(&self, product_id: &str) -> RuntimeResult<Vec<ProductSnapshot>> {
        let guard = self
            .snapshots
            .lock()
            .map_err(|_| RuntimeError::Store("snapshot lock poisoned".to_string()))?;
        let mut found: Vec<ProductSnapshot> = guard
            .values()
            .filter(|s| s.product_id == product_id)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.captured_at);
        Ok(found)
    }
}

/// Append-only JSONL store, one file per record kind under a data
/// directory. Idempotence is enforced by a key set loaded at startup.
pub struct JsonlStore {
    snapshot_path: PathBuf,
    run_path: PathBuf,
    seen: Mutex<std::collections::HashSet<String>>,
}

impl JsonlStore {
    pub fn open(data_dir: &Path) -> RuntimeResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let snapshot_path = data_dir.join("snapshots.jsonl");
        let run_path = data_dir.join("runs.jsonl");

        let mut seen = std::collections::HashSet::new();
        for line in read_lines(&snapshot_path)? {
            let snapshot: ProductSnapshot = serde_json::from_str(&line)?;
            seen.insert(snapshot.key());
        }
        for line in read_lines(&run_path)? {
            let run: JobRun = serde_json::from_str(&line)?;
            seen.insert(run.key());
        }

        Ok(Self {
            snapshot_path,
            run_path,
            seen: Mutex::new(seen),
        })
    }

    fn append(&self, path: &Path, key: String, json: String) -> RuntimeResult<()> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| RuntimeError::Store("key set lock poisoned".to_string()))?;
        if !seen.insert(key) {
            return Ok(());
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{json}")?;
        Ok(())
    }
}

impl RunStore for JsonlStore {
    fn write_snapshot(&self, snapshot: &ProductSnapshot) -> RuntimeResult<()> {
        self.append(
            &self.snapshot_path,
            snapshot.key(),
            serde_json::to_string(snapshot)?,
        )
    }

    fn write_run(&self, run: &JobRun) -> RuntimeResult<()> {
        self.append(&self.run_path, run.key(), serde_json::to_string(run)?)
    }

    fn snapshots(&self, product_id: &str) -> RuntimeResult<Vec<ProductSnapshot>> {
        let mut found = Vec::new();
        for line in read_lines(&self.snapshot_path)? {
            let snapshot: ProductSnapshot = serde_json::from_str(&line)?;
            if snapshot.product_id == product_id {
                found.push(snapshot);
            }
        }
        found.sort_by_key(|s| s.captured_at);
        Ok(found)
    }
}

fn read_lines(path: &Path) -> RuntimeResult<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(raw.lines().map(str::to_string).collect())
}

/// Reference extractor for pages that embed a JSON product payload.
///
/// Expects the raw content to be (or contain nothing but) a JSON object
/// or array of objects with `id`, `title`, `price` and optional
/// `currency`, `available`, `seller` fields.
pub struct JsonExtractor;

#[derive(Deserialize)]
struct RawProduct {
    id: String,
    title: String,
    price: f64,
    #[serde(default = "default_currency")]
    currency: String,
    #[serde(default = "default_available")]
    available: bool,
    #[serde(default)]
    seller: Option<String>,
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_available() -> bool {
    true
}

impl Extractor for JsonExtractor {
    fn extract(
        &self,
        url: &str,
        raw: &str,
        captured_at: DateTime<Utc>,
    ) -> Result<Vec<ProductSnapshot>, ExtractError> {
        let products: Vec<RawProduct> = match serde_json::from_str::<Vec<RawProduct>>(raw) {
            Ok(list) => list,
            Err(_) => match serde_json::from_str::<RawProduct>(raw) {
                Ok(one) => vec![one],
                Err(e) => {
                    return Err(ExtractError {
                        url: url.to_string(),
                        reason: e.to_string(),
                    })
                }
            },
        };

        Ok(products
            .into_iter()
            .map(|p| ProductSnapshot {
                product_id: p.id,
                title: Some(p.title),
                price: Some(p.price),
                currency: Some(p.currency),
                available: p.available,
                seller: p.seller,
                captured_at,
            })
            .collect())
    }
}

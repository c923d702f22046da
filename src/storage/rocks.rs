//! RocksDB-backed store
//!
//! Key layout (values are JSON):
//! - `exp:{experiment_id}` experiment with its variants and metrics
//! - `asg:{experiment_id}:{user_id}` assignment
//! - `uasg:{user_id}:{experiment_id}` assignment copy for per-user scans
//! - `res:{experiment_id}:{variant_id}:{metric_id}` result row
//!
//! Uniqueness checks and compare-and-swap run under a single write lock, so a
//! store instance is the authority for one database directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{ExperimentFilter, ExperimentStore, StoreResult};
use crate::errors::StoreError;
use crate::experiment::types::{
    Assignment, Comparison, Experiment, MetricResult, ResultKey, VariantId,
};

const EXPERIMENT_PREFIX: &str = "exp:";
const ASSIGNMENT_PREFIX: &str = "asg:";
const USER_ASSIGNMENT_PREFIX: &str = "uasg:";
const RESULT_PREFIX: &str = "res:";

/// Helper trait to iterate over RocksDB results, logging instead of dropping errors
trait LogErrors<T> {
    fn log_errors(self) -> impl Iterator<Item = T>;
}

impl<I, T, E> LogErrors<T> for I
where
    I: Iterator<Item = Result<T, E>>,
    E: std::fmt::Display,
{
    fn log_errors(self) -> impl Iterator<Item = T> {
        self.filter_map(|r| match r {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("RocksDB iterator error (continuing): {}", e);
                None
            }
        })
    }
}

/// Write durability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// fsync on every write; survives power loss
    Sync,
    /// Buffered in the OS page cache; survives process crashes only
    #[default]
    Async,
}

impl std::str::FromStr for WriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(WriteMode::Sync),
            "async" => Ok(WriteMode::Async),
            other => Err(format!("unknown write mode: {other} (expected sync or async)")),
        }
    }
}

fn experiment_key(experiment_id: &str) -> String {
    format!("{EXPERIMENT_PREFIX}{experiment_id}")
}

fn assignment_key(experiment_id: &str, user_id: &str) -> String {
    format!("{ASSIGNMENT_PREFIX}{experiment_id}:{user_id}")
}

fn user_assignment_key(user_id: &str, experiment_id: &str) -> String {
    format!("{USER_ASSIGNMENT_PREFIX}{user_id}:{experiment_id}")
}

fn result_key(key: &ResultKey) -> String {
    format!(
        "{RESULT_PREFIX}{}:{}:{}",
        key.experiment_id, key.variant_id, key.metric_id
    )
}

pub struct RocksStore {
    db: Arc<DB>,
    path: PathBuf,
    write_mode: WriteMode,
    write_lock: Mutex<()>,
}

impl RocksStore {
    pub fn open(path: &Path, write_mode: WriteMode) -> StoreResult<Self> {
        std::fs::create_dir_all(path)
            .map_err(|e| StoreError::Backend(format!("create {}: {e}", path.display())))?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_manual_wal_flush(false);
        opts.set_max_background_jobs(2);

        let db = Arc::new(DB::open(&opts, path.join("experiments"))?);

        tracing::info!(
            path = %path.display(),
            write_mode = ?write_mode,
            "Experiment store opened"
        );

        Ok(Self {
            db,
            path: path.to_path_buf(),
            write_mode,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Force buffered writes to disk
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.write_mode == WriteMode::Sync);
        write_opts
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.db.put_opt(key.as_bytes(), bytes, &self.write_opts())?;
        Ok(())
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.db.get_pinned(key.as_bytes())?.is_some())
    }

    /// Decode every value under `prefix`. Undecodable rows are logged and skipped.
    fn scan_prefix<T: DeserializeOwned>(&self, prefix: &str) -> Vec<(String, T)> {
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));

        let mut found = Vec::new();
        for (key, value) in iter.log_errors() {
            let key = String::from_utf8_lossy(&key);
            if !key.starts_with(prefix) {
                break;
            }
            match serde_json::from_slice(&value) {
                Ok(decoded) => found.push((key.into_owned(), decoded)),
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping undecodable row"),
            }
        }
        found
    }

    fn scan_keys(&self, prefix: &str) -> Vec<Box<[u8]>> {
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));

        let mut keys = Vec::new();
        for (key, _) in iter.log_errors() {
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            keys.push(key);
        }
        keys
    }
}

impl ExperimentStore for RocksStore {
    fn insert_experiment(&self, experiment: &Experiment) -> StoreResult<()> {
        let key = experiment_key(&experiment.id);
        let _guard = self.write_lock.lock();
        if self.exists(&key)? {
            return Err(StoreError::Duplicate(format!("experiment {}", experiment.id)));
        }
        self.put_json(&key, experiment)
    }

    fn get_experiment(&self, experiment_id: &str) -> StoreResult<Option<Experiment>> {
        self.get_json(&experiment_key(experiment_id))
    }

    fn update_experiment(&self, experiment: &Experiment) -> StoreResult<()> {
        let key = experiment_key(&experiment.id);
        let _guard = self.write_lock.lock();
        if !self.exists(&key)? {
            return Err(StoreError::Backend(format!(
                "experiment {} does not exist",
                experiment.id
            )));
        }
        self.put_json(&key, experiment)
    }

    fn delete_experiment(&self, experiment_id: &str) -> StoreResult<bool> {
        let key = experiment_key(experiment_id);
        let _guard = self.write_lock.lock();
        let existed = self.exists(&key)?;

        let mut batch = WriteBatch::default();
        batch.delete(key.as_bytes());

        let assignments: Vec<(String, Assignment)> =
            self.scan_prefix(&format!("{ASSIGNMENT_PREFIX}{experiment_id}:"));
        for (asg_key, assignment) in &assignments {
            batch.delete(asg_key.as_bytes());
            batch.delete(user_assignment_key(&assignment.user_id, experiment_id).as_bytes());
        }
        for res_key in self.scan_keys(&format!("{RESULT_PREFIX}{experiment_id}:")) {
            batch.delete(res_key);
        }

        self.db.write_opt(batch, &self.write_opts())?;

        if existed {
            tracing::debug!(
                experiment_id = %experiment_id,
                assignments = assignments.len(),
                "Deleted experiment with its assignments and results"
            );
        }
        Ok(existed)
    }

    fn list_experiments(&self, filter: &ExperimentFilter) -> StoreResult<Vec<Experiment>> {
        let all = self
            .scan_prefix::<Experiment>(EXPERIMENT_PREFIX)
            .into_iter()
            .map(|(_, e)| e)
            .collect();
        Ok(filter.apply(all))
    }

    fn insert_assignment(&self, assignment: &Assignment) -> StoreResult<()> {
        let key = assignment_key(&assignment.experiment_id, &assignment.user_id);
        let _guard = self.write_lock.lock();
        if self.exists(&key)? {
            return Err(StoreError::Duplicate(format!(
                "assignment {}/{}",
                assignment.experiment_id, assignment.user_id
            )));
        }

        let bytes = serde_json::to_vec(assignment)?;
        let mut batch = WriteBatch::default();
        batch.put(key.as_bytes(), &bytes);
        batch.put(
            user_assignment_key(&assignment.user_id, &assignment.experiment_id).as_bytes(),
            &bytes,
        );
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn get_assignment(
        &self,
        experiment_id: &str,
        user_id: &str,
    ) -> StoreResult<Option<Assignment>> {
        self.get_json(&assignment_key(experiment_id, user_id))
    }

    fn assignments_for_user(&self, user_id: &str) -> StoreResult<Vec<Assignment>> {
        // User ids may contain ':', so the prefix can over-match; filter exactly.
        Ok(self
            .scan_prefix::<Assignment>(&format!("{USER_ASSIGNMENT_PREFIX}{user_id}:"))
            .into_iter()
            .map(|(_, a)| a)
            .filter(|a| a.user_id == user_id)
            .collect())
    }

    fn assignment_counts(&self, experiment_id: &str) -> StoreResult<BTreeMap<VariantId, u64>> {
        let mut counts = BTreeMap::new();
        for (_, assignment) in
            self.scan_prefix::<Assignment>(&format!("{ASSIGNMENT_PREFIX}{experiment_id}:"))
        {
            *counts.entry(assignment.variant_id).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn get_result(&self, key: &ResultKey) -> StoreResult<Option<MetricResult>> {
        self.get_json(&result_key(key))
    }

    fn compare_and_swap_result(
        &self,
        expected_version: Option<u64>,
        row: &MetricResult,
    ) -> StoreResult<()> {
        let key = result_key(&row.key);
        let _guard = self.write_lock.lock();
        let current = self.get_json::<MetricResult>(&key)?.map(|r| r.version);
        if current != expected_version {
            return Err(StoreError::Conflict(key));
        }
        self.put_json(&key, row)
    }

    fn set_comparison(&self, key: &ResultKey, comparison: Option<Comparison>) -> StoreResult<()> {
        let key = result_key(key);
        let _guard = self.write_lock.lock();
        if let Some(mut row) = self.get_json::<MetricResult>(&key)? {
            row.comparison = comparison;
            self.put_json(&key, &row)?;
        }
        Ok(())
    }

    fn results_for_experiment(&self, experiment_id: &str) -> StoreResult<Vec<MetricResult>> {
        Ok(self
            .scan_prefix::<MetricResult>(&format!("{RESULT_PREFIX}{experiment_id}:"))
            .into_iter()
            .map(|(_, r)| r)
            .collect())
    }
}

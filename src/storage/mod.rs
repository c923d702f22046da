//! Persistence seam for experiments, assignments and result rows
//!
//! Implementations must enforce two uniqueness constraints: one assignment per
//! (experiment, user) and one result row per (experiment, variant, metric).
//! The engine relies on the store, not on in-process locks, for both.

pub mod memory;
pub mod rocks;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::experiment::types::{
    Assignment, Comparison, Experiment, ExperimentStatus, MetricResult, ResultKey, VariantId,
};

pub use memory::InMemoryStore;
pub use rocks::{RocksStore, WriteMode};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Listing filter. Results are ordered by creation time, oldest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentFilter {
    pub status: Option<ExperimentStatus>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

impl ExperimentFilter {
    pub fn with_status(status: ExperimentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Apply status, ordering and pagination to an unordered scan
    pub(crate) fn apply(&self, mut experiments: Vec<Experiment>) -> Vec<Experiment> {
        if let Some(status) = self.status {
            experiments.retain(|e| e.status == status);
        }
        experiments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        experiments
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

pub trait ExperimentStore: Send + Sync {
    /// Fails with `Duplicate` if the id is taken
    fn insert_experiment(&self, experiment: &Experiment) -> StoreResult<()>;

    fn get_experiment(&self, experiment_id: &str) -> StoreResult<Option<Experiment>>;

    /// Overwrites an existing experiment record
    fn update_experiment(&self, experiment: &Experiment) -> StoreResult<()>;

    /// Removes the experiment with its assignments and results.
    /// Returns false if it did not exist.
    fn delete_experiment(&self, experiment_id: &str) -> StoreResult<bool>;

    fn list_experiments(&self, filter: &ExperimentFilter) -> StoreResult<Vec<Experiment>>;

    /// Fails with `Duplicate` if the (experiment, user) pair already has a row
    fn insert_assignment(&self, assignment: &Assignment) -> StoreResult<()>;

    fn get_assignment(&self, experiment_id: &str, user_id: &str)
        -> StoreResult<Option<Assignment>>;

    fn assignments_for_user(&self, user_id: &str) -> StoreResult<Vec<Assignment>>;

    /// Number of assignments per variant
    fn assignment_counts(&self, experiment_id: &str) -> StoreResult<BTreeMap<VariantId, u64>>;

    fn get_result(&self, key: &ResultKey) -> StoreResult<Option<MetricResult>>;

    /// Write `row` only if the stored version equals `expected_version`
    /// (`None` means the row must not exist yet). Fails with `Conflict` otherwise.
    fn compare_and_swap_result(
        &self,
        expected_version: Option<u64>,
        row: &MetricResult,
    ) -> StoreResult<()>;

    /// Overwrite the derived comparison fields without touching the version.
    /// A missing row is ignored.
    fn set_comparison(&self, key: &ResultKey, comparison: Option<Comparison>) -> StoreResult<()>;

    fn results_for_experiment(&self, experiment_id: &str) -> StoreResult<Vec<MetricResult>>;
}

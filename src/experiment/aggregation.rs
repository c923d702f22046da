//! Online aggregation of metric observations
//!
//! Each observation folds into its (experiment, variant, metric) row through a
//! compare-and-swap on the row version. Derived comparison fields are then
//! recomputed for the whole experiment; that pass is idempotent and
//! last-write-wins.

use chrono::{DateTime, Utc};

use super::analysis::{ExperimentAnalysis, StatisticalAnalyzer};
use super::types::{Experiment, MetricResult, ResultKey};
use crate::errors::{ExperimentError, Result, StoreError};
use crate::metrics::{METRIC_RECORD_TOTAL, RESULT_CAS_CONFLICTS_TOTAL};
use crate::storage::ExperimentStore;

pub struct MetricsAggregator<'a> {
    store: &'a dyn ExperimentStore,
    max_cas_retries: u32,
}

impl<'a> MetricsAggregator<'a> {
    pub fn new(store: &'a dyn ExperimentStore, max_cas_retries: u32) -> Self {
        Self {
            store,
            max_cas_retries: max_cas_retries.max(1),
        }
    }

    /// Fold one observation into its row and return the row as written
    pub fn record(
        &self,
        experiment: &Experiment,
        variant_id: &str,
        metric_id: &str,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<MetricResult> {
        if !value.is_finite() {
            METRIC_RECORD_TOTAL.with_label_values(&["rejected"]).inc();
            return Err(ExperimentError::invalid_input(
                "value",
                format!("must be a finite number, got {value}"),
            ));
        }
        if experiment.variant(variant_id).is_none() {
            METRIC_RECORD_TOTAL.with_label_values(&["rejected"]).inc();
            return Err(ExperimentError::VariantNotFound {
                experiment_id: experiment.id.clone(),
                variant_id: variant_id.to_string(),
            });
        }
        let metric = experiment.metric(metric_id).ok_or_else(|| {
            METRIC_RECORD_TOTAL.with_label_values(&["rejected"]).inc();
            ExperimentError::MetricNotFound {
                experiment_id: experiment.id.clone(),
                metric_id: metric_id.to_string(),
            }
        })?;
        if !metric.is_active {
            METRIC_RECORD_TOTAL.with_label_values(&["rejected"]).inc();
            return Err(ExperimentError::invalid_input(
                "metric_id",
                format!("metric {} is inactive", metric.name),
            ));
        }

        let key = ResultKey::new(&experiment.id, variant_id, metric_id);

        for attempt in 1..=self.max_cas_retries {
            let current = self.store.get_result(&key)?;
            let (expected, next) = match &current {
                Some(row) => (Some(row.version), row.observe(value, now)),
                None => (None, MetricResult::first(key.clone(), value, now)),
            };

            match self.store.compare_and_swap_result(expected, &next) {
                Ok(()) => {
                    METRIC_RECORD_TOTAL.with_label_values(&["recorded"]).inc();
                    tracing::debug!(
                        experiment_id = %key.experiment_id,
                        variant_id = %key.variant_id,
                        metric_id = %key.metric_id,
                        sample_size = next.sample_size,
                        mean = next.value,
                        "Metric observation recorded"
                    );
                    return Ok(next);
                }
                Err(StoreError::Conflict(_)) => {
                    RESULT_CAS_CONFLICTS_TOTAL.inc();
                    tracing::trace!(attempt, "Result row changed underneath us, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        METRIC_RECORD_TOTAL.with_label_values(&["conflict"]).inc();
        Err(ExperimentError::Conflict(format!(
            "result {}/{}/{} after {} attempts",
            key.experiment_id, key.variant_id, key.metric_id, self.max_cas_retries
        )))
    }

    /// Recompute comparisons from the authoritative means and write them back
    pub fn recompute(&self, experiment: &Experiment) -> Result<ExperimentAnalysis> {
        let results = self.store.results_for_experiment(&experiment.id)?;
        let analysis = StatisticalAnalyzer::analyze(experiment, &results);

        for metric in &analysis.metrics {
            for variant in &metric.variants {
                let key = ResultKey::new(&experiment.id, &variant.variant_id, &metric.metric_id);
                self.store.set_comparison(&key, variant.comparison)?;
            }
        }

        Ok(analysis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::experiment::types::{
        Comparison, ExperimentDefinition, MetricDefinition, MetricKind, VariantDefinition,
    };
    use crate::storage::{InMemoryStore, StoreResult};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn experiment() -> Experiment {
        ExperimentDefinition::builder("aggregation")
            .with_variant(VariantDefinition::new("a", 50.0))
            .with_variant(VariantDefinition::new("b", 50.0))
            .with_metric(MetricDefinition::new("score", MetricKind::Engagement))
            .build()
            .into_experiment(Utc::now())
    }

    #[test]
    fn test_sequential_values_give_batch_mean() {
        let store = InMemoryStore::new();
        let exp = experiment();
        let aggregator = MetricsAggregator::new(&store, 4);
        let (v, m) = (&exp.variants[0].id, &exp.metrics[0].id);

        for value in [10.0, 20.0, 30.0] {
            aggregator.record(&exp, v, m, value, Utc::now()).unwrap();
        }

        let row = store.get_result(&ResultKey::new(&exp.id, v, m)).unwrap().unwrap();
        assert_eq!(row.sample_size, 3);
        assert!((row.value - 20.0).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_bad_input() {
        let store = InMemoryStore::new();
        let mut exp = experiment();
        let aggregator = MetricsAggregator::new(&store, 4);
        let (v, m) = (exp.variants[0].id.clone(), exp.metrics[0].id.clone());

        assert!(matches!(
            aggregator.record(&exp, "nope", &m, 1.0, Utc::now()),
            Err(ExperimentError::VariantNotFound { .. })
        ));
        assert!(matches!(
            aggregator.record(&exp, &v, "nope", 1.0, Utc::now()),
            Err(ExperimentError::MetricNotFound { .. })
        ));
        assert!(matches!(
            aggregator.record(&exp, &v, &m, f64::NAN, Utc::now()),
            Err(ExperimentError::InvalidInput { .. })
        ));

        exp.metrics[0].is_active = false;
        assert!(matches!(
            aggregator.record(&exp, &v, &m, 1.0, Utc::now()),
            Err(ExperimentError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_concurrent_writers_lose_no_updates() {
        let store = InMemoryStore::new();
        let exp = experiment();
        let (v, m) = (exp.variants[0].id.clone(), exp.metrics[0].id.clone());

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let aggregator = MetricsAggregator::new(&store, 1_000);
                    for _ in 0..50 {
                        aggregator.record(&exp, &v, &m, 2.0, Utc::now()).unwrap();
                    }
                });
            }
        });

        let row = store.get_result(&ResultKey::new(&exp.id, &v, &m)).unwrap().unwrap();
        assert_eq!(row.sample_size, 400);
        assert_eq!(row.version, 400);
        assert!((row.value - 2.0).abs() < 1e-12);
    }

    /// Store whose CAS always loses
    struct ContendedStore {
        inner: InMemoryStore,
        attempts: AtomicU32,
    }

    impl ExperimentStore for ContendedStore {
        fn insert_experiment(&self, e: &Experiment) -> StoreResult<()> {
            self.inner.insert_experiment(e)
        }
        fn get_experiment(&self, id: &str) -> StoreResult<Option<Experiment>> {
            self.inner.get_experiment(id)
        }
        fn update_experiment(&self, e: &Experiment) -> StoreResult<()> {
            self.inner.update_experiment(e)
        }
        fn delete_experiment(&self, id: &str) -> StoreResult<bool> {
            self.inner.delete_experiment(id)
        }
        fn list_experiments(
            &self,
            f: &crate::storage::ExperimentFilter,
        ) -> StoreResult<Vec<Experiment>> {
            self.inner.list_experiments(f)
        }
        fn insert_assignment(&self, a: &crate::experiment::types::Assignment) -> StoreResult<()> {
            self.inner.insert_assignment(a)
        }
        fn get_assignment(
            &self,
            e: &str,
            u: &str,
        ) -> StoreResult<Option<crate::experiment::types::Assignment>> {
            self.inner.get_assignment(e, u)
        }
        fn assignments_for_user(
            &self,
            u: &str,
        ) -> StoreResult<Vec<crate::experiment::types::Assignment>> {
            self.inner.assignments_for_user(u)
        }
        fn assignment_counts(&self, e: &str) -> StoreResult<BTreeMap<String, u64>> {
            self.inner.assignment_counts(e)
        }
        fn get_result(&self, k: &ResultKey) -> StoreResult<Option<MetricResult>> {
            self.inner.get_result(k)
        }
        fn compare_and_swap_result(&self, _: Option<u64>, r: &MetricResult) -> StoreResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Conflict(r.key.metric_id.clone()))
        }
        fn set_comparison(&self, k: &ResultKey, c: Option<Comparison>) -> StoreResult<()> {
            self.inner.set_comparison(k, c)
        }
        fn results_for_experiment(&self, e: &str) -> StoreResult<Vec<MetricResult>> {
            self.inner.results_for_experiment(e)
        }
    }

    #[test]
    fn test_gives_up_after_bounded_retries() {
        let store = ContendedStore {
            inner: InMemoryStore::new(),
            attempts: AtomicU32::new(0),
        };
        let exp = experiment();
        let aggregator = MetricsAggregator::new(&store, 5);

        let err = aggregator
            .record(&exp, &exp.variants[0].id, &exp.metrics[0].id, 1.0, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ExperimentError::Conflict(_)));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_recompute_writes_comparisons() {
        let store = InMemoryStore::new();
        let exp = experiment();
        let aggregator = MetricsAggregator::new(&store, 4);
        let m = &exp.metrics[0].id;

        aggregator.record(&exp, &exp.variants[0].id, m, 0.4, Utc::now()).unwrap();
        aggregator.record(&exp, &exp.variants[1].id, m, 0.6, Utc::now()).unwrap();
        aggregator.recompute(&exp).unwrap();

        let baseline = store
            .get_result(&ResultKey::new(&exp.id, &exp.variants[0].id, m))
            .unwrap()
            .unwrap();
        let treatment = store
            .get_result(&ResultKey::new(&exp.id, &exp.variants[1].id, m))
            .unwrap()
            .unwrap();
        assert!(baseline.comparison.is_none());
        let comparison = treatment.comparison.unwrap();
        assert!((comparison.change - 0.2).abs() < 1e-12);
        assert!((comparison.change_percentage - 50.0).abs() < 1e-9);
        // Recompute must not disturb the CAS token
        assert_eq!(treatment.version, 1);
    }
}

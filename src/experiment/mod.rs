//! Experiment engine
//!
//! Eligibility → assignment → (caller applies variant) → metric recorded →
//! analysis and report on demand. Every operation re-reads what it needs from
//! the [`ExperimentStore`]; the only in-process state is the short-lived
//! per-user config cache.

pub mod aggregation;
pub mod analysis;
pub mod assignment;
pub mod cache;
pub mod clock;
pub mod eligibility;
pub mod random;
pub mod report;
pub mod targeting;
pub mod types;
pub mod user;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use aggregation::MetricsAggregator;
pub use analysis::{ExperimentAnalysis, SrmCheck, StatisticalAnalyzer, VariantStatistics};
pub use assignment::{persist_assignment, user_hash_bucket, Persisted, VariantSelector};
pub use cache::ConfigCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use eligibility::{Eligibility, EligibilityFilter};
pub use random::{FixedRandom, RandomSource, SeededRandom, ThreadRandom};
pub use report::{Recommendation, Report, ReportGenerator, RiskLevel};
pub use targeting::{AllocationStrategy, Targeting, TargetingCriteria};
pub use types::{
    Assignment, Experiment, ExperimentDefinition, ExperimentId, ExperimentStatus, MetricResult,
    VariantConfig, VariantId,
};
pub use user::{StaticUserDirectory, UserDirectory, UserProfile};

use crate::config::EngineConfig;
use crate::errors::{ExperimentError, Result, ValidationErrorExt};
use crate::metrics::{Timer, ANALYSIS_DURATION, ASSIGNMENTS_TOTAL, EXPERIMENT_TRANSITIONS_TOTAL};
use crate::storage::{ExperimentFilter, ExperimentStore};
use crate::validation::{validate_definition, validate_user_id};

/// Experiment counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub total: usize,
    pub draft: usize,
    pub active: usize,
    pub paused: usize,
    pub completed: usize,
}

pub struct ExperimentEngine {
    store: Arc<dyn ExperimentStore>,
    users: Arc<dyn UserDirectory>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    cache: ConfigCache,
    filter: EligibilityFilter,
    config: EngineConfig,
}

impl ExperimentEngine {
    pub fn new(store: Arc<dyn ExperimentStore>, users: Arc<dyn UserDirectory>) -> Self {
        let config = EngineConfig::default();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            store,
            users,
            cache: ConfigCache::new(config.cache_ttl, clock.clone()),
            clock,
            random: Arc::new(ThreadRandom),
            filter: EligibilityFilter::new(config.segment_thresholds),
            config,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.cache = ConfigCache::new(config.cache_ttl, self.clock.clone());
        self.filter = EligibilityFilter::new(config.segment_thresholds);
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.cache = ConfigCache::new(self.config.cache_ttl, clock.clone());
        self.clock = clock;
        self
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn ExperimentStore {
        self.store.as_ref()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Validate and persist a new experiment in DRAFT
    pub fn create_experiment(&self, definition: ExperimentDefinition) -> Result<Experiment> {
        validate_definition(&definition).map_validation_err("definition")?;

        let experiment = definition.into_experiment(self.clock.now());
        self.store.insert_experiment(&experiment)?;

        info!(
            experiment_id = %experiment.id,
            name = %experiment.name,
            variants = experiment.variants.len(),
            metrics = experiment.metrics.len(),
            "Experiment created"
        );
        Ok(experiment)
    }

    pub fn get_experiment(&self, experiment_id: &str) -> Result<Experiment> {
        self.store
            .get_experiment(experiment_id)?
            .ok_or_else(|| ExperimentError::ExperimentNotFound(experiment_id.to_string()))
    }

    pub fn list_experiments(&self, filter: &ExperimentFilter) -> Result<Vec<Experiment>> {
        Ok(self.store.list_experiments(filter)?)
    }

    /// DRAFT → ACTIVE
    pub fn start_experiment(&self, experiment_id: &str) -> Result<Experiment> {
        self.transition(
            experiment_id,
            "start",
            &[ExperimentStatus::Draft],
            ExperimentStatus::Active,
        )
    }

    /// ACTIVE → PAUSED
    pub fn pause_experiment(&self, experiment_id: &str) -> Result<Experiment> {
        self.transition(
            experiment_id,
            "pause",
            &[ExperimentStatus::Active],
            ExperimentStatus::Paused,
        )
    }

    /// PAUSED → ACTIVE
    pub fn resume_experiment(&self, experiment_id: &str) -> Result<Experiment> {
        self.transition(
            experiment_id,
            "resume",
            &[ExperimentStatus::Paused],
            ExperimentStatus::Active,
        )
    }

    /// ACTIVE or PAUSED → COMPLETED
    pub fn complete_experiment(&self, experiment_id: &str) -> Result<Experiment> {
        self.transition(
            experiment_id,
            "complete",
            &[ExperimentStatus::Active, ExperimentStatus::Paused],
            ExperimentStatus::Completed,
        )
    }

    fn transition(
        &self,
        experiment_id: &str,
        action: &'static str,
        from: &[ExperimentStatus],
        to: ExperimentStatus,
    ) -> Result<Experiment> {
        let mut experiment = self.get_experiment(experiment_id)?;

        if !from.contains(&experiment.status) {
            return Err(ExperimentError::InvalidTransition {
                experiment_id: experiment_id.to_string(),
                action,
                status: experiment.status.to_string(),
            });
        }

        let previous = experiment.status;
        let now = self.clock.now();
        experiment.status = to;
        match to {
            ExperimentStatus::Active if experiment.started_at.is_none() => {
                experiment.started_at = Some(now)
            }
            ExperimentStatus::Completed => experiment.ended_at = Some(now),
            _ => {}
        }

        self.store.update_experiment(&experiment)?;
        self.cache.clear();
        EXPERIMENT_TRANSITIONS_TOTAL
            .with_label_values(&[to.as_str()])
            .inc();

        info!(
            experiment_id = %experiment.id,
            from = %previous,
            to = %to,
            "Experiment status changed"
        );
        Ok(experiment)
    }

    /// Remove the experiment with its assignments and results
    pub fn delete_experiment(&self, experiment_id: &str) -> Result<()> {
        if !self.store.delete_experiment(experiment_id)? {
            return Err(ExperimentError::ExperimentNotFound(experiment_id.to_string()));
        }
        self.cache.clear();
        info!(experiment_id = %experiment_id, "Experiment deleted");
        Ok(())
    }

    pub fn summary(&self) -> Result<ExperimentSummary> {
        let experiments = self.store.list_experiments(&ExperimentFilter::default())?;

        let mut summary = ExperimentSummary {
            total: experiments.len(),
            ..Default::default()
        };
        for experiment in &experiments {
            match experiment.status {
                ExperimentStatus::Draft => summary.draft += 1,
                ExperimentStatus::Active => summary.active += 1,
                ExperimentStatus::Paused => summary.paused += 1,
                ExperimentStatus::Completed => summary.completed += 1,
            }
        }
        Ok(summary)
    }

    // =========================================================================
    // ASSIGNMENT
    // =========================================================================

    /// Get-or-create the user's variant. `None` when the experiment is
    /// missing, not ACTIVE, has no variants, or the user is ineligible.
    pub fn assign_variant(&self, user_id: &str, experiment_id: &str) -> Result<Option<VariantId>> {
        validate_user_id(user_id).map_validation_err("user_id")?;

        let Some(experiment) = self.store.get_experiment(experiment_id)? else {
            return Ok(None);
        };
        Ok(self.assign(&experiment, user_id)?.map(|a| a.variant_id))
    }

    fn assign(&self, experiment: &Experiment, user_id: &str) -> Result<Option<Assignment>> {
        let strategy = experiment.targeting.allocation().name();

        if !experiment.is_active() {
            ASSIGNMENTS_TOTAL
                .with_label_values(&[strategy, "inactive"])
                .inc();
            return Ok(None);
        }

        if let Some(existing) = self.store.get_assignment(&experiment.id, user_id)? {
            ASSIGNMENTS_TOTAL
                .with_label_values(&[strategy, "existing"])
                .inc();
            return Ok(Some(existing));
        }

        let now = self.clock.now();
        let profile = self.users.profile(user_id)?;
        let eligibility = self
            .filter
            .check(profile.as_ref(), experiment, now, self.random.as_ref());
        if !eligibility.is_eligible() {
            debug!(
                experiment_id = %experiment.id,
                user_id = %user_id,
                reason = eligibility.as_str(),
                "User not eligible"
            );
            ASSIGNMENTS_TOTAL
                .with_label_values(&[strategy, "ineligible"])
                .inc();
            return Ok(None);
        }

        let selector = VariantSelector::new(self.users.as_ref(), self.random.as_ref());
        let Some(allocation) = selector.select(experiment, user_id, now)? else {
            ASSIGNMENTS_TOTAL
                .with_label_values(&[strategy, "no_variants"])
                .inc();
            return Ok(None);
        };

        let persisted = persist_assignment(
            self.store.as_ref(),
            allocation.into_assignment(&experiment.id, user_id, now),
        )?;

        match &persisted {
            Persisted::Created(assignment) => {
                self.cache.invalidate(user_id);
                ASSIGNMENTS_TOTAL
                    .with_label_values(&[strategy, "created"])
                    .inc();
                info!(
                    experiment_id = %assignment.experiment_id,
                    user_id = %user_id,
                    variant_id = %assignment.variant_id,
                    method = assignment.method.as_str(),
                    "Variant assigned"
                );
            }
            Persisted::Existing(_) => {
                ASSIGNMENTS_TOTAL
                    .with_label_values(&[strategy, "raced"])
                    .inc();
            }
        }

        Ok(Some(persisted.into_assignment()))
    }

    /// Stored assignment only; never creates one and ignores status
    pub fn get_assigned_variant(
        &self,
        user_id: &str,
        experiment_id: &str,
    ) -> Result<Option<VariantId>> {
        Ok(self
            .store
            .get_assignment(experiment_id, user_id)?
            .map(|a| a.variant_id))
    }

    pub fn get_all_assignments_for_user(
        &self,
        user_id: &str,
    ) -> Result<BTreeMap<ExperimentId, VariantId>> {
        Ok(self
            .store
            .assignments_for_user(user_id)?
            .into_iter()
            .map(|a| (a.experiment_id, a.variant_id))
            .collect())
    }

    /// Assign if needed, then hand back the variant's configuration payload
    pub fn apply_variant_config(
        &self,
        user_id: &str,
        experiment_id: &str,
    ) -> Result<Option<VariantConfig>> {
        validate_user_id(user_id).map_validation_err("user_id")?;

        let Some(experiment) = self.store.get_experiment(experiment_id)? else {
            return Ok(None);
        };
        let Some(assignment) = self.assign(&experiment, user_id)? else {
            return Ok(None);
        };
        Ok(experiment
            .variant(&assignment.variant_id)
            .map(|v| v.config.clone()))
    }

    /// Merged configuration over the user's ACTIVE experiments, applied in
    /// experiment-id order so later keys override earlier ones
    pub fn get_user_config(&self, user_id: &str) -> Result<VariantConfig> {
        if let Some(config) = self.cache.get(user_id) {
            return Ok(config);
        }

        let ticket = self.cache.ticket(user_id);
        let mut assignments = self.store.assignments_for_user(user_id)?;
        assignments.sort_by(|a, b| a.experiment_id.cmp(&b.experiment_id));

        let mut merged = VariantConfig::new();
        for assignment in &assignments {
            let Some(experiment) = self.store.get_experiment(&assignment.experiment_id)? else {
                continue;
            };
            if !experiment.is_active() {
                continue;
            }
            if let Some(variant) = experiment.variant(&assignment.variant_id) {
                merged.extend(variant.config.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }

        self.cache.insert(user_id, ticket, merged.clone());
        Ok(merged)
    }

    // =========================================================================
    // METRICS AND ANALYSIS
    // =========================================================================

    /// Fold one observation in, then refresh the experiment's comparisons
    pub fn record_metric(
        &self,
        experiment_id: &str,
        variant_id: &str,
        metric_id: &str,
        value: f64,
    ) -> Result<MetricResult> {
        let experiment = self.get_experiment(experiment_id)?;
        let aggregator = MetricsAggregator::new(self.store.as_ref(), self.config.max_cas_retries);

        let row = aggregator.record(&experiment, variant_id, metric_id, value, self.clock.now())?;

        let _timer = Timer::new(ANALYSIS_DURATION.clone());
        aggregator.recompute(&experiment)?;

        Ok(row)
    }

    pub fn analyze_experiment(&self, experiment_id: &str) -> Result<ExperimentAnalysis> {
        let experiment = self.get_experiment(experiment_id)?;
        let results = self.store.results_for_experiment(&experiment.id)?;
        Ok(StatisticalAnalyzer::analyze(&experiment, &results))
    }

    pub fn get_report(&self, experiment_id: &str) -> Result<Report> {
        let experiment = self.get_experiment(experiment_id)?;
        let results = self.store.results_for_experiment(&experiment.id)?;
        let analysis = {
            let _timer = Timer::new(ANALYSIS_DURATION.clone());
            StatisticalAnalyzer::analyze(&experiment, &results)
        };

        let counts = self.store.assignment_counts(&experiment.id)?;
        let srm = StatisticalAnalyzer::check_srm(&experiment, &counts);

        Ok(ReportGenerator::generate(
            &experiment,
            analysis,
            &srm,
            self.clock.now(),
        ))
    }

    pub fn get_detailed_statistics(
        &self,
        experiment_id: &str,
        variant_id: &str,
    ) -> Result<VariantStatistics> {
        let experiment = self.get_experiment(experiment_id)?;
        let results = self.store.results_for_experiment(&experiment.id)?;

        StatisticalAnalyzer::detailed_statistics(
            &experiment,
            variant_id,
            &results,
            self.config.power_alpha,
        )
        .ok_or_else(|| ExperimentError::VariantNotFound {
            experiment_id: experiment_id.to_string(),
            variant_id: variant_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::types::{MetricDefinition, MetricKind, VariantDefinition};
    use crate::storage::InMemoryStore;
    use chrono::Duration;
    use serde_json::json;

    fn engine() -> (ExperimentEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let engine = ExperimentEngine::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(StaticUserDirectory::new()),
        )
        .with_clock(clock.clone())
        .with_random(Arc::new(FixedRandom(10.0)));
        (engine, clock)
    }

    fn definition(name: &str) -> ExperimentDefinition {
        ExperimentDefinition::builder(name)
            .with_variant(
                VariantDefinition::new("control", 50.0)
                    .control()
                    .with_config("daily_goal", json!(10)),
            )
            .with_variant(
                VariantDefinition::new("stretch", 50.0).with_config("daily_goal", json!(20)),
            )
            .with_metric(MetricDefinition::new("sessions", MetricKind::Engagement))
            .build()
    }

    #[test]
    fn test_lifecycle_transitions() {
        let (engine, clock) = engine();
        let exp = engine.create_experiment(definition("goals")).unwrap();
        assert_eq!(exp.status, ExperimentStatus::Draft);

        let started = engine.start_experiment(&exp.id).unwrap();
        assert_eq!(started.status, ExperimentStatus::Active);
        assert_eq!(started.started_at, Some(clock.now()));

        clock.advance(Duration::hours(1));
        assert_eq!(
            engine.pause_experiment(&exp.id).unwrap().status,
            ExperimentStatus::Paused
        );
        let resumed = engine.resume_experiment(&exp.id).unwrap();
        assert_eq!(resumed.started_at, started.started_at);

        let completed = engine.complete_experiment(&exp.id).unwrap();
        assert_eq!(completed.ended_at, Some(clock.now()));
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let (engine, _) = engine();
        let exp = engine.create_experiment(definition("goals")).unwrap();

        let err = engine.pause_experiment(&exp.id).unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
        assert!(engine.complete_experiment(&exp.id).is_err());

        engine.start_experiment(&exp.id).unwrap();
        engine.complete_experiment(&exp.id).unwrap();
        assert!(engine.resume_experiment(&exp.id).is_err());
        assert!(engine.start_experiment(&exp.id).is_err());

        let err = engine.start_experiment("missing").unwrap_err();
        assert_eq!(err.code(), "EXPERIMENT_NOT_FOUND");
    }

    #[test]
    fn test_invalid_definition_is_rejected() {
        let (engine, _) = engine();
        let bad = ExperimentDefinition::builder("empty").build();
        let err = engine.create_experiment(bad).unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test]
    fn test_assignment_only_while_active() {
        let (engine, _) = engine();
        let exp = engine.create_experiment(definition("goals")).unwrap();

        assert_eq!(engine.assign_variant("u1", &exp.id).unwrap(), None);
        assert_eq!(engine.assign_variant("u1", "missing").unwrap(), None);

        engine.start_experiment(&exp.id).unwrap();
        // Draw 10 lands in the first variant
        let variant = engine.assign_variant("u1", &exp.id).unwrap();
        assert_eq!(variant.as_deref(), Some(exp.variants[0].id.as_str()));

        engine.pause_experiment(&exp.id).unwrap();
        assert_eq!(engine.assign_variant("u1", &exp.id).unwrap(), None);
        assert_eq!(engine.get_assigned_variant("u1", &exp.id).unwrap(), variant);
    }

    #[test]
    fn test_invalid_user_id_is_an_error() {
        let (engine, _) = engine();
        let exp = engine.create_experiment(definition("goals")).unwrap();
        assert!(engine.assign_variant("bad user", &exp.id).is_err());
    }

    #[test]
    fn test_apply_and_merged_config() {
        let (engine, _) = engine();
        let a = engine.create_experiment(definition("goals")).unwrap();
        let b = engine
            .create_experiment(
                ExperimentDefinition::builder("theme")
                    .with_variant(VariantDefinition::new("dark", 100.0).with_config("theme", json!("dark")))
                    .build(),
            )
            .unwrap();
        engine.start_experiment(&a.id).unwrap();
        engine.start_experiment(&b.id).unwrap();

        let config = engine.apply_variant_config("u1", &a.id).unwrap().unwrap();
        assert_eq!(config.get("daily_goal"), Some(&json!(10)));

        let merged = engine.get_user_config("u1").unwrap();
        assert_eq!(merged.len(), 1, "only experiments the user is assigned to");

        engine.apply_variant_config("u1", &b.id).unwrap();
        let merged = engine.get_user_config("u1").unwrap();
        assert_eq!(merged.get("theme"), Some(&json!("dark")));
        assert_eq!(merged.get("daily_goal"), Some(&json!(10)));

        engine.pause_experiment(&b.id).unwrap();
        let merged = engine.get_user_config("u1").unwrap();
        assert!(merged.get("theme").is_none());
    }

    #[test]
    fn test_record_metric_errors() {
        let (engine, _) = engine();
        let exp = engine.create_experiment(definition("goals")).unwrap();
        let variant = &exp.variants[0].id;
        let metric = &exp.metrics[0].id;

        assert_eq!(
            engine.record_metric("missing", variant, metric, 1.0).unwrap_err().code(),
            "EXPERIMENT_NOT_FOUND"
        );
        assert_eq!(
            engine.record_metric(&exp.id, "nope", metric, 1.0).unwrap_err().code(),
            "VARIANT_NOT_FOUND"
        );
        assert_eq!(
            engine.record_metric(&exp.id, variant, "nope", 1.0).unwrap_err().code(),
            "METRIC_NOT_FOUND"
        );
        assert_eq!(
            engine.record_metric(&exp.id, variant, metric, f64::NAN).unwrap_err().code(),
            "INVALID_INPUT"
        );
    }

    #[test]
    fn test_detailed_statistics_unknown_variant() {
        let (engine, _) = engine();
        let exp = engine.create_experiment(definition("goals")).unwrap();
        let err = engine.get_detailed_statistics(&exp.id, "nope").unwrap_err();
        assert_eq!(err.code(), "VARIANT_NOT_FOUND");

        let stats = engine
            .get_detailed_statistics(&exp.id, &exp.variants[1].id)
            .unwrap();
        assert_eq!(stats.metrics.len(), 1);
        assert_eq!(stats.metrics[0].sample_size, 0);
        assert_eq!(stats.metrics[0].p_value, 1.0);
    }

    #[test]
    fn test_summary_and_delete() {
        let (engine, _) = engine();
        let a = engine.create_experiment(definition("a")).unwrap();
        let b = engine.create_experiment(definition("b")).unwrap();
        engine.start_experiment(&b.id).unwrap();
        engine.assign_variant("u1", &b.id).unwrap();

        let summary = engine.summary().unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.draft, 1);
        assert_eq!(summary.active, 1);

        engine.delete_experiment(&b.id).unwrap();
        assert!(engine.get_all_assignments_for_user("u1").unwrap().is_empty());
        assert_eq!(
            engine.delete_experiment(&b.id).unwrap_err().code(),
            "EXPERIMENT_NOT_FOUND"
        );
        assert_eq!(engine.summary().unwrap().total, 1);
        assert!(engine.get_experiment(&a.id).is_ok());
    }
}

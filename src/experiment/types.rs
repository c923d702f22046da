//! Core records: experiments, variants, metrics, assignments and results

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ExperimentId = String;
pub type VariantId = String;
pub type MetricId = String;

/// Opaque key-value payload a variant hands to the calling application
pub type VariantConfig = BTreeMap<String, serde_json::Value>;

// =============================================================================
// EXPERIMENT
// =============================================================================

/// Lifecycle state of an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    /// Being configured, no assignments
    Draft,
    /// Assigning users and collecting data
    Active,
    /// No new assignments; resumable
    Paused,
    /// Terminal for assignment; metrics from in-flight users still accepted
    Completed,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Draft => "DRAFT",
            ExperimentStatus::Active => "ACTIVE",
            ExperimentStatus::Paused => "PAUSED",
            ExperimentStatus::Completed => "COMPLETED",
        }
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExperimentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DRAFT" => Ok(Self::Draft),
            "ACTIVE" => Ok(Self::Active),
            "PAUSED" => Ok(Self::Paused),
            "COMPLETED" => Ok(Self::Completed),
            other => Err(format!("unknown experiment status: {other}")),
        }
    }
}

/// One treatment arm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: VariantConfig,
    /// Percentage of traffic (0-100)
    pub traffic_share: f64,
    #[serde(default)]
    pub is_control: bool,
}

/// What a metric measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Engagement,
    Retention,
    Conversion,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: MetricId,
    pub name: String,
    pub kind: MetricKind,
    /// Aggregation formula descriptor, interpreted by dashboards only
    #[serde(default)]
    pub formula: String,
    #[serde(default)]
    pub unit: String,
    pub is_active: bool,
}

/// An A/B experiment together with the variants and metrics it owns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: ExperimentStatus,
    #[serde(default)]
    pub targeting: super::targeting::Targeting,
    /// Ordered; the first variant is the comparison baseline
    pub variants: Vec<Variant>,
    pub metrics: Vec<Metric>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Experiment {
    pub fn is_active(&self) -> bool {
        self.status == ExperimentStatus::Active
    }

    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == variant_id)
    }

    pub fn metric(&self, metric_id: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.id == metric_id)
    }

    /// The primary metric is the first one declared
    pub fn primary_metric(&self) -> Option<&Metric> {
        self.metrics.first()
    }
}

// =============================================================================
// DEFINITIONS (creation input)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: VariantConfig,
    pub traffic_share: f64,
    #[serde(default)]
    pub is_control: bool,
}

impl VariantDefinition {
    pub fn new(name: &str, traffic_share: f64) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            config: VariantConfig::new(),
            traffic_share,
            is_control: false,
        }
    }

    pub fn control(mut self) -> Self {
        self.is_control = true;
        self
    }

    pub fn with_config(mut self, key: &str, value: serde_json::Value) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    pub kind: MetricKind,
    #[serde(default)]
    pub formula: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl MetricDefinition {
    pub fn new(name: &str, kind: MetricKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            formula: "mean".to_string(),
            unit: String::new(),
            is_active: true,
        }
    }
}

/// Everything needed to create an experiment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub targeting: super::targeting::Targeting,
    pub variants: Vec<VariantDefinition>,
    pub metrics: Vec<MetricDefinition>,
}

impl ExperimentDefinition {
    pub fn builder(name: &str) -> ExperimentDefinitionBuilder {
        ExperimentDefinitionBuilder {
            definition: ExperimentDefinition {
                name: name.to_string(),
                ..Default::default()
            },
        }
    }

    /// Materialize into a DRAFT experiment with fresh ids. Feature rules
    /// naming a variant are repointed at that variant's new id.
    pub fn into_experiment(self, now: DateTime<Utc>) -> Experiment {
        let variants: Vec<Variant> = self
            .variants
            .into_iter()
            .map(|v| Variant {
                id: Uuid::new_v4().to_string(),
                name: v.name,
                description: v.description,
                config: v.config,
                traffic_share: v.traffic_share,
                is_control: v.is_control,
            })
            .collect();
        let metrics = self
            .metrics
            .into_iter()
            .map(|m| Metric {
                id: Uuid::new_v4().to_string(),
                name: m.name,
                kind: m.kind,
                formula: m.formula,
                unit: m.unit,
                is_active: m.is_active,
            })
            .collect();

        let mut targeting = self.targeting;
        if let Some(super::targeting::AllocationStrategy::FeatureRules { rules }) =
            targeting.allocation.as_mut()
        {
            for rule in rules.iter_mut() {
                if let Some(variant) = variants.iter().find(|v| v.name == rule.variant_id) {
                    rule.variant_id = variant.id.clone();
                }
            }
        }

        Experiment {
            id: Uuid::new_v4().to_string(),
            name: self.name,
            description: self.description,
            status: ExperimentStatus::Draft,
            targeting,
            variants,
            metrics,
            created_at: now,
            started_at: None,
            ended_at: None,
        }
    }
}

/// Builder for experiment definitions
pub struct ExperimentDefinitionBuilder {
    definition: ExperimentDefinition,
}

impl ExperimentDefinitionBuilder {
    pub fn with_description(mut self, description: &str) -> Self {
        self.definition.description = description.to_string();
        self
    }

    pub fn with_targeting(mut self, targeting: super::targeting::Targeting) -> Self {
        self.definition.targeting = targeting;
        self
    }

    pub fn with_variant(mut self, variant: VariantDefinition) -> Self {
        self.definition.variants.push(variant);
        self
    }

    pub fn with_metric(mut self, metric: MetricDefinition) -> Self {
        self.definition.metrics.push(metric);
        self
    }

    pub fn build(self) -> ExperimentDefinition {
        self.definition
    }
}

// =============================================================================
// ASSIGNMENT
// =============================================================================

/// How an assignment's variant was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMethod {
    WeightedRandom,
    FeatureRule,
    Cohort,
    Hash,
}

impl AllocationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationMethod::WeightedRandom => "weighted_random",
            AllocationMethod::FeatureRule => "feature_rule",
            AllocationMethod::Cohort => "cohort",
            AllocationMethod::Hash => "hash",
        }
    }
}

/// Sticky (experiment, user) → variant mapping. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub experiment_id: ExperimentId,
    pub user_id: String,
    pub variant_id: VariantId,
    pub method: AllocationMethod,
    /// Cohort label computed by cohort allocation
    #[serde(default)]
    pub cohort: Option<String>,
    pub assigned_at: DateTime<Utc>,
}

// =============================================================================
// RESULTS
// =============================================================================

/// Identity of a result row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResultKey {
    pub experiment_id: ExperimentId,
    pub variant_id: VariantId,
    pub metric_id: MetricId,
}

impl ResultKey {
    pub fn new(experiment_id: &str, variant_id: &str, metric_id: &str) -> Self {
        Self {
            experiment_id: experiment_id.to_string(),
            variant_id: variant_id.to_string(),
            metric_id: metric_id.to_string(),
        }
    }
}

/// Derived comparison of a variant against the baseline for one metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub change: f64,
    pub change_percentage: f64,
    pub confidence: f64,
    pub significant: bool,
}

/// Aggregate for one (experiment, variant, metric)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    pub key: ResultKey,
    /// Running mean
    pub value: f64,
    pub sample_size: u64,
    /// Sum of squared deviations from the running mean (Welford)
    #[serde(default)]
    pub m2: f64,
    /// Bumped on every observation; the compare-and-swap token
    pub version: u64,
    /// None for the baseline and before the first recomputation
    #[serde(default)]
    pub comparison: Option<Comparison>,
    pub updated_at: DateTime<Utc>,
}

impl MetricResult {
    pub fn first(key: ResultKey, value: f64, now: DateTime<Utc>) -> Self {
        Self {
            key,
            value,
            sample_size: 1,
            m2: 0.0,
            version: 1,
            comparison: None,
            updated_at: now,
        }
    }

    /// Row after folding in one more observation
    pub fn observe(&self, value: f64, now: DateTime<Utc>) -> Self {
        let old_n = self.sample_size as f64;
        let mean = (self.value * old_n + value) / (old_n + 1.0);
        let m2 = self.m2 + (value - self.value) * (value - mean);

        Self {
            key: self.key.clone(),
            value: mean,
            sample_size: self.sample_size + 1,
            m2,
            version: self.version + 1,
            comparison: self.comparison,
            updated_at: now,
        }
    }

    /// Sample variance with an n-1 denominator; 0 below two observations
    pub fn sample_variance(&self) -> f64 {
        if self.sample_size < 2 {
            0.0
        } else {
            (self.m2 / (self.sample_size - 1) as f64).max(0.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ResultKey {
        ResultKey::new("exp", "var", "met")
    }

    #[test]
    fn test_incremental_mean_matches_batch_mean() {
        let now = Utc::now();
        let row = MetricResult::first(key(), 10.0, now)
            .observe(20.0, now)
            .observe(30.0, now);

        assert_eq!(row.sample_size, 3);
        assert!((row.value - 20.0).abs() < 1e-12);
        assert_eq!(row.version, 3);
        // Batch sample variance of [10, 20, 30] is 100
        assert!((row.sample_variance() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_observation_has_zero_variance() {
        let row = MetricResult::first(key(), 4.0, Utc::now());
        assert_eq!(row.sample_variance(), 0.0);
    }

    #[test]
    fn test_status_round_trip_from_str() {
        assert_eq!("active".parse::<ExperimentStatus>(), Ok(ExperimentStatus::Active));
        assert!("archived".parse::<ExperimentStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&ExperimentStatus::Completed).unwrap(),
            "\"COMPLETED\""
        );
    }

    #[test]
    fn test_definition_builds_draft_experiment() {
        let definition = ExperimentDefinition::builder("streak_bonus")
            .with_description("Double streak points")
            .with_variant(VariantDefinition::new("control", 50.0).control())
            .with_variant(
                VariantDefinition::new("double", 50.0)
                    .with_config("streak_multiplier", serde_json::json!(2)),
            )
            .with_metric(MetricDefinition::new("daily_sessions", MetricKind::Engagement))
            .build();

        let experiment = definition.into_experiment(Utc::now());
        assert_eq!(experiment.status, ExperimentStatus::Draft);
        assert_eq!(experiment.variants.len(), 2);
        assert!(experiment.variants[0].is_control);
        assert_ne!(experiment.variants[0].id, experiment.variants[1].id);
        assert_eq!(experiment.primary_metric().unwrap().name, "daily_sessions");
        assert!(experiment.metrics[0].is_active);
    }
}

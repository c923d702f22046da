//! Targeting descriptors: who may enter an experiment and how they are split

use serde::{Deserialize, Serialize};

use super::types::VariantId;
use super::user::UserFeatures;

/// Numeric tolerance for `equals` on numbers
const FEATURE_EPSILON: f64 = 1e-9;

/// Field-based eligibility criteria; every set field must hold
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetingCriteria {
    pub min_level: Option<u32>,
    pub max_level: Option<u32>,
    pub min_points: Option<i64>,
    pub max_points: Option<i64>,
    pub min_streak: Option<u32>,
    pub learning_style: Option<String>,
    pub min_account_age_days: Option<i64>,
    pub max_account_age_days: Option<i64>,
    pub is_premium: Option<bool>,
}

/// Comparison operators for feature rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Equals,
    GreaterThan,
    LessThan,
    In,
}

/// A single `feature <op> value` test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCondition {
    pub feature: String,
    pub operator: RuleOperator,
    pub value: serde_json::Value,
}

impl FeatureCondition {
    pub fn new(feature: &str, operator: RuleOperator, value: serde_json::Value) -> Self {
        Self {
            feature: feature.to_string(),
            operator,
            value,
        }
    }

    /// Missing features and type mismatches never match
    pub fn matches(&self, features: &UserFeatures) -> bool {
        let Some(actual) = features.get(&self.feature) else {
            return false;
        };

        match self.operator {
            RuleOperator::Equals => values_equal(actual, &self.value),
            RuleOperator::GreaterThan => match (actual.as_f64(), self.value.as_f64()) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            RuleOperator::LessThan => match (actual.as_f64(), self.value.as_f64()) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
            RuleOperator::In => self
                .value
                .as_array()
                .is_some_and(|candidates| candidates.iter().any(|c| values_equal(actual, c))),
        }
    }
}

fn values_equal(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() < FEATURE_EPSILON,
        _ => a == b,
    }
}

/// Routes users matching a condition straight to a variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRule {
    pub feature: String,
    pub operator: RuleOperator,
    pub value: serde_json::Value,
    /// In a definition this is the variant's name; creation rewrites it to
    /// the generated variant id.
    #[serde(alias = "variant")]
    pub variant_id: VariantId,
}

impl FeatureRule {
    pub fn matches(&self, features: &UserFeatures) -> bool {
        FeatureCondition {
            feature: self.feature.clone(),
            operator: self.operator,
            value: self.value.clone(),
        }
        .matches(features)
    }
}

/// Labels users whose features satisfy every condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortRule {
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<FeatureCondition>,
}

impl CohortRule {
    pub fn matches(&self, features: &UserFeatures) -> bool {
        self.conditions.iter().all(|c| c.matches(features))
    }
}

/// Variant selection mode. Unrecognized `type` tags fall back to weighted random.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AllocationStrategy {
    #[default]
    WeightedRandom,
    FeatureRules {
        #[serde(default)]
        rules: Vec<FeatureRule>,
    },
    Cohort {
        #[serde(default)]
        cohorts: Vec<CohortRule>,
    },
    Hash,
    #[serde(other)]
    Unknown,
}

impl AllocationStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            AllocationStrategy::WeightedRandom => "weighted_random",
            AllocationStrategy::FeatureRules { .. } => "feature_rules",
            AllocationStrategy::Cohort { .. } => "cohort",
            AllocationStrategy::Hash => "hash",
            AllocationStrategy::Unknown => "unknown",
        }
    }
}

/// Who qualifies for an experiment and how they are allocated
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Targeting {
    /// Allowed segment names (see `UserSegment::as_str`)
    #[serde(default)]
    pub segments: Option<Vec<String>>,
    /// Percentage of eligible users admitted (0-100)
    #[serde(default)]
    pub sampling_percentage: Option<f64>,
    #[serde(default)]
    pub criteria: Option<TargetingCriteria>,
    #[serde(default)]
    pub allocation: Option<AllocationStrategy>,
}

impl Targeting {
    pub fn with_segments(mut self, segments: &[&str]) -> Self {
        self.segments = Some(segments.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_sampling(mut self, percentage: f64) -> Self {
        self.sampling_percentage = Some(percentage);
        self
    }

    pub fn with_criteria(mut self, criteria: TargetingCriteria) -> Self {
        self.criteria = Some(criteria);
        self
    }

    pub fn with_allocation(mut self, allocation: AllocationStrategy) -> Self {
        self.allocation = Some(allocation);
        self
    }

    pub fn allocation(&self) -> &AllocationStrategy {
        static DEFAULT: AllocationStrategy = AllocationStrategy::WeightedRandom;
        self.allocation.as_ref().unwrap_or(&DEFAULT)
    }
}

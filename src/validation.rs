//! Input validation for identifiers and experiment definitions

use std::collections::HashSet;

use anyhow::{anyhow, Result};

use crate::constants::{TRAFFIC_SCALE, TRAFFIC_SHARE_TOLERANCE};
use crate::experiment::targeting::{AllocationStrategy, Targeting};
use crate::experiment::types::ExperimentDefinition;

/// Maximum lengths
pub const MAX_USER_ID_LENGTH: usize = 128;
pub const MAX_NAME_LENGTH: usize = 200;
pub const MAX_DESCRIPTION_LENGTH: usize = 5_000;
pub const MAX_VARIANTS: usize = 20;
pub const MAX_METRICS: usize = 50;

/// Validate user_id
pub fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.is_empty() {
        return Err(anyhow!("user_id cannot be empty"));
    }

    if user_id.len() > MAX_USER_ID_LENGTH {
        return Err(anyhow!(
            "user_id too long: {} chars (max: {})",
            user_id.len(),
            MAX_USER_ID_LENGTH
        ));
    }

    // Only allow alphanumeric, dash, underscore, @ and dot
    if !user_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '@' || c == '.')
    {
        return Err(anyhow!(
            "user_id contains invalid characters (allowed: alphanumeric, -, _, @, .)"
        ));
    }

    Ok(())
}

fn validate_name(field: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(anyhow!("{field} cannot be empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(anyhow!(
            "{field} too long: {} chars (max: {MAX_NAME_LENGTH})",
            name.len()
        ));
    }
    Ok(())
}

/// Validate an experiment definition before it is materialized
pub fn validate_definition(definition: &ExperimentDefinition) -> Result<()> {
    validate_name("name", &definition.name)?;

    if definition.description.len() > MAX_DESCRIPTION_LENGTH {
        return Err(anyhow!(
            "description too long: {} chars (max: {MAX_DESCRIPTION_LENGTH})",
            definition.description.len()
        ));
    }

    if definition.variants.is_empty() {
        return Err(anyhow!("an experiment needs at least one variant"));
    }
    if definition.variants.len() > MAX_VARIANTS {
        return Err(anyhow!(
            "too many variants: {} (max: {MAX_VARIANTS})",
            definition.variants.len()
        ));
    }
    if definition.metrics.len() > MAX_METRICS {
        return Err(anyhow!(
            "too many metrics: {} (max: {MAX_METRICS})",
            definition.metrics.len()
        ));
    }

    let mut names = HashSet::new();
    let mut total_share = 0.0;
    for variant in &definition.variants {
        validate_name("variant name", &variant.name)?;
        if !names.insert(variant.name.as_str()) {
            return Err(anyhow!("duplicate variant name: {}", variant.name));
        }
        if !(0.0..=TRAFFIC_SCALE).contains(&variant.traffic_share) {
            return Err(anyhow!(
                "traffic_share for {} must be between 0 and 100, got: {}",
                variant.name,
                variant.traffic_share
            ));
        }
        total_share += variant.traffic_share;
    }
    if total_share > TRAFFIC_SCALE + TRAFFIC_SHARE_TOLERANCE {
        return Err(anyhow!(
            "traffic shares sum to {total_share}, more than 100"
        ));
    }

    let controls = definition.variants.iter().filter(|v| v.is_control).count();
    if controls > 1 {
        return Err(anyhow!("at most one control variant allowed, got {controls}"));
    }

    let mut metric_names = HashSet::new();
    for metric in &definition.metrics {
        validate_name("metric name", &metric.name)?;
        if !metric_names.insert(metric.name.as_str()) {
            return Err(anyhow!("duplicate metric name: {}", metric.name));
        }
    }

    if let Some(AllocationStrategy::FeatureRules { rules }) = &definition.targeting.allocation {
        for rule in rules {
            if !names.contains(rule.variant_id.as_str()) {
                return Err(anyhow!(
                    "feature rule on {} targets unknown variant: {}",
                    rule.feature,
                    rule.variant_id
                ));
            }
        }
    }

    validate_targeting(&definition.targeting)
}

/// Range checks on targeting
pub fn validate_targeting(targeting: &Targeting) -> Result<()> {
    if let Some(pct) = targeting.sampling_percentage {
        if !(0.0..=TRAFFIC_SCALE).contains(&pct) {
            return Err(anyhow!(
                "sampling_percentage must be between 0 and 100, got: {pct}"
            ));
        }
    }

    if let Some(criteria) = &targeting.criteria {
        if let (Some(min), Some(max)) = (criteria.min_level, criteria.max_level) {
            if min > max {
                return Err(anyhow!("min_level {min} exceeds max_level {max}"));
            }
        }
        if let (Some(min), Some(max)) = (criteria.min_points, criteria.max_points) {
            if min > max {
                return Err(anyhow!("min_points {min} exceeds max_points {max}"));
            }
        }
        if let (Some(min), Some(max)) =
            (criteria.min_account_age_days, criteria.max_account_age_days)
        {
            if min > max {
                return Err(anyhow!(
                    "min_account_age_days {min} exceeds max_account_age_days {max}"
                ));
            }
        }
    }

    if let Some(AllocationStrategy::Cohort { cohorts }) = &targeting.allocation {
        if cohorts.iter().any(|c| c.name.trim().is_empty()) {
            return Err(anyhow!("cohort names cannot be empty"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::targeting::{FeatureRule, RuleOperator, TargetingCriteria};
    use crate::experiment::types::{MetricDefinition, MetricKind, VariantDefinition};

    fn definition() -> ExperimentDefinition {
        ExperimentDefinition::builder("streak_freeze")
            .with_variant(VariantDefinition::new("control", 50.0).control())
            .with_variant(VariantDefinition::new("freeze", 50.0))
            .with_metric(MetricDefinition::new("retention_d7", MetricKind::Retention))
            .build()
    }

    #[test]
    fn test_valid_user_id() {
        assert!(validate_user_id("user_123").is_ok());
        assert!(validate_user_id("learner@example.com").is_ok());
    }

    #[test]
    fn test_invalid_user_id() {
        assert!(validate_user_id("").is_err());
        assert!(validate_user_id("a:b").is_err());
        assert!(validate_user_id(&"x".repeat(MAX_USER_ID_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_valid_definition() {
        assert!(validate_definition(&definition()).is_ok());
    }

    #[test]
    fn test_share_rules() {
        let mut d = definition();
        d.variants[1].traffic_share = 50.4;
        assert!(validate_definition(&d).is_ok(), "rounding drift is tolerated");

        d.variants[1].traffic_share = 60.0;
        assert!(validate_definition(&d).is_err());

        d.variants[1].traffic_share = -1.0;
        assert!(validate_definition(&d).is_err());
    }

    #[test]
    fn test_structure_rules() {
        let mut d = definition();
        d.variants.clear();
        assert!(validate_definition(&d).is_err());

        let mut d = definition();
        d.variants[1].name = "control".to_string();
        assert!(validate_definition(&d).is_err());

        let mut d = definition();
        d.variants[1].is_control = true;
        assert!(validate_definition(&d).is_err());

        let mut d = definition();
        d.name = "  ".to_string();
        assert!(validate_definition(&d).is_err());
    }

    #[test]
    fn test_targeting_ranges() {
        assert!(validate_targeting(&Targeting::default().with_sampling(101.0)).is_err());
        let inverted = Targeting::default().with_criteria(TargetingCriteria {
            min_level: Some(10),
            max_level: Some(2),
            ..Default::default()
        });
        assert!(validate_targeting(&inverted).is_err());
    }

    #[test]
    fn test_feature_rules_must_name_a_variant() {
        let rule = |target: &str| FeatureRule {
            feature: "level".to_string(),
            operator: RuleOperator::GreaterThan,
            value: serde_json::json!(10),
            variant_id: target.to_string(),
        };

        let mut d = definition();
        d.targeting = Targeting::default().with_allocation(AllocationStrategy::FeatureRules {
            rules: vec![rule("freeze")],
        });
        assert!(validate_definition(&d).is_ok());

        d.targeting = Targeting::default().with_allocation(AllocationStrategy::FeatureRules {
            rules: vec![rule("freeze"), rule("double_freeze")],
        });
        let err = validate_definition(&d).unwrap_err().to_string();
        assert!(err.contains("double_freeze"), "{err}");
    }
}

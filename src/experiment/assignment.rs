//! Variant selection and at-most-once persistence
//!
//! Selection walks the cumulative traffic-share table in variant order with a
//! point in [0, 100): a random draw for weighted random, cohort and unmatched
//! feature rules, the user-id hash bucket for hash allocation. Persistence
//! defers to the store's (experiment, user) uniqueness constraint.

use chrono::{DateTime, Utc};

use super::random::RandomSource;
use super::targeting::AllocationStrategy;
use super::types::{AllocationMethod, Assignment, Experiment, Variant, VariantId};
use super::user::UserDirectory;
use crate::constants::HASH_BUCKETS;
use crate::errors::{Result, StoreError};
use crate::storage::ExperimentStore;

/// 32-bit rolling hash of the user id (`h = h*31 + unit` over UTF-16 code
/// units, wrapping), absolute value, modulo 100.
///
/// Reproducible anywhere the same formula runs, which is what makes hash
/// allocation stable across processes.
pub fn user_hash_bucket(user_id: &str) -> i64 {
    let mut hash: i32 = 0;
    for unit in user_id.encode_utf16() {
        hash = hash.wrapping_mul(31).wrapping_add(unit as i32);
    }
    (hash as i64).abs() % HASH_BUCKETS
}

/// First variant whose cumulative share reaches `point`; the last variant
/// with traffic absorbs any remainder left by shares summing below 100.
///
/// Zero-share variants never win, not even at point 0.
pub fn pick_by_cumulative_share(variants: &[Variant], point: f64) -> Option<&Variant> {
    let mut cumulative = 0.0;
    for variant in variants.iter().filter(|v| v.traffic_share > 0.0) {
        cumulative += variant.traffic_share;
        if cumulative >= point {
            return Some(variant);
        }
    }
    variants
        .iter()
        .rev()
        .find(|v| v.traffic_share > 0.0)
        .or_else(|| variants.last())
}

/// A selection that has not been persisted yet
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub variant_id: VariantId,
    pub method: AllocationMethod,
    pub cohort: Option<String>,
}

impl Allocation {
    pub fn into_assignment(
        self,
        experiment_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Assignment {
        Assignment {
            experiment_id: experiment_id.to_string(),
            user_id: user_id.to_string(),
            variant_id: self.variant_id,
            method: self.method,
            cohort: self.cohort,
            assigned_at: now,
        }
    }
}

/// Pure selection: no eligibility, no persistence
pub struct VariantSelector<'a> {
    users: &'a dyn UserDirectory,
    random: &'a dyn RandomSource,
}

impl<'a> VariantSelector<'a> {
    pub fn new(users: &'a dyn UserDirectory, random: &'a dyn RandomSource) -> Self {
        Self { users, random }
    }

    /// `None` only when the experiment has no variants
    pub fn select(
        &self,
        experiment: &Experiment,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Allocation>> {
        if experiment.variants.is_empty() {
            return Ok(None);
        }

        let allocation = match experiment.targeting.allocation() {
            AllocationStrategy::WeightedRandom => self.weighted_random(experiment, None),
            AllocationStrategy::Hash => {
                let bucket = user_hash_bucket(user_id);
                pick_by_cumulative_share(&experiment.variants, bucket as f64).map(|v| Allocation {
                    variant_id: v.id.clone(),
                    method: AllocationMethod::Hash,
                    cohort: None,
                })
            }
            AllocationStrategy::FeatureRules { rules } => {
                let features = self.users.features(user_id, now)?;
                let matched = rules.iter().find(|rule| {
                    rule.matches(&features) && experiment.variant(&rule.variant_id).is_some()
                });
                match matched {
                    Some(rule) => Some(Allocation {
                        variant_id: rule.variant_id.clone(),
                        method: AllocationMethod::FeatureRule,
                        cohort: None,
                    }),
                    None => self.weighted_random(experiment, None),
                }
            }
            AllocationStrategy::Cohort { cohorts } => {
                let features = self.users.features(user_id, now)?;
                let cohort = cohorts
                    .iter()
                    .find(|c| c.matches(&features))
                    .map(|c| c.name.clone());
                // The label is recorded but does not influence the split.
                self.weighted_random(experiment, cohort)
                    .map(|a| Allocation {
                        method: AllocationMethod::Cohort,
                        ..a
                    })
            }
            AllocationStrategy::Unknown => {
                tracing::warn!(
                    experiment_id = %experiment.id,
                    "Unknown allocation strategy, using weighted random"
                );
                self.weighted_random(experiment, None)
            }
        };

        Ok(allocation)
    }

    fn weighted_random(&self, experiment: &Experiment, cohort: Option<String>) -> Option<Allocation> {
        let point = self.random.next_percent();
        pick_by_cumulative_share(&experiment.variants, point).map(|v| Allocation {
            variant_id: v.id.clone(),
            method: AllocationMethod::WeightedRandom,
            cohort,
        })
    }
}

/// Result of persisting an assignment
#[derive(Debug, Clone, PartialEq)]
pub enum Persisted {
    /// Our row won
    Created(Assignment),
    /// Another writer got there first; this is their row
    Existing(Assignment),
}

impl Persisted {
    pub fn assignment(&self) -> &Assignment {
        match self {
            Persisted::Created(a) | Persisted::Existing(a) => a,
        }
    }

    pub fn into_assignment(self) -> Assignment {
        match self {
            Persisted::Created(a) | Persisted::Existing(a) => a,
        }
    }
}

/// Insert once; a uniqueness violation becomes a read-back of the winning row
pub fn persist_assignment(store: &dyn ExperimentStore, assignment: Assignment) -> Result<Persisted> {
    match store.insert_assignment(&assignment) {
        Ok(()) => Ok(Persisted::Created(assignment)),
        Err(StoreError::Duplicate(_)) => {
            let existing = store
                .get_assignment(&assignment.experiment_id, &assignment.user_id)?
                .ok_or_else(|| {
                    StoreError::Backend(format!(
                        "assignment {}/{} reported duplicate but is missing",
                        assignment.experiment_id, assignment.user_id
                    ))
                })?;
            tracing::debug!(
                experiment_id = %existing.experiment_id,
                variant_id = %existing.variant_id,
                "Lost assignment race, returning existing row"
            );
            Ok(Persisted::Existing(existing))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::random::{FixedRandom, SeededRandom};
    use crate::experiment::targeting::{
        CohortRule, FeatureCondition, FeatureRule, RuleOperator, Targeting,
    };
    use crate::experiment::types::{ExperimentDefinition, VariantDefinition};
    use crate::experiment::user::{StaticUserDirectory, UserProfile};
    use crate::storage::InMemoryStore;
    use serde_json::json;

    fn experiment(shares: &[f64], allocation: Option<AllocationStrategy>) -> Experiment {
        let mut builder = ExperimentDefinition::builder("assignment");
        for (i, share) in shares.iter().enumerate() {
            builder = builder.with_variant(VariantDefinition::new(&format!("v{i}"), *share));
        }
        let mut targeting = Targeting::default();
        targeting.allocation = allocation;
        builder
            .with_targeting(targeting)
            .build()
            .into_experiment(Utc::now())
    }

    #[test]
    fn test_hash_matches_reference_values() {
        // "a" = 97; "ab" = 97*31 + 98 = 3105
        assert_eq!(user_hash_bucket(""), 0);
        assert_eq!(user_hash_bucket("a"), 97);
        assert_eq!(user_hash_bucket("ab"), 5);
        // Overflowing input wraps instead of panicking
        let long = "x".repeat(64);
        assert!((0..100).contains(&user_hash_bucket(&long)));
        assert_eq!(user_hash_bucket(&long), user_hash_bucket(&long));
    }

    #[test]
    fn test_cumulative_walk() {
        let exp = experiment(&[30.0, 70.0], None);
        let pick = |p| pick_by_cumulative_share(&exp.variants, p).unwrap().name.clone();
        assert_eq!(pick(0.0), "v0");
        assert_eq!(pick(30.0), "v0");
        assert_eq!(pick(30.5), "v1");
        assert_eq!(pick(99.9), "v1");
    }

    #[test]
    fn test_remainder_falls_to_last_variant() {
        let exp = experiment(&[20.0, 20.0], None);
        let chosen = pick_by_cumulative_share(&exp.variants, 90.0).unwrap();
        assert_eq!(chosen.name, "v1");
        assert!(pick_by_cumulative_share(&[], 10.0).is_none());
    }

    #[test]
    fn test_zero_share_variants_never_win() {
        let exp = experiment(&[0.0, 60.0, 0.0], None);
        for point in [0.0, 30.0, 60.0, 99.0] {
            let chosen = pick_by_cumulative_share(&exp.variants, point).unwrap();
            assert_eq!(chosen.name, "v1", "point {point}");
        }

        // Hash bucket 0 skips a leading zero-share arm
        let exp = experiment(&[0.0, 100.0], Some(AllocationStrategy::Hash));
        let users = StaticUserDirectory::new();
        let random = FixedRandom(0.0);
        let selector = VariantSelector::new(&users, &random);
        assert_eq!(user_hash_bucket(""), 0);
        let allocation = selector.select(&exp, "", Utc::now()).unwrap().unwrap();
        assert_eq!(allocation.variant_id, exp.variants[1].id);
    }

    #[test]
    fn test_feature_rule_first_match_wins() {
        let mut exp = experiment(&[50.0, 50.0], None);
        let v1 = exp.variants[1].id.clone();
        exp.targeting.allocation = Some(AllocationStrategy::FeatureRules {
            rules: vec![
                FeatureRule {
                    feature: "level".to_string(),
                    operator: RuleOperator::GreaterThan,
                    value: json!(10),
                    variant_id: "not-a-variant".to_string(),
                },
                FeatureRule {
                    feature: "level".to_string(),
                    operator: RuleOperator::GreaterThan,
                    value: json!(5),
                    variant_id: v1.clone(),
                },
            ],
        });

        let users = StaticUserDirectory::new();
        users.insert(
            "veteran",
            UserProfile {
                level: Some(20),
                ..Default::default()
            },
        );
        let random = FixedRandom(0.0);
        let selector = VariantSelector::new(&users, &random);

        let chosen = selector.select(&exp, "veteran", Utc::now()).unwrap().unwrap();
        assert_eq!(chosen.variant_id, v1);
        assert_eq!(chosen.method, AllocationMethod::FeatureRule);

        // No match falls back to weighted random (draw 0 -> first variant)
        let fallback = selector.select(&exp, "stranger", Utc::now()).unwrap().unwrap();
        assert_eq!(fallback.variant_id, exp.variants[0].id);
        assert_eq!(fallback.method, AllocationMethod::WeightedRandom);
    }

    #[test]
    fn test_cohort_label_recorded_without_changing_split() {
        let mut exp = experiment(&[50.0, 50.0], None);
        exp.targeting.allocation = Some(AllocationStrategy::Cohort {
            cohorts: vec![CohortRule {
                name: "premium_users".to_string(),
                conditions: vec![FeatureCondition::new(
                    "is_premium",
                    RuleOperator::Equals,
                    json!(true),
                )],
            }],
        });

        let users = StaticUserDirectory::new();
        users.insert(
            "p",
            UserProfile {
                is_premium: Some(true),
                ..Default::default()
            },
        );
        let random = FixedRandom(75.0);
        let selector = VariantSelector::new(&users, &random);

        let chosen = selector.select(&exp, "p", Utc::now()).unwrap().unwrap();
        assert_eq!(chosen.cohort.as_deref(), Some("premium_users"));
        assert_eq!(chosen.method, AllocationMethod::Cohort);
        assert_eq!(chosen.variant_id, exp.variants[1].id);

        let other = selector.select(&exp, "q", Utc::now()).unwrap().unwrap();
        assert_eq!(other.cohort, None);
        assert_eq!(other.variant_id, exp.variants[1].id);
    }

    #[test]
    fn test_unknown_strategy_falls_back_to_weighted_random() {
        let exp = experiment(&[50.0, 50.0], Some(AllocationStrategy::Unknown));
        let users = StaticUserDirectory::new();
        let random = SeededRandom::new(3);
        let chosen = VariantSelector::new(&users, &random)
            .select(&exp, "u", Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(chosen.method, AllocationMethod::WeightedRandom);
    }

    #[test]
    fn test_duplicate_insert_reads_back_existing() {
        let store = InMemoryStore::new();
        let first = Allocation {
            variant_id: "v1".to_string(),
            method: AllocationMethod::Hash,
            cohort: None,
        }
        .into_assignment("e", "u", Utc::now());
        let second = Assignment {
            variant_id: "v2".to_string(),
            ..first.clone()
        };

        assert!(matches!(
            persist_assignment(&store, first).unwrap(),
            Persisted::Created(_)
        ));
        let raced = persist_assignment(&store, second).unwrap();
        assert!(matches!(raced, Persisted::Existing(_)));
        assert_eq!(raced.assignment().variant_id, "v1");
    }
}

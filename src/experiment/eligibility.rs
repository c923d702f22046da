//! Eligibility filter: status, segment allow-list, field criteria, sampling
//!
//! Checks short-circuit in that order. The sampling draw is not sticky; once an
//! assignment exists the engine never consults this filter again.

use chrono::{DateTime, Utc};

use super::random::RandomSource;
use super::targeting::TargetingCriteria;
use super::types::Experiment;
use super::user::{segment_of, SegmentThresholds, UserProfile};
use crate::constants::TRAFFIC_SCALE;

/// Outcome of an eligibility check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    NotActive,
    SegmentExcluded,
    /// Names the first criterion that failed
    CriteriaFailed(&'static str),
    NotSampled,
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Eligibility::Eligible => "eligible",
            Eligibility::NotActive => "not_active",
            Eligibility::SegmentExcluded => "segment_excluded",
            Eligibility::CriteriaFailed(_) => "criteria_failed",
            Eligibility::NotSampled => "not_sampled",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EligibilityFilter {
    thresholds: SegmentThresholds,
}

impl EligibilityFilter {
    pub fn new(thresholds: SegmentThresholds) -> Self {
        Self { thresholds }
    }

    pub fn is_eligible(
        &self,
        profile: Option<&UserProfile>,
        experiment: &Experiment,
        now: DateTime<Utc>,
        random: &dyn RandomSource,
    ) -> bool {
        self.check(profile, experiment, now, random).is_eligible()
    }

    /// Full check. An unknown user (`None` profile) only passes experiments
    /// without segment or criteria targeting.
    pub fn check(
        &self,
        profile: Option<&UserProfile>,
        experiment: &Experiment,
        now: DateTime<Utc>,
        random: &dyn RandomSource,
    ) -> Eligibility {
        if !experiment.is_active() {
            return Eligibility::NotActive;
        }

        let targeting = &experiment.targeting;

        if let Some(segments) = &targeting.segments {
            let Some(profile) = profile else {
                return Eligibility::SegmentExcluded;
            };
            let segment = segment_of(profile, now, &self.thresholds);
            if !segments.iter().any(|s| s == segment.as_str()) {
                return Eligibility::SegmentExcluded;
            }
        }

        if let Some(criteria) = &targeting.criteria {
            if let Err(failed) = check_criteria(criteria, profile, now) {
                return Eligibility::CriteriaFailed(failed);
            }
        }

        if let Some(percentage) = targeting.sampling_percentage {
            if percentage < TRAFFIC_SCALE && random.next_percent() > percentage {
                return Eligibility::NotSampled;
            }
        }

        Eligibility::Eligible
    }
}

/// AND of every set criterion. Missing data fails only the criteria that need it.
fn check_criteria(
    criteria: &TargetingCriteria,
    profile: Option<&UserProfile>,
    now: DateTime<Utc>,
) -> Result<(), &'static str> {
    fn require<T: PartialOrd + Copy>(
        name: &'static str,
        actual: Option<T>,
        bound: Option<T>,
        ok: fn(T, T) -> bool,
    ) -> Result<(), &'static str> {
        match (bound, actual) {
            (None, _) => Ok(()),
            (Some(b), Some(a)) if ok(a, b) => Ok(()),
            _ => Err(name),
        }
    }

    fn at_least<T: PartialOrd>(a: T, b: T) -> bool {
        a >= b
    }
    fn at_most<T: PartialOrd>(a: T, b: T) -> bool {
        a <= b
    }

    let level = profile.and_then(|p| p.level);
    let points = profile.and_then(|p| p.points);
    let streak = profile.and_then(|p| p.streak);
    let age = profile.and_then(|p| p.account_age_days(now));

    require("min_level", level, criteria.min_level, at_least)?;
    require("max_level", level, criteria.max_level, at_most)?;
    require("min_points", points, criteria.min_points, at_least)?;
    require("max_points", points, criteria.max_points, at_most)?;
    require("min_streak", streak, criteria.min_streak, at_least)?;
    require("min_account_age_days", age, criteria.min_account_age_days, at_least)?;
    require("max_account_age_days", age, criteria.max_account_age_days, at_most)?;

    if let Some(style) = &criteria.learning_style {
        let matches = profile
            .and_then(|p| p.learning_style.as_deref())
            .is_some_and(|s| s == style);
        if !matches {
            return Err("learning_style");
        }
    }

    if let Some(premium) = criteria.is_premium {
        if profile.and_then(|p| p.is_premium) != Some(premium) {
            return Err("is_premium");
        }
    }

    Ok(())
}

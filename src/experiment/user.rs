//! User-side inputs: profiles for eligibility, feature vectors for allocation
//!
//! Both come from the surrounding application through [`UserDirectory`].

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_HIGH_ENGAGEMENT_CONTENT, DEFAULT_HIGH_ENGAGEMENT_REVIEWS, INACTIVE_AFTER_DAYS,
    LAPSED_AFTER_DAYS, NEW_USER_MAX_AGE_DAYS, RETURNING_REVIEW_WINDOW_DAYS,
};
use crate::errors::Result;

/// Gamification attributes of a user. Missing values are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub level: Option<u32>,
    pub points: Option<i64>,
    pub streak: Option<u32>,
    pub experience: Option<i64>,
    pub learning_style: Option<String>,
    #[serde(default)]
    pub learning_style_scores: BTreeMap<String, f64>,
    pub is_premium: Option<bool>,
    pub account_created_at: Option<DateTime<Utc>>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub last_review_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content_count: u64,
    #[serde(default)]
    pub review_count: u64,
}

impl UserProfile {
    pub fn account_age_days(&self, now: DateTime<Utc>) -> Option<i64> {
        self.account_created_at
            .map(|created| now.signed_duration_since(created).num_days())
    }

    pub fn days_inactive(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_active_at
            .map(|last| now.signed_duration_since(last).num_days())
    }

    pub fn days_since_review(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_review_at
            .map(|last| now.signed_duration_since(last).num_days())
    }
}

/// Segment used for allow-list targeting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserSegment {
    New,
    Returning,
    Inactive,
    Active,
    HighEngagement,
    Premium,
    Regular,
}

impl UserSegment {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserSegment::New => "new",
            UserSegment::Returning => "returning",
            UserSegment::Inactive => "inactive",
            UserSegment::Active => "active",
            UserSegment::HighEngagement => "high_engagement",
            UserSegment::Premium => "premium",
            UserSegment::Regular => "regular",
        }
    }
}

/// Volume thresholds for the `high_engagement` segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentThresholds {
    pub high_engagement_content: u64,
    pub high_engagement_reviews: u64,
}

impl Default for SegmentThresholds {
    fn default() -> Self {
        Self {
            high_engagement_content: DEFAULT_HIGH_ENGAGEMENT_CONTENT,
            high_engagement_reviews: DEFAULT_HIGH_ENGAGEMENT_REVIEWS,
        }
    }
}

/// Classify a user. First matching rule wins:
/// new account, lapsed but recently reviewing, inactive, active, high volume,
/// premium, regular. The activity rules only apply when last activity is known.
pub fn segment_of(
    profile: &UserProfile,
    now: DateTime<Utc>,
    thresholds: &SegmentThresholds,
) -> UserSegment {
    if let Some(age) = profile.account_age_days(now) {
        if age < NEW_USER_MAX_AGE_DAYS {
            return UserSegment::New;
        }
    }

    if let Some(inactive) = profile.days_inactive(now) {
        let reviewed_recently = profile
            .days_since_review(now)
            .is_some_and(|d| d <= RETURNING_REVIEW_WINDOW_DAYS);

        if inactive >= LAPSED_AFTER_DAYS && reviewed_recently {
            return UserSegment::Returning;
        }
        if (INACTIVE_AFTER_DAYS..LAPSED_AFTER_DAYS).contains(&inactive) {
            return UserSegment::Inactive;
        }
        if inactive < INACTIVE_AFTER_DAYS {
            return UserSegment::Active;
        }
    }

    if profile.content_count >= thresholds.high_engagement_content
        || profile.review_count >= thresholds.high_engagement_reviews
    {
        return UserSegment::HighEngagement;
    }

    if profile.is_premium == Some(true) {
        return UserSegment::Premium;
    }

    UserSegment::Regular
}

/// Named feature values consumed by rule and cohort allocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserFeatures(pub BTreeMap<String, serde_json::Value>);

impl UserFeatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: serde_json::Value) -> Self {
        self.0.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name)
    }

    /// Standard feature vector derived from a profile
    pub fn from_profile(profile: &UserProfile, now: DateTime<Utc>) -> Self {
        use serde_json::json;

        let mut features = BTreeMap::new();
        if let Some(level) = profile.level {
            features.insert("level".to_string(), json!(level));
        }
        if let Some(points) = profile.points {
            features.insert("points".to_string(), json!(points));
        }
        if let Some(streak) = profile.streak {
            features.insert("streak".to_string(), json!(streak));
        }
        if let Some(experience) = profile.experience {
            features.insert("experience".to_string(), json!(experience));
        }
        if let Some(premium) = profile.is_premium {
            features.insert("is_premium".to_string(), json!(premium));
        }
        if let Some(age) = profile.account_age_days(now) {
            features.insert("account_age_days".to_string(), json!(age));
        }
        if let Some(style) = &profile.learning_style {
            features.insert("learning_style".to_string(), json!(style));
        }
        for (style, score) in &profile.learning_style_scores {
            features.insert(format!("learning_style.{style}"), json!(score));
        }
        features.insert(
            "activity_count".to_string(),
            json!(profile.content_count + profile.review_count),
        );
        features.insert("content_count".to_string(), json!(profile.content_count));
        features.insert("review_count".to_string(), json!(profile.review_count));

        Self(features)
    }
}

/// Application-supplied lookup of user attributes
pub trait UserDirectory: Send + Sync {
    /// Profile for eligibility checks; `None` for unknown users
    fn profile(&self, user_id: &str) -> Result<Option<UserProfile>>;

    /// Feature vector for rule and cohort allocation
    fn features(&self, user_id: &str, now: DateTime<Utc>) -> Result<UserFeatures> {
        Ok(self
            .profile(user_id)?
            .map(|p| UserFeatures::from_profile(&p, now))
            .unwrap_or_default())
    }
}

/// In-process directory for tests and embedded use
#[derive(Default)]
pub struct StaticUserDirectory {
    profiles: RwLock<HashMap<String, UserProfile>>,
}

impl StaticUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_id: &str, profile: UserProfile) {
        self.profiles.write().insert(user_id.to_string(), profile);
    }
}

impl UserDirectory for StaticUserDirectory {
    fn profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.profiles.read().get(user_id).cloned())
    }
}

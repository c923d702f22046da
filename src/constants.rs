//! Documented constants for the experiment engine
//!
//! Every threshold the analyzer, report generator and segmentation use lives
//! here. The statistical thresholds were tuned against the approximate
//! formulas in `experiment::analysis`; change them together or not at all.

// =============================================================================
// ASSIGNMENT
// =============================================================================

/// Traffic shares are percentages; allocation draws live in [0, 100).
pub const TRAFFIC_SCALE: f64 = 100.0;

/// Modulus applied to the user-id hash for hash-based allocation.
pub const HASH_BUCKETS: i64 = 100;

/// Rounding drift tolerated when validating that traffic shares sum to 100.
pub const TRAFFIC_SHARE_TOLERANCE: f64 = 0.5;

// =============================================================================
// SEGMENTATION
// =============================================================================

/// Accounts younger than this are in the `new` segment.
pub const NEW_USER_MAX_AGE_DAYS: i64 = 30;

/// Inactivity (days) at which a user is no longer `active`.
pub const INACTIVE_AFTER_DAYS: i64 = 7;

/// Inactivity (days) after which a user counts as lapsed (`returning` if they
/// reviewed recently).
pub const LAPSED_AFTER_DAYS: i64 = 30;

/// A review within this many days turns a lapsed user into `returning`.
pub const RETURNING_REVIEW_WINDOW_DAYS: i64 = 7;

/// Content items created at or above which a user is `high_engagement`.
pub const DEFAULT_HIGH_ENGAGEMENT_CONTENT: u64 = 50;

/// Reviews completed at or above which a user is `high_engagement`.
pub const DEFAULT_HIGH_ENGAGEMENT_REVIEWS: u64 = 200;

// =============================================================================
// AGGREGATION
// =============================================================================

/// Compare-and-swap attempts per observation before giving up with a conflict.
pub const DEFAULT_MAX_CAS_RETRIES: u32 = 16;

// =============================================================================
// COMPARISON STATISTICS
// =============================================================================

/// Divisor mapping a z-score onto the confidence scale (`z / 3`).
pub const CONFIDENCE_Z_DIVISOR: f64 = 3.0;

/// Lower clamp for confidence. Degenerate comparisons land here.
pub const MIN_CONFIDENCE: f64 = 0.5;

/// Upper clamp for confidence.
pub const MAX_CONFIDENCE: f64 = 0.99;

/// Confidence a comparison must exceed to be significant.
pub const SIGNIFICANCE_CONFIDENCE: f64 = 0.95;

/// Absolute percentage change a comparison must exceed to be significant.
pub const SIGNIFICANCE_MIN_CHANGE_PCT: f64 = 5.0;

/// Two-sided 95% critical value used for confidence intervals.
pub const Z_CRITICAL_95: f64 = 1.96;

/// Default significance level for the power calculation.
pub const DEFAULT_POWER_ALPHA: f64 = 0.05;

/// |r| above which two metrics are reported as strongly correlated.
pub const STRONG_CORRELATION: f64 = 0.7;

// =============================================================================
// REPORTING
// =============================================================================

/// Winner confidence at or above which risk is low and adoption is advised.
pub const ADOPT_CONFIDENCE: f64 = 0.95;

/// Lift (%) that must be exceeded to advise adoption.
pub const ADOPT_MIN_LIFT_PCT: f64 = 5.0;

/// Winner confidence at or above which we lean toward adoption.
pub const LEAN_CONFIDENCE: f64 = 0.9;

/// Lift (%) that must be exceeded to lean toward adoption.
pub const LEAN_MIN_LIFT_PCT: f64 = 2.0;

/// Winner confidence below which risk is high.
pub const HIGH_RISK_CONFIDENCE: f64 = 0.8;

/// Chi-squared critical values at p=0.01 for df=1..=5, used for sample ratio
/// mismatch. Larger df fall back to the Wilson-Hilferty approximation.
pub const SRM_CHI_SQUARED_CRITICAL: [f64; 5] = [6.635, 9.210, 11.345, 13.277, 15.086];

/// Upper-tail normal quantile for p=0.01 (Wilson-Hilferty fallback).
pub const SRM_Z_001: f64 = 2.326;

/// Minimum assignments before a sample ratio mismatch check is meaningful.
pub const SRM_MIN_ASSIGNMENTS: u64 = 100;

// =============================================================================
// CACHING
// =============================================================================

/// Lifetime of a memoized per-user merged variant configuration.
pub const DEFAULT_CONFIG_CACHE_TTL_SECS: u64 = 300;

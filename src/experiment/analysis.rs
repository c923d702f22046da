//! Statistical analysis of aggregated results
//!
//! All statistics here are deliberate normal approximations: the comparison
//! standard error treats every metric like a proportion, p-values use the
//! Abramowitz-Stegun erf polynomial, and power uses an inverse-normal rational
//! approximation. Report thresholds are calibrated against exactly these
//! formulas. None of these functions fail on degenerate input; they fall back to
//! neutral values instead.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::types::{Comparison, Experiment, MetricId, MetricResult, VariantId};
use crate::constants::{
    CONFIDENCE_Z_DIVISOR, MAX_CONFIDENCE, MIN_CONFIDENCE, SIGNIFICANCE_CONFIDENCE,
    SIGNIFICANCE_MIN_CHANGE_PCT, SRM_CHI_SQUARED_CRITICAL, SRM_MIN_ASSIGNMENTS, SRM_Z_001,
    STRONG_CORRELATION, Z_CRITICAL_95,
};

// =============================================================================
// ANALYSIS RESULTS
// =============================================================================

/// One variant's aggregate for a metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantMetricView {
    pub variant_id: VariantId,
    pub variant_name: String,
    pub value: f64,
    pub sample_size: u64,
    /// None for the baseline and for metrics without enough data
    pub comparison: Option<Comparison>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricAnalysis {
    pub metric_id: MetricId,
    pub metric_name: String,
    /// First-listed variant, set only when it and another variant reported
    pub baseline_variant_id: Option<VariantId>,
    /// Reporting variants in experiment order
    pub variants: Vec<VariantMetricView>,
}

impl MetricAnalysis {
    pub fn has_comparison(&self) -> bool {
        self.baseline_variant_id.is_some()
    }

    /// Reporting variant with the highest raw value; ties go to the earlier variant
    pub fn best_variant(&self) -> Option<&VariantMetricView> {
        self.variants.iter().fold(None, |best, v| match best {
            Some(b) if b.value >= v.value => Some(b),
            _ => Some(v),
        })
    }
}

/// Pearson correlation of a secondary metric with the primary across variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationInsight {
    pub primary_metric_id: MetricId,
    pub metric_id: MetricId,
    pub metric_name: String,
    pub coefficient: f64,
    pub strong: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentAnalysis {
    pub experiment_id: String,
    pub metrics: Vec<MetricAnalysis>,
    pub correlations: Vec<CorrelationInsight>,
}

impl ExperimentAnalysis {
    pub fn has_sufficient_data(&self) -> bool {
        self.metrics.iter().any(|m| m.has_comparison())
    }

    pub fn metric(&self, metric_id: &str) -> Option<&MetricAnalysis> {
        self.metrics.iter().find(|m| m.metric_id == metric_id)
    }
}

/// Per-metric summary for one variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricStatistics {
    pub metric_id: MetricId,
    pub metric_name: String,
    pub sample_size: u64,
    pub mean: f64,
    pub std_dev: f64,
    pub standard_error: f64,
    /// 95% interval, mean ± 1.96·SE
    pub confidence_interval: (f64, f64),
    /// Two-sided, testing mean = 0
    pub p_value: f64,
    /// mean / std_dev
    pub effect_size: f64,
    pub power: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantStatistics {
    pub experiment_id: String,
    pub variant_id: VariantId,
    pub variant_name: String,
    pub metrics: Vec<MetricStatistics>,
}

/// Sample ratio mismatch check over assignment counts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SrmCheck {
    /// False when there were too few assignments or variants to test
    pub checked: bool,
    pub total_assignments: u64,
    pub chi_squared: f64,
    pub degrees_of_freedom: usize,
    pub critical_value: f64,
    pub mismatch: bool,
}

impl SrmCheck {
    fn unchecked(total_assignments: u64) -> Self {
        Self {
            checked: false,
            total_assignments,
            chi_squared: 0.0,
            degrees_of_freedom: 0,
            critical_value: 0.0,
            mismatch: false,
        }
    }
}

// =============================================================================
// ANALYZER
// =============================================================================

pub struct StatisticalAnalyzer;

impl StatisticalAnalyzer {
    /// Compare every reporting variant against the baseline, per metric.
    ///
    /// The baseline is always the first variant in the experiment's list. A
    /// metric gets comparisons only when the baseline and at least one other
    /// variant have rows; otherwise every comparison is cleared.
    pub fn analyze(experiment: &Experiment, results: &[MetricResult]) -> ExperimentAnalysis {
        let by_key: HashMap<(&str, &str), &MetricResult> = results
            .iter()
            .filter(|r| r.key.experiment_id == experiment.id)
            .map(|r| ((r.key.variant_id.as_str(), r.key.metric_id.as_str()), r))
            .collect();

        let metrics: Vec<MetricAnalysis> = experiment
            .metrics
            .iter()
            .map(|metric| {
                let reporting: Vec<(&str, &MetricResult)> = experiment
                    .variants
                    .iter()
                    .filter_map(|v| {
                        by_key
                            .get(&(v.id.as_str(), metric.id.as_str()))
                            .map(|r| (v.name.as_str(), *r))
                    })
                    .collect();

                let baseline = experiment
                    .variants
                    .first()
                    .and_then(|v| by_key.get(&(v.id.as_str(), metric.id.as_str())).copied())
                    .filter(|_| reporting.len() >= 2);

                let variants = reporting
                    .iter()
                    .map(|(name, row)| VariantMetricView {
                        variant_id: row.key.variant_id.clone(),
                        variant_name: name.to_string(),
                        value: row.value,
                        sample_size: row.sample_size,
                        comparison: match baseline {
                            Some(b) if b.key.variant_id != row.key.variant_id => {
                                Some(Self::compare(b, row))
                            }
                            _ => None,
                        },
                    })
                    .collect();

                MetricAnalysis {
                    metric_id: metric.id.clone(),
                    metric_name: metric.name.clone(),
                    baseline_variant_id: baseline.map(|b| b.key.variant_id.clone()),
                    variants,
                }
            })
            .collect();

        let correlations = Self::correlations(experiment, &metrics);

        ExperimentAnalysis {
            experiment_id: experiment.id.clone(),
            metrics,
            correlations,
        }
    }

    /// Baseline-relative comparison with the proportion-style standard error
    pub fn compare(baseline: &MetricResult, variant: &MetricResult) -> Comparison {
        let b = baseline.value;
        let v = variant.value;
        let change = v - b;
        let change_percentage = if b == 0.0 { 0.0 } else { change / b * 100.0 };

        let se = Self::comparison_standard_error(
            v,
            variant.sample_size as f64,
            b,
            baseline.sample_size as f64,
        );
        let z = change.abs() / se;
        let confidence = Self::confidence_from_z(z);
        let significant = confidence > SIGNIFICANCE_CONFIDENCE
            && change_percentage.abs() > SIGNIFICANCE_MIN_CHANGE_PCT;

        Comparison {
            change,
            change_percentage,
            confidence,
            significant,
        }
    }

    /// `sqrt(v(1-v)/n_v + b(1-b)/n_b)`, or 1 when that is not a positive number
    pub fn comparison_standard_error(v: f64, n_v: f64, b: f64, n_b: f64) -> f64 {
        let se = (v * (1.0 - v) / n_v + b * (1.0 - b) / n_b).sqrt();
        if se.is_finite() && se > 0.0 {
            se
        } else {
            1.0
        }
    }

    /// `clamp(z / 3, 0.5, 0.99)`; NaN maps to the floor
    pub fn confidence_from_z(z: f64) -> f64 {
        if z.is_nan() {
            return MIN_CONFIDENCE;
        }
        (z / CONFIDENCE_Z_DIVISOR).clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
    }

    /// Detailed per-metric statistics for one variant
    pub fn detailed_statistics(
        experiment: &Experiment,
        variant_id: &str,
        results: &[MetricResult],
        alpha: f64,
    ) -> Option<VariantStatistics> {
        let variant = experiment.variant(variant_id)?;

        let metrics = experiment
            .metrics
            .iter()
            .map(|metric| {
                let row = results.iter().find(|r| {
                    r.key.experiment_id == experiment.id
                        && r.key.variant_id == variant_id
                        && r.key.metric_id == metric.id
                });
                Self::metric_statistics(&metric.id, &metric.name, row, alpha)
            })
            .collect();

        Some(VariantStatistics {
            experiment_id: experiment.id.clone(),
            variant_id: variant.id.clone(),
            variant_name: variant.name.clone(),
            metrics,
        })
    }

    fn metric_statistics(
        metric_id: &str,
        metric_name: &str,
        row: Option<&MetricResult>,
        alpha: f64,
    ) -> MetricStatistics {
        let (n, mean, variance) = match row {
            Some(r) => (r.sample_size, r.value, r.sample_variance()),
            None => (0, 0.0, 0.0),
        };
        let std_dev = variance.sqrt();
        let standard_error = if n > 0 { std_dev / (n as f64).sqrt() } else { 0.0 };
        let margin = Z_CRITICAL_95 * standard_error;

        let degenerate = n < 2 || standard_error <= 0.0 || !standard_error.is_finite();
        let (p_value, effect_size, power) = if degenerate {
            (1.0, 0.0, 0.0)
        } else {
            let z = mean / standard_error;
            let d = mean / std_dev;
            (
                Self::two_sided_p_value(z),
                d,
                Self::power(d, n as f64, alpha),
            )
        };

        MetricStatistics {
            metric_id: metric_id.to_string(),
            metric_name: metric_name.to_string(),
            sample_size: n,
            mean,
            std_dev,
            standard_error,
            confidence_interval: (mean - margin, mean + margin),
            p_value,
            effect_size,
            power,
        }
    }

    /// Two-sided p-value for a z statistic, `1 - erf(|z|/√2)`
    pub fn two_sided_p_value(z: f64) -> f64 {
        (1.0 - Self::erf(z.abs() / std::f64::consts::SQRT_2)).clamp(0.0, 1.0)
    }

    /// Power of a two-sided z-test with non-centrality `|d|·√n`
    pub fn power(effect_size: f64, n: f64, alpha: f64) -> f64 {
        if n <= 0.0 || !effect_size.is_finite() || !(0.0..1.0).contains(&alpha) || alpha == 0.0 {
            return 0.0;
        }
        let ncp = effect_size.abs() * n.sqrt();
        let z_crit = Self::inverse_normal_cdf(1.0 - alpha / 2.0);
        let power = 1.0 - Self::normal_cdf(z_crit - ncp) + Self::normal_cdf(-z_crit - ncp);
        power.clamp(0.0, 1.0)
    }

    /// Error function approximation (Abramowitz-Stegun 7.1.26)
    pub fn erf(x: f64) -> f64 {
        let a1 = 0.254829592;
        let a2 = -0.284496736;
        let a3 = 1.421413741;
        let a4 = -1.453152027;
        let a5 = 1.061405429;
        let p = 0.3275911;

        let sign = if x < 0.0 { -1.0 } else { 1.0 };
        let x = x.abs();

        let t = 1.0 / (1.0 + p * x);
        let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();

        sign * y
    }

    /// Normal CDF approximation
    pub fn normal_cdf(x: f64) -> f64 {
        0.5 * (1.0 + Self::erf(x / std::f64::consts::SQRT_2))
    }

    /// Inverse normal CDF, Acklam's rational approximation
    pub fn inverse_normal_cdf(p: f64) -> f64 {
        const A: [f64; 6] = [
            -3.969683028665376e+01,
            2.209460984245205e+02,
            -2.759285104469687e+02,
            1.383577518672690e+02,
            -3.066479806614716e+01,
            2.506628277459239e+00,
        ];
        const B: [f64; 5] = [
            -5.447609879822406e+01,
            1.615858368580409e+02,
            -1.556989798598866e+02,
            6.680131188771972e+01,
            -1.328068155288572e+01,
        ];
        const C: [f64; 6] = [
            -7.784894002430293e-03,
            -3.223964580411365e-01,
            -2.400758277161838e+00,
            -2.549732539343734e+00,
            4.374664141464968e+00,
            2.938163982698783e+00,
        ];
        const D: [f64; 4] = [
            7.784695709041462e-03,
            3.224671290700398e-01,
            2.445134137142996e+00,
            3.754408661907416e+00,
        ];
        const P_LOW: f64 = 0.02425;

        if p <= 0.0 {
            return f64::NEG_INFINITY;
        }
        if p >= 1.0 {
            return f64::INFINITY;
        }

        if p < P_LOW {
            let q = (-2.0 * p.ln()).sqrt();
            (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
                / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
        } else if p <= 1.0 - P_LOW {
            let q = p - 0.5;
            let r = q * q;
            (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
                / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
        } else {
            let q = (-2.0 * (1.0 - p).ln()).sqrt();
            -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
                / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
        }
    }

    /// Pearson correlation; None below three points or with zero variance
    pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
        let n = xs.len().min(ys.len());
        if n < 3 {
            return None;
        }
        let (xs, ys) = (&xs[..n], &ys[..n]);
        let mean_x = xs.iter().sum::<f64>() / n as f64;
        let mean_y = ys.iter().sum::<f64>() / n as f64;

        let mut cov = 0.0;
        let mut var_x = 0.0;
        let mut var_y = 0.0;
        for (x, y) in xs.iter().zip(ys) {
            let dx = x - mean_x;
            let dy = y - mean_y;
            cov += dx * dy;
            var_x += dx * dx;
            var_y += dy * dy;
        }

        let denom = (var_x * var_y).sqrt();
        if denom == 0.0 || !denom.is_finite() {
            return None;
        }
        Some((cov / denom).clamp(-1.0, 1.0))
    }

    /// Correlate each secondary metric with the primary over variants that
    /// reported both
    fn correlations(experiment: &Experiment, metrics: &[MetricAnalysis]) -> Vec<CorrelationInsight> {
        let Some(primary) = metrics.first() else {
            return Vec::new();
        };
        let primary_values: HashMap<&str, f64> = primary
            .variants
            .iter()
            .map(|v| (v.variant_id.as_str(), v.value))
            .collect();

        metrics
            .iter()
            .skip(1)
            .filter_map(|secondary| {
                let mut xs = Vec::new();
                let mut ys = Vec::new();
                for variant in &experiment.variants {
                    let x = primary_values.get(variant.id.as_str());
                    let y = secondary
                        .variants
                        .iter()
                        .find(|v| v.variant_id == variant.id)
                        .map(|v| v.value);
                    if let (Some(x), Some(y)) = (x, y) {
                        xs.push(*x);
                        ys.push(y);
                    }
                }

                let r = Self::pearson(&xs, &ys)?;
                Some(CorrelationInsight {
                    primary_metric_id: primary.metric_id.clone(),
                    metric_id: secondary.metric_id.clone(),
                    metric_name: secondary.metric_name.clone(),
                    coefficient: r,
                    strong: r.abs() > STRONG_CORRELATION,
                })
            })
            .collect()
    }

    /// Chi-squared goodness of fit of assignment counts against traffic shares.
    /// Variants with a zero share are left out.
    pub fn check_srm(experiment: &Experiment, counts: &BTreeMap<VariantId, u64>) -> SrmCheck {
        let total: u64 = experiment
            .variants
            .iter()
            .map(|v| counts.get(&v.id).copied().unwrap_or(0))
            .sum();

        let weighted: Vec<(f64, u64)> = experiment
            .variants
            .iter()
            .filter(|v| v.traffic_share > 0.0)
            .map(|v| (v.traffic_share, counts.get(&v.id).copied().unwrap_or(0)))
            .collect();
        let share_sum: f64 = weighted.iter().map(|(s, _)| s).sum();

        if total < SRM_MIN_ASSIGNMENTS || weighted.len() < 2 || share_sum <= 0.0 {
            return SrmCheck::unchecked(total);
        }

        let chi_squared: f64 = weighted
            .iter()
            .map(|(share, observed)| {
                let expected = total as f64 * share / share_sum;
                (*observed as f64 - expected).powi(2) / expected
            })
            .sum();

        let df = weighted.len() - 1;
        let critical_value = Self::chi_squared_critical_001(df);

        SrmCheck {
            checked: true,
            total_assignments: total,
            chi_squared,
            degrees_of_freedom: df,
            critical_value,
            mismatch: chi_squared > critical_value,
        }
    }

    /// Critical value at p = 0.01: table for small df, Wilson-Hilferty beyond
    fn chi_squared_critical_001(df: usize) -> f64 {
        if let Some(value) = df
            .checked_sub(1)
            .and_then(|i| SRM_CHI_SQUARED_CRITICAL.get(i))
        {
            return *value;
        }
        let k = df as f64;
        let h = 2.0 / (9.0 * k);
        k * (1.0 - h + SRM_Z_001 * h.sqrt()).powi(3)
    }
}

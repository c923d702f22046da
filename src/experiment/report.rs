//! Narrative report: winner, risk, recommendation and next steps

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::analysis::{ExperimentAnalysis, SrmCheck};
use super::types::{Experiment, ExperimentStatus, MetricId, VariantId};
use crate::constants::{
    ADOPT_CONFIDENCE, ADOPT_MIN_LIFT_PCT, HIGH_RISK_CONFIDENCE, LEAN_CONFIDENCE,
    LEAN_MIN_LIFT_PCT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// ≥0.95 low, <0.8 high, medium between; no winner is high risk
    pub fn from_confidence(confidence: Option<f64>) -> Self {
        match confidence {
            Some(c) if c >= ADOPT_CONFIDENCE => RiskLevel::Low,
            Some(c) if c >= HIGH_RISK_CONFIDENCE => RiskLevel::Medium,
            _ => RiskLevel::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Adopt,
    LeanAdopt,
    Inconclusive,
    InsufficientData,
}

/// A metric whose best variant beat the baseline significantly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub metric_id: MetricId,
    pub metric_name: String,
    pub variant_id: VariantId,
    pub variant_name: String,
    pub lift_percentage: f64,
    pub confidence: f64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Winner {
    pub variant_id: VariantId,
    pub variant_name: String,
    pub metric_id: MetricId,
    pub confidence: f64,
    pub lift_percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub experiment_id: String,
    pub experiment_name: String,
    pub status: ExperimentStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub winner: Option<Winner>,
    pub findings: Vec<Finding>,
    pub risk_level: RiskLevel,
    pub recommendation: Recommendation,
    pub recommendation_text: String,
    pub next_steps: Vec<String>,
    /// Cross-metric observations
    pub insights: Vec<String>,
    /// Data-quality problems
    pub warnings: Vec<String>,
    pub analysis: ExperimentAnalysis,
    pub generated_at: DateTime<Utc>,
}

pub struct ReportGenerator;

impl ReportGenerator {
    pub fn generate(
        experiment: &Experiment,
        analysis: ExperimentAnalysis,
        srm: &SrmCheck,
        now: DateTime<Utc>,
    ) -> Report {
        let findings = Self::findings(&analysis);

        let winner = findings.first().map(|f| Winner {
            variant_id: f.variant_id.clone(),
            variant_name: f.variant_name.clone(),
            metric_id: f.metric_id.clone(),
            confidence: f.confidence,
            lift_percentage: f.lift_percentage,
        });

        let recommendation = if !analysis.has_sufficient_data() {
            Recommendation::InsufficientData
        } else {
            match &winner {
                Some(w) if w.confidence >= ADOPT_CONFIDENCE && w.lift_percentage > ADOPT_MIN_LIFT_PCT => {
                    Recommendation::Adopt
                }
                Some(w) if w.confidence >= LEAN_CONFIDENCE && w.lift_percentage > LEAN_MIN_LIFT_PCT => {
                    Recommendation::LeanAdopt
                }
                _ => Recommendation::Inconclusive,
            }
        };

        let risk_level = RiskLevel::from_confidence(winner.as_ref().map(|w| w.confidence));
        let recommendation_text = Self::recommendation_text(recommendation, winner.as_ref());
        let next_steps = Self::next_steps(recommendation, winner.as_ref());

        let insights = analysis
            .correlations
            .iter()
            .filter(|c| c.strong)
            .map(|c| {
                let primary = analysis
                    .metric(&c.primary_metric_id)
                    .map(|m| m.metric_name.as_str())
                    .unwrap_or("primary metric");
                format!(
                    "Strong {} correlation (r = {:.2}) between {} and {}",
                    if c.coefficient > 0.0 { "positive" } else { "negative" },
                    c.coefficient,
                    c.metric_name,
                    primary
                )
            })
            .collect();

        let mut warnings = Vec::new();
        if srm.mismatch {
            warnings.push(format!(
                "Sample ratio mismatch: assignment counts deviate from configured traffic shares \
                 (chi-squared {:.2} > {:.3}, {} assignments). Check allocation before trusting results.",
                srm.chi_squared, srm.critical_value, srm.total_assignments
            ));
        }

        Report {
            experiment_id: experiment.id.clone(),
            experiment_name: experiment.name.clone(),
            status: experiment.status,
            started_at: experiment.started_at,
            ended_at: experiment.ended_at,
            winner,
            findings,
            risk_level,
            recommendation,
            recommendation_text,
            next_steps,
            insights,
            warnings,
            analysis,
            generated_at: now,
        }
    }

    /// Best variant per metric by raw value, kept when its comparison is significant
    fn findings(analysis: &ExperimentAnalysis) -> Vec<Finding> {
        analysis
            .metrics
            .iter()
            .filter_map(|metric| {
                let best = metric.best_variant()?;
                let comparison = best.comparison.filter(|c| c.significant)?;
                Some(Finding {
                    metric_id: metric.metric_id.clone(),
                    metric_name: metric.metric_name.clone(),
                    variant_id: best.variant_id.clone(),
                    variant_name: best.variant_name.clone(),
                    lift_percentage: comparison.change_percentage,
                    confidence: comparison.confidence,
                    message: format!(
                        "{} improved {} by {:.1}% ({:.0}% confidence)",
                        best.variant_name,
                        metric.metric_name,
                        comparison.change_percentage,
                        comparison.confidence * 100.0
                    ),
                })
            })
            .collect()
    }

    fn recommendation_text(recommendation: Recommendation, winner: Option<&Winner>) -> String {
        match (recommendation, winner) {
            (Recommendation::Adopt, Some(w)) => format!(
                "Adopt {}: {:.1}% lift at {:.0}% confidence.",
                w.variant_name,
                w.lift_percentage,
                w.confidence * 100.0
            ),
            (Recommendation::LeanAdopt, Some(w)) => format!(
                "Lean toward adopting {} ({:.1}% lift at {:.0}% confidence) but keep observing.",
                w.variant_name,
                w.lift_percentage,
                w.confidence * 100.0
            ),
            (Recommendation::InsufficientData, _) => {
                "Insufficient data: no metric has results from at least two variants yet."
                    .to_string()
            }
            _ => "Inconclusive: keep collecting data or redesign the experiment.".to_string(),
        }
    }

    fn next_steps(recommendation: Recommendation, winner: Option<&Winner>) -> Vec<String> {
        let name = winner.map(|w| w.variant_name.as_str()).unwrap_or("the leading variant");
        match recommendation {
            Recommendation::Adopt => vec![
                format!("Roll out {name} to all users"),
                "Monitor the primary metric after rollout for regressions".to_string(),
                "Complete the experiment and archive its configuration".to_string(),
            ],
            Recommendation::LeanAdopt => vec![
                "Extend the test to reach higher confidence".to_string(),
                format!("Consider a gradual rollout of {name}"),
                "Re-check secondary metrics before committing".to_string(),
            ],
            Recommendation::Inconclusive => vec![
                "Keep the experiment running to collect more data".to_string(),
                "Consider redesigning variants with a larger expected effect".to_string(),
            ],
            Recommendation::InsufficientData => vec![
                "Verify that metric events are being recorded for every variant".to_string(),
                "Keep the experiment running until each variant reports results".to_string(),
            ],
        }
    }
}

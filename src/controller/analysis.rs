//! Analysis engine: scores a release step from its metric checks
//!
//! Every check is evaluated concurrently with a per-query deadline. A check that
//! cannot be evaluated is Inconclusive, never an error; the engine always
//! produces an `AnalysisRun`.
//!
//! Checks with predictive analysis enabled also fit a least-squares line
//! through their recorded values. A passing check whose slope exceeds its
//! trend threshold marks the run as trending worse.

use crate::controller::condition::Condition;
use crate::controller::prometheus::{EvalError, MetricEvaluator};
use crate::controller::release::status::parse_timestamp;
use crate::crd::release::{AnalysisRun, MetricCheck, MetricResult, Verdict};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Inconclusive runs tolerated in a row when the strategy does not set a limit
pub const DEFAULT_INCONCLUSIVE_LIMIT: u32 = 3;

/// Per-query deadline when none is configured
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AnalysisEngine {
    evaluator: Arc<dyn MetricEvaluator>,
    query_timeout: Duration,
}

impl AnalysisEngine {
    pub fn new(evaluator: Arc<dyn MetricEvaluator>, query_timeout: Duration) -> Self {
        Self {
            evaluator,
            query_timeout,
        }
    }

    /// Run one analysis cycle
    ///
    /// `history` holds the earlier runs of this release, oldest first.
    /// `prior_inconclusive` is the number of inconclusive runs immediately
    /// preceding this one. When this run is also inconclusive and the streak
    /// would exceed `inconclusive_limit`, the run is escalated to Fail.
    pub async fn evaluate(
        &self,
        checks: &[MetricCheck],
        history: &[AnalysisRun],
        step_index: u32,
        prior_inconclusive: u32,
        inconclusive_limit: u32,
        now: DateTime<Utc>,
    ) -> AnalysisRun {
        let mut metric_results: Vec<MetricResult> =
            join_all(checks.iter().map(|check| self.evaluate_check(check))).await;
        for (check, result) in checks.iter().zip(metric_results.iter_mut()) {
            apply_trend(check, result, history, now);
        }

        let mut overall = overall_verdict(&metric_results);
        let mut escalated = false;
        if overall == Verdict::Inconclusive && prior_inconclusive + 1 > inconclusive_limit {
            warn!(
                step = step_index,
                streak = prior_inconclusive + 1,
                limit = inconclusive_limit,
                "Inconclusive analysis limit exceeded, escalating to failure"
            );
            overall = Verdict::Fail;
            escalated = true;
        }

        let trending_worse =
            overall != Verdict::Fail && metric_results.iter().any(|r| r.trending_worse);

        debug!(
            step = step_index,
            verdict = ?overall,
            trending_worse,
            checks = checks.len(),
            "Analysis run complete"
        );

        AnalysisRun {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now.to_rfc3339(),
            step_index,
            metric_results,
            overall_verdict: overall,
            escalated,
            trending_worse,
        }
    }

    async fn evaluate_check(&self, check: &MetricCheck) -> MetricResult {
        let outcome =
            match tokio::time::timeout(self.query_timeout, self.evaluator.evaluate(&check.query))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(EvalError::Timeout(self.query_timeout)),
            };

        match outcome {
            Ok(value) => {
                let (verdict, error) = score(check, value);
                MetricResult {
                    name: check.name.clone(),
                    query: check.query.clone(),
                    value: Some(value).filter(|v| v.is_finite()),
                    verdict,
                    error,
                    slope: None,
                    trending_worse: false,
                }
            }
            Err(e) => {
                warn!(metric = %check.name, error = %e, "Metric evaluation failed");
                MetricResult {
                    name: check.name.clone(),
                    query: check.query.clone(),
                    value: None,
                    verdict: Verdict::Inconclusive,
                    error: Some(e.to_string()),
                    slope: None,
                    trending_worse: false,
                }
            }
        }
    }
}

/// Flag a passing result whose recorded values rise faster than allowed
fn apply_trend(
    check: &MetricCheck,
    result: &mut MetricResult,
    history: &[AnalysisRun],
    now: DateTime<Utc>,
) {
    let Some(predictive) = check.predictive_analysis.as_ref().filter(|p| p.enabled) else {
        return;
    };
    let Some(current) = result.value else {
        return;
    };
    if result.verdict != Verdict::Pass {
        return;
    }

    let mut points = metric_history(&check.name, history, now);
    points.push((0.0, current));
    result.slope = analyze_trend(&points);

    if let Some(slope) = result.slope {
        if slope > predictive.threshold() {
            warn!(
                metric = %check.name,
                slope,
                threshold = predictive.threshold(),
                "Metric is trending worse"
            );
            result.trending_worse = true;
        }
    }
}

/// Recorded values of one metric as `(seconds relative to now, value)`
fn metric_history(name: &str, history: &[AnalysisRun], now: DateTime<Utc>) -> Vec<(f64, f64)> {
    history
        .iter()
        .filter_map(|run| {
            let at = parse_timestamp(&run.timestamp)?;
            let value = run.metric_results.iter().find(|r| r.name == name)?.value?;
            Some(((at - now).num_milliseconds() as f64 / 1000.0, value))
        })
        .collect()
}

/// Least-squares slope through `(x, y)` points
///
/// None with fewer than two points or when every x is the same.
pub fn analyze_trend(points: &[(f64, f64)]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let (sum_x, sum_y, sum_xy, sum_xx) = points.iter().fold(
        (0.0, 0.0, 0.0, 0.0),
        |(sx, sy, sxy, sxx), (x, y)| (sx + x, sy + y, sxy + x * y, sxx + x * x),
    );
    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator <= f64::EPSILON {
        return None;
    }
    Some((n * sum_xy - sum_x * sum_y) / denominator)
}

/// Score one metric value against its success/failure conditions
fn score(check: &MetricCheck, value: f64) -> (Verdict, Option<String>) {
    let failure = match &check.failure_condition {
        Some(expr) => match Condition::parse(expr).and_then(|c| c.evaluate(value)) {
            Ok(holds) => Some(holds),
            Err(e) => return (Verdict::Inconclusive, Some(e.to_string())),
        },
        None => None,
    };

    let success = match Condition::parse(&check.success_condition).and_then(|c| c.evaluate(value))
    {
        Ok(holds) => holds,
        Err(e) => return (Verdict::Inconclusive, Some(e.to_string())),
    };

    let verdict = match (failure, success) {
        (Some(true), _) => Verdict::Fail,
        (_, true) => Verdict::Pass,
        (None, false) => Verdict::Fail,
        (Some(false), false) => Verdict::Inconclusive,
    };
    (verdict, None)
}

/// Fail dominates Inconclusive, which dominates Pass. No checks means Pass.
pub fn overall_verdict(results: &[MetricResult]) -> Verdict {
    if results.iter().any(|r| r.verdict == Verdict::Fail) {
        Verdict::Fail
    } else if results.iter().any(|r| r.verdict == Verdict::Inconclusive) {
        Verdict::Inconclusive
    } else {
        Verdict::Pass
    }
}

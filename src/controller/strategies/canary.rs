//! Canary delivery strategy
//!
//! Progressive traffic shifting through `trafficSteps`, holding each split for
//! `analysisInterval` and analyzing it before moving on.

use super::ReleaseStrategy;
use crate::controller::analysis::DEFAULT_INCONCLUSIVE_LIMIT;
use crate::controller::release::traffic::calculate_replica_split;
use crate::controller::release::validation::{parse_duration, ValidationError};
use crate::crd::release::{CanaryStrategy, MetricCheck};
use std::time::Duration;

/// Canary strategy handler
///
/// Stable and canary Deployments are scaled in proportion to the current
/// weight, with the canary rounded up.
pub struct CanaryStrategyHandler {
    steps: Vec<u8>,
    interval: Duration,
    failure_threshold: u32,
    inconclusive_limit: u32,
    metrics: Vec<MetricCheck>,
}

impl CanaryStrategyHandler {
    pub fn new(config: &CanaryStrategy) -> Result<Self, ValidationError> {
        let interval = parse_duration(&config.analysis_interval).ok_or_else(|| {
            ValidationError(format!(
                "spec.strategy.canary.analysisInterval invalid: '{}'",
                config.analysis_interval
            ))
        })?;
        if config.traffic_steps.is_empty() {
            return Err(ValidationError(
                "spec.strategy.canary.trafficSteps must have at least one step".to_string(),
            ));
        }
        Ok(Self {
            steps: config.traffic_steps.clone(),
            interval,
            failure_threshold: config.failure_threshold.max(1),
            inconclusive_limit: config
                .inconclusive_limit
                .unwrap_or(DEFAULT_INCONCLUSIVE_LIMIT),
            metrics: config.metrics.clone(),
        })
    }
}

impl ReleaseStrategy for CanaryStrategyHandler {
    fn name(&self) -> &'static str {
        "canary"
    }

    fn steps(&self) -> &[u8] {
        &self.steps
    }

    fn analysis_interval(&self) -> Duration {
        self.interval
    }

    fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    fn inconclusive_limit(&self) -> u32 {
        self.inconclusive_limit
    }

    fn metrics(&self) -> &[MetricCheck] {
        &self.metrics
    }

    fn replica_split(&self, total_replicas: i32, weight: u8) -> (i32, i32) {
        calculate_replica_split(total_replicas, weight)
    }
}

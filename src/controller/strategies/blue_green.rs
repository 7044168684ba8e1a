//! Blue-Green delivery strategy
//!
//! The new revision runs as a full-size preview with no live traffic. After the
//! preview passes analysis, promotion switches 100% of traffic in one step.

use super::ReleaseStrategy;
use crate::controller::analysis::DEFAULT_INCONCLUSIVE_LIMIT;
use crate::controller::release::validation::{parse_duration, ValidationError};
use crate::crd::release::{BlueGreenStrategy, MetricCheck};
use std::time::Duration;

/// Single step: the preview receives no traffic until promotion
const PREVIEW_STEPS: [u8; 1] = [0];

pub struct BlueGreenStrategyHandler {
    interval: Duration,
    failure_threshold: u32,
    inconclusive_limit: u32,
    metrics: Vec<MetricCheck>,
}

impl BlueGreenStrategyHandler {
    pub fn new(config: &BlueGreenStrategy) -> Result<Self, ValidationError> {
        let interval = parse_duration(&config.analysis_interval).ok_or_else(|| {
            ValidationError(format!(
                "spec.strategy.blueGreen.analysisInterval invalid: '{}'",
                config.analysis_interval
            ))
        })?;
        Ok(Self {
            interval,
            failure_threshold: config.failure_threshold.max(1),
            inconclusive_limit: config
                .inconclusive_limit
                .unwrap_or(DEFAULT_INCONCLUSIVE_LIMIT),
            metrics: config.metrics.clone(),
        })
    }
}

impl ReleaseStrategy for BlueGreenStrategyHandler {
    fn name(&self) -> &'static str {
        "blue-green"
    }

    fn steps(&self) -> &[u8] {
        &PREVIEW_STEPS
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

    /// Both environments run at full size; weight only moves the route
    fn replica_split(&self, total_replicas: i32, _weight: u8) -> (i32, i32) {
        (total_replicas, total_replicas)
    }
}

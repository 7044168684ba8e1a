use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Maximum number of analysis runs retained in status
///
/// Older runs are dropped from the front so the object stays well under the
/// API server's size limit while keeping a recent audit trail.
pub const MAX_ANALYSIS_RUNS: usize = 50;

/// Release is a Custom Resource describing one progressive delivery of an app
///
/// The spec is supplied once by `start` and never edited by the orchestrator.
/// The status is owned by the reconciler and by the manual-command path,
/// both of which write it through an optimistic-concurrency patch.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "delivery.ph.io",
    version = "v1alpha1",
    kind = "Release",
    namespaced,
    status = "ReleaseStatus",
    shortname = "rel",
    printcolumn = r#"{"name":"App", "type":"string", "jsonPath":".spec.appName"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Step", "type":"integer", "jsonPath":".status.currentStepIndex"}"#,
    printcolumn = r#"{"name":"Weight", "type":"integer", "jsonPath":".status.trafficSplitPercent"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ReleaseSpec {
    /// Application name; workloads are `<appName>-stable` and `<appName>-canary`
    #[serde(rename = "appName")]
    pub app_name: String,

    /// Artifact reference being promoted (e.g. "ghcr.io/acme/app:1.4.0")
    pub image: String,

    /// Artifact currently serving production traffic
    #[serde(rename = "stableImage", skip_serializing_if = "Option::is_none")]
    pub stable_image: Option<String>,

    /// Total replicas split between stable and canary
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Delivery strategy (exactly one of canary / blueGreen)
    pub strategy: ReleaseStrategy,

    /// Traffic routing configuration
    #[serde(rename = "trafficRouting", skip_serializing_if = "Option::is_none")]
    pub traffic_routing: Option<TrafficRouting>,

    /// Promote automatically once the last step passes analysis (default: true)
    #[serde(rename = "autoPromote", skip_serializing_if = "Option::is_none")]
    pub auto_promote: Option<bool>,

    /// PEM-encoded ECDSA P-256 public key used to verify `signature`
    #[serde(rename = "publicKey", skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    /// Base64 signature over the `image` reference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

fn default_replicas() -> i32 {
    1
}

impl ReleaseSpec {
    /// Whether the release promotes on its own after the last analysis passes
    pub fn auto_promote(&self) -> bool {
        self.auto_promote.unwrap_or(true)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct ReleaseStrategy {
    /// Canary strategy: stepwise traffic shifting with analysis at each step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanaryStrategy>,

    /// Blue-Green strategy: analyze the preview, then cut over atomically
    #[serde(rename = "blueGreen", skip_serializing_if = "Option::is_none")]
    pub blue_green: Option<BlueGreenStrategy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct CanaryStrategy {
    /// Canary traffic percentages, non-decreasing and ending at 100
    #[serde(rename = "trafficSteps")]
    pub traffic_steps: Vec<u8>,

    /// Time to hold each traffic split before analysis (e.g. "30s", "5m")
    #[serde(rename = "analysisInterval")]
    pub analysis_interval: String,

    /// Consecutive failed analyses before rolling back
    #[serde(rename = "failureThreshold")]
    pub failure_threshold: u32,

    /// Consecutive inconclusive analyses tolerated before escalating to failure
    #[serde(rename = "inconclusiveLimit", skip_serializing_if = "Option::is_none")]
    pub inconclusive_limit: Option<u32>,

    /// Health signals evaluated at every step
    #[serde(default)]
    pub metrics: Vec<MetricCheck>,
}

/// Blue-Green strategy
///
/// The new revision runs as a preview with no live traffic. Once analysis
/// passes, traffic switches from 0% to 100% in one step.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct BlueGreenStrategy {
    /// Time to hold the preview before analysis (e.g. "1m")
    #[serde(rename = "analysisInterval")]
    pub analysis_interval: String,

    /// Consecutive failed analyses before rolling back
    #[serde(rename = "failureThreshold")]
    pub failure_threshold: u32,

    /// Consecutive inconclusive analyses tolerated before escalating to failure
    #[serde(rename = "inconclusiveLimit", skip_serializing_if = "Option::is_none")]
    pub inconclusive_limit: Option<u32>,

    /// Health signals evaluated against the preview
    #[serde(default)]
    pub metrics: Vec<MetricCheck>,
}

/// One health signal
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct MetricCheck {
    pub name: String,

    /// Opaque query handed to the metric evaluator
    pub query: String,

    /// Predicate over `result`, e.g. "result < 0.05"
    #[serde(rename = "successCondition")]
    pub success_condition: String,

    /// Predicate over `result` that marks the check as failed
    #[serde(rename = "failureCondition", skip_serializing_if = "Option::is_none")]
    pub failure_condition: Option<String>,

    /// Pause the release when a passing metric trends worse over its history
    #[serde(
        rename = "predictiveAnalysis",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub predictive_analysis: Option<PredictiveAnalysis>,
}

/// Slope applied when `trendThreshold` is not set
pub const DEFAULT_TREND_THRESHOLD: f64 = 0.1;

/// Least-squares trend detection over a metric's recorded values
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct PredictiveAnalysis {
    pub enabled: bool,

    /// Largest tolerated increase of the metric per second
    #[serde(rename = "trendThreshold", skip_serializing_if = "Option::is_none")]
    pub trend_threshold: Option<f64>,
}

impl PredictiveAnalysis {
    pub fn threshold(&self) -> f64 {
        self.trend_threshold.unwrap_or(DEFAULT_TREND_THRESHOLD)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct TrafficRouting {
    /// Name of the Gateway API HTTPRoute to manipulate
    #[serde(rename = "httpRoute")]
    pub http_route: String,

    /// Service selecting the stable pods
    #[serde(rename = "stableService")]
    pub stable_service: String,

    /// Service selecting the canary pods
    #[serde(rename = "canaryService")]
    pub canary_service: String,

    /// Service port (default: 80)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

/// Phase of a Release
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema,
)]
pub enum Phase {
    /// Created, not yet picked up by the reconciler
    #[default]
    Pending,
    /// Traffic split applied, waiting for the analysis interval
    Progressing,
    /// Evaluating metrics for the current step
    Analyzing,
    /// All steps passed; waiting for a manual promote
    Paused,
    /// Shifting all traffic to the new revision
    Promoting,
    /// New revision serves 100% of traffic
    Succeeded,
    /// Reverting traffic to the stable revision
    Failing,
    /// Traffic reverted; terminal
    RolledBack,
    /// Release could not start (invalid spec or signature)
    Failed,
    /// Stopped by an operator without touching traffic
    Aborted,
}

impl Phase {
    /// Terminal phases are never left again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Succeeded | Phase::Failed | Phase::RolledBack | Phase::Aborted
        )
    }
}

/// Outcome of a single check or a whole analysis run
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum Verdict {
    Pass,
    Fail,
    Inconclusive,
}

/// Result of one metric check within an analysis run
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct MetricResult {
    pub name: String,
    pub query: String,

    /// Value returned by the evaluator, absent when the query failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,

    pub verdict: Verdict,

    /// Why the check was inconclusive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Slope of the metric over its history, when predictive analysis ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slope: Option<f64>,

    /// Passing, but rising faster than the configured trend threshold
    #[serde(rename = "trendingWorse", default)]
    pub trending_worse: bool,
}

/// Immutable record of one evaluation cycle
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct AnalysisRun {
    pub id: String,

    /// RFC3339 timestamp of the evaluation
    pub timestamp: String,

    #[serde(rename = "stepIndex")]
    pub step_index: u32,

    #[serde(rename = "metricResults", default)]
    pub metric_results: Vec<MetricResult>,

    #[serde(rename = "overallVerdict")]
    pub overall_verdict: Verdict,

    /// True when repeated inconclusive runs were escalated to Fail
    #[serde(default)]
    pub escalated: bool,

    /// No check failed but at least one is trending worse
    #[serde(rename = "trendingWorse", default)]
    pub trending_worse: bool,
}

/// Status of the Release
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ReleaseStatus {
    #[serde(default)]
    pub phase: Phase,

    #[serde(rename = "currentStepIndex", default)]
    pub current_step_index: u32,

    /// Revision being promoted
    #[serde(rename = "currentRevision", skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,

    /// Revision serving traffic before this release
    #[serde(rename = "previousRevision", skip_serializing_if = "Option::is_none")]
    pub previous_revision: Option<String>,

    /// Percentage of traffic routed to the new revision
    #[serde(rename = "trafficSplitPercent", default)]
    pub traffic_split_percent: u8,

    /// Append-only analysis history (bounded by MAX_ANALYSIS_RUNS)
    #[serde(rename = "analysisRuns", default, skip_serializing_if = "Vec::is_empty")]
    pub analysis_runs: Vec<AnalysisRun>,

    #[serde(rename = "consecutiveFailures", default)]
    pub consecutive_failures: u32,

    #[serde(rename = "consecutiveInconclusive", default)]
    pub consecutive_inconclusive: u32,

    /// RFC3339 timestamp of the last phase or traffic change
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// RFC3339 timestamp of the last analysis run
    #[serde(rename = "lastAnalysisTime", skip_serializing_if = "Option::is_none")]
    pub last_analysis_time: Option<String>,

    /// Revision to restore on rollback, when an operator asked for one
    #[serde(rename = "rollbackTarget", skip_serializing_if = "Option::is_none")]
    pub rollback_target: Option<String>,

    /// Human-readable summary of the last event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ReleaseStatus {
    /// Whether the release passed admission and began routing traffic
    pub fn started(&self) -> bool {
        self.current_revision.is_some()
    }

    /// Append an analysis run, dropping the oldest beyond the cap
    pub fn push_analysis_run(&mut self, run: AnalysisRun) {
        self.analysis_runs.push(run);
        if self.analysis_runs.len() > MAX_ANALYSIS_RUNS {
            let overflow = self.analysis_runs.len() - MAX_ANALYSIS_RUNS;
            self.analysis_runs.drain(..overflow);
        }
    }
}

#[cfg(test)]
#[path = "release_test.rs"]
mod tests;

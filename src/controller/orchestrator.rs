//! Command facade over Release resources
//!
//! Translates operator commands into Release creation or manual status
//! overrides. Ongoing progression is left to the reconciler; the facade only
//! nudges it through a reconcile trigger when one is attached.

use crate::controller::clock::{Clock, FixedClock, SharedClock};
use crate::controller::release::status::parse_timestamp;
use crate::controller::release::store::resource_version;
use crate::controller::release::validation::{validate_spec, ValidationError};
use crate::controller::release::{ReleaseClient, ReleaseKey, ReleaseStore, StoreError};
use crate::controller::driver::ReconcileTrigger;
use crate::controller::signature::{ArtifactVerifier, SignatureError};
use crate::controller::strategies::{
    next_status, select_strategy, ManualCommand, StepInput, TrafficAction, TransitionError,
};
use crate::crd::release::{AnalysisRun, Phase, Release, ReleaseSpec, ReleaseStatus, Verdict};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::error::Error as _;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub const EXIT_OK: i32 = 0;
pub const EXIT_INVALID: i32 = 2;
pub const EXIT_NOT_FOUND: i32 = 3;
pub const EXIT_REFUSED: i32 = 4;
/// EX_TEMPFAIL: the command may succeed if retried
pub const EXIT_RETRYABLE: i32 = 75;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("invalid release spec")]
    InvalidSpec(#[source] ValidationError),

    #[error("signature verification failed")]
    SignatureVerificationFailed(#[source] SignatureError),

    #[error("release {0} already exists")]
    AlreadyExists(String),

    #[error("release {0} not found")]
    NotFound(String),

    #[error("release {key} is already {phase:?}")]
    InvalidTerminalState { key: String, phase: Phase },

    #[error("release {key} kept changing: gave up after {attempts} attempts")]
    Contention { key: String, attempts: u32 },

    #[error("transient failure: {0}")]
    Transient(String),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => OrchestratorError::NotFound(key),
            StoreError::AlreadyExists(key) => OrchestratorError::AlreadyExists(key),
            other => OrchestratorError::Transient(other.to_string()),
        }
    }
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::InvalidSpec(_) => "InvalidSpec",
            OrchestratorError::SignatureVerificationFailed(_) => "SignatureVerificationFailed",
            OrchestratorError::AlreadyExists(_) => "AlreadyExists",
            OrchestratorError::NotFound(_) => "NotFound",
            OrchestratorError::InvalidTerminalState { .. } => "InvalidTerminalState",
            OrchestratorError::Contention { .. } => "Contention",
            OrchestratorError::Transient(_) => "Transient",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::InvalidSpec(_) | OrchestratorError::SignatureVerificationFailed(_) => {
                EXIT_INVALID
            }
            OrchestratorError::NotFound(_) => EXIT_NOT_FOUND,
            OrchestratorError::AlreadyExists(_) | OrchestratorError::InvalidTerminalState { .. } => {
                EXIT_REFUSED
            }
            OrchestratorError::Contention { .. } | OrchestratorError::Transient(_) => EXIT_RETRYABLE,
        }
    }

    /// Whether retrying the same command may succeed
    pub fn is_retryable(&self) -> bool {
        self.exit_code() == EXIT_RETRYABLE
    }
}

/// Structured error handed to the CLI boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
    pub retryable: bool,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
}

impl From<&OrchestratorError> for CommandError {
    fn from(err: &OrchestratorError) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            causes,
            retryable: err.is_retryable(),
            exit_code: err.exit_code(),
        }
    }
}

/// Process exit code for a command result
pub fn exit_code<T>(result: &Result<T, OrchestratorError>) -> i32 {
    match result {
        Ok(_) => EXIT_OK,
        Err(e) => e.exit_code(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub namespace: String,
    pub name: String,
    pub spec: ReleaseSpec,
}

/// One state transition of a simulated rollout
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedTransition {
    /// Seconds since the simulated start
    pub at_seconds: i64,
    pub phase: Phase,
    pub step_index: u32,
    pub traffic_percent: u8,
    pub action: TrafficAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Dry-run rendering of how a spec would roll out if every analysis passed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub strategy: String,
    pub analysis_interval_seconds: u64,
    pub transitions: Vec<PlannedTransition>,
    pub final_phase: Phase,
    pub total_seconds: i64,
}

/// Release command facade
pub struct ReleaseOrchestrator {
    store: ReleaseStore,
    verifier: Arc<dyn ArtifactVerifier>,
    clock: SharedClock,
    conflict_retries: u32,
    trigger: Option<ReconcileTrigger>,
}

impl ReleaseOrchestrator {
    pub fn new(
        client: Arc<dyn ReleaseClient>,
        verifier: Arc<dyn ArtifactVerifier>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store: ReleaseStore::new(client),
            verifier,
            clock,
            conflict_retries: crate::controller::release::reconcile::DEFAULT_CONFLICT_RETRIES,
            trigger: None,
        }
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    /// Trigger a reconcile after `start` and each applied manual command
    pub fn with_trigger(mut self, trigger: ReconcileTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Validate, verify and create a release in Pending
    pub async fn start(&self, request: StartRequest) -> Result<ReleaseKey, OrchestratorError> {
        validate_spec(&request.spec).map_err(OrchestratorError::InvalidSpec)?;
        self.verifier
            .verify(
                &request.spec.image,
                request.spec.public_key.as_deref(),
                request.spec.signature.as_deref(),
            )
            .await
            .map_err(OrchestratorError::SignatureVerificationFailed)?;

        let mut release = Release::new(&request.name, request.spec);
        release.metadata.namespace = Some(request.namespace.clone());
        let key = ReleaseKey::new(request.namespace, request.name);

        self.store.client().create(&release).await?;
        info!(release = %key, image = %release.spec.image, "Release created");

        if let Some(trigger) = &self.trigger {
            trigger.trigger(&key);
        }
        Ok(key)
    }

    pub async fn promote(&self, key: &ReleaseKey) -> Result<Release, OrchestratorError> {
        self.manual(key, ManualCommand::Promote).await
    }

    /// Roll back to `to_revision`, or to the stable revision when None
    pub async fn rollback(
        &self,
        key: &ReleaseKey,
        to_revision: Option<String>,
    ) -> Result<Release, OrchestratorError> {
        self.manual(key, ManualCommand::Rollback { to_revision }).await
    }

    /// Stop progressing without touching traffic
    pub async fn abort(&self, key: &ReleaseKey) -> Result<Release, OrchestratorError> {
        self.manual(key, ManualCommand::Abort).await
    }

    pub async fn status(&self, key: &ReleaseKey) -> Result<Release, OrchestratorError> {
        Ok(self.store.load(key).await?)
    }

    /// Snapshots of a release until the watch connection ends
    pub fn watch(&self, key: &ReleaseKey) -> BoxStream<'static, Result<Release, OrchestratorError>> {
        self.store
            .client()
            .watch(key)
            .map(|item| item.map_err(OrchestratorError::from))
            .boxed()
    }

    async fn manual(
        &self,
        key: &ReleaseKey,
        command: ManualCommand,
    ) -> Result<Release, OrchestratorError> {
        let attempts = self.conflict_retries + 1;
        for attempt in 1..=attempts {
            let release = self.store.load(key).await?;
            let status = release.status.clone().unwrap_or_default();
            let version = resource_version(&release)?;

            let transition = match next_status(
                &release.spec,
                &status,
                StepInput::Manual(command.clone()),
                self.clock.now(),
            ) {
                Ok(Some(transition)) => transition,
                Ok(None) => return Ok(release),
                Err(TransitionError::InvalidTerminalState(phase)) => {
                    return Err(OrchestratorError::InvalidTerminalState {
                        key: key.to_string(),
                        phase,
                    })
                }
                Err(TransitionError::InvalidSpec(e)) => return Err(OrchestratorError::InvalidSpec(e)),
                Err(e) => return Err(OrchestratorError::Transient(e.to_string())),
            };

            match self.store.commit_status(key, &version, &transition.status).await {
                Ok(updated) => {
                    info!(
                        release = %key,
                        command = ?command,
                        from = ?status.phase,
                        to = ?transition.status.phase,
                        "Manual command applied"
                    );
                    if let Some(trigger) = &self.trigger {
                        trigger.trigger(key);
                    }
                    return Ok(updated);
                }
                Err(StoreError::Conflict(_)) => {
                    warn!(release = %key, attempt, "Manual command lost a status race, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(OrchestratorError::Contention {
            key: key.to_string(),
            attempts,
        })
    }
}

/// Simulate the rollout of `spec` assuming every analysis passes
///
/// Pure: touches no cluster state and runs on a clock frozen at the Unix
/// epoch, so identical specs produce identical plans.
pub fn plan(spec: &ReleaseSpec) -> Result<ExecutionPlan, OrchestratorError> {
    validate_spec(spec).map_err(OrchestratorError::InvalidSpec)?;
    let strategy = select_strategy(spec).map_err(OrchestratorError::InvalidSpec)?;
    let interval = chrono::Duration::from_std(strategy.analysis_interval())
        .map_err(|e| OrchestratorError::InvalidSpec(ValidationError(e.to_string())))?;

    let start = FixedClock(DateTime::<Utc>::UNIX_EPOCH).now();
    let mut now = start;
    let mut status = ReleaseStatus::default();
    let mut transitions = Vec::new();

    // Every step contributes at most Progressing, Analyzing and one verdict
    let max_transitions = strategy.steps().len() * 3 + 4;
    for _ in 0..max_transitions {
        if status.phase.is_terminal() || status.phase == Phase::Paused {
            break;
        }

        let input = if status.phase == Phase::Analyzing {
            StepInput::Verdict(synthetic_run(&status, now))
        } else {
            StepInput::Tick
        };

        let transition = match next_status(spec, &status, input, now) {
            Ok(Some(t)) => t,
            Ok(None) => {
                // Only the Progressing hold returns nothing here
                now = hold_until(&status, interval, now);
                continue;
            }
            Err(TransitionError::InvalidSpec(e)) => return Err(OrchestratorError::InvalidSpec(e)),
            Err(e) => return Err(OrchestratorError::Transient(e.to_string())),
        };

        transitions.push(PlannedTransition {
            at_seconds: (now - start).num_seconds(),
            phase: transition.status.phase,
            step_index: transition.status.current_step_index,
            traffic_percent: transition.status.traffic_split_percent,
            action: transition.action,
            message: transition.status.message.clone(),
        });
        status = transition.status;
    }

    Ok(ExecutionPlan {
        strategy: strategy.name().to_string(),
        analysis_interval_seconds: strategy.analysis_interval().as_secs(),
        transitions,
        final_phase: status.phase,
        total_seconds: (now - start).num_seconds(),
    })
}

fn hold_until(
    status: &ReleaseStatus,
    interval: chrono::Duration,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let entered = status
        .last_transition_time
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(now);
    (entered + interval).max(now + chrono::Duration::seconds(1))
}

fn synthetic_run(status: &ReleaseStatus, now: DateTime<Utc>) -> AnalysisRun {
    AnalysisRun {
        id: format!("plan-step-{}", status.current_step_index),
        timestamp: now.to_rfc3339(),
        step_index: status.current_step_index,
        metric_results: vec![],
        overall_verdict: Verdict::Pass,
        escalated: false,
        trending_worse: false,
    }
}

#[cfg(test)]
#[path = "orchestrator_test.rs"]
mod tests;

use crate::controller::analysis::AnalysisEngine;
use crate::controller::clock::Clock;
use crate::controller::signature::ArtifactVerifier;
use crate::controller::strategies::{
    next_status, select_strategy, settled_action, StepInput, TrafficAction, Transition,
    TransitionError,
};
use crate::crd::release::{Phase, Release, ReleaseStatus};
use crate::server::SharedMetrics;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::status::{analysis_due, next_wakeup};
use super::store::{resource_version, ReleaseStore, StoreError};
use super::traffic::TrafficRouter;
use super::validation::validate_spec;
use super::ReleaseKey;

/// Conflicting status writes tolerated per tick before giving up
pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReconcileError {
    #[error("release {0} not found")]
    NotFound(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("release {key} kept changing: gave up after {attempts} attempts")]
    Contention { key: String, attempts: u32 },
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => ReconcileError::NotFound(key),
            other => ReconcileError::Transient(other.to_string()),
        }
    }
}

impl ReconcileError {
    /// Label used for the reconcile metrics
    pub fn metric_label(&self) -> &'static str {
        match self {
            ReconcileError::NotFound(_) => "not_found",
            ReconcileError::Transient(_) => "transient",
            ReconcileError::Contention { .. } => "contention",
        }
    }
}

/// Outcome of one reconcile tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickResult {
    /// Status moved; tick again after `requeue_after` (None: wait for a trigger)
    Advanced { requeue_after: Option<Duration> },
    /// Nothing was due
    NoChange { requeue_after: Option<Duration> },
    /// The release is in a terminal phase
    TerminalReached,
}

impl TickResult {
    pub fn metric_label(&self) -> &'static str {
        match self {
            TickResult::Advanced { .. } => "advanced",
            TickResult::NoChange { .. } => "no_change",
            TickResult::TerminalReached => "terminal",
        }
    }
}

/// Collaborators of the reconciler
pub struct Context {
    pub store: ReleaseStore,
    pub router: Arc<dyn TrafficRouter>,
    pub analysis: AnalysisEngine,
    pub verifier: Arc<dyn ArtifactVerifier>,
    pub clock: Arc<dyn Clock>,
    /// Optional controller metrics for Prometheus
    pub metrics: Option<SharedMetrics>,
    pub conflict_retries: u32,
}

enum Attempt {
    /// `moved_traffic`: this attempt applied a traffic action and committed it
    Done {
        result: TickResult,
        moved_traffic: bool,
    },
    /// The status write lost; `moved_traffic` says whether traffic already moved
    Conflict { moved_traffic: bool },
}

/// Advance one release by at most one state transition
///
/// Loads the release, decides what is due, applies the resulting traffic
/// action and commits the new status against the version it was computed
/// from. A lost write reloads and re-decides, up to `conflict_retries` times.
/// Traffic moved for a lost write is put back to what the winning status
/// records. Never sleeps: waiting is expressed through `requeue_after`.
pub async fn reconcile_once(key: &ReleaseKey, ctx: &Context) -> Result<TickResult, ReconcileError> {
    let started = Instant::now();
    let result = reconcile_with_retries(key, ctx).await;

    if let Some(metrics) = &ctx.metrics {
        let label = match &result {
            Ok(tick) => tick.metric_label(),
            Err(e) => e.metric_label(),
        };
        metrics.record_reconcile(label, started.elapsed().as_secs_f64());
    }

    result
}

async fn reconcile_with_retries(
    key: &ReleaseKey,
    ctx: &Context,
) -> Result<TickResult, ReconcileError> {
    let attempts = ctx.conflict_retries + 1;
    let mut traffic_ahead = false;
    let mut last_seen = None;

    for attempt in 1..=attempts {
        let release = ctx.store.load(key).await?;
        match tick(key, &release, ctx).await? {
            Attempt::Done {
                result,
                moved_traffic,
            } => {
                if traffic_ahead && !moved_traffic {
                    restore_traffic(key, &release, ctx).await?;
                }
                return Ok(result);
            }
            Attempt::Conflict { moved_traffic } => {
                traffic_ahead |= moved_traffic;
                warn!(release = %key, attempt, "Status conflict, reloading");
            }
        }
        last_seen = Some(release);
    }

    error!(release = %key, attempts, "Giving up after repeated status conflicts");
    if traffic_ahead {
        // Best effort against the last version seen; the next tick re-decides anyway
        if let Some(release) = &last_seen {
            if let Err(e) = restore_traffic(key, release, ctx).await {
                warn!(release = %key, error = %e, "Could not restore recorded traffic split");
            }
        }
    }
    Err(ReconcileError::Contention {
        key: key.to_string(),
        attempts,
    })
}

/// Route traffic back to the split recorded in the stored status
async fn restore_traffic(
    key: &ReleaseKey,
    release: &Release,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    let status = release.status.clone().unwrap_or_default();
    let action = settled_action(&release.spec, &status);
    warn!(
        release = %key,
        phase = ?status.phase,
        action = ?action,
        "Traffic moved for a lost status write, restoring recorded split"
    );
    ctx.router
        .apply(release, &action)
        .await
        .map_err(|e| ReconcileError::Transient(e.to_string()))
}

/// Spec validation and signature verification for a release not yet started
///
/// Runs for every phase until `currentRevision` is set, so a release pushed
/// forward by a manual command is still checked before traffic moves.
async fn admit(release: &Release, ctx: &Context) -> Result<(), String> {
    validate_spec(&release.spec).map_err(|e| format!("Invalid spec: {}", e))?;
    ctx.verifier
        .verify(
            &release.spec.image,
            release.spec.public_key.as_deref(),
            release.spec.signature.as_deref(),
        )
        .await
        .map_err(|e| format!("Signature verification failed: {}", e))
}

async fn tick(key: &ReleaseKey, release: &Release, ctx: &Context) -> Result<Attempt, ReconcileError> {
    let now = ctx.clock.now();
    let status = release.status.clone().unwrap_or_default();

    if status.phase.is_terminal() {
        debug!(release = %key, phase = ?status.phase, "Release is terminal");
        return Ok(Attempt::Done {
            result: TickResult::TerminalReached,
            moved_traffic: false,
        });
    }

    let version = resource_version(release)?;
    let strategy = select_strategy(&release.spec);
    let interval = strategy.as_ref().ok().map(|s| s.analysis_interval());

    // Every path to traffic goes through admission until the release has started
    let rejection = if status.started() {
        None
    } else {
        admit(release, ctx).await.err()
    };

    let input = match (rejection, &strategy) {
        (Some(reason), _) => {
            warn!(release = %key, phase = ?status.phase, reason = %reason, "Rejecting release");
            StepInput::Reject(reason)
        }
        (None, Err(e))
            if matches!(
                status.phase,
                Phase::Progressing | Phase::Analyzing | Phase::Paused
            ) =>
        {
            error!(release = %key, phase = ?status.phase, error = %e, "Release spec became invalid");
            StepInput::Reject(format!("Invalid spec: {}", e))
        }
        (None, Ok(strategy)) if status.phase == Phase::Analyzing => {
            if analysis_due(&status, strategy.analysis_interval(), now) {
                let run = ctx
                    .analysis
                    .evaluate(
                        strategy.metrics(),
                        &status.analysis_runs,
                        status.current_step_index,
                        status.consecutive_inconclusive,
                        strategy.inconclusive_limit(),
                        now,
                    )
                    .await;
                info!(
                    release = %key,
                    step = status.current_step_index,
                    verdict = ?run.overall_verdict,
                    escalated = run.escalated,
                    trending_worse = run.trending_worse,
                    "Analysis complete"
                );
                StepInput::Verdict(run)
            } else {
                StepInput::Tick
            }
        }
        _ => StepInput::Tick,
    };

    let transition = match next_status(&release.spec, &status, input, now) {
        Err(TransitionError::InvalidSpec(e)) => {
            // Spec no longer valid mid-rollout: unwind traffic instead of stalling
            error!(release = %key, error = %e, "Release spec became invalid");
            next_status(
                &release.spec,
                &status,
                StepInput::Reject(format!("Invalid spec: {}", e)),
                now,
            )
        }
        other => other,
    }
    .map_err(|e| ReconcileError::Transient(e.to_string()))?;

    let Some(Transition { status: next, action }) = transition else {
        debug!(release = %key, phase = ?status.phase, "Nothing due");
        return Ok(Attempt::Done {
            result: TickResult::NoChange {
                requeue_after: next_wakeup(&status, interval, now),
            },
            moved_traffic: false,
        });
    };

    let moved_traffic = action != TrafficAction::None;
    if moved_traffic {
        if let Err(e) = ctx.router.apply(release, &action).await {
            warn!(release = %key, action = ?action, error = %e, "Traffic update failed");
            record_router_failure(key, &version, &status, &e.to_string(), ctx).await;
            return Err(ReconcileError::Transient(e.to_string()));
        }
    }

    match ctx.store.commit_status(key, &version, &next).await {
        Ok(_) => {}
        Err(StoreError::Conflict(_)) => return Ok(Attempt::Conflict { moved_traffic }),
        Err(e) => return Err(e.into()),
    }

    info!(
        release = %key,
        from = ?status.phase,
        to = ?next.phase,
        step = next.current_step_index,
        weight = next.traffic_split_percent,
        "Release advanced"
    );

    if let Some(metrics) = &ctx.metrics {
        metrics.set_traffic_weight(&key.namespace, &key.name, next.traffic_split_percent);
        if next.phase.is_terminal() {
            let strategy_name = strategy.as_ref().map(|s| s.name()).unwrap_or("unknown");
            metrics.record_release_finished(strategy_name, &format!("{:?}", next.phase));
        }
    }

    let result = if next.phase.is_terminal() {
        TickResult::TerminalReached
    } else {
        TickResult::Advanced {
            requeue_after: next_wakeup(&next, interval, now),
        }
    };
    Ok(Attempt::Done {
        result,
        moved_traffic,
    })
}

/// Best-effort note of a failed traffic update; the phase is left unchanged
async fn record_router_failure(
    key: &ReleaseKey,
    version: &str,
    status: &ReleaseStatus,
    reason: &str,
    ctx: &Context,
) {
    let mut noted = status.clone();
    noted.message = Some(format!("Traffic update failed: {}", reason));
    if noted == *status {
        return;
    }
    if let Err(e) = ctx.store.commit_status(key, version, &noted).await {
        debug!(release = %key, error = %e, "Could not record traffic failure");
    }
}

#[cfg(test)]
#[path = "reconcile_test.rs"]
mod tests;

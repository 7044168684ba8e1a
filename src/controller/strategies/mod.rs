//! Strategy executor
//!
//! `next_status` is the release state machine: a pure function from the spec,
//! the current status, one input and the current time to the next status plus
//! the traffic action that must be applied before that status is committed.
//! Strategies supply the parameters that differ between canary and blue/green:
//! - CanaryStrategyHandler: stepwise traffic shifting through `trafficSteps`
//! - BlueGreenStrategyHandler: zero-traffic preview, then an atomic cutover

pub mod blue_green;
pub mod canary;

use crate::controller::release::status::elapsed_since;
use crate::controller::release::traffic::calculate_replica_split;
use crate::controller::release::validation::ValidationError;
use crate::crd::release::{AnalysisRun, MetricCheck, Phase, ReleaseSpec, ReleaseStatus, Verdict};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub use blue_green::BlueGreenStrategyHandler;
pub use canary::CanaryStrategyHandler;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransitionError {
    #[error("invalid release spec: {0}")]
    InvalidSpec(#[from] ValidationError),

    #[error("release is already in terminal phase {0:?}")]
    InvalidTerminalState(Phase),

    #[error("{input} is not accepted in phase {phase:?}")]
    UnexpectedInput { phase: Phase, input: &'static str },
}

/// Side effect to apply before the new status is committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TrafficAction {
    None,
    /// Route `weight`% to the new revision with the given replica counts
    Shift {
        weight: u8,
        stable_replicas: i32,
        canary_replicas: i32,
    },
    /// All traffic to the new revision; the old revision is retired
    Promote,
    /// All traffic back to stable, optionally pinned to a specific revision
    Revert { to_revision: Option<String> },
}

/// Operator command routed through the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualCommand {
    Promote,
    Rollback { to_revision: Option<String> },
    Abort,
}

#[derive(Debug, Clone)]
pub enum StepInput {
    /// Time passed; advance whatever is due
    Tick,
    /// An analysis run finished for the current step
    Verdict(AnalysisRun),
    Manual(ManualCommand),
    /// Spec or signature rejected by the reconciler
    Reject(String),
}

impl StepInput {
    fn label(&self) -> &'static str {
        match self {
            StepInput::Tick => "tick",
            StepInput::Verdict(_) => "analysis verdict",
            StepInput::Manual(_) => "manual command",
            StepInput::Reject(_) => "rejection",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub status: ReleaseStatus,
    pub action: TrafficAction,
}

/// Parameters that distinguish one delivery strategy from another
pub trait ReleaseStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Canary traffic weight for each step
    fn steps(&self) -> &[u8];

    fn analysis_interval(&self) -> Duration;

    fn failure_threshold(&self) -> u32;

    fn inconclusive_limit(&self) -> u32;

    fn metrics(&self) -> &[MetricCheck];

    /// Replica counts `(stable, canary)` while `weight`% goes to the canary
    fn replica_split(&self, total_replicas: i32, weight: u8) -> (i32, i32);
}

/// Select the strategy configured on a release
pub fn select_strategy(spec: &ReleaseSpec) -> Result<Box<dyn ReleaseStrategy>, ValidationError> {
    match (&spec.strategy.canary, &spec.strategy.blue_green) {
        (Some(canary), None) => Ok(Box::new(CanaryStrategyHandler::new(canary)?)),
        (None, Some(bg)) => Ok(Box::new(BlueGreenStrategyHandler::new(bg)?)),
        _ => Err(ValidationError(
            "spec.strategy must set exactly one of canary or blueGreen".to_string(),
        )),
    }
}

fn moved(status: &ReleaseStatus, phase: Phase, now: DateTime<Utc>, message: String) -> ReleaseStatus {
    ReleaseStatus {
        phase,
        last_transition_time: Some(now.to_rfc3339()),
        message: Some(message),
        ..status.clone()
    }
}

fn shift(
    strategy: &dyn ReleaseStrategy,
    spec: &ReleaseSpec,
    step_index: usize,
) -> Result<(u8, TrafficAction), TransitionError> {
    let weight = *strategy.steps().get(step_index).ok_or_else(|| {
        ValidationError(format!("step {} out of range", step_index))
    })?;
    let (stable_replicas, canary_replicas) = strategy.replica_split(spec.replicas, weight);
    Ok((
        weight,
        TrafficAction::Shift {
            weight,
            stable_replicas,
            canary_replicas,
        },
    ))
}

/// Traffic action that reproduces the split recorded in `status`
pub fn settled_action(spec: &ReleaseSpec, status: &ReleaseStatus) -> TrafficAction {
    match status.phase {
        Phase::Succeeded => TrafficAction::Promote,
        Phase::RolledBack => TrafficAction::Revert {
            to_revision: status.rollback_target.clone(),
        },
        _ => {
            let weight = status.traffic_split_percent;
            let (stable_replicas, canary_replicas) = match select_strategy(spec) {
                Ok(strategy) => strategy.replica_split(spec.replicas, weight),
                Err(_) => calculate_replica_split(spec.replicas, weight),
            };
            TrafficAction::Shift {
                weight,
                stable_replicas,
                canary_replicas,
            }
        }
    }
}

/// Compute the next state of a release
///
/// Returns `Ok(None)` when nothing is due.
pub fn next_status(
    spec: &ReleaseSpec,
    status: &ReleaseStatus,
    input: StepInput,
    now: DateTime<Utc>,
) -> Result<Option<Transition>, TransitionError> {
    if status.phase.is_terminal() {
        return match input {
            StepInput::Manual(_) => Err(TransitionError::InvalidTerminalState(status.phase)),
            _ => Ok(None),
        };
    }

    let label = input.label();
    let unexpected = || TransitionError::UnexpectedInput {
        phase: status.phase,
        input: label,
    };

    match input {
        StepInput::Manual(command) => Ok(manual(status, command, now)),

        StepInput::Reject(reason) => {
            // Nothing to unwind until the release has routed traffic
            let phase = if status.phase == Phase::Pending || !status.started() {
                Phase::Failed
            } else {
                Phase::Failing
            };
            if phase == Phase::Failing && status.phase == Phase::Failing {
                return Ok(None);
            }
            Ok(Some(Transition {
                status: moved(status, phase, now, reason),
                action: TrafficAction::None,
            }))
        }

        StepInput::Tick => match status.phase {
            Phase::Pending => {
                let strategy = select_strategy(spec)?;
                let (weight, action) = shift(strategy.as_ref(), spec, 0)?;
                let mut next = moved(
                    status,
                    Phase::Progressing,
                    now,
                    format!("Routing {}% of traffic to {}", weight, spec.image),
                );
                next.current_step_index = 0;
                next.traffic_split_percent = weight;
                next.current_revision = Some(spec.image.clone());
                next.previous_revision = spec.stable_image.clone();
                next.consecutive_failures = 0;
                next.consecutive_inconclusive = 0;
                Ok(Some(Transition { status: next, action }))
            }
            Phase::Progressing => {
                let strategy = select_strategy(spec)?;
                let due = elapsed_since(status.last_transition_time.as_deref(), now)
                    .map_or(true, |elapsed| elapsed >= strategy.analysis_interval());
                if !due {
                    return Ok(None);
                }
                let next = moved(
                    status,
                    Phase::Analyzing,
                    now,
                    format!("Analyzing step {}", status.current_step_index),
                );
                Ok(Some(Transition {
                    status: next,
                    action: TrafficAction::None,
                }))
            }
            Phase::Promoting => {
                let mut next = moved(
                    status,
                    Phase::Succeeded,
                    now,
                    format!("Promoted {}", spec.image),
                );
                next.traffic_split_percent = 100;
                if next.current_revision.is_none() {
                    next.current_revision = Some(spec.image.clone());
                    next.previous_revision = spec.stable_image.clone();
                }
                Ok(Some(Transition {
                    status: next,
                    action: TrafficAction::Promote,
                }))
            }
            Phase::Failing => {
                let target = status.rollback_target.clone();
                let restored = target
                    .clone()
                    .or_else(|| status.previous_revision.clone())
                    .unwrap_or_else(|| "the stable revision".to_string());
                let mut next = moved(
                    status,
                    Phase::RolledBack,
                    now,
                    format!("Rolled back to {}", restored),
                );
                next.traffic_split_percent = 0;
                Ok(Some(Transition {
                    status: next,
                    action: TrafficAction::Revert {
                        to_revision: target,
                    },
                }))
            }
            Phase::Analyzing | Phase::Paused => Ok(None),
            Phase::Succeeded | Phase::Failed | Phase::RolledBack | Phase::Aborted => Ok(None),
        },

        StepInput::Verdict(run) => {
            if status.phase != Phase::Analyzing {
                return Err(unexpected());
            }
            let strategy = select_strategy(spec)?;
            Ok(Some(apply_verdict(strategy.as_ref(), spec, status, run, now)?))
        }
    }
}

fn apply_verdict(
    strategy: &dyn ReleaseStrategy,
    spec: &ReleaseSpec,
    status: &ReleaseStatus,
    run: AnalysisRun,
    now: DateTime<Utc>,
) -> Result<Transition, TransitionError> {
    let verdict = run.overall_verdict;
    let worsening: Vec<String> = if run.trending_worse && verdict != Verdict::Fail {
        run.metric_results
            .iter()
            .filter(|r| r.trending_worse)
            .map(|r| r.name.clone())
            .collect()
    } else {
        Vec::new()
    };
    let mut next = status.clone();
    next.push_analysis_run(run);
    next.last_analysis_time = Some(now.to_rfc3339());

    if !worsening.is_empty() {
        let message = format!(
            "Trending worse at step {}: {}; paused for review",
            status.current_step_index,
            worsening.join(", ")
        );
        return Ok(Transition {
            status: moved(&next, Phase::Paused, now, message),
            action: TrafficAction::None,
        });
    }

    let step = status.current_step_index as usize;
    let mut action = TrafficAction::None;

    match verdict {
        Verdict::Pass => {
            next.consecutive_failures = 0;
            next.consecutive_inconclusive = 0;
            if step + 1 < strategy.steps().len() {
                let (weight, shift_action) = shift(strategy, spec, step + 1)?;
                next = moved(
                    &next,
                    Phase::Progressing,
                    now,
                    format!("Step {} passed, routing {}% of traffic", step, weight),
                );
                next.current_step_index = (step + 1) as u32;
                next.traffic_split_percent = weight;
                action = shift_action;
            } else if spec.auto_promote() {
                next = moved(
                    &next,
                    Phase::Promoting,
                    now,
                    "All steps passed, promoting".to_string(),
                );
            } else {
                next = moved(
                    &next,
                    Phase::Paused,
                    now,
                    "All steps passed, awaiting manual promotion".to_string(),
                );
            }
        }
        Verdict::Fail => {
            next.consecutive_failures += 1;
            next.consecutive_inconclusive = 0;
            if next.consecutive_failures >= strategy.failure_threshold() {
                let message = format!(
                    "Analysis failed {} consecutive times, rolling back",
                    next.consecutive_failures
                );
                next = moved(&next, Phase::Failing, now, message);
            } else {
                next.message = Some(format!(
                    "Analysis failed ({}/{})",
                    next.consecutive_failures,
                    strategy.failure_threshold()
                ));
            }
        }
        Verdict::Inconclusive => {
            next.consecutive_inconclusive += 1;
            next.message = Some(format!(
                "Analysis inconclusive ({}/{})",
                next.consecutive_inconclusive,
                strategy.inconclusive_limit()
            ));
        }
    }

    Ok(Transition {
        status: next,
        action,
    })
}

fn manual(
    status: &ReleaseStatus,
    command: ManualCommand,
    now: DateTime<Utc>,
) -> Option<Transition> {
    let next = match command {
        ManualCommand::Promote => {
            if status.phase == Phase::Promoting {
                return None;
            }
            moved(
                status,
                Phase::Promoting,
                now,
                "Manual promotion requested".to_string(),
            )
        }
        ManualCommand::Rollback { to_revision } => {
            if status.phase == Phase::Failing && status.rollback_target == to_revision {
                return None;
            }
            let mut next = moved(
                status,
                Phase::Failing,
                now,
                match &to_revision {
                    Some(rev) => format!("Manual rollback to {} requested", rev),
                    None => "Manual rollback requested".to_string(),
                },
            );
            next.rollback_target = to_revision;
            next
        }
        ManualCommand::Abort => moved(
            status,
            Phase::Aborted,
            now,
            "Aborted by operator".to_string(),
        ),
    };

    Some(Transition {
        status: next,
        action: TrafficAction::None,
    })
}

#[cfg(test)]
#[path = "strategies_test.rs"]
mod tests;

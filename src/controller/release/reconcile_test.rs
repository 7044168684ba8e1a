#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity

use super::*;
use crate::controller::analysis::AnalysisEngine;
use crate::controller::clock::MockClock;
use crate::controller::orchestrator::ReleaseOrchestrator;
use crate::controller::prometheus::{EvalError, MockMetricEvaluator, MockResponse};
use crate::controller::release::store::fake::InMemoryReleaseClient;
use crate::controller::release::traffic::RecordingRouter;
use crate::controller::signature::tests::{sign, test_key};
use crate::controller::signature::EcdsaP256Verifier;
use crate::crd::release::{
    BlueGreenStrategy, CanaryStrategy, MetricCheck, PredictiveAnalysis, ReleaseSpec,
    ReleaseStrategy, Verdict,
};
use chrono::{DateTime, Utc};

const ERROR_RATE: &str = "sum(rate(http_errors_total[1m]))";

struct Harness {
    client: Arc<InMemoryReleaseClient>,
    router: Arc<RecordingRouter>,
    evaluator: Arc<MockMetricEvaluator>,
    clock: Arc<MockClock>,
    ctx: Context,
    key: ReleaseKey,
}

impl Harness {
    fn new(release: Release) -> Self {
        let client = Arc::new(InMemoryReleaseClient::new());
        client.insert(release.clone());
        let router = Arc::new(RecordingRouter::new());
        let evaluator = Arc::new(MockMetricEvaluator::new());
        let clock = Arc::new(MockClock::new(
            DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(20_000),
        ));

        let ctx = Context {
            store: ReleaseStore::new(client.clone()),
            router: router.clone(),
            analysis: AnalysisEngine::new(evaluator.clone(), Duration::from_millis(100)),
            verifier: Arc::new(EcdsaP256Verifier::new(false)),
            clock: clock.clone(),
            metrics: None,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        };

        Self {
            client,
            router,
            evaluator,
            clock,
            ctx,
            key: ReleaseKey::from_release(&release).unwrap(),
        }
    }

    async fn tick(&self) -> Result<TickResult, ReconcileError> {
        reconcile_once(&self.key, &self.ctx).await
    }

    fn status(&self) -> ReleaseStatus {
        self.client
            .current(&self.key)
            .unwrap()
            .status
            .unwrap_or_default()
    }

    fn advance(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }
}

fn canary_release(steps: Vec<u8>, failure_threshold: u32) -> Release {
    let mut release = Release::new(
        "checkout",
        ReleaseSpec {
            app_name: "checkout".to_string(),
            image: "ghcr.io/acme/checkout:1.4.0".to_string(),
            stable_image: Some("ghcr.io/acme/checkout:1.3.2".to_string()),
            replicas: 4,
            strategy: ReleaseStrategy {
                canary: Some(CanaryStrategy {
                    traffic_steps: steps,
                    analysis_interval: "1m".to_string(),
                    failure_threshold,
                    inconclusive_limit: None,
                    metrics: vec![MetricCheck {
                        name: "error-rate".to_string(),
                        query: ERROR_RATE.to_string(),
                        success_condition: "result < 0.05".to_string(),
                        failure_condition: None,
                        predictive_analysis: None,
                    }],
                }),
                blue_green: None,
            },
            traffic_routing: None,
            auto_promote: None,
            public_key: None,
            signature: None,
        },
    );
    release.metadata.namespace = Some("shop".to_string());
    release
}

fn shift(weight: u8, stable_replicas: i32, canary_replicas: i32) -> TrafficAction {
    TrafficAction::Shift {
        weight,
        stable_replicas,
        canary_replicas,
    }
}

#[tokio::test]
async fn test_happy_path_canary() {
    let h = Harness::new(canary_release(vec![20, 50, 100], 2));
    h.evaluator.set(ERROR_RATE, MockResponse::Value(0.01));

    // Pending -> Progressing at the first split
    assert!(matches!(h.tick().await, Ok(TickResult::Advanced { .. })));
    let s = h.status();
    assert_eq!(s.phase, Phase::Progressing);
    assert_eq!(s.traffic_split_percent, 20);
    assert_eq!(s.current_revision.as_deref(), Some("ghcr.io/acme/checkout:1.4.0"));
    assert_eq!(s.previous_revision.as_deref(), Some("ghcr.io/acme/checkout:1.3.2"));

    // Holding the split: nothing due, wake up when the interval ends
    assert_eq!(
        h.tick().await,
        Ok(TickResult::NoChange {
            requeue_after: Some(Duration::from_secs(60))
        })
    );

    let mut last_step = 0;
    for expected_weight in [50u8, 100] {
        h.advance(60);
        h.tick().await.unwrap();
        assert_eq!(h.status().phase, Phase::Analyzing);

        h.tick().await.unwrap();
        let s = h.status();
        assert_eq!(s.phase, Phase::Progressing);
        assert_eq!(s.traffic_split_percent, expected_weight);
        assert!(s.current_step_index > last_step, "steps must advance monotonically");
        last_step = s.current_step_index;
    }

    h.advance(60);
    h.tick().await.unwrap();
    h.tick().await.unwrap();
    assert_eq!(h.status().phase, Phase::Promoting);

    assert_eq!(h.tick().await, Ok(TickResult::TerminalReached));
    let s = h.status();
    assert_eq!(s.phase, Phase::Succeeded);
    assert_eq!(s.traffic_split_percent, 100);
    assert_eq!(s.analysis_runs.len(), 3);
    assert!(s
        .analysis_runs
        .iter()
        .all(|r| r.overall_verdict == Verdict::Pass));

    assert_eq!(
        h.router.applied(),
        vec![
            shift(20, 3, 1),
            shift(50, 2, 2),
            shift(100, 0, 4),
            TrafficAction::Promote
        ]
    );

    // Terminal releases are left alone
    let patches = h.client.patch_count();
    assert_eq!(h.tick().await, Ok(TickResult::TerminalReached));
    assert_eq!(h.client.patch_count(), patches);
}

#[tokio::test]
async fn test_automatic_rollback_after_threshold() {
    let h = Harness::new(canary_release(vec![20, 100], 2));
    h.evaluator.set(ERROR_RATE, MockResponse::Value(0.5));

    h.tick().await.unwrap();
    h.advance(60);
    h.tick().await.unwrap();
    assert_eq!(h.status().phase, Phase::Analyzing);

    // First failure stays under the threshold
    assert_eq!(
        h.tick().await,
        Ok(TickResult::Advanced {
            requeue_after: Some(Duration::from_secs(60))
        })
    );
    let s = h.status();
    assert_eq!(s.phase, Phase::Analyzing);
    assert_eq!(s.consecutive_failures, 1);

    // Analysis is not repeated within the interval
    let calls = h.evaluator.calls();
    assert!(matches!(h.tick().await, Ok(TickResult::NoChange { .. })));
    assert_eq!(h.evaluator.calls(), calls);

    h.advance(60);
    h.tick().await.unwrap();
    let s = h.status();
    assert_eq!(s.phase, Phase::Failing);
    assert_eq!(s.consecutive_failures, 2);

    assert_eq!(h.tick().await, Ok(TickResult::TerminalReached));
    let s = h.status();
    assert_eq!(s.phase, Phase::RolledBack);
    assert_eq!(s.traffic_split_percent, 0);
    assert_eq!(
        h.router.applied().last(),
        Some(&TrafficAction::Revert { to_revision: None })
    );
}

#[tokio::test]
async fn test_inconclusive_runs_are_tolerated_then_escalated() {
    let h = Harness::new(canary_release(vec![100], 1));
    h.evaluator.set(
        ERROR_RATE,
        MockResponse::Error(EvalError::HttpError("connection refused".to_string())),
    );

    h.tick().await.unwrap();
    h.advance(60);
    h.tick().await.unwrap();

    for streak in 1..=3 {
        h.tick().await.unwrap();
        let s = h.status();
        assert_eq!(s.phase, Phase::Analyzing, "run {} should be tolerated", streak);
        assert_eq!(s.consecutive_inconclusive, streak);
        assert_eq!(s.consecutive_failures, 0);
        h.advance(60);
    }

    // Fourth inconclusive run exceeds the default limit and counts as a failure
    h.tick().await.unwrap();
    let s = h.status();
    assert_eq!(s.phase, Phase::Failing);
    let last = s.analysis_runs.last().unwrap();
    assert_eq!(last.overall_verdict, Verdict::Fail);
    assert!(last.escalated);
}

#[tokio::test]
async fn test_recovery_resets_failure_count() {
    let h = Harness::new(canary_release(vec![20, 100], 2));
    h.evaluator.set(ERROR_RATE, MockResponse::Value(0.5));

    h.tick().await.unwrap();
    h.advance(60);
    h.tick().await.unwrap();
    h.tick().await.unwrap();
    assert_eq!(h.status().consecutive_failures, 1);

    h.evaluator.set(ERROR_RATE, MockResponse::Value(0.0));
    h.advance(60);
    h.tick().await.unwrap();
    let s = h.status();
    assert_eq!(s.phase, Phase::Progressing);
    assert_eq!(s.consecutive_failures, 0);
    assert_eq!(s.current_step_index, 1);
}

#[tokio::test]
async fn test_manual_promotion_required_when_auto_promote_disabled() {
    let mut release = canary_release(vec![100], 1);
    release.spec.auto_promote = Some(false);
    let h = Harness::new(release);
    h.evaluator.set(ERROR_RATE, MockResponse::Value(0.0));

    h.tick().await.unwrap();
    h.advance(60);
    h.tick().await.unwrap();
    h.tick().await.unwrap();
    assert_eq!(h.status().phase, Phase::Paused);

    // Parked: no timed wakeup, nothing happens on later ticks
    h.advance(3600);
    assert_eq!(
        h.tick().await,
        Ok(TickResult::NoChange {
            requeue_after: None
        })
    );
    assert_eq!(h.status().phase, Phase::Paused);
}

#[tokio::test]
async fn test_blue_green_preview_then_cutover() {
    let mut release = canary_release(vec![100], 1);
    release.spec.replicas = 3;
    release.spec.strategy = ReleaseStrategy {
        canary: None,
        blue_green: Some(BlueGreenStrategy {
            analysis_interval: "30s".to_string(),
            failure_threshold: 1,
            inconclusive_limit: None,
            metrics: vec![],
        }),
    };
    let h = Harness::new(release);

    h.tick().await.unwrap();
    assert_eq!(h.status().traffic_split_percent, 0);
    h.advance(30);
    h.tick().await.unwrap();
    h.tick().await.unwrap();
    assert_eq!(h.status().phase, Phase::Promoting);
    assert_eq!(h.tick().await, Ok(TickResult::TerminalReached));

    assert_eq!(
        h.router.applied(),
        vec![shift(0, 3, 3), TrafficAction::Promote]
    );
    assert_eq!(h.status().traffic_split_percent, 100);
}

#[tokio::test]
async fn test_invalid_signature_fails_release() {
    let (pem, key) = test_key(3);
    let mut release = canary_release(vec![100], 1);
    release.spec.public_key = Some(pem);
    release.spec.signature = Some(sign(&key, "ghcr.io/acme/checkout:9.9.9"));
    let h = Harness::new(release);

    assert_eq!(h.tick().await, Ok(TickResult::TerminalReached));
    let s = h.status();
    assert_eq!(s.phase, Phase::Failed);
    assert!(s
        .message
        .as_deref()
        .unwrap()
        .starts_with("Signature verification failed"));
    assert!(h.router.applied().is_empty(), "no traffic may move");
}

#[tokio::test]
async fn test_valid_signature_starts_release() {
    let (pem, key) = test_key(3);
    let mut release = canary_release(vec![100], 1);
    release.spec.signature = Some(sign(&key, &release.spec.image));
    release.spec.public_key = Some(pem);
    let h = Harness::new(release);

    h.tick().await.unwrap();
    assert_eq!(h.status().phase, Phase::Progressing);
}

#[tokio::test]
async fn test_invalid_spec_fails_pending_release() {
    let h = Harness::new(canary_release(vec![50, 20], 1));

    assert_eq!(h.tick().await, Ok(TickResult::TerminalReached));
    let s = h.status();
    assert_eq!(s.phase, Phase::Failed);
    assert!(s.message.as_deref().unwrap().contains("non-decreasing"));
}

#[tokio::test]
async fn test_router_failure_keeps_phase_and_records_message() {
    let h = Harness::new(canary_release(vec![20, 100], 1));
    h.router.fail_next("gateway unavailable");

    let result = h.tick().await;
    assert!(matches!(result, Err(ReconcileError::Transient(_))));
    let s = h.status();
    assert_eq!(s.phase, Phase::Pending);
    assert!(s.message.as_deref().unwrap().contains("gateway unavailable"));

    // Next tick retries and succeeds
    h.tick().await.unwrap();
    assert_eq!(h.status().phase, Phase::Progressing);
}

#[tokio::test]
async fn test_conflict_is_retried() {
    let h = Harness::new(canary_release(vec![20, 100], 1));
    h.client
        .inject_patch_failure(StoreError::Conflict("shop/checkout".to_string()));

    assert!(matches!(h.tick().await, Ok(TickResult::Advanced { .. })));
    assert_eq!(h.client.patch_count(), 2);
    assert_eq!(h.status().phase, Phase::Progressing);
}

#[tokio::test]
async fn test_persistent_conflict_is_contention() {
    let h = Harness::new(canary_release(vec![20, 100], 1));
    for _ in 0..=DEFAULT_CONFLICT_RETRIES {
        h.client
            .inject_patch_failure(StoreError::Conflict("shop/checkout".to_string()));
    }

    assert_eq!(
        h.tick().await,
        Err(ReconcileError::Contention {
            key: "shop/checkout".to_string(),
            attempts: DEFAULT_CONFLICT_RETRIES + 1,
        })
    );
    assert_eq!(h.status().phase, Phase::Pending);
}

#[tokio::test]
async fn test_transient_load_failure() {
    let h = Harness::new(canary_release(vec![100], 1));
    h.client
        .inject_get_failure(StoreError::Transient("etcd timeout".to_string()));

    assert!(matches!(h.tick().await, Err(ReconcileError::Transient(_))));
}

#[tokio::test]
async fn test_missing_release_is_not_found() {
    let h = Harness::new(canary_release(vec![100], 1));
    let ghost = ReleaseKey::new("shop", "ghost");

    assert_eq!(
        reconcile_once(&ghost, &h.ctx).await,
        Err(ReconcileError::NotFound("shop/ghost".to_string()))
    );
}

#[tokio::test]
async fn test_manual_rollback_target_is_restored() {
    let h = Harness::new(canary_release(vec![20, 100], 1));
    h.tick().await.unwrap();

    // An operator asked to go back to a specific revision
    let current = h.client.current(&h.key).unwrap();
    let mut status = current.status.clone().unwrap();
    status.phase = Phase::Failing;
    status.rollback_target = Some("ghcr.io/acme/checkout:1.2.0".to_string());
    h.ctx
        .store
        .commit_status(&h.key, &resource_version(&current).unwrap(), &status)
        .await
        .unwrap();

    assert_eq!(h.tick().await, Ok(TickResult::TerminalReached));
    assert_eq!(
        h.router.applied().last(),
        Some(&TrafficAction::Revert {
            to_revision: Some("ghcr.io/acme/checkout:1.2.0".to_string())
        })
    );
    assert_eq!(
        h.status().message.as_deref(),
        Some("Rolled back to ghcr.io/acme/checkout:1.2.0")
    );
}

#[tokio::test]
async fn test_metrics_recorded() {
    let mut h = Harness::new(canary_release(vec![20, 100], 1));
    let metrics = crate::server::metrics::create_metrics().unwrap();
    h.ctx.metrics = Some(metrics.clone());

    h.tick().await.unwrap();

    let body = metrics.encode().unwrap();
    assert!(body.contains(r#"release_reconciliations_total{result="advanced"} 1"#));
    assert!(body.contains(r#"release="checkout"} 20"#));
}

#[tokio::test]
async fn test_early_promote_is_still_verified() {
    let (pem, key) = test_key(3);
    let mut release = canary_release(vec![20, 100], 1);
    release.spec.public_key = Some(pem);
    release.spec.signature = Some(sign(&key, "ghcr.io/acme/checkout:9.9.9"));
    let h = Harness::new(release);

    // Created outside `start`, then promoted before the reconciler saw it
    let orchestrator = ReleaseOrchestrator::new(
        h.client.clone(),
        Arc::new(EcdsaP256Verifier::new(false)),
        h.clock.clone(),
    );
    let promoted = orchestrator.promote(&h.key).await.unwrap();
    assert_eq!(promoted.status.unwrap().phase, Phase::Promoting);

    assert_eq!(h.tick().await, Ok(TickResult::TerminalReached));
    let s = h.status();
    assert_eq!(s.phase, Phase::Failed);
    assert!(s
        .message
        .as_deref()
        .unwrap()
        .starts_with("Signature verification failed"));
    assert_eq!(s.current_revision, None);
    assert!(h.router.applied().is_empty(), "no traffic may move");
}

#[tokio::test]
async fn test_early_promote_of_valid_release_cuts_over() {
    let h = Harness::new(canary_release(vec![20, 100], 1));
    let orchestrator = ReleaseOrchestrator::new(
        h.client.clone(),
        Arc::new(EcdsaP256Verifier::new(false)),
        h.clock.clone(),
    );
    orchestrator.promote(&h.key).await.unwrap();

    assert_eq!(h.tick().await, Ok(TickResult::TerminalReached));
    let s = h.status();
    assert_eq!(s.phase, Phase::Succeeded);
    assert_eq!(s.current_revision.as_deref(), Some("ghcr.io/acme/checkout:1.4.0"));
    assert_eq!(s.previous_revision.as_deref(), Some("ghcr.io/acme/checkout:1.3.2"));
    assert_eq!(h.router.applied(), vec![TrafficAction::Promote]);
}

#[tokio::test]
async fn test_spec_invalid_mid_rollout_unwinds() {
    let h = Harness::new(canary_release(vec![20, 100], 2));
    h.tick().await.unwrap();
    h.advance(60);
    h.tick().await.unwrap();
    assert_eq!(h.status().phase, Phase::Analyzing);

    // The spec is edited in place to something that no longer validates
    let mut edited = h.client.current(&h.key).unwrap();
    if let Some(canary) = edited.spec.strategy.canary.as_mut() {
        canary.analysis_interval = "soon".to_string();
    }
    h.client.insert(edited);

    h.advance(600);
    assert_eq!(
        h.tick().await,
        Ok(TickResult::Advanced {
            requeue_after: Some(Duration::ZERO)
        })
    );
    let s = h.status();
    assert_eq!(s.phase, Phase::Failing);
    assert!(s.message.as_deref().unwrap().starts_with("Invalid spec"));

    assert_eq!(h.tick().await, Ok(TickResult::TerminalReached));
    assert_eq!(h.status().phase, Phase::RolledBack);
    assert_eq!(
        h.router.applied().last(),
        Some(&TrafficAction::Revert { to_revision: None })
    );
}

#[tokio::test]
async fn test_lost_race_to_abort_restores_recorded_split() {
    let h = Harness::new(canary_release(vec![20, 50, 100], 2));
    h.evaluator.set(ERROR_RATE, MockResponse::Value(0.01));
    h.tick().await.unwrap();
    h.advance(60);
    h.tick().await.unwrap();
    assert_eq!(h.status().phase, Phase::Analyzing);

    // An operator aborts while this tick shifts to the next step
    let mut aborted = h.status();
    aborted.phase = Phase::Aborted;
    aborted.message = Some("Aborted by operator".to_string());
    h.client.inject_concurrent_status(aborted);

    assert_eq!(h.tick().await, Ok(TickResult::TerminalReached));
    let s = h.status();
    assert_eq!(s.phase, Phase::Aborted);
    assert_eq!(s.traffic_split_percent, 20);
    assert_eq!(
        h.router.applied(),
        vec![shift(20, 3, 1), shift(50, 2, 2), shift(20, 3, 1)]
    );
}

#[tokio::test]
async fn test_worsening_metric_pauses_release() {
    let mut release = canary_release(vec![20, 50, 100], 2);
    if let Some(canary) = release.spec.strategy.canary.as_mut() {
        canary.metrics[0].predictive_analysis = Some(PredictiveAnalysis {
            enabled: true,
            trend_threshold: Some(0.0001),
        });
    }
    let h = Harness::new(release);

    h.evaluator.set(ERROR_RATE, MockResponse::Value(0.01));
    h.tick().await.unwrap();
    h.advance(60);
    h.tick().await.unwrap();
    h.tick().await.unwrap();
    assert_eq!(h.status().traffic_split_percent, 50);

    // Still under the success threshold, but climbing 0.0005 per second
    h.evaluator.set(ERROR_RATE, MockResponse::Value(0.04));
    h.advance(60);
    h.tick().await.unwrap();
    h.tick().await.unwrap();

    let s = h.status();
    assert_eq!(s.phase, Phase::Paused);
    assert_eq!(s.traffic_split_percent, 50);
    assert!(s.message.as_deref().unwrap().contains("error-rate"));
    let last = s.analysis_runs.last().unwrap();
    assert_eq!(last.overall_verdict, Verdict::Pass);
    assert!(last.trending_worse);
    assert_eq!(h.router.applied(), vec![shift(20, 3, 1), shift(50, 2, 2)]);
}

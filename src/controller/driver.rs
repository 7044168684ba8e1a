//! Drives `reconcile_once` from a kube-runtime `Controller`
//!
//! The `Controller` keeps at most one reconcile in flight per release, folds
//! requests that arrive meanwhile into one, bounds parallelism and runs the
//! timed requeues. This module maps tick outcomes onto `Action`s and backs
//! off releases whose ticks keep failing.

use crate::controller::release::{reconcile_once, Context, ReconcileError, ReleaseKey, TickResult};
use crate::crd::release::Release;
use crate::server::ShutdownSignal;
use futures::channel::{mpsc, oneshot};
use futures::{FutureExt, Stream, StreamExt};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_CONCURRENT: u16 = 16;
pub const MIN_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Controller-side reference to a release
pub fn object_ref(key: &ReleaseKey) -> ObjectRef<Release> {
    ObjectRef::new(&key.name).within(&key.namespace)
}

/// Requests an out-of-band reconcile, e.g. after a manual command
#[derive(Clone)]
pub struct ReconcileTrigger {
    sender: mpsc::UnboundedSender<ObjectRef<Release>>,
}

impl ReconcileTrigger {
    /// Trigger handle plus the stream to hand to `run`
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ObjectRef<Release>>) {
        let (sender, receiver) = mpsc::unbounded();
        (Self { sender }, receiver)
    }

    pub fn trigger(&self, key: &ReleaseKey) {
        if self.sender.unbounded_send(object_ref(key)).is_err() {
            debug!(release = %key, "Controller stopped, dropping trigger");
        }
    }
}

/// Shared state of the reconcile and error-policy callbacks
pub struct DriverContext {
    pub reconciler: Context,
    resync_interval: Duration,
    failures: Mutex<HashMap<ReleaseKey, u32>>,
}

impl DriverContext {
    pub fn new(reconciler: Context, resync_interval: Duration) -> Self {
        Self {
            reconciler,
            resync_interval,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Consecutive failed ticks of a release
    pub fn failures(&self, key: &ReleaseKey) -> u32 {
        self.lock().get(key).copied().unwrap_or(0)
    }

    fn record_failure(&self, key: &ReleaseKey) -> u32 {
        let mut failures = self.lock();
        let count = failures.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    fn clear_failures(&self, key: &ReleaseKey) {
        self.lock().remove(key);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ReleaseKey, u32>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// When to tick a release again after a successful tick
///
/// Releases without due work fall back to the resync interval; terminal
/// releases only wake up on change.
pub fn requeue_after(tick: &TickResult, resync_interval: Duration) -> Option<Duration> {
    match tick {
        TickResult::Advanced { requeue_after } | TickResult::NoChange { requeue_after } => {
            Some(requeue_after.unwrap_or(resync_interval))
        }
        TickResult::TerminalReached => None,
    }
}

/// Delay before retrying after `failures` consecutive failed ticks
pub fn backoff_for(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    MIN_BACKOFF
        .saturating_mul(1u32 << exponent)
        .min(MAX_BACKOFF)
}

/// Reconcile callback for the `Controller`
pub async fn reconcile(
    release: Arc<Release>,
    ctx: Arc<DriverContext>,
) -> Result<Action, ReconcileError> {
    let Some(key) = ReleaseKey::from_release(&release) else {
        warn!("Ignoring Release without namespace");
        return Ok(Action::await_change());
    };

    match reconcile_once(&key, &ctx.reconciler).await {
        Ok(tick) => {
            ctx.clear_failures(&key);
            Ok(match requeue_after(&tick, ctx.resync_interval) {
                Some(delay) => Action::requeue(delay),
                None => Action::await_change(),
            })
        }
        Err(ReconcileError::NotFound(_)) => {
            debug!(release = %key, "Release deleted");
            ctx.clear_failures(&key);
            Ok(Action::await_change())
        }
        Err(e) => Err(e),
    }
}

/// Error policy for the `Controller`: per-release exponential backoff
pub fn error_policy(
    release: Arc<Release>,
    error: &ReconcileError,
    ctx: Arc<DriverContext>,
) -> Action {
    let failures = ReleaseKey::from_release(&release)
        .map(|key| ctx.record_failure(&key))
        .unwrap_or(1);
    let delay = backoff_for(failures);
    warn!(
        release = %release.name_any(),
        error = %error,
        failures,
        retry_in = ?delay,
        "Reconcile failed, backing off"
    );
    Action::requeue(delay)
}

/// Run the release controller until `shutdown` fires and in-flight ticks finish
pub async fn run(
    api: Api<Release>,
    ctx: Arc<DriverContext>,
    concurrency: u16,
    triggers: impl Stream<Item = ObjectRef<Release>> + Send + 'static,
    mut shutdown: ShutdownSignal,
) {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        shutdown.wait().await;
        let _ = stop_tx.send(());
    });

    Controller::new(api, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .reconcile_on(triggers)
        .graceful_shutdown_on(stop_rx.map(|_| ()))
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            // Failures are logged by error_policy
            if let Ok((release, action)) = res {
                debug!(release = %release, action = ?action, "Reconciled");
            }
        })
        .await;
    info!("Release controller stopped");
}

//! Versioned access to Release objects
//!
//! Every status write carries the `resourceVersion` it was computed from. The
//! API server rejects stale versions with 409, which surfaces as
//! `StoreError::Conflict` so the caller can reload and re-evaluate.

use super::ReleaseKey;
use crate::crd::release::{Release, ReleaseStatus};
use async_trait::async_trait;
use futures::future::ready;
use futures::stream::{BoxStream, Stream, StreamExt};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::ResourceExt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("release {0} not found")]
    NotFound(String),

    #[error("release {0} already exists")]
    AlreadyExists(String),

    #[error("release {0} was modified concurrently")]
    Conflict(String),

    #[error("Kubernetes API error: {0}")]
    Transient(String),
}

/// Typed access to Release resources
#[async_trait]
pub trait ReleaseClient: Send + Sync {
    async fn get(&self, key: &ReleaseKey) -> Result<Release, StoreError>;

    async fn create(&self, release: &Release) -> Result<Release, StoreError>;

    /// Replace the whole status if the object is still at `resource_version`
    ///
    /// Fields unset in `status` are cleared on the stored object.
    async fn patch_status(
        &self,
        key: &ReleaseKey,
        resource_version: &str,
        status: &ReleaseStatus,
    ) -> Result<Release, StoreError>;

    /// Snapshots of one release, starting with its current state
    ///
    /// A failed watch yields its error as the last item; a clean close just ends.
    fn watch(&self, key: &ReleaseKey) -> BoxStream<'static, Result<Release, StoreError>>;
}

/// Status fields that serialize as absent when unset
const CLEARABLE_STATUS_FIELDS: &[&str] = &[
    "currentRevision",
    "previousRevision",
    "lastTransitionTime",
    "lastAnalysisTime",
    "rollbackTarget",
    "message",
];

/// Merge patch that swaps in `status` at `resource_version`
///
/// A merge patch keeps any key it does not mention, so unset fields go out
/// as explicit nulls and an empty history as an empty list.
pub fn status_patch(
    resource_version: &str,
    status: &ReleaseStatus,
) -> Result<serde_json::Value, StoreError> {
    let mut body = serde_json::to_value(status)
        .map_err(|e| StoreError::Transient(format!("cannot encode status: {}", e)))?;
    if let Some(fields) = body.as_object_mut() {
        for field in CLEARABLE_STATUS_FIELDS {
            fields
                .entry(field.to_string())
                .or_insert(serde_json::Value::Null);
        }
        fields
            .entry("analysisRuns".to_string())
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
    }
    // resourceVersion in a merge patch turns it into a compare-and-swap
    Ok(serde_json::json!({
        "metadata": { "resourceVersion": resource_version },
        "status": body,
    }))
}

/// Pass items through up to and including the first error, then stop
pub fn end_after_first_error<S, T, E>(stream: S) -> impl Stream<Item = Result<T, E>>
where
    S: Stream<Item = Result<T, E>>,
{
    stream.scan(false, |failed, item| {
        if *failed {
            return ready(None);
        }
        *failed = item.is_err();
        ready(Some(item))
    })
}

fn map_kube_error(key: &ReleaseKey, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) => classify_api_error(key, resp.code, &resp.reason, &resp.message),
        other => StoreError::Transient(other.to_string()),
    }
}

/// 409 means AlreadyExists on create and a stale resourceVersion on patch
fn classify_api_error(key: &ReleaseKey, code: u16, reason: &str, message: &str) -> StoreError {
    match code {
        404 => StoreError::NotFound(key.to_string()),
        409 if reason == "AlreadyExists" => StoreError::AlreadyExists(key.to_string()),
        409 => StoreError::Conflict(key.to_string()),
        _ => StoreError::Transient(format!("{} ({}): {}", reason, code, message)),
    }
}

/// Release client over the Kubernetes API
#[derive(Clone)]
pub struct KubeReleaseClient {
    client: kube::Client,
}

impl KubeReleaseClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Release> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ReleaseClient for KubeReleaseClient {
    async fn get(&self, key: &ReleaseKey) -> Result<Release, StoreError> {
        self.api(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| map_kube_error(key, e))
    }

    async fn create(&self, release: &Release) -> Result<Release, StoreError> {
        let key = ReleaseKey::from_release(release)
            .ok_or_else(|| StoreError::Transient("release has no namespace".to_string()))?;
        self.api(&key.namespace)
            .create(&PostParams::default(), release)
            .await
            .map_err(|e| map_kube_error(&key, e))
    }

    async fn patch_status(
        &self,
        key: &ReleaseKey,
        resource_version: &str,
        status: &ReleaseStatus,
    ) -> Result<Release, StoreError> {
        let patch = status_patch(resource_version, status)?;
        self.api(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error(key, e))
    }

    fn watch(&self, key: &ReleaseKey) -> BoxStream<'static, Result<Release, StoreError>> {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", key.name));
        let key = key.clone();
        let events = watcher(self.api(&key.namespace), config)
            .applied_objects()
            .map(move |event| event.map_err(|e| StoreError::Transient(format!("{}: {}", key, e))));
        end_after_first_error(events).boxed()
    }
}

/// Release state store
///
/// Thin layer over a `ReleaseClient` that owns the optimistic write protocol.
#[derive(Clone)]
pub struct ReleaseStore {
    client: Arc<dyn ReleaseClient>,
}

impl ReleaseStore {
    pub fn new(client: Arc<dyn ReleaseClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<dyn ReleaseClient> {
        &self.client
    }

    pub async fn load(&self, key: &ReleaseKey) -> Result<Release, StoreError> {
        self.client.get(key).await
    }

    /// Commit a status computed from the object at `expected_version`
    pub async fn commit_status(
        &self,
        key: &ReleaseKey,
        expected_version: &str,
        status: &ReleaseStatus,
    ) -> Result<Release, StoreError> {
        match self.client.patch_status(key, expected_version, status).await {
            Ok(release) => {
                debug!(
                    release = %key,
                    phase = ?status.phase,
                    resource_version = ?release.resource_version(),
                    "Status committed"
                );
                Ok(release)
            }
            Err(StoreError::Conflict(k)) => {
                warn!(release = %key, expected_version, "Status write lost to a concurrent update");
                Err(StoreError::Conflict(k))
            }
            Err(e) => Err(e),
        }
    }
}

/// Resource version of a loaded release
pub fn resource_version(release: &Release) -> Result<String, StoreError> {
    release
        .resource_version()
        .ok_or_else(|| StoreError::Transient(format!("{} has no resourceVersion", release.name_any())))
}

/// In-memory release client for tests
///
/// Mimics the API server's compare-and-swap on `resourceVersion` and streams
/// snapshots to watchers until `disconnect_watches` is called.
#[cfg(test)]
#[allow(clippy::expect_used)]
pub mod fake {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    struct Inner {
        objects: HashMap<ReleaseKey, Release>,
        next_version: u64,
        patch_failures: VecDeque<StoreError>,
        get_failures: VecDeque<StoreError>,
        concurrent_writes: VecDeque<ReleaseStatus>,
        patches: usize,
        events: Option<broadcast::Sender<Release>>,
    }

    pub struct InMemoryReleaseClient {
        inner: Mutex<Inner>,
    }

    impl InMemoryReleaseClient {
        pub fn new() -> Self {
            Self {
                inner: Mutex::new(Inner {
                    objects: HashMap::new(),
                    next_version: 1,
                    patch_failures: VecDeque::new(),
                    get_failures: VecDeque::new(),
                    concurrent_writes: VecDeque::new(),
                    patches: 0,
                    events: None,
                }),
            }
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
            self.inner.lock().expect("InMemoryReleaseClient lock poisoned")
        }

        /// Store an object as-is, bypassing create semantics
        pub fn insert(&self, mut release: Release) -> Release {
            let mut inner = self.lock();
            release.metadata.resource_version = Some(inner.next_version.to_string());
            inner.next_version += 1;
            let key = ReleaseKey::from_release(&release).expect("test release needs a namespace");
            inner.objects.insert(key, release.clone());
            if let Some(tx) = &inner.events {
                let _ = tx.send(release.clone());
            }
            release
        }

        pub fn current(&self, key: &ReleaseKey) -> Option<Release> {
            self.lock().objects.get(key).cloned()
        }

        pub fn inject_patch_failure(&self, err: StoreError) {
            self.lock().patch_failures.push_back(err);
        }

        pub fn inject_get_failure(&self, err: StoreError) {
            self.lock().get_failures.push_back(err);
        }

        /// Let another writer commit `status` just before the next patch lands
        ///
        /// That patch then fails with Conflict, as it would against the API server.
        pub fn inject_concurrent_status(&self, status: ReleaseStatus) {
            self.lock().concurrent_writes.push_back(status);
        }

        pub fn patch_count(&self) -> usize {
            self.lock().patches
        }

        /// End every open watch stream, as a dropped connection would
        pub fn disconnect_watches(&self) {
            self.lock().events = None;
        }
    }

    #[async_trait]
    impl ReleaseClient for InMemoryReleaseClient {
        async fn get(&self, key: &ReleaseKey) -> Result<Release, StoreError> {
            let mut inner = self.lock();
            if let Some(err) = inner.get_failures.pop_front() {
                return Err(err);
            }
            inner
                .objects
                .get(key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.to_string()))
        }

        async fn create(&self, release: &Release) -> Result<Release, StoreError> {
            let key = ReleaseKey::from_release(release)
                .ok_or_else(|| StoreError::Transient("release has no namespace".to_string()))?;
            if self.lock().objects.contains_key(&key) {
                return Err(StoreError::AlreadyExists(key.to_string()));
            }
            Ok(self.insert(release.clone()))
        }

        async fn patch_status(
            &self,
            key: &ReleaseKey,
            resource_version: &str,
            status: &ReleaseStatus,
        ) -> Result<Release, StoreError> {
            let mut inner = self.lock();
            inner.patches += 1;
            if let Some(err) = inner.patch_failures.pop_front() {
                return Err(err);
            }
            let version = inner.next_version;
            let concurrent = inner.concurrent_writes.pop_front();
            let stored = inner
                .objects
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            if let Some(other) = concurrent {
                stored.status = Some(other);
                stored.metadata.resource_version = Some(version.to_string());
                let updated = stored.clone();
                inner.next_version += 1;
                if let Some(tx) = &inner.events {
                    let _ = tx.send(updated);
                }
                return Err(StoreError::Conflict(key.to_string()));
            }
            if stored.metadata.resource_version.as_deref() != Some(resource_version) {
                return Err(StoreError::Conflict(key.to_string()));
            }
            stored.status = Some(status.clone());
            stored.metadata.resource_version = Some(version.to_string());
            let updated = stored.clone();
            inner.next_version += 1;
            if let Some(tx) = &inner.events {
                let _ = tx.send(updated.clone());
            }
            Ok(updated)
        }

        fn watch(&self, key: &ReleaseKey) -> BoxStream<'static, Result<Release, StoreError>> {
            let mut inner = self.lock();
            let rx = inner
                .events
                .get_or_insert_with(|| broadcast::channel(64).0)
                .subscribe();
            let initial = inner.objects.get(key).cloned();
            let key = key.clone();

            let updates = futures::stream::unfold(rx, move |mut rx| {
                let key = key.clone();
                async move {
                    loop {
                        match rx.recv().await {
                            Ok(release) if ReleaseKey::from_release(&release).as_ref() == Some(&key) => {
                                return Some((Ok(release), rx))
                            }
                            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => return None,
                        }
                    }
                }
            });

            futures::stream::iter(initial.map(Ok)).chain(updates).boxed()
        }
    }
}

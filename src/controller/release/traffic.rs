//! Applying traffic actions to the cluster
//!
//! A release owns two Deployments, `<app>-stable` and `<app>-canary`, and
//! optionally a Gateway API HTTPRoute whose backendRefs split traffic between
//! the stable and canary Services.

use crate::controller::strategies::TrafficAction;
use crate::crd::release::{Release, TrafficRouting};
use async_trait::async_trait;
use gateway_api::apis::standard::httproutes::HTTPRouteRulesBackendRefs;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, Patch, PatchParams};
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Release {0} has no namespace")]
    MissingNamespace(String),

    #[error("HTTPRoute {0} is malformed: {1}")]
    MalformedRoute(String, String),
}

/// Applies traffic actions decided by the strategy executor
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    async fn apply(&self, release: &Release, action: &TrafficAction) -> Result<(), RouterError>;
}

pub fn stable_workload(app: &str) -> String {
    format!("{}-stable", app)
}

pub fn canary_workload(app: &str) -> String {
    format!("{}-canary", app)
}

/// Get the service port from routing configuration, defaulting to 80
pub fn default_service_port(configured: Option<i32>) -> i32 {
    configured.unwrap_or(80)
}

/// Split total replicas between stable and canary for a canary weight
///
/// Canary replicas are rounded up so any non-zero weight gets at least one pod.
/// Returns `(stable, canary)`.
pub fn calculate_replica_split(total_replicas: i32, canary_weight: u8) -> (i32, i32) {
    let canary_replicas = match canary_weight {
        0 => 0,
        w if w >= 100 => total_replicas,
        w => ((total_replicas as f64 * w as f64) / 100.0).ceil() as i32,
    };
    (total_replicas - canary_replicas, canary_replicas)
}

/// Build weighted backendRefs for the stable and canary Services
pub fn build_backend_refs(
    routing: &TrafficRouting,
    canary_weight: u8,
) -> Vec<HTTPRouteRulesBackendRefs> {
    let port = default_service_port(routing.port);
    let canary_weight = i32::from(canary_weight.min(100));
    [
        (&routing.stable_service, 100 - canary_weight),
        (&routing.canary_service, canary_weight),
    ]
    .into_iter()
    .map(|(service, weight)| HTTPRouteRulesBackendRefs {
        name: service.clone(),
        port: Some(port),
        weight: Some(weight),
        kind: Some("Service".to_string()),
        group: Some("".to_string()),
        namespace: None,
        filters: None,
    })
    .collect()
}

/// Router that patches Deployments and an HTTPRoute through the Kubernetes API
#[derive(Clone)]
pub struct KubeTrafficRouter {
    client: kube::Client,
}

impl KubeTrafficRouter {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// Set replicas and, when given, the app container image of one Deployment
    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        image: Option<&str>,
        replicas: i32,
    ) -> Result<(), RouterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);

        let mut patch = serde_json::json!({ "spec": { "replicas": replicas } });
        if let Some(image) = image {
            patch["spec"]["template"] = serde_json::json!({
                "spec": { "containers": [{ "name": container, "image": image }] }
            });
        }

        api.patch(name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await?;
        info!(deployment = ?name, replicas, image = ?image, "Deployment patched");
        Ok(())
    }

    /// Rewrite backendRefs on every rule of the release's HTTPRoute
    ///
    /// A missing HTTPRoute is logged and skipped; replica scaling still applies.
    async fn set_route_weights(
        &self,
        namespace: &str,
        release_name: &str,
        routing: &TrafficRouting,
        canary_weight: u8,
    ) -> Result<(), RouterError> {
        let ar = ApiResource {
            group: "gateway.networking.k8s.io".to_string(),
            version: "v1".to_string(),
            api_version: "gateway.networking.k8s.io/v1".to_string(),
            kind: "HTTPRoute".to_string(),
            plural: "httproutes".to_string(),
        };
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);

        let route = match api.get(&routing.http_route).await {
            Ok(route) => route,
            Err(kube::Error::Api(err)) if err.code == 404 => {
                warn!(
                    release = ?release_name,
                    httproute = ?routing.http_route,
                    "HTTPRoute not found - skipping traffic routing update"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let backend_refs = serde_json::to_value(build_backend_refs(routing, canary_weight))
            .map_err(|e| RouterError::MalformedRoute(routing.http_route.clone(), e.to_string()))?;
        let rules = rewrite_rules(&route.data, &backend_refs)
            .map_err(|e| RouterError::MalformedRoute(routing.http_route.clone(), e))?;

        let patch = serde_json::json!({ "spec": { "rules": rules } });
        api.patch(
            &routing.http_route,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;

        info!(
            release = ?release_name,
            httproute = ?routing.http_route,
            canary_weight,
            "HTTPRoute weights updated"
        );
        Ok(())
    }
}

/// Replace backendRefs on each rule, keeping matches and filters intact
fn rewrite_rules(
    route: &serde_json::Value,
    backend_refs: &serde_json::Value,
) -> Result<Vec<serde_json::Value>, String> {
    let rules = route
        .get("spec")
        .and_then(|s| s.get("rules"))
        .and_then(|r| r.as_array())
        .cloned()
        .unwrap_or_default();

    if rules.is_empty() {
        return Ok(vec![serde_json::json!({ "backendRefs": backend_refs })]);
    }

    rules
        .into_iter()
        .map(|mut rule| match rule.as_object_mut() {
            Some(obj) => {
                obj.insert("backendRefs".to_string(), backend_refs.clone());
                Ok(rule)
            }
            None => Err("rule is not an object".to_string()),
        })
        .collect()
}

#[async_trait]
impl TrafficRouter for KubeTrafficRouter {
    async fn apply(&self, release: &Release, action: &TrafficAction) -> Result<(), RouterError> {
        let name = release.name_any();
        let namespace = release
            .namespace()
            .ok_or_else(|| RouterError::MissingNamespace(name.clone()))?;
        let spec = &release.spec;
        let stable = stable_workload(&spec.app_name);
        let canary = canary_workload(&spec.app_name);

        match action {
            TrafficAction::None => Ok(()),
            TrafficAction::Shift {
                weight,
                stable_replicas,
                canary_replicas,
            } => {
                // Capacity first, then traffic, then scale stable down
                self.patch_deployment(
                    &namespace,
                    &canary,
                    &spec.app_name,
                    Some(&spec.image),
                    *canary_replicas,
                )
                .await?;
                if let Some(routing) = &spec.traffic_routing {
                    self.set_route_weights(&namespace, &name, routing, *weight)
                        .await?;
                }
                self.patch_deployment(&namespace, &stable, &spec.app_name, None, *stable_replicas)
                    .await
            }
            TrafficAction::Promote => {
                self.patch_deployment(
                    &namespace,
                    &stable,
                    &spec.app_name,
                    Some(&spec.image),
                    spec.replicas,
                )
                .await?;
                if let Some(routing) = &spec.traffic_routing {
                    self.set_route_weights(&namespace, &name, routing, 0).await?;
                }
                self.patch_deployment(&namespace, &canary, &spec.app_name, None, 0)
                    .await
            }
            TrafficAction::Revert { to_revision } => {
                self.patch_deployment(
                    &namespace,
                    &stable,
                    &spec.app_name,
                    to_revision.as_deref(),
                    spec.replicas,
                )
                .await?;
                if let Some(routing) = &spec.traffic_routing {
                    self.set_route_weights(&namespace, &name, routing, 0).await?;
                }
                self.patch_deployment(&namespace, &canary, &spec.app_name, None, 0)
                    .await
            }
        }
    }
}

/// Router that records actions instead of touching a cluster
#[cfg(test)]
#[allow(clippy::expect_used)]
pub struct RecordingRouter {
    applied: std::sync::Mutex<Vec<(String, TrafficAction)>>,
    failures: std::sync::Mutex<std::collections::VecDeque<String>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl RecordingRouter {
    pub fn new() -> Self {
        Self {
            applied: std::sync::Mutex::new(Vec::new()),
            failures: std::sync::Mutex::new(std::collections::VecDeque::new()),
        }
    }

    pub fn applied(&self) -> Vec<TrafficAction> {
        self.applied
            .lock()
            .expect("RecordingRouter lock poisoned")
            .iter()
            .map(|(_, a)| a.clone())
            .collect()
    }

    /// Fail the next apply with a namespace error carrying `message`
    pub fn fail_next(&self, message: &str) {
        self.failures
            .lock()
            .expect("RecordingRouter lock poisoned")
            .push_back(message.to_string());
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::expect_used)]
impl TrafficRouter for RecordingRouter {
    async fn apply(&self, release: &Release, action: &TrafficAction) -> Result<(), RouterError> {
        if let Some(message) = self
            .failures
            .lock()
            .expect("RecordingRouter lock poisoned")
            .pop_front()
        {
            return Err(RouterError::MalformedRoute(release.name_any(), message));
        }
        self.applied
            .lock()
            .expect("RecordingRouter lock poisoned")
            .push((release.name_any(), action.clone()));
        Ok(())
    }
}

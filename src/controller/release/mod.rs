//! Release reconciliation: state store, traffic, validation and the tick itself

pub mod reconcile;
pub mod status;
pub mod store;
pub mod traffic;
pub mod validation;

use crate::crd::release::Release;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use reconcile::{reconcile_once, Context, ReconcileError, TickResult};
pub use store::{KubeReleaseClient, ReleaseClient, ReleaseStore, StoreError};
pub use traffic::{KubeTrafficRouter, RouterError, TrafficRouter};

/// Identity of a Release: `(namespace, name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReleaseKey {
    pub namespace: String,
    pub name: String,
}

impl ReleaseKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a Release object, None when it has no namespace
    pub fn from_release(release: &Release) -> Option<Self> {
        Some(Self::new(release.namespace()?, release.name_any()))
    }
}

impl fmt::Display for ReleaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

//! Contracts with the external collaborators the populator reconciles against.
//!
//! The volume manager owns none of these data paths. The pod source is the node's
//! authoritative registry of assigned pods, the status source reports the latest
//! observed pod status (and may be transiently unavailable), the container runtime
//! answers whether a pod still has any containers on this node, and the secret store
//! tells the populator whether a pod's referenced secrets have been rehydrated locally.

use thiserror::Error;
use uuid::Uuid;

use crate::pod::{Pod, PodStatus, UniquePodName};

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("pod status source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
}

/// Registry of pods currently bound to this node.
pub trait PodSource: Send + Sync {
    fn list_pods(&self) -> Vec<Pod>;

    fn get_pod_by_key(&self, key: &UniquePodName) -> Option<Pod>;
}

/// Latest observed status for a pod, keyed by UID.
///
/// `Ok(None)` means the source has no entry for the pod (callers fall back to the
/// pod record's own status); `Err` means the source itself is unavailable right now.
pub trait PodStatusSource: Send + Sync {
    fn get_pod_status(&self, uid: Uuid) -> Result<Option<PodStatus>, StatusError>;
}

/// A pod as the local container runtime sees it.
#[derive(Debug, Clone)]
pub struct RuntimePod {
    pub uid: Uuid,
    pub container_count: usize,
}

/// Inspection-only view of the local container runtime.
pub trait ContainerRuntime: Send + Sync {
    /// Lists runtime-visible pods; `include_all` also returns pods whose
    /// containers have all exited.
    fn get_pods(&self, include_all: bool) -> Result<Vec<RuntimePod>, RuntimeError>;
}

/// Node-local secret availability, used to defer pods whose secret volumes
/// cannot be resolved yet.
pub trait SecretStore: Send + Sync {
    fn has_secret(&self, namespace: &str, name: &str) -> bool;
}

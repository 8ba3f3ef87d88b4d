//! In-memory fakes for the collaborator traits, used by the crate's own tests and
//! by embedders simulating a node agent.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::plugin::{VolumePlugin, VolumePluginManager};
use crate::pod::{Pod, PodPhase, PodStatus, UniquePodName, Volume, VolumeSource};
use crate::sources::{
    ContainerRuntime, PodSource, PodStatusSource, RuntimeError, RuntimePod, SecretStore,
    StatusError,
};

/// Accepts every volume source and names volumes after the pod-declared volume
/// name, so a declared volume `disk0` becomes cache entry `fake-plugin/disk0`.
pub struct FakeVolumePlugin;

impl VolumePlugin for FakeVolumePlugin {
    fn name(&self) -> &str {
        "fake-plugin"
    }

    fn can_support(&self, _source: &VolumeSource) -> bool {
        true
    }

    fn generate_volume_name(&self, _pod: &Pod, volume: &Volume) -> String {
        volume.name.clone()
    }
}

pub fn fake_volume_plugin_manager() -> Arc<VolumePluginManager> {
    Arc::new(VolumePluginManager::new(vec![Box::new(FakeVolumePlugin)]))
}

#[derive(Default)]
pub struct FakePodSource {
    pods: Mutex<HashMap<UniquePodName, Pod>>,
}

impl FakePodSource {
    pub fn new() -> Self {
        FakePodSource::default()
    }

    pub fn add_pod(&self, pod: Pod) -> UniquePodName {
        let key = UniquePodName::for_pod(&pod);
        self.pods.lock().unwrap().insert(key.clone(), pod);
        key
    }

    pub fn remove_pod(&self, key: &UniquePodName) {
        self.pods.lock().unwrap().remove(key);
    }

    pub fn set_pod_phase(&self, key: &UniquePodName, phase: PodPhase) {
        if let Some(pod) = self.pods.lock().unwrap().get_mut(key) {
            pod.status.phase = phase;
        }
    }
}

impl PodSource for FakePodSource {
    fn list_pods(&self) -> Vec<Pod> {
        self.pods.lock().unwrap().values().cloned().collect()
    }

    fn get_pod_by_key(&self, key: &UniquePodName) -> Option<Pod> {
        self.pods.lock().unwrap().get(key).cloned()
    }
}

#[derive(Default)]
pub struct FakeStatusSource {
    statuses: Mutex<HashMap<Uuid, PodStatus>>,
    failure: Mutex<Option<String>>,
}

impl FakeStatusSource {
    pub fn new() -> Self {
        FakeStatusSource::default()
    }

    pub fn set_status(&self, uid: Uuid, status: PodStatus) {
        self.statuses.lock().unwrap().insert(uid, status);
    }

    /// Makes every lookup fail until [`Self::clear_failure`] is called.
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn clear_failure(&self) {
        *self.failure.lock().unwrap() = None;
    }
}

impl PodStatusSource for FakeStatusSource {
    fn get_pod_status(&self, uid: Uuid) -> Result<Option<PodStatus>, StatusError> {
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(StatusError::Unavailable(message));
        }
        Ok(self.statuses.lock().unwrap().get(&uid).cloned())
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    pods: Mutex<Vec<RuntimePod>>,
    failure: Mutex<Option<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        FakeRuntime::default()
    }

    pub fn set_pods(&self, pods: Vec<RuntimePod>) {
        *self.pods.lock().unwrap() = pods;
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }
}

impl ContainerRuntime for FakeRuntime {
    fn get_pods(&self, _include_all: bool) -> Result<Vec<RuntimePod>, RuntimeError> {
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(RuntimeError::Unavailable(message));
        }
        Ok(self.pods.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeSecretStore {
    secrets: Mutex<HashSet<(String, String)>>,
}

impl FakeSecretStore {
    pub fn new() -> Self {
        FakeSecretStore::default()
    }

    pub fn insert_secret(&self, namespace: &str, name: &str) {
        self.secrets
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()));
    }
}

impl SecretStore for FakeSecretStore {
    fn has_secret(&self, namespace: &str, name: &str) -> bool {
        self.secrets
            .lock()
            .unwrap()
            .contains(&(namespace.to_string(), name.to_string()))
    }
}

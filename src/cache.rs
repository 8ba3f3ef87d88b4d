//! The desired state of world cache: which volumes must be mounted for which pods right now.
//!
//! [`DesiredStateOfWorld`] is the authoritative in-memory index of mount intent. The
//! populator is the only writer of pod/volume associations; mount workers read it to
//! decide what to attach and write back only the `reported_in_use` flag. One mutex
//! guards the whole structure; every operation is a short critical section and volume
//! plugin resolution happens before the lock is taken, so no external call ever runs
//! under it. Callers get linearizable visibility of the latest committed state, not a
//! consistent snapshot across separate calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::plugin::{PluginError, VolumePluginManager};
use crate::pod::{Pod, UniquePodName, UniqueVolumeName};

/// One entry of the mount worklist returned by [`DesiredStateOfWorld::get_volumes_to_mount`].
#[derive(Debug, Clone)]
pub struct VolumeToMount {
    pub volume_name: UniqueVolumeName,
    pub pod_key: UniquePodName,
    pub pod: Pod,
    /// The volume's name as declared inside the owning pod spec.
    pub outer_volume_name: String,
    /// Whether an external mount worker has confirmed this volume as attached.
    pub reported_in_use: bool,
}

struct PodEntry {
    pod: Pod,
    outer_volume_name: String,
}

struct VolumeEntry {
    reported_in_use: bool,
    pods: HashMap<UniquePodName, PodEntry>,
}

pub struct DesiredStateOfWorld {
    plugin_mgr: Arc<VolumePluginManager>,
    volumes: Mutex<HashMap<UniqueVolumeName, VolumeEntry>>,
}

impl DesiredStateOfWorld {
    pub fn new(plugin_mgr: Arc<VolumePluginManager>) -> Self {
        DesiredStateOfWorld {
            plugin_mgr,
            volumes: Mutex::new(HashMap::new()),
        }
    }

    // The guarded map is left consistent by every critical section, so a poisoned
    // lock (per-pod work is panic-isolated by the populator) is safe to recover.
    fn lock(&self) -> MutexGuard<'_, HashMap<UniqueVolumeName, VolumeEntry>> {
        self.volumes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds pod↔volume associations for every volume the pod declares and returns
    /// the unique names newly associated with this pod.
    ///
    /// Idempotent per (pod, volume) pair: re-adding an existing association is a
    /// no-op and is not included in the returned set. If any declared volume fails
    /// plugin resolution the cache is not mutated at all and the error is returned,
    /// leaving the pod to be retried on a later reconciliation pass.
    pub fn add_pod_volumes(&self, pod: &Pod) -> Result<Vec<UniqueVolumeName>, PluginError> {
        let pod_key = UniquePodName::for_pod(pod);

        // Resolve every spec before touching the lock.
        let mut resolved = Vec::with_capacity(pod.spec.volumes.len());
        for volume in &pod.spec.volumes {
            let volume_name = self.plugin_mgr.unique_volume_name(pod, volume)?;
            resolved.push((volume_name, volume.name.clone()));
        }

        let mut volumes = self.lock();
        let mut added = Vec::new();
        for (volume_name, outer_volume_name) in resolved {
            let entry = volumes.entry(volume_name.clone()).or_insert_with(|| {
                debug!(
                    volume = %volume_name,
                    "[DesiredStateOfWorld] First pod reference; creating volume entry"
                );
                VolumeEntry {
                    reported_in_use: false,
                    pods: HashMap::new(),
                }
            });
            if entry.pods.contains_key(&pod_key) {
                debug!(
                    pod_key = %pod_key,
                    volume = %volume_name,
                    "[DesiredStateOfWorld] Pod already associated with volume; skipping"
                );
                continue;
            }
            entry.pods.insert(
                pod_key.clone(),
                PodEntry {
                    pod: pod.clone(),
                    outer_volume_name,
                },
            );
            added.push(volume_name);
        }
        Ok(added)
    }

    /// Removes every association for the pod; a volume entry whose last pod
    /// reference was just dropped is removed with it. Unknown pods are a no-op.
    pub fn delete_pod_volumes(&self, pod_key: &UniquePodName) {
        let mut volumes = self.lock();
        volumes.retain(|volume_name, entry| {
            if entry.pods.remove(pod_key).is_some() && entry.pods.is_empty() {
                debug!(
                    pod_key = %pod_key,
                    volume = %volume_name,
                    "[DesiredStateOfWorld] Last pod reference dropped; removing volume entry"
                );
                return false;
            }
            true
        });
    }

    pub fn volume_exists(&self, volume_name: &UniqueVolumeName) -> bool {
        self.lock().contains_key(volume_name)
    }

    pub fn pod_exists_in_volume(
        &self,
        pod_key: &UniquePodName,
        volume_name: &UniqueVolumeName,
    ) -> bool {
        self.lock()
            .get(volume_name)
            .is_some_and(|entry| entry.pods.contains_key(pod_key))
    }

    /// Point-in-time snapshot of every (pod, volume) association. Order is not
    /// significant.
    pub fn get_volumes_to_mount(&self) -> Vec<VolumeToMount> {
        let volumes = self.lock();
        let mut to_mount = Vec::new();
        for (volume_name, entry) in volumes.iter() {
            for (pod_key, pod_entry) in entry.pods.iter() {
                to_mount.push(VolumeToMount {
                    volume_name: volume_name.clone(),
                    pod_key: pod_key.clone(),
                    pod: pod_entry.pod.clone(),
                    outer_volume_name: pod_entry.outer_volume_name.clone(),
                    reported_in_use: entry.reported_in_use,
                });
            }
        }
        to_mount
    }

    /// Metadata-only update, independent of association bookkeeping. Marking a
    /// volume the cache no longer holds is a logged no-op.
    pub fn mark_volume_reported_in_use(&self, volume_name: &UniqueVolumeName, in_use: bool) {
        let mut volumes = self.lock();
        match volumes.get_mut(volume_name) {
            Some(entry) => entry.reported_in_use = in_use,
            None => debug!(
                volume = %volume_name,
                in_use,
                "[DesiredStateOfWorld] Mark reported-in-use for unknown volume; ignoring"
            ),
        }
    }

    /// Bulk form used by mount reporters: the listed volumes are marked in use,
    /// every other volume in the cache is marked not in use.
    pub fn mark_volumes_reported_in_use(&self, in_use: &[UniqueVolumeName]) {
        let mut volumes = self.lock();
        for (volume_name, entry) in volumes.iter_mut() {
            entry.reported_in_use = in_use.contains(volume_name);
        }
    }
}

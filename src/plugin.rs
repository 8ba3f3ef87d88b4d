//! Volume plugin resolution: one capability implementation per supported volume source kind.
//!
//! A [`VolumePlugin`] knows whether it supports a given [`VolumeSource`] and how to derive
//! a deterministic volume name from a pod's declared volume. The [`VolumePluginManager`]
//! holds the registered plugins and resolves a declared volume to exactly one of them;
//! anything else (zero or several matches) is a resolution error the caller reports and
//! retries on a later reconciliation pass.

use thiserror::Error;

use crate::pod::{Pod, UniqueVolumeName, Volume, VolumeSource};

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("no volume plugin matched volume {volume}")]
    NoPluginMatched { volume: String },
    #[error("multiple volume plugins matched volume {volume}: {plugins:?}")]
    MultiplePluginsMatched {
        volume: String,
        plugins: Vec<String>,
    },
}

/// Capability interface for one volume source kind.
///
/// Shared-media plugins (host path, NFS) derive the name from the backing resource so
/// identical specs from different pods converge on one cache entry; per-pod plugins
/// (empty dir, secret) include the pod UID so they never do.
pub trait VolumePlugin: Send + Sync {
    fn name(&self) -> &str;

    fn can_support(&self, source: &VolumeSource) -> bool;

    fn generate_volume_name(&self, pod: &Pod, volume: &Volume) -> String;
}

impl std::fmt::Debug for dyn VolumePlugin + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumePlugin")
            .field("name", &self.name())
            .finish()
    }
}

pub struct HostPathPlugin;

impl VolumePlugin for HostPathPlugin {
    fn name(&self) -> &str {
        "host-path"
    }

    fn can_support(&self, source: &VolumeSource) -> bool {
        matches!(source, VolumeSource::HostPath { .. })
    }

    fn generate_volume_name(&self, _pod: &Pod, volume: &Volume) -> String {
        match &volume.source {
            VolumeSource::HostPath { path } => path.clone(),
            _ => volume.name.clone(),
        }
    }
}

pub struct EmptyDirPlugin;

impl VolumePlugin for EmptyDirPlugin {
    fn name(&self) -> &str {
        "empty-dir"
    }

    fn can_support(&self, source: &VolumeSource) -> bool {
        matches!(source, VolumeSource::EmptyDir {})
    }

    fn generate_volume_name(&self, pod: &Pod, volume: &Volume) -> String {
        format!("{}-{}", pod.metadata.uid, volume.name)
    }
}

pub struct NfsPlugin;

impl VolumePlugin for NfsPlugin {
    fn name(&self) -> &str {
        "nfs"
    }

    fn can_support(&self, source: &VolumeSource) -> bool {
        matches!(source, VolumeSource::Nfs { .. })
    }

    fn generate_volume_name(&self, _pod: &Pod, volume: &Volume) -> String {
        match &volume.source {
            VolumeSource::Nfs { server, path, .. } => format!("{server}{path}"),
            _ => volume.name.clone(),
        }
    }
}

pub struct SecretPlugin;

impl VolumePlugin for SecretPlugin {
    fn name(&self) -> &str {
        "secret"
    }

    fn can_support(&self, source: &VolumeSource) -> bool {
        matches!(source, VolumeSource::Secret { .. })
    }

    fn generate_volume_name(&self, pod: &Pod, volume: &Volume) -> String {
        format!("{}-{}", pod.metadata.uid, volume.name)
    }
}

/// Registry of the volume plugins available on this node.
pub struct VolumePluginManager {
    plugins: Vec<Box<dyn VolumePlugin>>,
}

impl VolumePluginManager {
    pub fn new(plugins: Vec<Box<dyn VolumePlugin>>) -> Self {
        VolumePluginManager { plugins }
    }

    /// The plugin set a production node agent registers at startup.
    pub fn with_default_plugins() -> Self {
        VolumePluginManager::new(vec![
            Box::new(HostPathPlugin),
            Box::new(EmptyDirPlugin),
            Box::new(NfsPlugin),
            Box::new(SecretPlugin),
        ])
    }

    /// Resolves a declared volume to the single plugin supporting its source.
    pub fn find_plugin_by_spec(&self, volume: &Volume) -> Result<&dyn VolumePlugin, PluginError> {
        let mut matches = self
            .plugins
            .iter()
            .filter(|plugin| plugin.can_support(&volume.source));

        let Some(first) = matches.next() else {
            return Err(PluginError::NoPluginMatched {
                volume: volume.name.clone(),
            });
        };

        let extra: Vec<String> = matches.map(|plugin| plugin.name().to_string()).collect();
        if !extra.is_empty() {
            let mut plugins = vec![first.name().to_string()];
            plugins.extend(extra);
            return Err(PluginError::MultiplePluginsMatched {
                volume: volume.name.clone(),
                plugins,
            });
        }

        Ok(first.as_ref())
    }

    /// Composes the cache-wide unique volume name for a pod's declared volume.
    pub fn unique_volume_name(
        &self,
        pod: &Pod,
        volume: &Volume,
    ) -> Result<UniqueVolumeName, PluginError> {
        let plugin = self.find_plugin_by_spec(volume)?;
        Ok(UniqueVolumeName::new(
            plugin.name(),
            &plugin.generate_volume_name(pod, volume),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::{ObjectMeta, PodSpec, PodStatus};
    use uuid::Uuid;

    fn make_pod(uid: Uuid, volumes: Vec<Volume>) -> Pod {
        Pod {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            metadata: ObjectMeta {
                name: "pod".to_string(),
                namespace: "default".to_string(),
                uid,
                ..Default::default()
            },
            spec: PodSpec { volumes },
            status: PodStatus::default(),
        }
    }

    #[test]
    fn default_plugins_resolve_each_supported_kind() {
        let mgr = VolumePluginManager::with_default_plugins();
        let pod = make_pod(Uuid::new_v4(), Vec::new());

        let host_path = Volume {
            name: "data".to_string(),
            source: VolumeSource::HostPath {
                path: "/opt/data".to_string(),
            },
        };
        assert_eq!(
            mgr.unique_volume_name(&pod, &host_path).unwrap().as_str(),
            "host-path//opt/data"
        );

        let nfs = Volume {
            name: "shared".to_string(),
            source: VolumeSource::Nfs {
                server: "fs.internal".to_string(),
                path: "/exports/shared".to_string(),
                read_only: false,
            },
        };
        assert_eq!(
            mgr.unique_volume_name(&pod, &nfs).unwrap().as_str(),
            "nfs/fs.internal/exports/shared"
        );
    }

    #[test]
    fn per_pod_plugins_never_collide_across_pods() {
        let mgr = VolumePluginManager::with_default_plugins();
        let volume = Volume {
            name: "scratch".to_string(),
            source: VolumeSource::EmptyDir {},
        };
        let pod_a = make_pod(Uuid::new_v4(), Vec::new());
        let pod_b = make_pod(Uuid::new_v4(), Vec::new());

        let name_a = mgr.unique_volume_name(&pod_a, &volume).unwrap();
        let name_b = mgr.unique_volume_name(&pod_b, &volume).unwrap();
        assert_ne!(name_a, name_b);
    }

    #[test]
    fn shared_plugins_collide_on_identical_backing_resource() {
        let mgr = VolumePluginManager::with_default_plugins();
        let volume = Volume {
            name: "logs".to_string(),
            source: VolumeSource::HostPath {
                path: "/var/log".to_string(),
            },
        };
        let pod_a = make_pod(Uuid::new_v4(), Vec::new());
        let pod_b = make_pod(Uuid::new_v4(), Vec::new());

        assert_eq!(
            mgr.unique_volume_name(&pod_a, &volume).unwrap(),
            mgr.unique_volume_name(&pod_b, &volume).unwrap()
        );
    }

    #[test]
    fn unsupported_source_is_a_resolution_error() {
        let mgr = VolumePluginManager::with_default_plugins();
        let pod = make_pod(Uuid::new_v4(), Vec::new());
        let volume = Volume {
            name: "disk0".to_string(),
            source: VolumeSource::GcePersistentDisk {
                pd_name: "pd-0".to_string(),
            },
        };

        let err = mgr.unique_volume_name(&pod, &volume).unwrap_err();
        assert!(matches!(err, PluginError::NoPluginMatched { volume } if volume == "disk0"));
    }

    #[test]
    fn ambiguous_registration_is_a_resolution_error() {
        let mgr = VolumePluginManager::new(vec![
            Box::new(HostPathPlugin),
            Box::new(HostPathPlugin),
        ]);
        let pod = make_pod(Uuid::new_v4(), Vec::new());
        let volume = Volume {
            name: "data".to_string(),
            source: VolumeSource::HostPath {
                path: "/opt/data".to_string(),
            },
        };

        let err = mgr.find_plugin_by_spec(&volume).unwrap_err();
        assert!(matches!(err, PluginError::MultiplePluginsMatched { .. }));
    }
}

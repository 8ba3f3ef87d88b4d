//! Pod and volume data model shared between the desired state cache and the populator.
//!
//! The types here mirror the manifest shape the node agent consumes (serde-compatible
//! with the usual YAML pod layout) but only carry the fields the volume manager
//! actually reads: identity, declared volumes, phase and deletion timestamp.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub uid: Uuid,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(rename = "deletionTimestamp", default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Pod {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PodSpec {
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl PodPhase {
    /// Succeeded and Failed are terminal: no further container execution occurs.
    pub fn is_terminal(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// A volume declared by a pod spec, named within the pod and backed by one source kind.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Volume {
    pub name: String,
    #[serde(flatten)]
    pub source: VolumeSource,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    HostPath {
        path: String,
    },
    EmptyDir {},
    #[serde(rename_all = "camelCase")]
    Nfs {
        server: String,
        path: String,
        #[serde(default)]
        read_only: bool,
    },
    #[serde(rename_all = "camelCase")]
    Secret {
        secret_name: String,
    },
    #[serde(rename_all = "camelCase")]
    GcePersistentDisk {
        pd_name: String,
    },
}

/// Opaque key identifying one pod bound to this node, composed from
/// namespace, name and UID so that a recreated pod never aliases its predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniquePodName(String);

impl UniquePodName {
    pub fn for_pod(pod: &Pod) -> Self {
        UniquePodName(format!(
            "{}/{}_{}",
            pod.metadata.namespace, pod.metadata.name, pod.metadata.uid
        ))
    }
}

impl fmt::Display for UniquePodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque key identifying one volume in the desired state cache,
/// `"<plugin-name>/<plugin-generated-name>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqueVolumeName(String);

impl UniqueVolumeName {
    pub fn new(plugin_name: &str, generated_name: &str) -> Self {
        UniqueVolumeName(format!("{plugin_name}/{generated_name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UniqueVolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_pod_name_composes_namespace_name_and_uid() {
        let uid = Uuid::new_v4();
        let pod = Pod {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            metadata: ObjectMeta {
                name: "web".to_string(),
                namespace: "prod".to_string(),
                uid,
                ..Default::default()
            },
            spec: PodSpec::default(),
            status: PodStatus::default(),
        };

        assert_eq!(
            UniquePodName::for_pod(&pod).to_string(),
            format!("prod/web_{uid}")
        );
    }

    #[test]
    fn phase_terminal_covers_succeeded_and_failed() {
        assert!(PodPhase::Succeeded.is_terminal());
        assert!(PodPhase::Failed.is_terminal());
        assert!(!PodPhase::Running.is_terminal());
        assert!(!PodPhase::Pending.is_terminal());
    }

    #[test]
    fn pod_manifest_parses_declared_volumes() {
        let manifest = r#"
apiVersion: v1
kind: Pod
metadata:
  name: logger
  namespace: default
spec:
  volumes:
    - name: data
      hostPath:
        path: /var/log/app
    - name: creds
      secret:
        secretName: app-creds
    - name: scratch
      emptyDir: {}
"#;
        let pod: Pod = serde_yaml::from_str(manifest).unwrap();
        assert_eq!(pod.spec.volumes.len(), 3);
        match &pod.spec.volumes[0].source {
            VolumeSource::HostPath { path } => assert_eq!(path, "/var/log/app"),
            other => panic!("unexpected volume source: {other:?}"),
        }
        match &pod.spec.volumes[1].source {
            VolumeSource::Secret { secret_name } => assert_eq!(secret_name, "app-creds"),
            other => panic!("unexpected volume source: {other:?}"),
        }
        assert!(matches!(
            pod.spec.volumes[2].source,
            VolumeSource::EmptyDir {}
        ));
    }
}

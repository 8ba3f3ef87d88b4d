//! Node-level volume mount intent reconciliation.
//!
//! The crate keeps a concurrency-safe [`cache::DesiredStateOfWorld`] of which volumes
//! must be mounted for which pods on this node, and a
//! [`populator::DesiredStateOfWorldPopulator`] loop that keeps it aligned with the
//! pod source under pod churn. Mount/unmount I/O, API clients and wire formats live
//! behind the collaborator traits in [`sources`].

pub mod cache;
pub mod config;
pub mod plugin;
pub mod pod;
pub mod populator;
pub mod sources;
pub mod test_utils;

// re-export selected public API
pub use cache::{DesiredStateOfWorld, VolumeToMount};
pub use config::PopulatorConfig;
pub use plugin::{VolumePlugin, VolumePluginManager};
pub use pod::{Pod, PodPhase, UniquePodName, UniqueVolumeName};
pub use populator::{DesiredStateOfWorldPopulator, PopulatorError, ProcessedPods};

//! Populator loop that keeps the desired state of world aligned with the pods
//! actually assigned to this node.
//!
//! [`DesiredStateOfWorldPopulator`] runs a repeating two-phase cycle on a fixed tick:
//! phase one scans the pod source and adds volumes for pods not yet processed, phase
//! two walks the processed set and removes volumes for pods that are gone or fully
//! terminated and no longer visible to the container runtime. Both phases are
//! idempotent, re-derive truth from source state every tick, and tolerate per-pod
//! failures without aborting the rest of the tick. It runs as a single background
//! task and is the sole writer of cache associations and the processed-pods set.

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc::UnboundedSender, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::DesiredStateOfWorld;
use crate::config::PopulatorConfig;
use crate::plugin::PluginError;
use crate::pod::{Pod, PodStatus, UniquePodName, VolumeSource};
use crate::sources::{ContainerRuntime, PodSource, PodStatusSource, RuntimePod, SecretStore};

/// Non-fatal reconciliation failures surfaced to whoever owns the loop.
#[derive(Error, Debug)]
pub enum PopulatorError {
    #[error("failed to resolve volumes for pod {pod}: {source}")]
    VolumeResolution {
        pod: UniquePodName,
        #[source]
        source: PluginError,
    },
    #[error("status lookups for pod {pod} have been failing for longer than {window:?}")]
    PodStatusStuck { pod: UniquePodName, window: Duration },
}

/// Bookkeeping of which pods have already had their volumes added to the cache
/// during this node agent's lifetime. Owned and mutated only by the populator.
#[derive(Default)]
pub struct ProcessedPods {
    pods: HashSet<UniquePodName>,
}

impl ProcessedPods {
    pub fn new() -> Self {
        ProcessedPods::default()
    }

    pub fn contains(&self, key: &UniquePodName) -> bool {
        self.pods.contains(key)
    }

    fn insert(&mut self, key: UniquePodName) {
        self.pods.insert(key);
    }

    fn remove(&mut self, key: &UniquePodName) {
        self.pods.remove(key);
    }

    fn keys(&self) -> Vec<UniquePodName> {
        self.pods.iter().cloned().collect()
    }
}

/// The reconciliation worker driving [`DesiredStateOfWorld`] toward the pod source.
///
/// Constructed once at node-agent startup with every collaborator passed in
/// explicitly; [`Self::run`] spawns the loop as a background tokio task and
/// [`Self::stop`] halts scheduling of further ticks while letting an in-flight
/// tick finish.
pub struct DesiredStateOfWorldPopulator {
    state: Option<State>,
    sync_loop_handle: Option<JoinHandle<()>>,
    stop_signal_tx: Option<oneshot::Sender<()>>,
}

struct StatusFailure {
    since: Instant,
    reported: bool,
}

struct State {
    pod_source: Arc<dyn PodSource>,
    status_source: Arc<dyn PodStatusSource>,
    runtime: Arc<dyn ContainerRuntime>,
    secret_store: Arc<dyn SecretStore>,
    desired_state: Arc<DesiredStateOfWorld>,
    config: PopulatorConfig,
    processed_pods: ProcessedPods,
    status_failures: HashMap<UniquePodName, StatusFailure>,
    error_tx: UnboundedSender<PopulatorError>,
}

impl DesiredStateOfWorldPopulator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pod_source: Arc<dyn PodSource>,
        status_source: Arc<dyn PodStatusSource>,
        runtime: Arc<dyn ContainerRuntime>,
        secret_store: Arc<dyn SecretStore>,
        desired_state: Arc<DesiredStateOfWorld>,
        processed_pods: ProcessedPods,
        config: PopulatorConfig,
        error_tx: UnboundedSender<PopulatorError>,
    ) -> Self {
        DesiredStateOfWorldPopulator {
            state: Some(State {
                pod_source,
                status_source,
                runtime,
                secret_store,
                desired_state,
                config,
                processed_pods,
                status_failures: HashMap::new(),
                error_tx,
            }),
            sync_loop_handle: None,
            stop_signal_tx: None,
        }
    }

    /// Starts the reconciliation loop as a background tokio task.
    ///
    /// The task ticks at the configured sync interval until [`Self::stop`] is called.
    pub fn run(&mut self) {
        if let Some(handle) = &self.sync_loop_handle {
            if !handle.is_finished() {
                warn!("[Populator] run() called while already running; ignoring.");
                return;
            }
            self.sync_loop_handle = None;
            self.stop_signal_tx = None;
        }

        let Some(mut state) = self.state.take() else {
            warn!(
                "[Populator] run() called after loop state was consumed; the populator cannot be restarted."
            );
            return;
        };

        let (stop_signal_tx, mut stop_signal_rx) = oneshot::channel();
        self.stop_signal_tx = Some(stop_signal_tx);
        debug!(
            sync_interval = ?state.config.sync_interval,
            keep_terminated_pod_volumes = state.config.keep_terminated_pod_volumes,
            "[Populator] Starting reconciliation loop"
        );

        self.sync_loop_handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(state.config.sync_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        state.populate();
                    }
                    _ = &mut stop_signal_rx => {
                        debug!("[Populator] Received stop signal, exiting reconciliation loop");
                        break;
                    }
                }
            }
        }));
    }

    /// Sends a stop signal to the loop.
    ///
    /// Scheduling of further ticks halts; an in-flight tick is allowed to finish
    /// so cache state is never abandoned mid-mutation.
    pub fn stop(&mut self) {
        if let Some(stop_signal_tx) = self.stop_signal_tx.take() {
            let _ = stop_signal_tx.send(());
        }
        self.sync_loop_handle.take();
    }
}

impl Drop for DesiredStateOfWorldPopulator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl State {
    /// One reconciliation tick: phase one always completes before phase two begins.
    fn populate(&mut self) {
        self.find_and_add_new_pods();
        self.find_and_remove_deleted_pods();
    }

    /// Phase one: add volumes for pods assigned to this node that have not been
    /// processed yet. A failure in one pod's handling never starves the others.
    fn find_and_add_new_pods(&mut self) {
        let pods = self.pod_source.list_pods();
        for pod in pods {
            // Do not (re)add volumes for terminated pods.
            if pod.status.phase.is_terminal() {
                continue;
            }
            let pod_key = UniquePodName::for_pod(&pod);
            if self.processed_pods.contains(&pod_key) {
                continue;
            }
            let outcome =
                catch_unwind(AssertUnwindSafe(|| self.process_pod_volumes(&pod, &pod_key)));
            if let Err(panic) = outcome {
                error!(
                    pod_key = %pod_key,
                    "[Populator] Panic while adding pod volumes; continuing with remaining pods: {panic:?}"
                );
            }
        }
    }

    fn process_pod_volumes(&mut self, pod: &Pod, pod_key: &UniquePodName) {
        if !self.pod_secrets_available(pod) {
            debug!(
                pod_key = %pod_key,
                "[Populator] Pod secrets not rehydrated yet; deferring to a later tick"
            );
            return;
        }

        match self.desired_state.add_pod_volumes(pod) {
            Ok(added) => {
                for volume in &added {
                    info!(
                        pod_key = %pod_key,
                        volume = %volume,
                        "[Populator] Added volume to desired state of world"
                    );
                }
                self.processed_pods.insert(pod_key.clone());
            }
            Err(err) => {
                warn!(
                    pod_key = %pod_key,
                    error = %err,
                    "[Populator] Failed to resolve pod volumes; will retry next tick"
                );
                self.report(PopulatorError::VolumeResolution {
                    pod: pod_key.clone(),
                    source: err,
                });
            }
        }
    }

    /// Every secret-backed volume must be resolvable from the node-local secret
    /// store before the pod's volumes are added.
    fn pod_secrets_available(&self, pod: &Pod) -> bool {
        pod.spec.volumes.iter().all(|volume| match &volume.source {
            VolumeSource::Secret { secret_name } => self
                .secret_store
                .has_secret(&pod.metadata.namespace, secret_name),
            _ => true,
        })
    }

    /// Phase two: remove volumes for processed pods that are gone from the pod
    /// source, or terminated with no remaining trace in the container runtime.
    fn find_and_remove_deleted_pods(&mut self) {
        // Runtime-visible pods are fetched at most once per tick; `Some(None)`
        // records a failed fetch so it is not retried within the tick.
        let mut runtime_snapshot: Option<Option<Vec<RuntimePod>>> = None;
        for pod_key in self.processed_pods.keys() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                self.sync_processed_pod(&pod_key, &mut runtime_snapshot)
            }));
            if let Err(panic) = outcome {
                error!(
                    pod_key = %pod_key,
                    "[Populator] Panic while reconciling processed pod; continuing with remaining pods: {panic:?}"
                );
            }
        }
    }

    fn sync_processed_pod(
        &mut self,
        pod_key: &UniquePodName,
        runtime_snapshot: &mut Option<Option<Vec<RuntimePod>>>,
    ) {
        let Some(pod) = self.pod_source.get_pod_by_key(pod_key) else {
            info!(
                pod_key = %pod_key,
                "[Populator] Pod no longer exists in pod source; removing its volumes"
            );
            self.remove_pod_volumes(pod_key);
            return;
        };

        let Some(status) = self.resolve_pod_status(pod_key, &pod) else {
            // Transient status failure; never force-remove on a status error.
            return;
        };

        if !is_pod_terminated(&pod, &status) {
            return;
        }

        if self.config.keep_terminated_pod_volumes {
            debug!(
                pod_key = %pod_key,
                "[Populator] Pod terminated but volume retention is enabled; keeping volumes"
            );
            return;
        }

        let Some(runtime_pods) = self.runtime_pods(runtime_snapshot) else {
            return;
        };
        let runtime_has_pod = runtime_pods
            .iter()
            .any(|runtime_pod| runtime_pod.uid == pod.metadata.uid && runtime_pod.container_count > 0);
        if runtime_has_pod {
            debug!(
                pod_key = %pod_key,
                "[Populator] Pod terminated but runtime still reports containers; keeping volumes"
            );
            return;
        }

        info!(
            pod_key = %pod_key,
            "[Populator] Pod terminated with no runtime trace; removing its volumes"
        );
        self.remove_pod_volumes(pod_key);
    }

    fn remove_pod_volumes(&mut self, pod_key: &UniquePodName) {
        self.desired_state.delete_pod_volumes(pod_key);
        self.processed_pods.remove(pod_key);
        self.status_failures.remove(pod_key);
    }

    /// Resolves the latest observed status, falling back to the pod record's own
    /// status when the source has no entry. Returns `None` on a lookup failure,
    /// which leaves the pod untouched for this tick; failures persisting beyond
    /// the retry window are reported once per failure episode.
    fn resolve_pod_status(&mut self, pod_key: &UniquePodName, pod: &Pod) -> Option<PodStatus> {
        match self.status_source.get_pod_status(pod.metadata.uid) {
            Ok(status) => {
                self.status_failures.remove(pod_key);
                Some(status.unwrap_or_else(|| pod.status.clone()))
            }
            Err(err) => {
                let window = self.config.status_retry_window;
                let failure = self
                    .status_failures
                    .entry(pod_key.clone())
                    .or_insert_with(|| StatusFailure {
                        since: Instant::now(),
                        reported: false,
                    });
                let stuck = failure.since.elapsed() >= window && !failure.reported;
                if stuck {
                    failure.reported = true;
                    warn!(
                        pod_key = %pod_key,
                        error = %err,
                        window = ?window,
                        "[Populator] Pod status lookups exceeded the retry window; pod is stuck"
                    );
                    self.report(PopulatorError::PodStatusStuck {
                        pod: pod_key.clone(),
                        window,
                    });
                } else {
                    debug!(
                        pod_key = %pod_key,
                        error = %err,
                        "[Populator] Transient pod status failure; leaving pod untouched this tick"
                    );
                }
                None
            }
        }
    }

    fn runtime_pods<'a>(
        &self,
        snapshot: &'a mut Option<Option<Vec<RuntimePod>>>,
    ) -> Option<&'a [RuntimePod]> {
        let entry = snapshot.get_or_insert_with(|| match self.runtime.get_pods(false) {
            Ok(pods) => Some(pods),
            Err(err) => {
                warn!(
                    error = %err,
                    "[Populator] Container runtime lookup failed; leaving terminated pods untouched this tick"
                );
                None
            }
        });
        entry.as_deref()
    }

    fn report(&self, err: PopulatorError) {
        if let Err(send_err) = self.error_tx.send(err) {
            debug!(
                error = %send_err.0,
                "[Populator] Error receiver dropped; discarding report"
            );
        }
    }
}

fn is_pod_terminated(pod: &Pod, status: &PodStatus) -> bool {
    status.phase.is_terminal() || pod.metadata.deletion_timestamp.is_some()
}

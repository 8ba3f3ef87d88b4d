use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use tokio::sync::mpsc::unbounded_channel;
use tokio::time::sleep;
use uuid::Uuid;

use volman::pod::{ObjectMeta, Pod, PodPhase, PodSpec, PodStatus, Volume, VolumeSource};
use volman::sources::RuntimePod;
use volman::test_utils::{
    FakePodSource, FakeRuntime, FakeSecretStore, FakeStatusSource, fake_volume_plugin_manager,
};
use volman::{
    DesiredStateOfWorld, DesiredStateOfWorldPopulator, PopulatorConfig, ProcessedPods,
    UniqueVolumeName,
};

const TICK: Duration = Duration::from_millis(20);
// Long enough for several ticks even on a loaded test runner.
const SETTLE: Duration = Duration::from_millis(200);

struct Harness {
    pod_source: Arc<FakePodSource>,
    runtime: Arc<FakeRuntime>,
    desired_state: Arc<DesiredStateOfWorld>,
    populator: DesiredStateOfWorldPopulator,
}

fn make_harness(keep_terminated_pod_volumes: bool) -> Harness {
    let pod_source = Arc::new(FakePodSource::new());
    let status_source = Arc::new(FakeStatusSource::new());
    let runtime = Arc::new(FakeRuntime::new());
    let secret_store = Arc::new(FakeSecretStore::new());
    let desired_state = Arc::new(DesiredStateOfWorld::new(fake_volume_plugin_manager()));
    let (error_tx, _error_rx) = unbounded_channel();

    let populator = DesiredStateOfWorldPopulator::new(
        pod_source.clone(),
        status_source.clone(),
        runtime.clone(),
        secret_store,
        desired_state.clone(),
        ProcessedPods::new(),
        PopulatorConfig {
            sync_interval: TICK,
            status_retry_window: Duration::from_secs(2),
            keep_terminated_pod_volumes,
        },
        error_tx,
    );

    Harness {
        pod_source,
        runtime,
        desired_state,
        populator,
    }
}

fn make_pod(name: &str, volume_name: &str) -> Pod {
    Pod {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: "default".to_string(),
            uid: Uuid::new_v4(),
            ..Default::default()
        },
        spec: PodSpec {
            volumes: vec![Volume {
                name: volume_name.to_string(),
                source: VolumeSource::GcePersistentDisk {
                    pd_name: format!("{volume_name}-device"),
                },
            }],
        },
        status: PodStatus {
            phase: PodPhase::Running,
        },
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn loop_converges_under_pod_churn() -> Result<()> {
    let mut harness = make_harness(false);
    harness.populator.run();

    let key_a = harness.pod_source.add_pod(make_pod("web", "disk0"));
    let key_b = harness.pod_source.add_pod(make_pod("db", "disk1"));
    sleep(SETTLE).await;

    let disk0 = UniqueVolumeName::new("fake-plugin", "disk0");
    let disk1 = UniqueVolumeName::new("fake-plugin", "disk1");
    assert!(harness.desired_state.pod_exists_in_volume(&key_a, &disk0));
    assert!(harness.desired_state.pod_exists_in_volume(&key_b, &disk1));
    assert_eq!(harness.desired_state.get_volumes_to_mount().len(), 2);

    // One pod disappears from the source entirely.
    harness.pod_source.remove_pod(&key_a);
    sleep(SETTLE).await;
    assert!(!harness.desired_state.volume_exists(&disk0));
    assert!(harness.desired_state.volume_exists(&disk1));

    // The other terminates with no runtime trace.
    harness.pod_source.set_pod_phase(&key_b, PodPhase::Failed);
    sleep(SETTLE).await;
    assert!(harness.desired_state.get_volumes_to_mount().is_empty());

    harness.populator.stop();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn terminated_pod_volumes_survive_while_runtime_reports_containers() -> Result<()> {
    let mut harness = make_harness(false);
    harness.populator.run();

    let pod = make_pod("batch", "disk0");
    let uid = pod.metadata.uid;
    let key = harness.pod_source.add_pod(pod);
    sleep(SETTLE).await;

    harness.runtime.set_pods(vec![RuntimePod {
        uid,
        container_count: 1,
    }]);
    harness.pod_source.set_pod_phase(&key, PodPhase::Succeeded);
    sleep(SETTLE).await;

    let disk0 = UniqueVolumeName::new("fake-plugin", "disk0");
    assert!(harness.desired_state.pod_exists_in_volume(&key, &disk0));

    harness.runtime.set_pods(Vec::new());
    sleep(SETTLE).await;
    assert!(!harness.desired_state.volume_exists(&disk0));

    harness.populator.stop();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn retention_keeps_volumes_of_failed_pod_still_in_source() -> Result<()> {
    let mut harness = make_harness(true);
    harness.populator.run();

    let key = harness.pod_source.add_pod(make_pod("batch", "disk0"));
    sleep(SETTLE).await;

    harness.pod_source.set_pod_phase(&key, PodPhase::Failed);
    sleep(SETTLE).await;

    let disk0 = UniqueVolumeName::new("fake-plugin", "disk0");
    assert!(harness.desired_state.pod_exists_in_volume(&key, &disk0));

    harness.pod_source.remove_pod(&key);
    sleep(SETTLE).await;
    assert!(!harness.desired_state.volume_exists(&disk0));

    harness.populator.stop();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn mount_worker_reports_survive_concurrent_reconciliation() -> Result<()> {
    let mut harness = make_harness(false);
    harness.populator.run();

    let key = harness.pod_source.add_pod(make_pod("web", "disk0"));
    sleep(SETTLE).await;

    // A mount worker confirms the attach through the cache's own lock while the
    // populator keeps ticking.
    let disk0 = UniqueVolumeName::new("fake-plugin", "disk0");
    let desired_state = harness.desired_state.clone();
    let reporter = {
        let disk0 = disk0.clone();
        tokio::task::spawn_blocking(move || {
            desired_state.mark_volumes_reported_in_use(std::slice::from_ref(&disk0));
        })
    };
    reporter.await?;
    sleep(SETTLE).await;

    let to_mount = harness.desired_state.get_volumes_to_mount();
    assert_eq!(to_mount.len(), 1);
    assert_eq!(to_mount[0].pod_key, key);
    assert!(to_mount[0].reported_in_use);

    harness.populator.stop();
    Ok(())
}

//! Integration tests for the allocation runner.
//!
//! Task runners are mocked so the tests can script lifecycle transitions
//! and observe exactly what the runner did with them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prometheus::Registry;
use skiff_id::{AllocId, DeployId, EvalId, JobId, NodeId};
use skiff_model::{
    Allocation, ClientStatus, DesiredStatus, Job, ResourceUsage, Task, TaskEventKind, TaskGroup,
    TaskResourceUsage, TaskRunState, TaskState,
};
use skiff_node_agent::alloc::{
    AllocRunner, AllocRunnerDeps, MockTaskRunnerFactory, NoopPrevAlloc, PrevAllocError,
    PrevAllocWatcher,
};
use skiff_node_agent::allocdir::{AllocDir, AllocDirError};
use skiff_node_agent::config::Config;
use skiff_node_agent::metrics::ClientMetrics;
use skiff_node_agent::state::{
    self, AllocBucket, AllocBucketMut, AllocRecord, ImmutableRecord, MutableRecord,
    SqliteStateStore, StateError, StateStore, ALLOC_DIR_KEY, ALLOC_KEY, IMMUTABLE_KEY, MUTABLE_KEY,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Harness
// =============================================================================

/// State store wrapper counting writes per record key.
struct SpyStore {
    inner: SqliteStateStore,
    writes: Mutex<HashMap<String, usize>>,
}

impl SpyStore {
    fn new() -> Self {
        Self {
            inner: SqliteStateStore::open_in_memory().unwrap(),
            writes: Mutex::new(HashMap::new()),
        }
    }

    fn write_count(&self, key: &str) -> usize {
        self.writes.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

struct SpyBucket<'a> {
    inner: &'a mut dyn AllocBucketMut,
    writes: &'a Mutex<HashMap<String, usize>>,
}

impl AllocBucket for SpyBucket<'_> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        self.inner.get(key)
    }
}

impl AllocBucketMut for SpyBucket<'_> {
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StateError> {
        *self
            .writes
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default() += 1;
        self.inner.put(key, value)
    }

    fn on_commit(&mut self, callback: Box<dyn FnOnce() + Send>) {
        self.inner.on_commit(callback)
    }
}

impl StateStore for SpyStore {
    fn view(
        &self,
        alloc_id: &AllocId,
        f: &mut dyn FnMut(&dyn AllocBucket) -> Result<(), StateError>,
    ) -> Result<(), StateError> {
        self.inner.view(alloc_id, f)
    }

    fn update(
        &self,
        alloc_id: &AllocId,
        f: &mut dyn FnMut(&mut dyn AllocBucketMut) -> Result<(), StateError>,
    ) -> Result<(), StateError> {
        self.inner.update(alloc_id, &mut |bucket| {
            let mut spy = SpyBucket {
                inner: bucket,
                writes: &self.writes,
            };
            f(&mut spy)
        })
    }

    fn delete_bucket(&self, alloc_id: &AllocId) -> Result<(), StateError> {
        self.inner.delete_bucket(alloc_id)
    }

    fn list_allocs(&self) -> Result<Vec<AllocId>, StateError> {
        self.inner.list_allocs()
    }
}

/// Prev-alloc watcher whose migration always fails.
struct FailingMigration;

#[async_trait::async_trait]
impl PrevAllocWatcher for FailingMigration {
    async fn wait(&self, _cancel: &CancellationToken) -> Result<(), PrevAllocError> {
        Ok(())
    }

    fn migrate(
        &self,
        _cancel: &CancellationToken,
        _dest: &AllocDir,
    ) -> Result<(), PrevAllocError> {
        Err(PrevAllocError::Migrate(AllocDirError::Io {
            action: "move",
            path: "/nonexistent/data".into(),
            source: std::io::Error::other("disk gone"),
        }))
    }

    fn is_waiting(&self) -> bool {
        false
    }

    fn is_migrating(&self) -> bool {
        false
    }
}

struct Harness {
    runner: Arc<AllocRunner>,
    factory: Arc<MockTaskRunnerFactory>,
    store: Arc<SpyStore>,
    updates: Arc<Mutex<Vec<Allocation>>>,
    _tmp: TempDir,
}

fn test_alloc(tasks: &[(&str, bool)]) -> Allocation {
    Allocation {
        id: AllocId::new(),
        node_id: NodeId::new(),
        job: Arc::new(Job {
            id: JobId::new(),
            name: "web".to_string(),
            task_groups: vec![TaskGroup {
                name: "g1".to_string(),
                tasks: tasks
                    .iter()
                    .map(|(name, leader)| Task {
                        name: name.to_string(),
                        leader: *leader,
                    })
                    .collect(),
            }],
        }),
        task_group: "g1".to_string(),
        eval_id: EvalId::new(),
        deployment_id: None,
        alloc_modify_index: 1,
        desired_status: DesiredStatus::Run,
        client_status: ClientStatus::Pending,
        client_description: String::new(),
        task_states: BTreeMap::new(),
        deployment_status: None,
    }
}

fn harness_with(alloc: Allocation, prev_alloc: Arc<dyn PrevAllocWatcher>) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let config = Arc::new(Config {
        node_id: NodeId::new(),
        control_plane_url: "http://127.0.0.1:8080".to_string(),
        data_dir: tmp.path().to_path_buf(),
        alloc_root: tmp.path().join("allocs"),
        state_path: tmp.path().join("state.db"),
        device_plugin_addr: None,
        disable_tagged_metrics: false,
        backwards_compatible_metrics: false,
        log_level: "info".to_string(),
        version: "0.1.0-test".to_string(),
    });

    let store = Arc::new(SpyStore::new());
    let factory = Arc::new(MockTaskRunnerFactory::new());
    let updates: Arc<Mutex<Vec<Allocation>>> = Arc::new(Mutex::new(Vec::new()));
    let metrics = Arc::new(ClientMetrics::new(&Registry::new(), false, false).unwrap());

    let updater = {
        let updates = updates.clone();
        Arc::new(move |alloc: Allocation| {
            updates.lock().unwrap().push(alloc);
        })
    };

    let runner = AllocRunner::new(
        AllocRunnerDeps {
            config,
            state_store: store.clone(),
            updater,
            task_runner_factory: factory.clone(),
            prev_alloc,
            metrics,
        },
        alloc,
    );

    Harness {
        runner,
        factory,
        store,
        updates,
        _tmp: tmp,
    }
}

fn harness(alloc: Allocation) -> Harness {
    harness_with(alloc, Arc::new(NoopPrevAlloc))
}

async fn wait_until(what: &str, f: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !f() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn destroy_and_wait(runner: &Arc<AllocRunner>) {
    runner.destroy();
    tokio::time::timeout(Duration::from_secs(5), runner.wait())
        .await
        .expect("runner did not terminate after destroy");
    assert!(runner.is_destroyed());
}

fn read_mutable(store: &SpyStore, alloc_id: &AllocId) -> Option<MutableRecord> {
    let mut record = None;
    store
        .view(alloc_id, &mut |bucket| {
            record = state::get_object(bucket, MUTABLE_KEY)?;
            Ok(())
        })
        .unwrap();
    record
}

// =============================================================================
// End-to-end scenarios
// =============================================================================

#[tokio::test]
async fn s1_leader_death_completes_allocation() {
    let h = harness(test_alloc(&[("t1", true), ("t2", false)]));
    let mut listener = h.runner.listener();
    tokio::spawn(h.runner.clone().run());

    wait_until("task runners created and received", || {
        let created = h.factory.created();
        created.len() == 2 && created.iter().all(|tr| tr.was_received())
    })
    .await;
    let t1 = h.factory.runner("t1").unwrap();
    let t2 = h.factory.runner("t2").unwrap();

    t1.start_running();
    t2.start_running();
    wait_until("allocation running", || {
        h.runner.alloc().client_status == ClientStatus::Running
    })
    .await;

    // Leader exits cleanly; followers must be shut down.
    t1.finish(false);

    wait_until("allocation complete", || {
        h.runner.alloc().client_status == ClientStatus::Complete
    })
    .await;

    let leader_dead: Vec<_> = t2
        .destroy_events()
        .into_iter()
        .filter(|e| e.kind == TaskEventKind::LeaderDead)
        .collect();
    assert_eq!(leader_dead.len(), 1);

    // Every task has a finish time once the allocation is terminal.
    let snapshot = h.runner.alloc();
    for name in ["t1", "t2"] {
        let state = &snapshot.task_states[name];
        assert_eq!(state.state, TaskRunState::Dead);
        assert!(!state.failed);
        assert!(state.finished_at.is_some());
    }

    // The broadcaster's last snapshot is the terminal one.
    destroy_and_wait(&h.runner).await;
    let mut last = None;
    while let Ok(Some(alloc)) =
        tokio::time::timeout(Duration::from_secs(1), listener.recv()).await
    {
        last = Some(alloc);
    }
    let last = last.expect("no snapshot broadcast");
    assert_eq!(last.client_status, ClientStatus::Complete);
}

#[tokio::test]
async fn s2_sibling_failure_cascades() {
    let h = harness(test_alloc(&[("t1", false), ("t2", false)]));
    tokio::spawn(h.runner.clone().run());

    wait_until("task runners created", || h.factory.created().len() == 2).await;
    let t1 = h.factory.runner("t1").unwrap();
    let t2 = h.factory.runner("t2").unwrap();

    t1.start_running();
    t2.start_running();
    wait_until("allocation running", || {
        h.runner.alloc().client_status == ClientStatus::Running
    })
    .await;

    t1.finish(true);

    wait_until("allocation failed", || {
        h.runner.alloc().client_status == ClientStatus::Failed
    })
    .await;

    // Exactly one sibling-failed destroy, carrying the dead task's name.
    let sibling_failed: Vec<_> = t2
        .destroy_events()
        .into_iter()
        .filter(|e| e.kind == TaskEventKind::SiblingFailed)
        .collect();
    assert_eq!(sibling_failed.len(), 1);
    assert_eq!(sibling_failed[0].failed_sibling.as_deref(), Some("t1"));

    // The task that failed is never cascade-destroyed itself.
    assert!(t1.destroy_events().is_empty());

    destroy_and_wait(&h.runner).await;
}

#[tokio::test]
async fn s3_terminal_allocation_on_start() {
    let mut alloc = test_alloc(&[("t1", true), ("t2", false)]);
    alloc.desired_status = DesiredStatus::Stop;
    let alloc_id = alloc.id;

    let h = harness(alloc);
    tokio::spawn(h.runner.clone().run());

    // The runner settles into waiting for destroy with no tasks started.
    wait_until("explicit complete status persisted", || {
        read_mutable(&h.store, &alloc_id)
            .is_some_and(|m| m.client_status == Some(ClientStatus::Complete))
    })
    .await;
    assert!(h.factory.created().is_empty());
    assert!(!h.runner.is_destroyed());

    // The upstream updater saw the terminal snapshot.
    wait_until("updater called", || {
        h.updates
            .lock()
            .unwrap()
            .iter()
            .any(|a| a.client_status == ClientStatus::Complete)
    })
    .await;

    destroy_and_wait(&h.runner).await;
    assert!(h.store.list_allocs().unwrap().is_empty());
}

#[tokio::test]
async fn s4_restore_after_crash() {
    let alloc = test_alloc(&[("t1", false), ("t2", false)]);
    let alloc_id = alloc.id;

    let h = harness(alloc.clone());
    h.factory.set_restore_reason("t2", "agent upgraded");

    // Seed the store as a crashed agent would have left it: t1 dead and
    // failed, t2 running.
    let mut task_states: BTreeMap<String, TaskState> = BTreeMap::new();
    task_states.insert(
        "t1".to_string(),
        TaskState {
            state: TaskRunState::Dead,
            failed: true,
            finished_at: Some(chrono::Utc::now()),
            ..Default::default()
        },
    );
    task_states.insert(
        "t2".to_string(),
        TaskState {
            state: TaskRunState::Running,
            started_at: Some(chrono::Utc::now()),
            ..Default::default()
        },
    );

    let tmp_root = h._tmp.path().join("allocs");
    let mut dir = AllocDir::new(&tmp_root, &alloc_id);
    dir.build().unwrap();

    let mut stored = alloc.clone();
    stored.client_status = ClientStatus::Running;
    h.store
        .update(&alloc_id, &mut |bucket| {
            state::put_object(bucket, ALLOC_KEY, &AllocRecord {
                alloc: stored.clone(),
            })?;
            state::put_object(bucket, IMMUTABLE_KEY, &ImmutableRecord {
                agent_version: "0.0.9".to_string(),
            })?;
            state::put_object(bucket, MUTABLE_KEY, &MutableRecord {
                client_status: None,
                client_description: String::new(),
                task_states: task_states.clone(),
                deployment_status: None,
            })?;
            state::put_object(bucket, ALLOC_DIR_KEY, &dir)?;
            Ok(())
        })
        .unwrap();

    h.runner.restore_state().unwrap();

    // No runner for the dead task, one restored runner for the live one.
    assert!(h.factory.runner("t1").is_none());
    let t2 = h.factory.runner("t2").expect("t2 was not restored");

    // The restore reason triggered a non-failure upgrade restart.
    wait_until("upgrade restart requested", || {
        t2.restarts()
            .iter()
            .any(|r| r.reason == "upgrade" && r.description == "agent upgraded" && !r.fail)
    })
    .await;

    // The failure persisted in t1 dominates the derived status.
    assert_eq!(h.runner.alloc().client_status, ClientStatus::Failed);

    tokio::spawn(h.runner.clone().run());
    destroy_and_wait(&h.runner).await;
}

#[tokio::test]
async fn s5_deployment_change_resets_health() {
    let mut alloc = test_alloc(&[("t1", false)]);
    alloc.deployment_id = Some(DeployId::new());

    let h = harness(alloc.clone());
    tokio::spawn(h.runner.clone().run());

    wait_until("task runner created", || h.factory.created().len() == 1).await;
    h.factory.runner("t1").unwrap().start_running();

    // A health watcher decision shows up in snapshots.
    h.runner.set_health(true);
    wait_until("health overlay applied", || {
        h.runner
            .alloc()
            .deployment_status
            .is_some_and(|s| s.healthy == Some(true))
    })
    .await;

    // A new deployment wipes the old decision.
    let mut update = alloc.clone();
    update.eval_id = EvalId::new();
    update.deployment_id = Some(DeployId::new());
    update.alloc_modify_index = 2;
    h.runner.update(update);

    wait_until("health cleared", || {
        h.runner
            .alloc()
            .deployment_status
            .map_or(true, |s| s.healthy.is_none())
    })
    .await;

    destroy_and_wait(&h.runner).await;
}

#[tokio::test]
async fn s6_migration_failure_is_soft() {
    let alloc = test_alloc(&[("t1", true), ("t2", false)]);
    let h = harness_with(alloc, Arc::new(FailingMigration));
    tokio::spawn(h.runner.clone().run());

    // Despite the failed migration the directory is rebuilt and the task
    // runners start normally.
    wait_until("task runners created", || h.factory.created().len() == 2).await;
    assert_ne!(h.runner.alloc().client_status, ClientStatus::Failed);

    destroy_and_wait(&h.runner).await;
}

// =============================================================================
// Invariants
// =============================================================================

#[tokio::test]
async fn missing_task_group_fails_allocation() {
    let mut alloc = test_alloc(&[("t1", false)]);
    alloc.task_group = "nope".to_string();

    let h = harness(alloc);
    tokio::spawn(h.runner.clone().run());

    wait_until("failed status", || {
        let snapshot = h.runner.alloc();
        snapshot.client_status == ClientStatus::Failed
            && snapshot.client_description == "missing task group 'nope'"
    })
    .await;
    assert!(h.factory.created().is_empty());
}

#[tokio::test]
async fn eval_gating_and_once_only_records() {
    let alloc = test_alloc(&[("t1", false)]);
    let alloc_id = alloc.id;

    let h = harness(alloc.clone());
    tokio::spawn(h.runner.clone().run());

    wait_until("task runner created", || h.factory.created().len() == 1).await;
    let t1 = h.factory.runner("t1").unwrap();

    t1.start_running();
    wait_until("first sync", || h.store.write_count(MUTABLE_KEY) >= 1).await;

    // More transitions against the same evaluation.
    t1.report_restart("oom");
    wait_until("more syncs", || h.store.write_count(MUTABLE_KEY) >= 2).await;

    assert_eq!(h.store.write_count(ALLOC_KEY), 1);
    assert_eq!(h.store.write_count(IMMUTABLE_KEY), 1);
    assert_eq!(h.store.write_count(ALLOC_DIR_KEY), 1);

    // A new evaluation rewrites the alloc record, and only it, once more.
    let mut update = alloc.clone();
    update.eval_id = EvalId::new();
    update.alloc_modify_index = 2;
    h.runner.update(update);

    wait_until("alloc record rewritten", || {
        h.store.write_count(ALLOC_KEY) == 2
    })
    .await;
    assert_eq!(h.store.write_count(IMMUTABLE_KEY), 1);
    assert_eq!(h.store.write_count(ALLOC_DIR_KEY), 1);

    // Restart accounting made it into the persisted task state.
    let mutable = read_mutable(&h.store, &alloc_id).unwrap();
    let t1_state = &mutable.task_states["t1"];
    assert_eq!(t1_state.restarts, 1);
    assert!(t1_state.last_restart.is_some());

    destroy_and_wait(&h.runner).await;
}

#[tokio::test]
async fn dead_task_never_resurrects() {
    let h = harness(test_alloc(&[("t1", false)]));
    tokio::spawn(h.runner.clone().run());

    wait_until("task runner created", || h.factory.created().len() == 1).await;
    let t1 = h.factory.runner("t1").unwrap();

    t1.start_running();
    t1.finish(false);
    wait_until("allocation complete", || {
        h.runner.alloc().client_status == ClientStatus::Complete
    })
    .await;

    // A stale running report after death changes nothing.
    t1.start_running();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = h.runner.alloc();
    assert_eq!(snapshot.task_states["t1"].state, TaskRunState::Dead);
    assert_eq!(snapshot.client_status, ClientStatus::Complete);

    destroy_and_wait(&h.runner).await;
}

#[tokio::test]
async fn destruction_destroys_leader_first() {
    let h = harness(test_alloc(&[("t1", true), ("t2", false)]));
    tokio::spawn(h.runner.clone().run());

    wait_until("task runners created", || h.factory.created().len() == 2).await;
    h.factory.runner("t1").unwrap().start_running();
    h.factory.runner("t2").unwrap().start_running();
    wait_until("allocation running", || {
        h.runner.alloc().client_status == ClientStatus::Running
    })
    .await;

    destroy_and_wait(&h.runner).await;

    let log = h.factory.call_log();
    let position = |entry: &str| {
        log.iter()
            .position(|l| l == entry)
            .unwrap_or_else(|| panic!("missing '{entry}' in {log:?}"))
    };
    // The destroy sequence (Killed) reaches the leader first, waits for it
    // to fully stop, and only then reaches the followers. The leader-dead
    // cascade may independently destroy followers with LeaderDead; that is
    // not the sequence under test.
    assert!(position("destroy:t1:Killed") < position("stopped:t1"));
    assert!(position("stopped:t1") < position("destroy:t2:Killed"));
}

#[tokio::test]
async fn destroy_closes_wait_channel_quickly() {
    let h = harness(test_alloc(&[("t1", false), ("t2", false)]));
    tokio::spawn(h.runner.clone().run());

    wait_until("task runners created", || h.factory.created().len() == 2).await;
    destroy_and_wait(&h.runner).await;
}

#[tokio::test]
async fn updates_are_forwarded_to_task_runners() {
    let alloc = test_alloc(&[("t1", false)]);
    let h = harness(alloc.clone());
    tokio::spawn(h.runner.clone().run());

    wait_until("task runner created", || h.factory.created().len() == 1).await;
    let t1 = h.factory.runner("t1").unwrap();

    assert!(h.runner.should_update(2));
    let mut update = alloc.clone();
    update.eval_id = EvalId::new();
    update.alloc_modify_index = 2;
    h.runner.update(update);

    wait_until("update forwarded", || !t1.updates().is_empty()).await;
    assert_eq!(t1.updates()[0].alloc_modify_index, 2);
    assert!(!h.runner.should_update(2));

    destroy_and_wait(&h.runner).await;
}

#[tokio::test]
async fn terminal_update_kills_tasks() {
    let alloc = test_alloc(&[("t1", false)]);
    let h = harness(alloc.clone());
    tokio::spawn(h.runner.clone().run());

    wait_until("task runner created", || h.factory.created().len() == 1).await;
    let t1 = h.factory.runner("t1").unwrap();
    t1.start_running();

    let mut update = alloc.clone();
    update.eval_id = EvalId::new();
    update.alloc_modify_index = 2;
    update.desired_status = DesiredStatus::Stop;
    h.runner.update(update);

    wait_until("task killed", || {
        t1.destroy_events()
            .iter()
            .any(|e| e.kind == TaskEventKind::Killed)
    })
    .await;

    destroy_and_wait(&h.runner).await;
}

#[tokio::test]
async fn latest_alloc_stats_aggregates_tasks() {
    let h = harness(test_alloc(&[("t1", false), ("t2", false)]));
    tokio::spawn(h.runner.clone().run());

    wait_until("task runners created", || h.factory.created().len() == 2).await;
    let now = chrono::Utc::now();
    h.factory
        .runner("t1")
        .unwrap()
        .set_resource_usage(TaskResourceUsage {
            usage: ResourceUsage {
                memory_rss_bytes: 100,
                cpu_percent: 1.0,
            },
            timestamp: now,
        });
    h.factory
        .runner("t2")
        .unwrap()
        .set_resource_usage(TaskResourceUsage {
            usage: ResourceUsage {
                memory_rss_bytes: 50,
                cpu_percent: 0.5,
            },
            timestamp: now + chrono::Duration::seconds(1),
        });

    let stats = h.runner.latest_alloc_stats(None).unwrap();
    assert_eq!(stats.usage.memory_rss_bytes, 150);
    assert_eq!(stats.timestamp, Some(now + chrono::Duration::seconds(1)));

    let filtered = h.runner.latest_alloc_stats(Some("t1")).unwrap();
    assert_eq!(filtered.usage.memory_rss_bytes, 100);

    assert!(h.runner.latest_alloc_stats(Some("missing")).is_err());

    destroy_and_wait(&h.runner).await;
}

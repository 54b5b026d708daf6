//! Tests for the reconciler state machine.
//!
//! Drives the reconciler against a scripted in-memory runtime and checks
//! the phase trace, the calls issued, and the failures recorded.

use async_trait::async_trait;
use chrono::Utc;
use redeploy::{
    Action, ContainerRequest, ContainerRuntime, ContainerSpec, ContainerStatus, Error, HostFs,
    Phase, ReconcileResult, Reconciler, ReconcilerConfig, RuntimeContainer,
};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Fakes
// =============================================================================

#[derive(Default)]
struct FakeRuntime {
    running: Vec<RuntimeContainer>,
    daemon_down: bool,
    stop_failures: HashSet<String>,
    prune_fails: bool,
    /// Errors returned by successive pulls; once drained, pulls succeed.
    pull_errors: Mutex<VecDeque<Error>>,
    run_error: Mutex<Option<Error>>,
    /// Cancelled from inside the first stop or pull call.
    cancel_on_stop: Option<CancellationToken>,
    cancel_on_pull: Option<CancellationToken>,
    calls: Mutex<Vec<String>>,
}

impl FakeRuntime {
    fn with_running(ids: &[&str]) -> Self {
        Self {
            running: ids.iter().map(|id| container(id)).collect(),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn list_running(&self, image: &str) -> redeploy::Result<Vec<RuntimeContainer>> {
        self.log(format!("list:{}", image));
        if self.daemon_down {
            return Err(Error::RuntimeUnavailable {
                reason: "connection refused".to_string(),
            });
        }
        Ok(self.running.clone())
    }

    async fn stop(&self, id: &str) -> redeploy::Result<()> {
        self.log(format!("stop:{}", id));
        if let Some(token) = &self.cancel_on_stop {
            token.cancel();
        }
        if self.stop_failures.contains(id) {
            return Err(Error::StopFailed {
                id: id.to_string(),
                reason: "container is stuck".to_string(),
            });
        }
        Ok(())
    }

    async fn prune_stopped(&self) -> redeploy::Result<Vec<String>> {
        self.log("prune".to_string());
        if self.prune_fails {
            return Err(Error::PruneFailed {
                reason: "a prune operation is already running".to_string(),
            });
        }
        Ok(self.running.iter().map(|c| c.id.clone()).collect())
    }

    async fn pull_image(&self, image: &str) -> redeploy::Result<()> {
        self.log(format!("pull:{}", image));
        if let Some(token) = &self.cancel_on_pull {
            token.cancel();
        }
        match self.pull_errors.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run(&self, spec: &ContainerSpec) -> redeploy::Result<String> {
        self.log(format!("run:{}", spec.image));
        match self.run_error.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok("4f1c0a7e9b2d4c8e9f0a1b2c3d4e5f60".to_string()),
        }
    }
}

struct FakeFs {
    dirs: HashSet<PathBuf>,
}

impl HostFs for FakeFs {
    fn is_dir(&self, path: &Path) -> bool {
        self.dirs.contains(path)
    }
}

fn container(id: &str) -> RuntimeContainer {
    RuntimeContainer {
        id: id.to_string(),
        image: "nginx".to_string(),
        status: ContainerStatus::Running,
        created_at: Utc::now(),
    }
}

fn transient() -> Error {
    Error::TransientTransport {
        operation: "pull nginx".to_string(),
        reason: "connection reset by peer".to_string(),
    }
}

fn fast_config() -> ReconcilerConfig {
    ReconcilerConfig {
        pull_attempts: 3,
        pull_backoff: Duration::from_millis(1),
        pull_backoff_max: Duration::from_millis(2),
        ..Default::default()
    }
}

fn nginx_spec() -> ContainerSpec {
    ContainerRequest {
        image: "nginx".to_string(),
        ports: vec!["8080:80".to_string()],
        ..Default::default()
    }
    .normalize()
    .unwrap()
}

async fn reconcile(runtime: &Arc<FakeRuntime>, spec: &ContainerSpec) -> ReconcileResult {
    Reconciler::new(runtime.clone(), fast_config())
        .reconcile(spec)
        .await
}

// =============================================================================
// Happy Paths
// =============================================================================

#[tokio::test]
async fn test_fresh_start_pulls_and_runs_once() {
    let runtime = Arc::new(FakeRuntime::default());
    let result = reconcile(&runtime, &nginx_spec()).await;

    assert_eq!(result.phase, Phase::Done);
    assert_eq!(result.action, Action::Ran);
    assert!(!result.container_id.as_deref().unwrap_or("").is_empty());
    assert!(result.errors.is_empty());

    assert_eq!(runtime.count("pull:"), 1);
    assert_eq!(runtime.count("run:"), 1);
    assert_eq!(runtime.count("stop:"), 0);
    assert_eq!(runtime.count("prune"), 0);
}

#[tokio::test]
async fn test_nothing_running_skips_draining() {
    let runtime = Arc::new(FakeRuntime::default());
    let result = reconcile(&runtime, &nginx_spec()).await;

    assert_eq!(
        result.trace,
        vec![
            Phase::Idle,
            Phase::Inspecting,
            Phase::Pulling,
            Phase::Starting,
            Phase::Done
        ]
    );
    assert!(!result.visited(Phase::Draining));
}

#[tokio::test]
async fn test_replaces_running_containers_in_order() {
    let runtime = Arc::new(FakeRuntime::with_running(&["aaa", "bbb"]));
    let result = reconcile(&runtime, &nginx_spec()).await;

    assert!(result.is_done());
    assert_eq!(result.action, Action::Replaced);
    assert_eq!(result.stopped, vec!["aaa", "bbb"]);
    assert_eq!(
        runtime.calls(),
        vec![
            "list:nginx",
            "stop:aaa",
            "stop:bbb",
            "prune",
            "pull:nginx",
            "run:nginx"
        ]
    );
}

// =============================================================================
// Draining
// =============================================================================

#[tokio::test]
async fn test_partial_drain_failure_continues() {
    let mut fake = FakeRuntime::with_running(&["aaa", "bbb", "ccc"]);
    fake.stop_failures.insert("bbb".to_string());
    let runtime = Arc::new(fake);

    let result = reconcile(&runtime, &nginx_spec()).await;

    assert!(result.is_done());
    assert_eq!(result.stopped, vec!["aaa", "ccc"]);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].phase, Phase::Draining);
    assert_eq!(result.errors[0].container.as_deref(), Some("bbb"));
    assert!(matches!(result.errors[0].error, Error::StopFailed { .. }));
    assert_eq!(runtime.count("pull:"), 1);
}

#[tokio::test]
async fn test_all_stops_failing_is_drain_failed() {
    let mut fake = FakeRuntime::with_running(&["aaa", "bbb"]);
    fake.stop_failures.insert("aaa".to_string());
    fake.stop_failures.insert("bbb".to_string());
    let runtime = Arc::new(fake);

    let result = reconcile(&runtime, &nginx_spec()).await;

    assert_eq!(result.phase, Phase::Failed);
    assert_eq!(result.action, Action::None);
    assert!(matches!(
        result.fatal_error(),
        Some(Error::DrainFailed { attempted: 2 })
    ));
    // Both stop failures are kept ahead of the fatal error.
    assert_eq!(result.errors.len(), 3);
    assert_eq!(runtime.count("stop:"), 2);
    assert_eq!(runtime.count("prune"), 0);
    assert_eq!(runtime.count("pull:"), 0);
    assert_eq!(runtime.count("run:"), 0);
}

#[tokio::test]
async fn test_prune_failure_is_recorded_but_not_fatal() {
    let mut fake = FakeRuntime::with_running(&["aaa"]);
    fake.prune_fails = true;
    let runtime = Arc::new(fake);

    let result = reconcile(&runtime, &nginx_spec()).await;

    assert!(result.is_done());
    assert_eq!(result.errors.len(), 1);
    assert!(matches!(result.errors[0].error, Error::PruneFailed { .. }));
    assert!(result.fatal_error().is_none());
}

// =============================================================================
// Inspecting
// =============================================================================

#[tokio::test]
async fn test_daemon_unavailable_fails_without_retry() {
    let runtime = Arc::new(FakeRuntime {
        daemon_down: true,
        ..Default::default()
    });

    let result = reconcile(&runtime, &nginx_spec()).await;

    assert_eq!(result.phase, Phase::Failed);
    assert!(matches!(
        result.fatal_error(),
        Some(Error::RuntimeUnavailable { .. })
    ));
    assert_eq!(runtime.calls(), vec!["list:nginx"]);
}

// =============================================================================
// Pulling
// =============================================================================

#[tokio::test]
async fn test_transient_pull_errors_are_retried() {
    let fake = FakeRuntime::default();
    fake.pull_errors
        .lock()
        .unwrap()
        .extend([transient(), transient()]);
    let runtime = Arc::new(fake);

    let result = reconcile(&runtime, &nginx_spec()).await;

    assert!(result.is_done());
    assert_eq!(runtime.count("pull:"), 3);
    assert_eq!(result.errors.len(), 2);
    assert!(result.errors.iter().all(|f| f.phase == Phase::Pulling));
}

#[tokio::test]
async fn test_pull_retries_are_bounded() {
    let fake = FakeRuntime::default();
    fake.pull_errors
        .lock()
        .unwrap()
        .extend([transient(), transient(), transient(), transient()]);
    let runtime = Arc::new(fake);

    let result = reconcile(&runtime, &nginx_spec()).await;

    assert_eq!(result.phase, Phase::Failed);
    assert_eq!(runtime.count("pull:"), 3);
    assert!(matches!(
        result.fatal_error(),
        Some(Error::TransientTransport { .. })
    ));
    assert_eq!(runtime.count("run:"), 0);
}

#[tokio::test]
async fn test_image_not_found_is_not_retried() {
    let fake = FakeRuntime::default();
    fake.pull_errors.lock().unwrap().push_back(Error::ImageNotFound {
        reference: "nginx".to_string(),
    });
    let runtime = Arc::new(fake);

    let result = reconcile(&runtime, &nginx_spec()).await;

    assert_eq!(result.phase, Phase::Failed);
    assert!(matches!(
        result.fatal_error(),
        Some(Error::ImageNotFound { .. })
    ));
    assert_eq!(runtime.count("pull:"), 1);
    assert_eq!(runtime.count("run:"), 0);
}

// =============================================================================
// Starting
// =============================================================================

#[tokio::test]
async fn test_missing_volume_fails_before_run() {
    let runtime = Arc::new(FakeRuntime::default());
    let spec = ContainerRequest {
        image: "nginx".to_string(),
        volumes: vec![
            "/srv/present:/data".to_string(),
            "/srv/missing:/cache".to_string(),
        ],
        clean_volumes: true,
        ..Default::default()
    }
    .normalize()
    .unwrap();
    let fs = Arc::new(FakeFs {
        dirs: HashSet::from([PathBuf::from("/srv/present")]),
    });

    let result = Reconciler::new(runtime.clone(), fast_config())
        .with_host_fs(fs)
        .reconcile(&spec)
        .await;

    assert_eq!(result.phase, Phase::Failed);
    match result.fatal_error() {
        Some(Error::VolumeMissing { path }) => assert_eq!(path, Path::new("/srv/missing")),
        other => panic!("expected VolumeMissing, got {:?}", other),
    }
    assert_eq!(runtime.count("run:"), 0);
}

#[tokio::test]
async fn test_volumes_unchecked_without_clean_volumes() {
    let runtime = Arc::new(FakeRuntime::default());
    let spec = ContainerRequest {
        image: "nginx".to_string(),
        volumes: vec!["/srv/missing:/cache".to_string()],
        ..Default::default()
    }
    .normalize()
    .unwrap();
    let fs = Arc::new(FakeFs {
        dirs: HashSet::new(),
    });

    let result = Reconciler::new(runtime.clone(), fast_config())
        .with_host_fs(fs)
        .reconcile(&spec)
        .await;

    assert!(result.is_done());
    assert_eq!(runtime.count("run:"), 1);
}

#[tokio::test]
async fn test_clean_volumes_with_real_directory() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    let spec = ContainerRequest {
        image: "nginx".to_string(),
        volumes: vec![format!("{}:/data:ro", dir.path().display())],
        clean_volumes: true,
        ..Default::default()
    }
    .normalize()
    .unwrap();

    let result = reconcile(&runtime, &spec).await;
    assert!(result.is_done());
}

#[tokio::test]
async fn test_port_conflict_fails_fast() {
    let fake = FakeRuntime::default();
    *fake.run_error.lock().unwrap() = Some(Error::PortConflict {
        reason: "Bind for 0.0.0.0:8080 failed: port is already allocated".to_string(),
    });
    let runtime = Arc::new(fake);

    let result = reconcile(&runtime, &nginx_spec()).await;

    assert_eq!(result.phase, Phase::Failed);
    assert!(matches!(
        result.fatal_error(),
        Some(Error::PortConflict { .. })
    ));
    assert_eq!(runtime.count("run:"), 1);
    assert!(result.container_id.is_none());
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancelled_before_start_issues_no_calls() {
    let runtime = Arc::new(FakeRuntime::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = Reconciler::new(runtime.clone(), fast_config())
        .reconcile_with_cancel(&nginx_spec(), &cancel)
        .await;

    assert_eq!(result.phase, Phase::Failed);
    assert!(matches!(
        result.fatal_error(),
        Some(Error::Cancelled { .. })
    ));
    assert!(runtime.calls().is_empty());
}

#[tokio::test]
async fn test_cancel_during_drain_lets_stop_finish() {
    let cancel = CancellationToken::new();
    let mut fake = FakeRuntime::with_running(&["aaa", "bbb"]);
    fake.cancel_on_stop = Some(cancel.clone());
    let runtime = Arc::new(fake);

    let result = Reconciler::new(runtime.clone(), fast_config())
        .reconcile_with_cancel(&nginx_spec(), &cancel)
        .await;

    assert_eq!(result.phase, Phase::Failed);
    assert_eq!(result.stopped, vec!["aaa"]);
    assert_eq!(runtime.calls(), vec!["list:nginx", "stop:aaa"]);
}

#[tokio::test]
async fn test_cancel_during_pull_backoff() {
    let cancel = CancellationToken::new();
    let fake = FakeRuntime {
        cancel_on_pull: Some(cancel.clone()),
        ..Default::default()
    };
    fake.pull_errors.lock().unwrap().push_back(transient());
    let runtime = Arc::new(fake);

    let config = ReconcilerConfig {
        pull_backoff: Duration::from_secs(60),
        pull_backoff_max: Duration::from_secs(60),
        ..fast_config()
    };
    let result = Reconciler::new(runtime.clone(), config)
        .reconcile_with_cancel(&nginx_spec(), &cancel)
        .await;

    assert_eq!(result.phase, Phase::Failed);
    assert!(matches!(
        result.fatal_error(),
        Some(Error::Cancelled { .. })
    ));
    assert_eq!(runtime.count("pull:"), 1);
    assert_eq!(runtime.count("run:"), 0);
}

// =============================================================================
// Timeouts
// =============================================================================

/// Runtime call that never completes.
#[derive(Clone, Copy, PartialEq)]
enum Hang {
    Stop(&'static str),
    Pull,
    Run,
}

struct HangingRuntime {
    hang: Hang,
    running: Vec<RuntimeContainer>,
    runs: Mutex<usize>,
}

impl HangingRuntime {
    fn new(hang: Hang, running: &[&str]) -> Self {
        Self {
            hang,
            running: running.iter().map(|id| container(id)).collect(),
            runs: Mutex::new(0),
        }
    }
}

#[async_trait]
impl ContainerRuntime for HangingRuntime {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn list_running(&self, _image: &str) -> redeploy::Result<Vec<RuntimeContainer>> {
        Ok(self.running.clone())
    }

    async fn stop(&self, id: &str) -> redeploy::Result<()> {
        if matches!(self.hang, Hang::Stop(target) if target == id) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn prune_stopped(&self) -> redeploy::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn pull_image(&self, _image: &str) -> redeploy::Result<()> {
        if self.hang == Hang::Pull {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn run(&self, _spec: &ContainerSpec) -> redeploy::Result<String> {
        *self.runs.lock().unwrap() += 1;
        if self.hang == Hang::Run {
            std::future::pending::<()>().await;
        }
        Ok("4f1c0a7e9b2d".to_string())
    }
}

fn short_timeouts() -> ReconcilerConfig {
    ReconcilerConfig {
        pull_attempts: 2,
        pull_timeout: Duration::from_millis(10),
        call_timeout: Duration::from_millis(10),
        ..fast_config()
    }
}

#[tokio::test]
async fn test_pull_timeout_is_retried_then_fails() {
    let result = Reconciler::new(Arc::new(HangingRuntime::new(Hang::Pull, &[])), short_timeouts())
        .reconcile(&nginx_spec())
        .await;

    assert_eq!(result.phase, Phase::Failed);
    assert_eq!(result.errors.len(), 2);
    assert!(result
        .errors
        .iter()
        .all(|f| matches!(f.error, Error::Timeout { .. })));
}

#[tokio::test]
async fn test_hanging_stop_is_recorded_as_stop_failure() {
    let runtime = Arc::new(HangingRuntime::new(Hang::Stop("aaa"), &["aaa", "bbb"]));

    let result = Reconciler::new(runtime.clone(), short_timeouts())
        .reconcile(&nginx_spec())
        .await;

    assert!(result.is_done());
    assert_eq!(result.stopped, vec!["bbb"]);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].phase, Phase::Draining);
    assert_eq!(result.errors[0].container.as_deref(), Some("aaa"));
    match &result.errors[0].error {
        Error::StopFailed { id, reason } => {
            assert_eq!(id, "aaa");
            assert!(reason.contains("timed out"), "reason: {}", reason);
        }
        other => panic!("expected StopFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_only_stop_hanging_is_drain_failed() {
    let runtime = Arc::new(HangingRuntime::new(Hang::Stop("aaa"), &["aaa"]));

    let result = Reconciler::new(runtime.clone(), short_timeouts())
        .reconcile(&nginx_spec())
        .await;

    assert_eq!(result.phase, Phase::Failed);
    assert!(matches!(
        result.fatal_error(),
        Some(Error::DrainFailed { attempted: 1 })
    ));
    assert_eq!(*runtime.runs.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_hanging_run_fails_without_retry() {
    let runtime = Arc::new(HangingRuntime::new(Hang::Run, &[]));

    let result = Reconciler::new(runtime.clone(), short_timeouts())
        .reconcile(&nginx_spec())
        .await;

    assert_eq!(result.phase, Phase::Failed);
    assert!(matches!(result.fatal_error(), Some(Error::Timeout { .. })));
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].phase, Phase::Starting);
    assert_eq!(*runtime.runs.lock().unwrap(), 1);
    assert!(result.container_id.is_none());
}

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::time::Instant;

use taskdock::config::{Paths, Settings};
use taskdock::guardian::{self, GuardianState};
use taskdock::registry::{LogBuffer, Registry};
use taskdock::store::TaskStore;
use taskdock::supervisor::{
    FailureKind, RestartRequest, StartRequest, StartSource, StopOutcome, StopRequest,
    Supervisor,
};

struct TestEnv {
    _tmp: TempDir,
    settings: Settings,
    store: Arc<TaskStore>,
    registry: Arc<Registry>,
    guardian: Arc<GuardianState>,
    supervisor: Arc<Supervisor>,
}

impl TestEnv {
    fn new() -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let paths = Paths::detect(Some(tmp.path().to_path_buf())).expect("paths");
        paths.ensure_dirs().expect("dirs");
        fs::write(
            paths.config_path(),
            "[supervisor]\nstartup_timeout_ms = 300\nlogin_shell = false\n",
        )
        .expect("config");
        let settings = Settings::load(paths, None, false).expect("settings");
        let store = Arc::new(TaskStore::open(&settings.paths).expect("store"));
        let registry = Arc::new(Registry::new());
        let guardian = Arc::new(GuardianState::new());
        let supervisor = Arc::new(Supervisor::new(
            settings.clone(),
            store.clone(),
            registry.clone(),
            guardian.clone(),
        ));
        Self {
            _tmp: tmp,
            settings,
            store,
            registry,
            guardian,
            supervisor,
        }
    }

    fn start_req(&self, id: &str, command: &str, window_ms: u64) -> StartRequest {
        StartRequest {
            id: id.to_string(),
            start_command: command.to_string(),
            startup_timeout_ms: Some(window_ms),
            ..Default::default()
        }
    }

    fn stop_req(&self, id: &str) -> StopRequest {
        StopRequest {
            id: id.to_string(),
            ..Default::default()
        }
    }

    fn raw_store_text(&self) -> String {
        fs::read_to_string(self.settings.paths.tasks_path()).unwrap_or_default()
    }

    async fn tick_guardian(&self) {
        guardian::tick_once(&self.supervisor, &self.store, &self.registry, &self.guardian)
            .await;
    }
}

#[test]
fn config_file_overrides_defaults() {
    let env = TestEnv::new();
    assert_eq!(env.settings.startup_timeout_ms, 300);
    assert!(!env.settings.login_shell);
    assert_eq!(env.settings.guardian_tick_secs, 5);
}

#[test]
fn store_create_strips_runtime_keys_and_generates_id() {
    let env = TestEnv::new();
    let task = env
        .store
        .create(json!({
            "name": "web",
            "start_command": "sleep 1",
            "status": "running",
            "runtime_pid": 4242
        }))
        .expect("create");
    assert!(task.id.starts_with("proj_"));
    assert!(!task.created_date.is_empty());

    let raw = env.raw_store_text();
    assert!(!raw.contains("runtime_pid"));
    assert!(!raw.contains("\"status\""));
    assert!(raw.contains("\"web\""));
}

#[test]
fn store_create_returns_existing_task_for_known_id() {
    let env = TestEnv::new();
    env.store
        .create(json!({"id": "t1", "name": "one", "start_command": "true"}))
        .expect("create");
    let second = env
        .store
        .create(json!({"id": "t1", "name": "two"}))
        .expect("create again");
    assert_eq!(second.name, "one");
    assert_eq!(env.store.list().len(), 1);
}

#[test]
fn store_update_merges_patch_and_bumps_updated_date() {
    let env = TestEnv::new();
    let created = env
        .store
        .create(json!({"id": "t1", "name": "one", "start_command": "sleep 1"}))
        .expect("create");

    std::thread::sleep(Duration::from_millis(10));
    let updated = env
        .store
        .update("t1", json!({"notes": "hello", "status": "running"}))
        .expect("update")
        .expect("known id");
    assert_eq!(updated.notes, "hello");
    assert_eq!(updated.name, "one");
    assert!(updated.updated_date > created.updated_date);
    assert!(!env.raw_store_text().contains("\"status\""));

    assert!(env.store.update("nope", json!({})).expect("update").is_none());
}

#[test]
fn store_read_dedupes_by_newest_updated_date() {
    let env = TestEnv::new();
    let raw = json!([
        {"id": "dup", "name": "old", "updated_date": "2024-01-01T00:00:00.000Z"},
        {"id": "dup", "name": "new", "updated_date": "2025-01-01T00:00:00.000Z"},
        {"id": "other", "name": "keep", "updated_date": "2024-06-01T00:00:00.000Z"}
    ]);
    fs::write(
        env.settings.paths.tasks_path(),
        serde_json::to_vec_pretty(&raw).unwrap(),
    )
    .unwrap();

    let tasks = env.store.list();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks.iter().find(|t| t.id == "dup").unwrap().name, "new");

    let report = env.store.dedupe().expect("dedupe");
    assert_eq!(report.removed, 1);
    assert_eq!(report.total, 2);
    assert_eq!(env.store.list().len(), 2);
}

#[test]
fn store_rejects_out_of_range_ports() {
    let env = TestEnv::new();
    assert!(env
        .store
        .create(json!({"id": "p0", "port": 0, "start_command": "true"}))
        .is_err());
    assert!(env
        .store
        .create(json!({"id": "p1", "port": 70000, "start_command": "true"}))
        .is_err());
}

#[test]
fn store_tolerates_a_corrupt_file() {
    let env = TestEnv::new();
    fs::write(env.settings.paths.tasks_path(), b"not json").unwrap();
    assert!(env.store.list().is_empty());
}

#[test]
fn log_buffer_is_bounded_and_evicts_from_head() {
    let mut buf = LogBuffer::new(500);
    for i in 0..600 {
        buf.push(format!("line {i}"));
    }
    let lines = buf.snapshot();
    assert_eq!(lines.len(), 500);
    assert_eq!(lines[0], "line 100");
    assert_eq!(lines[499], "line 599");
}

#[tokio::test]
async fn start_succeeds_when_child_outlives_the_window() {
    let env = TestEnv::new();
    env.store
        .create(json!({"id": "t1", "start_command": "sleep 30"}))
        .expect("create");

    let pid = env
        .supervisor
        .start(env.start_req("t1", "sleep 30", 250), StartSource::User)
        .await
        .expect("start");
    assert!(pid > 0);
    assert!(env.registry.is_running("t1").await);

    let task = env.store.get("t1").expect("task");
    assert!(task.was_running_before_shutdown);
    assert!(!task.manual_stopped);
    assert_eq!(task.restart_count, 0);
    assert!(task.last_started.is_some());

    let outcome = env
        .supervisor
        .stop(env.stop_req("t1"))
        .await
        .expect("stop");
    assert!(matches!(outcome, StopOutcome::Stopped));
    assert!(!env.registry.is_running("t1").await);
    assert!(env.store.get("t1").expect("task").manual_stopped);
}

#[tokio::test]
async fn start_reports_early_exit_with_captured_stderr() {
    let env = TestEnv::new();
    let failure = env
        .supervisor
        .start(
            env.start_req("boom", "echo boom 1>&2; exit 2", 2000),
            StartSource::User,
        )
        .await
        .expect_err("early exit must fail");
    assert_eq!(failure.kind, FailureKind::Runtime);
    assert_eq!(failure.code, Some(2));
    assert!(failure.logs.stderr.iter().any(|l| l.contains("boom")));
    assert!(!env.registry.is_running("boom").await);
}

#[tokio::test]
async fn start_validates_required_fields() {
    let env = TestEnv::new();
    let failure = env
        .supervisor
        .start(env.start_req("", "sleep 1", 100), StartSource::User)
        .await
        .expect_err("missing id");
    assert_eq!(failure.kind, FailureKind::Validation);

    let failure = env
        .supervisor
        .start(env.start_req("t", "", 100), StartSource::User)
        .await
        .expect_err("missing command");
    assert_eq!(failure.kind, FailureKind::Validation);
}

#[tokio::test]
async fn second_start_replaces_the_previous_child() {
    let env = TestEnv::new();
    let pid1 = env
        .supervisor
        .start(env.start_req("t3", "sleep 30", 250), StartSource::User)
        .await
        .expect("first start");
    let pid2 = env
        .supervisor
        .start(env.start_req("t3", "sleep 30", 250), StartSource::User)
        .await
        .expect("second start");
    assert_ne!(pid1, pid2);
    assert_eq!(env.registry.running_pid("t3").await, Some(pid2));

    env.supervisor
        .stop(env.stop_req("t3"))
        .await
        .expect("stop");
}

#[tokio::test]
async fn restart_reuses_the_previous_command() {
    let env = TestEnv::new();
    let pid1 = env
        .supervisor
        .start(env.start_req("t2", "sleep 30", 250), StartSource::User)
        .await
        .expect("start");

    let pid2 = env
        .supervisor
        .restart(RestartRequest {
            id: "t2".to_string(),
            startup_timeout_ms: Some(250),
            ..Default::default()
        })
        .await
        .expect("restart");
    assert_ne!(pid1, pid2);
    assert!(env.registry.is_running("t2").await);

    env.supervisor
        .stop(env.stop_req("t2"))
        .await
        .expect("stop");
}

#[tokio::test]
async fn restart_without_any_known_command_is_a_validation_error() {
    let env = TestEnv::new();
    let failure = env
        .supervisor
        .restart(RestartRequest {
            id: "ghost".to_string(),
            ..Default::default()
        })
        .await
        .expect_err("no command anywhere");
    assert_eq!(failure.kind, FailureKind::Validation);
}

#[tokio::test]
async fn stop_without_a_live_entry_reports_not_running() {
    let env = TestEnv::new();
    let outcome = env
        .supervisor
        .stop(env.stop_req("ghost"))
        .await
        .expect("stop");
    assert!(matches!(outcome, StopOutcome::NotRunning));
}

#[tokio::test]
async fn stop_command_fallback_runs_and_surfaces_failures() {
    let env = TestEnv::new();
    let outcome = env
        .supervisor
        .stop(StopRequest {
            id: "fb".to_string(),
            stop_command: Some("true".to_string()),
            ..Default::default()
        })
        .await
        .expect("clean fallback");
    assert!(matches!(outcome, StopOutcome::StopCommand { .. }));

    let failure = env
        .supervisor
        .stop(StopRequest {
            id: "fb".to_string(),
            stop_command: Some("echo nope 1>&2; exit 3".to_string()),
            ..Default::default()
        })
        .await
        .expect_err("failing fallback");
    assert!(failure.logs.stderr.iter().any(|l| l.contains("nope")));
}

#[tokio::test]
async fn clear_logs_is_idempotent_and_new_output_is_observable() {
    let env = TestEnv::new();
    env.supervisor
        .start(
            env.start_req("chatty", "echo hello; sleep 30", 300),
            StartSource::User,
        )
        .await
        .expect("start");

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let logs = env.supervisor.logs("chatty").await;
        if logs.stdout.iter().any(|l| l == "hello") {
            break;
        }
        assert!(Instant::now() < deadline, "timed out waiting for output");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    env.supervisor.clear_logs("chatty").await;
    let logs = env.supervisor.logs("chatty").await;
    assert!(logs.stdout.is_empty());
    assert!(logs.stderr.is_empty());

    env.supervisor
        .stop(env.stop_req("chatty"))
        .await
        .expect("stop");
}

#[tokio::test]
async fn logs_for_an_unknown_id_are_empty() {
    let env = TestEnv::new();
    let logs = env.supervisor.logs("nobody").await;
    assert!(logs.stdout.is_empty());
    assert!(logs.stderr.is_empty());
}

#[tokio::test]
async fn guardian_skips_manually_stopped_tasks() {
    let env = TestEnv::new();
    env.store
        .create(json!({
            "id": "g1",
            "start_command": "sleep 30",
            "auto_restart": true,
            "max_restarts": 3,
            "restart_interval": 1,
            "manual_stopped": true,
            "was_running_before_shutdown": true
        }))
        .expect("create");

    env.tick_guardian().await;
    assert!(!env.registry.is_running("g1").await);
    assert_eq!(env.store.get("g1").expect("task").restart_count, 0);
}

#[tokio::test]
async fn guardian_skips_tasks_that_never_ran() {
    let env = TestEnv::new();
    env.store
        .create(json!({
            "id": "g0",
            "start_command": "sleep 30",
            "auto_restart": true,
            "restart_interval": 1
        }))
        .expect("create");

    env.tick_guardian().await;
    assert!(!env.registry.is_running("g0").await);
}

#[tokio::test]
async fn guardian_caps_attempts_and_backs_off_without_touching_updated_date() {
    let env = TestEnv::new();
    env.store
        .create(json!({
            "id": "g2",
            "start_command": "exit 1",
            "auto_restart": true,
            "max_restarts": 2,
            "restart_interval": 1,
            "was_running_before_shutdown": true
        }))
        .expect("create");
    let stamped = env.store.get("g2").expect("task").updated_date;

    env.tick_guardian().await;
    assert_eq!(env.store.get("g2").expect("task").restart_count, 1);

    // Still inside the backoff window: no second attempt.
    env.tick_guardian().await;
    assert_eq!(env.store.get("g2").expect("task").restart_count, 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    env.tick_guardian().await;
    assert_eq!(env.store.get("g2").expect("task").restart_count, 2);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    env.tick_guardian().await;
    assert_eq!(env.store.get("g2").expect("task").restart_count, 2);

    assert_eq!(env.store.get("g2").expect("task").updated_date, stamped);
}

#[tokio::test]
async fn guardian_restart_success_resets_counters() {
    let env = TestEnv::new();
    env.store
        .create(json!({
            "id": "g3",
            "start_command": "sleep 30",
            "auto_restart": true,
            "max_restarts": 5,
            "restart_interval": 1,
            "restart_count": 3,
            "was_running_before_shutdown": true
        }))
        .expect("create");

    env.tick_guardian().await;
    assert!(env.registry.is_running("g3").await);

    let task = env.store.get("g3").expect("task");
    assert_eq!(task.restart_count, 0);
    assert!(task.last_started.is_some());
    assert!(!task.manual_stopped);

    env.supervisor
        .stop(env.stop_req("g3"))
        .await
        .expect("stop");
}

#[tokio::test]
async fn shutdown_terminates_live_children() {
    let env = TestEnv::new();
    env.supervisor
        .start(env.start_req("sd", "sleep 30", 250), StartSource::User)
        .await
        .expect("start");
    assert!(env.registry.is_running("sd").await);

    env.supervisor.shutdown_all().await;
    assert!(!env.registry.is_running("sd").await);
}

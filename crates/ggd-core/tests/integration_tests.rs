//! End-to-end tests: a TCP dispatcher, a real agent and the in-memory runtime.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ggd_config::Config;
use ggd_core::dispatcher::server::{self, ServerSettings};
use ggd_core::runtime::mock::result_message;
use ggd_core::{
    agent, callback_channel, Dispatcher, GracefulShutdown, MockRuntime, SandboxMessage,
    SandboxRuntime, SandboxScript,
};
use ggd_types::{DebugMode, GradeGridError, JobOutcome, JobRequest, JobResult, Limits};
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const COURSE: &str = "algo";
const TASK: &str = "sorting";

fn test_config(root: &Path, connect: String) -> Config {
    Config {
        debug: false,
        base_dir: root.to_path_buf(),
        tasks_dir: root.join("tasks"),
        tmp_dir: root.join("tmp"),
        log_file: None,
        dispatcher_bind: "127.0.0.1:0".to_string(),
        ping_interval_ms: 200,
        max_missed_pings: 5,
        max_frame_bytes: 4 * 1024 * 1024,
        agent_connect: connect,
        agent_name: "it-agent".to_string(),
        agent_slots: 2,
        backend_silence_secs: 10,
        reconnect_max_delay_secs: 1,
        worker_pool_size: 2,
        slot_memory_mb: None,
        kill_grace_secs: 1,
        consistency_check_secs: 1,
        ssh_time_limit_secs: 60,
        ssh_host: "localhost".to_string(),
        ssh_port: 22,
        ssh_user: "worker".to_string(),
        docker_bin: "docker".to_string(),
        environment_label: "org.gradegrid.environment".to_string(),
        watcher_poll_ms: 50,
        memory_watcher: true,
        log_level: "debug".to_string(),
        log_structured: false,
    }
}

struct Harness {
    dispatcher: Dispatcher,
    mock: MockRuntime,
    server_shutdown: Arc<GracefulShutdown>,
    agent_shutdown: Arc<GracefulShutdown>,
    agent_task: Option<JoinHandle<ggd_types::Result<()>>>,
    extra_agents: Vec<Arc<GracefulShutdown>>,
    config: Config,
    _tmp: TempDir,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.agent_shutdown.request_shutdown();
        for shutdown in &self.extra_agents {
            shutdown.request_shutdown();
        }
        self.server_shutdown.request_shutdown();
    }
}

impl Harness {
    async fn start(mock: MockRuntime, tweak: impl FnOnce(&mut Config)) -> Self {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path().join("tasks").join(COURSE).join(TASK);
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(bundle.join("run"), "#!/bin/sh\n").unwrap();
        std::fs::create_dir_all(tmp.path().join("tmp")).unwrap();

        let listener = server::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut config = test_config(tmp.path(), addr);
        tweak(&mut config);

        let dispatcher = Dispatcher::new();
        let server_shutdown = Arc::new(GracefulShutdown::new());
        tokio::spawn(server::serve(
            listener,
            dispatcher.clone(),
            ServerSettings::from_config(&config),
            server_shutdown.clone(),
        ));

        let agent_shutdown = Arc::new(GracefulShutdown::new());
        let runtime: Arc<dyn SandboxRuntime> = Arc::new(mock.clone());
        let agent_task = tokio::spawn(agent::serve(config.clone(), runtime, agent_shutdown.clone()));

        let harness = Self {
            dispatcher,
            mock,
            server_shutdown,
            agent_shutdown,
            agent_task: Some(agent_task),
            extra_agents: Vec::new(),
            config,
            _tmp: tmp,
        };
        harness.wait_until("agent registration", |h| async move {
            h.dispatcher.agent_count().await == 1
        })
        .await;
        harness
    }

    /// Connect one more agent sharing the runtime and directories.
    async fn add_agent(&mut self, name: &str) {
        let mut config = self.config.clone();
        config.agent_name = name.to_string();
        let shutdown = Arc::new(GracefulShutdown::new());
        let runtime: Arc<dyn SandboxRuntime> = Arc::new(self.mock.clone());
        tokio::spawn(agent::serve(config, runtime, shutdown.clone()));
        self.extra_agents.push(shutdown);

        let expected = 1 + self.extra_agents.len();
        self.wait_until("extra agent registration", move |h| async move {
            h.dispatcher.agent_count().await == expected
        })
        .await;
    }

    async fn submit(&self, request: JobRequest) -> oneshot::Receiver<JobResult> {
        let (callback, rx) = callback_channel();
        self.dispatcher.submit(request, callback).await.unwrap();
        rx
    }

    async fn wait_until<'a, F, Fut>(&'a self, what: &str, check: F)
    where
        F: Fn(&'a Self) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let started = Instant::now();
        while started.elapsed() < Duration::from_secs(5) {
            if check(self).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {what}");
    }
}

fn request(env: &str) -> JobRequest {
    JobRequest::new(COURSE, TASK, env).with_input(serde_json::json!({ "q1": "print(1)" }))
}

async fn outcome(rx: oneshot::Receiver<JobResult>) -> JobResult {
    tokio::time::timeout(Duration::from_secs(10), rx)
        .await
        .expect("job never completed")
        .expect("callback dropped without a result")
}

// ── Results ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_successful_job_reports_grade() {
    let mock = MockRuntime::new().with_environment("py", SandboxScript::success(87.5));
    let h = Harness::start(mock, |_| {}).await;

    let result = outcome(h.submit(request("py")).await).await;
    assert_eq!(result.result, JobOutcome::Success);
    assert_eq!(result.grade, 87.5);
    assert_eq!(result.text, "All tests passed");
    assert_eq!(result.problems["q1"].status, JobOutcome::Success);

    // The container and its workspace were cleaned up.
    h.wait_until("container removal", |h| async move { h.mock.removed().len() == 1 })
        .await;
    assert_eq!(h.mock.running_count(), 0);
}

#[tokio::test]
async fn test_failed_job_keeps_grader_feedback() {
    let mock = MockRuntime::new().with_environment("py", SandboxScript::failed(40.0));
    let h = Harness::start(mock, |_| {}).await;

    let result = outcome(h.submit(request("py")).await).await;
    assert_eq!(result.result, JobOutcome::Failed);
    assert_eq!(result.grade, 40.0);
}

#[tokio::test]
async fn test_exit_without_result_is_crash() {
    let mock = MockRuntime::new().with_environment("py", SandboxScript::Exit(2));
    let h = Harness::start(mock, |_| {}).await;

    let result = outcome(h.submit(request("py")).await).await;
    assert_eq!(result.result, JobOutcome::Crash);
    assert_eq!(result.grade, 0.0);
}

// ── Limits ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_hard_time_limit_gives_timeout() {
    let mock = MockRuntime::new().with_environment("py", SandboxScript::Hang);
    let h = Harness::start(mock, |_| {}).await;

    let started = Instant::now();
    let rx = h
        .submit(request("py").with_limits(Limits::new(64, 1, Some(2))))
        .await;
    let result = outcome(rx).await;
    let elapsed = started.elapsed();

    assert_eq!(result.result, JobOutcome::Timeout);
    assert_eq!(
        result.text,
        "Your code took too much time to execute (limit: 1 seconds)"
    );
    assert!(elapsed >= Duration::from_secs(2), "finished after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(6), "finished after {elapsed:?}");
}

#[tokio::test]
async fn test_memory_hog_gives_overflow() {
    let mock =
        MockRuntime::new().with_environment("py", SandboxScript::MemoryHog { usage_mb: 300 });
    let h = Harness::start(mock, |_| {}).await;

    let rx = h
        .submit(request("py").with_limits(Limits::new(64, 30, None)))
        .await;
    let result = outcome(rx).await;
    assert_eq!(result.result, JobOutcome::Overflow);
    assert_eq!(result.text, "Your code took too much memory or disk");
}

#[tokio::test]
async fn test_oom_after_result_still_overflow() {
    let mock = MockRuntime::new().with_environment(
        "py",
        SandboxScript::ReplyThenHang(result_message("success", "done", Some(100.0))),
    );
    let h = Harness::start(mock, |_| {}).await;

    let rx = h.submit(request("py")).await;
    h.wait_until("grader start", |h| async move { h.mock.running_count() == 1 })
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.mock.emit_oom("mock-0001");

    let result = outcome(rx).await;
    assert_eq!(result.result, JobOutcome::Overflow);
    assert_eq!(result.grade, 0.0);
}

#[tokio::test]
async fn test_vanished_container_is_lost_crash() {
    let mock = MockRuntime::new().with_environment("py", SandboxScript::Hang);
    let h = Harness::start(mock, |_| {}).await;

    let rx = h.submit(request("py")).await;
    h.wait_until("grader start", |h| async move { h.mock.running_count() == 1 })
        .await;
    // No die event: only the consistency check can notice.
    h.mock.vanish("mock-0001");

    let result = outcome(rx).await;
    assert_eq!(result.result, JobOutcome::Crash);
    assert_eq!(result.text, "The grading container was lost");
}

#[tokio::test]
async fn test_memory_over_slot_ceiling_is_refused() {
    let mock = MockRuntime::new().with_environment("py", SandboxScript::success(100.0));
    let h = Harness::start(mock, |c| c.slot_memory_mb = Some(128)).await;

    let rx = h
        .submit(request("py").with_limits(Limits::new(512, 10, None)))
        .await;
    let result = outcome(rx).await;
    assert_eq!(result.result, JobOutcome::Crash);
    assert!(result.text.contains("512"), "text: {}", result.text);
    assert!(h.mock.created().is_empty());
}

// ── Kill ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_kill_running_job() {
    let mock = MockRuntime::new().with_environment("py", SandboxScript::Hang);
    let h = Harness::start(mock, |_| {}).await;

    let (callback, rx) = callback_channel();
    let job_id = h.dispatcher.submit(request("py"), callback).await.unwrap();
    h.wait_until("grader start", |h| async move { h.mock.running_count() == 1 })
        .await;

    assert!(h.dispatcher.kill(&job_id).await);
    let result = outcome(rx).await;
    assert_eq!(result.result, JobOutcome::Killed);
    assert_eq!(result.text, "The job was killed");
    assert!(!h.dispatcher.kill(&job_id).await);
}

#[tokio::test]
async fn test_kill_before_start_is_killed() {
    let mock = MockRuntime::new().with_environment("py", SandboxScript::Hang);
    let h = Harness::start(mock, |_| {}).await;

    let (callback, rx) = callback_channel();
    let job_id = h.dispatcher.submit(request("py"), callback).await.unwrap();
    assert!(h.dispatcher.kill(&job_id).await);

    let result = outcome(rx).await;
    assert_eq!(result.result, JobOutcome::Killed);
    assert_eq!(result.text, "The job was killed");
    // Nothing is left running once the late start has been undone.
    h.wait_until("grader teardown", |h| async move { h.mock.running_count() == 0 })
        .await;
}

#[tokio::test]
async fn test_ssh_key_is_relayed_to_dispatcher() {
    let mock = MockRuntime::new().with_environment(
        "py",
        SandboxScript::ReplyThenHang(SandboxMessage::SshKey {
            ssh_key: "ssh-ed25519 AAAAC3Nz grader".to_string(),
        }),
    );
    let h = Harness::start(mock, |_| {}).await;

    let (keys_tx, mut keys) = mpsc::unbounded_channel();
    h.dispatcher
        .set_ssh_hook(Arc::new(move |info| {
            let _ = keys_tx.send(info);
        }))
        .await;

    let (callback, rx) = callback_channel();
    let job_id = h
        .dispatcher
        .submit(request("py").with_debug(DebugMode::Ssh), callback)
        .await
        .unwrap();

    let info = tokio::time::timeout(Duration::from_secs(5), keys.recv())
        .await
        .expect("no ssh session announced")
        .expect("hook dropped");
    assert_eq!(info.job_id, job_id);
    assert_eq!(info.host, "localhost");
    assert_eq!(info.port, 22);
    assert_eq!(info.user, "worker");
    assert_eq!(info.key, "ssh-ed25519 AAAAC3Nz grader");

    h.dispatcher.kill(&job_id).await;
    assert_eq!(outcome(rx).await.result, JobOutcome::Killed);
}

// ── Scheduling ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_no_agent_for_environment() {
    let mock = MockRuntime::new().with_environment("py", SandboxScript::success(100.0));
    let h = Harness::start(mock, |_| {}).await;

    let (callback, mut rx) = callback_channel();
    let err = h
        .dispatcher
        .submit(request("haskell"), callback)
        .await
        .unwrap_err();
    assert!(matches!(err, GradeGridError::NoAgentAvailable(_)));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_jobs_wait_for_free_slot() {
    let mock = MockRuntime::new().with_environment("py", SandboxScript::Hang);
    let h = Harness::start(mock, |c| c.agent_slots = 1).await;

    let (callback, first_rx) = callback_channel();
    let first = h.dispatcher.submit(request("py"), callback).await.unwrap();
    let second_rx = h.submit(request("py")).await;

    let snapshot = h.dispatcher.queue_snapshot().await;
    assert_eq!(snapshot.running.len(), 1);
    assert_eq!(snapshot.waiting.len(), 1);

    h.dispatcher.kill(&first).await;
    assert_eq!(outcome(first_rx).await.result, JobOutcome::Killed);

    h.wait_until("second job start", |h| async move {
        h.dispatcher.queue_snapshot().await.waiting.is_empty()
    })
    .await;
    let snapshot = h.dispatcher.queue_snapshot().await;
    h.dispatcher.kill(&snapshot.running[0].job_id).await;
    assert_eq!(outcome(second_rx).await.result, JobOutcome::Killed);
}

#[tokio::test]
async fn test_full_agent_sends_next_job_elsewhere() {
    let mock = MockRuntime::new().with_environment("py", SandboxScript::Hang);
    let mut h = Harness::start(mock, |_| {}).await;

    let first = h.submit(request("py")).await;
    let second = h.submit(request("py")).await;
    h.wait_until("both graders start", |h| async move { h.mock.running_count() == 2 })
        .await;

    h.add_agent("it-agent-2").await;
    let (callback, third) = callback_channel();
    let third_id = h.dispatcher.submit(request("py"), callback).await.unwrap();

    let snapshot = h.dispatcher.queue_snapshot().await;
    assert_eq!(snapshot.running.len(), 3);
    assert!(snapshot.waiting.is_empty());
    for job in &snapshot.running {
        let expected = if job.job_id == third_id { "it-agent-2" } else { "it-agent" };
        assert_eq!(job.agent, expected, "job {}", job.job_id);
    }

    for job in &snapshot.running {
        h.dispatcher.kill(&job.job_id).await;
    }
    for rx in [first, second, third] {
        assert_eq!(outcome(rx).await.result, JobOutcome::Killed);
    }
}

#[tokio::test]
async fn test_agent_loss_crashes_job_once() {
    let mock = MockRuntime::new().with_environment("py", SandboxScript::Hang);
    let mut h = Harness::start(mock, |_| {}).await;

    let rx = h.submit(request("py")).await;
    h.wait_until("grader start", |h| async move { h.mock.running_count() == 1 })
        .await;

    h.agent_shutdown.request_shutdown();
    if let Some(task) = h.agent_task.take() {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    let result = outcome(rx).await;
    assert_eq!(result.result, JobOutcome::Crash);
    assert_eq!(result.text, "Agent disconnected");
    assert_eq!(h.dispatcher.agent_count().await, 0);
    // The agent removed its container on the way out.
    assert_eq!(h.mock.running_count(), 0);
}

// ── Failures on the agent ───────────────────────────────────────────────────

#[tokio::test]
async fn test_create_failure_is_crash() {
    let mock = MockRuntime::new().with_environment("py", SandboxScript::success(100.0));
    mock.fail_creates(true);
    let h = Harness::start(mock, |_| {}).await;

    let result = outcome(h.submit(request("py")).await).await;
    assert_eq!(result.result, JobOutcome::Crash);
    assert!(result.text.contains("could not be started"), "text: {}", result.text);
}

#[tokio::test]
async fn test_missing_task_bundle_is_crash() {
    let mock = MockRuntime::new().with_environment("py", SandboxScript::success(100.0));
    let h = Harness::start(mock, |_| {}).await;

    let rx = h.submit(JobRequest::new(COURSE, "no-such-task", "py")).await;
    let result = outcome(rx).await;
    assert_eq!(result.result, JobOutcome::Crash);
    assert!(h.mock.created().is_empty());
}

// ── Student containers ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_student_retval_reaches_grader() {
    let mock = MockRuntime::new()
        .with_environment(
            "grader",
            SandboxScript::SpawnStudent {
                socket_id: "s1".to_string(),
                environment: Some("student".to_string()),
                time_limit: None,
            },
        )
        .with_environment("student", SandboxScript::Exit(3));
    let h = Harness::start(mock, |_| {}).await;

    let result = outcome(h.submit(request("grader")).await).await;
    assert_eq!(result.result, JobOutcome::Failed);
    assert_eq!(result.text, "student exited with 3");

    let created = h.mock.created();
    assert_eq!(created.len(), 2);
    assert_eq!(created[1].image, "mock-image-student");
}

#[tokio::test]
async fn test_student_with_unknown_environment_gets_not_started() {
    let mock = MockRuntime::new().with_environment(
        "grader",
        SandboxScript::SpawnStudent {
            socket_id: "s1".to_string(),
            environment: Some("cobol".to_string()),
            time_limit: None,
        },
    );
    let h = Harness::start(mock, |_| {}).await;

    let result = outcome(h.submit(request("grader")).await).await;
    assert_eq!(result.result, JobOutcome::Failed);
    assert_eq!(
        result.text,
        format!("student exited with {}", agent::RETVAL_NOT_STARTED)
    );
}

#[tokio::test]
async fn test_student_over_time_limit_gets_timeout_retval() {
    let mock = MockRuntime::new()
        .with_environment(
            "grader",
            SandboxScript::SpawnStudent {
                socket_id: "s1".to_string(),
                environment: Some("student".to_string()),
                time_limit: Some(1),
            },
        )
        .with_environment("student", SandboxScript::Hang);
    let h = Harness::start(mock, |_| {}).await;

    let started = Instant::now();
    let rx = h
        .submit(request("grader").with_limits(Limits::new(64, 10, None)))
        .await;
    let result = outcome(rx).await;
    assert_eq!(result.result, JobOutcome::Failed);
    assert_eq!(
        result.text,
        format!("student exited with {}", agent::RETVAL_TIMEOUT)
    );
    // Stopped at the student's own hard limit (3 x 1s), well before the grader's.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "finished after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(8), "finished after {elapsed:?}");
}

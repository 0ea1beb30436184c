//! In-memory runtime for tests and demos.
//!
//! Each environment image is bound to a [`SandboxScript`] describing how the
//! fake grading process behaves once started: answer with a result, hang until
//! killed, blow its memory budget, ask for a student container, and so on.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use ggd_types::{GradeGridError, Result};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{
    AttachedStreams, ContainerLogs, ContainerSpec, ContainerStats, EventStream, RuntimeEvent,
    SandboxRuntime,
};
use crate::framing::{
    encode_message, read_message, write_stream_chunk, SandboxMessage, MAX_SANDBOX_MESSAGE_BYTES,
    STREAM_STDERR, STREAM_STDOUT,
};

/// Exit code reported for killed containers.
pub const KILLED_EXIT_CODE: i32 = 137;

/// Behaviour of a fake grading process.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxScript {
    /// Read `start`, write this message, exit 0.
    Reply(SandboxMessage),
    /// Read `start`, write this message, then keep running.
    ReplyThenHang(SandboxMessage),
    /// Never answer and never exit until killed.
    Hang,
    /// Exit immediately with this code and no output.
    Exit(i32),
    /// Read `start`, report this much memory in use, then keep running.
    MemoryHog { usage_mb: u64 },
    /// Read `start`, request a student container, then report its retval.
    SpawnStudent {
        socket_id: String,
        environment: Option<String>,
        time_limit: Option<u64>,
    },
}

impl SandboxScript {
    /// Successful result with the given grade.
    pub fn success(grade: f64) -> Self {
        Self::Reply(result_message("success", "All tests passed", Some(grade)))
    }

    /// Failed result with the given grade.
    pub fn failed(grade: f64) -> Self {
        Self::Reply(result_message("failed", "Some tests failed", Some(grade)))
    }
}

/// Build a `result` message as a grader would send it.
pub fn result_message(result: &str, text: &str, grade: Option<f64>) -> SandboxMessage {
    let mut problems = BTreeMap::new();
    problems.insert("q1".to_string(), (result.to_string(), text.to_string()));
    SandboxMessage::Result {
        result: result.to_string(),
        text: text.to_string(),
        grade,
        problems,
        tests: Default::default(),
        custom: Default::default(),
        state: String::new(),
        archive: None,
        stdout: String::new(),
        stderr: String::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Created,
    Running,
    Exited(i32),
}

struct MockContainer {
    spec: ContainerSpec,
    status: Status,
    memory_bytes: u64,
    engine_io: Option<(DuplexStream, DuplexStream)>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct MockState {
    environments: BTreeMap<String, String>,
    scripts: HashMap<String, SandboxScript>,
    containers: HashMap<String, MockContainer>,
    next_id: u64,
    fail_creates: bool,
    subscribers: Vec<mpsc::UnboundedSender<RuntimeEvent>>,
    created: Vec<ContainerSpec>,
    killed: Vec<String>,
    removed: Vec<String>,
}

impl MockState {
    fn emit(&mut self, event: RuntimeEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Scripted in-memory [`SandboxRuntime`].
#[derive(Clone)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
    resource_stats: bool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            resource_stats: true,
        }
    }

    /// Advertise an environment whose containers follow `script`.
    pub fn with_environment(self, name: &str, script: SandboxScript) -> Self {
        self.set_environment(name, script);
        self
    }

    /// Report `supports_resource_stats() == false`.
    pub fn without_resource_stats(mut self) -> Self {
        self.resource_stats = false;
        self
    }

    pub fn set_environment(&self, name: &str, script: SandboxScript) {
        let image = format!("mock-image-{name}");
        let mut state = self.lock();
        state.environments.insert(name.to_string(), image.clone());
        state.scripts.insert(image, script);
    }

    /// Make every following `create` fail.
    pub fn fail_creates(&self, fail: bool) {
        self.lock().fail_creates = fail;
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.lock().created.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.lock().killed.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    pub fn running_count(&self) -> usize {
        self.lock()
            .containers
            .values()
            .filter(|c| c.status == Status::Running)
            .count()
    }

    /// Emit an out-of-memory event for a container.
    pub fn emit_oom(&self, container_id: &str) {
        self.lock().emit(RuntimeEvent::Oom {
            container_id: container_id.to_string(),
        });
    }

    /// Drop a container silently, as if its die event was lost.
    pub fn vanish(&self, container_id: &str) {
        let task = {
            let mut state = self.lock();
            state
                .containers
                .get_mut(container_id)
                .and_then(|c| {
                    c.status = Status::Exited(KILLED_EXIT_CODE);
                    c.task.take()
                })
        };
        if let Some(task) = task {
            task.abort();
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not wedge the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxRuntime for MockRuntime {
    async fn list_environments(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.lock().environments.clone())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.lock();
        if state.fail_creates {
            return Err(GradeGridError::RuntimeUnavailable(
                "mock runtime refuses to create".to_string(),
            ));
        }
        state.next_id += 1;
        let id = format!("mock-{:04}", state.next_id);
        state.created.push(spec.clone());
        state.containers.insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                status: Status::Created,
                memory_bytes: 0,
                engine_io: None,
                task: None,
            },
        );
        Ok(id)
    }

    async fn attach(&self, container_id: &str) -> Result<AttachedStreams> {
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| GradeGridError::Container(format!("no such container {container_id}")))?;
        let (host_out, engine_out) = tokio::io::duplex(64 * 1024);
        let (host_in, engine_in) = tokio::io::duplex(64 * 1024);
        container.engine_io = Some((engine_out, engine_in));
        Ok(AttachedStreams {
            output: Box::new(host_out),
            input: Box::new(host_in),
        })
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        let mut state = self.lock();
        let script = {
            let container = state.containers.get(container_id).ok_or_else(|| {
                GradeGridError::Container(format!("no such container {container_id}"))
            })?;
            if container.status != Status::Created {
                return Ok(());
            }
            state
                .scripts
                .get(&container.spec.image)
                .cloned()
                .unwrap_or(SandboxScript::Exit(0))
        };

        let shared = self.state.clone();
        if let Some(container) = state.containers.get_mut(container_id) {
            container.status = Status::Running;
            let io = container.engine_io.take();
            let id = container_id.to_string();
            container.task = Some(tokio::spawn(run_script(script, io, shared, id)));
        }
        Ok(())
    }

    async fn logs(&self, container_id: &str) -> Result<ContainerLogs> {
        let state = self.lock();
        if !state.containers.contains_key(container_id) {
            return Err(GradeGridError::Container(format!(
                "no such container {container_id}"
            )));
        }
        Ok(ContainerLogs {
            stdout: String::new(),
            stderr: format!("logs of {container_id}\n"),
        })
    }

    async fn stats(&self, container_id: &str) -> Result<ContainerStats> {
        let state = self.lock();
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| GradeGridError::Container(format!("no such container {container_id}")))?;
        Ok(ContainerStats {
            memory_bytes: container.memory_bytes,
        })
    }

    async fn kill(&self, container_id: &str) -> Result<()> {
        let task = {
            let mut state = self.lock();
            state.killed.push(container_id.to_string());
            let Some(container) = state.containers.get_mut(container_id) else {
                return Ok(());
            };
            if container.status != Status::Running {
                return Ok(());
            }
            container.status = Status::Exited(KILLED_EXIT_CODE);
            let task = container.task.take();
            state.emit(RuntimeEvent::Died {
                container_id: container_id.to_string(),
                exit_code: KILLED_EXIT_CODE,
            });
            task
        };
        if let Some(task) = task {
            task.abort();
        }
        debug!(container_id, "Mock container killed");
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let task = {
            let mut state = self.lock();
            state.removed.push(container_id.to_string());
            state
                .containers
                .remove(container_id)
                .and_then(|mut c| c.task.take())
        };
        if let Some(task) = task {
            task.abort();
        }
        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .containers
            .iter()
            .filter(|(_, c)| c.status == Status::Running)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn events(&self) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(Box::pin(stream))
    }

    fn supports_resource_stats(&self) -> bool {
        self.resource_stats
    }
}

async fn run_script(
    script: SandboxScript,
    io: Option<(DuplexStream, DuplexStream)>,
    state: Arc<Mutex<MockState>>,
    container_id: String,
) {
    let code = match io {
        Some((mut out, mut input)) => {
            let code = drive_attached(&script, &mut out, &mut input, &state, &container_id).await;
            drop(out);
            drop(input);
            code
        }
        None => drive_detached(&script, &state, &container_id).await,
    };

    let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(container) = guard.containers.get_mut(&container_id) {
        if container.status == Status::Running {
            container.status = Status::Exited(code);
            guard.emit(RuntimeEvent::Died {
                container_id: container_id.clone(),
                exit_code: code,
            });
        }
    }
}

async fn drive_detached(
    script: &SandboxScript,
    state: &Arc<Mutex<MockState>>,
    container_id: &str,
) -> i32 {
    match script {
        SandboxScript::Exit(code) => *code,
        SandboxScript::Hang | SandboxScript::ReplyThenHang(_) => std::future::pending().await,
        SandboxScript::MemoryHog { usage_mb } => {
            set_memory(state, container_id, *usage_mb);
            std::future::pending().await
        }
        SandboxScript::Reply(_) | SandboxScript::SpawnStudent { .. } => 0,
    }
}

async fn drive_attached(
    script: &SandboxScript,
    out: &mut DuplexStream,
    input: &mut DuplexStream,
    state: &Arc<Mutex<MockState>>,
    container_id: &str,
) -> i32 {
    if let SandboxScript::Exit(code) = script {
        return *code;
    }

    // Every other script waits for `start` first.
    match read_message::<_, SandboxMessage>(input, MAX_SANDBOX_MESSAGE_BYTES).await {
        Ok(Some(SandboxMessage::Start { .. })) => {}
        _ => return 1,
    }
    if write_stream_chunk(out, STREAM_STDERR, b"grader started\n").await.is_err() {
        return 1;
    }

    match script {
        SandboxScript::Exit(code) => *code,
        SandboxScript::Reply(msg) => {
            if send(out, msg).await.is_err() {
                return 1;
            }
            0
        }
        SandboxScript::ReplyThenHang(msg) => {
            let _ = send(out, msg).await;
            std::future::pending().await
        }
        SandboxScript::Hang => std::future::pending().await,
        SandboxScript::MemoryHog { usage_mb } => {
            set_memory(state, container_id, *usage_mb);
            std::future::pending().await
        }
        SandboxScript::SpawnStudent {
            socket_id,
            environment,
            time_limit,
        } => {
            let request = SandboxMessage::RunStudent {
                socket_id: socket_id.clone(),
                environment: environment.clone(),
                memory_limit: None,
                time_limit: *time_limit,
                hard_time_limit: None,
                share_network: false,
                ssh: false,
                run_as_root: false,
            };
            if send(out, &request).await.is_err() {
                return 1;
            }
            loop {
                match read_message::<_, SandboxMessage>(input, MAX_SANDBOX_MESSAGE_BYTES).await {
                    Ok(Some(SandboxMessage::RunStudentRetval { retval, .. })) => {
                        let outcome = if retval == 0 { "success" } else { "failed" };
                        let text = format!("student exited with {retval}");
                        let grade = if retval == 0 { 100.0 } else { 0.0 };
                        let reply = result_message(outcome, &text, Some(grade));
                        return if send(out, &reply).await.is_ok() { 0 } else { 1 };
                    }
                    Ok(Some(_)) => continue,
                    _ => return 1,
                }
            }
        }
    }
}

async fn send(out: &mut DuplexStream, msg: &SandboxMessage) -> Result<()> {
    let bytes = encode_message(msg)?;
    write_stream_chunk(out, STREAM_STDOUT, &bytes).await?;
    Ok(())
}

fn set_memory(state: &Arc<Mutex<MockState>>, container_id: &str, usage_mb: u64) {
    let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(c) = guard.containers.get_mut(container_id) {
        c.memory_bytes = usage_mb * 1024 * 1024;
    }
}

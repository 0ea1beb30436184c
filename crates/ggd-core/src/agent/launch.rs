//! Work the agent hands off to spawned tasks.
//!
//! Nothing here touches the job registry; every outcome is reported back to
//! the agent loop as an [`AgentEvent`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use ggd_types::{AgentMessage, DebugMode, Job, JobId, Limits, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::{student_retval, Closing};
use super::AgentEvent;
use crate::framing::{
    read_stream_chunk, write_message, MessageBuffer, SandboxMessage, MAX_SANDBOX_MESSAGE_BYTES,
    STREAM_STDOUT,
};
use crate::runtime::{
    AttachedStreams, ContainerSpec, EventStream, NetworkMode, SandboxRuntime, JOB_LABEL,
};
use crate::utils::WorkerPool;
use crate::watcher::{WatcherHandle, WatcherRegistration};
use crate::workspace::{remove_workspace, task_bundle_path, JobWorkspace};

/// Grader stderr kept for debug-mode reports.
const MAX_CAPTURED_STDERR: usize = 64 * 1024;

/// Handles shared by the agent loop and the tasks it spawns.
#[derive(Clone)]
pub(super) struct Shared {
    pub runtime: Arc<dyn SandboxRuntime>,
    pub pool: WorkerPool,
    pub watcher: WatcherHandle,
    pub events: mpsc::UnboundedSender<AgentEvent>,
    pub outbox: mpsc::UnboundedSender<AgentMessage>,
    pub tasks_dir: PathBuf,
    pub tmp_dir: PathBuf,
}

impl Shared {
    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }
}

fn registration(container_id: &str, limits: &Limits) -> WatcherRegistration {
    WatcherRegistration {
        container_id: container_id.to_string(),
        memory_limit_mb: limits.memory_mb,
        soft_time: Duration::from_secs(limits.time_s),
        hard_time: Duration::from_secs(limits.hard_time()),
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()
}

// ---------------------------------------------------------------------------
// Main container
// ---------------------------------------------------------------------------

/// Prepare the workspace, create, attach and start the grading container.
pub(super) async fn launch_main(shared: Shared, job: Job, image: String) {
    let job_id = job.job_id.clone();
    let streams = match start_main(&shared, &job, image).await {
        Ok(streams) => streams,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Grading container did not start");
            shared.emit(AgentEvent::StartFailed {
                job_id,
                error: format!("The grading container could not be started: {e}"),
            });
            return;
        }
    };

    let AttachedStreams { output, input } = streams;
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let _ = input_tx.send(SandboxMessage::Start {
        job_id: job_id.clone(),
        course_id: job.course_id.clone(),
        task_id: job.task_id.clone(),
        input: job.input.clone(),
        debug: job.debug,
        limits: job.limits,
    });
    shared.emit(AgentEvent::MainStarted {
        job_id: job_id.clone(),
        input: input_tx,
    });

    tokio::spawn(feed_input(shared.clone(), job_id.clone(), input, input_rx));
    tokio::spawn(pump_output(shared, job_id, output));
}

async fn start_main(shared: &Shared, job: &Job, image: String) -> Result<AttachedStreams> {
    let tasks_dir = shared.tasks_dir.clone();
    let (course_id, task_id) = (job.course_id.clone(), job.task_id.clone());
    let bundle = shared
        .pool
        .run_blocking(move || task_bundle_path(&tasks_dir, &course_id, &task_id))
        .await?;

    let tmp_dir = shared.tmp_dir.clone();
    let dir_name = format!("job-{}", short_id());
    let workspace = shared
        .pool
        .run_blocking(move || JobWorkspace::prepare(&tmp_dir, &dir_name, &bundle))
        .await?;
    shared.emit(AgentEvent::Prepared {
        job_id: job.job_id.clone(),
        workspace: workspace.clone(),
    });

    let network = if job.debug == DebugMode::Ssh {
        NetworkMode::Bridge
    } else {
        NetworkMode::None
    };
    let spec = ContainerSpec::new(format!("ggd-{}", short_id()), image, job.limits.memory_mb)
        .with_label(JOB_LABEL, job.job_id.as_str())
        .with_mount(workspace.task_dir.clone(), "/task", false)
        .with_mount(workspace.sockets_dir.clone(), "/sockets", false)
        .with_network(network)
        .interactive();

    let container_id = shared.runtime.create(&spec).await?;
    shared.watcher.register(registration(&container_id, &job.limits));
    debug!(job_id = %job.job_id, container_id = %container_id, "Grading container created");
    shared.emit(AgentEvent::ContainerCreated {
        job_id: job.job_id.clone(),
        container_id: container_id.clone(),
    });

    let streams = shared.runtime.attach(&container_id).await?;
    shared.runtime.start(&container_id).await?;
    Ok(streams)
}

/// Write queued messages to the grader's stdin until the job drops the sender.
async fn feed_input(
    shared: Shared,
    job_id: JobId,
    mut input: Box<dyn AsyncWrite + Send + Unpin>,
    mut rx: mpsc::UnboundedReceiver<SandboxMessage>,
) {
    let mut delivered = false;
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_message(&mut input, &msg).await {
            debug!(job_id = %job_id, kind = msg.kind(), error = %e, "Grader stdin closed");
            break;
        }
        if !delivered {
            delivered = true;
            shared.emit(AgentEvent::StartDelivered {
                job_id: job_id.clone(),
            });
        }
    }
    let _ = input.shutdown().await;
}

/// Decode the grader's multiplexed output into agent events.
/// Append as much of `text` as fits in `cap` bytes, cutting on a char boundary.
fn append_capped(buf: &mut String, text: &str, cap: usize) {
    let room = cap.saturating_sub(buf.len());
    let mut end = room.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    buf.push_str(&text[..end]);
}

async fn pump_output(shared: Shared, job_id: JobId, mut output: Box<dyn AsyncRead + Send + Unpin>) {
    let mut buffer = MessageBuffer::new(MAX_SANDBOX_MESSAGE_BYTES);
    let mut stdout_broken = false;
    let mut stderr = String::new();

    loop {
        let chunk = match read_stream_chunk(&mut output).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                debug!(job_id = %job_id, error = %e, "Grader output stream failed");
                break;
            }
        };
        match chunk {
            (STREAM_STDOUT, data) => {
                if stdout_broken {
                    continue;
                }
                buffer.push(&data);
                loop {
                    match buffer.next_message::<SandboxMessage>() {
                        Ok(Some(message)) => shared.emit(AgentEvent::Sandbox {
                            job_id: job_id.clone(),
                            message,
                        }),
                        Ok(None) => break,
                        Err(e) => {
                            // A body that fails to decode is consumed; an
                            // oversized length leaves the stream unusable.
                            if !matches!(e, ggd_types::GradeGridError::Json(_)) {
                                stdout_broken = true;
                            }
                            shared.emit(AgentEvent::Unreadable {
                                job_id: job_id.clone(),
                                error: e.to_string(),
                            });
                            if stdout_broken {
                                break;
                            }
                        }
                    }
                }
            }
            (_, data) => {
                append_capped(&mut stderr, &String::from_utf8_lossy(&data), MAX_CAPTURED_STDERR);
            }
        }
    }

    shared.emit(AgentEvent::OutputClosed { job_id, stderr });
}

// ---------------------------------------------------------------------------
// Student containers
// ---------------------------------------------------------------------------

pub(super) struct StudentLaunch {
    pub job_id: JobId,
    pub socket_id: String,
    pub image: String,
    pub limits: Limits,
    pub parent_container: String,
    pub workspace: JobWorkspace,
    pub share_network: bool,
    pub ssh: bool,
    pub run_as_root: bool,
}

pub(super) async fn launch_student(shared: Shared, request: StudentLaunch) {
    let container_id = match create_student(&shared, &request).await {
        Ok(id) => id,
        Err(e) => {
            shared.emit(AgentEvent::StudentFailed {
                job_id: request.job_id,
                socket_id: request.socket_id,
                container_id: None,
                error: e.to_string(),
            });
            return;
        }
    };
    shared.emit(AgentEvent::StudentCreated {
        job_id: request.job_id.clone(),
        socket_id: request.socket_id.clone(),
        container_id: container_id.clone(),
    });

    match shared.runtime.start(&container_id).await {
        Ok(()) => shared.emit(AgentEvent::StudentStarted {
            job_id: request.job_id,
            socket_id: request.socket_id,
            container_id,
        }),
        Err(e) => shared.emit(AgentEvent::StudentFailed {
            job_id: request.job_id,
            socket_id: request.socket_id,
            container_id: Some(container_id),
            error: e.to_string(),
        }),
    }
}

async fn create_student(shared: &Shared, request: &StudentLaunch) -> Result<String> {
    let workspace = request.workspace.clone();
    let socket_id = request.socket_id.clone();
    let socket_dir = shared
        .pool
        .run_blocking(move || workspace.socket_dir(&socket_id))
        .await?;

    let network = if request.share_network {
        NetworkMode::Container(request.parent_container.clone())
    } else if request.ssh {
        NetworkMode::Bridge
    } else {
        NetworkMode::None
    };
    let mut spec = ContainerSpec::new(
        format!("ggd-student-{}", short_id()),
        request.image.clone(),
        request.limits.memory_mb,
    )
    .with_label(JOB_LABEL, request.job_id.as_str())
    .with_mount(request.workspace.student_dir.clone(), "/task/student", false)
    .with_mount(socket_dir, "/sockets", false)
    .with_network(network);
    spec.run_as_root = request.run_as_root;

    let container_id = shared.runtime.create(&spec).await?;
    shared
        .watcher
        .register(registration(&container_id, &request.limits));
    info!(
        job_id = %request.job_id,
        socket_id = %request.socket_id,
        container_id = %container_id,
        "Student container created"
    );
    Ok(container_id)
}

/// Classify a finished student container and report its retval.
pub(super) async fn reap_student(
    shared: Shared,
    job_id: JobId,
    socket_id: String,
    container_id: String,
    oom: bool,
    exit_code: i32,
) {
    let reason = shared.watcher.killed_status(&container_id).await;
    let retval = student_retval(reason, oom, exit_code);
    debug!(job_id = %job_id, socket_id = %socket_id, retval, "Student container finished");
    shared.emit(AgentEvent::StudentFinished {
        job_id,
        socket_id,
        retval,
    });
    if let Err(e) = shared.runtime.remove(&container_id).await {
        warn!(container_id = %container_id, error = %e, "Failed to remove student container");
    }
}

/// Kill and remove a container nobody is waiting for anymore.
pub(super) async fn discard_container(shared: Shared, container_id: String) {
    if let Err(e) = shared.runtime.kill(&container_id).await {
        debug!(container_id = %container_id, error = %e, "Kill before removal failed");
    }
    let _ = shared.watcher.killed_status(&container_id).await;
    if let Err(e) = shared.runtime.remove(&container_id).await {
        warn!(container_id = %container_id, error = %e, "Failed to remove container");
    }
}

pub(super) async fn discard_workspace(shared: Shared, workspace: JobWorkspace) {
    let root = workspace.root;
    if let Err(e) = shared.pool.run_blocking(move || remove_workspace(&root)).await {
        warn!(error = %e, "Failed to remove job workspace");
    }
}

// ---------------------------------------------------------------------------
// Job end
// ---------------------------------------------------------------------------

/// What is left of a job once the agent has closed it.
pub(super) struct Finished {
    pub job: Job,
    pub container_id: Option<String>,
    pub workspace: Option<JobWorkspace>,
    pub closing: Closing,
    pub stderr: String,
}

/// Classify the job, clean up after it and report `JobDone`.
pub(super) async fn finish_job(shared: Shared, finished: Finished) {
    let Finished {
        job,
        container_id,
        workspace,
        mut closing,
        stderr,
    } = finished;

    if let Some(id) = &container_id {
        closing.watcher_reason = shared.watcher.killed_status(id).await;
    }
    let mut report = closing.classify();
    if job.debug.is_enabled() && report.stderr.is_empty() {
        report.stderr = stderr;
    }

    if let Some(id) = &container_id {
        if let Err(e) = shared.runtime.remove(id).await {
            warn!(job_id = %job.job_id, container_id = %id, error = %e, "Failed to remove grading container");
        }
    }
    if let Some(workspace) = workspace {
        discard_workspace(shared.clone(), workspace).await;
    }

    info!(job_id = %job.job_id, result = %report.result, "Job finished");
    let _ = shared.outbox.send(AgentMessage::JobDone {
        job_id: job.job_id,
        report,
    });
}

// ---------------------------------------------------------------------------
// Runtime plumbing
// ---------------------------------------------------------------------------

/// Forward runtime events to the agent, resubscribing if the stream ends.
pub(super) async fn pump_runtime_events(shared: Shared, mut stream: EventStream) {
    loop {
        while let Some(event) = stream.next().await {
            if shared.events.send(AgentEvent::Runtime(event)).is_err() {
                return;
            }
        }
        warn!("Runtime event stream ended, resubscribing");
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if shared.events.is_closed() {
                return;
            }
            match shared.runtime.events().await {
                Ok(next) => {
                    stream = next;
                    break;
                }
                Err(e) => warn!(error = %e, "Failed to resubscribe to runtime events"),
            }
        }
    }
}

/// List running containers for the consistency check.
pub(super) async fn list_running(shared: Shared) {
    match shared.runtime.list_running().await {
        Ok(ids) => shared.emit(AgentEvent::RunningContainers(ids.into_iter().collect())),
        Err(e) => warn!(error = %e, "Consistency check could not list containers"),
    }
}

pub(super) async fn kill_container(shared: Shared, container_id: String) {
    if let Err(e) = shared.runtime.kill(&container_id).await {
        warn!(container_id = %container_id, error = %e, "Failed to kill container");
    }
}

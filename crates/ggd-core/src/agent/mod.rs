//! Execution agent.
//!
//! One actor owns the job and container registries. Everything that can block
//! (workspace copies, runtime calls, watcher queries) runs on spawned tasks
//! which report back through a single event channel, so the loop itself never
//! awaits anything but its next event.

mod launch;
mod state;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ggd_config::Config;
use ggd_types::{
    AgentMessage, DebugMode, DispatcherMessage, GradingReport, Job, JobId, JobOutcome,
    KillReason, Limits, Result, SshDebugInfo,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::framing::SandboxMessage;
use crate::runtime::{PooledRuntime, RuntimeEvent, SandboxRuntime};
use crate::transport::{spawn_agent_link, AgentLink, LinkEvent, LinkSettings};
use crate::utils::{with_retry, GracefulShutdown, RetryConfig, WorkerPool};
use crate::watcher::WatcherPipeline;
use crate::workspace::JobWorkspace;

use launch::{Finished, Shared, StudentLaunch};
pub use state::{
    effective_limits, report_from_message, student_retval, valid_socket_id, JobState,
    RETVAL_NOT_STARTED, RETVAL_OVERFLOW, RETVAL_TIMEOUT, UNREADABLE_OUTPUT,
};
use state::{AgentJob, Closing, ContainerOwner, StudentSlot};

/// Internal notifications processed by the agent loop.
enum AgentEvent {
    Runtime(RuntimeEvent),
    Prepared {
        job_id: JobId,
        workspace: JobWorkspace,
    },
    ContainerCreated {
        job_id: JobId,
        container_id: String,
    },
    MainStarted {
        job_id: JobId,
        input: mpsc::UnboundedSender<SandboxMessage>,
    },
    StartDelivered {
        job_id: JobId,
    },
    StartFailed {
        job_id: JobId,
        error: String,
    },
    Sandbox {
        job_id: JobId,
        message: SandboxMessage,
    },
    Unreadable {
        job_id: JobId,
        error: String,
    },
    OutputClosed {
        job_id: JobId,
        stderr: String,
    },
    StudentCreated {
        job_id: JobId,
        socket_id: String,
        container_id: String,
    },
    StudentStarted {
        job_id: JobId,
        socket_id: String,
        container_id: String,
    },
    StudentFailed {
        job_id: JobId,
        socket_id: String,
        container_id: Option<String>,
        error: String,
    },
    StudentFinished {
        job_id: JobId,
        socket_id: String,
        retval: i32,
    },
    Deadline {
        job_id: JobId,
    },
    OutputGrace {
        job_id: JobId,
    },
    RunningContainers(HashSet<String>),
}

/// A worker host: runs grading containers for the dispatcher.
pub struct Agent {
    config: Config,
    shared: Shared,
    environments: BTreeMap<String, String>,
    jobs: HashMap<JobId, AgentJob>,
    containers: HashMap<String, ContainerOwner>,
    missing: HashMap<String, Instant>,
    events: mpsc::UnboundedReceiver<AgentEvent>,
    background: Vec<JoinHandle<()>>,
}

impl Agent {
    /// Snapshot the local environments and start the watcher pipeline.
    ///
    /// Messages for the dispatcher are written to `outbox`.
    pub async fn start(
        config: Config,
        runtime: Arc<dyn SandboxRuntime>,
        outbox: mpsc::UnboundedSender<AgentMessage>,
    ) -> Result<Self> {
        let pool = WorkerPool::new(config.worker_pool_size);
        let runtime: Arc<dyn SandboxRuntime> = Arc::new(PooledRuntime::new(runtime, pool.clone()));

        let retry = RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            ..RetryConfig::default()
        };
        let environments =
            with_retry(&retry, "list_environments", || runtime.list_environments()).await?;
        let event_stream = runtime.events().await?;

        let (watcher, watcher_task) = WatcherPipeline::new(
            runtime.clone(),
            config.watcher_poll_interval(),
            config.memory_watcher,
        )
        .spawn();

        let (events_tx, events) = mpsc::unbounded_channel();
        let shared = Shared {
            runtime,
            pool,
            watcher,
            events: events_tx,
            outbox,
            tasks_dir: config.tasks_dir.clone(),
            tmp_dir: config.tmp_dir.clone(),
        };
        let pump = tokio::spawn(launch::pump_runtime_events(shared.clone(), event_stream));

        info!(
            name = %config.agent_name,
            slots = config.agent_slots,
            environments = ?environments.keys().collect::<Vec<_>>(),
            "Agent ready"
        );

        Ok(Self {
            config,
            shared,
            environments,
            jobs: HashMap::new(),
            containers: HashMap::new(),
            missing: HashMap::new(),
            events,
            background: vec![watcher_task, pump],
        })
    }

    /// Environments advertised in `Hello`.
    pub fn environments(&self) -> &BTreeMap<String, String> {
        &self.environments
    }

    /// Process link and runtime events until shutdown or until the link is gone.
    pub async fn run(
        mut self,
        mut link: mpsc::UnboundedReceiver<LinkEvent>,
        shutdown: Arc<GracefulShutdown>,
    ) {
        let period = self
            .config
            .consistency_check_interval()
            .max(Duration::from_millis(100));
        let mut consistency = tokio::time::interval_at(Instant::now() + period, period);
        consistency.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = link.recv() => match event {
                    Some(event) => self.on_link(event),
                    None => break,
                },
                Some(event) = self.events.recv() => self.on_event(event),
                _ = consistency.tick() => {
                    tokio::spawn(launch::list_running(self.shared.clone()));
                }
                _ = shutdown.wait() => break,
            }
        }

        self.stop().await;
    }

    fn send(&self, msg: AgentMessage) {
        if self.shared.outbox.send(msg).is_err() {
            debug!("Dispatcher link is gone, message dropped");
        }
    }

    // -- dispatcher side ---------------------------------------------------

    fn on_link(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                info!(jobs = self.jobs.len(), "Announcing agent to dispatcher");
                self.send(AgentMessage::Hello {
                    friendly_name: self.config.agent_name.clone(),
                    slots: self.config.agent_slots,
                    environments: self.environments.clone(),
                    batch_environments: BTreeMap::new(),
                });
            }
            LinkEvent::Disconnected => {
                if !self.jobs.is_empty() {
                    warn!(jobs = self.jobs.len(), "Dispatcher lost, killing running jobs");
                }
                let ids: Vec<JobId> = self.jobs.keys().cloned().collect();
                for job_id in ids {
                    self.kill_job(&job_id);
                }
            }
            LinkEvent::Message(msg) => self.on_dispatcher_message(msg),
        }
    }

    fn on_dispatcher_message(&mut self, msg: DispatcherMessage) {
        debug!(kind = msg.kind(), "Message from dispatcher");
        match msg {
            DispatcherMessage::NewJob { job } => self.accept_job(job),
            DispatcherMessage::NewBatchJob { job_id, .. } => {
                self.send(AgentMessage::JobStarted {
                    job_id: job_id.clone(),
                });
                self.send(AgentMessage::JobDone {
                    job_id,
                    report: GradingReport::synthesized(
                        JobOutcome::Crash,
                        "batch environments are not supported by this agent",
                    ),
                });
            }
            DispatcherMessage::KillJob { job_id } => {
                if self.jobs.contains_key(&job_id) {
                    self.kill_job(&job_id);
                } else {
                    debug!(job_id = %job_id, "Kill for unknown job");
                    self.send(AgentMessage::JobDone {
                        job_id,
                        report: GradingReport::synthesized(JobOutcome::Killed, ""),
                    });
                }
            }
            DispatcherMessage::Ping => self.send(AgentMessage::Pong),
        }
    }

    fn accept_job(&mut self, job: Job) {
        if self.jobs.contains_key(&job.job_id) {
            warn!(job_id = %job.job_id, "Job is already running here, ignoring");
            return;
        }
        let job_id = job.job_id.clone();
        info!(
            job_id = %job_id,
            course_id = %job.course_id,
            task_id = %job.task_id,
            environment = %job.environment,
            "Job received"
        );
        self.send(AgentMessage::JobStarted {
            job_id: job_id.clone(),
        });

        let Some(image) = self.environments.get(&job.environment).cloned() else {
            let text = format!("Environment {} is not available on this agent", job.environment);
            self.reject(job_id, text);
            return;
        };
        let limits = match effective_limits(
            &job,
            self.config.slot_memory_mb,
            self.config.ssh_time_limit_secs,
        ) {
            Ok(limits) => limits,
            Err(text) => {
                self.reject(job_id, text);
                return;
            }
        };

        let mut entry = AgentJob::new(Job { limits, ..job });
        entry.state = JobState::EnvironmentValidated;
        let job = entry.job.clone();
        self.jobs.insert(job_id, entry);
        tokio::spawn(launch::launch_main(self.shared.clone(), job, image));
    }

    fn reject(&self, job_id: JobId, text: String) {
        warn!(job_id = %job_id, reason = %text, "Job refused");
        self.send(AgentMessage::JobDone {
            job_id,
            report: GradingReport::synthesized(JobOutcome::Crash, text),
        });
    }

    fn kill_job(&mut self, job_id: &JobId) {
        let Some(entry) = self.jobs.get_mut(job_id) else {
            return;
        };
        entry.mark(KillReason::Killed);
        let started = entry.state.has_started_container();
        match entry.container_id.clone().filter(|_| started) {
            Some(container_id) => {
                info!(job_id = %job_id, container_id = %container_id, "Killing job");
                self.spawn_kill(container_id);
            }
            None => entry.kill_requested = true,
        }
    }

    fn spawn_kill(&self, container_id: String) {
        tokio::spawn(launch::kill_container(self.shared.clone(), container_id));
    }

    // -- internal events ---------------------------------------------------

    fn on_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::Runtime(RuntimeEvent::Died {
                container_id,
                exit_code,
            }) => self.on_container_died(container_id, exit_code),
            AgentEvent::Runtime(RuntimeEvent::Oom { container_id }) => self.on_oom(&container_id),
            AgentEvent::Prepared { job_id, workspace } => match self.jobs.get_mut(&job_id) {
                Some(entry) => entry.workspace = Some(workspace),
                None => {
                    tokio::spawn(launch::discard_workspace(self.shared.clone(), workspace));
                }
            },
            AgentEvent::ContainerCreated {
                job_id,
                container_id,
            } => match self.jobs.get_mut(&job_id) {
                Some(entry) => {
                    entry.container_id = Some(container_id.clone());
                    entry.state = JobState::ContainerCreated;
                    self.containers
                        .insert(container_id, ContainerOwner::Main(job_id));
                }
                None => {
                    tokio::spawn(launch::discard_container(self.shared.clone(), container_id));
                }
            },
            AgentEvent::MainStarted { job_id, input } => self.on_main_started(job_id, input),
            AgentEvent::StartDelivered { job_id } => {
                if let Some(entry) = self.jobs.get_mut(&job_id) {
                    entry.state = JobState::Running;
                    debug!(job_id = %job_id, "Grader received its start message");
                }
            }
            AgentEvent::StartFailed { job_id, error } => {
                if let Some(entry) = self.jobs.get_mut(&job_id) {
                    entry.start_error = Some(error);
                    self.close_job(&job_id);
                }
            }
            AgentEvent::Sandbox { job_id, message } => self.on_sandbox_message(&job_id, message),
            AgentEvent::Unreadable { job_id, error } => {
                if let Some(entry) = self.jobs.get_mut(&job_id) {
                    warn!(job_id = %job_id, %error, "Unreadable message from grader");
                    if entry.result.is_none() {
                        entry.unreadable = true;
                    }
                }
            }
            AgentEvent::OutputClosed { job_id, stderr } => {
                if let Some(entry) = self.jobs.get_mut(&job_id) {
                    entry.output_closed = true;
                    entry.stderr = stderr;
                    if entry.is_finished() {
                        self.close_job(&job_id);
                    }
                }
            }
            AgentEvent::StudentCreated {
                job_id,
                socket_id,
                container_id,
            } => {
                let slot = self
                    .jobs
                    .get_mut(&job_id)
                    .and_then(|entry| entry.students.get_mut(&socket_id));
                match slot {
                    Some(slot) => {
                        slot.container_id = Some(container_id.clone());
                        self.containers
                            .insert(container_id, ContainerOwner::Student { job_id, socket_id });
                    }
                    None => {
                        tokio::spawn(launch::discard_container(self.shared.clone(), container_id));
                    }
                }
            }
            AgentEvent::StudentStarted {
                job_id,
                socket_id,
                container_id,
            } => {
                if let Some(entry) = self.jobs.get_mut(&job_id) {
                    // Already reaped if the container exited straight away.
                    let Some(slot) = entry.students.get_mut(&socket_id) else {
                        return;
                    };
                    slot.started = true;
                    entry.send_to_sandbox(SandboxMessage::RunStudentStarted {
                        socket_id,
                        container_id,
                    });
                }
            }
            AgentEvent::StudentFailed {
                job_id,
                socket_id,
                container_id,
                error,
            } => {
                warn!(job_id = %job_id, socket_id = %socket_id, %error, "Student container failed to start");
                if let Some(id) = container_id {
                    self.containers.remove(&id);
                    tokio::spawn(launch::discard_container(self.shared.clone(), id));
                }
                if let Some(entry) = self.jobs.get_mut(&job_id) {
                    entry.students.remove(&socket_id);
                    entry.send_to_sandbox(SandboxMessage::RunStudentRetval {
                        socket_id,
                        retval: RETVAL_NOT_STARTED,
                    });
                }
            }
            AgentEvent::StudentFinished {
                job_id,
                socket_id,
                retval,
            } => {
                if let Some(entry) = self.jobs.get_mut(&job_id) {
                    entry.students.remove(&socket_id);
                    entry.send_to_sandbox(SandboxMessage::RunStudentRetval { socket_id, retval });
                }
            }
            AgentEvent::Deadline { job_id } => {
                if let Some(entry) = self.jobs.get_mut(&job_id) {
                    if entry.exit_code.is_none() {
                        warn!(job_id = %job_id, "Job outlived its hard limit, killing");
                        entry.mark(KillReason::Timeout);
                        if let Some(id) = entry.container_id.clone() {
                            self.spawn_kill(id);
                        }
                    }
                }
            }
            AgentEvent::OutputGrace { job_id } => {
                if self.jobs.contains_key(&job_id) {
                    debug!(job_id = %job_id, "Output still open after container death, closing job");
                    self.close_job(&job_id);
                }
            }
            AgentEvent::RunningContainers(running) => self.reconcile(running),
        }
    }

    fn on_main_started(&mut self, job_id: JobId, input: mpsc::UnboundedSender<SandboxMessage>) {
        let grace = self.config.kill_grace();
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        entry.input = Some(input);
        entry.state = entry.state.max(JobState::ContainerStarted);

        let limit = Duration::from_secs(entry.job.limits.hard_time()) + grace;
        let events = self.shared.events.clone();
        let deadline_job = job_id.clone();
        entry.deadline = Some(tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            let _ = events.send(AgentEvent::Deadline {
                job_id: deadline_job,
            });
        }));
        info!(job_id = %job_id, "Grading container started");

        if entry.kill_requested {
            if let Some(id) = entry.container_id.clone() {
                self.spawn_kill(id);
            }
        }
    }

    fn on_sandbox_message(&mut self, job_id: &JobId, message: SandboxMessage) {
        let Some(entry) = self.jobs.get_mut(job_id) else {
            return;
        };
        debug!(job_id = %job_id, kind = message.kind(), "Message from grader");
        match message {
            msg @ SandboxMessage::Result { .. } => entry.accept_result(msg),
            msg @ SandboxMessage::RunStudent { .. } => self.run_student(job_id, msg),
            SandboxMessage::SshKey { ssh_key } => {
                if entry.job.debug == DebugMode::Ssh {
                    self.send(AgentMessage::JobSshDebug {
                        info: SshDebugInfo {
                            job_id: job_id.clone(),
                            host: self.config.ssh_host.clone(),
                            port: self.config.ssh_port,
                            user: self.config.ssh_user.clone(),
                            key: ssh_key,
                        },
                    });
                } else {
                    debug!(job_id = %job_id, "Ignoring ssh key outside ssh debug mode");
                }
            }
            other => {
                warn!(job_id = %job_id, kind = other.kind(), "Unexpected message from grader")
            }
        }
    }

    fn run_student(&mut self, job_id: &JobId, request: SandboxMessage) {
        let SandboxMessage::RunStudent {
            socket_id,
            environment,
            memory_limit,
            time_limit,
            hard_time_limit,
            share_network,
            ssh,
            run_as_root,
        } = request
        else {
            return;
        };
        let Some(entry) = self.jobs.get_mut(job_id) else {
            return;
        };

        let refuse = |entry: &AgentJob, socket_id: String, why: &str| {
            warn!(job_id = %job_id, socket_id = %socket_id, reason = why, "Student container refused");
            entry.send_to_sandbox(SandboxMessage::RunStudentRetval {
                socket_id,
                retval: RETVAL_NOT_STARTED,
            });
        };

        if !valid_socket_id(&socket_id) {
            refuse(entry, socket_id, "invalid socket id");
            return;
        }
        if entry.students.contains_key(&socket_id) {
            refuse(entry, socket_id, "socket id already in use");
            return;
        }
        let (Some(parent_container), Some(workspace)) =
            (entry.container_id.clone(), entry.workspace.clone())
        else {
            refuse(entry, socket_id, "grading container is not running");
            return;
        };
        let environment = environment.unwrap_or_else(|| entry.job.environment.clone());
        let Some(image) = self.environments.get(&environment).cloned() else {
            refuse(entry, socket_id, "unknown environment");
            return;
        };

        let limits = Limits::capped_by(&entry.job.limits, memory_limit, time_limit, hard_time_limit);
        entry
            .students
            .insert(socket_id.clone(), StudentSlot::default());
        let request = StudentLaunch {
            job_id: job_id.clone(),
            socket_id,
            image,
            limits,
            parent_container,
            workspace,
            share_network,
            ssh: ssh && entry.job.debug == DebugMode::Ssh,
            run_as_root,
        };
        tokio::spawn(launch::launch_student(self.shared.clone(), request));
    }

    // -- containers --------------------------------------------------------

    fn on_container_died(&mut self, container_id: String, exit_code: i32) {
        self.missing.remove(&container_id);
        match self.containers.remove(&container_id) {
            Some(ContainerOwner::Main(job_id)) => {
                let grace = self.config.kill_grace();
                let Some(entry) = self.jobs.get_mut(&job_id) else {
                    return;
                };
                debug!(job_id = %job_id, container_id = %container_id, exit_code, "Grading container died");
                entry.exit_code = Some(exit_code);
                if entry.is_finished() {
                    self.close_job(&job_id);
                } else {
                    let events = self.shared.events.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        let _ = events.send(AgentEvent::OutputGrace { job_id });
                    });
                }
            }
            Some(ContainerOwner::Student { job_id, socket_id }) => {
                let oom = self
                    .jobs
                    .get(&job_id)
                    .and_then(|entry| entry.students.get(&socket_id))
                    .map(|slot| slot.oom)
                    .unwrap_or(false);
                tokio::spawn(launch::reap_student(
                    self.shared.clone(),
                    job_id,
                    socket_id,
                    container_id,
                    oom,
                    exit_code,
                ));
            }
            None => debug!(container_id = %container_id, "Ignoring event for untracked container"),
        }
    }

    fn on_oom(&mut self, container_id: &str) {
        match self.containers.get(container_id) {
            Some(ContainerOwner::Main(job_id)) => {
                if let Some(entry) = self.jobs.get_mut(job_id) {
                    warn!(job_id = %job_id, container_id, "Grading container ran out of memory");
                    entry.mark(KillReason::Overflow);
                }
            }
            Some(ContainerOwner::Student { job_id, socket_id }) => {
                if let Some(slot) = self
                    .jobs
                    .get_mut(job_id)
                    .and_then(|entry| entry.students.get_mut(socket_id))
                {
                    slot.oom = true;
                }
            }
            None => return,
        }
        self.spawn_kill(container_id.to_string());
    }

    /// Close started containers the runtime no longer knows about.
    fn reconcile(&mut self, running: HashSet<String>) {
        let now = Instant::now();
        let grace = self.config.kill_grace();
        let started: Vec<String> = self
            .containers
            .iter()
            .filter(|(_, owner)| self.is_started(owner))
            .map(|(id, _)| id.clone())
            .collect();

        self.missing.retain(|id, _| self.containers.contains_key(id));
        let mut lost = Vec::new();
        for id in started {
            if running.contains(&id) {
                self.missing.remove(&id);
                continue;
            }
            let since = *self.missing.entry(id.clone()).or_insert(now);
            if now.duration_since(since) >= grace {
                lost.push(id);
            }
        }

        for id in lost {
            warn!(container_id = %id, "Container vanished without a die event");
            self.missing.remove(&id);
            match self.containers.get(&id) {
                Some(ContainerOwner::Main(job_id)) => {
                    if let Some(entry) = self.jobs.get_mut(job_id) {
                        entry.output_closed = true;
                    }
                    self.on_container_died(id, -1);
                }
                Some(ContainerOwner::Student { .. }) => self.on_container_died(id, -1),
                None => {}
            }
        }
    }

    fn is_started(&self, owner: &ContainerOwner) -> bool {
        match owner {
            ContainerOwner::Main(job_id) => self
                .jobs
                .get(job_id)
                .map(|entry| entry.state.has_started_container() && entry.exit_code.is_none())
                .unwrap_or(false),
            ContainerOwner::Student { job_id, socket_id } => self
                .jobs
                .get(job_id)
                .and_then(|entry| entry.students.get(socket_id))
                .map(|slot| slot.started)
                .unwrap_or(false),
        }
    }

    /// Drop the job from the registry and finish it in the background.
    fn close_job(&mut self, job_id: &JobId) {
        let Some(mut entry) = self.jobs.remove(job_id) else {
            return;
        };
        if let Some(deadline) = entry.deadline.take() {
            deadline.abort();
        }
        if let Some(id) = &entry.container_id {
            self.containers.remove(id);
            self.missing.remove(id);
        }
        for (_, slot) in entry.students.drain() {
            if let Some(id) = slot.container_id {
                self.containers.remove(&id);
                self.missing.remove(&id);
                tokio::spawn(launch::discard_container(self.shared.clone(), id));
            }
        }

        let finished = Finished {
            closing: Closing {
                watcher_reason: None,
                kill_reason: entry.kill_reason,
                start_error: entry.start_error.take(),
                unreadable: entry.unreadable,
                result: entry.result.take(),
                exit_code: entry.exit_code,
            },
            container_id: entry.container_id.take(),
            workspace: entry.workspace.take(),
            stderr: std::mem::take(&mut entry.stderr),
            job: entry.job,
        };
        tokio::spawn(launch::finish_job(self.shared.clone(), finished));
    }

    async fn stop(&mut self) {
        info!(jobs = self.jobs.len(), "Agent stopping");
        let ids: Vec<String> = self.containers.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.shared.runtime.remove(&id).await {
                warn!(container_id = %id, error = %e, "Failed to remove container on shutdown");
            }
        }
        for (_, entry) in self.jobs.drain() {
            if let Some(workspace) = entry.workspace {
                launch::discard_workspace(self.shared.clone(), workspace).await;
            }
        }
        for task in self.background.drain(..) {
            task.abort();
        }
    }
}

/// Connect to the dispatcher and run an agent until shutdown.
pub async fn serve(
    config: Config,
    runtime: Arc<dyn SandboxRuntime>,
    shutdown: Arc<GracefulShutdown>,
) -> Result<()> {
    let (link, link_task) = spawn_agent_link(LinkSettings::from_config(&config), shutdown.clone());
    let AgentLink { events, outbox } = link;
    let agent = match Agent::start(config, runtime, outbox).await {
        Ok(agent) => agent,
        Err(e) => {
            link_task.abort();
            return Err(e);
        }
    };
    agent.run(events, shutdown).await;
    link_task.abort();
    Ok(())
}

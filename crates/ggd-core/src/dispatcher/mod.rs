//! Job dispatcher and agent pool.
//!
//! All bookkeeping lives in one mutex-protected table: agent connections,
//! running jobs and the FIFO of jobs waiting for a slot. Decisions taken under
//! the lock are collected as [`Effect`]s and carried out once it is released,
//! so no callback or send ever runs while the table is locked.

pub mod server;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ggd_types::{
    AgentMessage, DispatcherMessage, GradeGridError, Job, JobId, JobOutcome, JobRequest,
    QueueSnapshot, Result, RunningJobInfo, SshDebugInfo, WaitingJobInfo,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::callback::{deliver, finalize, synthesize, JobCallback};

/// Connection-scoped agent identifier.
pub type AgentId = u64;

/// Receives `JobSshDebug` notices for the caller.
pub type SshDebugHook = Arc<dyn Fn(SshDebugInfo) + Send + Sync>;

struct Registration {
    name: String,
    slots: usize,
    environments: BTreeMap<String, String>,
}

struct Connection {
    peer: String,
    outbound: mpsc::UnboundedSender<DispatcherMessage>,
    registration: Option<Registration>,
}

impl Connection {
    fn name(&self) -> &str {
        self.registration
            .as_ref()
            .map(|r| r.name.as_str())
            .unwrap_or(&self.peer)
    }
}

struct RunningJob {
    agent: AgentId,
    job: Job,
    callback: JobCallback,
    submitted_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    killed: bool,
}

struct WaitingJob {
    job: Job,
    callback: JobCallback,
    submitted_at: DateTime<Utc>,
}

enum Effect {
    Send {
        to: mpsc::UnboundedSender<DispatcherMessage>,
        msg: DispatcherMessage,
    },
    Complete {
        callback: JobCallback,
        result: ggd_types::JobResult,
    },
    SshDebug {
        hook: SshDebugHook,
        info: SshDebugInfo,
    },
}

fn apply(effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::Send { to, msg } => {
                let kind = msg.kind();
                if to.send(msg).is_err() {
                    debug!(kind, "Agent connection closed before send");
                }
            }
            Effect::Complete { callback, result } => deliver(callback, result),
            Effect::SshDebug { hook, info } => hook(info),
        }
    }
}

#[derive(Default)]
struct DispatcherInner {
    connections: HashMap<AgentId, Connection>,
    running: HashMap<JobId, RunningJob>,
    waiting: VecDeque<WaitingJob>,
    ssh_hook: Option<SshDebugHook>,
}

impl DispatcherInner {
    fn agent_count_for(&self, environment: &str) -> usize {
        self.connections
            .values()
            .filter_map(|c| c.registration.as_ref())
            .filter(|r| r.environments.contains_key(environment))
            .count()
    }

    fn is_known(&self, job_id: &JobId) -> bool {
        self.running.contains_key(job_id) || self.waiting.iter().any(|w| &w.job.job_id == job_id)
    }

    fn free_slots(&self, agent: AgentId, slots: usize) -> usize {
        let used = self.running.values().filter(|r| r.agent == agent).count();
        slots.saturating_sub(used)
    }

    /// Eligible agent with the most free slots; lowest id on ties.
    fn pick_agent(&self, environment: &str) -> Option<AgentId> {
        self.connections
            .iter()
            .filter_map(|(id, conn)| {
                let reg = conn.registration.as_ref()?;
                if !reg.environments.contains_key(environment) {
                    return None;
                }
                let free = self.free_slots(*id, reg.slots);
                (free > 0).then_some((*id, free))
            })
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(id, _)| id)
    }

    /// Dispatch waiting jobs in FIFO order; jobs that cannot be placed keep their position.
    fn schedule(&mut self, effects: &mut Vec<Effect>) {
        let mut still_waiting = VecDeque::new();
        while let Some(waiting) = self.waiting.pop_front() {
            match self.pick_agent(&waiting.job.environment) {
                Some(agent) => self.dispatch(agent, waiting, effects),
                None => still_waiting.push_back(waiting),
            }
        }
        self.waiting = still_waiting;
    }

    fn dispatch(&mut self, agent: AgentId, waiting: WaitingJob, effects: &mut Vec<Effect>) {
        let Some(conn) = self.connections.get(&agent) else {
            self.waiting.push_back(waiting);
            return;
        };
        info!(
            job_id = %waiting.job.job_id,
            agent = %conn.name(),
            environment = %waiting.job.environment,
            "Dispatching job"
        );
        effects.push(Effect::Send {
            to: conn.outbound.clone(),
            msg: DispatcherMessage::NewJob {
                job: waiting.job.clone(),
            },
        });
        self.running.insert(
            waiting.job.job_id.clone(),
            RunningJob {
                agent,
                job: waiting.job,
                callback: waiting.callback,
                submitted_at: waiting.submitted_at,
                started_at: None,
                killed: false,
            },
        );
    }

    /// Resolve every job running on `agent` as crashed.
    fn crash_jobs_of(&mut self, agent: AgentId, text: &str, effects: &mut Vec<Effect>) {
        let ids: Vec<JobId> = self
            .running
            .iter()
            .filter(|(_, r)| r.agent == agent)
            .map(|(id, _)| id.clone())
            .collect();
        for job_id in ids {
            if let Some(running) = self.running.remove(&job_id) {
                warn!(job_id = %job_id, reason = text, "Job lost with its agent");
                effects.push(Effect::Complete {
                    result: synthesize(&running.job, JobOutcome::Crash, text),
                    callback: running.callback,
                });
            }
        }
    }

    /// Resolve waiting jobs whose environment no agent offers anymore.
    fn drop_orphans(&mut self, effects: &mut Vec<Effect>) {
        let waiting = std::mem::take(&mut self.waiting);
        for job in waiting {
            if self.agent_count_for(&job.job.environment) > 0 {
                self.waiting.push_back(job);
                continue;
            }
            warn!(job_id = %job.job.job_id, environment = %job.job.environment, "No agent left for waiting job");
            effects.push(Effect::Complete {
                result: synthesize(
                    &job.job,
                    JobOutcome::Crash,
                    format!(
                        "No agent is available anymore for environment {}",
                        job.job.environment
                    ),
                ),
                callback: job.callback,
            });
        }
    }
}

/// Shared handle to the dispatcher; cheap to clone.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<Mutex<DispatcherInner>>,
    next_job: Arc<AtomicU64>,
    next_agent: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a job. Fails at once if no connected agent offers its environment.
    ///
    /// The callback is invoked exactly once, with the job's final result.
    pub async fn submit(&self, request: JobRequest, callback: JobCallback) -> Result<JobId> {
        let mut effects = Vec::new();
        let job_id = {
            let mut inner = self.inner.lock().await;
            if inner.agent_count_for(&request.environment) == 0 {
                return Err(GradeGridError::NoAgentAvailable(request.environment));
            }
            let job_id = match request.job_id.clone() {
                Some(id) if inner.is_known(&id) => {
                    return Err(GradeGridError::DuplicateJob(id.to_string()));
                }
                Some(id) => id,
                None => loop {
                    let n = self.next_job.fetch_add(1, Ordering::Relaxed) + 1;
                    let id = JobId::new(format!("job-{n}"));
                    if !inner.is_known(&id) {
                        break id;
                    }
                },
            };

            debug!(job_id = %job_id, environment = %request.environment, "Job submitted");
            inner.waiting.push_back(WaitingJob {
                job: request.into_job(job_id.clone()),
                callback,
                submitted_at: Utc::now(),
            });
            inner.schedule(&mut effects);
            job_id
        };
        apply(effects);
        Ok(job_id)
    }

    /// Kill a job. Returns `false` if it is unknown or already finished.
    pub async fn kill(&self, job_id: &JobId) -> bool {
        let mut effects = Vec::new();
        let found = {
            let mut inner = self.inner.lock().await;
            if let Some(pos) = inner.waiting.iter().position(|w| &w.job.job_id == job_id) {
                if let Some(waiting) = inner.waiting.remove(pos) {
                    info!(job_id = %job_id, "Waiting job killed");
                    effects.push(Effect::Complete {
                        result: synthesize(&waiting.job, JobOutcome::Killed, ""),
                        callback: waiting.callback,
                    });
                }
                true
            } else if let Some(running) = inner.running.get_mut(job_id) {
                running.killed = true;
                let agent = running.agent;
                if let Some(conn) = inner.connections.get(&agent) {
                    info!(job_id = %job_id, agent = %conn.name(), "Forwarding kill to agent");
                    effects.push(Effect::Send {
                        to: conn.outbound.clone(),
                        msg: DispatcherMessage::KillJob {
                            job_id: job_id.clone(),
                        },
                    });
                }
                true
            } else {
                info!(job_id = %job_id, "Kill for unknown or finished job ignored");
                false
            }
        };
        apply(effects);
        found
    }

    /// Number of connected agents offering `environment`.
    pub async fn agent_count_for(&self, environment: &str) -> usize {
        self.inner.lock().await.agent_count_for(environment)
    }

    /// Number of agents that completed their `Hello`.
    pub async fn agent_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .connections
            .values()
            .filter(|c| c.registration.is_some())
            .count()
    }

    pub async fn queue_snapshot(&self) -> QueueSnapshot {
        let inner = self.inner.lock().await;
        let mut running: Vec<RunningJobInfo> = inner
            .running
            .values()
            .map(|r| RunningJobInfo {
                job_id: r.job.job_id.clone(),
                agent: inner
                    .connections
                    .get(&r.agent)
                    .map(|c| c.name().to_string())
                    .unwrap_or_default(),
                course_id: r.job.course_id.clone(),
                task_id: r.job.task_id.clone(),
                environment: r.job.environment.clone(),
                submitted_at: r.submitted_at,
                started_at: r.started_at,
                time_limit_s: r.job.limits.time_s,
            })
            .collect();
        running.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        let waiting = inner
            .waiting
            .iter()
            .map(|w| WaitingJobInfo {
                job_id: w.job.job_id.clone(),
                course_id: w.job.course_id.clone(),
                task_id: w.job.task_id.clone(),
                environment: w.job.environment.clone(),
                submitted_at: w.submitted_at,
            })
            .collect();
        QueueSnapshot { running, waiting }
    }

    pub async fn set_ssh_hook(&self, hook: SshDebugHook) {
        self.inner.lock().await.ssh_hook = Some(hook);
    }

    /// Track a new agent connection; messages for it arrive on the receiver.
    pub async fn register_connection(
        &self,
        peer: impl Into<String>,
    ) -> (AgentId, mpsc::UnboundedReceiver<DispatcherMessage>) {
        let agent = self.next_agent.fetch_add(1, Ordering::Relaxed) + 1;
        let (outbound, rx) = mpsc::unbounded_channel();
        let peer = peer.into();
        debug!(agent, peer = %peer, "Agent connection opened");
        self.inner.lock().await.connections.insert(
            agent,
            Connection {
                peer,
                outbound,
                registration: None,
            },
        );
        (agent, rx)
    }

    /// Apply one message received from an agent.
    pub async fn handle_agent_message(&self, agent: AgentId, msg: AgentMessage) {
        let mut effects = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            if !inner.connections.contains_key(&agent) {
                warn!(agent, kind = msg.kind(), "Message from unknown agent ignored");
                return;
            }
            match msg {
                AgentMessage::Hello {
                    friendly_name,
                    slots,
                    environments,
                    ..
                } => {
                    let replaced = inner
                        .connections
                        .get(&agent)
                        .is_some_and(|c| c.registration.is_some());
                    if replaced {
                        inner.crash_jobs_of(agent, "Agent restarted", &mut effects);
                    }
                    info!(
                        agent,
                        name = %friendly_name,
                        slots,
                        environments = ?environments.keys().collect::<Vec<_>>(),
                        "Agent registered"
                    );
                    if let Some(conn) = inner.connections.get_mut(&agent) {
                        conn.registration = Some(Registration {
                            name: friendly_name,
                            slots,
                            environments,
                        });
                    }
                    inner.drop_orphans(&mut effects);
                    inner.schedule(&mut effects);
                }
                AgentMessage::JobStarted { job_id } => match inner.running.get_mut(&job_id) {
                    Some(running) if running.agent == agent => {
                        running.started_at = Some(Utc::now());
                        debug!(job_id = %job_id, "Job started on agent");
                    }
                    _ => debug!(job_id = %job_id, "Start notice for a job not running there"),
                },
                AgentMessage::JobDone { job_id, report } => {
                    let owned = inner
                        .running
                        .get(&job_id)
                        .is_some_and(|r| r.agent == agent);
                    if !owned {
                        debug!(job_id = %job_id, "Result for a job not running there ignored");
                        return;
                    }
                    if let Some(running) = inner.running.remove(&job_id) {
                        if running.killed && report.result != JobOutcome::Killed {
                            debug!(job_id = %job_id, result = %report.result, "Killed job ended otherwise");
                        }
                        effects.push(Effect::Complete {
                            result: finalize(&running.job, report),
                            callback: running.callback,
                        });
                    }
                    inner.schedule(&mut effects);
                }
                AgentMessage::JobSshDebug { info } => {
                    let owned = inner
                        .running
                        .get(&info.job_id)
                        .is_some_and(|r| r.agent == agent);
                    match (&inner.ssh_hook, owned) {
                        (Some(hook), true) => effects.push(Effect::SshDebug {
                            hook: hook.clone(),
                            info,
                        }),
                        _ => debug!(job_id = %info.job_id, "Ssh debug notice dropped"),
                    }
                }
                AgentMessage::Pong => {}
            }
        }
        apply(effects);
    }

    /// Forget an agent; its running jobs resolve as crashed.
    pub async fn agent_disconnected(&self, agent: AgentId) {
        let mut effects = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let Some(conn) = inner.connections.remove(&agent) else {
                return;
            };
            info!(agent, name = %conn.name(), "Agent disconnected");
            inner.crash_jobs_of(agent, "Agent disconnected", &mut effects);
            inner.drop_orphans(&mut effects);
        }
        apply(effects);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::callback_channel;
    use ggd_types::{GradingReport, JobResult};
    use tokio::sync::oneshot;

    fn envs(names: &[&str]) -> BTreeMap<String, String> {
        names
            .iter()
            .map(|n| (n.to_string(), format!("sha256:{n}")))
            .collect()
    }

    async fn agent(
        d: &Dispatcher,
        name: &str,
        slots: usize,
        environments: &[&str],
    ) -> (AgentId, mpsc::UnboundedReceiver<DispatcherMessage>) {
        let (id, rx) = d.register_connection(name).await;
        d.handle_agent_message(
            id,
            AgentMessage::Hello {
                friendly_name: name.to_string(),
                slots,
                environments: envs(environments),
                batch_environments: BTreeMap::new(),
            },
        )
        .await;
        (id, rx)
    }

    async fn submit(d: &Dispatcher, env: &str) -> (JobId, oneshot::Receiver<JobResult>) {
        let (callback, rx) = callback_channel();
        let id = d
            .submit(JobRequest::new("course", "task", env), callback)
            .await
            .unwrap();
        (id, rx)
    }

    fn new_job_id(msg: DispatcherMessage) -> JobId {
        match msg {
            DispatcherMessage::NewJob { job } => job.job_id,
            other => panic!("expected new_job, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_agent_fails_synchronously() {
        let d = Dispatcher::new();
        let (callback, mut rx) = callback_channel();
        let err = d
            .submit(JobRequest::new("c", "t", "python3"), callback)
            .await
            .unwrap_err();
        assert!(matches!(err, GradeGridError::NoAgentAvailable(env) if env == "python3"));
        // The callback was dropped without ever being called.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn job_done_reaches_callback() {
        let d = Dispatcher::new();
        let (a, mut a_rx) = agent(&d, "a1", 2, &["py"]).await;
        let (job_id, rx) = submit(&d, "py").await;
        assert_eq!(new_job_id(a_rx.recv().await.unwrap()), job_id);

        d.handle_agent_message(a, AgentMessage::JobStarted { job_id: job_id.clone() })
            .await;
        let snapshot = d.queue_snapshot().await;
        assert_eq!(snapshot.running.len(), 1);
        assert_eq!(snapshot.running[0].agent, "a1");
        assert!(snapshot.running[0].started_at.is_some());

        let mut report = GradingReport::synthesized(JobOutcome::Success, "ok");
        report.grade = Some(87.456);
        d.handle_agent_message(
            a,
            AgentMessage::JobDone {
                job_id: job_id.clone(),
                report,
            },
        )
        .await;
        let result = rx.await.unwrap();
        assert_eq!(result.result, JobOutcome::Success);
        assert_eq!(result.grade, 87.46);
        assert!(d.queue_snapshot().await.running.is_empty());
    }

    #[tokio::test]
    async fn most_free_slots_wins() {
        let d = Dispatcher::new();
        let (_small, mut small_rx) = agent(&d, "small", 1, &["py"]).await;
        let (_big, mut big_rx) = agent(&d, "big", 3, &["py"]).await;

        submit(&d, "py").await;
        assert!(big_rx.try_recv().is_ok());
        assert!(small_rx.try_recv().is_err());
        assert_eq!(d.agent_count_for("py").await, 2);
        assert_eq!(d.agent_count_for("java").await, 0);
    }

    #[tokio::test]
    async fn full_agents_make_jobs_wait_in_order() {
        let d = Dispatcher::new();
        let (a, mut a_rx) = agent(&d, "a1", 2, &["py"]).await;
        let (first, _r1) = submit(&d, "py").await;
        let (_second, _r2) = submit(&d, "py").await;
        let (third, _r3) = submit(&d, "py").await;
        let (fourth, _r4) = submit(&d, "py").await;

        assert_eq!(new_job_id(a_rx.recv().await.unwrap()), first);
        a_rx.recv().await.unwrap();
        assert!(a_rx.try_recv().is_err());
        let snapshot = d.queue_snapshot().await;
        assert_eq!(snapshot.running.len(), 2);
        assert_eq!(
            snapshot.waiting.iter().map(|w| w.job_id.clone()).collect::<Vec<_>>(),
            vec![third.clone(), fourth]
        );

        d.handle_agent_message(
            a,
            AgentMessage::JobDone {
                job_id: first,
                report: GradingReport::synthesized(JobOutcome::Failed, ""),
            },
        )
        .await;
        assert_eq!(new_job_id(a_rx.recv().await.unwrap()), third);
    }

    #[tokio::test]
    async fn kill_waiting_and_running_jobs() {
        let d = Dispatcher::new();
        let (_a, mut a_rx) = agent(&d, "a1", 1, &["py"]).await;
        let (running, _r1) = submit(&d, "py").await;
        let (waiting, waiting_rx) = submit(&d, "py").await;
        a_rx.recv().await.unwrap();

        assert!(d.kill(&waiting).await);
        let result = waiting_rx.await.unwrap();
        assert_eq!(result.result, JobOutcome::Killed);

        assert!(d.kill(&running).await);
        assert_eq!(
            a_rx.recv().await.unwrap(),
            DispatcherMessage::KillJob { job_id: running }
        );

        assert!(!d.kill(&JobId::new("nope")).await);
    }

    #[tokio::test]
    async fn disconnect_crashes_jobs_exactly_once() {
        let d = Dispatcher::new();
        let (a, _a_rx) = agent(&d, "a1", 1, &["py"]).await;
        let (job_id, rx) = submit(&d, "py").await;
        let (_queued, queued_rx) = submit(&d, "py").await;

        d.agent_disconnected(a).await;
        let result = rx.await.unwrap();
        assert_eq!(result.result, JobOutcome::Crash);
        assert_eq!(result.text, "Agent disconnected");
        // The queued job has no agent left either.
        assert_eq!(queued_rx.await.unwrap().result, JobOutcome::Crash);

        // A late result is ignored; nothing is delivered twice.
        d.handle_agent_message(
            a,
            AgentMessage::JobDone {
                job_id,
                report: GradingReport::synthesized(JobOutcome::Success, ""),
            },
        )
        .await;
        d.agent_disconnected(a).await;
        assert_eq!(d.agent_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_job_id_is_rejected() {
        let d = Dispatcher::new();
        let (_a, _rx) = agent(&d, "a1", 1, &["py"]).await;
        let (cb1, _r1) = callback_channel();
        let (cb2, _r2) = callback_channel();
        let request = JobRequest::new("c", "t", "py").with_job_id("custom-1");
        d.submit(request.clone(), cb1).await.unwrap();
        let err = d.submit(request, cb2).await.unwrap_err();
        assert!(matches!(err, GradeGridError::DuplicateJob(_)));
    }

    #[tokio::test]
    async fn result_from_another_agent_is_ignored() {
        let d = Dispatcher::new();
        let (_a, _a_rx) = agent(&d, "a1", 1, &["py"]).await;
        let (b, _b_rx) = agent(&d, "b1", 0, &["py"]).await;
        let (job_id, mut rx) = submit(&d, "py").await;

        d.handle_agent_message(
            b,
            AgentMessage::JobDone {
                job_id,
                report: GradingReport::synthesized(JobOutcome::Success, ""),
            },
        )
        .await;
        assert!(rx.try_recv().is_err());
        assert_eq!(d.queue_snapshot().await.running.len(), 1);
    }

    #[tokio::test]
    async fn second_hello_replaces_registration() {
        let d = Dispatcher::new();
        let (a, mut a_rx) = agent(&d, "a1", 1, &["py"]).await;
        let (_job, rx) = submit(&d, "py").await;
        a_rx.recv().await.unwrap();

        d.handle_agent_message(
            a,
            AgentMessage::Hello {
                friendly_name: "a1".into(),
                slots: 2,
                environments: envs(&["py"]),
                batch_environments: BTreeMap::new(),
            },
        )
        .await;
        assert_eq!(rx.await.unwrap().text, "Agent restarted");
        assert_eq!(d.agent_count().await, 1);
    }

    #[tokio::test]
    async fn ssh_notice_goes_to_hook() {
        let d = Dispatcher::new();
        let (a, _a_rx) = agent(&d, "a1", 1, &["py"]).await;
        let (job_id, _rx) = submit(&d, "py").await;
        let (tx, mut seen) = mpsc::unbounded_channel();
        d.set_ssh_hook(Arc::new(move |info| {
            let _ = tx.send(info);
        }))
        .await;

        let info = SshDebugInfo {
            job_id,
            host: "worker1".into(),
            port: 2222,
            user: "worker".into(),
            key: "secret".into(),
        };
        d.handle_agent_message(a, AgentMessage::JobSshDebug { info: info.clone() })
            .await;
        assert_eq!(seen.recv().await, Some(info));
    }
}

use std::collections::{BTreeMap, HashSet};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ggd_types::{GradeGridError, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, warn};

use super::{
    AttachedStreams, ContainerLogs, ContainerSpec, ContainerStats, EventStream, NetworkMode,
    RuntimeEvent, SandboxRuntime, MANAGED_LABEL,
};
use crate::framing::{write_stream_chunk, STREAM_STDERR, STREAM_STDOUT};

const ATTACH_BUFFER: usize = 64 * 1024;
const START_POLL: Duration = Duration::from_millis(50);
const START_WAIT: Duration = Duration::from_secs(10);

/// Runtime adapter driving the `docker` command-line client.
pub struct DockerCliRuntime {
    docker_bin: String,
    environment_label: String,
    /// Containers whose attach process also starts them.
    attached: Mutex<HashSet<String>>,
}

impl DockerCliRuntime {
    pub fn new(docker_bin: impl Into<String>, environment_label: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            environment_label: environment_label.into(),
            attached: Mutex::new(HashSet::new()),
        }
    }

    /// Check if the docker daemon answers.
    pub async fn is_available(&self) -> bool {
        match Command::new(&self.docker_bin)
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    /// Current state string of a container (`created`, `running`, `exited`, ...).
    pub async fn container_state(&self, container_id: &str) -> Result<String> {
        let out = self
            .docker(&["inspect", "--format", "{{.State.Status}}", container_id])
            .await?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
        } else {
            Ok("not_found".to_string())
        }
    }

    async fn docker(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| GradeGridError::RuntimeUnavailable(format!("Failed to run docker: {e}")))
    }

    async fn docker_ok(&self, args: &[&str]) -> Result<String> {
        let out = self.docker(args).await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(GradeGridError::Container(format!(
                "docker {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }

    fn is_attached(&self, container_id: &str) -> bool {
        self.attached
            .lock()
            .map(|set| set.contains(container_id))
            .unwrap_or(false)
    }

    fn forget(&self, container_id: &str) {
        if let Ok(mut set) = self.attached.lock() {
            set.remove(container_id);
        }
    }
}

#[async_trait]
impl SandboxRuntime for DockerCliRuntime {
    async fn list_environments(&self) -> Result<BTreeMap<String, String>> {
        let filter = format!("label={}", self.environment_label);
        let ids = self
            .docker_ok(&["images", "--no-trunc", "--filter", &filter, "--format", "{{.ID}}"])
            .await?;

        let label_format = format!("{{{{index .Config.Labels \"{}\"}}}}", self.environment_label);
        let mut environments = BTreeMap::new();
        for id in ids.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let name = self
                .docker_ok(&["inspect", "--format", &label_format, id])
                .await?;
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            // Several tags may carry the same name; keep the first image seen.
            environments
                .entry(name.to_string())
                .or_insert_with(|| id.to_string());
        }
        debug!(count = environments.len(), "Grading environments discovered");
        Ok(environments)
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let args = build_create_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.docker_ok(&args).await?;
        let id = out.trim().to_string();
        if id.is_empty() {
            return Err(GradeGridError::Container(
                "docker create returned no container id".to_string(),
            ));
        }
        debug!(container_id = %id, name = %spec.name, "Container created");
        Ok(id)
    }

    async fn attach(&self, container_id: &str) -> Result<AttachedStreams> {
        let mut child = Command::new(&self.docker_bin)
            .args(["start", "--attach", "--interactive", container_id])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GradeGridError::RuntimeUnavailable(format!("Failed to spawn docker: {e}")))?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(i), Some(o), Some(e)) => (i, o, e),
            _ => {
                return Err(GradeGridError::Container(
                    "attach process has no stdio".to_string(),
                ))
            }
        };

        let (host_side, engine_side) = tokio::io::duplex(ATTACH_BUFFER);
        tokio::spawn(multiplex_output(stdout, stderr, engine_side, child));

        if let Ok(mut set) = self.attached.lock() {
            set.insert(container_id.to_string());
        }

        Ok(AttachedStreams {
            output: Box::new(host_side),
            input: Box::new(stdin),
        })
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        if !self.is_attached(container_id) {
            self.docker_ok(&["start", container_id]).await?;
            return Ok(());
        }

        // The attach process starts the container; wait until it has left `created`.
        let deadline = tokio::time::Instant::now() + START_WAIT;
        loop {
            let state = self.container_state(container_id).await?;
            if state != "created" {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GradeGridError::Container(format!(
                    "container {container_id} did not start"
                )));
            }
            tokio::time::sleep(START_POLL).await;
        }
    }

    async fn logs(&self, container_id: &str) -> Result<ContainerLogs> {
        let out = self.docker(&["logs", container_id]).await?;
        Ok(ContainerLogs {
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
        })
    }

    async fn stats(&self, container_id: &str) -> Result<ContainerStats> {
        let out = self
            .docker_ok(&["stats", "--no-stream", "--format", "{{.MemUsage}}", container_id])
            .await?;
        let memory_bytes = parse_mem_usage(out.trim()).ok_or_else(|| {
            GradeGridError::Container(format!("unreadable memory usage: {}", out.trim()))
        })?;
        Ok(ContainerStats { memory_bytes })
    }

    async fn kill(&self, container_id: &str) -> Result<()> {
        let out = self.docker(&["kill", container_id]).await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            if !is_gone(&stderr) {
                warn!(container_id, stderr = %stderr.trim(), "Container kill warning");
            }
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.forget(container_id);
        let out = self.docker(&["rm", "-f", container_id]).await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            if !is_gone(&stderr) {
                warn!(container_id, stderr = %stderr.trim(), "Container cleanup warning");
            }
        }
        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<String>> {
        let filter = format!("label={MANAGED_LABEL}=true");
        let out = self
            .docker_ok(&["ps", "--quiet", "--no-trunc", "--filter", &filter])
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn events(&self) -> Result<EventStream> {
        let label = format!("label={MANAGED_LABEL}=true");
        let mut child = Command::new(&self.docker_bin)
            .args([
                "events",
                "--filter",
                "type=container",
                "--filter",
                "event=die",
                "--filter",
                "event=oom",
                "--filter",
                &label,
                "--format",
                "{{json .}}",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GradeGridError::RuntimeUnavailable(format!("Failed to spawn docker: {e}")))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            GradeGridError::RuntimeUnavailable("docker events has no stdout".to_string())
        })?;
        let lines = BufReader::new(stdout).lines();

        let stream = futures::stream::unfold((lines, child), |(mut lines, child)| async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_event_line(&line) {
                            return Some((event, (lines, child)));
                        }
                    }
                    Ok(None) => return None,
                    Err(e) => {
                        warn!(error = %e, "docker events stream failed");
                        return None;
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Build `docker create` arguments (without the binary itself).
pub fn build_create_args(spec: &ContainerSpec) -> Vec<String> {
    let memory = format!("{}m", spec.memory_mb);
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--memory".to_string(),
        memory.clone(),
        "--memory-swap".to_string(),
        memory,
        "--network".to_string(),
        match &spec.network {
            NetworkMode::None => "none".to_string(),
            NetworkMode::Bridge => "bridge".to_string(),
            NetworkMode::Container(id) => format!("container:{id}"),
        },
    ];

    if spec.interactive {
        args.push("--interactive".to_string());
    }
    if !spec.run_as_root {
        args.push("--user".to_string());
        args.push("4242".to_string());
    }

    for mount in &spec.mounts {
        args.push("--volume".to_string());
        let mut bind = format!("{}:{}", mount.host.display(), mount.target);
        if mount.read_only {
            bind.push_str(":ro");
        }
        args.push(bind);
    }

    for (k, v) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{k}={v}"));
    }

    for (k, v) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{k}={v}"));
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Actor", default)]
    actor: RawActor,
}

#[derive(Deserialize, Default)]
struct RawActor {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: BTreeMap<String, String>,
}

/// Parse one `docker events --format '{{json .}}'` line.
pub fn parse_event_line(line: &str) -> Option<RuntimeEvent> {
    let raw: RawEvent = serde_json::from_str(line).ok()?;
    if raw.actor.id.is_empty() {
        return None;
    }
    match raw.action.as_str() {
        "die" => {
            let exit_code = raw
                .actor
                .attributes
                .get("exitCode")
                .and_then(|c| c.parse().ok())
                .unwrap_or(-1);
            Some(RuntimeEvent::Died {
                container_id: raw.actor.id,
                exit_code,
            })
        }
        "oom" => Some(RuntimeEvent::Oom {
            container_id: raw.actor.id,
        }),
        _ => None,
    }
}

/// Parse the used part of a `MemUsage` column such as `12.5MiB / 200MiB`.
pub fn parse_mem_usage(usage: &str) -> Option<u64> {
    let used = usage.split('/').next()?.trim();
    let split = used
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(used.len());
    let (number, unit) = used.split_at(split);
    let value: f64 = number.trim().parse().ok()?;
    let factor: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "kB" | "KB" => 1000.0,
        "MB" => 1_000_000.0,
        "GB" => 1_000_000_000.0,
        _ => return None,
    };
    Some((value * factor) as u64)
}

fn is_gone(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("is not running")
}

/// Re-multiplex the attach process's stdout/stderr into framed chunks.
async fn multiplex_output(
    mut stdout: ChildStdout,
    mut stderr: ChildStderr,
    mut sink: tokio::io::DuplexStream,
    mut child: Child,
) {
    let mut out_buf = vec![0u8; 8192];
    let mut err_buf = vec![0u8; 8192];
    let (mut out_open, mut err_open) = (true, true);

    while out_open || err_open {
        let written = tokio::select! {
            r = stdout.read(&mut out_buf), if out_open => match r {
                Ok(0) | Err(_) => { out_open = false; Ok(()) }
                Ok(n) => write_stream_chunk(&mut sink, STREAM_STDOUT, &out_buf[..n]).await,
            },
            r = stderr.read(&mut err_buf), if err_open => match r {
                Ok(0) | Err(_) => { err_open = false; Ok(()) }
                Ok(n) => write_stream_chunk(&mut sink, STREAM_STDERR, &err_buf[..n]).await,
            },
        };
        if written.is_err() {
            // Host side went away; stop forwarding.
            break;
        }
    }

    drop(sink);
    if let Err(e) = child.wait().await {
        debug!(error = %e, "attach process wait failed");
    }
}

use std::path::PathBuf;
use std::time::Duration;

use ggd_types::{GradeGridError, Result};
use tracing::debug;

/// Application configuration shared by the dispatcher and the agent.
#[derive(Debug, Clone)]
pub struct Config {
    pub debug: bool,

    // Paths
    pub base_dir: PathBuf,
    /// Task bundles, laid out as `{tasks_dir}/{course_id}/{task_id}`.
    pub tasks_dir: PathBuf,
    /// Root of the per-job working directories.
    pub tmp_dir: PathBuf,
    pub log_file: Option<PathBuf>,

    // Dispatcher
    pub dispatcher_bind: String,
    pub ping_interval_ms: u64,
    pub max_missed_pings: u32,
    pub max_frame_bytes: usize,

    // Agent
    pub agent_connect: String,
    pub agent_name: String,
    pub agent_slots: usize,
    pub backend_silence_secs: u64,
    pub reconnect_max_delay_secs: u64,
    pub worker_pool_size: usize,
    /// Per-slot memory ceiling in MB; requests above it are refused.
    pub slot_memory_mb: Option<u64>,
    pub kill_grace_secs: u64,
    pub consistency_check_secs: u64,
    pub ssh_time_limit_secs: u64,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,

    // Sandbox runtime
    pub docker_bin: String,
    pub environment_label: String,
    pub watcher_poll_ms: u64,
    pub memory_watcher: bool,

    // Logging
    pub log_level: String,
    pub log_structured: bool,
}

impl Config {
    /// Load configuration from environment variables (with dotenvy).
    pub fn load() -> Result<Self> {
        // .env is optional
        let _ = dotenvy::dotenv();

        let base_dir = env_or("BASE_DIR", || {
            std::env::current_dir()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string()
        });
        let base = PathBuf::from(&base_dir);

        let default_slots = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let config = Config {
            debug: env_bool("DEBUG", false),

            tasks_dir: env_path_or("TASKS_DIR", || base.join("tasks")),
            tmp_dir: env_path_or("AGENT_TMP_DIR", || base.join("tmp")),
            log_file: env_opt("LOG_FILE").map(PathBuf::from),
            base_dir: base,

            dispatcher_bind: env_or("DISPATCHER_BIND", || "0.0.0.0:2001".to_string()),
            ping_interval_ms: env_u64("PING_INTERVAL_MS", 1000),
            max_missed_pings: env_u32("MAX_MISSED_PINGS", 5),
            max_frame_bytes: env_usize("MAX_FRAME_BYTES", 16 * 1024 * 1024),

            agent_connect: env_or("AGENT_CONNECT", || "127.0.0.1:2001".to_string()),
            agent_name: env_or("AGENT_NAME", || "agent".to_string()),
            agent_slots: env_usize("AGENT_SLOTS", default_slots).max(1),
            backend_silence_secs: env_u64("BACKEND_SILENCE_SECS", 10),
            reconnect_max_delay_secs: env_u64("RECONNECT_MAX_DELAY_SECS", 30),
            worker_pool_size: env_usize("WORKER_POOL_SIZE", 4).max(1),
            slot_memory_mb: env_opt("SLOT_MEMORY_MB").and_then(|v| v.parse().ok()),
            kill_grace_secs: env_u64("KILL_GRACE_SECS", 5),
            consistency_check_secs: env_u64("CONSISTENCY_CHECK_SECS", 90),
            ssh_time_limit_secs: env_u64("SSH_TIME_LIMIT_SECS", 1800),
            ssh_host: env_or("SSH_HOST", || "localhost".to_string()),
            ssh_port: env_u16("SSH_PORT", 22),
            ssh_user: env_or("SSH_USER", || "worker".to_string()),

            docker_bin: env_or("DOCKER_BIN", || "docker".to_string()),
            environment_label: env_or("ENVIRONMENT_LABEL", || {
                "org.gradegrid.environment".to_string()
            }),
            watcher_poll_ms: env_u64("WATCHER_POLL_MS", 500),
            memory_watcher: env_bool("MEMORY_WATCHER", true),

            log_level: env_or("LOG_LEVEL", || "info".to_string()),
            log_structured: env_bool("LOG_STRUCTURED", false),
        };

        debug!(tasks_dir = %config.tasks_dir.display(), "Configuration loaded");
        Ok(config)
    }

    /// Create required directories.
    pub fn create_directories(&self) -> Result<()> {
        let mut dirs = vec![self.tasks_dir.clone(), self.tmp_dir.clone()];
        if let Some(parent) = self.log_file.as_ref().and_then(|f| f.parent()) {
            dirs.push(parent.to_path_buf());
        }

        for dir in &dirs {
            if dir.as_os_str().is_empty() {
                continue;
            }
            std::fs::create_dir_all(dir).map_err(|e| {
                GradeGridError::Config(format!(
                    "Failed to create directory {}: {e}",
                    dir.display()
                ))
            })?;
        }

        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn backend_silence(&self) -> Duration {
        Duration::from_secs(self.backend_silence_secs)
    }

    pub fn watcher_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watcher_poll_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn consistency_check_interval(&self) -> Duration {
        Duration::from_secs(self.consistency_check_secs)
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: impl FnOnce() -> String) -> String {
    std::env::var(key).unwrap_or_else(|_| default())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_path_or(key: &str, default: impl FnOnce() -> PathBuf) -> PathBuf {
    std::env::var(key)
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_load_defaults() {
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.max_missed_pings, 5);
        assert_eq!(cfg.consistency_check_secs, 90);
        assert_eq!(cfg.ssh_time_limit_secs, 1800);
        assert_eq!(cfg.environment_label, "org.gradegrid.environment");
        assert!(cfg.agent_slots >= 1);
        assert_eq!(cfg.ping_interval(), Duration::from_secs(1));
    }

    #[test]
    fn config_env_override() {
        std::env::set_var("WATCHER_POLL_MS", "125");
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.watcher_poll_interval(), Duration::from_millis(125));
        std::env::remove_var("WATCHER_POLL_MS");
    }

    #[test]
    fn config_slot_memory_is_optional() {
        std::env::set_var("SLOT_MEMORY_MB", "512");
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.slot_memory_mb, Some(512));
        std::env::remove_var("SLOT_MEMORY_MB");
    }

    #[test]
    fn config_create_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().to_path_buf();

        let mut cfg = Config::load().unwrap();
        cfg.base_dir = base.clone();
        cfg.tasks_dir = base.join("tasks");
        cfg.tmp_dir = base.join("tmp");
        cfg.log_file = Some(base.join("logs/ggd.log"));

        cfg.create_directories().unwrap();

        assert!(base.join("tasks").exists());
        assert!(base.join("tmp").exists());
        assert!(base.join("logs").exists());
    }
}

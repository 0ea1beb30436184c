//! Per-job working directories.
//!
//! Every job gets a fresh directory under the agent's tmp root:
//! 1. `task/` holds a copy of the task bundle
//! 2. `task/student/` is empty and writable by the student container
//! 3. `sockets/` carries the sockets between grader and student containers
//!
//! All functions here block; callers run them through the worker pool.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use ggd_types::{GradeGridError, Result};
use regex::Regex;
use tracing::{debug, info, warn};

fn id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_\-]+$").unwrap_or_else(|_| unreachable!()))
}

/// Check that an identifier is safe to use as a path component.
pub fn is_valid_id(id: &str) -> bool {
    id_pattern().is_match(id)
}

/// Same as [`is_valid_id`] but returns an error naming the offending value.
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    if is_valid_id(id) {
        Ok(())
    } else {
        Err(GradeGridError::InvalidId(format!("{kind} {id:?}")))
    }
}

/// Location of a task bundle, if it is present locally.
pub fn task_bundle_path(tasks_dir: &Path, course_id: &str, task_id: &str) -> Result<PathBuf> {
    validate_id("course", course_id)?;
    validate_id("task", task_id)?;
    let path = tasks_dir.join(course_id).join(task_id);
    if !path.is_dir() {
        return Err(GradeGridError::Workspace(format!(
            "task {course_id}/{task_id} is not available on this agent"
        )));
    }
    Ok(path)
}

/// Directories of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobWorkspace {
    pub root: PathBuf,
    pub task_dir: PathBuf,
    pub student_dir: PathBuf,
    pub sockets_dir: PathBuf,
}

impl JobWorkspace {
    /// Create the directory tree and copy the task bundle into `task/`.
    pub fn prepare(tmp_root: &Path, name: &str, bundle: &Path) -> Result<Self> {
        validate_id("workspace", name)?;
        let root = tmp_root.join(name);
        if root.exists() {
            return Err(GradeGridError::Workspace(format!(
                "working directory {} already exists",
                root.display()
            )));
        }

        let workspace = Self {
            task_dir: root.join("task"),
            student_dir: root.join("task").join("student"),
            sockets_dir: root.join("sockets"),
            root,
        };
        if let Err(e) = workspace.populate(bundle) {
            if let Err(cleanup) = remove_workspace(&workspace.root) {
                warn!(root = %workspace.root.display(), error = %cleanup, "Failed to clean up partial workspace");
            }
            return Err(e);
        }

        debug!(root = %workspace.root.display(), "Job workspace prepared");
        Ok(workspace)
    }

    fn populate(&self, bundle: &Path) -> Result<()> {
        copy_dir(bundle, &self.task_dir)?;
        for dir in [&self.student_dir, &self.sockets_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                GradeGridError::Workspace(format!("Failed to create {}: {e}", dir.display()))
            })?;
        }
        open_permissions(&self.student_dir)?;
        open_permissions(&self.sockets_dir)
    }

    /// Socket directory handed to one student container.
    pub fn socket_dir(&self, socket_id: &str) -> Result<PathBuf> {
        validate_id("socket", socket_id)?;
        let dir = self.sockets_dir.join(socket_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| GradeGridError::Workspace(format!("Failed to create socket dir: {e}")))?;
        open_permissions(&dir)?;
        Ok(dir)
    }
}

/// Delete a job directory; a missing directory is not an error.
pub fn remove_workspace(root: &Path) -> Result<()> {
    match std::fs::remove_dir_all(root) {
        Ok(()) => {
            info!(root = %root.display(), "Job workspace removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GradeGridError::Workspace(format!(
            "Failed to remove {}: {e}",
            root.display()
        ))),
    }
}

/// Recursively copy `src` into a new directory `dst`. Symlinks are skipped.
fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)
        .map_err(|e| GradeGridError::Workspace(format!("Failed to create {}: {e}", dst.display())))?;
    let entries = std::fs::read_dir(src)
        .map_err(|e| GradeGridError::Workspace(format!("Failed to read {}: {e}", src.display())))?;

    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target).map_err(|e| {
                GradeGridError::Workspace(format!(
                    "Failed to copy {}: {e}",
                    entry.path().display()
                ))
            })?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn open_permissions(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777))?;
    Ok(())
}

#[cfg(not(unix))]
fn open_permissions(_dir: &Path) -> Result<()> {
    Ok(())
}

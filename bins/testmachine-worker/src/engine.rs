/// Execution Engine - Abstraction for Running a Test Suite
///
/// **Core Responsibility:**
/// Run a task's test suite against its unit under test and report what happened.
///
/// **Critical Architectural Boundary:**
/// - Engines know HOW to execute (local child process, Docker container)
/// - Engines do NOT build wire results; they return an `ExecutionOutcome`
/// - Engines never let an error escape: every failure becomes a tagged outcome
/// - The evaluator turns outcomes into results (evaluator.rs)
///
/// Both engines share the `Workspace`: one exclusive temporary directory per
/// execution holding exactly the two source files, removed before the
/// outcome is returned.

use async_trait::async_trait;
use std::io;
use std::path::Path;
use tempfile::TempDir;
use testmachine_common::config::{CLASS_FILENAME, TEST_FILENAME};
use testmachine_common::types::Task;
use tracing::{debug, warn};

const WORKSPACE_PREFIX: &str = "testmachine-";

/// What happened to one execution, independent of strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The test runner ran to completion and exited with this code
    Completed { exit_code: i64, logs: String },
    /// The wall-clock budget ran out and the guest was forcibly stopped
    TimedOut { logs: String },
    /// The worker could not run the suite at all (I/O, missing tool, daemon error)
    InfrastructureFailed { reason: String },
}

impl ExecutionOutcome {
    pub fn infrastructure(reason: impl std::fmt::Display) -> Self {
        ExecutionOutcome::InfrastructureFailed {
            reason: reason.to_string(),
        }
    }

    /// Short label for log fields
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed { exit_code: 0, .. } => "passed",
            ExecutionOutcome::Completed { .. } => "failed",
            ExecutionOutcome::TimedOut { .. } => "timed_out",
            ExecutionOutcome::InfrastructureFailed { .. } => "infrastructure_error",
        }
    }
}

/// An execution strategy
#[async_trait]
pub trait Executor: Send + Sync {
    /// Human-readable strategy name, used in log fields
    fn name(&self) -> &'static str;

    async fn execute(&self, task: &Task) -> ExecutionOutcome;
}

/// Join captured output the same way for every strategy
pub fn combine_logs(stdout: &str, stderr: &str) -> String {
    format!("{}\n{}", stdout, stderr)
}

/// Exclusive per-execution directory holding the unit under test and its suite
///
/// The directory is removed by `close`, or on drop if `close` was never reached.
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create the directory (under `root` if given, else the system temp dir)
    /// and write both source files into it
    pub fn create(root: Option<&Path>, task: &Task) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORKSPACE_PREFIX);
        let dir = match root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };

        std::fs::write(dir.path().join(CLASS_FILENAME), &task.class_code)?;
        std::fs::write(dir.path().join(TEST_FILENAME), &task.test_code)?;

        debug!(workspace = %dir.path().display(), "Workspace ready");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the directory and everything in it, logging failures
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!(workspace = %path.display(), "Workspace removed"),
            Err(e) => warn!(workspace = %path.display(), error = %e, "Failed to remove workspace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testmachine_common::types::ExecutionMode;

    fn task() -> Task {
        Task {
            class_code: "class A:\n    pass\n".to_string(),
            test_code: "from class_to_test import A\n".to_string(),
            mode: ExecutionMode::Local,
        }
    }

    #[test]
    fn test_workspace_holds_exactly_two_files() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(Some(root.path()), &task()).unwrap();

        let mut names: Vec<String> = std::fs::read_dir(workspace.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["class_to_test.py", "test_class.py"]);

        let class_source = std::fs::read_to_string(workspace.path().join("class_to_test.py")).unwrap();
        assert_eq!(class_source, "class A:\n    pass\n");
    }

    #[test]
    fn test_workspace_removed_on_close() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(Some(root.path()), &task()).unwrap();
        let path = workspace.path().to_path_buf();
        assert!(path.exists());

        workspace.close();
        assert!(!path.exists());
    }

    #[test]
    fn test_workspace_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let workspace = Workspace::create(Some(root.path()), &task()).unwrap();
            workspace.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_workspaces_are_exclusive() {
        let root = tempfile::tempdir().unwrap();
        let a = Workspace::create(Some(root.path()), &task()).unwrap();
        let b = Workspace::create(Some(root.path()), &task()).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_outcome_labels() {
        let passed = ExecutionOutcome::Completed { exit_code: 0, logs: String::new() };
        let failed = ExecutionOutcome::Completed { exit_code: 2, logs: String::new() };
        assert_eq!(passed.label(), "passed");
        assert_eq!(failed.label(), "failed");
        assert_eq!(ExecutionOutcome::TimedOut { logs: String::new() }.label(), "timed_out");
        assert_eq!(ExecutionOutcome::infrastructure("x").label(), "infrastructure_error");
    }

    #[test]
    fn test_combine_logs() {
        assert_eq!(combine_logs("out", "err"), "out\nerr");
    }
}

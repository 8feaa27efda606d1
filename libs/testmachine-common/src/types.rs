use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::{INTERNAL_ERROR_EXIT_CODE, TIMEOUT_EXIT_CODE, WORKER_ROLE};

/// Execution strategy requested by a task
///
/// Anything other than `docker` (including a missing field) runs locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Docker,
    // Catch-all must stay the last variant
    #[default]
    #[serde(other)]
    Local,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Local => write!(f, "local"),
            ExecutionMode::Docker => write!(f, "docker"),
        }
    }
}

/// One inbound request: a unit under test plus the suite exercising it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub class_code: String,
    pub test_code: String,
    #[serde(default)]
    pub mode: ExecutionMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Success,
    Failure,
    Error,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStatus::Success => write!(f, "SUCCESS"),
            TestStatus::Failure => write!(f, "FAILURE"),
            TestStatus::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("status {status} cannot be reported with exit code {exit_code}")]
pub struct ResultInvariantError {
    pub status: TestStatus,
    pub exit_code: i64,
}

/// Outcome of a single execution, as sent back to the dispatcher
///
/// `status == SUCCESS` if and only if `exit_code == 0`. Fields are private so
/// every constructor (and deserialisation) goes through that check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTestResult")]
pub struct TestResult {
    status: TestStatus,
    exit_code: i64,
    logs: String,
}

#[derive(Deserialize)]
struct RawTestResult {
    status: TestStatus,
    exit_code: i64,
    #[serde(default)]
    logs: String,
}

impl TryFrom<RawTestResult> for TestResult {
    type Error = ResultInvariantError;

    fn try_from(raw: RawTestResult) -> Result<Self, Self::Error> {
        TestResult::new(raw.status, raw.exit_code, raw.logs)
    }
}

impl TestResult {
    pub fn new(
        status: TestStatus,
        exit_code: i64,
        logs: impl Into<String>,
    ) -> Result<Self, ResultInvariantError> {
        if (status == TestStatus::Success) != (exit_code == 0) {
            return Err(ResultInvariantError { status, exit_code });
        }
        Ok(Self {
            status,
            exit_code,
            logs: logs.into(),
        })
    }

    /// Map a test runner's exit code: zero passes, anything else fails verbatim
    pub fn from_exit_code(exit_code: i64, logs: impl Into<String>) -> Self {
        let status = if exit_code == 0 {
            TestStatus::Success
        } else {
            TestStatus::Failure
        };
        Self {
            status,
            exit_code,
            logs: logs.into(),
        }
    }

    pub fn timeout(logs: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Failure,
            exit_code: TIMEOUT_EXIT_CODE,
            logs: logs.into(),
        }
    }

    pub fn internal_error(logs: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Error,
            exit_code: INTERNAL_ERROR_EXIT_CODE,
            logs: logs.into(),
        }
    }

    pub fn status(&self) -> TestStatus {
        self.status
    }

    pub fn exit_code(&self) -> i64 {
        self.exit_code
    }

    pub fn logs(&self) -> &str {
        &self.logs
    }

    pub fn is_success(&self) -> bool {
        self.status == TestStatus::Success
    }
}

/// First message on every connection, identifying this worker's role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub role: String,
}

impl Handshake {
    pub fn worker() -> Self {
        Self {
            role: WORKER_ROLE.to_string(),
        }
    }
}

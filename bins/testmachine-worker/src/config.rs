// Worker configuration, read once at startup and passed down explicitly
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use testmachine_common::config::{DEFAULT_RECONNECT_DELAY_SECS, DEFAULT_TEST_TIMEOUT_SECS};

const DEFAULT_SERVER_URL: &str = "ws://localhost:8765";
const DEFAULT_HEALTH_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_BASE_IMAGE: &str = "python:3.11-slim";
const DEFAULT_LOCAL_TEST_COMMAND: &str = "pytest";
const DEFAULT_MAX_CONCURRENT_EXECUTIONS: usize = 4;
const DEFAULT_MEMORY_LIMIT_MB: u32 = 256;
const DEFAULT_CPU_LIMIT: f32 = 0.5;

/// Resource limits and image settings for container-mode executions
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSettings {
    pub base_image: String,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
}

impl ContainerSettings {
    pub fn memory_limit_bytes(&self) -> i64 {
        (self.memory_limit_mb as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit * 1_000_000_000.0) as i64
    }
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            cpu_limit: DEFAULT_CPU_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Dispatcher endpoint
    pub server_url: String,
    /// Wall-clock budget for one execution
    pub test_timeout: Duration,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay: Duration,
    /// Upper bound on executions running at the same time
    pub max_concurrent_executions: usize,
    pub health_addr: SocketAddr,
    /// Program and leading arguments for local runs; the test file is appended
    pub local_test_command: Vec<String>,
    pub container: ContainerSettings,
}

impl WorkerConfig {
    /// Load from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup; unset variables fall back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server_url = lookup("WS_SERVER_URL").unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        // TLS is terminated in front of the worker; only plain ws:// is dialed
        if !server_url.starts_with("ws://") {
            bail!("WS_SERVER_URL must be a ws:// URL, got '{}'", server_url);
        }

        let timeout_secs: u64 = parse_var(&lookup, "TEST_TIMEOUT_SECONDS", DEFAULT_TEST_TIMEOUT_SECS)?;
        if timeout_secs == 0 {
            bail!("TEST_TIMEOUT_SECONDS must be greater than zero");
        }

        let reconnect_secs: u64 =
            parse_var(&lookup, "RECONNECT_DELAY_SECONDS", DEFAULT_RECONNECT_DELAY_SECS)?;
        if reconnect_secs == 0 {
            bail!("RECONNECT_DELAY_SECONDS must be greater than zero");
        }

        let max_concurrent_executions: usize = parse_var(
            &lookup,
            "MAX_CONCURRENT_EXECUTIONS",
            DEFAULT_MAX_CONCURRENT_EXECUTIONS,
        )?;
        if max_concurrent_executions == 0 {
            bail!("MAX_CONCURRENT_EXECUTIONS must be at least 1");
        }

        let health_addr = lookup("HEALTH_ADDR").unwrap_or_else(|| DEFAULT_HEALTH_ADDR.to_string());
        let health_addr: SocketAddr = health_addr
            .parse()
            .with_context(|| format!("Invalid HEALTH_ADDR '{}'", health_addr))?;

        let local_test_command: Vec<String> = lookup("LOCAL_TEST_COMMAND")
            .unwrap_or_else(|| DEFAULT_LOCAL_TEST_COMMAND.to_string())
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if local_test_command.is_empty() {
            bail!("LOCAL_TEST_COMMAND must not be empty");
        }

        let container = ContainerSettings {
            base_image: lookup("DOCKER_BASE_IMAGE").unwrap_or_else(|| DEFAULT_BASE_IMAGE.to_string()),
            memory_limit_mb: parse_var(&lookup, "CONTAINER_MEMORY_MB", DEFAULT_MEMORY_LIMIT_MB)?,
            cpu_limit: parse_var(&lookup, "CONTAINER_CPU_LIMIT", DEFAULT_CPU_LIMIT)?,
        };
        if container.cpu_limit <= 0.0 {
            bail!("CONTAINER_CPU_LIMIT must be positive");
        }

        Ok(Self {
            server_url,
            test_timeout: Duration::from_secs(timeout_secs),
            reconnect_delay: Duration::from_secs(reconnect_secs),
            max_concurrent_executions,
            health_addr,
            local_test_command,
            container,
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: '{}'", key, raw)),
        None => Ok(default),
    }
}

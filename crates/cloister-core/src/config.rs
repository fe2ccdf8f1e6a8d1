//! Sandbox configuration types.

use crate::error::CoreError;
use crate::protocol::RequiredModule;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

/// Argument that switches a cloister binary into worker mode.
pub const WORKER_ARG: &str = "worker";

/// Default watchdog for a sandbox.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    /// Executable to spawn.
    pub program: PathBuf,
    /// Arguments passed to it.
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// Run `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Run a cloister binary in worker mode.
    pub fn worker(program: impl Into<PathBuf>) -> Self {
        Self::new(program).arg(WORKER_ARG)
    }

    /// The running executable, switched into worker mode.
    pub fn current_exe() -> Result<Self, CoreError> {
        let exe = std::env::current_exe()
            .map_err(|e| CoreError::Config(format!("cannot locate current executable: {e}")))?;
        Ok(Self::worker(exe))
    }
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self::current_exe().unwrap_or_else(|_| Self::worker("cloister-agent"))
    }
}

/// Configuration for a sandbox controller.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Worker process to spawn for every run.
    pub worker: WorkerCommand,
    /// Hard wall-clock limit; the worker is killed when it expires.
    pub timeout: Duration,
    /// Modules the worker loads before running the snippet.
    pub require: Vec<RequiredModule>,
    /// Globals injected into the snippet scope.
    pub globals: Map<String, Value>,
    /// Ask the worker for an `introspect` event.
    pub introspect: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            worker: WorkerCommand::default(),
            timeout: DEFAULT_TIMEOUT,
            require: Vec::new(),
            globals: Map::new(),
            introspect: false,
        }
    }
}

impl SandboxConfig {
    /// Create a new config builder.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Defaults overlaid with environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `CLOISTER_WORKER_BIN` | current executable |
    /// | `CLOISTER_TIMEOUT_SECS` | `60` |
    ///
    /// The worker binary is always invoked with the `worker` argument.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            worker: std::env::var("CLOISTER_WORKER_BIN")
                .map(WorkerCommand::worker)
                .unwrap_or(default.worker),
            timeout: std::env::var("CLOISTER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.timeout),
            ..default
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.worker.program.as_os_str().is_empty() {
            return Err(CoreError::Config("worker program is required".into()));
        }
        if self.timeout.is_zero() {
            return Err(CoreError::Config("timeout must be > 0".into()));
        }
        if let Some(r) = self.require.iter().find(|r| r.module.is_empty()) {
            return Err(CoreError::InvalidModule(r.module.clone()));
        }
        Ok(())
    }
}

/// Builder for SandboxConfig.
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    /// Set the worker command.
    pub fn worker(mut self, worker: WorkerCommand) -> Self {
        self.config.worker = worker;
        self
    }

    /// Set the watchdog timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Require a module.
    pub fn require(mut self, module: RequiredModule) -> Self {
        self.config.require.push(module);
        self
    }

    /// Bind a global value.
    pub fn global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.config.globals.insert(name.into(), value);
        self
    }

    /// Request introspection of loaded modules.
    pub fn introspect(mut self, introspect: bool) -> Self {
        self.config.introspect = introspect;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<SandboxConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

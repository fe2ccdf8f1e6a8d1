//! Stub - call a sandboxed module's methods as if they were local.
//!
//! A stub owns one [`Sandbox`] for one logical module. Each invoke builds a
//! snippet that decodes the JSON arguments inside the worker, calls the
//! named method on the module, and hands back whatever it returns (the
//! worker waits on pending values itself). Exactly one of `result`,
//! `exception` or the watchdog settles the call.

use crate::cache::ModuleCache;
use crate::config::SandboxConfig;
use crate::error::{CoreError, Result};
use crate::handler::EventHandler;
use crate::protocol::{module_key, Exception, ExitStatus, Notice, RequiredModule};
use crate::sandbox::Sandbox;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default watchdog for stub invocations.
pub const DEFAULT_STUB_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Host-side facade for one sandboxed module.
pub struct Stub {
    module: String,
    sandbox: Sandbox,
}

impl Stub {
    /// Stub for `module` with environment defaults and a two minute timeout.
    pub fn new(module: impl Into<String>) -> Result<Self> {
        let config = SandboxConfig {
            timeout: DEFAULT_STUB_TIMEOUT,
            ..SandboxConfig::from_env()
        };
        Self::with_config(module, config, ModuleCache::shared())
    }

    /// Stub for `module` on top of an explicit sandbox configuration.
    ///
    /// The module is appended to `config.require` with empty options, so it
    /// is always constructed with cache hooks.
    pub fn with_config(
        module: impl Into<String>,
        mut config: SandboxConfig,
        cache: ModuleCache,
    ) -> Result<Self> {
        let module = module.into();
        if !is_identifier(module_key(&module)) {
            return Err(CoreError::InvalidModule(module));
        }
        if !config.require.iter().any(|r| r.module == module) {
            config
                .require
                .push(RequiredModule::with_options(module.clone(), Map::new()));
        }
        config.validate()?;

        tracing::debug!(module = %module, timeout_ms = config.timeout.as_millis() as u64, "Creating stub");
        Ok(Self {
            module,
            sandbox: Sandbox::with_cache(config, cache),
        })
    }

    /// Module reference this stub calls into.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// The sandbox backing this stub.
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Snippet that calls `method` on the module with `args`.
    ///
    /// The call is wrapped in `Promise.resolve`, so a method that returns
    /// `null` still settles the run instead of waiting for `_callback`.
    pub fn snippet(&self, method: &str, args: &[Value]) -> Result<String> {
        if !is_identifier(method) {
            return Err(CoreError::Execution {
                name: "TypeError".into(),
                message: format!("Invalid parameter value verb - [{method}]!"),
            });
        }
        let encoded = serde_json::to_string(args)?;
        let literal = serde_json::to_string(&encoded)?;
        Ok(format!(
            "let args = JSON.parse({literal});\nPromise.resolve({}.{method}(...args))",
            module_key(&self.module)
        ))
    }

    /// Run `method(args)` in a fresh worker and wait for its outcome.
    ///
    /// Returns after the worker has exited, so sequential invokes on one
    /// stub never overlap. A concurrent invoke fails with
    /// [`CoreError::AlreadyRunning`].
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let script = self.snippet(method, &args)?;
        let outcome = Arc::new(Mutex::new(None));
        let handler = StubHandler {
            module: self.module.clone(),
            timeout: self.sandbox.config().timeout,
            outcome: Arc::clone(&outcome),
        };

        tracing::debug!(module = %self.module, method = %method, args = args.len(), "Invoking sandboxed method");
        let summary = self.sandbox.run(script, handler)?.wait().await?;

        let settled = outcome.lock().unwrap_or_else(|e| e.into_inner()).take();
        match settled {
            Some(result) => result,
            None => Err(CoreError::NoResult(summary.exit_code)),
        }
    }

    /// Like [`invoke`](Self::invoke), deserializing the outcome.
    ///
    /// A string result is parsed as JSON first when it holds valid JSON.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T> {
        let value = match self.invoke(method, args).await? {
            Value::String(text) => match serde_json::from_str::<Value>(&text) {
                Ok(parsed) => parsed,
                Err(_) => Value::String(text),
            },
            other => other,
        };
        Ok(serde_json::from_value(value)?)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Turns the first terminal event of a run into the invoke's outcome.
struct StubHandler {
    module: String,
    timeout: Duration,
    outcome: Arc<Mutex<Option<Result<Value>>>>,
}

impl StubHandler {
    fn settle(&self, result: Result<Value>) {
        let mut slot = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(result);
        } else {
            tracing::debug!(module = %self.module, "Ignoring event after call settled");
        }
    }
}

impl EventHandler for StubHandler {
    fn on_console(&mut self, value: Value) {
        tracing::debug!(module = %self.module, %value, "[console]");
    }

    fn on_print(&mut self, value: Value) {
        tracing::debug!(module = %self.module, %value, "[print]");
    }

    fn on_waiting(&mut self, notice: Notice) {
        tracing::debug!(module = %self.module, message = %notice.message, "[waiting]");
    }

    fn on_result(&mut self, value: Value) {
        self.settle(Ok(value));
    }

    fn on_exception(&mut self, exception: Exception) {
        tracing::error!(module = %self.module, %exception, "[exception]");
        self.settle(Err(CoreError::Execution {
            name: exception.name,
            message: exception.message,
        }));
    }

    fn on_timeout(&mut self, message: String) {
        tracing::error!(module = %self.module, %message, "[timeout]");
        self.settle(Err(CoreError::Timeout(self.timeout)));
    }

    fn on_exit(&mut self, status: ExitStatus) {
        tracing::debug!(module = %self.module, code = status.code, "[exit]");
    }
}

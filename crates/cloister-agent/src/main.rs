//! cloister-agent: worker runtime and host CLI for cloister sandboxes.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use cloister_agent::emitter::Emitter;
use cloister_agent::introspect::describe_all;
use cloister_agent::store::CacheStore;
use cloister_agent::{ModuleRegistry, Worker};
use cloister_core::{
    EventHandler, Exception, ExitStatus, LoggingHandler, ModuleCache, Notice, RequiredModule,
    Sandbox, SandboxConfig, Stub, DEFAULT_STUB_TIMEOUT,
};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Default log directives when `RUST_LOG` is unset.
const DEFAULT_LOG: &str = "cloister_core=info,cloister_agent=info";

#[derive(Parser)]
#[command(name = "cloister-agent", version, about = "Run snippets in isolated worker processes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve one request on stdin/stdout. Spawned by the host.
    Worker,

    /// Run a snippet in a fresh worker and print its output.
    Run {
        /// Snippet source.
        script: String,

        /// Module to load before the snippet runs (repeatable).
        #[arg(short, long = "require")]
        require: Vec<String>,

        /// Build required modules with empty options, which grants cache hooks.
        #[arg(long)]
        with_options: bool,

        /// Global binding as NAME=JSON (repeatable).
        #[arg(short, long = "global", value_parser = parse_global)]
        global: Vec<(String, Value)>,

        /// Emit the method shapes of loaded modules.
        #[arg(long)]
        introspect: bool,

        /// Watchdog timeout in seconds.
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Call one module method through a stub and print the result.
    Invoke {
        /// Module reference, e.g. `echo` or `./ipc_modules/echo`.
        module: String,

        /// Method name.
        method: String,

        /// Arguments, each parsed as JSON (bare words become strings).
        args: Vec<String>,

        /// Watchdog timeout in seconds.
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// List the modules in the capability table with their methods.
    Modules,
}

fn parse_global(s: &str) -> Result<(String, Value), String> {
    let (name, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=JSON, got {s:?}"))?;
    if name.is_empty() {
        return Err("global name must not be empty".into());
    }
    Ok((name.to_string(), parse_json_arg(raw)))
}

fn parse_json_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG));
    // stdout carries frames in worker mode, so logs always go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Worker => {
            debug!(pid = std::process::id(), "worker starting");
            let code = Worker::builtin()
                .run(tokio::io::stdin(), tokio::io::stdout())
                .await;
            // Exit directly: a pending stdin read would otherwise hold up runtime shutdown.
            std::process::exit(code);
        }
        Command::Run {
            script,
            require,
            with_options,
            global,
            introspect,
            timeout,
        } => {
            let mut config = SandboxConfig::from_env();
            if let Some(secs) = timeout {
                config.timeout = Duration::from_secs(secs);
            }
            config.require = require
                .into_iter()
                .map(|module| {
                    if with_options {
                        RequiredModule::with_options(module, Map::new())
                    } else {
                        RequiredModule::new(module)
                    }
                })
                .collect();
            config.globals = global.into_iter().collect();
            config.introspect = introspect;
            config.validate()?;

            let sandbox = Sandbox::new(config);
            info!(sandbox_id = %sandbox.id(), "running snippet");
            let failed = Arc::new(AtomicBool::new(false));
            let handler = CliHandler {
                log: LoggingHandler::labelled(sandbox.id().to_string()),
                failed: Arc::clone(&failed),
            };
            let summary = sandbox
                .run(script, handler)
                .context("failed to start worker")?
                .wait()
                .await?;
            info!(
                exit_code = summary.exit_code,
                timed_out = summary.timed_out,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "snippet finished"
            );
            if failed.load(Ordering::Acquire) {
                std::process::exit(1);
            }
        }
        Command::Invoke {
            module,
            method,
            args,
            timeout,
        } => {
            let mut config = SandboxConfig::from_env();
            config.timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_STUB_TIMEOUT);
            let stub = Stub::with_config(module, config, ModuleCache::shared())?;
            let args = args.iter().map(|raw| parse_json_arg(raw)).collect();
            let value = stub
                .invoke(&method, args)
                .await
                .with_context(|| format!("{}.{method} failed", stub.module()))?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Command::Modules => {
            let registry = ModuleRegistry::builtin();
            let (emitter, _writer) = Emitter::spawn(tokio::io::sink());
            let store = CacheStore::new();
            let mut loaded = Vec::new();
            for name in registry.names() {
                let module = registry
                    .load(&RequiredModule::new(name), &store, &emitter)
                    .map_err(|fault| anyhow::anyhow!(fault))?;
                loaded.push((module.name, module.module));
            }
            if loaded.is_empty() {
                bail!("capability table is empty");
            }
            println!("{}", serde_json::to_string_pretty(&describe_all(&loaded))?);
        }
    }

    Ok(())
}

/// Prints snippet output to the terminal and logs every event.
struct CliHandler {
    log: LoggingHandler,
    failed: Arc<AtomicBool>,
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl EventHandler for CliHandler {
    fn on_trace(&mut self, notice: Notice) {
        self.log.on_trace(notice);
    }

    fn on_console(&mut self, value: Value) {
        println!("{}", display(&value));
        self.log.on_console(value);
    }

    fn on_print(&mut self, value: Value) {
        println!("{}", display(&value));
        self.log.on_print(value);
    }

    fn on_introspect(&mut self, shape: Map<String, Value>) {
        match serde_json::to_string_pretty(&shape) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("introspect: {e}"),
        }
        self.log.on_introspect(shape);
    }

    fn on_waiting(&mut self, notice: Notice) {
        eprintln!("{}", notice.message);
        self.log.on_waiting(notice);
    }

    fn on_result(&mut self, value: Value) {
        match serde_json::to_string_pretty(&value) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("result: {e}"),
        }
        self.log.on_result(value);
    }

    fn on_exception(&mut self, exception: Exception) {
        self.failed.store(true, Ordering::Release);
        eprintln!("{exception}");
        if let Some(stack) = &exception.stack {
            eprintln!("{stack}");
        }
        self.log.on_exception(exception);
    }

    fn on_timeout(&mut self, message: String) {
        self.failed.store(true, Ordering::Release);
        eprintln!("{message}");
        self.log.on_timeout(message);
    }

    fn on_exit(&mut self, status: ExitStatus) {
        self.log.on_exit(status);
    }
}

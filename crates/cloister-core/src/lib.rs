//! # cloister-core
//!
//! Host side of the cloister process sandbox.
//!
//! A [`Sandbox`] spawns a short-lived worker process for every run, writes
//! a single JSON request to its stdin, and streams the comma-framed events
//! the worker writes to stdout back into an [`EventHandler`]. A watchdog
//! kills the worker when its wall-clock budget runs out.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  cloister-core (host)                    │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │      Stub       │────▶│  Sandbox                 │   │
//! │  │  - invoke()     │     │   - run()                │   │
//! │  │  - call()       │     │   - reset_timer()        │   │
//! │  └─────────────────┘     └──────────────────────────┘   │
//! │                                     │                    │
//! │  ┌─────────────────┐                │ stdin: request     │
//! │  │  ModuleCache    │◀── cache.save ─┤ stdout: frames     │
//! │  └─────────────────┘                ▼                    │
//! │                          ┌──────────────────────────┐   │
//! │                          │  FrameDecoder            │   │
//! │                          │   -> EventHandler        │   │
//! │                          └──────────────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │             cloister-agent worker (child)                │
//! │        capability table + snippet interpreter            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use cloister_core::{LoggingHandler, RequiredModule, Sandbox, SandboxConfig, Stub};
//! use serde_json::json;
//!
//! # async fn example() -> cloister_core::Result<()> {
//! // Run a snippet against a loaded module
//! let config = SandboxConfig::builder()
//!     .require(RequiredModule::new("echo"))
//!     .global("greeting", json!("hello"))
//!     .build()?;
//! let sandbox = Sandbox::new(config);
//! let summary = sandbox
//!     .run("echo.echo(greeting)", LoggingHandler::labelled("echo"))?
//!     .wait()
//!     .await?;
//! println!("exit code: {}", summary.exit_code);
//!
//! // Or call a module method directly
//! let stub = Stub::new("echo")?;
//! let value = stub.invoke("echo", vec![json!("hi")]).await?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod config;
mod error;
mod handler;
mod sandbox;
mod stub;

pub mod codec;
pub mod protocol;

pub use cache::ModuleCache;
pub use config::{SandboxConfig, SandboxConfigBuilder, WorkerCommand, DEFAULT_TIMEOUT, WORKER_ARG};
pub use error::{CoreError, Result};
pub use handler::{EventHandler, LoggingHandler};
pub use protocol::{
    CacheEntry, Event, Exception, ExitStatus, Notice, Request, RequiredModule, BLOCKED_MODULES,
};
pub use sandbox::{RunHandle, RunSummary, Sandbox, SandboxId, SandboxState};
pub use stub::{Stub, DEFAULT_STUB_TIMEOUT};

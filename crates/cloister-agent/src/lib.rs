//! # cloister-agent
//!
//! Worker side of the cloister sandbox, plus the host CLI.
//!
//! The `cloister-agent` binary spawns itself with the `worker` argument for
//! every run. In that mode it reads one request from stdin and answers on
//! stdout with comma-framed events, exposing only the modules of its
//! [`ModuleRegistry`] to the snippet.
//!
//! ```text
//! stdin ──▶ read_request ──▶ CacheStore::merge ──▶ ModuleRegistry::load
//!                                                          │
//!                         Interpreter::run(Script) ◀───────┘
//!                                  │
//!           _callback / result / pending ──▶ Gate ──▶ result | exception
//!                                  │
//!           Console / CacheHandle ─┴──▶ Emitter ──▶ stdout ──▶ exit
//! ```

pub mod emitter;
pub mod fault;
pub mod gate;
pub mod introspect;
pub mod modules;
pub mod runtime;
pub mod script;
pub mod store;

pub use fault::Fault;
pub use modules::{Invocation, LoadedModule, Module, ModuleContext, ModuleRegistry};
pub use runtime::{Worker, WorkerConfig};
pub use script::{Eval, Interpreter, Script};

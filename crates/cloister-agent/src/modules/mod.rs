//! Capability table: the only modules a snippet can reach.
//!
//! A `require` entry never loads code. Its reference is checked against the
//! fixed denylist, stripped to a basename, and looked up in a
//! [`ModuleRegistry`] of factories compiled into the worker. Anything absent
//! from the registry does not exist as far as a snippet is concerned.

mod counter;
mod echo;

pub use counter::Counter;
pub use echo::Echo;

use crate::emitter::{Console, Emitter};
use crate::fault::Fault;
use crate::introspect::{has_method, Shape};
use crate::store::{CacheHandle, CacheStore};
use async_trait::async_trait;
use cloister_core::protocol::{blocked_reason, module_key};
use cloister_core::RequiredModule;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// A value that settles later.
pub type PendingValue = BoxFuture<'static, Result<Value, Fault>>;

/// What a method call hands back to the snippet.
pub enum Invocation {
    /// Available now.
    Ready(Value),
    /// Settles later; the runtime waits for it.
    Pending(PendingValue),
}

impl Invocation {
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, Fault>> + Send + 'static,
    {
        Self::Pending(future.boxed())
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Self::Pending(_) => f.write_str("Pending"),
        }
    }
}

/// A capability exposed to snippets.
#[async_trait]
pub trait Module: Send + Sync {
    /// Method names, for introspection and dispatch checks.
    fn describe(&self) -> Shape;

    /// Call `method`. Grouped methods are addressed as `group.method`.
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Invocation, Fault>;

    fn has_method(&self, method: &str) -> bool {
        let path: Vec<&str> = method.split('.').collect();
        has_method(&self.describe(), &path)
    }
}

/// Everything a module receives when it is built.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    /// Options from the `require` entry.
    pub options: Option<Map<String, Value>>,
    /// Cache hooks; only present when options were given.
    pub cache: Option<CacheHandle>,
    /// Output channel for console-style logging.
    pub console: Console,
}

pub type Factory = Arc<dyn Fn(ModuleContext) -> Result<Arc<dyn Module>, Fault> + Send + Sync>;

/// A module bound under its basename.
pub struct LoadedModule {
    pub name: String,
    pub module: Arc<dyn Module>,
}

/// Map from module name to factory.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: BTreeMap<String, Factory>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModuleRegistry {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The modules shipped with the worker binary.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("echo", |ctx| Ok(Arc::new(Echo::new(ctx)) as Arc<dyn Module>));
        registry.register("counter", |ctx| {
            Ok(Arc::new(Counter::new(ctx)) as Arc<dyn Module>)
        });
        registry
    }

    /// Add or replace a module factory.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(ModuleContext) -> Result<Arc<dyn Module>, Fault> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Resolve and build one `require` entry.
    ///
    /// Blocked references are refused before lookup. Construction failures
    /// keep the factory's error name.
    pub fn load(
        &self,
        required: &RequiredModule,
        store: &CacheStore,
        emitter: &Emitter,
    ) -> Result<LoadedModule, Fault> {
        let reference = required.module.as_str();
        if let Some(reason) = blocked_reason(reference) {
            warn!(module = %reference, "blocked module requested");
            return Err(Fault::error(reason));
        }

        let name = module_key(reference);
        let factory = self.factories.get(name).ok_or_else(|| {
            warn!(module = %reference, "module not in capability table");
            Fault::error(format!("Cannot find module '{reference}'"))
        })?;

        let ctx = ModuleContext {
            options: required.options.clone(),
            cache: required
                .options
                .as_ref()
                .map(|_| store.handle(name, emitter.clone())),
            console: Console::new(emitter.clone()),
        };
        let module = factory(ctx).map_err(|fault| Fault {
            message: format!("Could not create instance: {}", fault.message),
            ..fault
        })?;

        debug!(module = %reference, name = %name, "module loaded");
        Ok(LoadedModule {
            name: name.to_string(),
            module,
        })
    }
}

/// Positional argument, `null` when missing.
pub(crate) fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Null)
}

/// Optional millisecond delay argument.
pub(crate) fn millis(args: &[Value], index: usize, default: u64) -> Result<u64, Fault> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .ok_or_else(|| Fault::type_error(format!("expected a delay in milliseconds, got {value}"))),
    }
}

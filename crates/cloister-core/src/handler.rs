//! Per-kind callbacks for events decoded from a worker.

use crate::protocol::{CacheEntry, Event, Exception, ExitStatus, Notice};
use serde_json::{Map, Value};

/// Receiver for the events of one run.
///
/// Every method has an empty default, so an implementation only picks the
/// kinds it cares about and the rest are dropped. `cache.save` events have
/// already been applied to the sandbox's module cache by the time
/// [`on_cache_save`](Self::on_cache_save) is called, and the controller does
/// its own bookkeeping for `exit` whether or not the handler reacts to it.
pub trait EventHandler: Send + 'static {
    fn on_trace(&mut self, _notice: Notice) {}

    fn on_console(&mut self, _value: Value) {}

    fn on_print(&mut self, _value: Value) {}

    fn on_introspect(&mut self, _shape: Map<String, Value>) {}

    fn on_cache_save(&mut self, _entry: CacheEntry) {}

    fn on_waiting(&mut self, _notice: Notice) {}

    fn on_result(&mut self, _value: Value) {}

    fn on_exception(&mut self, _exception: Exception) {}

    /// The watchdog fired and the worker was killed.
    fn on_timeout(&mut self, _message: String) {}

    /// The worker lifecycle is over. Always the last call of a run.
    fn on_exit(&mut self, _status: ExitStatus) {}
}

/// Route one event to the matching handler method.
pub(crate) fn dispatch(handler: &mut dyn EventHandler, event: Event) {
    match event {
        Event::Trace(n) => handler.on_trace(n),
        Event::Console(v) => handler.on_console(v),
        Event::Print(v) => handler.on_print(v),
        Event::Introspect(shape) => handler.on_introspect(shape),
        Event::CacheSave(entry) => handler.on_cache_save(entry),
        Event::Waiting(n) => handler.on_waiting(n),
        Event::Result(v) => handler.on_result(v),
        Event::Exception(e) => handler.on_exception(e),
        Event::Exit(status) => handler.on_exit(status),
    }
}

/// Handler that writes every event to the log.
#[derive(Debug, Clone, Default)]
pub struct LoggingHandler {
    label: Option<String>,
}

impl LoggingHandler {
    /// Log events tagged with a module or run label.
    pub fn labelled(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
        }
    }

    fn label(&self) -> &str {
        self.label.as_deref().unwrap_or("sandbox")
    }
}

impl EventHandler for LoggingHandler {
    fn on_trace(&mut self, notice: Notice) {
        tracing::debug!(label = %self.label(), message = %notice.message, "trace");
    }

    fn on_console(&mut self, value: Value) {
        tracing::debug!(label = %self.label(), %value, "console");
    }

    fn on_print(&mut self, value: Value) {
        tracing::debug!(label = %self.label(), %value, "print");
    }

    fn on_introspect(&mut self, shape: Map<String, Value>) {
        tracing::debug!(label = %self.label(), modules = shape.len(), "introspect");
    }

    fn on_cache_save(&mut self, entry: CacheEntry) {
        tracing::debug!(label = %self.label(), module = %entry.module, "cache saved");
    }

    fn on_waiting(&mut self, notice: Notice) {
        tracing::debug!(label = %self.label(), message = %notice.message, "waiting");
    }

    fn on_result(&mut self, value: Value) {
        tracing::debug!(label = %self.label(), %value, "Sandbox result");
    }

    fn on_exception(&mut self, exception: Exception) {
        tracing::error!(
            label = %self.label(),
            name = %exception.name,
            message = %exception.message,
            stack = ?exception.stack,
            "Sandbox exception"
        );
    }

    fn on_timeout(&mut self, message: String) {
        tracing::error!(label = %self.label(), %message, "Sandbox timeout");
    }

    fn on_exit(&mut self, status: ExitStatus) {
        tracing::debug!(label = %self.label(), code = status.code, "Sandbox process exited");
    }
}

//! Wire schema shared by the host controller and the worker runtime.
//!
//! The request is written once to the worker's stdin as a bare JSON object.
//! Every event the worker emits is wrapped as `{"message": {<kind>: <payload>}}`
//! and framed with [`crate::codec::encode`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Module names that resolution always refuses.
pub const BLOCKED_MODULES: &[&str] = &["fs", "process", "child_process", "vm", "os"];

/// One invocation request, built by the host and consumed by the worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Snippet source.
    pub script: String,
    /// Modules to load before the snippet runs, in order.
    #[serde(default)]
    pub require: Vec<RequiredModule>,
    /// Values bound as globals in the snippet scope.
    #[serde(rename = "global", default)]
    pub globals: Map<String, Value>,
    /// Emit an `introspect` event describing the loaded modules.
    #[serde(default)]
    pub introspect: bool,
    /// Previously saved per-module state, keyed by module basename.
    #[serde(default)]
    pub cache: Map<String, Value>,
}

/// A module reference plus optional constructor options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredModule {
    /// Module reference, optionally with a directory prefix.
    pub module: String,
    /// Constructor options. Their presence also grants cache hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Map<String, Value>>,
}

impl RequiredModule {
    /// Reference a module without options.
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            options: None,
        }
    }

    /// Reference a module constructed with `options`.
    pub fn with_options(module: impl Into<String>, options: Map<String, Value>) -> Self {
        Self {
            module: module.into(),
            options: Some(options),
        }
    }

    /// Last path segment of the reference: binding name and cache key.
    pub fn key(&self) -> &str {
        module_key(&self.module)
    }
}

/// Strip any directory prefix from a module reference.
pub fn module_key(reference: &str) -> &str {
    reference.rsplit('/').next().unwrap_or(reference)
}

/// Why a module reference is refused before lookup, if it is.
///
/// Both the full reference and its basename are checked against the denylist.
pub fn blocked_reason(reference: &str) -> Option<String> {
    if reference.contains("..") || BLOCKED_MODULES.contains(&module_key(reference)) {
        Some(format!("Module Blocked: {reference}"))
    } else {
        None
    }
}

/// Outer wrapper of every frame emitted by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The event carried by this frame.
    pub message: Event,
}

impl From<Event> for Envelope {
    fn from(message: Event) -> Self {
        Self { message }
    }
}

/// Events streamed from the worker to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// Informational progress note.
    #[serde(rename = "trace")]
    Trace(Notice),
    /// Output captured from console-style calls.
    #[serde(rename = "console.log")]
    Console(Value),
    /// Explicit user-visible output.
    #[serde(rename = "print")]
    Print(Value),
    /// Method names of each loaded module.
    #[serde(rename = "introspect")]
    Introspect(Map<String, Value>),
    /// Request to persist per-module state for the next invocation.
    #[serde(rename = "cache.save")]
    CacheSave(CacheEntry),
    /// The snippet finished without a terminal value yet.
    #[serde(rename = "waiting")]
    Waiting(Notice),
    /// Terminal success.
    #[serde(rename = "result")]
    Result(Value),
    /// Terminal failure.
    #[serde(rename = "exception")]
    Exception(Exception),
    /// Final event of every worker lifecycle.
    #[serde(rename = "exit")]
    Exit(ExitStatus),
}

impl Event {
    /// Wire name of this event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Trace(_) => "trace",
            Self::Console(_) => "console.log",
            Self::Print(_) => "print",
            Self::Introspect(_) => "introspect",
            Self::CacheSave(_) => "cache.save",
            Self::Waiting(_) => "waiting",
            Self::Result(_) => "result",
            Self::Exception(_) => "exception",
            Self::Exit(_) => "exit",
        }
    }

    /// Whether this event ends the logical call.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_) | Self::Exception(_))
    }

    /// Shorthand for a trace event.
    pub fn trace(message: impl Into<String>) -> Self {
        Self::Trace(Notice::new(message))
    }

    /// Shorthand for a waiting event.
    pub fn waiting(message: impl Into<String>) -> Self {
        Self::Waiting(Notice::new(message))
    }
}

/// Payload of `trace` and `waiting` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub message: String,
}

impl Notice {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Payload of `cache.save` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Module basename the state belongs to.
    pub module: String,
    /// Opaque saved value.
    pub cache: Value,
}

/// Payload of `exit` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: i32,
}

/// A failure reported by the worker.
///
/// Older workers report bare strings; those decode with the name `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawException")]
pub struct Exception {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl Exception {
    /// A failure with the generic `Error` name.
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    /// A failure with an explicit name.
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Attach a location trace.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawException {
    Text(String),
    Full {
        #[serde(default = "default_exception_name")]
        name: String,
        #[serde(default)]
        message: String,
        #[serde(default)]
        stack: Option<String>,
    },
}

fn default_exception_name() -> String {
    "Error".to_string()
}

impl From<RawException> for Exception {
    fn from(raw: RawException) -> Self {
        match raw {
            RawException::Text(message) => Self::new(message),
            RawException::Full {
                name,
                message,
                stack,
            } => Self {
                name,
                message,
                stack,
            },
        }
    }
}

/// Interpret one decoded frame as an event.
pub fn parse_frame(value: Value) -> serde_json::Result<Event> {
    serde_json::from_value::<Envelope>(value).map(|env| env.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_names() {
        let mut options = Map::new();
        options.insert("width".into(), json!(163));
        let request = Request {
            script: "_callback(null, 42)".into(),
            require: vec![RequiredModule::with_options("./ipc_modules/ccap", options)],
            globals: Map::new(),
            introspect: false,
            cache: Map::new(),
        };
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(
            wire,
            json!({
                "script": "_callback(null, 42)",
                "require": [{"module": "./ipc_modules/ccap", "options": {"width": 163}}],
                "global": {},
                "introspect": false,
                "cache": {}
            })
        );
    }

    #[test]
    fn test_request_defaults_for_missing_fields() {
        let request: Request = serde_json::from_value(json!({"script": "1"})).unwrap();
        assert!(request.require.is_empty());
        assert!(!request.introspect);
    }

    #[test]
    fn test_event_envelope_shape() {
        let env = Envelope::from(Event::CacheSave(CacheEntry {
            module: "m".into(),
            cache: json!({"x": 1}),
        }));
        assert_eq!(
            serde_json::to_value(&env).unwrap(),
            json!({"message": {"cache.save": {"module": "m", "cache": {"x": 1}}}})
        );

        let exit = parse_frame(json!({"message": {"exit": {"code": 0}}})).unwrap();
        assert_eq!(exit, Event::Exit(ExitStatus { code: 0 }));
        assert_eq!(exit.kind(), "exit");
        assert!(!exit.is_terminal());
    }

    #[test]
    fn test_exception_accepts_bare_string() {
        let event = parse_frame(json!({"message": {"exception": "boom"}})).unwrap();
        assert_eq!(event, Event::Exception(Exception::new("boom")));
        assert!(event.is_terminal());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        assert!(parse_frame(json!({"message": {"telemetry": 1}})).is_err());
    }

    #[test]
    fn test_module_key_and_blocklist() {
        assert_eq!(module_key("./ipc_modules/ccap"), "ccap");
        assert_eq!(module_key("echo"), "echo");
        for name in BLOCKED_MODULES {
            assert!(blocked_reason(name).unwrap().contains(name));
        }
        assert!(blocked_reason("../secrets").is_some());
        assert!(blocked_reason("./node_modules/child_process").is_some());
        assert!(blocked_reason("echo").is_none());
    }
}

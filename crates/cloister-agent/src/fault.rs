//! Script-level errors raised inside the worker.

use cloister_core::Exception;
use serde_json::{json, Value};
use thiserror::Error;

/// An error thrown by a snippet, a module, or the worker setup.
///
/// Carries the same three fields the `exception` event reports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct Fault {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl Fault {
    /// A plain `Error`.
    pub fn error(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::named("TypeError", message)
    }

    pub fn reference_error(message: impl Into<String>) -> Self {
        Self::named("ReferenceError", message)
    }

    pub fn syntax_error(message: impl Into<String>) -> Self {
        Self::named("SyntaxError", message)
    }

    /// Raised when a module has no method of the requested name.
    pub fn missing_method(method: &str) -> Self {
        Self::type_error(format!(
            "Target module does not have function - [{method}]!"
        ))
    }

    /// Attach a stack line unless one is already present.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        if self.stack.is_none() {
            self.stack = Some(stack.into());
        }
        self
    }

    /// Interpret a thrown or rejected value.
    ///
    /// An error object keeps its name and message, a string becomes the
    /// message, and anything else is rendered as JSON text.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(fields) => match fields.get("message").and_then(Value::as_str) {
                Some(message) => Self {
                    name: fields
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("Error")
                        .to_string(),
                    message: message.to_string(),
                    stack: fields
                        .get("stack")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                },
                None => Self::error(value.to_string()),
            },
            Value::String(message) => Self::error(message.clone()),
            other => Self::error(other.to_string()),
        }
    }

    /// The error object a snippet sees, as built by `Error(message)`.
    pub fn to_value(&self) -> Value {
        let mut value = json!({ "name": self.name, "message": self.message });
        if let Some(stack) = &self.stack {
            value["stack"] = json!(stack);
        }
        value
    }
}

impl From<Fault> for Exception {
    fn from(fault: Fault) -> Self {
        Exception {
            name: fault.name,
            message: fault.message,
            stack: fault.stack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_error_object_keeps_name() {
        let fault = Fault::from_value(&json!({"name": "RangeError", "message": "too big"}));
        assert_eq!(fault.name, "RangeError");
        assert_eq!(fault.message, "too big");
    }

    #[test]
    fn test_from_other_values() {
        assert_eq!(Fault::from_value(&json!("boom")), Fault::error("boom"));
        assert_eq!(Fault::from_value(&json!(7)).message, "7");
        assert_eq!(
            Fault::from_value(&json!({"code": 1})).message,
            r#"{"code":1}"#
        );
    }

    #[test]
    fn test_to_value_round_trips_through_from_value() {
        let fault = Fault::type_error("bad").with_stack("at line 1");
        assert_eq!(Fault::from_value(&fault.to_value()), fault);
    }

    #[test]
    fn test_stack_is_set_once() {
        let fault = Fault::error("x").with_stack("first").with_stack("second");
        assert_eq!(fault.stack.as_deref(), Some("first"));
    }

    #[test]
    fn test_into_exception() {
        let exception: Exception = Fault::missing_method("nope").into();
        assert_eq!(exception.name, "TypeError");
        assert_eq!(
            exception.message,
            "Target module does not have function - [nope]!"
        );
    }
}

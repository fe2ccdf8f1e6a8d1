//! Method shapes of loaded modules.
//!
//! A shape maps each accessible name to `{}` for a method, or to a nested
//! shape for a plain group of methods. Nothing is invoked while describing.

use crate::modules::Module;
use serde_json::{Map, Value};
use std::sync::Arc;

pub type Shape = Map<String, Value>;

/// Shape with one entry per method name.
pub fn methods(names: &[&str]) -> Shape {
    names
        .iter()
        .map(|name| (name.to_string(), Value::Object(Map::new())))
        .collect()
}

/// Whether `path` names a method (a leaf) in `shape`.
pub fn has_method(shape: &Shape, path: &[&str]) -> bool {
    let Some((last, groups)) = path.split_last() else {
        return false;
    };
    let mut current = shape;
    for group in groups {
        match current.get(*group) {
            Some(Value::Object(inner)) if !inner.is_empty() => current = inner,
            _ => return false,
        }
    }
    matches!(current.get(*last), Some(Value::Object(leaf)) if leaf.is_empty())
}

/// Payload of the `introspect` event for the loaded modules.
pub fn describe_all(modules: &[(String, Arc<dyn Module>)]) -> Map<String, Value> {
    modules
        .iter()
        .map(|(name, module)| (name.clone(), Value::Object(module.describe())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_method_walks_groups() {
        let mut shape = methods(&["echo", "later"]);
        shape.insert("text".into(), Value::Object(methods(&["upper"])));

        assert!(has_method(&shape, &["echo"]));
        assert!(has_method(&shape, &["text", "upper"]));
        assert!(!has_method(&shape, &["text"]));
        assert!(!has_method(&shape, &["missing"]));
        assert!(!has_method(&shape, &["echo", "deeper"]));
        assert!(!has_method(&shape, &[]));
    }
}

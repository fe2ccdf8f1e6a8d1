//! `counter`: a count that survives across runs through the module cache.

use super::{Invocation, Module, ModuleContext};
use crate::fault::Fault;
use crate::introspect::{methods, Shape};
use crate::store::CacheHandle;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Mutex;
use tracing::debug;

pub struct Counter {
    count: Mutex<i64>,
    cache: Option<CacheHandle>,
}

impl Counter {
    /// Starts from the cached count, then the `start` option, then zero.
    pub fn new(ctx: ModuleContext) -> Self {
        let cached = ctx
            .cache
            .as_ref()
            .and_then(CacheHandle::get_cache)
            .and_then(|saved| saved.get("count").and_then(Value::as_i64));
        let start = ctx
            .options
            .as_ref()
            .and_then(|options| options.get("start"))
            .and_then(Value::as_i64);
        let count = cached.or(start).unwrap_or(0);
        debug!(count, restored = cached.is_some(), "counter created");

        Self {
            count: Mutex::new(count),
            cache: ctx.cache,
        }
    }

    fn update(&self, f: impl FnOnce(i64) -> i64) -> i64 {
        let count = {
            let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
            *count = f(*count);
            *count
        };
        if let Some(cache) = &self.cache {
            cache.save_cache(json!({ "count": count }));
        }
        count
    }
}

#[async_trait]
impl Module for Counter {
    fn describe(&self) -> Shape {
        methods(&["increment", "value", "reset"])
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Invocation, Fault> {
        let count = match method {
            "increment" => {
                let by = match args.first() {
                    None | Some(Value::Null) => 1,
                    Some(value) => value.as_i64().ok_or_else(|| {
                        Fault::type_error(format!("increment expects an integer, got {value}"))
                    })?,
                };
                self.update(|count| count.saturating_add(by))
            }
            "value" => *self.count.lock().unwrap_or_else(|e| e.into_inner()),
            "reset" => self.update(|_| 0),
            other => return Err(Fault::missing_method(other)),
        };
        Ok(Invocation::Ready(json!(count)))
    }
}

//! `echo`: hands its arguments back, now or later.

use super::{arg, millis, Invocation, Module, ModuleContext};
use crate::emitter::Console;
use crate::fault::Fault;
use crate::introspect::{methods, Shape};
use crate::store::CacheHandle;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;

const DEFAULT_DELAY_MS: u64 = 10;

pub struct Echo {
    options: Option<Map<String, Value>>,
    cache: Option<CacheHandle>,
    console: Console,
}

impl Echo {
    pub fn new(ctx: ModuleContext) -> Self {
        Self {
            options: ctx.options,
            cache: ctx.cache,
            console: ctx.console,
        }
    }

    fn cache(&self) -> Result<&CacheHandle, Fault> {
        self.cache
            .as_ref()
            .ok_or_else(|| Fault::error("echo was loaded without options, no cache available"))
    }
}

fn text(args: &[Value], f: impl Fn(&str) -> String) -> Result<Invocation, Fault> {
    match args.first() {
        Some(Value::String(s)) => Ok(Invocation::Ready(Value::String(f(s)))),
        other => Err(Fault::type_error(format!(
            "expected a string, got {}",
            other.unwrap_or(&Value::Null)
        ))),
    }
}

#[async_trait]
impl Module for Echo {
    fn describe(&self) -> Shape {
        let mut shape = methods(&[
            "echo", "all", "later", "fail", "reject", "options", "log", "remember", "recall",
        ]);
        shape.insert("text".into(), Value::Object(methods(&["upper", "lower"])));
        shape
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Invocation, Fault> {
        match method {
            "echo" => Ok(Invocation::Ready(arg(&args, 0))),
            "all" => Ok(Invocation::Ready(Value::Array(args))),
            "later" => {
                let delay = Duration::from_millis(millis(&args, 1, DEFAULT_DELAY_MS)?);
                let value = arg(&args, 0);
                Ok(Invocation::pending(async move {
                    tokio::time::sleep(delay).await;
                    Ok(value)
                }))
            }
            "fail" => Err(Fault::from_value(&arg(&args, 0))),
            "reject" => {
                let delay = Duration::from_millis(millis(&args, 1, DEFAULT_DELAY_MS)?);
                let fault = Fault::from_value(&arg(&args, 0));
                Ok(Invocation::pending(async move {
                    tokio::time::sleep(delay).await;
                    Err(fault)
                }))
            }
            "options" => Ok(Invocation::Ready(
                self.options.clone().map(Value::Object).unwrap_or(Value::Null),
            )),
            "log" => {
                self.console.log(args);
                Ok(Invocation::Ready(Value::Null))
            }
            "remember" => {
                let value = arg(&args, 0);
                self.cache()?.save_cache(value.clone());
                Ok(Invocation::Ready(value))
            }
            "recall" => Ok(Invocation::Ready(
                self.cache()?.get_cache().unwrap_or(Value::Null),
            )),
            "text.upper" => text(&args, str::to_uppercase),
            "text.lower" => text(&args, str::to_lowercase),
            other => Err(Fault::missing_method(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::Emitter;
    use crate::store::CacheStore;
    use serde_json::json;

    fn echo(options: Option<Map<String, Value>>) -> Echo {
        let (emitter, _task) = Emitter::spawn(Vec::new());
        let store = CacheStore::new();
        Echo::new(ModuleContext {
            cache: options.as_ref().map(|_| store.handle("echo", emitter.clone())),
            options,
            console: Console::new(emitter),
        })
    }

    async fn ready(module: &Echo, method: &str, args: Vec<Value>) -> Value {
        match module.invoke(method, args).await.unwrap() {
            Invocation::Ready(value) => value,
            Invocation::Pending(_) => panic!("{method} should be ready"),
        }
    }

    #[tokio::test]
    async fn test_ready_methods() {
        let module = echo(None);
        assert_eq!(ready(&module, "echo", vec![json!(42)]).await, json!(42));
        assert_eq!(ready(&module, "echo", vec![]).await, json!(null));
        assert_eq!(
            ready(&module, "all", vec![json!(1), json!("a")]).await,
            json!([1, "a"])
        );
        assert_eq!(ready(&module, "text.upper", vec![json!("abc")]).await, json!("ABC"));
        assert_eq!(ready(&module, "options", vec![]).await, json!(null));
    }

    #[tokio::test]
    async fn test_later_settles_with_value() {
        let module = echo(None);
        match module.invoke("later", vec![json!("v"), json!(1)]).await.unwrap() {
            Invocation::Pending(pending) => assert_eq!(pending.await, Ok(json!("v"))),
            Invocation::Ready(_) => panic!("later should be pending"),
        }
    }

    #[tokio::test]
    async fn test_reject_settles_with_fault() {
        let module = echo(None);
        match module.invoke("reject", vec![json!("nope"), json!(1)]).await.unwrap() {
            Invocation::Pending(pending) => assert_eq!(pending.await, Err(Fault::error("nope"))),
            Invocation::Ready(_) => panic!("reject should be pending"),
        }
    }

    #[tokio::test]
    async fn test_cache_methods_need_options() {
        let module = echo(None);
        assert!(module.invoke("recall", vec![]).await.is_err());

        let module = echo(Some(Map::new()));
        assert_eq!(ready(&module, "recall", vec![]).await, json!(null));
        ready(&module, "remember", vec![json!({"x": 1})]).await;
        assert_eq!(ready(&module, "recall", vec![]).await, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let err = echo(None).invoke("nope", vec![]).await.err().unwrap();
        assert_eq!(err, Fault::missing_method("nope"));
    }
}

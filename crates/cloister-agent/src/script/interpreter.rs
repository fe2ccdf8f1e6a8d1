//! Evaluator for parsed snippets.

use super::parser::{Arg, Expr, Stmt};
use super::{Pos, Script, MAX_NESTING_DEPTH};
use crate::emitter::Console;
use crate::fault::Fault;
use crate::gate::Gate;
use crate::modules::{millis, Invocation, Module, PendingValue};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Built-in names, resolved after bindings, globals and modules.
const BUILTINS: &[&str] = &[
    "_callback",
    "print",
    "console.log",
    "console.info",
    "console.warn",
    "console.error",
    "Error",
    "JSON.parse",
    "JSON.stringify",
    "Promise.resolve",
    "sleep",
];

/// The value of an expression.
#[derive(Clone)]
pub enum Eval {
    /// Nothing was produced (a call to `print`, a `let`, ...).
    Undefined,
    Value(Value),
    /// Settles later. Cloning shares the same computation.
    Pending(Shared<PendingValue>),
}

impl Eval {
    fn pending(value: PendingValue) -> Self {
        Self::Pending(value.shared())
    }
}

impl fmt::Debug for Eval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("Undefined"),
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Pending(_) => f.write_str("Pending"),
        }
    }
}

/// Scope and evaluator for one snippet run.
pub struct Interpreter {
    bindings: HashMap<String, Eval>,
    globals: Map<String, Value>,
    modules: HashMap<String, Arc<dyn Module>>,
    console: Console,
    gate: Gate,
}

impl Interpreter {
    /// A scope with only built-ins. `_callback` settles `gate`.
    pub fn new(console: Console, gate: Gate) -> Self {
        Self {
            bindings: HashMap::new(),
            globals: Map::new(),
            modules: HashMap::new(),
            console,
            gate,
        }
    }

    pub fn with_globals(mut self, globals: Map<String, Value>) -> Self {
        self.globals = globals;
        self
    }

    /// Bind a loaded module under `name`.
    pub fn add_module(&mut self, name: impl Into<String>, module: Arc<dyn Module>) {
        self.modules.insert(name.into(), module);
    }

    /// Run every statement; the value of the last one is the result.
    pub async fn run(&mut self, script: &Script) -> Result<Eval, Fault> {
        let mut last = Eval::Undefined;
        for stmt in &script.body {
            last = self.exec(stmt).await?;
        }
        Ok(last)
    }

    async fn exec(&mut self, stmt: &Stmt) -> Result<Eval, Fault> {
        match stmt {
            Stmt::Let { name, value } => {
                let value = self.eval(value, 0).await?;
                trace!(name = %name, "binding");
                self.bindings.insert(name.clone(), value);
                Ok(Eval::Undefined)
            }
            Stmt::Throw { value, pos } => {
                let thrown = self.eval(value, 0).await?;
                let thrown = into_value(thrown)?;
                Err(Fault::from_value(&thrown).with_stack(pos.frame()))
            }
            Stmt::Expr(expr) => self.eval(expr, 0).await,
        }
    }

    fn eval<'a>(&'a mut self, expr: &'a Expr, depth: usize) -> BoxFuture<'a, Result<Eval, Fault>> {
        async move {
            if depth >= MAX_NESTING_DEPTH {
                return Err(Fault::named(
                    "RangeError",
                    format!("Maximum nesting depth ({MAX_NESTING_DEPTH}) exceeded"),
                ));
            }
            match expr {
                Expr::Literal(value) => Ok(Eval::Value(value.clone())),
                Expr::Array(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        let value = self.eval(item, depth + 1).await?;
                        values.push(into_value(value)?);
                    }
                    Ok(Eval::Value(Value::Array(values)))
                }
                Expr::Object(fields) => {
                    let mut map = Map::new();
                    for (key, field) in fields {
                        let value = self.eval(field, depth + 1).await?;
                        map.insert(key.clone(), into_value(value)?);
                    }
                    Ok(Eval::Value(Value::Object(map)))
                }
                Expr::Path { path, pos } => self.lookup(path, *pos),
                Expr::Call { callee, args, pos } => self
                    .call(callee, args, *pos, depth)
                    .await
                    .map_err(|fault| fault.with_stack(pos.frame())),
            }
        }
        .boxed()
    }

    fn lookup(&self, path: &[String], pos: Pos) -> Result<Eval, Fault> {
        let (head, rest) = split(path)?;
        let base = if let Some(bound) = self.bindings.get(head) {
            bound.clone()
        } else if let Some(global) = self.globals.get(head) {
            Eval::Value(global.clone())
        } else if self.modules.contains_key(head) || is_builtin_root(head) {
            return Err(Fault::type_error(format!(
                "{} is a function or module and cannot be used as a value",
                path.join(".")
            ))
            .with_stack(pos.frame()));
        } else {
            return Err(Fault::reference_error(format!("{head} is not defined"))
                .with_stack(pos.frame()));
        };

        if rest.is_empty() {
            return Ok(base);
        }
        let mut current = match base {
            Eval::Value(value) => Some(value),
            Eval::Undefined => None,
            Eval::Pending(_) => {
                return Err(Fault::type_error(format!(
                    "Cannot read properties of a pending value (reading '{}')",
                    rest[0]
                ))
                .with_stack(pos.frame()))
            }
        };
        for field in rest {
            current = match current {
                Some(Value::Object(mut fields)) => fields.remove(field),
                Some(Value::Null) => return Err(unreadable("null", field, pos)),
                None => return Err(unreadable("undefined", field, pos)),
                Some(_) => None,
            };
        }
        Ok(current.map(Eval::Value).unwrap_or(Eval::Undefined))
    }

    async fn call(
        &mut self,
        callee: &[String],
        args: &[Arg],
        pos: Pos,
        depth: usize,
    ) -> Result<Eval, Fault> {
        let (head, rest) = split(callee)?;
        let name = callee.join(".");

        if self.bindings.contains_key(head) || self.globals.contains_key(head) {
            return Err(Fault::type_error(format!("{name} is not a function")));
        }

        if let Some(module) = self.modules.get(head).cloned() {
            if rest.is_empty() {
                return Err(Fault::type_error(format!("{name} is not a function")));
            }
            let method = rest.join(".");
            if !module.has_method(&method) {
                return Err(Fault::missing_method(&method));
            }
            let args = self.args(args, depth).await?;
            debug!(module = %head, method = %method, args = args.len(), at = %pos, "invoking module method");
            return match module.invoke(&method, args).await? {
                Invocation::Ready(value) => Ok(Eval::Value(value)),
                Invocation::Pending(pending) => Ok(Eval::pending(pending)),
            };
        }

        if name == "Promise.resolve" {
            return self.resolve(args, depth).await;
        }
        if BUILTINS.contains(&name.as_str()) {
            let args = self.args(args, depth).await?;
            return self.builtin(&name, args);
        }

        if is_builtin_root(head) {
            return Err(Fault::type_error(format!("{name} is not a function")));
        }
        Err(Fault::reference_error(format!("{head} is not defined")))
    }

    async fn args(&mut self, args: &[Arg], depth: usize) -> Result<Vec<Value>, Fault> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            let value = self.eval(&arg.value, depth + 1).await?;
            let value = into_value(value)?;
            if arg.spread {
                match value {
                    Value::Array(items) => values.extend(items),
                    other => {
                        return Err(Fault::type_error(format!(
                            "Spread syntax requires an array, got {other}"
                        )))
                    }
                }
            } else {
                values.push(value);
            }
        }
        Ok(values)
    }

    /// `Promise.resolve(v)`: a pending `v` passes through, anything else
    /// becomes a pending value that is already settled.
    async fn resolve(&mut self, args: &[Arg], depth: usize) -> Result<Eval, Fault> {
        let value = match args {
            [] => Eval::Undefined,
            [arg, ..] if !arg.spread => self.eval(&arg.value, depth + 1).await?,
            _ => {
                return Err(Fault::type_error(
                    "Promise.resolve does not accept spread arguments",
                ))
            }
        };
        Ok(match value {
            Eval::Pending(pending) => Eval::Pending(pending),
            other => {
                let value = into_value(other)?;
                Eval::pending(futures::future::ready(Ok(value)).boxed())
            }
        })
    }

    fn builtin(&self, name: &str, args: Vec<Value>) -> Result<Eval, Fault> {
        let first = args.first().cloned().unwrap_or(Value::Null);
        match name {
            "_callback" => {
                let settled = if first.is_null() {
                    Ok(args.get(1).cloned().unwrap_or(Value::Null))
                } else {
                    Err(Fault::from_value(&first))
                };
                if !self.gate.settle(settled) {
                    debug!("_callback called after the run settled");
                }
                Ok(Eval::Undefined)
            }
            "print" => {
                self.console.print(first);
                Ok(Eval::Undefined)
            }
            "console.log" | "console.info" | "console.warn" | "console.error" => {
                self.console.log(args);
                Ok(Eval::Undefined)
            }
            "Error" => {
                let message = match first {
                    Value::String(s) => s,
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                Ok(Eval::Value(Fault::error(message).to_value()))
            }
            "JSON.parse" => match first {
                Value::String(text) => serde_json::from_str(&text)
                    .map(Eval::Value)
                    .map_err(|e| Fault::syntax_error(format!("JSON.parse: {e}"))),
                other => Err(Fault::type_error(format!(
                    "JSON.parse expects a string, got {other}"
                ))),
            },
            "JSON.stringify" => serde_json::to_string(&first)
                .map(|text| Eval::Value(Value::String(text)))
                .map_err(|e| Fault::type_error(e.to_string())),
            "sleep" => {
                let delay = Duration::from_millis(millis(&args, 0, 0)?);
                Ok(Eval::pending(
                    async move {
                        tokio::time::sleep(delay).await;
                        Ok(Value::Null)
                    }
                    .boxed(),
                ))
            }
            other => Err(Fault::reference_error(format!("{other} is not defined"))),
        }
    }
}

fn split(path: &[String]) -> Result<(&str, &[String]), Fault> {
    path.split_first()
        .map(|(head, rest)| (head.as_str(), rest))
        .ok_or_else(|| Fault::syntax_error("empty name"))
}

fn unreadable(what: &str, field: &str, pos: Pos) -> Fault {
    Fault::type_error(format!("Cannot read properties of {what} (reading '{field}')"))
        .with_stack(pos.frame())
}

fn is_builtin_root(name: &str) -> bool {
    BUILTINS
        .iter()
        .any(|b| b.split('.').next() == Some(name))
}

/// A value usable as data. `Undefined` reads as `null`.
fn into_value(eval: Eval) -> Result<Value, Fault> {
    match eval {
        Eval::Undefined => Ok(Value::Null),
        Eval::Value(value) => Ok(value),
        Eval::Pending(_) => Err(Fault::type_error(
            "a pending value cannot be used as data",
        )),
    }
}

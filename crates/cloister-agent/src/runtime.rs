//! Worker runtime: one request in, a stream of events out.
//!
//! The worker reads a single request from its input, seeds the cache store,
//! loads the required modules from the capability table, runs the snippet and
//! waits for exactly one terminal outcome. It always finishes with an `exit`
//! event; the process exit code only reflects whether the output channel
//! itself held up.

use crate::emitter::{Console, Emitter};
use crate::fault::Fault;
use crate::gate::{Completion, Gate, Settled};
use crate::introspect::describe_all;
use crate::modules::ModuleRegistry;
use crate::script::{Eval, Interpreter, Script};
use crate::store::CacheStore;
use cloister_core::codec::DocumentAssembler;
use cloister_core::{Event, ExitStatus, Request};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Environment variable for the waiting-notice interval, in seconds.
pub const WAITING_NOTICE_ENV: &str = "CLOISTER_WAITING_NOTICE_SECS";

/// Default interval between `waiting` notices.
pub const DEFAULT_WAITING_NOTICE: Duration = Duration::from_secs(60);

const READ_CHUNK: usize = 8 * 1024;

const PARTIAL_REQUEST: &str = "Received input chunk from runtime, waiting for more...";

/// Worker-side settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Interval of the soft `waiting` notice. Zero disables repeats.
    pub waiting_notice: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            waiting_notice: DEFAULT_WAITING_NOTICE,
        }
    }
}

impl WorkerConfig {
    /// Defaults overlaid with `CLOISTER_WAITING_NOTICE_SECS`.
    pub fn from_env() -> Self {
        let waiting_notice = std::env::var(WAITING_NOTICE_ENV)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_WAITING_NOTICE);
        Self { waiting_notice }
    }
}

/// Runs requests against a capability table.
#[derive(Debug, Clone)]
pub struct Worker {
    registry: ModuleRegistry,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(registry: ModuleRegistry, config: WorkerConfig) -> Self {
        Self { registry, config }
    }

    /// Built-in modules and environment settings.
    pub fn builtin() -> Self {
        Self::new(ModuleRegistry::builtin(), WorkerConfig::from_env())
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Serve one request from `input`, writing frames to `output`.
    ///
    /// Returns the process exit code: 0 once the `exit` frame was written,
    /// 1 if the output channel failed. Does not return while the run has
    /// no terminal outcome; the host's watchdog ends such runs.
    pub async fn run<R, W>(&self, input: R, output: W) -> i32
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (emitter, writer) = Emitter::spawn(output);

        let settled = match read_request(input, &emitter).await {
            Ok(request) => self.execute(request, &emitter).await,
            Err(fault) => Err(fault),
        };
        match settled {
            Ok(value) => {
                debug!("run settled with a result");
                emitter.emit(Event::Result(value));
            }
            Err(fault) => {
                debug!(name = %fault.name, message = %fault.message, "run settled with an exception");
                emitter.emit(Event::Exception(fault.into()));
            }
        }
        emitter.emit(Event::Exit(ExitStatus { code: 0 }));
        drop(emitter);

        match writer.await {
            Ok(Ok(_)) => 0,
            Ok(Err(e)) => {
                error!(error = %e, "failed to write frames");
                1
            }
            Err(e) => {
                error!(error = %e, "frame writer task failed");
                1
            }
        }
    }

    async fn execute(&self, request: Request, emitter: &Emitter) -> Settled {
        let Request {
            script,
            require,
            globals,
            introspect,
            cache,
        } = request;
        info!(
            modules = require.len(),
            globals = globals.len(),
            introspect,
            script_len = script.len(),
            "running request"
        );

        let store = CacheStore::new();
        store.merge(cache);

        let mut loaded = Vec::with_capacity(require.len());
        for required in &require {
            emitter.trace(format!("Loading module: {}", required.module));
            let module = self.registry.load(required, &store, emitter)?;
            loaded.push((module.name, module.module));
        }
        if introspect {
            emitter.emit(Event::Introspect(describe_all(&loaded)));
        }

        let names: Vec<&str> = globals.keys().map(String::as_str).collect();
        emitter.trace(if names.is_empty() {
            "setting Global: <no globals>".to_string()
        } else {
            format!("setting Global: {}", names.join(" "))
        });

        let script = Script::parse(&script)?;
        let (gate, completion) = Gate::new();
        let mut interpreter =
            Interpreter::new(Console::new(emitter.clone()), gate.clone()).with_globals(globals);
        for (name, module) in loaded {
            interpreter.add_module(name, module);
        }

        let secs = self.config.waiting_notice.as_secs();
        match interpreter.run(&script).await {
            Err(fault) => {
                gate.settle(Err(fault));
            }
            Ok(_) if gate.is_settled() => {}
            Ok(Eval::Value(value)) if !value.is_null() => {
                gate.settle(Ok(value));
            }
            Ok(Eval::Pending(pending)) => {
                emitter.emit(Event::waiting(format!(
                    "Evaluation finished and a promise was returned.\nWaiting {secs} seconds for promise to be fulfilled."
                )));
                let settle = gate.clone();
                tokio::spawn(async move {
                    settle.settle(pending.await);
                });
            }
            // A bare `null` counts as nothing returned, like `undefined`.
            Ok(Eval::Undefined | Eval::Value(_)) => {
                emitter.emit(Event::waiting(format!(
                    "Evaluation finished but nothing returned.\nWaiting {secs} seconds for _callback()."
                )));
            }
        }

        self.wait(completion, gate, emitter).await
    }

    /// Wait for the terminal outcome, repeating the `waiting` notice.
    async fn wait(&self, completion: Completion, gate: Gate, emitter: &Emitter) -> Settled {
        // Held for the whole wait so the completion cannot resolve empty.
        let _gate = gate;
        let started = Instant::now();
        let every = self.config.waiting_notice;
        let repeat = !every.is_zero();
        let mut ticker = tokio::time::interval_at(
            started + every,
            if repeat { every } else { DEFAULT_WAITING_NOTICE },
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = completion.wait();
        tokio::pin!(outcome);
        loop {
            tokio::select! {
                settled = &mut outcome => {
                    return settled.unwrap_or_else(|| Err(Fault::error("run ended without a result")));
                }
                _ = ticker.tick(), if repeat => {
                    let waited = started.elapsed().as_secs();
                    info!(waited_secs = waited, "still waiting for a terminal result");
                    emitter.emit(Event::waiting(format!(
                        "Still waiting for a result after {waited} seconds."
                    )));
                }
            }
        }
    }
}

async fn read_request<R: AsyncRead + Unpin>(mut input: R, emitter: &Emitter) -> Result<Request, Fault> {
    let mut assembler = DocumentAssembler::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = input
            .read(&mut buf)
            .await
            .map_err(|e| Fault::named("ProtocolError", format!("failed to read request: {e}")))?;
        if n == 0 {
            let message = if assembler.is_empty() {
                "input closed before a request arrived".to_string()
            } else {
                format!(
                    "input closed after {} bytes without a complete request",
                    assembler.len()
                )
            };
            return Err(Fault::named("ProtocolError", message));
        }

        match assembler.push::<Request>(&buf[..n]) {
            Ok(Some(request)) => {
                debug!(bytes = n, "request received");
                return Ok(request);
            }
            Ok(None) => {
                debug!(buffered = assembler.len(), "partial request");
                emitter.trace(PARTIAL_REQUEST);
            }
            Err(e) => {
                return Err(Fault::named("ProtocolError", format!("malformed request: {e}")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloister_core::codec::FrameDecoder;
    use cloister_core::protocol::parse_frame;
    use cloister_core::{Exception, Notice};
    use serde_json::{json, Value};
    use tokio::io::{AsyncWriteExt, DuplexStream};

    fn worker(waiting_notice: Duration) -> Worker {
        Worker::new(ModuleRegistry::builtin(), WorkerConfig { waiting_notice })
    }

    async fn collect(mut rx: DuplexStream) -> Vec<Event> {
        let mut out = Vec::new();
        rx.read_to_end(&mut out).await.unwrap();
        FrameDecoder::new()
            .decode(&out)
            .unwrap()
            .into_iter()
            .map(|v| parse_frame(v).unwrap())
            .collect()
    }

    async fn serve(request: Value) -> (i32, Vec<Event>) {
        let (tx, rx) = tokio::io::duplex(1 << 16);
        let input = serde_json::to_vec(&request).unwrap();
        let code = worker(DEFAULT_WAITING_NOTICE).run(&input[..], tx).await;
        (code, collect(rx).await)
    }

    /// Events other than traces and waiting notices.
    fn outcome(events: &[Event]) -> Vec<Event> {
        events
            .iter()
            .filter(|e| !matches!(e, Event::Trace(_) | Event::Waiting(_)))
            .cloned()
            .collect()
    }

    fn exception(events: &[Event]) -> Exception {
        events
            .iter()
            .find_map(|e| match e {
                Event::Exception(x) => Some(x.clone()),
                _ => None,
            })
            .expect("no exception event")
    }

    const EXIT: Event = Event::Exit(ExitStatus { code: 0 });

    #[tokio::test]
    async fn test_callback_result() {
        let (code, events) = serve(json!({
            "script": "_callback(null, 42)", "require": [], "global": {}, "introspect": false, "cache": {}
        }))
        .await;
        assert_eq!(code, 0);
        assert_eq!(outcome(&events), vec![Event::Result(json!(42)), EXIT]);
    }

    #[tokio::test]
    async fn test_synchronous_throw() {
        let (code, events) = serve(json!({"script": "throw Error(\"boom\")"})).await;
        assert_eq!(code, 0);
        let outcome = outcome(&events);
        assert_eq!(outcome.len(), 2);
        assert_eq!(exception(&events).message, "boom");
        assert_eq!(outcome[1], EXIT);
    }

    #[tokio::test]
    async fn test_blocked_module_stops_before_script() {
        let (_, events) = serve(json!({
            "script": "print(\"side effect\")",
            "require": [{"module": "echo"}, {"module": "fs"}, {"module": "counter"}]
        }))
        .await;
        assert!(exception(&events).message.contains("fs"));
        assert_eq!(
            events,
            vec![
                Event::trace("Loading module: echo"),
                Event::trace("Loading module: fs"),
                Event::Exception(Exception::new("Module Blocked: fs")),
                EXIT,
            ]
        );
    }

    #[tokio::test]
    async fn test_value_and_pending_results() {
        let (_, events) = serve(json!({"script": "{\"k\": [1, 2]}"})).await;
        assert_eq!(outcome(&events), vec![Event::Result(json!({"k": [1, 2]})), EXIT]);

        let (_, events) = serve(json!({
            "script": "echo.later(5, 1)", "require": [{"module": "./ipc_modules/echo"}]
        }))
        .await;
        assert!(events.iter().any(|e| matches!(e, Event::Waiting(n) if n.message.contains("promise"))));
        assert_eq!(outcome(&events), vec![Event::Result(json!(5)), EXIT]);

        let (_, events) = serve(json!({
            "script": "echo.reject(\"nope\", 1)", "require": [{"module": "echo"}]
        }))
        .await;
        assert_eq!(exception(&events).message, "nope");
    }

    #[tokio::test]
    async fn test_callback_wins_over_returned_value() {
        let (_, events) = serve(json!({"script": "_callback(null, 1); 2"})).await;
        assert_eq!(outcome(&events), vec![Event::Result(json!(1)), EXIT]);

        let (_, events) = serve(json!({"script": "_callback(null, 1); throw Error(\"after\")"})).await;
        assert_eq!(outcome(&events), vec![Event::Result(json!(1)), EXIT]);
    }

    #[tokio::test]
    async fn test_globals_cache_and_introspect() {
        let (_, events) = serve(json!({
            "script": "counter.increment(step)",
            "require": [{"module": "counter", "options": {}}],
            "global": {"step": 2, "unused": true},
            "introspect": true,
            "cache": {"counter": {"count": 3}}
        }))
        .await;
        assert_eq!(
            events,
            vec![
                Event::trace("Loading module: counter"),
                Event::Introspect(
                    json!({"counter": {"increment": {}, "value": {}, "reset": {}}})
                        .as_object()
                        .cloned()
                        .unwrap()
                ),
                Event::trace("setting Global: step unused"),
                Event::CacheSave(cloister_core::CacheEntry {
                    module: "counter".into(),
                    cache: json!({"count": 5}),
                }),
                Event::Result(json!(5)),
                EXIT,
            ]
        );
    }

    #[tokio::test]
    async fn test_syntax_error_reported() {
        let (_, events) = serve(json!({"script": "echo.say("})).await;
        let exception = exception(&events);
        assert_eq!(exception.name, "SyntaxError");
        assert!(exception.stack.unwrap().contains("<snippet>:1:"));
    }

    #[tokio::test]
    async fn test_request_split_across_chunks() {
        let (mut input_tx, input_rx) = tokio::io::duplex(1 << 16);
        let (tx, rx) = tokio::io::duplex(1 << 16);
        let request = serde_json::to_vec(&json!({"script": "_callback(null, \"joined\")"})).unwrap();
        let (first, second) = request.split_at(request.len() / 2);
        let (first, second) = (first.to_vec(), second.to_vec());

        tokio::spawn(async move {
            input_tx.write_all(&first).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            input_tx.write_all(&second).await.unwrap();
        });

        let code = worker(DEFAULT_WAITING_NOTICE).run(input_rx, tx).await;
        let events = collect(rx).await;
        assert_eq!(code, 0);
        assert_eq!(events[0], Event::Trace(Notice::new(PARTIAL_REQUEST)));
        assert_eq!(outcome(&events), vec![Event::Result(json!("joined")), EXIT]);
    }

    #[tokio::test]
    async fn test_bad_input() {
        let (tx, rx) = tokio::io::duplex(1 << 16);
        worker(DEFAULT_WAITING_NOTICE).run(&b"{not json"[..], tx).await;
        let events = collect(rx).await;
        assert_eq!(exception(&events).name, "ProtocolError");
        assert_eq!(events.last(), Some(&EXIT));

        let (tx, rx) = tokio::io::duplex(1 << 16);
        worker(DEFAULT_WAITING_NOTICE).run(&b""[..], tx).await;
        let events = collect(rx).await;
        assert!(exception(&events).message.contains("before a request arrived"));
    }

    #[tokio::test]
    async fn test_waiting_notice_repeats() {
        let (tx, rx) = tokio::io::duplex(1 << 16);
        let input = serde_json::to_vec(&json!({"script": "sleep(120)"})).unwrap();
        worker(Duration::from_millis(20)).run(&input[..], tx).await;
        let events = collect(rx).await;
        let waiting = events.iter().filter(|e| matches!(e, Event::Waiting(_))).count();
        assert!(waiting >= 2, "expected repeated notices, got {waiting}");
        assert_eq!(outcome(&events), vec![Event::Result(json!(null)), EXIT]);
    }

    /// Events written by a run that never settles, cut off after 100ms.
    async fn unsettled(script: &str) -> Vec<Event> {
        let (tx, rx) = tokio::io::duplex(1 << 16);
        let input = serde_json::to_vec(&json!({"script": script})).unwrap();
        let w = worker(DEFAULT_WAITING_NOTICE);
        let run = tokio::time::timeout(Duration::from_millis(100), w.run(&input[..], tx)).await;
        assert!(run.is_err(), "{script} settled");

        // Dropping the unfinished run closes the channel without a terminal event.
        collect(rx).await
    }

    fn nothing_returned() -> Event {
        Event::waiting(format!(
            "Evaluation finished but nothing returned.\nWaiting {} seconds for _callback().",
            DEFAULT_WAITING_NOTICE.as_secs()
        ))
    }

    #[tokio::test]
    async fn test_no_callback_keeps_waiting() {
        assert_eq!(
            unsettled("print(1)").await,
            vec![
                Event::trace("setting Global: <no globals>"),
                Event::Print(json!(1)),
                nothing_returned(),
            ]
        );
    }

    #[tokio::test]
    async fn test_null_counts_as_nothing_returned() {
        assert_eq!(
            unsettled("let x = 1; null").await,
            vec![Event::trace("setting Global: <no globals>"), nothing_returned()]
        );

        let (_, events) = serve(json!({"script": "_callback(null, 1); null"})).await;
        assert_eq!(outcome(&events), vec![Event::Result(json!(1)), EXIT]);

        let (_, events) = serve(json!({
            "script": "Promise.resolve(echo.echo(null))", "require": [{"module": "echo"}]
        }))
        .await;
        assert_eq!(outcome(&events), vec![Event::Result(json!(null)), EXIT]);
    }

    #[tokio::test]
    async fn test_deep_nesting_is_an_exception() {
        let script = format!("{}{}", "[".repeat(200_000), "]".repeat(200_000));
        let (code, events) = serve(json!({ "script": script })).await;
        assert_eq!(code, 0);
        let exception = exception(&events);
        assert_eq!(exception.name, "SyntaxError");
        assert!(exception.message.contains("nesting depth"));
        assert_eq!(events.last(), Some(&EXIT));
    }
}

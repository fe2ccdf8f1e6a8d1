//! Sandbox controller - one worker process per run.

use crate::cache::ModuleCache;
use crate::codec::FrameDecoder;
use crate::config::SandboxConfig;
use crate::error::CoreError;
use crate::handler::{dispatch, EventHandler};
use crate::protocol::{parse_frame, Event, Exception, ExitStatus, Request};
use chrono::{DateTime, Utc};
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// How long a worker may linger after its `exit` event before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Read size for the worker's stdout.
const READ_CHUNK: usize = 8 * 1024;

const TIMEOUT_MESSAGE: &str = "Timeout exception, sandbox killed";

/// Identity of a [`Sandbox`], carried as `sandbox_id` in every log line
/// about its runs. Stays the same across runs; workers come and go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SandboxId(Uuid);

impl SandboxId {
    /// Fresh v4 id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SandboxId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Current state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// No worker is alive; `run` may be called.
    Idle,
    /// A worker is alive.
    Running,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Code from the worker's `exit` event, or from the reaped process.
    pub exit_code: i32,
    /// Whether the watchdog killed the worker.
    pub timed_out: bool,
    /// Wall time from spawn to the end of the lifecycle.
    pub elapsed: Duration,
}

/// Handle to a run in progress.
pub struct RunHandle {
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    task: JoinHandle<RunSummary>,
}

impl RunHandle {
    /// OS process id of the worker, if it was still known at spawn.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// When the worker was spawned.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Wait until the worker has exited and been reaped.
    pub async fn wait(self) -> Result<RunSummary, CoreError> {
        self.task
            .await
            .map_err(|e| CoreError::Spawn(format!("worker lifecycle task failed: {e}")))
    }
}

/// The run currently holding the sandbox.
struct ActiveRun {
    generation: u64,
    deadline: Option<watch::Sender<Instant>>,
}

/// Ownership of the sandbox by at most one run.
///
/// Every run gets its own generation; a lifecycle only releases the slot
/// while it still holds it, so a late release never touches a newer run.
#[derive(Default)]
struct RunState {
    generations: AtomicU64,
    active: Mutex<Option<ActiveRun>>,
}

impl RunState {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the slot, or `None` if another run holds it.
    fn begin(&self) -> Option<u64> {
        let mut active = self.lock();
        if active.is_some() {
            return None;
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        *active = Some(ActiveRun {
            generation,
            deadline: None,
        });
        Some(generation)
    }

    fn arm(&self, generation: u64, deadline: watch::Sender<Instant>) {
        if let Some(run) = self.lock().as_mut().filter(|run| run.generation == generation) {
            run.deadline = Some(deadline);
        }
    }

    /// Release the slot if `generation` still holds it.
    fn finish(&self, generation: u64) -> bool {
        let mut active = self.lock();
        match active.as_ref() {
            Some(run) if run.generation == generation => {
                *active = None;
                true
            }
            _ => false,
        }
    }

    fn is_active(&self) -> bool {
        self.lock().is_some()
    }
}

/// Controller for worker processes.
///
/// A sandbox is long-lived but never reuses a process: each [`run`](Self::run)
/// spawns a fresh worker, feeds it one request, streams its events to a
/// handler, and enforces the watchdog. At most one run is active at a time.
pub struct Sandbox {
    id: SandboxId,
    config: SandboxConfig,
    cache: ModuleCache,
    state: Arc<RunState>,
}

impl Sandbox {
    /// Create a sandbox backed by the process-wide module cache.
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_cache(config, ModuleCache::shared())
    }

    /// Create a sandbox backed by the given module cache.
    pub fn with_cache(config: SandboxConfig, cache: ModuleCache) -> Self {
        let id = SandboxId::new();
        tracing::debug!(
            sandbox_id = %id,
            program = %config.worker.program.display(),
            timeout_ms = config.timeout.as_millis() as u64,
            modules = config.require.len(),
            "Creating sandbox"
        );
        Self {
            id,
            config,
            cache,
            state: Arc::new(RunState::default()),
        }
    }

    /// Get the sandbox ID.
    pub fn id(&self) -> SandboxId {
        self.id
    }

    /// Get the configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Get the module cache this sandbox reads from and writes to.
    pub fn cache(&self) -> &ModuleCache {
        &self.cache
    }

    /// Whether a worker is currently alive.
    pub fn is_running(&self) -> bool {
        self.state.is_active()
    }

    /// Get the current state.
    pub fn state(&self) -> SandboxState {
        if self.is_running() {
            SandboxState::Running
        } else {
            SandboxState::Idle
        }
    }

    /// Run `script` in a fresh worker, delivering its events to `handler`.
    ///
    /// Must be called from within a tokio runtime. Returns as soon as the
    /// worker is spawned; the lifecycle continues in the background.
    ///
    /// # Errors
    ///
    /// Fails without spawning if a run is already active, and immediately
    /// if the worker process cannot be started.
    pub fn run<H: EventHandler>(
        &self,
        script: impl Into<String>,
        handler: H,
    ) -> Result<RunHandle, CoreError> {
        let Some(generation) = self.state.begin() else {
            tracing::warn!(sandbox_id = %self.id, "Run requested while already running");
            return Err(CoreError::AlreadyRunning);
        };

        match self.spawn(script.into(), handler, generation) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.state.finish(generation);
                Err(e)
            }
        }
    }

    /// Re-arm the watchdog to the full timeout.
    ///
    /// Meant for long interactive runs; does nothing when idle.
    pub fn reset_timer(&self) {
        if !self.is_running() {
            tracing::debug!(sandbox_id = %self.id, "Timer reset: no running sandbox");
            return;
        }
        let guard = self.state.lock();
        match guard.as_ref().and_then(|run| run.deadline.as_ref()) {
            Some(deadline) => {
                deadline.send_replace(Instant::now() + self.config.timeout);
                tracing::debug!(sandbox_id = %self.id, "Sandbox timer reset");
            }
            None => tracing::warn!(sandbox_id = %self.id, "Running with no timer"),
        }
    }

    fn spawn<H: EventHandler>(
        &self,
        script: String,
        handler: H,
        generation: u64,
    ) -> Result<RunHandle, CoreError> {
        let request = Request {
            script,
            require: self.config.require.clone(),
            globals: self.config.globals.clone(),
            introspect: self.config.introspect,
            cache: self.cache.subset_for(&self.config.require),
        };
        let payload = serde_json::to_vec(&request)?;

        let worker = &self.config.worker;
        let mut child = Command::new(&worker.program)
            .args(&worker.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                tracing::error!(
                    sandbox_id = %self.id,
                    program = %worker.program.display(),
                    error = %e,
                    "Failed to spawn worker"
                );
                CoreError::Spawn(format!("{}: {e}", worker.program.display()))
            })?;

        let pid = child.id();
        let pipes = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(CoreError::Spawn("worker stdio not captured".into()));
            }
        };

        let (deadline_tx, deadline_rx) = watch::channel(Instant::now() + self.config.timeout);
        self.state.arm(generation, deadline_tx);

        tracing::debug!(
            sandbox_id = %self.id,
            pid = ?pid,
            program = %worker.program.display(),
            args = ?worker.args,
            "Spawned worker"
        );

        let lifecycle = Lifecycle {
            sandbox_id: self.id,
            timeout: self.config.timeout,
            cache: self.cache.clone(),
            state: Arc::clone(&self.state),
            generation,
            deadline: deadline_rx,
            started: Instant::now(),
        };
        let task = tokio::spawn(lifecycle.drive(child, pipes, payload, handler));

        Ok(RunHandle {
            pid,
            started_at: Utc::now(),
            task,
        })
    }
}

/// How the read loop ended.
enum Ending {
    Exited(ExitStatus),
    StreamClosed,
    TimedOut,
}

struct Lifecycle {
    sandbox_id: SandboxId,
    timeout: Duration,
    cache: ModuleCache,
    state: Arc<RunState>,
    generation: u64,
    deadline: watch::Receiver<Instant>,
    started: Instant,
}

impl Lifecycle {
    async fn drive<H: EventHandler>(
        mut self,
        mut child: Child,
        (stdin, stdout, stderr): (ChildStdin, ChildStdout, ChildStderr),
        payload: Vec<u8>,
        mut handler: H,
    ) -> RunSummary {
        tokio::spawn(forward_stderr(self.sandbox_id, stderr));

        let written = {
            let expiry = expired(&mut self.deadline);
            tokio::pin!(expiry);
            tokio::select! {
                written = write_request(stdin, &payload) => Some(written),
                _ = &mut expiry => None,
            }
        };
        match written {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                tracing::error!(sandbox_id = %self.sandbox_id, error = %e, "Script request failed");
                handler.on_exception(Exception::named(
                    "SpawnError",
                    format!("script request failed: {e}"),
                ));
                let code = kill_and_reap(&mut child, self.sandbox_id, "request write failed").await;
                return self.conclude(&mut handler, ExitStatus { code }, false);
            }
            None => return self.time_out(&mut child, &mut handler).await,
        }

        match self.pump(stdout, &mut handler).await {
            Ending::Exited(status) => {
                self.state.finish(self.generation);
                reap(&mut child, self.sandbox_id).await;
                self.conclude(&mut handler, status, false)
            }
            Ending::StreamClosed => {
                let code = reap(&mut child, self.sandbox_id).await;
                tracing::warn!(
                    sandbox_id = %self.sandbox_id,
                    code,
                    "Worker closed its output without an exit event"
                );
                self.conclude(&mut handler, ExitStatus { code }, false)
            }
            Ending::TimedOut => self.time_out(&mut child, &mut handler).await,
        }
    }

    async fn time_out<H: EventHandler>(&self, child: &mut Child, handler: &mut H) -> RunSummary {
        let code = kill_and_reap(child, self.sandbox_id, "timeout").await;
        tracing::warn!(
            sandbox_id = %self.sandbox_id,
            timeout_ms = self.timeout.as_millis() as u64,
            "Worker killed by watchdog"
        );
        handler.on_timeout(TIMEOUT_MESSAGE.to_string());
        self.conclude(handler, ExitStatus { code }, true)
    }

    /// Decode and dispatch worker output until exit, EOF, or the watchdog.
    async fn pump<H: EventHandler>(&mut self, mut stdout: ChildStdout, handler: &mut H) -> Ending {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_CHUNK];

        let expiry = expired(&mut self.deadline);
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                _ = &mut expiry => return Ending::TimedOut,

                read = stdout.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => {
                            if let Some(rest) = decoder.finish() {
                                tracing::warn!(
                                    sandbox_id = %self.sandbox_id,
                                    bytes = rest.len(),
                                    "Discarding truncated frame"
                                );
                            }
                            return Ending::StreamClosed;
                        }
                        Ok(n) => n,
                        Err(e) => {
                            tracing::warn!(sandbox_id = %self.sandbox_id, error = %e, "Worker stdout read failed");
                            return Ending::StreamClosed;
                        }
                    };

                    let values = match decoder.decode(&buf[..n]) {
                        Ok(values) => values,
                        Err(e) => {
                            tracing::warn!(sandbox_id = %self.sandbox_id, error = %e, "Dropping malformed output");
                            continue;
                        }
                    };

                    for value in values {
                        let event = match parse_frame(value) {
                            Ok(event) => event,
                            Err(e) => {
                                tracing::warn!(sandbox_id = %self.sandbox_id, error = %e, "Ignoring unrecognised frame");
                                continue;
                            }
                        };
                        tracing::trace!(sandbox_id = %self.sandbox_id, kind = event.kind(), "Worker event");
                        match event {
                            Event::Exit(status) => return Ending::Exited(status),
                            Event::CacheSave(entry) => {
                                self.cache.apply(&entry.module, entry.cache.clone());
                                handler.on_cache_save(entry);
                            }
                            other => dispatch(handler, other),
                        }
                    }
                }
            }
        }
    }

    fn conclude<H: EventHandler>(
        &self,
        handler: &mut H,
        status: ExitStatus,
        timed_out: bool,
    ) -> RunSummary {
        self.state.finish(self.generation);
        let elapsed = self.started.elapsed();
        tracing::debug!(
            sandbox_id = %self.sandbox_id,
            code = status.code,
            timed_out,
            elapsed_ms = elapsed.as_millis() as u64,
            "Worker lifecycle finished"
        );
        handler.on_exit(status);
        RunSummary {
            exit_code: status.code,
            timed_out,
            elapsed,
        }
    }
}

/// Resolves once the watchdog deadline passes, following any re-arms.
async fn expired(deadline: &mut watch::Receiver<Instant>) {
    let mut watching = true;
    loop {
        let at = *deadline.borrow_and_update();
        tokio::select! {
            _ = tokio::time::sleep_until(at) => return,
            changed = deadline.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                }
            }
        }
    }
}

async fn write_request(mut stdin: ChildStdin, payload: &[u8]) -> std::io::Result<()> {
    stdin.write_all(payload).await?;
    stdin.flush().await?;
    // Dropping stdin closes the pipe; the worker needs nothing more.
    Ok(())
}

async fn forward_stderr(sandbox_id: SandboxId, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(sandbox_id = %sandbox_id, "worker: {line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::trace!(sandbox_id = %sandbox_id, error = %e, "Worker stderr closed");
                break;
            }
        }
    }
}

/// Wait for the worker to exit on its own, killing it after a grace period.
async fn reap(child: &mut Child, sandbox_id: SandboxId) -> i32 {
    match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) => status.code().unwrap_or(-1),
        Ok(Err(e)) => {
            tracing::warn!(sandbox_id = %sandbox_id, error = %e, "Failed while waiting for worker exit");
            -1
        }
        Err(_) => kill_and_reap(child, sandbox_id, "lingering after exit").await,
    }
}

async fn kill_and_reap(child: &mut Child, sandbox_id: SandboxId, reason: &'static str) -> i32 {
    let pid = child.id();
    match child.try_wait() {
        Ok(Some(status)) => return status.code().unwrap_or(-1),
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(sandbox_id = %sandbox_id, pid = ?pid, kill_reason = reason, error = %e, "Failed to inspect worker before kill");
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::warn!(sandbox_id = %sandbox_id, pid = ?pid, kill_reason = reason, error = %e, "Failed to send kill signal to worker");
    }

    match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) => status.code().unwrap_or(-1),
        Ok(Err(e)) => {
            tracing::warn!(sandbox_id = %sandbox_id, pid = ?pid, kill_reason = reason, error = %e, "Failed while waiting for worker exit");
            -1
        }
        Err(_) => {
            tracing::warn!(sandbox_id = %sandbox_id, pid = ?pid, kill_reason = reason, "Timed out waiting for worker to exit after kill");
            -1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerCommand;
    use crate::protocol::{CacheEntry, Notice};
    use serde_json::{json, Value};

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }

        fn push(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }
    }

    impl EventHandler for Recorder {
        fn on_trace(&mut self, notice: Notice) {
            self.push(format!("trace:{}", notice.message));
        }

        fn on_cache_save(&mut self, entry: CacheEntry) {
            self.push(format!("cache.save:{}", entry.module));
        }

        fn on_result(&mut self, value: Value) {
            self.push(format!("result:{value}"));
        }

        fn on_exception(&mut self, exception: Exception) {
            self.push(format!("exception:{}", exception.message));
        }

        fn on_timeout(&mut self, message: String) {
            self.push(format!("timeout:{message}"));
        }

        fn on_exit(&mut self, status: ExitStatus) {
            self.push(format!("exit:{}", status.code));
        }
    }

    fn shell(script: &str, timeout: Duration) -> Sandbox {
        let config = SandboxConfig::builder()
            .worker(WorkerCommand::new("sh").arg("-c").arg(script))
            .timeout(timeout)
            .build()
            .unwrap();
        Sandbox::with_cache(config, ModuleCache::new())
    }

    #[test]
    fn test_sandbox_id_display() {
        let id = SandboxId::new();
        let s = format!("{}", id);
        assert_eq!(s.len(), 36);
        assert!(s.contains('-'));
    }

    #[test]
    fn test_sandbox_state_display() {
        assert_eq!(format!("{}", SandboxState::Idle), "Idle");
        assert_eq!(format!("{}", SandboxState::Running), "Running");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_immediate() {
        let config = SandboxConfig::builder()
            .worker(WorkerCommand::worker("/nonexistent/cloister-worker"))
            .build()
            .unwrap();
        let sandbox = Sandbox::with_cache(config, ModuleCache::new());

        let result = sandbox.run("1", Recorder::default());
        assert!(matches!(result, Err(CoreError::Spawn(_))));
        assert!(!sandbox.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_second_run_fails_while_running() {
        let sandbox = shell("exec sleep 5", Duration::from_millis(300));
        let recorder = Recorder::default();

        let handle = sandbox.run("1", recorder.clone()).unwrap();
        assert_eq!(sandbox.state(), SandboxState::Running);
        assert!(matches!(
            sandbox.run("2", Recorder::default()),
            Err(CoreError::AlreadyRunning)
        ));

        let summary = handle.wait().await.unwrap();
        assert!(summary.timed_out);
        assert!(!sandbox.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_worker() {
        let sandbox = shell("exec sleep 30", Duration::from_millis(50));
        let recorder = Recorder::default();

        let summary = sandbox.run("1", recorder.clone()).unwrap().wait().await.unwrap();

        assert!(summary.timed_out);
        assert!(summary.elapsed < Duration::from_secs(5));
        let events = recorder.events();
        assert_eq!(events[0], format!("timeout:{TIMEOUT_MESSAGE}"));
        assert!(events[1].starts_with("exit:"));
        assert_eq!(events.len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_events_dispatched_in_order_and_cache_applied() {
        let sandbox = shell(
            r#"cat > /dev/null; printf '%s' '{"message":{"trace":{"message":"hi"}}},{"message":{"cache.save":{"module":"m","cache":{"x":1}}}},{"message":{"result":42}},{"message":{"exit":{"code":0}}},'"#,
            Duration::from_secs(10),
        );
        let recorder = Recorder::default();

        let summary = sandbox.run("1", recorder.clone()).unwrap().wait().await.unwrap();

        assert!(!summary.timed_out);
        assert_eq!(summary.exit_code, 0);
        assert_eq!(
            recorder.events(),
            vec!["trace:hi", "cache.save:m", "result:42", "exit:0"]
        );
        assert_eq!(sandbox.cache().get("m"), Some(json!({"x": 1})));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_exit_event_is_synthesized() {
        let sandbox = shell(
            r#"cat > /dev/null; printf '%s' '{"message":{"result":1}},'; sleep 0.2; printf '%s' '{"message":{"res'; exit 3"#,
            Duration::from_secs(10),
        );
        let recorder = Recorder::default();

        let summary = sandbox.run("1", recorder.clone()).unwrap().wait().await.unwrap();

        assert_eq!(summary.exit_code, 3);
        assert_eq!(recorder.events(), vec!["result:1", "exit:3"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reset_timer_extends_deadline() {
        let sandbox = shell(
            r#"cat > /dev/null; sleep 1.5; printf '%s' '{"message":{"exit":{"code":0}}},'"#,
            Duration::from_secs(1),
        );
        let recorder = Recorder::default();

        let handle = sandbox.run("1", recorder.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        sandbox.reset_timer();

        let summary = handle.wait().await.unwrap();
        assert!(!summary.timed_out);
        assert_eq!(recorder.events(), vec!["exit:0"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lingering_worker_does_not_release_next_run() {
        // "linger" reports exit and keeps running; anything else holds on.
        let sandbox = shell(
            r#"req=$(cat); case "$req" in *linger*) printf '%s' '{"message":{"exit":{"code":0}}},'; exec sleep 1;; *) exec sleep 5;; esac"#,
            Duration::from_secs(3),
        );

        let first = sandbox.run("linger", Recorder::default()).unwrap();
        let released = async {
            while sandbox.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), released)
            .await
            .expect("exit event releases the sandbox");

        let second = sandbox.run("hold", Recorder::default()).unwrap();
        let first = first.wait().await.unwrap();
        assert!(!first.timed_out);

        assert_eq!(sandbox.state(), SandboxState::Running);
        assert!(matches!(
            sandbox.run("third", Recorder::default()),
            Err(CoreError::AlreadyRunning)
        ));

        let second = second.wait().await.unwrap();
        assert!(second.timed_out);
        assert!(!sandbox.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_write_failure_reports_exception() {
        let sandbox = shell("exit 0", Duration::from_secs(10));
        let recorder = Recorder::default();
        let script = "x".repeat(1024 * 1024);

        let summary = sandbox.run(script, recorder.clone()).unwrap().wait().await.unwrap();

        assert!(!summary.timed_out);
        let events = recorder.events();
        assert_eq!(events.len(), 2, "{events:?}");
        assert!(
            events[0].starts_with("exception:script request failed"),
            "{events:?}"
        );
        assert_eq!(events[1], "exit:0");
        assert!(!sandbox.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_while_writing_request() {
        // Never reads stdin, so a large request fills the pipe and blocks.
        let sandbox = shell("exec sleep 30", Duration::from_millis(100));
        let recorder = Recorder::default();
        let script = "x".repeat(1024 * 1024);

        let summary = sandbox.run(script, recorder.clone()).unwrap().wait().await.unwrap();

        assert!(summary.timed_out);
        let events = recorder.events();
        assert_eq!(events[0], format!("timeout:{TIMEOUT_MESSAGE}"));
        assert!(events[1].starts_with("exit:"));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_generation_cannot_release() {
        let state = RunState::default();
        let first = state.begin().unwrap();
        assert!(state.begin().is_none());
        assert!(state.finish(first));

        let second = state.begin().unwrap();
        assert_ne!(first, second);
        assert!(!state.finish(first));
        assert!(state.is_active());
        assert!(state.finish(second));
        assert!(!state.is_active());
    }

    #[tokio::test]
    async fn test_reset_timer_when_idle_is_noop() {
        let sandbox = Sandbox::with_cache(SandboxConfig::default(), ModuleCache::new());
        sandbox.reset_timer();
        assert!(!sandbox.is_running());
    }
}

//! Generic subprocess supervisor
//!
//! The child runs in its own process group so a single signal reaches every
//! helper it forks. Restart policy: exponential backoff bounded by
//! `max_restart_delay`, an attempt counter that resets once the child has
//! been up for `stable_threshold`, and a hard hold on errors marked
//! unrecoverable (hardware physically absent is the canonical case —
//! restarting cannot help, so the supervisor parks in `Failed` and waits
//! for an external change).
//!
//! `stop()` and the monitor coordinate through a cancellation token and the
//! run-task join handle, so `stop()` never returns while the child is live.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::util::panic_message;

/// Error recorded for a child exit or a failed health probe
///
/// `recoverable == false` gates the restart path: the supervisor holds
/// instead of relaunching.
#[derive(Debug, Clone)]
pub struct ProcessError {
    pub message: String,
    pub recoverable: bool,
}

impl ProcessError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: false,
        }
    }
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Async health probe run by the watchdog
pub type HealthProbe =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<(), ProcessError>> + Send + Sync>;

/// Invoked after every successful (re)start
pub type StartCallback = Arc<dyn Fn() + Send + Sync>;
/// Invoked after every exit; `None` means an orderly stop
pub type StopCallback = Arc<dyn Fn(Option<&ProcessError>) + Send + Sync>;
/// Invoked before each restart attempt with the attempt number
pub type RestartCallback = Arc<dyn Fn(u32) + Send + Sync>;
/// Awaited after the backoff sleep and before the relaunch; recovery work
/// (e.g. a USB reset) completes before the child comes back
pub type PreRestartHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Supervisor policy and child description
#[derive(Clone)]
pub struct SupervisorConfig {
    /// Name used in log fields
    pub name: String,
    /// Binary path
    pub binary: String,
    /// Arguments
    pub args: Vec<String>,
    /// Extra environment
    pub env: Vec<(String, String)>,
    /// Working directory
    pub working_dir: Option<std::path::PathBuf>,
    /// Relaunch after an unexpected exit
    pub restart_on_failure: bool,
    /// First restart delay
    pub initial_restart_delay: Duration,
    /// Restart delay ceiling
    pub max_restart_delay: Duration,
    /// Give up after this many attempts; 0 = unlimited
    pub max_restart_attempts: u32,
    /// Uptime after which the attempt counter resets
    pub stable_threshold: Duration,
    /// SIGTERM grace period before SIGKILL
    pub graceful_timeout: Duration,
    /// Watchdog probe; `None` disables the watchdog
    pub health_check: Option<HealthProbe>,
    /// Watchdog cadence
    pub health_check_interval: Duration,
    /// Bound on a single probe run
    pub health_check_timeout: Duration,
    /// Recovery work awaited before each relaunch
    pub pre_restart: Option<PreRestartHook>,
    pub on_start: Option<StartCallback>,
    pub on_stop: Option<StopCallback>,
    pub on_restart: Option<RestartCallback>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            name: "child".to_string(),
            binary: String::new(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            restart_on_failure: true,
            initial_restart_delay: Duration::from_secs(1),
            max_restart_delay: Duration::from_secs(60),
            max_restart_attempts: 0,
            stable_threshold: Duration::from_secs(60),
            graceful_timeout: Duration::from_secs(10),
            health_check: None,
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            pre_restart: None,
            on_start: None,
            on_stop: None,
            on_restart: None,
        }
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStatus {
    Stopped,
    Starting,
    Running,
    Failed,
}

/// Snapshot of the supervisor state
#[derive(Debug, Clone)]
pub struct SupervisorStats {
    pub status: SupervisorStatus,
    pub pid: Option<u32>,
    pub uptime: Option<Duration>,
    pub restart_count: u32,
    pub last_error: Option<ProcessError>,
}

struct State {
    status: SupervisorStatus,
    pid: Option<u32>,
    started_at: Option<Instant>,
    last_error: Option<ProcessError>,
}

struct Inner {
    config: SupervisorConfig,
    state: RwLock<State>,
    restart_count: AtomicU32,
    /// Error staged by the watchdog before it kills the child, consumed by
    /// the monitor when the exit is observed
    pending_error: StdMutex<Option<ProcessError>>,
    stop_token: StdMutex<CancellationToken>,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

/// Supervises a single subprocess
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: RwLock::new(State {
                    status: SupervisorStatus::Stopped,
                    pid: None,
                    started_at: None,
                    last_error: None,
                }),
                restart_count: AtomicU32::new(0),
                pending_error: StdMutex::new(None),
                stop_token: StdMutex::new(CancellationToken::new()),
                run_task: Mutex::new(None),
            }),
        }
    }

    /// Spawn the child and begin supervising it
    ///
    /// Errors if the supervisor is already starting or running, or if the
    /// first spawn fails (in which case the state is `Failed`).
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write().expect("state lock poisoned");
            match state.status {
                SupervisorStatus::Stopped | SupervisorStatus::Failed => {
                    state.status = SupervisorStatus::Starting;
                    state.last_error = None;
                }
                _ => {
                    return Err(Error::Supervisor(format!(
                        "{} is already running",
                        self.inner.config.name
                    )))
                }
            }
        }
        self.inner.restart_count.store(0, Ordering::Relaxed);
        *self.inner.pending_error.lock().expect("pending lock poisoned") = None;

        let child = match spawn_child(&self.inner.config) {
            Ok(child) => child,
            Err(e) => {
                let mut state = self.inner.state.write().expect("state lock poisoned");
                state.status = SupervisorStatus::Failed;
                state.last_error = Some(ProcessError::recoverable(e.to_string()));
                return Err(e);
            }
        };

        mark_running(&self.inner, &child);
        run_callback_start(&self.inner);

        let token = CancellationToken::new();
        *self.inner.stop_token.lock().expect("token lock poisoned") = token.clone();

        let handle = tokio::spawn(run_loop(self.inner.clone(), child, token));
        *self.inner.run_task.lock().await = Some(handle);

        Ok(())
    }

    /// Stop the child and wait until it is gone
    ///
    /// Idempotent; calling on a stopped supervisor is a no-op.
    pub async fn stop(&self) {
        let token = self
            .inner
            .stop_token
            .lock()
            .expect("token lock poisoned")
            .clone();
        token.cancel();

        if let Some(handle) = self.inner.run_task.lock().await.take() {
            let _ = handle.await;
        }
    }

    pub fn status(&self) -> SupervisorStatus {
        self.inner.state.read().expect("state lock poisoned").status
    }

    pub fn is_running(&self) -> bool {
        self.status() == SupervisorStatus::Running
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.state.read().expect("state lock poisoned").pid
    }

    /// Uptime of the current child, if one is running
    pub fn uptime(&self) -> Option<Duration> {
        self.inner
            .state
            .read()
            .expect("state lock poisoned")
            .started_at
            .map(|t| t.elapsed())
    }

    pub fn restart_count(&self) -> u32 {
        self.inner.restart_count.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<ProcessError> {
        self.inner
            .state
            .read()
            .expect("state lock poisoned")
            .last_error
            .clone()
    }

    pub fn stats(&self) -> SupervisorStats {
        let state = self.inner.state.read().expect("state lock poisoned");
        SupervisorStats {
            status: state.status,
            pid: state.pid,
            uptime: state.started_at.map(|t| t.elapsed()),
            restart_count: self.inner.restart_count.load(Ordering::Relaxed),
            last_error: state.last_error.clone(),
        }
    }
}

fn spawn_child(config: &SupervisorConfig) -> Result<Child> {
    let mut cmd = Command::new(&config.binary);
    cmd.args(&config.args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Own process group: one signal reaches every child it forks
        .process_group(0);
    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Supervisor(format!("spawn {}: {}", config.binary, e)))?;

    if let Some(stdout) = child.stdout.take() {
        let name = config.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(child = %name, "{}", line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let name = config.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(child = %name, "{}", line);
            }
        });
    }

    Ok(child)
}

fn mark_running(inner: &Arc<Inner>, child: &Child) {
    let mut state = inner.state.write().expect("state lock poisoned");
    state.status = SupervisorStatus::Running;
    state.pid = child.id();
    state.started_at = Some(Instant::now());
}

fn mark_exited(inner: &Arc<Inner>, status: SupervisorStatus, error: Option<ProcessError>) {
    let mut state = inner.state.write().expect("state lock poisoned");
    state.status = status;
    state.pid = None;
    state.started_at = None;
    if error.is_some() {
        state.last_error = error;
    }
}

fn signal_group(pid: u32, signal: Signal) {
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        tracing::debug!(pid, %signal, error = %e, "process group signal failed");
    }
}

fn run_callback_start(inner: &Arc<Inner>) {
    if let Some(callback) = inner.config.on_start.clone() {
        isolate(&inner.config.name, "on_start", move || callback());
    }
}

fn run_callback_stop(inner: &Arc<Inner>, error: Option<&ProcessError>) {
    if let Some(callback) = inner.config.on_stop.clone() {
        isolate(&inner.config.name, "on_stop", move || callback(error));
    }
}

fn run_callback_restart(inner: &Arc<Inner>, attempt: u32) {
    if let Some(callback) = inner.config.on_restart.clone() {
        isolate(&inner.config.name, "on_restart", move || callback(attempt));
    }
}

fn isolate<F: FnOnce()>(name: &str, which: &'static str, callback: F) {
    if let Err(p) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)) {
        tracing::error!(child = %name, callback = which, panic = %panic_message(p), "lifecycle callback panicked");
    }
}

async fn graceful_kill(inner: &Arc<Inner>, child: &mut Child) {
    let Some(pid) = child.id() else {
        let _ = child.wait().await;
        return;
    };

    signal_group(pid, Signal::SIGTERM);
    match tokio::time::timeout(inner.config.graceful_timeout, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            tracing::warn!(
                child = %inner.config.name,
                pid,
                "graceful timeout elapsed, escalating to SIGKILL"
            );
            signal_group(pid, Signal::SIGKILL);
            let _ = child.wait().await;
        }
    }
}

/// Monitor + restart loop; one instance per `start()`
async fn run_loop(inner: Arc<Inner>, first_child: Child, token: CancellationToken) {
    let mut current = Some(first_child);
    let mut attempt: u32 = 0;

    loop {
        let exit_error = match current.take() {
            Some(mut child) => {
                let started = Instant::now();
                let pid = child.id().unwrap_or_default();

                let wait_outcome = tokio::select! {
                    _ = token.cancelled() => {
                        graceful_kill(&inner, &mut child).await;
                        mark_exited(&inner, SupervisorStatus::Stopped, None);
                        run_callback_stop(&inner, None);
                        tracing::info!(child = %inner.config.name, "stopped");
                        return;
                    }
                    status = child.wait() => status,
                    _ = health_watchdog(&inner, pid) => unreachable!("watchdog never resolves"),
                };

                let staged = inner
                    .pending_error
                    .lock()
                    .expect("pending lock poisoned")
                    .take();
                let error = staged.unwrap_or_else(|| match wait_outcome {
                    Ok(status) => ProcessError::recoverable(format!(
                        "exited unexpectedly with {}",
                        status
                    )),
                    Err(e) => ProcessError::recoverable(format!("wait failed: {}", e)),
                });

                if started.elapsed() >= inner.config.stable_threshold {
                    attempt = 0;
                    inner.restart_count.store(0, Ordering::Relaxed);
                }
                error
            }
            None => inner
                .pending_error
                .lock()
                .expect("pending lock poisoned")
                .take()
                .unwrap_or_else(|| ProcessError::recoverable("respawn failed")),
        };

        tracing::warn!(
            child = %inner.config.name,
            error = %exit_error,
            recoverable = exit_error.recoverable,
            "child exited unexpectedly"
        );
        mark_exited(&inner, SupervisorStatus::Starting, Some(exit_error.clone()));
        run_callback_stop(&inner, Some(&exit_error));

        if !inner.config.restart_on_failure {
            mark_exited(&inner, SupervisorStatus::Failed, None);
            return;
        }
        if !exit_error.recoverable {
            tracing::error!(
                child = %inner.config.name,
                error = %exit_error,
                "unrecoverable failure, holding without restart"
            );
            mark_exited(&inner, SupervisorStatus::Failed, None);
            return;
        }

        attempt += 1;
        if inner.config.max_restart_attempts != 0 && attempt > inner.config.max_restart_attempts {
            tracing::error!(
                child = %inner.config.name,
                attempts = attempt - 1,
                "restart attempts exhausted"
            );
            mark_exited(&inner, SupervisorStatus::Failed, None);
            return;
        }
        inner.restart_count.store(attempt, Ordering::Relaxed);

        let delay = restart_delay(
            inner.config.initial_restart_delay,
            inner.config.max_restart_delay,
            attempt,
        );
        tracing::info!(
            child = %inner.config.name,
            attempt,
            delay = ?delay,
            "restarting after backoff"
        );

        tokio::select! {
            _ = token.cancelled() => {
                mark_exited(&inner, SupervisorStatus::Stopped, None);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        if let Some(hook) = inner.config.pre_restart.clone() {
            hook().await;
        }
        run_callback_restart(&inner, attempt);

        match spawn_child(&inner.config) {
            Ok(child) => {
                mark_running(&inner, &child);
                run_callback_start(&inner);
                current = Some(child);
            }
            Err(e) => {
                *inner.pending_error.lock().expect("pending lock poisoned") =
                    Some(ProcessError::recoverable(e.to_string()));
                current = None;
            }
        }
    }
}

/// `min(initial * 2^(attempt-1), max)` with overflow clamping
fn restart_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    initial
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(max)
}

/// Three-strike health watchdog
///
/// Never resolves: at the third consecutive failure it stages the error and
/// SIGKILLs the group, then parks until the monitor observes the exit and
/// drops this future.
async fn health_watchdog(inner: &Arc<Inner>, pid: u32) {
    let Some(probe) = inner.config.health_check.clone() else {
        std::future::pending::<()>().await;
        unreachable!()
    };

    let mut interval = tokio::time::interval(inner.config.health_check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await; // consume the immediate first tick

    let mut failures: u32 = 0;
    loop {
        interval.tick().await;

        let outcome = tokio::time::timeout(inner.config.health_check_timeout, probe()).await;
        let error = match outcome {
            Ok(Ok(())) => {
                failures = 0;
                continue;
            }
            Ok(Err(e)) => e,
            Err(_) => ProcessError::recoverable("health check timed out"),
        };

        failures += 1;
        tracing::warn!(
            child = %inner.config.name,
            failures,
            error = %error,
            "health check failed"
        );

        if failures >= 3 {
            *inner.pending_error.lock().expect("pending lock poisoned") = Some(ProcessError {
                message: "killed due to health check failure after 3 consecutive failures"
                    .to_string(),
                recoverable: error.recoverable,
            });
            signal_group(pid, Signal::SIGKILL);
            // The monitor sees the exit and tears this future down
            std::future::pending::<()>().await;
        }
    }
}

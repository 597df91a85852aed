//! Execution controller.
//!
//! Spawns the external engine for one segment and monitors it from a
//! background task: liveness is checked on a timed poll rather than a
//! blocking wait, so progress snapshots can be taken cooperatively and
//! a stop request is honored between ticks. Stopping is graceful first
//! (SIGTERM, bounded grace period) and forceful second.
//!
//! Cancellation is an explicit token handed in by the caller; OS signal
//! handlers should only ever cancel that token.

use crate::backend::EngineInvocation;
use crate::errors::EngineError;
use crate::observer::{ProgressObserver, ProgressSnapshot};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Lifecycle of a single engine run. Terminal states are only left by
/// a fresh `run()` call, which creates a new handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

/// How an engine run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit code 0.
    Completed,
    /// Nonzero exit code.
    Failed { code: i32 },
    /// Terminated by a stop request. On-disk segment status is left for
    /// the resume resolver to reclassify.
    Stopped,
}

/// Called with every progress snapshot taken while the engine runs.
pub type ProgressCallback = Box<dyn Fn(ProgressSnapshot) + Send + Sync>;

/// Spawns and supervises engine subprocesses, one at a time.
pub struct ExecutionController {
    poll_interval: Duration,
    stop_grace: Duration,
}

impl ExecutionController {
    pub fn new(poll_interval: Duration, stop_grace: Duration) -> Self {
        Self {
            poll_interval,
            stop_grace,
        }
    }

    /// Spawn the engine and a monitoring task for it.
    ///
    /// The monitor polls liveness every `poll_interval`; while the
    /// process is alive it observes the working directory and forwards
    /// snapshots to `on_progress`. Cancelling `cancel` requests a
    /// graceful stop.
    pub fn run(
        &self,
        invocation: EngineInvocation,
        cancel: CancellationToken,
        on_progress: ProgressCallback,
    ) -> Result<RunHandle, EngineError> {
        std::fs::create_dir_all(&invocation.working_dir).map_err(EngineError::Spawn)?;

        info!(
            command = %invocation.display(),
            dir = %invocation.working_dir.display(),
            "Starting engine"
        );

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            // The engine writes its own log file; piping stdout would
            // only risk filling a pipe nobody drains.
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(EngineError::Spawn)?;

        let pid = child.id();
        info!(pid, "Engine process spawned");

        let state = Arc::new(Mutex::new(RunState::Running));
        let monitor_state = Arc::clone(&state);
        let monitor_cancel = cancel.clone();
        let poll_interval = self.poll_interval;
        let stop_grace = self.stop_grace;
        let working_dir = invocation.working_dir.clone();

        let task = tokio::spawn(async move {
            let observer = ProgressObserver::new();
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = monitor_cancel.cancelled() => {
                        info!(pid, "Stop requested, terminating engine");
                        terminate(&mut child, stop_grace).await;
                        set_state(&monitor_state, RunState::Stopped);
                        return Ok(RunOutcome::Stopped);
                    }
                    _ = ticker.tick() => {
                        match child.try_wait().map_err(EngineError::Wait)? {
                            Some(status) => {
                                let code = status.code().unwrap_or(-1);
                                if code == 0 {
                                    info!(pid, "Engine completed");
                                    set_state(&monitor_state, RunState::Completed);
                                    return Ok(RunOutcome::Completed);
                                }
                                warn!(pid, code, "Engine exited with failure");
                                set_state(&monitor_state, RunState::Failed);
                                return Ok(RunOutcome::Failed { code });
                            }
                            None => {
                                let snapshot = observer.observe(&working_dir);
                                on_progress(snapshot);
                            }
                        }
                    }
                }
            }
        });

        Ok(RunHandle {
            state,
            cancel,
            pid,
            task,
        })
    }
}

/// Handle to one supervised engine run.
pub struct RunHandle {
    state: Arc<Mutex<RunState>>,
    cancel: CancellationToken,
    pid: Option<u32>,
    task: JoinHandle<Result<RunOutcome, EngineError>>,
}

impl RunHandle {
    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request a graceful stop. Safe to call any number of times, and a
    /// no-op once the run has reached a terminal state.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to end.
    pub async fn wait(self) -> Result<RunOutcome, EngineError> {
        self.task.await.map_err(|e| EngineError::Monitor {
            message: e.to_string(),
        })?
    }
}

fn set_state(state: &Mutex<RunState>, value: RunState) {
    *state.lock().unwrap_or_else(|e| e.into_inner()) = value;
}

/// Graceful-then-forceful termination: SIGTERM, wait out the grace
/// period, SIGKILL if the engine is still alive.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        match timeout(grace, child.wait()).await {
            Ok(_) => return,
            Err(_) => warn!(pid, "Grace period expired, force-killing engine"),
        }
    }

    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill engine process");
    }
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn controller() -> ExecutionController {
        ExecutionController::new(Duration::from_millis(50), Duration::from_secs(2))
    }

    fn shell(dir: PathBuf, script: &str) -> EngineInvocation {
        EngineInvocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: dir,
        }
    }

    fn no_progress() -> ProgressCallback {
        Box::new(|_| {})
    }

    #[tokio::test]
    async fn clean_exit_is_completed() {
        let dir = tempdir().unwrap();
        let handle = controller()
            .run(
                shell(dir.path().to_path_buf(), "exit 0"),
                CancellationToken::new(),
                no_progress(),
            )
            .unwrap();
        assert_eq!(handle.wait().await.unwrap(), RunOutcome::Completed);
    }

    #[tokio::test]
    async fn nonzero_exit_reports_code() {
        let dir = tempdir().unwrap();
        let handle = controller()
            .run(
                shell(dir.path().to_path_buf(), "exit 3"),
                CancellationToken::new(),
                no_progress(),
            )
            .unwrap();
        assert_eq!(handle.wait().await.unwrap(), RunOutcome::Failed { code: 3 });
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let dir = tempdir().unwrap();
        let invocation = EngineInvocation {
            program: "/nonexistent/engine-binary".to_string(),
            args: vec![],
            working_dir: dir.path().to_path_buf(),
        };
        let result = controller().run(invocation, CancellationToken::new(), no_progress());
        assert!(matches!(result, Err(EngineError::Spawn(_))));
    }

    #[tokio::test]
    async fn stop_terminates_a_long_run() {
        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let handle = controller()
            .run(
                shell(dir.path().to_path_buf(), "sleep 30"),
                cancel.clone(),
                no_progress(),
            )
            .unwrap();
        assert_eq!(handle.state(), RunState::Running);

        handle.request_stop();
        assert_eq!(handle.wait().await.unwrap(), RunOutcome::Stopped);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn progress_callback_sees_snapshots_while_running() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("md.log"), "  500   1.0\n").unwrap();

        let observed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&observed);
        let handle = controller()
            .run(
                shell(dir.path().to_path_buf(), "sleep 0.4"),
                CancellationToken::new(),
                Box::new(move |snap| {
                    if snap.current_step == 500 {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();

        assert_eq!(handle.wait().await.unwrap(), RunOutcome::Completed);
        assert!(observed.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn state_reaches_terminal_after_exit() {
        let dir = tempdir().unwrap();
        let handle = controller()
            .run(
                shell(dir.path().to_path_buf(), "exit 0"),
                CancellationToken::new(),
                no_progress(),
            )
            .unwrap();
        let state = Arc::clone(&handle.state);
        handle.wait().await.unwrap();
        assert_eq!(*state.lock().unwrap(), RunState::Completed);
        assert!(RunState::Completed.is_terminal());
    }
}

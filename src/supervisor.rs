//! Agent subprocess supervision
//!
//! Owns the external CLI agent process for a session: spawning with
//! turn-appropriate arguments, the per-turn cancellation token, the
//! inactivity watchdog, and exit interpretation. The supervisor is the
//! stream's single writer - decoded events leave through one bounded
//! channel in exactly line-completion order.

mod exit;

pub use exit::{classify_exit, ExitClass};

use crate::stream::{classify_line, FrameError, FrameReader, StreamEvent};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Watchdog: terminate the subprocess after this long with no output
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// How long a terminated process gets to exit before SIGKILL
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Static configuration for spawning the agent CLI
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub working_dir: Option<PathBuf>,
    pub idle_timeout: Duration,
    /// Extra args appended after the standard set
    pub extra_args: Vec<String>,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            working_dir: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            extra_args: Vec::new(),
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    fn build(&self, prompt: &str, options: &TurnOptions) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--print")
            .arg(prompt)
            .args(["--output-format", "stream-json", "--verbose"]);
        if let Some(model) = &options.model {
            cmd.args(["--model", model]);
        }
        if let Some(session_id) = &options.resume_session {
            cmd.args(["--resume", session_id]);
        }
        if options.plan_mode {
            cmd.args(["--permission-mode", "plan"]);
        }
        if options.thinking_mode {
            cmd.env("MAX_THINKING_TOKENS", "16000");
        }
        cmd.args(&self.extra_args);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Per-turn parameters chosen by the host
#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    pub model: Option<String>,
    /// Session to resume, once the first init has assigned one
    pub resume_session: Option<String>,
    pub plan_mode: bool,
    pub thinking_mode: bool,
}

/// How a turn's process finished
#[derive(Debug)]
pub struct TurnExit {
    pub class: ExitClass,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("a turn is already in progress for this session")]
    TurnInProgress,
    #[error("failed to spawn agent process: {0}")]
    Spawn(std::io::Error),
    #[error("agent produced no output for {0:?}")]
    Watchdog(Duration),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Supervises at most one live agent subprocess.
///
/// `run_turn` refuses to start while a prior turn for this session has
/// neither completed nor been aborted.
pub struct TurnSupervisor {
    command: AgentCommand,
    running: AtomicBool,
    cancel: std::sync::Mutex<Option<CancellationToken>>,
    /// Child stdin while a turn is live, for in-band control lines
    control: Mutex<Option<ChildStdin>>,
}

impl TurnSupervisor {
    pub fn new(command: AgentCommand) -> Self {
        Self {
            command,
            running: AtomicBool::new(false),
            cancel: std::sync::Mutex::new(None),
            control: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Abort the live turn, if any. Idempotent: a second call (or a call
    /// with no live turn) is a no-op.
    pub fn request_stop(&self) {
        if let Ok(guard) = self.cancel.lock() {
            if let Some(token) = guard.as_ref() {
                tracing::info!("stop requested, cancelling turn");
                token.cancel();
            }
        }
    }

    /// Write one in-band control line to the live process's stdin.
    /// Returns false when no structured channel is open.
    pub async fn send_control(&self, line: &str) -> bool {
        let mut guard = self.control.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return false;
        };
        let framed = format!("{line}\n");
        match stdin.write_all(framed.as_bytes()).await {
            Ok(()) => {
                let _ = stdin.flush().await;
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "control write failed");
                false
            }
        }
    }

    /// Run one turn to completion, sending decoded events through
    /// `events` in arrival order.
    pub async fn run_turn(
        &self,
        prompt: &str,
        options: &TurnOptions,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<TurnExit, SupervisorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SupervisorError::TurnInProgress);
        }
        let _turn_guard = TurnGuard { supervisor: self };

        let token = CancellationToken::new();
        if let Ok(mut slot) = self.cancel.lock() {
            *slot = Some(token.clone());
        }

        let mut cmd = self.command.build(prompt, options);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(program = %self.command.program, "spawning agent process");
        let mut child = cmd.spawn().map_err(SupervisorError::Spawn)?;

        let mut stdout = child.stdout.take().ok_or_else(|| {
            SupervisorError::Spawn(std::io::Error::other("agent stdout not captured"))
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| {
            SupervisorError::Spawn(std::io::Error::other("agent stderr not captured"))
        })?;
        *self.control.lock().await = child.stdin.take();

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let idle = self.command.idle_timeout;
        let mut frames = FrameReader::new();
        let mut chunk = [0u8; 8192];
        let mut deadline = tokio::time::Instant::now() + idle;
        let mut aborted = false;
        let mut watchdog_fired = false;
        let mut overflow: Option<FrameError> = None;

        loop {
            tokio::select! {
                biased;

                () = token.cancelled(), if !aborted => {
                    aborted = true;
                    tracing::info!("turn cancelled, terminating agent process");
                    Self::terminate(&mut child).await;
                    break;
                }

                () = tokio::time::sleep_until(deadline) => {
                    watchdog_fired = true;
                    tracing::warn!(timeout = ?idle, "inactivity watchdog expired");
                    Self::terminate(&mut child).await;
                    break;
                }

                read = stdout.read(&mut chunk) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        // Any output resets the watchdog
                        deadline = tokio::time::Instant::now() + idle;
                        let text = String::from_utf8_lossy(chunk.get(..n).unwrap_or_default());
                        match frames.push(&text) {
                            Ok(complete) => {
                                for frame in complete {
                                    Self::emit(&events, &frame).await;
                                }
                            }
                            Err(e) => {
                                overflow = Some(e);
                                Self::terminate(&mut child).await;
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "agent stdout read failed");
                        break;
                    }
                },
            }
        }

        if overflow.is_none() {
            match frames.finish() {
                Ok(complete) => {
                    for frame in complete {
                        Self::emit(&events, &frame).await;
                    }
                }
                Err(e) => overflow = Some(e),
            }
        }

        // Structured channel closes with the turn
        *self.control.lock().await = None;

        let status = match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(result) => result.ok(),
            Err(_) => {
                let _ = child.start_kill();
                child.wait().await.ok()
            }
        };
        let stderr_text = stderr_task.await.unwrap_or_default();

        if watchdog_fired {
            return Err(SupervisorError::Watchdog(idle));
        }
        if let Some(e) = overflow {
            return Err(e.into());
        }

        // A stop can race EOF; once requested, the turn is an abort
        let aborted = aborted || token.is_cancelled();
        let code = status.and_then(|s| s.code());
        let class = classify_exit(code, aborted, &stderr_text);
        tracing::info!(?code, ?class, "agent process finished");
        Ok(TurnExit {
            class,
            stderr: stderr_text,
        })
    }

    async fn emit(events: &mpsc::Sender<StreamEvent>, frame: &str) {
        match classify_line(frame) {
            Ok(decoded) => {
                for event in decoded {
                    if events.send(event).await.is_err() {
                        // Receiver gone; keep draining the process quietly
                        return;
                    }
                }
            }
            Err(e) => {
                // Malformed line: log, skip, keep the turn alive
                tracing::warn!(error = %e, "skipping malformed stream line");
            }
        }
    }

    /// Ask the process to exit, escalating to SIGKILL after a grace
    /// period.
    async fn terminate(child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Ok(raw) = i32::try_from(pid) {
                let _ = kill(Pid::from_raw(raw), Signal::SIGTERM);
                if tokio::time::timeout(EXIT_GRACE, child.wait()).await.is_ok() {
                    return;
                }
            }
        }
        if let Err(e) = child.start_kill() {
            tracing::debug!(error = %e, "kill failed (process already gone?)");
        }
    }
}

/// Resets the running flag and cancel slot when a turn ends on any path
struct TurnGuard<'a> {
    supervisor: &'a TurnSupervisor,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.supervisor.cancel.lock() {
            *slot = None;
        }
        self.supervisor.running.store(false, Ordering::SeqCst);
    }
}

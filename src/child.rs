/// Child process lifecycle: spawn the wrapped server with a piped stdin,
/// deliver signals to it, and wait for it to exit.
use crate::input::ChildInput;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::{Child, Command};

/// Errors that end supervision.
#[derive(Debug)]
pub enum ChildError {
    /// Failed to spawn the wrapped program.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The spawned child has no stdin pipe.
    MissingStdin,
    /// The spawned child reported no process id.
    MissingPid,
    /// Waiting on the child failed.
    Wait { source: std::io::Error },
    /// The child exited unsuccessfully or was killed by a signal.
    AbnormalExit { status: ExitStatus },
}

impl std::fmt::Display for ChildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program, source)
            }
            ChildError::MissingStdin => write!(f, "child process has no stdin pipe"),
            ChildError::MissingPid => write!(f, "child process has no process id"),
            ChildError::Wait { source } => {
                write!(f, "failed to wait for child process: {}", source)
            }
            ChildError::AbnormalExit { status } => {
                write!(f, "child process exited abnormally: {}", status)
            }
        }
    }
}

impl std::error::Error for ChildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChildError::Spawn { source, .. } => Some(source),
            ChildError::Wait { source } => Some(source),
            ChildError::MissingStdin
            | ChildError::MissingPid
            | ChildError::AbnormalExit { .. } => None,
        }
    }
}

impl ChildError {
    /// Exit code the supervisor should report for this error.
    ///
    /// Mirrors the child's own code, or `128 + signal` when it was killed.
    pub fn exit_code(&self) -> i32 {
        match self {
            ChildError::AbnormalExit { status } => match (status.code(), status.signal()) {
                (Some(code), _) if code != 0 => code,
                (_, Some(sig)) => 128 + sig,
                _ => 1,
            },
            _ => 1,
        }
    }
}

/// Errors produced when delivering a signal to the child.
#[derive(Debug, PartialEq, Eq)]
pub enum SignalError {
    /// The child has already exited and been reaped.
    AlreadyExited { pid: u32 },
    /// `kill(2)` failed.
    Delivery {
        pid: u32,
        signal: Signal,
        errno: Errno,
    },
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::AlreadyExited { pid } => {
                write!(f, "process {} has already exited", pid)
            }
            SignalError::Delivery { pid, signal, errno } => {
                write!(
                    f,
                    "failed to send {} to process {}: {}",
                    signal.as_str(),
                    pid,
                    errno
                )
            }
        }
    }
}

impl std::error::Error for SignalError {}

/// Delivers OS signals to the supervised process.
///
/// Implementations must tolerate concurrent calls.
pub trait Signaller: Send + Sync {
    fn send(&self, signal: Signal) -> Result<(), SignalError>;
}

/// Signals a single process by PID, refusing once the process is reaped so a
/// recycled PID is never hit.
#[derive(Debug)]
pub struct ProcessSignaller {
    pid: u32,
    exited: AtomicBool,
}

impl ProcessSignaller {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            exited: AtomicBool::new(false),
        }
    }

    pub fn mark_exited(&self) {
        self.exited.store(true, Ordering::Release);
    }
}

impl Signaller for ProcessSignaller {
    fn send(&self, sig: Signal) -> Result<(), SignalError> {
        if self.exited.load(Ordering::Acquire) {
            return Err(SignalError::AlreadyExited { pid: self.pid });
        }
        signal::kill(Pid::from_raw(self.pid as i32), sig).map_err(|errno| match errno {
            Errno::ESRCH => SignalError::AlreadyExited { pid: self.pid },
            errno => SignalError::Delivery {
                pid: self.pid,
                signal: sig,
                errno,
            },
        })
    }
}

/// A running child with its stdin pipe and signal handle split out for
/// sharing.
pub struct ChildProcess {
    child: Child,
    pid: u32,
    input: ChildInput,
    signaller: Arc<ProcessSignaller>,
}

/// Spawn `program` with `args`.
///
/// stdout and stderr are inherited; stdin is piped. The child gets its own
/// process group so a terminal Ctrl-C reaches only the supervisor, which then
/// decides how to stop it.
pub fn spawn(program: &str, args: &[String]) -> Result<ChildProcess, ChildError> {
    tracing::info!(program, args = ?args, "spawning child process");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .process_group(0)
        .spawn()
        .map_err(|e| ChildError::Spawn {
            program: program.to_string(),
            source: e,
        })?;

    let stdin = child.stdin.take().ok_or(ChildError::MissingStdin)?;
    let pid = require_pid(child.id())?;
    tracing::info!(pid, "child process started");

    Ok(ChildProcess {
        child,
        pid,
        input: ChildInput::new(stdin),
        signaller: Arc::new(ProcessSignaller::new(pid)),
    })
}

/// A missing or zero PID is an error: `kill(0, ..)` would signal the
/// supervisor's own process group.
fn require_pid(id: Option<u32>) -> Result<u32, ChildError> {
    match id {
        Some(pid) if pid > 0 => Ok(pid),
        _ => Err(ChildError::MissingPid),
    }
}

impl ChildProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn input(&self) -> ChildInput {
        self.input.clone()
    }

    pub fn signaller(&self) -> Arc<ProcessSignaller> {
        Arc::clone(&self.signaller)
    }

    /// Wait for the child to exit, then close its stdin and disarm the
    /// signaller. A non-success exit is returned as [`ChildError::AbnormalExit`].
    pub async fn wait(mut self) -> Result<ExitStatus, ChildError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ChildError::Wait { source: e })?;

        self.signaller.mark_exited();
        self.input.close().await;

        tracing::info!(
            pid = self.pid,
            exit_code = ?status.code(),
            signal = ?status.signal(),
            "child process exited"
        );

        if status.success() {
            Ok(status)
        } else {
            Err(ChildError::AbnormalExit { status })
        }
    }
}

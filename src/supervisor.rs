/// Wires the child, the shutdown escalator, the signal listener and the
/// console relay together, then waits for the child to exit.
use crate::child::{self, ChildError};
use crate::config::WrapperConfig;
use crate::escalator::{Escalator, ShutdownStage};
use crate::notify::Notifier;
use crate::relay;
use crate::signals::SignalListener;
use std::process::ExitStatus;
use tokio::io::AsyncBufRead;

/// Errors that end supervision.
#[derive(Debug)]
pub enum SupervisorError {
    /// Registering the OS signal handlers failed.
    Signals { source: std::io::Error },
    /// Launching or waiting on the child failed, or it exited abnormally.
    Child(ChildError),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Signals { source } => {
                write!(f, "failed to install signal handlers: {}", source)
            }
            SupervisorError::Child(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Signals { source } => Some(source),
            SupervisorError::Child(e) => Some(e),
        }
    }
}

impl From<ChildError> for SupervisorError {
    fn from(e: ChildError) -> Self {
        SupervisorError::Child(e)
    }
}

impl SupervisorError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorError::Signals { .. } => 1,
            SupervisorError::Child(e) => e.exit_code(),
        }
    }
}

/// Run `program` under supervision until it exits.
///
/// `console` is relayed into the child's stdin for the whole run.
pub async fn supervise<R>(
    program: &str,
    args: &[String],
    config: WrapperConfig,
    console: R,
) -> Result<ExitStatus, SupervisorError>
where
    R: AsyncBufRead + Send + Unpin + 'static,
{
    let listener =
        SignalListener::install().map_err(|e| SupervisorError::Signals { source: e })?;

    let child = child::spawn(program, args)?;
    let input = child.input();
    tracing::info!(pid = child.pid(), "supervising child process");

    let escalator = Escalator::new(config.shutdown, input.clone(), child.signaller());
    let notifier = Notifier::new(config.notify, input.clone(), escalator.clone());

    let signal_task = listener.spawn(escalator.clone(), notifier);
    let relay_task = relay::spawn_relay(console, input);

    let result = child.wait().await;

    signal_task.abort();
    relay_task.abort();

    let stage = escalator.stage();
    if stage != ShutdownStage::None {
        tracing::info!(%stage, "child exited during shutdown");
    }

    result.map_err(SupervisorError::from)
}

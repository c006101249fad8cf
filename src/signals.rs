/// Signal handling for staged shutdown.
///
/// SIGINT and SIGTERM escalate immediately; SIGUSR1 announces a countdown on
/// the server console first. Every signal is handed to its own task so a slow
/// console write never delays or drops the next signal.
use crate::escalator::Escalator;
use crate::notify::Notifier;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;

/// The two ways a shutdown can be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownRequest {
    /// Escalate right away.
    Immediate,
    /// Announce, count down, then escalate.
    Notified,
}

/// Start handling for `request` without waiting for it.
pub fn dispatch(
    request: ShutdownRequest,
    escalator: &Escalator,
    notifier: &Notifier,
) -> JoinHandle<()> {
    match request {
        ShutdownRequest::Immediate => {
            let escalator = escalator.clone();
            tokio::spawn(async move {
                escalator.trigger().await;
            })
        }
        ShutdownRequest::Notified => {
            let notifier = notifier.clone();
            tokio::spawn(async move {
                notifier.notify_then_shutdown().await;
            })
        }
    }
}

/// Registered signal streams, waiting to be bound to their handlers.
pub struct SignalListener {
    interrupt: Signal,
    terminate: Signal,
    user1: Signal,
}

impl SignalListener {
    /// Register the signal handlers. Signals that arrive between this call
    /// and [`SignalListener::spawn`] are buffered, not lost.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            user1: signal(SignalKind::user_defined1())?,
        })
    }

    /// Listen for the rest of the process lifetime.
    pub fn spawn(self, escalator: Escalator, notifier: Notifier) -> JoinHandle<()> {
        tokio::spawn(self.run(escalator, notifier))
    }

    async fn run(mut self, escalator: Escalator, notifier: Notifier) {
        loop {
            let (name, request) = tokio::select! {
                Some(()) = self.interrupt.recv() => ("SIGINT", ShutdownRequest::Immediate),
                Some(()) = self.terminate.recv() => ("SIGTERM", ShutdownRequest::Immediate),
                Some(()) = self.user1.recv() => ("SIGUSR1", ShutdownRequest::Notified),
                else => break,
            };
            tracing::info!(signal = name, ?request, "shutdown requested");
            dispatch(request, &escalator, &notifier);
        }
        tracing::warn!("signal streams closed, listener stopped");
    }
}

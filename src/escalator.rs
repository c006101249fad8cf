//! Shutdown escalation.
//!
//! Each trigger advances the shared stage by exactly one step and performs
//! that stage's action: send the console stop command, then SIGTERM, then
//! SIGKILL. The first two stages re-trigger themselves after their configured
//! wait, so a single request walks the whole ladder unless the child exits
//! first. Triggers after `Killing` are no-ops.

use crate::child::Signaller;
use crate::config::ShutdownConfig;
use crate::input::ChildInput;
use nix::sys::signal::Signal;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Ordered termination-force levels. Never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ShutdownStage {
    None = 0,
    GracefullyStopping = 1,
    Stopping = 2,
    Killing = 3,
}

impl ShutdownStage {
    /// The stage after this one, or `None` once `Killing` is reached.
    pub fn next(self) -> Option<ShutdownStage> {
        match self {
            ShutdownStage::None => Some(ShutdownStage::GracefullyStopping),
            ShutdownStage::GracefullyStopping => Some(ShutdownStage::Stopping),
            ShutdownStage::Stopping => Some(ShutdownStage::Killing),
            ShutdownStage::Killing => None,
        }
    }

    fn from_u8(raw: u8) -> ShutdownStage {
        match raw {
            0 => ShutdownStage::None,
            1 => ShutdownStage::GracefullyStopping,
            2 => ShutdownStage::Stopping,
            _ => ShutdownStage::Killing,
        }
    }
}

impl std::fmt::Display for ShutdownStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShutdownStage::None => "none",
            ShutdownStage::GracefullyStopping => "gracefully_stopping",
            ShutdownStage::Stopping => "stopping",
            ShutdownStage::Killing => "killing",
        };
        f.write_str(name)
    }
}

/// What a stage does to the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageAction {
    /// Write a console command to the child's stdin.
    SendCommand(String),
    /// Deliver an OS signal.
    Signal(Signal),
}

/// A stage's action plus how long to wait before escalating again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    pub action: StageAction,
    /// `None` for the terminal stage.
    pub retry_after: Option<Duration>,
}

impl StagePlan {
    /// Map a stage to its plan. `ShutdownStage::None` has no action.
    pub fn for_stage(stage: ShutdownStage, config: &ShutdownConfig) -> Option<StagePlan> {
        match stage {
            ShutdownStage::None => None,
            ShutdownStage::GracefullyStopping => Some(StagePlan {
                action: StageAction::SendCommand(config.command.clone()),
                retry_after: Some(config.wait()),
            }),
            ShutdownStage::Stopping => Some(StagePlan {
                action: StageAction::Signal(Signal::SIGTERM),
                retry_after: Some(config.term_wait()),
            }),
            ShutdownStage::Killing => Some(StagePlan {
                action: StageAction::Signal(Signal::SIGKILL),
                retry_after: None,
            }),
        }
    }
}

/// The current stage, shared by every trigger.
#[derive(Debug)]
pub struct EscalationState {
    stage: AtomicU8,
}

impl EscalationState {
    pub fn new() -> Self {
        Self {
            stage: AtomicU8::new(ShutdownStage::None as u8),
        }
    }

    pub fn current(&self) -> ShutdownStage {
        ShutdownStage::from_u8(self.stage.load(Ordering::Acquire))
    }

    /// Advance by one step in a single read-modify-write and return the
    /// stage this caller now owns. `None` once `Killing` is reached.
    pub fn advance(&self) -> Option<ShutdownStage> {
        self.stage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                ShutdownStage::from_u8(raw).next().map(|s| s as u8)
            })
            .ok()
            .and_then(|previous| ShutdownStage::from_u8(previous).next())
    }
}

impl Default for EscalationState {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    state: EscalationState,
    config: ShutdownConfig,
    input: ChildInput,
    signaller: Arc<dyn Signaller>,
}

/// Cheaply cloneable handle to the escalation state machine.
#[derive(Clone)]
pub struct Escalator {
    inner: Arc<Inner>,
}

impl Escalator {
    pub fn new(config: ShutdownConfig, input: ChildInput, signaller: Arc<dyn Signaller>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: EscalationState::new(),
                config,
                input,
                signaller,
            }),
        }
    }

    pub fn stage(&self) -> ShutdownStage {
        self.inner.state.current()
    }

    /// Escalate by one stage.
    ///
    /// Returns the stage this call claimed and acted on, or `None` when the
    /// ladder was already exhausted. Action failures are logged and never
    /// stop the next re-attempt from being scheduled.
    pub async fn trigger(&self) -> Option<ShutdownStage> {
        let Some(stage) = self.inner.state.advance() else {
            tracing::debug!("shutdown already at kill stage, ignoring trigger");
            return None;
        };
        let plan = StagePlan::for_stage(stage, &self.inner.config)?;

        // Armed before acting so a write blocked on a full pipe cannot stall
        // the ladder.
        if let Some(wait) = plan.retry_after {
            self.schedule_retry(stage, wait);
        }

        match plan.action {
            StageAction::SendCommand(command) => {
                tracing::info!(%stage, command = %command, "requesting graceful shutdown");
                if let Err(e) = self.inner.input.send_command(&command).await {
                    tracing::warn!(%stage, error = %e, "failed to send shutdown command");
                }
            }
            StageAction::Signal(signal) => {
                tracing::info!(%stage, signal = signal.as_str(), "signalling child process");
                if let Err(e) = self.inner.signaller.send(signal) {
                    tracing::warn!(
                        %stage,
                        signal = signal.as_str(),
                        error = %e,
                        "failed to signal child process"
                    );
                }
            }
        }

        Some(stage)
    }

    fn schedule_retry(&self, stage: ShutdownStage, wait: Duration) {
        tracing::debug!(%stage, wait_secs = wait.as_secs(), "scheduling shutdown re-attempt");
        let escalator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(next) = escalator.trigger().await {
                tracing::debug!(from = %stage, to = %next, "shutdown re-attempt escalated");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::child::test_support::RecordingSignaller;
    use std::collections::HashSet;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::time::sleep;

    fn test_escalator(
        config: ShutdownConfig,
        signaller: Arc<RecordingSignaller>,
    ) -> (Escalator, DuplexStream) {
        let (writer, reader) = tokio::io::duplex(1024);
        let escalator = Escalator::new(config, ChildInput::new(writer), signaller);
        (escalator, reader)
    }

    async fn read_exact_string(reader: &mut DuplexStream, len: usize) -> String {
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await.unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_stage_order() {
        assert!(ShutdownStage::None < ShutdownStage::GracefullyStopping);
        assert!(ShutdownStage::GracefullyStopping < ShutdownStage::Stopping);
        assert!(ShutdownStage::Stopping < ShutdownStage::Killing);
        assert_eq!(ShutdownStage::Killing.next(), None);
        assert_eq!(ShutdownStage::Killing.to_string(), "killing");
    }

    #[test]
    fn test_state_advances_once_per_call_and_saturates() {
        let state = EscalationState::new();
        assert_eq!(state.current(), ShutdownStage::None);
        assert_eq!(state.advance(), Some(ShutdownStage::GracefullyStopping));
        assert_eq!(state.advance(), Some(ShutdownStage::Stopping));
        assert_eq!(state.advance(), Some(ShutdownStage::Killing));
        assert_eq!(state.advance(), None);
        assert_eq!(state.advance(), None);
        assert_eq!(state.current(), ShutdownStage::Killing);
    }

    #[test]
    fn test_stage_plans() {
        let config = ShutdownConfig {
            command: "halt".to_string(),
            wait_secs: 10,
            term_wait_secs: 20,
        };
        assert_eq!(StagePlan::for_stage(ShutdownStage::None, &config), None);
        assert_eq!(
            StagePlan::for_stage(ShutdownStage::GracefullyStopping, &config),
            Some(StagePlan {
                action: StageAction::SendCommand("halt".to_string()),
                retry_after: Some(Duration::from_secs(10)),
            })
        );
        assert_eq!(
            StagePlan::for_stage(ShutdownStage::Stopping, &config),
            Some(StagePlan {
                action: StageAction::Signal(Signal::SIGTERM),
                retry_after: Some(Duration::from_secs(20)),
            })
        );
        assert_eq!(
            StagePlan::for_stage(ShutdownStage::Killing, &config),
            Some(StagePlan {
                action: StageAction::Signal(Signal::SIGKILL),
                retry_after: None,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trigger_walks_the_ladder_with_defaults() {
        let signaller = Arc::new(RecordingSignaller::default());
        let (escalator, mut reader) = test_escalator(ShutdownConfig::default(), signaller.clone());

        assert_eq!(escalator.trigger().await, Some(ShutdownStage::GracefullyStopping));
        assert_eq!(read_exact_string(&mut reader, 6).await, "\nstop\n");
        assert!(signaller.sent().is_empty());

        sleep(Duration::from_secs(29)).await;
        assert!(signaller.sent().is_empty());
        assert_eq!(escalator.stage(), ShutdownStage::GracefullyStopping);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(signaller.sent(), vec![Signal::SIGTERM]);
        assert_eq!(escalator.stage(), ShutdownStage::Stopping);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(signaller.sent(), vec![Signal::SIGTERM, Signal::SIGKILL]);
        assert_eq!(escalator.stage(), ShutdownStage::Killing);

        // Nothing further is ever scheduled.
        sleep(Duration::from_secs(600)).await;
        assert_eq!(signaller.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_after_kill_is_noop() {
        let signaller = Arc::new(RecordingSignaller::default());
        let (escalator, _reader) = test_escalator(ShutdownConfig::default(), signaller.clone());

        escalator.trigger().await;
        escalator.trigger().await;
        escalator.trigger().await;
        assert_eq!(escalator.stage(), ShutdownStage::Killing);
        assert_eq!(signaller.sent(), vec![Signal::SIGTERM, Signal::SIGKILL]);

        assert_eq!(escalator.trigger().await, None);
        assert_eq!(escalator.stage(), ShutdownStage::Killing);

        // Pending re-attempts from the first two stages fire and do nothing.
        sleep(Duration::from_secs(120)).await;
        assert_eq!(signaller.sent(), vec![Signal::SIGTERM, Signal::SIGKILL]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_trigger_skips_ahead_of_timer() {
        let signaller = Arc::new(RecordingSignaller::default());
        let (escalator, mut reader) = test_escalator(ShutdownConfig::default(), signaller.clone());

        escalator.trigger().await;
        assert_eq!(read_exact_string(&mut reader, 6).await, "\nstop\n");

        // A second interrupt arrives before the graceful wait expires.
        sleep(Duration::from_secs(5)).await;
        assert_eq!(escalator.trigger().await, Some(ShutdownStage::Stopping));
        assert_eq!(signaller.sent(), vec![Signal::SIGTERM]);

        // The graceful-stage timer fires at t=30 and claims the kill stage.
        sleep(Duration::from_secs(26)).await;
        assert_eq!(signaller.sent(), vec![Signal::SIGTERM, Signal::SIGKILL]);

        // The stopping-stage timer fires at t=35 and is a no-op.
        sleep(Duration::from_secs(60)).await;
        assert_eq!(signaller.sent(), vec![Signal::SIGTERM, Signal::SIGKILL]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_escalation() {
        let signaller = Arc::new(RecordingSignaller::failing());
        let (escalator, reader) = test_escalator(ShutdownConfig::default(), signaller.clone());
        // Child stdin is gone: the stop command write fails.
        drop(reader);

        assert_eq!(escalator.trigger().await, Some(ShutdownStage::GracefullyStopping));

        sleep(Duration::from_secs(61)).await;
        assert_eq!(signaller.sent(), vec![Signal::SIGTERM, Signal::SIGKILL]);
        assert_eq!(escalator.stage(), ShutdownStage::Killing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_waits_are_honoured() {
        let signaller = Arc::new(RecordingSignaller::default());
        let config = ShutdownConfig {
            command: "save-all".to_string(),
            wait_secs: 5,
            term_wait_secs: 2,
        };
        let (escalator, mut reader) = test_escalator(config, signaller.clone());

        escalator.trigger().await;
        assert_eq!(read_exact_string(&mut reader, 10).await, "\nsave-all\n");

        sleep(Duration::from_secs(6)).await;
        assert_eq!(signaller.sent(), vec![Signal::SIGTERM]);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(signaller.sent(), vec![Signal::SIGTERM, Signal::SIGKILL]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_triggers_claim_distinct_stages() {
        let signaller = Arc::new(RecordingSignaller::default());
        let config = ShutdownConfig {
            wait_secs: 3600,
            term_wait_secs: 3600,
            ..Default::default()
        };
        let (escalator, _reader) = test_escalator(config, signaller.clone());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let escalator = escalator.clone();
                tokio::spawn(async move { escalator.trigger().await })
            })
            .collect();

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(stage) = handle.await.unwrap() {
                claimed.push(stage);
            }
        }

        assert_eq!(claimed.len(), 3);
        let unique: HashSet<_> = claimed.iter().copied().collect();
        assert_eq!(
            unique,
            HashSet::from([
                ShutdownStage::GracefullyStopping,
                ShutdownStage::Stopping,
                ShutdownStage::Killing,
            ])
        );

        let mut sent = signaller.sent();
        sent.sort_by_key(|s| *s as i32);
        assert_eq!(sent, vec![Signal::SIGKILL, Signal::SIGTERM]);
    }

    #[tokio::test]
    async fn test_ladder_terminates_child_ignoring_stop_command() {
        // `sleep` never reads its stdin, so only the SIGTERM stage stops it.
        let child = crate::child::spawn("sleep", &["30".to_string()]).unwrap();
        let config = ShutdownConfig {
            wait_secs: 0,
            term_wait_secs: 3600,
            ..Default::default()
        };
        let escalator = Escalator::new(config, child.input(), child.signaller());

        assert_eq!(escalator.trigger().await, Some(ShutdownStage::GracefullyStopping));

        let err = child.wait().await.unwrap_err();
        assert_eq!(err.exit_code(), 128 + Signal::SIGTERM as i32);
        assert_eq!(escalator.stage(), ShutdownStage::Stopping);
    }

    #[tokio::test]
    async fn test_trigger_against_exited_child_is_logged_not_fatal() {
        let child = crate::child::spawn("true", &[]).unwrap();
        let input = child.input();
        let signaller = child.signaller();
        child.wait().await.unwrap();

        let escalator = Escalator::new(ShutdownConfig::default(), input, signaller);

        assert_eq!(escalator.trigger().await, Some(ShutdownStage::GracefullyStopping));
        assert_eq!(escalator.trigger().await, Some(ShutdownStage::Stopping));
        assert_eq!(escalator.trigger().await, Some(ShutdownStage::Killing));
        assert_eq!(escalator.trigger().await, None);
    }
}

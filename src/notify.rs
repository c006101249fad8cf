/// Notified shutdown: announce a countdown on the server console, wait it
/// out, then hand off to the escalator.
use crate::config::NotifyConfig;
use crate::escalator::{Escalator, ShutdownStage};
use crate::input::ChildInput;
use regex::{Captures, Regex};
use std::sync::LazyLock;
use std::time::Duration;

/// printf-style tokens understood in the notification template.
static TEMPLATE_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"%%|%d").unwrap());

/// Substitute `seconds` for the first `%d` in `template`.
///
/// `%%` renders a literal `%`. Any further `%d` is left as written.
pub fn render_template(template: &str, seconds: u64) -> String {
    let mut substituted = false;
    TEMPLATE_TOKEN
        .replace_all(template, |caps: &Captures<'_>| {
            if &caps[0] == "%%" {
                "%".to_string()
            } else if substituted {
                "%d".to_string()
            } else {
                substituted = true;
                seconds.to_string()
            }
        })
        .into_owned()
}

/// A single countdown announcement, consumed by [`NotificationRequest::deliver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
    pub announcement: String,
    pub wait: Duration,
}

impl NotificationRequest {
    pub fn from_config(config: &NotifyConfig) -> Self {
        Self {
            announcement: render_template(&config.command, config.wait_secs),
            wait: config.wait(),
        }
    }

    /// Write the announcement, sleep for the countdown, then trigger the
    /// escalator exactly once.
    pub async fn deliver(self, input: &ChildInput, escalator: &Escalator) -> Option<ShutdownStage> {
        tracing::info!(
            announcement = %self.announcement,
            wait_secs = self.wait.as_secs(),
            "announcing shutdown"
        );
        if let Err(e) = input.send_command(&self.announcement).await {
            tracing::warn!(error = %e, "failed to send shutdown notification");
        }

        tokio::time::sleep(self.wait).await;

        escalator.trigger().await
    }
}

/// Entry point for notified shutdowns.
#[derive(Clone)]
pub struct Notifier {
    config: NotifyConfig,
    input: ChildInput,
    escalator: Escalator,
}

impl Notifier {
    pub fn new(config: NotifyConfig, input: ChildInput, escalator: Escalator) -> Self {
        Self {
            config,
            input,
            escalator,
        }
    }

    pub async fn notify_then_shutdown(&self) -> Option<ShutdownStage> {
        NotificationRequest::from_config(&self.config)
            .deliver(&self.input, &self.escalator)
            .await
    }
}

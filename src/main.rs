mod child;
mod config;
mod escalator;
mod input;
mod notify;
mod relay;
mod signals;
mod supervisor;

use clap::Parser;
use config::{ConfigOverrides, WrapperConfig};
use tracing_subscriber::EnvFilter;

/// Wrap a console server process: relay the operator's stdin to it and, on
/// SIGINT/SIGTERM, stop it in escalating stages (console stop command, then
/// SIGTERM, then SIGKILL). SIGUSR1 announces a countdown on the console first.
#[derive(Parser, Debug)]
#[command(name = "mcwrap", version, about)]
pub struct Cli {
    /// Console command sent as the first shutdown stage
    #[arg(long, env = "MCWRAP_SHUTDOWN_CMD", value_name = "COMMAND")]
    shutdown_cmd: Option<String>,

    /// Seconds to wait after the stop command before sending SIGTERM
    #[arg(long, env = "MCWRAP_SHUTDOWN_WAIT", value_name = "SECS")]
    shutdown_wait: Option<u64>,

    /// Seconds to wait after SIGTERM before sending SIGKILL (default: shutdown wait)
    #[arg(long, env = "MCWRAP_TERM_WAIT", value_name = "SECS")]
    term_wait: Option<u64>,

    /// Countdown announcement sent on SIGUSR1; `%d` becomes the countdown
    #[arg(long, env = "MCWRAP_NOTIFY_CMD", value_name = "TEMPLATE")]
    notify_cmd: Option<String>,

    /// Countdown length in seconds before a notified shutdown begins
    #[arg(long, env = "MCWRAP_NOTIFY_WAIT", value_name = "SECS")]
    notify_wait: Option<u64>,

    /// Print the resolved settings as JSON and exit without spawning
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (stage transitions, re-attempt scheduling)
    #[arg(short, long)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Program to supervise, followed by its arguments
    #[arg(
        value_name = "PROGRAM",
        trailing_var_arg = true,
        required_unless_present = "dry_run"
    )]
    command: Vec<String>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            shutdown_cmd: self.shutdown_cmd.clone(),
            shutdown_wait: self.shutdown_wait,
            term_wait: self.term_wait,
            notify_cmd: self.notify_cmd.clone(),
            notify_wait: self.notify_wait,
        }
    }

    fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match WrapperConfig::resolve(cli.overrides()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    if cli.dry_run {
        match serde_json::to_string_pretty(&config) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                tracing::error!(error = %e, "failed to render configuration");
                std::process::exit(1);
            }
        }
        return;
    }

    let Some((program, args)) = cli.command.split_first() else {
        tracing::error!("no program to supervise");
        std::process::exit(2);
    };

    let code = match supervisor::supervise(program, args, config, relay::console()).await {
        Ok(_) => 0,
        Err(e) => {
            tracing::error!(error = %e, "supervision ended with an error");
            e.exit_code()
        }
    };

    // Exit directly: the stdin relay may still be parked in a blocking read
    // that runtime shutdown would otherwise wait on.
    std::process::exit(code);
}

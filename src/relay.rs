/// Operator console passthrough: copy the supervisor's stdin into the child,
/// one line per write.
use crate::input::ChildInput;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

/// Why the relay loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Input reached end-of-file after relaying `lines` lines.
    EndOfInput { lines: u64 },
    /// Reading the supervisor's input failed.
    ReadError { lines: u64 },
}

/// Copy `reader` into `input` line by line until EOF or a read error.
///
/// Lines are forwarded byte-for-byte, including the trailing newline. A
/// failed write is logged and the loop moves on to the next line.
pub async fn relay_lines<R>(mut reader: R, input: &ChildInput) -> RelayOutcome
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut lines = 0u64;

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => return RelayOutcome::EndOfInput { lines },
            Ok(n) => {
                lines += 1;
                if let Err(e) = input.write_raw(&line).await {
                    tracing::warn!(
                        direction = "stdin -> child",
                        bytes = n,
                        error = %e,
                        "failed to relay input line"
                    );
                }
            }
            Err(e) => {
                tracing::error!(
                    direction = "stdin -> child",
                    error = %e,
                    "failed to read supervisor input, relay stopped"
                );
                return RelayOutcome::ReadError { lines };
            }
        }
    }
}

/// Run the relay in the background.
pub fn spawn_relay<R>(reader: R, input: ChildInput) -> JoinHandle<RelayOutcome>
where
    R: AsyncBufRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let outcome = relay_lines(reader, &input).await;
        match outcome {
            RelayOutcome::EndOfInput { lines } => {
                tracing::info!(lines, "console input closed, child keeps running")
            }
            RelayOutcome::ReadError { lines } => {
                tracing::warn!(lines, "console relay aborted, child keeps running")
            }
        }
        outcome
    })
}

/// The supervisor's own stdin, buffered for [`relay_lines`].
pub fn console() -> BufReader<tokio::io::Stdin> {
    BufReader::new(tokio::io::stdin())
}

/// Shared writable end of the child's standard input.
///
/// The escalator, the notification step and the stdin relay all write
/// through clones of the same [`ChildInput`]. Each call writes one complete
/// line under the lock, so lines from different writers never interleave.
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors produced when writing to the child's input stream.
#[derive(Debug)]
pub enum InputError {
    /// The stream was closed because the child exited.
    Closed,
    /// The underlying pipe write or flush failed.
    Io { source: std::io::Error },
}

impl std::fmt::Display for InputError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputError::Closed => write!(f, "child input stream is closed"),
            InputError::Io { source } => {
                write!(f, "failed to write to child input stream: {}", source)
            }
        }
    }
}

impl std::error::Error for InputError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InputError::Closed => None,
            InputError::Io { source } => Some(source),
        }
    }
}

#[derive(Clone)]
pub struct ChildInput {
    writer: Arc<Mutex<Option<BoxedWriter>>>,
}

impl ChildInput {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Some(Box::new(writer)))),
        }
    }

    /// Send a console command, framed as `"\n{command}\n"`.
    ///
    /// The leading newline terminates anything an operator may have left
    /// half-typed on the console.
    pub async fn send_command(&self, command: &str) -> Result<(), InputError> {
        self.write_raw(format!("\n{command}\n").as_bytes()).await
    }

    /// Write bytes verbatim and flush.
    pub async fn write_raw(&self, bytes: &[u8]) -> Result<(), InputError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(InputError::Closed)?;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| InputError::Io { source: e })?;
        writer
            .flush()
            .await
            .map_err(|e| InputError::Io { source: e })
    }

    /// Close the stream. Later writes fail with [`InputError::Closed`].
    pub async fn close(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(error = %e, "error closing child input stream");
            }
        }
    }
}

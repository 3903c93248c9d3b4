use crate::buffer::{BufferError, RingBuffer};
use std::io;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

const READ_CHUNK: usize = 1024;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read input: {0}")]
    Io(#[from] io::Error),
}

/// Output of a captured child process. A non-zero exit still carries the tail.
#[derive(Debug)]
pub struct CommandCapture {
    pub buffer: RingBuffer,
    pub status: ExitStatus,
}

/// Drains `reader` into `buffer` until EOF.
pub async fn capture_reader<R>(reader: &mut R, buffer: &mut RingBuffer) -> Result<(), CaptureError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.write(&chunk[..n]);
    }

    tracing::debug!(
        total_written = buffer.total_written(),
        kept = buffer.len(),
        "Input exhausted"
    );
    Ok(())
}

pub async fn capture_stdin(capacity: usize) -> Result<RingBuffer, CaptureError> {
    let mut buffer = RingBuffer::new(capacity)?;
    capture_reader(&mut tokio::io::stdin(), &mut buffer).await?;
    Ok(buffer)
}

/// Runs `program` with `args` and keeps the last `capacity` bytes of its stdout.
/// Stderr is passed through untouched.
pub async fn capture_command(
    capacity: usize,
    program: &str,
    args: &[String],
) -> Result<CommandCapture, CaptureError> {
    let mut buffer = RingBuffer::new(capacity)?;

    tracing::info!(command = %program, ?args, capacity, "Capturing command output");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CaptureError::Spawn {
            command: program.to_string(),
            source,
        })?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("child stdout was not piped"))?;
    capture_reader(&mut stdout, &mut buffer).await?;

    let status = child.wait().await?;
    tracing::info!(%status, total_written = buffer.total_written(), "Command finished");

    Ok(CommandCapture { buffer, status })
}

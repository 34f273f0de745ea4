//! Output plumbing shared by the worker and encoder processes.
//!
//! Child output is read as raw bytes. A line that is not valid UTF-8 must
//! never stop the reader: an undrained pipe blocks the child once its
//! buffer fills.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, Instrument, Span};

/// Read the next `\n` terminated line into `buf`, without the terminator.
///
/// Returns `Ok(false)` at end of stream.
pub(crate) async fn next_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(false);
    }

    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(true)
}

/// Drain a child's stderr into the debug log until it closes.
///
/// The task inherits the caller's span, so worker output is tagged with the
/// request it belongs to.
pub(crate) fn log_stderr<R>(stderr: R, process: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let drain = async move {
        let mut reader = BufReader::new(stderr);
        let mut line = Vec::new();

        loop {
            match next_line(&mut reader, &mut line).await {
                Ok(true) => debug!(process = process, "{}", String::from_utf8_lossy(&line)),
                Ok(false) => break,
                Err(e) => {
                    debug!(process = process, error = %e, "Stopped reading stderr");
                    break;
                }
            }
        }
    };

    tokio::spawn(drain.instrument(Span::current()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_next_line_keeps_invalid_utf8() {
        let input: &[u8] = b"first\r\n\xff\xfe\nlast";
        let mut reader = BufReader::new(input);
        let mut line = Vec::new();

        assert!(next_line(&mut reader, &mut line).await.unwrap());
        assert_eq!(line, b"first");
        assert!(next_line(&mut reader, &mut line).await.unwrap());
        assert_eq!(line, b"\xff\xfe");
        assert!(next_line(&mut reader, &mut line).await.unwrap());
        assert_eq!(line, b"last");
        assert!(!next_line(&mut reader, &mut line).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_noisy_stderr_does_not_block_child() {
        // Far more than a pipe buffer, behind a line that is not UTF-8.
        let mut child = Command::new("sh")
            .args([
                "-c",
                r#"printf '\377\n' >&2; head -c 300000 /dev/zero | tr '\0' 'e' >&2; exit 0"#,
            ])
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();

        log_stderr(child.stderr.take().unwrap(), "test");

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("child blocked on stderr")
            .unwrap();
        assert!(status.success());
    }
}

//! Recording of annotated frames into a video file.
//!
//! When a request asks for a recording, the modified frames coming out of
//! the detector are piped as raw video into an ffmpeg process. Recording is
//! a side channel: every failure here is logged and never fails the
//! detection response.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

use crate::child::log_stderr;
use crate::job::{AssetKind, Dimensions, PixelFormat};

/// Errors that can occur while recording.
#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("Failed to launch encoder: {0}")]
    Launch(#[source] std::io::Error),

    #[error("Failed to write frame to encoder: {0}")]
    Write(#[source] std::io::Error),

    #[error("Encoder exited with {0}")]
    Exit(std::process::ExitStatus),

    #[error("Encoder I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build the ffmpeg argument list for a recording.
///
/// Raw video carries no header, so the frame size has to be declared as an
/// input option ahead of `-i`.
pub fn encoder_args(
    kind: AssetKind,
    pixel_format: PixelFormat,
    dimensions: Dimensions,
    output: &Path,
) -> Vec<String> {
    let size = format!("{}x{}", dimensions.width, dimensions.height);
    let pix_fmt = pixel_format.as_str();

    let args: Vec<&str> = match kind {
        AssetKind::Image => vec![
            "-loglevel", "warning", "-f", "rawvideo", "-pix_fmt", pix_fmt, "-s", size.as_str(), "-y",
            "-i", "-",
        ],
        AssetKind::Video => vec![
            "-y", "-loglevel", "warning", "-re", "-f", "rawvideo", "-pix_fmt", pix_fmt, "-s",
            size.as_str(), "-i", "-", "-r", "10",
        ],
    };

    let mut args: Vec<String> = args.into_iter().map(String::from).collect();
    args.push(output.to_string_lossy().into_owned());
    args
}

/// A running encoder process.
pub struct VideoEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    output: PathBuf,
    frames: u64,
}

impl VideoEncoder {
    /// Launch `binary` with the arguments for this recording.
    pub fn spawn(
        binary: &str,
        kind: AssetKind,
        pixel_format: PixelFormat,
        dimensions: Dimensions,
        output: PathBuf,
    ) -> Result<Self, EncoderError> {
        let args = encoder_args(kind, pixel_format, dimensions, &output);
        debug!(binary = %binary, ?args, "Launching encoder");

        let mut command = Command::new(binary);
        command.args(&args);
        Self::launch(command, output)
    }

    fn launch(mut command: Command, output: PathBuf) -> Result<Self, EncoderError> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EncoderError::Launch)?;

        if let Some(stderr) = child.stderr.take() {
            log_stderr(stderr, "encoder");
        }
        let stdin = child.stdin.take();

        Ok(Self {
            child,
            stdin,
            output,
            frames: 0,
        })
    }

    /// Write one raw frame.
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<(), EncoderError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| EncoderError::Write(std::io::ErrorKind::BrokenPipe.into()))?;

        stdin.write_all(frame).await.map_err(EncoderError::Write)?;
        self.frames += 1;
        Ok(())
    }

    /// Close the input and wait for the encoder to finish the file.
    pub async fn finish(mut self) -> Result<PathBuf, EncoderError> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await?;
        }

        let status = self.child.wait().await?;
        if !status.success() {
            return Err(EncoderError::Exit(status));
        }

        info!(
            output = %self.output.display(),
            frames = self.frames,
            "Recording written"
        );
        Ok(self.output)
    }
}

/// Per-job recording state. Starts the encoder lazily on the first frame
/// and switches itself off after the first failure.
pub struct Recording {
    binary: String,
    kind: AssetKind,
    pixel_format: PixelFormat,
    output: PathBuf,
    encoder: Option<VideoEncoder>,
    failed: bool,
}

impl Recording {
    pub fn new(binary: &str, kind: AssetKind, pixel_format: PixelFormat, output: PathBuf) -> Self {
        Self {
            binary: binary.to_string(),
            kind,
            pixel_format,
            output,
            encoder: None,
            failed: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.failed
    }

    pub async fn push(&mut self, frame: &[u8], dimensions: Dimensions) {
        if self.failed {
            return;
        }

        if self.encoder.is_none() {
            match VideoEncoder::spawn(
                &self.binary,
                self.kind,
                self.pixel_format,
                dimensions,
                self.output.clone(),
            ) {
                Ok(encoder) => self.encoder = Some(encoder),
                Err(e) => {
                    self.disable(e);
                    return;
                }
            }
        }

        if let Some(encoder) = self.encoder.as_mut() {
            if let Err(e) = encoder.write_frame(frame).await {
                self.disable(e);
            }
        }
    }

    /// Finish the recording, if one was started.
    pub async fn finish(self) -> Option<PathBuf> {
        let encoder = self.encoder?;
        if self.failed {
            return None;
        }

        match encoder.finish().await {
            Ok(path) => Some(path),
            Err(e) => {
                metrics::counter!("darknode.recordings.failed").increment(1);
                warn!(output = %self.output.display(), error = %e, "Recording failed");
                None
            }
        }
    }

    fn disable(&mut self, error: EncoderError) {
        metrics::counter!("darknode.recordings.failed").increment(1);
        warn!(output = %self.output.display(), error = %error, "Recording disabled");
        self.failed = true;
        self.encoder = None;
    }
}

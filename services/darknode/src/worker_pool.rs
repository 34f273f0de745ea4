//! Worker pool contract and the process-backed implementation.
//!
//! The orchestrator only depends on [`WorkerPool`]: submit a job together
//! with a message channel, receive zero or more progress messages on that
//! channel, then exactly one completion result. [`ProcessPool`] fulfils the
//! contract by launching one worker process per job.
//!
//! # Worker protocol
//!
//! ```text
//! stdin  <- one JSON encoded Job, then EOF
//! stdout -> one JSON object per processed unit:
//!           {"detections": <any>, "dimensions": {"width": w, "height": h}, "frame": "<base64>"}
//! exit 0 -> success, anything else -> failure
//! ```
//!
//! `dimensions` and `frame` (the annotated raw frame) are only needed when
//! the job asks for a recording.

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::Value;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, instrument, trace, warn};

use crate::child::{log_stderr, next_line};
use crate::config::{EncoderConfig, PoolConfig};
use crate::encoder::Recording;
use crate::job::{Dimensions, Job, ProgressMessage};

/// Errors reported by a worker pool once it gives up on a job.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Worker launch failed after {attempts} attempts: {source}")]
    DispatchFailed {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Job timed out after {0:?}")]
    JobTimeout(Duration),

    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Worker pool closed")]
    Closed,
}

/// Executes detection jobs.
///
/// Implementations must send every message for a job on `messages` before
/// the returned future resolves, preserve the order the worker emitted them
/// in, and run at most their configured number of jobs at once (extra
/// submissions wait for a free slot).
#[async_trait]
pub trait WorkerPool: Send + Sync {
    async fn submit(
        &self,
        job: Job,
        messages: mpsc::Sender<ProgressMessage>,
    ) -> Result<(), PoolError>;
}

/// One line of worker output.
#[derive(Debug, Deserialize)]
struct WorkerFrame {
    detections: Value,
    #[serde(default)]
    dimensions: Option<Dimensions>,
    #[serde(default)]
    frame: Option<String>,
}

/// Worker pool that launches one child process per job.
pub struct ProcessPool {
    config: PoolConfig,
    encoder: EncoderConfig,
    slots: Arc<Semaphore>,
}

impl ProcessPool {
    pub fn new(config: PoolConfig, encoder: EncoderConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.concurrency));
        info!(
            command = %config.command,
            concurrency = config.concurrency,
            timeout_secs = config.timeout_secs,
            retries = config.retries,
            "Worker pool initialized"
        );

        Self {
            config,
            encoder,
            slots,
        }
    }

    /// Free worker slots right now.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Launch the worker, retrying failed launches with exponential backoff.
    async fn launch_with_retry(&self, job: &Job) -> Result<Child, PoolError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.retry_base_delay(),
            max_interval: self.config.retry_base_delay() * 16,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempts = 0u32;

        loop {
            attempts += 1;

            match self.launch(job) {
                Ok(child) => {
                    debug!(attempts = attempts, pid = ?child.id(), "Worker launched");
                    return Ok(child);
                }
                Err(e) if attempts > self.config.retries => {
                    metrics::counter!("darknode.pool.dispatch_failed").increment(1);
                    return Err(PoolError::DispatchFailed {
                        attempts,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.config.retry_base_delay());
                    warn!(
                        error = %e,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Worker launch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn launch(&self, job: &Job) -> std::io::Result<Child> {
        Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("DARKNODE_REQUEST_ID", job.request_id.to_string())
            .spawn()
    }

    /// Feed the job to a launched worker and relay its output.
    async fn drive(
        &self,
        job: &Job,
        mut child: Child,
        messages: &mpsc::Sender<ProgressMessage>,
    ) -> Result<(), PoolError> {
        if let Some(mut stdin) = child.stdin.take() {
            let mut payload = serde_json::to_vec(job)
                .map_err(|e| PoolError::JobFailed(format!("failed to encode job: {e}")))?;
            payload.push(b'\n');

            // A worker may legitimately exit without reading its input.
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(error = %e, "Worker did not accept job payload");
            }
        }

        if let Some(stderr) = child.stderr.take() {
            log_stderr(stderr, "worker");
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::JobFailed("worker stdout unavailable".to_string()))?;

        let mut recording = job.record.then(|| {
            Recording::new(
                &self.encoder.binary,
                job.kind,
                job.pixel_format,
                job.recording_path(),
            )
        });

        let mut reader = BufReader::new(stdout);
        let mut line = Vec::new();
        let mut forwarded = 0u64;
        let mut consumer_gone = false;
        let mut read_error = None;

        loop {
            match next_line(&mut reader, &mut line).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read worker output, killing worker");
                    if let Err(e) = child.start_kill() {
                        debug!(error = %e, "Worker already exited");
                    }
                    read_error = Some(e);
                    break;
                }
            }

            let Some(frame) = parse_frame(&line) else {
                continue;
            };

            if let Some(recording) = recording.as_mut() {
                record_frame(recording, &frame).await;
            }

            if !consumer_gone
                && messages
                    .send(ProgressMessage(frame.detections))
                    .await
                    .is_err()
            {
                debug!("Message receiver dropped, draining worker output");
                consumer_gone = true;
            }
            forwarded += 1;
        }

        if let Some(recording) = recording {
            recording.finish().await;
        }

        let status = child
            .wait()
            .await
            .map_err(|e| PoolError::JobFailed(format!("failed to wait for worker: {e}")))?;

        if let Some(e) = read_error {
            return Err(PoolError::JobFailed(format!(
                "failed to read worker output: {e}"
            )));
        }

        trace!(messages = forwarded, status = %status, "Worker exited");
        check_exit(status)
    }
}

#[async_trait]
impl WorkerPool for ProcessPool {
    #[instrument(skip_all, fields(request_id = %job.request_id, kind = ?job.kind))]
    async fn submit(
        &self,
        job: Job,
        messages: mpsc::Sender<ProgressMessage>,
    ) -> Result<(), PoolError> {
        let _permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        let timeout = self.config.timeout();
        let run = async {
            let child = self.launch_with_retry(&job).await?;
            self.drive(&job, child, &messages).await
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                metrics::counter!("darknode.pool.timeouts").increment(1);
                warn!(timeout_secs = timeout.as_secs(), "Job timed out, worker killed");
                Err(PoolError::JobTimeout(timeout))
            }
        }
    }
}

/// Decode one output line. Blank and malformed lines yield `None`.
fn parse_frame(line: &[u8]) -> Option<WorkerFrame> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(e) => {
            warn!(error = %e, bytes = line.len(), "Skipping worker output line that is not UTF-8");
            return None;
        }
    };

    if text.is_empty() {
        return None;
    }

    match serde_json::from_str(text) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(error = %e, "Skipping malformed worker output line");
            None
        }
    }
}

async fn record_frame(recording: &mut Recording, frame: &WorkerFrame) {
    if !recording.is_active() {
        return;
    }

    let (Some(encoded), Some(dimensions)) = (frame.frame.as_deref(), frame.dimensions) else {
        return;
    };

    match STANDARD.decode(encoded) {
        Ok(raw) => recording.push(&raw, dimensions).await,
        Err(e) => warn!(error = %e, "Worker sent an undecodable frame"),
    }
}

fn check_exit(status: ExitStatus) -> Result<(), PoolError> {
    if status.success() {
        Ok(())
    } else {
        Err(PoolError::JobFailed(format!("worker exited with {status}")))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::job::{AssetKind, ModelSelection, PixelFormat};
    use serde_json::json;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn pool(script: &str, concurrency: usize, timeout_secs: u64, retries: u32) -> ProcessPool {
        ProcessPool::new(
            PoolConfig {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                concurrency,
                timeout_secs,
                retries,
                retry_base_delay_ms: 10,
            },
            EncoderConfig::default(),
        )
    }

    fn job() -> Job {
        Job {
            request_id: Uuid::new_v4(),
            asset_path: PathBuf::from("/scratch/x/cat.jpg"),
            kind: AssetKind::Image,
            record: false,
            pixel_format: PixelFormat::Rgb24,
            model: ModelSelection {
                weights: "w".to_string(),
                cfg: "c".to_string(),
                data: "d".to_string(),
            },
            extra_params: Default::default(),
        }
    }

    async fn collect(
        pool: &ProcessPool,
        job: Job,
    ) -> (Vec<ProgressMessage>, Result<(), PoolError>) {
        let (tx, mut rx) = mpsc::channel(16);
        let (result, messages) = tokio::join!(pool.submit(job, tx), async {
            let mut messages = Vec::new();
            while let Some(message) = rx.recv().await {
                messages.push(message);
            }
            messages
        });
        (messages, result)
    }

    #[tokio::test]
    async fn test_messages_forwarded_in_order() {
        let pool = pool(
            r#"cat > /dev/null
echo '{"detections": ["a"]}'
echo 'not json'
echo '{"detections": ["b"]}'
echo '{"detections": ["c"]}'"#,
            1,
            10,
            0,
        );

        let (messages, result) = collect(&pool, job()).await;
        assert!(result.is_ok());
        assert_eq!(
            messages,
            vec![
                ProgressMessage(json!(["a"])),
                ProgressMessage(json!(["b"])),
                ProgressMessage(json!(["c"])),
            ]
        );
    }

    #[tokio::test]
    async fn test_non_utf8_line_is_skipped() {
        let pool = pool(
            r#"cat > /dev/null
echo '{"detections": 1}'
printf '\377\n'
echo '{"detections": 2}'
echo '{"detections": 3}'"#,
            1,
            10,
            0,
        );

        let (messages, result) = collect(&pool, job()).await;
        assert!(result.is_ok());
        assert_eq!(
            messages,
            vec![
                ProgressMessage(json!(1)),
                ProgressMessage(json!(2)),
                ProgressMessage(json!(3)),
            ]
        );
    }

    #[tokio::test]
    async fn test_output_keeps_draining_after_non_utf8_lines() {
        // Both streams carry a bad line followed by more than a pipe buffer.
        let pool = pool(
            r#"cat > /dev/null
printf '\377\n'
printf '\376\n' >&2
i=0
while [ $i -lt 4000 ]; do
  echo '{"detections": "padding-padding-padding-padding-padding-padding"}'
  echo 'worker log line padding-padding-padding-padding-padding' >&2
  i=$((i+1))
done"#,
            1,
            20,
            0,
        );

        let (messages, result) = collect(&pool, job()).await;
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(messages.len(), 4000);
    }

    #[test]
    fn test_parse_frame() {
        assert!(parse_frame(b"").is_none());
        assert!(parse_frame(b"  ").is_none());
        assert!(parse_frame(b"\xff").is_none());
        assert!(parse_frame(b"{\"no_detections\": 1}").is_none());

        let frame = parse_frame(br#"{"detections": [1], "dimensions": {"width": 4, "height": 2}}"#)
            .unwrap();
        assert_eq!(frame.detections, json!([1]));
        assert_eq!(frame.dimensions, Some(Dimensions { width: 4, height: 2 }));
        assert!(frame.frame.is_none());
    }

    #[tokio::test]
    async fn test_worker_receives_job_payload() {
        let pool = pool(
            r#"read -r line; printf '{"detections": %s}\n' "$line""#,
            1,
            10,
            0,
        );

        let job = job();
        let (messages, result) = collect(&pool, job.clone()).await;
        assert!(result.is_ok());
        let echoed: Job = serde_json::from_value(messages[0].0.clone()).unwrap();
        assert_eq!(echoed, job);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_job_after_messages() {
        let pool = pool(r#"echo '{"detections": 1}'; exit 3"#, 1, 10, 0);

        let (messages, result) = collect(&pool, job()).await;
        assert_eq!(messages.len(), 1);
        assert!(matches!(result, Err(PoolError::JobFailed(_))));
    }

    #[tokio::test]
    async fn test_timeout_kills_job() {
        let pool = pool("sleep 5", 1, 1, 0);

        let started = std::time::Instant::now();
        let (_, result) = collect(&pool, job()).await;
        assert!(matches!(result, Err(PoolError::JobTimeout(_))));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_launch_failure_is_retried_then_reported() {
        let pool = ProcessPool::new(
            PoolConfig {
                command: "/nonexistent/darknet-worker".to_string(),
                args: vec![],
                concurrency: 1,
                timeout_secs: 10,
                retries: 2,
                retry_base_delay_ms: 5,
            },
            EncoderConfig::default(),
        );

        let (messages, result) = collect(&pool, job()).await;
        assert!(messages.is_empty());
        assert!(matches!(
            result,
            Err(PoolError::DispatchFailed { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrency_is_capped() {
        let pool = Arc::new(pool("sleep 0.3", 2, 10, 0));

        let started = std::time::Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    let (tx, _rx) = mpsc::channel(1);
                    pool.submit(job(), tx).await
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.available_slots(), 0);

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        // Four 300ms jobs through two slots need at least two rounds.
        assert!(started.elapsed() >= Duration::from_millis(600));
        assert_eq!(pool.available_slots(), 2);
    }

    #[tokio::test]
    async fn test_recording_failure_does_not_fail_job() {
        let mut pool = pool(
            r#"cat > /dev/null
echo '{"detections": [], "dimensions": {"width": 2, "height": 1}, "frame": "AAAAAAAA"}'"#,
            1,
            10,
            0,
        );
        pool.encoder.binary = "/nonexistent/ffmpeg".to_string();

        let mut job = job();
        job.record = true;

        let (messages, result) = collect(&pool, job).await;
        assert!(result.is_ok());
        assert_eq!(messages.len(), 1);
    }
}

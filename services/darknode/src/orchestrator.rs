//! Request orchestration.
//!
//! Every request walks the same state machine:
//!
//! ```text
//! Validating -> Staging -> Dispatched -> Completing -> Done
//!      \            \           \             \
//!       +------------+-----------+-------------+--> Errored
//! ```
//!
//! Validation failures are returned to the caller directly. Everything after
//! that ends in exactly one terminal outcome for the consumer: the collected
//! messages (batch), a closed stream (stream), or one error.

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{DarknodeConfig, DetectorConfig};
use crate::job::{
    AssetKind, DeliveryMode, Job, ModelSelection, PixelFormat, ProgressMessage, StreamEvent,
};
use crate::stager::{AssetStager, StagingError};
use crate::worker_pool::{PoolError, WorkerPool};

/// Messages buffered between the pool and the delivery side of one job.
const MESSAGE_BUFFER: usize = 32;

/// Terminal errors of a request.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Staging failed: {0}")]
    StagingFailed(#[from] StagingError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Request processing panicked: {0}")]
    Panicked(String),
}

/// An incoming request as seen by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct InferenceRequest {
    /// Source locator of the asset
    pub source: Option<String>,

    /// Record the annotated output as video
    pub record: bool,

    /// Frames are BGR instead of RGB
    pub bgr24: bool,

    /// Use the tiny model
    pub tiny: bool,

    /// Parameters forwarded to the worker untouched
    pub extra: Map<String, Value>,
}

/// A request that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub source: String,
    pub kind: AssetKind,
    pub record: bool,
    pub pixel_format: PixelFormat,
    pub model: ModelSelection,
    pub extra: Map<String, Value>,
}

impl ValidatedRequest {
    fn into_job(self, request_id: Uuid, asset_path: PathBuf) -> Job {
        Job {
            request_id,
            asset_path,
            kind: self.kind,
            record: self.record,
            pixel_format: self.pixel_format,
            model: self.model,
            extra_params: self.extra,
        }
    }
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Validating,
    Staging,
    Dispatched,
    Completing,
    Done,
    Errored,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Done | RequestState::Errored)
    }
}

/// Tracks one request through the state machine.
struct RequestRun {
    request_id: Uuid,
    mode: DeliveryMode,
    state: RequestState,
}

impl RequestRun {
    fn new(mode: DeliveryMode) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            mode,
            state: RequestState::Validating,
        }
    }

    fn advance(&mut self, next: RequestState) {
        debug_assert!(!self.state.is_terminal(), "request already finished");
        debug!(
            request_id = %self.request_id,
            mode = ?self.mode,
            from = ?self.state,
            to = ?next,
            "Request state changed"
        );
        self.state = next;
    }

    fn finish(&mut self) {
        self.advance(RequestState::Done);
        metrics::counter!("darknode.requests.completed").increment(1);
        info!(request_id = %self.request_id, mode = ?self.mode, "Request completed");
    }

    fn fail(&mut self, error: &OrchestratorError) {
        let failed_in = self.state;
        self.advance(RequestState::Errored);
        metrics::counter!("darknode.requests.failed").increment(1);

        match error {
            OrchestratorError::InvalidRequest(_) => {
                warn!(request_id = %self.request_id, error = %error, "Request rejected")
            }
            _ => error!(
                request_id = %self.request_id,
                mode = ?self.mode,
                state = ?failed_in,
                error = %error,
                "Request failed"
            ),
        }
    }
}

/// Where progress messages go while a job runs.
#[async_trait]
trait Delivery: Send {
    async fn deliver(&mut self, message: ProgressMessage);
}

/// Collects messages until the job completes.
struct BatchDelivery {
    messages: Vec<ProgressMessage>,
}

#[async_trait]
impl Delivery for BatchDelivery {
    async fn deliver(&mut self, message: ProgressMessage) {
        self.messages.push(message);
    }
}

/// Forwards each message to the consumer as it arrives.
struct StreamDelivery {
    events: mpsc::Sender<StreamEvent>,
    consumer_gone: bool,
}

impl StreamDelivery {
    async fn send(&mut self, event: StreamEvent) {
        if self.consumer_gone {
            return;
        }
        if self.events.send(event).await.is_err() {
            debug!("Stream consumer disconnected, dropping remaining events");
            self.consumer_gone = true;
        }
    }

    /// Report the failure inline. The stream closes when `self` is dropped.
    async fn fail(mut self, error: &OrchestratorError) {
        self.send(StreamEvent::error(error.to_string())).await;
    }
}

#[async_trait]
impl Delivery for StreamDelivery {
    async fn deliver(&mut self, message: ProgressMessage) {
        self.send(StreamEvent::detection(message)).await;
    }
}

/// Settings the orchestrator needs from the service configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub video_extensions: Vec<String>,
    pub detector: DetectorConfig,
    pub stream_buffer: usize,
}

impl From<&DarknodeConfig> for OrchestratorSettings {
    fn from(config: &DarknodeConfig) -> Self {
        Self {
            video_extensions: config.staging.video_extensions.clone(),
            detector: config.detector.clone(),
            stream_buffer: config.staging.stream_buffer,
        }
    }
}

/// Drives requests from validation to their terminal outcome.
#[derive(Clone)]
pub struct Orchestrator {
    stager: AssetStager,
    pool: Arc<dyn WorkerPool>,
    settings: Arc<OrchestratorSettings>,
}

impl Orchestrator {
    pub fn new(
        stager: AssetStager,
        pool: Arc<dyn WorkerPool>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            stager,
            pool,
            settings: Arc::new(settings),
        }
    }

    /// Check the request and derive the job parameters from it.
    pub fn validate(&self, request: InferenceRequest) -> Result<ValidatedRequest, OrchestratorError> {
        let source = request
            .source
            .map(|source| source.trim().to_string())
            .filter(|source| !source.is_empty())
            .ok_or_else(|| OrchestratorError::InvalidRequest("missing source locator".to_string()))?;

        Ok(ValidatedRequest {
            kind: AssetKind::classify(&source, &self.settings.video_extensions),
            source,
            record: request.record,
            pixel_format: PixelFormat::from_bgr24_flag(request.bgr24),
            model: ModelSelection::select(&self.settings.detector, request.tiny),
            extra: request.extra,
        })
    }

    /// Run a request and return all of its messages at once.
    pub async fn run_batch(
        &self,
        request: InferenceRequest,
    ) -> Result<Vec<ProgressMessage>, OrchestratorError> {
        let mut run = RequestRun::new(DeliveryMode::Batch);
        let validated = self.validate_for(&mut run, request)?;

        let mut delivery = BatchDelivery {
            messages: Vec::new(),
        };

        match self.execute_guarded(&mut run, validated, &mut delivery).await {
            Ok(()) => {
                run.finish();
                Ok(delivery.messages)
            }
            Err(e) => {
                run.fail(&e);
                Err(e)
            }
        }
    }

    /// Run a request and stream its messages.
    ///
    /// Validation errors are returned before anything is streamed. Once the
    /// receiver is handed out, every outcome is reported on it: `detection`
    /// events as they arrive, at most one `error` event, then the channel
    /// closes.
    pub fn run_stream(
        &self,
        request: InferenceRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, OrchestratorError> {
        let mut run = RequestRun::new(DeliveryMode::Stream);
        let validated = self.validate_for(&mut run, request)?;

        let (events, receiver) = mpsc::channel(self.settings.stream_buffer);
        let orchestrator = self.clone();

        tokio::spawn(async move {
            let mut delivery = StreamDelivery {
                events,
                consumer_gone: false,
            };

            match orchestrator
                .execute_guarded(&mut run, validated, &mut delivery)
                .await
            {
                Ok(()) => run.finish(),
                Err(e) => {
                    run.fail(&e);
                    delivery.fail(&e).await;
                }
            }
        });

        Ok(receiver)
    }

    fn validate_for(
        &self,
        run: &mut RequestRun,
        request: InferenceRequest,
    ) -> Result<ValidatedRequest, OrchestratorError> {
        self.validate(request).inspect_err(|e| run.fail(e))
    }

    /// [`execute`](Self::execute), with a panic turned into an error so the
    /// request still gets its terminal outcome.
    async fn execute_guarded<D: Delivery>(
        &self,
        run: &mut RequestRun,
        request: ValidatedRequest,
        delivery: &mut D,
    ) -> Result<(), OrchestratorError> {
        AssertUnwindSafe(self.execute(run, request, delivery))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(OrchestratorError::Panicked(panic_message(panic.as_ref()))))
    }

    /// Stage the asset, dispatch the job and feed its messages to `delivery`.
    async fn execute<D: Delivery>(
        &self,
        run: &mut RequestRun,
        request: ValidatedRequest,
        delivery: &mut D,
    ) -> Result<(), OrchestratorError> {
        run.advance(RequestState::Staging);
        let asset_path = self.stager.stage(&request.source).await?;

        run.advance(RequestState::Dispatched);
        let job = request.into_job(run.request_id, asset_path);
        debug!(
            request_id = %job.request_id,
            asset = %job.asset_path.display(),
            kind = ?job.kind,
            record = job.record,
            pixel_format = job.pixel_format.as_str(),
            "Dispatching job"
        );

        let (messages, mut incoming) = mpsc::channel(MESSAGE_BUFFER);
        let forward = async {
            let mut forwarded = 0u64;
            while let Some(message) = incoming.recv().await {
                delivery.deliver(message).await;
                forwarded += 1;
            }
            forwarded
        };

        // The pool drops its sender before resolving, so `forward` has seen
        // every message by the time both sides are done.
        let (outcome, forwarded) = tokio::join!(self.pool.submit(job, messages), forward);

        run.advance(RequestState::Completing);
        metrics::counter!("darknode.messages.forwarded").increment(forwarded);

        outcome.map_err(OrchestratorError::from)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

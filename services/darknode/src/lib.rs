//! DarkNode detection service
//!
//! Accepts detection requests for images and videos, stages each asset into
//! a self-expiring scratch directory, runs the detector on a bounded pool of
//! worker processes and delivers the results either all at once or as a
//! stream of events.
//!
//! ## Architecture
//!
//! ```text
//!   HTTP (batch / SSE)
//!          │
//!          ▼
//! ┌──────────────────┐     ┌──────────────┐     ┌────────────────┐
//! │ Orchestrator     │────▶│ AssetStager  │────▶│ ResourceStore  │
//! │ (state machine)  │     └──────────────┘     │ (TTL scratch)  │
//! └──────────────────┘                          └────────────────┘
//!          │
//!          ▼
//! ┌──────────────────┐     ┌──────────────┐
//! │ WorkerPool       │────▶│ Recording    │
//! │ (detector procs) │     │ (ffmpeg)     │
//! └──────────────────┘     └──────────────┘
//! ```

pub mod api;
mod child;
pub mod client;
pub mod config;
pub mod encoder;
pub mod installer;
pub mod job;
pub mod orchestrator;
pub mod resource_store;
pub mod stager;
pub mod worker_pool;

pub use api::{create_router, AppState};
pub use client::{ClientError, DarknodeClient, DetectionRequest};
pub use config::DarknodeConfig;
pub use installer::{InstallError, InstallReport, ModelInstaller};
pub use job::{DeliveryMode, Job, ProgressMessage, StreamEvent};
pub use orchestrator::{InferenceRequest, Orchestrator, OrchestratorError, OrchestratorSettings};
pub use resource_store::{RecoveryReport, ResourceEntry, ResourceStore, StoreError};
pub use stager::{AssetStager, StagingError};
pub use worker_pool::{PoolError, ProcessPool, WorkerPool};

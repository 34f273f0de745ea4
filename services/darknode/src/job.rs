//! Jobs handed to the detection workers and the messages they produce.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::DetectorConfig;

/// Suffix appended to the asset name for recorded output.
pub const RECORDING_SUFFIX: &str = ".yolo.mp4";

/// What kind of asset a job processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Image,
    Video,
}

impl AssetKind {
    /// Classify a locator by the extension of its path component.
    ///
    /// Query strings and fragments are ignored, matching is case-insensitive
    /// and anything not listed in `video_extensions` is an image.
    pub fn classify(locator: &str, video_extensions: &[String]) -> Self {
        let path = locator
            .split(['?', '#'])
            .next()
            .unwrap_or(locator);

        let extension = Path::new(path)
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase());

        match extension {
            Some(ext)
                if video_extensions
                    .iter()
                    .any(|candidate| candidate.trim_start_matches('.').eq_ignore_ascii_case(&ext)) =>
            {
                AssetKind::Video
            }
            _ => AssetKind::Image,
        }
    }
}

/// Raw pixel layout of frames produced by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Rgb24,
    Bgr24,
}

impl PixelFormat {
    pub fn from_bgr24_flag(bgr24: bool) -> Self {
        if bgr24 {
            PixelFormat::Bgr24
        } else {
            PixelFormat::Rgb24
        }
    }

    /// Name understood by ffmpeg's `-pix_fmt`.
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgr24 => "bgr24",
        }
    }
}

/// Model files the worker should load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub weights: String,
    pub cfg: String,
    pub data: String,
}

impl ModelSelection {
    pub fn select(config: &DetectorConfig, tiny: bool) -> Self {
        if tiny {
            Self {
                weights: config.tiny_weights.clone(),
                cfg: config.tiny_cfg.clone(),
                data: config.data.clone(),
            }
        } else {
            Self {
                weights: config.weights.clone(),
                cfg: config.cfg.clone(),
                data: config.data.clone(),
            }
        }
    }
}

/// A single detection job.
///
/// Serialized as JSON onto the worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub request_id: Uuid,
    pub asset_path: PathBuf,
    pub kind: AssetKind,
    pub record: bool,
    pub pixel_format: PixelFormat,
    pub model: ModelSelection,
    /// Request parameters the service does not interpret itself
    #[serde(default)]
    pub extra_params: Map<String, Value>,
}

impl Job {
    /// Where the recorded video for this job is written.
    pub fn recording_path(&self) -> PathBuf {
        recording_path(&self.asset_path)
    }
}

/// `<dir>/<name>` becomes `<dir>/<name>.yolo.mp4`.
pub fn recording_path(asset: &Path) -> PathBuf {
    let name = asset
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "asset".to_string());

    asset.with_file_name(format!("{}{}", name, RECORDING_SUFFIX))
}

/// Frame dimensions reported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Detection output for one processing unit (an image or a video frame).
///
/// The payload is opaque to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgressMessage(pub Value);

impl From<Value> for ProgressMessage {
    fn from(value: Value) -> Self {
        ProgressMessage(value)
    }
}

/// How results reach the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Everything at once when the job completes
    Batch,
    /// Each message as it arrives, then end-of-stream
    Stream,
}

/// Tag of a streamed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Detection,
    Error,
}

/// An event forwarded in stream mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub name: EventKind,
    pub data: Value,
}

impl StreamEvent {
    pub fn detection(message: ProgressMessage) -> Self {
        Self {
            name: EventKind::Detection,
            data: message.0,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            name: EventKind::Error,
            data: Value::String(message.into()),
        }
    }
}

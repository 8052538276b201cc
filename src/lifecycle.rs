//! Request lifecycle controller
//!
//! Drives one upload through
//! `Received → Staged → Decoding → Transforming → Encoding → Committing → Done`,
//! with `Failed(code)` reachable from every non-terminal state.
//!
//! ## Guarantees
//!
//! - Admission checks run before anything touches disk.
//! - The staged upload is removed on every exit path, success included.
//! - A partial artifact is only visible under its final name after commit;
//!   dropping it on an error path deletes it.
//!
//! A worker killed mid-request bypasses all of this; its files are left for
//! the reaper.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{self, InputFormat, MediaKind, OutputFormat};
use crate::config::ServiceConfig;
use crate::density::{DensityMeter, DensitySummary};
use crate::error::{MediaError, RejectReason, Result};
use crate::metrics::{Metrics, Timer};
use crate::pipeline::{self, VideoSource};
use crate::stages::{StagePlan, StageRegistry};
use crate::storage::{ArtifactId, StagedUpload, Storage};

/// An upload as received from the client
#[derive(Debug, Clone)]
pub struct Upload {
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// Size the client declared; `None` when it declared nothing
    pub declared_size: Option<u64>,
    pub filename: Option<String>,
}

impl Upload {
    /// Upload whose declared size is its actual length
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        let declared_size = Some(bytes.len() as u64);
        Self {
            bytes,
            content_type: content_type.into(),
            declared_size,
            filename: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

/// Per-request processing options
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Stage plan, e.g. `grayscale,blur:2`; the configured default when absent
    pub stages: Option<String>,
    /// Target format name; chosen from the input kind when absent
    pub format: Option<String>,
}

/// Returned to the client once the artifact is committed
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactReceipt {
    pub request_id: String,
    pub artifact_id: String,
    pub location: String,
    pub media_type: String,
    pub width: u32,
    pub height: u32,
    pub frames: u64,
    pub bytes: u64,
    pub stages: Vec<String>,
    /// Present when a heatmap stage measured the frames
    #[serde(skip_serializing_if = "Option::is_none")]
    pub density: Option<DensitySummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Staged,
    Decoding,
    Transforming,
    Encoding,
    Committing,
    Done,
    Failed,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Received => "received",
            RequestState::Staged => "staged",
            RequestState::Decoding => "decoding",
            RequestState::Transforming => "transforming",
            RequestState::Encoding => "encoding",
            RequestState::Committing => "committing",
            RequestState::Done => "done",
            RequestState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Current state of one request, logging every transition
struct Tracker {
    request_id: Uuid,
    state: RequestState,
}

impl Tracker {
    fn new(request_id: Uuid) -> Self {
        debug!(request_id = %request_id, "request received");
        Self {
            request_id,
            state: RequestState::Received,
        }
    }

    fn advance(&mut self, next: RequestState) {
        debug!(request_id = %self.request_id, from = %self.state, to = %next, "request transition");
        self.state = next;
    }
}

/// What the pipeline produced before commit
struct Produced {
    width: u32,
    height: u32,
    frames: u64,
    bytes: u64,
    target: OutputFormat,
    density: Option<DensitySummary>,
}

pub struct RequestLifecycle {
    config: Arc<ServiceConfig>,
    storage: Storage,
    registry: Arc<StageRegistry>,
    metrics: Arc<Metrics>,
}

impl RequestLifecycle {
    pub fn new(
        config: Arc<ServiceConfig>,
        storage: Storage,
        registry: Arc<StageRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            storage,
            registry,
            metrics,
        }
    }

    /// Open storage from the configured directories with the builtin stages
    pub fn from_config(config: Arc<ServiceConfig>) -> Result<Self> {
        let storage = Storage::open(&config.uploads_dir, &config.data_dir)?;
        Ok(Self::new(
            config,
            storage,
            Arc::new(StageRegistry::builtin()),
            Metrics::new(),
        ))
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// `Received → Staged` admission checks; nothing is written on failure
    pub fn admit(&self, upload: &Upload) -> Result<()> {
        let limit = self.config.max_upload_bytes;
        let actual = upload.bytes.len() as u64;
        let declared = upload
            .declared_size
            .ok_or(MediaError::PayloadRejected(RejectReason::MissingLength))?;

        if declared > limit {
            return Err(MediaError::PayloadRejected(RejectReason::TooLarge { declared, limit }));
        }
        if declared != actual {
            return Err(MediaError::PayloadRejected(RejectReason::LengthMismatch { declared, actual }));
        }
        if actual == 0 {
            return Err(MediaError::PayloadRejected(RejectReason::Empty));
        }
        if !self.config.is_type_allowed(&upload.content_type) {
            return Err(MediaError::PayloadRejected(RejectReason::DisallowedType(
                upload.content_type.clone(),
            )));
        }
        if let Some(ext) = upload.filename.as_deref().and_then(extension_of) {
            if InputFormat::from_extension(&ext).is_none() {
                return Err(MediaError::PayloadRejected(RejectReason::DisallowedExtension(ext)));
            }
        }
        Ok(())
    }

    /// Run one upload to a terminal state.
    ///
    /// Blocking: callers on an async runtime must move this onto the blocking
    /// pool.
    pub fn process(&self, request_id: Uuid, upload: Upload, options: &RequestOptions) -> Result<ArtifactReceipt> {
        let timer = Timer::new();
        let bytes_in = upload.bytes.len() as u64;
        let mut tracker = Tracker::new(request_id);

        let result = self.run(&mut tracker, &upload, options);
        let latency_ms = timer.elapsed_ms();

        match &result {
            Ok(receipt) => {
                tracker.advance(RequestState::Done);
                let kind = if receipt.media_type.starts_with("video/") {
                    MediaKind::Video
                } else {
                    MediaKind::Image
                };
                self.metrics
                    .record_success(kind, bytes_in, receipt.bytes, receipt.frames, latency_ms);
                info!(
                    request_id = %request_id,
                    artifact_id = %receipt.artifact_id,
                    latency_ms,
                    "✅ Request done: {}x{} {} ({} bytes)",
                    receipt.width,
                    receipt.height,
                    receipt.media_type,
                    receipt.bytes
                );
            }
            Err(e) => {
                tracker.advance(RequestState::Failed);
                self.metrics.record_failure(e.code(), bytes_in, latency_ms);
                warn!(request_id = %request_id, code = %e.code(), latency_ms, "Request failed: {}", e);
            }
        }

        result
    }

    fn run(&self, tracker: &mut Tracker, upload: &Upload, options: &RequestOptions) -> Result<ArtifactReceipt> {
        self.admit(upload)?;

        let plan_text = options
            .stages
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.config.default_stages);
        let plan = self.registry.build(plan_text)?;

        let staged = self
            .storage
            .stage(&tracker.request_id, &upload.bytes, upload.filename.as_deref())?;
        tracker.advance(RequestState::Staged);

        let outcome = self.produce(tracker, upload, &staged, &plan, options);
        self.storage.discard(&staged.path);
        outcome
    }

    fn produce(
        &self,
        tracker: &mut Tracker,
        upload: &Upload,
        staged: &StagedUpload,
        plan: &StagePlan,
        options: &RequestOptions,
    ) -> Result<ArtifactReceipt> {
        let artifact_id = ArtifactId::derive(&upload.bytes);

        tracker.advance(RequestState::Decoding);
        let format = codec::sniff(&upload.bytes, &upload.content_type)?;
        let target = OutputFormat::resolve(options.format.as_deref(), format.kind())?;
        let mut meter = DensityMeter::new(self.config.density_threshold);

        let produced = match format.kind() {
            MediaKind::Image => {
                let frame = codec::decode_image(&upload.bytes, format)?;

                tracker.advance(RequestState::Transforming);
                let frame = pipeline::transform(frame, plan, &mut meter)?;

                tracker.advance(RequestState::Encoding);
                let encoded = pipeline::encode(&frame, target)?;
                let mut pending = self.storage.begin_artifact(target.extension())?;
                pending.write_all(&encoded)?;

                tracker.advance(RequestState::Committing);
                self.storage.commit(pending, &artifact_id)?;
                Produced {
                    width: frame.width(),
                    height: frame.height(),
                    frames: 1,
                    bytes: encoded.len() as u64,
                    target,
                    density: meter.summary(),
                }
            }
            MediaKind::Video => {
                let source = VideoSource::open(&staged.path, format)?;
                let pending = self.storage.begin_artifact(target.extension())?;

                // frames are transformed and encoded as they stream through
                tracker.advance(RequestState::Transforming);
                let encoding = source.transform_into(plan, &pending, &mut meter)?;

                tracker.advance(RequestState::Encoding);
                let summary = encoding.finish()?;
                let bytes = pending.len();

                tracker.advance(RequestState::Committing);
                self.storage.commit(pending, &artifact_id)?;
                Produced {
                    width: summary.width,
                    height: summary.height,
                    frames: summary.frames,
                    bytes,
                    target,
                    density: meter.summary(),
                }
            }
        };

        debug!(
            request_id = %tracker.request_id,
            frames = produced.frames,
            "Committed {} as {}",
            artifact_id,
            produced.target.extension()
        );

        Ok(ArtifactReceipt {
            request_id: tracker.request_id.to_string(),
            location: format!("/artifacts/{}", artifact_id),
            artifact_id: artifact_id.to_string(),
            media_type: produced.target.mime().to_string(),
            width: produced.width,
            height: produced.height,
            frames: produced.frames,
            bytes: produced.bytes,
            stages: plan.names(),
            density: produced.density,
        })
    }
}

/// Lowercased extension of a declared file name
fn extension_of(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?;
    let (stem, ext) = base.rsplit_once('.')?;
    (!stem.is_empty() && !ext.is_empty()).then(|| ext.to_ascii_lowercase())
}

//! Service capability card
//!
//! Self-description served on `/capabilities` and printed at startup: which
//! stages a plan may name, which payloads are accepted and which targets can
//! be produced.

use serde::Serialize;

use crate::codec::{InputFormat, MediaKind, OutputFormat};
use crate::config::ServiceConfig;
use crate::stages::{StageInfo, StageRegistry};

#[derive(Debug, Clone, Serialize)]
pub struct ServiceCard {
    pub name: String,
    pub version: String,
    pub description: String,
    pub stages: Vec<StageInfo>,
    pub inputs: Vec<FormatCard>,
    pub outputs: Vec<FormatCard>,
    pub limits: LimitsCard,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormatCard {
    pub media_type: String,
    pub kind: MediaKind,
    /// Whether the allow-list currently admits it (inputs only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimitsCard {
    pub max_upload_bytes: u64,
    pub request_timeout_secs: u64,
    pub workers: usize,
    pub slots_per_worker: usize,
    pub default_stages: String,
    pub density_threshold: f32,
}

impl ServiceCard {
    pub fn describe(config: &ServiceConfig, registry: &StageRegistry) -> Self {
        let inputs = InputFormat::ALL
            .iter()
            .map(|f| FormatCard {
                media_type: f.mime().to_string(),
                kind: f.kind(),
                accepted: Some(config.is_type_allowed(f.mime())),
            })
            .collect();

        let outputs = OutputFormat::ALL
            .iter()
            .map(|f| FormatCard {
                media_type: f.mime().to_string(),
                kind: f.kind(),
                accepted: None,
            })
            .collect();

        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Upload, transform and encode images and video through ordered pixel stages".to_string(),
            stages: registry.describe(),
            inputs,
            outputs,
            limits: LimitsCard {
                max_upload_bytes: config.max_upload_bytes,
                request_timeout_secs: config.timeout_secs,
                workers: config.workers,
                slots_per_worker: config.threads,
                default_stages: config.default_stages.clone(),
                density_threshold: config.density_threshold,
            },
        }
    }
}

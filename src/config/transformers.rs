//! Request transformation configuration
//!
//! Transforms modify API requests before they are forwarded to the provider
//! (see `proxy::transformation`). This config carries only the master
//! enable/disable switch; concrete transformers are registered in code by
//! whatever deployment needs them.

use serde::Deserialize;

/// Request transformation settings
#[derive(Debug, Clone, Default)]
pub struct Transformers {
    /// Whether the transformation pipeline runs at all.
    /// When false, `TransformationPipeline::from_config` builds an empty pipeline.
    pub enabled: bool,
}

/// Transformers config as loaded from file
#[derive(Debug, Deserialize, Default)]
pub struct FileTransformers {
    pub enabled: Option<bool>,
}

impl Transformers {
    /// Create from file config with defaults
    pub fn from_file(file: Option<FileTransformers>) -> Self {
        let file = file.unwrap_or_default();

        Self {
            enabled: file.enabled.unwrap_or(false),
        }
    }
}

//! Pipeline binding error types.

use bindery_core::{ConfigurationError, DataType};
use thiserror::Error;

use crate::backend::BackendError;
use crate::reflection::{BindingKind, ShaderStage};

/// Errors raised while building or binding a pipeline.
///
/// Every variant is fatal to the pipeline or frame that raised it.
#[derive(Error, Debug)]
pub enum BindingError {
    #[error("block configuration failed: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("too many {resource}: {required} required, device limit is {limit}")]
    ResourceLimit {
        resource: &'static str,
        required: u32,
        limit: u32,
    },
    #[error("attribute {attribute} has no vertex format for {data_type}")]
    Format {
        attribute: String,
        data_type: DataType,
    },
    #[error("binding {slot} is declared as {existing} and as {requested}")]
    BindingConflict {
        slot: u32,
        existing: BindingKind,
        requested: BindingKind,
    },
    #[error("pipeline has not been built by an update yet")]
    NotBuilt,
    #[error("frame index {index} out of range for {frames} frames in flight")]
    InvalidFrameIndex { index: u32, frames: u32 },
    #[error("program has no {0} stage reflection")]
    MissingStage(ShaderStage),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

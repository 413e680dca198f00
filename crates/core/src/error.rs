//! Error type for the upscaling adapter.
//!
//! Every variant carries the exact names and shapes involved so callers can
//! diagnose a failure without inspecting internals.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A single mode conversion step the conversion engine cannot perform.
    #[error("conversion from {from} to {to} not supported")]
    UnsupportedConversion { from: String, to: String },

    /// The mode name is not a known pixel format at all.
    #[error("unknown image mode: {0}")]
    UnknownFormat(String),

    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("failed to load weights from {origin}: {reason}")]
    WeightLoad { origin: String, reason: String },

    #[error("unsupported scale factor {0} (expected 2, 3 or 4)")]
    UnsupportedScale(u32),

    #[error("invalid {mode} image: {reason}")]
    InvalidImage { mode: String, reason: String },

    /// A previous shape mismatch made the model variant unusable.
    #[error("model variant is unusable after an earlier failure: {0}")]
    ModelPoisoned(String),

    #[error("inference backend failed: {0}")]
    Inference(String),

    #[error("tile size {size} must exceed twice the overlap {overlap}")]
    InvalidTiling { size: usize, overlap: usize },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn unsupported(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::UnsupportedConversion {
            from: from.into(),
            to: to.into(),
        }
    }

    pub(crate) fn shape(
        context: impl Into<String>,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }

    pub(crate) fn weights(origin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WeightLoad {
            origin: origin.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error leaves the model variant unusable.
    pub fn is_fatal_for_model(&self) -> bool {
        matches!(
            self,
            Self::ShapeMismatch { .. } | Self::WeightLoad { .. } | Self::ModelPoisoned(_)
        )
    }
}

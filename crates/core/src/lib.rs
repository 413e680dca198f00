//! Mode-preserving image upscaling with DAT super-resolution models.
//!
//! An [`Upscaler`] takes an [`Image`] in any supported PIL-style pixel mode,
//! converts it to a `[1, 3, H, W]` tensor, runs the model variant's network
//! and converts the result back to the original mode at `scale` times the
//! size. Modes that cannot round-trip are rejected up front with the exact
//! conversion step that fails.

#[cfg(feature = "onnx")]
pub mod backend;
pub mod canonical;
pub mod config;
pub mod convert;
pub mod error;
pub mod format;
pub mod image;
pub mod interop;
pub mod logging;
pub mod model;
pub mod network;
pub mod session;
pub mod upscale;
pub mod weights;

pub use canonical::{from_canonical, to_canonical, CanonicalTensor};
pub use config::UpscaleConfig;
pub use error::{Error, Result};
pub use format::{lookup, ConversionRule, PixelFormat, PixelMode};
pub use crate::image::{Image, Palette};
pub use model::{ModelSpec, ModelVariant, SizeClass};
pub use network::{Network, ParameterShape, ParameterState};
pub use session::{InferenceSession, TileOptions};
pub use upscale::Upscaler;
pub use weights::{InMemoryWeights, SafetensorsFile, WeightSource};

//! Model variant selection: size class and scale to architecture
//! configuration, parameter contract and a ready inference session.

use std::fmt;
use std::str::FromStr;

use ndarray::Array4;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::network::{ConvNetwork, Network, ParameterShape, ParameterState};
use crate::session::{InferenceSession, TileOptions};
use crate::weights::WeightSource;

/// Feature width of the full-size reconstruction head.
pub const NUM_FEAT: usize = 64;

pub const SUPPORTED_SCALES: [u32; 3] = [2, 3, 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SizeClass {
    #[serde(rename = "dat_light")]
    Light,
    #[serde(rename = "dat_s")]
    Small,
    #[serde(rename = "dat")]
    Base,
    #[serde(rename = "dat_2")]
    Dat2,
}

impl SizeClass {
    pub const ALL: [SizeClass; 4] = [Self::Light, Self::Small, Self::Base, Self::Dat2];

    pub fn name(self) -> &'static str {
        match self {
            Self::Light => "dat_light",
            Self::Small => "dat_s",
            Self::Base => "dat",
            Self::Dat2 => "dat_2",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    pub fn architecture(self) -> &'static ArchitectureConfig {
        match self {
            Self::Light => &LIGHT,
            Self::Small => &SMALL,
            Self::Base => &BASE,
            Self::Dat2 => &DAT2,
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SizeClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_name(s.trim()).ok_or_else(|| {
            format!("unknown size class `{s}` (expected dat_light, dat_s, dat or dat_2)")
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResiConnection {
    OneConv,
    ThreeConv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsampler {
    PixelShuffleDirect,
    PixelShuffle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchitectureConfig {
    pub embed_dim: usize,
    pub depth: &'static [usize],
    pub num_heads: &'static [usize],
    pub expansion_factor: f32,
    pub split_size: [usize; 2],
    pub resi_connection: ResiConnection,
    pub upsampler: Upsampler,
    pub img_range: f32,
    pub rgb_mean: [f32; 3],
    /// Whether a variant can be built without a checkpoint.
    pub default_init: bool,
}

const RGB_MEAN: [f32; 3] = [0.4488, 0.4371, 0.4040];

static LIGHT: ArchitectureConfig = ArchitectureConfig {
    embed_dim: 60,
    depth: &[18],
    num_heads: &[6],
    expansion_factor: 2.0,
    split_size: [8, 32],
    resi_connection: ResiConnection::ThreeConv,
    upsampler: Upsampler::PixelShuffleDirect,
    img_range: 1.0,
    rgb_mean: RGB_MEAN,
    default_init: true,
};

static SMALL: ArchitectureConfig = ArchitectureConfig {
    embed_dim: 180,
    depth: &[6; 6],
    num_heads: &[6; 6],
    expansion_factor: 2.0,
    split_size: [8, 16],
    resi_connection: ResiConnection::OneConv,
    upsampler: Upsampler::PixelShuffle,
    img_range: 1.0,
    rgb_mean: RGB_MEAN,
    default_init: false,
};

static BASE: ArchitectureConfig = ArchitectureConfig {
    embed_dim: 180,
    depth: &[6; 6],
    num_heads: &[6; 6],
    expansion_factor: 4.0,
    split_size: [8, 32],
    resi_connection: ResiConnection::OneConv,
    upsampler: Upsampler::PixelShuffle,
    img_range: 1.0,
    rgb_mean: RGB_MEAN,
    default_init: false,
};

static DAT2: ArchitectureConfig = ArchitectureConfig {
    embed_dim: 180,
    depth: &[6; 6],
    num_heads: &[6; 6],
    expansion_factor: 2.0,
    split_size: [8, 32],
    resi_connection: ResiConnection::OneConv,
    upsampler: Upsampler::PixelShuffle,
    img_range: 1.0,
    rgb_mean: RGB_MEAN,
    default_init: false,
};

/// A validated `{size class, scale}` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelSpec {
    size: SizeClass,
    scale: u32,
}

impl ModelSpec {
    pub fn new(size: SizeClass, scale: u32) -> Result<Self> {
        if !SUPPORTED_SCALES.contains(&scale) {
            return Err(Error::UnsupportedScale(scale));
        }
        Ok(Self { size, scale })
    }

    pub fn size_class(&self) -> SizeClass {
        self.size
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn architecture(&self) -> &'static ArchitectureConfig {
        self.size.architecture()
    }

    /// Spatial multiple the session pads inputs to.
    pub fn pad_align(&self) -> usize {
        let [a, b] = self.architecture().split_size;
        a.max(b)
    }

    /// Shuffle factors of the full-size upsampler, one per conv step.
    pub fn upsample_steps(&self) -> &'static [usize] {
        match self.scale {
            2 => &[2],
            3 => &[3],
            _ => &[2, 2],
        }
    }

    /// Names and shapes every loaded state must provide.
    pub fn parameter_contract(&self) -> Vec<ParameterShape> {
        let arch = self.architecture();
        let e = arch.embed_dim;
        let s = self.scale as usize;
        let mut contract = Vec::new();
        let mut conv = |name: &str, out_c: usize, in_c: usize, k: usize| {
            contract.push(ParameterShape::new(format!("{name}.weight"), &[out_c, in_c, k, k]));
            contract.push(ParameterShape::new(format!("{name}.bias"), &[out_c]));
        };

        conv("conv_first", e, 3, 3);
        match arch.resi_connection {
            ResiConnection::OneConv => conv("conv_after_body", e, e, 3),
            ResiConnection::ThreeConv => {
                conv("conv_after_body.0", e / 4, e, 3);
                conv("conv_after_body.2", e / 4, e / 4, 1);
                conv("conv_after_body.4", e, e / 4, 3);
            }
        }
        match arch.upsampler {
            Upsampler::PixelShuffleDirect => conv("upsample.0", 3 * s * s, e, 3),
            Upsampler::PixelShuffle => {
                conv("conv_before_upsample.0", NUM_FEAT, e, 3);
                for (i, r) in self.upsample_steps().iter().enumerate() {
                    conv(&format!("upsample.{}", 2 * i), r * r * NUM_FEAT, NUM_FEAT, 3);
                }
                conv("conv_last", 3, NUM_FEAT, 3);
            }
        }
        contract
    }

    /// Parameters used when no checkpoint is given, if the class allows it.
    ///
    /// The sub-pixel convolution is initialized so the pixel shuffle repeats
    /// each input pixel `scale x scale` times.
    pub fn default_parameters(&self) -> Option<ParameterState> {
        if !self.architecture().default_init {
            return None;
        }
        let arch = self.architecture();
        let mut state = ParameterState::zeros(&self.parameter_contract());
        let s2 = (self.scale * self.scale) as usize;

        let mut first = Array4::<f32>::zeros((arch.embed_dim, 3, 3, 3));
        let mut upsample = Array4::<f32>::zeros((3 * s2, arch.embed_dim, 3, 3));
        for c in 0..3 {
            first[[c, c, 1, 1]] = 1.0;
            for sub in 0..s2 {
                upsample[[c * s2 + sub, c, 1, 1]] = 1.0;
            }
        }
        state.insert("conv_first.weight", first.into_dyn());
        state.insert("upsample.0.weight", upsample.into_dyn());
        Some(state)
    }
}

/// A constructed model: spec and the session owning its network.
pub struct ModelVariant {
    spec: ModelSpec,
    tensors: Option<usize>,
    session: InferenceSession,
}

impl ModelVariant {
    /// Build the built-in network for `size` at `scale`.
    ///
    /// Weights are loaded eagerly. Every class except `dat_light` needs them.
    pub fn new(size: SizeClass, scale: u32, weights: Option<&dyn WeightSource>) -> Result<Self> {
        let spec = ModelSpec::new(size, scale)?;
        let contract = spec.parameter_contract();

        let state = match weights {
            Some(source) => {
                let origin = source.describe();
                let state = source.load()?;
                state
                    .validate(&contract)
                    .map_err(|reason| Error::weights(&origin, reason))?;
                info!(size = %size, scale, origin = %origin, tensors = state.len(), "Loaded model weights");
                state
            }
            None => {
                let state = spec.default_parameters().ok_or_else(|| {
                    Error::weights(size.name(), "this size class requires a weight checkpoint")
                })?;
                info!(size = %size, scale, "Using default-initialized weights");
                state
            }
        };

        let tensors = contract.len();
        let network = ConvNetwork::from_parameters(&spec, state)?;
        let session = InferenceSession::new(Box::new(network), spec.pad_align());
        Ok(Self {
            spec,
            tensors: Some(tensors),
            session,
        })
    }

    pub fn dat_light(scale: u32, weights: Option<&dyn WeightSource>) -> Result<Self> {
        Self::new(SizeClass::Light, scale, weights)
    }

    pub fn dat_s(scale: u32, weights: &dyn WeightSource) -> Result<Self> {
        Self::new(SizeClass::Small, scale, Some(weights))
    }

    pub fn dat(scale: u32, weights: &dyn WeightSource) -> Result<Self> {
        Self::new(SizeClass::Base, scale, Some(weights))
    }

    pub fn dat_2(scale: u32, weights: &dyn WeightSource) -> Result<Self> {
        Self::new(SizeClass::Dat2, scale, Some(weights))
    }

    /// Wrap an external network, such as an exported ONNX graph.
    pub fn with_network(spec: ModelSpec, network: Box<dyn Network>) -> Result<Self> {
        if network.scale() != spec.scale() {
            return Err(Error::shape("network scale", spec.scale(), network.scale()));
        }
        info!(size = %spec.size_class(), scale = spec.scale(), "Wrapped external network");
        Ok(Self {
            spec,
            tensors: None,
            session: InferenceSession::new(network, spec.pad_align()),
        })
    }

    pub fn with_tiles(mut self, tiles: TileOptions) -> Result<Self> {
        self.session = self.session.with_tiles(tiles)?;
        Ok(self)
    }

    pub fn scale(&self) -> u32 {
        self.spec.scale()
    }

    pub fn size_class(&self) -> SizeClass {
        self.spec.size_class()
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    /// Number of parameter tensors held by the built-in network; `None` for
    /// variants wrapping an external network.
    pub fn parameter_count(&self) -> Option<usize> {
        self.tensors
    }

    pub fn session(&self) -> &InferenceSession {
        &self.session
    }
}

impl fmt::Debug for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelVariant")
            .field("spec", &self.spec)
            .field("tensors", &self.tensors)
            .field("session", &self.session)
            .finish()
    }
}

//! Weight sources that produce a [`ParameterState`].
//!
//! Checkpoints are read from SafeTensors files: an 8-byte little-endian
//! header length, a JSON header mapping tensor names to dtype, shape and
//! byte offsets, then the raw tensor bytes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use half::{bf16, f16};
use ndarray::{ArrayD, IxDyn};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::network::ParameterState;

const METADATA_KEY: &str = "__metadata__";
const EMA_PREFIX: &str = "params_ema.";
const PARAMS_PREFIX: &str = "params.";

pub trait WeightSource {
    /// Human-readable origin used in error messages.
    fn describe(&self) -> String;

    fn load(&self) -> Result<ParameterState>;
}

/// Weights that are already in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWeights {
    state: ParameterState,
}

impl InMemoryWeights {
    pub fn new(state: ParameterState) -> Self {
        Self { state }
    }
}

impl From<ParameterState> for InMemoryWeights {
    fn from(state: ParameterState) -> Self {
        Self::new(state)
    }
}

impl WeightSource for InMemoryWeights {
    fn describe(&self) -> String {
        format!("in-memory state ({} tensors)", self.state.len())
    }

    fn load(&self) -> Result<ParameterState> {
        Ok(self.state.clone())
    }
}

#[derive(Debug, Clone)]
pub struct SafetensorsFile {
    path: PathBuf,
    sha256: Option<String>,
}

impl SafetensorsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sha256: None,
        }
    }

    /// Require the file's SHA-256 digest (hex, case-insensitive) to match.
    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WeightSource for SafetensorsFile {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn load(&self) -> Result<ParameterState> {
        let origin = self.describe();
        let bytes = std::fs::read(&self.path).map_err(|e| Error::weights(&origin, e.to_string()))?;

        if let Some(expected) = &self.sha256 {
            let actual = format!("{:x}", Sha256::digest(&bytes));
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(Error::weights(
                    &origin,
                    format!("sha256 mismatch: expected {expected}, got {actual}"),
                ));
            }
        }

        decode_safetensors(&bytes).map_err(|reason| Error::weights(&origin, reason))
    }
}

#[derive(Debug, Deserialize)]
struct TensorInfo {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

fn decode_safetensors(bytes: &[u8]) -> std::result::Result<ParameterState, String> {
    let (len_bytes, rest) = bytes
        .split_first_chunk::<8>()
        .ok_or_else(|| "file is shorter than the 8-byte header length".to_string())?;
    let header_len = usize::try_from(u64::from_le_bytes(*len_bytes))
        .map_err(|_| "header length does not fit in memory".to_string())?;
    if header_len > rest.len() {
        return Err(format!(
            "header length {header_len} exceeds remaining {} bytes",
            rest.len()
        ));
    }
    let (header, data) = rest.split_at(header_len);

    let entries: BTreeMap<String, serde_json::Value> =
        serde_json::from_slice(header).map_err(|e| format!("invalid header: {e}"))?;

    let mut state = ParameterState::new();
    for (raw_name, value) in entries {
        if raw_name == METADATA_KEY {
            continue;
        }
        let info: TensorInfo = serde_json::from_value(value)
            .map_err(|e| format!("invalid header entry `{raw_name}`: {e}"))?;
        let tensor = decode_tensor(&raw_name, &info, data)?;

        if let Some(name) = raw_name.strip_prefix(EMA_PREFIX) {
            state.insert(name, tensor);
        } else {
            let name = raw_name.strip_prefix(PARAMS_PREFIX).unwrap_or(&raw_name);
            if state.get(name).is_none() {
                state.insert(name, tensor);
            }
        }
    }
    Ok(state)
}

fn decode_tensor(
    name: &str,
    info: &TensorInfo,
    data: &[u8],
) -> std::result::Result<ArrayD<f32>, String> {
    let elem_size = match info.dtype.as_str() {
        "F32" => 4,
        "F16" | "BF16" => 2,
        other => return Err(format!("tensor `{name}` has unsupported dtype {other}")),
    };

    let [begin, end] = info.data_offsets;
    if begin > end || end > data.len() {
        return Err(format!(
            "tensor `{name}` offsets [{begin}, {end}] outside {} data bytes",
            data.len()
        ));
    }
    let raw = &data[begin..end];
    let numel: usize = info.shape.iter().product();
    if raw.len() != numel * elem_size {
        return Err(format!(
            "tensor `{name}` holds {} bytes, shape {:?} needs {}",
            raw.len(),
            info.shape,
            numel * elem_size
        ));
    }

    let values: Vec<f32> = match info.dtype.as_str() {
        "F32" => raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        "F16" => raw
            .chunks_exact(2)
            .map(|b| f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
            .collect(),
        _ => raw
            .chunks_exact(2)
            .map(|b| bf16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
            .collect(),
    };

    ArrayD::from_shape_vec(IxDyn(&info.shape), values).map_err(|e| format!("tensor `{name}`: {e}"))
}

/// Serialize `state` as an F32 SafeTensors file.
pub fn encode_safetensors(state: &ParameterState) -> Vec<u8> {
    let mut header = serde_json::Map::new();
    let mut data = Vec::new();
    for (name, tensor) in state.iter() {
        let begin = data.len();
        for v in tensor.iter() {
            data.extend_from_slice(&v.to_le_bytes());
        }
        header.insert(
            name.to_string(),
            serde_json::json!({
                "dtype": "F32",
                "shape": tensor.shape(),
                "data_offsets": [begin, data.len()],
            }),
        );
    }

    let mut header_bytes = serde_json::Value::Object(header).to_string().into_bytes();
    while header_bytes.len() % 8 != 0 {
        header_bytes.push(b' ');
    }

    let mut out = Vec::with_capacity(8 + header_bytes.len() + data.len());
    out.extend_from_slice(&(header_bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&data);
    out
}

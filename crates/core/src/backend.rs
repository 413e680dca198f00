//! ONNX Runtime implementation of [`Network`] for exported DAT graphs.
//!
//! The graph must take `[1, 3, H, W]` in `[0, 1]` and return
//! `[1, 3, H*s, W*s]`. FP16 graphs are fed and read through `half`.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array4, ArrayD, ArrayView4, Ix4};
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
        TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use tracing::{debug, info};

use crate::config::InferenceProvider;
use crate::error::{Error, Result};
use crate::network::Network;

fn execution_providers(provider: InferenceProvider) -> Vec<ExecutionProviderDispatch> {
    match provider {
        InferenceProvider::Cpu => vec![CPUExecutionProvider::default().build()],
        InferenceProvider::Cuda => vec![
            CUDAExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ],
        // TRT EP falls back to CUDA and then CPU when its runtime is missing.
        InferenceProvider::Tensorrt => vec![
            TensorRTExecutionProvider::default()
                .with_fp16(true)
                .with_device_id(0)
                .build(),
            CUDAExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ],
    }
}

/// Build an `ort::Session` for `model_path` on the requested provider chain.
pub fn build_session(model_path: &Path, provider: InferenceProvider) -> anyhow::Result<Session> {
    debug!(path = %model_path.display(), %provider, "Building ONNX session");
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_execution_providers(execution_providers(provider))?
        .commit_from_file(model_path)
        .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?;
    Ok(session)
}

pub struct OnnxNetwork {
    session: Mutex<Session>,
    scale: u32,
    input_name: String,
    output_name: String,
    is_fp16: bool,
}

impl OnnxNetwork {
    pub fn from_file(
        model_path: &Path,
        scale: u32,
        provider: InferenceProvider,
    ) -> anyhow::Result<Self> {
        Self::from_session(build_session(model_path, provider)?, scale)
    }

    pub fn from_session(session: Session, scale: u32) -> anyhow::Result<Self> {
        let input = session.inputs().first().context("ONNX model has no inputs")?;
        let output = session.outputs().first().context("ONNX model has no outputs")?;
        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        let is_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        info!(%input_name, %output_name, is_fp16, scale, "Detected ONNX model IO");
        Ok(Self {
            session: Mutex::new(session),
            scale,
            input_name,
            output_name,
            is_fp16,
        })
    }

    fn run_f32(&self, session: &mut Session, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let tensor = Tensor::from_array(input).map_err(inference)?;
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => &tensor])
            .map_err(inference)?;
        let view = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(inference)?;
        Ok(view.to_owned())
    }

    fn run_f16(&self, session: &mut Session, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let shape = input.shape().to_vec();
        let contiguous = input.as_standard_layout();
        let f32_slice = contiguous
            .as_slice()
            .ok_or_else(|| Error::Inference("input tensor is not contiguous".to_string()))?;
        let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
        fp16_data.convert_from_f32_slice(f32_slice);

        let fp16_array = ArrayD::from_shape_vec(shape, fp16_data).map_err(inference)?;
        let tensor = Tensor::from_array(fp16_array).map_err(inference)?;
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => &tensor])
            .map_err(inference)?;
        let view = outputs[self.output_name.as_str()]
            .try_extract_array::<f16>()
            .map_err(inference)?;

        let standard = view.as_standard_layout();
        let fp16_slice = standard
            .as_slice()
            .ok_or_else(|| Error::Inference("output tensor is not contiguous".to_string()))?;
        let mut f32_data = vec![0.0f32; fp16_slice.len()];
        fp16_slice.convert_to_f32_slice(&mut f32_data);
        ArrayD::from_shape_vec(view.shape().to_vec(), f32_data).map_err(inference)
    }
}

impl Network for OnnxNetwork {
    fn scale(&self) -> u32 {
        self.scale
    }

    fn infer(&self, input: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| Error::Inference("ONNX session lock poisoned".to_string()))?;
        let output = if self.is_fp16 {
            self.run_f16(&mut session, input.to_owned())?
        } else {
            self.run_f32(&mut session, input.to_owned())?
        };
        let shape = output.shape().to_vec();
        output
            .into_dimensionality::<Ix4>()
            .map_err(|_| Error::shape("ONNX output rank", ["N", "C", "H", "W"], shape))
    }
}

fn inference(err: impl std::fmt::Display) -> Error {
    Error::Inference(err.to_string())
}

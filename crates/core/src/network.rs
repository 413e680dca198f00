//! The network capability behind a model variant.
//!
//! [`Network`] is the seam: anything that maps a `[1, 3, H, W]` tensor to a
//! `[1, 3, H*s, W*s]` tensor can back a variant. [`ConvNetwork`] is the
//! built-in implementation: the convolutional stem, residual body convolution
//! and pixel-shuffle reconstruction of the DAT family, driven by a
//! [`ParameterState`] keyed with the checkpoint layer names.

use std::collections::BTreeMap;

use ndarray::{s, Array1, Array3, Array4, ArrayD, ArrayView3, ArrayView4, Axis, Ix1, Ix4};

use crate::error::{Error, Result};
use crate::model::{ModelSpec, ResiConnection, Upsampler};

pub trait Network: Send + Sync {
    /// Integer upscaling factor of every `infer` call.
    fn scale(&self) -> u32;

    /// Run one forward pass. Deterministic for fixed parameters and input.
    fn infer(&self, input: ArrayView4<'_, f32>) -> Result<Array4<f32>>;
}

/// Expected name and shape of one parameter tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterShape {
    pub name: String,
    pub shape: Vec<usize>,
}

impl ParameterShape {
    pub fn new(name: impl Into<String>, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
        }
    }
}

/// Loaded weights and biases, keyed by layer name (`conv_first.weight`, ...).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterState {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl ParameterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero-filled tensors matching `contract`.
    pub fn zeros(contract: &[ParameterShape]) -> Self {
        contract
            .iter()
            .map(|p| (p.name.clone(), ArrayD::zeros(p.shape.as_slice())))
            .collect()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) -> Option<ArrayD<f32>> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ArrayD<f32>> {
        self.tensors.remove(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Check that every entry of `contract` is present with the exact shape.
    /// Keys outside the contract are ignored.
    pub fn validate(&self, contract: &[ParameterShape]) -> std::result::Result<(), String> {
        for expected in contract {
            let Some(tensor) = self.tensors.get(&expected.name) else {
                return Err(format!("missing parameter `{}`", expected.name));
            };
            if tensor.shape() != expected.shape.as_slice() {
                return Err(format!(
                    "parameter `{}` has shape {:?}, expected {:?}",
                    expected.name,
                    tensor.shape(),
                    expected.shape
                ));
            }
        }
        Ok(())
    }
}

impl FromIterator<(String, ArrayD<f32>)> for ParameterState {
    fn from_iter<I: IntoIterator<Item = (String, ArrayD<f32>)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

/// Zero-padded "same" 2D convolution with bias.
#[derive(Debug, Clone)]
struct Conv2d {
    weight: Array4<f32>,
    bias: Array1<f32>,
}

impl Conv2d {
    fn from_state(params: &mut ParameterState, prefix: &str) -> Result<Self> {
        let weight = take(params, &format!("{prefix}.weight"))?
            .into_dimensionality::<Ix4>()
            .map_err(|e| Error::weights(prefix, e.to_string()))?;
        let bias = take(params, &format!("{prefix}.bias"))?
            .into_dimensionality::<Ix1>()
            .map_err(|e| Error::weights(prefix, e.to_string()))?;
        if bias.len() != weight.shape()[0] {
            return Err(Error::weights(
                prefix,
                format!("bias has {} entries for {} filters", bias.len(), weight.shape()[0]),
            ));
        }
        Ok(Self { weight, bias })
    }

    fn forward(&self, x: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        let (out_c, in_c, kh, kw) = self.weight.dim();
        let (c, h, w) = x.dim();
        if c != in_c {
            return Err(Error::shape("convolution input channels", in_c, c));
        }

        let mut out = Array3::<f32>::zeros((out_c, h, w));
        for (o, mut plane) in out.axis_iter_mut(Axis(0)).enumerate() {
            plane.fill(self.bias[o]);
        }

        let (ph, pw) = ((kh / 2) as isize, (kw / 2) as isize);
        let (hi, wi) = (h as isize, w as isize);
        for o in 0..out_c {
            for i in 0..in_c {
                for ky in 0..kh {
                    let dy = ky as isize - ph;
                    let (y0, y1) = ((-dy).max(0), (hi - dy).min(hi));
                    if y0 >= y1 {
                        continue;
                    }
                    for kx in 0..kw {
                        let tap = self.weight[[o, i, ky, kx]];
                        if tap == 0.0 {
                            continue;
                        }
                        let dx = kx as isize - pw;
                        let (x0, x1) = ((-dx).max(0), (wi - dx).min(wi));
                        if x0 >= x1 {
                            continue;
                        }
                        let src = x.slice(s![i, y0 + dy..y1 + dy, x0 + dx..x1 + dx]);
                        out.slice_mut(s![o, y0..y1, x0..x1]).scaled_add(tap, &src);
                    }
                }
            }
        }
        Ok(out)
    }
}

fn take(params: &mut ParameterState, name: &str) -> Result<ArrayD<f32>> {
    params
        .remove(name)
        .ok_or_else(|| Error::weights("parameter state", format!("missing parameter `{name}`")))
}

fn leaky_relu(mut x: Array3<f32>, slope: f32) -> Array3<f32> {
    x.mapv_inplace(|v| if v >= 0.0 { v } else { v * slope });
    x
}

/// `[C*r*r, H, W]` -> `[C, H*r, W*r]`.
fn pixel_shuffle(x: Array3<f32>, r: usize) -> Array3<f32> {
    let (cr2, h, w) = x.dim();
    let c = cr2 / (r * r);
    let mut out = Array3::<f32>::zeros((c, h * r, w * r));
    for ch in 0..c {
        for i in 0..r {
            for j in 0..r {
                let src = x.index_axis(Axis(0), ch * r * r + i * r + j);
                out.slice_mut(s![ch, i..;r, j..;r]).assign(&src);
            }
        }
    }
    out
}

enum Body {
    OneConv(Conv2d),
    ThreeConv([Conv2d; 3]),
}

enum Head {
    Direct(Conv2d),
    Shuffle {
        before: Conv2d,
        steps: Vec<(Conv2d, usize)>,
        last: Conv2d,
    },
}

pub struct ConvNetwork {
    scale: u32,
    img_range: f32,
    rgb_mean: [f32; 3],
    conv_first: Conv2d,
    body: Body,
    head: Head,
}

impl ConvNetwork {
    /// Build the network for `spec` from a state that satisfies its contract.
    ///
    /// The layer tensors are moved out of `params`; keys outside the contract
    /// are dropped with it.
    pub fn from_parameters(spec: &ModelSpec, mut params: ParameterState) -> Result<Self> {
        let arch = spec.architecture();
        let params = &mut params;
        let conv_first = Conv2d::from_state(params, "conv_first")?;

        let body = match arch.resi_connection {
            ResiConnection::OneConv => Body::OneConv(Conv2d::from_state(params, "conv_after_body")?),
            ResiConnection::ThreeConv => Body::ThreeConv([
                Conv2d::from_state(params, "conv_after_body.0")?,
                Conv2d::from_state(params, "conv_after_body.2")?,
                Conv2d::from_state(params, "conv_after_body.4")?,
            ]),
        };

        let head = match arch.upsampler {
            Upsampler::PixelShuffleDirect => Head::Direct(Conv2d::from_state(params, "upsample.0")?),
            Upsampler::PixelShuffle => {
                let steps = spec
                    .upsample_steps()
                    .iter()
                    .enumerate()
                    .map(|(i, &r)| -> Result<(Conv2d, usize)> {
                        Ok((Conv2d::from_state(params, &format!("upsample.{}", 2 * i))?, r))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Head::Shuffle {
                    before: Conv2d::from_state(params, "conv_before_upsample.0")?,
                    steps,
                    last: Conv2d::from_state(params, "conv_last")?,
                }
            }
        };

        Ok(Self {
            scale: spec.scale(),
            img_range: arch.img_range,
            rgb_mean: arch.rgb_mean,
            conv_first,
            body,
            head,
        })
    }

    fn reconstruct(&self, features: Array3<f32>) -> Result<Array3<f32>> {
        match &self.head {
            Head::Direct(upsample) => Ok(pixel_shuffle(
                upsample.forward(features.view())?,
                self.scale as usize,
            )),
            Head::Shuffle {
                before,
                steps,
                last,
            } => {
                let mut x = leaky_relu(before.forward(features.view())?, 0.01);
                for (conv, r) in steps {
                    x = pixel_shuffle(conv.forward(x.view())?, *r);
                }
                last.forward(x.view())
            }
        }
    }
}

impl Network for ConvNetwork {
    fn scale(&self) -> u32 {
        self.scale
    }

    fn infer(&self, input: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let shape = input.shape();
        if shape[0] != 1 || shape[1] != 3 {
            return Err(Error::shape("network input", ["1", "3", "H", "W"], shape));
        }

        let mut x = input.index_axis(Axis(0), 0).to_owned();
        for (mut plane, mean) in x.axis_iter_mut(Axis(0)).zip(self.rgb_mean) {
            plane.mapv_inplace(|v| (v - mean) * self.img_range);
        }

        let shallow = self.conv_first.forward(x.view())?;
        let deep = match &self.body {
            Body::OneConv(conv) => conv.forward(shallow.view())?,
            Body::ThreeConv([a, b, c]) => {
                let t = leaky_relu(a.forward(shallow.view())?, 0.2);
                let t = leaky_relu(b.forward(t.view())?, 0.2);
                c.forward(t.view())?
            }
        };

        let mut y = self.reconstruct(deep + &shallow)?;
        if y.shape()[0] != 3 {
            return Err(Error::shape("reconstruction channels", 3, y.shape()[0]));
        }
        for (mut plane, mean) in y.axis_iter_mut(Axis(0)).zip(self.rgb_mean) {
            plane.mapv_inplace(|v| v / self.img_range + mean);
        }
        Ok(y.insert_axis(Axis(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SizeClass, NUM_FEAT};
    use ndarray::{Array, IxDyn};

    fn conv(weight: Array4<f32>, bias: Vec<f32>) -> Conv2d {
        Conv2d {
            weight,
            bias: Array1::from(bias),
        }
    }

    #[test]
    fn conv_center_tap_is_identity() {
        let mut weight = Array4::<f32>::zeros((1, 1, 3, 3));
        weight[[0, 0, 1, 1]] = 1.0;
        let layer = conv(weight, vec![0.5]);
        let x = Array::from_shape_fn((1, 3, 4), |(_, y, x)| (y * 4 + x) as f32);
        let out = layer.forward(x.view()).unwrap();
        assert_eq!(out, x.mapv(|v| v + 0.5));
    }

    #[test]
    fn conv_pads_with_zeros() {
        let weight = Array4::<f32>::ones((1, 1, 3, 3));
        let layer = conv(weight, vec![0.0]);
        let x = Array3::<f32>::ones((1, 3, 3));
        let out = layer.forward(x.view()).unwrap();
        assert_eq!(out[[0, 0, 0]], 4.0);
        assert_eq!(out[[0, 0, 1]], 6.0);
        assert_eq!(out[[0, 1, 1]], 9.0);
    }

    #[test]
    fn conv_rejects_wrong_channel_count() {
        let layer = conv(Array4::zeros((2, 3, 3, 3)), vec![0.0, 0.0]);
        let x = Array3::<f32>::zeros((4, 2, 2));
        assert!(matches!(
            layer.forward(x.view()),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn pixel_shuffle_interleaves_subpixels() {
        let x = Array::from_shape_fn((4, 1, 1), |(c, _, _)| c as f32);
        let out = pixel_shuffle(x, 2);
        assert_eq!(out.dim(), (1, 2, 2));
        assert_eq!(out[[0, 0, 0]], 0.0);
        assert_eq!(out[[0, 0, 1]], 1.0);
        assert_eq!(out[[0, 1, 0]], 2.0);
        assert_eq!(out[[0, 1, 1]], 3.0);
    }

    #[test]
    fn validate_reports_missing_and_misshapen() {
        let contract = vec![
            ParameterShape::new("a.weight", &[2, 3]),
            ParameterShape::new("a.bias", &[2]),
        ];
        let mut state = ParameterState::zeros(&contract);
        assert!(state.validate(&contract).is_ok());

        state.insert("a.bias", ArrayD::zeros(IxDyn(&[3])));
        let reason = state.validate(&contract).unwrap_err();
        assert_eq!(reason, "parameter `a.bias` has shape [3], expected [2]");

        let empty = ParameterState::new();
        assert_eq!(
            empty.validate(&contract).unwrap_err(),
            "missing parameter `a.weight`"
        );
    }

    #[test]
    fn extra_parameters_are_ignored() {
        let contract = vec![ParameterShape::new("x", &[1])];
        let mut state = ParameterState::zeros(&contract);
        state.insert("layers.0.attn.qkv.weight", ArrayD::zeros(IxDyn(&[4, 4])));
        assert!(state.validate(&contract).is_ok());
        assert_eq!(state.len(), 2);
    }

    /// Centre-tap weights that carry the RGB channels through every layer of
    /// the full-size head. `shift` is added before the LeakyReLU and removed
    /// again by `conv_last`.
    fn shuffle_identity(spec: &ModelSpec, shift: f32) -> ParameterState {
        let e = spec.architecture().embed_dim;
        let mut state = ParameterState::zeros(&spec.parameter_contract());
        let mut first = Array4::<f32>::zeros((e, 3, 3, 3));
        let mut before = Array4::<f32>::zeros((NUM_FEAT, e, 3, 3));
        let mut last = Array4::<f32>::zeros((3, NUM_FEAT, 3, 3));
        for c in 0..3 {
            first[[c, c, 1, 1]] = 1.0;
            before[[c, c, 1, 1]] = 1.0;
            last[[c, c, 1, 1]] = 1.0;
        }
        state.insert("conv_first.weight", first.into_dyn());
        state.insert("conv_before_upsample.0.weight", before.into_dyn());
        state.insert(
            "conv_before_upsample.0.bias",
            Array1::from_elem(NUM_FEAT, shift).into_dyn(),
        );
        state.insert("conv_last.weight", last.into_dyn());
        state.insert("conv_last.bias", Array1::from_elem(3, -shift).into_dyn());
        for (i, &r) in spec.upsample_steps().iter().enumerate() {
            let mut up = Array4::<f32>::zeros((r * r * NUM_FEAT, NUM_FEAT, 3, 3));
            for c in 0..3 {
                for sub in 0..r * r {
                    up[[c * r * r + sub, c, 1, 1]] = 1.0;
                }
            }
            state.insert(format!("upsample.{}.weight", 2 * i), up.into_dyn());
        }
        state
    }

    #[test]
    fn full_head_shuffles_to_nearest_neighbour() {
        let input = Array::from_shape_fn((1, 3, 5, 4), |(_, c, y, x)| {
            ((c * 50 + y * 40 + x * 17) % 256) as f32 / 255.0
        });
        for scale in [2, 3, 4] {
            let spec = ModelSpec::new(SizeClass::Small, scale).unwrap();
            let network = ConvNetwork::from_parameters(&spec, shuffle_identity(&spec, 1.0)).unwrap();
            let out = network.infer(input.view()).unwrap();
            let s = scale as usize;
            assert_eq!(out.shape(), [1, 3, 5 * s, 4 * s]);
            for ((_, c, y, x), v) in out.indexed_iter() {
                let expected = input[[0, c, y / s, x / s]];
                assert!((v - expected).abs() < 1e-5, "x{scale} ({c}, {y}, {x}): {v} vs {expected}");
            }
        }
    }

    #[test]
    fn full_head_applies_leaky_relu_before_upsampling() {
        // A black input is below the mean, so every feature reaching the
        // activation is negative and scaled by 0.01.
        let spec = ModelSpec::new(SizeClass::Base, 4).unwrap();
        let network = ConvNetwork::from_parameters(&spec, shuffle_identity(&spec, 0.0)).unwrap();
        let out = network.infer(Array4::<f32>::zeros((1, 3, 2, 3)).view()).unwrap();
        let mean = spec.architecture().rgb_mean;
        for ((_, c, _, _), v) in out.indexed_iter() {
            let expected = mean[c] - 0.01 * mean[c];
            assert!((v - expected).abs() < 1e-6, "channel {c}: {v} vs {expected}");
        }
    }

    #[test]
    fn building_consumes_contract_tensors() {
        let spec = ModelSpec::new(SizeClass::Light, 2).unwrap();
        let mut state = spec.default_parameters().unwrap();
        state.insert("layers.0.attn.qkv.weight", ArrayD::zeros(IxDyn(&[4, 4])));
        assert!(ConvNetwork::from_parameters(&spec, state).is_ok());

        let mut partial = spec.default_parameters().unwrap();
        partial.remove("conv_after_body.4.bias");
        let err = ConvNetwork::from_parameters(&spec, partial).err().unwrap();
        assert!(matches!(err, Error::WeightLoad { .. }));
    }
}

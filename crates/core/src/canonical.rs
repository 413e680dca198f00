//! Conversion between images of any supported mode and the canonical
//! `[1, 3, H, W]` float tensor the network consumes.
//!
//! Pixels are normalized to `[0, 1]` (`v / 255`) on the way in and rounded and
//! clamped back to 8-bit on the way out.

use std::borrow::Cow;

use ndarray::{Array4, ArrayView4};

use crate::convert::{convert, convert_with_palette};
use crate::error::{Error, Result};
use crate::format::{ConversionRule, PixelMode};
use crate::image::{Image, Palette};

/// NCHW f32 tensor with batch 1 and exactly three channels.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalTensor {
    data: Array4<f32>,
}

impl CanonicalTensor {
    pub fn new(data: Array4<f32>) -> Result<Self> {
        let shape = data.shape();
        if shape[0] != 1 || shape[1] != 3 {
            return Err(Error::shape(
                "canonical tensor",
                ["1", "3", "H", "W"],
                shape,
            ));
        }
        Ok(Self { data })
    }

    pub fn height(&self) -> usize {
        self.data.shape()[2]
    }

    pub fn width(&self) -> usize {
        self.data.shape()[3]
    }

    pub fn shape(&self) -> [usize; 4] {
        [1, 3, self.height(), self.width()]
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    pub fn into_array(self) -> Array4<f32> {
        self.data
    }
}

/// Convert `image` to RGB along its registry path and normalize into a tensor.
pub fn to_canonical(image: &Image) -> Result<CanonicalTensor> {
    let rgb = to_rgb(image)?;
    let (w, h) = (rgb.width() as usize, rgb.height() as usize);
    let hw = h * w;

    let mut data = Array4::<f32>::zeros((1, 3, h, w));
    let slice = data
        .as_slice_mut()
        .ok_or_else(|| Error::shape("canonical tensor", "contiguous layout", "strided"))?;
    for (pixel_idx, px) in rgb.data().chunks_exact(3).enumerate() {
        slice[pixel_idx] = px[0] as f32 / 255.0;
        slice[hw + pixel_idx] = px[1] as f32 / 255.0;
        slice[2 * hw + pixel_idx] = px[2] as f32 / 255.0;
    }

    CanonicalTensor::new(data)
}

/// Denormalize `tensor` into RGB and convert it into `target_mode`.
///
/// `palette` is the color table indexed targets are quantized against; pass
/// the source image's palette to keep `P`/`PA` output on the same colors.
pub fn from_canonical(
    tensor: &CanonicalTensor,
    target_mode: PixelMode,
    target_size: (u32, u32),
    palette: Option<&Palette>,
) -> Result<Image> {
    let (w, h) = (target_size.0 as usize, target_size.1 as usize);
    if tensor.height() != h || tensor.width() != w {
        return Err(Error::shape(
            "network output",
            [1, 3, h, w],
            tensor.shape(),
        ));
    }

    let hw = h * w;
    let view = tensor.view();
    let standard;
    let slice = match view.as_slice() {
        Some(slice) => slice,
        None => {
            standard = view.as_standard_layout().into_owned();
            standard
                .as_slice()
                .ok_or_else(|| Error::shape("network output", "contiguous layout", "strided"))?
        }
    };

    let mut rgb = vec![0u8; hw * 3];
    for pixel_idx in 0..hw {
        let dst = pixel_idx * 3;
        rgb[dst] = denormalize(slice[pixel_idx]);
        rgb[dst + 1] = denormalize(slice[hw + pixel_idx]);
        rgb[dst + 2] = denormalize(slice[2 * hw + pixel_idx]);
    }
    let mut image = Image::from_raw(PixelMode::Rgb, target_size, rgb)?;

    if let ConversionRule::Supported { from_rgb, .. } = target_mode.rule() {
        for &step in from_rgb.iter() {
            image = convert_with_palette(&image, step, palette)?;
        }
    }
    convert_with_palette(&image, target_mode, palette)
}

fn to_rgb(image: &Image) -> Result<Cow<'_, Image>> {
    let mut current = Cow::Borrowed(image);
    if let ConversionRule::Supported { to_rgb, .. } = image.mode().rule() {
        for &step in to_rgb.iter() {
            current = Cow::Owned(convert(&current, step)?);
        }
    }
    if current.mode() != PixelMode::Rgb {
        current = Cow::Owned(convert(&current, PixelMode::Rgb)?);
    }
    Ok(current)
}

fn denormalize(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

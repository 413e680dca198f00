//! Conversions between [`image::DynamicImage`] and [`Image`].

use image::{DynamicImage, GrayAlphaImage, GrayImage, ImageBuffer, Luma, RgbImage, RgbaImage};

use crate::convert::convert;
use crate::error::{Error, Result};
use crate::format::{ByteOrder, PixelMode};
use crate::image::Image;

impl TryFrom<&DynamicImage> for Image {
    type Error = Error;

    fn try_from(dynamic: &DynamicImage) -> Result<Self> {
        let size = (dynamic.width(), dynamic.height());
        match dynamic {
            DynamicImage::ImageLuma8(buf) => Image::from_raw(PixelMode::Luma, size, buf.as_raw().clone()),
            DynamicImage::ImageLumaA8(buf) => {
                Image::from_raw(PixelMode::LumaAlpha, size, buf.as_raw().clone())
            }
            DynamicImage::ImageRgb8(buf) => Image::from_raw(PixelMode::Rgb, size, buf.as_raw().clone()),
            DynamicImage::ImageRgba8(buf) => Image::from_raw(PixelMode::Rgba, size, buf.as_raw().clone()),
            DynamicImage::ImageLuma16(buf) => {
                let data = buf.as_raw().iter().flat_map(|v| v.to_le_bytes()).collect();
                Image::from_raw(PixelMode::Int16, size, data)
            }
            DynamicImage::ImageRgb32F(buf) => {
                let data = buf
                    .as_raw()
                    .iter()
                    .map(|v| (v * 255.0).round().clamp(0.0, 255.0) as u8)
                    .collect();
                Image::from_raw(PixelMode::Rgb, size, data)
            }
            other if other.color().has_alpha() => {
                Image::from_raw(PixelMode::Rgba, size, other.to_rgba8().into_raw())
            }
            other => Image::from_raw(PixelMode::Rgb, size, other.to_rgb8().into_raw()),
        }
    }
}

impl TryFrom<&Image> for DynamicImage {
    type Error = Error;

    fn try_from(img: &Image) -> Result<Self> {
        let (w, h) = img.size();
        let mode = img.mode();
        let dynamic = match mode {
            PixelMode::Luma => GrayImage::from_raw(w, h, img.data().to_vec()).map(Self::ImageLuma8),
            PixelMode::LumaAlpha => {
                GrayAlphaImage::from_raw(w, h, img.data().to_vec()).map(Self::ImageLumaA8)
            }
            PixelMode::Rgb => RgbImage::from_raw(w, h, img.data().to_vec()).map(Self::ImageRgb8),
            PixelMode::Rgba => RgbaImage::from_raw(w, h, img.data().to_vec()).map(Self::ImageRgba8),
            PixelMode::Int16 | PixelMode::Int16Little | PixelMode::Int16Big | PixelMode::Int16Native => {
                let order = mode.format().byte_order.unwrap_or(ByteOrder::Little);
                let samples = img
                    .data()
                    .chunks_exact(2)
                    .map(|b| match order {
                        ByteOrder::Little => u16::from_le_bytes([b[0], b[1]]),
                        ByteOrder::Big => u16::from_be_bytes([b[0], b[1]]),
                        ByteOrder::Native => u16::from_ne_bytes([b[0], b[1]]),
                    })
                    .collect();
                ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(w, h, samples).map(Self::ImageLuma16)
            }
            // Colour goes through the conversion engine, alpha is the last byte
            // of each source pixel. `RGBX` padding is not alpha.
            _ if mode.format().has_alpha => {
                let rgb = convert(img, PixelMode::Rgb)?;
                let bpp = mode.format().bytes_per_pixel;
                let data = rgb
                    .data()
                    .chunks_exact(3)
                    .zip(img.data().chunks_exact(bpp))
                    .flat_map(|(c, px)| [c[0], c[1], c[2], px[bpp - 1]])
                    .collect();
                RgbaImage::from_raw(w, h, data).map(Self::ImageRgba8)
            }
            _ => {
                let rgb = convert(img, PixelMode::Rgb)?;
                return Self::try_from(&rgb);
            }
        };
        dynamic.ok_or_else(|| Error::InvalidImage {
            mode: mode.name().to_string(),
            reason: "buffer does not match the image dimensions".to_string(),
        })
    }
}

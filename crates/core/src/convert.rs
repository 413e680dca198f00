//! Mode conversion engine.
//!
//! A conversion is attempted in one direct step. When no direct step exists
//! the source is first normalized to its base mode (see [`PixelMode::base`])
//! and the conversion retried from there. The reported error always names the
//! step that actually failed.

use crate::error::{Error, Result};
use crate::format::PixelMode;
use crate::image::{Image, Palette, Rgb};

use PixelMode as M;

/// Convert `image` into `target`, using the source palette for indexed targets.
pub fn convert(image: &Image, target: PixelMode) -> Result<Image> {
    convert_with_palette(image, target, image.palette())
}

/// Convert `image` into `target`. `palette` is the color table of an indexed
/// target; the web palette is used when none is given.
pub fn convert_with_palette(
    image: &Image,
    target: PixelMode,
    palette: Option<&Palette>,
) -> Result<Image> {
    let source = image.mode();
    if source == target {
        return Ok(image.clone());
    }
    if let Some(converted) = direct(image, target, palette) {
        return Ok(converted);
    }

    let base = source.base();
    if base == source {
        return Err(Error::unsupported(source.name(), target.name()));
    }
    let normalized =
        direct(image, base, None).ok_or_else(|| Error::unsupported(source.name(), base.name()))?;
    if base == target {
        return Ok(normalized);
    }
    direct(&normalized, target, palette)
        .ok_or_else(|| Error::unsupported(base.name(), target.name()))
}

fn direct(image: &Image, target: PixelMode, palette: Option<&Palette>) -> Option<Image> {
    match (image.mode(), target) {
        (M::Rgb, _) => {
            let rgb: Vec<Rgb> = image
                .data()
                .chunks_exact(3)
                .map(|px| [px[0], px[1], px[2]])
                .collect();
            encode_rgb(&rgb, image.size(), target, palette)
        }
        (_, M::Rgb) => decode_rgb(image).map(|rgb| {
            let data = rgb.into_iter().flatten().collect();
            Image::from_parts(M::Rgb, image.size(), data, None)
        }),
        (M::Luma, M::Bilevel) => {
            let data = floyd_steinberg(image.data(), image.size());
            Some(Image::from_parts(M::Bilevel, image.size(), data, None))
        }
        (M::Bilevel, M::Luma) => {
            let data = image.data().iter().map(|&v| expand_bit(v)).collect();
            Some(Image::from_parts(M::Luma, image.size(), data, None))
        }
        (M::Float32, M::Luma) => {
            let data = image
                .data()
                .chunks_exact(4)
                .map(|px| float_to_u8(f32::from_le_bytes([px[0], px[1], px[2], px[3]])))
                .collect();
            Some(Image::from_parts(M::Luma, image.size(), data, None))
        }
        (M::Int16 | M::Int16Little | M::Int16Big | M::Int16Native, M::Luma) => {
            let data = (0..image.pixel_count())
                .map(|i| clamp_u16(read_u16(image.mode(), image.pixel(i))))
                .collect();
            Some(Image::from_parts(M::Luma, image.size(), data, None))
        }
        _ => None,
    }
}

/// Decode every pixel into RGB for modes with a direct path into RGB.
fn decode_rgb(image: &Image) -> Option<Vec<Rgb>> {
    let mode = image.mode();
    if matches!(
        mode,
        M::Rgb | M::Float32 | M::LumaPremultiplied | M::Bgr15 | M::Bgr16 | M::Bgr24
    ) {
        return None;
    }
    let grayscale;
    let palette = match image.palette() {
        Some(palette) => palette,
        None => {
            grayscale = Palette::grayscale();
            &grayscale
        }
    };
    Some(
        (0..image.pixel_count())
            .map(|i| decode_pixel(mode, palette, image.pixel(i)))
            .collect(),
    )
}

fn decode_pixel(mode: PixelMode, palette: &Palette, px: &[u8]) -> Rgb {
    let gray = |v: u8| [v, v, v];
    match mode {
        M::Bilevel => gray(expand_bit(px[0])),
        M::Luma | M::LumaAlpha => gray(px[0]),
        M::Palette | M::PaletteAlpha => palette.get(px[0]),
        M::RgbPremultiplied => unpremultiply([px[0], px[1], px[2]], px[3]),
        M::Cmyk => cmyk_to_rgb(px),
        M::YCbCr => ycbcr_to_rgb(px[0], px[1], px[2]),
        M::Hsv => hsv_to_rgb(px[0], px[1], px[2]),
        M::Lab => lab_to_rgb(px[0], px[1], px[2]),
        M::Int32 => gray(i32::from_le_bytes([px[0], px[1], px[2], px[3]]).clamp(0, 255) as u8),
        M::Int16 | M::Int16Little | M::Int16Big | M::Int16Native => {
            gray(clamp_u16(read_u16(mode, px)))
        }
        // RGBA, RGBX and the modes filtered out by decode_rgb.
        _ => [px[0], px[1], px[2]],
    }
}

/// Encode RGB pixels into `target` for modes RGB converts into directly.
fn encode_rgb(
    rgb: &[Rgb],
    size: (u32, u32),
    target: PixelMode,
    palette: Option<&Palette>,
) -> Option<Image> {
    let indexed = target
        .format()
        .palette
        .then(|| palette.cloned().unwrap_or_else(Palette::web));

    let data: Vec<u8> = match target {
        M::Bilevel => {
            let levels: Vec<u8> = rgb.iter().map(|&px| luma(px)).collect();
            floyd_steinberg(&levels, size)
        }
        M::Luma => rgb.iter().map(|&px| luma(px)).collect(),
        M::LumaAlpha => rgb.iter().flat_map(|&px| [luma(px), 255]).collect(),
        M::Palette | M::PaletteAlpha => {
            let table = indexed.as_ref()?;
            let with_alpha = target == M::PaletteAlpha;
            let mut data = Vec::with_capacity(rgb.len() * target.format().bytes_per_pixel);
            for &px in rgb {
                data.push(table.nearest(px));
                if with_alpha {
                    data.push(255);
                }
            }
            data
        }
        M::Rgba | M::Rgbx | M::RgbPremultiplied => {
            rgb.iter().flat_map(|&[r, g, b]| [r, g, b, 255]).collect()
        }
        M::Cmyk => rgb
            .iter()
            .flat_map(|&[r, g, b]| [255 - r, 255 - g, 255 - b, 0])
            .collect(),
        M::YCbCr => rgb.iter().flat_map(|&px| rgb_to_ycbcr(px)).collect(),
        M::Hsv => rgb.iter().flat_map(|&px| rgb_to_hsv(px)).collect(),
        M::Lab => rgb.iter().flat_map(|&px| rgb_to_lab(px)).collect(),
        M::Int32 => rgb
            .iter()
            .flat_map(|&px| (luma(px) as i32).to_le_bytes())
            .collect(),
        M::Float32 => rgb
            .iter()
            .flat_map(|&[r, g, b]| {
                let v = (299 * r as u32 + 587 * g as u32 + 114 * b as u32) as f32 / 1000.0;
                v.to_le_bytes()
            })
            .collect(),
        M::Rgb
        | M::LumaPremultiplied
        | M::Int16
        | M::Int16Little
        | M::Int16Big
        | M::Int16Native
        | M::Bgr15
        | M::Bgr16
        | M::Bgr24 => return None,
    };

    Some(Image::from_parts(target, size, data, indexed))
}

/// ITU-R 601-2 luma in 16-bit fixed point.
pub(crate) fn luma([r, g, b]: Rgb) -> u8 {
    ((r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000) >> 16) as u8
}

fn expand_bit(v: u8) -> u8 {
    if v == 0 {
        0
    } else {
        255
    }
}

fn float_to_u8(v: f32) -> u8 {
    // NaN falls into the first arm.
    if !(v > 0.0) {
        0
    } else if v >= 255.0 {
        255
    } else {
        v as u8
    }
}

fn read_u16(mode: PixelMode, px: &[u8]) -> u16 {
    let bytes = [px[0], px[1]];
    match mode {
        PixelMode::Int16Big => u16::from_be_bytes(bytes),
        PixelMode::Int16Native => u16::from_ne_bytes(bytes),
        _ => u16::from_le_bytes(bytes),
    }
}

fn clamp_u16(v: u16) -> u8 {
    v.min(255) as u8
}

fn muldiv255(a: u32, b: u32) -> u32 {
    let tmp = a * b + 128;
    ((tmp >> 8) + tmp) >> 8
}

fn unpremultiply(color: Rgb, alpha: u8) -> Rgb {
    if alpha == 0 {
        return [0, 0, 0];
    }
    let a = alpha as u32;
    color.map(|c| ((c as u32 * 255 + a / 2) / a).min(255) as u8)
}

fn cmyk_to_rgb(px: &[u8]) -> Rgb {
    let nk = 255 - px[3] as u32;
    [
        (nk - muldiv255(px[0] as u32, nk)) as u8,
        (nk - muldiv255(px[1] as u32, nk)) as u8,
        (nk - muldiv255(px[2] as u32, nk)) as u8,
    ]
}

fn round_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

fn rgb_to_ycbcr([r, g, b]: Rgb) -> [u8; 3] {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    [
        round_u8(0.299 * r + 0.587 * g + 0.114 * b),
        round_u8(128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b),
        round_u8(128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b),
    ]
}

fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> Rgb {
    let (y, cb, cr) = (y as f32, cb as f32 - 128.0, cr as f32 - 128.0);
    [
        round_u8(y + 1.402 * cr),
        round_u8(y - 0.344_136 * cb - 0.714_136 * cr),
        round_u8(y + 1.772 * cb),
    ]
}

fn rgb_to_hsv([r, g, b]: Rgb) -> [u8; 3] {
    let (r, g, b) = (r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let v = max;
    if max == min {
        return [0, 0, round_u8(v * 255.0)];
    }
    let delta = max - min;
    let s = delta / max;
    let rc = (max - r) / delta;
    let gc = (max - g) / delta;
    let bc = (max - b) / delta;
    let h = if r == max {
        bc - gc
    } else if g == max {
        2.0 + rc - bc
    } else {
        4.0 + gc - rc
    };
    let h = (h / 6.0).rem_euclid(1.0);
    [
        round_u8(h * 255.0),
        round_u8(s * 255.0),
        round_u8(v * 255.0),
    ]
}

fn hsv_to_rgb(h: u8, s: u8, v: u8) -> Rgb {
    let (h, s, v) = (h as f32 / 255.0, s as f32 / 255.0, v as f32 / 255.0);
    if s == 0.0 {
        let gray = round_u8(v * 255.0);
        return [gray, gray, gray];
    }
    let sector = (h * 6.0).floor();
    let f = h * 6.0 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    let (r, g, b) = match (sector as i32).rem_euclid(6) {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };
    [round_u8(r * 255.0), round_u8(g * 255.0), round_u8(b * 255.0)]
}

const D65: [f32; 3] = [0.950_47, 1.0, 1.088_83];
const LAB_DELTA: f32 = 6.0 / 29.0;

fn srgb_to_linear(c: u8) -> f32 {
    let c = c as f32 / 255.0;
    if c <= 0.040_45 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(c: f32) -> u8 {
    let c = c.clamp(0.0, 1.0);
    let encoded = if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    };
    round_u8(encoded * 255.0)
}

fn lab_f(t: f32) -> f32 {
    if t > LAB_DELTA.powi(3) {
        t.cbrt()
    } else {
        t / (3.0 * LAB_DELTA * LAB_DELTA) + 4.0 / 29.0
    }
}

fn lab_f_inv(t: f32) -> f32 {
    if t > LAB_DELTA {
        t.powi(3)
    } else {
        3.0 * LAB_DELTA * LAB_DELTA * (t - 4.0 / 29.0)
    }
}

fn rgb_to_lab([r, g, b]: Rgb) -> [u8; 3] {
    let (r, g, b) = (srgb_to_linear(r), srgb_to_linear(g), srgb_to_linear(b));
    let x = 0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b;
    let y = 0.212_672_9 * r + 0.715_152_2 * g + 0.072_175_0 * b;
    let z = 0.019_333_9 * r + 0.119_192 * g + 0.950_304_1 * b;
    let fx = lab_f(x / D65[0]);
    let fy = lab_f(y / D65[1]);
    let fz = lab_f(z / D65[2]);
    let l = 116.0 * fy - 16.0;
    let a = 500.0 * (fx - fy);
    let bb = 200.0 * (fy - fz);
    [
        round_u8(l * 255.0 / 100.0),
        round_u8(a + 128.0),
        round_u8(bb + 128.0),
    ]
}

fn lab_to_rgb(l: u8, a: u8, b: u8) -> Rgb {
    let l = l as f32 * 100.0 / 255.0;
    let a = a as f32 - 128.0;
    let b = b as f32 - 128.0;
    let fy = (l + 16.0) / 116.0;
    let fx = fy + a / 500.0;
    let fz = fy - b / 200.0;
    let x = D65[0] * lab_f_inv(fx);
    let y = D65[1] * lab_f_inv(fy);
    let z = D65[2] * lab_f_inv(fz);
    let r = 3.240_454_2 * x - 1.537_138_5 * y - 0.498_531_4 * z;
    let g = -0.969_266 * x + 1.876_010_8 * y + 0.041_556 * z;
    let bl = 0.055_643_4 * x - 0.204_025_9 * y + 1.057_225_2 * z;
    [linear_to_srgb(r), linear_to_srgb(g), linear_to_srgb(bl)]
}

/// Threshold 8-bit luma to {0, 255}, diffusing the error 7/3/5/1 sixteenths.
fn floyd_steinberg(luma: &[u8], (width, height): (u32, u32)) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut out = vec![0u8; w * h];
    let mut current = vec![0i32; w + 2];
    let mut next = vec![0i32; w + 2];

    for y in 0..h {
        for x in 0..w {
            let value = (luma[y * w + x] as i32 + current[x + 1] / 16).clamp(0, 255);
            let level = if value >= 128 { 255 } else { 0 };
            out[y * w + x] = level as u8;
            let error = value - level;
            current[x + 2] += error * 7;
            next[x] += error * 3;
            next[x + 1] += error * 5;
            next[x + 2] += error;
        }
        std::mem::swap(&mut current, &mut next);
        next.iter_mut().for_each(|e| *e = 0);
    }
    out
}

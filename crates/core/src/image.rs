//! In-memory raster image: dimensions, mode, raw pixel bytes and an optional
//! palette for indexed modes.

use crate::error::{Error, Result};
use crate::format::PixelMode;

pub type Rgb = [u8; 3];

/// Color table for `P` and `PA` images (at most 256 entries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    entries: Vec<Rgb>,
}

impl Palette {
    pub fn new(entries: Vec<Rgb>) -> Result<Self> {
        if entries.is_empty() || entries.len() > 256 {
            return Err(Error::InvalidImage {
                mode: PixelMode::Palette.name().to_string(),
                reason: format!("palette must hold 1..=256 entries, got {}", entries.len()),
            });
        }
        Ok(Self { entries })
    }

    /// 256 gray levels; index `i` maps to `(i, i, i)`.
    pub fn grayscale() -> Self {
        Self {
            entries: (0..=255u8).map(|v| [v, v, v]).collect(),
        }
    }

    /// The 6x6x6 web-safe color cube.
    pub fn web() -> Self {
        let mut entries = Vec::with_capacity(216);
        for r in 0..6u8 {
            for g in 0..6u8 {
                for b in 0..6u8 {
                    entries.push([r * 51, g * 51, b * 51]);
                }
            }
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Rgb] {
        &self.entries
    }

    /// Color of `index`; indices past the end read as black.
    pub fn get(&self, index: u8) -> Rgb {
        self.entries
            .get(index as usize)
            .copied()
            .unwrap_or([0, 0, 0])
    }

    /// Index of the closest entry by squared RGB distance (lowest index on ties).
    pub fn nearest(&self, color: Rgb) -> u8 {
        let mut best = 0usize;
        let mut best_distance = u32::MAX;
        for (index, entry) in self.entries.iter().enumerate() {
            let distance: u32 = entry
                .iter()
                .zip(color.iter())
                .map(|(&a, &b)| {
                    let d = a as i32 - b as i32;
                    (d * d) as u32
                })
                .sum();
            if distance < best_distance {
                best = index;
                best_distance = distance;
                if distance == 0 {
                    break;
                }
            }
        }
        best as u8
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    width: u32,
    height: u32,
    mode: PixelMode,
    data: Vec<u8>,
    palette: Option<Palette>,
}

impl Image {
    /// Zero-filled image. Indexed modes get a grayscale palette.
    pub fn new(mode: PixelMode, (width, height): (u32, u32)) -> Self {
        let len = buffer_len(mode, width, height);
        Self {
            width,
            height,
            mode,
            data: vec![0; len],
            palette: mode.format().palette.then(Palette::grayscale),
        }
    }

    /// Wrap raw bytes laid out as described by the mode's [`PixelFormat`].
    ///
    /// [`PixelFormat`]: crate::format::PixelFormat
    pub fn from_raw(mode: PixelMode, (width, height): (u32, u32), data: Vec<u8>) -> Result<Self> {
        let expected = buffer_len(mode, width, height);
        if data.len() != expected {
            return Err(Error::InvalidImage {
                mode: mode.name().to_string(),
                reason: format!(
                    "buffer holds {} bytes, {width}x{height} needs {expected}",
                    data.len()
                ),
            });
        }
        Ok(Self {
            width,
            height,
            mode,
            data,
            palette: mode.format().palette.then(Palette::grayscale),
        })
    }

    /// Replace the palette of an indexed image.
    pub fn with_palette(mut self, palette: Palette) -> Result<Self> {
        if !self.mode.format().palette {
            return Err(Error::InvalidImage {
                mode: self.mode.name().to_string(),
                reason: "only indexed modes carry a palette".to_string(),
            });
        }
        self.palette = Some(palette);
        Ok(self)
    }

    pub(crate) fn from_parts(
        mode: PixelMode,
        (width, height): (u32, u32),
        data: Vec<u8>,
        palette: Option<Palette>,
    ) -> Self {
        debug_assert_eq!(data.len(), buffer_len(mode, width, height));
        Self {
            width,
            height,
            mode,
            data,
            palette,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn mode(&self) -> PixelMode {
        self.mode
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn palette(&self) -> Option<&Palette> {
        self.palette.as_ref()
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    /// Bytes of the pixel at index `i` (row-major).
    pub(crate) fn pixel(&self, i: usize) -> &[u8] {
        let bpp = self.mode.format().bytes_per_pixel;
        &self.data[i * bpp..(i + 1) * bpp]
    }
}

fn buffer_len(mode: PixelMode, width: u32, height: u32) -> usize {
    width as usize * height as usize * mode.format().bytes_per_pixel
}

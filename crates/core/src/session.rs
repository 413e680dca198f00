//! Inference session: shape validation, alignment padding and tiled execution
//! around a [`Network`].

use std::fmt;
use std::sync::OnceLock;

use ndarray::{s, Array4, ArrayView4};
use tracing::{debug, warn};

use crate::canonical::CanonicalTensor;
use crate::error::{Error, Result};
use crate::network::Network;

pub const DEFAULT_TILE_OVERLAP: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileOptions {
    /// Tile edge in input pixels; `0` processes the whole image at once.
    pub size: usize,
    /// Context pixels on each side of a tile's core region.
    pub overlap: usize,
}

impl Default for TileOptions {
    fn default() -> Self {
        Self {
            size: 0,
            overlap: DEFAULT_TILE_OVERLAP,
        }
    }
}

impl TileOptions {
    pub fn tiled(size: usize) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.size > 0 && self.size <= 2 * self.overlap {
            return Err(Error::InvalidTiling {
                size: self.size,
                overlap: self.overlap,
            });
        }
        Ok(())
    }

    fn step(&self) -> usize {
        self.size - 2 * self.overlap
    }
}

pub struct InferenceSession {
    network: Box<dyn Network>,
    align: usize,
    tiles: TileOptions,
    poisoned: OnceLock<String>,
}

impl InferenceSession {
    pub fn new(network: Box<dyn Network>, align: usize) -> Self {
        Self {
            network,
            align: align.max(1),
            tiles: TileOptions::default(),
            poisoned: OnceLock::new(),
        }
    }

    pub fn with_tiles(mut self, tiles: TileOptions) -> Result<Self> {
        tiles.validate()?;
        self.tiles = tiles;
        Ok(self)
    }

    pub fn scale(&self) -> u32 {
        self.network.scale()
    }

    pub fn tiles(&self) -> TileOptions {
        self.tiles
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.get().is_some()
    }

    /// Run the network on `input`, producing `[1, 3, H*scale, W*scale]`.
    ///
    /// A shape mismatch coming back from the network poisons the session.
    pub fn run(&self, input: &CanonicalTensor) -> Result<CanonicalTensor> {
        if let Some(reason) = self.poisoned.get() {
            return Err(Error::ModelPoisoned(reason.clone()));
        }

        let (h, w) = (input.height(), input.width());
        if h == 0 || w == 0 {
            return Err(Error::shape(
                "session input",
                ["1", "3", "H>0", "W>0"],
                input.shape(),
            ));
        }

        let scale = self.scale() as usize;
        debug!(
            h,
            w,
            scale,
            tile_size = self.tiles.size,
            "Running inference"
        );

        let tiled = self.tiles.size > 0 && (h > self.tiles.size || w > self.tiles.size);
        let output = if tiled {
            self.run_tiled(input.view())
        } else {
            self.run_padded(input.view())
        };
        let result = output.and_then(|output| {
            let expected = [1, 3, h * scale, w * scale];
            if output.shape() != expected.as_slice() {
                return Err(Error::shape("session output", expected, output.shape()));
            }
            CanonicalTensor::new(output)
        });

        if let Err(err @ Error::ShapeMismatch { .. }) = &result {
            let reason = err.to_string();
            warn!(error = %reason, "Poisoning model variant");
            let _ = self.poisoned.set(reason);
        }
        result
    }

    /// Run the network and check it returned exactly `scale` times the input.
    fn infer_checked(&self, input: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let (h, w) = (input.shape()[2], input.shape()[3]);
        let scale = self.scale() as usize;
        let output = self.network.infer(input)?;
        let expected = [1, 3, h * scale, w * scale];
        if output.shape() != expected.as_slice() {
            return Err(Error::shape("network output", expected, output.shape()));
        }
        Ok(output)
    }

    fn run_padded(&self, input: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let (h, w) = (input.shape()[2], input.shape()[3]);
        let pad_h = pad_amount(h, self.align);
        let pad_w = pad_amount(w, self.align);
        if pad_h == 0 && pad_w == 0 {
            return self.infer_checked(input);
        }

        let scale = self.scale() as usize;
        let padded = reflect_pad(input, h + pad_h, w + pad_w);
        let output = self.infer_checked(padded.view())?;
        Ok(output
            .slice(s![.., .., ..h * scale, ..w * scale])
            .to_owned())
    }

    /// The input is reflection-padded to the alignment once, as in the
    /// whole-image pass. Every tile is an aligned window of that padded tensor
    /// holding its core plus `overlap` context pixels, and only the core is
    /// written to the output.
    fn run_tiled(&self, input: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let (h, w) = (input.shape()[2], input.shape()[3]);
        let scale = self.scale() as usize;
        let overlap = self.tiles.overlap;
        let step = self.tiles.step();
        let padded = reflect_pad(
            input,
            h + pad_amount(h, self.align),
            w + pad_amount(w, self.align),
        );
        let (padded_h, padded_w) = (padded.shape()[2], padded.shape()[3]);
        let mut output = Array4::<f32>::zeros((1, 3, h * scale, w * scale));

        debug!(
            tile_size = self.tiles.size,
            overlap, step, h, w, "Starting tiled inference"
        );

        for y in (0..h).step_by(step) {
            let core_y1 = (y + step).min(h);
            let (in_y0, in_y1) = tile_window(y, core_y1, overlap, self.align, padded_h);
            for x in (0..w).step_by(step) {
                let core_x1 = (x + step).min(w);
                let (in_x0, in_x1) = tile_window(x, core_x1, overlap, self.align, padded_w);

                let tile = padded.slice(s![.., .., in_y0..in_y1, in_x0..in_x1]);
                let tile_output = self.infer_checked(tile)?;

                let (cy0, cx0) = ((y - in_y0) * scale, (x - in_x0) * scale);
                let (ch, cw) = ((core_y1 - y) * scale, (core_x1 - x) * scale);
                output
                    .slice_mut(s![.., .., y * scale..core_y1 * scale, x * scale..core_x1 * scale])
                    .assign(&tile_output.slice(s![.., .., cy0..cy0 + ch, cx0..cx0 + cw]));
            }
        }
        Ok(output)
    }
}

impl fmt::Debug for InferenceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceSession")
            .field("scale", &self.scale())
            .field("align", &self.align)
            .field("tiles", &self.tiles)
            .field("poisoned", &self.poisoned.get())
            .finish()
    }
}

fn pad_amount(dim: usize, align: usize) -> usize {
    (align - (dim % align)) % align
}

/// Window `[start, end)` along a padded axis of length `len` (a multiple of
/// `align`) that covers `core0..core1` plus up to `overlap` pixels each side.
/// The window length is itself a multiple of `align`.
fn tile_window(core0: usize, core1: usize, overlap: usize, align: usize, len: usize) -> (usize, usize) {
    let want0 = core0.saturating_sub(overlap);
    let want1 = (core1 + overlap).min(len);
    let span = want1 - want0;
    let span = (span + pad_amount(span, align)).min(len);
    let start = want0.min(len - span);
    (start, start + span)
}

/// Symmetric reflection (edge pixel repeated), valid for any pad length.
fn mirror(i: usize, n: usize) -> usize {
    let m = i % (2 * n);
    if m < n {
        m
    } else {
        2 * n - 1 - m
    }
}

fn reflect_pad(input: ArrayView4<'_, f32>, new_h: usize, new_w: usize) -> Array4<f32> {
    let (h, w) = (input.shape()[2], input.shape()[3]);
    Array4::from_shape_fn((1, 3, new_h, new_w), |(n, c, y, x)| {
        input[[n, c, mirror(y, h), mirror(x, w)]]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Nearest-neighbour upscaler that records the input sizes it saw.
    struct Nearest {
        scale: u32,
        calls: AtomicUsize,
    }

    impl Nearest {
        fn new(scale: u32) -> Self {
            Self {
                scale,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Network for Nearest {
        fn scale(&self) -> u32 {
            self.scale
        }

        fn infer(&self, input: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let s = self.scale as usize;
            let (n, c, h, w) = input.dim();
            Ok(Array4::from_shape_fn((n, c, h * s, w * s), |(n, c, y, x)| {
                input[[n, c, y / s, x / s]]
            }))
        }
    }

    /// Returns a tensor one row short.
    struct Broken;

    impl Network for Broken {
        fn scale(&self) -> u32 {
            2
        }

        fn infer(&self, input: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
            let (_, _, h, w) = input.dim();
            Ok(Array4::zeros((1, 3, h * 2 - 1, w * 2)))
        }
    }

    /// 3x3 box mean with zero padding, then nearest-neighbour enlargement.
    /// Output pixels depend on their input neighbours, so tile borders show.
    struct BoxThenNearest(u32);

    impl Network for BoxThenNearest {
        fn scale(&self) -> u32 {
            self.0
        }

        fn infer(&self, input: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
            let s = self.0 as usize;
            let (n, c, h, w) = input.dim();
            let blurred = Array4::from_shape_fn((n, c, h, w), |(n, c, y, x)| {
                let mut acc = 0.0;
                for yy in y.saturating_sub(1)..(y + 2).min(h) {
                    for xx in x.saturating_sub(1)..(x + 2).min(w) {
                        acc += input[[n, c, yy, xx]];
                    }
                }
                acc / 9.0
            });
            Ok(Array4::from_shape_fn((n, c, h * s, w * s), |(n, c, y, x)| {
                blurred[[n, c, y / s, x / s]]
            }))
        }
    }

    fn gradient(h: usize, w: usize) -> CanonicalTensor {
        let data = Array::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
            ((c * 31 + y * 7 + x * 3) % 256) as f32 / 255.0
        });
        CanonicalTensor::new(data).unwrap()
    }

    #[test]
    fn mirror_reflects_symmetrically() {
        let idx: Vec<usize> = (0..9).map(|i| mirror(i, 3)).collect();
        assert_eq!(idx, vec![0, 1, 2, 2, 1, 0, 0, 1, 2]);
    }

    #[test]
    fn padded_run_crops_back_to_scaled_size() {
        let session = InferenceSession::new(Box::new(Nearest::new(3)), 16);
        let input = gradient(5, 7);
        let out = session.run(&input).unwrap();
        assert_eq!(out.shape(), [1, 3, 15, 21]);
        assert_eq!(out.view()[[0, 1, 14, 20]], input.view()[[0, 1, 4, 6]]);
    }

    #[test]
    fn tiled_matches_whole_image() {
        let input = gradient(70, 45);
        let whole = InferenceSession::new(Box::new(Nearest::new(2)), 8)
            .run(&input)
            .unwrap();

        let network = Nearest::new(2);
        let tiled_session = InferenceSession::new(Box::new(network), 8)
            .with_tiles(TileOptions { size: 40, overlap: 4 })
            .unwrap();
        let tiled = tiled_session.run(&input).unwrap();
        assert_eq!(tiled, whole);
    }

    #[test]
    fn tiles_see_the_same_edge_padding_as_the_whole_image() {
        // The last column tile (input 28..60) is already 32 wide, a multiple
        // of the alignment, so it must still read the mirrored edge.
        let input = gradient(8, 60);
        let whole = InferenceSession::new(Box::new(BoxThenNearest(2)), 8)
            .run(&input)
            .unwrap();
        let tiled = InferenceSession::new(Box::new(BoxThenNearest(2)), 8)
            .with_tiles(TileOptions { size: 40, overlap: 4 })
            .unwrap()
            .run(&input)
            .unwrap();
        assert_eq!(tiled, whole);

        let input = gradient(45, 150);
        let whole = InferenceSession::new(Box::new(BoxThenNearest(3)), 16)
            .run(&input)
            .unwrap();
        let tiled = InferenceSession::new(Box::new(BoxThenNearest(3)), 16)
            .with_tiles(TileOptions { size: 24, overlap: 2 })
            .unwrap()
            .run(&input)
            .unwrap();
        assert_eq!(tiled, whole);
    }

    #[test]
    fn tile_windows_are_aligned_and_cover_context() {
        // interior tile
        assert_eq!(tile_window(32, 64, 4, 32, 160), (28, 92));
        // last tile is shifted left to end on the padded edge
        assert_eq!(tile_window(32, 60, 4, 8, 64), (24, 64));
        // short axis takes the whole padded length
        assert_eq!(tile_window(0, 8, 4, 32, 32), (0, 32));
        for (core0, core1) in [(0, 32), (96, 128), (128, 150)] {
            let (start, end) = tile_window(core0, core1, 4, 32, 160);
            assert_eq!((end - start) % 32, 0);
            assert!(start <= core0.saturating_sub(4) && end >= (core1 + 4).min(160));
            assert!(end <= 160);
        }
    }

    #[test]
    fn small_images_skip_tiling() {
        let session = InferenceSession::new(Box::new(Nearest::new(2)), 1)
            .with_tiles(TileOptions::tiled(64))
            .unwrap();
        let out = session.run(&gradient(10, 10)).unwrap();
        assert_eq!(out.shape(), [1, 3, 20, 20]);
    }

    #[test]
    fn tile_size_must_exceed_overlap() {
        let err = TileOptions { size: 32, overlap: 16 }.validate().unwrap_err();
        assert_eq!(err, Error::InvalidTiling { size: 32, overlap: 16 });
        assert!(TileOptions::default().validate().is_ok());
    }

    #[test]
    fn empty_input_is_rejected_without_poisoning() {
        let session = InferenceSession::new(Box::new(Nearest::new(2)), 8);
        let empty = CanonicalTensor::new(Array4::zeros((1, 3, 0, 4))).unwrap();
        assert!(matches!(
            session.run(&empty),
            Err(Error::ShapeMismatch { .. })
        ));
        assert!(!session.is_poisoned());
        assert!(session.run(&gradient(2, 2)).is_ok());
    }

    #[test]
    fn bad_network_output_poisons_session() {
        let session = InferenceSession::new(Box::new(Broken), 1);
        let first = session.run(&gradient(4, 4)).unwrap_err();
        assert!(matches!(first, Error::ShapeMismatch { .. }));
        assert!(session.is_poisoned());

        match session.run(&gradient(4, 4)).unwrap_err() {
            Error::ModelPoisoned(reason) => assert_eq!(reason, first.to_string()),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

//! Public entry point: upscale an [`Image`] while keeping its pixel mode.

use std::sync::Arc;

use tracing::debug;

use crate::canonical::{from_canonical, to_canonical};
use crate::error::{Error, Result};
use crate::format;
use crate::image::Image;
use crate::model::ModelVariant;

/// Cheap to clone; clones share the same model variant.
#[derive(Debug, Clone)]
pub struct Upscaler {
    variant: Arc<ModelVariant>,
}

impl Upscaler {
    pub fn new(variant: ModelVariant) -> Self {
        Self {
            variant: Arc::new(variant),
        }
    }

    pub fn from_shared(variant: Arc<ModelVariant>) -> Self {
        Self { variant }
    }

    pub fn variant(&self) -> &ModelVariant {
        &self.variant
    }

    pub fn scale(&self) -> u32 {
        self.variant.scale()
    }

    /// Upscale `image` by the variant's scale, returning a new image of the
    /// same mode. Unsupported modes fail before any inference runs.
    pub fn upscale(&self, image: &Image) -> Result<Image> {
        let (w, h) = image.size();
        let mode = image.mode();

        format::lookup(mode.name())?.check()?;
        if w == 0 || h == 0 {
            return Err(Error::InvalidImage {
                mode: mode.name().to_string(),
                reason: format!("cannot upscale an empty {w}x{h} image"),
            });
        }

        let scale = self.scale();
        debug!(mode = %mode, w, h, scale, "Upscaling image");

        let tensor = to_canonical(image)?;
        let output = self.variant.session().run(&tensor)?;
        let target = (w * scale, h * scale);
        let result = from_canonical(&output, mode, target, image.palette())?;

        if result.size() != target || result.mode() != mode {
            return Err(Error::shape(
                "upscaled image",
                (target, mode.name()),
                (result.size(), result.mode().name()),
            ));
        }
        Ok(result)
    }
}

impl From<ModelVariant> for Upscaler {
    fn from(variant: ModelVariant) -> Self {
        Self::new(variant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelMode;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn upscaler_is_shareable_across_threads() {
        assert_send_sync::<Upscaler>();
    }

    #[test]
    fn clones_share_the_variant() {
        let upscaler = Upscaler::new(ModelVariant::dat_light(2, None).unwrap());
        let clone = upscaler.clone();
        assert!(std::ptr::eq(upscaler.variant(), clone.variant()));
    }

    #[test]
    fn empty_images_are_rejected() {
        let upscaler = Upscaler::new(ModelVariant::dat_light(2, None).unwrap());
        let err = upscaler
            .upscale(&Image::new(PixelMode::Rgb, (0, 5)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidImage { .. }));
        assert!(!upscaler.variant().session().is_poisoned());
    }

    #[test]
    fn unsupported_modes_fail_before_inference() {
        let upscaler = Upscaler::new(ModelVariant::dat_light(3, None).unwrap());
        let err = upscaler
            .upscale(&Image::new(PixelMode::Bgr16, (0, 0)))
            .unwrap_err();
        assert_eq!(err.to_string(), "conversion from BGR;16 to RGB not supported");
    }

    #[test]
    fn palette_images_keep_their_palette() {
        let palette = crate::image::Palette::new(vec![[0, 0, 0], [255, 0, 0], [0, 0, 255]]).unwrap();
        let img = Image::from_raw(PixelMode::Palette, (2, 1), vec![1, 2])
            .unwrap()
            .with_palette(palette.clone())
            .unwrap();
        let out = Upscaler::new(ModelVariant::dat_light(2, None).unwrap())
            .upscale(&img)
            .unwrap();
        assert_eq!(out.palette(), Some(&palette));
        assert_eq!(out.data(), &[1, 1, 2, 2, 1, 1, 2, 2]);
    }
}

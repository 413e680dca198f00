//! Pixel format registry: every known image mode, its storage layout and the
//! static rule describing how it reaches the canonical RGB representation.
//!
//! The tables here are plain `static` data. Nothing registers formats at
//! runtime; adding a mode means adding a [`PixelMode`] variant, a
//! [`PixelFormat`] row and a [`ConversionRule`] row.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelMode {
    /// `1`: bilevel, one byte per pixel holding 0 or 255.
    Bilevel,
    /// `L`
    Luma,
    /// `P`
    Palette,
    /// `RGB`
    Rgb,
    /// `RGBA`
    Rgba,
    /// `CMYK`
    Cmyk,
    /// `YCbCr`
    YCbCr,
    /// `LAB`
    Lab,
    /// `HSV`
    Hsv,
    /// `I`: 32-bit signed integer.
    Int32,
    /// `F`: 32-bit float.
    Float32,
    /// `LA`
    LumaAlpha,
    /// `PA`
    PaletteAlpha,
    /// `RGBX`
    Rgbx,
    /// `RGBa`: premultiplied alpha.
    RgbPremultiplied,
    /// `La`: premultiplied alpha.
    LumaPremultiplied,
    /// `I;16`
    Int16,
    /// `I;16L`
    Int16Little,
    /// `I;16B`
    Int16Big,
    /// `I;16N`
    Int16Native,
    /// `BGR;15`
    Bgr15,
    /// `BGR;16`
    Bgr16,
    /// `BGR;24`
    Bgr24,
}

impl PixelMode {
    pub const ALL: [PixelMode; 23] = [
        PixelMode::Bilevel,
        PixelMode::Luma,
        PixelMode::Palette,
        PixelMode::Rgb,
        PixelMode::Rgba,
        PixelMode::Cmyk,
        PixelMode::YCbCr,
        PixelMode::Lab,
        PixelMode::Hsv,
        PixelMode::Int32,
        PixelMode::Float32,
        PixelMode::LumaAlpha,
        PixelMode::PaletteAlpha,
        PixelMode::Rgbx,
        PixelMode::RgbPremultiplied,
        PixelMode::LumaPremultiplied,
        PixelMode::Int16,
        PixelMode::Int16Little,
        PixelMode::Int16Big,
        PixelMode::Int16Native,
        PixelMode::Bgr15,
        PixelMode::Bgr16,
        PixelMode::Bgr24,
    ];

    /// Parse an exact (case-sensitive) mode name such as `"RGB"` or `"I;16B"`.
    pub fn from_name(name: &str) -> Result<Self> {
        FORMATS
            .iter()
            .find(|format| format.name == name)
            .map(|format| format.mode)
            .ok_or_else(|| Error::UnknownFormat(name.to_string()))
    }

    pub fn name(self) -> &'static str {
        self.format().name
    }

    pub fn format(self) -> &'static PixelFormat {
        // FORMATS is ordered like PixelMode::ALL; the registry tests pin that.
        &FORMATS[self as usize]
    }

    pub fn rule(self) -> &'static ConversionRule {
        &RULES[self as usize].1
    }

    /// The mode a conversion falls back to when no direct conversion exists.
    pub fn base(self) -> PixelMode {
        use PixelMode::*;
        match self {
            Bilevel | Luma | LumaAlpha | LumaPremultiplied | Int32 | Float32 | Int16
            | Int16Little | Int16Big | Int16Native => Luma,
            Palette | PaletteAlpha | Rgb | Rgba | Rgbx | RgbPremultiplied | Cmyk | YCbCr | Lab
            | Hsv | Bgr15 | Bgr16 | Bgr24 => Rgb,
        }
    }

    pub fn is_supported(self) -> bool {
        matches!(self.rule(), ConversionRule::Supported { .. })
    }
}

impl fmt::Display for PixelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
    Native,
}

/// Storage description of a pixel mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub mode: PixelMode,
    pub name: &'static str,
    pub channels: u8,
    /// Bits of one stored pixel (`BGR;15` packs 15 bits into two bytes).
    pub bits_per_pixel: u8,
    pub bytes_per_pixel: usize,
    pub has_alpha: bool,
    pub premultiplied: bool,
    pub palette: bool,
    /// Multi-byte samples only.
    pub byte_order: Option<ByteOrder>,
    /// Channels stored blue-first.
    pub reversed: bool,
}

impl PixelFormat {
    const fn packed(mode: PixelMode, name: &'static str, channels: u8, bits: u8) -> Self {
        Self {
            mode,
            name,
            channels,
            bits_per_pixel: bits,
            bytes_per_pixel: (bits as usize).div_ceil(8),
            has_alpha: false,
            premultiplied: false,
            palette: false,
            byte_order: None,
            reversed: false,
        }
    }

    const fn alpha(mut self, premultiplied: bool) -> Self {
        self.has_alpha = true;
        self.premultiplied = premultiplied;
        self
    }

    const fn indexed(mut self) -> Self {
        self.palette = true;
        self
    }

    const fn order(mut self, order: ByteOrder) -> Self {
        self.byte_order = Some(order);
        self
    }

    const fn bgr(mut self) -> Self {
        self.reversed = true;
        self.byte_order = Some(ByteOrder::Little);
        self
    }
}

/// Registry entry for one mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionRule {
    /// The mode round-trips through RGB. The slices list intermediate modes
    /// visited before reaching RGB (`to_rgb`) or the mode itself (`from_rgb`).
    Supported {
        to_rgb: &'static [PixelMode],
        from_rgb: &'static [PixelMode],
    },
    /// The conversion step `from -> to` fails for this mode.
    Unsupported { from: PixelMode, to: PixelMode },
}

impl ConversionRule {
    /// `Ok` for supported rules, the precise conversion error otherwise.
    pub fn check(&self) -> Result<()> {
        match *self {
            ConversionRule::Supported { .. } => Ok(()),
            ConversionRule::Unsupported { from, to } => Err(Error::unsupported(from.name(), to.name())),
        }
    }
}

use PixelMode as M;

static FORMATS: [PixelFormat; 23] = [
    PixelFormat::packed(M::Bilevel, "1", 1, 8),
    PixelFormat::packed(M::Luma, "L", 1, 8),
    PixelFormat::packed(M::Palette, "P", 1, 8).indexed(),
    PixelFormat::packed(M::Rgb, "RGB", 3, 24),
    PixelFormat::packed(M::Rgba, "RGBA", 4, 32).alpha(false),
    PixelFormat::packed(M::Cmyk, "CMYK", 4, 32),
    PixelFormat::packed(M::YCbCr, "YCbCr", 3, 24),
    PixelFormat::packed(M::Lab, "LAB", 3, 24),
    PixelFormat::packed(M::Hsv, "HSV", 3, 24),
    PixelFormat::packed(M::Int32, "I", 1, 32).order(ByteOrder::Little),
    PixelFormat::packed(M::Float32, "F", 1, 32).order(ByteOrder::Little),
    PixelFormat::packed(M::LumaAlpha, "LA", 2, 16).alpha(false),
    PixelFormat::packed(M::PaletteAlpha, "PA", 2, 16)
        .alpha(false)
        .indexed(),
    PixelFormat::packed(M::Rgbx, "RGBX", 4, 32),
    PixelFormat::packed(M::RgbPremultiplied, "RGBa", 4, 32).alpha(true),
    PixelFormat::packed(M::LumaPremultiplied, "La", 2, 16).alpha(true),
    PixelFormat::packed(M::Int16, "I;16", 1, 16).order(ByteOrder::Little),
    PixelFormat::packed(M::Int16Little, "I;16L", 1, 16).order(ByteOrder::Little),
    PixelFormat::packed(M::Int16Big, "I;16B", 1, 16).order(ByteOrder::Big),
    PixelFormat::packed(M::Int16Native, "I;16N", 1, 16).order(ByteOrder::Native),
    PixelFormat::packed(M::Bgr15, "BGR;15", 3, 15).bgr(),
    PixelFormat::packed(M::Bgr16, "BGR;16", 3, 16).bgr(),
    PixelFormat::packed(M::Bgr24, "BGR;24", 3, 24).bgr(),
];

const DIRECT: ConversionRule = ConversionRule::Supported {
    to_rgb: &[],
    from_rgb: &[],
};

static RULES: [(PixelMode, ConversionRule); 23] = [
    (M::Bilevel, DIRECT),
    (M::Luma, DIRECT),
    (M::Palette, DIRECT),
    (M::Rgb, DIRECT),
    (M::Rgba, DIRECT),
    (M::Cmyk, DIRECT),
    (M::YCbCr, DIRECT),
    (M::Lab, DIRECT),
    (M::Hsv, DIRECT),
    (M::Int32, DIRECT),
    (
        M::Float32,
        ConversionRule::Supported {
            to_rgb: &[M::Luma],
            from_rgb: &[],
        },
    ),
    (M::LumaAlpha, DIRECT),
    (M::PaletteAlpha, DIRECT),
    (M::Rgbx, DIRECT),
    (M::RgbPremultiplied, DIRECT),
    (
        M::LumaPremultiplied,
        ConversionRule::Unsupported {
            from: M::LumaPremultiplied,
            to: M::Luma,
        },
    ),
    (
        M::Int16,
        ConversionRule::Unsupported {
            from: M::Rgb,
            to: M::Int16,
        },
    ),
    (
        M::Int16Little,
        ConversionRule::Unsupported {
            from: M::Rgb,
            to: M::Int16Little,
        },
    ),
    (
        M::Int16Big,
        ConversionRule::Unsupported {
            from: M::Rgb,
            to: M::Int16Big,
        },
    ),
    (
        M::Int16Native,
        ConversionRule::Unsupported {
            from: M::Rgb,
            to: M::Int16Native,
        },
    ),
    (
        M::Bgr15,
        ConversionRule::Unsupported {
            from: M::Bgr15,
            to: M::Rgb,
        },
    ),
    (
        M::Bgr16,
        ConversionRule::Unsupported {
            from: M::Bgr16,
            to: M::Rgb,
        },
    ),
    (
        M::Bgr24,
        ConversionRule::Unsupported {
            from: M::Bgr24,
            to: M::Rgb,
        },
    ),
];

/// Look up the conversion rule for a mode name.
pub fn lookup(mode_name: &str) -> Result<&'static ConversionRule> {
    PixelMode::from_name(mode_name).map(PixelMode::rule)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_are_ordered_like_modes() {
        for (index, mode) in PixelMode::ALL.iter().enumerate() {
            assert_eq!(*mode as usize, index);
            assert_eq!(FORMATS[index].mode, *mode);
            assert_eq!(RULES[index].0, *mode);
        }
    }

    #[test]
    fn every_mode_has_exactly_one_rule() {
        for mode in PixelMode::ALL {
            let count = RULES.iter().filter(|(m, _)| *m == mode).count();
            assert_eq!(count, 1, "{mode} has {count} rules");
        }
    }

    #[test]
    fn names_round_trip() {
        for mode in PixelMode::ALL {
            assert_eq!(PixelMode::from_name(mode.name()).unwrap(), mode);
            assert_eq!(mode.to_string().parse::<PixelMode>().unwrap(), mode);
        }
    }

    #[test]
    fn mode_names_are_case_sensitive() {
        assert_eq!(PixelMode::from_name("LA").unwrap(), PixelMode::LumaAlpha);
        assert_eq!(PixelMode::from_name("La").unwrap(), PixelMode::LumaPremultiplied);
        assert_eq!(
            PixelMode::from_name("RGBa").unwrap(),
            PixelMode::RgbPremultiplied
        );
        assert!(matches!(
            PixelMode::from_name("rgb"),
            Err(Error::UnknownFormat(name)) if name == "rgb"
        ));
    }

    #[test]
    fn lookup_unknown_mode_fails() {
        let err = lookup("XYZ").unwrap_err();
        assert_eq!(err, Error::UnknownFormat("XYZ".into()));
    }

    #[test]
    fn supported_and_unsupported_sets() {
        let supported: Vec<&str> = PixelMode::ALL
            .iter()
            .filter(|m| m.is_supported())
            .map(|m| m.name())
            .collect();
        assert_eq!(
            supported,
            [
                "1", "L", "P", "RGB", "RGBA", "CMYK", "YCbCr", "LAB", "HSV", "I", "F", "LA", "PA",
                "RGBX", "RGBa"
            ]
        );

        let unsupported: Vec<String> = PixelMode::ALL
            .iter()
            .filter_map(|m| m.rule().check().err())
            .map(|e| e.to_string())
            .collect();
        assert_eq!(
            unsupported,
            [
                "conversion from La to L not supported",
                "conversion from RGB to I;16 not supported",
                "conversion from RGB to I;16L not supported",
                "conversion from RGB to I;16B not supported",
                "conversion from RGB to I;16N not supported",
                "conversion from BGR;15 to RGB not supported",
                "conversion from BGR;16 to RGB not supported",
                "conversion from BGR;24 to RGB not supported",
            ]
        );
    }

    #[test]
    fn format_attributes() {
        let rgba = PixelMode::Rgba.format();
        assert_eq!(rgba.channels, 4);
        assert_eq!(rgba.bytes_per_pixel, 4);
        assert!(rgba.has_alpha && !rgba.premultiplied);

        let la = PixelMode::LumaPremultiplied.format();
        assert!(la.has_alpha && la.premultiplied);

        assert!(PixelMode::PaletteAlpha.format().palette);
        assert_eq!(PixelMode::Int16Big.format().byte_order, Some(ByteOrder::Big));
        assert_eq!(PixelMode::Bgr15.format().bytes_per_pixel, 2);
        assert_eq!(PixelMode::Bgr15.format().bits_per_pixel, 15);
        assert!(PixelMode::Bgr24.format().reversed);
        assert_eq!(PixelMode::Float32.format().bytes_per_pixel, 4);
    }

    #[test]
    fn float_reaches_rgb_through_luma() {
        assert_eq!(
            *PixelMode::Float32.rule(),
            ConversionRule::Supported {
                to_rgb: &[PixelMode::Luma],
                from_rgb: &[],
            }
        );
    }
}

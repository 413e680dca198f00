use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::{ModelVariant, SizeClass};
use crate::session::{TileOptions, DEFAULT_TILE_OVERLAP};
use crate::upscale::Upscaler;
use crate::weights::{SafetensorsFile, WeightSource};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpscaleConfig {
    pub model: ModelConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub size: SizeClass,
    pub scale: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    pub tile_size: usize,
    pub tile_overlap: usize,
    pub backend: BackendKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onnx_model: Option<PathBuf>,
    pub execution_provider: InferenceProvider,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Builtin,
    Onnx,
}

/// ONNX Runtime execution provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InferenceProvider {
    #[default]
    Cpu,
    Cuda,
    Tensorrt,
}

impl InferenceProvider {
    /// Parse from string (case-insensitive). Returns `Cpu` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" => Self::Cuda,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cpu,
        }
    }
}

impl std::fmt::Display for InferenceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            size: SizeClass::Light,
            scale: 2,
            weights: None,
            sha256: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tile_size: 0,
            tile_overlap: DEFAULT_TILE_OVERLAP,
            backend: BackendKind::Builtin,
            onnx_model: None,
            execution_provider: InferenceProvider::Cpu,
        }
    }
}

impl SessionConfig {
    pub fn tiles(&self) -> TileOptions {
        TileOptions {
            size: self.tile_size,
            overlap: self.tile_overlap,
        }
    }
}

impl UpscaleConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory: {}", parent.display())
            })?;
        }

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Construct the configured upscaler. Relative paths are resolved
    /// against `base_dir`, usually the directory holding the config file.
    pub fn build_upscaler(&self, base_dir: &Path) -> Result<Upscaler> {
        let model = &self.model;
        let variant = match self.session.backend {
            BackendKind::Builtin => {
                let weights = model.weights.as_ref().map(|path| {
                    let file = SafetensorsFile::new(resolve_relative_to(base_dir, path));
                    match &model.sha256 {
                        Some(digest) => file.with_sha256(digest.clone()),
                        None => file,
                    }
                });
                ModelVariant::new(
                    model.size,
                    model.scale,
                    weights.as_ref().map(|w| w as &dyn WeightSource),
                )
                .with_context(|| format!("failed to build {} x{} model", model.size, model.scale))?
            }
            BackendKind::Onnx => self.build_onnx_variant(base_dir)?,
        };

        let variant = variant
            .with_tiles(self.session.tiles())
            .context("invalid tiling options")?;
        Ok(Upscaler::new(variant))
    }

    #[cfg(feature = "onnx")]
    fn build_onnx_variant(&self, base_dir: &Path) -> Result<ModelVariant> {
        use crate::backend::OnnxNetwork;
        use crate::model::ModelSpec;

        let model_path = self
            .session
            .onnx_model
            .as_ref()
            .context("session.onnx_model is required when session.backend = \"onnx\"")?;
        let model_path = resolve_relative_to(base_dir, model_path);
        let spec = ModelSpec::new(self.model.size, self.model.scale)?;
        let network = OnnxNetwork::from_file(
            &model_path,
            spec.scale(),
            self.session.execution_provider,
        )?;
        ModelVariant::with_network(spec, Box::new(network))
            .with_context(|| format!("ONNX model {} does not match the configured scale", model_path.display()))
    }

    #[cfg(not(feature = "onnx"))]
    fn build_onnx_variant(&self, _base_dir: &Path) -> Result<ModelVariant> {
        anyhow::bail!("session.backend = \"onnx\" requires building with the `onnx` feature")
    }
}

/// Resolve a path relative to a base directory.
/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ParameterState;
    use crate::weights::encode_safetensors;
    use crate::model::ModelSpec;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = UpscaleConfig::default();
        assert_eq!(cfg.model.size, SizeClass::Light);
        assert_eq!(cfg.model.scale, 2);
        assert!(cfg.model.weights.is_none());
        assert_eq!(cfg.session.tile_size, 0);
        assert_eq!(cfg.session.tile_overlap, 16);
        assert_eq!(cfg.session.backend, BackendKind::Builtin);
        assert_eq!(cfg.session.execution_provider, InferenceProvider::Cpu);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = UpscaleConfig::default();
        original.model.size = SizeClass::Dat2;
        original.model.weights = Some(PathBuf::from("weights/DAT_2_x4.safetensors"));
        original.session.execution_provider = InferenceProvider::Tensorrt;
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: UpscaleConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: UpscaleConfig = toml::from_str(
            r#"
            [model]
            size = "dat_s"
            scale = 3

            [session]
            tile_size = 128
            "#,
        )
        .unwrap();
        assert_eq!(cfg.model.size, SizeClass::Small);
        assert_eq!(cfg.model.scale, 3);
        assert_eq!(cfg.session.tiles(), TileOptions { size: 128, overlap: 16 });
    }

    #[test]
    fn load_missing_or_empty_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("datscale.toml");
        assert_eq!(UpscaleConfig::load_from_path(&path).unwrap(), UpscaleConfig::default());

        fs::write(&path, "  \n").unwrap();
        assert_eq!(UpscaleConfig::load_from_path(&path).unwrap(), UpscaleConfig::default());
    }

    #[test]
    fn load_reports_bad_toml_with_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("datscale.toml");
        fs::write(&path, "[model]\nsize = \"dat_xl\"\n").unwrap();
        let err = UpscaleConfig::load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config TOML"));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("datscale.toml");
        let mut cfg = UpscaleConfig::default();
        cfg.model.scale = 4;
        cfg.save_to_path(&path).unwrap();
        assert_eq!(UpscaleConfig::load_from_path(&path).unwrap(), cfg);
    }

    #[test]
    fn provider_parsing_is_lossy() {
        assert_eq!(InferenceProvider::from_str_lossy("TRT"), InferenceProvider::Tensorrt);
        assert_eq!(InferenceProvider::from_str_lossy("cuda"), InferenceProvider::Cuda);
        assert_eq!(InferenceProvider::from_str_lossy("npu"), InferenceProvider::Cpu);
        assert_eq!(InferenceProvider::Tensorrt.to_string(), "tensorrt");
    }

    #[test]
    fn build_default_upscaler() {
        let dir = tempdir().unwrap();
        let upscaler = UpscaleConfig::default().build_upscaler(dir.path()).unwrap();
        assert_eq!(upscaler.scale(), 2);
    }

    #[test]
    fn build_resolves_weights_against_base_dir() {
        let dir = tempdir().unwrap();
        let spec = ModelSpec::new(SizeClass::Small, 2).unwrap();
        let state = ParameterState::zeros(&spec.parameter_contract());
        fs::create_dir_all(dir.path().join("weights")).unwrap();
        fs::write(
            dir.path().join("weights/DAT_S_x2.safetensors"),
            encode_safetensors(&state),
        )
        .unwrap();

        let mut cfg = UpscaleConfig::default();
        cfg.model.size = SizeClass::Small;
        cfg.model.weights = Some(PathBuf::from("weights/DAT_S_x2.safetensors"));
        let upscaler = cfg.build_upscaler(dir.path()).unwrap();
        assert_eq!(upscaler.variant().size_class(), SizeClass::Small);
    }

    #[test]
    fn build_fails_for_full_class_without_weights() {
        let dir = tempdir().unwrap();
        let mut cfg = UpscaleConfig::default();
        cfg.model.size = SizeClass::Base;
        let err = cfg.build_upscaler(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("requires a weight checkpoint"));
    }

    #[test]
    fn build_rejects_bad_tiling() {
        let dir = tempdir().unwrap();
        let mut cfg = UpscaleConfig::default();
        cfg.session.tile_size = 20;
        assert!(cfg.build_upscaler(dir.path()).is_err());
    }

    #[test]
    fn resolve_relative_to_joins_relative_path() {
        let result = resolve_relative_to(Path::new("/base"), Path::new("sub"));
        assert_eq!(result, PathBuf::from("/base/sub"));
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs")),
            PathBuf::from("/abs")
        );
    }
}

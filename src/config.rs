//! Configuration structures and closed vocabularies for pyramid-flow.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hub repositories the loader knows how to orchestrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelId {
    #[serde(rename = "rain1011/pyramid-flow-sd3")]
    PyramidFlowSd3,
    #[serde(rename = "rain1011/pyramid-flow-miniflux")]
    PyramidFlowMiniFlux,
}

impl ModelId {
    pub const ALL: [ModelId; 2] = [ModelId::PyramidFlowSd3, ModelId::PyramidFlowMiniFlux];

    pub fn repo_id(&self) -> &'static str {
        match self {
            ModelId::PyramidFlowSd3 => "rain1011/pyramid-flow-sd3",
            ModelId::PyramidFlowMiniFlux => "rain1011/pyramid-flow-miniflux",
        }
    }

    /// Last path component of the repo id, used as the local directory name.
    pub fn dir_name(&self) -> &'static str {
        self.repo_id().rsplit('/').next().unwrap_or(self.repo_id())
    }

    pub fn architecture(&self) -> Architecture {
        if self.repo_id().contains("flux") {
            Architecture::PyramidFlux
        } else {
            Architecture::PyramidMmDit
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.repo_id())
    }
}

impl FromStr for ModelId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelId::ALL
            .into_iter()
            .find(|m| m.repo_id() == s.trim())
            .ok_or_else(|| ConfigError::UnknownModel(s.to_string()))
    }
}

/// Resolution-specific transformer checkpoint inside a model repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionVariant {
    #[serde(rename = "diffusion_transformer_384p")]
    P384,
    #[serde(rename = "diffusion_transformer_768p")]
    P768,
}

impl ResolutionVariant {
    pub const ALL: [ResolutionVariant; 2] = [ResolutionVariant::P384, ResolutionVariant::P768];

    pub fn dir_name(&self) -> &'static str {
        match self {
            ResolutionVariant::P384 => "diffusion_transformer_384p",
            ResolutionVariant::P768 => "diffusion_transformer_768p",
        }
    }

    /// The variant whose files are skipped when downloading this one.
    pub fn other(&self) -> ResolutionVariant {
        match self {
            ResolutionVariant::P384 => ResolutionVariant::P768,
            ResolutionVariant::P768 => ResolutionVariant::P384,
        }
    }
}

impl fmt::Display for ResolutionVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for ResolutionVariant {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResolutionVariant::ALL
            .into_iter()
            .find(|v| v.dir_name() == s.trim())
            .ok_or_else(|| ConfigError::UnknownVariant(s.to_string()))
    }
}

/// Network family. Both share the sampling contract and differ internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    PyramidMmDit,
    PyramidFlux,
}

impl Architecture {
    pub fn name(&self) -> &'static str {
        match self {
            Architecture::PyramidMmDit => "pyramid_mmdit",
            Architecture::PyramidFlux => "pyramid_flux",
        }
    }

    /// Width of the pooled prompt embedding the network expects.
    ///
    /// MMDiT concatenates two CLIP towers (768 + 1280), Flux uses CLIP-L only.
    pub fn pooled_dim(&self) -> usize {
        match self {
            Architecture::PyramidMmDit => 2048,
            Architecture::PyramidFlux => 768,
        }
    }

    /// Width of the per-token prompt embedding (T5-XXL).
    pub fn embed_dim(&self) -> usize {
        4096
    }
}

/// Fixed constants of the pyramidal flow-matching sampler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Number of training timesteps (1000)
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,
    /// Fixed sigma shift (1.0 = identity)
    #[serde(default = "default_shift")]
    pub shift: f64,
    /// Stage boundaries as fractions of the training schedule, `stages + 1` entries
    pub stage_range: Vec<f64>,
    /// Block-noise correlation used when renoising at stage transitions
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    /// Latent frames produced per autoregressive time unit
    #[serde(default = "default_frames_per_unit")]
    pub frames_per_unit: usize,
    /// Latent channels of the VAE
    pub latent_channels: usize,
    /// Spatial compression of the VAE
    pub vae_spatial_ratio: usize,
}

fn default_num_train_timesteps() -> usize {
    1000
}

fn default_shift() -> f64 {
    1.0
}

fn default_gamma() -> f64 {
    1.0 / 3.0
}

fn default_frames_per_unit() -> usize {
    1
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            shift: 1.0,
            stage_range: vec![0.0, 1.0 / 3.0, 2.0 / 3.0, 1.0],
            gamma: 1.0 / 3.0,
            frames_per_unit: 1,
            latent_channels: 16,
            vae_spatial_ratio: 8,
        }
    }
}

impl SamplerConfig {
    pub fn num_stages(&self) -> usize {
        self.stage_range.len().saturating_sub(1)
    }

    /// Pixel dimensions must divide by the VAE ratio times every pyramid halving.
    pub fn dimension_multiple(&self) -> usize {
        self.vae_spatial_ratio << self.num_stages().saturating_sub(1)
    }
}

/// Output video geometry, validated on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoGeometry {
    pub width: usize,
    pub height: usize,
    /// Number of latent frames (time units) to produce
    pub temp: usize,
}

pub const MIN_DIMENSION: usize = 128;
pub const MAX_DIMENSION: usize = 2048;

impl VideoGeometry {
    pub fn new(
        width: usize,
        height: usize,
        temp: usize,
        config: &SamplerConfig,
    ) -> Result<Self, ConfigError> {
        let multiple = config.dimension_multiple();
        for (name, value) in [("width", width), ("height", height)] {
            check_range(name, value as f64, MIN_DIMENSION as f64, MAX_DIMENSION as f64)?;
            if !value.is_multiple_of(multiple) {
                return Err(ConfigError::InvalidDimensions {
                    width,
                    height,
                    multiple,
                });
            }
        }
        if temp == 0 {
            return Err(ConfigError::OutOfRange {
                name: "temp",
                value: 0.0,
                min: 1.0,
                max: f64::INFINITY,
            });
        }
        Ok(Self {
            width,
            height,
            temp,
        })
    }

    /// Full-resolution latent height and width.
    pub fn latent_hw(&self, config: &SamplerConfig) -> (usize, usize) {
        (
            self.height / config.vae_spatial_ratio,
            self.width / config.vae_spatial_ratio,
        )
    }
}

/// VAE decode tiling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeSettings {
    pub tile_size: usize,
    pub window_size: usize,
}

impl Default for DecodeSettings {
    fn default() -> Self {
        Self {
            tile_size: 256,
            window_size: 2,
        }
    }
}

impl DecodeSettings {
    pub fn new(tile_size: usize, window_size: usize) -> Result<Self, ConfigError> {
        check_range("tile_size", tile_size as f64, 64.0, 512.0)?;
        check_range("window_size", window_size as f64, 1.0, 4.0)?;
        Ok(Self {
            tile_size,
            window_size,
        })
    }
}

pub const MAX_GUIDANCE_SCALE: f64 = 30.0;

/// Reject `value` outside `[min, max]` (NaN included).
pub fn check_range(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_nan() || value < min || value > max {
        return Err(ConfigError::OutOfRange {
            name,
            value,
            min,
            max,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown model id: {0}")]
    UnknownModel(String),
    #[error("Unknown resolution variant: {0}")]
    UnknownVariant(String),
    #[error("Unknown precision tag: {0}")]
    UnknownPrecision(String),
    #[error("Precision {tag} is not supported for the {component}")]
    PrecisionNotAllowed {
        component: &'static str,
        tag: String,
    },
    #[error("Invalid dimensions: width={width}, height={height}. Must be multiple of {multiple}")]
    InvalidDimensions {
        width: usize,
        height: usize,
        multiple: usize,
    },
    #[error("{name}={value} is outside [{min}, {max}]")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

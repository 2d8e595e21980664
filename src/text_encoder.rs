//! Prompt encoding: sequence embeddings from T5, pooled embeddings from CLIP.
//!
//! The MMDiT checkpoints carry two CLIP towers (ViT-L and bigG, projected
//! and concatenated to 2048) and the Flux checkpoints one (ViT-L, 768). Both
//! use a T5 v1.1 XXL encoder for the 4096-wide token sequence.
//!
//! Tokenizer limits are passed per call through [`EncodeOptions`].

use crate::conditioning::PromptEmbeds;
use crate::device::Placeable;
use crate::loader::{LoaderError, ModelLayout, TowerDirs, TowerKind, load_model_config, mmap_var_builder, resolve_weight_files};
use crate::provision::{ProvisionError, tokenizer_file};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{Linear, linear_no_bias};
use candle_transformers::models::stable_diffusion::clip;
use candle_transformers::models::t5;
use tokenizers::Tokenizer;
use tracing::{debug, info};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TextEncoderError {
    #[error("Failed to load weights or config: {0}")]
    ConfigLoad(#[from] LoaderError),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Tokenizer unavailable: {0}")]
    Provisioning(#[from] ProvisionError),

    #[error("pooled embedding is {found} wide, expected {expected}")]
    PooledWidth { expected: usize, found: usize },

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

// =============================================================================
// Tokenizer options
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenizerOptions {
    pub max_length: usize,
    pub pad_to_max: bool,
    pub truncation: bool,
}

impl TokenizerOptions {
    pub fn t5() -> Self {
        Self {
            max_length: 128,
            pad_to_max: true,
            truncation: true,
        }
    }

    pub fn clip() -> Self {
        Self {
            max_length: 77,
            pad_to_max: true,
            truncation: true,
        }
    }
}

/// Per-call tokenizer configuration for both tower families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    pub t5: TokenizerOptions,
    pub clip: TokenizerOptions,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            t5: TokenizerOptions::t5(),
            clip: TokenizerOptions::clip(),
        }
    }
}

/// Fixed-length token ids and the matching attention mask.
///
/// Truncation keeps the final token so the end-of-sequence marker survives.
pub fn pad_and_truncate(ids: &[u32], options: &TokenizerOptions, pad_id: u32) -> (Vec<u32>, Vec<u32>) {
    let max = options.max_length;
    let mut out: Vec<u32> = if options.truncation && ids.len() > max && max > 0 {
        let mut kept = ids[..max - 1].to_vec();
        kept.push(ids[ids.len() - 1]);
        kept
    } else {
        ids.to_vec()
    };
    let mut mask = vec![1u32; out.len()];
    if options.pad_to_max && out.len() < max {
        let pad = max - out.len();
        out.extend(std::iter::repeat_n(pad_id, pad));
        mask.extend(std::iter::repeat_n(0, pad));
    }
    (out, mask)
}

// =============================================================================
// Collaborator trait
// =============================================================================

/// The text encoder as seen by `encode_text`.
pub trait PromptEncoder: Placeable {
    /// Encode one prompt into a single-sequence [`PromptEmbeds`].
    fn encode(&mut self, text: &str, options: &EncodeOptions) -> crate::Result<PromptEmbeds>;
}

// =============================================================================
// CLIP + T5 implementation
// =============================================================================

struct TowerTokenizer {
    tokenizer: Tokenizer,
    pad_id: u32,
    eos_id: u32,
}

impl TowerTokenizer {
    fn load(tower: &TowerDirs) -> Result<Self, TextEncoderError> {
        let (fallback, pad, eos) = match tower.kind {
            TowerKind::ClipL => ("openai/clip-vit-large-patch14", "<|endoftext|>", "<|endoftext|>"),
            TowerKind::ClipG => ("laion/CLIP-ViT-bigG-14-laion2B-39B-b160k", "!", "<|endoftext|>"),
            TowerKind::T5Xxl => ("google/t5-v1_1-xxl", "<pad>", "</s>"),
        };
        let path = tokenizer_file(&tower.tokenizer, fallback)?;
        let tokenizer = Tokenizer::from_file(&path).map_err(|e| TextEncoderError::Tokenizer(e.to_string()))?;
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| TextEncoderError::Tokenizer(format!("{} has no {token} token", path.display())))
        };
        let pad_id = id(pad)?;
        let eos_id = id(eos)?;
        Ok(Self {
            tokenizer,
            pad_id,
            eos_id,
        })
    }

    /// `[1, max_length]` ids, the mask row and the end-of-text position.
    fn tokenize(
        &self,
        text: &str,
        options: &TokenizerOptions,
        device: &Device,
    ) -> Result<(Tensor, Vec<u32>, usize), TextEncoderError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| TextEncoderError::Tokenizer(e.to_string()))?;
        let (ids, mask) = pad_and_truncate(encoding.get_ids(), options, self.pad_id);
        let eos = ids
            .iter()
            .position(|&id| id == self.eos_id)
            .unwrap_or(ids.len().saturating_sub(1));
        let tensor = Tensor::new(ids.as_slice(), device)?.unsqueeze(0)?;
        Ok((tensor, mask, eos))
    }
}

struct ClipTower {
    kind: TowerKind,
    model: clip::ClipTextTransformer,
    projection: Option<Linear>,
}

impl ClipTower {
    /// Transformer config plus hidden and projection widths.
    fn config(kind: TowerKind) -> (clip::Config, usize, usize) {
        match kind {
            TowerKind::ClipG => (clip::Config::sdxl2(), 1280, 1280),
            _ => (clip::Config::v1_5(), 768, 768),
        }
    }

    fn load(dirs: &TowerDirs, dtype: DType, device: &Device) -> Result<Self, TextEncoderError> {
        let files = resolve_weight_files(&dirs.weights)?;
        let vb = mmap_var_builder(&files, dtype, device)?;
        let (config, hidden, projected) = Self::config(dirs.kind);
        let model = clip::ClipTextTransformer::new(vb.clone(), &config)?;
        let projection = if vb.contains_tensor("text_projection.weight") {
            Some(linear_no_bias(hidden, projected, vb.pp("text_projection"))?)
        } else {
            None
        };
        Ok(Self {
            kind: dirs.kind,
            model,
            projection,
        })
    }

    /// Hidden state at the end-of-text token, projected when the tower has a projection.
    fn pooled(&self, ids: &Tensor, eos: usize) -> candle_core::Result<Tensor> {
        let hidden = self.model.forward(ids)?;
        let pooled = hidden.i((.., eos, ..))?;
        match &self.projection {
            Some(projection) => projection.forward(&pooled),
            None => Ok(pooled),
        }
    }
}

struct Towers {
    clips: Vec<ClipTower>,
    t5: t5::T5EncoderModel,
}

/// Text encoder over the checkpoint's CLIP tower(s) and T5 encoder.
///
/// Placing the encoder rebuilds the towers from the memory-mapped weights on
/// the target device; tokenizers live on the host and are loaded once.
pub struct ClipT5TextEncoder {
    clip_dirs: Vec<TowerDirs>,
    t5_dirs: TowerDirs,
    t5_config: t5::Config,
    clip_tokenizers: Vec<TowerTokenizer>,
    t5_tokenizer: TowerTokenizer,
    pooled_dim: usize,
    dtype: DType,
    device: Device,
    towers: Towers,
}

impl ClipT5TextEncoder {
    pub fn load(layout: &ModelLayout, dtype: DType, device: &Device) -> Result<Self, TextEncoderError> {
        info!(
            architecture = layout.architecture.name(),
            clip_towers = layout.clip_towers.len(),
            ?dtype,
            "loading text encoder"
        );
        let t5_config: t5::Config = load_model_config(layout.t5.weights.join("config.json"))?;
        let clip_tokenizers = layout
            .clip_towers
            .iter()
            .map(TowerTokenizer::load)
            .collect::<Result<Vec<_>, _>>()?;
        let t5_tokenizer = TowerTokenizer::load(&layout.t5)?;
        let towers = Self::build_towers(&layout.clip_towers, &layout.t5, &t5_config, dtype, device)?;
        Ok(Self {
            clip_dirs: layout.clip_towers.clone(),
            t5_dirs: layout.t5.clone(),
            t5_config,
            clip_tokenizers,
            t5_tokenizer,
            pooled_dim: layout.architecture.pooled_dim(),
            dtype,
            device: device.clone(),
            towers,
        })
    }

    fn build_towers(
        clip_dirs: &[TowerDirs],
        t5_dirs: &TowerDirs,
        t5_config: &t5::Config,
        dtype: DType,
        device: &Device,
    ) -> Result<Towers, TextEncoderError> {
        let clips = clip_dirs
            .iter()
            .map(|dirs| ClipTower::load(dirs, dtype, device))
            .collect::<Result<Vec<_>, _>>()?;
        let files = resolve_weight_files(&t5_dirs.weights)?;
        let vb = mmap_var_builder(&files, dtype, device)?;
        let t5 = t5::T5EncoderModel::load(vb, t5_config)?;
        Ok(Towers { clips, t5 })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// `(embeds, attention_mask, pooled)` for one prompt.
    fn encode_inner(&mut self, text: &str, options: &EncodeOptions) -> Result<(Tensor, Tensor, Tensor), TextEncoderError> {
        let device = self.device.clone();

        let (t5_ids, t5_mask, _) = self.t5_tokenizer.tokenize(text, &options.t5, &device)?;
        let embeds = self.towers.t5.forward(&t5_ids)?.to_dtype(DType::F32)?;
        let mask_len = t5_mask.len();
        let attention_mask = Tensor::from_vec(t5_mask, (1, mask_len), &device)?;

        let mut pooled = Vec::with_capacity(self.towers.clips.len());
        for (tower, tokenizer) in self.towers.clips.iter().zip(&self.clip_tokenizers) {
            let (ids, _, eos) = tokenizer.tokenize(text, &options.clip, &device)?;
            debug!(tower = ?tower.kind, eos, "clip pooled output");
            pooled.push(tower.pooled(&ids, eos)?.to_dtype(DType::F32)?);
        }
        let pooled = Tensor::cat(&pooled, 1)?;
        let found = pooled.dim(1)?;
        if found != self.pooled_dim {
            return Err(TextEncoderError::PooledWidth {
                expected: self.pooled_dim,
                found,
            });
        }

        Ok((embeds, attention_mask, pooled))
    }
}

impl Placeable for ClipT5TextEncoder {
    fn place(&mut self, device: &Device) -> candle_core::Result<()> {
        if self.device.same_device(device) {
            return Ok(());
        }
        let towers = Self::build_towers(&self.clip_dirs, &self.t5_dirs, &self.t5_config, self.dtype, device)
            .map_err(candle_core::Error::wrap)?;
        self.towers = towers;
        self.device = device.clone();
        Ok(())
    }
}

impl PromptEncoder for ClipT5TextEncoder {
    fn encode(&mut self, text: &str, options: &EncodeOptions) -> crate::Result<PromptEmbeds> {
        let (embeds, attention_mask, pooled) = self.encode_inner(text, options)?;
        PromptEmbeds::new(embeds, attention_mask, pooled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_to_max_length() {
        let opts = TokenizerOptions {
            max_length: 6,
            pad_to_max: true,
            truncation: true,
        };
        let (ids, mask) = pad_and_truncate(&[5, 6, 1], &opts, 0);
        assert_eq!(ids, vec![5, 6, 1, 0, 0, 0]);
        assert_eq!(mask, vec![1, 1, 1, 0, 0, 0]);
    }

    #[test]
    fn test_truncation_keeps_end_token() {
        let opts = TokenizerOptions {
            max_length: 4,
            pad_to_max: true,
            truncation: true,
        };
        let (ids, mask) = pad_and_truncate(&[49406, 10, 11, 12, 13, 49407], &opts, 49407);
        assert_eq!(ids, vec![49406, 10, 11, 49407]);
        assert_eq!(mask, vec![1; 4]);
    }

    #[test]
    fn test_options_are_independent_values() {
        let defaults = EncodeOptions::default();
        assert_eq!(defaults.t5.max_length, 128);
        assert_eq!(defaults.clip.max_length, 77);

        let mut custom = EncodeOptions::default();
        custom.t5.max_length = 226;
        assert_eq!(EncodeOptions::default().t5.max_length, 128);

        let (ids, _) = pad_and_truncate(&[1; 300], &custom.t5, 0);
        assert_eq!(ids.len(), 226);
        let unpadded = TokenizerOptions {
            pad_to_max: false,
            truncation: false,
            ..TokenizerOptions::t5()
        };
        let (ids, mask) = pad_and_truncate(&[1, 2], &unpadded, 0);
        assert_eq!((ids.len(), mask.len()), (2, 2));
    }
}

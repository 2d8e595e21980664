//! Deterministic stand-ins for the network, text encoder and VAE.
//!
//! They honour the shapes and calling conventions of the real submodules so
//! the orchestration can be run end to end without checkpoints. Every output
//! is a pure function of the inputs.

use crate::conditioning::{ConditioningBundle, PromptEmbeds, TextBatch};
use crate::config::Architecture;
use crate::denoiser::VelocityModel;
use crate::device::Placeable;
use crate::loader::ModelLayout;
use crate::model::ComponentFactory;
use crate::noise::Pcg32;
use crate::precision::ComputePrecision;
use crate::pyramid::{downsample, upsample_nearest};
use crate::text_encoder::{EncodeOptions, PromptEncoder};
use crate::vae::{DecodeOptions, VideoAutoencoder};
use candle_core::{DType, Device, Result, Tensor};

/// FNV-1a, for seeding per-prompt streams.
fn fnv1a(text: &str) -> u64 {
    text.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ b as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

// =========================================================================
// Network
// =========================================================================

/// Velocity `-0.5 * x + c` where `c` depends on the prompt row, the timestep
/// and the mean of each history latent.
pub struct MockVelocityModel {
    dtype: DType,
    device: Device,
    calls: usize,
    fail_after: Option<(usize, String)>,
}

impl MockVelocityModel {
    pub fn new(dtype: DType) -> Self {
        Self {
            dtype,
            device: Device::Cpu,
            calls: 0,
            fail_after: None,
        }
    }

    /// Fail every forward pass after `calls` successful ones with `message`.
    pub fn fail_after(mut self, calls: usize, message: impl Into<String>) -> Self {
        self.fail_after = Some((calls, message.into()));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl Placeable for MockVelocityModel {
    fn place(&mut self, device: &Device) -> Result<()> {
        self.device = device.clone();
        Ok(())
    }
}

impl VelocityModel for MockVelocityModel {
    fn forward(&mut self, samples: &[Tensor], timestep: &Tensor, text: &TextBatch) -> Result<Tensor> {
        if let Some((limit, message)) = &self.fail_after
            && self.calls >= *limit
        {
            candle_core::bail!("{message}");
        }
        self.calls += 1;

        let Some((current, history)) = samples.split_last() else {
            candle_core::bail!("mock network needs at least the current latent")
        };
        let b = current.dim(0)?;
        let per_row = |x: &Tensor| -> Result<Tensor> {
            x.to_dtype(DType::F32)?.flatten_from(1)?.mean(1)?.reshape((b, 1, 1, 1, 1))
        };

        let mut offset = per_row(&text.pooled)?.affine(0.1, 0.0)?;
        offset = (offset + timestep.to_dtype(DType::F32)?.reshape((b, 1, 1, 1, 1))?.affine(5e-5, 0.0)?)?;
        for h in history {
            offset = (offset + per_row(h)?.affine(0.05, 0.0)?)?;
        }
        let x = current.to_dtype(DType::F32)?;
        x.affine(-0.5, 0.0)?
            .broadcast_add(&offset)?
            .to_dtype(current.dtype())
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}

// =========================================================================
// Text encoder
// =========================================================================

/// Hash-seeded embeddings with the real encoder's shapes.
pub struct MockTextEncoder {
    embed_dim: usize,
    pooled_dim: usize,
    device: Device,
}

impl MockTextEncoder {
    pub fn new(architecture: Architecture) -> Self {
        Self::with_dims(architecture.embed_dim(), architecture.pooled_dim())
    }

    pub fn with_dims(embed_dim: usize, pooled_dim: usize) -> Self {
        Self {
            embed_dim,
            pooled_dim,
            device: Device::Cpu,
        }
    }

    /// `(embeds, mask, pooled)` for one prompt, on the encoder's device.
    fn tensors(&self, text: &str, options: &EncodeOptions) -> Result<(Tensor, Tensor, Tensor)> {
        let tokens = options.t5.max_length;
        let mut rng = Pcg32::new(fnv1a(text), 0x5eed);
        let embeds = Tensor::from_vec(rng.gaussians(tokens * self.embed_dim), (1, tokens, self.embed_dim), &self.device)?;
        let pooled = Tensor::from_vec(rng.gaussians(self.pooled_dim), (1, self.pooled_dim), &self.device)?;
        // one token per word plus end of sequence
        let used = (text.split_whitespace().count() + 1).min(tokens);
        let mask: Vec<u32> = (0..tokens).map(|i| u32::from(i < used)).collect();
        let mask = Tensor::from_vec(mask, (1, tokens), &self.device)?;
        Ok((embeds, mask, pooled))
    }
}

impl Placeable for MockTextEncoder {
    fn place(&mut self, device: &Device) -> Result<()> {
        self.device = device.clone();
        Ok(())
    }
}

impl PromptEncoder for MockTextEncoder {
    fn encode(&mut self, text: &str, options: &EncodeOptions) -> crate::Result<PromptEmbeds> {
        let (embeds, mask, pooled) = self.tensors(text, options)?;
        PromptEmbeds::new(embeds, mask, pooled)
    }
}

/// Bundle of `segments` prompt segments from [`MockTextEncoder`] with small dims.
pub fn mock_bundle(device: &Device, segments: usize) -> crate::Result<ConditioningBundle> {
    let mut encoder = MockTextEncoder::with_dims(32, 16);
    encoder.place(device)?;
    let mut options = EncodeOptions::default();
    options.t5.max_length = 8;

    let mut bundle: Option<ConditioningBundle> = None;
    for i in 0..segments.max(1) {
        let next = ConditioningBundle::new(
            encoder.encode(&format!("mock prompt {i}"), &options)?,
            encoder.encode("", &options)?,
        )?;
        bundle = Some(match bundle {
            Some(prev) => ConditioningBundle::extend(&prev, &next)?,
            None => next,
        });
    }
    bundle.ok_or_else(|| crate::PyramidError::Candle(candle_core::Error::Msg("no segments".into())))
}

// =========================================================================
// VAE
// =========================================================================

/// Average-pool encoder and nearest-upsample decoder with 8x spatial ratio.
///
/// Time is not compressed: `t` latent frames decode to `t` frames.
pub struct MockAutoencoder {
    dtype: DType,
    latent_channels: usize,
    device: Device,
}

impl MockAutoencoder {
    pub fn new(dtype: DType, latent_channels: usize) -> Self {
        Self {
            dtype,
            latent_channels,
            device: Device::Cpu,
        }
    }
}

impl Placeable for MockAutoencoder {
    fn place(&mut self, device: &Device) -> Result<()> {
        self.device = device.clone();
        Ok(())
    }
}

impl VideoAutoencoder for MockAutoencoder {
    fn encode(&mut self, pixels: &Tensor) -> Result<Tensor> {
        let mut x = pixels.to_dtype(DType::F32)?;
        for _ in 0..3 {
            x = downsample(&x)?;
        }
        let c = x.dim(1)?;
        let copies = self.latent_channels.div_ceil(c);
        Tensor::cat(&vec![&x; copies], 1)?
            .narrow(1, 0, self.latent_channels)?
            .to_dtype(self.dtype)
    }

    fn decode(&mut self, latent: &Tensor, options: &DecodeOptions) -> Result<Tensor> {
        if options.window_size == 0 {
            candle_core::bail!("window size must be at least 1");
        }
        let mut x = latent.to_dtype(DType::F32)?.narrow(1, 0, 3)?.tanh()?;
        for _ in 0..3 {
            x = upsample_nearest(&x)?;
        }
        x.to_dtype(self.dtype)
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}

// =========================================================================
// Factory
// =========================================================================

/// Builds the three stand-ins; needs no files on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockFactory {
    /// Fail network forward passes after this many calls
    pub network_fail_after: Option<usize>,
}

impl ComponentFactory for MockFactory {
    fn needs_checkpoint(&self) -> bool {
        false
    }

    fn network(
        &self,
        _layout: &ModelLayout,
        precision: &ComputePrecision,
        _fast_mode: bool,
        device: &Device,
    ) -> crate::Result<Box<dyn VelocityModel>> {
        let mut model = MockVelocityModel::new(precision.compute);
        if let Some(limit) = self.network_fail_after {
            model = model.fail_after(limit, "CUDA_ERROR_OUT_OF_MEMORY: out of memory");
        }
        model.place(device)?;
        Ok(Box::new(model))
    }

    fn text_encoder(
        &self,
        layout: &ModelLayout,
        _precision: &ComputePrecision,
        device: &Device,
    ) -> crate::Result<Box<dyn PromptEncoder>> {
        let mut encoder = MockTextEncoder::new(layout.architecture);
        encoder.place(device)?;
        Ok(Box::new(encoder))
    }

    fn autoencoder(
        &self,
        _layout: &ModelLayout,
        precision: &ComputePrecision,
        device: &Device,
    ) -> crate::Result<Box<dyn VideoAutoencoder>> {
        let mut vae = MockAutoencoder::new(precision.compute, 16);
        vae.place(device)?;
        Ok(Box::new(vae))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_encoder_is_deterministic() -> crate::Result<()> {
        let mut encoder = MockTextEncoder::new(Architecture::PyramidFlux);
        let options = EncodeOptions::default();
        let a = encoder.encode("a cat", &options)?;
        let b = encoder.encode("a cat", &options)?;
        let c = encoder.encode("a dog", &options)?;
        assert_eq!(a.embeds.dims(), &[1, 128, 4096]);
        assert_eq!(a.pooled.dims(), &[1, 768]);
        let pa = a.pooled.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(pa, b.pooled.flatten_all()?.to_vec1::<f32>()?);
        assert_ne!(pa, c.pooled.flatten_all()?.to_vec1::<f32>()?);
        let mask = a.attention_mask.flatten_all()?.to_vec1::<u32>()?;
        assert_eq!(mask.iter().sum::<u32>(), 3);
        Ok(())
    }

    #[test]
    fn test_autoencoder_shapes() -> Result<()> {
        let device = Device::Cpu;
        let mut vae = MockAutoencoder::new(DType::F32, 16);
        let pixels = Tensor::rand(-1f32, 1.0, (1, 3, 1, 64, 128), &device)?;
        let latent = vae.encode(&pixels)?;
        assert_eq!(latent.dims(), &[1, 16, 1, 8, 16]);

        let options = DecodeOptions {
            temporal_chunk: true,
            window_size: 2,
            tile_size: 256,
        };
        let video = vae.decode(&Tensor::randn(0f32, 3.0, (1, 16, 4, 8, 16), &device)?, &options)?;
        assert_eq!(video.dims(), &[1, 3, 4, 64, 128]);
        let max = video.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(max <= 1.0);
        Ok(())
    }

    #[test]
    fn test_velocity_model_failure_injection() -> Result<()> {
        let device = Device::Cpu;
        let mut model = MockVelocityModel::new(DType::F32).fail_after(1, "out of memory");
        let text = TextBatch {
            embeds: Tensor::zeros((1, 2, 4), DType::F32, &device)?,
            attention_mask: Tensor::ones((1, 2), DType::U32, &device)?,
            pooled: Tensor::ones((1, 4), DType::F32, &device)?,
        };
        let x = Tensor::ones((1, 2, 1, 2, 2), DType::F32, &device)?;
        let t = Tensor::new(&[1000f32], &device)?;
        let v = model.forward(std::slice::from_ref(&x), &t, &text)?;
        // -0.5 + 0.1 * 1 + 5e-5 * 1000
        let expected = -0.5 + 0.1 + 0.05;
        let values = v.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (v - expected).abs() < 1e-6));
        assert!(model.forward(&[x], &t, &text).is_err());
        assert_eq!(model.calls(), 1);
        Ok(())
    }
}

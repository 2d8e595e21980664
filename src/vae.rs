//! Causal video VAE as seen by the pipeline stages.
//!
//! The transform itself is opaque. This module fixes its calling
//! convention and the pixel-space conversions on either side of it:
//! - images enter as `[B, H, W, C]` in `[0, 1]` and are encoded as
//!   `[B, C, 1, H, W]` in `[-1, 1]`
//! - decoded video `[B, C, T, H, W]` in `[-1, 1]` leaves as
//!   `[(B*T), H, W, C]` f32 in `[0, 1]` on the host

use crate::config::DecodeSettings;
use crate::device::Placeable;
use candle_core::{D, DType, Device, Result, Tensor};

/// Decoder options forwarded to the transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Decode latent frames in causal temporal windows
    pub temporal_chunk: bool,
    /// Latent frames per temporal window
    pub window_size: usize,
    /// Minimum spatial tile in pixels
    pub tile_size: usize,
}

impl From<DecodeSettings> for DecodeOptions {
    fn from(settings: DecodeSettings) -> Self {
        Self {
            temporal_chunk: true,
            window_size: settings.window_size,
            tile_size: settings.tile_size,
        }
    }
}

pub trait VideoAutoencoder: Placeable {
    /// Sample a raw latent from `pixels` `[B, 3, 1, H, W]` in `[-1, 1]`, untiled.
    fn encode(&mut self, pixels: &Tensor) -> Result<Tensor>;

    /// Decode a VAE-space latent `[B, C, t, h, w]` to pixels `[B, 3, T, H, W]` in roughly `[-1, 1]`.
    fn decode(&mut self, latent: &Tensor, options: &DecodeOptions) -> Result<Tensor>;

    fn dtype(&self) -> DType;
}

/// `[B, H, W, C]` in `[0, 1]` to `[B, C, 1, H, W]` in `[-1, 1]`.
pub fn image_to_vae_input(image: &Tensor, dtype: DType, device: &Device) -> Result<Tensor> {
    let (_, _, _, c) = image.dims4()?;
    if c != 3 {
        candle_core::bail!("expected RGB image with channels last, got {:?}", image.dims());
    }
    image
        .to_dtype(DType::F32)?
        .permute((0, 3, 1, 2))?
        .affine(2.0, -1.0)?
        .unsqueeze(2)?
        .to_dtype(dtype)?
        .to_device(device)
}

/// `[B, C, T, H, W]` in `[-1, 1]` to `[(B*T), H, W, C]` f32 in `[0, 1]` on the CPU.
pub fn vae_output_to_frames(video: &Tensor) -> Result<Tensor> {
    let (b, c, t, h, w) = video.dims5()?;
    let frames = video
        .to_dtype(DType::F32)?
        .affine(0.5, 0.5)?
        .clamp(0f32, 1f32)?
        .permute((0, 2, 3, 4, 1))?
        .reshape((b * t, h, w, c))?;
    frames.to_device(&Device::Cpu)?.contiguous()
}

/// Per-channel means of a frame tensor `[N, H, W, C]`, handy for logging.
pub fn channel_means(frames: &Tensor) -> Result<Vec<f32>> {
    let c = frames.dim(D::Minus1)?;
    frames.reshape(((), c))?.mean(0)?.to_vec1::<f32>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_to_vae_input_layout_and_range() -> Result<()> {
        let device = Device::Cpu;
        // 1x2x2x3: R = 0, G = 0.5, B = 1
        let pixel = [0f32, 0.5, 1.0];
        let data: Vec<f32> = pixel.iter().copied().cycle().take(12).collect();
        let image = Tensor::from_vec(data, (1, 2, 2, 3), &device)?;
        let x = image_to_vae_input(&image, DType::F32, &device)?;
        assert_eq!(x.dims(), &[1, 3, 1, 2, 2]);
        let per_channel: Vec<f32> = x.mean_keepdim(4)?.mean_keepdim(3)?.flatten_all()?.to_vec1()?;
        assert_eq!(per_channel, vec![-1.0, 0.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_vae_output_to_frames() -> Result<()> {
        let device = Device::Cpu;
        let video = Tensor::arange(0f32, 2.0 * 3.0 * 4.0 * 2.0 * 2.0, &device)?
            .reshape((2, 3, 4, 2, 2))?
            .affine(0.1, -4.0)?;
        let frames = vae_output_to_frames(&video)?;
        assert_eq!(frames.dims(), &[8, 2, 2, 3]);
        let values = frames.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));

        // frame 1 of batch 0, pixel (0, 1), channel 2 comes from video[0, 2, 1, 0, 1]
        let src = video.get(0)?.get(2)?.get(1)?.get(0)?.get(1)?.to_scalar::<f32>()?;
        let dst = frames.get(1)?.get(0)?.get(1)?.get(2)?.to_scalar::<f32>()?;
        assert!((dst - (src * 0.5 + 0.5).clamp(0.0, 1.0)).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_decode_options_from_settings() {
        let options = DecodeOptions::from(DecodeSettings::default());
        assert!(options.temporal_chunk);
        assert_eq!((options.tile_size, options.window_size), (256, 2));
    }

    #[test]
    fn test_channel_means() -> Result<()> {
        let frames = Tensor::from_vec(vec![0f32, 1.0, 0.5, 1.0, 1.0, 0.5], (1, 1, 2, 3), &Device::Cpu)?;
        assert_eq!(channel_means(&frames)?, vec![0.5, 1.0, 0.5]);
        Ok(())
    }
}

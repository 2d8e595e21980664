//! Latent normalization around the VAE.
//!
//! The first latent frame uses image statistics, every later frame video
//! statistics. Each slice is transformed with its own constants and the
//! slices are rejoined in order.

use candle_core::{Result, Tensor};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatentStats {
    pub shift: f64,
    pub scale: f64,
}

pub const IMAGE_STATS: LatentStats = LatentStats {
    shift: 0.1490,
    scale: 1.0 / 1.8415,
};

pub const VIDEO_STATS: LatentStats = LatentStats {
    shift: -0.2343,
    scale: 1.0 / 3.0986,
};

impl LatentStats {
    /// `latent / scale + shift`
    pub fn to_vae(&self, x: &Tensor) -> Result<Tensor> {
        x.affine(1.0 / self.scale, self.shift)
    }

    /// `(latent - shift) * scale`
    pub fn from_vae(&self, x: &Tensor) -> Result<Tensor> {
        x.affine(self.scale, -self.shift * self.scale)
    }
}

fn per_partition(x: &Tensor, f: impl Fn(&LatentStats, &Tensor) -> Result<Tensor>) -> Result<Tensor> {
    let t = x.dim(2)?;
    let first = f(&IMAGE_STATS, &x.narrow(2, 0, 1)?)?;
    if t == 1 {
        return Ok(first);
    }
    let rest = f(&VIDEO_STATS, &x.narrow(2, 1, t - 1)?)?;
    Tensor::cat(&[&first, &rest], 2)
}

/// Prepare sampler latents `[b, c, t, h, w]` for the VAE decoder.
pub fn decode_input(latent: &Tensor) -> Result<Tensor> {
    per_partition(latent, LatentStats::to_vae)
}

/// Normalize raw VAE encoder output `[b, c, t, h, w]` for the sampler.
pub fn encode_output(latent: &Tensor) -> Result<Tensor> {
    per_partition(latent, LatentStats::from_vae)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let device = Device::Cpu;
        for t in [1, 2, 5] {
            let x = Tensor::randn(0f32, 2.0, (1, 16, t, 4, 6), &device)?;
            let back = encode_output(&decode_input(&x)?)?;
            assert!(max_abs_diff(&x, &back)? < 1e-5);
            let back = decode_input(&encode_output(&x)?)?;
            assert!(max_abs_diff(&x, &back)? < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_partitions_use_own_stats() -> Result<()> {
        let x = Tensor::zeros((1, 1, 3, 1, 1), DType::F32, &Device::Cpu)?;
        let y = decode_input(&x)?.flatten_all()?.to_vec1::<f32>()?;
        assert!((y[0] - 0.1490).abs() < 1e-6);
        assert!((y[1] + 0.2343).abs() < 1e-6);
        assert!((y[2] + 0.2343).abs() < 1e-6);

        let ones = Tensor::ones((1, 1, 2, 1, 1), DType::F32, &Device::Cpu)?;
        let z = encode_output(&ones)?.flatten_all()?.to_vec1::<f32>()?;
        assert!((z[0] as f64 - (1.0 - 0.1490) / 1.8415).abs() < 1e-6);
        assert!((z[1] as f64 - (1.0 + 0.2343) / 3.0986).abs() < 1e-6);
        Ok(())
    }
}

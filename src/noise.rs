//! Seeded noise for the sampler.
//!
//! Noise is generated on the host with PCG32 + Box-Muller so a seed gives the
//! same latents on every backend, then moved to the compute device.

use candle_core::{Device, Result, Shape, Tensor};
use tracing::debug;

/// PCG32 random number generator (XSH-RR output).
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    pub fn new(seed: u64, inc: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (inc << 1) | 1,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    pub fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old.wrapping_mul(6364136223846793005).wrapping_add(self.inc);
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        let rot = (old >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Uniform in [0, 1) with 24 bits of mantissa.
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 * (1.0 / 16_777_216.0)
    }

    /// Two independent standard normal samples.
    pub fn next_gaussian(&mut self) -> (f32, f32) {
        let u1 = loop {
            let x = self.next_f32();
            if x > 1e-7 {
                break x;
            }
        };
        let u2 = self.next_f32();
        let mag = (-2.0 * u1.ln()).sqrt();
        let (sin, cos) = (2.0 * std::f32::consts::PI * u2).sin_cos();
        (mag * cos, mag * sin)
    }

    pub fn gaussians(&mut self, count: usize) -> Vec<f32> {
        let mut data = Vec::with_capacity(count + 1);
        while data.len() < count {
            let (z0, z1) = self.next_gaussian();
            data.push(z0);
            data.push(z1);
        }
        data.truncate(count);
        data
    }
}

/// Stream of seeded noise tensors for one sampling call.
pub struct NoiseSource {
    rng: Pcg32,
    device: Device,
}

/// Stream selector so noise never collides with other PCG32 users.
const STREAM: u64 = 0x5059_5241_4D49_44;

impl NoiseSource {
    /// Seed the host stream and, on accelerators, the device generator too.
    pub fn new(seed: u64, device: &Device) -> Self {
        if !device.is_cpu()
            && let Err(e) = device.set_seed(seed)
        {
            debug!(seed, error = %e, "device generator could not be seeded");
        }
        Self {
            rng: Pcg32::new(seed, STREAM),
            device: device.clone(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Standard normal f32 noise of `shape` on the compute device.
    pub fn randn(&mut self, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        let data = self.rng.gaussians(shape.elem_count());
        Tensor::from_vec(data, shape, &self.device)
    }

    /// Block noise for a `[b, c, t, h, w]` latent: every 2x2 spatial block is a
    /// draw from `N(0, (1 + gamma) I - gamma 11^T)`.
    pub fn block_noise(&mut self, dims: (usize, usize, usize, usize, usize), gamma: f64) -> Result<Tensor> {
        let (b, c, t, h, w) = dims;
        if !h.is_multiple_of(2) || !w.is_multiple_of(2) {
            candle_core::bail!("block noise needs even spatial dims, got {h}x{w}");
        }
        let chol = block_cholesky(gamma)?;
        let frames = b * c * t;
        let (bh, bw) = (h / 2, w / 2);
        let mut data = vec![0f32; frames * h * w];
        let mut z = [0f64; 4];
        for frame in 0..frames {
            let base = frame * h * w;
            for i in 0..bh {
                for j in 0..bw {
                    for (k, v) in self.rng.gaussians(4).into_iter().enumerate() {
                        z[k] = v as f64;
                    }
                    for (k, row) in chol.iter().enumerate() {
                        let value: f64 = row.iter().zip(z.iter()).map(|(l, z)| l * z).sum();
                        let (p, q) = (k / 2, k % 2);
                        data[base + (2 * i + p) * w + (2 * j + q)] = value as f32;
                    }
                }
            }
        }
        Tensor::from_vec(data, (b, c, t, h, w), &self.device)
    }
}

/// Lower Cholesky factor of the 4x4 block covariance (semi-definite allowed).
fn block_cholesky(gamma: f64) -> Result<[[f64; 4]; 4]> {
    let mut cov = [[-gamma; 4]; 4];
    for (i, row) in cov.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    let mut l = [[0f64; 4]; 4];
    for i in 0..4 {
        for j in 0..=i {
            let s: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            if i == j {
                let d = cov[i][i] - s;
                // gamma = 1/3 makes the covariance singular; the last pivot is zero up to rounding.
                if d < -1e-9 {
                    candle_core::bail!("block noise covariance is not positive semi-definite for gamma={gamma}");
                }
                l[i][j] = d.max(0.0).sqrt();
            } else if l[j][j] > 0.0 {
                l[i][j] = (cov[i][j] - s) / l[j][j];
            }
        }
    }
    Ok(l)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_noise() -> Result<()> {
        let device = Device::Cpu;
        let a = NoiseSource::new(42, &device).randn((2, 3, 4))?;
        let b = NoiseSource::new(42, &device).randn((2, 3, 4))?;
        let c = NoiseSource::new(43, &device).randn((2, 3, 4))?;
        let a = a.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b.flatten_all()?.to_vec1::<f32>()?);
        assert_ne!(a, c.flatten_all()?.to_vec1::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_randn_statistics() -> Result<()> {
        let mut source = NoiseSource::new(0, &Device::Cpu);
        let data = source.randn(20_001)?.to_vec1::<f32>()?;
        assert_eq!(data.len(), 20_001);
        let n = data.len() as f64;
        let mean = data.iter().map(|x| *x as f64).sum::<f64>() / n;
        let var = data.iter().map(|x| (*x as f64 - mean).powi(2)).sum::<f64>() / n;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "var {var}");
        Ok(())
    }

    #[test]
    fn test_cholesky_reconstructs_covariance() -> Result<()> {
        let gamma = 1.0 / 3.0;
        // Diagonal 1 + gamma - gamma = 1, off-diagonal -gamma.
        let l = block_cholesky(gamma)?;
        for i in 0..4 {
            for j in 0..4 {
                let v: f64 = (0..4).map(|k| l[i][k] * l[j][k]).sum();
                let expected = if i == j { 1.0 } else { -gamma };
                assert!((v - expected).abs() < 1e-12);
            }
        }
        Ok(())
    }

    #[test]
    fn test_block_noise_correlation() -> Result<()> {
        let gamma = 1.0 / 3.0;
        let mut source = NoiseSource::new(7, &Device::Cpu);
        let noise = source.block_noise((1, 1, 1, 200, 200), gamma)?;
        assert_eq!(noise.dims(), &[1, 1, 1, 200, 200]);
        let v = noise.flatten_all()?.to_vec1::<f32>()?;
        // Horizontal neighbours inside a block share the -gamma covariance.
        let mut cov = 0.0;
        let mut count = 0.0;
        for i in 0..200 {
            for j in (0..200).step_by(2) {
                cov += v[i * 200 + j] as f64 * v[i * 200 + j + 1] as f64;
                count += 1.0;
            }
        }
        assert!((cov / count + gamma).abs() < 0.05);
        assert!(source.block_noise((1, 1, 1, 3, 4), gamma).is_err());
        Ok(())
    }
}

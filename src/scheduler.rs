//! Pyramidal flow-matching Euler scheduler.
//!
//! The training schedule `sigma = t / N` is split into stages. Every stage
//! after the first starts from a renoised, upsampled latent, so its start
//! sigma is corrected for the extra noise mixed in at the transition. Each
//! stage then owns a window of the training timesteps proportional to the
//! corrected flow distance it covers.
//!
//! At inference a stage runs `n` Euler steps over `linspace(1, 1/N, n)` sigmas
//! with a terminal zero:
//!   x_{k+1} = x_k + (sigma_{k+1} - sigma_k) * v(x_k, t_k)

use crate::config::SamplerConfig;
use candle_core::{DType, Result, Tensor};

/// Timestep window of one stage, in training-timestep units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageWindow {
    /// First timestep of the stage (largest)
    pub timestep_max: f64,
    /// Last timestep the stage reaches when sampled with the full training grid
    pub timestep_min: f64,
    /// Start sigma before the renoise correction
    pub ori_start_sigma: f64,
    /// Corrected start sigma
    pub start_sigma: f64,
    pub end_sigma: f64,
    /// Fraction of the total corrected flow distance covered before/after this stage
    pub ratio: (f64, f64),
}

/// Timesteps and sigmas for one stage at a given step count.
#[derive(Debug, Clone)]
pub struct StageTimesteps {
    pub stage: usize,
    pub timesteps: Vec<f64>,
    /// `timesteps.len() + 1` entries, terminal 0 appended
    pub sigmas: Vec<f64>,
}

impl StageTimesteps {
    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timesteps.is_empty()
    }
}

pub struct PyramidFlowScheduler {
    config: SamplerConfig,
    windows: Vec<StageWindow>,
}

/// The training-time sigma for index `i` of the reversed timestep grid, shift applied.
fn training_sigma(config: &SamplerConfig, index: usize) -> f64 {
    let n = config.num_train_timesteps as f64;
    let s = (n - index as f64) / n;
    config.shift * s / (1.0 + (config.shift - 1.0) * s)
}

/// `numpy.linspace(start, end, num)`.
pub fn linspace(start: f64, end: f64, num: usize) -> Vec<f64> {
    match num {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (end - start) / (num - 1) as f64;
            (0..num)
                .map(|i| if i == num - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// Corrected start sigma after mixing `alpha * x + beta * noise`.
fn corrected_start_sigma(ori_start_sigma: f64, gamma: f64) -> f64 {
    let ori = 1.0 - ori_start_sigma;
    let corrected = ori / ((1.0 + 1.0 / gamma).sqrt() * (1.0 - ori) + ori);
    1.0 - corrected
}

impl PyramidFlowScheduler {
    pub fn new(config: SamplerConfig) -> Result<Self> {
        let stages = config.num_stages();
        let n = config.num_train_timesteps;
        if stages == 0 || n == 0 {
            candle_core::bail!(
                "scheduler needs at least one stage and one training timestep (stages={stages}, timesteps={n})"
            );
        }
        if config.gamma <= 0.0 {
            candle_core::bail!("gamma must be positive, got {}", config.gamma);
        }
        for (name, value) in [
            ("frames_per_unit", config.frames_per_unit),
            ("latent_channels", config.latent_channels),
            ("vae_spatial_ratio", config.vae_spatial_ratio),
        ] {
            if value == 0 {
                candle_core::bail!("{name} must be at least 1");
            }
        }
        if config.stage_range.windows(2).any(|w| w[1] <= w[0]) {
            candle_core::bail!("stage range must be increasing: {:?}", config.stage_range);
        }

        let mut starts = Vec::with_capacity(stages);
        let mut distances = Vec::with_capacity(stages);
        for i_s in 0..stages {
            let start_idx = (config.stage_range[i_s] * n as f64) as usize;
            let end_idx = ((config.stage_range[i_s + 1] * n as f64) as usize).min(n);
            let ori_start_sigma = training_sigma(&config, start_idx.min(n - 1));
            let end_sigma = if end_idx < n {
                training_sigma(&config, end_idx)
            } else {
                0.0
            };
            let start_sigma = if i_s == 0 {
                ori_start_sigma
            } else {
                corrected_start_sigma(ori_start_sigma, config.gamma)
            };
            distances.push(start_sigma - end_sigma);
            starts.push((ori_start_sigma, start_sigma, end_sigma));
        }

        let total: f64 = distances.iter().sum();
        let timestep_at = |ratio: f64| {
            let idx = ((ratio * n as f64) as usize).min(n - 1);
            training_sigma(&config, idx) * n as f64
        };
        let mut windows = Vec::with_capacity(stages);
        let mut covered = 0.0;
        for (i_s, (ori_start_sigma, start_sigma, end_sigma)) in starts.into_iter().enumerate() {
            let start_ratio = if i_s == 0 { 0.0 } else { covered / total };
            covered += distances[i_s];
            // Keeps the last stage's index inside the grid.
            let end_ratio = if i_s == stages - 1 {
                0.999_999_999_999_999_9
            } else {
                covered / total
            };
            windows.push(StageWindow {
                timestep_max: timestep_at(start_ratio),
                timestep_min: timestep_at(end_ratio),
                ori_start_sigma,
                start_sigma,
                end_sigma,
                ratio: (start_ratio, end_ratio),
            });
        }

        Ok(Self { config, windows })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn num_stages(&self) -> usize {
        self.windows.len()
    }

    pub fn window(&self, stage: usize) -> Option<&StageWindow> {
        self.windows.get(stage)
    }

    /// Timesteps and sigmas for running `num_steps` Euler steps in `stage`.
    pub fn set_timesteps(&self, num_steps: usize, stage: usize) -> Result<StageTimesteps> {
        let Some(window) = self.windows.get(stage) else {
            candle_core::bail!("stage {stage} out of range (stages: {})", self.windows.len())
        };
        if num_steps == 0 {
            candle_core::bail!("stage {stage} needs at least one step");
        }
        let n = self.config.num_train_timesteps as f64;
        // Stage grid is linspace(max, min, N + 1) without its last point.
        let last = window.timestep_max + (window.timestep_min - window.timestep_max) * (n - 1.0) / n;
        let timesteps = linspace(window.timestep_max, last, num_steps);
        let mut sigmas = linspace(1.0, 1.0 / n, num_steps);
        sigmas.push(0.0);
        Ok(StageTimesteps {
            stage,
            timesteps,
            sigmas,
        })
    }

    /// Euler step `idx` of a stage. Integrates in f32, returns in the dtype of
    /// `model_output`.
    pub fn step(
        &self,
        model_output: &Tensor,
        sample: &Tensor,
        schedule: &StageTimesteps,
        idx: usize,
    ) -> Result<Tensor> {
        if idx >= schedule.len() {
            candle_core::bail!(
                "Timestep index {} out of range (max: {})",
                idx,
                schedule.len().saturating_sub(1)
            );
        }
        let dt = schedule.sigmas[idx + 1] - schedule.sigmas[idx];
        let sample = sample.to_dtype(DType::F32)?;
        let delta = model_output.to_dtype(DType::F32)?.affine(dt, 0.0)?;
        sample.add(&delta)?.to_dtype(model_output.dtype())
    }

    /// `(alpha, beta)` for the transition into `stage`:
    /// `x = alpha * upsample(x) + beta * block_noise`.
    pub fn renoise_coefficients(&self, stage: usize) -> Result<(f64, f64)> {
        let Some(window) = self.windows.get(stage) else {
            candle_core::bail!("stage {stage} out of range (stages: {})", self.windows.len())
        };
        let gamma = self.config.gamma;
        let ori_sigma = 1.0 - window.ori_start_sigma;
        let alpha = 1.0 / ((1.0 + 1.0 / gamma).sqrt() * (1.0 - ori_sigma) + ori_sigma);
        let beta = alpha * (1.0 - ori_sigma) / gamma.sqrt();
        Ok((alpha, beta))
    }
}

/// Classifier-free guidance on a `[uncond, cond]` batched prediction.
pub fn apply_cfg(v_uncond: &Tensor, v_cond: &Tensor, guidance_scale: f64) -> Result<Tensor> {
    let diff = v_cond.sub(v_uncond)?;
    v_uncond.add(&diff.affine(guidance_scale, 0.0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scheduler() -> PyramidFlowScheduler {
        PyramidFlowScheduler::new(SamplerConfig::default()).unwrap()
    }

    #[test]
    fn test_linspace() {
        assert_eq!(linspace(1.0, 0.0, 5), vec![1.0, 0.75, 0.5, 0.25, 0.0]);
        assert_eq!(linspace(3.0, 0.0, 1), vec![3.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }

    #[test]
    fn test_original_start_sigmas() {
        let s = scheduler();
        let ori: Vec<f64> = (0..3).map(|i| s.window(i).unwrap().ori_start_sigma).collect();
        assert!((ori[0] - 1.0).abs() < 1e-12);
        assert!((ori[1] - 0.667).abs() < 1e-12);
        assert!((ori[2] - 0.334).abs() < 1e-12);
        assert_eq!(s.window(2).unwrap().end_sigma, 0.0);
    }

    #[test]
    fn test_stage_windows_are_contiguous() {
        let s = scheduler();
        assert_eq!(s.num_stages(), 3);
        assert_eq!(s.window(0).unwrap().timestep_max, 1000.0);
        for i in 0..2 {
            let a = s.window(i).unwrap();
            let b = s.window(i + 1).unwrap();
            assert!(a.timestep_max > a.timestep_min);
            assert_eq!(a.timestep_min, b.timestep_max);
            assert_eq!(a.ratio.1, b.ratio.0);
        }
        assert_eq!(s.window(2).unwrap().timestep_min, 1.0);
    }

    #[test]
    fn test_set_timesteps_shapes() {
        let s = scheduler();
        let ts = s.set_timesteps(10, 1).unwrap();
        assert_eq!(ts.timesteps.len(), 10);
        assert_eq!(ts.sigmas.len(), 11);
        assert_eq!(ts.sigmas[0], 1.0);
        assert!((ts.sigmas[9] - 0.001).abs() < 1e-12);
        assert_eq!(ts.sigmas[10], 0.0);
        assert_eq!(ts.timesteps[0], s.window(1).unwrap().timestep_max);
        assert!(ts.timesteps.windows(2).all(|w| w[0] > w[1]));

        let single = s.set_timesteps(1, 0).unwrap();
        assert_eq!(single.timesteps, vec![1000.0]);
        assert_eq!(single.sigmas, vec![1.0, 0.0]);

        assert!(s.set_timesteps(0, 0).is_err());
        assert!(s.set_timesteps(5, 3).is_err());
    }

    #[test]
    fn test_renoise_coefficients() {
        let s = scheduler();
        let (alpha, beta) = s.renoise_coefficients(1).unwrap();
        // ori_sigma = 0.333, sqrt(1 + 3) = 2
        let expected_alpha = 1.0 / (2.0 * 0.667 + 0.333);
        assert!((alpha - expected_alpha).abs() < 1e-12);
        assert!((beta - expected_alpha * 0.667 * 3f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_euler_step() -> Result<()> {
        let device = Device::Cpu;
        let s = scheduler();
        let ts = s.set_timesteps(2, 0)?;
        let sample = Tensor::ones((1, 2, 1, 2, 2), DType::F32, &device)?;
        let v = Tensor::ones((1, 2, 1, 2, 2), DType::F32, &device)?;

        let x1 = s.step(&v, &sample, &ts, 0)?;
        // dt = 0.001 - 1.0
        let expected = 1.0 + (0.001 - 1.0);
        let got = x1.flatten_all()?.to_vec1::<f32>()?;
        assert!(got.iter().all(|x| (*x as f64 - expected).abs() < 1e-6));

        assert!(s.step(&v, &sample, &ts, 2).is_err());
        Ok(())
    }

    #[test]
    fn test_apply_cfg() -> Result<()> {
        let device = Device::Cpu;
        let uncond = Tensor::new(&[1.0f32, 2.0], &device)?;
        let cond = Tensor::new(&[3.0f32, 2.0], &device)?;
        let guided = apply_cfg(&uncond, &cond, 5.0)?.to_vec1::<f32>()?;
        assert_eq!(guided, vec![11.0, 2.0]);
        Ok(())
    }
}

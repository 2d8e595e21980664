//! Pyramidal sampler: coarse-to-fine stages nested in autoregressive time units.
//!
//! Each time unit starts from noise at the coarsest stage. Between stages the
//! latent is upsampled 2x and renoised with correlated block noise. Units after
//! the first attend to every frame produced so far through a resolution
//! pyramid of the clean history.

use crate::conditioning::ConditioningBundle;
use crate::config::{SamplerConfig, VideoGeometry};
use crate::denoiser::{DenoiseStep, PyramidDenoiser};
use crate::device::place;
use crate::error::{PhaseContext, PyramidError, Result};
use crate::noise::NoiseSource;
use crate::pyramid::{coarsen_noise, history_for_stage, latent_pyramid, upsample_nearest};
use crate::schedule::{NUM_STAGES, StageSchedule};
use crate::scheduler::PyramidFlowScheduler;
use candle_core::{DType, Device, Tensor};
use tracing::{debug, info};

/// Progress of one denoising iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerProgress {
    pub unit: usize,
    pub units: usize,
    pub stage: usize,
    pub step: usize,
    pub steps: usize,
}

pub struct PyramidSampler<'a> {
    denoiser: &'a mut dyn PyramidDenoiser,
    scheduler: PyramidFlowScheduler,
    device: Device,
    progress: Option<Box<dyn FnMut(SamplerProgress) + 'a>>,
}

/// Per-unit settings resolved from the schedule.
struct UnitPlan<'s> {
    unit: usize,
    units: usize,
    steps: &'s [usize; NUM_STAGES],
    guidance_scale: f64,
}

impl<'a> PyramidSampler<'a> {
    pub fn new(
        denoiser: &'a mut dyn PyramidDenoiser,
        config: SamplerConfig,
        device: &Device,
    ) -> Result<Self> {
        if config.num_stages() != NUM_STAGES {
            return Err(PyramidError::Candle(candle_core::Error::Msg(format!(
                "sampler expects {NUM_STAGES} stages, config has {}",
                config.num_stages()
            ))));
        }
        let scheduler = PyramidFlowScheduler::new(config)?;
        Ok(Self {
            denoiser,
            scheduler,
            device: device.clone(),
            progress: None,
        })
    }

    pub fn with_progress(mut self, callback: impl FnMut(SamplerProgress) + 'a) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    fn config(&self) -> &SamplerConfig {
        self.scheduler.config()
    }

    /// Seeded noise for the whole clip, already at the coarsest stage.
    fn initial_noise(&self, noise: &mut NoiseSource, geometry: &VideoGeometry) -> candle_core::Result<Tensor> {
        let config = self.config();
        let (h, w) = geometry.latent_hw(config);
        let full = noise.randn((1, config.latent_channels, geometry.temp, h, w))?;
        coarsen_noise(&full, config.num_stages())
    }

    /// Text-to-video: synthesize the first frame, then every later unit.
    ///
    /// Returns `[1, C, temp, H/8, W/8]` in f32.
    pub fn generate(
        &mut self,
        conditioning: &ConditioningBundle,
        schedule: &StageSchedule,
        geometry: &VideoGeometry,
        seed: u64,
    ) -> Result<Tensor> {
        let fpu = self.config().frames_per_unit;
        let units = 1 + (geometry.temp - 1) / fpu;
        info!(
            width = geometry.width,
            height = geometry.height,
            temp = geometry.temp,
            units,
            seed,
            "generating video"
        );

        let mut noise = NoiseSource::new(seed, &self.device);
        let latents = self.initial_noise(&mut noise, geometry).in_phase("noise init")?;

        let mut generated: Vec<Tensor> = Vec::with_capacity(units);
        for unit in 0..units {
            let first_frame = unit == 0;
            let (start, len) = if first_frame {
                (0, 1)
            } else {
                (1 + (unit - 1) * fpu, fpu)
            };
            let plan = UnitPlan {
                unit,
                units,
                steps: schedule.steps_for(first_frame),
                guidance_scale: schedule.guidance_for(first_frame, unit),
            };
            let unit_noise = latents.narrow(2, start, len).in_phase("noise init")?;
            let out = self
                .generate_unit(&mut noise, unit_noise, &generated, conditioning, &plan)
                .in_phase(&format!("time unit {unit}"))?;
            generated.push(out);
        }
        Tensor::cat(&generated, 2).in_phase("assembling output")
    }

    /// Image-to-video: `seed_image_latent` is the first unit, only the video
    /// schedule and guidance are used.
    ///
    /// With `temp == 1` the seed latent's first frame is returned unchanged.
    pub fn generate_from_image(
        &mut self,
        conditioning: &ConditioningBundle,
        seed_image_latent: &Tensor,
        schedule: &StageSchedule,
        geometry: &VideoGeometry,
        seed: u64,
    ) -> Result<Tensor> {
        let config = self.config();
        let (h, w) = geometry.latent_hw(config);
        let expected = [1, config.latent_channels, h, w];
        let dims = seed_image_latent.dims();
        if dims.len() != 5 || [dims[0], dims[1], dims[3], dims[4]] != expected {
            return Err(PyramidError::ShapeMismatch {
                field: "seed_image_latent",
                existing: vec![1, config.latent_channels, 1, h, w],
                incoming: dims.to_vec(),
            });
        }
        let fpu = config.frames_per_unit;
        let units = geometry.temp / fpu;
        info!(
            width = geometry.width,
            height = geometry.height,
            temp = geometry.temp,
            units,
            seed,
            "generating video from image"
        );

        let first = seed_image_latent
            .narrow(2, 0, 1)
            .and_then(|t| place(&t, &self.device))
            .and_then(|t| t.to_dtype(DType::F32))
            .in_phase("seed latent")?;

        let mut noise = NoiseSource::new(seed, &self.device);
        let latents = self.initial_noise(&mut noise, geometry).in_phase("noise init")?;

        let mut generated = vec![first];
        for unit in 1..units.max(1) {
            let plan = UnitPlan {
                unit,
                units,
                steps: schedule.steps_for(false),
                guidance_scale: schedule.guidance_for(false, unit),
            };
            let unit_noise = latents.narrow(2, (unit - 1) * fpu, fpu).in_phase("noise init")?;
            let out = self
                .generate_unit(&mut noise, unit_noise, &generated, conditioning, &plan)
                .in_phase(&format!("time unit {unit}"))?;
            generated.push(out);
        }
        Tensor::cat(&generated, 2).in_phase("assembling output")
    }

    /// Run every stage for one time unit and return its final-stage latent.
    fn generate_unit(
        &mut self,
        noise: &mut NoiseSource,
        unit_noise: Tensor,
        generated: &[Tensor],
        conditioning: &ConditioningBundle,
        plan: &UnitPlan<'_>,
    ) -> candle_core::Result<Tensor> {
        let stages = self.scheduler.num_stages();
        let gamma = self.config().gamma;
        let fpu = self.config().frames_per_unit;
        let segment = conditioning.segment_for_unit(plan.unit, plan.units);
        let text = conditioning.text_batch(segment, &self.device)?;
        let pyramid = if generated.is_empty() {
            None
        } else {
            Some(latent_pyramid(&Tensor::cat(generated, 2)?, stages)?)
        };
        debug!(
            unit = plan.unit,
            segment,
            guidance = plan.guidance_scale,
            steps = ?plan.steps,
            "time unit"
        );

        let mut latent = unit_noise;
        for stage in 0..stages {
            let schedule = self.scheduler.set_timesteps(plan.steps[stage], stage)?;
            if stage > 0 {
                let up = upsample_nearest(&latent.to_dtype(DType::F32)?)?;
                let (alpha, beta) = self.scheduler.renoise_coefficients(stage)?;
                let block = noise.block_noise(up.dims5()?, gamma)?;
                latent = (up.affine(alpha, 0.0)? + block.affine(beta, 0.0)?)?;
            }
            let history = match &pyramid {
                Some(levels) => history_for_stage(levels, stage, plan.unit, fpu)?,
                None => Vec::new(),
            };
            for step_index in 0..schedule.len() {
                latent = self.denoiser.denoise_step(DenoiseStep {
                    scheduler: &self.scheduler,
                    schedule: &schedule,
                    step_index,
                    latent: &latent,
                    history: &history,
                    text: &text,
                    guidance_scale: plan.guidance_scale,
                })?;
                if let Some(callback) = self.progress.as_mut() {
                    callback(SamplerProgress {
                        unit: plan.unit,
                        units: plan.units,
                        stage,
                        step: step_index,
                        steps: schedule.len(),
                    });
                }
            }
            debug!(unit = plan.unit, stage, shape = ?latent.dims(), "stage done");
        }
        latent.to_dtype(DType::F32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::denoiser::MmDitVariant;
    use crate::mock::{MockVelocityModel, mock_bundle};

    fn geometry(temp: usize) -> VideoGeometry {
        VideoGeometry::new(256, 128, temp, &SamplerConfig::default()).unwrap()
    }

    #[test]
    fn test_generate_shape_and_progress() -> Result<()> {
        let device = Device::Cpu;
        let mut denoiser = MmDitVariant::new(MockVelocityModel::new(DType::F32));
        let bundle = mock_bundle(&device, 1)?;
        let schedule = StageSchedule::parse("2,2,2", "1,1,1", 9.0, 5.0)?;

        let mut seen = Vec::new();
        let out = {
            let mut sampler = PyramidSampler::new(&mut denoiser, SamplerConfig::default(), &device)?
                .with_progress(|p| seen.push(p));
            sampler.generate(&bundle, &schedule, &geometry(3), 0)?
        };
        assert_eq!(out.dims(), &[1, 16, 3, 16, 32]);
        // unit 0: 2+2+2 steps, units 1 and 2: 1+1+1 steps each
        assert_eq!(seen.len(), 12);
        assert_eq!(seen[0].units, 3);
        assert_eq!(seen.last().map(|p| (p.unit, p.stage)), Some((2, 2)));
        Ok(())
    }

    #[test]
    fn test_generate_is_reproducible() -> Result<()> {
        let device = Device::Cpu;
        let bundle = mock_bundle(&device, 1)?;
        let schedule = StageSchedule::parse("1,1,1", "1,1,1", 9.0, 5.0)?;
        let mut run = |seed| -> Result<Vec<f32>> {
            let mut denoiser = MmDitVariant::new(MockVelocityModel::new(DType::F32));
            let mut sampler = PyramidSampler::new(&mut denoiser, SamplerConfig::default(), &device)?;
            let out = sampler.generate(&bundle, &schedule, &geometry(2), seed)?;
            Ok(out.flatten_all()?.to_vec1::<f32>()?)
        };
        let a = run(11)?;
        assert_eq!(a, run(11)?);
        assert_ne!(a, run(12)?);
        Ok(())
    }

    #[test]
    fn test_from_image_single_frame_returns_seed() -> Result<()> {
        let device = Device::Cpu;
        let mut denoiser = MmDitVariant::new(MockVelocityModel::new(DType::F32));
        let bundle = mock_bundle(&device, 1)?;
        let schedule = StageSchedule::parse("1,1,1", "1,1,1", 9.0, 5.0)?;
        let seed_latent = Tensor::randn(0f32, 1.0, (1, 16, 1, 16, 32), &device)?;

        let mut sampler = PyramidSampler::new(&mut denoiser, SamplerConfig::default(), &device)?;
        let out = sampler.generate_from_image(&bundle, &seed_latent, &schedule, &geometry(1), 0)?;
        assert_eq!(out.dims(), seed_latent.dims());
        let diff = (out - &seed_latent)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn test_from_image_extends_seed() -> Result<()> {
        let device = Device::Cpu;
        let mut denoiser = MmDitVariant::new(MockVelocityModel::new(DType::F32));
        let bundle = mock_bundle(&device, 1)?;
        let schedule = StageSchedule::parse("1,1,1", "1,1,1", 9.0, 5.0)?;
        let seed_latent = Tensor::randn(0f32, 1.0, (1, 16, 1, 16, 32), &device)?;

        let mut sampler = PyramidSampler::new(&mut denoiser, SamplerConfig::default(), &device)?;
        let out = sampler.generate_from_image(&bundle, &seed_latent, &schedule, &geometry(3), 0)?;
        assert_eq!(out.dims(), &[1, 16, 3, 16, 32]);
        let first = out.narrow(2, 0, 1)?;
        let diff = (first - &seed_latent)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);

        let wrong = Tensor::zeros((1, 16, 1, 8, 8), DType::F32, &device)?;
        let err = sampler
            .generate_from_image(&bundle, &wrong, &schedule, &geometry(3), 0)
            .unwrap_err();
        assert!(matches!(err, PyramidError::ShapeMismatch { .. }));
        Ok(())
    }
}

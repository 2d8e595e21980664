//! Network variants behind a single denoising-step contract.
//!
//! The generative network itself is an opaque [`VelocityModel`]: given the
//! history latents, the current latent, a timestep and prompt conditioning it
//! predicts the flow velocity. The two architectures differ in how they run
//! classifier-free guidance around it:
//! - [`MmDitVariant`] evaluates negative and positive prompts in one batch
//! - [`FluxVariant`] runs two batch-1 passes, negative then positive

use crate::conditioning::TextBatch;
use crate::config::Architecture;
use crate::device::Placeable;
use crate::precision::compute_dtype_or;
use crate::scheduler::{PyramidFlowScheduler, StageTimesteps, apply_cfg};
use candle_core::{DType, Device, Result, Tensor};

/// Opaque generative network.
pub trait VelocityModel: Placeable {
    /// Predict the velocity of the last entry of `samples`.
    ///
    /// `samples` holds history latents (oldest first, possibly at coarser
    /// resolutions) followed by the current latent, each `[B, C, t, h, w]`.
    /// `timestep` is `[B]` in training-timestep units. The output has the
    /// shape of the current latent.
    fn forward(&mut self, samples: &[Tensor], timestep: &Tensor, text: &TextBatch) -> Result<Tensor>;

    /// Dtype the weights compute in outside an autocast scope.
    fn dtype(&self) -> DType;
}

/// Inputs of one denoising iteration.
pub struct DenoiseStep<'a> {
    pub scheduler: &'a PyramidFlowScheduler,
    pub schedule: &'a StageTimesteps,
    /// Index into `schedule`
    pub step_index: usize,
    /// Current noisy latent `[1, C, t, h, w]`
    pub latent: &'a Tensor,
    /// Clean history at this stage's resolutions, oldest first
    pub history: &'a [Tensor],
    /// `[negative, positive]` prompt rows
    pub text: &'a TextBatch,
    pub guidance_scale: f64,
}

/// The polymorphic seam the sampler is written against.
pub trait PyramidDenoiser: Placeable {
    fn architecture(&self) -> Architecture;

    /// Evaluate the network with guidance and advance `latent` by one Euler step.
    fn denoise_step(&mut self, step: DenoiseStep<'_>) -> Result<Tensor>;
}

impl<T: Placeable + ?Sized> Placeable for Box<T> {
    fn place(&mut self, device: &Device) -> Result<()> {
        (**self).place(device)
    }
}

impl<T: VelocityModel + ?Sized> VelocityModel for Box<T> {
    fn forward(&mut self, samples: &[Tensor], timestep: &Tensor, text: &TextBatch) -> Result<Tensor> {
        (**self).forward(samples, timestep, text)
    }

    fn dtype(&self) -> DType {
        (**self).dtype()
    }
}

fn timestep_tensor(step: &DenoiseStep<'_>, batch: usize, dtype: DType) -> Result<Tensor> {
    let t = step.schedule.timesteps[step.step_index];
    Tensor::full(t as f32, batch, step.latent.device())?.to_dtype(dtype)
}

fn repeat_batch(x: &Tensor, dtype: DType, copies: usize) -> Result<Tensor> {
    let x = x.to_dtype(dtype)?;
    if copies == 1 {
        return Ok(x);
    }
    Tensor::cat(&vec![&x; copies], 0)
}

fn check_step(step: &DenoiseStep<'_>) -> Result<()> {
    if step.step_index >= step.schedule.len() {
        candle_core::bail!(
            "step {} outside stage {} schedule of {} steps",
            step.step_index,
            step.schedule.stage,
            step.schedule.len()
        );
    }
    if step.text.embeds.dim(0)? != 2 {
        candle_core::bail!("guidance needs [negative, positive] prompt rows");
    }
    Ok(())
}

// =========================================================================
// MMDiT: batched guidance
// =========================================================================

pub struct MmDitVariant<M> {
    model: M,
}

impl<M: VelocityModel> MmDitVariant<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

impl<M: VelocityModel> Placeable for MmDitVariant<M> {
    fn place(&mut self, device: &Device) -> Result<()> {
        self.model.place(device)
    }
}

impl<M: VelocityModel> PyramidDenoiser for MmDitVariant<M> {
    fn architecture(&self) -> Architecture {
        Architecture::PyramidMmDit
    }

    fn denoise_step(&mut self, step: DenoiseStep<'_>) -> Result<Tensor> {
        check_step(&step)?;
        let dtype = compute_dtype_or(self.model.dtype());
        let mut samples = step
            .history
            .iter()
            .map(|h| repeat_batch(h, dtype, 2))
            .collect::<Result<Vec<_>>>()?;
        samples.push(repeat_batch(step.latent, dtype, 2)?);
        let timestep = timestep_tensor(&step, 2, dtype)?;

        let v = self.model.forward(&samples, &timestep, step.text)?;
        let v_uncond = v.narrow(0, 0, 1)?;
        let v_cond = v.narrow(0, 1, 1)?;
        let guided = apply_cfg(&v_uncond, &v_cond, step.guidance_scale)?;
        step.scheduler
            .step(&guided, step.latent, step.schedule, step.step_index)
    }
}

// =========================================================================
// Flux: sequential guidance
// =========================================================================

pub struct FluxVariant<M> {
    model: M,
}

impl<M: VelocityModel> FluxVariant<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

impl<M: VelocityModel> Placeable for FluxVariant<M> {
    fn place(&mut self, device: &Device) -> Result<()> {
        self.model.place(device)
    }
}

impl<M: VelocityModel> PyramidDenoiser for FluxVariant<M> {
    fn architecture(&self) -> Architecture {
        Architecture::PyramidFlux
    }

    fn denoise_step(&mut self, step: DenoiseStep<'_>) -> Result<Tensor> {
        check_step(&step)?;
        let dtype = compute_dtype_or(self.model.dtype());
        let mut samples = step
            .history
            .iter()
            .map(|h| h.to_dtype(dtype))
            .collect::<Result<Vec<_>>>()?;
        samples.push(step.latent.to_dtype(dtype)?);
        let timestep = timestep_tensor(&step, 1, dtype)?;

        let v_uncond = self.model.forward(&samples, &timestep, &step.text.row(0)?)?;
        let v_cond = self.model.forward(&samples, &timestep, &step.text.row(1)?)?;
        let guided = apply_cfg(&v_uncond, &v_cond, step.guidance_scale)?;
        step.scheduler
            .step(&guided, step.latent, step.schedule, step.step_index)
    }
}

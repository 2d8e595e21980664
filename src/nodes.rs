//! The pipeline-stage operations: load, encode text, encode image, sample, decode.
//!
//! Each stage validates its parameters before touching a device, brings the
//! submodule it needs onto the compute device for the duration of the call and
//! evicts it afterwards unless asked to keep it resident.

use crate::conditioning::ConditioningBundle;
use crate::config::{DecodeSettings, VideoGeometry};
use crate::device::{DevicePair, place, reclaim};
use crate::error::{PhaseContext, PyramidError, Result};
use crate::latent_norm;
use crate::model::{ComponentFactory, LoadRequest, ModelHandle};
use crate::precision::AutocastScope;
use crate::provision::Provisioner;
use crate::sampler::PyramidSampler;
use crate::schedule::{LinearGuidance, StageSchedule};
use crate::text_encoder::EncodeOptions;
use crate::vae::{DecodeOptions, image_to_vae_input, vae_output_to_frames};
use candle_core::{DType, Tensor};
use tracing::{debug, info};

/// Provision weights and build a [`ModelHandle`] with every submodule offloaded.
pub fn load_model(
    request: &LoadRequest,
    provisioner: &dyn Provisioner,
    factory: &dyn ComponentFactory,
    devices: DevicePair,
) -> Result<ModelHandle> {
    ModelHandle::load(request, provisioner, factory, devices)
}

/// Encode a positive and a negative prompt, appending to `prior` when given.
pub fn encode_text(
    handle: &mut ModelHandle,
    positive: &str,
    negative: &str,
    keep_loaded: bool,
    prior: Option<&ConditioningBundle>,
) -> Result<ConditioningBundle> {
    let devices = handle.devices.clone();
    let options = EncodeOptions::default();
    info!(
        positive_chars = positive.len(),
        negative_chars = negative.len(),
        keep_loaded,
        extending = prior.is_some(),
        "encoding prompts"
    );

    let bundle = handle.text_encoder.scoped(&devices, keep_loaded, |encoder| {
        let positive = encoder.encode(positive, &options).in_phase("encoding positive prompt")?;
        let negative = encoder.encode(negative, &options).in_phase("encoding negative prompt")?;
        ConditioningBundle::new(positive, negative)
    })?;

    match prior {
        Some(prior) => ConditioningBundle::extend(prior, &bundle),
        None => Ok(bundle),
    }
}

/// Parameters of [`sample`], defaulting to the node's schema defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRequest {
    pub width: usize,
    pub height: usize,
    pub first_frame_steps: String,
    pub video_steps: String,
    pub temp: usize,
    pub guidance_scale: f64,
    pub video_guidance_scale: f64,
    pub seed: u64,
    pub keep_loaded: bool,
    pub linear_guidance: Option<LinearGuidance>,
}

impl Default for SampleRequest {
    fn default() -> Self {
        Self {
            width: 640,
            height: 384,
            first_frame_steps: "10, 10, 10".into(),
            video_steps: "10, 10, 10".into(),
            temp: 8,
            guidance_scale: 9.0,
            video_guidance_scale: 5.0,
            seed: 0,
            keep_loaded: false,
            linear_guidance: None,
        }
    }
}

impl SampleRequest {
    /// Schedule and geometry, or the first configuration error.
    pub fn validate(&self, handle: &ModelHandle) -> Result<(StageSchedule, VideoGeometry)> {
        let mut schedule = StageSchedule::parse(
            &self.first_frame_steps,
            &self.video_steps,
            self.guidance_scale,
            self.video_guidance_scale,
        )?;
        if let Some(linear) = self.linear_guidance {
            schedule = schedule.with_linear_guidance(linear);
        }
        let geometry = VideoGeometry::new(self.width, self.height, self.temp, &handle.sampler)?;
        Ok((schedule, geometry))
    }
}

/// Run the pyramidal sampler. With `seed_image_latent` the first frame is
/// taken from it and only the video schedule is used.
///
/// Returns `[1, C, temp, height / 8, width / 8]` f32 on the compute device.
pub fn sample(
    handle: &mut ModelHandle,
    bundle: &ConditioningBundle,
    request: &SampleRequest,
    seed_image_latent: Option<&Tensor>,
) -> Result<Tensor> {
    let (schedule, geometry) = request.validate(handle)?;

    let devices = handle.devices.clone();
    let precision = handle.precisions.network;
    let config = handle.sampler.clone();
    reclaim(&devices.compute).in_phase("reclaim before sampling")?;

    handle.network.scoped(&devices, request.keep_loaded, |network| {
        let _autocast = AutocastScope::enter(&devices.compute, &precision);
        let mut sampler = PyramidSampler::new(&mut **network, config, &devices.compute)?.with_progress(|p| {
            debug!(
                unit = p.unit,
                units = p.units,
                stage = p.stage,
                step = p.step + 1,
                steps = p.steps,
                "denoising"
            )
        });
        match seed_image_latent {
            Some(latent) => sampler.generate_from_image(bundle, latent, &schedule, &geometry, request.seed),
            None => sampler.generate(bundle, &schedule, &geometry, request.seed),
        }
    })
}

/// Encode an image `[B, H, W, 3]` in `[0, 1]` into a normalized seed latent `[B, C, 1, h, w]`.
pub fn encode_image(handle: &mut ModelHandle, image: &Tensor) -> Result<Tensor> {
    let dims = image.dims();
    if dims.len() != 4 || dims[3] != 3 {
        return Err(PyramidError::ShapeMismatch {
            field: "image",
            existing: vec![0, 0, 0, 3],
            incoming: dims.to_vec(),
        });
    }
    let devices = handle.devices.clone();
    info!(shape = ?dims, "encoding image");
    reclaim(&devices.compute).in_phase("reclaim before image encode")?;

    handle.vae.scoped(&devices, false, |vae| {
        let pixels = image_to_vae_input(image, vae.dtype(), &devices.compute).in_phase("image preprocessing")?;
        let raw = vae.encode(&pixels).in_phase("vae encode")?;
        raw.to_dtype(DType::F32)
            .and_then(|raw| latent_norm::encode_output(&raw))
            .in_phase("latent normalization")
    })
}

/// Decode sampler latents to frames `[(B*T), H, W, 3]` f32 in `[0, 1]` on the host.
pub fn decode(handle: &mut ModelHandle, latent: &Tensor, tile_size: usize, window_size: usize) -> Result<Tensor> {
    let settings = DecodeSettings::new(tile_size, window_size)?;
    if latent.rank() != 5 {
        return Err(PyramidError::ShapeMismatch {
            field: "latent",
            existing: vec![1, handle.sampler.latent_channels, 0, 0, 0],
            incoming: latent.dims().to_vec(),
        });
    }
    let devices = handle.devices.clone();
    let options = DecodeOptions::from(settings);
    info!(shape = ?latent.dims(), tile_size, window_size, "decoding latents");
    reclaim(&devices.compute).in_phase("reclaim before decode")?;

    let frames = handle.vae.scoped(&devices, false, |vae| {
        let dtype = vae.dtype();
        let input = latent
            .to_dtype(DType::F32)
            .and_then(|x| latent_norm::decode_input(&x))
            .and_then(|x| x.to_dtype(dtype))
            .and_then(|x| place(&x, &devices.compute))
            .in_phase("latent normalization")?;
        let video = vae.decode(&input, &options).in_phase("vae decode")?;
        vae_output_to_frames(&video).in_phase("frame postprocessing")
    })?;
    reclaim(&devices.compute).in_phase("reclaim after decode")?;
    Ok(frames)
}

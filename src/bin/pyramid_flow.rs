//! Pyramid-flow text-to-video / image-to-video CLI
//!
//! Chains the pipeline stages: load, encode prompts, optionally encode a seed
//! image, sample and decode. Latents are written as a raw tensor file and
//! frames as PNG images.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin pyramid-flow -- \
//!     --prompt "a cat walking on grass" \
//!     --model-dir ./models/pyramidflow \
//!     --temp 8 --output output
//! ```
//!
//! `--mock` runs every submodule as a deterministic stand-in and needs no files.

use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use pyramid_flow::{
    DevicePair, LoadRequest, ModelId, ResolutionVariant, SampleRequest, decode, encode_image, encode_text,
    frames::{load_image, save_frames},
    latents_bin::write_tensor,
    load_model,
    mock::MockFactory,
    model::{CheckpointTextEncoder, ComponentFactory},
    provision::{HubProvisioner, LocalProvisioner, ProvisionError, Provisioner},
    sample,
    schedule::LinearGuidance,
    vae::channel_means,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate videos with pyramidal flow matching")]
struct Args {
    /// Text prompt describing the video
    #[arg(short, long, default_value = "hyper quality, Ultra HD, 8K")]
    prompt: String,

    /// Negative prompt for classifier-free guidance
    #[arg(long, default_value = "")]
    negative_prompt: String,

    /// Further prompts, each appended as a later segment of the video
    #[arg(long = "then")]
    next_prompts: Vec<String>,

    /// Hub model id
    #[arg(long, default_value = "rain1011/pyramid-flow-sd3")]
    model: String,

    /// Transformer resolution variant
    #[arg(long, default_value = "diffusion_transformer_384p")]
    variant: String,

    /// Directory holding `<repo-name>/<variant>` checkpoints. Only the text
    /// encoder weights are read; the network and VAE are deterministic stand-ins
    #[arg(long, default_value = "models/pyramidflow")]
    model_dir: PathBuf,

    /// Never download; fail when the checkpoint is not in --model-dir. The
    /// checkpoint only supplies text encoder weights
    #[arg(long)]
    offline: bool,

    #[arg(long, default_value = "bf16")]
    model_dtype: String,

    #[arg(long, default_value = "bf16")]
    text_encoder_dtype: String,

    #[arg(long, default_value = "bf16")]
    vae_dtype: String,

    /// 8-bit matmuls for fp8 weights
    #[arg(long)]
    fp8_fastmode: bool,

    #[arg(long, default_value_t = 640)]
    width: usize,

    #[arg(long, default_value_t = 384)]
    height: usize,

    /// Steps per stage for the first frame
    #[arg(long, default_value = "10, 10, 10")]
    first_frame_steps: String,

    /// Steps per stage for later frames
    #[arg(long, default_value = "10, 10, 10")]
    video_steps: String,

    /// Latent frames to generate
    #[arg(long, default_value_t = 8)]
    temp: usize,

    #[arg(long, default_value_t = 9.0)]
    guidance_scale: f64,

    #[arg(long, default_value_t = 5.0)]
    video_guidance_scale: f64,

    /// Decay guidance linearly over time units
    #[arg(long)]
    linear_guidance: bool,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Keep network and text encoder on the compute device between stages
    #[arg(long)]
    keep_loaded: bool,

    /// Seed image (PNG or JPEG), resized to --width x --height
    #[arg(long)]
    input_image: Option<PathBuf>,

    #[arg(long, default_value_t = 256)]
    tile_size: usize,

    #[arg(long, default_value_t = 2)]
    window_size: usize,

    /// Output directory for latents.bin and the PNG frames
    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// Use CPU even when an accelerator is available
    #[arg(long)]
    cpu: bool,

    /// Deterministic stand-ins for every submodule (no weights needed)
    #[arg(long)]
    mock: bool,
}

/// Serves a fixed directory without looking at it.
struct FixedRoot(PathBuf);

impl Provisioner for FixedRoot {
    fn provision(&self, _model: ModelId, _variant: ResolutionVariant) -> Result<PathBuf, ProvisionError> {
        Ok(self.0.clone())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("pyramid_flow=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let request = LoadRequest::parse(
        &args.model,
        &args.variant,
        &args.model_dtype,
        &args.text_encoder_dtype,
        &args.vae_dtype,
        args.fp8_fastmode,
    )
    .context("invalid model arguments")?;

    let devices = if args.mock { DevicePair::cpu() } else { DevicePair::auto(args.cpu) };

    let (provisioner, factory): (Box<dyn Provisioner>, Box<dyn ComponentFactory>) = if args.mock {
        info!("Running in mock mode (no weights)");
        (Box::new(FixedRoot(args.model_dir.clone())), Box::new(MockFactory::default()))
    } else {
        warn!("network and VAE backends are deterministic stand-ins; only the text encoder reads weights");
        let provisioner: Box<dyn Provisioner> = if args.offline {
            Box::new(LocalProvisioner {
                root: args.model_dir.clone(),
            })
        } else {
            Box::new(HubProvisioner::new(&args.model_dir))
        };
        (
            provisioner,
            Box::new(CheckpointTextEncoder {
                inner: MockFactory::default(),
            }),
        )
    };

    let mut handle =
        load_model(&request, provisioner.as_ref(), factory.as_ref(), devices).context("failed to load model")?;

    let mut bundle = encode_text(&mut handle, &args.prompt, &args.negative_prompt, args.keep_loaded, None)
        .context("failed to encode prompt")?;
    for prompt in &args.next_prompts {
        bundle = encode_text(&mut handle, prompt, &args.negative_prompt, args.keep_loaded, Some(&bundle))
            .context("failed to encode follow-up prompt")?;
    }
    info!(segments = bundle.sequence_count(), "prompts encoded");

    let seed_latent = match &args.input_image {
        Some(path) => {
            let image = load_image(path, args.width, args.height, &Device::Cpu)
                .with_context(|| format!("reading {}", path.display()))?;
            Some(encode_image(&mut handle, &image).context("failed to encode seed image")?)
        }
        None => None,
    };

    let sample_request = SampleRequest {
        width: args.width,
        height: args.height,
        first_frame_steps: args.first_frame_steps.clone(),
        video_steps: args.video_steps.clone(),
        temp: args.temp,
        guidance_scale: args.guidance_scale,
        video_guidance_scale: args.video_guidance_scale,
        seed: args.seed,
        keep_loaded: args.keep_loaded,
        linear_guidance: args.linear_guidance.then(LinearGuidance::default),
    };
    let latent = sample(&mut handle, &bundle, &sample_request, seed_latent.as_ref()).context("sampling failed")?;
    info!(shape = ?latent.dims(), "sampling complete");

    let frames = decode(&mut handle, &latent, args.tile_size, args.window_size).context("decoding failed")?;
    info!(shape = ?frames.dims(), means = ?channel_means(&frames)?, "decoded frames");

    write_outputs(&args.output, &latent, &frames)?;
    info!("Generation complete!");
    Ok(())
}

fn write_outputs(dir: &Path, latent: &candle_core::Tensor, frames: &candle_core::Tensor) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let latent_path = dir.join("latents.bin");
    write_tensor(&latent_path, latent).with_context(|| format!("writing {}", latent_path.display()))?;
    let written = save_frames(frames, dir).with_context(|| format!("saving frames to {}", dir.display()))?;
    info!(latents = %latent_path.display(), frames = written.len(), "outputs written");
    info!(
        "To create a video, run: ffmpeg -framerate 24 -i {}/frame_%04d.png -c:v libx264 -pix_fmt yuv420p output.mp4",
        dir.display()
    );
    Ok(())
}

//! Pyramid-flow: pyramidal flow-matching text-to-video and image-to-video on Candle.
//!
//! The crate exposes the pipeline stages in [`nodes`]: `load_model`,
//! `encode_text`, `encode_image`, `sample` and `decode`. The generative
//! network, text encoder and VAE sit behind traits so the orchestration can be
//! driven by real checkpoints or by the deterministic stand-ins in [`mock`].

pub mod conditioning;
pub mod config;
pub mod denoiser;
pub mod device;
pub mod error;
pub mod frames;
pub mod latent_norm;
pub mod latents_bin;
pub mod loader;
pub mod mock;
pub mod model;
pub mod nodes;
pub mod noise;
pub mod precision;
pub mod provision;
pub mod pyramid;
pub mod sampler;
pub mod schedule;
pub mod scheduler;
pub mod text_encoder;
pub mod vae;

pub use conditioning::{ConditioningBundle, PromptEmbeds};
pub use config::{ModelId, ResolutionVariant, SamplerConfig};
pub use device::DevicePair;
pub use error::{PyramidError, Result};
pub use model::{LoadRequest, ModelHandle};
pub use nodes::{SampleRequest, decode, encode_image, encode_text, load_model, sample};
pub use precision::PrecisionTag;

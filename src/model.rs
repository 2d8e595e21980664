//! The long-lived model handle and the factory that builds its submodules.

use crate::config::{Architecture, ConfigError, ModelId, ResolutionVariant, SamplerConfig};
use crate::denoiser::{FluxVariant, MmDitVariant, PyramidDenoiser, VelocityModel};
use crate::device::{DevicePair, Resident};
use crate::error::Result;
use crate::loader::ModelLayout;
use crate::precision::{ComputePrecision, PrecisionTag, resolve_component_precision, resolve_precision};
use crate::provision::Provisioner;
use crate::text_encoder::{ClipT5TextEncoder, PromptEncoder};
use crate::vae::VideoAutoencoder;
use candle_core::Device;
use std::path::PathBuf;
use tracing::{info, warn};

/// Arguments of `load_model`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub model: ModelId,
    pub variant: ResolutionVariant,
    pub weight_precision: PrecisionTag,
    pub text_encoder_precision: PrecisionTag,
    pub transform_precision: PrecisionTag,
    /// Use 8-bit matmuls where the network backend supports them
    pub fast_mode: bool,
}

impl LoadRequest {
    pub fn new(model: ModelId, variant: ResolutionVariant) -> Self {
        Self {
            model,
            variant,
            weight_precision: PrecisionTag::Bf16,
            text_encoder_precision: PrecisionTag::Bf16,
            transform_precision: PrecisionTag::Bf16,
            fast_mode: false,
        }
    }

    /// Parse every field from its string form.
    pub fn parse(
        model: &str,
        variant: &str,
        weight_precision: &str,
        text_encoder_precision: &str,
        transform_precision: &str,
        fast_mode: bool,
    ) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            model: model.parse()?,
            variant: variant.parse()?,
            weight_precision: weight_precision.parse()?,
            text_encoder_precision: text_encoder_precision.parse()?,
            transform_precision: transform_precision.parse()?,
            fast_mode,
        })
    }
}

/// Resolved precision of each submodule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precisions {
    pub network: ComputePrecision,
    pub text_encoder: ComputePrecision,
    pub transform: ComputePrecision,
}

impl Precisions {
    /// 8-bit storage is only accepted for the generative network.
    pub fn resolve(request: &LoadRequest) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            network: resolve_precision(request.weight_precision),
            text_encoder: resolve_component_precision("text encoder", request.text_encoder_precision)?,
            transform: resolve_component_precision("vae", request.transform_precision)?,
        })
    }
}

/// Residency flags of the three submodules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Residency {
    pub network: bool,
    pub text_encoder: bool,
    pub transform: bool,
}

/// Builds the submodules of a handle on the offload device.
pub trait ComponentFactory {
    /// Whether the checkpoint directories must exist on disk.
    fn needs_checkpoint(&self) -> bool {
        true
    }

    fn network(
        &self,
        layout: &ModelLayout,
        precision: &ComputePrecision,
        fast_mode: bool,
        device: &Device,
    ) -> Result<Box<dyn VelocityModel>>;

    fn text_encoder(
        &self,
        layout: &ModelLayout,
        precision: &ComputePrecision,
        device: &Device,
    ) -> Result<Box<dyn PromptEncoder>>;

    fn autoencoder(
        &self,
        layout: &ModelLayout,
        precision: &ComputePrecision,
        device: &Device,
    ) -> Result<Box<dyn VideoAutoencoder>>;
}

/// Text encoder read from the checkpoint, network and VAE from `inner`.
pub struct CheckpointTextEncoder<F> {
    pub inner: F,
}

impl<F: ComponentFactory> ComponentFactory for CheckpointTextEncoder<F> {
    fn network(
        &self,
        layout: &ModelLayout,
        precision: &ComputePrecision,
        fast_mode: bool,
        device: &Device,
    ) -> Result<Box<dyn VelocityModel>> {
        self.inner.network(layout, precision, fast_mode, device)
    }

    fn text_encoder(
        &self,
        layout: &ModelLayout,
        precision: &ComputePrecision,
        device: &Device,
    ) -> Result<Box<dyn PromptEncoder>> {
        let encoder = ClipT5TextEncoder::load(layout, precision.compute, device)?;
        Ok(Box::new(encoder))
    }

    fn autoencoder(
        &self,
        layout: &ModelLayout,
        precision: &ComputePrecision,
        device: &Device,
    ) -> Result<Box<dyn VideoAutoencoder>> {
        self.inner.autoencoder(layout, precision, device)
    }
}

/// Owner of the network, text encoder and VAE for a pipeline session.
pub struct ModelHandle {
    pub(crate) model: ModelId,
    pub(crate) variant: ResolutionVariant,
    pub(crate) root: PathBuf,
    pub(crate) network: Resident<Box<dyn PyramidDenoiser>>,
    pub(crate) text_encoder: Resident<Box<dyn PromptEncoder>>,
    pub(crate) vae: Resident<Box<dyn VideoAutoencoder>>,
    pub(crate) precisions: Precisions,
    pub(crate) devices: DevicePair,
    pub(crate) sampler: SamplerConfig,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model", &self.model)
            .field("variant", &self.variant)
            .field("root", &self.root)
            .field("precisions", &self.precisions)
            .field("devices", &self.devices)
            .field("sampler", &self.sampler)
            .finish_non_exhaustive()
    }
}

impl ModelHandle {
    /// Provision weights and build every submodule; no handle on any failure.
    pub fn load(
        request: &LoadRequest,
        provisioner: &dyn Provisioner,
        factory: &dyn ComponentFactory,
        devices: DevicePair,
    ) -> Result<Self> {
        let precisions = Precisions::resolve(request)?;
        let architecture = request.model.architecture();
        if request.fast_mode && !request.weight_precision.is_fp8() {
            warn!(precision = %request.weight_precision, "fast mode only applies to 8-bit weights");
        }
        info!(
            model = %request.model,
            variant = %request.variant,
            architecture = architecture.name(),
            network = %precisions.network.tag,
            text_encoder = %precisions.text_encoder.tag,
            vae = %precisions.transform.tag,
            "loading model"
        );

        let root = provisioner.provision(request.model, request.variant)?;
        let layout = if factory.needs_checkpoint() {
            ModelLayout::resolve(&root, architecture, request.variant)?
        } else {
            ModelLayout::expected(&root, architecture, request.variant)
        };

        let offload = &devices.offload;
        let velocity = factory.network(&layout, &precisions.network, request.fast_mode, offload)?;
        let denoiser: Box<dyn PyramidDenoiser> = match architecture {
            Architecture::PyramidMmDit => Box::new(MmDitVariant::new(velocity)),
            Architecture::PyramidFlux => Box::new(FluxVariant::new(velocity)),
        };
        let text_encoder = factory.text_encoder(&layout, &precisions.text_encoder, offload)?;
        let vae = factory.autoencoder(&layout, &precisions.transform, offload)?;
        info!(root = %root.display(), "model loaded");

        Ok(Self {
            model: request.model,
            variant: request.variant,
            root,
            network: Resident::offloaded("network", denoiser),
            text_encoder: Resident::offloaded("text encoder", text_encoder),
            vae: Resident::offloaded("vae", vae),
            precisions,
            devices,
            sampler: SamplerConfig::default(),
        })
    }

    pub fn model_id(&self) -> ModelId {
        self.model
    }

    pub fn variant(&self) -> ResolutionVariant {
        self.variant
    }

    pub fn architecture(&self) -> Architecture {
        self.network.module().architecture()
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn precisions(&self) -> &Precisions {
        &self.precisions
    }

    pub fn devices(&self) -> &DevicePair {
        &self.devices
    }

    pub fn sampler_config(&self) -> &SamplerConfig {
        &self.sampler
    }

    pub fn with_sampler_config(mut self, config: SamplerConfig) -> Self {
        self.sampler = config;
        self
    }

    pub fn residency(&self) -> Residency {
        Residency {
            network: self.network.is_resident(),
            text_encoder: self.text_encoder.is_resident(),
            transform: self.vae.is_resident(),
        }
    }

    /// Move every submodule to the offload device.
    pub fn offload_all(&mut self) -> Result<()> {
        self.network.evict(&self.devices)?;
        self.text_encoder.evict(&self.devices)?;
        self.vae.evict(&self.devices)
    }
}

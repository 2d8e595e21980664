//! Error taxonomy for the pyramid-flow operations.
//!
//! Tensor-level helpers return [`candle_core::Result`]; every operation exposed
//! to the pipeline host returns [`Result`] with a [`PyramidError`]. Accelerator
//! out-of-memory failures are reclassified as [`PyramidError::ResourceExhausted`]
//! when they cross that boundary.

use crate::config::ConfigError;
use crate::loader::LoaderError;
use crate::provision::ProvisionError;
use crate::schedule::ScheduleError;
use crate::text_encoder::TextEncoderError;

/// Result alias used by the pipeline-stage operations.
pub type Result<T> = std::result::Result<T, PyramidError>;

#[derive(Debug, thiserror::Error)]
pub enum PyramidError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("shape mismatch in {field}: {existing:?} vs {incoming:?}")]
    ShapeMismatch {
        field: &'static str,
        existing: Vec<usize>,
        incoming: Vec<usize>,
    },

    #[error("accelerator memory exhausted during {phase}")]
    ResourceExhausted {
        phase: String,
        #[source]
        source: candle_core::Error,
    },

    #[error("weight provisioning failed: {0}")]
    Provisioning(#[from] ProvisionError),

    #[error("weight loading failed: {0}")]
    Loader(#[from] LoaderError),

    #[error("text encoder failed: {0}")]
    TextEncoder(#[from] TextEncoderError),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl PyramidError {
    /// True for errors caused by caller input, raised before any device work.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Schedule(_))
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }

    /// Wrap a candle error raised in `phase`, promoting out-of-memory failures.
    pub fn from_candle(phase: impl Into<String>, err: candle_core::Error) -> Self {
        if is_out_of_memory(&err) {
            Self::ResourceExhausted {
                phase: phase.into(),
                source: err,
            }
        } else {
            Self::Candle(err)
        }
    }

    /// Re-run the out-of-memory check on candle errors nested in submodule
    /// errors, attributing them to `phase`.
    pub fn classify(self, phase: &str) -> Self {
        match self {
            Self::Candle(err)
            | Self::TextEncoder(TextEncoderError::Candle(err))
            | Self::Loader(LoaderError::Candle(err)) => Self::from_candle(phase, err),
            other => other,
        }
    }
}

/// Detect accelerator allocation failures from the error text.
///
/// CUDA reports `CUDA_ERROR_OUT_OF_MEMORY`, Metal reports failed buffer
/// allocations; candle surfaces both only as formatted messages.
pub fn is_out_of_memory(err: &candle_core::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("out of memory")
        || msg.contains("out_of_memory")
        || msg.contains("failed to allocate")
}

/// Extension to tag a candle result with the phase it ran in.
pub trait PhaseContext<T> {
    fn in_phase(self, phase: &str) -> Result<T>;
}

impl<T> PhaseContext<T> for candle_core::Result<T> {
    fn in_phase(self, phase: &str) -> Result<T> {
        self.map_err(|e| PyramidError::from_candle(phase, e))
    }
}

impl<T> PhaseContext<T> for Result<T> {
    fn in_phase(self, phase: &str) -> Result<T> {
        self.map_err(|e| e.classify(phase))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oom_is_promoted() {
        let err = candle_core::Error::Msg("DriverError(CUDA_ERROR_OUT_OF_MEMORY, \"out of memory\")".into());
        let wrapped = PyramidError::from_candle("stage 2", err);
        assert!(wrapped.is_resource_exhausted());
        assert!(wrapped.to_string().contains("stage 2"));
    }

    #[test]
    fn test_nested_oom_is_promoted() {
        let oom = || candle_core::Error::Msg("CUDA_ERROR_OUT_OF_MEMORY: out of memory".into());
        let from_encoder = PyramidError::TextEncoder(TextEncoderError::Candle(oom())).classify("t5 forward");
        assert!(from_encoder.is_resource_exhausted());
        assert!(from_encoder.to_string().contains("t5 forward"));

        let from_loader: Result<()> = Err(PyramidError::Loader(LoaderError::Candle(oom())));
        assert!(from_loader.in_phase("loading").unwrap_err().is_resource_exhausted());

        let unrelated = PyramidError::TextEncoder(TextEncoderError::Tokenizer("bad vocab".into())).classify("encode");
        assert!(matches!(unrelated, PyramidError::TextEncoder(TextEncoderError::Tokenizer(_))));
    }

    #[test]
    fn test_other_candle_errors_pass_through() {
        let err = candle_core::Error::Msg("shape mismatch in add".into());
        let wrapped = PyramidError::from_candle("decode", err);
        assert!(matches!(wrapped, PyramidError::Candle(_)));
        assert!(!wrapped.is_configuration());
    }
}

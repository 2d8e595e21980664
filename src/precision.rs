//! Numeric precision policy: tag vocabulary, compute resolution and autocast scopes.

use crate::config::ConfigError;
use candle_core::{DType, Device};
use std::cell::Cell;
use std::fmt;
use std::str::FromStr;

/// Precision tags accepted by `load_model`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrecisionTag {
    Fp8E4m3fn,
    Fp8E5m2,
    Fp16,
    Fp32,
    Bf16,
}

impl PrecisionTag {
    pub const ALL: [PrecisionTag; 5] = [
        PrecisionTag::Fp8E4m3fn,
        PrecisionTag::Fp8E5m2,
        PrecisionTag::Fp16,
        PrecisionTag::Fp32,
        PrecisionTag::Bf16,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PrecisionTag::Fp8E4m3fn => "fp8_e4m3fn",
            PrecisionTag::Fp8E5m2 => "fp8_e5m2",
            PrecisionTag::Fp16 => "fp16",
            PrecisionTag::Fp32 => "fp32",
            PrecisionTag::Bf16 => "bf16",
        }
    }

    pub fn is_fp8(&self) -> bool {
        matches!(self, PrecisionTag::Fp8E4m3fn | PrecisionTag::Fp8E5m2)
    }

}

impl fmt::Display for PrecisionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrecisionTag {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        PrecisionTag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownPrecision(s.to_string()))
    }
}

/// A precision tag resolved to what the compute path actually uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputePrecision {
    pub tag: PrecisionTag,
    /// Dtype activations are computed in
    pub compute: DType,
    /// Dtype for the autocast scope, `None` when running in full precision
    pub autocast: Option<DType>,
}

/// Map a precision tag to its compute precision.
///
/// 8-bit tags are storage-only and compute in bfloat16.
pub fn resolve_precision(tag: PrecisionTag) -> ComputePrecision {
    let compute = match tag {
        PrecisionTag::Fp8E4m3fn | PrecisionTag::Fp8E5m2 | PrecisionTag::Bf16 => DType::BF16,
        PrecisionTag::Fp16 => DType::F16,
        PrecisionTag::Fp32 => DType::F32,
    };
    let autocast = (compute != DType::F32).then_some(compute);
    ComputePrecision {
        tag,
        compute,
        autocast,
    }
}

/// Resolve a tag for a submodule that cannot store 8-bit weights.
pub fn resolve_component_precision(
    component: &'static str,
    tag: PrecisionTag,
) -> Result<ComputePrecision, ConfigError> {
    if tag.is_fp8() {
        return Err(ConfigError::PrecisionNotAllowed {
            component,
            tag: tag.to_string(),
        });
    }
    Ok(resolve_precision(tag))
}

// =========================================================================
// Autocast scope
// =========================================================================

thread_local! {
    static AUTOCAST: Cell<Option<DType>> = const { Cell::new(None) };
}

/// Dtype of the innermost active autocast scope on this thread.
pub fn current_autocast() -> Option<DType> {
    AUTOCAST.with(|c| c.get())
}

/// Dtype a submodule should compute in: the active autocast dtype, else `fallback`.
pub fn compute_dtype_or(fallback: DType) -> DType {
    current_autocast().unwrap_or(fallback)
}

/// Guard for a mixed-precision region. The previous state is restored on drop,
/// also when the wrapped code returns early with an error.
#[must_use = "the autocast scope ends when the guard is dropped"]
pub struct AutocastScope {
    previous: Option<DType>,
    active: bool,
}

impl AutocastScope {
    /// No-op scope when `precision` runs in full precision.
    pub fn enter(device: &Device, precision: &ComputePrecision) -> Self {
        let previous = current_autocast();
        match precision.autocast {
            Some(dtype) => {
                tracing::trace!(?dtype, device = ?device.location(), "enter autocast");
                AUTOCAST.with(|c| c.set(Some(dtype)));
                Self {
                    previous,
                    active: true,
                }
            }
            None => Self {
                previous,
                active: false,
            },
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for AutocastScope {
    fn drop(&mut self) {
        if self.active {
            AUTOCAST.with(|c| c.set(self.previous));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_tags() {
        for tag in PrecisionTag::ALL {
            assert_eq!(tag.as_str().parse::<PrecisionTag>().unwrap(), tag);
        }
        assert!(matches!(
            "fp64".parse::<PrecisionTag>(),
            Err(ConfigError::UnknownPrecision(_))
        ));
    }

    #[test]
    fn test_fp8_computes_in_bf16() {
        for tag in [PrecisionTag::Fp8E4m3fn, PrecisionTag::Fp8E5m2] {
            let p = resolve_precision(tag);
            assert_eq!(p.compute, DType::BF16);
            assert_eq!(p.autocast, Some(DType::BF16));
        }
        assert_eq!(resolve_precision(PrecisionTag::Fp16).autocast, Some(DType::F16));
        assert_eq!(resolve_precision(PrecisionTag::Fp32).autocast, None);
    }

    #[test]
    fn test_component_rejects_fp8() {
        assert!(resolve_component_precision("vae", PrecisionTag::Fp8E5m2).is_err());
        assert!(resolve_component_precision("vae", PrecisionTag::Bf16).is_ok());
    }

    #[test]
    fn test_autocast_nesting_restores() {
        let device = Device::Cpu;
        let bf16 = resolve_precision(PrecisionTag::Bf16);
        let fp16 = resolve_precision(PrecisionTag::Fp16);
        let fp32 = resolve_precision(PrecisionTag::Fp32);

        assert_eq!(current_autocast(), None);
        {
            let outer = AutocastScope::enter(&device, &bf16);
            assert!(outer.is_active());
            assert_eq!(current_autocast(), Some(DType::BF16));
            {
                let _inner = AutocastScope::enter(&device, &fp16);
                assert_eq!(current_autocast(), Some(DType::F16));
                let noop = AutocastScope::enter(&device, &fp32);
                assert!(!noop.is_active());
                assert_eq!(current_autocast(), Some(DType::F16));
            }
            assert_eq!(current_autocast(), Some(DType::BF16));
        }
        assert_eq!(current_autocast(), None);
    }

    #[test]
    fn test_autocast_exits_on_error() {
        let device = Device::Cpu;
        let bf16 = resolve_precision(PrecisionTag::Bf16);
        let run = || -> Result<(), &'static str> {
            let _scope = AutocastScope::enter(&device, &bf16);
            assert_eq!(compute_dtype_or(DType::F32), DType::BF16);
            Err("failed inside scope")
        };
        let result = run();
        assert!(result.is_err());
        assert_eq!(compute_dtype_or(DType::F32), DType::F32);
    }
}

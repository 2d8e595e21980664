//! Device placement policy: compute/offload device pair, per-submodule
//! residency tracking and memory reclaim points.

use crate::error::{PhaseContext, Result};
use candle_core::{Device, Tensor};
use tracing::{debug, info, warn};

/// Accelerator used for compute and the device weights are evicted to.
#[derive(Debug, Clone)]
pub struct DevicePair {
    pub compute: Device,
    pub offload: Device,
}

impl DevicePair {
    pub fn new(compute: Device, offload: Device) -> Self {
        Self { compute, offload }
    }

    /// Everything on the CPU. Placement becomes a no-op transfer.
    pub fn cpu() -> Self {
        Self::new(Device::Cpu, Device::Cpu)
    }

    /// First CUDA device, then Metal, then CPU; offload always goes to the CPU.
    pub fn auto(force_cpu: bool) -> Self {
        if force_cpu {
            info!("Using CPU");
            return Self::cpu();
        }
        match Device::cuda_if_available(0) {
            Ok(device) if device.is_cuda() => {
                info!("Using CUDA device 0");
                return Self::new(device, Device::Cpu);
            }
            Ok(_) => {}
            Err(e) => warn!("CUDA not available: {}, trying Metal", e),
        }
        match Device::metal_if_available(0) {
            Ok(device) if device.is_metal() => {
                info!("Using Metal device 0");
                Self::new(device, Device::Cpu)
            }
            _ => {
                info!("No accelerator found, using CPU");
                Self::cpu()
            }
        }
    }
}

/// A submodule that can move its weights between devices.
pub trait Placeable {
    fn place(&mut self, device: &Device) -> candle_core::Result<()>;
}

/// Move a tensor, synchronously, to `device`.
pub fn place(tensor: &Tensor, device: &Device) -> candle_core::Result<Tensor> {
    tensor.to_device(device)
}

/// Give the accelerator runtime a chance to release freed buffers.
pub fn reclaim(device: &Device) -> candle_core::Result<()> {
    debug!(device = ?device.location(), "reclaiming device memory");
    device.synchronize()
}

/// Submodule wrapper carrying its residency flag.
///
/// The flag only changes after a transfer succeeded, so after any error it
/// still states where the weights are.
pub struct Resident<M> {
    name: &'static str,
    module: M,
    resident: bool,
}

impl<M: Placeable> Resident<M> {
    /// Wrap a module whose weights currently live on the offload device.
    pub fn offloaded(name: &'static str, module: M) -> Self {
        Self {
            name,
            module,
            resident: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_resident(&self) -> bool {
        self.resident
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut M {
        &mut self.module
    }

    /// Ensure the weights are on the compute device.
    pub fn load(&mut self, devices: &DevicePair) -> Result<()> {
        if self.resident {
            return Ok(());
        }
        self.module
            .place(&devices.compute)
            .in_phase(&format!("loading {}", self.name))?;
        self.resident = true;
        debug!(module = self.name, device = ?devices.compute.location(), "module resident");
        Ok(())
    }

    /// Move the weights to the offload device.
    pub fn evict(&mut self, devices: &DevicePair) -> Result<()> {
        if !self.resident {
            return Ok(());
        }
        self.module
            .place(&devices.offload)
            .in_phase(&format!("offloading {}", self.name))?;
        self.resident = false;
        debug!(module = self.name, device = ?devices.offload.location(), "module offloaded");
        Ok(())
    }

    /// Load, run `f`, then evict unless `keep_loaded`.
    ///
    /// Eviction also happens when `f` fails; the error from `f` wins over an
    /// eviction error.
    pub fn scoped<T>(
        &mut self,
        devices: &DevicePair,
        keep_loaded: bool,
        f: impl FnOnce(&mut M) -> Result<T>,
    ) -> Result<T> {
        self.load(devices)?;
        let outcome = f(&mut self.module);
        if keep_loaded {
            return outcome;
        }
        match (outcome, self.evict(devices)) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(evict_err)) => Err(evict_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(evict_err)) => {
                warn!(module = self.name, error = %evict_err, "offload after failure also failed");
                Err(err)
            }
        }
    }
}

//! Compute devices and runtime device selection.

pub mod cpu;

use serde::{Deserialize, Serialize};

use crate::buffer::{BufferDesc, BufferId, HostData};
use crate::error::{EngineError, EngineResult};
use crate::kernels::Kernel;

pub use cpu::CpuDevice;

/// Environment variable overriding device selection (`cpu`, `wgpu`, `auto`).
pub const DEVICE_ENV: &str = "GLLM_DEVICE";

/// An accelerator that owns device copies of registry buffers and runs kernels.
///
/// Every call is blocking: when `launch` returns, the kernel has completed and
/// its writes are visible to the next launch and to `download`.
pub trait ComputeDevice: Send {
    fn name(&self) -> &str;

    /// Reserve device storage for `id`. Contents are unspecified until uploaded or written.
    fn allocate(&mut self, id: BufferId, desc: &BufferDesc) -> EngineResult<()>;

    fn upload(&mut self, id: BufferId, data: &HostData) -> EngineResult<()>;

    fn download(&mut self, id: BufferId, data: &mut HostData) -> EngineResult<()>;

    /// Compile or look up whatever the kernel needs ahead of its first launch.
    fn prepare(&mut self, _kernel: &Kernel) -> EngineResult<()> {
        Ok(())
    }

    fn launch(&mut self, kernel: &Kernel) -> EngineResult<()>;

    /// Wait for all submitted work.
    fn synchronize(&mut self) -> EngineResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Wgpu,
    /// WGPU when an adapter is available, otherwise CPU.
    #[default]
    Auto,
}

impl DeviceKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Wgpu => "WGPU",
            Self::Auto => "auto",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cpu" => Some(Self::Cpu),
            "wgpu" | "gpu" => Some(Self::Wgpu),
            "auto" | "" => Some(Self::Auto),
            _ => None,
        }
    }

    /// Read [`DEVICE_ENV`]; unset or unrecognised values mean `Auto`.
    pub fn from_env() -> Self {
        match std::env::var(DEVICE_ENV) {
            Ok(value) => Self::parse(&value).unwrap_or_else(|| {
                log::warn!("Ignoring unrecognised {DEVICE_ENV}={value:?}, using auto");
                Self::Auto
            }),
            Err(_) => Self::Auto,
        }
    }
}

/// Instantiate the requested device.
///
/// `Wgpu` fails when no adapter is available; `Auto` falls back to the CPU device.
pub fn select_device(kind: DeviceKind) -> EngineResult<Box<dyn ComputeDevice>> {
    match kind {
        DeviceKind::Cpu => {
            log::info!("Using CPU SPMD device");
            Ok(Box::new(CpuDevice::new()))
        }
        DeviceKind::Wgpu => wgpu_device(),
        DeviceKind::Auto => match wgpu_device() {
            Ok(device) => Ok(device),
            Err(e) => {
                log::warn!("WGPU device unavailable ({e}), falling back to CPU");
                Ok(Box::new(CpuDevice::new()))
            }
        },
    }
}

#[cfg(feature = "wgpu")]
fn wgpu_device() -> EngineResult<Box<dyn ComputeDevice>> {
    let device = crate::wgpu_kernels::WgpuDevice::new()?;
    log::info!("Using WGPU device: {}", device.name());
    Ok(Box::new(device))
}

#[cfg(not(feature = "wgpu"))]
fn wgpu_device() -> EngineResult<Box<dyn ComputeDevice>> {
    Err(EngineError::Unsupported(
        "built without the `wgpu` feature".to_string(),
    ))
}

/// Check a kernel's bindings against the device's allocation lengths.
pub(crate) fn check_bindings(
    kernel: &Kernel,
    len_of: impl Fn(BufferId) -> Option<usize>,
) -> EngineResult<()> {
    for binding in kernel.bindings() {
        let actual = len_of(binding.buffer).ok_or(EngineError::UnknownBuffer(binding.buffer.0))?;
        if actual < binding.min_len {
            return Err(EngineError::Bounds {
                buffer: format!("#{}", binding.buffer.0),
                kernel: kernel.name().to_string(),
                required: binding.min_len,
                actual,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_device_names() {
        assert_eq!(DeviceKind::parse("CPU"), Some(DeviceKind::Cpu));
        assert_eq!(DeviceKind::parse(" wgpu "), Some(DeviceKind::Wgpu));
        assert_eq!(DeviceKind::parse(""), Some(DeviceKind::Auto));
        assert_eq!(DeviceKind::parse("tpu"), None);
    }

    #[test]
    fn cpu_is_always_selectable() {
        let device = select_device(DeviceKind::Cpu).unwrap();
        assert_eq!(device.name(), "cpu-spmd");
    }

    #[test]
    fn auto_always_yields_a_device() {
        assert!(select_device(DeviceKind::Auto).is_ok());
    }
}

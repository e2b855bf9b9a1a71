//! HIP device discovery and properties
//!
//! Devices are enumerated the way the HIP runtime does it: `HIP_VISIBLE_DEVICES`
//! restricts (or hides) the visible ordinals. The hardware class of the
//! emulated device comes from `ROCFLASH_DEVICE_ARCH` (default `gfx90a`).
//! Opening the same ordinal twice yields the same device, so every handle
//! shares one workspace pool.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::backend::scratch::WorkspacePool;
use crate::error::{FlashError, FlashResult};

const VISIBLE_DEVICES_ENV: &str = "HIP_VISIBLE_DEVICES";
const DEVICE_ARCH_ENV: &str = "ROCFLASH_DEVICE_ARCH";
const WORKSPACE_MB_ENV: &str = "ROCFLASH_WORKSPACE_MB";

/// Devices handed out by [`HipDevice::open`], by ordinal
static OPENED_DEVICES: Lazy<Mutex<HashMap<usize, HipDevice>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// AMD GPU hardware class (LLVM offload target name)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GfxArch {
    /// CDNA1 (MI100)
    #[serde(rename = "gfx908")]
    Gfx908,
    /// CDNA2 (MI200 series)
    #[serde(rename = "gfx90a")]
    Gfx90a,
    /// CDNA3 (MI300 series)
    #[serde(rename = "gfx942")]
    Gfx942,
    /// RDNA3 (RX 7900 series)
    #[serde(rename = "gfx1100")]
    Gfx1100,
}

impl GfxArch {
    pub const ALL: [GfxArch; 4] = [
        GfxArch::Gfx908,
        GfxArch::Gfx90a,
        GfxArch::Gfx942,
        GfxArch::Gfx1100,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GfxArch::Gfx908 => "gfx908",
            GfxArch::Gfx90a => "gfx90a",
            GfxArch::Gfx942 => "gfx942",
            GfxArch::Gfx1100 => "gfx1100",
        }
    }

    /// Marketing name reported as the device name
    pub fn product_name(&self) -> &'static str {
        match self {
            GfxArch::Gfx908 => "AMD Instinct MI100",
            GfxArch::Gfx90a => "AMD Instinct MI250X",
            GfxArch::Gfx942 => "AMD Instinct MI300X",
            GfxArch::Gfx1100 => "AMD Radeon RX 7900 XTX",
        }
    }

    pub fn compute_units(&self) -> u32 {
        match self {
            GfxArch::Gfx908 => 120,
            GfxArch::Gfx90a => 110,
            GfxArch::Gfx942 => 304,
            GfxArch::Gfx1100 => 96,
        }
    }

    /// Wavefront size: 64 on CDNA, 32 on RDNA3
    pub fn wavefront_size(&self) -> u32 {
        match self {
            GfxArch::Gfx1100 => 32,
            _ => 64,
        }
    }
}

impl fmt::Display for GfxArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GfxArch {
    type Err = FlashError;

    /// Accepts plain target names and target IDs with feature suffixes
    /// (`gfx90a:sramecc+:xnack-`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let base = s.trim().split(':').next().unwrap_or_default().to_lowercase();
        GfxArch::ALL
            .iter()
            .copied()
            .find(|arch| arch.as_str() == base)
            .ok_or_else(|| FlashError::InvalidConfiguration(format!("unknown GPU arch {:?}", s)))
    }
}

/// Handle to a HIP device. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HipDevice {
    inner: Arc<DeviceInner>,
}

#[derive(Debug)]
struct DeviceInner {
    ordinal: usize,
    arch: GfxArch,
    name: String,
    workspace: Arc<WorkspacePool>,
}

impl HipDevice {
    /// Number of devices visible to this process
    pub fn device_count() -> usize {
        visible_device_count(std::env::var(VISIBLE_DEVICES_ENV).ok().as_deref())
    }

    /// Check GPU availability without opening a device
    pub fn gpu_available() -> bool {
        Self::device_count() > 0
    }

    /// Open the default device (ordinal 0)
    pub fn current() -> FlashResult<Self> {
        Self::open(0)
    }

    /// Open the device at `ordinal`
    pub fn open(ordinal: usize) -> FlashResult<Self> {
        let count = Self::device_count();
        if ordinal >= count {
            tracing::debug!(
                "HipDevice::open: ordinal {} requested but {} device(s) visible",
                ordinal,
                count
            );
            return Err(FlashError::DeviceUnavailable(format!(
                "device ordinal {} requested but {} device(s) visible",
                ordinal, count
            )));
        }

        let arch = match std::env::var(DEVICE_ARCH_ENV) {
            Ok(value) => value.parse()?,
            Err(_) => GfxArch::Gfx90a,
        };

        let workspace_limit = match std::env::var(WORKSPACE_MB_ENV) {
            Ok(value) => {
                let mb: usize = value.trim().parse().map_err(|_| {
                    FlashError::InvalidConfiguration(format!(
                        "{}={:?} is not a size in MB",
                        WORKSPACE_MB_ENV, value
                    ))
                })?;
                let bytes = mb.checked_mul(1024 * 1024).ok_or_else(|| {
                    FlashError::InvalidConfiguration(format!(
                        "{}={} overflows the address space",
                        WORKSPACE_MB_ENV, mb
                    ))
                })?;
                Some(bytes)
            }
            Err(_) => None,
        };

        let mut opened = OPENED_DEVICES.lock()?;
        if let Some(device) = opened.get(&ordinal) {
            if device.arch() == arch && device.workspace().limit() == workspace_limit {
                return Ok(device.clone());
            }
        }

        // First open of this ordinal, or the environment now describes
        // different hardware
        let device = Self::build(ordinal, arch, workspace_limit);
        opened.insert(ordinal, device.clone());
        tracing::debug!(
            "HipDevice::open: device {} is {} ({})",
            ordinal,
            device.name(),
            arch
        );
        Ok(device)
    }

    /// Device of the given hardware class with an unlimited workspace pool,
    /// independent of the process environment. Every call creates a
    /// distinct device.
    pub fn emulated(arch: GfxArch) -> Self {
        Self::build(0, arch, None)
    }

    /// Like [`HipDevice::emulated`] with a bounded kernel workspace pool
    pub fn emulated_with_workspace(arch: GfxArch, workspace_bytes: usize) -> Self {
        Self::build(0, arch, Some(workspace_bytes))
    }

    fn build(ordinal: usize, arch: GfxArch, workspace_limit: Option<usize>) -> Self {
        HipDevice {
            inner: Arc::new(DeviceInner {
                ordinal,
                arch,
                name: arch.product_name().to_string(),
                workspace: Arc::new(WorkspacePool::new(workspace_limit)),
            }),
        }
    }

    pub fn ordinal(&self) -> usize {
        self.inner.ordinal
    }

    pub fn arch(&self) -> GfxArch {
        self.inner.arch
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn compute_units(&self) -> u32 {
        self.inner.arch.compute_units()
    }

    /// Pool kernels draw their scratch memory from
    pub fn workspace(&self) -> &Arc<WorkspacePool> {
        &self.inner.workspace
    }

    /// True when both handles refer to one device (clones, or opens of the
    /// same ordinal)
    pub fn same_device(&self, other: &HipDevice) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Interpret `HIP_VISIBLE_DEVICES`: unset means one device, an empty value
/// or a leading `-1` hides all devices, otherwise one device per listed entry.
fn visible_device_count(value: Option<&str>) -> usize {
    match value {
        None => 1,
        Some(list) => {
            let entries: Vec<&str> = list
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .collect();
            if entries.first().map_or(true, |e| e.starts_with('-')) {
                0
            } else {
                entries.len()
            }
        }
    }
}

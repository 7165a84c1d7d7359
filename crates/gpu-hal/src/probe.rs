//! Platform support probing for acceleration devices.

use std::path::Path;

use capline_common::DeviceType;

/// Reports which device types the platform can open, and where.
pub trait PlatformProbe: Send + Sync {
    /// Device types the platform supports, in preference order.
    fn supported(&self) -> Vec<DeviceType>;

    /// Backing node for a supported type (DRM render node, driver name).
    fn node(&self, device: DeviceType) -> Option<String>;
}

/// Probe that inspects the running system.
///
/// Detection is by well-known device nodes and driver files only. No
/// driver library is loaded.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

const DRM_RENDER_NODE: &str = "/dev/dri/renderD128";
const DRM_VENDOR_FILE: &str = "/sys/class/drm/renderD128/device/vendor";
const NVIDIA_CTL: &str = "/dev/nvidiactl";
const NVIDIA_PROC: &str = "/proc/driver/nvidia/version";
const VULKAN_ICD_DIRS: [&str; 2] = ["/usr/share/vulkan/icd.d", "/etc/vulkan/icd.d"];
const INTEL_VENDOR_ID: &str = "0x8086";

impl SystemProbe {
    fn has_vulkan_icd() -> bool {
        if std::env::var_os("VK_ICD_FILENAMES").is_some() {
            return true;
        }
        VULKAN_ICD_DIRS.iter().any(|dir| {
            std::fs::read_dir(dir)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false)
        })
    }

    fn intel_render_node() -> bool {
        std::fs::read_to_string(DRM_VENDOR_FILE)
            .map(|v| v.trim() == INTEL_VENDOR_ID)
            .unwrap_or(false)
    }
}

impl PlatformProbe for SystemProbe {
    fn supported(&self) -> Vec<DeviceType> {
        DeviceType::ALL
            .into_iter()
            .filter(|t| self.node(*t).is_some())
            .collect()
    }

    fn node(&self, device: DeviceType) -> Option<String> {
        match device {
            DeviceType::Vaapi if Path::new(DRM_RENDER_NODE).exists() => {
                Some(DRM_RENDER_NODE.to_string())
            }
            DeviceType::Qsv
                if Path::new(DRM_RENDER_NODE).exists() && Self::intel_render_node() =>
            {
                Some(DRM_RENDER_NODE.to_string())
            }
            DeviceType::Cuda
                if Path::new(NVIDIA_CTL).exists() || Path::new(NVIDIA_PROC).exists() =>
            {
                Some("cuda:0".to_string())
            }
            DeviceType::Vulkan if Self::has_vulkan_icd() => Some("vulkan:0".to_string()),
            DeviceType::VideoToolbox if cfg!(target_os = "macos") => {
                Some("videotoolbox".to_string())
            }
            DeviceType::D3d11va if cfg!(target_os = "windows") => Some("d3d11va:0".to_string()),
            _ => None,
        }
    }
}

/// Fixed answer, for tests and for pinning a device set from configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticProbe {
    devices: Vec<DeviceType>,
}

impl StaticProbe {
    pub fn new(devices: impl IntoIterator<Item = DeviceType>) -> Self {
        Self {
            devices: devices.into_iter().collect(),
        }
    }

    /// A probe that supports nothing.
    pub fn none() -> Self {
        Self::default()
    }
}

impl PlatformProbe for StaticProbe {
    fn supported(&self) -> Vec<DeviceType> {
        self.devices.clone()
    }

    fn node(&self, device: DeviceType) -> Option<String> {
        self.devices
            .contains(&device)
            .then(|| format!("{}:static", device.name()))
    }
}

//! Device paths used by the hardware backends.

use std::path::{Path, PathBuf};

/// Default path of the VideoCore shared-memory CMA device.
pub const DEFAULT_VCSM_PATH: &str = "/dev/vcsm-cma";

/// Default path of the firmware mailbox property channel.
pub const DEFAULT_VCIO_PATH: &str = "/dev/vcio";

/// Default path of the physical memory device.
pub const DEFAULT_MEM_PATH: &str = "/dev/mem";

/// Device node configuration for the hardware backends.
///
/// # Example
///
/// ```rust
/// use busmem::DeviceConfig;
///
/// let config = DeviceConfig::default().with_mem_path("/dev/gpiomem");
/// assert_eq!(config.mem_path.to_str(), Some("/dev/gpiomem"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Shared-memory CMA device.
    pub vcsm_path: PathBuf,
    /// Mailbox property channel.
    pub vcio_path: PathBuf,
    /// Physical memory device used to map mailbox allocations.
    pub mem_path: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vcsm_path: PathBuf::from(DEFAULT_VCSM_PATH),
            vcio_path: PathBuf::from(DEFAULT_VCIO_PATH),
            mem_path: PathBuf::from(DEFAULT_MEM_PATH),
        }
    }
}

impl DeviceConfig {
    /// Override the shared-memory device path.
    pub fn with_vcsm_path(mut self, path: impl AsRef<Path>) -> Self {
        self.vcsm_path = path.as_ref().to_path_buf();
        self
    }

    /// Override the mailbox device path.
    pub fn with_vcio_path(mut self, path: impl AsRef<Path>) -> Self {
        self.vcio_path = path.as_ref().to_path_buf();
        self
    }

    /// Override the physical memory device path.
    pub fn with_mem_path(mut self, path: impl AsRef<Path>) -> Self {
        self.mem_path = path.as_ref().to_path_buf();
        self
    }
}

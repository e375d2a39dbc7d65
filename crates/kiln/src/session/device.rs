use serde::{Deserialize, Serialize};

/// The parts of the target device description `prepare` consults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    /// Compute partitions available for virtual graphs.
    pub num_ipus: u32,
    pub tiles_per_ipu: u32,
    pub ipu_version: String,
    pub supports_remote_buffers: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            num_ipus: 1,
            tiles_per_ipu: 1216,
            ipu_version: "ipu2".to_string(),
            supports_remote_buffers: false,
        }
    }
}

impl DeviceInfo {
    pub fn with_ipus(num_ipus: u32) -> Self {
        Self {
            num_ipus,
            ..Self::default()
        }
    }
}

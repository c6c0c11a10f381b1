//! Errors of the device substrate.

use ash::vk;
use thiserror::Error;

/// Device-level errors.
#[derive(Error, Debug, Clone)]
pub enum GpuError {
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// An address range does not lie inside one live allocation.
    #[error("Invalid device address range {address:#x}+{len}")]
    InvalidAddress { address: u64, len: u64 },

    /// Asynchronous work failed on the device.
    #[error("Device fault: {0}")]
    DeviceFault(String),

    /// The stream worker has shut down.
    #[error("Stream is closed")]
    StreamClosed,

    /// The call is not valid for the object's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

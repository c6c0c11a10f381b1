//! Ray tracing layer error types.

use std::fmt;

use photon_gpu::GpuError;
use thiserror::Error;

/// Classification of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// An argument is malformed or inconsistent.
    InvalidValue,
    /// The object is not in a state that allows the operation.
    InvalidState,
    /// The operation is not allowed by how the object was configured.
    InvalidOperation,
    /// A named entity does not exist.
    NotFound,
    /// The backend cannot express the request.
    Unsupported,
    /// Device or host memory is exhausted.
    OutOfMemory,
    /// Asynchronous device work failed.
    DeviceFault,
    /// An acceleration structure build was rejected by the backend.
    BuildFailed,
    /// A launch was rejected by the backend.
    LaunchFailed,
    /// Pipeline linking failed.
    PipelineCreationFailed,
    /// Module creation failed.
    ModuleCreationFailed,
    /// Unexpected backend failure.
    Internal,
}

impl Status {
    /// Stable name used in diagnostics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidValue => "invalid value",
            Self::InvalidState => "invalid state",
            Self::InvalidOperation => "invalid operation",
            Self::NotFound => "not found",
            Self::Unsupported => "unsupported",
            Self::OutOfMemory => "out of memory",
            Self::DeviceFault => "device fault",
            Self::BuildFailed => "build failed",
            Self::LaunchFailed => "launch failed",
            Self::PipelineCreationFailed => "pipeline creation failed",
            Self::ModuleCreationFailed => "module creation failed",
            Self::Internal => "internal error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device and operation an error was raised from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub device_id: u32,
    pub operation: &'static str,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, " [device {}, {}]", self.device_id, self.operation)
    }
}

fn fmt_context(context: &Option<ErrorContext>) -> String {
    context.as_ref().map(ToString::to_string).unwrap_or_default()
}

/// Error raised by the ray tracing layer.
#[derive(Error, Debug, Clone)]
#[error("{status}: {message}{}", fmt_context(.context))]
pub struct RtError {
    status: Status,
    message: String,
    context: Option<ErrorContext>,
}

impl RtError {
    /// Create an error with a diagnostic message.
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            context: None,
        }
    }

    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::new(Status::InvalidValue, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(Status::InvalidState, message)
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new(Status::InvalidOperation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Status::NotFound, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(Status::Unsupported, message)
    }

    /// Attach the device and operation unless a context is already set.
    #[must_use]
    pub fn context(mut self, device_id: u32, operation: &'static str) -> Self {
        self.context.get_or_insert(ErrorContext {
            device_id,
            operation,
        });
        self
    }

    /// Replace the status, keeping the message and context.
    #[must_use]
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Failure classification.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Backend diagnostic.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Device and operation, when known.
    pub fn error_context(&self) -> Option<&ErrorContext> {
        self.context.as_ref()
    }
}

impl From<GpuError> for RtError {
    fn from(error: GpuError) -> Self {
        let status = match &error {
            GpuError::AllocationFailed(_) => Status::OutOfMemory,
            GpuError::InvalidAddress { .. } | GpuError::DeviceFault(_) => Status::DeviceFault,
            GpuError::InvalidState(_) | GpuError::StreamClosed => Status::InvalidState,
            GpuError::Vulkan(ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            | GpuError::Vulkan(ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY) => Status::OutOfMemory,
            GpuError::Vulkan(ash::vk::Result::ERROR_DEVICE_LOST) => Status::DeviceFault,
            _ => Status::Internal,
        };
        Self::new(status, error.to_string())
    }
}

impl From<ash::vk::Result> for RtError {
    fn from(result: ash::vk::Result) -> Self {
        GpuError::from(result).into()
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let error = RtError::invalid_state("no build inputs").context(3, "rebuild");
        assert_eq!(
            error.to_string(),
            "invalid state: no build inputs [device 3, rebuild]"
        );
    }

    #[test]
    fn first_context_wins() {
        let error = RtError::not_found("x").context(1, "inner").context(2, "outer");
        assert_eq!(error.error_context().map(|c| c.operation), Some("inner"));
    }

    #[test]
    fn gpu_errors_map_to_status() {
        let oom: RtError = GpuError::AllocationFailed("heap".into()).into();
        assert_eq!(oom.status(), Status::OutOfMemory);
        let fault: RtError = GpuError::InvalidAddress { address: 4, len: 4 }.into();
        assert_eq!(fault.status(), Status::DeviceFault);
        let other: RtError = GpuError::Other("x".into()).into();
        assert_eq!(other.status(), Status::Internal);
    }
}

//! Host device: device memory and streams emulated on the CPU.
//!
//! The host device is the reference implementation of the substrate. It
//! runs everywhere, which makes it the device tests and the collision demo
//! default to.

mod memory;
mod stream;

use std::any::Any;
use std::sync::Arc;

pub use memory::{HostAllocator, HostMemory, HOST_ALLOCATION_ALIGNMENT};
pub use stream::{HostStream, HostTask};

use crate::device::{Allocator, Device, DeviceKind, Stream};
use crate::error::Result;

/// A device whose memory lives in host RAM.
pub struct HostDevice {
    id: u32,
    name: String,
    memory: Arc<HostMemory>,
    allocator: Arc<HostAllocator>,
    default_stream: HostStream,
}

impl HostDevice {
    /// Emulated memory of this device.
    pub fn memory(&self) -> &Arc<HostMemory> {
        &self.memory
    }

    /// The default stream as its concrete type.
    pub fn host_stream(&self) -> &HostStream {
        &self.default_stream
    }

    /// Create an additional stream as its concrete type.
    pub fn create_host_stream(&self) -> Result<HostStream> {
        HostStream::new(Arc::clone(&self.memory))
    }
}

impl Device for HostDevice {
    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Host
    }

    fn default_allocator(&self) -> Arc<dyn Allocator> {
        self.allocator.clone()
    }

    fn default_stream(&self) -> &dyn Stream {
        &self.default_stream
    }

    fn create_stream(&self) -> Result<Box<dyn Stream>> {
        Ok(Box::new(self.create_host_stream()?))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Builder for creating a host device.
pub struct HostDeviceBuilder {
    id: u32,
    name: String,
}

impl Default for HostDeviceBuilder {
    fn default() -> Self {
        Self {
            id: 0,
            name: "photon-host".to_string(),
        }
    }
}

impl HostDeviceBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the device ordinal reported in diagnostics.
    pub fn id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// Set the device name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Build the host device.
    pub fn build(self) -> Result<Arc<HostDevice>> {
        let memory = Arc::new(HostMemory::new(self.id));
        let default_stream = HostStream::new(Arc::clone(&memory))?;
        tracing::info!("Created host device {} ({})", self.id, self.name);
        Ok(Arc::new(HostDevice {
            id: self.id,
            name: self.name,
            allocator: Arc::new(HostAllocator::new(Arc::clone(&memory))),
            memory,
            default_stream,
        }))
    }
}

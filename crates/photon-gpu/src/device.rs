//! Device, allocator and stream abstractions.
//!
//! Every operation in the ray tracing layer names the [`Stream`] its work is
//! ordered on and the [`Allocator`] its memory comes from. Work on one stream
//! executes in submission order; completion is only observable through
//! [`Stream::sync`] or a blocking download.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytemuck::Pod;
use photon_core::DevicePtr;

use crate::error::Result;

/// Which implementation backs a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Software device emulating device memory on the host.
    Host,
    /// Vulkan device with ray tracing pipeline support.
    Vulkan,
}

/// A contiguous range of device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBlock {
    /// First byte of the block.
    pub ptr: DevicePtr,
    /// Size in bytes.
    pub size: u64,
}

impl MemoryBlock {
    /// An empty block at the null address.
    pub const EMPTY: Self = Self {
        ptr: DevicePtr::NULL,
        size: 0,
    };

    /// Sub-range starting `offset` bytes in. Saturates to an empty tail.
    pub fn slice_from(&self, offset: u64) -> Self {
        let offset = offset.min(self.size);
        Self {
            ptr: self.ptr.offset(offset),
            size: self.size - offset,
        }
    }
}

/// A compute device capable of hosting ray tracing work.
pub trait Device: Send + Sync {
    /// Ordinal of the device, used in diagnostics.
    fn id(&self) -> u32;

    /// Human readable device name.
    fn name(&self) -> &str;

    /// Implementation backing this device.
    fn kind(&self) -> DeviceKind;

    /// Allocator used when callers do not supply one.
    fn default_allocator(&self) -> Arc<dyn Allocator>;

    /// Stream used when callers do not supply one.
    fn default_stream(&self) -> &dyn Stream;

    /// Create an additional in-order stream.
    fn create_stream(&self) -> Result<Box<dyn Stream>>;

    /// Downcast hook for backends that need the concrete device.
    fn as_any(&self) -> &dyn Any;
}

/// Source of device memory.
pub trait Allocator: Send + Sync {
    /// Device the memory lives on.
    fn device_id(&self) -> u32;

    /// Allocate `size` bytes. The returned address is aligned to
    /// [`Allocator::alignment`].
    fn allocate(&self, size: u64, name: &str) -> Result<MemoryBlock>;

    /// Return a block obtained from [`Allocator::allocate`].
    fn free(&self, block: MemoryBlock) -> Result<()>;

    /// Base alignment of every allocation.
    fn alignment(&self) -> u64 {
        256
    }
}

/// An in-order queue of device work.
pub trait Stream: Send + Sync {
    /// Device the stream executes on.
    fn device_id(&self) -> u32;

    /// Copy host bytes to device memory. The host data is captured before
    /// this returns, so the source may be reused immediately.
    fn upload(&self, dst: DevicePtr, data: &[u8]) -> Result<()>;

    /// Fill `size` bytes with `value`.
    fn memset(&self, dst: DevicePtr, value: u8, size: u64) -> Result<()>;

    /// Device-to-device copy.
    fn copy(&self, dst: DevicePtr, src: DevicePtr, size: u64) -> Result<()>;

    /// Wait for all preceding work, then copy device bytes to the host.
    fn download(&self, src: DevicePtr, dst: &mut [u8]) -> Result<()>;

    /// Block until all submitted work has completed.
    ///
    /// Faults raised by asynchronous work are reported here.
    fn sync(&self) -> Result<()>;

    /// Keep `resource` alive until all work submitted so far has completed.
    fn defer_release(&self, resource: Box<dyn Any + Send>);

    /// Owned handle that defers releases on this stream after the borrow
    /// of the stream has ended.
    fn release_queue(&self) -> ReleaseQueue;

    /// Downcast hook for backends that need the concrete stream.
    fn as_any(&self) -> &dyn Any;
}

type ReleaseFn = dyn Fn(Box<dyn Any + Send>) + Send + Sync;

/// Owned counterpart of [`Stream::defer_release`].
///
/// Resources handed to the queue drop once all work submitted to the stream
/// before them has completed. After the stream itself is gone nothing of it
/// is in flight, and released resources drop immediately.
#[derive(Clone)]
pub struct ReleaseQueue {
    release: Arc<ReleaseFn>,
}

impl ReleaseQueue {
    pub fn new<F>(release: F) -> Self
    where
        F: Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
    {
        Self {
            release: Arc::new(release),
        }
    }

    pub fn release(&self, resource: Box<dyn Any + Send>) {
        (self.release)(resource);
    }
}

impl fmt::Debug for ReleaseQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseQueue").finish_non_exhaustive()
    }
}

/// Typed helpers over [`Stream`].
pub trait StreamExt: Stream {
    /// Upload a slice of plain-data values.
    fn upload_slice<T: Pod>(&self, dst: DevicePtr, data: &[T]) -> Result<()> {
        self.upload(dst, bytemuck::cast_slice(data))
    }

    /// Download `len` plain-data values.
    fn download_vec<T: Pod>(&self, src: DevicePtr, len: usize) -> Result<Vec<T>> {
        let mut out = vec![T::zeroed(); len];
        self.download(src, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    /// Download a single plain-data value.
    fn read_value<T: Pod>(&self, src: DevicePtr) -> Result<T> {
        let mut value = T::zeroed();
        self.download(src, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }
}

impl<S: Stream + ?Sized> StreamExt for S {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_slice_saturates() {
        let block = MemoryBlock {
            ptr: DevicePtr(0x1000),
            size: 64,
        };
        assert_eq!(block.slice_from(16).ptr, DevicePtr(0x1010));
        assert_eq!(block.slice_from(16).size, 48);
        assert_eq!(block.slice_from(100).size, 0);
    }
}

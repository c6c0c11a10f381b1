//! Owned device memory.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use bytemuck::Pod;
use photon_core::DevicePtr;

use crate::device::{Allocator, MemoryBlock, Stream, StreamExt};
use crate::error::Result;

/// A device allocation freed on drop.
///
/// An empty buffer owns nothing and reports the null address.
pub struct DeviceBuffer {
    allocator: Arc<dyn Allocator>,
    block: Option<MemoryBlock>,
    name: &'static str,
}

impl DeviceBuffer {
    /// Create an empty buffer bound to `allocator`.
    pub fn new(allocator: Arc<dyn Allocator>, name: &'static str) -> Self {
        Self {
            allocator,
            block: None,
            name,
        }
    }

    /// Create a buffer of exactly `size` bytes.
    pub fn with_size(allocator: Arc<dyn Allocator>, size: u64, name: &'static str) -> Result<Self> {
        let mut buffer = Self::new(allocator, name);
        buffer.resize(size)?;
        Ok(buffer)
    }

    /// Reallocate to exactly `size` bytes. Contents are not preserved.
    ///
    /// A no-op when the size already matches. On failure the buffer is left
    /// empty.
    pub fn resize(&mut self, size: u64) -> Result<()> {
        if self.size() == size {
            return Ok(());
        }
        self.clear()?;
        if size > 0 {
            self.block = Some(self.allocator.allocate(size, self.name)?);
        }
        Ok(())
    }

    /// Free the allocation.
    pub fn clear(&mut self) -> Result<()> {
        if let Some(block) = self.block.take() {
            self.allocator.free(block)?;
        }
        Ok(())
    }

    /// Device address of the first byte, null when empty.
    pub fn ptr(&self) -> DevicePtr {
        self.block.map_or(DevicePtr::NULL, |b| b.ptr)
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.block.map_or(0, |b| b.size)
    }

    /// Whether nothing is allocated.
    pub fn is_empty(&self) -> bool {
        self.block.is_none()
    }

    /// The allocated range, or [`MemoryBlock::EMPTY`].
    pub fn block(&self) -> MemoryBlock {
        self.block.unwrap_or(MemoryBlock::EMPTY)
    }

    /// Allocator this buffer draws from.
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("name", &self.name)
            .field("ptr", &self.ptr())
            .field("size", &self.size())
            .finish()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.clear() {
            tracing::error!("Failed to free device buffer '{}': {e}", self.name);
        }
    }
}

/// A typed device array of plain-data elements.
pub struct DeviceArray<T: Pod> {
    buffer: DeviceBuffer,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> DeviceArray<T> {
    /// Allocate room for `len` elements. Contents are unspecified.
    pub fn new(allocator: Arc<dyn Allocator>, len: usize, name: &'static str) -> Result<Self> {
        let bytes = (len * std::mem::size_of::<T>()) as u64;
        Ok(Self {
            buffer: DeviceBuffer::with_size(allocator, bytes, name)?,
            len,
            _marker: PhantomData,
        })
    }

    /// Allocate and enqueue an upload of `data`.
    pub fn from_slice(
        allocator: Arc<dyn Allocator>,
        stream: &dyn Stream,
        data: &[T],
        name: &'static str,
    ) -> Result<Self> {
        let array = Self::new(allocator, data.len(), name)?;
        array.upload(stream, data)?;
        Ok(array)
    }

    /// Enqueue an upload of `data` into the front of the array.
    pub fn upload(&self, stream: &dyn Stream, data: &[T]) -> Result<()> {
        debug_assert!(data.len() <= self.len);
        if data.is_empty() {
            return Ok(());
        }
        stream.upload_slice(self.ptr(), data)
    }

    /// Wait for the stream and read the whole array back.
    pub fn download(&self, stream: &dyn Stream) -> Result<Vec<T>> {
        if self.len == 0 {
            return Ok(Vec::new());
        }
        stream.download_vec(self.ptr(), self.len)
    }

    /// Device address of element 0.
    pub fn ptr(&self) -> DevicePtr {
        self.buffer.ptr()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Non-owning typed view of the array.
    pub fn view(&self) -> BufferView<T> {
        BufferView::from_raw_parts(self.ptr(), self.len)
    }

    /// Underlying untyped buffer.
    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }
}

/// Non-owning typed view of device memory.
///
/// Views are plain descriptors; the caller keeps the memory alive for as
/// long as any device work reads through the view.
pub struct BufferView<T> {
    ptr: DevicePtr,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for BufferView<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for BufferView<T> {}

impl<T> fmt::Debug for BufferView<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferView")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl<T> Default for BufferView<T> {
    fn default() -> Self {
        Self::from_raw_parts(DevicePtr::NULL, 0)
    }
}

impl<T> BufferView<T> {
    /// View `len` elements starting at `ptr`.
    pub const fn from_raw_parts(ptr: DevicePtr, len: usize) -> Self {
        Self {
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    /// Address of element 0.
    pub const fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Number of elements.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the view is empty.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Element size in bytes.
    pub const fn stride(&self) -> usize {
        std::mem::size_of::<T>()
    }

    /// Size of the viewed range in bytes.
    pub const fn size_bytes(&self) -> u64 {
        (self.len * std::mem::size_of::<T>()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostDeviceBuilder;
    use crate::Device;

    #[test]
    fn resize_is_exact_and_empty_is_null() {
        let device = HostDeviceBuilder::new().build().unwrap();
        let mut buffer = DeviceBuffer::new(device.default_allocator(), "test");
        assert!(buffer.ptr().is_null());
        buffer.resize(100).unwrap();
        assert_eq!(buffer.size(), 100);
        assert!(!buffer.ptr().is_null());
        let before = buffer.ptr();
        buffer.resize(100).unwrap();
        assert_eq!(buffer.ptr(), before);
        buffer.resize(0).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(device.memory().bytes_in_use(), 0);
    }

    #[test]
    fn array_roundtrip() {
        let device = HostDeviceBuilder::new().build().unwrap();
        let stream = device.default_stream();
        let data = [1u32, 2, 3, 4];
        let array = DeviceArray::from_slice(device.default_allocator(), stream, &data, "test")
            .unwrap();
        assert_eq!(array.download(stream).unwrap(), data);
        assert_eq!(array.view().size_bytes(), 16);
    }

    #[test]
    fn drop_frees_memory() {
        let device = HostDeviceBuilder::new().build().unwrap();
        {
            let _buffer = DeviceBuffer::with_size(device.default_allocator(), 4096, "test").unwrap();
            assert_eq!(device.memory().bytes_in_use(), 4096);
        }
        assert_eq!(device.memory().bytes_in_use(), 0);
    }
}

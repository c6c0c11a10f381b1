//! Emulated device memory.
//!
//! Allocations live in host vectors keyed by a synthetic device address.
//! Addresses are never reused, and every allocation is followed by an
//! unmapped guard gap so out-of-bounds accesses are reported instead of
//! silently landing in a neighbour.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::RwLock;
use photon_core::{align_up, DevicePtr};

use crate::device::{Allocator, MemoryBlock};
use crate::error::{GpuError, Result};

/// First address handed out. Non-zero so null stays distinguishable.
const BASE_ADDRESS: u64 = 0x0000_7f00_0000_0000;
/// Alignment of every allocation.
pub const HOST_ALLOCATION_ALIGNMENT: u64 = 256;
/// Unmapped bytes between consecutive allocations.
const GUARD_GAP: u64 = 4096;

/// One live allocation.
pub struct Allocation {
    base: u64,
    name: String,
    data: RwLock<Vec<u8>>,
}

impl Allocation {
    fn range(&self, address: u64, len: u64) -> Option<std::ops::Range<usize>> {
        let offset = address.checked_sub(self.base)?;
        let end = offset.checked_add(len)?;
        let size = self.data.read_recursive().len() as u64;
        (end <= size).then(|| offset as usize..end as usize)
    }
}

/// Host-side store backing a [`HostDevice`](super::HostDevice).
pub struct HostMemory {
    device_id: u32,
    next_address: AtomicU64,
    bytes_in_use: AtomicU64,
    allocations: RwLock<BTreeMap<u64, Arc<Allocation>>>,
}

impl HostMemory {
    /// Create an empty memory space for device `device_id`.
    pub fn new(device_id: u32) -> Self {
        Self {
            device_id,
            next_address: AtomicU64::new(BASE_ADDRESS),
            bytes_in_use: AtomicU64::new(0),
            allocations: RwLock::new(BTreeMap::new()),
        }
    }

    /// Device this memory belongs to.
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Total bytes currently allocated.
    pub fn bytes_in_use(&self) -> u64 {
        self.bytes_in_use.load(Ordering::Relaxed)
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.allocations.read().len()
    }

    /// Allocate `size` zeroed bytes.
    pub fn allocate(&self, size: u64, name: &str) -> Result<MemoryBlock> {
        if size == 0 {
            return Err(GpuError::AllocationFailed(format!(
                "zero-sized allocation '{name}'"
            )));
        }
        let len = usize::try_from(size)
            .map_err(|_| GpuError::AllocationFailed(format!("{size} bytes for '{name}'")))?;
        let span = align_up(size + GUARD_GAP, HOST_ALLOCATION_ALIGNMENT);
        let base = self.next_address.fetch_add(span, Ordering::Relaxed);

        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| GpuError::AllocationFailed(format!("'{name}' ({size} bytes): {e}")))?;
        data.resize(len, 0);

        self.allocations.write().insert(
            base,
            Arc::new(Allocation {
                base,
                name: name.to_string(),
                data: RwLock::new(data),
            }),
        );
        self.bytes_in_use.fetch_add(size, Ordering::Relaxed);
        tracing::trace!("Allocated {size} bytes for '{name}' at {base:#x}");

        Ok(MemoryBlock {
            ptr: DevicePtr(base),
            size,
        })
    }

    /// Free an allocation by its base address.
    pub fn free(&self, block: MemoryBlock) -> Result<()> {
        let removed = self.allocations.write().remove(&block.ptr.addr());
        match removed {
            Some(allocation) => {
                let size = allocation.data.read_recursive().len() as u64;
                self.bytes_in_use.fetch_sub(size, Ordering::Relaxed);
                tracing::trace!("Freed '{}' at {:#x}", allocation.name, allocation.base);
                Ok(())
            }
            None => Err(GpuError::InvalidAddress {
                address: block.ptr.addr(),
                len: block.size,
            }),
        }
    }

    /// Find the allocation containing `[ptr, ptr + len)`.
    fn resolve(&self, ptr: DevicePtr, len: u64) -> Result<(Arc<Allocation>, std::ops::Range<usize>)> {
        let invalid = || GpuError::InvalidAddress {
            address: ptr.addr(),
            len,
        };
        let allocation = self
            .allocations
            .read()
            .range(..=ptr.addr())
            .next_back()
            .map(|(_, a)| Arc::clone(a))
            .ok_or_else(invalid)?;
        let range = allocation.range(ptr.addr(), len).ok_or_else(invalid)?;
        Ok((allocation, range))
    }

    /// Run `f` over the bytes at `[ptr, ptr + len)`.
    ///
    /// Reads are recursive, so `f` may itself read device memory.
    pub fn with_bytes<R>(&self, ptr: DevicePtr, len: u64, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let (allocation, range) = self.resolve(ptr, len)?;
        let data = allocation.data.read_recursive();
        Ok(f(&data[range]))
    }

    /// Run `f` over the mutable bytes at `[ptr, ptr + len)`.
    pub fn with_bytes_mut<R>(
        &self,
        ptr: DevicePtr,
        len: u64,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let (allocation, range) = self.resolve(ptr, len)?;
        let mut data = allocation.data.write();
        Ok(f(&mut data[range]))
    }

    /// Copy device bytes into `dst`.
    pub fn read_bytes(&self, ptr: DevicePtr, dst: &mut [u8]) -> Result<()> {
        self.with_bytes(ptr, dst.len() as u64, |src| dst.copy_from_slice(src))
    }

    /// Copy `src` into device memory.
    pub fn write_bytes(&self, ptr: DevicePtr, src: &[u8]) -> Result<()> {
        self.with_bytes_mut(ptr, src.len() as u64, |dst| dst.copy_from_slice(src))
    }

    /// Fill `len` bytes with `value`.
    pub fn fill(&self, ptr: DevicePtr, value: u8, len: u64) -> Result<()> {
        self.with_bytes_mut(ptr, len, |dst| dst.fill(value))
    }

    /// Device-to-device copy. Overlapping ranges behave like `memmove`.
    pub fn copy(&self, dst: DevicePtr, src: DevicePtr, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let (src_alloc, src_range) = self.resolve(src, len)?;
        let (dst_alloc, dst_range) = self.resolve(dst, len)?;
        if Arc::ptr_eq(&src_alloc, &dst_alloc) {
            let mut data = dst_alloc.data.write();
            data.copy_within(src_range, dst_range.start);
        } else {
            let src_data = src_alloc.data.read_recursive();
            let mut dst_data = dst_alloc.data.write();
            dst_data[dst_range].copy_from_slice(&src_data[src_range]);
        }
        Ok(())
    }

    /// Read one plain-data value (unaligned).
    pub fn read<T: Pod>(&self, ptr: DevicePtr) -> Result<T> {
        self.with_bytes(ptr, std::mem::size_of::<T>() as u64, bytemuck::pod_read_unaligned)
    }

    /// Write one plain-data value (unaligned).
    pub fn write<T: Pod>(&self, ptr: DevicePtr, value: &T) -> Result<()> {
        self.write_bytes(ptr, bytemuck::bytes_of(value))
    }

    /// Read `len` consecutive plain-data values.
    pub fn read_vec<T: Pod>(&self, ptr: DevicePtr, len: usize) -> Result<Vec<T>> {
        let bytes = (len * std::mem::size_of::<T>()) as u64;
        self.with_bytes(ptr, bytes, |src| {
            src.chunks_exact(std::mem::size_of::<T>().max(1))
                .take(len)
                .map(bytemuck::pod_read_unaligned)
                .collect()
        })
    }

    /// Atomically add to a `u32`, returning the previous value.
    pub fn atomic_add_u32(&self, ptr: DevicePtr, value: u32) -> Result<u32> {
        self.with_bytes_mut(ptr, 4, |bytes| {
            let old: u32 = bytemuck::pod_read_unaligned(bytes);
            bytes.copy_from_slice(&old.wrapping_add(value).to_ne_bytes());
            old
        })
    }

    /// Atomically add to a `u64`, returning the previous value.
    pub fn atomic_add_u64(&self, ptr: DevicePtr, value: u64) -> Result<u64> {
        self.with_bytes_mut(ptr, 8, |bytes| {
            let old: u64 = bytemuck::pod_read_unaligned(bytes);
            bytes.copy_from_slice(&old.wrapping_add(value).to_ne_bytes());
            old
        })
    }
}

/// [`Allocator`] over a [`HostMemory`].
#[derive(Clone)]
pub struct HostAllocator {
    memory: Arc<HostMemory>,
}

impl HostAllocator {
    /// Allocator drawing from `memory`.
    pub fn new(memory: Arc<HostMemory>) -> Self {
        Self { memory }
    }

    /// The memory this allocator draws from.
    pub fn memory(&self) -> &Arc<HostMemory> {
        &self.memory
    }
}

impl Allocator for HostAllocator {
    fn device_id(&self) -> u32 {
        self.memory.device_id()
    }

    fn allocate(&self, size: u64, name: &str) -> Result<MemoryBlock> {
        self.memory.allocate(size, name)
    }

    fn free(&self, block: MemoryBlock) -> Result<()> {
        self.memory.free(block)
    }

    fn alignment(&self) -> u64 {
        HOST_ALLOCATION_ALIGNMENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_aligned_and_distinct() {
        let memory = HostMemory::new(0);
        let a = memory.allocate(10, "a").unwrap();
        let b = memory.allocate(10, "b").unwrap();
        assert_ne!(a.ptr, b.ptr);
        assert_eq!(a.ptr.addr() % HOST_ALLOCATION_ALIGNMENT, 0);
        assert_eq!(b.ptr.addr() % HOST_ALLOCATION_ALIGNMENT, 0);
        assert_eq!(memory.bytes_in_use(), 20);
    }

    #[test]
    fn out_of_bounds_is_reported() {
        let memory = HostMemory::new(0);
        let a = memory.allocate(8, "a").unwrap();
        assert!(memory.read::<u64>(a.ptr).is_ok());
        assert!(matches!(
            memory.read::<u64>(a.ptr.offset(4)),
            Err(GpuError::InvalidAddress { .. })
        ));
        assert!(memory.read::<u32>(DevicePtr(16)).is_err());
    }

    #[test]
    fn use_after_free_is_reported() {
        let memory = HostMemory::new(0);
        let a = memory.allocate(8, "a").unwrap();
        memory.free(a).unwrap();
        assert!(memory.read::<u32>(a.ptr).is_err());
        assert!(memory.free(a).is_err());
    }

    #[test]
    fn copy_within_one_allocation() {
        let memory = HostMemory::new(0);
        let a = memory.allocate(8, "a").unwrap();
        memory.write_bytes(a.ptr, &[1, 2, 3, 4]).unwrap();
        memory.copy(a.ptr.offset(4), a.ptr, 4).unwrap();
        let mut out = [0u8; 8];
        memory.read_bytes(a.ptr, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn atomic_add_returns_previous() {
        let memory = HostMemory::new(0);
        let a = memory.allocate(4, "counter").unwrap();
        assert_eq!(memory.atomic_add_u32(a.ptr, 3).unwrap(), 0);
        assert_eq!(memory.atomic_add_u32(a.ptr, 2).unwrap(), 3);
        assert_eq!(memory.read::<u32>(a.ptr).unwrap(), 5);
    }
}

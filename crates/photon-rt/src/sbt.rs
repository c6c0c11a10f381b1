//! Shader binding table records and layout.
//!
//! The binding table is a device buffer of records grouped into regions:
//! - Ray generation: 1 record
//! - Exception: 0 or 1 record
//! - Miss: one record per miss index
//! - Hit groups: indexed by ray offset, geometry and instance
//! - Callables: indexed by callable id
//!
//! Every record starts with the [`SbtHeader`] of the program it invokes,
//! followed by user data.

use std::fmt;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use photon_core::{align_up, DevicePtr};
use photon_gpu::{Allocator, DeviceBuffer, Stream};

use crate::error::{Result, RtError};
use crate::module::Program;

/// Size of the opaque program header at the start of every record.
pub const SBT_RECORD_HEADER_SIZE: usize = 32;
/// Alignment of every record and of the record stride.
pub const SBT_RECORD_ALIGNMENT: usize = 32;
/// Alignment of the start of every region.
pub const SBT_REGION_ALIGNMENT: u64 = 64;

/// Opaque program identification written at the start of a record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct SbtHeader {
    pub storage: [u8; SBT_RECORD_HEADER_SIZE],
}

impl Default for SbtHeader {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for SbtHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SbtHeader(")?;
        for byte in &self.storage {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// A binding table record: program header followed by `T`.
#[derive(Clone, Copy, Debug)]
#[repr(C, align(32))]
pub struct SbtRecord<T> {
    pub header: SbtHeader,
    pub data: T,
}

impl<T: Pod> SbtRecord<T> {
    /// Record invoking `program` with `data`.
    pub fn new(program: &Program, data: T) -> Self {
        Self::from_header(*program.header(), data)
    }

    /// Record with an explicit header.
    pub fn from_header(header: SbtHeader, data: T) -> Self {
        Self { header, data }
    }

    /// Offset of `data` within the record.
    pub const fn data_offset() -> usize {
        let align = std::mem::align_of::<T>();
        (SBT_RECORD_HEADER_SIZE + align - 1) / align * align
    }
}

/// A record carrying only the program header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, align(32))]
pub struct EmptyRecord {
    pub header: SbtHeader,
}

impl EmptyRecord {
    /// Record invoking `program`.
    pub fn new(program: &Program) -> Self {
        Self {
            header: *program.header(),
        }
    }
}

/// Something that can be written into the binding table as one record.
pub trait RecordBytes {
    /// The record as it must appear in device memory. Padding is zeroed.
    fn record_bytes(&self) -> Vec<u8>;
}

impl<T: Pod> RecordBytes for SbtRecord<T> {
    fn record_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; std::mem::size_of::<Self>()];
        bytes[..SBT_RECORD_HEADER_SIZE].copy_from_slice(&self.header.storage);
        let offset = Self::data_offset();
        let data = bytemuck::bytes_of(&self.data);
        bytes[offset..offset + data.len()].copy_from_slice(data);
        bytes
    }
}

impl RecordBytes for EmptyRecord {
    fn record_bytes(&self) -> Vec<u8> {
        bytemuck::bytes_of(self).to_vec()
    }
}

/// Device addresses of every region, as consumed by a launch.
///
/// The table is assembled by the caller and not validated by the pipeline;
/// null bases with zero counts mark unused regions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShaderBindingTable {
    pub raygen_record: DevicePtr,
    pub exception_record: DevicePtr,
    pub miss_record_base: DevicePtr,
    pub miss_record_stride_in_bytes: u32,
    pub miss_record_count: u32,
    pub hitgroup_record_base: DevicePtr,
    pub hitgroup_record_stride_in_bytes: u32,
    pub hitgroup_record_count: u32,
    pub callables_record_base: DevicePtr,
    pub callables_record_stride_in_bytes: u32,
    pub callables_record_count: u32,
}

impl ShaderBindingTable {
    /// Address of miss record `index`.
    pub fn miss_record(&self, index: u32) -> Option<DevicePtr> {
        region_record(
            self.miss_record_base,
            self.miss_record_stride_in_bytes,
            self.miss_record_count,
            index,
        )
    }

    /// Address of hit group record `index`.
    pub fn hitgroup_record(&self, index: u32) -> Option<DevicePtr> {
        region_record(
            self.hitgroup_record_base,
            self.hitgroup_record_stride_in_bytes,
            self.hitgroup_record_count,
            index,
        )
    }

    /// Address of callable record `index`.
    pub fn callable_record(&self, index: u32) -> Option<DevicePtr> {
        region_record(
            self.callables_record_base,
            self.callables_record_stride_in_bytes,
            self.callables_record_count,
            index,
        )
    }
}

fn region_record(base: DevicePtr, stride: u32, count: u32, index: u32) -> Option<DevicePtr> {
    (!base.is_null() && index < count).then(|| base.offset(u64::from(stride) * u64::from(index)))
}

/// Offsets of one region within the table buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionLayout {
    pub offset: u64,
    pub stride: u32,
    pub count: u32,
}

impl RegionLayout {
    /// Bytes occupied, rounded to the region alignment.
    pub fn size(&self) -> u64 {
        align_up(u64::from(self.stride) * u64::from(self.count), SBT_REGION_ALIGNMENT)
    }
}

/// Placement of every region within the table buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SbtLayout {
    pub raygen: RegionLayout,
    pub exception: RegionLayout,
    pub miss: RegionLayout,
    pub hitgroup: RegionLayout,
    pub callables: RegionLayout,
    pub size: u64,
}

#[derive(Default)]
struct Region {
    records: Vec<Vec<u8>>,
}

impl Region {
    fn stride(&self) -> u32 {
        let largest = self.records.iter().map(Vec::len).max().unwrap_or(0);
        align_up(largest as u64, SBT_RECORD_ALIGNMENT as u64) as u32
    }

    fn layout(&self, offset: u64) -> RegionLayout {
        RegionLayout {
            offset,
            stride: self.stride(),
            count: self.records.len() as u32,
        }
    }
}

/// Builder assembling a binding table in one device buffer.
#[derive(Default)]
pub struct ShaderBindingTableBuilder {
    raygen: Region,
    exception: Region,
    miss: Region,
    hitgroup: Region,
    callables: Region,
}

impl ShaderBindingTableBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ray generation record.
    pub fn raygen(mut self, record: &impl RecordBytes) -> Self {
        self.raygen.records = vec![record.record_bytes()];
        self
    }

    /// Set the exception record.
    pub fn exception(mut self, record: &impl RecordBytes) -> Self {
        self.exception.records = vec![record.record_bytes()];
        self
    }

    /// Append a miss record.
    pub fn miss(mut self, record: &impl RecordBytes) -> Self {
        self.miss.records.push(record.record_bytes());
        self
    }

    /// Append a hit group record.
    pub fn hitgroup(mut self, record: &impl RecordBytes) -> Self {
        self.hitgroup.records.push(record.record_bytes());
        self
    }

    /// Append a callable record.
    pub fn callable(mut self, record: &impl RecordBytes) -> Self {
        self.callables.records.push(record.record_bytes());
        self
    }

    /// Region placement within the table buffer.
    pub fn layout(&self) -> SbtLayout {
        let raygen = self.raygen.layout(0);
        let exception = self.exception.layout(raygen.offset + raygen.size());
        let miss = self.miss.layout(exception.offset + exception.size());
        let hitgroup = self.hitgroup.layout(miss.offset + miss.size());
        let callables = self.callables.layout(hitgroup.offset + hitgroup.size());
        SbtLayout {
            raygen,
            exception,
            miss,
            hitgroup,
            callables,
            size: callables.offset + callables.size(),
        }
    }

    /// Upload the table and return its buffer and region addresses.
    ///
    /// The buffer must outlive every launch using the table.
    pub fn build(
        self,
        stream: &dyn Stream,
        allocator: Arc<dyn Allocator>,
    ) -> Result<(DeviceBuffer, ShaderBindingTable)> {
        if self.raygen.records.is_empty() {
            return Err(RtError::invalid_value(
                "shader binding table needs a raygen record",
            ));
        }
        let layout = self.layout();
        let mut bytes = vec![0u8; layout.size as usize];
        for (region, placement) in [
            (&self.raygen, layout.raygen),
            (&self.exception, layout.exception),
            (&self.miss, layout.miss),
            (&self.hitgroup, layout.hitgroup),
            (&self.callables, layout.callables),
        ] {
            for (i, record) in region.records.iter().enumerate() {
                let start = (placement.offset + u64::from(placement.stride) * i as u64) as usize;
                bytes[start..start + record.len()].copy_from_slice(record);
            }
        }

        let buffer = DeviceBuffer::with_size(allocator, layout.size, "shader_binding_table")?;
        stream.upload(buffer.ptr(), &bytes)?;

        let base = buffer.ptr();
        let address = |placement: RegionLayout| {
            if placement.count == 0 {
                DevicePtr::NULL
            } else {
                base.offset(placement.offset)
            }
        };
        let sbt = ShaderBindingTable {
            raygen_record: address(layout.raygen),
            exception_record: address(layout.exception),
            miss_record_base: address(layout.miss),
            miss_record_stride_in_bytes: layout.miss.stride,
            miss_record_count: layout.miss.count,
            hitgroup_record_base: address(layout.hitgroup),
            hitgroup_record_stride_in_bytes: layout.hitgroup.stride,
            hitgroup_record_count: layout.hitgroup.count,
            callables_record_base: address(layout.callables),
            callables_record_stride_in_bytes: layout.callables.stride,
            callables_record_count: layout.callables.count,
        };
        tracing::debug!("Uploaded shader binding table ({} bytes)", layout.size);
        Ok((buffer, sbt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct HitData {
        color: [f32; 3],
        id: u32,
    }

    fn header(tag: u8) -> SbtHeader {
        SbtHeader {
            storage: [tag; SBT_RECORD_HEADER_SIZE],
        }
    }

    #[test]
    fn record_sizes_are_aligned() {
        assert_eq!(std::mem::size_of::<EmptyRecord>(), 32);
        assert_eq!(std::mem::size_of::<SbtRecord<HitData>>(), 64);
        assert_eq!(std::mem::size_of::<SbtRecord<u64>>(), 64);
        assert_eq!(std::mem::align_of::<SbtRecord<u8>>(), SBT_RECORD_ALIGNMENT);
        assert_eq!(SbtRecord::<HitData>::data_offset(), 32);
    }

    #[test]
    fn record_bytes_put_header_first() {
        let record = SbtRecord::from_header(
            header(0xab),
            HitData {
                color: [1.0, 0.0, 0.0],
                id: 7,
            },
        );
        let bytes = record.record_bytes();
        assert_eq!(bytes.len(), 64);
        assert!(bytes[..32].iter().all(|&b| b == 0xab));
        assert_eq!(&bytes[32..36], &1.0f32.to_ne_bytes());
        assert_eq!(&bytes[44..48], &7u32.to_ne_bytes());
        assert!(bytes[48..].iter().all(|&b| b == 0));
    }

    #[test]
    fn regions_start_on_region_alignment() {
        let hit = SbtRecord::from_header(header(3), HitData::zeroed());
        let builder = ShaderBindingTableBuilder::new()
            .raygen(&EmptyRecord { header: header(1) })
            .miss(&EmptyRecord { header: header(2) })
            .miss(&EmptyRecord { header: header(2) })
            .hitgroup(&hit)
            .hitgroup(&hit)
            .hitgroup(&hit);
        let layout = builder.layout();
        let table = [
            ("raygen", layout.raygen),
            ("exception", layout.exception),
            ("miss", layout.miss),
            ("hitgroup", layout.hitgroup),
            ("callables", layout.callables),
        ]
        .iter()
        .map(|(name, r)| format!("{name}: offset={} stride={} count={}", r.offset, r.stride, r.count))
        .collect::<Vec<_>>()
        .join("\n");
        insta::assert_snapshot!(table, @r"
        raygen: offset=0 stride=32 count=1
        exception: offset=64 stride=0 count=0
        miss: offset=64 stride=32 count=2
        hitgroup: offset=128 stride=64 count=3
        callables: offset=320 stride=0 count=0
        ");
        assert_eq!(layout.size, 320);
    }

    #[test]
    fn record_lookup_respects_count() {
        let sbt = ShaderBindingTable {
            hitgroup_record_base: DevicePtr(0x1000),
            hitgroup_record_stride_in_bytes: 64,
            hitgroup_record_count: 2,
            ..Default::default()
        };
        assert_eq!(sbt.hitgroup_record(1), Some(DevicePtr(0x1040)));
        assert_eq!(sbt.hitgroup_record(2), None);
        assert_eq!(sbt.miss_record(0), None);
    }
}

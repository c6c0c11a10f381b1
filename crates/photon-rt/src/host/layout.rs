//! In-memory format of host acceleration structures.
//!
//! A structure is one position-independent blob:
//!
//! ```text
//! +--------------+ 0
//! | BvhHeader    |
//! +--------------+ nodes_offset
//! | BvhNode[]    |   children of node i are adjacent and stored after i
//! +--------------+ prims_offset
//! | PrimRef[]    |   leaf order
//! +--------------+ records_offset
//! | records      |   one fixed-stride record per PrimRef
//! +--------------+ used_size
//! ```
//!
//! Offsets are relative to the blob, so compaction is a plain copy of the
//! first `used_size` bytes.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use photon_core::{align_up, Aabb, Transform};

use crate::accel::AccelKind;
use crate::backend::{InstanceFlags, NativeInstance, TraversableHandle};

/// "PBVH"
pub const BVH_MAGIC: u32 = 0x4856_4250;
/// Bytes reserved for the header.
pub const HEADER_SIZE: u64 = 64;
/// Alignment of each section and of the structure itself.
pub const SECTION_ALIGNMENT: u64 = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BvhHeader {
    pub magic: u32,
    pub kind: u32,
    pub flags: u32,
    pub node_count: u32,
    pub prim_count: u32,
    pub input_count: u32,
    pub nodes_offset: u32,
    pub prims_offset: u32,
    pub records_offset: u32,
    pub used_size: u32,
    pub record_stride: u32,
    /// Primitives described by the inputs, including inactive ones.
    pub source_count: u32,
}

impl BvhHeader {
    pub fn kind(&self) -> Option<AccelKind> {
        kind_from_u32(self.kind)
    }
}

pub const fn kind_to_u32(kind: AccelKind) -> u32 {
    match kind {
        AccelKind::Triangle => 1,
        AccelKind::Aabb => 2,
        AccelKind::Curve => 3,
        AccelKind::Sphere => 4,
        AccelKind::Instance => 5,
    }
}

pub const fn kind_from_u32(value: u32) -> Option<AccelKind> {
    match value {
        1 => Some(AccelKind::Triangle),
        2 => Some(AccelKind::Aabb),
        3 => Some(AccelKind::Curve),
        4 => Some(AccelKind::Sphere),
        5 => Some(AccelKind::Instance),
        _ => None,
    }
}

/// Interior node when `count == 0`, leaf over `count` prims otherwise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct BvhNode {
    pub min: [f32; 3],
    /// First child (interior) or first prim (leaf).
    pub left_first: u32,
    pub max: [f32; 3],
    pub count: u32,
}

impl BvhNode {
    pub fn bounds(&self) -> Aabb {
        Aabb::new(Vec3::from(self.min), Vec3::from(self.max))
    }

    pub fn set_bounds(&mut self, bounds: &Aabb) {
        self.min = bounds.min.to_array();
        self.max = bounds.max.to_array();
    }

    pub const fn is_leaf(&self) -> bool {
        self.count > 0
    }
}

/// Origin of one primitive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PrimRef {
    pub input_index: u32,
    pub primitive_index: u32,
    /// SBT record index within the structure.
    pub sbt_index: u32,
    /// Geometry or instance flag bits.
    pub flags: u32,
}

/// Triangle vertices, `w` unused.
pub type TriangleRecord = [[f32; 4]; 3];

/// Box of a custom primitive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct AabbRecord {
    pub min: [f32; 4],
    pub max: [f32; 4],
}

/// Center in `xyz`, radius in `w`.
pub type SphereRecord = [f32; 4];

/// Up to four control points, radius in `w`, plus the basis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct CurveRecord {
    pub points: [[f32; 4]; 4],
    pub curve_type: u32,
    pub reserved: [u32; 3],
}

/// An instance resolved at build time.
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct InstanceRecord {
    pub object_to_world: [f32; 12],
    pub world_to_object: [f32; 12],
    pub child: u64,
    pub instance_id: u32,
    pub sbt_offset: u32,
    pub visibility_mask: u32,
    pub flags: u32,
    pub reserved: [u32; 2],
}

/// An instance as uploaded for an instance build input.
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct EncodedInstance {
    pub transform: [f32; 12],
    pub traversable: u64,
    pub instance_id: u32,
    pub sbt_offset: u32,
    pub visibility_mask: u32,
    pub flags: u32,
    pub reserved: [u32; 2],
}

impl From<&NativeInstance> for EncodedInstance {
    fn from(instance: &NativeInstance) -> Self {
        Self {
            transform: instance.transform.0,
            traversable: instance.traversable.0,
            instance_id: instance.instance_id,
            sbt_offset: instance.sbt_offset,
            visibility_mask: instance.visibility_mask,
            flags: instance.flags.bits(),
            reserved: [0; 2],
        }
    }
}

impl EncodedInstance {
    pub fn child(&self) -> TraversableHandle {
        TraversableHandle(self.traversable)
    }

    pub fn flags(&self) -> InstanceFlags {
        InstanceFlags::from_bits_truncate(self.flags)
    }

    pub fn transform(&self) -> Transform {
        Transform(self.transform)
    }
}

pub const fn record_stride(kind: AccelKind) -> u64 {
    (match kind {
        AccelKind::Triangle => std::mem::size_of::<TriangleRecord>(),
        AccelKind::Aabb => std::mem::size_of::<AabbRecord>(),
        AccelKind::Curve => std::mem::size_of::<CurveRecord>(),
        AccelKind::Sphere => std::mem::size_of::<SphereRecord>(),
        AccelKind::Instance => std::mem::size_of::<InstanceRecord>(),
    }) as u64
}

/// Section placement of a structure over `prim_count` primitives and
/// `node_count` nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlobLayout {
    pub nodes_offset: u64,
    pub prims_offset: u64,
    pub records_offset: u64,
    pub size: u64,
}

impl BlobLayout {
    pub const fn new(kind: AccelKind, node_count: u64, prim_count: u64) -> Self {
        let nodes_offset = HEADER_SIZE;
        let prims_offset = align_up(
            nodes_offset + node_count * std::mem::size_of::<BvhNode>() as u64,
            SECTION_ALIGNMENT,
        );
        let records_offset = align_up(
            prims_offset + prim_count * std::mem::size_of::<PrimRef>() as u64,
            SECTION_ALIGNMENT,
        );
        let size = align_up(
            records_offset + prim_count * record_stride(kind),
            SECTION_ALIGNMENT,
        );
        Self {
            nodes_offset,
            prims_offset,
            records_offset,
            size,
        }
    }

    /// Worst case for `prim_count` primitives: a full binary tree.
    pub const fn worst_case(kind: AccelKind, prim_count: u64) -> Self {
        let nodes = if prim_count == 0 { 0 } else { 2 * prim_count - 1 };
        Self::new(kind, nodes, prim_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes() {
        assert_eq!(std::mem::size_of::<BvhHeader>(), 48);
        assert_eq!(std::mem::size_of::<BvhNode>(), 32);
        assert_eq!(std::mem::size_of::<PrimRef>(), 16);
        assert_eq!(std::mem::size_of::<CurveRecord>(), 80);
        assert_eq!(std::mem::size_of::<InstanceRecord>(), 128);
        assert_eq!(std::mem::size_of::<EncodedInstance>(), 80);
    }

    #[test]
    fn layout_is_aligned() {
        let layout = BlobLayout::worst_case(AccelKind::Aabb, 3);
        assert_eq!(layout.nodes_offset, 64);
        assert_eq!(layout.prims_offset, 64 + 5 * 32);
        assert_eq!(layout.records_offset, 224 + 3 * 16);
        assert_eq!(layout.size, 272 + 3 * 32);
    }

    #[test]
    fn compact_layout_is_smaller() {
        let worst = BlobLayout::worst_case(AccelKind::Triangle, 100);
        let compact = BlobLayout::new(AccelKind::Triangle, 50, 100);
        assert!(compact.size < worst.size);
    }

    #[test]
    fn kinds_round_trip() {
        for kind in [
            AccelKind::Triangle,
            AccelKind::Aabb,
            AccelKind::Curve,
            AccelKind::Sphere,
            AccelKind::Instance,
        ] {
            assert_eq!(kind_from_u32(kind_to_u32(kind)), Some(kind));
        }
        assert_eq!(kind_from_u32(0), None);
    }
}

//! Writing, updating and reading structure blobs in host device memory.

use photon_core::{Aabb, DevicePtr};
use photon_gpu::{GpuError, HostMemory, MemoryBlock, Result};

use super::bvh;
use super::geometry::{self, Records};
use super::layout::{
    kind_to_u32, record_stride, BlobLayout, BvhHeader, BvhNode, PrimRef, BVH_MAGIC,
};
use crate::accel::AccelKind;
use crate::backend::{NativeBuildInput, TraversableHandle};

/// A structure read back for traversal.
pub struct DecodedBvh {
    pub kind: AccelKind,
    pub nodes: Vec<BvhNode>,
    /// Leaf order.
    pub prims: Vec<PrimRef>,
    /// One record per entry of `prims`.
    pub records: Records,
}

fn section(value: u64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| GpuError::DeviceFault(format!("structure of {value} bytes exceeds 4 GiB")))
}

fn read_header(memory: &HostMemory, ptr: DevicePtr) -> Result<(BvhHeader, AccelKind)> {
    let header: BvhHeader = memory.read(ptr)?;
    match header.kind() {
        Some(kind) if header.magic == BVH_MAGIC => Ok((header, kind)),
        _ => Err(GpuError::DeviceFault(format!(
            "no acceleration structure at {ptr:?}"
        ))),
    }
}

/// Build a structure over `inputs` into `output`. Returns the bytes used,
/// which is also the size the structure compacts to.
#[cfg_attr(
    feature = "profiling-tracy",
    tracing::instrument(level = "trace", skip_all)
)]
pub fn build(
    memory: &HostMemory,
    output: MemoryBlock,
    inputs: &[NativeBuildInput],
    fast_build: bool,
    child_bounds: impl Fn(TraversableHandle) -> Result<Aabb>,
) -> Result<u64> {
    let gathered = geometry::gather(memory, inputs, child_bounds)?;
    let kind = gathered.records.kind();
    let tree = bvh::build(&gathered.bounds, fast_build);
    let layout = BlobLayout::new(kind, tree.nodes.len() as u64, tree.order.len() as u64);
    if layout.size > output.size {
        return Err(GpuError::DeviceFault(format!(
            "structure needs {} bytes, output holds {}",
            layout.size, output.size
        )));
    }

    let header = BvhHeader {
        magic: BVH_MAGIC,
        kind: kind_to_u32(kind),
        flags: 0,
        node_count: tree.nodes.len() as u32,
        prim_count: tree.order.len() as u32,
        input_count: inputs.len() as u32,
        nodes_offset: section(layout.nodes_offset)?,
        prims_offset: section(layout.prims_offset)?,
        records_offset: section(layout.records_offset)?,
        used_size: section(layout.size)?,
        record_stride: record_stride(kind) as u32,
        source_count: gathered.prims.len() as u32,
    };

    let mut blob = vec![0u8; layout.size as usize];
    blob[..std::mem::size_of::<BvhHeader>()].copy_from_slice(bytemuck::bytes_of(&header));
    write_at(&mut blob, layout.nodes_offset, bytemuck::cast_slice(&tree.nodes));
    let prims: Vec<PrimRef> = tree
        .order
        .iter()
        .map(|&i| gathered.prims[i as usize])
        .collect();
    write_at(&mut blob, layout.prims_offset, bytemuck::cast_slice(&prims));
    let records = gathered
        .records
        .reordered_bytes(tree.order.iter().map(|&i| i as usize));
    write_at(&mut blob, layout.records_offset, &records);

    memory.write_bytes(output.ptr, &blob)?;
    Ok(layout.size)
}

fn write_at(blob: &mut [u8], offset: u64, bytes: &[u8]) {
    let offset = offset as usize;
    blob[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// Refit the structure at `output` to the current contents of `inputs`.
///
/// The tree topology is kept. Primitives left out of the original build
/// because their bounds were empty stay out.
#[cfg_attr(
    feature = "profiling-tracy",
    tracing::instrument(level = "trace", skip_all)
)]
pub fn update(
    memory: &HostMemory,
    output: MemoryBlock,
    inputs: &[NativeBuildInput],
    child_bounds: impl Fn(TraversableHandle) -> Result<Aabb>,
) -> Result<u64> {
    let (header, kind) = read_header(memory, output.ptr)?;
    let gathered = geometry::gather(memory, inputs, child_bounds)?;
    if gathered.records.kind() != kind
        || header.input_count as usize != inputs.len()
        || header.source_count as usize != gathered.prims.len()
    {
        return Err(GpuError::DeviceFault(
            "update inputs do not match the built structure".into(),
        ));
    }

    let mut starts = Vec::with_capacity(inputs.len());
    let mut total = 0usize;
    for input in inputs {
        starts.push(total);
        total += input.primitive_count() as usize;
    }

    let nodes_ptr = output.ptr.offset(u64::from(header.nodes_offset));
    let prims_ptr = output.ptr.offset(u64::from(header.prims_offset));
    let mut nodes: Vec<BvhNode> = memory.read_vec(nodes_ptr, header.node_count as usize)?;
    let stored: Vec<PrimRef> = memory.read_vec(prims_ptr, header.prim_count as usize)?;
    let order = stored
        .iter()
        .map(|p| {
            starts
                .get(p.input_index as usize)
                .map(|start| start + p.primitive_index as usize)
                .filter(|&i| i < gathered.prims.len())
                .ok_or_else(|| GpuError::DeviceFault("corrupt primitive table".into()))
        })
        .collect::<Result<Vec<usize>>>()?;

    let leaf_bounds: Vec<Aabb> = order.iter().map(|&i| gathered.bounds[i]).collect();
    bvh::refit(&mut nodes, &leaf_bounds);
    let prims: Vec<PrimRef> = order.iter().map(|&i| gathered.prims[i]).collect();
    let records = gathered.records.reordered_bytes(order.iter().copied());

    memory.write_bytes(nodes_ptr, bytemuck::cast_slice(&nodes))?;
    memory.write_bytes(prims_ptr, bytemuck::cast_slice(&prims))?;
    memory.write_bytes(
        output.ptr.offset(u64::from(header.records_offset)),
        &records,
    )?;
    Ok(u64::from(header.used_size))
}

/// Bytes in use by the structure at `ptr`.
pub fn used_size(memory: &HostMemory, ptr: DevicePtr) -> Result<u64> {
    Ok(u64::from(read_header(memory, ptr)?.0.used_size))
}

/// Object-space bounds of the structure at `ptr`.
pub fn root_bounds(memory: &HostMemory, ptr: DevicePtr) -> Result<Aabb> {
    let (header, _) = read_header(memory, ptr)?;
    if header.node_count == 0 {
        return Ok(Aabb::EMPTY);
    }
    let root: BvhNode = memory.read(ptr.offset(u64::from(header.nodes_offset)))?;
    Ok(root.bounds())
}

/// Read the whole structure at `ptr`.
pub fn decode(memory: &HostMemory, ptr: DevicePtr) -> Result<DecodedBvh> {
    let (header, kind) = read_header(memory, ptr)?;
    let count = header.prim_count as usize;
    let nodes = memory.read_vec(
        ptr.offset(u64::from(header.nodes_offset)),
        header.node_count as usize,
    )?;
    let prims = memory.read_vec(ptr.offset(u64::from(header.prims_offset)), count)?;
    let at = ptr.offset(u64::from(header.records_offset));
    let records = match kind {
        AccelKind::Triangle => Records::Triangles(memory.read_vec(at, count)?),
        AccelKind::Aabb => Records::Aabbs(memory.read_vec(at, count)?),
        AccelKind::Curve => Records::Curves(memory.read_vec(at, count)?),
        AccelKind::Sphere => Records::Spheres(memory.read_vec(at, count)?),
        AccelKind::Instance => Records::Instances(memory.read_vec(at, count)?),
    };
    Ok(DecodedBvh {
        kind,
        nodes,
        prims,
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NativeAabbs, NativeSbtRecords};
    use glam::Vec3;

    fn boxes(memory: &HostMemory, centers: &[Vec3]) -> NativeBuildInput {
        let boxes: Vec<Aabb> = centers
            .iter()
            .map(|&c| Aabb::from_center(c, Vec3::splat(0.5)))
            .collect();
        let block = memory.allocate(24 * boxes.len() as u64, "boxes").unwrap();
        memory
            .write_bytes(block.ptr, bytemuck::cast_slice(&boxes))
            .unwrap();
        NativeBuildInput::Aabbs(NativeAabbs {
            aabbs: block.ptr,
            num_primitives: boxes.len() as u32,
            sbt: NativeSbtRecords::default(),
        })
    }

    fn no_children(_: TraversableHandle) -> Result<Aabb> {
        Err(GpuError::DeviceFault("no children".into()))
    }

    #[test]
    fn build_then_decode() {
        let memory = HostMemory::new(0);
        let centers: Vec<Vec3> = (0..10).map(|i| Vec3::new(i as f32, 0.0, 0.0)).collect();
        let input = boxes(&memory, &centers);
        let worst = BlobLayout::worst_case(AccelKind::Aabb, 10);
        let output = memory.allocate(worst.size, "blob").unwrap();
        let used = build(&memory, output, &[input], false, no_children).unwrap();
        assert!(used <= worst.size);
        assert_eq!(used_size(&memory, output.ptr).unwrap(), used);

        let decoded = decode(&memory, output.ptr).unwrap();
        assert_eq!(decoded.kind, AccelKind::Aabb);
        assert_eq!(decoded.prims.len(), 10);
        let root = root_bounds(&memory, output.ptr).unwrap();
        assert_eq!(root.min, Vec3::new(-0.5, -0.5, -0.5));
        assert_eq!(root.max, Vec3::new(9.5, 0.5, 0.5));
    }

    #[test]
    fn update_moves_bounds() {
        let memory = HostMemory::new(0);
        let centers: Vec<Vec3> = (0..6).map(|i| Vec3::new(0.0, i as f32, 0.0)).collect();
        let input = boxes(&memory, &centers);
        let output = memory
            .allocate(BlobLayout::worst_case(AccelKind::Aabb, 6).size, "blob")
            .unwrap();
        build(&memory, output, &[input.clone()], false, no_children).unwrap();

        let NativeBuildInput::Aabbs(aabbs) = &input else {
            unreachable!()
        };
        let moved = Aabb::from_center(Vec3::new(0.0, 20.0, 0.0), Vec3::splat(0.5));
        memory.write(aabbs.aabbs, &moved).unwrap();
        update(&memory, output, &[input], no_children).unwrap();
        assert_eq!(root_bounds(&memory, output.ptr).unwrap().min.y, 0.5);
        assert_eq!(root_bounds(&memory, output.ptr).unwrap().max.y, 20.5);
    }

    #[test]
    fn update_rejects_changed_counts() {
        let memory = HostMemory::new(0);
        let input = boxes(&memory, &[Vec3::ZERO, Vec3::ONE]);
        let output = memory
            .allocate(BlobLayout::worst_case(AccelKind::Aabb, 2).size, "blob")
            .unwrap();
        build(&memory, output, &[input], false, no_children).unwrap();
        let other = boxes(&memory, &[Vec3::ZERO]);
        assert!(update(&memory, output, &[other], no_children).is_err());
    }

    #[test]
    fn garbage_is_not_a_structure() {
        let memory = HostMemory::new(0);
        let block = memory.allocate(64, "zeros").unwrap();
        assert!(decode(&memory, block.ptr).is_err());
    }
}

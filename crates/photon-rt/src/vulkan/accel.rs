//! Acceleration structures on `VK_KHR_acceleration_structure`.
//!
//! Build inputs map onto one geometry each. A traversable handle is the
//! structure's device address, which is also what instances reference.

use std::sync::Arc;

use ash::vk;
use photon_core::{DevicePtr, Float3A};
use photon_gpu::VulkanShared;

use crate::backend::{
    AccelBuildOptions, BuildFlags, GeometryFlags, InstanceFlags, NativeBuildInput,
    NativeInstance,
};
use crate::error::{Result, RtError};

/// Size of `VkAccelerationStructureInstanceKHR`.
pub const INSTANCE_STRIDE: u64 = 64;
/// Largest value of a 24-bit instance field.
pub const MAX_INSTANCE_FIELD: u32 = (1 << 24) - 1;
/// `VkAccelerationStructureCreateInfoKHR::offset` must be a multiple of this.
pub const STRUCTURE_ALIGNMENT: u64 = 256;

/// Geometries of one build with their primitive counts.
pub struct Geometries {
    pub ty: vk::AccelerationStructureTypeKHR,
    pub geometries: Vec<vk::AccelerationStructureGeometryKHR<'static>>,
    pub counts: Vec<u32>,
}

impl Geometries {
    pub fn ranges(&self) -> Vec<vk::AccelerationStructureBuildRangeInfoKHR> {
        self.counts
            .iter()
            .map(|&count| vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(count))
            .collect()
    }
}

fn build_flags(flags: BuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut out = vk::BuildAccelerationStructureFlagsKHR::empty();
    if flags.contains(BuildFlags::ALLOW_UPDATE) {
        out |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
    }
    if flags.contains(BuildFlags::ALLOW_COMPACTION) {
        out |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;
    }
    if flags.contains(BuildFlags::PREFER_FAST_TRACE) {
        out |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
    } else if flags.contains(BuildFlags::PREFER_FAST_BUILD) {
        out |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD;
    }
    out
}

fn geometry_flags(flags: &[GeometryFlags]) -> Result<vk::GeometryFlagsKHR> {
    if flags.len() > 1 {
        return Err(RtError::unsupported(
            "inputs with more than one SBT record are not supported on Vulkan",
        ));
    }
    let flags = flags.first().copied().unwrap_or_default();
    if flags.contains(GeometryFlags::DISABLE_TRIANGLE_FACE_CULLING) {
        return Err(RtError::unsupported(
            "per-geometry face culling control is not supported on Vulkan",
        ));
    }
    let mut out = vk::GeometryFlagsKHR::empty();
    if flags.contains(GeometryFlags::DISABLE_ANYHIT) {
        out |= vk::GeometryFlagsKHR::OPAQUE;
    }
    if flags.contains(GeometryFlags::REQUIRE_SINGLE_ANYHIT_CALL) {
        out |= vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION;
    }
    Ok(out)
}

fn address(ptr: DevicePtr) -> vk::DeviceOrHostAddressConstKHR {
    vk::DeviceOrHostAddressConstKHR {
        device_address: ptr.0,
    }
}

/// Translate native inputs into Vulkan geometries.
pub fn geometries(inputs: &[NativeBuildInput]) -> Result<Geometries> {
    let mut ty = None;
    let mut geometries = Vec::with_capacity(inputs.len());
    let mut counts = Vec::with_capacity(inputs.len());
    for input in inputs {
        let (input_ty, geometry) = match input {
            NativeBuildInput::Triangles(t) => {
                if !t.sbt.index_offsets.is_null() {
                    return Err(RtError::unsupported(
                        "per-primitive SBT offsets are not supported on Vulkan",
                    ));
                }
                let index_type = if t.indices.is_null() {
                    vk::IndexType::NONE_KHR
                } else {
                    vk::IndexType::UINT32
                };
                let stride = if t.vertex_stride == 0 {
                    std::mem::size_of::<Float3A>() as u64
                } else {
                    u64::from(t.vertex_stride)
                };
                let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                    .vertex_format(vk::Format::R32G32B32_SFLOAT)
                    .vertex_data(address(t.vertices))
                    .vertex_stride(stride)
                    .max_vertex(t.num_vertices.saturating_sub(1))
                    .index_type(index_type)
                    .index_data(address(t.indices));
                let geometry = vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .flags(geometry_flags(&t.sbt.flags)?)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { triangles });
                (vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL, geometry)
            }
            NativeBuildInput::Aabbs(a) => {
                if !a.sbt.index_offsets.is_null() {
                    return Err(RtError::unsupported(
                        "per-primitive SBT offsets are not supported on Vulkan",
                    ));
                }
                let aabbs = vk::AccelerationStructureGeometryAabbsDataKHR::default()
                    .data(address(a.aabbs))
                    .stride(std::mem::size_of::<vk::AabbPositionsKHR>() as u64);
                let geometry = vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::AABBS)
                    .flags(geometry_flags(&a.sbt.flags)?)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { aabbs });
                (vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL, geometry)
            }
            NativeBuildInput::Instances(i) => {
                let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    .array_of_pointers(false)
                    .data(address(i.instances));
                let geometry = vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { instances });
                (vk::AccelerationStructureTypeKHR::TOP_LEVEL, geometry)
            }
            NativeBuildInput::Curves(_) => {
                return Err(RtError::unsupported("curves are not supported on Vulkan"));
            }
            NativeBuildInput::Spheres(_) => {
                return Err(RtError::unsupported("spheres are not supported on Vulkan"));
            }
        };
        if geometries
            .first()
            .is_some_and(|first: &vk::AccelerationStructureGeometryKHR| {
                first.geometry_type != geometry.geometry_type
            })
        {
            return Err(RtError::invalid_value("build inputs of mixed primitive types"));
        }
        ty = Some(input_ty);
        geometries.push(geometry);
        counts.push(input.primitive_count());
    }
    let ty = ty.ok_or_else(|| RtError::invalid_value("no build inputs"))?;
    if ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL && geometries.len() > 1 {
        return Err(RtError::invalid_value("more than one instance input"));
    }
    Ok(Geometries {
        ty,
        geometries,
        counts,
    })
}

/// Geometry info for a build or update of `geometries`.
pub fn build_info<'a>(
    options: &AccelBuildOptions,
    geometries: &'a Geometries,
    mode: vk::BuildAccelerationStructureModeKHR,
) -> vk::AccelerationStructureBuildGeometryInfoKHR<'a> {
    vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(geometries.ty)
        .flags(build_flags(options.flags))
        .mode(mode)
        .geometries(&geometries.geometries)
}

fn instance_flags(flags: InstanceFlags) -> u8 {
    let mut out = 0;
    if flags.contains(InstanceFlags::DISABLE_TRIANGLE_FACE_CULLING) {
        out |= vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw();
    }
    if flags.contains(InstanceFlags::FLIP_TRIANGLE_FACING) {
        out |= vk::GeometryInstanceFlagsKHR::TRIANGLE_FLIP_FACING.as_raw();
    }
    if flags.contains(InstanceFlags::DISABLE_ANYHIT) {
        out |= vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE.as_raw();
    }
    if flags.contains(InstanceFlags::ENFORCE_ANYHIT) {
        out |= vk::GeometryInstanceFlagsKHR::FORCE_NO_OPAQUE.as_raw();
    }
    if flags.contains(InstanceFlags::FORCE_OPACITY_MICROMAP_2_STATE) {
        out |= vk::GeometryInstanceFlagsKHR::FORCE_OPACITY_MICROMAP_2_STATE_EXT.as_raw();
    }
    if flags.contains(InstanceFlags::DISABLE_OPACITY_MICROMAPS) {
        out |= vk::GeometryInstanceFlagsKHR::DISABLE_OPACITY_MICROMAPS_EXT.as_raw();
    }
    out as u8
}

/// Pack instances as `VkAccelerationStructureInstanceKHR`.
pub fn encode_instances(instances: &[NativeInstance]) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(instances.len() * INSTANCE_STRIDE as usize);
    for (index, instance) in instances.iter().enumerate() {
        if instance.instance_id > MAX_INSTANCE_FIELD || instance.sbt_offset > MAX_INSTANCE_FIELD {
            return Err(RtError::invalid_value(format!(
                "instance {index}: id and SBT offset must fit in 24 bits"
            )));
        }
        for value in instance.transform.0 {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        let mask = (instance.visibility_mask & 0xFF) << 24;
        bytes.extend_from_slice(&(instance.instance_id | mask).to_le_bytes());
        let flags = u32::from(instance_flags(instance.flags)) << 24;
        bytes.extend_from_slice(&(instance.sbt_offset | flags).to_le_bytes());
        bytes.extend_from_slice(&instance.traversable.0.to_le_bytes());
    }
    Ok(bytes)
}

/// Query pool for one compacted-size readback, destroyed once the stream
/// no longer needs it.
pub struct SizeQuery {
    shared: Arc<VulkanShared>,
    pub pool: vk::QueryPool,
}

impl SizeQuery {
    pub fn new(shared: Arc<VulkanShared>) -> Result<Self> {
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(1);
        let pool = unsafe { shared.device().create_query_pool(&info, None)? };
        Ok(Self { shared, pool })
    }
}

impl Drop for SizeQuery {
    fn drop(&mut self) {
        unsafe { self.shared.device().destroy_query_pool(self.pool, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NativeAabbs, NativeInstances, NativeSbtRecords, TraversableHandle};
    use photon_core::Transform;

    #[test]
    fn instances_pack_into_native_layout() {
        let instance = NativeInstance {
            transform: Transform::from_translation(glam::Vec3::new(1.0, 2.0, 3.0)),
            instance_id: 7,
            sbt_offset: 2,
            visibility_mask: 0x0F,
            flags: InstanceFlags::DISABLE_ANYHIT,
            traversable: TraversableHandle(0xABCD_0000),
        };
        let bytes = encode_instances(&[instance]).unwrap();
        assert_eq!(bytes.len() as u64, INSTANCE_STRIDE);
        let word = |at: usize| u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        assert_eq!(f32::from_bits(word(12)), 1.0);
        assert_eq!(word(48), 7 | (0x0F << 24));
        assert_eq!(word(52), 2 | (0x04 << 24));
        assert_eq!(
            u64::from_le_bytes(bytes[56..64].try_into().unwrap()),
            0xABCD_0000
        );
    }

    #[test]
    fn oversized_instance_ids_are_rejected() {
        let instance = NativeInstance {
            transform: Transform::IDENTITY,
            instance_id: 1 << 24,
            sbt_offset: 0,
            visibility_mask: 0xFF,
            flags: InstanceFlags::empty(),
            traversable: TraversableHandle::NULL,
        };
        assert!(encode_instances(&[instance]).is_err());
    }

    #[test]
    fn geometry_and_instances_do_not_mix() {
        let aabbs = NativeBuildInput::Aabbs(NativeAabbs {
            aabbs: DevicePtr(0x1000),
            num_primitives: 4,
            sbt: NativeSbtRecords::default(),
        });
        let instances = NativeBuildInput::Instances(NativeInstances {
            instances: DevicePtr(0x2000),
            num_instances: 1,
        });
        let single = geometries(std::slice::from_ref(&aabbs)).unwrap();
        assert_eq!(single.ty, vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
        assert_eq!(single.counts, vec![4]);
        assert!(geometries(&[aabbs, instances]).is_err());
    }

    #[test]
    fn multiple_records_are_unsupported() {
        let flags = [GeometryFlags::empty(), GeometryFlags::DISABLE_ANYHIT];
        let err = geometry_flags(&flags).unwrap_err();
        assert_eq!(err.status(), crate::error::Status::Unsupported);
        assert_eq!(
            geometry_flags(&[GeometryFlags::DISABLE_ANYHIT]).unwrap(),
            vk::GeometryFlagsKHR::OPAQUE
        );
    }
}

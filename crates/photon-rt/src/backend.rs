//! Backend interface of the ray tracing layer.
//!
//! [`RtBackend`] is the narrow set of native operations the acceleration
//! structure, module and pipeline types are written against. Build inputs
//! reach the backend as raw device pointers; the backend reads them when
//! the enqueued work executes, not when the call returns.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use photon_core::{DevicePtr, Transform};
use photon_gpu::{MemoryBlock, Stream};

use crate::context::DeviceProperties;
use crate::error::Result;
use crate::host::HostProgramImage;
use crate::sbt::{SbtHeader, ShaderBindingTable};

/// Opaque handle of a built acceleration structure, as referenced from
/// launch parameters and instances. Zero is the null handle.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct TraversableHandle(pub u64);

impl TraversableHandle {
    /// The null handle of an unbuilt structure.
    pub const NULL: Self = Self(0);

    /// Whether this is the null handle.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for TraversableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraversableHandle({:#x})", self.0)
    }
}

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub u64);
    };
}

opaque_handle!(
    /// Backend module object.
    ModuleHandle
);
opaque_handle!(
    /// Backend program group object.
    ProgramGroupHandle
);
opaque_handle!(
    /// Backend pipeline object.
    PipelineHandle
);

bitflags! {
    /// Acceleration structure build flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BuildFlags: u32 {
        const ALLOW_UPDATE = 1 << 0;
        const ALLOW_COMPACTION = 1 << 1;
        const PREFER_FAST_TRACE = 1 << 2;
        const PREFER_FAST_BUILD = 1 << 3;
    }
}

bitflags! {
    /// Per-SBT-record geometry flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct GeometryFlags: u32 {
        const DISABLE_ANYHIT = 1 << 0;
        const REQUIRE_SINGLE_ANYHIT_CALL = 1 << 1;
        const DISABLE_TRIANGLE_FACE_CULLING = 1 << 2;
    }
}

bitflags! {
    /// Per-instance flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct InstanceFlags: u32 {
        const DISABLE_TRIANGLE_FACE_CULLING = 1 << 0;
        const FLIP_TRIANGLE_FACING = 1 << 1;
        const DISABLE_ANYHIT = 1 << 2;
        const ENFORCE_ANYHIT = 1 << 3;
        const FORCE_OPACITY_MICROMAP_2_STATE = 1 << 4;
        const DISABLE_OPACITY_MICROMAPS = 1 << 5;
    }
}

/// Whether a build constructs a new structure or updates one in place.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BuildOperation {
    #[default]
    Build,
    /// Refit the structure behind the handle, keeping its topology.
    Update(TraversableHandle),
}

/// Options shared by every input of one build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccelBuildOptions {
    pub flags: BuildFlags,
    pub operation: BuildOperation,
}

/// Memory a build needs, from [`RtBackend::accel_compute_memory_usage`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccelBufferSizes {
    /// Bytes of the structure itself.
    pub output_size: u64,
    /// Scratch bytes of a full build.
    pub temp_size: u64,
    /// Scratch bytes of an update.
    pub temp_update_size: u64,
}

/// Curve basis of a curve build input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CurveType {
    #[default]
    RoundLinear = 0x2503,
    RoundQuadraticBSpline = 0x2501,
    RoundCubicBSpline = 0x2502,
    RoundCatmullRom = 0x2504,
    RoundCubicBezier = 0x2507,
    FlatQuadraticBSpline = 0x2505,
}

impl CurveType {
    /// Control points per segment.
    pub const fn control_points(self) -> u32 {
        match self {
            Self::RoundLinear => 2,
            Self::RoundQuadraticBSpline | Self::FlatQuadraticBSpline => 3,
            Self::RoundCubicBSpline | Self::RoundCatmullRom | Self::RoundCubicBezier => 4,
        }
    }
}

/// Per-primitive SBT record selection shared by geometry inputs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NativeSbtRecords {
    /// Geometry flags, one entry per SBT record.
    pub flags: Vec<GeometryFlags>,
    /// Per-primitive record offsets, `u32` each. Null when there is one
    /// record.
    pub index_offsets: DevicePtr,
}

impl NativeSbtRecords {
    /// Number of SBT records the input occupies.
    pub fn count(&self) -> u32 {
        self.flags.len().max(1) as u32
    }
}

/// Triangle input in native form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeTriangles {
    /// `Float3A` vertices.
    pub vertices: DevicePtr,
    pub num_vertices: u32,
    pub vertex_stride: u32,
    /// Packed `[u32; 3]` triplets; null for implicit indexing.
    pub indices: DevicePtr,
    pub num_index_triplets: u32,
    pub sbt: NativeSbtRecords,
}

impl NativeTriangles {
    /// Number of triangles described.
    pub fn primitive_count(&self) -> u32 {
        if self.indices.is_null() {
            self.num_vertices / 3
        } else {
            self.num_index_triplets
        }
    }
}

/// Custom primitive input in native form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeAabbs {
    /// Tightly packed `Aabb` values.
    pub aabbs: DevicePtr,
    pub num_primitives: u32,
    pub sbt: NativeSbtRecords,
}

/// Curve input in native form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeCurves {
    pub curve_type: CurveType,
    /// `Float3A` control points.
    pub vertices: DevicePtr,
    /// `f32` radius per control point.
    pub widths: DevicePtr,
    pub num_vertices: u32,
    /// `u32` index of the first control point of each segment.
    pub indices: DevicePtr,
    pub num_primitives: u32,
    pub flags: GeometryFlags,
}

/// Sphere input in native form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeSpheres {
    /// `Float3A` centers.
    pub centers: DevicePtr,
    /// `f32` radius per sphere, or a single radius when `single_radius`.
    pub radii: DevicePtr,
    pub num_vertices: u32,
    pub single_radius: bool,
    pub sbt: NativeSbtRecords,
}

/// Instance input in native form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeInstances {
    /// Encoded instances, [`RtBackend::instance_stride`] bytes each.
    pub instances: DevicePtr,
    pub num_instances: u32,
}

/// One build input as handed to the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NativeBuildInput {
    Triangles(NativeTriangles),
    Aabbs(NativeAabbs),
    Curves(NativeCurves),
    Spheres(NativeSpheres),
    Instances(NativeInstances),
}

impl NativeBuildInput {
    /// Primitives (or instances) described by this input.
    pub fn primitive_count(&self) -> u32 {
        match self {
            Self::Triangles(t) => t.primitive_count(),
            Self::Aabbs(a) => a.num_primitives,
            Self::Curves(c) => c.num_primitives,
            Self::Spheres(s) => s.num_vertices,
            Self::Instances(i) => i.num_instances,
        }
    }

    /// SBT records occupied by this input.
    pub fn sbt_record_count(&self) -> u32 {
        match self {
            Self::Triangles(t) => t.sbt.count(),
            Self::Aabbs(a) => a.sbt.count(),
            Self::Spheres(s) => s.sbt.count(),
            Self::Curves(_) => 1,
            Self::Instances(_) => 0,
        }
    }
}

/// An instance before backend encoding.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NativeInstance {
    pub transform: Transform,
    pub instance_id: u32,
    pub sbt_offset: u32,
    pub visibility_mask: u32,
    pub flags: InstanceFlags,
    pub traversable: TraversableHandle,
}

bitflags! {
    /// Exceptions a pipeline checks for.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ExceptionFlags: u32 {
        const STACK_OVERFLOW = 1 << 0;
        const TRACE_DEPTH = 1 << 1;
        const USER = 1 << 2;
        const DEBUG = 1 << 3;
    }
}

/// Options applied when compiling a module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleCompileOptions {
    /// Optimisation level 0..=3.
    pub opt_level: u32,
    /// Emit debug information.
    pub debug: bool,
}

impl Default for ModuleCompileOptions {
    fn default() -> Self {
        Self {
            opt_level: 3,
            debug: false,
        }
    }
}

/// Options shared by every module and program of one pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineCompileOptions {
    /// 32-bit payload registers passed through `trace`.
    pub num_payload_values: u32,
    /// 32-bit attribute registers reported by intersection programs.
    pub num_attribute_values: u32,
    pub exception_flags: ExceptionFlags,
    /// Deepest nesting of `trace` calls.
    pub max_trace_depth: u32,
}

impl Default for PipelineCompileOptions {
    fn default() -> Self {
        Self {
            num_payload_values: 2,
            num_attribute_values: 2,
            exception_flags: ExceptionFlags::empty(),
            max_trace_depth: 1,
        }
    }
}

/// Options applied when linking a pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineLinkOptions {
    pub max_trace_depth: u32,
}

impl Default for PipelineLinkOptions {
    fn default() -> Self {
        Self { max_trace_depth: 1 }
    }
}

/// Compiled device code a module is created from.
#[derive(Clone)]
pub enum ModuleSource {
    /// SPIR-V words for the Vulkan backend.
    Spirv(Vec<u32>),
    /// Registered program image for the host backend.
    Host(HostProgramImage),
}

impl fmt::Debug for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spirv(words) => write!(f, "Spirv({} words)", words.len()),
            Self::Host(image) => write!(f, "Host({:?})", image.name()),
        }
    }
}

/// A named entry point of a module.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntryPoint {
    pub module: ModuleHandle,
    pub name: String,
}

/// Program group to create in the backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProgramGroupDesc {
    Raygen(EntryPoint),
    Miss(EntryPoint),
    Exception(EntryPoint),
    HitGroup {
        closest_hit: Option<EntryPoint>,
        any_hit: Option<EntryPoint>,
        intersection: Option<EntryPoint>,
    },
    Callables {
        direct: Option<EntryPoint>,
        continuation: Option<EntryPoint>,
    },
}

/// Native operations of a ray tracing backend.
pub trait RtBackend: Send + Sync {
    /// Device ordinal used in diagnostics.
    fn device_id(&self) -> u32;

    /// Short backend name.
    fn name(&self) -> &'static str;

    /// Limits of the device.
    fn properties(&self) -> DeviceProperties;

    /// Required alignment of the structure within its output buffer.
    fn structure_alignment(&self) -> u64;

    /// Sizes of the buffers a build of `inputs` needs.
    fn accel_compute_memory_usage(
        &self,
        options: &AccelBuildOptions,
        inputs: &[NativeBuildInput],
    ) -> Result<AccelBufferSizes>;

    /// Enqueue a build or update of `inputs` into `output`.
    ///
    /// When `compacted_size` is given, the size the structure compacts to is
    /// written there as a `u64` once the build has executed.
    #[allow(clippy::too_many_arguments)]
    fn accel_build(
        &self,
        stream: &dyn Stream,
        options: &AccelBuildOptions,
        inputs: &[NativeBuildInput],
        temp: MemoryBlock,
        output: MemoryBlock,
        compacted_size: Option<DevicePtr>,
    ) -> Result<TraversableHandle>;

    /// Enqueue a compacting copy of `source` into `output`.
    fn accel_compact(
        &self,
        stream: &dyn Stream,
        source: TraversableHandle,
        output: MemoryBlock,
    ) -> Result<TraversableHandle>;

    /// Forget a handle whose memory is about to be freed.
    fn accel_release(&self, handle: TraversableHandle);

    /// Bytes of one encoded instance.
    fn instance_stride(&self) -> u64;

    /// Encode instances for an instance build input.
    fn encode_instances(&self, instances: &[NativeInstance]) -> Result<Vec<u8>>;

    /// Create a module from compiled code.
    fn module_create(
        &self,
        source: &ModuleSource,
        module_options: &ModuleCompileOptions,
        pipeline_options: &PipelineCompileOptions,
    ) -> Result<ModuleHandle>;

    fn module_destroy(&self, module: ModuleHandle);

    /// Create a program group. Fails with `NotFound` when an entry point
    /// does not exist in its module.
    fn program_group_create(&self, desc: &ProgramGroupDesc) -> Result<ProgramGroupHandle>;

    fn program_group_destroy(&self, group: ProgramGroupHandle);

    /// Header identifying `group` in binding table records.
    fn sbt_record_pack_header(&self, group: ProgramGroupHandle) -> Result<SbtHeader>;

    /// Link program groups into a pipeline.
    fn pipeline_create(
        &self,
        groups: &[ProgramGroupHandle],
        compile_options: &PipelineCompileOptions,
        link_options: &PipelineLinkOptions,
    ) -> Result<PipelineHandle>;

    fn pipeline_destroy(&self, pipeline: PipelineHandle);

    /// Enqueue a `width x height x depth` launch.
    #[allow(clippy::too_many_arguments)]
    fn launch(
        &self,
        pipeline: PipelineHandle,
        stream: &dyn Stream,
        params: DevicePtr,
        params_size: u64,
        sbt: &ShaderBindingTable,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<()>;
}

/// A built structure together with the memory backing it.
///
/// Dropping it forgets the handle, then frees the memory. Retired
/// structures are handed to [`Stream::defer_release`] so both happen after
/// in-flight work that reads them.
pub(crate) struct OwnedAccel {
    pub backend: Arc<dyn RtBackend>,
    pub handle: TraversableHandle,
    pub buffer: photon_gpu::DeviceBuffer,
}

impl Drop for OwnedAccel {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            self.backend.accel_release(self.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle() {
        assert!(TraversableHandle::NULL.is_null());
        assert!(!TraversableHandle(0x100).is_null());
        assert_eq!(std::mem::size_of::<TraversableHandle>(), 8);
    }

    #[test]
    fn implicit_triangle_indices() {
        let triangles = NativeTriangles {
            vertices: DevicePtr(0x1000),
            num_vertices: 9,
            vertex_stride: 16,
            indices: DevicePtr::NULL,
            num_index_triplets: 0,
            sbt: NativeSbtRecords::default(),
        };
        assert_eq!(triangles.primitive_count(), 3);
        assert_eq!(triangles.sbt.count(), 1);
    }

    #[test]
    fn curve_segments() {
        assert_eq!(CurveType::RoundLinear.control_points(), 2);
        assert_eq!(CurveType::RoundCubicBezier.control_points(), 4);
        assert_eq!(CurveType::RoundQuadraticBSpline as u32, 0x2501);
    }
}

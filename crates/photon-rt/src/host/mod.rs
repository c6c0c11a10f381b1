//! Software reference backend.
//!
//! Runs on a [`HostDevice`]: structures are BVH blobs in emulated device
//! memory, programs are closures from a [`HostProgramImage`], and builds and
//! launches are tasks on the device's [`HostStream`]s. Everything the
//! Vulkan backend does can be exercised here without a GPU.

mod blob;
mod bvh;
mod geometry;
mod launch;
mod layout;
mod program;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use photon_core::{align_up, DevicePtr};
use photon_gpu::{GpuError, HostDevice, HostMemory, HostStream, MemoryBlock, Stream};

pub use launch::{
    HitContext, LaunchContext, EXCEPTION_TRACE_DEPTH_EXCEEDED, HIT_KIND_BACK_FACE,
    HIT_KIND_FRONT_FACE, MAX_ATTRIBUTES, MAX_PAYLOAD_VALUES,
};
pub use program::{HostProgramImage, HostProgramImageBuilder, RayFlags, TraceRay};

use crate::accel::AccelKind;
use crate::backend::{
    AccelBufferSizes, AccelBuildOptions, BuildFlags, BuildOperation, EntryPoint, ExceptionFlags,
    ModuleCompileOptions, ModuleHandle, ModuleSource, NativeBuildInput, NativeInstance,
    PipelineCompileOptions, PipelineHandle, PipelineLinkOptions, ProgramGroupDesc,
    ProgramGroupHandle, RtBackend, TraversableHandle,
};
use crate::context::DeviceProperties;
use crate::error::{Result, RtError};
use crate::module::ProgramKind;
use crate::sbt::{SbtHeader, ShaderBindingTable};
use layout::{BlobLayout, EncodedInstance, SECTION_ALIGNMENT};
use program::{HostGroup, HostProgram};

/// First bytes of every record header this backend packs.
const RECORD_MAGIC: [u8; 4] = *b"PHRG";
/// Alignment of a structure within its output buffer.
const STRUCTURE_ALIGNMENT: u64 = 128;
const _: () = assert!(STRUCTURE_ALIGNMENT % SECTION_ALIGNMENT == 0);

/// Group key named by a record header, if it is one of ours.
fn decode_header(header: &[u8]) -> Option<u64> {
    if header.len() < 16 || header[..4] != RECORD_MAGIC {
        return None;
    }
    let id: [u8; 8] = header[8..16].try_into().ok()?;
    Some(u64::from_le_bytes(id))
}

fn encode_header(device_id: u32, key: u64) -> SbtHeader {
    let mut header = SbtHeader::default();
    header.storage[..4].copy_from_slice(&RECORD_MAGIC);
    header.storage[4..8].copy_from_slice(&device_id.to_le_bytes());
    header.storage[8..16].copy_from_slice(&key.to_le_bytes());
    header
}

fn names_module(desc: &ProgramGroupDesc, module: ModuleHandle) -> bool {
    let entries: [Option<&EntryPoint>; 3] = match desc {
        ProgramGroupDesc::Raygen(entry)
        | ProgramGroupDesc::Miss(entry)
        | ProgramGroupDesc::Exception(entry) => [Some(entry), None, None],
        ProgramGroupDesc::HitGroup {
            closest_hit,
            any_hit,
            intersection,
        } => [closest_hit.as_ref(), any_hit.as_ref(), intersection.as_ref()],
        ProgramGroupDesc::Callables {
            direct,
            continuation,
        } => [direct.as_ref(), continuation.as_ref(), None],
    };
    entries.into_iter().flatten().any(|e| e.module == module)
}

/// A created program group.
///
/// Record headers carry `key`, not the handle: every group created from the
/// same description shares one key, so headers packed before a group was
/// destroyed and created again still select it.
struct LiveGroup {
    key: u64,
    group: Arc<HostGroup>,
}

/// A linked pipeline: its groups as they were at link time, by key.
pub(crate) struct PipelineState {
    groups: HashMap<u64, Arc<HostGroup>>,
    exception_flags: ExceptionFlags,
    max_trace_depth: u32,
}

/// Objects of one backend, by id.
#[derive(Default)]
pub(crate) struct Registry {
    next_id: AtomicU64,
    modules: RwLock<HashMap<u64, HostProgramImage>>,
    groups: RwLock<HashMap<u64, LiveGroup>>,
    /// Header key of every group description seen on a live module.
    group_keys: RwLock<HashMap<ProgramGroupDesc, u64>>,
    pipelines: RwLock<HashMap<u64, Arc<PipelineState>>>,
    /// Handles of built structures whose memory is still owned.
    structures: RwLock<HashSet<u64>>,
}

impl Registry {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn group_key(&self, desc: &ProgramGroupDesc) -> u64 {
        if let Some(&key) = self.group_keys.read().get(desc) {
            return key;
        }
        *self
            .group_keys
            .write()
            .entry(desc.clone())
            .or_insert_with(|| self.next_id())
    }

    fn is_live(&self, handle: TraversableHandle) -> bool {
        self.structures.read().contains(&handle.0)
    }

    /// Object-space bounds of a live structure, read on the stream.
    fn child_bounds(
        &self,
        memory: &HostMemory,
        handle: TraversableHandle,
    ) -> photon_gpu::Result<photon_core::Aabb> {
        if !self.is_live(handle) {
            return Err(GpuError::DeviceFault(format!(
                "instance child {handle:?} is not a live acceleration structure"
            )));
        }
        blob::root_bounds(memory, DevicePtr(handle.0))
    }
}

/// [`RtBackend`] over a [`HostDevice`].
pub struct HostBackend {
    device_id: u32,
    memory: Arc<HostMemory>,
    registry: Arc<Registry>,
}

impl HostBackend {
    pub fn new(device: &HostDevice) -> Self {
        Self {
            device_id: device.memory().device_id(),
            memory: Arc::clone(device.memory()),
            registry: Arc::new(Registry::default()),
        }
    }

    /// Number of structures whose handles are currently valid.
    pub fn live_structures(&self) -> usize {
        self.registry.structures.read().len()
    }

    fn host_stream<'s>(&self, stream: &'s dyn Stream) -> Result<&'s HostStream> {
        let host = stream
            .as_any()
            .downcast_ref::<HostStream>()
            .ok_or_else(|| RtError::invalid_value("stream is not a host stream"))?;
        if !Arc::ptr_eq(host.memory(), &self.memory) {
            return Err(RtError::invalid_value(
                "stream belongs to another host device",
            ));
        }
        Ok(host)
    }
}

fn input_kind(inputs: &[NativeBuildInput]) -> Result<AccelKind> {
    let kind_of = |input: &NativeBuildInput| match input {
        NativeBuildInput::Triangles(_) => AccelKind::Triangle,
        NativeBuildInput::Aabbs(_) => AccelKind::Aabb,
        NativeBuildInput::Curves(_) => AccelKind::Curve,
        NativeBuildInput::Spheres(_) => AccelKind::Sphere,
        NativeBuildInput::Instances(_) => AccelKind::Instance,
    };
    let Some(first) = inputs.first().map(kind_of) else {
        return Err(RtError::invalid_value("no build inputs"));
    };
    if inputs.iter().any(|input| kind_of(input) != first) {
        return Err(RtError::invalid_value("build inputs of mixed primitive types"));
    }
    if first == AccelKind::Instance && inputs.len() > 1 {
        return Err(RtError::invalid_value("more than one instance input"));
    }
    Ok(first)
}

/// Check that `entry` names a `kind` program and return it.
fn resolve_entry(
    modules: &HashMap<u64, HostProgramImage>,
    entry: &EntryPoint,
    kind: ProgramKind,
) -> Result<HostProgram> {
    let image = modules
        .get(&entry.module.0)
        .ok_or_else(|| RtError::invalid_value(format!("unknown module {:?}", entry.module)))?;
    let program = image.get(&entry.name).cloned().ok_or_else(|| {
        RtError::not_found(format!(
            "entry point '{}' not found in image '{}'",
            entry.name,
            image.name()
        ))
    })?;
    if program.kind() != kind {
        return Err(RtError::invalid_value(format!(
            "'{}' is registered as a {:?} program, not {kind:?}",
            entry.name,
            program.kind()
        )));
    }
    Ok(program)
}

impl RtBackend for HostBackend {
    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn name(&self) -> &'static str {
        "host"
    }

    fn properties(&self) -> DeviceProperties {
        DeviceProperties {
            rtcore_version: 0,
            max_trace_depth: 31,
            max_traversable_graph_depth: 2,
            max_primitives_per_gas: 1 << 29,
            max_instances_per_ias: 1 << 24,
            max_instance_id: (1 << 28) - 1,
            max_sbt_records_per_gas: 1 << 24,
            max_sbt_offset: (1 << 28) - 1,
            num_bits_instance_visibility_mask: 8,
            shader_group_handle_size: 32,
        }
    }

    fn structure_alignment(&self) -> u64 {
        STRUCTURE_ALIGNMENT
    }

    fn accel_compute_memory_usage(
        &self,
        options: &AccelBuildOptions,
        inputs: &[NativeBuildInput],
    ) -> Result<AccelBufferSizes> {
        let kind = input_kind(inputs)?;
        let prims: u64 = inputs
            .iter()
            .map(|input| u64::from(input.primitive_count()))
            .sum();
        let temp_update_size = if options.flags.contains(BuildFlags::ALLOW_UPDATE) {
            SECTION_ALIGNMENT
        } else {
            0
        };
        Ok(AccelBufferSizes {
            output_size: BlobLayout::worst_case(kind, prims).size,
            // Bounds and centroids of every primitive.
            temp_size: align_up((prims * 36).max(1), SECTION_ALIGNMENT),
            temp_update_size,
        })
    }

    fn accel_build(
        &self,
        stream: &dyn Stream,
        options: &AccelBuildOptions,
        inputs: &[NativeBuildInput],
        temp: MemoryBlock,
        output: MemoryBlock,
        compacted_size: Option<DevicePtr>,
    ) -> Result<TraversableHandle> {
        let stream = self.host_stream(stream)?;
        let sizes = self.accel_compute_memory_usage(options, inputs)?;
        let handle = TraversableHandle(output.ptr.addr());
        if output.ptr.is_null() || output.ptr.addr() % STRUCTURE_ALIGNMENT != 0 {
            return Err(RtError::invalid_value(format!(
                "output {:?} is not aligned to {STRUCTURE_ALIGNMENT} bytes",
                output.ptr
            )));
        }
        match options.operation {
            BuildOperation::Build => {
                if output.size < sizes.output_size || temp.size < sizes.temp_size {
                    return Err(RtError::invalid_value(format!(
                        "build needs {} output and {} temp bytes, got {} and {}",
                        sizes.output_size, sizes.temp_size, output.size, temp.size
                    )));
                }
            }
            BuildOperation::Update(source) => {
                if source != handle || !self.registry.is_live(source) {
                    return Err(RtError::invalid_value(format!(
                        "update of {source:?} must write the structure in place"
                    )));
                }
                if temp.size < sizes.temp_update_size {
                    return Err(RtError::invalid_value("update temp buffer is too small"));
                }
            }
        }

        let inputs = inputs.to_vec();
        let registry = Arc::clone(&self.registry);
        let operation = options.operation;
        let fast_build = options.flags.contains(BuildFlags::PREFER_FAST_BUILD);
        stream.enqueue(move |memory| {
            let child_bounds = |child| registry.child_bounds(memory, child);
            let used = match operation {
                BuildOperation::Build => {
                    blob::build(memory, output, &inputs, fast_build, child_bounds)?
                }
                BuildOperation::Update(_) => blob::update(memory, output, &inputs, child_bounds)?,
            };
            if let Some(ptr) = compacted_size {
                memory.write(ptr, &used)?;
            }
            Ok(())
        })?;
        if operation == BuildOperation::Build {
            self.registry.structures.write().insert(handle.0);
        }
        tracing::debug!(
            "Enqueued {operation:?} at {handle:?} ({} output bytes reserved)",
            output.size
        );
        Ok(handle)
    }

    fn accel_compact(
        &self,
        stream: &dyn Stream,
        source: TraversableHandle,
        output: MemoryBlock,
    ) -> Result<TraversableHandle> {
        let stream = self.host_stream(stream)?;
        if !self.registry.is_live(source) {
            return Err(RtError::invalid_value(format!(
                "{source:?} is not a live acceleration structure"
            )));
        }
        if output.ptr.is_null() || output.ptr.addr() % STRUCTURE_ALIGNMENT != 0 {
            return Err(RtError::invalid_value("compaction output is not aligned"));
        }
        stream.enqueue(move |memory| {
            let used = blob::used_size(memory, DevicePtr(source.0))?;
            if used > output.size {
                return Err(GpuError::DeviceFault(format!(
                    "compacted structure needs {used} bytes, output holds {}",
                    output.size
                )));
            }
            memory.copy(output.ptr, DevicePtr(source.0), used)
        })?;
        let handle = TraversableHandle(output.ptr.addr());
        self.registry.structures.write().insert(handle.0);
        Ok(handle)
    }

    fn accel_release(&self, handle: TraversableHandle) {
        self.registry.structures.write().remove(&handle.0);
    }

    fn instance_stride(&self) -> u64 {
        std::mem::size_of::<EncodedInstance>() as u64
    }

    fn encode_instances(&self, instances: &[NativeInstance]) -> Result<Vec<u8>> {
        let encoded: Vec<EncodedInstance> = instances.iter().map(EncodedInstance::from).collect();
        Ok(bytemuck::cast_slice(&encoded).to_vec())
    }

    fn module_create(
        &self,
        source: &ModuleSource,
        _module_options: &ModuleCompileOptions,
        _pipeline_options: &PipelineCompileOptions,
    ) -> Result<ModuleHandle> {
        let ModuleSource::Host(image) = source else {
            return Err(RtError::unsupported(
                "the host backend runs host program images, not SPIR-V",
            ));
        };
        let id = self.registry.next_id();
        self.registry.modules.write().insert(id, image.clone());
        tracing::debug!("Loaded host image '{}' as module {id}", image.name());
        Ok(ModuleHandle(id))
    }

    fn module_destroy(&self, module: ModuleHandle) {
        self.registry.modules.write().remove(&module.0);
        self.registry
            .group_keys
            .write()
            .retain(|desc, _| !names_module(desc, module));
    }

    fn program_group_create(&self, desc: &ProgramGroupDesc) -> Result<ProgramGroupHandle> {
        let modules = self.registry.modules.read();
        let resolve = |entry: &EntryPoint, kind| resolve_entry(&modules, entry, kind);
        let mut group = HostGroup::default();
        match desc {
            ProgramGroupDesc::Raygen(entry) => {
                if let HostProgram::Raygen(p) = resolve(entry, ProgramKind::Raygen)? {
                    group.raygen = Some(p);
                }
            }
            ProgramGroupDesc::Miss(entry) => {
                if let HostProgram::Miss(p) = resolve(entry, ProgramKind::Miss)? {
                    group.miss = Some(p);
                }
            }
            ProgramGroupDesc::Exception(entry) => {
                if let HostProgram::Exception(p) = resolve(entry, ProgramKind::Exception)? {
                    group.exception = Some(p);
                }
            }
            ProgramGroupDesc::HitGroup {
                closest_hit,
                any_hit,
                intersection,
            } => {
                if let Some(entry) = closest_hit {
                    if let HostProgram::ClosestHit(p) = resolve(entry, ProgramKind::ClosestHit)? {
                        group.closest_hit = Some(p);
                    }
                }
                if let Some(entry) = any_hit {
                    if let HostProgram::AnyHit(p) = resolve(entry, ProgramKind::AnyHit)? {
                        group.any_hit = Some(p);
                    }
                }
                if let Some(entry) = intersection {
                    if let HostProgram::Intersection(p) =
                        resolve(entry, ProgramKind::Intersection)?
                    {
                        group.intersection = Some(p);
                    }
                }
            }
            ProgramGroupDesc::Callables {
                direct,
                continuation,
            } => {
                if let Some(entry) = direct {
                    if let HostProgram::DirectCallable(p) =
                        resolve(entry, ProgramKind::DirectCallable)?
                    {
                        group.direct = Some(p);
                    }
                }
                if let Some(entry) = continuation {
                    if let HostProgram::ContinuationCallable(p) =
                        resolve(entry, ProgramKind::ContinuationCallable)?
                    {
                        group.continuation = Some(p);
                    }
                }
            }
        }
        drop(modules);
        let key = self.registry.group_key(desc);
        let id = self.registry.next_id();
        let group = LiveGroup {
            key,
            group: Arc::new(group),
        };
        self.registry.groups.write().insert(id, group);
        Ok(ProgramGroupHandle(id))
    }

    fn program_group_destroy(&self, group: ProgramGroupHandle) {
        self.registry.groups.write().remove(&group.0);
    }

    fn sbt_record_pack_header(&self, group: ProgramGroupHandle) -> Result<SbtHeader> {
        let key = self
            .registry
            .groups
            .read()
            .get(&group.0)
            .map(|live| live.key)
            .ok_or_else(|| RtError::invalid_value(format!("unknown program group {group:?}")))?;
        Ok(encode_header(self.device_id, key))
    }

    fn pipeline_create(
        &self,
        groups: &[ProgramGroupHandle],
        compile_options: &PipelineCompileOptions,
        link_options: &PipelineLinkOptions,
    ) -> Result<PipelineHandle> {
        let known = self.registry.groups.read();
        let groups = groups
            .iter()
            .map(|g| {
                known
                    .get(&g.0)
                    .map(|live| (live.key, Arc::clone(&live.group)))
                    .ok_or_else(|| RtError::invalid_value(format!("unknown program group {g:?}")))
            })
            .collect::<Result<HashMap<_, _>>>()?;
        drop(known);
        let state = PipelineState {
            groups,
            exception_flags: compile_options.exception_flags,
            max_trace_depth: link_options.max_trace_depth,
        };
        let id = self.registry.next_id();
        self.registry.pipelines.write().insert(id, Arc::new(state));
        Ok(PipelineHandle(id))
    }

    fn pipeline_destroy(&self, pipeline: PipelineHandle) {
        self.registry.pipelines.write().remove(&pipeline.0);
    }

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
    ) -> Result<()> {
        let stream = self.host_stream(stream)?;
        let state = self
            .registry
            .pipelines
            .read()
            .get(&pipeline.0)
            .cloned()
            .ok_or_else(|| RtError::invalid_value(format!("unknown pipeline {pipeline:?}")))?;
        let registry = Arc::clone(&self.registry);
        let args = launch::LaunchArgs {
            params,
            params_size,
            sbt: *sbt,
            dims: [width, height, depth],
        };
        stream.enqueue(move |memory| launch::execute(memory, &registry, &state, &args))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NativeAabbs, NativeSbtRecords};
    use glam::Vec3;
    use photon_core::Aabb;
    use photon_gpu::{HostDeviceBuilder, StreamExt};

    #[test]
    fn headers_round_trip() {
        let header = encode_header(3, 42);
        assert_eq!(decode_header(&header.storage), Some(42));
        assert_eq!(decode_header(&[0u8; 32]), None);
    }

    #[test]
    fn recreated_groups_pack_the_same_header() {
        let device = HostDeviceBuilder::new().build().unwrap();
        let backend = HostBackend::new(&device);
        let image = HostProgramImage::builder("headers")
            .raygen("__raygen__main", |_| {})
            .miss("__miss__sky", |_| {})
            .build();
        let module = backend
            .module_create(
                &ModuleSource::Host(image),
                &ModuleCompileOptions::default(),
                &PipelineCompileOptions::default(),
            )
            .unwrap();
        let entry = |name: &str| EntryPoint {
            module,
            name: name.to_string(),
        };
        let raygen = ProgramGroupDesc::Raygen(entry("__raygen__main"));

        let first = backend.program_group_create(&raygen).unwrap();
        let header = backend.sbt_record_pack_header(first).unwrap();
        backend.program_group_destroy(first);
        let second = backend.program_group_create(&raygen).unwrap();
        assert_ne!(first, second);
        assert_eq!(backend.sbt_record_pack_header(second).unwrap(), header);

        let miss = backend
            .program_group_create(&ProgramGroupDesc::Miss(entry("__miss__sky")))
            .unwrap();
        assert_ne!(backend.sbt_record_pack_header(miss).unwrap(), header);
        assert!(backend.sbt_record_pack_header(first).is_err());
    }

    #[test]
    fn mixed_inputs_are_rejected() {
        let aabbs = NativeBuildInput::Aabbs(NativeAabbs {
            aabbs: DevicePtr(0x100),
            num_primitives: 1,
            sbt: NativeSbtRecords::default(),
        });
        let instances = NativeBuildInput::Instances(crate::backend::NativeInstances {
            instances: DevicePtr(0x200),
            num_instances: 1,
        });
        assert_eq!(input_kind(&[aabbs.clone()]).unwrap(), AccelKind::Aabb);
        assert!(input_kind(&[aabbs, instances]).is_err());
        assert!(input_kind(&[]).is_err());
    }

    #[test]
    fn build_compact_release() {
        let device = HostDeviceBuilder::new().build().unwrap();
        let backend = HostBackend::new(&device);
        let memory = device.memory();
        let stream = device.host_stream();

        let boxes: Vec<Aabb> = (0..8)
            .map(|i| Aabb::from_center(Vec3::splat(i as f32), Vec3::splat(0.25)))
            .collect();
        let input_block = memory.allocate(24 * 8, "boxes").unwrap();
        stream.upload_slice(input_block.ptr, &boxes).unwrap();
        let inputs = [NativeBuildInput::Aabbs(NativeAabbs {
            aabbs: input_block.ptr,
            num_primitives: 8,
            sbt: NativeSbtRecords::default(),
        })];
        let options = AccelBuildOptions {
            flags: BuildFlags::ALLOW_COMPACTION,
            operation: BuildOperation::Build,
        };
        let sizes = backend.accel_compute_memory_usage(&options, &inputs).unwrap();
        let temp = memory.allocate(sizes.temp_size, "temp").unwrap();
        let output = memory.allocate(sizes.output_size, "output").unwrap();
        let size = memory.allocate(8, "size").unwrap();

        let handle = backend
            .accel_build(stream, &options, &inputs, temp, output, Some(size.ptr))
            .unwrap();
        let used: u64 = stream.read_value(size.ptr).unwrap();
        assert!(used > 0 && used <= sizes.output_size);

        let compacted = memory.allocate(used, "compacted").unwrap();
        let copy = backend.accel_compact(stream, handle, compacted).unwrap();
        stream.sync().unwrap();
        assert_eq!(backend.live_structures(), 2);
        assert_eq!(
            blob::root_bounds(memory, DevicePtr(copy.0)).unwrap(),
            blob::root_bounds(memory, output.ptr).unwrap()
        );

        backend.accel_release(handle);
        backend.accel_release(copy);
        assert_eq!(backend.live_structures(), 0);
    }

    #[test]
    fn spirv_modules_are_unsupported() {
        let device = HostDeviceBuilder::new().build().unwrap();
        let backend = HostBackend::new(&device);
        let error = backend
            .module_create(
                &ModuleSource::Spirv(vec![0x0723_0203]),
                &ModuleCompileOptions::default(),
                &PipelineCompileOptions::default(),
            )
            .unwrap_err();
        assert_eq!(error.status(), crate::error::Status::Unsupported);
    }
}

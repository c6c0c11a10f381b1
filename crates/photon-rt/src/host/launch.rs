//! Software execution of launches.
//!
//! Every launch index runs its raygen program on the rayon pool. Traversal
//! follows the usual rules: nearest-first descent, instance masks and
//! transforms, any-hit filtering, closest-hit or miss once the ray is done.
//! A fault stops the invocation that raised it and fails the launch; the
//! stream reports it on the next sync.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytemuck::Pod;
use glam::{UVec3, Vec3};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use photon_core::{Aabb, DevicePtr, Ray, Transform};
use photon_gpu::{GpuError, HostMemory, Result};
use rayon::prelude::*;

use super::blob::{self, DecodedBvh};
use super::geometry::{self, Records};
use super::layout::PrimRef;
use super::program::{HostGroup, RayFlags, TraceRay};
use super::{PipelineState, Registry};
use crate::backend::{ExceptionFlags, GeometryFlags, InstanceFlags, TraversableHandle};
use crate::sbt::{ShaderBindingTable, SBT_RECORD_HEADER_SIZE};

/// Hit kind reported for front faces of built-in primitives.
pub const HIT_KIND_FRONT_FACE: u32 = 0xFE;
/// Hit kind reported for back faces of built-in primitives.
pub const HIT_KIND_BACK_FACE: u32 = 0xFF;
/// Exception code raised when `trace` nests deeper than the pipeline allows.
pub const EXCEPTION_TRACE_DEPTH_EXCEEDED: i32 = -2;
/// Attribute registers an intersection can report.
pub const MAX_ATTRIBUTES: usize = 8;
/// Payload registers a `trace` call can pass.
pub const MAX_PAYLOAD_VALUES: usize = 32;

/// Arguments of one launch.
pub(crate) struct LaunchArgs {
    pub params: DevicePtr,
    pub params_size: u64,
    pub sbt: ShaderBindingTable,
    pub dims: [u32; 3],
}

/// A binding table record whose header names a group of the pipeline.
struct Record {
    group: Arc<HostGroup>,
    data: DevicePtr,
}

#[derive(Default)]
struct ResolvedSbt {
    raygen: Option<Record>,
    exception: Option<Record>,
    /// `None` where the header does not name a linked group.
    miss: Vec<Option<Record>>,
    hit: Vec<Option<Record>>,
    callables: Vec<Option<Record>>,
}

fn resolve_sbt(
    memory: &HostMemory,
    sbt: &ShaderBindingTable,
    lookup: impl Fn(&[u8]) -> Option<Arc<HostGroup>>,
) -> Result<ResolvedSbt> {
    let read = |ptr: DevicePtr| -> Result<Option<Record>> {
        if ptr.is_null() {
            return Ok(None);
        }
        let mut header = [0u8; SBT_RECORD_HEADER_SIZE];
        memory.read_bytes(ptr, &mut header)?;
        Ok(lookup(&header).map(|group| Record {
            group,
            data: ptr.offset(SBT_RECORD_HEADER_SIZE as u64),
        }))
    };
    let region = |base: DevicePtr, stride: u32, count: u32| -> Result<Vec<Option<Record>>> {
        if base.is_null() {
            return Ok(Vec::new());
        }
        (0..count)
            .map(|i| read(base.offset(u64::from(stride) * u64::from(i))))
            .collect()
    };
    Ok(ResolvedSbt {
        raygen: read(sbt.raygen_record)?,
        exception: read(sbt.exception_record)?,
        miss: region(
            sbt.miss_record_base,
            sbt.miss_record_stride_in_bytes,
            sbt.miss_record_count,
        )?,
        hit: region(
            sbt.hitgroup_record_base,
            sbt.hitgroup_record_stride_in_bytes,
            sbt.hitgroup_record_count,
        )?,
        callables: region(
            sbt.callables_record_base,
            sbt.callables_record_stride_in_bytes,
            sbt.callables_record_count,
        )?,
    })
}

/// State shared by every invocation of one launch.
struct LaunchShared<'m> {
    memory: &'m HostMemory,
    registry: &'m Registry,
    dims: UVec3,
    params: DevicePtr,
    params_size: u64,
    miss_region_used: bool,
    records: ResolvedSbt,
    max_trace_depth: u32,
    exception_flags: ExceptionFlags,
    /// Structures decoded so far, by handle.
    scenes: RwLock<HashMap<u64, Arc<DecodedBvh>>>,
    fault: Mutex<Option<GpuError>>,
    faulted: AtomicBool,
}

impl LaunchShared<'_> {
    fn record_fault(&self, message: String) {
        tracing::error!("Launch fault: {message}");
        self.fault
            .lock()
            .get_or_insert(GpuError::DeviceFault(message));
        self.faulted.store(true, Ordering::Relaxed);
    }
}

/// Run a launch to completion.
#[cfg_attr(
    feature = "profiling-tracy",
    tracing::instrument(level = "trace", skip_all)
)]
pub(crate) fn execute(
    memory: &HostMemory,
    registry: &Registry,
    pipeline: &PipelineState,
    args: &LaunchArgs,
) -> Result<()> {
    let records = resolve_sbt(memory, &args.sbt, |header| {
        super::decode_header(header).and_then(|key| pipeline.groups.get(&key).cloned())
    })?;
    let (raygen, raygen_data) = records
        .raygen
        .as_ref()
        .and_then(|r| r.group.raygen.clone().map(|program| (program, r.data)))
        .ok_or_else(|| {
            GpuError::DeviceFault(
                "raygen record does not name a raygen program of the pipeline".into(),
            )
        })?;

    let [width, height, depth] = args.dims;
    let shared = LaunchShared {
        memory,
        registry,
        dims: UVec3::new(width, height, depth),
        params: args.params,
        params_size: args.params_size,
        miss_region_used: args.sbt.miss_record_count > 0,
        records,
        max_trace_depth: pipeline.max_trace_depth,
        exception_flags: pipeline.exception_flags,
        scenes: RwLock::new(HashMap::new()),
        fault: Mutex::new(None),
        faulted: AtomicBool::new(false),
    };

    let (w, h) = (u64::from(width), u64::from(height));
    let total = w * h * u64::from(depth);
    let run = || {
        (0..total).into_par_iter().for_each(|linear| {
            if shared.faulted.load(Ordering::Relaxed) {
                return;
            }
            let index = UVec3::new(
                (linear % w) as u32,
                ((linear / w) % h) as u32,
                (linear / (w * h)) as u32,
            );
            let aborted = Cell::new(false);
            let mut context = LaunchContext {
                core: Core {
                    shared: &shared,
                    index,
                    depth: 0,
                    sbt_data: raygen_data,
                    aborted: &aborted,
                    in_exception: false,
                },
            };
            raygen(&mut context);
        });
    };
    if panic::catch_unwind(AssertUnwindSafe(run)).is_err() {
        shared.record_fault("a program panicked".into());
    }
    shared.fault.into_inner().map_or(Ok(()), Err)
}

/// Per-invocation state every program context carries.
#[derive(Clone, Copy)]
struct Core<'a> {
    shared: &'a LaunchShared<'a>,
    index: UVec3,
    /// Nesting of `trace` calls; raygen runs at zero.
    depth: u32,
    sbt_data: DevicePtr,
    /// Set once the invocation faulted or handled an exception.
    aborted: &'a Cell<bool>,
    in_exception: bool,
}

impl Core<'_> {
    fn fault(&self, message: impl std::fmt::Display) {
        self.aborted.set(true);
        self.shared
            .record_fault(format!("launch index {}: {message}", self.index));
    }

    fn load<T: Pod>(&self, ptr: DevicePtr) -> T {
        self.shared.memory.read(ptr).unwrap_or_else(|e| {
            self.fault(e);
            T::zeroed()
        })
    }

    fn store<T: Pod>(&self, ptr: DevicePtr, value: &T) {
        if self.aborted.get() {
            return;
        }
        if let Err(e) = self.shared.memory.write(ptr, value) {
            self.fault(e);
        }
    }

    fn atomic<T: Default>(&self, op: impl FnOnce(&HostMemory) -> Result<T>) -> T {
        if self.aborted.get() {
            return T::default();
        }
        op(self.shared.memory).unwrap_or_else(|e| {
            self.fault(e);
            T::default()
        })
    }

    fn params<T: Pod>(&self) -> T {
        if std::mem::size_of::<T>() as u64 > self.shared.params_size {
            self.fault(format!(
                "parameters of {} bytes read as {} bytes",
                self.shared.params_size,
                std::mem::size_of::<T>()
            ));
            return T::zeroed();
        }
        self.load(self.shared.params)
    }

    fn scene(&self, handle: TraversableHandle) -> Option<Arc<DecodedBvh>> {
        let shared = self.shared;
        if let Some(scene) = shared.scenes.read().get(&handle.0) {
            return Some(Arc::clone(scene));
        }
        if !shared.registry.is_live(handle) {
            self.fault(format!("{handle:?} is not a live acceleration structure"));
            return None;
        }
        match blob::decode(shared.memory, DevicePtr(handle.0)) {
            Ok(scene) => Some(Arc::clone(
                shared
                    .scenes
                    .write()
                    .entry(handle.0)
                    .or_insert_with(|| Arc::new(scene)),
            )),
            Err(e) => {
                self.fault(e);
                None
            }
        }
    }

    fn trace(&self, ray: &TraceRay, payload: &mut [u32]) {
        if self.aborted.get() {
            return;
        }
        let depth = self.depth + 1;
        if depth > self.shared.max_trace_depth {
            self.raise(
                EXCEPTION_TRACE_DEPTH_EXCEEDED,
                ExceptionFlags::TRACE_DEPTH,
                &format!(
                    "trace depth {depth} exceeds the pipeline limit of {}",
                    self.shared.max_trace_depth
                ),
            );
            return;
        }
        if payload.len() > MAX_PAYLOAD_VALUES {
            self.fault(format!("payload of {} values", payload.len()));
            return;
        }
        let core = Core { depth, ..*self };
        Traversal::new(core, *ray, payload).run();
    }

    fn call(&self, index: u32, args: &mut [u32], continuation: bool) {
        if self.aborted.get() {
            return;
        }
        let program = self
            .shared
            .records
            .callables
            .get(index as usize)
            .and_then(Option::as_ref)
            .and_then(|record| {
                let group = &record.group;
                let program = if continuation {
                    group.continuation.clone()
                } else {
                    group.direct.clone()
                };
                program.map(|p| (p, record.data))
            });
        match program {
            Some((program, data)) => {
                let mut context = LaunchContext {
                    core: Core {
                        sbt_data: data,
                        ..*self
                    },
                };
                program(&mut context, args);
            }
            None => self.fault(format!(
                "callable record {index} holds no {} callable",
                if continuation { "continuation" } else { "direct" }
            )),
        }
    }

    fn raise(&self, code: i32, flag: ExceptionFlags, message: &str) {
        if self.aborted.get() {
            return;
        }
        let shared = self.shared;
        let handler = shared
            .records
            .exception
            .as_ref()
            .filter(|_| !self.in_exception && shared.exception_flags.contains(flag))
            .and_then(|r| r.group.exception.clone().map(|p| (p, r.data)));
        match handler {
            Some((program, data)) => {
                let mut context = LaunchContext {
                    core: Core {
                        sbt_data: data,
                        in_exception: true,
                        ..*self
                    },
                };
                program(&mut context, code);
                self.aborted.set(true);
            }
            None => self.fault(format!("unhandled exception {code}: {message}")),
        }
    }
}

/// Context of raygen, exception and callable programs.
pub struct LaunchContext<'a> {
    core: Core<'a>,
}

impl LaunchContext<'_> {
    /// Trace a ray. The payload is visible to every program the ray invokes.
    pub fn trace(&mut self, ray: &TraceRay, payload: &mut [u32]) {
        self.core.trace(ray, payload);
    }
}

/// Operations every program can perform.
macro_rules! device_access {
    ($($ty:tt)*) => {
        impl $($ty)* {
            pub fn launch_index(&self) -> UVec3 {
                self.core.index
            }

            pub fn launch_dimensions(&self) -> UVec3 {
                self.core.shared.dims
            }

            /// The launch parameters, read as `T`.
            pub fn params<T: Pod>(&self) -> T {
                self.core.params()
            }

            pub fn params_ptr(&self) -> DevicePtr {
                self.core.shared.params
            }

            /// Address of the user data following the current record's header.
            pub fn sbt_data_ptr(&self) -> DevicePtr {
                self.core.sbt_data
            }

            /// The current record's user data, read as `T`.
            pub fn sbt_data<T: Pod>(&self) -> T {
                self.core.load(self.core.sbt_data)
            }

            /// Read device memory. Faults on an invalid address and yields zero.
            pub fn load<T: Pod>(&self, ptr: DevicePtr) -> T {
                self.core.load(ptr)
            }

            /// Write device memory. Ignored after the invocation aborted.
            pub fn store<T: Pod>(&self, ptr: DevicePtr, value: T) {
                self.core.store(ptr, &value);
            }

            /// Atomic add returning the previous value.
            pub fn atomic_add_u32(&self, ptr: DevicePtr, value: u32) -> u32 {
                self.core.atomic(|memory| memory.atomic_add_u32(ptr, value))
            }

            /// Atomic add returning the previous value.
            pub fn atomic_add_u64(&self, ptr: DevicePtr, value: u64) -> u64 {
                self.core.atomic(|memory| memory.atomic_add_u64(ptr, value))
            }

            /// Invoke the direct callable of callable record `index`.
            pub fn call_direct(&mut self, index: u32, args: &mut [u32]) {
                self.core.call(index, args, false);
            }

            /// Invoke the continuation callable of callable record `index`.
            pub fn call_continuation(&mut self, index: u32, args: &mut [u32]) {
                self.core.call(index, args, true);
            }

            /// Raise a user exception. `code` must not be negative.
            pub fn throw_exception(&mut self, code: i32) {
                if code < 0 {
                    self.core.fault(format!("user exception code {code} is negative"));
                    return;
                }
                self.core.raise(
                    code,
                    ExceptionFlags::USER,
                    &format!("user exception {code}"),
                );
            }

            /// Whether the invocation stopped because of a fault or exception.
            pub fn is_aborted(&self) -> bool {
                self.core.aborted.get()
            }
        }
    };
}

device_access!(LaunchContext<'_>);
device_access!(HitContext<'_, '_>);

#[derive(Clone, Copy)]
struct InstanceHit {
    index: u32,
    id: u32,
    sbt_offset: u32,
    flags: InstanceFlags,
    object_to_world: [f32; 12],
    world_to_object: [f32; 12],
}

#[derive(Clone, Copy)]
struct Candidate<'t> {
    t: f32,
    hit_kind: u32,
    attributes: [u32; MAX_ATTRIBUTES],
    primitive_index: u32,
    sbt_gas_index: u32,
    geometry_flags: GeometryFlags,
    instance: Option<InstanceHit>,
    record: &'t Record,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Intersection,
    AnyHit,
    ClosestHit,
    Miss,
}

/// One ray in flight.
struct Traversal<'t> {
    core: Core<'t>,
    ray: TraceRay,
    payload: &'t mut [u32],
    /// Closest accepted distance so far.
    tmax: f32,
    committed: Option<Candidate<'t>>,
    done: bool,
    ignored: bool,
    terminate: bool,
    instance: Option<InstanceHit>,
    object_origin: Vec3,
    object_direction: Vec3,
}

impl<'t> Traversal<'t> {
    fn new(core: Core<'t>, ray: TraceRay, payload: &'t mut [u32]) -> Self {
        Self {
            core,
            ray,
            payload,
            tmax: ray.tmax,
            committed: None,
            done: false,
            ignored: false,
            terminate: false,
            instance: None,
            object_origin: ray.origin,
            object_direction: ray.direction,
        }
    }

    fn stopped(&self) -> bool {
        self.done || self.core.aborted.get()
    }

    fn run(&mut self) {
        if !self.ray.handle.is_null() {
            self.traverse(self.ray.handle, None);
        }
        if self.core.aborted.get() {
            return;
        }
        self.instance = None;
        self.object_origin = self.ray.origin;
        self.object_direction = self.ray.direction;
        match self.committed {
            Some(hit) => {
                if self.ray.flags.contains(RayFlags::DISABLE_CLOSESTHIT) {
                    return;
                }
                if let Some(program) = hit.record.group.closest_hit.clone() {
                    let mut context = HitContext::new(self, Some(hit), Role::ClosestHit);
                    program(&mut context);
                }
            }
            None => self.miss(),
        }
    }

    fn miss(&mut self) {
        let shared = self.core.shared;
        if !shared.miss_region_used {
            return;
        }
        let index = self.ray.miss_index;
        let record = shared.records.miss.get(index as usize).and_then(Option::as_ref);
        match record.and_then(|r| r.group.miss.clone().map(|p| (p, r.data))) {
            Some((program, data)) => {
                let mut context = HitContext::new(self, None, Role::Miss);
                context.core.sbt_data = data;
                program(&mut context);
            }
            None => self
                .core
                .fault(format!("miss record {index} does not name a miss program")),
        }
    }

    fn traverse(&mut self, handle: TraversableHandle, instance: Option<InstanceHit>) {
        let Some(scene) = self.core.scene(handle) else {
            return;
        };
        if matches!(scene.records, Records::Instances(_)) && instance.is_some() {
            self.core
                .fault("instance structures cannot be instanced by other instance structures");
            return;
        }
        let (origin, direction) = match &instance {
            Some(i) => geometry::to_object(&i.world_to_object, self.ray.origin, self.ray.direction),
            None => (self.ray.origin, self.ray.direction),
        };
        self.instance = instance;
        self.object_origin = origin;
        self.object_direction = direction;
        if scene.nodes.is_empty() {
            return;
        }

        let probe = Ray::unnormalized(origin, direction);
        let tmin = self.ray.tmin;
        let entry = |index: u32, tmax: f32| {
            scene.nodes[index as usize]
                .bounds()
                .intersect_ray(&probe, tmin, tmax)
                .map(|(near, _)| near)
        };
        let mut stack = Vec::with_capacity(64);
        if entry(0, self.tmax).is_some() {
            stack.push(0u32);
        }
        while let Some(index) = stack.pop() {
            if self.stopped() {
                return;
            }
            let node = scene.nodes[index as usize];
            if node.is_leaf() {
                let first = node.left_first as usize;
                for slot in first..first + node.count as usize {
                    self.primitive(&scene, slot, origin, direction, instance);
                    if self.stopped() {
                        return;
                    }
                }
                continue;
            }
            let left = node.left_first;
            let right = left + 1;
            match (entry(left, self.tmax), entry(right, self.tmax)) {
                (Some(l), Some(r)) if l <= r => stack.extend([right, left]),
                (Some(_), Some(_)) => stack.extend([left, right]),
                (Some(_), None) => stack.push(left),
                (None, Some(_)) => stack.push(right),
                (None, None) => {}
            }
        }
    }

    fn primitive(
        &mut self,
        scene: &DecodedBvh,
        slot: usize,
        origin: Vec3,
        direction: Vec3,
        instance: Option<InstanceHit>,
    ) {
        let prim = scene.prims[slot];
        let (tmin, tmax) = (self.ray.tmin, self.tmax);
        match &scene.records {
            Records::Instances(records) => {
                let record = &records[slot];
                if record.visibility_mask & self.ray.visibility_mask & 0xff == 0 {
                    return;
                }
                let hit = InstanceHit {
                    index: prim.primitive_index,
                    id: record.instance_id,
                    sbt_offset: record.sbt_offset,
                    flags: InstanceFlags::from_bits_truncate(record.flags),
                    object_to_world: record.object_to_world,
                    world_to_object: record.world_to_object,
                };
                self.traverse(TraversableHandle(record.child), Some(hit));
            }
            Records::Triangles(records) => {
                let Some((t, u, v, front)) =
                    geometry::intersect_triangle(&records[slot], origin, direction, tmin, tmax)
                else {
                    return;
                };
                let flags = GeometryFlags::from_bits_truncate(prim.flags);
                let instance_flags = instance.map_or(InstanceFlags::empty(), |i| i.flags);
                let front = front != instance_flags.contains(InstanceFlags::FLIP_TRIANGLE_FACING);
                let culling = !flags.contains(GeometryFlags::DISABLE_TRIANGLE_FACE_CULLING)
                    && !instance_flags.contains(InstanceFlags::DISABLE_TRIANGLE_FACE_CULLING);
                if culling
                    && ((front && self.ray.flags.contains(RayFlags::CULL_FRONT_FACING_TRIANGLES))
                        || (!front && self.ray.flags.contains(RayFlags::CULL_BACK_FACING_TRIANGLES)))
                {
                    return;
                }
                self.report_builtin(&prim, instance, t, front, &[u.to_bits(), v.to_bits()]);
            }
            Records::Spheres(records) => {
                if let Some((t, front)) =
                    geometry::intersect_sphere(&records[slot], origin, direction, tmin, tmax)
                {
                    self.report_builtin(&prim, instance, t, front, &[]);
                }
            }
            Records::Curves(records) => {
                if let Some((t, u)) =
                    geometry::intersect_curve(&records[slot], origin, direction, tmin, tmax)
                {
                    self.report_builtin(&prim, instance, t, true, &[u.to_bits()]);
                }
            }
            Records::Aabbs(records) => {
                let record = &records[slot];
                let bounds = Aabb::new(
                    Vec3::from_slice(&record.min[..3]),
                    Vec3::from_slice(&record.max[..3]),
                );
                let probe = Ray::unnormalized(origin, direction);
                if bounds.intersect_ray(&probe, tmin, tmax).is_none() {
                    return;
                }
                let Some(record) = self.hit_record(&prim, instance) else {
                    return;
                };
                let Some(program) = record.group.intersection.clone() else {
                    self.core.fault(format!(
                        "hit group of primitive {} has no intersection program",
                        prim.primitive_index
                    ));
                    return;
                };
                let candidate = Candidate {
                    t: tmax,
                    hit_kind: 0,
                    attributes: [0; MAX_ATTRIBUTES],
                    primitive_index: prim.primitive_index,
                    sbt_gas_index: prim.sbt_index,
                    geometry_flags: GeometryFlags::from_bits_truncate(prim.flags),
                    instance,
                    record,
                };
                let mut context = HitContext::new(self, Some(candidate), Role::Intersection);
                program(&mut context);
            }
        }
    }

    fn hit_record(&self, prim: &PrimRef, instance: Option<InstanceHit>) -> Option<&'t Record> {
        let shared = self.core.shared;
        let index = u64::from(self.ray.sbt_offset)
            + u64::from(self.ray.sbt_stride) * u64::from(prim.sbt_index)
            + u64::from(instance.map_or(0, |i| i.sbt_offset));
        let record = shared.records.hit.get(index as usize).and_then(Option::as_ref);
        if record.is_none() {
            self.core.fault(format!(
                "hit group record {index} is missing or names no program of the pipeline"
            ));
        }
        record
    }

    fn report_builtin(
        &mut self,
        prim: &PrimRef,
        instance: Option<InstanceHit>,
        t: f32,
        front: bool,
        attributes: &[u32],
    ) {
        let Some(record) = self.hit_record(prim, instance) else {
            return;
        };
        let mut attrs = [0; MAX_ATTRIBUTES];
        attrs[..attributes.len()].copy_from_slice(attributes);
        self.consider(Candidate {
            t,
            hit_kind: if front {
                HIT_KIND_FRONT_FACE
            } else {
                HIT_KIND_BACK_FACE
            },
            attributes: attrs,
            primitive_index: prim.primitive_index,
            sbt_gas_index: prim.sbt_index,
            geometry_flags: GeometryFlags::from_bits_truncate(prim.flags),
            instance,
            record,
        });
    }

    /// Run any-hit filtering on `candidate` and commit it if accepted.
    fn consider(&mut self, candidate: Candidate<'t>) -> bool {
        if !(candidate.t >= self.ray.tmin && candidate.t <= self.tmax) {
            return false;
        }
        let ray_flags = self.ray.flags;
        let mut opaque = candidate.geometry_flags.contains(GeometryFlags::DISABLE_ANYHIT);
        if let Some(instance) = candidate.instance {
            if instance.flags.contains(InstanceFlags::DISABLE_ANYHIT) {
                opaque = true;
            } else if instance.flags.contains(InstanceFlags::ENFORCE_ANYHIT) {
                opaque = false;
            }
        }
        if ray_flags.contains(RayFlags::DISABLE_ANYHIT) {
            opaque = true;
        } else if ray_flags.contains(RayFlags::ENFORCE_ANYHIT) {
            opaque = false;
        }
        if (opaque && ray_flags.contains(RayFlags::CULL_DISABLED_ANYHIT))
            || (!opaque && ray_flags.contains(RayFlags::CULL_ENFORCED_ANYHIT))
        {
            return false;
        }

        if !opaque {
            if let Some(program) = candidate.record.group.any_hit.clone() {
                self.ignored = false;
                let mut context = HitContext::new(self, Some(candidate), Role::AnyHit);
                program(&mut context);
                if self.ignored || self.core.aborted.get() {
                    return false;
                }
            }
        }

        self.tmax = candidate.t;
        self.committed = Some(candidate);
        if self.terminate || ray_flags.contains(RayFlags::TERMINATE_ON_FIRST_HIT) {
            self.done = true;
        }
        true
    }
}

/// Context of intersection, any-hit, closest-hit and miss programs.
pub struct HitContext<'a, 't> {
    traversal: &'a mut Traversal<'t>,
    core: Core<'t>,
    hit: Option<Candidate<'t>>,
    role: Role,
}

impl<'a, 't> HitContext<'a, 't> {
    fn new(traversal: &'a mut Traversal<'t>, hit: Option<Candidate<'t>>, role: Role) -> Self {
        let core = Core {
            sbt_data: hit.map_or(traversal.core.sbt_data, |h| h.record.data),
            ..traversal.core
        };
        Self {
            traversal,
            core,
            hit,
            role,
        }
    }

    fn require(&self, role: Role, operation: &str) -> bool {
        if self.role == role {
            return true;
        }
        self.core
            .fault(format!("{operation} called from a {:?} program", self.role));
        false
    }

    /// Payload value `index`.
    pub fn payload(&self, index: usize) -> u32 {
        match self.traversal.payload.get(index) {
            Some(&value) => value,
            None => {
                self.core.fault(format!("payload index {index} out of range"));
                0
            }
        }
    }

    pub fn set_payload(&mut self, index: usize, value: u32) {
        match self.traversal.payload.get_mut(index) {
            Some(slot) => *slot = value,
            None => self.core.fault(format!("payload index {index} out of range")),
        }
    }

    pub fn payload_len(&self) -> usize {
        self.traversal.payload.len()
    }

    pub fn world_ray_origin(&self) -> Vec3 {
        self.traversal.ray.origin
    }

    pub fn world_ray_direction(&self) -> Vec3 {
        self.traversal.ray.direction
    }

    fn object_ray(&self) -> (Vec3, Vec3) {
        match self.role {
            Role::Intersection => (
                self.traversal.object_origin,
                self.traversal.object_direction,
            ),
            _ => match self.hit.and_then(|h| h.instance) {
                Some(instance) => geometry::to_object(
                    &instance.world_to_object,
                    self.traversal.ray.origin,
                    self.traversal.ray.direction,
                ),
                None => (self.traversal.ray.origin, self.traversal.ray.direction),
            },
        }
    }

    /// Ray origin in the space of the current primitive.
    pub fn object_ray_origin(&self) -> Vec3 {
        self.object_ray().0
    }

    /// Ray direction in the space of the current primitive. Not normalized
    /// when the instance transform scales.
    pub fn object_ray_direction(&self) -> Vec3 {
        self.object_ray().1
    }

    pub fn ray_tmin(&self) -> f32 {
        self.traversal.ray.tmin
    }

    /// Far end of the ray: the closest accepted hit so far, or the ray's
    /// `tmax` in a miss program.
    pub fn ray_tmax(&self) -> f32 {
        self.traversal.tmax
    }

    pub fn ray_flags(&self) -> RayFlags {
        self.traversal.ray.flags
    }

    /// Distance of the hit being processed. In intersection programs this is
    /// the current `ray_tmax`.
    pub fn hit_t(&self) -> f32 {
        match (self.role, self.hit) {
            (Role::AnyHit | Role::ClosestHit, Some(hit)) => hit.t,
            _ => self.traversal.tmax,
        }
    }

    pub fn hit_kind(&self) -> u32 {
        self.hit.map_or(0, |h| h.hit_kind)
    }

    pub fn is_front_face_hit(&self) -> bool {
        self.hit_kind() == HIT_KIND_FRONT_FACE
    }

    /// Attribute register `index` of the hit: barycentrics for triangles,
    /// the curve parameter for curves, whatever the intersection program
    /// reported otherwise.
    pub fn attribute(&self, index: usize) -> u32 {
        self.hit
            .and_then(|h| h.attributes.get(index).copied())
            .unwrap_or(0)
    }

    pub fn attribute_f32(&self, index: usize) -> f32 {
        f32::from_bits(self.attribute(index))
    }

    /// Index of the primitive within its build input.
    pub fn primitive_index(&self) -> u32 {
        self.hit.map_or(0, |h| h.primitive_index)
    }

    /// SBT record index of the primitive within its structure.
    pub fn sbt_gas_index(&self) -> u32 {
        self.hit.map_or(0, |h| h.sbt_gas_index)
    }

    /// User id of the instance that was hit; zero without instancing.
    pub fn instance_id(&self) -> u32 {
        self.hit.and_then(|h| h.instance).map_or(0, |i| i.id)
    }

    /// Position of the instance that was hit in its instance structure.
    pub fn instance_index(&self) -> u32 {
        self.hit.and_then(|h| h.instance).map_or(0, |i| i.index)
    }

    pub fn object_to_world(&self) -> Transform {
        self.hit
            .and_then(|h| h.instance)
            .map_or(Transform::IDENTITY, |i| Transform(i.object_to_world))
    }

    pub fn world_to_object(&self) -> Transform {
        self.hit
            .and_then(|h| h.instance)
            .map_or(Transform::IDENTITY, |i| Transform(i.world_to_object))
    }

    /// Report a hit of the current custom primitive at `t`. Returns whether
    /// it was accepted; any-hit runs before this returns.
    ///
    /// `hit_kind` must be below `0x80`.
    pub fn report_intersection(&mut self, t: f32, hit_kind: u32, attributes: &[u32]) -> bool {
        if !self.require(Role::Intersection, "report_intersection") {
            return false;
        }
        if hit_kind >= 0x80 || attributes.len() > MAX_ATTRIBUTES {
            self.core.fault(format!(
                "reported hit kind {hit_kind:#x} with {} attributes",
                attributes.len()
            ));
            return false;
        }
        let Some(mut candidate) = self.hit else {
            return false;
        };
        candidate.t = t;
        candidate.hit_kind = hit_kind;
        candidate.attributes[..attributes.len()].copy_from_slice(attributes);
        self.traversal.consider(candidate)
    }

    /// Reject the hit being processed by this any-hit program.
    pub fn ignore_intersection(&mut self) {
        if self.require(Role::AnyHit, "ignore_intersection") {
            self.traversal.ignored = true;
        }
    }

    /// Accept the hit being processed and stop traversal.
    pub fn terminate_ray(&mut self) {
        if self.require(Role::AnyHit, "terminate_ray") {
            self.traversal.terminate = true;
        }
    }

    /// Trace a ray from a closest-hit or miss program.
    pub fn trace(&mut self, ray: &TraceRay, payload: &mut [u32]) {
        if matches!(self.role, Role::ClosestHit | Role::Miss) {
            self.core.trace(ray, payload);
        } else {
            self.core
                .fault(format!("trace called from a {:?} program", self.role));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use bytemuck::Zeroable;
    use photon_core::Float3A;
    use photon_gpu::{
        Allocator, BufferView, DeviceArray, DeviceBuffer, HostDevice, HostDeviceBuilder, Stream,
    };

    use crate::accel::{AccelStruct, CurveInput, SphereInput, TriangleInput};
    use crate::backend::{
        ModuleCompileOptions, ModuleSource, PipelineCompileOptions, PipelineLinkOptions,
    };
    use crate::context::DeviceContext;
    use crate::host::HostProgramImage;
    use crate::module::{Module, Program};
    use crate::pipeline::Pipeline;
    use crate::sbt::{EmptyRecord, ShaderBindingTableBuilder};

    const MISSED: u32 = u32::MAX;

    /// What the closest-hit or miss program saw.
    #[derive(Clone, Copy, Debug, Pod, Zeroable)]
    #[repr(C)]
    struct Seen {
        t: f32,
        primitive_index: u32,
        instance_id: u32,
        /// Tag of the closest-hit program that ran, or [`MISSED`].
        program: u32,
        attributes: [f32; 2],
        hit_kind: u32,
        _pad: u32,
    }

    #[derive(Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Params {
        handle: TraversableHandle,
        out: DevicePtr,
        origin: [f32; 3],
        visibility_mask: u32,
        direction: [f32; 3],
        _pad: u32,
    }

    fn closest_hit(tag: u32) -> impl Fn(&mut HitContext<'_, '_>) + Send + Sync + 'static {
        move |ctx: &mut HitContext<'_, '_>| {
            let params: Params = ctx.params();
            let seen = Seen {
                t: ctx.hit_t(),
                primitive_index: ctx.primitive_index(),
                instance_id: ctx.instance_id(),
                program: tag,
                attributes: [ctx.attribute_f32(0), ctx.attribute_f32(1)],
                hit_kind: ctx.hit_kind(),
                _pad: 0,
            };
            ctx.store(params.out, seen);
        }
    }

    fn image() -> HostProgramImage {
        HostProgramImage::builder("launch")
            .raygen("__raygen__single", |ctx| {
                let params: Params = ctx.params();
                let ray = TraceRay::new(
                    params.handle,
                    Vec3::from_array(params.origin),
                    Vec3::from_array(params.direction),
                )
                .visibility_mask(params.visibility_mask);
                ctx.trace(&ray, &mut []);
            })
            .miss("__miss__", |ctx| {
                let params: Params = ctx.params();
                let seen = Seen {
                    program: MISSED,
                    ..Seen::zeroed()
                };
                ctx.store(params.out, seen);
            })
            .closest_hit("__closesthit__first", closest_hit(0))
            .closest_hit("__closesthit__second", closest_hit(1))
            .build()
    }

    struct Scene {
        device: Arc<HostDevice>,
        context: DeviceContext,
        allocator: Arc<dyn Allocator>,
        module: Module,
    }

    impl Scene {
        fn new() -> Self {
            let device = HostDeviceBuilder::new().build().unwrap();
            let context = DeviceContext::create(device.as_ref()).unwrap();
            let allocator = photon_gpu::Device::default_allocator(device.as_ref());
            let module = context
                .create_module(
                    ModuleSource::Host(image()),
                    &ModuleCompileOptions::default(),
                    &PipelineCompileOptions::default(),
                )
                .unwrap();
            Self {
                device,
                context,
                allocator,
                module,
            }
        }

        fn stream(&self) -> &dyn Stream {
            self.device.host_stream()
        }

        fn array<T: Pod>(&self, data: &[T]) -> DeviceArray<T> {
            DeviceArray::from_slice(Arc::clone(&self.allocator), self.stream(), data, "launch data")
                .unwrap()
        }

        /// Raygen, miss, then the hit groups of record 0 and 1.
        fn programs(&self) -> Vec<Program> {
            let at = |name: &str| self.module.at(name).unwrap();
            vec![
                at("__raygen__single"),
                at("__miss__"),
                Program::combine(&[at("__closesthit__first")]).unwrap(),
                Program::combine(&[at("__closesthit__second")]).unwrap(),
            ]
        }

        fn binding_table(&self, programs: &[Program]) -> (DeviceBuffer, ShaderBindingTable) {
            ShaderBindingTableBuilder::new()
                .raygen(&EmptyRecord::new(&programs[0]))
                .miss(&EmptyRecord::new(&programs[1]))
                .hitgroup(&EmptyRecord::new(&programs[2]))
                .hitgroup(&EmptyRecord::new(&programs[3]))
                .build(self.stream(), Arc::clone(&self.allocator))
                .unwrap()
        }

        fn pipeline(&self, programs: &[Program]) -> Pipeline {
            self.context
                .create_pipeline(
                    programs,
                    &PipelineCompileOptions::default(),
                    &PipelineLinkOptions::default(),
                )
                .unwrap()
        }

        fn launch(
            &self,
            pipeline: &Pipeline,
            sbt: &ShaderBindingTable,
            handle: TraversableHandle,
            origin: Vec3,
            direction: Vec3,
            visibility_mask: u32,
        ) -> Seen {
            let out = self.array(&[Seen::zeroed()]);
            let params = self.array(&[Params {
                handle,
                out: out.ptr(),
                origin: origin.to_array(),
                visibility_mask,
                direction: direction.to_array(),
                _pad: 0,
            }]);
            pipeline
                .launch(self.stream(), params.view(), sbt, 1, 1, 1)
                .unwrap();
            out.download(self.stream()).unwrap()[0]
        }

        fn trace(
            &self,
            handle: TraversableHandle,
            origin: Vec3,
            direction: Vec3,
            visibility_mask: u32,
        ) -> Seen {
            let programs = self.programs();
            let (_buffer, sbt) = self.binding_table(&programs);
            let pipeline = self.pipeline(&programs);
            self.launch(&pipeline, &sbt, handle, origin, direction, visibility_mask)
        }

        fn build(&self, accel: &mut AccelStruct, inputs: impl Into<crate::accel::BuildInputs>) {
            accel
                .build(self.stream(), &self.allocator, inputs, true, false)
                .unwrap();
        }

        /// Two unit right triangles facing +Z, the second at `x = 2, z = -1`.
        fn triangles(&self) -> (DeviceArray<Float3A>, AccelStruct) {
            let vertices = self.array(&[
                Float3A::new(0.0, 0.0, 0.0),
                Float3A::new(1.0, 0.0, 0.0),
                Float3A::new(0.0, 1.0, 0.0),
                Float3A::new(2.0, 0.0, -1.0),
                Float3A::new(3.0, 0.0, -1.0),
                Float3A::new(2.0, 1.0, -1.0),
            ]);
            let mut gas = self.context.create_accel_struct_triangle();
            self.build(&mut gas, TriangleInput::new(vertices.view(), BufferView::default()));
            (vertices, gas)
        }
    }

    #[test]
    fn triangle_hit_reports_distance_and_primitive() {
        let scene = Scene::new();
        let (_vertices, gas) = scene.triangles();

        let seen = scene.trace(gas.handle(), Vec3::new(2.25, 0.25, 1.0), Vec3::NEG_Z, 0xff);
        assert_eq!(seen.program, 0);
        assert_eq!(seen.primitive_index, 1);
        assert_abs_diff_eq!(seen.t, 2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(seen.attributes[0], 0.25, epsilon = 1e-5);
        assert_abs_diff_eq!(seen.attributes[1], 0.25, epsilon = 1e-5);
        assert_eq!(seen.hit_kind, HIT_KIND_FRONT_FACE);

        let seen = scene.trace(gas.handle(), Vec3::new(5.0, 5.0, 1.0), Vec3::NEG_Z, 0xff);
        assert_eq!(seen.program, MISSED);
    }

    #[test]
    fn instance_applies_transform_id_and_sbt_offset() {
        let scene = Scene::new();
        let (_vertices, gas) = scene.triangles();
        let mut ias = scene.context.create_inst_accel_struct();
        let instance = gas
            .instance()
            .transform(Transform::from_translation(Vec3::new(10.0, 0.0, 0.0)))
            .instance_id(7)
            .sbt_offset(1);
        scene.build(&mut ias, instance);

        let seen = scene.trace(ias.handle(), Vec3::new(10.25, 0.25, 1.0), Vec3::NEG_Z, 0xff);
        assert_eq!(seen.program, 1);
        assert_eq!(seen.instance_id, 7);
        assert_eq!(seen.primitive_index, 0);
        assert_abs_diff_eq!(seen.t, 1.0, epsilon = 1e-5);

        // The untransformed position is empty in world space.
        let seen = scene.trace(ias.handle(), Vec3::new(0.25, 0.25, 1.0), Vec3::NEG_Z, 0xff);
        assert_eq!(seen.program, MISSED);
    }

    #[test]
    fn visibility_mask_culls_instances() {
        let scene = Scene::new();
        let (_vertices, gas) = scene.triangles();
        let mut ias = scene.context.create_inst_accel_struct();
        scene.build(&mut ias, gas.instance().visibility_mask(0b10));

        let origin = Vec3::new(0.25, 0.25, 1.0);
        assert_eq!(scene.trace(ias.handle(), origin, Vec3::NEG_Z, 0b01).program, MISSED);
        assert_eq!(scene.trace(ias.handle(), origin, Vec3::NEG_Z, 0b10).program, 0);
    }

    #[test]
    fn sphere_hit_from_outside_is_front_facing() {
        let scene = Scene::new();
        let centers = scene.array(&[Float3A::new(0.0, 0.0, -3.0)]);
        let radii = scene.array(&[1.0f32]);
        let mut gas = scene.context.create_accel_struct_sphere();
        scene.build(
            &mut gas,
            SphereInput {
                vertex_buffer: centers.view(),
                radius_buffer: radii.view(),
                num_vertices: 1,
                single_radius: true,
                ..SphereInput::default()
            },
        );

        let seen = scene.trace(gas.handle(), Vec3::ZERO, Vec3::NEG_Z, 0xff);
        assert_eq!(seen.program, 0);
        assert_abs_diff_eq!(seen.t, 2.0, epsilon = 1e-4);
        assert_eq!(seen.hit_kind, HIT_KIND_FRONT_FACE);

        let seen = scene.trace(gas.handle(), Vec3::new(0.0, 0.0, -3.0), Vec3::NEG_Z, 0xff);
        assert_abs_diff_eq!(seen.t, 1.0, epsilon = 1e-4);
        assert_eq!(seen.hit_kind, HIT_KIND_BACK_FACE);
    }

    #[test]
    fn curve_hit_reports_segment_parameter() {
        let scene = Scene::new();
        let vertices = scene.array(&[Float3A::new(-1.0, 0.0, 0.0), Float3A::new(1.0, 0.0, 0.0)]);
        let widths = scene.array(&[0.5f32, 0.5]);
        let indices = scene.array(&[0u32]);
        let mut gas = scene.context.create_accel_struct_curve();
        scene.build(
            &mut gas,
            CurveInput {
                vertex_buffer: vertices.view(),
                width_buffer: widths.view(),
                index_buffer: indices.view(),
                num_vertices: 2,
                num_primitives: 1,
                ..CurveInput::default()
            },
        );

        let seen = scene.trace(gas.handle(), Vec3::new(0.1, 0.0, 5.0), Vec3::NEG_Z, 0xff);
        assert_eq!(seen.program, 0);
        assert_abs_diff_eq!(seen.t, 4.5, epsilon = 1e-3);
        assert_abs_diff_eq!(seen.attributes[0], 0.55, epsilon = 1e-3);

        let seen = scene.trace(gas.handle(), Vec3::new(0.0, 2.0, 5.0), Vec3::NEG_Z, 0xff);
        assert_eq!(seen.program, MISSED);
    }

    #[test]
    fn records_outlive_the_programs_they_were_packed_from() {
        let scene = Scene::new();
        let (_vertices, gas) = scene.triangles();
        let (_buffer, sbt) = {
            let programs = scene.programs();
            scene.binding_table(&programs)
        };
        assert_eq!(scene.module.cached_programs(), 0);

        let programs = scene.programs();
        let pipeline = scene.pipeline(&programs);
        let seen = scene.launch(
            &pipeline,
            &sbt,
            gas.handle(),
            Vec3::new(0.25, 0.25, 1.0),
            Vec3::NEG_Z,
            0xff,
        );
        assert_eq!(seen.program, 0);
        assert_eq!(seen.primitive_index, 0);
    }
}

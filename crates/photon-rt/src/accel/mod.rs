//! Acceleration structures.
//!
//! An [`AccelStruct`] is created empty by a [`DeviceContext`] factory and
//! populated by [`AccelStruct::build`]. The build protocol is:
//!
//! 1. Translate the typed inputs into native descriptors.
//! 2. Query the backend for output and scratch sizes.
//! 3. Allocate fresh output memory, enqueue the build.
//! 4. Without `prefer_fast_trace`, read back the compacted size and copy the
//!    structure into an exactly sized buffer.
//! 5. Retire the previous structure through the stream and publish the new
//!    handle.
//!
//! Nothing is published until every step has been enqueued, so a failed
//! build leaves the structure as it was.

mod input;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use photon_core::align_up;
use photon_gpu::{Allocator, BufferView, DeviceBuffer, ReleaseQueue, Stream, StreamExt};

pub use input::{AabbInput, BuildInputs, CurveInput, InstanceInput, SphereInput, TriangleInput};

use crate::backend::{
    AccelBufferSizes, AccelBuildOptions, BuildFlags, BuildOperation, OwnedAccel, RtBackend,
    TraversableHandle,
};
use crate::context::{DeviceContext, LogLevel};
use crate::error::{Result, RtError};

/// Primitive type of a structure, fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccelKind {
    Triangle,
    Aabb,
    Curve,
    Sphere,
    /// Instances of other structures.
    Instance,
}

impl AccelKind {
    /// Whether the structure holds geometry rather than instances.
    pub const fn is_geometry(self) -> bool {
        !matches!(self, Self::Instance)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Triangle => "triangle",
            Self::Aabb => "aabb",
            Self::Curve => "curve",
            Self::Sphere => "sphere",
            Self::Instance => "instance",
        }
    }
}

impl fmt::Display for AccelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct TraversableCell {
    device_id: u32,
    kind: AccelKind,
    handle: AtomicU64,
    generation: AtomicU64,
}

/// Shared view of a structure's current handle.
///
/// Instance inputs hold one of these per child. The generation increases on
/// every successful build or refit, which is how an instance structure
/// notices that a child changed underneath it.
#[derive(Clone)]
pub struct TraversableRef(Arc<TraversableCell>);

impl TraversableRef {
    fn new(device_id: u32, kind: AccelKind) -> Self {
        Self(Arc::new(TraversableCell {
            device_id,
            kind,
            handle: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }))
    }

    /// Current handle; null while the structure is empty or dropped.
    pub fn handle(&self) -> TraversableHandle {
        TraversableHandle(self.0.handle.load(Ordering::Acquire))
    }

    /// Number of builds and refits so far.
    pub fn generation(&self) -> u64 {
        self.0.generation.load(Ordering::Acquire)
    }

    pub fn device_id(&self) -> u32 {
        self.0.device_id
    }

    pub fn kind(&self) -> AccelKind {
        self.0.kind
    }

    /// Whether both refer to the same structure.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn publish(&self, handle: TraversableHandle) {
        self.0.handle.store(handle.0, Ordering::Release);
        self.0.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn clear(&self) {
        self.0.handle.store(0, Ordering::Release);
    }
}

impl fmt::Debug for TraversableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraversableRef")
            .field("kind", &self.kind())
            .field("handle", &self.handle())
            .field("generation", &self.generation())
            .finish()
    }
}

impl From<&AccelStruct> for TraversableRef {
    fn from(accel: &AccelStruct) -> Self {
        accel.traversable_ref()
    }
}

/// A bounding volume hierarchy over one primitive type.
pub struct AccelStruct {
    context: DeviceContext,
    kind: AccelKind,
    header_size: u64,
    /// Inputs and flags of the last successful build.
    inputs: Option<BuildInputs>,
    options: AccelBuildOptions,
    allocator: Option<Arc<dyn Allocator>>,
    sizes: AccelBufferSizes,
    /// Offset of the structure within its backing buffer.
    struct_offset: u64,
    temp: Option<DeviceBuffer>,
    current: Option<OwnedAccel>,
    /// Encoded instance array of an instance structure.
    instances: Option<DeviceBuffer>,
    traversable: TraversableRef,
    children: Vec<(TraversableRef, u64)>,
    /// Stream of the last build or refit; retires the buffers on drop.
    release: Option<ReleaseQueue>,
}

impl AccelStruct {
    pub(crate) fn new(context: &DeviceContext, kind: AccelKind) -> Self {
        Self {
            traversable: TraversableRef::new(context.device_id(), kind),
            context: context.clone(),
            kind,
            header_size: 0,
            inputs: None,
            options: AccelBuildOptions::default(),
            allocator: None,
            sizes: AccelBufferSizes::default(),
            struct_offset: 0,
            temp: None,
            current: None,
            instances: None,
            children: Vec::new(),
            release: None,
        }
    }

    /// Reserve `bytes` of user data in front of the structure, reachable
    /// through [`AccelStruct::gas_header_buffer`]. Takes effect at the next
    /// build.
    #[must_use]
    pub fn with_header_size(mut self, bytes: u64) -> Self {
        self.header_size = bytes;
        self
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    pub fn kind(&self) -> AccelKind {
        self.kind
    }

    /// Handle to embed in launch parameters; null until built.
    pub fn handle(&self) -> TraversableHandle {
        self.current
            .as_ref()
            .map_or(TraversableHandle::NULL, |c| c.handle)
    }

    /// Whether the structure has no valid handle.
    pub fn is_empty(&self) -> bool {
        self.handle().is_null()
    }

    /// Whether the last build allowed in-place refits.
    pub fn allow_update(&self) -> bool {
        self.options.flags.contains(BuildFlags::ALLOW_UPDATE)
    }

    /// Whether the last build was compacted.
    pub fn allow_compaction(&self) -> bool {
        self.options.flags.contains(BuildFlags::ALLOW_COMPACTION)
    }

    /// Flags of the last successful build.
    pub fn build_flags(&self) -> BuildFlags {
        self.options.flags
    }

    /// Shared handle cell for instance inputs.
    pub fn traversable_ref(&self) -> TraversableRef {
        self.traversable.clone()
    }

    /// Instance of this structure at the identity transform.
    pub fn instance(&self) -> InstanceInput {
        InstanceInput::new(self.traversable_ref())
    }

    /// Number of builds and refits so far.
    pub fn generation(&self) -> u64 {
        self.traversable.generation()
    }

    /// SBT records the structure's geometry occupies.
    pub fn num_sbt_records(&self) -> u32 {
        self.inputs.as_ref().map_or(0, BuildInputs::num_sbt_records)
    }

    /// Inputs of the last successful build.
    pub fn build_inputs(&self) -> Option<&BuildInputs> {
        self.inputs.as_ref()
    }

    /// Sizes reported by the backend for the last build.
    pub fn sizes(&self) -> AccelBufferSizes {
        self.sizes
    }

    /// Bytes of the buffer currently backing the structure, header included.
    pub fn memory_size(&self) -> u64 {
        self.current.as_ref().map_or(0, |c| c.buffer.size())
    }

    /// Whether a referenced child has been rebuilt or refit since this
    /// instance structure was built. Always false for geometry.
    pub fn needs_rebuild(&self) -> bool {
        self.children
            .iter()
            .any(|(child, generation)| child.generation() != *generation)
    }

    /// Header region at the start of the backing buffer.
    ///
    /// `None` when no header was reserved or nothing is built. The region
    /// moves whenever the structure is rebuilt or compacted.
    pub fn gas_header_buffer(&self) -> Option<BufferView<u8>> {
        if self.header_size == 0 {
            return None;
        }
        self.current
            .as_ref()
            .map(|c| BufferView::from_raw_parts(c.buffer.ptr(), self.header_size as usize))
    }

    /// Build the structure from `inputs`, replacing any previous build.
    ///
    /// With `prefer_fast_trace` the structure is built for trace speed and
    /// left uncompacted. Otherwise it is compacted, which waits for the
    /// build to finish. With `allow_update` the structure can later be
    /// refit in place.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn build(
        &mut self,
        stream: &dyn Stream,
        allocator: &Arc<dyn Allocator>,
        inputs: impl Into<BuildInputs>,
        prefer_fast_trace: bool,
        allow_update: bool,
    ) -> Result<()> {
        let mut flags = if prefer_fast_trace {
            BuildFlags::PREFER_FAST_TRACE
        } else {
            BuildFlags::ALLOW_COMPACTION
        };
        if allow_update {
            flags |= BuildFlags::ALLOW_UPDATE;
        }
        self.build_with(stream, allocator, inputs.into(), flags)
            .map_err(|e| self.fail(e, "build"))
    }

    /// Build again from the stored inputs and flags.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn rebuild(&mut self, stream: &dyn Stream) -> Result<()> {
        self.rebuild_inner(stream)
            .map_err(|e| self.fail(e, "rebuild"))
    }

    /// Update the structure in place from its (possibly modified) source
    /// buffers. The handle is preserved.
    ///
    /// Primitive counts and source buffer addresses must be those of the
    /// last build; only the contents may change.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn refit(&mut self, stream: &dyn Stream) -> Result<()> {
        self.refit_inner(stream).map_err(|e| self.fail(e, "refit"))
    }

    fn fail(&self, error: RtError, operation: &'static str) -> RtError {
        self.context.log(
            LogLevel::Error,
            &format!("{operation} of {} structure failed: {error}", self.kind),
        );
        error.context(self.context.device_id(), operation)
    }

    fn check_device(&self, stream: &dyn Stream, allocator: &dyn Allocator) -> Result<()> {
        let device = self.context.device_id();
        if stream.device_id() != device || allocator.device_id() != device {
            return Err(RtError::invalid_value(format!(
                "stream of device {} and allocator of device {} used with a structure of device {device}",
                stream.device_id(),
                allocator.device_id()
            )));
        }
        Ok(())
    }

    fn rebuild_inner(&mut self, stream: &dyn Stream) -> Result<()> {
        let (Some(inputs), Some(allocator)) = (self.inputs.clone(), self.allocator.clone()) else {
            return Err(RtError::invalid_state("no build inputs"));
        };
        self.build_with(stream, &allocator, inputs, self.options.flags)
    }

    fn build_with(
        &mut self,
        stream: &dyn Stream,
        allocator: &Arc<dyn Allocator>,
        inputs: BuildInputs,
        flags: BuildFlags,
    ) -> Result<()> {
        if inputs.kind() != self.kind {
            return Err(RtError::invalid_value(format!(
                "{} inputs given to a {} structure",
                inputs.kind(),
                self.kind
            )));
        }
        if inputs.is_empty() {
            return Err(RtError::invalid_value("no build inputs"));
        }
        self.check_device(stream, allocator.as_ref())?;
        self.release = Some(stream.release_queue());

        let backend = Arc::clone(self.context.backend());
        let max_records = self.context.properties().max_sbt_records_per_gas;
        let mut translated = input::translate(&inputs, backend.as_ref(), max_records)?;

        let instances = match translated.instance_bytes.take() {
            Some(bytes) => {
                let buffer = DeviceBuffer::with_size(
                    Arc::clone(allocator),
                    bytes.len() as u64,
                    "accel instances",
                )?;
                if !bytes.is_empty() {
                    stream.upload(buffer.ptr(), &bytes)?;
                }
                translated.set_instance_buffer(buffer.ptr());
                Some(buffer)
            }
            None => None,
        };

        let options = AccelBuildOptions {
            flags,
            operation: BuildOperation::Build,
        };
        let sizes = backend.accel_compute_memory_usage(&options, &translated.native)?;
        let struct_offset = align_up(self.header_size, backend.structure_alignment());
        let temp_size = if flags.contains(BuildFlags::ALLOW_UPDATE) {
            sizes.temp_size.max(sizes.temp_update_size)
        } else {
            sizes.temp_size
        };

        let temp = match self.temp.take() {
            Some(temp) if temp.size() >= temp_size && Arc::ptr_eq(temp.allocator(), allocator) => {
                temp
            }
            previous => {
                if let Some(previous) = previous {
                    stream.defer_release(Box::new(previous));
                }
                DeviceBuffer::with_size(Arc::clone(allocator), temp_size, "accel temp")?
            }
        };
        let output = DeviceBuffer::with_size(
            Arc::clone(allocator),
            struct_offset + sizes.output_size,
            "accel output",
        )?;
        if self.header_size > 0 {
            stream.memset(output.ptr(), 0, self.header_size)?;
        }
        let compacted_size = if flags.contains(BuildFlags::ALLOW_COMPACTION) {
            Some(DeviceBuffer::with_size(
                Arc::clone(allocator),
                8,
                "accel compacted size",
            )?)
        } else {
            None
        };

        let built = backend.accel_build(
            stream,
            &options,
            &translated.native,
            temp.block(),
            output.block().slice_from(struct_offset),
            compacted_size.as_ref().map(DeviceBuffer::ptr),
        );
        let handle = match built {
            Ok(handle) => handle,
            Err(e) => {
                stream.defer_release(Box::new((output, instances, compacted_size)));
                self.temp = Some(temp);
                return Err(e);
            }
        };
        let mut built = OwnedAccel {
            backend: Arc::clone(&backend),
            handle,
            buffer: output,
        };

        if let Some(size_buffer) = compacted_size {
            match self.compact(stream, allocator, &built, &size_buffer, struct_offset) {
                Ok(Some(compacted)) => {
                    stream.defer_release(Box::new(std::mem::replace(&mut built, compacted)));
                }
                Ok(None) => {}
                Err(e) => {
                    stream.defer_release(Box::new((built, instances, size_buffer)));
                    self.temp = Some(temp);
                    return Err(e);
                }
            }
        }

        tracing::debug!(
            "Built {} structure on device {}: {} bytes (uncompacted {}), temp {} bytes",
            self.kind,
            self.context.device_id(),
            built.buffer.size(),
            struct_offset + sizes.output_size,
            temp.size()
        );

        let handle = built.handle;
        if let Some(previous) = self.current.replace(built) {
            stream.defer_release(Box::new(previous));
        }
        if let Some(previous) = std::mem::replace(&mut self.instances, instances) {
            stream.defer_release(Box::new(previous));
        }
        self.temp = Some(temp);
        self.inputs = Some(inputs);
        self.options = AccelBuildOptions {
            flags,
            operation: BuildOperation::Build,
        };
        self.allocator = Some(Arc::clone(allocator));
        self.sizes = sizes;
        self.struct_offset = struct_offset;
        self.children = translated.children;
        self.traversable.publish(handle);
        Ok(())
    }

    /// Copy `built` into an exactly sized buffer. `None` when compaction
    /// would not save memory.
    fn compact(
        &self,
        stream: &dyn Stream,
        allocator: &Arc<dyn Allocator>,
        built: &OwnedAccel,
        size_buffer: &DeviceBuffer,
        struct_offset: u64,
    ) -> Result<Option<OwnedAccel>> {
        let compacted_size: u64 = stream.read_value(size_buffer.ptr())?;
        let total = struct_offset + compacted_size;
        if compacted_size == 0 || total >= built.buffer.size() {
            tracing::debug!(
                "Skipping compaction of {} structure: {compacted_size} of {} bytes used",
                self.kind,
                built.buffer.size() - struct_offset
            );
            return Ok(None);
        }
        let buffer = DeviceBuffer::with_size(Arc::clone(allocator), total, "accel compacted")?;
        if self.header_size > 0 {
            stream.copy(buffer.ptr(), built.buffer.ptr(), self.header_size)?;
        }
        let handle = built.backend.accel_compact(
            stream,
            built.handle,
            buffer.block().slice_from(struct_offset),
        )?;
        Ok(Some(OwnedAccel {
            backend: Arc::clone(&built.backend),
            handle,
            buffer,
        }))
    }

    fn refit_inner(&mut self, stream: &dyn Stream) -> Result<()> {
        let Some(current) = &self.current else {
            return Err(RtError::invalid_state("structure has not been built"));
        };
        if !self.allow_update() {
            return Err(RtError::invalid_operation(
                "structure was built without allow_update",
            ));
        }
        let (Some(inputs), Some(allocator)) = (&self.inputs, &self.allocator) else {
            return Err(RtError::invalid_state("no build inputs"));
        };
        self.check_device(stream, allocator.as_ref())?;
        self.release = Some(stream.release_queue());

        let backend = self.context.backend();
        let max_records = self.context.properties().max_sbt_records_per_gas;
        let mut translated = input::translate(inputs, backend.as_ref(), max_records)?;
        if let Some(bytes) = translated.instance_bytes.take() {
            let buffer = self
                .instances
                .as_ref()
                .filter(|b| b.size() == bytes.len() as u64)
                .ok_or_else(|| {
                    RtError::invalid_operation("instance count changed since the last build")
                })?;
            if !bytes.is_empty() {
                stream.upload(buffer.ptr(), &bytes)?;
            }
            translated.set_instance_buffer(buffer.ptr());
        }

        let options = AccelBuildOptions {
            flags: self.options.flags,
            operation: BuildOperation::Update(current.handle),
        };
        let temp = self
            .temp
            .as_ref()
            .filter(|t| t.size() >= self.sizes.temp_update_size)
            .ok_or_else(|| RtError::invalid_state("scratch memory of the last build is missing"))?;
        let handle = backend.accel_build(
            stream,
            &options,
            &translated.native,
            temp.block(),
            current.buffer.block().slice_from(self.struct_offset),
            None,
        )?;
        if handle != current.handle {
            return Err(RtError::new(
                crate::error::Status::Internal,
                format!("update moved the structure from {:?} to {handle:?}", current.handle),
            ));
        }
        self.children = translated.children;
        self.traversable.publish(handle);
        Ok(())
    }
}

impl fmt::Debug for AccelStruct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccelStruct")
            .field("kind", &self.kind)
            .field("handle", &self.handle())
            .field("flags", &self.options.flags)
            .field("memory_size", &self.memory_size())
            .finish_non_exhaustive()
    }
}

impl Drop for AccelStruct {
    fn drop(&mut self) {
        self.traversable.clear();
        let retired = (self.current.take(), self.temp.take(), self.instances.take());
        match &self.release {
            Some(queue) => queue.release(Box::new(retired)),
            None => drop(retired),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use glam::Vec3;
    use photon_core::{Aabb, Float3A, Transform};
    use photon_gpu::{DeviceArray, HostDevice, HostDeviceBuilder};

    struct Fixture {
        device: Arc<HostDevice>,
        context: DeviceContext,
        allocator: Arc<dyn Allocator>,
    }

    impl Fixture {
        fn new() -> Self {
            let device = HostDeviceBuilder::new().build().unwrap();
            let context = DeviceContext::create(device.as_ref()).unwrap();
            let allocator = photon_gpu::Device::default_allocator(device.as_ref());
            Self {
                device,
                context,
                allocator,
            }
        }

        fn stream(&self) -> &dyn Stream {
            self.device.host_stream()
        }

        fn boxes(&self, count: usize) -> DeviceArray<Aabb> {
            let boxes: Vec<Aabb> = (0..count)
                .map(|i| Aabb::from_center(Vec3::new(i as f32 * 3.0, 0.0, 0.0), Vec3::splat(0.5)))
                .collect();
            DeviceArray::from_slice(Arc::clone(&self.allocator), self.stream(), &boxes, "boxes")
                .unwrap()
        }
    }

    #[test]
    fn new_structure_is_empty() {
        let fixture = Fixture::new();
        let accel = fixture.context.create_accel_struct_aabb();
        assert!(accel.is_empty());
        assert_eq!(accel.handle(), TraversableHandle::NULL);
        assert_eq!(accel.num_sbt_records(), 0);
        assert!(accel.gas_header_buffer().is_none());
    }

    #[test]
    fn build_publishes_handle() {
        let fixture = Fixture::new();
        let boxes = fixture.boxes(16);
        let mut accel = fixture.context.create_accel_struct_aabb();
        accel
            .build(fixture.stream(), &fixture.allocator, AabbInput::new(boxes.view()), true, false)
            .unwrap();
        assert!(!accel.is_empty());
        assert_eq!(accel.traversable_ref().handle(), accel.handle());
        assert_eq!(accel.generation(), 1);
        assert_eq!(accel.num_sbt_records(), 1);
        assert!(!accel.allow_update());
    }

    #[test]
    fn refit_requires_allow_update() {
        let fixture = Fixture::new();
        let boxes = fixture.boxes(4);
        let mut accel = fixture.context.create_accel_struct_aabb();
        accel
            .build(fixture.stream(), &fixture.allocator, AabbInput::new(boxes.view()), true, false)
            .unwrap();
        let handle = accel.handle();
        let error = accel.refit(fixture.stream()).unwrap_err();
        assert_eq!(error.status(), Status::InvalidOperation);
        assert_eq!(error.error_context().map(|c| c.operation), Some("refit"));
        assert_eq!(accel.handle(), handle);
    }

    #[test]
    fn refit_preserves_handle() {
        let fixture = Fixture::new();
        let boxes = fixture.boxes(8);
        let mut accel = fixture.context.create_accel_struct_aabb();
        accel
            .build(fixture.stream(), &fixture.allocator, AabbInput::new(boxes.view()), true, true)
            .unwrap();
        let handle = accel.handle();
        boxes
            .upload(fixture.stream(), &[Aabb::from_center(Vec3::splat(10.0), Vec3::ONE)])
            .unwrap();
        accel.refit(fixture.stream()).unwrap();
        fixture.stream().sync().unwrap();
        assert_eq!(accel.handle(), handle);
        assert_eq!(accel.generation(), 2);
    }

    #[test]
    fn rebuild_needs_inputs() {
        let fixture = Fixture::new();
        let mut accel = fixture.context.create_accel_struct_triangle();
        let error = accel.rebuild(fixture.stream()).unwrap_err();
        assert_eq!(error.status(), Status::InvalidState);
        assert!(accel.is_empty());
    }

    #[test]
    fn rebuild_uses_stored_inputs() {
        let fixture = Fixture::new();
        let boxes = fixture.boxes(8);
        let mut accel = fixture.context.create_accel_struct_aabb();
        accel
            .build(fixture.stream(), &fixture.allocator, AabbInput::new(boxes.view()), false, false)
            .unwrap();
        accel.rebuild(fixture.stream()).unwrap();
        assert!(!accel.is_empty());
        assert!(accel.allow_compaction());
        assert_eq!(accel.generation(), 2);
    }

    #[test]
    fn compaction_shrinks_memory() {
        let fixture = Fixture::new();
        let boxes = fixture.boxes(64);
        let mut fast = fixture.context.create_accel_struct_aabb();
        fast.build(fixture.stream(), &fixture.allocator, AabbInput::new(boxes.view()), true, false)
            .unwrap();
        let mut compact = fixture.context.create_accel_struct_aabb();
        compact
            .build(fixture.stream(), &fixture.allocator, AabbInput::new(boxes.view()), false, false)
            .unwrap();
        assert!(compact.memory_size() <= fast.memory_size());
        assert!(compact.memory_size() <= compact.sizes().output_size);
    }

    #[test]
    fn failed_build_keeps_previous_state() {
        let fixture = Fixture::new();
        let boxes = fixture.boxes(4);
        let mut accel = fixture.context.create_accel_struct_aabb();
        let bad = AabbInput {
            num_primitives: 5,
            ..AabbInput::new(boxes.view())
        };
        assert!(accel
            .build(fixture.stream(), &fixture.allocator, bad.clone(), true, false)
            .is_err());
        assert!(accel.is_empty());

        accel
            .build(fixture.stream(), &fixture.allocator, AabbInput::new(boxes.view()), true, false)
            .unwrap();
        let handle = accel.handle();
        let error = accel
            .build(fixture.stream(), &fixture.allocator, bad, true, true)
            .unwrap_err();
        assert_eq!(error.status(), Status::InvalidValue);
        assert_eq!(accel.handle(), handle);
        assert!(!accel.allow_update());
    }

    #[test]
    fn wrong_input_kind_is_rejected() {
        let fixture = Fixture::new();
        let boxes = fixture.boxes(4);
        let mut accel = fixture.context.create_accel_struct_sphere();
        let error = accel
            .build(fixture.stream(), &fixture.allocator, AabbInput::new(boxes.view()), true, false)
            .unwrap_err();
        assert_eq!(error.status(), Status::InvalidValue);
    }

    #[test]
    fn header_region_precedes_structure() {
        let fixture = Fixture::new();
        let boxes = fixture.boxes(4);
        let mut accel = fixture.context.create_accel_struct_aabb().with_header_size(24);
        accel
            .build(fixture.stream(), &fixture.allocator, AabbInput::new(boxes.view()), false, false)
            .unwrap();
        let header = accel.gas_header_buffer().unwrap();
        assert_eq!(header.len(), 24);
        assert!(header.ptr().addr() < accel.handle().0);
    }

    #[test]
    fn instance_tracks_child_generation() {
        let fixture = Fixture::new();
        let vertices = [
            Float3A::new(0.0, 0.0, 0.0),
            Float3A::new(1.0, 0.0, 0.0),
            Float3A::new(0.0, 1.0, 0.0),
        ];
        let vertices =
            DeviceArray::from_slice(Arc::clone(&fixture.allocator), fixture.stream(), &vertices, "v")
                .unwrap();
        let mut child = fixture.context.create_accel_struct_triangle();
        child
            .build(
                fixture.stream(),
                &fixture.allocator,
                TriangleInput::new(vertices.view(), BufferView::default()),
                true,
                false,
            )
            .unwrap();

        let mut scene = fixture.context.create_inst_accel_struct();
        let inputs = vec![
            child.instance(),
            child
                .instance()
                .transform(Transform::from_translation(Vec3::X * 4.0))
                .instance_id(1),
        ];
        scene
            .build(fixture.stream(), &fixture.allocator, inputs, true, false)
            .unwrap();
        assert!(!scene.needs_rebuild());

        child.rebuild(fixture.stream()).unwrap();
        assert!(scene.needs_rebuild());
        scene.rebuild(fixture.stream()).unwrap();
        assert!(!scene.needs_rebuild());
    }

    #[test]
    fn instance_of_empty_structure_is_rejected() {
        let fixture = Fixture::new();
        let child = fixture.context.create_accel_struct_aabb();
        let mut scene = fixture.context.create_inst_accel_struct();
        let error = scene
            .build(fixture.stream(), &fixture.allocator, child.instance(), true, false)
            .unwrap_err();
        assert_eq!(error.status(), Status::InvalidValue);
    }

    #[test]
    fn drop_frees_memory() {
        let fixture = Fixture::new();
        let boxes = fixture.boxes(32);
        fixture.stream().sync().unwrap();
        let baseline = fixture.device.memory().allocation_count();
        let mut accel = fixture.context.create_accel_struct_aabb();
        accel
            .build(fixture.stream(), &fixture.allocator, AabbInput::new(boxes.view()), false, true)
            .unwrap();
        let cell = accel.traversable_ref();
        // The compacting copy is still queued when the structure goes away.
        drop(accel);
        assert!(fixture.stream().sync().is_ok());
        assert!(cell.handle().is_null());
        assert_eq!(fixture.device.memory().allocation_count(), baseline);
    }

    #[test]
    fn drop_keeps_memory_until_queued_build_runs() {
        let fixture = Fixture::new();
        let boxes = fixture.boxes(8);
        fixture.stream().sync().unwrap();
        let baseline = fixture.device.memory().allocation_count();

        let (gate_tx, gate_rx) = crossbeam::channel::bounded::<()>(0);
        fixture
            .device
            .host_stream()
            .enqueue(move |_| {
                let _ = gate_rx.recv();
                Ok(())
            })
            .unwrap();
        let mut accel = fixture.context.create_accel_struct_aabb();
        accel
            .build(fixture.stream(), &fixture.allocator, AabbInput::new(boxes.view()), true, false)
            .unwrap();
        drop(accel);
        assert!(fixture.device.memory().allocation_count() > baseline);

        gate_tx.send(()).unwrap();
        fixture.stream().sync().unwrap();
        assert_eq!(fixture.device.memory().allocation_count(), baseline);
    }
}

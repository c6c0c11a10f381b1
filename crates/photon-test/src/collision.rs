//! The collision-counting query.
//!
//! Every point casts a zero-length ray from its own position into an AABB
//! structure holding one box per point. The intersection program runs for
//! each box containing the origin and counts the pairs `i < j` closer than
//! the radius. It never reports a hit, so traversal visits every candidate.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use photon_core::{Aabb, DevicePtr, Float3A};
use photon_gpu::{Allocator, DeviceArray, DeviceBuffer, Stream};
use photon_rt::{
    AabbInput, AccelStruct, DeviceContext, EmptyRecord, HostProgramImage, ModuleCompileOptions,
    ModuleSource, Pipeline, PipelineCompileOptions, PipelineLinkOptions, Program,
    ShaderBindingTable, ShaderBindingTableBuilder, TraceRay, TraversableHandle,
};

use crate::scene::PointCloud;
use crate::{Result, TestError};

pub const RAYGEN: &str = "__raygen__collide";
pub const INTERSECTION: &str = "__intersection__collide";
pub const MISS: &str = "__miss__none";

const POINT_STRIDE: u64 = std::mem::size_of::<Float3A>() as u64;

/// Launch parameters shared by every collision program.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct CollisionParams {
    pub handle: TraversableHandle,
    pub points: DevicePtr,
    pub count: DevicePtr,
    pub radius: f32,
    pub num_points: u32,
}

/// Host programs of the collision query.
pub fn host_image() -> HostProgramImage {
    HostProgramImage::builder("collision")
        .raygen(RAYGEN, |ctx| {
            let params: CollisionParams = ctx.params();
            let i = ctx.launch_index().x;
            if i >= params.num_points {
                return;
            }
            let origin: Float3A = ctx.load(params.points.offset(u64::from(i) * POINT_STRIDE));
            let ray = TraceRay::new(params.handle, origin.into(), Vec3::X).interval(0.0, 0.0);
            ctx.trace(&ray, &mut []);
        })
        .intersection(INTERSECTION, |ctx| {
            let params: CollisionParams = ctx.params();
            let i = ctx.launch_index().x;
            let j = ctx.primitive_index();
            if i >= j {
                return;
            }
            let other: Float3A = ctx.load(params.points.offset(u64::from(j) * POINT_STRIDE));
            let distance_squared = ctx.world_ray_origin().distance_squared(other.into());
            if distance_squared < params.radius * params.radius {
                ctx.atomic_add_u64(params.count, 1);
            }
        })
        .miss(MISS, |_| {})
        .build()
}

/// A point cloud in device memory: the points the programs read and the
/// boxes the structure is built over.
pub struct DeviceCloud {
    pub points: DeviceArray<Float3A>,
    pub aabbs: DeviceArray<Aabb>,
    pub radius: f32,
}

impl DeviceCloud {
    pub fn upload(
        cloud: &PointCloud,
        stream: &dyn Stream,
        allocator: &Arc<dyn Allocator>,
    ) -> Result<Self> {
        Ok(Self {
            points: DeviceArray::from_slice(
                Arc::clone(allocator),
                stream,
                &cloud.device_points(),
                "cloud points",
            )?,
            aabbs: DeviceArray::from_slice(
                Arc::clone(allocator),
                stream,
                &cloud.aabbs(),
                "cloud boxes",
            )?,
            radius: cloud.radius(),
        })
    }

    /// Overwrite the device copy with `cloud`, which must have the same
    /// number of points.
    pub fn update(&mut self, cloud: &PointCloud, stream: &dyn Stream) -> Result<()> {
        if cloud.len() != self.points.len() {
            return Err(TestError::Mismatch(format!(
                "cloud of {} points updated with {}",
                self.points.len(),
                cloud.len()
            )));
        }
        self.points.upload(stream, &cloud.device_points())?;
        self.aabbs.upload(stream, &cloud.aabbs())?;
        self.radius = cloud.radius();
        Ok(())
    }

    pub fn input(&self) -> AabbInput {
        AabbInput::new(self.aabbs.view())
    }
}

/// Pipeline, binding table and result buffers of the collision query.
pub struct CollisionQuery {
    pipeline: Pipeline,
    sbt: ShaderBindingTable,
    _sbt_buffer: DeviceBuffer,
    params: DeviceArray<CollisionParams>,
    count: DeviceArray<u64>,
}

impl CollisionQuery {
    /// Create the query from a module exposing [`RAYGEN`], [`INTERSECTION`]
    /// and [`MISS`].
    pub fn new(
        context: &DeviceContext,
        source: ModuleSource,
        stream: &dyn Stream,
        allocator: &Arc<dyn Allocator>,
    ) -> Result<Self> {
        let compile = PipelineCompileOptions {
            num_payload_values: 0,
            num_attribute_values: 0,
            ..PipelineCompileOptions::default()
        };
        let module = context.create_module(source, &ModuleCompileOptions::default(), &compile)?;
        let program = |name: &str| {
            module
                .at(name)
                .ok_or_else(|| TestError::MissingProgram(name.to_string()))
        };
        let raygen = program(RAYGEN)?;
        let miss = program(MISS)?;
        let hit = Program::combine(&[program(INTERSECTION)?])?;

        let pipeline = context.create_pipeline(
            &[raygen.clone(), miss.clone(), hit.clone()],
            &compile,
            &PipelineLinkOptions::default(),
        )?;
        let (sbt_buffer, sbt) = ShaderBindingTableBuilder::new()
            .raygen(&EmptyRecord::new(&raygen))
            .miss(&EmptyRecord::new(&miss))
            .hitgroup(&EmptyRecord::new(&hit))
            .build(stream, Arc::clone(allocator))?;

        Ok(Self {
            pipeline,
            sbt,
            _sbt_buffer: sbt_buffer,
            params: DeviceArray::new(Arc::clone(allocator), 1, "collision params")?,
            count: DeviceArray::new(Arc::clone(allocator), 1, "collision count")?,
        })
    }

    /// Count colliding pairs of `cloud` using `accel`, a structure built
    /// over its boxes. Waits for the launch.
    pub fn run(&self, stream: &dyn Stream, accel: &AccelStruct, cloud: &DeviceCloud) -> Result<u64> {
        let num_points = u32::try_from(cloud.points.len())
            .map_err(|_| TestError::Mismatch("more points than a launch can cover".into()))?;
        let params = CollisionParams {
            handle: accel.handle(),
            points: cloud.points.ptr(),
            count: self.count.ptr(),
            radius: cloud.radius,
            num_points,
        };
        self.count.upload(stream, &[0])?;
        self.params.upload(stream, &[params])?;
        self.pipeline
            .launch(stream, self.params.view(), &self.sbt, cloud.points.len(), 1, 1)?;
        let count = self.count.download(stream)?;
        tracing::debug!("Collision launch over {num_points} points found {count:?}");
        Ok(count.first().copied().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::HostFixture;
    use photon_gpu::GpuError;
    use photon_rt::{AccelKind, ProgramKind};

    fn setup(count: usize, radius: f32, seed: u64) -> (HostFixture, PointCloud, DeviceCloud) {
        let fixture = HostFixture::new().unwrap();
        let cloud = PointCloud::random(count, radius, seed);
        let device = fixture.upload_cloud(&cloud).unwrap();
        (fixture, cloud, device)
    }

    #[test]
    fn entry_table() {
        let image = host_image();
        let table: String = image
            .entry_names()
            .into_iter()
            .map(|name| format!("{name} {:?}\n", ProgramKind::from_entry_name(name)))
            .collect();
        insta::assert_snapshot!(table, @r"
        __intersection__collide Some(Intersection)
        __miss__none Some(Miss)
        __raygen__collide Some(Raygen)
        ");
    }

    #[test]
    fn params_layout() {
        assert_eq!(std::mem::size_of::<CollisionParams>(), 32);
        assert_eq!(std::mem::offset_of!(CollisionParams, radius), 24);
    }

    #[test]
    fn launch_count_matches_cpu_count() {
        let (fixture, cloud, device) = setup(2000, 0.03, 1);
        let query = fixture.collision_query().unwrap();
        let mut accel = fixture.context.create_accel_struct_aabb();
        accel
            .build(fixture.stream(), &fixture.allocator(), device.input(), true, false)
            .unwrap();

        let expected = cloud.count_pairs();
        assert!(expected > 0);
        assert_eq!(query.run(fixture.stream(), &accel, &device).unwrap(), expected);
    }

    #[test]
    fn compaction_does_not_change_results() {
        let (fixture, cloud, device) = setup(1500, 0.04, 2);
        let query = fixture.collision_query().unwrap();
        let allocator = fixture.allocator();

        let mut fast = fixture.context.create_accel_struct_aabb();
        fast.build(fixture.stream(), &allocator, device.input(), true, false)
            .unwrap();
        let mut compact = fixture.context.create_accel_struct_aabb();
        compact
            .build(fixture.stream(), &allocator, device.input(), false, false)
            .unwrap();

        assert!(compact.memory_size() <= fast.memory_size());
        let expected = cloud.count_pairs();
        assert_eq!(query.run(fixture.stream(), &fast, &device).unwrap(), expected);
        assert_eq!(query.run(fixture.stream(), &compact, &device).unwrap(), expected);
    }

    #[test]
    fn refit_follows_moved_points() {
        let (fixture, mut cloud, mut device) = setup(1000, 0.05, 3);
        let query = fixture.collision_query().unwrap();
        let mut accel = fixture.context.create_accel_struct_aabb();
        accel
            .build(fixture.stream(), &fixture.allocator(), device.input(), true, true)
            .unwrap();
        let handle = accel.handle();

        cloud.jitter(0.02, 99);
        device.update(&cloud, fixture.stream()).unwrap();
        accel.refit(fixture.stream()).unwrap();

        assert_eq!(accel.handle(), handle);
        assert_eq!(
            query.run(fixture.stream(), &accel, &device).unwrap(),
            cloud.count_pairs()
        );
    }

    #[test]
    fn instanced_cloud_matches_cpu_count() {
        let (fixture, cloud, device) = setup(800, 0.05, 4);
        let query = fixture.collision_query().unwrap();
        let allocator = fixture.allocator();
        let mut geometry = fixture.context.create_accel_struct_aabb();
        geometry
            .build(fixture.stream(), &allocator, device.input(), true, false)
            .unwrap();
        let mut instances = fixture.context.create_inst_accel_struct();
        instances
            .build(fixture.stream(), &allocator, geometry.instance(), true, false)
            .unwrap();

        assert_eq!(instances.kind(), AccelKind::Instance);
        assert_eq!(
            query.run(fixture.stream(), &instances, &device).unwrap(),
            cloud.count_pairs()
        );
    }

    #[test]
    fn stale_instance_is_correct_only_after_rebuild() {
        let (fixture, cloud, device) = setup(600, 0.05, 5);
        let query = fixture.collision_query().unwrap();
        let allocator = fixture.allocator();
        let mut geometry = fixture.context.create_accel_struct_aabb();
        geometry
            .build(fixture.stream(), &allocator, device.input(), false, false)
            .unwrap();
        let mut instances = fixture.context.create_inst_accel_struct();
        instances
            .build(fixture.stream(), &allocator, geometry.instance(), true, false)
            .unwrap();
        let expected = cloud.count_pairs();
        assert_eq!(query.run(fixture.stream(), &instances, &device).unwrap(), expected);

        // The compacted rebuild moves the child to a new handle and retires
        // the one the instance structure still refers to.
        geometry.rebuild(fixture.stream()).unwrap();
        fixture.stream().sync().unwrap();
        assert!(instances.needs_rebuild());
        let stale = query.run(fixture.stream(), &instances, &device);
        assert!(matches!(stale, Err(TestError::Gpu(GpuError::DeviceFault(_)))));

        instances.rebuild(fixture.stream()).unwrap();
        assert!(!instances.needs_rebuild());
        assert_eq!(query.run(fixture.stream(), &instances, &device).unwrap(), expected);
    }

    #[test]
    fn unbuilt_structure_misses_everything() {
        let (fixture, _, device) = setup(100, 0.2, 6);
        let query = fixture.collision_query().unwrap();
        let accel = fixture.context.create_accel_struct_aabb();
        assert!(accel.is_empty());
        assert_eq!(query.run(fixture.stream(), &accel, &device).unwrap(), 0);
    }

    #[test]
    fn missing_entry_point_is_reported() {
        let fixture = HostFixture::new().unwrap();
        let image = HostProgramImage::builder("partial")
            .raygen(RAYGEN, |_| {})
            .build();
        let result = CollisionQuery::new(
            &fixture.context,
            ModuleSource::Host(image),
            fixture.stream(),
            &fixture.allocator(),
        );
        assert!(matches!(result, Err(TestError::MissingProgram(name)) if name == MISS));
    }
}

//! Contexts over a fresh host device.

use std::sync::Arc;

use bytemuck::Pod;
use photon_gpu::{Allocator, Device, DeviceArray, HostDevice, HostDeviceBuilder, Stream};
use photon_rt::{ContextOptions, DeviceContext, ModuleSource};

use crate::collision::{self, CollisionQuery, DeviceCloud};
use crate::scene::PointCloud;
use crate::Result;

/// A host device with a validating ray tracing context.
///
/// Every fixture owns its device, so tests never share memory or streams.
pub struct HostFixture {
    pub device: Arc<HostDevice>,
    pub context: DeviceContext,
}

impl HostFixture {
    pub fn new() -> Result<Self> {
        Self::with_options(ContextOptions::new().validation(true))
    }

    pub fn with_options(options: ContextOptions) -> Result<Self> {
        let device = HostDeviceBuilder::new().name("photon-test host").build()?;
        let context = DeviceContext::with_options(device.as_ref(), options)?;
        Ok(Self { device, context })
    }

    pub fn stream(&self) -> &dyn Stream {
        self.device.default_stream()
    }

    pub fn allocator(&self) -> Arc<dyn Allocator> {
        self.device.default_allocator()
    }

    /// Upload `data` on the default stream.
    pub fn upload<T: Pod>(&self, data: &[T], name: &'static str) -> Result<DeviceArray<T>> {
        Ok(DeviceArray::from_slice(
            self.allocator(),
            self.stream(),
            data,
            name,
        )?)
    }

    pub fn upload_cloud(&self, cloud: &PointCloud) -> Result<DeviceCloud> {
        DeviceCloud::upload(cloud, self.stream(), &self.allocator())
    }

    /// The collision query over the host programs.
    pub fn collision_query(&self) -> Result<CollisionQuery> {
        CollisionQuery::new(
            &self.context,
            ModuleSource::Host(collision::host_image()),
            self.stream(),
            &self.allocator(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use photon_core::{Aabb, Float3A};
    use photon_rt::{AabbInput, TriangleInput};

    #[test]
    fn fixtures_do_not_share_devices() {
        let a = HostFixture::new().unwrap();
        let b = HostFixture::new().unwrap();
        assert!(!a.context.same_as(&b.context));
        assert!(a.context.options().validation);
        assert!(!Arc::ptr_eq(&a.device, &b.device));
    }

    #[test]
    fn uploads_round_trip() {
        let fixture = HostFixture::new().unwrap();
        let array = fixture.upload(&[1u32, 2, 3], "values").unwrap();
        assert_eq!(array.download(fixture.stream()).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn build_sizes_cover_memory() {
        let fixture = HostFixture::new().unwrap();
        let boxes = fixture
            .upload(
                &[
                    Aabb::from_center(Vec3::ZERO, Vec3::ONE),
                    Aabb::from_center(Vec3::X * 4.0, Vec3::ONE),
                ],
                "boxes",
            )
            .unwrap();
        let mut accel = fixture.context.create_accel_struct_aabb();
        accel
            .build(
                fixture.stream(),
                &fixture.allocator(),
                AabbInput::new(boxes.view()),
                true,
                false,
            )
            .unwrap();
        assert!(!accel.is_empty());
        assert!(accel.memory_size() >= accel.sizes().output_size);
    }

    #[test]
    fn triangle_build_without_indices() {
        let fixture = HostFixture::new().unwrap();
        let vertices = fixture
            .upload(
                &[
                    Float3A::new(0.0, 0.0, 0.0),
                    Float3A::new(1.0, 0.0, 0.0),
                    Float3A::new(0.0, 1.0, 0.0),
                ],
                "vertices",
            )
            .unwrap();
        let input = TriangleInput::new(vertices.view(), Default::default());
        let mut accel = fixture.context.create_accel_struct_triangle();
        accel
            .build(fixture.stream(), &fixture.allocator(), input, false, false)
            .unwrap();
        assert!(!accel.is_empty());
        assert!(accel.allow_compaction());
    }
}

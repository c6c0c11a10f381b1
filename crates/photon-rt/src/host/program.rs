//! Device programs of the host backend.
//!
//! Host programs are Rust closures registered under their entry names in a
//! [`HostProgramImage`], the host counterpart of a compiled module.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use glam::Vec3;
use hashbrown::HashMap;

use super::launch::{HitContext, LaunchContext};
use crate::backend::TraversableHandle;
use crate::module::ProgramKind;

pub(crate) type RaygenFn = dyn Fn(&mut LaunchContext<'_>) + Send + Sync;
pub(crate) type HitFn = dyn Fn(&mut HitContext<'_, '_>) + Send + Sync;
pub(crate) type ExceptionFn = dyn Fn(&mut LaunchContext<'_>, i32) + Send + Sync;
pub(crate) type CallableFn = dyn Fn(&mut LaunchContext<'_>, &mut [u32]) + Send + Sync;

/// One registered entry point.
#[derive(Clone)]
pub(crate) enum HostProgram {
    Raygen(Arc<RaygenFn>),
    Miss(Arc<HitFn>),
    ClosestHit(Arc<HitFn>),
    AnyHit(Arc<HitFn>),
    Intersection(Arc<HitFn>),
    Exception(Arc<ExceptionFn>),
    DirectCallable(Arc<CallableFn>),
    ContinuationCallable(Arc<CallableFn>),
}

impl HostProgram {
    pub fn kind(&self) -> ProgramKind {
        match self {
            Self::Raygen(_) => ProgramKind::Raygen,
            Self::Miss(_) => ProgramKind::Miss,
            Self::ClosestHit(_) => ProgramKind::ClosestHit,
            Self::AnyHit(_) => ProgramKind::AnyHit,
            Self::Intersection(_) => ProgramKind::Intersection,
            Self::Exception(_) => ProgramKind::Exception,
            Self::DirectCallable(_) => ProgramKind::DirectCallable,
            Self::ContinuationCallable(_) => ProgramKind::ContinuationCallable,
        }
    }
}

struct ImageInner {
    name: String,
    programs: HashMap<String, HostProgram>,
}

/// Named host programs, loaded as a module on the host backend.
#[derive(Clone)]
pub struct HostProgramImage {
    inner: Arc<ImageInner>,
}

impl HostProgramImage {
    /// Start an image called `name`.
    pub fn builder(name: impl Into<String>) -> HostProgramImageBuilder {
        HostProgramImageBuilder {
            name: name.into(),
            programs: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Entry names, sorted.
    pub fn entry_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.inner.programs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn get(&self, entry: &str) -> Option<&HostProgram> {
        self.inner.programs.get(entry)
    }
}

impl fmt::Debug for HostProgramImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostProgramImage")
            .field("name", &self.inner.name)
            .field("entries", &self.entry_names())
            .finish()
    }
}

/// Builder for [`HostProgramImage`].
///
/// Registering a name twice keeps the last program.
pub struct HostProgramImageBuilder {
    name: String,
    programs: HashMap<String, HostProgram>,
}

impl HostProgramImageBuilder {
    fn add(mut self, entry: impl Into<String>, program: HostProgram) -> Self {
        self.programs.insert(entry.into(), program);
        self
    }

    /// Register a ray generation program.
    #[must_use]
    pub fn raygen<F>(self, entry: impl Into<String>, program: F) -> Self
    where
        F: Fn(&mut LaunchContext<'_>) + Send + Sync + 'static,
    {
        self.add(entry, HostProgram::Raygen(Arc::new(program)))
    }

    /// Register a miss program.
    #[must_use]
    pub fn miss<F>(self, entry: impl Into<String>, program: F) -> Self
    where
        F: Fn(&mut HitContext<'_, '_>) + Send + Sync + 'static,
    {
        self.add(entry, HostProgram::Miss(Arc::new(program)))
    }

    /// Register a closest-hit program.
    #[must_use]
    pub fn closest_hit<F>(self, entry: impl Into<String>, program: F) -> Self
    where
        F: Fn(&mut HitContext<'_, '_>) + Send + Sync + 'static,
    {
        self.add(entry, HostProgram::ClosestHit(Arc::new(program)))
    }

    /// Register an any-hit program.
    #[must_use]
    pub fn any_hit<F>(self, entry: impl Into<String>, program: F) -> Self
    where
        F: Fn(&mut HitContext<'_, '_>) + Send + Sync + 'static,
    {
        self.add(entry, HostProgram::AnyHit(Arc::new(program)))
    }

    /// Register an intersection program for custom primitives.
    #[must_use]
    pub fn intersection<F>(self, entry: impl Into<String>, program: F) -> Self
    where
        F: Fn(&mut HitContext<'_, '_>) + Send + Sync + 'static,
    {
        self.add(entry, HostProgram::Intersection(Arc::new(program)))
    }

    /// Register an exception program. It receives the exception code.
    #[must_use]
    pub fn exception<F>(self, entry: impl Into<String>, program: F) -> Self
    where
        F: Fn(&mut LaunchContext<'_>, i32) + Send + Sync + 'static,
    {
        self.add(entry, HostProgram::Exception(Arc::new(program)))
    }

    /// Register a direct callable. Arguments are passed in and out through
    /// the slice.
    #[must_use]
    pub fn direct_callable<F>(self, entry: impl Into<String>, program: F) -> Self
    where
        F: Fn(&mut LaunchContext<'_>, &mut [u32]) + Send + Sync + 'static,
    {
        self.add(entry, HostProgram::DirectCallable(Arc::new(program)))
    }

    /// Register a continuation callable.
    #[must_use]
    pub fn continuation_callable<F>(self, entry: impl Into<String>, program: F) -> Self
    where
        F: Fn(&mut LaunchContext<'_>, &mut [u32]) + Send + Sync + 'static,
    {
        self.add(entry, HostProgram::ContinuationCallable(Arc::new(program)))
    }

    pub fn build(self) -> HostProgramImage {
        HostProgramImage {
            inner: Arc::new(ImageInner {
                name: self.name,
                programs: self.programs,
            }),
        }
    }
}

/// Programs of one program group, resolved from their images.
#[derive(Clone, Default)]
pub(crate) struct HostGroup {
    pub raygen: Option<Arc<RaygenFn>>,
    pub miss: Option<Arc<HitFn>>,
    pub closest_hit: Option<Arc<HitFn>>,
    pub any_hit: Option<Arc<HitFn>>,
    pub intersection: Option<Arc<HitFn>>,
    pub exception: Option<Arc<ExceptionFn>>,
    pub direct: Option<Arc<CallableFn>>,
    pub continuation: Option<Arc<CallableFn>>,
}

bitflags! {
    /// Per-ray traversal flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct RayFlags: u32 {
        const DISABLE_ANYHIT = 1 << 0;
        const ENFORCE_ANYHIT = 1 << 1;
        const TERMINATE_ON_FIRST_HIT = 1 << 2;
        const DISABLE_CLOSESTHIT = 1 << 3;
        const CULL_BACK_FACING_TRIANGLES = 1 << 4;
        const CULL_FRONT_FACING_TRIANGLES = 1 << 5;
        const CULL_DISABLED_ANYHIT = 1 << 6;
        const CULL_ENFORCED_ANYHIT = 1 << 7;
    }
}

/// Arguments of one `trace` call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TraceRay {
    pub handle: TraversableHandle,
    pub origin: Vec3,
    pub direction: Vec3,
    pub tmin: f32,
    pub tmax: f32,
    pub flags: RayFlags,
    /// Tested against each instance's visibility mask.
    pub visibility_mask: u32,
    /// Hit group index = `sbt_offset + sbt_stride * geometry index +
    /// instance offset`.
    pub sbt_offset: u32,
    pub sbt_stride: u32,
    pub miss_index: u32,
}

impl TraceRay {
    /// A ray over `[0, inf)` visible to every instance.
    pub fn new(handle: TraversableHandle, origin: Vec3, direction: Vec3) -> Self {
        Self {
            handle,
            origin,
            direction,
            tmin: 0.0,
            tmax: f32::INFINITY,
            flags: RayFlags::empty(),
            visibility_mask: 0xff,
            sbt_offset: 0,
            sbt_stride: 1,
            miss_index: 0,
        }
    }

    #[must_use]
    pub fn interval(mut self, tmin: f32, tmax: f32) -> Self {
        self.tmin = tmin;
        self.tmax = tmax;
        self
    }

    #[must_use]
    pub fn flags(mut self, flags: RayFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn visibility_mask(mut self, mask: u32) -> Self {
        self.visibility_mask = mask;
        self
    }

    #[must_use]
    pub fn sbt(mut self, offset: u32, stride: u32, miss_index: u32) -> Self {
        self.sbt_offset = offset;
        self.sbt_stride = stride;
        self.miss_index = miss_index;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_lists_entries() {
        let image = HostProgramImage::builder("demo")
            .raygen("__raygen__b", |_| {})
            .miss("__miss__a", |_| {})
            .exception("__exception__", |_, _| {})
            .build();
        assert_eq!(image.name(), "demo");
        assert_eq!(
            image.entry_names(),
            vec!["__exception__", "__miss__a", "__raygen__b"]
        );
        assert_eq!(
            image.get("__miss__a").map(HostProgram::kind),
            Some(ProgramKind::Miss)
        );
        assert!(image.get("__miss__b").is_none());
    }

    #[test]
    fn trace_ray_defaults() {
        let ray = TraceRay::new(TraversableHandle(1), Vec3::ZERO, Vec3::Z)
            .interval(0.5, 2.0)
            .sbt(1, 2, 3);
        assert_eq!(ray.visibility_mask, 0xff);
        assert_eq!((ray.sbt_offset, ray.sbt_stride, ray.miss_index), (1, 2, 3));
        assert_eq!((ray.tmin, ray.tmax), (0.5, 2.0));
    }
}

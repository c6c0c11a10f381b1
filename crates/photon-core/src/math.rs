//! Geometry shared by build inputs and software traversal.

use bytemuck::{Pod, Zeroable};
use glam::{Affine3A, Vec3, Vec3A};

/// Round `value` up to the next multiple of `alignment` (a power of two).
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// A ray in the space it is traced in.
#[derive(Clone, Copy, Debug)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

impl Ray {
    /// Ray with a normalized direction.
    #[inline]
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction: direction.normalize_or_zero(),
        }
    }

    /// Create a ray keeping the direction as given.
    ///
    /// Instance transforms scale the direction, and hit distances stay
    /// comparable across spaces only when it is left unnormalized.
    #[inline]
    pub const fn unnormalized(origin: Vec3, direction: Vec3) -> Self {
        Self { origin, direction }
    }

    /// Point at parameter `t`.
    #[inline]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }
}

/// Axis-aligned box.
///
/// Laid out as six consecutive floats, the format of custom-primitive
/// bounds buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// An inverted box that any merge or expand replaces.
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    #[inline]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Box of `half_extents` around `center`.
    #[inline]
    pub fn from_center(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    /// Smallest box containing all `points`.
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        points.into_iter().fold(Self::EMPTY, |mut aabb, p| {
            aabb.expand_to_include(p);
            aabb
        })
    }

    /// Whether min <= max on every axis.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.min.cmple(self.max).all()
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Edge lengths.
    #[inline]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Surface area, 0 for invalid boxes.
    #[inline]
    pub fn surface_area(&self) -> f32 {
        if !self.is_valid() {
            return 0.0;
        }
        let d = self.size();
        2.0 * (d.x * d.y + d.y * d.z + d.z * d.x)
    }

    /// Boundary inclusive.
    #[inline]
    pub fn contains_point(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    /// Slab test against the parametric interval `[t_min, t_max]`.
    ///
    /// Returns the clipped `(t_near, t_far)` interval. Zero direction
    /// components are handled explicitly so degenerate (zero-length) rays
    /// hit exactly the boxes containing their origin.
    pub fn intersect_ray(&self, ray: &Ray, t_min: f32, t_max: f32) -> Option<(f32, f32)> {
        let mut near = t_min;
        let mut far = t_max;
        for axis in 0..3 {
            let o = ray.origin[axis];
            let d = ray.direction[axis];
            let (lo, hi) = (self.min[axis], self.max[axis]);
            if d == 0.0 {
                if o < lo || o > hi {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / d;
            let mut t0 = (lo - o) * inv;
            let mut t1 = (hi - o) * inv;
            if t0 > t1 {
                std::mem::swap(&mut t0, &mut t1);
            }
            near = near.max(t0);
            far = far.min(t1);
            if near > far {
                return None;
            }
        }
        Some((near, far))
    }

    #[inline]
    pub fn expand_to_include(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Smallest box containing both.
    #[inline]
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

/// Row-major 3x4 affine transform, the instance transform layout.
///
/// Rows are `[m00 m01 m02 tx]`, `[m10 m11 m12 ty]`, `[m20 m21 m22 tz]`.
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Transform(pub [f32; 12]);

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self([
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0,
    ]);

    /// Pure translation.
    pub fn from_translation(t: Vec3) -> Self {
        Self::from_affine(&Affine3A::from_translation(t))
    }

    pub fn from_affine(affine: &Affine3A) -> Self {
        let m = affine.matrix3;
        let t = affine.translation;
        Self([
            m.x_axis.x, m.y_axis.x, m.z_axis.x, t.x, //
            m.x_axis.y, m.y_axis.y, m.z_axis.y, t.y, //
            m.x_axis.z, m.y_axis.z, m.z_axis.z, t.z,
        ])
    }

    pub fn to_affine(&self) -> Affine3A {
        let m = &self.0;
        Affine3A::from_cols(
            Vec3A::new(m[0], m[4], m[8]),
            Vec3A::new(m[1], m[5], m[9]),
            Vec3A::new(m[2], m[6], m[10]),
            Vec3A::new(m[3], m[7], m[11]),
        )
    }

    /// Inverse transform. Singular matrices produce non-finite entries.
    pub fn inverse(&self) -> Self {
        Self::from_affine(&self.to_affine().inverse())
    }

    #[inline]
    pub fn transform_point(&self, p: Vec3) -> Vec3 {
        self.to_affine().transform_point3(p)
    }

    /// Bounds of a transformed box (all eight corners).
    pub fn transform_aabb(&self, aabb: &Aabb) -> Aabb {
        if !aabb.is_valid() {
            return Aabb::EMPTY;
        }
        let affine = self.to_affine();
        Aabb::from_points((0..8).map(|i| {
            let corner = Vec3::new(
                if i & 1 == 0 { aabb.min.x } else { aabb.max.x },
                if i & 2 == 0 { aabb.min.y } else { aabb.max.y },
                if i & 4 == 0 { aabb.min.z } else { aabb.max.z },
            );
            affine.transform_point3(corner)
        }))
    }

    /// Whether every entry is finite.
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 32), 0);
        assert_eq!(align_up(1, 32), 32);
        assert_eq!(align_up(32, 32), 32);
        assert_eq!(align_up(33, 256), 256);
    }

    #[test]
    fn ray_at() {
        let ray = Ray::new(Vec3::ZERO, Vec3::X);
        assert_eq!(ray.at(0.0), Vec3::ZERO);
        assert_eq!(ray.at(1.0), Vec3::X);
        assert_eq!(ray.at(5.0), Vec3::new(5.0, 0.0, 0.0));
    }

    #[test]
    fn aabb_layout_is_six_floats() {
        assert_eq!(std::mem::size_of::<Aabb>(), 24);
        let aabb = Aabb::new(Vec3::new(1.0, 2.0, 3.0), Vec3::new(4.0, 5.0, 6.0));
        let floats: &[f32] = bytemuck::cast_slice(std::slice::from_ref(&aabb));
        assert_eq!(floats, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn aabb_contains_point() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert!(aabb.contains_point(Vec3::splat(0.5)));
        assert!(aabb.contains_point(Vec3::ZERO));
        assert!(aabb.contains_point(Vec3::ONE));
        assert!(!aabb.contains_point(Vec3::new(2.0, 0.5, 0.5)));
    }

    #[test]
    fn aabb_ray_intersection() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);

        let ray = Ray::new(Vec3::new(-1.0, 0.5, 0.5), Vec3::X);
        let (t_near, t_far) = aabb.intersect_ray(&ray, 0.0, f32::MAX).unwrap();
        assert_relative_eq!(t_near, 1.0, epsilon = 1e-5);
        assert_relative_eq!(t_far, 2.0, epsilon = 1e-5);

        let ray = Ray::new(Vec3::new(-1.0, 2.0, 0.5), Vec3::X);
        assert!(aabb.intersect_ray(&ray, 0.0, f32::MAX).is_none());

        // Interval ends before the box
        let ray = Ray::new(Vec3::new(-1.0, 0.5, 0.5), Vec3::X);
        assert!(aabb.intersect_ray(&ray, 0.0, 0.5).is_none());
    }

    #[test]
    fn zero_length_ray_hits_containing_box() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let inside = Ray::unnormalized(Vec3::splat(0.25), Vec3::ZERO);
        let outside = Ray::unnormalized(Vec3::splat(1.5), Vec3::ZERO);
        assert!(aabb.intersect_ray(&inside, 0.0, 0.0).is_some());
        assert!(aabb.intersect_ray(&outside, 0.0, 0.0).is_none());
    }

    #[test]
    fn aabb_merge_and_area() {
        let a = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let b = Aabb::new(Vec3::splat(2.0), Vec3::splat(3.0));
        let m = a.merge(&b);
        assert_eq!(m.min, Vec3::ZERO);
        assert_eq!(m.max, Vec3::splat(3.0));
        assert_relative_eq!(a.surface_area(), 6.0);
        assert_eq!(Aabb::EMPTY.surface_area(), 0.0);
        assert_eq!(Aabb::EMPTY.merge(&a), a);
    }

    #[test]
    fn transform_affine_roundtrip() {
        let affine = Affine3A::from_scale_rotation_translation(
            Vec3::new(2.0, 1.0, 0.5),
            glam::Quat::from_rotation_y(0.3),
            Vec3::new(1.0, -2.0, 3.0),
        );
        let t = Transform::from_affine(&affine);
        let p = Vec3::new(0.3, 0.7, -1.1);
        let expected = affine.transform_point3(p);
        let got = t.transform_point(p);
        assert_relative_eq!(got.x, expected.x, epsilon = 1e-5);
        assert_relative_eq!(got.y, expected.y, epsilon = 1e-5);
        assert_relative_eq!(got.z, expected.z, epsilon = 1e-5);

        let back = t.inverse().transform_point(got);
        assert_relative_eq!(back.x, p.x, epsilon = 1e-4);
        assert_relative_eq!(back.y, p.y, epsilon = 1e-4);
        assert_relative_eq!(back.z, p.z, epsilon = 1e-4);
    }

    #[test]
    fn translation_is_last_column() {
        let t = Transform::from_translation(Vec3::new(4.0, 5.0, 6.0));
        assert_eq!(t.0[3], 4.0);
        assert_eq!(t.0[7], 5.0);
        assert_eq!(t.0[11], 6.0);
        let moved = t.transform_aabb(&Aabb::new(Vec3::ZERO, Vec3::ONE));
        assert_eq!(moved.min, Vec3::new(4.0, 5.0, 6.0));
        assert_eq!(moved.max, Vec3::new(5.0, 6.0, 7.0));
    }
}

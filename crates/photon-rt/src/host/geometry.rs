//! Primitive gathering and ray-primitive intersection.

use bytemuck::Pod;
use glam::Vec3;
use photon_core::{Aabb, DevicePtr, Float3A, Transform};
use photon_gpu::{GpuError, HostMemory, Result};

use super::layout::{
    AabbRecord, CurveRecord, EncodedInstance, InstanceRecord, PrimRef, SphereRecord,
    TriangleRecord,
};
use crate::accel::AccelKind;
use crate::backend::{CurveType, NativeBuildInput, NativeSbtRecords, TraversableHandle};

/// Line segments each curve segment is approximated by.
pub const CURVE_SAMPLES: usize = 8;

/// Per-primitive records of one build, in input order.
pub enum Records {
    Triangles(Vec<TriangleRecord>),
    Aabbs(Vec<AabbRecord>),
    Curves(Vec<CurveRecord>),
    Spheres(Vec<SphereRecord>),
    Instances(Vec<InstanceRecord>),
}

impl Records {
    pub fn kind(&self) -> AccelKind {
        match self {
            Self::Triangles(_) => AccelKind::Triangle,
            Self::Aabbs(_) => AccelKind::Aabb,
            Self::Curves(_) => AccelKind::Curve,
            Self::Spheres(_) => AccelKind::Sphere,
            Self::Instances(_) => AccelKind::Instance,
        }
    }

    /// Records of the primitives in `order`, as bytes.
    pub fn reordered_bytes(&self, order: impl Iterator<Item = usize>) -> Vec<u8> {
        fn pick<T: Pod>(records: &[T], order: impl Iterator<Item = usize>) -> Vec<u8> {
            order
                .flat_map(|i| bytemuck::bytes_of(&records[i]).iter().copied())
                .collect()
        }
        match self {
            Self::Triangles(r) => pick(r, order),
            Self::Aabbs(r) => pick(r, order),
            Self::Curves(r) => pick(r, order),
            Self::Spheres(r) => pick(r, order),
            Self::Instances(r) => pick(r, order),
        }
    }
}

/// Everything a build needs from its inputs.
pub struct Gathered {
    pub bounds: Vec<Aabb>,
    pub prims: Vec<PrimRef>,
    pub records: Records,
}

fn fault(message: String) -> GpuError {
    GpuError::DeviceFault(message)
}

fn read_vec3s(memory: &HostMemory, ptr: DevicePtr, count: u32, stride: u32) -> Result<Vec<Vec3>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let float3a = std::mem::size_of::<Float3A>() as u32;
    if stride == float3a || stride == 0 {
        let points: Vec<Float3A> = memory.read_vec(ptr, count as usize)?;
        return Ok(points.into_iter().map(Vec3::from).collect());
    }
    if stride < 12 {
        return Err(fault(format!("vertex stride {stride} is below 12 bytes")));
    }
    let span = u64::from(stride) * u64::from(count - 1) + 12;
    memory.with_bytes(ptr, span, |bytes| {
        (0..count as usize)
            .map(|i| {
                let v: [f32; 3] = bytemuck::pod_read_unaligned(&bytes[i * stride as usize..][..12]);
                Vec3::from(v)
            })
            .collect()
    })
}

/// Per-primitive SBT record index and geometry flags.
fn sbt_indices(
    memory: &HostMemory,
    sbt: &NativeSbtRecords,
    base: u32,
    count: u32,
) -> Result<Vec<(u32, u32)>> {
    let offsets: Vec<u32> = if sbt.index_offsets.is_null() {
        vec![0; count as usize]
    } else {
        memory.read_vec(sbt.index_offsets, count as usize)?
    };
    offsets
        .into_iter()
        .map(|offset| {
            if offset >= sbt.count() {
                return Err(fault(format!(
                    "SBT index offset {offset} is out of range for {} records",
                    sbt.count()
                )));
            }
            let flags = sbt.flags.get(offset as usize).map_or(0, |f| f.bits());
            Ok((base + offset, flags))
        })
        .collect()
}

fn pad(v: Vec3, w: f32) -> [f32; 4] {
    [v.x, v.y, v.z, w]
}

/// Read the primitives of `inputs`. `child_bounds` resolves an instance's
/// child to its object-space bounds.
pub fn gather(
    memory: &HostMemory,
    inputs: &[NativeBuildInput],
    child_bounds: impl Fn(TraversableHandle) -> Result<Aabb>,
) -> Result<Gathered> {
    let mut bounds = Vec::new();
    let mut prims = Vec::new();
    let mut sbt_base = 0u32;
    let mut records = match inputs.first() {
        Some(NativeBuildInput::Triangles(_)) => Records::Triangles(Vec::new()),
        Some(NativeBuildInput::Aabbs(_)) => Records::Aabbs(Vec::new()),
        Some(NativeBuildInput::Curves(_)) => Records::Curves(Vec::new()),
        Some(NativeBuildInput::Spheres(_)) => Records::Spheres(Vec::new()),
        Some(NativeBuildInput::Instances(_)) | None => Records::Instances(Vec::new()),
    };

    for (input_index, input) in inputs.iter().enumerate() {
        let input_index = input_index as u32;
        let mut push = |primitive_index: u32, sbt: (u32, u32), b: Aabb| {
            bounds.push(b);
            prims.push(PrimRef {
                input_index,
                primitive_index,
                sbt_index: sbt.0,
                flags: sbt.1,
            });
        };
        match (input, &mut records) {
            (NativeBuildInput::Triangles(t), Records::Triangles(out)) => {
                let vertices = read_vec3s(memory, t.vertices, t.num_vertices, t.vertex_stride)?;
                let count = t.primitive_count();
                let indices: Vec<[u32; 3]> = if t.indices.is_null() {
                    (0..count).map(|i| [3 * i, 3 * i + 1, 3 * i + 2]).collect()
                } else {
                    memory.read_vec(t.indices, count as usize)?
                };
                let sbt = sbt_indices(memory, &t.sbt, sbt_base, count)?;
                for (i, (tri, sbt)) in indices.iter().zip(sbt).enumerate() {
                    let corner = |k: usize| {
                        vertices.get(tri[k] as usize).copied().ok_or_else(|| {
                            fault(format!("triangle {i} indexes vertex {} of {}", tri[k], vertices.len()))
                        })
                    };
                    let (a, b, c) = (corner(0)?, corner(1)?, corner(2)?);
                    out.push([pad(a, 0.0), pad(b, 0.0), pad(c, 0.0)]);
                    push(i as u32, sbt, Aabb::from_points([a, b, c]));
                }
                sbt_base += t.sbt.count();
            }
            (NativeBuildInput::Aabbs(a), Records::Aabbs(out)) => {
                let boxes: Vec<Aabb> = memory.read_vec(a.aabbs, a.num_primitives as usize)?;
                let sbt = sbt_indices(memory, &a.sbt, sbt_base, a.num_primitives)?;
                for (i, (b, sbt)) in boxes.into_iter().zip(sbt).enumerate() {
                    out.push(AabbRecord {
                        min: pad(b.min, 0.0),
                        max: pad(b.max, 0.0),
                    });
                    push(i as u32, sbt, b);
                }
                sbt_base += a.sbt.count();
            }
            (NativeBuildInput::Spheres(s), Records::Spheres(out)) => {
                let centers = read_vec3s(memory, s.centers, s.num_vertices, 0)?;
                let radii: Vec<f32> = if s.single_radius {
                    let r: f32 = if s.num_vertices > 0 { memory.read(s.radii)? } else { 0.0 };
                    vec![r; s.num_vertices as usize]
                } else {
                    memory.read_vec(s.radii, s.num_vertices as usize)?
                };
                let sbt = sbt_indices(memory, &s.sbt, sbt_base, s.num_vertices)?;
                for (i, ((center, radius), sbt)) in centers.into_iter().zip(radii).zip(sbt).enumerate() {
                    out.push(pad(center, radius));
                    let b = if radius >= 0.0 {
                        Aabb::from_center(center, Vec3::splat(radius))
                    } else {
                        Aabb::EMPTY
                    };
                    push(i as u32, sbt, b);
                }
                sbt_base += s.sbt.count();
            }
            (NativeBuildInput::Curves(c), Records::Curves(out)) => {
                let vertices = read_vec3s(memory, c.vertices, c.num_vertices, 0)?;
                let widths: Vec<f32> = memory.read_vec(c.widths, c.num_vertices as usize)?;
                let segments: Vec<u32> = memory.read_vec(c.indices, c.num_primitives as usize)?;
                let n = c.curve_type.control_points() as usize;
                for (i, &first) in segments.iter().enumerate() {
                    let first = first as usize;
                    if first + n > vertices.len() {
                        return Err(fault(format!(
                            "curve segment {i} starts at control point {first} of {}",
                            vertices.len()
                        )));
                    }
                    let mut record = CurveRecord {
                        curve_type: c.curve_type as u32,
                        ..CurveRecord::default()
                    };
                    for k in 0..n {
                        record.points[k] = pad(vertices[first + k], widths[first + k]);
                    }
                    push(i as u32, (sbt_base, c.flags.bits()), curve_bounds(&record));
                    out.push(record);
                }
                sbt_base += 1;
            }
            (NativeBuildInput::Instances(inst), Records::Instances(out)) => {
                let encoded: Vec<EncodedInstance> =
                    memory.read_vec(inst.instances, inst.num_instances as usize)?;
                for (i, e) in encoded.iter().enumerate() {
                    let transform = e.transform();
                    let inverse = transform.inverse();
                    out.push(InstanceRecord {
                        object_to_world: transform.0,
                        world_to_object: inverse.0,
                        child: e.traversable,
                        instance_id: e.instance_id,
                        sbt_offset: e.sbt_offset,
                        visibility_mask: e.visibility_mask,
                        flags: e.flags,
                        reserved: [0; 2],
                    });
                    let child = child_bounds(e.child())?;
                    let b = if inverse.is_finite() && child.is_valid() {
                        transform.transform_aabb(&child)
                    } else {
                        Aabb::EMPTY
                    };
                    push(i as u32, (0, e.flags), b);
                }
            }
            _ => return Err(fault("build inputs of mixed primitive types".into())),
        }
    }

    Ok(Gathered {
        bounds,
        prims,
        records,
    })
}

fn curve_type_from_u32(value: u32) -> CurveType {
    match value {
        0x2501 => CurveType::RoundQuadraticBSpline,
        0x2502 => CurveType::RoundCubicBSpline,
        0x2504 => CurveType::RoundCatmullRom,
        0x2505 => CurveType::FlatQuadraticBSpline,
        0x2507 => CurveType::RoundCubicBezier,
        _ => CurveType::RoundLinear,
    }
}

/// Position and radius of a curve segment at `u` in `[0, 1]`.
pub fn curve_point(record: &CurveRecord, u: f32) -> (Vec3, f32) {
    let weights: [f32; 4] = match curve_type_from_u32(record.curve_type) {
        CurveType::RoundLinear => [1.0 - u, u, 0.0, 0.0],
        CurveType::RoundQuadraticBSpline | CurveType::FlatQuadraticBSpline => [
            0.5 * (1.0 - u) * (1.0 - u),
            0.5 * (-2.0 * u * u + 2.0 * u + 1.0),
            0.5 * u * u,
            0.0,
        ],
        CurveType::RoundCubicBSpline => {
            let (u2, u3) = (u * u, u * u * u);
            [
                (1.0 - u) * (1.0 - u) * (1.0 - u) / 6.0,
                (3.0 * u3 - 6.0 * u2 + 4.0) / 6.0,
                (-3.0 * u3 + 3.0 * u2 + 3.0 * u + 1.0) / 6.0,
                u3 / 6.0,
            ]
        }
        CurveType::RoundCatmullRom => {
            let (u2, u3) = (u * u, u * u * u);
            [
                0.5 * (-u3 + 2.0 * u2 - u),
                0.5 * (3.0 * u3 - 5.0 * u2 + 2.0),
                0.5 * (-3.0 * u3 + 4.0 * u2 + u),
                0.5 * (u3 - u2),
            ]
        }
        CurveType::RoundCubicBezier => {
            let v = 1.0 - u;
            [v * v * v, 3.0 * u * v * v, 3.0 * u * u * v, u * u * u]
        }
    };
    let mut position = Vec3::ZERO;
    let mut radius = 0.0;
    for (w, p) in weights.iter().zip(&record.points) {
        position += *w * Vec3::new(p[0], p[1], p[2]);
        radius += w * p[3];
    }
    (position, radius)
}

fn curve_samples(record: &CurveRecord) -> [(Vec3, f32); CURVE_SAMPLES + 1] {
    std::array::from_fn(|i| curve_point(record, i as f32 / CURVE_SAMPLES as f32))
}

fn curve_bounds(record: &CurveRecord) -> Aabb {
    curve_samples(record)
        .iter()
        .fold(Aabb::EMPTY, |acc, &(p, r)| {
            acc.merge(&Aabb::from_center(p, Vec3::splat(r.abs())))
        })
}

/// Möller-Trumbore. Returns `(t, u, v, front_facing)`; a triangle is front
/// facing when its vertices appear counter-clockwise from the origin.
pub fn intersect_triangle(
    record: &TriangleRecord,
    origin: Vec3,
    direction: Vec3,
    tmin: f32,
    tmax: f32,
) -> Option<(f32, f32, f32, bool)> {
    let [a, b, c] = record.map(|p| Vec3::new(p[0], p[1], p[2]));
    let e1 = b - a;
    let e2 = c - a;
    let p = direction.cross(e2);
    let det = e1.dot(p);
    if det.abs() < f32::EPSILON * e1.length() * e2.length() * direction.length() {
        return None;
    }
    let inv = 1.0 / det;
    let s = origin - a;
    let u = s.dot(p) * inv;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = direction.dot(q) * inv;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv;
    (t > tmin && t < tmax).then_some((t, u, v, det > 0.0))
}

/// Returns `(t, front_facing)`; rays starting inside hit the back face.
pub fn intersect_sphere(
    record: &SphereRecord,
    origin: Vec3,
    direction: Vec3,
    tmin: f32,
    tmax: f32,
) -> Option<(f32, bool)> {
    let center = Vec3::new(record[0], record[1], record[2]);
    let radius = record[3];
    let oc = origin - center;
    let a = direction.length_squared();
    if a == 0.0 {
        return None;
    }
    let half_b = oc.dot(direction);
    let c = oc.length_squared() - radius * radius;
    let disc = half_b * half_b - a * c;
    if disc < 0.0 {
        return None;
    }
    let root = disc.sqrt();
    let near = (-half_b - root) / a;
    let far = (-half_b + root) / a;
    if near > tmin && near < tmax {
        Some((near, true))
    } else if far > tmin && far < tmax {
        Some((far, false))
    } else {
        None
    }
}

/// Entry distance along a normalized direction into a capsule, with the
/// hit's parameter along the axis.
fn intersect_capsule(origin: Vec3, dir: Vec3, pa: Vec3, pb: Vec3, radius: f32) -> Option<(f32, f32)> {
    let ba = pb - pa;
    let oa = origin - pa;
    let baba = ba.dot(ba);
    let bard = ba.dot(dir);
    let baoa = ba.dot(oa);
    let rdoa = dir.dot(oa);
    let oaoa = oa.dot(oa);
    let a = baba - bard * bard;
    let b = baba * rdoa - baoa * bard;
    let c = baba * oaoa - baoa * baoa - radius * radius * baba;
    let h = b * b - a * c;
    if h >= 0.0 && a > 0.0 {
        let t = (-b - h.sqrt()) / a;
        let y = baoa + t * bard;
        if y > 0.0 && y < baba {
            return Some((t, y / baba));
        }
    }
    // End caps
    for (center, along) in [(pa, 0.0), (pb, 1.0)] {
        let oc = origin - center;
        let b = dir.dot(oc);
        let c = oc.dot(oc) - radius * radius;
        let h = b * b - c;
        if h > 0.0 {
            let t = -b - h.sqrt();
            let y = baoa + t * bard;
            let on_cap = if along == 0.0 { y <= 0.0 } else { y >= baba };
            if on_cap || baba == 0.0 {
                return Some((t, along));
            }
        }
    }
    None
}

/// Returns `(t, u)` with `u` the curve parameter of the hit.
pub fn intersect_curve(
    record: &CurveRecord,
    origin: Vec3,
    direction: Vec3,
    tmin: f32,
    tmax: f32,
) -> Option<(f32, f32)> {
    let scale = direction.length();
    if scale == 0.0 {
        return None;
    }
    let dir = direction / scale;
    let samples = curve_samples(record);
    let mut best: Option<(f32, f32)> = None;
    for (i, pair) in samples.windows(2).enumerate() {
        let (pa, ra) = pair[0];
        let (pb, rb) = pair[1];
        let Some((t, along)) = intersect_capsule(origin, dir, pa, pb, ra.max(rb)) else {
            continue;
        };
        let t = t / scale;
        if t > tmin && t < tmax && best.map_or(true, |(bt, _)| t < bt) {
            best = Some((t, (i as f32 + along) / CURVE_SAMPLES as f32));
        }
    }
    best
}

/// Object-space ray of an instance.
pub fn to_object(world_to_object: &[f32; 12], origin: Vec3, direction: Vec3) -> (Vec3, Vec3) {
    let affine = Transform(*world_to_object).to_affine();
    (
        affine.transform_point3(origin),
        affine.transform_vector3(direction),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn triangle_facing() {
        let tri = [[0.0, 0.0, 0.0, 0.0], [1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0]];
        let origin = Vec3::new(0.25, 0.25, 1.0);
        let (t, u, v, front) = intersect_triangle(&tri, origin, -Vec3::Z, 0.0, 10.0).unwrap();
        assert_relative_eq!(t, 1.0);
        assert_relative_eq!(u, 0.25);
        assert_relative_eq!(v, 0.25);
        assert!(front);
        let below = Vec3::new(0.25, 0.25, -1.0);
        let (_, _, _, front) = intersect_triangle(&tri, below, Vec3::Z, 0.0, 10.0).unwrap();
        assert!(!front);
        assert!(intersect_triangle(&tri, origin, -Vec3::Z, 0.0, 0.5).is_none());
    }

    #[test]
    fn sphere_from_outside_and_inside() {
        let sphere = [0.0, 0.0, 0.0, 1.0];
        let (t, front) =
            intersect_sphere(&sphere, Vec3::new(0.0, 0.0, -3.0), Vec3::Z * 2.0, 0.0, 10.0).unwrap();
        assert_relative_eq!(t, 1.0);
        assert!(front);
        let (t, front) = intersect_sphere(&sphere, Vec3::ZERO, Vec3::X, 0.0, 10.0).unwrap();
        assert_relative_eq!(t, 1.0);
        assert!(!front);
    }

    #[test]
    fn linear_curve_is_a_capsule() {
        let record = CurveRecord {
            points: [
                [0.0, 0.0, 0.0, 0.5],
                [4.0, 0.0, 0.0, 0.5],
                [0.0; 4],
                [0.0; 4],
            ],
            curve_type: CurveType::RoundLinear as u32,
            reserved: [0; 3],
        };
        let (t, u) =
            intersect_curve(&record, Vec3::new(2.0, 3.0, 0.0), -Vec3::Y, 0.0, 10.0).unwrap();
        assert_relative_eq!(t, 2.5, epsilon = 1e-4);
        assert_relative_eq!(u, 0.5, epsilon = 1e-4);
        assert!(intersect_curve(&record, Vec3::new(6.0, 3.0, 0.0), -Vec3::Y, 0.0, 10.0).is_none());
        let b = curve_bounds(&record);
        assert_relative_eq!(b.min.x, -0.5);
        assert_relative_eq!(b.max.x, 4.5);
    }

    #[test]
    fn bezier_interpolates_end_points() {
        let record = CurveRecord {
            points: [
                [0.0, 0.0, 0.0, 1.0],
                [1.0, 2.0, 0.0, 1.0],
                [2.0, 2.0, 0.0, 1.0],
                [3.0, 0.0, 0.0, 2.0],
            ],
            curve_type: CurveType::RoundCubicBezier as u32,
            reserved: [0; 3],
        };
        let (start, r0) = curve_point(&record, 0.0);
        let (end, r1) = curve_point(&record, 1.0);
        assert_relative_eq!(start.x, 0.0);
        assert_relative_eq!(end.x, 3.0);
        assert_relative_eq!(r0, 1.0);
        assert_relative_eq!(r1, 2.0);
    }
}

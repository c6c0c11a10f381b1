//! Typed build inputs and their translation to native descriptors.

use photon_core::{Aabb, DevicePtr, Float3A, Transform};
use photon_gpu::BufferView;

use super::{AccelKind, TraversableRef};
use crate::backend::{
    CurveType, GeometryFlags, InstanceFlags, NativeAabbs, NativeBuildInput, NativeCurves,
    NativeInstance, NativeInstances, NativeSbtRecords, NativeSpheres, NativeTriangles, RtBackend,
};
use crate::error::{Result, RtError};

/// Triangle geometry.
#[derive(Clone, Debug)]
pub struct TriangleInput {
    pub vertex_buffer: BufferView<Float3A>,
    /// Optional triplets, one per triangle.
    pub index_buffer: BufferView<[u32; 3]>,
    /// Optional per-triangle SBT record offset.
    pub sbt_index_offset_buffer: BufferView<u32>,
    /// One entry per SBT record; empty means no flags.
    pub per_sbt_record_flags: Vec<GeometryFlags>,
    /// Triangles in `index_buffer`. Zero means `num_vertices / 3`
    /// non-indexed triangles.
    pub num_index_triplets: u32,
    pub num_sbt_records: u32,
    pub num_vertices: u32,
}

impl Default for TriangleInput {
    fn default() -> Self {
        Self {
            vertex_buffer: BufferView::default(),
            index_buffer: BufferView::default(),
            sbt_index_offset_buffer: BufferView::default(),
            per_sbt_record_flags: Vec::new(),
            num_index_triplets: 0,
            num_sbt_records: 1,
            num_vertices: 0,
        }
    }
}

impl TriangleInput {
    /// Indexed (or, with an empty index view, non-indexed) triangles using
    /// the full length of each view.
    pub fn new(vertex_buffer: BufferView<Float3A>, index_buffer: BufferView<[u32; 3]>) -> Self {
        Self {
            num_vertices: vertex_buffer.len() as u32,
            num_index_triplets: index_buffer.len() as u32,
            vertex_buffer,
            index_buffer,
            ..Default::default()
        }
    }
}

/// Custom primitives bounded by boxes.
#[derive(Clone, Debug)]
pub struct AabbInput {
    pub aabb_buffer: BufferView<Aabb>,
    pub sbt_index_offset_buffer: BufferView<u32>,
    pub per_sbt_record_flags: Vec<GeometryFlags>,
    pub num_sbt_records: u32,
    pub num_primitives: u32,
}

impl Default for AabbInput {
    fn default() -> Self {
        Self {
            aabb_buffer: BufferView::default(),
            sbt_index_offset_buffer: BufferView::default(),
            per_sbt_record_flags: Vec::new(),
            num_sbt_records: 1,
            num_primitives: 0,
        }
    }
}

impl AabbInput {
    /// One primitive per box in the view.
    pub fn new(aabb_buffer: BufferView<Aabb>) -> Self {
        Self {
            num_primitives: aabb_buffer.len() as u32,
            aabb_buffer,
            ..Default::default()
        }
    }
}

/// Curve segments with a per-vertex radius.
#[derive(Clone, Debug, Default)]
pub struct CurveInput {
    pub curve_type: CurveType,
    pub vertex_buffer: BufferView<Float3A>,
    /// First control point of each segment.
    pub index_buffer: BufferView<u32>,
    /// Radius at each control point.
    pub width_buffer: BufferView<f32>,
    pub num_primitives: u32,
    pub num_vertices: u32,
    pub flags: GeometryFlags,
}

/// Spheres centred on vertices.
#[derive(Clone, Debug)]
pub struct SphereInput {
    /// One radius per vertex, or a single radius.
    pub radius_buffer: BufferView<f32>,
    pub vertex_buffer: BufferView<Float3A>,
    pub sbt_index_offset_buffer: BufferView<u32>,
    pub per_sbt_record_flags: Vec<GeometryFlags>,
    pub num_sbt_records: u32,
    pub num_vertices: u32,
    pub single_radius: bool,
}

impl Default for SphereInput {
    fn default() -> Self {
        Self {
            radius_buffer: BufferView::default(),
            vertex_buffer: BufferView::default(),
            sbt_index_offset_buffer: BufferView::default(),
            per_sbt_record_flags: Vec::new(),
            num_sbt_records: 1,
            num_vertices: 0,
            single_radius: false,
        }
    }
}

/// A placed reference to a geometry structure.
#[derive(Clone, Debug)]
pub struct InstanceInput {
    pub accel: TraversableRef,
    /// Object-to-world transform.
    pub transform: Transform,
    /// The instance is skipped when `ray_mask & visibility_mask == 0`.
    pub visibility_mask: u32,
    pub instance_id: u32,
    /// Added to the hit group index of every hit in this instance.
    pub sbt_offset: u32,
    pub flags: InstanceFlags,
}

impl InstanceInput {
    /// Identity-placed instance of `accel`, visible to every ray.
    pub fn new(accel: TraversableRef) -> Self {
        Self {
            accel,
            transform: Transform::IDENTITY,
            visibility_mask: 255,
            instance_id: 0,
            sbt_offset: 0,
            flags: InstanceFlags::empty(),
        }
    }

    #[must_use]
    pub fn transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    #[must_use]
    pub fn instance_id(mut self, id: u32) -> Self {
        self.instance_id = id;
        self
    }

    #[must_use]
    pub fn sbt_offset(mut self, offset: u32) -> Self {
        self.sbt_offset = offset;
        self
    }

    #[must_use]
    pub fn visibility_mask(mut self, mask: u32) -> Self {
        self.visibility_mask = mask;
        self
    }

    #[must_use]
    pub fn flags(mut self, flags: InstanceFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Build inputs of one structure, tagged by primitive type.
#[derive(Clone, Debug)]
pub enum BuildInputs {
    Triangles(Vec<TriangleInput>),
    Aabbs(Vec<AabbInput>),
    Curves(Vec<CurveInput>),
    Spheres(Vec<SphereInput>),
    Instances(Vec<InstanceInput>),
}

impl BuildInputs {
    /// Structure kind these inputs build.
    pub fn kind(&self) -> AccelKind {
        match self {
            Self::Triangles(_) => AccelKind::Triangle,
            Self::Aabbs(_) => AccelKind::Aabb,
            Self::Curves(_) => AccelKind::Curve,
            Self::Spheres(_) => AccelKind::Sphere,
            Self::Instances(_) => AccelKind::Instance,
        }
    }

    /// Number of inputs.
    pub fn len(&self) -> usize {
        match self {
            Self::Triangles(v) => v.len(),
            Self::Aabbs(v) => v.len(),
            Self::Curves(v) => v.len(),
            Self::Spheres(v) => v.len(),
            Self::Instances(v) => v.len(),
        }
    }

    /// Whether there are no inputs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the SBT records of every input.
    pub fn num_sbt_records(&self) -> u32 {
        match self {
            Self::Triangles(v) => v.iter().map(|i| i.num_sbt_records).sum(),
            Self::Aabbs(v) => v.iter().map(|i| i.num_sbt_records).sum(),
            Self::Curves(v) => v.len() as u32,
            Self::Spheres(v) => v.iter().map(|i| i.num_sbt_records).sum(),
            Self::Instances(_) => 0,
        }
    }
}

macro_rules! impl_into_inputs {
    ($input:ty, $variant:ident) => {
        impl From<$input> for BuildInputs {
            fn from(input: $input) -> Self {
                Self::$variant(vec![input])
            }
        }

        impl From<Vec<$input>> for BuildInputs {
            fn from(inputs: Vec<$input>) -> Self {
                Self::$variant(inputs)
            }
        }

        impl From<&[$input]> for BuildInputs {
            fn from(inputs: &[$input]) -> Self {
                Self::$variant(inputs.to_vec())
            }
        }
    };
}

impl_into_inputs!(TriangleInput, Triangles);
impl_into_inputs!(AabbInput, Aabbs);
impl_into_inputs!(CurveInput, Curves);
impl_into_inputs!(SphereInput, Spheres);
impl_into_inputs!(InstanceInput, Instances);

/// Native descriptors of one build.
pub(crate) struct Translated {
    pub native: Vec<NativeBuildInput>,
    /// Encoded instance array still to be placed in device memory.
    pub instance_bytes: Option<Vec<u8>>,
    /// Children referenced by an instance build, with the generation seen.
    pub children: Vec<(TraversableRef, u64)>,
}

impl Translated {
    /// Point the instance input at the uploaded instance array.
    pub fn set_instance_buffer(&mut self, ptr: DevicePtr) {
        for input in &mut self.native {
            if let NativeBuildInput::Instances(instances) = input {
                instances.instances = ptr;
            }
        }
    }
}

/// Translate typed inputs into the backend's descriptors.
pub(crate) fn translate(
    inputs: &BuildInputs,
    backend: &dyn RtBackend,
    max_sbt_records: u32,
) -> Result<Translated> {
    let mut translated = Translated {
        native: Vec::with_capacity(inputs.len()),
        instance_bytes: None,
        children: Vec::new(),
    };
    match inputs {
        BuildInputs::Triangles(inputs) => {
            for (i, input) in inputs.iter().enumerate() {
                translated
                    .native
                    .push(NativeBuildInput::Triangles(translate_triangles(i, input)?));
            }
        }
        BuildInputs::Aabbs(inputs) => {
            for (i, input) in inputs.iter().enumerate() {
                translated
                    .native
                    .push(NativeBuildInput::Aabbs(translate_aabbs(i, input)?));
            }
        }
        BuildInputs::Curves(inputs) => {
            for (i, input) in inputs.iter().enumerate() {
                translated
                    .native
                    .push(NativeBuildInput::Curves(translate_curves(i, input)?));
            }
        }
        BuildInputs::Spheres(inputs) => {
            for (i, input) in inputs.iter().enumerate() {
                translated
                    .native
                    .push(NativeBuildInput::Spheres(translate_spheres(i, input)?));
            }
        }
        BuildInputs::Instances(inputs) => {
            let (instances, children) = collect_instances(inputs, backend.device_id())?;
            translated.instance_bytes = Some(backend.encode_instances(&instances)?);
            translated.children = children;
            translated
                .native
                .push(NativeBuildInput::Instances(NativeInstances {
                    instances: DevicePtr::NULL,
                    num_instances: instances.len() as u32,
                }));
        }
    }
    let total = inputs.num_sbt_records();
    if total > max_sbt_records {
        return Err(RtError::invalid_value(format!(
            "{total} SBT records exceed the device limit of {max_sbt_records}"
        )));
    }
    Ok(translated)
}

fn check_count(input: usize, what: &str, declared: u32, available: usize) -> Result<()> {
    if declared as usize > available {
        return Err(RtError::invalid_value(format!(
            "input {input}: {declared} {what} declared but the buffer holds {available}"
        )));
    }
    Ok(())
}

fn translate_sbt_records(
    input: usize,
    num_sbt_records: u32,
    flags: &[GeometryFlags],
    offsets: BufferView<u32>,
    num_primitives: u32,
) -> Result<NativeSbtRecords> {
    if num_sbt_records == 0 {
        return Err(RtError::invalid_value(format!(
            "input {input}: num_sbt_records must be at least 1"
        )));
    }
    if !flags.is_empty() && flags.len() != num_sbt_records as usize {
        return Err(RtError::invalid_value(format!(
            "input {input}: {} per-record flags for {num_sbt_records} SBT records",
            flags.len()
        )));
    }
    if num_sbt_records > 1 {
        if offsets.is_empty() {
            return Err(RtError::invalid_value(format!(
                "input {input}: {num_sbt_records} SBT records need an index offset buffer"
            )));
        }
        check_count(input, "SBT index offsets", num_primitives, offsets.len())?;
    }
    let flags = if flags.is_empty() {
        vec![GeometryFlags::empty(); num_sbt_records as usize]
    } else {
        flags.to_vec()
    };
    Ok(NativeSbtRecords {
        flags,
        index_offsets: if num_sbt_records > 1 {
            offsets.ptr()
        } else {
            DevicePtr::NULL
        },
    })
}

fn translate_triangles(i: usize, input: &TriangleInput) -> Result<NativeTriangles> {
    check_count(i, "vertices", input.num_vertices, input.vertex_buffer.len())?;
    let indexed = input.num_index_triplets > 0;
    if indexed {
        check_count(
            i,
            "index triplets",
            input.num_index_triplets,
            input.index_buffer.len(),
        )?;
    }
    let native = NativeTriangles {
        vertices: input.vertex_buffer.ptr(),
        num_vertices: input.num_vertices,
        vertex_stride: input.vertex_buffer.stride() as u32,
        indices: if indexed {
            input.index_buffer.ptr()
        } else {
            DevicePtr::NULL
        },
        num_index_triplets: input.num_index_triplets,
        sbt: NativeSbtRecords::default(),
    };
    let sbt = translate_sbt_records(
        i,
        input.num_sbt_records,
        &input.per_sbt_record_flags,
        input.sbt_index_offset_buffer,
        native.primitive_count(),
    )?;
    Ok(NativeTriangles { sbt, ..native })
}

fn translate_aabbs(i: usize, input: &AabbInput) -> Result<NativeAabbs> {
    check_count(i, "boxes", input.num_primitives, input.aabb_buffer.len())?;
    Ok(NativeAabbs {
        aabbs: input.aabb_buffer.ptr(),
        num_primitives: input.num_primitives,
        sbt: translate_sbt_records(
            i,
            input.num_sbt_records,
            &input.per_sbt_record_flags,
            input.sbt_index_offset_buffer,
            input.num_primitives,
        )?,
    })
}

fn translate_curves(i: usize, input: &CurveInput) -> Result<NativeCurves> {
    check_count(i, "vertices", input.num_vertices, input.vertex_buffer.len())?;
    check_count(i, "widths", input.num_vertices, input.width_buffer.len())?;
    check_count(i, "segments", input.num_primitives, input.index_buffer.len())?;
    if input.num_primitives > 0 && input.num_vertices < input.curve_type.control_points() {
        return Err(RtError::invalid_value(format!(
            "input {i}: {:?} segments need {} control points",
            input.curve_type,
            input.curve_type.control_points()
        )));
    }
    Ok(NativeCurves {
        curve_type: input.curve_type,
        vertices: input.vertex_buffer.ptr(),
        widths: input.width_buffer.ptr(),
        num_vertices: input.num_vertices,
        indices: input.index_buffer.ptr(),
        num_primitives: input.num_primitives,
        flags: input.flags,
    })
}

fn translate_spheres(i: usize, input: &SphereInput) -> Result<NativeSpheres> {
    check_count(i, "centers", input.num_vertices, input.vertex_buffer.len())?;
    let radii = if input.single_radius {
        u32::from(input.num_vertices > 0)
    } else {
        input.num_vertices
    };
    check_count(i, "radii", radii, input.radius_buffer.len())?;
    Ok(NativeSpheres {
        centers: input.vertex_buffer.ptr(),
        radii: input.radius_buffer.ptr(),
        num_vertices: input.num_vertices,
        single_radius: input.single_radius,
        sbt: translate_sbt_records(
            i,
            input.num_sbt_records,
            &input.per_sbt_record_flags,
            input.sbt_index_offset_buffer,
            input.num_vertices,
        )?,
    })
}

type Children = Vec<(TraversableRef, u64)>;

/// Resolve instance inputs against their children's current handles.
fn collect_instances(
    inputs: &[InstanceInput],
    device_id: u32,
) -> Result<(Vec<NativeInstance>, Children)> {
    let mut instances = Vec::with_capacity(inputs.len());
    let mut children = Vec::with_capacity(inputs.len());
    for (i, input) in inputs.iter().enumerate() {
        if input.accel.device_id() != device_id {
            return Err(RtError::invalid_value(format!(
                "instance {i} references a structure of device {}",
                input.accel.device_id()
            )));
        }
        if input.accel.kind() == AccelKind::Instance {
            return Err(RtError::unsupported(format!(
                "instance {i} references an instance structure"
            )));
        }
        let handle = input.accel.handle();
        if handle.is_null() {
            return Err(RtError::invalid_value(format!(
                "instance {i} references an empty structure"
            )));
        }
        if input.visibility_mask > 0xff {
            return Err(RtError::invalid_value(format!(
                "instance {i}: visibility mask {:#x} exceeds 8 bits",
                input.visibility_mask
            )));
        }
        if !input.transform.is_finite() {
            return Err(RtError::invalid_value(format!(
                "instance {i} has a non-finite transform"
            )));
        }
        instances.push(NativeInstance {
            transform: input.transform,
            instance_id: input.instance_id,
            sbt_offset: input.sbt_offset,
            visibility_mask: input.visibility_mask,
            flags: input.flags,
            traversable: handle,
        });
        children.push((input.accel.clone(), input.accel.generation()));
    }
    Ok((instances, children))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view<T>(addr: u64, len: usize) -> BufferView<T> {
        BufferView::from_raw_parts(DevicePtr(addr), len)
    }

    #[test]
    fn flags_must_match_record_count() {
        let input = AabbInput {
            aabb_buffer: view(0x1000, 4),
            sbt_index_offset_buffer: view(0x2000, 4),
            per_sbt_record_flags: vec![GeometryFlags::DISABLE_ANYHIT],
            num_sbt_records: 2,
            num_primitives: 4,
        };
        assert!(translate_aabbs(0, &input).is_err());

        let input = AabbInput {
            per_sbt_record_flags: vec![GeometryFlags::DISABLE_ANYHIT, GeometryFlags::empty()],
            ..input
        };
        let native = translate_aabbs(0, &input).unwrap();
        assert_eq!(native.sbt.count(), 2);
        assert_eq!(native.sbt.index_offsets, DevicePtr(0x2000));
    }

    #[test]
    fn empty_flags_default_to_none() {
        let input = AabbInput::new(view(0x1000, 8));
        let native = translate_aabbs(0, &input).unwrap();
        assert_eq!(native.sbt.flags, vec![GeometryFlags::empty()]);
        assert!(native.sbt.index_offsets.is_null());
    }

    #[test]
    fn counts_may_not_exceed_buffers() {
        let input = AabbInput {
            num_primitives: 9,
            ..AabbInput::new(view(0x1000, 8))
        };
        assert!(translate_aabbs(0, &input).is_err());
    }

    #[test]
    fn non_indexed_triangles() {
        let input = TriangleInput::new(view(0x1000, 6), BufferView::default());
        let native = translate_triangles(0, &input).unwrap();
        assert!(native.indices.is_null());
        assert_eq!(native.primitive_count(), 2);
        assert_eq!(native.vertex_stride, 16);
    }

    #[test]
    fn single_radius_needs_one_value() {
        let input = SphereInput {
            vertex_buffer: view(0x1000, 3),
            radius_buffer: view(0x2000, 1),
            num_vertices: 3,
            single_radius: true,
            ..Default::default()
        };
        assert!(translate_spheres(0, &input).is_ok());
        let input = SphereInput {
            single_radius: false,
            ..input
        };
        assert!(translate_spheres(0, &input).is_err());
    }

    #[test]
    fn sbt_record_totals() {
        let inputs = BuildInputs::from(vec![
            TriangleInput::default(),
            TriangleInput {
                num_sbt_records: 3,
                ..Default::default()
            },
        ]);
        assert_eq!(inputs.num_sbt_records(), 4);
        assert_eq!(inputs.kind(), AccelKind::Triangle);
    }
}

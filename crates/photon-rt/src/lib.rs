//! Ray tracing layer for the photon workspace.
//!
//! This crate provides:
//! - Acceleration structures over triangles, AABBs, curves, spheres and
//!   instances, with build, refit, rebuild and compaction
//! - Modules, programs and pipelines with a typed launch
//! - Shader binding table records and layout
//! - A host reference backend and a Vulkan backend behind [`RtBackend`]
//!
//! Everything starts from a [`DeviceContext`] created for a
//! [`photon_gpu::Device`].

pub mod accel;
pub mod backend;
pub mod context;
pub mod error;
pub mod host;
pub mod module;
pub mod pipeline;
pub mod sbt;
pub mod vulkan;

pub use accel::{
    AabbInput, AccelKind, AccelStruct, BuildInputs, CurveInput, InstanceInput, SphereInput,
    TraversableRef, TriangleInput,
};
pub use backend::{
    AccelBufferSizes, BuildFlags, CurveType, ExceptionFlags, GeometryFlags, InstanceFlags,
    ModuleCompileOptions, ModuleSource, PipelineCompileOptions, PipelineLinkOptions, RtBackend,
    TraversableHandle,
};
pub use context::{ContextOptions, DeviceContext, DeviceProperties, LogLevel, VALIDATION_ENV};
pub use error::{ErrorContext, Result, RtError, Status};
pub use host::{
    HitContext, HostBackend, HostProgramImage, HostProgramImageBuilder, LaunchContext, RayFlags,
    TraceRay, HIT_KIND_BACK_FACE, HIT_KIND_FRONT_FACE,
};
pub use module::{Module, Program, ProgramKind};
pub use pipeline::Pipeline;
pub use sbt::{
    EmptyRecord, RecordBytes, SbtHeader, SbtRecord, ShaderBindingTable, ShaderBindingTableBuilder,
};
pub use vulkan::{LaunchConstants, VulkanBackend};

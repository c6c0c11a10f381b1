//! Test harness for the photon ray tracing layer.
//!
//! Provides host device fixtures, seeded point scenes with CPU reference
//! answers, and the collision query the end-to-end tests and the
//! `photon-collision` demo launch.

pub mod collision;
pub mod fixture;
pub mod scene;

pub use collision::{CollisionParams, CollisionQuery, DeviceCloud};
pub use fixture::HostFixture;
pub use scene::PointCloud;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] photon_gpu::GpuError),
    #[error("Ray tracing error: {0}")]
    Rt(#[from] photon_rt::RtError),
    #[error("Program '{0}' not found in module")]
    MissingProgram(String),
    #[error("Result mismatch: {0}")]
    Mismatch(String),
}

pub type Result<T> = std::result::Result<T, TestError>;

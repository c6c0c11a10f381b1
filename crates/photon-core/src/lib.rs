//! Core math and plain-data types for the photon ray tracing layer.
//!
//! This crate provides the foundational types shared by every backend:
//! - Device addresses ([`DevicePtr`])
//! - Bounding boxes, rays and affine transforms laid out for device upload
//! - Alignment helpers

pub mod math;
pub mod types;

pub use math::{align_up, Aabb, Ray, Transform};
pub use types::{DevicePtr, Float3A};

//! Plain-data types shared between host and device.

use std::fmt;

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Address of a byte in device memory.
///
/// Address 0 is reserved as null.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    /// The null address.
    pub const NULL: Self = Self(0);

    /// Whether this is the null address.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Raw address.
    #[inline]
    pub const fn addr(self) -> u64 {
        self.0
    }

    /// Address `bytes` past this one.
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr({:#x})", self.0)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Three floats padded to 16 bytes, the vertex buffer element layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C, align(16))]
pub struct Float3A {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub pad: f32,
}

impl Float3A {
    /// Create a new padded vector.
    #[inline]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z, pad: 0.0 }
    }
}

impl From<Vec3> for Float3A {
    fn from(v: Vec3) -> Self {
        Self::new(v.x, v.y, v.z)
    }
}

impl From<Float3A> for Vec3 {
    fn from(v: Float3A) -> Self {
        Self::new(v.x, v.y, v.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float3a_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<Float3A>(), 16);
        assert_eq!(std::mem::align_of::<Float3A>(), 16);
    }

    #[test]
    fn device_ptr_offset() {
        let p = DevicePtr(0x1000);
        assert!(!p.is_null());
        assert!(DevicePtr::NULL.is_null());
        assert_eq!(p.offset(0x40), DevicePtr(0x1040));
        assert_eq!(format!("{p}"), "0x1000");
    }
}

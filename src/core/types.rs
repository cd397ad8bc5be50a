//! Core type aliases and re-exports

pub use glam::{Affine3A, IVec2, IVec3, Mat3, Quat, UVec3, Vec2, Vec3};

/// Standard Result type for the engine
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;

/// Mip-map level of an octree volume. Scale 0 is the finest; an octant with
/// an edge length of `s` voxels has scale `log2(s)`.
pub type Scale = i32;

/// Frame counter used as the octant update timestamp.
pub type Frame = u32;

/// Scale value of a block that has never been integrated into.
pub const SCALE_UNINIT: Scale = -1;

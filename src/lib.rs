//! voxfuse - dense volumetric mapping on a sparse voxel octree
//!
//! Fuses posed depth (and optionally colour and identifier) frames into a
//! global map held in a sparse octree whose leaves are mip-mapped voxel
//! blocks. Two fusion models are supported: multi-resolution log-odds
//! occupancy with frustum volume carving and scale-adaptive block updates,
//! and projective TSDF. The surface is extracted with per-block marching
//! cubes.

pub mod core;
pub mod image;
pub mod integrator;
pub mod map;
pub mod math;
pub mod mesh;
pub mod octree;
pub mod sensor;

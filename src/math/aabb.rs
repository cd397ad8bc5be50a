//! Axis-aligned bounding boxes in world metres and voxel units

use crate::core::types::{IVec3, Vec3};

/// Axis-aligned bounding box defined by min and max corners
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Create AABB from min and max corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create AABB from center and half-extents
    pub fn from_center_half_extent(center: Vec3, half_extent: Vec3) -> Self {
        Self {
            min: center - half_extent,
            max: center + half_extent,
        }
    }

    /// Get center point
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get size (max - min)
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Check if point is inside AABB
    pub fn contains_point(&self, p: Vec3) -> bool {
        p.x >= self.min.x && p.x <= self.max.x &&
        p.y >= self.min.y && p.y <= self.max.y &&
        p.z >= self.min.z && p.z <= self.max.z
    }

    /// Check if two AABBs intersect
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x && self.max.x >= other.min.x &&
        self.min.y <= other.max.y && self.max.y >= other.min.y &&
        self.min.z <= other.max.z && self.max.z >= other.min.z
    }

    /// Expand AABB to include point
    pub fn expand(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }
}

/// Integer AABB over voxel coordinates, tracking the extent of allocated
/// octree leaves. Starts out empty; `min > max` component-wise denotes the
/// empty box.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VoxelAabb {
    pub min: IVec3,
    pub max: IVec3,
}

impl VoxelAabb {
    /// Create an empty box
    pub fn empty() -> Self {
        Self {
            min: IVec3::MAX,
            max: IVec3::MIN,
        }
    }

    /// Whether no voxel has been added yet
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Check if a voxel coordinate is inside the box (inclusive bounds)
    pub fn contains(&self, v: IVec3) -> bool {
        !self.is_empty()
            && v.x >= self.min.x && v.x <= self.max.x
            && v.y >= self.min.y && v.y <= self.max.y
            && v.z >= self.min.z && v.z <= self.max.z
    }

    /// Extend the box to contain an octant with corner `coord` and edge
    /// length `size` in voxels. Bounds are over voxel coordinates, so the
    /// octant's far corner is `coord + size - 1`.
    pub fn extend_octant(&mut self, coord: IVec3, size: i32) {
        self.min = self.min.min(coord);
        self.max = self.max.max(coord + IVec3::splat(size - 1));
    }
}

impl Default for VoxelAabb {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_and_accessors() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert_eq!(aabb.center(), Vec3::splat(0.5));
        assert_eq!(aabb.size(), Vec3::ONE);
    }

    #[test]
    fn test_contains_point() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert!(aabb.contains_point(Vec3::splat(0.5)));
        assert!(!aabb.contains_point(Vec3::splat(2.0)));
    }

    #[test]
    fn test_voxel_aabb_empty() {
        let aabb = VoxelAabb::empty();
        assert!(aabb.is_empty());
        assert!(!aabb.contains(IVec3::ZERO));
    }

    #[test]
    fn test_voxel_aabb_extend() {
        let mut aabb = VoxelAabb::empty();
        aabb.extend_octant(IVec3::new(8, 0, 16), 8);
        assert!(!aabb.is_empty());
        assert!(aabb.contains(IVec3::new(8, 0, 16)));
        assert!(aabb.contains(IVec3::new(15, 7, 23)));
        assert!(!aabb.contains(IVec3::new(16, 0, 16)));
        aabb.extend_octant(IVec3::ZERO, 8);
        assert!(aabb.contains(IVec3::ZERO));
    }
}

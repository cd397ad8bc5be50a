//! Top-down octant lookup

use crate::core::types::{IVec3, Scale};
use crate::map::data::{ColourData, FieldData, IdData};
use crate::octree::{Octree, OctantId};

/// Fetch the leaf octant containing `voxel`: either the block, or the
/// deepest childless node on the descent path. Returns `None` if the voxel
/// is outside the volume or its branch is unallocated.
pub fn leaf<F: FieldData, C: ColourData, I: IdData>(
    octree: &Octree<F, C, I>,
    voxel: IVec3,
) -> Option<OctantId> {
    if !octree.contains(voxel) {
        return None;
    }
    let mut current = octree.root();
    loop {
        let node = octree.node(current);
        if node.is_leaf() {
            return Some(OctantId::Node(current));
        }
        match node.child(node.child_idx_of(voxel)) {
            Some(OctantId::Block(b)) => return Some(OctantId::Block(b)),
            Some(OctantId::Node(n)) => current = n,
            None => return None,
        }
    }
}

/// Fetch the block containing `voxel`, `None` if the branch does not reach
/// block depth.
pub fn block<F: FieldData, C: ColourData, I: IdData>(
    octree: &Octree<F, C, I>,
    voxel: IVec3,
) -> Option<crate::octree::BlockId> {
    match leaf(octree, voxel) {
        Some(OctantId::Block(b)) => Some(b),
        _ => None,
    }
}

/// Fetch the finest allocated octant containing `voxel` with an edge length
/// of at least `2^min_scale` voxels. Stops early at childless nodes.
pub fn finest_octant<F: FieldData, C: ColourData, I: IdData>(
    octree: &Octree<F, C, I>,
    voxel: IVec3,
    min_scale: Scale,
) -> Option<OctantId> {
    if !octree.contains(voxel) {
        return None;
    }
    let min_size = 1 << min_scale.max(0);
    let mut current = octree.root();
    loop {
        let node = octree.node(current);
        if node.is_leaf() {
            return Some(OctantId::Node(current));
        }
        if node.size <= min_size {
            return Some(OctantId::Node(current));
        }
        match node.child(node.child_idx_of(voxel)) {
            Some(OctantId::Block(b)) => return Some(OctantId::Block(b)),
            Some(OctantId::Node(n)) => current = n,
            None => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::data::OccupancyField;

    #[test]
    fn test_fetch_block_and_leaf() {
        let mut octree: Octree<OccupancyField> = Octree::new(16, 8).unwrap();
        let root = octree.root();
        let (child, _) = octree.allocate_child(root, 0);
        let block_id = child.as_block().unwrap();

        assert_eq!(block(&octree, IVec3::new(3, 4, 5)), Some(block_id));
        assert_eq!(leaf(&octree, IVec3::new(3, 4, 5)), Some(OctantId::Block(block_id)));
        // Unallocated sibling branch
        assert_eq!(leaf(&octree, IVec3::new(12, 4, 5)), None);
        // Out of bounds
        assert_eq!(leaf(&octree, IVec3::new(-1, 0, 0)), None);
    }

    #[test]
    fn test_leaf_node() {
        let octree: Octree<OccupancyField> = Octree::new(16, 8).unwrap();
        // Nothing allocated: the root is a childless node
        let id = leaf(&octree, IVec3::new(3, 4, 5)).unwrap();
        assert_eq!(id, OctantId::Node(octree.root()));
    }
}

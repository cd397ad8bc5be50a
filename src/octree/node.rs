//! Internal octree node
//!
//! A node with no children is itself a leaf and represents a uniform region,
//! which in occupancy maps is fully-observed free space compressed above the
//! block level. Nodes carry min/max field aggregates summarising their
//! subtree; TSDF maps never read them.

use crate::core::types::{Frame, IVec3};
use crate::map::data::{ColourData, FieldData, IdData, Voxel};
use crate::octree::pool::{NodeId, OctantId};

pub struct Node<F: FieldData> {
    /// Minimum corner in voxels
    pub coord: IVec3,
    /// Edge length in voxels (power of two)
    pub size: i32,
    /// Parent node, `None` for the root
    pub parent: Option<NodeId>,
    /// Frame of the last propagation through this node
    pub timestamp: Frame,
    /// Bit `i` set iff child `i` is allocated
    pub child_mask: u8,
    children: [Option<OctantId>; 8],
    /// Minimum field data among the subtree, or the node's own data if leaf
    pub min_data: F,
    /// Maximum field data among the subtree, or the node's own data if leaf
    pub max_data: F,
}

impl<F: FieldData> Node<F> {
    /// Construct the root node
    pub fn root(size: i32) -> Self {
        Self {
            coord: IVec3::ZERO,
            size,
            parent: None,
            timestamp: 0,
            child_mask: 0,
            children: [None; 8],
            min_data: F::default(),
            max_data: F::default(),
        }
    }

    /// Construct the child node of `parent` with index `child_idx`
    pub fn child_of(parent: &Node<F>, parent_id: NodeId, child_idx: usize) -> Self {
        Self {
            coord: parent.child_coord(child_idx),
            size: parent.size / 2,
            parent: Some(parent_id),
            timestamp: 0,
            child_mask: 0,
            children: [None; 8],
            min_data: F::default(),
            max_data: F::default(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.child_mask == 0
    }

    pub fn child(&self, child_idx: usize) -> Option<OctantId> {
        self.children[child_idx]
    }

    pub fn set_child(&mut self, child_idx: usize, child: Option<OctantId>) {
        if child.is_some() {
            self.child_mask |= 1 << child_idx;
        } else {
            self.child_mask &= !(1 << child_idx);
        }
        self.children[child_idx] = child;
    }

    /// Corner coordinates of the child with index `child_idx`.
    /// Bit 0 of the index is the x offset, bit 1 the y offset, bit 2 the z.
    pub fn child_coord(&self, child_idx: usize) -> IVec3 {
        debug_assert!(child_idx < 8);
        let half = self.size / 2;
        self.coord
            + half
                * IVec3::new(
                    (child_idx & 1) as i32,
                    ((child_idx >> 1) & 1) as i32,
                    ((child_idx >> 2) & 1) as i32,
                )
    }

    /// Index of the child whose region contains `coord`
    pub fn child_idx_of(&self, coord: IVec3) -> usize {
        let half = self.size / 2;
        let offset = coord - self.coord;
        (((offset.x & half) != 0) as usize)
            + 2 * (((offset.y & half) != 0) as usize)
            + 4 * (((offset.z & half) != 0) as usize)
    }

    /// Data sample representing the node's volume. The maximum data if the
    /// node is an observed leaf, the default (unobserved) data otherwise.
    pub fn data<C: ColourData, I: IdData>(&self) -> Voxel<F, C, I> {
        if self.is_leaf() && self.max_data.observed() {
            Voxel {
                field: self.max_data,
                colour: C::default(),
                id: I::default(),
            }
        } else {
            Voxel::default()
        }
    }
}

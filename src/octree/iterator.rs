//! Depth-first octree traversal
//!
//! One iterator with two customisation hooks supplied as closures: `visit`
//! decides whether an octant is yielded, `skip_subtree` prunes a whole
//! branch without yielding it. The prebuilt constructors cover the common
//! traversals.

use crate::core::types::{Affine3A, Frame, Vec3};
use crate::map::data::{ColourData, FieldData, IdData};
use crate::octree::pool::{BlockId, OctantId};
use crate::octree::Octree;
use crate::sensor::SensorModel;

pub struct OctreeIter<'a, F, C, I, V, S>
where
    F: FieldData,
    C: ColourData,
    I: IdData,
    V: FnMut(&Octree<F, C, I>, OctantId) -> bool,
    S: FnMut(&Octree<F, C, I>, OctantId) -> bool,
{
    octree: &'a Octree<F, C, I>,
    stack: Vec<OctantId>,
    visit: V,
    skip_subtree: S,
}

impl<'a, F, C, I, V, S> OctreeIter<'a, F, C, I, V, S>
where
    F: FieldData,
    C: ColourData,
    I: IdData,
    V: FnMut(&Octree<F, C, I>, OctantId) -> bool,
    S: FnMut(&Octree<F, C, I>, OctantId) -> bool,
{
    pub fn new(octree: &'a Octree<F, C, I>, visit: V, skip_subtree: S) -> Self {
        Self {
            octree,
            stack: vec![OctantId::Node(octree.root())],
            visit,
            skip_subtree,
        }
    }
}

impl<'a, F, C, I, V, S> Iterator for OctreeIter<'a, F, C, I, V, S>
where
    F: FieldData,
    C: ColourData,
    I: IdData,
    V: FnMut(&Octree<F, C, I>, OctantId) -> bool,
    S: FnMut(&Octree<F, C, I>, OctantId) -> bool,
{
    type Item = OctantId;

    fn next(&mut self) -> Option<OctantId> {
        while let Some(id) = self.stack.pop() {
            if (self.skip_subtree)(self.octree, id) {
                continue;
            }
            if let OctantId::Node(n) = id {
                // Reverse order so children pop in index order 0..7
                let node = self.octree.node(n);
                for child_idx in (0..8).rev() {
                    if let Some(child) = node.child(child_idx) {
                        self.stack.push(child);
                    }
                }
            }
            if (self.visit)(self.octree, id) {
                return Some(id);
            }
        }
        None
    }
}

impl<F: FieldData, C: ColourData, I: IdData> Octree<F, C, I> {
    /// Iterate with custom `visit` and `skip_subtree` predicates
    pub fn iter_with<'a, V, S>(&'a self, visit: V, skip_subtree: S) -> OctreeIter<'a, F, C, I, V, S>
    where
        V: FnMut(&Octree<F, C, I>, OctantId) -> bool,
        S: FnMut(&Octree<F, C, I>, OctantId) -> bool,
    {
        OctreeIter::new(self, visit, skip_subtree)
    }

    /// All octants, depth first
    pub fn iter_octants(&self) -> impl Iterator<Item = OctantId> + '_ {
        self.iter_with(|_, _| true, |_, _| false)
    }

    /// Internal nodes only
    pub fn iter_nodes(&self) -> impl Iterator<Item = OctantId> + '_ {
        self.iter_with(|_, id| !id.is_block(), |_, _| false)
    }

    /// Blocks only
    pub fn iter_blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.iter_with(|_, id| id.is_block(), |_, _| false)
            .filter_map(|id| id.as_block())
    }

    /// Leaf octants: blocks and childless nodes
    pub fn iter_leaves(&self) -> impl Iterator<Item = OctantId> + '_ {
        self.iter_with(|o, id| o.octant_is_leaf(id), |_, _| false)
    }

    /// Blocks updated at or after `frame`. Subtrees whose root octant is
    /// older are pruned, so the traversal relies on up-to-date node
    /// timestamps from propagation.
    pub fn iter_updated_blocks(&self, frame: Frame) -> impl Iterator<Item = BlockId> + '_ {
        self.iter_with(
            move |o, id| id.is_block() && o.octant_timestamp(id) >= frame,
            move |o, id| o.octant_timestamp(id) < frame,
        )
        .filter_map(|id| id.as_block())
    }

    /// Blocks whose bounding sphere intersects the sensor frustum. `t_so` is
    /// the transform from the metric octree frame to the sensor frame and
    /// `res` the map resolution in metres per voxel.
    pub fn iter_frustum_blocks<'a, M: SensorModel>(
        &'a self,
        sensor: &'a M,
        t_so: Affine3A,
        res: f32,
    ) -> impl Iterator<Item = BlockId> + 'a {
        self.iter_with(
            move |_, id| id.is_block(),
            move |o, id| {
                let coord = o.octant_coord(id);
                let size = o.octant_size(id);
                let centre_m = (coord.as_vec3() + Vec3::splat(size as f32 * 0.5)) * res;
                let centre_s = t_so.transform_point3(centre_m);
                let radius = 3.0f32.sqrt() * 0.5 * res * size as f32;
                !sensor.sphere_in_frustum(centre_s, radius)
            },
        )
        .filter_map(|id| id.as_block())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::data::OccupancyField;

    fn test_octree() -> Octree<OccupancyField> {
        let mut octree = Octree::new(16, 8).unwrap();
        let root = octree.root();
        octree.allocate_child(root, 0);
        octree.allocate_child(root, 3);
        octree
    }

    #[test]
    fn test_iter_all() {
        let octree = test_octree();
        // Root node plus two blocks
        assert_eq!(octree.iter_octants().count(), 3);
        assert_eq!(octree.iter_blocks().count(), 2);
        assert_eq!(octree.iter_nodes().count(), 1);
    }

    #[test]
    fn test_iter_leaves() {
        let octree = test_octree();
        // The two blocks are leaves; the root has children so it is not
        assert_eq!(octree.iter_leaves().count(), 2);

        let empty: Octree<OccupancyField> = Octree::new(16, 8).unwrap();
        // A childless root is itself a leaf
        assert_eq!(empty.iter_leaves().count(), 1);
    }

    #[test]
    fn test_iter_updated() {
        let mut octree = test_octree();
        let blocks: Vec<_> = octree.iter_blocks().collect();
        octree.block_mut(blocks[0]).timestamp = 5;
        octree.node_mut(octree.root()).timestamp = 5;
        assert_eq!(octree.iter_updated_blocks(5).count(), 1);
        assert_eq!(octree.iter_updated_blocks(6).count(), 0);
        assert_eq!(octree.iter_updated_blocks(0).count(), 2);
    }

    #[test]
    fn test_dfs_order_deterministic() {
        let octree = test_octree();
        let a: Vec<_> = octree.iter_octants().collect();
        let b: Vec<_> = octree.iter_octants().collect();
        assert_eq!(a, b);
        // Child 0 precedes child 3
        let blocks: Vec<_> = octree.iter_blocks().collect();
        assert_eq!(octree.block(blocks[0]).coord.x, 0);
        assert_eq!(octree.block(blocks[1]).coord.x, 8);
    }
}

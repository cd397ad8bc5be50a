//! Bottom-up propagation of block data through the tree
//!
//! After per-block fusion every touched block folds its data up to its
//! coarsest mip level, then the node aggregates are swept from the block
//! depth to the root. Subtrees that have become uniform observed free space
//! are pruned into leaf nodes.

use crate::core::types::Frame;
use crate::map::data::{
    up_prop_max, up_prop_min, ColourData, FieldData, IdData, OccupancyConfig, OccupancyField,
    Voxel,
};
use crate::octree::block::Block;
use crate::octree::pool::{BlockId, NodeId, OctantId};
use crate::octree::Octree;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashSet};

/// Fraction of the minimum occupancy at which a uniformly free subtree is
/// collapsed into a leaf node.
const PRUNE_THRESHOLD: f32 = 0.95;

/// Fold a block's data from its current integration scale up to the
/// coarsest scale, maintaining the mean, min and max stacks.
pub fn propagate_block_to_coarsest_scale<F: FieldData, C: ColourData, I: IdData>(
    block: &mut Block<F, C, I>,
) {
    let max_scale = block.max_scale();
    // With a shared coarser buffer the fused buffer data at its scale must
    // not be overwritten by the mean up-propagation.
    let buffer_mean_gate = if block.buffer_is_shared() {
        Some(block.buffer_scale())
    } else {
        None
    };

    for child_scale in block.current_scale()..max_scale {
        let parent_scale = child_scale + 1;
        let child_size = block.size_at_scale(child_scale) as usize;
        let parent_size = child_size / 2;

        let child_mean: Vec<Voxel<F, C, I>> = block
            .data_slice_at_scale(child_scale)
            .expect("scales at or above current are allocated")
            .to_vec();
        let child_min = block.min_field_array_at_scale(child_scale);
        let child_max = block.max_field_array_at_scale(child_scale);

        let n_parent = parent_size * parent_size * parent_size;
        let mut parent_mean: Vec<Voxel<F, C, I>> = Vec::with_capacity(n_parent);
        let mut parent_min: Vec<F> = Vec::with_capacity(n_parent);
        let mut parent_max: Vec<F> = Vec::with_capacity(n_parent);

        for z in 0..parent_size {
            for y in 0..parent_size {
                for x in 0..parent_size {
                    let mut mean_children = [Voxel::<F, C, I>::default(); 8];
                    let mut min_children = [F::default(); 8];
                    let mut max_children = [F::default(); 8];
                    for (c, child) in mean_children.iter_mut().enumerate() {
                        let cx = 2 * x + (c & 1);
                        let cy = 2 * y + ((c >> 1) & 1);
                        let cz = 2 * z + ((c >> 2) & 1);
                        let idx = cx + cy * child_size + cz * child_size * child_size;
                        *child = child_mean[idx];
                        min_children[c] = child_min[idx];
                        max_children[c] = child_max[idx];
                    }

                    let fields: Vec<F> = mean_children.iter().map(|v| v.field).collect();
                    let carried = mean_children
                        .iter()
                        .find(|v| v.field.valid())
                        .copied()
                        .unwrap_or_default();
                    parent_mean.push(Voxel {
                        field: F::up_prop_mean(&fields),
                        colour: carried.colour,
                        id: carried.id,
                    });
                    parent_min.push(up_prop_min(&min_children));
                    parent_max.push(up_prop_max(&max_children));
                }
            }
        }

        if buffer_mean_gate != Some(parent_scale) {
            block
                .data_slice_at_scale_mut(parent_scale)
                .copy_from_slice(&parent_mean);
        }
        block.set_min_max_at_scale(
            parent_scale,
            parent_min.into_boxed_slice(),
            parent_max.into_boxed_slice(),
        );
    }
}

/// Min/max reduction over a node's children. Absent children count as
/// unobserved, which keeps unobserved regions from being pruned.
fn reduce_node_children<C: ColourData, I: IdData>(
    octree: &Octree<OccupancyField, C, I>,
    node: NodeId,
) -> (OccupancyField, OccupancyField) {
    let mut mins = [OccupancyField::default(); 8];
    let mut maxs = [OccupancyField::default(); 8];
    for child_idx in 0..8 {
        match octree.node(node).child(child_idx) {
            Some(OctantId::Block(b)) => {
                let block = octree.block(b);
                mins[child_idx] = block.min_data_coarsest();
                maxs[child_idx] = block.max_data_coarsest();
            }
            Some(OctantId::Node(n)) => {
                let child = octree.node(n);
                mins[child_idx] = child.min_data;
                maxs[child_idx] = child.max_data;
            }
            None => {}
        }
    }
    (up_prop_min(&mins), up_prop_max(&maxs))
}

/// Sweep the node aggregates from the block depth to the root, pruning
/// subtrees that became uniform free space. Re-running within the same frame
/// is a no-op thanks to the timestamp guard.
pub(crate) fn propagate_to_root<C: ColourData, I: IdData>(
    octree: &mut Octree<OccupancyField, C, I>,
    config: &OccupancyConfig,
    blocks: &[BlockId],
    seeds: Vec<(i32, NodeId)>,
    frame: Frame,
    touched: &mut Option<&mut HashSet<OctantId>>,
) {
    // Per-block mip folding is embarrassingly parallel
    let block_set: HashSet<u32> = blocks.iter().map(|b| b.0).collect();
    octree
        .pool_mut()
        .block_slab_mut()
        .par_iter_mut()
        .enumerate()
        .for_each(|(idx, slot)| {
            if !block_set.contains(&(idx as u32)) {
                return;
            }
            if let Some(block) = slot.as_mut() {
                propagate_block_to_coarsest_scale(block);
            }
        });

    let block_depth = octree.block_depth();
    let mut sets: Vec<BTreeSet<NodeId>> = vec![BTreeSet::new(); block_depth.max(1) as usize];
    for &b in blocks {
        let parent = octree.block(b).parent;
        sets[(block_depth - 1) as usize].insert(parent);
    }
    for (depth, n) in seeds {
        if depth >= 0 {
            sets[depth as usize].insert(n);
        }
    }

    for d in (1..block_depth).rev() {
        let nodes: Vec<NodeId> = sets[d as usize].iter().copied().collect();
        for n in nodes {
            if octree.node(n).timestamp == frame {
                continue;
            }
            let (min_data, max_data) = reduce_node_children(octree, n);
            let parent = {
                let node = octree.node_mut(n);
                node.min_data = min_data;
                node.max_data = max_data;
                node.timestamp = frame;
                node.parent
            };
            if let Some(p) = parent {
                sets[(d - 1) as usize].insert(p);
            }
            if let Some(t) = touched.as_deref_mut() {
                t.insert(OctantId::Node(n));
            }

            if max_data.observed && max_data.field() <= PRUNE_THRESHOLD * config.min_occupancy {
                if let Some(t) = touched.as_deref_mut() {
                    let mut subtree = Vec::new();
                    octree.collect_subtree(n, &mut subtree);
                    for octant in subtree {
                        t.remove(&octant);
                    }
                }
                octree.delete_children(n);
            }
        }
    }

    let root = octree.root();
    let (min_data, max_data) = reduce_node_children(octree, root);
    let node = octree.node_mut(root);
    node.min_data = min_data;
    node.max_data = max_data;
    node.timestamp = frame;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::IVec3;
    use crate::map::data::OccupancyVoxel;

    type TestOctree = Octree<OccupancyField>;

    fn saturate_block(block: &mut Block<OccupancyField, (), ()>, occupancy: f32, weight: u8) {
        block.allocate_down_to(0);
        for v in block.data_slice_at_scale_mut(0) {
            v.field = OccupancyField {
                occupancy,
                weight,
                observed: true,
            };
        }
    }

    #[test]
    fn test_block_mip_propagation() {
        let mut block: Block<OccupancyField, (), ()> =
            Block::new(IVec3::ZERO, 8, NodeId(0), OccupancyVoxel::default());
        block.allocate_down_to(0);
        // One occupied voxel in otherwise free data
        for v in block.data_slice_at_scale_mut(0) {
            v.field = OccupancyField {
                occupancy: -4.0,
                weight: 10,
                observed: true,
            };
        }
        block.data_slice_at_scale_mut(0)[0].field = OccupancyField {
            occupancy: 4.0,
            weight: 10,
            observed: true,
        };
        propagate_block_to_coarsest_scale(&mut block);

        // The coarsest max tracks the occupied voxel, the min the free bulk
        assert!(block.max_data_coarsest().field() > 0.0);
        assert!(block.min_data_coarsest().field() < 0.0);
        assert!(block.data_coarsest().field.observed);
        // Min/max bound the mean at every scale
        for scale in 1..=3 {
            for v in block.data_slice_at_scale(scale).unwrap() {
                let coarse_min = block.min_data_coarsest().field();
                let coarse_max = block.max_data_coarsest().field();
                assert!(v.field.field() >= coarse_min - 1e-3);
                assert!(v.field.field() <= coarse_max + 1e-3);
            }
        }
    }

    #[test]
    fn test_prune_uniform_free_subtree() {
        let config = OccupancyConfig::default();
        let mut octree = TestOctree::new(32, 8).unwrap();
        let root = octree.root();
        let (child, _) = octree.allocate_child(root, 0);
        let node = child.as_node().unwrap();
        octree.allocate_all_children(node);
        let blocks: Vec<BlockId> = octree.iter_blocks().collect();
        assert_eq!(blocks.len(), 8);
        for &b in &blocks {
            saturate_block(octree.block_mut(b), config.log_odd_min, config.max_weight);
        }

        let mut touched: HashSet<OctantId> = HashSet::new();
        for &b in &blocks {
            touched.insert(OctantId::Block(b));
        }
        let mut touched_opt = Some(&mut touched);
        propagate_to_root(&mut octree, &config, &blocks, Vec::new(), 1, &mut touched_opt);

        // All eight blocks were deallocated and the node became a free leaf
        assert_eq!(octree.pool().block_count(), 0);
        assert!(octree.node(node).is_leaf());
        assert!(octree.node(node).max_data.observed);
        assert!(octree.node(node).max_data.field() <= PRUNE_THRESHOLD * config.min_occupancy);
        // No stale handles remain, the surviving node is still reported
        for &b in &blocks {
            assert!(!touched.contains(&OctantId::Block(b)));
        }
        assert!(touched.contains(&OctantId::Node(node)));
    }

    #[test]
    fn test_aggregates_bound_children() {
        let config = OccupancyConfig::default();
        let mut octree = TestOctree::new(16, 8).unwrap();
        let root = octree.root();
        octree.allocate_all_children(root);
        let blocks: Vec<BlockId> = octree.iter_blocks().collect();
        // Mixed data: alternating free and occupied blocks
        for (i, &b) in blocks.iter().enumerate() {
            let occupancy = if i % 2 == 0 { -3.0 } else { 2.0 };
            saturate_block(octree.block_mut(b), occupancy, 5);
        }
        propagate_to_root(&mut octree, &config, &blocks, Vec::new(), 1, &mut None);

        let root_node = octree.node(root);
        assert!(root_node.min_data.field() <= root_node.max_data.field());
        for &b in &blocks {
            let field = octree.block(b).data_coarsest().field.field();
            assert!(root_node.min_data.field() <= field + 1e-3);
            assert!(field <= root_node.max_data.field() + 1e-3);
        }
    }

    #[test]
    fn test_propagation_idempotent() {
        let config = OccupancyConfig::default();
        let mut octree = TestOctree::new(16, 8).unwrap();
        let root = octree.root();
        octree.allocate_all_children(root);
        let blocks: Vec<BlockId> = octree.iter_blocks().collect();
        for &b in &blocks {
            saturate_block(octree.block_mut(b), -2.0, 3);
        }
        propagate_to_root(&mut octree, &config, &blocks, Vec::new(), 7, &mut None);
        let min_before = octree.node(root).min_data;
        let max_before = octree.node(root).max_data;
        // Same frame again: every reduction is guarded by the timestamp
        propagate_to_root(&mut octree, &config, &blocks, Vec::new(), 7, &mut None);
        assert_eq!(octree.node(root).min_data, min_before);
        assert_eq!(octree.node(root).max_data, max_before);
    }
}

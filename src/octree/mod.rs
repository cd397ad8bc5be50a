//! Sparse 8-way tree with mip-mapped voxel blocks at the leaves

pub mod block;
pub mod fetcher;
pub mod iterator;
pub mod node;
pub mod pool;
pub mod visitor;

pub use block::Block;
pub use node::Node;
pub use pool::{BlockId, MemoryPool, NodeId, OctantId};

use crate::core::error::Error;
use crate::core::types::{Frame, IVec3, Result, Scale};
use crate::map::data::{ColourData, FieldData, IdData, Voxel};
use crate::math::aabb::VoxelAabb;

/// The octree data structure containing the map data. It is the memory
/// manager of the map: the only entity able to allocate and deallocate nodes
/// and blocks. Reading is done through `visitor` and the iterators, frame
/// integration through the `integrator` module.
pub struct Octree<F: FieldData, C: ColourData = (), I: IdData = ()> {
    /// Edge length of the volume in voxels (power of two)
    size: i32,
    /// Edge length of a block in voxels (power of two)
    block_size: i32,
    pool: MemoryPool<F, C, I>,
    root: NodeId,
    /// Bounding box of the allocated leaves, in voxels
    aabb: VoxelAabb,
    init_data: Voxel<F, C, I>,
}

impl<F: FieldData, C: ColourData, I: IdData> Octree<F, C, I> {
    /// Create an octree with an edge length of at least `size` voxels. The
    /// actual edge length is the smallest power of two that is at least
    /// `size` and at least `2 * block_size`.
    pub fn new(size: i32, block_size: i32) -> Result<Self> {
        if size <= 0 {
            return Err(Error::Config(format!("octree size {} must be positive", size)));
        }
        if block_size <= 0 || !crate::math::is_power_of_two(block_size as u32) {
            return Err(Error::Config(format!(
                "block size {} must be a power of two",
                block_size
            )));
        }
        let min_size = (size.max(2 * block_size)) as u32;
        let size = min_size.next_power_of_two() as i32;

        let mut pool = MemoryPool::new();
        let root = pool.alloc_node(Node::root(size));
        log::debug!("Created {}^3 octree with {}^3 blocks", size, block_size);

        Ok(Self {
            size,
            block_size,
            pool,
            root,
            aabb: VoxelAabb::empty(),
            init_data: Voxel::default(),
        })
    }

    pub fn size(&self) -> i32 {
        self.size
    }

    pub fn block_size(&self) -> i32 {
        self.block_size
    }

    /// Scale of the root node
    pub fn max_scale(&self) -> Scale {
        crate::math::log2_pow2(self.size as u32) as Scale
    }

    /// Maximum scale of a block
    pub fn max_block_scale(&self) -> Scale {
        crate::math::log2_pow2(self.block_size as u32) as Scale
    }

    /// Tree depth at which blocks live
    pub fn block_depth(&self) -> i32 {
        self.max_scale() - self.max_block_scale()
    }

    /// Tree depth of an octant with the given edge length
    pub fn depth_of_size(&self, size: i32) -> i32 {
        self.max_scale() - crate::math::log2_pow2(size as u32) as Scale
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn contains(&self, voxel: IVec3) -> bool {
        voxel.x >= 0
            && voxel.y >= 0
            && voxel.z >= 0
            && voxel.x < self.size
            && voxel.y < self.size
            && voxel.z < self.size
    }

    pub fn aabb(&self) -> &VoxelAabb {
        &self.aabb
    }

    /// Extend the allocated-leaf AABB to contain the octant at `coord` with
    /// edge length `size`. Needed for leaf nodes allocated as observed free
    /// space, which the block allocation path cannot see.
    pub fn aabb_extend(&mut self, coord: IVec3, size: i32) {
        self.aabb.extend_octant(coord, size);
    }

    pub fn init_data(&self) -> &Voxel<F, C, I> {
        &self.init_data
    }

    pub fn pool(&self) -> &MemoryPool<F, C, I> {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut MemoryPool<F, C, I> {
        &mut self.pool
    }

    pub fn node(&self, id: NodeId) -> &Node<F> {
        self.pool.node(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node<F> {
        self.pool.node_mut(id)
    }

    pub fn block(&self, id: BlockId) -> &Block<F, C, I> {
        self.pool.block(id)
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block<F, C, I> {
        self.pool.block_mut(id)
    }

    /// Corner coordinates of an octant
    pub fn octant_coord(&self, id: OctantId) -> IVec3 {
        match id {
            OctantId::Node(n) => self.pool.node(n).coord,
            OctantId::Block(b) => self.pool.block(b).coord,
        }
    }

    /// Edge length of an octant in voxels
    pub fn octant_size(&self, id: OctantId) -> i32 {
        match id {
            OctantId::Node(n) => self.pool.node(n).size,
            OctantId::Block(b) => self.pool.block(b).size,
        }
    }

    /// Parent of an octant, `None` for the root
    pub fn octant_parent(&self, id: OctantId) -> Option<NodeId> {
        match id {
            OctantId::Node(n) => self.pool.node(n).parent,
            OctantId::Block(b) => Some(self.pool.block(b).parent),
        }
    }

    /// Last-update timestamp of an octant
    pub fn octant_timestamp(&self, id: OctantId) -> Frame {
        match id {
            OctantId::Node(n) => self.pool.node(n).timestamp,
            OctantId::Block(b) => self.pool.block(b).timestamp,
        }
    }

    /// Whether an octant has no children (blocks always do)
    pub fn octant_is_leaf(&self, id: OctantId) -> bool {
        match id {
            OctantId::Node(n) => self.pool.node(n).is_leaf(),
            OctantId::Block(_) => true,
        }
    }

    /// Allocate the child of `parent` with index `child_idx`, or fetch it if
    /// it already exists. Returns the child and whether it was created.
    pub fn allocate_child(&mut self, parent: NodeId, child_idx: usize) -> (OctantId, bool) {
        debug_assert!(child_idx < 8);
        if let Some(existing) = self.pool.node(parent).child(child_idx) {
            return (existing, false);
        }

        let (child_coord, child_size) = {
            let p = self.pool.node(parent);
            (p.child_coord(child_idx), p.size / 2)
        };

        let child = if child_size == self.block_size {
            let id = self
                .pool
                .alloc_block(Block::new(child_coord, child_size, parent, self.init_data));
            self.aabb.extend_octant(child_coord, child_size);
            OctantId::Block(id)
        } else {
            let parent_node = self.pool.node(parent);
            let node = Node::child_of(parent_node, parent, child_idx);
            OctantId::Node(self.pool.alloc_node(node))
        };

        self.pool.node_mut(parent).set_child(child_idx, Some(child));
        (child, true)
    }

    /// Allocate all eight children of `parent`
    pub fn allocate_all_children(&mut self, parent: NodeId) {
        for child_idx in 0..8 {
            self.allocate_child(parent, child_idx);
        }
    }

    /// Allocate the branch from the root down to the block containing
    /// `voxel`, or fetch it if it exists. `None` if outside the volume.
    pub fn allocate_block_at(&mut self, voxel: IVec3) -> Option<BlockId> {
        if !self.contains(voxel) {
            return None;
        }
        let mut current = self.root;
        loop {
            let child_idx = self.pool.node(current).child_idx_of(voxel);
            let (child, _) = self.allocate_child(current, child_idx);
            match child {
                OctantId::Block(b) => return Some(b),
                OctantId::Node(n) => current = n,
            }
        }
    }

    /// Recursively delete all children of `node`, making it a leaf
    pub fn delete_children(&mut self, node: NodeId) {
        for child_idx in 0..8 {
            if let Some(child) = self.pool.node(node).child(child_idx) {
                match child {
                    OctantId::Block(b) => self.pool.free_block(b),
                    OctantId::Node(n) => {
                        self.delete_children(n);
                        self.pool.free_node(n);
                    }
                }
                self.pool.node_mut(node).set_child(child_idx, None);
            }
        }
    }

    /// Collect every octant in the subtree under `node`, excluding the node
    /// itself.
    pub fn collect_subtree(&self, node: NodeId, out: &mut Vec<OctantId>) {
        for child_idx in 0..8 {
            if let Some(child) = self.pool.node(node).child(child_idx) {
                out.push(child);
                if let OctantId::Node(n) = child {
                    self.collect_subtree(n, out);
                }
            }
        }
    }
}

//! Leaf block with mip-mapped voxel data
//!
//! A block stores its voxels at every scale from `min_scale` (the finest it
//! has been integrated at) up to `max_scale` (a single voxel). Occupancy
//! blocks additionally keep per-scale min/max field stacks for conservative
//! queries, and a shadow buffer used to migrate the integration scale without
//! discarding the current data (see `switch_data`).
//!
//! Stack layout: index 0 is the coarsest scale, so `data[max_scale - s]` is
//! the array for scale `s`. The min/max stacks are one level shorter than the
//! mean stack; reads at the finest allocated scale answer from the mean data,
//! which realises the finest-scale aliasing of the original layout without
//! shared ownership.

use crate::core::types::{Frame, IVec3, Scale, SCALE_UNINIT};
use crate::map::data::{ColourData, FieldData, IdData, Voxel};
use crate::octree::pool::NodeId;

/// Number of integrations required into the buffer before a scale switch is
/// considered.
pub const SWITCH_MIN_INTEGR_COUNT: u32 = 20;

/// Required observation coverage of the buffer, in voxel-equivalents,
/// relative to the current scale before a scale switch happens.
pub const BUFFER_OBSERVED_DENSITY: f64 = 0.9;

fn cube(x: i32) -> usize {
    (x * x * x) as usize
}

enum BufferStorage<F: FieldData, C: ColourData, I: IdData> {
    None,
    /// Independent array, used when migrating to a finer scale
    Owned(Box<[Voxel<F, C, I>]>),
    /// Routes into the data stack at the buffer scale, used when migrating
    /// to a coarser scale
    Shared,
}

pub struct Block<F: FieldData, C: ColourData, I: IdData> {
    /// Minimum corner in voxels
    pub coord: IVec3,
    /// Edge length in voxels (the octree block size)
    pub size: i32,
    /// Parent node
    pub parent: NodeId,
    /// Frame of the last integration into this block
    pub timestamp: Frame,

    /// Mean data per scale, coarsest first
    data: Vec<Box<[Voxel<F, C, I>]>>,
    /// Min field data per scale, coarsest first, one level shorter than
    /// `data`
    min_data: Vec<Box<[F]>>,
    /// Max field data per scale, coarsest first, one level shorter than
    /// `data`
    max_data: Vec<Box<[F]>>,

    /// Scale of the last integration
    current_scale: Scale,
    /// Finest allocated scale, `SCALE_UNINIT` before the first integration
    min_scale: Scale,
    curr_integr_count: u32,
    curr_observed_count: u32,

    buffer: BufferStorage<F, C, I>,
    buffer_scale: Scale,
    buffer_integr_count: u32,
    buffer_observed_count: u32,

    init_data: Voxel<F, C, I>,
}

impl<F: FieldData, C: ColourData, I: IdData> Block<F, C, I> {
    /// Construct the child block of a node, starting as a single coarse voxel
    pub fn new(coord: IVec3, size: i32, parent: NodeId, init_data: Voxel<F, C, I>) -> Self {
        debug_assert!(crate::math::is_power_of_two(size as u32));
        let max_scale = crate::math::log2_pow2(size as u32) as Scale;
        Self {
            coord,
            size,
            parent,
            timestamp: 0,
            data: vec![vec![init_data; 1].into_boxed_slice()],
            min_data: Vec::new(),
            max_data: Vec::new(),
            current_scale: max_scale,
            min_scale: SCALE_UNINIT,
            curr_integr_count: 0,
            curr_observed_count: 0,
            buffer: BufferStorage::None,
            buffer_scale: SCALE_UNINIT,
            buffer_integr_count: 0,
            buffer_observed_count: 0,
            init_data,
        }
    }

    /// Coarsest scale of the block (`log2(size)`)
    pub fn max_scale(&self) -> Scale {
        crate::math::log2_pow2(self.size as u32) as Scale
    }

    pub fn current_scale(&self) -> Scale {
        self.current_scale
    }

    /// Move the integration scale within the allocated range
    pub fn set_current_scale(&mut self, scale: Scale) {
        debug_assert!(scale >= self.finest_alloc_scale() && scale <= self.max_scale());
        self.current_scale = scale;
    }

    pub fn min_scale(&self) -> Scale {
        self.min_scale
    }

    /// Finest scale with an allocated mean array
    pub fn finest_alloc_scale(&self) -> Scale {
        self.max_scale() - (self.data.len() as Scale - 1)
    }

    pub fn size_at_scale(&self, scale: Scale) -> i32 {
        self.size >> scale
    }

    pub fn num_voxels_at_scale(&self, scale: Scale) -> usize {
        cube(self.size_at_scale(scale))
    }

    pub fn init_data(&self) -> &Voxel<F, C, I> {
        &self.init_data
    }

    pub fn set_init_data(&mut self, init_data: Voxel<F, C, I>) {
        self.init_data = init_data;
    }

    /// Linear index of `coord` within the array at `scale`
    pub fn voxel_idx(&self, coord: IVec3, scale: Scale) -> usize {
        debug_assert!(scale >= 0 && scale <= self.max_scale());
        let ox = (coord.x - self.coord.x) >> scale;
        let oy = (coord.y - self.coord.y) >> scale;
        let oz = (coord.z - self.coord.z) >> scale;
        let s = self.size_at_scale(scale);
        (ox + oy * s + oz * s * s) as usize
    }

    /// Data at `scale`; the initial data if the scale is finer than anything
    /// allocated.
    pub fn data_at(&self, coord: IVec3, scale: Scale) -> &Voxel<F, C, I> {
        if scale < self.finest_alloc_scale() {
            &self.init_data
        } else {
            let k = (self.max_scale() - scale) as usize;
            &self.data[k][self.voxel_idx(coord, scale)]
        }
    }

    /// Data at the current integration scale
    pub fn data_current(&self, coord: IVec3) -> &Voxel<F, C, I> {
        self.data_at(coord, self.current_scale)
    }

    /// Data at `desired_scale` or the current scale, whichever is coarser.
    /// Returns the scale the data came from.
    pub fn data_fallup(&self, coord: IVec3, desired_scale: Scale) -> (&Voxel<F, C, I>, Scale) {
        let scale = desired_scale.max(self.current_scale);
        (self.data_at(coord, scale), scale)
    }

    /// Min field data at `scale`. Answers from the mean data at the finest
    /// allocated scale, from the initial data below it.
    pub fn min_data_at(&self, coord: IVec3, scale: Scale) -> F {
        let finest = self.finest_alloc_scale();
        if scale < finest {
            self.init_data.field
        } else if scale == finest {
            self.data_at(coord, scale).field
        } else {
            let k = (self.max_scale() - scale) as usize;
            self.min_data[k][self.voxel_idx(coord, scale)]
        }
    }

    /// Max field data at `scale`, analogous to `min_data_at`
    pub fn max_data_at(&self, coord: IVec3, scale: Scale) -> F {
        let finest = self.finest_alloc_scale();
        if scale < finest {
            self.init_data.field
        } else if scale == finest {
            self.data_at(coord, scale).field
        } else {
            let k = (self.max_scale() - scale) as usize;
            self.max_data[k][self.voxel_idx(coord, scale)]
        }
    }

    /// Mean data at the coarsest scale (the whole-block summary)
    pub fn data_coarsest(&self) -> &Voxel<F, C, I> {
        &self.data[0][0]
    }

    /// Min field data at the coarsest scale
    pub fn min_data_coarsest(&self) -> F {
        if self.min_data.is_empty() {
            self.data[0][0].field
        } else {
            self.min_data[0][0]
        }
    }

    /// Max field data at the coarsest scale
    pub fn max_data_coarsest(&self) -> F {
        if self.max_data.is_empty() {
            self.data[0][0].field
        } else {
            self.max_data[0][0]
        }
    }

    /// Mutable mean array at `scale`. The scale must be allocated.
    pub fn data_slice_at_scale_mut(&mut self, scale: Scale) -> &mut [Voxel<F, C, I>] {
        debug_assert!(scale >= self.finest_alloc_scale() && scale <= self.max_scale());
        let k = (self.max_scale() - scale) as usize;
        &mut self.data[k]
    }

    /// Mean array at `scale`, or `None` if finer than anything allocated
    pub fn data_slice_at_scale(&self, scale: Scale) -> Option<&[Voxel<F, C, I>]> {
        if scale < self.finest_alloc_scale() || scale > self.max_scale() {
            None
        } else {
            let k = (self.max_scale() - scale) as usize;
            Some(&self.data[k])
        }
    }

    /// Min field values at `scale` as an owned array. The finest allocated
    /// scale answers from the mean data.
    pub fn min_field_array_at_scale(&self, scale: Scale) -> Vec<F> {
        debug_assert!(scale >= self.finest_alloc_scale() && scale <= self.max_scale());
        let k = (self.max_scale() - scale) as usize;
        if scale == self.finest_alloc_scale() {
            self.data[k].iter().map(|v| v.field).collect()
        } else {
            self.min_data[k].to_vec()
        }
    }

    /// Max field values at `scale` as an owned array, analogous to
    /// `min_field_array_at_scale`
    pub fn max_field_array_at_scale(&self, scale: Scale) -> Vec<F> {
        debug_assert!(scale >= self.finest_alloc_scale() && scale <= self.max_scale());
        let k = (self.max_scale() - scale) as usize;
        if scale == self.finest_alloc_scale() {
            self.data[k].iter().map(|v| v.field).collect()
        } else {
            self.max_data[k].to_vec()
        }
    }

    /// Write the min/max field arrays at `scale`. Only valid for scales
    /// coarser than the finest allocated one (the finest aliases the mean).
    pub fn set_min_max_at_scale(&mut self, scale: Scale, min: Box<[F]>, max: Box<[F]>) {
        debug_assert!(scale > self.finest_alloc_scale() && scale <= self.max_scale());
        let k = (self.max_scale() - scale) as usize;
        self.min_data[k] = min;
        self.max_data[k] = max;
    }

    /// Allocate the mip-mapped scales down to `new_min_scale`
    pub fn allocate_down_to(&mut self, new_min_scale: Scale) {
        debug_assert!(new_min_scale >= 0 && new_min_scale <= self.max_scale());
        if new_min_scale >= self.current_scale {
            // Nothing to allocate, but a first integration at the coarsest
            // scale still marks the block as integrated into.
            if self.min_scale == SCALE_UNINIT {
                self.min_scale = self.current_scale;
            }
            return;
        }

        // New mean arrays for every scale finer than the current one.
        for scale in (new_min_scale..self.current_scale).rev() {
            let n = self.num_voxels_at_scale(scale);
            self.data
                .push(vec![self.init_data; n].into_boxed_slice());
        }
        // The min/max stacks cover every allocated scale except the finest:
        // seed the new interior scales with copies of the mean fields, the
        // next propagation pass overwrites them.
        for scale in (new_min_scale + 1..=self.current_scale).rev() {
            let k = (self.max_scale() - scale) as usize;
            let fields: Box<[F]> = self.data[k].iter().map(|v| v.field).collect();
            self.min_data.push(fields.clone());
            self.max_data.push(fields);
        }

        self.current_scale = new_min_scale;
        self.min_scale = new_min_scale;
    }

    /// Delete the mip-mapped scales up to `new_min_scale`, releasing the
    /// finer arrays.
    pub fn delete_up_to(&mut self, new_min_scale: Scale) {
        debug_assert!(new_min_scale >= 0 && new_min_scale <= self.max_scale());
        if self.min_scale == SCALE_UNINIT || new_min_scale <= self.min_scale {
            return;
        }

        let removed = (new_min_scale - self.min_scale) as usize;
        for _ in 0..removed {
            self.data.pop();
            // Keeps the min/max stacks one level shorter than the mean
            // stack; the new finest scale is again answered from the mean.
            self.min_data.pop();
            self.max_data.pop();
        }

        self.current_scale = new_min_scale;
        self.min_scale = new_min_scale;
    }

    pub fn curr_integr_count(&self) -> u32 {
        self.curr_integr_count
    }

    pub fn curr_observed_count(&self) -> u32 {
        self.curr_observed_count
    }

    pub fn incr_curr_integr_count(&mut self) {
        self.curr_integr_count += 1;
    }

    pub fn incr_curr_observed_count(&mut self, do_increment: bool) {
        if do_increment {
            self.curr_observed_count += 1;
        }
    }

    pub fn add_curr_observed_count(&mut self, count: u32) {
        self.curr_observed_count += count;
    }

    pub fn reset_curr_count(&mut self) {
        self.curr_integr_count = 0;
        self.curr_observed_count = 0;
    }

    /// Initialise the current counters after the first scale allocation.
    /// A block seeded from observed initial data counts as fully observed.
    pub fn init_curr_count(&mut self) {
        if self.init_data.field.observed() {
            self.curr_integr_count = self.init_data.field.weight();
            self.curr_observed_count = self.num_voxels_at_scale(self.current_scale) as u32;
        } else {
            self.reset_curr_count();
        }
    }

    pub fn buffer_scale(&self) -> Scale {
        self.buffer_scale
    }

    pub fn buffer_integr_count(&self) -> u32 {
        self.buffer_integr_count
    }

    pub fn buffer_observed_count(&self) -> u32 {
        self.buffer_observed_count
    }

    /// Whether the buffer routes into the data stack (coarser migration)
    pub fn buffer_is_shared(&self) -> bool {
        matches!(self.buffer, BufferStorage::Shared)
    }

    /// Scale-normalised observation coverage criterion shared by the buffer
    /// count gating and `switch_data`.
    fn buffer_observed_dense_enough(&self) -> bool {
        if self.buffer_scale == SCALE_UNINIT {
            return false;
        }
        let buffer_equiv =
            self.buffer_observed_count as u64 * cube(1 << self.buffer_scale) as u64;
        let curr_equiv =
            self.curr_observed_count as u64 * cube(1 << self.current_scale) as u64;
        buffer_equiv as f64 >= BUFFER_OBSERVED_DENSITY * curr_equiv as f64
    }

    /// Increment the buffer integration count if `do_increment` or the
    /// observation-coverage criterion is met.
    pub fn incr_buffer_integr_count(&mut self, do_increment: bool) {
        if do_increment || self.buffer_observed_dense_enough() {
            self.buffer_integr_count += 1;
        }
    }

    pub fn incr_buffer_observed_count(&mut self, do_increment: bool) {
        if do_increment {
            self.buffer_observed_count += 1;
        }
    }

    pub fn add_buffer_observed_count(&mut self, count: u32) {
        self.buffer_observed_count += count;
    }

    pub fn reset_buffer_count(&mut self) {
        self.buffer_integr_count = 0;
        self.buffer_observed_count = 0;
    }

    /// Reset buffer variables to the initial values and release the buffer
    /// data if it was independently allocated.
    pub fn reset_buffer(&mut self) {
        self.buffer = BufferStorage::None;
        self.buffer_scale = SCALE_UNINIT;
        self.reset_buffer_count();
    }

    /// Initialise the buffer at `buffer_scale`. A buffer finer than the
    /// current scale gets a fresh array (to be seeded by the caller); a
    /// coarser one shares the data stack at that scale.
    pub fn init_buffer(&mut self, buffer_scale: Scale) {
        debug_assert!(buffer_scale >= 0 && buffer_scale <= self.max_scale());
        self.reset_buffer();
        self.buffer_scale = buffer_scale;
        if buffer_scale < self.current_scale {
            let n = self.num_voxels_at_scale(buffer_scale);
            self.buffer = BufferStorage::Owned(vec![self.init_data; n].into_boxed_slice());
        } else {
            self.buffer = BufferStorage::Shared;
        }
    }

    /// Mutable view of the buffer voxels
    pub fn buffer_slice_mut(&mut self) -> &mut [Voxel<F, C, I>] {
        let k = (self.max_scale() - self.buffer_scale) as usize;
        match &mut self.buffer {
            BufferStorage::Owned(arr) => arr,
            BufferStorage::Shared => &mut self.data[k],
            BufferStorage::None => panic!("buffer access without init_buffer"),
        }
    }

    /// Check the switch criterion and migrate the block to the buffer scale
    /// if it is met. Returns true if the data was switched.
    pub fn switch_data(&mut self) -> bool {
        if self.buffer_integr_count < SWITCH_MIN_INTEGR_COUNT
            || !self.buffer_observed_dense_enough()
        {
            return false;
        }

        if self.buffer_scale < self.current_scale {
            // Switch to the finer scale: the buffer becomes the new finest
            // mean array. The previously-finest scale needs real min/max
            // arrays now; seed them from its mean, propagation overwrites
            // them.
            let owned = match std::mem::replace(&mut self.buffer, BufferStorage::None) {
                BufferStorage::Owned(arr) => arr,
                _ => unreachable!("finer buffer must own its storage"),
            };
            let prev_finest = self.data.len() - 1;
            let fields: Box<[F]> = self.data[prev_finest].iter().map(|v| v.field).collect();
            self.min_data.push(fields.clone());
            self.max_data.push(fields);
            self.data.push(owned);
            self.current_scale = self.buffer_scale;
            self.min_scale = self.buffer_scale;
        } else {
            // Switch to the coarser scale: the shared buffer already lives in
            // the data stack, release everything finer.
            self.delete_up_to(self.buffer_scale);
        }

        // A migrating voxel may have inherited unobserved state from its
        // parent but has since been integrated; fix up the observed bits.
        let k = (self.max_scale() - self.current_scale) as usize;
        let mut missed = 0u32;
        for v in self.data[k].iter_mut() {
            if v.field.valid() && !v.field.observed() {
                v.field.set_observed(true);
                missed += 1;
            }
        }
        self.buffer_observed_count += missed;

        self.curr_integr_count = self.buffer_integr_count;
        self.curr_observed_count = self.buffer_observed_count;
        self.buffer = BufferStorage::None;
        self.buffer_scale = SCALE_UNINIT;
        self.reset_buffer_count();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::data::{OccupancyConfig, OccupancyField, OccupancyVoxel};

    fn test_block() -> Block<OccupancyField, (), ()> {
        Block::new(IVec3::ZERO, 8, NodeId(0), OccupancyVoxel::default())
    }

    #[test]
    fn test_fresh_block_state() {
        let block = test_block();
        assert_eq!(block.max_scale(), 3);
        assert_eq!(block.current_scale(), 3);
        assert_eq!(block.min_scale(), SCALE_UNINIT);
        assert_eq!(block.finest_alloc_scale(), 3);
        assert!(!block.data_coarsest().field.valid());
    }

    #[test]
    fn test_allocate_down_to_invariants() {
        let mut block = test_block();
        block.allocate_down_to(1);
        assert_eq!(block.current_scale(), 1);
        assert_eq!(block.min_scale(), 1);
        assert_eq!(block.finest_alloc_scale(), 1);
        // data covers scales 1..=3, min/max cover 2..=3
        assert_eq!(block.data.len(), 3);
        assert_eq!(block.min_data.len(), 2);
        assert_eq!(block.max_data.len(), 2);
        assert_eq!(block.num_voxels_at_scale(1), 64);
    }

    #[test]
    fn test_data_below_min_scale_returns_init() {
        let mut block = test_block();
        block.allocate_down_to(2);
        // Scale 0 was never allocated
        let v = block.data_at(IVec3::new(3, 3, 3), 0);
        assert_eq!(*v, OccupancyVoxel::default());
    }

    #[test]
    fn test_voxel_idx() {
        let mut block = test_block();
        block.allocate_down_to(0);
        assert_eq!(block.voxel_idx(IVec3::new(1, 0, 0), 0), 1);
        assert_eq!(block.voxel_idx(IVec3::new(0, 1, 0), 0), 8);
        assert_eq!(block.voxel_idx(IVec3::new(0, 0, 1), 0), 64);
        // At scale 1 the voxels are 2 wide
        assert_eq!(block.voxel_idx(IVec3::new(2, 0, 0), 1), 1);
        assert_eq!(block.voxel_idx(IVec3::new(3, 0, 0), 1), 1);
    }

    #[test]
    fn test_delete_up_to() {
        let mut block = test_block();
        block.allocate_down_to(0);
        block.delete_up_to(2);
        assert_eq!(block.current_scale(), 2);
        assert_eq!(block.min_scale(), 2);
        assert_eq!(block.data.len(), 2);
        assert_eq!(block.min_data.len(), 1);
        // The freed scale now answers with the initial data
        assert_eq!(*block.data_at(IVec3::ZERO, 0), OccupancyVoxel::default());
    }

    #[test]
    fn test_fallup() {
        let mut block = test_block();
        block.allocate_down_to(1);
        let (_, scale) = block.data_fallup(IVec3::ZERO, 0);
        assert_eq!(scale, 1);
        let (_, scale) = block.data_fallup(IVec3::ZERO, 3);
        assert_eq!(scale, 3);
    }

    #[test]
    fn test_switch_data_hysteresis() {
        let config = OccupancyConfig::default();
        let mut block = test_block();
        // Fresh integration at scale 1
        block.allocate_down_to(1);
        for v in block.data_slice_at_scale_mut(1) {
            v.field.update(config.log_odd_min, &config);
        }
        block.curr_observed_count = block.num_voxels_at_scale(1) as u32;
        block.curr_integr_count = 1;

        // Recommend scale 2: integrate into the shared buffer 19 times, no
        // switch yet.
        block.init_buffer(2);
        assert!(block.buffer_is_shared());
        for frame in 0..19 {
            let n = block.num_voxels_at_scale(2);
            for idx in 0..n {
                let v = &mut block.buffer_slice_mut()[idx];
                let newly = v.field.update(config.log_odd_min, &config);
                block.incr_buffer_observed_count(newly);
            }
            block.incr_buffer_integr_count(true);
            assert!(!block.switch_data(), "switched too early at frame {}", frame);
        }
        // 20th integration crosses the threshold
        block.incr_buffer_integr_count(true);
        assert!(block.switch_data());
        assert_eq!(block.current_scale(), 2);
        assert_eq!(block.min_scale(), 2);
        assert_eq!(block.buffer_scale(), SCALE_UNINIT);
    }

    #[test]
    fn test_switch_to_finer_extends_stacks() {
        let config = OccupancyConfig::default();
        let mut block = test_block();
        block.allocate_down_to(2);
        for v in block.data_slice_at_scale_mut(2) {
            v.field.update(config.log_odd_min, &config);
        }
        block.curr_observed_count = block.num_voxels_at_scale(2) as u32;

        block.init_buffer(1);
        assert!(!block.buffer_is_shared());
        let n = block.num_voxels_at_scale(1);
        for _ in 0..SWITCH_MIN_INTEGR_COUNT {
            for idx in 0..n {
                let v = &mut block.buffer_slice_mut()[idx];
                let newly = v.field.update(config.log_odd_min, &config);
                block.incr_buffer_observed_count(newly);
            }
            block.incr_buffer_integr_count(true);
        }
        assert!(block.switch_data());
        assert_eq!(block.current_scale(), 1);
        assert_eq!(block.finest_alloc_scale(), 1);
        assert_eq!(block.data.len(), 3);
        assert_eq!(block.min_data.len(), 2);
        assert!(block.data_at(IVec3::ZERO, 1).field.valid());
    }
}

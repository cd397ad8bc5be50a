//! Multi-resolution occupancy updater
//!
//! Consumes the carver's allocation lists: free nodes are updated wholesale,
//! blocks are fused per voxel at a scale chosen from the sensor model with
//! +-1 hysteresis per frame. A pending scale change is integrated into the
//! block's shadow buffer until the switch criterion is met.

use crate::core::types::{Affine3A, Frame, Result, Scale, Vec3, SCALE_UNINIT};
use crate::image::{round_pixel, Image, Rgb};
use crate::integrator::carver::{CarverAllocation, VarianceState};
use crate::integrator::propagation;
use crate::integrator::Measurements;
use crate::map::data::{
    compute_tau, ColourData, FieldData, IdData, OccupancyConfig, OccupancyField, Voxel,
};
use crate::map::Map;
use crate::octree::block::Block;
use crate::octree::pool::{BlockId, NodeId, OctantId};
use crate::sensor::{ProjectionStatus, SensorModel};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};

/// Work item for the data-parallel block pass
#[derive(Clone, Copy)]
enum BlockWork {
    /// Projective fusion; `low_variance` selects the free-space-only path
    Fuse {
        low_variance: bool,
        projects_inside: bool,
    },
    /// Wholesale free-space update without projection, for blocks reached
    /// through a freed node
    Free,
}

/// Shared per-frame context for the block pass
struct UpdateContext<'a, S: SensorModel> {
    sensor: &'a S,
    depth: &'a Image<f32>,
    sigma: &'a Image<f32>,
    colour: Option<ColourContext<'a, S>>,
    id: Option<&'a Image<u16>>,
    t_sw: Affine3A,
    res: f32,
    origin: Vec3,
    tau_min: f32,
    tau_max: f32,
    config: &'a OccupancyConfig,
}

struct ColourContext<'a, S: SensorModel> {
    image: &'a Image<Rgb>,
    sensor: &'a S,
    /// Depth-sensor frame to colour-sensor frame
    t_ccc: Affine3A,
}

/// Free-space update of a single voxel. Returns whether the voxel was newly
/// observed.
fn free_voxel<C: ColourData, I: IdData>(
    v: &mut Voxel<OccupancyField, C, I>,
    config: &OccupancyConfig,
) -> bool {
    // Colour and id are never updated in free space.
    v.field.update(config.log_odd_min, config)
}

/// Occupancy update of a voxel at signed distance `range_diff` behind the
/// measured surface. Returns (newly observed, field updated).
fn update_voxel<C: ColourData, I: IdData>(
    v: &mut Voxel<OccupancyField, C, I>,
    range_diff: f32,
    tau: f32,
    three_sigma: f32,
    config: &OccupancyConfig,
) -> (bool, bool) {
    let log_odd_update = if range_diff < -three_sigma {
        // Well in front of the surface: free
        config.log_odd_min
    } else if range_diff.abs() <= tau / 2.0 {
        // Inside the surface band: occupied
        config.log_odd_max
    } else if range_diff < -tau / 2.0 {
        // Ramp between free and occupied across the uncertain band
        let span = (three_sigma - tau / 2.0).max(f32::EPSILON);
        let t = (range_diff + three_sigma) / span;
        (config.log_odd_min + t * (config.log_odd_max - config.log_odd_min))
            .clamp(config.log_odd_min, config.log_odd_max)
    } else {
        // Behind the surface band: occluded, nothing to say
        return (false, false);
    };
    (v.field.update(log_odd_update, config), true)
}

/// Fusion target within a block
#[derive(Clone, Copy, PartialEq, Eq)]
enum Target {
    Current,
    Buffer,
}

/// Integrate the frame into one block at `scale`. `free_space` applies the
/// free update to every voxel that projects into a valid measurement;
/// `wholesale` skips projection entirely.
#[allow(clippy::too_many_arguments)]
fn fuse_block_at_scale<C: ColourData, I: IdData, S: SensorModel>(
    block: &mut Block<OccupancyField, C, I>,
    ctx: &UpdateContext<'_, S>,
    scale: Scale,
    target: Target,
    free_space: bool,
    wholesale: bool,
    projects_inside: bool,
) {
    let coord = block.coord;
    let size_at_scale = block.size_at_scale(scale) as usize;
    let stride = 1 << scale;

    let centre_w = ctx.origin + ctx.res * (coord.as_vec3() + Vec3::splat(block.size as f32 * 0.5));
    let centre_s = ctx.t_sw.transform_point3(centre_w);
    let tau = compute_tau(
        ctx.sensor.measurement_from_point(centre_s),
        ctx.tau_min,
        ctx.tau_max,
        ctx.config,
    );

    // Sample points sit at voxel centres; walk them with the rotated stride
    // vectors instead of re-transforming every point.
    let base_w = ctx.origin + ctx.res * (coord.as_vec3() + Vec3::splat(0.5 * stride as f32));
    let base_s = ctx.t_sw.transform_point3(base_w);
    let step = ctx.res * stride as f32;
    let dx = Vec3::from(ctx.t_sw.matrix3.x_axis) * step;
    let dy = Vec3::from(ctx.t_sw.matrix3.y_axis) * step;
    let dz = Vec3::from(ctx.t_sw.matrix3.z_axis) * step;

    let near_plane = ctx.sensor.near_plane();
    let far_plane = ctx.sensor.far_plane();
    let config = ctx.config;

    let mut newly_observed = 0u32;
    {
        let slice = match target {
            Target::Current => block.data_slice_at_scale_mut(scale),
            Target::Buffer => block.buffer_slice_mut(),
        };

        for z in 0..size_at_scale {
            for y in 0..size_at_scale {
                for x in 0..size_at_scale {
                    let idx = x + y * size_at_scale + z * size_at_scale * size_at_scale;

                    if wholesale {
                        newly_observed += free_voxel(&mut slice[idx], config) as u32;
                        continue;
                    }

                    let p_s = base_s + dx * x as f32 + dy * y as f32 + dz * z as f32;
                    let (pixel, status) = ctx.sensor.project(p_s);
                    if status != ProjectionStatus::Ok {
                        continue;
                    }
                    let pix = round_pixel(pixel);
                    // Rounding can leave the image on the wrap seam
                    if !ctx.depth.in_bounds(pix.x, pix.y) {
                        continue;
                    }
                    let depth = *ctx.depth.get(pix.x as u32, pix.y as u32);
                    if !(depth >= near_plane) {
                        continue;
                    }
                    let three_sigma = 3.0 * ctx.sigma.get(pix.x as u32, pix.y as u32);

                    if free_space {
                        newly_observed += free_voxel(&mut slice[idx], config) as u32;
                        continue;
                    }

                    let measurement = ctx.sensor.measurement_from_point(p_s);
                    let range = p_s.length();
                    let range_diff = (measurement - depth) * (range / measurement);
                    let (newly, field_updated) =
                        update_voxel(&mut slice[idx], range_diff, tau, three_sigma, config);
                    newly_observed += newly as u32;

                    // Colour and id come from the same depth hit; never
                    // beyond the far plane.
                    if !field_updated || depth > far_plane {
                        continue;
                    }
                    if let Some(colour) = &ctx.colour {
                        let hit_c = ctx.sensor.back_project(pixel) * depth;
                        let hit_cc = colour.t_ccc.transform_point3(hit_c);
                        let (cpixel, cstatus) = colour.sensor.project(hit_cc);
                        if cstatus == ProjectionStatus::Ok {
                            let cpix = round_pixel(cpixel);
                            if colour.image.in_bounds(cpix.x, cpix.y) {
                                slice[idx].colour.update(
                                    *colour.image.get(cpix.x as u32, cpix.y as u32),
                                    config.max_weight,
                                );
                            }
                        }
                    }
                    if let Some(id_img) = ctx.id {
                        slice[idx].id.update(*id_img.get(pix.x as u32, pix.y as u32));
                    }
                }
            }
        }
    }

    match target {
        Target::Current => {
            block.add_curr_observed_count(newly_observed);
            block.incr_curr_integr_count();
        }
        Target::Buffer => {
            block.add_buffer_observed_count(newly_observed);
            block.incr_buffer_integr_count(wholesale || projects_inside);
        }
    }
}

/// Fuse one frame into one block: scale selection with hysteresis, buffer
/// integration when a scale change is pending, then steady integration.
fn update_block<C: ColourData, I: IdData, S: SensorModel>(
    block: &mut Block<OccupancyField, C, I>,
    ctx: &UpdateContext<'_, S>,
    work: BlockWork,
) {
    let (free_space, wholesale, projects_inside) = match work {
        BlockWork::Fuse {
            low_variance,
            projects_inside,
        } => (low_variance, false, projects_inside),
        BlockWork::Free => (true, true, false),
    };

    let centre_w =
        ctx.origin + ctx.res * (block.coord.as_vec3() + Vec3::splat(block.size as f32 * 0.5));
    let centre_s = ctx.t_sw.transform_point3(centre_w);

    // Scale selection with +-1 hysteresis around the last integration scale
    let fresh = block.min_scale() == SCALE_UNINIT;
    let last_scale = if fresh { 0 } else { block.current_scale() };
    let computed_scale = ctx.sensor.integration_scale(
        centre_s,
        ctx.res,
        last_scale,
        block.min_scale(),
        block.max_scale(),
    );
    let deeply_free = fresh
        || block.max_data_coarsest().occupancy < 0.95 * ctx.config.log_odd_min;
    let min_allowed = if free_space && deeply_free {
        ctx.config.fs_integr_scale
    } else {
        (last_scale - 1).max(0)
    };
    let max_allowed = if fresh {
        block.max_scale()
    } else {
        (last_scale + 1).min(block.max_scale())
    };
    let recommended_scale = computed_scale.max(min_allowed).min(max_allowed);

    let mut integration_scale = last_scale;

    if fresh {
        integration_scale = recommended_scale;
        block.allocate_down_to(recommended_scale);
        block.init_curr_count();
        block.set_init_data(Voxel::default());
        block.reset_buffer();
    } else if recommended_scale != last_scale {
        if block.buffer_scale() != recommended_scale {
            block.init_buffer(recommended_scale);
            if recommended_scale < last_scale {
                // Seed the finer buffer from the parent scale; observation
                // counting restarts from scratch.
                let parent: Vec<Voxel<OccupancyField, C, I>> = block
                    .data_slice_at_scale(last_scale)
                    .expect("current scale is allocated")
                    .to_vec();
                let parent_size = block.size_at_scale(last_scale) as usize;
                let buffer_size = parent_size * 2;
                let buffer = block.buffer_slice_mut();
                for z in 0..parent_size {
                    for y in 0..parent_size {
                        for x in 0..parent_size {
                            let p = parent[x + y * parent_size + z * parent_size * parent_size];
                            for k in 0..2 {
                                for j in 0..2 {
                                    for i in 0..2 {
                                        let idx = (2 * x + i)
                                            + (2 * y + j) * buffer_size
                                            + (2 * z + k) * buffer_size * buffer_size;
                                        let mut seeded = p;
                                        seeded.field.set_observed(false);
                                        buffer[idx] = seeded;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        fuse_block_at_scale(
            block,
            ctx,
            recommended_scale,
            Target::Buffer,
            free_space,
            wholesale,
            projects_inside,
        );
        if block.switch_data() {
            // The buffer became the current data, the frame is consumed
            return;
        }
        // Not switched yet: also integrate into the current data below
    } else {
        block.reset_buffer();
    }

    fuse_block_at_scale(
        block,
        ctx,
        integration_scale,
        Target::Current,
        free_space,
        wholesale,
        projects_inside,
    );
}

/// Run the updater over a carve result. Returns the set of octants whose
/// data may have changed if requested.
pub fn update<C: ColourData, I: IdData, S: SensorModel>(
    map: &mut Map<OccupancyField, C, I>,
    sensor: &S,
    measurements: &Measurements<'_, S>,
    allocation: &CarverAllocation,
    frame: Frame,
    mut touched: Option<&mut HashSet<OctantId>>,
) -> Result<()> {
    let config = map.data_config().clone();
    let res = map.res();
    let origin = map.origin();
    let t_sw = measurements.t_ws.inverse();

    let ctx = UpdateContext {
        sensor,
        depth: measurements.depth,
        sigma: measurements.depth_sigma,
        colour: measurements.colour.as_ref().map(|c| ColourContext {
            image: c.image,
            sensor: c.sensor,
            t_ccc: c.t_wc.inverse() * measurements.t_ws,
        }),
        id: measurements.id,
        t_sw,
        res,
        origin,
        tau_min: config.tau_min_factor * res,
        tau_max: config.tau_max_factor * res,
        config: &config,
    };

    // Descend the freed nodes: leaf nodes get their data freed directly,
    // interior ones hand their blocks to the parallel block pass.
    let mut free_leaf_nodes: Vec<NodeId> = Vec::new();
    let mut freed_blocks: Vec<BlockId> = Vec::new();
    let mut stack: Vec<NodeId> = allocation.node_list.clone();
    while let Some(n) = stack.pop() {
        if map.octree().node(n).is_leaf() {
            free_leaf_nodes.push(n);
            continue;
        }
        for child_idx in 0..8 {
            match map.octree().node(n).child(child_idx) {
                Some(OctantId::Block(b)) => freed_blocks.push(b),
                Some(OctantId::Node(child)) => stack.push(child),
                None => {}
            }
        }
    }

    let mut propagation_seeds: Vec<(i32, NodeId)> = Vec::new();
    for &n in &free_leaf_nodes {
        let (parent, size) = {
            let node = map.octree_mut().node_mut(n);
            let mut data = if node.is_leaf() && node.max_data.observed {
                node.max_data
            } else {
                OccupancyField::default()
            };
            data.update(config.log_odd_min, &config);
            node.min_data = data;
            node.max_data = data;
            (node.parent, node.size)
        };
        if let Some(parent) = parent {
            let depth = map.octree().depth_of_size(size);
            propagation_seeds.push((depth - 1, parent));
        }
    }

    // One work item per block touched this frame; every block is owned by
    // exactly one worker.
    let mut work: HashMap<u32, BlockWork> = HashMap::new();
    for (i, &b) in allocation.block_list.iter().enumerate() {
        work.insert(
            b.0,
            BlockWork::Fuse {
                low_variance: allocation.variance_state_list[i] == VarianceState::Constant,
                projects_inside: allocation.projects_inside_list[i],
            },
        );
    }
    for &b in &freed_blocks {
        work.insert(b.0, BlockWork::Free);
    }

    map.octree_mut()
        .pool_mut()
        .block_slab_mut()
        .par_iter_mut()
        .enumerate()
        .for_each(|(idx, slot)| {
            let Some(item) = work.get(&(idx as u32)) else {
                return;
            };
            let Some(block) = slot.as_mut() else {
                return;
            };
            block.timestamp = frame;
            update_block(block, &ctx, *item);
        });

    // Record all potentially updated octants before propagation may prune
    // them away.
    if let Some(touched) = touched.as_deref_mut() {
        for &b in allocation.block_list.iter().chain(freed_blocks.iter()) {
            touched.insert(OctantId::Block(b));
        }
        for &n in &free_leaf_nodes {
            touched.insert(OctantId::Node(n));
        }
    }

    let mut propagated_blocks: Vec<BlockId> = Vec::with_capacity(
        allocation.block_list.len() + freed_blocks.len(),
    );
    propagated_blocks.extend_from_slice(&allocation.block_list);
    propagated_blocks.extend_from_slice(&freed_blocks);

    propagation::propagate_to_root(
        map.octree_mut(),
        &config,
        &propagated_blocks,
        propagation_seeds,
        frame,
        &mut touched,
    );

    log::debug!(
        "Updated {} blocks ({} freed wholesale), {} free leaf nodes",
        propagated_blocks.len(),
        freed_blocks.len(),
        free_leaf_nodes.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_voxel_branches() {
        let config = OccupancyConfig::default();
        let tau = 0.4;
        let three_sigma = 0.9;

        // Free in front of the surface
        let mut v: Voxel<OccupancyField> = Voxel::default();
        let (newly, updated) = update_voxel(&mut v, -2.0, tau, three_sigma, &config);
        assert!(newly && updated);
        assert!(v.field.field() < 0.0);

        // Occupied inside the band
        let mut v: Voxel<OccupancyField> = Voxel::default();
        let (_, updated) = update_voxel(&mut v, 0.1, tau, three_sigma, &config);
        assert!(updated);
        assert!(v.field.field() > 0.0);

        // Occluded behind the band: untouched
        let mut v: Voxel<OccupancyField> = Voxel::default();
        let (newly, updated) = update_voxel(&mut v, 1.0, tau, three_sigma, &config);
        assert!(!newly && !updated);
        assert!(!v.field.valid());

        // Ramp region lies between the free and occupied updates
        let mut v: Voxel<OccupancyField> = Voxel::default();
        let (_, updated) = update_voxel(&mut v, -0.5, tau, three_sigma, &config);
        assert!(updated);
        assert!(v.field.occupancy > config.log_odd_min);
        assert!(v.field.occupancy < config.log_odd_max);
    }

    #[test]
    fn test_free_voxel_never_touches_colour() {
        use crate::map::data::ColourRecord;
        let config = OccupancyConfig::default();
        let mut v: Voxel<OccupancyField, ColourRecord> = Voxel::default();
        free_voxel(&mut v, &config);
        assert!(v.field.valid());
        assert_eq!(v.colour.rgb(), None);
    }
}

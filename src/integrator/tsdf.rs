//! Projective TSDF fusion
//!
//! The TSDF path has no carver: each depth pixel's ray allocates the blocks
//! inside the truncation band around its measurement, then every allocated
//! block is fused projectively at the sensor-recommended scale. Nodes carry
//! no data and nothing is pruned; confidence only ever grows.

use crate::core::error::Error;
use crate::core::types::{Frame, Result, Scale, Vec2, Vec3, SCALE_UNINIT};
use crate::image::{round_pixel, Image};
use crate::integrator::propagation::propagate_block_to_coarsest_scale;
use crate::integrator::Measurements;
use crate::map::data::{ColourData, IdData, TsdfField};
use crate::map::Map;
use crate::octree::block::Block;
use crate::octree::pool::BlockId;
use crate::sensor::{ProjectionStatus, SensorModel};
use rayon::prelude::*;
use std::collections::HashSet;

/// Integrate one depth frame into a TSDF map
pub fn integrate<C: ColourData, I: IdData, S: SensorModel>(
    map: &mut Map<TsdfField, C, I>,
    sensor: &S,
    measurements: &Measurements<'_, S>,
    frame: Frame,
) -> Result<()> {
    let depth_img = measurements.depth;
    if depth_img.width() != sensor.width() || depth_img.height() != sensor.height() {
        return Err(Error::Config(format!(
            "depth image {}x{} does not match the sensor model {}x{}",
            depth_img.width(),
            depth_img.height(),
            sensor.width(),
            sensor.height()
        )));
    }

    let config = map.data_config().clone();
    let res = map.res();
    let origin = map.origin();
    let band = config.truncation_boundary_factor * res;
    let t_ws = measurements.t_ws;
    let t_sw = t_ws.inverse();
    let near_plane = sensor.near_plane();
    let far_plane = sensor.far_plane();

    // Band allocation: walk each measured ray through [d - band, d + band]
    // at half-block steps and allocate the traversed blocks.
    let step = 0.5 * map.octree().block_size() as f32 * res;
    let mut blocks: HashSet<BlockId> = HashSet::new();
    for y in 0..depth_img.height() {
        for x in 0..depth_img.width() {
            let depth = *depth_img.get(x, y);
            if !(depth >= near_plane) || depth > far_plane {
                continue;
            }
            let ray_s = sensor.back_project(Vec2::new(x as f32, y as f32));
            let mut m = (depth - band).max(near_plane);
            let end = depth + band;
            loop {
                let p_w = t_ws.transform_point3(ray_s * m);
                if let Ok(voxel) = map.point_to_voxel(p_w) {
                    if let Some(b) = map.octree_mut().allocate_block_at(voxel) {
                        blocks.insert(b);
                    }
                }
                if m >= end {
                    break;
                }
                m = (m + step).min(end);
            }
        }
    }

    let mut block_list: Vec<BlockId> = blocks.into_iter().collect();
    block_list.sort();

    // Per-block fusion, one worker per block
    let work: HashSet<u32> = block_list.iter().map(|b| b.0).collect();
    let sigma_img = measurements.depth_sigma;
    map.octree_mut()
        .pool_mut()
        .block_slab_mut()
        .par_iter_mut()
        .enumerate()
        .for_each(|(idx, slot)| {
            if !work.contains(&(idx as u32)) {
                return;
            }
            let Some(block) = slot.as_mut() else {
                return;
            };
            block.timestamp = frame;
            fuse_block(
                block, sensor, depth_img, sigma_img, measurements, &config, t_sw, res, origin,
                band,
            );
            propagate_block_to_coarsest_scale(block);
        });

    log::debug!("TSDF fused {} blocks", block_list.len());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn fuse_block<C: ColourData, I: IdData, S: SensorModel>(
    block: &mut Block<TsdfField, C, I>,
    sensor: &S,
    depth_img: &Image<f32>,
    _sigma_img: &Image<f32>,
    measurements: &Measurements<'_, S>,
    config: &crate::map::data::TsdfConfig,
    t_sw: crate::core::types::Affine3A,
    res: f32,
    origin: Vec3,
    band: f32,
) {
    let centre_w = origin + res * (block.coord.as_vec3() + Vec3::splat(block.size as f32 * 0.5));
    let centre_s = t_sw.transform_point3(centre_w);

    // Scale selection: the sensor picks, clamped to +-1 around the last
    // integration like the occupancy path.
    let fresh = block.min_scale() == SCALE_UNINIT;
    let last_scale = if fresh { 0 } else { block.current_scale() };
    let computed = sensor.integration_scale(
        centre_s,
        res,
        last_scale,
        block.min_scale(),
        block.max_scale(),
    );
    let scale: Scale = if fresh {
        computed.clamp(0, block.max_scale())
    } else {
        computed
            .max((last_scale - 1).max(0))
            .min((last_scale + 1).min(block.max_scale()))
    };
    block.allocate_down_to(scale);
    block.set_current_scale(scale);

    let coord = block.coord;
    let size_at_scale = block.size_at_scale(scale) as usize;
    let stride = 1 << scale;
    let base_w = origin + res * (coord.as_vec3() + Vec3::splat(0.5 * stride as f32));
    let base_s = t_sw.transform_point3(base_w);
    let step = res * stride as f32;
    let dx = Vec3::from(t_sw.matrix3.x_axis) * step;
    let dy = Vec3::from(t_sw.matrix3.y_axis) * step;
    let dz = Vec3::from(t_sw.matrix3.z_axis) * step;
    let near_plane = sensor.near_plane();
    let far_plane = sensor.far_plane();

    let colour = measurements.colour.as_ref().map(|c| {
        (c.image, c.sensor, c.t_wc.inverse() * measurements.t_ws)
    });

    let slice = block.data_slice_at_scale_mut(scale);
    for z in 0..size_at_scale {
        for y in 0..size_at_scale {
            for x in 0..size_at_scale {
                let idx = x + y * size_at_scale + z * size_at_scale * size_at_scale;
                let p_s = base_s + dx * x as f32 + dy * y as f32 + dz * z as f32;
                let (pixel, status) = sensor.project(p_s);
                if status != ProjectionStatus::Ok {
                    continue;
                }
                let pix = round_pixel(pixel);
                if !depth_img.in_bounds(pix.x, pix.y) {
                    continue;
                }
                let depth = *depth_img.get(pix.x as u32, pix.y as u32);
                if !(depth >= near_plane) || depth > far_plane {
                    continue;
                }

                let measurement = sensor.measurement_from_point(p_s);
                let range = p_s.length();
                // Positive in front of the surface
                let sdf = (depth - measurement) * (range / measurement);
                if sdf < -band {
                    // Occluded
                    continue;
                }
                let value = (sdf / band).clamp(-1.0, 1.0);
                slice[idx].field.update(value, config);

                if sdf.abs() < band {
                    if let Some((image, csensor, t_ccc)) = &colour {
                        let hit_c = sensor.back_project(pixel) * depth;
                        let (cpixel, cstatus) = csensor.project(t_ccc.transform_point3(hit_c));
                        if cstatus == ProjectionStatus::Ok {
                            let cpix = round_pixel(cpixel);
                            if image.in_bounds(cpix.x, cpix.y) {
                                slice[idx].colour.update(
                                    *image.get(cpix.x as u32, cpix.y as u32),
                                    config.max_weight,
                                );
                            }
                        }
                    }
                    if let Some(id_img) = measurements.id {
                        slice[idx].id.update(*id_img.get(pix.x as u32, pix.y as u32));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Affine3A;
    use crate::map::data::TsdfConfig;
    use crate::map::MapConfig;
    use crate::octree::visitor;
    use crate::sensor::pinhole::{PinholeCamera, PinholeCameraConfig};

    fn test_setup() -> (Map<TsdfField>, PinholeCamera) {
        let map = Map::new(
            MapConfig {
                dim: Vec3::splat(3.2),
                res: 0.1,
                origin: Some(Vec3::new(-1.6, -1.6, 0.0)),
                block_size: 8,
            },
            TsdfConfig::default(),
        )
        .unwrap();
        let camera = PinholeCamera::new(PinholeCameraConfig {
            width: 16,
            height: 16,
            fx: 16.0,
            fy: 16.0,
            cx: 7.5,
            cy: 7.5,
            near_plane: 0.1,
            far_plane: 10.0,
            pixel_voxel_ratio_per_scale: vec![1.5, 3.0, 6.0],
        })
        .unwrap();
        (map, camera)
    }

    #[test]
    fn test_tsdf_wall_fusion() {
        let (mut map, camera) = test_setup();
        let depth = Image::new(16, 16, 2.0f32);
        let sigma = Image::new(16, 16, 0.02f32);
        let measurements = Measurements {
            depth: &depth,
            depth_sigma: &sigma,
            t_ws: Affine3A::IDENTITY,
            colour: None,
            id: None,
        };
        integrate(&mut map, &camera, &measurements, 1).unwrap();

        assert!(map.octree().pool().block_count() > 0);
        // In front of the wall along the optical axis the field is positive
        let voxel_front = map.point_to_voxel(Vec3::new(0.05, 0.05, 1.6)).unwrap();
        let front = visitor::get_field(map.octree(), voxel_front).unwrap();
        assert!(front > 0.0, "front field {}", front);
        // Just behind the wall the field is negative
        let voxel_behind = map.point_to_voxel(Vec3::new(0.05, 0.05, 2.3)).unwrap();
        let behind = visitor::get_field(map.octree(), voxel_behind).unwrap();
        assert!(behind < 0.0, "behind field {}", behind);
    }

    #[test]
    fn test_tsdf_empty_frame() {
        let (mut map, camera) = test_setup();
        let depth = Image::new(16, 16, f32::NAN);
        let sigma = Image::new(16, 16, 0.02f32);
        let measurements = Measurements {
            depth: &depth,
            depth_sigma: &sigma,
            t_ws: Affine3A::IDENTITY,
            colour: None,
            id: None,
        };
        integrate(&mut map, &camera, &measurements, 1).unwrap();
        assert_eq!(map.octree().pool().block_count(), 0);
    }
}

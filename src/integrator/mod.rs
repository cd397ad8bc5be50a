//! Frame integration: volume carving, fusion and propagation

pub mod carver;
pub mod propagation;
pub mod tsdf;
pub mod updater;

pub use carver::{CarverAllocation, VarianceState, VolumeCarver};

use crate::core::types::{Affine3A, Frame, Result};
use crate::image::{Image, Rgb};
use crate::map::data::{ColourData, IdData, OccupancyField};
use crate::map::Map;
use crate::octree::pool::OctantId;
use crate::sensor::SensorModel;
use std::collections::HashSet;

/// Optional colour input of a frame
pub struct ColourMeasurement<'a, S: SensorModel> {
    pub image: &'a Image<Rgb>,
    pub sensor: &'a S,
    /// Colour-sensor-to-world transform
    pub t_wc: Affine3A,
}

/// One frame of sensor input
pub struct Measurements<'a, S: SensorModel> {
    /// Depth in metres; values below the near plane or NaN mean "no
    /// measurement"
    pub depth: &'a Image<f32>,
    /// Per-pixel depth standard deviation in metres
    pub depth_sigma: &'a Image<f32>,
    /// Depth-sensor-to-world transform
    pub t_ws: Affine3A,
    pub colour: Option<ColourMeasurement<'a, S>>,
    /// Per-pixel identifiers aligned with the depth image
    pub id: Option<&'a Image<u16>>,
}

/// Integrate one frame into an occupancy map: carve the frustum, fuse the
/// allocated octants, propagate bottom-up. On error the frame is dropped and
/// the map stays valid. Collects the touched octants if requested.
pub fn integrate<C: ColourData, I: IdData, S: SensorModel>(
    map: &mut Map<OccupancyField, C, I>,
    sensor: &S,
    measurements: &Measurements<'_, S>,
    frame: Frame,
    touched: Option<&mut HashSet<OctantId>>,
) -> Result<()> {
    let start = std::time::Instant::now();
    let config = map.data_config().clone();

    let carver = VolumeCarver::new(
        map,
        sensor,
        measurements.depth,
        measurements.depth_sigma,
        measurements.t_ws,
        config.sigma_min_factor,
        config.sigma_max_factor,
        config.tau_max_factor,
    )?;
    let allocation = carver.carve()?;
    let carved_blocks = allocation.block_list.len();
    let carved_nodes = allocation.node_list.len();

    updater::update(map, sensor, measurements, &allocation, frame, touched)?;

    log::info!(
        "Frame {}: {} blocks, {} free nodes in {:.1} ms",
        frame,
        carved_blocks,
        carved_nodes,
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(())
}

/// Integrate one frame into a TSDF map
pub use tsdf::integrate as integrate_tsdf;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Vec3;
    use crate::map::data::{FieldData, OccupancyConfig};
    use crate::map::MapConfig;
    use crate::octree::visitor;
    use crate::sensor::pinhole::{PinholeCamera, PinholeCameraConfig};

    fn test_map() -> Map<OccupancyField> {
        Map::new(
            MapConfig {
                dim: Vec3::splat(3.2),
                res: 0.1,
                origin: Some(Vec3::new(-1.6, -1.6, 0.0)),
                block_size: 8,
            },
            OccupancyConfig::default(),
        )
        .unwrap()
    }

    fn test_camera() -> PinholeCamera {
        PinholeCamera::new(PinholeCameraConfig {
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
        .unwrap()
    }

    fn wall_frame(depth: f32) -> (Image<f32>, Image<f32>) {
        (Image::new(16, 16, depth), Image::new(16, 16, 0.05f32))
    }

    #[test]
    fn test_empty_frame_is_a_noop() {
        let mut map = test_map();
        let camera = test_camera();
        let depth = Image::new(16, 16, f32::NAN);
        let sigma = Image::new(16, 16, 0.05f32);
        let measurements = Measurements {
            depth: &depth,
            depth_sigma: &sigma,
            t_ws: Affine3A::IDENTITY,
            colour: None,
            id: None,
        };
        let mut touched = HashSet::new();
        integrate(&mut map, &camera, &measurements, 1, Some(&mut touched)).unwrap();

        assert_eq!(map.octree().pool().block_count(), 0);
        assert!(map.octree().aabb().is_empty());
        assert!(touched.is_empty());
    }

    #[test]
    fn test_wall_frame_free_and_occupied() {
        let mut map = test_map();
        let camera = test_camera();
        let (depth, sigma) = wall_frame(2.0);
        let measurements = Measurements {
            depth: &depth,
            depth_sigma: &sigma,
            t_ws: Affine3A::IDENTITY,
            colour: None,
            id: None,
        };
        let mut touched = HashSet::new();
        integrate(&mut map, &camera, &measurements, 1, Some(&mut touched)).unwrap();

        assert!(!touched.is_empty());
        assert!(!map.octree().aabb().is_empty());

        // On the wall along the optical axis: occupied
        let wall_voxel = map.point_to_voxel(Vec3::new(0.05, 0.05, 2.05)).unwrap();
        let wall_field = visitor::get_field(map.octree(), wall_voxel).unwrap();
        assert!(wall_field > 0.0, "wall field {}", wall_field);

        // Between the camera and the wall: free
        let free_voxel = map.point_to_voxel(Vec3::new(0.05, 0.05, 1.05)).unwrap();
        let free_field = visitor::get_field(map.octree(), free_voxel).unwrap();
        assert!(free_field < 0.0, "free field {}", free_field);
    }

    #[test]
    fn test_repeat_integration_accumulates() {
        let mut map = test_map();
        let camera = test_camera();
        let (depth, sigma) = wall_frame(2.0);
        let measurements = Measurements {
            depth: &depth,
            depth_sigma: &sigma,
            t_ws: Affine3A::IDENTITY,
            colour: None,
            id: None,
        };
        integrate(&mut map, &camera, &measurements, 1, None).unwrap();
        let wall_voxel = map.point_to_voxel(Vec3::new(0.05, 0.05, 2.05)).unwrap();
        let field_1 = visitor::get_field(map.octree(), wall_voxel).unwrap();
        let block_1 = crate::octree::fetcher::block(map.octree(), wall_voxel).unwrap();
        let count_1 = map.octree().block(block_1).curr_integr_count();

        integrate(&mut map, &camera, &measurements, 2, None).unwrap();
        let field_2 = visitor::get_field(map.octree(), wall_voxel).unwrap();
        let count_2 = map.octree().block(block_1).curr_integr_count();

        // One integration per call, monotone confidence, bounded increment
        assert_eq!(count_2, count_1 + 1);
        assert!(field_2 >= field_1);
        let config = OccupancyConfig::default();
        assert!(field_2 - field_1 <= 2.0 * config.log_odd_max.abs() + 1e-3);
    }

    #[test]
    fn test_node_aggregates_bound_block_data() {
        let mut map = test_map();
        let camera = test_camera();
        let (depth, sigma) = wall_frame(2.0);
        let measurements = Measurements {
            depth: &depth,
            depth_sigma: &sigma,
            t_ws: Affine3A::IDENTITY,
            colour: None,
            id: None,
        };
        integrate(&mut map, &camera, &measurements, 1, None).unwrap();

        let octree = map.octree();
        for id in octree.iter_nodes() {
            let node_id = id.as_node().unwrap();
            let node = octree.node(node_id);
            assert!(node.min_data.field() <= node.max_data.field() + 1e-3);
            for child_idx in 0..8 {
                if let Some(OctantId::Block(b)) = node.child(child_idx) {
                    let field = octree.block(b).data_coarsest().field.field();
                    if octree.block(b).data_coarsest().field.observed {
                        assert!(node.min_data.field() <= field + 1e-3);
                        assert!(field <= node.max_data.field() + 1e-3);
                    }
                }
            }
        }
    }

    #[test]
    fn test_free_voxel_far_behind_wall_untouched() {
        let mut map = test_map();
        let camera = test_camera();
        let (depth, sigma) = wall_frame(1.0);
        let measurements = Measurements {
            depth: &depth,
            depth_sigma: &sigma,
            t_ws: Affine3A::IDENTITY,
            colour: None,
            id: None,
        };
        integrate(&mut map, &camera, &measurements, 1, None).unwrap();

        // Deep behind the wall nothing was observed
        let occluded = map.point_to_voxel(Vec3::new(0.05, 0.05, 3.0)).unwrap();
        assert_eq!(visitor::get_field(map.octree(), occluded), None);
    }

    #[test]
    fn test_dimension_mismatch_aborts_frame() {
        let mut map = test_map();
        let camera = test_camera();
        let depth = Image::new(8, 8, 1.0f32);
        let sigma = Image::new(8, 8, 0.05f32);
        let measurements = Measurements {
            depth: &depth,
            depth_sigma: &sigma,
            t_ws: Affine3A::IDENTITY,
            colour: None,
            id: None,
        };
        assert!(integrate(&mut map, &camera, &measurements, 1, None).is_err());
        // The octree is untouched
        assert_eq!(map.octree().pool().block_count(), 0);
    }

    #[test]
    fn test_colour_fused_on_surface() {
        use crate::map::data::ColourRecord;
        let mut map: Map<OccupancyField, ColourRecord> = Map::new(
            MapConfig {
                dim: Vec3::splat(3.2),
                res: 0.1,
                origin: Some(Vec3::new(-1.6, -1.6, 0.0)),
                block_size: 8,
            },
            OccupancyConfig::default(),
        )
        .unwrap();
        let camera = test_camera();
        let (depth, sigma) = wall_frame(2.0);
        let colour_img = Image::new(16, 16, Rgb::new(200, 64, 32));
        let measurements = Measurements {
            depth: &depth,
            depth_sigma: &sigma,
            t_ws: Affine3A::IDENTITY,
            colour: Some(ColourMeasurement {
                image: &colour_img,
                sensor: &camera,
                t_wc: Affine3A::IDENTITY,
            }),
            id: None,
        };
        integrate(&mut map, &camera, &measurements, 1, None).unwrap();

        let wall_voxel = map.point_to_voxel(Vec3::new(0.05, 0.05, 2.05)).unwrap();
        let data = visitor::get_data(map.octree(), wall_voxel);
        assert!(data.field.field() > 0.0);
        let rgb = data.colour.rgb().expect("colour fused with the field");
        assert_eq!(rgb, Rgb::new(200, 64, 32));

        // Free space keeps no colour
        let free_voxel = map.point_to_voxel(Vec3::new(0.05, 0.05, 1.05)).unwrap();
        let free = visitor::get_data(map.octree(), free_voxel);
        if free.field.valid() {
            assert_eq!(free.colour.rgb(), None);
        }
    }
}

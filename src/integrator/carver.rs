//! Frustum-bounded volume carver
//!
//! Walks the octree top-down inside the sensor frustum, allocating the
//! octants the frame can say something about and classifying each as free
//! space, near-surface or undefined. Free nodes are freed wholesale by the
//! updater, blocks are fused per voxel.

use crate::core::error::Error;
use crate::core::types::{Affine3A, IVec3, Result, Vec2, Vec3};
use crate::image::pooling::PoolingImage;
use crate::image::Image;
use crate::map::data::{ColourData, FieldData, IdData};
use crate::map::Map;
use crate::octree::pool::{BlockId, NodeId, OctantId};
use crate::sensor::{PixelRect, ProjectionStatus, SensorModel};

/// Classification of the depth variance inside an octant
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarianceState {
    /// The octant is entirely on the observed-free side of the surface band
    Constant,
    /// The surface band crosses the octant
    Gradient,
    /// The pooled image region contains pixels without a measurement
    Undefined,
}

/// Output of a carve: octants to update, with per-block classification
#[derive(Default)]
pub struct CarverAllocation {
    /// Nodes to be free-space-updated wholesale
    pub node_list: Vec<NodeId>,
    /// Blocks to be fused at voxel granularity
    pub block_list: Vec<BlockId>,
    /// Per-block variance classification, parallel to `block_list`
    pub variance_state_list: Vec<VarianceState>,
    /// Per-block bit: every projected pixel lies strictly inside the image
    pub projects_inside_list: Vec<bool>,
}

struct CarverConfig {
    sigma_min: f32,
    sigma_max: f32,
    tau_max: f32,
}

pub struct VolumeCarver<'a, F, C, I, S>
where
    F: FieldData,
    C: ColourData,
    I: IdData,
    S: SensorModel,
{
    map: &'a mut Map<F, C, I>,
    sensor: &'a S,
    depth_pool: PoolingImage,
    sigma_pool: PoolingImage,
    /// World-to-sensor transform
    t_sw: Affine3A,
    /// Camera position in world coordinates
    cam_w: Vec3,
    config: CarverConfig,
    allocation: CarverAllocation,
}

impl<'a, F, C, I, S> VolumeCarver<'a, F, C, I, S>
where
    F: FieldData,
    C: ColourData,
    I: IdData,
    S: SensorModel,
{
    pub fn new(
        map: &'a mut Map<F, C, I>,
        sensor: &'a S,
        depth_img: &Image<f32>,
        depth_sigma_img: &Image<f32>,
        t_ws: Affine3A,
        sigma_min_factor: f32,
        sigma_max_factor: f32,
        tau_max_factor: f32,
    ) -> Result<Self> {
        if depth_img.width() != sensor.width() || depth_img.height() != sensor.height() {
            return Err(Error::Config(format!(
                "depth image {}x{} does not match the sensor model {}x{}",
                depth_img.width(),
                depth_img.height(),
                sensor.width(),
                sensor.height()
            )));
        }
        if depth_sigma_img.width() != depth_img.width()
            || depth_sigma_img.height() != depth_img.height()
        {
            return Err(Error::Config(
                "depth and sigma images must have the same size".into(),
            ));
        }

        let res = map.res();
        let depth_pool = PoolingImage::new(depth_img, sensor.near_plane());
        let sigma_pool = PoolingImage::new(depth_sigma_img, 0.0);
        let t_sw = t_ws.inverse();
        let cam_w = t_ws.translation.into();

        Ok(Self {
            map,
            sensor,
            depth_pool,
            sigma_pool,
            t_sw,
            cam_w,
            config: CarverConfig {
                sigma_min: sigma_min_factor * res,
                sigma_max: sigma_max_factor * res,
                tau_max: tau_max_factor * res,
            },
            allocation: CarverAllocation::default(),
        })
    }

    /// Carve the frustum into the octree and return the allocation lists
    pub fn carve(mut self) -> Result<CarverAllocation> {
        if !self.depth_pool.image_max().is_finite() {
            // The frame measured nothing at all
            return Ok(self.allocation);
        }
        let root = self.map.octree().root();
        let size = self.map.octree().size();
        self.carve_octant(OctantId::Node(root), IVec3::ZERO, size);
        log::debug!(
            "Carved {} free nodes, {} blocks",
            self.allocation.node_list.len(),
            self.allocation.block_list.len()
        );
        Ok(self.allocation)
    }

    fn emit_block(&mut self, id: BlockId, state: VarianceState, projects_inside: bool) {
        self.allocation.block_list.push(id);
        self.allocation.variance_state_list.push(state);
        self.allocation.projects_inside_list.push(projects_inside);
    }

    fn emit_free_node(&mut self, id: NodeId, coord: IVec3, size: i32) {
        self.allocation.node_list.push(id);
        // Free leaf nodes represent observed space and are invisible to the
        // block allocation path, so extend the AABB here.
        self.map.octree_mut().aabb_extend(coord, size);
    }

    fn camera_in_octant(&self, coord: IVec3, size: i32) -> bool {
        let v = self.map.point_to_voxel_f(self.cam_w);
        let min = coord.as_vec3();
        let max = (coord + IVec3::splat(size)).as_vec3();
        v.x >= min.x && v.y >= min.y && v.z >= min.z && v.x < max.x && v.y < max.y && v.z < max.z
    }

    /// Minimum world-space distance from the camera to the octant volume.
    /// A valid lower bound for the range measurement of any point inside.
    fn camera_to_octant_dist(&self, coord: IVec3, size: i32) -> f32 {
        let min = self.map.voxel_corner_to_point(coord);
        let max = self.map.voxel_corner_to_point(coord + IVec3::splat(size));
        let closest = self.cam_w.clamp(min, max);
        (closest - self.cam_w).length()
    }

    fn pool_query(&self, pool: &PoolingImage, rect: &PixelRect) -> crate::image::PoolingValue {
        if rect.wraps {
            pool.query_wrapped(rect.min.x, rect.min.y, rect.max.x, rect.max.y)
        } else {
            pool.query(rect.min.x, rect.min.y, rect.max.x, rect.max.y)
        }
    }

    fn subdivide(&mut self, node: NodeId) {
        self.map.octree_mut().allocate_all_children(node);
        // Morton order 0..7 keeps the emitted lists deterministic
        for child_idx in 0..8 {
            let child = self
                .map
                .octree()
                .node(node)
                .child(child_idx)
                .expect("allocated above");
            let coord = self.map.octree().octant_coord(child);
            let size = self.map.octree().octant_size(child);
            self.carve_octant(child, coord, size);
        }
    }

    fn carve_octant(&mut self, octant: OctantId, coord: IVec3, size: i32) {
        let res = self.map.res();

        // Project the eight corners into the image
        let mut projections = [(Vec2::ZERO, ProjectionStatus::Behind); 8];
        let mut n_behind = 0;
        let mut n_ok = 0;
        for (i, projection) in projections.iter_mut().enumerate() {
            let offset = IVec3::new(i as i32 & 1, (i as i32 >> 1) & 1, (i as i32 >> 2) & 1);
            let corner_w = self.map.voxel_corner_to_point(coord + size * offset);
            let corner_s = self.t_sw.transform_point3(corner_w);
            *projection = self.sensor.project(corner_s);
            match projection.1 {
                ProjectionStatus::Behind => n_behind += 1,
                ProjectionStatus::Ok => n_ok += 1,
                ProjectionStatus::Outside => {}
            }
        }

        if self.camera_in_octant(coord, size) {
            match octant {
                OctantId::Node(n) => self.subdivide(n),
                OctantId::Block(b) => self.emit_block(b, VarianceState::Undefined, false),
            }
            return;
        }
        if n_behind == 8 {
            return;
        }
        if n_behind > 0 {
            // The octant straddles the camera plane
            match octant {
                OctantId::Node(n) => self.subdivide(n),
                OctantId::Block(b) => self.emit_block(b, VarianceState::Undefined, false),
            }
            return;
        }

        let rect = match self.sensor.pixel_rect(&projections) {
            Some(rect) => rect,
            None => return,
        };

        let depth = self.pool_query(&self.depth_pool, &rect);
        if !depth.has_valid {
            // No measurement anywhere in the region
            return;
        }
        let sigma_max = self
            .pool_query(&self.sigma_pool, &rect)
            .max
            .max(0.0)
            .min(self.config.sigma_max);

        // Measurement range of the octant along the sensor axis
        let mut z_max = f32::NEG_INFINITY;
        let mut z_min_corner = f32::INFINITY;
        for (i, _) in projections.iter().enumerate() {
            let offset = IVec3::new(i as i32 & 1, (i as i32 >> 1) & 1, (i as i32 >> 2) & 1);
            let corner_w = self.map.voxel_corner_to_point(coord + size * offset);
            let corner_s = self.t_sw.transform_point3(corner_w);
            let m = self.sensor.measurement_from_point(corner_s);
            z_max = z_max.max(m);
            z_min_corner = z_min_corner.min(m);
        }
        let z_min = if self.sensor.wraps_horizontally() {
            // Range measurements attain their minimum on the octant surface,
            // not necessarily at a corner.
            self.camera_to_octant_dist(coord, size)
        } else {
            z_min_corner.max(0.0)
        };

        // Fully occluded: beyond everything the frame measured in the region
        if z_min > depth.max + self.config.tau_max + 3.0 * sigma_max {
            return;
        }

        let variance = if depth.has_gap {
            VarianceState::Undefined
        } else if z_max < depth.min - 3.0 * sigma_max {
            VarianceState::Constant
        } else {
            VarianceState::Gradient
        };
        let projects_inside = n_ok == 8;

        match octant {
            OctantId::Block(b) => {
                self.emit_block(b, variance, projects_inside);
            }
            OctantId::Node(n) => {
                match variance {
                    VarianceState::Constant if projects_inside => {
                        // Entirely observed free space: freed wholesale
                        self.emit_free_node(n, coord, size);
                    }
                    VarianceState::Constant => {
                        // Partially outside the image: only the children that
                        // project fully can be freed
                        self.subdivide(n);
                    }
                    VarianceState::Undefined => {
                        // Stop descending once the octant is below what the
                        // sensor can resolve
                        let diagonal = 3.0f32.sqrt() * size as f32 * res;
                        if diagonal <= 2.0 * self.config.sigma_min {
                            return;
                        }
                        self.subdivide(n);
                    }
                    VarianceState::Gradient => self.subdivide(n),
                }
            }
        }
    }
}

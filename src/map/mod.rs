//! Map: world-metric view over the voxel octree

pub mod data;

use crate::core::error::Error;
use crate::core::types::{IVec3, Result, Vec3};
use crate::map::data::{ColourData, FieldData, IdData};
use crate::math::aabb::Aabb;
use crate::octree::Octree;
use serde::{Deserialize, Serialize};

/// Geometry of the mapped volume
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MapConfig {
    /// Extent of the mapped volume in metres
    pub dim: Vec3,
    /// Resolution in metres per voxel
    pub res: f32,
    /// World position of the voxel (0, 0, 0) corner. `None` centres the
    /// volume on the world origin.
    pub origin: Option<Vec3>,
    /// Block edge length in voxels
    pub block_size: i32,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            dim: Vec3::splat(10.0),
            res: 0.1,
            origin: None,
            block_size: 8,
        }
    }
}

/// A dense volumetric map: an octree plus the conversion between world
/// points in metres and voxel coordinates.
pub struct Map<F: FieldData, C: ColourData = (), I: IdData = ()> {
    octree: Octree<F, C, I>,
    res: f32,
    dim: Vec3,
    origin: Vec3,
    data_config: F::Config,
}

impl<F: FieldData, C: ColourData, I: IdData> Map<F, C, I> {
    pub fn new(config: MapConfig, data_config: F::Config) -> Result<Self> {
        if config.res <= 0.0 {
            return Err(Error::Config(format!(
                "map resolution {} must be positive",
                config.res
            )));
        }
        if !(config.dim.x > 0.0 && config.dim.y > 0.0 && config.dim.z > 0.0) {
            return Err(Error::Config(format!("map dimension {} must be positive", config.dim)));
        }
        let size = (config.dim.max_element() / config.res).ceil() as i32;
        let octree = Octree::new(size, config.block_size)?;
        let origin = config
            .origin
            .unwrap_or_else(|| -0.5 * octree.size() as f32 * config.res * Vec3::ONE);
        log::info!(
            "Map: {}^3 voxels at {} m/voxel, origin {}",
            octree.size(),
            config.res,
            origin
        );
        Ok(Self {
            octree,
            res: config.res,
            dim: config.dim,
            origin,
            data_config,
        })
    }

    pub fn res(&self) -> f32 {
        self.res
    }

    pub fn dim(&self) -> Vec3 {
        self.dim
    }

    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    pub fn data_config(&self) -> &F::Config {
        &self.data_config
    }

    pub fn octree(&self) -> &Octree<F, C, I> {
        &self.octree
    }

    pub fn octree_mut(&mut self) -> &mut Octree<F, C, I> {
        &mut self.octree
    }

    /// World AABB of the octree volume
    pub fn world_aabb(&self) -> Aabb {
        let size_m = self.octree.size() as f32 * self.res;
        Aabb::new(self.origin, self.origin + Vec3::splat(size_m))
    }

    /// Voxel containing the world point, or a boundary error if the point is
    /// outside the volume.
    pub fn point_to_voxel(&self, point_w: Vec3) -> Result<IVec3> {
        let v = (point_w - self.origin) / self.res;
        let voxel = IVec3::new(
            v.x.floor() as i32,
            v.y.floor() as i32,
            v.z.floor() as i32,
        );
        if self.octree.contains(voxel) {
            Ok(voxel)
        } else {
            Err(Error::Boundary(voxel.x, voxel.y, voxel.z))
        }
    }

    /// Fractional voxel coordinates of a world point, without bounds checks
    pub fn point_to_voxel_f(&self, point_w: Vec3) -> Vec3 {
        (point_w - self.origin) / self.res
    }

    /// World position of the centre of the octant with corner `voxel` and
    /// edge length `stride` in voxels.
    pub fn voxel_to_point(&self, voxel: IVec3, stride: i32) -> Vec3 {
        self.origin + self.res * (voxel.as_vec3() + Vec3::splat(0.5 * stride as f32))
    }

    /// World position of a voxel corner
    pub fn voxel_corner_to_point(&self, voxel: IVec3) -> Vec3 {
        self.origin + self.res * voxel.as_vec3()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::data::{OccupancyConfig, OccupancyField};

    fn test_map() -> Map<OccupancyField> {
        Map::new(
            MapConfig {
                dim: Vec3::splat(3.2),
                res: 0.1,
                origin: Some(Vec3::ZERO),
                block_size: 8,
            },
            OccupancyConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_octree_sizing() {
        let map = test_map();
        assert_eq!(map.octree().size(), 32);
    }

    #[test]
    fn test_point_voxel_roundtrip() {
        let map = test_map();
        let voxel = map.point_to_voxel(Vec3::new(0.55, 0.0, 3.1)).unwrap();
        assert_eq!(voxel, IVec3::new(5, 0, 31));
        let centre = map.voxel_to_point(voxel, 1);
        assert!((centre - Vec3::new(0.55, 0.05, 3.15)).length() < 1e-5);
        assert_eq!(map.point_to_voxel(centre).unwrap(), voxel);
    }

    #[test]
    fn test_boundary_error() {
        let map = test_map();
        assert!(map.point_to_voxel(Vec3::new(-0.1, 0.0, 0.0)).is_err());
        assert!(map.point_to_voxel(Vec3::splat(100.0)).is_err());
    }

    #[test]
    fn test_invalid_config() {
        let config = MapConfig {
            res: -1.0,
            ..Default::default()
        };
        assert!(Map::<OccupancyField>::new(config, OccupancyConfig::default()).is_err());
    }

    #[test]
    fn test_centred_origin() {
        let map: Map<OccupancyField> =
            Map::new(MapConfig::default(), OccupancyConfig::default()).unwrap();
        // 10 m at 0.1 m/voxel rounds up to 128 voxels = 12.8 m
        assert_eq!(map.octree().size(), 128);
        assert!((map.origin() - Vec3::splat(-6.4)).length() < 1e-5);
        assert_eq!(map.point_to_voxel(Vec3::ZERO).unwrap(), IVec3::splat(64));
    }
}

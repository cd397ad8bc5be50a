//! Rotating LiDAR as a cylindrical range image
//!
//! Azimuth maps to the horizontal axis with wrap-around at the +-pi seam,
//! elevation to the vertical axis clamped to the beam fan.

use crate::core::types::{IVec2, Result, Scale, Vec2, Vec3};
use crate::sensor::{scale_from_ratio, validate_ratios, PixelRect, ProjectionStatus, SensorModel};
use serde::{Deserialize, Serialize};
use std::f32::consts::{PI, TAU};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RangeImageLidarConfig {
    /// Azimuth bins over a full revolution
    pub width: u32,
    /// Elevation bins over the beam fan
    pub height: u32,
    /// Lowest beam elevation in radians
    pub elevation_min: f32,
    /// Highest beam elevation in radians
    pub elevation_max: f32,
    pub near_plane: f32,
    pub far_plane: f32,
    /// Pixel-to-voxel size ratio thresholds, ascending, one per scale step
    pub pixel_voxel_ratio_per_scale: Vec<f32>,
}

impl Default for RangeImageLidarConfig {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 64,
            elevation_min: -22.5f32.to_radians(),
            elevation_max: 22.5f32.to_radians(),
            near_plane: 0.3,
            far_plane: 50.0,
            pixel_voxel_ratio_per_scale: vec![1.5, 3.0, 6.0],
        }
    }
}

pub struct RangeImageLidar {
    config: RangeImageLidarConfig,
}

impl RangeImageLidar {
    pub fn new(config: RangeImageLidarConfig) -> Result<Self> {
        if config.width == 0 || config.height == 0 {
            return Err(crate::core::Error::Config(format!(
                "invalid range image size {}x{}",
                config.width, config.height
            )));
        }
        if config.elevation_min >= config.elevation_max {
            return Err(crate::core::Error::Config(
                "elevation_min must be below elevation_max".into(),
            ));
        }
        if config.near_plane <= 0.0 || config.far_plane <= config.near_plane {
            return Err(crate::core::Error::Config(format!(
                "invalid near/far planes {}/{}",
                config.near_plane, config.far_plane
            )));
        }
        validate_ratios(&config.pixel_voxel_ratio_per_scale)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RangeImageLidarConfig {
        &self.config
    }

    fn elevation_span(&self) -> f32 {
        self.config.elevation_max - self.config.elevation_min
    }

    /// Azimuth of a pixel column, inverse of the projection
    fn azimuth_of(&self, u: f32) -> f32 {
        PI - u / self.config.width as f32 * TAU
    }
}

impl SensorModel for RangeImageLidar {
    fn width(&self) -> u32 {
        self.config.width
    }

    fn height(&self) -> u32 {
        self.config.height
    }

    fn near_plane(&self) -> f32 {
        self.config.near_plane
    }

    fn far_plane(&self) -> f32 {
        self.config.far_plane
    }

    fn project(&self, p: Vec3) -> (Vec2, ProjectionStatus) {
        let range = p.length();
        if range < 1e-6 {
            return (Vec2::ZERO, ProjectionStatus::Behind);
        }
        let azimuth = p.y.atan2(p.x);
        let elevation = (p.z / range).asin();
        let u = ((PI - azimuth) / TAU * self.config.width as f32)
            .rem_euclid(self.config.width as f32);
        let v = (self.config.elevation_max - elevation) / self.elevation_span()
            * (self.config.height as f32 - 1.0);
        let status = if v < -0.5 || v > self.config.height as f32 - 0.5 {
            ProjectionStatus::Outside
        } else {
            ProjectionStatus::Ok
        };
        (Vec2::new(u, v), status)
    }

    fn back_project(&self, pixel: Vec2) -> Vec3 {
        let azimuth = self.azimuth_of(pixel.x);
        let elevation = self.config.elevation_max
            - pixel.y / (self.config.height as f32 - 1.0) * self.elevation_span();
        Vec3::new(
            elevation.cos() * azimuth.cos(),
            elevation.cos() * azimuth.sin(),
            elevation.sin(),
        )
    }

    fn measurement_from_point(&self, p: Vec3) -> f32 {
        p.length()
    }

    fn point_in_frustum(&self, p: Vec3) -> bool {
        let range = p.length();
        if range < self.config.near_plane || range > self.config.far_plane {
            return false;
        }
        let elevation = (p.z / range).asin();
        elevation >= self.config.elevation_min && elevation <= self.config.elevation_max
    }

    fn sphere_in_frustum(&self, c: Vec3, r: f32) -> bool {
        let range = c.length();
        if range + r < self.config.near_plane || range - r > self.config.far_plane {
            return false;
        }
        if range < 1e-6 {
            return true;
        }
        let elevation = (c.z / range).asin();
        let margin = (r / range).min(1.0).asin();
        elevation + margin >= self.config.elevation_min
            && elevation - margin <= self.config.elevation_max
    }

    fn integration_scale(
        &self,
        block_centre_s: Vec3,
        map_res: f32,
        last_scale: Scale,
        min_scale: Scale,
        max_block_scale: Scale,
    ) -> Scale {
        let dist = block_centre_s.length();
        if dist <= 0.0 {
            return last_scale.max(0);
        }
        // Arc length of one azimuth bin at the block distance, relative to
        // the voxel size.
        let pv_ratio = dist * (TAU / self.config.width as f32) / map_res;
        scale_from_ratio(
            pv_ratio,
            &self.config.pixel_voxel_ratio_per_scale,
            last_scale,
            min_scale,
            max_block_scale,
        )
    }

    fn pixel_rect(&self, projections: &[(Vec2, ProjectionStatus); 8]) -> Option<PixelRect> {
        let w = self.config.width as f32;
        let mut reference = None;
        for (pixel, status) in projections {
            if *status != ProjectionStatus::Behind {
                reference = Some(pixel.x);
                break;
            }
        }
        let u0 = reference?;

        // Unwrap azimuths relative to the first corner so a rectangle
        // straddling the seam stays contiguous.
        let mut rel_min = f32::INFINITY;
        let mut rel_max = f32::NEG_INFINITY;
        let mut v_min = f32::INFINITY;
        let mut v_max = f32::NEG_INFINITY;
        for (pixel, status) in projections {
            if *status == ProjectionStatus::Behind {
                continue;
            }
            let rel = (pixel.x - u0 + w / 2.0).rem_euclid(w) - w / 2.0;
            rel_min = rel_min.min(rel);
            rel_max = rel_max.max(rel);
            v_min = v_min.min(pixel.y);
            v_max = v_max.max(pixel.y);
        }

        if v_max < -0.5 || v_min > self.config.height as f32 - 0.5 {
            // Entirely above or below the beam fan
            return None;
        }
        let y0 = (v_min.floor() as i32).clamp(0, self.config.height as i32 - 1);
        let y1 = (v_max.ceil() as i32).clamp(0, self.config.height as i32 - 1);

        if rel_max - rel_min >= w - 1.0 {
            // Full revolution
            return Some(PixelRect {
                min: IVec2::new(0, y0),
                max: IVec2::new(self.config.width as i32 - 1, y1),
                wraps: false,
            });
        }
        let x0 = (u0 + rel_min).floor().rem_euclid(w) as i32;
        let x1 = (u0 + rel_max).ceil().rem_euclid(w) as i32;
        Some(PixelRect {
            min: IVec2::new(x0, y0),
            max: IVec2::new(x1, y1),
            wraps: x0 > x1,
        })
    }

    fn wraps_horizontally(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lidar() -> RangeImageLidar {
        RangeImageLidar::new(RangeImageLidarConfig::default()).unwrap()
    }

    #[test]
    fn test_project_forward() {
        let l = lidar();
        // +x is straight ahead, azimuth 0, middle column
        let (pixel, status) = l.project(Vec3::new(5.0, 0.0, 0.0));
        assert_eq!(status, ProjectionStatus::Ok);
        assert!((pixel.x - 512.0).abs() < 1.0);
        assert!((pixel.y - 31.5).abs() < 1.0);
    }

    #[test]
    fn test_project_elevation_clamp() {
        let l = lidar();
        // Straight up is outside the beam fan
        let (_, status) = l.project(Vec3::new(0.1, 0.0, 5.0));
        assert_eq!(status, ProjectionStatus::Outside);
    }

    #[test]
    fn test_back_project_roundtrip() {
        let l = lidar();
        let p = Vec3::new(3.0, -2.0, 0.5);
        let (pixel, status) = l.project(p);
        assert_eq!(status, ProjectionStatus::Ok);
        let q = l.back_project(pixel) * l.measurement_from_point(p);
        assert!((q - p).length() < 0.05);
    }

    #[test]
    fn test_wrap_rect() {
        let l = lidar();
        // Points on both sides of the -x seam
        let a = l.project(Vec3::new(-5.0, 0.2, 0.0));
        let b = l.project(Vec3::new(-5.0, -0.2, 0.0));
        let projections = [a, a, a, a, b, b, b, b];
        let rect = l.pixel_rect(&projections).unwrap();
        assert!(rect.wraps);
        assert!(rect.min.x > rect.max.x);
    }

    #[test]
    fn test_measurement_is_range() {
        let l = lidar();
        assert!((l.measurement_from_point(Vec3::new(3.0, 4.0, 0.0)) - 5.0).abs() < 1e-5);
    }
}

//! Pinhole camera model

use crate::core::types::{IVec2, Result, Scale, Vec2, Vec3};
use crate::sensor::{scale_from_ratio, validate_ratios, PixelRect, ProjectionStatus, SensorModel};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PinholeCameraConfig {
    pub width: u32,
    pub height: u32,
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    pub near_plane: f32,
    pub far_plane: f32,
    /// Pixel-to-voxel size ratio thresholds, ascending, one per scale step
    pub pixel_voxel_ratio_per_scale: Vec<f32>,
}

impl Default for PinholeCameraConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fx: 525.0,
            fy: 525.0,
            cx: 319.5,
            cy: 239.5,
            near_plane: 0.1,
            far_plane: 10.0,
            pixel_voxel_ratio_per_scale: vec![1.5, 3.0, 6.0],
        }
    }
}

pub struct PinholeCamera {
    config: PinholeCameraConfig,
}

impl PinholeCamera {
    pub fn new(config: PinholeCameraConfig) -> Result<Self> {
        if config.width == 0 || config.height == 0 {
            return Err(crate::core::Error::Config(format!(
                "invalid image size {}x{}",
                config.width, config.height
            )));
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

    pub fn config(&self) -> &PinholeCameraConfig {
        &self.config
    }
}

impl SensorModel for PinholeCamera {
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
        if p.z <= 0.0 {
            return (Vec2::ZERO, ProjectionStatus::Behind);
        }
        let pixel = Vec2::new(
            self.config.fx * p.x / p.z + self.config.cx,
            self.config.fy * p.y / p.z + self.config.cy,
        );
        let status = if pixel.x < -0.5
            || pixel.y < -0.5
            || pixel.x > self.config.width as f32 - 0.5
            || pixel.y > self.config.height as f32 - 0.5
        {
            ProjectionStatus::Outside
        } else {
            ProjectionStatus::Ok
        };
        (pixel, status)
    }

    fn back_project(&self, pixel: Vec2) -> Vec3 {
        Vec3::new(
            (pixel.x - self.config.cx) / self.config.fx,
            (pixel.y - self.config.cy) / self.config.fy,
            1.0,
        )
    }

    fn measurement_from_point(&self, p: Vec3) -> f32 {
        p.z
    }

    fn point_in_frustum(&self, p: Vec3) -> bool {
        if p.z < self.config.near_plane || p.z > self.config.far_plane {
            return false;
        }
        matches!(self.project(p).1, ProjectionStatus::Ok)
    }

    fn sphere_in_frustum(&self, c: Vec3, r: f32) -> bool {
        if c.z + r < self.config.near_plane || c.z - r > self.config.far_plane {
            return false;
        }
        if c.z <= 0.0 {
            // Centre behind the camera plane but the sphere reaches past the
            // near plane.
            return true;
        }
        let (pixel, _) = self.project(c);
        let pixel_r = self.config.fx.max(self.config.fy) * r / c.z;
        pixel.x + pixel_r >= -0.5
            && pixel.x - pixel_r <= self.config.width as f32 - 0.5
            && pixel.y + pixel_r >= -0.5
            && pixel.y - pixel_r <= self.config.height as f32 - 0.5
    }

    fn integration_scale(
        &self,
        block_centre_s: Vec3,
        map_res: f32,
        last_scale: Scale,
        min_scale: Scale,
        max_block_scale: Scale,
    ) -> Scale {
        let dist = block_centre_s.z;
        if dist <= 0.0 {
            return last_scale.max(0);
        }
        // Metric size of one pixel back-projected to the block distance,
        // relative to the voxel size.
        let pv_ratio = (dist / self.config.fx.min(self.config.fy)) / map_res;
        scale_from_ratio(
            pv_ratio,
            &self.config.pixel_voxel_ratio_per_scale,
            last_scale,
            min_scale,
            max_block_scale,
        )
    }

    fn pixel_rect(&self, projections: &[(Vec2, ProjectionStatus); 8]) -> Option<PixelRect> {
        let mut min = Vec2::splat(f32::INFINITY);
        let mut max = Vec2::splat(f32::NEG_INFINITY);
        for (pixel, status) in projections {
            if *status == ProjectionStatus::Behind {
                continue;
            }
            min = min.min(*pixel);
            max = max.max(*pixel);
        }
        if !min.x.is_finite() {
            return None;
        }
        let x0 = (min.x.floor() as i32).clamp(0, self.config.width as i32 - 1);
        let x1 = (max.x.ceil() as i32).clamp(0, self.config.width as i32 - 1);
        let y0 = (min.y.floor() as i32).clamp(0, self.config.height as i32 - 1);
        let y1 = (max.y.ceil() as i32).clamp(0, self.config.height as i32 - 1);
        if max.x < -0.5
            || min.x > self.config.width as f32 - 0.5
            || max.y < -0.5
            || min.y > self.config.height as f32 - 0.5
        {
            // The rectangle misses the image entirely
            return None;
        }
        Some(PixelRect {
            min: IVec2::new(x0, y0),
            max: IVec2::new(x1, y1),
            wraps: false,
        })
    }
}

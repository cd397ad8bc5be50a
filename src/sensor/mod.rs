//! Sensor models used for integrating measurements
//!
//! The two concrete models share one trait; integration code is generic over
//! it so each map/sensor combination monomorphises to a direct code path.

pub mod lidar;
pub mod pinhole;

pub use lidar::{RangeImageLidar, RangeImageLidarConfig};
pub use pinhole::{PinholeCamera, PinholeCameraConfig};

use crate::core::types::{IVec2, Scale, Vec2, Vec3, SCALE_UNINIT};

/// Outcome of projecting a sensor-frame point into the image
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProjectionStatus {
    Ok,
    Behind,
    Outside,
}

/// Axis-aligned pixel rectangle, inclusive bounds. For sensors with
/// horizontal wrap-around `wraps` indicates that the rectangle crosses the
/// right image edge, in which case `min.x > max.x`.
#[derive(Clone, Copy, Debug)]
pub struct PixelRect {
    pub min: IVec2,
    pub max: IVec2,
    pub wraps: bool,
}

/// Capability consumed by the integration pipeline
pub trait SensorModel: Send + Sync {
    /// Image width in pixels
    fn width(&self) -> u32;

    /// Image height in pixels
    fn height(&self) -> u32;

    /// Nearest measurable distance in metres
    fn near_plane(&self) -> f32;

    /// Farthest measurable distance in metres
    fn far_plane(&self) -> f32;

    /// Project a sensor-frame point into the image
    fn project(&self, point_s: Vec3) -> (Vec2, ProjectionStatus);

    /// Ray through a pixel, with length 1 along the measurement axis so that
    /// `back_project(p) * depth` is the measured point
    fn back_project(&self, pixel: Vec2) -> Vec3;

    /// Depth measurement that would result from observing `point_s`: the z
    /// coordinate for a camera, the range for a LiDAR
    fn measurement_from_point(&self, point_s: Vec3) -> f32;

    /// Whether the sensor-frame point is inside the frustum
    fn point_in_frustum(&self, point_s: Vec3) -> bool;

    /// Approximate test whether a sphere intersects the frustum. May return
    /// rare false positives, never false negatives.
    fn sphere_in_frustum(&self, centre_s: Vec3, radius: f32) -> bool;

    /// Integration scale for a block centred at `block_centre_s`, from the
    /// back-projected pixel footprint relative to the voxel size
    fn integration_scale(
        &self,
        block_centre_s: Vec3,
        map_res: f32,
        last_scale: Scale,
        min_scale: Scale,
        max_block_scale: Scale,
    ) -> Scale;

    /// Enclosing pixel rectangle of a set of corner projections, or `None`
    /// if the corners cannot see the image at all
    fn pixel_rect(&self, projections: &[(Vec2, ProjectionStatus); 8]) -> Option<PixelRect>;

    /// Whether the image wraps horizontally (cylindrical projection)
    fn wraps_horizontally(&self) -> bool {
        false
    }
}

/// Map a pixel-to-voxel size ratio to a scale via the configured ascending
/// thresholds, with a 10% hysteresis band around the block's last scale.
pub(crate) fn scale_from_ratio(
    pv_ratio: f32,
    ratios: &[f32],
    last_scale: Scale,
    min_scale: Scale,
    max_block_scale: Scale,
) -> Scale {
    let raw = ratios
        .iter()
        .position(|&r| pv_ratio < r)
        .unwrap_or(ratios.len()) as Scale;
    let raw = raw.min(max_block_scale);
    if min_scale == SCALE_UNINIT {
        return raw;
    }
    let last = last_scale.clamp(0, max_block_scale);
    if raw > last {
        let idx = last as usize;
        if idx < ratios.len() && pv_ratio < ratios[idx] * 1.1 {
            return last;
        }
    } else if raw < last {
        let idx = (last - 1) as usize;
        if idx < ratios.len() && pv_ratio > ratios[idx] * 0.9 {
            return last;
        }
    }
    raw
}

/// Validate that the ratio thresholds are positive and strictly ascending
pub(crate) fn validate_ratios(ratios: &[f32]) -> crate::core::types::Result<()> {
    if ratios.is_empty() {
        return Err(crate::core::Error::Config(
            "pixel_voxel_ratio_per_scale must not be empty".into(),
        ));
    }
    for pair in ratios.windows(2) {
        if pair[0] >= pair[1] {
            return Err(crate::core::Error::Config(format!(
                "pixel_voxel_ratio_per_scale must be ascending, got {} >= {}",
                pair[0], pair[1]
            )));
        }
    }
    if ratios[0] <= 0.0 {
        return Err(crate::core::Error::Config(
            "pixel_voxel_ratio_per_scale must be positive".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATIOS: [f32; 3] = [1.5, 3.0, 6.0];

    #[test]
    fn test_scale_thresholds() {
        assert_eq!(scale_from_ratio(1.0, &RATIOS, 0, SCALE_UNINIT, 3), 0);
        assert_eq!(scale_from_ratio(2.0, &RATIOS, 0, SCALE_UNINIT, 3), 1);
        assert_eq!(scale_from_ratio(4.0, &RATIOS, 0, SCALE_UNINIT, 3), 2);
        assert_eq!(scale_from_ratio(10.0, &RATIOS, 0, SCALE_UNINIT, 3), 3);
    }

    #[test]
    fn test_scale_hysteresis_band() {
        // Ratio just over a threshold does not leave the last scale
        assert_eq!(scale_from_ratio(1.55, &RATIOS, 0, 0, 3), 0);
        assert_eq!(scale_from_ratio(1.7, &RATIOS, 0, 0, 3), 1);
        // Ratio just under a threshold does not fall back either
        assert_eq!(scale_from_ratio(1.45, &RATIOS, 1, 1, 3), 1);
        assert_eq!(scale_from_ratio(1.2, &RATIOS, 1, 1, 3), 0);
    }

    #[test]
    fn test_ratio_validation() {
        assert!(validate_ratios(&RATIOS).is_ok());
        assert!(validate_ratios(&[]).is_err());
        assert!(validate_ratios(&[3.0, 1.5]).is_err());
    }
}

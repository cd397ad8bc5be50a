//! Per-voxel data facets
//!
//! A voxel record composes three independent facets: the field model
//! (occupancy log-odds or TSDF), an optional colour accumulator and an
//! optional identifier. Each facet is a type parameter so the eight possible
//! map configurations are monomorphised with no runtime branching; the unit
//! type stands in for a disabled facet.

use crate::core::types::Scale;
use crate::image::Rgb;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Field facet: the fusion model of the map.
pub trait FieldData:
    Clone + Copy + Debug + Default + PartialEq + Send + Sync + 'static
{
    type Config: Clone + Debug + Default + Send + Sync;

    /// Accumulated field value. Log-odds times weight for occupancy, metric
    /// signed distance for TSDF.
    fn field(&self) -> f32;

    /// A voxel is valid once it has been integrated into at least once.
    fn valid(&self) -> bool;

    /// Whether the voxel lies on the interior side of the surface.
    fn is_inside(&self) -> bool;

    /// Whether the voxel has been directly observed. TSDF has no separate
    /// observed bit, validity stands in for it.
    fn observed(&self) -> bool;

    /// Signed value that is negative strictly inside the surface, used as the
    /// marching-cubes iso function.
    fn surface_value(&self) -> f32;

    /// Integration weight
    fn weight(&self) -> u32;

    /// Set the observed bit. No-op for field models without one.
    fn set_observed(&mut self, observed: bool);

    /// Mean reduction over the valid records of a 2x2x2 child footprint.
    /// Returns the default data if no child is valid.
    fn up_prop_mean(children: &[Self]) -> Self;
}

/// Minimum reduction over the valid records of a child footprint: the record
/// with the smallest accumulated field value, marked observed only if every
/// child is observed. Returns the default data if no child is valid.
pub fn up_prop_min<F: FieldData>(children: &[F]) -> F {
    let mut out: Option<F> = None;
    for c in children.iter().filter(|c| c.valid()) {
        match out {
            Some(best) if best.field() <= c.field() => {}
            _ => out = Some(*c),
        }
    }
    let mut out = out.unwrap_or_default();
    out.set_observed(children.len() == 8 && children.iter().all(|c| c.observed()));
    out
}

/// Maximum reduction over the valid records of a child footprint.
pub fn up_prop_max<F: FieldData>(children: &[F]) -> F {
    let mut out: Option<F> = None;
    for c in children.iter().filter(|c| c.valid()) {
        match out {
            Some(best) if best.field() >= c.field() => {}
            _ => out = Some(*c),
        }
    }
    let mut out = out.unwrap_or_default();
    out.set_observed(children.len() == 8 && children.iter().all(|c| c.observed()));
    out
}

/// Occupancy field: running mean of log-odd updates plus an integration
/// weight. The accumulated log-odds is `occupancy * weight`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OccupancyField {
    pub occupancy: f32,
    pub weight: u8,
    pub observed: bool,
}

/// Occupancy fusion parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OccupancyConfig {
    /// Log-odd update applied to a voxel observed free
    pub log_odd_min: f32,
    /// Log-odd update applied to a voxel observed occupied
    pub log_odd_max: f32,
    /// Maximum integration weight of a voxel
    pub max_weight: u8,
    /// Lower clamp of the accumulated log-odds (`occupancy * weight`)
    pub min_occupancy: f32,
    /// Upper clamp of the accumulated log-odds
    pub max_occupancy: f32,
    /// Surface thickness: `tau = k_tau * depth` clamped to
    /// `[tau_min_factor * res, tau_max_factor * res]`
    pub k_tau: f32,
    pub tau_min_factor: f32,
    pub tau_max_factor: f32,
    /// Depth uncertainty factors, in units of map resolution
    pub sigma_min_factor: f32,
    pub sigma_max_factor: f32,
    /// Coarse scale used when integrating pure free space
    pub fs_integr_scale: Scale,
}

impl Default for OccupancyConfig {
    fn default() -> Self {
        Self {
            log_odd_min: -5.015,
            log_odd_max: 5.015,
            max_weight: 100,
            min_occupancy: -100.0,
            max_occupancy: 50.0,
            k_tau: 0.026,
            tau_min_factor: 3.0,
            tau_max_factor: 12.0,
            sigma_min_factor: 1.5,
            sigma_max_factor: 6.0,
            fs_integr_scale: 1,
        }
    }
}

impl OccupancyField {
    /// Fuse one log-odd update into the running mean, clamping the mean to
    /// the update range and the accumulated log-odds to the occupancy range.
    /// Returns true if the voxel transitioned from unobserved to observed.
    pub fn update(&mut self, log_odd_update: f32, config: &OccupancyConfig) -> bool {
        let w = self.weight as f32;
        self.occupancy = ((self.occupancy * w + log_odd_update) / (w + 1.0))
            .clamp(config.log_odd_min, config.log_odd_max);
        self.weight = self.weight.saturating_add(1).min(config.max_weight);

        let field = self.occupancy * self.weight as f32;
        if field < config.min_occupancy {
            self.occupancy = config.min_occupancy / self.weight as f32;
        } else if field > config.max_occupancy {
            self.occupancy = config.max_occupancy / self.weight as f32;
        }

        let newly_observed = !self.observed;
        self.observed = true;
        newly_observed
    }
}

impl FieldData for OccupancyField {
    type Config = OccupancyConfig;

    fn field(&self) -> f32 {
        self.occupancy * self.weight as f32
    }

    fn valid(&self) -> bool {
        self.weight > 0
    }

    fn is_inside(&self) -> bool {
        self.field() > 0.0
    }

    fn observed(&self) -> bool {
        self.observed
    }

    fn surface_value(&self) -> f32 {
        // Occupied is positive, so negate to get inside-negative.
        -self.field()
    }

    fn weight(&self) -> u32 {
        self.weight as u32
    }

    fn set_observed(&mut self, observed: bool) {
        self.observed = observed;
    }

    fn up_prop_mean(children: &[Self]) -> Self {
        let valid: Vec<&Self> = children.iter().filter(|c| c.valid()).collect();
        if valid.is_empty() {
            return Self::default();
        }
        let n = valid.len() as f32;
        let occupancy = valid.iter().map(|c| c.occupancy).sum::<f32>() / n;
        let weight = (valid.iter().map(|c| c.weight as f32).sum::<f32>() / n).round() as u8;
        let observed = children.len() == 8 && children.iter().all(|c| c.observed);
        Self {
            occupancy,
            weight: weight.max(1),
            observed,
        }
    }
}

/// Scaling factor between the stored integer TSDF and the [-1, 1] range
pub const TSDF_SCALE: f32 = 32767.0;

/// TSDF field: truncated signed distance stored as a scaled integer plus an
/// integration weight.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TsdfField {
    pub tsdf: i16,
    pub weight: u8,
}

impl Default for TsdfField {
    fn default() -> Self {
        // Unobserved space defaults to fully outside.
        Self {
            tsdf: TSDF_SCALE as i16,
            weight: 0,
        }
    }
}

/// TSDF fusion parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TsdfConfig {
    /// Truncation band half-width in units of map resolution
    pub truncation_boundary_factor: f32,
    /// Maximum integration weight of a voxel
    pub max_weight: u8,
}

impl Default for TsdfConfig {
    fn default() -> Self {
        Self {
            truncation_boundary_factor: 8.0,
            max_weight: 100,
        }
    }
}

impl TsdfField {
    /// Weighted-average update with `value` in [-1, 1].
    pub fn update(&mut self, value: f32, config: &TsdfConfig) -> bool {
        let w = self.weight as f32;
        let tsdf = (self.tsdf as f32 / TSDF_SCALE * w + value) / (w + 1.0);
        self.tsdf = (tsdf.clamp(-1.0, 1.0) * TSDF_SCALE) as i16;
        let newly_observed = self.weight == 0;
        self.weight = self.weight.saturating_add(1).min(config.max_weight);
        newly_observed
    }
}

impl FieldData for TsdfField {
    type Config = TsdfConfig;

    fn field(&self) -> f32 {
        self.tsdf as f32 / TSDF_SCALE
    }

    fn valid(&self) -> bool {
        self.weight > 0
    }

    fn is_inside(&self) -> bool {
        self.field() < 0.0
    }

    fn observed(&self) -> bool {
        self.valid()
    }

    fn surface_value(&self) -> f32 {
        self.field()
    }

    fn weight(&self) -> u32 {
        self.weight as u32
    }

    fn set_observed(&mut self, _observed: bool) {}

    fn up_prop_mean(children: &[Self]) -> Self {
        let valid: Vec<&Self> = children.iter().filter(|c| c.valid()).collect();
        if valid.is_empty() {
            return Self::default();
        }
        let n = valid.len() as f32;
        let tsdf = valid.iter().map(|c| c.tsdf as f32).sum::<f32>() / n;
        let weight = (valid.iter().map(|c| c.weight as f32).sum::<f32>() / n).round() as u8;
        Self {
            tsdf: tsdf as i16,
            weight: weight.max(1),
        }
    }
}

/// Colour facet. Disabled maps use `()`.
pub trait ColourData:
    Clone + Copy + Debug + Default + PartialEq + Send + Sync + 'static
{
    const ENABLED: bool;

    fn update(&mut self, sample: Rgb, max_weight: u8);

    fn rgb(&self) -> Option<Rgb> {
        None
    }
}

impl ColourData for () {
    const ENABLED: bool = false;

    fn update(&mut self, _sample: Rgb, _max_weight: u8) {}
}

/// Weighted-mean RGB accumulator
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ColourRecord {
    pub rgb: Rgb,
    pub weight: u8,
}

impl ColourData for ColourRecord {
    const ENABLED: bool = true;

    fn update(&mut self, sample: Rgb, max_weight: u8) {
        let w = self.weight as f32;
        let mix = |old: u8, new: u8| ((old as f32 * w + new as f32) / (w + 1.0)) as u8;
        self.rgb = Rgb::new(
            mix(self.rgb.r, sample.r),
            mix(self.rgb.g, sample.g),
            mix(self.rgb.b, sample.b),
        );
        self.weight = self.weight.saturating_add(1).min(max_weight);
    }

    fn rgb(&self) -> Option<Rgb> {
        if self.weight > 0 {
            Some(self.rgb)
        } else {
            None
        }
    }
}

/// Identifier of an unmapped region
pub const ID_UNMAPPED: u16 = u16::MAX;

/// Identifier facet. Disabled maps use `()`.
pub trait IdData:
    Clone + Copy + Debug + Default + PartialEq + Send + Sync + 'static
{
    const ENABLED: bool;

    fn update(&mut self, sample: u16);

    fn id(&self) -> Option<u16> {
        None
    }
}

impl IdData for () {
    const ENABLED: bool = false;

    fn update(&mut self, _sample: u16) {}
}

/// Sticky 16-bit identifier: once set to a non-zero value it is never
/// overwritten by a zero input.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct IdRecord {
    pub id: u16,
}

impl IdData for IdRecord {
    const ENABLED: bool = true;

    fn update(&mut self, sample: u16) {
        if sample != 0 {
            self.id = sample;
        }
    }

    fn id(&self) -> Option<u16> {
        if self.id != 0 {
            Some(self.id)
        } else {
            None
        }
    }
}

/// One voxel record: field + optional colour + optional identifier
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Voxel<F: FieldData, C: ColourData = (), I: IdData = ()> {
    pub field: F,
    pub colour: C,
    pub id: I,
}

// Common map configurations
pub type OccupancyVoxel = Voxel<OccupancyField>;
pub type OccupancyColVoxel = Voxel<OccupancyField, ColourRecord>;
pub type OccupancyColIdVoxel = Voxel<OccupancyField, ColourRecord, IdRecord>;
pub type TsdfVoxel = Voxel<TsdfField>;
pub type TsdfColVoxel = Voxel<TsdfField, ColourRecord>;

/// Surface thickness for a measured depth: `k_tau * depth` clamped to the
/// configured bounds scaled by the map resolution.
pub fn compute_tau(depth: f32, tau_min: f32, tau_max: f32, config: &OccupancyConfig) -> f32 {
    (config.k_tau * depth).clamp(tau_min, tau_max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_occupancy_update_free() {
        let config = OccupancyConfig::default();
        let mut f = OccupancyField::default();
        assert!(!f.valid());
        let newly = f.update(config.log_odd_min, &config);
        assert!(newly);
        assert!(f.valid());
        assert!(f.observed);
        assert!((f.occupancy - config.log_odd_min).abs() < 1e-5);
        assert!(f.field() < 0.0);
        assert!(!f.is_inside());
        // Second update is not newly observed
        assert!(!f.update(config.log_odd_min, &config));
        assert_eq!(f.weight, 2);
    }

    #[test]
    fn test_occupancy_field_clamp() {
        let config = OccupancyConfig::default();
        let mut f = OccupancyField::default();
        for _ in 0..200 {
            f.update(config.log_odd_min, &config);
        }
        assert_eq!(f.weight, config.max_weight);
        assert!(f.field() >= config.min_occupancy - 1e-3);
        assert!(f.occupancy >= config.log_odd_min - 1e-5);
    }

    #[test]
    fn test_tsdf_update() {
        let config = TsdfConfig::default();
        let mut f = TsdfField::default();
        assert!(!f.valid());
        assert!((f.field() - 1.0).abs() < 1e-3);
        f.update(-0.5, &config);
        assert!(f.valid());
        assert!((f.field() + 0.5).abs() < 1e-3);
        assert!(f.is_inside());
    }

    #[test]
    fn test_colour_mean() {
        let mut c = ColourRecord::default();
        c.update(Rgb::new(100, 0, 200), 10);
        c.update(Rgb::new(200, 0, 0), 10);
        let rgb = c.rgb().unwrap();
        assert_eq!(rgb.r, 150);
        assert_eq!(rgb.b, 100);
    }

    #[test]
    fn test_id_sticky() {
        let mut id = IdRecord::default();
        id.update(0);
        assert_eq!(id.id(), None);
        id.update(42);
        id.update(0);
        assert_eq!(id.id(), Some(42));
        id.update(7);
        assert_eq!(id.id(), Some(7));
    }

    #[test]
    fn test_compute_tau() {
        let config = OccupancyConfig::default();
        let res = 0.1;
        let tau_min = config.tau_min_factor * res;
        let tau_max = config.tau_max_factor * res;
        assert_eq!(compute_tau(1.0, tau_min, tau_max, &config), tau_min);
        assert_eq!(compute_tau(100.0, tau_min, tau_max, &config), tau_max);
        let mid = compute_tau(20.0, tau_min, tau_max, &config);
        assert!((mid - 0.52).abs() < 1e-5);
    }
}

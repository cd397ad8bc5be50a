//! Read-only octree queries
//!
//! Point lookups, trilinear interpolation and central-difference gradients
//! over a structure where neighbouring samples may live at different scales
//! or in different blocks. All sample points use the half-voxel offset
//! convention: the sample of a voxel sits at its corner plus half its edge.
//!
//! Queries return `None` rather than erroring, since missing data is a
//! normal map state.

use crate::core::types::{IVec3, Scale, Vec3};
use crate::image::Rgb;
use crate::map::data::{ColourData, FieldData, IdData, Voxel};
use crate::octree::fetcher;
use crate::octree::pool::OctantId;
use crate::octree::Octree;

/// Offsets of the eight trilinear interpolation corners. Bit 0 of the index
/// is the x offset, bit 1 the y offset, bit 2 the z offset.
const INTERP_OFFSETS: [IVec3; 8] = [
    IVec3::new(0, 0, 0),
    IVec3::new(1, 0, 0),
    IVec3::new(0, 1, 0),
    IVec3::new(1, 1, 0),
    IVec3::new(0, 0, 1),
    IVec3::new(1, 0, 1),
    IVec3::new(0, 1, 1),
    IVec3::new(1, 1, 1),
];

/// Voxel data at `coord`, at the scale it is stored at. The initial data if
/// the branch is unallocated.
pub fn get_data<F: FieldData, C: ColourData, I: IdData>(
    octree: &Octree<F, C, I>,
    coord: IVec3,
) -> Voxel<F, C, I> {
    match fetcher::leaf(octree, coord) {
        Some(OctantId::Block(b)) => *octree.block(b).data_current(coord),
        Some(OctantId::Node(n)) => octree.node(n).data(),
        None => *octree.init_data(),
    }
}

/// Voxel data at `coord` and `desired_scale` or coarser. Returns the data
/// and the scale it came from; for data stored in a node the scale is the
/// node's size scale.
pub fn get_data_at<F: FieldData, C: ColourData, I: IdData>(
    octree: &Octree<F, C, I>,
    coord: IVec3,
    desired_scale: Scale,
) -> (Voxel<F, C, I>, Scale) {
    match fetcher::leaf(octree, coord) {
        Some(OctantId::Block(b)) => {
            let block = octree.block(b);
            let (data, scale) = block.data_fallup(coord, desired_scale);
            (*data, scale)
        }
        Some(OctantId::Node(n)) => {
            let node = octree.node(n);
            (node.data(), octree.max_scale() - octree.depth_of_size(node.size))
        }
        None => (*octree.init_data(), desired_scale),
    }
}

/// Minimum field data at `coord` and `desired_scale` or coarser
pub fn get_min_data_at<F: FieldData, C: ColourData, I: IdData>(
    octree: &Octree<F, C, I>,
    coord: IVec3,
    desired_scale: Scale,
) -> (F, Scale) {
    match fetcher::leaf(octree, coord) {
        Some(OctantId::Block(b)) => {
            let block = octree.block(b);
            let scale = desired_scale.max(block.current_scale());
            (block.min_data_at(coord, scale), scale)
        }
        Some(OctantId::Node(n)) => {
            let node = octree.node(n);
            (node.min_data, octree.max_scale() - octree.depth_of_size(node.size))
        }
        None => (F::default(), desired_scale),
    }
}

/// Maximum field data at `coord` and `desired_scale` or coarser
pub fn get_max_data_at<F: FieldData, C: ColourData, I: IdData>(
    octree: &Octree<F, C, I>,
    coord: IVec3,
    desired_scale: Scale,
) -> (F, Scale) {
    match fetcher::leaf(octree, coord) {
        Some(OctantId::Block(b)) => {
            let block = octree.block(b);
            let scale = desired_scale.max(block.current_scale());
            (block.max_data_at(coord, scale), scale)
        }
        Some(OctantId::Node(n)) => {
            let node = octree.node(n);
            (node.max_data, octree.max_scale() - octree.depth_of_size(node.size))
        }
        None => (F::default(), desired_scale),
    }
}

/// Field value at `coord` if the voxel has been observed
pub fn get_field<F: FieldData, C: ColourData, I: IdData>(
    octree: &Octree<F, C, I>,
    coord: IVec3,
) -> Option<f32> {
    let data = get_data(octree, coord);
    if data.field.valid() {
        Some(data.field.field())
    } else {
        None
    }
}

fn sample_octant<F: FieldData, C: ColourData, I: IdData>(
    octree: &Octree<F, C, I>,
    leaf: OctantId,
    coord: IVec3,
    scale: Scale,
) -> Voxel<F, C, I> {
    match leaf {
        OctantId::Block(b) => *octree.block(b).data_at(coord, scale),
        OctantId::Node(n) => octree.node(n).data(),
    }
}

/// Gather the data of the eight interpolation corners around `base` at
/// `scale`. The corners may span up to eight octants: a 3-bit cross mask
/// (one bit per axis that leaves the base octant) partitions them into 1, 2,
/// 4 or 8 fetch groups. Fails if any required octant is missing or stores
/// its data coarser than `scale`.
fn get_neighbours<F: FieldData, C: ColourData, I: IdData>(
    octree: &Octree<F, C, I>,
    base: IVec3,
    scale: Scale,
    out: &mut [Voxel<F, C, I>; 8],
) -> bool {
    let stride = 1 << scale;
    if base.min_element() < 0 || (base + IVec3::splat(stride)).max_element() >= octree.size() {
        return false;
    }

    let base_leaf = match fetcher::leaf(octree, base) {
        Some(leaf) => leaf,
        None => return false,
    };

    let crosses = |octant_size: i32| {
        let mask = octant_size - 1;
        [
            (base.x & mask) == octant_size - stride,
            (base.y & mask) == octant_size - stride,
            (base.z & mask) == octant_size - stride,
        ]
    };
    let mut cross = crosses(octree.octant_size(base_leaf));
    if cross.iter().any(|&c| c) && !base_leaf.is_block() {
        // Within a leaf node the corners never change data, the mask only
        // matters at block granularity.
        cross = crosses(octree.block_size());
    }

    let group_of = |i: usize| {
        (if cross[0] { i & 1 } else { 0 })
            | (if cross[1] { i & 2 } else { 0 })
            | (if cross[2] { i & 4 } else { 0 })
    };

    let mut groups: [Option<OctantId>; 8] = [None; 8];
    for i in 0..8 {
        if group_of(i) != i {
            continue;
        }
        let leaf = match fetcher::leaf(octree, base + stride * INTERP_OFFSETS[i]) {
            Some(leaf) => leaf,
            None => return false,
        };
        if let OctantId::Block(b) = leaf {
            if octree.block(b).current_scale() > scale {
                return false;
            }
        }
        groups[i] = Some(leaf);
    }

    for i in 0..8 {
        let leaf = groups[group_of(i)].expect("fetch group filled above");
        out[i] = sample_octant(octree, leaf, base + stride * INTERP_OFFSETS[i], scale);
    }
    true
}

fn trilinear<T>(data: [T; 8], t: Vec3) -> T
where
    T: Copy + std::ops::Add<Output = T> + std::ops::Mul<f32, Output = T>,
{
    let lerp = |a: T, b: T, t: f32| a * (1.0 - t) + b * t;
    let c00 = lerp(data[0], data[1], t.x);
    let c10 = lerp(data[2], data[3], t.x);
    let c01 = lerp(data[4], data[5], t.x);
    let c11 = lerp(data[6], data[7], t.x);
    lerp(lerp(c00, c10, t.y), lerp(c01, c11, t.y), t.z)
}

/// Interpolate a derived value at `p_f` (fractional voxel coordinates) and
/// `desired_scale` or coarser. `valid` decides whether a sample may be used,
/// `get` extracts the interpolated quantity.
pub fn interp<F, C, I, T>(
    octree: &Octree<F, C, I>,
    p_f: Vec3,
    desired_scale: Scale,
    valid: impl Fn(&Voxel<F, C, I>) -> bool,
    get: impl Fn(&Voxel<F, C, I>) -> T,
) -> Option<(T, Scale)>
where
    F: FieldData,
    C: ColourData,
    I: IdData,
    T: Copy + std::ops::Add<Output = T> + std::ops::Mul<f32, Output = T>,
{
    let voxel = IVec3::new(p_f.x.floor() as i32, p_f.y.floor() as i32, p_f.z.floor() as i32);
    let octant = fetcher::leaf(octree, voxel)?;
    let (init_scale, node_scale) = match octant {
        OctantId::Block(b) => (octree.block(b).current_scale().max(desired_scale), None),
        OctantId::Node(n) => (
            0,
            Some(octree.max_scale() - octree.depth_of_size(octree.node(n).size)),
        ),
    };

    for scale in init_scale..=octree.max_block_scale() {
        let stride = 1 << scale;
        let base_f = p_f / stride as f32 - Vec3::splat(0.5);
        let base = IVec3::new(
            base_f.x.floor() as i32,
            base_f.y.floor() as i32,
            base_f.z.floor() as i32,
        ) * stride;
        if !octree.aabb().contains(base) {
            return None;
        }

        let mut data = [Voxel::<F, C, I>::default(); 8];
        if !get_neighbours(octree, base, scale, &mut data) {
            continue;
        }
        if !data.iter().all(&valid) {
            return None;
        }

        let t = base_f - base_f.floor();
        let samples = [
            get(&data[0]),
            get(&data[1]),
            get(&data[2]),
            get(&data[3]),
            get(&data[4]),
            get(&data[5]),
            get(&data[6]),
            get(&data[7]),
        ];
        let returned_scale = node_scale.unwrap_or(scale);
        return Some((trilinear(samples, t), returned_scale));
    }
    None
}

/// Interpolated field value at `p_f` and `desired_scale` or coarser
pub fn interp_field<F: FieldData, C: ColourData, I: IdData>(
    octree: &Octree<F, C, I>,
    p_f: Vec3,
    desired_scale: Scale,
) -> Option<(f32, Scale)> {
    interp(
        octree,
        p_f,
        desired_scale,
        |v| v.field.valid(),
        |v| v.field.field(),
    )
}

/// Interpolated colour at `p_f` and `desired_scale` or coarser
pub fn interp_colour<F: FieldData, C: ColourData, I: IdData>(
    octree: &Octree<F, C, I>,
    p_f: Vec3,
    desired_scale: Scale,
) -> Option<(Rgb, Scale)> {
    if !C::ENABLED {
        return None;
    }
    let (rgb, scale) = interp(
        octree,
        p_f,
        desired_scale,
        |v| v.field.valid() && v.colour.rgb().is_some(),
        |v| {
            let rgb = v.colour.rgb().unwrap_or_default();
            Vec3::new(rgb.r as f32, rgb.g as f32, rgb.b as f32)
        },
    )?;
    Some((
        Rgb::new(
            rgb.x.round().clamp(0.0, 255.0) as u8,
            rgb.y.round().clamp(0.0, 255.0) as u8,
            rgb.z.round().clamp(0.0, 255.0) as u8,
        ),
        scale,
    ))
}

/// The 32 sample coordinates of the gradient stencil around `base`, clamped
/// to the octree volume.
fn gradient_sample_coords<F: FieldData, C: ColourData, I: IdData>(
    octree: &Octree<F, C, I>,
    base: IVec3,
    scale: Scale,
) -> [IVec3; 32] {
    let stride = 1 << scale;
    let lo = IVec3::ZERO;
    let hi = IVec3::splat(octree.size() - 1);

    let ll = (base - IVec3::splat(stride)).max(lo);
    let lu = base;
    let ul = (base + IVec3::splat(stride)).min(hi);
    let uu = (base + IVec3::splat(2 * stride)).min(hi);

    [
        IVec3::new(ll.x, lu.y, lu.z),
        IVec3::new(ll.x, ul.y, lu.z),
        IVec3::new(ll.x, lu.y, ul.z),
        IVec3::new(ll.x, ul.y, ul.z),
        IVec3::new(lu.x, ll.y, lu.z),
        IVec3::new(lu.x, ll.y, ul.z),
        IVec3::new(lu.x, lu.y, ll.z),
        IVec3::new(lu.x, lu.y, lu.z),
        IVec3::new(lu.x, lu.y, ul.z),
        IVec3::new(lu.x, lu.y, uu.z),
        IVec3::new(lu.x, ul.y, ll.z),
        IVec3::new(lu.x, ul.y, lu.z),
        IVec3::new(lu.x, ul.y, ul.z),
        IVec3::new(lu.x, ul.y, uu.z),
        IVec3::new(lu.x, uu.y, lu.z),
        IVec3::new(lu.x, uu.y, ul.z),
        IVec3::new(ul.x, ll.y, lu.z),
        IVec3::new(ul.x, ll.y, ul.z),
        IVec3::new(ul.x, lu.y, ll.z),
        IVec3::new(ul.x, lu.y, lu.z),
        IVec3::new(ul.x, lu.y, ul.z),
        IVec3::new(ul.x, lu.y, uu.z),
        IVec3::new(ul.x, ul.y, ll.z),
        IVec3::new(ul.x, ul.y, lu.z),
        IVec3::new(ul.x, ul.y, ul.z),
        IVec3::new(ul.x, ul.y, uu.z),
        IVec3::new(ul.x, uu.y, lu.z),
        IVec3::new(ul.x, uu.y, ul.z),
        IVec3::new(uu.x, lu.y, lu.z),
        IVec3::new(uu.x, ul.y, lu.z),
        IVec3::new(uu.x, lu.y, ul.z),
        IVec3::new(uu.x, ul.y, ul.z),
    ]
}

/// Central-difference gradient from the 32-point stencil, scaled by half the
/// voxel size at `scale`.
fn gradient(t: Vec3, data: &[f32; 32], scale: Scale) -> Vec3 {
    let scaling = 0.5 / (1 << scale) as f32;
    let tc = Vec3::ONE - t;

    let gx = scaling
        * ((((data[19] - data[0]) * tc.x + (data[28] - data[7]) * t.x) * tc.y
            + ((data[23] - data[1]) * tc.x + (data[29] - data[11]) * t.x) * t.y)
            * tc.z
            + (((data[20] - data[2]) * tc.x + (data[30] - data[8]) * t.x) * tc.y
                + ((data[24] - data[3]) * tc.x + (data[31] - data[12]) * t.x) * t.y)
                * t.z);

    let gy = scaling
        * ((((data[11] - data[4]) * tc.x + (data[23] - data[16]) * t.x) * tc.y
            + ((data[14] - data[7]) * tc.x + (data[26] - data[19]) * t.x) * t.y)
            * tc.z
            + (((data[12] - data[5]) * tc.x + (data[24] - data[17]) * t.x) * tc.y
                + ((data[15] - data[8]) * tc.x + (data[27] - data[20]) * t.x) * t.y)
                * t.z);

    let gz = scaling
        * ((((data[8] - data[6]) * tc.x + (data[20] - data[18]) * t.x) * tc.y
            + ((data[12] - data[10]) * tc.x + (data[24] - data[22]) * t.x) * t.y)
            * tc.z
            + (((data[9] - data[7]) * tc.x + (data[21] - data[19]) * t.x) * tc.y
                + ((data[13] - data[11]) * tc.x + (data[25] - data[23]) * t.x) * t.y)
                * t.z);

    Vec3::new(gx, gy, gz)
}

/// Field gradient at `p_f` and `desired_scale` or coarser. All 32 stencil
/// samples must come from the same scale; over a leaf node the field is
/// constant and the gradient zero.
pub fn grad_field<F: FieldData, C: ColourData, I: IdData>(
    octree: &Octree<F, C, I>,
    p_f: Vec3,
    desired_scale: Scale,
) -> Option<(Vec3, Scale)> {
    let voxel = IVec3::new(p_f.x.floor() as i32, p_f.y.floor() as i32, p_f.z.floor() as i32);
    let octant = fetcher::finest_octant(octree, voxel, desired_scale)?;

    let init_scale = match octant {
        OctantId::Block(b) => octree.block(b).current_scale().max(desired_scale),
        OctantId::Node(n) => {
            let node = octree.node(n);
            // Uniform region: zero gradient if observed, unknown otherwise.
            let data: Voxel<F, C, I> = node.data();
            if node.is_leaf() && data.field.valid() {
                let node_scale = octree.max_scale() - octree.depth_of_size(node.size);
                return Some((Vec3::ZERO, node_scale));
            }
            return None;
        }
    };

    for scale in init_scale..=octree.max_block_scale() {
        let stride = 1 << scale;
        let scaled_f = p_f / stride as f32 - Vec3::splat(0.5);
        let base = IVec3::new(
            scaled_f.x.floor() as i32,
            scaled_f.y.floor() as i32,
            scaled_f.z.floor() as i32,
        ) * stride;

        let base_octant = match fetcher::finest_octant(octree, base, scale) {
            Some(o) => o,
            None => continue,
        };
        if let OctantId::Node(n) = base_octant {
            let node = octree.node(n);
            let data: Voxel<F, C, I> = node.data();
            if node.is_leaf() && data.field.valid() {
                let node_scale = octree.max_scale() - octree.depth_of_size(node.size);
                return Some((Vec3::ZERO, node_scale));
            }
            continue;
        }

        let coords = gradient_sample_coords(octree, base, scale);
        let mut samples = [0.0f32; 32];
        let mut all_valid = true;
        for (i, coord) in coords.iter().enumerate() {
            let (data, returned_scale) = get_data_at(octree, *coord, scale);
            if returned_scale != scale || !data.field.valid() {
                all_valid = false;
                break;
            }
            samples[i] = data.field.field();
        }
        if !all_valid {
            continue;
        }

        let t = scaled_f - scaled_f.floor();
        return Some((gradient(t, &samples, scale), scale));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::data::{OccupancyConfig, OccupancyField};

    type TestOctree = Octree<OccupancyField>;

    /// Two adjacent blocks with uniform fields, mip levels filled by hand
    fn seam_octree(left_field: f32, right_field: f32) -> TestOctree {
        let mut octree = TestOctree::new(16, 8).unwrap();
        let root = octree.root();
        let (left, _) = octree.allocate_child(root, 0);
        let (right, _) = octree.allocate_child(root, 1);
        for (id, field) in [(left, left_field), (right, right_field)] {
            let block_id = id.as_block().unwrap();
            let block = octree.block_mut(block_id);
            block.allocate_down_to(0);
            // weight 2 so occupancy = field / 2 stays within the update range
            for scale in 0..=3 {
                for v in block.data_slice_at_scale_mut(scale) {
                    v.field = OccupancyField {
                        occupancy: field / 2.0,
                        weight: 2,
                        observed: true,
                    };
                }
            }
        }
        octree
    }

    #[test]
    fn test_get_data_unallocated() {
        let octree = TestOctree::new(16, 8).unwrap();
        let data = get_data(&octree, IVec3::new(3, 3, 3));
        assert!(!data.field.valid());
        assert_eq!(get_field(&octree, IVec3::new(3, 3, 3)), None);
    }

    #[test]
    fn test_interp_across_block_seam() {
        let octree = seam_octree(0.0, 1.0);
        // Sample points sit at voxel centres, so x = 8.0 is midway between
        // the last column of the left block and the first of the right.
        let (value, scale) = interp_field(&octree, Vec3::new(8.0, 4.0, 4.0), 0).unwrap();
        assert_eq!(scale, 0);
        assert!((value - 0.5).abs() < 1e-5);
        // Inside the left block the field is uniform
        let (value, _) = interp_field(&octree, Vec3::new(4.0, 4.0, 4.0), 0).unwrap();
        assert!(value.abs() < 1e-5);
    }

    #[test]
    fn test_interp_desired_scale_fall_up() {
        let octree = seam_octree(0.0, 1.0);
        // Coarser mip data gives the same answer at the seam
        let (value, scale) = interp_field(&octree, Vec3::new(8.0, 4.0, 4.0), 2).unwrap();
        assert_eq!(scale, 2);
        assert!((value - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_interp_falls_up_past_coarse_block() {
        let mut octree = seam_octree(0.0, 1.0);
        // Make the right block store its data at scale 1 only
        let right = fetcher::block(&octree, IVec3::new(8, 0, 0)).unwrap();
        octree.block_mut(right).delete_up_to(1);
        let (value, scale) = interp_field(&octree, Vec3::new(8.0, 4.0, 4.0), 0).unwrap();
        assert_eq!(scale, 1);
        assert!((value - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_interp_unobserved_returns_none() {
        let octree = TestOctree::new(16, 8).unwrap();
        assert!(interp_field(&octree, Vec3::new(8.0, 4.0, 4.0), 0).is_none());
    }

    #[test]
    fn test_gradient_planar_field() {
        let mut octree = TestOctree::new(16, 8).unwrap();
        let root = octree.root();
        let (child, _) = octree.allocate_child(root, 0);
        let block_id = child.as_block().unwrap();
        let block = octree.block_mut(block_id);
        block.allocate_down_to(0);
        // field(x, y, z) = x - 4 exactly (weight 1)
        let coord = block.coord;
        for z in 0..8 {
            for y in 0..8 {
                for x in 0..8 {
                    let idx = block.voxel_idx(coord + IVec3::new(x, y, z), 0);
                    block.data_slice_at_scale_mut(0)[idx].field = OccupancyField {
                        occupancy: (x - 4) as f32,
                        weight: 1,
                        observed: true,
                    };
                }
            }
        }

        for p in [
            Vec3::new(2.5, 2.5, 2.5),
            Vec3::new(3.5, 4.5, 2.5),
            Vec3::new(5.5, 5.5, 5.5),
        ] {
            let (grad, scale) = grad_field(&octree, p, 0).unwrap();
            assert_eq!(scale, 0);
            assert!(
                (grad - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-4,
                "gradient {:?} at {:?}",
                grad,
                p
            );
        }
    }

    #[test]
    fn test_gradient_over_leaf_node_is_zero() {
        let mut octree = TestOctree::new(16, 8).unwrap();
        let root = octree.root();
        let node = octree.node_mut(root);
        node.min_data = OccupancyField {
            occupancy: -5.0,
            weight: 10,
            observed: true,
        };
        node.max_data = node.min_data;
        let (grad, scale) = grad_field(&octree, Vec3::splat(8.0), 0).unwrap();
        assert_eq!(grad, Vec3::ZERO);
        assert_eq!(scale, 4);
    }
}

//! Dense min/max pooling over a depth image
//!
//! The volume carver needs the minimum and maximum depth inside an arbitrary
//! pixel rectangle for every octant it visits. A mip pyramid of per-cell
//! min/max values answers those queries in O(1): a query picks the pyramid
//! level whose cells cover the rectangle with at most 2x2 cells and combines
//! them. The answer is conservative (the covered region may be slightly
//! larger than the rectangle), which only ever makes the carver allocate a
//! little more, never less.

use crate::image::Image;

/// Aggregate over a pixel rectangle
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoolingValue {
    /// Minimum valid depth in the region, `f32::INFINITY` if none
    pub min: f32,
    /// Maximum valid depth in the region, `f32::NEG_INFINITY` if none
    pub max: f32,
    /// Whether the region contains any valid measurement
    pub has_valid: bool,
    /// Whether the region contains any invalid pixel (no measurement)
    pub has_gap: bool,
}

impl PoolingValue {
    fn invalid() -> Self {
        Self {
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
            has_valid: false,
            has_gap: true,
        }
    }

    fn from_depth(depth: f32, min_valid: f32) -> Self {
        if depth.is_finite() && depth >= min_valid {
            Self {
                min: depth,
                max: depth,
                has_valid: true,
                has_gap: false,
            }
        } else {
            Self::invalid()
        }
    }

    fn combine(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            has_valid: self.has_valid || other.has_valid,
            has_gap: self.has_gap || other.has_gap,
        }
    }
}

/// Min/max mip pyramid over a single-channel image
pub struct PoolingImage {
    width: u32,
    height: u32,
    /// `levels[k]` has cell edge `2^k` pixels; `levels[0]` is the input
    levels: Vec<Vec<PoolingValue>>,
    /// Width in cells of each level
    level_widths: Vec<u32>,
}

impl PoolingImage {
    /// Build the pyramid. Pixels below `min_valid` (or NaN) count as "no
    /// measurement".
    pub fn new(img: &Image<f32>, min_valid: f32) -> Self {
        let width = img.width();
        let height = img.height();

        let mut levels = Vec::new();
        let mut level_widths = Vec::new();

        let base: Vec<PoolingValue> = img
            .pixels()
            .iter()
            .map(|&d| PoolingValue::from_depth(d, min_valid))
            .collect();
        levels.push(base);
        level_widths.push(width);

        let mut w = width;
        let mut h = height;
        while w > 1 || h > 1 {
            let nw = w.div_ceil(2);
            let nh = h.div_ceil(2);
            let prev = levels.last().unwrap();
            let prev_w = w;
            let mut next = Vec::with_capacity((nw * nh) as usize);
            for cy in 0..nh {
                for cx in 0..nw {
                    let mut v = PoolingValue::invalid();
                    v.has_gap = false;
                    let mut first = true;
                    for dy in 0..2u32 {
                        for dx in 0..2u32 {
                            let px = cx * 2 + dx;
                            let py = cy * 2 + dy;
                            if px < w && py < h {
                                let p = prev[(py * prev_w + px) as usize];
                                v = if first { p } else { v.combine(p) };
                                first = false;
                            }
                        }
                    }
                    next.push(v);
                }
            }
            levels.push(next);
            level_widths.push(nw);
            w = nw;
            h = nh;
        }

        Self {
            width,
            height,
            levels,
            level_widths,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Maximum valid value over the whole image
    pub fn image_max(&self) -> f32 {
        self.levels.last().unwrap()[0].max
    }

    /// Conservative min/max over the rectangle `[x0, x1] x [y0, y1]`
    /// (inclusive, clamped to the image).
    pub fn query(&self, x0: i32, y0: i32, x1: i32, y1: i32) -> PoolingValue {
        let x0 = x0.clamp(0, self.width as i32 - 1) as u32;
        let x1 = x1.clamp(0, self.width as i32 - 1) as u32;
        let y0 = y0.clamp(0, self.height as i32 - 1) as u32;
        let y1 = y1.clamp(0, self.height as i32 - 1) as u32;
        if x1 < x0 || y1 < y0 {
            return PoolingValue::invalid();
        }

        let extent = (x1 - x0 + 1).max(y1 - y0 + 1);
        // Smallest level whose cell edge is >= the rectangle extent, so the
        // rectangle overlaps at most 2x2 cells.
        let mut level = if extent <= 1 {
            0
        } else {
            32 - (extent - 1).leading_zeros()
        };
        if level as usize >= self.levels.len() {
            level = self.levels.len() as u32 - 1;
        }
        let cell = 1u32 << level;
        let lw = self.level_widths[level as usize];
        let cells = &self.levels[level as usize];

        let cx0 = x0 / cell;
        let cx1 = x1 / cell;
        let cy0 = y0 / cell;
        let cy1 = y1 / cell;

        let mut out = cells[(cy0 * lw + cx0) as usize];
        for cy in cy0..=cy1 {
            for cx in cx0..=cx1 {
                if cx == cx0 && cy == cy0 {
                    continue;
                }
                out = out.combine(cells[(cy * lw + cx) as usize]);
            }
        }
        out
    }

    /// Query with horizontal wrap-around, for cylindrical range images. When
    /// `x0 > x1` the rectangle wraps across the right image edge.
    pub fn query_wrapped(&self, x0: i32, y0: i32, x1: i32, y1: i32) -> PoolingValue {
        if x0 <= x1 {
            self.query(x0, y0, x1, y1)
        } else {
            let left = self.query(0, y0, x1, y1);
            let right = self.query(x0, y0, self.width as i32 - 1, y1);
            left.combine(right)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_image() -> Image<f32> {
        // 4x4 depth image, one NaN hole
        let data = vec![
            1.0, 2.0, 3.0, 4.0,
            5.0, 6.0, 7.0, 8.0,
            f32::NAN, 2.5, 3.5, 4.5,
            1.5, 2.0, 9.0, 0.5,
        ];
        Image::from_data(4, 4, data)
    }

    #[test]
    fn test_full_image_query() {
        let pool = PoolingImage::new(&test_image(), 0.1);
        let v = pool.query(0, 0, 3, 3);
        assert_eq!(v.min, 0.5);
        assert_eq!(v.max, 9.0);
        assert!(v.has_valid);
        assert!(v.has_gap); // the NaN pixel
        assert_eq!(pool.image_max(), 9.0);
    }

    #[test]
    fn test_single_pixel_query() {
        let pool = PoolingImage::new(&test_image(), 0.1);
        let v = pool.query(2, 1, 2, 1);
        assert_eq!(v.min, 7.0);
        assert_eq!(v.max, 7.0);
        assert!(!v.has_gap);
    }

    #[test]
    fn test_query_is_conservative() {
        let pool = PoolingImage::new(&test_image(), 0.1);
        // The exact min over [1,3]x[0,1] is 2.0; the pooled answer may cover
        // a larger region but must bound the true range.
        let v = pool.query(1, 0, 3, 1);
        assert!(v.min <= 2.0);
        assert!(v.max >= 8.0);
    }

    #[test]
    fn test_all_invalid() {
        let img = Image::new(2, 2, f32::NAN);
        let pool = PoolingImage::new(&img, 0.1);
        let v = pool.query(0, 0, 1, 1);
        assert!(!v.has_valid);
        assert!(v.has_gap);
    }

    #[test]
    fn test_wrapped_query() {
        let pool = PoolingImage::new(&test_image(), 0.1);
        // Wraps: columns 3 and 0
        let v = pool.query_wrapped(3, 0, 0, 3);
        assert_eq!(v.min, 0.5);
        assert!(v.max >= 4.5);
    }
}

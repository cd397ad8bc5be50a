//! Mathematical utilities and data structures

pub mod aabb;
pub mod morton;

pub use aabb::{Aabb, VoxelAabb};
pub use morton::{decode_morton_3d, encode_morton_3d};

/// Check that `x` is a power of two (zero is not)
pub fn is_power_of_two(x: u32) -> bool {
    x != 0 && x & (x - 1) == 0
}

/// Integer log2 of a power of two
pub fn log2_pow2(x: u32) -> u32 {
    debug_assert!(is_power_of_two(x));
    x.trailing_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_of_two() {
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(8));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(12));
    }

    #[test]
    fn test_log2() {
        assert_eq!(log2_pow2(1), 0);
        assert_eq!(log2_pow2(8), 3);
        assert_eq!(log2_pow2(1024), 10);
    }
}

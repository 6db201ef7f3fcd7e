//! Strata math types.
//!
//! Re-exports glam and adds the interval/bounding-box helpers the domain
//! locator and the reference adapter need.

// Re-export glam for convenience
pub use glam::*;

mod aabb;
mod interval;
pub use aabb::Aabb;
pub use interval::Interval;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec3_operations() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        let b = Vec3::new(4.0, 5.0, 6.0);
        assert_eq!(a + b, Vec3::new(5.0, 7.0, 9.0));
    }
}

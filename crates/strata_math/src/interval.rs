/// A closed range of ray parameters `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    pub min: f32,
    pub max: f32,
}

impl Interval {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// Length of the range; negative when empty.
    pub fn size(&self) -> f32 {
        self.max - self.min
    }

    /// Inclusive membership.
    pub fn contains(&self, x: f32) -> bool {
        self.min <= x && x <= self.max
    }

    /// Exclusive membership; hit tests use this so `min` itself never hits.
    pub fn surrounds(&self, x: f32) -> bool {
        self.min < x && x < self.max
    }

    /// Widen by `delta / 2` on each side.
    pub fn expand(&self, delta: f32) -> Interval {
        let padding = delta / 2.0;
        Interval::new(self.min - padding, self.max + padding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_inclusive_vs_exclusive() {
        let span = Interval::new(0.0, 10.0);

        assert!(span.contains(0.0) && span.contains(10.0));
        assert!(!span.surrounds(0.0) && !span.surrounds(10.0));
        assert!(span.surrounds(5.0));
        assert!(!span.contains(10.1));
    }

    #[test]
    fn test_expand_pads_both_sides() {
        let padded = Interval::new(1.0, 1.0).expand(0.5);

        assert_eq!(padded, Interval::new(0.75, 1.25));
        assert_eq!(padded.size(), 0.5);
    }
}

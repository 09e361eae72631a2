use crate::boundingbox::BoundingBox;

/// A `(dimension, value)` split on a box: a point is on the left iff
/// `point[dimension] <= value`. Ties go left; insertion and traversal both
/// depend on that policy.
#[derive(Clone, Debug, PartialEq)]
pub struct Cut {
    pub dimension: usize,
    pub value: f64,
}

impl Cut {
    pub fn new(dimension: usize, value: f64) -> Self {
        Cut { dimension, value }
    }

    pub fn is_left_of(&self, point: &[f64]) -> bool {
        point[self.dimension] <= self.value
    }

    /// Draws a random cut on `bounding_box` from a uniform `factor` in
    /// `[0, 1)`: the factor is scaled by the total range, dimensions are
    /// walked in order accumulating width, and the first dimension whose
    /// accumulated width exceeds the scaled draw carries the cut. The cut
    /// value is clipped into `[min, max)` of that dimension. Returns `None`
    /// for a degenerate (zero-range) box, on which no cut exists.
    pub fn random_cut(bounding_box: &BoundingBox, factor: f64) -> Option<Cut> {
        let total_range = bounding_box.range_sum();
        if total_range <= 0.0 {
            return None;
        }
        let mut remainder = factor * total_range;
        let mut last_nonzero: Option<usize> = None;

        for (dim, (&min, &max)) in bounding_box
            .min_values()
            .iter()
            .zip(bounding_box.max_values())
            .enumerate()
        {
            let width = max - min;
            if width > 0.0 {
                last_nonzero = Some(dim);
            }
            if remainder < width {
                let mut value = min + remainder;
                if value >= max {
                    value = min;
                }
                return Some(Cut::new(dim, value));
            }
            remainder -= width;
        }

        // rounding pushed the draw past the final width; land on the last
        // dimension with extent
        last_nonzero.map(|dim| Cut::new(dim, bounding_box.min_values()[dim]))
    }

    /// Whether this cut puts `point` strictly on one side and all of
    /// `enclosed` on the other.
    pub fn separates(&self, point: &[f64], enclosed: &BoundingBox) -> bool {
        let min = enclosed.min_values()[self.dimension];
        let max = enclosed.max_values()[self.dimension];
        let coordinate = point[self.dimension];
        (coordinate <= self.value && self.value < min)
            || (max <= self.value && self.value < coordinate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draw_walks_dimension_widths() {
        let b = BoundingBox::new(&[-1.0, -1.0], &[1.0, 1.0]).unwrap();
        // factor 0.625 on total range 4 lands 0.5 into the second dimension
        let cut = Cut::random_cut(&b, 0.625).unwrap();
        assert_eq!(cut.dimension, 1);
        assert!((cut.value + 0.5).abs() < 1e-12);

        // factor 0 lands at the very start of the first dimension
        let cut = Cut::random_cut(&b, 0.0).unwrap();
        assert_eq!(cut.dimension, 0);
        assert_eq!(cut.value, -1.0);
    }

    #[test]
    fn zero_width_dimensions_are_skipped() {
        let b = BoundingBox::new(&[0.0, 1.0], &[0.0, 3.0]).unwrap();
        for factor in [0.0, 0.25, 0.5, 0.99] {
            let cut = Cut::random_cut(&b, factor).unwrap();
            assert_eq!(cut.dimension, 1);
            assert!(cut.value >= 1.0 && cut.value < 3.0);
        }
    }

    #[test]
    fn degenerate_box_has_no_cut() {
        let b = BoundingBox::of_point(&[2.0, 2.0]);
        assert!(Cut::random_cut(&b, 0.5).is_none());
    }

    #[test]
    fn ties_go_left() {
        let cut = Cut::new(0, 1.0);
        assert!(cut.is_left_of(&[1.0]));
        assert!(!cut.is_left_of(&[1.0 + f64::EPSILON * 2.0]));
    }

    #[test]
    fn cut_dimension_distribution_matches_widths() {
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha20Rng;

        // widths 4, 1, 3 over a total range of 8
        let b = BoundingBox::new(&[0.0, 0.0, 0.0], &[4.0, 1.0, 3.0]).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(12345);
        let draws = 100_000;
        let mut counts = [0usize; 3];
        for _ in 0..draws {
            counts[Cut::random_cut(&b, rng.gen()).unwrap().dimension] += 1;
        }
        for (dim, expected) in [(0, 0.5), (1, 0.125), (2, 0.375)] {
            let share = counts[dim] as f64 / draws as f64;
            assert!(
                (share - expected).abs() < 0.01,
                "dimension {dim}: share {share} vs expected {expected}"
            );
        }
    }

    #[test]
    fn separation_requires_a_gap() {
        let enclosed = BoundingBox::new(&[0.0, 0.0], &[1.0, 1.0]).unwrap();
        // cut between the box and the point
        assert!(Cut::new(0, 1.5).separates(&[2.0, 0.5], &enclosed));
        // cut inside the box never separates
        assert!(!Cut::new(0, 0.5).separates(&[2.0, 0.5], &enclosed));
        // point on the left, box on the right
        assert!(Cut::new(1, -0.5).separates(&[0.5, -1.0], &enclosed));
    }
}

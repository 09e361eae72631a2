use crate::errors::ForestError;
use crate::types::Result;

/// Axis-aligned min/max box over a finite set of points.
///
/// The tree's cache mutates boxes in place through the `add_*` methods; the
/// `merged_with_*` methods are the value-style counterparts used on
/// insertion paths where the original box must stay intact.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundingBox {
    range_sum: f64,
    min_values: Vec<f64>,
    max_values: Vec<f64>,
}

impl BoundingBox {
    /// Degenerate box of a single point, `min = max = point`.
    pub fn of_point(point: &[f64]) -> Self {
        BoundingBox {
            range_sum: 0.0,
            min_values: point.to_vec(),
            max_values: point.to_vec(),
        }
    }

    pub fn new(first_values: &[f64], second_values: &[f64]) -> Result<Self> {
        if first_values.len() != second_values.len() {
            return Err(ForestError::InvalidDimension {
                expected: first_values.len(),
                actual: second_values.len(),
            });
        }
        let minv: Vec<f64> = first_values
            .iter()
            .zip(second_values)
            .map(|(x, y)| x.min(*y))
            .collect();
        let maxv: Vec<f64> = first_values
            .iter()
            .zip(second_values)
            .map(|(x, y)| x.max(*y))
            .collect();
        let sum = minv.iter().zip(&maxv).map(|(x, y)| y - x).sum();
        Ok(BoundingBox {
            min_values: minv,
            max_values: maxv,
            range_sum: sum,
        })
    }

    pub fn dimensions(&self) -> usize {
        self.min_values.len()
    }

    /// Grows the box to cover `point`; returns true when the box already
    /// contained it (the range sum did not change).
    pub fn add_point(&mut self, point: &[f64]) -> bool {
        self.add_two_arrays(point, point)
    }

    pub fn add_box(&mut self, other: &BoundingBox) -> bool {
        self.add_two_arrays(other.min_values(), other.max_values())
    }

    fn add_two_arrays(&mut self, minvalues: &[f64], maxvalues: &[f64]) -> bool {
        let old_sum = self.range_sum;
        for (x, y) in self.min_values.iter_mut().zip(minvalues) {
            *x = x.min(*y);
        }
        for (x, y) in self.max_values.iter_mut().zip(maxvalues) {
            *x = x.max(*y);
        }
        self.range_sum = self
            .min_values
            .iter()
            .zip(&self.max_values)
            .map(|(x, y)| y - x)
            .sum();
        old_sum == self.range_sum
    }

    /// Smallest box enclosing both `self` and `point`.
    pub fn merged_with_point(&self, point: &[f64]) -> Result<BoundingBox> {
        if point.len() != self.dimensions() {
            return Err(ForestError::InvalidDimension {
                expected: self.dimensions(),
                actual: point.len(),
            });
        }
        let mut merged = self.clone();
        merged.add_point(point);
        Ok(merged)
    }

    /// Smallest box enclosing both operands.
    pub fn merged_with_box(&self, other: &BoundingBox) -> Result<BoundingBox> {
        if other.dimensions() != self.dimensions() {
            return Err(ForestError::InvalidDimension {
                expected: self.dimensions(),
                actual: other.dimensions(),
            });
        }
        let mut merged = self.clone();
        merged.add_box(other);
        Ok(merged)
    }

    pub fn contains(&self, point: &[f64]) -> bool {
        self.min_values
            .iter()
            .zip(point)
            .zip(&self.max_values)
            .all(|((min, value), max)| min <= value && value <= max)
    }

    /// Sum of the side lengths, `Σ (max[i] - min[i])`; zero for a
    /// degenerate box.
    pub fn range_sum(&self) -> f64 {
        self.range_sum
    }

    pub fn min_values(&self) -> &[f64] {
        &self.min_values
    }

    pub fn max_values(&self) -> &[f64] {
        &self.max_values
    }

    /// Probability that a random cut on the box grown by `point` separates
    /// the point from the box.
    pub fn probability_of_cut(&self, point: &[f64]) -> f64 {
        let minsum: f64 = self
            .min_values
            .iter()
            .zip(point)
            .map(|(&x, &y)| (x - y).max(0.0))
            .sum();
        let maxsum: f64 = point
            .iter()
            .zip(&self.max_values)
            .map(|(&x, &y)| (x - y).max(0.0))
            .sum();
        let sum = maxsum + minsum;

        if sum == 0.0 {
            return 0.0;
        } else if self.range_sum == 0.0 {
            return 1.0;
        }
        sum / (self.range_sum + sum)
    }

    /// As `probability_of_cut`, with the flagged coordinates excluded from
    /// the extension.
    pub fn probability_of_cut_with_missing(&self, point: &[f64], missing: &[bool]) -> f64 {
        let minsum: f64 = self
            .min_values
            .iter()
            .zip(point)
            .zip(missing)
            .map(|((&x, &y), &skip)| if skip { 0.0 } else { (x - y).max(0.0) })
            .sum();
        let maxsum: f64 = point
            .iter()
            .zip(&self.max_values)
            .zip(missing)
            .map(|((&x, &y), &skip)| if skip { 0.0 } else { (x - y).max(0.0) })
            .sum();
        let sum = maxsum + minsum;

        if sum == 0.0 {
            return 0.0;
        } else if self.range_sum == 0.0 {
            return 1.0;
        }
        sum / (self.range_sum + sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_and_containment() {
        let a = BoundingBox::of_point(&[0.0, 0.0]);
        assert_eq!(a.range_sum(), 0.0);
        let b = a.merged_with_point(&[1.0, -2.0]).unwrap();
        assert_eq!(b.min_values(), &[0.0, -2.0]);
        assert_eq!(b.max_values(), &[1.0, 0.0]);
        assert_eq!(b.range_sum(), 3.0);
        assert!(b.contains(&[0.5, -1.0]));
        assert!(!b.contains(&[1.5, -1.0]));
        assert!(b.contains(&[1.0, 0.0]));
    }

    #[test]
    fn merge_of_boxes_is_smallest_enclosing() {
        let a = BoundingBox::new(&[0.0, 0.0], &[1.0, 1.0]).unwrap();
        let b = BoundingBox::new(&[-1.0, 0.5], &[0.5, 2.0]).unwrap();
        let merged = a.merged_with_box(&b).unwrap();
        assert_eq!(merged.min_values(), &[-1.0, 0.0]);
        assert_eq!(merged.max_values(), &[1.0, 2.0]);
        assert!(a.merged_with_box(&BoundingBox::of_point(&[0.0])).is_err());
    }

    #[test]
    fn add_point_reports_prior_containment() {
        let mut a = BoundingBox::new(&[0.0, 0.0], &[2.0, 2.0]).unwrap();
        assert!(a.add_point(&[1.0, 1.0]));
        assert!(!a.add_point(&[3.0, 1.0]));
        assert_eq!(a.max_values(), &[3.0, 2.0]);
    }

    #[test]
    fn probability_of_cut_extension_share() {
        let b = BoundingBox::new(&[0.0, 0.0], &[1.0, 1.0]).unwrap();
        assert_eq!(b.probability_of_cut(&[0.5, 0.5]), 0.0);
        // extending by 1 on one side: 1 / (2 + 1)
        let p = b.probability_of_cut(&[2.0, 0.5]);
        assert!((p - 1.0 / 3.0).abs() < 1e-12);
        let masked = b.probability_of_cut_with_missing(&[2.0, 0.5], &[true, false]);
        assert_eq!(masked, 0.0);
    }
}

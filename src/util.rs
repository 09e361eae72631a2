use crate::errors::ForestError;
use crate::types::Result;

/// If the test condition is false, return an InvalidArgument error with
/// the given error message. Otherwise return Ok.
pub(crate) fn check_argument(test: bool, msg: &'static str) -> Result<()> {
    if test {
        Ok(())
    } else {
        Err(ForestError::InvalidArgument { msg })
    }
}

/// Copies a point, coercing `-0.0` to `+0.0` so that equal points are
/// bitwise equal in the store. Rejects NaN; NaN is only meaningful as a
/// missing-value marker on imputation query paths.
pub(crate) fn clean_copy(point: &[f64]) -> Result<Vec<f64>> {
    let mut copy = Vec::with_capacity(point.len());
    for &value in point {
        if value.is_nan() {
            return Err(ForestError::InvalidPoint {
                msg: "NaN coordinate in insertion",
            });
        }
        copy.push(if value == 0.0 { 0.0 } else { value });
    }
    Ok(copy)
}

/// L1 distance between two equal-length vectors.
pub(crate) fn l1distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_copy_normalizes_negative_zero() {
        let cleaned = clean_copy(&[-0.0, 1.5, 0.0]).unwrap();
        assert_eq!(cleaned[0].to_bits(), 0.0f64.to_bits());
        assert_eq!(cleaned, vec![0.0, 1.5, 0.0]);
    }

    #[test]
    fn clean_copy_rejects_nan() {
        assert!(clean_copy(&[0.0, f64::NAN]).is_err());
    }
}

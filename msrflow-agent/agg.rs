//! Aggregation helpers for combining per-instance samples
//!
//! Empty input aggregates to NaN so that a missing child is visible in the
//! result rather than silently folded into a zero.

pub fn sum(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return f64::NAN;
    }
    samples.iter().sum()
}

pub fn min(samples: &[f64]) -> f64 {
    samples
        .iter()
        .copied()
        .fold(f64::NAN, |acc, v| if v < acc || acc.is_nan() { v } else { acc })
}

pub fn max(samples: &[f64]) -> f64 {
    samples
        .iter()
        .copied()
        .fold(f64::NAN, |acc, v| if v > acc || acc.is_nan() { v } else { acc })
}

pub fn average(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return f64::NAN;
    }
    sum(samples) / samples.len() as f64
}

/// All samples are expected to agree; disagreement reports NaN.
pub fn expect_same(samples: &[f64]) -> f64 {
    match samples.first() {
        None => f64::NAN,
        Some(&first) => {
            if samples.iter().all(|&v| v == first) {
                first
            } else {
                f64::NAN
            }
        }
    }
}

/// Median of the input, used to filter runtime measurements.
pub fn median(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return f64::NAN;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        0.5 * (sorted[mid - 1] + sorted[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_aggregates() {
        let v = [4.0, 1.0, 3.0];
        assert_eq!(sum(&v), 8.0);
        assert_eq!(min(&v), 1.0);
        assert_eq!(max(&v), 4.0);
        assert_eq!(average(&v), 8.0 / 3.0);
    }

    #[test]
    fn test_empty_is_nan() {
        assert!(sum(&[]).is_nan());
        assert!(min(&[]).is_nan());
        assert!(max(&[]).is_nan());
        assert!(average(&[]).is_nan());
        assert!(median(&[]).is_nan());
        assert!(expect_same(&[]).is_nan());
    }

    #[test]
    fn test_expect_same() {
        assert_eq!(expect_same(&[2.0, 2.0, 2.0]), 2.0);
        assert!(expect_same(&[2.0, 3.0]).is_nan());
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[5.0, 1.0, 3.0]), 3.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
    }
}

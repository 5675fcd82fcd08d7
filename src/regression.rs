//! Robust errors-in-variables regression: Theil-Sen slope plus
//! median-of-residuals intercept.

use crate::error::GrandConvError;

/// `(k, b)` such that `y ~= k*x + b` under Theil-Sen.
#[derive(Copy, Clone, Debug, PartialEq, serde::Serialize)]
pub struct RegressionResult {
    /// Theil-Sen slope.
    pub k: f64,
    /// Median-of-residuals intercept.
    pub b: f64,
}

/// Computes the Theil-Sen slope and median intercept for `y ~= k*x + b`.
///
/// Never allocates an O(N^2) slope matrix: the collection pass is
/// two-pass (count survivors, then fill an exact-size buffer), and every
/// size/offset computed along the way uses 64-bit unsigned arithmetic,
/// so `N` in the tens of thousands does not overflow the allocator.
pub fn theil_sen(x: &[f64], y: &[f64]) -> Result<RegressionResult, GrandConvError> {
    if x.len() != y.len() {
        return Err(GrandConvError::InvalidInput {
            detail: format!("x (len {}) and y (len {}) must match", x.len(), y.len()),
        });
    }
    let n = x.len() as u64;
    let total_pairs = n
        .checked_mul(n.saturating_sub(1))
        .map(|p| p / 2)
        .ok_or_else(|| GrandConvError::ResourceExhaustion {
            detail: "pair count overflows u64".to_string(),
        })?;

    // Pass 1: count survivors (not skipped by the equality/degenerate
    // rules below).
    let mut survivors: u64 = 0;
    for i in 0..x.len() {
        for j in (i + 1)..x.len() {
            if let Some(m) = candidate_slope(x, y, i, j) {
                if m != -1.0 && m != 0.0 {
                    survivors = survivors.checked_add(1).ok_or_else(|| {
                        GrandConvError::ResourceExhaustion {
                            detail: "slope survivor count overflows u64".to_string(),
                        }
                    })?;
                }
            }
        }
    }
    let _ = total_pairs; // bound check above guards the nested loop itself

    if survivors == 0 {
        return Err(GrandConvError::NumericDegeneracy {
            detail: "no usable Theil-Sen slopes (all pairs skipped)".to_string(),
        });
    }

    // Pass 2: fill the exact-size buffer.
    let mut slopes: Vec<f64> = Vec::with_capacity(
        usize::try_from(survivors).map_err(|_| GrandConvError::ResourceExhaustion {
            detail: "slope buffer size exceeds addressable memory".to_string(),
        })?,
    );
    for i in 0..x.len() {
        for j in (i + 1)..x.len() {
            if let Some(m) = candidate_slope(x, y, i, j) {
                if m != -1.0 && m != 0.0 {
                    slopes.push(m);
                }
            }
        }
    }
    slopes.sort_by(|a, b| a.partial_cmp(b).expect("slopes are never NaN here"));

    let count = slopes.len();
    // cutoff = index of the last slope strictly less than -1, or -1 if
    // none.
    let cutoff: i64 = match slopes.iter().rposition(|&s| s < -1.0) {
        Some(idx) => idx as i64,
        None => -1,
    };

    let k = if count % 2 == 0 {
        let lo = (count / 2) as i64 + cutoff;
        let hi = lo + 1;
        let (lo, hi) = (checked_index(lo, count)?, checked_index(hi, count)?);
        0.5 * (slopes[lo] + slopes[hi])
    } else {
        let idx = ((count + 1) / 2) as i64 + cutoff;
        let idx = checked_index(idx, count)?;
        slopes[idx]
    };

    // Intercept: median of y[i] - k*x[i].
    let mut t: Vec<f64> = x.iter().zip(y).map(|(&xi, &yi)| yi - k * xi).collect();
    if t.is_empty() {
        return Err(GrandConvError::NumericDegeneracy {
            detail: "intercept residual vector is empty".to_string(),
        });
    }
    t.sort_by(|a, b| a.partial_cmp(b).expect("residuals are never NaN"));
    let m = t.len();
    let b = if m % 2 == 0 {
        0.5 * (t[m / 2 - 1] + t[m / 2])
    } else {
        t[m / 2]
    };

    Ok(RegressionResult { k, b })
}

fn candidate_slope(x: &[f64], y: &[f64], i: usize, j: usize) -> Option<f64> {
    if x[i] == x[j] && y[i] == y[j] {
        return None;
    }
    Some((y[i] - y[j]) / (x[i] - x[j]))
}

fn checked_index(idx: i64, count: usize) -> Result<usize, GrandConvError> {
    if idx < 0 || idx as usize >= count {
        return Err(GrandConvError::NumericDegeneracy {
            detail: format!("Theil-Sen slope index {idx} out of range [0, {count})"),
        });
    }
    Ok(idx as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s4_regression_median_example() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [1.0, 2.0, 4.0, 4.0, 5.0];
        let result = theil_sen(&x, &y).unwrap();
        assert!((result.k - 1.0).abs() < 1e-9, "k = {}", result.k);
        assert!(result.b.abs() < 1e-9, "b = {}", result.b);
    }

    #[test]
    fn all_identical_points_is_degenerate() {
        let x = [2.0, 2.0, 2.0, 2.0];
        let y = [3.0, 3.0, 3.0, 3.0];
        let err = theil_sen(&x, &y).unwrap_err();
        assert!(matches!(err, GrandConvError::NumericDegeneracy { .. }));
    }

    #[test]
    fn mismatched_lengths_is_invalid_input() {
        let err = theil_sen(&[1.0, 2.0], &[1.0]).unwrap_err();
        assert!(matches!(err, GrandConvError::InvalidInput { .. }));
    }

    #[test]
    fn single_pair_has_no_slopes_and_is_degenerate() {
        // A single branch pair yields N=1, so there are zero (i,j)
        // pairs at all: the collection pass finds no slopes.
        let err = theil_sen(&[1.0], &[2.0]).unwrap_err();
        assert!(matches!(err, GrandConvError::NumericDegeneracy { .. }));
    }
}

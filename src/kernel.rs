//! The convergence/divergence per-site reduction.
//!
//! Pure arithmetic over two `n x n` posterior matrices, as specified:
//! convergence is the posterior mass on *the same* off-diagonal
//! transition occurring on both branches; divergence is the mass on
//! *different* off-diagonal transitions.

use crate::tensor::MatrixView;

/// `(probC, probD)` for one site, given the posterior matrices above
/// two branches `u` (`p1`) and `v` (`p2`).
///
/// The inner loop is written as a fixed double loop over `[0, n)` so
/// that the n=20 (amino acid) case, the tuned hot path, is exposed to
/// the optimizer as a simple unrollable loop; the same code path is
/// exercised, untuned, for n=4 (nucleotide) and n=61 (codon) callers.
#[inline]
pub fn convergence_divergence(p1: MatrixView<'_>, p2: MatrixView<'_>) -> (f64, f64) {
    let n = p1.n();
    debug_assert_eq!(n, p2.n());

    // sumcK[k] = (sum_j P2[j,k]) - P2[k,k]: column sums of P2, excluding
    // the diagonal entry of that column.
    let mut sumck = vec![0.0f64; n];
    let mut total = 0.0f64;
    for k in 0..n {
        let mut col_sum = 0.0f64;
        for j in 0..n {
            col_sum += p2.get(j, k);
        }
        sumck[k] = col_sum - p2.get(k, k);
    }
    for j in 0..n {
        for k in 0..n {
            total += p2.get(j, k);
        }
        total -= p2.get(j, j);
    }
    let sumdk: Vec<f64> = sumck.iter().map(|&c| total - c).collect();

    let mut prob_c = 0.0f64;
    let mut prob_d = 0.0f64;
    for j in 0..n {
        for k in 0..n {
            prob_c += sumck[k] * p1.get(j, k);
            prob_d += sumdk[k] * p1.get(j, k);
        }
        prob_c -= sumck[j] * p1.get(j, j);
        prob_d -= sumdk[j] * p1.get(j, j);
    }
    (prob_c, prob_d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::PosteriorTensor;

    fn tensor_from_matrix(n: usize, m: &[f64]) -> PosteriorTensor {
        assert_eq!(m.len(), n * n);
        PosteriorTensor::new(m.to_vec(), vec![0, (n * n) as u64], 1, n).unwrap()
    }

    #[test]
    fn s1_identity_matrices_yield_zero() {
        let n = 20;
        let mut id = vec![0.0; n * n];
        for i in 0..n {
            id[i * n + i] = 1.0;
        }
        let t = tensor_from_matrix(n, &id);
        let p1 = t.slice(0usize.into(), 0).unwrap();
        let p2 = t.slice(0usize.into(), 0).unwrap();
        let (c, d) = convergence_divergence(p1, p2);
        assert_eq!(c, 0.0);
        assert_eq!(d, 0.0);
    }

    #[test]
    fn s2_uniform_matrices_match_closed_form() {
        // sumcK[k] = (n-1)/n = 0.95 for all k; total = n-1 = 19;
        // sumdK[k] = 19 - 0.95 = 18.05. With P1 = P2 = uniform (each
        // entry 1/n), probC = n*0.95 - 0.95 = (n-1)*0.95 = 18.05 and
        // probD = n*18.05 - 18.05 = (n-1)*18.05 = 342.95.
        let n = 20;
        let uniform = vec![1.0 / n as f64; n * n];
        let t = tensor_from_matrix(n, &uniform);
        let p1 = t.slice(0usize.into(), 0).unwrap();
        let p2 = t.slice(0usize.into(), 0).unwrap();
        let (c, d) = convergence_divergence(p1, p2);
        assert!((c - 18.05).abs() < 1e-9, "probC = {c}");
        assert!((d - 342.95).abs() < 1e-9, "probD = {d}");
    }

    #[test]
    fn s3_anti_identity_isolated_transition() {
        let n = 20;
        let mut anti = vec![0.0; n * n];
        anti[n + 1] = 1.0; // entry (0, 1)
        let t = tensor_from_matrix(n, &anti);
        let p1 = t.slice(0usize.into(), 0).unwrap();
        let p2 = t.slice(0usize.into(), 0).unwrap();
        let (c, d) = convergence_divergence(p1, p2);
        assert!((c - 1.0).abs() < 1e-12, "probC = {c}");
        assert!(d.abs() < 1e-12, "probD = {d}");
    }

    #[test]
    fn outputs_non_negative_for_well_formed_input() {
        let n = 4;
        let m = vec![0.1, 0.2, 0.3, 0.05, 0.0, 0.4, 0.1, 0.1, 0.2, 0.0, 0.1, 0.3, 0.05, 0.1, 0.2, 0.3];
        let t = tensor_from_matrix(n, &m);
        let p1 = t.slice(0usize.into(), 0).unwrap();
        let p2 = t.slice(0usize.into(), 0).unwrap();
        let (c, d) = convergence_divergence(p1, p2);
        assert!(c >= 0.0);
        assert!(d >= 0.0);
    }
}

//! Per-site reduction results, aggregated across sites into per-pair
//! scalars plus the retained per-site sequence for selected pairs.

use crate::pairs::BranchPair;

/// Output of a full dispatcher run: one convergence/divergence scalar
/// pair per branch pair, summed over all sites, plus the dense per-site
/// `(probC, probD)` sequence for every pair the caller selected.
#[derive(Clone, Debug)]
pub struct SiteScalars {
    /// `pConvergent[i] = sum_s probC(i, s)`.
    pub p_convergent: Vec<f64>,
    /// `pDivergent[i] = sum_s probD(i, s)`.
    pub p_divergent: Vec<f64>,
    /// For each selected pair (same order as the enumeration, restricted
    /// to `selected` pairs), the dense `(numSites x 2)` `(probC, probD)`
    /// table.
    pub per_site: Vec<PerPairSiteTable>,
}

/// The retained per-site sequence for one selected branch pair.
#[derive(Clone, Debug)]
pub struct PerPairSiteTable {
    /// The pair this table belongs to.
    pub pair: BranchPair,
    /// Index of this pair within the full enumeration (used to label
    /// output artifacts in enumeration order).
    pub pair_index: usize,
    /// `(probC, probD)` for every site, in site order.
    pub rows: Vec<(f64, f64)>,
}

impl SiteScalars {
    /// Allocates zeroed scalar vectors for `num_pairs` pairs and empty
    /// per-site tables for the `selected` ones; the dispatcher fills
    /// these in during `run`.
    pub fn allocate(pairs: &[BranchPair], num_sites: usize) -> Self {
        let per_site = pairs
            .iter()
            .enumerate()
            .filter(|(_, p)| p.selected)
            .map(|(i, p)| PerPairSiteTable {
                pair: *p,
                pair_index: i,
                rows: vec![(0.0, 0.0); num_sites],
            })
            .collect();
        Self {
            p_convergent: vec![0.0; pairs.len()],
            p_divergent: vec![0.0; pairs.len()],
            per_site,
        }
    }
}

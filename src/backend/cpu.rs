//! CPU backend: a `rayon` fork-join parallel loop over `(pair, site)`.

use super::{Backend, BackendKind, MemoryBudget, Precision};
use crate::aggregate::{PerPairSiteTable, SiteScalars};
use crate::error::GrandConvError;
use crate::kernel::convergence_divergence;
use crate::pairs::BranchPair;
use crate::tensor::PosteriorTensor;
use rayon::prelude::*;

/// Always-available backend; operates end-to-end in 64-bit floats.
pub struct CpuBackend {
    initialized: bool,
}

impl CpuBackend {
    /// A fresh, uninitialized backend.
    pub fn new() -> Self {
        Self { initialized: false }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn precision(&self) -> Precision {
        Precision::Double
    }

    fn probe(&self) -> bool {
        true
    }

    fn init(&mut self) -> Result<MemoryBudget, GrandConvError> {
        self.initialized = true;
        // No device to query; report host memory as the budget so the
        // dispatcher's memory-budget check is a no-op for this backend.
        Ok(MemoryBudget {
            working_set_bytes: u64::MAX,
        })
    }

    fn run(
        &mut self,
        tensor: &PosteriorTensor,
        pairs: &[BranchPair],
    ) -> Result<SiteScalars, GrandConvError> {
        if !self.initialized {
            self.init()?;
        }
        let num_sites = tensor.num_sites();
        if num_sites == 0 || pairs.is_empty() {
            return Ok(SiteScalars::allocate(pairs, num_sites));
        }

        // One (probC, probD) row per (pair, site), row-major by pair
        // then site, matching the deterministic reduction order and
        // external output order required by the resource model.
        let mut rows: Vec<(f64, f64)> = vec![(0.0, 0.0); pairs.len() * num_sites];
        rows.par_chunks_mut(num_sites)
            .zip(pairs.par_iter())
            .try_for_each(|(pair_rows, pair)| -> Result<(), GrandConvError> {
                for (site, cell) in pair_rows.iter_mut().enumerate() {
                    let p1 = tensor.slice(pair.u, site).map_err(|e| {
                        runtime_err(pair, site, &format!("reading branch u matrix: {e}"))
                    })?;
                    let p2 = tensor.slice(pair.v, site).map_err(|e| {
                        runtime_err(pair, site, &format!("reading branch v matrix: {e}"))
                    })?;
                    *cell = convergence_divergence(p1, p2);
                }
                Ok(())
            })?;

        let mut p_convergent = vec![0.0f64; pairs.len()];
        let mut p_divergent = vec![0.0f64; pairs.len()];
        let mut per_site = Vec::new();
        for (i, pair) in pairs.iter().enumerate() {
            let pair_rows = &rows[i * num_sites..(i + 1) * num_sites];
            let (sum_c, sum_d) = pair_rows
                .iter()
                .fold((0.0, 0.0), |(ac, ad), &(c, d)| (ac + c, ad + d));
            p_convergent[i] = sum_c;
            p_divergent[i] = sum_d;
            if pair.selected {
                per_site.push(PerPairSiteTable {
                    pair: *pair,
                    pair_index: i,
                    rows: pair_rows.to_vec(),
                });
            }
        }

        Ok(SiteScalars {
            p_convergent,
            p_divergent,
            per_site,
        })
    }

    fn shutdown(&mut self) {
        self.initialized = false;
    }
}

fn runtime_err(pair: &BranchPair, site: usize, detail: &str) -> GrandConvError {
    GrandConvError::BackendRuntime {
        backend: "cpu".to_string(),
        pair: Some((pair.u.into(), pair.v.into())),
        site: Some(site),
        detail: detail.to_string(),
    }
}

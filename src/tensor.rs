//! The posterior substitution-probability tensor (`conP`).

use crate::error::GrandConvError;
use crate::ids::NodeId;

/// A read-only `n x n` matrix view into one (node, site) slice of a
/// [`PosteriorTensor`].
#[derive(Copy, Clone, Debug)]
pub struct MatrixView<'a> {
    data: &'a [f64],
    n: usize,
}

impl<'a> MatrixView<'a> {
    /// Entry `(j, k)`: posterior probability that ancestral state `j`
    /// is replaced by descendant state `k` along this branch, at this
    /// site.
    #[inline]
    pub fn get(&self, j: usize, k: usize) -> f64 {
        debug_assert!(j < self.n && k < self.n);
        self.data[j * self.n + k]
    }

    /// Matrix dimension `n`.
    pub fn n(&self) -> usize {
        self.n
    }
}

/// Dense, read-only table of posterior substitution probabilities
/// indexed by `(node, site, from-state, to-state)`.
///
/// Stored as a flat buffer `con_p` with a per-node offset array, per the
/// external contract: `offsets[v+1] - offsets[v] == num_sites * n * n`.
/// All offset arithmetic happens in `u64` before narrowing to `usize`
/// for the final index, so that a pathologically large `(node, site)`
/// combination is reported as [`GrandConvError::InvalidInput`] rather
/// than silently wrapping.
pub struct PosteriorTensor {
    con_p: Vec<f64>,
    offsets: Vec<u64>,
    num_sites: usize,
    n: usize,
}

impl PosteriorTensor {
    /// Builds a tensor from a flat buffer and per-node offsets, checking
    /// the shape invariant `offsets[v+1] - offsets[v] == num_sites*n*n`
    /// for every node and that the buffer is long enough to back the
    /// last offset.
    pub fn new(
        con_p: Vec<f64>,
        offsets: Vec<u64>,
        num_sites: usize,
        n: usize,
    ) -> Result<Self, GrandConvError> {
        if offsets.is_empty() {
            return Err(GrandConvError::InvalidInput {
                detail: "offsets array must have at least one entry".to_string(),
            });
        }
        let stride = (num_sites as u64)
            .checked_mul(n as u64)
            .and_then(|x| x.checked_mul(n as u64))
            .ok_or_else(|| GrandConvError::InvalidInput {
                detail: "num_sites * n * n overflows u64".to_string(),
            })?;
        for w in offsets.windows(2) {
            if w[1] < w[0] || w[1] - w[0] != stride {
                return Err(GrandConvError::InvalidInput {
                    detail: format!(
                        "offset stride mismatch: expected {stride}, got {}",
                        w[1].saturating_sub(w[0])
                    ),
                });
            }
        }
        let last = *offsets.last().unwrap();
        if last > con_p.len() as u64 {
            return Err(GrandConvError::InvalidInput {
                detail: format!(
                    "con_p buffer (len {}) too short for last offset {last}",
                    con_p.len()
                ),
            });
        }
        for &v in &con_p {
            if !v.is_finite() || v < 0.0 {
                return Err(GrandConvError::InvalidInput {
                    detail: "con_p entries must be finite and non-negative".to_string(),
                });
            }
        }
        Ok(Self {
            con_p,
            offsets,
            num_sites,
            n,
        })
    }

    /// Number of nodes the tensor has offsets for (`offsets.len() - 1`).
    pub fn nnode(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Number of sites per node.
    pub fn num_sites(&self) -> usize {
        self.num_sites
    }

    /// Matrix dimension (20 for amino acids, 4 for nucleotides, 61 for
    /// codons).
    pub fn n(&self) -> usize {
        self.n
    }

    /// Raw flat buffer, for backends that stage the whole tensor to a
    /// device rather than slicing it matrix-by-matrix on the host.
    pub fn con_p_buffer(&self) -> &[f64] {
        &self.con_p
    }

    /// Raw per-node offset array, paired with [`PosteriorTensor::con_p_buffer`].
    pub fn offsets_buffer(&self) -> &[u64] {
        &self.offsets
    }

    /// Bounds-checked view of the `n x n` matrix for `node` at `site`.
    pub fn slice(&self, node: NodeId, site: usize) -> Result<MatrixView<'_>, GrandConvError> {
        let node_idx = node
            .as_usize()
            .filter(|&i| i < self.nnode())
            .ok_or_else(|| GrandConvError::InvalidInput {
                detail: format!("node {node} out of range [0, {})", self.nnode()),
            })?;
        if site >= self.num_sites {
            return Err(GrandConvError::InvalidInput {
                detail: format!("site {site} out of range [0, {})", self.num_sites),
            });
        }
        let n2 = (self.n as u64) * (self.n as u64);
        let start = self.offsets[node_idx] + (site as u64) * n2;
        let end = start + n2;
        let start = usize::try_from(start).map_err(|_| GrandConvError::InvalidInput {
            detail: "matrix start offset exceeds addressable memory".to_string(),
        })?;
        let end = usize::try_from(end).map_err(|_| GrandConvError::InvalidInput {
            detail: "matrix end offset exceeds addressable memory".to_string(),
        })?;
        Ok(MatrixView {
            data: &self.con_p[start..end],
            n: self.n,
        })
    }
}

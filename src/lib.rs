//! Convergent/divergent amino-acid substitution analysis across
//! independent branch pairs of a rooted phylogeny.
//!
//! [`run`] wires the pipeline end to end: enumerate branch pairs, run
//! the reduction kernel on the selected backend, regress divergence
//! against convergence, and emit the result artifacts.

pub mod aggregate;
pub mod backend;
pub mod config;
pub mod error;
pub mod ids;
pub mod kernel;
pub mod pairs;
pub mod regression;
pub mod sink;
pub mod tensor;
pub mod tree;

use aggregate::SiteScalars;
use backend::{BackendDispatcher, BackendKind};
use config::RunConfig;
use error::GrandConvError;
use pairs::{enumerate_branch_pairs, BranchPair};
use regression::{theil_sen, RegressionResult};
use sink::ResultSink;
use tensor::PosteriorTensor;
use tree::Tree;

/// Everything a caller needs after a successful run, beyond the
/// artifacts already written to disk by [`ResultSink`].
#[derive(Debug)]
pub struct PipelineOutcome {
    /// The backend that actually executed the kernel.
    pub backend: BackendKind,
    /// Total enumerated branch pairs (selected and unselected).
    pub num_pairs: usize,
    /// Count of pairs for which per-site output was requested.
    pub num_selected: usize,
    /// The fitted convergence-vs-divergence regression.
    pub regression: RegressionResult,
}

/// Runs the full pipeline for one tree/tensor and writes every result
/// artifact under `config.dir`.
pub fn run(
    tree: &Tree,
    tensor: &PosteriorTensor,
    config: &RunConfig,
) -> Result<PipelineOutcome, GrandConvError> {
    // No branch-pair-count ceiling here: tens of thousands of pairs must
    // complete correctly rather than being refused, so every size
    // computation downstream (regression.rs in particular) uses checked
    // u64 arithmetic instead of a pre-emptive limit.
    let pairs = enumerate_branch_pairs(tree, &config.selected_pairs)?;
    tracing::info!(num_pairs = pairs.len(), "enumerated branch pairs");

    let mut dispatcher = BackendDispatcher::select(config.use_gpu, false)?;
    let scalars = dispatcher.run(tensor, &pairs)?;
    let backend = dispatcher.kind();
    dispatcher.shutdown();

    let regression = regress(&scalars)?;
    tracing::info!(k = regression.k, b = regression.b, "fitted regression");

    let sink = ResultSink::new(&config.dir)?;
    sink.write_tree(tree)?;
    sink.write_data(tree, &pairs, &scalars, &regression, tensor.num_sites())?;
    sink.write_html(&pairs, tensor.num_sites())?;

    Ok(PipelineOutcome {
        backend,
        num_pairs: pairs.len(),
        num_selected: pairs.iter().filter(|p: &&BranchPair| p.selected).count(),
        regression,
    })
}

/// Regresses per-pair convergence probability against divergence
/// probability (`yPoints ~= k * xPoints + b`).
fn regress(scalars: &SiteScalars) -> Result<RegressionResult, GrandConvError> {
    theil_sen(&scalars.p_divergent, &scalars.p_convergent)
}

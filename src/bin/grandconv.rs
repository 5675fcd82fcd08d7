//! Command-line entry point: reads a control file, applies flag
//! overrides, runs the pipeline, and maps errors onto process exit
//! codes.

use clap::Parser;
use grand_convergence::config::{parse_control_file, RunConfig};
use grand_convergence::error::GrandConvError;
use std::path::PathBuf;
use std::process::ExitCode;

/// Compute convergent/divergent substitution probabilities across
/// independent branch pairs and regress the result.
#[derive(Parser, Debug)]
#[command(name = "grandconv", version, about)]
struct Cli {
    /// Control file in `key = value` format.
    control_file: PathBuf,

    /// Force GPU execution on (overrides `useGPU` from the control file).
    #[arg(long)]
    use_gpu: bool,

    /// Number of worker threads (overrides `nthreads`).
    #[arg(long)]
    nthreads: Option<usize>,

    /// Output directory (overrides `dir`).
    #[arg(long)]
    dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> Result<(), GrandConvError> {
    let mut config: RunConfig = parse_control_file(&cli.control_file)?;
    if cli.use_gpu {
        config.use_gpu = true;
    }
    if let Some(nthreads) = cli.nthreads {
        config.nthreads = nthreads;
    }
    if let Some(dir) = cli.dir {
        config.dir = dir;
    }

    rayon::ThreadPoolBuilder::new()
        .num_threads(config.nthreads)
        .build_global()
        .map_err(|e| GrandConvError::InvalidInput {
            detail: format!("failed to configure {} worker threads: {e}", config.nthreads),
        })?;

    let (tree, tensor) = load_inputs(&config)?;
    let outcome = grand_convergence::run(&tree, &tensor, &config)?;
    tracing::info!(
        backend = %outcome.backend,
        num_pairs = outcome.num_pairs,
        num_selected = outcome.num_selected,
        k = outcome.regression.k,
        b = outcome.regression.b,
        "run complete"
    );
    Ok(())
}

/// Loading the tree topology and posterior tensor from whatever
/// upstream ancestral-reconstruction format the control file's `dir`
/// points at is outside this crate's scope; callers construct
/// [`grand_convergence::tree::Tree`] and
/// [`grand_convergence::tensor::PosteriorTensor`] directly via their
/// builders.
fn load_inputs(
    config: &RunConfig,
) -> Result<
    (
        grand_convergence::tree::Tree,
        grand_convergence::tensor::PosteriorTensor,
    ),
    GrandConvError,
> {
    Err(GrandConvError::InvalidInput {
        detail: format!(
            "no tree/tensor loader configured for input directory {}",
            config.dir.display()
        ),
    })
}

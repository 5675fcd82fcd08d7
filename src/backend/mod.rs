//! Multi-backend execution dispatcher.
//!
//! Models backend selection as a capability trait (`probe`/`init`/`run`/
//! `shutdown`) implemented by each concrete backend; [`BackendDispatcher`]
//! holds exactly one active implementation and can replace it with the
//! CPU backend on a failed GPU `init`. Device resources are acquired
//! only inside `init` and released inside `shutdown`, which a [`Drop`]
//! impl guarantees runs on every exit path, including unwinding panics.

pub mod cpu;

#[cfg(feature = "backend-cuda")]
pub mod cuda;

#[cfg(feature = "backend-metal")]
pub mod metal_backend;

use crate::aggregate::SiteScalars;
use crate::error::GrandConvError;
use crate::pairs::BranchPair;
use crate::tensor::PosteriorTensor;

/// Which concrete execution target is in use.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Parallel CPU loop (rayon fork-join), always available.
    Cpu,
    /// NVIDIA GPU via CUDA.
    Cuda,
    /// Apple GPU via Metal.
    Metal,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendKind::Cpu => "cpu",
            BackendKind::Cuda => "cuda",
            BackendKind::Metal => "metal",
        };
        f.write_str(s)
    }
}

/// Numeric precision a backend computes in. Conversions between this
/// and the caller's always-64-bit buffers happen only at the host/device
/// boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Precision {
    /// CPU and CUDA operate end-to-end in 64-bit floats.
    Double,
    /// Metal converts to 32-bit floats on the host, runs in 32-bit, and
    /// converts results back.
    Single,
}

/// The device's reported working-set budget, used to refuse a GPU run
/// whose combined buffer footprint would exceed it (falling back to
/// CPU instead of risking an out-of-memory abort).
#[derive(Copy, Clone, Debug)]
pub struct MemoryBudget {
    /// Recommended maximum resident bytes, as reported by the device at
    /// `init` time.
    pub working_set_bytes: u64,
}

/// Capability seam implemented by each concrete backend.
pub trait Backend: Send {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Precision this backend computes in.
    fn precision(&self) -> Precision;

    /// Availability check; must not allocate persistent resources.
    fn probe(&self) -> bool;

    /// Acquires device resources (queues/streams, compiled kernels) and
    /// reports the device's working-set budget. Implementations must
    /// leave no persistent resource allocated if they return an error.
    fn init(&mut self) -> Result<MemoryBudget, GrandConvError>;

    /// Stages inputs, executes the kernel over every `(pair, site)`, and
    /// returns the aggregated and per-site results. Inputs are
    /// read-only; this must not mutate `tensor`.
    fn run(
        &mut self,
        tensor: &PosteriorTensor,
        pairs: &[BranchPair],
    ) -> Result<SiteScalars, GrandConvError>;

    /// Releases every resource acquired in `init`, on every exit path.
    fn shutdown(&mut self);
}

/// Owns the active backend implementation and performs fallback.
///
/// Dropping the dispatcher always calls `shutdown` on whatever backend
/// is active, so device resources are released even if a caller panics
/// between `run` and an explicit `shutdown()` call.
pub struct BackendDispatcher {
    active: Box<dyn Backend>,
    budget: MemoryBudget,
}

impl BackendDispatcher {
    /// Selects a backend per the policy in the external contract: if
    /// `use_gpu` is set and a GPU backend probes available, try it (CUDA
    /// before Metal); otherwise, or if every GPU `init` fails, fall back
    /// to the CPU backend with a warning. GPU `init` failure is never
    /// fatal unless explicitly required by the caller via
    /// `require_gpu`.
    pub fn select(use_gpu: bool, require_gpu: bool) -> Result<Self, GrandConvError> {
        if use_gpu {
            #[cfg(feature = "backend-cuda")]
            {
                let mut backend: Box<dyn Backend> = Box::new(cuda::CudaBackend::new());
                if backend.probe() {
                    match backend.init() {
                        Ok(budget) => {
                            tracing::info!(backend = %BackendKind::Cuda, "selected backend");
                            return Ok(Self { active: backend, budget });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "cuda init failed, falling back");
                        }
                    }
                }
            }
            #[cfg(feature = "backend-metal")]
            {
                let mut backend: Box<dyn Backend> = Box::new(metal_backend::MetalBackend::new());
                if backend.probe() {
                    match backend.init() {
                        Ok(budget) => {
                            tracing::info!(backend = %BackendKind::Metal, "selected backend");
                            return Ok(Self { active: backend, budget });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "metal init failed, falling back");
                        }
                    }
                }
            }
            if require_gpu {
                return Err(GrandConvError::BackendUnavailable {
                    backend: "cuda/metal".to_string(),
                    reason: "no GPU backend probed available or all failed to initialize"
                        .to_string(),
                });
            }
            tracing::warn!("no GPU backend available, falling back to cpu");
        }

        let mut backend: Box<dyn Backend> = Box::new(cpu::CpuBackend::new());
        let budget = backend.init()?;
        tracing::info!(backend = %BackendKind::Cpu, "selected backend");
        Ok(Self { active: backend, budget })
    }

    /// Which backend is currently active.
    pub fn kind(&self) -> BackendKind {
        self.active.kind()
    }

    /// Runs the kernel over every `(pair, site)` via the active backend,
    /// first checking the workload against the device's reported memory
    /// budget and falling back to the CPU backend if it would be
    /// exceeded, per the external contract.
    pub fn run(
        &mut self,
        tensor: &PosteriorTensor,
        pairs: &[BranchPair],
    ) -> Result<SiteScalars, GrandConvError> {
        if self.active.kind() != BackendKind::Cpu {
            let required = workload_bytes(self.active.precision(), tensor, pairs);
            if required > self.budget.working_set_bytes {
                tracing::warn!(
                    backend = %self.active.kind(),
                    required_bytes = required,
                    budget_bytes = self.budget.working_set_bytes,
                    "workload exceeds device memory budget, falling back to cpu"
                );
                self.active.shutdown();
                let mut cpu: Box<dyn Backend> = Box::new(cpu::CpuBackend::new());
                self.budget = cpu.init()?;
                self.active = cpu;
            }
        }
        self.active.run(tensor, pairs)
    }

    /// Explicitly releases device resources. Idempotent; also run by
    /// `Drop`.
    pub fn shutdown(&mut self) {
        self.active.shutdown();
    }
}

impl Drop for BackendDispatcher {
    fn drop(&mut self) {
        self.active.shutdown();
    }
}

/// Estimated device-resident footprint of one `run()` call: `conP`,
/// `offsets`, `nodePairs`, and both output buffers, sized by the
/// backend's element width (8 bytes for the double-precision backends,
/// 4 bytes for Metal's single-precision staging buffers).
fn workload_bytes(precision: Precision, tensor: &PosteriorTensor, pairs: &[BranchPair]) -> u64 {
    let elem_bytes: u64 = match precision {
        Precision::Double => 8,
        Precision::Single => 4,
    };
    let con_p_bytes = (tensor.con_p_buffer().len() as u64).saturating_mul(elem_bytes);
    let offsets_bytes = (tensor.offsets_buffer().len() as u64).saturating_mul(elem_bytes);
    let node_pairs_bytes = (pairs.len() as u64).saturating_mul(2).saturating_mul(elem_bytes);
    let out_len = (pairs.len() as u64).saturating_mul(tensor.num_sites() as u64);
    let out_bytes = out_len.saturating_mul(elem_bytes).saturating_mul(2);

    con_p_bytes
        .saturating_add(offsets_bytes)
        .saturating_add(node_pairs_bytes)
        .saturating_add(out_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_cpu_when_gpu_not_requested() {
        let dispatcher = BackendDispatcher::select(false, false).unwrap();
        assert_eq!(dispatcher.kind(), BackendKind::Cpu);
    }

    #[test]
    fn falls_back_to_cpu_when_gpu_unavailable_and_not_mandatory() {
        // With no backend-cuda/backend-metal features compiled in, a
        // `use_gpu` request with no mandatory requirement must still
        // succeed on the cpu backend.
        let dispatcher = BackendDispatcher::select(true, false).unwrap();
        assert_eq!(dispatcher.kind(), BackendKind::Cpu);
    }

    #[test]
    fn mandatory_gpu_with_no_backend_available_errors() {
        let err = BackendDispatcher::select(true, true).unwrap_err();
        assert!(matches!(err, GrandConvError::BackendUnavailable { .. }));
    }

    #[test]
    fn workload_bytes_scales_with_precision() {
        use crate::ids::NodeId;
        let tensor = PosteriorTensor::new(vec![0.0; 4], vec![0, 4], 1, 2).unwrap();
        let pairs = vec![BranchPair {
            u: NodeId::from(0usize),
            v: NodeId::from(1usize),
            selected: false,
        }];
        let double_bytes = workload_bytes(Precision::Double, &tensor, &pairs);
        let single_bytes = workload_bytes(Precision::Single, &tensor, &pairs);
        assert_eq!(double_bytes, single_bytes * 2);
        assert!(double_bytes > 0);
    }
}

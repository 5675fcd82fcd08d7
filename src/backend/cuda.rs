//! NVIDIA GPU backend, built on `cust`. Operates end-to-end in 64-bit
//! floats, matching the CPU backend's precision.

use super::{Backend, BackendKind, MemoryBudget, Precision};
use crate::aggregate::{PerPairSiteTable, SiteScalars};
use crate::error::GrandConvError;
use crate::pairs::BranchPair;
use crate::tensor::PosteriorTensor;
use cust::context::Context;
use cust::device::Device;
use cust::memory::{CopyDestination, DeviceBuffer};
use cust::module::Module;
use cust::prelude::Stream;
use cust::stream::StreamFlags;

/// Block width for the `(pair, site)` grid, per the external contract.
const BLOCK_SIZE: u32 = 256;

// Compiled from `src/backend/cuda_kernel.cu` by `build.rs` (via `nvcc
// --ptx`) into `OUT_DIR` when the `backend-cuda` feature is enabled;
// the precompiled-artifact path the external contract prefers over
// compiling embedded source at every startup.
const KERNEL_PTX: &str = include_str!(concat!(env!("OUT_DIR"), "/cuda_kernel.ptx"));

/// NVIDIA GPU backend. `Context`/`Module`/`Stream` are acquired in
/// `init` and dropped in `shutdown`; `cust`'s RAII wrappers release the
/// underlying CUDA resources in their own `Drop` impls, so shutdown is
/// simply letting go of them.
pub struct CudaBackend {
    device: Option<Device>,
    context: Option<Context>,
    module: Option<Module>,
    stream: Option<Stream>,
    // Staged device buffers, kept resident across `run()` calls and
    // grown (never shrunk) when a later call needs more capacity.
    con_p_buf: Option<DeviceBuffer<f64>>,
    offsets_buf: Option<DeviceBuffer<u64>>,
    node_ids_buf: Option<DeviceBuffer<i64>>,
    out_c_buf: Option<DeviceBuffer<f64>>,
    out_d_buf: Option<DeviceBuffer<f64>>,
}

impl CudaBackend {
    /// A fresh, uninitialized backend.
    pub fn new() -> Self {
        Self {
            device: None,
            context: None,
            module: None,
            stream: None,
            con_p_buf: None,
            offsets_buf: None,
            node_ids_buf: None,
            out_c_buf: None,
            out_d_buf: None,
        }
    }
}

impl Default for CudaBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CudaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cuda
    }

    fn precision(&self) -> Precision {
        Precision::Double
    }

    fn probe(&self) -> bool {
        cust::init(cust::CudaFlags::empty()).is_ok() && Device::num_devices().unwrap_or(0) > 0
    }

    fn init(&mut self) -> Result<MemoryBudget, GrandConvError> {
        cust::init(cust::CudaFlags::empty()).map_err(|e| GrandConvError::BackendUnavailable {
            backend: "cuda".to_string(),
            reason: e.to_string(),
        })?;
        let device = Device::get_device(0).map_err(|e| GrandConvError::BackendUnavailable {
            backend: "cuda".to_string(),
            reason: e.to_string(),
        })?;
        let context =
            Context::new(device).map_err(|e| GrandConvError::BackendRuntime {
                backend: "cuda".to_string(),
                pair: None,
                site: None,
                detail: format!("context creation failed: {e}"),
            })?;
        let module = Module::from_ptx(KERNEL_PTX, &[]).map_err(|e| GrandConvError::BackendRuntime {
            backend: "cuda".to_string(),
            pair: None,
            site: None,
            detail: format!("module load failed: {e}"),
        })?;
        let stream = Stream::new(StreamFlags::NON_BLOCKING, None).map_err(|e| {
            GrandConvError::BackendRuntime {
                backend: "cuda".to_string(),
                pair: None,
                site: None,
                detail: format!("stream creation failed: {e}"),
            }
        })?;
        let working_set_bytes = device
            .total_memory()
            .map_err(|e| GrandConvError::BackendRuntime {
                backend: "cuda".to_string(),
                pair: None,
                site: None,
                detail: format!("querying device memory failed: {e}"),
            })? as u64;

        self.device = Some(device);
        self.context = Some(context);
        self.module = Some(module);
        self.stream = Some(stream);
        tracing::info!(device = ?device.name(), working_set_bytes, "cuda device initialized");
        Ok(MemoryBudget { working_set_bytes })
    }

    fn run(
        &mut self,
        tensor: &PosteriorTensor,
        pairs: &[BranchPair],
    ) -> Result<SiteScalars, GrandConvError> {
        let module = self.module.as_ref().ok_or_else(|| GrandConvError::BackendRuntime {
            backend: "cuda".to_string(),
            pair: None,
            site: None,
            detail: "run() called before init()".to_string(),
        })?;
        let stream = self.stream.as_ref().expect("stream present after init");

        let num_sites = tensor.num_sites();
        let n = tensor.n() as u32;
        let node_ids: Vec<i64> = pairs.iter().flat_map(|p| [p.u.into(), p.v.into()]).collect();
        let out_len = pairs.len() * num_sites;

        // Stage read-only inputs into the buffers persisted on `self`,
        // growing them only when this call's data no longer fits.
        stage_grow_only(&mut self.con_p_buf, tensor.con_p_buffer())?;
        stage_grow_only(&mut self.offsets_buf, tensor.offsets_buffer())?;
        stage_grow_only(&mut self.node_ids_buf, &node_ids)?;
        ensure_output_capacity(&mut self.out_c_buf, out_len)?;
        ensure_output_capacity(&mut self.out_d_buf, out_len)?;

        let con_p_dev = self.con_p_buf.as_ref().expect("staged above");
        let offsets_dev = self.offsets_buf.as_ref().expect("staged above");
        let node_ids_dev = self.node_ids_buf.as_ref().expect("staged above");
        let out_c = self.out_c_buf.as_mut().expect("staged above");
        let out_d = self.out_d_buf.as_mut().expect("staged above");

        let grid_y = num_sites.div_ceil(BLOCK_SIZE as usize) as u32;
        let function = module
            .get_function("convergence_divergence_kernel")
            .map_err(|e| GrandConvError::BackendRuntime {
                backend: "cuda".to_string(),
                pair: None,
                site: None,
                detail: format!("kernel symbol not found: {e}"),
            })?;

        unsafe {
            cust::launch!(
                function<<<(pairs.len() as u32, grid_y, 1), (BLOCK_SIZE, 1, 1), 0, stream>>>(
                    con_p_dev.as_device_ptr(),
                    offsets_dev.as_device_ptr(),
                    node_ids_dev.as_device_ptr(),
                    pairs.len() as u32,
                    num_sites as u32,
                    n,
                    out_c.as_device_ptr(),
                    out_d.as_device_ptr()
                )
            )
            .map_err(|e| GrandConvError::BackendRuntime {
                backend: "cuda".to_string(),
                pair: None,
                site: None,
                detail: format!("kernel launch failed: {e}"),
            })?;
        }
        stream.synchronize().map_err(|e| GrandConvError::BackendRuntime {
            backend: "cuda".to_string(),
            pair: None,
            site: None,
            detail: format!("stream synchronize failed: {e}"),
        })?;

        let mut host_c = vec![0.0f64; out_len];
        let mut host_d = vec![0.0f64; out_len];
        out_c[..out_len].copy_to(&mut host_c).map_err(alloc_err)?;
        out_d[..out_len].copy_to(&mut host_d).map_err(alloc_err)?;

        let mut p_convergent = vec![0.0f64; pairs.len()];
        let mut p_divergent = vec![0.0f64; pairs.len()];
        let mut per_site = Vec::new();
        for (i, pair) in pairs.iter().enumerate() {
            let c_row = &host_c[i * num_sites..(i + 1) * num_sites];
            let d_row = &host_d[i * num_sites..(i + 1) * num_sites];
            p_convergent[i] = c_row.iter().sum();
            p_divergent[i] = d_row.iter().sum();
            if pair.selected {
                per_site.push(PerPairSiteTable {
                    pair: *pair,
                    pair_index: i,
                    rows: c_row.iter().zip(d_row).map(|(&c, &d)| (c, d)).collect(),
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
        // Dropping these releases the staged buffers, stream, module,
        // and context, in that order; `Device` is a plain handle with no
        // teardown.
        self.con_p_buf = None;
        self.offsets_buf = None;
        self.node_ids_buf = None;
        self.out_c_buf = None;
        self.out_d_buf = None;
        self.stream = None;
        self.module = None;
        self.context = None;
        self.device = None;
    }
}

/// Stages `data` into `slot`, reusing the existing device buffer when it
/// already has room (copying fresh data into its leading elements) and
/// only reallocating, grow-only, when `data` no longer fits.
fn stage_grow_only<T: cust::memory::DeviceCopy>(
    slot: &mut Option<DeviceBuffer<T>>,
    data: &[T],
) -> Result<(), GrandConvError> {
    let needs_grow = match slot {
        Some(buf) => buf.len() < data.len(),
        None => true,
    };
    if needs_grow {
        *slot = Some(DeviceBuffer::from_slice(data).map_err(alloc_err)?);
    } else if let Some(buf) = slot {
        buf[..data.len()].copy_from(data).map_err(alloc_err)?;
    }
    Ok(())
}

/// Ensures `slot` holds a zeroed device buffer of at least `len`
/// elements, grow-only.
fn ensure_output_capacity(
    slot: &mut Option<DeviceBuffer<f64>>,
    len: usize,
) -> Result<(), GrandConvError> {
    let needs_grow = match slot {
        Some(buf) => buf.len() < len,
        None => true,
    };
    if needs_grow {
        *slot = Some(DeviceBuffer::zeroed(len).map_err(alloc_err)?);
    }
    Ok(())
}

fn alloc_err(e: cust::error::CudaError) -> GrandConvError {
    GrandConvError::ResourceExhaustion {
        detail: format!("cuda allocation or copy failed: {e}"),
    }
}

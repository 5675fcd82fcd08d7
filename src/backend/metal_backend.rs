//! Apple GPU backend, built on `metal`. Converts the caller's 64-bit
//! buffers to 32-bit floats on the host, runs the kernel in 32-bit, and
//! converts results back; the only backend permitted to lose precision,
//! per the external contract.

use super::{Backend, BackendKind, MemoryBudget, Precision};
use crate::aggregate::{PerPairSiteTable, SiteScalars};
use crate::error::GrandConvError;
use crate::pairs::BranchPair;
use crate::tensor::PosteriorTensor;
use metal::{
    CommandQueue, ComputePipelineState, Device, MTLResourceOptions, MTLSize,
};

/// Serial sites-per-thread, coarsening the grid to amortize dispatch
/// overhead, per the external contract.
const SITES_PER_THREAD: usize = 16;
const THREADGROUP: (u64, u64) = (32, 8);

const KERNEL_SOURCE: &str = include_str!("metal_kernel.metal");

/// Apple GPU backend. The `Device` handle is process-wide; the command
/// queue and compute pipeline state are acquired in `init` and dropped
/// in `shutdown`.
pub struct MetalBackend {
    device: Option<Device>,
    queue: Option<CommandQueue>,
    pipeline: Option<ComputePipelineState>,
    // Staged device buffers, kept resident across `run()` calls and
    // grown (never shrunk) when a later call needs more capacity.
    con_p_buf: Option<metal::Buffer>,
    offsets_buf: Option<metal::Buffer>,
    node_ids_buf: Option<metal::Buffer>,
    out_c_buf: Option<metal::Buffer>,
    out_d_buf: Option<metal::Buffer>,
}

impl MetalBackend {
    /// A fresh, uninitialized backend.
    pub fn new() -> Self {
        Self {
            device: None,
            queue: None,
            pipeline: None,
            con_p_buf: None,
            offsets_buf: None,
            node_ids_buf: None,
            out_c_buf: None,
            out_d_buf: None,
        }
    }
}

impl Default for MetalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MetalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Metal
    }

    fn precision(&self) -> Precision {
        Precision::Single
    }

    fn probe(&self) -> bool {
        Device::system_default().is_some()
    }

    fn init(&mut self) -> Result<MemoryBudget, GrandConvError> {
        let device = Device::system_default().ok_or_else(|| GrandConvError::BackendUnavailable {
            backend: "metal".to_string(),
            reason: "no default Metal device on this host".to_string(),
        })?;
        let library = device
            .new_library_with_source(KERNEL_SOURCE, &metal::CompileOptions::new())
            .map_err(|e| GrandConvError::BackendRuntime {
                backend: "metal".to_string(),
                pair: None,
                site: None,
                detail: format!("shader compilation failed: {e}"),
            })?;
        let function = library
            .get_function("convergence_divergence_kernel", None)
            .map_err(|e| GrandConvError::BackendRuntime {
                backend: "metal".to_string(),
                pair: None,
                site: None,
                detail: format!("kernel function not found: {e}"),
            })?;
        let pipeline = device
            .new_compute_pipeline_state_with_function(&function)
            .map_err(|e| GrandConvError::BackendRuntime {
                backend: "metal".to_string(),
                pair: None,
                site: None,
                detail: format!("pipeline state creation failed: {e}"),
            })?;
        let queue = device.new_command_queue();
        let working_set_bytes = device.recommended_max_working_set_size();

        self.device = Some(device);
        self.queue = Some(queue);
        self.pipeline = Some(pipeline);
        tracing::info!(working_set_bytes, "metal device initialized");
        Ok(MemoryBudget { working_set_bytes })
    }

    fn run(
        &mut self,
        tensor: &PosteriorTensor,
        pairs: &[BranchPair],
    ) -> Result<SiteScalars, GrandConvError> {
        let device = self.device.as_ref().ok_or_else(|| GrandConvError::BackendRuntime {
            backend: "metal".to_string(),
            pair: None,
            site: None,
            detail: "run() called before init()".to_string(),
        })?;
        let queue = self.queue.as_ref().expect("queue present after init");
        let pipeline = self.pipeline.as_ref().expect("pipeline present after init");

        let num_sites = tensor.num_sites();
        let n = tensor.n();

        // Host-side precision conversion: the caller's buffers are
        // always 64-bit; this is the only backend that narrows.
        let con_p_f32: Vec<f32> = tensor.con_p_buffer().iter().map(|&v| v as f32).collect();
        let offsets_u32: Vec<u32> = tensor
            .offsets_buffer()
            .iter()
            .map(|&v| v as u32)
            .collect();
        let node_ids_i32: Vec<i32> = pairs
            .iter()
            .flat_map(|p| [i64::from(p.u) as i32, i64::from(p.v) as i32])
            .collect();

        let out_len = pairs.len() * num_sites;
        let out_bytes = (out_len * std::mem::size_of::<f32>()) as u64;

        // Stage into the buffers persisted on `self`, growing them only
        // when this call's data no longer fits.
        stage_grow_only(device, &mut self.con_p_buf, &con_p_f32);
        stage_grow_only(device, &mut self.offsets_buf, &offsets_u32);
        stage_grow_only(device, &mut self.node_ids_buf, &node_ids_i32);
        ensure_output_capacity(device, &mut self.out_c_buf, out_bytes);
        ensure_output_capacity(device, &mut self.out_d_buf, out_bytes);

        let con_p_buf = self.con_p_buf.as_ref().expect("staged above");
        let offsets_buf = self.offsets_buf.as_ref().expect("staged above");
        let node_ids_buf = self.node_ids_buf.as_ref().expect("staged above");
        let out_c_buf = self.out_c_buf.as_ref().expect("staged above");
        let out_d_buf = self.out_d_buf.as_ref().expect("staged above");

        let command_buffer = queue.new_command_buffer();
        let encoder = command_buffer.new_compute_command_encoder();
        encoder.set_compute_pipeline_state(pipeline);
        encoder.set_buffer(0, Some(con_p_buf), 0);
        encoder.set_buffer(1, Some(offsets_buf), 0);
        encoder.set_buffer(2, Some(node_ids_buf), 0);
        encoder.set_bytes(
            3,
            std::mem::size_of::<u32>() as u64,
            &(pairs.len() as u32) as *const u32 as *const _,
        );
        encoder.set_bytes(
            4,
            std::mem::size_of::<u32>() as u64,
            &(num_sites as u32) as *const u32 as *const _,
        );
        encoder.set_bytes(5, std::mem::size_of::<u32>() as u64, &(n as u32) as *const u32 as *const _);
        encoder.set_bytes(
            6,
            std::mem::size_of::<u32>() as u64,
            &(SITES_PER_THREAD as u32) as *const u32 as *const _,
        );
        encoder.set_buffer(7, Some(out_c_buf), 0);
        encoder.set_buffer(8, Some(out_d_buf), 0);

        let grid_y = num_sites.div_ceil(SITES_PER_THREAD);
        let grid_size = MTLSize::new(pairs.len() as u64, grid_y as u64, 1);
        let threadgroup_size = MTLSize::new(THREADGROUP.0, THREADGROUP.1, 1);
        encoder.dispatch_thread_groups(grid_size, threadgroup_size);
        encoder.end_encoding();
        command_buffer.commit();
        command_buffer.wait_until_completed();

        if let Some(err) = command_buffer.error() {
            return Err(GrandConvError::BackendRuntime {
                backend: "metal".to_string(),
                pair: None,
                site: None,
                detail: format!("command buffer failed: {err}"),
            });
        }

        let host_c: &[f32] = unsafe {
            std::slice::from_raw_parts(out_c_buf.contents() as *const f32, out_len)
        };
        let host_d: &[f32] = unsafe {
            std::slice::from_raw_parts(out_d_buf.contents() as *const f32, out_len)
        };

        let mut p_convergent = vec![0.0f64; pairs.len()];
        let mut p_divergent = vec![0.0f64; pairs.len()];
        let mut per_site = Vec::new();
        for (i, pair) in pairs.iter().enumerate() {
            let c_row = &host_c[i * num_sites..(i + 1) * num_sites];
            let d_row = &host_d[i * num_sites..(i + 1) * num_sites];
            p_convergent[i] = c_row.iter().map(|&v| v as f64).sum();
            p_divergent[i] = d_row.iter().map(|&v| v as f64).sum();
            if pair.selected {
                per_site.push(PerPairSiteTable {
                    pair: *pair,
                    pair_index: i,
                    rows: c_row
                        .iter()
                        .zip(d_row)
                        .map(|(&c, &d)| (c as f64, d as f64))
                        .collect(),
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
        self.con_p_buf = None;
        self.offsets_buf = None;
        self.node_ids_buf = None;
        self.out_c_buf = None;
        self.out_d_buf = None;
        self.pipeline = None;
        self.queue = None;
        self.device = None;
    }
}

/// Stages `data` into `slot`, reusing the existing buffer when it
/// already has room (copying fresh data into its leading bytes) and
/// only reallocating, grow-only, when `data` no longer fits.
fn stage_grow_only<T>(device: &Device, slot: &mut Option<metal::Buffer>, data: &[T]) {
    let bytes_needed = std::mem::size_of_val(data) as u64;
    let needs_grow = match slot {
        Some(buf) => buf.length() < bytes_needed,
        None => true,
    };
    if needs_grow {
        *slot = Some(device.new_buffer_with_data(
            data.as_ptr() as *const _,
            bytes_needed,
            MTLResourceOptions::StorageModeShared,
        ));
    } else if let Some(buf) = slot {
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr() as *const u8,
                buf.contents() as *mut u8,
                bytes_needed as usize,
            );
        }
    }
}

/// Ensures `slot` holds a buffer of at least `bytes_needed` capacity,
/// grow-only; output buffers are overwritten in full by every kernel
/// dispatch, so no data needs to be preserved on reuse.
fn ensure_output_capacity(device: &Device, slot: &mut Option<metal::Buffer>, bytes_needed: u64) {
    let needs_grow = match slot {
        Some(buf) => buf.length() < bytes_needed,
        None => true,
    };
    if needs_grow {
        *slot = Some(device.new_buffer(bytes_needed, MTLResourceOptions::StorageModeShared));
    }
}

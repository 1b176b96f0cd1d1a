//! Backend selection and the top-level execute entry point. The CPU
//! backend is always available; the OpenCL backend is compiled in behind
//! the `opencl` feature and picked for large enough subgraphs.

pub mod cpu;
pub mod gpu;

use tracing::debug;

use crate::context::{self, BackendMask};
use crate::errors::{self, FlintResult};
use crate::graph::NodeRef;
use crate::ops::operator_for;

/// Initializes the requested backends. Optional; execution initializes
/// lazily on first use.
pub fn init(mask: BackendMask) -> FlintResult<()> {
    if mask.contains(BackendMask::CPU) {
        cpu::init_cpu()?;
    }
    if mask.contains(BackendMask::GPU) {
        gpu::init_gpu()?;
    }
    Ok(())
}

/// Releases backend resources. Safe to call on uninitialized backends.
pub fn cleanup() {
    gpu::cleanup_gpu();
    cpu::cleanup_cpu();
}

/// Subgraph cost below which the GPU is not worth the transfer: the sum
/// of per-node scores over the unmaterialized region.
const GPU_SCORE_THRESHOLD: usize = 1024;

/// Sum of `elements * operation_score` over the not-yet-materialized
/// subgraph under `node`.
pub(crate) fn cumulative_score(node: &NodeRef) -> usize {
    let mut seen = std::collections::HashSet::new();
    let mut stack = vec![node.clone()];
    let mut total = 0usize;
    while let Some(n) = stack.pop() {
        if n.has_result() || !seen.insert(n.id()) {
            continue;
        }
        total = total
            .saturating_add(n.num_elements().saturating_mul(operator_for(n.code()).operation_score(&n)));
        for pred in n.predecessors() {
            stack.push(pred);
        }
    }
    total
}

/// Materializes the node's result, choosing a backend: the GPU when it is
/// up and the subgraph is heavy (or the CPU is down), the CPU otherwise.
/// Backends initialize on demand according to what is compiled in.
pub fn execute(node: &NodeRef) -> FlintResult<()> {
    errors::record(execute_inner(node))
}

fn execute_inner(node: &NodeRef) -> FlintResult<()> {
    if node.has_result() {
        return Ok(());
    }
    let initialized = context::initialized_backends();
    if !initialized.contains(BackendMask::CPU) && !initialized.contains(BackendMask::GPU) {
        cpu::init_cpu()?;
        if gpu::is_available() {
            let _ = gpu::init_gpu();
        }
    }
    let initialized = context::initialized_backends();
    let use_gpu = initialized.contains(BackendMask::GPU)
        && (!initialized.contains(BackendMask::CPU)
            || cumulative_score(node) >= GPU_SCORE_THRESHOLD);
    if use_gpu {
        debug!(node = node.id(), "dispatching subgraph to the GPU");
        gpu::execute_gpu_lazily(node)
    } else {
        cpu::execute_cpu(node)
    }
}

/// Forces host residency of the node's result.
pub fn sync_memory(node: &NodeRef) -> FlintResult<()> {
    errors::record(crate::memory::sync_memory(node))
}

//! The CPU executor: topological materialization of a node's subgraph
//! with chunked dispatch onto the persistent worker pool. Small nodes run
//! inline on the caller thread; everything else is split into equal
//! chunks, one per worker, with the first failing chunk cancelling the
//! rest.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::context::{self, BackendMask};
use crate::data::TensorData;
use crate::errors::FlintResult;
use crate::graph::{NodeRef, OpCode, OpKind};
use crate::memory::{self, ResultData};
use crate::ops::{operator_for, CpuInput};

/// Score below which a node is cheaper to run inline than to dispatch.
const PARALLEL_SCORE_THRESHOLD: usize = 512;

pub(crate) fn init_cpu() -> FlintResult<()> {
    // The worker pool is the process-global rayon pool; nothing to spawn,
    // only the flag to publish.
    context::CONTEXT.mark_initialized(BackendMask::CPU);
    Ok(())
}

pub(crate) fn cleanup_cpu() {
    context::CONTEXT.mark_uninitialized(BackendMask::CPU);
}

#[cfg(feature = "rayon")]
fn pool_size() -> usize {
    rayon::current_num_threads().max(1)
}

#[cfg(not(feature = "rayon"))]
fn pool_size() -> usize {
    1
}

/// Executes the subgraph under `root` on the CPU, materializing every
/// node that has no result yet. Intermediate results whose nodes are not
/// referenced from outside the executed region are released afterwards,
/// unless eager mode keeps them for reuse.
pub fn execute_cpu(root: &NodeRef) -> FlintResult<()> {
    if !context::initialized_backends().contains(BackendMask::CPU) {
        init_cpu()?;
    }
    if root.has_result() {
        return Ok(());
    }
    let (order, inner_edges) = collect_pending(root)?;
    for node in &order {
        execute_node(node)?;
    }
    if !context::is_eager_execution() {
        release_intermediates(root, &order, &inner_edges);
    }
    Ok(())
}

/// Post-order (predecessors first) list of the unmaterialized nodes under
/// `root`, plus the number of in-subgraph consumer edges per node. Heavy
/// predecessors are handed to the GPU first when both backends are up.
fn collect_pending(root: &NodeRef) -> FlintResult<(Vec<NodeRef>, HashMap<usize, usize>)> {
    let mut order = Vec::new();
    let mut edges: HashMap<usize, usize> = HashMap::new();
    let mut visited = std::collections::HashSet::new();
    let mut stack = vec![(root.clone(), false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !visited.insert(node.id()) {
            continue;
        }
        #[cfg(feature = "opencl")]
        if node.id() != root.id()
            && context::initialized_backends().contains(BackendMask::GPU)
            && super::cumulative_score(&node) >= super::GPU_SCORE_THRESHOLD
        {
            super::gpu::execute_gpu_lazily(&node)?;
            memory::sync_memory(&node)?;
        }
        if node.has_result() && node.id() != root.id() {
            continue;
        }
        stack.push((node.clone(), true));
        for pred in node.predecessors() {
            if !pred.has_result() {
                *edges.entry(pred.id()).or_insert(0) += 1;
            }
            stack.push((pred, false));
        }
    }
    Ok((order, edges))
}

/// Runs one node's kernel over its materialized predecessors.
fn execute_node(node: &NodeRef) -> FlintResult<()> {
    if node.has_result() {
        return Ok(());
    }
    let code = node.code();
    // Storage owns its data; republishing it is free.
    if let OpKind::Store { data } = node.kind() {
        node.set_result(ResultData::from_host(data));
        return Ok(());
    }
    let preds = node.predecessors();
    // Host kernels read predecessors through shared buffers, so only the
    // pure metadata rewrites can take an input buffer over; the registry's
    // reuse mask confirms the takeover for input 0.
    if matches!(code, OpCode::Flatten | OpCode::Reshape)
        && operator_for(code)
            .reuses_inputs(node)
            .first()
            .copied()
            .unwrap_or(false)
    {
        let buffer = memory::result_buffer(&preds[0])?;
        node.set_result(ResultData::from_host(buffer));
        return Ok(());
    }
    let mut inputs = Vec::with_capacity(preds.len());
    for pred in &preds {
        inputs.push(CpuInput {
            data: memory::result_buffer(pred)?,
            shape: pred.shape(),
            force_inverse: pred.broadcasting_mode()
                == crate::graph::BroadcastMode::ForcedInverse,
        });
    }
    let n = node.num_elements();
    let op = operator_for(code);
    let mut out = TensorData::zeros(node.data_type(), n);
    let score = n.saturating_mul(op.operation_score(node));
    if score < PARALLEL_SCORE_THRESHOLD {
        out.apply_chunks(n.max(1), false, |chunk, from| {
            op.cpu_kernel(node, &inputs, chunk, from)
        })?;
    } else {
        let chunks = n.min(pool_size()).max(1);
        let chunk_size = n.div_ceil(chunks);
        trace!(node = node.id(), elements = n, chunks, "parallel dispatch");
        out.apply_chunks(chunk_size, true, |chunk, from| {
            op.cpu_kernel(node, &inputs, chunk, from)
        })?;
    }
    node.set_result(ResultData::from_host(Arc::new(out)));
    Ok(())
}

/// Frees results of nodes nothing outside the executed region can reach:
/// their reference count is exactly the in-region consumer edges plus the
/// clone held by the order list.
fn release_intermediates(root: &NodeRef, order: &[NodeRef], inner_edges: &HashMap<usize, usize>) {
    for node in order {
        if node.id() == root.id()
            || node.code() == OpCode::Store
            || node.has_gradient_watchers()
        {
            continue;
        }
        let inner = inner_edges.get(&node.id()).copied().unwrap_or(0);
        if node.reference_count() == inner + 1 {
            node.clear_result();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::new_store;
    use crate::ops::arithmetic::{add, mul};

    #[test]
    fn executes_a_small_chain() {
        let a = new_store(TensorData::F32(vec![1.0, 2.0]), vec![2]).unwrap();
        let b = new_store(TensorData::F32(vec![3.0, 4.0]), vec![2]).unwrap();
        let c = add(&a, &b).unwrap();
        let d = mul(&c, &c).unwrap();
        execute_cpu(&d).unwrap();
        let out = memory::result_buffer(&d).unwrap();
        assert_eq!(out.to_vec::<f32>(), vec![16.0, 36.0]);
        // We still hold a handle to the sum, so its result survives.
        assert!(c.has_result());
    }

    #[test]
    fn releases_unreferenced_intermediates() {
        let a = new_store(TensorData::F32(vec![1.0, 2.0]), vec![2]).unwrap();
        let d = {
            let c = add(&a, &a).unwrap();
            mul(&c, &c).unwrap()
        };
        execute_cpu(&d).unwrap();
        // The sum node is only reachable through `d` now; its buffer must
        // be gone while the root's stays.
        assert!(d.has_result());
        assert!(!d.predecessor(0).has_result());
    }
}

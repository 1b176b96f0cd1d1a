//! Result buffers and their lifetime: host/device duality, forced
//! device-to-host synchronization, and the opportunistic collapse of an
//! executed node into plain storage.

use std::sync::Arc;

use tracing::trace;

use crate::data::TensorData;
use crate::errors::{FlintError, FlintResult};
use crate::graph::{NodeRef, OpCode};

/// The materialized output of an executed node. The host buffer may be
/// absent while the data only lives on the device; reading through the
/// frontend forces a sync.
#[derive(Debug, Clone, Default)]
pub struct ResultData {
    pub data: Option<Arc<TensorData>>,
    #[cfg(feature = "opencl")]
    pub device: Option<crate::backend::gpu::DeviceBuffer>,
    pub num_entries: usize,
}

impl ResultData {
    pub fn from_host(data: Arc<TensorData>) -> ResultData {
        ResultData {
            num_entries: data.len(),
            data: Some(data),
            #[cfg(feature = "opencl")]
            device: None,
        }
    }

    #[cfg(feature = "opencl")]
    pub fn from_device(device: crate::backend::gpu::DeviceBuffer, num_entries: usize) -> ResultData {
        ResultData {
            data: None,
            device: Some(device),
            num_entries,
        }
    }
}

/// Ensures the node's result has a host buffer, downloading from the
/// device if necessary. A node without a result is left untouched.
pub fn sync_memory(node: &NodeRef) -> FlintResult<()> {
    let needs_download = node.with_result(|r| match r {
        Some(r) => r.data.is_none(),
        None => false,
    });
    if !needs_download {
        return Ok(());
    }
    #[cfg(feature = "opencl")]
    {
        let downloaded = crate::backend::gpu::download_result(node)?;
        node.with_result_mut(|r| {
            if let Some(r) = r {
                r.data = Some(Arc::new(downloaded));
            }
        });
        trace!(node = node.id(), "synced device result to host");
        Ok(())
    }
    #[cfg(not(feature = "opencl"))]
    {
        Err(FlintError::InternalError(
            "result has no host buffer and no device backend is compiled in".to_string(),
        ))
    }
}

/// The host buffer of an executed node, syncing from the device first when
/// needed. Fails on nodes that were never executed.
pub fn result_buffer(node: &NodeRef) -> FlintResult<Arc<TensorData>> {
    sync_memory(node)?;
    node.result_data().ok_or_else(|| {
        FlintError::InternalError("node has not been executed".to_string())
    })
}

/// Collapses an executed node without gradient watchers into a `Store`
/// that owns its data directly, releasing the predecessor subgraph. The
/// shape, data type and result stay as they are.
pub fn optimize_memory(node: &NodeRef) -> FlintResult<()> {
    if node.code() == OpCode::Store || node.has_gradient_watchers() {
        return Ok(());
    }
    if !node.has_result() {
        return Ok(());
    }
    let data = result_buffer(node)?;
    node.collapse_to_store(data);
    trace!(node = node.id(), "collapsed executed node into storage");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::new_store;

    #[test]
    fn sync_is_a_no_op_for_host_results() {
        let node = new_store(TensorData::F64(vec![1.0]), vec![1]).unwrap();
        sync_memory(&node).unwrap();
        assert!(node.result_data().is_some());
    }
}

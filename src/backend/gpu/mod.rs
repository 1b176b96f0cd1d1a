//! The OpenCL backend. Code generation (the fusion compiler, the eager
//! kernel library and the kernel cache) is always compiled and tested;
//! the device runtime underneath is gated behind the `opencl` feature.

pub mod cache;
pub mod codegen;
pub mod eager;

#[cfg(feature = "opencl")]
mod runtime;

#[cfg(feature = "opencl")]
pub use runtime::{
    cleanup_gpu, download_result, execute_gpu_eagerly, execute_gpu_lazily, init_gpu, is_available,
    DeviceBuffer,
};

#[cfg(not(feature = "opencl"))]
mod stub {
    use crate::errors::{FlintError, FlintResult};
    use crate::graph::NodeRef;

    pub fn is_available() -> bool {
        false
    }

    pub fn init_gpu() -> FlintResult<()> {
        Err(FlintError::OclError(
            "the OpenCL backend is not compiled in (enable the `opencl` feature)".to_string(),
        ))
    }

    pub fn cleanup_gpu() {}

    pub fn execute_gpu_lazily(_node: &NodeRef) -> FlintResult<()> {
        init_gpu()
    }

    pub fn execute_gpu_eagerly(_node: &NodeRef) -> FlintResult<()> {
        init_gpu()
    }
}

#[cfg(not(feature = "opencl"))]
pub use stub::{cleanup_gpu, execute_gpu_eagerly, execute_gpu_lazily, init_gpu, is_available};

//! Flint is a tensor computation engine: operations assemble a lazily
//! executed graph which runs on a multithreaded CPU backend or, behind
//! the `opencl` feature, on an OpenCL device with elementwise chains
//! fused into single kernels. Outputs can be differentiated with respect
//! to watched variables through reverse-mode automatic differentiation.
//!
//! ```
//! use flint::Tensor;
//!
//! # fn main() -> flint::FlintResult<()> {
//! let a = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2])?;
//! let b = Tensor::from_vec(vec![0.5f32, 0.5], &[2])?;
//! let c = a.add(&b)?.matmul(&a)?;
//! assert_eq!(c.shape(), vec![2, 2]);
//! c.execute()?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod context;
pub mod data;
pub mod errors;
pub mod gradient;
pub mod graph;
pub mod memory;
pub mod ops;
pub mod serialize;
pub mod shape;
pub mod tensor;

pub use context::{
    in_gradient_context, init_logging, is_eager_execution, set_eager_execution,
    set_logging_level, start_gradient_context, stop_gradient_context, BackendMask,
    GradientContext, LogLevel,
};
pub use data::{DataType, TensorData};
pub use errors::{
    clear_last_error, last_error_kind, last_error_message, ErrorKind, FlintError, FlintResult,
};
pub use gradient::{
    calculate_gradient, calculate_gradients, mark_gradient_variable, unmark_gradient_variable,
};
pub use graph::{NodeRef, OpCode};
pub use tensor::Tensor;

/// Initializes the selected backends eagerly. Execution initializes
/// lazily anyway; call this to control where startup cost lands or to
/// restrict the engine to one backend.
pub fn init(mask: BackendMask) -> FlintResult<()> {
    backend::init(mask)
}

/// Tears down backend resources.
pub fn cleanup() {
    backend::cleanup();
}

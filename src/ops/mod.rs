//! The operator registry: one implementation bundle per operation kind,
//! covering the CPU kernel, the two OpenCL code generators, kernel
//! argument packing, the local gradient rule and the scheduling score.
//!
//! Dispatch is a match on [`OpCode`] returning a static instance; the
//! graph stores plain tagged operations, not trait objects.

pub mod arithmetic;
pub mod compare;
pub mod conv;
pub mod generate;
pub mod index;
pub mod matmul;
pub mod reduce;
pub mod reshape;
pub mod window;

use std::sync::Arc;

use crate::backend;
use crate::backend::gpu::codegen::CodegenState;
use crate::context;
use crate::data::{DataType, OutChunk, TensorData};
use crate::errors::{self, FlintResult};
use crate::graph::{self, NodeRef, OpCode, OpKind};

/// A materialized predecessor handed to a CPU kernel.
pub struct CpuInput {
    pub data: Arc<TensorData>,
    pub shape: Vec<usize>,
    pub force_inverse: bool,
}

impl CpuInput {
    pub fn num_elements(&self) -> usize {
        crate::shape::num_elements(&self.shape)
    }
}

/// An extra kernel argument produced by the packing protocol of the eager
/// GPU runtime. Buffers for the node inputs themselves are implicit.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelArg {
    Int(i32),
    Long(i64),
    Double(f64),
    LongVec(Vec<i64>),
}

/// `(result type, input types)` tuples an eager kernel is prebuilt for.
pub type TypePermutation = (DataType, Vec<DataType>);

pub trait Operator: Send + Sync {
    /// Computes `out[0..len]`, the elements at global positions
    /// `from..from + len` of the node's flat result.
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()>;

    /// Emits this node's fragment into a fused kernel body, producing the
    /// SSA value `name`, and recurses into fusable predecessors.
    fn lazy_fragment(
        &self,
        node: &NodeRef,
        name: &str,
        state: &mut CodegenState,
    ) -> FlintResult<()>;

    /// Body of the prebuilt eager kernel for one type permutation.
    fn eager_source(&self, out_type: DataType, in_types: &[DataType]) -> String;

    /// Parameter declarations of the eager kernel, appended after
    /// `__global R, long num_entriesR`.
    fn eager_params(&self, _out_type: DataType, in_types: &[DataType]) -> String {
        let mut params = String::new();
        for (i, t) in in_types.iter().enumerate() {
            params.push_str(&format!(
                ", const __global {t}* P{i}, long num_entries{i}, long inv_broad{i}",
                t = t.ocl_name()
            ));
        }
        params
    }

    /// All type tuples the eager runtime prebuilds kernels for.
    fn type_permutations(&self) -> Vec<TypePermutation>;

    /// Extra (non-buffer) kernel arguments for the eager dispatch.
    fn extra_args(&self, _node: &NodeRef) -> Vec<KernelArg> {
        Vec::new()
    }

    /// Per-input extra arguments, packed right after each input's buffer
    /// and element count. The default matches the default
    /// [`eager_params`](Self::eager_params): the inverse-broadcasting
    /// stride of that operand.
    fn per_input_args(&self, node: &NodeRef, input: usize) -> Vec<KernelArg> {
        let pred = node.predecessor(input);
        let kind = crate::shape::broadcast_kind(
            &node.shape(),
            &pred.shape(),
            pred.broadcasting_mode() == crate::graph::BroadcastMode::ForcedInverse,
        );
        let (inv, _) =
            crate::shape::broadcast_wrap(node.num_elements(), pred.num_elements(), kind);
        vec![KernelArg::Long(inv as i64)]
    }

    /// The gradient contribution flowing to predecessor `index`, as a new
    /// graph; `None` when the operation has no derivative there.
    fn local_gradient(
        &self,
        node: &NodeRef,
        index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>>;

    /// Per-element cost estimate for the parallelization threshold.
    fn operation_score(&self, _node: &NodeRef) -> usize {
        1
    }

    /// True when the operation cannot be inlined into a fused kernel and
    /// must supply its result as a kernel parameter instead.
    fn pushes_parameters(&self) -> bool {
        false
    }

    /// Which predecessor result buffers may be overwritten in place by an
    /// eager kernel writing this node's result.
    fn reuses_inputs(&self, node: &NodeRef) -> Vec<bool> {
        vec![false; node.num_predecessors()]
    }
}

pub fn operator_for(code: OpCode) -> &'static dyn Operator {
    match code {
        OpCode::Store => &generate::StoreOp,
        OpCode::GenRandom => &generate::GenRandomOp,
        OpCode::GenConstant => &generate::GenConstantOp,
        OpCode::GenArange => &generate::GenArangeOp,
        OpCode::Dropout => &generate::DropoutOp,
        OpCode::Add => &arithmetic::AddOp,
        OpCode::Sub => &arithmetic::SubOp,
        OpCode::Mul => &arithmetic::MulOp,
        OpCode::Div => &arithmetic::DivOp,
        OpCode::Pow => &arithmetic::PowOp,
        OpCode::Neg => &arithmetic::NegOp,
        OpCode::Abs => &arithmetic::AbsOp,
        OpCode::Log => &arithmetic::LogOp,
        OpCode::Log2 => &arithmetic::Log2Op,
        OpCode::Log10 => &arithmetic::Log10Op,
        OpCode::Sin => &arithmetic::SinOp,
        OpCode::Cos => &arithmetic::CosOp,
        OpCode::Tan => &arithmetic::TanOp,
        OpCode::Asin => &arithmetic::AsinOp,
        OpCode::Acos => &arithmetic::AcosOp,
        OpCode::Atan => &arithmetic::AtanOp,
        OpCode::Sqrt => &arithmetic::SqrtOp,
        OpCode::Exp => &arithmetic::ExpOp,
        OpCode::Sign => &arithmetic::SignOp,
        OpCode::Even => &arithmetic::EvenOp,
        OpCode::Less => &compare::LessOp,
        OpCode::Greater => &compare::GreaterOp,
        OpCode::Equal => &compare::EqualOp,
        OpCode::Min => &compare::MinOp,
        OpCode::Max => &compare::MaxOp,
        OpCode::MatMul => &matmul::MatMulOp,
        OpCode::Flatten => &reshape::FlattenOp,
        OpCode::Reshape => &reshape::ReshapeOp,
        OpCode::Conversion => &reshape::ConversionOp,
        OpCode::Transpose => &reshape::TransposeOp,
        OpCode::Repeat => &reshape::RepeatOp,
        OpCode::Concat => &reshape::ConcatOp,
        OpCode::ReduceSum => &reduce::ReduceSumOp,
        OpCode::ReduceMul => &reduce::ReduceMulOp,
        OpCode::ReduceMin => &reduce::ReduceMinOp,
        OpCode::ReduceMax => &reduce::ReduceMaxOp,
        OpCode::Slice => &index::SliceOp,
        OpCode::Extend => &index::ExtendOp,
        OpCode::Index => &index::IndexOp,
        OpCode::SetIndex => &index::SetIndexOp,
        OpCode::SlidingWindow => &window::SlidingWindowOp,
        OpCode::UnslideWindow => &window::UnslideWindowOp,
        OpCode::PoolingSum => &window::PoolingSumOp,
        OpCode::PoolingMax => &window::PoolingMaxOp,
        OpCode::GradientPoolingMax => &window::GradientPoolingMaxOp,
        OpCode::Convolve => &conv::ConvolveOp,
        OpCode::GradientConvolve1 => &conv::GradientConvolve1Op,
        OpCode::GradientConvolve2 => &conv::GradientConvolve2Op,
    }
}

/// Links a validated operation into the graph and honors the eager flag.
pub(crate) fn link_node(
    kind: OpKind,
    data_type: DataType,
    shape: Vec<usize>,
    predecessors: Vec<NodeRef>,
) -> FlintResult<NodeRef> {
    let node = graph::new_node(kind, data_type, shape, predecessors);
    if context::is_eager_execution() {
        backend::execute(&node)?;
    }
    Ok(node)
}

/// A constant tensor with the shape and broadcast role of `like`. Used by
/// gradient rules that mix scalars into the graph, since broadcasting only
/// aligns whole dimensions.
pub fn constant_like(value: f64, like: &NodeRef, dtype: DataType) -> FlintResult<NodeRef> {
    generate::constant_of(value, like.shape(), dtype)
}

pub fn ones_like(like: &NodeRef, dtype: DataType) -> FlintResult<NodeRef> {
    constant_like(1.0, like, dtype)
}

pub fn zeros_like(like: &NodeRef, dtype: DataType) -> FlintResult<NodeRef> {
    constant_like(0.0, like, dtype)
}

/// Rebuilds the reduced-away axis of a reduction gradient: reshapes the
/// adjoint to carry a unit dimension at `axis`, then tiles it `size`
/// times, restoring the predecessor's shape.
pub(crate) fn broadcast_along(node: &NodeRef, axis: usize, size: usize) -> FlintResult<NodeRef> {
    let mut with_unit = node.shape();
    with_unit.insert(axis, 1);
    let reshaped = reshape::reshape(node, &with_unit)?;
    let mut reps = vec![0usize; with_unit.len()];
    reps[axis] = size - 1;
    reshape::repeat(&reshaped, &reps)
}

/// Public error-recording wrapper used by every builder entry point.
pub(crate) fn finish<T>(res: FlintResult<T>) -> FlintResult<T> {
    errors::record(res)
}

//! The computation graph: immutable-once-built nodes referencing their
//! predecessors through strong handles. Reference counting is the handle
//! count itself; dropping the last [`NodeRef`] of a node releases its
//! result and its predecessor edges, cascading through the graph.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::context;
use crate::data::{DataType, TensorData};
use crate::errors::FlintResult;
use crate::memory::ResultData;

/// Fieldless discriminant of [`OpKind`], used for registry dispatch and
/// fused-kernel cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Store,
    GenRandom,
    GenConstant,
    GenArange,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    Log,
    Sign,
    Even,
    Log2,
    Log10,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sqrt,
    Exp,
    Flatten,
    MatMul,
    Conversion,
    Reshape,
    Min,
    Max,
    ReduceSum,
    ReduceMul,
    ReduceMin,
    ReduceMax,
    Slice,
    Abs,
    Repeat,
    Transpose,
    Extend,
    Concat,
    Less,
    Equal,
    Greater,
    Convolve,
    GradientConvolve1,
    GradientConvolve2,
    Index,
    SetIndex,
    SlidingWindow,
    UnslideWindow,
    PoolingMax,
    PoolingSum,
    GradientPoolingMax,
    Dropout,
}

/// The tagged operation variant. Payloads carry the operation-specific
/// auxiliary data; the surrounding [`Operation`] carries shape, data type
/// and the broadcasting mode.
#[derive(Debug, Clone)]
pub enum OpKind {
    /// Terminal constant tensor owning its host data.
    Store { data: Arc<TensorData> },
    /// Uniform values in `[0, 1)` from a deterministic hash of the seed.
    GenRandom { seed: f64 },
    GenConstant { value: f64 },
    /// Indices along `axis` as `i64`.
    GenArange { axis: usize },
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    Log,
    Sign,
    Even,
    Log2,
    Log10,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sqrt,
    Exp,
    Flatten,
    /// Merges dimension `dim` into `dim - 1`.
    FlattenDim { dim: usize },
    MatMul,
    Conversion,
    Reshape,
    Min,
    Max,
    ReduceSum { axis: usize },
    ReduceMul { axis: usize },
    ReduceMin { axis: usize },
    ReduceMax { axis: usize },
    /// Normalized at construction: `start` is the first selected index per
    /// dimension (non-negative) and `step` may be negative.
    Slice { start: Vec<usize>, step: Vec<i64> },
    Abs,
    /// Tiling factors are implicit in the shape ratio to the predecessor.
    Repeat,
    Transpose { perm: Vec<usize> },
    /// Embeds the predecessor into a zero tensor; `insert_at` is the
    /// position of the first (or, for negative `step`, last) element.
    Extend { insert_at: Vec<usize>, step: Vec<i64> },
    Concat { axis: usize },
    Less,
    Equal,
    Greater,
    Convolve { steps: Vec<usize> },
    GradientConvolve1 { steps: Vec<usize> },
    GradientConvolve2 { steps: Vec<usize> },
    Index,
    SetIndex,
    SlidingWindow { size: Vec<usize>, step: Vec<usize> },
    UnslideWindow { step: Vec<usize> },
    PoolingMax { size: Vec<usize>, step: Vec<usize> },
    PoolingSum { size: Vec<usize>, step: Vec<usize> },
    GradientPoolingMax { size: Vec<usize>, step: Vec<usize> },
    Dropout { probability: f64, seed: f64, training: bool },
}

impl OpKind {
    pub fn code(&self) -> OpCode {
        match self {
            OpKind::Store { .. } => OpCode::Store,
            OpKind::GenRandom { .. } => OpCode::GenRandom,
            OpKind::GenConstant { .. } => OpCode::GenConstant,
            OpKind::GenArange { .. } => OpCode::GenArange,
            OpKind::Add => OpCode::Add,
            OpKind::Sub => OpCode::Sub,
            OpKind::Mul => OpCode::Mul,
            OpKind::Div => OpCode::Div,
            OpKind::Pow => OpCode::Pow,
            OpKind::Neg => OpCode::Neg,
            OpKind::Log => OpCode::Log,
            OpKind::Sign => OpCode::Sign,
            OpKind::Even => OpCode::Even,
            OpKind::Log2 => OpCode::Log2,
            OpKind::Log10 => OpCode::Log10,
            OpKind::Sin => OpCode::Sin,
            OpKind::Cos => OpCode::Cos,
            OpKind::Tan => OpCode::Tan,
            OpKind::Asin => OpCode::Asin,
            OpKind::Acos => OpCode::Acos,
            OpKind::Atan => OpCode::Atan,
            OpKind::Sqrt => OpCode::Sqrt,
            OpKind::Exp => OpCode::Exp,
            OpKind::Flatten | OpKind::FlattenDim { .. } => OpCode::Flatten,
            OpKind::MatMul => OpCode::MatMul,
            OpKind::Conversion => OpCode::Conversion,
            OpKind::Reshape => OpCode::Reshape,
            OpKind::Min => OpCode::Min,
            OpKind::Max => OpCode::Max,
            OpKind::ReduceSum { .. } => OpCode::ReduceSum,
            OpKind::ReduceMul { .. } => OpCode::ReduceMul,
            OpKind::ReduceMin { .. } => OpCode::ReduceMin,
            OpKind::ReduceMax { .. } => OpCode::ReduceMax,
            OpKind::Slice { .. } => OpCode::Slice,
            OpKind::Abs => OpCode::Abs,
            OpKind::Repeat => OpCode::Repeat,
            OpKind::Transpose { .. } => OpCode::Transpose,
            OpKind::Extend { .. } => OpCode::Extend,
            OpKind::Concat { .. } => OpCode::Concat,
            OpKind::Less => OpCode::Less,
            OpKind::Equal => OpCode::Equal,
            OpKind::Greater => OpCode::Greater,
            OpKind::Convolve { .. } => OpCode::Convolve,
            OpKind::GradientConvolve1 { .. } => OpCode::GradientConvolve1,
            OpKind::GradientConvolve2 { .. } => OpCode::GradientConvolve2,
            OpKind::Index => OpCode::Index,
            OpKind::SetIndex => OpCode::SetIndex,
            OpKind::SlidingWindow { .. } => OpCode::SlidingWindow,
            OpKind::UnslideWindow { .. } => OpCode::UnslideWindow,
            OpKind::PoolingMax { .. } => OpCode::PoolingMax,
            OpKind::PoolingSum { .. } => OpCode::PoolingSum,
            OpKind::GradientPoolingMax { .. } => OpCode::GradientPoolingMax,
            OpKind::Dropout { .. } => OpCode::Dropout,
        }
    }
}

/// Broadcasting mode of a node when it is consumed as a binary operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BroadcastMode {
    #[default]
    Normal,
    ForcedInverse,
}

/// One operation: kind plus the shape and data type its result will have.
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OpKind,
    pub data_type: DataType,
    pub shape: Vec<usize>,
    pub broadcasting_mode: BroadcastMode,
}

/// A vertex of the computation graph. Only `operation` (on storage
/// collapse), `predecessors` (same), `result` and `gradient_info` are ever
/// written after construction.
pub struct GraphNode {
    operation: RwLock<Operation>,
    predecessors: RwLock<Vec<NodeRef>>,
    result: RwLock<Option<ResultData>>,
    /// Ids of watched variables reachable through this node. Only
    /// maintained while a gradient context is active.
    gradient_info: RwLock<HashSet<NodeId>>,
}

/// Stable identity of a node while at least one handle to it is alive.
pub type NodeId = usize;

/// Strong handle to a [`GraphNode`]. Cloning increments the node's
/// reference count, dropping decrements it; the count therefore equals the
/// number of frontend handles plus incoming predecessor edges.
#[derive(Clone)]
pub struct NodeRef(Arc<GraphNode>);

impl std::fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRef")
            .field("op", &self.code())
            .field("shape", &self.shape())
            .field("data_type", &self.data_type())
            .field("refcount", &self.reference_count())
            .finish()
    }
}

impl NodeRef {
    pub fn id(&self) -> NodeId {
        Arc::as_ptr(&self.0) as NodeId
    }

    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn code(&self) -> OpCode {
        self.0.operation.read().kind.code()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.0.operation.read().shape.clone()
    }

    pub fn rank(&self) -> usize {
        self.0.operation.read().shape.len()
    }

    pub fn data_type(&self) -> DataType {
        self.0.operation.read().data_type
    }

    pub fn num_elements(&self) -> usize {
        crate::shape::num_elements(&self.0.operation.read().shape)
    }

    pub fn broadcasting_mode(&self) -> BroadcastMode {
        self.0.operation.read().broadcasting_mode
    }

    /// Marks this node for inverse broadcasting when used as an operand.
    pub fn enable_inverse_broadcasting(&self) {
        self.0.operation.write().broadcasting_mode = BroadcastMode::ForcedInverse;
    }

    pub fn disable_inverse_broadcasting(&self) {
        self.0.operation.write().broadcasting_mode = BroadcastMode::Normal;
    }

    /// Read access to the operation, including its payload.
    pub fn with_operation<R>(&self, f: impl FnOnce(&Operation) -> R) -> R {
        f(&self.0.operation.read())
    }

    pub fn kind(&self) -> OpKind {
        self.0.operation.read().kind.clone()
    }

    pub fn predecessors(&self) -> Vec<NodeRef> {
        self.0.predecessors.read().clone()
    }

    pub fn predecessor(&self, i: usize) -> NodeRef {
        self.0.predecessors.read()[i].clone()
    }

    pub fn num_predecessors(&self) -> usize {
        self.0.predecessors.read().len()
    }

    pub fn has_result(&self) -> bool {
        self.0.result.read().is_some()
    }

    pub fn with_result<R>(&self, f: impl FnOnce(Option<&ResultData>) -> R) -> R {
        f(self.0.result.read().as_ref())
    }

    pub fn with_result_mut<R>(&self, f: impl FnOnce(&mut Option<ResultData>) -> R) -> R {
        f(&mut self.0.result.write())
    }

    pub fn set_result(&self, result: ResultData) {
        *self.0.result.write() = Some(result);
    }

    pub fn clear_result(&self) {
        *self.0.result.write() = None;
    }

    /// The host buffer of this node's result, if present.
    pub fn result_data(&self) -> Option<Arc<TensorData>> {
        self.0.result.read().as_ref().and_then(|r| r.data.clone())
    }

    /// Marks this node as a gradient variable; reverse accumulation can
    /// later be asked for derivatives with respect to it.
    pub fn watch(&self) {
        self.0.gradient_info.write().insert(self.id());
    }

    /// Removes the gradient mark set by [`watch`](Self::watch).
    pub fn unwatch(&self) {
        self.0.gradient_info.write().remove(&self.id());
    }

    pub fn is_watched(&self) -> bool {
        self.0.gradient_info.read().contains(&self.id())
    }

    /// True when the watched variable `id` is reachable through this node.
    pub fn tracks(&self, id: NodeId) -> bool {
        self.0.gradient_info.read().contains(&id)
    }

    pub fn has_gradient_watchers(&self) -> bool {
        !self.0.gradient_info.read().is_empty()
    }

    pub fn gradient_info(&self) -> HashSet<NodeId> {
        self.0.gradient_info.read().clone()
    }

    /// Collapses this node into a `Store` owning `data`, releasing its
    /// predecessor edges. Used by the memory optimizer once a result is
    /// final and by no one else.
    pub(crate) fn collapse_to_store(&self, data: Arc<TensorData>) {
        let mut op = self.0.operation.write();
        op.kind = OpKind::Store { data };
        drop(op);
        self.0.predecessors.write().clear();
    }
}

/// Links a freshly validated operation into the graph. Inside a gradient
/// context the new node inherits the union of its predecessors' watched
/// sets; outside, the bookkeeping is skipped entirely.
pub fn new_node(
    kind: OpKind,
    data_type: DataType,
    shape: Vec<usize>,
    predecessors: Vec<NodeRef>,
) -> NodeRef {
    debug_assert!(!shape.is_empty(), "nodes always have rank >= 1");
    let mut gradient_info = HashSet::new();
    if context::in_gradient_context() {
        for pred in &predecessors {
            gradient_info.extend(pred.0.gradient_info.read().iter().copied());
        }
    }
    NodeRef(Arc::new(GraphNode {
        operation: RwLock::new(Operation {
            kind,
            data_type,
            shape,
            broadcasting_mode: BroadcastMode::Normal,
        }),
        predecessors: RwLock::new(predecessors),
        result: RwLock::new(None),
        gradient_info: RwLock::new(gradient_info),
    }))
}

/// Creates a `Store` node owning `data`. The result is materialized
/// immediately since the data already exists.
pub fn new_store(data: TensorData, shape: Vec<usize>) -> FlintResult<NodeRef> {
    let n = crate::shape::num_elements(&shape);
    if n != data.len() {
        return crate::errors::record(Err(crate::errors::FlintError::incompatible_shapes(
            &shape,
            &[data.len()],
            "shape does not cover the provided buffer",
        )));
    }
    let dtype = data.data_type();
    let data = Arc::new(data);
    let node = new_node(
        OpKind::Store { data: data.clone() },
        dtype,
        shape,
        Vec::new(),
    );
    node.set_result(ResultData::from_host(data));
    Ok(node)
}

//! The lazy fusion compiler: walks a subgraph from its root, inlines every
//! fusable operation's code fragment into a single kernel body and turns
//! materialized or push-parameter nodes into kernel inputs.
//!
//! Fragments are *prepended* to the body, so a node's code ends up after
//! the code of everything it reads. Values are SSA-named `v0, v1, ...`;
//! `v0` is always the root. The linear `index` variable is mutable and is
//! saved/remapped/restored around the subtree of every shape-changing or
//! broadcast-wrapped operand, so parameter loads inside that subtree read
//! the remapped position.
//!
//! No OpenCL types appear here; the output is source text plus the cache
//! key, which makes the whole compiler testable without a device.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::data::DataType;
use crate::errors::FlintResult;
use crate::graph::{NodeId, NodeRef};
use crate::ops::operator_for;
use crate::shape::{broadcast_kind, broadcast_wrap, BroadcastKind};

/// Build state threaded through one fusion walk.
pub struct CodegenState {
    /// Body fragments in prepend order: the final body is the reverse
    /// concatenation.
    segments: Vec<String>,
    /// Highest SSA value number handed out so far.
    pub variable_index: usize,
    /// Counter for scoped `index` rebinds.
    num_indices: usize,
    parameters: Vec<NodeRef>,
    /// Per parameter: every load so far happened at the unmodified global
    /// index. Only such a buffer may double as the kernel's output.
    param_aligned: Vec<bool>,
    assigned: HashMap<NodeId, usize>,
    /// Depth of active `index` rebinds around the current emission point.
    remap_depth: usize,
    key: String,
}

impl CodegenState {
    fn new() -> CodegenState {
        CodegenState {
            segments: Vec::new(),
            variable_index: 0,
            num_indices: 0,
            parameters: Vec::new(),
            param_aligned: Vec::new(),
            assigned: HashMap::new(),
            remap_depth: 0,
            key: String::new(),
        }
    }

    /// Prepends a fragment to the kernel body.
    pub fn prepend(&mut self, code: impl Into<String>) {
        self.segments.push(code.into());
    }

    /// Hands out the next SSA value name.
    pub fn next_name(&mut self) -> String {
        self.variable_index += 1;
        format!("v{}", self.variable_index)
    }

    /// Hands out the next scoped-index slot.
    pub fn next_index_slot(&mut self) -> usize {
        let slot = self.num_indices;
        self.num_indices += 1;
        slot
    }

    fn intern_parameter(&mut self, node: &NodeRef) -> usize {
        if let Some(&i) = self.assigned.get(&node.id()) {
            return i;
        }
        let i = self.parameters.len();
        self.assigned.insert(node.id(), i);
        self.parameters.push(node.clone());
        self.param_aligned.push(true);
        let _ = write!(self.key, "p{:?};", node.data_type());
        i
    }

    /// Registers `node` as a kernel input, reusing the slot when the node
    /// already is one, and returns its parameter name. Fragments call this
    /// to read the buffer at computed offsets, which ends the parameter's
    /// aligned-load status.
    pub fn find_or_insert_parameter(&mut self, node: &NodeRef) -> String {
        let i = self.intern_parameter(node);
        self.param_aligned[i] = false;
        format!("P{i}")
    }

    /// Registers a parameter that is about to be loaded at the current
    /// `index`; alignment survives only outside every rebind scope.
    fn load_parameter(&mut self, node: &NodeRef) -> String {
        let i = self.intern_parameter(node);
        if self.remap_depth > 0 {
            self.param_aligned[i] = false;
        }
        format!("P{i}")
    }

    fn enter_remap(&mut self) {
        self.remap_depth += 1;
    }

    fn leave_remap(&mut self) {
        debug_assert!(self.remap_depth > 0);
        self.remap_depth -= 1;
    }

    fn record_fragment(&mut self, node: &NodeRef) {
        let _ = write!(self.key, "{:?}:{:?};", node.code(), node.data_type());
    }

    fn body(&self) -> String {
        let mut out = String::new();
        for seg in self.segments.iter().rev() {
            out.push_str(seg);
        }
        out
    }
}

/// A generated fused kernel: its full source, the structural cache key and
/// the external inputs in parameter order. `aligned_parameters` marks
/// inputs every load of which reads the unmodified global index; the
/// dispatcher may let such a buffer double as the output.
#[derive(Debug)]
pub struct FusedKernel {
    pub source: String,
    pub cache_key: String,
    pub parameters: Vec<NodeRef>,
    pub aligned_parameters: Vec<bool>,
    pub out_type: DataType,
    pub num_entries: usize,
}

/// Emits the value of `node` as `name`. Non-root nodes that are already
/// materialized or that push parameters become kernel inputs loaded at the
/// current `index`; everything else inlines its fragment.
pub fn emit_value(state: &mut CodegenState, node: &NodeRef, name: &str) -> FlintResult<()> {
    let op = operator_for(node.code());
    if node.has_result() || op.pushes_parameters() {
        let par = state.load_parameter(node);
        state.prepend(format!(
            "const {t} {name} = {par}[index];\n",
            t = node.data_type().ocl_name()
        ));
        return Ok(());
    }
    state.record_fragment(node);
    op.lazy_fragment(node, name, state)
}

/// Emits one operand of a broadcasting operation, inserting the standard
/// `(index / inv_stride) % num_entries` wrap around the operand's subtree
/// when its shape differs from the parent's. Equal shapes are emitted
/// directly, which keeps the inverse-broadcasting mark advisory.
pub fn emit_operand(
    state: &mut CodegenState,
    parent: &NodeRef,
    operand: &NodeRef,
    name: &str,
) -> FlintResult<()> {
    let kind = broadcast_kind(
        &parent.shape(),
        &operand.shape(),
        operand.broadcasting_mode() == crate::graph::BroadcastMode::ForcedInverse,
    );
    if kind == BroadcastKind::Identity {
        return emit_value(state, operand, name);
    }
    let (inv, modulus) = broadcast_wrap(parent.num_elements(), operand.num_elements(), kind);
    let slot = state.next_index_slot();
    state.prepend(format!("index = old_index{slot};\n"));
    state.enter_remap();
    let emitted = emit_value(state, operand, name);
    state.leave_remap();
    emitted?;
    state.prepend(format!(
        "const long old_index{slot} = index;\nindex = (index / {inv}) % {modulus};\n"
    ));
    Ok(())
}

/// Emits a shape-changing operand subtree under a remapped `index`. The
/// fragment passes the code computing the source index from the saved
/// `old_index{slot}`; loads inside the subtree then read the remapped
/// position, and `index` is restored afterwards.
pub fn emit_remapped_operand(
    state: &mut CodegenState,
    operand: &NodeRef,
    name: &str,
    remap: &str,
) -> FlintResult<()> {
    let slot = state.next_index_slot();
    state.prepend(format!("index = old_index{slot};\n"));
    state.enter_remap();
    let emitted = emit_value(state, operand, name);
    state.leave_remap();
    emitted?;
    state.prepend(format!(
        "const long old_index{slot} = index;\n{{\nconst long working_index = old_index{slot};\n{remap}}}\n"
    ));
    Ok(())
}

/// Walks the subgraph under `root` and produces the fused kernel.
pub fn generate_fused_kernel(root: &NodeRef) -> FlintResult<FusedKernel> {
    let mut state = CodegenState::new();
    state.record_fragment(root);
    operator_for(root.code()).lazy_fragment(root, "v0", &mut state)?;

    let out_type = root.data_type();
    let mut source = format!(
        "__kernel void execute_graph(__global {t}* R, const long num_entriesR",
        t = out_type.ocl_name()
    );
    for (i, p) in state.parameters.iter().enumerate() {
        let _ = write!(
            source,
            ", const __global {t}* P{i}, const long num_entries_P{i}",
            t = p.data_type().ocl_name()
        );
    }
    source.push_str(
        ") {\nlong index = get_global_id(0);\nif (index >= num_entriesR) return;\n",
    );
    source.push_str(&state.body());
    source.push_str("R[index] = v0;\n}\n");

    Ok(FusedKernel {
        source,
        cache_key: state.key,
        parameters: state.parameters,
        aligned_parameters: state.param_aligned,
        out_type,
        num_entries: root.num_elements(),
    })
}

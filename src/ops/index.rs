//! Index modifications: basic slicing with negative steps, embedding into
//! a larger zero tensor, gathering along an axis and the summing scatter
//! that inverts it.

use crate::backend::gpu::codegen::{emit_remapped_operand, CodegenState};
use crate::data::{DataType, OutChunk, TensorElement};
use crate::dispatch_chunk;
use crate::errors::{FlintError, FlintResult};
use crate::graph::{NodeRef, OpKind};
use crate::ops::arithmetic::mul;
use crate::ops::{
    finish, link_node, ones_like, zeros_like, CpuInput, KernelArg, Operator, TypePermutation,
};
use crate::shape::accumulated_strides;

// ---------------------------------------------------------------------------
// Builders

/// Basic slicing with NumPy semantics: negative `start`/`end` count from
/// the end of the dimension, a negative `step` reverses traversal and
/// `end` is always exclusive.
pub fn slice(a: &NodeRef, start: &[i64], end: &[i64], step: &[i64]) -> FlintResult<NodeRef> {
    finish(slice_builder(a, start, end, step))
}

fn slice_builder(a: &NodeRef, start: &[i64], end: &[i64], step: &[i64]) -> FlintResult<NodeRef> {
    let shape = a.shape();
    if start.len() != shape.len() || end.len() != shape.len() || step.len() != shape.len() {
        return Err(FlintError::IllegalDimensionality(format!(
            "slice arguments must have one entry per dimension, tensor has rank {}",
            shape.len()
        )));
    }
    let mut norm_start = Vec::with_capacity(shape.len());
    let mut out_shape = Vec::with_capacity(shape.len());
    for d in 0..shape.len() {
        let dim = shape[d] as i64;
        if step[d] == 0 {
            return Err(FlintError::InvalidSelect(format!(
                "slice step of dimension {d} is zero"
            )));
        }
        let s = if start[d] < 0 { start[d] + dim } else { start[d] };
        let e = if end[d] < 0 { end[d] + dim } else { end[d] };
        if s < 0 || s >= dim || e > dim || e < -1 {
            return Err(FlintError::InvalidSelect(format!(
                "slice bounds {}..{} are outside dimension {d} of size {dim}",
                start[d], end[d]
            )));
        }
        let span = e - s;
        let size = if step[d] > 0 {
            (span + step[d] - 1) / step[d]
        } else {
            (span + step[d] + 1) / step[d]
        };
        if size <= 0 {
            return Err(FlintError::InvalidSelect(format!(
                "slice of dimension {d} selects nothing ({}..{} by {})",
                start[d], end[d], step[d]
            )));
        }
        norm_start.push(s as usize);
        out_shape.push(size as usize);
    }
    link_node(
        OpKind::Slice {
            start: norm_start,
            step: step.to_vec(),
        },
        a.data_type(),
        out_shape,
        vec![a.clone()],
    )
}

/// Embeds `a` into a zero tensor of `new_shape`, starting at `insert_at`
/// with unit steps.
pub fn extend(a: &NodeRef, new_shape: &[usize], insert_at: &[usize]) -> FlintResult<NodeRef> {
    let steps = vec![1i64; a.rank()];
    extend_step(a, new_shape, insert_at, &steps)
}

/// Embeds `a` into a zero tensor of `new_shape`: element `j` of dimension
/// `d` lands at `insert_at[d] + j * step[d]` (for negative steps the
/// dimension is reversed, with `insert_at` the position of the last
/// element). Positions in between stay zero.
pub fn extend_step(
    a: &NodeRef,
    new_shape: &[usize],
    insert_at: &[usize],
    step: &[i64],
) -> FlintResult<NodeRef> {
    finish(extend_builder(a, new_shape, insert_at, step))
}

fn extend_builder(
    a: &NodeRef,
    new_shape: &[usize],
    insert_at: &[usize],
    step: &[i64],
) -> FlintResult<NodeRef> {
    let shape = a.shape();
    if new_shape.len() != shape.len() || insert_at.len() != shape.len() || step.len() != shape.len()
    {
        return Err(FlintError::IllegalDimensionality(format!(
            "extend arguments must have one entry per dimension, tensor has rank {}",
            shape.len()
        )));
    }
    for d in 0..shape.len() {
        if step[d] == 0 {
            return Err(FlintError::InvalidSelect(format!(
                "extend step of dimension {d} is zero"
            )));
        }
        let reach = insert_at[d] + (shape[d] - 1) * step[d].unsigned_abs() as usize;
        if reach >= new_shape[d] {
            return Err(FlintError::InvalidSelect(format!(
                "dimension {d} reaches {reach} but the new shape ends at {}",
                new_shape[d]
            )));
        }
    }
    link_node(
        OpKind::Extend {
            insert_at: insert_at.to_vec(),
            step: step.to_vec(),
        },
        a.data_type(),
        new_shape.to_vec(),
        vec![a.clone()],
    )
}

/// Gathers along the axis `idx.rank - 1`: the output at position
/// `(..., j, ...)` is the source at `(..., idx[..., j], ...)`.
pub fn index(src: &NodeRef, idx: &NodeRef) -> FlintResult<NodeRef> {
    finish(index_builder(src, idx))
}

fn check_index_tensor(src: &NodeRef, idx: &NodeRef) -> FlintResult<usize> {
    if !idx.data_type().is_int() {
        return Err(FlintError::WrongType(
            "index tensors must be integers".to_string(),
        ));
    }
    let ss = src.shape();
    let si = idx.shape();
    if si.len() > ss.len() {
        return Err(FlintError::IllegalDimensionality(
            "index tensor rank exceeds the source rank".to_string(),
        ));
    }
    let axis = si.len() - 1;
    if si[..axis] != ss[..axis] {
        return Err(FlintError::incompatible_shapes(
            &ss,
            &si,
            "index tensor must match the source on its leading dimensions",
        ));
    }
    Ok(axis)
}

fn index_builder(src: &NodeRef, idx: &NodeRef) -> FlintResult<NodeRef> {
    let axis = check_index_tensor(src, idx)?;
    let mut shape = src.shape();
    shape[axis] = idx.shape()[axis];
    link_node(
        OpKind::Index,
        src.data_type(),
        shape,
        vec![src.clone(), idx.clone()],
    )
}

/// The summing scatter inverse of [`index`]: a target position named by at
/// least one entry of `idx` receives the sum of the matching `updates`
/// elements (the original value is discarded); untouched positions keep
/// the value from `src`.
pub fn set_index(src: &NodeRef, updates: &NodeRef, idx: &NodeRef) -> FlintResult<NodeRef> {
    finish(set_index_builder(src, updates, idx))
}

fn set_index_builder(src: &NodeRef, updates: &NodeRef, idx: &NodeRef) -> FlintResult<NodeRef> {
    let axis = check_index_tensor(src, idx)?;
    let mut expected = src.shape();
    expected[axis] = idx.shape()[axis];
    if updates.shape() != expected {
        return Err(FlintError::incompatible_shapes(
            &updates.shape(),
            &expected,
            "updates must be shaped like the source with the indexed axis resized",
        ));
    }
    link_node(
        OpKind::SetIndex,
        src.data_type(),
        src.shape(),
        vec![src.clone(), updates.clone(), idx.clone()],
    )
}

fn slice_params(node: &NodeRef) -> (Vec<usize>, Vec<i64>) {
    node.with_operation(|op| match &op.kind {
        OpKind::Slice { start, step } => (start.clone(), step.clone()),
        _ => (Vec::new(), Vec::new()),
    })
}

fn extend_params(node: &NodeRef) -> (Vec<usize>, Vec<i64>) {
    node.with_operation(|op| match &op.kind {
        OpKind::Extend { insert_at, step } => (insert_at.clone(), step.clone()),
        _ => (Vec::new(), Vec::new()),
    })
}

// ---------------------------------------------------------------------------
// CPU kernels

fn slice_cpu<T: TensorElement>(
    out: &mut [T],
    from: usize,
    node: &NodeRef,
    input: &CpuInput,
    start: &[usize],
    step: &[i64],
) {
    let shape = node.shape();
    let acc = accumulated_strides(&shape);
    let acc_pred = accumulated_strides(&input.shape);
    let base: i64 = start
        .iter()
        .zip(&acc_pred)
        .map(|(&s, &a)| (s * a) as i64)
        .sum();
    for (i, slot) in out.iter_mut().enumerate() {
        let gi = from + i;
        let mut j = base;
        for d in 0..shape.len() {
            let di = ((gi / acc[d]) % shape[d]) as i64;
            j += di * step[d] * acc_pred[d] as i64;
        }
        *slot = input.data.get(j as usize);
    }
}

fn extend_cpu<T: TensorElement>(
    out: &mut [T],
    from: usize,
    node: &NodeRef,
    input: &CpuInput,
    insert_at: &[usize],
    step: &[i64],
) {
    let shape = node.shape();
    let acc = accumulated_strides(&shape);
    let acc_pred = accumulated_strides(&input.shape);
    for (i, slot) in out.iter_mut().enumerate() {
        let gi = from + i;
        let mut j = 0usize;
        let mut inside = true;
        for d in 0..shape.len() {
            let magnitude = step[d].unsigned_abs() as usize;
            let mut di = (gi / acc[d]) % shape[d];
            if di < insert_at[d] {
                inside = false;
                break;
            }
            di -= insert_at[d];
            if di % magnitude != 0 {
                inside = false;
                break;
            }
            di /= magnitude;
            if di >= input.shape[d] {
                inside = false;
                break;
            }
            if step[d] < 0 {
                di = input.shape[d] - di - 1;
            }
            j += di * acc_pred[d];
        }
        *slot = if inside { input.data.get(j) } else { T::zero() };
    }
}

fn index_cpu<T: TensorElement>(
    out: &mut [T],
    from: usize,
    node: &NodeRef,
    inputs: &[CpuInput],
) {
    let shape = node.shape();
    let axis = inputs[1].shape.len() - 1;
    let acc_ax: usize = shape[axis + 1..].iter().product();
    let src_ax = inputs[0].shape[axis];
    for (i, slot) in out.iter_mut().enumerate() {
        let gi = from + i;
        let base = gi / (acc_ax * shape[axis]);
        let rest = gi % acc_ax;
        let ind: i64 = inputs[1].data.get(gi / acc_ax);
        *slot = inputs[0]
            .data
            .get(base * acc_ax * src_ax + ind as usize * acc_ax + rest);
    }
}

fn set_index_cpu<T: TensorElement>(
    out: &mut [T],
    from: usize,
    node: &NodeRef,
    inputs: &[CpuInput],
) {
    let shape = node.shape();
    let axis = inputs[2].shape.len() - 1;
    let acc_ax: usize = shape[axis + 1..].iter().product();
    let idx_ax = inputs[2].shape[axis];
    for (i, slot) in out.iter_mut().enumerate() {
        let gi = from + i;
        let base = gi / (acc_ax * shape[axis]);
        let rest = gi % acc_ax;
        let target = (gi / acc_ax) % shape[axis];
        let row = base * idx_ax;
        let mut acc = T::zero();
        let mut hit = false;
        for j in row..row + idx_ax {
            let ind: i64 = inputs[2].data.get(j);
            if ind as usize == target {
                hit = true;
                acc = acc + inputs[1].data.get(j * acc_ax + rest);
            }
        }
        *slot = if hit { acc } else { inputs[0].data.get(gi) };
    }
}

// ---------------------------------------------------------------------------
// Operators

pub struct SliceOp;

impl Operator for SliceOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        let (start, step) = slice_params(node);
        dispatch_chunk!(out, |s| slice_cpu(s, from, node, &inputs[0], &start, &step));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let child = node.predecessor(0);
        let (start, step) = slice_params(node);
        let shape = node.shape();
        let acc = accumulated_strides(&shape);
        let acc_pred = accumulated_strides(&child.shape());
        let base: i64 = start
            .iter()
            .zip(&acc_pred)
            .map(|(&s, &a)| (s * a) as i64)
            .sum();
        let cn = state.next_name();
        state.prepend(format!(
            "const {t} {name} = {cn};\n",
            t = node.data_type().ocl_name()
        ));
        let mut remap = format!("index = {base}");
        for d in 0..shape.len() {
            remap.push_str(&format!(
                " + ((working_index / {acc}) % {dim}) * {sstep}",
                acc = acc[d],
                dim = shape[d],
                sstep = step[d] * acc_pred[d] as i64
            ));
        }
        remap.push_str(";\n");
        emit_remapped_operand(state, &child, &cn, &remap)
    }

    fn eager_source(&self, _out: DataType, _ins: &[DataType]) -> String {
        // geometry holds (destination stride, destination dim, flat step)
        // triples per dimension; base is the flattened start offset.
        "if (index >= num_entriesR) return;\n\
         long src = base;\n\
         for (int d = 0; d < dimensionsR; d++) {\n\
           src += ((index / geometry[3 * d]) % geometry[3 * d + 1]) * geometry[3 * d + 2];\n\
         }\n\
         R[index] = P0[src];\n"
            .to_string()
    }

    fn eager_params(&self, _out: DataType, in_types: &[DataType]) -> String {
        format!(
            ", const __global {t}* P0, long num_entries0, int dimensionsR, long base, const __global long* geometry",
            t = in_types[0].ocl_name()
        )
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        [DataType::I32, DataType::I64, DataType::F32, DataType::F64]
            .into_iter()
            .map(|t| (t, vec![t]))
            .collect()
    }

    fn extra_args(&self, node: &NodeRef) -> Vec<KernelArg> {
        let (start, step) = slice_params(node);
        let shape = node.shape();
        let acc = accumulated_strides(&shape);
        let acc_pred = accumulated_strides(&node.predecessor(0).shape());
        let base: i64 = start
            .iter()
            .zip(&acc_pred)
            .map(|(&s, &a)| (s * a) as i64)
            .sum();
        let mut geometry = Vec::new();
        for d in 0..shape.len() {
            geometry.push(acc[d] as i64);
            geometry.push(shape[d] as i64);
            geometry.push(step[d] * acc_pred[d] as i64);
        }
        vec![
            KernelArg::Int(shape.len() as i32),
            KernelArg::Long(base),
            KernelArg::LongVec(geometry),
        ]
    }

    fn per_input_args(&self, _node: &NodeRef, _input: usize) -> Vec<KernelArg> {
        Vec::new()
    }

    fn local_gradient(
        &self,
        node: &NodeRef,
        _index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        // The adjoint scatters back to the sliced positions: an extend
        // with the same steps, anchored at the smallest selected index.
        let pred = node.predecessor(0);
        let (start, step) = slice_params(node);
        let shape = node.shape();
        let mut insert_at = Vec::with_capacity(shape.len());
        for d in 0..shape.len() {
            if step[d] > 0 {
                insert_at.push(start[d]);
            } else {
                insert_at.push(start[d] - (shape[d] - 1) * step[d].unsigned_abs() as usize);
            }
        }
        extend_step(adjoint, &pred.shape(), &insert_at, &step).map(Some)
    }

    fn operation_score(&self, node: &NodeRef) -> usize {
        let pred = node.predecessor(0);
        let mut away = 1usize;
        for (p, n) in pred.shape().iter().zip(node.shape()) {
            if *p > n {
                away *= *p - n;
            }
        }
        away.max(1)
    }
}

pub struct ExtendOp;

impl Operator for ExtendOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        let (insert_at, step) = extend_params(node);
        dispatch_chunk!(out, |s| extend_cpu(
            s,
            from,
            node,
            &inputs[0],
            &insert_at,
            &step
        ));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let child = node.predecessor(0);
        let (insert_at, step) = extend_params(node);
        let shape = node.shape();
        let child_shape = child.shape();
        let acc = accumulated_strides(&shape);
        let acc_pred = accumulated_strides(&child_shape);
        let cn = state.next_name();
        // Whether the restored index lies on the embedded grid; outside it
        // the value is the additive identity and the (clamped) load result
        // is discarded.
        let mut cond = String::from("1");
        for d in 0..shape.len() {
            let m = step[d].unsigned_abs();
            cond.push_str(&format!(
                " && (index / {acc}) % {dim} >= {at} && (((index / {acc}) % {dim}) - {at}) % {m} == 0 && (((index / {acc}) % {dim}) - {at}) / {m} < {len}",
                acc = acc[d],
                dim = shape[d],
                at = insert_at[d],
                len = child_shape[d]
            ));
        }
        state.prepend(format!(
            "const {t} {name} = ({cond}) ? {cn} : 0;\n",
            t = node.data_type().ocl_name()
        ));
        let mut remap = String::from("index = 0;\nlong di = 0;\n");
        for d in 0..shape.len() {
            let m = step[d].unsigned_abs();
            remap.push_str(&format!(
                "di = clamp((long)((working_index / {acc}) % {dim}) - {at}, (long)0, (long){span}) / {m};\n",
                acc = acc[d],
                dim = shape[d],
                at = insert_at[d],
                span = (child_shape[d] - 1) * m as usize
            ));
            if step[d] < 0 {
                remap.push_str(&format!("di = {} - di;\n", child_shape[d] - 1));
            }
            remap.push_str(&format!("index += di * {};\n", acc_pred[d]));
        }
        emit_remapped_operand(state, &child, &cn, &remap)
    }

    fn eager_source(&self, _out: DataType, _ins: &[DataType]) -> String {
        // geometry holds (destination stride, destination dim, insert
        // position, step, source dim, source stride) per dimension.
        "if (index >= num_entriesR) return;\n\
         long src = 0;\n\
         int inside = 1;\n\
         for (int d = 0; d < dimensionsR && inside; d++) {\n\
           long st = geometry[6 * d + 3];\n\
           long m = st < 0 ? -st : st;\n\
           long di = (index / geometry[6 * d]) % geometry[6 * d + 1];\n\
           if (di < geometry[6 * d + 2]) { inside = 0; break; }\n\
           di -= geometry[6 * d + 2];\n\
           if (di % m != 0) { inside = 0; break; }\n\
           di /= m;\n\
           if (di >= geometry[6 * d + 4]) { inside = 0; break; }\n\
           if (st < 0) di = geometry[6 * d + 4] - di - 1;\n\
           src += di * geometry[6 * d + 5];\n\
         }\n\
         R[index] = inside ? P0[src] : 0;\n"
            .to_string()
    }

    fn eager_params(&self, _out: DataType, in_types: &[DataType]) -> String {
        format!(
            ", const __global {t}* P0, long num_entries0, int dimensionsR, const __global long* geometry",
            t = in_types[0].ocl_name()
        )
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        [DataType::I32, DataType::I64, DataType::F32, DataType::F64]
            .into_iter()
            .map(|t| (t, vec![t]))
            .collect()
    }

    fn extra_args(&self, node: &NodeRef) -> Vec<KernelArg> {
        let (insert_at, step) = extend_params(node);
        let shape = node.shape();
        let child = node.predecessor(0);
        let child_shape = child.shape();
        let acc = accumulated_strides(&shape);
        let acc_pred = accumulated_strides(&child_shape);
        let mut geometry = Vec::new();
        for d in 0..shape.len() {
            geometry.push(acc[d] as i64);
            geometry.push(shape[d] as i64);
            geometry.push(insert_at[d] as i64);
            geometry.push(step[d]);
            geometry.push(child_shape[d] as i64);
            geometry.push(acc_pred[d] as i64);
        }
        vec![KernelArg::Int(shape.len() as i32), KernelArg::LongVec(geometry)]
    }

    fn per_input_args(&self, _node: &NodeRef, _input: usize) -> Vec<KernelArg> {
        Vec::new()
    }

    fn local_gradient(
        &self,
        node: &NodeRef,
        _index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        // The adjoint elements at the embedded positions, gathered back in
        // source order.
        let pred = node.predecessor(0);
        let (insert_at, step) = extend_params(node);
        let ps = pred.shape();
        let rank = ps.len();
        let mut start = Vec::with_capacity(rank);
        let mut end = Vec::with_capacity(rank);
        for d in 0..rank {
            let m = step[d].unsigned_abs() as usize;
            if step[d] > 0 {
                start.push(insert_at[d] as i64);
                end.push((insert_at[d] + (ps[d] - 1) * m) as i64 + 1);
            } else {
                start.push((insert_at[d] + (ps[d] - 1) * m) as i64);
                end.push(insert_at[d] as i64 - 1);
            }
        }
        slice(adjoint, &start, &end, &step).map(Some)
    }
}

pub struct IndexOp;

impl Operator for IndexOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        dispatch_chunk!(out, |s| index_cpu(s, from, node, inputs));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let src = node.predecessor(0);
        let idx = node.predecessor(1);
        let p_src = state.find_or_insert_parameter(&src);
        let p_idx = state.find_or_insert_parameter(&idx);
        let shape = node.shape();
        let axis = idx.rank() - 1;
        let acc_ax: usize = shape[axis + 1..].iter().product();
        let src_ax = src.shape()[axis];
        let t = node.data_type().ocl_name();
        state.prepend(format!(
            "const {t} {name} = {p_src}[(index / {block}) * {acc_ax} * {src_ax} + (long){p_idx}[index / {acc_ax}] * {acc_ax} + index % {acc_ax}];\n",
            block = acc_ax * shape[axis]
        ));
        Ok(())
    }

    fn eager_source(&self, _out: DataType, _ins: &[DataType]) -> String {
        "if (index >= num_entriesR) return;\n\
         long base = index / (acc_ax * out_ax);\n\
         long rest = index % acc_ax;\n\
         long ind = (long)P1[index / acc_ax];\n\
         R[index] = P0[base * acc_ax * src_ax + ind * acc_ax + rest];\n"
            .to_string()
    }

    fn eager_params(&self, _out: DataType, in_types: &[DataType]) -> String {
        format!(
            ", const __global {t0}* P0, long num_entries0, const __global {t1}* P1, long num_entries1, long acc_ax, long out_ax, long src_ax",
            t0 = in_types[0].ocl_name(),
            t1 = in_types[1].ocl_name()
        )
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        let types = [DataType::I32, DataType::I64, DataType::F32, DataType::F64];
        let ints = [DataType::I32, DataType::I64];
        let mut perms = Vec::new();
        for t in types {
            for i in ints {
                perms.push((t, vec![t, i]));
            }
        }
        perms
    }

    fn extra_args(&self, node: &NodeRef) -> Vec<KernelArg> {
        let shape = node.shape();
        let idx = node.predecessor(1);
        let axis = idx.rank() - 1;
        let acc_ax: usize = shape[axis + 1..].iter().product();
        vec![
            KernelArg::Long(acc_ax as i64),
            KernelArg::Long(shape[axis] as i64),
            KernelArg::Long(node.predecessor(0).shape()[axis] as i64),
        ]
    }

    fn per_input_args(&self, _node: &NodeRef, _input: usize) -> Vec<KernelArg> {
        Vec::new()
    }

    fn local_gradient(
        &self,
        node: &NodeRef,
        index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        if index != 0 {
            return Ok(None);
        }
        // Scatter the adjoint back; colliding targets sum.
        let src = node.predecessor(0);
        let idx = node.predecessor(1);
        let zeros = zeros_like(&src, DataType::F64)?;
        set_index(&zeros, adjoint, &idx).map(Some)
    }

    fn pushes_parameters(&self) -> bool {
        true
    }
}

pub struct SetIndexOp;

impl Operator for SetIndexOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        dispatch_chunk!(out, |s| set_index_cpu(s, from, node, inputs));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let src = node.predecessor(0);
        let upd = node.predecessor(1);
        let idx = node.predecessor(2);
        let p_src = state.find_or_insert_parameter(&src);
        let p_upd = state.find_or_insert_parameter(&upd);
        let p_idx = state.find_or_insert_parameter(&idx);
        let shape = node.shape();
        let axis = idx.rank() - 1;
        let acc_ax: usize = shape[axis + 1..].iter().product();
        let idx_ax = idx.shape()[axis];
        let t = node.data_type().ocl_name();
        state.prepend(format!(
            "{t} {name};\n{{\n\
             const long base = index / {block};\n\
             const long rest = index % {acc_ax};\n\
             const long target = (index / {acc_ax}) % {out_ax};\n\
             {t} acc = 0;\nint hit = 0;\n\
             for (long j = base * {idx_ax}; j < base * {idx_ax} + {idx_ax}; j++) {{\n\
               if ((long){p_idx}[j] == target) {{ hit = 1; acc += {p_upd}[j * {acc_ax} + rest]; }}\n\
             }}\n\
             {name} = hit ? acc : {p_src}[index];\n}}\n",
            block = acc_ax * shape[axis],
            out_ax = shape[axis]
        ));
        Ok(())
    }

    fn eager_source(&self, out: DataType, _ins: &[DataType]) -> String {
        format!(
            "if (index >= num_entriesR) return;\n\
             long base = index / (acc_ax * out_ax);\n\
             long rest = index % acc_ax;\n\
             long target = (index / acc_ax) % out_ax;\n\
             {t} acc = 0;\nint hit = 0;\n\
             for (long j = base * idx_ax; j < base * idx_ax + idx_ax; j++) {{\n\
               if ((long)P2[j] == target) {{ hit = 1; acc += P1[j * acc_ax + rest]; }}\n\
             }}\n\
             R[index] = hit ? acc : P0[index];\n",
            t = out.ocl_name()
        )
    }

    fn eager_params(&self, _out: DataType, in_types: &[DataType]) -> String {
        format!(
            ", const __global {t0}* P0, long num_entries0, const __global {t1}* P1, long num_entries1, const __global {t2}* P2, long num_entries2, long acc_ax, long out_ax, long idx_ax",
            t0 = in_types[0].ocl_name(),
            t1 = in_types[1].ocl_name(),
            t2 = in_types[2].ocl_name()
        )
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        let types = [DataType::I32, DataType::I64, DataType::F32, DataType::F64];
        let ints = [DataType::I32, DataType::I64];
        let mut perms = Vec::new();
        for t in types {
            for i in ints {
                perms.push((t, vec![t, t, i]));
            }
        }
        perms
    }

    fn extra_args(&self, node: &NodeRef) -> Vec<KernelArg> {
        let shape = node.shape();
        let idx = node.predecessor(2);
        let axis = idx.rank() - 1;
        let acc_ax: usize = shape[axis + 1..].iter().product();
        vec![
            KernelArg::Long(acc_ax as i64),
            KernelArg::Long(shape[axis] as i64),
            KernelArg::Long(idx.shape()[axis] as i64),
        ]
    }

    fn per_input_args(&self, _node: &NodeRef, _input: usize) -> Vec<KernelArg> {
        Vec::new()
    }

    fn local_gradient(
        &self,
        node: &NodeRef,
        index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        let src = node.predecessor(0);
        let upd = node.predecessor(1);
        let idx = node.predecessor(2);
        match index {
            0 => {
                // Positions hit by the scatter lost their original value;
                // the rest pass the adjoint through.
                let survivors = set_index(&ones_like(&src, DataType::F64)?, &zeros_like(&upd, DataType::F64)?, &idx)?;
                mul(adjoint, &survivors).map(Some)
            }
            1 => index_builder(adjoint, &idx).map(Some),
            _ => Ok(None),
        }
    }

    fn reuses_inputs(&self, _node: &NodeRef) -> Vec<bool> {
        vec![true, false, false]
    }

    fn pushes_parameters(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TensorData;
    use crate::graph::new_store;

    #[test]
    fn slice_normalizes_negative_bounds() {
        let a = new_store(TensorData::I32((0..20).collect()), vec![5, 4]).unwrap();
        let s = slice(&a, &[0, -1], &[4, -5], &[2, -1]).unwrap();
        assert_eq!(s.shape(), vec![2, 4]);
        assert!(slice(&a, &[0, 0], &[5, 4], &[0, 1]).is_err());
        assert!(slice(&a, &[4, 0], &[2, 4], &[1, 1]).is_err());
    }

    #[test]
    fn extend_validates_reach() {
        let a = new_store(TensorData::I32((0..4).collect()), vec![2, 2]).unwrap();
        assert!(extend(&a, &[4, 4], &[1, 2]).is_ok());
        assert!(extend(&a, &[4, 4], &[3, 0]).is_err());
    }

    #[test]
    fn index_shapes() {
        let src = new_store(TensorData::F32(vec![0.0; 12]), vec![3, 4]).unwrap();
        let idx = new_store(TensorData::I32(vec![0, 2]), vec![2]).unwrap();
        let picked = index(&src, &idx).unwrap();
        assert_eq!(picked.shape(), vec![2, 4]);
        let fidx = new_store(TensorData::F32(vec![0.0]), vec![1]).unwrap();
        assert!(index(&src, &fidx).is_err());
    }
}

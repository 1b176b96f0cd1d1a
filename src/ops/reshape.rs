//! Shape rewriting: flatten, reshape, elementwise conversion, dimension
//! permutation, tiling and concatenation. On the CPU the pure metadata
//! rewrites (flatten/reshape) share the predecessor's buffer; the others
//! reindex.

use crate::backend::gpu::codegen::{
    emit_remapped_operand, emit_value, CodegenState,
};
use crate::data::{DataType, OutChunk, TensorElement};
use crate::dispatch_chunk;
use crate::errors::{FlintError, FlintResult};
use crate::graph::{NodeRef, OpKind};
use crate::ops::{finish, index, link_node, reduce, CpuInput, Operator, TypePermutation};
use crate::shape::{accumulated_strides, num_elements};

// ---------------------------------------------------------------------------
// Builders

/// Collapses all dimensions into one.
pub fn flatten(a: &NodeRef) -> FlintResult<NodeRef> {
    finish(link_node(
        OpKind::Flatten,
        a.data_type(),
        vec![a.num_elements()],
        vec![a.clone()],
    ))
}

/// Merges dimension `dim` into `dim - 1`.
pub fn flatten_dim(a: &NodeRef, dim: usize) -> FlintResult<NodeRef> {
    let shape = a.shape();
    if dim == 0 || dim >= shape.len() {
        return finish(Err(FlintError::IllegalDimension(format!(
            "cannot merge dimension {dim} of a rank-{} tensor",
            shape.len()
        ))));
    }
    let mut out = shape.clone();
    out[dim - 1] *= out[dim];
    out.remove(dim);
    finish(link_node(
        OpKind::FlattenDim { dim },
        a.data_type(),
        out,
        vec![a.clone()],
    ))
}

/// Reinterprets the element sequence under a new shape of equal size.
pub fn reshape(a: &NodeRef, new_shape: &[usize]) -> FlintResult<NodeRef> {
    if num_elements(new_shape) != a.num_elements() || new_shape.is_empty() {
        return finish(Err(FlintError::incompatible_shapes(
            &a.shape(),
            new_shape,
            "reshape must keep the element count",
        )));
    }
    finish(link_node(
        OpKind::Reshape,
        a.data_type(),
        new_shape.to_vec(),
        vec![a.clone()],
    ))
}

/// Elementwise cast to `dtype`.
pub fn convert(a: &NodeRef, dtype: DataType) -> FlintResult<NodeRef> {
    finish(link_node(
        OpKind::Conversion,
        dtype,
        a.shape(),
        vec![a.clone()],
    ))
}

/// Permutes the dimensions by `perm`.
pub fn transpose(a: &NodeRef, perm: &[usize]) -> FlintResult<NodeRef> {
    let shape = a.shape();
    let mut seen = vec![false; shape.len()];
    if perm.len() != shape.len() || perm.iter().any(|&p| p >= shape.len() || std::mem::replace(&mut seen[p.min(shape.len() - 1)], true)) {
        return finish(Err(FlintError::IllegalDimension(format!(
            "{perm:?} is not a permutation of a rank-{} tensor",
            shape.len()
        ))));
    }
    let out: Vec<usize> = perm.iter().map(|&p| shape[p]).collect();
    finish(link_node(
        OpKind::Transpose {
            perm: perm.to_vec(),
        },
        a.data_type(),
        out,
        vec![a.clone()],
    ))
}

/// Swaps the two innermost dimensions; the transposition matmul gradients
/// need.
pub fn transpose_last_two(a: &NodeRef) -> FlintResult<NodeRef> {
    let rank = a.rank();
    if rank < 2 {
        return finish(Err(FlintError::IllegalDimensionality(
            "need rank 2 or higher to swap matrix dimensions".to_string(),
        )));
    }
    let mut perm: Vec<usize> = (0..rank).collect();
    perm.swap(rank - 2, rank - 1);
    transpose(a, &perm)
}

/// Tiles dimension `d` `repetitions[d] + 1` times.
pub fn repeat(a: &NodeRef, repetitions: &[usize]) -> FlintResult<NodeRef> {
    let shape = a.shape();
    if repetitions.len() != shape.len() {
        return finish(Err(FlintError::IllegalDimension(format!(
            "got {} repetition entries for a rank-{} tensor",
            repetitions.len(),
            shape.len()
        ))));
    }
    let out: Vec<usize> = shape
        .iter()
        .zip(repetitions)
        .map(|(&s, &r)| s * (r + 1))
        .collect();
    finish(link_node(
        OpKind::Repeat,
        a.data_type(),
        out,
        vec![a.clone()],
    ))
}

/// Concatenates two tensors along `axis`.
pub fn concat(a: &NodeRef, b: &NodeRef, axis: usize) -> FlintResult<NodeRef> {
    let sa = a.shape();
    let sb = b.shape();
    if sa.len() != sb.len() {
        return finish(Err(FlintError::IllegalDimensionality(
            "concatenated tensors must have equal rank".to_string(),
        )));
    }
    if axis >= sa.len() {
        return finish(Err(FlintError::IllegalDimension(format!(
            "axis {axis} out of range for rank {}",
            sa.len()
        ))));
    }
    for d in 0..sa.len() {
        if d != axis && sa[d] != sb[d] {
            return finish(Err(FlintError::incompatible_shapes(
                &sa,
                &sb,
                "shapes must agree outside the concatenation axis",
            )));
        }
    }
    let mut out = sa.clone();
    out[axis] += sb[axis];
    let dtype = a.data_type().promote(b.data_type());
    finish(link_node(
        OpKind::Concat { axis },
        dtype,
        out,
        vec![a.clone(), b.clone()],
    ))
}

// ---------------------------------------------------------------------------
// Kernels

fn copy_cpu<T: TensorElement>(out: &mut [T], from: usize, input: &CpuInput) {
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = input.data.get(from + i);
    }
}

fn transpose_cpu<T: TensorElement>(
    out: &mut [T],
    from: usize,
    node: &NodeRef,
    input: &CpuInput,
    perm: &[usize],
) {
    let shape = node.shape();
    let acc_d = accumulated_strides(&shape);
    let acc_s = accumulated_strides(&input.shape);
    for (i, slot) in out.iter_mut().enumerate() {
        let mut rem = from + i;
        let mut src = 0;
        for d in 0..shape.len() {
            let coord = rem / acc_d[d];
            rem %= acc_d[d];
            src += coord * acc_s[perm[d]];
        }
        *slot = input.data.get(src);
    }
}

fn repeat_cpu<T: TensorElement>(out: &mut [T], from: usize, node: &NodeRef, input: &CpuInput) {
    let shape = node.shape();
    let acc_d = accumulated_strides(&shape);
    let acc_s = accumulated_strides(&input.shape);
    for (i, slot) in out.iter_mut().enumerate() {
        let mut rem = from + i;
        let mut src = 0;
        for d in 0..shape.len() {
            let coord = rem / acc_d[d];
            rem %= acc_d[d];
            src += (coord % input.shape[d]) * acc_s[d];
        }
        *slot = input.data.get(src);
    }
}

fn concat_cpu<T: TensorElement>(
    out: &mut [T],
    from: usize,
    node: &NodeRef,
    inputs: &[CpuInput],
    axis: usize,
) {
    let shape = node.shape();
    let a_ax = inputs[0].shape[axis];
    let b_ax = inputs[1].shape[axis];
    let mut acc_last = 1;
    for d in (axis + 1)..shape.len() {
        acc_last *= shape[d];
    }
    for (i, slot) in out.iter_mut().enumerate() {
        let index = from + i;
        let sx = index / acc_last;
        let sc = if axis > 0 { sx % shape[axis] } else { sx };
        *slot = if sc < a_ax {
            let ai = (sx / shape[axis]) * acc_last * a_ax + sc * acc_last + index % acc_last;
            inputs[0].data.get(ai)
        } else {
            let bi =
                (sx / shape[axis]) * acc_last * b_ax + (sc - a_ax) * acc_last + index % acc_last;
            inputs[1].data.get(bi)
        };
    }
}

// ---------------------------------------------------------------------------
// Operators

/// `Flatten`, `FlattenDim` and `Reshape` share one implementation: the
/// flat element sequence is unchanged, only the shape differs.
pub struct FlattenOp;

impl Operator for FlattenOp {
    fn cpu_kernel(
        &self,
        _node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        dispatch_chunk!(out, |s| copy_cpu(s, from, &inputs[0]));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let child = node.predecessor(0);
        let cn = state.next_name();
        state.prepend(format!(
            "const {t} {name} = {cn};\n",
            t = node.data_type().ocl_name()
        ));
        emit_value(state, &child, &cn)
    }

    fn eager_source(&self, _out: DataType, _ins: &[DataType]) -> String {
        "if (index >= num_entries0) return;\nR[index] = P0[index];\n".to_string()
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        [DataType::I32, DataType::I64, DataType::F32, DataType::F64]
            .into_iter()
            .map(|t| (t, vec![t]))
            .collect()
    }

    fn local_gradient(
        &self,
        node: &NodeRef,
        _index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        reshape(adjoint, &node.predecessor(0).shape()).map(Some)
    }

    fn reuses_inputs(&self, _node: &NodeRef) -> Vec<bool> {
        vec![true]
    }
}

pub struct ReshapeOp;

impl Operator for ReshapeOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        FlattenOp.cpu_kernel(node, inputs, out, from)
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        FlattenOp.lazy_fragment(node, name, state)
    }

    fn eager_source(&self, out: DataType, ins: &[DataType]) -> String {
        FlattenOp.eager_source(out, ins)
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        FlattenOp.type_permutations()
    }

    fn local_gradient(
        &self,
        node: &NodeRef,
        _index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        reshape(adjoint, &node.predecessor(0).shape()).map(Some)
    }

    fn reuses_inputs(&self, _node: &NodeRef) -> Vec<bool> {
        vec![true]
    }
}

pub struct ConversionOp;

impl Operator for ConversionOp {
    fn cpu_kernel(
        &self,
        _node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        dispatch_chunk!(out, |s| copy_cpu(s, from, &inputs[0]));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let child = node.predecessor(0);
        let cn = state.next_name();
        let t = node.data_type().ocl_name();
        state.prepend(format!("const {t} {name} = ({t}){cn};\n"));
        emit_value(state, &child, &cn)
    }

    fn eager_source(&self, out: DataType, _ins: &[DataType]) -> String {
        format!(
            "if (index >= num_entries0) return;\nR[index] = ({t})P0[index];\n",
            t = out.ocl_name()
        )
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        let types = [DataType::I32, DataType::I64, DataType::F32, DataType::F64];
        let mut perms = Vec::new();
        for out in types {
            for input in types {
                perms.push((out, vec![input]));
            }
        }
        perms
    }

    fn local_gradient(
        &self,
        _node: &NodeRef,
        _index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        Ok(Some(adjoint.clone()))
    }
}

pub struct TransposeOp;

impl TransposeOp {
    fn perm(node: &NodeRef) -> Vec<usize> {
        node.with_operation(|op| match &op.kind {
            OpKind::Transpose { perm } => perm.clone(),
            _ => Vec::new(),
        })
    }
}

impl Operator for TransposeOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        let perm = Self::perm(node);
        dispatch_chunk!(out, |s| transpose_cpu(s, from, node, &inputs[0], &perm));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let child = node.predecessor(0);
        let perm = Self::perm(node);
        let shape = node.shape();
        let acc_d = accumulated_strides(&shape);
        let acc_s = accumulated_strides(&child.shape());
        let cn = state.next_name();
        state.prepend(format!(
            "const {t} {name} = {cn};\n",
            t = node.data_type().ocl_name()
        ));
        let mut remap = String::from("index = 0;\n");
        for d in 0..shape.len() {
            remap.push_str(&format!(
                "index += ((working_index / {acc}) % {dim}) * {src};\n",
                acc = acc_d[d],
                dim = shape[d],
                src = acc_s[perm[d]]
            ));
        }
        emit_remapped_operand(state, &child, &cn, &remap)
    }

    fn eager_source(&self, _out: DataType, _ins: &[DataType]) -> String {
        // acc_shape holds interleaved (destination stride, destination dim,
        // source stride) triples per dimension.
        "if (index >= num_entriesR) return;\n\
         long src = 0;\n\
         for (int d = 0; d < dimensions0; d++) {\n\
           src += ((index / acc_shape[3 * d]) % acc_shape[3 * d + 1]) * acc_shape[3 * d + 2];\n\
         }\n\
         R[index] = P0[src];\n"
            .to_string()
    }

    fn eager_params(&self, _out: DataType, in_types: &[DataType]) -> String {
        format!(
            ", const __global {t}* P0, long num_entries0, int dimensions0, const __global long* acc_shape",
            t = in_types[0].ocl_name()
        )
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        [DataType::I32, DataType::I64, DataType::F32, DataType::F64]
            .into_iter()
            .map(|t| (t, vec![t]))
            .collect()
    }

    fn extra_args(&self, node: &NodeRef) -> Vec<crate::ops::KernelArg> {
        let perm = Self::perm(node);
        let shape = node.shape();
        let acc_d = accumulated_strides(&shape);
        let acc_s = accumulated_strides(&node.predecessor(0).shape());
        let mut packed = Vec::new();
        for d in 0..shape.len() {
            packed.push(acc_d[d] as i64);
            packed.push(shape[d] as i64);
            packed.push(acc_s[perm[d]] as i64);
        }
        vec![crate::ops::KernelArg::LongVec(packed)]
    }

    fn per_input_args(&self, node: &NodeRef, _input: usize) -> Vec<crate::ops::KernelArg> {
        vec![crate::ops::KernelArg::Int(node.rank() as i32)]
    }

    fn local_gradient(
        &self,
        node: &NodeRef,
        _index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        let perm = Self::perm(node);
        let mut inverse = vec![0usize; perm.len()];
        for (d, &p) in perm.iter().enumerate() {
            inverse[p] = d;
        }
        transpose(adjoint, &inverse).map(Some)
    }
}

pub struct RepeatOp;

impl Operator for RepeatOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        dispatch_chunk!(out, |s| repeat_cpu(s, from, node, &inputs[0]));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let child = node.predecessor(0);
        let shape = node.shape();
        let acc_d = accumulated_strides(&shape);
        let acc_s = accumulated_strides(&child.shape());
        let child_shape = child.shape();
        let cn = state.next_name();
        state.prepend(format!(
            "const {t} {name} = {cn};\n",
            t = node.data_type().ocl_name()
        ));
        let mut remap = String::from("index = 0;\n");
        for d in 0..shape.len() {
            remap.push_str(&format!(
                "index += ((working_index / {acc}) % {dim}) * {src};\n",
                acc = acc_d[d],
                dim = child_shape[d],
                src = acc_s[d]
            ));
        }
        emit_remapped_operand(state, &child, &cn, &remap)
    }

    fn eager_source(&self, _out: DataType, _ins: &[DataType]) -> String {
        // acc_shape holds (destination stride, source dim, source stride)
        // triples per dimension.
        "if (index >= num_entriesR) return;\n\
         long src = 0;\n\
         for (int d = 0; d < dimensions0; d++) {\n\
           src += ((index / acc_shape[3 * d]) % acc_shape[3 * d + 1]) * acc_shape[3 * d + 2];\n\
         }\n\
         R[index] = P0[src];\n"
            .to_string()
    }

    fn eager_params(&self, out: DataType, in_types: &[DataType]) -> String {
        TransposeOp.eager_params(out, in_types)
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        TransposeOp.type_permutations()
    }

    fn extra_args(&self, node: &NodeRef) -> Vec<crate::ops::KernelArg> {
        let shape = node.shape();
        let child = node.predecessor(0);
        let child_shape = child.shape();
        let acc_d = accumulated_strides(&shape);
        let acc_s = accumulated_strides(&child_shape);
        let mut packed = Vec::new();
        for d in 0..shape.len() {
            packed.push(acc_d[d] as i64);
            packed.push(child_shape[d] as i64);
            packed.push(acc_s[d] as i64);
        }
        vec![crate::ops::KernelArg::LongVec(packed)]
    }

    fn per_input_args(&self, node: &NodeRef, _input: usize) -> Vec<crate::ops::KernelArg> {
        vec![crate::ops::KernelArg::Int(node.rank() as i32)]
    }

    fn local_gradient(
        &self,
        node: &NodeRef,
        _index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        // Reshape the adjoint so every dimension splits into (tile, size),
        // then sum away the tile axes one by one.
        let pred = node.predecessor(0);
        let ps = pred.shape();
        let ns = node.shape();
        let mut interleaved = Vec::with_capacity(2 * ps.len());
        for d in 0..ps.len() {
            interleaved.push(ns[d] / ps[d]);
            interleaved.push(ps[d]);
        }
        let mut g = reshape(adjoint, &interleaved)?;
        for d in 0..ps.len() {
            g = reduce::reduce_sum(&g, d)?;
        }
        if g.shape() != ps {
            g = reshape(&g, &ps)?;
        }
        Ok(Some(g))
    }
}

pub struct ConcatOp;

impl ConcatOp {
    fn axis(node: &NodeRef) -> usize {
        node.with_operation(|op| match &op.kind {
            OpKind::Concat { axis } => *axis,
            _ => 0,
        })
    }
}

impl Operator for ConcatOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        let axis = Self::axis(node);
        dispatch_chunk!(out, |s| concat_cpu(s, from, node, inputs, axis));
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let a = node.predecessor(0);
        let b = node.predecessor(1);
        let axis = Self::axis(node);
        let shape = node.shape();
        let a_ax = a.shape()[axis];
        let b_ax = b.shape()[axis];
        let mut acc_last = 1usize;
        for d in (axis + 1)..shape.len() {
            acc_last *= shape[d];
        }
        let out_ax = shape[axis];
        let sc = if axis > 0 {
            format!("((index / {acc_last}) % {out_ax})")
        } else {
            format!("(index / {acc_last})")
        };
        let na = state.next_name();
        let nb = state.next_name();
        state.prepend(format!(
            "const {t} {name} = {sc} < {a_ax} ? {na} : {nb};\n",
            t = node.data_type().ocl_name()
        ));
        let sc_of = |idx: &str| {
            if axis > 0 {
                format!("(({idx} / {acc_last}) % {out_ax})")
            } else {
                format!("({idx} / {acc_last})")
            }
        };
        let sc_w = sc_of("working_index");
        // Each branch gets its own remapped index; the unselected branch
        // clamps so its load stays in bounds.
        let remap_a = format!(
            "const long sc = min((long){sc_w}, (long){max});\n\
             index = (working_index / {acc_last} / {out_ax}) * {a_block} + sc * {acc_last} + working_index % {acc_last};\n",
            max = a_ax - 1,
            a_block = acc_last * a_ax
        );
        emit_remapped_operand(state, &a, &na, &remap_a)?;
        let remap_b = format!(
            "const long sc = max({sc_w} - {a_ax}, (long)0);\n\
             index = (working_index / {acc_last} / {out_ax}) * {b_block} + sc * {acc_last} + working_index % {acc_last};\n",
            b_block = acc_last * b_ax
        );
        emit_remapped_operand(state, &b, &nb, &remap_b)
    }

    fn eager_source(&self, _out: DataType, _ins: &[DataType]) -> String {
        "if (index >= num_entriesR) return;\n\
         long sx = index / acc_last;\n\
         long sc = ax > 0 ? sx % out_ax : sx;\n\
         if (sc < a_ax) {\n\
           R[index] = P0[(sx / out_ax) * acc_last * a_ax + sc * acc_last + index % acc_last];\n\
         } else {\n\
           R[index] = P1[(sx / out_ax) * acc_last * b_ax + (sc - a_ax) * acc_last + index % acc_last];\n\
         }\n"
            .to_string()
    }

    fn eager_params(&self, _out: DataType, in_types: &[DataType]) -> String {
        let mut params = String::new();
        for (i, t) in in_types.iter().enumerate() {
            params.push_str(&format!(
                ", const __global {t}* P{i}, long num_entries{i}",
                t = t.ocl_name()
            ));
        }
        params.push_str(", long acc_last, long ax, long out_ax, long a_ax, long b_ax");
        params
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        [DataType::I32, DataType::I64, DataType::F32, DataType::F64]
            .into_iter()
            .map(|t| (t, vec![t, t]))
            .collect()
    }

    fn extra_args(&self, node: &NodeRef) -> Vec<crate::ops::KernelArg> {
        let axis = Self::axis(node);
        let shape = node.shape();
        let mut acc_last = 1i64;
        for d in (axis + 1)..shape.len() {
            acc_last *= shape[d] as i64;
        }
        vec![
            crate::ops::KernelArg::Long(acc_last),
            crate::ops::KernelArg::Long(axis as i64),
            crate::ops::KernelArg::Long(shape[axis] as i64),
            crate::ops::KernelArg::Long(node.predecessor(0).shape()[axis] as i64),
            crate::ops::KernelArg::Long(node.predecessor(1).shape()[axis] as i64),
        ]
    }

    fn per_input_args(&self, _node: &NodeRef, _input: usize) -> Vec<crate::ops::KernelArg> {
        Vec::new()
    }

    fn local_gradient(
        &self,
        node: &NodeRef,
        index: usize,
        adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        let axis = Self::axis(node);
        let shape = node.shape();
        let a_ax = node.predecessor(0).shape()[axis] as i64;
        let rank = shape.len();
        let mut start = vec![0i64; rank];
        let mut end: Vec<i64> = shape.iter().map(|&s| s as i64).collect();
        let step = vec![1i64; rank];
        if index == 0 {
            end[axis] = a_ax;
        } else {
            start[axis] = a_ax;
        }
        index::slice(adjoint, &start, &end, &step).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TensorData;
    use crate::graph::new_store;

    #[test]
    fn flatten_dim_merges_neighbours() {
        let a = new_store(TensorData::I32((0..24).collect()), vec![2, 3, 4]).unwrap();
        let f = flatten_dim(&a, 1).unwrap();
        assert_eq!(f.shape(), vec![6, 4]);
        assert!(flatten_dim(&a, 0).is_err());
    }

    #[test]
    fn transpose_validates_permutation() {
        let a = new_store(TensorData::I32((0..6).collect()), vec![2, 3]).unwrap();
        assert!(transpose(&a, &[1, 0]).is_ok());
        assert!(transpose(&a, &[1, 1]).is_err());
        assert!(transpose(&a, &[0]).is_err());
    }

    #[test]
    fn concat_shapes() {
        let a = new_store(TensorData::I32((0..6).collect()), vec![2, 3]).unwrap();
        let b = new_store(TensorData::I32((0..3).collect()), vec![1, 3]).unwrap();
        assert_eq!(concat(&a, &b, 0).unwrap().shape(), vec![3, 3]);
        assert!(concat(&a, &b, 1).is_err());
    }
}

//! Reductions along one axis. The reduced axis is removed from the shape;
//! reducing a rank-1 tensor leaves a single-element tensor. Sum and
//! product start from their algebraic identity, min and max from the first
//! iterated element.

use crate::backend::gpu::codegen::CodegenState;
use crate::data::{DataType, OutChunk, TensorElement};
use crate::dispatch_chunk;
use crate::errors::{FlintError, FlintResult};
use crate::graph::{NodeRef, OpCode, OpKind};
use crate::ops::arithmetic::{add, div, mul, sub};
use crate::ops::compare::equal;
use crate::ops::reshape::reshape;
use crate::ops::{
    broadcast_along, constant_like, finish, link_node, CpuInput, KernelArg, Operator,
    TypePermutation,
};

fn reduce_builder(make: impl FnOnce(usize) -> OpKind, a: &NodeRef, axis: usize) -> FlintResult<NodeRef> {
    let shape = a.shape();
    if axis >= shape.len() {
        return Err(FlintError::IllegalDimension(format!(
            "cannot reduce axis {axis} of a rank-{} tensor",
            shape.len()
        )));
    }
    let mut out = shape.clone();
    out.remove(axis);
    if out.is_empty() {
        out.push(1);
    }
    link_node(make(axis), a.data_type(), out, vec![a.clone()])
}

/// Sums along `axis`.
pub fn reduce_sum(a: &NodeRef, axis: usize) -> FlintResult<NodeRef> {
    finish(reduce_builder(|axis| OpKind::ReduceSum { axis }, a, axis))
}

/// Multiplies along `axis`.
pub fn reduce_mul(a: &NodeRef, axis: usize) -> FlintResult<NodeRef> {
    finish(reduce_builder(|axis| OpKind::ReduceMul { axis }, a, axis))
}

/// Minimum along `axis`.
pub fn reduce_min(a: &NodeRef, axis: usize) -> FlintResult<NodeRef> {
    finish(reduce_builder(|axis| OpKind::ReduceMin { axis }, a, axis))
}

/// Maximum along `axis`.
pub fn reduce_max(a: &NodeRef, axis: usize) -> FlintResult<NodeRef> {
    finish(reduce_builder(|axis| OpKind::ReduceMax { axis }, a, axis))
}

pub(crate) fn reduced_axis(node: &NodeRef) -> usize {
    node.with_operation(|op| match &op.kind {
        OpKind::ReduceSum { axis }
        | OpKind::ReduceMul { axis }
        | OpKind::ReduceMin { axis }
        | OpKind::ReduceMax { axis } => *axis,
        _ => 0,
    })
}

/// Inner-iteration size: the number of elements the reduced axis strides
/// over in the predecessor.
fn iteration_size(pred_shape: &[usize], axis: usize) -> usize {
    pred_shape[axis + 1..].iter().product()
}

fn reduce_cpu<T: TensorElement>(
    out: &mut [T],
    from: usize,
    code: OpCode,
    input: &CpuInput,
    axis: usize,
) {
    let it = iteration_size(&input.shape, axis);
    let count = input.shape[axis];
    for (i, slot) in out.iter_mut().enumerate() {
        let gi = from + i;
        let base = (gi / it) * it * count + gi % it;
        let mut acc: T = match code {
            OpCode::ReduceSum => T::zero(),
            OpCode::ReduceMul => T::one(),
            _ => input.data.get(base),
        };
        for j in 0..count {
            let v: T = input.data.get(base + j * it);
            acc = match code {
                OpCode::ReduceSum => acc + v,
                OpCode::ReduceMul => acc * v,
                OpCode::ReduceMin => {
                    if v < acc {
                        v
                    } else {
                        acc
                    }
                }
                _ => {
                    if v > acc {
                        v
                    } else {
                        acc
                    }
                }
            };
        }
        *slot = acc;
    }
}

/// The adjoint broadcast back over the reduced axis, shaped like the
/// predecessor.
fn spread_adjoint(node: &NodeRef, adjoint: &NodeRef) -> FlintResult<NodeRef> {
    let pred = node.predecessor(0);
    let ps = pred.shape();
    let axis = reduced_axis(node);
    let spread = if ps.len() == 1 {
        // The reduction collapsed to a single element; tile it directly.
        let g = broadcast_along(adjoint, 0, ps[0])?;
        reshape(&g, &ps)?
    } else {
        broadcast_along(adjoint, axis, ps[axis])?
    };
    Ok(spread)
}

fn reduce_fragment(
    node: &NodeRef,
    name: &str,
    state: &mut CodegenState,
    init: &str,
    fold: impl Fn(&str, &str) -> String,
) -> FlintResult<()> {
    let pred = node.predecessor(0);
    let par = state.find_or_insert_parameter(&pred);
    let axis = reduced_axis(node);
    let it = iteration_size(&pred.shape(), axis);
    let count = pred.shape()[axis];
    let t = node.data_type().ocl_name();
    let read = format!("{par}[(index / {it}) * {block} + index % {it} + j * {it}]", block = it * count);
    state.prepend(format!(
        "{t} {name} = {init};\n\
         for (long j = 0; j < {count}; j++) {{\n  {name} = {fold};\n}}\n",
        fold = fold(name, &read)
    ));
    Ok(())
}

macro_rules! reduce_op {
    ($op:ident, $code:expr, $init:expr, $fold:expr, $eager_fold:literal) => {
        pub struct $op;

        impl Operator for $op {
            fn cpu_kernel(
                &self,
                node: &NodeRef,
                inputs: &[CpuInput],
                out: OutChunk<'_>,
                from: usize,
            ) -> FlintResult<()> {
                let axis = reduced_axis(node);
                dispatch_chunk!(out, |s| reduce_cpu(s, from, $code, &inputs[0], axis));
                Ok(())
            }

            fn lazy_fragment(
                &self,
                node: &NodeRef,
                name: &str,
                state: &mut CodegenState,
            ) -> FlintResult<()> {
                let init = if $init == "first" {
                    let pred = node.predecessor(0);
                    let par = state.find_or_insert_parameter(&pred);
                    let axis = reduced_axis(node);
                    let it = iteration_size(&pred.shape(), axis);
                    let count = pred.shape()[axis];
                    format!("{par}[(index / {it}) * {block} + index % {it}]", block = it * count)
                } else {
                    $init.to_string()
                };
                reduce_fragment(node, name, state, &init, $fold)
            }

            fn eager_source(&self, out: DataType, _ins: &[DataType]) -> String {
                let init = if $init == "first" {
                    "P0[(index / it_dim) * it_dim * count + index % it_dim]".to_string()
                } else {
                    $init.to_string()
                };
                format!(
                    "if (index >= num_entriesR) return;\n\
                     {t} acc = {init};\n\
                     for (long j = 0; j < count; j++) {{\n\
                       {t} v = P0[(index / it_dim) * it_dim * count + index % it_dim + j * it_dim];\n\
                       acc = {fold};\n\
                     }}\n\
                     R[index] = acc;\n",
                    t = out.ocl_name(),
                    fold = $eager_fold
                )
            }

            fn eager_params(&self, _out: DataType, in_types: &[DataType]) -> String {
                format!(
                    ", const __global {t}* P0, long num_entries0, long it_dim, long count",
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
                let pred = node.predecessor(0);
                let axis = reduced_axis(node);
                vec![
                    KernelArg::Long(iteration_size(&pred.shape(), axis) as i64),
                    KernelArg::Long(pred.shape()[axis] as i64),
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
                $crate::ops::reduce::reduce_gradient($code, node, adjoint).map(Some)
            }

            fn operation_score(&self, node: &NodeRef) -> usize {
                let pred = node.predecessor(0);
                pred.shape()[reduced_axis(node)]
            }

            fn pushes_parameters(&self) -> bool {
                true
            }
        }
    };
}

reduce_op!(ReduceSumOp, OpCode::ReduceSum, "0", |acc: &str, v: &str| format!("{acc} + {v}"), "acc + v");
reduce_op!(ReduceMulOp, OpCode::ReduceMul, "1", |acc: &str, v: &str| format!("{acc} * {v}"), "acc * v");
reduce_op!(
    ReduceMinOp,
    OpCode::ReduceMin,
    "first",
    |acc: &str, v: &str| format!("min({acc}, {v})"),
    "min(acc, v)"
);
reduce_op!(
    ReduceMaxOp,
    OpCode::ReduceMax,
    "first",
    |acc: &str, v: &str| format!("max({acc}, {v})"),
    "max(acc, v)"
);

pub(crate) fn reduce_gradient(
    code: OpCode,
    node: &NodeRef,
    adjoint: &NodeRef,
) -> FlintResult<NodeRef> {
    let pred = node.predecessor(0);
    let adj = spread_adjoint(node, adjoint)?;
    match code {
        OpCode::ReduceSum => Ok(adj),
        OpCode::ReduceMul => {
            // The exact product of the other elements in each group,
            // written without dividing by zero: groups with no zero use
            // total / element, a group's single zero gets the product of
            // the non-zeros, two or more zeros kill every contribution.
            let axis = reduced_axis(node);
            let ps = pred.shape();
            let zero = constant_like(0.0, &pred, DataType::F64)?;
            let one = constant_like(1.0, &pred, DataType::F64)?;
            let zero_mask = equal(&pred, &zero)?;
            let nonzero = sub(&one, &zero_mask)?;
            // Predecessor with zeros replaced by one, so products and
            // quotients stay finite.
            let patched = add(&mul(&pred, &nonzero)?, &zero_mask)?;
            let patched_prod = reduce_mul(&patched, axis)?;
            let patched_prod_b = spread_with_shape(&patched_prod, node, &ps)?;
            let zero_count = reduce_sum(&zero_mask, axis)?;
            let zero_count_b = spread_with_shape(&zero_count, node, &ps)?;
            let count_zero = constant_like(0.0, &pred, DataType::F64)?;
            let count_one = constant_like(1.0, &pred, DataType::F64)?;
            let no_zero = equal(&zero_count_b, &count_zero)?;
            let one_zero = equal(&zero_count_b, &count_one)?;
            let through = mul(&nonzero, &mul(&no_zero, &div(&patched_prod_b, &patched)?)?)?;
            let around = mul(&zero_mask, &mul(&one_zero, &patched_prod_b)?)?;
            mul(&adj, &add(&through, &around)?)
        }
        OpCode::ReduceMin | OpCode::ReduceMax => {
            let ps = pred.shape();
            let extremum = spread_with_shape(node, node, &ps)?;
            let mask = equal(&pred, &extremum)?;
            mul(&adj, &mask)
        }
        _ => Err(FlintError::InternalError(
            "reduce gradient called for a non-reduction".to_string(),
        )),
    }
}

/// Broadcasts a reduced tensor back over the reduced axis of `node`,
/// ending exactly at `target` (which may be rank 1).
fn spread_with_shape(value: &NodeRef, node: &NodeRef, target: &[usize]) -> FlintResult<NodeRef> {
    let axis = reduced_axis(node);
    let g = if target.len() == 1 {
        broadcast_along(value, 0, target[0])?
    } else {
        broadcast_along(value, axis, target[axis])?
    };
    if g.shape() != target {
        reshape(&g, target)
    } else {
        Ok(g)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TensorData;
    use crate::graph::new_store;

    #[test]
    fn reduced_axis_is_removed() {
        let a = new_store(TensorData::I32((0..24).collect()), vec![2, 3, 4]).unwrap();
        assert_eq!(reduce_sum(&a, 1).unwrap().shape(), vec![2, 4]);
        let v = new_store(TensorData::I32(vec![1, 2, 3]), vec![3]).unwrap();
        assert_eq!(reduce_max(&v, 0).unwrap().shape(), vec![1]);
        assert!(reduce_sum(&a, 3).is_err());
    }
}

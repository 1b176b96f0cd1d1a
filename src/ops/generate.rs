//! Data generators and dropout. Random values come from a deterministic
//! hash of the element index and a per-node seed, so the CPU and the
//! generated device kernels agree exactly.

use num_traits::Zero;
use rand::Rng;

use crate::backend::gpu::codegen::{emit_value, CodegenState};
use crate::data::{DataType, OutChunk, TensorElement};
use crate::dispatch_chunk;
use crate::errors::{FlintError, FlintResult};
use crate::graph::{NodeRef, OpKind};
use crate::ops::{finish, link_node, CpuInput, KernelArg, Operator, TypePermutation};
use crate::shape::accumulated_strides;

/// The hash behind `GenRandom` and dropout masks: uniform in `[0, 1)`.
pub(crate) fn index_hash(i: usize, seed: f64) -> f64 {
    let v = (i as f64 + seed).sin() * 43758.5453123;
    (v - v.floor()).min(0.99999)
}

fn fresh_seed() -> f64 {
    rand::thread_rng().gen::<f64>() * 1000.0
}

// ---------------------------------------------------------------------------
// Builders

/// A tensor filled with `value`, cast to `dtype`.
pub fn constant(value: f64, shape: &[usize], dtype: DataType) -> FlintResult<NodeRef> {
    finish(constant_of(value, shape.to_vec(), dtype))
}

pub(crate) fn constant_of(value: f64, shape: Vec<usize>, dtype: DataType) -> FlintResult<NodeRef> {
    if shape.is_empty() {
        return Err(FlintError::IllegalDimensionality(
            "tensors have rank 1 or higher".to_string(),
        ));
    }
    link_node(OpKind::GenConstant { value }, dtype, shape, Vec::new())
}

/// Uniformly distributed `f64` values in `[0, 1)`.
pub fn random(shape: &[usize]) -> FlintResult<NodeRef> {
    finish(random_with_seed(shape.to_vec(), fresh_seed()))
}

pub(crate) fn random_with_seed(shape: Vec<usize>, seed: f64) -> FlintResult<NodeRef> {
    if shape.is_empty() {
        return Err(FlintError::IllegalDimensionality(
            "tensors have rank 1 or higher".to_string(),
        ));
    }
    link_node(OpKind::GenRandom { seed }, DataType::F64, shape, Vec::new())
}

/// `i64` indices along `axis`: every element holds its own coordinate in
/// that dimension.
pub fn arange(shape: &[usize], axis: usize) -> FlintResult<NodeRef> {
    if axis >= shape.len() {
        return finish(Err(FlintError::IllegalDimension(format!(
            "arange axis {axis} out of range for rank {}",
            shape.len()
        ))));
    }
    finish(link_node(
        OpKind::GenArange { axis },
        DataType::I64,
        shape.to_vec(),
        Vec::new(),
    ))
}

/// In training mode zeroes each element with probability `probability`
/// and rescales the survivors by `1 / (1 - probability)`; outside
/// training it is the identity.
pub fn dropout(a: &NodeRef, probability: f64, training: bool) -> FlintResult<NodeRef> {
    if !(0.0..1.0).contains(&probability) {
        return finish(Err(FlintError::InvalidSelect(format!(
            "dropout probability {probability} is outside [0, 1)"
        ))));
    }
    finish(link_node(
        OpKind::Dropout {
            probability,
            seed: fresh_seed(),
            training,
        },
        a.data_type(),
        a.shape(),
        vec![a.clone()],
    ))
}

// ---------------------------------------------------------------------------
// Operators

pub struct StoreOp;

impl Operator for StoreOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        _inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        let kind = node.kind();
        let OpKind::Store { data } = kind else {
            return Err(FlintError::InternalError(
                "store kernel on a non-store node".to_string(),
            ));
        };
        dispatch_chunk!(out, |s| {
            for (i, slot) in s.iter_mut().enumerate() {
                *slot = data.get(from + i);
            }
        });
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let par = state.find_or_insert_parameter(node);
        state.prepend(format!(
            "const {t} {name} = {par}[index];\n",
            t = node.data_type().ocl_name()
        ));
        Ok(())
    }

    fn eager_source(&self, _out: DataType, _ins: &[DataType]) -> String {
        "if (index >= num_entries0) return;\nR[index] = P0[index];\n".to_string()
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        Vec::new()
    }

    fn local_gradient(
        &self,
        _node: &NodeRef,
        _index: usize,
        _adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        Ok(None)
    }
}

pub struct GenRandomOp;

impl Operator for GenRandomOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        _inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        let seed = node.with_operation(|op| match op.kind {
            OpKind::GenRandom { seed } => seed,
            _ => 0.0,
        });
        let OutChunk::F64(out) = out else {
            return Err(FlintError::InternalError(
                "random tensors are f64".to_string(),
            ));
        };
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = index_hash(from + i, seed);
        }
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let seed = node.with_operation(|op| match op.kind {
            OpKind::GenRandom { seed } => seed,
            _ => 0.0,
        });
        state.prepend(format!(
            "const double {name}_v = sin((double)index + {seed:?}) * 43758.5453123;\n\
             const double {name} = min({name}_v - floor({name}_v), 0.99999);\n"
        ));
        Ok(())
    }

    fn eager_source(&self, _out: DataType, _ins: &[DataType]) -> String {
        "if (index >= num_entriesR) return;\n\
         const double v = sin((double)index + seed) * 43758.5453123;\n\
         R[index] = min(v - floor(v), 0.99999);\n"
            .to_string()
    }

    fn eager_params(&self, _out: DataType, _ins: &[DataType]) -> String {
        ", double seed".to_string()
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        vec![(DataType::F64, Vec::new())]
    }

    fn extra_args(&self, node: &NodeRef) -> Vec<KernelArg> {
        let seed = node.with_operation(|op| match op.kind {
            OpKind::GenRandom { seed } => seed,
            _ => 0.0,
        });
        vec![KernelArg::Double(seed)]
    }

    fn local_gradient(
        &self,
        _node: &NodeRef,
        _index: usize,
        _adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        Ok(None)
    }
}

pub struct GenConstantOp;

impl Operator for GenConstantOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        _inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        let _ = from;
        let value = node.with_operation(|op| match op.kind {
            OpKind::GenConstant { value } => value,
            _ => 0.0,
        });
        dispatch_chunk!(out, |s| {
            for slot in s.iter_mut() {
                *slot = TensorElement::from_f64(value);
            }
        });
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let value = node.with_operation(|op| match op.kind {
            OpKind::GenConstant { value } => value,
            _ => 0.0,
        });
        let t = node.data_type();
        let literal = if t.is_int() {
            format!("{}", value as i64)
        } else {
            format!("{value:?}")
        };
        state.prepend(format!(
            "const {t} {name} = {literal};\n",
            t = t.ocl_name()
        ));
        Ok(())
    }

    fn eager_source(&self, out: DataType, _ins: &[DataType]) -> String {
        format!(
            "if (index >= num_entriesR) return;\nR[index] = ({t})value;\n",
            t = out.ocl_name()
        )
    }

    fn eager_params(&self, _out: DataType, _ins: &[DataType]) -> String {
        ", double value".to_string()
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        [DataType::I32, DataType::I64, DataType::F32, DataType::F64]
            .into_iter()
            .map(|t| (t, Vec::new()))
            .collect()
    }

    fn extra_args(&self, node: &NodeRef) -> Vec<KernelArg> {
        let value = node.with_operation(|op| match op.kind {
            OpKind::GenConstant { value } => value,
            _ => 0.0,
        });
        vec![KernelArg::Double(value)]
    }

    fn local_gradient(
        &self,
        _node: &NodeRef,
        _index: usize,
        _adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        Ok(None)
    }
}

pub struct GenArangeOp;

impl Operator for GenArangeOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        _inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        let axis = node.with_operation(|op| match op.kind {
            OpKind::GenArange { axis } => axis,
            _ => 0,
        });
        let shape = node.shape();
        let acc = accumulated_strides(&shape);
        let OutChunk::I64(out) = out else {
            return Err(FlintError::InternalError(
                "arange tensors are i64".to_string(),
            ));
        };
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = (((from + i) / acc[axis]) % shape[axis]) as i64;
        }
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let axis = node.with_operation(|op| match op.kind {
            OpKind::GenArange { axis } => axis,
            _ => 0,
        });
        let shape = node.shape();
        let acc = accumulated_strides(&shape);
        state.prepend(format!(
            "const long {name} = (index / {a}) % {s};\n",
            a = acc[axis],
            s = shape[axis]
        ));
        Ok(())
    }

    fn eager_source(&self, _out: DataType, _ins: &[DataType]) -> String {
        "if (index >= num_entriesR) return;\nR[index] = (index / acc_axis) % dim_axis;\n"
            .to_string()
    }

    fn eager_params(&self, _out: DataType, _ins: &[DataType]) -> String {
        ", long acc_axis, long dim_axis".to_string()
    }

    fn type_permutations(&self) -> Vec<TypePermutation> {
        vec![(DataType::I64, Vec::new())]
    }

    fn extra_args(&self, node: &NodeRef) -> Vec<KernelArg> {
        let axis = node.with_operation(|op| match op.kind {
            OpKind::GenArange { axis } => axis,
            _ => 0,
        });
        let shape = node.shape();
        let acc = accumulated_strides(&shape);
        vec![
            KernelArg::Long(acc[axis] as i64),
            KernelArg::Long(shape[axis] as i64),
        ]
    }

    fn local_gradient(
        &self,
        _node: &NodeRef,
        _index: usize,
        _adjoint: &NodeRef,
    ) -> FlintResult<Option<NodeRef>> {
        Ok(None)
    }
}

pub struct DropoutOp;

impl DropoutOp {
    fn params(node: &NodeRef) -> (f64, f64, bool) {
        node.with_operation(|op| match op.kind {
            OpKind::Dropout {
                probability,
                seed,
                training,
            } => (probability, seed, training),
            _ => (0.0, 0.0, false),
        })
    }
}

impl Operator for DropoutOp {
    fn cpu_kernel(
        &self,
        node: &NodeRef,
        inputs: &[CpuInput],
        out: OutChunk<'_>,
        from: usize,
    ) -> FlintResult<()> {
        let (p, seed, training) = Self::params(node);
        dispatch_chunk!(out, |s| {
            for (i, slot) in s.iter_mut().enumerate() {
                let gi = from + i;
                if !training {
                    *slot = inputs[0].data.get(gi);
                } else if index_hash(gi, seed) < p {
                    *slot = Zero::zero();
                } else {
                    let v = inputs[0].data.get_f64(gi) / (1.0 - p);
                    *slot = TensorElement::from_f64(v);
                }
            }
        });
        Ok(())
    }

    fn lazy_fragment(&self, node: &NodeRef, name: &str, state: &mut CodegenState) -> FlintResult<()> {
        let (p, seed, training) = Self::params(node);
        let child = node.predecessor(0);
        let cn = state.next_name();
        let t = node.data_type().ocl_name();
        if training {
            state.prepend(format!(
                "const double {name}_v = sin((double)index + {seed:?}) * 43758.5453123;\n\
                 const {t} {name} = min({name}_v - floor({name}_v), 0.99999) < {p:?} ? ({t})0 : ({t})({cn} / (1.0 - {p:?}));\n"
            ));
        } else {
            state.prepend(format!("const {t} {name} = {cn};\n"));
        }
        emit_value(state, &child, &cn)
    }

    fn eager_source(&self, out: DataType, _ins: &[DataType]) -> String {
        format!(
            "if (index >= num_entries0) return;\n\
             if (!training) {{ R[index] = P0[index]; return; }}\n\
             const double v = sin((double)index + seed) * 43758.5453123;\n\
             R[index] = min(v - floor(v), 0.99999) < p ? ({t})0 : ({t})(P0[index] / (1.0 - p));\n",
            t = out.ocl_name()
        )
    }

    fn eager_params(&self, _out: DataType, in_types: &[DataType]) -> String {
        format!(
            ", const __global {t}* P0, long num_entries0, double p, double seed, int training",
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
        let (p, seed, training) = Self::params(node);
        vec![
            KernelArg::Double(p),
            KernelArg::Double(seed),
            KernelArg::Int(training as i32),
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
        use crate::ops::arithmetic::{div, mul, sub};
        use crate::ops::compare::less;
        let (p, seed, training) = Self::params(node);
        if !training {
            return Ok(Some(adjoint.clone()));
        }
        // The gradient reuses the forward mask through the stored seed.
        let pred = node.predecessor(0);
        let mask_noise = random_with_seed(pred.shape(), seed)?;
        let threshold = constant_of(p, pred.shape(), DataType::F64)?;
        let one = constant_of(1.0, pred.shape(), DataType::F64)?;
        let keep = sub(&one, &less(&mask_noise, &threshold)?)?;
        let scale = constant_of(1.0 - p, pred.shape(), DataType::F64)?;
        div(&mul(adjoint, &keep)?, &scale).map(Some)
    }

    fn reuses_inputs(&self, node: &NodeRef) -> Vec<bool> {
        vec![node.predecessor(0).data_type() == node.data_type()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_in_range() {
        for i in 0..1000 {
            let v = index_hash(i, 42.125);
            assert!((0.0..1.0).contains(&v));
            assert_eq!(v, index_hash(i, 42.125));
        }
    }

    #[test]
    fn arange_counts_along_its_axis() {
        let n = arange(&[2, 3], 1).unwrap();
        assert_eq!(n.data_type(), DataType::I64);
        assert_eq!(n.shape(), vec![2, 3]);
        assert!(arange(&[2, 3], 2).is_err());
    }
}

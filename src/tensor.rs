//! The typed frontend: a [`Tensor`] handle wrapping one graph node, with
//! constructors, the full builder surface as methods, value access that
//! forces execution and synchronization, and the gradient entry points.
//! Operator sugar (`&a + &b`) panics on misuse the way the underlying
//! builders would error; the named methods return results.

use ndarray::{ArrayD, IxDyn};

use crate::backend;
use crate::data::{DataType, TensorElement};
use crate::errors::{FlintError, FlintResult};
use crate::gradient;
use crate::graph::{new_store, NodeRef};
use crate::memory;
use crate::ops;
use crate::shape::accumulated_strides;

#[derive(Clone, Debug)]
pub struct Tensor {
    node: NodeRef,
}

impl From<NodeRef> for Tensor {
    fn from(node: NodeRef) -> Tensor {
        Tensor { node }
    }
}

impl Tensor {
    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    pub fn into_node(self) -> NodeRef {
        self.node
    }

    // -- Constructors -------------------------------------------------------

    /// Storage tensor from a flat buffer in row-major order.
    pub fn from_vec<T: TensorElement>(values: Vec<T>, shape: &[usize]) -> FlintResult<Tensor> {
        new_store(T::wrap_vec(values), shape.to_vec()).map(Tensor::from)
    }

    /// Storage tensor from an `ndarray` array.
    pub fn from_array<T: TensorElement>(array: ArrayD<T>) -> FlintResult<Tensor> {
        let shape = array.shape().to_vec();
        let values: Vec<T> = array.iter().copied().collect();
        Tensor::from_vec(values, &shape)
    }

    /// A tensor filled with one value.
    pub fn constant(value: f64, shape: &[usize], dtype: DataType) -> FlintResult<Tensor> {
        ops::generate::constant(value, shape, dtype).map(Tensor::from)
    }

    /// Uniform random values in `[0, 1)` as `f64`.
    pub fn random(shape: &[usize]) -> FlintResult<Tensor> {
        ops::generate::random(shape).map(Tensor::from)
    }

    /// `i64` coordinates along `axis`.
    pub fn arange(shape: &[usize], axis: usize) -> FlintResult<Tensor> {
        ops::generate::arange(shape, axis).map(Tensor::from)
    }

    // -- Introspection ------------------------------------------------------

    pub fn shape(&self) -> Vec<usize> {
        self.node.shape()
    }

    pub fn rank(&self) -> usize {
        self.node.rank()
    }

    pub fn data_type(&self) -> DataType {
        self.node.data_type()
    }

    pub fn num_elements(&self) -> usize {
        self.node.num_elements()
    }

    // -- Execution and value access ----------------------------------------

    /// Materializes the result in place and returns `self`.
    pub fn execute(&self) -> FlintResult<&Tensor> {
        backend::execute(&self.node)?;
        Ok(self)
    }

    /// Ensures the result is present in host memory.
    pub fn sync(&self) -> FlintResult<&Tensor> {
        backend::sync_memory(&self.node)?;
        Ok(self)
    }

    /// The flat result, executing first if necessary.
    pub fn to_vec<T: TensorElement>(&self) -> FlintResult<Vec<T>> {
        self.execute()?;
        let data = memory::result_buffer(&self.node)?;
        Ok(data.to_vec::<T>())
    }

    /// The result as an `ndarray` array, executing first if necessary.
    pub fn to_array<T: TensorElement>(&self) -> FlintResult<ArrayD<T>> {
        let values = self.to_vec::<T>()?;
        ArrayD::from_shape_vec(IxDyn(&self.shape()), values)
            .map_err(|e| FlintError::InternalError(format!("result buffer mismatch: {e}")))
    }

    /// One element by multi-dimensional index.
    pub fn at<T: TensorElement>(&self, indices: &[usize]) -> FlintResult<T> {
        let shape = self.shape();
        if indices.len() != shape.len() || indices.iter().zip(&shape).any(|(i, s)| i >= s) {
            return Err(FlintError::IllegalDimension(format!(
                "index {indices:?} out of range for shape {shape:?}"
            )));
        }
        self.execute()?;
        let data = memory::result_buffer(&self.node)?;
        let acc = accumulated_strides(&shape);
        let flat: usize = indices.iter().zip(&acc).map(|(&i, &a)| i * a).sum();
        Ok(data.get::<T>(flat))
    }

    /// Collapses this executed tensor into plain storage when nothing
    /// watches it, releasing its inputs.
    pub fn optimize_memory(&self) -> FlintResult<&Tensor> {
        memory::optimize_memory(&self.node)?;
        Ok(self)
    }

    // -- Gradients ----------------------------------------------------------

    /// Marks this tensor as a gradient variable.
    pub fn watch(&self) -> &Tensor {
        gradient::mark_gradient_variable(&self.node);
        self
    }

    pub fn unwatch(&self) -> &Tensor {
        gradient::unmark_gradient_variable(&self.node);
        self
    }

    /// The executed derivative of `self` with respect to `x`.
    pub fn gradient(&self, x: &Tensor) -> FlintResult<Tensor> {
        let g = gradient::calculate_gradient(&self.node, &x.node)?;
        backend::execute(&g)?;
        Ok(Tensor::from(g))
    }

    /// Executed derivatives with respect to several variables, sharing one
    /// backward pass.
    pub fn gradients(&self, xs: &[&Tensor]) -> FlintResult<Vec<Tensor>> {
        let nodes: Vec<NodeRef> = xs.iter().map(|x| x.node.clone()).collect();
        let gs = gradient::calculate_gradients(&self.node, &nodes)?;
        gs.into_iter()
            .map(|g| {
                backend::execute(&g)?;
                Ok(Tensor::from(g))
            })
            .collect()
    }

    // -- Operation surface --------------------------------------------------

    pub fn add(&self, other: &Tensor) -> FlintResult<Tensor> {
        ops::arithmetic::add(&self.node, &other.node).map(Tensor::from)
    }

    pub fn sub(&self, other: &Tensor) -> FlintResult<Tensor> {
        ops::arithmetic::sub(&self.node, &other.node).map(Tensor::from)
    }

    pub fn mul(&self, other: &Tensor) -> FlintResult<Tensor> {
        ops::arithmetic::mul(&self.node, &other.node).map(Tensor::from)
    }

    pub fn div(&self, other: &Tensor) -> FlintResult<Tensor> {
        ops::arithmetic::div(&self.node, &other.node).map(Tensor::from)
    }

    pub fn pow(&self, other: &Tensor) -> FlintResult<Tensor> {
        ops::arithmetic::pow(&self.node, &other.node).map(Tensor::from)
    }

    /// Elementwise combination with a scalar, which broadcasts as a
    /// constant tensor of this tensor's shape.
    pub fn add_scalar(&self, value: f64) -> FlintResult<Tensor> {
        let c = self.scalar_operand(value)?;
        self.add(&c)
    }

    pub fn sub_scalar(&self, value: f64) -> FlintResult<Tensor> {
        let c = self.scalar_operand(value)?;
        self.sub(&c)
    }

    pub fn mul_scalar(&self, value: f64) -> FlintResult<Tensor> {
        let c = self.scalar_operand(value)?;
        self.mul(&c)
    }

    pub fn div_scalar(&self, value: f64) -> FlintResult<Tensor> {
        let c = self.scalar_operand(value)?;
        self.div(&c)
    }

    pub fn pow_scalar(&self, value: f64) -> FlintResult<Tensor> {
        let c = self.scalar_operand(value)?;
        self.pow(&c)
    }

    fn scalar_operand(&self, value: f64) -> FlintResult<Tensor> {
        let dtype = if self.data_type().is_float() || value.fract() == 0.0 {
            self.data_type()
        } else {
            DataType::F64
        };
        Tensor::constant(value, &self.shape(), dtype)
    }

    pub fn neg(&self) -> FlintResult<Tensor> {
        ops::arithmetic::neg(&self.node).map(Tensor::from)
    }

    pub fn abs(&self) -> FlintResult<Tensor> {
        ops::arithmetic::abs(&self.node).map(Tensor::from)
    }

    pub fn log(&self) -> FlintResult<Tensor> {
        ops::arithmetic::log(&self.node).map(Tensor::from)
    }

    pub fn log2(&self) -> FlintResult<Tensor> {
        ops::arithmetic::log2(&self.node).map(Tensor::from)
    }

    pub fn log10(&self) -> FlintResult<Tensor> {
        ops::arithmetic::log10(&self.node).map(Tensor::from)
    }

    pub fn sin(&self) -> FlintResult<Tensor> {
        ops::arithmetic::sin(&self.node).map(Tensor::from)
    }

    pub fn cos(&self) -> FlintResult<Tensor> {
        ops::arithmetic::cos(&self.node).map(Tensor::from)
    }

    pub fn tan(&self) -> FlintResult<Tensor> {
        ops::arithmetic::tan(&self.node).map(Tensor::from)
    }

    pub fn asin(&self) -> FlintResult<Tensor> {
        ops::arithmetic::asin(&self.node).map(Tensor::from)
    }

    pub fn acos(&self) -> FlintResult<Tensor> {
        ops::arithmetic::acos(&self.node).map(Tensor::from)
    }

    pub fn atan(&self) -> FlintResult<Tensor> {
        ops::arithmetic::atan(&self.node).map(Tensor::from)
    }

    pub fn sqrt(&self) -> FlintResult<Tensor> {
        ops::arithmetic::sqrt(&self.node).map(Tensor::from)
    }

    pub fn exp(&self) -> FlintResult<Tensor> {
        ops::arithmetic::exp(&self.node).map(Tensor::from)
    }

    pub fn sign(&self) -> FlintResult<Tensor> {
        ops::arithmetic::sign(&self.node).map(Tensor::from)
    }

    pub fn even(&self) -> FlintResult<Tensor> {
        ops::arithmetic::even(&self.node).map(Tensor::from)
    }

    pub fn less(&self, other: &Tensor) -> FlintResult<Tensor> {
        ops::compare::less(&self.node, &other.node).map(Tensor::from)
    }

    pub fn greater(&self, other: &Tensor) -> FlintResult<Tensor> {
        ops::compare::greater(&self.node, &other.node).map(Tensor::from)
    }

    pub fn equal(&self, other: &Tensor) -> FlintResult<Tensor> {
        ops::compare::equal(&self.node, &other.node).map(Tensor::from)
    }

    pub fn minimum(&self, other: &Tensor) -> FlintResult<Tensor> {
        ops::compare::minimum(&self.node, &other.node).map(Tensor::from)
    }

    pub fn maximum(&self, other: &Tensor) -> FlintResult<Tensor> {
        ops::compare::maximum(&self.node, &other.node).map(Tensor::from)
    }

    pub fn matmul(&self, other: &Tensor) -> FlintResult<Tensor> {
        ops::matmul::matmul(&self.node, &other.node).map(Tensor::from)
    }

    pub fn flatten(&self) -> FlintResult<Tensor> {
        ops::reshape::flatten(&self.node).map(Tensor::from)
    }

    pub fn flatten_dim(&self, dim: usize) -> FlintResult<Tensor> {
        ops::reshape::flatten_dim(&self.node, dim).map(Tensor::from)
    }

    pub fn reshape(&self, shape: &[usize]) -> FlintResult<Tensor> {
        ops::reshape::reshape(&self.node, shape).map(Tensor::from)
    }

    pub fn convert(&self, dtype: DataType) -> FlintResult<Tensor> {
        ops::reshape::convert(&self.node, dtype).map(Tensor::from)
    }

    pub fn transpose(&self, perm: &[usize]) -> FlintResult<Tensor> {
        ops::reshape::transpose(&self.node, perm).map(Tensor::from)
    }

    pub fn repeat(&self, repetitions: &[usize]) -> FlintResult<Tensor> {
        ops::reshape::repeat(&self.node, repetitions).map(Tensor::from)
    }

    pub fn concat(&self, other: &Tensor, axis: usize) -> FlintResult<Tensor> {
        ops::reshape::concat(&self.node, &other.node, axis).map(Tensor::from)
    }

    pub fn reduce_sum(&self, axis: usize) -> FlintResult<Tensor> {
        ops::reduce::reduce_sum(&self.node, axis).map(Tensor::from)
    }

    pub fn reduce_mul(&self, axis: usize) -> FlintResult<Tensor> {
        ops::reduce::reduce_mul(&self.node, axis).map(Tensor::from)
    }

    pub fn reduce_min(&self, axis: usize) -> FlintResult<Tensor> {
        ops::reduce::reduce_min(&self.node, axis).map(Tensor::from)
    }

    pub fn reduce_max(&self, axis: usize) -> FlintResult<Tensor> {
        ops::reduce::reduce_max(&self.node, axis).map(Tensor::from)
    }

    pub fn slice(&self, start: &[i64], end: &[i64], step: &[i64]) -> FlintResult<Tensor> {
        ops::index::slice(&self.node, start, end, step).map(Tensor::from)
    }

    pub fn extend(&self, new_shape: &[usize], insert_at: &[usize]) -> FlintResult<Tensor> {
        ops::index::extend(&self.node, new_shape, insert_at).map(Tensor::from)
    }

    pub fn extend_step(
        &self,
        new_shape: &[usize],
        insert_at: &[usize],
        step: &[i64],
    ) -> FlintResult<Tensor> {
        ops::index::extend_step(&self.node, new_shape, insert_at, step).map(Tensor::from)
    }

    pub fn index(&self, indices: &Tensor) -> FlintResult<Tensor> {
        ops::index::index(&self.node, &indices.node).map(Tensor::from)
    }

    pub fn set_index(&self, updates: &Tensor, indices: &Tensor) -> FlintResult<Tensor> {
        ops::index::set_index(&self.node, &updates.node, &indices.node).map(Tensor::from)
    }

    pub fn sliding_window(&self, size: &[usize], step: &[usize]) -> FlintResult<Tensor> {
        ops::window::sliding_window(&self.node, size, step).map(Tensor::from)
    }

    pub fn unslide_window(&self, result_shape: &[usize], step: &[usize]) -> FlintResult<Tensor> {
        ops::window::unslide_window(&self.node, result_shape, step).map(Tensor::from)
    }

    pub fn pooling_sum(&self, size: &[usize], step: &[usize]) -> FlintResult<Tensor> {
        ops::window::pooling_sum(&self.node, size, step).map(Tensor::from)
    }

    pub fn pooling_max(&self, size: &[usize], step: &[usize]) -> FlintResult<Tensor> {
        ops::window::pooling_max(&self.node, size, step).map(Tensor::from)
    }

    pub fn convolve(&self, kernel: &Tensor, steps: &[usize]) -> FlintResult<Tensor> {
        ops::conv::convolve(&self.node, &kernel.node, steps).map(Tensor::from)
    }

    pub fn dropout(&self, probability: f64, training: bool) -> FlintResult<Tensor> {
        ops::generate::dropout(&self.node, probability, training).map(Tensor::from)
    }

    /// Marks this tensor for inverse (prefix-aligned) broadcasting when
    /// used as the smaller operand of a binary operation.
    pub fn enable_inverse_broadcasting(&self) -> &Tensor {
        self.node.enable_inverse_broadcasting();
        self
    }

    pub fn serialize(&self) -> FlintResult<Vec<u8>> {
        crate::serialize::serialize(&self.node)
    }

    pub fn deserialize(bytes: &[u8]) -> FlintResult<Tensor> {
        crate::serialize::deserialize(bytes).map(Tensor::from)
    }
}

macro_rules! tensor_binop {
    ($trait:ident, $method:ident, $call:ident, $what:literal) => {
        impl std::ops::$trait<&Tensor> for &Tensor {
            type Output = Tensor;

            fn $method(self, rhs: &Tensor) -> Tensor {
                self.$call(rhs).expect($what)
            }
        }
    };
}

tensor_binop!(Add, add, add, "tensor addition failed");
tensor_binop!(Sub, sub, sub, "tensor subtraction failed");
tensor_binop!(Mul, mul, mul, "tensor multiplication failed");
tensor_binop!(Div, div, div, "tensor division failed");

impl std::ops::Neg for &Tensor {
    type Output = Tensor;

    fn neg(self) -> Tensor {
        Tensor::neg(self).expect("tensor negation failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn round_trips_through_ndarray() {
        let t = Tensor::from_array(array![[1.0f32, 2.0], [3.0, 4.0]].into_dyn()).unwrap();
        assert_eq!(t.shape(), vec![2, 2]);
        let back = t.to_array::<f32>().unwrap();
        assert_eq!(back, array![[1.0f32, 2.0], [3.0, 4.0]].into_dyn());
    }

    #[test]
    fn element_access_checks_bounds() {
        let t = Tensor::from_vec(vec![1i32, 2, 3, 4], &[2, 2]).unwrap();
        assert_eq!(t.at::<i32>(&[1, 0]).unwrap(), 3);
        assert!(t.at::<i32>(&[2, 0]).is_err());
    }
}

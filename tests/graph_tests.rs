//! Graph construction: shape and type rules per builder, the reference
//! counting law, and the builder error taxonomy.

use flint::data::DataType;
use flint::errors::{ErrorKind, FlintError};
use flint::graph::OpCode;
use flint::Tensor;

fn f32s(values: &[f32], shape: &[usize]) -> Tensor {
    Tensor::from_vec(values.to_vec(), shape).unwrap()
}

#[test]
fn elementwise_shape_is_the_longer_operand() {
    let a = f32s(&[1.0; 24], &[2, 3, 4]);
    let b = f32s(&[1.0; 12], &[3, 4]);
    let ops: [fn(&Tensor, &Tensor) -> flint::FlintResult<Tensor>; 5] =
        [Tensor::add, Tensor::sub, Tensor::mul, Tensor::div, Tensor::pow];
    for op in ops {
        let r = op(&a, &b).unwrap();
        assert_eq!(r.shape(), vec![2, 3, 4]);
    }
}

#[test]
fn type_promotion_follows_rank_order() {
    let i32t = Tensor::from_vec(vec![1i32, 2], &[2]).unwrap();
    let i64t = Tensor::from_vec(vec![1i64, 2], &[2]).unwrap();
    let f32t = Tensor::from_vec(vec![1.0f32, 2.0], &[2]).unwrap();
    let f64t = Tensor::from_vec(vec![1.0f64, 2.0], &[2]).unwrap();
    assert_eq!(i32t.add(&i64t).unwrap().data_type(), DataType::I64);
    assert_eq!(i64t.add(&f32t).unwrap().data_type(), DataType::F32);
    assert_eq!(f32t.add(&f64t).unwrap().data_type(), DataType::F64);
    assert_eq!(i32t.add(&i32t).unwrap().data_type(), DataType::I32);
}

#[test]
fn comparison_results_are_i32() {
    let a = f32s(&[1.0, 2.0], &[2]);
    let b = f32s(&[2.0, 1.0], &[2]);
    assert_eq!(a.less(&b).unwrap().data_type(), DataType::I32);
    assert_eq!(a.greater(&b).unwrap().data_type(), DataType::I32);
    assert_eq!(a.equal(&b).unwrap().data_type(), DataType::I32);
}

#[test]
fn shape_product_matches_result_entries() {
    let a = f32s(&[1.0; 6], &[2, 3]);
    let cases = vec![
        a.flatten().unwrap(),
        a.reshape(&[3, 2]).unwrap(),
        a.transpose(&[1, 0]).unwrap(),
        a.repeat(&[1, 0]).unwrap(),
        a.reduce_sum(0).unwrap(),
    ];
    for t in cases {
        t.execute().unwrap();
        let n: usize = t.shape().iter().product();
        assert_eq!(t.to_vec::<f32>().unwrap().len(), n);
    }
}

#[test]
fn reference_counts_track_handles_and_edges() {
    let a = f32s(&[1.0, 2.0], &[2]);
    assert_eq!(a.node().reference_count(), 1);
    let b = a.add(&a).unwrap();
    // Two predecessor edges from the sum plus our handle.
    assert_eq!(a.node().reference_count(), 3);
    let c = b.clone();
    assert_eq!(b.node().reference_count(), 2);
    drop(c);
    assert_eq!(b.node().reference_count(), 1);
    drop(b);
    assert_eq!(a.node().reference_count(), 1);
}

#[test]
fn dropping_the_graph_cascades() {
    let a = f32s(&[1.0, 2.0], &[2]);
    let top = {
        let mid = a.add(&a).unwrap();
        mid.mul(&mid).unwrap()
    };
    // The intermediate is now owned exclusively by the product node.
    assert_eq!(a.node().reference_count(), 3);
    drop(top);
    assert_eq!(a.node().reference_count(), 1);
}

#[test]
fn incompatible_shapes_are_rejected() {
    let a = f32s(&[1.0; 6], &[2, 3]);
    let b = f32s(&[1.0; 4], &[4]);
    let err = a.add(&b).unwrap_err();
    assert!(matches!(err, FlintError::IncompatibleShapes { .. }));
    assert_eq!(
        flint::last_error_kind(),
        Some(ErrorKind::IncompatibleShapes)
    );
    assert!(!flint::last_error_message().is_empty());
}

#[test]
fn error_taxonomy_per_builder() {
    let a = f32s(&[1.0; 6], &[2, 3]);
    let v = f32s(&[1.0; 3], &[3]);
    assert_eq!(
        v.matmul(&v).unwrap_err().kind(),
        ErrorKind::IllegalDimensionality
    );
    assert_eq!(a.reduce_sum(2).unwrap_err().kind(), ErrorKind::IllegalDimension);
    assert_eq!(
        a.slice(&[0, 0], &[0, 3], &[1, 1]).unwrap_err().kind(),
        ErrorKind::InvalidSelect
    );
    assert_eq!(
        a.extend(&[2, 3], &[1, 0]).unwrap_err().kind(),
        ErrorKind::InvalidSelect
    );
    assert_eq!(a.even().unwrap_err().kind(), ErrorKind::WrongType);
    assert_eq!(
        a.reshape(&[5]).unwrap_err().kind(),
        ErrorKind::IncompatibleShapes
    );
    assert_eq!(
        a.transpose(&[0, 0]).unwrap_err().kind(),
        ErrorKind::IllegalDimension
    );
}

#[test]
fn optimize_memory_collapses_executed_nodes() {
    let a = f32s(&[1.0, 2.0], &[2]);
    let b = a.add(&a).unwrap();
    b.execute().unwrap();
    assert_eq!(a.node().reference_count(), 3);
    b.optimize_memory().unwrap();
    assert_eq!(b.node().code(), OpCode::Store);
    assert_eq!(b.node().num_predecessors(), 0);
    // The collapse released both edges into `a`.
    assert_eq!(a.node().reference_count(), 1);
    assert_eq!(b.to_vec::<f32>().unwrap(), vec![2.0, 4.0]);
}

#[test]
fn watched_nodes_resist_collapse() {
    let a = f32s(&[1.0, 2.0], &[2]);
    let b = a.add(&a).unwrap();
    b.watch();
    b.execute().unwrap();
    b.optimize_memory().unwrap();
    assert_ne!(b.node().code(), OpCode::Store);
    b.unwatch();
    b.optimize_memory().unwrap();
    assert_eq!(b.node().code(), OpCode::Store);
}

#[test]
fn gradient_info_only_tracks_inside_context() {
    let a = f32s(&[1.0, 2.0], &[2]);
    a.watch();
    let outside = a.add(&a).unwrap();
    assert!(!outside.node().tracks(a.node().id()));
    let _ctx = flint::GradientContext::new();
    let inside = a.add(&a).unwrap();
    assert!(inside.node().tracks(a.node().id()));
}

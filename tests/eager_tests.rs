//! Eager execution mode. Lives in its own integration binary because the
//! flag is process-wide.

use flint::{DataType, Tensor};

#[test]
fn builders_execute_immediately_in_eager_mode() {
    flint::set_eager_execution(true);
    assert!(flint::is_eager_execution());

    let a = Tensor::from_vec(vec![1.0f64, 2.0], &[2]).unwrap();
    let b = a.add_scalar(1.0).unwrap();
    assert!(b.node().has_result(), "eager mode materializes on build");
    let c = b.mul(&b).unwrap();
    assert!(c.node().has_result());
    assert_eq!(c.to_vec::<f64>().unwrap(), vec![4.0, 9.0]);

    // Intermediates stay resident for reuse in eager mode.
    assert!(b.node().has_result());

    flint::set_eager_execution(false);
    let d = Tensor::constant(1.0, &[2], DataType::F64)
        .unwrap()
        .add_scalar(1.0)
        .unwrap();
    assert!(!d.node().has_result(), "lazy mode defers execution");
    assert_eq!(d.to_vec::<f64>().unwrap(), vec![2.0, 2.0]);
}

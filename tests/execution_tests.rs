//! End-to-end CPU execution against fixed inputs and outputs.

use flint::data::DataType;
use flint::Tensor;

fn assert_close(got: &[f64], want: &[f64]) {
    assert_eq!(got.len(), want.len());
    for (g, w) in got.iter().zip(want) {
        assert!((g - w).abs() < 1e-9, "got {got:?}, want {want:?}");
    }
}

#[test]
fn matmul_batched_shape_and_values() {
    let a = Tensor::constant(1.0, &[64, 32, 16], DataType::F32).unwrap();
    let b = Tensor::constant(2.0, &[16, 24], DataType::F32).unwrap();
    let c = a.matmul(&b).unwrap();
    assert_eq!(c.shape(), vec![64, 32, 24]);
    let values = c.to_vec::<f32>().unwrap();
    assert!(values.iter().all(|&v| v == 32.0));
}

#[test]
fn matmul_values_2x2() {
    let a = Tensor::from_vec(vec![1.0f64, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    let b = Tensor::from_vec(vec![5.0f64, 6.0, 7.0, 8.0], &[2, 2]).unwrap();
    let c = a.matmul(&b).unwrap();
    assert_close(&c.to_vec::<f64>().unwrap(), &[19.0, 22.0, 43.0, 50.0]);
}

#[test]
fn convolve_values() {
    let t1 = Tensor::from_vec(
        vec![
            0.0f32, 1.0, 1.0, 2.0, 3.0, 4.0, //
            5.0, 6.0, 7.0, 8.0, 9.0, 0.0, //
            1.0, 2.0, 3.0, 4.0, 5.0, 6.0,
        ],
        &[3, 3, 2],
    )
    .unwrap();
    let k1 = Tensor::from_vec(
        vec![1.0f32, 1.0, 2.0, 2.0, 2.0, 2.0, 1.0, 1.0],
        &[2, 2, 2],
    )
    .unwrap();
    let r = t1.convolve(&k1, &[1, 1]).unwrap();
    assert_eq!(r.shape(), vec![3, 3]);
    let got = r.to_vec::<f32>().unwrap();
    let want = [44.0, 56.0, 25.0, 54.0, 58.0, 31.0, 17.0, 29.0, 11.0];
    assert_eq!(got, want);
}

#[test]
fn convolve_with_stride() {
    let t2 = Tensor::from_vec(
        vec![0.0f32, 1.0, 2.0, 3.0, 3.0, 2.0, 1.0, 0.0],
        &[2, 4, 1],
    )
    .unwrap();
    let k2 = Tensor::from_vec(vec![1.0f32, 2.0], &[1, 2, 1]).unwrap();
    let r = t2.convolve(&k2, &[1, 2]).unwrap();
    assert_eq!(r.to_vec::<f32>().unwrap(), vec![2.0, 8.0, 7.0, 1.0]);
}

#[test]
fn reduce_max_over_first_axis() {
    let t = Tensor::from_vec(
        vec![0i32, 1, 32, 2, 3, 4, 4, 5, -6, 6, 7, -1],
        &[2, 2, 3],
    )
    .unwrap();
    let r = t.reduce_max(0).unwrap();
    assert_eq!(r.shape(), vec![2, 3]);
    assert_eq!(r.to_vec::<i32>().unwrap(), vec![4, 5, 32, 6, 7, 4]);
}

#[test]
fn reduce_identities() {
    let t = Tensor::from_vec(vec![2.0f64, 3.0, 4.0, 5.0], &[2, 2]).unwrap();
    assert_close(&t.reduce_sum(1).unwrap().to_vec::<f64>().unwrap(), &[5.0, 9.0]);
    assert_close(&t.reduce_mul(1).unwrap().to_vec::<f64>().unwrap(), &[6.0, 20.0]);
    assert_close(&t.reduce_min(0).unwrap().to_vec::<f64>().unwrap(), &[2.0, 3.0]);
    assert_close(&t.reduce_max(0).unwrap().to_vec::<f64>().unwrap(), &[4.0, 5.0]);
    let v = Tensor::from_vec(vec![0i32, 1, 32, 2, 3, 4, -6, 7, -4], &[9]).unwrap();
    assert_eq!(v.reduce_min(0).unwrap().to_vec::<i32>().unwrap(), vec![-6]);
    assert_eq!(v.reduce_max(0).unwrap().to_vec::<i32>().unwrap(), vec![32]);
}

#[test]
fn slice_with_negative_steps() {
    let t = Tensor::from_vec(
        vec![0i32, 1, 32, 2, 3, 4, 4, 5, -6, 6, 7, -1],
        &[2, 2, 3],
    )
    .unwrap();
    let s = t.slice(&[0, 0, 2], &[2, -1, 0], &[1, 1, -1]).unwrap();
    assert_eq!(s.shape(), vec![2, 1, 2]);
    assert_eq!(s.to_vec::<i32>().unwrap(), vec![32, 1, -6, 5]);
}

#[test]
fn extend_embeds_into_zeros() {
    let t = Tensor::from_vec(vec![1i32, 2, 3, 4], &[2, 2]).unwrap();
    let e = t.extend(&[4, 4], &[1, 2]).unwrap();
    assert_eq!(e.shape(), vec![4, 4]);
    let mut want = vec![0i32; 16];
    want[1 * 4 + 2] = 1;
    want[1 * 4 + 3] = 2;
    want[2 * 4 + 2] = 3;
    want[2 * 4 + 3] = 4;
    assert_eq!(e.to_vec::<i32>().unwrap(), want);
}

#[test]
fn extend_with_negative_step_reverses() {
    let t = Tensor::from_vec(vec![1i32, 2, 3], &[3]).unwrap();
    let e = t.extend_step(&[6], &[0], &[-2]).unwrap();
    assert_eq!(e.to_vec::<i32>().unwrap(), vec![3, 0, 2, 0, 1, 0]);
}

#[test]
fn pow_values() {
    let t = Tensor::from_vec(vec![0i32, 1, 2, 3], &[2, 2]).unwrap();
    let e = t.pow_scalar(3.0).unwrap();
    let got = e.to_vec::<f64>().unwrap();
    assert_close(&got, &[0.0, 1.0, 8.0, 27.0]);
}

#[test]
fn repeat_then_slice_recovers_the_prefix() {
    let t = Tensor::from_vec(vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    let r = t.repeat(&[2, 1]).unwrap();
    assert_eq!(r.shape(), vec![6, 6]);
    let s = r.slice(&[0, 0], &[2, 3], &[1, 1]).unwrap();
    assert_eq!(s.to_vec::<f64>().unwrap(), t.to_vec::<f64>().unwrap());
}

#[test]
fn reshape_shares_the_buffer() {
    let t = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    let r = t.reshape(&[3, 2]).unwrap();
    let f = t.flatten().unwrap();
    r.execute().unwrap();
    f.execute().unwrap();
    let original = t.node().result_data().unwrap();
    let reshaped = r.node().result_data().unwrap();
    let flattened = f.node().result_data().unwrap();
    assert!(std::sync::Arc::ptr_eq(&original, &reshaped));
    assert!(std::sync::Arc::ptr_eq(&original, &flattened));
    assert_eq!(r.to_vec::<f32>().unwrap(), t.to_vec::<f32>().unwrap());
}

#[test]
fn transpose_reorders_elements() {
    let t = Tensor::from_vec(vec![1i32, 2, 3, 4, 5, 6], &[2, 3]).unwrap();
    let tt = t.transpose(&[1, 0]).unwrap();
    assert_eq!(tt.shape(), vec![3, 2]);
    assert_eq!(tt.to_vec::<i32>().unwrap(), vec![1, 4, 2, 5, 3, 6]);
}

#[test]
fn concat_along_both_axes() {
    let a = Tensor::from_vec(vec![1i32, 2, 3, 4], &[2, 2]).unwrap();
    let b = Tensor::from_vec(vec![5i32, 6, 7, 8], &[2, 2]).unwrap();
    let rows = a.concat(&b, 0).unwrap();
    assert_eq!(rows.to_vec::<i32>().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    let cols = a.concat(&b, 1).unwrap();
    assert_eq!(cols.to_vec::<i32>().unwrap(), vec![1, 2, 5, 6, 3, 4, 7, 8]);
}

#[test]
fn index_gathers_rows() {
    let src = Tensor::from_vec(vec![0.0f64, 1.0, 2.0, 3.0, 4.0, 5.0], &[3, 2]).unwrap();
    let idx = Tensor::from_vec(vec![2i32, 0, 2], &[3]).unwrap();
    let picked = src.index(&idx).unwrap();
    assert_eq!(picked.shape(), vec![3, 2]);
    assert_close(
        &picked.to_vec::<f64>().unwrap(),
        &[4.0, 5.0, 0.0, 1.0, 4.0, 5.0],
    );
}

#[test]
fn set_index_sums_collisions_and_keeps_the_rest() {
    let src = Tensor::from_vec(vec![10.0f64, 20.0, 30.0, 40.0], &[4]).unwrap();
    let upd = Tensor::from_vec(vec![1.0f64, 2.0, 3.0], &[3]).unwrap();
    let idx = Tensor::from_vec(vec![1i32, 1, 3], &[3]).unwrap();
    let r = src.set_index(&upd, &idx).unwrap();
    // Position 1 takes the sum of its updates (the original value is
    // discarded), untouched positions keep the source.
    assert_close(&r.to_vec::<f64>().unwrap(), &[10.0, 3.0, 30.0, 3.0]);
}

#[test]
fn sliding_window_materializes_every_window() {
    let t = Tensor::from_vec((0..16).map(|v| v as f64).collect(), &[4, 4]).unwrap();
    let w = t.sliding_window(&[2, 2], &[2, 2]).unwrap();
    assert_eq!(w.shape(), vec![4, 2, 2]);
    assert_close(
        &w.to_vec::<f64>().unwrap(),
        &[
            0.0, 1.0, 4.0, 5.0, //
            2.0, 3.0, 6.0, 7.0, //
            8.0, 9.0, 12.0, 13.0, //
            10.0, 11.0, 14.0, 15.0,
        ],
    );
}

#[test]
fn unslide_window_sums_overlaps() {
    let t = Tensor::from_vec((0..9).map(|v| v as f64).collect(), &[3, 3]).unwrap();
    let w = t.sliding_window(&[2, 3], &[1, 1]).unwrap();
    assert_eq!(w.shape(), vec![2, 2, 3]);
    let back = w.unslide_window(&[3, 3], &[1, 1]).unwrap();
    // Middle row is covered by both windows, the outer rows by one.
    assert_close(
        &back.to_vec::<f64>().unwrap(),
        &[0.0, 1.0, 2.0, 6.0, 8.0, 10.0, 6.0, 7.0, 8.0],
    );
}

#[test]
fn pooling_reduces_whole_windows() {
    let t = Tensor::from_vec(
        vec![1.0f64, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0],
        &[4, 2],
    )
    .unwrap();
    let sum = t.pooling_sum(&[2], &[1]).unwrap();
    assert_eq!(sum.shape(), vec![3]);
    assert_close(&sum.to_vec::<f64>().unwrap(), &[33.0, 55.0, 77.0]);
    let max = t.pooling_max(&[2], &[1]).unwrap();
    assert_close(&max.to_vec::<f64>().unwrap(), &[20.0, 30.0, 40.0]);
}

#[test]
fn generators_fill_as_specified() {
    let c = Tensor::constant(2.5, &[2, 2], DataType::F32).unwrap();
    assert_eq!(c.to_vec::<f32>().unwrap(), vec![2.5; 4]);
    let n = Tensor::arange(&[2, 3], 1).unwrap();
    assert_eq!(n.to_vec::<i64>().unwrap(), vec![0, 1, 2, 0, 1, 2]);
    let r = Tensor::random(&[32]).unwrap();
    let values = r.to_vec::<f64>().unwrap();
    assert!(values.iter().all(|v| (0.0..1.0).contains(v)));
    // Not all equal.
    assert!(values.windows(2).any(|w| w[0] != w[1]));
}

#[test]
fn unary_math_matches_the_standard_library() {
    let t = Tensor::from_vec(vec![0.25f64, 0.5, 1.0, 2.0], &[4]).unwrap();
    assert_close(
        &t.log().unwrap().to_vec::<f64>().unwrap(),
        &[0.25f64.ln(), 0.5f64.ln(), 0.0, 2f64.ln()],
    );
    assert_close(
        &t.sqrt().unwrap().to_vec::<f64>().unwrap(),
        &[0.5, 0.5f64.sqrt(), 1.0, 2f64.sqrt()],
    );
    assert_close(
        &t.exp().unwrap().to_vec::<f64>().unwrap(),
        &[0.25f64.exp(), 0.5f64.exp(), 1f64.exp(), 2f64.exp()],
    );
    let s = Tensor::from_vec(vec![-3.0f64, 0.0, 4.0], &[3]).unwrap();
    assert_eq!(s.sign().unwrap().to_vec::<i32>().unwrap(), vec![-1, 1, 1]);
    assert_close(&s.abs().unwrap().to_vec::<f64>().unwrap(), &[3.0, 0.0, 4.0]);
    let e = Tensor::from_vec(vec![2i32, 3, -4], &[3]).unwrap();
    assert_eq!(e.even().unwrap().to_vec::<i32>().unwrap(), vec![1, 0, 1]);
}

#[test]
fn conversion_casts_elementwise() {
    let t = Tensor::from_vec(vec![1.9f64, -2.7, 3.0], &[3]).unwrap();
    let i = t.convert(DataType::I32).unwrap();
    assert_eq!(i.to_vec::<i32>().unwrap(), vec![1, -2, 3]);
    let back = i.convert(DataType::F64).unwrap();
    assert_close(&back.to_vec::<f64>().unwrap(), &[1.0, -2.0, 3.0]);
}

#[test]
fn dropout_identity_outside_training() {
    let t = Tensor::from_vec(vec![1.0f64, 2.0, 3.0, 4.0], &[4]).unwrap();
    let d = t.dropout(0.5, false).unwrap();
    assert_close(&d.to_vec::<f64>().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    let trained = t.dropout(0.5, true).unwrap();
    let values = trained.to_vec::<f64>().unwrap();
    for (orig, v) in t.to_vec::<f64>().unwrap().iter().zip(&values) {
        assert!(*v == 0.0 || (*v - orig * 2.0).abs() < 1e-9);
    }
}

#[test]
fn flatten_dim_merges() {
    let t = Tensor::from_vec((0..24).map(|v| v as f64).collect(), &[2, 3, 4]).unwrap();
    let f = t.flatten_dim(2).unwrap();
    assert_eq!(f.shape(), vec![2, 12]);
    assert_eq!(f.to_vec::<f64>().unwrap(), t.to_vec::<f64>().unwrap());
}

#[test]
fn large_nodes_take_the_parallel_path() {
    // Big enough to clear the inline threshold and split into chunks.
    let n = 1 << 16;
    let a = Tensor::constant(1.5, &[n], DataType::F64).unwrap();
    let b = Tensor::constant(2.5, &[n], DataType::F64).unwrap();
    let c = a.add(&b).unwrap();
    let values = c.to_vec::<f64>().unwrap();
    assert!(values.iter().all(|&v| v == 4.0));
}

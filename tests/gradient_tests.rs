//! Reverse-mode differentiation: finite-difference consistency for every
//! operator with a gradient rule, plus fixed composition scenarios with
//! known closed-form results.

use flint::{FlintResult, GradientContext, Tensor};

fn t64(values: &[f64], shape: &[usize]) -> Tensor {
    Tensor::from_vec(values.to_vec(), shape).unwrap()
}

fn assert_close_eps(got: &[f64], want: &[f64], eps: f64) {
    assert_eq!(got.len(), want.len());
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        assert!(
            (g - w).abs() <= eps * (1.0 + w.abs()),
            "element {i}: got {g}, want {w}"
        );
    }
}

fn assert_close(got: &[f64], want: &[f64]) {
    assert_close_eps(got, want, 1e-9);
}

/// Central-difference check of `d sum(build(x)) / dx` on the given input.
fn finite_diff(
    data: &[f64],
    shape: &[usize],
    build: impl Fn(&Tensor) -> FlintResult<Tensor>,
) {
    let x = t64(data, shape);
    x.watch();
    let grad = {
        let _ctx = GradientContext::new();
        let y = build(&x).unwrap();
        let loss = y.flatten().unwrap().reduce_sum(0).unwrap();
        loss.gradient(&x).unwrap()
    };
    let grad = grad.to_vec::<f64>().unwrap();
    let eval = |d: Vec<f64>| -> f64 {
        let xt = t64(&d, shape);
        let y = build(&xt).unwrap();
        y.flatten()
            .unwrap()
            .reduce_sum(0)
            .unwrap()
            .at::<f64>(&[0])
            .unwrap()
    };
    let h = 1e-5;
    for i in 0..data.len() {
        let mut plus = data.to_vec();
        plus[i] += h;
        let mut minus = data.to_vec();
        minus[i] -= h;
        let fd = (eval(plus) - eval(minus)) / (2.0 * h);
        assert!(
            (grad[i] - fd).abs() <= 1e-5 * (1.0 + fd.abs()),
            "element {i}: engine {}, finite difference {fd}",
            grad[i]
        );
    }
}

#[test]
fn finite_differences_elementwise() {
    let data = [0.7, -1.3, 2.1, 0.4];
    let shape = [2, 2];
    let other = || t64(&[1.5, -0.5, 0.8, 2.0], &shape);
    finite_diff(&data, &shape, |x| x.add(&other()));
    finite_diff(&data, &shape, |x| x.sub(&other()));
    finite_diff(&data, &shape, |x| x.mul(&other()));
    finite_diff(&data, &shape, |x| x.div(&other()));
    finite_diff(&data, &shape, |x| x.neg());
    finite_diff(&data, &shape, |x| x.exp());
    finite_diff(&data, &shape, |x| x.sin());
    finite_diff(&data, &shape, |x| x.cos());
    finite_diff(&data, &shape, |x| x.tan());
    finite_diff(&data, &shape, |x| x.atan());
    finite_diff(&data, &shape, |x| x.abs());
}

#[test]
fn finite_differences_restricted_domains() {
    // Positive inputs for the logarithms and the root.
    let data = [0.7, 1.3, 2.1, 0.4];
    let shape = [4];
    finite_diff(&data, &shape, |x| x.log());
    finite_diff(&data, &shape, |x| x.log2());
    finite_diff(&data, &shape, |x| x.log10());
    finite_diff(&data, &shape, |x| x.sqrt());
    // (-1, 1) for the inverse trigonometrics.
    let data = [0.3, -0.6, 0.1, 0.8];
    finite_diff(&data, &shape, |x| x.asin());
    finite_diff(&data, &shape, |x| x.acos());
    // Positive base for pow with a fractional exponent.
    let data = [0.7, 1.3, 2.1, 0.4];
    finite_diff(&data, &shape, |x| x.pow(&t64(&[2.0, 0.5, 3.0, 1.5], &shape)));
    // Watched exponent.
    let data = [1.1, 0.6, 2.0, 1.7];
    finite_diff(&data, &shape, |x| t64(&[2.0, 3.0, 0.5, 1.2], &shape).pow(x));
}

#[test]
fn finite_differences_min_max() {
    let data = [0.7, -1.3, 2.1, 0.4];
    let shape = [4];
    // No ties, so the subgradient is unambiguous.
    let other = || t64(&[0.5, 0.5, 0.5, 0.5], &shape);
    finite_diff(&data, &shape, |x| x.minimum(&other()));
    finite_diff(&data, &shape, |x| x.maximum(&other()));
    finite_diff(&data, &shape, |x| other().minimum(x));
    finite_diff(&data, &shape, |x| other().maximum(x));
}

#[test]
fn finite_differences_structure() {
    let data: Vec<f64> = vec![0.3, 1.2, -0.7, 2.2, 0.1, -1.1];
    finite_diff(&data, &[2, 3], |x| x.flatten());
    finite_diff(&data, &[2, 3], |x| x.reshape(&[3, 2]));
    finite_diff(&data, &[2, 3], |x| x.transpose(&[1, 0]));
    finite_diff(&data, &[2, 3], |x| x.repeat(&[1, 1]));
    finite_diff(&data, &[2, 3], |x| x.slice(&[0, 2], &[2, 0], &[1, -1]));
    finite_diff(&data, &[2, 3], |x| x.extend(&[4, 5], &[1, 2]));
    finite_diff(&data, &[2, 3], |x| {
        x.concat(&t64(&[1.0, 2.0, 3.0], &[1, 3]), 0)
    });
    finite_diff(&data, &[2, 3], |x| x.flatten_dim(1));
    finite_diff(&data, &[2, 3], |x| x.convert(flint::DataType::F64));
}

#[test]
fn finite_differences_reductions() {
    let data = [0.5, 3.0, -1.0, 0.25, 2.5, 1.0];
    finite_diff(&data, &[2, 3], |x| x.reduce_sum(1));
    finite_diff(&data, &[2, 3], |x| x.reduce_mul(0));
    finite_diff(&data, &[2, 3], |x| x.reduce_min(1));
    finite_diff(&data, &[2, 3], |x| x.reduce_max(0));
}

#[test]
fn finite_differences_matmul() {
    let data = [0.3, 1.2, -0.7, 2.2, 0.1, -1.1];
    let w = || t64(&[1.0, -2.0, 0.5, 0.7, 1.5, -0.3], &[3, 2]);
    finite_diff(&data, &[2, 3], |x| x.matmul(&w()));
    finite_diff(&data, &[3, 2], |x| w().transpose(&[1, 0]).unwrap().matmul(x));
}

#[test]
fn finite_differences_indexing() {
    let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let idx = || Tensor::from_vec(vec![2i32, 0, 2], &[3]).unwrap();
    finite_diff(&data, &[3, 2], |x| x.index(&idx()));
    let upd = || t64(&[0.5, -0.5, 1.5, 2.5, 3.5, -1.5], &[3, 2]);
    finite_diff(&data, &[3, 2], |x| x.set_index(&upd(), &idx()));
    // Watched updates.
    finite_diff(&data, &[3, 2], |x| {
        t64(&[9.0, 8.0, 7.0, 6.0, 5.0, 4.0], &[3, 2]).set_index(x, &idx())
    });
}

#[test]
fn finite_differences_windows() {
    let data: Vec<f64> = (0..16).map(|v| (v as f64) * 0.3 - 2.0).collect();
    finite_diff(&data, &[4, 4], |x| x.sliding_window(&[2, 2], &[1, 2]));
    finite_diff(&data, &[4, 4], |x| {
        x.sliding_window(&[3, 2], &[1, 1]).unwrap().unslide_window(&[4, 4], &[1, 1])
    });
    finite_diff(&data, &[4, 4], |x| x.pooling_sum(&[2], &[1]));
    finite_diff(&data, &[4, 4], |x| x.pooling_max(&[2], &[2]));
}

#[test]
fn finite_differences_convolution() {
    let image: Vec<f64> = (0..18).map(|v| (v as f64) * 0.25 - 2.0).collect();
    let kernel = [1.0, -1.0, 0.5, 2.0, 0.3, -0.7, 1.1, 0.9];
    finite_diff(&image, &[3, 3, 2], |x| {
        x.convolve(&t64(&kernel, &[2, 2, 2]), &[1, 1])
    });
    // Watched kernel.
    finite_diff(&kernel, &[2, 2, 2], |k| {
        t64(&image, &[3, 3, 2]).convolve(k, &[2, 1])
    });
}

#[test]
fn finite_differences_dropout() {
    // The mask is a deterministic function of the stored seed, so the
    // perturbed evaluations see the same mask only when the node is
    // shared; rebuild with a fixed probability of zero instead.
    let data = [1.0, -2.0, 3.0, -4.0];
    finite_diff(&data, &[4], |x| x.dropout(0.0, true));
    finite_diff(&data, &[4], |x| x.dropout(0.5, false));
}

#[test]
fn two_times_matmul() {
    let x = t64(&[1.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0], &[2, 2, 2]);
    let y = t64(&[3.0, -7.0, -1.0, 5.0], &[2, 2]);
    let z = t64(&[1.0, 1.0, 2.0, 2.0, 3.0, 3.0, -1.0, -1.0], &[2, 2, 2]);
    x.watch();
    y.watch();
    z.watch();
    let _ctx = GradientContext::new();
    let w = x.matmul(&y).unwrap().matmul(&z).unwrap();
    let dx = w.gradient(&x).unwrap();
    assert_close(
        &dx.to_vec::<f64>().unwrap(),
        &[-22.0, 18.0, -22.0, 18.0, 32.0, -16.0, 32.0, -16.0],
    );
    let dy = w.gradient(&y).unwrap();
    assert_close(&dy.to_vec::<f64>().unwrap(), &[66.0, -8.0, 80.0, -8.0]);
    let dz = w.gradient(&z).unwrap();
    assert_close(
        &dz.to_vec::<f64>().unwrap(),
        &[5.0, 5.0, -1.0, -1.0, 18.0, 18.0, -10.0, -10.0],
    );

    // The variable appearing on both sides of the product accumulates
    // both paths.
    let zy = z.matmul(&y).unwrap();
    let w = x.matmul(&y).unwrap().matmul(&zy).unwrap();
    let dy = w.gradient(&y).unwrap();
    assert_close(&dy.to_vec::<f64>().unwrap(), &[67.0, 67.0, 67.0, 67.0]);
    let dx = w.gradient(&x).unwrap();
    let dx = dx.to_vec::<f64>().unwrap();
    assert_eq!(dx[0], 0.0);
    assert_eq!(dx[7], 0.0);
    let dz = w.gradient(&z).unwrap();
    assert_close(
        &dz.to_vec::<f64>().unwrap(),
        &[-20.0, 20.0, 4.0, -4.0, -72.0, 72.0, 40.0, -40.0],
    );
}

#[test]
fn add_mul_matmul() {
    let x = t64(&[1.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0], &[2, 2, 2]);
    let y = t64(&[5.0, -7.0], &[2]);
    let z = t64(&[4.0, 3.0, 2.5, 1.5], &[2, 2]);
    x.watch();
    y.watch();
    z.watch();
    let _ctx = GradientContext::new();
    let y_z = z.mul(&y).unwrap();
    let w = x
        .add(&y)
        .unwrap()
        .matmul(&y_z)
        .unwrap()
        .mul(&x.add(&z).unwrap())
        .unwrap();
    let dx = w.gradient(&x).unwrap();
    assert_close(
        &dx.to_vec::<f64>().unwrap(),
        &[61.0, -42.5, 85.5, -96.0, 147.0, -152.0, 211.5, -214.0],
    );
    let dy = w.gradient(&y).unwrap();
    assert_close(&dy.to_vec::<f64>().unwrap(), &[743.0, 638.5]);
    let dz = w.gradient(&z).unwrap();
    assert_close(&dz.to_vec::<f64>().unwrap(), &[1335.0, -1778.0, -10.0, 70.0]);
}

#[test]
fn sub_mul_div() {
    let x = t64(&[1.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0], &[2, 2, 2]);
    let y = t64(&[5.0, -7.0], &[2]);
    let z = t64(&[4.0, 3.0, 2.5, 1.5], &[2, 2]);
    x.watch();
    y.watch();
    z.watch();
    let _ctx = GradientContext::new();
    let w = x
        .sub(&y)
        .unwrap()
        .div(&z.mul(&y).unwrap())
        .unwrap()
        .mul(&x.sub(&z).unwrap())
        .unwrap()
        .sub(&z.mul(&y).unwrap())
        .unwrap();
    let dx = w.gradient(&x).unwrap().to_vec::<f64>().unwrap();
    assert_close_eps(&[dx[0], dx[2], dx[4], dx[7]], &[-0.35, -0.28, -0.05, -1.8571429], 1e-3);
    let dy = w.gradient(&y).unwrap().to_vec::<f64>().unwrap();
    assert_close_eps(&dy, &[-13.29, -9.639456], 1e-3);
    let dz = w.gradient(&z).unwrap().to_vec::<f64>().unwrap();
    assert_close_eps(&dz, &[-9.9, 15.079366, -10.0, 22.126986], 1e-3);
}

#[test]
fn pow_neg_log() {
    let x = t64(
        &[42.0, 75.3, 4.0, 4.0, 50.0, 3.0, 7.0, 9.0, 3.5, 77.0, 10.0, 10.0],
        &[2, 3, 2],
    );
    let y = t64(&[-7.0, 5.5], &[2]);
    let z = t64(&[1.5, 2.5, 3.5, 4.5, 7.5, 9.0], &[3, 2]);
    x.watch();
    y.watch();
    z.watch();
    let _ctx = GradientContext::new();
    let w = x.pow(&y).unwrap().log().unwrap();
    let dx = w.gradient(&x).unwrap().to_vec::<f64>().unwrap();
    assert_close_eps(
        &[dx[0], dx[1], dx[2], dx[5], dx[6], dx[9], dx[11]],
        &[-0.1666666, 0.07304117, -1.75, 1.833333, -1.0, 0.071428, 0.55],
        1e-3,
    );
    let dy = w.gradient(&y).unwrap().to_vec::<f64>().unwrap();
    assert_close_eps(&dy, &[14.537247, 15.650002], 1e-3);

    let n = x
        .log10()
        .unwrap()
        .mul(&z.log2().unwrap().add_scalar(3.0).unwrap())
        .unwrap();
    let dz = n.gradient(&z).unwrap().to_vec::<f64>().unwrap();
    assert_close_eps(
        &dz,
        &[2.374048, 1.633729, 0.472432, 0.797826, 0.519172, 0.236782],
        1e-3,
    );
    let dx = n.gradient(&x).unwrap().to_vec::<f64>().unwrap();
    assert_close_eps(
        &[dx[0], dx[1], dx[2], dx[5], dx[6], dx[9], dx[10]],
        &[0.037069, 0.024927, 0.521952, 0.893188, 0.222419, 0.029159, 0.256533],
        1e-3,
    );
}

#[test]
fn pow_with_integer_exponent_masks_negative_bases() {
    let t = t64(
        &[
            -0.5, 3.0, 1.5, -1.0, -3.0, -2.5, 1.5, 2.5, -42.0, -75.3, 4.0, -4.0,
        ],
        &[1, 3, 2, 2],
    );
    let r = Tensor::from_vec(vec![2i32, 3, 4, 5], &[2, 2]).unwrap();
    t.watch();
    r.watch();
    let _ctx = GradientContext::new();
    let e = t.pow(&r.add_scalar(1.0).unwrap()).unwrap();
    let dt = e.gradient(&t).unwrap().to_vec::<f64>().unwrap();
    assert_close_eps(
        &[dt[0], dt[1], dt[3], dt[6], dt[7], dt[9], dt[10]],
        &[0.75, 108.0, -6.0, 25.312498, 585.93744, -1707830.5, 1280.0],
        1e-2,
    );
    let dr = e.gradient(&r).unwrap().to_vec::<f64>().unwrap();
    assert_eq!(dr[0], 0.0);
    assert_close_eps(&dr[1..], &[88.987595, 1425.7234, 223.70378], 1e-2);
}

#[test]
fn min_max_abs() {
    let x = t64(
        &[42.0, 75.3, 4.0, 4.0, 50.0, 3.0, 7.0, 9.0, 3.5, 77.0, 10.0, 10.0],
        &[2, 3, 2],
    );
    let y = t64(&[-7.0, 5.5], &[2]);
    let z = t64(&[1.5, 5.5, -7.0, 4.5, 7.5, -9.0], &[3, 2]);
    x.watch();
    y.watch();
    z.watch();
    let _ctx = GradientContext::new();
    let m1 = z.minimum(&y).unwrap().mul_scalar(0.3).unwrap().abs().unwrap();
    let dy1 = m1.gradient(&y).unwrap().to_vec::<f64>().unwrap();
    assert_close(&dy1, &[-0.6, 0.0]);
    let dz1 = m1.gradient(&z).unwrap().to_vec::<f64>().unwrap();
    assert_close(&dz1, &[0.0, 0.3, -0.3, 0.3, 0.0, -0.3]);

    let m2 = y
        .minimum(&z)
        .unwrap()
        .mul_scalar(0.3)
        .unwrap()
        .maximum(&x)
        .unwrap()
        .abs()
        .unwrap()
        .mul(&y.abs().unwrap())
        .unwrap();
    let dx2 = m2.gradient(&x).unwrap().to_vec::<f64>().unwrap();
    for j in 0..6 {
        assert_eq!(dx2[2 * j], 7.0);
        assert_eq!(dx2[2 * j + 1], 5.5);
    }
    let dy2 = m2.gradient(&y).unwrap().to_vec::<f64>().unwrap();
    assert_close(&dy2, &[-116.5, 178.3]);
    let dz2 = m2.gradient(&z).unwrap().to_vec::<f64>().unwrap();
    assert_close(&dz2, &[0.0; 6]);
}

#[test]
fn reduce_gradients() {
    let a = t64(&[0.0, 3.0, -1.0, 0.5, 2.5, 1.0], &[2, 3]);
    a.watch();
    {
        let _ctx = GradientContext::new();
        let b = a.reduce_sum(1).unwrap().mul_scalar(2.0).unwrap();
        let da = b.gradient(&a).unwrap().to_vec::<f64>().unwrap();
        assert_close(&da, &[2.0; 6]);
    }

    let x = t64(
        &[42.0, 75.3, 4.0, 4.0, 50.0, 3.0, 7.0, 9.0, 3.5, 77.0, 10.0, 10.0],
        &[2, 3, 2],
    );
    x.watch();
    {
        let _ctx = GradientContext::new();
        let w = x
            .reduce_sum(2)
            .unwrap()
            .mul(&a)
            .unwrap()
            .reduce_sum(0)
            .unwrap();
        let da = w.gradient(&a).unwrap().to_vec::<f64>().unwrap();
        assert_close(&da, &[117.3, 8.0, 53.0, 16.0, 80.5, 20.0]);
        let dx = w.gradient(&x).unwrap().to_vec::<f64>().unwrap();
        assert_close(
            &dx,
            &[0.0, 0.0, 3.0, 3.0, -1.0, -1.0, 0.5, 0.5, 2.5, 2.5, 1.0, 1.0],
        );
    }
    {
        let _ctx = GradientContext::new();
        let t = x
            .reduce_mul(2)
            .unwrap()
            .mul(&a)
            .unwrap()
            .add_scalar(3.0)
            .unwrap()
            .mul(&a.reduce_mul(0).unwrap())
            .unwrap();
        let da = t.gradient(&a).unwrap().to_vec::<f64>().unwrap();
        assert_close_eps(
            &[da[0], da[2], da[3], da[4], da[5]],
            &[18.75, -194.0, 0.0, 4204.5, -56.0],
            1e-6,
        );
        let dx = t.gradient(&x).unwrap().to_vec::<f64>().unwrap();
        assert_close_eps(
            &dx,
            &[
                0.0, 0.0, 90.0, 90.0, 3.0, 50.0, 0.0, 0.0, 1443.75, 65.625, -10.0, -10.0,
            ],
            1e-6,
        );
    }
}

#[test]
fn repeat_slice_transpose_gradients() {
    let t = t64(
        &[
            0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0,
            7.0, 8.0, 9.0,
        ],
        &[5, 4],
    );
    t.watch();
    {
        let _ctx = GradientContext::new();
        let weights = t64(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], &[4, 2]);
        let r = t
            .slice(&[0, -1], &[4, -5], &[2, -1])
            .unwrap()
            .transpose(&[1, 0])
            .unwrap()
            .mul(&weights)
            .unwrap();
        let gr = r.gradient(&t).unwrap().to_vec::<f64>().unwrap();
        let mut want = vec![0.0; 20];
        // Row 0 and row 2 were selected with the columns reversed, then
        // transposed against the weight grid.
        want[0] = 7.0;
        want[1] = 5.0;
        want[2] = 3.0;
        want[3] = 1.0;
        want[8] = 8.0;
        want[9] = 6.0;
        want[10] = 4.0;
        want[11] = 2.0;
        assert_close(&gr, &want);
    }
    {
        let _ctx = GradientContext::new();
        let scale = t64(&[1.0, 2.0, 3.0, 4.0], &[4]);
        let g = t
            .slice(&[-1, 0], &[-2, 4], &[-1, 1])
            .unwrap()
            .repeat(&[1, 0])
            .unwrap()
            .mul(&scale)
            .unwrap();
        let gr = g.gradient(&t).unwrap().to_vec::<f64>().unwrap();
        let mut want = vec![0.0; 20];
        for i in 0..4 {
            want[16 + i] = (i + 1) as f64 * 2.0;
        }
        assert_close(&gr, &want);
    }
}

#[test]
fn sqrt_of_scaled_integers() {
    let y = Tensor::from_vec(vec![9i64, 7, 13], &[3]).unwrap();
    y.watch();
    let _ctx = GradientContext::new();
    let z = y.mul_scalar(0.5).unwrap().sqrt().unwrap();
    let dy = z.gradient(&y).unwrap().to_vec::<f64>().unwrap();
    assert_close_eps(&dy, &[0.11785114, 0.13363062, 0.09805807], 1e-6);
}

#[test]
fn trigonometric_chain() {
    let x = Tensor::from_vec(vec![0i32, 1, -2, 2, -3, 4], &[2, 3]).unwrap();
    let y = Tensor::from_vec(vec![-9i64, 7, 13], &[3]).unwrap();
    x.watch();
    y.watch();
    let _ctx = GradientContext::new();
    let z1 = x.sin().unwrap().mul(&y.cos().unwrap()).unwrap().tan().unwrap();
    let dx = z1.gradient(&x).unwrap().to_vec::<f64>().unwrap();
    assert_close_eps(
        &dx,
        &[-0.91113025, 0.6279001, -0.8204005, 0.8297475, -0.7548697, -0.99188167],
        1e-3,
    );
    let dy = z1.gradient(&y).unwrap().to_vec::<f64>().unwrap();
    assert_close_eps(&dy, &[0.8200625, -0.75841457, 1.3617588], 1e-3);
}

#[test]
fn convolution_gradients() {
    let x = Tensor::from_vec(
        vec![
            0i32, 1, 2, 1, 2, 3, 2, 3, 4, //
            3, 4, 5, 6, 7, 8, 9, 0, -1, //
            -2, -3, -4, -5, -6, -7, -8, -9, 0, //
            1, 2, 3, 4, 5, 6, 7, 8, 9,
        ],
        &[4, 3, 3],
    )
    .unwrap();
    let k = Tensor::from_vec(
        vec![1i32, 1, 1, 2, 2, 2, -3, -3, -3, 1, 1, 1],
        &[2, 2, 3],
    )
    .unwrap();
    x.watch();
    k.watch();
    let _ctx = GradientContext::new();
    let y = x.convolve(&k, &[1, 2]).unwrap();
    let dk = y.gradient(&k).unwrap().to_vec::<f64>().unwrap();
    assert_close(
        &dk,
        &[12.0, 6.0, 18.0, 6.0, 8.0, 10.0, 10.0, 2.0, 12.0, 5.0, 6.0, 7.0],
    );
    let dx = y.gradient(&x).unwrap();
    let dxv = dx.to_vec::<f64>().unwrap();
    let first_of_row = |r: usize, c: usize| dxv[(r * 3 + c) * 3];
    assert_eq!(first_of_row(0, 0), 1.0);
    assert_eq!(first_of_row(0, 1), 2.0);
    assert_eq!(first_of_row(0, 2), 1.0);
    assert_eq!(first_of_row(1, 0), -2.0);
    assert_eq!(first_of_row(1, 1), 3.0);
    assert_eq!(first_of_row(1, 2), -2.0);
    assert_eq!(first_of_row(3, 0), -2.0);
    assert_eq!(first_of_row(3, 1), 3.0);
    assert_eq!(first_of_row(3, 2), -2.0);
    // The contracted dimension shares one gradient value.
    for r in 0..4 {
        for c in 0..3 {
            let base = (r * 3 + c) * 3;
            assert_eq!(dxv[base], dxv[base + 1]);
            assert_eq!(dxv[base + 1], dxv[base + 2]);
        }
    }
}

#[test]
fn convolution_gradient_over_constant_image() {
    let a = Tensor::constant(1.0, &[6, 6, 1], flint::DataType::F64).unwrap();
    let b = t64(&[1.0, -1.0, 2.0, 2.0, 2.0, 3.0, -1.0, 4.0], &[2, 4, 1]);
    a.watch();
    let _ctx = GradientContext::new();
    let c = a.convolve(&b, &[5, 2]).unwrap();
    let da = c.gradient(&a).unwrap().to_vec::<f64>().unwrap();
    let at = |r: usize, c: usize| da[(r * 6 + c)];
    assert_eq!(at(0, 0), 1.0);
    assert_eq!(at(0, 1), -1.0);
    assert_eq!(at(0, 2), 3.0);
    assert_eq!(at(0, 3), 1.0);
    assert_eq!(at(0, 4), 3.0);
    assert_eq!(at(0, 5), 1.0);
    assert_eq!(at(1, 0), 2.0);
    assert_eq!(at(1, 1), 3.0);
    assert_eq!(at(1, 2), 1.0);
    assert_eq!(at(1, 3), 7.0);
    assert_eq!(at(1, 4), 1.0);
}

#[test]
fn pooling_max_routes_to_the_first_maximum() {
    let t = t64(&[1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0], &[4, 2]);
    t.watch();
    let _ctx = GradientContext::new();
    let p = t.pooling_max(&[2], &[1]).unwrap();
    let g = p.gradient(&t).unwrap().to_vec::<f64>().unwrap();
    assert_close(&g, &[0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
}

#[test]
fn matmul_difference_scenario() {
    // y = sum((x - c) . c^2) with x watched.
    let c = t64(&[0.5, 1.5, -1.0, 2.0], &[2, 2]);
    let data = [1.0, 2.0, 3.0, 4.0];
    finite_diff(&data, &[2, 2], |x| {
        x.sub(&c).unwrap().matmul(&c.mul(&c).unwrap())
    });
}

#[test]
fn gradients_share_one_backward_pass() {
    let x = t64(&[1.0, 2.0], &[2]);
    let y = t64(&[3.0, 4.0], &[2]);
    x.watch();
    y.watch();
    let _ctx = GradientContext::new();
    let w = x.mul(&y).unwrap().reduce_sum(0).unwrap();
    let grads = w.gradients(&[&x, &y]).unwrap();
    assert_close(&grads[0].to_vec::<f64>().unwrap(), &[3.0, 4.0]);
    assert_close(&grads[1].to_vec::<f64>().unwrap(), &[1.0, 2.0]);
}

#[test]
fn underivable_operations_raise() {
    let x = t64(&[1.0, -2.0], &[2]);
    x.watch();
    let _ctx = GradientContext::new();
    let s = x.sign().unwrap();
    let y = s.mul_scalar(2.0).unwrap();
    let err = y.gradient(&x).unwrap_err();
    assert_eq!(err.kind(), flint::ErrorKind::IllegalDerive);
}

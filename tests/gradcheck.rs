//! Finite-difference checks of the analytic gradients.
//!
//! Both convolution variants are linear in each of their differentiable
//! inputs, so a central difference agrees with the analytic gradient up to
//! f32 rounding; the tolerance below is far above that noise floor.

use flexconv::backprop::{flex_convolution, flex_convolution_transpose};
use flexconv::neighborhood::knn_bruteforce;
use flexconv::tensors::{Ten32, Tensor, WithGrad};
use rand::{Rng, SeedableRng, rngs::StdRng};

const EPS: f32 = 1e-2;
const TOL: f64 = 1e-3;

fn rand_tensor(rng: &mut StdRng, shape: Vec<usize>) -> Ten32 {
    let len = shape.iter().product();
    Tensor::new(shape, (0..len).map(|_| rng.random_range(-1.0..1.0)).collect())
}

/// Scalar probe `L = Σ out ⊙ r`, accumulated in f64 to keep the finite
/// difference itself out of the noise.
fn probe_loss(out: &Ten32, r: &Ten32) -> f64 {
    out.data
        .iter()
        .zip(&r.data)
        .map(|(&o, &w)| f64::from(o) * f64::from(w))
        .sum()
}

struct ConvCase {
    features: Ten32,
    theta: Ten32,
    bias: Ten32,
    neighborhood: Tensor<u32>,
    positions: Ten32,
    probe: Ten32,
}

fn make_case(seed: u64) -> ConvCase {
    let (b, din, dout, dp, n, k) = (2, 2, 2, 3, 5, 3);
    let mut rng = StdRng::seed_from_u64(seed);
    let positions = rand_tensor(&mut rng, vec![b, dp, n]);
    let neighborhood = knn_bruteforce(&positions, k).unwrap();
    ConvCase {
        features: rand_tensor(&mut rng, vec![b, din, n]),
        theta: rand_tensor(&mut rng, vec![dp, din, dout]),
        bias: rand_tensor(&mut rng, vec![din, dout]),
        neighborhood,
        positions,
        probe: rand_tensor(&mut rng, vec![b, dout, n]),
    }
}

type ConvOp = fn(
    &WithGrad<Ten32>,
    &WithGrad<Ten32>,
    &WithGrad<Ten32>,
    &Tensor<u32>,
    &Ten32,
) -> Result<(Ten32, Box<flexconv::ops::dispatch::ConvBack>), flexconv::backprop::OpError>;

fn case_loss(case: &ConvCase, op: ConvOp) -> f64 {
    let (out, _) = op(
        &WithGrad::new(case.features.clone()),
        &WithGrad::new(case.theta.clone()),
        &WithGrad::new(case.bias.clone()),
        &case.neighborhood,
        &case.positions,
    )
    .unwrap();
    probe_loss(&out, &case.probe)
}

fn assert_close(analytic: f32, numeric: f64, input: &str, idx: usize) {
    let analytic = f64::from(analytic);
    let err = (analytic - numeric).abs();
    assert!(
        err <= TOL * analytic.abs().max(1.0),
        "{input}[{idx}]: analytic {analytic} vs numeric {numeric}"
    );
}

fn gradcheck_op(op: ConvOp, seed: u64) {
    let case = make_case(seed);
    let (_, back) = op(
        &WithGrad::new(case.features.clone()),
        &WithGrad::new(case.theta.clone()),
        &WithGrad::new(case.bias.clone()),
        &case.neighborhood,
        &case.positions,
    )
    .unwrap();
    let (grad_f, grad_theta, grad_bias) = back(&case.probe);

    for idx in 0..case.features.data.len() {
        let mut plus = make_case(seed);
        plus.features.data[idx] += EPS;
        let mut minus = make_case(seed);
        minus.features.data[idx] -= EPS;
        let numeric = (case_loss(&plus, op) - case_loss(&minus, op)) / (2.0 * f64::from(EPS));
        assert_close(grad_f.data[idx], numeric, "features", idx);
    }

    for idx in 0..case.theta.data.len() {
        let mut plus = make_case(seed);
        plus.theta.data[idx] += EPS;
        let mut minus = make_case(seed);
        minus.theta.data[idx] -= EPS;
        let numeric = (case_loss(&plus, op) - case_loss(&minus, op)) / (2.0 * f64::from(EPS));
        assert_close(grad_theta.data[idx], numeric, "theta", idx);
    }

    for idx in 0..case.bias.data.len() {
        let mut plus = make_case(seed);
        plus.bias.data[idx] += EPS;
        let mut minus = make_case(seed);
        minus.bias.data[idx] -= EPS;
        let numeric = (case_loss(&plus, op) - case_loss(&minus, op)) / (2.0 * f64::from(EPS));
        assert_close(grad_bias.data[idx], numeric, "bias", idx);
    }
}

#[test]
fn test_flex_conv_matches_finite_differences() {
    gradcheck_op(flex_convolution, 7);
}

#[test]
fn test_flex_deconv_matches_finite_differences() {
    gradcheck_op(flex_convolution_transpose, 11);
}

/// The pooling backward must route exactly one gradient per output cell to
/// its recorded argmax source; re-derive the expected scatter from the
/// argmax tensor itself.
#[test]
fn test_flex_pool_backward_routes_to_argmax() {
    let (b, din, n, k) = (2, 3, 6, 4);
    let mut rng = StdRng::seed_from_u64(13);
    let positions = rand_tensor(&mut rng, vec![b, 2, n]);
    let neighborhood = knn_bruteforce(&positions, k).unwrap();
    let features = WithGrad::new(rand_tensor(&mut rng, vec![b, din, n]));
    let topdiff = rand_tensor(&mut rng, vec![b, din, n]);

    let (out, argmax, back) = flexconv::backprop::flex_pooling(&features, &neighborhood).unwrap();

    // the recorded argmax must reproduce the output value exactly
    for bb in 0..b {
        for d in 0..din {
            for j in 0..n {
                let at = (bb * din + d) * n + j;
                let src = argmax.data[at] as usize;
                assert_eq!(out.data[at], features.value.data[(bb * din + d) * n + src]);
            }
        }
    }

    let grad = back(&topdiff);
    let mut expected = vec![0.0f32; b * din * n];
    for row in 0..b * din {
        for j in 0..n {
            let src = argmax.data[row * n + j] as usize;
            expected[row * n + src] += topdiff.data[row * n + j];
        }
    }
    assert_eq!(grad.data, expected);
}

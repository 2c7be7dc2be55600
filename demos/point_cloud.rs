//! Trains a single flex convolution layer on a toy point-cloud regression:
//! map per-point features to a smoothed target over each neighborhood.
//!
//! Run with `cargo run --example point_cloud`.

use flexconv::backprop::flex_pooling;
use flexconv::layers::{Activation, FlexConvolution};
use flexconv::neighborhood::knn_bruteforce;
use flexconv::tensors::{Ten32, Tensor, WithGrad};
use rand::{Rng, SeedableRng, rngs::StdRng};

const POINTS: usize = 128;
const NEIGHBORS: usize = 8;
const STEPS: usize = 60;
const LR: f32 = 0.05;

fn main() {
    let mut rng = StdRng::seed_from_u64(42);

    // a noisy ring in the plane
    let mut pos = vec![0.0f32; 2 * POINTS];
    for j in 0..POINTS {
        let angle = (j as f32) / (POINTS as f32) * std::f32::consts::TAU;
        pos[j] = angle.cos() + 0.05 * rng.random_range(-1.0..1.0);
        pos[POINTS + j] = angle.sin() + 0.05 * rng.random_range(-1.0..1.0);
    }
    let positions = Tensor::new(vec![1, 2, POINTS], pos);
    let neighborhood = knn_bruteforce(&positions, NEIGHBORS).expect("valid point cloud");

    let feat: Vec<f32> = (0..POINTS).map(|_| rng.random_range(-1.0..1.0)).collect();
    let features = WithGrad::new(Tensor::new(vec![1, 1, POINTS], feat));

    // target: the neighborhood maximum of the input features
    let (target, _, _) = flex_pooling(&features, &neighborhood).expect("valid inputs");

    let mut layer = FlexConvolution::new(2, 1, 1, || rng.random_range(-0.1..0.1))
        .with_activation(Activation::Linear);

    for step in 0..STEPS {
        let (out, back) = layer
            .forward(&features, &positions, &neighborhood)
            .expect("valid inputs");

        let (loss, grad) = mse(&out, &target);
        let grads = back(&grad);
        layer.apply_grads(&grads);
        layer.sgd_step(LR);

        if step % 10 == 0 {
            println!("step {step:>3}  loss {loss:.6}");
        }
    }

    let (out, _) = layer
        .forward(&features, &positions, &neighborhood)
        .expect("valid inputs");
    let (loss, _) = mse(&out, &target);
    println!("final     loss {loss:.6}");
}

/// Mean squared error and its gradient w.r.t. the prediction.
fn mse(prediction: &Ten32, target: &Ten32) -> (f32, Ten32) {
    let n = prediction.data.len() as f32;
    let loss = prediction
        .data
        .iter()
        .zip(&target.data)
        .map(|(&y, &t)| (y - t) * (y - t))
        .sum::<f32>()
        / n;
    let grad = Tensor::new(
        prediction.shape.clone(),
        prediction
            .data
            .iter()
            .zip(&target.data)
            .map(|(&y, &t)| 2.0 * (y - t) / n)
            .collect(),
    );
    (loss, grad)
}

use flexconv::backprop::OpError;
use flexconv::layers::{Activation, FlexConvolution, FlexConvolutionTranspose, FlexPooling};
use flexconv::neighborhood::knn_bruteforce;
use flexconv::tensor;
use flexconv::tensors::{Tensor, WithGrad};

#[test]
fn test_knn_bruteforce_hand_case() {
    // 1-D points at 0, 1, 3, 7; self is always the first neighbor, then
    // ascending distance
    let positions = tensor!([[[0.0, 1.0, 3.0, 7.0]]]);
    let neigh = knn_bruteforce(&positions, 3).unwrap();
    assert_eq!(neigh.shape, vec![1, 3, 4]);
    assert_eq!(
        neigh.data,
        vec![
            0, 1, 2, 3, // k = 0: self
            1, 0, 1, 2, // k = 1: nearest other point
            2, 2, 0, 1, // k = 2
        ]
    );
}

#[test]
fn test_knn_bruteforce_distance_ties_prefer_lower_index() {
    // point 1 sits exactly between points 0 and 2
    let positions = tensor!([[[0.0, 1.0, 2.0]]]);
    let neigh = knn_bruteforce(&positions, 2).unwrap();
    // second neighbor of point 1 is the tied pair's lower index
    assert_eq!(neigh.data[3 + 1], 0);
}

#[test]
fn test_knn_bruteforce_rejects_bad_k() {
    let positions = tensor!([[[0.0, 1.0, 2.0]]]);
    assert_eq!(knn_bruteforce(&positions, 0).unwrap_err(), OpError::EmptyNeighborhood);
    assert!(matches!(
        knn_bruteforce(&positions, 4).unwrap_err(),
        OpError::Dim { what: "neighborhood size", .. }
    ));
}

/// Matches the op-level hand case: with a zero feature bias and linear
/// activation, the layer is exactly the raw op.
#[test]
fn test_conv_layer_matches_raw_op() {
    let mut layer = FlexConvolution::new(1, 1, 1, || 0.5);
    layer.position_bias.value.data[0] = 0.25;

    let features = WithGrad::new(tensor!([[[2.0, 3.0]]]));
    let positions = tensor!([[[0.0, 1.0]]]);
    let neighborhood = Tensor::new(vec![1, 1, 2], vec![1u32, 0]);

    let (out, back) = layer.forward(&features, &positions, &neighborhood).unwrap();
    assert_eq!(out.data, vec![2.25, -0.5]);

    let grads = back(&Tensor::new(vec![1, 1, 2], vec![1.0, 1.0]));
    assert_eq!(grads.features.data, vec![-0.25, 0.75]);
    assert_eq!(grads.theta.data, vec![1.0]);
    assert_eq!(grads.position_bias.data, vec![5.0]);
    assert_eq!(grads.feature_bias.as_ref().unwrap().data, vec![2.0]);
}

/// ReLU zeroes the negative output cell and masks its upstream gradient out
/// of every parameter gradient.
#[test]
fn test_conv_layer_relu_masks_gradients() {
    let mut layer = FlexConvolution::new(1, 1, 1, || 0.5).with_activation(Activation::Relu);
    layer.position_bias.value.data[0] = 0.25;

    let features = WithGrad::new(tensor!([[[2.0, 3.0]]]));
    let positions = tensor!([[[0.0, 1.0]]]);
    let neighborhood = Tensor::new(vec![1, 1, 2], vec![1u32, 0]);

    let (out, back) = layer.forward(&features, &positions, &neighborhood).unwrap();
    assert_eq!(out.data, vec![2.25, 0.0]);

    let grads = back(&Tensor::new(vec![1, 1, 2], vec![1.0, 1.0]));
    // only point 0 (pre-activation 2.25 > 0) contributes
    assert_eq!(grads.features.data, vec![0.0, 0.75]);
    assert_eq!(grads.theta.data, vec![3.0]);
    assert_eq!(grads.position_bias.data, vec![3.0]);
    assert_eq!(grads.feature_bias.as_ref().unwrap().data, vec![1.0]);
}

#[test]
fn test_layer_apply_grads_and_sgd_step() {
    let mut layer = FlexConvolution::new(1, 1, 1, || 0.5);
    layer.position_bias.value.data[0] = 0.25;

    let features = WithGrad::new(tensor!([[[2.0, 3.0]]]));
    let positions = tensor!([[[0.0, 1.0]]]);
    let neighborhood = Tensor::new(vec![1, 1, 2], vec![1u32, 0]);

    let (_, back) = layer.forward(&features, &positions, &neighborhood).unwrap();
    let grads = back(&Tensor::new(vec![1, 1, 2], vec![1.0, 1.0]));

    layer.apply_grads(&grads);
    assert_eq!(layer.theta.grad.data, vec![1.0]);
    assert_eq!(layer.position_bias.grad.data, vec![5.0]);
    assert_eq!(layer.feature_bias.as_ref().unwrap().grad.data, vec![2.0]);

    layer.sgd_step(0.1);
    assert_eq!(layer.theta.value.data, vec![0.4]);
    assert_eq!(layer.theta.grad.data, vec![0.0]);
    assert_eq!(layer.position_bias.value.data, vec![-0.25]);
    assert_eq!(layer.feature_bias.as_ref().unwrap().value.data, vec![-0.2]);
}

#[test]
fn test_transpose_layer_without_feature_bias() {
    let layer = FlexConvolutionTranspose::new(1, 1, 1, || 0.5).without_feature_bias();

    let features = WithGrad::new(tensor!([[[2.0, 3.0]]]));
    let positions = tensor!([[[0.0, 1.0]]]);
    let neighborhood = Tensor::new(vec![1, 1, 2], vec![1u32, 0]);

    let (out, back) = layer.forward(&features, &positions, &neighborhood).unwrap();
    // zero position bias: w = ±0.5, scattered to the neighbor
    assert_eq!(out.data, vec![-1.5, 1.0]);

    let grads = back(&out.zeros_like());
    assert!(grads.feature_bias.is_none());
    assert!(grads.features.data.iter().all(|&g| g == 0.0));
}

#[test]
fn test_pooling_layer_delegates_to_op() {
    let features = WithGrad::new(tensor!([[[5.0, 1.0, 3.0]]]));
    let positions = tensor!([[[0.0, 1.0, 2.0]]]);
    let neighborhood = knn_bruteforce(&positions, 2).unwrap();

    let (out, argmax, _) = FlexPooling.forward(&features, &neighborhood).unwrap();
    assert_eq!(out.data, vec![5.0, 5.0, 3.0]);
    assert_eq!(argmax.data, vec![0, 0, 2]);
}

#[test]
fn test_layer_propagates_op_errors() {
    let layer = FlexConvolution::new(1, 1, 1, || 0.5);
    let features = WithGrad::new(tensor!([[[2.0, 3.0]]]));
    let positions = tensor!([[[0.0, 1.0, 2.0]]]); // three points, features have two
    let neighborhood = Tensor::new(vec![1, 1, 2], vec![1u32, 0]);

    assert!(layer.forward(&features, &positions, &neighborhood).is_err());
}

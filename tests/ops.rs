use flexconv::backprop::{
    OpError, flex_convolution, flex_convolution_transpose, flex_pooling, sgd,
};
use flexconv::tensor;
use flexconv::tensors::{Tensor, WithGrad};

/// Two points on a line, each the other's single neighbor. Every value below
/// is exactly representable in f32, so the asserts are exact.
///
/// Point 0: neighbor 1, delta = +1, w = 0.25 + 0.5 = 0.75, out = 0.75 * 3.
/// Point 1: neighbor 0, delta = -1, w = 0.25 - 0.5 = -0.25, out = -0.25 * 2.
#[test]
fn test_flex_conv_hand_case() {
    let features = WithGrad::new(tensor!([[[2.0, 3.0]]]));
    let theta = WithGrad::new(tensor!([[[0.5]]]));
    let bias = WithGrad::new(tensor!([[0.25]]));
    let neighborhood = Tensor::new(vec![1, 1, 2], vec![1u32, 0]);
    let positions = tensor!([[[0.0, 1.0]]]);

    let (out, back) =
        flex_convolution(&features, &theta, &bias, &neighborhood, &positions).unwrap();
    assert_eq!(out.shape, vec![1, 1, 2]);
    assert_eq!(out.data, vec![2.25, -0.5]);

    let topdiff = Tensor::new(vec![1, 1, 2], vec![1.0, 1.0]);
    let (grad_f, grad_theta, grad_bias) = back(&topdiff);
    assert_eq!(grad_f.data, vec![-0.25, 0.75]);
    assert_eq!(grad_theta.data, vec![1.0]);
    assert_eq!(grad_bias.data, vec![5.0]);
}

/// Same setup as the conv hand case, but scattered: each point sends its own
/// features to its neighbor.
#[test]
fn test_flex_deconv_hand_case() {
    let features = WithGrad::new(tensor!([[[2.0, 3.0]]]));
    let theta = WithGrad::new(tensor!([[[0.5]]]));
    let bias = WithGrad::new(tensor!([[0.25]]));
    let neighborhood = Tensor::new(vec![1, 1, 2], vec![1u32, 0]);
    let positions = tensor!([[[0.0, 1.0]]]);

    let (out, back) =
        flex_convolution_transpose(&features, &theta, &bias, &neighborhood, &positions).unwrap();
    assert_eq!(out.data, vec![-0.75, 1.5]);

    let topdiff = Tensor::new(vec![1, 1, 2], vec![1.0, 1.0]);
    let (grad_f, grad_theta, grad_bias) = back(&topdiff);
    assert_eq!(grad_f.data, vec![0.75, -0.25]);
    assert_eq!(grad_theta.data, vec![-1.0]);
    assert_eq!(grad_bias.data, vec![5.0]);
}

/// Output shape must be a pure function of the input shapes, across K = 1,
/// K = N, and a mixed middle case.
#[test]
fn test_output_shape_combinations() {
    for &(b, din, dout, dp, n, k) in &[
        (1usize, 1usize, 1usize, 1usize, 2usize, 1usize),
        (2, 3, 5, 3, 4, 4), // K == N
        (1, 2, 2, 2, 6, 1), // K == 1
    ] {
        let features = WithGrad::new(Tensor::new(vec![b, din, n], vec![0.5; b * din * n]));
        let theta = WithGrad::new(Tensor::new(vec![dp, din, dout], vec![0.1; dp * din * dout]));
        let bias = WithGrad::new(Tensor::new(vec![din, dout], vec![0.0; din * dout]));
        let neighborhood = Tensor::new(
            vec![b, k, n],
            (0..b * k * n).map(|i| (i % n) as u32).collect(),
        );
        let positions = Tensor::new(vec![b, dp, n], vec![1.0; b * dp * n]);

        let (out, back) =
            flex_convolution(&features, &theta, &bias, &neighborhood, &positions).unwrap();
        assert_eq!(out.shape, vec![b, dout, n]);

        let (grad_f, grad_theta, grad_bias) = back(&out.zeros_like());
        assert_eq!(grad_f.shape, vec![b, din, n]);
        assert_eq!(grad_theta.shape, vec![dp, din, dout]);
        assert_eq!(grad_bias.shape, vec![din, dout]);

        let (out_t, _) =
            flex_convolution_transpose(&features, &theta, &bias, &neighborhood, &positions)
                .unwrap();
        assert_eq!(out_t.shape, vec![b, dout, n]);

        let (pooled, argmax, _) = flex_pooling(&features, &neighborhood).unwrap();
        assert_eq!(pooled.shape, vec![b, din, n]);
        assert_eq!(argmax.shape, vec![b, din, n]);
    }
}

#[test]
fn test_pool_argmax_and_ties() {
    // point 1's neighborhood lists two sources with the same value; the
    // first-encountered one must win
    let features = WithGrad::new(tensor!([[[5.0, 5.0, 1.0]]]));
    let neighborhood = Tensor::new(vec![1, 2, 3], vec![0u32, 1, 2, 2, 0, 0]);
    // per point: {0,2}, {1,0}, {2,0}

    let (out, argmax, back) = flex_pooling(&features, &neighborhood).unwrap();
    assert_eq!(out.data, vec![5.0, 5.0, 5.0]);
    // point 0: 5.0 at index 0 beats 1.0 at index 2
    // point 1: tie between index 1 and index 0, first-encountered is 1
    // point 2: 1.0 at index 2 loses to 5.0 at index 0
    assert_eq!(argmax.data, vec![0, 1, 0]);

    let topdiff = Tensor::new(vec![1, 1, 3], vec![1.0, 2.0, 4.0]);
    let grad = back(&topdiff);
    assert_eq!(grad.data, vec![5.0, 2.0, 0.0]);
}

#[test]
fn test_zero_topdiff_means_zero_grads() {
    let features = WithGrad::new(tensor!([[[2.0, 3.0], [4.0, 5.0]]]));
    let theta = WithGrad::new(Tensor::new(vec![1, 2, 2], vec![0.3, -0.2, 0.1, 0.7]));
    let bias = WithGrad::new(Tensor::new(vec![2, 2], vec![0.5, 0.1, -0.4, 0.2]));
    let neighborhood = Tensor::new(vec![1, 2, 2], vec![0u32, 1, 1, 0]);
    let positions = tensor!([[[0.0, 2.0]]]);

    let zero = Tensor::zeros(vec![1, 2, 2]);

    let (_, back) = flex_convolution(&features, &theta, &bias, &neighborhood, &positions).unwrap();
    let (gf, gt, gb) = back(&zero);
    assert!(gf.data.iter().all(|&x| x == 0.0));
    assert!(gt.data.iter().all(|&x| x == 0.0));
    assert!(gb.data.iter().all(|&x| x == 0.0));

    let (_, back) =
        flex_convolution_transpose(&features, &theta, &bias, &neighborhood, &positions).unwrap();
    let (gf, gt, gb) = back(&zero);
    assert!(gf.data.iter().all(|&x| x == 0.0));
    assert!(gt.data.iter().all(|&x| x == 0.0));
    assert!(gb.data.iter().all(|&x| x == 0.0));

    let (_, _, back) = flex_pooling(&features, &neighborhood).unwrap();
    let gf = back(&zero);
    assert!(gf.data.iter().all(|&x| x == 0.0));
}

#[test]
fn test_precondition_errors() {
    let features = WithGrad::new(tensor!([[[1.0, 2.0]]]));
    let theta = WithGrad::new(tensor!([[[0.5]]]));
    let bias = WithGrad::new(tensor!([[0.0]]));
    let positions = tensor!([[[0.0, 1.0]]]);

    // neighbor index past the point dimension
    let bad_index = Tensor::new(vec![1, 1, 2], vec![0u32, 2]);
    assert_eq!(
        flex_convolution(&features, &theta, &bias, &bad_index, &positions).err().unwrap(),
        OpError::NeighborOutOfRange { index: 2, points: 2 }
    );

    // K == 0 has nothing to reduce over
    let empty = Tensor::new(vec![1, 0, 2], Vec::<u32>::new());
    assert_eq!(
        flex_convolution(&features, &theta, &bias, &empty, &positions).err().unwrap(),
        OpError::EmptyNeighborhood
    );
    assert_eq!(
        flex_pooling(&features, &empty).err().unwrap(),
        OpError::EmptyNeighborhood
    );

    // batch mismatch between features and neighborhood
    let wrong_batch = Tensor::new(vec![2, 1, 2], vec![0u32; 4]);
    assert!(matches!(
        flex_convolution(&features, &theta, &bias, &wrong_batch, &positions).err().unwrap(),
        OpError::Dim { what: "neighborhood batch", .. }
    ));

    // theta disagrees with the feature channel count
    let wide_theta = WithGrad::new(Tensor::new(vec![1, 2, 1], vec![0.5, 0.5]));
    let neighborhood = Tensor::new(vec![1, 1, 2], vec![1u32, 0]);
    assert!(matches!(
        flex_convolution(&features, &wide_theta, &bias, &neighborhood, &positions).err().unwrap(),
        OpError::Dim { what: "theta input channels", .. }
    ));

    // rank violations are caught before any dimension check
    let flat = WithGrad::new(tensor!([1.0, 2.0]));
    assert!(matches!(
        flex_pooling(&flat, &neighborhood).err().unwrap(),
        OpError::Rank { what: "features", .. }
    ));
}

#[test]
fn test_sgd_updates_and_resets() {
    let mut w = WithGrad {
        value: Tensor::new(vec![2], vec![1.0, 2.0]),
        grad: Tensor::new(vec![2], vec![0.1, 0.2]),
    };
    sgd(&mut w, 0.5);
    assert_eq!(w.value.data, vec![0.95, 1.9]);
    assert_eq!(w.grad.data, vec![0.0, 0.0]);
}

use crate::ops::dispatch::{ConvBack, PoolBack};
use crate::tensors::{Ten32, Tensor, WithGrad};

pub fn cuda_flex_conv(
    features: &WithGrad<Ten32>,
    theta: &WithGrad<Ten32>,
    bias: &WithGrad<Ten32>,
    neighborhood: &Tensor<u32>,
    positions: &Ten32,
) -> Option<(Ten32, Box<ConvBack>)> {
    // TODO: implement using `cust` crate
    super::wgpu::wgpu_flex_conv(features, theta, bias, neighborhood, positions) // wgpu fallback
}

pub fn cuda_flex_pool(
    features: &WithGrad<Ten32>,
    neighborhood: &Tensor<u32>,
) -> Option<(Ten32, Tensor<u32>, Box<PoolBack>)> {
    // TODO: implement using `cust` crate
    super::wgpu::wgpu_flex_pool(features, neighborhood) // wgpu fallback
}

use burn::prelude::*;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

/// Bilinear resize of `[B, C, H, W]` to an exact `[height, width]`.
///
/// Top-down paths resize to the lateral feature's size instead of scaling by a
/// fixed factor: a stride-2 conv on an odd input rounds up (15 -> 8), and
/// doubling 8 gives 16, not 15.
pub fn resize_to<B: Backend>(x: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    let [_, _, height, width] = x.dims();
    if [height, width] == size {
        return x;
    }
    interpolate(x, size, InterpolateOptions::new(InterpolateMode::Bilinear))
}

/// Resize `coarse` to the spatial size of `lateral` and add them.
pub fn upsample_add<B: Backend>(coarse: Tensor<B, 4>, lateral: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, height, width] = lateral.dims();
    resize_to(coarse, [height, width]) + lateral
}

#[derive(Module, Debug, Clone)]
pub struct Upsample2d {
    scale_factor: usize,
}

impl Upsample2d {
    pub fn new(scale_factor: usize) -> Self {
        Self { scale_factor }
    }

    /// [B, C, H, W] -> [B, C, H*scale, W*scale]
    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = x.dims();
        resize_to(x, [height * self.scale_factor, width * self.scale_factor])
    }
}

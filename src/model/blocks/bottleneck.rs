use burn::prelude::*;
use burn::tensor::activation;

use crate::model::blocks::ConvBn;

/// Residual bottleneck: 1x1 reduce, 3x3 (strided), 1x1 expand by [`Bottleneck::EXPANSION`].
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    cv1: ConvBn<B>,
    cv2: ConvBn<B>,
    cv3: ConvBn<B>,
    shortcut: Option<ConvBn<B>>,
}

impl<B: Backend> Bottleneck<B> {
    pub const EXPANSION: usize = 4;

    pub fn new(device: &B::Device, in_planes: usize, planes: usize, stride: usize) -> Self {
        let out_planes = planes * Self::EXPANSION;

        // Projection only when the identity cannot be added as-is.
        let shortcut = (stride != 1 || in_planes != out_planes)
            .then(|| ConvBn::linear(device, in_planes, out_planes, 1, stride));

        Self {
            cv1: ConvBn::new(device, in_planes, planes, 1, 1),
            cv2: ConvBn::new(device, planes, planes, 3, stride),
            cv3: ConvBn::linear(device, planes, out_planes, 1, 1),
            shortcut,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.cv1.forward(x.clone());
        let out = self.cv2.forward(out);
        let out = self.cv3.forward(out);

        let identity = match &self.shortcut {
            Some(proj) => proj.forward(x),
            None => x,
        };

        activation::relu(out + identity)
    }
}

/// Stack of bottlenecks where only the first block strides.
pub fn make_stage<B: Backend>(
    device: &B::Device,
    in_planes: usize,
    planes: usize,
    blocks: usize,
    stride: usize,
) -> Vec<Bottleneck<B>> {
    let mut stage = Vec::with_capacity(blocks);
    let mut in_planes = in_planes;
    for i in 0..blocks {
        let stride = if i == 0 { stride } else { 1 };
        stage.push(Bottleneck::new(device, in_planes, planes, stride));
        in_planes = planes * Bottleneck::<B>::EXPANSION;
    }
    stage
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn strided_block_projects_and_halves() {
        let device = Default::default();
        let block = Bottleneck::<TestBackend>::new(&device, 16, 8, 2);
        let y = block.forward(Tensor::ones([1, 16, 10, 10], &device));
        assert_eq!(y.dims(), [1, 32, 5, 5]);
    }

    #[test]
    fn output_is_non_negative() {
        let device = Default::default();
        let block = Bottleneck::<TestBackend>::new(&device, 32, 8, 1);
        let x = Tensor::<TestBackend, 4>::random(
            [2, 32, 6, 6],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let min = block.forward(x).min().into_scalar().elem::<f32>();
        assert!(min >= 0.0);
    }

    #[test]
    fn stage_stacks_blocks() {
        let device = Default::default();
        let stage = make_stage::<TestBackend>(&device, 8, 4, 3, 2);
        assert_eq!(stage.len(), 3);
        let mut x = Tensor::<TestBackend, 4>::zeros([1, 8, 8, 8], &device);
        for block in &stage {
            x = block.forward(x);
        }
        assert_eq!(x.dims(), [1, 16, 4, 4]);
    }
}

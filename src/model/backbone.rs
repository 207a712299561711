use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::tensor::activation;

use crate::config::BackboneConfig;
use crate::model::blocks::{make_stage, upsample_add, Bottleneck, ConvBn};

/// Bottom-up residual stack: stem, max pool, four bottleneck stages.
#[derive(Module, Debug)]
pub struct ResNetBody<B: Backend> {
    stem: ConvBn<B>,
    pool: MaxPool2d,
    layer1: Vec<Bottleneck<B>>,
    layer2: Vec<Bottleneck<B>>,
    layer3: Vec<Bottleneck<B>>,
    layer4: Vec<Bottleneck<B>>,
}

/// Feature maps from one pass of [`ResNetBody`].
#[derive(Debug, Clone)]
pub struct BodyFeatures<B: Backend> {
    /// Stem output at stride 2.
    pub c1: Tensor<B, 4>,
    /// Stage outputs at strides 4, 8, 16, 32.
    pub stages: [Tensor<B, 4>; 4],
}

impl<B: Backend> ResNetBody<B> {
    pub fn new(device: &B::Device, base_width: usize, blocks: [usize; 4]) -> Self {
        let widths = Self::stage_widths(base_width);
        let expansion = Bottleneck::<B>::EXPANSION;

        Self {
            stem: ConvBn::new(device, 3, base_width, 7, 2),
            pool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            layer1: make_stage(device, base_width, widths[0], blocks[0], 1),
            layer2: make_stage(device, widths[0] * expansion, widths[1], blocks[1], 2),
            layer3: make_stage(device, widths[1] * expansion, widths[2], blocks[2], 2),
            layer4: make_stage(device, widths[2] * expansion, widths[3], blocks[3], 2),
        }
    }

    fn stage_widths(base_width: usize) -> [usize; 4] {
        [base_width, base_width * 2, base_width * 4, base_width * 8]
    }

    /// Output channels of the stem followed by the four stages.
    pub fn channels(base_width: usize) -> [usize; 5] {
        let w = Self::stage_widths(base_width);
        let e = Bottleneck::<B>::EXPANSION;
        [base_width, w[0] * e, w[1] * e, w[2] * e, w[3] * e]
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> BodyFeatures<B> {
        let c1 = self.stem.forward(x);
        let x = self.pool.forward(c1.clone());

        let c2 = run_stage(&self.layer1, x);
        let c3 = run_stage(&self.layer2, c2.clone());
        let c4 = run_stage(&self.layer3, c3.clone());
        let c5 = run_stage(&self.layer4, c4.clone());

        BodyFeatures {
            c1,
            stages: [c2, c3, c4, c5],
        }
    }
}

fn run_stage<B: Backend>(stage: &[Bottleneck<B>], x: Tensor<B, 4>) -> Tensor<B, 4> {
    stage.iter().fold(x, |x, block| block.forward(x))
}

/// Feature pyramid network producing P3..P7.
#[derive(Module, Debug)]
pub struct Fpn<B: Backend> {
    body: ResNetBody<B>,

    // Extra coarse levels
    conv6: Conv2d<B>,
    conv7: Conv2d<B>,

    // Lateral 1x1 projections of C5, C4, C3
    lat5: Conv2d<B>,
    lat4: Conv2d<B>,
    lat3: Conv2d<B>,

    // 3x3 smoothing after each top-down merge
    smooth4: Conv2d<B>,
    smooth3: Conv2d<B>,

    out_channels: usize,
}

impl<B: Backend> Fpn<B> {
    pub fn new(device: &B::Device, config: &BackboneConfig) -> Self {
        let [_, _, c3, c4, c5] = ResNetBody::<B>::channels(config.base_width);
        let out = config.fpn_channels;

        log::info!("Fpn init:");
        log::info!("  blocks = {:?}, base_width = {}", config.blocks, config.base_width);
        log::info!("  C3/C4/C5 channels = {}/{}/{} -> {}", c3, c4, c5, out);

        Self {
            body: ResNetBody::new(device, config.base_width, config.blocks),
            conv6: conv(device, c5, out, 3, 2),
            conv7: conv(device, out, out, 3, 2),
            lat5: conv(device, c5, out, 1, 1),
            lat4: conv(device, c4, out, 1, 1),
            lat3: conv(device, c3, out, 1, 1),
            smooth4: conv(device, out, out, 3, 1),
            smooth3: conv(device, out, out, 3, 1),
            out_channels: out,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Returns `[P3, P4, P5, P6, P7]`, finest first.
    pub fn forward(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let [_, c3, c4, c5] = self.body.forward(x).stages;

        let p6 = self.conv6.forward(c5.clone());
        let p7 = self.conv7.forward(activation::relu(p6.clone()));

        // Top-down
        let p5 = self.lat5.forward(c5);
        let p4 = self
            .smooth4
            .forward(upsample_add(p5.clone(), self.lat4.forward(c4)));
        let p3 = self
            .smooth3
            .forward(upsample_add(p4.clone(), self.lat3.forward(c3)));

        let pyramid = vec![p3, p4, p5, p6, p7];
        for (i, level) in pyramid.iter().enumerate() {
            log::debug!("  P{}: {:?}", i + 3, level.dims());
        }
        pyramid
    }
}

fn conv<B: Backend>(
    device: &B::Device,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
) -> Conv2d<B> {
    let padding = kernel_size / 2;
    Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .init(device)
}

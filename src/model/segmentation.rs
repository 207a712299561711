//! Deep-layer-aggregation style segmentation network.
//!
//! The residual body yields levels at strides 2..32. The network keeps those
//! at stride `down_ratio` and coarser, normalizes each, folds them together
//! from coarse to fine, classifies at stride `down_ratio` and upsamples the
//! class map back to the input resolution.

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{GroupNorm, GroupNormConfig, Initializer, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::{log_softmax, relu, softmax};

use crate::config::SegmentationConfig;
use crate::error::ModelError;
use crate::model::backbone::ResNetBody;
use crate::model::blocks::{resize_to, ConvBn, Upsample2d};

#[derive(Debug, Clone)]
pub struct SegOutput<B: Backend> {
    /// Normalized levels, finest first.
    pub levels: Vec<Tensor<B, 4>>,
    /// Per-pixel class probabilities `[N, C, H, W]`.
    pub probs: Tensor<B, 4>,
    pub log_probs: Tensor<B, 4>,
    /// Aggregation outputs, coarsest first.
    pub out_fms: Vec<Tensor<B, 4>>,
}

/// 1x1 conv, GroupNorm with one group per channel, ReLU.
#[derive(Module, Debug)]
pub struct LevelNorm<B: Backend> {
    conv: Conv2d<B>,
    norm: GroupNorm<B>,
}

impl<B: Backend> LevelNorm<B> {
    pub fn new(device: &B::Device, channels: usize) -> Self {
        Self {
            conv: Conv2dConfig::new([channels, channels], [1, 1]).init(device),
            norm: GroupNormConfig::new(channels, channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.norm.forward(self.conv.forward(x)))
    }
}

/// Iterative aggregation from the coarsest level down to the finest.
#[derive(Module, Debug)]
pub struct DlaUp<B: Backend> {
    // proj[j] / smooth[j] merge into level j
    proj: Vec<Conv2d<B>>,
    smooth: Vec<ConvBn<B>>,
}

impl<B: Backend> DlaUp<B> {
    /// `channels` per level, finest first.
    pub fn new(device: &B::Device, channels: &[usize]) -> Self {
        let mut proj = Vec::with_capacity(channels.len().saturating_sub(1));
        let mut smooth = Vec::with_capacity(channels.len().saturating_sub(1));

        for j in 0..channels.len().saturating_sub(1) {
            proj.push(Conv2dConfig::new([channels[j + 1], channels[j]], [1, 1]).init(device));
            smooth.push(ConvBn::new(device, channels[j], channels[j], 3, 1));
        }

        Self { proj, smooth }
    }

    /// Returns every intermediate aggregate, coarsest first; the last one
    /// sits at the finest level's resolution.
    pub fn forward(&self, levels: &[Tensor<B, 4>]) -> Vec<Tensor<B, 4>> {
        let Some(coarsest) = levels.last() else {
            return Vec::new();
        };

        let mut out = Vec::with_capacity(levels.len());
        let mut agg = coarsest.clone();
        out.push(agg.clone());

        for j in (0..levels.len() - 1).rev() {
            let [_, _, h, w] = levels[j].dims();
            let up = resize_to(self.proj[j].forward(agg), [h, w]);
            agg = self.smooth[j].forward(up + levels[j].clone());
            out.push(agg.clone());
        }
        out
    }
}

#[derive(Module, Debug)]
pub struct DlaSeg<B: Backend> {
    base: ResNetBody<B>,
    norms: Vec<LevelNorm<B>>,
    dla_up: DlaUp<B>,
    fc: Conv2d<B>,
    // Only present for an up factor of 4.
    up_conv1: Option<Conv2d<B>>,
    up_conv2: Option<Conv2d<B>>,
    first_level: usize,
    up_factor: usize,
    num_classes: usize,
}

impl<B: Backend> DlaSeg<B> {
    pub fn new(device: &B::Device, config: &SegmentationConfig) -> Result<Self, ModelError> {
        let first_level = match config.down_ratio {
            2 => 1,
            4 => 2,
            8 => 3,
            16 => 4,
            other => return Err(ModelError::InvalidDownRatio(other)),
        };
        let up_factor = 1 << first_level;
        let classes = config.num_classes;

        // Body level i has stride 2^(i + 1).
        let channels = ResNetBody::<B>::channels(config.base_width);
        let kept = &channels[first_level - 1..];

        log::info!("DlaSeg init:");
        log::info!("  down_ratio = {}, first_level = {}", config.down_ratio, first_level);
        log::info!("  level channels = {:?}, num_classes = {}", kept, classes);

        let fc = Conv2dConfig::new([kept[0], classes], [1, 1])
            .with_initializer(Initializer::Normal {
                mean: 0.0,
                std: (2.0 / classes as f64).sqrt(),
            })
            .init(device);

        let (up_conv1, up_conv2) = if up_factor == 4 {
            (
                Some(same_conv(device, classes, 3)),
                Some(same_conv(device, classes, 5)),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            base: ResNetBody::new(device, config.base_width, config.blocks),
            norms: kept.iter().map(|&c| LevelNorm::new(device, c)).collect(),
            dla_up: DlaUp::new(device, kept),
            fc,
            up_conv1,
            up_conv2,
            first_level,
            up_factor,
            num_classes: classes,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn up_factor(&self) -> usize {
        self.up_factor
    }

    /// Normalized levels at stride `down_ratio` and coarser, finest first.
    pub fn forward_features(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let features = self.base.forward(x);
        let [c2, c3, c4, c5] = features.stages;
        let all = [features.c1, c2, c3, c4, c5];

        all.into_iter()
            .skip(self.first_level - 1)
            .zip(&self.norms)
            .map(|(level, norm)| norm.forward(level))
            .collect()
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> SegOutput<B> {
        let levels = self.forward_features(x);
        let out_fms = self.dla_up.forward(&levels);

        let finest = out_fms
            .last()
            .cloned()
            .unwrap_or_else(|| levels[0].clone());
        let logits = self.upsample(self.fc.forward(finest));
        log::debug!("DlaSeg logits: {:?}", logits.dims());

        SegOutput {
            levels,
            probs: softmax(logits.clone(), 1),
            log_probs: log_softmax(logits, 1),
            out_fms,
        }
    }

    fn upsample(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match (&self.up_conv1, &self.up_conv2) {
            (Some(conv1), Some(conv2)) => {
                let up = Upsample2d::new(2);
                let x = conv1.forward(up.forward(x));
                conv2.forward(up.forward(x))
            }
            _ if self.up_factor > 1 => Upsample2d::new(self.up_factor).forward(x),
            _ => x,
        }
    }
}

fn same_conv<B: Backend>(device: &B::Device, channels: usize, kernel_size: usize) -> Conv2d<B> {
    let padding = kernel_size / 2;
    Conv2dConfig::new([channels, channels], [kernel_size, kernel_size])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .init(device)
}

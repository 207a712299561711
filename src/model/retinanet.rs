use burn::prelude::*;

use crate::config::ModelConfig;
use crate::model::backbone::Fpn;
use crate::model::head::{DetectionOutput, RetinaHead};

/// Full single-stage detector: residual FPN backbone plus shared heads.
#[derive(Module, Debug)]
pub struct RetinaNetFpn<B: Backend> {
    fpn: Fpn<B>,
    head: RetinaHead<B>,
}

impl<B: Backend> RetinaNetFpn<B> {
    pub fn new(device: &B::Device, config: &ModelConfig) -> Self {
        log::info!("Initializing RetinaNetFpn ({} classes)", config.num_classes);
        Self {
            fpn: Fpn::new(device, &config.backbone),
            head: RetinaHead::new(device, config.num_classes, &config.head),
        }
    }

    pub fn head(&self) -> &RetinaHead<B> {
        &self.head
    }

    /// `[N, 3, H, W]` -> `[P3, P4, P5, P6, P7]`.
    pub fn pyramid(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        self.fpn.forward(images)
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> DetectionOutput<B> {
        let pyramid = self.pyramid(images);
        self.head.forward(&pyramid)
    }

    /// Forward pass that also reports each level's `[height, width]`, the
    /// layout anchors must be generated against.
    pub fn forward_with_levels(&self, images: Tensor<B, 4>) -> (DetectionOutput<B>, Vec<[usize; 2]>) {
        let pyramid = self.pyramid(images);
        let sizes = level_sizes(&pyramid);
        (self.head.forward(&pyramid), sizes)
    }
}

pub fn level_sizes<B: Backend>(pyramid: &[Tensor<B, 4>]) -> Vec<[usize; 2]> {
    pyramid
        .iter()
        .map(|level| {
            let [_, _, h, w] = level.dims();
            [h, w]
        })
        .collect()
}

use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation;

use crate::config::HeadConfig;
use crate::error::ModelError;
use crate::model::anchors::{concat_levels, flatten_level};

/// Per-anchor predictions for a whole pyramid, levels concatenated finest first.
#[derive(Debug, Clone)]
pub struct DetectionOutput<B: Backend> {
    /// Box offsets `[N, A, 4]`.
    pub loc: Tensor<B, 3>,
    /// Class logits `[N, A, C]`.
    pub cls: Tensor<B, 3>,
    /// Collision logits `[N, A, 2]`.
    pub coll: Tensor<B, 3>,
    /// Orientation `[N, A, 1]`.
    pub ori: Tensor<B, 3>,
}

impl<B: Backend> DetectionOutput<B> {
    pub fn num_anchors(&self) -> usize {
        self.loc.dims()[1]
    }
}

#[derive(Module, Debug)]
pub struct TowerBlock<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

/// `depth` x (3x3 conv, BN, ReLU) then a 3x3 conv to `out_planes`.
#[derive(Module, Debug)]
pub struct HeadTower<B: Backend> {
    blocks: Vec<TowerBlock<B>>,
    out: Conv2d<B>,
}

impl<B: Backend> HeadTower<B> {
    pub fn new(
        device: &B::Device,
        channel: usize,
        out_planes: usize,
        depth: usize,
        out_bias: f32,
    ) -> Self {
        let blocks = (0..depth)
            .map(|_| TowerBlock {
                conv: head_conv(device, channel, channel, 0.0),
                bn: BatchNormConfig::new(channel).init(device),
            })
            .collect();

        Self {
            blocks,
            out: head_conv(device, channel, out_planes, out_bias),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.blocks.iter().fold(x, |x, block| {
            activation::relu(block.bn.forward(block.conv.forward(x)))
        });
        self.out.forward(x)
    }
}

/// 3x3 conv with weights ~ N(0, 0.01) and a constant bias.
fn head_conv<B: Backend>(
    device: &B::Device,
    in_channels: usize,
    out_channels: usize,
    bias: f32,
) -> Conv2d<B> {
    let mut conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_initializer(Initializer::Normal {
            mean: 0.0,
            std: 0.01,
        })
        .init(device);
    conv.bias = Some(Param::from_tensor(Tensor::full(
        [out_channels],
        bias,
        device,
    )));
    conv
}

/// Shared-weight RetinaNet heads applied to every pyramid level.
#[derive(Module, Debug)]
pub struct RetinaHead<B: Backend> {
    loc_head: HeadTower<B>,
    ori_head: HeadTower<B>,
    cls_head: HeadTower<B>,
    coll_head: HeadTower<B>,
    num_classes: usize,
    num_anchors: usize,
    channel: usize,
}

impl<B: Backend> RetinaHead<B> {
    pub fn new(device: &B::Device, num_classes: usize, config: &HeadConfig) -> Self {
        assert!(num_classes > 0, "num_classes must be at least 1");

        let anchors = config.num_anchors;
        let depth = config.tower_depth;
        let channel = config.channel;
        // Start every anchor at the foreground prior so background does not
        // swamp the first iterations.
        let prior = config.prior_prob;
        let cls_bias = -((1.0 - prior) / prior).ln();

        log::info!("RetinaHead init:");
        log::info!("  num_classes = {}, anchors/location = {}", num_classes, anchors);
        log::info!("  channel = {}, tower depth = {}", channel, depth);
        log::info!("  cls bias = {:.4} (prior {})", cls_bias, prior);

        Self {
            loc_head: HeadTower::new(device, channel, anchors * 4, depth, 0.0),
            ori_head: HeadTower::new(device, channel, anchors, depth, 0.0),
            cls_head: HeadTower::new(device, channel, anchors * num_classes, depth, cls_bias),
            coll_head: HeadTower::new(device, channel, anchors * 2, depth, 0.0),
            num_classes,
            num_anchors: anchors,
            channel,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_anchors(&self) -> usize {
        self.num_anchors
    }

    /// Forward after checking every level against the head's input width.
    pub fn try_forward(&self, pyramid: &[Tensor<B, 4>]) -> Result<DetectionOutput<B>, ModelError> {
        if pyramid.is_empty() {
            return Err(ModelError::LevelCountMismatch {
                expected: 1,
                actual: 0,
            });
        }
        let batch = pyramid.first().map(|t| t.dims()[0]).unwrap_or(0);
        for (level, fm) in pyramid.iter().enumerate() {
            let [n, c, _, _] = fm.dims();
            if c != self.channel {
                return Err(ModelError::ChannelMismatch {
                    level,
                    expected: self.channel,
                    actual: c,
                });
            }
            if n != batch {
                return Err(ModelError::BatchMismatch {
                    level,
                    expected: batch,
                    actual: n,
                });
            }
        }
        Ok(self.forward(pyramid))
    }

    /// Apply the towers to each level and concatenate per-anchor outputs.
    pub fn forward(&self, pyramid: &[Tensor<B, 4>]) -> DetectionOutput<B> {
        let mut loc = Vec::with_capacity(pyramid.len());
        let mut cls = Vec::with_capacity(pyramid.len());
        let mut coll = Vec::with_capacity(pyramid.len());
        let mut ori = Vec::with_capacity(pyramid.len());

        for fm in pyramid {
            log::debug!("RetinaHead level input: {:?}", fm.dims());
            loc.push(flatten_level(self.loc_head.forward(fm.clone()), 4));
            cls.push(flatten_level(self.cls_head.forward(fm.clone()), self.num_classes));
            coll.push(flatten_level(self.coll_head.forward(fm.clone()), 2));
            ori.push(flatten_level(self.ori_head.forward(fm.clone()), 1));
        }

        let output = DetectionOutput {
            loc: concat_levels(loc),
            cls: concat_levels(cls),
            coll: concat_levels(coll),
            ori: concat_levels(ori),
        };
        log::debug!(
            "RetinaHead output: loc {:?}, cls {:?}",
            output.loc.dims(),
            output.cls.dims()
        );
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn config(channel: usize) -> HeadConfig {
        HeadConfig {
            channel,
            num_anchors: 9,
            tower_depth: 2,
            prior_prob: 0.01,
        }
    }

    #[test]
    fn output_shapes_cover_all_levels() {
        let device = Default::default();
        let head = RetinaHead::<TestBackend>::new(&device, 3, &config(8));
        let pyramid = vec![
            Tensor::zeros([2, 8, 4, 4], &device),
            Tensor::zeros([2, 8, 2, 2], &device),
            Tensor::zeros([2, 8, 1, 1], &device),
        ];

        let out = head.forward(&pyramid);
        let anchors = (16 + 4 + 1) * 9;
        assert_eq!(out.loc.dims(), [2, anchors, 4]);
        assert_eq!(out.cls.dims(), [2, anchors, 3]);
        assert_eq!(out.coll.dims(), [2, anchors, 2]);
        assert_eq!(out.ori.dims(), [2, anchors, 1]);
        assert_eq!(out.num_anchors(), anchors);
    }

    #[test]
    fn zero_input_yields_prior_logits() {
        let device = Default::default();
        let head = RetinaHead::<TestBackend>::new(&device, 2, &config(4));
        let out = head.forward(&[Tensor::zeros([1, 4, 2, 2], &device)]);

        // Zero features through BN + ReLU stay zero, so only the bias remains.
        let expected = -(99.0f32).ln();
        let logits = out.cls.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        assert!(logits.iter().all(|v| (v - expected).abs() < 1e-4));

        let offsets = out.loc.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        assert!(offsets.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn rejects_wrong_channel_count() {
        let device = Default::default();
        let head = RetinaHead::<TestBackend>::new(&device, 2, &config(8));
        let err = head
            .try_forward(&[
                Tensor::zeros([1, 8, 2, 2], &device),
                Tensor::zeros([1, 6, 1, 1], &device),
            ])
            .unwrap_err();

        assert_eq!(
            err,
            ModelError::ChannelMismatch {
                level: 1,
                expected: 8,
                actual: 6
            }
        );
    }

    #[test]
    fn rejects_empty_pyramid() {
        let device = Default::default();
        let head = RetinaHead::<TestBackend>::new(&device, 2, &config(4));
        assert_eq!(
            head.try_forward(&[]).unwrap_err(),
            ModelError::LevelCountMismatch {
                expected: 1,
                actual: 0
            }
        );
    }

    #[test]
    fn rejects_batch_mismatch() {
        let device = Default::default();
        let head = RetinaHead::<TestBackend>::new(&device, 2, &config(4));
        let result = head.try_forward(&[
            Tensor::zeros([2, 4, 2, 2], &device),
            Tensor::zeros([1, 4, 1, 1], &device),
        ]);
        assert!(matches!(result, Err(ModelError::BatchMismatch { level: 1, .. })));
    }
}

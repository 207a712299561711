use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::model::loss::{FocalVariant, NanPolicy};

/// Number of pyramid levels produced by the FPN (P3..P7).
pub const PYRAMID_LEVELS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    // Detector
    pub num_classes: usize,
    pub backbone: BackboneConfig,
    pub head: HeadConfig,
    pub anchors: AnchorConfig,

    // Objective
    pub loss: LossConfig,

    // Secondary networks
    pub temporal: ConvLstmConfig,
    pub segmentation: SegmentationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackboneConfig {
    /// Width of the first bottleneck stage; later stages double it.
    pub base_width: usize,
    /// Bottleneck count per stage (ResNet-50 is [3, 4, 6, 3]).
    pub blocks: [usize; 4],
    /// Channel width of every pyramid level.
    pub fpn_channels: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeadConfig {
    pub channel: usize,
    pub num_anchors: usize,
    pub tower_depth: usize,
    /// Foreground prior used to bias the classification logits at init.
    pub prior_prob: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnchorConfig {
    /// Anchor area per pyramid level, finest first.
    pub areas: Vec<f32>,
    /// Width / height ratios.
    pub aspect_ratios: Vec<f32>,
    pub scales: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LossConfig {
    pub variant: FocalVariant,
    pub nan_policy: NanPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConvLstmConfig {
    pub cells: Vec<CellConfig>,
    /// Fixed `[height, width]` of each level's recurrent state. `None` sizes
    /// the state from the incoming pyramid.
    pub state_sizes: Option<Vec<[usize; 2]>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CellConfig {
    pub in_channels: usize,
    pub feature_channels: usize,
    pub kernel_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentationConfig {
    pub num_classes: usize,
    pub down_ratio: usize,
    pub base_width: usize,
    pub blocks: [usize; 4],
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_classes: 2,
            backbone: BackboneConfig::default(),
            head: HeadConfig::default(),
            anchors: AnchorConfig::default(),
            loss: LossConfig::default(),
            temporal: ConvLstmConfig::default(),
            segmentation: SegmentationConfig::default(),
        }
    }
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            base_width: 64,
            blocks: [3, 4, 6, 3],
            fpn_channels: 256,
        }
    }
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            channel: 256,
            num_anchors: 9,
            tower_depth: 4,
            prior_prob: 0.01,
        }
    }
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            areas: vec![32.0 * 32.0, 64.0 * 64.0, 128.0 * 128.0, 256.0 * 256.0, 512.0 * 512.0],
            aspect_ratios: vec![0.5, 1.0, 2.0],
            scales: vec![1.0, 2f32.powf(1.0 / 3.0), 2f32.powf(2.0 / 3.0)],
        }
    }
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            variant: FocalVariant::default(),
            nan_policy: NanPolicy::Warn,
        }
    }
}

impl Default for ConvLstmConfig {
    fn default() -> Self {
        let cell = |in_channels, feature_channels, kernel_size| CellConfig {
            in_channels,
            feature_channels,
            kernel_size,
        };
        Self {
            cells: vec![cell(66, 64, 5), cell(66, 64, 3), cell(130, 128, 3), cell(258, 256, 1)],
            state_sizes: None,
        }
    }
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            num_classes: 2,
            down_ratio: 4,
            base_width: 64,
            blocks: [2, 2, 2, 2],
        }
    }
}

impl ModelConfig {
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ModelConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.num_classes == 0 {
            return invalid("num_classes must be at least 1".into());
        }
        if self.backbone.base_width == 0 || self.backbone.fpn_channels == 0 {
            return invalid("backbone widths must be non-zero".into());
        }
        if self.backbone.blocks.iter().any(|&n| n == 0) {
            return invalid(format!(
                "every backbone stage needs at least one block, got {:?}",
                self.backbone.blocks
            ));
        }
        if self.head.channel != self.backbone.fpn_channels {
            return invalid(format!(
                "head channel {} does not match fpn_channels {}",
                self.head.channel, self.backbone.fpn_channels
            ));
        }
        let templates = self.anchors.aspect_ratios.len() * self.anchors.scales.len();
        if templates != self.head.num_anchors {
            return invalid(format!(
                "{} aspect ratios x {} scales = {} anchor templates, head predicts {}",
                self.anchors.aspect_ratios.len(),
                self.anchors.scales.len(),
                templates,
                self.head.num_anchors
            ));
        }
        if self.anchors.areas.len() != PYRAMID_LEVELS {
            return invalid(format!(
                "expected {} anchor areas, got {}",
                PYRAMID_LEVELS,
                self.anchors.areas.len()
            ));
        }
        if !(self.head.prior_prob > 0.0 && self.head.prior_prob < 1.0) {
            return invalid(format!("prior_prob must lie in (0, 1), got {}", self.head.prior_prob));
        }
        if let FocalVariant::Clamped { eps } = self.loss.variant {
            if !(eps > 0.0 && eps < 0.5) {
                return invalid(format!("focal eps must lie in (0, 0.5), got {}", eps));
            }
        }
        if self.temporal.cells.len() != 4 {
            return invalid(format!(
                "temporal module has one cell per level (4), got {}",
                self.temporal.cells.len()
            ));
        }
        if let Some(sizes) = &self.temporal.state_sizes {
            if sizes.len() != self.temporal.cells.len() {
                return invalid(format!(
                    "{} state sizes for {} cells",
                    sizes.len(),
                    self.temporal.cells.len()
                ));
            }
        }
        if ![2, 4, 8, 16].contains(&self.segmentation.down_ratio) {
            return invalid(format!(
                "down_ratio must be one of 2, 4, 8, 16, got {}",
                self.segmentation.down_ratio
            ));
        }
        if self.segmentation.num_classes == 0 {
            return invalid("segmentation num_classes must be at least 1".into());
        }
        Ok(())
    }
}

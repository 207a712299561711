pub mod anchors;
pub mod backbone;
pub mod blocks;
pub mod head;
pub mod loss;
pub mod retinanet;
pub mod segmentation;
pub mod temporal;

pub use anchors::AnchorGenerator;
pub use backbone::{Fpn, ResNetBody};
pub use head::{DetectionOutput, RetinaHead};
pub use loss::{FocalLoss, FocalVariant, LossDiagnostics, LossError, LossOutput, NanPolicy};
pub use retinanet::RetinaNetFpn;
pub use segmentation::{DlaSeg, SegOutput};
pub use temporal::{ConvLstm, ConvLstmCell};

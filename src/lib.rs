pub mod config;
pub mod error;
pub mod model;

// Re-exports for convenience
pub use config::ModelConfig;
pub use error::{ConfigError, ModelError};
pub use model::{
    AnchorGenerator, ConvLstm, DetectionOutput, DlaSeg, FocalLoss, FocalVariant, Fpn,
    LossDiagnostics, LossError, NanPolicy, RetinaHead, RetinaNetFpn,
};

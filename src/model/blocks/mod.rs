pub mod bottleneck;
pub mod conv;
pub mod upsample;

pub use bottleneck::{make_stage, Bottleneck};
pub use conv::ConvBn;
pub use upsample::{resize_to, upsample_add, Upsample2d};

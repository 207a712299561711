use thiserror::Error;

/// Precondition violations raised by the network modules.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("pyramid level {level} has {actual} channels, expected {expected}")]
    ChannelMismatch {
        level: usize,
        expected: usize,
        actual: usize,
    },
    #[error("pyramid has {actual} levels, expected {expected}")]
    LevelCountMismatch { expected: usize, actual: usize },
    #[error("pyramid levels disagree on batch size: level {level} has {actual}, level 0 has {expected}")]
    BatchMismatch {
        level: usize,
        expected: usize,
        actual: usize,
    },
    #[error("temporal sequence is empty")]
    EmptySequence,
    #[error("recurrent state for level {level} is fixed at {expected:?} but input is {actual:?}")]
    StateShapeMismatch {
        level: usize,
        expected: [usize; 2],
        actual: [usize; 2],
    },
    #[error("down ratio must be one of 2, 4, 8, 16 (got {0})")]
    InvalidDownRatio(usize),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::tensor::activation::{sigmoid, tanh};

use crate::config::{CellConfig, ConvLstmConfig};
use crate::error::ModelError;

/// Convolutional LSTM cell: one conv over `cat(x, h)` yields all four gates.
#[derive(Module, Debug)]
pub struct ConvLstmCell<B: Backend> {
    conv: Conv2d<B>,
    in_channels: usize,
    feature_channels: usize,
}

impl<B: Backend> ConvLstmCell<B> {
    pub fn new(device: &B::Device, config: &CellConfig) -> Self {
        let k = config.kernel_size;
        let f = config.feature_channels;
        let padding = k / 2;

        let conv = Conv2dConfig::new([config.in_channels + f, 4 * f], [k, k])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .init(device);

        Self {
            conv,
            in_channels: config.in_channels,
            feature_channels: f,
        }
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn feature_channels(&self) -> usize {
        self.feature_channels
    }

    /// One step. Returns the next `(hidden, cell)` state.
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        hidden: Tensor<B, 4>,
        cell: Tensor<B, 4>,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let f = self.feature_channels;
        let gates = self.conv.forward(Tensor::cat(vec![x, hidden], 1));

        let i = sigmoid(gates.clone().narrow(1, 0, f));
        let forget = sigmoid(gates.clone().narrow(1, f, f));
        let o = sigmoid(gates.clone().narrow(1, 2 * f, f));
        let g = tanh(gates.narrow(1, 3 * f, f));

        let cell = forget * cell + i * g;
        let hidden = o * tanh(cell.clone());
        (hidden, cell)
    }
}

/// One ConvLSTM cell per pyramid level, rolled over a sequence of pyramids.
#[derive(Module, Debug)]
pub struct ConvLstm<B: Backend> {
    cells: Vec<ConvLstmCell<B>>,
    // Empty when the state follows the input size.
    state_heights: Vec<usize>,
    state_widths: Vec<usize>,
}

impl<B: Backend> ConvLstm<B> {
    pub fn new(device: &B::Device, config: &ConvLstmConfig) -> Self {
        log::info!("ConvLstm init: {} cells", config.cells.len());
        for (level, cell) in config.cells.iter().enumerate() {
            log::info!(
                "  level {}: {} -> {} (k = {})",
                level,
                cell.in_channels,
                cell.feature_channels,
                cell.kernel_size
            );
        }

        let (state_heights, state_widths): (Vec<usize>, Vec<usize>) = config
            .state_sizes
            .as_ref()
            .map(|sizes| sizes.iter().map(|&[h, w]| (h, w)).unzip())
            .unwrap_or_default();

        Self {
            cells: config
                .cells
                .iter()
                .map(|cell| ConvLstmCell::new(device, cell))
                .collect(),
            state_heights,
            state_widths,
        }
    }

    pub fn num_levels(&self) -> usize {
        self.cells.len()
    }

    /// Final hidden state of every level after consuming `sequence`.
    ///
    /// `sequence[t][l]` is level `l` at timestep `t`. States start at zero on
    /// the input's device for every call.
    pub fn forward(&self, sequence: &[Vec<Tensor<B, 4>>]) -> Result<Vec<Tensor<B, 4>>, ModelError> {
        let first = sequence.first().ok_or(ModelError::EmptySequence)?;
        self.check_step(first)?;

        let mut states: Vec<(Tensor<B, 4>, Tensor<B, 4>)> = first
            .iter()
            .zip(&self.cells)
            .map(|(x, cell)| {
                let [n, _, h, w] = x.dims();
                let zeros = Tensor::<B, 4>::zeros([n, cell.feature_channels(), h, w], &x.device());
                (zeros.clone(), zeros)
            })
            .collect();

        for (t, step) in sequence.iter().enumerate() {
            if t > 0 {
                self.check_step(step)?;
                check_same_layout(first, step)?;
            }
            states = step
                .iter()
                .zip(&self.cells)
                .zip(states)
                .map(|((x, cell), (h, c))| cell.forward(x.clone(), h, c))
                .collect();
        }

        let hidden: Vec<Tensor<B, 4>> = states.into_iter().map(|(h, _)| h).collect();
        for (level, h) in hidden.iter().enumerate() {
            log::debug!("ConvLstm level {} hidden: {:?}", level, h.dims());
        }
        Ok(hidden)
    }

    fn check_step(&self, step: &[Tensor<B, 4>]) -> Result<(), ModelError> {
        if step.len() != self.cells.len() {
            return Err(ModelError::LevelCountMismatch {
                expected: self.cells.len(),
                actual: step.len(),
            });
        }

        for (level, (x, cell)) in step.iter().zip(&self.cells).enumerate() {
            let [_, c, h, w] = x.dims();
            if c != cell.in_channels() {
                return Err(ModelError::ChannelMismatch {
                    level,
                    expected: cell.in_channels(),
                    actual: c,
                });
            }
            if let (Some(&sh), Some(&sw)) = (self.state_heights.get(level), self.state_widths.get(level)) {
                if [sh, sw] != [h, w] {
                    return Err(ModelError::StateShapeMismatch {
                        level,
                        expected: [sh, sw],
                        actual: [h, w],
                    });
                }
            }
        }
        Ok(())
    }
}

/// A later timestep must keep the batch and spatial size the state was built with.
fn check_same_layout<B: Backend>(first: &[Tensor<B, 4>], step: &[Tensor<B, 4>]) -> Result<(), ModelError> {
    for (level, (x0, x)) in first.iter().zip(step).enumerate() {
        let [n0, _, h0, w0] = x0.dims();
        let [n, _, h, w] = x.dims();
        if n != n0 {
            return Err(ModelError::BatchMismatch {
                level,
                expected: n0,
                actual: n,
            });
        }
        if [h, w] != [h0, w0] {
            return Err(ModelError::StateShapeMismatch {
                level,
                expected: [h0, w0],
                actual: [h, w],
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::nn::Initializer;

    type TestBackend = NdArray<f32>;

    fn small_config() -> ConvLstmConfig {
        let cell = |in_channels, feature_channels, kernel_size| CellConfig {
            in_channels,
            feature_channels,
            kernel_size,
        };
        ConvLstmConfig {
            cells: vec![cell(3, 4, 5), cell(3, 4, 3), cell(5, 6, 3), cell(7, 8, 1)],
            state_sizes: None,
        }
    }

    fn pyramid(device: &<TestBackend as Backend>::Device) -> Vec<Tensor<TestBackend, 4>> {
        vec![
            Tensor::ones([2, 3, 8, 8], device),
            Tensor::ones([2, 3, 4, 4], device),
            Tensor::ones([2, 5, 2, 2], device),
            Tensor::ones([2, 7, 1, 1], device),
        ]
    }

    #[test]
    fn hidden_states_follow_input_size() {
        let device = Default::default();
        let lstm = ConvLstm::<TestBackend>::new(&device, &small_config());
        let sequence = vec![pyramid(&device), pyramid(&device), pyramid(&device)];

        let hidden = lstm.forward(&sequence).unwrap();
        let dims: Vec<_> = hidden.iter().map(|h| h.dims()).collect();
        assert_eq!(
            dims,
            vec![[2, 4, 8, 8], [2, 4, 4, 4], [2, 6, 2, 2], [2, 8, 1, 1]]
        );
    }

    #[test]
    fn gate_arithmetic_with_zero_weights() {
        let device = Default::default();
        let mut cell = ConvLstmCell::<TestBackend>::new(
            &device,
            &CellConfig {
                in_channels: 2,
                feature_channels: 3,
                kernel_size: 3,
            },
        );
        cell.conv = Conv2dConfig::new([5, 12], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_initializer(Initializer::Constant { value: 0.0 })
            .init(&device);

        // Every gate pre-activation is 0: i = f = o = 0.5, g = 0.
        let (h, c) = cell.forward(
            Tensor::ones([1, 2, 3, 3], &device),
            Tensor::zeros([1, 3, 3, 3], &device),
            Tensor::ones([1, 3, 3, 3], &device),
        );

        let c = c.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        let h = h.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        let expected_h = 0.5 * 0.5f32.tanh();
        assert!(c.iter().all(|v| (v - 0.5).abs() < 1e-6));
        assert!(h.iter().all(|v| (v - expected_h).abs() < 1e-6));
    }

    #[test]
    fn empty_sequence_is_an_error() {
        let device = Default::default();
        let lstm = ConvLstm::<TestBackend>::new(&device, &small_config());
        assert_eq!(lstm.forward(&[]).unwrap_err(), ModelError::EmptySequence);
    }

    #[test]
    fn fixed_state_size_is_enforced() {
        let device = Default::default();
        let mut config = small_config();
        config.state_sizes = Some(vec![[8, 8], [4, 4], [3, 3], [1, 1]]);
        let lstm = ConvLstm::<TestBackend>::new(&device, &config);

        let err = lstm.forward(&[pyramid(&device)]).unwrap_err();
        assert_eq!(
            err,
            ModelError::StateShapeMismatch {
                level: 2,
                expected: [3, 3],
                actual: [2, 2]
            }
        );
    }

    #[test]
    fn layout_change_between_timesteps_is_rejected() {
        let device = Default::default();
        let lstm = ConvLstm::<TestBackend>::new(&device, &small_config());

        let mut resized = pyramid(&device);
        resized[1] = Tensor::ones([2, 3, 6, 6], &device);
        assert_eq!(
            lstm.forward(&[pyramid(&device), resized]).unwrap_err(),
            ModelError::StateShapeMismatch {
                level: 1,
                expected: [4, 4],
                actual: [6, 6]
            }
        );

        let mut rebatched = pyramid(&device);
        rebatched[0] = Tensor::ones([1, 3, 8, 8], &device);
        assert_eq!(
            lstm.forward(&[pyramid(&device), rebatched]).unwrap_err(),
            ModelError::BatchMismatch {
                level: 0,
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn wrong_level_count_is_rejected() {
        let device = Default::default();
        let lstm = ConvLstm::<TestBackend>::new(&device, &small_config());
        let mut step = pyramid(&device);
        step.pop();

        assert!(matches!(
            lstm.forward(&[step]),
            Err(ModelError::LevelCountMismatch { expected: 4, actual: 3 })
        ));
    }
}

//! Anchor templates and the flattening order shared with the prediction heads.
//!
//! Every per-anchor tensor in the crate is laid out level -> row -> column ->
//! template. [`flatten_level`] produces that order from a head output and
//! [`AnchorGenerator::generate`] produces it for anchor boxes; targets encoded
//! against one order and predictions flattened in another would train on the
//! wrong anchors without any shape error.

use burn::prelude::*;

use crate::config::AnchorConfig;

/// `[N, A*D, H, W]` -> `[N, H*W*A, D]`, anchor template varying fastest.
pub fn flatten_level<B: Backend>(x: Tensor<B, 4>, dim: usize) -> Tensor<B, 3> {
    let [batch, channels, height, width] = x.dims();
    debug_assert_eq!(channels % dim, 0, "channels {} not divisible by {}", channels, dim);

    let anchors = channels / dim;
    x.permute([0, 2, 3, 1])
        .reshape([batch, height * width * anchors, dim])
}

/// Concatenate flattened levels along the anchor axis, preserving level order.
pub fn concat_levels<B: Backend>(levels: Vec<Tensor<B, 3>>) -> Tensor<B, 3> {
    Tensor::cat(levels, 1)
}

/// Total anchors for a pyramid with the given `[height, width]` per level.
pub fn num_anchors(level_sizes: &[[usize; 2]], anchors_per_location: usize) -> usize {
    level_sizes
        .iter()
        .map(|[h, w]| h * w * anchors_per_location)
        .sum()
}

#[derive(Debug, Clone)]
pub struct AnchorGenerator {
    config: AnchorConfig,
}

impl AnchorGenerator {
    pub fn new(config: AnchorConfig) -> Self {
        Self { config }
    }

    pub fn anchors_per_location(&self) -> usize {
        self.config.aspect_ratios.len() * self.config.scales.len()
    }

    /// `(width, height)` of each template for one level, ratio-major.
    pub fn templates(&self, area: f32) -> Vec<(f32, f32)> {
        let mut sizes = Vec::with_capacity(self.anchors_per_location());
        for &ratio in &self.config.aspect_ratios {
            let h = (area / ratio).sqrt();
            let w = ratio * h;
            for &scale in &self.config.scales {
                sizes.push((w * scale, h * scale));
            }
        }
        sizes
    }

    /// Anchor boxes as `[cx, cy, w, h]` in input pixels for every level.
    ///
    /// `input_size` and `level_sizes` are `[height, width]`. The cell size of a
    /// level is `input / level`, and anchors sit at cell centres.
    pub fn generate(&self, input_size: [usize; 2], level_sizes: &[[usize; 2]]) -> Vec<[f32; 4]> {
        assert!(
            level_sizes.len() <= self.config.areas.len(),
            "{} pyramid levels but only {} anchor areas",
            level_sizes.len(),
            self.config.areas.len()
        );

        let total = num_anchors(level_sizes, self.anchors_per_location());
        let mut boxes = Vec::with_capacity(total);

        for (level, &[fm_h, fm_w]) in level_sizes.iter().enumerate() {
            let templates = self.templates(self.config.areas[level]);
            let cell_h = input_size[0] as f32 / fm_h as f32;
            let cell_w = input_size[1] as f32 / fm_w as f32;

            for y in 0..fm_h {
                for x in 0..fm_w {
                    let cx = (x as f32 + 0.5) * cell_w;
                    let cy = (y as f32 + 0.5) * cell_h;
                    for &(w, h) in &templates {
                        boxes.push([cx, cy, w, h]);
                    }
                }
            }
        }

        log::debug!(
            "generated {} anchors over {} levels for input {:?}",
            boxes.len(),
            level_sizes.len(),
            input_size
        );
        boxes
    }

    /// Same as [`generate`](Self::generate) as a `[total_anchors, 4]` tensor.
    pub fn generate_tensor<B: Backend>(
        &self,
        input_size: [usize; 2],
        level_sizes: &[[usize; 2]],
        device: &B::Device,
    ) -> Tensor<B, 2> {
        let boxes = self.generate(input_size, level_sizes);
        let count = boxes.len();
        let flat: Vec<f32> = boxes.into_iter().flatten().collect();
        Tensor::from_data(TensorData::new(flat, [count, 4]), device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn generator() -> AnchorGenerator {
        AnchorGenerator::new(AnchorConfig::default())
    }

    #[test]
    fn nine_templates_preserve_area() {
        let templates = generator().templates(64.0 * 64.0);
        assert_eq!(templates.len(), 9);

        // Scale 1 of every ratio keeps the base area.
        for (w, h) in templates.iter().step_by(3) {
            assert!((w * h - 4096.0).abs() < 1e-1);
        }
        // Ratio is width / height.
        let (w, h) = templates[0];
        assert!((w / h - 0.5).abs() < 1e-5);
    }

    #[test]
    fn anchor_count_sums_levels() {
        let sizes = [[8, 8], [4, 4], [2, 2], [1, 1], [1, 1]];
        assert_eq!(num_anchors(&sizes, 9), (64 + 16 + 4 + 1 + 1) * 9);
        assert_eq!(generator().generate([64, 64], &sizes).len(), 86 * 9);
    }

    #[test]
    fn anchors_walk_rows_then_columns_then_templates() {
        let boxes = generator().generate([32, 64], &[[2, 4]]);
        // First nine share the (0, 0) cell centre.
        for b in &boxes[..9] {
            assert_eq!([b[0], b[1]], [8.0, 8.0]);
        }
        // Next cell moves along the row.
        assert_eq!([boxes[9][0], boxes[9][1]], [24.0, 8.0]);
        // Fifth cell starts the second row.
        assert_eq!([boxes[36][0], boxes[36][1]], [8.0, 24.0]);
    }

    #[test]
    fn flatten_level_is_anchor_major() {
        let device = Default::default();
        // Two anchors, two values each, on a 1x2 map.
        // channel c = a*D + d, value = 100*c + x
        let data: Vec<f32> = (0..4)
            .flat_map(|c| (0..2).map(move |x| (100 * c + x) as f32))
            .collect();
        let x = Tensor::<TestBackend, 4>::from_data(TensorData::new(data, [1, 4, 1, 2]), &device);

        let flat = flatten_level(x, 2);
        assert_eq!(flat.dims(), [1, 4, 2]);

        let values = flat.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        // (x=0, a=0), (x=0, a=1), (x=1, a=0), (x=1, a=1)
        assert_eq!(values, vec![0., 100., 200., 300., 1., 101., 201., 301.]);
    }

    #[test]
    fn anchor_tensor_matches_list() {
        let device = Default::default();
        let sizes = [[2, 2], [1, 1]];
        let list = generator().generate([16, 16], &sizes);
        let tensor = generator().generate_tensor::<TestBackend>([16, 16], &sizes, &device);
        assert_eq!(tensor.dims(), [list.len(), 4]);

        let values = tensor.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        let expected: Vec<f32> = list.into_iter().flatten().collect();
        assert_eq!(values, expected);
    }
}

use burn::backend::NdArray;
use burn::prelude::*;

use retinanet_detection::config::{AnchorConfig, BackboneConfig, HeadConfig};
use retinanet_detection::model::anchors::{concat_levels, flatten_level, num_anchors};
use retinanet_detection::model::retinanet::level_sizes;
use retinanet_detection::{AnchorGenerator, ModelConfig, RetinaNetFpn};

type TestBackend = NdArray<f32>;

fn tiny_config() -> ModelConfig {
    ModelConfig {
        num_classes: 4,
        backbone: BackboneConfig {
            base_width: 4,
            blocks: [1, 1, 1, 1],
            fpn_channels: 8,
        },
        head: HeadConfig {
            channel: 8,
            num_anchors: 9,
            tower_depth: 1,
            prior_prob: 0.01,
        },
        ..ModelConfig::default()
    }
}

#[test]
fn anchors_line_up_with_predictions_on_odd_inputs() {
    let device = Default::default();
    let config = tiny_config();
    let model = RetinaNetFpn::<TestBackend>::new(&device, &config);

    for [h, w] in [[100, 100], [75, 130]] {
        let pyramid = model.pyramid(Tensor::zeros([1, 3, h, w], &device));
        let sizes = level_sizes(&pyramid);
        assert_eq!(sizes.len(), 5);

        let out = model.head().try_forward(&pyramid).unwrap();
        let anchors = AnchorGenerator::new(config.anchors.clone()).generate([h, w], &sizes);
        assert_eq!(anchors.len(), out.num_anchors());
        assert_eq!(out.num_anchors(), num_anchors(&sizes, 9));
        assert_eq!(out.ori.dims()[2], 1);
        assert_eq!(out.coll.dims()[2], 2);
    }
}

/// Level `l`, row `y`, column `x`, template `a` is encoded as a marker so the
/// flattened position of every prediction can be checked against the anchor
/// list.
fn marker_level(level: usize, h: usize, w: usize, anchors: usize) -> Tensor<TestBackend, 4> {
    let mut data = vec![0.0f32; anchors * h * w];
    for a in 0..anchors {
        for y in 0..h {
            for x in 0..w {
                data[(a * h + y) * w + x] = (level * 10_000 + y * 100 + x * 10 + a) as f32;
            }
        }
    }
    Tensor::from_data(TensorData::new(data, [1, anchors, h, w]), &Default::default())
}

/// Decoded `(level, y, x, template)` of a marker.
fn decode_marker(m: f32) -> (usize, usize, usize, usize) {
    let m = m as usize;
    (m / 10_000, (m % 10_000) / 100, (m % 100) / 10, m % 10)
}

/// Does the prediction carrying `marker` belong to `anchor`?
fn marker_matches_anchor(
    generator: &AnchorGenerator,
    config: &AnchorConfig,
    input: [usize; 2],
    sizes: &[[usize; 2]],
    marker: f32,
    anchor: [f32; 4],
) -> bool {
    let (level, y, x, a) = decode_marker(marker);
    let [fm_h, fm_w] = sizes[level];
    let cx = (x as f32 + 0.5) * input[1] as f32 / fm_w as f32;
    let cy = (y as f32 + 0.5) * input[0] as f32 / fm_h as f32;
    let (w, h) = generator.templates(config.areas[level])[a];

    let close = |p: f32, q: f32| (p - q).abs() < 1e-3;
    close(anchor[0], cx) && close(anchor[1], cy) && close(anchor[2], w) && close(anchor[3], h)
}

#[test]
fn flattening_matches_anchor_order_and_level_swaps_break_it() {
    let input = [30, 20];
    let sizes = [[3, 2], [2, 1]];
    let config = AnchorConfig {
        aspect_ratios: vec![1.0, 2.0],
        scales: vec![1.0],
        ..AnchorConfig::default()
    };
    let generator = AnchorGenerator::new(config.clone());
    let per_loc = generator.anchors_per_location();
    let anchors = generator.generate(input, &sizes);

    let levels: Vec<_> = sizes
        .iter()
        .enumerate()
        .map(|(l, &[h, w])| flatten_level(marker_level(l, h, w, per_loc), 1))
        .collect();

    let markers = concat_levels(levels.clone())
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .unwrap();
    assert_eq!(markers.len(), anchors.len());
    for (i, (&marker, &anchor)) in markers.iter().zip(&anchors).enumerate() {
        assert!(
            marker_matches_anchor(&generator, &config, input, &sizes, marker, anchor),
            "prediction {} carries {:?} but anchor is {:?}",
            i,
            decode_marker(marker),
            anchor
        );
    }

    // Same anchor count, wrong assignment.
    let swapped = concat_levels(vec![levels[1].clone(), levels[0].clone()])
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .unwrap();
    assert_eq!(swapped.len(), anchors.len());
    let mismatched = swapped
        .iter()
        .zip(&anchors)
        .filter(|(marker, anchor)| {
            !marker_matches_anchor(&generator, &config, input, &sizes, **marker, **anchor)
        })
        .count();
    assert!(mismatched > 0);
}

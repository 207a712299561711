use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::NdArray;
use burn::prelude::*;
use burn::tensor::Distribution;
use clap::Parser;
use serde::Serialize;

use retinanet_detection::model::retinanet::level_sizes;
use retinanet_detection::{
    AnchorGenerator, ConvLstm, DlaSeg, FocalLoss, LossDiagnostics, ModelConfig, RetinaNetFpn,
};

type BackendType = NdArray;

/// Build the networks from a config and report shapes and loss on synthetic data.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Model config (YAML). Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the effective config to this path and exit
    #[arg(long)]
    save_config: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    batch: usize,

    #[arg(long, default_value_t = 256)]
    height: usize,

    #[arg(long, default_value_t = 256)]
    width: usize,

    /// Also run the temporal and segmentation networks
    #[arg(long)]
    all: bool,

    /// Timesteps fed to the temporal module
    #[arg(long, default_value_t = 2)]
    steps: usize,
}

#[derive(Serialize)]
struct Report {
    input: [usize; 4],
    level_sizes: Vec<[usize; 2]>,
    num_anchors: usize,
    loc: [usize; 3],
    cls: [usize; 3],
    coll: [usize; 3],
    ori: [usize; 3],
    loss: LossReport,
    temporal: Option<Vec<[usize; 4]>>,
    segmentation: Option<[usize; 4]>,
}

#[derive(Serialize)]
struct LossReport {
    total: f32,
    loc_loss: f32,
    cls_loss: f32,
    num_positive: usize,
    running_average: f64,
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ModelConfig::from_yaml(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => {
            let config = ModelConfig::default();
            config.validate()?;
            config
        }
    };

    if let Some(path) = &args.save_config {
        config
            .save(path)
            .with_context(|| format!("writing config {}", path.display()))?;
        log::info!("Config written to {}", path.display());
        return Ok(());
    }

    let device = Default::default();
    let input = [args.batch, 3, args.height, args.width];
    log::info!("Input: {:?}", input);

    let model = RetinaNetFpn::<BackendType>::new(&device, &config);
    let images = Tensor::<BackendType, 4>::random(input, Distribution::Default, &device);

    let pyramid = model.pyramid(images.clone());
    let sizes = level_sizes(&pyramid);
    let output = model.head().try_forward(&pyramid)?;

    let generator = AnchorGenerator::new(config.anchors.clone());
    let anchors = generator.generate([args.height, args.width], &sizes);
    anyhow::ensure!(
        anchors.len() == output.num_anchors(),
        "{} anchors generated but the head predicts {}",
        anchors.len(),
        output.num_anchors()
    );

    // One centred box of class 1 per image.
    let gt = [
        args.width as f32 / 2.0,
        args.height as f32 / 2.0,
        args.width as f32 / 3.0,
        args.height as f32 / 3.0,
    ];
    let (labels, offsets) = encode_synthetic(&anchors, gt, args.batch);
    let cls_targets = Tensor::<BackendType, 2, Int>::from_data(
        TensorData::new(labels, [args.batch, anchors.len()]),
        &device,
    );
    let loc_targets = Tensor::<BackendType, 3>::from_data(
        TensorData::new(offsets, [args.batch, anchors.len(), 4]),
        &device,
    );

    let objective = FocalLoss::new(config.num_classes, config.loss.variant, config.loss.nan_policy);
    let mut diagnostics = LossDiagnostics::new();
    let loss = objective.forward(
        output.loc.clone(),
        loc_targets,
        output.cls.clone(),
        cls_targets,
        &mut diagnostics,
    )?;

    let temporal = if args.all {
        Some(run_temporal(&config, &sizes, args.batch, args.steps, &device)?)
    } else {
        None
    };
    let segmentation = if args.all {
        let seg = DlaSeg::<BackendType>::new(&device, &config.segmentation)?;
        Some(seg.forward(images).probs.dims())
    } else {
        None
    };

    let report = Report {
        input,
        num_anchors: anchors.len(),
        level_sizes: sizes,
        loc: output.loc.dims(),
        cls: output.cls.dims(),
        coll: output.coll.dims(),
        ori: output.ori.dims(),
        loss: LossReport {
            total: loss.loss.into_scalar().elem::<f32>(),
            loc_loss: loss.loc_loss,
            cls_loss: loss.cls_loss,
            num_positive: loss.num_positive,
            running_average: loss.running_average,
        },
        temporal,
        segmentation,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Random per-level inputs for the temporal module at the finest pyramid sizes.
fn run_temporal(
    config: &ModelConfig,
    sizes: &[[usize; 2]],
    batch: usize,
    steps: usize,
    device: &<BackendType as Backend>::Device,
) -> Result<Vec<[usize; 4]>> {
    let lstm = ConvLstm::<BackendType>::new(device, &config.temporal);
    let fixed = config.temporal.state_sizes.clone();

    let sequence: Vec<Vec<Tensor<BackendType, 4>>> = (0..steps)
        .map(|_| {
            config
                .temporal
                .cells
                .iter()
                .enumerate()
                .map(|(level, cell)| {
                    let [h, w] = fixed
                        .as_ref()
                        .and_then(|s| s.get(level).copied())
                        .unwrap_or(sizes[level.min(sizes.len() - 1)]);
                    Tensor::random([batch, cell.in_channels, h, w], Distribution::Default, device)
                })
                .collect()
        })
        .collect();

    let hidden = lstm.forward(&sequence)?;
    Ok(hidden.iter().map(|h| h.dims()).collect())
}

/// Label anchors against a single box: IoU >= 0.5 positive, [0.4, 0.5) ignored.
fn encode_synthetic(anchors: &[[f32; 4]], gt: [f32; 4], batch: usize) -> (Vec<i64>, Vec<f32>) {
    let mut labels = Vec::with_capacity(anchors.len());
    let mut offsets = Vec::with_capacity(anchors.len() * 4);

    for anchor in anchors {
        let overlap = iou(anchor, &gt);
        labels.push(if overlap >= 0.5 {
            1
        } else if overlap >= 0.4 {
            -1
        } else {
            0
        });

        let [ax, ay, aw, ah] = *anchor;
        offsets.extend_from_slice(&[
            (gt[0] - ax) / aw,
            (gt[1] - ay) / ah,
            (gt[2] / aw).ln(),
            (gt[3] / ah).ln(),
        ]);
    }

    let positives = labels.iter().filter(|&&l| l > 0).count();
    log::info!("Synthetic targets: {} positive of {} anchors", positives, anchors.len());

    (labels.repeat(batch), offsets.repeat(batch))
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let corners = |[cx, cy, w, h]: [f32; 4]| [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0];
    let [ax1, ay1, ax2, ay2] = corners(*a);
    let [bx1, by1, bx2, by2] = corners(*b);

    let iw = (ax2.min(bx2) - ax1.max(bx1)).max(0.0);
    let ih = (ay2.min(by2) - ay1.max(by1)).max(0.0);
    let inter = iw * ih;
    let union = a[2] * a[3] + b[2] * b[3] - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use env_logger::Env;
use futures::StreamExt;
use simulcast_encoder::task::{EncodedLayer, EncoderCommand, EncoderTask};
use simulcast_encoder::{MultiLayerEncoder, RawEngineFactory};
use tokio_util::sync::CancellationToken;

mod config;
mod source;

use config::AppConfig;
use source::{SourceFormat, TestSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EngineKind {
    /// Uncompressed I420 payloads
    Raw,
    #[cfg(feature = "ffmpeg")]
    Ffmpeg,
}

#[derive(Parser, Debug)]
#[command(name = "lite-simulcast", version, about = "Encode a synthetic source into simulcast layers")]
struct Args {
    /// JSON encoding configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of frames to encode
    #[arg(short = 'n', long, default_value_t = 90)]
    frames: u32,

    /// Top layer width, rebuilds the default three-layer cascade
    #[arg(long, requires = "height")]
    width: Option<u32>,

    #[arg(long, requires = "width")]
    height: Option<u32>,

    /// Start bitrate in kbps
    #[arg(long)]
    start_kbps: Option<u32>,

    #[arg(long, value_enum, default_value_t = SourceFormat::I420)]
    format: SourceFormat,

    #[arg(long, value_enum, default_value_t = EngineKind::Raw)]
    engine: EngineKind,
}

#[derive(Debug, Default)]
struct LayerStats {
    width: u32,
    height: u32,
    frames: u64,
    key_frames: u64,
    bytes: u64,
}

fn build_encoder(config: &AppConfig, engine: EngineKind) -> anyhow::Result<MultiLayerEncoder> {
    let encoder = MultiLayerEncoder::new(config.encoder_config());
    let encoder = match engine {
        EngineKind::Raw => encoder.with_engine_factory(RawEngineFactory),
        #[cfg(feature = "ffmpeg")]
        EngineKind::Ffmpeg => {
            simulcast_encoder::ffmpeg::init()?;
            encoder
                .with_engine_factory(simulcast_encoder::ffmpeg::FfmpegEngineFactory)
                .with_image_utility(simulcast_encoder::scaler::SwsImageUtility::new())
        }
    };
    Ok(encoder)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let (Some(width), Some(height)) = (args.width, args.height) {
        config.resize(width, height);
    }
    if let Some(kbps) = args.start_kbps {
        config.codec.start_bitrate_kbps = kbps;
    }

    let mut encoder = build_encoder(&config, args.engine)?;
    encoder
        .init_encode(&config.codec, &config.settings)
        .map_err(|e| anyhow::anyhow!("init_encode: {} ({})", e, e.code()))?;
    let info = encoder.encoder_info();
    log::info!(
        "{} encoder ready: {} layer(s), hardware: {}",
        info.implementation_name,
        encoder.num_layers(),
        info.is_hardware_accelerated
    );

    let mut stats: BTreeMap<usize, LayerStats> = BTreeMap::new();
    for layer in encoder.layers() {
        let config = layer.config();
        stats.insert(
            config.simulcast_index,
            LayerStats {
                width: config.width,
                height: config.height,
                ..Default::default()
            },
        );
    }

    let task = EncoderTask::new();
    let mut layers = task.stream();
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let handle = task.start(encoder, rx);

    let cancel = CancellationToken::new();
    let producer_cancel = cancel.clone();
    let fps = config.codec.max_framerate.max(1);
    let (width, height) = (config.codec.width, config.codec.height);
    let frames = args.frames;
    let format = args.format;
    let producer = tokio::spawn(async move {
        let mut source = TestSource::new(width, height, fps, format);
        let mut interval = tokio::time::interval(Duration::from_secs(1) / fps);
        for _ in 0..frames {
            tokio::select! {
                _ = producer_cancel.cancelled() => break,
                _ = interval.tick() => {
                    if tx.send(EncoderCommand::Frame(source.next_frame(), None)).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = tx.send(EncoderCommand::EOF).await;
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted");
                cancel.cancel();
                task.stop();
            },
            layer = layers.next() => {
                let Some(EncodedLayer { image, info }) = layer else {
                    break;
                };
                let Some(index) = image.spatial_index else {
                    continue;
                };
                let entry = stats.entry(index).or_default();
                entry.frames += 1;
                entry.bytes += image.size() as u64;
                if info.idr_frame {
                    entry.key_frames += 1;
                }
            },
        }
    }

    let _ = producer.await;
    let _ = handle.await;

    println!("{:<6} {:>11} {:>8} {:>6} {:>12} {:>10}", "index", "size", "frames", "keys", "bytes", "kbps");
    for (index, s) in stats.iter().rev() {
        let seconds = s.frames as f64 / fps as f64;
        let kbps = if seconds > 0.0 { s.bytes as f64 * 8.0 / seconds / 1000.0 } else { 0.0 };
        println!(
            "{:<6} {:>11} {:>8} {:>6} {:>12} {:>10.1}",
            index,
            format!("{}x{}", s.width, s.height),
            s.frames,
            s.key_frames,
            s.bytes,
            kbps
        );
    }
    Ok(())
}

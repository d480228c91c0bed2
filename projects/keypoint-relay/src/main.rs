mod cli;
mod inference;
mod pipeline;
mod video;
mod web;

use anyhow::Result;
use cli::Args;
use pipeline::orchestrator::{start_relay, RelayParts};
use std::time::Duration;
use web::server::run_status_server;

/// Packets allowed to wait for the decoder before `submit` starts blocking.
#[cfg(all(feature = "ffmpeg", feature = "onnx"))]
const DECODE_BACKLOG: usize = 8;

#[cfg(all(feature = "ffmpeg", feature = "onnx"))]
fn build_parts(args: &Args) -> Result<RelayParts> {
    use inference::detector::UslsDetector;
    use inference::imaging::ImageCropResizer;
    use inference::keypoint::OnnxKeypointRegressor;
    use pipeline::sender::UdpSender;
    use std::sync::Arc;
    use video::ffmpeg_decoder::FfmpegDecodeEngine;
    use video::ffmpeg_source::FfmpegStreamSource;

    let source = FfmpegStreamSource::open(&args.stream_url)?;
    let (width, height) = source.dimensions();
    tracing::info!("Opened {} ({}x{})", args.stream_url, width, height);

    let decoder = FfmpegDecodeEngine::spawn(
        source.open_decoder()?,
        DECODE_BACKLOG,
        Duration::from_millis(args.decode_timeout_ms),
    )?;
    let detector = UslsDetector::new(
        &args.detector_model,
        (args.detector_input, args.detector_input),
        args.min_confidence,
    )?;
    let keypoints = OnnxKeypointRegressor::new(
        &args.keypoint_model,
        (args.keypoint_input, args.keypoint_input),
        args.keypoint_count,
    )?;

    Ok(RelayParts {
        source: Box::new(source),
        decoder: Box::new(decoder),
        detector: Box::new(detector),
        keypoints: Box::new(keypoints),
        resizer: Arc::new(ImageCropResizer::default()),
        mirror: Arc::new(UdpSender::new(args.mirror_addr())?),
        results: Arc::new(UdpSender::new(args.result_addr())?),
    })
}

#[cfg(not(all(feature = "ffmpeg", feature = "onnx")))]
fn build_parts(_args: &Args) -> Result<RelayParts> {
    anyhow::bail!("keypoint-relay was built without the `ffmpeg` and `onnx` features")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();
    tracing::info!(
        "Relaying {} to {} (mirror {}, results {})",
        args.stream_url,
        args.client_ip,
        args.mirror_port,
        args.result_port
    );

    let parts = build_parts(&args)?;
    let handle = start_relay(parts, args.relay_config())?;

    if let Some(port) = args.status_port {
        let stats = handle.stats();
        let host = args.status_host;
        tokio::spawn(async move {
            if let Err(e) = run_status_server(host, port, stats).await {
                tracing::error!("Status server failed: {:#}", e);
            }
        });
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut poll = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Ctrl-C received");
                handle.stop();
                break;
            }
            _ = poll.tick() => {
                if handle.is_finished() {
                    tracing::info!("Relay workers finished");
                    break;
                }
            }
        }
    }

    tokio::task::spawn_blocking(move || handle.join()).await??;

    Ok(())
}

// Ingest worker: pulls packets from the stream, feeds the decoder and mirrors
// the raw bytes to the client.

use crate::pipeline::queue::{HandoffQueue, PushError};
use crate::pipeline::sender::{send_fragmented, DatagramSink, FragmentPacing};
use crate::pipeline::types::{Counters, DecodedFrame, EncodedPacket, PipelineStats, StopToken};
use crate::video::{DecodeEngine, FrameCallback, StreamSource};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct IngestConfig {
    /// Sleep after a failed read before trying again.
    pub read_retry_backoff: Duration,
    pub pacing: FragmentPacing,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            read_retry_backoff: Duration::from_millis(1),
            pacing: FragmentPacing::default(),
        }
    }
}

/// Builds the decode callback. It runs on the decoder's thread and only
/// pushes into the queue; a rejected frame is dropped right here.
pub fn queue_callback(
    queue: Arc<HandoffQueue<DecodedFrame>>,
    stats: Arc<PipelineStats>,
) -> FrameCallback {
    Arc::new(move |frame: DecodedFrame| {
        Counters::bump(&stats.counters.frames_decoded);
        match queue.push(frame) {
            Ok(()) => {}
            Err(PushError::Full(frame)) => {
                Counters::bump(&stats.counters.frames_dropped);
                tracing::warn!("Handoff queue full, dropped frame {}", frame.id);
            }
            Err(PushError::Stopped(frame)) => {
                tracing::debug!("Relay stopping, released frame {}", frame.id);
            }
        }
    })
}

/// Runs until the stream ends or `stop` is set.
///
/// End of stream stops the whole relay. Read errors are retried after
/// `read_retry_backoff`; decode and mirror failures only skip the packet.
pub fn ingest_worker(
    source: &mut dyn StreamSource,
    decoder: &mut dyn DecodeEngine,
    queue: Arc<HandoffQueue<DecodedFrame>>,
    mirror: &dyn DatagramSink,
    stop: StopToken,
    stats: Arc<PipelineStats>,
    config: IngestConfig,
) {
    let on_decoded = queue_callback(queue.clone(), stats.clone());
    tracing::info!("Ingest worker started");

    loop {
        if stop.is_stopped() {
            break;
        }

        let start_inst = Instant::now();
        let packet = match source.next_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                tracing::info!("Stream ended, stopping relay");
                stop.stop();
                queue.stop();
                break;
            }
            Err(e) => {
                Counters::bump(&stats.counters.read_errors);
                tracing::warn!("Stream read failed, retrying: {:#}", e);
                std::thread::sleep(config.read_retry_backoff);
                continue;
            }
        };
        Counters::bump(&stats.counters.packets_read);

        forward_packet(packet, decoder, &on_decoded, mirror, &stats, config.pacing);

        let duration_ms = start_inst.elapsed().as_secs_f64() * 1000.0;
        stats.update_stage("ingest", duration_ms);
    }

    tracing::info!(
        "Ingest worker finished after {} packets",
        stats.counters.packets_read.load(Ordering::Relaxed)
    );
}

fn forward_packet(
    packet: EncodedPacket,
    decoder: &mut dyn DecodeEngine,
    on_decoded: &FrameCallback,
    mirror: &dyn DatagramSink,
    stats: &PipelineStats,
    pacing: FragmentPacing,
) {
    // The decoder takes ownership; the mirror keeps a cheap handle on the bytes.
    let raw = packet.data.clone();

    match decoder.submit(packet, on_decoded.clone()) {
        Ok(()) => Counters::bump(&stats.counters.decode_submitted),
        Err(e) => {
            Counters::bump(&stats.counters.decode_failures);
            tracing::warn!("Decode submit failed, packet skipped: {:#}", e);
        }
    }

    match send_fragmented(mirror, &raw, pacing) {
        Ok(sent) => {
            stats
                .counters
                .fragments_sent
                .fetch_add(sent as u64, Ordering::Relaxed);
        }
        Err(e) => {
            Counters::bump(&stats.counters.send_errors);
            tracing::warn!("Mirror send failed: {:#}", e);
        }
    }
}

use super::{DecodeEngine, FrameCallback};
use crate::pipeline::types::{DecodedFrame, EncodedPacket};
use anyhow::{anyhow, Context, Result};
use crossbeam::channel::{self, SendTimeoutError, Sender};
use image::RgbImage;
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct DecodeJob {
    packet: EncodedPacket,
    on_decoded: FrameCallback,
}

/// Software FFmpeg decoder running on its own thread. Decoded frames are
/// converted to RGB24 and handed to the submitting caller's callback.
pub struct FfmpegDecodeEngine {
    jobs: Option<Sender<DecodeJob>>,
    submit_timeout: Duration,
    worker: Option<JoinHandle<()>>,
}

impl FfmpegDecodeEngine {
    /// `backlog` bounds how many packets may wait for the decoder;
    /// `submit_timeout` bounds how long `submit` waits for a free slot.
    pub fn spawn(
        decoder: ffmpeg_next::codec::decoder::Video,
        backlog: usize,
        submit_timeout: Duration,
    ) -> Result<Self> {
        let (tx, rx) = channel::bounded::<DecodeJob>(backlog.max(1));
        let mut state = DecoderState {
            decoder,
            scaler: None,
            next_frame_id: 0,
        };

        let worker = thread::Builder::new()
            .name("decode".to_string())
            .spawn(move || {
                tracing::info!("Decode engine started");
                for job in rx {
                    if let Err(e) = state.decode(job) {
                        tracing::warn!("Decode failed, frame skipped: {:#}", e);
                    }
                }
                tracing::info!(
                    "Decode engine finished after {} frames",
                    state.next_frame_id
                );
            })
            .context("Failed to spawn decode thread")?;

        Ok(Self {
            jobs: Some(tx),
            submit_timeout,
            worker: Some(worker),
        })
    }
}

impl DecodeEngine for FfmpegDecodeEngine {
    fn submit(&mut self, packet: EncodedPacket, on_decoded: FrameCallback) -> Result<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| anyhow!("Decode engine is shut down"))?;
        jobs.send_timeout(DecodeJob { packet, on_decoded }, self.submit_timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => {
                    anyhow!("Decoder backlog full for {:?}", self.submit_timeout)
                }
                SendTimeoutError::Disconnected(_) => anyhow!("Decode thread exited"),
            })
    }
}

impl Drop for FfmpegDecodeEngine {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Decode thread panicked");
            }
        }
    }
}

struct DecoderState {
    decoder: ffmpeg_next::codec::decoder::Video,
    /// Recreated whenever the decoded format or size changes.
    scaler: Option<(ScalerKey, ffmpeg_next::software::scaling::Context)>,
    next_frame_id: u64,
}

type ScalerKey = (ffmpeg_next::format::Pixel, u32, u32);

// SAFETY: DecoderState is moved into the decode thread once and only ever
// used from there. The raw pointers inside ffmpeg-next types are not shared.
unsafe impl Send for DecoderState {}

impl DecoderState {
    fn decode(&mut self, job: DecodeJob) -> Result<()> {
        let packet = ffmpeg_next::codec::packet::Packet::copy(&job.packet.data);
        self.decoder
            .send_packet(&packet)
            .context("Failed to send packet to decoder")?;

        let mut decoded = ffmpeg_next::util::frame::Video::empty();
        while self.decoder.receive_frame(&mut decoded).is_ok() {
            let image = self.to_rgb(&decoded)?;
            let frame = DecodedFrame::new(self.next_frame_id, image);
            self.next_frame_id += 1;
            (job.on_decoded)(frame);
        }
        Ok(())
    }

    fn to_rgb(&mut self, frame: &ffmpeg_next::util::frame::Video) -> Result<RgbImage> {
        let key = (frame.format(), frame.width(), frame.height());
        if self.scaler.as_ref().map(|(k, _)| *k != key).unwrap_or(true) {
            let scaler = ffmpeg_next::software::scaling::Context::get(
                key.0,
                key.1,
                key.2,
                ffmpeg_next::format::Pixel::RGB24,
                key.1,
                key.2,
                ffmpeg_next::software::scaling::Flags::BILINEAR,
            )
            .context("Failed to create scaler")?;
            self.scaler = Some((key, scaler));
        }
        let (_, scaler) = self
            .scaler
            .as_mut()
            .ok_or_else(|| anyhow!("Scaler unavailable"))?;

        let mut rgb = ffmpeg_next::util::frame::Video::empty();
        scaler.run(frame, &mut rgb).context("Scaler failed")?;
        rgb_frame_to_image(&rgb)
    }
}

/// Copies an RGB24 frame into a tightly packed image, dropping row padding.
fn rgb_frame_to_image(frame: &ffmpeg_next::util::frame::Video) -> Result<RgbImage> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let stride = frame.stride(0);
    let data = frame.data(0);
    let row_len = width * 3;

    let mut buffer = Vec::with_capacity(row_len * height);
    for y in 0..height {
        let start = y * stride;
        let row = data
            .get(start..start + row_len)
            .ok_or_else(|| anyhow!("RGB frame row {} out of bounds", y))?;
        buffer.extend_from_slice(row);
    }

    RgbImage::from_raw(width as u32, height as u32, buffer)
        .ok_or_else(|| anyhow!("Failed to create RgbImage from decoded frame"))
}

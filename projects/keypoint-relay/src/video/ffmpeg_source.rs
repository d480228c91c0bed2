use super::StreamSource;
use crate::pipeline::types::EncodedPacket;
use anyhow::{anyhow, Context, Result};

/// Socket I/O timeout for network inputs, in microseconds.
const SOCKET_TIMEOUT_US: &str = "3000000";

/// Stream source backed by the FFmpeg demuxer (RTSP, files, anything
/// libavformat opens). Only packets of the best video stream are returned.
pub struct FfmpegStreamSource {
    input_ctx: ffmpeg_next::format::context::Input,
    video_stream_index: usize,
    width: u32,
    height: u32,
    reuse_packet: ffmpeg_next::codec::packet::Packet,
}

// SAFETY: FfmpegStreamSource is moved into the ingest thread once and only
// ever used from there. The raw pointers inside ffmpeg-next types are not shared.
unsafe impl Send for FfmpegStreamSource {}

impl FfmpegStreamSource {
    pub fn open(url: &str) -> Result<Self> {
        ffmpeg_next::init().context("Failed to initialize FFmpeg")?;
        ffmpeg_next::format::network::init();

        let mut options = ffmpeg_next::Dictionary::new();
        options.set("rtsp_transport", "tcp");
        options.set("timeout", SOCKET_TIMEOUT_US);

        let input_ctx = ffmpeg_next::format::input_with_dictionary(&url, options)
            .with_context(|| format!("Couldn't open input stream {}", url))?;

        let video_stream = input_ctx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| anyhow!("No video stream found in {}", url))?;
        let video_stream_index = video_stream.index();

        let decoder = ffmpeg_next::codec::context::Context::from_parameters(video_stream.parameters())
            .context("Failed to read video stream parameters")?
            .decoder()
            .video()
            .context("Failed to read video decoder parameters")?;
        let (width, height) = (decoder.width(), decoder.height());

        tracing::info!(
            "FfmpegStreamSource: opened {}, video stream #{} ({}x{}, codec {:?})",
            url,
            video_stream_index,
            width,
            height,
            decoder.id()
        );

        Ok(Self {
            input_ctx,
            video_stream_index,
            width,
            height,
            reuse_packet: ffmpeg_next::codec::packet::Packet::empty(),
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Opens a fresh decoder for the selected video stream.
    pub fn open_decoder(&self) -> Result<ffmpeg_next::codec::decoder::Video> {
        let stream = self
            .input_ctx
            .stream(self.video_stream_index)
            .ok_or_else(|| anyhow!("Video stream #{} vanished", self.video_stream_index))?;
        ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())
            .context("Failed to create decoder context")?
            .decoder()
            .video()
            .context("Failed to open video decoder")
    }
}

impl StreamSource for FfmpegStreamSource {
    fn next_packet(&mut self) -> Result<Option<EncodedPacket>> {
        loop {
            match self.reuse_packet.read(&mut self.input_ctx) {
                Ok(()) => {
                    if self.reuse_packet.stream() != self.video_stream_index {
                        continue;
                    }
                    let data = self.reuse_packet.data().unwrap_or_default();
                    return Ok(Some(EncodedPacket::new(data.to_vec())));
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(None),
                Err(e) => return Err(anyhow!("Read frame failed: {}", e)),
            }
        }
    }
}

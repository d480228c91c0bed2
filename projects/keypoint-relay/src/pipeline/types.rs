use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// One transport-layer access unit pulled from the stream source.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub data: Bytes,
}

impl EncodedPacket {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

/// A decoded RGB24 frame. The queue holds the only reference between the
/// decode callback and the result worker; dropping it releases the buffer.
pub struct DecodedFrame {
    pub id: u64,
    pub image: RgbImage,
}

impl DecodedFrame {
    pub fn new(id: u64, image: RgbImage) -> Self {
        Self { id, image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

impl std::fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("id", &self.id)
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

/// Axis-aligned detection box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: usize,
    pub confidence: f32,
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Detection {
    pub fn new(class_id: usize, confidence: f32, x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            class_id,
            confidence,
            x0,
            y0,
            x1,
            y1,
        }
    }

    /// Rescales a box produced in `from` (detector input) space into `to`
    /// (frame) space.
    pub fn rescaled(&self, from: (u32, u32), to: (u32, u32)) -> Self {
        let sx = to.0 as f32 / from.0.max(1) as f32;
        let sy = to.1 as f32 / from.1.max(1) as f32;
        Self {
            x0: self.x0 * sx,
            y0: self.y0 * sy,
            x1: self.x1 * sx,
            y1: self.y1 * sy,
            ..*self
        }
    }
}

/// Padded crop region in frame pixels. Corners are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Roi {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl Roi {
    pub fn width(&self) -> i32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> i32 {
        self.y1 - self.y0
    }
}

/// Keypoint as emitted by the keypoint model, normalized to the ROI.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedKeypoint {
    pub x: f32,
    pub y: f32,
}

/// Keypoint in absolute frame pixels, at transmission precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keypoint {
    pub x: i16,
    pub y: i16,
}

/// Cooperative cancellation handle shared by the workers and the coordinator.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct StageProgress {
    pub count: u64,
    pub ms_per_frame: f64,
}

/// Counters shared between the workers and the status server.
#[derive(Debug, Default)]
pub struct Counters {
    pub packets_read: AtomicU64,
    pub read_errors: AtomicU64,
    pub decode_submitted: AtomicU64,
    pub decode_failures: AtomicU64,
    pub frames_decoded: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_processed: AtomicU64,
    pub detections: AtomicU64,
    pub misses: AtomicU64,
    pub stage_timeouts: AtomicU64,
    pub results_sent: AtomicU64,
    pub empty_packets_sent: AtomicU64,
    pub fragments_sent: AtomicU64,
    pub send_errors: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        BTreeMap::from([
            ("packets_read", load(&self.packets_read)),
            ("read_errors", load(&self.read_errors)),
            ("decode_submitted", load(&self.decode_submitted)),
            ("decode_failures", load(&self.decode_failures)),
            ("frames_decoded", load(&self.frames_decoded)),
            ("frames_dropped", load(&self.frames_dropped)),
            ("frames_processed", load(&self.frames_processed)),
            ("detections", load(&self.detections)),
            ("misses", load(&self.misses)),
            ("stage_timeouts", load(&self.stage_timeouts)),
            ("results_sent", load(&self.results_sent)),
            ("empty_packets_sent", load(&self.empty_packets_sent)),
            ("fragments_sent", load(&self.fragments_sent)),
            ("send_errors", load(&self.send_errors)),
        ])
    }
}

/// Relay state shared between workers and the status handler
#[derive(Debug)]
pub struct PipelineStats {
    pub counters: Counters,
    pub is_running: AtomicBool,
    /// Timing per stage (e.g., "ingest", "detect", "keypoint", "frame")
    pub stages: RwLock<BTreeMap<String, StageProgress>>,
    pub started_at: DateTime<Utc>,
    pub start_time: Instant,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        let stages = ["ingest", "detect", "keypoint", "frame"]
            .into_iter()
            .map(|name| {
                (
                    name.to_string(),
                    StageProgress {
                        count: 0,
                        ms_per_frame: 0.0,
                    },
                )
            })
            .collect();

        Self {
            counters: Counters::default(),
            is_running: AtomicBool::new(true),
            stages: RwLock::new(stages),
            started_at: Utc::now(),
            start_time: Instant::now(),
        }
    }

    pub fn update_stage(&self, stage: &str, ms_per_frame: f64) {
        if let Ok(mut stages) = self.stages.write() {
            let progress = stages
                .entry(stage.to_string())
                .or_insert(StageProgress {
                    count: 0,
                    ms_per_frame: 0.0,
                });
            progress.count += 1;
            // Simple exponential moving average for smoothing durations
            if progress.ms_per_frame == 0.0 {
                progress.ms_per_frame = ms_per_frame;
            } else {
                progress.ms_per_frame = progress.ms_per_frame * 0.9 + ms_per_frame * 0.1;
            }
        }
    }

    pub fn stage(&self, stage: &str) -> Option<StageProgress> {
        self.stages.read().ok()?.get(stage).cloned()
    }

    pub fn to_status_json(&self) -> serde_json::Value {
        let stages_json: BTreeMap<String, serde_json::Value> = self
            .stages
            .read()
            .map(|stages| {
                stages
                    .iter()
                    .map(|(k, v)| {
                        (
                            k.clone(),
                            serde_json::json!({
                                "count": v.count,
                                "ms_per_frame": v.ms_per_frame,
                                "fps": if v.ms_per_frame > 0.0 { 1000.0 / v.ms_per_frame } else { 0.0 }
                            }),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        serde_json::json!({
            "is_running": self.is_running.load(Ordering::Relaxed),
            "started_at": self.started_at.to_rfc3339(),
            "uptime_secs": self.start_time.elapsed().as_secs_f64(),
            "counters": self.counters.snapshot(),
            "stages": stages_json,
        })
    }
}

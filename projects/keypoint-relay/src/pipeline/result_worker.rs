use crate::inference::{CropResizer, KeypointEngine, ObjectDetector};
use crate::pipeline::deadline::{Deadline, StageError};
use crate::pipeline::geometry::{expand_roi, remap_keypoints, select_best_detection};
use crate::pipeline::queue::{HandoffQueue, QueueError};
use crate::pipeline::sender::DatagramSink;
use crate::pipeline::types::{Counters, DecodedFrame, Detection, PipelineStats, StopToken};
use crate::pipeline::watchdog::{MissWatchdog, DEFAULT_MISS_THRESHOLD};
use crate::pipeline::wire::{encode_empty_result, encode_result};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct ResultConfig {
    pub pop_timeout: Duration,
    /// Upper bound for each of the detection and keypoint stages.
    pub stage_timeout: Duration,
    pub miss_threshold: u32,
}

impl Default for ResultConfig {
    fn default() -> Self {
        Self {
            pop_timeout: Duration::from_millis(10),
            stage_timeout: Duration::from_millis(500),
            miss_threshold: DEFAULT_MISS_THRESHOLD,
        }
    }
}

/// The two inference stages, each on its own engine thread, plus the
/// crop/resize collaborator they share.
pub struct InferenceStages {
    pub detector: Deadline<Box<dyn ObjectDetector>>,
    pub keypoints: Deadline<Box<dyn KeypointEngine>>,
    pub resizer: Arc<dyn CropResizer>,
}

impl InferenceStages {
    pub fn spawn(
        detector: Box<dyn ObjectDetector>,
        keypoints: Box<dyn KeypointEngine>,
        resizer: Arc<dyn CropResizer>,
    ) -> Result<Self> {
        Ok(Self {
            detector: Deadline::spawn("detect", detector)?,
            keypoints: Deadline::spawn("keypoint", keypoints)?,
            resizer,
        })
    }

    /// Deinitializes both engines, waiting up to `grace` for each.
    pub fn shutdown(self, grace: Duration) -> Result<()> {
        let detector = self.detector.shutdown(grace);
        let keypoints = self.keypoints.shutdown(grace);
        detector.and(keypoints)
    }
}

/// Pops frames until the queue is stopped and sends one result packet per
/// detected frame. Misses feed the watchdog, which emits a single empty
/// packet per run of misses longer than the threshold.
///
/// Returns an error only when an inference engine thread is gone; the relay
/// is stopped before returning it.
pub fn result_worker(
    queue: Arc<HandoffQueue<DecodedFrame>>,
    stages: &InferenceStages,
    sink: &dyn DatagramSink,
    stop: StopToken,
    stats: Arc<PipelineStats>,
    config: ResultConfig,
) -> Result<()> {
    let mut watchdog = MissWatchdog::new(config.miss_threshold);
    tracing::info!("Result worker started");

    loop {
        if stop.is_stopped() {
            break;
        }

        let frame = match queue.pop(config.pop_timeout) {
            Ok(frame) => frame,
            Err(QueueError::Timeout) => continue,
            Err(_) => break,
        };

        let frame_id = frame.id;
        let start_inst = Instant::now();

        match process_frame(frame, stages, config.stage_timeout, &stats) {
            Ok(Some(packet)) => {
                Counters::bump(&stats.counters.detections);
                if watchdog.is_armed() {
                    tracing::info!("Detections resumed at frame {}", frame_id);
                }
                watchdog.record_detection();
                match sink.send(&packet) {
                    Ok(()) => Counters::bump(&stats.counters.results_sent),
                    Err(e) => {
                        Counters::bump(&stats.counters.send_errors);
                        tracing::warn!("Result send failed for frame {}: {:#}", frame_id, e);
                    }
                }
            }
            Ok(None) => record_miss(&mut watchdog, sink, &stats),
            Err(StageError::Disconnected(stage)) => {
                tracing::error!("{} engine is gone, stopping relay", stage);
                stop.stop();
                queue.stop();
                return Err(anyhow!("{} engine thread exited unexpectedly", stage));
            }
            Err(e) => {
                if e.is_timeout() {
                    Counters::bump(&stats.counters.stage_timeouts);
                }
                tracing::warn!("Frame {} skipped: {:#}", frame_id, e);
                record_miss(&mut watchdog, sink, &stats);
            }
        }

        Counters::bump(&stats.counters.frames_processed);
        let duration_ms = start_inst.elapsed().as_secs_f64() * 1000.0;
        stats.update_stage("frame", duration_ms);
        tracing::debug!(
            "Frame {} handled in {:.1} ms ({} queued)",
            frame_id,
            duration_ms,
            queue.len()
        );
    }

    tracing::info!(
        "Result worker finished after {} frames",
        stats.counters.frames_processed.load(Ordering::Relaxed)
    );
    Ok(())
}

fn record_miss(watchdog: &mut MissWatchdog, sink: &dyn DatagramSink, stats: &PipelineStats) {
    Counters::bump(&stats.counters.misses);
    if !watchdog.record_miss() {
        return;
    }
    tracing::info!(
        "No detection for {} frames, sending empty result",
        watchdog.miss_count()
    );
    match sink.send(&encode_empty_result()) {
        Ok(()) => Counters::bump(&stats.counters.empty_packets_sent),
        Err(e) => {
            Counters::bump(&stats.counters.send_errors);
            tracing::warn!("Empty result send failed: {:#}", e);
        }
    }
}

/// Detection, ROI, keypoints and encoding for one frame.
/// `Ok(None)` is a plain miss: nothing detected or a degenerate ROI.
fn process_frame(
    frame: DecodedFrame,
    stages: &InferenceStages,
    timeout: Duration,
    stats: &PipelineStats,
) -> Result<Option<Bytes>, StageError> {
    let frame_id = frame.id;
    let frame_size = (frame.width(), frame.height());
    // Shared with the engine threads; released when the last stage lets go.
    let image = Arc::new(frame.image);

    let start_inst = Instant::now();
    let (input_size, groups) = {
        let image = image.clone();
        let resizer = stages.resizer.clone();
        stages.detector.call(timeout, move |detector| {
            let input = resizer.resize(&image, detector.input_size())?;
            let groups = detector.detect(&input)?;
            Ok((input.dimensions(), groups))
        })?
    };
    stats.update_stage("detect", start_inst.elapsed().as_secs_f64() * 1000.0);

    let groups: Vec<Vec<Detection>> = groups
        .iter()
        .map(|group| {
            group
                .iter()
                .map(|d| d.rescaled(input_size, frame_size))
                .collect()
        })
        .collect();

    let Some(best) = select_best_detection(&groups) else {
        return Ok(None);
    };
    let Some(roi) = expand_roi(&best, frame_size.0, frame_size.1) else {
        tracing::warn!("Frame {}: degenerate ROI for {:?}", frame_id, best);
        return Ok(None);
    };

    let start_inst = Instant::now();
    let normalized = {
        let resizer = stages.resizer.clone();
        stages.keypoints.call(timeout, move |engine| {
            let input = resizer.crop_resize(&image, &roi, engine.input_size())?;
            engine.infer(&input)
        })?
    };
    stats.update_stage("keypoint", start_inst.elapsed().as_secs_f64() * 1000.0);

    let keypoints = remap_keypoints(&normalized, &roi);
    let packet = encode_result(&roi, &keypoints).map_err(anyhow::Error::from)?;
    Ok(Some(packet))
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::pipeline::types::NormalizedKeypoint;
    use anyhow::bail;
    use image::RgbImage;
    use std::collections::VecDeque;

    pub enum DetectStep {
        Found(Vec<Vec<Detection>>),
        Nothing,
        Fail,
        Stall(Duration),
    }

    /// Detector that replays a script; once exhausted it detects nothing.
    pub struct ScriptedDetector {
        pub input_size: (u32, u32),
        pub steps: VecDeque<DetectStep>,
    }

    impl ScriptedDetector {
        pub fn new(input_size: (u32, u32), steps: Vec<DetectStep>) -> Self {
            Self {
                input_size,
                steps: steps.into(),
            }
        }
    }

    impl ObjectDetector for ScriptedDetector {
        fn input_size(&self) -> (u32, u32) {
            self.input_size
        }

        fn detect(&mut self, _input: &RgbImage) -> Result<Vec<Vec<Detection>>> {
            match self.steps.pop_front() {
                Some(DetectStep::Found(groups)) => Ok(groups),
                Some(DetectStep::Nothing) | None => Ok(vec![Vec::new()]),
                Some(DetectStep::Fail) => bail!("inference backend error"),
                Some(DetectStep::Stall(duration)) => {
                    std::thread::sleep(duration);
                    Ok(vec![Vec::new()])
                }
            }
        }
    }

    /// Always returns the same normalized keypoints.
    pub struct FixedKeypoints {
        pub input_size: (u32, u32),
        pub points: Vec<NormalizedKeypoint>,
    }

    impl KeypointEngine for FixedKeypoints {
        fn input_size(&self) -> (u32, u32) {
            self.input_size
        }

        fn infer(&mut self, _input: &RgbImage) -> Result<Vec<NormalizedKeypoint>> {
            Ok(self.points.clone())
        }
    }

    pub fn hand_box() -> DetectStep {
        DetectStep::Found(vec![
            vec![Detection::new(0, 0.4, 10.0, 10.0, 40.0, 40.0)],
            vec![Detection::new(1, 0.9, 100.0, 100.0, 200.0, 200.0)],
        ])
    }

    pub fn center_keypoints(count: usize) -> FixedKeypoints {
        FixedKeypoints {
            input_size: (32, 32),
            points: vec![NormalizedKeypoint { x: 0.5, y: 0.5 }; count],
        }
    }
}

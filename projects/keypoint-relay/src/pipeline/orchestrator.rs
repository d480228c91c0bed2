// Relay lifecycle: wires the collaborators together, runs the ingest and
// result workers, and tears everything down in order on shutdown.
//
// Shutdown order: stop token set -> workers leave their loops -> queue
// stopped and cleared -> inference engines deinitialized -> stream closed.

use crate::inference::{CropResizer, KeypointEngine, ObjectDetector};
use crate::pipeline::ingest::{ingest_worker, IngestConfig};
use crate::pipeline::queue::HandoffQueue;
use crate::pipeline::result_worker::{result_worker, InferenceStages, ResultConfig};
use crate::pipeline::sender::DatagramSink;
use crate::pipeline::types::{DecodedFrame, PipelineStats, StopToken};
use crate::video::{DecodeEngine, StreamSource};
use anyhow::{anyhow, Context, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub queue_capacity: usize,
    pub push_timeout: Duration,
    pub ingest: IngestConfig,
    pub results: ResultConfig,
    /// How long each inference engine gets to deinitialize on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            push_timeout: Duration::from_millis(20),
            ingest: IngestConfig::default(),
            results: ResultConfig::default(),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Everything the relay consumes. Ownership moves into the workers.
pub struct RelayParts {
    pub source: Box<dyn StreamSource>,
    pub decoder: Box<dyn DecodeEngine>,
    pub detector: Box<dyn ObjectDetector>,
    pub keypoints: Box<dyn KeypointEngine>,
    pub resizer: Arc<dyn CropResizer>,
    pub mirror: Arc<dyn DatagramSink>,
    pub results: Arc<dyn DatagramSink>,
}

type IngestOutput = (Box<dyn StreamSource>, Box<dyn DecodeEngine>);
type ResultsOutput = (InferenceStages, Result<()>);

/// Stops the whole relay when the owning worker thread exits, including by
/// unwinding, so the other worker never waits on a dead peer.
struct StopOnExit {
    worker: &'static str,
    stop: StopToken,
    queue: Arc<HandoffQueue<DecodedFrame>>,
}

impl Drop for StopOnExit {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::error!("{} worker panicked, stopping relay", self.worker);
        }
        self.stop.stop();
        self.queue.stop();
    }
}

pub struct RelayHandle {
    stop: StopToken,
    queue: Arc<HandoffQueue<DecodedFrame>>,
    stats: Arc<PipelineStats>,
    ingest: Option<JoinHandle<IngestOutput>>,
    results: Option<JoinHandle<ResultsOutput>>,
    shutdown_grace: Duration,
}

/// Spawns the `ingest` and `results` threads and returns immediately.
pub fn start_relay(parts: RelayParts, config: RelayConfig) -> Result<RelayHandle> {
    let RelayParts {
        mut source,
        mut decoder,
        detector,
        keypoints,
        resizer,
        mirror,
        results,
    } = parts;

    let queue = Arc::new(HandoffQueue::new(config.queue_capacity, config.push_timeout));
    let stats = Arc::new(PipelineStats::new());
    let stop = StopToken::new();
    let stages = InferenceStages::spawn(detector, keypoints, resizer)?;

    let results_handle = {
        let queue = queue.clone();
        let stats = stats.clone();
        let stop = stop.clone();
        let result_config = config.results;
        thread::Builder::new()
            .name("results".to_string())
            .spawn(move || {
                let _guard = StopOnExit {
                    worker: "Result",
                    stop: stop.clone(),
                    queue: queue.clone(),
                };
                let result = result_worker(queue, &stages, results.as_ref(), stop, stats, result_config);
                (stages, result)
            })
            .context("Failed to spawn result worker")?
    };

    let ingest_handle = {
        let queue = queue.clone();
        let stats = stats.clone();
        let stop = stop.clone();
        let ingest_config = config.ingest;
        thread::Builder::new()
            .name("ingest".to_string())
            .spawn(move || {
                let _guard = StopOnExit {
                    worker: "Ingest",
                    stop: stop.clone(),
                    queue: queue.clone(),
                };
                ingest_worker(
                    source.as_mut(),
                    decoder.as_mut(),
                    queue,
                    mirror.as_ref(),
                    stop,
                    stats,
                    ingest_config,
                );
                (source, decoder)
            })
    };
    let ingest_handle = match ingest_handle {
        Ok(handle) => handle,
        Err(e) => {
            // The result worker is already running; release it.
            stop.stop();
            queue.stop();
            return Err(e).context("Failed to spawn ingest worker");
        }
    };

    tracing::info!(
        "Relay started (queue capacity {}, stage timeout {:?})",
        queue.capacity(),
        config.results.stage_timeout
    );

    Ok(RelayHandle {
        stop,
        queue,
        stats,
        ingest: Some(ingest_handle),
        results: Some(results_handle),
        shutdown_grace: config.shutdown_grace,
    })
}

impl RelayHandle {
    /// Idempotent. Workers notice at their next loop iteration.
    pub fn stop(&self) {
        tracing::info!("Stopping relay");
        self.stop.stop();
        self.queue.stop();
        self.stats.is_running.store(false, Ordering::Relaxed);
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn is_finished(&self) -> bool {
        worker_finished(&self.ingest) && worker_finished(&self.results)
    }

    /// Waits for both workers and releases everything they owned.
    /// A worker failure is returned only after cleanup has finished.
    pub fn join(mut self) -> Result<()> {
        let mut worker_error: Option<anyhow::Error> = None;

        let ingest_parts = match self.ingest.take().map(|h| h.join()) {
            Some(Ok(parts)) => Some(parts),
            Some(Err(_)) => {
                worker_error.get_or_insert(anyhow!("Ingest worker panicked"));
                None
            }
            None => None,
        };

        let stages = match self.results.take().map(|h| h.join()) {
            Some(Ok((stages, result))) => {
                if let Err(e) = result {
                    worker_error.get_or_insert(e);
                }
                Some(stages)
            }
            Some(Err(_)) => {
                worker_error.get_or_insert(anyhow!("Result worker panicked"));
                None
            }
            None => None,
        };

        self.stop();
        match self.queue.clear() {
            Ok(released) => tracing::info!(
                "Released {} queued frames ({} dropped while the queue was full)",
                released,
                self.queue.dropped()
            ),
            Err(e) => tracing::warn!("Queue not cleared: {}", e),
        }

        if let Some(stages) = stages {
            if let Err(e) = stages.shutdown(self.shutdown_grace) {
                tracing::warn!("Inference shutdown incomplete: {:#}", e);
            }
        }

        // Closing the decoder waits for its in-flight frames; the stopped
        // queue rejects them.
        drop(ingest_parts);
        tracing::info!("Relay shut down");

        match worker_error {
            Some(e) => {
                tracing::error!("Relay worker failed: {:#}", e);
                Err(e)
            }
            None => Ok(()),
        }
    }
}

fn worker_finished<T>(handle: &Option<JoinHandle<T>>) -> bool {
    handle.as_ref().map_or(true, |h| h.is_finished())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::imaging::ImageCropResizer;
    use crate::pipeline::ingest::testing::{EndlessSource, InlineDecoder, ScriptedSource};
    use crate::pipeline::result_worker::testing::{
        center_keypoints, hand_box, DetectStep, ScriptedDetector,
    };
    use crate::pipeline::sender::testing::RecordingSink;
    use crate::pipeline::sender::FragmentPacing;
    use crate::pipeline::types::{Detection, EncodedPacket};
    use image::RgbImage;
    use std::time::Instant;

    fn parts(
        source: Box<dyn StreamSource>,
        detector: Box<dyn ObjectDetector>,
    ) -> (RelayParts, Arc<RecordingSink>, Arc<RecordingSink>) {
        let mirror = Arc::new(RecordingSink::default());
        let results = Arc::new(RecordingSink::default());
        let parts = RelayParts {
            source,
            decoder: Box::new(InlineDecoder::new((64, 48))),
            detector,
            keypoints: Box::new(center_keypoints(21)),
            resizer: Arc::new(ImageCropResizer::default()),
            mirror: mirror.clone(),
            results: results.clone(),
        };
        (parts, mirror, results)
    }

    fn test_config() -> RelayConfig {
        RelayConfig {
            queue_capacity: 8,
            push_timeout: Duration::from_millis(5),
            ingest: IngestConfig {
                read_retry_backoff: Duration::from_millis(1),
                pacing: FragmentPacing::disabled(),
            },
            results: ResultConfig {
                pop_timeout: Duration::from_millis(5),
                stage_timeout: Duration::from_millis(200),
                miss_threshold: 10,
            },
            shutdown_grace: Duration::from_secs(1),
        }
    }

    fn wait_finished(handle: &RelayHandle) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_finished() {
            assert!(Instant::now() < deadline, "relay did not finish");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_stream_end_shuts_relay_down() {
        let (parts, mirror, _) = parts(
            Box::new(ScriptedSource::packets(5, 2000)),
            Box::new(ScriptedDetector::new((64, 48), vec![hand_box()])),
        );
        let handle = start_relay(parts, test_config()).unwrap();
        let stats = handle.stats();

        wait_finished(&handle);
        handle.join().unwrap();

        assert_eq!(mirror.len(), 10);
        assert_eq!(stats.counters.packets_read.load(Ordering::Relaxed), 5);
        assert!(stats.counters.frames_processed.load(Ordering::Relaxed) <= 5);
        assert!(!stats.is_running.load(Ordering::Relaxed));
    }

    #[test]
    fn test_stop_ends_live_stream() {
        let (parts, mirror, results) = parts(
            Box::new(EndlessSource),
            Box::new(ScriptedDetector::new((64, 48), found_steps(1000))),
        );
        let handle = start_relay(parts, test_config()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while results.len() == 0 {
            assert!(Instant::now() < deadline, "no result packet sent");
            thread::sleep(Duration::from_millis(2));
        }
        assert!(!handle.is_finished());

        handle.stop();
        handle.stop();
        wait_finished(&handle);
        handle.join().unwrap();

        assert!(mirror.len() > 0);
        let packet = &results.take()[0];
        // Box (10,10)-(30,30) expands to (5,5)-(35,35).
        assert_eq!(i32::from_le_bytes(packet[40..44].try_into().unwrap()), 5);
        assert_eq!(i32::from_le_bytes(packet[52..56].try_into().unwrap()), 35);
    }

    #[test]
    fn test_engine_crash_is_reported_after_cleanup() {
        struct CrashingDetector;
        impl ObjectDetector for CrashingDetector {
            fn input_size(&self) -> (u32, u32) {
                (64, 48)
            }
            fn detect(&mut self, _input: &RgbImage) -> Result<Vec<Vec<Detection>>> {
                panic!("driver fault");
            }
        }

        let (parts, _, _) = parts(Box::new(EndlessSource), Box::new(CrashingDetector));
        let handle = start_relay(parts, test_config()).unwrap();
        let stats = handle.stats();

        wait_finished(&handle);
        let err = handle.join().unwrap_err();
        assert!(err.to_string().contains("detect"));
        assert!(!stats.is_running.load(Ordering::Relaxed));
    }

    fn found_steps(count: usize) -> Vec<DetectStep> {
        (0..count)
            .map(|_| {
                DetectStep::Found(vec![vec![Detection::new(0, 0.9, 10.0, 10.0, 30.0, 30.0)]])
            })
            .collect()
    }

    #[test]
    fn test_ingest_panic_stops_result_worker() {
        struct FaultySource {
            remaining: u32,
        }
        impl StreamSource for FaultySource {
            fn next_packet(&mut self) -> Result<Option<EncodedPacket>> {
                if self.remaining == 0 {
                    panic!("demuxer fault");
                }
                self.remaining -= 1;
                Ok(Some(EncodedPacket::new(vec![1u8; 16])))
            }
        }

        let (parts, _, _) = parts(
            Box::new(FaultySource { remaining: 3 }),
            Box::new(ScriptedDetector::new((64, 48), vec![hand_box()])),
        );
        let handle = start_relay(parts, test_config()).unwrap();
        let stats = handle.stats();

        wait_finished(&handle);
        let err = handle.join().unwrap_err();
        assert!(err.to_string().contains("Ingest worker panicked"));
        assert_eq!(stats.counters.packets_read.load(Ordering::Relaxed), 3);
        assert!(!stats.is_running.load(Ordering::Relaxed));
    }

    #[test]
    fn test_result_panic_stops_ingest_worker() {
        struct FaultySink;
        impl DatagramSink for FaultySink {
            fn send(&self, _datagram: &[u8]) -> Result<()> {
                panic!("socket fault");
            }
        }

        let (mut parts, mirror, _) = parts(
            Box::new(EndlessSource),
            Box::new(ScriptedDetector::new((64, 48), found_steps(1000))),
        );
        parts.results = Arc::new(FaultySink);
        let handle = start_relay(parts, test_config()).unwrap();

        wait_finished(&handle);
        let err = handle.join().unwrap_err();
        assert!(err.to_string().contains("Result worker panicked"));
        assert!(mirror.len() > 0);
    }
}

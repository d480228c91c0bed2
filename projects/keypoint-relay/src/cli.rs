use crate::pipeline::ingest::IngestConfig;
use crate::pipeline::orchestrator::RelayConfig;
use crate::pipeline::result_worker::ResultConfig;
use crate::pipeline::sender::FragmentPacing;
use crate::pipeline::wire::{DEFAULT_MIRROR_PORT, DEFAULT_RESULT_PORT};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Stream to relay
    #[arg(default_value = "rtsp://192.168.30.20/", env = "KEYPOINT_RELAY_STREAM_URL")]
    pub stream_url: String,

    /// Client receiving the mirrored stream and the results
    #[arg(default_value = "192.168.30.36", env = "KEYPOINT_RELAY_CLIENT_IP")]
    pub client_ip: IpAddr,

    /// UDP port for raw-frame fragments
    #[arg(long, default_value_t = DEFAULT_MIRROR_PORT, env = "KEYPOINT_RELAY_MIRROR_PORT")]
    pub mirror_port: u16,

    /// UDP port for result packets
    #[arg(long, default_value_t = DEFAULT_RESULT_PORT, env = "KEYPOINT_RELAY_RESULT_PORT")]
    pub result_port: u16,

    #[arg(long, default_value = "./model/hand.onnx", env = "KEYPOINT_RELAY_DETECTOR_MODEL")]
    pub detector_model: String,

    /// Square input size of the detector
    #[arg(long, default_value_t = 416, env = "KEYPOINT_RELAY_DETECTOR_INPUT")]
    pub detector_input: u32,

    /// Detections below this confidence are discarded
    #[arg(long, default_value_t = 0.0, env = "KEYPOINT_RELAY_MIN_CONFIDENCE")]
    pub min_confidence: f32,

    #[arg(
        long,
        default_value = "./model/hand_keypoint.onnx",
        env = "KEYPOINT_RELAY_KEYPOINT_MODEL"
    )]
    pub keypoint_model: String,

    /// Square input size of the keypoint model
    #[arg(long, default_value_t = 256, env = "KEYPOINT_RELAY_KEYPOINT_INPUT")]
    pub keypoint_input: u32,

    #[arg(long, default_value_t = 21, env = "KEYPOINT_RELAY_KEYPOINT_COUNT")]
    pub keypoint_count: usize,

    #[arg(long, default_value_t = 1000, env = "KEYPOINT_RELAY_QUEUE_CAPACITY")]
    pub queue_capacity: usize,

    /// How long a decoded frame waits for queue space before it is dropped
    #[arg(long, default_value_t = 20, env = "KEYPOINT_RELAY_PUSH_TIMEOUT_MS")]
    pub push_timeout_ms: u64,

    #[arg(long, default_value_t = 10, env = "KEYPOINT_RELAY_POP_TIMEOUT_MS")]
    pub pop_timeout_ms: u64,

    /// Upper bound for each inference stage of a frame
    #[arg(long, default_value_t = 500, env = "KEYPOINT_RELAY_STAGE_TIMEOUT_MS")]
    pub stage_timeout_ms: u64,

    /// How long a packet waits for room in the decoder backlog
    #[arg(long, default_value_t = 200, env = "KEYPOINT_RELAY_DECODE_TIMEOUT_MS")]
    pub decode_timeout_ms: u64,

    /// Consecutive misses tolerated before an empty result is sent
    #[arg(long, default_value_t = 10, env = "KEYPOINT_RELAY_MISS_THRESHOLD")]
    pub miss_threshold: u32,

    #[arg(long, default_value_t = 1, env = "KEYPOINT_RELAY_READ_RETRY_MS")]
    pub read_retry_ms: u64,

    /// Pause after this many mirror fragments; 0 disables pacing
    #[arg(long, default_value_t = 4, env = "KEYPOINT_RELAY_PACE_EVERY")]
    pub pace_every: usize,

    #[arg(long, default_value_t = 1000, env = "KEYPOINT_RELAY_PACE_PAUSE_US")]
    pub pace_pause_us: u64,

    /// Host for the status server
    #[arg(long, default_value = "127.0.0.1", env = "KEYPOINT_RELAY_STATUS_HOST")]
    pub status_host: IpAddr,

    /// Port for the status server; disabled when absent
    #[arg(long, env = "KEYPOINT_RELAY_STATUS_PORT")]
    pub status_port: Option<u16>,

    #[arg(long, default_value_t = 2000, env = "KEYPOINT_RELAY_SHUTDOWN_GRACE_MS")]
    pub shutdown_grace_ms: u64,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn mirror_addr(&self) -> SocketAddr {
        SocketAddr::new(self.client_ip, self.mirror_port)
    }

    pub fn result_addr(&self) -> SocketAddr {
        SocketAddr::new(self.client_ip, self.result_port)
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            queue_capacity: self.queue_capacity,
            push_timeout: Duration::from_millis(self.push_timeout_ms),
            ingest: IngestConfig {
                read_retry_backoff: Duration::from_millis(self.read_retry_ms),
                pacing: FragmentPacing {
                    every: self.pace_every,
                    pause: Duration::from_micros(self.pace_pause_us),
                },
            },
            results: ResultConfig {
                pop_timeout: Duration::from_millis(self.pop_timeout_ms),
                stage_timeout: Duration::from_millis(self.stage_timeout_ms),
                miss_threshold: self.miss_threshold,
            },
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}

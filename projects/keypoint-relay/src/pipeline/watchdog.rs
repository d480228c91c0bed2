pub const DEFAULT_MISS_THRESHOLD: u32 = 10;

/// Debounces "no detection" notifications for one result stream.
///
/// Owned by the result worker; never shared across threads.
#[derive(Debug, Clone)]
pub struct MissWatchdog {
    miss_count: u32,
    armed: bool,
    threshold: u32,
}

impl Default for MissWatchdog {
    fn default() -> Self {
        Self::new(DEFAULT_MISS_THRESHOLD)
    }
}

impl MissWatchdog {
    pub fn new(threshold: u32) -> Self {
        Self {
            miss_count: 0,
            armed: false,
            threshold,
        }
    }

    pub fn record_detection(&mut self) {
        self.miss_count = 0;
        self.armed = false;
    }

    /// Returns `true` exactly once per run of misses longer than the threshold.
    pub fn record_miss(&mut self) -> bool {
        self.miss_count = self.miss_count.saturating_add(1);
        if self.miss_count > self.threshold && !self.armed {
            self.armed = true;
            return true;
        }
        false
    }

    pub fn miss_count(&self) -> u32 {
        self.miss_count
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

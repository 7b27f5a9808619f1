//! # Rate Monitors
//!
//! [`RateMeter`] measures bytes/sec over a short sampling interval and
//! answers the throttle's "would one more packet exceed the rate" question
//! without committing the bytes. [`ThroughputMeter`] is a coarse sampled
//! logger for channel loops.

use quanta::Instant;
use std::time::Duration;

// ─── RateMeter ──────────────────────────────────────────────────────────────

/// Windowed byte/message rate monitor.
pub struct RateMeter {
    interval: Duration,
    /// Check the clock only every `sample + 1` calls to `elapsed`.
    sample: u32,
    sample_count: u32,
    bytes: u64,
    msgs: u64,
    window_start: Instant,
}

impl RateMeter {
    pub fn new(interval_us: u64) -> Self {
        Self::with_sampling(interval_us, 0)
    }

    /// `sample` skips that many `elapsed` calls between clock reads; zero
    /// reads the clock every time.
    pub fn with_sampling(interval_us: u64, sample: u32) -> Self {
        RateMeter {
            interval: Duration::from_micros(interval_us),
            sample,
            sample_count: 0,
            bytes: 0,
            msgs: 0,
            window_start: Instant::now(),
        }
    }

    /// Account bytes sent or received in this window.
    pub fn update(&mut self, bytes: usize) {
        self.bytes += bytes as u64;
        self.msgs += 1;
    }

    /// Whether the sampling interval has passed since the window started.
    pub fn elapsed(&mut self) -> bool {
        self.sample_count += 1;
        if self.sample_count <= self.sample {
            return false;
        }
        self.sample_count = 0;
        self.window_start.elapsed() >= self.interval
    }

    /// Rate the window would show if `extra` more bytes were sent now.
    pub fn try_bytes_per_second(&self, extra: usize) -> f64 {
        let nanos = self.window_start.elapsed().as_nanos().max(1) as f64;
        1e9 * (self.bytes + extra as u64) as f64 / nanos
    }

    pub fn bytes_per_second(&self) -> f64 {
        let nanos = self.window_start.elapsed().as_nanos().max(1) as f64;
        1e9 * self.bytes as f64 / nanos
    }

    pub fn messages_per_second(&self) -> f64 {
        let nanos = self.window_start.elapsed().as_nanos().max(1) as f64;
        1e9 * self.msgs as f64 / nanos
    }

    /// Start a fresh window.
    pub fn clear(&mut self) {
        self.bytes = 0;
        self.msgs = 0;
        self.window_start = Instant::now();
    }
}

// ─── ThroughputMeter ────────────────────────────────────────────────────────

/// Sampled throughput logger: reports MB/s and msg/s through `tracing` once
/// per interval, checking the clock only on every `(sample + 1)`-th add.
pub struct ThroughputMeter {
    name: &'static str,
    interval: Duration,
    /// Power-of-two-minus-one sampling mask.
    mask: u32,
    count: u32,
    bytes: u64,
    msgs: u64,
    window_start: Instant,
}

impl ThroughputMeter {
    pub fn new(name: &'static str, interval_ms: u64, sample: u32) -> Self {
        ThroughputMeter {
            name,
            interval: Duration::from_millis(interval_ms),
            mask: (sample + 1).next_power_of_two() - 1,
            count: 0,
            bytes: 0,
            msgs: 0,
            window_start: Instant::now(),
        }
    }

    pub fn add(&mut self, bytes: usize) {
        self.bytes += bytes as u64;
        self.msgs += 1;
        self.count = self.count.wrapping_add(1);
        if self.count & self.mask != self.mask {
            return;
        }
        let elapsed = self.window_start.elapsed();
        if elapsed >= self.interval {
            let secs = elapsed.as_secs_f64();
            tracing::debug!(
                meter = self.name,
                mb_per_sec = self.bytes as f64 / secs / 1e6,
                msg_per_sec = self.msgs as f64 / secs,
                "throughput"
            );
            self.bytes = 0;
            self.msgs = 0;
            self.window_start = Instant::now();
        }
    }
}

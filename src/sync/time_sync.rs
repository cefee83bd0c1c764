//! Drift factor estimation and start gating
//!
//! Every TIME reply contributes a `(local_ms, server_ms)` sample to a sliding
//! window. The ratio of server to local elapsed time over that window is the
//! playback speed correction handed to the resampler. It is only recomputed at
//! window boundaries so single noisy samples never move it.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SyncConfig;

/// One TIME round trip mapped onto both clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSample {
    pub local_ms: i64,
    pub server_ms: i64,
}

/// Where the playback speed comes from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FactorStrategy {
    /// Measured over the sample window
    Dynamic,
    /// Constant, regardless of measurements
    Fixed(f64),
}

/// What to do with the next chunk
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncDecision {
    /// Stream already started; play at this speed
    Play { factor: f64 },
    /// First chunk of the stream: wait once, then start
    Wait(Duration),
    /// Chunk is already late by this many ms
    DropLate(i64),
    /// Delay beyond the sanity ceiling
    DropImplausible(i64),
    /// No TIME reply seen yet
    DropNoClock,
}

impl SyncDecision {
    pub fn is_drop(&self) -> bool {
        matches!(
            self,
            SyncDecision::DropLate(_) | SyncDecision::DropImplausible(_) | SyncDecision::DropNoClock
        )
    }
}

#[derive(Debug)]
pub struct TimeSync {
    samples: VecDeque<TimeSample>,
    interval: usize,
    update_count: u64,
    active: bool,
    strategy: FactorStrategy,
    factor: f64,
    /// `buffer_ms + latency` from the last server settings
    message_buffer_delay_ms: i64,
    processing_lag_ms: i64,
    max_start_delay_ms: i64,
    started: bool,
}

impl TimeSync {
    pub fn new(config: &SyncConfig) -> Self {
        let strategy = match config.fixed_factor {
            Some(factor) => FactorStrategy::Fixed(factor),
            None => FactorStrategy::Dynamic,
        };
        let interval = config.interval.max(2);
        Self {
            samples: VecDeque::with_capacity(interval),
            interval,
            update_count: 0,
            active: false,
            strategy,
            factor: initial_factor(strategy),
            message_buffer_delay_ms: 0,
            processing_lag_ms: config.processing_lag_ms,
            max_start_delay_ms: config.max_start_delay_ms,
            started: false,
        }
    }

    /// A new stream starts: gate the next chunk again and drop the speed
    /// correction. Samples are kept since they describe the clocks, not the
    /// stream.
    pub fn begin(&mut self) {
        self.started = false;
        self.factor = initial_factor(self.strategy);
    }

    /// Forget everything learned on the current connection
    pub fn reset(&mut self) {
        self.samples.clear();
        self.update_count = 0;
        self.active = false;
        self.begin();
    }

    pub fn set_message_buffer_delay(&mut self, delay_ms: i64) {
        self.message_buffer_delay_ms = delay_ms;
    }

    pub fn message_buffer_delay_ms(&self) -> i64 {
        self.message_buffer_delay_ms
    }

    pub fn update_server_time(&mut self, local_ms: i64, server_ms: i64) {
        if self.samples.len() == self.interval {
            self.samples.pop_front();
        }
        self.samples.push_back(TimeSample { local_ms, server_ms });
        self.update_count += 1;
        self.active = true;
    }

    pub fn samples(&self) -> impl Iterator<Item = &TimeSample> {
        self.samples.iter()
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    /// True once per window boundary; the caller should recompute the factor
    pub fn is_sync(&mut self) -> bool {
        let fire =
            self.active && self.update_count > 2 && self.update_count % self.interval as u64 == 0;
        if fire {
            self.active = false;
        }
        fire
    }

    /// Speed correction over the current window
    pub fn factor(&self) -> f64 {
        if let FactorStrategy::Fixed(factor) = self.strategy {
            return factor;
        }
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 1.0;
        };
        if self.samples.len() < 2 {
            return 1.0;
        }
        let local_span = last.local_ms - first.local_ms;
        let server_span = last.server_ms - first.server_ms;
        if local_span == 0 || server_span == 0 {
            tracing::warn!(
                "Degenerate time window (local {} ms, server {} ms), keeping factor 1.0",
                local_span,
                server_span
            );
            return 1.0;
        }
        server_span as f64 / local_span as f64
    }

    /// Factor currently applied to playback
    pub fn current_factor(&self) -> f64 {
        self.factor
    }

    pub fn refresh_factor(&mut self) -> f64 {
        self.factor = self.factor();
        tracing::debug!("Playback factor {:.5}", self.factor);
        self.factor
    }

    pub fn start_delay_ms(&self) -> i64 {
        (self.message_buffer_delay_ms - self.processing_lag_ms).max(0)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn mark_started(&mut self) {
        self.started = true;
    }

    /// Classify the one-time start delay of a stream
    pub fn synchronize_on_start(&self, delay_ms: i64) -> SyncDecision {
        if delay_ms < 0 {
            SyncDecision::DropLate(-delay_ms)
        } else if delay_ms > self.max_start_delay_ms {
            SyncDecision::DropImplausible(delay_ms)
        } else {
            SyncDecision::Wait(Duration::from_millis(delay_ms as u64))
        }
    }

    /// Decide how to treat a chunk due at `chunk_ms` server time.
    ///
    /// Before the stream has started this gates on the start delay. After
    /// that it yields the playback factor, recomputed at window boundaries.
    pub fn synchronize(&mut self, chunk_ms: i64, server_now_ms: Option<i64>) -> SyncDecision {
        if self.started {
            if self.is_sync() {
                self.refresh_factor();
            }
            return SyncDecision::Play {
                factor: self.factor,
            };
        }
        let Some(server_now_ms) = server_now_ms else {
            return SyncDecision::DropNoClock;
        };
        let delay_ms = chunk_ms - server_now_ms + self.start_delay_ms();
        self.synchronize_on_start(delay_ms)
    }
}

/// Thread-safe handle to the synchronizer
pub type SharedTimeSync = Arc<Mutex<TimeSync>>;

fn initial_factor(strategy: FactorStrategy) -> f64 {
    match strategy {
        FactorStrategy::Fixed(factor) => factor,
        FactorStrategy::Dynamic => 1.0,
    }
}

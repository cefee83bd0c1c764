//! Clock sources and the client/server clock model
//!
//! The server's wall clock is never applied to the local system. Instead each
//! TIME round trip yields an offset between local wall-clock milliseconds and
//! server milliseconds, and the current server time is estimated from local
//! time plus that offset.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::protocol::TimeVal;

/// Source of wall-clock and monotonic time
pub trait Clock: Send + Sync {
    /// Wall-clock time
    fn now(&self) -> TimeVal;

    /// Monotonic milliseconds since an arbitrary epoch
    fn millis(&self) -> u64;

    /// Block the calling thread
    fn sleep(&self, duration: Duration);
}

/// Thread-safe handle to a clock
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by the operating system
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> TimeVal {
        TimeVal::now()
    }

    fn millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock that only moves when told to; sleeping advances it instantly.
///
/// Used by tests and simulations to make start delays deterministic.
pub struct ManualClock {
    state: Mutex<ManualState>,
}

struct ManualState {
    now_us: i64,
    millis: u64,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new(start: TimeVal) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now_us: start.as_micros(),
                millis: 0,
                sleeps: Vec::new(),
            }),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.now_us += duration.as_micros() as i64;
        state.millis += duration.as_millis() as u64;
    }

    /// Step the wall clock alone, as a time daemon would
    pub fn step_wall(&self, micros: i64) {
        self.state.lock().now_us += micros;
    }

    /// Every sleep requested so far
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().sleeps.clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimeVal {
        TimeVal::from_micros(self.state.lock().now_us)
    }

    fn millis(&self) -> u64 {
        self.state.lock().millis
    }

    fn sleep(&self, duration: Duration) {
        self.state.lock().sleeps.push(duration);
        self.advance(duration);
    }
}

/// Last measured relation between local and server time
#[derive(Debug, Clone, Default)]
pub struct ClockModel {
    /// server - local, in milliseconds
    offset_ms: Option<i64>,
    round_trip_ms: Option<i64>,
    updates: u64,
}

impl ClockModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a TIME reply.
    ///
    /// `server_sent` is the server's send time from the base header,
    /// `local_received` the local receive stamp and `latency` the
    /// client-to-server transit the server measured for our probe.
    /// Returns the estimated server time at `local_received`, in ms.
    pub fn update(&mut self, server_sent: TimeVal, local_received: TimeVal, latency: TimeVal) -> i64 {
        let latency_us = latency.as_micros();
        let back_us = local_received - server_sent;
        let offset_us = (latency_us - back_us) / 2;
        let offset_ms = offset_us.div_euclid(1000);

        self.offset_ms = Some(offset_ms);
        self.round_trip_ms = Some((latency_us + back_us) / 1000);
        self.updates += 1;

        tracing::debug!(
            "Time difference to server: {} ms (round trip {} ms)",
            offset_ms,
            (latency_us + back_us) / 1000
        );
        local_received.as_millis() + offset_ms
    }

    /// Estimated current server time in milliseconds, once a reply was seen
    pub fn server_now_ms(&self, local_now: TimeVal) -> Option<i64> {
        self.offset_ms.map(|offset| local_now.as_millis() + offset)
    }

    pub fn offset_ms(&self) -> Option<i64> {
        self.offset_ms
    }

    pub fn round_trip_ms(&self) -> Option<i64> {
        self.round_trip_ms
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn is_synchronized(&self) -> bool {
        self.offset_ms.is_some()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Thread-safe handle to the clock model
pub type SharedClockModel = Arc<parking_lot::RwLock<ClockModel>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_symmetric_path() {
        let mut model = ClockModel::new();
        assert_eq!(model.server_now_ms(TimeVal::new(10, 0)), None);

        // server clock 5 s ahead, 10 ms each way:
        // probe sent at local 100.000, server receives at 105.010 => latency 5.010 s
        // server replies at 105.010, client receives at local 100.020
        let latency = TimeVal::from_millis(5_010);
        let server_sent = TimeVal::from_millis(105_010);
        let local_received = TimeVal::from_millis(100_020);
        let server_at_receipt = model.update(server_sent, local_received, latency);

        assert_eq!(model.offset_ms(), Some(5_000));
        assert_eq!(model.round_trip_ms(), Some(20));
        assert_eq!(server_at_receipt, 105_020);
        assert_eq!(model.server_now_ms(TimeVal::from_millis(101_000)), Some(106_000));
    }

    #[test]
    fn test_offset_behind() {
        let mut model = ClockModel::new();
        // server 2 s behind, zero transit
        model.update(
            TimeVal::from_millis(8_000),
            TimeVal::from_millis(10_000),
            TimeVal::from_millis(-2_000),
        );
        assert_eq!(model.offset_ms(), Some(-2_000));
        assert!(model.is_synchronized());
        model.reset();
        assert!(!model.is_synchronized());
    }

    #[test]
    fn test_manual_clock_sleep_advances() {
        let clock = ManualClock::new(TimeVal::new(100, 0));
        clock.sleep(Duration::from_millis(30));
        assert_eq!(clock.millis(), 30);
        assert_eq!(clock.now(), TimeVal::new(100, 30_000));
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(30)]);
    }
}

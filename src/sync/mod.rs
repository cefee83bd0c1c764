//! Clock synchronization with the server

pub mod clock;
pub mod time_sync;

pub use clock::{Clock, ClockModel, ManualClock, SharedClock, SharedClockModel, SystemClock};
pub use time_sync::{FactorStrategy, SharedTimeSync, SyncDecision, TimeSample, TimeSync};

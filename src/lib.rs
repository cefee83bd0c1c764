//! # Snapcast Client
//!
//! Synchronized multi-room audio playback from a Snapcast server.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              SNAPCAST SERVER                                 │
//! │      Frames: [BaseMessage 26 bytes | payload]  (TCP, little-endian)          │
//! └─────────────────────────────────────┬───────────────────────────────────────┘
//!                                       │ TCP over LAN
//!                                       ▼
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                                 CLIENT                                       │
//! │  ┌─────────────────────────────────────────────────────────────────────┐   │
//! │  │            Session (network::session) - tokio task                  │   │
//! │  │   Hello ──► read loop ──► dispatch by type ──► TIME probe / second  │   │
//! │  └──────┬───────────────┬───────────────────┬──────────────────┬──────┘   │
//! │         │ CodecHeader   │ WireChunk         │ ServerSettings   │ Time     │
//! │         ▼               ▼                   ▼                  ▼          │
//! │  ┌─────────────┐ ┌─────────────────┐ ┌─────────────┐ ┌─────────────────┐  │
//! │  │ StreamSpec  │ │ Pipeline writer │ │VolumeControl│ │ ClockModel      │  │
//! │  │ (Arc)       │ │ (audio::buffer) │ │             │ │ TimeSync        │  │
//! │  └─────────────┘ └────────┬────────┘ └──────┬──────┘ └────────┬────────┘  │
//! │                           │ bytes ring +     │                 │           │
//! │                           │ header queue     │                 │           │
//! │                           ▼                  │                 │           │
//! │  ┌─────────────────────────────────────────────────────────────────────┐   │
//! │  │        Output driver (audio::output) - "snap-output" thread         │   │
//! │  │  pop ──► start gate / drift ──► decode ──► resample ──► volume      │   │
//! │  └─────────────────────────────────┬───────────────────────────────────┘   │
//! │                                    ▼                                       │
//! │                          ┌───────────────────┐                             │
//! │                          │  Sink (cpal)      │                             │
//! │                          └───────────────────┘                             │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod sync;

pub use client::SnapClient;
pub use config::ClientConfig;
pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default TCP port of the Snapcast stream server
    pub const DEFAULT_SERVER_PORT: u16 = 1704;

    /// Size of the fixed message envelope
    pub const BASE_MESSAGE_SIZE: usize = 26;

    /// Size of a TIME payload
    pub const TIME_MESSAGE_SIZE: usize = 8;

    /// Largest payload accepted before the stream is considered out of sync
    pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

    /// Stream protocol version announced in Hello
    pub const PROTOCOL_VERSION: u32 = 2;

    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    pub const DEFAULT_BITS_PER_SAMPLE: u16 = 16;

    /// Local decode and output latency subtracted from the start delay
    pub const DEFAULT_PROCESSING_LAG_MS: i64 = 172;

    /// Time samples per drift factor window
    pub const DEFAULT_SYNC_INTERVAL: usize = 10;

    /// Start delays above this are treated as a clock fault
    pub const MAX_START_DELAY_MS: i64 = 100_000;

    pub const TIME_PROBE_INTERVAL_MS: u64 = 1000;

    /// Pipeline byte capacity with extended memory
    pub const BUFFER_SIZE_LARGE: usize = 32 * 1024;

    /// Pipeline byte capacity without extended memory
    pub const BUFFER_SIZE_SMALL: usize = 10 * 1024;

    /// Fill percentage at which playback starts draining
    pub const DEFAULT_ACTIVATION_PERCENT: u8 = 75;

    pub const MAX_QUEUED_CHUNKS: usize = 200;

    pub const CONNECT_TIMEOUT_MS: u64 = 5000;

    pub const READ_TIMEOUT_MS: u64 = 5000;

    pub const RECONNECT_BACKOFF_MS: u64 = 4000;

    /// Longest a producer waits for pipeline space
    pub const PIPELINE_WRITE_WAIT_MS: u64 = 2000;

    /// Longest the consumer waits for the next chunk
    pub const POP_TIMEOUT_MS: u64 = 5000;
}

//! Network subsystem: framed TCP connection and the session engine

pub mod connection;
pub mod session;

pub use connection::{Frame, FrameReader, FrameWriter};
pub use session::{SessionHandles, SessionState, SessionStats, SnapSession};

//! Snapcast wire codec
//!
//! Stateless encoding and decoding of the 26-byte base envelope and the
//! payload messages that follow it.

pub mod base;
pub mod format;
pub mod messages;
pub mod scan;

pub use base::{BaseMessage, MessageType, TimeVal};
pub use format::{AudioFormat, Codec, StreamSpec};
pub use messages::{
    check_size, deserialize, serialize, time_probe, CodecHeader, Hello, Message, ServerSettings,
    StreamTags, TimeMessage, WireChunk,
};

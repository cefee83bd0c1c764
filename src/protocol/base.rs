//! Base message envelope and time values
//!
//! Every Snapcast message starts with a fixed 26-byte little-endian header:
//!
//! ```text
//! u16 type | u16 id | u16 refersTo | i32 sent.sec | i32 sent.usec |
//! i32 received.sec | i32 received.usec | u32 size
//! ```

use bytes::{Buf, BufMut};
use std::fmt;
use std::ops::Sub;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::BASE_MESSAGE_SIZE;
use crate::error::ProtocolError;

/// A point in time as seconds and microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeVal {
    pub sec: i32,
    pub usec: i32,
}

impl TimeVal {
    pub const ZERO: TimeVal = TimeVal { sec: 0, usec: 0 };

    pub fn new(sec: i32, usec: i32) -> Self {
        Self { sec, usec }
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Self::from_micros(micros)
    }

    /// Build a normalized value (0 <= usec < 1_000_000) from microseconds
    pub fn from_micros(micros: i64) -> Self {
        Self {
            sec: micros.div_euclid(1_000_000) as i32,
            usec: micros.rem_euclid(1_000_000) as i32,
        }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::from_micros(millis * 1000)
    }

    pub fn as_micros(&self) -> i64 {
        self.sec as i64 * 1_000_000 + self.usec as i64
    }

    pub fn as_millis(&self) -> i64 {
        self.as_micros().div_euclid(1000)
    }

    fn read(buf: &mut impl Buf) -> Self {
        let sec = buf.get_i32_le();
        let usec = buf.get_i32_le();
        Self { sec, usec }
    }

    fn write(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.sec);
        buf.put_i32_le(self.usec);
    }

    /// Decode an 8-byte time value
    pub fn decode(mut data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_remaining(&data, 8)?;
        Ok(Self::read(&mut data))
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        self.write(buf);
    }
}

/// Difference in microseconds
impl Sub for TimeVal {
    type Output = i64;

    fn sub(self, rhs: TimeVal) -> i64 {
        self.as_micros() - rhs.as_micros()
    }
}

impl fmt::Display for TimeVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

/// Message type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Base = 0,
    CodecHeader = 1,
    WireChunk = 2,
    ServerSettings = 3,
    Time = 4,
    Hello = 5,
    StreamTags = 6,
}

impl TryFrom<u16> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Base),
            1 => Ok(MessageType::CodecHeader),
            2 => Ok(MessageType::WireChunk),
            3 => Ok(MessageType::ServerSettings),
            4 => Ok(MessageType::Time),
            5 => Ok(MessageType::Hello),
            6 => Ok(MessageType::StreamTags),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

impl From<MessageType> for u16 {
    fn from(value: MessageType) -> u16 {
        value as u16
    }
}

/// The fixed envelope preceding every payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BaseMessage {
    /// Raw type code; see [`BaseMessage::message_type`]
    pub kind: u16,
    pub id: u16,
    pub refers_to: u16,
    pub sent: TimeVal,
    pub received: TimeVal,
    /// Length of the following payload
    pub size: u32,
}

impl BaseMessage {
    pub const SIZE: usize = BASE_MESSAGE_SIZE;

    pub fn new(kind: MessageType, id: u16, sent: TimeVal, size: u32) -> Self {
        Self {
            kind: kind.into(),
            id,
            refers_to: 0,
            sent,
            received: TimeVal::ZERO,
            size,
        }
    }

    pub fn message_type(&self) -> Result<MessageType, ProtocolError> {
        MessageType::try_from(self.kind)
    }

    /// Serialize to the fixed 26-byte wire form
    pub fn to_bytes(&self) -> [u8; BASE_MESSAGE_SIZE] {
        let mut bytes = [0u8; BASE_MESSAGE_SIZE];
        let mut cursor = &mut bytes[..];
        self.encode(&mut cursor);
        bytes
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.kind);
        buf.put_u16_le(self.id);
        buf.put_u16_le(self.refers_to);
        self.sent.write(buf);
        self.received.write(buf);
        buf.put_u32_le(self.size);
    }

    /// Deserialize from at least 26 bytes; trailing bytes are ignored
    pub fn decode(mut data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_remaining(&data, BASE_MESSAGE_SIZE)?;
        Ok(Self {
            kind: data.get_u16_le(),
            id: data.get_u16_le(),
            refers_to: data.get_u16_le(),
            sent: TimeVal::read(&mut data),
            received: TimeVal::read(&mut data),
            size: data.get_u32_le(),
        })
    }
}

/// Fail with `Truncated` unless `buf` holds at least `needed` bytes
pub(crate) fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_message_layout() {
        let base = BaseMessage {
            kind: MessageType::Time.into(),
            id: 0x0102,
            refers_to: 0x0304,
            sent: TimeVal::new(5, 6),
            received: TimeVal::new(-1, 7),
            size: 8,
        };
        let bytes = base.to_bytes();
        assert_eq!(bytes.len(), 26);
        assert_eq!(&bytes[0..2], &[4, 0]);
        assert_eq!(&bytes[2..4], &[0x02, 0x01]);
        assert_eq!(&bytes[4..6], &[0x04, 0x03]);
        assert_eq!(&bytes[6..10], &5i32.to_le_bytes());
        assert_eq!(&bytes[14..18], &(-1i32).to_le_bytes());
        assert_eq!(&bytes[22..26], &8u32.to_le_bytes());

        assert_eq!(BaseMessage::decode(&bytes).unwrap(), base);
    }

    #[test]
    fn test_base_message_truncated() {
        let err = BaseMessage::decode(&[0u8; 25]).unwrap_err();
        assert_eq!(err, ProtocolError::Truncated { needed: 26, available: 25 });
    }

    #[test]
    fn test_unknown_type() {
        let base = BaseMessage { kind: 42, ..Default::default() };
        assert_eq!(base.message_type(), Err(ProtocolError::UnknownMessageType(42)));
    }

    #[test]
    fn test_timeval_arithmetic() {
        let a = TimeVal::new(10, 500_000);
        let b = TimeVal::new(9, 750_000);
        assert_eq!(a - b, 750_000);
        assert_eq!(a.as_millis(), 10_500);
        assert_eq!(TimeVal::from_micros(-1), TimeVal::new(-1, 999_999));
        assert_eq!(TimeVal::from_millis(1_234), TimeVal::new(1, 234_000));
    }
}

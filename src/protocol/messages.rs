//! Payload messages and full-frame serialization

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_MESSAGE_SIZE, PROTOCOL_VERSION, TIME_MESSAGE_SIZE};
use crate::error::ProtocolError;
use crate::protocol::base::{ensure_remaining, BaseMessage, MessageType, TimeVal};
use crate::protocol::scan::{scan_bool, scan_i64};

/// Read a `u32` length prefix followed by that many bytes of UTF-8 text
fn read_prefixed_str(body: &mut Bytes, what: &str) -> Result<String, ProtocolError> {
    ensure_remaining(&*body, 4)?;
    let len = body.get_u32_le() as usize;
    ensure_remaining(&*body, len)?;
    let text = body.split_to(len);
    String::from_utf8(text.to_vec())
        .map_err(|_| ProtocolError::Malformed(format!("{} is not valid UTF-8", what)))
}

fn write_prefixed(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

/// Client identity sent once per connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(rename = "MAC")]
    pub mac: String,
    #[serde(rename = "HostName")]
    pub host_name: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "ClientName")]
    pub client_name: String,
    #[serde(rename = "OS")]
    pub os: String,
    #[serde(rename = "Arch")]
    pub arch: String,
    #[serde(rename = "Instance")]
    pub instance: u32,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "SnapStreamProtocolVersion")]
    pub protocol_version: u32,
}

impl Hello {
    pub fn new(mac: &str, host_name: &str, client_name: &str, instance: u32, id: &str) -> Self {
        Self {
            mac: mac.to_string(),
            host_name: host_name.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            client_name: client_name.to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            instance,
            id: id.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| ProtocolError::Malformed(format!("hello: {}", e)))?;
        write_prefixed(buf, &json);
        Ok(())
    }

    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let json = read_prefixed_str(&mut body, "hello")?;
        serde_json::from_str(&json).map_err(|e| ProtocolError::Malformed(format!("hello: {}", e)))
    }
}

/// Codec announcement for the upcoming stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecHeader {
    pub codec: String,
    pub payload: Bytes,
}

impl CodecHeader {
    pub fn new(codec: &str, payload: impl Into<Bytes>) -> Self {
        Self {
            codec: codec.to_string(),
            payload: payload.into(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        write_prefixed(buf, self.codec.as_bytes());
        write_prefixed(buf, &self.payload);
    }

    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let codec = read_prefixed_str(&mut body, "codec name")?;
        if codec.is_empty() {
            return Err(ProtocolError::Malformed("empty codec name".into()));
        }
        ensure_remaining(&body, 4)?;
        let size = body.get_u32_le() as usize;
        ensure_remaining(&body, size)?;
        let payload = body.split_to(size);
        Ok(Self { codec, payload })
    }
}

/// One timestamped block of encoded audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireChunk {
    pub timestamp: TimeVal,
    /// View into the received message body
    pub payload: Bytes,
}

impl WireChunk {
    pub const HEADER_SIZE: usize = 12;

    pub fn new(timestamp: TimeVal, payload: impl Into<Bytes>) -> Self {
        Self {
            timestamp,
            payload: payload.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        self.timestamp.encode(buf);
        write_prefixed(buf, &self.payload);
    }

    /// The payload is sliced out of `body` without copying
    pub fn decode(body: Bytes) -> Result<Self, ProtocolError> {
        let mut header = &body[..];
        ensure_remaining(&header, Self::HEADER_SIZE)?;
        let sec = header.get_i32_le();
        let usec = header.get_i32_le();
        let size = header.get_u32_le() as usize;
        let end = Self::HEADER_SIZE
            .checked_add(size)
            .ok_or_else(|| ProtocolError::Malformed("wire chunk size overflow".into()))?;
        if body.len() < end {
            return Err(ProtocolError::Truncated {
                needed: end,
                available: body.len(),
            });
        }
        Ok(Self {
            timestamp: TimeVal::new(sec, usec),
            payload: body.slice(Self::HEADER_SIZE..end),
        })
    }
}

/// Playback settings pushed by the server.
///
/// Keys absent from the message are `None`; a receiver overlays the present
/// ones onto what it applied before with [`ServerSettings::merge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerSettings {
    pub buffer_ms: Option<i32>,
    pub latency: Option<i32>,
    /// 0..=100
    pub volume: Option<u32>,
    pub muted: Option<bool>,
}

impl ServerSettings {
    /// Settings with every key present
    pub fn new(buffer_ms: i32, latency: i32, volume: u32, muted: bool) -> Self {
        Self {
            buffer_ms: Some(buffer_ms),
            latency: Some(latency),
            volume: Some(volume.min(100)),
            muted: Some(muted),
        }
    }

    pub fn to_json(&self) -> String {
        let mut fields = Vec::new();
        if let Some(buffer_ms) = self.buffer_ms {
            fields.push(format!("\"bufferMs\":{}", buffer_ms));
        }
        if let Some(latency) = self.latency {
            fields.push(format!("\"latency\":{}", latency));
        }
        if let Some(muted) = self.muted {
            fields.push(format!("\"muted\":{}", muted));
        }
        if let Some(volume) = self.volume {
            fields.push(format!("\"volume\":{}", volume));
        }
        format!("{{{}}}", fields.join(","))
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        write_prefixed(buf, self.to_json().as_bytes());
    }

    /// Parse the JSON body; the length prefix is consumed and not trusted
    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        ensure_remaining(&body, 4)?;
        body.advance(4);
        let json = std::str::from_utf8(&body)
            .map_err(|_| ProtocolError::Malformed("server settings are not valid UTF-8".into()))?;
        Self::from_json(json.trim_end_matches('\0'))
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Ok(Self {
            buffer_ms: scan_i64(json, "bufferMs")?
                .map(|v| narrow(v, "bufferMs"))
                .transpose()?,
            latency: scan_i64(json, "latency")?
                .map(|v| narrow(v, "latency"))
                .transpose()?,
            volume: scan_i64(json, "volume")?.map(|v| v.clamp(0, 100) as u32),
            muted: scan_bool(json, "muted")?,
        })
    }

    /// Overlay the keys present in `update`
    pub fn merge(&mut self, update: &ServerSettings) {
        self.buffer_ms = update.buffer_ms.or(self.buffer_ms);
        self.latency = update.latency.or(self.latency);
        self.volume = update.volume.or(self.volume);
        self.muted = update.muted.or(self.muted);
    }

    /// Buffer plus latency, the server side of the start delay
    pub fn buffer_delay_ms(&self) -> i64 {
        self.buffer_ms.unwrap_or(0) as i64 + self.latency.unwrap_or(0) as i64
    }
}

fn narrow(value: i64, key: &str) -> Result<i32, ProtocolError> {
    i32::try_from(value).map_err(|_| ProtocolError::Malformed(format!("{} out of range: {}", key, value)))
}

/// Round-trip probe, identical in both directions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeMessage {
    pub latency: TimeVal,
}

impl TimeMessage {
    pub fn encode(&self, buf: &mut BytesMut) {
        self.latency.encode(buf);
    }

    pub fn decode(body: Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            latency: TimeVal::decode(&body)?,
        })
    }
}

/// Stream metadata; carried as opaque JSON
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTags {
    pub json: String,
}

impl StreamTags {
    pub fn encode(&self, buf: &mut BytesMut) {
        write_prefixed(buf, self.json.as_bytes());
    }

    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            json: read_prefixed_str(&mut body, "stream tags")?,
        })
    }
}

/// Any decoded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    CodecHeader(CodecHeader),
    WireChunk(WireChunk),
    ServerSettings(ServerSettings),
    Time(TimeMessage),
    Hello(Hello),
    StreamTags(StreamTags),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::CodecHeader(_) => MessageType::CodecHeader,
            Message::WireChunk(_) => MessageType::WireChunk,
            Message::ServerSettings(_) => MessageType::ServerSettings,
            Message::Time(_) => MessageType::Time,
            Message::Hello(_) => MessageType::Hello,
            Message::StreamTags(_) => MessageType::StreamTags,
        }
    }

    /// Encode the payload only
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            Message::CodecHeader(m) => m.encode(buf),
            Message::WireChunk(m) => m.encode(buf),
            Message::ServerSettings(m) => m.encode(buf),
            Message::Time(m) => m.encode(buf),
            Message::Hello(m) => m.encode(buf)?,
            Message::StreamTags(m) => m.encode(buf),
        }
        Ok(())
    }

    /// Decode a payload whose body has been fully received
    pub fn decode(kind: MessageType, body: Bytes) -> Result<Self, ProtocolError> {
        match kind {
            MessageType::CodecHeader => CodecHeader::decode(body).map(Message::CodecHeader),
            MessageType::WireChunk => WireChunk::decode(body).map(Message::WireChunk),
            MessageType::ServerSettings => {
                ServerSettings::decode(body).map(Message::ServerSettings)
            }
            MessageType::Time => TimeMessage::decode(body).map(Message::Time),
            MessageType::Hello => Hello::decode(body).map(Message::Hello),
            MessageType::StreamTags => StreamTags::decode(body).map(Message::StreamTags),
            MessageType::Base => Err(ProtocolError::Malformed(
                "base message carries no payload".into(),
            )),
        }
    }
}

/// Serialize a full frame. Type and size in `base` are overwritten from the
/// message.
pub fn serialize(base: BaseMessage, message: &Message) -> Result<Bytes, ProtocolError> {
    let mut payload = BytesMut::new();
    message.encode(&mut payload)?;
    let size = u32::try_from(payload.len())
        .map_err(|_| ProtocolError::MessageTooLarge(u32::MAX))?;

    let base = BaseMessage {
        kind: message.message_type().into(),
        size,
        ..base
    };
    let mut frame = BytesMut::with_capacity(BaseMessage::SIZE + payload.len());
    base.encode(&mut frame);
    frame.extend_from_slice(&payload);
    Ok(frame.freeze())
}

/// Deserialize a full frame
pub fn deserialize(mut frame: Bytes) -> Result<(BaseMessage, Message), ProtocolError> {
    let base = BaseMessage::decode(&frame)?;
    check_size(base.size)?;
    frame.advance(BaseMessage::SIZE);
    let size = base.size as usize;
    ensure_remaining(&frame, size)?;
    let body = frame.split_to(size);
    let message = Message::decode(base.message_type()?, body)?;
    Ok((base, message))
}

/// Reject sizes no sane server would send
pub fn check_size(size: u32) -> Result<(), ProtocolError> {
    if size as usize > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(size));
    }
    Ok(())
}

/// Frame for an outgoing TIME probe
pub fn time_probe(id: u16, sent: TimeVal) -> Bytes {
    let base = BaseMessage::new(MessageType::Time, id, sent, TIME_MESSAGE_SIZE as u32);
    let mut frame = BytesMut::with_capacity(BaseMessage::SIZE + TIME_MESSAGE_SIZE);
    base.encode(&mut frame);
    TimeMessage::default().encode(&mut frame);
    frame.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let base = BaseMessage {
            id: 7,
            refers_to: 3,
            sent: TimeVal::new(100, 200),
            received: TimeVal::new(300, 400),
            ..Default::default()
        };
        let frame = serialize(base, &message).unwrap();
        let (decoded_base, decoded) = deserialize(frame.clone()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded_base.id, 7);
        assert_eq!(decoded_base.refers_to, 3);
        assert_eq!(decoded_base.size as usize, frame.len() - BaseMessage::SIZE);
        assert_eq!(decoded_base.message_type().unwrap(), message.message_type());
    }

    #[test]
    fn test_round_trip_all_kinds() {
        round_trip(Message::CodecHeader(CodecHeader::new("opus", vec![1u8, 2, 3, 4])));
        round_trip(Message::CodecHeader(CodecHeader::new("pcm", Vec::new())));
        round_trip(Message::WireChunk(WireChunk::new(TimeVal::new(12, 34), vec![9u8; 960])));
        round_trip(Message::WireChunk(WireChunk::new(TimeVal::new(-1, 0), Vec::new())));
        round_trip(Message::ServerSettings(ServerSettings::new(1000, -20, 57, true)));
        round_trip(Message::ServerSettings(ServerSettings {
            volume: Some(30),
            ..Default::default()
        }));
        round_trip(Message::Time(TimeMessage {
            latency: TimeVal::new(0, 1500),
        }));
        round_trip(Message::Hello(Hello::new(
            "A8:48:FA:0B:93:40",
            "kitchen",
            "snapclient",
            1,
            "A8:48:FA:0B:93:40",
        )));
        round_trip(Message::StreamTags(StreamTags {
            json: r#"{"artist":"x"}"#.into(),
        }));
    }

    #[test]
    fn test_hello_json_keys() {
        let hello = Hello::new("00:11:22:33:44:55", "host", "client", 2, "id-1");
        let mut buf = BytesMut::new();
        hello.encode(&mut buf).unwrap();
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);
        let json = std::str::from_utf8(&buf[4..]).unwrap();
        for key in [
            "\"MAC\"",
            "\"HostName\"",
            "\"Version\"",
            "\"ClientName\"",
            "\"OS\"",
            "\"Arch\"",
            "\"Instance\":2",
            "\"ID\"",
            "\"SnapStreamProtocolVersion\":2",
        ] {
            assert!(json.contains(key), "missing {} in {}", key, json);
        }
    }

    #[test]
    fn test_empty_codec_name_rejected() {
        let mut buf = BytesMut::new();
        CodecHeader::new("", vec![1u8]).encode(&mut buf);
        assert!(matches!(
            CodecHeader::decode(buf.freeze()),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_codec_header_truncated() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(4);
        buf.put_slice(b"op");
        assert!(matches!(
            CodecHeader::decode(buf.freeze()),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_max_size_rejected() {
        let base = BaseMessage {
            kind: MessageType::WireChunk.into(),
            size: u32::MAX,
            ..Default::default()
        };
        let frame = Bytes::copy_from_slice(&base.to_bytes());
        assert_eq!(
            deserialize(frame).unwrap_err(),
            ProtocolError::MessageTooLarge(u32::MAX)
        );
    }

    #[test]
    fn test_wire_chunk_is_tail_of_body() {
        let mut buf = BytesMut::new();
        WireChunk::new(TimeVal::new(1, 2), vec![7u8; 16]).encode(&mut buf);
        let body = buf.freeze();
        let chunk = WireChunk::decode(body.clone()).unwrap();
        assert_eq!(chunk.size(), 16);
        // same backing storage, no copy
        assert_eq!(chunk.payload.as_ptr(), body[12..].as_ptr());
    }

    #[test]
    fn test_wire_chunk_truncated() {
        let mut buf = BytesMut::new();
        TimeVal::new(1, 2).encode(&mut buf);
        buf.put_u32_le(100);
        buf.put_slice(&[0u8; 10]);
        assert!(matches!(
            WireChunk::decode(buf.freeze()),
            Err(ProtocolError::Truncated { needed: 112, available: 22 })
        ));
    }

    #[test]
    fn test_server_settings_missing_keys_and_clamp() {
        let settings = ServerSettings::from_json(r#"{"volume":250,"foo":"bar"}"#).unwrap();
        assert_eq!(settings.volume, Some(100));
        assert_eq!(settings.buffer_ms, None);
        assert_eq!(settings.muted, None);
    }

    #[test]
    fn test_server_settings_merge_keeps_absent_keys() {
        let mut applied = ServerSettings::new(400, 20, 80, false);
        let update = ServerSettings::from_json(r#"{"muted":true,"bufferMs":600}"#).unwrap();
        applied.merge(&update);
        assert_eq!(applied, ServerSettings::new(600, 20, 80, true));
        assert_eq!(applied.buffer_delay_ms(), 620);
    }

    #[test]
    fn test_server_settings_ignores_prefix() {
        let json = br#"{"bufferMs":400,"latency":20,"muted":false,"volume":80}"#;
        let mut buf = BytesMut::new();
        // bogus prefix value must not matter
        buf.put_u32_le(9999);
        buf.put_slice(json);
        let settings = ServerSettings::decode(buf.freeze()).unwrap();
        assert_eq!(settings, ServerSettings::new(400, 20, 80, false));
    }

    #[test]
    fn test_time_probe_frame() {
        let frame = time_probe(5, TimeVal::new(1, 2));
        assert_eq!(frame.len(), BaseMessage::SIZE + TIME_MESSAGE_SIZE);
        let (base, message) = deserialize(frame).unwrap();
        assert_eq!(base.id, 5);
        assert_eq!(base.sent, TimeVal::new(1, 2));
        assert_eq!(message, Message::Time(TimeMessage::default()));
    }
}

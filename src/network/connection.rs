//! Framed message I/O over a byte stream
//!
//! A frame is the 26-byte base envelope followed by exactly `size` payload
//! bytes. Reads are bounded by a timeout; the receive time is stamped into
//! the envelope as soon as the header is complete, together with a monotonic
//! stamp for drift measurement.

use bytes::{Bytes, BytesMut};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetworkError, Result};
use crate::protocol::{check_size, BaseMessage};
use crate::sync::Clock;

fn read_error(e: std::io::Error) -> NetworkError {
    match e.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
            NetworkError::Closed
        }
        _ => NetworkError::ReceiveFailed(e.to_string()),
    }
}

/// One received message
#[derive(Debug, Clone)]
pub struct Frame {
    /// Envelope with `received` set to the local wall-clock time
    pub base: BaseMessage,
    pub body: Bytes,
    /// Local monotonic milliseconds at receipt
    pub received_ms: u64,
}

/// Receiving half of a connection
pub struct FrameReader<R> {
    reader: R,
    read_timeout: Duration,
    header: [u8; BaseMessage::SIZE],
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, read_timeout: Duration) -> Self {
        Self {
            reader,
            read_timeout,
            header: [0u8; BaseMessage::SIZE],
        }
    }

    async fn fill(reader: &mut R, buf: &mut [u8], limit: Duration) -> Result<()> {
        tokio::time::timeout(limit, reader.read_exact(buf))
            .await
            .map_err(|_| NetworkError::Timeout)?
            .map_err(read_error)?;
        Ok(())
    }

    /// Read one complete frame.
    ///
    /// Sizes beyond the sanity limit fail with `MessageTooLarge`; the stream
    /// is out of step at that point and must be reconnected. Not cancel safe.
    pub async fn read_frame(&mut self, clock: &dyn Clock) -> Result<Frame> {
        Self::fill(&mut self.reader, &mut self.header, self.read_timeout).await?;
        let mut base = BaseMessage::decode(&self.header)?;
        base.received = clock.now();
        let received_ms = clock.millis();
        check_size(base.size)?;

        let mut body = BytesMut::zeroed(base.size as usize);
        if !body.is_empty() {
            Self::fill(&mut self.reader, &mut body, self.read_timeout).await?;
        }
        Ok(Frame {
            base,
            body: body.freeze(),
            received_ms,
        })
    }
}

/// Sending half of a connection
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.writer
            .write_all(frame)
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ProtocolError};
    use crate::protocol::{serialize, Message, MessageType, TimeMessage, TimeVal};
    use crate::sync::ManualClock;

    #[tokio::test]
    async fn test_read_frame_stamps_receive_time() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(client, Duration::from_secs(1));
        let clock = ManualClock::new(TimeVal::new(50, 7));
        clock.advance(Duration::from_millis(250));
        clock.step_wall(-250_000);

        let frame = serialize(
            BaseMessage::new(MessageType::Time, 3, TimeVal::new(1, 2), 0),
            &Message::Time(TimeMessage::default()),
        )
        .unwrap();
        server.write_all(&frame).await.unwrap();

        let frame = reader.read_frame(&clock).await.unwrap();
        assert_eq!(frame.base.id, 3);
        assert_eq!(frame.base.sent, TimeVal::new(1, 2));
        assert_eq!(frame.base.received, TimeVal::new(50, 7));
        assert_eq!(frame.received_ms, 250);
        assert_eq!(frame.body.len(), 8);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(client, Duration::from_secs(1));
        let clock = ManualClock::new(TimeVal::ZERO);

        let base = BaseMessage::new(MessageType::WireChunk, 0, TimeVal::ZERO, u32::MAX);
        server.write_all(&base.to_bytes()).await.unwrap();
        assert!(matches!(
            reader.read_frame(&clock).await,
            Err(Error::Protocol(ProtocolError::MessageTooLarge(_)))
        ));
    }

    #[tokio::test]
    async fn test_eof_and_timeout() {
        let (client, server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(client, Duration::from_millis(20));
        let clock = ManualClock::new(TimeVal::ZERO);

        assert!(matches!(
            reader.read_frame(&clock).await,
            Err(Error::Network(NetworkError::Timeout))
        ));
        drop(server);
        assert!(matches!(
            reader.read_frame(&clock).await,
            Err(Error::Network(NetworkError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_write_frame() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        writer.write_frame(b"abc").await.unwrap();

        let mut buf = [0u8; 3];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
    }
}

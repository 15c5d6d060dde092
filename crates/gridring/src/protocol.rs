//! Wire protocol for discovery connections
//!
//! Every frame is a postcard-encoded [`WireFrame`] behind a 4-byte big-endian
//! length prefix. A connection carries one of three conversations:
//!
//! - **Ring link**: a node streams [`Frame::Ring`] messages to its successor and
//!   interleaves [`Frame::Probe`]s, which the successor answers with
//!   [`Frame::ProbeAck`] on the same connection.
//! - **Join handshake**: a candidate sends [`Frame::Join`] to any ring member
//!   and receives a [`Frame::JoinResponse`]. The admission outcome itself
//!   arrives later as a ring message on the candidate's own listener.
//! - **Ping**: [`Frame::Ping`] answered by [`Frame::Pong`] with the responder's
//!   id and whether the responder's snapshot contains the sender. The same
//!   exchange opens every ring link so a node never links to the wrong peer.

use crate::error::{DiscoveryError, Result};
use crate::message::{JoinRequest, RingMessage};
use crate::node::NodeId;
use crate::observability::NetworkMetrics;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum protocol version we can interoperate with
pub const MIN_PROTOCOL_VERSION: u16 = 1;

/// Maximum frame size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Answer of a ring member to a join handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinResponse {
    /// Request entered the ring; the outcome arrives on the candidate's listener
    Forwarded,
    /// The candidate id is already taken
    Duplicate,
    /// Contacted node is not a ring member yet; try again later
    NotReady,
}

/// Frames exchanged on discovery connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(clippy::large_enum_variant)] // Frames are short-lived
pub enum Frame {
    /// A ring message
    Ring(RingMessage),
    /// Failure detector probe
    Probe { seq: u64 },
    /// Probe answer
    ProbeAck { seq: u64 },
    /// Join handshake request
    Join(JoinRequest),
    /// Join handshake answer
    JoinResponse(JoinResponse),
    /// Liveness/identity check
    Ping { from: NodeId },
    /// Ping answer; `member` tells whether the sender is in the responder's ring
    Pong { node: NodeId, member: bool },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Ring(_) => "ring",
            Frame::Probe { .. } => "probe",
            Frame::ProbeAck { .. } => "probe_ack",
            Frame::Join(_) => "join",
            Frame::JoinResponse(_) => "join_response",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
        }
    }
}

/// Versioned frame as written on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    pub version: u16,
    pub frame: Frame,
}

impl WireFrame {
    pub fn new(frame: Frame) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            frame,
        }
    }

    /// Validate that the protocol version is supported
    pub fn validate_version(&self) -> Result<()> {
        if self.version < MIN_PROTOCOL_VERSION || self.version > PROTOCOL_VERSION {
            Err(DiscoveryError::UnsupportedVersion {
                version: self.version,
                min: MIN_PROTOCOL_VERSION,
                max: PROTOCOL_VERSION,
            })
        } else {
            Ok(())
        }
    }
}

/// Encode a frame to bytes
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let wire = WireFrame::new(frame.clone());
    let bytes =
        postcard::to_allocvec(&wire).map_err(|e| DiscoveryError::Serialization(e.to_string()))?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(DiscoveryError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(bytes)
}

/// Decode a frame from bytes
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(DiscoveryError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let wire: WireFrame =
        postcard::from_bytes(bytes).map_err(|e| DiscoveryError::Deserialization(e.to_string()))?;
    wire.validate_version()?;
    Ok(wire.frame)
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(data: &[u8]) -> Bytes {
    let mut framed = BytesMut::with_capacity(4 + data.len());
    framed.put_u32(data.len() as u32);
    framed.put_slice(data);
    framed.freeze()
}

/// Extract message length from frame header
pub fn frame_length(header: &[u8; 4]) -> usize {
    u32::from_be_bytes(*header) as usize
}

/// Write one frame, bounded by `write_timeout`
pub async fn write_frame<W>(writer: &mut W, frame: &Frame, write_timeout: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame_message(&encode_frame(frame)?);
    timeout(write_timeout, async {
        writer.write_all(&framed).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| DiscoveryError::Timeout)?
    .map_err(DiscoveryError::Io)?;

    NetworkMetrics::add_bytes_sent(framed.len() as u64);
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` on a clean close before the first header byte. With
/// `read_timeout` set, the whole frame must arrive within it.
pub async fn read_frame<R>(reader: &mut R, read_timeout: Option<Duration>) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let read = async {
        let mut length_buf = [0u8; 4];
        match reader.read_exact(&mut length_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(DiscoveryError::Io(e)),
        }

        let length = frame_length(&length_buf);
        if length > MAX_MESSAGE_SIZE {
            return Err(DiscoveryError::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
        NetworkMetrics::add_bytes_received(4 + length as u64);
        decode_frame(&body).map(Some)
    };

    match read_timeout {
        Some(limit) => timeout(limit, read).await.map_err(|_| DiscoveryError::Timeout)?,
        None => read.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;

    #[test]
    fn test_framing() {
        let data = b"hello world";
        let framed = frame_message(data);

        assert_eq!(framed.len(), 4 + data.len());

        let mut header = [0u8; 4];
        header.copy_from_slice(&framed[..4]);
        assert_eq!(frame_length(&header), data.len());
    }

    #[test]
    fn test_ring_frame_keeps_envelope() {
        let creator = NodeId::new();
        let mut msg = RingMessage::new(creator, Payload::Custom { data: vec![9; 32] });
        msg.hops = 3;
        let bytes = encode_frame(&Frame::Ring(msg.clone())).unwrap();

        match decode_frame(&bytes).unwrap() {
            Frame::Ring(decoded) => {
                assert_eq!(decoded.id, msg.id);
                assert_eq!(decoded.creator, creator);
                assert_eq!(decoded.hops, 3);
                assert!(!decoded.is_verified());
            }
            other => panic!("Wrong frame type: {}", other.kind()),
        }
    }

    #[test]
    fn test_version_validation() {
        let mut wire = WireFrame::new(Frame::Probe { seq: 1 });
        assert!(wire.validate_version().is_ok());

        wire.version = PROTOCOL_VERSION + 1;
        assert!(matches!(
            wire.validate_version(),
            Err(DiscoveryError::UnsupportedVersion { .. })
        ));

        wire.version = 0;
        let bytes = postcard::to_allocvec(&wire).unwrap();
        assert!(decode_frame(&bytes).is_err());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            decode_frame(&[0xff, 0xff, 0xff]),
            Err(DiscoveryError::Deserialization(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let timeout = Duration::from_secs(1);

        write_frame(&mut client, &Frame::Probe { seq: 42 }, timeout)
            .await
            .unwrap();
        let frame = read_frame(&mut server, Some(timeout)).await.unwrap();
        assert_eq!(frame, Some(Frame::Probe { seq: 42 }));

        drop(client);
        assert_eq!(read_frame(&mut server, Some(timeout)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes();
        client.write_all(&len).await.unwrap();

        let err = read_frame(&mut server, None).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::MessageTooLarge { .. }));
    }
}

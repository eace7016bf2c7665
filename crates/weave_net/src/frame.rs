//! Outer wire frame: 4-byte header plus opaque body.
//!
//! ```text
//! byte 0     kind        0x00 data, 0xE0..=0xFF control
//! byte 1     sub kind    data: route / route-fail, control: see ControlKind
//! bytes 2-3  body length u16 little-endian
//! bytes 4..  body
//! ```
//!
//! The body length is checked against the configured cap before any body
//! buffer is allocated. A torn read is always a hard error; no partial frame
//! state survives a failed call.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetError;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 4;

/// Largest body the wire format can carry.
pub const MAX_BODY_LEN: usize = 65_534;

/// Kind byte of data frames.
pub const KIND_DATA: u8 = 0x00;

/// Kind byte written for control frames. Any kind in `0xE0..=0xFF` decodes
/// as control.
pub const KIND_CONTROL: u8 = 0xE0;

/// Sub kinds of control frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlKind {
    HandshakeStart = 0xE1,
    Cmd = 0xE2,
    CmdResult = 0xE3,
    HandshakeFinish = 0xE4,
    Heartbeat = 0xE5,
}

impl TryFrom<u8> for ControlKind {
    type Error = NetError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0xE1 => Ok(Self::HandshakeStart),
            0xE2 => Ok(Self::Cmd),
            0xE3 => Ok(Self::CmdResult),
            0xE4 => Ok(Self::HandshakeFinish),
            0xE5 => Ok(Self::Heartbeat),
            other => Err(NetError::Protocol(format!(
                "unknown control sub kind {other:#04x}"
            ))),
        }
    }
}

/// Sub kinds of data frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataKind {
    /// A route envelope.
    Route = 0x00,
    /// A route envelope synthesized by a gate because the target was missing.
    RouteFail = 0x01,
}

impl TryFrom<u8> for DataKind {
    type Error = NetError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Route),
            0x01 => Ok(Self::RouteFail),
            other => Err(NetError::Protocol(format!(
                "unknown data sub kind {other:#04x}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Data(DataKind),
    Control(ControlKind),
}

impl FrameKind {
    fn from_bytes(kind: u8, sub_kind: u8) -> Result<Self, NetError> {
        match kind {
            KIND_DATA => Ok(Self::Data(DataKind::try_from(sub_kind)?)),
            k if k >= KIND_CONTROL => Ok(Self::Control(ControlKind::try_from(sub_kind)?)),
            other => Err(NetError::Protocol(format!("unknown frame kind {other:#04x}"))),
        }
    }

    fn to_bytes(self) -> (u8, u8) {
        match self {
            Self::Data(sub) => (KIND_DATA, sub as u8),
            Self::Control(sub) => (KIND_CONTROL, sub as u8),
        }
    }
}

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub body: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    /// A data frame carrying an encoded route envelope.
    pub fn route(body: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Data(DataKind::Route), body)
    }

    /// A data frame carrying a gate-synthesized route error.
    pub fn route_fail(body: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Data(DataKind::RouteFail), body)
    }

    pub fn control(kind: ControlKind, body: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Control(kind), body)
    }

    pub fn heartbeat() -> Self {
        Self::control(ControlKind::Heartbeat, Bytes::new())
    }

    pub fn is_control(&self) -> bool {
        matches!(self.kind, FrameKind::Control(_))
    }

    /// Length of the encoded frame in bytes.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    /// Append the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), NetError> {
        if self.body.len() > MAX_BODY_LEN {
            return Err(NetError::BodyTooLarge {
                len: self.body.len(),
                max: MAX_BODY_LEN,
            });
        }
        let (kind, sub_kind) = self.kind.to_bytes();
        buf.reserve(self.encoded_len());
        buf.put_u8(kind);
        buf.put_u8(sub_kind);
        buf.put_u16_le(self.body.len() as u16);
        buf.put_slice(&self.body);
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes, NetError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode exactly one frame from a complete message, as delivered by a
    /// message-oriented transport (one WebSocket binary message per frame).
    pub fn decode(message: &[u8], max_body: usize) -> Result<Self, NetError> {
        let max_body = max_body.min(MAX_BODY_LEN);
        if message.len() < HEADER_LEN {
            return Err(NetError::ShortRead);
        }
        let kind = FrameKind::from_bytes(message[0], message[1])?;
        let len = u16::from_le_bytes([message[2], message[3]]) as usize;
        if len > max_body {
            return Err(NetError::BodyTooLarge { len, max: max_body });
        }
        let body = &message[HEADER_LEN..];
        if body.len() < len {
            return Err(NetError::ShortRead);
        }
        if body.len() > len {
            return Err(NetError::Protocol(format!(
                "{} trailing bytes after frame body",
                body.len() - len
            )));
        }
        Ok(Self::new(kind, Bytes::copy_from_slice(body)))
    }
}

/// Read one frame from a byte stream.
///
/// A clean end of stream before the first header byte is `Disconnected`;
/// an end of stream anywhere after it is `ShortRead`.
pub async fn read_frame<R>(reader: &mut R, max_body: usize) -> Result<Frame, NetError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let max_body = max_body.min(MAX_BODY_LEN);
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                NetError::Disconnected
            } else {
                NetError::ShortRead
            });
        }
        filled += n;
    }

    let kind = FrameKind::from_bytes(header[0], header[1])?;
    let len = u16::from_le_bytes([header[2], header[3]]) as usize;
    if len > max_body {
        return Err(NetError::BodyTooLarge { len, max: max_body });
    }

    let mut body = BytesMut::zeroed(len);
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(Frame::new(kind, body.freeze())),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(NetError::ShortRead),
        Err(e) => Err(NetError::Io(e)),
    }
}

/// Write one frame to a byte stream and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = frame.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

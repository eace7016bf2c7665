//! Route envelope: the 24-byte routing header riding inside a data frame.
//!
//! ```text
//! off  size  field
//! 0    4     msg_id        u32 LE
//! 4    4     syn           u32 LE
//! 8    4     from_user_id  u32 LE
//! 12   4     to_user_id    u32 LE
//! 16   2     from_role     u16 LE
//! 18   2     to_role       u16 LE
//! 20   2     err_code      i16 LE
//! 22   1     msg_type      0 async, 1 request, 2 response
//! 23   1     marshal_type  codec selector
//! 24.. N     payload
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{MarshalType, Message};
use crate::error::NetError;
use crate::frame::Frame;
use crate::identity::{Identity, Role};

pub const ROUTE_HEADER_LEN: usize = 24;

/// Pushed by a gate to every node when a client connection comes up.
pub const MSG_CLIENT_ONLINE: u32 = 0xFFFF_0001;
/// Pushed by a gate to every node when a client connection goes away.
pub const MSG_CLIENT_OFFLINE: u32 = 0xFFFF_0002;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MsgType {
    #[default]
    Async = 0,
    Request = 1,
    Response = 2,
}

impl TryFrom<u8> for MsgType {
    type Error = NetError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Async),
            1 => Ok(Self::Request),
            2 => Ok(Self::Response),
            other => Err(NetError::Protocol(format!("unknown msg type {other}"))),
        }
    }
}

/// Error code carried in a response header. Zero means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrCode(pub i16);

impl ErrCode {
    pub const OK: ErrCode = ErrCode(0);
    /// The gate has no connection for the addressed node.
    pub const NODE_NOT_FOUND: ErrCode = ErrCode(1);
    /// The receiver has no handler for `(from_role, msg_id)`.
    pub const METHOD_NOT_FOUND: ErrCode = ErrCode(2);
    /// The handler panicked before answering.
    pub const HANDLER_PANIC: ErrCode = ErrCode(3);
    /// The request payload could not be decoded.
    pub const BAD_PAYLOAD: ErrCode = ErrCode(4);

    pub fn is_ok(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ErrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::OK => write!(f, "ok"),
            Self::NODE_NOT_FOUND => write!(f, "node not found"),
            Self::METHOD_NOT_FOUND => write!(f, "method not found"),
            Self::HANDLER_PANIC => write!(f, "handler panic"),
            Self::BAD_PAYLOAD => write!(f, "bad payload"),
            ErrCode(n) => write!(f, "error {n}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteHeader {
    pub msg_id: u32,
    pub syn: u32,
    pub from_user_id: u32,
    pub to_user_id: u32,
    pub from_role: Role,
    pub to_role: Role,
    pub err_code: ErrCode,
    pub msg_type: MsgType,
    pub marshal_type: MarshalType,
}

impl RouteHeader {
    pub fn from(&self) -> Identity {
        Identity::new(self.from_user_id, self.from_role)
    }

    pub fn to(&self) -> Identity {
        Identity::new(self.to_user_id, self.to_role)
    }

    pub fn set_from(&mut self, id: Identity) {
        self.from_user_id = id.user_id;
        self.from_role = id.role;
    }

    pub fn set_to(&mut self, id: Identity) {
        self.to_user_id = id.user_id;
        self.to_role = id.role;
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.msg_id);
        buf.put_u32_le(self.syn);
        buf.put_u32_le(self.from_user_id);
        buf.put_u32_le(self.to_user_id);
        buf.put_u16_le(self.from_role.0);
        buf.put_u16_le(self.to_role.0);
        buf.put_i16_le(self.err_code.0);
        buf.put_u8(self.msg_type as u8);
        buf.put_u8(self.marshal_type.0);
    }

    fn parse(buf: &mut impl Buf) -> Result<Self, NetError> {
        if buf.remaining() < ROUTE_HEADER_LEN {
            return Err(NetError::Protocol(format!(
                "route envelope shorter than {ROUTE_HEADER_LEN} bytes"
            )));
        }
        Ok(Self {
            msg_id: buf.get_u32_le(),
            syn: buf.get_u32_le(),
            from_user_id: buf.get_u32_le(),
            to_user_id: buf.get_u32_le(),
            from_role: Role(buf.get_u16_le()),
            to_role: Role(buf.get_u16_le()),
            err_code: ErrCode(buf.get_i16_le()),
            msg_type: MsgType::try_from(buf.get_u8())?,
            marshal_type: MarshalType(buf.get_u8()),
        })
    }
}

/// A route header plus its opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEnvelope {
    pub header: RouteHeader,
    pub payload: Bytes,
}

impl RouteEnvelope {
    fn build<M: Message>(
        msg_type: MsgType,
        from: Identity,
        to: Identity,
        msg_id: u32,
        syn: u32,
        msg: &M,
    ) -> Result<Self, NetError> {
        let mut header = RouteHeader {
            msg_id,
            syn,
            msg_type,
            marshal_type: msg.marshal_type(),
            ..Default::default()
        };
        header.set_from(from);
        header.set_to(to);
        Ok(Self {
            header,
            payload: msg.encode()?,
        })
    }

    /// A fire-and-forget message.
    pub fn new_async<M: Message>(
        from: Identity,
        to: Identity,
        msg_id: u32,
        msg: &M,
    ) -> Result<Self, NetError> {
        Self::build(MsgType::Async, from, to, msg_id, 0, msg)
    }

    /// A request; `syn` must be non-zero.
    pub fn new_request<M: Message>(
        from: Identity,
        to: Identity,
        msg_id: u32,
        syn: u32,
        msg: &M,
    ) -> Result<Self, NetError> {
        if syn == 0 {
            return Err(NetError::Protocol("request with syn 0".into()));
        }
        Self::build(MsgType::Request, from, to, msg_id, syn, msg)
    }

    /// A response to `request`, addressed back to its sender. The from side
    /// echoes the identity the requester addressed so its pending entry
    /// matches.
    pub fn response_to<M: Message>(
        request: &RouteHeader,
        err_code: ErrCode,
        msg: &M,
    ) -> Result<Self, NetError> {
        let mut env = Self::build(
            MsgType::Response,
            request.to(),
            request.from(),
            request.msg_id,
            request.syn,
            msg,
        )?;
        env.header.err_code = err_code;
        Ok(env)
    }

    /// The route error a gate synthesizes when it cannot deliver this
    /// envelope: identities swapped, empty payload.
    pub fn route_error(&self, code: ErrCode) -> Self {
        let mut header = RouteHeader {
            msg_id: self.header.msg_id,
            syn: self.header.syn,
            err_code: code,
            msg_type: MsgType::Response,
            marshal_type: MarshalType::RAW,
            ..Default::default()
        };
        header.set_from(self.header.to());
        header.set_to(self.header.from());
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    /// Check the header invariants.
    pub fn validate(&self) -> Result<(), NetError> {
        if self.header.msg_type == MsgType::Request && self.header.syn == 0 {
            return Err(NetError::Protocol("request with syn 0".into()));
        }
        Ok(())
    }

    /// Decode the payload as `M`.
    pub fn message<M: Message>(&self) -> Result<M, NetError> {
        M::decode(self.header.marshal_type, &self.payload)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ROUTE_HEADER_LEN + self.payload.len());
        self.header.put(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a frame body. The payload is a zero-copy slice of `body`.
    pub fn decode(body: Bytes) -> Result<Self, NetError> {
        let mut cursor = &body[..];
        let header = RouteHeader::parse(&mut cursor)?;
        let env = Self {
            header,
            payload: body.slice(ROUTE_HEADER_LEN..),
        };
        env.validate()?;
        Ok(env)
    }

    pub fn to_frame(&self) -> Frame {
        Frame::route(self.encode())
    }
}

/// Correlation id generator. Skips 0 on wrap-around.
#[derive(Debug)]
pub struct SynGenerator(AtomicU32);

impl SynGenerator {
    pub fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    /// Start at a random point so restarted processes do not reuse recent ids.
    pub fn random() -> Self {
        Self(AtomicU32::new(rand::random::<u32>().max(1)))
    }

    pub fn next(&self) -> u32 {
        loop {
            let syn = self.0.fetch_add(1, Ordering::Relaxed);
            if syn != 0 {
                return syn;
            }
        }
    }
}

impl Default for SynGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

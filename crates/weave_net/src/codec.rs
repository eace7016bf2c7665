//! Payload codecs selected by the route header's marshal type.

use std::fmt;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::NetError;

/// Codec selector carried in byte 23 of the route header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MarshalType(pub u8);

impl MarshalType {
    /// Opaque bytes, no codec.
    pub const RAW: MarshalType = MarshalType(0);
    pub const PROTOBUF: MarshalType = MarshalType(1);
    pub const JSON: MarshalType = MarshalType(2);
}

impl fmt::Display for MarshalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::RAW => write!(f, "raw"),
            Self::PROTOBUF => write!(f, "protobuf"),
            Self::JSON => write!(f, "json"),
            MarshalType(n) => write!(f, "marshal{n}"),
        }
    }
}

/// A payload type that knows how to marshal itself for a route envelope.
///
/// Handlers are registered per message type; the adapter decodes the
/// payload through this trait before the handler runs.
pub trait Message: Sized + Send + 'static {
    /// Marshal type written into the header when this value is sent.
    fn marshal_type(&self) -> MarshalType;

    fn encode(&self) -> Result<Bytes, NetError>;

    fn decode(marshal: MarshalType, payload: &[u8]) -> Result<Self, NetError>;
}

fn expect_marshal(expected: MarshalType, got: MarshalType) -> Result<(), NetError> {
    if expected == got {
        Ok(())
    } else {
        Err(NetError::Codec(format!(
            "expected {expected} payload, got {got}"
        )))
    }
}

/// JSON payload backed by serde.
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T> Message for Json<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn marshal_type(&self) -> MarshalType {
        MarshalType::JSON
    }

    fn encode(&self) -> Result<Bytes, NetError> {
        Ok(Bytes::from(serde_json::to_vec(&self.0)?))
    }

    fn decode(marshal: MarshalType, payload: &[u8]) -> Result<Self, NetError> {
        expect_marshal(MarshalType::JSON, marshal)?;
        Ok(Json(serde_json::from_slice(payload)?))
    }
}

/// Protobuf payload backed by prost.
#[derive(Debug, Clone, PartialEq)]
pub struct Proto<T>(pub T);

impl<T> Message for Proto<T>
where
    T: prost::Message + Default + 'static,
{
    fn marshal_type(&self) -> MarshalType {
        MarshalType::PROTOBUF
    }

    fn encode(&self) -> Result<Bytes, NetError> {
        Ok(Bytes::from(self.0.encode_to_vec()))
    }

    fn decode(marshal: MarshalType, payload: &[u8]) -> Result<Self, NetError> {
        expect_marshal(MarshalType::PROTOBUF, marshal)?;
        Ok(Proto(T::decode(payload)?))
    }
}

/// Raw payloads accept any marshal type.
impl Message for Bytes {
    fn marshal_type(&self) -> MarshalType {
        MarshalType::RAW
    }

    fn encode(&self) -> Result<Bytes, NetError> {
        Ok(self.clone())
    }

    fn decode(_marshal: MarshalType, payload: &[u8]) -> Result<Self, NetError> {
        Ok(Bytes::copy_from_slice(payload))
    }
}

/// Empty payload; any received payload is ignored.
impl Message for () {
    fn marshal_type(&self) -> MarshalType {
        MarshalType::RAW
    }

    fn encode(&self) -> Result<Bytes, NetError> {
        Ok(Bytes::new())
    }

    fn decode(_marshal: MarshalType, _payload: &[u8]) -> Result<Self, NetError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

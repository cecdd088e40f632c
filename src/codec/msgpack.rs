//! MsgPack serialization using `rmp-serde`.
//!
//! **CRITICAL**: Always use the `_named` encoders, NEVER `to_vec`/`write`!
//!
//! - `to_vec` serializes structs as arrays (positional)
//! - `to_vec_named` serializes structs as maps (with field names)
//! - Peers in other languages decode payload shapes by field name, and
//!   `#[serde(default)]` on our shapes only helps when fields are named.
//!
//! # Example
//!
//! ```
//! use rpcwire::codec::MsgPackSerialization;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Message {
//!     id: u32,
//!     content: String,
//! }
//!
//! let msg = Message { id: 42, content: "hello".to_string() };
//! let encoded = MsgPackSerialization::encode(&msg).unwrap();
//! let decoded: Message = MsgPackSerialization::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use std::io::Write;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::serialization::{
    read_payload, serde_error, short_type_name, write_payload, SerdeFormat, Serialization,
};
use super::serialization_id;
use crate::error::CodecError;
use crate::protocol::{Payload, PayloadKind};

/// MessagePack serialization plugin (id 3).
///
/// Structs are always written in map form.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackSerialization;

impl MsgPackSerialization {
    /// Encode a value to MsgPack bytes (struct-as-map).
    #[inline]
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
        // CRITICAL: to_vec_named, NOT to_vec!
        rmp_serde::to_vec_named(value)
            .map_err(|e| serde_error(Self::NAME, "encode", short_type_name::<T>(), e))
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
        <Self as SerdeFormat>::read(bytes, short_type_name::<T>())
    }
}

impl SerdeFormat for MsgPackSerialization {
    const NAME: &'static str = "msgpack";

    fn write<T: Serialize + ?Sized>(
        mut dst: &mut dyn Write,
        value: &T,
        target: &str,
    ) -> Result<(), CodecError> {
        rmp_serde::encode::write_named(&mut dst, value)
            .map_err(|e| serde_error(Self::NAME, "encode", target, e))
    }

    fn read<T: DeserializeOwned>(src: &[u8], target: &str) -> Result<T, CodecError> {
        rmp_serde::from_slice(src).map_err(|e| serde_error(Self::NAME, "decode", target, e))
    }
}

impl Serialization for MsgPackSerialization {
    fn id(&self) -> u8 {
        serialization_id::MSGPACK
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn serialize(&self, payload: &Payload, dst: &mut dyn Write) -> Result<(), CodecError> {
        write_payload::<Self>(dst, payload)
    }

    fn deserialize(&self, src: &[u8], kind: PayloadKind) -> Result<Payload, CodecError> {
        read_payload::<Self>(src, kind)
    }
}

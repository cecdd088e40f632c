//! JSON serialization using `serde_json`.

use std::io::Write;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::serialization::{read_payload, serde_error, write_payload, SerdeFormat, Serialization};
use super::serialization_id;
use crate::error::CodecError;
use crate::protocol::{Payload, PayloadKind};

/// JSON serialization plugin (id 9).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerialization;

impl SerdeFormat for JsonSerialization {
    const NAME: &'static str = "json";

    fn write<T: Serialize + ?Sized>(
        dst: &mut dyn Write,
        value: &T,
        target: &str,
    ) -> Result<(), CodecError> {
        serde_json::to_writer(dst, value)
            .map_err(|e| serde_error(Self::NAME, "encode", target, e))
    }

    fn read<T: DeserializeOwned>(src: &[u8], target: &str) -> Result<T, CodecError> {
        serde_json::from_slice(src).map_err(|e| serde_error(Self::NAME, "decode", target, e))
    }
}

impl Serialization for JsonSerialization {
    fn id(&self) -> u8 {
        serialization_id::JSON
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

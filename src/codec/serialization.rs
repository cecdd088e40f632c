//! Serialization plugin contract.

use std::io::Write;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;
use crate::protocol::{Payload, PayloadKind};

/// A payload serializer selected by numeric id.
pub trait Serialization: Send + Sync {
    /// Wire id carried in the header.
    fn id(&self) -> u8;

    fn name(&self) -> &'static str;

    /// Write `payload` to `dst`.
    fn serialize(&self, payload: &Payload, dst: &mut dyn Write) -> Result<(), CodecError>;

    /// Read a payload of the given shape from `src`.
    fn deserialize(&self, src: &[u8], kind: PayloadKind) -> Result<Payload, CodecError>;
}

/// Glue between a serde data format and the payload shapes.
pub(crate) trait SerdeFormat {
    const NAME: &'static str;

    /// `target` names the value's type in error messages.
    fn write<T: Serialize + ?Sized>(
        dst: &mut dyn Write,
        value: &T,
        target: &str,
    ) -> Result<(), CodecError>;

    fn read<T: DeserializeOwned>(src: &[u8], target: &str) -> Result<T, CodecError>;
}

/// Decode `src` into the payload shape named by `kind`.
pub(crate) fn read_payload<F: SerdeFormat>(
    src: &[u8],
    kind: PayloadKind,
) -> Result<Payload, CodecError> {
    let target = kind.name();
    let payload = match kind {
        PayloadKind::Invocation => Payload::Invocation(F::read(src, target)?),
        PayloadKind::Response => Payload::Response(F::read(src, target)?),
        PayloadKind::Negotiation => Payload::Negotiation(F::read(src, target)?),
        PayloadKind::Session => Payload::Session(F::read(src, target)?),
        PayloadKind::Offline => Payload::Offline(F::read(src, target)?),
        PayloadKind::Authentication => Payload::Authentication(F::read(src, target)?),
        PayloadKind::AuthResult => Payload::AuthResult(F::read(src, target)?),
    };
    Ok(payload)
}

/// Write `payload`, naming its shape if the format rejects it.
pub(crate) fn write_payload<F: SerdeFormat>(
    dst: &mut dyn Write,
    payload: &Payload,
) -> Result<(), CodecError> {
    F::write(dst, payload, payload.type_name())
}

/// Last path segment of `T`'s type name.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// Error for a value of type `target` the format could not produce or parse.
pub(crate) fn serde_error<E>(format: &str, action: &str, target: &str, err: E) -> CodecError
where
    E: std::error::Error + Send + Sync + 'static,
{
    CodecError::serialization(
        format!("{} {} of {} failed: {}", format, action, target, err),
        err,
    )
}

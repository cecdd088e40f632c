//! Typed payload shapes carried in frame bodies.
//!
//! The message type decides which shape a body decodes into (see
//! [`MsgType::payload_kind`](super::MsgType::payload_kind)). Serialization
//! plugins only ever see these shapes.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize, Serializer};

/// Deserialization target selected by the message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Invocation,
    Response,
    Negotiation,
    Session,
    Offline,
    Authentication,
    AuthResult,
}

impl PayloadKind {
    pub fn name(self) -> &'static str {
        match self {
            PayloadKind::Invocation => "Invocation",
            PayloadKind::Response => "Response",
            PayloadKind::Negotiation => "Negotiation",
            PayloadKind::Session => "Session",
            PayloadKind::Offline => "Offline",
            PayloadKind::Authentication => "Authentication",
            PayloadKind::AuthResult => "AuthResult",
        }
    }
}

/// Remote method call descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Invocation {
    pub interface: String,
    pub method: String,
    pub alias: Option<String>,
    pub args: Vec<serde_json::Value>,
    pub attachments: HashMap<String, String>,
}

impl Invocation {
    pub fn new(interface: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_arg(mut self, arg: impl Into<serde_json::Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }
}

/// Outcome of an invocation: a value or a remote exception message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponsePayload {
    pub result: Option<serde_json::Value>,
    pub exception: Option<String>,
}

impl ResponsePayload {
    pub fn ok(result: impl Into<serde_json::Value>) -> Self {
        Self {
            result: Some(result.into()),
            exception: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: None,
            exception: Some(message.into()),
        }
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.exception.is_some()
    }
}

/// Plugin negotiation.
///
/// Requests list what the sender supports in preference order; responses
/// carry the chosen ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Negotiation {
    pub serializations: Vec<u8>,
    pub compressions: Vec<u8>,
    pub serialization: Option<u8>,
    pub compression: Option<u8>,
    pub attributes: HashMap<String, String>,
}

/// Request to open a logical session with fixed plugin defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPayload {
    pub serialization: u8,
    pub compression: u8,
    pub attributes: HashMap<String, String>,
}

/// Notice that the peer is going away.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineNotice {
    pub reason: Option<String>,
}

/// Credentials presented by a connecting peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Authentication {
    pub principal: String,
    #[serde(with = "serde_bytes")]
    pub credential: Vec<u8>,
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthResult {
    pub success: bool,
    pub message: Option<String>,
}

/// A decoded body.
///
/// `Raw` holds bytes that bypass the serialization plugin: outbound it is
/// written as-is, inbound it is produced for message types without a known
/// shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Invocation(Invocation),
    Response(ResponsePayload),
    Negotiation(Negotiation),
    Session(SessionPayload),
    Offline(OfflineNotice),
    Authentication(Authentication),
    AuthResult(AuthResult),
    Raw(Bytes),
}

impl Payload {
    /// Shape of this payload, `None` for raw bytes.
    pub fn kind(&self) -> Option<PayloadKind> {
        match self {
            Payload::Invocation(_) => Some(PayloadKind::Invocation),
            Payload::Response(_) => Some(PayloadKind::Response),
            Payload::Negotiation(_) => Some(PayloadKind::Negotiation),
            Payload::Session(_) => Some(PayloadKind::Session),
            Payload::Offline(_) => Some(PayloadKind::Offline),
            Payload::Authentication(_) => Some(PayloadKind::Authentication),
            Payload::AuthResult(_) => Some(PayloadKind::AuthResult),
            Payload::Raw(_) => None,
        }
    }

    /// Shape name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.kind().map_or("Raw", PayloadKind::name)
    }

    pub fn as_invocation(&self) -> Option<&Invocation> {
        match self {
            Payload::Invocation(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&ResponsePayload> {
        match self {
            Payload::Response(v) => Some(v),
            _ => None,
        }
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Payload::Invocation(v) => v.serialize(serializer),
            Payload::Response(v) => v.serialize(serializer),
            Payload::Negotiation(v) => v.serialize(serializer),
            Payload::Session(v) => v.serialize(serializer),
            Payload::Offline(v) => v.serialize(serializer),
            Payload::Authentication(v) => v.serialize(serializer),
            Payload::AuthResult(v) => v.serialize(serializer),
            Payload::Raw(b) => serializer.serialize_bytes(b),
        }
    }
}

impl From<Invocation> for Payload {
    fn from(v: Invocation) -> Self {
        Payload::Invocation(v)
    }
}

impl From<ResponsePayload> for Payload {
    fn from(v: ResponsePayload) -> Self {
        Payload::Response(v)
    }
}

impl From<Negotiation> for Payload {
    fn from(v: Negotiation) -> Self {
        Payload::Negotiation(v)
    }
}

impl From<SessionPayload> for Payload {
    fn from(v: SessionPayload) -> Self {
        Payload::Session(v)
    }
}

impl From<OfflineNotice> for Payload {
    fn from(v: OfflineNotice) -> Self {
        Payload::Offline(v)
    }
}

impl From<Authentication> for Payload {
    fn from(v: Authentication) -> Self {
        Payload::Authentication(v)
    }
}

impl From<AuthResult> for Payload {
    fn from(v: AuthResult) -> Self {
        Payload::AuthResult(v)
    }
}

impl From<Bytes> for Payload {
    fn from(v: Bytes) -> Self {
        Payload::Raw(v)
    }
}

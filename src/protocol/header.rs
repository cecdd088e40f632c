//! Message header model.
//!
//! A [`Header`] is a plain value: cloning it copies every scalar field, but the
//! [`Attributes`] map is shared by reference between the clones. Mutating a
//! clone's `msg_id` never affects the original; inserting into its attributes
//! does. Use [`Attributes::deep_clone`] for an independent map.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use super::message_type::MsgType;
use super::session::{Session, SessionManager};
use super::wire_format::attr_type;

/// Typed attribute value. The variant is preserved across the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Int32(i32),
    Int16(i16),
    Int8(i8),
    Str(String),
}

impl AttrValue {
    /// Wire type tag for this value.
    #[inline]
    pub fn type_tag(&self) -> u8 {
        match self {
            AttrValue::Int32(_) => attr_type::INT32,
            AttrValue::Str(_) => attr_type::STRING,
            AttrValue::Int8(_) => attr_type::INT8,
            AttrValue::Int16(_) => attr_type::INT16,
        }
    }

    /// Integer view of numeric values, widened to i32.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            AttrValue::Int32(v) => Some(*v),
            AttrValue::Int16(v) => Some(i32::from(*v)),
            AttrValue::Int8(v) => Some(i32::from(*v)),
            AttrValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Int32(v)
    }
}

impl From<i16> for AttrValue {
    fn from(v: i16) -> Self {
        AttrValue::Int16(v)
    }
}

impl From<i8> for AttrValue {
    fn from(v: i8) -> Self {
        AttrValue::Int8(v)
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

/// Extension attributes keyed by a small integer.
///
/// Safe for concurrent use from any number of tasks. Cloning an `Attributes`
/// yields a second handle onto the same map.
#[derive(Clone, Default)]
pub struct Attributes {
    inner: Arc<DashMap<u8, AttrValue>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous one for `key`.
    pub fn insert(&self, key: u8, value: impl Into<AttrValue>) -> Option<AttrValue> {
        self.inner.insert(key, value.into())
    }

    pub fn get(&self, key: u8) -> Option<AttrValue> {
        self.inner.get(&key).map(|v| v.value().clone())
    }

    pub fn remove(&self, key: u8) -> Option<AttrValue> {
        self.inner.remove(&key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: u8) -> bool {
        self.inner.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Point-in-time copy of all entries in ascending key order.
    pub fn snapshot(&self) -> BTreeMap<u8, AttrValue> {
        self.inner
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Independent copy that no longer shares storage with `self`.
    pub fn deep_clone(&self) -> Self {
        let copy = Self::new();
        for (k, v) in self.snapshot() {
            copy.inner.insert(k, v);
        }
        copy
    }

    /// Whether both handles point at the same map.
    pub fn ptr_eq(&self, other: &Attributes) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.snapshot()).finish()
    }
}

impl PartialEq for Attributes {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.snapshot() == other.snapshot()
    }
}

impl<K, V> FromIterator<(K, V)> for Attributes
where
    K: Into<u8>,
    V: Into<AttrValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let attrs = Attributes::new();
        for (k, v) in iter {
            attrs.insert(k.into(), v);
        }
        attrs
    }
}

/// Metadata preceding one payload on the wire.
///
/// `length` and `header_length` are only ever written by the codec; callers
/// read them after encode or decode.
#[derive(Clone)]
pub struct Header {
    length: u32,
    header_length: u16,
    /// Correlation id shared by a request and its response.
    pub msg_id: u32,
    /// Raw message type code (see [`MsgType`]).
    pub msg_type: u8,
    /// Logical session multiplexed over the connection.
    pub session_id: i32,
    /// Serialization plugin id.
    pub serialization: u8,
    /// Compression plugin id, 0 for none.
    pub compression: u8,
    /// Caller deadline in milliseconds; `<= 0` means use the default.
    pub timeout: i32,
    attributes: Attributes,
    session: Option<Arc<Session>>,
}

impl Header {
    /// Create a header for `msg_type` with the given correlation id.
    pub fn new(msg_type: MsgType, msg_id: u32) -> Self {
        Self::with_raw_type(msg_type.code(), msg_id)
    }

    /// Create a header with an arbitrary type code, used while decoding
    /// before the type is validated.
    pub fn with_raw_type(msg_type: u8, msg_id: u32) -> Self {
        Self {
            length: 0,
            header_length: 0,
            msg_id,
            msg_type,
            session_id: 0,
            serialization: 0,
            compression: 0,
            timeout: 0,
            attributes: Attributes::new(),
            session: None,
        }
    }

    pub fn with_session_id(mut self, session_id: i32) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_serialization(mut self, serialization: u8) -> Self {
        self.serialization = serialization;
        self
    }

    pub fn with_compression(mut self, compression: u8) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: i32) -> Self {
        self.timeout = timeout_ms;
        self
    }

    pub fn with_attribute(self, key: u8, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key, value);
        self
    }

    /// Total frame length from the length field on, as last encoded/decoded.
    #[inline]
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Header section length, as last encoded/decoded.
    #[inline]
    pub fn header_length(&self) -> u16 {
        self.header_length
    }

    pub(crate) fn set_lengths(&mut self, length: u32, header_length: u16) {
        self.length = length;
        self.header_length = header_length;
    }

    pub(crate) fn set_header_length(&mut self, header_length: u16) {
        self.header_length = header_length;
    }

    /// Resolved message type, `None` for codes outside the registry.
    pub fn message_type(&self) -> Option<MsgType> {
        MsgType::from_code(self.msg_type)
    }

    pub fn is_request(&self) -> bool {
        self.message_type().map(|t| t.is_request()).unwrap_or(false)
    }

    /// Shared attribute map.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Replace the attribute map handle.
    pub fn set_attributes(&mut self, attributes: Attributes) {
        self.attributes = attributes;
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    /// Attach a live session and adopt its id.
    pub fn set_session(&mut self, session: Arc<Session>) {
        self.session_id = session.id();
        self.session = Some(session);
    }

    /// Resolve the cached session from `session_id`.
    ///
    /// A positive id that differs from the cached session is looked up again
    /// (and the cache dropped if the manager does not know it). A
    /// non-positive id leaves whatever session was bound before untouched.
    pub fn bind_session(&mut self, sessions: &SessionManager) {
        if self.session_id <= 0 {
            return;
        }
        let stale = self
            .session
            .as_ref()
            .map(|s| s.id() != self.session_id)
            .unwrap_or(true);
        if stale {
            self.session = sessions.get(self.session_id);
        }
    }

    /// Effective timeout given a transport default.
    pub fn effective_timeout(&self, default_ms: u64) -> u64 {
        if self.timeout > 0 {
            self.timeout as u64
        } else {
            default_ms
        }
    }

    /// Build a reply header for this request.
    ///
    /// Copies `msg_id`, `serialization`, `session_id` and the bound session.
    /// Lengths start at zero and are recomputed on encode.
    pub fn response(
        &self,
        msg_type: MsgType,
        compression: u8,
        attributes: Option<Attributes>,
    ) -> Header {
        Header {
            length: 0,
            header_length: 0,
            msg_id: self.msg_id,
            msg_type: msg_type.code(),
            session_id: self.session_id,
            serialization: self.serialization,
            compression,
            timeout: 0,
            attributes: attributes.unwrap_or_default(),
            session: self.session.clone(),
        }
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("length", &self.length)
            .field("header_length", &self.header_length)
            .field("msg_id", &self.msg_id)
            .field("msg_type", &self.msg_type)
            .field("session_id", &self.session_id)
            .field("serialization", &self.serialization)
            .field("compression", &self.compression)
            .field("timeout", &self.timeout)
            .field("attributes", &self.attributes)
            .field("session", &self.session.as_ref().map(|s| s.id()))
            .finish()
    }
}

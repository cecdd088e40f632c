//! Closed registry of message kinds.
//!
//! Every code is part of a request/response pair. Lookup by byte is total:
//! [`MsgType::from_code`] returns `None` for unknown codes so the caller can
//! report the offending byte.

use std::fmt;

use crate::error::CodecError;

use super::payload::PayloadKind;

/// One-byte message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    BizReq = 0,
    BizResp = 1,
    NegotiationReq = 2,
    NegotiationResp = 3,
    HeartbeatReq = 4,
    HeartbeatResp = 5,
    SessionReq = 6,
    SessionResp = 7,
    CallbackReq = 8,
    CallbackResp = 9,
    OfflineReq = 10,
    OfflineResp = 11,
    AuthReq = 12,
    AuthResp = 13,
}

impl MsgType {
    /// Every registered type, ordered by code.
    pub const ALL: [MsgType; 14] = [
        MsgType::BizReq,
        MsgType::BizResp,
        MsgType::NegotiationReq,
        MsgType::NegotiationResp,
        MsgType::HeartbeatReq,
        MsgType::HeartbeatResp,
        MsgType::SessionReq,
        MsgType::SessionResp,
        MsgType::CallbackReq,
        MsgType::CallbackResp,
        MsgType::OfflineReq,
        MsgType::OfflineResp,
        MsgType::AuthReq,
        MsgType::AuthResp,
    ];

    /// Look up a code.
    #[inline]
    pub fn from_code(code: u8) -> Option<MsgType> {
        Self::ALL.get(code as usize).copied()
    }

    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Requests have even codes, their responses the next odd code.
    #[inline]
    pub fn is_request(self) -> bool {
        self.code() % 2 == 0
    }

    /// The other half of this request/response pair.
    pub fn pair(self) -> MsgType {
        let code = if self.is_request() {
            self.code() + 1
        } else {
            self.code() - 1
        };
        // Codes come in complete pairs, so the partner always exists.
        Self::ALL[code as usize]
    }

    /// Response type for a request; a response maps to itself.
    pub fn response_type(self) -> MsgType {
        if self.is_request() {
            self.pair()
        } else {
            self
        }
    }

    /// Statically known payload shape, `None` for bodiless control messages.
    pub fn payload_kind(self) -> Option<PayloadKind> {
        match self {
            MsgType::BizReq | MsgType::CallbackReq => Some(PayloadKind::Invocation),
            MsgType::BizResp | MsgType::CallbackResp => Some(PayloadKind::Response),
            MsgType::NegotiationReq | MsgType::NegotiationResp => Some(PayloadKind::Negotiation),
            MsgType::SessionReq => Some(PayloadKind::Session),
            MsgType::OfflineReq => Some(PayloadKind::Offline),
            MsgType::AuthReq => Some(PayloadKind::Authentication),
            MsgType::AuthResp => Some(PayloadKind::AuthResult),
            MsgType::HeartbeatReq
            | MsgType::HeartbeatResp
            | MsgType::SessionResp
            | MsgType::OfflineResp => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MsgType::BizReq => "BIZ_REQ",
            MsgType::BizResp => "BIZ_RESP",
            MsgType::NegotiationReq => "NEGOTIATION_REQ",
            MsgType::NegotiationResp => "NEGOTIATION_RESP",
            MsgType::HeartbeatReq => "HEARTBEAT_REQ",
            MsgType::HeartbeatResp => "HEARTBEAT_RESP",
            MsgType::SessionReq => "SESSION_REQ",
            MsgType::SessionResp => "SESSION_RESP",
            MsgType::CallbackReq => "CALLBACK_REQ",
            MsgType::CallbackResp => "CALLBACK_RESP",
            MsgType::OfflineReq => "OFFLINE_REQ",
            MsgType::OfflineResp => "OFFLINE_RESP",
            MsgType::AuthReq => "AUTH_REQ",
            MsgType::AuthResp => "AUTH_RESP",
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for MsgType {
    type Error = CodecError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        MsgType::from_code(code)
            .ok_or_else(|| CodecError::format(format!("unknown message type 0x{:02X}", code)))
    }
}

impl From<MsgType> for u8 {
    fn from(t: MsgType) -> u8 {
        t.code()
    }
}

//! Request and response messages.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::CodecError;

use super::header::Header;
use super::message_type::MsgType;
use super::payload::Payload;

/// Builds a correctly correlated response for a request.
///
/// Dialects with their own correlation rules plug a different factory into
/// the messages they decode.
pub trait ResponseFactory: Send + Sync {
    fn create(&self, request: &Header, payload: Option<Payload>) -> ResponseMessage;
}

/// Pairs each request type with its response type and keeps the request's
/// compression selector.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultResponseFactory;

impl ResponseFactory for DefaultResponseFactory {
    fn create(&self, request: &Header, payload: Option<Payload>) -> ResponseMessage {
        let msg_type = request
            .message_type()
            .map(MsgType::response_type)
            .unwrap_or(MsgType::BizResp);
        ResponseMessage {
            header: request.response(msg_type, request.compression, None),
            payload,
        }
    }
}

/// Inbound or outbound request.
#[derive(Clone)]
pub struct RequestMessage {
    pub header: Header,
    /// `None` for bodiless control requests.
    pub payload: Option<Payload>,
    /// When the frame finished decoding.
    pub received_at: Option<Instant>,
    /// Effective deadline once a transport default has been applied.
    pub timeout: Option<Duration>,
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    responder: Arc<dyn ResponseFactory>,
}

impl RequestMessage {
    pub fn new(header: Header, payload: Option<Payload>) -> Self {
        Self {
            header,
            payload,
            received_at: None,
            timeout: None,
            remote_addr: None,
            local_addr: None,
            responder: Arc::new(DefaultResponseFactory),
        }
    }

    pub fn with_responder(mut self, responder: Arc<dyn ResponseFactory>) -> Self {
        self.responder = responder;
        self
    }

    /// Factory used by [`response`](Self::response).
    pub fn responder(&self) -> &Arc<dyn ResponseFactory> {
        &self.responder
    }

    /// Build the response for this request.
    pub fn response(&self, payload: Option<Payload>) -> ResponseMessage {
        self.responder.create(&self.header, payload)
    }
}

impl fmt::Debug for RequestMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestMessage")
            .field("header", &self.header)
            .field("payload", &self.payload)
            .field("timeout", &self.timeout)
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ResponseMessage {
    pub header: Header,
    pub payload: Option<Payload>,
}

impl ResponseMessage {
    pub fn new(header: Header, payload: Option<Payload>) -> Self {
        Self { header, payload }
    }
}

/// A message travelling through the codec.
#[derive(Debug, Clone)]
pub enum Message {
    Request(RequestMessage),
    Response(ResponseMessage),
}

impl Message {
    /// Classify by the header's type code.
    ///
    /// Unknown codes are a format error carrying the header.
    pub fn from_header(header: Header, payload: Option<Payload>) -> Result<Self, CodecError> {
        let msg_type = MsgType::try_from(header.msg_type).map_err(|e| e.with_header(&header))?;
        Ok(if msg_type.is_request() {
            Message::Request(RequestMessage::new(header, payload))
        } else {
            Message::Response(ResponseMessage::new(header, payload))
        })
    }

    pub fn request(header: Header, payload: impl Into<Option<Payload>>) -> Self {
        Message::Request(RequestMessage::new(header, payload.into()))
    }

    pub fn response(header: Header, payload: impl Into<Option<Payload>>) -> Self {
        Message::Response(ResponseMessage::new(header, payload.into()))
    }

    pub fn header(&self) -> &Header {
        match self {
            Message::Request(r) => &r.header,
            Message::Response(r) => &r.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut Header {
        match self {
            Message::Request(r) => &mut r.header,
            Message::Response(r) => &mut r.header,
        }
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Message::Request(r) => r.payload.as_ref(),
            Message::Response(r) => r.payload.as_ref(),
        }
    }

    pub fn into_payload(self) -> Option<Payload> {
        match self {
            Message::Request(r) => r.payload,
            Message::Response(r) => r.payload,
        }
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    #[inline]
    pub fn msg_id(&self) -> u32 {
        self.header().msg_id
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        self.header().message_type()
    }
}

impl From<RequestMessage> for Message {
    fn from(r: RequestMessage) -> Self {
        Message::Request(r)
    }
}

impl From<ResponseMessage> for Message {
    fn from(r: ResponseMessage) -> Self {
        Message::Response(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::payload::ResponsePayload;

    #[test]
    fn test_classification() {
        let req = Message::from_header(Header::new(MsgType::HeartbeatReq, 1), None).unwrap();
        assert!(req.is_request());

        let resp = Message::from_header(Header::new(MsgType::HeartbeatResp, 1), None).unwrap();
        assert!(!resp.is_request());

        let err = Message::from_header(Header::with_raw_type(0x40, 9), None).unwrap_err();
        assert!(err.is_format());
        assert_eq!(err.header().map(|h| h.msg_id), Some(9));
    }

    #[test]
    fn test_default_response_factory() {
        let header = Header::new(MsgType::CallbackReq, 11)
            .with_session_id(3)
            .with_serialization(9)
            .with_compression(2);
        let req = RequestMessage::new(header, None);

        let resp = req.response(Some(ResponsePayload::ok(1).into()));
        assert_eq!(resp.header.message_type(), Some(MsgType::CallbackResp));
        assert_eq!(resp.header.msg_id, 11);
        assert_eq!(resp.header.session_id, 3);
        assert_eq!(resp.header.serialization, 9);
        assert_eq!(resp.header.compression, 2);
    }

    #[test]
    fn test_custom_responder() {
        struct AlwaysBiz;
        impl ResponseFactory for AlwaysBiz {
            fn create(&self, request: &Header, payload: Option<Payload>) -> ResponseMessage {
                ResponseMessage::new(request.response(MsgType::BizResp, 0, None), payload)
            }
        }

        let req = RequestMessage::new(Header::new(MsgType::HeartbeatReq, 5), None)
            .with_responder(Arc::new(AlwaysBiz));
        assert_eq!(req.response(None).header.message_type(), Some(MsgType::BizResp));
    }
}

// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{
    headers::Headers,
    method::Method,
    uri::Uri,
    via::{generate_tag, ViaHeader},
};

const MAX_REASON_LENGTH: usize = 256;
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024; // 10MB

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    InvalidStatusCode { code: u16 },
    ReasonTooLong { max: usize, actual: usize },
    InvalidReason(String),
    BodyTooLarge { max: usize, actual: usize },
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidStatusCode { code } => {
                write!(f, "invalid SIP status code: {} (must be 100-699)", code)
            }
            Self::ReasonTooLong { max, actual } => {
                write!(f, "reason phrase too long (max {}, got {})", max, actual)
            }
            Self::InvalidReason(msg) => write!(f, "invalid reason phrase: {}", msg),
            Self::BodyTooLarge { max, actual } => {
                write!(f, "body too large (max {}, got {})", max, actual)
            }
        }
    }
}

impl std::error::Error for MessageError {}

/// SIP version supported by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipVersion {
    V2,
}

impl SipVersion {
    pub const fn as_str(self) -> &'static str {
        match self {
            SipVersion::V2 => "SIP/2.0",
        }
    }
}

/// First line of a SIP request: `Method SP Request-URI SP SIP-Version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub uri: Uri,
    pub version: SipVersion,
}

impl RequestLine {
    pub fn new(method: Method, uri: impl Into<Uri>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: SipVersion::V2,
        }
    }
}

/// First line of a SIP response: `SIP-Version SP Status-Code SP Reason-Phrase`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: SipVersion,
    pub code: u16,
    pub reason: SmolStr,
}

impl StatusLine {
    /// Creates a validated status line.
    ///
    /// # Examples
    ///
    /// ```
    /// use sip_core::StatusLine;
    ///
    /// let status = StatusLine::new(200, "OK").unwrap();
    /// assert_eq!(status.code, 200);
    /// assert!(StatusLine::new(99, "Invalid").is_err());
    /// assert!(StatusLine::new(200, "OK\r\nInjected").is_err());
    /// ```
    pub fn new(code: u16, reason: impl AsRef<str>) -> Result<Self, MessageError> {
        if !(100..=699).contains(&code) {
            return Err(MessageError::InvalidStatusCode { code });
        }
        let reason = reason.as_ref();
        if reason.len() > MAX_REASON_LENGTH {
            return Err(MessageError::ReasonTooLong {
                max: MAX_REASON_LENGTH,
                actual: reason.len(),
            });
        }
        if reason.chars().any(|c| c.is_control() && c != '\t') {
            return Err(MessageError::InvalidReason(
                "contains control characters".to_owned(),
            ));
        }
        Ok(Self {
            version: SipVersion::V2,
            code,
            reason: SmolStr::new(reason),
        })
    }

    pub fn is_provisional(&self) -> bool {
        self.code < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// Parsed `CSeq` header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = Method::from_token(parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        Some(Self { seq, method })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

fn validate_body_size(body: &Bytes) -> Result<(), MessageError> {
    if body.len() > MAX_BODY_SIZE {
        return Err(MessageError::BodyTooLarge {
            max: MAX_BODY_SIZE,
            actual: body.len(),
        });
    }
    Ok(())
}

/// In-memory SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub start: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Result<Self, MessageError> {
        validate_body_size(&body)?;
        Ok(Self {
            start,
            headers,
            body,
        })
    }

    pub fn method(&self) -> &Method {
        &self.start.method
    }

    pub fn uri(&self) -> &Uri {
        &self.start.uri
    }

    /// Builds a response to this request (RFC 3261 §8.2.6.2).
    ///
    /// Via, From, To, Call-ID and CSeq are copied; a To tag is added to
    /// non-100 responses whose To header lacks one.
    pub fn response(&self, code: u16, reason: &str) -> Result<Response, MessageError> {
        let status = StatusLine::new(code, reason)?;
        let mut headers = Headers::new();
        for via in self.headers.get_all("Via") {
            headers.push("Via", via.clone());
        }
        if let Some(from) = self.headers.get("From") {
            headers.push("From", from.clone());
        }
        if let Some(to) = self.headers.get("To") {
            if code > 100 && !has_tag(to) {
                headers.push("To", format!("{};tag={}", to, generate_tag()));
            } else {
                headers.push("To", to.clone());
            }
        }
        for name in ["Call-ID", "CSeq"] {
            if let Some(value) = self.headers.get(name) {
                headers.push(name, value.clone());
            }
        }
        Response::new(status, headers, Bytes::new())
    }
}

/// In-memory SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub start: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Result<Self, MessageError> {
        validate_body_size(&body)?;
        Ok(Self {
            start,
            headers,
            body,
        })
    }

    pub fn code(&self) -> u16 {
        self.start.code
    }
}

/// Returns `true` when a From/To value carries a `tag` parameter.
pub fn has_tag(value: &str) -> bool {
    let params = match value.rfind('>') {
        Some(idx) => &value[idx + 1..],
        None => value,
    };
    params
        .split(';')
        .skip(1)
        .any(|p| p.trim().to_ascii_lowercase().starts_with("tag="))
}

/// Either kind of SIP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(res) => &res.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            SipMessage::Request(req) => &mut req.headers,
            SipMessage::Response(res) => &mut res.headers,
        }
    }

    pub fn body(&self) -> &Bytes {
        match self {
            SipMessage::Request(req) => &req.body,
            SipMessage::Response(res) => &res.body,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            SipMessage::Request(req) => Some(req),
            SipMessage::Response(_) => None,
        }
    }

    pub fn call_id(&self) -> Option<&SmolStr> {
        self.headers().get("Call-ID")
    }

    pub fn cseq(&self) -> Option<CSeq> {
        self.headers().get("CSeq").and_then(|v| CSeq::parse(v))
    }

    /// Parses the topmost Via element, looking through comma-joined values.
    pub fn top_via(&self) -> Option<ViaHeader> {
        top_via(self.headers())
    }
}

impl From<Request> for SipMessage {
    fn from(req: Request) -> Self {
        SipMessage::Request(req)
    }
}

impl From<Response> for SipMessage {
    fn from(res: Response) -> Self {
        SipMessage::Response(res)
    }
}

/// Parses the topmost Via element from a header collection.
pub fn top_via(headers: &Headers) -> Option<ViaHeader> {
    let first = headers.get("Via")?;
    let element = crate::headers::split_list(first).into_iter().next()?;
    ViaHeader::parse(&element)
}

/// Replaces the topmost Via element, keeping any comma-joined followers.
pub fn replace_top_via(headers: &mut Headers, via: &ViaHeader) {
    let rest: Vec<SmolStr> = headers
        .get("Via")
        .map(|v| crate::headers::split_list(v).into_iter().skip(1).collect())
        .unwrap_or_default();
    let mut value = via.to_string();
    for element in rest {
        value.push_str(", ");
        value.push_str(&element);
    }
    if headers.get("Via").is_some() {
        headers.set("Via", value);
    } else {
        headers.push_front("Via", value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uri::SipUri;

    fn invite() -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP a.example.com;branch=z9hG4bK1, SIP/2.0/UDP b;branch=z9hG4bK0");
        headers.push("From", "<sip:alice@example.com>;tag=abc");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "call-1");
        headers.push("CSeq", "7 INVITE");
        Request::new(
            RequestLine::new(Method::Invite, SipUri::parse("sip:bob@example.com").unwrap()),
            headers,
            Bytes::new(),
        )
        .unwrap()
    }

    #[test]
    fn response_copies_dialog_headers_and_tags_to() {
        let req = invite();
        let ringing = req.response(180, "Ringing").unwrap();
        assert_eq!(ringing.headers.get("Call-ID").map(SmolStr::as_str), Some("call-1"));
        assert_eq!(ringing.headers.get("CSeq").map(SmolStr::as_str), Some("7 INVITE"));
        assert!(has_tag(ringing.headers.get("To").unwrap()));

        let trying = req.response(100, "Trying").unwrap();
        assert!(!has_tag(trying.headers.get("To").unwrap()));
    }

    #[test]
    fn top_via_reads_first_comma_element() {
        let msg = SipMessage::from(invite());
        let via = msg.top_via().unwrap();
        assert_eq!(via.host, "a.example.com");
        assert_eq!(via.branch(), Some("z9hG4bK1"));
    }

    #[test]
    fn replace_top_via_keeps_followers() {
        let mut req = invite();
        let mut via = top_via(&req.headers).unwrap();
        via.set_param("received", Some("192.0.2.7"));
        replace_top_via(&mut req.headers, &via);
        let value = req.headers.get("Via").unwrap();
        assert!(value.starts_with("SIP/2.0/UDP a.example.com;branch=z9hG4bK1;received=192.0.2.7, "));
        assert!(value.ends_with("SIP/2.0/UDP b;branch=z9hG4bK0"));
    }

    #[test]
    fn cseq_parsing() {
        assert_eq!(
            CSeq::parse("42 OPTIONS"),
            Some(CSeq {
                seq: 42,
                method: Method::Options
            })
        );
        assert!(CSeq::parse("x OPTIONS").is_none());
        assert!(CSeq::parse("1").is_none());
    }

    #[test]
    fn tag_detection_ignores_uri_params() {
        assert!(!has_tag("<sip:bob@example.com;tag=inside>"));
        assert!(has_tag("<sip:bob@example.com>;tag=1"));
        assert!(has_tag("sip:bob@example.com;tag=1"));
    }
}

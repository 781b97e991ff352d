// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Incremental SIP message parser and serializer.
//!
//! [`MessageParser`] consumes bytes as they arrive and yields complete
//! [`SipMessage`]s. The same state machine serves both transport families:
//!
//! - **Datagram** (UDP): each `feed` is one whole message. A missing
//!   `Content-Length` means an empty body, trailing bytes past the declared
//!   length are discarded and any error drops just that datagram.
//! - **Stream** (TCP/TLS): bytes may arrive in arbitrary fragments and many
//!   messages share one buffer. `Content-Length` is mandatory and any framing
//!   error moves the parser to [`ParserState::Error`] for good, after which
//!   the connection has to be closed.
//!
//! Keep-alive pings (`CRLF CRLF`, RFC 5626 §4.4.1) between messages are
//! consumed and counted so the transport can answer them.

use std::fmt;

use bytes::{Bytes, BytesMut};
use sip_core::{
    Headers, MessageError, Method, Request, RequestLine, Response, SipMessage, StatusLine, Uri,
};
use smol_str::SmolStr;

mod validate;

pub use validate::validate_message;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Errors raised while decoding or validating a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    InvalidStartLine(String),
    InvalidHeader(String),
    InvalidContentLength(String),
    /// Stream framing requires `Content-Length`.
    MissingContentLength,
    /// A datagram ended before the headers or declared body were complete.
    Truncated,
    TooLarge { max: usize, actual: usize },
    InvalidUtf8,
    Message(MessageError),
    /// The stream lost framing earlier; the connection must be dropped.
    Desynchronized,
    MissingHeader(&'static str),
    DuplicateHeader(&'static str),
    InvalidVia(String),
    CSeqMismatch { method: Method, cseq: Method },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidStartLine(line) => write!(f, "invalid start line: {:?}", line),
            Self::InvalidHeader(line) => write!(f, "invalid header line: {:?}", line),
            Self::InvalidContentLength(value) => write!(f, "invalid Content-Length: {:?}", value),
            Self::MissingContentLength => write!(f, "Content-Length required on stream transports"),
            Self::Truncated => write!(f, "message truncated"),
            Self::TooLarge { max, actual } => {
                write!(f, "message too large (max {}, got {})", max, actual)
            }
            Self::InvalidUtf8 => write!(f, "header section is not valid UTF-8"),
            Self::Message(err) => write!(f, "{}", err),
            Self::Desynchronized => write!(f, "stream desynchronized by an earlier framing error"),
            Self::MissingHeader(name) => write!(f, "missing mandatory header {}", name),
            Self::DuplicateHeader(name) => write!(f, "header {} appears more than once", name),
            Self::InvalidVia(value) => write!(f, "invalid Via: {:?}", value),
            Self::CSeqMismatch { method, cseq } => {
                write!(f, "CSeq method {} does not match request method {}", cseq, method)
            }
        }
    }
}

impl std::error::Error for ParseError {}

impl From<MessageError> for ParseError {
    fn from(err: MessageError) -> Self {
        ParseError::Message(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Datagram,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Waiting for a request-line or status-line.
    Start,
    Headers,
    Body,
    /// A message was just emitted; the next byte starts a new one.
    End,
    Error,
}

#[derive(Debug)]
enum StartLine {
    Request(RequestLine),
    Response(StatusLine),
}

/// Stateful decoder owned by one datagram socket or one stream connection.
#[derive(Debug)]
pub struct MessageParser {
    mode: ParseMode,
    state: ParserState,
    max_size: usize,
    buf: BytesMut,
    start: Option<StartLine>,
    headers: Headers,
    pending: Option<(SmolStr, String)>,
    content_length: usize,
    /// Bytes of the current message consumed so far.
    consumed: usize,
    blank_lines: usize,
    keepalives: u64,
}

impl MessageParser {
    pub fn new(mode: ParseMode) -> Self {
        Self {
            mode,
            state: ParserState::Start,
            max_size: DEFAULT_MAX_MESSAGE_SIZE,
            buf: BytesMut::new(),
            start: None,
            headers: Headers::new(),
            pending: None,
            content_length: 0,
            consumed: 0,
            blank_lines: 0,
            keepalives: 0,
        }
    }

    pub fn datagram() -> Self {
        Self::new(ParseMode::Datagram)
    }

    pub fn stream() -> Self {
        Self::new(ParseMode::Stream)
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn mode(&self) -> ParseMode {
        self.mode
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Number of double-CRLF keep-alive pings seen so far.
    pub fn keepalives(&self) -> u64 {
        self.keepalives
    }

    /// Bytes buffered but not yet part of an emitted message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drops all buffered bytes and partial state, returning to `Start`.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.clear_message();
        self.state = ParserState::Start;
        self.blank_lines = 0;
    }

    /// Feeds newly received bytes, returning every message they complete.
    ///
    /// In datagram mode `data` is one whole datagram and at most one message
    /// is returned. In stream mode zero or more messages are returned and an
    /// incomplete tail stays buffered for the next call. A framing error
    /// that follows complete messages in the same chunk still returns those
    /// messages; callers check [`state`](Self::state) for `Error` afterwards.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<SipMessage>, ParseError> {
        match self.mode {
            ParseMode::Datagram => self.feed_datagram(data),
            ParseMode::Stream => self.feed_stream(data),
        }
    }

    fn feed_datagram(&mut self, data: &[u8]) -> Result<Vec<SipMessage>, ParseError> {
        self.reset();
        if data.len() > self.max_size {
            return Err(ParseError::TooLarge {
                max: self.max_size,
                actual: data.len(),
            });
        }
        self.buf.extend_from_slice(data);
        let outcome = self.advance(true);
        let only_keepalive = self.state == ParserState::Start && self.start.is_none();
        self.reset();
        match outcome {
            Ok(Some(msg)) => Ok(vec![msg]),
            Ok(None) if only_keepalive => Ok(Vec::new()),
            Ok(None) => Err(ParseError::Truncated),
            Err(err) => Err(err),
        }
    }

    fn feed_stream(&mut self, data: &[u8]) -> Result<Vec<SipMessage>, ParseError> {
        if self.state == ParserState::Error {
            return Err(ParseError::Desynchronized);
        }
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        loop {
            match self.advance(false) {
                Ok(Some(msg)) => out.push(msg),
                Ok(None) => return Ok(out),
                Err(err) => {
                    self.buf.clear();
                    self.clear_message();
                    self.state = ParserState::Error;
                    if out.is_empty() {
                        return Err(err);
                    }
                    return Ok(out);
                }
            }
        }
    }

    /// Runs the state machine until a message completes or input runs out.
    fn advance(&mut self, eof: bool) -> Result<Option<SipMessage>, ParseError> {
        loop {
            match self.state {
                ParserState::End => {
                    self.clear_message();
                    self.state = ParserState::Start;
                }
                ParserState::Start => {
                    let Some(line) = self.next_line(eof)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.blank_lines += 1;
                        if self.blank_lines == 2 {
                            self.keepalives += 1;
                            self.blank_lines = 0;
                        }
                        self.consumed = 0;
                        continue;
                    }
                    self.blank_lines = 0;
                    self.start = Some(parse_start_line(&line)?);
                    self.state = ParserState::Headers;
                }
                ParserState::Headers => {
                    let Some(line) = self.next_line(eof)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.flush_header();
                        self.content_length = self.declared_length()?;
                        self.state = ParserState::Body;
                    } else if line.starts_with(|c: char| c == ' ' || c == '\t') {
                        let Some((_, value)) = self.pending.as_mut() else {
                            return Err(ParseError::InvalidHeader(line));
                        };
                        let folded = line.trim();
                        if !folded.is_empty() {
                            if !value.is_empty() {
                                value.push(' ');
                            }
                            value.push_str(folded);
                        }
                    } else {
                        self.flush_header();
                        let (name, value) = split_header(&line)?;
                        self.pending = Some((SmolStr::new(name), value.to_owned()));
                    }
                }
                ParserState::Body => {
                    if self.buf.len() < self.content_length {
                        if eof {
                            return Err(ParseError::Truncated);
                        }
                        return Ok(None);
                    }
                    let body = self.buf.split_to(self.content_length).freeze();
                    let msg = self.build(body)?;
                    self.state = ParserState::End;
                    return Ok(Some(msg));
                }
                ParserState::Error => return Err(ParseError::Desynchronized),
            }
        }
    }

    /// Takes the next line from the buffer without its terminator.
    ///
    /// Both CRLF and bare LF terminate a line. At datagram end an
    /// unterminated tail counts as a final line, and running out of bytes in
    /// the header section ends it.
    fn next_line(&mut self, eof: bool) -> Result<Option<String>, ParseError> {
        let raw = match memchr::memchr(b'\n', &self.buf) {
            Some(idx) => {
                let mut line = self.buf.split_to(idx + 1);
                line.truncate(idx);
                if line.last() == Some(&b'\r') {
                    line.truncate(idx - 1);
                }
                self.track(idx + 1)?;
                line
            }
            None if eof && !self.buf.is_empty() => {
                let len = self.buf.len();
                let line = self.buf.split_to(len);
                self.track(len)?;
                line
            }
            None if eof && self.state == ParserState::Headers => BytesMut::new(),
            None => {
                self.track_pending()?;
                return Ok(None);
            }
        };
        String::from_utf8(raw.to_vec())
            .map(Some)
            .map_err(|_| ParseError::InvalidUtf8)
    }

    fn track(&mut self, len: usize) -> Result<(), ParseError> {
        self.consumed += len;
        if self.consumed > self.max_size {
            return Err(ParseError::TooLarge {
                max: self.max_size,
                actual: self.consumed,
            });
        }
        Ok(())
    }

    fn track_pending(&self) -> Result<(), ParseError> {
        let actual = self.consumed + self.buf.len();
        if actual > self.max_size {
            return Err(ParseError::TooLarge {
                max: self.max_size,
                actual,
            });
        }
        Ok(())
    }

    fn flush_header(&mut self) {
        if let Some((name, value)) = self.pending.take() {
            self.headers.push(name, value.trim());
        }
    }

    fn declared_length(&self) -> Result<usize, ParseError> {
        let mut declared: Option<usize> = None;
        for value in self.headers.get_all("Content-Length") {
            let len = value
                .trim()
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidContentLength(value.to_string()))?;
            if declared.is_some_and(|prev| prev != len) {
                return Err(ParseError::InvalidContentLength(value.to_string()));
            }
            declared = Some(len);
        }
        let len = match (declared, self.mode) {
            (Some(len), _) => len,
            (None, ParseMode::Datagram) => 0,
            (None, ParseMode::Stream) => return Err(ParseError::MissingContentLength),
        };
        if self.consumed + len > self.max_size {
            return Err(ParseError::TooLarge {
                max: self.max_size,
                actual: self.consumed + len,
            });
        }
        Ok(len)
    }

    fn build(&mut self, body: Bytes) -> Result<SipMessage, ParseError> {
        let headers = std::mem::take(&mut self.headers);
        match self.start.take() {
            Some(StartLine::Request(line)) => Ok(Request::new(line, headers, body)?.into()),
            Some(StartLine::Response(line)) => Ok(Response::new(line, headers, body)?.into()),
            None => Err(ParseError::InvalidStartLine(String::new())),
        }
    }

    fn clear_message(&mut self) {
        self.start = None;
        self.headers = Headers::new();
        self.pending = None;
        self.content_length = 0;
        self.consumed = 0;
    }
}

/// Parses one complete datagram.
pub fn parse_message(data: &[u8]) -> Result<SipMessage, ParseError> {
    MessageParser::datagram()
        .feed(data)?
        .pop()
        .ok_or(ParseError::Truncated)
}

fn split_header(line: &str) -> Result<(&str, &str), ParseError> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| ParseError::InvalidHeader(line.to_owned()))?;
    let name = name.trim_end();
    if name.is_empty() || !name.chars().all(is_token_char) {
        return Err(ParseError::InvalidHeader(line.to_owned()));
    }
    Ok((name, value.trim()))
}

fn parse_start_line(line: &str) -> Result<StartLine, ParseError> {
    let invalid = || ParseError::InvalidStartLine(line.to_owned());
    if line.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("SIP/")) {
        let (code, reason) = parse_status_line(line).ok_or_else(invalid)?;
        return Ok(StartLine::Response(StatusLine::new(code, reason)?));
    }
    let (method, uri) = parse_request_line(line).ok_or_else(invalid)?;
    let uri = Uri::parse(uri).ok_or_else(invalid)?;
    Ok(StartLine::Request(RequestLine::new(Method::from_token(method), uri)))
}

/// `Method SP Request-URI SP SIP/2.0`
fn parse_request_line(line: &str) -> Option<(&str, &str)> {
    use nom::{
        bytes::complete::{tag_no_case, take_while1},
        character::complete::{space0, space1},
        combinator::eof,
        sequence::tuple,
    };

    let mut parser = tuple((
        take_while1::<_, _, nom::error::Error<_>>(is_token_char),
        space1,
        take_while1(|c: char| !c.is_whitespace()),
        space1,
        tag_no_case("SIP/2.0"),
        space0,
        eof,
    ));
    let (_, (method, _, uri, _, _, _, _)) = parser(line).ok()?;
    Some((method, uri))
}

/// `SIP/2.0 SP Status-Code SP Reason-Phrase`; the reason may be empty.
fn parse_status_line(line: &str) -> Option<(u16, &str)> {
    use nom::{
        bytes::complete::{tag_no_case, take_while_m_n},
        character::complete::space1,
        combinator::{opt, rest},
        sequence::{preceded, tuple},
    };

    let mut parser = tuple((
        tag_no_case::<_, _, nom::error::Error<_>>("SIP/2.0"),
        space1,
        take_while_m_n(3, 3, |c: char| c.is_ascii_digit()),
        opt(preceded(space1, rest)),
    ));
    let (remaining, (_, _, code, reason)) = parser(line).ok()?;
    if !remaining.trim().is_empty() {
        return None;
    }
    Some((code.parse().ok()?, reason.unwrap_or("").trim()))
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '%' | '\'' | '*' | '+' | '-' | '.' | '_' | '`' | '~'
        )
}

/// Serializes a request. `Content-Length` is rewritten to the real body size.
pub fn serialize_request(req: &Request) -> Bytes {
    let start = format!(
        "{} {} {}",
        req.start.method,
        req.start.uri,
        req.start.version.as_str()
    );
    serialize(&start, &req.headers, &req.body)
}

/// Serializes a response. `Content-Length` is rewritten to the real body size.
pub fn serialize_response(res: &Response) -> Bytes {
    let start = if res.start.reason.is_empty() {
        format!("{} {}", res.start.version.as_str(), res.start.code)
    } else {
        format!(
            "{} {} {}",
            res.start.version.as_str(),
            res.start.code,
            res.start.reason
        )
    };
    serialize(&start, &res.headers, &res.body)
}

pub fn serialize_message(msg: &SipMessage) -> Bytes {
    match msg {
        SipMessage::Request(req) => serialize_request(req),
        SipMessage::Response(res) => serialize_response(res),
    }
}

fn serialize(start: &str, headers: &Headers, body: &Bytes) -> Bytes {
    use std::fmt::Write;

    let mut buf = String::with_capacity(256);
    buf.push_str(start);
    buf.push_str("\r\n");
    let mut wrote_length = false;
    for header in headers {
        if header.name.eq_ignore_ascii_case("Content-Length") {
            if !wrote_length {
                let _ = write!(buf, "Content-Length: {}\r\n", body.len());
                wrote_length = true;
            }
            continue;
        }
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value);
    }
    if !wrote_length {
        let _ = write!(buf, "Content-Length: {}\r\n", body.len());
    }
    buf.push_str("\r\n");

    let mut out = BytesMut::with_capacity(buf.len() + body.len());
    out.extend_from_slice(buf.as_bytes());
    out.extend_from_slice(body);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const INVITE: &str = "INVITE sip:bob@example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP pc33.example.com;branch=z9hG4bK776asdhds\r\n\
        Max-Forwards: 70\r\n\
        To: Bob <sip:bob@example.com>\r\n\
        From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
        Call-ID: a84b4c76e66710\r\n\
        CSeq: 314159 INVITE\r\n\
        Content-Length: 4\r\n\
        \r\n\
        v=0\n";

    fn request(msg: SipMessage) -> Request {
        match msg {
            SipMessage::Request(req) => req,
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn parses_datagram_request() {
        let req = request(parse_message(INVITE.as_bytes()).unwrap());
        assert_eq!(req.method(), &Method::Invite);
        assert_eq!(req.uri().as_str(), "sip:bob@example.com");
        assert_eq!(req.headers.get("Call-ID").map(SmolStr::as_str), Some("a84b4c76e66710"));
        assert_eq!(req.body.as_ref(), b"v=0\n");
    }

    #[test]
    fn parses_response_with_empty_reason() {
        let raw = "SIP/2.0 200\r\nVia: SIP/2.0/UDP h;branch=z9hG4bK1\r\nContent-Length: 0\r\n\r\n";
        match parse_message(raw.as_bytes()).unwrap() {
            SipMessage::Response(res) => {
                assert_eq!(res.code(), 200);
                assert_eq!(res.start.reason, "");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn folded_lines_merge_into_previous_header() {
        let raw = "OPTIONS sip:a@b SIP/2.0\r\nSubject: I know you're there,\r\n  pick up\r\n\tthe phone\r\nl: 0\r\n\r\n";
        let req = request(parse_message(raw.as_bytes()).unwrap());
        assert_eq!(
            req.headers.get("Subject").map(SmolStr::as_str),
            Some("I know you're there, pick up the phone")
        );
    }

    #[test]
    fn continuation_before_any_header_is_rejected() {
        let raw = "OPTIONS sip:a@b SIP/2.0\r\n folded\r\n\r\n";
        assert!(matches!(
            parse_message(raw.as_bytes()),
            Err(ParseError::InvalidHeader(_))
        ));
    }

    #[test]
    fn compact_and_repeated_headers_keep_multiplicity() {
        let raw = "OPTIONS sip:a@b SIP/2.0\r\n\
            v: SIP/2.0/UDP one;branch=z9hG4bK1\r\n\
            Via: SIP/2.0/UDP two;branch=z9hG4bK2, SIP/2.0/UDP three;branch=z9hG4bK3\r\n\
            i: abc\r\n\r\n";
        let req = request(parse_message(raw.as_bytes()).unwrap());
        assert_eq!(req.headers.count("Via"), 2);
        assert_eq!(req.headers.list("Via").len(), 3);
        assert_eq!(req.headers.get("Call-ID").map(SmolStr::as_str), Some("abc"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn bare_lf_line_endings_are_accepted() {
        let raw = "OPTIONS sip:a@b SIP/2.0\nCall-ID: x\nContent-Length: 0\n\n";
        let req = request(parse_message(raw.as_bytes()).unwrap());
        assert_eq!(req.headers.get("Call-ID").map(SmolStr::as_str), Some("x"));
    }

    #[test]
    fn datagram_discards_bytes_past_content_length() {
        let raw = "OPTIONS sip:a@b SIP/2.0\r\nContent-Length: 2\r\n\r\nhi-extra";
        let req = request(parse_message(raw.as_bytes()).unwrap());
        assert_eq!(req.body.as_ref(), b"hi");
    }

    #[test]
    fn datagram_with_short_body_is_dropped_and_parser_recovers() {
        let mut parser = MessageParser::datagram();
        let raw = "OPTIONS sip:a@b SIP/2.0\r\nContent-Length: 20\r\n\r\nshort";
        assert_eq!(parser.feed(raw.as_bytes()), Err(ParseError::Truncated));
        assert_eq!(parser.state(), ParserState::Start);
        assert_eq!(parser.feed(INVITE.as_bytes()).unwrap().len(), 1);
    }

    #[test]
    fn datagram_garbage_resets_to_start() {
        let mut parser = MessageParser::datagram();
        assert!(matches!(
            parser.feed(b"hello world\r\n\r\n"),
            Err(ParseError::InvalidStartLine(_))
        ));
        assert_eq!(parser.state(), ParserState::Start);
        assert!(parser.feed(b"\r\n\r\n").unwrap().is_empty());
    }

    #[test]
    fn lowercase_method_is_an_extension_method() {
        let raw = "invite sip:a@b SIP/2.0\r\n\r\n";
        let req = request(parse_message(raw.as_bytes()).unwrap());
        assert_eq!(req.method(), &Method::Unknown(SmolStr::new("invite")));
    }

    #[test]
    fn rejects_bad_version_and_status() {
        assert!(parse_message(b"OPTIONS sip:a@b SIP/3.0\r\n\r\n").is_err());
        assert!(parse_message(b"SIP/2.0 2000 OK\r\n\r\n").is_err());
        assert!(parse_message(b"SIP/2.0 099 Nope\r\n\r\n").is_err());
    }

    #[test]
    fn conflicting_content_lengths_are_rejected() {
        let raw = "OPTIONS sip:a@b SIP/2.0\r\nContent-Length: 1\r\nl: 2\r\n\r\nab";
        assert!(matches!(
            parse_message(raw.as_bytes()),
            Err(ParseError::InvalidContentLength(_))
        ));
    }

    #[test]
    fn stream_reassembles_fragments_and_pipelined_messages() {
        let mut parser = MessageParser::stream();
        let both = format!("{INVITE}{INVITE}");
        let bytes = both.as_bytes();
        let mut emitted = Vec::new();
        for chunk in bytes.chunks(7) {
            emitted.extend(parser.feed(chunk).unwrap());
        }
        assert_eq!(emitted.len(), 2);
        assert_eq!(parser.buffered(), 0);
        assert_eq!(parser.state(), ParserState::End);
    }

    #[test]
    fn stream_counts_keepalive_pings() {
        let mut parser = MessageParser::stream();
        assert!(parser.feed(b"\r\n\r\n").unwrap().is_empty());
        assert!(parser.feed(b"\r\n").unwrap().is_empty());
        assert!(parser.feed(b"\r\n").unwrap().is_empty());
        assert_eq!(parser.keepalives(), 2);
        assert_eq!(parser.feed(INVITE.as_bytes()).unwrap().len(), 1);
    }

    #[test]
    fn stream_without_content_length_is_a_framing_error() {
        let mut parser = MessageParser::stream();
        let raw = "OPTIONS sip:a@b SIP/2.0\r\nCall-ID: x\r\n\r\n";
        assert_eq!(
            parser.feed(raw.as_bytes()),
            Err(ParseError::MissingContentLength)
        );
        assert_eq!(parser.state(), ParserState::Error);
        assert_eq!(
            parser.feed(INVITE.as_bytes()),
            Err(ParseError::Desynchronized)
        );
    }

    #[test]
    fn stream_returns_messages_preceding_a_framing_error() {
        let mut parser = MessageParser::stream();
        let chunk = format!("{INVITE}garbage line\r\n");
        let out = parser.feed(chunk.as_bytes()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(parser.state(), ParserState::Error);
    }

    #[test]
    fn stream_rejects_oversized_header_section() {
        let mut parser = MessageParser::stream().with_max_size(64);
        let mut raw = String::from("OPTIONS sip:a@b SIP/2.0\r\nX-Filler: ");
        raw.push_str(&"a".repeat(100));
        assert!(matches!(
            parser.feed(raw.as_bytes()),
            Err(ParseError::TooLarge { max: 64, .. })
        ));
        assert_eq!(parser.state(), ParserState::Error);
    }

    #[test]
    fn serializer_rewrites_content_length_in_place() {
        let mut req = request(parse_message(INVITE.as_bytes()).unwrap());
        req.body = Bytes::from_static(b"longer body");
        let text = String::from_utf8(serialize_request(&req).to_vec()).unwrap();
        let names: Vec<&str> = text
            .lines()
            .skip(1)
            .take_while(|l| !l.is_empty())
            .filter_map(|l| l.split_once(':').map(|(n, _)| n))
            .collect();
        assert_eq!(names.last(), Some(&"Content-Length"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.ends_with("\r\n\r\nlonger body"));
    }

    #[test]
    fn serializer_appends_missing_content_length() {
        let req = request(parse_message(b"OPTIONS sip:a@b SIP/2.0\r\nCall-ID: x\r\n\r\n").unwrap());
        let text = String::from_utf8(serialize_request(&req).to_vec()).unwrap();
        assert_eq!(
            text,
            "OPTIONS sip:a@b SIP/2.0\r\nCall-ID: x\r\nContent-Length: 0\r\n\r\n"
        );
    }

    fn header_name() -> impl Strategy<Value = &'static str> {
        prop::sample::select(vec![
            "Via", "v", "Route", "Record-Route", "Contact", "m", "Supported", "k",
            "Subject", "s", "X-Custom", "Allow",
        ])
    }

    proptest! {
        #[test]
        fn serialize_then_parse_preserves_headers(
            headers in prop::collection::vec(
                (header_name(), "[a-z0-9]{1,8}( [a-z0-9;=]{1,8})?"),
                0..12,
            ),
            body in "[a-z0-9 ]{0,32}",
        ) {
            let mut raw = String::from("MESSAGE sip:bob@example.com SIP/2.0\r\n");
            for (name, value) in &headers {
                raw.push_str(&format!("{name}: {value}\r\n"));
            }
            raw.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));

            let first = request(parse_message(raw.as_bytes()).unwrap());
            let second = request(parse_message(&serialize_request(&first)).unwrap());
            prop_assert_eq!(&first, &second);

            let expected: Vec<(SmolStr, &str)> = headers
                .iter()
                .map(|(n, v)| (sip_core::canonical_name(n), v.as_str()))
                .collect();
            let parsed: Vec<(SmolStr, &str)> = second
                .headers
                .iter()
                .filter(|h| h.name != "Content-Length")
                .map(|h| (h.name.clone(), h.value.as_str()))
                .collect();
            prop_assert_eq!(parsed, expected);
            prop_assert_eq!(second.body.as_ref(), body.as_bytes());
        }

        #[test]
        fn stream_chunking_does_not_change_result(split in 1usize..40) {
            let mut parser = MessageParser::stream();
            let mut out = Vec::new();
            for chunk in INVITE.as_bytes().chunks(split) {
                out.extend(parser.feed(chunk).unwrap());
            }
            prop_assert_eq!(out.len(), 1);
            prop_assert_eq!(out.pop().unwrap(), parse_message(INVITE.as_bytes()).unwrap());
        }
    }
}

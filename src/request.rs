//! Incremental decoding of HTTP requests.
//!
//! [`RequestParser`] is fed raw bytes as they arrive and makes progress byte by byte;
//! a request line, header, or body may be split across any number of `feed` calls.
//! Progress is reported through [`ParseEvent`]s so the connection can dispatch a
//! handler as soon as the `Host` header is seen, write an interim `100 Continue`, and
//! stream opaque body chunks without waiting for the request to finish.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::ascii::{AMP, CR, EQ, LF, url_decode};
use crate::header::{
    HEAD_AUTHORIZATION, HEAD_CONNECTION, HEAD_CONTENT_LENGTH, HEAD_CONTENT_TYPE, HEAD_EXPECT,
    HEAD_HOST, HEAD_SEC_WEBSOCKET_KEY, HEAD_SEC_WEBSOCKET_VERSION, HEAD_UPGRADE, Headers,
    RETAIN_ANY,
};
use crate::log::trace;
use crate::multipart::{MultipartDecoder, MultipartError, Part, UploadSink};

// Headers the websocket upgrade path needs, retained on every request.
const BUILTIN_RETAIN: [&str; 4] = [
    HEAD_UPGRADE,
    HEAD_CONNECTION,
    HEAD_SEC_WEBSOCKET_KEY,
    HEAD_SEC_WEBSOCKET_VERSION,
];

/// Errors produced while parsing a request.  All of them are fatal to the connection.
#[derive(Debug, PartialEq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// The request line was structurally invalid
    #[error("malformed request line")]
    BadRequestLine,
    /// The request method is not a known HTTP method
    #[error("unknown http method")]
    UnknownMethod,
    /// A header line had no `:` separator
    #[error("malformed header line")]
    BadHeader,
    /// The Content-Length header was not an unsigned integer
    #[error("invalid content-length")]
    BadContentLength,
    /// Request text (request line, header, or decoded field) was not valid utf8
    #[error("request data is not valid utf8")]
    InvalidUtf8,
    /// The multipart body was malformed
    #[error("multipart decode failed: {0}")]
    Multipart(#[from] MultipartError),
    /// `feed` was called again after a previous call failed
    #[error("parser previously failed")]
    Failed,
}

const GET: &str = "GET";
const POST: &str = "POST";
const PUT: &str = "PUT";
const PATCH: &str = "PATCH";
const DELETE: &str = "DELETE";
const OPTIONS: &str = "OPTIONS";
const HEAD: &str = "HEAD";

/// Method such as GET. POST, DELETE etc.
#[non_exhaustive]
#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Method {
    #[allow(missing_docs)]
    GET,
    #[allow(missing_docs)]
    POST,
    #[allow(missing_docs)]
    PUT,
    #[allow(missing_docs)]
    PATCH,
    #[allow(missing_docs)]
    DELETE,
    #[allow(missing_docs)]
    OPTIONS,
    #[allow(missing_docs)]
    HEAD,
}

impl TryFrom<&str> for Method {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            GET => Ok(Self::GET),
            POST => Ok(Self::POST),
            PUT => Ok(Self::PUT),
            PATCH => Ok(Self::PATCH),
            DELETE => Ok(Self::DELETE),
            OPTIONS => Ok(Self::OPTIONS),
            HEAD => Ok(Self::HEAD),
            _ => Err("unknown http method"),
        }
    }
}

/// Where a parameter was decoded from.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParamKind {
    /// Query string
    Query,
    /// urlencoded (or plain text key=value) body field
    Form,
    /// multipart body field
    MultipartField,
    /// multipart file part; the value is the client supplied filename
    MultipartFile,
}

/// A decoded request parameter.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Param {
    /// Parameter name
    pub name: String,
    /// Decoded value, or the filename for file parts
    pub value: String,
    /// Origin of the parameter
    pub kind: ParamKind,
    /// Payload size in bytes for file parts, 0 otherwise
    pub size: usize,
}

/// Request contains the details of the request parsed from bytes read from the client.
#[non_exhaustive]
#[derive(Debug)]
pub struct Request {
    /// Method (GET, POST etc) parsed from the request
    pub method: Method,
    /// Percent-decoded URL path, without the query string
    pub url: String,
    /// 1 for HTTP/1.1 requests, 0 otherwise
    pub version: u8,
    /// Host extracted from the Host header
    pub host: String,
    /// Content-Type extracted from the Content-Type header where present
    pub content_type: Option<String>,
    /// Content length extracted from the Content-Length header if present else 0
    pub content_length: usize,
    authorization: Option<String>,
    boundary: Option<String>,
    expecting_continue: bool,
    params: Vec<Param>,
    headers: Headers,
}

impl Request {
    fn new() -> Self {
        Self {
            method: Method::GET,
            url: String::new(),
            version: 0,
            host: String::new(),
            content_type: None,
            content_length: 0,
            authorization: None,
            boundary: None,
            expecting_continue: false,
            params: Vec::new(),
            headers: Headers::new(),
        }
    }

    /// The verbatim Authorization header value, if one was sent.
    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }

    /// True if the client sent `Expect: 100-continue`.
    pub fn expecting_continue(&self) -> bool {
        self.expecting_continue
    }

    /// True if the body is `multipart/*` with a boundary.
    pub fn is_multipart(&self) -> bool {
        self.boundary.is_some()
    }

    /// Retained request headers, in wire order.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The value of the first retained header matching `name`, ignoring ascii case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// All query and body parameters, in decode order.
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// The first parameter named `name`.
    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }
}

/// Progress reported by [`RequestParser::feed`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParseEvent<'a> {
    /// All supplied bytes were consumed and the parser is waiting for more
    NeedMoreData,
    /// The Host header has been parsed; handler selection can happen now
    HostParsed,
    /// The header section is complete; a body follows if content_length > 0
    HeadersComplete,
    /// A slice of an opaque (non-form, non-multipart) body
    BodyChunk {
        /// The body bytes
        data: &'a [u8],
        /// Offset of `data` within the body
        index: usize,
        /// Declared body length
        total: usize,
    },
    /// The request, including any body, is complete
    RequestComplete,
}

#[derive(Debug, PartialEq)]
enum ParseState {
    Start,
    Headers,
    Body,
    End,
    Fail,
}

#[derive(Debug, PartialEq)]
enum BodyMode {
    Undecided,
    Probe,
    Fields,
    Opaque,
    Multipart,
}

const fn is_param_char(b: u8) -> bool {
    b != 0 && b != b'{' && b != b'[' && b != AMP && b != EQ
}

/// Incremental parser for one HTTP request.
pub struct RequestParser {
    state: ParseState,
    request: Request,
    line: Vec<u8>,
    retain: Vec<String>,
    retain_any: bool,
    body: BodyMode,
    parsed_len: usize,
    field: Vec<u8>,
    probe: Vec<u8>,
    multipart: Option<MultipartDecoder>,
    discard: bool,
    chunk_cap: usize,
}

impl RequestParser {
    /// Construct a parser.  `chunk_cap` bounds the file upload slice size and the
    /// plain text body probe.
    pub fn new(chunk_cap: usize) -> Self {
        Self {
            state: ParseState::Start,
            request: Request::new(),
            line: Vec::new(),
            retain: BUILTIN_RETAIN.iter().map(|s| s.to_string()).collect(),
            retain_any: false,
            body: BodyMode::Undecided,
            parsed_len: 0,
            field: Vec::new(),
            probe: Vec::new(),
            multipart: None,
            discard: false,
            chunk_cap,
        }
    }

    /// The request decoded so far.  Which fields are populated depends on how far the
    /// parse has progressed; after [`ParseEvent::HostParsed`] the request line and host
    /// are valid, after [`ParseEvent::RequestComplete`] everything is.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Register header names to retain on the request.  Headers not registered here
    /// (and not needed internally) are decoded then dropped.  Registering
    /// [`RETAIN_ANY`] retains every header.
    pub fn retain_headers(&mut self, names: &[&str]) {
        for name in names {
            if *name == RETAIN_ANY {
                self.retain_any = true;
            } else {
                self.retain.push(name.to_string());
            }
        }
    }

    /// Consume the remaining body without decoding fields or reporting chunks.  Used
    /// after the request has been rejected (e.g. body over the configured cap).
    pub fn discard_body(&mut self) {
        self.discard = true;
    }

    /// Consume bytes from `data`, returning how many were consumed and the event that
    /// stopped consumption.  The caller should keep calling with the unconsumed
    /// remainder (which may be empty) until [`ParseEvent::NeedMoreData`] or
    /// [`ParseEvent::RequestComplete`] is returned.  File parts of multipart bodies
    /// are delivered through `sink` as they are decoded.
    pub fn feed<'a>(
        &'a mut self,
        data: &'a [u8],
        sink: &mut dyn UploadSink,
    ) -> Result<(usize, ParseEvent<'a>), ParseError> {
        match self.state {
            ParseState::Start | ParseState::Headers => {
                for (i, &b) in data.iter().enumerate() {
                    if b != CR && b != LF {
                        self.line.push(b);
                    }
                    if b == LF
                        && let Some(ev) = self.parse_line()?
                    {
                        return Ok((i + 1, ev));
                    }
                }
                Ok((data.len(), ParseEvent::NeedMoreData))
            }
            ParseState::Body => self.feed_body(data, sink),
            ParseState::End => Ok((data.len(), ParseEvent::NeedMoreData)),
            ParseState::Fail => Err(ParseError::Failed),
        }
    }

    fn parse_line(&mut self) -> Result<Option<ParseEvent<'static>>, ParseError> {
        match self.state {
            ParseState::Start => {
                if self.line.is_empty() {
                    self.state = ParseState::Fail;
                    return Err(ParseError::BadRequestLine);
                }
                self.parse_request_line()?;
                self.line.clear();
                self.state = ParseState::Headers;
                Ok(None)
            }
            ParseState::Headers => {
                if self.line.is_empty() {
                    trace!("headers complete, content-length {}", self.request.content_length);
                    self.state = ParseState::Body;
                    Ok(Some(ParseEvent::HeadersComplete))
                } else {
                    self.parse_header_line()
                }
            }
            _ => Ok(None),
        }
    }

    fn parse_request_line(&mut self) -> Result<(), ParseError> {
        let line = match str::from_utf8(&self.line) {
            Ok(l) => l,
            Err(_) => {
                self.state = ParseState::Fail;
                return Err(ParseError::InvalidUtf8);
            }
        };

        let mut words = line.splitn(3, ' ');
        let method = words.next().unwrap_or("");
        let target = words.next().unwrap_or("");
        let version = words.next().unwrap_or("");

        if target.is_empty() {
            self.state = ParseState::Fail;
            return Err(ParseError::BadRequestLine);
        }

        self.request.method = match Method::try_from(method) {
            Ok(m) => m,
            Err(_) => {
                self.state = ParseState::Fail;
                return Err(ParseError::UnknownMethod);
            }
        };

        if version.starts_with("HTTP/1.1") {
            self.request.version = 1;
        }

        let (path, query) = match target.find('?') {
            Some(i) if i > 0 => (&target[..i], Some(&target[i + 1..])),
            _ => (target, None),
        };

        let mut params = Vec::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let decoded = match url_decode(pair) {
                    Some(d) => d,
                    None => {
                        self.state = ParseState::Fail;
                        return Err(ParseError::InvalidUtf8);
                    }
                };
                let (name, value) = split_pair(&decoded);
                params.push(Param {
                    name,
                    value,
                    kind: ParamKind::Query,
                    size: 0,
                });
            }
        }

        self.request.url = match url_decode(path) {
            Some(u) => u,
            None => {
                self.state = ParseState::Fail;
                return Err(ParseError::InvalidUtf8);
            }
        };
        self.request.params = params;

        Ok(())
    }

    fn parse_header_line(&mut self) -> Result<Option<ParseEvent<'static>>, ParseError> {
        let line = match str::from_utf8(&self.line) {
            Ok(l) => l,
            Err(_) => {
                self.state = ParseState::Fail;
                return Err(ParseError::InvalidUtf8);
            }
        };

        let Some((name, value)) = line.split_once(':') else {
            self.state = ParseState::Fail;
            return Err(ParseError::BadHeader);
        };
        let name = name.trim();
        let value = value.trim();

        let mut event = None;
        if name.eq_ignore_ascii_case(HEAD_HOST) {
            self.request.host = value.to_string();
            event = Some(ParseEvent::HostParsed);
        } else if name.eq_ignore_ascii_case(HEAD_CONTENT_TYPE) {
            if value.starts_with("multipart/") {
                let boundary = value
                    .split_once("boundary=")
                    .map(|(_, b)| b.trim().trim_matches('"'))
                    .unwrap_or("");
                if boundary.is_empty() {
                    self.state = ParseState::Fail;
                    return Err(ParseError::BadHeader);
                }
                self.request.boundary = Some(boundary.to_string());
                let mime = value.split(';').next().unwrap_or(value);
                self.request.content_type = Some(mime.trim().to_string());
            } else {
                self.request.content_type = Some(value.to_string());
            }
        } else if name.eq_ignore_ascii_case(HEAD_CONTENT_LENGTH) {
            self.request.content_length = match value.parse() {
                Ok(n) => n,
                Err(_) => {
                    self.state = ParseState::Fail;
                    return Err(ParseError::BadContentLength);
                }
            };
        } else if name.eq_ignore_ascii_case(HEAD_EXPECT) {
            if value.eq_ignore_ascii_case("100-continue") {
                self.request.expecting_continue = true;
            }
        } else if name.eq_ignore_ascii_case(HEAD_AUTHORIZATION) {
            self.request.authorization = Some(value.to_string());
        } else if self.retain_any
            || self.retain.iter().any(|r| r.eq_ignore_ascii_case(name))
        {
            self.request.headers.push(name, value);
        }

        self.line.clear();
        Ok(event)
    }

    fn feed_body<'a>(
        &'a mut self,
        data: &'a [u8],
        sink: &mut dyn UploadSink,
    ) -> Result<(usize, ParseEvent<'a>), ParseError> {
        let total = self.request.content_length;
        let end = (total - self.parsed_len).min(data.len());
        let mut i = 0;

        if self.body == BodyMode::Undecided && end > 0 {
            self.body = self.decide_body_mode();
        }

        while i < end {
            match self.body {
                BodyMode::Opaque => {
                    let index = self.parsed_len;
                    self.parsed_len += end - i;
                    if self.discard {
                        i = end;
                    } else {
                        return Ok((
                            end,
                            ParseEvent::BodyChunk {
                                data: &data[i..end],
                                index,
                                total,
                            },
                        ));
                    }
                }
                BodyMode::Fields => {
                    let b = data[i];
                    i += 1;
                    self.parsed_len += 1;
                    self.plain_post_char(b)?;
                }
                BodyMode::Probe => {
                    let b = data[i];
                    if is_param_char(b) && self.probe.len() < self.chunk_cap {
                        self.probe.push(b);
                        self.parsed_len += 1;
                        i += 1;
                    } else if b == EQ && !self.probe.is_empty() {
                        // looks like key=value, re-run the probed bytes as a field
                        self.body = BodyMode::Fields;
                        let probed = core::mem::take(&mut self.probe);
                        for pb in probed {
                            self.plain_post_char(pb)?;
                        }
                        self.parsed_len += 1;
                        i += 1;
                        self.plain_post_char(b)?;
                    } else {
                        // not a form body; surface the probed bytes as an opaque chunk
                        self.body = BodyMode::Opaque;
                        if !self.discard && !self.probe.is_empty() {
                            let index = self.parsed_len - self.probe.len();
                            return Ok((
                                i,
                                ParseEvent::BodyChunk {
                                    data: &self.probe,
                                    index,
                                    total,
                                },
                            ));
                        }
                    }
                }
                BodyMode::Multipart => {
                    let Some(decoder) = self.multipart.as_mut() else {
                        self.state = ParseState::Fail;
                        return Err(ParseError::Failed);
                    };
                    while i < end {
                        let b = data[i];
                        match decoder.feed_byte(b, self.parsed_len, total, sink) {
                            Ok(Some(part)) => self.request.params.push(match part {
                                Part::Field { name, value } => Param {
                                    name,
                                    value,
                                    kind: ParamKind::MultipartField,
                                    size: 0,
                                },
                                Part::File {
                                    name,
                                    filename,
                                    size,
                                } => Param {
                                    name,
                                    value: filename,
                                    kind: ParamKind::MultipartFile,
                                    size,
                                },
                            }),
                            Ok(None) => {}
                            Err(e) => {
                                self.state = ParseState::Fail;
                                return Err(e.into());
                            }
                        }
                        self.parsed_len += 1;
                        i += 1;
                        if decoder.finished() {
                            // one dash and a crlf remain; a declared length beyond
                            // them is ignored so the request still completes
                            let actual = self.parsed_len + 3;
                            if self.request.content_length > actual {
                                self.request.content_length = actual;
                            }
                        }
                    }
                    decoder.flush_chunk(sink);
                }
                BodyMode::Undecided => {
                    self.state = ParseState::Fail;
                    return Err(ParseError::Failed);
                }
            }
        }

        if self.parsed_len >= self.request.content_length {
            if self.body == BodyMode::Probe {
                // body ended while still probing, treat it as opaque
                self.body = BodyMode::Opaque;
                if !self.discard && !self.probe.is_empty() {
                    let index = self.parsed_len - self.probe.len();
                    return Ok((
                        i,
                        ParseEvent::BodyChunk {
                            data: &self.probe,
                            index,
                            total,
                        },
                    ));
                }
            }
            self.state = ParseState::End;
            return Ok((i, ParseEvent::RequestComplete));
        }

        Ok((i, ParseEvent::NeedMoreData))
    }

    fn decide_body_mode(&mut self) -> BodyMode {
        if self.discard {
            return BodyMode::Opaque;
        }
        if let Some(boundary) = &self.request.boundary {
            self.multipart = Some(MultipartDecoder::new(boundary.clone(), self.chunk_cap));
            return BodyMode::Multipart;
        }
        match self.request.content_type.as_deref() {
            Some(t) if t.starts_with("application/x-www-form-urlencoded") => BodyMode::Fields,
            Some("text/plain") => BodyMode::Probe,
            _ => BodyMode::Opaque,
        }
    }

    // One byte of a urlencoded (or plain key=value) body.  Fields are split on `&`
    // and flushed when the body ends.
    fn plain_post_char(&mut self, b: u8) -> Result<(), ParseError> {
        if b != 0 && b != AMP {
            self.field.push(b);
        }
        if b == 0 || b == AMP || self.parsed_len == self.request.content_length {
            let text = match str::from_utf8(&self.field) {
                Ok(t) => t,
                Err(_) => {
                    self.state = ParseState::Fail;
                    return Err(ParseError::InvalidUtf8);
                }
            };
            let Some(decoded) = url_decode(text) else {
                self.state = ParseState::Fail;
                return Err(ParseError::InvalidUtf8);
            };
            let (name, value) = split_body_pair(&decoded);
            self.request.params.push(Param {
                name,
                value,
                kind: ParamKind::Form,
                size: 0,
            });
            self.field.clear();
        }
        Ok(())
    }
}

// Split `name=value` at the first `=`; no `=` (or a leading one) leaves the whole
// string as the name.
fn split_pair(decoded: &str) -> (String, String) {
    match decoded.find('=') {
        Some(i) if i > 0 => (decoded[..i].to_string(), decoded[i + 1..].to_string()),
        _ => (decoded.to_string(), String::new()),
    }
}

// Body fields additionally default the name to "body" and are never split when the
// value is a JSON object or array.
fn split_body_pair(decoded: &str) -> (String, String) {
    if decoded.starts_with('{') || decoded.starts_with('[') {
        return ("body".to_string(), decoded.to_string());
    }
    match decoded.find('=') {
        Some(i) if i > 0 => (decoded[..i].to_string(), decoded[i + 1..].to_string()),
        _ => ("body".to_string(), decoded.to_string()),
    }
}

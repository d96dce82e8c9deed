//! Encoding of HTTP responses under transport backpressure.
//!
//! A [`Response`] describes the status, headers and body the handler wants to send.
//! The [`ResponseWriter`] serializes it through a [`Transport`], never writing more
//! than the transport's advertised window and resuming from acknowledgement and poll
//! events until every written byte has been acknowledged.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::ascii::{CR, LF, SP};
use crate::connection::{Transport, TransportError};
use crate::header::{HEAD_CONTENT_LENGTH, HEAD_CONTENT_TYPE, HEAD_TRANSFER_ENCODING, Headers};
use crate::log::debug;

/// HTTP response status codes.
#[allow(missing_docs)]
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StatusCode {
    Continue,
    SwitchingProtocols,
    OK,
    Created,
    Accepted,
    NoContent,
    PartialContent,
    MovedPermanently,
    Found,
    SeeOther,
    NotModified,
    TemporaryRedirect,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    RequestTimeout,
    PayloadTooLarge,
    ExpectationFailed,
    InternalServerError,
    NotImplemented,
    ServiceUnavailable,
    /// Any other status code
    Other(u16),
}

impl StatusCode {
    /// The numeric status code.
    pub fn code(&self) -> u16 {
        match self {
            Self::Continue => 100,
            Self::SwitchingProtocols => 101,
            Self::OK => 200,
            Self::Created => 201,
            Self::Accepted => 202,
            Self::NoContent => 204,
            Self::PartialContent => 206,
            Self::MovedPermanently => 301,
            Self::Found => 302,
            Self::SeeOther => 303,
            Self::NotModified => 304,
            Self::TemporaryRedirect => 307,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::RequestTimeout => 408,
            Self::PayloadTooLarge => 413,
            Self::ExpectationFailed => 417,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
            Self::ServiceUnavailable => 503,
            Self::Other(code) => *code,
        }
    }

    /// The reason phrase for the status line, empty for unknown codes.
    pub fn reason(&self) -> &'static str {
        match self.code() {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            203 => "Non-Authoritative Information",
            204 => "No Content",
            205 => "Reset Content",
            206 => "Partial Content",
            300 => "Multiple Choices",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            305 => "Use Proxy",
            307 => "Temporary Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            402 => "Payment Required",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            406 => "Not Acceptable",
            407 => "Proxy Authentication Required",
            408 => "Request Time-out",
            409 => "Conflict",
            410 => "Gone",
            411 => "Length Required",
            412 => "Precondition Failed",
            413 => "Request Entity Too Large",
            414 => "Request-URI Too Large",
            415 => "Unsupported Media Type",
            416 => "Requested range not satisfiable",
            417 => "Expectation Failed",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Time-out",
            505 => "HTTP Version not supported",
            _ => "",
        }
    }
}

/// Errors produced while writing a response.
#[derive(Debug, PartialEq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResponseError {
    /// The body source reported itself unreadable
    #[error("response body source is invalid")]
    SourceInvalid,
    /// The transport rejected a write within its advertised window
    #[error("transport write failed")]
    WriteFailure,
}

impl From<TransportError> for ResponseError {
    fn from(_: TransportError) -> Self {
        Self::WriteFailure
    }
}

/// Supplies body bytes on demand.  Implemented by anything that can copy its next
/// bytes into a buffer, including plain `FnMut(&mut [u8]) -> usize` closures.
pub trait BodySource {
    /// Copy up to `buf.len()` bytes into `buf`, returning how many were written.
    /// For fixed length bodies a return of 0 before the declared length has been
    /// produced marks the source invalid; for chunked and streamed bodies it marks
    /// the end of the body.
    fn fill(&mut self, buf: &mut [u8]) -> usize;

    /// False when the source can no longer produce bytes (e.g. a file handle that
    /// became unusable).  Checked before every pull.
    fn valid(&self) -> bool {
        true
    }
}

impl<F: FnMut(&mut [u8]) -> usize> BodySource for F {
    fn fill(&mut self, buf: &mut [u8]) -> usize {
        self(buf)
    }
}

/// The body of a response.
pub enum Body {
    /// No body, and no Content-Length header
    Empty,
    /// A body held in memory, sent with a Content-Length header
    Bytes(Vec<u8>),
    /// A fixed length body pulled from a source, sent with a Content-Length header
    Fill {
        /// Declared body length
        len: usize,
        /// Byte supplier
        source: Box<dyn BodySource>,
    },
    /// An unknown length body sent with `Transfer-Encoding: chunked`
    Chunked {
        /// Byte supplier; a zero fill ends the body
        source: Box<dyn BodySource>,
    },
    /// An unknown length body with no framing; the connection close ends the body
    Stream {
        /// Byte supplier; a zero fill ends the body
        source: Box<dyn BodySource>,
    },
}

/// A response as supplied by the request handler.
pub struct Response {
    /// Status code for the status line
    pub status: StatusCode,
    /// Content-Type header value, if any
    pub content_type: Option<String>,
    headers: Headers,
    body: Body,
}

impl Response {
    /// An empty-bodied response with the given status.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            content_type: None,
            headers: Headers::new(),
            body: Body::Empty,
        }
    }

    /// A response with an in-memory text body.
    pub fn text(status: StatusCode, content_type: &str, body: &str) -> Self {
        Self {
            status,
            content_type: Some(content_type.to_string()),
            headers: Headers::new(),
            body: Body::Bytes(body.as_bytes().to_vec()),
        }
    }

    /// A response with the given body.
    pub fn with_body(status: StatusCode, content_type: Option<&str>, body: Body) -> Self {
        Self {
            status,
            content_type: content_type.map(ToString::to_string),
            headers: Headers::new(),
            body,
        }
    }

    /// Append a header.  Headers are emitted in insertion order after Content-Length
    /// and Content-Type.
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push(name, value);
    }

    fn source_valid(&self) -> bool {
        match &self.body {
            Body::Fill { source, .. } | Body::Chunked { source } | Body::Stream { source } => {
                source.valid()
            }
            _ => true,
        }
    }

    // The status line and header block, assembled once on the first send opportunity
    // so header mutations up to that point are reflected.
    fn assemble_head(&self, version: u8) -> Vec<u8> {
        let mut itoa_buf = itoa::Buffer::new();
        let mut out = Vec::with_capacity(128);

        out.extend_from_slice(b"HTTP/1.");
        out.push(b'0' + version);
        out.push(SP);
        out.extend_from_slice(itoa_buf.format(self.status.code()).as_bytes());
        let reason = self.status.reason();
        if !reason.is_empty() {
            out.push(SP);
            out.extend_from_slice(reason.as_bytes());
        }
        out.push(CR);
        out.push(LF);

        let content_length = match &self.body {
            Body::Bytes(b) => Some(b.len()),
            Body::Fill { len, .. } => Some(*len),
            _ => None,
        };
        if let Some(len) = content_length {
            out.extend_from_slice(HEAD_CONTENT_LENGTH.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(itoa_buf.format(len).as_bytes());
            out.push(CR);
            out.push(LF);
        } else if let Body::Chunked { .. } = self.body {
            out.extend_from_slice(HEAD_TRANSFER_ENCODING.as_bytes());
            out.extend_from_slice(b": chunked");
            out.push(CR);
            out.push(LF);
        }

        if let Some(content_type) = &self.content_type {
            out.extend_from_slice(HEAD_CONTENT_TYPE.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(content_type.as_bytes());
            out.push(CR);
            out.push(LF);
        }

        self.headers.encode(&mut out);
        out.push(CR);
        out.push(LF);
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum WriteState {
    Setup,
    Headers,
    Content,
    WaitAck,
    End,
    Failed,
}

// Largest chunk payload pulled from a source in one go.
const FILL_CAP: usize = 1460;
// Worst case chunk framing for payloads up to FILL_CAP: 4 hex digits + two crlfs.
const CHUNK_OVERHEAD: usize = 8;

/// Serializes one [`Response`] through a [`Transport`] under window backpressure.
pub struct ResponseWriter {
    state: WriteState,
    version: u8,
    head: Vec<u8>,
    head_sent: usize,
    body_sent: usize,
    total_written: usize,
    acked: usize,
    scratch: Vec<u8>,
}

impl ResponseWriter {
    /// A writer emitting a status line for the given HTTP minor version.
    pub fn new(version: u8) -> Self {
        Self {
            state: WriteState::Setup,
            version,
            head: Vec::new(),
            head_sent: 0,
            body_sent: 0,
            total_written: 0,
            acked: 0,
            scratch: Vec::new(),
        }
    }

    /// True once every written byte has been acknowledged.
    pub fn finished(&self) -> bool {
        self.state == WriteState::End
    }

    /// True if the response failed and the connection should be closed.
    pub fn failed(&self) -> bool {
        self.state == WriteState::Failed
    }

    /// Bytes written but not yet acknowledged.
    pub(crate) fn unacked(&self) -> usize {
        self.total_written.saturating_sub(self.acked)
    }

    /// First send opportunity.  Assembles the head and writes as much of the
    /// response as the current window allows.
    pub fn respond(
        &mut self,
        resp: &mut Response,
        t: &mut dyn Transport,
    ) -> Result<(), ResponseError> {
        if !resp.source_valid() {
            self.state = WriteState::Failed;
            return Err(ResponseError::SourceInvalid);
        }

        self.head = resp.assemble_head(self.version);
        debug!("response {} head assembled, {} bytes", resp.status.code(), self.head.len());
        self.state = WriteState::Headers;
        self.progress(resp, t)
    }

    /// The transport acknowledged `len` earlier bytes; account for them and write
    /// more if the window allows.
    pub fn on_ack(
        &mut self,
        resp: &mut Response,
        t: &mut dyn Transport,
        len: usize,
    ) -> Result<(), ResponseError> {
        self.acked += len;
        self.progress(resp, t)
    }

    /// A send opportunity with nothing acknowledged.
    pub fn on_poll(
        &mut self,
        resp: &mut Response,
        t: &mut dyn Transport,
    ) -> Result<(), ResponseError> {
        self.progress(resp, t)
    }

    fn progress(
        &mut self,
        resp: &mut Response,
        t: &mut dyn Transport,
    ) -> Result<(), ResponseError> {
        loop {
            match self.state {
                WriteState::Headers => {
                    let window = t.window();
                    if window == 0 {
                        return Ok(());
                    }
                    let n = window.min(self.head.len() - self.head_sent);
                    let accepted = t.write(&self.head[self.head_sent..self.head_sent + n])?;
                    if accepted < n {
                        self.state = WriteState::Failed;
                        return Err(ResponseError::WriteFailure);
                    }
                    self.total_written += n;
                    self.head_sent += n;
                    if self.head_sent < self.head.len() {
                        return Ok(());
                    }
                    self.state = WriteState::Content;
                }
                WriteState::Content => {
                    if !resp.source_valid() {
                        self.state = WriteState::Failed;
                        return Err(ResponseError::SourceInvalid);
                    }
                    if !self.write_content(resp, t)? {
                        return Ok(());
                    }
                }
                WriteState::WaitAck => {
                    if self.acked >= self.total_written {
                        self.state = WriteState::End;
                    }
                    return Ok(());
                }
                WriteState::Setup | WriteState::End | WriteState::Failed => return Ok(()),
            }
        }
    }

    // One content write within the current window.  Returns true when the state
    // machine should keep running (more window, or a state transition happened).
    fn write_content(
        &mut self,
        resp: &mut Response,
        t: &mut dyn Transport,
    ) -> Result<bool, ResponseError> {
        let window = t.window();

        match &mut resp.body {
            Body::Empty => {
                self.state = WriteState::WaitAck;
                Ok(true)
            }
            Body::Bytes(bytes) => {
                if window == 0 {
                    return Ok(false);
                }
                let n = window.min(bytes.len() - self.body_sent);
                let accepted = t.write(&bytes[self.body_sent..self.body_sent + n])?;
                if accepted < n {
                    self.state = WriteState::Failed;
                    return Err(ResponseError::WriteFailure);
                }
                self.total_written += n;
                self.body_sent += n;
                if self.body_sent == bytes.len() {
                    self.state = WriteState::WaitAck;
                }
                Ok(self.state == WriteState::WaitAck)
            }
            Body::Fill { len, source } => {
                let remaining = *len - self.body_sent;
                if remaining == 0 {
                    self.state = WriteState::WaitAck;
                    return Ok(true);
                }
                let out = window.min(remaining).min(FILL_CAP);
                if out == 0 {
                    return Ok(false);
                }
                self.scratch.resize(out, 0);
                let n = source.fill(&mut self.scratch[..out]);
                if n == 0 {
                    self.state = WriteState::Failed;
                    return Err(ResponseError::SourceInvalid);
                }
                let accepted = t.write(&self.scratch[..n])?;
                if accepted < n {
                    self.state = WriteState::Failed;
                    return Err(ResponseError::WriteFailure);
                }
                self.total_written += n;
                self.body_sent += n;
                if self.body_sent == *len {
                    self.state = WriteState::WaitAck;
                }
                Ok(true)
            }
            Body::Chunked { source } => {
                let max_payload = window.saturating_sub(CHUNK_OVERHEAD).min(FILL_CAP);
                if max_payload == 0 {
                    return Ok(false);
                }
                self.scratch.resize(max_payload, 0);
                let n = source.fill(&mut self.scratch[..max_payload]);
                if n == 0 {
                    let accepted = t.write(b"0\r\n\r\n")?;
                    if accepted < 5 {
                        self.state = WriteState::Failed;
                        return Err(ResponseError::WriteFailure);
                    }
                    self.total_written += 5;
                    self.state = WriteState::WaitAck;
                    return Ok(true);
                }
                let mut frame = Vec::with_capacity(n + CHUNK_OVERHEAD);
                frame.extend_from_slice(format!("{n:x}").as_bytes());
                frame.extend_from_slice(b"\r\n");
                frame.extend_from_slice(&self.scratch[..n]);
                frame.extend_from_slice(b"\r\n");
                let accepted = t.write(&frame)?;
                if accepted < frame.len() {
                    self.state = WriteState::Failed;
                    return Err(ResponseError::WriteFailure);
                }
                self.total_written += frame.len();
                self.body_sent += n;
                Ok(true)
            }
            Body::Stream { source } => {
                let out = window.min(FILL_CAP);
                if out == 0 {
                    return Ok(false);
                }
                self.scratch.resize(out, 0);
                let n = source.fill(&mut self.scratch[..out]);
                if n == 0 {
                    self.state = WriteState::WaitAck;
                    return Ok(true);
                }
                let accepted = t.write(&self.scratch[..n])?;
                if accepted < n {
                    self.state = WriteState::Failed;
                    return Err(ResponseError::WriteFailure);
                }
                self.total_written += n;
                self.body_sent += n;
                Ok(true)
            }
        }
    }

}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::string::String;
    use std::vec::Vec;

    use super::*;

    struct MockTransport {
        out: Vec<u8>,
        window: usize,
    }

    impl MockTransport {
        fn new(window: usize) -> Self {
            Self {
                out: Vec::new(),
                window,
            }
        }

        // acknowledge everything written so far and reopen the window
        fn ack_all(&mut self, window: usize) -> usize {
            self.window = window;
            let len = self.out.len();
            self.out.clear();
            len
        }
    }

    impl Transport for MockTransport {
        fn window(&self) -> usize {
            self.window
        }

        fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
            let n = data.len().min(self.window);
            self.out.extend_from_slice(&data[..n]);
            self.window -= n;
            Ok(n)
        }

        fn close(&mut self, _immediate: bool) {}
    }

    #[test]
    fn test_basic_response_byte_exact() {
        let mut resp = Response::text(StatusCode::OK, "text/plain", "ok");
        let mut writer = ResponseWriter::new(1);
        let mut t = MockTransport::new(4096);

        writer.respond(&mut resp, &mut t).unwrap();
        assert_eq!(
            t.out,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nContent-Type: text/plain\r\n\r\nok"
        );

        let len = t.out.len();
        writer.on_ack(&mut resp, &mut t, len).unwrap();
        assert!(writer.finished());
    }

    #[test]
    fn test_custom_headers_and_unknown_code() {
        let mut resp = Response::new(StatusCode::Other(599));
        resp.add_header("X-One", "1");
        resp.add_header("X-Two", "2");
        let mut writer = ResponseWriter::new(1);
        let mut t = MockTransport::new(4096);

        writer.respond(&mut resp, &mut t).unwrap();
        assert_eq!(t.out, b"HTTP/1.1 599\r\nX-One: 1\r\nX-Two: 2\r\n\r\n");
    }

    #[test]
    fn test_head_split_across_small_windows() {
        let mut resp = Response::text(StatusCode::OK, "text/plain", "hello body");
        let mut writer = ResponseWriter::new(1);
        let mut t = MockTransport::new(7);

        writer.respond(&mut resp, &mut t).unwrap();

        let mut wire = Vec::new();
        let mut guard = 0;
        while !writer.finished() {
            wire.extend_from_slice(&t.out);
            let acked = t.ack_all(7);
            writer.on_ack(&mut resp, &mut t, acked).unwrap();
            guard += 1;
            assert!(guard < 100);
        }
        wire.extend_from_slice(&t.out);

        assert_eq!(
            wire,
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nContent-Type: text/plain\r\n\r\nhello body"
        );
    }

    #[test]
    fn test_zero_window_stall_and_resume() {
        let mut resp = Response::text(StatusCode::OK, "text/plain", "ok");
        let mut writer = ResponseWriter::new(1);
        let mut t = MockTransport::new(0);

        writer.respond(&mut resp, &mut t).unwrap();
        assert!(t.out.is_empty());
        assert!(!writer.finished());

        t.window = 4096;
        writer.on_poll(&mut resp, &mut t).unwrap();
        assert!(t.out.ends_with(b"\r\nok"));

        let len = t.out.len();
        writer.on_ack(&mut resp, &mut t, len).unwrap();
        assert!(writer.finished());
    }

    #[test]
    fn test_fill_body() {
        let mut data: &'static [u8] = b"0123456789";
        let source = move |buf: &mut [u8]| {
            let n = buf.len().min(data.len());
            buf[..n].copy_from_slice(&data[..n]);
            data = &data[n..];
            n
        };
        let mut resp = Response::with_body(
            StatusCode::OK,
            Some("application/octet-stream"),
            Body::Fill {
                len: 10,
                source: Box::new(source),
            },
        );
        let mut writer = ResponseWriter::new(1);
        let mut t = MockTransport::new(4096);

        writer.respond(&mut resp, &mut t).unwrap();
        assert!(t.out.ends_with(b"\r\n\r\n0123456789"));
        assert!(String::from_utf8(t.out.clone())
            .unwrap()
            .contains("Content-Length: 10"));

        let len = t.out.len();
        writer.on_ack(&mut resp, &mut t, len).unwrap();
        assert!(writer.finished());
    }

    #[test]
    fn test_chunked_body_reassembles() {
        let payload = b"a string of chunked bytes, longer than one pull";
        let mut data: &'static [u8] = payload;
        let source = move |buf: &mut [u8]| {
            let n = buf.len().min(data.len()).min(16);
            buf[..n].copy_from_slice(&data[..n]);
            data = &data[n..];
            n
        };
        let mut resp = Response::with_body(
            StatusCode::OK,
            Some("text/plain"),
            Body::Chunked {
                source: Box::new(source),
            },
        );
        let mut writer = ResponseWriter::new(1);
        let mut t = MockTransport::new(4096);

        writer.respond(&mut resp, &mut t).unwrap();
        let len = t.out.len();

        let wire = String::from_utf8(t.out.clone()).unwrap();
        assert!(wire.contains("Transfer-Encoding: chunked"));
        assert!(!wire.contains("Content-Length"));

        // decode the chunk framing back into the payload
        let (_, body) = wire.split_once("\r\n\r\n").unwrap();
        let mut rest = body;
        let mut decoded = Vec::new();
        loop {
            let (size, tail) = rest.split_once("\r\n").unwrap();
            let size = usize::from_str_radix(size, 16).unwrap();
            if size == 0 {
                assert_eq!(tail, "\r\n");
                break;
            }
            decoded.extend_from_slice(&tail.as_bytes()[..size]);
            rest = &tail[size + 2..];
        }
        assert_eq!(decoded, payload);

        writer.on_ack(&mut resp, &mut t, len).unwrap();
        assert!(writer.finished());
    }

    #[test]
    fn test_stream_body_ends_on_exhaustion() {
        let mut data: &'static [u8] = b"streamed";
        let source = move |buf: &mut [u8]| {
            let n = buf.len().min(data.len());
            buf[..n].copy_from_slice(&data[..n]);
            data = &data[n..];
            n
        };
        let mut resp = Response::with_body(
            StatusCode::OK,
            Some("text/plain"),
            Body::Stream {
                source: Box::new(source),
            },
        );
        let mut writer = ResponseWriter::new(1);
        let mut t = MockTransport::new(4096);

        writer.respond(&mut resp, &mut t).unwrap();
        let wire = String::from_utf8(t.out.clone()).unwrap();
        assert!(!wire.contains("Content-Length"));
        assert!(!wire.contains("Transfer-Encoding"));
        assert!(wire.ends_with("\r\n\r\nstreamed"));

        let len = t.out.len();
        writer.on_ack(&mut resp, &mut t, len).unwrap();
        assert!(writer.finished());
    }

    #[test]
    fn test_invalid_source_fails() {
        struct BadSource;
        impl BodySource for BadSource {
            fn fill(&mut self, _buf: &mut [u8]) -> usize {
                0
            }
            fn valid(&self) -> bool {
                false
            }
        }

        let mut resp = Response::with_body(
            StatusCode::OK,
            None,
            Body::Fill {
                len: 4,
                source: Box::new(BadSource),
            },
        );
        let mut writer = ResponseWriter::new(1);
        let mut t = MockTransport::new(4096);

        assert_eq!(
            writer.respond(&mut resp, &mut t),
            Err(ResponseError::SourceInvalid)
        );
        assert!(writer.failed());
    }
}

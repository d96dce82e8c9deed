//! The async server entry point.
//!
//! [`Server`] bridges a byte-stream client connection (anything implementing
//! `embedded_io_async::Read + Write`) to the event-driven [`Connection`] engine:
//! it reads, feeds the bytes in as events, flushes whatever the connection staged
//! and reports the flushed bytes back as acknowledgements.  Embeddings with their
//! own socket layer (and real TCP ack information) can skip this module and drive
//! [`Connection`] directly.

use alloc::vec::Vec;

use embedded_io_async::{Read, Write};

use crate::connection::{Config, Connection, ConnectionError, Event, Transport, TransportError};
use crate::log::trace;
use crate::request::Request;
use crate::response::Response;
use crate::websocket::{FrameInfo, WsSender};

/// The application side of the server.  One implementation serves all requests;
/// every callback except [`handle_request`](Self::handle_request) has a default.
///
/// ```
/// use httpflow::request::Request;
/// use httpflow::response::{Response, StatusCode};
/// use httpflow::server::RequestHandler;
///
/// struct Routes;
///
/// impl RequestHandler for Routes {
///     fn handle_request(&mut self, req: &Request) -> Response {
///         match req.url.as_str() {
///             "/" => Response::text(StatusCode::OK, "text/html", "<html>..."),
///             _ => Response::new(StatusCode::NotFound),
///         }
///     }
/// }
/// ```
pub trait RequestHandler {
    /// Whether this handler serves the request, decided as soon as the request
    /// line and Host header are known.  Unhandled requests are answered 501 after
    /// their body has been consumed.
    fn can_handle(&mut self, req: &Request) -> bool {
        let _ = req;
        true
    }

    /// Extra header names to retain on the [`Request`].  Headers the engine does
    /// not need internally are otherwise decoded and dropped to save memory.
    /// Returning [`crate::header::RETAIN_ANY`] retains everything.
    fn retained_headers(&self) -> &[&str] {
        &[]
    }

    /// Produce the response once the request, including any body, is complete.
    fn handle_request(&mut self, req: &Request) -> Response;

    /// A slice of an opaque request body (anything that is not form fields or
    /// multipart).  `index` is the slice offset within the body, `total` the
    /// declared body length.
    fn handle_body(&mut self, data: &[u8], index: usize, total: usize) {
        let _ = (data, index, total);
    }

    /// A slice of an uploaded file from a multipart body.  `offset` is the slice
    /// offset within the file; `is_final` marks the last slice.
    fn handle_upload(&mut self, filename: &str, offset: usize, data: &[u8], is_final: bool) {
        let _ = (filename, offset, data, is_final);
    }

    /// Whether a well-formed WebSocket upgrade request should be upgraded.
    /// Declined requests are served as plain HTTP through
    /// [`handle_request`](Self::handle_request).
    fn accept_upgrade(&mut self, req: &Request) -> bool {
        let _ = req;
        false
    }

    /// The upgrade was accepted; `ws` can queue the first messages.
    fn on_ws_connect(&mut self, ws: &mut WsSender) {
        let _ = ws;
    }

    /// A chunk of WebSocket frame payload, unmasked.  Large frames arrive as
    /// several chunks sharing one [`FrameInfo`]; `info.index` locates the chunk.
    fn on_ws_frame(&mut self, info: &FrameInfo, data: &[u8], ws: &mut WsSender) {
        let _ = (info, data, ws);
    }

    /// A Pong arrived that was not answering a keep-alive ping.
    fn on_ws_pong(&mut self, payload: &[u8]) {
        let _ = payload;
    }

    /// The peer closed with an abnormal status code.
    fn on_ws_error(&mut self, code: u16, reason: &str) {
        let _ = (code, reason);
    }

    /// The connection carrying an upgraded session went away.
    fn on_ws_disconnect(&mut self) {}
}

impl<T: RequestHandler + ?Sized> RequestHandler for &mut T {
    fn can_handle(&mut self, req: &Request) -> bool {
        (**self).can_handle(req)
    }

    fn retained_headers(&self) -> &[&str] {
        (**self).retained_headers()
    }

    fn handle_request(&mut self, req: &Request) -> Response {
        (**self).handle_request(req)
    }

    fn handle_body(&mut self, data: &[u8], index: usize, total: usize) {
        (**self).handle_body(data, index, total)
    }

    fn handle_upload(&mut self, filename: &str, offset: usize, data: &[u8], is_final: bool) {
        (**self).handle_upload(filename, offset, data, is_final)
    }

    fn accept_upgrade(&mut self, req: &Request) -> bool {
        (**self).accept_upgrade(req)
    }

    fn on_ws_connect(&mut self, ws: &mut WsSender) {
        (**self).on_ws_connect(ws)
    }

    fn on_ws_frame(&mut self, info: &FrameInfo, data: &[u8], ws: &mut WsSender) {
        (**self).on_ws_frame(info, data, ws)
    }

    fn on_ws_pong(&mut self, payload: &[u8]) {
        (**self).on_ws_pong(payload)
    }

    fn on_ws_error(&mut self, code: u16, reason: &str) {
        (**self).on_ws_error(code, reason)
    }

    fn on_ws_disconnect(&mut self) {
        (**self).on_ws_disconnect()
    }
}

/// ServerError is returned by [`Server::serve`] when the connection fails in a
/// way the peer should know about.  Network errors end the serve loop with
/// `Ok(())` instead, there is nobody left to tell.
#[derive(Debug, PartialEq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ServerError {
    /// The connection engine failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

// Upper bound on bytes staged between flushes.
const STAGE_LIMIT: usize = 4096;

// Collects the connection's writes between reads so they can be flushed to the
// client in one go and reported back as acknowledged.
struct StagedTransport {
    staged: Vec<u8>,
    closed: Option<bool>,
}

impl StagedTransport {
    fn new() -> Self {
        Self {
            staged: Vec::new(),
            closed: None,
        }
    }
}

impl Transport for StagedTransport {
    fn window(&self) -> usize {
        if self.closed.is_some() {
            0
        } else {
            STAGE_LIMIT - self.staged.len()
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let n = data.len().min(self.window());
        self.staged.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn close(&mut self, immediate: bool) {
        if self.closed.is_none() || immediate {
            self.closed = Some(immediate);
        }
    }
}

/// Server is the main entry point for embeddings without their own socket event
/// loop.  It is constructed with a [`RequestHandler`] implementation and provides
/// a serve() method to be called with each new client connection.
pub struct Server<H: RequestHandler> {
    handler: H,
    config: Config,
}

impl<H: RequestHandler> Server<H> {
    /// A server with default [`Config`].
    pub fn new(handler: H) -> Self {
        Self::with_config(handler, Config::default())
    }

    /// A server with the given per-connection tuning.
    pub fn with_config(handler: H, config: Config) -> Self {
        Self { handler, config }
    }

    /// The handler serving this server's requests.
    pub fn handler(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Serve one client connection until it closes.  `buf` is the read buffer;
    /// its size bounds how many bytes are fed into the connection per read.
    /// Returns `Ok(())` when the client disconnects or the connection is closed
    /// in an orderly fashion, and an error on protocol failures, after which the
    /// client should be dropped.
    pub async fn serve<C>(&mut self, client: &mut C, buf: &mut [u8]) -> Result<(), ServerError>
    where
        C: Read + Write,
    {
        let mut conn = Connection::new(&mut self.handler, self.config.clone());
        let mut t = StagedTransport::new();
        let mut now_ms: u32 = 0;

        loop {
            let n = match client.read(buf).await {
                Ok(0) | Err(_) => {
                    trace!("client went away");
                    conn.handle_event(Event::Disconnect, &mut t, now_ms)?;
                    return Ok(());
                }
                Ok(n) => n,
            };
            conn.handle_event(Event::Data(&buf[..n]), &mut t, now_ms)?;

            // flush what the connection staged, reporting it back as acknowledged
            while t.closed != Some(true) && !t.staged.is_empty() {
                let staged = core::mem::take(&mut t.staged);
                if client.write_all(&staged).await.is_err() {
                    return Ok(());
                }
                conn.handle_event(
                    Event::Ack {
                        len: staged.len(),
                        elapsed_ms: 0,
                    },
                    &mut t,
                    now_ms,
                )?;
            }

            if let Some(immediate) = t.closed {
                if !immediate {
                    let _ = client.flush().await;
                }
                return Ok(());
            }

            now_ms = now_ms.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::collections::VecDeque;
    use std::string::String;
    use std::vec::Vec;

    use embedded_io_async::{ErrorKind, ErrorType};

    use super::*;
    use crate::response::StatusCode;

    struct TestReader {
        chunks: VecDeque<Vec<u8>>,
    }

    impl TestReader {
        fn new(chunks: &[&[u8]]) -> Self {
            Self {
                chunks: chunks.iter().map(|c| c.to_vec()).collect(),
            }
        }
    }

    impl ErrorType for TestReader {
        type Error = ErrorKind;
    }

    impl Read for TestReader {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }
    }

    struct TestWriter<'a> {
        inner: &'a mut Vec<u8>,
    }

    impl ErrorType for TestWriter<'_> {
        type Error = ErrorKind;
    }

    impl Write for TestWriter<'_> {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.inner.extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    struct TestReaderWriter<'a> {
        reader: TestReader,
        writer: TestWriter<'a>,
    }

    impl ErrorType for TestReaderWriter<'_> {
        type Error = ErrorKind;
    }

    impl Read for TestReaderWriter<'_> {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            self.reader.read(buf).await
        }
    }

    impl Write for TestReaderWriter<'_> {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.writer.write(buf).await
        }
    }

    struct Handler {
        frames: Vec<Vec<u8>>,
    }

    impl Handler {
        fn new() -> Self {
            Self { frames: Vec::new() }
        }
    }

    impl RequestHandler for Handler {
        fn handle_request(&mut self, req: &Request) -> Response {
            match req.url.as_str() {
                "/i" => Response::text(StatusCode::OK, "text/plain", "ok"),
                _ => Response::new(StatusCode::NotFound),
            }
        }

        fn accept_upgrade(&mut self, req: &Request) -> bool {
            req.url == "/ws"
        }

        fn on_ws_frame(&mut self, _info: &FrameInfo, data: &[u8], ws: &mut WsSender) {
            self.frames.push(data.to_vec());
            ws.text("seen");
        }
    }

    #[tokio::test]
    async fn test_http_server() {
        let mut server = Server::new(Handler::new());

        let mut writer_buf = Vec::<u8>::new();
        let mut client = TestReaderWriter {
            reader: TestReader::new(&[b"GET /i HTTP/1.1\r\nHost: dev\r\n\r\n"]),
            writer: TestWriter {
                inner: &mut writer_buf,
            },
        };

        let mut http_buff = [0u8; 2048];
        server.serve(&mut client, &mut http_buff[..]).await.unwrap();

        assert_eq!(
            writer_buf.as_slice(),
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nContent-Type: text/plain\r\n\r\nok"
        );
    }

    #[tokio::test]
    async fn test_unknown_path_gets_404() {
        let mut server = Server::new(Handler::new());

        let mut writer_buf = Vec::<u8>::new();
        let mut client = TestReaderWriter {
            reader: TestReader::new(&[b"GET /missing HTTP/1.1\r\nHost: dev\r\n\r\n"]),
            writer: TestWriter {
                inner: &mut writer_buf,
            },
        };

        let mut http_buff = [0u8; 2048];
        server.serve(&mut client, &mut http_buff[..]).await.unwrap();

        assert!(writer_buf.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
    }

    #[tokio::test]
    async fn test_request_split_across_reads() {
        let mut server = Server::new(Handler::new());

        let mut writer_buf = Vec::<u8>::new();
        let mut client = TestReaderWriter {
            reader: TestReader::new(&[b"GET /i HTT", b"P/1.1\r\nHost:", b" dev\r\n\r\n"]),
            writer: TestWriter {
                inner: &mut writer_buf,
            },
        };

        let mut http_buff = [0u8; 2048];
        server.serve(&mut client, &mut http_buff[..]).await.unwrap();

        assert!(writer_buf.starts_with(b"HTTP/1.1 200 OK\r\n"));
    }

    #[tokio::test]
    async fn test_websocket_session() {
        let mut server = Server::new(Handler::new());

        let mask = [0x0fu8, 0xf0, 0x55, 0xaa];
        let mut frame = std::vec![0x81u8, 0x82];
        frame.extend_from_slice(&mask);
        for (i, b) in b"hi".iter().enumerate() {
            frame.push(b ^ mask[i % 4]);
        }

        let mut writer_buf = Vec::<u8>::new();
        let mut client = TestReaderWriter {
            reader: TestReader::new(&[
                b"GET /ws HTTP/1.1\r\nHost: dev\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
                &frame,
            ]),
            writer: TestWriter {
                inner: &mut writer_buf,
            },
        };

        let mut http_buff = [0u8; 2048];
        server.serve(&mut client, &mut http_buff[..]).await.unwrap();

        let wire = String::from_utf8_lossy(&writer_buf);
        assert!(wire.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(wire.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(writer_buf.ends_with(b"\x81\x04seen"));
        assert_eq!(server.handler().frames, std::vec![b"hi".to_vec()]);
    }

    #[tokio::test]
    async fn test_bad_request_is_an_error() {
        let mut server = Server::new(Handler::new());

        let mut writer_buf = Vec::<u8>::new();
        let mut client = TestReaderWriter {
            reader: TestReader::new(&[b"BREW /pot HTTP/1.1\r\n"]),
            writer: TestWriter {
                inner: &mut writer_buf,
            },
        };

        let mut http_buff = [0u8; 2048];
        assert!(server.serve(&mut client, &mut http_buff[..]).await.is_err());
    }
}

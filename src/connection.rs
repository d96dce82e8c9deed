//! The per-connection engine.
//!
//! A [`Connection`] owns no sockets and keeps no clocks.  The embedding feeds it
//! [`Event`]s (received bytes, acknowledgements, send opportunities, timeouts) and
//! hands it a [`Transport`] to write through; the connection drives the request
//! parser, the handler callbacks, the response writer and, after an upgrade, the
//! WebSocket engine.

use alloc::vec::Vec;

use crate::header::{
    HEAD_CONNECTION, HEAD_SEC_WEBSOCKET_ACCEPT, HEAD_SEC_WEBSOCKET_KEY,
    HEAD_SEC_WEBSOCKET_VERSION, HEAD_UPGRADE,
};
use crate::log::{debug, trace, warning};
use crate::multipart::UploadSink;
use crate::request::{ParseError, ParseEvent, RequestParser};
use crate::response::{Response, ResponseError, ResponseWriter, StatusCode};
use crate::server::RequestHandler;
use crate::websocket::{WsConnection, WsError, WsSender, sec_websocket_accept_val};

/// Returned by [`Transport::write`] when the transport cannot take bytes it
/// advertised window for.
#[derive(Debug, PartialEq, thiserror::Error)]
#[error("transport rejected the write")]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransportError;

/// The byte sink a connection writes through.  Implemented by the embedding over
/// whatever carries the connection (a TCP socket, a TLS session, a test buffer).
pub trait Transport {
    /// How many bytes a write may currently accept.  The connection never writes
    /// more than this in one call.
    fn window(&self) -> usize;

    /// Accept up to `data.len()` bytes for transmission, returning how many were
    /// taken.  Accepting fewer than `min(data.len(), window)` bytes is an error
    /// the connection treats as a write failure.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Close the connection.  When `immediate` is false, previously accepted
    /// bytes are flushed first.
    fn close(&mut self, immediate: bool);
}

/// Connection input events, delivered by the embedding.
#[derive(Debug)]
pub enum Event<'a> {
    /// Bytes received from the peer
    Data(&'a [u8]),
    /// The peer acknowledged `len` previously written bytes
    Ack {
        /// Number of bytes acknowledged
        len: usize,
        /// Milliseconds since the bytes were written
        elapsed_ms: u32,
    },
    /// A send opportunity with nothing received or acknowledged
    Poll,
    /// The connection has been idle too long
    Timeout {
        /// Milliseconds since the last activity
        elapsed_ms: u32,
    },
    /// The peer went away
    Disconnect,
}

/// Per-connection tuning knobs.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Largest request body accepted before answering 413
    pub max_body_len: usize,
    /// Largest slice handed to the upload callback in one call
    pub upload_chunk_len: usize,
    /// Outgoing WebSocket message queue depth before messages are dropped
    pub max_queued_messages: usize,
    /// Idle period before a keep-alive ping is sent, 0 disables
    pub keep_alive_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_body_len: 16 * 1024,
            upload_chunk_len: 1460,
            max_queued_messages: 8,
            keep_alive_ms: 0,
        }
    }
}

/// Errors surfaced by [`Connection::handle_event`].  All of them are terminal for
/// the connection.
#[derive(Debug, PartialEq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionError {
    /// The request could not be parsed
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The response could not be written
    #[error(transparent)]
    Response(#[from] ResponseError),
    /// The WebSocket session failed
    #[error(transparent)]
    Ws(#[from] WsError),
    /// The transport rejected a write
    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct HandlerSink<'a, H: RequestHandler> {
    handler: &'a mut H,
    active: bool,
}

impl<H: RequestHandler> UploadSink for HandlerSink<'_, H> {
    fn upload(&mut self, filename: &str, offset: usize, data: &[u8], is_final: bool) {
        if self.active {
            self.handler.handle_upload(filename, offset, data, is_final);
        }
    }
}

/// One client connection, from the first request byte to the close.
pub struct Connection<H: RequestHandler> {
    handler: H,
    config: Config,
    parser: RequestParser,
    response: Option<(Response, ResponseWriter)>,
    ws: Option<WsConnection>,
    selected: bool,
    over_cap: bool,
    // unsent remainder of the interim 100 Continue line, flushed under the window
    interim: Vec<u8>,
    // bytes written outside the response writer (the 100 Continue line) whose
    // acks must not be attributed elsewhere
    loose_bytes: usize,
}

impl<H: RequestHandler> Connection<H> {
    /// A connection serving `handler` with the given tuning.
    pub fn new(handler: H, config: Config) -> Self {
        let parser = RequestParser::new(config.upload_chunk_len);
        Self {
            handler,
            config,
            parser,
            response: None,
            ws: None,
            selected: true,
            over_cap: false,
            interim: Vec::new(),
            loose_bytes: 0,
        }
    }

    /// The handler this connection dispatches to.
    pub fn handler(&mut self) -> &mut H {
        &mut self.handler
    }

    /// The WebSocket send queues, present once an upgrade has been accepted.
    /// Lets the embedding push messages between events.
    pub fn ws_sender(&mut self) -> Option<&mut WsSender> {
        self.ws.as_mut().map(WsConnection::sender)
    }

    /// Feed one event into the connection.  `now_ms` is the embedding's
    /// monotonic clock, used only for keep-alive scheduling.
    pub fn handle_event(
        &mut self,
        event: Event<'_>,
        t: &mut dyn Transport,
        now_ms: u32,
    ) -> Result<(), ConnectionError> {
        let result = match event {
            Event::Data(data) => self.handle_data(data, t, now_ms),
            Event::Ack { len, .. } => self.handle_ack(len, t, now_ms),
            Event::Poll => self.handle_poll(t, now_ms),
            Event::Timeout { elapsed_ms } => {
                warning!("connection idle for {}ms, closing", elapsed_ms);
                t.close(true);
                Ok(())
            }
            Event::Disconnect => {
                if self.ws.is_some() {
                    self.handler.on_ws_disconnect();
                }
                Ok(())
            }
        };
        // every error is terminal, the transport must not be left open
        if result.is_err() {
            t.close(true);
        }
        result
    }

    fn handle_data(
        &mut self,
        data: &[u8],
        t: &mut dyn Transport,
        now_ms: u32,
    ) -> Result<(), ConnectionError> {
        if let Some(ws) = self.ws.as_mut() {
            ws.handle_data(data, t, now_ms, &mut self.handler)?;
            return Ok(());
        }

        let mut offset = 0;
        loop {
            let active = self.selected && !self.over_cap;
            let (consumed, event) = {
                let mut sink = HandlerSink {
                    handler: &mut self.handler,
                    active,
                };
                self.parser.feed(&data[offset..], &mut sink)?
            };
            offset += consumed;

            match event {
                ParseEvent::NeedMoreData => return Ok(()),
                ParseEvent::HostParsed => {
                    self.selected = self.handler.can_handle(self.parser.request());
                    self.parser.retain_headers(self.handler.retained_headers());
                    if !self.selected {
                        debug!("no handler for {}", self.parser.request().url);
                    }
                }
                ParseEvent::HeadersComplete => self.headers_complete(t)?,
                ParseEvent::BodyChunk { data, index, total } => {
                    if active {
                        self.handler.handle_body(data, index, total);
                    }
                }
                ParseEvent::RequestComplete => {
                    self.finish_request(t)?;
                    if offset < data.len()
                        && let Some(ws) = self.ws.as_mut()
                    {
                        ws.handle_data(&data[offset..], t, now_ms, &mut self.handler)?;
                    }
                    return Ok(());
                }
            }
        }
    }

    fn headers_complete(&mut self, t: &mut dyn Transport) -> Result<(), ConnectionError> {
        let total = self.parser.request().content_length;
        if total > self.config.max_body_len {
            warning!("request body {} over the {} cap", total, self.config.max_body_len);
            self.over_cap = true;
            self.parser.discard_body();
            return self.start_response(Response::new(StatusCode::PayloadTooLarge), t);
        }
        if self.parser.request().expecting_continue() {
            trace!("sending 100 Continue");
            self.interim.extend_from_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
            return self.flush_interim(t);
        }
        Ok(())
    }

    // Write as much of the staged interim status line as the window allows; the
    // remainder goes out on later acks and polls, ahead of any response bytes.
    fn flush_interim(&mut self, t: &mut dyn Transport) -> Result<(), ConnectionError> {
        if self.interim.is_empty() {
            return Ok(());
        }
        let n = t.window().min(self.interim.len());
        if n == 0 {
            return Ok(());
        }
        let accepted = t.write(&self.interim[..n])?;
        if accepted < n {
            return Err(ResponseError::WriteFailure.into());
        }
        self.loose_bytes += n;
        self.interim.drain(..n);
        Ok(())
    }

    fn finish_request(&mut self, t: &mut dyn Transport) -> Result<(), ConnectionError> {
        if self.over_cap {
            // the 413 went out when the headers arrived, the body was drained
            return Ok(());
        }
        if !self.selected {
            return self.start_response(Response::new(StatusCode::NotImplemented), t);
        }

        let wants_upgrade = self
            .parser
            .request()
            .header(HEAD_UPGRADE)
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        if wants_upgrade {
            return self.finish_upgrade(t);
        }

        let resp = self.handler.handle_request(self.parser.request());
        self.start_response(resp, t)
    }

    fn finish_upgrade(&mut self, t: &mut dyn Transport) -> Result<(), ConnectionError> {
        let version_ok = self
            .parser
            .request()
            .header(HEAD_SEC_WEBSOCKET_VERSION)
            .is_some_and(|v| v == "13");
        let accept = self
            .parser
            .request()
            .header(HEAD_SEC_WEBSOCKET_KEY)
            .and_then(sec_websocket_accept_val);

        match accept {
            Some(accept) if version_ok => {
                if !self.handler.accept_upgrade(self.parser.request()) {
                    debug!("handler declined upgrade for {}", self.parser.request().url);
                    let resp = self.handler.handle_request(self.parser.request());
                    return self.start_response(resp, t);
                }

                trace!("upgrading {} to websocket", self.parser.request().url);
                let mut resp = Response::new(StatusCode::SwitchingProtocols);
                resp.add_header(HEAD_UPGRADE, "websocket");
                resp.add_header(HEAD_CONNECTION, "Upgrade");
                resp.add_header(HEAD_SEC_WEBSOCKET_ACCEPT, &accept);

                let mut ws = WsConnection::new(
                    self.config.max_queued_messages,
                    self.config.keep_alive_ms,
                );
                self.handler.on_ws_connect(ws.sender());
                self.ws = Some(ws);
                self.start_response(resp, t)
            }
            _ => {
                warning!("websocket upgrade rejected, missing key or unsupported version");
                let mut resp = Response::new(StatusCode::BadRequest);
                resp.add_header(HEAD_SEC_WEBSOCKET_VERSION, "13");
                self.start_response(resp, t)
            }
        }
    }

    fn start_response(
        &mut self,
        mut resp: Response,
        t: &mut dyn Transport,
    ) -> Result<(), ConnectionError> {
        self.flush_interim(t)?;
        let mut writer = ResponseWriter::new(self.parser.request().version);
        if let Err(e) = writer.respond(&mut resp, t) {
            return match e {
                ResponseError::SourceInvalid => {
                    warning!("response body source invalid, answering 500");
                    let mut resp = Response::new(StatusCode::InternalServerError);
                    let mut writer = ResponseWriter::new(self.parser.request().version);
                    if let Err(e) = writer.respond(&mut resp, t) {
                        t.close(true);
                        return Err(e.into());
                    }
                    self.response = Some((resp, writer));
                    Ok(())
                }
                e => {
                    t.close(true);
                    Err(e.into())
                }
            };
        }
        self.response = Some((resp, writer));
        Ok(())
    }

    fn handle_ack(
        &mut self,
        mut len: usize,
        t: &mut dyn Transport,
        now_ms: u32,
    ) -> Result<(), ConnectionError> {
        if self.loose_bytes > 0 {
            let take = len.min(self.loose_bytes);
            self.loose_bytes -= take;
            len -= take;
        }
        self.flush_interim(t)?;

        if let Some((resp, writer)) = self.response.as_mut() {
            let take = len.min(writer.unacked());
            len -= take;
            if let Err(e) = writer.on_ack(resp, t, take) {
                t.close(true);
                return Err(e.into());
            }
            if writer.finished() {
                self.response = None;
                if self.ws.is_none() {
                    trace!("response complete, closing");
                    t.close(false);
                    return Ok(());
                }
            }
        }

        if len > 0
            && let Some(ws) = self.ws.as_mut()
        {
            ws.on_ack(len, t, now_ms)?;
        }
        Ok(())
    }

    fn handle_poll(&mut self, t: &mut dyn Transport, now_ms: u32) -> Result<(), ConnectionError> {
        self.flush_interim(t)?;
        if let Some((resp, writer)) = self.response.as_mut() {
            if let Err(e) = writer.on_poll(resp, t) {
                t.close(true);
                return Err(e.into());
            }
            // websocket frames wait until the upgrade response has been acknowledged
            return Ok(());
        }
        if let Some(ws) = self.ws.as_mut() {
            ws.poll(t, now_ms)?;
        }
        Ok(())
    }
}

//! # Httpflow
//!
//! `httpflow` is an event-driven, flow-controlled implementation of the HTTP and WebSocket
//! server protocols aimed at `no_std` (with `alloc`) use cases such as embedded development.
//!
//! The core of the crate performs no I/O of its own.  A [`connection::Connection`] consumes
//! [`connection::Event`]s (received bytes, write acknowledgements, poll ticks, timeouts and
//! disconnects) and produces output through a [`connection::Transport`] that the embedder
//! provides.  Output is always cut to the transport's advertised write window, and further
//! output is held back until the transport acknowledges earlier writes.  This makes the
//! engine usable on top of any event-driven TCP stack.
//!
//! This crate provides:
//!
//! * incremental decoding of HTTP requests, including urlencoded and multipart/form-data
//!   bodies, across arbitrarily fragmented reads.
//! * window/acknowledgement driven encoding of HTTP responses with fixed, chunked and
//!   streamed bodies.
//! * WebSocket upgrades and a full frame engine (fragmentation, control frames, close
//!   handshake and keep-alive pings) on the same connection.
//!
//! This crate does **not** provide:
//!
//! * URL based routing.  A single [`server::RequestHandler`] sees every request.
//! * TLS, compression, or HTTP/1.1 pipelining.
//!
//! ## Basic Use
//!
//! Implement [`server::RequestHandler`] for the resource that will answer requests, then
//! either drive a [`connection::Connection`] directly from your own event loop, or hand the
//! handler to a [`server::Server`] and call `serve()` with anything that implements
//! `embedded_io_async::{Read, Write}`.
//!
//! ## Example
//!
//! ```
//! use httpflow::connection::{Config, Connection, Event, Transport, TransportError};
//! use httpflow::request::Request;
//! use httpflow::response::{Response, StatusCode};
//! use httpflow::server::RequestHandler;
//!
//! const HTML_INDEX: &str = "<html>...</html>";
//!
//! struct MyHandler;
//!
//! impl RequestHandler for MyHandler {
//!     fn handle_request(&mut self, req: &Request) -> Response {
//!         match req.url.as_str() {
//!             "/" => Response::text(StatusCode::OK, "text/html", HTML_INDEX),
//!             _ => Response::text(StatusCode::NotFound, "text/plain", "Not Found"),
//!         }
//!     }
//! }
//!
//! // The transport would typically wrap an event-driven TCP socket.
//! struct Pipe {
//!     out: Vec<u8>,
//!     closed: bool,
//! }
//!
//! impl Transport for Pipe {
//!     fn window(&self) -> usize {
//!         1024
//!     }
//!
//!     fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
//!         self.out.extend_from_slice(data);
//!         Ok(data.len())
//!     }
//!
//!     fn close(&mut self, _immediate: bool) {
//!         self.closed = true;
//!     }
//! }
//!
//! let mut conn = Connection::new(MyHandler, Config::default());
//! let mut pipe = Pipe { out: Vec::new(), closed: false };
//!
//! conn.handle_event(Event::Data(b"GET / HTTP/1.1\r\nHost: local\r\n\r\n"), &mut pipe, 0)
//!     .unwrap();
//! let sent = pipe.out.len();
//! assert!(sent > 0);
//!
//! conn.handle_event(Event::Ack { len: sent, elapsed_ms: 0 }, &mut pipe, 0).unwrap();
//! assert!(pipe.closed);
//! ```

#![no_std]
#![warn(missing_docs)]

extern crate alloc;

mod ascii;
/// Per-connection event engine
pub mod connection;
/// HTTP headers
pub mod header;
mod log;
/// Multipart/form-data bodies
pub mod multipart;
/// HTTP requests
pub mod request;
/// HTTP responses
pub mod response;
/// HTTP server
pub mod server;
/// Websockets
pub mod websocket;

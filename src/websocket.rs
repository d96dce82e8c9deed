//! The WebSocket half of an upgraded connection.
//!
//! Once a request carrying `Upgrade: websocket` is accepted, the connection is
//! re-purposed to carry WebSocket frames in both directions.  It cannot be
//! downgraded.  Incoming bytes are decoded incrementally and surfaced to the
//! handler as frame chunks; outgoing messages and control frames are queued on a
//! [`WsSender`] and written out as the transport window and acknowledgements
//! allow.
//!
//! For more info:
//!
//! * <https://developer.mozilla.org/en-US/docs/Web/API/WebSockets_API/Writing_WebSocket_servers>

use alloc::collections::VecDeque;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use base64ct::{Base64, Encoding};
use sha1::{Digest, Sha1};

use crate::connection::{Transport, TransportError};
use crate::log::{trace, warning};
use crate::server::RequestHandler;

const SEC_WEBSOCKET_ACCEPT_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Payload used for unsolicited keep-alive pings.  Pongs echoing it are consumed
/// silently instead of being surfaced to the handler.
pub(crate) const KEEPALIVE_PAYLOAD: &[u8] = b"hf-keepalive";

pub(crate) fn sec_websocket_accept_val(key: &str) -> Option<String> {
    let mut key_hasher = Sha1::new();
    key_hasher.update(key.as_bytes());
    key_hasher.update(SEC_WEBSOCKET_ACCEPT_MAGIC.as_bytes());
    let key_hash = key_hasher.finalize();

    // a 20 byte hash always encodes to exactly 28 base64 bytes
    let mut key_b64_buff = [0u8; 28];
    Base64::encode(&key_hash, &mut key_b64_buff)
        .ok()
        .map(ToString::to_string)
}

/// Errors that may be produced while handling WebSocket traffic.
#[derive(Debug, PartialEq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WsError {
    /// A frame carried an opcode outside the known set
    #[error("unknown frame opcode {0}")]
    UnknownOpcode(u8),
    /// A control frame was fragmented or its payload exceeded 125 bytes
    #[error("malformed control frame")]
    BadControlFrame,
    /// The transport rejected a write within its advertised window
    #[error("transport write failed")]
    WriteFailure,
}

impl From<TransportError> for WsError {
    fn from(_: TransportError) -> Self {
        Self::WriteFailure
    }
}

/// WebSocket frame opcodes.
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// True for Close, Ping and Pong.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WsError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(WsError::UnknownOpcode(other)),
        }
    }
}

/// Description of the frame a payload chunk belongs to, passed to the handler
/// alongside each chunk of decoded payload.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrameInfo {
    /// This frame's own opcode, Continuation for non-initial fragments
    pub opcode: OpCode,
    /// The opcode of the message this frame belongs to, Text or Binary
    pub message_opcode: OpCode,
    /// Frame number within the current message, 0 for the first fragment
    pub num: u32,
    /// True on the final frame of a message
    pub fin: bool,
    /// True when the client masked the payload
    pub masked: bool,
    /// Total payload length of this frame
    pub len: u64,
    /// Offset of the delivered chunk within the frame payload
    pub index: u64,
    pub(crate) mask: [u8; 4],
}

/// Connection status as seen by the WebSocket layer.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WsStatus {
    /// Frames flow in both directions
    Connected,
    /// A Close frame is queued or sent, awaiting completion of the handshake
    Disconnecting,
    /// The close handshake completed
    Disconnected,
}

fn encode_frame_head(opcode: OpCode, fin: bool, len: usize, dest: &mut [u8; 10]) -> usize {
    dest[0] = (if fin { 0x80u8 } else { 0 }) | opcode as u8;
    if len <= 125 {
        dest[1] = len as u8;
        2
    } else if len <= u16::MAX as usize {
        dest[1] = 126;
        dest[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        4
    } else {
        dest[1] = 127;
        dest[2..10].copy_from_slice(&(len as u64).to_be_bytes());
        10
    }
}

struct WsControl {
    opcode: OpCode,
    payload: Vec<u8>,
    sent: bool,
    acked: usize,
}

impl WsControl {
    fn wire_len(&self) -> usize {
        2 + self.payload.len()
    }

    // control frames go out atomically or not at all
    fn send(&mut self, t: &mut dyn Transport) -> Result<bool, WsError> {
        let wire = self.wire_len();
        if t.window() < wire {
            return Ok(false);
        }
        let mut frame = Vec::with_capacity(wire);
        frame.push(0x80 | self.opcode as u8);
        frame.push(self.payload.len() as u8);
        frame.extend_from_slice(&self.payload);
        let accepted = t.write(&frame)?;
        if accepted < wire {
            return Err(WsError::WriteFailure);
        }
        self.sent = true;
        Ok(true)
    }
}

struct WsMessage {
    opcode: OpCode,
    data: Vec<u8>,
    head_sent: bool,
    sent: usize,
    ack_expected: usize,
    acked: usize,
}

impl WsMessage {
    fn finished_sending(&self) -> bool {
        self.head_sent && self.sent == self.data.len()
    }

    fn fully_acked(&self) -> bool {
        self.finished_sending() && self.acked >= self.ack_expected
    }

    // Write as much of the frame as the window allows.  Returns false when no
    // bytes could be written.
    fn send(&mut self, t: &mut dyn Transport) -> Result<bool, WsError> {
        let mut progressed = false;

        if !self.head_sent {
            let mut head = [0u8; 10];
            let head_len = encode_frame_head(self.opcode, true, self.data.len(), &mut head);
            if t.window() < head_len {
                return Ok(false);
            }
            let accepted = t.write(&head[..head_len])?;
            if accepted < head_len {
                return Err(WsError::WriteFailure);
            }
            self.head_sent = true;
            self.ack_expected += head_len;
            progressed = true;
        }

        let n = t.window().min(self.data.len() - self.sent);
        if n > 0 {
            let accepted = t.write(&self.data[self.sent..self.sent + n])?;
            if accepted < n {
                return Err(WsError::WriteFailure);
            }
            self.sent += n;
            self.ack_expected += n;
            progressed = true;
        }

        Ok(progressed)
    }
}

/// Queues outgoing messages and control frames and writes them to the transport
/// as the send window allows.  Handed to the handler so it can reply from within
/// its callbacks.
pub struct WsSender {
    controls: VecDeque<WsControl>,
    messages: VecDeque<WsMessage>,
    status: WsStatus,
    max_queued: usize,
    keep_alive_ms: u32,
    last_activity_ms: u32,
}

impl WsSender {
    fn new(max_queued: usize, keep_alive_ms: u32) -> Self {
        Self {
            controls: VecDeque::new(),
            messages: VecDeque::new(),
            status: WsStatus::Connected,
            max_queued,
            keep_alive_ms,
            last_activity_ms: 0,
        }
    }

    /// Current status of the close handshake.
    pub fn status(&self) -> WsStatus {
        self.status
    }

    /// True while frames may still be queued.
    pub fn is_connected(&self) -> bool {
        self.status == WsStatus::Connected
    }

    /// Queue a text message.  Returns false if the message was dropped because
    /// the queue is full or the connection is closing.
    pub fn text(&mut self, text: &str) -> bool {
        self.queue_message(OpCode::Text, text.as_bytes().to_vec())
    }

    /// Queue a binary message.  Returns false if the message was dropped because
    /// the queue is full or the connection is closing.
    pub fn binary(&mut self, data: &[u8]) -> bool {
        self.queue_message(OpCode::Binary, data.to_vec())
    }

    /// Queue a Ping control frame.  The payload is cut to 125 bytes.
    pub fn ping(&mut self, payload: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.queue_control(OpCode::Ping, &payload[..payload.len().min(125)])
    }

    /// Begin the close handshake.  The reason is cut to fit the 125 byte control
    /// payload limit.  No further messages can be queued afterwards.
    pub fn close(&mut self, code: u16, reason: &str) {
        if !self.is_connected() {
            return;
        }
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(&reason.as_bytes()[..reason.len().min(123)]);
        self.queue_control(OpCode::Close, &payload);
        self.status = WsStatus::Disconnecting;
    }

    fn queue_message(&mut self, opcode: OpCode, data: Vec<u8>) -> bool {
        if !self.is_connected() || self.messages.len() >= self.max_queued {
            warning!("websocket message dropped, queue full or closing");
            return false;
        }
        self.messages.push_back(WsMessage {
            opcode,
            data,
            head_sent: false,
            sent: 0,
            ack_expected: 0,
            acked: 0,
        });
        true
    }

    fn queue_control(&mut self, opcode: OpCode, payload: &[u8]) -> bool {
        if self.controls.len() >= self.max_queued {
            warning!("websocket control frame dropped, queue full");
            return false;
        }
        self.controls.push_back(WsControl {
            opcode,
            payload: payload.to_vec(),
            sent: false,
            acked: 0,
        });
        true
    }

    // Write queued frames to the transport.  A partially written message frame
    // owns the wire until it completes; control frames go out between frames,
    // ahead of any message not yet started.
    fn run_queue(&mut self, t: &mut dyn Transport) -> Result<(), WsError> {
        loop {
            if let Some(msg) = self.messages.front_mut()
                && msg.head_sent
                && !msg.finished_sending()
            {
                if !msg.send(t)? {
                    return Ok(());
                }
                continue;
            }

            if let Some(ctrl) = self.controls.iter_mut().find(|c| !c.sent) {
                if !ctrl.send(t)? {
                    return Ok(());
                }
                continue;
            }

            if let Some(msg) = self.messages.front_mut()
                && !msg.head_sent
            {
                if !msg.send(t)? {
                    return Ok(());
                }
                continue;
            }

            return Ok(());
        }
    }

    // Attribute acknowledged bytes to in-flight frames, front of the control
    // queue first, then the message in progress.
    pub(crate) fn on_ack(
        &mut self,
        mut len: usize,
        t: &mut dyn Transport,
        now_ms: u32,
    ) -> Result<(), WsError> {
        self.last_activity_ms = now_ms;

        while len > 0 {
            if let Some(ctrl) = self.controls.front_mut()
                && ctrl.sent
            {
                let take = len.min(ctrl.wire_len() - ctrl.acked);
                ctrl.acked += take;
                len -= take;
                if ctrl.acked == ctrl.wire_len() {
                    let closing = ctrl.opcode == OpCode::Close;
                    self.controls.pop_front();
                    if closing && self.status == WsStatus::Disconnecting {
                        self.status = WsStatus::Disconnected;
                        t.close(true);
                        return Ok(());
                    }
                }
                continue;
            }

            if let Some(msg) = self.messages.front_mut() {
                let take = len.min(msg.ack_expected - msg.acked);
                msg.acked += take;
                len -= take;
                if msg.fully_acked() {
                    self.messages.pop_front();
                    continue;
                }
                if take > 0 {
                    continue;
                }
            }

            break;
        }

        self.run_queue(t)
    }

    pub(crate) fn poll(&mut self, t: &mut dyn Transport, now_ms: u32) -> Result<(), WsError> {
        if self.keep_alive_ms > 0
            && self.status == WsStatus::Connected
            && self.controls.is_empty()
            && self.messages.is_empty()
            && now_ms.wrapping_sub(self.last_activity_ms) >= self.keep_alive_ms
        {
            trace!("websocket idle for {}ms, sending keep-alive ping", self.keep_alive_ms);
            self.last_activity_ms = now_ms;
            self.ping(KEEPALIVE_PAYLOAD);
        }
        self.run_queue(t)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum RxState {
    Header,
    Payload,
}

fn header_needed(b1: u8) -> usize {
    let mut n = 2;
    match b1 & 0x7f {
        126 => n += 2,
        127 => n += 8,
        _ => {}
    }
    if b1 & 0x80 != 0 {
        n += 4;
    }
    n
}

struct FrameDecoder {
    state: RxState,
    header: [u8; 14],
    header_len: usize,
    info: FrameInfo,
    message_opcode: OpCode,
    num: u32,
    control_buf: Vec<u8>,
    scratch: Vec<u8>,
}

impl FrameDecoder {
    fn new() -> Self {
        Self {
            state: RxState::Header,
            header: [0; 14],
            header_len: 0,
            info: FrameInfo {
                opcode: OpCode::Text,
                message_opcode: OpCode::Text,
                num: 0,
                fin: true,
                masked: false,
                len: 0,
                index: 0,
                mask: [0; 4],
            },
            message_opcode: OpCode::Text,
            num: 0,
            control_buf: Vec::new(),
            scratch: Vec::new(),
        }
    }

    fn feed<H: RequestHandler>(
        &mut self,
        data: &[u8],
        out: &mut WsSender,
        handler: &mut H,
    ) -> Result<(), WsError> {
        let mut i = 0;
        while i < data.len() {
            match self.state {
                RxState::Header => {
                    self.header[self.header_len] = data[i];
                    self.header_len += 1;
                    i += 1;
                    if self.header_len >= 2 && self.header_len == header_needed(self.header[1]) {
                        self.begin_frame(out, handler)?;
                    }
                }
                RxState::Payload => {
                    let avail = (data.len() - i) as u64;
                    let take = avail.min(self.info.len - self.info.index) as usize;
                    if self.info.opcode.is_control() {
                        for j in 0..take {
                            let m = self.info.mask[((self.info.index + j as u64) % 4) as usize];
                            self.control_buf.push(data[i + j] ^ m);
                        }
                        self.info.index += take as u64;
                    } else {
                        self.scratch.clear();
                        for j in 0..take {
                            let m = self.info.mask[((self.info.index + j as u64) % 4) as usize];
                            self.scratch.push(data[i + j] ^ m);
                        }
                        let delivered = self.info;
                        self.info.index += take as u64;
                        handler.on_ws_frame(&delivered, &self.scratch[..take], out);
                    }
                    i += take;
                    if self.info.index == self.info.len {
                        self.end_frame(out, handler);
                    }
                }
            }
        }
        Ok(())
    }

    fn begin_frame<H: RequestHandler>(
        &mut self,
        out: &mut WsSender,
        handler: &mut H,
    ) -> Result<(), WsError> {
        let b0 = self.header[0];
        let b1 = self.header[1];
        self.header_len = 0;

        let fin = b0 & 0x80 != 0;
        let opcode = OpCode::try_from(b0 & 0x0f)?;
        let masked = b1 & 0x80 != 0;

        let (len, mask_offset) = match b1 & 0x7f {
            126 => (
                u16::from_be_bytes([self.header[2], self.header[3]]) as u64,
                4usize,
            ),
            127 => (
                u64::from_be_bytes([
                    self.header[2],
                    self.header[3],
                    self.header[4],
                    self.header[5],
                    self.header[6],
                    self.header[7],
                    self.header[8],
                    self.header[9],
                ]),
                10,
            ),
            n => (n as u64, 2),
        };

        let mask = if masked {
            [
                self.header[mask_offset],
                self.header[mask_offset + 1],
                self.header[mask_offset + 2],
                self.header[mask_offset + 3],
            ]
        } else {
            [0; 4]
        };

        if opcode.is_control() {
            if !fin || len > 125 {
                return Err(WsError::BadControlFrame);
            }
            self.control_buf.clear();
        } else if opcode == OpCode::Continuation {
            self.num += 1;
        } else {
            self.message_opcode = opcode;
            self.num = 0;
        }

        self.info = FrameInfo {
            opcode,
            message_opcode: self.message_opcode,
            num: self.num,
            fin,
            masked,
            len,
            index: 0,
            mask,
        };

        if len == 0 {
            if !opcode.is_control() {
                handler.on_ws_frame(&self.info, &[], out);
            }
            self.end_frame(out, handler);
        } else {
            self.state = RxState::Payload;
        }

        Ok(())
    }

    fn end_frame<H: RequestHandler>(&mut self, out: &mut WsSender, handler: &mut H) {
        if self.info.opcode.is_control() {
            let payload = core::mem::take(&mut self.control_buf);
            self.handle_control(&payload, out, handler);
        }
        self.state = RxState::Header;
        self.header_len = 0;
    }

    fn handle_control<H: RequestHandler>(
        &mut self,
        payload: &[u8],
        out: &mut WsSender,
        handler: &mut H,
    ) {
        match self.info.opcode {
            OpCode::Ping => {
                trace!("websocket ping, {} byte payload", payload.len());
                out.queue_control(OpCode::Pong, payload);
            }
            OpCode::Pong => {
                if payload == KEEPALIVE_PAYLOAD {
                    trace!("keep-alive pong");
                } else {
                    handler.on_ws_pong(payload);
                }
            }
            OpCode::Close => {
                let mut code = 1000u16;
                let mut reason = "";
                if payload.len() >= 2 {
                    code = u16::from_be_bytes([payload[0], payload[1]]);
                    reason = core::str::from_utf8(&payload[2..]).unwrap_or("");
                }
                if code > 1001 {
                    handler.on_ws_error(code, reason);
                }
                match out.status {
                    // our Close is in flight or acked, the peer has now replied
                    WsStatus::Disconnecting => out.status = WsStatus::Disconnected,
                    WsStatus::Connected => {
                        out.queue_control(OpCode::Close, payload);
                        out.status = WsStatus::Disconnecting;
                    }
                    WsStatus::Disconnected => {}
                }
            }
            _ => {}
        }
    }
}

/// The per-connection WebSocket engine, created when an upgrade is accepted.
pub(crate) struct WsConnection {
    rx: FrameDecoder,
    out: WsSender,
}

impl WsConnection {
    pub(crate) fn new(max_queued: usize, keep_alive_ms: u32) -> Self {
        Self {
            rx: FrameDecoder::new(),
            out: WsSender::new(max_queued, keep_alive_ms),
        }
    }

    /// Access to the outgoing queues, e.g. for the upgrade-time connect callback.
    pub(crate) fn sender(&mut self) -> &mut WsSender {
        &mut self.out
    }

    pub(crate) fn disconnected(&self) -> bool {
        self.out.status == WsStatus::Disconnected
    }

    pub(crate) fn handle_data<H: RequestHandler>(
        &mut self,
        data: &[u8],
        t: &mut dyn Transport,
        now_ms: u32,
        handler: &mut H,
    ) -> Result<(), WsError> {
        self.out.last_activity_ms = now_ms;
        let Self { rx, out } = self;
        rx.feed(data, out, handler)?;
        if self.out.status == WsStatus::Disconnected {
            t.close(true);
            return Ok(());
        }
        self.out.run_queue(t)
    }

    pub(crate) fn on_ack(
        &mut self,
        len: usize,
        t: &mut dyn Transport,
        now_ms: u32,
    ) -> Result<(), WsError> {
        self.out.on_ack(len, t, now_ms)
    }

    pub(crate) fn poll(&mut self, t: &mut dyn Transport, now_ms: u32) -> Result<(), WsError> {
        self.out.poll(t, now_ms)
    }
}

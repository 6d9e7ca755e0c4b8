//! Per-connection transport handling: non-blocking framed reads and writes
//! plus the bounded outbound message queue.
//!
//! A [`Connection`] exclusively owns its transport. It is created when an
//! accepted socket is handed to the onboarding stage, moved (never copied)
//! between stage tables on transition, and dropped on disconnect, transport
//! error, or eviction.

use log::warn;
use protocol::{decode_frame, ClientMessage, FrameError, MAX_FRAME_LEN};
use std::collections::VecDeque;
use std::io;
use tokio::net::TcpStream;

/// Maximum number of not-yet-sent messages queued per connection. A push
/// past this bound is rejected and logged, never buffered.
pub const OUTBOUND_CAPACITY: usize = 16;

/// Read chunk size for a single receive attempt.
const READ_CHUNK: usize = 2048;

/// Byte-stream transport with non-blocking semantics.
///
/// Both operations return immediately: `WouldBlock` when the socket is not
/// ready, `Ok(0)` from `try_recv` when the peer closed the stream. Stage
/// logic is tested against a scripted implementation of this trait.
pub trait Transport: Send {
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize>;
    /// Peer description for log lines.
    fn peer(&self) -> String;
}

impl Transport for TcpStream {
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_read(buf)
    }

    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.try_write(buf)
    }

    fn peer(&self) -> String {
        self.peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string())
    }
}

/// Result of one receive attempt on a connection.
#[derive(Debug)]
pub enum RecvOutcome {
    /// No complete message this tick; try again next tick.
    Idle,
    /// One decoded message. At most one is returned per attempt so a noisy
    /// connection cannot monopolize a tick.
    Message(ClientMessage),
    /// Peer closed the stream cleanly.
    Closed,
}

/// A connected client's transport plus outbound queue.
pub struct Connection {
    transport: Box<dyn Transport>,
    /// Serialized frames not yet started on the wire, oldest first.
    outbound: VecDeque<Vec<u8>>,
    /// Frame currently being written, with the count of bytes already sent.
    /// Once writing starts the frame is wire-committed: it always flushes
    /// before anything else and does not move across a stage transition.
    in_flight: Option<(Vec<u8>, usize)>,
    /// Raw bytes received but not yet forming a complete frame.
    inbound: Vec<u8>,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            outbound: VecDeque::new(),
            in_flight: None,
            inbound: Vec::new(),
        }
    }

    pub fn peer(&self) -> String {
        self.transport.peer()
    }

    /// Enqueues an already-serialized frame. Returns false and logs if the
    /// queue is at capacity (backpressure: reject, never grow).
    pub fn enqueue_frame(&mut self, frame: Vec<u8>) -> bool {
        if self.outbound.len() >= OUTBOUND_CAPACITY {
            warn!(
                "outbound queue full for {}; dropping message ({} bytes)",
                self.peer(),
                frame.len()
            );
            return false;
        }
        self.outbound.push_back(frame);
        true
    }

    /// Number of queued (not yet started) outbound frames.
    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    /// Takes the not-yet-started outbound frames for carry-over across a
    /// stage transition. An in-flight partial frame stays behind with the
    /// connection so the byte stream cannot be corrupted by re-ordering.
    pub(crate) fn take_outbound(&mut self) -> VecDeque<Vec<u8>> {
        std::mem::take(&mut self.outbound)
    }

    /// Re-queues frames taken by [`take_outbound`](Self::take_outbound)
    /// after a stage transition. Bypasses the capacity check: these frames
    /// were accepted once already and a move must not lose them, so the
    /// queue may transiently exceed the bound by one greeting burst.
    pub(crate) fn requeue_frames(&mut self, frames: VecDeque<Vec<u8>>) {
        self.outbound.extend(frames);
    }

    /// True when `inbound` already holds a complete frame (or a header
    /// declaring an oversized one, which decoding rejects immediately).
    fn has_buffered_frame(&self) -> bool {
        if self.inbound.len() < 4 {
            return false;
        }
        let len =
            u32::from_le_bytes([self.inbound[0], self.inbound[1], self.inbound[2], self.inbound[3]])
                as usize;
        len > MAX_FRAME_LEN || self.inbound.len() >= 4 + len
    }

    /// One non-blocking read attempt, decoding at most one message.
    ///
    /// The socket is only read when the reassembly buffer holds no complete
    /// frame, so a client sending faster than one message per tick is
    /// throttled by the kernel buffer instead of growing `inbound` without
    /// bound. A malformed frame is consumed and logged without failing the
    /// connection; an oversized frame means the stream is desynchronized and
    /// is reported as an error so the connection gets removed.
    pub fn poll_receive(&mut self) -> io::Result<RecvOutcome> {
        if !self.has_buffered_frame() {
            let mut chunk = [0u8; READ_CHUNK];
            match self.transport.try_recv(&mut chunk) {
                Ok(0) => return Ok(RecvOutcome::Closed),
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        match decode_frame::<ClientMessage>(&mut self.inbound) {
            Ok(Some(msg)) => Ok(RecvOutcome::Message(msg)),
            Ok(None) => Ok(RecvOutcome::Idle),
            Err(e @ FrameError::Oversized(_)) => {
                Err(io::Error::new(io::ErrorKind::InvalidData, e))
            }
            Err(FrameError::Malformed(e)) => {
                warn!("dropping malformed frame from {}: {}", self.peer(), e);
                Ok(RecvOutcome::Idle)
            }
        }
    }

    /// Writes queued frames front-to-back until the queue empties or the
    /// socket would block. A partial write leaves the remainder in flight
    /// for the next tick; frames are never re-serialized or duplicated.
    pub fn flush(&mut self) -> io::Result<()> {
        loop {
            let (frame, offset) = match self.in_flight.take() {
                Some(partial) => partial,
                None => match self.outbound.pop_front() {
                    Some(frame) => (frame, 0),
                    None => return Ok(()),
                },
            };

            match self.transport.try_send(&frame[offset..]) {
                Ok(n) if offset + n < frame.len() => {
                    self.in_flight = Some((frame, offset + n));
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.in_flight = Some((frame, offset));
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Bytes sitting in the reassembly buffer, for assertions.
    #[cfg(test)]
    pub(crate) fn buffered_len(&self) -> usize {
        self.inbound.len()
    }

    /// Decoded view of the queued outbound frames, for assertions.
    #[cfg(test)]
    pub(crate) fn queued_messages(&self) -> Vec<protocol::ServerMessage> {
        self.outbound
            .iter()
            .map(|frame| bincode::deserialize(&frame[4..]).expect("queued frame must decode"))
            .collect()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer())
            .field("queued", &self.outbound.len())
            .field("in_flight", &self.in_flight.is_some())
            .field("buffered", &self.inbound.len())
            .finish()
    }
}

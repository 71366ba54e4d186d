//! The transport contract (§4.4): a narrow interface each concrete
//! transport adapter implements, plus the length-prefixed framing
//! logic the core owns so adapters don't have to reimplement it.
//!
//! Concrete I/O (UART drivers, TCP sockets, L2CAP channels, CoAP
//! blockwise transfer) is an external collaborator; this module only
//! specifies the capability an adapter must provide and the byte-
//! stream reassembly rule adapters for stream transports should drive
//! through [`FrameAssembler`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, ProtoKind};
use crate::utils::Result;

/// The capability surface the dispatcher and client multiplexer
/// consume. A transport delivers exactly one complete 9P message per
/// `recv` resolution and sends exactly one complete message per `send`
/// call (§4.4: "must not interleave with another send on the same
/// transport" — implementations achieve this by owning their write
/// half exclusively, e.g. behind a mutex one level up, as the server
/// dispatcher's TX buffer does).
///
/// This models the source's callback-driven `send/start/stop/mtu`
/// quartet as async methods plus a `None` return from `recv` for
/// "stopped" / EOF, per the design document's note (§9) to replace
/// function-pointer-and-context pairs with a capability value.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send exactly one framed message.
    async fn send(&self, buf: &[u8]) -> Result<()>;

    /// Receive exactly one framed message, or `Ok(None)` when the
    /// peer has disconnected.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Upper bound on a single message this transport can carry, or
    /// `None` if the transport imposes no bound narrower than the
    /// session's negotiated `msize`.
    fn mtu(&self) -> Option<u32> {
        None
    }
}

/// Byte-stream reassembly for transports that only guarantee ordered
/// delivery of bytes, not message boundaries (e.g. a raw UART).
///
/// Feed inbound bytes via [`FrameAssembler::feed`]; drain complete
/// messages (body only — the 4-byte size prefix is consumed here) via
/// [`FrameAssembler::next_message`]. A declared size smaller than 7 or
/// larger than `max_message_len` causes that message to be dropped and
/// the assembler to resynchronize on the next size field, per §4.4.
pub struct FrameAssembler {
    buf: Vec<u8>,
    max_message_len: usize,
    /// Bytes of an oversized frame still to be discarded. Nonzero only
    /// while resynchronizing after a length prefix exceeded
    /// `max_message_len` — the offending payload is never buffered,
    /// just counted down and dropped as it arrives.
    skip_remaining: usize,
}

impl FrameAssembler {
    pub fn new(max_message_len: usize) -> FrameAssembler {
        FrameAssembler {
            buf: Vec::new(),
            max_message_len,
            skip_remaining: 0,
        }
    }

    /// Append newly-arrived bytes to the assembler's internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to pull one complete message (the bytes after the size
    /// prefix: type, tag, payload) out of the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Returns
    /// `Err(MalformedMessage)` once for each malformed/oversized
    /// length prefix encountered; callers should keep calling until
    /// `Ok(None)` to drain every frame (and error) currently bufferable.
    pub fn next_message(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if self.skip_remaining > 0 {
                let drop_now = self.skip_remaining.min(self.buf.len());
                self.buf.drain(0..drop_now);
                self.skip_remaining -= drop_now;
                if self.skip_remaining > 0 {
                    return Ok(None);
                }
                // Resynchronized; fall through to parse the next frame.
            }

            if self.buf.len() < 4 {
                return Ok(None);
            }
            let size =
                u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;

            if size < 7 {
                // Malformed: resync by dropping just the size field
                // and reparsing from the next byte.
                self.buf.drain(0..4);
                return Err(Error::proto(ProtoKind::MalformedMessage));
            }

            if size > self.max_message_len {
                // Drop the size field now and discard the rest of the
                // oversized payload as it arrives, never buffering it
                // in full (§4.4).
                self.buf.drain(0..4);
                self.skip_remaining = size - 4;
                return Err(Error::proto(ProtoKind::MalformedMessage));
            }

            if self.buf.len() < size {
                return Ok(None);
            }

            let frame: Vec<u8> = self.buf.drain(0..size).collect();
            return Ok(Some(frame[4..].to_vec()));
        }
    }
}

/// An in-process, in-memory transport pair used by this crate's own
/// tests (and suitable for embedding a 9P client/server in the same
/// process). Each endpoint's `send` feeds the peer's `recv` queue
/// directly; no byte-stream reassembly is needed since messages are
/// already whole.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl ChannelTransport {
    /// Build a connected pair: bytes sent on `a` arrive via `b.recv()`
    /// and vice versa.
    pub fn pair() -> (ChannelTransport, ChannelTransport) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                tx: tx_a,
                rx: tokio::sync::Mutex::new(rx_b),
            },
            ChannelTransport {
                tx: tx_b,
                rx: tokio::sync::Mutex::new(rx_a),
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, buf: &[u8]) -> Result<()> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| Error::proto(ProtoKind::TransportError))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_messages_fed_byte_at_a_time_yield_two_frames() {
        let mut msg1 = vec![0u8; 4];
        msg1[0] = 10;
        msg1.extend(vec![0xAA; 6]);
        let mut msg2 = vec![0u8; 4];
        msg2[0] = 8;
        msg2.extend(vec![0xBB; 4]);

        let mut all = msg1.clone();
        all.extend(msg2.clone());

        let mut assembler = FrameAssembler::new(1024);
        let mut completed = Vec::new();
        for byte in all {
            assembler.feed(&[byte]);
            while let Ok(Some(frame)) = assembler.next_message() {
                completed.push(frame);
            }
        }
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0], msg1[4..]);
        assert_eq!(completed[1], msg2[4..]);
    }

    #[test]
    fn oversized_size_field_is_dropped_and_assembler_resyncs() {
        let mut bogus = vec![0u8; 4];
        bogus[0..4].copy_from_slice(&(10_000_000u32).to_le_bytes());
        bogus.extend(vec![0u8; 10_000_000]);

        let mut good = vec![0u8; 4];
        good[0] = 8;
        good.extend(vec![0x42; 4]);

        let mut assembler = FrameAssembler::new(4096);
        assembler.feed(&bogus);
        let err = assembler.next_message().unwrap_err();
        assert!(matches!(err, Error::Proto(ProtoKind::MalformedMessage, _)));

        assembler.feed(&good);
        let frame = assembler.next_message().unwrap().unwrap();
        assert_eq!(frame, good[4..]);
    }

    #[test]
    fn oversized_frame_is_discarded_without_buffering_it_in_full() {
        let total: usize = 10_000_000;
        let mut header = vec![0u8; 4];
        header.copy_from_slice(&(total as u32).to_le_bytes());

        let mut assembler = FrameAssembler::new(4096);
        assembler.feed(&header);
        let err = assembler.next_message().unwrap_err();
        assert!(matches!(err, Error::Proto(ProtoKind::MalformedMessage, _)));
        assert_eq!(assembler.buf.len(), 0);

        // Stream the rest of the oversized payload in small chunks;
        // the assembler must never grow its buffer to hold it all.
        let chunk = [0u8; 1024];
        let mut remaining = total - 4;
        while remaining > 0 {
            let n = chunk.len().min(remaining);
            assembler.feed(&chunk[..n]);
            assert!(assembler.next_message().unwrap().is_none());
            assert!(assembler.buf.len() <= chunk.len());
            remaining -= n;
        }

        let mut good = vec![0u8; 4];
        good[0] = 8;
        good.extend(vec![0x42; 4]);
        assembler.feed(&good);
        let frame = assembler.next_message().unwrap().unwrap();
        assert_eq!(frame, good[4..]);
    }

    #[tokio::test]
    async fn channel_transport_round_trips() {
        let (a, b) = ChannelTransport::pair();
        a.send(b"hello").await.unwrap();
        assert_eq!(b.recv().await.unwrap().unwrap(), b"hello");
        b.send(b"world").await.unwrap();
        assert_eq!(a.recv().await.unwrap().unwrap(), b"world");
    }
}

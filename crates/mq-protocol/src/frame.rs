//! The `TransferFrame` envelope and the incremental stream scanner.
//!
//! On-wire layout, in order:
//!
//! ```text
//! HEAD(1) | TYPE(1) | LEN(4, big-endian) | DATA(LEN) | CHECKSUM(2, big-endian) | TAIL(1)
//! ```
//!
//! CHECKSUM is CRC-16/CCITT-FALSE over TYPE | LEN | DATA.  The head and tail
//! bytes exist for self-synchronization: a reader that lands mid-stream (or
//! behind a corrupted frame) discards one byte at a time until a candidate
//! frame verifies.

use crate::descriptor::{MessageType, NOT_IMPLEMENT_MESSAGE};
use thiserror::Error;

/// First byte of every frame.
pub const FRAME_HEAD: u8 = 0x3C;
/// Last byte of every frame.
pub const FRAME_TAIL: u8 = 0x0D;
/// HEAD + TYPE + LEN.
const HEADER_LEN: usize = 6;
/// CHECKSUM + TAIL.
const TRAILER_LEN: usize = 3;
/// Envelope bytes added around `data` by [`TransferFrame::build`].
pub const FRAME_OVERHEAD: usize = HEADER_LEN + TRAILER_LEN;
/// Upper bound on the DATA section.  A LEN beyond this is a framing error,
/// not a large message.
pub const MAX_FRAME_DATA: usize = 1 << 20;

/// Errors raised while encoding or decoding wire bytes.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bad frame head byte {0:#04x}")]
    BadHead(u8),
    #[error("bad frame tail byte {0:#04x}")]
    BadTail(u8),
    #[error("frame checksum mismatch: got {got:#06x}, want {want:#06x}")]
    ChecksumMismatch { got: u16, want: u16 },
    #[error("frame data length {0} exceeds the {MAX_FRAME_DATA} byte limit")]
    DataTooLarge(usize),
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("message body truncated")]
    BodyTruncated,
    #[error("field {field} too long: {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("invalid {field} value {value}")]
    InvalidField { field: &'static str, value: u8 },
    #[error("message topic must not be empty")]
    EmptyTopic,
}

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF, no reflection), the
/// `CRC_16_IBM_3740` algorithm of the `crc` crate.
const CRC16: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_IBM_3740);

/// Frame checksum over the given chunks, in order.
pub fn crc16(chunks: &[&[u8]]) -> u16 {
    let mut digest = CRC16.digest();
    for chunk in chunks {
        digest.update(chunk);
    }
    digest.finalize()
}

/// The only unit exchanged on a broker TCP socket.
///
/// `data` holds one encoded message body (possibly encrypted); its meaning is
/// determined by `frame_type` through the descriptor table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFrame {
    pub frame_type: MessageType,
    pub data: Vec<u8>,
}

impl Default for TransferFrame {
    fn default() -> Self {
        TransferFrame {
            frame_type: NOT_IMPLEMENT_MESSAGE,
            data: Vec::new(),
        }
    }
}

impl TransferFrame {
    pub fn new(frame_type: MessageType) -> Self {
        TransferFrame {
            frame_type,
            data: Vec::new(),
        }
    }

    pub fn with_data(frame_type: MessageType, data: Vec<u8>) -> Self {
        TransferFrame { frame_type, data }
    }

    /// Encode the full envelope.
    pub fn build(&self) -> Result<Vec<u8>, CodecError> {
        if self.data.len() > MAX_FRAME_DATA {
            return Err(CodecError::DataTooLarge(self.data.len()));
        }
        let len = u32::try_from(self.data.len()).map_err(|_| {
            // Unreachable after the MAX_FRAME_DATA check; keep the error total.
            CodecError::DataTooLarge(self.data.len())
        })?;
        let mut out = Vec::with_capacity(self.data.len() + FRAME_OVERHEAD);
        out.push(FRAME_HEAD);
        out.push(self.frame_type);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.data);
        let crc = crc16(&[&out[1..]]);
        out.extend_from_slice(&crc.to_be_bytes());
        out.push(FRAME_TAIL);
        Ok(out)
    }

    /// Decode exactly one frame from `buf`.  `buf` must hold the complete
    /// envelope and nothing else.
    pub fn parse(buf: &[u8]) -> Result<TransferFrame, CodecError> {
        if buf.len() < FRAME_OVERHEAD {
            return Err(CodecError::Truncated {
                need: FRAME_OVERHEAD,
                have: buf.len(),
            });
        }
        if buf[0] != FRAME_HEAD {
            return Err(CodecError::BadHead(buf[0]));
        }
        let len = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
        if len > MAX_FRAME_DATA {
            return Err(CodecError::DataTooLarge(len));
        }
        let total = len + FRAME_OVERHEAD;
        if buf.len() < total {
            return Err(CodecError::Truncated {
                need: total,
                have: buf.len(),
            });
        }
        let want = crc16(&[&buf[1..HEADER_LEN + len]]);
        let got = u16::from_be_bytes([buf[HEADER_LEN + len], buf[HEADER_LEN + len + 1]]);
        if got != want {
            return Err(CodecError::ChecksumMismatch { got, want });
        }
        let tail = buf[total - 1];
        if tail != FRAME_TAIL {
            return Err(CodecError::BadTail(tail));
        }
        Ok(TransferFrame {
            frame_type: buf[1],
            data: buf[HEADER_LEN..HEADER_LEN + len].to_vec(),
        })
    }

    pub fn reset(&mut self) {
        self.frame_type = NOT_IMPLEMENT_MESSAGE;
        self.data.clear();
    }
}

/// Incremental frame decoder over a TCP byte stream.
///
/// Feed raw socket reads with [`feed`](FrameScanner::feed), then drain
/// complete frames with [`next_frame`](FrameScanner::next_frame).  A bad
/// candidate (wrong head, checksum, tail, or an absurd LEN) discards a single
/// byte and surfaces the error once, so the caller can fire its parse-error
/// callback; the following call rescans from the next byte.
#[derive(Debug, Default)]
pub struct FrameScanner {
    buf: Vec<u8>,
}

impl FrameScanner {
    pub fn new() -> Self {
        FrameScanner::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered and not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Extract the next complete frame, if any.
    ///
    /// Returns `Ok(None)` when more bytes are needed, `Err` when a candidate
    /// frame failed verification (one byte has been discarded; call again to
    /// resume scanning).
    pub fn next_frame(&mut self) -> Result<Option<TransferFrame>, CodecError> {
        // Drop garbage ahead of the next head byte.
        if let Some(pos) = self.buf.iter().position(|&b| b == FRAME_HEAD) {
            if pos > 0 {
                self.buf.drain(..pos);
            }
        } else {
            self.buf.clear();
            return Ok(None);
        }

        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len =
            u32::from_be_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]) as usize;
        if len > MAX_FRAME_DATA {
            self.buf.drain(..1);
            return Err(CodecError::DataTooLarge(len));
        }
        let total = len + FRAME_OVERHEAD;
        if self.buf.len() < total {
            return Ok(None);
        }
        match TransferFrame::parse(&self.buf[..total]) {
            Ok(frame) => {
                self.buf.drain(..total);
                Ok(Some(frame))
            }
            Err(err) => {
                self.buf.drain(..1);
                Err(err)
            }
        }
    }
}

//! Message bodies carried inside a [`TransferFrame`](crate::TransferFrame).
//!
//! All bodies use fixed-layout binary encoding.  Byte-string fields are
//! length-prefixed: topics, keys, and tokens with a `u8` length, producer
//! values with a `u16` big-endian length.  Integers are big-endian.

use crate::frame::CodecError;

/// Producer acknowledgement mode, sampled at register time.
///
/// `AllConfirm` is reserved for per-consumer acknowledgement and currently
/// behaves exactly like `RespConfirm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ack {
    #[default]
    NoConfirm = 0,
    RespConfirm = 1,
    AllConfirm = 2,
}

impl Ack {
    pub fn from_u8(value: u8) -> Result<Ack, CodecError> {
        match value {
            0 => Ok(Ack::NoConfirm),
            1 => Ok(Ack::RespConfirm),
            2 => Ok(Ack::AllConfirm),
            _ => Err(CodecError::InvalidField { field: "ack", value }),
        }
    }

    /// True when a produce frame from this link expects a reply.
    pub fn needs_confirm(self) -> bool {
        !matches!(self, Ack::NoConfirm)
    }
}

/// Which role a registering connection is claiming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Producer = 0,
    Consumer = 1,
}

impl LinkKind {
    pub fn from_u8(value: u8) -> Result<LinkKind, CodecError> {
        match value {
            0 => Ok(LinkKind::Producer),
            1 => Ok(LinkKind::Consumer),
            _ => Err(CodecError::InvalidField {
                field: "link kind",
                value,
            }),
        }
    }
}

/// Outcome carried in a [`MessageResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RespStatus {
    #[default]
    Accepted = 0,
    UnmarshalFailed = 1,
    TokenIncorrect = 2,
    ReRegister = 3,
    Refused = 4,
}

impl RespStatus {
    pub fn from_u8(value: u8) -> Result<RespStatus, CodecError> {
        match value {
            0 => Ok(RespStatus::Accepted),
            1 => Ok(RespStatus::UnmarshalFailed),
            2 => Ok(RespStatus::TokenIncorrect),
            3 => Ok(RespStatus::ReRegister),
            4 => Ok(RespStatus::Refused),
            _ => Err(CodecError::InvalidField {
                field: "status",
                value,
            }),
        }
    }

    /// Canonical text form, shared with the HTTP edge.
    pub fn text(self) -> &'static str {
        match self {
            RespStatus::Accepted => "Accepted",
            RespStatus::UnmarshalFailed => "UnmarshalFailed",
            RespStatus::TokenIncorrect => "TokenIncorrect",
            RespStatus::ReRegister => "Let-ReRegister",
            RespStatus::Refused => "Refused",
        }
    }
}

impl std::fmt::Display for RespStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.text())
    }
}

// ---------------------------------------------------------------------------
// Body cursor
// ---------------------------------------------------------------------------

/// Sequential reader over an encoded message body.
///
/// Public so that callers decoding concatenated producer messages can drive
/// the parse loop themselves (drawing each message from a pool).
#[derive(Debug)]
pub struct BodyCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        BodyCursor { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.buf.len() {
            return Err(CodecError::BodyTruncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn short_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    fn long_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}

fn put_short_bytes(out: &mut Vec<u8>, field: &'static str, bytes: &[u8]) -> Result<(), CodecError> {
    let len = u8::try_from(bytes.len()).map_err(|_| CodecError::FieldTooLong {
        field,
        len: bytes.len(),
        max: u8::MAX as usize,
    })?;
    out.push(len);
    out.extend_from_slice(bytes);
    Ok(())
}

fn put_long_bytes(out: &mut Vec<u8>, field: &'static str, bytes: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(bytes.len()).map_err(|_| CodecError::FieldTooLong {
        field,
        len: bytes.len(),
        max: u16::MAX as usize,
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

// ---------------------------------------------------------------------------
// PMessage
// ---------------------------------------------------------------------------

/// A producer message as it travels from producer to broker.
///
/// `value` may be ciphertext; the broker never interprets it.  Ownership
/// transfers to the topic on publish.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PMessage {
    pub topic: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl PMessage {
    /// Encode into `out`.  Layout: `topic(u8-len) | key(u8-len) | value(u16-len)`.
    pub fn build_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        if self.topic.is_empty() {
            return Err(CodecError::EmptyTopic);
        }
        put_short_bytes(out, "topic", &self.topic)?;
        put_short_bytes(out, "key", &self.key)?;
        put_long_bytes(out, "value", &self.value)
    }

    pub fn build(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(4 + self.topic.len() + self.key.len() + self.value.len());
        self.build_into(&mut out)?;
        Ok(out)
    }

    /// Decode one message from the cursor into `self` (pooled instances are
    /// reused this way).  A frame may carry several concatenated bodies;
    /// callers loop until [`BodyCursor::is_empty`].
    pub fn parse_into(&mut self, cur: &mut BodyCursor<'_>) -> Result<(), CodecError> {
        let topic = cur.short_bytes()?;
        if topic.is_empty() {
            return Err(CodecError::EmptyTopic);
        }
        let key = cur.short_bytes()?;
        let value = cur.long_bytes()?;
        self.topic.clear();
        self.topic.extend_from_slice(topic);
        self.key.clear();
        self.key.extend_from_slice(key);
        self.value.clear();
        self.value.extend_from_slice(value);
        Ok(())
    }

    /// Decode every concatenated message in `buf`.
    pub fn parse_stream(buf: &[u8]) -> Result<Vec<PMessage>, CodecError> {
        let mut cur = BodyCursor::new(buf);
        let mut out = Vec::new();
        while !cur.is_empty() {
            let mut pm = PMessage::default();
            pm.parse_into(&mut cur)?;
            out.push(pm);
        }
        Ok(out)
    }

    pub fn reset(&mut self) {
        self.topic.clear();
        self.key.clear();
        self.value.clear();
    }
}

// ---------------------------------------------------------------------------
// CMessage
// ---------------------------------------------------------------------------

/// A consumer message: a published [`PMessage`] stamped with its topic offset
/// and publication time (unix seconds).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CMessage {
    pub offset: u64,
    pub product_time: u64,
    pub pm: PMessage,
}

impl CMessage {
    pub fn build_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.product_time.to_be_bytes());
        self.pm.build_into(out)
    }

    pub fn build(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(16 + 4 + self.pm.topic.len() + self.pm.value.len());
        self.build_into(&mut out)?;
        Ok(out)
    }

    pub fn parse(buf: &[u8]) -> Result<CMessage, CodecError> {
        let mut cur = BodyCursor::new(buf);
        let offset = cur.u64()?;
        let product_time = cur.u64()?;
        let mut pm = PMessage::default();
        pm.parse_into(&mut cur)?;
        Ok(CMessage {
            offset,
            product_time,
            pm,
        })
    }

    pub fn reset(&mut self) {
        self.offset = 0;
        self.product_time = 0;
        self.pm.reset();
    }
}

// ---------------------------------------------------------------------------
// RegisterMessage
// ---------------------------------------------------------------------------

/// First message a client sends on a fresh connection.
///
/// `topics` is required for consumers and ignored for producers.  The body
/// is encrypted with the token-derived cipher when the broker has a token
/// configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMessage {
    pub kind: LinkKind,
    pub ack: Ack,
    pub topics: Vec<String>,
    pub token: String,
}

impl RegisterMessage {
    pub fn build(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(8 + self.token.len());
        out.push(self.kind as u8);
        out.push(self.ack as u8);
        let count = u8::try_from(self.topics.len()).map_err(|_| CodecError::FieldTooLong {
            field: "topics",
            len: self.topics.len(),
            max: u8::MAX as usize,
        })?;
        out.push(count);
        for topic in &self.topics {
            put_short_bytes(&mut out, "topic", topic.as_bytes())?;
        }
        put_short_bytes(&mut out, "token", self.token.as_bytes())?;
        Ok(out)
    }

    pub fn parse(buf: &[u8]) -> Result<RegisterMessage, CodecError> {
        let mut cur = BodyCursor::new(buf);
        let kind = LinkKind::from_u8(cur.u8()?)?;
        let ack = Ack::from_u8(cur.u8()?)?;
        let count = cur.u8()? as usize;
        let mut topics = Vec::with_capacity(count);
        for _ in 0..count {
            let raw = cur.short_bytes()?;
            topics.push(String::from_utf8_lossy(raw).into_owned());
        }
        let token = String::from_utf8_lossy(cur.short_bytes()?).into_owned();
        Ok(RegisterMessage {
            kind,
            ack,
            topics,
            token,
        })
    }
}

// ---------------------------------------------------------------------------
// MessageResponse
// ---------------------------------------------------------------------------

/// Broker reply to register and produce frames.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageResponse {
    pub result: bool,
    pub status: RespStatus,
    /// Last offset assigned by the produce this response acknowledges.
    pub offset: u64,
    /// Unix seconds at which the broker accepted the request.
    pub receive_time: u64,
    /// Producer send cadence hint, milliseconds.
    pub ticker_interval_ms: u32,
}

impl MessageResponse {
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(23);
        out.push(u8::from(self.result));
        out.push(self.status as u8);
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.receive_time.to_be_bytes());
        out.extend_from_slice(&self.ticker_interval_ms.to_be_bytes());
        out
    }

    pub fn parse(buf: &[u8]) -> Result<MessageResponse, CodecError> {
        let mut cur = BodyCursor::new(buf);
        let result = cur.u8()? != 0;
        let status = RespStatus::from_u8(cur.u8()?)?;
        let offset = cur.u64()?;
        let receive_time = cur.u64()?;
        let ticker_interval_ms = cur.u32()?;
        Ok(MessageResponse {
            result,
            status,
            offset,
            receive_time,
            ticker_interval_ms,
        })
    }
}

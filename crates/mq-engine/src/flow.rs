//! Handler chains: the per-message-type flows and their shared arg bundle.
//!
//! A flow is an ordered list of small stages.  Each stage mutates the shared
//! [`ChainArgs`] and returns `true` to short-circuit the chain.  Stages never
//! write to the client directly — a reply is requested by staging a
//! [`MessageResponse`] (or rewriting the frame in place and setting
//! `reply_raw`), and the engine encodes and sends it after the chain ends.

use std::time::Instant;

use mq_protocol::{
    Ack, BodyCursor, Crypto, LinkKind, MESSAGE_RESP, MessageResponse, PMessage,
    RE_REGISTER_MESSAGE, REGISTER_MESSAGE_RESP, RegisterMessage, RespStatus, TransferFrame,
};

use crate::engine::{Engine, EngineError};
use crate::slots::{ConsumerConfig, ProducerConfig};
use crate::transport::ConnHandle;
use crate::unix_now;

/// One stage of a flow.  Returning `true` stops the chain.
pub(crate) type FlowHandler = fn(&Engine, &mut ChainArgs) -> bool;

/// Shared state threaded through a flow.  Pooled and reset between frames.
#[derive(Debug, Default)]
pub struct ChainArgs {
    /// The inbound frame; doubles as the reply frame when a stage rewrites it.
    pub frame: TransferFrame,
    pub conn: Option<ConnHandle>,
    /// Parsed register payload (register flow only).
    pub register: Option<RegisterMessage>,
    /// Parsed producer messages (produce flow only).
    pub pms: Vec<PMessage>,
    /// Ack mode of the producer slot that sent the frame.
    pub producer_ack: Option<Ack>,
    /// Staged reply body; encoded into the frame after the chain ends.
    pub resp: Option<MessageResponse>,
    /// The frame already holds the complete reply (no body to encode).
    pub reply_raw: bool,
    /// Why the chain stopped.  [`EngineError::NoReply`] is the silent
    /// sentinel: no reply, nothing logged.
    pub err: Option<EngineError>,
}

impl ChainArgs {
    /// False only when the chain stopped with the silent sentinel.
    pub fn reply_client(&self) -> bool {
        !matches!(self.err, Some(EngineError::NoReply))
    }

    fn addr(&self) -> &str {
        self.conn.as_ref().map_or("", ConnHandle::addr)
    }

    pub(crate) fn reset(&mut self) {
        self.frame.reset();
        self.conn = None;
        self.register = None;
        self.pms.clear();
        self.producer_ack = None;
        self.resp = None;
        self.reply_raw = false;
        self.err = None;
    }
}

impl mq_protocol::Poolable for ChainArgs {
    fn reset(&mut self) {
        ChainArgs::reset(self);
    }
}

fn stage_response(status: RespStatus) -> MessageResponse {
    MessageResponse {
        result: status == RespStatus::Accepted,
        status,
        offset: 0,
        receive_time: unix_now(),
        ticker_interval_ms: 0,
    }
}

// ---------------------------------------------------------------------------
// Register flow
// ---------------------------------------------------------------------------

impl Engine {
    /// Register stage 1: decrypt (when a token is configured) and decode.
    pub(crate) fn register_parser(&self, args: &mut ChainArgs) -> bool {
        let parsed = match self.token_crypto() {
            Some(crypto) => match crypto.decrypt(&args.frame.data) {
                Ok(plain) => RegisterMessage::parse(&plain),
                // A client without the right token cannot produce valid
                // ciphertext; fall back to a plaintext parse so the auth
                // stage can still answer it.
                Err(_) => RegisterMessage::parse(&args.frame.data),
            },
            None => RegisterMessage::parse(&args.frame.data),
        };
        match parsed {
            Ok(rm) => {
                if rm.kind == LinkKind::Consumer && rm.topics.is_empty() {
                    args.err = Some(EngineError::RegisterParse(
                        "consumer registration lists no topics".to_owned(),
                    ));
                    return true;
                }
                args.register = Some(rm);
                false
            }
            Err(err) => {
                args.err = Some(EngineError::RegisterParse(err.to_string()));
                true
            }
        }
    }

    /// Register stage 2: shared-token check.
    pub(crate) fn register_auth(&self, args: &mut ChainArgs) -> bool {
        let Some(rm) = args.register.as_ref() else {
            args.err = Some(EngineError::NoReply);
            return true;
        };
        if self.is_token_correct(&rm.token) {
            return false;
        }
        args.frame.frame_type = REGISTER_MESSAGE_RESP;
        args.resp = Some(stage_response(RespStatus::TokenIncorrect));
        true
    }

    /// Register stage 3: claim a slot; consumers also attach to their topics.
    pub(crate) fn register_allow(&self, args: &mut ChainArgs) -> bool {
        let Some(conn) = args.conn.clone() else {
            args.err = Some(EngineError::NoReply);
            return true;
        };
        let Some(rm) = args.register.as_ref() else {
            args.err = Some(EngineError::NoReply);
            return true;
        };
        let addr = conn.addr().to_owned();
        let mut stale_topics = Vec::new();
        let bound = {
            let mut tables = self.slots_write();
            match rm.kind {
                LinkKind::Producer => tables
                    .bind_producer(
                        &addr,
                        ProducerConfig {
                            ack: rm.ack,
                            ticker_interval: self.config().producer_send_interval,
                        },
                        conn.clone(),
                    )
                    .is_some(),
                LinkKind::Consumer => match tables.bind_consumer(
                    &addr,
                    ConsumerConfig {
                        topics: rm.topics.clone(),
                        ack: rm.ack,
                    },
                    conn.clone(),
                ) {
                    Some(previous) => {
                        stale_topics = previous;
                        true
                    }
                    None => false,
                },
            }
        };
        if !bound {
            args.frame.frame_type = REGISTER_MESSAGE_RESP;
            args.resp = Some(stage_response(RespStatus::Refused));
            return true;
        }
        if rm.kind == LinkKind::Consumer {
            // A re-register replaces the subscription set outright.
            for topic in &stale_topics {
                if !rm.topics.contains(topic) {
                    self.get_topic(topic.as_bytes()).remove_consumer(&addr);
                }
            }
            for topic in &rm.topics {
                self.get_topic(topic.as_bytes())
                    .add_consumer(&addr, conn.clone());
            }
        }
        self.mark_registered(&addr);
        false
    }

    /// Register stage 4: fire the host callback and stage the accept reply.
    pub(crate) fn register_callback(&self, args: &mut ChainArgs) -> bool {
        let Some(rm) = args.register.as_ref() else {
            args.err = Some(EngineError::NoReply);
            return true;
        };
        let addr = args.addr().to_owned();
        let handler = self.event_handler();
        let kind = rm.kind;
        tokio::spawn(async move {
            match kind {
                LinkKind::Producer => handler.on_producer_register(&addr),
                LinkKind::Consumer => handler.on_consumer_register(&addr),
            }
        });

        args.frame.frame_type = REGISTER_MESSAGE_RESP;
        let interval = self.config().producer_send_interval.as_millis();
        args.resp = Some(MessageResponse {
            ticker_interval_ms: u32::try_from(interval).unwrap_or(u32::MAX),
            ..stage_response(RespStatus::Accepted)
        });
        false
    }
}

// ---------------------------------------------------------------------------
// Produce flow
// ---------------------------------------------------------------------------

impl Engine {
    /// Produce stage 1: only registered producers may publish.
    pub(crate) fn producer_not_found(&self, args: &mut ChainArgs) -> bool {
        let ack = self
            .slots_read()
            .query_producer(args.addr())
            .map(|slot| slot.conf.ack);
        match ack {
            Some(ack) => {
                args.producer_ack = Some(ack);
                false
            }
            None => {
                args.frame.frame_type = RE_REGISTER_MESSAGE;
                args.frame.data.clear();
                args.reply_raw = true;
                true
            }
        }
    }

    /// Produce stage 2: decode the concatenated producer messages.
    pub(crate) fn pm_parser(&self, args: &mut ChainArgs) -> bool {
        let ChainArgs {
            frame, pms, err, ..
        } = &mut *args;
        let mut cur = BodyCursor::new(&frame.data);
        while !cur.is_empty() {
            let mut pm = self.pm_pool().get();
            match pm.parse_into(&mut cur) {
                Ok(()) => pms.push(pm),
                Err(parse_err) => {
                    self.pm_pool().put(pm);
                    for pm in pms.drain(..) {
                        self.pm_pool().put(pm);
                    }
                    *err = Some(EngineError::ProduceParse(parse_err.to_string()));
                    return true;
                }
            }
        }
        if pms.is_empty() {
            *err = Some(EngineError::PmNotFound);
            return true;
        }
        false
    }

    /// Produce stage 3: publish every message; reply per the producer's ack.
    pub(crate) fn pm_publisher(&self, args: &mut ChainArgs) -> bool {
        let mut last_offset = 0;
        for pm in args.pms.drain(..) {
            last_offset = self.publisher(pm);
        }
        let ack = args.producer_ack.unwrap_or(Ack::NoConfirm);
        if !ack.needs_confirm() {
            args.err = Some(EngineError::NoReply);
            return true;
        }
        args.frame.frame_type = MESSAGE_RESP;
        args.resp = Some(MessageResponse {
            offset: last_offset,
            ..stage_response(RespStatus::Accepted)
        });
        false
    }
}

// ---------------------------------------------------------------------------
// Heartbeat flow
// ---------------------------------------------------------------------------

impl Engine {
    /// Refresh the heartbeat on whichever slot owns the sender.  Never
    /// replies; an unregistered sender is simply ignored (the monitor will
    /// evict it).
    pub(crate) fn receive_heartbeat(&self, args: &mut ChainArgs) -> bool {
        self.slots_write().touch(args.addr(), Instant::now());
        false
    }
}

//! The broker engine: dispatch surface, slot tables, topic map, monitor glue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use mq_protocol::{
    CmPool, Crypto, FramePool, HEARTBEAT_MESSAGE, MessageType, NoCrypto, PMESSAGE, PMessage,
    PmPool, Pool, REGISTER_MESSAGE, TOTAL_MESSAGE_TYPES, TokenCrypto, TransferFrame, descriptor,
    is_user_space,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::flow::{ChainArgs, FlowHandler};
use crate::monitor::monitor_loop;
use crate::slots::{ConsumerSlot, ProducerSlot, SlotTables};
use crate::topic::Topic;
use crate::transport::{CloseRequester, ConnHandle, DefaultEventHandler, EventHandler};

/// Pool sizes for the frame/message/args hot path.
const POOL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Silent stop sentinel for chain stages; never surfaced or logged.
    #[error("no reply needed")]
    NoReply,
    #[error("register payload rejected: {0}")]
    RegisterParse(String),
    #[error("producer payload rejected: {0}")]
    ProduceParse(String),
    #[error("frame carries no producer message")]
    PmNotFound,
    #[error("message type {0} is reserved for the built-in protocol")]
    BuiltinImmutable(MessageType),
    #[error(transparent)]
    Codec(#[from] mq_protocol::CodecError),
}

/// Host-installed handler for a user-defined message type.
///
/// Returning `Ok(true)` writes the (rewritten) frame back to the sender.
pub type UserHandler =
    Arc<dyn Fn(&mut TransferFrame, &ConnHandle) -> Result<bool, EngineError> + Send + Sync>;

struct UserHook {
    label: String,
    handler: UserHandler,
}

pub struct Engine {
    conf: Config,
    slots: RwLock<SlotTables>,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    /// Flow chains for the built-in protocol, indexed by message type.
    flows: Vec<Vec<FlowHandler>>,
    /// Host handlers for user-defined types, indexed by message type.
    hooks: Vec<Option<UserHook>>,
    args_pool: Pool<ChainArgs>,
    pm_pool: PmPool,
    cm_pool: Arc<CmPool>,
    frame_pool: Arc<FramePool>,
    token_crypto: Option<TokenCrypto>,
    crypto: Arc<dyn Crypto>,
    event_handler: Arc<dyn EventHandler>,
    /// Connected addresses that have not registered yet.
    pending: Mutex<HashMap<String, Instant>>,
    close_tx: Mutex<Option<CloseRequester>>,
}

impl Engine {
    pub fn new(conf: Config) -> Engine {
        let conf = conf.clean();
        let token_crypto = if conf.token.is_empty() {
            None
        } else {
            Some(TokenCrypto::new(&conf.token))
        };
        let mut engine = Engine {
            slots: RwLock::new(SlotTables::new(conf.max_open_conn)),
            topics: RwLock::new(HashMap::new()),
            flows: (0..TOTAL_MESSAGE_TYPES).map(|_| Vec::new()).collect(),
            hooks: (0..TOTAL_MESSAGE_TYPES).map(|_| None).collect(),
            args_pool: Pool::new(POOL_CAPACITY),
            pm_pool: Pool::new(POOL_CAPACITY),
            cm_pool: Arc::new(Pool::new(POOL_CAPACITY)),
            frame_pool: Arc::new(Pool::new(POOL_CAPACITY)),
            token_crypto,
            crypto: Arc::new(NoCrypto),
            event_handler: Arc::new(DefaultEventHandler),
            pending: Mutex::new(HashMap::new()),
            close_tx: Mutex::new(None),
            conf,
        };
        engine.bind_builtin_flows();
        engine
    }

    /// Install the host event handler.  Builder-style, before sharing.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// Install the payload crypto capability used by the HTTP edge.
    pub fn with_crypto(mut self, crypto: Arc<dyn Crypto>) -> Self {
        self.crypto = crypto;
        self
    }

    fn bind_builtin_flows(&mut self) {
        self.flows[REGISTER_MESSAGE as usize] = vec![
            Engine::register_parser,
            Engine::register_auth,
            Engine::register_allow,
            Engine::register_callback,
        ];
        self.flows[PMESSAGE as usize] = vec![
            Engine::producer_not_found,
            Engine::pm_parser,
            Engine::pm_publisher,
        ];
        self.flows[HEARTBEAT_MESSAGE as usize] = vec![Engine::receive_heartbeat];
    }

    /// Bind a handler for a user-defined message type (codes ≥ 128).
    pub fn bind_message_handler(
        &mut self,
        code: MessageType,
        label: impl Into<String>,
        handler: UserHandler,
    ) -> Result<(), EngineError> {
        if !is_user_space(code) {
            return Err(EngineError::BuiltinImmutable(code));
        }
        self.hooks[code as usize] = Some(UserHook {
            label: label.into(),
            handler,
        });
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.conf
    }

    pub fn crypto(&self) -> Arc<dyn Crypto> {
        self.crypto.clone()
    }

    pub(crate) fn token_crypto(&self) -> Option<&TokenCrypto> {
        self.token_crypto.as_ref()
    }

    pub(crate) fn event_handler(&self) -> Arc<dyn EventHandler> {
        self.event_handler.clone()
    }

    pub(crate) fn pm_pool(&self) -> &PmPool {
        &self.pm_pool
    }

    pub(crate) fn slots_read(&self) -> RwLockReadGuard<'_, SlotTables> {
        self.slots.read().unwrap()
    }

    pub(crate) fn slots_write(&self) -> RwLockWriteGuard<'_, SlotTables> {
        self.slots.write().unwrap()
    }

    /// Constant-shape token check: digests are compared, not raw strings.
    pub fn is_token_correct(&self, token: &str) -> bool {
        if self.conf.token.is_empty() {
            return true;
        }
        Sha256::digest(token.as_bytes()) == Sha256::digest(self.conf.token.as_bytes())
    }

    /// Hand the transport a channel for close-by-address requests.
    pub fn set_close_requester(&self, tx: CloseRequester) {
        *self.close_tx.lock().unwrap() = Some(tx);
    }

    /// Ask the transport to close `addr`.  Slot release happens when the
    /// transport's `on_closed` callback fires.
    pub fn close_connection(&self, addr: &str) {
        if let Some(tx) = self.close_tx.lock().unwrap().as_ref() {
            let _ = tx.send(addr.to_owned());
        }
    }

    // -----------------------------------------------------------------------
    // Topics
    // -----------------------------------------------------------------------

    /// Fetch or lazily create a topic.  Creation is idempotent: racing
    /// callers observe the same instance and exactly one fan-out task.
    pub fn get_topic(&self, name: &[u8]) -> Arc<Topic> {
        let key = String::from_utf8_lossy(name).into_owned();
        if let Some(topic) = self.topics.read().unwrap().get(&key) {
            return topic.clone();
        }
        let mut topics = self.topics.write().unwrap();
        topics
            .entry(key)
            .or_insert_with(|| {
                Topic::new(
                    name.to_vec(),
                    self.conf.buffer_size,
                    self.frame_pool.clone(),
                    self.cm_pool.clone(),
                    self.event_handler.clone(),
                )
            })
            .clone()
    }

    /// Last assigned offset for `name`; 0 when the topic has never seen a
    /// publish (or does not exist).
    pub fn get_topic_offset(&self, name: &str) -> u64 {
        self.topics
            .read()
            .unwrap()
            .get(name)
            .map_or(0, |topic| topic.offset())
    }

    /// Visit every topic until the closure returns `false`.
    pub fn range_topic(&self, mut f: impl FnMut(&Arc<Topic>) -> bool) {
        for topic in self.topics.read().unwrap().values() {
            if !f(topic) {
                break;
            }
        }
    }

    /// Synchronous publish path shared by the TCP produce flow and the HTTP
    /// edge.  Returns the assigned offset.
    pub fn publisher(&self, pm: PMessage) -> u64 {
        let topic = self.get_topic(&pm.topic);
        topic.publish(pm)
    }

    // -----------------------------------------------------------------------
    // Slot queries
    // -----------------------------------------------------------------------

    pub fn query_producer(&self, addr: &str) -> Option<ProducerSlot> {
        self.slots_read().query_producer(addr).cloned()
    }

    pub fn query_consumer(&self, addr: &str) -> Option<ConsumerSlot> {
        self.slots_read().query_consumer(addr).cloned()
    }

    /// Visit every bound producer slot until the closure returns `false`.
    pub fn range_producer(&self, mut f: impl FnMut(&ProducerSlot) -> bool) {
        for slot in self.slots_read().producers() {
            if !slot.is_free() && !f(slot) {
                break;
            }
        }
    }

    /// Visit every bound consumer slot until the closure returns `false`.
    pub fn range_consumer(&self, mut f: impl FnMut(&ConsumerSlot) -> bool) {
        for slot in self.slots_read().consumers() {
            if !slot.is_free() && !f(slot) {
                break;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transport callbacks
    // -----------------------------------------------------------------------

    /// A connection was accepted.  Nothing is bound yet; the address only
    /// enters a slot on successful register.
    pub fn on_connected(&self, addr: &str) {
        debug!(addr = %addr, "client connected");
        self.pending
            .lock()
            .unwrap()
            .insert(addr.to_owned(), Instant::now());
    }

    pub(crate) fn mark_registered(&self, addr: &str) {
        self.pending.lock().unwrap().remove(addr);
    }

    /// A connection went away: free its slots and detach its subscriptions.
    pub fn on_closed(&self, addr: &str) {
        self.pending.lock().unwrap().remove(addr);
        let (was_producer, consumer_topics) = {
            let mut tables = self.slots_write();
            (tables.remove_producer(addr), tables.remove_consumer(addr))
        };
        if was_producer {
            debug!(addr = %addr, "producer closed");
            self.event_handler.on_producer_closed(addr);
        }
        if let Some(topic_names) = consumer_topics {
            let topics = self.topics.read().unwrap();
            for name in &topic_names {
                if let Some(topic) = topics.get(name) {
                    topic.remove_consumer(addr);
                }
            }
            drop(topics);
            debug!(addr = %addr, "consumer closed");
            self.event_handler.on_consumer_closed(addr);
        }
    }

    /// Report a framing error on `conn`'s stream.
    pub fn on_frame_parse_error(&self, raw: &[u8], err: &mq_protocol::CodecError) {
        warn!(bytes = raw.len(), %err, "frame parse error");
        self.event_handler.on_frame_parse_error(raw, err);
    }

    /// Per-frame dispatch: the callback the transport invokes for every
    /// complete frame.  Frames on one connection arrive here serially.
    pub async fn on_received(&self, mut frame: TransferFrame, conn: ConnHandle) {
        let frame_type = frame.frame_type;
        let result = if self.flows[frame_type as usize].is_empty() {
            match &self.hooks[frame_type as usize] {
                Some(hook) => {
                    debug!(label = %hook.label, addr = conn.addr(), "user hook");
                    (hook.handler)(&mut frame, &conn)
                }
                None => self.event_handler.on_not_implemented(&mut frame, &conn),
            }
        } else {
            self.run_flow(&mut frame, &conn)
        };

        let need_resp = match result {
            Ok(need_resp) => need_resp,
            Err(err) => {
                warn!(
                    message = descriptor(frame_type).label,
                    addr = conn.addr(),
                    %err,
                    "message handling failed"
                );
                return;
            }
        };
        if !need_resp {
            return;
        }
        match frame.build() {
            Ok(bytes) => {
                if let Err(err) = conn.send(bytes) {
                    // The transport notices dead peers on its own; a failed
                    // send never closes the connection.
                    warn!(addr = conn.addr(), frame_type = frame.frame_type, %err, "reply send failed");
                }
            }
            Err(err) => {
                warn!(frame_type = frame.frame_type, %err, "reply frame build failed");
            }
        }
    }

    fn run_flow(
        &self,
        frame: &mut TransferFrame,
        conn: &ConnHandle,
    ) -> Result<bool, EngineError> {
        let mut args = self.args_pool.get();
        std::mem::swap(&mut args.frame, frame);
        args.conn = Some(conn.clone());

        let frame_type = args.frame.frame_type as usize;
        for stage in &self.flows[frame_type] {
            if stage(self, &mut args) {
                break;
            }
        }
        let result = Engine::finish_flow(&mut args);

        std::mem::swap(&mut args.frame, frame);
        self.args_pool.put(args);
        result
    }

    fn finish_flow(args: &mut ChainArgs) -> Result<bool, EngineError> {
        if !args.reply_client() {
            return Ok(false);
        }
        if let Some(resp) = args.resp.take() {
            args.frame.data = resp.build();
            return Ok(true);
        }
        if args.reply_raw {
            return Ok(true);
        }
        match args.err.take() {
            Some(err) => Err(err),
            None => Ok(false),
        }
    }

    // -----------------------------------------------------------------------
    // Monitor
    // -----------------------------------------------------------------------

    /// Start the liveness monitor.  It stops when `shutdown` flips to true.
    pub fn start_monitor(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        info!(
            register_timeout_s = self.conf.register_timeout.as_secs(),
            heartbeat_timeout_s = self.conf.heartbeat_timeout.as_secs(),
            "monitor started"
        );
        tokio::spawn(monitor_loop(self.clone(), shutdown))
    }

    /// Close connections that connected but never registered in time.
    pub(crate) fn sweep_unregistered(&self, now: Instant) {
        let stale: Vec<String> = {
            let pending = self.pending.lock().unwrap();
            pending
                .iter()
                .filter(|(_, connected_at)| {
                    now.duration_since(**connected_at) > self.conf.register_timeout
                })
                .map(|(addr, _)| addr.clone())
                .collect()
        };
        for addr in stale {
            info!(addr = %addr, "evicting unregistered connection");
            self.close_connection(&addr);
        }
    }

    /// Close slots whose heartbeat went silent for too long.
    pub(crate) fn sweep_heartbeats(&self, now: Instant) {
        let expired = self
            .slots_read()
            .heartbeat_expired(self.conf.heartbeat_timeout, now);
        for addr in expired {
            info!(addr = %addr, "evicting connection after heartbeat timeout");
            self.close_connection(&addr);
        }
    }
}

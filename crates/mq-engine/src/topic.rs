//! A topic: named ordered log with bounded retained history and fan-out.
//!
//! Publishing assigns a dense offset (1, 2, …) from an atomic counter, stamps
//! a consumer message, appends it to the history ring, and signals the
//! topic's fan-out task.  The ring is both the dispatch queue and the
//! retained history: a dispatch cursor tracks what has already been handed to
//! consumers, while entries stay in the ring until capacity evicts them.
//!
//! The fan-out task encodes each message once and enqueues the bytes on every
//! registered consumer's connection.  A consumer that cannot keep up loses
//! frames (logged) but never slows the publisher or its peers; removal only
//! happens through connection close or heartbeat eviction.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use mq_protocol::{CMESSAGE, CMessage, CmPool, FramePool, PMessage};
use tokio::sync::Notify;
use tracing::warn;

use crate::transport::{ConnHandle, EventHandler};
use crate::unix_now;

#[derive(Debug, Default)]
struct Ring {
    entries: VecDeque<Arc<CMessage>>,
    /// Offset of the newest message already handed to consumers.
    dispatched: u64,
}

pub struct Topic {
    name: Vec<u8>,
    buffer_size: usize,
    counter: AtomicU64,
    consumers: RwLock<HashMap<String, ConnHandle>>,
    ring: Mutex<Ring>,
    publish_event: Notify,
    frame_pool: Arc<FramePool>,
    cm_pool: Arc<CmPool>,
    event_handler: Arc<dyn EventHandler>,
}

impl Topic {
    /// Create the topic and start its fan-out task.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn new(
        name: Vec<u8>,
        buffer_size: usize,
        frame_pool: Arc<FramePool>,
        cm_pool: Arc<CmPool>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Arc<Topic> {
        let topic = Arc::new(Topic {
            name,
            buffer_size,
            counter: AtomicU64::new(0),
            consumers: RwLock::new(HashMap::new()),
            ring: Mutex::new(Ring::default()),
            publish_event: Notify::new(),
            frame_pool,
            cm_pool,
            event_handler,
        });
        tokio::spawn(Topic::fan_out(topic.clone()));
        topic
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Last assigned offset; 0 before the first publish.
    pub fn offset(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Publish one producer message, taking ownership of it.
    ///
    /// Never blocks on consumers; callable concurrently from any number of
    /// tasks.  Racing publishes are linearized by the ring lock and their
    /// offsets reflect that order.
    pub fn publish(&self, pm: PMessage) -> u64 {
        let mut cm = self.cm_pool.get();
        cm.product_time = unix_now();
        cm.pm = pm;
        let offset;
        {
            let mut ring = self.ring.lock().unwrap();
            // Assigning the offset under the ring lock keeps ring order and
            // offset order identical.
            offset = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            cm.offset = offset;
            ring.entries.push_back(Arc::new(cm));
            if ring.entries.len() > self.buffer_size {
                if let Some(evicted) = ring.entries.pop_front() {
                    // Offsets were assigned before insertion; eviction only
                    // shrinks retained history, never the sequence.
                    if evicted.offset > ring.dispatched {
                        ring.dispatched = evicted.offset;
                    }
                    if let Ok(cm) = Arc::try_unwrap(evicted) {
                        self.cm_pool.put(cm);
                    }
                }
            }
        }
        self.publish_event.notify_one();
        offset
    }

    /// Attach a consumer.  It starts receiving from the next undispatched
    /// message; the ring is never replayed to a late subscriber.
    pub fn add_consumer(&self, addr: &str, conn: ConnHandle) {
        self.consumers
            .write()
            .unwrap()
            .insert(addr.to_owned(), conn);
    }

    pub fn remove_consumer(&self, addr: &str) {
        self.consumers.write().unwrap().remove(addr);
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().unwrap().len()
    }

    /// Number of messages currently retained.
    pub fn history_len(&self) -> usize {
        self.ring.lock().unwrap().entries.len()
    }

    /// Offsets currently retained, oldest first.
    pub fn history_offsets(&self) -> Vec<u64> {
        self.ring
            .lock()
            .unwrap()
            .entries
            .iter()
            .map(|cm| cm.offset)
            .collect()
    }

    fn take_batch(&self) -> Vec<Arc<CMessage>> {
        let mut ring = self.ring.lock().unwrap();
        let cursor = ring.dispatched;
        let batch: Vec<_> = ring
            .entries
            .iter()
            .filter(|cm| cm.offset > cursor)
            .cloned()
            .collect();
        if let Some(last) = batch.last() {
            ring.dispatched = last.offset;
        }
        batch
    }

    async fn fan_out(topic: Arc<Topic>) {
        loop {
            topic.publish_event.notified().await;
            loop {
                let batch = topic.take_batch();
                if batch.is_empty() {
                    break;
                }
                let consumers: Vec<(String, ConnHandle)> = topic
                    .consumers
                    .read()
                    .unwrap()
                    .iter()
                    .map(|(addr, conn)| (addr.clone(), conn.clone()))
                    .collect();
                let mut offsets = Vec::with_capacity(batch.len());
                for cm in &batch {
                    offsets.push(cm.offset);
                    if consumers.is_empty() {
                        continue;
                    }
                    let mut frame = topic.frame_pool.get();
                    frame.frame_type = CMESSAGE;
                    let built = cm
                        .build_into(&mut frame.data)
                        .and_then(|()| frame.build());
                    let bytes = match built {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            warn!(
                                topic = %String::from_utf8_lossy(&topic.name),
                                offset = cm.offset,
                                %err,
                                "encoding consumer frame failed"
                            );
                            topic.frame_pool.put(frame);
                            continue;
                        }
                    };
                    topic.frame_pool.put(frame);
                    for (addr, conn) in &consumers {
                        if let Err(err) = conn.send(bytes.clone()) {
                            warn!(
                                topic = %String::from_utf8_lossy(&topic.name),
                                addr = %addr,
                                offset = cm.offset,
                                %err,
                                "fan-out write failed"
                            );
                        }
                    }
                }
                topic.event_handler.on_cm_consumed(&topic.name, &offsets);
            }
        }
    }
}

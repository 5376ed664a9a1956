//! Fixed-size producer and consumer slot tables.
//!
//! Both tables are allocated once at engine construction with
//! `max_open_conn` entries each.  A slot is free iff its `addr` is empty;
//! capacity checks are linear scans (the table never exceeds 100 entries).
//! The engine serializes every bind and release through one table-level
//! write lock, so the methods here take plain `&mut self`.

use std::time::{Duration, Instant};

use mq_protocol::Ack;

use crate::transport::ConnHandle;

/// Producer-side register options, sampled per produce frame.
#[derive(Debug, Clone, Copy)]
pub struct ProducerConfig {
    pub ack: Ack,
    pub ticker_interval: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        ProducerConfig {
            ack: Ack::NoConfirm,
            ticker_interval: Duration::from_millis(500),
        }
    }
}

/// Consumer-side register options.
#[derive(Debug, Clone, Default)]
pub struct ConsumerConfig {
    pub topics: Vec<String>,
    pub ack: Ack,
}

#[derive(Debug, Clone)]
pub struct ProducerSlot {
    pub index: usize,
    /// Empty means the slot is free.
    pub addr: String,
    pub conf: ProducerConfig,
    pub conn: Option<ConnHandle>,
    pub last_heartbeat: Instant,
}

impl ProducerSlot {
    fn free(index: usize) -> Self {
        ProducerSlot {
            index,
            addr: String::new(),
            conf: ProducerConfig::default(),
            conn: None,
            last_heartbeat: Instant::now(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.addr.is_empty()
    }

    fn release(&mut self) {
        self.addr.clear();
        self.conf = ProducerConfig::default();
        self.conn = None;
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerSlot {
    pub index: usize,
    /// Empty means the slot is free.
    pub addr: String,
    pub conf: ConsumerConfig,
    pub conn: Option<ConnHandle>,
    pub last_heartbeat: Instant,
}

impl ConsumerSlot {
    fn free(index: usize) -> Self {
        ConsumerSlot {
            index,
            addr: String::new(),
            conf: ConsumerConfig::default(),
            conn: None,
            last_heartbeat: Instant::now(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.addr.is_empty()
    }

    fn release(&mut self) -> Vec<String> {
        self.addr.clear();
        self.conn = None;
        self.conf.ack = Ack::NoConfirm;
        std::mem::take(&mut self.conf.topics)
    }
}

/// Both role tables behind the engine's single add/remove lock.
#[derive(Debug)]
pub struct SlotTables {
    producers: Vec<ProducerSlot>,
    consumers: Vec<ConsumerSlot>,
}

impl SlotTables {
    pub fn new(max_open_conn: usize) -> Self {
        SlotTables {
            producers: (0..max_open_conn).map(ProducerSlot::free).collect(),
            consumers: (0..max_open_conn).map(ConsumerSlot::free).collect(),
        }
    }

    /// Bind `addr` into the producer table.  An address that is already
    /// bound refreshes its slot in place, so address → slot stays injective.
    /// Returns `None` when the table is full.
    pub fn bind_producer(
        &mut self,
        addr: &str,
        conf: ProducerConfig,
        conn: ConnHandle,
    ) -> Option<usize> {
        let slot = match self.producers.iter_mut().find(|s| s.addr == addr) {
            Some(slot) => slot,
            None => self.producers.iter_mut().find(|s| s.is_free())?,
        };
        slot.addr = addr.to_owned();
        slot.conf = conf;
        slot.conn = Some(conn);
        slot.last_heartbeat = Instant::now();
        Some(slot.index)
    }

    /// Consumer-table counterpart of [`bind_producer`](Self::bind_producer).
    /// Returns the topics the slot was previously attached to (empty for a
    /// fresh slot) so the caller can detach stale subscriptions.
    pub fn bind_consumer(
        &mut self,
        addr: &str,
        conf: ConsumerConfig,
        conn: ConnHandle,
    ) -> Option<Vec<String>> {
        let slot = match self.consumers.iter_mut().find(|s| s.addr == addr) {
            Some(slot) => slot,
            None => self.consumers.iter_mut().find(|s| s.is_free())?,
        };
        let previous = std::mem::take(&mut slot.conf.topics);
        slot.addr = addr.to_owned();
        slot.conf = conf;
        slot.conn = Some(conn);
        slot.last_heartbeat = Instant::now();
        Some(previous)
    }

    /// Release the producer slot bound to `addr`, if any.
    pub fn remove_producer(&mut self, addr: &str) -> bool {
        match self
            .producers
            .iter_mut()
            .find(|s| !s.is_free() && s.addr == addr)
        {
            Some(slot) => {
                slot.release();
                true
            }
            None => false,
        }
    }

    /// Release the consumer slot bound to `addr`.  Returns the topics the
    /// consumer was attached to so the caller can detach them.
    pub fn remove_consumer(&mut self, addr: &str) -> Option<Vec<String>> {
        self.consumers
            .iter_mut()
            .find(|s| !s.is_free() && s.addr == addr)
            .map(ConsumerSlot::release)
    }

    /// Refresh the heartbeat on whichever slot owns `addr`.
    pub fn touch(&mut self, addr: &str, now: Instant) -> bool {
        let mut touched = false;
        if let Some(slot) = self
            .producers
            .iter_mut()
            .find(|s| !s.is_free() && s.addr == addr)
        {
            slot.last_heartbeat = now;
            touched = true;
        }
        if let Some(slot) = self
            .consumers
            .iter_mut()
            .find(|s| !s.is_free() && s.addr == addr)
        {
            slot.last_heartbeat = now;
            touched = true;
        }
        touched
    }

    pub fn query_producer(&self, addr: &str) -> Option<&ProducerSlot> {
        self.producers.iter().find(|s| !s.is_free() && s.addr == addr)
    }

    pub fn query_consumer(&self, addr: &str) -> Option<&ConsumerSlot> {
        self.consumers.iter().find(|s| !s.is_free() && s.addr == addr)
    }

    pub fn producers(&self) -> &[ProducerSlot] {
        &self.producers
    }

    pub fn consumers(&self) -> &[ConsumerSlot] {
        &self.consumers
    }

    /// True when `addr` holds a slot in either table.
    pub fn is_registered(&self, addr: &str) -> bool {
        self.query_producer(addr).is_some() || self.query_consumer(addr).is_some()
    }

    /// Addresses whose last heartbeat is older than `timeout`.
    pub fn heartbeat_expired(&self, timeout: Duration, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        for slot in self.producers.iter().filter(|s| !s.is_free()) {
            if now.duration_since(slot.last_heartbeat) > timeout {
                expired.push(slot.addr.clone());
            }
        }
        for slot in self.consumers.iter().filter(|s| !s.is_free()) {
            if now.duration_since(slot.last_heartbeat) > timeout
                && !expired.contains(&slot.addr)
            {
                expired.push(slot.addr.clone());
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(addr: &str) -> ConnHandle {
        ConnHandle::new(addr).0
    }

    #[test]
    fn bind_fills_slots_until_capacity() {
        let mut tables = SlotTables::new(2);
        assert!(
            tables
                .bind_producer("1.1.1.1:1", ProducerConfig::default(), conn("1.1.1.1:1"))
                .is_some()
        );
        assert!(
            tables
                .bind_producer("1.1.1.1:2", ProducerConfig::default(), conn("1.1.1.1:2"))
                .is_some()
        );
        assert!(
            tables
                .bind_producer("1.1.1.1:3", ProducerConfig::default(), conn("1.1.1.1:3"))
                .is_none()
        );
    }

    #[test]
    fn rebinding_same_addr_reuses_the_slot() {
        let mut tables = SlotTables::new(1);
        let first = tables.bind_producer("a:1", ProducerConfig::default(), conn("a:1"));
        let second = tables.bind_producer("a:1", ProducerConfig::default(), conn("a:1"));
        assert_eq!(first, second);
    }

    #[test]
    fn remove_consumer_returns_topics_and_frees_slot() {
        let mut tables = SlotTables::new(2);
        let conf = ConsumerConfig {
            topics: vec!["t1".to_owned(), "t2".to_owned()],
            ack: Ack::NoConfirm,
        };
        assert!(tables.bind_consumer("c:1", conf, conn("c:1")).is_some());
        let topics = tables.remove_consumer("c:1").unwrap();
        assert_eq!(topics, vec!["t1".to_owned(), "t2".to_owned()]);
        assert!(tables.query_consumer("c:1").is_none());
        assert!(tables.consumers()[0].is_free());
    }

    #[test]
    fn heartbeat_expiry_finds_stale_slots() {
        let mut tables = SlotTables::new(2);
        assert!(
            tables
                .bind_producer("p:1", ProducerConfig::default(), conn("p:1"))
                .is_some()
        );
        let later = Instant::now() + Duration::from_secs(120);
        let expired = tables.heartbeat_expired(Duration::from_secs(60), later);
        assert_eq!(expired, vec!["p:1".to_owned()]);

        tables.touch("p:1", later);
        assert!(
            tables
                .heartbeat_expired(Duration::from_secs(60), later)
                .is_empty()
        );
    }
}

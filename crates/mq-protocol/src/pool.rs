//! Object pools for the frame/message hot path.
//!
//! A pool is a bounded free list.  `get` pops a recycled instance or
//! allocates a fresh one; `put` resets the instance and keeps it if there is
//! room.  `reset` must clear buffers and pointer-typed fields so a pooled
//! instance can never leak a previous owner's data.

use std::sync::Mutex;

use crate::frame::TransferFrame;
use crate::message::{CMessage, PMessage};

/// Implemented by types that can be recycled through a [`Pool`].
pub trait Poolable: Default + Send {
    fn reset(&mut self);
}

pub struct Pool<T: Poolable> {
    items: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T: Poolable> Pool<T> {
    pub fn new(capacity: usize) -> Self {
        Pool {
            items: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn get(&self) -> T {
        self.items.lock().unwrap().pop().unwrap_or_default()
    }

    pub fn put(&self, mut item: T) {
        item.reset();
        let mut items = self.items.lock().unwrap();
        if items.len() < self.capacity {
            items.push(item);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

pub type FramePool = Pool<TransferFrame>;
pub type PmPool = Pool<PMessage>;
pub type CmPool = Pool<CMessage>;

impl Poolable for TransferFrame {
    fn reset(&mut self) {
        TransferFrame::reset(self);
    }
}

impl Poolable for PMessage {
    fn reset(&mut self) {
        PMessage::reset(self);
    }
}

impl Poolable for CMessage {
    fn reset(&mut self) {
        CMessage::reset(self);
    }
}

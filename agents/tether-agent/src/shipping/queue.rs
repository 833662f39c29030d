//! Log Queue
//!
//! Unbounded multi-producer queue of pending records. Producers never block.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::shipping::record::LogRecord;

/// Lock-free FIFO of records awaiting upload
#[derive(Clone)]
pub struct LogQueue {
    sender: Sender<LogRecord>,
    receiver: Receiver<LogRecord>,
}

impl LogQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    pub fn push(&self, record: LogRecord) {
        // Both ends live in self, so the channel cannot be disconnected.
        let _ = self.sender.send(record);
    }

    /// Take up to `max` records in arrival order
    pub fn pop_batch(&self, max: usize) -> Vec<LogRecord> {
        self.receiver.try_iter().take(max).collect()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Discard everything queued, returning how many records were dropped
    pub fn clear(&self) -> usize {
        self.receiver.try_iter().count()
    }
}

impl Default for LogQueue {
    fn default() -> Self {
        Self::new()
    }
}

use std::collections::VecDeque;

use super::types::StreamMessage;

/// Bounded FIFO of the most recent messages on one URL.
#[derive(Debug, Clone)]
pub(crate) struct MessageHistory {
    entries: VecDeque<StreamMessage>,
    capacity: usize,
}

impl MessageHistory {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, evicting the oldest entry once full.
    pub(crate) fn push(&mut self, message: StreamMessage) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    pub(crate) fn snapshot(&self) -> Vec<StreamMessage> {
        self.entries.iter().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

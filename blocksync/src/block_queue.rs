use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::message::Block;

/// Result of [BlockQueue::pop_next].
#[derive(Debug)]
pub enum Next {
    /// Nothing is queued.
    Empty,
    /// The front block does not follow the previous one. It was left in the queue.
    Gap(u64),
    Block(Block),
}

/// Assembled blocks waiting for import, in arrival order.
///
/// The bound is enforced by producers checking [BlockQueue::len] before pushing; see `SyncManager::submit_bodies`.
#[derive(Debug, Default)]
pub struct BlockQueue {
    blocks: Mutex<VecDeque<Block>>,
    notify: Notify,
}

impl BlockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    pub fn push_batch(&self, blocks: impl IntoIterator<Item = Block>) {
        self.blocks.lock().extend(blocks);
        self.notify.notify_one();
    }

    /// Pop the front block if it is the successor of `previous` (or unconditionally when `previous` is `None`).
    pub fn pop_next(&self, previous: Option<u64>) -> Next {
        let mut blocks = self.blocks.lock();
        let Some(front) = blocks.front() else {
            return Next::Empty;
        };
        if let Some(previous) = previous {
            if front.number() != previous.saturating_add(1) {
                return Next::Gap(front.number());
            }
        }
        match blocks.pop_front() {
            Some(block) => Next::Block(block),
            None => Next::Empty,
        }
    }

    /// Completes once blocks have been pushed since the last wait. A push that raced ahead of the wait is not lost.
    pub async fn wait(&self) {
        self.notify.notified().await
    }
}

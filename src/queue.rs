use std::{collections::VecDeque, sync::Arc};

use tokio::sync::oneshot;

use crate::{interval::ByteRange, MediaId};

/// Lane a fetch request waits in. Lanes are served strictly in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Synchronous client reads.
    Top,
    /// Read-ahead.
    Buffer,
    /// Background warm-up.
    Regular,
}

impl Priority {
    pub const ALL: [Self; 3] = [Self::Top, Self::Buffer, Self::Regular];
}

/// Completion signal shared by every fragment of one client request.
///
/// The signal fires when the last clone is dropped, i.e. once the last outstanding fragment
/// got fetched, failed, was found in the cache or was discarded on shutdown.
#[derive(Debug, Clone)]
pub struct Completion(#[allow(dead_code)] Arc<CompletionSignal>);

#[derive(Debug)]
struct CompletionSignal(Option<oneshot::Sender<()>>);

impl Completion {
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(CompletionSignal(Some(tx)))), rx)
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            // The waiter may have given up.
            tx.send(()).ok();
        }
    }
}

/// A pending fetch request.
#[derive(Debug)]
pub struct QueueItem {
    pub media_id: MediaId,
    pub range: ByteRange,
    pub chunk_size: u64,
    pub completion: Option<Completion>,
}

impl QueueItem {
    pub fn new(media_id: MediaId, range: ByteRange, chunk_size: u64) -> Self {
        Self {
            media_id,
            range,
            chunk_size,
            completion: None,
        }
    }

    #[must_use]
    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = Some(completion);
        self
    }

    /// A new item for part of this one, sharing its completion signal.
    pub fn fragment(&self, range: ByteRange) -> Self {
        Self {
            media_id: self.media_id.clone(),
            range,
            chunk_size: self.chunk_size,
            completion: self.completion.clone(),
        }
    }
}

/// The three FIFO lanes of pending fetch requests.
#[derive(Debug, Default)]
pub struct PriorityQueues {
    top: VecDeque<QueueItem>,
    buffer: VecDeque<QueueItem>,
    regular: VecDeque<QueueItem>,
}

impl PriorityQueues {
    fn lane(&self, priority: Priority) -> &VecDeque<QueueItem> {
        match priority {
            Priority::Top => &self.top,
            Priority::Buffer => &self.buffer,
            Priority::Regular => &self.regular,
        }
    }

    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<QueueItem> {
        match priority {
            Priority::Top => &mut self.top,
            Priority::Buffer => &mut self.buffer,
            Priority::Regular => &mut self.regular,
        }
    }

    pub fn push_back(&mut self, priority: Priority, item: QueueItem) {
        self.lane_mut(priority).push_back(item);
    }

    /// Puts `items` at the front of the lane, keeping their order.
    pub fn push_front_all<I>(&mut self, priority: Priority, items: I)
    where
        I: IntoIterator<Item = QueueItem>,
        I::IntoIter: DoubleEndedIterator,
    {
        let lane = self.lane_mut(priority);

        for item in items.into_iter().rev() {
            lane.push_front(item);
        }
    }

    /// Pops the head of the highest priority non-empty lane.
    pub fn pop(&mut self) -> Option<(Priority, QueueItem)> {
        Priority::ALL
            .into_iter()
            .find_map(|p| self.lane_mut(p).pop_front().map(|item| (p, item)))
    }

    pub fn lane_is_empty(&self, priority: Priority) -> bool {
        self.lane(priority).is_empty()
    }

    pub fn is_empty(&self) -> bool {
        Priority::ALL.into_iter().all(|p| self.lane_is_empty(p))
    }

    pub fn len(&self) -> usize {
        Priority::ALL.into_iter().map(|p| self.lane(p).len()).sum()
    }

    /// Drops every queued item, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let len = self.len();

        for p in Priority::ALL {
            self.lane_mut(p).clear();
        }

        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(range: ByteRange) -> QueueItem {
        QueueItem::new("m1".into(), range, 10)
    }

    #[test]
    fn test_pop_by_priority() {
        let mut queues = PriorityQueues::default();
        queues.push_back(Priority::Regular, item(0..1));
        queues.push_back(Priority::Buffer, item(1..2));
        queues.push_back(Priority::Top, item(2..3));
        queues.push_back(Priority::Top, item(3..4));

        let order: Vec<_> = std::iter::from_fn(|| queues.pop())
            .map(|(p, item)| (p, item.range))
            .collect();

        assert_eq!(
            order,
            vec![
                (Priority::Top, 2..3),
                (Priority::Top, 3..4),
                (Priority::Buffer, 1..2),
                (Priority::Regular, 0..1),
            ]
        );
        assert!(queues.is_empty());
    }

    #[test]
    fn test_push_front_all_keeps_order() {
        let mut queues = PriorityQueues::default();
        queues.push_back(Priority::Buffer, item(100..200));
        queues.push_front_all(Priority::Buffer, vec![item(0..10), item(20..30)]);

        let order: Vec<_> = std::iter::from_fn(|| queues.pop())
            .map(|(_, item)| item.range)
            .collect();

        assert_eq!(order, vec![0..10, 20..30, 100..200]);
    }

    #[test]
    fn test_completion_fires_after_last_fragment() {
        let (completion, mut rx) = Completion::channel();
        let whole = item(0..100).with_completion(completion);
        let head = whole.fragment(0..50);
        let tail = whole.fragment(50..100);

        drop(whole);
        drop(head);
        assert!(rx.try_recv().is_err());

        drop(tail);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_clear_fires_completion() {
        let (completion, mut rx) = Completion::channel();
        let mut queues = PriorityQueues::default();
        queues.push_back(Priority::Top, item(0..1).with_completion(completion));
        queues.push_back(Priority::Regular, item(1..2));

        assert_eq!(queues.clear(), 2);
        assert!(rx.try_recv().is_ok());
    }
}

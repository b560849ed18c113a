//! Bounded per-session queue with an explicit end-of-stream marker.
//!
//! The production task pushes items and waits while the queue is full; the
//! WebSocket actor pops them either without blocking or with a timeout. Once
//! production finishes normally a single [`StreamItem::EndOfStream`] marker is
//! placed behind the last item. Reading the marker leaves it in place, so every
//! later read also reports the end of the stream.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem<T> {
    Item(T),
    EndOfStream,
}

/// Result of a dequeue attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Dequeued<T> {
    Item(T),
    EndOfStream,
    /// Nothing available right now (or before the timeout ran out).
    Empty,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("enqueue cancelled")]
    Cancelled,
}

struct QueueState<T> {
    items: VecDeque<StreamItem<T>>,
    finished: bool,
    closed: bool,
}

pub struct StreamQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    item_ready: Notify,
    space_ready: Notify,
}

impl<T> StreamQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity + 1),
                finished: false,
                closed: false,
            }),
            item_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items waiting to be read, not counting the end marker.
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.items.len() - usize::from(state.finished)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The end marker has been placed (items may still be ahead of it).
    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Every item has been read and only the end marker remains.
    pub fn is_drained(&self) -> bool {
        matches!(self.lock().items.front(), Some(StreamItem::EndOfStream))
    }

    /// Enqueue an item, waiting for space while the queue is full.
    ///
    /// Fails with `Closed` once the end marker is in place or the queue was
    /// released, and with `Cancelled` if `cancel` fires while waiting.
    pub async fn push(&self, item: T, cancel: &CancellationToken) -> Result<(), QueueError> {
        loop {
            let space = self.space_ready.notified();
            {
                let mut state = self.lock();
                if state.finished || state.closed {
                    return Err(QueueError::Closed);
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(StreamItem::Item(item));
                    drop(state);
                    self.item_ready.notify_one();
                    return Ok(());
                }
            }

            tokio::select! {
                _ = space => {}
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    /// Place the end-of-stream marker. It never waits for space.
    pub fn finish(&self) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            if state.finished || state.closed {
                return Err(QueueError::Closed);
            }
            state.items.push_back(StreamItem::EndOfStream);
            state.finished = true;
        }
        self.item_ready.notify_waiters();
        self.item_ready.notify_one();
        Ok(())
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Dequeued<T> {
        let dequeued = {
            let mut state = self.lock();
            match state.items.pop_front() {
                Some(StreamItem::Item(item)) => Dequeued::Item(item),
                Some(StreamItem::EndOfStream) => {
                    state.items.push_front(StreamItem::EndOfStream);
                    Dequeued::EndOfStream
                }
                None => Dequeued::Empty,
            }
        };

        match dequeued {
            Dequeued::Item(_) => self.space_ready.notify_one(),
            // Pass the wakeup on so other readers see the marker too.
            Dequeued::EndOfStream => self.item_ready.notify_one(),
            Dequeued::Empty => {}
        }
        dequeued
    }

    /// Dequeue, waiting up to `timeout` for an item or the end marker.
    pub async fn pop_timeout(&self, timeout: Duration) -> Dequeued<T> {
        let wait = async {
            loop {
                let ready = self.item_ready.notified();
                match self.try_pop() {
                    Dequeued::Empty => ready.await,
                    other => return other,
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(Dequeued::Empty)
    }

    /// Drop everything and refuse further pushes; used on session teardown.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.items.clear();
            state.finished = false;
            state.closed = true;
        }
        self.space_ready.notify_waiters();
        self.item_ready.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_then_end_marker() {
        let queue = StreamQueue::new(4);
        let cancel = CancellationToken::new();
        queue.push(1, &cancel).await.unwrap();
        queue.push(2, &cancel).await.unwrap();
        queue.finish().unwrap();

        assert_eq!(queue.len(), 2);
        assert!(!queue.is_drained());
        assert_eq!(queue.try_pop(), Dequeued::Item(1));
        assert_eq!(queue.try_pop(), Dequeued::Item(2));
        assert!(queue.is_drained());
        assert_eq!(queue.try_pop(), Dequeued::EndOfStream);
        // the marker stays for every later read
        assert_eq!(queue.try_pop(), Dequeued::EndOfStream);
        assert_eq!(
            queue.pop_timeout(Duration::from_millis(10)).await,
            Dequeued::EndOfStream
        );
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_nothing_after_end_marker() {
        let queue = StreamQueue::new(4);
        let cancel = CancellationToken::new();
        queue.finish().unwrap();

        assert_eq!(queue.push(7, &cancel).await, Err(QueueError::Closed));
        assert_eq!(queue.finish(), Err(QueueError::Closed));
        assert_eq!(queue.try_pop(), Dequeued::EndOfStream);
    }

    #[tokio::test]
    async fn test_marker_bypasses_capacity() {
        let queue = StreamQueue::new(1);
        let cancel = CancellationToken::new();
        queue.push("only", &cancel).await.unwrap();
        assert!(queue.finish().is_ok());
        assert_eq!(queue.try_pop(), Dequeued::Item("only"));
        assert_eq!(queue.try_pop(), Dequeued::EndOfStream);
    }

    #[tokio::test]
    async fn test_empty_pop_times_out() {
        let queue: StreamQueue<u32> = StreamQueue::new(2);
        assert_eq!(queue.try_pop(), Dequeued::Empty);
        assert_eq!(queue.pop_timeout(Duration::from_millis(20)).await, Dequeued::Empty);
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let queue = Arc::new(StreamQueue::new(2));
        let cancel = CancellationToken::new();
        queue.push(1, &cancel).await.unwrap();
        queue.push(2, &cancel).await.unwrap();

        let producer = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.push(3, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.try_pop(), Dequeued::Item(1));
        producer.await.unwrap().unwrap();
        assert_eq!(queue.try_pop(), Dequeued::Item(2));
        assert_eq!(queue.try_pop(), Dequeued::Item(3));
    }

    #[tokio::test]
    async fn test_blocked_push_honours_cancellation() {
        let queue = Arc::new(StreamQueue::new(1));
        let cancel = CancellationToken::new();
        queue.push(1, &cancel).await.unwrap();

        let producer = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.push(2, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert_eq!(producer.await.unwrap(), Err(QueueError::Cancelled));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_waiting_reader_wakes_on_push() {
        let queue = Arc::new(StreamQueue::new(2));
        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop_timeout(Duration::from_secs(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(42, &CancellationToken::new()).await.unwrap();
        assert_eq!(reader.await.unwrap(), Dequeued::Item(42));
    }

    #[tokio::test]
    async fn test_close_discards_and_rejects() {
        let queue = StreamQueue::new(2);
        let cancel = CancellationToken::new();
        queue.push(1, &cancel).await.unwrap();
        queue.close();

        assert_eq!(queue.try_pop(), Dequeued::Empty);
        assert_eq!(queue.push(2, &cancel).await, Err(QueueError::Closed));
        assert_eq!(queue.finish(), Err(QueueError::Closed));
    }
}

//! # Message Channels
//!
//! ## Purpose
//!
//! Ordered, closable queues that connect the producer and consumer threads of
//! a connection stage or execution strategy. A channel is unbounded: `push`
//! never waits for a consumer. `pop` blocks until an item arrives or the
//! channel is closed.
//!
//! ## Close Semantics
//!
//! - `close()` is idempotent and may be called from either end
//! - closing wakes every consumer blocked in `pop()`
//! - items already queued when the channel closes are still delivered, then
//!   `pop()` reports end-of-stream; pushes after close are handed back to the caller
//!
//! ## Architecture Role
//!
//! ```text
//! input thread ──push──▶ [Channel] ──pop──▶ output thread
//!                           ▲
//!                 close() from either side
//! ```
//!
//! Every handle is a cheap clone of the same shared queue, so one channel can
//! serve one producer and N consumers (used by the distributed job queue);
//! crossbeam guarantees an item is received by exactly one consumer.

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Returned by `push` on a closed channel; carries the rejected item back
#[derive(Debug, Error, PartialEq, Eq)]
#[error("channel closed")]
pub struct ChannelClosed<T>(pub T);

impl<T> ChannelClosed<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

/// Anything owning a channel end that must be released when its owner exits
pub trait Closeable {
    fn close(&self);
}

impl<A: Closeable, B: Closeable> Closeable for (A, B) {
    fn close(&self) {
        self.0.close();
        self.1.close();
    }
}

impl<C: Closeable + ?Sized> Closeable for Box<C> {
    fn close(&self) {
        (**self).close();
    }
}

impl<C: Closeable> Closeable for Vec<C> {
    fn close(&self) {
        for closeable in self {
            closeable.close();
        }
    }
}

impl Closeable for () {
    fn close(&self) {}
}

struct Shared<T> {
    /// Single sender; dropping it disconnects every receiver
    sender: RwLock<Option<Sender<T>>>,
    receiver: Receiver<T>,
    closed: AtomicBool,
}

impl<T> Shared<T> {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.sender.write().take();
        }
    }
}

/// Producer end of a channel
pub struct ChannelSender<T> {
    shared: Arc<Shared<T>>,
}

/// Consumer end of a channel
pub struct ChannelReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Create a fresh open channel
pub fn channel<T>() -> (ChannelSender<T>, ChannelReceiver<T>) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    let shared = Arc::new(Shared {
        sender: RwLock::new(Some(sender)),
        receiver,
        closed: AtomicBool::new(false),
    });

    (
        ChannelSender {
            shared: Arc::clone(&shared),
        },
        ChannelReceiver { shared },
    )
}

impl<T> ChannelSender<T> {
    /// Enqueue an item; fails only when the channel has been closed
    pub fn push(&self, item: T) -> Result<(), ChannelClosed<T>> {
        let guard = self.shared.sender.read();
        match guard.as_ref() {
            Some(sender) => sender.send(item).map_err(|e| ChannelClosed(e.into_inner())),
            None => Err(ChannelClosed(item)),
        }
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl<T> ChannelReceiver<T> {
    /// Block until an item is available; `None` once closed and drained
    pub fn pop(&self) -> Option<T> {
        self.shared.receiver.recv().ok()
    }

    /// Non-blocking pop
    pub fn try_pop(&self) -> Option<T> {
        match self.shared.receiver.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Items queued and not yet consumed
    pub fn len(&self) -> usize {
        self.shared.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.receiver.is_empty()
    }
}

impl<T> Clone for ChannelSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Clone for ChannelReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for ChannelSender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> std::fmt::Debug for ChannelReceiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelReceiver")
            .field("closed", &self.is_closed())
            .field("queued", &self.len())
            .finish()
    }
}

impl<T> Closeable for ChannelSender<T> {
    fn close(&self) {
        ChannelSender::close(self);
    }
}

impl<T> Closeable for ChannelReceiver<T> {
    fn close(&self) {
        ChannelReceiver::close(self);
    }
}

/// Draining iteration: yields until the channel is closed and empty
impl<T> Iterator for ChannelReceiver<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let (tx, rx) = channel();
        for i in 0..100 {
            tx.push(i).unwrap();
        }
        tx.close();
        let received: Vec<i32> = rx.collect();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (tx, rx) = channel::<u8>();
        tx.close();
        tx.close();
        rx.close();
        assert!(tx.is_closed());
        assert!(rx.is_closed());
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_push_after_close_returns_item() {
        let (tx, _rx) = channel();
        tx.close();
        let rejected = tx.push("late").unwrap_err();
        assert_eq!(rejected.into_inner(), "late");
    }

    #[test]
    fn test_queued_items_survive_close() {
        let (tx, rx) = channel();
        tx.push(1).unwrap();
        tx.push(2).unwrap();
        tx.close();
        assert_eq!(rx.pop(), Some(1));
        assert_eq!(rx.pop(), Some(2));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_close_from_receiver_wakes_other_consumer() {
        let (_tx, rx) = channel::<u8>();
        let blocked = rx.clone();
        let handle = thread::spawn(move || blocked.pop());
        thread::sleep(Duration::from_millis(50));
        rx.close();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn test_tuple_closeable_closes_both() {
        let (a_tx, a_rx) = channel::<u8>();
        let (b_tx, b_rx) = channel::<u8>();
        (a_tx, b_rx).close();
        assert!(a_rx.is_closed());
        assert!(b_tx.is_closed());
    }
}

//! Bounded frame queue connecting pipeline stages.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::frame::Frame;

/// Returned by [`FrameQueue::push`] when the queue is at capacity; carries
/// the rejected frame back so the caller decides whether to block, retry,
/// or drop.
#[derive(Debug)]
pub struct QueueFull(pub Frame);

/// Thread-safe bounded FIFO of frames.
///
/// Cloning shares the same underlying channel; any clone may push or pop.
/// Dropping the last clone drains the remaining frames.
#[derive(Clone)]
pub struct FrameQueue {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    capacity: usize,
}

impl FrameQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Non-blocking push; fails when the queue is full.
    pub fn push(&self, frame: Frame) -> Result<(), QueueFull> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(frame)) => Err(QueueFull(frame)),
            // Both channel ends live inside `self`, so the channel cannot
            // be disconnected while the queue exists.
            Err(TrySendError::Disconnected(frame)) => Err(QueueFull(frame)),
        }
    }

    /// Blocking push; parks the caller until space frees up.
    pub fn push_wait(&self, frame: Frame) {
        let _ = self.tx.send(frame);
    }

    /// Wait up to `timeout` for a frame and pop it.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Frame> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_pop(&self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::EncodeType;

    fn tiny_frame() -> Frame {
        Frame::new(vec![0u8; 4], 4, 1, 1, EncodeType::None, 0).unwrap()
    }

    #[test]
    fn push_fails_when_full() {
        let queue = FrameQueue::bounded(1);
        queue.push(tiny_frame()).unwrap();
        let rejected = queue.push(tiny_frame());
        assert!(rejected.is_err());
        // The rejected frame is handed back intact.
        let QueueFull(frame) = rejected.unwrap_err();
        assert_eq!(frame.width(0).unwrap(), 4);
    }

    #[test]
    fn pop_timeout_observes_ordering() {
        let queue = FrameQueue::bounded(2);
        let mut first = tiny_frame();
        first.meta_data_mut().put("seq", 1).unwrap();
        let mut second = tiny_frame();
        second.meta_data_mut().put("seq", 2).unwrap();
        queue.push(first).unwrap();
        queue.push(second).unwrap();

        let popped = queue.pop_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(
            popped.meta_data().root().get_int("seq").unwrap(),
            1
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn pop_timeout_returns_none_when_idle() {
        let queue = FrameQueue::bounded(1);
        assert!(queue.pop_timeout(Duration::from_millis(5)).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn blocking_push_unblocks_on_pop() {
        let queue = FrameQueue::bounded(1);
        queue.push(tiny_frame()).unwrap();

        let pusher = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                queue.push_wait(tiny_frame());
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(queue.pop_timeout(Duration::from_millis(100)).is_some());
        pusher.join().unwrap();
        assert_eq!(queue.len(), 1);
    }
}

//! Bounded single-producer/single-consumer conduits between pipeline nodes.
//!
//! Every edge in the graph is one ring with a fixed capacity and an overflow
//! policy chosen at connect time. The ring is guarded by a single lock and a
//! condition variable per direction; exactly one producer and one consumer
//! ever touch it, so nothing stronger is needed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use signal_types::SampleBlock;

use crate::error::ChannelError;

/// What `push` does when the ring is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Suspend the producer until the consumer frees a slot.
    Block,
    /// Evict the oldest unread block and count it as dropped.
    DropOldest,
}

/// Outcome of a timed pop.
#[derive(Debug)]
pub enum PopResult {
    Block(Arc<SampleBlock>),
    TimedOut,
    /// Producer closed and the ring is drained: end of stream.
    Closed,
}

struct Ring {
    queue: VecDeque<Arc<SampleBlock>>,
    /// Channel width, pinned by the first pushed block.
    width: Option<usize>,
    producer_closed: bool,
    consumer_gone: bool,
}

struct Shared {
    capacity: usize,
    policy: OverflowPolicy,
    ring: Mutex<Ring>,
    not_full: Condvar,
    not_empty: Condvar,
    dropped: AtomicU64,
}

/// Producing end of a stream channel. Not clonable: one producer per ring.
pub struct BlockSender {
    shared: Arc<Shared>,
}

/// Consuming end of a stream channel. Not clonable: one consumer per ring.
pub struct BlockReceiver {
    shared: Arc<Shared>,
}

/// Runtime-internal handle used to force-close a channel and read its
/// drop counter without holding either end.
pub(crate) struct ChannelControl {
    shared: Arc<Shared>,
}

/// Creates a bounded SPSC channel with the given capacity and policy.
pub fn stream_channel(capacity: usize, policy: OverflowPolicy) -> (BlockSender, BlockReceiver) {
    let (tx, rx, _) = stream_channel_internal(capacity, policy);
    (tx, rx)
}

pub(crate) fn stream_channel_internal(
    capacity: usize,
    policy: OverflowPolicy,
) -> (BlockSender, BlockReceiver, ChannelControl) {
    let shared = Arc::new(Shared {
        capacity: capacity.max(1),
        policy,
        ring: Mutex::new(Ring {
            queue: VecDeque::with_capacity(capacity.max(1)),
            width: None,
            producer_closed: false,
            consumer_gone: false,
        }),
        not_full: Condvar::new(),
        not_empty: Condvar::new(),
        dropped: AtomicU64::new(0),
    });
    (
        BlockSender {
            shared: shared.clone(),
        },
        BlockReceiver {
            shared: shared.clone(),
        },
        ChannelControl { shared },
    )
}

impl BlockSender {
    /// Pushes one block. Under [`OverflowPolicy::Block`] this suspends while
    /// the ring is full; under [`OverflowPolicy::DropOldest`] it evicts the
    /// oldest unread block instead. Fails once the consumer end is gone or
    /// the channel was closed by the runtime.
    pub fn push(&self, block: Arc<SampleBlock>) -> Result<(), ChannelError> {
        let mut ring = self.shared.ring.lock().unwrap();
        if ring.consumer_gone || ring.producer_closed {
            return Err(ChannelError::Closed);
        }
        match ring.width {
            Some(want) if want != block.channel_count() => {
                return Err(ChannelError::WidthMismatch {
                    want,
                    got: block.channel_count(),
                });
            }
            Some(_) => {}
            None => ring.width = Some(block.channel_count()),
        }
        while ring.queue.len() >= self.shared.capacity {
            match self.shared.policy {
                OverflowPolicy::DropOldest => {
                    ring.queue.pop_front();
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                OverflowPolicy::Block => {
                    ring = self.shared.not_full.wait(ring).unwrap();
                    if ring.consumer_gone || ring.producer_closed {
                        return Err(ChannelError::Closed);
                    }
                }
            }
        }
        ring.queue.push_back(block);
        drop(ring);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Total blocks evicted under the drop-oldest policy.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for BlockSender {
    fn drop(&mut self) {
        let mut ring = self.shared.ring.lock().unwrap();
        ring.producer_closed = true;
        drop(ring);
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }
}

impl BlockReceiver {
    /// Pops the next block, suspending while the ring is empty. Returns
    /// `None` exactly when the producer closed and the ring is drained;
    /// this is the only end-of-stream signal consumers observe.
    pub fn pop(&self) -> Option<Arc<SampleBlock>> {
        let mut ring = self.shared.ring.lock().unwrap();
        loop {
            if let Some(block) = ring.queue.pop_front() {
                drop(ring);
                self.shared.not_full.notify_one();
                return Some(block);
            }
            if ring.producer_closed {
                return None;
            }
            ring = self.shared.not_empty.wait(ring).unwrap();
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`, so a node with
    /// several input ports can service all of them.
    pub fn pop_timeout(&self, timeout: Duration) -> PopResult {
        let deadline = Instant::now() + timeout;
        let mut ring = self.shared.ring.lock().unwrap();
        loop {
            if let Some(block) = ring.queue.pop_front() {
                drop(ring);
                self.shared.not_full.notify_one();
                return PopResult::Block(block);
            }
            if ring.producer_closed {
                return PopResult::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return PopResult::TimedOut;
            }
            let (guard, res) = self
                .shared
                .not_empty
                .wait_timeout(ring, deadline - now)
                .unwrap();
            ring = guard;
            if res.timed_out() && ring.queue.is_empty() && !ring.producer_closed {
                return PopResult::TimedOut;
            }
        }
    }

    /// Total blocks evicted under the drop-oldest policy.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for BlockReceiver {
    fn drop(&mut self) {
        let mut ring = self.shared.ring.lock().unwrap();
        ring.consumer_gone = true;
        ring.queue.clear();
        drop(ring);
        self.shared.not_full.notify_all();
    }
}

impl ChannelControl {
    /// Closes the producer side regardless of who holds the sender. Blocked
    /// producers wake with [`ChannelError::Closed`]; consumers drain and see
    /// end-of-stream.
    pub(crate) fn close_producer(&self) {
        let mut ring = self.shared.ring.lock().unwrap();
        ring.producer_closed = true;
        drop(ring);
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn block(tag: u64) -> Arc<SampleBlock> {
        Arc::new(SampleBlock::new(tag, 250.0, vec![vec![tag as f32]]).unwrap())
    }

    #[test]
    fn test_fifo_order_and_eos() {
        let (tx, rx) = stream_channel(8, OverflowPolicy::Block);
        for i in 0..4 {
            tx.push(block(i)).unwrap();
        }
        drop(tx);
        for i in 0..4 {
            assert_eq!(rx.pop().unwrap().start_ts_ns, i);
        }
        assert!(rx.pop().is_none());
        // End-of-stream is sticky.
        assert!(rx.pop().is_none());
    }

    #[test]
    fn test_drop_oldest_keeps_three_most_recent() {
        let (tx, rx) = stream_channel(3, OverflowPolicy::DropOldest);
        for i in 1..=5 {
            tx.push(block(i)).unwrap();
        }
        let seen: Vec<u64> = std::iter::from_fn(|| match rx.pop_timeout(Duration::from_millis(1)) {
            PopResult::Block(b) => Some(b.start_ts_ns),
            _ => None,
        })
        .collect();
        assert_eq!(seen, vec![3, 4, 5]);
        assert_eq!(tx.dropped(), 2);
        assert_eq!(rx.dropped(), 2);
    }

    #[test]
    fn test_block_policy_applies_backpressure() {
        let (tx, rx) = stream_channel(2, OverflowPolicy::Block);
        tx.push(block(1)).unwrap();
        tx.push(block(2)).unwrap();
        let producer = thread::spawn(move || {
            // Full ring: this suspends until the consumer pops.
            tx.push(block(3)).unwrap();
            tx.dropped()
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(rx.pop().unwrap().start_ts_ns, 1);
        assert_eq!(producer.join().unwrap(), 0);
        assert_eq!(rx.pop().unwrap().start_ts_ns, 2);
        assert_eq!(rx.pop().unwrap().start_ts_ns, 3);
    }

    #[test]
    fn test_push_fails_after_consumer_drop() {
        let (tx, rx) = stream_channel(2, OverflowPolicy::Block);
        drop(rx);
        assert_eq!(tx.push(block(1)), Err(ChannelError::Closed));
    }

    #[test]
    fn test_width_pinned_on_first_push() {
        let (tx, _rx) = stream_channel(4, OverflowPolicy::Block);
        tx.push(block(1)).unwrap();
        let wide = Arc::new(SampleBlock::new(2, 250.0, vec![vec![0.0], vec![0.0]]).unwrap());
        assert_eq!(
            tx.push(wide),
            Err(ChannelError::WidthMismatch { want: 1, got: 2 })
        );
    }

    #[test]
    fn test_pop_timeout_times_out_when_empty() {
        let (_tx, rx) = stream_channel(2, OverflowPolicy::Block);
        assert!(matches!(
            rx.pop_timeout(Duration::from_millis(5)),
            PopResult::TimedOut
        ));
    }

    proptest::proptest! {
        #[test]
        fn prop_drop_oldest_keeps_most_recent(capacity in 1usize..16, pushes in 0u64..64) {
            let (tx, rx) = stream_channel(capacity, OverflowPolicy::DropOldest);
            for i in 0..pushes {
                tx.push(block(i)).unwrap();
            }
            drop(tx);
            let seen: Vec<u64> = std::iter::from_fn(|| rx.pop().map(|b| b.start_ts_ns)).collect();
            let kept = (pushes as usize).min(capacity) as u64;
            let expected: Vec<u64> = (pushes - kept..pushes).collect();
            proptest::prop_assert_eq!(seen, expected);
            proptest::prop_assert_eq!(rx.dropped(), pushes - kept);
        }
    }

    #[test]
    fn test_blocked_producer_wakes_on_force_close() {
        let (tx, rx, control) = stream_channel_internal(1, OverflowPolicy::Block);
        tx.push(block(1)).unwrap();
        let producer = thread::spawn(move || tx.push(block(2)));
        thread::sleep(Duration::from_millis(10));
        control.close_producer();
        assert_eq!(producer.join().unwrap(), Err(ChannelError::Closed));
        // The block pushed before the close is still delivered.
        assert_eq!(rx.pop().unwrap().start_ts_ns, 1);
        assert!(rx.pop().is_none());
    }
}

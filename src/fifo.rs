//! Ring-buffer FIFO queue with automatic grow/shrink.
//!
//! The queue is bounded, thread-safe and never blocks: dequeue on an empty
//! queue is an error, not a wait. Both operations honour a
//! [`CancellationToken`]. With `auto_resize` enabled the backing store grows
//! lazily on a would-overflow enqueue and shrinks on dequeue once the load
//! factor stays below `shrink_factor²`, floored at `min_capacity`.

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::error::QueueError;

/// Sizing options for [`FifoQueue`].
///
/// Out-of-range values are repaired on construction rather than rejected:
/// capacities are floored at 1, a growth factor not above 1.0 falls back to
/// 2.0 and a shrink factor outside `(0, 1)` falls back to 0.5.
#[derive(Debug, Clone)]
pub struct FifoConfig {
    pub initial_capacity: usize,
    pub auto_resize: bool,
    pub growth_factor: f64,
    pub shrink_factor: f64,
    pub min_capacity: usize,
}

impl Default for FifoConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 16,
            auto_resize: true,
            growth_factor: 2.0,
            shrink_factor: 0.5,
            min_capacity: 1,
        }
    }
}

impl FifoConfig {
    fn normalized(mut self) -> Self {
        self.initial_capacity = self.initial_capacity.max(1);
        self.min_capacity = self.min_capacity.max(1);
        if self.growth_factor <= 1.0 {
            self.growth_factor = 2.0;
        }
        if self.shrink_factor <= 0.0 || self.shrink_factor >= 1.0 {
            self.shrink_factor = 0.5;
        }
        self
    }
}

/// Thread-safe circular-buffer FIFO queue.
pub struct FifoQueue<T> {
    cfg: FifoConfig,
    inner: Mutex<Ring<T>>,
}

struct Ring<T> {
    buf: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> Ring<T> {
    fn with_capacity(capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(capacity);
        buf.resize_with(capacity, || None);
        Self { buf, head: 0, len: 0 }
    }

    /// Moves live elements, in order, into a fresh backing store.
    fn resize_to(&mut self, capacity: usize) {
        let mut fresh: Vec<Option<T>> = Vec::with_capacity(capacity);
        fresh.resize_with(capacity, || None);
        let old_cap = self.buf.len();
        for i in 0..self.len {
            fresh[i] = self.buf[(self.head + i) % old_cap].take();
        }
        self.buf = fresh;
        self.head = 0;
    }
}

impl<T> FifoQueue<T> {
    pub fn new() -> Self {
        Self::with_config(FifoConfig::default())
    }

    pub fn with_config(cfg: FifoConfig) -> Self {
        let cfg = cfg.normalized();
        let ring = Ring::with_capacity(cfg.initial_capacity);
        Self {
            cfg,
            inner: Mutex::new(ring),
        }
    }

    /// Appends `item` at the tail.
    ///
    /// Fails with [`QueueError::Cancelled`] when `ctx` is done and with
    /// [`QueueError::Full`] when the buffer is full and `auto_resize` is off.
    pub fn enqueue(&self, ctx: &CancellationToken, item: T) -> Result<(), QueueError> {
        if ctx.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        let mut ring = self.inner.lock().expect("fifo lock poisoned");
        if ctx.is_cancelled() {
            return Err(QueueError::Cancelled);
        }

        let cap = ring.buf.len();
        if ring.len == cap {
            if !self.cfg.auto_resize {
                return Err(QueueError::Full);
            }
            let grown = ((cap as f64) * self.cfg.growth_factor).ceil() as usize;
            ring.resize_to(grown.max(cap + 1));
        }

        let cap = ring.buf.len();
        let tail = (ring.head + ring.len) % cap;
        ring.buf[tail] = Some(item);
        ring.len += 1;
        Ok(())
    }

    /// Removes and returns the head item.
    ///
    /// Fails with [`QueueError::Cancelled`] when `ctx` is done and with
    /// [`QueueError::Empty`] immediately when nothing is queued; callers that
    /// want to wait must poll.
    pub fn dequeue(&self, ctx: &CancellationToken) -> Result<T, QueueError> {
        if ctx.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        let mut ring = self.inner.lock().expect("fifo lock poisoned");
        if ctx.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        if ring.len == 0 {
            return Err(QueueError::Empty);
        }

        let head = ring.head;
        let item = ring.buf[head].take().expect("ring head slot empty");
        ring.head = (head + 1) % ring.buf.len();
        ring.len -= 1;

        if self.cfg.auto_resize {
            let cap = ring.buf.len() as f64;
            let threshold = cap * self.cfg.shrink_factor * self.cfg.shrink_factor;
            if (ring.len as f64) < threshold {
                let shrunk = ((cap * self.cfg.shrink_factor).floor() as usize)
                    .max(self.cfg.min_capacity)
                    .max(ring.len)
                    .max(1);
                if shrunk < ring.buf.len() {
                    ring.resize_to(shrunk);
                }
            }
        }

        Ok(item)
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("fifo lock poisoned").len
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().expect("fifo lock poisoned").buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

impl<T> Default for FifoQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    fn fixed(capacity: usize) -> FifoQueue<u32> {
        FifoQueue::with_config(FifoConfig {
            initial_capacity: capacity,
            auto_resize: false,
            ..FifoConfig::default()
        })
    }

    #[test]
    fn round_trips_in_order() {
        let q = FifoQueue::new();
        let ctx = ctx();
        for i in 0..100u32 {
            q.enqueue(&ctx, i).unwrap();
        }
        for i in 0..100u32 {
            assert_eq!(q.dequeue(&ctx), Ok(i));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn wraps_around_the_backing_store() {
        let q = fixed(4);
        let ctx = ctx();
        for round in 0..10u32 {
            q.enqueue(&ctx, round).unwrap();
            q.enqueue(&ctx, round + 100).unwrap();
            assert_eq!(q.dequeue(&ctx), Ok(round));
            assert_eq!(q.dequeue(&ctx), Ok(round + 100));
        }
        assert_eq!(q.capacity(), 4);
    }

    #[test]
    fn grows_on_overflow_when_auto_resize() {
        let q = FifoQueue::with_config(FifoConfig {
            initial_capacity: 2,
            min_capacity: 2,
            ..FifoConfig::default()
        });
        let ctx = ctx();
        for i in 0..5u32 {
            q.enqueue(&ctx, i).unwrap();
        }
        assert!(q.capacity() >= 5);
        // Order survives the grow.
        for i in 0..5u32 {
            assert_eq!(q.dequeue(&ctx), Ok(i));
        }
    }

    #[test]
    fn full_without_auto_resize() {
        let q = fixed(2);
        let ctx = ctx();
        q.enqueue(&ctx, 1).unwrap();
        q.enqueue(&ctx, 2).unwrap();
        assert_eq!(q.enqueue(&ctx, 3), Err(QueueError::Full));
    }

    #[test]
    fn shrinks_down_to_min_capacity() {
        let q = FifoQueue::with_config(FifoConfig {
            initial_capacity: 64,
            min_capacity: 4,
            ..FifoConfig::default()
        });
        let ctx = ctx();
        for i in 0..64u32 {
            q.enqueue(&ctx, i).unwrap();
        }
        for i in 0..64u32 {
            assert_eq!(q.dequeue(&ctx), Ok(i));
        }
        assert!(q.capacity() < 64);
        assert!(q.capacity() >= 4);
    }

    #[test]
    fn empty_dequeue_is_an_error_not_a_block() {
        let q: FifoQueue<u32> = FifoQueue::new();
        assert_eq!(q.dequeue(&ctx()), Err(QueueError::Empty));
    }

    #[test]
    fn cancelled_token_aborts_both_operations() {
        let q = FifoQueue::new();
        let token = ctx();
        q.enqueue(&token, 1u32).unwrap();
        token.cancel();
        assert_eq!(q.enqueue(&token, 2), Err(QueueError::Cancelled));
        assert_eq!(q.dequeue(&token), Err(QueueError::Cancelled));
        // The queued item is still there for a live token.
        assert_eq!(q.dequeue(&ctx()), Ok(1));
    }
}

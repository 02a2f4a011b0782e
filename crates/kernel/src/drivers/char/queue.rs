// Bounded byte rings backing every tty line
//
// Producers advance `head`, consumers advance `tail`, both modulo a
// power-of-two capacity with one slot reserved to distinguish full from
// empty. A parallel bitmap marks per-byte conditions: error flags on
// the raw queue, end-of-line sentinels on the cooked queue. Index
// updates happen under the queue mutex (the interrupt-masked sections
// of the original discipline); bulk copies stay outside.

use spin::Mutex;

use crate::sched::WaitQueue;

/// Ring capacity. Must stay a power of two.
pub const TTY_BUF_SIZE: usize = 1024;

/// Output is restarted once the write queue drains below this.
pub const WAKEUP_CHARS: usize = 256;

// Cooked-queue watermarks driving the throttle callbacks.
pub const SQ_THRESHOLD_LW: usize = 16;
pub const SQ_THRESHOLD_HW: usize = 768;

// Raw-queue watermarks.
pub const RQ_THRESHOLD_LW: usize = 16;
pub const RQ_THRESHOLD_HW: usize = 768;

#[derive(Clone)]
pub struct QueueInner {
    pub buf: [u8; TTY_BUF_SIZE],
    pub head: usize,
    pub tail: usize,
    flags: [u64; TTY_BUF_SIZE / 64],
}

#[inline]
pub fn inc(idx: usize) -> usize {
    (idx + 1) & (TTY_BUF_SIZE - 1)
}

#[inline]
pub fn dec(idx: usize) -> usize {
    (idx.wrapping_sub(1)) & (TTY_BUF_SIZE - 1)
}

impl QueueInner {
    pub const fn new() -> Self {
        Self {
            buf: [0; TTY_BUF_SIZE],
            head: 0,
            tail: 0,
            flags: [0; TTY_BUF_SIZE / 64],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        inc(self.head) == self.tail
    }

    /// Bytes queued.
    pub fn chars(&self) -> usize {
        (self.head.wrapping_sub(self.tail)) & (TTY_BUF_SIZE - 1)
    }

    /// Free room, accounting for the reserved slot.
    pub fn left(&self) -> usize {
        (self.tail.wrapping_sub(self.head).wrapping_sub(1)) & (TTY_BUF_SIZE - 1)
    }

    /// Last byte queued (producer side).
    pub fn last(&self) -> u8 {
        self.buf[dec(self.head)]
    }

    /// Append a byte; silently dropped when the ring is full.
    pub fn put(&mut self, c: u8) {
        let head = inc(self.head);
        if head != self.tail {
            self.buf[self.head] = c;
            self.head = head;
        }
    }

    /// Append a byte with its parallel flag bit set.
    pub fn put_flagged(&mut self, c: u8) {
        let head = inc(self.head);
        if head != self.tail {
            self.set_flag(self.head);
            self.buf[self.head] = c;
            self.head = head;
        }
    }

    /// Pop one byte together with its flag bit.
    pub fn get(&mut self) -> Option<(u8, bool)> {
        if self.is_empty() {
            return None;
        }
        let flagged = self.clear_flag(self.tail);
        let c = self.buf[self.tail];
        self.tail = inc(self.tail);
        Some((c, flagged))
    }

    pub fn set_flag(&mut self, idx: usize) {
        self.flags[idx / 64] |= 1 << (idx % 64);
    }

    /// Clear and return the previous flag state, mirroring the
    /// test-and-clear bit op of the original queues.
    pub fn clear_flag(&mut self, idx: usize) -> bool {
        let word = &mut self.flags[idx / 64];
        let bit = 1u64 << (idx % 64);
        let was = *word & bit != 0;
        *word &= !bit;
        was
    }

    pub fn flag_at(&self, idx: usize) -> bool {
        self.flags[idx / 64] & (1 << (idx % 64)) != 0
    }

    /// Whether `idx` lies inside the used region [tail, head).
    pub fn in_use(&self, idx: usize) -> bool {
        if self.head >= self.tail {
            idx >= self.tail && idx < self.head
        } else {
            idx >= self.tail || idx < self.head
        }
    }

    /// Drop everything, flags included.
    pub fn flush(&mut self) {
        self.head = self.tail;
        self.flags = [0; TTY_BUF_SIZE / 64];
    }

    /// Count flag bits set in [from, to).
    pub fn flags_between(&self, from: usize, to: usize) -> usize {
        let mut n = 0;
        let mut i = from;
        while i != to {
            if self.flag_at(i) {
                n += 1;
            }
            i = inc(i);
        }
        n
    }
}

impl Default for QueueInner {
    fn default() -> Self {
        Self::new()
    }
}

/// A tty queue: the ring plus the wait list of parked readers or
/// writers.
pub struct TtyQueue {
    pub inner: Mutex<QueueInner>,
    pub wait: WaitQueue,
}

impl TtyQueue {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::new()),
            wait: WaitQueue::new(),
        }
    }

    pub fn put(&self, c: u8) {
        self.inner.lock().put(c);
    }

    pub fn put_flagged(&self, c: u8) {
        self.inner.lock().put_flagged(c);
    }

    pub fn get(&self) -> Option<(u8, bool)> {
        self.inner.lock().get()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().is_full()
    }

    pub fn chars(&self) -> usize {
        self.inner.lock().chars()
    }

    pub fn left(&self) -> usize {
        self.inner.lock().left()
    }

    pub fn flush(&self) {
        self.inner.lock().flush();
    }
}

impl Default for TtyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_full_discipline() {
        let mut q = QueueInner::new();
        assert!(q.is_empty());
        assert_eq!(q.left(), TTY_BUF_SIZE - 1);
        for i in 0..TTY_BUF_SIZE - 1 {
            assert!(!q.is_full(), "filled early at {}", i);
            q.put(i as u8);
        }
        assert!(q.is_full());
        assert_eq!(q.left(), 0);
        // A put into a full ring is dropped.
        q.put(0xAA);
        assert_eq!(q.chars(), TTY_BUF_SIZE - 1);
    }

    #[test]
    fn test_wraparound_order() {
        let mut q = QueueInner::new();
        for round in 0..3 {
            for i in 0..700u32 {
                q.put((round ^ i) as u8);
            }
            for i in 0..700u32 {
                let (c, flagged) = q.get().unwrap();
                assert_eq!(c, (round ^ i) as u8);
                assert!(!flagged);
            }
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_flag_bitmap() {
        let mut q = QueueInner::new();
        q.put(b'a');
        q.put_flagged(b'b');
        q.put(b'c');
        assert_eq!(q.get(), Some((b'a', false)));
        assert_eq!(q.get(), Some((b'b', true)));
        // The flag was consumed with its byte.
        assert_eq!(q.get(), Some((b'c', false)));
    }

    #[test]
    fn test_flags_cleared_on_flush() {
        let mut q = QueueInner::new();
        q.put_flagged(b'x');
        q.flush();
        q.put(b'y');
        assert_eq!(q.get(), Some((b'y', false)));
    }

    #[test]
    fn test_flags_between() {
        let mut q = QueueInner::new();
        let start = q.head;
        q.put(b'a');
        q.put_flagged(b'\n');
        q.put(b'b');
        q.put_flagged(b'\n');
        assert_eq!(q.flags_between(start, q.head), 2);
    }
}

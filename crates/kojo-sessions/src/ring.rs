//! Scrollback ring buffer.
//!
//! Keeps the last N bytes of session output so a subscriber attaching late
//! still sees recent history.

use std::sync::Mutex;

/// Default scrollback capacity (1 MiB).
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// Fixed-capacity byte ring. Writes overwrite the oldest data once the
/// buffer is full; snapshots return a chronological copy.
pub struct RingBuffer {
    inner: Mutex<Inner>,
}

struct Inner {
    data: Vec<u8>,
    capacity: usize,
    /// Next write position.
    head: usize,
    /// Bytes stored, at most `capacity`.
    len: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                data: vec![0; capacity],
                capacity,
                head: 0,
                len: 0,
            }),
        }
    }

    /// Append bytes, overwriting the oldest data when full. Never fails.
    pub fn write(&self, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let cap = inner.capacity;

        // Only the last `capacity` bytes of an oversized write can survive.
        let src = if data.len() > cap {
            &data[data.len() - cap..]
        } else {
            data
        };

        let head = inner.head;
        let first = (cap - head).min(src.len());
        inner.data[head..head + first].copy_from_slice(&src[..first]);
        let rest = src.len() - first;
        if rest > 0 {
            inner.data[..rest].copy_from_slice(&src[first..]);
        }
        inner.head = (head + src.len()) % cap;
        inner.len = (inner.len + src.len()).min(cap);
    }

    /// Copy of the current contents in chronological order.
    pub fn snapshot(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let start = (inner.head + inner.capacity - inner.len) % inner.capacity;
        let mut out = Vec::with_capacity(inner.len);
        if start + inner.len <= inner.capacity {
            out.extend_from_slice(&inner.data[start..start + inner.len]);
        } else {
            out.extend_from_slice(&inner.data[start..]);
            out.extend_from_slice(&inner.data[..inner.head]);
        }
        out
    }

    /// The trailing `n` bytes of the current contents.
    pub fn tail(&self, n: usize) -> Vec<u8> {
        let mut snap = self.snapshot();
        if snap.len() > n {
            snap.split_off(snap.len() - n)
        } else {
            snap
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot() {
        let buf = RingBuffer::new(16);
        assert!(buf.is_empty());
        assert!(buf.snapshot().is_empty());
    }

    #[test]
    fn snapshot_equals_writes_below_capacity() {
        let buf = RingBuffer::new(64);
        buf.write(b"hello ");
        buf.write(b"world");
        assert_eq!(buf.snapshot(), b"hello world");
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn wraparound_keeps_newest_bytes() {
        let buf = RingBuffer::new(10);
        buf.write(b"12345678");
        buf.write(b"abcd");
        assert_eq!(buf.len(), 10);
        assert_eq!(buf.snapshot(), b"345678abcd");
    }

    #[test]
    fn oversized_write_keeps_tail() {
        let buf = RingBuffer::new(5);
        buf.write(b"this is way too long");
        assert_eq!(buf.snapshot(), b" long");
    }

    #[test]
    fn snapshot_never_exceeds_capacity() {
        let buf = RingBuffer::new(8);
        for _ in 0..100 {
            buf.write(b"abc");
        }
        assert!(buf.snapshot().len() <= buf.capacity());
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn tail_returns_trailing_bytes() {
        let buf = RingBuffer::new(32);
        buf.write(b"0123456789");
        assert_eq!(buf.tail(4), b"6789");
        assert_eq!(buf.tail(100), b"0123456789");
    }

    #[test]
    fn concurrent_writes_and_snapshots() {
        use std::sync::Arc;

        let buf = Arc::new(RingBuffer::new(256));
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let buf = buf.clone();
                std::thread::spawn(move || {
                    let chunk = [b'a' + i as u8; 16];
                    for _ in 0..100 {
                        buf.write(&chunk);
                    }
                })
            })
            .collect();

        for _ in 0..100 {
            let snap = buf.snapshot();
            assert!(snap.len() <= 256);
        }
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(buf.len(), 256);
    }
}

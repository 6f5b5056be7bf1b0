//! Fixed-capacity byte ring between the network receive path and the render tick.
//!
//! One writer (inbound server audio) and one reader (playback tick). Writes
//! never fail: when a write does not fit, the oldest buffered bytes are
//! dropped so playback latency stays bounded. Reads never block on data and
//! zero-fill whatever the buffer cannot supply.
//!
//! The lock is held only for the memcpy of a single read or write, so the
//! render tick waits at most one frame-sized copy.

use std::sync::{Mutex, MutexGuard};

struct Inner {
    data: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    count: usize,
}

/// Lossy single-producer/single-consumer byte ring.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl RingBuffer {
    /// Creates an empty ring holding at most `capacity` bytes.
    ///
    /// The capacity is rounded up to a whole number of PCM16 samples (at
    /// least one), so overflow always discards complete samples.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_multiple_of(2);
        Self {
            inner: Mutex::new(Inner {
                data: vec![0u8; capacity].into_boxed_slice(),
                read_pos: 0,
                write_pos: 0,
                count: 0,
            }),
            capacity,
        }
    }

    /// Ring capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // A panic while holding the lock cannot leave the cursors half-updated in a
    // way that breaks the invariants below, so a poisoned lock is reused.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copies `bytes` into the ring, overwriting the oldest data on overflow.
    ///
    /// If `bytes` alone exceeds the capacity only its trailing `capacity`
    /// bytes are kept.
    pub fn write(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let cap = self.capacity;
        let src = if bytes.len() > cap {
            &bytes[bytes.len() - cap..]
        } else {
            bytes
        };

        let mut inner = self.lock();
        let overflow = (inner.count + src.len()).saturating_sub(cap);
        if overflow > 0 {
            inner.read_pos = (inner.read_pos + overflow) % cap;
            inner.count -= overflow;
        }

        let start = inner.write_pos;
        let first = src.len().min(cap - start);
        inner.data[start..start + first].copy_from_slice(&src[..first]);
        let rest = src.len() - first;
        if rest > 0 {
            inner.data[..rest].copy_from_slice(&src[first..]);
        }
        inner.write_pos = (start + src.len()) % cap;
        inner.count += src.len();
    }

    /// Fills `out` with buffered bytes in FIFO order, zero-filling any shortfall.
    ///
    /// Returns how many bytes came from the ring (the rest of `out` is silence).
    pub fn read_into(&self, out: &mut [u8]) -> usize {
        let cap = self.capacity;
        let mut inner = self.lock();
        let n = out.len().min(inner.count);

        let start = inner.read_pos;
        let first = n.min(cap - start);
        out[..first].copy_from_slice(&inner.data[start..start + first]);
        let rest = n - first;
        if rest > 0 {
            out[first..n].copy_from_slice(&inner.data[..rest]);
        }
        inner.read_pos = (start + n) % cap;
        inner.count -= n;
        drop(inner);

        out[n..].fill(0);
        n
    }

    /// Reads exactly `len` bytes: buffered data first, zeros after.
    pub fn read(&self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read_into(&mut out);
        out
    }

    /// Drops all buffered data.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.read_pos = 0;
        inner.write_pos = 0;
        inner.count = 0;
    }

    /// Snapshot of the number of buffered bytes.
    pub fn available_bytes(&self) -> usize {
        self.lock().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_writes_within_capacity_read_back_in_order() {
        let ring = RingBuffer::new(64);
        let a = pattern(10, 1);
        let b = pattern(20, 50);
        let c = pattern(34, 100);
        ring.write(&a);
        ring.write(&b);
        ring.write(&c);
        assert_eq!(ring.available_bytes(), 64);

        let expected: Vec<u8> = [a, b, c].concat();
        assert_eq!(ring.read(64), expected);
        assert_eq!(ring.available_bytes(), 0);
    }

    #[test]
    fn test_overflow_keeps_latest_capacity_bytes() {
        let ring = RingBuffer::new(16);
        let data = pattern(16 + 5, 0);
        ring.write(&data[..10]);
        ring.write(&data[10..]);

        assert_eq!(ring.available_bytes(), 16);
        assert_eq!(ring.read(16), data[5..].to_vec());
    }

    #[test]
    fn test_single_write_larger_than_capacity() {
        let ring = RingBuffer::new(8);
        let data = pattern(20, 3);
        ring.write(&data);
        assert_eq!(ring.available_bytes(), 8);
        assert_eq!(ring.read(8), data[12..].to_vec());
    }

    #[test]
    fn test_underrun_zero_fills_remainder() {
        let ring = RingBuffer::new(32);
        ring.write(&[7, 8, 9]);

        let out = ring.read(6);
        assert_eq!(out, vec![7, 8, 9, 0, 0, 0]);
        assert_eq!(ring.available_bytes(), 0);
    }

    #[test]
    fn test_read_from_empty_is_all_zeros() {
        let ring = RingBuffer::new(4);
        let mut out = [0xAAu8; 10];
        let filled = ring.read_into(&mut out);
        assert_eq!(filled, 0);
        assert_eq!(out, [0u8; 10]);
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let ring = RingBuffer::new(10);
        ring.write(&pattern(7, 0));
        assert_eq!(ring.read(5), pattern(5, 0));

        // write cursor at 7, read cursor at 5: this write wraps
        let tail = pattern(8, 40);
        ring.write(&tail);
        assert_eq!(ring.available_bytes(), 10);

        let mut expected = pattern(7, 0)[5..].to_vec();
        expected.extend_from_slice(&tail);
        assert_eq!(ring.read(10), expected);
    }

    #[test]
    fn test_clear_resets_everything() {
        let ring = RingBuffer::new(16);
        ring.write(&pattern(12, 9));
        ring.clear();
        assert_eq!(ring.available_bytes(), 0);
        assert_eq!(ring.read(4), vec![0, 0, 0, 0]);

        ring.write(&[1, 2]);
        assert_eq!(ring.read(2), vec![1, 2]);
    }

    #[test]
    fn test_zero_capacity_is_usable() {
        let ring = RingBuffer::new(0);
        assert_eq!(ring.capacity(), 2);
        ring.write(&[1, 2, 3, 4]);
        assert_eq!(ring.read(2), vec![3, 4]);
    }

    #[test]
    fn test_odd_capacity_rounds_up_to_whole_samples() {
        let ring = RingBuffer::new(7);
        assert_eq!(ring.capacity(), 8);

        // Overflow drops whole samples, so 16-bit values stay intact.
        let samples: Vec<u8> = [1i16, 2, 3, 4, 5, 6]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        ring.write(&samples);
        let tail: Vec<i16> = ring
            .read(8)
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(tail, vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_clear_is_observed_by_concurrent_reader() {
        let ring = Arc::new(RingBuffer::new(4096));
        ring.write(&pattern(4096, 1));

        let reader = Arc::clone(&ring);
        let handle = thread::spawn(move || {
            let mut out = [0u8; 64];
            reader.read_into(&mut out);
        });
        ring.clear();
        handle.join().unwrap();

        assert_eq!(ring.available_bytes(), 0);
    }

    #[test]
    fn test_concurrent_writer_and_reader_preserve_byte_stream() {
        // Writer never outruns capacity here, so every byte must arrive in order.
        let ring = Arc::new(RingBuffer::new(1 << 16));
        let total = 20_000usize;
        let writer_ring = Arc::clone(&ring);

        let writer = thread::spawn(move || {
            let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
            for chunk in data.chunks(100) {
                writer_ring.write(chunk);
            }
        });

        let mut received = Vec::with_capacity(total);
        let mut buf = [0u8; 64];
        while received.len() < total {
            let n = ring.read_into(&mut buf);
            received.extend_from_slice(&buf[..n]);
            if n == 0 {
                thread::yield_now();
            }
        }
        writer.join().unwrap();

        let expected: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        assert_eq!(received, expected);
    }
}

//! Double-buffered snapshots for GUI reads.
//!
//! The single writer (audio thread) fills the back buffer and publishes it
//! with one atomic store. Readers copy the published buffer without blocking;
//! a per-buffer sequence counter catches the rare wrap-around where a
//! publish happens mid-copy, in which case the reader retries.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

pub struct AtomicSwapBuffer<T> {
    buffers: [UnsafeCell<T>; 2],
    seq: [AtomicU32; 2],
    published: AtomicUsize,
    back_dirty: bool,
}

// Safety: readers only access the published buffer through the seq-guarded
// copy in `read`; the writer side requires &mut self.
unsafe impl<T: Copy + Send> Sync for AtomicSwapBuffer<T> {}
unsafe impl<T: Copy + Send> Send for AtomicSwapBuffer<T> {}

impl<T: Copy + Default> Default for AtomicSwapBuffer<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy> AtomicSwapBuffer<T> {
    pub fn new(initial: T) -> Self {
        Self {
            buffers: [UnsafeCell::new(initial), UnsafeCell::new(initial)],
            seq: [AtomicU32::new(0), AtomicU32::new(0)],
            published: AtomicUsize::new(0),
            back_dirty: false,
        }
    }

    /// Writer: mutable access to the back buffer. May be called repeatedly
    /// before `publish`.
    pub fn write(&mut self) -> &mut T {
        let back = 1 - self.published.load(Ordering::Relaxed);
        if !self.back_dirty {
            // Odd sequence marks the buffer as mid-write.
            self.seq[back].fetch_add(1, Ordering::Release);
            self.back_dirty = true;
        }
        self.buffers[back].get_mut()
    }

    /// Writer: make the back buffer visible to readers.
    pub fn publish(&mut self) {
        let back = 1 - self.published.load(Ordering::Relaxed);
        if self.back_dirty {
            self.seq[back].fetch_add(1, Ordering::Release);
            self.back_dirty = false;
        }
        self.published.store(back, Ordering::Release);
    }

    /// Reader: copy of the most recently published value.
    pub fn read(&self) -> T {
        loop {
            let index = self.published.load(Ordering::Acquire);
            let seq_before = self.seq[index].load(Ordering::Acquire);
            if seq_before % 2 != 0 {
                std::hint::spin_loop();
                continue;
            }
            // Safety: the copy is validated by re-reading the sequence
            // counter below; a torn read is discarded and retried.
            let value = unsafe { std::ptr::read_volatile(self.buffers[index].get()) };
            std::sync::atomic::fence(Ordering::Acquire);
            if self.seq[index].load(Ordering::Relaxed) == seq_before {
                return value;
            }
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn read_returns_last_published_value() {
        let mut buffer = AtomicSwapBuffer::new([0u64; 4]);
        *buffer.write() = [1, 2, 3, 4];
        buffer.publish();
        assert_eq!(buffer.read(), [1, 2, 3, 4]);

        // Writing without publishing leaves the reader on the old value.
        *buffer.write() = [9, 9, 9, 9];
        assert_eq!(buffer.read(), [1, 2, 3, 4]);
        buffer.publish();
        assert_eq!(buffer.read(), [9, 9, 9, 9]);
    }

    #[test]
    fn concurrent_reads_never_see_torn_values() {
        // Each published snapshot holds the same value in every lane, so a
        // mixed-lane read proves a tear. The single writer gets mutable
        // access through an UnsafeCell, mirroring how the audio thread owns
        // the pool while GUI threads read.
        struct Shared(UnsafeCell<AtomicSwapBuffer<[u64; 8]>>);
        unsafe impl Sync for Shared {}
        unsafe impl Send for Shared {}

        let shared = Arc::new(Shared(UnsafeCell::new(AtomicSwapBuffer::new([0u64; 8]))));
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let shared = Arc::clone(&shared);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        // Safety: read() only touches the seq-guarded path.
                        let buffer = unsafe { &*shared.0.get() };
                        let snapshot = buffer.read();
                        let first = snapshot[0];
                        assert!(
                            snapshot.iter().all(|&v| v == first),
                            "torn read: {:?}",
                            snapshot
                        );
                    }
                })
            })
            .collect();

        let writer = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                // Safety: this is the only thread taking mutable access.
                let buffer = unsafe { &mut *shared.0.get() };
                for i in 0..200_000u64 {
                    *buffer.write() = [i; 8];
                    buffer.publish();
                }
            })
        };

        writer.join().unwrap();
        stop.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }
    }
}

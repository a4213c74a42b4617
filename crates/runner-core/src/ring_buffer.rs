//! Bounded ring of device-resident expert-weight slots used by layerwise
//! prefill to stream CPU-resident experts onto the GPU a bounded window at
//! a time.
//!
//! Grounded on `utils/ring_buffer.py::RingBufferMgr` (`reset`, `on_push`,
//! `pop`, `slot_available`), with a pop-on-drop RAII guard around the
//! claimed slot.

use std::sync::Mutex;

struct Inner {
    length: usize,
    ptr: usize,
    n_used: usize,
}

pub struct RingBuffer {
    inner: Mutex<Inner>,
}

impl RingBuffer {
    pub fn new(length: usize) -> Self {
        Self { inner: Mutex::new(Inner { length, ptr: 0, n_used: 0 }) }
    }

    pub fn reset(&self, length: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.length = length;
        inner.ptr = 0;
        inner.n_used = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().length
    }

    pub fn n_used(&self) -> usize {
        self.inner.lock().unwrap().n_used
    }

    pub fn slot_available(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.n_used < inner.length
    }

    /// Claims the next ring slot, wrapping the write pointer mod `length`.
    /// Panics if no slot is free — callers must check `slot_available`
    /// first, matching the original's unguarded pointer advance.
    pub fn on_push(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        assert!(inner.n_used < inner.length, "ring buffer push with no free slot");
        let slot = inner.ptr;
        inner.ptr = (inner.ptr + 1) % inner.length;
        inner.n_used += 1;
        slot
    }

    fn pop(&self) {
        let mut inner = self.inner.lock().unwrap();
        assert!(inner.n_used > 0, "ring buffer pop with nothing pushed");
        inner.n_used -= 1;
    }
}

/// RAII guard for a claimed ring slot: dropping it calls `pop`.
pub struct RingSlot<'a> {
    buffer: &'a RingBuffer,
    pub slot: usize,
}

impl RingBuffer {
    pub fn push(&self) -> RingSlot<'_> {
        let slot = self.on_push();
        RingSlot { buffer: self, slot }
    }
}

impl Drop for RingSlot<'_> {
    fn drop(&mut self) {
        self.buffer.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_drop_frees_slot() {
        let rb = RingBuffer::new(2);
        assert!(rb.slot_available());
        let s0 = rb.push();
        let s1 = rb.push();
        assert!(!rb.slot_available());
        assert_eq!(s0.slot, 0);
        assert_eq!(s1.slot, 1);
        drop(s0);
        assert!(rb.slot_available());
        assert_eq!(rb.n_used(), 1);
    }

    #[test]
    fn push_wraps_mod_length() {
        let rb = RingBuffer::new(2);
        let s0 = rb.push();
        drop(s0);
        let s1 = rb.push();
        assert_eq!(s1.slot, 1);
        drop(s1);
        let s2 = rb.push();
        assert_eq!(s2.slot, 0);
    }

    #[test]
    #[should_panic(expected = "no free slot")]
    fn push_beyond_capacity_panics() {
        let rb = RingBuffer::new(1);
        let _s0 = rb.push();
        let _s1 = rb.push();
    }
}

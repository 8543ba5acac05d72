use std::collections::VecDeque;

/// Bounded FIFO of received bytes plus the "data ready" flag.
///
/// Not synchronized on its own; the driver keeps it behind its state lock.
#[derive(Debug)]
pub struct ReceiveBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
    ready: bool,
    overruns: u64,
}

impl ReceiveBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            ready: false,
            overruns: 0,
        }
    }

    /// Appends as much of `chunk` as fits and returns the number of bytes kept.
    ///
    /// Bytes past capacity are dropped, like a hardware overrun.
    pub fn push(&mut self, chunk: &[u8]) -> usize {
        let room = self.capacity - self.bytes.len();
        let kept = chunk.len().min(room);
        self.bytes.extend(&chunk[..kept]);
        let dropped = chunk.len() - kept;
        if dropped > 0 {
            self.overruns += dropped as u64;
            log::warn!("receive buffer full, dropped {dropped} bytes");
        }
        if kept > 0 {
            self.ready = true;
        }
        kept
    }

    /// Removes up to `max` bytes from the front, in arrival order.
    pub fn drain(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.bytes.len());
        let out: Vec<u8> = self.bytes.drain(..n).collect();
        if self.bytes.is_empty() {
            self.ready = false;
        }
        out
    }

    pub fn drain_into(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.bytes.len());
        for (slot, byte) in buf.iter_mut().zip(self.bytes.drain(..n)) {
            *slot = byte;
        }
        if self.bytes.is_empty() {
            self.ready = false;
        }
        n
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Discards unread bytes. The overrun counter survives.
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.ready = false;
    }
}

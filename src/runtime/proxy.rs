//! Shared pool of receive proxies.
//!
//! A `Proxy` owns one fixed-size receive buffer plus a marker recording
//! whether a receive into that buffer is in flight. Proxies are allocated
//! once, when the pool is built, and are lent to sessions for their whole
//! lifetime instead of allocating a buffer per connection.
//!
//! Ownership enforces the one-holder rule: a `Proxy` is not `Clone`, so the
//! session that acquired it is the only one able to receive into it, and it
//! can only come back through `ProxyPool::release`.

use crate::error::EngineError;
use parking_lot::Mutex;

/// A reusable receive buffer bound to at most one session at a time.
#[derive(Debug)]
pub struct Proxy {
    /// Slot index in the pool, stable for the proxy's lifetime.
    index: usize,
    /// Receive buffer storage.
    buffer: Box<[u8]>,
    /// Set while a receive into `buffer` is outstanding.
    receiving: bool,
}

impl Proxy {
    fn new(index: usize, size: usize) -> Self {
        Self {
            index,
            buffer: vec![0u8; size].into_boxed_slice(),
            receiving: false,
        }
    }

    /// Slot index in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Size of the receive buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Whether a receive is currently outstanding.
    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    /// Mark a receive as issued and hand out the buffer to read into.
    pub fn begin_receive(&mut self) -> &mut [u8] {
        debug_assert!(!self.receiving, "receive already in flight on proxy");
        self.receiving = true;
        &mut self.buffer
    }

    /// Acknowledge a completed receive of `n` bytes and return them.
    pub fn complete_receive(&mut self, n: usize) -> &[u8] {
        debug_assert!(self.receiving, "completion without an issued receive");
        self.receiving = false;
        &self.buffer[..n.min(self.buffer.len())]
    }

    /// Forget an issued receive whose completion will never be observed.
    pub fn abandon_receive(&mut self) {
        self.receiving = false;
    }
}

/// Fixed-capacity pool of proxies shared by every session of a server.
///
/// The free list is the only state mutated from multiple threads; every
/// operation takes the lock once.
pub struct ProxyPool {
    /// Stack of available proxies (LIFO for cache locality).
    free: Mutex<Vec<Proxy>>,
    capacity: usize,
    buffer_size: usize,
}

impl ProxyPool {
    /// Create a pool of `capacity` proxies with `buffer_size` byte buffers.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        // Reverse so that the first acquire gets slot 0.
        let free = (0..capacity)
            .rev()
            .map(|i| Proxy::new(i, buffer_size))
            .collect();

        Self {
            free: Mutex::new(free),
            capacity,
            buffer_size,
        }
    }

    /// Take a proxy from the pool.
    ///
    /// Fails with `PoolExhausted` instead of waiting; the caller rejects the
    /// connection.
    pub fn acquire(&self) -> Result<Proxy, EngineError> {
        self.free.lock().pop().ok_or(EngineError::PoolExhausted {
            capacity: self.capacity,
        })
    }

    /// Return a proxy to the pool.
    pub fn release(&self, mut proxy: Proxy) {
        debug_assert!(proxy.index < self.capacity, "proxy from another pool");
        debug_assert!(!proxy.receiving, "proxy released with a receive in flight");
        proxy.receiving = false;

        let mut free = self.free.lock();
        debug_assert!(free.len() < self.capacity, "proxy released twice");
        free.push(proxy);
    }

    /// Total number of proxies.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of proxies ready to be lent.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of proxies currently held by sessions.
    pub fn lent(&self) -> usize {
        self.capacity - self.available()
    }

    /// Size of each receive buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

//! Pooled datagram buffers with shared ownership.
//!
//! Each context owns one [`BufferPool`]. `acquire` hands out an exclusively owned
//!  [`PooledBuf`]; once the send path has written headers and payload, the buffer
//!  is frozen into a [`SharedBuffer`] whose (atomic) refcount is shared between
//!  the socket send, the retry queue and any other holders. When the last
//!  reference drops, the backing storage returns to the pool's free list.
//!
//! A buffer is either on the free list or owned by exactly one `PooledBuf` /
//!  `SharedBuffer` chain, never both.

use crate::buffers::fixed_buffer::FixedBuf;
use crate::config::DATAGRAM_SIZE;
use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};
use tracing::trace;

struct PoolShared {
    free: Mutex<Vec<FixedBuf>>,
}

impl PoolShared {
    fn give_back(&self, mut buf: FixedBuf) {
        buf.clear();
        self.free
            .lock()
            .expect("buffer pool free list poisoned")
            .push(buf);
    }
}

/// A pool of fixed-size datagram buffers with a LIFO free list. Process-local but
///  not global: each context owns its own pool.
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new() -> BufferPool {
        BufferPool {
            shared: Arc::new(PoolShared {
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Pops a buffer from the free list, or allocates a fresh one if the list is empty.
    pub fn acquire(&self) -> PooledBuf {
        let buf = {
            let mut free = self
                .shared
                .free
                .lock()
                .expect("buffer pool free list poisoned");
            free.pop()
        };

        let buf = match buf {
            Some(buf) => buf,
            None => {
                trace!("no buffer in pool: allocating a new one");
                FixedBuf::new(DATAGRAM_SIZE)
            }
        };

        PooledBuf {
            buf: Some(buf),
            pool: Arc::downgrade(&self.shared),
        }
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.shared.free.lock().unwrap().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// An exclusively owned pool buffer. The send path writes headers and payload in
///  place, then freezes it with [`PooledBuf::share`].
pub struct PooledBuf {
    buf: Option<FixedBuf>,
    pool: Weak<PoolShared>,
}

impl PooledBuf {
    fn buf(&self) -> &FixedBuf {
        self.buf.as_ref().expect("buffer present until drop")
    }

    fn buf_mut(&mut self) -> &mut FixedBuf {
        self.buf.as_mut().expect("buffer present until drop")
    }

    pub fn len(&self) -> usize {
        self.buf().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf().is_empty()
    }

    /// make the entire capacity addressable through as_mut()
    pub fn maximize_len(&mut self) {
        self.buf_mut().maximize_len();
    }

    pub fn truncate(&mut self, len: usize) {
        self.buf_mut().truncate(len);
    }

    /// Freezes the buffer at its current length, converting exclusive ownership into
    ///  shared ownership. No bytes are mutated after this point.
    pub fn share(self) -> SharedBuffer {
        SharedBuffer {
            inner: Arc::new(self),
        }
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.give_back(buf);
            }
        }
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self.buf().as_ref()
    }
}

impl AsMut<[u8]> for PooledBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        self.buf_mut().as_mut()
    }
}

unsafe impl bytes::BufMut for PooledBuf {
    fn remaining_mut(&self) -> usize {
        self.buf().remaining_mut()
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        self.buf_mut().advance_mut(cnt);
    }

    fn chunk_mut(&mut self) -> &mut bytes::buf::UninitSlice {
        self.buf_mut().chunk_mut()
    }
}

/// A read-only, cheaply cloneable handle to a frozen pool buffer. Safe to move
///  across threads; the storage is pinned until the last clone drops.
#[derive(Clone)]
pub struct SharedBuffer {
    inner: Arc<PooledBuf>,
}

impl Deref for SharedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.inner.as_ref().as_ref()
    }
}

impl AsRef<[u8]> for SharedBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Debug for SharedBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedBuffer({} bytes)", self.len())
    }
}

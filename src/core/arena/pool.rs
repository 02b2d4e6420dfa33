// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `RbufPool` — the per-receive-thread arena allocator.
//!
//! Holds at most one "current" `Rbuf`; it is replaced lazily the moment an
//! allocation doesn't fit. The retired buffer lingers, kept alive only by
//! the outstanding `Rmsg`s that still span it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::core::arena::rbuf::Rbuf;
use crate::core::arena::rmsg::Rmsg;

/// Bound on one received datagram's total footprint (payload plus derived
/// admin), used to decide whether a fresh `Rbuf` can ever satisfy it.
pub struct RbufPool {
    owner: ThreadId,
    rbuf_size: usize,
    max_rmsg_size: usize,
    current: Mutex<Arc<Rbuf>>,
    rbufs_allocated: AtomicUsize,
}

impl RbufPool {
    /// Bind a new pool to the calling thread.
    pub fn new(rbuf_size: usize, max_rmsg_size: usize) -> Self {
        assert!(
            max_rmsg_size <= rbuf_size,
            "max_rmsg_size must fit within one rbuf chunk"
        );
        Self {
            owner: std::thread::current().id(),
            rbuf_size,
            max_rmsg_size,
            current: Mutex::new(Arc::new(Rbuf::new(rbuf_size))),
            rbufs_allocated: AtomicUsize::new(1),
        }
    }

    fn assert_owner(&self) {
        debug_assert_eq!(
            std::thread::current().id(),
            self.owner,
            "RbufPool allocated from a thread other than its owner"
        );
    }

    pub fn rbufs_allocated(&self) -> usize {
        self.rbufs_allocated.load(Ordering::Relaxed)
    }

    /// Allocate an uncommitted `Rmsg` large enough to hold the first `len`
    /// bytes (the raw datagram). Replaces the current rbuf if it cannot fit.
    pub fn rmsg_new(&self, len: usize) -> (Arc<Rmsg>, *mut u8) {
        self.assert_owner();
        assert!(len <= self.max_rmsg_size, "datagram exceeds max_rmsg_size");
        let (rbuf, offset, ptr) = self.reserve(len);
        (Rmsg::new(rbuf, offset, len), ptr)
    }

    /// Allocate `len` more arena bytes attributed to `msg`, spilling into a
    /// fresh chunk if the current one is exhausted.
    pub fn rmsg_alloc(&self, msg: &Arc<Rmsg>, len: usize) -> *mut u8 {
        self.assert_owner();
        let (rbuf, offset, ptr) = self.reserve(len);
        msg.add_chunk(rbuf, offset, len);
        ptr
    }

    /// Reserve `len` bytes from the current rbuf, replacing it first if it
    /// cannot fit. Returns the owning rbuf, the byte offset reserved, and a
    /// pointer to the reserved span.
    fn reserve(&self, len: usize) -> (Arc<Rbuf>, usize, *mut u8) {
        let mut cur = self.current.lock();
        if cur.remaining() < len {
            let fresh = Arc::new(Rbuf::new(self.rbuf_size.max(len)));
            *cur = fresh;
            self.rbufs_allocated.fetch_add(1, Ordering::Relaxed);
        }
        let offset = cur.capacity() - cur.remaining();
        let ptr = cur.bump_alloc(len).expect("just-replaced rbuf must fit len");
        (cur.clone(), offset, ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rmsg_new_within_one_chunk() {
        let pool = RbufPool::new(1024, 512);
        let (msg, _ptr) = pool.rmsg_new(128);
        assert_eq!(msg.refcount(), crate::config::UNCOMMITTED_BIAS);
    }

    #[test]
    fn test_pool_replaces_rbuf_when_full() {
        let pool = RbufPool::new(64, 64);
        let (_m1, _p1) = pool.rmsg_new(40);
        assert_eq!(pool.rbufs_allocated(), 1);
        let (_m2, _p2) = pool.rmsg_new(40); // doesn't fit remaining 24 bytes
        assert_eq!(pool.rbufs_allocated(), 2);
    }

    #[test]
    #[should_panic(expected = "exceeds max_rmsg_size")]
    fn test_rmsg_new_rejects_oversize() {
        let pool = RbufPool::new(64, 32);
        let _ = pool.rmsg_new(33);
    }
}

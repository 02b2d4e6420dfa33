// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `Rmsg` — one inbound datagram plus all admin data derived from it.
//!
//! # Biased refcounting
//!
//! While the owning receive thread is still filling in an `Rmsg`, its
//! refcount carries [`UNCOMMITTED_BIAS`]; `commit` subtracts that bias once
//! the datagram has been fully parsed. Each `Rdata` created against the
//! message contributes [`RDATA_BIAS`] on creation rather than a plain `+1`,
//! so that defrag/reorder/dqueue accepting the `Rdata` during the
//! *synchronous* receive-thread pass costs zero additional atomic
//! operations — the bias already covers every downstream holder that might
//! show up. Once synchronous processing of one datagram is done, a single
//! [`Rmsg::adjust_rdata_bias`] call per `Rdata` corrects the refcount down
//! to the number of indexes that actually kept it (see
//! [`crate::core::arena::fragchain_adjust_refcount`]).
//!
//! The message frees itself — dropping its `Arc<Rbuf>` clone for every
//! chunk it spans — the moment its refcount reaches zero.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{RDATA_BIAS, UNCOMMITTED_BIAS};
use crate::core::arena::rbuf::Rbuf;

/// One physical span of bytes this message occupies inside some `Rbuf`.
struct ChunkSpan {
    rbuf: Arc<Rbuf>,
    #[allow(dead_code)]
    offset: usize,
    #[allow(dead_code)]
    len: usize,
}

/// A received datagram and everything allocated against it.
///
/// May span more than one [`Rbuf`] chunk if admin allocations made after
/// the original datagram copy exceed the current chunk's free space; all
/// spanned chunks are released together when the message's refcount hits
/// zero.
pub struct Rmsg {
    refcount: AtomicU32,
    size: AtomicUsize,
    committed: std::sync::atomic::AtomicBool,
    chunks: parking_lot::Mutex<Vec<ChunkSpan>>,
}

impl Rmsg {
    /// Construct a new uncommitted message already spanning `first`.
    pub(crate) fn new(first: Arc<Rbuf>, offset: usize, len: usize) -> Arc<Self> {
        Arc::new(Self {
            refcount: AtomicU32::new(UNCOMMITTED_BIAS),
            size: AtomicUsize::new(0),
            committed: std::sync::atomic::AtomicBool::new(false),
            chunks: parking_lot::Mutex::new(vec![ChunkSpan {
                rbuf: first,
                offset,
                len,
            }]),
        })
    }

    /// Record that admin allocation spilled into another chunk. Only the
    /// owning receive thread calls this, while the message is still
    /// uncommitted.
    pub(crate) fn add_chunk(&self, rbuf: Arc<Rbuf>, offset: usize, len: usize) {
        debug_assert!(
            !self.committed.load(Ordering::Relaxed),
            "cannot extend a committed rmsg"
        );
        self.chunks.lock().push(ChunkSpan { rbuf, offset, len });
    }

    /// Record the actual size of the inbound datagram once known.
    pub fn set_size(&self, n: usize) {
        self.size.store(n, Ordering::Relaxed);
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Release [`UNCOMMITTED_BIAS`], marking the message as fully parsed.
    /// Always safe to call; if any `Rdata` biases remain the chunk stays
    /// alive through them.
    pub fn commit(self: &Arc<Self>) {
        debug_assert!(!self.committed.swap(true, Ordering::AcqRel), "double commit");
        self.sub_and_maybe_free(UNCOMMITTED_BIAS);
    }

    /// Add [`RDATA_BIAS`] for a newly created `Rdata` referencing this
    /// message. Called exactly once per `Rdata`.
    pub fn add_rdata_bias(&self) {
        self.refcount.fetch_add(RDATA_BIAS, Ordering::AcqRel);
    }

    /// After synchronous processing of one `Rdata`, replace its bias with
    /// the number of indexes (`k`) that actually kept a reference:
    /// subtracts `RDATA_BIAS - k`.
    pub fn adjust_rdata_bias(self: &Arc<Self>, k: i64) {
        let delta = RDATA_BIAS as i64 - k;
        if delta >= 0 {
            self.sub_and_maybe_free(delta as u32);
        } else {
            self.refcount.fetch_add((-delta) as u32, Ordering::AcqRel);
        }
    }

    /// Drop one plain reference (e.g. a fragchain walk finished with it).
    pub fn unref(self: &Arc<Self>, n: u32) {
        self.sub_and_maybe_free(n);
    }

    fn sub_and_maybe_free(self: &Arc<Self>, n: u32) {
        let prev = self.refcount.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(prev >= n, "rmsg refcount underflow");
        if prev == n {
            self.free_chunks();
        }
    }

    fn free_chunks(&self) {
        self.chunks.lock().clear();
    }
}

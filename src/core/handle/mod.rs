// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide handle registry.
//!
//! Every DDS object is named by a compact `i32` handle. A [`HandleLink`]
//! packs a pin count, a ref count, and a handful of lifecycle flags into
//! one `AtomicU32`; every transition is a single CAS on the full word so
//! a racing delete always wins deterministically (see module-level
//! concurrency notes in [`crate::core`]).

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::config::{MAX_HANDLE_ALLOC_ATTEMPTS, MIN_PSEUDO_HANDLE, REFCOUNT_UNIT};
use crate::error::ReturnCode;

const PIN_MASK: u32 = 0x0FFF;
const REF_SHIFT: u32 = REFCOUNT_UNIT.trailing_zeros();
const REF_MASK: u32 = 0x3FFF << REF_SHIFT;
const NO_USER_ACCESS: u32 = 1 << 26;
const ALLOW_CHILDREN: u32 = 1 << 27;
const IMPLICIT: u32 = 1 << 28;
const PENDING: u32 = 1 << 29;
const DELETE_DEFERRED: u32 = 1 << 30;
const CLOSING: u32 = 1 << 31;

fn pin_count(word: u32) -> u32 {
    word & PIN_MASK
}

fn ref_count(word: u32) -> u32 {
    (word & REF_MASK) >> REF_SHIFT
}

fn with_pin_delta(word: u32, delta: i32) -> u32 {
    let pins = pin_count(word) as i32 + delta;
    debug_assert!(pins >= 0, "pin count underflow");
    (word & !PIN_MASK) | (pins as u32 & PIN_MASK)
}

fn with_ref_delta(word: u32, delta: i32) -> u32 {
    let refs = ref_count(word) as i32 + delta;
    debug_assert!(refs >= 0, "ref count underflow");
    (word & !REF_MASK) | (((refs as u32) << REF_SHIFT) & REF_MASK)
}

/// Per-entity handle slot: `{ handle, cnt_flags }`.
pub struct HandleLink {
    pub handle: i32,
    cnt_flags: AtomicU32,
}

impl HandleLink {
    pub fn pin_count(&self) -> u32 {
        pin_count(self.cnt_flags.load(Ordering::Acquire))
    }

    pub fn ref_count(&self) -> u32 {
        ref_count(self.cnt_flags.load(Ordering::Acquire))
    }

    pub fn is_closing(&self) -> bool {
        self.cnt_flags.load(Ordering::Acquire) & CLOSING != 0
    }

    pub fn is_pending(&self) -> bool {
        self.cnt_flags.load(Ordering::Acquire) & PENDING != 0
    }

    pub fn is_implicit(&self) -> bool {
        self.cnt_flags.load(Ordering::Acquire) & IMPLICIT != 0
    }

    pub fn allow_children(&self) -> bool {
        self.cnt_flags.load(Ordering::Acquire) & ALLOW_CHILDREN != 0
    }

    pub fn no_user_access(&self) -> bool {
        self.cnt_flags.load(Ordering::Acquire) & NO_USER_ACCESS != 0
    }
}

/// Outcome of [`HandleServer::pin_for_delete`].
pub enum PinForDeleteOutcome {
    /// The handle is now `CLOSING` with the caller holding the one
    /// remaining pin; proceed through interrupt/close_wait/close/delete.
    ProceedToClose(Arc<HandleLink>),
    /// A ref was dropped but others remain (or children remain); nothing
    /// to tear down yet. The deleting call itself returns `OK`.
    Deferred,
    /// `ALLOW_CHILDREN` is set and children remain; retry later.
    TryAgain,
}

/// Process-wide `handle -> HandleLink` table plus the drain condvar used
/// while waiting for a `CLOSING` handle's pins to reach one.
pub struct HandleServer {
    table: DashMap<i32, Arc<HandleLink>>,
    live_count: AtomicUsize,
    drain_lock: Mutex<()>,
    drain_cv: Condvar,
    next_probe: AtomicI32,
}

impl HandleServer {
    pub fn new() -> Self {
        Self {
            table: DashMap::new(),
            live_count: AtomicUsize::new(0),
            drain_lock: Mutex::new(()),
            drain_cv: Condvar::new(),
            next_probe: AtomicI32::new(1),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live_count.load(Ordering::Acquire)
    }

    pub fn is_quiescent(&self) -> bool {
        self.live_count() == 0
    }

    /// Register a new slot with `PENDING` set, pin count 1, and ref count
    /// 1 (0 if `implicit` — its lifetime is driven entirely by children).
    /// The handle value is a random nonzero 31-bit integer below the
    /// pseudo-handle range, retried on collision up to a bounded number
    /// of attempts.
    pub fn create(
        &self,
        implicit: bool,
        allow_children: bool,
        user_access: bool,
    ) -> Result<Arc<HandleLink>, ReturnCode> {
        for _ in 0..MAX_HANDLE_ALLOC_ATTEMPTS {
            let handle = self.random_handle();
            if let Some(link) = self.try_register(handle, implicit, allow_children, user_access) {
                return Ok(link);
            }
        }
        debug!("handle: exhausted {MAX_HANDLE_ALLOC_ATTEMPTS} allocation attempts");
        Err(ReturnCode::OutOfResources)
    }

    /// Register a caller-chosen handle (pseudo-handles like the library
    /// root). Fails with `BadParameter` if already taken.
    pub fn register_special(
        &self,
        handle: i32,
        allow_children: bool,
        user_access: bool,
    ) -> Result<Arc<HandleLink>, ReturnCode> {
        self.try_register(handle, false, allow_children, user_access)
            .ok_or(ReturnCode::BadParameter)
    }

    fn try_register(
        &self,
        handle: i32,
        implicit: bool,
        allow_children: bool,
        user_access: bool,
    ) -> Option<Arc<HandleLink>> {
        let mut word = PENDING | 1; // pin count 1
        if !implicit {
            word = with_ref_delta(word, 1);
        }
        if allow_children {
            word |= ALLOW_CHILDREN;
        }
        if implicit {
            word |= IMPLICIT;
        }
        if !user_access {
            word |= NO_USER_ACCESS;
        }
        let link = Arc::new(HandleLink {
            handle,
            cnt_flags: AtomicU32::new(word),
        });
        match self.table.entry(handle) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(link.clone());
                self.live_count.fetch_add(1, Ordering::AcqRel);
                Some(link)
            }
        }
    }

    fn random_handle(&self) -> i32 {
        loop {
            let h = fastrand::i32(1..MIN_PSEUDO_HANDLE);
            if h != 0 {
                return h;
            }
        }
    }

    /// Clear `PENDING` and drop the pin taken at creation time, making the
    /// handle generally pinnable.
    pub fn unpend(&self, link: &Arc<HandleLink>) {
        loop {
            let cur = link.cnt_flags.load(Ordering::Acquire);
            let next = with_pin_delta(cur & !PENDING, -1);
            if link
                .cnt_flags
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn lookup(&self, handle: i32) -> Option<Arc<HandleLink>> {
        self.table.get(&handle).map(|e| e.clone())
    }

    /// Increment the pin count if the slot is neither `CLOSING` nor
    /// `PENDING`. `from_user` additionally rejects `NO_USER_ACCESS` slots.
    pub fn pin(&self, handle: i32, from_user: bool) -> Result<Arc<HandleLink>, ReturnCode> {
        let link = self.lookup(handle).ok_or(ReturnCode::BadParameter)?;
        loop {
            let cur = link.cnt_flags.load(Ordering::Acquire);
            if cur & (CLOSING | PENDING) != 0 {
                return Err(ReturnCode::BadParameter);
            }
            if from_user && cur & NO_USER_ACCESS != 0 {
                return Err(ReturnCode::BadParameter);
            }
            let next = with_pin_delta(cur, 1);
            if link
                .cnt_flags
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(link);
            }
        }
    }

    /// Decrement the pin count; if `CLOSING` and the pin count reaches
    /// one (the deleter's own pin), wake anyone waiting in `close_wait`.
    pub fn unpin(&self, link: &Arc<HandleLink>) {
        loop {
            let cur = link.cnt_flags.load(Ordering::Acquire);
            let next = with_pin_delta(cur, -1);
            if link
                .cnt_flags
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if next & CLOSING != 0 && pin_count(next) == 1 {
                    let _guard = self.drain_lock.lock();
                    self.drain_cv.notify_all();
                }
                return;
            }
        }
    }

    /// Block until `link`'s pin count drains to one (the caller's own
    /// pin, held since `pin_for_delete` transitioned it to `CLOSING`).
    pub fn close_wait(&self, link: &Arc<HandleLink>) {
        let mut guard = self.drain_lock.lock();
        while pin_count(link.cnt_flags.load(Ordering::Acquire)) > 1 {
            self.drain_cv.wait(&mut guard);
        }
    }

    /// The pin-for-delete transition table (see module docs). `has_children`
    /// is supplied by the entity layer, which owns the parent-child tree.
    pub fn pin_for_delete(
        &self,
        handle: i32,
        explicit: bool,
        has_children: bool,
    ) -> Result<PinForDeleteOutcome, ReturnCode> {
        let link = self.lookup(handle).ok_or(ReturnCode::BadParameter)?;
        loop {
            let cur = link.cnt_flags.load(Ordering::Acquire);
            if cur & (CLOSING | PENDING) != 0 {
                return Err(ReturnCode::BadParameter);
            }

            let implicit = cur & IMPLICIT != 0;
            let allow_children = cur & ALLOW_CHILDREN != 0;

            if cur & DELETE_DEFERRED != 0 {
                if ref_count(cur) > 0 {
                    return Err(ReturnCode::AlreadyDeleted);
                }
                let next = with_pin_delta(cur, 1) | CLOSING;
                let next = next & !DELETE_DEFERRED;
                if self.try_commit(link.as_ref(), cur, next) {
                    return Ok(PinForDeleteOutcome::ProceedToClose(link));
                }
                continue;
            }

            if !explicit && !implicit {
                return Err(ReturnCode::IllegalOperation);
            }

            let closes_now = if implicit { true } else { ref_count(cur) == 1 };

            if closes_now && allow_children && has_children {
                // Children remain: defer closing, drop one ref (if any
                // is counted for this entity kind), retry later.
                let next = if implicit { cur } else { with_ref_delta(cur, -1) };
                if self.try_commit(link.as_ref(), cur, next) {
                    return Ok(PinForDeleteOutcome::TryAgain);
                }
                continue;
            }

            if implicit {
                let next = with_pin_delta(cur, 1) | CLOSING;
                if self.try_commit(link.as_ref(), cur, next) {
                    return Ok(PinForDeleteOutcome::ProceedToClose(link));
                }
            } else if ref_count(cur) == 1 {
                let next = with_pin_delta(with_ref_delta(cur, -1), 1) | CLOSING;
                if self.try_commit(link.as_ref(), cur, next) {
                    return Ok(PinForDeleteOutcome::ProceedToClose(link));
                }
            } else if ref_count(cur) > 1 {
                let next = with_ref_delta(cur, -1) | DELETE_DEFERRED;
                if self.try_commit(link.as_ref(), cur, next) {
                    return Ok(PinForDeleteOutcome::Deferred);
                }
            } else {
                return Err(ReturnCode::AlreadyDeleted);
            }
        }
    }

    fn try_commit(&self, link: &HandleLink, cur: u32, next: u32) -> bool {
        link.cnt_flags
            .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Final teardown: remove the hash entry and decrement the live count.
    /// Only called after `close_wait`/`close`/type-specific teardown.
    pub fn delete(&self, handle: i32) {
        if self.table.remove(&handle).is_some() {
            self.live_count.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Default for HandleServer {
    fn default() -> Self {
        Self::new()
    }
}

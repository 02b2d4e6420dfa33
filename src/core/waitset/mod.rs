// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Waitset attachment arrays and condvar-based blocking wait.
//!
//! Ported from the source's OS-eventfd-backed [`crate::core::rt::waitset`]
//! driver to a `parking_lot::Condvar` pairing, the same primitive
//! [`crate::core::dqueue`] blocks its worker on: the attachment array is
//! split in place into a triggered prefix and an untriggered suffix, and
//! an observer callback registered on each attached [`Condition`] moves
//! its slot into the prefix and broadcasts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::core::condition::Condition;
use crate::error::ReturnCode;

struct Attachment {
    attach_id: u64,
    observer_id: u64,
    condition: Arc<dyn Condition>,
    /// Opaque cookie returned to the caller of `wait_until` for this
    /// attachment (the original's `dds_attach_t`).
    arg: u64,
}

struct State {
    attachments: Vec<Attachment>,
    /// `attachments[..ntriggered]` is the triggered prefix.
    ntriggered: usize,
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl Inner {
    fn mark_triggered(&self, attach_id: u64) {
        let mut state = self.state.lock();
        if let Some(idx) = state.attachments[state.ntriggered..]
            .iter()
            .position(|a| a.attach_id == attach_id)
            .map(|i| i + state.ntriggered)
        {
            let ntriggered = state.ntriggered;
            state.attachments.swap(idx, ntriggered);
            state.ntriggered += 1;
            self.cv.notify_all();
        }
    }
}

/// A waitset: an attachment array plus the condvar the application's
/// `wait_until` call blocks on.
pub struct WaitSet {
    inner: Arc<Inner>,
}

impl WaitSet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    attachments: Vec::new(),
                    ntriggered: 0,
                }),
                cv: Condvar::new(),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Attach `condition`, to be reported with cookie `arg` once
    /// triggered. Returns an attach id usable with [`WaitSet::detach`].
    pub fn attach(&self, condition: Arc<dyn Condition>, arg: u64) -> u64 {
        let attach_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let weak_inner = Arc::downgrade(&self.inner);
        let observer_id = condition.add_observer(Arc::new(move || {
            if let Some(inner) = Weak::upgrade(&weak_inner) {
                inner.mark_triggered(attach_id);
            }
        }));
        let already_triggered = condition.get_trigger_value();

        let mut state = self.inner.state.lock();
        state.attachments.push(Attachment {
            attach_id,
            observer_id,
            condition,
            arg,
        });
        if already_triggered {
            let idx = state.attachments.len() - 1;
            let ntriggered = state.ntriggered;
            state.attachments.swap(idx, ntriggered);
            state.ntriggered += 1;
        }
        attach_id
    }

    pub fn detach(&self, attach_id: u64) {
        let mut state = self.inner.state.lock();
        if let Some(idx) = state.attachments.iter().position(|a| a.attach_id == attach_id) {
            let attachment = state.attachments.remove(idx);
            attachment.condition.remove_observer(attachment.observer_id);
            if idx < state.ntriggered {
                state.ntriggered -= 1;
            }
        }
    }

    /// Wake every blocked waiter without triggering any attachment; used
    /// when the waitset's own handle is being deleted.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let _guard = self.inner.state.lock();
        self.inner.cv.notify_all();
    }

    /// Block under the waitset's own lock (never an entity's) until the
    /// triggered prefix is non-empty, the deadline passes, or `close` is
    /// called. Returns the `arg` cookies of every currently-triggered
    /// attachment.
    pub fn wait_until(&self, deadline: Option<Instant>) -> Result<Vec<u64>, ReturnCode> {
        let mut state = self.inner.state.lock();
        loop {
            // Re-check the triggered prefix: a condition's status may
            // have been reset by the application between wait calls.
            let mut i = 0;
            while i < state.ntriggered {
                if state.attachments[i].condition.get_trigger_value() {
                    i += 1;
                } else {
                    state.ntriggered -= 1;
                    let ntriggered = state.ntriggered;
                    state.attachments.swap(i, ntriggered);
                }
            }

            if state.ntriggered > 0 {
                return Ok(state.attachments[..state.ntriggered]
                    .iter()
                    .map(|a| a.arg)
                    .collect());
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(ReturnCode::AlreadyDeleted);
            }
            match deadline {
                None => self.inner.cv.wait(&mut state),
                Some(d) => {
                    if self.inner.cv.wait_until(&mut state, d).timed_out() && state.ntriggered == 0
                    {
                        return Err(ReturnCode::Timeout);
                    }
                }
            }
        }
    }
}

impl Default for WaitSet {
    fn default() -> Self {
        Self::new()
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Entity variant record, parent-child tree, status bits and listeners.
//!
//! An [`Entity`] never holds a strong reference to its parent — only a
//! `Weak`, revalidated through the parent's own [`HandleLink`] on every
//! access — so the parent-child graph can never form an `Arc` cycle (see
//! module-level design notes in [`crate::core`]).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use log::{trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::core::condition::{Condition, StatusMask, StatusWord};
use crate::core::handle::{HandleLink, HandleServer, PinForDeleteOutcome};
use crate::error::ReturnCode;

/// Discriminant for the function-pointer table the original dispatches
/// entity-kind-specific behaviour through; here, a enum plus a trait
/// object ([`EntityOps`]) on each [`Entity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Participant,
    Publisher,
    Subscriber,
    Topic,
    Writer,
    Reader,
}

/// Entity-kind-specific teardown hooks. Default methods are no-ops so a
/// kind that overrides nothing needs no boilerplate impl.
pub trait EntityOps: Send + Sync {
    fn interrupt(&self, _entity: &Entity) {}
    fn close(&self, _entity: &Entity) {}
    fn delete(&self, _entity: &Entity) {}
}

/// The default deriver for kinds with nothing entity-specific to do on
/// teardown (e.g. `Topic`).
pub struct NoopOps;
impl EntityOps for NoopOps {}

type Listener = Arc<dyn Fn(&Entity, StatusMask) + Send + Sync>;
type Observer = Arc<dyn Fn() + Send + Sync>;

/// Serializes listener invocations per entity: at most one callback runs
/// at a time, and `wait_quiescent` lets a deleter wait out any in-flight
/// or queued invocation before tearing the entity down.
struct CallbackGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

struct GateState {
    active: bool,
    pending: u32,
}

impl CallbackGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                active: false,
                pending: 0,
            }),
            cv: Condvar::new(),
        }
    }

    fn enter(&self) {
        let mut s = self.state.lock();
        s.pending += 1;
        while s.active {
            self.cv.wait(&mut s);
        }
        s.pending -= 1;
        s.active = true;
    }

    fn exit(&self) {
        let mut s = self.state.lock();
        s.active = false;
        self.cv.notify_all();
    }

    fn wait_quiescent(&self) {
        let mut s = self.state.lock();
        while s.active || s.pending > 0 {
            self.cv.wait(&mut s);
        }
    }
}

/// One DDS entity: handle link, kind, parent-child position, status
/// word, listener, and the waitset observer list.
pub struct Entity {
    pub link: Arc<HandleLink>,
    pub kind: EntityKind,
    pub iid: u64,
    pub guid: [u8; 16],
    parent: Mutex<Option<Weak<Entity>>>,
    children: Mutex<BTreeMap<u64, Arc<Entity>>>,
    pub status: StatusWord,
    listener: Mutex<Option<Listener>>,
    callback_gate: CallbackGate,
    observers: Mutex<Vec<(u64, Observer)>>,
    next_observer_id: AtomicU64,
    /// Nonzero iff a waitset is attached to this entity (meaningful for
    /// `Subscriber`: gates whether child readers' DATA_AVAILABLE also
    /// raises this entity's DATA_ON_READERS).
    materialize_data_on_readers: AtomicI32,
    deriver: Arc<dyn EntityOps>,
}

impl Entity {
    fn new(
        link: Arc<HandleLink>,
        kind: EntityKind,
        iid: u64,
        guid: [u8; 16],
        parent: Option<Weak<Entity>>,
        deriver: Arc<dyn EntityOps>,
    ) -> Self {
        Self {
            link,
            kind,
            iid,
            guid,
            parent: Mutex::new(parent),
            children: Mutex::new(BTreeMap::new()),
            status: StatusWord::new(),
            listener: Mutex::new(None),
            callback_gate: CallbackGate::new(),
            observers: Mutex::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
            materialize_data_on_readers: AtomicI32::new(0),
            deriver,
        }
    }

    pub fn handle(&self) -> i32 {
        self.link.handle
    }

    pub fn parent(&self) -> Option<Arc<Entity>> {
        self.parent.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn children(&self) -> Vec<Arc<Entity>> {
        self.children.lock().values().cloned().collect()
    }

    pub fn set_listener(&self, cb: Option<Listener>) {
        *self.listener.lock() = cb;
    }

    /// Register a waitset (or any other) observer; returns an id usable
    /// with [`Entity::remove_observer`].
    pub fn add_observer(&self, f: Observer) -> u64 {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((id, f));
        id
    }

    pub fn remove_observer(&self, id: u64) {
        self.observers.lock().retain(|(oid, _)| *oid != id);
    }

    fn notify_observers(&self) {
        for (_, obs) in self.observers.lock().iter() {
            obs();
        }
    }

    fn invoke_listener(&self, mask: StatusMask) {
        let listener = self.listener.lock().clone();
        if let Some(cb) = listener {
            self.callback_gate.enter();
            cb(self, mask);
            self.callback_gate.exit();
        }
    }

    /// `status_set`: OR in a status bit; on the 0→1 edge, wake waitset
    /// observers and invoke the listener (serialized by the callback
    /// gate) if one is installed.
    pub fn raise_status(&self, mask: StatusMask) {
        if self.status.set(mask) {
            trace!("entity {}: status {:?} raised", self.handle(), mask.bits());
            self.notify_observers();
            self.invoke_listener(mask);
        }
    }

    pub fn reset_status(&self, mask: StatusMask) {
        self.status.reset(mask);
    }

    /// A waitset attaching to this (subscriber) entity: bump the
    /// materialization counter so child readers' DATA_AVAILABLE also
    /// raises DATA_ON_READERS here.
    pub fn materialize_attach(&self) -> i32 {
        self.materialize_data_on_readers.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// A waitset detaching: per the materialization ordering
    /// requirement, the counter change (and this entity's own signal)
    /// must be visible before any dependent reader is touched, so the
    /// decrement happens here and the caller must signal readers after
    /// this call returns, not before.
    pub fn materialize_detach(&self) -> i32 {
        let next = self.materialize_data_on_readers.fetch_sub(1, Ordering::AcqRel) - 1;
        self.notify_observers();
        next
    }

    pub fn materialize_count(&self) -> i32 {
        self.materialize_data_on_readers.load(Ordering::Acquire)
    }
}

impl Condition for Entity {
    fn get_trigger_value(&self) -> bool {
        self.status.visible(StatusMask::ALL)
    }

    fn condition_id(&self) -> u64 {
        self.handle() as u64
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn add_observer(&self, f: Arc<dyn Fn() + Send + Sync>) -> u64 {
        self.add_observer(f)
    }

    fn remove_observer(&self, id: u64) {
        self.remove_observer(id)
    }
}

/// A reader raising DATA_AVAILABLE also raises its subscriber's
/// DATA_ON_READERS, but only while a waitset is materializing it.
pub fn on_reader_data_available(reader: &Arc<Entity>, subscriber: &Arc<Entity>) {
    reader.raise_status(StatusMask::DATA_AVAILABLE);
    if subscriber.materialize_count() > 0 {
        subscriber.raise_status(StatusMask::DATA_ON_READERS);
    }
}

/// Process-wide entity table layered over a [`HandleServer`]: owns the
/// parent-child tree and drives the four-phase delete protocol.
pub struct EntityRegistry {
    handles: Arc<HandleServer>,
    by_handle: DashMap<i32, Arc<Entity>>,
    next_iid: AtomicU64,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self {
            handles: Arc::new(HandleServer::new()),
            by_handle: DashMap::new(),
            next_iid: AtomicU64::new(1),
        }
    }

    pub fn handles(&self) -> &Arc<HandleServer> {
        &self.handles
    }

    pub fn lookup(&self, handle: i32) -> Option<Arc<Entity>> {
        self.by_handle.get(&handle).map(|e| e.clone())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_entity(
        &self,
        kind: EntityKind,
        parent: Option<&Arc<Entity>>,
        implicit: bool,
        allow_children: bool,
        user_access: bool,
        guid: [u8; 16],
        deriver: Arc<dyn EntityOps>,
    ) -> Result<Arc<Entity>, ReturnCode> {
        let link = self.handles.create(implicit, allow_children, user_access)?;
        let iid = self.next_iid.fetch_add(1, Ordering::Relaxed);
        let entity = Arc::new(Entity::new(
            link.clone(),
            kind,
            iid,
            guid,
            parent.map(Arc::downgrade),
            deriver,
        ));
        if let Some(p) = parent {
            // Registration happens before handle_unpend below, matching
            // the source's "child visible to parent before it's usable".
            p.children.lock().insert(iid, entity.clone());
        }
        self.by_handle.insert(link.handle, entity.clone());
        self.handles.unpend(&link);
        Ok(entity)
    }

    /// Drive the four-phase delete protocol: interrupt, close_wait,
    /// close, delete. Children are torn down first (non-explicit,
    /// since their parent's own delete call is driving this). If this
    /// was the last child of an implicit parent, the parent is deleted
    /// in turn.
    pub fn delete(&self, handle: i32, explicit: bool) -> Result<(), ReturnCode> {
        let entity = self.lookup(handle).ok_or(ReturnCode::BadParameter)?;
        let has_children = !entity.children.lock().is_empty();
        match self.handles.pin_for_delete(handle, explicit, has_children)? {
            PinForDeleteOutcome::TryAgain => Err(ReturnCode::TryAgain),
            PinForDeleteOutcome::Deferred => Ok(()),
            PinForDeleteOutcome::ProceedToClose(link) => {
                entity.deriver.interrupt(&entity);
                self.handles.close_wait(&link);
                entity.callback_gate.wait_quiescent();

                let children = entity.children();
                for child in children {
                    if let Err(e) = self.delete(child.handle(), false) {
                        warn!(
                            "entity {}: child {} delete failed: {e}",
                            handle,
                            child.handle()
                        );
                    }
                }

                entity.deriver.close(&entity);
                entity.deriver.delete(&entity);

                let parent = entity.parent();
                if let Some(parent) = &parent {
                    parent.children.lock().remove(&entity.iid);
                }

                self.by_handle.remove(&handle);
                self.handles.delete(handle);

                if let Some(parent) = parent {
                    let parent_empty = parent.children.lock().is_empty();
                    if parent_empty && parent.link.is_implicit() {
                        let _ = self.delete(parent.handle(), false);
                    }
                }
                Ok(())
            }
        }
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> EntityRegistry {
        EntityRegistry::new()
    }

    #[test]
    fn test_create_and_delete_leaves_table_empty() {
        let reg = registry();
        let p = reg
            .create_entity(
                EntityKind::Participant,
                None,
                false,
                true,
                true,
                [0u8; 16],
                Arc::new(NoopOps),
            )
            .unwrap();
        assert!(reg.lookup(p.handle()).is_some());
        reg.delete(p.handle(), true).unwrap();
        assert!(reg.lookup(p.handle()).is_none());
        assert!(reg.handles().is_quiescent());
    }

    #[test]
    fn test_implicit_publisher_cascade_on_last_child_delete() {
        let reg = registry();
        let p = reg
            .create_entity(
                EntityKind::Participant,
                None,
                false,
                true,
                true,
                [0u8; 16],
                Arc::new(NoopOps),
            )
            .unwrap();
        let pub_ = reg
            .create_entity(
                EntityKind::Publisher,
                Some(&p),
                true, // implicit
                true,
                true,
                [1u8; 16],
                Arc::new(NoopOps),
            )
            .unwrap();
        let writer = reg
            .create_entity(
                EntityKind::Writer,
                Some(&pub_),
                false,
                false,
                true,
                [2u8; 16],
                Arc::new(NoopOps),
            )
            .unwrap();
        assert_eq!(pub_.link.ref_count(), 0);

        reg.delete(writer.handle(), true).unwrap();

        assert!(reg.lookup(writer.handle()).is_none());
        assert!(
            reg.lookup(pub_.handle()).is_none(),
            "implicit publisher should cascade-delete once its last child is gone"
        );
        assert!(
            reg.lookup(p.handle()).is_some(),
            "participant must survive the cascade"
        );
        reg.delete(p.handle(), true).unwrap();
    }

    #[test]
    fn test_delete_with_live_children_defers() {
        let reg = registry();
        let p = reg
            .create_entity(
                EntityKind::Participant,
                None,
                false,
                true,
                true,
                [0u8; 16],
                Arc::new(NoopOps),
            )
            .unwrap();
        let _topic = reg
            .create_entity(
                EntityKind::Topic,
                Some(&p),
                false,
                false,
                true,
                [3u8; 16],
                Arc::new(NoopOps),
            )
            .unwrap();
        // participant has ALLOW_CHILDREN and a live child: delete must
        // not close it yet.
        assert!(matches!(
            reg.delete(p.handle(), true),
            Err(ReturnCode::TryAgain)
        ));
        assert!(reg.lookup(p.handle()).is_some());
    }

    #[test]
    fn test_raise_status_invokes_listener_once_per_rising_edge() {
        let reg = registry();
        let p = reg
            .create_entity(
                EntityKind::Participant,
                None,
                false,
                true,
                true,
                [0u8; 16],
                Arc::new(NoopOps),
            )
            .unwrap();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let h2 = hits.clone();
        p.set_listener(Some(Arc::new(move |_e, _m| {
            h2.fetch_add(1, Ordering::SeqCst);
        })));
        p.raise_status(StatusMask::DATA_AVAILABLE);
        p.raise_status(StatusMask::DATA_AVAILABLE); // already set, no new edge
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        p.reset_status(StatusMask::DATA_AVAILABLE);
        p.raise_status(StatusMask::DATA_AVAILABLE);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_data_on_readers_materializes_only_when_attached() {
        let reg = registry();
        let p = reg
            .create_entity(
                EntityKind::Participant,
                None,
                false,
                true,
                true,
                [0u8; 16],
                Arc::new(NoopOps),
            )
            .unwrap();
        let sub = reg
            .create_entity(
                EntityKind::Subscriber,
                Some(&p),
                false,
                true,
                true,
                [1u8; 16],
                Arc::new(NoopOps),
            )
            .unwrap();
        let reader = reg
            .create_entity(
                EntityKind::Reader,
                Some(&sub),
                false,
                false,
                true,
                [2u8; 16],
                Arc::new(NoopOps),
            )
            .unwrap();

        on_reader_data_available(&reader, &sub);
        assert!(!sub.status.visible(StatusMask::DATA_ON_READERS));

        sub.materialize_attach();
        sub.reset_status(StatusMask::DATA_AVAILABLE);
        reader.reset_status(StatusMask::DATA_AVAILABLE);
        on_reader_data_available(&reader, &sub);
        assert!(sub.status.visible(StatusMask::DATA_ON_READERS));
    }
}

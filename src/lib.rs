// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # rtps-runtime
//!
//! Entity handle registry and RTPS receive-path pipeline core.
//!
//! This crate implements the two subsystems that sit underneath a full
//! DDS/RTPS stack's public API:
//!
//! - **Entity lifecycle.** A process-wide handle registry
//!   ([`core::handle`]) with pin/ref counting and a CAS-driven delete
//!   protocol, and an entity layer ([`core::entity`]) built on top of it
//!   with a parent-child tree, status bits, and listeners.
//! - **Receive-path pipeline.** Arena-allocated receive buffers
//!   ([`core::arena`]), fragment reassembly ([`core::defrag`]),
//!   per-writer sequence reordering ([`core::reorder`]), and a bounded
//!   delivery queue ([`core::dqueue`]) that hands completed samples to
//!   application threads off the receive thread's hot path.
//!
//! [`core::condition`] and [`core::waitset`] connect the two: entities
//! and guard conditions are waitset-attachable, and a waitset blocks an
//! application thread until one of its attachments triggers.
//!
//! ## Architecture
//!
//! ```text
//! +-----------------------------------------------------------------+
//! |                        Application Layer                        |
//! |         handle/entity create & delete | waitset wait_until       |
//! +-----------------------------------------------------------------+
//! |                  Receive Thread (one arena owner)                |
//! |   rbufpool -> rmsg/rdata -> defrag -> reorder -> dqueue::enqueue |
//! +-----------------------------------------------------------------+
//! |                    Delivery Queue Worker Thread                  |
//! |                dqueue::start(handler) -> rhc.store(...)          |
//! +-----------------------------------------------------------------+
//! ```
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`core::arena`] | Receive-buffer pool with biased atomic refcounting |
//! | [`core::defrag`] | Per-proxy-writer fragment reassembly |
//! | [`core::reorder`] | Per-writer sequence-number reordering index |
//! | [`core::dqueue`] | Bounded delivery queue, one worker thread |
//! | [`core::handle`] | Process-wide handle registry (pin/ref/CAS) |
//! | [`core::entity`] | Entity record, parent-child tree, status/listeners |
//! | [`core::condition`] | Status masks, the `Condition` trait, guard conditions |
//! | [`core::waitset`] | Attachment array, condvar-based blocking wait |
//! | [`config`] | Process-wide tunables (bias constants, capacities) |
//! | [`error`] | [`error::ReturnCode`], mirroring the DDS return-code table |

/// Process-wide tunables: bias constants, default capacities, pseudo-handle range.
pub mod config;
/// Core runtime components: arena, defrag, reorder, dqueue, handle, entity, condition, waitset.
pub mod core;
/// Error codes returned across the public surface.
pub mod error;

pub use error::{ReturnCode, Result};

pub use core::arena::{RbufPool, Rdata, Rmsg, SampleInfo};
pub use core::condition::{Condition, GuardCondition, StatusMask, StatusWord};
pub use core::defrag::{DefragIndex, DropPolicy, NackmapResult};
pub use core::dqueue::{Dqueue, Element};
pub use core::entity::{Entity, EntityKind, EntityOps, EntityRegistry};
pub use core::handle::{HandleLink, HandleServer, PinForDeleteOutcome};
pub use core::reorder::{ReorderIndex, ReorderMode, ReorderResult, ReorderSample, SampleEntry};
pub use core::waitset::WaitSet;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

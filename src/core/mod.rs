// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Core Runtime Components
//!
//! Low-level infrastructure shared by the entity registry and the RTPS
//! receive-path pipeline.
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `arena` | Receive pool: rbuf/rmsg/rdata with biased atomic refcounting |
//! | `defrag` | Fragment reassembler (per proxy-writer interval tree) |
//! | `reorder` | Per-writer sequence-number reordering index |
//! | `dqueue` | Bounded delivery queue with in-band bubble control messages |
//! | `handle` | Process-wide handle registry: pin/ref counting, deferred delete |
//! | `entity` | Entity variant record, parent-child tree, status bits and listeners |
//! | `condition` | Status masks, the `Condition` trait, guard conditions |
//! | `waitset` | Attachment array and condvar-based blocking wait |
//!
//! ## Architecture
//!
//! ```text
//! +-----------------------------------------------------+
//! |              handle / entity / condition /          |
//! |                      waitset                         |
//! +-----------------------------------------------------+
//! |     arena -> defrag -> reorder -> dqueue             |
//! |        (receive thread)   (delivery worker)          |
//! +-----------------------------------------------------+
//! ```

/// Arena receive pool: rbuf/rmsg/rdata with biased atomic refcounting.
pub mod arena;
/// Handle-addressable guard conditions and entity status/trigger masks.
pub mod condition;
/// Fragment reassembler (per proxy-writer interval tree).
pub mod defrag;
/// Bounded delivery queue with in-band bubble control messages.
pub mod dqueue;
/// Entity variant record, parent-child tree, status bits and listeners.
pub mod entity;
/// Process-wide handle registry: pin/ref counting, deferred delete.
pub mod handle;
/// Per-writer sequence-number reordering index.
pub mod reorder;
/// Waitset attachment arrays and condvar-based blocking wait.
pub mod waitset;

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Arena receive pool.
//!
//! Bump-allocates memory for inbound messages and the admin data derived
//! from them, with a biased-atomic-refcount scheme that keeps the
//! receive thread's synchronous fan-out into defrag/reorder/dqueue free of
//! per-insertion atomic operations. See [`rmsg`] for the biasing protocol.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `rbuf` | One bump-allocation chunk, released when its last rmsg drops |
//! | `rmsg` | One inbound datagram plus derived admin data |
//! | `rdata` | A pointer into an rmsg's bytes representing one fragment |
//! | `pool` | Per-receive-thread allocator binding rbuf + rmsg together |

pub mod pool;
pub mod rbuf;
pub mod rdata;
pub mod rmsg;

pub use pool::RbufPool;
pub use rdata::{fragchain_adjust_refcount, fragchain_unref, Rdata, SampleInfo};
pub use rmsg::Rmsg;

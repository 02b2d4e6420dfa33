// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Static tunables for the receive-path pipeline and handle registry.
//!
//! # Level 1 (Static)
//!
//! Constants below are the single source of truth for sizes and bit
//! layouts baked into the wire-adjacent data structures. NEVER hardcode
//! these values elsewhere — import from here.
//!
//! # Level 2 (Dynamic)
//!
//! [`RuntimeConfig`] holds the handful of values a caller may reasonably
//! want to tune per-deployment (pool sizes, queue depth). It does not load
//! from any file format; parsing configuration is an external concern.

/// Default size of one receive-buffer chunk (bytes).
pub const DEFAULT_RBUF_SIZE: usize = 1 << 20; // 1 MiB

/// Bias added to an `rmsg`'s refcount while the owning receive thread is
/// still filling it in. Subtracted on commit.
pub const UNCOMMITTED_BIAS: u32 = 1 << 31;

/// Bias added to an `rmsg`'s refcount per live `rdata` referencing it,
/// so that indexing into N downstream structures costs O(1) atomics
/// during synchronous receive-thread processing.
pub const RDATA_BIAS: u32 = 1 << 20;

/// Scale factor of the ref-count field packed into `cnt_flags`.
pub const REFCOUNT_UNIT: u32 = 1 << 12;

/// Handles at or above this value are reserved pseudo-handles
/// (library root, built-in topics) and are never assigned to
/// application-created entities.
pub const MIN_PSEUDO_HANDLE: i32 = 0x7000_0000;

/// The well-known pseudo-handle identifying the library root / domain
/// singleton, registered once via `handle_register_special`.
pub const CYCLONEDDS_HANDLE: i32 = MIN_PSEUDO_HANDLE;

/// Default per-proxy-writer sample cap for defrag and reorder indexes.
pub const DEFAULT_MAX_SAMPLES: usize = 256;

/// Default bound on a delivery queue's in-flight sample count.
pub const DEFAULT_DQUEUE_MAX_SAMPLES: usize = 4096;

/// Upper bound on handle-allocation collision retries before giving up
/// with `OutOfResources`. The handle space is large (31-bit, positive)
/// so exhaustion only happens under a pathological hash collision run.
pub const MAX_HANDLE_ALLOC_ATTEMPTS: u32 = 64;

/// Deployment-tunable values that don't belong in the static table above.
///
/// Constructed with sane defaults; override only what you need.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    pub rbuf_size: usize,
    pub defrag_max_samples: usize,
    pub reorder_max_samples: usize,
    pub dqueue_max_samples: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            rbuf_size: DEFAULT_RBUF_SIZE,
            defrag_max_samples: DEFAULT_MAX_SAMPLES,
            reorder_max_samples: DEFAULT_MAX_SAMPLES,
            dqueue_max_samples: DEFAULT_DQUEUE_MAX_SAMPLES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bias_constants_do_not_overlap_refcount_unit() {
        assert!(RDATA_BIAS < UNCOMMITTED_BIAS);
        assert!(REFCOUNT_UNIT < RDATA_BIAS);
    }

    #[test]
    fn test_pseudo_handle_range_is_positive_and_high() {
        assert!(MIN_PSEUDO_HANDLE > 0);
        assert_eq!(CYCLONEDDS_HANDLE, MIN_PSEUDO_HANDLE);
    }

    #[test]
    fn test_default_runtime_config() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.rbuf_size, DEFAULT_RBUF_SIZE);
        assert_eq!(cfg.dqueue_max_samples, DEFAULT_DQUEUE_MAX_SAMPLES);
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-writer sequence-number reordering index.
//!
//! Holds completed samples keyed by sequence number and decides when a
//! sample is deliverable. Has no lock of its own — callers serialize
//! access via the owning proxy-writer's mutex.

use std::collections::BTreeMap;

use log::debug;

use crate::core::arena::rdata::{Rdata, SampleInfo};

/// Delivery ordering mode, set per proxy-writer (primary) or per
/// out-of-sync reader match (secondary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderMode {
    /// Deliver only in strict sequence from `next_seq`.
    Normal,
    /// Deliver any seqno ≥ `next_seq` immediately; gap-tolerant.
    MonotonicallyIncreasing,
    /// Deliver every accepted sample regardless of order.
    AlwaysDeliver,
}

/// One entry in a delivered or stored chain: a real sample, or (when
/// `info` is `None`) a gap placeholder representing an acknowledged-absent
/// sequence number.
pub struct SampleEntry {
    pub seq: u64,
    pub info: Option<SampleInfo>,
    pub fragchain: Option<Box<Rdata>>,
}

impl SampleEntry {
    fn gap(seq: u64) -> Self {
        Self {
            seq,
            info: None,
            fragchain: None,
        }
    }
}

/// A run of consecutive sequence numbers `[min, maxp1)`, either pending in
/// the index or handed back for delivery.
pub struct ReorderSample {
    pub min: u64,
    pub maxp1: u64,
    pub entries: Vec<SampleEntry>,
}

impl ReorderSample {
    /// Wrap one completed data sample (as produced by defrag) into a
    /// single-entry run.
    pub fn data(seq: u64, size: u32, fragchain: Box<Rdata>) -> Self {
        Self {
            min: seq,
            maxp1: seq + 1,
            entries: vec![SampleEntry {
                seq,
                info: Some(SampleInfo { seq, size }),
                fragchain: Some(fragchain),
            }],
        }
    }

    /// Byte span `[min, maxp1)` covered by the first entry's fragchain;
    /// used to assert reassembly completeness in tests.
    pub fn fragchain_span(&self) -> (u32, u32) {
        let chain = self.entries[0]
            .fragchain
            .as_ref()
            .expect("data entry must carry a fragchain");
        let mut min = chain.min;
        let mut maxp1 = chain.maxp1;
        let mut cur = &chain.nextfrag;
        while let Some(r) = cur {
            min = min.min(r.min);
            maxp1 = maxp1.max(r.maxp1);
            cur = &r.nextfrag;
        }
        (min, maxp1)
    }

    /// Cheap duplication of just the first entry's fragchain for a
    /// secondary (per-out-of-sync-reader) reorder index; charges a fresh
    /// rdata bias on the shared `rmsg` for each duplicated node.
    pub fn dup_first(&self) -> ReorderSample {
        let first = &self.entries[0];
        ReorderSample {
            min: first.seq,
            maxp1: first.seq + 1,
            entries: vec![SampleEntry {
                seq: first.seq,
                info: first.info,
                fragchain: first.fragchain.as_ref().map(|c| Box::new(c.dup())),
            }],
        }
    }
}

/// Outcome of feeding a sample or gap into a [`ReorderIndex`].
pub enum ReorderResult {
    /// The sample plus any chained follow-on samples are now deliverable.
    Deliver(Vec<SampleEntry>),
    /// Stored; no delivery yet.
    Accept,
    /// Below `next_seq`; discarded.
    TooOld,
    /// Duplicate, capacity-limited, or delivery-full in late-ack mode.
    Reject,
}

impl ReorderResult {
    /// `n` from the spec's taxonomy: number of samples now deliverable,
    /// zero otherwise.
    pub fn n(&self) -> usize {
        match self {
            ReorderResult::Deliver(v) => v.len(),
            _ => 0,
        }
    }
}

/// Per proxy-writer (or per out-of-sync reader match) reordering index.
pub struct ReorderIndex {
    mode: ReorderMode,
    max_samples: usize,
    #[allow(dead_code)]
    late_ack_mode: bool,
    next_seq: u64,
    samples: BTreeMap<u64, ReorderSample>,
}

impl ReorderIndex {
    pub fn new(mode: ReorderMode, max_samples: usize, late_ack_mode: bool) -> Self {
        Self {
            mode,
            max_samples,
            late_ack_mode,
            next_seq: 1,
            samples: BTreeMap::new(),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    /// Accept a completed sample. `refcount_adjust` is incremented by the
    /// caller's accumulator once per sample actually stored or forwarded;
    /// the caller applies `fragchain_adjust_refcount` with the final total
    /// after calling every (primary and secondary) reorder for this rdata.
    pub fn rsample(
        &mut self,
        sample: ReorderSample,
        refcount_adjust: &mut i64,
        delivery_full: bool,
    ) -> ReorderResult {
        match self.mode {
            ReorderMode::AlwaysDeliver => {
                *refcount_adjust += sample.entries.len() as i64;
                ReorderResult::Deliver(sample.entries)
            }
            ReorderMode::MonotonicallyIncreasing => {
                if sample.min < self.next_seq {
                    return ReorderResult::TooOld;
                }
                self.next_seq = sample.maxp1;
                *refcount_adjust += sample.entries.len() as i64;
                ReorderResult::Deliver(sample.entries)
            }
            ReorderMode::Normal => self.insert_normal(sample, refcount_adjust, delivery_full),
        }
    }

    fn insert_normal(
        &mut self,
        sample: ReorderSample,
        refcount_adjust: &mut i64,
        delivery_full: bool,
    ) -> ReorderResult {
        if sample.maxp1 <= self.next_seq {
            return ReorderResult::TooOld;
        }
        if sample.min < self.next_seq {
            return ReorderResult::TooOld;
        }
        if sample.min == self.next_seq {
            let mut delivered = sample.entries;
            self.next_seq = sample.maxp1;
            self.absorb_contiguous(&mut delivered);
            *refcount_adjust += delivered.len() as i64;
            return ReorderResult::Deliver(delivered);
        }

        if self.max_samples == 0 {
            return ReorderResult::Reject;
        }
        if delivery_full && self.touches_existing(&sample) {
            return ReorderResult::Reject;
        }
        if self.overlaps_existing(&sample) {
            return ReorderResult::Reject;
        }
        *refcount_adjust += sample.entries.len() as i64;
        self.store_run(sample)
    }

    /// Process a gap `[min, maxp1)`: analogous to injecting placeholder
    /// samples with null sampleinfo covering that range.
    pub fn gap(&mut self, min: u64, maxp1: u64, refcount_adjust: &mut i64) -> ReorderResult {
        if maxp1 <= self.next_seq {
            return ReorderResult::Accept;
        }
        let min = min.max(self.next_seq);
        if min <= self.next_seq {
            let mut delivered: Vec<SampleEntry> =
                (self.next_seq..maxp1).map(SampleEntry::gap).collect();
            self.next_seq = maxp1;
            self.absorb_contiguous(&mut delivered);
            *refcount_adjust += delivered.len() as i64;
            ReorderResult::Deliver(delivered)
        } else {
            if self.max_samples == 0 {
                debug!("reorder: gap [{min},{maxp1}) not stored (max_samples=0)");
                return ReorderResult::Accept;
            }
            let entries: Vec<_> = (min..maxp1).map(SampleEntry::gap).collect();
            self.store_run(ReorderSample { min, maxp1, entries })
        }
    }

    /// After delivering/advancing `next_seq`, pull in any stored run(s)
    /// that now begin exactly at the new low-water mark.
    fn absorb_contiguous(&mut self, delivered: &mut Vec<SampleEntry>) {
        while let Some(run) = self.samples.remove(&self.next_seq) {
            self.next_seq = run.maxp1;
            delivered.extend(run.entries);
        }
    }

    fn touches_existing(&self, sample: &ReorderSample) -> bool {
        self.samples
            .values()
            .any(|r| r.maxp1 == sample.min || r.min == sample.maxp1)
    }

    fn overlaps_existing(&self, sample: &ReorderSample) -> bool {
        self.samples
            .values()
            .any(|r| sample.min < r.maxp1 && sample.maxp1 > r.min)
    }

    /// Store a run, merging with any tail/head-adjacent stored run, and
    /// evicting the single highest-seqno run if this insertion would
    /// exceed the sample-count bound.
    fn store_run(&mut self, mut sample: ReorderSample) -> ReorderResult {
        if let Some((&pred_min, _)) = self.samples.range(..sample.min).next_back() {
            let pred_maxp1 = self.samples[&pred_min].maxp1;
            if pred_maxp1 == sample.min {
                let mut pred = self.samples.remove(&pred_min).unwrap();
                pred.maxp1 = sample.maxp1;
                pred.entries.extend(sample.entries);
                sample = pred;
            }
        }
        if let Some((&succ_min, _)) = self.samples.range(sample.maxp1..).next() {
            if succ_min == sample.maxp1 {
                let succ = self.samples.remove(&succ_min).unwrap();
                sample.maxp1 = succ.maxp1;
                sample.entries.extend(succ.entries);
            }
        }

        if self.samples.len() >= self.max_samples && !self.samples.contains_key(&sample.min) {
            if let Some((&max_min, _)) = self.samples.iter().next_back() {
                self.samples.remove(&max_min);
                debug!("reorder: dropped highest-seq run starting at {max_min} (capacity)");
            }
        }
        let min = sample.min;
        self.samples.insert(min, sample);
        ReorderResult::Accept
    }

    /// Discard stored runs entirely below `maxp1` and advance `next_seq`
    /// to at least `maxp1`.
    pub fn drop_upto(&mut self, maxp1: u64) {
        self.samples.retain(|_, r| r.min >= maxp1);
        if maxp1 > self.next_seq {
            self.next_seq = maxp1;
        }
    }

    /// Whether `seq` is still of interest (not already delivered, not
    /// already fully covered by a stored run).
    pub fn wantsample(&self, seq: u64) -> bool {
        if seq < self.next_seq {
            return false;
        }
        !self.samples.values().any(|r| seq >= r.min && seq < r.maxp1)
    }

    /// Per-sequence-number NACK bitmap starting at `base`. When `notail`
    /// is set, bit `i` is forced clear once `base + i >= horizon` — never
    /// claim sequence numbers past the requester's own horizon as missing.
    pub fn nackmap(&self, base: u64, num_bits: u32, notail: bool, horizon: u64) -> Vec<bool> {
        (0..num_bits)
            .map(|i| {
                let seq = base + i as u64;
                if notail && seq >= horizon {
                    false
                } else {
                    self.wantsample(seq)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::arena::rbuf::Rbuf;
    use crate::core::arena::rmsg::Rmsg;
    use std::sync::Arc;

    fn dummy_sample(seq: u64) -> ReorderSample {
        let rbuf = Arc::new(Rbuf::new(64));
        let m = Rmsg::new(rbuf, 0, 64);
        m.commit();
        let rdata = Rdata::new(m, 0, 0, None, 0, 10);
        ReorderSample::data(seq, 10, Box::new(rdata))
    }

    #[test]
    fn test_simple_sequential_delivery() {
        let mut r = ReorderIndex::new(ReorderMode::Normal, 8, false);
        let mut adj = 0i64;
        for seq in 1..=3u64 {
            let res = r.rsample(dummy_sample(seq), &mut adj, false);
            assert_eq!(res.n(), 1);
        }
        assert_eq!(r.next_seq(), 4);
        assert_eq!(r.n_samples(), 0);
    }

    #[test]
    fn test_gap_fills_a_hole() {
        let mut r = ReorderIndex::new(ReorderMode::Normal, 8, false);
        let mut adj = 0i64;
        assert_eq!(r.rsample(dummy_sample(3), &mut adj, false).n(), 0);
        assert_eq!(r.rsample(dummy_sample(5), &mut adj, false).n(), 0);
        let res = r.gap(1, 3, &mut adj);
        match res {
            ReorderResult::Deliver(entries) => {
                assert_eq!(entries.len(), 3); // gap seq 1,2 + sample seq 3
                assert_eq!(entries[0].seq, 1);
                assert!(entries[0].info.is_none());
                assert_eq!(entries[2].seq, 3);
                assert!(entries[2].info.is_some());
            }
            _ => panic!("expected delivery"),
        }
        assert_eq!(r.next_seq(), 4);
        assert_eq!(r.n_samples(), 1);
        assert!(r.wantsample(5));
    }

    #[test]
    fn test_too_old_rejected() {
        let mut r = ReorderIndex::new(ReorderMode::Normal, 8, false);
        let mut adj = 0i64;
        assert_eq!(r.rsample(dummy_sample(1), &mut adj, false).n(), 1);
        assert!(matches!(
            r.rsample(dummy_sample(1), &mut adj, false),
            ReorderResult::TooOld
        ));
    }

    #[test]
    fn test_max_samples_zero_rejects_storage_but_gap_advances() {
        let mut r = ReorderIndex::new(ReorderMode::Normal, 0, false);
        let mut adj = 0i64;
        assert!(matches!(
            r.rsample(dummy_sample(5), &mut adj, false),
            ReorderResult::Reject
        ));
        let _ = r.gap(1, 5, &mut adj);
        assert_eq!(r.next_seq(), 5);
    }

    #[test]
    fn test_monotonically_increasing_delivers_immediately() {
        let mut r = ReorderIndex::new(ReorderMode::MonotonicallyIncreasing, 8, false);
        let mut adj = 0i64;
        let res = r.rsample(dummy_sample(7), &mut adj, false);
        assert_eq!(res.n(), 1);
        assert_eq!(r.next_seq(), 8);
    }

    #[test]
    fn test_always_deliver_ignores_order() {
        let mut r = ReorderIndex::new(ReorderMode::AlwaysDeliver, 8, false);
        let mut adj = 0i64;
        assert_eq!(r.rsample(dummy_sample(100), &mut adj, false).n(), 1);
        assert_eq!(r.rsample(dummy_sample(1), &mut adj, false).n(), 1);
    }
}

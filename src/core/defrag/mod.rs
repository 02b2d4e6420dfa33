// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fragment reassembler (defrag).
//!
//! Per proxy-writer, reassembles `DATA`/`DATAFRAG` submessages into
//! complete samples using an interval tree of byte ranges keyed by
//! sequence number. Has no lock of its own — callers serialize access via
//! the owning proxy-writer's mutex (see the crate-level concurrency notes).

use std::collections::BTreeMap;

use log::{debug, trace};

use crate::core::arena::rdata::{Rdata, SampleInfo};
use crate::core::reorder::ReorderSample;

/// Eviction policy applied when a proxy-writer's sample budget is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    /// Evict the smallest-seqno sample; reject anything smaller still.
    /// Used for reliable proxy-writers (retransmission will refill it).
    DropOldest,
    /// Evict the largest-seqno sample; reject anything larger still.
    /// Used for best-effort proxy-writers (no retransmission anyway).
    DropLatest,
}

/// Outcome of [`DefragIndex::nackmap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackmapResult {
    /// No record of this sample and the caller gave no fragment-count hint.
    UnknownSample,
    /// Every fragment up to the requested horizon has been received.
    AllKnown,
    /// `bits[i]` is set iff fragment `base + i` is still missing.
    FragmentsMissing { base: u32, bits: Vec<bool> },
}

/// One non-overlapping, non-adjacent run of received bytes within a
/// partially-reassembled sample, with the fragments that make it up in
/// receipt order (re-sorted by `min` only at completion).
struct Interval {
    min: u32,
    maxp1: u32,
    frags: Vec<Rdata>,
}

/// A partially-reassembled sample, keyed by sequence number in the
/// enclosing [`DefragIndex`].
struct DefragSample {
    info: SampleInfo,
    intervals: Vec<Interval>,
}

impl DefragSample {
    fn new(info: SampleInfo) -> Self {
        Self {
            info,
            intervals: Vec::new(),
        }
    }

    /// True once exactly one interval spans `[0, size)`.
    fn is_complete(&self) -> bool {
        self.intervals
            .iter()
            .any(|iv| iv.min == 0 && iv.maxp1 >= self.info.size)
    }

    /// Merge `rdata` into the interval list. Intervals stay sorted by
    /// `min`, non-overlapping, and non-adjacent (touching intervals are
    /// merged immediately).
    fn insert(&mut self, rdata: Rdata) {
        let (min, maxp1) = (rdata.min, rdata.maxp1);

        // Find the position of the first interval whose `maxp1 >= min`
        // (candidate predecessor/overlap) using a linear scan — proxy
        // writers hold only a handful of in-flight intervals at once.
        let mut idx = 0;
        while idx < self.intervals.len() && self.intervals[idx].maxp1 < min {
            idx += 1;
        }

        if idx < self.intervals.len() && self.intervals[idx].min <= min && self.intervals[idx].maxp1 >= maxp1 {
            // Fully contained in an existing interval: duplicate, discard.
            trace!("defrag: duplicate fragment [{min},{maxp1}) discarded");
            return;
        }

        if idx < self.intervals.len() && self.intervals[idx].min <= maxp1 {
            // Overlaps or touches the interval at idx: extend it.
            let iv = &mut self.intervals[idx];
            iv.min = iv.min.min(min);
            iv.maxp1 = iv.maxp1.max(maxp1);
            iv.frags.push(rdata);
        } else {
            self.intervals.insert(
                idx,
                Interval {
                    min,
                    maxp1,
                    frags: vec![rdata],
                },
            );
        }

        // Greedily merge with the following interval if now adjacent or
        // overlapping.
        while idx + 1 < self.intervals.len() && self.intervals[idx].maxp1 >= self.intervals[idx + 1].min {
            let next = self.intervals.remove(idx + 1);
            let iv = &mut self.intervals[idx];
            iv.maxp1 = iv.maxp1.max(next.maxp1);
            iv.frags.extend(next.frags);
        }
    }

    /// Flatten all intervals into one `nextfrag`-linked chain in byte
    /// order, consuming the sample.
    fn into_chain(mut self) -> Box<Rdata> {
        self.intervals.sort_by_key(|iv| iv.min);
        let mut frags: Vec<Rdata> = Vec::new();
        for iv in self.intervals {
            frags.extend(iv.frags);
        }
        frags.sort_by_key(|r| r.min);
        let mut tail: Option<Box<Rdata>> = None;
        for mut frag in frags.into_iter().rev() {
            frag.nextfrag = tail.take();
            tail = Some(Box::new(frag));
        }
        tail.expect("completed sample must have at least one fragment")
    }

    fn missing_bitmap(&self, base_fragnum: u32, fragment_size: u32, num_bits: u32, notail_maxseq: Option<u32>) -> Vec<bool> {
        let base_byte = base_fragnum * fragment_size;
        let mut bits = vec![true; num_bits as usize];
        for iv in &self.intervals {
            let lo = iv.min.max(base_byte);
            let hi = iv.maxp1.min(base_byte + num_bits * fragment_size);
            if lo >= hi {
                continue;
            }
            let first_bit = (lo - base_byte) / fragment_size;
            let last_bit = (hi - base_byte).div_ceil(fragment_size);
            for b in first_bit..last_bit.min(num_bits) {
                bits[b as usize] = false;
            }
        }
        if let Some(horizon) = notail_maxseq {
            // Per original_source's "notail" flag: never claim fragments
            // past the requester's own horizon as missing.
            for (i, bit) in bits.iter_mut().enumerate() {
                if base_fragnum + i as u32 >= horizon {
                    *bit = false;
                }
            }
        }
        bits
    }
}

/// Per proxy-writer fragment reassembler.
pub struct DefragIndex {
    drop_policy: DropPolicy,
    max_samples: usize,
    samples: BTreeMap<u64, DefragSample>,
}

impl DefragIndex {
    pub fn new(drop_policy: DropPolicy, max_samples: usize) -> Self {
        Self {
            drop_policy,
            max_samples,
            samples: BTreeMap::new(),
        }
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    /// Insert one fragment. Returns a completed reorder-form chain once
    /// reassembly finishes; non-fragmented data bypasses the tree and is
    /// handed back immediately.
    pub fn rsample(&mut self, rdata: Rdata, info: SampleInfo) -> Option<ReorderSample> {
        if rdata.min == 0 && rdata.maxp1 >= info.size {
            return Some(ReorderSample::data(info.seq, info.size, Box::new(rdata)));
        }

        if !self.samples.contains_key(&info.seq) {
            if self.samples.len() >= self.max_samples && !self.make_room_for(info.seq) {
                debug!("defrag: rejecting seq={} (sample budget full)", info.seq);
                return None;
            }
            self.samples.insert(info.seq, DefragSample::new(info));
        }

        let sample = self.samples.get_mut(&info.seq)?;
        sample.insert(rdata);

        if sample.is_complete() {
            let sample = self.samples.remove(&info.seq).unwrap();
            let seq = sample.info.seq;
            let size = sample.info.size;
            let chain = sample.into_chain();
            Some(ReorderSample::data(seq, size, chain))
        } else {
            None
        }
    }

    /// Make room for a new sample at `seq` per the configured drop
    /// policy. Returns false if `seq` itself should be rejected instead.
    fn make_room_for(&mut self, seq: u64) -> bool {
        match self.drop_policy {
            DropPolicy::DropOldest => {
                let &min_seq = self.samples.keys().next().expect("non-empty, checked by caller");
                if seq < min_seq {
                    return false;
                }
                self.samples.remove(&min_seq);
                debug!("defrag: dropped oldest seq={min_seq} to admit seq={seq}");
                true
            }
            DropPolicy::DropLatest => {
                let &max_seq = self.samples.keys().next_back().expect("non-empty, checked by caller");
                if seq > max_seq {
                    return false;
                }
                self.samples.remove(&max_seq);
                debug!("defrag: dropped latest seq={max_seq} to admit seq={seq}");
                true
            }
        }
    }

    /// Discard any partially-reassembled samples with seqno in
    /// `[min, maxp1)` — the writer has told us they'll never complete.
    pub fn notegap(&mut self, min: u64, maxp1: u64) {
        self.samples.retain(|&seq, _| !(seq >= min && seq < maxp1));
    }

    /// Drop samples destined for a reader being torn down, and anything
    /// below `min`.
    pub fn prune(&mut self, min: u64) {
        self.samples.retain(|&seq, _| seq >= min);
    }

    /// NACK bitmap for the fragments of `seq` still missing, starting at
    /// `base_fragnum`. `notail_maxseq`, when given, caps the bitmap so
    /// fragments past the requester's own horizon are never reported
    /// missing.
    pub fn nackmap(
        &self,
        seq: u64,
        fragment_size: u32,
        base_fragnum: u32,
        num_bits: u32,
        notail_maxseq: Option<u32>,
    ) -> NackmapResult {
        match self.samples.get(&seq) {
            None => NackmapResult::UnknownSample,
            Some(sample) => {
                let bits = sample.missing_bitmap(base_fragnum, fragment_size, num_bits, notail_maxseq);
                if bits.iter().all(|&b| !b) {
                    NackmapResult::AllKnown
                } else {
                    NackmapResult::FragmentsMissing {
                        base: base_fragnum,
                        bits,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::arena::rbuf::Rbuf;
    use crate::core::arena::rmsg::Rmsg;
    use std::sync::Arc;

    fn msg() -> Arc<Rmsg> {
        let rbuf = Arc::new(Rbuf::new(4096));
        let m = Rmsg::new(rbuf, 0, 4096);
        m.commit();
        m
    }

    fn frag(m: &Arc<Rmsg>, min: u32, maxp1: u32) -> Rdata {
        Rdata::new(m.clone(), 0, 0, None, min, maxp1)
    }

    #[test]
    fn test_reassembly_in_order() {
        let m = msg();
        let mut d = DefragIndex::new(DropPolicy::DropOldest, 8);
        let info = SampleInfo { seq: 1, size: 3000 };
        assert!(d.rsample(frag(&m, 0, 1024), info).is_none());
        assert!(d.rsample(frag(&m, 1024, 2048), info).is_none());
        let done = d.rsample(frag(&m, 2048, 3000), info);
        assert!(done.is_some());
        assert_eq!(done.unwrap().fragchain_span(), (0, 3000));
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let m = msg();
        let mut d = DefragIndex::new(DropPolicy::DropOldest, 8);
        let info = SampleInfo { seq: 1, size: 3000 };
        assert!(d.rsample(frag(&m, 2048, 3000), info).is_none());
        assert!(d.rsample(frag(&m, 0, 1024), info).is_none());
        let done = d.rsample(frag(&m, 1024, 2048), info);
        assert!(done.is_some());
    }

    #[test]
    fn test_non_fragmented_bypasses_tree() {
        let m = msg();
        let mut d = DefragIndex::new(DropPolicy::DropOldest, 8);
        let info = SampleInfo { seq: 1, size: 100 };
        let done = d.rsample(frag(&m, 0, 100), info);
        assert!(done.is_some());
        assert_eq!(d.n_samples(), 0);
    }

    #[test]
    fn test_overflow_drop_oldest() {
        let m = msg();
        let mut d = DefragIndex::new(DropPolicy::DropOldest, 2);
        let mk = |seq: u64| SampleInfo { seq, size: 3000 };
        assert!(d.rsample(frag(&m, 0, 100), mk(10)).is_none());
        assert!(d.rsample(frag(&m, 0, 100), mk(20)).is_none());
        assert_eq!(d.n_samples(), 2);
        assert!(d.rsample(frag(&m, 0, 100), mk(30)).is_none());
        assert_eq!(d.n_samples(), 2);
        assert!(!d.samples.contains_key(&10));
        assert!(d.samples.contains_key(&30));
        // seq=5 is older than the current minimum remaining (20): rejected.
        assert!(d.rsample(frag(&m, 0, 100), mk(5)).is_none());
        assert!(!d.samples.contains_key(&5));
    }

    #[test]
    fn test_notegap_discards_range() {
        let m = msg();
        let mut d = DefragIndex::new(DropPolicy::DropOldest, 8);
        d.rsample(frag(&m, 0, 100), SampleInfo { seq: 5, size: 3000 });
        assert_eq!(d.n_samples(), 1);
        d.notegap(0, 10);
        assert_eq!(d.n_samples(), 0);
    }

    #[test]
    fn test_nackmap_unknown_sample() {
        let d = DefragIndex::new(DropPolicy::DropOldest, 8);
        assert_eq!(d.nackmap(1, 1024, 0, 4, None), NackmapResult::UnknownSample);
    }

    #[test]
    fn test_nackmap_reports_missing_fragment() {
        let m = msg();
        let mut d = DefragIndex::new(DropPolicy::DropOldest, 8);
        let info = SampleInfo { seq: 1, size: 3000 };
        d.rsample(frag(&m, 0, 1024), info);
        match d.nackmap(1, 1024, 0, 3, None) {
            NackmapResult::FragmentsMissing { bits, .. } => {
                assert_eq!(bits, vec![false, true, true]);
            }
            other => panic!("expected FragmentsMissing, got {other:?}"),
        }
    }
}

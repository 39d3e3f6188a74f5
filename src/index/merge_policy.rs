//! Merge selection.
//!
//! A [`MergePolicy`] looks at the current segments and picks groups to
//! coalesce. It never runs merges itself: the writer registers what the
//! policy returns and a [`MergeScheduler`] executes it.
//!
//! [`MergeScheduler`]: crate::index::merge_scheduler::MergeScheduler

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::index::merger::MergeState;
use crate::index::segment_info::SegmentCommitInfo;
use crate::index::segment_infos::SegmentInfos;

/// Why the writer asks for merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeTrigger {
    /// A segment was flushed because of RAM or doc count.
    SegmentFlush,
    /// A full flush for a commit or an NRT reader.
    FullFlush,
    /// The caller asked (`maybe_merge`, `force_merge`).
    Explicit,
    /// A merge finished.
    MergeFinished,
    /// The writer is closing.
    Closing,
    /// A commit finished.
    Commit,
}

/// What the writer knows about segments beyond their commit infos.
pub trait MergeContext {
    /// Deleted documents a merge of `info` would drop, soft deletes included.
    fn num_deletes_to_merge(&self, info: &SegmentCommitInfo) -> u32;

    /// Names of segments already being merged.
    fn merging_segments(&self) -> &BTreeSet<String>;

    fn size_in_bytes(&self, info: &SegmentCommitInfo) -> u64;
}

/// One group of segments to merge into one.
#[derive(Debug)]
pub struct OneMerge {
    segments: Vec<SegmentCommitInfo>,
    total_max_doc: u64,
    max_num_segments: Option<usize>,
    aborted: AtomicBool,
    pub(crate) state: Mutex<MergeState>,
}

impl OneMerge {
    pub fn new(segments: Vec<SegmentCommitInfo>) -> Self {
        let total_max_doc = segments.iter().map(|s| s.max_doc() as u64).sum();
        OneMerge {
            segments,
            total_max_doc,
            max_num_segments: None,
            aborted: AtomicBool::new(false),
            state: Mutex::new(MergeState::default()),
        }
    }

    pub fn segments(&self) -> &[SegmentCommitInfo] {
        &self.segments
    }

    pub fn segment_names(&self) -> Vec<&str> {
        self.segments.iter().map(SegmentCommitInfo::name).collect()
    }

    pub fn total_max_doc(&self) -> u64 {
        self.total_max_doc
    }

    /// Set when the merge belongs to a forced merge.
    pub fn max_num_segments(&self) -> Option<usize> {
        self.max_num_segments
    }

    pub fn set_max_num_segments(&mut self, max: Option<usize>) {
        self.max_num_segments = max;
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn describe(&self) -> String {
        self.segment_names().join(" ")
    }
}

/// Merges chosen by one policy call.
#[derive(Debug, Default)]
pub struct MergeSpecification {
    pub merges: Vec<OneMerge>,
}

impl MergeSpecification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, merge: OneMerge) {
        self.merges.push(merge);
    }

    pub fn is_empty(&self) -> bool {
        self.merges.is_empty()
    }

    fn into_option(self) -> Option<Self> {
        if self.is_empty() { None } else { Some(self) }
    }
}

pub trait MergePolicy: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Natural merges after `trigger`.
    fn find_merges(
        &self,
        trigger: MergeTrigger,
        infos: &SegmentInfos,
        ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification>;

    /// Merges that bring the segments in `segments_to_merge` down to at most
    /// `max_segment_count`.
    fn find_forced_merges(
        &self,
        infos: &SegmentInfos,
        max_segment_count: usize,
        segments_to_merge: &BTreeSet<String>,
        ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification>;

    /// Merges that reclaim deleted documents.
    fn find_forced_deletes_merges(
        &self,
        infos: &SegmentInfos,
        ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification>;
}

fn del_ratio(info: &SegmentCommitInfo, ctx: &dyn MergeContext) -> f64 {
    if info.max_doc() == 0 {
        return 0.0;
    }
    ctx.num_deletes_to_merge(info) as f64 / info.max_doc() as f64
}

/// Segments of `infos` that may be force merged, in index order.
fn forced_candidates<'a>(
    infos: &'a SegmentInfos,
    segments_to_merge: &BTreeSet<String>,
    ctx: &dyn MergeContext,
) -> Option<Vec<&'a SegmentCommitInfo>> {
    let merging = ctx.merging_segments();
    let mut candidates = Vec::new();
    for info in infos.segments() {
        if !segments_to_merge.contains(info.name()) {
            continue;
        }
        if merging.contains(info.name()) {
            // a cascaded forced merge is still running
            return None;
        }
        candidates.push(info);
    }
    Some(candidates)
}

/// Whether `candidates` already satisfy a forced merge.
fn is_merged(
    candidates: &[&SegmentCommitInfo],
    max_segment_count: usize,
    ctx: &dyn MergeContext,
) -> bool {
    match candidates.len() {
        0 => true,
        1 => ctx.num_deletes_to_merge(candidates[0]) == 0 || max_segment_count > 1,
        n => n <= max_segment_count,
    }
}

/// Cut `candidates` from the tail into merges of at most `max_at_once`
/// segments until at most `max_segment_count` remain.
fn tail_merges(
    candidates: &[&SegmentCommitInfo],
    max_segment_count: usize,
    max_at_once: usize,
) -> MergeSpecification {
    let mut spec = MergeSpecification::new();
    let mut count = candidates.len();
    let mut end = candidates.len();
    while count > max_segment_count && end > 0 {
        let take = (count - max_segment_count + 1).min(max_at_once).min(end).max(1);
        let start = end - take;
        spec.add(OneMerge::new(
            candidates[start..end].iter().map(|s| (*s).clone()).collect(),
        ));
        count -= take - 1;
        end = start;
        if take == 1 {
            break;
        }
    }
    spec
}

/// Merges segments of roughly equal size, at most `max_merge_at_once` at a
/// time, allowing `segments_per_tier` segments per size tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TieredMergePolicy {
    pub max_merge_at_once: usize,
    pub segments_per_tier: f64,
    pub max_merged_segment_bytes: u64,
    /// Segments smaller than this are treated as this size.
    pub floor_segment_bytes: u64,
    /// Percentage of deleted docs above which `force_merge_deletes` rewrites
    /// a segment.
    pub force_merge_deletes_pct_allowed: f64,
    /// Percentage of deleted docs above which large segments are merged
    /// anyway.
    pub deletes_pct_allowed: f64,
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        TieredMergePolicy {
            max_merge_at_once: 10,
            segments_per_tier: 10.0,
            max_merged_segment_bytes: 5 * 1024 * 1024 * 1024,
            floor_segment_bytes: 2 * 1024 * 1024,
            force_merge_deletes_pct_allowed: 10.0,
            deletes_pct_allowed: 20.0,
        }
    }
}

impl TieredMergePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn size(&self, info: &SegmentCommitInfo, ctx: &dyn MergeContext) -> u64 {
        let bytes = ctx.size_in_bytes(info) as f64;
        (bytes * (1.0 - del_ratio(info, ctx))) as u64
    }

    fn floored(&self, size: u64) -> u64 {
        size.max(self.floor_segment_bytes)
    }

    /// Lower is better: prefers even merges that reclaim deletes.
    fn score(&self, candidate: &[(&SegmentCommitInfo, u64)], ctx: &dyn MergeContext) -> f64 {
        let total: u64 = candidate.iter().map(|(_, s)| *s).sum();
        let total_floored: u64 = candidate.iter().map(|(_, s)| self.floored(*s)).sum();
        let largest = candidate
            .iter()
            .map(|(_, s)| self.floored(*s))
            .max()
            .unwrap_or(0);
        let skew = if candidate.len() >= self.max_merge_at_once {
            1.0 / self.max_merge_at_once as f64
        } else {
            largest as f64 / total_floored.max(1) as f64
        };
        let before: u64 = candidate
            .iter()
            .map(|(info, _)| ctx.size_in_bytes(info))
            .sum();
        let reclaim = if before == 0 {
            1.0
        } else {
            total as f64 / before as f64
        };
        skew * (total.max(1) as f64).powf(0.05) * reclaim * reclaim
    }
}

impl MergePolicy for TieredMergePolicy {
    fn name(&self) -> &str {
        "TieredMergePolicy"
    }

    fn find_merges(
        &self,
        trigger: MergeTrigger,
        infos: &SegmentInfos,
        ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification> {
        let merging = ctx.merging_segments();
        let mut sized: Vec<(&SegmentCommitInfo, u64)> = infos
            .segments()
            .iter()
            .map(|info| (info, self.size(info, ctx)))
            .collect();
        sized.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.name().cmp(b.0.name())));

        let mut total_bytes = 0u64;
        let mut min_segment = u64::MAX;
        let mut eligible = Vec::new();
        for (info, size) in sized {
            let too_large = size > self.max_merged_segment_bytes / 2
                && del_ratio(info, ctx) * 100.0 < self.deletes_pct_allowed;
            if too_large {
                continue;
            }
            total_bytes += size;
            min_segment = min_segment.min(size);
            if !merging.contains(info.name()) {
                eligible.push((info, size));
            }
        }
        if eligible.is_empty() {
            return None;
        }

        let mut tier_bytes = self.floored(min_segment);
        let mut remaining = total_bytes as f64;
        let mut allowed = 0.0;
        loop {
            let at_tier = remaining / tier_bytes as f64;
            if at_tier < self.segments_per_tier {
                allowed += at_tier.ceil();
                break;
            }
            allowed += self.segments_per_tier;
            remaining -= self.segments_per_tier * tier_bytes as f64;
            tier_bytes = tier_bytes.saturating_mul(self.max_merge_at_once as u64);
        }
        let allowed = allowed.max(self.segments_per_tier) as usize;

        let mut spec = MergeSpecification::new();
        while eligible.len() > allowed {
            let mut best: Option<(f64, Vec<usize>)> = None;
            for start in 0..eligible.len() {
                let mut picked = Vec::new();
                let mut bytes = 0u64;
                for (i, (_, size)) in eligible.iter().enumerate().skip(start) {
                    if picked.len() == self.max_merge_at_once {
                        break;
                    }
                    if bytes + size > self.max_merged_segment_bytes {
                        continue;
                    }
                    bytes += size;
                    picked.push(i);
                }
                if picked.len() < 2 {
                    continue;
                }
                let candidate: Vec<(&SegmentCommitInfo, u64)> =
                    picked.iter().map(|i| eligible[*i]).collect();
                let score = self.score(&candidate, ctx);
                if best.as_ref().map(|(s, _)| score < *s).unwrap_or(true) {
                    best = Some((score, picked));
                }
            }
            let Some((score, picked)) = best else {
                break;
            };
            debug!(
                "tiered merge policy ({trigger:?}): merge {} segments, score {score:.3}",
                picked.len()
            );
            spec.add(OneMerge::new(
                picked.iter().map(|i| eligible[*i].0.clone()).collect(),
            ));
            let picked: BTreeSet<usize> = picked.into_iter().collect();
            eligible = eligible
                .into_iter()
                .enumerate()
                .filter(|(i, _)| !picked.contains(i))
                .map(|(_, e)| e)
                .collect();
        }
        spec.into_option()
    }

    fn find_forced_merges(
        &self,
        infos: &SegmentInfos,
        max_segment_count: usize,
        segments_to_merge: &BTreeSet<String>,
        ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification> {
        let mut candidates = forced_candidates(infos, segments_to_merge, ctx)?;
        if is_merged(&candidates, max_segment_count, ctx) {
            return None;
        }
        candidates.sort_by_key(|info| std::cmp::Reverse(self.size(info, ctx)));
        tail_merges(&candidates, max_segment_count, self.max_merge_at_once).into_option()
    }

    fn find_forced_deletes_merges(
        &self,
        infos: &SegmentInfos,
        ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification> {
        let merging = ctx.merging_segments();
        let candidates: Vec<&SegmentCommitInfo> = infos
            .segments()
            .iter()
            .filter(|info| !merging.contains(info.name()))
            .filter(|info| del_ratio(info, ctx) * 100.0 > self.force_merge_deletes_pct_allowed)
            .collect();
        let mut spec = MergeSpecification::new();
        for chunk in candidates.chunks(self.max_merge_at_once) {
            spec.add(OneMerge::new(chunk.iter().map(|s| (*s).clone()).collect()));
        }
        spec.into_option()
    }
}

/// Merges `merge_factor` adjacent segments whose live doc counts fall on
/// the same logarithmic level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogDocMergePolicy {
    pub merge_factor: usize,
    /// Segments below this many docs all share the lowest level.
    pub min_merge_docs: u64,
    /// Segments above this many docs are never merged.
    pub max_merge_docs: u64,
}

impl Default for LogDocMergePolicy {
    fn default() -> Self {
        LogDocMergePolicy {
            merge_factor: 10,
            min_merge_docs: 1000,
            max_merge_docs: i32::MAX as u64,
        }
    }
}

impl LogDocMergePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn size(&self, info: &SegmentCommitInfo, ctx: &dyn MergeContext) -> u64 {
        (info.max_doc() - ctx.num_deletes_to_merge(info).min(info.max_doc())) as u64
    }

    fn level(&self, size: u64) -> f64 {
        let norm = (self.merge_factor.max(2) as f64).ln();
        (size.max(self.min_merge_docs).max(1) as f64).ln() / norm
    }
}

impl MergePolicy for LogDocMergePolicy {
    fn name(&self) -> &str {
        "LogDocMergePolicy"
    }

    fn find_merges(
        &self,
        _trigger: MergeTrigger,
        infos: &SegmentInfos,
        ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification> {
        let merging = ctx.merging_segments();
        let segments = infos.segments();
        let levels: Vec<f64> = segments.iter().map(|s| self.level(self.size(s, ctx))).collect();
        let floor_level = self.level(self.min_merge_docs);
        let mut spec = MergeSpecification::new();

        let mut start = 0;
        while start < segments.len() {
            let max_level = levels[start..]
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max);
            let level_bottom = if max_level <= floor_level {
                f64::NEG_INFINITY
            } else {
                max_level - 0.75
            };
            let mut upto = segments.len() - 1;
            while upto > start && levels[upto] < level_bottom {
                upto -= 1;
            }

            let mut window = start;
            while window + self.merge_factor <= upto + 1 {
                let end = window + self.merge_factor;
                let group = &segments[window..end];
                let blocked = group.iter().any(|s| {
                    merging.contains(s.name()) || self.size(s, ctx) >= self.max_merge_docs
                });
                if !blocked {
                    spec.add(OneMerge::new(group.to_vec()));
                }
                window = end;
            }
            start = upto + 1;
        }
        spec.into_option()
    }

    fn find_forced_merges(
        &self,
        infos: &SegmentInfos,
        max_segment_count: usize,
        segments_to_merge: &BTreeSet<String>,
        ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification> {
        let candidates = forced_candidates(infos, segments_to_merge, ctx)?;
        if is_merged(&candidates, max_segment_count, ctx) {
            return None;
        }
        tail_merges(&candidates, max_segment_count, self.merge_factor).into_option()
    }

    fn find_forced_deletes_merges(
        &self,
        infos: &SegmentInfos,
        ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification> {
        let merging = ctx.merging_segments();
        let mut spec = MergeSpecification::new();
        let mut run: Vec<SegmentCommitInfo> = Vec::new();
        for info in infos.segments() {
            let wanted = !merging.contains(info.name()) && ctx.num_deletes_to_merge(info) > 0;
            if wanted && run.len() < self.merge_factor {
                run.push(info.clone());
                continue;
            }
            if !run.is_empty() {
                spec.add(OneMerge::new(std::mem::take(&mut run)));
            }
            if wanted {
                run.push(info.clone());
            }
        }
        if !run.is_empty() {
            spec.add(OneMerge::new(run));
        }
        spec.into_option()
    }
}

/// Never merges.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn name(&self) -> &str {
        "NoMergePolicy"
    }

    fn find_merges(
        &self,
        _trigger: MergeTrigger,
        _infos: &SegmentInfos,
        _ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification> {
        None
    }

    fn find_forced_merges(
        &self,
        _infos: &SegmentInfos,
        _max_segment_count: usize,
        _segments_to_merge: &BTreeSet<String>,
        _ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification> {
        None
    }

    fn find_forced_deletes_merges(
        &self,
        _infos: &SegmentInfos,
        _ctx: &dyn MergeContext,
    ) -> Option<MergeSpecification> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::segment_info::SegmentInfo;
    use ahash::AHashMap;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[derive(Default)]
    struct FakeContext {
        deletes: AHashMap<String, u32>,
        merging: BTreeSet<String>,
    }

    impl MergeContext for FakeContext {
        fn num_deletes_to_merge(&self, info: &SegmentCommitInfo) -> u32 {
            self.deletes.get(info.name()).copied().unwrap_or(0)
        }

        fn merging_segments(&self) -> &BTreeSet<String> {
            &self.merging
        }

        fn size_in_bytes(&self, info: &SegmentCommitInfo) -> u64 {
            info.max_doc() as u64 * 100
        }
    }

    fn infos(sizes: &[u32]) -> SegmentInfos {
        let mut infos = SegmentInfos::new();
        for (i, max_doc) in sizes.iter().enumerate() {
            let info =
                SegmentInfo::new(format!("_{i}"), *max_doc, "Quire10", BTreeMap::new(), None);
            infos
                .add(SegmentCommitInfo::new(Arc::new(info), 0, 0, -1, -1, -1, None).unwrap())
                .unwrap();
        }
        infos
    }

    fn all_names(infos: &SegmentInfos) -> BTreeSet<String> {
        infos.segments().iter().map(|s| s.name().to_string()).collect()
    }

    #[test]
    fn test_tiered_merges_when_over_budget() {
        let policy = TieredMergePolicy {
            segments_per_tier: 2.0,
            max_merge_at_once: 2,
            ..TieredMergePolicy::default()
        };
        let ctx = FakeContext::default();
        let infos = infos(&[10, 10, 10, 10, 10]);
        let spec = policy
            .find_merges(MergeTrigger::SegmentFlush, &infos, &ctx)
            .unwrap();
        assert!(!spec.is_empty());
        assert!(spec.merges.iter().all(|m| m.segments().len() == 2));

        let few = super::tests::infos(&[10, 10]);
        assert!(policy.find_merges(MergeTrigger::SegmentFlush, &few, &ctx).is_none());
    }

    #[test]
    fn test_forced_merge_to_one() {
        let policy = TieredMergePolicy::default();
        let ctx = FakeContext::default();
        let infos = infos(&[5, 4, 3, 2, 1]);
        let spec = policy
            .find_forced_merges(&infos, 1, &all_names(&infos), &ctx)
            .unwrap();
        assert_eq!(spec.merges.len(), 1);
        assert_eq!(spec.merges[0].segments().len(), 5);
        assert_eq!(spec.merges[0].total_max_doc(), 15);
    }

    #[test]
    fn test_forced_merge_cascades() {
        let policy = TieredMergePolicy {
            max_merge_at_once: 3,
            ..TieredMergePolicy::default()
        };
        let ctx = FakeContext::default();
        let infos = infos(&[1, 1, 1, 1, 1, 1, 1]);
        let spec = policy
            .find_forced_merges(&infos, 1, &all_names(&infos), &ctx)
            .unwrap();
        let merged: usize = spec.merges.iter().map(|m| m.segments().len()).sum();
        assert!(spec.merges.iter().all(|m| m.segments().len() <= 3));
        // each merge removes len - 1 segments
        let remaining = 7 - merged + spec.merges.len();
        assert!(remaining < 7);
    }

    #[test]
    fn test_single_segment_with_deletes_is_rewritten() {
        let policy = TieredMergePolicy::default();
        let mut ctx = FakeContext::default();
        let infos = infos(&[10]);
        assert!(policy
            .find_forced_merges(&infos, 1, &all_names(&infos), &ctx)
            .is_none());
        ctx.deletes.insert("_0".to_string(), 3);
        let spec = policy
            .find_forced_merges(&infos, 1, &all_names(&infos), &ctx)
            .unwrap();
        assert_eq!(spec.merges[0].segment_names(), vec!["_0"]);
    }

    #[test]
    fn test_merging_segments_are_skipped() {
        let policy = TieredMergePolicy::default();
        let mut ctx = FakeContext::default();
        let infos = infos(&[3, 3, 3]);
        ctx.merging.insert("_1".to_string());
        assert!(policy
            .find_forced_merges(&infos, 1, &all_names(&infos), &ctx)
            .is_none());
    }

    #[test]
    fn test_log_doc_merges_same_level() {
        let policy = LogDocMergePolicy {
            merge_factor: 3,
            min_merge_docs: 10,
            ..LogDocMergePolicy::default()
        };
        let ctx = FakeContext::default();
        let infos = infos(&[1, 1, 1, 1]);
        let spec = policy
            .find_merges(MergeTrigger::SegmentFlush, &infos, &ctx)
            .unwrap();
        assert_eq!(spec.merges.len(), 1);
        assert_eq!(spec.merges[0].segment_names(), vec!["_0", "_1", "_2"]);
    }

    #[test]
    fn test_forced_deletes_merges() {
        let policy = TieredMergePolicy::default();
        let mut ctx = FakeContext::default();
        let infos = infos(&[10, 10, 10]);
        ctx.deletes.insert("_1".to_string(), 5);
        let spec = policy.find_forced_deletes_merges(&infos, &ctx).unwrap();
        assert_eq!(spec.merges[0].segment_names(), vec!["_1"]);
        assert!(NoMergePolicy.find_forced_deletes_merges(&infos, &ctx).is_none());
    }
}

//! The core router: decides which backend serves a given
//! call site and drives the cross-backend realloc protocol.
//!
//! Grounded on flexmalloc's `FlexMalloc::malloc` /
//! `calloc` / `realloc` / `free` (`flex-malloc.cxx`). This crate forbids
//! `unsafe` outright (`#![deny(unsafe_code)]` at the workspace level for
//! this member): every raw-pointer operation a router decision implies —
//! reading a block's header, copying bytes between two backends — is
//! expressed through safe methods the membrane crate exposes
//! specifically so this layer never needs to reach for `unsafe` itself.

use std::ptr::NonNull;

use flexmem_membrane::cache::CallStackCache;
use flexmem_membrane::header::{self, BackendId, NO_BACKEND};
use flexmem_membrane::module_map::ResolvedFrame;
use flexmem_membrane::registry::Registry;

use crate::classifier::Classifier;

/// An optional policy that routes allocations below a byte threshold to a
/// fixed backend regardless of call site, mirroring
/// `TOOL_MINSIZE_THRESHOLD`/`TOOL_MINSIZE_THRESHOLD_ALLOCATOR`
/// (`common.hxx`): classifying a four-byte counter's call stack is pure
/// overhead when the answer is always "the small-object backend".
pub struct MinSizeThreshold {
    pub max_bytes: usize,
    pub backend: BackendId,
}

pub struct Router<'a> {
    registry: &'a Registry,
    classifier: &'a Classifier,
    cache: &'a CallStackCache,
    fallback: BackendId,
    min_size_threshold: Option<MinSizeThreshold>,
}

impl<'a> Router<'a> {
    pub fn new(
        registry: &'a Registry,
        classifier: &'a Classifier,
        cache: &'a CallStackCache,
        fallback: BackendId,
        min_size_threshold: Option<MinSizeThreshold>,
    ) -> Self {
        Router {
            registry,
            classifier,
            cache,
            fallback,
            min_size_threshold,
        }
    }

    /// Decides which backend a given call site and request size should
    /// use, consulting the cache before the classifier and applying the
    /// minimum-size override last of all — flexmalloc's
    /// size-based short circuit always wins over call-site classification.
    /// The third element of the tuple is `true` iff the decision came from
    /// the cache rather than a fresh classifier walk, needed by callers to
    /// credit the matching rule's cache-hit statistics correctly.
    fn choose_backend(
        &self,
        raw_pcs: &[u64],
        frames: &[ResolvedFrame],
        requested_size: usize,
    ) -> (BackendId, Option<u32>, bool) {
        if let Some(threshold) = &self.min_size_threshold {
            if requested_size <= threshold.max_bytes {
                return (threshold.backend, None, false);
            }
        }

        // The cache stores rule ids biased by one (0 means "no rule"), the
        // same convention the header's `Aux` cell uses, so an unmatched
        // call site and rule id zero never collide.
        if let Some((backend_id, biased_rule)) = self.cache.lookup(raw_pcs) {
            return (backend_id, biased_rule.checked_sub(1), true);
        }

        let decision = match self.classifier.classify(frames) {
            Some(rule) => self
                .registry
                .id_of(&rule.backend_name)
                .map(|id| (id, Some(rule.id)))
                .unwrap_or((self.fallback, None)),
            None => (self.fallback, None),
        };
        let biased_rule = decision.1.map(|id| id + 1).unwrap_or(0);
        self.cache.remember(raw_pcs, decision.0, biased_rule);
        (decision.0, decision.1, false)
    }

    /// Whether `backend_id` differs from the backend the rule nominally
    /// names — i.e. whether a block served under this rule actually landed
    /// in the rule's own backend or was rerouted to the fallback because
    /// the nominal backend refused it.
    fn was_fallback(&self, rule_id: Option<u32>, backend_id: BackendId) -> bool {
        rule_id
            .and_then(|id| self.classifier.rule_by_id(id))
            .map(|rule| self.registry.id_of(&rule.backend_name) != Some(backend_id))
            .unwrap_or(false)
    }

    /// Stamps the rule id into the block's header and credits the rule's
    /// statistics (match count, cache-hit count, residency), mirroring
    /// flexmalloc's per-location accounting in
    /// `FlexMalloc::malloc`/`calloc`/`realloc`.
    fn charge(
        &self,
        user: NonNull<u8>,
        rule_id: Option<u32>,
        size: usize,
        backend_id: BackendId,
        cache_hit: bool,
    ) {
        header::set_rule_id(user, rule_id);
        if let Some(rule) = rule_id.and_then(|id| self.classifier.rule_by_id(id)) {
            rule.stats.record_match(cache_hit);
            rule.stats.add_memory(size, self.was_fallback(rule_id, backend_id));
        }
    }

    /// Serves a `malloc`-shaped request: classify, check fit, fall back
    /// on overflow.
    pub fn route_malloc(
        &self,
        raw_pcs: &[u64],
        frames: &[ResolvedFrame],
        requested_size: usize,
    ) -> Option<NonNull<u8>> {
        let (backend_id, rule_id, cache_hit) = self.choose_backend(raw_pcs, frames, requested_size);
        let target = self.registry.get_by_id(backend_id)?;
        let (served_by, user) = if target.fits(requested_size) {
            (backend_id, target.acquire(requested_size)?)
        } else {
            target.record_unfitted_malloc(requested_size);
            if let Some(rule) = rule_id.and_then(|id| self.classifier.rule_by_id(id)) {
                rule.stats.record_unfit();
            }
            let fallback = self.registry.get_by_id(self.fallback)?;
            (self.fallback, fallback.acquire(requested_size)?)
        };
        self.charge(user, rule_id, requested_size, served_by, cache_hit);
        Some(user)
    }

    pub fn route_calloc(
        &self,
        raw_pcs: &[u64],
        frames: &[ResolvedFrame],
        n: usize,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let total = n.checked_mul(size)?;
        let (backend_id, rule_id, cache_hit) = self.choose_backend(raw_pcs, frames, total);
        let target = self.registry.get_by_id(backend_id)?;
        let (served_by, user) = if target.fits(total) {
            (backend_id, target.acquire_zeroed(n, size)?)
        } else {
            target.record_unfitted_calloc(total);
            if let Some(rule) = rule_id.and_then(|id| self.classifier.rule_by_id(id)) {
                rule.stats.record_unfit();
            }
            let fallback = self.registry.get_by_id(self.fallback)?;
            (self.fallback, fallback.acquire_zeroed(n, size)?)
        };
        self.charge(user, rule_id, total, served_by, cache_hit);
        Some(user)
    }

    pub fn route_aligned(
        &self,
        raw_pcs: &[u64],
        frames: &[ResolvedFrame],
        align: usize,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let (backend_id, rule_id, cache_hit) = self.choose_backend(raw_pcs, frames, size);
        let target = self.registry.get_by_id(backend_id)?;
        let (served_by, user) = if target.fits(size) {
            (backend_id, target.acquire_aligned(align, size)?)
        } else {
            target.record_unfitted_aligned_malloc(size);
            if let Some(rule) = rule_id.and_then(|id| self.classifier.rule_by_id(id)) {
                rule.stats.record_unfit();
            }
            let fallback = self.registry.get_by_id(self.fallback)?;
            (self.fallback, fallback.acquire_aligned(align, size)?)
        };
        self.charge(user, rule_id, size, served_by, cache_hit);
        Some(user)
    }

    /// Serves a `free`. A block whose header names [`NO_BACKEND`] came
    /// from the pre-init scratch buffer or a raw platform allocation made
    /// before the router existed; the front end is expected to have
    /// already filtered those out,
    /// so this is a no-op rather than a panic if one slips through.
    pub fn route_free(&self, user: NonNull<u8>) {
        let backend_id = header::backend_of(user);
        if backend_id == NO_BACKEND {
            return;
        }
        let size = header::size_of(user);
        let rule_id = header::rule_id_of(user);
        if let Some(rule) = rule_id.and_then(|id| self.classifier.rule_by_id(id)) {
            rule.stats.sub_memory(size, self.was_fallback(rule_id, backend_id));
        }
        if let Some(backend) = self.registry.get_by_id(backend_id) {
            backend.release(user);
        }
    }

    pub fn usable_size(&self, user: NonNull<u8>) -> usize {
        header::size_of(user)
    }

    /// The full cross-backend realloc state machine, mirroring
    /// `flex-malloc.cxx`'s `FlexMalloc::realloc`:
    ///
    /// - `user.is_none()` forwards to `malloc` and records the forward;
    /// - same backend before and after: an in-place
    ///   [`flexmem_membrane::Backend::resize`], counted as a self-realloc
    ///   only when the block actually grew;
    /// - different backends: allocate from the new one, copy
    ///   `min(old, new)` bytes across, release the old one, and record
    ///   the move as a source/target realloc pair on each side.
    pub fn route_realloc(
        &self,
        user: Option<NonNull<u8>>,
        raw_pcs: &[u64],
        frames: &[ResolvedFrame],
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let Some(user) = user else {
            let result = self.route_malloc(raw_pcs, frames, new_size);
            if let Some(ptr) = result {
                let backend_id = header::backend_of(ptr);
                if let Some(backend) = self.registry.get_by_id(backend_id) {
                    backend.record_realloc_forward_malloc();
                }
            }
            return result;
        };

        let prev_id = header::backend_of(user);
        let prev_size = header::size_of(user);
        let prev_rule_id = header::rule_id_of(user);
        let prev_was_fallback = self.was_fallback(prev_rule_id, prev_id);
        let (new_id, new_rule_id, cache_hit) = self.choose_backend(raw_pcs, frames, new_size);

        // Residency is only moved off the old rule once the operation has
        // actually produced a result — a failed resize/acquire leaves the
        // original block exactly as it was, still resident under its old
        // rule, and must not be debited.
        let discharge_prev = |rule_stats_size: usize| {
            if let Some(rule) = prev_rule_id.and_then(|id| self.classifier.rule_by_id(id)) {
                rule.stats.sub_memory(rule_stats_size, prev_was_fallback);
            }
        };

        if prev_id == new_id {
            let backend = self.registry.get_by_id(prev_id)?;
            if !backend.fits(new_size) {
                backend.record_unfitted_realloc(new_size);
            }
            let resized = backend.resize(user, new_size)?;
            if new_size > prev_size {
                backend.record_self_realloc(prev_size);
            }
            let final_size = backend.usable_size(resized);
            discharge_prev(prev_size);
            self.charge(resized, new_rule_id, final_size, prev_id, cache_hit);
            return Some(resized);
        }

        let new_backend = self.registry.get_by_id(new_id)?;
        if !new_backend.fits(new_size) {
            new_backend.record_unfitted_realloc(new_size);
        }
        let new_ptr = new_backend.acquire(new_size)?;
        let copy_len = prev_size.min(new_size);
        new_backend.copy_from(new_ptr, user, copy_len);

        if let Some(prev_backend) = self.registry.get_by_id(prev_id) {
            prev_backend.release(user);
            prev_backend.record_source_realloc(copy_len);
        }
        new_backend.record_target_realloc(copy_len);
        discharge_prev(prev_size);
        self.charge(new_ptr, new_rule_id, new_size, new_id, cache_hit);

        Some(new_ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::parse_rule_line;
    use flexmem_membrane::backends::capacity_pool::CapacityPoolBackend;
    use flexmem_membrane::backends::posix::PosixBackend;
    use flexmem_membrane::platform::RawAllocFns;

    fn harness() -> (Registry, Classifier, CallStackCache) {
        let registry = Registry::new(vec![
            Box::new(PosixBackend::new(0, RawAllocFns::default())),
            Box::new(CapacityPoolBackend::new(1, "hi", RawAllocFns::default())),
        ]);
        let rule = parse_rule_line("a.c:10 @ hi", 0, true).unwrap().unwrap();
        let classifier = Classifier::new(vec![rule], true);
        let cache = CallStackCache::default();
        (registry, classifier, cache)
    }

    fn source_stack() -> Vec<ResolvedFrame> {
        vec![ResolvedFrame::Source { file: "a.c".into(), line: 10 }]
    }

    #[test]
    fn malloc_routes_matching_call_site_to_the_classified_backend() {
        let (registry, classifier, cache) = harness();
        registry.get("hi").unwrap().configure("Size 1 MBytes");
        let router = Router::new(&registry, &classifier, &cache, 0, None);
        let p = router.route_malloc(&[1, 2, 3], &source_stack(), 64).unwrap();
        assert_eq!(header::backend_of(p), 1);
        router.route_free(p);
    }

    #[test]
    fn malloc_falls_back_when_the_classified_backend_does_not_fit() {
        let (registry, classifier, cache) = harness();
        registry.get("hi").unwrap().configure("Size 1 Bytes");
        let router = Router::new(&registry, &classifier, &cache, 0, None);
        let p = router.route_malloc(&[1, 2, 3], &source_stack(), 64).unwrap();
        assert_eq!(header::backend_of(p), 0);
        router.route_free(p);
    }

    #[test]
    fn unmatched_call_site_uses_the_fallback_backend() {
        let (registry, classifier, cache) = harness();
        let router = Router::new(&registry, &classifier, &cache, 0, None);
        let stack = vec![ResolvedFrame::Unresolved];
        let p = router.route_malloc(&[9, 9], &stack, 32).unwrap();
        assert_eq!(header::backend_of(p), 0);
        router.route_free(p);
    }

    #[test]
    fn min_size_threshold_overrides_classification() {
        let (registry, classifier, cache) = harness();
        let threshold = MinSizeThreshold { max_bytes: 128, backend: 0 };
        let router = Router::new(&registry, &classifier, &cache, 1, Some(threshold));
        // Even though the call site classifies to backend 1 ("hi"), the
        // small request is below the threshold and routes to backend 0.
        let p = router.route_malloc(&[1, 2, 3], &source_stack(), 16).unwrap();
        assert_eq!(header::backend_of(p), 0);
        router.route_free(p);
    }

    #[test]
    fn a_request_exactly_at_the_threshold_boundary_is_still_short_circuited() {
        let (registry, classifier, cache) = harness();
        let threshold = MinSizeThreshold { max_bytes: 128, backend: 0 };
        let router = Router::new(&registry, &classifier, &cache, 1, Some(threshold));
        // size == threshold.max_bytes routes to the threshold backend;
        // only size strictly greater than the threshold is classified.
        let at_boundary = router.route_malloc(&[1, 2, 3], &source_stack(), 128).unwrap();
        assert_eq!(header::backend_of(at_boundary), 0);
        router.route_free(at_boundary);

        let over_boundary = router.route_malloc(&[1, 2, 3], &source_stack(), 129).unwrap();
        assert_eq!(header::backend_of(over_boundary), 1);
        router.route_free(over_boundary);
    }

    #[test]
    fn a_matched_malloc_stamps_the_rule_id_and_credits_nominal_residency() {
        let (registry, classifier, cache) = harness();
        registry.get("hi").unwrap().configure("Size 1 MBytes");
        let router = Router::new(&registry, &classifier, &cache, 0, None);
        let rule = classifier.rule_by_id(0).unwrap();

        let p = router.route_malloc(&[1, 2, 3], &source_stack(), 64).unwrap();
        assert_eq!(header::rule_id_of(p), Some(0));
        assert_eq!(rule.stats.current_nominal(), 64);
        assert_eq!(rule.stats.current_fallback(), 0);
        assert_eq!(rule.stats.matches_total(), 1);
        assert_eq!(rule.stats.matches_cache_hit(), 0);

        router.route_free(p);
        assert_eq!(rule.stats.current_nominal(), 0);
    }

    #[test]
    fn a_second_identical_call_site_is_a_cache_hit_and_is_credited_as_such() {
        let (registry, classifier, cache) = harness();
        registry.get("hi").unwrap().configure("Size 1 MBytes");
        let router = Router::new(&registry, &classifier, &cache, 0, None);
        let rule = classifier.rule_by_id(0).unwrap();

        let a = router.route_malloc(&[1, 2, 3], &source_stack(), 64).unwrap();
        let b = router.route_malloc(&[1, 2, 3], &source_stack(), 64).unwrap();
        assert_eq!(rule.stats.matches_total(), 2);
        assert_eq!(rule.stats.matches_cache_hit(), 1);

        router.route_free(a);
        router.route_free(b);
    }

    #[test]
    fn an_unfit_match_is_charged_to_the_rule_s_fallback_bucket() {
        let (registry, classifier, cache) = harness();
        registry.get("hi").unwrap().configure("Size 1 Bytes");
        let router = Router::new(&registry, &classifier, &cache, 0, None);
        let rule = classifier.rule_by_id(0).unwrap();

        let p = router.route_malloc(&[1, 2, 3], &source_stack(), 64).unwrap();
        assert_eq!(header::backend_of(p), 0);
        assert_eq!(header::rule_id_of(p), Some(0));
        assert_eq!(rule.stats.matches_unfit(), 1);
        assert_eq!(rule.stats.current_fallback(), 64);
        assert_eq!(rule.stats.current_nominal(), 0);

        router.route_free(p);
        assert_eq!(rule.stats.current_fallback(), 0);
    }

    #[test]
    fn realloc_moving_across_backends_migrates_rule_residency() {
        let (registry, classifier, cache) = harness();
        registry.get("hi").unwrap().configure("Size 1 MBytes");
        let router = Router::new(&registry, &classifier, &cache, 0, None);
        let rule = classifier.rule_by_id(0).unwrap();

        let unmatched = vec![ResolvedFrame::Unresolved];
        let p = router.route_malloc(&[100], &unmatched, 8).unwrap();
        assert_eq!(header::rule_id_of(p), None);

        let grown = router
            .route_realloc(Some(p), &[1, 2, 3], &source_stack(), 1024)
            .unwrap();
        assert_eq!(header::rule_id_of(grown), Some(0));
        assert_eq!(rule.stats.current_nominal(), 1024);

        router.route_free(grown);
        assert_eq!(rule.stats.current_nominal(), 0);
    }

    #[test]
    fn realloc_across_backends_copies_the_overlapping_prefix() {
        let (registry, classifier, cache) = harness();
        registry.get("hi").unwrap().configure("Size 1 MBytes");
        let router = Router::new(&registry, &classifier, &cache, 0, None);

        let unmatched = vec![ResolvedFrame::Unresolved];
        let p = router.route_malloc(&[100], &unmatched, 8).unwrap();
        header::write_bytes(p, b"DEADBEEF");
        assert_eq!(header::backend_of(p), 0);

        let grown = router
            .route_realloc(Some(p), &[1, 2, 3], &source_stack(), 1024)
            .unwrap();
        assert_eq!(header::backend_of(grown), 1);
        assert_eq!(header::read_bytes(grown, 8), b"DEADBEEF");
        router.route_free(grown);
    }

    #[test]
    fn realloc_same_backend_resizes_in_place() {
        let (registry, classifier, cache) = harness();
        let router = Router::new(&registry, &classifier, &cache, 0, None);
        let unmatched = vec![ResolvedFrame::Unresolved];
        let p = router.route_malloc(&[7], &unmatched, 16).unwrap();
        let grown = router.route_realloc(Some(p), &[7], &unmatched, 512).unwrap();
        assert_eq!(header::backend_of(grown), 0);
        router.route_free(grown);
    }

    #[test]
    fn realloc_with_no_prior_pointer_forwards_to_malloc() {
        let (registry, classifier, cache) = harness();
        let router = Router::new(&registry, &classifier, &cache, 0, None);
        let p = router.route_realloc(None, &[1], &source_stack(), 16);
        assert!(p.is_some());
        router.route_free(p.unwrap());
    }
}

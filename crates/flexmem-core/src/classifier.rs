//! The call-stack classifier.
//!
//! Walks a resolved call stack against the loaded rule set and returns the
//! most specific matching rule, if any. Grounded on
//! flexmalloc's `code-locations.cxx`:
//!
//! - rules are sorted by frame count ascending so that "how many frames
//!   could possibly match at this stack depth" is a single partition
//!   point (`create_fast_indexes_for_frames`'s `_fast_indexes_frames[d]`);
//! - trailing unresolved frames are clipped from the deep end of the walk
//!   before matching (`clean_source_location`), so a stack that bottoms
//!   out in an unresolvable loader frame still matches rules written
//!   against its resolvable prefix;
//! - frame 0 gets special treatment in source mode: compared strictly
//!   when translated, otherwise treated as an automatic match, because
//!   the immediate call site is the frame most often missing debug info
//!   (`match` in `code-locations.cxx`). Raw mode has no such exception:
//!   every frame, including frame 0, must match exactly.

use flexmem_membrane::module_map::ResolvedFrame;

use crate::rule::{FrameSpec, Rule};

pub struct Classifier {
    /// Rules, sorted ascending by `depth()`.
    rules: Vec<Rule>,
    /// `depth_start[d]` = index of the first rule (in `rules`) whose depth
    /// is `>= d`, mirroring flexmalloc's
    /// `_fast_indexes_frames`: `rules[depth_start[d]..depth_start[d + 1]]`
    /// is exactly the set of rules whose depth equals `d`, since a rule
    /// only ever matches a stack of the *same* depth, never merely a bound
    /// on it; `create_fast_indexes_for_frames` in `code-locations.cxx`
    /// builds the same per-depth exact range, not a cumulative one.
    depth_start: Vec<usize>,
    min_depth: usize,
    max_depth: usize,
    source_mode: bool,
    /// Whether source-mode file comparisons use the whole path
    /// (`FLEXMEM_COMPARE_WHOLE_PATH`) or just the basename. File
    /// comparisons are always case-insensitive either way, mirroring
    /// `code-locations.cxx`'s `strcasecmp`.
    compare_whole_path: bool,
}

impl Classifier {
    pub fn new(rules: Vec<Rule>, source_mode: bool) -> Self {
        Self::with_path_mode(rules, source_mode, false)
    }

    pub fn with_path_mode(mut rules: Vec<Rule>, source_mode: bool, compare_whole_path: bool) -> Self {
        let max_depth = flexmem_membrane::cache::CALLSTACKS_PER_ENTRY;
        for rule in &mut rules {
            if rule.frames.len() > max_depth {
                eprintln!(
                    "flexmem: rule [{}] has {} frames, exceeding the configured depth ceiling \
                     of {max_depth}; truncating to the shallowest {max_depth}",
                    rule.id,
                    rule.frames.len(),
                );
                rule.frames.truncate(max_depth);
            }
        }
        rules.sort_by_key(|r| r.depth());
        let min_depth = rules.first().map(Rule::depth).unwrap_or(0);
        let mut depth_start = vec![0usize; max_depth + 2];
        for d in 0..=max_depth + 1 {
            depth_start[d] = rules.partition_point(|r| r.depth() < d);
        }
        Classifier {
            rules,
            depth_start,
            min_depth,
            max_depth,
            source_mode,
            compare_whole_path,
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn rule_by_id(&self, id: u32) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// Per-rule statistics lines: resolved frames, match counts, cache hit
    /// ratio, peak live objects, peak bytes in each residency bucket —
    /// mirroring flexmalloc's per-location lines in
    /// `show_statistics` (`code-locations.cxx`).
    pub fn report(&self, out: &mut String) {
        use std::fmt::Write as _;
        for rule in &self.rules {
            let _ = writeln!(
                out,
                "Rule [{}] -> {}: {} matches ({:.2}% cache hit), peak {} live objects, \
                 peak {} bytes nominal, peak {} bytes fallback",
                frames_to_string(&rule.frames),
                rule.backend_name,
                rule.stats.matches_total(),
                rule.stats.cache_hit_ratio(),
                rule.stats.peak_live_objects(),
                rule.stats.peak_nominal(),
                rule.stats.peak_fallback(),
            );
        }
    }

    /// The per-rule half of the heterogeneous-memory "visualizer" report:
    /// one `callstack;bytes;weight;backend` line per rule. Paired with
    /// [`flexmem_membrane::registry::Registry::visualizer_header`], which
    /// supplies the `#vis` backend-capacity headers, reproduced together
    /// from `code-locations.cxx`'s `show_hmem_visualizer_stats`.
    pub fn visualizer_report(&self, out: &mut String) {
        use std::fmt::Write as _;
        for rule in &self.rules {
            let bytes = rule.stats.peak_nominal() + rule.stats.peak_fallback();
            let _ = writeln!(
                out,
                "{};{};{};{}",
                frames_to_string(&rule.frames),
                bytes,
                rule.stats.matches_total(),
                rule.backend_name,
            );
        }
    }

    /// Clips trailing unresolved frames from the deep end of a walked
    /// stack, matching `clean_source_location`'s tail-clipping behavior.
    fn effective_len(frames: &[ResolvedFrame]) -> usize {
        let mut n = frames.len();
        while n > 0 && matches!(frames[n - 1], ResolvedFrame::Unresolved) {
            n -= 1;
        }
        n
    }

    /// Case-insensitive file comparison (`strcasecmp` in flexmalloc),
    /// restricted to the basename on each side unless whole-path
    /// comparison is configured (`FLEXMEM_COMPARE_WHOLE_PATH`).
    fn files_match(&self, a: &str, b: &str) -> bool {
        if self.compare_whole_path {
            a.eq_ignore_ascii_case(b)
        } else {
            basename(a).eq_ignore_ascii_case(basename(b))
        }
    }

    fn frame_matches(&self, spec: &FrameSpec, resolved: &ResolvedFrame) -> bool {
        match (spec, resolved) {
            (FrameSpec::Source { file, line }, ResolvedFrame::Source { file: f, line: l }) => {
                self.files_match(file, f) && line == l
            }
            (FrameSpec::Raw { module, offset }, ResolvedFrame::Raw { module: m, offset: o }) => {
                // A rule's MODULE token is the short name an operator wrote
                // by hand (`libhbw.so`); the oracle resolves candidates
                // against the live module map and reports the full
                // filesystem path (`/usr/lib/x86_64-linux-gnu/libhbw.so`).
                // Both offsets are already module-relative, so comparing
                // basenames plus offsets is equivalent to resolving the
                // rule's module to a base address and comparing absolute
                // addresses, without needing to cache a base address that
                // could go stale across a `dlopen`/`dlclose`.
                basename(module).eq_ignore_ascii_case(basename(m)) && *offset == *o as u64
            }
            _ => false,
        }
    }

    fn rule_matches(&self, rule: &Rule, frames: &[ResolvedFrame]) -> bool {
        for (i, spec) in rule.frames.iter().enumerate() {
            let candidate = &frames[i];
            // Source mode only: an untranslated candidate is skipped
            // (treated as matching) at every position, not just frame 0 —
            // the first frame is simply the position most often missing
            // debug info in practice, not a special case in the matcher
            // itself. A translated candidate is still always compared
            // strictly, frame 0 included. Raw mode has no such exception:
            // it compares pcs element-wise, so an unresolved candidate
            // there (a pc outside every known module) fails the match
            // like any other disagreement.
            if self.source_mode && matches!(candidate, ResolvedFrame::Unresolved) {
                continue;
            }
            if !self.frame_matches(spec, candidate) {
                return false;
            }
        }
        true
    }

    /// Classifies one resolved call stack, shallowest frame first. Only
    /// rules whose `depth()` exactly equals the stack's effective depth are
    /// even considered; among those, the first in sorted order to match
    /// wins.
    pub fn classify(&self, frames: &[ResolvedFrame]) -> Option<&Rule> {
        let effective_len = Self::effective_len(frames);
        if effective_len == 0
            || self.rules.is_empty()
            || effective_len < self.min_depth
            || effective_len > self.max_depth
        {
            return None;
        }
        let start = self.depth_start[effective_len];
        let end = self.depth_start[effective_len + 1];
        for rule in &self.rules[start..end] {
            if self.rule_matches(rule, &frames[..effective_len]) {
                rule.mark_used();
                return Some(rule);
            }
        }
        None
    }
}

/// The component after the last `/` (or the whole string if there is
/// none), used for basename-mode file comparisons.
fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn frames_to_string(frames: &[FrameSpec]) -> String {
    frames
        .iter()
        .map(|f| match f {
            FrameSpec::Source { file, line } => format!("{file}:{line}"),
            FrameSpec::Raw { module, offset } => format!("{module}!{offset:#x}"),
        })
        .collect::<Vec<_>>()
        .join(" > ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::parse_rule_line;

    fn rule(line: &str, id: u32, source_mode: bool) -> Rule {
        parse_rule_line(line, id, source_mode).unwrap().unwrap()
    }

    #[test]
    fn matches_a_single_frame_source_rule() {
        let rules = vec![rule("a.c:10 @ hbw", 0, true)];
        let classifier = Classifier::new(rules, true);
        let stack = vec![ResolvedFrame::Source {
            file: "a.c".into(),
            line: 10,
        }];
        let hit = classifier.classify(&stack).unwrap();
        assert_eq!(hit.backend_name, "hbw");
        assert!(hit.was_used());
    }

    #[test]
    fn untranslated_frame_zero_does_not_block_a_match_in_source_mode() {
        let rules = vec![rule("a.c:10 @ hbw", 0, true)];
        let classifier = Classifier::new(rules, true);
        // Frame 0 itself is unresolved, but a resolved deeper frame keeps
        // it from being clipped off the walk entirely; the rule only
        // inspects index 0, and an unresolved frame 0 is an automatic
        // pass in source mode.
        let stack = vec![
            ResolvedFrame::Unresolved,
            ResolvedFrame::Source { file: "z.c".into(), line: 1 },
        ];
        assert_eq!(classifier.classify(&stack).unwrap().backend_name, "hbw");
    }

    #[test]
    fn more_specific_multi_frame_rule_wins_over_single_frame_rule() {
        let rules = vec![
            rule("a.c:10 @ general", 0, true),
            rule("a.c:10 > b.c:20 @ specific", 1, true),
        ];
        let classifier = Classifier::new(rules, true);
        let stack = vec![
            ResolvedFrame::Source { file: "a.c".into(), line: 10 },
            ResolvedFrame::Source { file: "b.c".into(), line: 20 },
        ];
        assert_eq!(classifier.classify(&stack).unwrap().backend_name, "specific");
    }

    #[test]
    fn trailing_unresolved_frames_are_clipped_before_matching() {
        let rules = vec![rule("a.c:10 @ hbw", 0, true)];
        let classifier = Classifier::new(rules, true);
        let stack = vec![
            ResolvedFrame::Source { file: "a.c".into(), line: 10 },
            ResolvedFrame::Unresolved,
            ResolvedFrame::Unresolved,
        ];
        assert_eq!(classifier.classify(&stack).unwrap().backend_name, "hbw");
    }

    #[test]
    fn a_rule_never_matches_a_stack_of_a_different_effective_depth() {
        // Depth is an exact match requirement, not an upper bound: a
        // one-frame rule must not match a two-frame
        // stack just because its single frame happens to agree with the
        // stack's first frame.
        let rules = vec![rule("a.c:10 @ general", 0, true)];
        let classifier = Classifier::new(rules, true);
        let stack = vec![
            ResolvedFrame::Source { file: "a.c".into(), line: 10 },
            ResolvedFrame::Source { file: "b.c".into(), line: 20 },
        ];
        assert!(classifier.classify(&stack).is_none());
    }

    #[test]
    fn source_file_comparison_is_case_insensitive() {
        let rules = vec![rule("A.C:10 @ hbw", 0, true)];
        let classifier = Classifier::new(rules, true);
        let stack = vec![ResolvedFrame::Source { file: "a.c".into(), line: 10 }];
        assert_eq!(classifier.classify(&stack).unwrap().backend_name, "hbw");
    }

    #[test]
    fn basename_mode_ignores_directory_components_by_default() {
        let rules = vec![rule("/src/a.c:10 @ hbw", 0, true)];
        let classifier = Classifier::new(rules, true);
        let stack = vec![ResolvedFrame::Source { file: "/build/obj/a.c".into(), line: 10 }];
        assert_eq!(classifier.classify(&stack).unwrap().backend_name, "hbw");
    }

    #[test]
    fn whole_path_mode_requires_the_full_path_to_agree() {
        let rules = vec![rule("/src/a.c:10 @ hbw", 0, true)];
        let classifier = Classifier::with_path_mode(rules, true, true);
        let stack = vec![ResolvedFrame::Source { file: "/build/obj/a.c".into(), line: 10 }];
        assert!(classifier.classify(&stack).is_none());

        let rules = vec![rule("/src/a.c:10 @ hbw", 0, true)];
        let classifier = Classifier::with_path_mode(rules, true, true);
        let stack = vec![ResolvedFrame::Source { file: "/src/a.c".into(), line: 10 }];
        assert_eq!(classifier.classify(&stack).unwrap().backend_name, "hbw");
    }

    #[test]
    fn raw_mode_requires_frame_zero_to_match_exactly() {
        let rules = vec![rule("libfoo.so!0x10 @ hbw", 0, false)];
        let classifier = Classifier::new(rules, false);
        let wrong = vec![ResolvedFrame::Raw {
            module: "libbar.so".into(),
            offset: 0x10,
        }];
        assert!(classifier.classify(&wrong).is_none());
    }

    #[test]
    fn raw_mode_matches_a_full_path_candidate_against_a_short_rule_module() {
        let rules = vec![rule("libhbw.so!0x10 @ hbw", 0, false)];
        let classifier = Classifier::new(rules, false);
        let stack = vec![ResolvedFrame::Raw {
            module: "/usr/lib/x86_64-linux-gnu/libhbw.so".into(),
            offset: 0x10,
        }];
        assert_eq!(classifier.classify(&stack).unwrap().backend_name, "hbw");
    }

    #[test]
    fn report_includes_frames_backend_and_match_count() {
        let rules = vec![rule("a.c:10 @ hbw", 0, true)];
        let classifier = Classifier::new(rules, true);
        classifier.classify(&vec![ResolvedFrame::Source { file: "a.c".into(), line: 10 }]);

        let mut out = String::new();
        classifier.report(&mut out);
        assert!(out.contains("a.c:10"));
        assert!(out.contains("hbw"));
        assert!(out.contains("1 matches"));
    }

    #[test]
    fn visualizer_report_emits_one_semicolon_delimited_line_per_rule() {
        let rules = vec![rule("a.c:10 @ hbw", 0, true)];
        let classifier = Classifier::new(rules, true);

        let mut out = String::new();
        classifier.visualizer_report(&mut out);
        let line = out.lines().next().unwrap();
        let fields: Vec<&str> = line.split(';').collect();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0], "a.c:10");
        assert_eq!(fields[3], "hbw");
    }

    #[test]
    fn a_rule_deeper_than_the_configured_ceiling_is_truncated_at_load_time() {
        let ceiling = flexmem_membrane::cache::CALLSTACKS_PER_ENTRY;
        let mut line = String::new();
        for i in 0..ceiling + 5 {
            if i > 0 {
                line.push_str(" > ");
            }
            line.push_str(&format!("f{i}.c:{i}"));
        }
        line.push_str(" @ hbw");
        let rule = rule(&line, 0, true);
        assert_eq!(rule.depth(), ceiling + 5);

        let classifier = Classifier::new(vec![rule], true);
        assert_eq!(classifier.rules().next().unwrap().depth(), ceiling);

        let mut stack = Vec::new();
        for i in 0..ceiling {
            stack.push(ResolvedFrame::Source { file: format!("f{i}.c"), line: i as u32 });
        }
        assert_eq!(classifier.classify(&stack).unwrap().backend_name, "hbw");
    }

    #[test]
    fn no_rules_means_no_match() {
        let classifier = Classifier::new(vec![], true);
        let stack = vec![ResolvedFrame::Source { file: "a.c".into(), line: 1 }];
        assert!(classifier.classify(&stack).is_none());
    }
}

//! Rule types for the call-stack classifier.
//!
//! A rule is one line of the rules file: an ordered sequence of frames,
//! shallowest first, followed by `@ NAME` naming the backend it selects.
//! Two frame grammars are supported, chosen once for the whole rule set:
//! source mode (`FILE:LINE`) and raw mode
//! (`MODULE!HEXOFFSET`). Grounded on flexmalloc's
//! `code-locations.cxx`, whose `process_source_location` and
//! `process_raw_location` parse exactly these two shapes.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameSpec {
    Source { file: String, line: u32 },
    Raw { module: String, offset: u64 },
}

/// Per-rule statistics: current and
/// peak live bytes in the rule's nominal backend and, separately, in the
/// fallback backend for requests the nominal backend refused; peak
/// simultaneously live objects; match counts split by whether the
/// classification came straight from the classifier or from a cache hit,
/// and how many matches were unfit.
#[derive(Debug, Default)]
pub struct RuleStats {
    current_nominal: AtomicUsize,
    peak_nominal: AtomicUsize,
    current_fallback: AtomicUsize,
    peak_fallback: AtomicUsize,
    live_objects: AtomicUsize,
    peak_live_objects: AtomicUsize,
    matches_total: AtomicU64,
    matches_cache_hit: AtomicU64,
    matches_unfit: AtomicU64,
}

impl RuleStats {
    pub fn record_match(&self, cache_hit: bool) {
        self.matches_total.fetch_add(1, Ordering::Relaxed);
        if cache_hit {
            self.matches_cache_hit.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_unfit(&self) {
        self.matches_unfit.fetch_add(1, Ordering::Relaxed);
    }

    /// Charges `bytes` to the rule's residency bucket, bumping the peak if
    /// it grew. `was_fallback` selects the bucket: the nominal backend's
    /// bucket for requests the classifier's chosen backend actually
    /// served, or the fallback bucket for requests that were refused and
    /// rerouted to a different backend than the one it names.
    pub fn add_memory(&self, bytes: usize, was_fallback: bool) {
        let (current, peak) = if was_fallback {
            (&self.current_fallback, &self.peak_fallback)
        } else {
            (&self.current_nominal, &self.peak_nominal)
        };
        let new = current.fetch_add(bytes, Ordering::Relaxed) + bytes;
        peak.fetch_max(new, Ordering::Relaxed);

        let live = self.live_objects.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_live_objects.fetch_max(live, Ordering::Relaxed);
    }

    pub fn sub_memory(&self, bytes: usize, was_fallback: bool) {
        let current = if was_fallback {
            &self.current_fallback
        } else {
            &self.current_nominal
        };
        let _ = current.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
            Some(cur.saturating_sub(bytes))
        });
        let _ = self
            .live_objects
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some(cur.saturating_sub(1))
            });
    }

    pub fn current_nominal(&self) -> usize {
        self.current_nominal.load(Ordering::Relaxed)
    }
    pub fn peak_nominal(&self) -> usize {
        self.peak_nominal.load(Ordering::Relaxed)
    }
    pub fn current_fallback(&self) -> usize {
        self.current_fallback.load(Ordering::Relaxed)
    }
    pub fn peak_fallback(&self) -> usize {
        self.peak_fallback.load(Ordering::Relaxed)
    }
    pub fn peak_live_objects(&self) -> usize {
        self.peak_live_objects.load(Ordering::Relaxed)
    }
    pub fn matches_total(&self) -> u64 {
        self.matches_total.load(Ordering::Relaxed)
    }
    pub fn matches_cache_hit(&self) -> u64 {
        self.matches_cache_hit.load(Ordering::Relaxed)
    }
    pub fn matches_unfit(&self) -> u64 {
        self.matches_unfit.load(Ordering::Relaxed)
    }

    /// Cache hit ratio for this rule alone, as a percentage, matching
    /// flexmalloc's per-location `show_statistics` line.
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.matches_total();
        if total == 0 {
            return 0.0;
        }
        100.0 * self.matches_cache_hit() as f64 / total as f64
    }
}

/// One parsed rule, plus the per-rule bookkeeping the classifier and
/// reporting layer both need: a stable id (used as the header's `Aux`
/// rule id), whether this rule has ever matched a call stack, and its
/// residency statistics.
#[derive(Debug)]
pub struct Rule {
    pub id: u32,
    pub frames: Vec<FrameSpec>,
    pub backend_name: String,
    used: AtomicBool,
    pub stats: RuleStats,
}

impl Rule {
    pub fn new(id: u32, frames: Vec<FrameSpec>, backend_name: String) -> Self {
        Rule {
            id,
            frames,
            backend_name,
            used: AtomicBool::new(false),
            stats: RuleStats::default(),
        }
    }

    pub fn mark_used(&self) {
        self.used.store(true, Ordering::Relaxed);
    }

    pub fn was_used(&self) -> bool {
        self.used.load(Ordering::Relaxed)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

/// Parses one line of a rules file: `FRAME (> FRAME)* @ NAME`.
///
/// Returns `None` for blank lines and `#`-prefixed comments, consistent
/// with flexmalloc's `readfile` skipping such lines
/// before ever reaching the parser.
pub fn parse_rule_line(line: &str, id: u32, source_mode: bool) -> Option<Result<Rule, String>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let Some((frames_part, name_part)) = line.rsplit_once('@') else {
        return Some(Err(format!("line {id}: missing '@ NAME' marker")));
    };
    let name = name_part.trim().to_string();
    if name.is_empty() {
        return Some(Err(format!("line {id}: empty allocator name")));
    }

    let mut frames = Vec::new();
    for token in frames_part.split('>') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let frame = if source_mode {
            match token.rsplit_once(':') {
                Some((file, line_s)) => match line_s.parse::<u32>() {
                    Ok(line_no) => FrameSpec::Source {
                        file: file.to_string(),
                        line: line_no,
                    },
                    Err(_) => {
                        return Some(Err(format!(
                            "line {id}: bad source frame '{token}' (line number not numeric)"
                        )))
                    }
                },
                None => {
                    return Some(Err(format!(
                        "line {id}: bad source frame '{token}' (expected FILE:LINE)"
                    )))
                }
            }
        } else {
            match token.rsplit_once('!') {
                Some((module, offset_s)) => {
                    match u64::from_str_radix(offset_s.trim_start_matches("0x"), 16) {
                        Ok(offset) => FrameSpec::Raw {
                            module: module.to_string(),
                            offset,
                        },
                        Err(_) => {
                            return Some(Err(format!(
                                "line {id}: bad raw frame '{token}' (offset not hex)"
                            )))
                        }
                    }
                }
                None => {
                    return Some(Err(format!(
                        "line {id}: bad raw frame '{token}' (expected MODULE!OFFSET)"
                    )))
                }
            }
        };
        frames.push(frame);
    }

    if source_mode {
        while frames.len() > 1 {
            match frames.last() {
                Some(FrameSpec::Source { file, line })
                    if *line == 0
                        && (file.eq_ignore_ascii_case("Unresolved")
                            || file.eq_ignore_ascii_case("_NOT_Found")) =>
                {
                    frames.pop();
                }
                _ => break,
            }
        }
    }

    if frames.is_empty() {
        return Some(Err(format!("line {id}: rule has no frames")));
    }

    Some(Ok(Rule::new(id, frames, name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_single_frame_source_rule() {
        let rule = parse_rule_line("foo.c:42 @ hbw", 0, true).unwrap().unwrap();
        assert_eq!(rule.backend_name, "hbw");
        assert_eq!(
            rule.frames,
            vec![FrameSpec::Source {
                file: "foo.c".to_string(),
                line: 42
            }]
        );
    }

    #[test]
    fn parses_a_multi_frame_raw_rule() {
        let rule = parse_rule_line("libfoo.so!0x100 > libbar.so!0x200 @ pmem", 1, false)
            .unwrap()
            .unwrap();
        assert_eq!(rule.frames.len(), 2);
        assert_eq!(
            rule.frames[1],
            FrameSpec::Raw {
                module: "libbar.so".to_string(),
                offset: 0x200
            }
        );
    }

    #[test]
    fn a_rules_unresolved_tail_is_clipped_at_load_time() {
        let rule = parse_rule_line(
            "a.c:1 > b.c:2 > c.c:3 > Unresolved:0 > Unresolved:0 @ hbw",
            0,
            true,
        )
        .unwrap()
        .unwrap();
        assert_eq!(rule.depth(), 3);
        assert_eq!(
            rule.frames,
            vec![
                FrameSpec::Source { file: "a.c".to_string(), line: 1 },
                FrameSpec::Source { file: "b.c".to_string(), line: 2 },
                FrameSpec::Source { file: "c.c".to_string(), line: 3 },
            ]
        );
    }

    #[test]
    fn an_unresolved_tail_frame_with_a_nonzero_line_is_not_clipped() {
        let rule = parse_rule_line("a.c:1 > Unresolved:7 @ hbw", 0, true)
            .unwrap()
            .unwrap();
        assert_eq!(rule.depth(), 2);
    }

    #[test]
    fn tail_clipping_does_not_apply_in_raw_mode() {
        let rule = parse_rule_line("libfoo.so!0x10 > Unresolved!0x0 @ hbw", 1, false)
            .unwrap()
            .unwrap();
        assert_eq!(rule.depth(), 2);
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        assert!(parse_rule_line("", 0, true).is_none());
        assert!(parse_rule_line("   ", 0, true).is_none());
        assert!(parse_rule_line("# a comment", 0, true).is_none());
    }

    #[test]
    fn rejects_a_rule_missing_the_name_marker() {
        assert!(parse_rule_line("foo.c:42", 0, true).unwrap().is_err());
    }

    #[test]
    fn mark_used_is_observable() {
        let rule = Rule::new(0, vec![FrameSpec::Source { file: "a".into(), line: 1 }], "x".into());
        assert!(!rule.was_used());
        rule.mark_used();
        assert!(rule.was_used());
    }

    #[test]
    fn rule_stats_track_nominal_and_fallback_buckets_independently() {
        let stats = RuleStats::default();
        stats.add_memory(1024, false);
        stats.add_memory(2048, true);
        assert_eq!(stats.current_nominal(), 1024);
        assert_eq!(stats.current_fallback(), 2048);
        assert_eq!(stats.peak_nominal(), 1024);
        assert_eq!(stats.peak_fallback(), 2048);
        stats.sub_memory(1024, false);
        assert_eq!(stats.current_nominal(), 0);
        assert_eq!(stats.peak_nominal(), 1024);
    }

    #[test]
    fn rule_stats_cache_hit_ratio_matches_scenario_four() {
        let stats = RuleStats::default();
        stats.record_match(false);
        stats.record_match(true);
        assert_eq!(stats.matches_total(), 2);
        assert_eq!(stats.matches_cache_hit(), 1);
        assert!((stats.cache_hit_ratio() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn peak_live_objects_tracks_the_historical_maximum() {
        let stats = RuleStats::default();
        stats.add_memory(8, false);
        stats.add_memory(8, false);
        stats.sub_memory(8, false);
        assert_eq!(stats.peak_live_objects(), 2);
    }
}

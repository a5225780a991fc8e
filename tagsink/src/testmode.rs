//! Expected-EPC test sessions: load a list of EPCs, tick them off as the
//! reader sees them, report what was left unread.
//!
//! Sessions carry a monotonic id so match events that were produced under an
//! older upload can be recognized as stale and discarded.

use crate::erp::normalize_epc;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::SystemTime;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub name: String,
    pub total_lines: usize,
    pub valid_lines: usize,
    pub unique_epcs: usize,
    pub duplicate_lines: usize,
    pub invalid_lines: usize,
    pub session_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchResult {
    pub matched: bool,
    pub newly_read: bool,
    pub epc: String,
    pub read_count: usize,
    pub total: usize,
    pub session_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopResult {
    pub session_id: u64,
    pub name: String,
    pub total: usize,
    pub read: usize,
    pub unread: usize,
}

#[derive(Default)]
struct TestState {
    active: bool,
    session_id: u64,
    name: String,
    started_at: Option<SystemTime>,
    expected: HashSet<String>,
    read: HashSet<String>,
}

#[derive(Default)]
pub struct TestMode {
    state: Mutex<TestState>,
}

impl TestMode {
    pub fn new() -> Self {
        TestMode::default()
    }

    /// Replaces the session with the EPC list parsed from `content`.
    pub fn load(&self, name: &str, content: &str) -> Result<LoadStats> {
        let (epcs, mut stats) = parse_epc_list(content);
        stats.name = name.to_string();
        if epcs.is_empty() {
            return Err(Error::Other("no valid EPC found in file".into()));
        }

        let mut state = self.state.lock();
        state.expected = epcs.into_iter().collect();
        state.read = HashSet::with_capacity(state.expected.len());
        state.active = true;
        state.name = name.to_string();
        state.started_at = Some(SystemTime::now());
        state.session_id += 1;

        stats.session_id = state.session_id;
        Ok(stats)
    }

    /// Records one read. Non-expected EPCs and inactive sessions produce a
    /// non-match.
    pub fn record_read(&self, epc: &str) -> MatchResult {
        let normalized = normalize_epc(epc);
        if normalized.is_empty() {
            return MatchResult::default();
        }

        let mut state = self.state.lock();
        if !state.active || !state.expected.contains(&normalized) {
            return MatchResult::default();
        }

        let newly_read = state.read.insert(normalized.clone());
        MatchResult {
            matched: true,
            newly_read,
            epc: normalized,
            read_count: state.read.len(),
            total: state.expected.len(),
            session_id: state.session_id,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// True while `session_id` is the live session; stale match events carry
    /// older ids and get dropped by the caller.
    pub fn is_session_active(&self, session_id: u64) -> bool {
        let state = self.state.lock();
        state.active && state.session_id == session_id
    }

    /// Ends the session and reports the tally.
    pub fn stop(&self) -> Result<StopResult> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(Error::Other("no active test session".into()));
        }

        let total = state.expected.len();
        let read = state.read.len();
        let result = StopResult {
            session_id: state.session_id,
            name: std::mem::take(&mut state.name),
            total,
            read,
            unread: total - read,
        };

        state.active = false;
        state.started_at = None;
        state.expected.clear();
        state.read.clear();
        Ok(result)
    }
}

/// Parses an uploaded EPC list: one candidate per line, `#` comments and
/// blank lines skipped, a leading BOM stripped, duplicates collapsed.
fn parse_epc_list(content: &str) -> (Vec<String>, LoadStats) {
    let mut stats = LoadStats::default();
    let mut unique = HashSet::new();
    let mut out = Vec::new();

    for (line_no, raw) in content.lines().enumerate() {
        let mut line = raw.trim();
        if line_no == 0 {
            line = line.trim_start_matches('\u{FEFF}').trim();
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        stats.total_lines += 1;
        let epc = normalize_epc(line);
        if epc.is_empty() {
            stats.invalid_lines += 1;
            continue;
        }

        stats.valid_lines += 1;
        if !unique.insert(epc.clone()) {
            stats.duplicate_lines += 1;
            continue;
        }
        out.push(epc);
    }

    stats.unique_epcs = out.len();
    (out, stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_counts_lines() {
        let content = "\u{FEFF}# sample\n\nE20000112233\nE20000112233\nxx-yy\n  e20000aa  \n";
        let (epcs, stats) = parse_epc_list(content);

        assert_eq!(stats.total_lines, 4);
        assert_eq!(stats.valid_lines, 3);
        assert_eq!(stats.unique_epcs, 2);
        assert_eq!(stats.duplicate_lines, 1);
        assert_eq!(stats.invalid_lines, 1);
        assert_eq!(epcs, vec!["E20000112233".to_string(), "E20000AA".to_string()]);
    }

    #[test]
    fn load_replaces_previous_session() {
        let tm = TestMode::new();

        let first = tm.load("first.txt", "E200AA\nE200BB\n").unwrap();
        let match1 = tm.record_read("E200AA");
        assert!(match1.matched && match1.newly_read);
        assert_eq!(match1.session_id, first.session_id);

        let second = tm.load("second.txt", "E200CC\nE200CC\n").unwrap();
        assert!(second.session_id > first.session_id);
        assert!(!tm.is_session_active(first.session_id));
        assert!(tm.is_session_active(second.session_id));

        assert!(!tm.record_read("E200AA").matched);
        let fresh = tm.record_read("E200CC");
        assert!(fresh.matched && fresh.newly_read);
        assert_eq!(fresh.session_id, second.session_id);
    }

    #[test]
    fn duplicate_reads_are_matched_but_not_new() {
        let tm = TestMode::new();
        tm.load("t.txt", "E200AA\nE200BB\n").unwrap();

        assert!(tm.record_read("e2 00 aa").newly_read);
        let repeat = tm.record_read("E200AA");
        assert!(repeat.matched);
        assert!(!repeat.newly_read);
        assert_eq!(repeat.read_count, 1);
        assert_eq!(repeat.total, 2);
    }

    #[test]
    fn stop_reports_the_tally_and_deactivates() {
        let tm = TestMode::new();
        tm.load("t.txt", "E200AA\nE200BB\nE200CC\n").unwrap();
        tm.record_read("E200AA");

        let result = tm.stop().unwrap();
        assert_eq!(result.total, 3);
        assert_eq!(result.read, 1);
        assert_eq!(result.unread, 2);
        assert_eq!(result.name, "t.txt");

        assert!(!tm.is_active());
        assert!(tm.stop().is_err());
        assert!(!tm.record_read("E200BB").matched);
    }

    #[test]
    fn load_rejects_empty_lists() {
        let tm = TestMode::new();
        assert!(tm.load("t.txt", "# nothing\n\nzz\n").is_err());
        assert!(!tm.is_active());
    }
}

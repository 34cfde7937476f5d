use crate::diff::{BeyondRangePolicy, CommitDiff, Remap};
use crate::types::{IdentityKey, LedgerEntry, RawViolation, Status, short_hash};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// What one `advance` call changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvanceSummary {
    /// Open entries whose tracked line moved
    pub remapped: usize,
    /// Open entries resolved past a line map's scanned range
    pub extrapolated: usize,
    /// Indices of entries fixed by this commit
    pub fixed: Vec<usize>,
    /// Indices of entries opened by this commit
    pub opened: Vec<usize>,
}

/// Every violation seen for one project, with its lifecycle
#[derive(Debug, Clone, Default)]
pub struct ViolationLedger {
    entries: Vec<LedgerEntry>,
    /// Open entries by identity key
    open: HashMap<IdentityKey, usize>,
    version: u64,
    policy: BeyondRangePolicy,
}

impl ViolationLedger {
    pub fn new(policy: BeyondRangePolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Entries in first-seen order
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<LedgerEntry> {
        self.entries
    }

    /// Number of `advance` calls applied so far
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Open entry currently tracked under `key`
    pub fn find_open(&self, key: &IdentityKey) -> Option<&LedgerEntry> {
        self.open.get(key).map(|&i| &self.entries[i])
    }

    /// Advance the ledger across one commit transition.
    ///
    /// Open entries are first moved through `diff`; entries whose line was deleted,
    /// or whose key is missing from `violations`, are fixed at `commit`. Violations
    /// with no open entry are opened at `commit`.
    pub fn advance(
        &mut self,
        commit: &str,
        diff: &CommitDiff,
        violations: &[RawViolation],
    ) -> AdvanceSummary {
        let mut summary = AdvanceSummary::default();
        let orphaned = self.remap_open(diff, &mut summary);

        let current: HashSet<IdentityKey> = violations.iter().map(RawViolation::key).collect();

        let mut fixed: Vec<usize> = self
            .open
            .iter()
            .filter(|(key, _)| !current.contains(*key))
            .map(|(_, &index)| index)
            .chain(orphaned)
            .collect();
        fixed.sort_unstable();
        for &index in &fixed {
            let entry = &mut self.entries[index];
            let key = entry.key();
            if self.open.get(&key) == Some(&index) {
                self.open.remove(&key);
            }
            entry.status = Status::Fixed;
            entry.fix_commit = Some(commit.to_string());
            trace!("Fixed {} at {}", entry.key(), short_hash(commit));
        }
        summary.fixed = fixed;

        for violation in violations {
            let key = violation.key();
            if self.find_open(&key).is_some() {
                continue;
            }
            let index = self.entries.len();
            self.entries.push(LedgerEntry::opened(violation, commit));
            self.open.insert(key, index);
            summary.opened.push(index);
        }

        self.version += 1;
        debug!(
            "Ledger v{} at {}: {} remapped, {} fixed, {} opened, {} open",
            self.version,
            short_hash(commit),
            summary.remapped,
            summary.fixed.len(),
            summary.opened.len(),
            self.open.len()
        );
        summary
    }

    /// Move open entries through the commit's line maps and rebuild the open index.
    ///
    /// Returns the entries that can no longer be matched: their line was deleted, or
    /// an extrapolated position landed on a key another entry holds exactly.
    fn remap_open(&mut self, diff: &CommitDiff, summary: &mut AdvanceSummary) -> Vec<usize> {
        let mut orphaned = Vec::new();
        if diff.is_empty() {
            return orphaned;
        }

        // (entry index, new line, position is exact)
        let mut moved = Vec::with_capacity(self.open.len());
        for (_, index) in self.open.drain() {
            let entry = &self.entries[index];
            let Some(map) = diff.get(&entry.file_path) else {
                moved.push((index, entry.tracked_line, true));
                continue;
            };

            match map.remap(entry.tracked_line, self.policy) {
                Remap::Line(line) => moved.push((index, line, true)),
                Remap::Beyond(line) => {
                    summary.extrapolated += 1;
                    debug!(
                        "{} lies past the diff range of {} (ends at line {}), using line {} ({:?})",
                        entry.key(),
                        entry.file_path,
                        map.scanned_range(),
                        line,
                        self.policy
                    );
                    moved.push((index, line, false));
                }
                Remap::Deleted => {
                    trace!("Line of {} deleted", entry.key());
                    orphaned.push(index);
                }
            }
        }

        // Exact positions claim their keys before extrapolated ones
        moved.sort_unstable_by_key(|&(index, _, exact)| (!exact, index));
        for (index, line, _) in moved {
            let entry = &mut self.entries[index];
            let key = IdentityKey::new(&entry.rule_id, &entry.file_path, line);
            match self.open.entry(key) {
                Entry::Occupied(slot) => {
                    debug!(
                        "{} would share its key with another open entry, closing it",
                        slot.key()
                    );
                    orphaned.push(index);
                }
                Entry::Vacant(slot) => {
                    if entry.tracked_line != line {
                        entry.tracked_line = line;
                        summary.remapped += 1;
                    }
                    slot.insert(index);
                }
            }
        }
        orphaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(rule: &str, file: &str, line: u32) -> RawViolation {
        RawViolation {
            rule_id: rule.into(),
            file_path: file.into(),
            message: format!("{} message", rule),
            line,
            context: String::new(),
        }
    }

    fn diff_for(file: &str, headers: &[&str]) -> CommitDiff {
        let mut text = format!("diff --git a/{file} b/{file}\n--- a/{file}\n+++ b/{file}\n");
        for header in headers {
            text.push_str(header);
            text.push('\n');
        }
        CommitDiff::parse(&text)
    }

    fn seeded(violations: &[RawViolation]) -> ViolationLedger {
        let mut ledger = ViolationLedger::new(BeyondRangePolicy::Extrapolate);
        ledger.advance("c0", &CommitDiff::default(), violations);
        ledger
    }

    fn assert_unique_open_keys(ledger: &ViolationLedger) {
        let open: Vec<_> = ledger
            .entries()
            .iter()
            .filter(|e| e.is_open())
            .map(LedgerEntry::key)
            .collect();
        let unique: HashSet<_> = open.iter().cloned().collect();
        assert_eq!(open.len(), unique.len());
        assert_eq!(open.len(), ledger.open_count());
    }

    #[test]
    fn test_insertion_moves_tracked_line() {
        let mut ledger = seeded(&[violation("E501", "a.py", 10)]);
        let summary = ledger.advance(
            "c1",
            &diff_for("a.py", &["@@ -5,0 +5,3 @@", "+x", "+y", "+z"]),
            &[violation("E501", "a.py", 13)],
        );

        assert_eq!(ledger.entries().len(), 1);
        let entry = &ledger.entries()[0];
        assert_eq!(entry.tracked_line, 13);
        assert_eq!(entry.detected_line, 10);
        assert!(entry.is_open());
        assert_eq!(summary.remapped, 1);
        assert_eq!(summary.extrapolated, 1);
        assert!(summary.opened.is_empty());
    }

    #[test]
    fn test_deleted_line_is_fixed() {
        let mut ledger = seeded(&[violation("E501", "a.py", 10)]);
        let summary = ledger.advance(
            "c1",
            &diff_for("a.py", &["@@ -10,1 +10,0 @@", "-long line"]),
            &[],
        );

        let entry = &ledger.entries()[0];
        assert_eq!(entry.status, Status::Fixed);
        assert_eq!(entry.fix_commit.as_deref(), Some("c1"));
        assert_eq!(entry.tracked_line, 10);
        assert_eq!(summary.fixed, vec![0]);
    }

    #[test]
    fn test_reappearance_after_fix_creates_new_entry() {
        let mut ledger = seeded(&[violation("F401", "a.py", 3)]);
        ledger.advance("c1", &CommitDiff::default(), &[]);
        ledger.advance("c2", &CommitDiff::default(), &[violation("F401", "a.py", 3)]);
        ledger.advance("c3", &CommitDiff::default(), &[violation("F401", "a.py", 3)]);

        let entries = ledger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, Status::Fixed);
        assert_eq!(entries[0].fix_commit.as_deref(), Some("c1"));
        assert_eq!(entries[1].status, Status::Open);
        assert_eq!(entries[1].first_seen_commit, "c2");
    }

    #[test]
    fn test_reappearance_at_another_line_after_fix() {
        let mut ledger = seeded(&[violation("F401", "a.py", 3)]);
        ledger.advance("c1", &CommitDiff::default(), &[]);
        let summary = ledger.advance(
            "c2",
            &diff_for("a.py", &["@@ -1,0 +1,2 @@", "+import os", "+import sys"]),
            &[violation("F401", "a.py", 7)],
        );
        ledger.advance("c3", &CommitDiff::default(), &[violation("F401", "a.py", 7)]);

        let entries = ledger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, Status::Fixed);
        assert_eq!(entries[0].fix_commit.as_deref(), Some("c1"));
        // Fixed entries are no longer remapped
        assert_eq!(entries[0].tracked_line, 3);
        assert_eq!(summary.opened, vec![1]);
        assert_eq!(entries[1].detected_line, 7);
        assert_eq!(entries[1].tracked_line, 7);
        assert_eq!(entries[1].first_seen_commit, "c2");
        assert!(entries[1].is_open());
        assert_unique_open_keys(&ledger);
    }

    #[test]
    fn test_file_without_hunks_keeps_lines_and_still_fixes() {
        let mut ledger = seeded(&[
            violation("E501", "a.py", 4),
            violation("W291", "a.py", 8),
            violation("E302", "b.py", 2),
        ]);
        ledger.advance(
            "c1",
            &diff_for("b.py", &["@@ -1,0 +1 @@", "+import os"]),
            &[violation("E501", "a.py", 4), violation("E302", "b.py", 3)],
        );

        let entries = ledger.entries();
        assert_eq!(entries[0].tracked_line, 4);
        assert!(entries[0].is_open());
        assert_eq!(entries[1].status, Status::Fixed);
        assert_eq!(entries[1].tracked_line, 8);
        assert_eq!(entries[2].tracked_line, 3);
        assert!(entries[2].is_open());
    }

    #[test]
    fn test_fixed_entries_are_frozen() {
        let mut ledger = seeded(&[violation("E501", "a.py", 10)]);
        ledger.advance("c1", &CommitDiff::default(), &[]);
        let frozen = ledger.entries()[0].clone();

        ledger.advance(
            "c2",
            &diff_for("a.py", &["@@ -1,0 +1,5 @@", "+a", "+b", "+c", "+d", "+e"]),
            &[violation("E501", "a.py", 15)],
        );

        assert_eq!(ledger.entries()[0], frozen);
        assert_eq!(ledger.entries()[1].tracked_line, 15);
        assert_eq!(ledger.entries()[1].first_seen_commit, "c2");
    }

    #[test]
    fn test_deleted_entry_does_not_collide_with_moved_entry() {
        // Lines 10 and 11 are deleted, so the violation at 12 moves onto line 10
        // while the one originally at 10 is gone.
        let mut ledger = seeded(&[violation("E501", "a.py", 10), violation("E501", "a.py", 12)]);
        let summary = ledger.advance(
            "c1",
            &diff_for("a.py", &["@@ -10,2 +9,0 @@", "-x", "-y"]),
            &[violation("E501", "a.py", 10)],
        );

        let entries = ledger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, Status::Fixed);
        assert_eq!(entries[1].tracked_line, 10);
        assert!(entries[1].is_open());
        assert_eq!(summary.fixed, vec![0]);
        assert!(summary.opened.is_empty());
        assert_unique_open_keys(&ledger);
    }

    #[test]
    fn test_open_count_matches_distinct_snapshot_keys() {
        let mut ledger = seeded(&[violation("E501", "a.py", 1), violation("E501", "a.py", 1)]);
        assert_eq!(ledger.open_count(), 1);
        assert_eq!(ledger.entries().len(), 1);

        let snapshots = [
            vec![violation("E501", "a.py", 1), violation("W291", "a.py", 2)],
            vec![violation("W291", "b.py", 7)],
            vec![],
            vec![violation("E501", "a.py", 1), violation("E501", "a.py", 2)],
        ];
        for (i, snapshot) in snapshots.iter().enumerate() {
            ledger.advance(&format!("c{}", i + 1), &CommitDiff::default(), snapshot);
            let distinct: HashSet<_> = snapshot.iter().map(RawViolation::key).collect();
            assert_eq!(ledger.open_count(), distinct.len());
            assert_unique_open_keys(&ledger);
        }
        assert_eq!(ledger.version(), 5);
    }

    #[test]
    fn test_identity_diff_leaves_lines_unchanged() {
        let snapshot = vec![violation("E501", "a.py", 3), violation("C901", "b.py", 40)];
        let mut ledger = seeded(&snapshot);
        let before: Vec<u32> = ledger.entries().iter().map(|e| e.tracked_line).collect();

        let summary = ledger.advance("c1", &CommitDiff::parse(""), &snapshot);

        let after: Vec<u32> = ledger.entries().iter().map(|e| e.tracked_line).collect();
        assert_eq!(before, after);
        assert_eq!(summary.remapped, 0);
        assert!(summary.fixed.is_empty());
    }

    #[test]
    fn test_keep_policy_does_not_move_lines_past_range() {
        let mut ledger = ViolationLedger::new(BeyondRangePolicy::Keep);
        ledger.advance("c0", &CommitDiff::default(), &[violation("E501", "a.py", 10)]);
        ledger.advance(
            "c1",
            &diff_for("a.py", &["@@ -5,0 +5,3 @@", "+x", "+y", "+z"]),
            &[violation("E501", "a.py", 13)],
        );

        let entries = ledger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, Status::Fixed);
        assert_eq!(entries[0].tracked_line, 10);
        assert_eq!(entries[1].tracked_line, 13);
    }

    #[test]
    fn test_find_open() {
        let ledger = seeded(&[violation("E501", "a.py", 3)]);
        let key = IdentityKey::new("E501", "a.py", 3);
        assert_eq!(ledger.find_open(&key).map(|e| e.tracked_line), Some(3));
        assert!(ledger.find_open(&IdentityKey::new("E501", "a.py", 4)).is_none());
    }
}

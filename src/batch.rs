use crate::diff::{BeyondRangePolicy, CommitDiff};
use crate::ledger::{AdvanceSummary, ViolationLedger};
use crate::types::{LedgerEntry, RawViolation, short_hash};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

/// One tracked commit: its hash, the diff from the previous tracked commit, and its lint snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitSnapshot {
    pub commit: String,
    #[serde(default)]
    pub diff: String,
    #[serde(default)]
    pub violations: Vec<RawViolation>,
}

/// Drives a ledger across an ordered commit sequence
///
/// The first commit seeds the ledger without remapping; every later snapshot is
/// folded in with [`BatchProcessor::step`].
#[derive(Debug)]
pub struct BatchProcessor {
    ledger: ViolationLedger,
    steps: usize,
}

impl BatchProcessor {
    /// Seed a ledger with the violations of the first commit
    pub fn seed(
        initial_commit: &str,
        initial_violations: &[RawViolation],
        policy: BeyondRangePolicy,
    ) -> (Self, AdvanceSummary) {
        let mut ledger = ViolationLedger::new(policy);
        let summary = ledger.advance(initial_commit, &CommitDiff::default(), initial_violations);
        debug!(
            "Seeded ledger at {} with {} violations",
            short_hash(initial_commit),
            summary.opened.len()
        );
        (Self { ledger, steps: 0 }, summary)
    }

    /// Advance the ledger by one tracked commit
    pub fn step(&mut self, snapshot: &CommitSnapshot) -> AdvanceSummary {
        let diff = CommitDiff::parse(&snapshot.diff);
        trace!(
            "Commit {} changes {} files",
            short_hash(&snapshot.commit),
            diff.len()
        );
        if diff.malformed_headers() > 0 {
            debug!(
                "Commit {} had {} malformed hunk headers",
                short_hash(&snapshot.commit),
                diff.malformed_headers()
            );
        }
        self.steps += 1;
        self.ledger
            .advance(&snapshot.commit, &diff, &snapshot.violations)
    }

    pub fn ledger(&self) -> &ViolationLedger {
        &self.ledger
    }

    /// Commits folded in after the seed
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn finish(self) -> Vec<LedgerEntry> {
        self.ledger.into_entries()
    }

    /// Fold a whole commit sequence into the final entries, in first-seen order
    pub fn run<I>(
        initial_commit: &str,
        initial_violations: &[RawViolation],
        snapshots: I,
        policy: BeyondRangePolicy,
    ) -> Vec<LedgerEntry>
    where
        I: IntoIterator<Item = CommitSnapshot>,
    {
        let (seeded, _) = Self::seed(initial_commit, initial_violations, policy);
        snapshots
            .into_iter()
            .fold(seeded, |mut batch, snapshot| {
                batch.step(&snapshot);
                batch
            })
            .finish()
    }
}

/// Recorded history that can be replayed without a repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayFixture {
    pub initial_commit: String,
    #[serde(default)]
    pub initial_violations: Vec<RawViolation>,
    #[serde(default)]
    pub commits: Vec<CommitSnapshot>,
}

impl ReplayFixture {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        use anyhow::Context;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay fixture {}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse replay fixture {}", path))
    }

    pub fn replay(self, policy: BeyondRangePolicy) -> Vec<LedgerEntry> {
        info!(
            "Replaying {} commits after {}",
            self.commits.len(),
            short_hash(&self.initial_commit)
        );
        BatchProcessor::run(
            &self.initial_commit,
            &self.initial_violations,
            self.commits,
            policy,
        )
    }
}

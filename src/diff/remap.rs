use super::hunk::Hunk;
use serde::{Deserialize, Serialize};

/// How to resolve a lookup for an old line past the range scanned from the hunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeyondRangePolicy {
    /// Apply the net offset of every hunk (and any insertion still pending)
    #[default]
    Extrapolate,
    /// Keep the old line number unchanged
    Keep,
}

/// Result of remapping one old line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remap {
    /// Line inside the scanned range, with its new position
    Line(u32),
    /// Line removed by the diff
    Deleted,
    /// Line past the scanned range, resolved by a [`BeyondRangePolicy`]
    Beyond(u32),
}

/// Old-line to new-line mapping for one file across one commit transition
///
/// Stored as contiguous old-line segments, so its size follows the number of
/// hunks rather than the line counts their headers claim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineMap {
    /// Consecutive segments covering old lines `1..=scanned_range`
    segments: Vec<Segment>,
    terminal_offset: i64,
    /// Insertion ranges the scan never reached, in new-line order
    pending_insertions: Vec<(u32, u32)>,
}

/// Old lines `start..=end` sharing one fate: shifted by `offset`, or deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    start: u32,
    end: u32,
    offset: Option<i64>,
}

impl LineMap {
    /// Map with no changes; every line maps to itself
    pub fn identity() -> Self {
        Self::default()
    }

    /// Build the map from the hunks of one file, in the order the diff emitted them.
    ///
    /// Deletions and insertions are replayed as a single stream while walking old
    /// lines from 1 up to the highest line any hunk touches. Runs of lines that no
    /// hunk touches are skipped over in one step.
    pub fn from_hunks(hunks: &[Hunk]) -> Self {
        let deletions: Vec<(u32, u32)> = hunks.iter().filter_map(Hunk::deleted_range).collect();
        let insertions: Vec<(u32, u32)> = hunks.iter().filter_map(Hunk::inserted_range).collect();
        let max_line = deletions
            .iter()
            .chain(insertions.iter())
            .map(|&(_, end)| end)
            .max()
            .unwrap_or(0);

        let mut segments: Vec<Segment> = Vec::new();
        let mut deleted_cursor = RangeCursor::new(&deletions);
        let mut inserted_cursor = RangeCursor::new(&insertions);
        let mut offset: i64 = 0;
        let mut line: u32 = 1;

        while line <= max_line {
            // Deletions at or before this line; only one of them removes it
            let mut deleted = false;
            while let Some((next, end)) = deleted_cursor.current()
                && next <= line
            {
                if line <= end && !deleted {
                    deleted = true;
                    offset -= 1;
                }
                deleted_cursor.skip_through(line);
            }

            // Once the next insertion fires, the rest of its range fires with it
            while let Some((next, end)) = inserted_cursor.current()
                && i64::from(next) <= i64::from(line) + offset
            {
                offset += i64::from(end - next) + 1;
                inserted_cursor.next_range();
            }

            let mut last = line;
            if deleted {
                // `line + offset` stays constant along a deleted run, so no insertion fires in it
                if let Some((next, end)) = deleted_cursor.current()
                    && Some(next) == line.checked_add(1)
                {
                    offset -= i64::from(end - line);
                    deleted_cursor.skip_through(end);
                    last = end;
                }
                push_segment(&mut segments, line, last, None);
            } else {
                push_segment(&mut segments, line, line, Some(offset));
            }

            // Untouched lines up to the next deletion or the next firing insertion
            let mut quiet_end = max_line;
            if let Some((next, _)) = deleted_cursor.current() {
                quiet_end = quiet_end.min(next.saturating_sub(1));
            }
            if let Some((next, _)) = inserted_cursor.current() {
                let fires_at = i64::from(next) - offset;
                quiet_end = quiet_end.min(u32::try_from(fires_at - 1).unwrap_or(u32::MAX));
            }
            if quiet_end > last {
                push_segment(&mut segments, last + 1, quiet_end, Some(offset));
                last = quiet_end;
            }

            match last.checked_add(1) {
                Some(next) => line = next,
                None => break,
            }
        }

        Self {
            segments,
            terminal_offset: offset,
            pending_insertions: inserted_cursor.remaining(),
        }
    }

    /// Highest old line with an explicit entry
    pub fn scanned_range(&self) -> u32 {
        self.segments.last().map_or(0, |segment| segment.end)
    }

    /// Explicit entry for an old line: `None` when outside the scanned range,
    /// `Some(None)` when the line was deleted.
    pub fn get(&self, old_line: u32) -> Option<Option<u32>> {
        if old_line == 0 {
            return None;
        }
        let index = self.segments.partition_point(|s| s.end < old_line);
        let segment = self.segments.get(index)?;
        Some(segment.offset.and_then(|offset| shifted(old_line, offset)))
    }

    /// Remap an old line to its new position
    pub fn remap(&self, old_line: u32, policy: BeyondRangePolicy) -> Remap {
        match self.get(old_line) {
            Some(Some(new_line)) => Remap::Line(new_line),
            Some(None) => Remap::Deleted,
            None if old_line == 0 => Remap::Beyond(old_line),
            None => match policy {
                BeyondRangePolicy::Keep => Remap::Beyond(old_line),
                BeyondRangePolicy::Extrapolate => self.extrapolate(old_line),
            },
        }
    }

    fn extrapolate(&self, old_line: u32) -> Remap {
        let mut offset = self.terminal_offset;
        for &(next, end) in &self.pending_insertions {
            if i64::from(next) > i64::from(old_line) + offset {
                break;
            }
            offset += i64::from(end - next) + 1;
        }
        match shifted(old_line, offset) {
            Some(new_line) => Remap::Beyond(new_line),
            None => Remap::Deleted,
        }
    }
}

/// Append `start..=end`, merging with the previous segment when it has the same fate
fn push_segment(segments: &mut Vec<Segment>, start: u32, end: u32, offset: Option<i64>) {
    if let Some(previous) = segments.last_mut()
        && previous.offset == offset
    {
        previous.end = end;
        return;
    }
    segments.push(Segment { start, end, offset });
}

/// Walks inclusive ranges value by value, in list order
struct RangeCursor<'a> {
    ranges: &'a [(u32, u32)],
    index: usize,
    next: u32,
}

impl<'a> RangeCursor<'a> {
    fn new(ranges: &'a [(u32, u32)]) -> Self {
        Self {
            ranges,
            index: 0,
            next: ranges.first().map_or(0, |&(start, _)| start),
        }
    }

    /// Next unconsumed value and the end of its range
    fn current(&self) -> Option<(u32, u32)> {
        self.ranges.get(self.index).map(|&(_, end)| (self.next, end))
    }

    /// Consume the values of the current range up to and including `value`
    fn skip_through(&mut self, value: u32) {
        match self.current() {
            Some((_, end)) if end <= value => self.next_range(),
            Some(_) => self.next = value + 1,
            None => {}
        }
    }

    fn next_range(&mut self) {
        self.index += 1;
        if let Some(&(start, _)) = self.ranges.get(self.index) {
            self.next = start;
        }
    }

    fn remaining(&self) -> Vec<(u32, u32)> {
        self.current()
            .into_iter()
            .chain(self.ranges.iter().skip(self.index + 1).copied())
            .collect()
    }
}

fn shifted(line: u32, offset: i64) -> Option<u32> {
    u32::try_from(i64::from(line) + offset)
        .ok()
        .filter(|l| *l > 0)
}

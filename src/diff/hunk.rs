use regex::Regex;
use std::sync::LazyLock;

static HUNK_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@")
        .unwrap_or_else(|_| panic!("Invalid hunk header regex"))
});

/// One change region of a unified diff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: u32,
    pub old_count: u32,
    pub new_start: u32,
    pub new_count: u32,
}

impl Hunk {
    /// Parse a `@@ -a[,b] +c[,d] @@` header line; missing counts default to 1.
    ///
    /// Returns `None` if the line is not a hunk header.
    pub fn parse(line: &str) -> Option<Self> {
        let caps = HUNK_HEADER_RE.captures(line)?;
        let number = |i: usize, default: Option<u32>| match caps.get(i) {
            Some(m) => m.as_str().parse::<u32>().ok(),
            None => default,
        };
        Some(Self {
            old_start: number(1, None)?,
            old_count: number(2, Some(1))?,
            new_start: number(3, None)?,
            new_count: number(4, Some(1))?,
        })
    }

    /// Old-file lines removed by this hunk, as an inclusive range
    pub fn deleted_range(&self) -> Option<(u32, u32)> {
        inclusive(self.old_start, self.old_count)
    }

    /// New-file lines added by this hunk, as an inclusive range
    pub fn inserted_range(&self) -> Option<(u32, u32)> {
        inclusive(self.new_start, self.new_count)
    }
}

fn inclusive(start: u32, count: u32) -> Option<(u32, u32)> {
    (count > 0).then(|| (start, start.saturating_add(count) - 1))
}

use super::hunk::Hunk;
use super::remap::LineMap;
use std::collections::HashMap;
use tracing::{debug, trace};

const DEV_NULL: &str = "/dev/null";

/// Per-file line maps for one commit transition
///
/// A file missing from the diff has no map and is unchanged; a file with a map may
/// still report individual lines as deleted.
#[derive(Debug, Clone, Default)]
pub struct CommitDiff {
    maps: HashMap<String, LineMap>,
    malformed_headers: usize,
}

/// Lines of the current hunk body still to be consumed
#[derive(Default)]
struct BodyCursor {
    old: u32,
    new: u32,
}

impl BodyCursor {
    fn active(&self) -> bool {
        self.old > 0 || self.new > 0
    }

    /// Consume one body line; returns false if the line cannot belong to the body
    fn consume(&mut self, line: &str) -> bool {
        match line.as_bytes().first() {
            Some(b'-') => self.old = self.old.saturating_sub(1),
            Some(b'+') => self.new = self.new.saturating_sub(1),
            Some(b' ') | None => {
                self.old = self.old.saturating_sub(1);
                self.new = self.new.saturating_sub(1);
            }
            Some(b'\\') => {}
            Some(_) => return false,
        }
        true
    }
}

impl CommitDiff {
    /// Parse unified diff text (as produced by `git diff` or `git show`)
    pub fn parse(diff: &str) -> Self {
        let mut hunks_by_file: HashMap<String, Vec<Hunk>> = HashMap::new();
        let mut old_file: Option<String> = None;
        let mut current_file: Option<String> = None;
        let mut body = BodyCursor::default();
        let mut malformed_headers = 0;

        for line in diff.lines() {
            if body.active() {
                if body.consume(line) {
                    continue;
                }
                trace!("Hunk body ended early at: {}", line);
                clamp_last_hunk(&mut hunks_by_file, &current_file, &body);
                body = BodyCursor::default();
            }

            if line.starts_with("diff ") {
                old_file = None;
                current_file = None;
            } else if let Some(path) = line.strip_prefix("--- ") {
                old_file = header_path(path, "a/");
            } else if let Some(path) = line.strip_prefix("+++ ") {
                // A deleted file keeps its old path so its lines can be reported as gone
                current_file = header_path(path, "b/").or_else(|| old_file.clone());
            } else if line.starts_with("@@") {
                let Some(file) = &current_file else {
                    continue;
                };
                match Hunk::parse(line) {
                    Some(hunk) => {
                        body = BodyCursor {
                            old: hunk.old_count,
                            new: hunk.new_count,
                        };
                        hunks_by_file.entry(file.clone()).or_default().push(hunk);
                    }
                    None => {
                        debug!("Skipping malformed hunk header in {}: {}", file, line);
                        malformed_headers += 1;
                    }
                }
            }
        }

        if body.active() {
            clamp_last_hunk(&mut hunks_by_file, &current_file, &body);
        }

        let maps = hunks_by_file
            .into_iter()
            .map(|(file, hunks)| {
                trace!("Building line map for {} from {} hunks", file, hunks.len());
                let map = LineMap::from_hunks(&hunks);
                (file, map)
            })
            .collect();

        Self {
            maps,
            malformed_headers,
        }
    }

    /// Line map for a file, `None` if the diff left it unchanged
    pub fn get(&self, file: &str) -> Option<&LineMap> {
        self.maps.get(file)
    }

    /// Files with a line map
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Number of `@@` lines that did not parse as hunk headers
    pub fn malformed_headers(&self) -> usize {
        self.malformed_headers
    }
}

/// Shrink the last hunk of `file` to the body lines the diff actually carried
fn clamp_last_hunk(
    hunks_by_file: &mut HashMap<String, Vec<Hunk>>,
    file: &Option<String>,
    missing: &BodyCursor,
) {
    let Some(hunk) = file
        .as_ref()
        .and_then(|file| hunks_by_file.get_mut(file))
        .and_then(|hunks| hunks.last_mut())
    else {
        return;
    };
    debug!(
        "Hunk {:?} is missing {} old and {} new body lines, clamping",
        hunk, missing.old, missing.new
    );
    hunk.old_count -= missing.old;
    hunk.new_count -= missing.new;
}

/// Extract the path from a `---`/`+++` header, `None` for `/dev/null`
fn header_path(raw: &str, prefix: &str) -> Option<String> {
    // Some diff tools append a tab and a timestamp
    let raw = raw.split('\t').next().unwrap_or(raw).trim_end();
    let raw = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw);
    if raw == DEV_NULL {
        return None;
    }
    Some(raw.strip_prefix(prefix).unwrap_or(raw).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::remap::{BeyondRangePolicy, Remap};

    const TWO_FILE_DIFF: &str = "\
diff --git a/pkg/app.py b/pkg/app.py
index 1111111..2222222 100644
--- a/pkg/app.py
+++ b/pkg/app.py
@@ -5,0 +6,2 @@ def main():
+import os
+import sys
@@ -20 +22 @@ def run():
-    return 1
+    return 2
diff --git a/pkg/util.py b/pkg/util.py
index 3333333..4444444 100644
--- a/pkg/util.py
+++ b/pkg/util.py
@@ -3 +2,0 @@
-unused = True
";

    #[test]
    fn test_groups_hunks_by_file() {
        let diff = CommitDiff::parse(TWO_FILE_DIFF);
        assert_eq!(diff.len(), 2);

        let app = diff.get("pkg/app.py").unwrap();
        assert_eq!(app.remap(5, BeyondRangePolicy::Extrapolate), Remap::Line(5));
        assert_eq!(app.remap(6, BeyondRangePolicy::Extrapolate), Remap::Line(8));
        assert_eq!(app.remap(20, BeyondRangePolicy::Extrapolate), Remap::Deleted);
        assert_eq!(app.remap(21, BeyondRangePolicy::Extrapolate), Remap::Line(23));

        let util = diff.get("pkg/util.py").unwrap();
        assert_eq!(util.remap(3, BeyondRangePolicy::Extrapolate), Remap::Deleted);
        assert_eq!(util.remap(4, BeyondRangePolicy::Extrapolate), Remap::Beyond(3));
    }

    #[test]
    fn test_untouched_file_is_absent() {
        let diff = CommitDiff::parse(TWO_FILE_DIFF);
        assert!(diff.get("pkg/other.py").is_none());
        assert!(CommitDiff::parse("").is_empty());
    }

    #[test]
    fn test_body_lines_resembling_headers_are_not_misread() {
        let diff = "\
diff --git a/notes.py b/notes.py
--- a/notes.py
+++ b/notes.py
@@ -1,0 +1,2 @@
+++ b/evil.py
+@@ -1 +100,50 @@
";
        let parsed = CommitDiff::parse(diff);
        assert_eq!(parsed.len(), 1);
        assert!(parsed.get("evil.py").is_none());
        let map = parsed.get("notes.py").unwrap();
        assert_eq!(map.remap(1, BeyondRangePolicy::Extrapolate), Remap::Line(3));
    }

    #[test]
    fn test_deleted_file_maps_every_line_to_deleted() {
        let diff = "\
diff --git a/gone.py b/gone.py
deleted file mode 100644
--- a/gone.py
+++ /dev/null
@@ -1,3 +0,0 @@
-a = 1
-b = 2
-c = 3
";
        let parsed = CommitDiff::parse(diff);
        let map = parsed.get("gone.py").unwrap();
        for line in 1..=3 {
            assert_eq!(map.remap(line, BeyondRangePolicy::Extrapolate), Remap::Deleted);
        }
    }

    #[test]
    fn test_new_file_and_binary_file() {
        let diff = "\
diff --git a/new.py b/new.py
new file mode 100644
--- /dev/null
+++ b/new.py
@@ -0,0 +1,2 @@
+x = 1
+y = 2
diff --git a/logo.png b/logo.png
Binary files a/logo.png and b/logo.png differ
";
        let parsed = CommitDiff::parse(diff);
        assert!(parsed.get("new.py").is_some());
        assert!(parsed.get("logo.png").is_none());
    }

    #[test]
    fn test_malformed_header_is_skipped() {
        let diff = "\
diff --git a/a.py b/a.py
--- a/a.py
+++ b/a.py
@@ -x +y @@
@@ -2 +2 @@
-old
+new
";
        let parsed = CommitDiff::parse(diff);
        assert_eq!(parsed.malformed_headers(), 1);
        let map = parsed.get("a.py").unwrap();
        assert_eq!(map.remap(2, BeyondRangePolicy::Extrapolate), Remap::Deleted);
        assert_eq!(map.remap(3, BeyondRangePolicy::Extrapolate), Remap::Beyond(3));
    }

    #[test]
    fn test_hunks_before_any_file_header_are_ignored() {
        let diff = "commit abc\n\n    @@ -1 +1 @@ in a message\n@@ -1 +1 @@\n";
        assert!(CommitDiff::parse(diff).is_empty());
    }

    #[test]
    fn test_header_path_variants() {
        assert_eq!(header_path("b/src/x.py", "b/"), Some("src/x.py".into()));
        assert_eq!(header_path("src/x.py\t2024-01-01", "b/"), Some("src/x.py".into()));
        assert_eq!(header_path("\"b/with space.py\"", "b/"), Some("with space.py".into()));
        assert_eq!(header_path("/dev/null", "b/"), None);
    }

    #[test]
    fn test_truncated_body_clamps_hunk_counts() {
        let diff = "\
diff --git a/a.py b/a.py
--- a/a.py
+++ b/a.py
@@ -1 +1,4000000000 @@
-old
+new
diff --git a/b.py b/b.py
--- a/b.py
+++ b/b.py
@@ -3,4000000000 +3 @@
";
        let parsed = CommitDiff::parse(diff);

        let a = parsed.get("a.py").unwrap();
        assert_eq!(a.scanned_range(), 1);
        assert_eq!(a.remap(1, BeyondRangePolicy::Extrapolate), Remap::Deleted);
        assert_eq!(a.remap(2, BeyondRangePolicy::Extrapolate), Remap::Beyond(2));

        // No body at all leaves a hunk that changes nothing
        let b = parsed.get("b.py").unwrap();
        assert_eq!(b.scanned_range(), 0);
        assert_eq!(b.remap(3, BeyondRangePolicy::Extrapolate), Remap::Beyond(3));
    }
}

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// A lint violation reported for one commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawViolation {
    /// Rule code reported by the lint tool (e.g. E501)
    pub rule_id: String,
    /// File path relative to the repository root
    pub file_path: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Line number (1-indexed)
    pub line: u32,
    /// Trimmed source text of the violating line, display only
    #[serde(default)]
    pub context: String,
}

impl RawViolation {
    pub fn key(&self) -> IdentityKey {
        IdentityKey::new(&self.rule_id, &self.file_path, self.line)
    }
}

/// Identity used to match a snapshot violation against a tracked one
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub rule_id: String,
    pub file_path: String,
    pub line: u32,
}

impl IdentityKey {
    pub fn new(rule_id: &str, file_path: &str, line: u32) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            file_path: file_path.to_string(),
            line,
        }
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}:{}", self.rule_id, self.file_path, self.line)
    }
}

/// Lifecycle state of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Open,
    Fixed,
}

/// Tracked lifecycle of one distinct violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub rule_id: String,
    pub file_path: String,
    pub message: String,
    pub context: String,
    /// Current line, frozen once the entry is fixed
    pub tracked_line: u32,
    /// Line at first detection
    pub detected_line: u32,
    pub first_seen_commit: String,
    pub fix_commit: Option<String>,
    pub status: Status,
}

impl LedgerEntry {
    pub fn opened(violation: &RawViolation, commit: &str) -> Self {
        Self {
            rule_id: violation.rule_id.clone(),
            file_path: violation.file_path.clone(),
            message: violation.message.clone(),
            context: violation.context.clone(),
            tracked_line: violation.line,
            detected_line: violation.line,
            first_seen_commit: commit.to_string(),
            fix_commit: None,
            status: Status::Open,
        }
    }

    pub fn key(&self) -> IdentityKey {
        IdentityKey::new(&self.rule_id, &self.file_path, self.tracked_line)
    }

    pub fn is_open(&self) -> bool {
        self.status == Status::Open
    }
}

/// A commit in the mined history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub committed_at: DateTime<FixedOffset>,
}

impl Commit {
    /// Abbreviated hash for log output
    pub fn short(&self) -> &str {
        short_hash(&self.hash)
    }
}

/// A repository to mine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    #[serde(alias = "pkgName")]
    pub name: String,
    #[serde(alias = "repository_url", default)]
    pub url: String,
}

impl Project {
    /// Parse `NAME=URL`, or a bare URL named after its last path segment
    pub fn parse_arg(arg: &str) -> Option<Self> {
        let arg = arg.trim();
        if let Some((name, url)) = arg.split_once('=')
            && !name.contains('/')
            && !name.contains(':')
        {
            let (name, url) = (name.trim(), url.trim());
            return (!name.is_empty() && !url.is_empty()).then(|| Self {
                name: name.to_string(),
                url: url.to_string(),
            });
        }
        let name = arg
            .trim_end_matches('/')
            .rsplit(['/', ':'])
            .next()
            .map(|segment| segment.trim_end_matches(".git"))
            .filter(|segment| !segment.is_empty())?;
        Some(Self {
            name: name.to_string(),
            url: arg.to_string(),
        })
    }

    /// Name safe to use as a single path component
    pub fn dir_name(&self) -> String {
        self.name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect::<String>()
            .trim_start_matches('.')
            .to_string()
    }
}

pub fn short_hash(hash: &str) -> &str {
    const SHORT_HASH_LEN: usize = 8;
    hash.get(..SHORT_HASH_LEN).unwrap_or(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(line: u32) -> RawViolation {
        RawViolation {
            rule_id: "E501".into(),
            file_path: "pkg/mod.py".into(),
            message: "line too long (90 > 79 characters)".into(),
            line,
            context: "x = 1".into(),
        }
    }

    #[test]
    fn test_key_ignores_message_and_context() {
        let mut other = violation(3);
        other.message = "different".into();
        other.context = "y = 2".into();
        assert_eq!(violation(3).key(), other.key());
        assert_ne!(violation(3).key(), violation(4).key());
    }

    #[test]
    fn test_opened_entry_tracks_detection_line() {
        let entry = LedgerEntry::opened(&violation(12), "abc");
        assert_eq!(entry.tracked_line, 12);
        assert_eq!(entry.detected_line, 12);
        assert!(entry.is_open());
        assert_eq!(entry.key(), violation(12).key());
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short_hash("0123456789abcdef"), "01234567");
        assert_eq!(short_hash("abc"), "abc");
    }

    #[test]
    fn test_project_aliases() {
        let projects: Vec<Project> = serde_json::from_str(
            r#"[
                {"pkgName": "requests", "repository_url": "https://github.com/psf/requests"},
                {"name": "flask", "url": "https://github.com/pallets/flask"},
                {"name": "no-url"}
            ]"#,
        )
        .unwrap();
        assert_eq!(projects[0].name, "requests");
        assert_eq!(projects[0].url, "https://github.com/psf/requests");
        assert_eq!(projects[1].name, "flask");
        assert_eq!(projects[2].url, "");
    }

    #[test]
    fn test_project_parse_arg() {
        assert_eq!(
            Project::parse_arg("req=https://github.com/psf/requests"),
            Some(Project {
                name: "req".into(),
                url: "https://github.com/psf/requests".into()
            })
        );
        assert_eq!(
            Project::parse_arg("https://github.com/pallets/flask.git").map(|p| p.name),
            Some("flask".into())
        );
        assert_eq!(
            Project::parse_arg("git@github.com:psf/black.git").map(|p| p.name),
            Some("black".into())
        );
        assert_eq!(
            Project::parse_arg("/srv/repos/tool/").map(|p| p.name),
            Some("tool".into())
        );
        assert_eq!(Project::parse_arg("name="), None);
        assert_eq!(Project::parse_arg(""), None);
    }

    #[test]
    fn test_project_dir_name() {
        let project = Project {
            name: "../evil name".into(),
            url: String::new(),
        };
        assert_eq!(project.dir_name(), "_evil_name");
    }
}

pub mod outline;

use crate::config::FeatureConfig;
use crate::util::{FileHistory, Repo};
use chrono::{DateTime, FixedOffset, TimeDelta};
use outline::{BlockKind, Outline};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, trace};

static OPERATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[+\-*/=<>!&|^~]").unwrap_or_else(|_| panic!("Invalid Regex")));
static SPECIAL_CHAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s]").unwrap_or_else(|_| panic!("Invalid Regex")));
static VARIABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[a-zA-Z_]\w*\s*=").unwrap_or_else(|_| panic!("Invalid Regex"))
});
static CALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\w+\s*\(").unwrap_or_else(|_| panic!("Invalid Regex")));
static LOOP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:if|for|while|and|or)\b").unwrap_or_else(|_| panic!("Invalid Regex"))
});

/// Feature vector for one violation, in export column order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureVector {
    // file
    pub file_size: u64,
    pub total_lines: usize,
    pub code_lines: usize,
    pub comment_lines: usize,
    pub blank_lines: usize,
    pub file_depth: usize,
    pub file_extension: String,
    pub filename_length: usize,
    // line
    pub line_length: usize,
    pub line_length_no_whitespace: usize,
    pub indent_level: usize,
    pub line_complexity: usize,
    pub special_chars: usize,
    pub variable_count: usize,
    pub function_calls: usize,
    pub operators: usize,
    // function
    pub in_function: bool,
    pub function_name: String,
    pub function_params: usize,
    pub function_lines: u32,
    pub function_complexity: usize,
    // class
    pub in_class: bool,
    pub class_name: String,
    pub class_methods: usize,
    pub class_lines: u32,
    // module
    pub total_functions: usize,
    pub total_classes: usize,
    pub total_imports: usize,
    pub total_variables: usize,
    pub cyclomatic_complexity: usize,
    // history
    pub file_change_frequency: usize,
    pub lines_added_recent_revisions: u64,
    pub lines_added_recent_months: u64,
}

impl FeatureVector {
    pub const COLUMNS: [&'static str; 33] = [
        "file_size",
        "total_lines",
        "code_lines",
        "comment_lines",
        "blank_lines",
        "file_depth",
        "file_extension",
        "filename_length",
        "line_length",
        "line_length_no_whitespace",
        "indent_level",
        "line_complexity",
        "special_chars",
        "variable_count",
        "function_calls",
        "operators",
        "in_function",
        "function_name",
        "function_params",
        "function_lines",
        "function_complexity",
        "in_class",
        "class_name",
        "class_methods",
        "class_lines",
        "total_functions",
        "total_classes",
        "total_imports",
        "total_variables",
        "cyclomatic_complexity",
        "file_change_frequency",
        "lines_added_recent_revisions",
        "lines_added_recent_months",
    ];

    /// Typed values, aligned with [`FeatureVector::COLUMNS`]
    pub fn typed_values(&self) -> Vec<FeatureValue<'_>> {
        use FeatureValue::{Count, Flag, Text};
        let count = |n: usize| Count(n as u64);
        vec![
            Count(self.file_size),
            count(self.total_lines),
            count(self.code_lines),
            count(self.comment_lines),
            count(self.blank_lines),
            count(self.file_depth),
            Text(&self.file_extension),
            count(self.filename_length),
            count(self.line_length),
            count(self.line_length_no_whitespace),
            count(self.indent_level),
            count(self.line_complexity),
            count(self.special_chars),
            count(self.variable_count),
            count(self.function_calls),
            count(self.operators),
            Flag(self.in_function),
            Text(&self.function_name),
            count(self.function_params),
            Count(self.function_lines.into()),
            count(self.function_complexity),
            Flag(self.in_class),
            Text(&self.class_name),
            count(self.class_methods),
            Count(self.class_lines.into()),
            count(self.total_functions),
            count(self.total_classes),
            count(self.total_imports),
            count(self.total_variables),
            count(self.cyclomatic_complexity),
            count(self.file_change_frequency),
            Count(self.lines_added_recent_revisions),
            Count(self.lines_added_recent_months),
        ]
    }

    /// Values rendered as text, flags as `0`/`1`
    pub fn values(&self) -> Vec<String> {
        self.typed_values()
            .into_iter()
            .map(|value| match value {
                FeatureValue::Count(n) => n.to_string(),
                FeatureValue::Flag(b) => u8::from(b).to_string(),
                FeatureValue::Text(s) => s.to_string(),
            })
            .collect()
    }
}

/// One feature value, keeping its column type for typed exports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureValue<'a> {
    Count(u64),
    Flag(bool),
    Text(&'a str),
}

/// A location whose features are wanted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureTarget {
    pub file_path: String,
    pub line: u32,
}

/// Supplies feature vectors for source locations in the current checkout
pub trait FeatureProvider: Sync {
    fn features(&self, file_path: &str, line: u32) -> impl Future<Output = FeatureVector> + Send;

    /// Features for several targets, in order
    fn features_batch<'a>(
        &'a self,
        targets: &'a [FeatureTarget],
    ) -> impl Future<Output = Vec<FeatureVector>> + Send + 'a {
        async move {
            let mut vectors = Vec::with_capacity(targets.len());
            for target in targets {
                vectors.push(self.features(&target.file_path, target.line).await);
            }
            vectors
        }
    }
}

/// Computes features from the checked-out source text and the file's git history
#[derive(Debug, Clone)]
pub struct SourceFeatureProvider {
    repo: Repo,
    history_revisions: usize,
    recent_months: u32,
    /// Start of the recent-months window, set from the detection commit
    recent_since: Option<DateTime<FixedOffset>>,
}

impl SourceFeatureProvider {
    pub fn new(repo: Repo, config: &FeatureConfig) -> Self {
        Self {
            repo,
            history_revisions: config.history_revisions,
            recent_months: config.recent_months,
            recent_since: None,
        }
    }

    /// Anchor the recent-months window at the commit whose checkout is being featurized
    pub fn set_detection_date(&mut self, committed_at: DateTime<FixedOffset>) {
        let window = TimeDelta::try_days(30 * i64::from(self.recent_months));
        self.recent_since = window.and_then(|w| committed_at.checked_sub_signed(w));
    }

    async fn history(&self, file_path: &str) -> FileHistory {
        let mut history = match self.repo.file_history(file_path, self.history_revisions).await {
            Ok(history) => history,
            Err(e) => {
                debug!("History features unavailable for {}: {}", file_path, e);
                return FileHistory::default();
            }
        };
        if let Some(since) = self.recent_since {
            match self.repo.lines_added_since(file_path, since).await {
                Ok(added) => history.lines_added_recent_months = added,
                Err(e) => debug!("Recent history unavailable for {}: {}", file_path, e),
            }
        }
        history
    }
}

impl FeatureProvider for SourceFeatureProvider {
    async fn features(&self, file_path: &str, line: u32) -> FeatureVector {
        let Some(source) = SourceFile::read(self.repo.root(), file_path) else {
            return FeatureVector::default();
        };
        let history = self.history(file_path).await;
        source.features(line, history)
    }

    /// Reads, outlines and queries history once per distinct file
    fn features_batch<'a>(
        &'a self,
        targets: &'a [FeatureTarget],
    ) -> impl Future<Output = Vec<FeatureVector>> + Send + 'a {
        async move {
            let mut files: HashMap<&str, Option<(SourceFile, FileHistory)>> = HashMap::new();
            let mut vectors = Vec::with_capacity(targets.len());
            for target in targets {
                let path = target.file_path.as_str();
                if !files.contains_key(path) {
                    let loaded = match SourceFile::read(self.repo.root(), path) {
                        Some(source) => Some((source, self.history(path).await)),
                        None => None,
                    };
                    files.insert(path, loaded);
                }
                let vector = match files.get(path) {
                    Some(Some((source, history))) => source.features(target.line, *history),
                    _ => FeatureVector::default(),
                };
                vectors.push(vector);
            }
            vectors
        }
    }
}

/// A readable source file and its outline
#[derive(Debug)]
struct SourceFile {
    path: String,
    size: u64,
    text: String,
    outline: Outline,
}

impl SourceFile {
    fn read(root: &Path, path: &str) -> Option<Self> {
        match std::fs::read(root.join(path)) {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                Some(Self {
                    path: path.to_string(),
                    size: bytes.len() as u64,
                    outline: Outline::parse(&text),
                    text,
                })
            }
            Err(e) => {
                trace!("Cannot read {} for features: {}", path, e);
                None
            }
        }
    }

    fn features(&self, line: u32, history: FileHistory) -> FeatureVector {
        let mut features = FeatureVector {
            file_size: self.size,
            file_change_frequency: history.changes,
            lines_added_recent_revisions: history.lines_added,
            lines_added_recent_months: history.lines_added_recent_months,
            ..Default::default()
        };
        self.file_features(&mut features);
        self.line_features(line, &mut features);
        self.scope_features(line, &mut features);
        features
    }

    fn file_features(&self, features: &mut FeatureVector) {
        for line in self.text.lines() {
            let trimmed = line.trim();
            features.total_lines += 1;
            if trimmed.is_empty() {
                features.blank_lines += 1;
            } else if trimmed.starts_with('#') {
                features.comment_lines += 1;
            } else {
                features.code_lines += 1;
            }
        }

        let path = Path::new(&self.path);
        features.file_depth = path.components().count();
        features.file_extension = path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        features.filename_length = path
            .file_name()
            .map_or(0, |name| name.to_string_lossy().chars().count());
    }

    fn line_features(&self, line: u32, features: &mut FeatureVector) {
        let Some(text) = (line as usize)
            .checked_sub(1)
            .and_then(|idx| self.text.lines().nth(idx))
        else {
            return;
        };
        features.line_length = text.chars().count();
        features.line_length_no_whitespace = text.trim().chars().count();
        features.indent_level = text.chars().take_while(|c| c.is_whitespace()).count();
        features.operators = OPERATOR_RE.find_iter(text).count();
        features.line_complexity = LOOP_RE.find_iter(text).count() + features.operators;
        features.special_chars = SPECIAL_CHAR_RE.find_iter(text).count();
        features.variable_count = VARIABLE_RE.find_iter(text).count();
        features.function_calls = CALL_RE.find_iter(text).count();
    }

    fn scope_features(&self, line: u32, features: &mut FeatureVector) {
        let outline = &self.outline;
        if let Some(function) = outline.enclosing(BlockKind::Function, line) {
            features.in_function = true;
            features.function_name = function.name.clone();
            features.function_params = function.params;
            features.function_lines = function.lines();
            features.function_complexity = function.complexity();
        }
        if let Some(class) = outline.enclosing(BlockKind::Class, line) {
            features.in_class = true;
            features.class_name = class.name.clone();
            features.class_methods = class.methods;
            features.class_lines = class.lines();
        }
        features.total_functions = outline.count(BlockKind::Function);
        features.total_classes = outline.count(BlockKind::Class);
        features.total_imports = outline.imports;
        features.total_variables = outline.assignments;
        features.cyclomatic_complexity = outline.decisions();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SOURCE: &str = "\
import os

# settings
DEBUG = True


class Service:
    def run(self, job):
        if job and DEBUG:
            print(job)
";

    fn provider(root: &Path) -> SourceFeatureProvider {
        SourceFeatureProvider::new(
            Repo::open(root, Duration::from_secs(30)),
            &FeatureConfig::default(),
        )
    }

    #[test]
    fn test_columns_align_with_values() {
        assert_eq!(
            FeatureVector::default().values().len(),
            FeatureVector::COLUMNS.len()
        );
        let serialized = serde_json::to_value(FeatureVector::default()).unwrap();
        let object = serialized.as_object().unwrap();
        for column in FeatureVector::COLUMNS {
            assert!(object.contains_key(column), "missing {}", column);
        }
    }

    #[test]
    fn test_typed_values_keep_column_types() {
        let features = FeatureVector {
            in_class: true,
            class_name: "Service".into(),
            lines_added_recent_months: 7,
            ..Default::default()
        };
        let typed = features.typed_values();
        assert_eq!(typed.len(), FeatureVector::COLUMNS.len());
        let at = |name: &str| {
            let index = FeatureVector::COLUMNS.iter().position(|c| *c == name).unwrap();
            typed[index]
        };
        assert_eq!(at("in_class"), FeatureValue::Flag(true));
        assert_eq!(at("class_name"), FeatureValue::Text("Service"));
        assert_eq!(at("lines_added_recent_months"), FeatureValue::Count(7));
        assert_eq!(at("file_extension"), FeatureValue::Text(""));

        let values = features.values();
        assert_eq!(values[FeatureVector::COLUMNS.len() - 1], "7");
        assert!(values.contains(&"1".to_string()));
    }

    #[tokio::test]
    async fn test_source_features() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("pkg")).unwrap();
        std::fs::write(dir.path().join("pkg/service.py"), SOURCE).unwrap();

        // Not a git repository, so history features stay zero
        let features = provider(dir.path()).features("pkg/service.py", 10).await;

        assert_eq!(features.file_size, SOURCE.len() as u64);
        assert_eq!(features.total_lines, 10);
        assert_eq!(features.blank_lines, 3);
        assert_eq!(features.comment_lines, 1);
        assert_eq!(features.code_lines, 6);
        assert_eq!(features.file_depth, 2);
        assert_eq!(features.file_extension, ".py");
        assert_eq!(features.filename_length, 10);

        assert_eq!(features.line_length, 22);
        assert_eq!(features.line_length_no_whitespace, 10);
        assert_eq!(features.indent_level, 12);
        assert_eq!(features.function_calls, 1);
        assert_eq!(features.special_chars, 2);

        assert!(features.in_function);
        assert_eq!(features.function_name, "run");
        assert_eq!(features.function_params, 2);
        assert_eq!(features.function_lines, 3);
        assert_eq!(features.function_complexity, 3);
        assert!(features.in_class);
        assert_eq!(features.class_name, "Service");
        assert_eq!(features.class_methods, 1);
        assert_eq!(features.class_lines, 4);

        assert_eq!(features.total_functions, 1);
        assert_eq!(features.total_classes, 1);
        assert_eq!(features.total_imports, 1);
        assert_eq!(features.total_variables, 1);
        assert_eq!(features.cyclomatic_complexity, 2);
        assert_eq!(features.file_change_frequency, 0);
    }

    #[tokio::test]
    async fn test_module_level_line() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mod.py"), SOURCE).unwrap();
        let features = provider(dir.path()).features("mod.py", 4).await;
        assert!(!features.in_function);
        assert!(!features.in_class);
        assert_eq!(features.function_name, "");
        assert_eq!(features.variable_count, 1);
        assert_eq!(features.file_depth, 1);
    }

    #[tokio::test]
    async fn test_unreadable_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let features = provider(dir.path()).features("missing.py", 1).await;
        assert_eq!(features, FeatureVector::default());
    }

    #[tokio::test]
    async fn test_line_past_end_keeps_file_features() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mod.py"), SOURCE).unwrap();
        let features = provider(dir.path()).features("mod.py", 500).await;
        assert_eq!(features.total_lines, 10);
        assert_eq!(features.line_length, 0);
    }

    #[tokio::test]
    async fn test_batch_matches_single_lookups() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mod.py"), SOURCE).unwrap();
        let provider = provider(dir.path());
        let targets = vec![
            FeatureTarget {
                file_path: "mod.py".into(),
                line: 9,
            },
            FeatureTarget {
                file_path: "missing.py".into(),
                line: 1,
            },
            FeatureTarget {
                file_path: "mod.py".into(),
                line: 1,
            },
        ];
        let batch = provider.features_batch(&targets).await;
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0], provider.features("mod.py", 9).await);
        assert_eq!(batch[1], FeatureVector::default());
        assert_eq!(batch[2], provider.features("mod.py", 1).await);
    }

    #[tokio::test]
    async fn test_recent_months_window_follows_detection_date() {
        let git_available = std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success());
        if !git_available {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let git = |args: &[&str], date: &str| {
            let status = std::process::Command::new("git")
                .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
                .args(args)
                .env("GIT_AUTHOR_DATE", date)
                .env("GIT_COMMITTER_DATE", date)
                .current_dir(root)
                .status()
                .unwrap();
            assert!(status.success(), "git {:?} failed", args);
        };
        git(&["init", "--quiet"], "2024-01-01T00:00:00+00:00");
        for (date, content) in [
            ("2023-06-01T00:00:00+00:00", "a = 1\nb = 2\nc = 3\n"),
            ("2024-04-20T00:00:00+00:00", "a = 1\nb = 2\nc = 3\nd = 4\n"),
            ("2024-05-01T00:00:00+00:00", "a = 1\nb = 2\nc = 3\nd = 4\ne = 5\nf = 6\n"),
        ] {
            std::fs::write(root.join("mod.py"), content).unwrap();
            git(&["add", "."], date);
            git(&["commit", "--quiet", "-m", date], date);
        }

        let mut provider = provider(root);
        // Window unset: only the revision window is computed
        let features = provider.features("mod.py", 1).await;
        assert_eq!(features.lines_added_recent_revisions, 6);
        assert_eq!(features.lines_added_recent_months, 0);

        // Three 30-day months before 2024-05-01 start on 2024-02-01
        provider.set_detection_date(
            DateTime::parse_from_rfc3339("2024-05-01T00:00:00+00:00").unwrap(),
        );
        let features = provider.features("mod.py", 1).await;
        assert_eq!(features.file_change_frequency, 3);
        assert_eq!(features.lines_added_recent_months, 3);
    }

    struct FixedProvider;

    impl FeatureProvider for FixedProvider {
        async fn features(&self, _file_path: &str, line: u32) -> FeatureVector {
            FeatureVector {
                total_lines: line as usize,
                ..Default::default()
            }
        }
    }

    #[tokio::test]
    async fn test_default_batch_preserves_order() {
        let targets: Vec<_> = [3, 1, 2]
            .into_iter()
            .map(|line| FeatureTarget {
                file_path: "a.py".into(),
                line,
            })
            .collect();
        let vectors = FixedProvider.features_batch(&targets).await;
        let lines: Vec<_> = vectors.iter().map(|v| v.total_lines).collect();
        assert_eq!(lines, vec![3, 1, 2]);
    }
}

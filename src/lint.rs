use crate::config::LintConfig;
use crate::process::{self, ToolError};
use crate::types::RawViolation;
use crate::util::scope::TrackedScope;
use anyhow::{Context, bail};
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, trace};

const REQUIRED_GROUPS: [&str; 3] = ["path", "line", "rule"];
const WORKFLOWS_DIR: &str = ".github/workflows";

/// Runs the lint tool in a checkout and turns its report into raw violations
#[derive(Debug, Clone)]
pub struct LintRunner {
    command: String,
    args: Vec<String>,
    ok_exit_codes: Vec<i32>,
    pattern: Regex,
    timeout: Duration,
}

impl LintRunner {
    pub fn new(config: &LintConfig, timeout: Duration) -> anyhow::Result<Self> {
        let pattern = Regex::new(&config.pattern)
            .with_context(|| format!("Invalid lint.pattern '{}'", config.pattern))?;
        let groups: Vec<&str> = pattern.capture_names().flatten().collect();
        for group in REQUIRED_GROUPS {
            if !groups.contains(&group) {
                bail!("lint.pattern is missing the named group '{}'", group);
            }
        }
        Ok(Self {
            command: config.command.clone(),
            args: config.args.clone(),
            ok_exit_codes: config.ok_exit_codes.clone(),
            pattern,
            timeout,
        })
    }

    /// Lint the working tree at `root`, keeping violations in tracked files
    pub async fn run(
        &self,
        root: &Path,
        scope: &TrackedScope,
    ) -> Result<Vec<RawViolation>, ToolError> {
        let output = process::run(
            &self.command,
            &self.args,
            Some(root),
            self.timeout,
            &self.ok_exit_codes,
        )
        .await?;
        if !output.stderr.trim().is_empty() {
            debug!(
                "{} exited with {}: {}",
                self.command,
                output.code,
                output.stderr.trim()
            );
        }
        let violations = self.parse(&output.stdout, root, scope);
        debug!(
            "{} reported {} violations in tracked files",
            self.command,
            violations.len()
        );
        Ok(violations)
    }

    /// Parse the tool's report; lines that do not match the pattern are ignored
    pub fn parse(&self, output: &str, root: &Path, scope: &TrackedScope) -> Vec<RawViolation> {
        let mut sources = SourceCache::new(root);
        output
            .lines()
            .filter_map(|line| {
                let caps = self.pattern.captures(line.trim_end())?;
                let path = caps.name("path")?.as_str().trim();
                let path = path.strip_prefix("./").unwrap_or(path);
                if !scope.is_tracked(path) {
                    trace!("Ignoring violation in untracked file: {}", line);
                    return None;
                }
                let Ok(line_number) = caps.name("line")?.as_str().parse::<u32>() else {
                    trace!("Ignoring violation with invalid line: {}", line);
                    return None;
                };
                Some(RawViolation {
                    rule_id: caps.name("rule")?.as_str().to_string(),
                    file_path: path.to_string(),
                    message: caps
                        .name("message")
                        .map_or("", |m| m.as_str())
                        .trim()
                        .to_string(),
                    line: line_number,
                    context: sources.line(path, line_number),
                })
            })
            .collect()
    }
}

/// Lazily loaded source files, for reading violation context lines
struct SourceCache<'a> {
    root: &'a Path,
    files: HashMap<String, Option<Vec<String>>>,
}

impl<'a> SourceCache<'a> {
    fn new(root: &'a Path) -> Self {
        Self {
            root,
            files: HashMap::new(),
        }
    }

    /// Trimmed text of a line, empty if the file or line cannot be read
    fn line(&mut self, path: &str, line: u32) -> String {
        let root = self.root;
        let lines = self.files.entry(path.to_string()).or_insert_with(|| {
            fs::read(root.join(path))
                .ok()
                .map(|bytes| {
                    String::from_utf8_lossy(&bytes)
                        .lines()
                        .map(str::to_string)
                        .collect()
                })
        });
        lines
            .as_ref()
            .and_then(|lines| lines.get((line as usize).checked_sub(1)?))
            .map(|l| l.trim().to_string())
            .unwrap_or_default()
    }
}

/// Whether the project shows evidence of using the lint tool
pub fn uses_lint_tool(root: &Path, config: &LintConfig) -> bool {
    let markers: Vec<String> = config
        .usage_markers
        .iter()
        .map(|m| m.to_lowercase())
        .collect();
    let mentions_marker = |path: &Path| {
        fs::read(path)
            .map(|bytes| {
                let content = String::from_utf8_lossy(&bytes).to_lowercase();
                markers.iter().any(|m| content.contains(m.as_str()))
            })
            .unwrap_or(false)
    };

    if config
        .usage_files
        .iter()
        .any(|file| mentions_marker(&root.join(file)))
    {
        return true;
    }

    let Ok(entries) = fs::read_dir(root.join(WORKFLOWS_DIR)) else {
        return false;
    };
    entries.flatten().any(|entry| {
        let path = entry.path();
        let is_workflow = path
            .extension()
            .is_some_and(|ext| ext == "yml" || ext == "yaml");
        is_workflow && mentions_marker(&path)
    })
}

use crate::diff::BeyondRangePolicy;
use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// flake8-style `path:line:col: CODE message`
pub const DEFAULT_LINT_PATTERN: &str =
    r"^(?P<path>[^:]+):(?P<line>\d+):(?:\d+:)?\s*(?P<rule>[A-Z]+[0-9]+)\s*(?P<message>.*)$";

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub history: HistoryConfig,
    pub lint: LintConfig,
    pub tracking: TrackingConfig,
    pub features: FeatureConfig,
    pub worker: WorkerConfig,
    pub output: OutputConfig,
}

/// Commit range to mine, passed to `git log --since/--until`
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct HistoryConfig {
    pub since: Option<String>,
    pub until: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct LintConfig {
    /// Lint executable, run from the checkout root
    pub command: String,
    pub args: Vec<String>,
    /// Exit codes that still mean "lint ran" (flake8 exits 1 when it reports anything)
    pub ok_exit_codes: Vec<i32>,
    /// Regex with named groups `path`, `line`, `rule` and `message`
    pub pattern: String,
    /// Skip projects without evidence of using the lint tool
    pub require_usage: bool,
    pub usage_markers: Vec<String>,
    pub usage_files: Vec<String>,
}

impl Default for LintConfig {
    fn default() -> Self {
        Self {
            command: "flake8".into(),
            args: vec![],
            ok_exit_codes: vec![0, 1],
            pattern: DEFAULT_LINT_PATTERN.into(),
            require_usage: true,
            usage_markers: vec!["flake8".into(), "pycodestyle".into(), "pyflakes".into()],
            usage_files: vec![
                "setup.py".into(),
                "setup.cfg".into(),
                "requirements.txt".into(),
                "tox.ini".into(),
                ".flake8".into(),
                "pyproject.toml".into(),
            ],
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct TrackingConfig {
    /// Glob patterns of source files whose changes make a commit worth linting
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub beyond_range: BeyondRangePolicy,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            include: vec!["**/*.py".into()],
            exclude: vec![],
            beyond_range: BeyondRangePolicy::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct FeatureConfig {
    pub enabled: bool,
    /// Revisions of the file's history counted for `lines_added_recent_revisions`
    pub history_revisions: usize,
    /// Months of 30 days before the detection commit counted for `lines_added_recent_months`
    pub recent_months: u32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            history_revisions: 25,
            recent_months: 3,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    /// Projects mined at once (unset for no limit)
    pub max_parallel_projects: Option<usize>,
    pub command_timeout_secs: u64,
    /// Directory holding per-project checkouts
    pub workdir: String,
    pub keep_checkout: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_parallel_projects: Some(4),
            command_timeout_secs: 600,
            workdir: ".fixtrail".into(),
            keep_checkout: false,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Csv,
    Json,
    Parquet,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Parquet => "parquet",
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: String,
    pub format: OutputFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: "dataset".into(),
            format: OutputFormat::default(),
        }
    }
}

impl Config {
    /// Load the config file and apply `key.path=value` overrides.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &str, overrides: &[String]) -> anyhow::Result<Self> {
        let content = if Path::new(path).exists() {
            fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?
        } else {
            info!("Config file {} not found, using defaults", path);
            String::new()
        };
        Self::from_toml(&content, overrides).with_context(|| format!("Invalid config {}", path))
    }

    pub fn from_toml(content: &str, overrides: &[String]) -> anyhow::Result<Self> {
        let mut table: toml::Table = toml::from_str(content)?;
        for assignment in overrides {
            debug!("Applying config override: {}", assignment);
            apply_override(&mut table, assignment)?;
        }
        let config = toml::from_str(&toml::to_string(&table)?)?;
        Ok(config)
    }

    /// Default configuration rendered as TOML
    pub fn default_toml() -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }
}

/// Set a dotted key (e.g. `lint.command=ruff`) in a TOML table
fn apply_override(table: &mut toml::Table, assignment: &str) -> anyhow::Result<()> {
    let Some((path, raw)) = assignment.split_once('=') else {
        bail!("Invalid override '{}', expected key=value", assignment);
    };
    let value = parse_override_value(raw.trim());
    let keys: Vec<&str> = path.trim().split('.').map(str::trim).collect();
    if keys.iter().any(|k| k.is_empty()) {
        bail!("Invalid key in override '{}'", assignment);
    }

    let (last, parents) = keys.split_last().context("Empty override key")?;
    let mut current = table;
    for key in parents {
        current = current
            .entry(key.to_string())
            .or_insert(toml::Value::Table(toml::Table::new()))
            .as_table_mut()
            .with_context(|| format!("'{}' in override '{}' is not a table", key, assignment))?;
    }
    current.insert(last.to_string(), value);
    Ok(())
}

/// Parse an override value as a TOML literal, falling back to a plain string
fn parse_override_value(raw: &str) -> toml::Value {
    toml::from_str::<toml::Table>(&format!("value = {}", raw))
        .ok()
        .and_then(|mut t| t.remove("value"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

use crate::config::OutputFormat;
use crate::feature::{FeatureValue, FeatureVector};
use crate::types::{Commit, LedgerEntry};
use anyhow::Context;
use arrow_array::{ArrayRef, BooleanArray, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field, Schema};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub const SCHEMA_VERSION: u32 = 1;
pub const FIX_HISTORY_STEM: &str = "fix_history";
pub const COMMITS_FILE: &str = "commits.csv";
pub const SUMMARY_FILE: &str = "summary.json";

const BASE_COLUMNS: [&str; 10] = [
    "rule_id",
    "category",
    "file_path",
    "message",
    "line",
    "detected_line",
    "context",
    "first_seen_commit",
    "fix_commit",
    "fixed",
];

/// One exported violation, with its features when they were extracted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FixRow {
    pub rule_id: String,
    pub category: &'static str,
    pub file_path: String,
    pub message: String,
    pub line: u32,
    pub detected_line: u32,
    pub context: String,
    pub first_seen_commit: String,
    pub fix_commit: Option<String>,
    pub fixed: bool,
    #[serde(flatten)]
    pub features: Option<FeatureVector>,
}

impl FixRow {
    pub fn new(entry: &LedgerEntry, features: Option<FeatureVector>) -> Self {
        Self {
            rule_id: entry.rule_id.clone(),
            category: category(&entry.rule_id),
            file_path: entry.file_path.clone(),
            message: entry.message.clone(),
            line: entry.tracked_line,
            detected_line: entry.detected_line,
            context: entry.context.clone(),
            first_seen_commit: entry.first_seen_commit.clone(),
            fix_commit: entry.fix_commit.clone(),
            fixed: !entry.is_open(),
            features,
        }
    }
}

/// Violation category from the rule code prefix
pub fn category(rule_id: &str) -> &'static str {
    match rule_id.chars().next() {
        Some('E') => "error",
        Some('W') => "warning",
        Some('F') => "pyflakes",
        Some('C') => "complexity",
        Some('N') => "naming",
        Some('D') => "docstring",
        Some('B') => "bugbear",
        _ => "other",
    }
}

/// Quote a CSV field when it needs it (RFC 4180)
fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

fn push_record<'a>(output: &mut String, fields: impl IntoIterator<Item = &'a str>) {
    let record: Vec<Cow<'_, str>> = fields.into_iter().map(csv_field).collect();
    output.push_str(&record.join(","));
    output.push_str("\r\n");
}

/// Rows as CSV; feature columns are present only with `include_features`
pub fn format_csv(rows: &[FixRow], include_features: bool) -> String {
    let mut output = String::new();
    let header = BASE_COLUMNS.iter().copied().chain(
        FeatureVector::COLUMNS
            .iter()
            .copied()
            .filter(|_| include_features),
    );
    push_record(&mut output, header);

    let default_features = FeatureVector::default();
    for row in rows {
        let line = row.line.to_string();
        let detected_line = row.detected_line.to_string();
        let fixed = row.fixed.to_string();
        let mut fields = vec![
            row.rule_id.as_str(),
            row.category,
            row.file_path.as_str(),
            row.message.as_str(),
            line.as_str(),
            detected_line.as_str(),
            row.context.as_str(),
            row.first_seen_commit.as_str(),
            row.fix_commit.as_deref().unwrap_or(""),
            fixed.as_str(),
        ];
        let values = if include_features {
            row.features.as_ref().unwrap_or(&default_features).values()
        } else {
            Vec::new()
        };
        fields.extend(values.iter().map(String::as_str));
        push_record(&mut output, fields);
    }
    output
}

#[derive(Serialize)]
struct JsonExport<'a> {
    schema_version: u32,
    project: &'a str,
    rows: &'a [FixRow],
}

pub fn format_json(project: &str, rows: &[FixRow]) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(&JsonExport {
        schema_version: SCHEMA_VERSION,
        project,
        rows,
    })?)
}

/// Rows as one Arrow batch with typed columns, in the CSV column order
pub fn record_batch(rows: &[FixRow], include_features: bool) -> anyhow::Result<RecordBatch> {
    let mut fields = vec![
        Field::new("rule_id", DataType::Utf8, false),
        Field::new("category", DataType::Utf8, false),
        Field::new("file_path", DataType::Utf8, false),
        Field::new("message", DataType::Utf8, false),
        Field::new("line", DataType::UInt32, false),
        Field::new("detected_line", DataType::UInt32, false),
        Field::new("context", DataType::Utf8, false),
        Field::new("first_seen_commit", DataType::Utf8, false),
        Field::new("fix_commit", DataType::Utf8, true),
        Field::new("fixed", DataType::Boolean, false),
    ];
    let mut columns: Vec<ArrayRef> = vec![
        text_column(rows, |r| r.rule_id.as_str()),
        text_column(rows, |r| r.category),
        text_column(rows, |r| r.file_path.as_str()),
        text_column(rows, |r| r.message.as_str()),
        Arc::new(UInt32Array::from_iter_values(rows.iter().map(|r| r.line))),
        Arc::new(UInt32Array::from_iter_values(rows.iter().map(|r| r.detected_line))),
        text_column(rows, |r| r.context.as_str()),
        text_column(rows, |r| r.first_seen_commit.as_str()),
        Arc::new(
            rows.iter()
                .map(|r| r.fix_commit.as_deref())
                .collect::<StringArray>(),
        ),
        Arc::new(BooleanArray::from(
            rows.iter().map(|r| r.fixed).collect::<Vec<bool>>(),
        )),
    ];

    if include_features {
        let default_features = FeatureVector::default();
        let values: Vec<Vec<FeatureValue<'_>>> = rows
            .iter()
            .map(|r| r.features.as_ref().unwrap_or(&default_features).typed_values())
            .collect();
        let kinds = default_features.typed_values();
        for (index, (name, kind)) in FeatureVector::COLUMNS.iter().zip(kinds).enumerate() {
            let column = values.iter().map(|v| v[index]);
            let (data_type, array): (DataType, ArrayRef) = match kind {
                FeatureValue::Count(_) => (
                    DataType::UInt64,
                    Arc::new(UInt64Array::from_iter_values(column.map(|v| match v {
                        FeatureValue::Count(n) => n,
                        _ => 0,
                    }))),
                ),
                FeatureValue::Flag(_) => (
                    DataType::Boolean,
                    Arc::new(BooleanArray::from(
                        column
                            .map(|v| matches!(v, FeatureValue::Flag(true)))
                            .collect::<Vec<bool>>(),
                    )),
                ),
                FeatureValue::Text(_) => (
                    DataType::Utf8,
                    Arc::new(StringArray::from_iter_values(column.map(|v| match v {
                        FeatureValue::Text(s) => s,
                        _ => "",
                    }))),
                ),
            };
            fields.push(Field::new(*name, data_type, false));
            columns.push(array);
        }
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

fn text_column<'a>(rows: &'a [FixRow], value: impl Fn(&'a FixRow) -> &'a str) -> ArrayRef {
    Arc::new(StringArray::from_iter_values(rows.iter().map(value)))
}

/// Write rows as Parquet, with the schema version and project in the file metadata
pub fn write_parquet(
    path: &Path,
    project: &str,
    rows: &[FixRow],
    include_features: bool,
) -> anyhow::Result<()> {
    let batch = record_batch(rows, include_features)?;
    let properties = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(vec![
            KeyValue::new("schema_version".to_string(), SCHEMA_VERSION.to_string()),
            KeyValue::new("project".to_string(), project.to_string()),
        ]))
        .build();
    let file =
        fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(properties))?;
    writer.write(&batch)?;
    writer
        .close()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn format_commits_csv(commits: &[Commit]) -> String {
    let mut output = String::new();
    push_record(&mut output, ["commit_hash", "committed_at"]);
    for commit in commits {
        let committed_at = commit.committed_at.to_rfc3339();
        push_record(&mut output, [commit.hash.as_str(), committed_at.as_str()]);
    }
    output
}

/// Write a project's fix history and commit list under `<dir>/<project>/`
pub fn write_project(
    dir: &Path,
    project: &str,
    format: OutputFormat,
    include_features: bool,
    rows: &[FixRow],
    commits: &[Commit],
) -> anyhow::Result<PathBuf> {
    let project_dir = dir.join(project);
    fs::create_dir_all(&project_dir)
        .with_context(|| format!("Failed to create {}", project_dir.display()))?;

    let history_path = project_dir.join(format!("{}.{}", FIX_HISTORY_STEM, format.extension()));
    match format {
        OutputFormat::Csv => write_text(&history_path, &format_csv(rows, include_features))?,
        OutputFormat::Json => write_text(&history_path, &format_json(project, rows)?)?,
        OutputFormat::Parquet => write_parquet(&history_path, project, rows, include_features)?,
    }

    write_text(&project_dir.join(COMMITS_FILE), &format_commits_csv(commits))?;

    info!(
        "[{}] {} rows written to {}",
        project,
        rows.len(),
        history_path.display()
    );
    Ok(history_path)
}

fn write_text(path: &Path, content: &str) -> anyhow::Result<()> {
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

pub fn write_summary<T: Serialize>(dir: &Path, summary: &T) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(SUMMARY_FILE);
    fs::write(&path, serde_json::to_string_pretty(summary)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Summary written to {}", path.display());
    Ok(path)
}

/// Render ledger entries for the file extension of `path` (.json or .csv)
pub fn format_entries(path: &str, entries: &[LedgerEntry]) -> anyhow::Result<String> {
    if path.ends_with(".json") {
        Ok(serde_json::to_string_pretty(entries)?)
    } else if path.ends_with(".csv") {
        let rows: Vec<FixRow> = entries.iter().map(|e| FixRow::new(e, None)).collect();
        Ok(format_csv(&rows, false))
    } else {
        anyhow::bail!("Output file must end with .csv or .json")
    }
}

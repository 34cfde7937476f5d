use crate::batch::{BatchProcessor, CommitSnapshot};
use crate::config::Config;
use crate::export::{self, FixRow};
use crate::feature::{FeatureProvider, FeatureTarget, FeatureVector, SourceFeatureProvider};
use crate::ledger::ViolationLedger;
use crate::lint::{self, LintRunner};
use crate::types::{Commit, Project, Status};
use crate::util::scope::TrackedScope;
use crate::util::{self, Repo};
use anyhow::{Context, bail};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

/// Commits between progress lines while mining one project
const PROGRESS_INTERVAL: usize = 50;

/// Outcome of mining one project
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectReport {
    pub name: String,
    pub success: bool,
    pub reason: Option<String>,
    pub total_commits: usize,
    pub processed_commits: usize,
    pub skipped_commits: usize,
    pub total_violations: usize,
    pub fixed_violations: usize,
    pub output: Option<PathBuf>,
    pub elapsed_secs: f64,
}

/// Mine one project: clone, walk its history through the ledger, export the result.
///
/// Never fails; problems are reported through [`ProjectReport::reason`]. Nothing is
/// exported for a failed project, and the checkout is removed either way unless
/// `worker.keep_checkout` is set.
pub async fn worker(
    project: Project,
    config: Arc<Config>,
    output_dir: PathBuf,
    shutdown: Arc<Mutex<bool>>,
) -> ProjectReport {
    let start = Instant::now();
    let mut report = ProjectReport {
        name: project.name.clone(),
        ..Default::default()
    };
    info!("[{}] Mining {}", project.name, util::redact_url(&project.url));

    let checkout = Path::new(&config.worker.workdir)
        .join(format!("{}-{}", project.dir_name(), std::process::id()));
    let result = mine(&project, &config, &checkout, &output_dir, &shutdown, &mut report).await;

    if !config.worker.keep_checkout && checkout.exists() {
        debug!("[{}] Removing checkout {}", project.name, checkout.display());
        if let Err(e) = tokio::fs::remove_dir_all(&checkout).await {
            warn!(
                "[{}] Failed to remove checkout {}: {}",
                project.name,
                checkout.display(),
                e
            );
        }
    }

    report.elapsed_secs = start.elapsed().as_secs_f64();
    match result {
        Ok(path) => {
            report.success = true;
            report.output = Some(path);
            info!(
                "[{}] Done: {} violations ({} fixed) over {} commits ({:.2}s)",
                project.name,
                report.total_violations,
                report.fixed_violations,
                report.processed_commits,
                report.elapsed_secs
            );
        }
        Err(e) => {
            warn!("[{}] Failed: {:#}", project.name, e);
            report.reason = Some(format!("{:#}", e));
        }
    }
    report
}

async fn mine(
    project: &Project,
    config: &Config,
    checkout: &Path,
    output_dir: &Path,
    shutdown: &Mutex<bool>,
    report: &mut ProjectReport,
) -> anyhow::Result<PathBuf> {
    let name = project.name.as_str();
    let timeout = Duration::from_secs(config.worker.command_timeout_secs);
    let scope = TrackedScope::new(&config.tracking)?;
    let lint = LintRunner::new(&config.lint, timeout)?;

    if checkout.exists() {
        debug!("[{}] Removing stale checkout {}", name, checkout.display());
        tokio::fs::remove_dir_all(checkout)
            .await
            .with_context(|| format!("Failed to remove {}", checkout.display()))?;
    }
    let token = std::env::var("GITHUB_TOKEN").ok();
    let repo = Repo::clone_remote(
        &util::authenticated_url(&project.url, token.as_deref()),
        checkout,
        timeout,
    )
    .await
    .context("clone failed")?;

    if config.lint.require_usage && !lint::uses_lint_tool(repo.root(), &config.lint) {
        bail!("lint tool not used");
    }

    let commits = repo
        .list_commits(
            config.history.since.as_deref(),
            config.history.until.as_deref(),
        )
        .await
        .context("failed to list commits")?;
    report.total_commits = commits.len();
    let Some((first, rest)) = commits.split_first() else {
        bail!("no commits in range");
    };
    info!("[{}] {} commits in range", name, commits.len());

    let mut provider = config
        .features
        .enabled
        .then(|| SourceFeatureProvider::new(repo.clone(), &config.features));
    let mut features: HashMap<usize, FeatureVector> = HashMap::new();

    repo.checkout(&first.hash)
        .await
        .with_context(|| format!("checkout of {} failed", first.short()))?;
    let initial = lint
        .run(repo.root(), &scope)
        .await
        .with_context(|| format!("lint failed at {}", first.short()))?;
    let (mut batch, seeded) =
        BatchProcessor::seed(&first.hash, &initial, config.tracking.beyond_range);
    if let Some(provider) = &mut provider {
        provider.set_detection_date(first.committed_at);
        collect_features(&*provider, batch.ledger(), &seeded.opened, &mut features).await;
    }
    info!(
        "[{}] Seeded {} violations at {}",
        name,
        seeded.opened.len(),
        first.short()
    );

    let mut tracked: Vec<Commit> = vec![first.clone()];
    report.processed_commits = 1;

    for (i, commit) in rest.iter().enumerate() {
        if *shutdown.lock().await {
            bail!("cancelled");
        }
        let previous = tracked.last().map_or(first.hash.as_str(), |c| c.hash.as_str());

        let changed = repo
            .changed_files(previous, &commit.hash)
            .await
            .with_context(|| format!("failed to list changes in {}", commit.short()))?;
        if !scope.any_tracked(&changed) {
            trace!("[{}] Skipping {}: no tracked files changed", name, commit.short());
            report.skipped_commits += 1;
            continue;
        }

        let diff = repo
            .diff(previous, &commit.hash)
            .await
            .with_context(|| format!("diff of {} failed", commit.short()))?;
        repo.checkout(&commit.hash)
            .await
            .with_context(|| format!("checkout of {} failed", commit.short()))?;
        let violations = lint
            .run(repo.root(), &scope)
            .await
            .with_context(|| format!("lint failed at {}", commit.short()))?;

        let summary = batch.step(&CommitSnapshot {
            commit: commit.hash.clone(),
            diff,
            violations,
        });
        debug!(
            "[{}] {}: {} opened, {} fixed, {} remapped",
            name,
            commit.short(),
            summary.opened.len(),
            summary.fixed.len(),
            summary.remapped
        );
        if let Some(provider) = &mut provider {
            provider.set_detection_date(commit.committed_at);
            collect_features(&*provider, batch.ledger(), &summary.opened, &mut features).await;
        }
        tracked.push(commit.clone());
        report.processed_commits += 1;

        if (i + 1) % PROGRESS_INTERVAL == 0 {
            info!(
                "[{}] {}/{} commits, {} open violations",
                name,
                i + 2,
                commits.len(),
                batch.ledger().open_count()
            );
        }
    }

    debug!(
        "[{}] Ledger at v{} after {} commit transitions",
        name,
        batch.ledger().version(),
        batch.steps()
    );
    let entries = batch.finish();
    report.total_violations = entries.len();
    report.fixed_violations = entries
        .iter()
        .filter(|e| e.status == Status::Fixed)
        .count();

    let rows: Vec<FixRow> = entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let vector = provider
                .as_ref()
                .map(|_| features.remove(&i).unwrap_or_default());
            FixRow::new(entry, vector)
        })
        .collect();
    export::write_project(
        output_dir,
        &project.dir_name(),
        config.output.format,
        provider.is_some(),
        &rows,
        &tracked,
    )
}

/// Extract features for newly opened entries while their commit is checked out
async fn collect_features<P: FeatureProvider>(
    provider: &P,
    ledger: &ViolationLedger,
    opened: &[usize],
    features: &mut HashMap<usize, FeatureVector>,
) {
    if opened.is_empty() {
        return;
    }
    let targets: Vec<FeatureTarget> = opened
        .iter()
        .map(|&i| {
            let entry = &ledger.entries()[i];
            FeatureTarget {
                file_path: entry.file_path.clone(),
                line: entry.tracked_line,
            }
        })
        .collect();
    let vectors = provider.features_batch(&targets).await;
    features.extend(opened.iter().copied().zip(vectors));
}

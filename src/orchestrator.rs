use crate::config::Config;
use crate::export;
use crate::types::Project;
use crate::worker::{self, ProjectReport};
use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Number of decimal places for elapsed time display
const ELAPSED_TIME_PRECISION: usize = 2;

const EXIT_FAILURE: i32 = 1;

/// Run-level outcome written to `summary.json`
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub total_projects: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Projects never started because of a shutdown request
    pub cancelled: usize,
    pub elapsed_secs: f64,
    pub projects: Vec<ProjectReport>,
}

impl RunSummary {
    fn new(
        started_at: DateTime<Utc>,
        total_projects: usize,
        projects: Vec<ProjectReport>,
        elapsed_secs: f64,
    ) -> Self {
        let succeeded = projects.iter().filter(|p| p.success).count();
        Self {
            started_at,
            total_projects,
            succeeded,
            failed: projects.len() - succeeded,
            cancelled: total_projects - projects.len(),
            elapsed_secs,
            projects,
        }
    }
}

/// Collect projects from a JSON list file and `--repo` arguments
///
/// Entries without a URL are skipped, as are repeated names (each project owns an
/// output directory named after it).
pub fn load_projects(path: Option<&str>, repos: &[String]) -> anyhow::Result<Vec<Project>> {
    let mut projects = Vec::new();

    if let Some(path) = path {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read projects file {}", path))?;
        let listed: Vec<Project> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse projects file {}", path))?;
        debug!("Loaded {} projects from {}", listed.len(), path);
        projects.extend(listed);
    }

    for arg in repos {
        match Project::parse_arg(arg) {
            Some(project) => projects.push(project),
            None => anyhow::bail!("Invalid --repo '{}', expected NAME=URL or URL", arg),
        }
    }

    let mut seen = HashSet::new();
    projects.retain(|project| {
        if project.url.trim().is_empty() {
            warn!("Skipping project '{}': no repository URL", project.name);
            return false;
        }
        if !seen.insert(project.dir_name()) {
            warn!("Skipping duplicate project '{}'", project.name);
            return false;
        }
        true
    });
    Ok(projects)
}

/// Mine every project with a bounded worker pool, then write the run summary
///
/// Exits the process with a failure code if any project failed.
pub async fn orchestrate_and_run(
    projects: Vec<Project>,
    config: Config,
    output_dir: PathBuf,
    dry_run: bool,
) {
    let total = projects.len();
    info!("Found {} projects", total);

    if dry_run {
        info!("Dry run - {} projects to mine:", total);
        for (i, project) in projects.iter().enumerate() {
            info!(
                "  Project {}: name='{}', url={}",
                i,
                project.name,
                crate::util::redact_url(&project.url)
            );
        }
        return;
    }

    // Workers poll the flag between commits; no new projects start once it is set
    let shutdown = Arc::new(Mutex::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        warn!("Received shutdown signal, stopping workers...");
        *shutdown_clone.lock().await = true;
    });

    let config = Arc::new(config);
    let started_at = Utc::now();
    let start = Instant::now();

    let mut futures_iter = projects.into_iter().map(|project| {
        let config = config.clone();
        let output_dir = output_dir.clone();
        let shutdown = shutdown.clone();
        async move {
            let name = project.name.clone();
            tokio::spawn(worker::worker(project, config, output_dir, shutdown))
                .await
                .unwrap_or_else(|e| ProjectReport {
                    name,
                    reason: Some(format!("worker task failed: {}", e)),
                    ..Default::default()
                })
        }
    });

    let max_workers = config.worker.max_parallel_projects.unwrap_or(total).max(1);
    if config.worker.max_parallel_projects.is_some() {
        info!("Running workers with max parallelism: {}", max_workers);
    } else {
        info!("Running workers with unlimited parallelism");
    }

    // Fill initial pool up to max_workers
    let mut stream = FuturesUnordered::new();
    for _ in 0..max_workers.min(total) {
        if let Some(fut) = futures_iter.next() {
            stream.push(fut);
        }
    }

    // As workers complete, start new ones to maintain pool size
    let mut reports = Vec::with_capacity(total);
    let mut shutdown_logged = false;
    while let Some(report) = stream.next().await {
        reports.push(report);
        log_progress(&reports, total, start.elapsed().as_secs_f64());
        if *shutdown.lock().await {
            if !shutdown_logged {
                warn!("Shutdown requested, not starting new projects");
                shutdown_logged = true;
            }
            continue;
        }
        if let Some(fut) = futures_iter.next() {
            stream.push(fut);
        }
    }

    let summary = RunSummary::new(started_at, total, reports, start.elapsed().as_secs_f64());
    for report in summary.projects.iter().filter(|r| !r.success) {
        error!(
            "[{}] Failed: {}",
            report.name,
            report.reason.as_deref().unwrap_or("unknown")
        );
    }
    if *shutdown.lock().await {
        warn!(
            "Mining interrupted: {} succeeded, {} failed, {} cancelled",
            summary.succeeded, summary.failed, summary.cancelled
        );
    } else {
        info!(
            "Mining complete: {} succeeded, {} failed ({:.prec$}s)",
            summary.succeeded,
            summary.failed,
            summary.elapsed_secs,
            prec = ELAPSED_TIME_PRECISION
        );
    }

    if let Err(e) = export::write_summary(&output_dir, &summary) {
        error!("Failed to write summary: {:#}", e);
        std::process::exit(EXIT_FAILURE);
    }

    if summary.failed > 0 || summary.cancelled > 0 {
        std::process::exit(EXIT_FAILURE);
    }
}

/// Resolve on Ctrl+C, or SIGTERM on Unix
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut terminate) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
            return;
        }
    }
    tokio::signal::ctrl_c().await.ok();
}

fn log_progress(reports: &[ProjectReport], total: usize, elapsed_secs: f64) {
    let completed = reports.len();
    let succeeded = reports.iter().filter(|r| r.success).count();
    info!(
        "Progress: {}/{} projects, {:.1}% succeeded, elapsed {}, ETA {}",
        completed,
        total,
        success_rate(succeeded, completed),
        format_duration(elapsed_secs),
        format_duration(eta_secs(completed, total, elapsed_secs))
    );
}

fn success_rate(succeeded: usize, completed: usize) -> f64 {
    if completed == 0 {
        return 0.0;
    }
    succeeded as f64 * 100.0 / completed as f64
}

/// Remaining time assuming the average project duration so far
fn eta_secs(completed: usize, total: usize, elapsed_secs: f64) -> f64 {
    if completed == 0 {
        return 0.0;
    }
    elapsed_secs / completed as f64 * total.saturating_sub(completed) as f64
}

fn format_duration(secs: f64) -> String {
    let secs = secs.max(0.0).round() as u64;
    format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

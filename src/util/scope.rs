use crate::config::TrackingConfig;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;

/// Source files whose changes and violations are tracked
#[derive(Debug, Clone)]
pub struct TrackedScope {
    include: GlobSet,
    exclude: GlobSet,
}

impl TrackedScope {
    pub fn new(config: &TrackingConfig) -> anyhow::Result<Self> {
        Ok(Self {
            include: build_globset(&config.include, "include")?,
            exclude: build_globset(&config.exclude, "exclude")?,
        })
    }

    pub fn is_tracked(&self, path: &str) -> bool {
        let path = path.strip_prefix("./").unwrap_or(path);
        self.include.is_match(path) && !self.exclude.is_match(path)
    }

    /// Whether any path in the list is tracked
    pub fn any_tracked<S: AsRef<str>>(&self, paths: &[S]) -> bool {
        paths.iter().any(|p| self.is_tracked(p.as_ref()))
    }
}

fn build_globset(patterns: &[String], pattern_type: &str) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => builder.add(glob),
            Err(e) => {
                warn!("Invalid {} pattern '{}': {}", pattern_type, pattern, e);
                continue;
            }
        };
    }
    Ok(builder.build()?)
}

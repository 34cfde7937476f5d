use clap::{Parser, Subcommand};

// Display order for log level option (placed at end of help text)
const LOG_LEVEL_DISPLAY_ORDER: usize = 100;

/// CLI arguments
#[derive(Parser)]
#[command(name = "fixtrail", version, about = "Mine lint violation lifecycles from git history", long_about = None)]
pub struct Cli {
    /// Log level (see https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html)
    /// [env: FIXTRAIL_LOG=] [default: info]
    #[arg(
        long,
        env = "FIXTRAIL_LOG",
        default_value = "info",
        global = true,
        hide_default_value = true,
        hide_env = true,
        display_order = LOG_LEVEL_DISPLAY_ORDER,
        verbatim_doc_comment
    )]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a default fixtrail.toml config file
    Init(InitArgs),
    /// Clone projects and mine violation fix histories
    Mine(MineArgs),
    /// Replay a recorded commit history through the ledger
    Replay(ReplayArgs),
}

/// Arguments for the init command
#[derive(Parser)]
pub struct InitArgs {
    /// Path to config file
    #[arg(long, default_value = "fixtrail.toml")]
    pub config: String,

    /// Override existing config file
    #[arg(long)]
    pub r#override: bool,
}

/// Arguments for the mine command
#[derive(Parser, Debug)]
pub struct MineArgs {
    /// JSON file listing projects.
    /// Each entry needs `name` (or `pkgName`) and `url` (or `repository_url`)
    #[arg(long, verbatim_doc_comment)]
    pub projects: Option<String>,

    /// Repository to mine, as NAME=URL or URL (repeatable)
    #[arg(long)]
    pub repo: Vec<String>,

    /// Path to config file (initialize with `fixtrail init`)
    #[arg(long, default_value = "fixtrail.toml")]
    pub config: String,

    /// Override config values using dot notation (e.g. lint.command=ruff)
    #[arg(long = "config-override")]
    pub config_overrides: Vec<String>,

    /// Output directory (overrides output.dir)
    #[arg(long)]
    pub output_dir: Option<String>,

    /// Dry run: only list projects without mining them
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the replay command
#[derive(Parser, Debug)]
pub struct ReplayArgs {
    /// Fixture file (.json) with the initial snapshot and later commits
    pub fixture: String,

    /// Output file path (.csv or .json); printed to the console if omitted
    #[arg(long)]
    pub output: Option<String>,

    /// Path to config file
    #[arg(long, default_value = "fixtrail.toml")]
    pub config: String,

    /// Override config values using dot notation (e.g. tracking.beyond_range=keep)
    #[arg(long = "config-override")]
    pub config_overrides: Vec<String>,
}

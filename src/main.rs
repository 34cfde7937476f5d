mod batch;
mod cli;
mod config;
mod diff;
mod export;
mod feature;
mod ledger;
mod lint;
mod orchestrator;
mod process;
mod types;
mod util;
mod worker;

use batch::ReplayFixture;
use clap::Parser;
use cli::{Cli, Commands, InitArgs, MineArgs, ReplayArgs};
use config::Config;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_FAILURE: i32 = 1;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Init(args) => init(&args),
        Commands::Mine(args) => mine(args).await,
        Commands::Replay(args) => replay(&args),
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|e| {
        eprintln!("Invalid log level '{}': {}", log_level, e);
        EnvFilter::new("info")
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &str, overrides: &[String]) -> Config {
    Config::load(path, overrides).unwrap_or_else(|e| {
        error!("Failed to load config: {:#}", e);
        std::process::exit(EXIT_FAILURE);
    })
}

fn init(args: &InitArgs) {
    if std::path::Path::new(&args.config).exists() && !args.r#override {
        error!(
            "Config file {} already exists (use --override to replace it)",
            args.config
        );
        std::process::exit(EXIT_FAILURE);
    }
    let content = Config::default_toml().unwrap_or_else(|e| {
        error!("Failed to render default config: {:#}", e);
        std::process::exit(EXIT_FAILURE);
    });
    if let Err(e) = std::fs::write(&args.config, content) {
        error!("Failed to write {}: {}", args.config, e);
        std::process::exit(EXIT_FAILURE);
    }
    info!("Config written to {}", args.config);
}

async fn mine(args: MineArgs) {
    let mut config = load_config(&args.config, &args.config_overrides);
    if let Some(dir) = args.output_dir {
        config.output.dir = dir;
    }

    if args.projects.is_none() && args.repo.is_empty() {
        error!("No projects given (use --projects or --repo)");
        std::process::exit(EXIT_FAILURE);
    }
    let projects = orchestrator::load_projects(args.projects.as_deref(), &args.repo)
        .unwrap_or_else(|e| {
            error!("Failed to load projects: {:#}", e);
            std::process::exit(EXIT_FAILURE);
        });

    let output_dir = PathBuf::from(&config.output.dir);
    orchestrator::orchestrate_and_run(projects, config, output_dir, args.dry_run).await;
}

fn replay(args: &ReplayArgs) {
    let config = load_config(&args.config, &args.config_overrides);
    let fixture = ReplayFixture::load(&args.fixture).unwrap_or_else(|e| {
        error!("{:#}", e);
        std::process::exit(EXIT_FAILURE);
    });
    let entries = fixture.replay(config.tracking.beyond_range);

    let Some(output) = &args.output else {
        match serde_json::to_string_pretty(&entries) {
            Ok(content) => println!("{}", content),
            Err(e) => {
                error!("Failed to serialize ledger: {}", e);
                std::process::exit(EXIT_FAILURE);
            }
        }
        return;
    };
    let content = export::format_entries(output, &entries).unwrap_or_else(|e| {
        error!("{:#}", e);
        std::process::exit(EXIT_FAILURE);
    });
    if let Err(e) = std::fs::write(output, content) {
        error!("Failed to write output file: {}", e);
        std::process::exit(EXIT_FAILURE);
    }
    info!("Results written to {}", output);
}

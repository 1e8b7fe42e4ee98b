use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use pinrun_core::config::{load_settings, SettingsLoader};
use pinrun_core::{Task, TaskRunner};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "pinrun", author, version, about = "Run a callable from a pinned repository branch")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(long, short, help = "YAML settings file; PINRUN_* environment variables apply on top")]
    config: Option<PathBuf>,

    #[clap(long, short, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a task and print its result as JSON
    Run {
        #[clap(long, help = "Repository URL (http, https or file)")]
        repo: String,

        #[clap(long, default_value = "master")]
        branch: String,

        #[clap(help = "Callable to run, as module:object")]
        entry_point: String,

        #[clap(long, default_value = "[]", help = "Positional arguments as a JSON array")]
        args: String,

        #[clap(long, default_value = "{}", help = "Keyword arguments as a JSON object")]
        kwargs: String,

        #[clap(long, default_value_t = pinrun_core::task::DEFAULT_TIMEOUT_SECONDS)]
        timeout: u64,

        #[clap(long, help = "Leave kept containers and VMs running after the task")]
        keep: bool,
    },
    /// Print the absolute path of a file inside the repository
    Static {
        #[clap(long)]
        repo: String,

        #[clap(long, default_value = "master")]
        branch: String,

        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays valid JSON.
    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .parse_default_env()
        .init();

    let settings = match &cli.config {
        Some(path) => load_settings(path)
            .await
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => SettingsLoader::from_env()?,
    };
    let runner = TaskRunner::new(settings).await?;

    match cli.command {
        Commands::Run {
            repo,
            branch,
            entry_point,
            args,
            kwargs,
            timeout,
            keep,
        } => {
            let args: Value = serde_json::from_str(&args).context("--args is not valid JSON")?;
            let kwargs: Value = serde_json::from_str(&kwargs).context("--kwargs is not valid JSON")?;
            let task = Task::from_json_parts(&entry_point, args, kwargs, timeout)?;

            let outcome = runner.run(&repo, &branch, &task).await;
            if !keep {
                if let Err(e) = runner.stop().await {
                    log::warn!("Failed to stop backend resources: {}", e);
                }
            }
            let result = outcome?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Static { repo, branch, path } => {
            let resolved = runner.static_filename(&repo, &branch, &path).await?;
            println!("{}", serde_json::to_string(&resolved.display().to_string())?);
        }
    }

    Ok(())
}

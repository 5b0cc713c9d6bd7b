use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use harvest_core::config::LogFormat;
use harvest_core::domain::{DataObjectId, TaskConfig, TaskId, TaskStatus, TaskType};
use harvest_core::observability::init_logging;
use harvest_core::{Engine, EngineBuilder, HarvestConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "harvest", version)]
#[command(about = "Task lifecycle engine for scrape and OCR automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file (HARVEST_* environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level or filter directive; RUST_LOG wins when set
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// json or pretty
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a pending task
    Submit {
        /// scrape or ocr
        task_type: TaskType,
        /// URL for scrape, file path for ocr
        source: String,
        /// Processor parameter as key=value; the value is parsed as JSON when it can be
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, serde_json::Value)>,
        /// Earliest dispatch time (RFC 3339)
        #[arg(long)]
        not_before: Option<DateTime<Utc>>,
    },
    /// Show a task with its executions and data objects
    Status { task_id: TaskId },
    /// List tasks, oldest first
    List {
        #[arg(short, long)]
        status: Option<TaskStatus>,
    },
    /// Cancel a pending or running task
    Cancel { task_id: TaskId },
    /// Write a data object's bytes to a file or stdout
    Fetch {
        object_id: DataObjectId,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run scheduler, workers and reaper until Ctrl-C
    Run {
        /// Stop once no task is pending or running
        #[arg(long)]
        until_idle: bool,
    },
    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigActions,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigActions {
    /// Print the effective configuration as TOML
    Show,
}

fn parse_param(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = HarvestConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_logging(&config.logging.level, config.logging.format)?;
    config.log_summary();

    if let Commands::Config {
        action: ConfigActions::Show,
    } = cli.command
    {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let engine = EngineBuilder::new(config).build().await?;
    run(engine, cli.command).await
}

async fn run(engine: Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Submit {
            task_type,
            source,
            params,
            not_before,
        } => {
            let config = params
                .into_iter()
                .fold(TaskConfig::new(source), |config, (key, value)| {
                    config.with_param(key, value)
                });
            let task = engine.submit(task_type, config, not_before).await?;
            print_json(&task)
        }
        Commands::Status { task_id } => {
            let report = engine.report(task_id).await?;
            info!("{}", report.summary());
            print_json(&report)
        }
        Commands::List { status } => print_json(&engine.list_tasks(status).await?),
        Commands::Cancel { task_id } => print_json(&engine.cancel(task_id).await?),
        Commands::Fetch { object_id, output } => {
            let (object, bytes) = engine.retrieve_object(object_id).await?;
            match output {
                Some(path) => std::fs::write(&path, &bytes)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => std::io::stdout().write_all(&bytes)?,
            }
            info!(
                object_id = %object.id(),
                content_type = object.content_type(),
                bytes = bytes.len(),
                "object fetched"
            );
            Ok(())
        }
        Commands::Run { until_idle } => {
            let handle = engine.start();
            tokio::select! {
                idle = handle.wait_idle(), if until_idle => {
                    idle?;
                    info!("no pending or running tasks left");
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.context("waiting for Ctrl-C")?;
                    info!("interrupted, shutting down");
                }
            }
            handle.shutdown_and_join().await;
            print_json(&engine.counts().await?)
        }
        Commands::Config { .. } => bail!("config commands do not need the engine"),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_parse_json_values_and_fall_back_to_strings() {
        assert_eq!(parse_param("depth=2").unwrap(), ("depth".into(), json!(2)));
        assert_eq!(
            parse_param("language=deu").unwrap(),
            ("language".into(), json!("deu"))
        );
        assert_eq!(parse_param("q=a=b").unwrap(), ("q".into(), json!("a=b")));
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=1").is_err());
    }

    #[test]
    fn submit_arguments() {
        let cli = Cli::try_parse_from([
            "harvest",
            "submit",
            "scrape",
            "https://example.com",
            "--param",
            "depth=1",
            "--not-before",
            "2024-03-01T12:00:00Z",
        ])
        .unwrap();
        match cli.command {
            Commands::Submit {
                task_type,
                params,
                not_before,
                ..
            } => {
                assert_eq!(task_type, TaskType::Scrape);
                assert_eq!(params.len(), 1);
                assert!(not_before.is_some());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}

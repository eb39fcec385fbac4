// src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use modelfetch::humanize::{format_bytes, format_duration};
use modelfetch::prelude::*;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "modelfetch")]
#[command(about = "Resumable downloads for large model files", long_about = None)]
struct Cli {
    /// Configuration file (defaults to $MODELFETCH_CONFIG or config/modelfetch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download a URL to a file, resuming any partial file already there
    Get(GetArgs),
    /// Fetch a small resource and print it to stdout
    Cat(CatArgs),
}

#[derive(clap::Args, Debug)]
struct GetArgs {
    url: String,
    destination: PathBuf,
    /// Extra request header, e.g. -H "Authorization: Bearer <token>"
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
}

#[derive(clap::Args, Debug)]
struct CatArgs {
    url: String,
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Get(args) => get(&config, args).await,
        Commands::Cat(args) => cat(&config, args).await,
    }
}

async fn get(config: &Config, args: GetArgs) -> Result<()> {
    let headers = parse_headers(&args.headers)?;
    let manager = JobManager::from_config(config).await?;
    let id = manager
        .create_job_with_headers(args.url, args.destination, headers)
        .await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let job = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                manager.cancel_job(id).await;
                manager.shutdown().await;
                println!("\ncancelled; run the same command again to resume");
                return Ok(());
            }
            _ = ticker.tick() => {
                let Some(job) = manager.get_job(id).await else {
                    bail!("job {id} disappeared");
                };
                if !job.status.is_active() {
                    break job;
                }
                print_progress(&job.progress);
            }
        }
    };

    match job.status {
        JobStatus::Completed => {
            println!(
                "\ndownloaded {} to {}",
                format_bytes(job.progress.downloaded),
                job.destination.display()
            );
            Ok(())
        }
        status => bail!(
            "download {}: {}",
            status,
            job.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

async fn cat(config: &Config, args: CatArgs) -> Result<()> {
    let headers = parse_headers(&args.headers)?;
    let transfer = Transfer::new(config.transfer.clone())?;
    let body = transfer.fetch_to_memory(&args.url, &headers).await?;
    println!("{}", String::from_utf8_lossy(&body));
    Ok(())
}

fn print_progress(progress: &Progress) {
    if progress.total > 0 {
        println!(
            "{:>5.1}%  {} / {}  {}/s  eta {}",
            progress.percent,
            format_bytes(progress.downloaded),
            format_bytes(progress.total),
            format_bytes(progress.speed as u64),
            format_duration(progress.eta)
        );
    } else {
        println!(
            "{}  {}/s",
            format_bytes(progress.downloaded),
            format_bytes(progress.speed as u64)
        );
    }
}

fn parse_headers(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|line| {
            let (name, value) = line
                .split_once(':')
                .with_context(|| format!("header {line:?} is not \"Name: value\""))?;
            Ok((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

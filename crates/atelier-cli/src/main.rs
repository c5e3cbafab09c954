use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use atelier_contracts::ledger::{FileLedgerStore, QuotaLedger};
use atelier_contracts::requests::GenerationRequest;
use atelier_engine::{
    find_matches, EngineConfig, Fingerprint, StudioEngine, DEFAULT_SIMILARITY_THRESHOLD,
};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(
    name = "atelier",
    version,
    about = "Image generation workbench with daily quota and duplicate checks"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate images through the configured provider
    Generate(GenerateArgs),
    /// Show the quota ledger for a day
    Quota(QuotaArgs),
    /// Compare a local image against reference images
    Check(CheckArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value_t = 512)]
    width: u32,
    #[arg(long, default_value_t = 512)]
    height: u32,
    #[arg(long, default_value_t = 20)]
    steps: u32,
    #[arg(long, default_value_t = 1)]
    count: u64,
    #[arg(long = "reference")]
    references: Vec<String>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "daily_usage.json")]
    ledger: PathBuf,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    model: Option<String>,
}

#[derive(Debug, Parser)]
struct QuotaArgs {
    #[arg(long, default_value = "daily_usage.json")]
    ledger: PathBuf,
    #[arg(long)]
    date: Option<NaiveDate>,
}

#[derive(Debug, Parser)]
struct CheckArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long = "against", required = true)]
    against: Vec<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_SIMILARITY_THRESHOLD)]
    threshold: u32,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("atelier error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Quota(args) => run_quota(args),
        Command::Check(args) => run_check(args),
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let mut config = EngineConfig::from_env();
    if let Some(provider) = args.provider {
        config.provider = provider;
    }
    if let Some(model) = args.model {
        config.model = model;
    }

    let events_path = args
        .events
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let mut engine = StudioEngine::new(&args.out, events_path, &args.ledger, config)?;

    let mut request = GenerationRequest::new(args.prompt);
    request.width = args.width;
    request.height = args.height;
    request.steps = args.steps;
    request.count = args.count;
    request.reference_urls = args.references;

    match engine.generate(&request) {
        Ok(batch) => {
            println!("{}", serde_json::to_string_pretty(&batch)?);
            Ok(0)
        }
        Err(err) => {
            // The quota view stays visible even when the request fails.
            if let Some(quota) = err.quota() {
                eprintln!("quota: {}", serde_json::to_string(quota)?);
            }
            Err(err.into())
        }
    }
}

fn run_quota(args: QuotaArgs) -> Result<i32> {
    let config = EngineConfig::from_env();
    let ledger = QuotaLedger::new(
        Box::new(FileLedgerStore::new(&args.ledger)),
        config.daily_limit,
    );
    let date = args.date.unwrap_or_else(|| Local::now().date_naive());
    let snapshot = ledger.snapshot(date);
    if ledger.recovered() {
        eprintln!(
            "atelier warning: ledger {} was unreadable, treated as empty",
            args.ledger.display()
        );
    }
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(0)
}

fn run_check(args: CheckArgs) -> Result<i32> {
    let bytes = fs::read(&args.image)
        .with_context(|| format!("failed reading {}", args.image.display()))?;
    let generated = Fingerprint::from_bytes(&bytes)?;

    let mut references = Vec::new();
    let mut faults = Vec::new();
    for path in &args.against {
        let label = path.to_string_lossy().to_string();
        match fs::read(path)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| Fingerprint::from_bytes(&bytes))
        {
            Ok(fingerprint) => references.push((label, fingerprint)),
            Err(err) => faults.push(json!({
                "reference": label,
                "error": format!("{err:#}"),
            })),
        }
    }

    let matches = find_matches(generated, &references, args.threshold);
    let report = json!({
        "image": args.image.to_string_lossy().to_string(),
        "fingerprint": generated.to_hex(),
        "threshold": args.threshold,
        "matches": matches,
        "faults": faults,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(0)
}

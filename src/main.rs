//! Command line interface for the governance engine. Supports validating
//! event files, replaying recorded event logs into projections, and watching
//! relays live.

use std::{
    fs,
    path::Path,
    sync::Arc,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use agora::config::{Settings, SinceMode};
use agora::event::{now_ts, Event, Keys};
use agora::processor::{governance_filter, Engine, EventProcessor, Outcome, Source};
use agora::transport::{RelayPool, Transport};
use agora::validate::{validate, validate_batch};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "agora",
    author,
    version,
    about = "Community governance engine over Nostr relays",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Validate one or more JSON event files and print a compliance report.
    Validate {
        /// Paths to JSON event files.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Replay a newline-delimited JSON event log into fresh projections.
    Replay {
        /// Path to an NDJSON event log.
        file: String,
    },
    /// Connect to the configured relays and fold governance events live.
    Watch,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Validate { files } => validate_files(&files),
        Commands::Replay { file } => replay(&file),
        Commands::Watch => {
            ensure_env_file(&cli.env)?;
            let cfg = Settings::from_env(&cli.env)?;
            watch(cfg).await
        }
    }
}

/// Validate each file, print per-event results and the batch summary.
/// Fails if any event is invalid.
fn validate_files(files: &[String]) -> anyhow::Result<()> {
    let mut events = Vec::new();
    for f in files {
        let data = fs::read_to_string(f).with_context(|| format!("reading {f}"))?;
        let ev: Event = serde_json::from_str(&data).with_context(|| format!("parsing {f}"))?;
        let v = validate(&ev);
        if v.valid {
            println!("{f}: ok ({})", v.event_type);
        } else {
            println!("{f}: INVALID ({}): {}", v.event_type, v.errors.join("; "));
        }
        for w in &v.warnings {
            println!("{f}: warning: {w}");
        }
        events.push(ev);
    }
    let report = validate_batch(&events);
    println!(
        "{}/{} valid, compliance {:.1}%",
        report.valid,
        report.total,
        report.compliance_rate() * 100.0
    );
    if report.valid != report.total {
        bail!("{} invalid event(s)", report.total - report.valid);
    }
    Ok(())
}

/// Fold a recorded NDJSON event log and print what the projections hold.
fn replay(file: &str) -> anyhow::Result<()> {
    let data = fs::read_to_string(file).with_context(|| format!("reading {file}"))?;
    let processor = EventProcessor::new();
    let (mut applied, mut stale, mut buffered, mut ignored, mut rejected) = (0u64, 0, 0, 0, 0);
    for line in data.lines().filter(|l| !l.trim().is_empty()) {
        let ev: Event = serde_json::from_str(line).context("parsing event line")?;
        match processor.apply(&ev, Source::Confirmed) {
            Outcome::Applied | Outcome::KickResolved(_) => applied += 1,
            Outcome::Stale => stale += 1,
            Outcome::Buffered => buffered += 1,
            Outcome::Ignored => ignored += 1,
            Outcome::Rejected(_) => rejected += 1,
        }
    }
    println!(
        "applied {applied}, stale {stale}, buffered {buffered}, ignored {ignored}, rejected {rejected}"
    );
    for community in processor.communities.all() {
        println!(
            "community {} ({} members, {} moderators)",
            community.name,
            community.members.len(),
            community.moderators.len()
        );
    }
    Ok(())
}

/// Subscribe to the configured relays and fold events until interrupted.
async fn watch(cfg: Settings) -> anyhow::Result<()> {
    let Some(secret) = cfg.secret_key.as_deref() else {
        bail!("SECRET_KEY is required for watch");
    };
    let keys = Keys::from_secret_hex(secret)?;
    let pool = RelayPool::connect(&cfg.relays, keys.clone(), cfg.tor_socks.as_deref()).await?;
    let transport = Arc::new(pool);
    let processor = Arc::new(EventProcessor::new());
    let engine = Engine::new(processor, transport.clone(), keys);

    let mut filter = governance_filter();
    filter.since = Some(match cfg.since_mode {
        SinceMode::Live => now_ts(),
        SinceMode::Fixed(ts) => ts,
    });
    if let Some(ids) = &cfg.filter_communities {
        filter.a = Some(ids.iter().map(|id| format!("34550:{id}")).collect());
    }
    let (_sub, rx) = transport.subscribe(filter).await?;
    engine.run(rx).await;
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut content = String::new();
    content.push_str("RELAYS=wss://relay.damus.io\n");
    content.push_str("SECRET_KEY=\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("FILTER_COMMUNITIES=\n");
    content.push_str("SINCE_MODE=live\n");
    fs::write(env_path, content)?;
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let cli = Cli::parse();
    run(cli).await
}

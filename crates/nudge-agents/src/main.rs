use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use coordination::config::CompanyDirectory;
use nudge_agents::config::check_endpoint;
use nudge_agents::dispatcher::{
    AlertChannel, Dispatcher, LogAlertChannel, LogDeliveryChannel, WebhookAlertChannel,
};
use nudge_agents::feed::EventFeed;
use nudge_agents::{
    CapabilitySet, DirectoryStore, EngineOptions, EngineParts, EngineSettings, JsonlAuditSink,
    NudgeEngine,
};

#[derive(Parser)]
#[command(name = "nudge-agents")]
#[command(about = "Onboarding nudge engine worker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume an event feed and run nudge cycles
    Run {
        /// JSON-lines event file, or `-` for stdin
        #[arg(long, default_value = "-")]
        events: String,
        /// Company directory (TOML)
        #[arg(long)]
        directory: Option<PathBuf>,
        /// Use event timestamps as the clock instead of wall time
        #[arg(long)]
        replay: bool,
        /// Print engine events as JSON lines on stdout
        #[arg(long)]
        watch: bool,
        /// Overrides NUDGE_AUDIT_LOG
        #[arg(long)]
        audit_log: Option<PathBuf>,
    },
    /// Validate a company directory file
    CheckConfig {
        #[arg(long)]
        directory: PathBuf,
        /// Also check that the LLM endpoint answers
        #[arg(long)]
        ping: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = EngineSettings::from_env();

    match cli.command {
        Commands::Run {
            events,
            directory,
            replay,
            watch,
            audit_log,
        } => {
            let directory = load_directory(directory.as_deref())?;
            let audit_log = audit_log.unwrap_or_else(|| settings.audit_log.clone());
            run(settings, directory, &events, replay, watch, audit_log).await
        }
        Commands::CheckConfig { directory, ping } => {
            check_config(&settings, &directory, ping).await
        }
    }
}

fn load_directory(path: Option<&Path>) -> Result<CompanyDirectory> {
    match path {
        Some(path) => CompanyDirectory::load(path)
            .with_context(|| format!("Failed to load company directory {}", path.display())),
        None => {
            warn!("No company directory given; using defaults and no baselines");
            Ok(CompanyDirectory::new())
        }
    }
}

async fn run(
    settings: EngineSettings,
    directory: CompanyDirectory,
    events: &str,
    replay: bool,
    watch: bool,
    audit_log: PathBuf,
) -> Result<()> {
    if !settings.has_llm_credentials() {
        warn!("No LLM API key set (NUDGE_LLM_API_KEY / OPENAI_API_KEY); capability calls will fail");
    }
    info!(
        llm = %settings.llm.url,
        model = %settings.llm.model,
        companies = directory.company_ids().len(),
        audit_log = %audit_log.display(),
        "Nudge engine starting"
    );

    let capabilities = CapabilitySet::from_settings(&settings)?;
    let alerts: Arc<dyn AlertChannel> = match &settings.alert_webhook_url {
        Some(url) => Arc::new(WebhookAlertChannel::new(url.clone())),
        None => Arc::new(LogAlertChannel),
    };
    let options = EngineOptions::from_settings(&settings, &directory);
    let idle_threshold = Duration::seconds(options.tracker.idle_threshold_secs);
    let store = Arc::new(DirectoryStore::new(directory));
    let parts = EngineParts::new(
        capabilities,
        store.clone(),
        store,
        Dispatcher::new(Arc::new(LogDeliveryChannel), alerts),
        Arc::new(JsonlAuditSink::new(audit_log)),
    );
    let engine = NudgeEngine::new(parts, options).context("Invalid tracker configuration")?;

    if watch {
        let mut rx = engine.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(e) => warn!("Failed to serialize engine event: {e}"),
                    },
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event watcher lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                cancel.cancel();
            }
        });
    }

    let mut feed = EventFeed::open(events).await?;
    let mut ticker = tokio::time::interval(settings.sweep_interval);
    let mut clock: Option<DateTime<Utc>> = None;
    let mut ingested = 0usize;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick(), if !replay => {
                engine.sweep(Utc::now());
            }
            next = feed.next_event() => match next? {
                Some(event) => {
                    if replay {
                        clock = Some(clock.map_or(event.timestamp, |c| c.max(event.timestamp)));
                        if let Some(now) = clock {
                            engine.sweep(now);
                        }
                    }
                    engine.ingest(event).await;
                    ingested += 1;
                }
                None => break,
            },
        }
    }

    if replay && !cancel.is_cancelled() {
        if let Some(last) = clock {
            engine.sweep(last + idle_threshold + Duration::seconds(1));
        }
    }

    engine.shutdown().await;
    info!(
        ingested,
        skipped = feed.skipped(),
        open_escalations = engine.open_escalations().len(),
        "Nudge engine stopped"
    );
    Ok(())
}

async fn check_config(settings: &EngineSettings, path: &Path, ping: bool) -> Result<()> {
    let directory = CompanyDirectory::load(path)
        .with_context(|| format!("Invalid company directory {}", path.display()))?;

    println!("Directory: {}", path.display());
    println!("  dashboard: {}", directory.dashboard_url);
    println!(
        "  tracker: idle {}s, session timeout {}s",
        directory.tracker.idle_threshold_secs, directory.tracker.session_timeout_secs
    );
    for company_id in directory.company_ids() {
        let company = directory.company(company_id);
        println!(
            "  company {}: escalate after {} nudges, confidence >= {:.2}, tone {}/{}",
            company_id,
            company.escalation_threshold,
            company.confidence_threshold,
            company.tone.voice,
            company.tone.formality
        );
        match directory.baseline(company_id) {
            Some(baseline) => println!("    baseline '{}': {}", baseline.name, baseline.summary()),
            None => println!("    no active baseline"),
        }
    }

    if ping {
        let key = Some(settings.llm.api_key.as_str());
        if check_endpoint(&settings.llm.url, key).await {
            println!("LLM endpoint {} is reachable", settings.llm.url);
        } else {
            anyhow::bail!("LLM endpoint {} did not answer /models", settings.llm.url);
        }
    }
    Ok(())
}

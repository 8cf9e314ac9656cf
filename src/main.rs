use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use trafficlens::config::{EngineConfig, LoggingConfig};
use trafficlens::detect::{AnomalyType, Category, TimeWindow};
use trafficlens::filters::{compile_filters, ActiveFilter, QueryContext};
use trafficlens::identity::generate_id;
use trafficlens::investigate::{
    ClickHouseExecutor, FacetInvestigator, InvestigationOptions, InvestigationOutcome,
    InvestigationRequest, InvestigationTarget, InvestigationTracker,
};
use trafficlens::report::{build_report, legacy_report, SeriesInput};

#[derive(Parser)]
#[command(
    name = "trafficlens",
    about = "Anomaly detection and investigation for CDN request logs",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $TRAFFICLENS_CONFIG, then /etc/trafficlens/trafficlens.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        /// Bind address (overrides [server] bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Detect anomalies in a JSON series file
    Detect {
        /// File with {start?, bucket_seconds?, green?, yellow?, red?}
        #[arg(long)]
        input: PathBuf,

        /// Use the single-result error/success detector
        #[arg(long)]
        legacy: bool,

        /// Maximum anomalies to report
        #[arg(long)]
        max: Option<usize>,

        /// Time scope label used in anomaly ids
        #[arg(long, default_value = "")]
        time_filter: String,

        /// Active filter, `column=value` or `column!=value` (repeatable)
        #[arg(long = "filter")]
        filters: Vec<ActiveFilter>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Print the id for an anomaly window
    AnomalyId {
        #[arg(long, default_value = "")]
        time_filter: String,

        #[arg(long = "filter")]
        filters: Vec<ActiveFilter>,

        /// Window start (RFC 3339)
        #[arg(long)]
        start: DateTime<Utc>,

        /// Window end (RFC 3339)
        #[arg(long)]
        end: DateTime<Utc>,

        /// green, yellow or red
        #[arg(long)]
        category: String,
    },

    /// Explain a window by breaking traffic down per facet
    Investigate {
        /// Analysis range start (RFC 3339)
        #[arg(long)]
        from: DateTime<Utc>,

        /// Analysis range end (RFC 3339)
        #[arg(long)]
        to: DateTime<Utc>,

        /// Window start (RFC 3339)
        #[arg(long)]
        window_start: DateTime<Utc>,

        /// Window end (RFC 3339)
        #[arg(long)]
        window_end: DateTime<Utc>,

        /// Anomaly category; omit to investigate a plain selection
        #[arg(long)]
        category: Option<Category>,

        /// The anomaly is a drop rather than a spike
        #[arg(long)]
        dip: bool,

        /// Time scope label (cache scope and anomaly id)
        #[arg(long, default_value = "")]
        time_filter: String,

        /// SQL condition restricting hosts
        #[arg(long, default_value = "")]
        host_filter: String,

        #[arg(long = "filter")]
        filters: Vec<ActiveFilter>,

        /// Ignore cached results
        #[arg(long)]
        refresh: bool,

        #[arg(long)]
        json: bool,
    },

    /// Inspect or clear cached investigations
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List cached entries, newest first
    List {
        #[arg(long)]
        json: bool,
    },

    /// Remove every cached entry
    Clear,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = EngineConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "starting trafficlens");
            trafficlens::serve(config).await?;
        }
        Commands::Detect {
            input,
            legacy,
            max,
            time_filter,
            filters,
            json,
        } => {
            let doc = SeriesInput::load(&input)?;
            let options = config.detection.options();

            if legacy {
                let best = legacy_report(&doc, &options)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&best)?);
                } else if let Some(a) = best {
                    println!(
                        "{} {} at buckets {}-{} (magnitude {:+.1}%, score {:.2})",
                        a.category.as_str(),
                        a.kind,
                        a.start_index,
                        a.end_index,
                        a.magnitude * 100.0,
                        a.score
                    );
                } else {
                    println!("No anomaly detected.");
                }
                return Ok(());
            }

            let max_count = max.unwrap_or(config.detection.max_count);
            let compiled = compile_filters(&filters);
            let report = build_report(&doc, &time_filter, &compiled.map, max_count, &options)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.anomalies.is_empty() {
                println!("No anomalies in {} buckets.", report.buckets);
            } else {
                println!(
                    "{:<4} | {:<6} | {:<5} | {:<9} | {:>10} | {:>8} | Id",
                    "Rank", "Cat", "Type", "Buckets", "Magnitude", "Score"
                );
                println!("{:-<4}-|-{:-<6}-|-{:-<5}-|-{:-<9}-|-{:->10}-|-{:->8}-|-{:-<30}", "", "", "", "", "", "", "");
                for r in &report.anomalies {
                    let a = &r.anomaly;
                    println!(
                        "{:<4} | {:<6} | {:<5} | {:<9} | {:>9.1}% | {:>8.2} | {}",
                        a.rank,
                        a.category.as_str(),
                        a.kind.to_string(),
                        format!("{}-{}", a.start_index, a.end_index),
                        a.magnitude * 100.0,
                        a.score,
                        r.id.as_ref().map(|id| id.as_str()).unwrap_or("-")
                    );
                }
            }
        }
        Commands::AnomalyId {
            time_filter,
            filters,
            start,
            end,
            category,
        } => {
            let compiled = compile_filters(&filters);
            let id = generate_id(&time_filter, &compiled.map.canonical(), start, end, &category);
            println!("{}", id);
        }
        Commands::Investigate {
            from,
            to,
            window_start,
            window_end,
            category,
            dip,
            time_filter,
            host_filter,
            filters,
            refresh,
            json,
        } => {
            anyhow::ensure!(from < to, "--from must precede --to");
            anyhow::ensure!(
                window_start >= from && window_end <= to && window_start < window_end,
                "window must lie inside the analysis range"
            );

            let window = TimeWindow::new(window_start, window_end);
            let compiled = compile_filters(&filters);
            let target = match category {
                Some(category) => {
                    let kind = if dip { AnomalyType::Dip } else { AnomalyType::Spike };
                    InvestigationTarget::Anomaly { window, category, kind }
                }
                None => InvestigationTarget::Selection { window },
            };

            let request = InvestigationRequest {
                context: QueryContext::new(time_filter, host_filter, compiled.map),
                filters_sql: compiled.sql,
                range: TimeWindow::new(from, to),
                target,
            };

            let executor = ClickHouseExecutor::new(&config.clickhouse)
                .context("failed to build ClickHouse client")?;
            let investigator = FacetInvestigator::new(Arc::new(executor), config.investigation.clone());
            let cache = trafficlens::open_cache(&config)?;
            let tracker = InvestigationTracker::new();

            let interrupt = tracker.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    interrupt.supersede();
                }
            });

            let ticket = tracker.begin();
            let outcome = investigator
                .investigate_cached(&request, InvestigationOptions { force_refresh: refresh }, &cache, &ticket)
                .await;

            match outcome {
                InvestigationOutcome::Superseded => {
                    eprintln!("Investigation interrupted.");
                }
                InvestigationOutcome::Completed(result) if json => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                }
                InvestigationOutcome::Completed(result) => {
                    if let Some(id) = &result.anomaly_id {
                        println!("Anomaly {}{}", id, if result.from_cache { " (cached)" } else { "" });
                    }
                    if result.top_contributors.is_empty() {
                        println!("No significant contributors.");
                    }
                    for f in &result.top_contributors {
                        println!(
                            "{:<12} {:<40} share {:>5.1}% -> {:>5.1}% ({:+.1} pts), significance {:.1}",
                            f.facet, f.dim, f.baseline_share, f.window_share, f.share_change, f.significance
                        );
                    }
                }
            }
        }
        Commands::Cache { action } => {
            let cache = trafficlens::open_cache(&config)?;
            match action {
                CacheAction::List { json } => {
                    let entries = cache.entries();
                    if json {
                        println!("{}", serde_json::to_string_pretty(&entries)?);
                    } else if entries.is_empty() {
                        println!("Cache is empty.");
                    } else {
                        for e in &entries {
                            println!(
                                "{}  {}  v{}  {} anomalies",
                                e.key,
                                e.timestamp.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string()),
                                e.version.map(|v| v.to_string()).unwrap_or_else(|| "?".to_string()),
                                e.anomalies
                            );
                        }
                    }
                }
                CacheAction::Clear => {
                    let removed = cache.clear();
                    println!("Removed {} cached investigations.", removed);
                }
            }
        }
    }

    Ok(())
}

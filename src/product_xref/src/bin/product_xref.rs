use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use name_source::http::HttpNameSource;
use product_xref::{
    alerts::{AlertLog, TracingAlertHandler},
    cancel::CancelToken,
    config::{XrefConfig, load_config_path, load_config_str},
    db::Store,
    ledger::{Ledger, SourceItem, SourceKind},
    mapping::MappingStore,
    quality::QualityMonitor,
    resolver::NameResolver,
    sync_errors::{ResolvedFilter, SyncErrorLog},
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Product cross-reference CLI")]
struct Cli {
    /// TOML config file; defaults apply when omitted.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<String>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Apply pending schema migrations.
    Migrate,
    Ledger(LedgerCmd),
    Mappings(MappingsCmd),
    Names(NamesCmd),
    Cache(CacheCmd),
    Errors(ErrorsCmd),
    Alerts(AlertsCmd),
    Quality(QualityCmd),
}

#[derive(Args)]
struct LedgerCmd {
    #[command(subcommand)]
    sub: LedgerSub,
}

#[derive(Subcommand)]
enum LedgerSub {
    Stats,
    /// Find the record holding an identifier in any column.
    Lookup { product_id: String },
    /// Register identifiers from a JSON array of `{identifier, name?, brand?}`.
    Register {
        #[arg(long)]
        source: SourceKind,
        #[arg(long, value_name = "FILE")]
        file: String,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Args)]
struct MappingsCmd {
    #[command(subcommand)]
    sub: MappingsSub,
}

#[derive(Subcommand)]
enum MappingsSub {
    Stats {
        #[arg(long)]
        by_source: bool,
    },
    /// Auto-approve pending mappings at or above the threshold.
    Approve {
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long)]
        approver: String,
    },
    /// Duplicate groups and orphaned mappings.
    Findings,
}

#[derive(Args)]
struct NamesCmd {
    #[command(subcommand)]
    sub: NamesSub,
}

#[derive(Subcommand)]
enum NamesSub {
    Resolve {
        product_id: String,
        #[arg(long, default_value = "marketplace")]
        source: SourceKind,
    },
}

#[derive(Args)]
struct CacheCmd {
    #[command(subcommand)]
    sub: CacheSub,
}

#[derive(Subcommand)]
enum CacheSub {
    /// Demote cached names older than the given age to pending.
    ClearStale {
        #[arg(long)]
        max_age_hours: Option<u32>,
    },
}

#[derive(Args)]
struct ErrorsCmd {
    #[command(subcommand)]
    sub: ErrorsSub,
}

#[derive(Subcommand)]
enum ErrorsSub {
    List {
        #[arg(long)]
        unresolved: bool,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    Resolve {
        #[arg(long)]
        id: i32,
        #[arg(long)]
        by: String,
    },
}

#[derive(Args)]
struct AlertsCmd {
    #[command(subcommand)]
    sub: AlertsSub,
}

#[derive(Subcommand)]
enum AlertsSub {
    List {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[derive(Args)]
struct QualityCmd {
    #[command(subcommand)]
    sub: QualitySub,
}

#[derive(Subcommand)]
enum QualitySub {
    /// One scan; prints the report.
    Scan,
    /// Scan on a schedule until interrupted.
    Watch {
        #[arg(long, default_value_t = 300)]
        interval_secs: u64,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(path: Option<&str>) -> Result<XrefConfig> {
    let cfg = match path {
        Some(p) => load_config_path(p)?,
        None => load_config_str("")?,
    };
    Ok(cfg)
}

fn build_resolver(cfg: &XrefConfig, store: Store, cancel: CancelToken) -> Result<NameResolver> {
    let mut resolver = NameResolver::new(store)
        .with_retry(cfg.retry_policy())
        .with_fetch_timeout(cfg.fetch_timeout())
        .with_cancel(cancel);
    for &kind in SourceKind::ALL {
        if let Some(http) = cfg.http_source(kind) {
            let source = HttpNameSource::new(&http)
                .with_context(|| format!("name source for {kind}"))?;
            resolver = resolver.with_source(kind, Arc::new(source));
        }
    }
    Ok(resolver)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;
    let store = Store::open(&cfg.database.url)
        .with_context(|| format!("open database {}", cfg.database.url))?;

    let (handle, cancel) = CancelToken::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping");
            handle.cancel();
        }
    });

    match cli.cmd {
        Cmd::Migrate => info!(url = store.url(), "database is up to date"),

        Cmd::Ledger(LedgerCmd { sub }) => {
            let mut conn = store.connect()?;
            match sub {
                LedgerSub::Stats => print_json(&Ledger::statistics(&mut conn)?)?,
                LedgerSub::Lookup { product_id } => {
                    print_json(&Ledger::find_by_any(&mut conn, &product_id)?)?
                }
                LedgerSub::Register {
                    source,
                    file,
                    limit,
                } => {
                    let raw = std::fs::read_to_string(&file)
                        .with_context(|| format!("read {file}"))?;
                    let items: Vec<SourceItem> =
                        serde_json::from_str(&raw).with_context(|| format!("parse {file}"))?;
                    let report =
                        Ledger::bulk_register_from_source(&mut conn, source, &items, limit, &cancel)?;
                    print_json(&report)?;
                }
            }
        }

        Cmd::Mappings(MappingsCmd { sub }) => {
            let mut conn = store.connect()?;
            match sub {
                MappingsSub::Stats { by_source: false } => {
                    print_json(&MappingStore::statistics(&mut conn)?)?
                }
                MappingsSub::Stats { by_source: true } => {
                    print_json(&MappingStore::statistics_by_source(&mut conn)?)?
                }
                MappingsSub::Approve {
                    threshold,
                    approver,
                } => {
                    let threshold = threshold.unwrap_or(cfg.mapping.auto_approve_threshold);
                    let report = MappingStore::bulk_approve_by_confidence(
                        &mut conn, threshold, &approver, &cancel,
                    )?;
                    print_json(&report)?;
                }
                MappingsSub::Findings => {
                    let duplicates = MappingStore::find_duplicates(&mut conn)?;
                    let orphaned = MappingStore::find_orphaned(&mut conn)?;
                    print_json(&serde_json::json!({
                        "duplicates": duplicates,
                        "orphaned": orphaned,
                    }))?;
                }
            }
        }

        Cmd::Names(NamesCmd {
            sub: NamesSub::Resolve { product_id, source },
        }) => {
            let resolver = build_resolver(&cfg, store, cancel)?;
            print_json(&resolver.resolve(&product_id, source).await)?;
        }

        Cmd::Cache(CacheCmd {
            sub: CacheSub::ClearStale { max_age_hours },
        }) => {
            let max_age = max_age_hours
                .map(|h| chrono::Duration::hours(i64::from(h)))
                .unwrap_or_else(|| cfg.stale_after());
            let resolver = build_resolver(&cfg, store, cancel)?;
            let demoted = resolver.clear_stale_cache(max_age).await?;
            print_json(&serde_json::json!({ "demoted": demoted }))?;
        }

        Cmd::Errors(ErrorsCmd { sub }) => {
            let mut conn = store.connect()?;
            match sub {
                ErrorsSub::List { unresolved, limit } => {
                    let filter = if unresolved {
                        ResolvedFilter::Unresolved
                    } else {
                        ResolvedFilter::All
                    };
                    print_json(&SyncErrorLog::list_recent(&mut conn, limit, filter)?)?;
                }
                ErrorsSub::Resolve { id, by } => {
                    let resolved = SyncErrorLog::mark_resolved(&mut conn, id, &by)?;
                    print_json(&serde_json::json!({ "id": id, "resolved": resolved }))?;
                }
            }
        }

        Cmd::Alerts(AlertsCmd {
            sub: AlertsSub::List { limit },
        }) => {
            let mut conn = store.connect()?;
            print_json(&AlertLog::list_recent(&mut conn, limit)?)?;
        }

        Cmd::Quality(QualityCmd { sub }) => {
            let monitor = QualityMonitor::new(cfg.quality.clone()).with_handler(TracingAlertHandler);
            match sub {
                QualitySub::Scan => {
                    let mut conn = store.connect()?;
                    print_json(&monitor.scan(&mut conn, Utc::now(), &cancel)?)?;
                }
                QualitySub::Watch { interval_secs } => {
                    let runs = Arc::new(monitor)
                        .run_periodic(store, Duration::from_secs(interval_secs.max(1)), cancel)
                        .await;
                    print_json(&serde_json::json!({ "scans": runs }))?;
                }
            }
        }
    }

    Ok(())
}

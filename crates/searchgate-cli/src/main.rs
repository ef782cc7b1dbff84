//! Searchgate CLI - indexing worker, queue maintenance and secured search

use clap::{Parser, Subcommand};
use searchgate_core::Error;
use searchgate_core::application::Searchgate;
use searchgate_core::config::{BACKEND_PASSWORD_ENV, Config};
use searchgate_core::domain::locking::QUEUE_DRAIN_LEASE;
use searchgate_core::domain::queue::RunControl;
use searchgate_core::domain::scheduler::TickOutcome;
use searchgate_core::domain::search::{SearchContext, SearchResult};
use searchgate_core::domain::security::Principal;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "searchgate")]
#[command(author, version, about = "Durable indexing queue and row-level secured search", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the indexing scheduler until interrupted
    Worker {
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },

    /// Inspect and maintain the indexing queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Search indexed entities
    Search {
        /// Query text
        text: String,
        /// Restrict to entity types (repeatable)
        #[arg(short = 't', long = "type")]
        entity_types: Vec<String>,
        /// Entries per page (defaults to search.page_size)
        #[arg(long)]
        page_size: Option<u32>,
        /// Raw hit offset to start from
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Strategy name (defaults to search.default_strategy)
        #[arg(long)]
        strategy: Option<String>,
        /// Number of pages to fetch
        #[arg(long, default_value_t = 1)]
        pages: u32,
        /// Search as this user instead of the system principal
        #[arg(long = "as")]
        as_user: Option<String>,
        /// Roles of the --as user (repeatable)
        #[arg(long = "role", requires = "as_user")]
        roles: Vec<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run health check
    Doctor,
}

#[derive(Subcommand)]
enum QueueAction {
    /// Show queue depth per entity type and the drain lease
    Status,
    /// Show the oldest queued items
    Peek {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Drain the queue once
    Drain {
        #[arg(long)]
        batch_size: Option<u32>,
        #[arg(long)]
        max: Option<u32>,
    },
    /// Remove every queued item of an entity type
    Empty { entity_type: String },
    /// Queue every existing instance of an entity type
    Reindex {
        entity_type: String,
        #[arg(long)]
        batch_size: Option<u32>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("searchgate=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Worker { once } => cmd_worker(once, cli.format, cli.quiet).await,
        Commands::Queue { action } => cmd_queue(action, cli.format, cli.quiet).await,
        Commands::Search {
            text,
            entity_types,
            page_size,
            offset,
            strategy,
            pages,
            as_user,
            roles,
        } => {
            let request = SearchArgs {
                text,
                entity_types,
                page_size,
                offset,
                strategy,
                pages,
                principal: principal_for(as_user, roles),
            };
            cmd_search(request, cli.format, cli.quiet).await
        }
        Commands::Config { action } => cmd_config(action, cli.format, cli.quiet),
        Commands::Doctor => cmd_doctor(cli.format, cli.quiet).await,
    };

    if let Err(e) = &result
        && let Some(err) = e.downcast_ref::<Error>()
    {
        eprintln!("Error [{}]: {}", err.code(), err);
        if let Some(hint) = err.suggestion() {
            eprintln!("Hint: {}", hint);
        }
        std::process::exit(1);
    }
    result
}

fn principal_for(user: Option<String>, roles: Vec<String>) -> Principal {
    match user {
        Some(user) => roles
            .into_iter()
            .fold(Principal::user(user), |p, role| p.with_role(role)),
        None => Principal::system(),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_app() -> anyhow::Result<Searchgate> {
    let config = Config::load()?;
    Ok(Searchgate::open(config).await?)
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_worker(once: bool, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let app = open_app().await?;
    let scheduler = app.scheduler();

    if once {
        let outcome = scheduler.tick().await;
        match format {
            OutputFormat::Json => print_json(&outcome)?,
            OutputFormat::Text if !quiet => match &outcome {
                TickOutcome::Processed(report) => println!(
                    "Processed {} item(s), {} failed, in {} batch(es)",
                    report.processed, report.failed, report.batches
                ),
                TickOutcome::Skipped => println!("Skipped: another worker is draining the queue"),
                TickOutcome::Failed(reason) => println!("Drain failed: {}", reason),
            },
            OutputFormat::Text => {}
        }
        app.close().await;
        return Ok(());
    }

    if !quiet {
        println!(
            "Worker started (interval {}s, batch size {}). Press Ctrl-C to stop.",
            scheduler.settings().interval.as_secs(),
            scheduler.settings().batch_size
        );
    }

    let cancel = CancellationToken::new();
    let handle = scheduler.spawn(cancel.clone());

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, stopping worker");
    cancel.cancel();
    handle.await?;

    app.close().await;
    if !quiet {
        println!("Worker stopped.");
    }
    Ok(())
}

#[derive(Serialize)]
struct QueueStatus {
    depth: i64,
    types: Vec<searchgate_core::domain::queue::QueueStats>,
    drain_lease: Option<searchgate_core::domain::locking::LeaseInfo>,
}

async fn cmd_queue(action: QueueAction, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let app = open_app().await?;
    let queue = app.queue();

    match action {
        QueueAction::Status => {
            let status = QueueStatus {
                depth: queue.depth(None).await?,
                types: queue.stats().await?,
                drain_lease: app
                    .leases()
                    .info(QUEUE_DRAIN_LEASE)
                    .await?
                    .filter(|lease| !lease.is_expired()),
            };
            match format {
                OutputFormat::Json => print_json(&status)?,
                OutputFormat::Text => {
                    println!("Queue depth: {}", status.depth);
                    for stats in &status.types {
                        println!(
                            "  {:<32} pending={} claimed={} retried={}",
                            stats.entity_type, stats.pending, stats.claimed, stats.retried
                        );
                    }
                    match &status.drain_lease {
                        Some(lease) => println!("Drain lease: {}", lease),
                        None => println!("Drain lease: available"),
                    }
                }
            }
        }

        QueueAction::Peek { limit } => {
            let items = queue.repository().peek(limit).await?;
            match format {
                OutputFormat::Json => print_json(&items)?,
                OutputFormat::Text => {
                    if items.is_empty() && !quiet {
                        println!("Queue is empty.");
                    }
                    for item in items {
                        println!(
                            "  {} {:<8} {}#{} attempts={} queued={}",
                            item.id,
                            item.change_kind,
                            item.entity_type,
                            item.entity_id,
                            item.attempts,
                            item.created_at.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
            }
        }

        QueueAction::Drain { batch_size, max } => {
            let settings = app.scheduler().settings();
            let batch_size = batch_size.unwrap_or(settings.batch_size);
            let max = max.unwrap_or(settings.max_processed_per_execution);

            let Some(lease) = app
                .leases()
                .try_acquire(QUEUE_DRAIN_LEASE, Some(settings.lease_ttl))
                .await?
            else {
                return Err(Error::LeaseHeld(QUEUE_DRAIN_LEASE.to_string()).into());
            };

            let control =
                RunControl::new().with_deadline(tokio::time::Instant::now() + settings.run_budget());
            let report = queue.process_queue_with(batch_size, max, &control).await;
            if let Err(e) = lease.release().await {
                warn!(error = %e, "Failed to release drain lease");
            }
            let report = report?;

            match format {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Text if !quiet => {
                    println!(
                        "Processed {} item(s), {} failed, in {} batch(es){}",
                        report.processed,
                        report.failed,
                        report.batches,
                        if report.stopped_early { " (stopped early)" } else { "" }
                    );
                }
                OutputFormat::Text => {}
            }
        }

        QueueAction::Empty { entity_type } => {
            let removed = queue.empty_queue(&entity_type).await?;
            match format {
                OutputFormat::Json => {
                    print_json(&serde_json::json!({ "entity_type": entity_type, "removed": removed }))?
                }
                OutputFormat::Text if !quiet => {
                    println!("Removed {} queued item(s) for '{}'.", removed, entity_type)
                }
                OutputFormat::Text => {}
            }
        }

        QueueAction::Reindex {
            entity_type,
            batch_size,
        } => {
            let batch_size = batch_size.unwrap_or(app.config().queue.batch_size);
            let queued = queue.enqueue_all(&entity_type, batch_size).await?;
            match format {
                OutputFormat::Json => {
                    print_json(&serde_json::json!({ "entity_type": entity_type, "queued": queued }))?
                }
                OutputFormat::Text if !quiet => {
                    println!("Queued {} instance(s) of '{}' for reindexing.", queued, entity_type)
                }
                OutputFormat::Text => {}
            }
        }
    }

    app.close().await;
    Ok(())
}

struct SearchArgs {
    text: String,
    entity_types: Vec<String>,
    page_size: Option<u32>,
    offset: u64,
    strategy: Option<String>,
    pages: u32,
    principal: Principal,
}

async fn cmd_search(args: SearchArgs, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let app = open_app().await?;
    let searcher = app.searcher();

    let context = SearchContext::new(args.text, args.principal)
        .with_entity_types(args.entity_types)
        .with_page_size(args.page_size.unwrap_or(app.config().search.page_size))
        .with_offset(args.offset);

    let mut results: Vec<SearchResult> = Vec::new();
    let mut page = match &args.strategy {
        Some(name) => searcher.search_with_strategy(context, name).await?,
        None => searcher.search(context).await?,
    };
    for _ in 1..args.pages.max(1) {
        if !page.more_data_available {
            break;
        }
        let next = searcher.search_next_page(&page).await?;
        results.push(page);
        page = next;
    }
    results.push(page);

    match format {
        OutputFormat::Json => print_json(&results)?,
        OutputFormat::Text => {
            for (number, result) in results.iter().enumerate() {
                print_page(number + 1, result, quiet);
            }
        }
    }

    app.close().await;
    Ok(())
}

fn print_page(number: usize, result: &SearchResult, quiet: bool) {
    if !quiet {
        println!(
            "Page {} ({} of {} raw hits examined, strategy {}, {} round(s))",
            number,
            result.effective_offset,
            result.total_hits,
            result.strategy_name,
            result.rounds
        );
    }
    if result.entries.is_empty() && !quiet {
        println!("  No matching entities.");
    }
    for entry in &result.entries {
        println!("  [{}] {} ({})", entry.entity_type, entry.display_name, entry.id);
        if quiet {
            continue;
        }
        for highlight in &entry.highlights {
            println!("      {}: {}", highlight.field, highlight.fragments.join(" ... "));
        }
    }
    if result.more_data_available && !quiet {
        println!("  More results available (next offset {})", result.effective_offset);
    }
}

fn cmd_config(action: ConfigAction, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.validate()?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            match format {
                OutputFormat::Json => {
                    let map: serde_json::Map<String, serde_json::Value> = items
                        .into_iter()
                        .map(|(key, value)| (key, serde_json::Value::String(value)))
                        .collect();
                    print_json(&map)?;
                }
                OutputFormat::Text => {
                    for (key, value) in items {
                        println!("{} = {}", key, value);
                    }
                }
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct Check {
    name: &'static str,
    ok: bool,
    detail: String,
}

impl Check {
    fn new(name: &'static str, ok: bool, detail: impl Into<String>) -> Self {
        Self {
            name,
            ok,
            detail: detail.into(),
        }
    }
}

async fn cmd_doctor(format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let mut checks = Vec::new();

    let config = match Config::load().and_then(|config| config.validate().map(|_| config)) {
        Ok(config) => {
            checks.push(Check::new("configuration", true, "valid"));
            Some(config)
        }
        Err(e) => {
            checks.push(Check::new("configuration", false, format!("{:#}", e)));
            None
        }
    };

    if let Some(config) = config {
        match (&config.search.username, std::env::var(BACKEND_PASSWORD_ENV)) {
            (None, _) => checks.push(Check::new("credentials", true, "anonymous")),
            (Some(user), Ok(_)) => checks.push(Check::new("credentials", true, user.clone())),
            (Some(user), Err(_)) => checks.push(Check::new(
                "credentials",
                false,
                format!("{} is set but {} is not", user, BACKEND_PASSWORD_ENV),
            )),
        }

        checks.push(Check::new(
            "sources",
            !config.sources.is_empty(),
            format!("{} entity type(s) configured", config.sources.len()),
        ));

        match Searchgate::open(config).await {
            Ok(app) => {
                doctor_database(&app, &mut checks).await;
                doctor_backend(&app, &mut checks).await;
                app.close().await;
            }
            Err(e) => checks.push(Check::new("database", false, e.to_string())),
        }
    }

    let all_ok = checks.iter().all(|c| c.ok);
    match format {
        OutputFormat::Json => {
            print_json(&serde_json::json!({ "ok": all_ok, "checks": checks }))?;
        }
        OutputFormat::Text if !quiet => {
            println!("Searchgate Health Check");
            println!("=======================");
            println!();
            for check in &checks {
                let marker = if check.ok { "[OK]" } else { "[!!]" };
                println!("{} {}: {}", marker, check.name, check.detail);
            }
            println!();
            if all_ok {
                println!("All checks passed!");
            } else {
                println!("Some checks failed. See above for details.");
            }
        }
        OutputFormat::Text => {}
    }

    Ok(())
}

async fn doctor_database(app: &Searchgate, checks: &mut Vec<Check>) {
    let db = app.database();
    match db.health_check().await {
        Ok(()) => checks.push(Check::new(
            "database",
            true,
            db.path().display().to_string(),
        )),
        Err(e) => {
            checks.push(Check::new("database", false, format!("{:#}", e)));
            return;
        }
    }

    match db.migration_status().await {
        Ok(status) if status.needs_migration => checks.push(Check::new(
            "schema",
            false,
            format!(
                "migrations pending (v{} -> v{})",
                status.current_version, status.target_version
            ),
        )),
        Ok(status) => checks.push(Check::new(
            "schema",
            true,
            format!("v{}", status.current_version),
        )),
        Err(e) => checks.push(Check::new("schema", false, format!("{:#}", e))),
    }

    match app.queue().depth(None).await {
        Ok(depth) => checks.push(Check::new("queue", true, format!("{} item(s) queued", depth))),
        Err(e) => checks.push(Check::new("queue", false, e.to_string())),
    }
}

async fn doctor_backend(app: &Searchgate, checks: &mut Vec<Check>) {
    let backend = app.backend();
    let probe = tokio::time::timeout(Duration::from_secs(10), backend.health()).await;
    match probe {
        Ok(Ok(health)) if health.matches_kind() => checks.push(Check::new(
            "backend",
            true,
            format!(
                "{} {} (cluster {})",
                health.kind,
                health.version.as_deref().unwrap_or("unknown"),
                health.cluster_name.as_deref().unwrap_or("unknown")
            ),
        )),
        Ok(Ok(health)) => checks.push(Check::new(
            "backend",
            false,
            format!(
                "configured for {} but server reports {}",
                health.kind,
                health.distribution.as_deref().unwrap_or("elasticsearch")
            ),
        )),
        Ok(Err(e)) => checks.push(Check::new("backend", false, e.to_string())),
        Err(_) => checks.push(Check::new("backend", false, "health probe timed out")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_search_args() {
        let cli = Cli::try_parse_from([
            "searchgate", "search", "acme corp", "-t", "sales_Order", "-t", "sales_Customer",
            "--as", "alice", "--role", "sales", "--pages", "2", "--format", "json",
        ])
        .unwrap();

        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Commands::Search {
                text,
                entity_types,
                pages,
                as_user,
                roles,
                ..
            } => {
                assert_eq!(text, "acme corp");
                assert_eq!(entity_types, vec!["sales_Order", "sales_Customer"]);
                assert_eq!(pages, 2);
                let principal = principal_for(as_user, roles);
                assert_eq!(principal.name(), "alice");
                assert!(principal.has_role("sales"));
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn test_role_requires_user() {
        assert!(Cli::try_parse_from(["searchgate", "search", "x", "--role", "admin"]).is_err());
    }

    #[test]
    fn test_default_principal_is_system() {
        assert!(principal_for(None, Vec::new()).is_system());
    }
}

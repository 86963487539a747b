//! CLI command definitions, routing, and tracing setup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use assetcat_core::worker;
use assetcat_core::{
    ChangesetController, EventSink, Isolator, ProgressEvent, RunOptions, RuntimeContext,
    TerminalEvent, UnitRegistry,
};
use assetcat_shared::{
    Actor, ActorId, AppConfig, AssetId, ChangesetId, RunConfig, expand_home, init_config,
    load_config, load_config_from,
};
use assetcat_storage::{FactStore, Storage};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// assetcat: catalog assets and everything learned about them.
#[derive(Parser)]
#[command(
    name = "assetcat",
    version,
    about = "Scan sources, derive attributes, and keep the full history of every asset.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.assetcat/assetcat.toml).
    #[arg(long, global = true, env = "ASSETCAT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a changeset over every configured actor.
    Scan {
        /// Description stored with the changeset.
        #[arg(short, long, default_value = "scan")]
        message: String,

        /// Run every unit even when its inputs are unchanged.
        #[arg(long)]
        force: bool,

        /// In-flight assets (overrides the config file).
        #[arg(long)]
        concurrency: Option<u32>,
    },

    /// Show status and counters of a changeset.
    Status {
        /// Changeset id.
        id: i64,
    },

    /// List recent changesets.
    Changesets {
        /// Maximum number of changesets to show.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show the current view of an asset.
    Show {
        /// Asset id.
        asset: String,

        /// Print the view as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the full fact history of an asset.
    History {
        /// Asset id.
        asset: String,
    },

    /// Register configured actors and list them.
    Actors,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Serve unit executions over stdin/stdout.
    #[command(hide = true)]
    Worker,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr so worker
/// stdout carries protocol frames only.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "assetcat=info",
        1 => "assetcat=debug",
        _ => "assetcat=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Scan {
            message,
            force,
            concurrency,
        } => cmd_scan(config_path, &message, force, concurrency).await,
        Command::Status { id } => cmd_status(config_path, ChangesetId(id)).await,
        Command::Changesets { limit } => cmd_changesets(config_path, limit).await,
        Command::Show { asset, json } => cmd_show(config_path, &asset, json).await,
        Command::History { asset } => cmd_history(config_path, &asset).await,
        Command::Actors => cmd_actors(config_path).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
        Command::Worker => cmd_worker().await,
    }
}

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

fn load(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

fn database_path(config: &AppConfig) -> Result<PathBuf> {
    Ok(expand_home(&config.defaults.database_path)?)
}

async fn open_store(config: &AppConfig) -> Result<Storage> {
    let path = database_path(config)?;
    Ok(Storage::open(&path).await?)
}

async fn open_store_readonly(config: &AppConfig) -> Result<Storage> {
    let path = database_path(config)?;
    if !path.exists() {
        return Err(eyre!(
            "no catalog at '{}'; run `assetcat scan` first",
            path.display()
        ));
    }
    Ok(Storage::open_readonly(&path).await?)
}

/// Register every configured actor; ids are stable across runs.
async fn register_actors(store: &dyn FactStore, config: &AppConfig) -> Result<Vec<Actor>> {
    let mut actors = Vec::with_capacity(config.actors.len());
    for actor in &config.actors {
        actors.push(store.register_actor(&actor.to_spec()?).await?);
    }
    Ok(actors)
}

/// Controller for inspection commands; it never runs units.
fn inspector(store: Storage, config: &AppConfig) -> ChangesetController {
    let run = RunConfig::from(config);
    ChangesetController::new(
        Arc::new(store),
        RuntimeContext::new(UnitRegistry::with_builtins()),
        Arc::new(Isolator::in_process(run.unit_timeout)),
        run,
    )
}

fn parse_asset_id(raw: &str) -> Result<AssetId> {
    raw.parse::<AssetId>()
        .map_err(|e| eyre!("invalid asset id '{raw}': {e}"))
}

async fn actor_names(store: &dyn FactStore) -> Result<HashMap<ActorId, String>> {
    Ok(store
        .list_actors()
        .await?
        .into_iter()
        .map(|a| (a.id, a.name))
        .collect())
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_scan(
    config_path: Option<&Path>,
    message: &str,
    force: bool,
    concurrency: Option<u32>,
) -> Result<()> {
    let config = load(config_path)?;
    let mut run = RunConfig::from(&config);
    if let Some(concurrency) = concurrency {
        run.concurrency = concurrency.max(1) as usize;
    }
    let cancel_timeout = run.cancel_timeout;

    let store = open_store(&config).await?;
    let actors = register_actors(&store, &config).await?;
    if actors.is_empty() {
        return Err(eyre!(
            "no actors configured; add [[actors]] entries to the config file"
        ));
    }

    let progress = Arc::new(CliProgress::new());
    let controller = Arc::new(
        ChangesetController::new(
            Arc::new(store),
            RuntimeContext::new(UnitRegistry::with_builtins()),
            Arc::new(Isolator::from_config(&run)?),
            run,
        )
        .with_events(progress.clone()),
    );

    let mut active = controller.begin_changeset(&actors, message).await?;
    let id = active.id();
    info!(changeset_id = %id, force, "scan started");

    let interrupt = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(changeset_id = %id, "interrupted; finishing in-flight assets");
                controller.cancel_changeset(id);
            }
        })
    };

    let result = controller
        .run_changeset(&mut active, RunOptions { force })
        .await;
    interrupt.abort();
    if !controller.shutdown(cancel_timeout).await {
        warn!("some work did not stop within {}s", cancel_timeout.as_secs());
    }
    let stats = result?;

    println!();
    println!("  Changeset {id}: {}", active.status().as_str());
    println!("  Seen:     {}", stats.assets_seen);
    println!("  Added:    {}", stats.assets_added);
    println!("  Updated:  {}", stats.assets_updated);
    println!("  Lost:     {}", stats.assets_lost);
    println!(
        "  Units:    {} run, {} skipped",
        stats.units_run, stats.units_skipped
    );
    println!(
        "  Rows:     +{} -{}",
        stats.rows_inserted, stats.rows_removed
    );
    for error in &stats.scan_errors {
        println!("  Scan error: {error}");
    }
    if !stats.unit_errors.is_empty() {
        println!("  Unit errors: {}", stats.unit_errors.len());
        for error in stats.unit_errors.iter().take(10) {
            println!("    {} on {}: {}", error.unit, error.asset_id, error.message);
        }
    }
    println!();

    Ok(())
}

async fn cmd_status(config_path: Option<&Path>, id: ChangesetId) -> Result<()> {
    let config = load(config_path)?;
    let controller = inspector(open_store_readonly(&config).await?, &config);
    let report = controller.changeset_status(id).await?;

    println!("Changeset {}: {}", report.id, report.status.as_str());
    println!("  Message: {}", report.message);
    let stats = &report.stats;
    println!(
        "  Assets:  {} seen, {} added, {} updated, {} lost",
        stats.assets_seen, stats.assets_added, stats.assets_updated, stats.assets_lost
    );
    println!(
        "  Units:   {} run, {} skipped, {} errors",
        stats.units_run,
        stats.units_skipped,
        report.unit_errors.len()
    );
    if !report.counts_by_key.is_empty() {
        println!("  Rows by key:");
        for (key, counts) in &report.counts_by_key {
            println!("    {key:<24} +{} -{}", counts.inserted, counts.removed);
        }
    }
    let mut by_unit: HashMap<&str, usize> = HashMap::new();
    for error in &report.unit_errors {
        *by_unit.entry(error.unit.as_str()).or_default() += 1;
    }
    for (unit, count) in by_unit {
        println!("  {unit}: {count} failed");
    }
    for error in &stats.scan_errors {
        println!("  Scan error: {error}");
    }
    Ok(())
}

async fn cmd_changesets(config_path: Option<&Path>, limit: u32) -> Result<()> {
    let config = load(config_path)?;
    let store = open_store_readonly(&config).await?;
    let changesets = store.list_changesets(limit).await?;
    if changesets.is_empty() {
        println!("No changesets yet.");
        return Ok(());
    }
    for cs in changesets {
        println!(
            "{:>6}  {:<11}  {}  {:>6} seen  {}",
            cs.id.0,
            cs.status.as_str(),
            cs.started_at.format("%Y-%m-%d %H:%M:%S"),
            cs.stats.assets_seen,
            cs.message
        );
    }
    Ok(())
}

async fn cmd_show(config_path: Option<&Path>, asset: &str, json: bool) -> Result<()> {
    let asset_id = parse_asset_id(asset)?;
    let config = load(config_path)?;
    let controller = inspector(open_store_readonly(&config).await?, &config);
    let Some((asset, view)) = controller.asset_view(asset_id).await? else {
        return Err(eyre!("asset {asset_id} not found"));
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let names = actor_names(controller.store().as_ref()).await?;
    println!("{}  {}:{}", asset.id, asset.namespace, asset.external_id);
    println!("  {}", asset.locator);
    for (key, values) in view.entries() {
        for value in values {
            let actor = names
                .get(&value.actor_id)
                .map(String::as_str)
                .unwrap_or("?");
            println!(
                "  {key:<24} {}  ({actor}, changeset {})",
                value.value, value.changeset_id
            );
        }
    }
    Ok(())
}

async fn cmd_history(config_path: Option<&Path>, asset: &str) -> Result<()> {
    let asset_id = parse_asset_id(asset)?;
    let config = load(config_path)?;
    let controller = inspector(open_store_readonly(&config).await?, &config);
    let facts = controller.asset_history(asset_id).await?;
    if facts.is_empty() {
        println!("No facts recorded for {asset_id}.");
        return Ok(());
    }

    let names = actor_names(controller.store().as_ref()).await?;
    for fact in facts {
        let actor = names
            .get(&fact.actor_id)
            .map(String::as_str)
            .unwrap_or("?");
        println!(
            "{:>6}  {}  {:<24} {}  ({actor})",
            fact.changeset_id.0,
            if fact.removed { "-" } else { "+" },
            fact.key,
            fact.value
        );
    }
    Ok(())
}

async fn cmd_actors(config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path)?;
    let store = open_store(&config).await?;
    register_actors(&store, &config).await?;

    let registry = UnitRegistry::with_builtins();
    for actor in store.list_actors().await? {
        let available = registry.plugins().contains(&actor.plugin);
        println!(
            "{:>4}  {:<10} {:<24} {}{}",
            actor.id.0,
            actor.kind.as_str(),
            actor.name,
            actor.plugin,
            if available { "" } else { "  (plugin not available)" }
        );
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

async fn cmd_worker() -> Result<()> {
    let registry = UnitRegistry::with_builtins();
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    worker::serve(&registry, stdin, tokio::io::stdout()).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Changeset progress on an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl EventSink for CliProgress {
    fn progress(&self, event: &ProgressEvent) {
        self.spinner.set_message(format!(
            "Changeset {} [{}] {} seen, {} updated",
            event.changeset_id, event.current_stage, event.assets_seen, event.assets_updated
        ));
    }

    fn finished(&self, _event: &TerminalEvent) {
        self.spinner.finish_and_clear();
    }
}

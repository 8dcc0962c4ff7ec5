//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use dossier_core::{
    DomainRegistry, GatherAndSynthesize, IntegratedResearch, OpenRouterClient, Orchestrator,
    OutputValidator, ProgressReporter, ResearchStrategy, SessionManager, SynthesisOptions,
};
use dossier_search::{BraveSearchClient, WebFetcher};
use dossier_shared::{
    AppConfig, Clock, DomainRecord, ResearchConfig, ResearchMode, SearchSettings, Session,
    SystemClock, expand_home, init_config, load_config, validate_api_keys,
};
use dossier_storage::{Cache, CacheKind, FileSessionStore};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Dossier: resumable research into structured, per-domain tables.
#[derive(Parser)]
#[command(
    name = "dossier",
    version,
    about = "Research a subject within a target market, one domain at a time, into structured tables.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Bypass the search/content cache.
    #[arg(long, global = true)]
    pub no_cache: bool,

    /// Domain registry file (defaults to the built-in seven domains).
    #[arg(long, global = true)]
    pub domains: Option<PathBuf>,

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
    /// Research a range of domains for a subject and target market.
    Run {
        /// What is being researched (e.g. a condition or product).
        subject: String,

        /// Market or region the research is scoped to.
        target: String,

        /// First domain to research.
        #[arg(long, default_value = "1")]
        start: u32,

        /// Last domain to research (defaults to the last configured domain).
        #[arg(long)]
        end: Option<u32>,

        #[command(flatten)]
        opts: RunOptions,
    },

    /// Continue a stored session from its first incomplete domain.
    Resume {
        subject: String,
        target: String,

        #[command(flatten)]
        opts: RunOptions,
    },

    /// Show the stored session for a subject and target.
    Status {
        subject: String,
        target: String,

        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List stored sessions, most recently updated first.
    List,

    /// Delete a stored session.
    Delete {
        subject: String,
        target: String,

        /// Keep a timestamped copy before deleting.
        #[arg(long)]
        backup: bool,
    },

    /// Show how many domains and queries a run would cover.
    Estimate {
        #[arg(long, default_value = "1")]
        start: u32,

        #[arg(long)]
        end: Option<u32>,
    },

    /// Search/content cache maintenance.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Per-run overrides of the config file.
#[derive(Args, Debug, Default)]
pub(crate) struct RunOptions {
    /// City or sub-region used to narrow some queries.
    #[arg(long)]
    pub locality: Option<String>,

    /// Research mode: standard or integrated.
    #[arg(long)]
    pub mode: Option<String>,

    /// Stop at the first domain that fails validation.
    #[arg(long)]
    pub strict: bool,

    /// Minimum rows for a table to count as populated.
    #[arg(long)]
    pub min_rows: Option<usize>,
}

/// Cache subcommands.
#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Entry counts per kind.
    Stats,
    /// Remove all entries, or only one kind (search or content).
    Clear {
        #[arg(long)]
        kind: Option<String>,
    },
    /// Remove expired entries.
    Cleanup,
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

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "dossier=info",
        1 => "dossier=debug",
        _ => "dossier=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
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
    let registry = load_registry(cli.domains.as_deref())?;
    let no_cache = cli.no_cache;

    match cli.command {
        Command::Run {
            subject,
            target,
            start,
            end,
            opts,
        } => {
            let end = end.unwrap_or(registry.len());
            cmd_research(registry, &subject, &target, Some((start, end)), &opts, no_cache).await
        }
        Command::Resume {
            subject,
            target,
            opts,
        } => cmd_research(registry, &subject, &target, None, &opts, no_cache).await,
        Command::Status {
            subject,
            target,
            json,
        } => cmd_status(&registry, &subject, &target, json),
        Command::List => cmd_list(&registry),
        Command::Delete {
            subject,
            target,
            backup,
        } => cmd_delete(&registry, &subject, &target, backup),
        Command::Estimate { start, end } => {
            let end = end.unwrap_or(registry.len());
            cmd_estimate(&registry, start, end)
        }
        Command::Cache { action } => match action {
            CacheAction::Stats => cmd_cache_stats(no_cache).await,
            CacheAction::Clear { kind } => cmd_cache_clear(kind.as_deref(), no_cache).await,
            CacheAction::Cleanup => cmd_cache_cleanup(no_cache).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn load_registry(path: Option<&Path>) -> Result<Arc<DomainRegistry>> {
    let registry = match path {
        Some(path) => DomainRegistry::load(path)
            .wrap_err_with(|| format!("failed to load domain registry {}", path.display()))?,
        None => DomainRegistry::builtin()?,
    };
    Ok(Arc::new(registry))
}

/// Config file values with CLI overrides applied.
fn research_config(config: &AppConfig, opts: &RunOptions) -> Result<ResearchConfig> {
    let mut research = ResearchConfig::try_from(config)?;
    if let Some(mode) = &opts.mode {
        research.mode = mode.parse()?;
    }
    if opts.strict {
        research.strict_mode = true;
    }
    if let Some(min_rows) = opts.min_rows {
        research.min_rows_per_table = min_rows;
    }
    Ok(research)
}

async fn open_cache(config: &AppConfig, no_cache: bool) -> Result<Arc<Cache>> {
    if no_cache || !config.cache.enabled {
        return Ok(Arc::new(Cache::disabled()));
    }
    let path = expand_home(&config.cache.path);
    let ttl = Duration::from_secs(config.cache.ttl_hours * 3600);
    Ok(Arc::new(Cache::open(&path, ttl).await?))
}

fn session_manager(session_dir: &Path, registry: &DomainRegistry) -> SessionManager {
    SessionManager::new(
        Arc::new(FileSessionStore::new(session_dir)),
        Arc::new(SystemClock),
        registry.len(),
    )
}

fn stored_sessions(registry: &DomainRegistry) -> Result<SessionManager> {
    let config = load_config()?;
    Ok(session_manager(&expand_home(&config.defaults.session_dir), registry))
}

/// Assemble the orchestrator for the configured research mode.
fn build_orchestrator(
    config: &AppConfig,
    research: &ResearchConfig,
    registry: Arc<DomainRegistry>,
    cache: Arc<Cache>,
) -> Result<Orchestrator> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let validator = OutputValidator::new(research.min_rows_per_table);
    let llm = Arc::new(OpenRouterClient::from_config(config)?);

    let strategy: Box<dyn ResearchStrategy> = match research.mode {
        ResearchMode::Standard => {
            let search = Arc::new(BraveSearchClient::from_config(config, cache.clone())?);
            let fetcher = Arc::new(WebFetcher::from_config(config, cache)?);
            let options = SynthesisOptions {
                max_retries: research.max_synthesis_retries,
                backoff_base: research.synthesis_backoff,
                input_cost_per_mtok: config.llm.input_cost_per_mtok,
                output_cost_per_mtok: config.llm.output_cost_per_mtok,
            };
            Box::new(GatherAndSynthesize::new(
                search,
                fetcher,
                llm,
                validator,
                SearchSettings::from(config),
                options,
                clock.clone(),
            ))
        }
        ResearchMode::Integrated => Box::new(IntegratedResearch::new(
            llm,
            config.llm.input_cost_per_mtok,
            config.llm.output_cost_per_mtok,
            clock.clone(),
        )),
    };

    let sessions = SessionManager::new(
        Arc::new(FileSessionStore::new(&research.session_dir)),
        clock,
        registry.len(),
    );
    Ok(Orchestrator::new(
        registry,
        sessions,
        strategy,
        validator,
        research.strict_mode,
    ))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

/// `run` with an explicit range, or `resume` when `range` is `None`.
async fn cmd_research(
    registry: Arc<DomainRegistry>,
    subject: &str,
    target: &str,
    range: Option<(u32, u32)>,
    opts: &RunOptions,
    no_cache: bool,
) -> Result<()> {
    let config = load_config()?;
    let research = research_config(&config, opts)?;
    validate_api_keys(&config, research.mode)?;
    if let Some((start, end)) = range {
        registry.check_range(&(start..=end))?;
    }

    let cache = open_cache(&config, no_cache).await?;
    let orchestrator = build_orchestrator(&config, &research, registry, cache)?;

    info!(
        subject,
        target,
        mode = research.mode.as_str(),
        strict = research.strict_mode,
        "starting research"
    );

    let reporter = CliProgress::new();
    let locality = opts.locality.as_deref();
    let result = match range {
        Some((start, end)) => {
            orchestrator
                .run(subject, target, start..=end, locality, &reporter)
                .await
        }
        None => orchestrator.resume(subject, target, locality, &reporter).await,
    };
    reporter.finish();

    let session = result.wrap_err("research run aborted")?;
    print_session_report(&session);
    Ok(())
}

fn cmd_status(registry: &DomainRegistry, subject: &str, target: &str, json: bool) -> Result<()> {
    let sessions = stored_sessions(registry)?;
    let Some(summary) = sessions.status(subject, target)? else {
        return Err(eyre!("no session found for '{subject}' in '{target}'"));
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!();
    println!("  Session:      {}", summary.session_id);
    println!("  Subject:      {}", summary.subject);
    println!("  Target:       {}", summary.target);
    println!("  Status:       {}", summary.overall_status);
    println!(
        "  Domains:      {}/{} (next: {})",
        summary.domains_completed, summary.total_domains, summary.current_domain
    );
    println!("  Completeness: {:.1}%", summary.completeness_score);
    println!("  Cost:         ${:.4}", summary.total_cost_usd);
    println!("  Created:      {}", summary.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated:      {}", summary.updated_at.format("%Y-%m-%d %H:%M:%S"));
    println!();
    Ok(())
}

fn cmd_list(registry: &DomainRegistry) -> Result<()> {
    let sessions = stored_sessions(registry)?.list_sessions()?;
    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    println!();
    for s in &sessions {
        println!(
            "  {:<32} {:<12} {:>5.1}%  {}/{} domains  updated {}",
            s.session_id,
            s.overall_status.to_string(),
            s.completeness_score,
            s.domains_completed,
            s.total_domains,
            s.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!();
    Ok(())
}

fn cmd_delete(registry: &DomainRegistry, subject: &str, target: &str, backup: bool) -> Result<()> {
    let sessions = stored_sessions(registry)?;
    if backup {
        match sessions.backup(subject, target)? {
            Some(path) => println!("Backup written to {path}"),
            None => println!("Nothing to back up."),
        }
    }
    if sessions.delete(subject, target)? {
        println!("Session deleted.");
    } else {
        println!("No session found for '{subject}' in '{target}'.");
    }
    Ok(())
}

fn cmd_estimate(registry: &DomainRegistry, start: u32, end: u32) -> Result<()> {
    let estimate = registry.estimate(start..=end)?;
    println!();
    for (id, name, queries) in &estimate.per_domain {
        println!("  {id}. {name:<28} {queries} queries");
    }
    println!();
    println!(
        "  {} domains, {} search queries",
        estimate.domains, estimate.total_queries
    );
    println!();
    Ok(())
}

async fn cmd_cache_stats(no_cache: bool) -> Result<()> {
    let config = load_config()?;
    let stats = open_cache(&config, no_cache).await?.stats().await?;
    if !stats.enabled {
        println!("Cache is disabled.");
        return Ok(());
    }
    if let Some(path) = &stats.path {
        println!("  Path:     {}", path.display());
    }
    println!("  Search:   {}", stats.search_entries);
    println!("  Content:  {}", stats.content_entries);
    println!("  Expired:  {}", stats.expired_entries);
    Ok(())
}

async fn cmd_cache_clear(kind: Option<&str>, no_cache: bool) -> Result<()> {
    let kind = kind.map(str::parse::<CacheKind>).transpose()?;
    let config = load_config()?;
    let removed = open_cache(&config, no_cache).await?.clear(kind).await?;
    println!("Removed {removed} cache entries.");
    Ok(())
}

async fn cmd_cache_cleanup(no_cache: bool) -> Result<()> {
    let config = load_config()?;
    let removed = open_cache(&config, no_cache)
        .await?
        .cleanup_expired()
        .await?;
    println!("Removed {removed} expired cache entries.");
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

fn print_session_report(session: &Session) {
    println!();
    println!("  Session:      {}", session.session_id);
    println!("  Status:       {}", session.overall_status);
    println!(
        "  Domains:      {}/{} completed",
        session.completed_domains(),
        session.total_domains
    );
    println!("  Completeness: {:.1}%", session.completeness_score);
    println!("  Cost:         ${:.4}", session.total_cost_usd);
    println!();
    for record in session.domains.values() {
        println!(
            "  {}. {:<28} {:<12} {} tables",
            record.domain_id,
            record.domain_name,
            record.status.as_str(),
            record.tables.len()
        );
    }
    if !session.data_gaps_summary.is_empty() {
        println!();
        println!("  Unresolved gaps:");
        for gap in &session.data_gaps_summary {
            println!("    - {gap}");
        }
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
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

    fn finish(&self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliProgress {
    fn run_started(&self, session: &Session, domains: &std::ops::RangeInclusive<u32>) {
        self.spinner.set_message(format!(
            "Session {} (domains {}-{})",
            session.session_id,
            domains.start(),
            domains.end()
        ));
    }

    fn domain_started(&self, domain_id: u32, name: &str) {
        self.spinner
            .set_message(format!("Researching domain {domain_id}: {name}"));
    }

    fn domain_completed(&self, record: &DomainRecord) {
        let gaps = record.quality_summary.validation_gaps.len();
        self.spinner.println(format!(
            "  ✓ {}. {} ({} tables, {gaps} gaps)",
            record.domain_id,
            record.domain_name,
            record.tables.len()
        ));
    }

    fn domain_failed(&self, domain_id: u32, name: &str, reason: &str) {
        self.spinner
            .println(format!("  ✗ {domain_id}. {name}: {reason}"));
    }

    fn done(&self, _session: &Session) {
        self.spinner.finish_and_clear();
    }
}

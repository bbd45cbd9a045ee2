//! SmartScrape CLI
//!
//! The `smartscrape` command checks, runs and repairs generated scrapers.
//!
//! ## Commands
//!
//! - `check`: static policy check of a script
//! - `run`: one sandboxed run of a script against a URL
//! - `refine`: full self-healing loop, persisted to the session store
//! - `history`: revisions and outcomes of a stored session
//! - `export`: standalone script of a session's successful revision
//! - `show-config`: effective configuration as TOML

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use smartscrape_core::telemetry::{init_tracing, level_for_verbosity};
use smartscrape_core::{
    export_from_history, ChatGenerator, EngineConfig, ExecutionOutcome, FsSessionStore,
    IsolatedRunner, PageSpec, PolicyChecker, RefinementEngine, RevisionOrigin, RunRequest,
    ScriptExecutor, ScriptRevision, SessionHistory, SessionId, SessionStore,
};

const DEFAULT_STORE_DIR: &str = ".smartscrape/sessions";

#[derive(Parser)]
#[command(name = "smartscrape")]
#[command(version = smartscrape_core::VERSION)]
#[command(about = "Self-healing scraper generation engine", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(short, long, global = true, env = "SMARTSCRAPE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a script against the sandbox policy without running it
    Check {
        /// Python script defining scrape(url)
        script: PathBuf,
    },

    /// Check and run a script once in the sandbox
    Run {
        /// Python script defining scrape(url)
        script: PathBuf,

        /// URL handed to scrape()
        #[arg(short, long)]
        url: String,

        /// Wall-clock budget in milliseconds (default: from config)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Run the check/run/repair loop until it succeeds or gives up
    Refine {
        /// Target page URL
        #[arg(short, long)]
        url: String,

        /// What to extract, in plain words
        #[arg(short, long)]
        goal: String,

        /// Start from this script instead of asking the generator for one
        #[arg(short, long)]
        script: Option<PathBuf>,

        /// Description of the target data for the generator
        #[arg(long)]
        target: Option<String>,

        /// Suggested CSS selector (repeatable)
        #[arg(long = "selector")]
        selectors: Vec<String>,

        /// Page type hint (list, detail, table, ...)
        #[arg(long, default_value = "list")]
        page_type: String,

        /// Write the exported script here on success
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Session store directory
        #[arg(long, default_value = DEFAULT_STORE_DIR)]
        store_dir: PathBuf,
    },

    /// Show the revision history of a session
    History {
        /// Session ID
        session: String,

        /// Print the full history as JSON
        #[arg(long)]
        raw: bool,

        /// Session store directory
        #[arg(long, default_value = DEFAULT_STORE_DIR)]
        store_dir: PathBuf,
    },

    /// List stored sessions
    Sessions {
        /// Session store directory
        #[arg(long, default_value = DEFAULT_STORE_DIR)]
        store_dir: PathBuf,
    },

    /// Export the last successful revision as a standalone script
    Export {
        /// Session ID
        session: String,

        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Session store directory
        #[arg(long, default_value = DEFAULT_STORE_DIR)]
        store_dir: PathBuf,
    },

    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.json, level_for_verbosity(cli.verbose));

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Check { script } => cmd_check(&config, &script),
        Commands::Run {
            script,
            url,
            timeout_ms,
        } => cmd_run(config, &script, &url, timeout_ms).await,
        Commands::Refine {
            url,
            goal,
            script,
            target,
            selectors,
            page_type,
            output,
            store_dir,
        } => {
            let page = PageSpec {
                url: url.clone(),
                target_description: target.unwrap_or_else(|| goal.clone()),
                suggested_selectors: selectors,
                data_structure: serde_json::Value::Null,
                page_type,
            };
            cmd_refine(
                config,
                &url,
                &goal,
                script.as_deref(),
                &page,
                output.as_deref(),
                &store_dir,
            )
            .await
        }
        Commands::History {
            session,
            raw,
            store_dir,
        } => cmd_history(&store_dir, &session, raw).await,
        Commands::Sessions { store_dir } => cmd_sessions(&store_dir).await,
        Commands::Export {
            session,
            output,
            store_dir,
        } => cmd_export(&store_dir, &session, output.as_deref()).await,
        Commands::ShowConfig => cmd_show_config(&config),
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => EngineConfig::from_env().context("Invalid configuration in environment"),
    }
}

fn read_script(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read script {}", path.display()))
}

fn parse_session(raw: &str) -> Result<SessionId> {
    SessionId::parse(raw).with_context(|| format!("Invalid session ID: {raw}"))
}

fn open_store(dir: &Path) -> Result<FsSessionStore> {
    FsSessionStore::new(dir)
        .with_context(|| format!("Failed to open session store {}", dir.display()))
}

fn print_outcome(outcome: &ExecutionOutcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}

/// Check a script against the sandbox policy
fn cmd_check(config: &EngineConfig, script: &Path) -> Result<()> {
    let source = read_script(script)?;
    let checker = PolicyChecker::new(Arc::new(config.policy.clone()));
    let verdict = checker.check(&source);
    if !verdict.is_approved() {
        bail!("{}: {verdict}", script.display());
    }
    println!("{}: approved", script.display());
    Ok(())
}

/// Check and run a script once
async fn cmd_run(
    config: EngineConfig,
    script: &Path,
    url: &str,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let source = read_script(script)?;
    let checker = PolicyChecker::new(Arc::new(config.policy.clone()));
    let verdict = checker.check(&source);
    let revision = ScriptRevision::root(source, RevisionOrigin::Submitted);

    let outcome = match (verdict.rejection_status(), verdict.to_finding()) {
        (Some(status), Some(finding)) => ExecutionOutcome::rejected(revision.id(), status, finding),
        _ => {
            let timeout = timeout_ms
                .map(std::time::Duration::from_millis)
                .unwrap_or_else(|| config.runner.default_timeout());
            let runner = IsolatedRunner::new(config.runner, &config.policy);
            let (abort_tx, abort_rx) = watch::channel(false);
            let request = RunRequest::new(url, timeout);
            let run = runner.execute(&revision, &request, abort_rx);
            tokio::pin!(run);
            tokio::select! {
                outcome = &mut run => outcome,
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted, stopping script");
                    abort_tx.send_replace(true);
                    run.await
                }
            }
        }
    };

    print_outcome(&outcome)?;
    if !outcome.status.is_success() {
        bail!("script finished with status {}", outcome.status);
    }
    Ok(())
}

/// Drive a session to a terminal state
async fn cmd_refine(
    config: EngineConfig,
    url: &str,
    goal: &str,
    script: Option<&Path>,
    page: &PageSpec,
    output: Option<&Path>,
    store_dir: &Path,
) -> Result<()> {
    let generator = ChatGenerator::from_env().context("Generator is not configured")?;
    let store = open_store(store_dir)?;
    let engine = Arc::new(
        RefinementEngine::from_config(config, Arc::new(generator), Arc::new(store))
            .context("Failed to build refinement engine")?,
    );

    let session = match script {
        Some(path) => {
            let source = read_script(path)?;
            engine.create_session(url, goal, &source).await?
        }
        None => engine
            .create_session_from_spec(url, goal, page)
            .await
            .context("Failed to generate the initial script")?,
    };
    println!("Session: {session}");

    let aborter = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(session_id = %session, "interrupted, aborting session");
                if let Err(e) = engine.abort(session).await {
                    warn!(error = %e, "abort failed");
                }
            }
        })
    };
    let state = engine.run_to_completion(session).await;
    aborter.abort();
    let state = state.context("Refinement loop failed")?;

    let history = engine.get_history(session).await?;
    print_history(&history);

    match engine.export(session).await {
        Ok(bundle) => {
            info!(revision = %bundle.revision_id, "exporting successful revision");
            write_or_print(output, &bundle.script)?;
            Ok(())
        }
        Err(_) => bail!(
            "session {session} ended {state}{}",
            history
                .session
                .fatal_reason
                .map(|r| format!(" ({r})"))
                .unwrap_or_default()
        ),
    }
}

fn print_history(history: &SessionHistory) {
    let session = &history.session;
    println!(
        "{} [{}] iteration {}/{}",
        session.id, session.state, session.iteration_count, session.max_iterations
    );
    if let Some(reason) = session.fatal_reason {
        println!("  reason: {reason}");
    }
    for (n, (revision, outcome)) in history.cycles().enumerate() {
        println!(
            "  #{:<2} {} {:<9} {:<16} {:>6} ms  {} records",
            n + 1,
            revision.source_digest().short(),
            revision.origin(),
            outcome.status,
            outcome.duration_ms,
            outcome.record_count()
        );
        if let Some(message) = &outcome.error_message {
            println!("      {}", message.lines().next().unwrap_or(""));
        }
    }
    if let Some(pending) = history.revisions.get(history.outcomes.len()) {
        println!("  pending {}", pending.source_digest().short());
    }
}

async fn cmd_history(store_dir: &Path, session: &str, raw: bool) -> Result<()> {
    let id = parse_session(session)?;
    let history = open_store(store_dir)?
        .load_history(id)
        .await
        .with_context(|| format!("Failed to load session {id}"))?;
    if raw {
        println!("{}", serde_json::to_string_pretty(&history)?);
    } else {
        print_history(&history);
    }
    Ok(())
}

async fn cmd_sessions(store_dir: &Path) -> Result<()> {
    let sessions = open_store(store_dir)?.list_sessions().await?;
    if sessions.is_empty() {
        println!("No sessions in {}", store_dir.display());
        return Ok(());
    }
    for session in sessions {
        println!(
            "{}  {:<10} {}/{}  {}  {}",
            session.id,
            session.state,
            session.iteration_count,
            session.max_iterations,
            session.created_at.format("%Y-%m-%d %H:%M"),
            session.url
        );
    }
    Ok(())
}

async fn cmd_export(store_dir: &Path, session: &str, output: Option<&Path>) -> Result<()> {
    let id = parse_session(session)?;
    let history = open_store(store_dir)?
        .load_history(id)
        .await
        .with_context(|| format!("Failed to load session {id}"))?;
    let bundle = export_from_history(&history)
        .with_context(|| format!("Session {id} has no successful revision"))?;
    if !bundle.dependency_manifest.is_empty() {
        info!(dependencies = ?bundle.dependency_manifest, "exported dependencies");
    }
    write_or_print(output, &bundle.script)
}

fn write_or_print(output: Option<&Path>, script: &str) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, script)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
        None => print!("{script}"),
    }
    Ok(())
}

fn cmd_show_config(config: &EngineConfig) -> Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

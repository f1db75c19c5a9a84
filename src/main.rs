use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use polyrepo::health::CheckResult;
use polyrepo::{
    Config, HealthCheck, OperationSummary, RepoOutcome, Repository, StatusCode, Workspace,
    WorkspaceManager,
};

#[derive(Parser)]
#[command(name = "polyrepo")]
#[command(about = "Manage a workspace of many git repositories from one manifest")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Manifest path (defaults to POLYREPO_CONFIG, then the nearest .polyrepo.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Workspace to operate on (defaults to the current one)
    #[arg(short, long, global = true)]
    workspace: Option<String>,

    /// Only repositories carrying one of these tags
    #[arg(short, long, global = true, value_delimiter = ',')]
    tags: Vec<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a manifest, empty or downloaded from a URL
    Init {
        /// Where to write the manifest
        #[arg(default_value = "~/.polyrepo.yaml")]
        path: PathBuf,

        /// Download the manifest from this URL instead
        #[arg(long)]
        url: Option<String>,
    },

    /// Clone missing repositories and fast-forward clean ones
    Sync,

    /// Fast-forward every cloned repository
    Pull,

    /// Push every repository with unpushed commits
    Push,

    /// Commit all changes in every repository
    Commit {
        /// Commit message
        #[arg(short, long)]
        message: String,
    },

    /// Switch every repository to a branch
    Switch {
        branch: String,
    },

    /// Show working tree and upstream status
    Status,

    /// Run repository runners, restarting them on file changes
    Watch,

    /// Check the environment and restore missing repositories
    Doctor,

    /// Manage the repositories of a workspace
    Repo {
        #[command(subcommand)]
        repo_command: RepoCommands,
    },
}

#[derive(Subcommand)]
enum RepoCommands {
    /// Add a repository to the manifest
    Add {
        /// Remote URL
        url: String,

        /// Checkout path relative to the workspace (defaults to the repository name)
        #[arg(short, long)]
        path: Option<String>,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,

        /// Branch to clone
        #[arg(short, long)]
        branch: Option<String>,

        /// Tags for filtering
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Remove a repository from the manifest (the checkout is left alone)
    Remove {
        /// Checkout path of the repository
        path: String,
    },

    /// List the repositories of the workspace
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;
    info!("Starting polyrepo v{}", env!("CARGO_PKG_VERSION"));

    if let Commands::Init { path, url } = &cli.command {
        return cmd_init(path, url.as_deref()).await;
    }

    let mut config = Config::discover(cli.config.as_deref()).context("Failed to load manifest")?;
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let workspace = config
        .select_workspace(cli.workspace.as_deref(), &cwd)
        .context("Failed to select a workspace")?
        .clone();

    let ok = match cli.command {
        Commands::Init { .. } => true,
        Commands::Sync => cmd_sync(&mut config, workspace, &cli.tags).await?,
        Commands::Pull => {
            let summary = manager(&config, workspace).pull(&cli.tags).await?;
            print_summary(&summary)
        }
        Commands::Push => {
            let summary = manager(&config, workspace).push(&cli.tags).await?;
            print_summary(&summary)
        }
        Commands::Commit { message } => {
            let summary = manager(&config, workspace).commit(&cli.tags, &message).await?;
            print_summary(&summary)
        }
        Commands::Switch { branch } => {
            let summary = manager(&config, workspace).switch(&cli.tags, &branch).await?;
            print_summary(&summary)
        }
        Commands::Status => {
            let summary = manager(&config, workspace).status(&cli.tags).await?;
            print_summary(&summary)
        }
        Commands::Watch => cmd_watch(&config, workspace, &cli.tags).await,
        Commands::Doctor => cmd_doctor(&config, workspace, &cli.tags).await?,
        Commands::Repo { repo_command } => {
            cmd_repo(repo_command, &mut config, &workspace)?;
            true
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    Ok(())
}

fn manager(config: &Config, workspace: Workspace) -> WorkspaceManager {
    WorkspaceManager::new(workspace, config.sync.clone())
}

/// Cancelled on Ctrl+C
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
        }
        cancel.cancel();
    });
    token
}

async fn cmd_init(path: &std::path::Path, url: Option<&str>) -> Result<()> {
    let config = Config::init(path, url)
        .await
        .with_context(|| format!("Failed to initialize manifest at {}", path.display()))?;

    println!("✅ Manifest created: {}", config.path.display());
    match url {
        Some(url) => println!("   Downloaded from {} ({} workspaces)", url, config.workspaces.len()),
        None => println!("   Next: add a workspace, then run 'polyrepo repo add <url>'"),
    }
    Ok(())
}

async fn cmd_sync(config: &mut Config, workspace: Workspace, tags: &[String]) -> Result<bool> {
    println!("🔄 Syncing workspace {}", workspace.name);
    let manager = manager(config, workspace).with_cancellation(shutdown_token());
    let summary = manager.sync(tags).await?;
    let ok = print_summary(&summary);

    if ok {
        config.mark_synced();
        if let Err(e) = config.save() {
            warn!(error = %e, "Could not record sync time in the manifest");
        }
    }
    Ok(ok)
}

async fn cmd_watch(config: &Config, workspace: Workspace, tags: &[String]) -> bool {
    println!("👀 Watching workspace {} (Ctrl+C to stop)", workspace.name);
    let manager = manager(config, workspace);
    match manager.watch_all(tags, shutdown_token()).await {
        Ok(()) => true,
        Err(e) => {
            println!("❌ {}", e);
            false
        }
    }
}

async fn cmd_doctor(config: &Config, workspace: Workspace, tags: &[String]) -> Result<bool> {
    let health = HealthCheck::run(config, &workspace);
    print_health_report(&health);
    if !health.all_passed() {
        return Ok(false);
    }

    println!();
    println!("🩺 Restoring workspace {}", workspace.name);
    let summary = manager(config, workspace).doctor(tags).await?;
    Ok(print_summary(&summary))
}

fn cmd_repo(command: RepoCommands, config: &mut Config, workspace: &Workspace) -> Result<()> {
    match command {
        RepoCommands::Add {
            url,
            path,
            name,
            branch,
            tags,
        } => {
            let path = match path {
                Some(path) => path,
                None => default_checkout_path(&url)
                    .with_context(|| format!("Cannot derive a checkout path from {}", url))?,
            };
            let repository = Repository {
                name: name.unwrap_or_default(),
                url,
                branch,
                path: path.clone(),
                tags,
                ..Default::default()
            };
            config.add_repository(&workspace.name, repository)?;
            config.save()?;
            println!("✅ Added {} to workspace {}", path, workspace.name);
        }
        RepoCommands::Remove { path } => {
            let removed = config.remove_repository(&workspace.name, &path)?;
            config.save()?;
            println!("🗑️  Removed {} from workspace {}", removed.display_name(), workspace.name);
        }
        RepoCommands::List => {
            println!("📁 {} ({})", workspace.name, workspace.path);
            for repo in &workspace.repositories {
                println!("  📦 {} → {}", repo.display_name(), repo.url);
                if repo.name != repo.path && !repo.name.is_empty() {
                    println!("     📂 {}", repo.path);
                }
                if !repo.tags.is_empty() {
                    println!("     🏷️  {}", repo.tags.join(", "));
                }
            }
        }
    }
    Ok(())
}

/// Last path segment of a remote URL without its `.git` suffix
fn default_checkout_path(url: &str) -> Option<String> {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed.rsplit(['/', ':']).next()?;
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Print per-repository results; returns false if anything failed
fn print_summary(summary: &OperationSummary) -> bool {
    println!();
    for result in &summary.results {
        let (icon, text) = describe(&result.outcome);
        println!("  {} {}: {}", icon, result.name, text);
    }

    println!();
    println!("📊 {} complete", summary.operation);
    println!("   Total repositories: {}", summary.total);
    println!("   ✅ Successful: {}", summary.successful);
    println!("   ⏭️  Skipped: {}", summary.skipped);
    println!("   ❌ Failed: {}", summary.failed);
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    !summary.has_failures()
}

fn describe(outcome: &RepoOutcome) -> (&'static str, String) {
    match outcome {
        RepoOutcome::Cloned => ("📥", "cloned".to_string()),
        RepoOutcome::Pulled { commit } => ("🔄", format!("fast-forwarded to {}", short(commit))),
        RepoOutcome::UpToDate => ("✅", "up to date".to_string()),
        RepoOutcome::Pushed => ("📤", "pushed".to_string()),
        RepoOutcome::Committed { hash, changed } => {
            ("📝", format!("committed {} ({} files)", short(hash), changed))
        }
        RepoOutcome::Switched { branch } => ("🔀", format!("on {}", branch)),
        RepoOutcome::Status(status) => {
            let icon = match status.code {
                StatusCode::Clean => "✅",
                StatusCode::Dirty => "⚠️ ",
                StatusCode::Unpushed => "📤",
                StatusCode::Unpulled => "📥",
                StatusCode::Missing | StatusCode::Unknown => "❓",
                StatusCode::Error => "❌",
            };
            (icon, format!("{} {}", status.code, status.message))
        }
        RepoOutcome::Skipped { reason } => ("⏭️ ", format!("skipped: {}", reason)),
        RepoOutcome::Failed { error, fatal } => {
            let icon = if *fatal { "🛑" } else { "❌" };
            (icon, error.clone())
        }
    }
}

fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 Polyrepo System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    let errors = health.errors();
    let warnings = health.warnings();
    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ {} check(s) failed:", errors.len());
        for error in &errors {
            println!("   - {}", error.message);
        }
    }
    if !warnings.is_empty() {
        println!("⚠️  {} warning(s):", warnings.len());
        for warning in &warnings {
            println!("   - {}", warning.message);
        }
    }
}

//! converge CLI entrypoint.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use converge::cli::{Cli, Commands, LogFormat, OutputFormatter, StateCommands};
use converge::config::{find_config_file, ConfigParser, ConfigValidator, Document, FlagBindings};
use converge::error::{ConvergeError, Result, EXIT_SUCCESS};
use converge::planner::PlanMode;
use converge::provider::Provider;
use converge::reconciler::{build_provider, build_state_store, prepare, retry_hook, Reconciler};
use converge::state::{generate_holder_id, LocalStateStore, StateStore};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Starter document written by `converge init`.
const DOCUMENT_TEMPLATE: &str = include_str!("../templates/converge.yaml");

/// Example `.env` written by `converge init`.
const ENV_TEMPLATE: &str = include_str!("../templates/env.example");

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::from(converge::error::EXIT_RUNTIME_ERROR);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initializes logging. `RUST_LOG` takes precedence over `--verbose`.
fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Runs a command and returns the process exit code.
async fn run(cli: Cli) -> Result<u8> {
    let formatter = OutputFormatter::new(cli.output);

    match &cli.command {
        Commands::Init { path, force } => cmd_init(path, *force),
        Commands::Validate { warnings } => cmd_validate(&cli, *warnings, &formatter).await,
        Commands::Graph => cmd_graph(&cli, &formatter).await,
        Commands::Plan { no_refresh } => cmd_plan(&cli, *no_refresh, &formatter).await,
        Commands::Apply { yes, no_refresh } => cmd_apply(&cli, *yes, *no_refresh, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(&cli, *yes, &formatter).await,
        Commands::Drift => cmd_drift(&cli, &formatter).await,
        Commands::State { command } => cmd_state(&cli, command, &formatter).await,
    }
}

/// Writes a starter document.
fn cmd_init(path: &Path, force: bool) -> Result<u8> {
    info!("Initializing converge project in: {}", path.display());

    let config_path = path.join("converge.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Document already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(EXIT_SUCCESS);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, DOCUMENT_TEMPLATE)?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, ENV_TEMPLATE)?;
    eprintln!("Created: {}", env_path.display());

    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", ".converge/"]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# converge")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ".env\n.converge/\n")?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nNext steps:");
    eprintln!("  1. Edit converge.yaml to declare your resources");
    eprintln!("  2. Run 'converge validate' to check the document");
    eprintln!("  3. Run 'converge plan' to see what will change");
    eprintln!("  4. Run 'converge apply' to converge");

    Ok(EXIT_SUCCESS)
}

/// Validates the document and its resource graph.
async fn cmd_validate(cli: &Cli, show_warnings: bool, formatter: &OutputFormatter) -> Result<u8> {
    let workspace = Workspace::load(cli)?;
    let result = ConfigValidator::new().validate(&workspace.document)?;

    // Graph problems (duplicates, references, flags, cycles) are part of validity.
    let store = workspace.state_store();
    prepare(&workspace.document, &workspace.flags(cli)?, &store, PlanMode::Apply).await?;

    println!(
        "{}",
        formatter.format_validation(&workspace.document, &result, show_warnings)
    );
    Ok(EXIT_SUCCESS)
}

/// Prints the apply order.
async fn cmd_graph(cli: &Cli, formatter: &OutputFormatter) -> Result<u8> {
    let workspace = Workspace::load_validated(cli)?;
    let store = workspace.state_store();
    let prepared = prepare(&workspace.document, &workspace.flags(cli)?, &store, PlanMode::Apply).await?;

    println!(
        "{}",
        formatter.format_graph(&prepared.graph, &prepared.schedule, prepared.inclusion.excluded())
    );
    Ok(EXIT_SUCCESS)
}

/// Shows what apply would change.
async fn cmd_plan(cli: &Cli, no_refresh: bool, formatter: &OutputFormatter) -> Result<u8> {
    let workspace = Workspace::load_validated(cli)?;
    let store = workspace.state_store();
    let provider = workspace.provider()?;
    let (_, plan) = workspace
        .reconciler(cli, &store, provider)?
        .with_refresh(!no_refresh)
        .plan()
        .await?;

    println!("{}", formatter.format_plan(&plan));
    Ok(EXIT_SUCCESS)
}

/// Converges infrastructure towards the document.
async fn cmd_apply(
    cli: &Cli,
    auto_approve: bool,
    no_refresh: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let workspace = Workspace::load_validated(cli)?;
    let store = workspace.state_store();
    let provider = workspace.provider()?;
    let cancel = cancel_on_ctrl_c();
    let reconciler = workspace
        .reconciler(cli, &store, provider)?
        .with_refresh(!no_refresh)
        .with_cancellation(cancel);

    if !auto_approve {
        let (_, plan) = reconciler.plan().await?;
        if plan.is_empty() {
            println!("{}", formatter.format_plan(&plan));
            return Ok(EXIT_SUCCESS);
        }
        eprintln!("{}", formatter.format_plan(&plan));
        if !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
            eprintln!("Apply cancelled.");
            return Ok(EXIT_SUCCESS);
        }
    }

    let outcome = reconciler.apply().await?;
    println!("{}", formatter.format_report(&outcome.report));
    Ok(outcome.report.exit_code())
}

/// Destroys every recorded resource.
async fn cmd_destroy(cli: &Cli, auto_approve: bool, formatter: &OutputFormatter) -> Result<u8> {
    let workspace = Workspace::load_validated(cli)?;
    let store = workspace.state_store();
    let provider = workspace.provider()?;
    let cancel = cancel_on_ctrl_c();
    let reconciler = workspace
        .reconciler(cli, &store, provider)?
        .with_cancellation(cancel);

    let Some(state) = store.load().await? else {
        eprintln!("No state found. Nothing to destroy.");
        return Ok(EXIT_SUCCESS);
    };
    if state.is_empty() {
        eprintln!("No resources recorded. Nothing to destroy.");
        return Ok(EXIT_SUCCESS);
    }

    if !auto_approve {
        eprintln!("The following resources will be destroyed:");
        for resource in state.resources.values() {
            eprintln!("  - {} ({})", resource.id, resource.provider_id);
        }
        if !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")? {
            eprintln!("Destroy cancelled.");
            return Ok(EXIT_SUCCESS);
        }
    }

    let outcome = reconciler.destroy().await?;
    println!("{}", formatter.format_report(&outcome.report));
    Ok(outcome.report.exit_code())
}

/// Checks for drift.
async fn cmd_drift(cli: &Cli, formatter: &OutputFormatter) -> Result<u8> {
    let workspace = Workspace::load_validated(cli)?;
    let store = workspace.state_store();
    let provider = workspace.provider()?;
    let report = workspace.reconciler(cli, &store, provider)?.check_drift().await?;

    println!("{}", formatter.format_drift(&report));
    Ok(EXIT_SUCCESS)
}

/// State management commands.
async fn cmd_state(cli: &Cli, command: &StateCommands, formatter: &OutputFormatter) -> Result<u8> {
    let workspace = Workspace::load(cli)?;
    let store = workspace.state_store();

    match command {
        StateCommands::Show => match store.load().await? {
            Some(state) => println!("{}", formatter.format_state(&state)),
            None => eprintln!("No state found at {}.", store.location()),
        },
        StateCommands::Lock { holder } => {
            let holder = holder.clone().unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder, "manual").await?;
            println!("{}", formatter.format_lock(&lock));
        }
        StateCommands::Unlock { lock_id, force } => {
            if *force {
                store.force_unlock().await?;
                eprintln!("State forcefully unlocked.");
            } else if let Some(id) = lock_id {
                store.release_lock(id).await?;
                eprintln!("State unlocked.");
            } else {
                return Err(ConvergeError::internal("Provide --lock-id or use --force"));
            }
        }
    }

    Ok(EXIT_SUCCESS)
}

/// A loaded document and the directory it lives in.
struct Workspace {
    base_dir: PathBuf,
    document: Document,
}

impl Workspace {
    /// Loads `.env` and the document with environment overrides applied.
    fn load(cli: &Cli) -> Result<Self> {
        let config_file = match &cli.config {
            Some(path) => path.clone(),
            None => find_config_file(".")?,
        };
        debug!("Loading document from: {}", config_file.display());

        let base_dir = config_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        let parser = ConfigParser::new().with_base_path(&base_dir);
        parser.load_dotenv()?;
        let document = parser.load_with_env(&config_file)?;

        Ok(Self { base_dir, document })
    }

    /// Loads and validates the document.
    fn load_validated(cli: &Cli) -> Result<Self> {
        let workspace = Self::load(cli)?;
        ConfigValidator::new().validate(&workspace.document)?;
        Ok(workspace)
    }

    fn state_store(&self) -> LocalStateStore {
        build_state_store(&self.document, &self.base_dir)
    }

    fn provider(&self) -> Result<Arc<dyn Provider>> {
        build_provider(&self.document, &self.base_dir)
    }

    /// Flags: document defaults, then `CONVERGE_FLAG_*`, then `--flag`.
    fn flags(&self, cli: &Cli) -> Result<FlagBindings> {
        let mut flags = FlagBindings::from_defaults(&self.document.flags);
        flags.apply_env()?;
        flags.apply_cli(&cli.flags)?;
        Ok(flags)
    }

    fn reconciler<'a>(
        &'a self,
        cli: &Cli,
        store: &'a LocalStateStore,
        provider: Arc<dyn Provider>,
    ) -> Result<Reconciler<'a, LocalStateStore>> {
        let mut reconciler = Reconciler::new(&self.document, store, provider)
            .with_flags(self.flags(cli)?)
            .with_retry_hook(retry_hook(cli.retries));
        if let Some(parallelism) = cli.parallelism {
            reconciler = reconciler.with_parallelism(parallelism);
        }
        Ok(reconciler)
    }
}

/// Cancels the returned token on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing in-flight operations");
            trigger.cancel();
        }
    });
    cancel
}

/// Prompts on stderr and compares the answer with `expected`.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sandsync::config::SyncConfig;
use sandsync::model::{DependencyMap, FileMap, StatusCheckResult};
use sandsync::reconcile::{HttpStatusProbe, StatusLoop, StatusProbe};
use sandsync::sandbox::e2b::E2bSandboxClient;
use sandsync::sandbox::{SandboxClient, SandboxHealthClient, SessionRegistry, SKIP_DIRS};
use sandsync::store::{ProjectStore, SqliteStore};
use sandsync::sync::{FileSync, MergeMetadata, SyncOrchestrator, VersionHistory, WriteSource};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(name = "sandsync", version)]
#[command(about = "Keep project files and their remote sandbox in sync")]
struct Cli {
    /// Configuration file (defaults to $SANDSYNC_CONFIG, then the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Owner the project operations run as
    #[arg(long, global = true, default_value = "local")]
    owner: String,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a project, optionally seeded from a local directory
    Create {
        #[arg(long)]
        from: Option<PathBuf>,
    },
    /// One status check of the project's sandbox
    Status { project: String },
    /// Check the sandbox periodically and resync when its lease expires
    Watch { project: String },
    /// Resume or recreate the sandbox and push the project files into it
    Sync { project: String },
    /// Pull the sandbox's files back into the project
    Capture { project: String },
    /// Extend the sandbox lease
    Extend {
        project: String,
        #[arg(long, default_value_t = 10)]
        minutes: u64,
    },
    /// Terminate the project's sandbox
    Teardown { project: String },
    #[command(subcommand)]
    Files(FilesCommand),
    #[command(subcommand)]
    Versions(VersionsCommand),
}

#[derive(Subcommand, Debug)]
enum FilesCommand {
    /// Print the project's current files
    Show { project: String },
    /// Replace all project files with the contents of a directory
    Push { project: String, dir: PathBuf },
    /// Merge the files found in a directory into the project
    Merge {
        project: String,
        dir: PathBuf,
        #[arg(long)]
        message: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum VersionsCommand {
    List {
        project: String,
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long)]
        offset: Option<i64>,
    },
    Show { version: String },
    Restore { version: String },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "sandsync=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Read every UTF-8 file under `dir` as `relative path -> content`.
fn read_dir_files(dir: &Path) -> Result<FileMap> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let mut files = FileMap::new();
    let walker = WalkDir::new(dir).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !entry
                .file_name()
                .to_str()
                .is_some_and(|name| SKIP_DIRS.contains(&name))
    });
    for entry in walker {
        let entry = entry.with_context(|| format!("walking {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir)?;
        let Some(relative) = relative.to_str() else {
            tracing::warn!(path = %entry.path().display(), "skipping non UTF-8 path");
            continue;
        };
        match std::fs::read_to_string(entry.path()) {
            Ok(content) => {
                files.insert(relative.replace('\\', "/"), content);
            }
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "skipping unreadable file");
            }
        }
    }
    Ok(files)
}

struct App {
    config: SyncConfig,
    owner: String,
    store: Arc<SqliteStore>,
    provider: Arc<dyn SandboxClient>,
    registry: Arc<SessionRegistry>,
}

impl App {
    fn open(config: SyncConfig, owner: String) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(&config.db_path()?)?);
        let provider = E2bSandboxClient::with_base(
            config.sandbox.api_key.clone().unwrap_or_default(),
            config.sandbox.api_base.clone(),
        )?;
        Ok(Self {
            config,
            owner,
            store,
            provider: Arc::new(provider),
            registry: Arc::new(SessionRegistry::new()),
        })
    }

    fn health(&self) -> Arc<SandboxHealthClient> {
        Arc::new(SandboxHealthClient::new(
            self.provider.clone(),
            self.store.clone(),
            self.registry.clone(),
        ))
    }

    fn orchestrator(&self) -> Arc<SyncOrchestrator> {
        Arc::new(SyncOrchestrator::new(
            self.provider.clone(),
            self.store.clone(),
            self.registry.clone(),
            self.config.orchestrator_settings(),
        ))
    }

    fn probe(&self) -> Result<Arc<dyn StatusProbe>> {
        let probe: Arc<dyn StatusProbe> = match &self.config.status.endpoint {
            Some(endpoint) => Arc::new(HttpStatusProbe::new(
                endpoint.clone(),
                self.config.status.token.clone(),
            )?),
            None => Arc::new(self.health().for_owner(self.owner.clone())),
        };
        Ok(probe)
    }

    async fn watch(&self, project: &str) -> Result<()> {
        let status_loop = StatusLoop::new(self.probe()?, self.config.loop_settings());
        status_loop.set_status_callback(Arc::new(|result: &StatusCheckResult| {
            tracing::info!(
                status = ?result.status,
                action = ?result.action_required,
                message = %result.message,
                "sandbox status"
            );
        }));
        status_loop.set_sync_callback(Arc::new(self.orchestrator().for_owner(self.owner.clone())));
        status_loop.start(project);
        tracing::info!(project_id = %project, "watching sandbox, ctrl-c to stop");

        tokio::signal::ctrl_c().await?;
        let errors = status_loop.error_status();
        status_loop.dispose();
        print_json(&errors)
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = SyncConfig::load(cli.config.as_deref())?;
    let app = App::open(config, cli.owner)?;
    let owner = app.owner.as_str();

    match cli.command {
        Command::Create { from } => {
            let files = match from {
                Some(dir) => read_dir_files(&dir)?,
                None => FileMap::new(),
            };
            let project = app.store.create_project(owner, files, DependencyMap::new()).await?;
            print_json(&project)
        }
        Command::Status { project } => {
            let result = app.health().check_status(owner, &project).await?;
            print_json(&result)
        }
        Command::Watch { project } => app.watch(&project).await,
        Command::Sync { project } => {
            let report = app.orchestrator().resync(owner, &project).await?;
            print_json(&report)
        }
        Command::Capture { project } => {
            let outcome = app.orchestrator().capture(owner, &project).await?;
            print_json(&outcome)
        }
        Command::Extend { project, minutes } => {
            let session = app
                .health()
                .extend_lease(owner, &project, std::time::Duration::from_secs(minutes * 60))
                .await?;
            print_json(&session)
        }
        Command::Teardown { project } => {
            app.orchestrator().teardown(owner, &project).await?;
            Ok(())
        }
        Command::Files(FilesCommand::Show { project }) => {
            let project = app.store.get_project(owner, &project).await?;
            print_json(&project.files)
        }
        Command::Files(FilesCommand::Push { project, dir }) => {
            let files = read_dir_files(&dir)?;
            let outcome = FileSync::new(app.store.clone())
                .replace_files(owner, &project, files)
                .await?;
            print_json(&outcome)
        }
        Command::Files(FilesCommand::Merge {
            project,
            dir,
            message,
        }) => {
            let files = read_dir_files(&dir)?;
            let metadata = MergeMetadata {
                source: WriteSource::Editor,
                message,
            };
            let outcome = FileSync::new(app.store.clone())
                .merge_files(owner, &project, files, metadata)
                .await?;
            print_json(&outcome)
        }
        Command::Versions(VersionsCommand::List {
            project,
            limit,
            offset,
        }) => {
            let versions = VersionHistory::new(app.store.clone())
                .list(owner, &project, limit, offset)
                .await?;
            print_json(&versions)
        }
        Command::Versions(VersionsCommand::Show { version }) => {
            let version = VersionHistory::new(app.store.clone()).get(owner, &version).await?;
            print_json(&version)
        }
        Command::Versions(VersionsCommand::Restore { version }) => {
            let outcome = VersionHistory::new(app.store.clone())
                .restore(owner, &version)
                .await?;
            print_json(&outcome)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    run(cli).await
}

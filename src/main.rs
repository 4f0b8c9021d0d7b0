use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use gitgate::auth::{TokenGenerator, parse_authorized_key};
use gitgate::config::ServerConfig;
use gitgate::engine::{GitEngine, init_bare_repo, repo_path};
use gitgate::indexer::{IncrementalIndexer, IndexTrigger};
use gitgate::server::ssh::host_key;
use gitgate::server::validation::{validate_repo_name, validate_username};
use gitgate::server::{AppState, SshServer, create_router, resolve_repo};
use gitgate::store::{IndexStore, SqliteStore, Store};
use gitgate::types::{Collaborator, PermissionLevel, Repository, SshKey, User};

#[derive(Parser)]
#[command(name = "gitgate")]
#[command(about = "Git over SSH and smart HTTP with an incremental repository index", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for database, host key and repositories
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory, database and SSH host key
    Init,

    /// Manage users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Manage SSH keys
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },

    /// Manage repositories
    Repo {
        #[command(subcommand)]
        command: RepoCommands,
    },

    /// Rebuild the index of a repository from scratch
    Reindex {
        /// Repository as owner/name
        repo: String,
    },

    /// Show the indexed history of a ref
    Log {
        /// Repository as owner/name
        repo: String,

        /// Branch name or fully qualified ref
        #[arg(default_value = "main")]
        git_ref: String,

        #[arg(long, short = 'n', default_value = "20")]
        limit: i64,
    },

    /// Full-text search over indexed file contents
    Search {
        /// Repository as owner/name
        repo: String,

        query: String,

        #[arg(long, short = 'n', default_value = "20")]
        limit: i64,
    },

    /// Start the HTTP and SSH servers
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// HTTP port
        #[arg(long, short)]
        port: Option<u16>,

        /// SSH port, 0 to disable
        #[arg(long)]
        ssh_port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create a user and print an access token for HTTP
    Add { username: String },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Register an OpenSSH public key for a user
    Add {
        username: String,

        /// Public key file, e.g. ~/.ssh/id_ed25519.pub
        key_file: PathBuf,

        #[arg(long)]
        title: Option<String>,
    },
}

#[derive(Subcommand)]
enum RepoCommands {
    /// Create an empty bare repository
    Create {
        /// Repository as owner/name
        repo: String,

        #[arg(long)]
        public: bool,

        #[arg(long, default_value = "main")]
        default_branch: String,
    },

    /// Give a user access to a repository
    Grant {
        /// Repository as owner/name
        repo: String,

        username: String,

        /// read, write or admin
        permission: String,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir.clone_from(data_dir);
    }
    Ok(config)
}

fn open_store(config: &ServerConfig) -> anyhow::Result<Arc<SqliteStore>> {
    let db_path = config.db_path();
    if !db_path.exists() {
        bail!("Server not initialized. Run 'gitgate init' first.");
    }
    let store = SqliteStore::new(&db_path)?;
    store.initialize()?;
    Ok(Arc::new(store))
}

fn split_repo(slug: &str) -> anyhow::Result<(&str, &str)> {
    slug.split_once('/')
        .with_context(|| format!("expected owner/name, got '{slug}'"))
}

fn find_repo(store: &SqliteStore, slug: &str) -> anyhow::Result<Repository> {
    let (owner, name) = split_repo(slug)?;
    match resolve_repo(store, owner, name)? {
        Some((_, repo)) => Ok(repo),
        None => bail!("Repository '{slug}' not found"),
    }
}

fn find_user(store: &SqliteStore, username: &str) -> anyhow::Result<User> {
    store
        .get_user_by_username(username)?
        .with_context(|| format!("User '{username}' not found"))
}

fn qualify_ref(name: &str) -> String {
    if name.starts_with("refs/") {
        name.to_string()
    } else {
        format!("refs/heads/{name}")
    }
}

fn run_init(config: &ServerConfig) -> anyhow::Result<()> {
    fs::create_dir_all(config.repos_dir())?;

    let store = SqliteStore::new(config.db_path())?;
    store.initialize()?;
    host_key::load_or_generate(&config.host_key_path())?;

    println!("Initialized {}", config.data_dir.display());
    println!("  database: {}", config.db_path().display());
    println!("  host key: {}", config.host_key_path().display());
    Ok(())
}

fn add_user(store: &SqliteStore, username: &str) -> anyhow::Result<()> {
    validate_username(username)?;
    let user = User {
        id: Uuid::new_v4().to_string(),
        username: username.to_string(),
        created_at: Utc::now(),
    };
    store.create_user(&user)?;

    let (token, raw_token) = TokenGenerator::new().issue(&user.id)?;
    store.create_token(&token)?;

    println!("Created user '{username}'. HTTP access token (shown once):");
    println!();
    println!("  {raw_token}");
    Ok(())
}

fn add_key(
    store: &SqliteStore,
    username: &str,
    key_file: &Path,
    title: Option<String>,
) -> anyhow::Result<()> {
    let user = find_user(store, username)?;
    let line = fs::read_to_string(key_file)
        .with_context(|| format!("reading {}", key_file.display()))?;
    let parsed = parse_authorized_key(line.trim())?;

    let key = SshKey {
        id: Uuid::new_v4().to_string(),
        user_id: user.id,
        title: title
            .or(parsed.comment)
            .unwrap_or_else(|| key_file.display().to_string()),
        key_type: parsed.key_type,
        key_blob: parsed.key_blob,
        fingerprint: parsed.fingerprint,
        created_at: Utc::now(),
    };
    store.create_ssh_key(&key)?;

    println!("Added {} key {} for '{username}'", key.key_type, key.fingerprint);
    Ok(())
}

async fn create_repo(
    config: &ServerConfig,
    store: &SqliteStore,
    slug: &str,
    public: bool,
    default_branch: &str,
) -> anyhow::Result<()> {
    let (owner_name, name) = split_repo(slug)?;
    validate_repo_name(name)?;
    let owner = find_user(store, owner_name)?;
    if store.get_repo(&owner.id, name)?.is_some() {
        bail!("Repository '{slug}' already exists");
    }

    let path = repo_path(&config.repos_dir(), &owner.username, name);
    init_bare_repo(&path, default_branch).await?;

    let now = Utc::now();
    store.create_repo(&Repository {
        id: Uuid::new_v4().to_string(),
        owner_id: owner.id,
        name: name.to_string(),
        path: path.clone(),
        default_branch: default_branch.to_string(),
        public,
        created_at: now,
        updated_at: now,
    })?;

    println!("Created {slug} at {}", path.display());
    Ok(())
}

fn grant(store: &SqliteStore, slug: &str, username: &str, permission: &str) -> anyhow::Result<()> {
    let repo = find_repo(store, slug)?;
    let user = find_user(store, username)?;
    let permission: PermissionLevel = permission.parse()?;

    store.upsert_collaborator(&Collaborator {
        repo_id: repo.id,
        user_id: user.id,
        permission,
        created_at: Utc::now(),
    })?;

    println!("Granted {permission} on {slug} to '{username}'");
    Ok(())
}

fn build_indexer(config: &ServerConfig, store: &Arc<SqliteStore>, engine: &Arc<GitEngine>) -> IncrementalIndexer {
    IncrementalIndexer::new(engine.clone(), store.clone(), config.indexer.clone())
}

fn reindex(config: &ServerConfig, store: &Arc<SqliteStore>, slug: &str) -> anyhow::Result<()> {
    let repo = find_repo(store, slug)?;
    let engine = Arc::new(GitEngine::new());
    let commits = build_indexer(config, store, &engine).full_reindex(&repo.id, &repo.path)?;
    println!("Reindexed {slug}: {commits} commits");
    Ok(())
}

fn show_log(store: &SqliteStore, slug: &str, git_ref: &str, limit: i64) -> anyhow::Result<()> {
    let repo = find_repo(store, slug)?;
    let ref_name = qualify_ref(git_ref);
    if store.get_ref(&repo.id, &ref_name)?.is_none() {
        bail!("Ref '{ref_name}' is not indexed");
    }

    for commit in store.commit_log(&repo.id, &ref_name, 0, limit)? {
        let summary = commit.message.lines().next().unwrap_or("");
        println!(
            "{} {} {} {summary}",
            &commit.oid.as_str()[..12],
            commit.author.time.format("%Y-%m-%d"),
            commit.author.name,
        );
    }
    Ok(())
}

fn search(store: &SqliteStore, slug: &str, query: &str, limit: i64) -> anyhow::Result<()> {
    let repo = find_repo(store, slug)?;
    let hits = store.search(&repo.id, query, limit)?;
    println!("{}", serde_json::to_string_pretty(&hits)?);
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {e}");
        return;
    }
    info!("Shutting down");
    shutdown.cancel();
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let engine = Arc::new(GitEngine::new());
    let trigger = Arc::new(IndexTrigger::new(
        build_indexer(&config, &store, &engine),
        engine.clone(),
        store.clone(),
        config.indexer.settle_delay(),
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let ssh = if config.ssh_port == 0 {
        None
    } else {
        let host_key = host_key::load_or_generate(&config.host_key_path())?;
        let server = SshServer::new(
            config.ssh_socket_addr()?,
            host_key,
            store.clone(),
            engine.clone(),
            trigger.clone(),
        );
        let handle = server.start().await?;
        Some((server, handle))
    };

    let state = Arc::new(AppState {
        store,
        engine,
        trigger,
    });
    let app = create_router(state);
    let addr = config.socket_addr()?;

    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let http_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
        .await?;

    if let Some((server, handle)) = ssh {
        server.stop();
        handle.join().await;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gitgate=info".parse()?))
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Init => run_init(&config)?,
        Commands::User { command } => match command {
            UserCommands::Add { username } => {
                let store = open_store(&config)?;
                add_user(&store, &username)?;
            }
        },
        Commands::Key { command } => match command {
            KeyCommands::Add {
                username,
                key_file,
                title,
            } => {
                let store = open_store(&config)?;
                add_key(&store, &username, &key_file, title)?;
            }
        },
        Commands::Repo { command } => {
            let store = open_store(&config)?;
            match command {
                RepoCommands::Create {
                    repo,
                    public,
                    default_branch,
                } => create_repo(&config, &store, &repo, public, &default_branch).await?,
                RepoCommands::Grant {
                    repo,
                    username,
                    permission,
                } => grant(&store, &repo, &username, &permission)?,
            }
        }
        Commands::Reindex { repo } => {
            let store = open_store(&config)?;
            reindex(&config, &store, &repo)?;
        }
        Commands::Log {
            repo,
            git_ref,
            limit,
        } => {
            let store = open_store(&config)?;
            show_log(&store, &repo, &git_ref, limit)?;
        }
        Commands::Search { repo, query, limit } => {
            let store = open_store(&config)?;
            search(&store, &repo, &query, limit)?;
        }
        Commands::Serve {
            host,
            port,
            ssh_port,
        } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(ssh_port) = ssh_port {
                config.ssh_port = ssh_port;
            }
            config.validate()?;
            serve(config).await?;
        }
    }

    Ok(())
}

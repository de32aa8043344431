mod commands;
mod session;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use console_core::ConsoleError;
use console_core::config::{ConsoleConfig, ConsoleSettings};

use session::Session;

#[derive(Parser)]
#[command(name = "etcd-console")]
#[command(about = "Operational console for etcd clusters")]
#[command(version)]
struct Cli {
    /// Path to the config file (default: ~/.etcd-console/console.toml)
    #[arg(long, global = true, env = "ETCD_CONSOLE_CONFIG")]
    config: Option<PathBuf>,

    /// Comma separated etcd endpoints
    #[arg(long, global = true, env = "ETCD_CONSOLE_ENDPOINTS")]
    endpoints: Option<String>,

    /// Directory holding the backup archives
    #[arg(long, global = true, env = "ETCD_CONSOLE_BACKUP_DIR")]
    backup_dir: Option<PathBuf>,

    /// Log level for the console crates (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "ETCD_CONSOLE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Per-call timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config file seeded from the global flags
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Show the cluster version and the client generation in use
    Version,

    /// Show the status of every cluster member
    Status,

    /// Read a key or a range of keys
    Get {
        key: String,
        #[arg(long)]
        prefix: bool,
        #[arg(long)]
        from_key: bool,
        #[arg(long)]
        range_end: Option<String>,
        #[arg(long)]
        limit: Option<String>,
        #[arg(long)]
        rev: Option<String>,
        /// NONE, ASCEND or DESCEND
        #[arg(long)]
        sort_order: Option<String>,
        /// KEY, CREATE, MODIFY, VALUE or VERSION
        #[arg(long)]
        sort_target: Option<String>,
        /// l (linearizable) or s (serializable)
        #[arg(long)]
        consistency: Option<String>,
        #[arg(long)]
        keys_only: bool,
    },

    /// Write a key
    Put {
        key: String,
        #[arg(default_value = "")]
        value: String,
        /// Lease ID in hex (v3)
        #[arg(long)]
        lease: Option<String>,
        #[arg(long)]
        prev_kv: bool,
        #[arg(long)]
        ignore_value: bool,
        #[arg(long)]
        ignore_lease: bool,
        /// Key TTL in seconds (v2)
        #[arg(long)]
        ttl: Option<u64>,
        #[arg(long)]
        prev_value: Option<String>,
        #[arg(long)]
        prev_index: Option<u64>,
    },

    /// Delete a key or a range of keys
    Del {
        key: String,
        #[arg(long)]
        prefix: bool,
        #[arg(long)]
        from_key: bool,
        #[arg(long)]
        range_end: Option<String>,
        #[arg(long)]
        prev_kv: bool,
        #[arg(long)]
        dir: bool,
        #[arg(long)]
        recursive: bool,
        #[arg(long)]
        prev_value: Option<String>,
        #[arg(long)]
        prev_index: Option<u64>,
    },

    /// List a directory (v2 clusters)
    Ls {
        key: Option<String>,
        #[arg(long)]
        recursive: bool,
        #[arg(long)]
        sort: bool,
        #[arg(long)]
        quorum: bool,
        /// Append '/' to directories
        #[arg(short = 'p', long)]
        fill_path: bool,
    },

    /// Lease management (v3 clusters)
    Lease {
        #[command(subcommand)]
        command: LeaseCommands,
    },

    /// Snapshot backups
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
}

#[derive(Subcommand)]
enum LeaseCommands {
    /// Grant a lease with a TTL in seconds
    Grant { ttl: i64 },
    /// Revoke a lease and delete its keys
    Revoke { id: String },
    /// Show the remaining TTL of a lease
    Ttl {
        id: String,
        /// Also list the keys attached to the lease
        #[arg(long)]
        keys: bool,
    },
    /// Keep a lease alive until interrupted
    KeepAlive {
        id: String,
        /// Refresh once and exit
        #[arg(long)]
        once: bool,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// List backups, newest first
    List,
    /// Take a snapshot and store it as a new backup
    Create,
    /// Delete a backup
    Delete { name: String },
    /// Copy a backup archive out of the catalog
    Download {
        name: String,
        /// Destination file (default: ./<name>)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

/// Crates whose log level follows `--log-level`.
const LOG_TARGETS: [&str; 4] = [
    "console_core",
    "console_client",
    "console_cluster",
    "console_cli",
];

fn config_path(cli: &Cli) -> anyhow::Result<PathBuf> {
    Ok(match cli.config {
        Some(ref path) => path.clone(),
        None => ConsoleConfig::default_path(&ConsoleConfig::default_base_dir()?),
    })
}

fn load_config(cli: &Cli) -> anyhow::Result<ConsoleConfig> {
    let mut config = match ConsoleConfig::load(&config_path(cli)?) {
        Ok(config) => config,
        Err(ConsoleError::ConfigNotFound(_)) if cli.config.is_none() => {
            ConsoleConfig::default_config()
        }
        Err(e) => return Err(e.into()),
    };
    apply_overrides(cli, &mut config);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(cli: &Cli, config: &mut ConsoleConfig) {
    if let Some(ref raw) = cli.endpoints {
        config.console.endpoints = ConsoleSettings::parse_endpoints(raw);
    }
    if let Some(ref dir) = cli.backup_dir {
        config.console.backup_dir = dir.display().to_string();
    }
    if let Some(ref level) = cli.log_level {
        config.console.log_level = level.clone();
    }
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for target in LOG_TARGETS {
        filter = filter.add_directive(format!("{target}={level}").parse()?);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Commands::Init { force } = cli.command {
        let mut config = ConsoleConfig::default_config();
        apply_overrides(&cli, &mut config);
        return commands::init::run(&config_path(&cli)?, &config, force);
    }

    let config = load_config(&cli)?;
    init_logging(&config.console.log_level)?;

    std::fs::create_dir_all(&config.console.backup_dir)?;

    let rt = tokio::runtime::Runtime::new()?;
    let session = Session::new(config, cli.timeout.clone());

    let result = rt.block_on(async {
        session.cancel_on_interrupt();
        dispatch(cli.command, &session).await
    });

    if let Err(ref e) = result {
        tracing::error!("{e:#}");
    }
    result
}

async fn dispatch(command: Commands, session: &Session) -> anyhow::Result<()> {
    match command {
        Commands::Init { .. } => anyhow::bail!("init runs without a cluster session"),
        Commands::Version => commands::version::run(session).await,
        Commands::Status => commands::status::run(session).await,
        Commands::Get {
            key,
            prefix,
            from_key,
            range_end,
            limit,
            rev,
            sort_order,
            sort_target,
            consistency,
            keys_only,
        } => {
            let params = console_core::options::GetParams {
                prefix,
                from_key,
                range_end,
                limit,
                revision: rev,
                sort_order,
                sort_target,
                consistency,
                keys_only,
            };
            commands::kv::get(session, &key, &params).await
        }
        Commands::Put {
            key,
            value,
            lease,
            prev_kv,
            ignore_value,
            ignore_lease,
            ttl,
            prev_value,
            prev_index,
        } => {
            let opts = console_core::options::PutOptions {
                lease: console_core::types::LeaseId::from_hex(
                    lease.as_deref().unwrap_or_default(),
                )?,
                prev_kv,
                ignore_value,
                ignore_lease,
                ttl,
                prev_value,
                prev_index,
            };
            commands::kv::put(session, &key, &value, &opts).await
        }
        Commands::Del {
            key,
            prefix,
            from_key,
            range_end,
            prev_kv,
            dir,
            recursive,
            prev_value,
            prev_index,
        } => {
            let opts = console_core::options::DeleteOptions {
                prefix,
                from_key,
                range_end,
                prev_kv,
                dir,
                recursive,
                prev_value,
                prev_index,
            };
            commands::kv::del(session, &key, &opts).await
        }
        Commands::Ls {
            key,
            recursive,
            sort,
            quorum,
            fill_path,
        } => {
            let opts = console_core::options::ListOptions {
                recursive,
                sorted: sort,
                quorum,
                fill_path,
            };
            commands::kv::ls(session, key.as_deref().unwrap_or_default(), opts).await
        }
        Commands::Lease { command } => match command {
            LeaseCommands::Grant { ttl } => commands::lease::grant(session, ttl).await,
            LeaseCommands::Revoke { id } => commands::lease::revoke(session, &id).await,
            LeaseCommands::Ttl { id, keys } => {
                commands::lease::time_to_live(session, &id, keys).await
            }
            LeaseCommands::KeepAlive { id, once } => {
                commands::lease::keep_alive(session, &id, once).await
            }
        },
        Commands::Backup { command } => match command {
            BackupCommands::List => commands::backup::list(session).await,
            BackupCommands::Create => commands::backup::create(session).await,
            BackupCommands::Delete { name } => commands::backup::delete(session, &name).await,
            BackupCommands::Download { name, output } => {
                commands::backup::download(session, &name, output).await
            }
        },
    }
}

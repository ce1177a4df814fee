use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use docsync_core::core_store::{Database, DEFAULT_BRANCH, GLOBAL_SCOPE};
use docsync_core::core_sync::{ChannelConfig, RemoteFilter};
use docsync_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use docsync_core::Config;
use std::path::PathBuf;
use tracing::info;

mod commands;
mod model;

use commands::NewRemote;

#[derive(Parser, Debug)]
#[command(name = "docsync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Set the log level (trace, debug, info, warn, error); defaults to the config file's
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// TOML config file; without one, DOCSYNC_* environment variables apply
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database file, overriding storage.database_path
    #[arg(short, long)]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a document
    Create {
        #[arg(short = 't', long = "type", default_value = model::JSON_TYPE)]
        document_type: String,
        /// Document id; generated when omitted
        #[arg(long)]
        id: Option<String>,
    },
    /// Dispatch one action to a document
    Apply {
        document_id: String,
        /// Action type, e.g. SET, UNSET or MERGE
        action: String,
        /// Action input as JSON
        #[arg(default_value = "{}")]
        input: String,
        #[arg(short, long, default_value = GLOBAL_SCOPE)]
        scope: String,
        #[arg(short, long, default_value = DEFAULT_BRANCH)]
        branch: String,
    },
    /// Print a document's state
    Get {
        document_id: String,
        #[arg(short, long)]
        scope: Vec<String>,
        #[arg(short, long, default_value = DEFAULT_BRANCH)]
        branch: String,
    },
    /// Print a document's operations per scope
    Ops {
        document_id: String,
        #[arg(short, long)]
        scope: Vec<String>,
        #[arg(short, long, default_value = DEFAULT_BRANCH)]
        branch: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List document ids of one type
    Find {
        #[arg(short = 't', long = "type", default_value = model::JSON_TYPE)]
        document_type: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Mark a document deleted
    Delete { document_id: String },
    /// Manage sync remotes
    Remote {
        #[command(subcommand)]
        command: RemoteCommand,
    },
    /// Print the persisted inbox and outbox cursors of a remote
    Cursors { remote: String },
    /// Print the default configuration as TOML
    Config,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ChannelKind {
    Internal,
    Polling,
    Polled,
}

#[derive(Subcommand, Debug)]
enum RemoteCommand {
    List,
    Add {
        name: String,
        #[arg(long, value_enum, default_value = "polling")]
        channel: ChannelKind,
        /// Endpoint of a polling channel
        #[arg(long)]
        url: Option<String>,
        /// Peer channel id of an internal channel
        #[arg(long)]
        peer: Option<String>,
        #[arg(long, default_value = "default")]
        collection: String,
        /// Only sync these documents (repeatable)
        #[arg(long = "document")]
        documents: Vec<String>,
        /// Only sync these scopes (repeatable)
        #[arg(long = "scope")]
        scopes: Vec<String>,
        #[arg(long, default_value = "")]
        branch: String,
        /// Skip operations at or before this timestamp when backfilling
        #[arg(long)]
        since: Option<u64>,
    },
    Remove {
        name: String,
    },
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::from_env()?,
    };
    if let Some(database) = &args.database {
        config.storage.database_path = PathBuf::from(shellexpand::tilde(database).into_owned());
    }
    config.validate()?;
    Ok(config)
}

fn log_config(args: &Args, config: &Config) -> Result<LogConfig> {
    let log_config = match &args.log_level {
        Some(level) => {
            let level = level.parse::<LogLevel>().unwrap_or_else(|e| {
                eprintln!("{}, using 'info'", e);
                LogLevel::Info
            });
            LogConfig::new(level).with_target(config.logging.with_target)
        }
        None => LogConfig::from_settings(&config.logging)?,
    };
    Ok(log_config.json_format(args.json_logs || config.logging.json_format))
}

fn channel_config(kind: ChannelKind, url: Option<String>, peer: Option<String>, config: &Config) -> Result<ChannelConfig> {
    Ok(match kind {
        ChannelKind::Polling => match url {
            Some(url) => ChannelConfig::polling(url, &config.sync),
            None => bail!("a polling remote needs --url"),
        },
        ChannelKind::Internal => match peer {
            Some(peer) => ChannelConfig::internal(peer),
            None => bail!("an internal remote needs --peer"),
        },
        ChannelKind::Polled => ChannelConfig::Polled,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging_with_config(log_config(&args, &config)?)?;

    match args.command {
        Command::Config => {
            print!("{}", toml::to_string_pretty(&Config::default())?);
        }
        Command::Remote { command } => {
            let db = Database::open(&config.storage.database_path, 1)?;
            match command {
                RemoteCommand::List => commands::print_json(&commands::list_remotes(&db).await?)?,
                RemoteCommand::Add {
                    name,
                    channel,
                    url,
                    peer,
                    collection,
                    documents,
                    scopes,
                    branch,
                    since,
                } => {
                    let remote = NewRemote {
                        name,
                        collection_id: collection,
                        channel: channel_config(channel, url, peer, &config)?,
                        filter: RemoteFilter {
                            document_id: documents,
                            scope: scopes,
                            branch,
                        },
                        since_timestamp_utc_ms: since,
                    };
                    commands::print_json(&commands::add_remote(&db, remote).await?)?;
                }
                RemoteCommand::Remove { name } => commands::remove_remote(&db, &name).await?,
            }
        }
        Command::Cursors { remote } => {
            let db = Database::open(&config.storage.database_path, 1)?;
            commands::cursors(&db, &remote).await?;
        }
        command => {
            let reactor = commands::open_reactor(&config).await?;
            let result = run_document_command(&reactor, command).await;
            reactor.kill().await;
            result?;
        }
    }

    info!("docsync finished");
    Ok(())
}

async fn run_document_command(reactor: &docsync_core::Reactor, command: Command) -> Result<()> {
    match command {
        Command::Create { document_type, id } => {
            let id = commands::create(reactor, &document_type, id.as_deref()).await?;
            println!("{}", id);
        }
        Command::Apply {
            document_id,
            action,
            input,
            scope,
            branch,
        } => {
            let info = commands::apply(reactor, &document_id, &branch, &scope, &action, &input).await?;
            commands::print_json(&info)?;
        }
        Command::Get {
            document_id,
            scope,
            branch,
        } => commands::show(reactor, &document_id, &commands::view_filter(&branch, scope)).await?,
        Command::Ops {
            document_id,
            scope,
            branch,
            limit,
        } => commands::operations(reactor, &document_id, &commands::view_filter(&branch, scope), limit).await?,
        Command::Find { document_type, limit } => commands::find(reactor, &document_type, limit).await?,
        Command::Delete { document_id } => commands::delete(reactor, &document_id).await?,
        Command::Remote { .. } | Command::Cursors { .. } | Command::Config => {}
    }
    Ok(())
}

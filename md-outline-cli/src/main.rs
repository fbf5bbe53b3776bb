use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use md_outline::{
    BackupStore, Config, ConflictChoice, DirBackend, HttpPromptStore, NodeKind, RemoteError,
    RemoteStore, SaveReport, Session, SessionError, Tree,
};
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_BACKUP_DIR: &str = ".md-outline/backups";

#[derive(Parser)]
#[command(name = "md-outline", author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./md-outline.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding local backups
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prints the section outline of a markdown file
    Outline {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Rewrites a markdown file in canonical outline form
    Format {
        file: PathBuf,
        /// Write the result back instead of printing it
        #[arg(long)]
        write: bool,
    },
    /// Inspects and maintains local backups
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },
    /// Talks to the remote prompt store
    Remote {
        #[command(subcommand)]
        command: RemoteCommand,
    },
}

#[derive(Subcommand)]
enum BackupCommand {
    /// Lists live backups, newest first
    List {
        #[arg(long)]
        json: bool,
    },
    /// Prints the backed-up content of a document
    Show {
        name: String,
        #[arg(long)]
        json: bool,
    },
    /// Stores a file as the backup of a document
    Save {
        name: String,
        file: PathBuf,
        /// Remote version the content was based on
        #[arg(long, default_value_t = 0)]
        version: u64,
    },
    /// Removes the backup of one document, or all backups
    Clear {
        #[arg(required_unless_present = "all")]
        name: Option<String>,
        #[arg(long, conflicts_with = "name")]
        all: bool,
    },
    /// Removes expired and unreadable backups
    Clean,
    /// Summarises stored backups
    Stats {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum RemoteCommand {
    /// Checks credentials and connectivity
    Ping,
    /// Lists remote documents, newest first
    List {
        #[arg(long)]
        json: bool,
    },
    /// Prints a document
    Get {
        name: String,
        #[arg(long, conflicts_with = "version")]
        label: Option<String>,
        #[arg(long)]
        version: Option<u64>,
    },
    /// Prints the version history of a document
    History { name: String },
    /// Saves a file as a new version of a document
    Push {
        name: String,
        file: PathBuf,
        #[arg(short, long)]
        message: Option<String>,
        /// Version the file was edited from (defaults to the version of a
        /// local backup of the document, else the latest remote version)
        #[arg(long)]
        base_version: Option<u64>,
        /// What to do when the remote moved past the loaded version
        #[arg(long, value_enum, default_value_t = OnConflict::Cancel)]
        on_conflict: OnConflict,
    },
    /// Deletes a document, keeping a tombstone version
    Delete { name: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum OnConflict {
    Overwrite,
    Refresh,
    Cancel,
}

impl From<OnConflict> for ConflictChoice {
    fn from(value: OnConflict) -> Self {
        match value {
            OnConflict::Overwrite => ConflictChoice::Overwrite,
            OnConflict::Refresh => ConflictChoice::Refresh,
            OnConflict::Cancel => ConflictChoice::Cancel,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match Config::discover(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => fail(err),
    };

    match &cli.command {
        Commands::Outline { file, json } => outline_command(&config, file, *json),
        Commands::Format { file, write } => format_command(&config, file, *write),
        Commands::Backup { command } => {
            let store = backup_store(&cli, &config);
            backup_command(&store, command);
        }
        Commands::Remote { command } => remote_command(&cli, &config, command),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn fail(err: impl Display) -> ! {
    eprintln!("Error: {err}");
    std::process::exit(1);
}

fn read_file(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => fail(format_args!("{}: {err}", path.display())),
    }
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(err) => fail(err),
    }
}

fn document_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn parse_file(config: &Config, file: &Path) -> Tree {
    let text = read_file(file);
    md_outline::Parser::parse_with_config(&text, &document_name(file), &config.codec()).into_tree()
}

fn outline_command(config: &Config, file: &Path, json: bool) {
    let tree = parse_file(config, file);
    if json {
        print_json(&tree.outline());
        return;
    }
    for node in tree.iter() {
        match node.kind() {
            NodeKind::Root => {}
            NodeKind::Frontmatter => println!("---"),
            NodeKind::Section => {
                let indent = "  ".repeat(node.level().saturating_sub(1) as usize);
                println!("{indent}- {}", node.title());
            }
        }
    }
}

fn format_command(config: &Config, file: &Path, write: bool) {
    let markdown = parse_file(config, file).serialize(&config.codec());
    if !write {
        print!("{markdown}");
        return;
    }
    if let Err(err) = fs::write(file, markdown) {
        fail(format_args!("{}: {err}", file.display()));
    }
    println!("Formatted {}", file.display());
}

fn backup_store(cli: &Cli, config: &Config) -> BackupStore {
    let dir = cli
        .backup_dir
        .clone()
        .or_else(|| config.backup.dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKUP_DIR));
    match DirBackend::open(&dir) {
        Ok(backend) => BackupStore::new(backend).with_expiry(config.backup.expiry()),
        Err(err) => fail(format_args!("{}: {err}", dir.display())),
    }
}

fn backup_command(store: &BackupStore, command: &BackupCommand) {
    match command {
        BackupCommand::List { json } => {
            let entries = store.list_all();
            if *json {
                print_json(&serde_json::json!({ "backups": entries }));
            } else if entries.is_empty() {
                println!("No backups.");
            } else {
                for entry in entries {
                    println!(
                        "{}\tv{}\t{}",
                        entry.name, entry.record.version, entry.record.timestamp
                    );
                }
            }
        }
        BackupCommand::Show { name, json } => {
            let Some(record) = store.get(name) else {
                fail(format_args!("no backup for {name}"));
            };
            if *json {
                print_json(&record);
            } else {
                print!("{}", record.content);
            }
        }
        BackupCommand::Save {
            name,
            file,
            version,
        } => {
            let content = read_file(file);
            store.save(name, &content, *version);
            if store.get(name).is_none() {
                fail(format_args!("backup for {name} was not written"));
            }
            println!("Saved backup for {name}");
        }
        BackupCommand::Clear { name, all } => {
            if *all {
                println!("Cleared {} backups", store.clear_all());
            } else if let Some(name) = name {
                store.clear(name);
                println!("Cleared backup for {name}");
            }
        }
        BackupCommand::Clean => {
            println!("Removed {} expired backups", store.clean_expired());
        }
        BackupCommand::Stats { json } => {
            let stats = store.stats();
            if *json {
                print_json(&stats);
            } else {
                println!("count: {}", stats.count);
                println!("bytes: {}", stats.total_bytes);
                if let (Some(oldest), Some(newest)) = (stats.oldest, stats.newest) {
                    println!("oldest: {oldest}");
                    println!("newest: {newest}");
                }
            }
        }
    }
}

fn remote_command(cli: &Cli, config: &Config, command: &RemoteCommand) {
    let store = match HttpPromptStore::new(config.remote.clone()) {
        Ok(store) => Arc::new(store),
        Err(err) => fail(err),
    };
    if !store.config().is_configured() {
        fail(RemoteError::NotConfigured);
    }

    if let RemoteCommand::Ping = command {
        if store.test_connection() {
            println!("Connected to {}", store.config().base_url);
            return;
        }
        fail(format_args!("cannot reach {}", store.config().base_url));
    }

    let mut session = Session::from_config(config, store.clone(), backup_store(cli, config))
        .with_autosave_interval(None);

    match command {
        RemoteCommand::Ping => {}
        RemoteCommand::List { json } => {
            let items = match session.list_documents() {
                Ok(items) => items,
                Err(err) => fail(err),
            };
            if *json {
                print_json(&serde_json::json!({ "documents": items }));
            } else if items.is_empty() {
                println!("No documents.");
            } else {
                for item in items {
                    println!("{}\tv{}\t{}", item.name, item.version, item.last_updated);
                }
            }
        }
        RemoteCommand::Get {
            name,
            label,
            version,
        } => {
            let label = match version {
                Some(_) => None,
                None => Some(label.as_deref().unwrap_or(&config.remote.default_label)),
            };
            match store.get_prompt(name, label, *version) {
                Ok(prompt) => print!("{}", prompt.content),
                Err(err) => fail(err),
            }
        }
        RemoteCommand::History { name } => {
            let versions = session.history(name);
            if versions.is_empty() {
                println!("No history for {name}");
            }
            for version in versions {
                println!(
                    "v{}\t{}\t{}",
                    version.version, version.timestamp, version.commit_message
                );
            }
        }
        RemoteCommand::Push {
            name,
            file,
            message,
            base_version,
            on_conflict,
        } => push_command(
            &mut session,
            name,
            file,
            message.as_deref(),
            *base_version,
            *on_conflict,
        ),
        RemoteCommand::Delete { name } => {
            if !session.delete(name) {
                fail(format_args!("could not delete {name}"));
            }
            println!("Deleted {name}");
        }
    }
}

fn push_command(
    session: &mut Session,
    name: &str,
    file: &Path,
    message: Option<&str>,
    base_version: Option<u64>,
    on_conflict: OnConflict,
) {
    let content = read_file(file);
    match session.open(name) {
        Ok(opened) => {
            let base = base_version
                .or(opened.backup.map(|backup| backup.version))
                .unwrap_or(opened.version);
            if let Err(err) = session
                .set_content(content)
                .and_then(|()| session.set_base_version(base))
            {
                fail(err);
            }
            tracing::info!(document = name, base, latest = opened.version, "pushing local edits");
        }
        Err(SessionError::Remote(RemoteError::NotFound(_))) => session.create(name, &content),
        Err(err) => fail(err),
    }

    if !session.is_dirty() {
        println!("{name} is unchanged at version {}", session.version());
        return;
    }

    let mut choice = ConflictChoice::from(on_conflict);
    match session.save(message, &mut choice) {
        Ok(SaveReport::Saved { version }) => println!("Saved {name} as version {version}"),
        Ok(SaveReport::Refreshed { version }) => {
            println!("Remote is at version {version}; local changes were not pushed");
            std::process::exit(2);
        }
        Ok(SaveReport::Cancelled) => {
            println!("Save cancelled: remote has a newer version");
            std::process::exit(2);
        }
        Err(err) => fail(err),
    }
    session.close();
}

//! # dedupfs CLI
//!
//! Command-line access to a deduplicating storage root.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dedupfs_cas::{BackendKind, HashAlgorithm};
use dedupfs_config::Config;
use dedupfs_engine::{MetaStorage, StatsReporter};
use dedupfs_index::{join, Stat};

mod transfer;

/// dedupfs - content-addressed, deduplicating block storage
#[derive(Parser)]
#[command(name = "dedupfs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Storage root directory
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Persistence backend used by `init` (files, lmdb, sqlite)
    #[arg(long, global = true, value_parser = parse_backend)]
    backend: Option<BackendKind>,

    /// Block size in bytes used by `init`
    #[arg(long, global = true)]
    blocksize: Option<usize>,

    /// Hash algorithm used by `init` (sha1, sha256, blake3)
    #[arg(long, global = true, value_parser = parse_hash)]
    hash: Option<HashAlgorithm>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a storage root, or check an existing one against the settings
    Init,

    /// Copy a host file or directory into the storage root
    Import {
        #[arg(value_name = "HOST_PATH")]
        source: PathBuf,

        #[arg(value_name = "PATH", default_value = "/")]
        dest: String,
    },

    /// Copy a stored file or directory out to the host
    Export {
        #[arg(value_name = "PATH")]
        source: String,

        #[arg(value_name = "HOST_PATH")]
        dest: PathBuf,
    },

    /// Write a stored file to stdout
    Cat {
        #[arg(value_name = "PATH")]
        path: String,
    },

    /// List a directory
    Ls {
        #[arg(value_name = "PATH", default_value = "/")]
        path: String,

        /// Show mode, size and modification time
        #[arg(short, long)]
        long: bool,
    },

    Mkdir {
        #[arg(value_name = "PATH")]
        path: String,

        /// Create missing parents
        #[arg(short, long)]
        parents: bool,
    },

    /// Remove a file
    Rm {
        #[arg(value_name = "PATH")]
        path: String,
    },

    /// Remove an empty directory
    Rmdir {
        #[arg(value_name = "PATH")]
        path: String,
    },

    /// Move or rename an entry
    Mv {
        #[arg(value_name = "FROM")]
        from: String,

        #[arg(value_name = "TO")]
        to: String,
    },

    /// Show the attributes of an entry
    Stat {
        #[arg(value_name = "PATH")]
        path: String,

        #[arg(long)]
        json: bool,
    },

    /// Change permission bits (octal)
    Chmod {
        #[arg(value_name = "MODE", value_parser = parse_octal)]
        mode: u32,

        #[arg(value_name = "PATH")]
        path: String,
    },

    /// Show store statistics
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Check every store for consistency
    Verify {
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file locations
    Path,
    /// Print a default config file
    Init,
}

fn parse_backend(s: &str) -> std::result::Result<BackendKind, String> {
    s.parse().map_err(|e: dedupfs_cas::CasError| e.to_string())
}

fn parse_hash(s: &str) -> std::result::Result<HashAlgorithm, String> {
    s.parse().map_err(|e: dedupfs_cas::CasError| e.to_string())
}

fn parse_octal(s: &str) -> std::result::Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8).map_err(|e| format!("{s}: {e}"))
}

fn main() -> Result<()> {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let cli = Cli::parse();

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("warning: ignoring unreadable config: {e}");
            Config::default()
        }
    };
    dedupfs_config::init_logging(config.logging.level.raised_by(cli.verbose));

    if let Some(root) = cli.root {
        config.storage.root = root;
    }
    if let Some(backend) = cli.backend {
        config.storage.backend = backend;
    }
    if let Some(blocksize) = cli.blocksize {
        config.storage.blocksize = blocksize;
    }
    if let Some(hash) = cli.hash {
        config.storage.hash = hash;
    }
    config.storage.validate()?;

    run(cli.command, &config)
}

fn run(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Init => cmd_init(config),
        Commands::Config { command } => cmd_config(command, config),
        command => {
            let storage = Arc::new(open_storage(config)?);
            let result = dispatch(command, &storage, config);
            match Arc::try_unwrap(storage) {
                Ok(storage) => storage.shutdown()?,
                Err(shared) => shared.flush()?,
            }
            result
        }
    }
}

fn open_storage(config: &Config) -> Result<MetaStorage> {
    MetaStorage::open_existing(&config.storage).with_context(|| {
        format!(
            "No storage root at {} (run `dedupfs init` first)",
            config.storage.root.display()
        )
    })
}

fn dispatch(command: Commands, storage: &Arc<MetaStorage>, config: &Config) -> Result<()> {
    match command {
        Commands::Init | Commands::Config { .. } => bail!("command does not take an open root"),
        Commands::Import { source, dest } => cmd_import(storage, config, &source, &dest),
        Commands::Export { source, dest } => {
            let summary = transfer::export(storage, &source, &dest)?;
            println!(
                "✅ Exported {} files ({} bytes) to {}",
                summary.files,
                summary.bytes,
                dest.display()
            );
            Ok(())
        }
        Commands::Cat { path } => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            transfer::cat(storage, &path, &mut out)?;
            out.flush()?;
            Ok(())
        }
        Commands::Ls { path, long } => cmd_ls(storage, &path, long),
        Commands::Mkdir { path, parents } => {
            if parents {
                mkdir_parents(storage, &path)
            } else {
                storage.mkdir(&path, 0o755)?;
                Ok(())
            }
        }
        Commands::Rm { path } => Ok(storage.unlink(&path)?),
        Commands::Rmdir { path } => Ok(storage.rmdir(&path)?),
        Commands::Mv { from, to } => {
            let to = if storage.exists(&to)? && storage.getattr(&to)?.is_dir() {
                join(&to, dedupfs_index::basename(&from))
            } else {
                to
            };
            Ok(storage.rename(&from, &to)?)
        }
        Commands::Stat { path, json } => {
            let stat = storage.getattr(&path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stat)?);
            } else {
                print_stat(&path, &stat);
            }
            Ok(())
        }
        Commands::Chmod { mode, path } => Ok(storage.chmod(&path, mode)?),
        Commands::Stats { json } => cmd_stats(storage, json),
        Commands::Verify { json } => cmd_verify(storage, json),
    }
}

fn cmd_init(config: &Config) -> Result<()> {
    let storage = MetaStorage::open(&config.storage)?;
    let settings = storage.settings().clone();
    storage.shutdown()?;
    println!("Initialized dedupfs root in {}", config.storage.root.display());
    println!("  backend:   {}", settings.backend);
    println!("  blocksize: {}", settings.blocksize);
    println!("  hash:      {}", settings.hash);
    Ok(())
}

fn cmd_config(command: ConfigCommands, config: &Config) -> Result<()> {
    match command {
        ConfigCommands::Show => print!("{}", toml::to_string_pretty(config)?),
        ConfigCommands::Path => {
            match Config::global_config_path() {
                Some(path) => println!("Global:  {}", path.display()),
                None => println!("Global:  (no home directory)"),
            }
            println!("Project: {}", Config::project_config_path().display());
        }
        ConfigCommands::Init => print!("{}", Config::default_toml()),
    }
    Ok(())
}

fn cmd_import(
    storage: &Arc<MetaStorage>,
    config: &Config,
    source: &Path,
    dest: &str,
) -> Result<()> {
    let reporter = if config.stats.enabled {
        Some(StatsReporter::spawn(
            storage.clone(),
            Duration::from_secs(config.stats.interval_secs.max(1)),
        )?)
    } else {
        None
    };

    let result = transfer::import(storage, source, dest);
    if let Some(reporter) = reporter {
        reporter.stop();
    }
    let summary = result?;

    let stats = storage.snapshot_stats()?;
    println!(
        "\n✅ Import Complete: {} files, {} directories, {} bytes",
        summary.files, summary.directories, summary.bytes
    );
    if summary.skipped > 0 {
        println!("⚠️  Skipped {} non-regular files", summary.skipped);
    }
    println!(
        "📦 Store: {} unique blocks, {} references ({:.2}x)",
        stats.blocks.block_count,
        stats.blocks.total_references,
        stats.dedup_ratio()
    );
    Ok(())
}

fn mkdir_parents(storage: &MetaStorage, path: &str) -> Result<()> {
    let mut current = String::from("/");
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current = join(&current, part);
        if storage.exists(&current)? {
            if !storage.getattr(&current)?.is_dir() {
                bail!("{current} exists and is not a directory");
            }
            continue;
        }
        storage.mkdir(&current, 0o755)?;
    }
    Ok(())
}

fn cmd_ls(storage: &MetaStorage, path: &str, long: bool) -> Result<()> {
    let stat = storage.getattr(path)?;
    let mut names = if stat.is_dir() {
        storage.readdir(path)?
    } else {
        vec![dedupfs_index::basename(path).to_string()]
    };
    names.sort();

    for name in names {
        if !long {
            println!("{name}");
            continue;
        }
        let child = if stat.is_dir() {
            storage.getattr(&join(path, &name))?
        } else {
            stat
        };
        println!(
            "{} {:>5} {:>5} {:>12} {:>12} {}",
            mode_string(&child),
            child.uid,
            child.gid,
            child.size,
            child.mtime,
            name
        );
    }
    Ok(())
}

fn print_stat(path: &str, stat: &Stat) {
    println!("  Path:   {path}");
    println!("  Type:   {}", if stat.is_dir() { "directory" } else { "regular file" });
    println!("  Mode:   {:04o} ({})", stat.perm(), mode_string(stat));
    println!("  Size:   {}", stat.size);
    println!("  Links:  {}", stat.nlink);
    println!("  Owner:  {}:{}", stat.uid, stat.gid);
    println!("  Access: {}", stat.atime);
    println!("  Modify: {}", stat.mtime);
    println!("  Change: {}", stat.ctime);
}

/// `ls -l` style mode column.
fn mode_string(stat: &Stat) -> String {
    let mut s = String::with_capacity(10);
    s.push(if stat.is_dir() { 'd' } else { '-' });
    let perm = stat.perm();
    for shift in [6, 3, 0] {
        let bits = (perm >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    s
}

fn cmd_stats(storage: &MetaStorage, json: bool) -> Result<()> {
    let stats = storage.snapshot_stats()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    let settings = storage.settings();
    println!();
    println!("  dedupfs root: {}", storage.root().display());
    println!(
        "  backend {} | blocksize {} | hash {}",
        settings.backend, settings.blocksize, settings.hash
    );
    println!();
    println!("  Blocks:     {} unique", stats.blocks.block_count);
    println!("  Block refs: {}", stats.blocks.total_references);
    println!("  Stored:     {} bytes", stats.blocks.stored_bytes);
    println!("  Dedup:      {:.2}x", stats.dedup_ratio());
    println!("  Files:      {} distinct", stats.files.file_count);
    println!("  File refs:  {}", stats.files.total_references);
    println!("  Paths:      {}", stats.paths);
    Ok(())
}

fn cmd_verify(storage: &MetaStorage, json: bool) -> Result<()> {
    let report = storage.verify()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Checked {} blocks, {} files, {} paths",
            report.blocks_checked, report.files_checked, report.paths_checked
        );
        for issue in &report.issues {
            println!("  ❌ {issue}");
        }
    }
    if !report.is_clean() {
        bail!("{} integrity issues found", report.issues.len());
    }
    if !json {
        println!("✅ Storage root is consistent");
    }
    Ok(())
}

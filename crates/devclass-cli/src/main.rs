//! Devclass CLI - Main entry point
//!
//! Looks up device classes from the bundled (or a configured) descriptor and
//! keeps label snapshots in a digest-verified persistent map.

mod config;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use devclass_core::taxonomy::parse_number;
use devclass_core::{digest_file, DeviceTaxonomy, DigestAlgorithm, PersistentMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "devclass")]
#[command(about = "Device class lookups and persistent label snapshots")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "devclass.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the device class tables
    Classes {
        /// Descriptor file (overrides the configured one)
        #[arg(short, long)]
        descriptor: Option<PathBuf>,
        /// Print the tables as JSON
        #[arg(long)]
        json: bool,
    },
    /// Look up the label of a generic/specific class pair
    Lookup {
        /// Generic class key (hex or decimal)
        #[arg(short, long)]
        generic: String,
        /// Specific class key (hex or decimal)
        #[arg(short, long)]
        specific: Option<String>,
        #[arg(short, long)]
        descriptor: Option<PathBuf>,
    },
    /// Store generic class labels into the persistent map
    Snapshot {
        /// Backing file (overrides the configured one)
        #[arg(long)]
        store: Option<PathBuf>,
        #[arg(short, long)]
        descriptor: Option<PathBuf>,
    },
    /// Report the state of a persistent map backing file
    Verify {
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Print the digest of a file
    Digest {
        path: PathBuf,
        /// Digest algorithm (sha256, sha512)
        #[arg(short, long)]
        algorithm: Option<String>,
    },
    /// Write a default configuration file to the --config path
    InitConfig,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    debug!("Devclass v{}", env!("CARGO_PKG_VERSION"));

    if let Command::InitConfig = args.command {
        config::save_default_config(&args.config)?;
        info!(path = %args.config.display(), "Wrote default configuration");
        return Ok(());
    }

    let config = config::load_config(&args.config)?;

    match args.command {
        Command::Classes { descriptor, json } => {
            let taxonomy = load_taxonomy(&config, descriptor.as_deref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&taxonomy)?);
            } else {
                print_classes(&taxonomy);
            }
        }
        Command::Lookup {
            generic,
            specific,
            descriptor,
        } => {
            let taxonomy = load_taxonomy(&config, descriptor.as_deref())?;
            let generic_key = parse_key(&generic)?;
            let specific_key = specific.as_deref().map(parse_key).transpose()?;
            let label = taxonomy
                .describe(generic_key, specific_key)
                .ok_or_else(|| anyhow!("Unknown generic class {}", generic))?;
            println!("{}", label);
        }
        Command::Snapshot { store, descriptor } => {
            let taxonomy = load_taxonomy(&config, descriptor.as_deref())?;
            let path = store.or(config.store.path.clone());
            let mut map: PersistentMap<u16, String> =
                PersistentMap::bind(path.as_deref(), config.store.algorithm()?)?;

            map.extend(
                taxonomy
                    .generic
                    .values()
                    .map(|g| (g.record.key, g.record.label.clone())),
            );
            let changed = map.is_dirty();
            map.store()?;

            println!(
                "{} labels in {} ({})",
                map.len(),
                map.path().display(),
                if changed { "updated" } else { "unchanged" }
            );
            println!("{}: {}", map.algorithm(), map.digest()?);
        }
        Command::Verify { store } => {
            let path = store.or(config.store.path.clone());
            let map: PersistentMap<u16, String> =
                PersistentMap::bind(path.as_deref(), config.store.algorithm()?)?;

            println!("path:        {}", map.path().display());
            println!("entries:     {}", map.len());
            println!("dirty:       {}", map.is_dirty());
            match map.last_store_time() {
                Some(t) => println!("last store:  {}", t.to_rfc3339()),
                None => println!("last store:  never"),
            }
            println!("{:<12} {}", format!("{}:", map.algorithm()), map.digest()?);
            println!("changed:     {}", map.has_external_changes()?);
        }
        Command::Digest { path, algorithm } => {
            let algorithm = match algorithm {
                Some(name) => DigestAlgorithm::from_name(&name)?,
                None => config.store.algorithm()?,
            };
            let digest = digest_file(&path, algorithm)
                .with_context(|| format!("digesting {}", path.display()))?;
            println!("{}  {}", digest, path.display());
        }
        Command::InitConfig => {}
    }

    Ok(())
}

fn load_taxonomy(config: &Config, descriptor: Option<&Path>) -> Result<DeviceTaxonomy> {
    match descriptor.or(config.descriptor.path.as_deref()) {
        Some(path) => {
            info!(path = %path.display(), "Loading descriptor");
            DeviceTaxonomy::from_file(path).with_context(|| format!("loading {}", path.display()))
        }
        None => Ok(DeviceTaxonomy::bundled()?),
    }
}

fn parse_key(s: &str) -> Result<u16> {
    parse_number(s).ok_or_else(|| anyhow!("Invalid class key '{}'", s))
}

fn print_classes(taxonomy: &DeviceTaxonomy) {
    let summary = taxonomy.summary();
    println!(
        "{} basic, {} generic, {} specific, {} roles, {} node types, {} device types",
        summary.basic,
        summary.generic,
        summary.specific,
        summary.role,
        summary.node_type,
        summary.device_type
    );

    for generic in taxonomy.generic.values() {
        println!("0x{:02x} {}", generic.record.key, generic.record.label);
        for specific in generic.specifics.values() {
            println!("  0x{:02x} {}", specific.key, specific.label);
        }
    }
}

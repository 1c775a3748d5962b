//! CPE Mapper command-line interface

use anyhow::Result;
use clap::{Parser, Subcommand};
use cpe_mapper_core::{Config, CpeResolver, LookupRequest};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value = "info", help = "Log level (error, warn, info, debug, trace)")]
    pub log_level: String,

    #[arg(long, help = "Path to configuration file")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve one software identification to a CPE
    Lookup {
        #[arg(long)]
        name: String,
        #[arg(long)]
        publisher: Option<String>,
        #[arg(long)]
        version: Option<String>,
        #[arg(long, help = "Provenance tag, e.g. Registry")]
        source: Option<String>,
    },
    /// Resolve a JSON array of identifications, in order
    Batch {
        #[arg(long, help = "JSON file with an array of {Name, Publisher, Version} objects")]
        file: PathBuf,
    },
    /// Add or correct a mapping by hand
    Manual {
        #[arg(long)]
        name: String,
        #[arg(long)]
        cpe: String,
        #[arg(long)]
        publisher: Option<String>,
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Search stored mappings by name or CPE substring
    Search {
        query: String,
    },
    /// Show mapping database statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log_level.parse::<tracing::Level>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", args.log_level);
        tracing::Level::INFO
    });

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(args.config.as_ref())?;
    config.validate()?;
    info!("Configuration validated successfully");

    let resolver = CpeResolver::from_config(&config)?;

    match args.command {
        Command::Lookup {
            name,
            publisher,
            version,
            source,
        } => {
            let request = LookupRequest {
                name,
                publisher,
                version,
                source,
            };
            let result = resolver.lookup(&request).await?;
            print_json(&result)?;
        }
        Command::Batch { file } => {
            let contents = std::fs::read_to_string(&file)?;
            let requests: Vec<LookupRequest> = serde_json::from_str(&contents)?;
            info!("Resolving batch of {} entries from {}", requests.len(), file.display());

            let items = resolver.lookup_batch(&requests).await?;
            print_json(&items)?;
        }
        Command::Manual {
            name,
            cpe,
            publisher,
            version,
            notes,
        } => {
            let request = LookupRequest {
                name,
                publisher,
                version,
                source: None,
            };
            let outcome = resolver.manual_entry(&request, &cpe, notes).await?;
            print_json(&outcome)?;
        }
        Command::Search { query } => {
            let mappings = resolver.search_mappings(&query).await?;
            info!("Search '{}' matched {} mappings", query, mappings.len());
            print_json(&mappings)?;
        }
        Command::Stats => {
            let stats = resolver.statistics().await?;
            print_json(&stats)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(config_path) => {
            info!("Loading configuration from: {}", config_path.display());
            Config::from_file(config_path)
        }
        None => {
            // Try the default location, fall back to the default config.
            match Config::get_default_config_path() {
                Ok(default_path) if default_path.exists() => {
                    info!(
                        "Loading configuration from default location: {}",
                        default_path.display()
                    );
                    Config::from_file(&default_path)
                }
                Ok(default_path) => {
                    info!("Creating default configuration at: {}", default_path.display());
                    let mut config = Config::default();
                    config.to_file(&default_path)?;
                    config.apply_env_overrides();
                    config.resolve_paths()?;
                    Ok(config)
                }
                Err(_) => {
                    info!("Using default configuration (could not determine config directory)");
                    let mut config = Config::default();
                    config.apply_env_overrides();
                    config.resolve_paths()?;
                    Ok(config)
                }
            }
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_lookup_args_parse() {
        let args = Args::parse_from([
            "cpe-mapper",
            "lookup",
            "--name",
            "7-Zip 24.09 (x64)",
            "--publisher",
            "Igor Pavlov",
            "--version",
            "24.09",
        ]);

        match args.command {
            Command::Lookup {
                name,
                publisher,
                version,
                source,
            } => {
                assert_eq!(name, "7-Zip 24.09 (x64)");
                assert_eq!(publisher.as_deref(), Some("Igor Pavlov"));
                assert_eq!(version.as_deref(), Some("24.09"));
                assert!(source.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_batch_and_search_args_parse() {
        let args = Args::parse_from(["cpe-mapper", "batch", "--file", "apps.json"]);
        assert!(matches!(args.command, Command::Batch { .. }));

        let args = Args::parse_from(["cpe-mapper", "--log-level", "debug", "search", "7-Zip"]);
        assert_eq!(args.log_level, "debug");
        match args.command {
            Command::Search { query } => assert_eq!(query, "7-Zip"),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

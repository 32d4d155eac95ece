//! `nonspatial`: command line and HTTP server for non-spatial datasets.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Ingest, register, query and export non-spatial tabular datasets
#[derive(Parser, Debug)]
#[command(name = "nonspatial", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (looked up for .nonspatial/config.toml)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Database URL, overriding the configuration
    #[arg(short, long)]
    database: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the HTTP API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Ingest a zip archive holding one CSV file and its JSON description
    Ingest { archive: PathBuf },
    /// Register a remote PostgreSQL table from a JSON descriptor file
    Register { descriptor: PathBuf },
    /// Print one page of a dataset as JSON
    Query {
        id: i64,
        #[arg(long, default_value_t = 0)]
        start: usize,
        #[arg(long, default_value_t = nonspatial_core::query::DEFAULT_PAGE_SIZE)]
        size: usize,
        /// Exact-match filter, `column:value` (repeatable)
        #[arg(short, long)]
        filter: Vec<String>,
        /// Sort order, `column;asc` or `column;desc`
        #[arg(short, long)]
        sort: Option<String>,
    },
    /// Export a whole dataset
    Export {
        id: i64,
        /// json or csv
        #[arg(short, long, default_value = "csv")]
        format: String,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default .nonspatial/config.toml into the workspace
    Init,
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("org", "geonode", "nonspatial")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "nonspatial.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    // The database flag wins over every configuration layer.
    let overrides = match cli.database {
        Some(url) => {
            let mut config = nonspatial_core::load_config(Some(&workspace), None)
                .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
            config.database.url = url;
            Some(config)
        }
        None => None,
    };

    commands::handle_command(cli.command, &workspace, overrides.as_ref()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use nonspatial_core::config::ServiceConfig;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_query_flags() {
        let cli = Cli::parse_from([
            "nonspatial",
            "query",
            "7",
            "--size",
            "10",
            "-f",
            "name:b",
            "-f",
            "id:2",
            "--sort",
            "id;desc",
        ]);
        match cli.command {
            Commands::Query {
                id,
                size,
                start,
                filter,
                sort,
            } => {
                assert_eq!(id, 7);
                assert_eq!(size, 10);
                assert_eq!(start, 0);
                assert_eq!(filter, vec!["name:b", "id:2"]);
                assert_eq!(sort.as_deref(), Some("id;desc"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_export_defaults_to_csv() {
        let cli = Cli::parse_from(["nonspatial", "-d", "sqlite::memory:", "export", "3"]);
        assert_eq!(cli.database.as_deref(), Some("sqlite::memory:"));
        match cli.command {
            Commands::Export { format, output, .. } => {
                assert_eq!(format, "csv");
                assert!(output.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_default_config_serializes() {
        let toml_str = toml::to_string_pretty(&ServiceConfig::default()).unwrap();
        assert!(toml_str.contains("[database]"));
    }
}

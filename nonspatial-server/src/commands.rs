//! Subcommand handlers for the `nonspatial` binary.

use crate::{Commands, ConfigAction};
use nonspatial_core::config::{ServiceConfig, load_config};
use nonspatial_core::query::{parse_filters, parse_sort};
use nonspatial_core::{ExportFormat, NonSpatialService, QueryOptions};
use nonspatial_server::AppState;
use std::path::Path;

pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    overrides: Option<&ServiceConfig>,
) -> anyhow::Result<()> {
    if let Commands::Config { action } = command {
        return handle_config(action, workspace, overrides);
    }

    let mut config = load_config(Some(workspace), overrides)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    if let Commands::Serve { host, port } = &command {
        if let Some(host) = host {
            config.server.host = host.clone();
        }
        if let Some(port) = port {
            config.server.port = *port;
        }
    }

    let server_config = config.server.clone();
    let service = NonSpatialService::connect(config).await?;
    let state = AppState::new(service).await?;

    match command {
        Commands::Serve { .. } => {
            nonspatial_server::run(state, &server_config).await?;
            Ok(())
        }
        Commands::Ingest { archive } => {
            let file_name = archive
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("upload.zip")
                .to_string();
            let bytes = tokio::fs::read(&archive).await?;
            let ingestor = state.service.ingestor();
            let stored = ingestor.store_upload(&file_name, &bytes).await?;
            let params = ingestor.ingest_zipped_dataset(&stored, None).await?;
            let resource = state.resources.insert(&params).await?;
            println!("{}", serde_json::to_string_pretty(&resource)?);
            Ok(())
        }
        Commands::Register { descriptor } => {
            let text = tokio::fs::read_to_string(&descriptor).await?;
            let value: serde_json::Value = serde_json::from_str(&text)?;
            let params = state.service.registrar().register(value).await?;
            let resource = state.resources.insert(&params).await?;
            println!("{}", serde_json::to_string_pretty(&resource)?);
            Ok(())
        }
        Commands::Query {
            id,
            start,
            size,
            filter,
            sort,
        } => {
            let mut params: Vec<(String, String)> = filter
                .into_iter()
                .map(|f| ("filter".to_string(), f))
                .collect();
            if let Some(sort) = sort {
                params.push(("sort".to_string(), sort));
            }
            let options = QueryOptions {
                start,
                size,
                filters: parse_filters(&params),
                sort: parse_sort(&params),
                stable_order: false,
            };
            let resource = state.resources.get(id).await?;
            let records = state
                .service
                .query_engine()
                .query(id, &options, &resource.location())
                .await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
        Commands::Export { id, format, output } => {
            let format: ExportFormat = format.parse()?;
            let resource = state.resources.get(id).await?;
            let records = state
                .service
                .query_engine()
                .export(id, &resource.location())
                .await?;
            let body = format.encode(&records)?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, body.as_bytes()).await?;
                    println!(
                        "Exported {} rows of dataset {} to {}",
                        records.len(),
                        id,
                        path.display()
                    );
                }
                None => print!("{body}"),
            }
            Ok(())
        }
        Commands::Config { .. } => Ok(()),
    }
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    overrides: Option<&ServiceConfig>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".nonspatial");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&ServiceConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let mut config = load_config(Some(workspace), overrides)
                .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
            config.database.url = nonspatial_core::storage::redact_url(&config.database.url);
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

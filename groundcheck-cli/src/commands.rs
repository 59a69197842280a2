//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use anyhow::Context;
use groundcheck_core::config::{GroundcheckConfig, RetrieverKind, user_config_path};
use groundcheck_core::gateway::{GatewayServer, run_gateway};
use groundcheck_core::types::AnalysisRequest;
use groundcheck_core::AnalysisOrchestrator;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, config: GroundcheckConfig) -> anyhow::Result<()> {
    match command {
        Commands::Analyze {
            request,
            kb_file,
            pretty,
        } => handle_analyze(&request, kb_file, pretty, config).await,
        Commands::Serve { host, port } => handle_serve(host, port, config).await,
        Commands::Config { action } => handle_config(action, &config),
    }
}

/// Point the retriever at a local KB file.
fn use_kb_file(config: &mut GroundcheckConfig, kb_file: Option<PathBuf>) {
    if let Some(path) = kb_file {
        config.retriever.kind = RetrieverKind::Static;
        config.retriever.kb_file = Some(path);
    }
}

fn read_request(path: &Path) -> anyhow::Result<AnalysisRequest> {
    let raw = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request file {}", path.display()))?
    };
    serde_json::from_str(&raw).context("Request is not a valid analysis request")
}

async fn handle_analyze(
    request: &Path,
    kb_file: Option<PathBuf>,
    pretty: bool,
    mut config: GroundcheckConfig,
) -> anyhow::Result<()> {
    use_kb_file(&mut config, kb_file);
    let request = read_request(request)?;
    let orchestrator = AnalysisOrchestrator::from_config(&config)?;

    let result = orchestrator.analyze(&request).await?;
    let output = if pretty {
        serde_json::to_string_pretty(&result)?
    } else {
        serde_json::to_string(&result)?
    };
    println!("{}", output);
    Ok(())
}

async fn handle_serve(
    host: Option<String>,
    port: Option<u16>,
    mut config: GroundcheckConfig,
) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let orchestrator = AnalysisOrchestrator::from_config(&config)?;
    let gateway = Arc::new(GatewayServer::new(config.server.clone(), orchestrator));

    tokio::select! {
        result = run_gateway(gateway) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

/// Write the default configuration, leaving an existing file alone.
pub fn init_config(path: Option<&Path>) -> anyhow::Result<()> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => user_config_path()
            .ok_or_else(|| anyhow::anyhow!("Could not determine the user config directory"))?,
    };
    if config_path.exists() {
        println!(
            "Configuration file already exists at: {}",
            config_path.display()
        );
        return Ok(());
    }
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(&GroundcheckConfig::default())?;
    std::fs::write(&config_path, &toml_str)?;
    println!(
        "Created default configuration at: {}",
        config_path.display()
    );
    Ok(())
}

fn handle_config(action: ConfigAction, config: &GroundcheckConfig) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { path } => init_config(path.as_deref()),
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(config)?;
            println!("{}", toml_str);
            Ok(())
        }
        ConfigAction::Validate => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings ({}):", warnings.len());
                for warning in &warnings {
                    println!("  {}", warning);
                }
            }
            Ok(())
        }
    }
}

use anyhow::Result;
use tracing::info;

use super::cert;
use super::config::{check_config, expand_path, load_run_config};
use super::template;
use crate::server;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Run { config, port } => {
            if let Some(path) = config {
                info!("Loading proxy configuration from: {}", path);
            } else {
                info!("No configuration file given, using defaults");
            }
            let config = load_run_config(config.as_deref(), *port)?;
            server::run_server(config).await?;
        }
        Commands::Ca {
            cert_out,
            key_out,
            common_name,
            days,
        } => {
            cert::generate_root_ca(cert_out, key_out, common_name, *days)?;
        }
        Commands::Check { config } => {
            let config_path = expand_path(config)?;
            check_config(&config_path)?;
        }
        Commands::Template { output } => {
            template::generate_config_template(output.as_deref())?;
        }
    }

    Ok(())
}

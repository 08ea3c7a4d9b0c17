use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tls-intercept")]
#[command(author, version, about = "Transparent TLS-intercepting proxy", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes priority
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the intercepting proxy
    Run {
        /// Configuration file; built-in defaults apply when omitted
        #[arg(short, long)]
        config: Option<String>,

        /// Override proxy.bind_port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Generate a root CA for signing forged certificates
    Ca {
        /// Output path for the CA certificate (PEM)
        #[arg(long, value_name = "PATH")]
        cert_out: String,

        /// Output path for the CA private key (PEM)
        #[arg(long, value_name = "PATH")]
        key_out: String,

        /// Common Name of the CA
        #[arg(long, default_value = "TLS Intercept Root CA")]
        common_name: String,

        /// Validity in days
        #[arg(long, default_value_t = 3650)]
        days: u32,
    },
    /// Check a configuration file
    Check {
        /// Configuration file path
        #[arg(short, long)]
        config: String,
    },
    /// Print or write the annotated configuration template
    Template {
        /// Output file path (stdout when omitted)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_overrides() {
        let cli = Cli::parse_from(["tls-intercept", "run", "-c", "proxy.toml", "--port", "9000"]);
        match cli.command {
            Commands::Run { config, port } => {
                assert_eq!(config.as_deref(), Some("proxy.toml"));
                assert_eq!(port, Some(9000));
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_parse_global_log_level() {
        let cli = Cli::parse_from(["tls-intercept", "run", "--log-level", "debug"]);
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_parse_ca_defaults() {
        let cli = Cli::parse_from([
            "tls-intercept",
            "ca",
            "--cert-out",
            "root.pem",
            "--key-out",
            "root.key",
        ]);
        match cli.command {
            Commands::Ca {
                common_name, days, ..
            } => {
                assert_eq!(common_name, "TLS Intercept Root CA");
                assert_eq!(days, 3650);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_check_requires_config() {
        assert!(Cli::try_parse_from(["tls-intercept", "check"]).is_err());
    }
}

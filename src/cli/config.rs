use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::ProxyConfig;

/// Expand a leading tilde and make the path absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).as_ref()),
        None => path.to_path_buf(),
    }
}

/// Expand `~` in every path the configuration carries
pub fn expand_config_paths(config: &mut ProxyConfig) {
    config.ca.cert_path = expand_tilde(&config.ca.cert_path);
    config.ca.key_path = expand_tilde(&config.ca.key_path);
    if let Some(ref path) = config.upstream.ca_cert_path {
        config.upstream.ca_cert_path = Some(expand_tilde(path));
    }
}

/// Configuration for `run`: the file if given, else defaults, then overrides
pub fn load_run_config(config_path: Option<&str>, port: Option<u16>) -> Result<ProxyConfig> {
    let mut config = match config_path {
        Some(path) => {
            let path = expand_path(path)?;
            ProxyConfig::load(&path)?
        }
        None => ProxyConfig::default(),
    };

    if let Some(port) = port {
        config.proxy.bind_port = port;
        config
            .validate()
            .context("Invalid --port override")?;
    }

    expand_config_paths(&mut config);
    Ok(config)
}

/// Load, validate and summarize a configuration file
pub fn check_config(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if !path.exists() {
        println!("✗ Configuration file not found: {}", config_path);
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    println!("Checking configuration file: {}\n", config_path);

    let mut config = match ProxyConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("✗ Configuration validation failed!");
            println!("\nError details:");
            println!("{:#}", e);

            println!("\nCommon issues:");
            println!("  1. Check TOML syntax (brackets, quotes, commas)");
            println!("  2. Verify section names: [proxy], [ca], [upstream], [rate_limit]");
            println!("  3. Ensure port numbers are valid (1-65535)");
            println!("  4. connect_override must be host:port");
            return Err(e);
        }
    };
    expand_config_paths(&mut config);

    println!("✓ Listen address: {}", config.listen_addr());
    println!("✓ Max connections: {}", config.proxy.max_connections);
    println!("✓ Read buffer: {} bytes", config.proxy.read_buffer_size);
    println!(
        "✓ Timeouts: handshake {}s, write {}s, idle {}",
        config.proxy.handshake_timeout_secs,
        config.proxy.write_timeout_secs,
        match config.proxy.idle_timeout_secs {
            0 => "disabled".to_string(),
            secs => format!("{}s", secs),
        }
    );
    println!("✓ ALPN: {}", config.proxy.alpn_protocols.join(", "));
    if let Some(ref host) = config.proxy.fallback_host {
        println!("✓ Fallback host: {}", host);
    }

    for (label, file) in [
        ("CA certificate", &config.ca.cert_path),
        ("CA key", &config.ca.key_path),
    ] {
        if file.exists() {
            println!("✓ {}: {:?}", label, file);
        } else {
            println!("⚠ Warning: {} not found: {:?}", label, file);
        }
    }

    println!("✓ Upstream port: {}", config.upstream.port);
    if let Some(ref target) = config.upstream.connect_override {
        println!("✓ Upstream connect override: {}", target);
    }
    if let Some(ref ca) = config.upstream.ca_cert_path {
        if ca.exists() {
            println!("✓ Upstream CA: {:?}", ca);
        } else {
            println!("⚠ Warning: upstream CA not found: {:?}", ca);
        }
    }
    if config.upstream.skip_verify {
        println!("⚠ Warning: upstream certificate verification is disabled");
    }

    match config.rate_limit {
        Some(ref rl) => println!(
            "✓ Rate limit: {}/s (burst {})",
            rl.requests_per_second, rl.burst_size
        ),
        None => println!("✓ Rate limit: disabled"),
    }

    println!("\n✓ Configuration is valid!");
    Ok(())
}

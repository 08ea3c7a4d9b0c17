use anyhow::{Context, Result};

const PROXY_TEMPLATE: &str = include_str!("../../templates/proxy-template.toml");

/// Print the configuration template, or write it to `output`
pub fn generate_config_template(output: Option<&str>) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, PROXY_TEMPLATE)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!("Generated configuration template: {}", path);
    } else {
        println!("{}", PROXY_TEMPLATE);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    #[test]
    fn test_template_is_valid_config() {
        let config = ProxyConfig::from_toml_str(PROXY_TEMPLATE).unwrap();
        assert_eq!(config.proxy.bind_port, 8080);
        assert_eq!(config.proxy.max_connections, 20);
        assert!(config.rate_limit.is_none());
    }
}

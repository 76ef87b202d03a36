use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::RelayConfig;

/// Load configuration from a file using the config crate
/// Supports multiple formats: YAML, JSON, TOML, etc.
pub async fn load_config(config_path: &str) -> Result<RelayConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<RelayConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml, // Default to YAML
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let relay_config: RelayConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(relay_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
listen: "127.0.0.1:3000"
strategy: "smart"
hosts:
  "a.test": "http://b1:80"
  "b.test":
    - "http://b1:80"
    - "http://b2:80"
aliases:
  "www.a.test": "a.test"
forward: "http://fallback:80"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen, "127.0.0.1:3000");
        assert_eq!(config.strategy, "smart");
        assert!(!config.hosts["a.test"].is_set());
        assert!(config.hosts["b.test"].is_set());
        assert_eq!(config.hosts["b.test"].urls().len(), 2);
        assert_eq!(config.aliases["www.a.test"], "a.test");
        assert_eq!(config.forward.as_deref(), Some("http://fallback:80"));
    }

    #[tokio::test]
    async fn test_load_toml_config() {
        let toml_content = r#"
listen = "127.0.0.1:3000"
sts_seconds = 31536000

[[rules]]
pattern = "^http://x.test/api/(.*)$"
target = "http://backend:8080/$1"

[hosts]
"a.test" = ["http://b1:80", "http://b2:80"]

[redirects]
"old.test" = "http://new.test/"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen, "127.0.0.1:3000");
        assert_eq!(config.sts_seconds, 31_536_000);
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].target, "http://backend:8080/$1");
        assert_eq!(config.redirects["old.test"], "http://new.test/");
    }

    #[tokio::test]
    async fn test_defaults_fill_missing_fields() {
        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "listen = \"0.0.0.0:8888\"").unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen, "0.0.0.0:8888");
        assert_eq!(config.strategy, "robin");
        assert!(config.reuse);
        assert_eq!(config.deny_status, 403);
        assert_eq!(config.max_pending, 256 * 1024);
        assert_eq!(config.connect_timeout, "10s");
        assert!(config.hosts.is_empty());
        assert!(config.forward.is_none());
    }
}

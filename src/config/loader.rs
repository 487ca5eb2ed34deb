use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ServerConfig;

/// Prefix for environment overrides, e.g. `TURNSTILE_ADMISSION__MAX_CONCURRENT=8`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Load configuration from a file using the config crate, layered under
/// `TURNSTILE_*` environment variables. The file must exist.
pub async fn load_config(config_path: &str) -> Result<ServerConfig> {
    load_config_sync(config_path, true)
}

/// Like [`load_config`], but falls back to defaults when the file is absent.
pub async fn load_config_or_default(config_path: &str) -> Result<ServerConfig> {
    load_config_sync(config_path, false)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str, required: bool) -> Result<ServerConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Toml,
    };

    let settings = Config::builder()
        .add_source(
            File::new(
                config_path
                    .to_str()
                    .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
                format,
            )
            .required(required),
        )
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let server_config: ServerConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(server_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[tokio::test]
    async fn test_load_toml_config() {
        let toml_content = r#"
listen_addr = "127.0.0.1:3000"

[admission]
max_concurrent = 8
acquire_timeout = "250ms"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.admission.max_concurrent, 8);
        assert_eq!(config.admission.acquire_timeout, "250ms");
        // Untouched sections keep their defaults
        assert!(config.logging.json);
    }

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
listen_addr: "127.0.0.1:3001"
trust_forwarded_for: true
logging:
  level: "debug"
  json: false
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3001");
        assert!(config.trust_forwarded_for);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.admission.max_concurrent, 100);
    }

    #[tokio::test]
    async fn test_missing_file_is_error_when_required() {
        assert!(load_config("/nonexistent/turnstile.toml").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_file_falls_back_to_defaults() {
        let config = load_config_or_default("/nonexistent/turnstile.toml")
            .await
            .unwrap();
        assert_eq!(config.admission.max_concurrent, 100);
    }
}

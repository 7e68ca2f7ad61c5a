//! Server configuration.
//!
//! Loads the core [`parlance_core::Config`] from a YAML document and
//! applies environment variable overrides for the secrets that should
//! stay out of config files.

use std::path::Path;

use anyhow::{Context, Result};
use parlance_core::Config;

/// Loads configuration from a YAML file, then applies environment
/// overrides.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let mut config = if let Some(path) = path {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Environment overrides for credentials and host settings.
///
/// `PARLANCE_ARI_PASSWORD` and `PARLANCE_DEEPGRAM_API_KEY` exist so
/// secrets never have to live in the YAML document.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("PARLANCE_ARI_HOST") {
        config.asterisk.host = val;
    }
    if let Ok(val) = std::env::var("PARLANCE_ARI_PORT") {
        if let Ok(port) = val.parse() {
            config.asterisk.port = port;
        }
    }
    if let Ok(val) = std::env::var("PARLANCE_ARI_USERNAME") {
        config.asterisk.username = val;
    }
    if let Ok(val) = std::env::var("PARLANCE_ARI_PASSWORD") {
        config.asterisk.password = val;
    }
    if let Ok(val) = std::env::var("PARLANCE_DEEPGRAM_API_KEY") {
        if let Some(deepgram) = config.providers.deepgram.as_mut() {
            deepgram.api_key = val;
        }
    }
    if let Ok(val) = std::env::var("PARLANCE_HTTP_PORT") {
        if let Ok(port) = val.parse() {
            config.http_port = port;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_an_error() {
        assert!(load(Some(Path::new("/nonexistent/parlance.yaml"))).is_err());
    }

    #[test]
    fn yaml_round_trips_through_core_config() {
        let yaml = r#"
asterisk:
  host: pbx.example.com
  port: 8088
  username: agent
  password: secret
  app_name: parlance
audio_transport: audiosocket
downstream_mode: file
pipelines:
  default:
    stt: deepgram_stt
    llm: webhook_llm
    tts: deepgram_tts
active_pipeline: default
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.asterisk.host, "pbx.example.com");
        assert_eq!(
            config.audio_transport,
            parlance_core::AudioTransport::Audiosocket
        );
        assert_eq!(config.default_pipeline(), Some("default"));
        config.validate().unwrap();
    }
}

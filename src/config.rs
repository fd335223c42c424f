use std::env;
use std::str::FromStr;
use std::time::Duration;
use strum::{Display, EnumString};
use thiserror::Error;
use url::Url;

use crate::capture::CaptureConfig;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
pub const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(8);
pub const DEFAULT_PLAYBACK_SAMPLE_RATE: u32 = 24_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
    #[error("Invalid session URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Deployment environment; selects plaintext or encrypted transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum Environment {
    #[strum(to_string = "DEV", serialize = "development")]
    Dev,
    #[strum(to_string = "PROD", serialize = "production")]
    Production,
}

impl Environment {
    pub fn scheme(self) -> &'static str {
        match self {
            Environment::Dev => "ws",
            Environment::Production => "wss",
        }
    }
}

/// Client-side settings that stay fixed for the lifetime of a client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Host, optional port and optional path prefix, without a scheme.
    pub api_base_url: String,
    pub environment: Environment,
    pub connect_timeout: Duration,
    pub max_reconnect_attempts: u32,
    /// Base delay before an automatic reconnect; doubles per attempt.
    pub reconnect_backoff: Duration,
    pub capture: CaptureConfig,
    pub playback_sample_rate: u32,
}

impl ClientConfig {
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            environment: Environment::Production,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            capture: CaptureConfig::default(),
            playback_sample_rate: DEFAULT_PLAYBACK_SAMPLE_RATE,
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let api_base_url = env::var("API_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("API_BASE_URL".to_string()))?;

        let mut config = Self::new(api_base_url.trim());

        if let Some(environment) = read_var::<Environment>("ENVIRONMENT")? {
            config.environment = environment;
        }
        if let Some(ms) = read_var::<u64>("CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = read_var::<u32>("MAX_RECONNECT_ATTEMPTS")? {
            config.max_reconnect_attempts = attempts;
        }
        if let Some(ms) = read_var::<u64>("RECONNECT_BACKOFF_MS")? {
            config.reconnect_backoff = Duration::from_millis(ms);
        }
        if let Some(device) = env::var("INPUT_DEVICE").ok().filter(|d| !d.is_empty()) {
            config.capture.device_name = Some(device);
        }

        Ok(config)
    }

    /// `<scheme>://<api-base>/ws/<clientId>`
    pub fn session_url(&self, client_id: &str) -> Result<Url, ConfigError> {
        if client_id.is_empty() || client_id.contains('/') {
            return Err(ConfigError::InvalidValue {
                name: "client_id".to_string(),
                reason: format!("'{}' is not a valid path segment", client_id),
            });
        }
        let base = self.api_base_url.trim_end_matches('/');
        let url = Url::parse(&format!(
            "{}://{}/ws/{}",
            self.environment.scheme(),
            base,
            client_id
        ))?;
        Ok(url)
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(10);
        self.reconnect_backoff
            .saturating_mul(1u32 << exp)
            .min(MAX_RECONNECT_BACKOFF)
    }
}

fn read_var<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        _ => Ok(None),
    }
}

/// Load configuration with helpful error messages for development
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    match ClientConfig::from_env() {
        Ok(config) => {
            log::info!(
                "Loaded client configuration for {} ({})",
                config.api_base_url,
                config.environment
            );
            Ok(config)
        }
        Err(ConfigError::MissingEnvVar(var)) => {
            log::error!("Missing required environment variable: {}", var);
            log::error!("Create a .env file in the project root with:");
            log::error!("{}=api.example.com", var);
            Err(ConfigError::MissingEnvVar(var))
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            "API_BASE_URL",
            "ENVIRONMENT",
            "CONNECT_TIMEOUT_MS",
            "MAX_RECONNECT_ATTEMPTS",
            "RECONNECT_BACKOFF_MS",
            "INPUT_DEVICE",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("api.example.com");
        assert_eq!(config.connect_timeout, Duration::from_millis(5000));
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.playback_sample_rate, 24_000);
        assert_eq!(config.capture.sample_rate, 8000);
        assert_eq!(config.capture.frame_ms, 500);
    }

    #[test]
    fn test_session_url_scheme_follows_environment() {
        let mut config = ClientConfig::new("api.example.com/");
        assert_eq!(
            config.session_url("abc-123").unwrap().as_str(),
            "wss://api.example.com/ws/abc-123"
        );

        config.environment = Environment::Dev;
        config.api_base_url = "localhost:5000".to_string();
        assert_eq!(
            config.session_url("abc-123").unwrap().as_str(),
            "ws://localhost:5000/ws/abc-123"
        );
    }

    #[test]
    fn test_session_url_rejects_bad_client_id() {
        let config = ClientConfig::new("api.example.com");
        assert!(config.session_url("").is_err());
        assert!(config.session_url("a/b").is_err());
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!("DEV".parse::<Environment>().unwrap(), Environment::Dev);
        assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Dev);
        assert_eq!(
            "production".parse::<Environment>().unwrap(),
            Environment::Production
        );
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn test_reconnect_delay_grows_and_caps() {
        let config = ClientConfig::new("api.example.com");
        assert_eq!(config.reconnect_delay(1), Duration::from_millis(500));
        assert_eq!(config.reconnect_delay(2), Duration::from_millis(1000));
        assert_eq!(config.reconnect_delay(3), Duration::from_millis(2000));
        assert_eq!(config.reconnect_delay(20), MAX_RECONNECT_BACKOFF);

        let mut immediate = config.clone();
        immediate.reconnect_backoff = Duration::ZERO;
        assert_eq!(immediate.reconnect_delay(3), Duration::ZERO);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        env::set_var("API_BASE_URL", "voice.example.com");
        env::set_var("ENVIRONMENT", "DEV");
        env::set_var("CONNECT_TIMEOUT_MS", "2500");
        env::set_var("MAX_RECONNECT_ATTEMPTS", "5");

        let config = ClientConfig::from_env().unwrap();
        assert_eq!(config.api_base_url, "voice.example.com");
        assert_eq!(config.environment, Environment::Dev);
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.max_reconnect_attempts, 5);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_number() {
        clear_env();
        env::set_var("API_BASE_URL", "voice.example.com");
        env::set_var("MAX_RECONNECT_ATTEMPTS", "three");

        assert!(matches!(
            ClientConfig::from_env(),
            Err(ConfigError::InvalidValue { .. })
        ));
        clear_env();
    }
}

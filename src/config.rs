use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    // Server configuration
    pub host: String,
    pub port: u16,

    // Persisted state
    pub cache_dir: PathBuf,
    pub cache_index_path: PathBuf,
    pub blocklist_path: PathBuf,

    // Certificate hint collaborator
    pub cert_dir: PathBuf,
    pub cert_tool: Option<String>,

    // Timeouts
    pub accept_timeout_ms: u64,
    pub client_read_timeout_ms: u64,
    pub connect_timeout_seconds: u64,
    pub tunnel_read_timeout_seconds: u64,
    pub origin_timeout_seconds: u64,

    // CONNECT handling
    pub connect_header_lines: usize,

    // Cache policy (None = artifacts never expire)
    pub cache_ttl_seconds: Option<u64>,

    // Operator console on stdin
    pub console_enabled: bool,

    // Logging
    pub log_format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9090,
            cache_dir: PathBuf::from("cached"),
            cache_index_path: PathBuf::from("cachedSites.json"),
            blocklist_path: PathBuf::from("blockedSites.json"),
            cert_dir: PathBuf::from("."),
            cert_tool: None,
            accept_timeout_ms: 1000,
            client_read_timeout_ms: 2000,
            connect_timeout_seconds: 10,
            tunnel_read_timeout_seconds: 5,
            origin_timeout_seconds: 30,
            connect_header_lines: 32,
            cache_ttl_seconds: None,
            console_enabled: true,
            log_format: "pretty".to_string(),
        }
    }
}

/// Read an environment variable, falling back to `default` when unset
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let defaults = Config::default();

        let host = env::var("PROXY_HOST").unwrap_or(defaults.host);
        let port: u16 = env_or("PROXY_PORT", defaults.port)?;

        let cache_dir = env::var("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);
        let cache_index_path = env::var("CACHE_INDEX_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_index_path);
        let blocklist_path = env::var("BLOCKLIST_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.blocklist_path);

        let cert_dir = env::var("CERT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cert_dir);
        let cert_tool = env::var("CERT_TOOL")
            .ok()
            .filter(|tool| !tool.trim().is_empty());

        let accept_timeout_ms = env_or("ACCEPT_TIMEOUT_MS", defaults.accept_timeout_ms)?;
        let client_read_timeout_ms =
            env_or("CLIENT_READ_TIMEOUT_MS", defaults.client_read_timeout_ms)?;
        let connect_timeout_seconds =
            env_or("CONNECT_TIMEOUT_SECONDS", defaults.connect_timeout_seconds)?;
        let tunnel_read_timeout_seconds = env_or(
            "TUNNEL_READ_TIMEOUT_SECONDS",
            defaults.tunnel_read_timeout_seconds,
        )?;
        let origin_timeout_seconds =
            env_or("ORIGIN_TIMEOUT_SECONDS", defaults.origin_timeout_seconds)?;

        let connect_header_lines = env_or("CONNECT_HEADER_LINES", defaults.connect_header_lines)?;

        let cache_ttl_seconds = match env::var("CACHE_TTL_SECONDS") {
            Ok(value) if !value.trim().is_empty() => Some(
                value
                    .trim()
                    .parse()
                    .context("Invalid CACHE_TTL_SECONDS")?,
            ),
            _ => None,
        };

        let console_enabled = env_or("CONSOLE_ENABLED", defaults.console_enabled)?;
        let log_format = env::var("LOG_FORMAT").unwrap_or(defaults.log_format);

        let config = Config {
            host,
            port,
            cache_dir,
            cache_index_path,
            blocklist_path,
            cert_dir,
            cert_tool,
            accept_timeout_ms,
            client_read_timeout_ms,
            connect_timeout_seconds,
            tunnel_read_timeout_seconds,
            origin_timeout_seconds,
            connect_header_lines,
            cache_ttl_seconds,
            console_enabled,
            log_format,
        };
        config.validate()?;

        Ok(config)
    }

    /// Reject values that would make the proxy unusable
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow::anyhow!("PROXY_PORT must be between 1 and 65535"));
        }

        let timeouts = [
            ("ACCEPT_TIMEOUT_MS", self.accept_timeout_ms),
            ("CLIENT_READ_TIMEOUT_MS", self.client_read_timeout_ms),
            ("CONNECT_TIMEOUT_SECONDS", self.connect_timeout_seconds),
            ("TUNNEL_READ_TIMEOUT_SECONDS", self.tunnel_read_timeout_seconds),
            ("ORIGIN_TIMEOUT_SECONDS", self.origin_timeout_seconds),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(anyhow::anyhow!("{} must be greater than zero", name));
            }
        }

        if self.connect_header_lines == 0 {
            return Err(anyhow::anyhow!("CONNECT_HEADER_LINES must be greater than zero"));
        }

        if !["json", "pretty"].contains(&self.log_format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid LOG_FORMAT '{}'. Must be 'json' or 'pretty'",
                self.log_format
            ));
        }

        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn client_read_timeout(&self) -> Duration {
        Duration::from_millis(self.client_read_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn tunnel_read_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_read_timeout_seconds)
    }

    pub fn origin_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_timeout_seconds)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_seconds.map(Duration::from_secs)
    }
}

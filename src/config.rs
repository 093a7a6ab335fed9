use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Plain HTTP listen address (e.g. `0.0.0.0:8080` or `:8080`).  Empty
    /// disables the HTTP listener.
    #[serde(default = "default_http_listen")]
    pub http: Option<String>,
    /// HTTPS listen address.  Requires `cert` and `key`.
    #[serde(default)]
    pub https: Option<String>,
    /// PEM certificate chain for the HTTPS listener.
    #[serde(default)]
    pub cert: Option<PathBuf>,
    /// PEM private key for the HTTPS listener.
    #[serde(default)]
    pub key: Option<PathBuf>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            http: default_http_listen(),
            https: None,
            cert: None,
            key: None,
        }
    }
}

fn default_http_listen() -> Option<String> {
    Some(":8080".to_string())
}

/// TLS material for the HTTPS listener, present only when fully configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsListen {
    pub addr: SocketAddr,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl ListenConfig {
    pub fn http_addr(&self) -> Result<Option<SocketAddr>> {
        self.http.as_deref().map(parse_listen_addr).transpose()
    }

    pub fn tls(&self) -> Result<Option<TlsListen>> {
        match (&self.https, &self.cert, &self.key) {
            (Some(addr), Some(cert), Some(key)) => Ok(Some(TlsListen {
                addr: parse_listen_addr(addr)?,
                cert: cert.clone(),
                key: key.clone(),
            })),
            _ => Ok(None),
        }
    }
}

/// Parse a listen address.  A bare `:8080` binds all interfaces.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .with_context(|| format!("invalid listen address: {addr}"))
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Scheme and host of the upstream Git server.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bound (seconds) on each reference-advertisement fetch.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Bound (seconds) on establishing any upstream connection.  The
    /// upload-pack relay is otherwise unbounded.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// `User-Agent` sent upstream in place of the client's own.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_base_url() -> String {
    "https://github.com".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    "git/2.1.4".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Command-line values that take precedence over the config file.  An empty
/// string clears the corresponding setting.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub http: Option<String>,
    pub https: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub upstream: Option<String>,
}

/// Build the effective [`Config`]: defaults, then the optional YAML file at
/// `path`, then `overrides`.
pub fn load_config(path: Option<&Path>, overrides: Overrides) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            serde_yaml::from_str::<Config>(&contents)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        }
        None => Config::default(),
    };

    apply_overrides(&mut config, overrides);
    normalize(&mut config);
    validate_config(&config)?;
    Ok(config)
}

fn apply_overrides(config: &mut Config, overrides: Overrides) {
    let listen = &mut config.listen;
    if let Some(http) = overrides.http {
        listen.http = Some(http);
    }
    if let Some(https) = overrides.https {
        listen.https = Some(https);
    }
    if let Some(cert) = overrides.cert {
        listen.cert = Some(PathBuf::from(cert));
    }
    if let Some(key) = overrides.key {
        listen.key = Some(PathBuf::from(key));
    }
    if let Some(base_url) = overrides.upstream {
        config.upstream.base_url = base_url;
    }
}

/// Treat empty strings as unset.
fn normalize(config: &mut Config) {
    let listen = &mut config.listen;
    listen.http = listen.http.take().filter(|s| !s.is_empty());
    listen.https = listen.https.take().filter(|s| !s.is_empty());
    listen.cert = listen.cert.take().filter(|p| !p.as_os_str().is_empty());
    listen.key = listen.key.take().filter(|p| !p.as_os_str().is_empty());

    let base_url = config.upstream.base_url.trim_end_matches('/').to_string();
    config.upstream.base_url = base_url;
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    let listen = &config.listen;
    anyhow::ensure!(
        listen.http.is_some() || listen.https.is_some(),
        "must provide --http and/or --https"
    );

    let tls_parts = [
        listen.https.is_some(),
        listen.cert.is_some(),
        listen.key.is_some(),
    ];
    anyhow::ensure!(
        tls_parts.iter().all(|p| *p) || !tls_parts.iter().any(|p| *p),
        "--https, --cert and --key must be used together"
    );

    listen.http_addr()?;
    listen.tls()?;

    let base_url = &config.upstream.base_url;
    anyhow::ensure!(
        base_url.starts_with("https://") || base_url.starts_with("http://"),
        "upstream base_url must start with http:// or https://, got {base_url:?}"
    );
    anyhow::ensure!(
        config.upstream.timeout_secs > 0,
        "upstream timeout_secs must be greater than zero"
    );
    anyhow::ensure!(
        !config.upstream.user_agent.is_empty(),
        "upstream user_agent must not be empty"
    );
    Ok(())
}

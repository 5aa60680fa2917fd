use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Global configuration for the lobby
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// HTTP surface configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Trace discovery configuration
    pub traces: TraceConfig,

    /// Container runtime and image configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Lobby listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Fixed internal port for the auth stub (default: 8441)
    #[serde(default = "default_auth_port")]
    pub auth_port: u16,

    /// Public port published by the reverse-proxy sidecar (default: 80)
    #[serde(default = "default_public_port")]
    pub public_port: u16,

    /// Public URL root, used for absolute links handed to containers
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Origin allowed to serve static assets, embedded in the CSP and
    /// substituted into the entry pages
    #[serde(default = "default_static_assets_host")]
    pub static_assets_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            auth_port: default_auth_port(),
            public_port: default_public_port(),
            public_url: default_public_url(),
            static_assets_host: default_static_assets_host(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TraceConfig {
    /// Root directory watched for trace arrival and removal
    pub root: PathBuf,

    /// Directory for per-trace persistent storage; absent means traces
    /// lose state across container restarts
    pub storage_dir: Option<PathBuf>,

    /// Notification topic forwarded verbatim to trace containers
    pub notify_topic: Option<String>,

    /// Whether containers for newly arrived traces should announce them
    #[serde(default)]
    pub notify_on_new: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Container runtime binary name (default: docker)
    #[serde(default = "default_runtime_binary")]
    pub binary: String,

    /// Application image run for each trace
    #[serde(default = "default_app_image")]
    pub image: String,

    /// Trace inspection tool binary (default: rr); required on PATH at
    /// startup
    #[serde(default = "default_inspector")]
    pub inspector: String,

    /// Reverse-proxy sidecar image
    #[serde(default = "default_proxy_image")]
    pub proxy_image: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: default_runtime_binary(),
            image: default_app_image(),
            inspector: default_inspector(),
            proxy_image: default_proxy_image(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            )
        })?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be greater than 0");
        }
        if self.server.auth_port == 0 {
            anyhow::bail!("server.auth_port must be greater than 0");
        }
        if self.server.port == self.server.auth_port {
            anyhow::bail!("server.port and server.auth_port must differ");
        }
        if !self.traces.root.is_absolute() {
            anyhow::bail!(
                "traces.root must be an absolute path, got '{}'",
                self.traces.root.display()
            );
        }
        if let Some(storage) = &self.traces.storage_dir {
            if !storage.is_absolute() {
                anyhow::bail!(
                    "traces.storage_dir must be an absolute path, got '{}'",
                    storage.display()
                );
            }
        }
        if self.runtime.binary.is_empty() {
            anyhow::bail!("runtime.binary must not be empty");
        }
        if self.runtime.image.is_empty() {
            anyhow::bail!("runtime.image must not be empty");
        }
        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_auth_port() -> u16 {
    8441
}

fn default_public_port() -> u16 {
    80
}

fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_static_assets_host() -> String {
    "https://static.example.com".to_string()
}

fn default_runtime_binary() -> String {
    "docker".to_string()
}

fn default_app_image() -> String {
    "trace-appserver:latest".to_string()
}

fn default_inspector() -> String {
    "rr".to_string()
}

fn default_proxy_image() -> String {
    "traefik:v2.11".to_string()
}

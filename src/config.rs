//! Configuration loading and persistence.
//!
//! Reads `config.json` from the bridge's config directory, then applies
//! `UNITY_MCP_*` environment overrides. The per-transport configs are
//! derived from it, so the manager's factories never look at the
//! environment themselves.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::constants::{DEFAULT_BRIDGE_PORT, HTTP_REQUEST_TIMEOUT, HUB_COMMAND_TIMEOUT, WS_CONNECT_TIMEOUT};
use crate::dispatch::CommandDispatcher;
use crate::registry::PortRegistry;
use crate::transport::{
    HttpConfig, HttpTransport, HubConfig, StdioConfig, StdioTransport, ToolDefinition, TransportClient,
    TransportFactories, TransportMode, WebSocketTransport,
};

const CONFIG_FILE: &str = "config.json";

/// Configuration for the bridge.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Primary transport started by `serve`.
    pub mode: TransportMode,
    /// Port the stdio bridge host prefers.
    pub port: u16,
    /// Whether the stdio host may pick another port when `port` is taken.
    pub allow_port_fallback: bool,
    /// Base URL of the HTTP command server.
    pub http_url: String,
    /// Websocket endpoint of the plugin hub.
    pub hub_url: String,
    /// Editor project this bridge serves.
    pub project_path: String,
    /// Editor version reported when registering with the hub.
    pub unity_version: String,
    /// Whether the stdio host records its port in `~/.unity-mcp`.
    pub write_registry: bool,
    /// Tools announced to the HTTP server on start.
    pub tools: Vec<ToolDefinition>,
}

impl Default for Config {
    fn default() -> Self {
        let project_path = std::env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            mode: TransportMode::Stdio,
            port: DEFAULT_BRIDGE_PORT,
            allow_port_fallback: true,
            http_url: "http://localhost:8080".to_string(),
            hub_url: "ws://localhost:8080/hub/plugin".to_string(),
            project_path,
            unity_version: "unknown".to_string(),
            write_registry: true,
            tools: Vec::new(),
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `UNITY_MCP_CONFIG_DIR` overrides the platform config directory
    /// (Linux: `~/.config/unity-mcp-bridge`).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("UNITY_MCP_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("unity-mcp-bridge")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let dir = Self::config_dir()?;
        let mut config = Self::load_from(&dir).unwrap_or_else(|e| {
            log::debug!("Using default config: {e:#}");
            Self::default()
        });
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load `config.json` from `dir` without env overrides.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid config file {}", config_path.display()))
        } else {
            anyhow::bail!("Config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(mode) = std::env::var("UNITY_MCP_MODE") {
            match mode.parse() {
                Ok(mode) => self.mode = mode,
                Err(e) => log::warn!("Ignoring UNITY_MCP_MODE: {e}"),
            }
        }

        if let Ok(port) = std::env::var("UNITY_MCP_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.port = port;
            }
        }

        if let Ok(http_url) = std::env::var("UNITY_MCP_HTTP_URL") {
            self.http_url = http_url;
        }

        if let Ok(hub_url) = std::env::var("UNITY_MCP_HUB_URL") {
            self.hub_url = hub_url;
        }

        if let Ok(project_path) = std::env::var("UNITY_MCP_PROJECT_PATH") {
            self.project_path = project_path;
        }
    }

    /// Persists the current configuration to the config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Persists the configuration to `dir/config.json` (owner read/write only).
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let config_path = dir.join(CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Display name of the project (last path component).
    pub fn project_name(&self) -> String {
        Path::new(self.project_path.trim_end_matches(['/', '\\']))
            .file_name()
            .map_or_else(|| self.project_path.clone(), |n| n.to_string_lossy().into_owned())
    }

    /// Stable hash identifying the project.
    pub fn project_hash(&self) -> String {
        PortRegistry::project_hash(&self.project_path)
    }

    /// Settings for the stdio bridge host.
    pub fn stdio_config(&self) -> Result<StdioConfig> {
        let registry = if self.write_registry {
            Some(PortRegistry::from_home()?)
        } else {
            None
        };
        Ok(StdioConfig {
            port: self.port,
            allow_fallback: self.allow_port_fallback,
            project_path: self.project_path.clone(),
            registry,
        })
    }

    /// Settings for the plain HTTP transport.
    pub fn http_config(&self) -> HttpConfig {
        HttpConfig {
            base_url: self.http_url.clone(),
            project_id: self.project_hash(),
            tools: self.tools.clone(),
            request_timeout: HTTP_REQUEST_TIMEOUT,
        }
    }

    /// Settings for the websocket hub transport.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            endpoint: self.hub_url.clone(),
            project_name: self.project_name(),
            project_hash: self.project_hash(),
            unity_version: self.unity_version.clone(),
            connect_timeout: WS_CONNECT_TIMEOUT,
            command_timeout: HUB_COMMAND_TIMEOUT,
        }
    }

    /// Factories building each transport from this configuration.
    ///
    /// Every transport shares `dispatcher`. Endpoint errors surface when a
    /// factory runs, so an invalid hub URL only disables the push channel.
    pub fn transport_factories(&self, dispatcher: Arc<dyn CommandDispatcher>) -> Result<TransportFactories> {
        let stdio_config = self.stdio_config()?;
        let http_config = self.http_config();
        let hub_config = self.hub_config();

        let stdio_dispatcher = Arc::clone(&dispatcher);
        let hub_dispatcher = dispatcher;

        TransportFactories::builder()
            .stdio(move || {
                let transport = StdioTransport::new(stdio_config.clone(), Arc::clone(&stdio_dispatcher));
                Ok(Some(Arc::new(transport) as Arc<dyn TransportClient>))
            })
            .http(move || {
                let transport = HttpTransport::new(http_config.clone())?;
                Ok(Some(Arc::new(transport) as Arc<dyn TransportClient>))
            })
            .hub(move || {
                let transport = WebSocketTransport::new(hub_config.clone(), Arc::clone(&hub_dispatcher))?;
                Ok(Some(Arc::new(transport) as Arc<dyn TransportClient>))
            })
            .build()
    }
}

//! Hub configuration.
//!
//! Loaded from a TOML file (default `hub.toml`), with serde defaults per
//! field. Secrets (the auth token, provider API keys) may also come from
//! `HUB_*` environment variables, which override file values.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Hostname advertised to clients (signed file URLs, auth_result).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    /// Trust `X-Forwarded-For` for rate-limiter client addresses.
    #[serde(default)]
    pub trust_proxy: bool,
    /// Origins allowed for CORS. Empty = reflect `*`.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
            public_host: None,
            tls: None,
            trust_proxy: false,
            allowed_origins: Vec::new(),
        }
    }
}

fn d_port() -> u16 {
    3006
}
fn d_host() -> String {
    "127.0.0.1".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Providers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// A provider served by a local CLI binary that speaks the
/// Anthropic-compatible streaming contract over stdin/stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliProviderConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Hard deadline in seconds before the child is killed.
    #[serde(default = "d_cli_timeout")]
    pub timeout_secs: u64,
}

fn d_cli_timeout() -> u64 {
    120
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subsystem toggles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchProxyConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Regex patterns for URLs the fetch proxy refuses.
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
}

impl Default for FetchProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            blocked_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowseConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub viewport: Viewport,
    /// CDP endpoint of the browser serving agent pages
    /// (e.g. `ws://127.0.0.1:9222`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdp_url: Option<String>,
}

impl Default for BrowseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            viewport: Viewport::default(),
            cdp_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub browse: BrowseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    pub vapid_public_key: String,
    pub vapid_private_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hub identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubIdentity {
    #[serde(default = "d_hub_id")]
    pub id: String,
    #[serde(default = "d_hub_name")]
    pub name: String,
}

impl Default for HubIdentity {
    fn default() -> Self {
        Self {
            id: d_hub_id(),
            name: d_hub_name(),
        }
    }
}

fn d_hub_id() -> String {
    "hub".into()
}
fn d_hub_name() -> String {
    "agenthub".into()
}
fn d_true() -> bool {
    true
}
fn d_store_path() -> PathBuf {
    PathBuf::from("./data/agents")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub hub: HubIdentity,
    /// Bearer token clients must present. `None` refuses all auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Shared upstream keys by provider name (anthropic, openai, gemini, ollama).
    #[serde(default)]
    pub shared_api_keys: HashMap<String, String>,
    /// Named provider overrides (custom endpoints, per-provider keys).
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    /// Providers served by local CLI subprocesses.
    #[serde(default)]
    pub cli_providers: HashMap<String, CliProviderConfig>,
    #[serde(default)]
    pub fetch_proxy: FetchProxyConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Per-agent bash sandbox root. `None` disables sandboxed bash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_path: Option<PathBuf>,
    #[serde(default = "d_store_path")]
    pub agent_store_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<PushConfig>,
}

impl HubConfig {
    /// Load configuration from a TOML file, then apply environment
    /// overrides (`HUB_AUTH_TOKEN`, `HUB_API_KEY_<PROVIDER>`).
    ///
    /// A missing file yields the default configuration so a bare
    /// `agenthub serve` works out of the box.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: HubConfig = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            HubConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("HUB_AUTH_TOKEN") {
            if !token.is_empty() {
                self.auth_token = Some(token);
            }
        }
        for provider in ["anthropic", "openai", "gemini", "ollama"] {
            let var = format!("HUB_API_KEY_{}", provider.to_ascii_uppercase());
            if let Ok(key) = std::env::var(&var) {
                if !key.is_empty() {
                    self.shared_api_keys.insert(provider.into(), key);
                }
            }
        }
    }

    /// Validation run by `agenthub config validate` and at boot.
    pub fn validate(&self) -> Result<()> {
        if self.auth_token.as_deref().is_some_and(str::is_empty) {
            return Err(Error::Config("auth_token must not be empty".into()));
        }
        if let Some(tls) = &self.server.tls {
            if !tls.cert.exists() || !tls.key.exists() {
                return Err(Error::Config("tls cert/key file not found".into()));
            }
        }
        for (name, cli) in &self.cli_providers {
            if cli.command.is_empty() {
                return Err(Error::Config(format!(
                    "cli provider {name} has an empty command"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.server.port, 3006);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert!(cfg.fetch_proxy.enabled);
        assert!(!cfg.tools.browse.enabled);
        assert_eq!(cfg.agent_store_path, PathBuf::from("./data/agents"));
    }

    #[test]
    fn parses_minimal_toml() {
        let cfg: HubConfig = toml::from_str(
            r#"
            auth_token = "secret"

            [server]
            port = 8443
            allowed_origins = ["https://app.example.com"]

            [shared_api_keys]
            anthropic = "sk-ant-test"

            [cli_providers.anthropic]
            command = "claude"
            args = ["-p", "--output-format", "stream-json"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.auth_token.as_deref(), Some("secret"));
        assert_eq!(cfg.server.port, 8443);
        assert_eq!(cfg.server.allowed_origins.len(), 1);
        assert_eq!(
            cfg.shared_api_keys.get("anthropic").map(String::as_str),
            Some("sk-ant-test")
        );
        let cli = cfg.cli_providers.get("anthropic").unwrap();
        assert_eq!(cli.command, "claude");
        assert_eq!(cli.timeout_secs, 120);
    }

    #[test]
    fn empty_auth_token_fails_validation() {
        let cfg: HubConfig = toml::from_str("auth_token = \"\"").unwrap();
        assert!(cfg.validate().is_err());
    }
}

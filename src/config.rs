//! Optional YAML configuration file, merged under the command-line flags

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerFile,

    #[serde(default)]
    pub agent: AgentFile,

    #[serde(default)]
    pub session: SessionFile,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerFile {
    /// Address to accept tunnels on (host:port)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Name this server introduces itself with to peers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Shared secret clients and peers must present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Environment variable holding the token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    /// WebSocket URLs of servers to federate with
    #[serde(default)]
    pub peers: Vec<String>,

    #[serde(default)]
    pub forwards: Vec<ForwardFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardFile {
    /// Local TCP address to listen on
    pub listen: String,
    /// `clientKey/network/address`
    pub target: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgentFile {
    /// Tunnel server URL (ws:// or wss://)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    #[serde(default)]
    pub allow_networks: Vec<String>,

    #[serde(default)]
    pub allow_addresses: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SessionFile {
    /// Log every frame sent and received
    #[serde(default)]
    pub trace_frames: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_buffer: Option<usize>,
}

pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

pub fn parse_config(contents: &str) -> Result<ConfigFile> {
    Ok(serde_yaml::from_str(contents)?)
}

/// Token from the file itself, or from the environment variable it names
pub fn resolve_token(token: Option<String>, token_env: Option<&str>) -> Result<Option<String>> {
    if token.is_some() {
        return Ok(token);
    }
    match token_env {
        Some(var) => std::env::var(var)
            .map(Some)
            .with_context(|| format!("Environment variable {} is not set", var)),
        None => Ok(None),
    }
}

use serde::Deserialize;
use std::collections::HashMap;

/// Endpoint settings for a named operator. Backends that carry an
/// `operator_id` are dispatched through the operator's forwarding strategy;
/// blank backend fields are filled from here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperatorEndpoint {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default, rename = "interface_type")]
    pub interface: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub route_prefix: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub dsn: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub api_key: String,
}

/// Top-level application configuration, loaded from YAML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub operators: HashMap<String, OperatorEndpoint>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, String> {
        let data =
            std::fs::read_to_string(path).map_err(|err| format!("load config {path}: {err}"))?;
        serde_yaml::from_str(&data).map_err(|err| format!("parse config {path}: {err}"))
    }

    /// Load the config named by `POLYROUTE_CONFIG`, falling back to
    /// `configs/config.yaml`, falling back to defaults when no file exists.
    pub fn load_default() -> Self {
        let path = std::env::var("POLYROUTE_CONFIG")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "configs/config.yaml".to_string());
        match Self::load(&path) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!("config not loaded ({err}), using defaults");
                Self::default()
            }
        }
    }

    pub fn listen_addr(&self) -> String {
        let addr = self.server.addr.trim();
        if addr.is_empty() {
            "0.0.0.0:8080".to_string()
        } else {
            addr.to_string()
        }
    }

    pub fn route_prefix(&self) -> String {
        let prefix = self.server.route_prefix.trim().trim_end_matches('/');
        if prefix.is_empty() {
            "/back".to_string()
        } else if prefix.starts_with('/') {
            prefix.to_string()
        } else {
            format!("/{prefix}")
        }
    }

    pub fn database_dsn(&self) -> String {
        let dsn = self.database.dsn.trim();
        if dsn.is_empty() {
            "sqlite://./data/polyroute.db".to_string()
        } else {
            dsn.to_string()
        }
    }

    pub fn operator(&self, id: &str) -> Option<&OperatorEndpoint> {
        self.operators.get(id.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_operators_map() {
        let yaml = r#"
server:
  addr: "127.0.0.1:9000"
auth:
  api_key: "admin-key"
operators:
  codex:
    name: Codex
    enabled: true
    base_url: "https://chatgpt.com/backend-api"
    api_key: "sk-codex"
    interface_type: openai_responses
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("yaml");
        assert_eq!(cfg.listen_addr(), "127.0.0.1:9000");
        assert_eq!(cfg.route_prefix(), "/back");
        let op = cfg.operator("codex").expect("codex operator");
        assert!(op.enabled);
        assert_eq!(op.interface, "openai_responses");
    }

    #[test]
    fn defaults_when_empty() {
        let cfg = Config::default();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:8080");
        assert_eq!(cfg.database_dsn(), "sqlite://./data/polyroute.db");
        assert!(cfg.operator("codex").is_none());
    }
}

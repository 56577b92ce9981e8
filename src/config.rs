//! TOML configuration.
//!
//! Lookup order for the configuration file:
//! 1. `--config` / `FORGE_CONFIG`
//! 2. `forge.toml` in the current directory
//! 3. `$FORGE_CONFIG_DIR/forge.toml`
//! 4. `~/.config/forge/forge.toml`
//!
//! Every string value may reference environment variables (`$VAR` or
//! `${VAR}`), which keeps credentials out of the file.

use anyhow::{Context, Result, bail};
use reconcile::Connection;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "FORGE_CONFIG_DIR";

pub const CONFIG_FILE: &str = "forge.toml";

/// `PATH` entries containing this marker are hidden from installer steps.
pub const DEFAULT_PATH_MARKER: &str = ".python";

/// Get the forge config directory path
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = PathBuf::from(shellexpand::tilde(&dir).as_ref());
        log::debug!("Using config dir from {ENV_CONFIG_DIR}: {}", path.display());
        return Ok(path);
    }
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("forge"))
}

/// Resolve the configuration file to read.
pub fn locate(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        return Ok(local);
    }
    let path = config_dir()?.join(CONFIG_FILE);
    if path.exists() {
        return Ok(path);
    }
    bail!(
        "No configuration found: looked for ./{CONFIG_FILE} and {}",
        path.display()
    )
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForgeConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(default)]
    pub syncplans: BTreeMap<String, SyncPlanConfig>,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
    #[serde(default)]
    pub domains: BTreeMap<String, DomainConfig>,
    #[serde(default)]
    pub subnets: BTreeMap<String, SubnetConfig>,
    #[serde(default)]
    pub install: InstallConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub default: bool,
    pub default_org: Option<String>,
    pub default_location: Option<String>,
    #[serde(default)]
    pub verify_tls: bool,
    /// Server settings to enforce, by setting name.
    #[serde(default)]
    pub settings: BTreeMap<String, toml::Value>,
}

impl ServerConfig {
    /// Host name without scheme or port.
    pub fn hostname(&self) -> &str {
        let host = self
            .host
            .split_once("://")
            .map_or(self.host.as_str(), |(_, rest)| rest);
        host.split([':', '/']).next().unwrap_or(host)
    }

    pub fn url(&self) -> String {
        if self.host.contains("://") {
            self.host.clone()
        } else {
            format!("https://{}", self.host)
        }
    }

    pub fn connection(&self) -> Connection {
        Connection {
            url: self.url(),
            username: self.username.clone(),
            password: self.password.clone(),
            verify_tls: self.verify_tls,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncPlanConfig {
    /// `hourly`, `daily` or `weekly`
    pub interval: String,
    /// Weekday for non-daily plans
    pub day: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    /// Name of the environment this one is promoted from
    pub prior: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainConfig {
    #[serde(default)]
    pub organizations: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    /// Remaining attributes, sent as-is
    #[serde(flatten)]
    pub attributes: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubnetConfig {
    pub network: String,
    #[serde(default)]
    pub organizations: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    /// Remaining attributes (mask, gateway, ipam...), sent as-is
    #[serde(flatten)]
    pub attributes: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallConfig {
    #[serde(default = "default_path_marker")]
    pub path_marker: String,
    /// Overrides the built-in step list when non-empty
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            path_marker: default_path_marker(),
            steps: Vec::new(),
        }
    }
}

fn default_path_marker() -> String {
    DEFAULT_PATH_MARKER.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StepConfig {
    pub name: String,
    pub command: Vec<String>,
    /// Answer `y` to output lines containing this text
    pub prompt: Option<String>,
}

// ============================================================================
// Loading
// ============================================================================

impl ForgeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    /// Parse a document, expanding environment variables in string values.
    pub fn parse(content: &str) -> Result<Self> {
        let mut value = toml::Value::Table(toml::from_str::<toml::Table>(content)?);
        expand_env(&mut value, "");
        let config: Self = value.try_into()?;
        Ok(config)
    }

    /// Server by name, or the one marked default.
    pub fn server(&self, name: Option<&str>) -> Result<(&str, &ServerConfig)> {
        if let Some(name) = name {
            return self
                .servers
                .get_key_value(name)
                .map(|(k, v)| (k.as_str(), v))
                .with_context(|| format!("Unknown server: {name}"));
        }

        let defaults: Vec<(&String, &ServerConfig)> =
            self.servers.iter().filter(|(_, s)| s.default).collect();
        match defaults[..] {
            [(name, server)] => Ok((name.as_str(), server)),
            [] => bail!(
                "No default server defined, pick one with --server. Servers in configuration: {}",
                self.server_names()
            ),
            _ => bail!(
                "More than one server marked default, pick one with --server: {}",
                defaults
                    .iter()
                    .map(|(n, _)| n.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }

    fn server_names(&self) -> String {
        if self.servers.is_empty() {
            return "(none)".to_string();
        }
        self.servers.keys().cloned().collect::<Vec<_>>().join(", ")
    }
}

/// Expand `$VAR` and `${VAR}` in string values. Unset variables are left
/// as written, so a literal `$` in a password survives.
fn expand_env(value: &mut toml::Value, path: &str) {
    match value {
        toml::Value::String(s) => {
            let expanded = shellexpand::env_with_context_no_errors(s.as_str(), |var| {
                let found = std::env::var(var).ok();
                if found.is_none() {
                    log::debug!("Environment variable {var} in '{path}' is not set, kept as is");
                }
                found
            });
            *s = expanded.into_owned();
        }
        toml::Value::Array(items) => {
            for item in items {
                expand_env(item, path);
            }
        }
        toml::Value::Table(table) => {
            for (key, item) in table.iter_mut() {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                expand_env(item, &child);
            }
        }
        _ => {}
    }
}

/// Convert a TOML value to the JSON sent on the wire.
pub fn to_json(value: &toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::from(s.as_str()),
        toml::Value::Integer(i) => serde_json::Value::from(*i),
        toml::Value::Float(f) => serde_json::Value::from(*f),
        toml::Value::Boolean(b) => serde_json::Value::from(*b),
        toml::Value::Datetime(dt) => serde_json::Value::from(dt.to_string()),
        toml::Value::Array(items) => items.iter().map(to_json).collect(),
        toml::Value::Table(table) => serde_json::Value::Object(
            table
                .iter()
                .map(|(k, v)| (k.clone(), to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[servers.lab]
host = "satellite.lab.example.com"
username = "admin"
password = "secret"
default = true
default_org = "ACME"
default_location = "Lab"

[servers.lab.settings]
content_default_http_proxy = ""
foreman_tasks_sync_task_timeout = 120

[servers.prod]
host = "https://satellite.example.com:8443"
username = "admin"
password = "secret"
verify_tls = true

[syncplans.nightly]
interval = "daily"

[syncplans.weekend]
interval = "weekly"
day = "saturday"

[environments.dev]
name = "Development"
prior = "Library"

[domains."lab.example.com"]
organizations = ["ACME"]
locations = ["Lab"]
dns = "ns1.lab.example.com"

[subnets.provisioning]
network = "10.0.0.0"
mask = "255.255.255.0"
domains = ["lab.example.com"]

[[install.steps]]
name = "pkg-install"
command = ["dnf", "-y", "install", "satellite"]
"#;

    #[test]
    fn test_parse_sample() {
        let config = ForgeConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.syncplans["weekend"].day.as_deref(), Some("saturday"));
        assert_eq!(config.environments["dev"].prior, "Library");
        assert_eq!(
            config.domains["lab.example.com"].attributes["dns"].as_str(),
            Some("ns1.lab.example.com")
        );
        assert_eq!(config.subnets["provisioning"].domains, vec!["lab.example.com"]);
        assert!(config.subnets["provisioning"].attributes.contains_key("mask"));
        assert_eq!(config.install.path_marker, DEFAULT_PATH_MARKER);
        assert_eq!(config.install.steps[0].name, "pkg-install");
    }

    #[test]
    fn test_default_server() {
        let config = ForgeConfig::parse(SAMPLE).unwrap();
        let (name, server) = config.server(None).unwrap();
        assert_eq!(name, "lab");
        assert_eq!(server.settings.len(), 2);
        assert_eq!(config.server(Some("prod")).unwrap().0, "prod");
        assert!(config.server(Some("staging")).is_err());
    }

    #[test]
    fn test_missing_default_lists_servers() {
        let config = ForgeConfig::parse(&SAMPLE.replace("default = true\n", "")).unwrap();
        let err = config.server(None).unwrap_err().to_string();
        assert!(err.contains("lab, prod"));
    }

    #[test]
    fn test_host_forms() {
        let config = ForgeConfig::parse(SAMPLE).unwrap();
        let lab = &config.servers["lab"];
        assert_eq!(lab.url(), "https://satellite.lab.example.com");
        assert_eq!(lab.hostname(), "satellite.lab.example.com");

        let prod = &config.servers["prod"];
        assert_eq!(prod.url(), "https://satellite.example.com:8443");
        assert_eq!(prod.hostname(), "satellite.example.com");
        assert!(prod.connection().verify_tls);
    }

    #[test]
    fn test_env_expansion() {
        let doc = r#"
[servers.lab]
host = "sat.example.com"
username = "admin"
password = "${HOME}"
"#;
        let config = ForgeConfig::parse(doc).unwrap();
        assert_eq!(
            config.servers["lab"].password,
            std::env::var("HOME").unwrap()
        );
    }

    #[test]
    fn test_env_expansion_keeps_unset_variables() {
        let doc = r#"
[servers.lab]
host = "sat.example.com"
username = "admin"
password = "pa$FORGE_TEST_SURELY_UNSET_VARIABLE"
"#;
        let config = ForgeConfig::parse(doc).unwrap();
        assert_eq!(
            config.servers["lab"].password,
            "pa$FORGE_TEST_SURELY_UNSET_VARIABLE"
        );
    }

    #[test]
    fn test_unknown_section_is_rejected() {
        assert!(ForgeConfig::parse("[serverz.lab]\nhost = \"x\"\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = ForgeConfig::load(file.path()).unwrap();
        assert!(config.servers.contains_key("prod"));
        assert_eq!(locate(Some(file.path())).unwrap(), file.path());
    }

    #[test]
    fn test_to_json() {
        let value: toml::Value = toml::from_str("a = 1\nb = [\"x\", true]").unwrap();
        assert_eq!(to_json(&value), serde_json::json!({"a": 1, "b": ["x", true]}));
    }
}

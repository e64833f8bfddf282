use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::host::ServerRegistry;

/// directory (relative to the host config dir) holding every file of this plugin
pub const CONFIG_DIR: &str = "tunnel";
pub const TUNNEL_CONFIG_FILE: &str = "tunnel.yaml";
pub const MAIN_CONFIG_FILE: &str = "main.yaml";
/// read only when `main.yaml` is absent
pub const MAIN_TOML_CONFIG_FILE: &str = "main.toml";
/// tunnel entry managed by the plugin itself
pub const MAIN_TUNNEL: &str = "main";
pub const MAIN_TUNNEL_PROTOCOL: &str = "tcp";

/// Embedder hook run by [`prepare`] before the main tunnel address is derived.
pub type PreConfigFn = Box<dyn Fn(&mut Config) + Send + Sync>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("stat of {0:?} failed: {1}")]
    Stat(PathBuf, std::io::Error),
    #[error("load config file {0:?}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("load config file {0:?}: {1}")]
    TunnelSyntax(PathBuf, serde_yaml::Error),
    #[error("load config file {0:?}: {1}")]
    MainSyntax(PathBuf, serde_yaml::Error),
    #[error("load config file {0:?}: {1}")]
    MainTomlSyntax(PathBuf, toml::de::Error),
    #[error("server index {index} out of range, the host has {count} server(s)")]
    ServerIndexOutOfRange { index: usize, count: usize },
}

/// Integration behaviour of the plugin, read from `tunnel/main.yaml`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct MainConfig {
    /// manage the `main` tunnel pointing at one of the host servers
    pub enabled: bool,
    pub server_index: usize,
    /// launch the client when the host starts serving
    pub auto_start: bool,
    /// forwarded as `-logLevel` when non zero
    pub log_level: i32,
    /// `-` discards, a path truncates into a file, empty inherits
    pub log_stdout: String,
    pub log_stderr: String,
    /// send stderr wherever stdout goes
    pub log_combined: bool,
}

/// Client side configuration of the external tunnel binary.
///
/// The schema belongs to the client: keys this crate does not know about are
/// kept in `extra` and handed back untouched when the config is written to
/// the child's stdin.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct TunnelClientConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub tls_crt: String,
    #[serde(default)]
    pub tls_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_ca: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffConfig>,
    #[serde(default)]
    pub tunnels: BTreeMap<String, TunnelDefinition>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct BackoffConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct TunnelDefinition {
    #[serde(
        rename = "proto",
        alias = "protocol",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local_addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth: String,
    /// per tunnel override of the client certificate
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tls_crt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tls_key: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub main: MainConfig,
    pub tunnel: TunnelClientConfig,
}

/// Result of looking for the plugin configuration.
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(Config),
    /// `tunnel/tunnel.yaml` does not exist, the plugin stays inert
    Skipped,
}

/// The host's configuration directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDir {
    root: PathBuf,
}

impl ConfigDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ConfigDir { root: root.into() }
    }
    pub fn root(&self) -> &Path {
        &self.root
    }
    pub fn path(&self, parts: &[&str]) -> PathBuf {
        parts
            .iter()
            .fold(self.root.clone(), |path, part| path.join(part))
    }
    pub fn exists(&self, parts: &[&str]) -> Result<bool, ConfigError> {
        let path = self.path(parts);
        path.try_exists().map_err(|e| ConfigError::Stat(path, e))
    }
}

/// Loads both configuration files and fills in the TLS defaults.
///
/// A missing tunnel file is not an error: it yields [`LoadOutcome::Skipped`].
/// The main file is `main.yaml`, or `main.toml` when there is no YAML one;
/// with neither, [`MainConfig::default`] applies.
pub fn load_config(dir: &ConfigDir) -> Result<LoadOutcome, ConfigError> {
    if !dir.exists(&[CONFIG_DIR, TUNNEL_CONFIG_FILE])? {
        return Ok(LoadOutcome::Skipped);
    }
    let tunnel_path = dir.path(&[CONFIG_DIR, TUNNEL_CONFIG_FILE]);
    let raw = read(&tunnel_path)?;
    let mut tunnel: TunnelClientConfig =
        serde_yaml::from_str(&raw).map_err(|e| ConfigError::TunnelSyntax(tunnel_path, e))?;

    let main = load_main_config(dir)?;

    if tunnel.tls_crt.is_empty() {
        tunnel.tls_crt = path_string(dir.path(&[CONFIG_DIR, "client.crt"]));
    }
    if tunnel.tls_key.is_empty() {
        tunnel.tls_key = path_string(dir.path(&[CONFIG_DIR, "client.key"]));
    }

    Ok(LoadOutcome::Loaded(Config { main, tunnel }))
}

fn load_main_config(dir: &ConfigDir) -> Result<MainConfig, ConfigError> {
    let has_yaml = dir.exists(&[CONFIG_DIR, MAIN_CONFIG_FILE])?;
    let has_toml = dir.exists(&[CONFIG_DIR, MAIN_TOML_CONFIG_FILE])?;
    if has_yaml {
        if has_toml {
            tracing::warn!(
                ignored = %dir.path(&[CONFIG_DIR, MAIN_TOML_CONFIG_FILE]).display(),
                "both main.yaml and main.toml exist, using main.yaml"
            );
        }
        let path = dir.path(&[CONFIG_DIR, MAIN_CONFIG_FILE]);
        let raw = read(&path)?;
        // an empty file is an empty mapping, not a syntax error
        if raw.trim().is_empty() {
            return Ok(MainConfig::default());
        }
        return serde_yaml::from_str(&raw).map_err(|e| ConfigError::MainSyntax(path, e));
    }
    if has_toml {
        let path = dir.path(&[CONFIG_DIR, MAIN_TOML_CONFIG_FILE]);
        let raw = read(&path)?;
        return toml::from_str(&raw).map_err(|e| ConfigError::MainTomlSyntax(path, e));
    }
    Ok(MainConfig::default())
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))
}

/// Final adjustment of a freshly loaded config against the host state.
///
/// Runs the embedder hook first, then points the `main` tunnel at the
/// configured host server. Calling it again with the same inputs is a no-op.
pub fn prepare(
    config: &mut Config,
    servers: &dyn ServerRegistry,
    pre_config: Option<&PreConfigFn>,
) -> Result<(), ConfigError> {
    if let Some(pre_config) = pre_config {
        pre_config(config);
    }
    if !config.main.enabled {
        return Ok(());
    }

    let index = config.main.server_index;
    let servers = servers.servers();
    let server = servers
        .get(index)
        .ok_or(ConfigError::ServerIndexOutOfRange {
            index,
            count: servers.len(),
        })?;

    let main = config
        .tunnel
        .tunnels
        .entry(MAIN_TUNNEL.to_string())
        .or_default();
    main.protocol = MAIN_TUNNEL_PROTOCOL.to_string();
    main.local_addr = server.addr.clone();
    Ok(())
}

fn path_string(path: PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ServerInfo, StaticServers};
    use tempfile::TempDir;

    fn write_files(tunnel: Option<&str>, main: Option<&str>) -> (TempDir, ConfigDir) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ConfigDir::new(tmp.path());
        std::fs::create_dir_all(dir.path(&[CONFIG_DIR])).unwrap();
        if let Some(tunnel) = tunnel {
            std::fs::write(dir.path(&[CONFIG_DIR, TUNNEL_CONFIG_FILE]), tunnel).unwrap();
        }
        if let Some(main) = main {
            std::fs::write(dir.path(&[CONFIG_DIR, MAIN_CONFIG_FILE]), main).unwrap();
        }
        (tmp, dir)
    }

    fn servers(addr: &str) -> StaticServers {
        StaticServers(vec![ServerInfo {
            name: String::from("default"),
            addr: String::from(addr),
        }])
    }

    fn loaded(dir: &ConfigDir) -> Config {
        match load_config(dir).unwrap() {
            LoadOutcome::Loaded(config) => config,
            LoadOutcome::Skipped => panic!("config unexpectedly skipped"),
        }
    }

    #[test]
    fn missing_tunnel_file_is_skipped() {
        let (_tmp, dir) = write_files(None, Some("enabled: true"));
        assert!(matches!(load_config(&dir).unwrap(), LoadOutcome::Skipped));
    }

    #[test]
    fn check_basic_deserialization() {
        let tunnel = r#"
server_addr: tunnel.example.com:5223
auth_token: s3cret
backoff:
  interval: 500ms
  multiplier: 1.5
tunnels:
  web:
    proto: http
    addr: localhost:8080
    host: web.example.com
  ssh:
    proto: tcp
    local_addr: 127.0.0.1:22
    remote_addr: 0.0.0.0:2222
    tls_crt: /etc/ssh.crt
"#;
        let main = r#"
enabled: true
server_index: 1
auto_start: true
log_level: 3
log_stdout: out.log
log_stderr: "-"
log_combined: false
"#;
        let (_tmp, dir) = write_files(Some(tunnel), Some(main));
        let config = loaded(&dir);
        assert_eq!(
            config.main,
            MainConfig {
                enabled: true,
                server_index: 1,
                auto_start: true,
                log_level: 3,
                log_stdout: String::from("out.log"),
                log_stderr: String::from("-"),
                log_combined: false,
            }
        );
        assert_eq!(config.tunnel.server_addr, "tunnel.example.com:5223");
        assert_eq!(config.tunnel.auth_token.as_deref(), Some("s3cret"));
        assert_eq!(
            config.tunnel.backoff.as_ref().unwrap().multiplier,
            Some(1.5)
        );
        assert_eq!(config.tunnel.tunnels.len(), 2);
        let ssh = config.tunnel.tunnels.get("ssh").unwrap();
        assert_eq!(ssh.protocol, "tcp");
        assert_eq!(ssh.local_addr, "127.0.0.1:22");
        assert_eq!(ssh.tls_crt, "/etc/ssh.crt");
        assert_eq!(config.tunnel.tunnels.get("web").unwrap().host, "web.example.com");
    }

    #[test]
    fn missing_main_file_uses_defaults() {
        let (_tmp, dir) = write_files(Some("server_addr: a:1\n"), None);
        assert_eq!(loaded(&dir).main, MainConfig::default());
    }

    #[test]
    fn tls_paths_default_under_config_dir() {
        let (_tmp, dir) = write_files(Some("server_addr: a:1\n"), None);
        let config = loaded(&dir);
        assert_eq!(
            config.tunnel.tls_crt,
            path_string(dir.path(&["tunnel", "client.crt"]))
        );
        assert_eq!(
            config.tunnel.tls_key,
            path_string(dir.path(&["tunnel", "client.key"]))
        );
    }

    #[test]
    fn explicit_tls_paths_are_kept() {
        let (_tmp, dir) = write_files(
            Some("tls_crt: /certs/c.crt\ntls_key: /certs/c.key\n"),
            None,
        );
        let config = loaded(&dir);
        assert_eq!(config.tunnel.tls_crt, "/certs/c.crt");
        assert_eq!(config.tunnel.tls_key, "/certs/c.key");
    }

    #[test]
    fn malformed_files_name_the_offender() {
        let (_tmp, dir) = write_files(Some("tunnels: [unclosed"), None);
        match load_config(&dir) {
            Err(ConfigError::TunnelSyntax(path, _)) => {
                assert!(path.ends_with("tunnel/tunnel.yaml"))
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let (_tmp, dir) = write_files(Some("server_addr: a:1\n"), Some("enabled: maybe"));
        match load_config(&dir) {
            Err(ConfigError::MainSyntax(path, _)) => assert!(path.ends_with("tunnel/main.yaml")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn main_toml_is_read_when_there_is_no_yaml() {
        let (_tmp, dir) = write_files(Some("server_addr: a:1\n"), None);
        let toml_path = dir.path(&[CONFIG_DIR, MAIN_TOML_CONFIG_FILE]);
        std::fs::write(&toml_path, "auto_start = true\nlog_level = 2\n").unwrap();
        let main = loaded(&dir).main;
        assert!(main.auto_start);
        assert_eq!(main.log_level, 2);

        std::fs::write(dir.path(&[CONFIG_DIR, MAIN_CONFIG_FILE]), "log_level: 5\n").unwrap();
        let main = loaded(&dir).main;
        assert!(!main.auto_start);
        assert_eq!(main.log_level, 5);

        std::fs::remove_file(dir.path(&[CONFIG_DIR, MAIN_CONFIG_FILE])).unwrap();
        std::fs::write(&toml_path, "auto_start = sometimes").unwrap();
        assert!(matches!(
            load_config(&dir),
            Err(ConfigError::MainTomlSyntax(..))
        ));
    }

    #[test]
    fn empty_main_yaml_means_defaults() {
        let (_tmp, dir) = write_files(Some("server_addr: a:1\n"), Some("\n"));
        assert_eq!(loaded(&dir).main, MainConfig::default());
    }

    #[test]
    fn unknown_keys_survive_a_round_trip() {
        let raw = "server_addr: a:1\ninsecure_skip_verify: true\ntunnels:\n  web:\n    proto: http\n    weight: 3\n";
        let parsed: TunnelClientConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(
            parsed.extra.get("insecure_skip_verify"),
            Some(&serde_yaml::Value::Bool(true))
        );
        let written = serde_yaml::to_string(&parsed).unwrap();
        assert!(written.contains("insecure_skip_verify: true"));
        assert!(written.contains("weight: 3"));
    }

    #[test]
    fn prepare_upserts_main_tunnel() {
        let mut config = Config {
            main: MainConfig {
                enabled: true,
                auto_start: true,
                log_stdout: String::from("out.log"),
                ..Default::default()
            },
            ..Default::default()
        };
        prepare(&mut config, &servers(":9000"), None).unwrap();
        let main = config.tunnel.tunnels.get(MAIN_TUNNEL).unwrap();
        assert_eq!(
            *main,
            TunnelDefinition {
                protocol: String::from("tcp"),
                local_addr: String::from(":9000"),
                ..Default::default()
            }
        );
    }

    #[test]
    fn prepare_keeps_other_fields_of_main_and_is_idempotent() {
        let mut config = Config::default();
        config.main.enabled = true;
        config.tunnel.tunnels.insert(
            MAIN_TUNNEL.to_string(),
            TunnelDefinition {
                protocol: String::from("http"),
                host: String::from("app.example.com"),
                ..Default::default()
            },
        );
        let registry = servers("127.0.0.1:8080");
        prepare(&mut config, &registry, None).unwrap();
        let first = config.clone();
        prepare(&mut config, &registry, None).unwrap();
        assert_eq!(first, config);
        let main = config.tunnel.tunnels.get(MAIN_TUNNEL).unwrap();
        assert_eq!(main.protocol, "tcp");
        assert_eq!(main.host, "app.example.com");
    }

    #[test]
    fn prepare_leaves_tunnels_alone_when_disabled() {
        let mut config = Config::default();
        prepare(&mut config, &servers(":9000"), None).unwrap();
        assert!(config.tunnel.tunnels.is_empty());
    }

    #[test]
    fn pre_config_runs_before_address_derivation() {
        let mut config = Config::default();
        let hook: PreConfigFn = Box::new(|config: &mut Config| {
            config.main.enabled = true;
            config.main.server_index = 1;
        });
        let registry = StaticServers(vec![
            ServerInfo {
                name: String::from("public"),
                addr: String::from(":80"),
            },
            ServerInfo {
                name: String::from("admin"),
                addr: String::from(":9443"),
            },
        ]);
        prepare(&mut config, &registry, Some(&hook)).unwrap();
        assert_eq!(
            config.tunnel.tunnels.get(MAIN_TUNNEL).unwrap().local_addr,
            ":9443"
        );
    }

    #[test]
    fn prepare_rejects_unknown_server_index() {
        let mut config = Config::default();
        config.main.enabled = true;
        config.main.server_index = 4;
        let err = prepare(&mut config, &servers(":9000"), None).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ServerIndexOutOfRange { index: 4, count: 1 }
        ));
    }
}

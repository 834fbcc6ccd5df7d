use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::errors::GinError;

/// Aliases that can never name a server: they carry special meaning in
/// remote arguments (`dir:` remotes, `--to all`).
pub const RESERVED_ALIASES: [&str; 2] = ["dir", "all"];

/// The built-in default server alias. Its entry can be overridden but a
/// broken override falls back to the baked-in configuration.
pub const DEFAULT_ALIAS: &str = "gin";

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WebCfg {
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GitCfg {
    pub user: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub hostkey: String,
}

/// One named server: its web API endpoint and its git SSH endpoint.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerCfg {
    pub web: WebCfg,
    pub git: GitCfg,
}

impl ServerCfg {
    /// Web API base address, e.g. `https://gin.g-node.org:443`.
    pub fn web_address(&self) -> String {
        format!("{}://{}:{}", self.web.protocol, self.web.host, self.web.port)
    }

    /// Git SSH base address, e.g. `ssh://git@gin.g-node.org:22`.
    pub fn git_address(&self) -> String {
        format!("ssh://{}@{}:{}", self.git.user, self.git.host, self.git.port)
    }

    /// Full clone URL for an `owner/name` repository path.
    pub fn repo_url(&self, repo_path: &str) -> String {
        format!("{}/{}", self.git_address(), repo_path)
    }

    /// The line written to the known-hosts file for this server.
    pub fn host_key_line(&self) -> &str {
        self.hostkey_or_empty()
    }

    fn hostkey_or_empty(&self) -> &str {
        self.git.hostkey.trim()
    }
}

/// The baked-in configuration for the public GIN server.
pub fn gin_default() -> ServerCfg {
    ServerCfg {
        web: WebCfg {
            protocol: "https".to_string(),
            host: "gin.g-node.org".to_string(),
            port: 443,
        },
        git: GitCfg {
            user: "git".to_string(),
            host: "gin.g-node.org".to_string(),
            port: 22,
            hostkey: "gin.g-node.org,141.84.41.219 ecdsa-sha2-nistp256 AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBE5IBgrLvokQQ9BG8jdnCGLJzLbLjSGJoZuhtJ0BJVRLYCJcnYL2FzLZTyy5x39hUbr9981d0dZtPhTTp9RGdYw=".to_string(),
        },
    }
}

/// Raw file shape, parsed leniently so one broken server entry cannot take
/// the whole registry down.
#[derive(Debug, Default, Deserialize)]
struct RawFile {
    #[serde(default)]
    servers: BTreeMap<String, serde_yaml::Value>,
    #[serde(default, rename = "defaultserver")]
    default_server: Option<String>,
}

/// The named-server registry. Loaded once per process; every mutation is
/// written back to the user configuration file immediately.
#[derive(Debug)]
pub struct ServerRegistry {
    path: PathBuf,
    servers: BTreeMap<String, ServerCfg>,
    default_alias: String,
}

impl ServerRegistry {
    /// Loads the registry from `<dir>/config.yml`. Invalid entries for the
    /// built-in alias revert to the baked-in default; other invalid entries
    /// are dropped with a warning. The built-in alias is always present.
    pub fn load(dir: &Path) -> Result<ServerRegistry, GinError> {
        let path = dir.join("config.yml");
        let raw: RawFile = match fs::read_to_string(&path) {
            Ok(text) => serde_yaml::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RawFile::default(),
            Err(e) => return Err(e.into()),
        };

        let mut servers = BTreeMap::new();
        for (alias, value) in raw.servers {
            match validate_entry(&alias, value) {
                Ok(cfg) => {
                    servers.insert(alias, cfg);
                }
                Err(reason) if alias == DEFAULT_ALIAS => {
                    warn!(
                        "Invalid configuration for server '{}' ({}); using the built-in default",
                        alias, reason
                    );
                }
                Err(reason) => {
                    warn!("Dropping invalid server '{}': {}", alias, reason);
                }
            }
        }
        servers
            .entry(DEFAULT_ALIAS.to_string())
            .or_insert_with(gin_default);

        let default_alias = match raw.default_server {
            Some(alias) if servers.contains_key(&alias) => alias,
            Some(alias) => {
                warn!(
                    "Default server '{}' is not configured; falling back to '{}'",
                    alias, DEFAULT_ALIAS
                );
                DEFAULT_ALIAS.to_string()
            }
            None => DEFAULT_ALIAS.to_string(),
        };

        Ok(ServerRegistry {
            path,
            servers,
            default_alias,
        })
    }

    pub fn servers(&self) -> &BTreeMap<String, ServerCfg> {
        &self.servers
    }

    pub fn get(&self, alias: &str) -> Option<&ServerCfg> {
        self.servers.get(alias)
    }

    pub fn default_alias(&self) -> &str {
        &self.default_alias
    }

    pub fn default_server(&self) -> &ServerCfg {
        // load() guarantees the default alias resolves
        &self.servers[&self.default_alias]
    }

    /// Registers a server and persists the registry. Reserved aliases and
    /// empty names are usage errors, as is re-adding an existing alias.
    pub fn add_server(&mut self, alias: &str, cfg: ServerCfg) -> Result<(), GinError> {
        if alias.is_empty() {
            return Err(GinError::usage("add-server", "server alias cannot be empty"));
        }
        if RESERVED_ALIASES.contains(&alias) {
            return Err(GinError::usage(
                "add-server",
                format!("the alias '{}' is reserved and cannot name a server", alias),
            ));
        }
        if self.servers.contains_key(alias) {
            return Err(GinError::usage(
                "add-server",
                format!("server '{}' is already configured", alias),
            ));
        }
        self.servers.insert(alias.to_string(), cfg);
        self.store()
    }

    /// Removes a server and persists the registry. Removing the default
    /// server resets the default to the built-in alias; removing the
    /// built-in alias restores its baked-in configuration.
    pub fn remove_server(&mut self, alias: &str) -> Result<(), GinError> {
        if self.servers.remove(alias).is_none() {
            return Err(GinError::usage(
                "remove-server",
                format!("server '{}' is not configured", alias),
            ));
        }
        if alias == DEFAULT_ALIAS {
            self.servers.insert(DEFAULT_ALIAS.to_string(), gin_default());
        }
        if self.default_alias == alias {
            self.default_alias = DEFAULT_ALIAS.to_string();
        }
        self.store()
    }

    /// Points the default-server alias at an existing entry and persists.
    pub fn set_default(&mut self, alias: &str) -> Result<(), GinError> {
        if !self.servers.contains_key(alias) {
            return Err(GinError::usage(
                "use-server",
                format!("server '{}' is not configured", alias),
            ));
        }
        self.default_alias = alias.to_string();
        self.store()
    }

    /// Writes the registry back into the user configuration file, leaving
    /// unrelated keys (bin paths, annex settings) untouched.
    fn store(&self) -> Result<(), GinError> {
        let mut document: serde_yaml::Mapping = match fs::read_to_string(&self.path) {
            Ok(text) => serde_yaml::from_str(&text).unwrap_or_default(),
            Err(_) => serde_yaml::Mapping::new(),
        };

        document.insert(
            serde_yaml::Value::from("servers"),
            serde_yaml::to_value(&self.servers)?,
        );
        document.insert(
            serde_yaml::Value::from("defaultserver"),
            serde_yaml::Value::from(self.default_alias.as_str()),
        );

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_yaml::to_string(&document)?)?;
        Ok(())
    }
}

/// Validation shim: ports are parsed wide so an out-of-range value is a
/// recoverable per-entry problem instead of a file-level parse failure.
#[derive(Deserialize)]
struct WideWebCfg {
    protocol: String,
    host: String,
    port: i64,
}

#[derive(Deserialize)]
struct WideGitCfg {
    user: String,
    host: String,
    port: i64,
    #[serde(default)]
    hostkey: String,
}

#[derive(Deserialize)]
struct WideServerCfg {
    web: WideWebCfg,
    git: WideGitCfg,
}

fn validate_entry(alias: &str, value: serde_yaml::Value) -> Result<ServerCfg, String> {
    if RESERVED_ALIASES.contains(&alias) {
        return Err(format!("'{}' is a reserved alias", alias));
    }

    let wide: WideServerCfg = serde_yaml::from_value(value).map_err(|e| e.to_string())?;
    let web_port = port_in_range(wide.web.port)?;
    let git_port = port_in_range(wide.git.port)?;

    Ok(ServerCfg {
        web: WebCfg {
            protocol: wide.web.protocol,
            host: wide.web.host,
            port: web_port,
        },
        git: GitCfg {
            user: wide.git.user,
            host: wide.git.host,
            port: git_port,
            hostkey: wide.git.hostkey,
        },
    })
}

fn port_in_range(port: i64) -> Result<u16, String> {
    u16::try_from(port).map_err(|_| format!("port {} is outside 0..65535", port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_server(host: &str) -> ServerCfg {
        ServerCfg {
            web: WebCfg {
                protocol: "https".into(),
                host: host.into(),
                port: 443,
            },
            git: GitCfg {
                user: "git".into(),
                host: host.into(),
                port: 22,
                hostkey: format!("{} ecdsa-sha2-nistp256 AAAATEST", host),
            },
        }
    }

    #[test]
    fn addresses() {
        let cfg = sample_server("gin.example.org");
        assert_eq!(cfg.web_address(), "https://gin.example.org:443");
        assert_eq!(cfg.git_address(), "ssh://git@gin.example.org:22");
        assert_eq!(
            cfg.repo_url("alice/empty"),
            "ssh://git@gin.example.org:22/alice/empty"
        );
    }

    #[test]
    fn empty_registry_has_builtin_default() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServerRegistry::load(dir.path()).unwrap();
        assert_eq!(registry.default_alias(), "gin");
        assert_eq!(registry.default_server().web.host, "gin.g-node.org");
    }

    #[test]
    fn reserved_aliases_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ServerRegistry::load(dir.path()).unwrap();
        for alias in RESERVED_ALIASES {
            let err = registry.add_server(alias, sample_server("x")).unwrap_err();
            assert!(matches!(err, GinError::Usage { .. }));
        }
    }

    #[test]
    fn out_of_range_port_drops_entry() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "servers:\n  broken:\n    web: {protocol: https, host: x, port: 99999}\n    git: {user: git, host: x, port: 22}\n";
        fs::write(dir.path().join("config.yml"), yaml).unwrap();

        let registry = ServerRegistry::load(dir.path()).unwrap();
        assert!(registry.get("broken").is_none());
        assert!(registry.get("gin").is_some());
    }

    #[test]
    fn invalid_gin_entry_reverts_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "servers:\n  gin:\n    web: {protocol: https, host: elsewhere, port: -1}\n    git: {user: git, host: elsewhere, port: 22}\n";
        fs::write(dir.path().join("config.yml"), yaml).unwrap();

        let registry = ServerRegistry::load(dir.path()).unwrap();
        assert_eq!(registry.get("gin").unwrap().web.host, "gin.g-node.org");
    }

    #[test]
    fn add_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ServerRegistry::load(dir.path()).unwrap();
        let before: Vec<String> = registry.servers().keys().cloned().collect();

        registry.add_server("lab", sample_server("lab.example.org")).unwrap();
        assert!(registry.get("lab").is_some());

        // the mutation must already be on disk
        let reloaded = ServerRegistry::load(dir.path()).unwrap();
        assert!(reloaded.get("lab").is_some());

        registry.remove_server("lab").unwrap();
        let after: Vec<String> = registry.servers().keys().cloned().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn removing_default_server_resets_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ServerRegistry::load(dir.path()).unwrap();
        registry.add_server("lab", sample_server("lab.example.org")).unwrap();
        registry.set_default("lab").unwrap();
        assert_eq!(registry.default_alias(), "lab");

        registry.remove_server("lab").unwrap();
        assert_eq!(registry.default_alias(), "gin");
    }

    #[test]
    fn removing_builtin_restores_baked_default() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "servers:\n  gin:\n    web: {protocol: http, host: mirror, port: 80}\n    git: {user: git, host: mirror, port: 2222}\n";
        fs::write(dir.path().join("config.yml"), yaml).unwrap();

        let mut registry = ServerRegistry::load(dir.path()).unwrap();
        assert_eq!(registry.get("gin").unwrap().web.host, "mirror");

        registry.remove_server("gin").unwrap();
        assert_eq!(registry.get("gin").unwrap().web.host, "gin.g-node.org");
    }

    #[test]
    fn store_preserves_unrelated_keys() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.yml"),
            "bin:\n  git: /usr/local/bin/git\n",
        )
        .unwrap();

        let mut registry = ServerRegistry::load(dir.path()).unwrap();
        registry.add_server("lab", sample_server("lab.example.org")).unwrap();

        let text = fs::read_to_string(dir.path().join("config.yml")).unwrap();
        assert!(text.contains("/usr/local/bin/git"));
        assert!(text.contains("lab.example.org"));
    }
}

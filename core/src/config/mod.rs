use std::fs;
use std::path::{Path, PathBuf};

use directories_next::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::errors::GinError;

pub mod servers;

pub use servers::{gin_default, ServerCfg, ServerRegistry, DEFAULT_ALIAS, RESERVED_ALIASES};

/// Paths of the external tools the engine drives. Bare names are resolved
/// through PATH at spawn time.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinCfg {
    pub git: String,
    pub gitannex: String,
    pub ssh: String,
}

impl Default for BinCfg {
    fn default() -> Self {
        BinCfg {
            git: "git".to_string(),
            gitannex: "git-annex".to_string(),
            ssh: "ssh".to_string(),
        }
    }
}

/// Large-file handling knobs. `minsize` is passed through to the extension
/// as a size threshold; `exclude` patterns are never annexed.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnexCfg {
    pub minsize: String,
    pub exclude: Vec<String>,
}

impl Default for AnnexCfg {
    fn default() -> Self {
        AnnexCfg {
            minsize: "10M".to_string(),
            exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    bin: BinCfg,
    #[serde(default)]
    annex: AnnexCfg,
}

/// Only these keys are honoured from a repository-local `config.yml`.
#[derive(Debug, Default, Deserialize)]
struct LocalSettingsFile {
    #[serde(default)]
    annex: LocalAnnexCfg,
}

#[derive(Debug, Default, Deserialize)]
struct LocalAnnexCfg {
    minsize: Option<String>,
    exclude: Option<Vec<String>>,
}

/// Populated global settings: tool paths and annex knobs, with the config
/// directory they came from.
#[derive(Clone, Debug)]
pub struct GlobalConfig {
    pub dir: PathBuf,
    pub bin: BinCfg,
    pub annex: AnnexCfg,
}

impl GlobalConfig {
    /// Reads `<dir>/config.yml`. A missing or unreadable file yields the
    /// defaults; the server sections of the same file belong to
    /// [`ServerRegistry`].
    pub fn load(dir: &Path) -> GlobalConfig {
        let path = dir.join("config.yml");
        let settings: SettingsFile = match fs::read_to_string(&path) {
            Ok(text) => serde_yaml::from_str(&text).unwrap_or_else(|e| {
                warn!("Could not parse {}: {}", path.display(), e);
                SettingsFile::default()
            }),
            Err(_) => SettingsFile::default(),
        };

        GlobalConfig {
            dir: dir.to_path_buf(),
            bin: settings.bin,
            annex: settings.annex,
        }
    }

    /// Resolves the configured tool names to concrete paths, searching PATH
    /// for bare names. A missing tool is reported up front instead of as a
    /// spawn failure mid-verb.
    pub fn locate_binaries(&self) -> Result<(PathBuf, PathBuf), GinError> {
        let git = which::which(&self.bin.git).map_err(|_| {
            GinError::usage(
                "config",
                format!("git executable '{}' was not found", self.bin.git),
            )
        })?;
        let gitannex = which::which(&self.bin.gitannex).map_err(|_| {
            GinError::usage(
                "config",
                format!(
                    "git-annex executable '{}' was not found",
                    self.bin.gitannex
                ),
            )
        })?;
        Ok((git, gitannex))
    }

    /// Overlays the repository-local `config.yml`, honouring only the annex
    /// exclusion patterns and size threshold.
    pub fn with_local_overlay(mut self, repo_root: &Path) -> GlobalConfig {
        let path = repo_root.join("config.yml");
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => return self,
        };

        match serde_yaml::from_str::<LocalSettingsFile>(&text) {
            Ok(local) => {
                if let Some(minsize) = local.annex.minsize {
                    debug!("Local config overrides annex.minsize = {}", minsize);
                    self.annex.minsize = minsize;
                }
                if let Some(exclude) = local.annex.exclude {
                    debug!("Local config overrides annex.exclude ({} patterns)", exclude.len());
                    self.annex.exclude = exclude;
                }
            }
            Err(e) => warn!("Ignoring unparseable {}: {}", path.display(), e),
        }
        self
    }
}

/// The per-user configuration directory. `GIN_CONFIG_DIR` overrides the
/// platform default, which keeps tests and scripted setups hermetic.
pub fn config_dir() -> Result<PathBuf, GinError> {
    if let Ok(dir) = std::env::var("GIN_CONFIG_DIR") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    let dirs = ProjectDirs::from("org", "g-node", "gin").ok_or_else(|| {
        GinError::usage("config", "unable to determine the user configuration directory")
    })?;
    Ok(dirs.config_dir().to_path_buf())
}

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ServerCfg;
use crate::utils::paths::slash;

/// What a remote argument resolved to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RemoteKind {
    Gin,
    Directory,
    Unknown,
}

/// A parsed remote reference with its concrete URL.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Remote {
    pub kind: RemoteKind,
    pub server: String,
    pub path: String,
    pub url: String,
}

/// Parses an `alias:path` remote argument. `dir:` names a filesystem
/// remote (resolved against `base`), a known server alias names a Gin
/// remote, and anything else passes through verbatim as a full URL.
pub fn parse_remote(arg: &str, servers: &BTreeMap<String, ServerCfg>, base: &Path) -> Remote {
    let Some((alias, path)) = arg.split_once(':') else {
        return Remote {
            kind: RemoteKind::Unknown,
            server: String::new(),
            path: arg.to_string(),
            url: arg.to_string(),
        };
    };

    if alias == "dir" {
        let absolute = if Path::new(path).is_absolute() {
            Path::new(path).to_path_buf()
        } else {
            base.join(path)
        };
        return Remote {
            kind: RemoteKind::Directory,
            server: alias.to_string(),
            path: path.to_string(),
            url: slash(&absolute),
        };
    }

    if let Some(server) = servers.get(alias) {
        return Remote {
            kind: RemoteKind::Gin,
            server: alias.to_string(),
            path: path.to_string(),
            url: server.repo_url(path),
        };
    }

    Remote {
        kind: RemoteKind::Unknown,
        server: alias.to_string(),
        path: path.to_string(),
        url: arg.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::servers::{GitCfg, WebCfg};

    fn servers() -> BTreeMap<String, ServerCfg> {
        let lab = ServerCfg {
            web: WebCfg {
                protocol: "https".into(),
                host: "lab.example.org".into(),
                port: 443,
            },
            git: GitCfg {
                user: "git".into(),
                host: "lab.example.org".into(),
                port: 2222,
                hostkey: String::new(),
            },
        };
        [("lab".to_string(), lab)].into_iter().collect()
    }

    #[test]
    fn known_alias_is_a_gin_remote() {
        let remote = parse_remote("lab:alice/data", &servers(), Path::new("/work"));
        assert_eq!(remote.kind, RemoteKind::Gin);
        assert_eq!(remote.server, "lab");
        assert_eq!(remote.path, "alice/data");
        assert_eq!(remote.url, "ssh://git@lab.example.org:2222/alice/data");
    }

    #[test]
    fn dir_remotes_resolve_to_absolute_paths() {
        let remote = parse_remote("dir:../backup", &servers(), Path::new("/work/repo"));
        assert_eq!(remote.kind, RemoteKind::Directory);
        assert_eq!(remote.url, "/work/repo/../backup");

        let remote = parse_remote("dir:/mnt/backup", &servers(), Path::new("/work/repo"));
        assert_eq!(remote.url, "/mnt/backup");
    }

    #[test]
    fn unknown_alias_passes_through() {
        let remote = parse_remote(
            "https://example.org/alice/data.git",
            &servers(),
            Path::new("/work"),
        );
        assert_eq!(remote.kind, RemoteKind::Unknown);
        assert_eq!(remote.url, "https://example.org/alice/data.git");

        let remote = parse_remote("elsewhere:alice/data", &servers(), Path::new("/work"));
        assert_eq!(remote.kind, RemoteKind::Unknown);
        assert_eq!(remote.url, "elsewhere:alice/data");
    }
}

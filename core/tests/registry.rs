use std::fs;

use test_log::test;
use tracing::info;

use gin_core::auth::{delete_token, load_token, save_token, UserToken};
use gin_core::config::{GlobalConfig, ServerRegistry};

/// Exercises the persistent state layout end to end on a fresh config
/// directory: registry write-back, token files, and the settings overlay
/// all share one `config.yml`-rooted directory.
#[test]
fn config_directory_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;

    info!("Seeding a config file with settings and one extra server");
    fs::write(
        dir.path().join("config.yml"),
        concat!(
            "bin:\n",
            "  gitannex: /opt/annex/git-annex\n",
            "annex:\n",
            "  minsize: 20M\n",
            "servers:\n",
            "  lab:\n",
            "    web: {protocol: https, host: lab.example.org, port: 443}\n",
            "    git: {user: git, host: lab.example.org, port: 2222, hostkey: 'lab.example.org ecdsa-sha2-nistp256 AAAA'}\n",
            "defaultserver: lab\n",
        ),
    )?;

    let conf = GlobalConfig::load(dir.path());
    assert_eq!(conf.bin.gitannex, "/opt/annex/git-annex");
    assert_eq!(conf.bin.git, "git");
    assert_eq!(conf.annex.minsize, "20M");

    let mut registry = ServerRegistry::load(dir.path())?;
    assert_eq!(registry.default_alias(), "lab");
    assert!(registry.get("gin").is_some());

    info!("Mutations persist immediately and survive a reload");
    registry.set_default("gin")?;
    let reloaded = ServerRegistry::load(dir.path())?;
    assert_eq!(reloaded.default_alias(), "gin");

    // the settings section of the shared file survives registry writes
    let conf = GlobalConfig::load(dir.path());
    assert_eq!(conf.annex.minsize, "20M");

    info!("Token files live next to the registry, one per alias");
    let token = UserToken {
        username: "alice".into(),
        token: "cafebabe".into(),
    };
    save_token(dir.path(), "lab", &token)?;
    assert_eq!(load_token(dir.path(), "lab")?.unwrap(), token);
    assert!(dir.path().join("lab").is_file());

    delete_token(dir.path(), "lab")?;
    assert!(!dir.path().join("lab").exists());

    Ok(())
}

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;
use tracing::{debug, warn};

use crate::clients::annex::Annex;
use crate::clients::git::Git;
use crate::clients::web::WebClient;
use crate::ops::{fail, Verb};
use crate::types::errors::GinError;
use crate::types::progress::{OpState, RepoFileStatus};

/// Prepares a directory as a gin repository: source-control init, user
/// identity, a root commit when history is empty, annex init, and the
/// origin remote. Progress is synthesised at fixed steps; the phases are
/// quick but the consumer still sees movement.
pub struct InitDirOp {
    pub git: Git,
    pub annex: Annex,
    pub web: WebClient,
    pub username: String,
    pub hostname: String,
    /// Annex description for this working copy.
    pub description: String,
    /// URL for the origin remote; empty leaves remotes untouched.
    pub remote_url: String,
}

impl InitDirOp {
    pub(crate) async fn run_steps(&self, tx: &Sender<RepoFileStatus>) -> Result<(), GinError> {
        let step = |progress: &str| {
            RepoFileStatus::transfer(OpState::InitialisingStorage, "", progress, "")
        };

        let _ = tx.send(step("10%")).await;
        if !self.git.repo_path().join(".git").exists() {
            self.git.init().await?;
        }

        let _ = tx.send(step("20%")).await;
        self.configure_identity().await?;

        let _ = tx.send(step("30%")).await;
        #[cfg(windows)]
        self.git.set_config("core.symlinks", "false").await?;

        let _ = tx.send(step("40%")).await;
        let synthesised_root = if !self.git.has_commits().await {
            self.git.commit_allow_empty("Initial commit").await?;
            true
        } else {
            false
        };

        let _ = tx.send(step("50%")).await;
        self.annex.init(&self.description).await?;

        if !self.remote_url.is_empty() {
            let remotes = self.git.remotes().await?;
            if !remotes.contains_key("origin") {
                self.git.remote_add("origin", &self.remote_url).await?;
            }
        }

        if synthesised_root && !self.remote_url.is_empty() {
            self.git.push_upstream("origin", "master").await?;
            self.annex.sync(false, tx).await?;
        }

        let _ = tx
            .send(RepoFileStatus::done(OpState::InitialisingStorage, ""))
            .await;
        Ok(())
    }

    /// Sets the local committer identity from the server profile when no
    /// identity is configured anywhere. Best effort: a failed profile
    /// lookup falls back to the bare username.
    async fn configure_identity(&self) -> Result<(), GinError> {
        let local = self.git.get_config("user.name").await?;
        let global = self.git.get_config_global("user.name").await?;
        if local.is_some() || global.is_some() {
            return Ok(());
        }

        let (name, email) = match self.web.get_user(&self.username).await {
            Ok(account) => {
                let name = if account.full_name.is_empty() {
                    account.username
                } else {
                    account.full_name
                };
                let email = if account.email.is_empty() {
                    format!("{}@{}", self.username, self.hostname)
                } else {
                    account.email
                };
                (name, email)
            }
            Err(e) => {
                debug!("Could not fetch user profile: {}", e);
                (
                    self.username.clone(),
                    format!("{}@{}", self.username, self.hostname),
                )
            }
        };

        self.git.set_config("user.name", &name).await?;
        self.git.set_config("user.email", &email).await?;
        Ok(())
    }
}

#[async_trait]
impl Verb for InitDirOp {
    fn name(&self) -> &'static str {
        "init"
    }

    async fn run(self: Box<Self>, tx: Sender<RepoFileStatus>) -> Result<(), GinError> {
        match self.run_steps(&tx).await {
            Ok(()) => Ok(()),
            Err(e) => Err(fail(&tx, OpState::InitialisingStorage, e).await),
        }
    }
}

/// Clone followed by local initialisation, as one merged stream.
pub struct CloneOp {
    /// Directory the clone lands in (the new repository appears inside).
    pub target_dir: PathBuf,
    pub repo_slug: String,
    pub url: String,
    pub git_bin: String,
    pub annex_bin: String,
    pub envs: Vec<(String, String)>,
    pub web: WebClient,
    pub username: String,
    pub hostname: String,
}

#[async_trait]
impl Verb for CloneOp {
    fn name(&self) -> &'static str {
        "get"
    }

    async fn run(self: Box<Self>, tx: Sender<RepoFileStatus>) -> Result<(), GinError> {
        let clone_git = Git::new(&self.git_bin, &self.target_dir).with_envs(self.envs.clone());
        // clone emits its own terminal error event
        clone_git.clone(&self.url, &self.repo_slug, &tx).await?;

        let repo_name = self
            .repo_slug
            .rsplit('/')
            .next()
            .unwrap_or(&self.repo_slug)
            .to_string();
        let repo_root = self.target_dir.join(&repo_name);
        if !repo_root.exists() {
            warn!("Clone finished but {} does not exist", repo_root.display());
            let err = GinError::remote(
                "get",
                format!("download failed: '{}' was not created", repo_name),
            );
            return Err(fail(&tx, OpState::DownloadingRepo, err).await);
        }

        let description = format!("{}@{}", self.username, self.hostname);
        let init = InitDirOp {
            git: Git::new(&self.git_bin, &repo_root).with_envs(self.envs.clone()),
            annex: Annex::new(&self.annex_bin, &repo_root).with_envs(self.envs.clone()),
            web: self.web,
            username: self.username,
            hostname: self.hostname,
            description,
            remote_url: self.url,
        };
        match init.run_steps(&tx).await {
            Ok(()) => Ok(()),
            Err(e) => Err(fail(&tx, OpState::InitialisingStorage, e).await),
        }
    }
}

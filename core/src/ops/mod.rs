use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, Sender};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::auth::{self, ssh, UserToken};
use crate::clients::annex::Annex;
use crate::clients::git::{Git, ListMode};
use crate::clients::web::WebClient;
use crate::config::{AnnexCfg, GlobalConfig, ServerCfg, ServerRegistry};
use crate::types::commits::Commit;
use crate::types::errors::GinError;
use crate::types::progress::{FileCheckoutStatus, OpState, RepoFileStatus};
use crate::types::repo::{FileStatus, PublicKey, Repository};
use crate::utils::paths::{expand_globs, valid_repo_path};

pub mod clone;
pub mod content;
pub mod download;
pub mod remotes;
pub mod status;
pub mod upload;
pub mod version;

pub use remotes::{parse_remote, Remote, RemoteKind};

use clone::{CloneOp, InitDirOp};
use content::{ContentAction, ContentOp};
use download::{DownloadOp, SyncOp};
use status::{classify_direct, classify_indirect, ClassifierInput};
use upload::UploadOp;
use version::{CheckoutCopiesOp, CheckoutVersionOp};

/// A finite, non-restartable stream of progress events. The stream ends
/// when the producing pipeline completes; an abandoned consumer blocks the
/// producer on the bounded channel.
pub type StatusStream = ReceiverStream<RepoFileStatus>;
/// Event stream of the `checkout-file-copies` verb.
pub type CheckoutStream = ReceiverStream<FileCheckoutStatus>;

const CHANNEL_CAPACITY: usize = 64;

/// One high-level operation with a progress stream. Phase errors are
/// emitted as a terminal event by the implementation before it returns.
#[async_trait]
pub trait Verb: Send + 'static {
    fn name(&self) -> &'static str;
    async fn run(self: Box<Self>, tx: Sender<RepoFileStatus>) -> Result<(), GinError>;
}

/// Emits the terminal error event for a failed phase and hands the error
/// back for propagation.
pub(crate) async fn fail(
    tx: &Sender<RepoFileStatus>,
    state: OpState,
    err: GinError,
) -> GinError {
    error!("{}: {}", err.origin(), err);
    let _ = tx
        .send(RepoFileStatus::failed(state, "", err.to_string()))
        .await;
    err
}

fn start_verb(verb: Box<dyn Verb>) -> StatusStream {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let name = verb.name();
        debug!("Starting {}", name);
        match verb.run(tx).await {
            Ok(()) => debug!("{} finished", name),
            Err(e) => debug!("{} ended with error: {}", name, e),
        }
    });
    ReceiverStream::new(rx)
}

/// A repository session against one server: the entry point for every
/// high-level verb. The repository root is held explicitly, so sessions
/// compose without process-global working-directory state.
#[derive(Debug)]
pub struct Session {
    alias: String,
    server: ServerCfg,
    servers: BTreeMap<String, ServerCfg>,
    conf: GlobalConfig,
    web: WebClient,
    token: Option<UserToken>,
    root: PathBuf,
}

impl Session {
    /// Opens a session for `alias` (or the default server) rooted at
    /// `root`. The token for the alias is loaded if present; nothing
    /// validates it against the server.
    pub fn new(
        alias: Option<&str>,
        registry: &ServerRegistry,
        conf: GlobalConfig,
        root: impl Into<PathBuf>,
    ) -> Result<Session, GinError> {
        let alias = alias.unwrap_or(registry.default_alias()).to_string();
        let server = registry.get(&alias).cloned().ok_or_else(|| {
            GinError::usage(
                "session",
                format!("server '{}' is not configured", alias),
            )
        })?;

        let token = auth::load_token(&conf.dir, &alias)?;
        let web = WebClient::new(&server.web_address())?
            .with_token(token.as_ref().map(|t| t.token.clone()));

        Ok(Session {
            alias,
            server,
            servers: registry.servers().clone(),
            conf,
            web,
            token,
            root: root.into(),
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn server(&self) -> &ServerCfg {
        &self.server
    }

    pub fn web(&self) -> &WebClient {
        &self.web
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn username(&self) -> Option<&str> {
        self.token.as_ref().map(|t| t.username.as_str())
    }

    pub fn is_logged_in(&self) -> bool {
        self.token.is_some()
    }

    fn require_login(&self, origin: &'static str) -> Result<&UserToken, GinError> {
        self.token.as_ref().ok_or_else(|| {
            GinError::usage(
                origin,
                format!("you are not logged in to '{}'", self.alias),
            )
        })
    }

    fn assert_repository(&self, origin: &'static str) -> Result<(), GinError> {
        if self.root.join(".git").exists() {
            Ok(())
        } else {
            Err(GinError::usage(
                origin,
                "this command must be run from inside a repository",
            ))
        }
    }

    fn hostname(&self) -> String {
        gethostname::gethostname().to_string_lossy().into_owned()
    }

    /// Environment for child processes. Writes the pinned host key and
    /// points the transport at the session key when logged in.
    fn ssh_envs(&self) -> Result<Vec<(String, String)>, GinError> {
        let mut envs = Vec::new();
        if let Some(token) = &self.token {
            let known_hosts = ssh::write_known_hosts(&self.conf.dir, &self.server)?;
            let key_path = ssh::key_file_path(&self.conf.dir, &token.username, &self.alias);
            if key_path.exists() {
                envs.push(ssh::git_ssh_command(
                    &self.conf.bin.ssh,
                    &key_path,
                    &known_hosts,
                ));
            } else {
                warn!(
                    "No session key for {}@{}; remote operations may prompt",
                    token.username, self.alias
                );
            }
        }
        Ok(envs)
    }

    fn git(&self) -> Result<Git, GinError> {
        Ok(Git::new(&self.conf.bin.git, &self.root).with_envs(self.ssh_envs()?))
    }

    fn annex(&self) -> Result<Annex, GinError> {
        Ok(Annex::new(&self.conf.bin.gitannex, &self.root).with_envs(self.ssh_envs()?))
    }

    /// Annex settings with the repository-local overlay applied.
    fn annex_conf(&self) -> AnnexCfg {
        self.conf.clone().with_local_overlay(&self.root).annex
    }

    // ---- account lifecycle ----

    /// Obtains a token, persists it, and publishes a fresh session key.
    /// A previous login for the alias is replaced wholesale.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), GinError> {
        let token_value = self.web.login(username, password).await?;
        let token = UserToken {
            username: username.to_string(),
            token: token_value,
        };
        auth::save_token(&self.conf.dir, &self.alias, &token)?;
        self.web = self.web.clone().with_token(Some(token.token.clone()));
        self.token = Some(token);

        let session_key = ssh::generate_session_key(username)?;
        let key_path = ssh::key_file_path(&self.conf.dir, username, &self.alias);
        ssh::write_private_key(&key_path, &session_key.private_openssh)?;
        self.web
            .add_key(&session_key.public_openssh, &session_key.title)
            .await?;

        info!("Logged in as {}@{}", username, self.alias);
        Ok(())
    }

    /// Removes the server-side key (best effort), the private key file and
    /// the token.
    pub async fn logout(&mut self) -> Result<(), GinError> {
        let token = self.require_login("logout")?.clone();

        let title = ssh::key_title(&token.username);
        if let Err(e) = self.web.delete_key_by_title(&title).await {
            warn!("Could not delete server key '{}': {}", title, e);
        }

        let key_path = ssh::key_file_path(&self.conf.dir, &token.username, &self.alias);
        ssh::remove_private_key(&key_path)?;
        auth::delete_token(&self.conf.dir, &self.alias)?;

        self.token = None;
        self.web = self.web.clone().with_token(None);
        info!("Logged out {}@{}", token.username, self.alias);
        Ok(())
    }

    // ---- repository management over the web API ----

    pub async fn create_repo(
        &self,
        name: &str,
        description: &str,
    ) -> Result<Repository, GinError> {
        self.require_login("create")?;
        if name.is_empty() {
            return Err(GinError::usage("create", "repository name cannot be empty"));
        }
        self.web.create_repo(name, description).await
    }

    pub async fn del_repo(&self, repo_path: &str) -> Result<(), GinError> {
        self.require_login("delete")?;
        if !valid_repo_path(repo_path) {
            return Err(GinError::usage(
                "delete",
                format!("'{}' is not a valid repository path (owner/name)", repo_path),
            ));
        }
        self.web.del_repo(repo_path).await
    }

    pub async fn repo_info(&self, repo_path: &str) -> Result<Repository, GinError> {
        if !valid_repo_path(repo_path) {
            return Err(GinError::usage(
                "info",
                format!("'{}' is not a valid repository path (owner/name)", repo_path),
            ));
        }
        self.web.get_repo(repo_path).await
    }

    pub async fn repos(&self, user: Option<&str>) -> Result<Vec<Repository>, GinError> {
        let user = match user {
            Some(user) => user.to_string(),
            None => self.require_login("repos")?.username.clone(),
        };
        self.web.list_repos(&user).await
    }

    pub async fn keys(&self) -> Result<Vec<PublicKey>, GinError> {
        self.require_login("keys")?;
        self.web.get_keys().await
    }

    /// Versions of the two external tools, for diagnostics output.
    pub async fn tool_versions(&self) -> Result<(String, String), GinError> {
        let (git_bin, annex_bin) = self.conf.locate_binaries()?;
        let git = Git::new(git_bin, &self.root);
        let annex = Annex::new(annex_bin, &self.root);
        Ok((git.version().await?, annex.version().await?))
    }

    // ---- high-level verbs ----

    /// Upload: add, record, then push to each remote in order. With no
    /// explicit remotes the default remote is used.
    pub async fn upload(
        &self,
        paths: Vec<String>,
        remotes: Vec<String>,
    ) -> Result<StatusStream, GinError> {
        self.assert_repository("upload")?;
        self.require_login("upload")?;

        let remotes = if remotes.is_empty() {
            vec![self.default_remote().await?]
        } else {
            remotes
        };

        let op = UploadOp {
            git: self.git()?,
            annex: self.annex()?,
            annex_conf: self.annex_conf(),
            root: self.root.clone(),
            paths,
            remotes,
        };
        Ok(start_verb(Box::new(op)))
    }

    /// Download remote changes; with `content` the payloads follow.
    pub fn download(&self, content: bool) -> Result<StatusStream, GinError> {
        self.assert_repository("download")?;
        self.require_login("download")?;

        let op = DownloadOp {
            annex: self.annex()?,
            annex_conf: self.annex_conf(),
            content,
        };
        Ok(start_verb(Box::new(op)))
    }

    pub fn get_content(&self, paths: Vec<String>) -> Result<StatusStream, GinError> {
        self.assert_repository("get-content")?;
        self.require_login("get-content")?;
        self.content_verb(paths, ContentAction::Get)
    }

    pub fn remove_content(&self, paths: Vec<String>) -> Result<StatusStream, GinError> {
        self.assert_repository("remove-content")?;
        self.content_verb(paths, ContentAction::Remove)
    }

    pub fn lock_content(&self, paths: Vec<String>) -> Result<StatusStream, GinError> {
        self.assert_repository("lock")?;
        self.content_verb(paths, ContentAction::Lock)
    }

    pub fn unlock_content(&self, paths: Vec<String>) -> Result<StatusStream, GinError> {
        self.assert_repository("unlock")?;
        self.content_verb(paths, ContentAction::Unlock)
    }

    fn content_verb(
        &self,
        paths: Vec<String>,
        action: ContentAction,
    ) -> Result<StatusStream, GinError> {
        let op = ContentOp {
            annex: self.annex()?,
            annex_conf: self.annex_conf(),
            root: self.root.clone(),
            paths,
            action,
        };
        Ok(start_verb(Box::new(op)))
    }

    pub fn sync(&self, content: bool) -> Result<StatusStream, GinError> {
        self.assert_repository("sync")?;
        self.require_login("sync")?;

        let op = SyncOp {
            annex: self.annex()?,
            content,
        };
        Ok(start_verb(Box::new(op)))
    }

    /// Clones `owner/name` from the session server into the session root
    /// and initialises the local copy. One merged stream.
    pub fn clone_repo(&self, repo_path: &str) -> Result<StatusStream, GinError> {
        let token = self.require_login("get")?;
        if !valid_repo_path(repo_path) {
            return Err(GinError::usage(
                "get",
                format!("'{}' is not a valid repository path (owner/name)", repo_path),
            ));
        }

        let repo_name = repo_path.rsplit('/').next().unwrap_or(repo_path);
        if self.root.join(repo_name).exists() {
            return Err(GinError::usage(
                "get",
                format!("directory '{}' already exists", repo_name),
            ));
        }

        let op = CloneOp {
            target_dir: self.root.clone(),
            repo_slug: repo_path.to_string(),
            url: self.server.repo_url(repo_path),
            git_bin: self.conf.bin.git.clone(),
            annex_bin: self.conf.bin.gitannex.clone(),
            envs: self.ssh_envs()?,
            web: self.web.clone(),
            username: token.username.clone(),
            hostname: self.hostname(),
        };
        Ok(start_verb(Box::new(op)))
    }

    /// Initialises the session root as a repository, optionally wiring an
    /// origin remote.
    pub fn init_dir(&self, remote_url: Option<String>) -> Result<StatusStream, GinError> {
        let token = self.require_login("init")?;

        let op = InitDirOp {
            git: self.git()?,
            annex: self.annex()?,
            web: self.web.clone(),
            username: token.username.clone(),
            hostname: self.hostname(),
            description: format!("{}@{}", token.username, self.hostname()),
            remote_url: remote_url.unwrap_or_default(),
        };
        Ok(start_verb(Box::new(op)))
    }

    /// Rolls paths back to `hash` and records the rollback.
    pub fn checkout_version(
        &self,
        hash: &str,
        paths: Vec<String>,
    ) -> Result<StatusStream, GinError> {
        self.assert_repository("version")?;

        let op = CheckoutVersionOp {
            git: self.git()?,
            root: self.root.clone(),
            hash: hash.to_string(),
            paths,
        };
        Ok(start_verb(Box::new(op)))
    }

    /// Copies file contents as of `hash` into `destination`, suffixed with
    /// the revision date.
    pub fn checkout_file_copies(
        &self,
        hash: &str,
        paths: Vec<String>,
        destination: impl Into<PathBuf>,
        isodate: &str,
    ) -> Result<CheckoutStream, GinError> {
        self.assert_repository("version")?;

        let op = CheckoutCopiesOp {
            git: self.git()?,
            annex: self.annex()?,
            root: self.root.clone(),
            hash: hash.to_string(),
            paths,
            destination: destination.into(),
            isodate: isodate.to_string(),
        };

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            if let Err(e) = op.run(tx).await {
                error!("checkout-file-copies failed: {}", e);
            }
        });
        Ok(ReceiverStream::new(rx))
    }

    /// Repository history, with per-commit file counts. `show_deletes`
    /// narrows the listing to commits that removed the given paths.
    pub async fn commits(
        &self,
        count: usize,
        rev_range: Option<&str>,
        paths: Vec<String>,
        show_deletes: bool,
    ) -> Result<Vec<Commit>, GinError> {
        self.assert_repository("commits")?;
        let paths = expand_globs(&paths, &self.root);
        self.git()?.log(count, rev_range, &paths, show_deletes).await
    }

    // ---- working-tree status ----

    /// Classifies every requested path into exactly one status. Recomputed
    /// on every call; single-file problems are logged and the path
    /// omitted, never failing the whole listing.
    pub async fn list_files(
        &self,
        paths: Vec<String>,
    ) -> Result<BTreeMap<String, FileStatus>, GinError> {
        self.assert_repository("ls")?;
        let paths = expand_globs(&paths, &self.root);
        let git = self.git()?;
        let annex = self.annex()?;

        let info = match annex.info().await {
            Ok(info) => info,
            Err(e) => {
                debug!("annex info unavailable ({}); assuming indirect mode", e);
                Default::default()
            }
        };

        let (cached, modified, untracked, deleted) = tokio::join!(
            git.list_files(ListMode::Cached, &paths),
            git.list_files(ListMode::Modified, &paths),
            git.list_files(ListMode::Others, &paths),
            git.list_files(ListMode::Deleted, &paths),
        );
        let cached = log_and_default("cached", cached);
        let modified = log_and_default("modified", modified);
        let untracked = log_and_default("others", untracked);
        let deleted = log_and_default("deleted", deleted);

        let mut whereis = HashMap::new();
        if !cached.is_empty() {
            for record in annex.whereis(&cached).await.unwrap_or_default() {
                if record.success {
                    whereis.insert(record.file, record.whereis);
                } else {
                    debug!("whereis failed for {}; omitting", record.file);
                }
            }
        }

        let upstream_diff: HashSet<String> = git
            .diff_upstream(&paths)
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();

        let status_paths = if info.is_direct() {
            paths.clone()
        } else {
            modified.clone()
        };
        let mut annex_status = HashMap::new();
        if info.is_direct() || !status_paths.is_empty() {
            for item in annex.status(&status_paths).await.unwrap_or_default() {
                annex_status.insert(item.file, item.status);
            }
        }

        let input = ClassifierInput {
            cached,
            modified,
            untracked,
            deleted,
            whereis,
            upstream_diff,
            annex_status,
        };
        Ok(if info.is_direct() {
            classify_direct(&input)
        } else {
            classify_indirect(&input)
        })
    }

    // ---- remote management ----

    /// Configured remotes with their resolved kinds.
    pub async fn remotes(&self) -> Result<BTreeMap<String, Remote>, GinError> {
        self.assert_repository("remotes")?;
        let raw = self.git()?.remotes().await?;
        Ok(raw
            .into_iter()
            .map(|(name, url)| {
                let remote = self.classify_remote_url(&url);
                (name, remote)
            })
            .collect())
    }

    fn classify_remote_url(&self, url: &str) -> Remote {
        for (alias, server) in &self.servers {
            let prefix = format!("{}/", server.git_address());
            if let Some(path) = url.strip_prefix(&prefix) {
                return Remote {
                    kind: RemoteKind::Gin,
                    server: alias.clone(),
                    path: path.to_string(),
                    url: url.to_string(),
                };
            }
        }
        if Path::new(url).is_absolute() {
            return Remote {
                kind: RemoteKind::Directory,
                server: "dir".to_string(),
                path: url.to_string(),
                url: url.to_string(),
            };
        }
        Remote {
            kind: RemoteKind::Unknown,
            server: String::new(),
            path: url.to_string(),
            url: url.to_string(),
        }
    }

    /// Registers `name` for the parsed remote argument, creating the
    /// target when it does not exist yet. The first remote added becomes
    /// the default push target.
    pub async fn add_remote(&self, name: &str, remote_arg: &str) -> Result<Remote, GinError> {
        self.assert_repository("add-remote")?;
        let git = self.git()?;
        let remote = parse_remote(remote_arg, &self.servers, &self.root);

        match remote.kind {
            RemoteKind::Gin => {
                if git.ls_remote(&remote.url).await.is_err() {
                    self.require_login("add-remote")?;
                    let repo_name = remote
                        .path
                        .rsplit('/')
                        .next()
                        .unwrap_or(remote.path.as_str());
                    info!("Remote {} does not exist; creating it", remote.url);
                    self.web.create_repo(repo_name, "").await?;
                }
            }
            RemoteKind::Directory => {
                self.ensure_directory_remote(&remote).await?;
            }
            RemoteKind::Unknown => {
                // unknown targets can be used when they already exist, but
                // this client cannot create them
                git.ls_remote(&remote.url).await.map_err(|e| {
                    GinError::usage(
                        "add-remote",
                        format!("cannot create remote '{}': {}", remote_arg, e),
                    )
                })?;
            }
        }

        git.remote_add(name, &remote.url).await?;
        if git.get_config("gin.remote").await?.is_none() {
            git.set_config("gin.remote", name).await?;
        }
        Ok(remote)
    }

    async fn ensure_directory_remote(&self, remote: &Remote) -> Result<(), GinError> {
        let target = PathBuf::from(&remote.url);
        if target.join(".git").exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&target)?;
        let git = Git::new(&self.conf.bin.git, &target);
        let annex = Annex::new(&self.conf.bin.gitannex, &target);
        git.init().await?;
        annex.init("GIN Storage").await?;
        Ok(())
    }

    pub async fn remove_remote(&self, name: &str) -> Result<(), GinError> {
        self.assert_repository("remove-remote")?;
        let git = self.git()?;
        let remotes = git.remotes().await?;
        if !remotes.contains_key(name) {
            return Err(GinError::usage(
                "remove-remote",
                format!("remote '{}' does not exist", name),
            ));
        }
        git.remote_remove(name).await
    }

    /// Records `name` as the default push target.
    pub async fn set_default_remote(&self, name: &str) -> Result<(), GinError> {
        self.assert_repository("use-remote")?;
        let git = self.git()?;
        if !git.remotes().await?.contains_key(name) {
            return Err(GinError::usage(
                "use-remote",
                format!("remote '{}' does not exist", name),
            ));
        }
        git.set_config("gin.remote", name).await
    }

    /// The recorded default push target, falling back to a sole configured
    /// remote. Ambiguity is a usage error.
    pub async fn default_remote(&self) -> Result<String, GinError> {
        self.assert_repository("upload")?;
        let git = self.git()?;

        let remotes = git.remotes().await?;
        if let Some(name) = git.get_config("gin.remote").await? {
            if remotes.contains_key(&name) {
                return Ok(name);
            }
            warn!("Default remote '{}' is no longer configured", name);
        }

        match remotes.len() {
            0 => Err(GinError::usage(
                "upload",
                "no remote is configured; run 'gin add-remote' first",
            )),
            1 => Ok(remotes.into_keys().next().unwrap()),
            _ => Err(GinError::usage(
                "upload",
                "multiple remotes are configured and no default is set; run 'gin use-remote'",
            )),
        }
    }
}

fn log_and_default(which: &str, result: Result<Vec<String>, GinError>) -> Vec<String> {
    match result {
        Ok(files) => files,
        Err(e) => {
            warn!("ls-files ({}) failed: {}", which, e);
            Vec::new()
        }
    }
}

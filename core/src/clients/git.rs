use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc::Sender;
use tracing::{debug, warn};

use crate::clients::command::SysCommand;
use crate::types::commits::{self, Commit};
use crate::types::errors::GinError;
use crate::types::progress::{OpState, RepoFileStatus};

lazy_static! {
    static ref CLONE_PROGRESS_REGEX: Regex =
        Regex::new(r"Receiving objects:\s+(\d+)%(?:.*?\|\s*([\d.]+ [KMGT]iB/s))?").unwrap();
    static ref ADD_VERBOSE_REGEX: Regex = Regex::new(r"^(add|remove) '(.+)'$").unwrap();
}

/// Outcome of a commit attempt. An unchanged index is not a failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommitResult {
    Created,
    Nothing,
}

/// The four `ls-files` listing modes the classifier fans out over.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ListMode {
    Cached,
    Modified,
    Others,
    Deleted,
}

/// One row of recursive `ls-tree` output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeObject {
    pub mode: String,
    pub otype: String,
    pub hash: String,
    pub name: String,
}

/// Typed wrapper around the source-control tool for one repository.
/// The repository root is explicit; nothing here depends on the process
/// working directory.
#[derive(Clone, Debug)]
pub struct Git {
    bin: PathBuf,
    repo_path: PathBuf,
    envs: Vec<(String, String)>,
}

impl Git {
    pub fn new(bin: impl Into<PathBuf>, repo_path: impl Into<PathBuf>) -> Git {
        Git {
            bin: bin.into(),
            repo_path: repo_path.into(),
            envs: Vec::new(),
        }
    }

    /// Environment injected into every invocation (SSH command et al).
    pub fn with_envs(mut self, envs: Vec<(String, String)>) -> Git {
        self.envs = envs;
        self
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn cmd(&self) -> SysCommand {
        SysCommand::new(&self.bin)
            .current_dir(&self.repo_path)
            .envs(&self.envs)
    }

    pub async fn init(&self) -> Result<(), GinError> {
        self.cmd().arg("init").output("git init").await?;
        Ok(())
    }

    /// Clones `url` into `<repo_path>/<directory>`, streaming progress
    /// parsed from the `Receiving objects` counter on stderr. A final 100%
    /// event is synthesised even for empty repositories, which produce no
    /// counter at all.
    pub async fn clone(
        &self,
        url: &str,
        repo_slug: &str,
        tx: &Sender<RepoFileStatus>,
    ) -> Result<(), GinError> {
        let mut child = self
            .cmd()
            .arg("clone")
            .arg("--progress")
            .arg(url)
            .start()?;

        // git rewrites the progress line in place with carriage returns
        let mut stderr_tail = String::new();
        while let Some(chunk) = child.stderr.read_until(b'\r').await? {
            let line = String::from_utf8_lossy(&chunk);
            let line = line.trim_matches('\n').trim();
            if line.is_empty() {
                continue;
            }
            stderr_tail = line.to_string();
            if let Some((progress, rate)) = parse_clone_progress(line) {
                let _ = tx
                    .send(RepoFileStatus::transfer(
                        OpState::DownloadingRepo,
                        repo_slug,
                        progress,
                        rate,
                    ))
                    .await;
            }
        }

        if let Err(err) = child.wait("git clone").await {
            let description = clone_error_description(&stderr_tail, repo_slug, &err);
            let _ = tx
                .send(RepoFileStatus::failed(
                    OpState::DownloadingRepo,
                    repo_slug,
                    &description,
                ))
                .await;
            return Err(GinError::remote("git clone", description));
        }

        let _ = tx
            .send(RepoFileStatus::done(OpState::DownloadingRepo, repo_slug))
            .await;
        Ok(())
    }

    /// Stages `paths`, streaming one event per `add '…'` / `remove '…'`
    /// line of the verbose output. Returns the recorded paths.
    pub async fn add(
        &self,
        paths: &[String],
        tx: &Sender<RepoFileStatus>,
    ) -> Result<Vec<String>, GinError> {
        let mut child = self
            .cmd()
            .arg("add")
            .arg("--verbose")
            .arg("--")
            .args(paths.iter().cloned())
            .start()?;

        let mut recorded = Vec::new();
        while let Some(line) = child.stdout.read_line().await? {
            match parse_add_line(&line) {
                Some((_, path)) => {
                    recorded.push(path.to_string());
                    let _ = tx
                        .send(RepoFileStatus::done(OpState::AddingGit, path))
                        .await;
                }
                None => debug!("git add: skipping line: {}", line),
            }
        }

        child.wait("git add").await?;
        Ok(recorded)
    }

    /// Records the index. "Nothing to commit" is an expected outcome, not
    /// an error.
    pub async fn commit(&self, message: &str) -> Result<CommitResult, GinError> {
        let (stdout, stderr, code) = self
            .cmd()
            .arg("commit")
            .arg("-m")
            .arg(message)
            .output_err("git commit")
            .await?;

        if code == Some(0) {
            return Ok(CommitResult::Created);
        }

        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&stdout),
            String::from_utf8_lossy(&stderr)
        );
        if text.contains("nothing to commit")
            || text.contains("nothing added to commit")
            || text.contains("working tree clean")
        {
            return Ok(CommitResult::Nothing);
        }
        Err(GinError::child("git commit", code, text))
    }

    /// Records a commit even with an empty index; used to give fresh
    /// repositories a root commit to push.
    pub async fn commit_allow_empty(&self, message: &str) -> Result<(), GinError> {
        self.cmd()
            .args(["commit", "--allow-empty", "-m", message])
            .output("git commit")
            .await?;
        Ok(())
    }

    /// True when the repository has at least one commit.
    pub async fn has_commits(&self) -> bool {
        self.cmd()
            .args(["rev-parse", "--verify", "--quiet", "HEAD"])
            .output_err("git rev-parse")
            .await
            .map(|(_, _, code)| code == Some(0))
            .unwrap_or(false)
    }

    /// Checks out `reference`. With explicit paths only those paths are
    /// updated; without paths the whole tree moves.
    pub async fn checkout(&self, reference: &str, paths: &[String]) -> Result<(), GinError> {
        let mut cmd = self.cmd().arg("checkout").arg(reference);
        if !paths.is_empty() {
            cmd = cmd.arg("--").args(paths.iter().cloned());
        }
        cmd.output("git checkout").await?;
        Ok(())
    }

    /// Repository history, newest first. Commits are read as NUL-separated
    /// records of a fixed placeholder format; a second `--name-status` pass
    /// attaches per-commit file counts. With `show_deletes` the listing is
    /// restricted to commits that removed the given paths, which is how
    /// history is recovered for files no longer in the tree.
    pub async fn log(
        &self,
        count: usize,
        rev_range: Option<&str>,
        paths: &[String],
        show_deletes: bool,
    ) -> Result<Vec<Commit>, GinError> {
        let format = "--pretty=format:%H%x1f%h%x1f%an%x1f%ae%x1f%aI%x1f%s%x1f%b";
        let mut cmd = self.cmd().args(["log", "-z", format]);
        if count > 0 {
            cmd = cmd.arg(format!("-{}", count));
        }
        if show_deletes {
            cmd = cmd.arg("--diff-filter=D");
        }
        if let Some(range) = rev_range {
            cmd = cmd.arg(range);
        }
        if !paths.is_empty() {
            cmd = cmd.arg("--").args(paths.iter().cloned());
        }

        let stdout = cmd.output("git log").await?;
        let text = String::from_utf8_lossy(&stdout);
        let mut commits: Vec<Commit> = Vec::new();
        for record in text.split('\0') {
            match Commit::from_record(record) {
                Some(commit) => commits.push(commit),
                None if record.trim().is_empty() => {}
                None => warn!("git log: skipping malformed record"),
            }
        }

        let stats = self.log_name_status(count, rev_range, paths).await?;
        for commit in &mut commits {
            if let Some(s) = stats.get(&commit.hash) {
                commit.stats = *s;
            }
        }
        Ok(commits)
    }

    async fn log_name_status(
        &self,
        count: usize,
        rev_range: Option<&str>,
        paths: &[String],
    ) -> Result<BTreeMap<String, commits::FileStats>, GinError> {
        let mut cmd = self
            .cmd()
            .args(["log", "--name-status", "--pretty=format:%x1e%H"]);
        if count > 0 {
            cmd = cmd.arg(format!("-{}", count));
        }
        if let Some(range) = rev_range {
            cmd = cmd.arg(range);
        }
        if !paths.is_empty() {
            cmd = cmd.arg("--").args(paths.iter().cloned());
        }

        let stdout = cmd.output("git log").await?;
        let text = String::from_utf8_lossy(&stdout);

        let mut stats = BTreeMap::new();
        for chunk in text.split('\u{1e}').filter(|c| !c.trim().is_empty()) {
            let mut lines = chunk.lines();
            let hash = match lines.next() {
                Some(h) => h.trim().to_string(),
                None => continue,
            };
            stats.insert(hash, commits::count_name_status(lines));
        }
        Ok(stats)
    }

    /// One `ls-files` listing. `Others` respects the standard exclusions.
    pub async fn list_files(
        &self,
        mode: ListMode,
        paths: &[String],
    ) -> Result<Vec<String>, GinError> {
        let mut cmd = self.cmd().args(["ls-files", "-z"]);
        cmd = match mode {
            ListMode::Cached => cmd.arg("--cached"),
            ListMode::Modified => cmd.arg("--modified"),
            ListMode::Others => cmd.args(["--others", "--exclude-standard"]),
            ListMode::Deleted => cmd.arg("--deleted"),
        };
        if !paths.is_empty() {
            cmd = cmd.arg("--").args(paths.iter().cloned());
        }

        let stdout = cmd.output("git ls-files").await?;
        Ok(split_nul(&stdout))
    }

    /// Recursive tree listing at `rev`, trees included.
    pub async fn ls_tree(&self, rev: &str, paths: &[String]) -> Result<Vec<TreeObject>, GinError> {
        let mut cmd = self.cmd().args(["ls-tree", "-z", "-r", "-t", rev]);
        if !paths.is_empty() {
            cmd = cmd.arg("--").args(paths.iter().cloned());
        }

        let stdout = cmd.output("git ls-tree").await?;
        let text = String::from_utf8_lossy(&stdout);
        let mut objects = Vec::new();
        for row in text.split('\0').filter(|r| !r.is_empty()) {
            match parse_tree_row(row) {
                Some(object) => objects.push(object),
                None => warn!("git ls-tree: skipping malformed row: {}", row),
            }
        }
        Ok(objects)
    }

    /// Raw blob contents of `path` at `rev`.
    pub async fn cat_file(&self, rev: &str, path: &str) -> Result<Vec<u8>, GinError> {
        self.cmd()
            .args(["cat-file", "blob", &format!("{}:{}", rev, path)])
            .output("git cat-file")
            .await
    }

    /// Object type of `path` at `rev` ("blob", "tree", "commit").
    pub async fn cat_file_type(&self, rev: &str, path: &str) -> Result<String, GinError> {
        let out = self
            .cmd()
            .args(["cat-file", "-t", &format!("{}:{}", rev, path)])
            .output("git cat-file")
            .await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    /// Number of commits in `a..b`.
    pub async fn rev_count(&self, a: &str, b: &str) -> Result<usize, GinError> {
        let out = self
            .cmd()
            .args(["rev-list", "--count", &format!("{}..{}", a, b)])
            .output("git rev-list")
            .await?;
        let text = String::from_utf8_lossy(&out);
        text.trim()
            .parse()
            .map_err(|_| GinError::parse("git rev-list", text.into_owned()))
    }

    /// Paths that differ from the upstream branch. Missing upstream is not
    /// an error; there is simply nothing to compare against.
    pub async fn diff_upstream(&self, paths: &[String]) -> Result<Vec<String>, GinError> {
        let mut cmd = self
            .cmd()
            .args(["diff", "-z", "--name-only", "--relative", "@{upstream}"]);
        if !paths.is_empty() {
            cmd = cmd.arg("--").args(paths.iter().cloned());
        }

        let (stdout, stderr, code) = cmd.output_err("git diff").await?;
        if code != Some(0) {
            debug!(
                "git diff @{{upstream}} unavailable: {}",
                String::from_utf8_lossy(&stderr).trim()
            );
            return Ok(Vec::new());
        }
        Ok(split_nul(&stdout))
    }

    /// Configured remotes, name → fetch URL.
    pub async fn remotes(&self) -> Result<BTreeMap<String, String>, GinError> {
        let stdout = self.cmd().args(["remote", "-v"]).output("git remote").await?;
        let text = String::from_utf8_lossy(&stdout);
        let mut remotes = BTreeMap::new();
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            if let (Some(name), Some(url), Some("(fetch)")) =
                (fields.next(), fields.next(), fields.next())
            {
                remotes.insert(name.to_string(), url.to_string());
            }
        }
        Ok(remotes)
    }

    /// Registers a remote; a name collision is a usage error.
    pub async fn remote_add(&self, name: &str, url: &str) -> Result<(), GinError> {
        let (_, stderr, code) = self
            .cmd()
            .args(["remote", "add", name, url])
            .output_err("git remote add")
            .await?;
        match code {
            Some(0) => Ok(()),
            code => {
                let text = String::from_utf8_lossy(&stderr).into_owned();
                if text.contains("already exists") {
                    Err(GinError::usage(
                        "git remote add",
                        format!("remote '{}' exists", name),
                    ))
                } else {
                    Err(GinError::child("git remote add", code, text))
                }
            }
        }
    }

    pub async fn remote_remove(&self, name: &str) -> Result<(), GinError> {
        self.cmd()
            .args(["remote", "remove", name])
            .output("git remote remove")
            .await?;
        Ok(())
    }

    /// Probes `url` for reachability and existence before any remote is
    /// created against it.
    pub async fn ls_remote(&self, url: &str) -> Result<(), GinError> {
        let (_, stderr, code) = self
            .cmd()
            .args(["ls-remote", url, "HEAD"])
            .output_err("git ls-remote")
            .await?;
        if code == Some(0) {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&stderr);
        if text.contains("Host key verification failed") {
            return Err(GinError::remote("git ls-remote", "server key mismatch"));
        }
        if text.contains("Permission denied") || text.contains("publickey") {
            return Err(GinError::remote("git ls-remote", "authorisation failed"));
        }
        Err(GinError::remote(
            "git ls-remote",
            format!("remote is not reachable: {}", text.trim()),
        ))
    }

    /// Pushes the current branch, creating the upstream ref.
    pub async fn push_upstream(&self, remote: &str, branch: &str) -> Result<(), GinError> {
        self.cmd()
            .args(["push", "--set-upstream", remote, branch])
            .output("git push")
            .await?;
        Ok(())
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<(), GinError> {
        self.cmd()
            .args(["config", key, value])
            .output("git config")
            .await?;
        Ok(())
    }

    /// A local config value, or None when unset.
    pub async fn get_config(&self, key: &str) -> Result<Option<String>, GinError> {
        let (stdout, _, code) = self
            .cmd()
            .args(["config", "--get", key])
            .output_err("git config")
            .await?;
        match code {
            Some(0) => Ok(Some(String::from_utf8_lossy(&stdout).trim().to_string())),
            _ => Ok(None),
        }
    }

    /// A global (user-level) config value, or None when unset.
    pub async fn get_config_global(&self, key: &str) -> Result<Option<String>, GinError> {
        let (stdout, _, code) = self
            .cmd()
            .args(["config", "--global", "--get", key])
            .output_err("git config")
            .await?;
        match code {
            Some(0) => Ok(Some(String::from_utf8_lossy(&stdout).trim().to_string())),
            _ => Ok(None),
        }
    }

    /// First line of `git version`.
    pub async fn version(&self) -> Result<String, GinError> {
        let out = self.cmd().arg("version").output("git version").await?;
        let text = String::from_utf8_lossy(&out);
        Ok(text.lines().next().unwrap_or_default().to_string())
    }

    /// Temporarily leaves direct-mode bookkeeping so the plain `add` works,
    /// restoring `core.bare` on every exit path.
    pub async fn bare_guard(&self) -> Result<BareGuard, GinError> {
        self.set_config("core.bare", "false").await?;
        Ok(BareGuard {
            bin: self.bin.clone(),
            repo_path: self.repo_path.clone(),
        })
    }
}

/// Scoped `core.bare` toggle for direct-mode staging. Dropping the guard
/// restores the flag even when the surrounding stream is abandoned
/// mid-operation.
pub struct BareGuard {
    bin: PathBuf,
    repo_path: PathBuf,
}

impl Drop for BareGuard {
    fn drop(&mut self) {
        // Synchronous on purpose: Drop cannot await, and the restore must
        // not be skipped.
        let result = std::process::Command::new(&self.bin)
            .args(["config", "core.bare", "true"])
            .current_dir(&self.repo_path)
            .output();
        if let Err(e) = result {
            warn!("Failed to restore core.bare: {}", e);
        }
    }
}

fn split_nul(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .split('\0')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Extracts (percentage, rate) from a `Receiving objects` progress line.
fn parse_clone_progress(line: &str) -> Option<(String, String)> {
    let caps = CLONE_PROGRESS_REGEX.captures(line)?;
    let percent = format!("{}%", &caps[1]);
    let rate = caps
        .get(2)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    Some((percent, rate))
}

fn parse_add_line(line: &str) -> Option<(&str, &str)> {
    let caps = ADD_VERBOSE_REGEX.captures(line)?;
    Some((
        caps.get(1).unwrap().as_str(),
        caps.get(2).unwrap().as_str(),
    ))
}

fn parse_tree_row(row: &str) -> Option<TreeObject> {
    // <mode> <type> <hash>\t<name>
    let (meta, name) = row.split_once('\t')?;
    let mut fields = meta.split_whitespace();
    Some(TreeObject {
        mode: fields.next()?.to_string(),
        otype: fields.next()?.to_string(),
        hash: fields.next()?.to_string(),
        name: name.to_string(),
    })
}

fn clone_error_description(stderr_tail: &str, repo_slug: &str, err: &GinError) -> String {
    if stderr_tail.contains("not found") || stderr_tail.contains("does not exist") {
        format!("repository '{}' does not exist", repo_slug)
    } else if stderr_tail.contains("Permission denied") || stderr_tail.contains("publickey") {
        "authorisation failed".to_string()
    } else if stderr_tail.contains("Host key verification failed") {
        "server key mismatch".to_string()
    } else {
        format!("download failed: {}", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_progress_with_rate() {
        let line = "Receiving objects:  42% (84/200), 12.01 MiB | 11.9 MiB/s";
        let (pct, rate) = parse_clone_progress(line).unwrap();
        assert_eq!(pct, "42%");
        assert_eq!(rate, "11.9 MiB/s");
    }

    #[test]
    fn clone_progress_without_rate() {
        let line = "Receiving objects: 100% (5/5), done.";
        let (pct, rate) = parse_clone_progress(line).unwrap();
        assert_eq!(pct, "100%");
        assert_eq!(rate, "");
    }

    #[test]
    fn non_progress_lines_are_ignored() {
        assert!(parse_clone_progress("Cloning into 'empty'...").is_none());
        assert!(parse_clone_progress("Resolving deltas: 100% (3/3), done.").is_none());
    }

    #[test]
    fn add_verbose_lines() {
        assert_eq!(
            parse_add_line("add 'data/session1.nc'").unwrap(),
            ("add", "data/session1.nc")
        );
        assert_eq!(
            parse_add_line("remove 'old.txt'").unwrap(),
            ("remove", "old.txt")
        );
        assert!(parse_add_line("warning: adding embedded git repository").is_none());
    }

    #[test]
    fn tree_rows() {
        let row = "100644 blob 8baef1b4abc478178b004d62031cf7fe6db6f903\tdata/big.nc";
        let object = parse_tree_row(row).unwrap();
        assert_eq!(object.mode, "100644");
        assert_eq!(object.otype, "blob");
        assert_eq!(object.name, "data/big.nc");

        let row = "040000 tree 9bdf2f1e3f4c47eb95c97a1d9b7a567b8cf11234\tdata";
        assert_eq!(parse_tree_row(row).unwrap().otype, "tree");

        assert!(parse_tree_row("garbage").is_none());
    }

    #[test]
    fn nul_splitting_drops_empties() {
        assert_eq!(split_nul(b"a\0b\0"), vec!["a", "b"]);
        assert_eq!(split_nul(b""), Vec::<String>::new());
    }
}

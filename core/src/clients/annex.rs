use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::sync::mpsc::Sender;
use tracing::{debug, warn};

use crate::clients::command::SysCommand;
use crate::config::AnnexCfg;
use crate::types::errors::GinError;
use crate::types::progress::{OpState, RepoFileStatus};
use crate::utils::units::RateTracker;

/// The `action` object embedded in a progress record.
#[derive(Clone, Debug, Deserialize)]
pub struct AnnexAction {
    pub command: String,
    pub file: String,
    #[serde(default)]
    pub key: Option<String>,
}

/// An action-progress record from `--json-progress` output.
#[derive(Clone, Debug, Deserialize)]
pub struct AnnexProgress {
    pub action: AnnexAction,
    #[serde(rename = "byte-progress")]
    pub byte_progress: u64,
    #[serde(rename = "total-size")]
    pub total_size: u64,
    #[serde(rename = "percent-progress")]
    pub percent_progress: String,
}

/// An action-result record, emitted once per file when the action ends.
#[derive(Clone, Debug, Deserialize)]
pub struct AnnexResult {
    pub command: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default, rename = "error-messages")]
    pub error_messages: Vec<String>,
}

/// Progress and result records interleave on the same stream.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AnnexLine {
    Progress(AnnexProgress),
    Result(AnnexResult),
}

/// One remote entry of a `whereis` record.
#[derive(Clone, Debug, Deserialize)]
pub struct WhereisRemote {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub here: bool,
}

/// Per-file content location info.
#[derive(Clone, Debug, Deserialize)]
pub struct AnnexWhereis {
    pub file: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub whereis: Vec<WhereisRemote>,
    #[serde(default)]
    pub success: bool,
}

/// One `status` record: a single-character state and a path.
#[derive(Clone, Debug, Deserialize)]
pub struct AnnexStatusItem {
    pub status: String,
    pub file: String,
}

/// The `info --json` blob, reduced to the fields the engine consumes.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AnnexInfo {
    #[serde(default, rename = "repository mode")]
    pub repository_mode: String,
    #[serde(default, rename = "local annex keys")]
    pub local_annex_keys: u64,
    #[serde(default, rename = "annexed files in working tree")]
    pub annexed_files: u64,
    #[serde(default)]
    pub success: bool,
}

impl AnnexInfo {
    pub fn is_direct(&self) -> bool {
        self.repository_mode == "direct"
    }
}

/// Outcome of a streamed transfer verb: which files succeeded, and how many
/// failed. Per-file failures ride the event stream; they do not abort the
/// verb.
#[derive(Debug, Default)]
pub struct TransferOutcome {
    pub succeeded: Vec<String>,
    pub failures: usize,
}

/// Typed wrapper around the large-file extension for one repository.
#[derive(Clone, Debug)]
pub struct Annex {
    bin: PathBuf,
    repo_path: PathBuf,
    envs: Vec<(String, String)>,
}

impl Annex {
    pub fn new(bin: impl Into<PathBuf>, repo_path: impl Into<PathBuf>) -> Annex {
        Annex {
            bin: bin.into(),
            repo_path: repo_path.into(),
            envs: Vec::new(),
        }
    }

    pub fn with_envs(mut self, envs: Vec<(String, String)>) -> Annex {
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
            // the extension reuses the source-control tool's SSH setup
            .envs(&[("GIT_ANNEX_USE_GIT_SSH".to_string(), "1".to_string())])
    }

    /// Initialises the annex with a description and pins the content
    /// hashing backend to MD5.
    pub async fn init(&self, description: &str) -> Result<(), GinError> {
        self.cmd()
            .args(["init", description])
            .output("annex init")
            .await?;
        self.cmd()
            .args(["config", "--set", "annex.backend", "MD5"])
            .output("annex init")
            .await?;
        Ok(())
    }

    /// First line of `git-annex version`.
    pub async fn version(&self) -> Result<String, GinError> {
        let out = self.cmd().arg("version").output("annex version").await?;
        let text = String::from_utf8_lossy(&out);
        Ok(text.lines().next().unwrap_or_default().to_string())
    }

    /// Bidirectional sync. The sync verb has no JSON mode; copy/get lines
    /// are parsed from the human output.
    pub async fn sync(&self, content: bool, tx: &Sender<RepoFileStatus>) -> Result<(), GinError> {
        let _ = tx
            .send(RepoFileStatus::transfer(
                OpState::Synchronising,
                "",
                "",
                "",
            ))
            .await;

        let content_flag = if content { "--content" } else { "--no-content" };
        let mut child = self.cmd().args(["sync", content_flag]).start()?;

        while let Some(line) = child.stdout.read_line().await? {
            if line.is_empty() {
                continue;
            }
            if let Some(event) = parse_sync_line(&line) {
                let _ = tx.send(event).await;
            } else {
                debug!("annex sync: {}", line);
            }
        }

        self.wait_mapping_sync_errors(&mut child, "annex sync").await?;
        let _ = tx
            .send(RepoFileStatus::done(OpState::Synchronising, ""))
            .await;
        Ok(())
    }

    /// Metadata push: records the index and pushes the git branches to
    /// `remote` without pulling.
    pub async fn sync_push(&self, remote: &str, message: &str) -> Result<(), GinError> {
        let mut child = self
            .cmd()
            .args([
                "sync",
                "--no-pull",
                "--commit",
                &format!("--message={}", message),
                remote,
            ])
            .start()?;

        // drain stdout so the child never stalls on a full pipe
        while let Some(line) = child.stdout.read_line().await? {
            debug!("annex sync: {}", line);
        }
        self.wait_mapping_sync_errors(&mut child, "annex push").await
    }

    /// Metadata pull: fetches and merges remote changes without pushing or
    /// committing.
    pub async fn pull(&self, tx: &Sender<RepoFileStatus>) -> Result<(), GinError> {
        let _ = tx
            .send(RepoFileStatus::transfer(
                OpState::Synchronising,
                "",
                "",
                "",
            ))
            .await;

        let mut child = self
            .cmd()
            .args(["sync", "--no-push", "--no-commit"])
            .start()?;
        while let Some(line) = child.stdout.read_line().await? {
            debug!("annex sync: {}", line);
        }
        self.wait_mapping_sync_errors(&mut child, "annex pull").await?;

        let _ = tx
            .send(RepoFileStatus::done(OpState::Synchronising, ""))
            .await;
        Ok(())
    }

    async fn wait_mapping_sync_errors(
        &self,
        child: &mut crate::clients::command::RunningCommand,
        origin: &'static str,
    ) -> Result<(), GinError> {
        match child.wait(origin).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let text = err.to_string();
                if text.contains("rejected") {
                    Err(GinError::rejected(
                        origin,
                        "upload failed: changes were made on the server that have not been \
                         downloaded; run 'gin download' to update local copies",
                    ))
                } else if text.contains("would be overwritten by merge") {
                    Err(GinError::remote(
                        origin,
                        "download failed: local modified or untracked file would be overwritten",
                    ))
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Uploads content for `paths` to `remote`, streaming per-file progress.
    pub async fn copy(
        &self,
        paths: &[String],
        remote: &str,
        tx: &Sender<RepoFileStatus>,
    ) -> Result<TransferOutcome, GinError> {
        let cmd = self
            .cmd()
            .args(["copy", "--json", "--json-progress"])
            .arg(format!("--to={}", remote))
            .arg("--")
            .args(paths.iter().cloned());
        self.run_transfer(cmd, OpState::Uploading, tx, "annex copy").await
    }

    /// Downloads content for `paths`, streaming per-file progress.
    pub async fn get(
        &self,
        paths: &[String],
        tx: &Sender<RepoFileStatus>,
    ) -> Result<TransferOutcome, GinError> {
        let cmd = self
            .cmd()
            .args(["get", "--json", "--json-progress", "--"])
            .args(paths.iter().cloned());
        self.run_transfer(cmd, OpState::Downloading, tx, "annex get").await
    }

    /// Removes local content for `paths`. The extension refuses to drop the
    /// only verified copy; that surfaces as a per-file error.
    pub async fn drop(
        &self,
        paths: &[String],
        tx: &Sender<RepoFileStatus>,
    ) -> Result<TransferOutcome, GinError> {
        let cmd = self
            .cmd()
            .args(["drop", "--json", "--"])
            .args(paths.iter().cloned());
        self.run_transfer(cmd, OpState::RemovingContent, tx, "annex drop")
            .await
    }

    /// Annexes `paths`, honouring the configured size threshold and
    /// exclusion patterns. With `update` the call refreshes (locks) already
    /// annexed files instead of adding new ones.
    pub async fn add(
        &self,
        paths: &[String],
        annex_conf: &AnnexCfg,
        update: bool,
        tx: &Sender<RepoFileStatus>,
    ) -> Result<TransferOutcome, GinError> {
        let (state, mut cmd) = if update {
            (OpState::Locking, self.cmd().args(["add", "--json", "--update"]))
        } else {
            let mut cmd = self.cmd().args(["add", "--json"]);
            cmd = cmd.args(exclusion_args(annex_conf));
            (OpState::AddingAnnex, cmd)
        };
        cmd = cmd.arg("--").args(paths.iter().cloned());
        self.run_transfer(cmd, state, tx, "annex add").await
    }

    /// Unlocks annexed `paths` for editing.
    pub async fn unlock(
        &self,
        paths: &[String],
        tx: &Sender<RepoFileStatus>,
    ) -> Result<TransferOutcome, GinError> {
        let cmd = self
            .cmd()
            .args(["unlock", "--json", "--"])
            .args(paths.iter().cloned());
        self.run_transfer(cmd, OpState::Unlocking, tx, "annex unlock")
            .await
    }

    /// Content locations for `paths`, one record per annexed file.
    pub async fn whereis(&self, paths: &[String]) -> Result<Vec<AnnexWhereis>, GinError> {
        let mut cmd = self.cmd().args(["whereis", "--json"]);
        if !paths.is_empty() {
            cmd = cmd.arg("--").args(paths.iter().cloned());
        }
        let mut child = cmd.start()?;

        let mut records = Vec::new();
        while let Some(line) = child.stdout.read_line().await? {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<AnnexWhereis>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("annex whereis: skipping line ({}): {}", e, line),
            }
        }
        // whereis exits non-zero when some paths are not annexed; the
        // records we did parse are still valid
        if let Err(err) = child.wait("annex whereis").await {
            debug!("annex whereis: {}", err);
        }
        Ok(records)
    }

    /// Annex status for `paths` (`?`, `A`, `M`, `D`, `T` per file).
    pub async fn status(&self, paths: &[String]) -> Result<Vec<AnnexStatusItem>, GinError> {
        let mut cmd = self.cmd().args(["status", "--json"]);
        if !paths.is_empty() {
            cmd = cmd.arg("--").args(paths.iter().cloned());
        }
        let mut child = cmd.start()?;

        let mut items = Vec::new();
        while let Some(line) = child.stdout.read_line().await? {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<AnnexStatusItem>(&line) {
                Ok(item) => items.push(item),
                Err(e) => warn!("annex status: skipping line ({}): {}", e, line),
            }
        }
        child.wait("annex status").await?;
        Ok(items)
    }

    /// Repository-level annex information, including the working-tree mode.
    pub async fn info(&self) -> Result<AnnexInfo, GinError> {
        let out = self
            .cmd()
            .args(["info", "--json", "--fast"])
            .output("annex info")
            .await?;
        let text = String::from_utf8_lossy(&out);
        let info: AnnexInfo = serde_json::from_str(text.trim())
            .map_err(|_| GinError::parse("annex info", text.into_owned()))?;
        Ok(info)
    }

    /// Recreates a placeholder for a known content key at `path`.
    pub async fn from_key(&self, key: &str, path: &str) -> Result<(), GinError> {
        self.cmd()
            .args(["fromkey", "--force", key, path])
            .output("annex fromkey")
            .await?;
        Ok(())
    }

    async fn run_transfer(
        &self,
        cmd: SysCommand,
        state: OpState,
        tx: &Sender<RepoFileStatus>,
        origin: &'static str,
    ) -> Result<TransferOutcome, GinError> {
        let mut child = cmd.start()?;
        let mut tracker = RateTracker::new();
        let mut outcome = TransferOutcome::default();

        while let Some(line) = child.stdout.read_line().await? {
            if line.is_empty() {
                continue;
            }
            match parse_line(&line) {
                Some(AnnexLine::Progress(p)) => {
                    let rate = tracker.update(&p.action.file, p.byte_progress);
                    let _ = tx
                        .send(RepoFileStatus::transfer(
                            state,
                            &p.action.file,
                            &p.percent_progress,
                            rate,
                        ))
                        .await;
                }
                Some(AnnexLine::Result(r)) => {
                    let file = r.file.clone().or_else(|| r.key.clone()).unwrap_or_default();
                    tracker.finish(&file);
                    if r.success {
                        outcome.succeeded.push(file.clone());
                        let _ = tx.send(RepoFileStatus::done(state, file)).await;
                    } else {
                        outcome.failures += 1;
                        let _ = tx
                            .send(RepoFileStatus::failed(state, file, describe_failure(&r)))
                            .await;
                    }
                }
                None => warn!("{}: skipping unparseable line: {}", origin, line),
            }
        }

        match child.wait(origin).await {
            Ok(()) => Ok(outcome),
            // the extension exits non-zero when any file failed; those
            // failures are already on the stream
            Err(_) if outcome.failures > 0 => Ok(outcome),
            Err(err) => Err(err),
        }
    }
}

/// Builds the exclusion arguments for `add` from the annex configuration:
/// the size threshold, one `--exclude` per configured pattern, and the
/// repository-local configuration file which is never annexed.
fn exclusion_args(conf: &AnnexCfg) -> Vec<String> {
    let mut args = Vec::new();
    if !conf.minsize.is_empty() {
        args.push(format!("--largerthan={}", conf.minsize));
    }
    for pattern in &conf.exclude {
        args.push(format!("--exclude={}", pattern));
    }
    args.push("--exclude=config.yml".to_string());
    args
}

/// Parses one JSON-lines record. Returns None for lines that are neither a
/// progress nor a result record; callers log and continue.
pub fn parse_line(line: &str) -> Option<AnnexLine> {
    serde_json::from_str(line).ok()
}

/// Maps a failed result to its user-facing description.
fn describe_failure(result: &AnnexResult) -> String {
    let mut text = result.note.clone().unwrap_or_default();
    if text.is_empty() {
        text = result.error_messages.join("; ");
    }

    if text.contains("Unable to access") {
        return "authorisation failed or remote storage unavailable".to_string();
    }
    if result.command == "drop" && text.contains("unsafe") {
        return "failed (unsafe): could not verify remote copy".to_string();
    }
    if text.is_empty() {
        return "failed".to_string();
    }
    text
}

/// Extracts a per-file event from the sync verb's human output.
fn parse_sync_line(line: &str) -> Option<RepoFileStatus> {
    let (verb, rest) = line.split_once(' ')?;
    let state = match verb {
        "copy" => OpState::Uploading,
        "get" => OpState::Downloading,
        _ => return None,
    };

    let rest = rest.trim();
    let (file, tail) = match rest.split_once(" (") {
        Some((file, tail)) => (file.trim(), tail),
        None => match rest.strip_suffix(" ok") {
            Some(file) => (file.trim(), "ok"),
            None => (rest, ""),
        },
    };
    if file.is_empty() {
        return None;
    }

    if tail.contains("failed") || rest.ends_with("failed") {
        Some(RepoFileStatus::failed(state, file, "failed"))
    } else {
        Some(RepoFileStatus::done(state, file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_records_parse() {
        let line = r#"{"byte-progress":26214400,"total-size":52428800,"percent-progress":"50%","action":{"command":"copy","file":"big.nc","input":["big.nc"],"key":"MD5-s52428800--aabbcc"}}"#;
        match parse_line(line) {
            Some(AnnexLine::Progress(p)) => {
                assert_eq!(p.action.file, "big.nc");
                assert_eq!(p.byte_progress, 26214400);
                assert_eq!(p.percent_progress, "50%");
            }
            other => panic!("expected progress record, got {:?}", other),
        }
    }

    #[test]
    fn result_records_parse() {
        let line = r#"{"command":"copy","file":"big.nc","input":["big.nc"],"key":"MD5-s52428800--aabbcc","success":true,"note":"checking origin...","error-messages":[]}"#;
        match parse_line(line) {
            Some(AnnexLine::Result(r)) => {
                assert!(r.success);
                assert_eq!(r.file.as_deref(), Some("big.nc"));
            }
            other => panic!("expected result record, got {:?}", other),
        }
    }

    #[test]
    fn garbage_lines_do_not_parse() {
        assert!(parse_line("(recording state in git...)").is_none());
        assert!(parse_line("").is_none());
    }

    #[test]
    fn unsafe_drop_is_described() {
        let result = AnnexResult {
            command: "drop".into(),
            file: Some("only-copy.nc".into()),
            key: None,
            success: false,
            note: Some("unsafe (Could only verify the existence of 0 out of 1 necessary copies)".into()),
            error_messages: vec![],
        };
        assert_eq!(
            describe_failure(&result),
            "failed (unsafe): could not verify remote copy"
        );
    }

    #[test]
    fn unreachable_remote_is_described() {
        let result = AnnexResult {
            command: "copy".into(),
            file: Some("big.nc".into()),
            key: None,
            success: false,
            note: None,
            error_messages: vec!["Unable to access these remotes: origin".into()],
        };
        assert_eq!(
            describe_failure(&result),
            "authorisation failed or remote storage unavailable"
        );
    }

    #[test]
    fn failure_without_note_has_fallback() {
        let result = AnnexResult {
            command: "get".into(),
            file: Some("x".into()),
            key: None,
            success: false,
            note: None,
            error_messages: vec![],
        };
        assert_eq!(describe_failure(&result), "failed");
    }

    #[test]
    fn exclusion_arguments() {
        let conf = AnnexCfg {
            minsize: "10M".into(),
            exclude: vec!["*.py".into(), "*.md".into()],
        };
        assert_eq!(
            exclusion_args(&conf),
            vec![
                "--largerthan=10M",
                "--exclude=*.py",
                "--exclude=*.md",
                "--exclude=config.yml"
            ]
        );

        // the local configuration file is excluded even with no settings
        let empty = AnnexCfg {
            minsize: String::new(),
            exclude: vec![],
        };
        assert_eq!(exclusion_args(&empty), vec!["--exclude=config.yml"]);
    }

    #[test]
    fn sync_lines_become_events() {
        let ev = parse_sync_line("copy big.nc (to origin...) ok").unwrap();
        assert_eq!(ev.state, OpState::Uploading);
        assert_eq!(ev.file_name, "big.nc");
        assert!(!ev.is_err());

        let ev = parse_sync_line("get data/raw.dat (from origin...) failed").unwrap();
        assert_eq!(ev.state, OpState::Downloading);
        assert!(ev.is_err());

        assert!(parse_sync_line("pull origin").is_none());
        assert!(parse_sync_line("commit  ok").is_none());
    }

    #[test]
    fn whereis_record_parses() {
        let line = r#"{"command":"whereis","file":"big.nc","key":"MD5-s1--ff","success":true,"untrusted":[],"whereis":[{"description":"server","here":false,"uuid":"u1"},{"description":"alice@host:~/repo","here":true,"uuid":"u2"}]}"#;
        let record: AnnexWhereis = serde_json::from_str(line).unwrap();
        assert_eq!(record.whereis.len(), 2);
        assert!(record.whereis[1].here);
    }

    #[test]
    fn info_blob_parses_spaced_keys() {
        let blob = r#"{"command":"info","repository mode":"indirect","local annex keys":5,"annexed files in working tree":12,"success":true}"#;
        let info: AnnexInfo = serde_json::from_str(blob).unwrap();
        assert!(!info.is_direct());
        assert_eq!(info.local_annex_keys, 5);
        assert_eq!(info.annexed_files, 12);
    }
}

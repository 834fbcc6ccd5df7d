use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;

use crate::clients::annex::Annex;
use crate::clients::git::Git;
use crate::config::AnnexCfg;
use crate::ops::{fail, Verb};
use crate::types::errors::GinError;
use crate::types::progress::{OpState, RepoFileStatus};
use crate::utils::paths::expand_globs;

const SUMMARY_LIMIT: usize = 15;

/// The upload pipeline: annex the large files, stage the rest, record a
/// commit, then push metadata and content to each remote in order.
pub struct UploadOp {
    pub git: Git,
    pub annex: Annex,
    pub annex_conf: AnnexCfg,
    pub root: PathBuf,
    pub paths: Vec<String>,
    pub remotes: Vec<String>,
}

#[async_trait]
impl Verb for UploadOp {
    fn name(&self) -> &'static str {
        "upload"
    }

    async fn run(self: Box<Self>, tx: Sender<RepoFileStatus>) -> Result<(), GinError> {
        let paths = if self.paths.is_empty() {
            vec![".".to_string()]
        } else {
            expand_globs(&self.paths, &self.root)
        };

        let direct_mode = self
            .annex
            .info()
            .await
            .map(|info| info.is_direct())
            .unwrap_or(false);

        let annexed = match self.annex.add(&paths, &self.annex_conf, false, &tx).await {
            Ok(outcome) => outcome.succeeded,
            Err(e) => return Err(fail(&tx, OpState::AddingAnnex, e).await),
        };

        // plain `add` is refused in direct mode; core.bare is flipped for
        // the duration and restored by the guard on every exit path
        let staged = {
            let _bare = if direct_mode {
                match self.git.bare_guard().await {
                    Ok(guard) => Some(guard),
                    Err(e) => return Err(fail(&tx, OpState::AddingGit, e).await),
                }
            } else {
                None
            };
            match self.git.add(&paths, &tx).await {
                Ok(staged) => staged,
                Err(e) => return Err(fail(&tx, OpState::AddingGit, e).await),
            }
        };

        let message = upload_message(annexed.iter().chain(staged.iter()));
        // an unchanged index means there is nothing to record, not a failure
        if let Err(e) = self.git.commit(&message).await {
            return Err(fail(&tx, OpState::RecordingChanges, e).await);
        }
        let _ = tx
            .send(RepoFileStatus::done(OpState::RecordingChanges, ""))
            .await;

        for remote in &self.remotes {
            if let Err(e) = self.annex.sync_push(remote, &message).await {
                return Err(fail(&tx, OpState::Uploading, e).await);
            }
            if let Err(e) = self.annex.copy(&paths, remote, &tx).await {
                return Err(fail(&tx, OpState::Uploading, e).await);
            }
        }
        Ok(())
    }
}

/// The generated commit message: a fixed host-stamped header followed by an
/// abbreviated description of the recorded changes.
fn upload_message<'a>(changes: impl Iterator<Item = &'a String>) -> String {
    let host = gethostname::gethostname().to_string_lossy().into_owned();
    let mut message = format!("gin upload from {}\n", host);

    let mut changes: Vec<&String> = changes.collect();
    changes.sort();
    changes.dedup();
    if changes.is_empty() {
        return message;
    }

    message.push('\n');
    for path in changes.iter().take(SUMMARY_LIMIT) {
        message.push_str(&format!("add: {}\n", path));
    }
    if changes.len() > SUMMARY_LIMIT {
        message.push_str(&format!("... and {} more\n", changes.len() - SUMMARY_LIMIT));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_header_and_summary() {
        let changes = vec!["a.txt".to_string(), "b.bin".to_string()];
        let message = upload_message(changes.iter());
        assert!(message.starts_with("gin upload from "));
        assert!(message.contains("\n\nadd: a.txt\n"));
        assert!(message.contains("add: b.bin\n"));
        assert!(!message.contains("more"));
    }

    #[test]
    fn long_change_lists_are_abbreviated() {
        let changes: Vec<String> = (0..20).map(|i| format!("file{:02}.dat", i)).collect();
        let message = upload_message(changes.iter());
        assert!(message.contains("add: file14.dat\n"));
        assert!(!message.contains("add: file15.dat"));
        assert!(message.contains("... and 5 more\n"));
    }

    #[test]
    fn empty_change_list_keeps_header_only() {
        let message = upload_message(std::iter::empty());
        assert!(message.starts_with("gin upload from "));
        assert!(!message.contains("add:"));
    }
}

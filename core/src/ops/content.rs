use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;

use crate::clients::annex::Annex;
use crate::config::AnnexCfg;
use crate::ops::{fail, Verb};
use crate::types::errors::GinError;
use crate::types::progress::{OpState, RepoFileStatus};
use crate::utils::paths::expand_globs;

/// The four single-phase content verbs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentAction {
    Get,
    Remove,
    Lock,
    Unlock,
}

impl ContentAction {
    fn state(&self) -> OpState {
        match self {
            ContentAction::Get => OpState::Downloading,
            ContentAction::Remove => OpState::RemovingContent,
            ContentAction::Lock => OpState::Locking,
            ContentAction::Unlock => OpState::Unlocking,
        }
    }
}

/// Runs one content verb over a set of path patterns. Per-file failures
/// ride the stream; only a whole-verb breakdown fails the operation.
pub struct ContentOp {
    pub annex: Annex,
    pub annex_conf: AnnexCfg,
    pub root: PathBuf,
    pub paths: Vec<String>,
    pub action: ContentAction,
}

#[async_trait]
impl Verb for ContentOp {
    fn name(&self) -> &'static str {
        match self.action {
            ContentAction::Get => "get-content",
            ContentAction::Remove => "remove-content",
            ContentAction::Lock => "lock",
            ContentAction::Unlock => "unlock",
        }
    }

    async fn run(self: Box<Self>, tx: Sender<RepoFileStatus>) -> Result<(), GinError> {
        let paths = if self.paths.is_empty() {
            vec![".".to_string()]
        } else {
            expand_globs(&self.paths, &self.root)
        };

        let result = match self.action {
            ContentAction::Get => self.annex.get(&paths, &tx).await,
            ContentAction::Remove => self.annex.drop(&paths, &tx).await,
            ContentAction::Lock => self.annex.add(&paths, &self.annex_conf, true, &tx).await,
            ContentAction::Unlock => self.annex.unlock(&paths, &tx).await,
        };

        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(fail(&tx, self.action.state(), e).await),
        }
    }
}

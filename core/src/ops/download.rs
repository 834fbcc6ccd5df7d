use async_trait::async_trait;
use tokio::sync::mpsc::Sender;

use crate::clients::annex::Annex;
use crate::config::AnnexCfg;
use crate::ops::{fail, Verb};
use crate::types::errors::GinError;
use crate::types::progress::{OpState, RepoFileStatus};

/// The download pipeline: lock the whole tree so the merge sees clean
/// placeholders, then pull remote changes. With `content` the payload of
/// every placeholder is fetched afterwards.
pub struct DownloadOp {
    pub annex: Annex,
    pub annex_conf: AnnexCfg,
    pub content: bool,
}

#[async_trait]
impl Verb for DownloadOp {
    fn name(&self) -> &'static str {
        "download"
    }

    async fn run(self: Box<Self>, tx: Sender<RepoFileStatus>) -> Result<(), GinError> {
        let everything = vec![".".to_string()];

        if let Err(e) = self
            .annex
            .add(&everything, &self.annex_conf, true, &tx)
            .await
        {
            return Err(fail(&tx, OpState::Locking, e).await);
        }

        if let Err(e) = self.annex.pull(&tx).await {
            return Err(fail(&tx, OpState::Synchronising, e).await);
        }

        if self.content {
            if let Err(e) = self.annex.get(&everything, &tx).await {
                return Err(fail(&tx, OpState::Downloading, e).await);
            }
        }
        Ok(())
    }
}

/// Plain bidirectional synchronisation, with or without content.
pub struct SyncOp {
    pub annex: Annex,
    pub content: bool,
}

#[async_trait]
impl Verb for SyncOp {
    fn name(&self) -> &'static str {
        "sync"
    }

    async fn run(self: Box<Self>, tx: Sender<RepoFileStatus>) -> Result<(), GinError> {
        match self.annex.sync(self.content, &tx).await {
            Ok(()) => Ok(()),
            Err(e) => Err(fail(&tx, OpState::Synchronising, e).await),
        }
    }
}

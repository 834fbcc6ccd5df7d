use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;
use tracing::warn;

use crate::clients::annex::Annex;
use crate::clients::git::Git;
use crate::ops::{fail, Verb};
use crate::types::errors::GinError;
use crate::types::progress::{CheckoutKind, FileCheckoutStatus, OpState, RepoFileStatus};
use crate::utils::paths::{expand_globs, slash};

/// Rolls files (or the whole tree) back to an older revision and records
/// the rollback as a new commit, so history keeps moving forward.
pub struct CheckoutVersionOp {
    pub git: Git,
    pub root: PathBuf,
    pub hash: String,
    pub paths: Vec<String>,
}

#[async_trait]
impl Verb for CheckoutVersionOp {
    fn name(&self) -> &'static str {
        "version"
    }

    async fn run(self: Box<Self>, tx: Sender<RepoFileStatus>) -> Result<(), GinError> {
        let paths = expand_globs(&self.paths, &self.root);
        if let Err(e) = self.git.checkout(&self.hash, &paths).await {
            return Err(fail(&tx, OpState::RecordingChanges, e).await);
        }

        let stage = if paths.is_empty() {
            vec![".".to_string()]
        } else {
            paths
        };
        if let Err(e) = self.git.add(&stage, &tx).await {
            return Err(fail(&tx, OpState::AddingGit, e).await);
        }

        let abbrev = &self.hash[..self.hash.len().min(8)];
        let message = format!("gin version: roll back to {}", abbrev);
        if let Err(e) = self.git.commit(&message).await {
            return Err(fail(&tx, OpState::RecordingChanges, e).await);
        }
        let _ = tx
            .send(RepoFileStatus::done(OpState::RecordingChanges, ""))
            .await;
        Ok(())
    }
}

/// Copies the contents of files as they were at an older revision into a
/// destination directory, suffixing each copy with the revision's date.
/// Placeholder links are recreated through the extension so their content
/// can be fetched; regular blobs are written directly.
pub struct CheckoutCopiesOp {
    pub git: Git,
    pub annex: Annex,
    pub root: PathBuf,
    pub hash: String,
    pub paths: Vec<String>,
    /// Destination directory, relative to the repository root.
    pub destination: PathBuf,
    /// ISO 8601 date of the revision, used as the copy suffix.
    pub isodate: String,
}

impl CheckoutCopiesOp {
    pub(crate) async fn run(self, tx: Sender<FileCheckoutStatus>) -> Result<(), GinError> {
        let paths = expand_globs(&self.paths, &self.root);
        let objects = self.git.ls_tree(&self.hash, &paths).await?;
        let abs_destination = self.root.join(&self.destination);

        for object in objects {
            match object.otype.as_str() {
                "tree" => {
                    let dir = abs_destination.join(&object.name);
                    let event = match fs::create_dir_all(&dir) {
                        Ok(()) => FileCheckoutStatus {
                            file_name: object.name.clone(),
                            kind: CheckoutKind::Tree,
                            destination: slash(&self.destination.join(&object.name)),
                            err: None,
                        },
                        Err(e) => FileCheckoutStatus {
                            file_name: object.name.clone(),
                            kind: CheckoutKind::Tree,
                            destination: slash(&self.destination.join(&object.name)),
                            err: Some(e.to_string()),
                        },
                    };
                    let _ = tx.send(event).await;
                }
                "blob" => {
                    let event = self.checkout_blob(&object, &abs_destination).await;
                    let _ = tx.send(event).await;
                }
                other => warn!("Skipping object {} of type {}", object.name, other),
            }
        }
        Ok(())
    }

    async fn checkout_blob(
        &self,
        object: &crate::clients::git::TreeObject,
        abs_destination: &std::path::Path,
    ) -> FileCheckoutStatus {
        let copy_name = format!("{}.{}", object.name, self.isodate);
        let rel_out = self.destination.join(&copy_name);
        let abs_out = abs_destination.join(&copy_name);
        let destination = slash(&rel_out);

        let content = match self.git.cat_file(&self.hash, &object.name).await {
            Ok(content) => content,
            Err(e) => {
                return FileCheckoutStatus {
                    file_name: object.name.clone(),
                    kind: CheckoutKind::Git,
                    destination,
                    err: Some(e.to_string()),
                }
            }
        };

        if let Some(parent) = abs_out.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                return FileCheckoutStatus {
                    file_name: object.name.clone(),
                    kind: CheckoutKind::Git,
                    destination,
                    err: Some(e.to_string()),
                };
            }
        }

        let text = String::from_utf8_lossy(&content);
        if object.mode == "120000" && text.contains(".git/annex/objects") {
            // a placeholder link: recreate it from the content key so the
            // old payload can be fetched
            let key = text.rsplit('/').next().unwrap_or_default().trim();
            let err = match self.annex.from_key(key, &slash(&rel_out)).await {
                Ok(()) => None,
                Err(_) => Some("content not available locally".to_string()),
            };
            return FileCheckoutStatus {
                file_name: object.name.clone(),
                kind: CheckoutKind::Annex,
                destination,
                err,
            };
        }

        let err = fs::write(&abs_out, &content).err().map(|e| e.to_string());
        FileCheckoutStatus {
            file_name: object.name.clone(),
            kind: CheckoutKind::Git,
            destination,
            err,
        }
    }
}

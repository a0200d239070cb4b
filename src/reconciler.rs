//! The crawl-and-compare reconciliation engine: for every remote and
//! local entry under a synced folder, decide whether to download,
//! upload, update, delete, or flag a conflict, and keep the shadow
//! database's per-path metadata current as each decision is carried out.
//!
//! The traversal is depth-first, rooted at a remote folder handle and
//! its corresponding local directory. Phase R crawls what the remote
//! side reports; phases LF and LD then crawl the local directory for
//! anything Phase R never saw.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_recursion::async_recursion;
use chrono::Utc;

use crate::conflict::{self, ConflictHandler};
use crate::remote::{RemoteChild, RemoteClient, RemoteDocumentHandle, RemoteFolderHandle};
use crate::shadow_db::ShadowDb;

pub struct Reconciler {
    remote: Arc<dyn RemoteClient>,
    conflict_handler: Arc<dyn ConflictHandler>,
    bidirectional: bool,
    cancel: Arc<AtomicBool>,
}

impl Reconciler {
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        conflict_handler: Arc<dyn ConflictHandler>,
        bidirectional: bool,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            remote,
            conflict_handler,
            bidirectional,
            cancel,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Traverses `remoteRoot`/`localRoot` once. Runs to completion or
    /// until a remote error propagates (spec.md §4.4); the pass is
    /// idempotent and safe to re-invoke on the next trigger.
    pub async fn sync(&self, db: &mut ShadowDb, remote_root: &RemoteFolderHandle, local_root: &Path) -> Result<()> {
        fs::create_dir_all(local_root)
            .with_context(|| format!("create local root {}", local_root.display()))?;
        self.sync_folder(db, remote_root, local_root).await
    }

    #[async_recursion]
    async fn sync_folder(
        &self,
        db: &mut ShadowDb,
        remote_folder: &RemoteFolderHandle,
        local_folder: &Path,
    ) -> Result<()> {
        if self.cancelled() {
            return Ok(());
        }

        let children = self
            .remote
            .children(remote_folder)
            .await
            .with_context(|| format!("list children of {}", remote_folder.path))?;

        let mut remote_subfolder_names: HashSet<String> = HashSet::new();
        let mut remote_file_names: HashSet<String> = HashSet::new();
        let mut remote_docs_by_name: HashMap<String, RemoteDocumentHandle> = HashMap::new();

        for child in children {
            if self.cancelled() {
                return Ok(());
            }
            match child {
                RemoteChild::Folder(folder) => {
                    remote_subfolder_names.insert(folder.name.clone());
                    self.handle_remote_folder_child(db, local_folder, &folder).await?;
                }
                RemoteChild::Document(doc) => {
                    let Some(name) = doc.content_stream_file_name.clone() else {
                        crate::logging::info(format!(
                            "Sync: document at {} has no content stream filename, skipping",
                            doc.path
                        ));
                        continue;
                    };
                    remote_file_names.insert(name.clone());
                    remote_docs_by_name.insert(name.clone(), doc.clone());
                    self.handle_remote_document_child(db, local_folder, &name, &doc).await?;
                }
            }
        }

        self.crawl_local_files(
            db,
            remote_folder,
            local_folder,
            &remote_file_names,
            &remote_docs_by_name,
        )
        .await?;
        self.crawl_local_folders(db, remote_folder, local_folder, &remote_subfolder_names)
            .await?;

        Ok(())
    }

    async fn handle_remote_folder_child(
        &self,
        db: &mut ShadowDb,
        local_folder: &Path,
        child: &RemoteFolderHandle,
    ) -> Result<()> {
        let local_sub = local_folder.join(&child.name);

        if local_sub.is_dir() {
            self.sync_folder(db, child, &local_sub).await?;
        } else if local_sub.is_file() {
            crate::logging::info(format!(
                "Sync: local file {} shadowed by remote folder of the same name, removing",
                local_sub.display()
            ));
            fs::remove_file(&local_sub)
                .with_context(|| format!("remove shadowed file {}", local_sub.display()))?;
        } else if db.contains_folder(&local_sub) {
            self.remote
                .delete_tree(child, true)
                .await
                .with_context(|| format!("delete remote folder {}", child.path))?;
            db.remove_folder(&local_sub);
        } else {
            fs::create_dir_all(&local_sub)
                .with_context(|| format!("create local folder {}", local_sub.display()))?;
            db.add_folder(&local_sub, Some(child.last_mod_time));
            self.download_subtree(db, child, &local_sub).await?;
        }
        Ok(())
    }

    async fn handle_remote_document_child(
        &self,
        db: &mut ShadowDb,
        local_folder: &Path,
        name: &str,
        child: &RemoteDocumentHandle,
    ) -> Result<()> {
        let file_path = local_folder.join(name);

        if file_path.is_dir() {
            // remote kind (document) wins over a local folder of the same name
            fs::remove_dir_all(&file_path)
                .with_context(|| format!("remove shadowed folder {}", file_path.display()))?;
            db.remove_folder(&file_path);
        }

        if file_path.is_file() {
            let remote_mod_time = child.last_mod_time;
            let db_mod_time = db.get_server_mod_time(&file_path);
            match db_mod_time {
                None => {
                    self.remote
                        .download_content(child, &file_path)
                        .await
                        .with_context(|| format!("download {}", child.path))?;
                    db.add_file(&file_path, Some(remote_mod_time));
                }
                Some(db_mod_time) if remote_mod_time > db_mod_time => {
                    if db.local_file_has_changed(&file_path) {
                        let saved_as = conflict::park_conflicting_file(&file_path)?;
                        self.remote
                            .download_content(child, &file_path)
                            .await
                            .with_context(|| format!("download {} after conflict", child.path))?;
                        self.conflict_handler.on_conflict(&file_path, &saved_as);
                    } else {
                        self.remote
                            .download_content(child, &file_path)
                            .await
                            .with_context(|| format!("download {}", child.path))?;
                    }
                    db.add_file(&file_path, Some(remote_mod_time));
                }
                Some(_) => {
                    // remote timestamp hasn't advanced past what we recorded:
                    // nothing to do server-side this pass (Phase LF handles
                    // local-only changes).
                }
            }
            return Ok(());
        }

        // file_path doesn't exist locally (possibly just removed above as a
        // folder collision)
        if db.contains_file(&file_path) {
            self.remote
                .delete_all_versions(child)
                .await
                .with_context(|| format!("delete all versions of {}", child.path))?;
            db.remove_file(&file_path);
        } else {
            self.remote
                .download_content(child, &file_path)
                .await
                .with_context(|| format!("download {}", child.path))?;
            db.add_file(&file_path, Some(child.last_mod_time));
        }
        Ok(())
    }

    /// Phase D: unconditional recursive download of a freshly discovered
    /// remote subtree. Folder records use the subfolder's own
    /// `lastModTime`, not the parent's — the source pins the parent's
    /// timestamp here, which is documented as a bug it does not reproduce.
    #[async_recursion]
    async fn download_subtree(
        &self,
        db: &mut ShadowDb,
        remote_folder: &RemoteFolderHandle,
        local_folder: &Path,
    ) -> Result<()> {
        if self.cancelled() {
            return Ok(());
        }
        let children = self
            .remote
            .children(remote_folder)
            .await
            .with_context(|| format!("list children of {}", remote_folder.path))?;

        for child in children {
            if self.cancelled() {
                return Ok(());
            }
            match child {
                RemoteChild::Folder(sub) => {
                    let local_sub = local_folder.join(&sub.name);
                    fs::create_dir_all(&local_sub)
                        .with_context(|| format!("create local folder {}", local_sub.display()))?;
                    db.add_folder(&local_sub, Some(sub.last_mod_time));
                    self.download_subtree(db, &sub, &local_sub).await?;
                }
                RemoteChild::Document(doc) => {
                    let Some(name) = doc.content_stream_file_name.clone() else {
                        crate::logging::info(format!(
                            "Sync: document at {} has no content stream filename, skipping",
                            doc.path
                        ));
                        continue;
                    };
                    let path = local_folder.join(&name);
                    if path.is_dir() {
                        fs::remove_dir_all(&path)
                            .with_context(|| format!("remove shadowed folder {}", path.display()))?;
                    }
                    self.remote
                        .download_content(&doc, &path)
                        .await
                        .with_context(|| format!("download {}", doc.path))?;
                    db.add_file(&path, Some(doc.last_mod_time));
                }
            }
        }
        Ok(())
    }

    /// Phase LF: non-recursive scan of plain files in `local_folder` for
    /// anything Phase R never saw remotely.
    async fn crawl_local_files(
        &self,
        db: &mut ShadowDb,
        remote_folder: &RemoteFolderHandle,
        local_folder: &Path,
        remote_file_names: &HashSet<String>,
        remote_docs_by_name: &HashMap<String, RemoteDocumentHandle>,
    ) -> Result<()> {
        let entries = match fs::read_dir(local_folder) {
            Ok(entries) => entries,
            Err(err) => {
                crate::logging::error(format!(
                    "Sync: read_dir {} failed: {err:?}",
                    local_folder.display()
                ));
                return Ok(());
            }
        };

        for entry in entries {
            let entry = entry.with_context(|| format!("read entry in {}", local_folder.display()))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if conflict_marker(&name) {
                continue;
            }

            if !remote_file_names.contains(&name) {
                if db.contains_file(&path) {
                    fs::remove_file(&path)
                        .with_context(|| format!("remove locally-deleted-remotely file {}", path.display()))?;
                    db.remove_file(&path);
                } else if self.bidirectional {
                    self.upload_new_file(db, remote_folder, &path, &name).await?;
                }
            } else if db.local_file_has_changed(&path) && self.bidirectional {
                if let Some(doc) = remote_docs_by_name.get(&name) {
                    match self.remote.set_content_stream(doc, &path).await {
                        Ok(updated) => db.add_file(&path, Some(updated.last_mod_time)),
                        Err(err) => crate::logging::error(format!(
                            "Sync: upload new content for {} failed: {err}",
                            path.display()
                        )),
                    }
                }
                // not found among this pass's remote children: abandon, a
                // later pass will reconcile once the listing catches up.
            }
        }
        Ok(())
    }

    async fn upload_new_file(
        &self,
        db: &mut ShadowDb,
        remote_parent: &RemoteFolderHandle,
        path: &Path,
        name: &str,
    ) -> Result<()> {
        let mime_type = guess_mime_type(name);
        match self
            .remote
            .create_document(remote_parent, name, mime_type, path)
            .await
        {
            Ok(created) => db.add_file(path, Some(created.last_mod_time)),
            Err(_) if !path.exists() => {
                // file vanished mid-upload; nothing remote was recorded as
                // committed since create_document never returned Ok, so
                // there is nothing to revert.
            }
            Err(err) => crate::logging::error(format!(
                "Sync: upload {} failed: {err}",
                path.display()
            )),
        }
        Ok(())
    }

    /// Phase LD: non-recursive scan of subdirectories in `local_folder`
    /// for anything Phase R never saw remotely.
    async fn crawl_local_folders(
        &self,
        db: &mut ShadowDb,
        remote_folder: &RemoteFolderHandle,
        local_folder: &Path,
        remote_subfolder_names: &HashSet<String>,
    ) -> Result<()> {
        let entries = match fs::read_dir(local_folder) {
            Ok(entries) => entries,
            Err(err) => {
                crate::logging::error(format!(
                    "Sync: read_dir {} failed: {err:?}",
                    local_folder.display()
                ));
                return Ok(());
            }
        };

        for entry in entries {
            let entry = entry.with_context(|| format!("read entry in {}", local_folder.display()))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();

            if !remote_subfolder_names.contains(&name) {
                if db.contains_folder(&path) {
                    fs::remove_dir_all(&path)
                        .with_context(|| format!("remove locally-deleted-remotely folder {}", path.display()))?;
                    db.remove_folder(&path);
                } else if self.bidirectional {
                    match self.remote.create_folder(remote_folder, &name).await {
                        Ok(created) => db.add_folder(&path, Some(created.last_mod_time)),
                        Err(err) => crate::logging::error(format!(
                            "Sync: create remote folder for {} failed: {err}",
                            path.display()
                        )),
                    }
                }
            }
        }
        Ok(())
    }
}

fn conflict_marker(name: &str) -> bool {
    name.contains("_your-version")
}

fn guess_mime_type(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "txt" | "md" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "zip" => "application/zip",
        "csv" => "text/csv",
        _ => "application/octet-stream",
    }
}

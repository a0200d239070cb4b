//! The remote protocol client is an external collaborator: the
//! reconciliation engine only ever talks to it through [`RemoteClient`].
//! This module defines that interface plus one concrete, intentionally
//! thin binding (`AtomPubRemoteClient`) over a CMIS-speaking HTTP
//! endpoint, sufficient to drive the reconciler end to end. Session
//! establishment, auth refresh UX, and full AtomPub XML parsing are
//! explicitly not goals here (spec.md §1); a production binding would
//! replace `AtomPubRemoteClient`'s innards without touching the trait.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::{Client as HttpClient, ClientBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

/// Error taxonomy the Sync Loop and Reconciler distinguish on (spec.md §7):
/// `Runtime` is a session/connect failure (retried with back-off),
/// `Base` is any other remote-call failure mid-pass (logged, pass aborts).
#[derive(Debug, Clone)]
pub enum RemoteError {
    Runtime(String),
    Base(String),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Runtime(msg) => write!(f, "remote runtime error: {msg}"),
            RemoteError::Base(msg) => write!(f, "remote error: {msg}"),
        }
    }
}

impl std::error::Error for RemoteError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolderHandle {
    pub name: String,
    /// Remote path this folder was reached at, e.g. `/Shared/A`.
    pub path: String,
    pub last_mod_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDocumentHandle {
    pub name: String,
    /// The content-stream filename. `None` means "skip this document"
    /// (spec.md §3): some servers diverge between display name and the
    /// name the bytes should land under locally.
    pub content_stream_file_name: Option<String>,
    pub last_mod_time: DateTime<Utc>,
    pub last_modified_by: String,
    pub path: String,
}

#[derive(Debug, Clone)]
pub enum RemoteChild {
    Folder(RemoteFolderHandle),
    Document(RemoteDocumentHandle),
}

/// Minimum surface the Reconciler needs from the remote repository
/// (spec.md §4.6). Implementations own their session/connection state;
/// the Reconciler borrows handles for the duration of one traversal.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Establishes (or refreshes) a session. Called by the Sync Loop with
    /// its own retry/back-off; the Reconciler never calls this directly.
    async fn connect(&self) -> Result<(), RemoteError>;

    async fn get_folder_by_path(&self, path: &str) -> Result<RemoteFolderHandle, RemoteError>;

    /// One-shot, finite listing of a folder's direct children.
    async fn children(&self, folder: &RemoteFolderHandle) -> Result<Vec<RemoteChild>, RemoteError>;

    async fn create_folder(
        &self,
        parent: &RemoteFolderHandle,
        name: &str,
    ) -> Result<RemoteFolderHandle, RemoteError>;

    async fn create_document(
        &self,
        parent: &RemoteFolderHandle,
        name: &str,
        mime_type: &str,
        local_path: &Path,
    ) -> Result<RemoteDocumentHandle, RemoteError>;

    async fn delete_tree(
        &self,
        folder: &RemoteFolderHandle,
        continue_on_failure: bool,
    ) -> Result<(), RemoteError>;

    /// Downloads the document's content stream to `target` (a fresh,
    /// not-yet-existing local path; staging/renaming is the caller's job).
    async fn download_content(
        &self,
        doc: &RemoteDocumentHandle,
        target: &Path,
    ) -> Result<(), RemoteError>;

    /// Overwrites the document's content stream from `local_path` and
    /// returns the document's handle refreshed with the server's new
    /// `lastModTime` (`overwrite=true, refreshState=true` in spec.md §4.6).
    async fn set_content_stream(
        &self,
        doc: &RemoteDocumentHandle,
        local_path: &Path,
    ) -> Result<RemoteDocumentHandle, RemoteError>;

    async fn delete_all_versions(&self, doc: &RemoteDocumentHandle) -> Result<(), RemoteError>;

    /// Probes change-feed capability. A conforming implementation may
    /// always answer `None` ("crawl only") and leave the feed path
    /// unimplemented (spec.md §4.6).
    async fn change_feed_capability(&self) -> Result<Option<ChangeFeedCapability>, RemoteError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeFeedCapability {
    All,
    ObjectIdsOnly,
}

/// Session parameters for the AtomPub-style binding (spec.md §6).
#[derive(Debug, Clone)]
pub struct AtomPubSession {
    pub atom_pub_url: String,
    pub user: String,
    pub password: String,
    pub repository_id: String,
}

/// A thin JSON binding over a CMIS-speaking HTTP endpoint: enough to
/// exercise every `RemoteClient` method against a real server, not a
/// full AtomPub/XML client. Built the way the teacher's `ApiClient`
/// builds its HTTP surface (single `reqwest::Client`, JSON bodies,
/// multipart uploads, streamed downloads).
pub struct AtomPubRemoteClient {
    http: HttpClient,
    session: AtomPubSession,
}

impl AtomPubRemoteClient {
    pub fn new(session: AtomPubSession) -> Result<Self> {
        let http = ClientBuilder::new()
            .timeout(Duration::from_secs(10 * 60))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("cmissync-rs/0.1")
            .build()?;
        Ok(Self { http, session })
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}{}", self.session.atom_pub_url.trim_end_matches('/'), suffix)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.basic_auth(&self.session.user, Some(&self.session.password))
            .query(&[("repositoryId", &self.session.repository_id)])
    }
}

#[derive(Debug, Deserialize)]
struct FolderDto {
    name: String,
    path: String,
    #[serde(rename = "lastModTime")]
    last_mod_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct DocumentDto {
    name: String,
    #[serde(rename = "contentStreamFileName")]
    content_stream_file_name: Option<String>,
    #[serde(rename = "lastModTime")]
    last_mod_time: DateTime<Utc>,
    #[serde(rename = "lastModifiedBy", default)]
    last_modified_by: String,
    path: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum ChildDto {
    Folder(FolderDto),
    Document(DocumentDto),
}

#[derive(Debug, Serialize)]
struct CreateFolderRequest<'a> {
    #[serde(rename = "parentPath")]
    parent_path: &'a str,
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct RepositoryInfoDto {
    #[serde(rename = "changeFeedCapability")]
    change_feed_capability: Option<String>,
}

impl From<FolderDto> for RemoteFolderHandle {
    fn from(d: FolderDto) -> Self {
        RemoteFolderHandle {
            name: d.name,
            path: d.path,
            last_mod_time: d.last_mod_time,
        }
    }
}

impl From<DocumentDto> for RemoteDocumentHandle {
    fn from(d: DocumentDto) -> Self {
        RemoteDocumentHandle {
            name: d.name,
            content_stream_file_name: d.content_stream_file_name,
            last_mod_time: d.last_mod_time,
            last_modified_by: d.last_modified_by,
            path: d.path,
        }
    }
}

fn runtime_err(err: impl std::fmt::Display) -> RemoteError {
    RemoteError::Runtime(err.to_string())
}

fn base_err(err: impl std::fmt::Display) -> RemoteError {
    RemoteError::Base(err.to_string())
}

#[async_trait]
impl RemoteClient for AtomPubRemoteClient {
    async fn connect(&self) -> Result<(), RemoteError> {
        let url = self.url("/repositoryinfo");
        let resp = self
            .authed(self.http.get(url))
            .send()
            .await
            .map_err(runtime_err)?;
        if !resp.status().is_success() {
            return Err(RemoteError::Runtime(format!(
                "repositoryinfo returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn get_folder_by_path(&self, path: &str) -> Result<RemoteFolderHandle, RemoteError> {
        let url = self.url("/folder");
        let resp = self
            .authed(self.http.get(url).query(&[("path", path)]))
            .send()
            .await
            .map_err(base_err)?;
        let dto: FolderDto = map_json(resp, "get folder by path").await?;
        Ok(dto.into())
    }

    async fn children(&self, folder: &RemoteFolderHandle) -> Result<Vec<RemoteChild>, RemoteError> {
        let url = self.url("/folder/children");
        let resp = self
            .authed(self.http.get(url).query(&[("path", &folder.path)]))
            .send()
            .await
            .map_err(base_err)?;
        let dtos: Vec<ChildDto> = map_json(resp, "list children").await?;
        Ok(dtos
            .into_iter()
            .map(|c| match c {
                ChildDto::Folder(f) => RemoteChild::Folder(f.into()),
                ChildDto::Document(d) => RemoteChild::Document(d.into()),
            })
            .collect())
    }

    async fn create_folder(
        &self,
        parent: &RemoteFolderHandle,
        name: &str,
    ) -> Result<RemoteFolderHandle, RemoteError> {
        let url = self.url("/folder");
        let body = CreateFolderRequest {
            parent_path: &parent.path,
            name,
        };
        let resp = self
            .authed(self.http.post(url).json(&body))
            .send()
            .await
            .map_err(base_err)?;
        let dto: FolderDto = map_json(resp, "create folder").await?;
        Ok(dto.into())
    }

    async fn create_document(
        &self,
        parent: &RemoteFolderHandle,
        name: &str,
        mime_type: &str,
        local_path: &Path,
    ) -> Result<RemoteDocumentHandle, RemoteError> {
        let url = self.url("/document");
        let form = reqwest::multipart::Form::new()
            .text("parentPath", parent.path.clone())
            .text("name", name.to_string())
            .text("mimeType", mime_type.to_string())
            .file("file", local_path)
            .await
            .map_err(base_err)?;
        let resp = self
            .authed(self.http.post(url))
            .multipart(form)
            .send()
            .await
            .map_err(base_err)?;
        let dto: DocumentDto = map_json(resp, "create document").await?;
        Ok(dto.into())
    }

    async fn delete_tree(
        &self,
        folder: &RemoteFolderHandle,
        continue_on_failure: bool,
    ) -> Result<(), RemoteError> {
        let url = self.url("/folder/tree");
        let resp = self
            .authed(self.http.delete(url).query(&[
                ("path", folder.path.as_str()),
                (
                    "continueOnFailure",
                    if continue_on_failure { "true" } else { "false" },
                ),
            ]))
            .send()
            .await
            .map_err(base_err)?;
        map_status(resp, "delete tree").await
    }

    async fn download_content(
        &self,
        doc: &RemoteDocumentHandle,
        target: &Path,
    ) -> Result<(), RemoteError> {
        let url = self.url("/document/content");
        let resp = self
            .authed(self.http.get(url).query(&[("path", doc.path.as_str())]))
            .send()
            .await
            .map_err(base_err)?;
        if !resp.status().is_success() {
            return Err(RemoteError::Base(format!(
                "download content failed: {}",
                resp.status()
            )));
        }
        let mut file = tokio::fs::File::create(target).await.map_err(base_err)?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(base_err)?;
            file.write_all(&bytes).await.map_err(base_err)?;
        }
        file.flush().await.map_err(base_err)?;
        Ok(())
    }

    async fn set_content_stream(
        &self,
        doc: &RemoteDocumentHandle,
        local_path: &Path,
    ) -> Result<RemoteDocumentHandle, RemoteError> {
        let url = self.url("/document/content");
        let form = reqwest::multipart::Form::new()
            .text("path", doc.path.clone())
            .text("overwrite", "true")
            .file("file", local_path)
            .await
            .map_err(base_err)?;
        let resp = self
            .authed(self.http.put(url))
            .multipart(form)
            .send()
            .await
            .map_err(base_err)?;
        let dto: DocumentDto = map_json(resp, "set content stream").await?;
        Ok(dto.into())
    }

    async fn delete_all_versions(&self, doc: &RemoteDocumentHandle) -> Result<(), RemoteError> {
        let url = self.url("/document");
        let resp = self
            .authed(self.http.delete(url).query(&[
                ("path", doc.path.as_str()),
                ("allVersions", "true"),
            ]))
            .send()
            .await
            .map_err(base_err)?;
        map_status(resp, "delete all versions").await
    }

    async fn change_feed_capability(&self) -> Result<Option<ChangeFeedCapability>, RemoteError> {
        let url = self.url("/repositoryinfo");
        let resp = self
            .authed(self.http.get(url))
            .send()
            .await
            .map_err(runtime_err)?;
        let dto: RepositoryInfoDto = map_json(resp, "repository info").await?;
        Ok(match dto.change_feed_capability.as_deref() {
            Some("all") => Some(ChangeFeedCapability::All),
            Some("objectidsonly") | Some("object-ids-only") => {
                Some(ChangeFeedCapability::ObjectIdsOnly)
            }
            _ => None,
        })
    }
}

async fn map_json<T: for<'de> Deserialize<'de>>(
    resp: reqwest::Response,
    op: &str,
) -> Result<T, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return resp.json::<T>().await.map_err(base_err);
    }
    let text = resp.text().await.unwrap_or_default();
    Err(classify_status(status, op, &text))
}

async fn map_status(resp: reqwest::Response, op: &str) -> Result<(), RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let text = resp.text().await.unwrap_or_default();
    Err(classify_status(status, op, &text))
}

fn classify_status(status: StatusCode, op: &str, text: &str) -> RemoteError {
    if status.is_server_error() || status == StatusCode::SERVICE_UNAVAILABLE {
        RemoteError::Runtime(format!("{op} failed: {status} {text}"))
    } else {
        RemoteError::Base(format!("{op} failed: {status} {text}"))
    }
}

/// An in-memory `RemoteClient` used by the reconciler's own tests and by
/// black-box integration tests (there is no live CMIS server to run
/// against). Mutates its tree in place so a test can assert on both the
/// calls made and the resulting shape.
pub mod fake {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub enum FakeNode {
        Folder {
            last_mod_time: DateTime<Utc>,
            children: BTreeMap<String, FakeNode>,
        },
        Document {
            content: Vec<u8>,
            /// `None` defaults to the tree key at conversion time; `Some(None)`
            /// forces a null content-stream filename even though the node
            /// has a key (spec.md §3's "null `contentStreamFileName`" case).
            content_stream_file_name: Option<Option<String>>,
            last_mod_time: DateTime<Utc>,
            last_modified_by: String,
        },
    }

    impl FakeNode {
        pub fn folder(last_mod_time: DateTime<Utc>) -> Self {
            FakeNode::Folder {
                last_mod_time,
                children: BTreeMap::new(),
            }
        }

        pub fn document(content: &[u8], last_mod_time: DateTime<Utc>) -> Self {
            FakeNode::Document {
                content: content.to_vec(),
                content_stream_file_name: None,
                last_mod_time,
                last_modified_by: "tester".to_string(),
            }
        }

        pub fn with_content_stream_file_name(mut self, name: impl Into<String>) -> Self {
            if let FakeNode::Document {
                content_stream_file_name,
                ..
            } = &mut self
            {
                *content_stream_file_name = Some(Some(name.into()));
            }
            self
        }

        /// Forces a null content-stream filename regardless of this node's
        /// tree key, so the document is skipped by the reconciler entirely.
        pub fn with_null_content_stream_file_name(mut self) -> Self {
            if let FakeNode::Document {
                content_stream_file_name,
                ..
            } = &mut self
            {
                *content_stream_file_name = Some(None);
            }
            self
        }

        pub fn insert(&mut self, name: &str, node: FakeNode) {
            if let FakeNode::Folder { children, .. } = self {
                children.insert(name.to_string(), node);
            }
        }
    }

    /// An in-memory CMIS-like tree, rooted at `/`.
    pub struct FakeRemoteClient {
        root: Mutex<FakeNode>,
        now: DateTime<Utc>,
    }

    impl FakeRemoteClient {
        pub fn new(root: FakeNode, now: DateTime<Utc>) -> Self {
            Self {
                root: Mutex::new(root),
                now,
            }
        }

        fn split_path(path: &str) -> Vec<&str> {
            path.split('/').filter(|p| !p.is_empty()).collect()
        }

        fn handle_for(path: &str, node: &FakeNode) -> RemoteChild {
            let name = path.rsplit('/').next().unwrap_or("").to_string();
            match node {
                FakeNode::Folder { last_mod_time, .. } => RemoteChild::Folder(RemoteFolderHandle {
                    name,
                    path: path.to_string(),
                    last_mod_time: *last_mod_time,
                }),
                FakeNode::Document {
                    content_stream_file_name,
                    last_mod_time,
                    last_modified_by,
                    ..
                } => RemoteChild::Document(RemoteDocumentHandle {
                    name: name.clone(),
                    content_stream_file_name: content_stream_file_name
                        .clone()
                        .unwrap_or(Some(name)),
                    last_mod_time: *last_mod_time,
                    last_modified_by: last_modified_by.clone(),
                    path: path.to_string(),
                }),
            }
        }

        fn navigate<'a>(root: &'a FakeNode, path: &str) -> Option<&'a FakeNode> {
            let mut cur = root;
            for part in Self::split_path(path) {
                match cur {
                    FakeNode::Folder { children, .. } => cur = children.get(part)?,
                    FakeNode::Document { .. } => return None,
                }
            }
            Some(cur)
        }

        fn navigate_mut<'a>(root: &'a mut FakeNode, path: &str) -> Option<&'a mut FakeNode> {
            let mut cur = root;
            for part in Self::split_path(path) {
                match cur {
                    FakeNode::Folder { children, .. } => cur = children.get_mut(part)?,
                    FakeNode::Document { .. } => return None,
                }
            }
            Some(cur)
        }

        fn parent_and_name(path: &str) -> (String, String) {
            let parts = Self::split_path(path);
            let name = parts.last().map(|s| s.to_string()).unwrap_or_default();
            let parent = if parts.len() <= 1 {
                String::new()
            } else {
                format!("/{}", parts[..parts.len() - 1].join("/"))
            };
            (parent, name)
        }
    }

    #[async_trait]
    impl RemoteClient for FakeRemoteClient {
        async fn connect(&self) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn get_folder_by_path(&self, path: &str) -> Result<RemoteFolderHandle, RemoteError> {
            let root = self.root.lock().unwrap();
            match Self::navigate(&root, path) {
                Some(FakeNode::Folder { last_mod_time, .. }) => Ok(RemoteFolderHandle {
                    name: path.rsplit('/').next().unwrap_or("").to_string(),
                    path: path.to_string(),
                    last_mod_time: *last_mod_time,
                }),
                _ => Err(RemoteError::Base(format!("no such folder: {path}"))),
            }
        }

        async fn children(
            &self,
            folder: &RemoteFolderHandle,
        ) -> Result<Vec<RemoteChild>, RemoteError> {
            let root = self.root.lock().unwrap();
            match Self::navigate(&root, &folder.path) {
                Some(FakeNode::Folder { children, .. }) => Ok(children
                    .iter()
                    .map(|(name, node)| {
                        let child_path = format!("{}/{}", folder.path.trim_end_matches('/'), name);
                        Self::handle_for(&child_path, node)
                    })
                    .collect()),
                _ => Err(RemoteError::Base(format!("no such folder: {}", folder.path))),
            }
        }

        async fn create_folder(
            &self,
            parent: &RemoteFolderHandle,
            name: &str,
        ) -> Result<RemoteFolderHandle, RemoteError> {
            let mut root = self.root.lock().unwrap();
            let now = self.now;
            match Self::navigate_mut(&mut root, &parent.path) {
                Some(FakeNode::Folder { children, .. }) => {
                    children.insert(name.to_string(), FakeNode::folder(now));
                    Ok(RemoteFolderHandle {
                        name: name.to_string(),
                        path: format!("{}/{}", parent.path.trim_end_matches('/'), name),
                        last_mod_time: now,
                    })
                }
                _ => Err(RemoteError::Base(format!("no such folder: {}", parent.path))),
            }
        }

        async fn create_document(
            &self,
            parent: &RemoteFolderHandle,
            name: &str,
            _mime_type: &str,
            local_path: &Path,
        ) -> Result<RemoteDocumentHandle, RemoteError> {
            let content = std::fs::read(local_path)
                .map_err(|e| RemoteError::Base(format!("read local file: {e}")))?;
            let mut root = self.root.lock().unwrap();
            let now = self.now;
            match Self::navigate_mut(&mut root, &parent.path) {
                Some(FakeNode::Folder { children, .. }) => {
                    children.insert(
                        name.to_string(),
                        FakeNode::document(&content, now).with_content_stream_file_name(name),
                    );
                    Ok(RemoteDocumentHandle {
                        name: name.to_string(),
                        content_stream_file_name: Some(name.to_string()),
                        last_mod_time: now,
                        last_modified_by: "tester".to_string(),
                        path: format!("{}/{}", parent.path.trim_end_matches('/'), name),
                    })
                }
                _ => Err(RemoteError::Base(format!("no such folder: {}", parent.path))),
            }
        }

        async fn delete_tree(
            &self,
            folder: &RemoteFolderHandle,
            _continue_on_failure: bool,
        ) -> Result<(), RemoteError> {
            let (parent_path, name) = Self::parent_and_name(&folder.path);
            let mut root = self.root.lock().unwrap();
            match Self::navigate_mut(&mut root, &parent_path) {
                Some(FakeNode::Folder { children, .. }) => {
                    children.remove(&name);
                    Ok(())
                }
                _ => Err(RemoteError::Base(format!("no such parent: {parent_path}"))),
            }
        }

        async fn download_content(
            &self,
            doc: &RemoteDocumentHandle,
            target: &Path,
        ) -> Result<(), RemoteError> {
            let root = self.root.lock().unwrap();
            match Self::navigate(&root, &doc.path) {
                Some(FakeNode::Document { content, .. }) => {
                    std::fs::write(target, content)
                        .map_err(|e| RemoteError::Base(format!("write {e}")))?;
                    Ok(())
                }
                _ => Err(RemoteError::Base(format!("no such document: {}", doc.path))),
            }
        }

        async fn set_content_stream(
            &self,
            doc: &RemoteDocumentHandle,
            local_path: &Path,
        ) -> Result<RemoteDocumentHandle, RemoteError> {
            let content = std::fs::read(local_path)
                .map_err(|e| RemoteError::Base(format!("read local file: {e}")))?;
            let mut root = self.root.lock().unwrap();
            let now = self.now;
            match Self::navigate_mut(&mut root, &doc.path) {
                Some(FakeNode::Document {
                    content: stored,
                    last_mod_time,
                    ..
                }) => {
                    *stored = content;
                    *last_mod_time = now;
                    let mut updated = doc.clone();
                    updated.last_mod_time = now;
                    Ok(updated)
                }
                _ => Err(RemoteError::Base(format!("no such document: {}", doc.path))),
            }
        }

        async fn delete_all_versions(&self, doc: &RemoteDocumentHandle) -> Result<(), RemoteError> {
            let (parent_path, name) = Self::parent_and_name(&doc.path);
            let mut root = self.root.lock().unwrap();
            match Self::navigate_mut(&mut root, &parent_path) {
                Some(FakeNode::Folder { children, .. }) => {
                    children.remove(&name);
                    Ok(())
                }
                _ => Err(RemoteError::Base(format!("no such parent: {parent_path}"))),
            }
        }
    }
}

//! Drives one registered folder's background sync: a connect-with-retry
//! step followed by a collapsing trigger queue that feeds the
//! reconciler (spec.md §4.5, §9's "one task per folder" decoupling
//! note).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};

use crate::config::FolderConfig;
use crate::reconciler::Reconciler;
use crate::remote::RemoteClient;
use crate::shadow_db::ShadowDb;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// The core's decoupling seam for progress/status reporting (spec.md
/// §9): a UI or the control surface implements this instead of the
/// sync loop calling into it directly.
pub trait ActivityListener: Send + Sync {
    fn started(&self, folder: &str);
    fn stopped(&self, folder: &str, result: &Result<(), String>);
}

pub struct LoggingActivityListener;

impl ActivityListener for LoggingActivityListener {
    fn started(&self, folder: &str) {
        crate::logging::info(format!("Sync: starting sync for {folder}"));
    }

    fn stopped(&self, folder: &str, result: &Result<(), String>) {
        match result {
            Ok(()) => crate::logging::info(format!("Sync: finished sync for {folder}")),
            Err(err) => crate::logging::error(format!("Sync: sync for {folder} failed: {err}")),
        }
    }
}

/// Background driver for one folder. Owns the only writer to its
/// shadow DB connection (spec.md §5: the DB connection is the single
/// shared mutable resource per worker).
pub struct SyncLoop {
    folder: FolderConfig,
    remote: Arc<dyn RemoteClient>,
    reconciler: Reconciler,
    db: Mutex<ShadowDb>,
    syncing: AtomicBool,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: Mutex<mpsc::Receiver<()>>,
    cancel: Arc<AtomicBool>,
    listener: Arc<dyn ActivityListener>,
}

impl SyncLoop {
    pub fn new(
        folder: FolderConfig,
        remote: Arc<dyn RemoteClient>,
        db: ShadowDb,
        listener: Arc<dyn ActivityListener>,
    ) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let reconciler = Reconciler::new(
            remote.clone(),
            Arc::new(crate::conflict::LoggingConflictHandler),
            folder.bidirectional,
            cancel.clone(),
        );
        Self {
            folder,
            remote,
            reconciler,
            db: Mutex::new(db),
            syncing: AtomicBool::new(false),
            trigger_tx,
            trigger_rx: Mutex::new(trigger_rx),
            cancel,
            listener,
        }
    }

    /// Requests a sync pass. Extra triggers while one is already queued
    /// or running collapse into a single follow-up pass.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    pub fn cancel_current(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Retries `connect` on a fixed interval until it succeeds or
    /// `cancel` is set (spec.md §4.5: infinite retry, no backoff).
    async fn connect_with_retry(&self) {
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return;
            }
            match self.remote.connect().await {
                Ok(()) => return,
                Err(err) => {
                    crate::logging::error(format!(
                        "Sync: connect failed for {}: {err}, retrying in {}s",
                        self.folder.canonical_name,
                        CONNECT_RETRY_INTERVAL.as_secs()
                    ));
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn sync_once(&self) -> Result<()> {
        let root = self
            .remote
            .get_folder_by_path(&self.folder.remote_folder_path)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let mut db = self.db.lock().await;
        self.reconciler
            .sync(&mut db, &root, &self.folder.local_path)
            .await
    }

    /// Runs until the channel is dropped, single-flighting sync passes:
    /// a trigger received while a pass is in progress is left queued
    /// (capacity 1) rather than lost, but never queues more than one.
    pub async fn run(self: Arc<Self>) {
        self.connect_with_retry().await;
        loop {
            {
                let mut rx = self.trigger_rx.lock().await;
                if rx.recv().await.is_none() {
                    return;
                }
            }
            if self.cancel.load(Ordering::SeqCst) {
                return;
            }
            self.syncing.store(true, Ordering::SeqCst);
            self.listener.started(&self.folder.canonical_name);
            let result = self.sync_once().await;
            self.listener.stopped(
                &self.folder.canonical_name,
                &result.as_ref().map(|_| ()).map_err(|e| e.to_string()),
            );
            if let Err(err) = &result {
                crate::logging::error(format!(
                    "Sync: pass for {} failed: {err:?}",
                    self.folder.canonical_name
                ));
            }
            self.syncing.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn folder_name(&self) -> &str {
        &self.folder.canonical_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::{FakeNode, FakeRemoteClient};
    use std::fs;
    use std::sync::Mutex as StdMutex;

    fn ts(secs: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn temp_root(name: &str) -> std::path::PathBuf {
        let mut root = std::env::temp_dir();
        root.push(format!(
            "cmissync-rs-sync-loop-test-{name}-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        fs::create_dir_all(&root).unwrap();
        root
    }

    struct RecordingListener {
        events: StdMutex<Vec<String>>,
    }

    impl ActivityListener for RecordingListener {
        fn started(&self, folder: &str) {
            self.events.lock().unwrap().push(format!("started:{folder}"));
        }

        fn stopped(&self, folder: &str, result: &Result<(), String>) {
            self.events
                .lock()
                .unwrap()
                .push(format!("stopped:{folder}:{}", result.is_ok()));
        }
    }

    #[tokio::test]
    async fn trigger_runs_a_sync_pass_and_notifies_listener() {
        let local_root = temp_root("basic");
        let mut tree = FakeNode::folder(ts(1));
        tree.insert("a.txt", FakeNode::document(b"hello", ts(1)));
        let remote = Arc::new(FakeRemoteClient::new(tree, ts(10)));

        let db_path = local_root.join("shadow.sqlite");
        let db = ShadowDb::open_at(&db_path, &local_root).unwrap();

        let folder = FolderConfig {
            canonical_name: "work".to_string(),
            local_path: local_root.clone(),
            remote_folder_path: "/".to_string(),
            url: "https://cmis.example.com/atom".to_string(),
            user: "alice".to_string(),
            password: "secret".to_string(),
            repository_id: "repo1".to_string(),
            bidirectional: false,
        };

        let listener = Arc::new(RecordingListener {
            events: StdMutex::new(Vec::new()),
        });
        let loop_ = Arc::new(SyncLoop::new(folder, remote, db, listener.clone()));

        loop_.trigger();
        let handle = tokio::spawn(loop_.clone().run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();

        assert!(local_root.join("a.txt").exists());
        let events = listener.events.lock().unwrap();
        assert!(events.contains(&"started:work".to_string()));
        assert!(events.contains(&"stopped:work:true".to_string()));
    }
}

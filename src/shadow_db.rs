use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::checksum;
use crate::path_normalizer::normalize;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY,
    serverSideModificationDate TEXT,
    checksum TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS folders (
    path TEXT PRIMARY KEY,
    serverSideModificationDate TEXT
);
"#;

/// The engine's memory of `(path -> last-known server metadata, last-known
/// local checksum)`, persisted in a single sqlite file named
/// `<localRoot>.cmissync` next to the synced folder.
///
/// A path appears in at most one of `files`/`folders` (invariant 1):
/// every insert into one table deletes any row for the same key in the
/// other before writing, so the invariant holds even if a caller crosses
/// a file/folder rename-in-place without going through `removeFolder`.
pub struct ShadowDb {
    conn: Connection,
    local_root: PathBuf,
}

/// Where the shadow database for a given local sync root lives on disk:
/// `<parent>/<root-basename>.cmissync`.
pub fn db_path_for(local_root: &Path) -> PathBuf {
    let name = local_root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "root".to_string());
    let parent = local_root.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!("{name}.cmissync"))
}

impl ShadowDb {
    /// Opens (creating lazily if absent) the shadow database for `local_root`.
    pub fn open(local_root: &Path) -> Result<Self> {
        Self::open_at(&db_path_for(local_root), local_root)
    }

    /// Opens a shadow database at an explicit path (used by tests so
    /// multiple roots don't collide in a shared temp directory).
    pub fn open_at(db_path: &Path, local_root: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open shadow db {}", db_path.display()))?;
        conn.execute_batch(SCHEMA).context("init shadow db schema")?;
        Ok(Self {
            conn,
            local_root: local_root.to_path_buf(),
        })
    }

    fn key(&self, absolute_path: &Path) -> String {
        normalize(&self.local_root, absolute_path)
    }

    /// Hashes `absolute_path` and upserts its file record with `server_mod_time`.
    pub fn add_file(&mut self, absolute_path: &Path, server_mod_time: Option<DateTime<Utc>>) {
        let key = self.key(absolute_path);
        let sum = match checksum::checksum(absolute_path) {
            Ok(sum) => sum,
            Err(err) => {
                crate::logging::error(format!(
                    "CmisDatabase: checksum failed for {}: {err:?}",
                    absolute_path.display()
                ));
                return;
            }
        };
        let tx = match self.conn.transaction() {
            Ok(tx) => tx,
            Err(err) => {
                crate::logging::error(format!("CmisDatabase: addFile tx open failed: {err:?}"));
                return;
            }
        };
        let result = (|| -> rusqlite::Result<()> {
            tx.execute("DELETE FROM folders WHERE path = ?1", params![key])?;
            tx.execute(
                "INSERT INTO files (path, serverSideModificationDate, checksum)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(path) DO UPDATE SET
                   serverSideModificationDate = excluded.serverSideModificationDate,
                   checksum = excluded.checksum",
                params![key, server_mod_time.map(|t| t.to_rfc3339()), sum],
            )?;
            Ok(())
        })();
        match result.and_then(|_| tx.commit()) {
            Ok(()) => {}
            Err(err) => {
                crate::logging::error(format!("CmisDatabase: addFile failed for {key}: {err:?}"))
            }
        }
    }

    /// Upserts a folder record for `absolute_path` with `server_mod_time`.
    pub fn add_folder(&mut self, absolute_path: &Path, server_mod_time: Option<DateTime<Utc>>) {
        let key = self.key(absolute_path);
        let tx = match self.conn.transaction() {
            Ok(tx) => tx,
            Err(err) => {
                crate::logging::error(format!("CmisDatabase: addFolder tx open failed: {err:?}"));
                return;
            }
        };
        let result = (|| -> rusqlite::Result<()> {
            tx.execute("DELETE FROM files WHERE path = ?1", params![key])?;
            tx.execute(
                "INSERT INTO folders (path, serverSideModificationDate)
                 VALUES (?1, ?2)
                 ON CONFLICT(path) DO UPDATE SET
                   serverSideModificationDate = excluded.serverSideModificationDate",
                params![key, server_mod_time.map(|t| t.to_rfc3339())],
            )?;
            Ok(())
        })();
        match result.and_then(|_| tx.commit()) {
            Ok(()) => {}
            Err(err) => {
                crate::logging::error(format!("CmisDatabase: addFolder failed for {key}: {err:?}"))
            }
        }
    }

    /// Deletes the file record for `absolute_path`; no-op if absent.
    pub fn remove_file(&mut self, absolute_path: &Path) {
        let key = self.key(absolute_path);
        if let Err(err) = self
            .conn
            .execute("DELETE FROM files WHERE path = ?1", params![key])
        {
            crate::logging::error(format!(
                "CmisDatabase: removeFile failed for {key}: {err:?}"
            ));
        }
    }

    /// Deletes the folder record for `absolute_path` and cascades to every
    /// folder/file record whose key begins with `key + "/"` (invariant 5),
    /// all inside one transaction.
    pub fn remove_folder(&mut self, absolute_path: &Path) {
        let key = self.key(absolute_path);
        let prefix = format!("{key}/");
        let like_pattern = format!("{}%", escape_like(&prefix));
        let tx = match self.conn.transaction() {
            Ok(tx) => tx,
            Err(err) => {
                crate::logging::error(format!("CmisDatabase: removeFolder tx open failed: {err:?}"));
                return;
            }
        };
        let result = (|| -> rusqlite::Result<()> {
            tx.execute("DELETE FROM folders WHERE path = ?1", params![key])?;
            tx.execute(
                "DELETE FROM folders WHERE path LIKE ?1 ESCAPE '\\'",
                params![like_pattern],
            )?;
            tx.execute(
                "DELETE FROM files WHERE path LIKE ?1 ESCAPE '\\'",
                params![like_pattern],
            )?;
            Ok(())
        })();
        match result.and_then(|_| tx.commit()) {
            Ok(()) => {}
            Err(err) => crate::logging::error(format!(
                "CmisDatabase: removeFolder failed for {key}: {err:?}"
            )),
        }
    }

    /// Returns the stored remote modification time for a file, or `None`
    /// if never synced or on a storage error (conservative default).
    pub fn get_server_mod_time(&self, absolute_path: &Path) -> Option<DateTime<Utc>> {
        let key = self.key(absolute_path);
        let raw: rusqlite::Result<Option<Option<String>>> = self
            .conn
            .query_row(
                "SELECT serverSideModificationDate FROM files WHERE path = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional();
        match raw {
            Ok(Some(Some(ts))) => DateTime::parse_from_rfc3339(&ts)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            Ok(_) => None,
            Err(err) => {
                crate::logging::error(format!(
                    "CmisDatabase: getServerModTime failed for {key}: {err:?}"
                ));
                None
            }
        }
    }

    /// Updates the stored modification time for an existing file record; no-op if absent.
    pub fn set_file_server_mod_time(&mut self, absolute_path: &Path, server_mod_time: DateTime<Utc>) {
        let key = self.key(absolute_path);
        if let Err(err) = self.conn.execute(
            "UPDATE files SET serverSideModificationDate = ?2 WHERE path = ?1",
            params![key, server_mod_time.to_rfc3339()],
        ) {
            crate::logging::error(format!(
                "CmisDatabase: setFileServerModTime failed for {key}: {err:?}"
            ));
        }
    }

    pub fn contains_file(&self, absolute_path: &Path) -> bool {
        self.exists_in("files", absolute_path)
    }

    pub fn contains_folder(&self, absolute_path: &Path) -> bool {
        self.exists_in("folders", absolute_path)
    }

    fn exists_in(&self, table: &str, absolute_path: &Path) -> bool {
        let key = self.key(absolute_path);
        let sql = format!("SELECT 1 FROM {table} WHERE path = ?1");
        match self
            .conn
            .query_row(&sql, params![key], |_| Ok(()))
            .optional()
        {
            Ok(found) => found.is_some(),
            Err(err) => {
                crate::logging::error(format!(
                    "CmisDatabase: contains({table}) failed for {key}: {err:?}"
                ));
                false
            }
        }
    }

    /// Hashes the current file on disk and compares it against the stored
    /// checksum. Returns `true` (conservative "changed") when the file
    /// can't be hashed, or when no prior record exists at all.
    pub fn local_file_has_changed(&self, absolute_path: &Path) -> bool {
        let key = self.key(absolute_path);
        let stored: rusqlite::Result<Option<String>> = self
            .conn
            .query_row(
                "SELECT checksum FROM files WHERE path = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional();
        let stored = match stored {
            Ok(v) => v,
            Err(err) => {
                crate::logging::error(format!(
                    "CmisDatabase: localFileHasChanged lookup failed for {key}: {err:?}"
                ));
                return false;
            }
        };
        let Some(stored) = stored else {
            return true;
        };
        match checksum::checksum(absolute_path) {
            Ok(current) => current != stored,
            Err(_) => true,
        }
    }
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

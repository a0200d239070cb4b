//! The folder registry: the list of local-directory ↔ remote-folder
//! pairs this machine keeps synced. Spec.md §1 treats the configuration
//! store as an external collaborator; this is the thin on-disk shape
//! the Sync Loop and CLI agree on for it.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// One registered sync pair (spec.md §6's "Configuration consumed from
/// external collaborator").
#[derive(Clone, Deserialize, Serialize)]
pub struct FolderConfig {
    pub canonical_name: String,
    pub local_path: PathBuf,
    pub remote_folder_path: String,
    pub url: String,
    pub user: String,
    pub password: String,
    pub repository_id: String,
    #[serde(default)]
    pub bidirectional: bool,
}

impl std::fmt::Debug for FolderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderConfig")
            .field("canonical_name", &self.canonical_name)
            .field("local_path", &self.local_path)
            .field("remote_folder_path", &self.remote_folder_path)
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &"***")
            .field("repository_id", &self.repository_id)
            .field("bidirectional", &self.bidirectional)
            .finish()
    }
}

impl FolderConfig {
    fn validate(&self) -> Result<()> {
        if self.canonical_name.trim().is_empty() {
            anyhow::bail!("canonical_name must not be empty");
        }
        validate_url(&self.url).context("url")?;
        Ok(())
    }
}

/// The list of registered folders, persisted as a single JSON array.
pub struct FolderRegistry {
    pub folders: Vec<FolderConfig>,
    registry_path: PathBuf,
}

impl FolderRegistry {
    pub fn default_registry_path() -> PathBuf {
        home_dir().join(".cmissync").join("folders.json")
    }

    pub fn default_log_file_path() -> PathBuf {
        home_dir().join(".cmissync").join("logs").join("cmissync.log")
    }

    /// file < env (`CMISSYNC_CONFIG_PATH`) < flag precedence, mirroring
    /// the teacher's `resolve_config_path`.
    pub fn resolve_registry_path(flag_path: Option<&Path>) -> PathBuf {
        if let Some(p) = flag_path {
            return absolutize_path(p);
        }
        if let Ok(env_path) = std::env::var("CMISSYNC_CONFIG_PATH") {
            let env_path = env_path.trim();
            if !env_path.is_empty() {
                return absolutize_path(Path::new(env_path));
            }
        }
        absolutize_path(&Self::default_registry_path())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let folders = if path.exists() {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("read folder registry {}", path.display()))?;
            let folders: Vec<FolderConfig> =
                serde_json::from_str(&data).context("parse folder registry json")?;
            for f in &folders {
                f.validate()
                    .with_context(|| format!("folder {}", f.canonical_name))?;
            }
            folders
        } else {
            Vec::new()
        };
        Ok(Self {
            folders,
            registry_path: absolutize_path(path),
        })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.registry_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let data = serde_json::to_vec_pretty(&self.folders).context("serialize folder registry")?;
        std::fs::write(&self.registry_path, data)
            .with_context(|| format!("write {}", self.registry_path.display()))
    }

    pub fn add(&mut self, folder: FolderConfig) -> Result<()> {
        folder.validate()?;
        if self.find(&folder.canonical_name).is_some() {
            anyhow::bail!("folder {} already registered", folder.canonical_name);
        }
        self.folders.push(folder);
        self.save()
    }

    pub fn remove(&mut self, canonical_name: &str) -> Result<bool> {
        let before = self.folders.len();
        self.folders.retain(|f| f.canonical_name != canonical_name);
        let removed = self.folders.len() != before;
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn find(&self, canonical_name: &str) -> Option<&FolderConfig> {
        self.folders.iter().find(|f| f.canonical_name == canonical_name)
    }
}

pub(crate) fn validate_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("url must be http or https");
    }
    Ok(())
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

pub(crate) fn absolutize_path(path: &Path) -> PathBuf {
    let expanded = expand_tilde(path);
    let abs = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(expanded)
    };
    let cleaned = clean_lexical(&abs);
    std::fs::canonicalize(&cleaned).unwrap_or(cleaned)
}

fn expand_tilde(path: &Path) -> PathBuf {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(c)) if c == OsStr::new("~") => {
            let mut out = home_dir();
            for c in components {
                out.push(c.as_os_str());
            }
            out
        }
        _ => path.to_path_buf(),
    }
}

fn clean_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(&std::path::MAIN_SEPARATOR.to_string())),
            Component::CurDir => {}
            Component::ParentDir => {
                if !pop_normal_component(&mut out) && !out.as_os_str().is_empty() {
                    out.push("..");
                }
            }
            Component::Normal(p) => out.push(p),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

fn pop_normal_component(path: &mut PathBuf) -> bool {
    let mut comps = path.components().collect::<Vec<_>>();
    match comps.pop() {
        Some(Component::Normal(_)) => {
            *path = rebuild_components(&comps);
            true
        }
        Some(Component::Prefix(_)) | Some(Component::RootDir) | None => false,
        Some(Component::CurDir) => {
            *path = rebuild_components(&comps);
            false
        }
        Some(Component::ParentDir) => {
            *path = rebuild_components(&comps);
            false
        }
    }
}

fn rebuild_components(components: &[Component<'_>]) -> PathBuf {
    let mut out = PathBuf::new();
    for c in components {
        match c {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(&std::path::MAIN_SEPARATOR.to_string())),
            Component::CurDir => {}
            Component::ParentDir => out.push(".."),
            Component::Normal(p) => out.push(p),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Mutex, MutexGuard, OnceLock};
    use std::{env, fs};

    fn env_lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sample_folder(name: &str, tmp: &Path) -> FolderConfig {
        FolderConfig {
            canonical_name: name.to_string(),
            local_path: tmp.join(name),
            remote_folder_path: format!("/root/{name}"),
            url: "https://cmis.example.com/atom".to_string(),
            user: "alice".to_string(),
            password: "hunter2".to_string(),
            repository_id: "repo1".to_string(),
            bidirectional: false,
        }
    }

    #[test]
    fn debug_redacts_password() {
        let tmp = env::temp_dir();
        let folder = sample_folder("A", &tmp);
        let debug = format!("{folder:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn load_returns_empty_when_file_absent() {
        let tmp = env::temp_dir().join("cmissync-rs-config-test-absent");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let registry = FolderRegistry::load(&tmp.join("folders.json")).unwrap();
        assert!(registry.folders.is_empty());
    }

    #[test]
    fn add_save_and_reload_round_trips() {
        let tmp = env::temp_dir().join("cmissync-rs-config-test-roundtrip");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let path = tmp.join("folders.json");

        let mut registry = FolderRegistry::load(&path).unwrap();
        registry.add(sample_folder("A", &tmp)).unwrap();

        let reloaded = FolderRegistry::load(&path).unwrap();
        assert_eq!(reloaded.folders.len(), 1);
        assert_eq!(reloaded.folders[0].canonical_name, "A");
    }

    #[test]
    fn add_rejects_duplicate_canonical_name() {
        let tmp = env::temp_dir().join("cmissync-rs-config-test-dup");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let mut registry = FolderRegistry::load(&tmp.join("folders.json")).unwrap();
        registry.add(sample_folder("A", &tmp)).unwrap();
        assert!(registry.add(sample_folder("A", &tmp)).is_err());
    }

    #[test]
    fn remove_deletes_matching_entry_and_persists() {
        let tmp = env::temp_dir().join("cmissync-rs-config-test-remove");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let path = tmp.join("folders.json");
        let mut registry = FolderRegistry::load(&path).unwrap();
        registry.add(sample_folder("A", &tmp)).unwrap();

        assert!(registry.remove("A").unwrap());
        assert!(registry.find("A").is_none());

        let reloaded = FolderRegistry::load(&path).unwrap();
        assert!(reloaded.folders.is_empty());
    }

    #[test]
    fn rejects_non_http_url() {
        let tmp = env::temp_dir();
        let mut folder = sample_folder("A", &tmp);
        folder.url = "ftp://cmis.example.com".to_string();
        assert!(folder.validate().is_err());
    }

    #[test]
    fn resolve_registry_path_flag_beats_env() {
        let _lock = env_lock();
        let _guard = EnvGuard::new(&["CMISSYNC_CONFIG_PATH"]);
        let tmp = env::temp_dir().join("cmissync-rs-config-path-flag");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let env_path = tmp.join("env").join("folders.json");
        let flag_path = tmp.join("flag").join("folders.json");
        env::set_var("CMISSYNC_CONFIG_PATH", &env_path);

        let resolved = FolderRegistry::resolve_registry_path(Some(&flag_path));
        assert_eq!(resolved, flag_path);
    }

    #[test]
    fn resolve_registry_path_uses_env_when_no_flag() {
        let _lock = env_lock();
        let _guard = EnvGuard::new(&["CMISSYNC_CONFIG_PATH"]);
        let tmp = env::temp_dir().join("cmissync-rs-config-path-env");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let env_path = tmp.join("env").join("folders.json");
        env::set_var("CMISSYNC_CONFIG_PATH", &env_path);

        let resolved = FolderRegistry::resolve_registry_path(None);
        assert_eq!(resolved, env_path);
    }

    #[test]
    fn resolve_registry_path_falls_back_to_default_when_unset() {
        let _lock = env_lock();
        let _guard = EnvGuard::new(&["CMISSYNC_CONFIG_PATH"]);
        env::remove_var("CMISSYNC_CONFIG_PATH");

        let resolved = FolderRegistry::resolve_registry_path(None);
        assert_eq!(resolved, absolutize_path(&FolderRegistry::default_registry_path()));
    }

    struct EnvGuard {
        saved: HashMap<String, Option<String>>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let mut saved = HashMap::new();
            for k in keys {
                saved.insert((*k).to_string(), env::var(k).ok());
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, v) in self.saved.drain() {
                match v {
                    Some(val) => env::set_var(k, val),
                    None => env::remove_var(k),
                }
            }
        }
    }
}

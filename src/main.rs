use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use cmissync_rs::config::{FolderConfig, FolderRegistry};
use cmissync_rs::control::ControlSurface;
use cmissync_rs::remote::{AtomPubRemoteClient, AtomPubSession, RemoteClient};
use cmissync_rs::shadow_db::ShadowDb;
use cmissync_rs::sync_loop::{LoggingActivityListener, SyncLoop};
use cmissync_rs::telemetry::SyncStats;

#[derive(Parser, Debug)]
#[command(name = "cmissync", version)]
struct Cli {
    /// Path to the folder registry file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reconciliation pass and exit
    Sync {
        /// Canonical name of a single folder (all registered folders if omitted)
        folder: Option<String>,
    },

    /// Run the background daemon: one sync loop per registered folder plus the control surface
    Daemon {
        #[arg(short = 'a', long = "http-addr", default_value = "127.0.0.1:7938")]
        http_addr: String,

        /// Seconds between automatic re-sync passes, 0 disables the timer
        #[arg(long = "interval", default_value_t = 30)]
        interval_secs: u64,
    },

    /// Print the resolved folder registry path
    ConfigPath,

    /// Register a new local/remote folder pair
    AddFolder {
        canonical_name: String,
        local_path: PathBuf,
        remote_folder_path: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        repository_id: String,
        #[arg(long, default_value_t = false)]
        bidirectional: bool,
    },

    /// Unregister a folder pair by canonical name
    RemoveFolder { canonical_name: String },

    /// List registered folder pairs
    ListFolders,

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let registry_path = FolderRegistry::resolve_registry_path(cli.config.as_deref());

    match cli.command {
        Commands::ConfigPath => {
            println!("{}", registry_path.display());
            Ok(())
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::AddFolder {
            canonical_name,
            local_path,
            remote_folder_path,
            url,
            user,
            password,
            repository_id,
            bidirectional,
        } => {
            let mut registry = FolderRegistry::load(&registry_path)?;
            registry.add(FolderConfig {
                canonical_name,
                local_path,
                remote_folder_path,
                url,
                user,
                password,
                repository_id,
                bidirectional,
            })?;
            Ok(())
        }
        Commands::RemoveFolder { canonical_name } => {
            let mut registry = FolderRegistry::load(&registry_path)?;
            if !registry.remove(&canonical_name)? {
                anyhow::bail!("no folder registered with canonical name {canonical_name}");
            }
            Ok(())
        }
        Commands::ListFolders => {
            let registry = FolderRegistry::load(&registry_path)?;
            for f in &registry.folders {
                println!(
                    "{}\t{}\t{}\t{}",
                    f.canonical_name,
                    f.local_path.display(),
                    f.remote_folder_path,
                    f.url
                );
            }
            Ok(())
        }
        Commands::Sync { folder } => run_sync_once(&registry_path, folder.as_deref()).await,
        Commands::Daemon {
            http_addr,
            interval_secs,
        } => run_daemon(&registry_path, &http_addr, interval_secs).await,
    }
}

fn build_remote_client(folder: &FolderConfig) -> Result<Arc<dyn RemoteClient>> {
    let session = AtomPubSession {
        atom_pub_url: folder.url.clone(),
        user: folder.user.clone(),
        password: folder.password.clone(),
        repository_id: folder.repository_id.clone(),
    };
    Ok(Arc::new(AtomPubRemoteClient::new(session)?))
}

async fn run_sync_once(registry_path: &std::path::Path, folder: Option<&str>) -> Result<()> {
    cmissync_rs::logging::init_default_log_file()?;
    let registry = FolderRegistry::load(registry_path)?;
    let targets: Vec<&FolderConfig> = match folder {
        Some(name) => {
            let f = registry
                .find(name)
                .with_context(|| format!("no folder registered with canonical name {name}"))?;
            vec![f]
        }
        None => registry.folders.iter().collect(),
    };
    if targets.is_empty() {
        anyhow::bail!("no folders registered; use add-folder first");
    }

    for f in targets {
        let remote = build_remote_client(f)?;
        remote
            .connect()
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
            .with_context(|| format!("connect to {}", f.canonical_name))?;
        let db = ShadowDb::open(&f.local_path)?;
        let sync_loop = Arc::new(SyncLoop::new(
            f.clone(),
            remote,
            db,
            Arc::new(LoggingActivityListener),
        ));
        sync_loop.trigger();
        let handle = tokio::spawn(sync_loop.clone().run());
        // A single pass is request-response: give it room to run, then
        // tear the loop down since there is no daemon keeping it alive.
        tokio::time::sleep(Duration::from_millis(50)).await;
        while sync_loop.is_syncing() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        handle.abort();
    }
    Ok(())
}

async fn run_daemon(registry_path: &std::path::Path, http_addr: &str, interval_secs: u64) -> Result<()> {
    let log_path = cmissync_rs::logging::init_default_log_file()?;
    cmissync_rs::logging::info(format!(
        "daemon start version={} config={} log={}",
        env!("CARGO_PKG_VERSION"),
        registry_path.display(),
        log_path.display()
    ));

    let registry = FolderRegistry::load(registry_path)?;
    if registry.folders.is_empty() {
        anyhow::bail!("no folders registered; use add-folder first");
    }

    let stats = Arc::new(SyncStats::default());
    let (listener, events_tx) = ControlSurface::new_listener(stats.clone());

    let mut loops = HashMap::new();
    for f in &registry.folders {
        let remote = build_remote_client(f)?;
        let db = ShadowDb::open(&f.local_path)?;
        let sync_loop = Arc::new(SyncLoop::new(f.clone(), remote, db, listener.clone()));
        loops.insert(f.canonical_name.clone(), sync_loop);
    }

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let control = ControlSurface::start(http_addr, loops.clone(), stats, events_tx, shutdown.clone()).await?;
    cmissync_rs::logging::info(format!("control surface bound to {}", control.bound_addr()));

    let mut handles = Vec::new();
    for sync_loop in loops.values() {
        sync_loop.trigger();
        handles.push(tokio::spawn(sync_loop.clone().run()));
    }

    if interval_secs > 0 {
        let loops = loops.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                for sync_loop in loops.values() {
                    sync_loop.trigger();
                }
            }
        });
    }

    tokio::signal::ctrl_c().await.ok();
    shutdown.notify_waiters();
    for sync_loop in loops.values() {
        sync_loop.cancel_current();
    }
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_sync_with_optional_folder() {
        let cli = Cli::try_parse_from(["cmissync", "sync"]).unwrap();
        match cli.command {
            Commands::Sync { folder } => assert!(folder.is_none()),
            _ => panic!("expected sync"),
        }

        let cli = Cli::try_parse_from(["cmissync", "sync", "work"]).unwrap();
        match cli.command {
            Commands::Sync { folder } => assert_eq!(folder.as_deref(), Some("work")),
            _ => panic!("expected sync"),
        }
    }

    #[test]
    fn cli_parses_add_folder_flags() {
        let cli = Cli::try_parse_from([
            "cmissync",
            "add-folder",
            "work",
            "/home/alice/work",
            "/sites/work",
            "--url",
            "https://cmis.example.com/atom",
            "--user",
            "alice",
            "--password",
            "secret",
            "--repository-id",
            "repo1",
        ])
        .unwrap();
        match cli.command {
            Commands::AddFolder {
                canonical_name,
                remote_folder_path,
                ..
            } => {
                assert_eq!(canonical_name, "work");
                assert_eq!(remote_folder_path, "/sites/work");
            }
            _ => panic!("expected add-folder"),
        }
    }

    #[test]
    fn cli_parses_daemon_defaults() {
        let cli = Cli::try_parse_from(["cmissync", "daemon"]).unwrap();
        match cli.command {
            Commands::Daemon {
                http_addr,
                interval_secs,
            } => {
                assert_eq!(http_addr, "127.0.0.1:7938");
                assert_eq!(interval_secs, 30);
            }
            _ => panic!("expected daemon"),
        }
    }
}

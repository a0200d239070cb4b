//! Conflict preservation: when both the local file and the remote
//! document changed since the last recorded sync, the engine never
//! picks a winner by discarding bytes. The locally modified copy is
//! renamed aside and the remote version takes the original name.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Smallest positive integer making `path (N)` free, or `path` itself if
/// nothing occupies it yet (spec.md §4.7).
pub fn suffix_if_absent(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let mut n = 1u32;
    loop {
        let candidate = with_ordinal_suffix(path, n);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn with_ordinal_suffix(path: &Path, n: u32) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push_str(&format!(" ({n})"));
    path.with_file_name(name)
}

/// `<original-basename>_your-version`, the first candidate tried before
/// `suffix_if_absent` starts appending ` (N)`.
fn your_version_candidate(original: &Path) -> PathBuf {
    let mut name = original
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push_str("_your-version");
    original.with_file_name(name)
}

/// Renames `original` aside to make room for the incoming remote
/// download, returning the path it was moved to. The original content is
/// never deleted, only relocated (spec.md §7: "the engine never loses
/// user data").
pub fn park_conflicting_file(original: &Path) -> Result<PathBuf> {
    let target = suffix_if_absent(&your_version_candidate(original));
    std::fs::rename(original, &target).with_context(|| {
        format!(
            "park conflicting file {} as {}",
            original.display(),
            target.display()
        )
    })?;
    Ok(target)
}

/// The UI's decoupling seam (spec.md §9): the core never owns a dialog,
/// it only reports what happened.
pub trait ConflictHandler: Send + Sync {
    fn on_conflict(&self, local_path: &Path, saved_as_path: &Path);
}

/// A `ConflictHandler` that only writes to the process log, used when no
/// UI is attached (headless `daemon`/`sync` CLI invocations).
pub struct LoggingConflictHandler;

impl ConflictHandler for LoggingConflictHandler {
    fn on_conflict(&self, local_path: &Path, saved_as_path: &Path) {
        crate::logging::info(format!(
            "Sync: conflict on {}, your changes were saved as {}",
            local_path.display(),
            saved_as_path.display()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir(name: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        root.push(format!(
            "cmissync-rs-conflict-test-{name}-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn suffix_if_absent_returns_path_unchanged_when_free() {
        let dir = temp_dir("free");
        let path = dir.join("x.txt");
        assert_eq!(suffix_if_absent(&path), path);
    }

    #[test]
    fn suffix_if_absent_picks_smallest_free_ordinal() {
        let dir = temp_dir("ordinal");
        let base = dir.join("x.txt_your-version");
        fs::write(&base, b"a").unwrap();
        fs::write(dir.join("x.txt_your-version (1)"), b"b").unwrap();
        let got = suffix_if_absent(&base);
        assert_eq!(got, dir.join("x.txt_your-version (2)"));
    }

    #[test]
    fn park_conflicting_file_renames_and_preserves_bytes() {
        let dir = temp_dir("park");
        let original = dir.join("report.txt");
        fs::write(&original, b"local edits").unwrap();

        let saved = park_conflicting_file(&original).unwrap();

        assert_eq!(saved, dir.join("report.txt_your-version"));
        assert!(!original.exists());
        assert_eq!(fs::read(&saved).unwrap(), b"local edits");
    }

    #[test]
    fn park_conflicting_file_rotates_on_repeated_conflicts() {
        let dir = temp_dir("park-rotate");
        let original = dir.join("report.txt");
        fs::write(&original, b"first conflict").unwrap();
        let first_saved = park_conflicting_file(&original).unwrap();
        assert_eq!(first_saved, dir.join("report.txt_your-version"));

        // a new local copy is created (simulating a fresh download), then
        // modified and conflicts again
        fs::write(&original, b"second conflict").unwrap();
        let second_saved = park_conflicting_file(&original).unwrap();
        assert_eq!(second_saved, dir.join("report.txt_your-version (1)"));
        assert_eq!(fs::read(&first_saved).unwrap(), b"first conflict");
        assert_eq!(fs::read(&second_saved).unwrap(), b"second conflict");
    }
}

use std::path::{Path, PathBuf};

/// Rewrites an absolute local path into the forward-slash, root-relative
/// key the shadow database and the reconciler use everywhere.
///
/// `local_root` is the synced folder's local root (e.g. `/home/alice/CmisSync/Shared`).
/// `absolute_path` must start with `local_root`; anything else is a
/// programmer error, not a recoverable one (callers always pass absolute
/// local paths derived from the same root).
pub fn normalize(local_root: &Path, absolute_path: &Path) -> String {
    let suffix = absolute_path
        .strip_prefix(local_root)
        .unwrap_or_else(|_| {
            panic!(
                "path {} is not under local root {}",
                absolute_path.display(),
                local_root.display()
            )
        });

    let mut out = String::new();
    for component in suffix.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}

/// Inverse of `normalize`: rebuilds an absolute local path from a root and
/// a normalized key. Normalized keys only ever use `/`, so this never
/// needs to special-case the host separator on the way in.
pub fn denormalize(local_root: &Path, normalized_path: &str) -> PathBuf {
    let mut out = local_root.to_path_buf();
    for part in normalized_path.split('/') {
        if !part.is_empty() {
            out.push(part);
        }
    }
    out
}

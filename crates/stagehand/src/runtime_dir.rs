//! Per-identity runtime directories.
//!
//! Communication endpoints live in a scratch directory that only its owner can
//! enter. Leftovers from an unclean previous run are removed here, before any
//! new process is spawned.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt, chown};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::endpoint::EndpointPattern;
use crate::error::{SupervisorError, SupervisorResult};
use crate::identity::Identity;

/// Mode of a runtime directory: owner only.
pub const RUNTIME_DIR_MODE: u32 = 0o700;

/// Expand a runtime directory pattern for an identity.
///
/// Supports `{uid}` and `{user}` placeholders, `~` and environment variables.
pub fn runtime_dir_path(pattern: &str, identity: &Identity) -> PathBuf {
    let expanded = shellexpand::full(pattern)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| pattern.to_string());
    PathBuf::from(
        expanded
            .replace("{uid}", &identity.uid.to_string())
            .replace("{user}", &identity.name),
    )
}

/// Ensure `path` exists, is owned by `identity`, and has mode 0700.
///
/// Idempotent; called on every session start.
pub fn ensure_runtime_dir(path: &Path, identity: &Identity) -> SupervisorResult<()> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if !meta.is_dir() {
            return Err(SupervisorError::setup(path, "exists and is not a directory"));
        }
    } else {
        info!("Creating runtime directory {}", path.display());
        fs::create_dir_all(path).map_err(|e| SupervisorError::setup(path, format!("creating: {e}")))?;
    }

    let meta = fs::metadata(path).map_err(|e| SupervisorError::setup(path, format!("stat: {e}")))?;
    if meta.uid() != identity.uid || meta.gid() != identity.gid {
        debug!(
            "Changing owner of {} to {}:{}",
            path.display(),
            identity.uid,
            identity.gid
        );
        chown(path, Some(identity.uid), Some(identity.gid))
            .map_err(|e| SupervisorError::setup(path, format!("chown to {identity}: {e}")))?;
    }

    if meta.permissions().mode() & 0o7777 != RUNTIME_DIR_MODE {
        fs::set_permissions(path, fs::Permissions::from_mode(RUNTIME_DIR_MODE))
            .map_err(|e| SupervisorError::setup(path, format!("chmod 0700: {e}")))?;
    }

    debug!("Runtime directory {} ready for {}", path.display(), identity);
    Ok(())
}

/// Remove stale endpoints and their lock files left by a previous compositor.
pub fn purge_stale_endpoints(dir: &Path, pattern: &EndpointPattern) -> SupervisorResult<Vec<PathBuf>> {
    purge(dir, |name, meta| {
        !meta.is_dir() && (pattern.matches(name) || pattern.is_lock(name))
    })
}

/// Remove bridge links left by a previous session.
pub fn purge_stale_links(dir: &Path, pattern: &EndpointPattern) -> SupervisorResult<Vec<PathBuf>> {
    purge(dir, |name, meta| meta.file_type().is_symlink() && pattern.matches(name))
}

fn purge<F>(dir: &Path, mut stale: F) -> SupervisorResult<Vec<PathBuf>>
where
    F: FnMut(&str, &fs::Metadata) -> bool,
{
    let entries = fs::read_dir(dir).map_err(|e| SupervisorError::setup(dir, format!("reading: {e}")))?;

    let mut removed = Vec::new();
    for entry in entries.filter_map(Result::ok) {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let path = entry.path();
        let Ok(meta) = fs::symlink_metadata(&path) else {
            continue;
        };
        if !stale(&name, &meta) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Removed stale {}", path.display());
                removed.push(path);
            }
            Err(e) => {
                return Err(SupervisorError::setup(&path, format!("removing stale entry: {e}")));
            }
        }
    }

    if removed.is_empty() {
        debug!("No stale entries in {}", dir.display());
    } else {
        warn!("Cleaned up {} stale entries in {}", removed.len(), dir.display());
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn me() -> Identity {
        Identity::current().unwrap()
    }

    #[test]
    fn test_runtime_dir_path_placeholders() {
        let identity = Identity {
            name: "kiosk".into(),
            uid: 990,
            gid: 990,
            home: "/".into(),
        };
        assert_eq!(
            runtime_dir_path("/run/user/{uid}", &identity),
            PathBuf::from("/run/user/990")
        );
        assert_eq!(
            runtime_dir_path("/tmp/{user}-runtime", &identity),
            PathBuf::from("/tmp/kiosk-runtime")
        );
    }

    #[test]
    fn test_ensure_runtime_dir_creates_with_mode() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("run").join("1000");

        ensure_runtime_dir(&dir, &me()).unwrap();
        let meta = fs::metadata(&dir).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o7777, 0o700);
        assert_eq!(meta.uid(), me().uid);
    }

    #[test]
    fn test_ensure_runtime_dir_is_idempotent_and_tightens_mode() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("rt");
        fs::create_dir(&dir).unwrap();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(dir.join("keep"), "x").unwrap();

        ensure_runtime_dir(&dir, &me()).unwrap();
        ensure_runtime_dir(&dir, &me()).unwrap();

        let meta = fs::metadata(&dir).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o700);
        assert!(dir.join("keep").exists());
    }

    #[test]
    fn test_ensure_runtime_dir_rejects_file() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("not-a-dir");
        fs::write(&path, "").unwrap();
        assert!(matches!(
            ensure_runtime_dir(&path, &me()),
            Err(SupervisorError::Setup { .. })
        ));
    }

    #[test]
    fn test_purge_stale_endpoints() {
        let dir = TempDir::new().unwrap();
        let pattern = EndpointPattern::new("wayland-");
        fs::write(dir.path().join("wayland-1"), "").unwrap();
        fs::write(dir.path().join("wayland-1.lock"), "").unwrap();
        fs::write(dir.path().join("pulse-native"), "").unwrap();
        fs::create_dir(dir.path().join("wayland-cache")).unwrap();

        let removed = purge_stale_endpoints(dir.path(), &pattern).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!dir.path().join("wayland-1").exists());
        assert!(!dir.path().join("wayland-1.lock").exists());
        assert!(dir.path().join("pulse-native").exists());
        assert!(dir.path().join("wayland-cache").is_dir());
    }

    #[test]
    fn test_purge_stale_links_keeps_regular_files() {
        let dir = TempDir::new().unwrap();
        let pattern = EndpointPattern::new("wayland-");
        symlink("/nonexistent/wayland-3", dir.path().join("wayland-3")).unwrap();
        fs::write(dir.path().join("wayland-9"), "").unwrap();

        let removed = purge_stale_links(dir.path(), &pattern).unwrap();
        assert_eq!(removed, vec![dir.path().join("wayland-3")]);
        assert!(fs::symlink_metadata(dir.path().join("wayland-3")).is_err());
        assert!(dir.path().join("wayland-9").exists());
    }
}

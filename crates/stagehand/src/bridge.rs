//! Privilege bridge.
//!
//! The one place where the trust boundary is crossed on purpose: the service
//! user's endpoint is linked into the supervisor's runtime directory and the
//! endpoint file itself is made connectable by other identities. The service
//! runtime directory stays 0700; only the leaf is widened.

use std::fs;
use std::io;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::endpoint::Endpoint;
use crate::error::{SupervisorError, SupervisorResult};
use crate::poll::sleep_or_cancel;
use crate::session::SessionState;

/// Mode applied to the bridged endpoint file.
pub const BRIDGED_ENDPOINT_MODE: u32 = 0o777;

/// Result of a successful bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgedEndpoint {
    pub source: PathBuf,
    pub link: PathBuf,
    /// Permission bits of the source after widening.
    pub mode: u32,
}

/// Bridge `endpoint` into `supervisor_dir`, retrying once after `retry_delay`.
///
/// A shutdown request during the retry delay returns `Interrupted`.
pub async fn bridge_endpoint(
    endpoint: &Endpoint,
    supervisor_dir: &Path,
    retry_delay: Duration,
    cancel: &CancellationToken,
) -> SupervisorResult<BridgedEndpoint> {
    match bridge_once(endpoint, supervisor_dir) {
        Ok(bridged) => Ok(bridged),
        Err(e) => {
            warn!(
                "Bridging {} failed ({}), retrying once in {:?}",
                endpoint.path.display(),
                e,
                retry_delay
            );
            if !sleep_or_cancel(retry_delay, cancel).await {
                return Err(SupervisorError::Interrupted(SessionState::WaitingForEndpoint));
            }
            bridge_once(endpoint, supervisor_dir)
                .map_err(|e| SupervisorError::bridge(&endpoint.path, e))
        }
    }
}

fn bridge_once(endpoint: &Endpoint, supervisor_dir: &Path) -> io::Result<BridgedEndpoint> {
    let source = &endpoint.path;
    fs::symlink_metadata(source)
        .map_err(|e| io::Error::new(e.kind(), format!("endpoint missing: {e}")))?;

    fs::create_dir_all(supervisor_dir)?;
    let link = supervisor_dir.join(&endpoint.name);

    if link != *source {
        match fs::symlink_metadata(&link) {
            Ok(meta) if meta.is_dir() => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} is a directory", link.display()),
                ));
            }
            Ok(_) => fs::remove_file(&link)?,
            Err(_) => {}
        }
        symlink(source, &link)?;
    }

    fs::set_permissions(source, fs::Permissions::from_mode(BRIDGED_ENDPOINT_MODE))?;
    let mode = fs::metadata(source)?.permissions().mode() & 0o7777;

    info!(
        "Bridged endpoint: source={} link={} mode={:04o} owner={}",
        source.display(),
        link.display(),
        mode,
        endpoint.owner
    );

    Ok(BridgedEndpoint {
        source: source.clone(),
        link,
        mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::os::unix::fs::MetadataExt;
    use std::os::unix::net::{UnixListener, UnixStream};
    use tempfile::TempDir;

    fn never() -> CancellationToken {
        CancellationToken::new()
    }

    fn endpoint_in(dir: &Path, name: &str) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            path: dir.join(name),
            owner: "tester".to_string(),
            discovered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_bridge_links_same_inode_and_widens_mode() {
        let service = TempDir::new().unwrap();
        let supervisor = TempDir::new().unwrap();
        let endpoint = endpoint_in(service.path(), "wayland-1");
        let _listener = UnixListener::bind(&endpoint.path).unwrap();

        let bridged = bridge_endpoint(&endpoint, supervisor.path(), Duration::from_millis(10), &never())
            .await
            .unwrap();

        assert_eq!(bridged.link, supervisor.path().join("wayland-1"));
        assert_eq!(bridged.mode, 0o777);
        let via_link = fs::metadata(&bridged.link).unwrap();
        let original = fs::metadata(&endpoint.path).unwrap();
        assert_eq!(via_link.ino(), original.ino());
        assert_eq!(via_link.dev(), original.dev());
        assert_eq!(original.mode() & 0o777, 0o777);

        UnixStream::connect(&bridged.link).unwrap();
    }

    #[tokio::test]
    async fn test_bridge_replaces_stale_link() {
        let service = TempDir::new().unwrap();
        let supervisor = TempDir::new().unwrap();
        symlink("/nonexistent/wayland-1", supervisor.path().join("wayland-1")).unwrap();
        let endpoint = endpoint_in(service.path(), "wayland-1");
        fs::write(&endpoint.path, "").unwrap();

        let bridged = bridge_endpoint(&endpoint, supervisor.path(), Duration::from_millis(10), &never())
            .await
            .unwrap();
        assert_eq!(fs::read_link(&bridged.link).unwrap(), endpoint.path);
    }

    #[tokio::test]
    async fn test_bridge_retries_once_then_fails() {
        let service = TempDir::new().unwrap();
        let supervisor = TempDir::new().unwrap();
        let endpoint = endpoint_in(service.path(), "wayland-1");

        let result = bridge_endpoint(&endpoint, supervisor.path(), Duration::from_millis(10), &never()).await;
        assert!(matches!(result, Err(SupervisorError::Bridge { .. })));
        assert!(fs::symlink_metadata(supervisor.path().join("wayland-1")).is_err());
    }

    #[tokio::test]
    async fn test_bridge_retry_absorbs_late_endpoint() {
        let service = TempDir::new().unwrap();
        let supervisor = TempDir::new().unwrap();
        let endpoint = endpoint_in(service.path(), "wayland-1");

        let path = endpoint.path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            fs::write(path, "").unwrap();
        });

        let result = bridge_endpoint(&endpoint, supervisor.path(), Duration::from_millis(300), &never()).await;
        writer.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bridge_same_directory_only_widens() {
        let shared = TempDir::new().unwrap();
        let endpoint = endpoint_in(shared.path(), "wayland-1");
        fs::write(&endpoint.path, "").unwrap();

        let bridged = bridge_endpoint(&endpoint, shared.path(), Duration::from_millis(10), &never())
            .await
            .unwrap();
        assert_eq!(bridged.link, endpoint.path);
        assert!(fs::symlink_metadata(&endpoint.path).unwrap().is_file());
        assert_eq!(bridged.mode, 0o777);
    }

    #[tokio::test]
    async fn test_bridge_retry_delay_is_cancellable() {
        let service = TempDir::new().unwrap();
        let supervisor = TempDir::new().unwrap();
        let endpoint = endpoint_in(service.path(), "wayland-1");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = std::time::Instant::now();
        let result = bridge_endpoint(&endpoint, supervisor.path(), Duration::from_secs(30), &cancel).await;
        assert!(matches!(
            result,
            Err(SupervisorError::Interrupted(SessionState::WaitingForEndpoint))
        ));
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::network::{Connectivity, ConnectivitySource};
use crate::utils::lock_mutex;

const SYSFS_NET: &str = "/sys/class/net";

/// Interfaces that never carry traffic off the host.
const VIRTUAL_PREFIXES: [&str; 5] = ["lo", "docker", "veth", "br-", "virbr"];

/// Polls `/sys/class/net/*/operstate`. WWAN interfaces (`ww*`) count as
/// metered, every other interface that is up as unmetered.
pub struct SysfsConnectivity {
    root: PathBuf,
    poll_interval: Duration,
    cancel_token: Arc<Mutex<Option<CancellationToken>>>,
}

impl SysfsConnectivity {
    pub fn new(poll_interval: Duration) -> Self {
        Self::with_root(SYSFS_NET, poll_interval)
    }

    pub fn with_root(root: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            root: root.into(),
            poll_interval,
            cancel_token: Arc::new(Mutex::new(None)),
        }
    }
}

/// Reads the connectivity described by a sysfs net directory.
pub fn scan(root: &Path) -> Connectivity {
    let mut connectivity = Connectivity::OFFLINE;
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = %root.display(), error = %e, "Cannot read network interfaces");
            return connectivity;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p)) {
            continue;
        }
        let state = std::fs::read_to_string(entry.path().join("operstate")).unwrap_or_default();
        if state.trim() != "up" {
            continue;
        }
        if name.starts_with("ww") {
            connectivity.metered = true;
        } else {
            connectivity.unmetered = true;
        }
    }
    connectivity
}

impl ConnectivitySource for SysfsConnectivity {
    fn start(&self, tx: mpsc::Sender<Connectivity>) {
        let token = CancellationToken::new();
        {
            let mut guard = lock_mutex(&self.cancel_token);
            if guard.is_some() {
                warn!("Sysfs connectivity source already started");
                return;
            }
            *guard = Some(token.clone());
        }

        let root = self.root.clone();
        let poll_interval = self.poll_interval;
        info!(path = %root.display(), interval_ms = poll_interval.as_millis() as u64, "Polling network interfaces");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            let mut last: Option<Connectivity> = None;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let scan_root = root.clone();
                let connectivity = match tokio::task::spawn_blocking(move || scan(&scan_root)).await {
                    Ok(connectivity) => connectivity,
                    Err(e) => {
                        warn!(error = %e, "Interface scan panicked");
                        continue;
                    }
                };
                if last == Some(connectivity) {
                    continue;
                }
                last = Some(connectivity);
                if tx.send(connectivity).await.is_err() {
                    break;
                }
            }
            debug!("Sysfs connectivity polling stopped");
        });
    }

    fn stop(&self) {
        if let Some(token) = lock_mutex(&self.cancel_token).take() {
            token.cancel();
        }
    }

    fn current(&self) -> Connectivity {
        scan(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(root: &Path, name: &str, state: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("operstate"), format!("{state}\n")).unwrap();
    }

    #[test]
    fn classifies_interfaces() {
        let dir = tempfile::tempdir().unwrap();
        iface(dir.path(), "lo", "unknown");
        iface(dir.path(), "wwan0", "up");
        assert_eq!(scan(dir.path()), Connectivity::metered());

        iface(dir.path(), "wlan0", "up");
        let both = scan(dir.path());
        assert!(both.metered && both.unmetered);

        iface(dir.path(), "wwan0", "down");
        assert_eq!(scan(dir.path()), Connectivity::unmetered());
    }

    #[test]
    fn missing_root_is_offline() {
        assert_eq!(scan(Path::new("/nonexistent/net")), Connectivity::OFFLINE);
    }

    #[tokio::test]
    async fn polling_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        iface(dir.path(), "eth0", "down");
        let source = SysfsConnectivity::with_root(dir.path(), Duration::from_millis(10));
        let (tx, mut rx) = mpsc::channel(8);
        source.start(tx);

        assert_eq!(rx.recv().await, Some(Connectivity::OFFLINE));
        iface(dir.path(), "eth0", "up");
        assert_eq!(rx.recv().await, Some(Connectivity::unmetered()));
        source.stop();
    }
}

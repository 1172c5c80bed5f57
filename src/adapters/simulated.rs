use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::network::{Connectivity, ConnectivitySource};
use crate::utils::{lock_mutex, read_lock, write_lock};

/// Drives a [`SimulatedConnectivity`] from tests or the simulation console.
#[derive(Clone)]
pub struct ConnectivityController {
    current: Arc<RwLock<Connectivity>>,
    tx: mpsc::UnboundedSender<Connectivity>,
}

impl ConnectivityController {
    pub fn set(&self, connectivity: Connectivity) {
        *write_lock(&self.current) = connectivity;
        let _ = self.tx.send(connectivity);
    }

    pub fn connect_unmetered(&self) {
        self.set(Connectivity::unmetered());
    }

    pub fn connect_metered(&self) {
        self.set(Connectivity::metered());
    }

    pub fn disconnect(&self) {
        self.set(Connectivity::OFFLINE);
    }
}

pub struct SimulatedConnectivity {
    current: Arc<RwLock<Connectivity>>,
    // Taken by the first `start`.
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<Connectivity>>>,
    stop: CancellationToken,
}

impl SimulatedConnectivity {
    pub fn new(initial: Connectivity) -> (Self, ConnectivityController) {
        let (tx, rx) = mpsc::unbounded_channel();
        let current = Arc::new(RwLock::new(initial));
        (
            Self {
                current: Arc::clone(&current),
                cmd_rx: Mutex::new(Some(rx)),
                stop: CancellationToken::new(),
            },
            ConnectivityController { current, tx },
        )
    }
}

impl ConnectivitySource for SimulatedConnectivity {
    fn start(&self, monitor_tx: mpsc::Sender<Connectivity>) {
        let Some(mut rx) = lock_mutex(&self.cmd_rx).take() else {
            warn!("Simulated connectivity already started");
            return;
        };
        debug!("Simulated connectivity listening for controller commands");

        let stop = self.stop.clone();
        tokio::spawn(async move {
            loop {
                let connectivity = tokio::select! {
                    _ = stop.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(connectivity) => connectivity,
                        None => break,
                    },
                };
                if monitor_tx.send(connectivity).await.is_err() {
                    break;
                }
            }
        });
    }

    fn stop(&self) {
        self.stop.cancel();
    }

    fn current(&self) -> Connectivity {
        *read_lock(&self.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn controller_changes_are_forwarded() {
        let (source, controller) = SimulatedConnectivity::new(Connectivity::OFFLINE);
        let (tx, mut rx) = mpsc::channel(8);
        source.start(tx);

        controller.connect_metered();
        let seen = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timeout waiting for connectivity")
            .expect("channel closed");
        assert_eq!(seen, Connectivity::metered());
        assert_eq!(source.current(), Connectivity::metered());
    }

    #[tokio::test]
    async fn current_reflects_controller_before_start() {
        let (source, controller) = SimulatedConnectivity::new(Connectivity::unmetered());
        controller.disconnect();
        assert_eq!(source.current(), Connectivity::OFFLINE);
    }
}

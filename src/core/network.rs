//! Network reachability by class.
//!
//! [`NetworkMonitor`] subscribes to a [`ConnectivitySource`] and turns raw
//! connectivity snapshots into per-class reachability changes. Callbacks fire
//! once per actual change of a class, never for repeated identical snapshots.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::utils::{lock_mutex, read_lock, write_lock};

/// Network class a transfer requires before it may run.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkClass {
    #[default]
    Any,
    UnmeteredOnly,
    MeteredOnly,
}

impl NetworkClass {
    pub const ALL: [NetworkClass; 3] = [Self::Any, Self::UnmeteredOnly, Self::MeteredOnly];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::UnmeteredOnly => "unmetered-only",
            Self::MeteredOnly => "metered-only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "any" => Some(Self::Any),
            "unmetered-only" | "unmetered" | "wifi" => Some(Self::UnmeteredOnly),
            "metered-only" | "metered" | "mobile" => Some(Self::MeteredOnly),
            _ => None,
        }
    }

    pub fn is_met_by(self, connectivity: Connectivity) -> bool {
        match self {
            Self::Any => connectivity.unmetered || connectivity.metered,
            Self::UnmeteredOnly => connectivity.unmetered,
            Self::MeteredOnly => connectivity.metered,
        }
    }
}

impl fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw connectivity snapshot reported by a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Connectivity {
    pub unmetered: bool,
    pub metered: bool,
}

impl Connectivity {
    pub const OFFLINE: Connectivity = Connectivity {
        unmetered: false,
        metered: false,
    };

    pub fn unmetered() -> Self {
        Self {
            unmetered: true,
            metered: false,
        }
    }

    pub fn metered() -> Self {
        Self {
            unmetered: false,
            metered: true,
        }
    }
}

/// A single class changing reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkChange {
    pub class: NetworkClass,
    pub reachable: bool,
}

/// Platform facility delivering connectivity snapshots.
pub trait ConnectivitySource: Send + Sync {
    /// Start delivering snapshots. Spawns internal tasks that send to `tx`.
    fn start(&self, tx: mpsc::Sender<Connectivity>);

    /// Stop delivering snapshots.
    fn stop(&self);

    /// Connectivity right now.
    fn current(&self) -> Connectivity;
}

type ChangeCallback = Arc<dyn Fn(NetworkChange) + Send + Sync>;

struct Shared {
    current: RwLock<Connectivity>,
    callbacks: Mutex<Vec<ChangeCallback>>,
}

impl Shared {
    fn observe(&self, next: Connectivity) {
        let previous = {
            let mut current = write_lock(&self.current);
            std::mem::replace(&mut *current, next)
        };
        if previous == next {
            return;
        }

        let changes: Vec<NetworkChange> = NetworkClass::ALL
            .into_iter()
            .filter(|class| class.is_met_by(previous) != class.is_met_by(next))
            .map(|class| NetworkChange {
                class,
                reachable: class.is_met_by(next),
            })
            .collect();
        if changes.is_empty() {
            return;
        }

        let callbacks = lock_mutex(&self.callbacks).clone();
        for change in changes {
            debug!(class = %change.class, reachable = change.reachable, "Network class changed");
            for callback in &callbacks {
                callback(change);
            }
        }
    }
}

/// Injected reachability service with an explicit init/teardown lifecycle.
pub struct NetworkMonitor {
    source: Arc<dyn ConnectivitySource>,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new(source: Arc<dyn ConnectivitySource>) -> Self {
        let initial = source.current();
        Self {
            source,
            shared: Arc::new(Shared {
                current: RwLock::new(initial),
                callbacks: Mutex::new(Vec::new()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Subscribe to the source. Calling `init` on a running monitor is a no-op.
    pub fn init(&self) {
        let mut task = lock_mutex(&self.task);
        if task.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::channel(16);
        self.shared.observe(self.source.current());
        self.source.start(tx);

        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(async move {
            while let Some(connectivity) = rx.recv().await {
                shared.observe(connectivity);
            }
        }));
        info!("Network monitor started");
    }

    pub fn teardown(&self) {
        if let Some(task) = lock_mutex(&self.task).take() {
            self.source.stop();
            task.abort();
            info!("Network monitor stopped");
        }
    }

    pub fn currently_meets(&self, class: NetworkClass) -> bool {
        class.is_met_by(*read_lock(&self.shared.current))
    }

    /// Register a callback invoked once per class reachability change.
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(NetworkChange) + Send + Sync + 'static,
    {
        lock_mutex(&self.shared.callbacks).push(Arc::new(callback));
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        if let Some(task) = lock_mutex(&self.task).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Connectivity);

    impl ConnectivitySource for Fixed {
        fn start(&self, _tx: mpsc::Sender<Connectivity>) {}
        fn stop(&self) {}
        fn current(&self) -> Connectivity {
            self.0
        }
    }

    fn recorder(monitor: &NetworkMonitor) -> Arc<Mutex<Vec<NetworkChange>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        monitor.on_change(move |change| sink.lock().unwrap().push(change));
        seen
    }

    #[test]
    fn class_requirements() {
        let wifi = Connectivity::unmetered();
        let cell = Connectivity::metered();
        assert!(NetworkClass::Any.is_met_by(wifi));
        assert!(NetworkClass::Any.is_met_by(cell));
        assert!(!NetworkClass::Any.is_met_by(Connectivity::OFFLINE));
        assert!(NetworkClass::UnmeteredOnly.is_met_by(wifi));
        assert!(!NetworkClass::UnmeteredOnly.is_met_by(cell));
        assert!(NetworkClass::MeteredOnly.is_met_by(cell));
        assert!(!NetworkClass::MeteredOnly.is_met_by(wifi));
    }

    #[test]
    fn callbacks_fire_once_per_class_change() {
        let monitor = NetworkMonitor::new(Arc::new(Fixed(Connectivity::OFFLINE)));
        let seen = recorder(&monitor);

        monitor.shared.observe(Connectivity::unmetered());
        // Same snapshot again changes nothing.
        monitor.shared.observe(Connectivity::unmetered());

        let changes = seen.lock().unwrap().clone();
        assert_eq!(
            changes,
            vec![
                NetworkChange {
                    class: NetworkClass::Any,
                    reachable: true
                },
                NetworkChange {
                    class: NetworkClass::UnmeteredOnly,
                    reachable: true
                },
            ]
        );
    }

    #[test]
    fn switching_links_keeps_any_reachable() {
        let monitor = NetworkMonitor::new(Arc::new(Fixed(Connectivity::unmetered())));
        let seen = recorder(&monitor);

        monitor.shared.observe(Connectivity::metered());

        let changes = seen.lock().unwrap().clone();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.class != NetworkClass::Any));
        assert!(monitor.currently_meets(NetworkClass::Any));
        assert!(monitor.currently_meets(NetworkClass::MeteredOnly));
        assert!(!monitor.currently_meets(NetworkClass::UnmeteredOnly));
    }

    #[test]
    fn parse_aliases() {
        assert_eq!(NetworkClass::parse("WIFI"), Some(NetworkClass::UnmeteredOnly));
        assert_eq!(NetworkClass::parse("metered_only"), Some(NetworkClass::MeteredOnly));
        assert_eq!(NetworkClass::parse("any"), Some(NetworkClass::Any));
        assert_eq!(NetworkClass::parse("satellite"), None);
    }
}

use std::sync::Arc;
use std::time::Duration;

use crate::core::network::{Connectivity, ConnectivitySource};

#[cfg(target_os = "linux")]
pub mod linux;
pub mod simulated;

#[cfg(target_os = "linux")]
pub use linux::SysfsConnectivity;
pub use simulated::{ConnectivityController, SimulatedConnectivity};

/// Connectivity source for this platform, or a simulated one driven from
/// stdin (`wifi`, `cell`, `off`).
pub fn get_source(simulation: bool, poll_interval: Duration) -> Arc<dyn ConnectivitySource> {
    if simulation {
        let (source, controller) = SimulatedConnectivity::new(Connectivity::unmetered());

        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lines().map_while(Result::ok) {
                match line.trim() {
                    "wifi" => controller.connect_unmetered(),
                    "cell" => controller.connect_metered(),
                    "off" => controller.disconnect(),
                    "" => {}
                    _ => eprintln!("(Simulator) Use: 'wifi', 'cell' or 'off'"),
                }
            }
        });

        return Arc::new(source);
    }

    platform_source(poll_interval)
}

#[cfg(target_os = "linux")]
fn platform_source(poll_interval: Duration) -> Arc<dyn ConnectivitySource> {
    Arc::new(SysfsConnectivity::new(poll_interval))
}

#[cfg(not(target_os = "linux"))]
fn platform_source(_poll_interval: Duration) -> Arc<dyn ConnectivitySource> {
    Arc::new(AlwaysOnline)
}

/// Fallback for platforms without a connectivity source: always unmetered.
#[cfg(not(target_os = "linux"))]
struct AlwaysOnline;

#[cfg(not(target_os = "linux"))]
impl ConnectivitySource for AlwaysOnline {
    fn start(&self, _tx: tokio::sync::mpsc::Sender<Connectivity>) {}

    fn stop(&self) {}

    fn current(&self) -> Connectivity {
        Connectivity::unmetered()
    }
}

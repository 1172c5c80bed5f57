pub mod coordinator;
pub mod error;
pub mod executor;
pub mod models;
pub mod network;
pub mod observer;
pub mod state;
pub mod status;

pub use coordinator::{TransferCoordinator, TransferRequest};
pub use error::{ErrorClass, TransferError};
pub use executor::{ExecutorOptions, TaskHandle, TaskOutcome, TransferExecutor};
pub use models::{ObjectMetadata, RecordUpdate, TransferDirection, TransferId, TransferRecord};
pub use network::{Connectivity, ConnectivitySource, NetworkChange, NetworkClass, NetworkMonitor};
pub use observer::TransferObserver;
pub use state::{TransferEvent, TransferState};
pub use status::{StatusUpdater, TransferListener};

//! Transfer state machine.
//!
//! Every mutation of a record's state goes through [`TransferState::can_transition_to`].
//! Transitions not listed in the table are rejected and the caller treats them as no-ops.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a transfer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    /// Created or resumed, waiting for an eligibility check and a worker slot.
    Waiting,
    /// Required network class is not reachable; resumes automatically.
    WaitingForNetwork,
    /// A worker is moving bytes.
    InProgress,
    /// Pause requested, waiting for the running task to stop.
    PendingPause,
    /// Paused by the caller.
    Paused,
    /// Cancel requested, waiting for the running task to stop and cleanup to run.
    PendingCancel,
    Canceled,
    Completed,
    Failed,
    /// Network lost while in progress, waiting for the running task to stop.
    /// Settles into `WaitingForNetwork`.
    PendingNetworkDisconnect,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    /// Eligibility passed and a worker slot was obtained.
    Start,
    /// Eligibility failed because the required network is unreachable.
    NetworkUnavailable,
    /// A matching network-recovery event arrived.
    NetworkRecovered,
    /// Network lost while the task was running.
    NetworkLost,
    /// The executor reported full transfer (and finalize, for multipart).
    Complete,
    /// The executor reported an unrecoverable error.
    Fail,
    PauseRequested,
    CancelRequested,
    /// The running task (if any) has stopped after a pending request.
    Stopped,
    Resume,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// States in which a stop request is in flight.
    pub fn is_pending_stop(self) -> bool {
        matches!(
            self,
            Self::PendingPause | Self::PendingCancel | Self::PendingNetworkDisconnect
        )
    }

    /// The full transition table.
    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;

        if self == next || self.is_terminal() {
            return false;
        }

        match self {
            Waiting => matches!(
                next,
                InProgress | WaitingForNetwork | PendingPause | PendingCancel | Failed
            ),
            WaitingForNetwork => matches!(next, Waiting | PendingPause | PendingCancel),
            InProgress => matches!(
                next,
                Completed | Failed | PendingPause | PendingCancel | PendingNetworkDisconnect
            ),
            // A completion already confirmed by the remote store beats a pending stop.
            PendingPause => matches!(next, Paused | PendingCancel | Completed),
            PendingCancel => matches!(next, Canceled | Completed),
            PendingNetworkDisconnect => matches!(
                next,
                WaitingForNetwork | PendingPause | PendingCancel | Completed
            ),
            Paused => matches!(next, Waiting | PendingCancel),
            Completed | Failed | Canceled => false,
        }
    }

    /// Target state for `event` applied in `self`, or `None` when the event is
    /// not valid here.
    pub fn apply(self, event: TransferEvent) -> Option<TransferState> {
        use TransferEvent as E;
        use TransferState::*;

        let next = match (self, event) {
            (Waiting, E::Start) => InProgress,
            (Waiting, E::NetworkUnavailable) => WaitingForNetwork,
            (WaitingForNetwork, E::NetworkRecovered) => Waiting,
            (InProgress, E::NetworkLost) => PendingNetworkDisconnect,
            (Waiting, E::NetworkLost) => WaitingForNetwork,
            (PendingNetworkDisconnect, E::Stopped) => WaitingForNetwork,
            (PendingPause, E::Stopped) => Paused,
            (PendingCancel, E::Stopped) => Canceled,
            (Paused, E::Resume) => Waiting,
            (s, E::Complete) if s == InProgress || s.is_pending_stop() => Completed,
            (InProgress | Waiting, E::Fail) => Failed,
            (s, E::PauseRequested) if s != PendingCancel => PendingPause,
            (_, E::CancelRequested) => PendingCancel,
            _ => return None,
        };

        self.can_transition_to(next).then_some(next)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::WaitingForNetwork => "WAITING_FOR_NETWORK",
            Self::InProgress => "IN_PROGRESS",
            Self::PendingPause => "PENDING_PAUSE",
            Self::Paused => "PAUSED",
            Self::PendingCancel => "PENDING_CANCEL",
            Self::Canceled => "CANCELED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::PendingNetworkDisconnect => "PENDING_NETWORK_DISCONNECT",
        }
    }

    /// State a record is put in when it is reloaded after a process restart.
    ///
    /// Nothing is running after a restart, so in-flight states settle:
    /// running work goes back to `Waiting`, pending pauses become `Paused`.
    /// `PendingCancel` is kept so the coordinator can finish the cleanup.
    pub fn normalized_on_reload(self) -> TransferState {
        match self {
            Self::InProgress => Self::Waiting,
            Self::PendingPause => Self::Paused,
            Self::PendingNetworkDisconnect => Self::WaitingForNetwork,
            other => other,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown transfer state: {0}")]
pub struct UnknownState(String);

impl FromStr for TransferState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let state = match s.to_ascii_uppercase().as_str() {
            "WAITING" => Self::Waiting,
            "WAITING_FOR_NETWORK" => Self::WaitingForNetwork,
            "IN_PROGRESS" => Self::InProgress,
            "PENDING_PAUSE" => Self::PendingPause,
            "PAUSED" => Self::Paused,
            "PENDING_CANCEL" => Self::PendingCancel,
            "CANCELED" => Self::Canceled,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            "PENDING_NETWORK_DISCONNECT" => Self::PendingNetworkDisconnect,
            _ => return Err(UnknownState(s.to_string())),
        };
        Ok(state)
    }
}

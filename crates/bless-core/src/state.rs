//! Server lifecycle state machine
//!
//! Every backend walks the same states; only the native calls behind each
//! transition differ. Transitions are validated here so a second `start()`
//! racing the first is rejected instead of re-registering services.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{BlessError, Result};

// ----------------------------------------------------------------------------
// States and Events
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerState {
    /// Backend not yet constructed
    Uninitialized,
    /// Waiting for the radio to report powered on
    PoweredWait,
    /// Radio on, nothing registered with the native stack
    Ready,
    /// Pushing services to the native stack
    ServicesRegistering,
    Advertising,
    Stopping,
    /// A native error aborted the last operation
    Faulted,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Uninitialized => "uninitialized",
            ServerState::PoweredWait => "waiting for power",
            ServerState::Ready => "ready",
            ServerState::ServicesRegistering => "registering services",
            ServerState::Advertising => "advertising",
            ServerState::Stopping => "stopping",
            ServerState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Events that drive [`ServerState`] transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    BackendCreated,
    /// `start()` entered the power-on wait
    StartRequested,
    PoweredOn,
    RegistrationStarted,
    AdvertisingStarted,
    /// Advertising wait timed out and the sequence will run again
    RetryRequested,
    StopRequested,
    Stopped,
    Failed,
}

// ----------------------------------------------------------------------------
// State Machine
// ----------------------------------------------------------------------------

/// Validated lifecycle transitions
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: ServerState,
    start_in_flight: bool,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ServerState::Uninitialized,
            start_in_flight: false,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Next state for `event`, or `None` when the transition is invalid
    pub fn next(state: ServerState, event: StateEvent) -> Option<ServerState> {
        use ServerState::*;
        use StateEvent::*;

        match (state, event) {
            (Uninitialized, BackendCreated) => Some(PoweredWait),
            (PoweredWait | Ready | Faulted, StartRequested) => Some(PoweredWait),
            (PoweredWait, PoweredOn) => Some(Ready),
            (Ready, RegistrationStarted) => Some(ServicesRegistering),
            (ServicesRegistering, AdvertisingStarted) => Some(Advertising),
            (ServicesRegistering, RetryRequested) => Some(PoweredWait),
            (Advertising | ServicesRegistering | Faulted, StopRequested) => Some(Stopping),
            (Stopping, Stopped) => Some(Ready),
            (_, Failed) => Some(Faulted),
            _ => None,
        }
    }

    /// Apply `event`, failing with `InvalidState` for `operation` if illegal
    pub fn apply(&mut self, event: StateEvent, operation: &'static str) -> Result<ServerState> {
        match Self::next(self.state, event) {
            Some(next) => {
                debug!(from = %self.state, to = %next, ?event, "Server state transition");
                self.state = next;
                Ok(next)
            }
            None => {
                warn!(state = %self.state, ?event, "Rejected server state transition");
                Err(BlessError::InvalidState {
                    operation,
                    state: self.state,
                })
            }
        }
    }

    /// Single-flight guard for `start()`
    ///
    /// Must be paired with [`finish_start`](Self::finish_start) on every path.
    pub fn begin_start(&mut self) -> Result<()> {
        if self.start_in_flight {
            warn!(state = %self.state, "start() already in progress");
            return Err(BlessError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        self.apply(StateEvent::StartRequested, "start")?;
        self.start_in_flight = true;
        Ok(())
    }

    pub fn finish_start(&mut self) {
        self.start_in_flight = false;
    }

    pub fn is_starting(&self) -> bool {
        self.start_in_flight
    }

    pub fn fail(&mut self) {
        self.state = ServerState::Faulted;
    }
}

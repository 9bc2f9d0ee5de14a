// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Session state machine.

use super::session::ConnectionLifecycleEvent;
use super::BluetoothError;

/// Which side initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Actively connecting to a known device.
    Client,
    /// Passively accepting any inbound peer.
    Server,
}

/// Lifecycle of the controller's single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting(ConnectionRole),
    Connected,
    Disconnecting,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, SessionState::Connecting(_))
    }

    /// Connecting or connected; discovery is not allowed meanwhile.
    pub fn is_busy(&self) -> bool {
        self.is_connecting() || self.is_connected()
    }
}

/// Identifies one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttemptId(u64);

/// Result of feeding an event into the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The event belongs to an attempt that was superseded or cancelled.
    Stale,
    Connected,
    /// The attempt ended; the state is back to idle.
    Failed(BluetoothError),
}

/// The controller's connection state.
///
/// All transitions go through `&mut self`, so whoever holds the machine
/// serialises commands and incoming events.
#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    current: AttemptId,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            current: AttemptId(0),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Start a new attempt, superseding any previous one.
    pub fn begin_attempt(&mut self, role: ConnectionRole) -> AttemptId {
        self.current = AttemptId(self.current.0 + 1);
        self.state = SessionState::Connecting(role);
        self.current
    }

    /// Apply an event reported by the attempt `id`.
    pub fn apply(&mut self, id: AttemptId, event: &ConnectionLifecycleEvent) -> Transition {
        if id != self.current {
            return Transition::Stale;
        }
        match (self.state, event) {
            (SessionState::Connecting(_), ConnectionLifecycleEvent::Established) => {
                self.state = SessionState::Connected;
                Transition::Connected
            }
            (
                SessionState::Connecting(_) | SessionState::Connected,
                ConnectionLifecycleEvent::Failed(error),
            ) => {
                self.state = SessionState::Idle;
                Transition::Failed(error.clone())
            }
            _ => Transition::Stale,
        }
    }

    /// Invalidate the current attempt ahead of tearing down its transport.
    pub fn begin_disconnect(&mut self) {
        self.current = AttemptId(self.current.0 + 1);
        if self.state != SessionState::Idle {
            self.state = SessionState::Disconnecting;
        }
    }

    pub fn finish_disconnect(&mut self) {
        self.state = SessionState::Idle;
    }
}

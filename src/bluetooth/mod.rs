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

//! Bluetooth peer discovery and connection lifecycle.
//!
//! The [`PeerController`] facade composes discovery, the device registry and
//! a single connection session, and republishes their state as observables
//! for presentation code.

#[cfg(feature = "bluez")]
pub mod bluez;
mod controller;
mod device;
mod discovery;
mod machine;
mod registry;
mod session;
pub mod simulated;
mod transport;

use thiserror::Error;

pub use controller::PeerController;
pub use device::{BondState, Device};
pub use discovery::DiscoverySession;
pub use machine::{AttemptId, ConnectionRole, SessionMachine, SessionState, Transition};
pub use registry::DeviceRegistry;
pub use session::{ConnectionEvents, ConnectionLifecycleEvent, ConnectionSession, PeerLink};
pub use transport::{
    BoxedChannel, Channel, DiscoveryProvider, GrantAll, Permission, PermissionGate,
    PermissionSet, Transport,
};

/// Failures surfaced by the radio, the transport or the controller.
///
/// The `Display` text is the message published on the controller's error
/// channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BluetoothError {
    #[error("Bluetooth is unavailable: {0}")]
    RadioUnavailable(String),

    #[error("Missing {0} permission")]
    PermissionDenied(Permission),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Connection was interrupted: {0}")]
    TransportClosed(String),

    #[error("Connection attempt cancelled")]
    CancelledByUser,

    #[error("Cannot scan while a connection is active")]
    Busy,

    #[error("Bluetooth controller has been released")]
    Released,
}

impl BluetoothError {
    /// Whether this outcome should be shown to the user.
    ///
    /// A cancelled attempt is the expected result of a disconnect racing an
    /// in-flight connect, not a failure.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, BluetoothError::CancelledByUser)
    }
}

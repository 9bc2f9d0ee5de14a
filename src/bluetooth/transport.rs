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

//! Radio abstractions consumed by the controller.
//!
//! The platform radio stack is reached only through these traits so that the
//! BlueZ backend and the in-process simulator are interchangeable.

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

use super::device::Device;
use super::BluetoothError;

/// A connected point-to-point byte channel.
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Channel for T {}

pub type BoxedChannel = Box<dyn Channel>;

/// Source of nearby and bonded devices.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// Start scanning; the radio scan runs until the returned stream is dropped.
    async fn discover(&self) -> Result<BoxStream<'static, Device>, BluetoothError>;

    /// Devices the adapter is currently bonded with.
    async fn paired_devices(&self) -> Result<Vec<Device>, BluetoothError>;
}

/// Point-to-point connection primitives.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open an outbound channel to the device at `address`.
    async fn connect(&self, address: &str) -> Result<BoxedChannel, BluetoothError>;

    /// Wait for a single inbound peer; returns the channel and the peer address.
    async fn accept(&self) -> Result<(BoxedChannel, String), BluetoothError>;
}

/// Runtime permissions guarding radio access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Scan,
    Connect,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Scan => write!(f, "BLUETOOTH_SCAN"),
            Permission::Connect => write!(f, "BLUETOOTH_CONNECT"),
        }
    }
}

/// Authorization layer consulted before the radio is touched.
pub trait PermissionGate: Send + Sync {
    fn check(&self, permission: Permission) -> Result<(), BluetoothError>;
}

/// Gate for platforms without runtime permissions.
#[derive(Debug, Default, Clone, Copy)]
pub struct GrantAll;

impl PermissionGate for GrantAll {
    fn check(&self, _permission: Permission) -> Result<(), BluetoothError> {
        Ok(())
    }
}

/// Permissions granted or revoked at runtime.
#[derive(Debug, Default)]
pub struct PermissionSet {
    granted: RwLock<HashSet<Permission>>,
}

impl PermissionSet {
    /// Create a set with nothing granted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set with every permission granted.
    pub fn all() -> Self {
        let set = Self::new();
        set.grant(Permission::Scan);
        set.grant(Permission::Connect);
        set
    }

    pub fn grant(&self, permission: Permission) {
        self.granted.write().insert(permission);
    }

    pub fn revoke(&self, permission: Permission) {
        self.granted.write().remove(&permission);
    }

    pub fn is_granted(&self, permission: Permission) -> bool {
        self.granted.read().contains(&permission)
    }
}

impl PermissionGate for PermissionSet {
    fn check(&self, permission: Permission) -> Result<(), BluetoothError> {
        if self.is_granted(permission) {
            Ok(())
        } else {
            Err(BluetoothError::PermissionDenied(permission))
        }
    }
}

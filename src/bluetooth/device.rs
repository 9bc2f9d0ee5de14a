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

//! Peer device descriptions.

use serde::{Deserialize, Serialize};

/// Whether the local adapter holds a bond with the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BondState {
    Paired,
    Unpaired,
}

/// A nearby or previously paired Bluetooth device.
///
/// Identity is the hardware address; the name is informational and may be
/// missing for devices that never reported one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub address: String,
    pub name: Option<String>,
    pub bond_state: BondState,
}

impl Device {
    /// Create an unpaired device.
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
            bond_state: BondState::Unpaired,
        }
    }

    /// Create a device the adapter is bonded with.
    pub fn paired(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
            bond_state: BondState::Paired,
        }
    }

    /// Name to show to the user, falling back to the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }

    pub fn is_paired(&self) -> bool {
        self.bond_state == BondState::Paired
    }

    /// Whether both values describe the same physical device.
    pub fn same_peer(&self, other: &Device) -> bool {
        self.address == other.address
    }
}

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

//! Registry of scanned and paired devices.
//!
//! Both lists are ordered by first sighting and deduplicated by address.
//! Every change publishes the full list to subscribers; the latest list is
//! replayed to anyone subscribing later.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use super::device::Device;

/// Shared, observable device lists.
#[derive(Clone)]
pub struct DeviceRegistry {
    scanned: Arc<watch::Sender<Vec<Device>>>,
    paired: Arc<watch::Sender<Vec<Device>>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (scanned, _) = watch::channel(Vec::new());
        let (paired, _) = watch::channel(Vec::new());
        Self {
            scanned: Arc::new(scanned),
            paired: Arc::new(paired),
        }
    }

    /// Record a device seen during a scan.
    pub fn record_scanned(&self, device: Device) {
        if self.scanned.send_if_modified(|list| upsert(list, device)) {
            debug!("Scanned devices: {}", self.scanned.borrow().len());
        }
    }

    /// Record a device the adapter is bonded with.
    pub fn record_paired(&self, device: Device) {
        self.paired.send_if_modified(|list| upsert(list, device));
    }

    /// Replace the paired list with a fresh listing from the radio.
    ///
    /// Devices already known keep their position; subscribers are notified
    /// only if the resulting list differs.
    pub fn replace_paired(&self, devices: Vec<Device>) {
        self.paired.send_if_modified(|list| {
            let mut next: Vec<Device> = Vec::with_capacity(devices.len());
            for known in list.iter() {
                if let Some(fresh) = devices.iter().find(|d| d.same_peer(known)) {
                    upsert(&mut next, fresh.clone());
                }
            }
            for device in devices {
                upsert(&mut next, device);
            }
            if next == *list {
                false
            } else {
                *list = next;
                true
            }
        });
    }

    /// Forget every scanned device.
    pub fn clear_scanned(&self) {
        self.scanned.send_if_modified(|list| {
            let changed = !list.is_empty();
            list.clear();
            changed
        });
    }

    pub fn snapshot_scanned(&self) -> Vec<Device> {
        self.scanned.borrow().clone()
    }

    pub fn snapshot_paired(&self) -> Vec<Device> {
        self.paired.borrow().clone()
    }

    pub fn subscribe_scanned(&self) -> watch::Receiver<Vec<Device>> {
        self.scanned.subscribe()
    }

    pub fn subscribe_paired(&self) -> watch::Receiver<Vec<Device>> {
        self.paired.subscribe()
    }
}

/// Insert a new device at the end or refresh the name of a known one.
///
/// Returns whether the list changed. An absent name never erases a known one.
fn upsert(list: &mut Vec<Device>, device: Device) -> bool {
    match list.iter_mut().find(|d| d.same_peer(&device)) {
        Some(existing) => match device.name {
            Some(name) if existing.name.as_deref() != Some(name.as_str()) => {
                existing.name = Some(name);
                true
            }
            _ => false,
        },
        None => {
            list.push(device);
            true
        }
    }
}

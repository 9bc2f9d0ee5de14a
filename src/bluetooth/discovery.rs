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

//! Device discovery lifecycle.

use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::registry::DeviceRegistry;
use super::transport::{DiscoveryProvider, Permission, PermissionGate};
use super::BluetoothError;

/// Owns the radio scan and feeds sightings into the registry.
pub struct DiscoverySession {
    provider: Arc<dyn DiscoveryProvider>,
    permissions: Arc<dyn PermissionGate>,
    registry: DeviceRegistry,
    scan: Option<JoinHandle<()>>,
}

impl DiscoverySession {
    pub fn new(
        provider: Arc<dyn DiscoveryProvider>,
        permissions: Arc<dyn PermissionGate>,
        registry: DeviceRegistry,
    ) -> Self {
        Self {
            provider,
            permissions,
            registry,
            scan: None,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Reload the bonded device list into the registry.
    pub async fn refresh_paired(&self) -> Result<(), BluetoothError> {
        self.permissions.check(Permission::Connect)?;
        let devices = self.provider.paired_devices().await?;
        debug!("Adapter reports {} paired devices", devices.len());
        self.registry.replace_paired(devices);
        Ok(())
    }

    /// Start scanning. Does nothing if a scan is already running.
    pub async fn start(&mut self) -> Result<(), BluetoothError> {
        if self.is_scanning() {
            debug!("Discovery already running");
            return Ok(());
        }
        self.permissions.check(Permission::Scan)?;

        if let Err(e) = self.refresh_paired().await {
            warn!("Could not refresh paired devices: {}", e);
        }

        let mut devices = self.provider.discover().await?;
        info!("Discovery started");

        let registry = self.registry.clone();
        self.scan = Some(tokio::spawn(async move {
            while let Some(device) = devices.next().await {
                debug!("Discovered {} ({})", device.display_name(), device.address);
                registry.record_scanned(device);
            }
            info!("Discovery finished");
        }));
        Ok(())
    }

    /// Stop scanning. Returns once the radio scan has been dropped.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.scan.take() {
            handle.abort();
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => debug!("Scan task cancelled"),
                Err(e) => error!("Scan task failed: {}", e),
            }
            info!("Discovery stopped");
        }
    }
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        if let Some(handle) = self.scan.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::simulated::SimulatedRadio;
    use crate::bluetooth::{Device, GrantAll, PermissionSet};
    use futures::stream::{self, BoxStream};
    use std::task::Poll;
    use std::time::Duration;
    use tokio::time::timeout;

    fn discovery(radio: &SimulatedRadio, registry: &DeviceRegistry) -> DiscoverySession {
        DiscoverySession::new(Arc::new(radio.clone()), Arc::new(GrantAll), registry.clone())
    }

    #[tokio::test]
    async fn test_sightings_reach_registry() {
        let radio = SimulatedRadio::new();
        let registry = DeviceRegistry::new();
        radio.announce(Device::new("00:11", Some("A".to_string())));

        let mut session = discovery(&radio, &registry);
        session.start().await.unwrap();
        radio.announce(Device::new("00:22", Some("B".to_string())));

        let mut rx = registry.subscribe_scanned();
        let devices = timeout(Duration::from_secs(2), rx.wait_for(|list| list.len() == 2))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(devices[0].address, "00:11");
        assert_eq!(devices[1].address, "00:22");
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let radio = SimulatedRadio::new();
        let registry = DeviceRegistry::new();
        let mut session = discovery(&radio, &registry);

        session.stop().await;
        session.start().await.unwrap();
        session.start().await.unwrap();
        assert!(session.is_scanning());
        assert_eq!(radio.active_scans(), 1);

        session.stop().await;
        session.stop().await;
        assert!(!session.is_scanning());
        assert_eq!(radio.active_scans(), 0);
    }

    #[tokio::test]
    async fn test_start_refreshes_paired_devices() {
        let radio = SimulatedRadio::new();
        let registry = DeviceRegistry::new();
        radio.pair(Device::new("00:44", Some("Phone".to_string())));

        let mut session = discovery(&radio, &registry);
        session.start().await.unwrap();

        let paired = registry.snapshot_paired();
        assert_eq!(paired.len(), 1);
        assert!(paired[0].is_paired());
    }

    #[tokio::test]
    async fn test_radio_off_fails_without_results() {
        let radio = SimulatedRadio::new();
        let registry = DeviceRegistry::new();
        radio.announce(Device::new("00:11", None));
        radio.set_powered(false);

        let mut session = discovery(&radio, &registry);
        let result = session.start().await;
        assert!(matches!(result, Err(BluetoothError::RadioUnavailable(_))));
        assert!(!session.is_scanning());
        assert!(registry.snapshot_scanned().is_empty());
    }

    #[tokio::test]
    async fn test_scan_permission_required() {
        let radio = SimulatedRadio::new();
        let registry = DeviceRegistry::new();
        let permissions = Arc::new(PermissionSet::new());
        let mut session =
            DiscoverySession::new(Arc::new(radio.clone()), permissions.clone(), registry);

        assert_eq!(
            session.start().await,
            Err(BluetoothError::PermissionDenied(Permission::Scan))
        );
        assert_eq!(radio.active_scans(), 0);

        permissions.grant(Permission::Scan);
        assert!(session.start().await.is_ok());
        assert_eq!(radio.active_scans(), 1);
    }

    struct FaultyScanner;

    #[async_trait::async_trait]
    impl DiscoveryProvider for FaultyScanner {
        async fn discover(&self) -> Result<BoxStream<'static, Device>, BluetoothError> {
            let devices = stream::poll_fn(|_| -> Poll<Option<Device>> { panic!("scanner fault") });
            Ok(devices.boxed())
        }

        async fn paired_devices(&self) -> Result<Vec<Device>, BluetoothError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_stop_after_scan_task_panicked() {
        let registry = DeviceRegistry::new();
        let mut session =
            DiscoverySession::new(Arc::new(FaultyScanner), Arc::new(GrantAll), registry.clone());

        session.start().await.unwrap();
        timeout(Duration::from_secs(2), async {
            while session.is_scanning() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        session.stop().await;
        assert!(!session.is_scanning());
        assert!(registry.snapshot_scanned().is_empty());
    }
}

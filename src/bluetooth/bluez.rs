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

//! BlueZ radio backed by `bluer`.
//!
//! Discovery uses the adapter's device discovery; connections are RFCOMM
//! streams on the configured channel. The server side registers the chat
//! service record so peers can find it by UUID.

use anyhow::Result;
use async_trait::async_trait;
use bluer::rfcomm::{Profile, Role, SocketAddr, Stream};
use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::stream::{BoxStream, StreamExt};
use std::io;
use uuid::Uuid;
use tracing::{debug, info, warn};

use super::device::Device;
use super::transport::{BoxedChannel, DiscoveryProvider, Permission, Transport};
use super::BluetoothError;
use crate::config::BluetoothConfig;

/// The default BlueZ adapter.
pub struct BluezRadio {
    session: Session,
    adapter: Adapter,
    channel: u8,
    service_name: String,
    service_uuid: Uuid,
}

impl BluezRadio {
    /// Open a BlueZ session on the default adapter.
    pub async fn new(config: &BluetoothConfig) -> Result<Self> {
        info!("Initializing Bluetooth adapter...");

        let session = Session::new().await?;
        info!("BlueZ session created");

        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        if adapter.is_powered().await? {
            adapter.set_alias(config.device_name.clone()).await?;
            info!("Bluetooth name set to: {}", config.device_name);
        } else {
            warn!("Bluetooth adapter is powered off");
        }

        info!(
            "Chat service '{}' ({}) on RFCOMM channel {}",
            config.service_name, config.service_uuid, config.rfcomm_channel
        );

        Ok(Self {
            session,
            adapter,
            channel: config.rfcomm_channel,
            service_name: config.service_name.clone(),
            service_uuid: config.service_uuid,
        })
    }

    async fn ensure_powered(&self) -> Result<(), BluetoothError> {
        match self.adapter.is_powered().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(BluetoothError::RadioUnavailable(
                "Bluetooth adapter is turned off".to_string(),
            )),
            Err(e) => Err(radio_error(e)),
        }
    }
}

async fn describe(adapter: &Adapter, address: Address) -> bluer::Result<Device> {
    let device = adapter.device(address)?;
    let name = device.name().await?;
    Ok(if device.is_paired().await? {
        Device::paired(address.to_string(), name)
    } else {
        Device::new(address.to_string(), name)
    })
}

fn radio_error(e: bluer::Error) -> BluetoothError {
    BluetoothError::RadioUnavailable(e.to_string())
}

fn socket_error(e: io::Error) -> BluetoothError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => BluetoothError::PermissionDenied(Permission::Connect),
        _ => BluetoothError::ConnectFailed(e.to_string()),
    }
}

#[async_trait]
impl DiscoveryProvider for BluezRadio {
    async fn discover(&self) -> Result<BoxStream<'static, Device>, BluetoothError> {
        self.ensure_powered().await?;

        let events = self.adapter.discover_devices().await.map_err(radio_error)?;
        let adapter = self.adapter.clone();
        let devices = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    AdapterEvent::DeviceAdded(address) => match describe(&adapter, address).await {
                        Ok(device) => Some(device),
                        Err(e) => {
                            debug!("Skipping {}: {}", address, e);
                            None
                        }
                    },
                    _ => None,
                }
            }
        });

        Ok(devices.boxed())
    }

    async fn paired_devices(&self) -> Result<Vec<Device>, BluetoothError> {
        let mut devices = Vec::new();

        for address in self.adapter.device_addresses().await.map_err(radio_error)? {
            let device = self.adapter.device(address).map_err(radio_error)?;
            if device.is_paired().await.map_err(radio_error)? {
                let name = device.name().await.ok().flatten();
                devices.push(Device::paired(address.to_string(), name));
            }
        }

        Ok(devices)
    }
}

#[async_trait]
impl Transport for BluezRadio {
    async fn connect(&self, address: &str) -> Result<BoxedChannel, BluetoothError> {
        self.ensure_powered().await?;

        let remote: Address = address.parse().map_err(|_| {
            BluetoothError::ConnectFailed(format!("invalid device address: {}", address))
        })?;
        let stream = Stream::connect(SocketAddr::new(remote, self.channel))
            .await
            .map_err(socket_error)?;
        info!("RFCOMM connected to {} on channel {}", remote, self.channel);

        Ok(Box::new(stream))
    }

    async fn accept(&self) -> Result<(BoxedChannel, String), BluetoothError> {
        self.ensure_powered().await?;

        let profile = Profile {
            uuid: self.service_uuid,
            name: Some(self.service_name.clone()),
            channel: Some(self.channel.into()),
            role: Some(Role::Server),
            require_authentication: Some(false),
            require_authorization: Some(false),
            ..Default::default()
        };
        let mut service = self
            .session
            .register_profile(profile)
            .await
            .map_err(radio_error)?;
        info!(
            "RFCOMM server '{}' listening on channel {}",
            self.service_name, self.channel
        );

        // One peer per listen; the service record is removed when this returns.
        let request = service.next().await.ok_or_else(|| {
            BluetoothError::RadioUnavailable("chat service registration ended".to_string())
        })?;
        let remote = request.device();
        let stream = request.accept().map_err(socket_error)?;
        Ok((Box::new(stream), remote.to_string()))
    }
}

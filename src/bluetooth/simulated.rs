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

//! In-process radio.
//!
//! Simulates nearby devices, bonds and point-to-point channels entirely in
//! memory so the controller can run without Bluetooth hardware. Channels are
//! `tokio::io::duplex` pipes; the remote end of each connection is handed to
//! the caller to play the peer.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use super::device::Device;
use super::transport::{BoxedChannel, DiscoveryProvider, Transport};
use super::BluetoothError;

/// Capacity of each simulated pipe.
const PIPE_CAPACITY: usize = 4096;

/// How a simulated peer answers an outbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerBehavior {
    /// Accept; the remote end is kept for [`SimulatedRadio::take_remote`].
    Accept,
    /// Accept and echo every byte back.
    Echo,
    /// Refuse the connection.
    Refuse,
    /// Never answer; the attempt holds its socket until cancelled.
    Hang,
    /// Fault inside the radio stack.
    Panic,
}

/// Counts a held resource for as long as it lives.
struct Lease(Arc<AtomicUsize>);

impl Lease {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Local end of a simulated connection.
struct SimChannel {
    stream: DuplexStream,
    _lease: Lease,
}

impl AsyncRead for SimChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for SimChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[derive(Default)]
struct SimState {
    nearby: Vec<Device>,
    bonded: Vec<Device>,
    peers: HashMap<String, PeerBehavior>,
    remotes: HashMap<String, DuplexStream>,
}

struct SimInner {
    powered: AtomicBool,
    state: Mutex<SimState>,
    sightings: broadcast::Sender<Device>,
    inbound_tx: mpsc::UnboundedSender<(DuplexStream, String)>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(DuplexStream, String)>>,
    open_sockets: Arc<AtomicUsize>,
    active_scans: Arc<AtomicUsize>,
    connect_attempts: AtomicUsize,
}

/// A simulated adapter. Clones share the same radio.
#[derive(Clone)]
pub struct SimulatedRadio {
    inner: Arc<SimInner>,
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRadio {
    /// Create a powered radio with nothing nearby.
    pub fn new() -> Self {
        let (sightings, _) = broadcast::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(SimInner {
                powered: AtomicBool::new(true),
                state: Mutex::new(SimState::default()),
                sightings,
                inbound_tx,
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
                open_sockets: Arc::new(AtomicUsize::new(0)),
                active_scans: Arc::new(AtomicUsize::new(0)),
                connect_attempts: AtomicUsize::new(0),
            }),
        }
    }

    /// Turn the adapter on or off.
    pub fn set_powered(&self, powered: bool) {
        self.inner.powered.store(powered, Ordering::SeqCst);
        info!("Simulated adapter powered {}", if powered { "on" } else { "off" });
    }

    /// Make a device visible to current and future scans.
    pub fn announce(&self, device: Device) {
        let mut state = self.inner.state.lock();
        match state.nearby.iter_mut().find(|d| d.same_peer(&device)) {
            Some(known) => *known = device.clone(),
            None => state.nearby.push(device.clone()),
        }
        // No receivers just means nobody is scanning.
        let _ = self.inner.sightings.send(device);
    }

    /// Make a device connectable with the given behaviour.
    pub fn add_peer(&self, device: Device, behavior: PeerBehavior) {
        self.inner
            .state
            .lock()
            .peers
            .insert(device.address, behavior);
    }

    /// Bond the adapter with a device.
    pub fn pair(&self, device: Device) {
        let mut state = self.inner.state.lock();
        if !state.bonded.iter().any(|d| d.same_peer(&device)) {
            state.bonded.push(Device::paired(device.address, device.name));
        }
    }

    /// Remote end of the last accepted outbound connection to `address`.
    pub fn take_remote(&self, address: &str) -> Option<DuplexStream> {
        self.inner.state.lock().remotes.remove(address)
    }

    /// Simulate `device` connecting to our listener.
    ///
    /// Returns the remote end; the connection is queued until accepted.
    pub fn dial_in(&self, device: &Device) -> DuplexStream {
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let _ = self.inner.inbound_tx.send((local, device.address.clone()));
        remote
    }

    /// Sockets currently held open (listeners, pending and open channels).
    pub fn open_sockets(&self) -> usize {
        self.inner.open_sockets.load(Ordering::SeqCst)
    }

    /// Scans whose device stream is still alive.
    pub fn active_scans(&self) -> usize {
        self.inner.active_scans.load(Ordering::SeqCst)
    }

    /// Outbound connection attempts that reached the radio.
    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    fn ensure_powered(&self) -> Result<(), BluetoothError> {
        if self.inner.powered.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BluetoothError::RadioUnavailable(
                "Bluetooth adapter is turned off".to_string(),
            ))
        }
    }

    fn open_channel(&self, stream: DuplexStream) -> BoxedChannel {
        Box::new(SimChannel {
            stream,
            _lease: Lease::acquire(&self.inner.open_sockets),
        })
    }
}

#[async_trait]
impl DiscoveryProvider for SimulatedRadio {
    async fn discover(&self) -> Result<BoxStream<'static, Device>, BluetoothError> {
        self.ensure_powered()?;

        let scan = Lease::acquire(&self.inner.active_scans);
        let (nearby, rx) = {
            let state = self.inner.state.lock();
            (state.nearby.clone(), self.inner.sightings.subscribe())
        };
        debug!("Simulated scan started with {} nearby devices", nearby.len());

        let live = stream::unfold((rx, scan), |(mut rx, scan)| async move {
            loop {
                match rx.recv().await {
                    Ok(device) => return Some((device, (rx, scan))),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream::iter(nearby).chain(live).boxed())
    }

    async fn paired_devices(&self) -> Result<Vec<Device>, BluetoothError> {
        self.ensure_powered()?;
        Ok(self.inner.state.lock().bonded.clone())
    }
}

#[async_trait]
impl Transport for SimulatedRadio {
    async fn connect(&self, address: &str) -> Result<BoxedChannel, BluetoothError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.ensure_powered()?;

        let behavior = self.inner.state.lock().peers.get(address).copied();
        match behavior {
            None => Err(BluetoothError::ConnectFailed(format!(
                "{} is not in range",
                address
            ))),
            Some(PeerBehavior::Refuse) => Err(BluetoothError::ConnectFailed(format!(
                "{} refused the connection",
                address
            ))),
            Some(PeerBehavior::Hang) => {
                let _socket = Lease::acquire(&self.inner.open_sockets);
                std::future::pending().await
            }
            Some(PeerBehavior::Panic) => {
                panic!("simulated radio fault while connecting to {}", address)
            }
            Some(PeerBehavior::Accept) => {
                let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
                self.inner
                    .state
                    .lock()
                    .remotes
                    .insert(address.to_string(), remote);
                Ok(self.open_channel(local))
            }
            Some(PeerBehavior::Echo) => {
                let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
                tokio::spawn(async move {
                    let (mut reader, mut writer) = tokio::io::split(remote);
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
                Ok(self.open_channel(local))
            }
        }
    }

    async fn accept(&self) -> Result<(BoxedChannel, String), BluetoothError> {
        self.ensure_powered()?;

        let _listener = Lease::acquire(&self.inner.open_sockets);
        let mut inbound = self.inner.inbound_rx.lock().await;
        match inbound.recv().await {
            Some((local, peer)) => Ok((self.open_channel(local), peer)),
            None => Err(BluetoothError::RadioUnavailable(
                "simulated listener closed".to_string(),
            )),
        }
    }
}

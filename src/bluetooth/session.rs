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

//! Connection attempts and the single active connection.
//!
//! An attempt is a cold stream of [`ConnectionLifecycleEvent`]s: nothing
//! touches the radio until the stream is first polled. Once the channel is
//! open the stream keeps relaying bytes between the transport and the
//! application's [`PeerLink`] and reports a dropped peer as a final
//! `Failed` event. Dropping the stream releases the transport.

use futures::stream::{self, BoxStream, Stream, StreamExt};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::device::Device;
use super::machine::ConnectionRole;
use super::transport::{BoxedChannel, Permission, PermissionGate, Transport};
use super::BluetoothError;
use crate::config::SessionConfig;

/// Lifecycle events of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionLifecycleEvent {
    /// The channel is open; emitted at most once per attempt.
    Established,
    /// The attempt failed or the open channel was lost. Always the last event.
    Failed(BluetoothError),
}

impl ConnectionLifecycleEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionLifecycleEvent::Failed(_))
    }
}

/// Application side of an established connection.
///
/// Bytes are relayed as-is; framing is up to the application.
pub struct PeerLink {
    outgoing: mpsc::Sender<Vec<u8>>,
    incoming: mpsc::Receiver<Vec<u8>>,
}

impl PeerLink {
    /// Queue bytes for the peer.
    pub async fn send(&self, bytes: impl Into<Vec<u8>>) -> Result<(), BluetoothError> {
        self.outgoing
            .send(bytes.into())
            .await
            .map_err(|_| BluetoothError::TransportClosed("link is closed".to_string()))
    }

    /// Next chunk of bytes from the peer, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.incoming.recv().await
    }

    /// A sender that can be moved to another task.
    pub fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.outgoing.clone()
    }
}

/// Transport-side ends of a [`PeerLink`].
struct LinkEnds {
    outgoing: mpsc::Receiver<Vec<u8>>,
    incoming: mpsc::Sender<Vec<u8>>,
}

fn link_pair(capacity: usize) -> (PeerLink, LinkEnds) {
    let (outgoing_tx, outgoing_rx) = mpsc::channel(capacity);
    let (incoming_tx, incoming_rx) = mpsc::channel(capacity);
    (
        PeerLink {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        },
        LinkEnds {
            outgoing: outgoing_rx,
            incoming: incoming_tx,
        },
    )
}

/// Owns an open transport channel; dropping it closes the channel.
struct ChannelGuard {
    channel: BoxedChannel,
    peer: String,
}

impl ChannelGuard {
    fn new(channel: BoxedChannel, peer: String) -> Self {
        debug!("Acquired transport to {}", peer);
        Self { channel, peer }
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        debug!("Released transport to {}", self.peer);
    }
}

enum Target {
    Device(Device),
    AnyPeer,
}

enum Phase {
    Pending { target: Target, ends: LinkEnds },
    Open { guard: ChannelGuard, ends: LinkEnds },
    Done,
}

/// Everything an attempt needs to reach the radio.
struct AttemptContext {
    transport: Arc<dyn Transport>,
    permissions: Arc<dyn PermissionGate>,
    read_buffer_size: usize,
}

impl AttemptContext {
    async fn open(&self, target: &Target) -> Result<ChannelGuard, BluetoothError> {
        self.permissions.check(Permission::Connect)?;

        match target {
            Target::Device(device) => {
                info!(
                    "Connecting to device: {} ({})",
                    device.display_name(),
                    device.address
                );
                let channel = self.transport.connect(&device.address).await?;
                Ok(ChannelGuard::new(channel, device.address.clone()))
            }
            Target::AnyPeer => {
                info!("Waiting for incoming connection...");
                let (channel, peer) = self.transport.accept().await?;
                info!("Connection from: {}", peer);
                Ok(ChannelGuard::new(channel, peer))
            }
        }
    }

    async fn step(&self, phase: Phase) -> Option<(ConnectionLifecycleEvent, Phase)> {
        match phase {
            Phase::Pending { target, ends } => match self.open(&target).await {
                Ok(guard) => {
                    info!("Connection established with {}", guard.peer);
                    Some((ConnectionLifecycleEvent::Established, Phase::Open { guard, ends }))
                }
                Err(e) => {
                    warn!("Connection attempt failed: {}", e);
                    Some((ConnectionLifecycleEvent::Failed(e), Phase::Done))
                }
            },
            Phase::Open { guard, ends } => {
                let error = relay(guard, ends, self.read_buffer_size).await;
                Some((ConnectionLifecycleEvent::Failed(error), Phase::Done))
            }
            Phase::Done => None,
        }
    }
}

/// Shuttle bytes until the channel fails; the guard is dropped on return.
async fn relay(mut guard: ChannelGuard, mut ends: LinkEnds, buffer_size: usize) -> BluetoothError {
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut outgoing_open = true;

    loop {
        tokio::select! {
            read = guard.channel.read(&mut buf) => match read {
                Ok(0) => {
                    info!("Connection closed by remote: {}", guard.peer);
                    return BluetoothError::TransportClosed(
                        "remote device closed the connection".to_string(),
                    );
                }
                Ok(n) => {
                    debug!("Received {} bytes from {}", n, guard.peer);
                    // Never wait on the application; reads must keep going to see EOF.
                    match ends.incoming.try_send(buf[..n].to_vec()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!("Link to {} is full; dropping {} bytes", guard.peer, n);
                        }
                        Err(TrySendError::Closed(_)) => {
                            debug!("No application link; dropping {} bytes", n);
                        }
                    }
                }
                Err(e) => {
                    error!("Read error: {}", e);
                    return BluetoothError::TransportClosed(e.to_string());
                }
            },
            message = ends.outgoing.recv(), if outgoing_open => match message {
                Some(bytes) => {
                    let written = async {
                        guard.channel.write_all(&bytes).await?;
                        guard.channel.flush().await
                    };
                    if let Err(e) = written.await {
                        error!("Write error: {}", e);
                        return BluetoothError::TransportClosed(e.to_string());
                    }
                    debug!("Sent {} bytes to {}", bytes.len(), guard.peer);
                }
                None => outgoing_open = false,
            },
        }
    }
}

/// Cold, single-subscriber stream of lifecycle events for one attempt.
pub struct ConnectionEvents {
    role: ConnectionRole,
    inner: BoxStream<'static, ConnectionLifecycleEvent>,
}

impl ConnectionEvents {
    fn new(context: Arc<AttemptContext>, target: Target, ends: LinkEnds) -> Self {
        let role = match target {
            Target::Device(_) => ConnectionRole::Client,
            Target::AnyPeer => ConnectionRole::Server,
        };
        let inner = stream::unfold(Phase::Pending { target, ends }, move |phase| {
            let context = Arc::clone(&context);
            async move { context.step(phase).await }
        })
        .boxed();

        Self { role, inner }
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }
}

impl Stream for ConnectionEvents {
    type Item = ConnectionLifecycleEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Creates attempts and owns the one currently subscribed.
pub struct ConnectionSession {
    context: Arc<AttemptContext>,
    link_capacity: usize,
    active: Option<JoinHandle<()>>,
    released: bool,
}

impl ConnectionSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        permissions: Arc<dyn PermissionGate>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            context: Arc::new(AttemptContext {
                transport,
                permissions,
                read_buffer_size: config.read_buffer_size,
            }),
            link_capacity: config.link_buffer.max(1),
            active: None,
            released: false,
        }
    }

    /// Prepare an outbound connection to `device`.
    pub fn connect_to_device(&self, device: &Device) -> (ConnectionEvents, PeerLink) {
        let (link, ends) = link_pair(self.link_capacity);
        let events = ConnectionEvents::new(
            Arc::clone(&self.context),
            Target::Device(device.clone()),
            ends,
        );
        (events, link)
    }

    /// Prepare a one-shot listener for a single inbound peer.
    pub fn listen_for_connection(&self) -> (ConnectionEvents, PeerLink) {
        let (link, ends) = link_pair(self.link_capacity);
        let events = ConnectionEvents::new(Arc::clone(&self.context), Target::AnyPeer, ends);
        (events, link)
    }

    /// Drive `events` on a background task, feeding every event to `sink`.
    ///
    /// Any previously subscribed attempt is cancelled first. A panic while
    /// polling the attempt is reported to `sink` as a lost connection.
    pub async fn subscribe<F>(
        &mut self,
        events: ConnectionEvents,
        mut sink: F,
    ) -> Result<(), BluetoothError>
    where
        F: FnMut(ConnectionLifecycleEvent) + Send + 'static,
    {
        if self.released {
            return Err(BluetoothError::Released);
        }
        self.close_connection().await;

        debug!("Subscribing to {:?} connection attempt", events.role());
        let handle = tokio::spawn(async move {
            let mut events = events;
            loop {
                match AssertUnwindSafe(events.next()).catch_unwind().await {
                    Ok(Some(event)) => {
                        let terminal = event.is_terminal();
                        sink(event);
                        if terminal {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        error!("Connection task panicked");
                        drop(events);
                        sink(ConnectionLifecycleEvent::Failed(
                            BluetoothError::TransportClosed(
                                "connection failed unexpectedly".to_string(),
                            ),
                        ));
                        break;
                    }
                }
            }
        });
        self.active = Some(handle);
        Ok(())
    }

    /// Whether an attempt or connection is still being driven.
    pub fn is_active(&self) -> bool {
        self.active.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Cancel the active attempt and release its transport.
    ///
    /// Returns once the transport is closed. Safe to call with nothing active.
    pub async fn close_connection(&mut self) {
        if let Some(handle) = self.active.take() {
            handle.abort();
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => debug!("Connection task cancelled"),
                Err(e) => error!("Connection task failed: {}", e),
            }
            info!("Connection closed");
        }
    }

    /// Tear down everything; the session cannot be used afterwards.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.close_connection().await;
        self.released = true;
        info!("Connection session released");
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if let Some(handle) = self.active.take() {
            handle.abort();
        }
    }
}

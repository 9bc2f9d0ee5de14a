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

//! Controller facade consumed by presentation code.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::device::Device;
use super::discovery::DiscoverySession;
use super::machine::{AttemptId, ConnectionRole, SessionMachine, SessionState, Transition};
use super::registry::DeviceRegistry;
use super::session::{ConnectionEvents, ConnectionLifecycleEvent, ConnectionSession, PeerLink};
use super::transport::{DiscoveryProvider, GrantAll, PermissionGate, Transport};
use super::BluetoothError;
use crate::config::SessionConfig;
use crate::state::UiState;

struct Inner {
    registry: DeviceRegistry,
    discovery: tokio::sync::Mutex<DiscoverySession>,
    session: tokio::sync::Mutex<ConnectionSession>,
    machine: Mutex<SessionMachine>,
    link: Mutex<Option<PeerLink>>,
    state_tx: watch::Sender<SessionState>,
    connected_tx: watch::Sender<bool>,
    error_tx: watch::Sender<Option<String>>,
    ui_tx: Arc<watch::Sender<UiState>>,
    combiner: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl Inner {
    fn publish(&self, machine: &SessionMachine) {
        let state = machine.state();
        self.state_tx.send_replace(state);
        self.connected_tx.send_if_modified(|connected| {
            let changed = *connected != state.is_connected();
            *connected = state.is_connected();
            changed
        });
    }

    fn report(&self, error: &BluetoothError) {
        if error.is_user_facing() {
            self.error_tx.send_replace(Some(error.to_string()));
        }
    }

    fn clear_error(&self) {
        self.error_tx.send_if_modified(|message| message.take().is_some());
    }

    fn on_event(&self, attempt: AttemptId, event: ConnectionLifecycleEvent) {
        let mut machine = self.machine.lock();
        match machine.apply(attempt, &event) {
            Transition::Stale => debug!("Ignoring {:?} from superseded attempt", event),
            Transition::Connected => {
                info!("Peer connected");
                self.clear_error();
                self.publish(&machine);
            }
            Transition::Failed(error) => {
                warn!("Connection ended: {}", error);
                self.link.lock().take();
                self.report(&error);
                self.publish(&machine);
            }
        }
    }
}

/// Single entry point for discovery and the one peer connection.
///
/// Cheap to clone; clones share the same controller. Must be created inside
/// a Tokio runtime.
#[derive(Clone)]
pub struct PeerController {
    inner: Arc<Inner>,
}

impl PeerController {
    /// Create a controller over a radio that provides both discovery and transport.
    pub fn new<R>(radio: Arc<R>, config: &SessionConfig) -> Self
    where
        R: DiscoveryProvider + Transport + 'static,
    {
        Self::with_permissions(radio.clone(), radio, Arc::new(GrantAll), config)
    }

    pub fn with_permissions(
        provider: Arc<dyn DiscoveryProvider>,
        transport: Arc<dyn Transport>,
        permissions: Arc<dyn PermissionGate>,
        config: &SessionConfig,
    ) -> Self {
        let registry = DeviceRegistry::new();
        let discovery = DiscoverySession::new(provider, permissions.clone(), registry.clone());
        let session = ConnectionSession::new(transport, permissions, config);

        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (connected_tx, _) = watch::channel(false);
        let (error_tx, _) = watch::channel(None);
        let (ui_tx, _) = watch::channel(UiState::default());
        let ui_tx = Arc::new(ui_tx);

        let combiner = spawn_combiner(
            registry.subscribe_scanned(),
            registry.subscribe_paired(),
            state_tx.subscribe(),
            error_tx.subscribe(),
            Arc::clone(&ui_tx),
        );

        Self {
            inner: Arc::new(Inner {
                registry,
                discovery: tokio::sync::Mutex::new(discovery),
                session: tokio::sync::Mutex::new(session),
                machine: Mutex::new(SessionMachine::new()),
                link: Mutex::new(None),
                state_tx,
                connected_tx,
                error_tx,
                ui_tx,
                combiner: Mutex::new(Some(combiner)),
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    pub fn scanned_devices(&self) -> watch::Receiver<Vec<Device>> {
        self.inner.registry.subscribe_scanned()
    }

    pub fn paired_devices(&self) -> watch::Receiver<Vec<Device>> {
        self.inner.registry.subscribe_paired()
    }

    pub fn session_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> watch::Receiver<bool> {
        self.inner.connected_tx.subscribe()
    }

    /// Latest user-facing error; `None` once cleared by a successful connection.
    pub fn errors(&self) -> watch::Receiver<Option<String>> {
        self.inner.error_tx.subscribe()
    }

    /// Combined view of devices, connection flags and the error message.
    pub fn ui_state(&self) -> watch::Receiver<UiState> {
        self.inner.ui_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.inner.machine.lock().state()
    }

    /// Current combined view, computed on the spot.
    pub fn snapshot(&self) -> UiState {
        UiState::compose(
            self.inner.registry.snapshot_scanned(),
            self.inner.registry.snapshot_paired(),
            self.state(),
            self.inner.error_tx.borrow().clone(),
        )
    }

    /// Take the byte link of the current connection attempt.
    pub fn take_link(&self) -> Option<PeerLink> {
        self.inner.link.lock().take()
    }

    /// Connect to `device` as a client.
    ///
    /// Any existing attempt or connection is torn down first and discovery is
    /// stopped. Returns as soon as the attempt is running; the outcome is
    /// published through [`session_state`](Self::session_state) and
    /// [`errors`](Self::errors).
    pub async fn connect_to_device(&self, device: &Device) -> Result<(), BluetoothError> {
        self.ensure_live()?;
        let mut session = self.inner.session.lock().await;
        let (events, link) = session.connect_to_device(device);
        self.begin(&mut session, ConnectionRole::Client, events, link)
            .await
    }

    /// Wait for one inbound peer as a server.
    pub async fn start_bluetooth_server(&self) -> Result<(), BluetoothError> {
        self.ensure_live()?;
        let mut session = self.inner.session.lock().await;
        let (events, link) = session.listen_for_connection();
        self.begin(&mut session, ConnectionRole::Server, events, link)
            .await
    }

    /// Start scanning for nearby devices.
    ///
    /// Refused while connecting or connected; the refusal is also published
    /// on the error channel.
    pub async fn start_discovery(&self) -> Result<(), BluetoothError> {
        self.ensure_live()?;
        let mut discovery = self.inner.discovery.lock().await;

        let state = self.state();
        if state.is_busy() {
            warn!("Refusing to scan while {:?}", state);
            let error = BluetoothError::Busy;
            self.inner.report(&error);
            return Err(error);
        }

        discovery.start().await.map_err(|e| {
            warn!("Failed to start discovery: {}", e);
            self.inner.report(&e);
            e
        })
    }

    pub async fn stop_discovery(&self) {
        self.inner.discovery.lock().await.stop().await;
    }

    /// Reload the bonded device list.
    pub async fn refresh_paired_devices(&self) -> Result<(), BluetoothError> {
        self.ensure_live()?;
        let discovery = self.inner.discovery.lock().await;
        discovery.refresh_paired().await.map_err(|e| {
            self.inner.report(&e);
            e
        })
    }

    /// Cancel any attempt, close the transport and return to idle.
    pub async fn close_connection(&self) {
        let mut session = self.inner.session.lock().await;
        self.teardown(&mut session).await;
    }

    /// Tear down discovery and the connection for good.
    ///
    /// Later calls do nothing; other commands fail with
    /// [`BluetoothError::Released`].
    pub async fn release(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            debug!("Controller already released");
            return;
        }
        info!("Releasing Bluetooth controller");

        {
            let mut session = self.inner.session.lock().await;
            self.teardown(&mut session).await;
            session.release().await;
        }
        self.inner.discovery.lock().await.stop().await;

        if let Some(combiner) = self.inner.combiner.lock().take() {
            combiner.abort();
        }
    }

    fn ensure_live(&self) -> Result<(), BluetoothError> {
        if self.inner.released.load(Ordering::SeqCst) {
            Err(BluetoothError::Released)
        } else {
            Ok(())
        }
    }

    async fn begin(
        &self,
        session: &mut ConnectionSession,
        role: ConnectionRole,
        events: ConnectionEvents,
        link: PeerLink,
    ) -> Result<(), BluetoothError> {
        if self.state() != SessionState::Idle {
            debug!("Replacing current session with a new {:?} attempt", role);
            self.teardown(session).await;
        }

        let attempt = {
            let mut machine = self.inner.machine.lock();
            let attempt = machine.begin_attempt(role);
            self.inner.publish(&machine);
            attempt
        };

        // Scanning and connecting share the radio.
        self.inner.discovery.lock().await.stop().await;

        *self.inner.link.lock() = Some(link);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let subscribed = session
            .subscribe(events, move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_event(attempt, event);
                }
            })
            .await;

        if let Err(e) = subscribed {
            warn!("Could not start {:?} attempt: {}", role, e);
            self.inner.link.lock().take();
            let mut machine = self.inner.machine.lock();
            machine.begin_disconnect();
            machine.finish_disconnect();
            self.inner.publish(&machine);
            return Err(e);
        }
        info!("{:?} connection attempt started", role);
        Ok(())
    }

    async fn teardown(&self, session: &mut ConnectionSession) {
        {
            let mut machine = self.inner.machine.lock();
            machine.begin_disconnect();
            self.inner.publish(&machine);
        }

        session.close_connection().await;
        self.inner.link.lock().take();

        let mut machine = self.inner.machine.lock();
        machine.finish_disconnect();
        self.inner.publish(&machine);
    }
}

/// Recompute the combined view whenever any source changes.
fn spawn_combiner(
    mut scanned: watch::Receiver<Vec<Device>>,
    mut paired: watch::Receiver<Vec<Device>>,
    mut state: watch::Receiver<SessionState>,
    mut errors: watch::Receiver<Option<String>>,
    ui_tx: Arc<watch::Sender<UiState>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = UiState::compose(
                scanned.borrow_and_update().clone(),
                paired.borrow_and_update().clone(),
                *state.borrow_and_update(),
                errors.borrow_and_update().clone(),
            );
            ui_tx.send_if_modified(|current| {
                if *current == next {
                    false
                } else {
                    *current = next;
                    true
                }
            });

            let changed = tokio::select! {
                r = scanned.changed() => r,
                r = paired.changed() => r,
                r = state.changed() => r,
                r = errors.changed() => r,
            };
            if changed.is_err() {
                break;
            }
        }
    })
}

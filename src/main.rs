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

//! Bluetooth Chat console.

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bluetooth_chat::bluetooth::BluetoothError;
use bluetooth_chat::{Config, Device, PeerController};

const HELP: &str = "\
Commands:
  scan              start discovery
  stop              stop discovery
  devices           list scanned and paired devices
  connect <device>  connect to a device by address or name
  listen            wait for one incoming connection
  send <text>       send text to the connected peer
  close             close the connection
  quit              exit";

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(config.logging.filter.parse()?),
        )
        .init();

    info!("Starting Bluetooth Chat v{}...", env!("CARGO_PKG_VERSION"));

    let controller = create_controller(&config).await?;
    if let Err(e) = controller.refresh_paired_devices().await {
        warn!("Could not load paired devices: {}", e);
    }

    let mut ui = controller.ui_state();
    tokio::spawn(async move {
        while ui.changed().await.is_ok() {
            let state = ui.borrow_and_update().clone();
            match &state.error_message {
                Some(message) => println!("[{}] {}", state.status().as_str(), message),
                None => println!(
                    "[{}] {} scanned, {} paired",
                    state.status().as_str(),
                    state.scanned_devices.len(),
                    state.paired_devices.len()
                ),
            }
        }
    });

    println!("{}", HELP);
    let mut outgoing: Option<mpsc::Sender<Vec<u8>>> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_command(&controller, line.trim(), &mut outgoing).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    controller.release().await;
    info!("Bluetooth Chat stopped");
    Ok(())
}

#[cfg(feature = "bluez")]
async fn create_controller(config: &Config) -> Result<PeerController> {
    use bluetooth_chat::bluetooth::bluez::BluezRadio;

    let radio = Arc::new(BluezRadio::new(&config.bluetooth).await?);
    Ok(PeerController::new(radio, &config.session))
}

#[cfg(not(feature = "bluez"))]
async fn create_controller(config: &Config) -> Result<PeerController> {
    use bluetooth_chat::bluetooth::simulated::{PeerBehavior, SimulatedRadio};

    info!("Built without BlueZ support; using a simulated radio");
    let radio = SimulatedRadio::new();
    let peers = [
        ("00:1A:7D:DA:71:01", "Echo Phone", PeerBehavior::Echo),
        ("00:1A:7D:DA:71:02", "Busy Tablet", PeerBehavior::Refuse),
    ];
    for (address, name, behavior) in peers {
        let device = Device::new(address, Some(name.to_string()));
        radio.add_peer(device.clone(), behavior);
        radio.announce(device);
    }
    radio.pair(Device::new(peers[0].0, Some(peers[0].1.to_string())));

    Ok(PeerController::new(Arc::new(radio), &config.session))
}

/// Run one console command. Returns `false` when the user asked to quit.
async fn handle_command(
    controller: &PeerController,
    line: &str,
    outgoing: &mut Option<mpsc::Sender<Vec<u8>>>,
) -> bool {
    let (command, arg) = line
        .split_once(' ')
        .map(|(c, a)| (c, a.trim()))
        .unwrap_or((line, ""));

    let result = match command {
        "" => Ok(()),
        "scan" => controller.start_discovery().await,
        "stop" => {
            controller.stop_discovery().await;
            Ok(())
        }
        "devices" => {
            print_devices(controller);
            Ok(())
        }
        "connect" => {
            let device = find_device(controller, arg);
            let result = controller.connect_to_device(&device).await;
            *outgoing = attach_link(controller);
            result
        }
        "listen" => {
            let result = controller.start_bluetooth_server().await;
            *outgoing = attach_link(controller);
            result
        }
        "send" => match outgoing {
            Some(tx) => tx
                .send(arg.as_bytes().to_vec())
                .await
                .map_err(|_| BluetoothError::TransportClosed("link is closed".to_string())),
            None => {
                println!("Not connected");
                Ok(())
            }
        },
        "close" => {
            controller.close_connection().await;
            *outgoing = None;
            Ok(())
        }
        "quit" | "exit" => return false,
        "help" => {
            println!("{}", HELP);
            Ok(())
        }
        other => {
            println!("Unknown command: {}", other);
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("{} failed: {}", command, e);
    }
    true
}

/// Resolve a device by address or name, falling back to a bare address.
fn find_device(controller: &PeerController, query: &str) -> Device {
    let registry = controller.registry();
    registry
        .snapshot_paired()
        .into_iter()
        .chain(registry.snapshot_scanned())
        .find(|d| {
            d.address.eq_ignore_ascii_case(query)
                || d.name.as_deref().map_or(false, |n| n.eq_ignore_ascii_case(query))
        })
        .unwrap_or_else(|| Device::new(query, None))
}

/// Print incoming bytes of the current attempt and return its sender.
fn attach_link(controller: &PeerController) -> Option<mpsc::Sender<Vec<u8>>> {
    let mut link = controller.take_link()?;
    let sender = link.sender();
    tokio::spawn(async move {
        while let Some(bytes) = link.recv().await {
            println!("< {}", String::from_utf8_lossy(&bytes));
        }
    });
    Some(sender)
}

fn print_devices(controller: &PeerController) {
    let registry = controller.registry();
    println!("Paired devices:");
    for device in registry.snapshot_paired() {
        println!("  {}  {}", device.address, device.display_name());
    }
    println!("Scanned devices:");
    for device in registry.snapshot_scanned() {
        println!("  {}  {}", device.address, device.display_name());
    }
}

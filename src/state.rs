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

//! Presentation state.

use crate::bluetooth::{Device, SessionState};

/// Connection status shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Error => "Error",
        }
    }
}

/// Everything a screen needs to render the device list and connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UiState {
    pub scanned_devices: Vec<Device>,
    pub paired_devices: Vec<Device>,
    pub is_connected: bool,
    pub is_connecting: bool,
    pub error_message: Option<String>,
}

impl UiState {
    /// Merge the controller's current outputs into one view.
    pub fn compose(
        scanned_devices: Vec<Device>,
        paired_devices: Vec<Device>,
        session: SessionState,
        error_message: Option<String>,
    ) -> Self {
        Self {
            scanned_devices,
            paired_devices,
            is_connected: session.is_connected(),
            is_connecting: session.is_connecting(),
            error_message,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        if self.is_connected {
            ConnectionStatus::Connected
        } else if self.is_connecting {
            ConnectionStatus::Connecting
        } else if self.error_message.is_some() {
            ConnectionStatus::Error
        } else {
            ConnectionStatus::Disconnected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::ConnectionRole;

    #[test]
    fn test_compose_derives_flags() {
        let state = UiState::compose(
            vec![Device::new("00:11", None)],
            Vec::new(),
            SessionState::Connecting(ConnectionRole::Client),
            None,
        );
        assert!(state.is_connecting);
        assert!(!state.is_connected);
        assert_eq!(state.status(), ConnectionStatus::Connecting);
        assert_eq!(state.scanned_devices.len(), 1);
    }

    #[test]
    fn test_status_labels() {
        let failed = UiState {
            error_message: Some("Connection failed: refused".to_string()),
            ..UiState::default()
        };
        assert_eq!(failed.status(), ConnectionStatus::Error);
        assert_eq!(failed.status().as_str(), "Error");
        assert_eq!(UiState::default().status().as_str(), "Disconnected");
    }
}

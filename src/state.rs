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

//! Shared connection status.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

/// Connection state as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Error => "Error",
        }
    }
}

/// The device a session is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub address: String,
    pub name: String,
    pub port: u8,
}

/// Status shared between the controller and its observers.
#[derive(Debug)]
pub struct AppState {
    /// Current connection state.
    pub connection_state: RwLock<ConnectionState>,

    /// Device of the current or last attempted session.
    pub device: RwLock<Option<DeviceInfo>>,

    pub last_error: RwLock<Option<String>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            connection_state: RwLock::new(ConnectionState::Disconnected),
            device: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_connecting(&self, device: DeviceInfo) {
        *self.connection_state.write() = ConnectionState::Connecting;
        *self.device.write() = Some(device);
    }

    pub fn set_connected(&self, device: DeviceInfo) {
        *self.connection_state.write() = ConnectionState::Connected;
        *self.device.write() = Some(device);
        *self.last_error.write() = None;
    }

    pub fn set_disconnected(&self) {
        *self.connection_state.write() = ConnectionState::Disconnected;
        *self.device.write() = None;
    }

    pub fn set_error(&self, message: impl Into<String>) {
        *self.connection_state.write() = ConnectionState::Error;
        *self.last_error.write() = Some(message.into());
    }

    pub fn get_state(&self) -> ConnectionState {
        *self.connection_state.read()
    }

    pub fn get_device(&self) -> Option<DeviceInfo> {
        self.device.read().clone()
    }

    pub fn get_last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.get_state() == ConnectionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceInfo {
        DeviceInfo {
            address: "00:11:22:33:44:55".to_string(),
            name: "HC-05".to_string(),
            port: 1,
        }
    }

    #[test]
    fn test_transitions() {
        let state = AppState::new();
        assert_eq!(state.get_state(), ConnectionState::Disconnected);

        state.set_connecting(device());
        assert_eq!(state.get_state(), ConnectionState::Connecting);

        state.set_connected(device());
        assert!(state.is_connected());
        assert_eq!(state.get_device(), Some(device()));

        state.set_disconnected();
        assert_eq!(state.get_device(), None);
        assert!(!state.is_connected());
    }

    #[test]
    fn test_error_kept_until_connected() {
        let state = AppState::new();
        state.set_error("connection refused");
        assert_eq!(state.get_state(), ConnectionState::Error);
        assert_eq!(state.get_last_error().as_deref(), Some("connection refused"));

        state.set_connected(device());
        assert_eq!(state.get_last_error(), None);
    }
}

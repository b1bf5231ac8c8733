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

//! Radio abstraction shared by discovery, inspection and sessions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{ConnectionError, DiagnosisError, DiscoveryError};

/// Name reported for devices whose name could not be resolved.
pub const UNKNOWN_NAME: &str = "unknown";

/// Protocol label for serial-port (RFCOMM) services.
pub const RFCOMM: &str = "RFCOMM";

/// A device found by an inquiry scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Hardware address, e.g. `00:11:22:33:44:55`.
    pub address: String,
    /// Human label, `unknown` when name resolution failed.
    pub name: String,
}

impl DeviceDescriptor {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }
}

/// A service advertised by a remote device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub protocol: String,
    /// RFCOMM channel, present only for connectable serial services.
    pub port: Option<u8>,
    pub host: String,
}

impl ServiceRecord {
    /// A connectable serial-port service on `port`.
    pub fn serial(name: impl Into<String>, port: u8, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol: RFCOMM.to_string(),
            port: Some(port),
            host: host.into(),
        }
    }

    /// A service without a serial port.
    pub fn other(
        name: impl Into<String>,
        protocol: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            protocol: protocol.into(),
            port: None,
            host: host.into(),
        }
    }
}

/// Byte stream to a remote device.
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Channel for T {}

pub type BoxedChannel = Box<dyn Channel>;

/// The Bluetooth radio capability the pipeline runs on.
#[async_trait]
pub trait Radio: Send + Sync {
    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;

    /// Run an inquiry for `duration` and return the addresses seen.
    async fn inquiry(&self, duration: Duration) -> Result<Vec<String>, DiscoveryError>;

    /// Resolve the human name of a device.
    async fn resolve_name(&self, address: &str) -> Result<Option<String>, DiscoveryError>;

    /// Query the advertised service table of a device.
    async fn services(&self, address: &str) -> Result<Vec<ServiceRecord>, DiagnosisError>;

    /// Open a stream channel to `(address, port)`.
    async fn open_channel(&self, address: &str, port: u8)
        -> Result<BoxedChannel, ConnectionError>;
}

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

//! BlueZ radio backend.
//!
//! BlueZ exposes service UUIDs over D-Bus but not the RFCOMM channel from the
//! SDP record, so serial-port services are reported on the configured
//! default channel.

use async_trait::async_trait;
use bluer::rfcomm::{SocketAddr, Stream};
use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::StreamExt;
use std::io::ErrorKind;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::radio::{BoxedChannel, Radio, ServiceRecord};
use crate::error::{ConnectionError, DiagnosisError, DiscoveryError};

/// Bluetooth base UUID, short UUIDs occupy bits 96..128.
const BASE_UUID_LOW: u128 = 0x0000_1000_8000_00805F9B34FB;
const BASE_UUID_MASK: u128 = (1u128 << 96) - 1;

/// Standard SPP UUID.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// Known 16-bit service classes: (short uuid, name, protocol, serial).
const SERVICE_CLASSES: &[(u16, &str, &str, bool)] = &[
    (0x1101, "Serial Port", "RFCOMM", true),
    (0x1103, "Dial-up Networking", "RFCOMM", false),
    (0x1105, "OBEX Object Push", "OBEX", false),
    (0x1106, "OBEX File Transfer", "OBEX", false),
    (0x1108, "Headset", "RFCOMM", false),
    (0x110A, "Audio Source", "L2CAP", false),
    (0x110B, "Audio Sink", "L2CAP", false),
    (0x110C, "A/V Remote Control Target", "L2CAP", false),
    (0x110E, "A/V Remote Control", "L2CAP", false),
    (0x1112, "Headset Audio Gateway", "RFCOMM", false),
    (0x111E, "Handsfree", "RFCOMM", false),
    (0x111F, "Handsfree Audio Gateway", "RFCOMM", false),
    (0x1124, "Human Interface Device", "L2CAP", false),
    (0x112F, "Phonebook Access Server", "OBEX", false),
    (0x1200, "PnP Information", "L2CAP", false),
    (0x1800, "Generic Access", "ATT", false),
    (0x1801, "Generic Attribute", "ATT", false),
    (0x180F, "Battery Service", "ATT", false),
    (0x1812, "Human Interface Device over GATT", "ATT", false),
];

/// Extract the 16-bit short form of a Bluetooth SIG UUID.
fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & BASE_UUID_MASK != BASE_UUID_LOW {
        return None;
    }
    u16::try_from(value >> 96).ok()
}

/// Map an advertised UUID to a service record.
pub fn service_from_uuid(uuid: &Uuid, host: &str, serial_port: u8) -> ServiceRecord {
    let known = short_uuid(uuid)
        .and_then(|short| SERVICE_CLASSES.iter().find(|(id, ..)| *id == short));

    match known {
        Some((_, name, _, true)) => ServiceRecord::serial(*name, serial_port, host),
        Some((_, name, protocol, false)) => ServiceRecord::other(*name, *protocol, host),
        None => ServiceRecord::other(uuid.to_string(), "unknown", host),
    }
}

fn discovery_error(e: bluer::Error) -> DiscoveryError {
    match e.kind {
        bluer::ErrorKind::NotAuthorized => DiscoveryError::PermissionDenied(e.message),
        bluer::ErrorKind::NotReady | bluer::ErrorKind::NotAvailable => {
            DiscoveryError::AdapterUnavailable(e.message)
        }
        _ => DiscoveryError::Radio(e.to_string()),
    }
}

fn connection_error(e: std::io::Error, address: &str, port: u8) -> ConnectionError {
    match e.kind() {
        ErrorKind::ConnectionRefused => {
            ConnectionError::Refused(format!("{} channel {}: {}", address, port, e))
        }
        ErrorKind::TimedOut => {
            ConnectionError::Timeout(format!("{} channel {}: {}", address, port, e))
        }
        _ => ConnectionError::RadioUnavailable(format!("{} channel {}: {}", address, port, e)),
    }
}

/// Radio backed by the system BlueZ daemon.
pub struct BluezRadio {
    _session: Session,
    adapter: Adapter,
    serial_port: u8,
}

impl BluezRadio {
    /// Open a BlueZ session on the default adapter.
    pub async fn new(serial_port: u8) -> Result<Self, DiscoveryError> {
        info!("Initializing BlueZ radio...");

        let session = Session::new().await.map_err(discovery_error)?;
        info!("BlueZ session created");

        let adapter = session.default_adapter().await.map_err(discovery_error)?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        // Ensure adapter is powered on
        if !adapter.is_powered().await.map_err(discovery_error)? {
            info!("Powering on Bluetooth adapter...");
            if let Err(e) = adapter.set_powered(true).await {
                warn!("Could not power on adapter: {}", e);
            }
        }

        Ok(Self {
            _session: session,
            adapter,
            serial_port,
        })
    }
}

fn parse_address(address: &str) -> Result<Address, String> {
    address
        .parse()
        .map_err(|_| format!("invalid address: {}", address))
}

#[async_trait]
impl Radio for BluezRadio {
    fn backend_name(&self) -> &'static str {
        "bluez"
    }

    async fn inquiry(&self, duration: Duration) -> Result<Vec<String>, DiscoveryError> {
        if !self.adapter.is_powered().await.map_err(discovery_error)? {
            return Err(DiscoveryError::AdapterUnavailable(format!(
                "adapter {} is powered off",
                self.adapter.name()
            )));
        }

        let filter = DiscoveryFilter {
            transport: DiscoveryTransport::BrEdr,
            ..Default::default()
        };
        if let Err(e) = self.adapter.set_discovery_filter(filter).await {
            warn!("Could not restrict discovery to BR/EDR: {}", e);
        }

        let events = self.adapter.discover_devices().await.map_err(discovery_error)?;
        futures::pin_mut!(events);

        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        let mut addresses = Vec::new();
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.next() => match event {
                    Some(AdapterEvent::DeviceAdded(addr)) => {
                        debug!("Inquiry result: {}", addr);
                        addresses.push(addr.to_string());
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }

        Ok(addresses)
    }

    async fn resolve_name(&self, address: &str) -> Result<Option<String>, DiscoveryError> {
        let addr = parse_address(address).map_err(DiscoveryError::Radio)?;
        let device = self.adapter.device(addr).map_err(discovery_error)?;
        device.name().await.map_err(discovery_error)
    }

    async fn services(&self, address: &str) -> Result<Vec<ServiceRecord>, DiagnosisError> {
        let addr = parse_address(address).map_err(DiagnosisError)?;
        let device = self
            .adapter
            .device(addr)
            .map_err(|e| DiagnosisError(e.to_string()))?;
        let uuids = device
            .uuids()
            .await
            .map_err(|e| DiagnosisError(e.to_string()))?
            .unwrap_or_default();

        let mut uuids: Vec<Uuid> = uuids.into_iter().collect();
        uuids.sort();

        Ok(uuids
            .iter()
            .map(|uuid| service_from_uuid(uuid, address, self.serial_port))
            .collect())
    }

    async fn open_channel(
        &self,
        address: &str,
        port: u8,
    ) -> Result<BoxedChannel, ConnectionError> {
        let addr = parse_address(address).map_err(ConnectionError::Refused)?;

        debug!("Connecting to RFCOMM socket: {} channel {}", addr, port);
        let stream = Stream::connect(SocketAddr::new(addr, port))
            .await
            .map_err(|e| connection_error(e, address, port))?;

        Ok(Box::new(stream))
    }
}

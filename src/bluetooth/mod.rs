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

//! Bluetooth communication module.
//!
//! Discovery, service inspection and RFCOMM sessions to SPP devices.

mod bluez;
mod connection;
mod discovery;
mod inspector;
mod mock;
mod radio;

pub use bluez::{service_from_uuid, BluezRadio, SPP_UUID};
pub use connection::{
    ConnectionSession, DisconnectReason, SessionEvent, SessionState, DISCONNECT_TIMEOUT,
    READ_CHUNK_SIZE,
};
pub use discovery::DeviceDiscovery;
pub use inspector::{DeviceKind, DiagnosisResult, ServiceInspector};
pub use mock::MockRadio;
pub use radio::{
    BoxedChannel, Channel, DeviceDescriptor, Radio, ServiceRecord, RFCOMM, UNKNOWN_NAME,
};

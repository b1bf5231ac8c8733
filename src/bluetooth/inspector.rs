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

//! RFCOMM compatibility diagnosis.

use serde::Serialize;
use std::fmt::Write;
use std::sync::Arc;
use tracing::{info, warn};

use super::radio::{Radio, ServiceRecord};
use crate::error::DiagnosisError;

/// Likely purpose of a device without a serial port. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceKind {
    AudioSink,
    HumanInterface,
    HandsFree,
    Unknown,
}

impl DeviceKind {
    /// Keyword match over service names.
    pub fn classify(services: &[ServiceRecord]) -> Self {
        let names: Vec<String> = services.iter().map(|s| s.name.to_lowercase()).collect();
        let any = |keywords: &[&str]| {
            names
                .iter()
                .any(|name| keywords.iter().any(|k| name.contains(k)))
        };

        if any(&["audio sink", "a2dp", "speaker", "headphone"]) {
            DeviceKind::AudioSink
        } else if any(&["human interface", "hid", "keyboard", "mouse"]) {
            DeviceKind::HumanInterface
        } else if any(&["handsfree", "hands-free", "headset"]) {
            DeviceKind::HandsFree
        } else {
            DeviceKind::Unknown
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            DeviceKind::AudioSink => "an audio device (speaker or headphones)",
            DeviceKind::HumanInterface => "an input device (keyboard, mouse or controller)",
            DeviceKind::HandsFree => "a hands-free or headset device",
            DeviceKind::Unknown => "a device of unknown type",
        }
    }
}

/// Outcome of a diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosisResult {
    pub compatible: bool,
    pub suggested_port: Option<u8>,
    pub services: Vec<ServiceRecord>,
    pub summary: String,
    pub details: String,
    pub device_kind: Option<DeviceKind>,
    #[serde(skip)]
    pub error: Option<DiagnosisError>,
}

/// Decides whether a device can be used over RFCOMM.
pub struct ServiceInspector {
    radio: Arc<dyn Radio>,
}

impl ServiceInspector {
    pub fn new(radio: Arc<dyn Radio>) -> Self {
        Self { radio }
    }

    /// Query the service table of `address` and classify it.
    pub async fn diagnose(&self, address: &str) -> DiagnosisResult {
        info!("Diagnosing services of {}", address);

        let result = match self.radio.services(address).await {
            Ok(services) => Self::evaluate(address, services),
            Err(e) => {
                warn!("Service query for {} failed: {}", address, e);
                DiagnosisResult {
                    compatible: false,
                    suggested_port: None,
                    services: Vec::new(),
                    summary: "Service query failed".to_string(),
                    details: format!(
                        "The radio could not query the services of {}.\n{}",
                        address, e
                    ),
                    device_kind: None,
                    error: Some(e),
                }
            }
        };

        info!("Diagnosis of {}: {}", address, result.summary);
        result
    }

    /// Apply the compatibility policy to a service table.
    pub fn evaluate(address: &str, services: Vec<ServiceRecord>) -> DiagnosisResult {
        if services.is_empty() {
            return DiagnosisResult {
                compatible: false,
                suggested_port: None,
                services,
                summary: "No services found".to_string(),
                details: format!(
                    "{} did not report any services. The device may not be paired, \
                     may be out of range, or may not publish public services.",
                    address
                ),
                device_kind: None,
                error: None,
            };
        }

        let serial: Vec<&ServiceRecord> = services.iter().filter(|s| s.port.is_some()).collect();

        if let Some(first) = serial.first() {
            let port = first.port;
            let mut details = format!("{} serial port service(s) found:\n", serial.len());
            for service in &serial {
                let _ = writeln!(
                    details,
                    "  - {} ({} port {})",
                    service.name,
                    service.protocol,
                    service.port.unwrap_or_default()
                );
            }
            let _ = write!(details, "Suggested port: {}", port.unwrap_or_default());

            return DiagnosisResult {
                compatible: true,
                suggested_port: port,
                summary: "Compatible serial device".to_string(),
                details,
                services,
                device_kind: None,
                error: None,
            };
        }

        let kind = DeviceKind::classify(&services);
        let mut details = format!(
            "{} service(s) found, none exposes a serial port:\n",
            services.len()
        );
        for service in &services {
            let _ = writeln!(details, "  - {} ({})", service.name, service.protocol);
        }
        let _ = write!(details, "This looks like {}.", kind.description());

        DiagnosisResult {
            compatible: false,
            suggested_port: None,
            summary: "No serial port service".to_string(),
            details,
            services,
            device_kind: Some(kind),
            error: None,
        }
    }
}

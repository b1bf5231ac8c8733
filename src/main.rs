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

//! Headless SPP monitor.

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sppmon::bluetooth::BluezRadio;
use sppmon::data::DecodedRecord;
use sppmon::{Config, ControllerEvent, SessionController};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sppmon=info".parse()?),
        )
        .init();

    info!("Starting sppmon v{}...", env!("CARGO_PKG_VERSION"));

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from(&PathBuf::from(path)),
        None => Config::load()?,
    };
    info!("Configuration loaded (format: {:?})", config.data_format);

    let radio = Arc::new(BluezRadio::new(config.rfcomm_port).await?);
    let controller = SessionController::new(radio, &config);
    let mut events = controller
        .take_event_receiver()
        .ok_or_else(|| anyhow!("event receiver already taken"))?;

    let (address, port) = select_target(&controller, &config).await?;
    controller.connect(&address, port).await?;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => {
                        let finished = link_lost(&event, config.auto_reconnect);
                        log_event(event);
                        if finished {
                            info!("Link lost and auto_reconnect is off, exiting");
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    controller.disconnect().await;

    if config.save_data {
        match controller.export_csv(&config.data_file) {
            Ok(rows) => info!("Saved {} records to {:?}", rows, config.data_file),
            Err(e) => warn!("Could not save data: {}", e),
        }
    }

    info!("sppmon stopped");
    Ok(())
}

/// Pick the device and channel to connect to.
///
/// A configured address wins; otherwise the first compatible device found by
/// a scan is used.
async fn select_target(controller: &SessionController, config: &Config) -> Result<(String, u8)> {
    if let Some(address) = &config.device_address {
        let result = controller.diagnose(address).await;
        let port = result.suggested_port.unwrap_or(config.rfcomm_port);
        if !result.compatible {
            warn!("{}: {}, trying channel {} anyway", address, result.summary, port);
        }
        return Ok((address.clone(), port));
    }

    let devices = controller.scan().await?;
    info!("Found {} device(s)", devices.len());

    for device in devices {
        let result = controller.diagnose(&device.address).await;
        info!("{} ({}): {}", device.name, device.address, result.summary);
        if let Some(port) = result.suggested_port {
            return Ok((device.address, port));
        }
    }

    Err(anyhow!("no device offering a serial port was found"))
}

/// True when the link went down and nothing will bring it back.
fn link_lost(event: &ControllerEvent, auto_reconnect: bool) -> bool {
    !auto_reconnect
        && matches!(
            event,
            ControllerEvent::ConnectionChanged {
                connected: false,
                ..
            }
        )
}

fn log_event(event: ControllerEvent) {
    match event {
        ControllerEvent::ConnectionChanged {
            connected: true,
            device: Some(device),
        } => info!(
            "Connected to {} ({}) on channel {}",
            device.name, device.address, device.port
        ),
        ControllerEvent::ConnectionChanged { connected, .. } => {
            info!("Connection {}", if connected { "up" } else { "down" })
        }
        ControllerEvent::DataReceived(record) => info!("{}", format_record(&record)),
        ControllerEvent::Error { message, category } => {
            error!("{}: {}", category.as_str(), message)
        }
        ControllerEvent::Reconnecting { attempt } => info!("Reconnecting (attempt {})", attempt),
        ControllerEvent::ScanCompleted(devices) => info!("Scan found {} device(s)", devices.len()),
        ControllerEvent::DiagnosisCompleted { address, result } => {
            info!("{}: {}", address, result.summary)
        }
    }
}

fn format_record(record: &DecodedRecord) -> String {
    let fields = record
        .fields
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join(" ");

    match &record.decode_error {
        Some(e) => format!("#{} {} (decode error: {})", record.sequence_number, fields, e),
        None => format!("#{} {}", record.sequence_number, fields),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_lost_only_without_reconnect() {
        let down = ControllerEvent::ConnectionChanged {
            connected: false,
            device: None,
        };
        let up = ControllerEvent::ConnectionChanged {
            connected: true,
            device: None,
        };

        assert!(link_lost(&down, false));
        assert!(!link_lost(&down, true));
        assert!(!link_lost(&up, false));
        assert!(!link_lost(&ControllerEvent::Reconnecting { attempt: 1 }, false));
    }
}

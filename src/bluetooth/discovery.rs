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

//! Inquiry scan with name resolution.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::radio::{DeviceDescriptor, Radio, UNKNOWN_NAME};
use crate::error::DiscoveryError;

/// Finds nearby devices.
pub struct DeviceDiscovery {
    radio: Arc<dyn Radio>,
    name_filter: Option<String>,
}

impl DeviceDiscovery {
    pub fn new(radio: Arc<dyn Radio>) -> Self {
        Self {
            radio,
            name_filter: None,
        }
    }

    /// Only keep devices whose name contains `filter` (case-insensitive).
    pub fn with_name_filter(mut self, filter: Option<String>) -> Self {
        self.name_filter = filter
            .map(|f| f.trim().to_lowercase())
            .filter(|f| !f.is_empty());
        self
    }

    /// Scan for `duration_secs` seconds.
    ///
    /// Blocks for the whole window. An empty neighbourhood is an empty list;
    /// only radio failures are errors. Devices whose name cannot be resolved
    /// are reported as `unknown`.
    pub async fn scan(&self, duration_secs: u64) -> Result<Vec<DeviceDescriptor>, DiscoveryError> {
        let duration = Duration::from_secs(duration_secs.max(1));
        info!(
            "Scanning for devices for {} seconds ({})",
            duration.as_secs(),
            self.radio.backend_name()
        );

        let addresses = self.radio.inquiry(duration).await?;

        let mut devices: Vec<DeviceDescriptor> = Vec::with_capacity(addresses.len());
        for address in addresses {
            if devices.iter().any(|d| d.address == address) {
                continue;
            }

            let name = match self.radio.resolve_name(&address).await {
                Ok(Some(name)) if !name.trim().is_empty() => name,
                Ok(_) => UNKNOWN_NAME.to_string(),
                Err(e) => {
                    debug!("Name lookup for {} failed: {}", address, e);
                    UNKNOWN_NAME.to_string()
                }
            };

            if let Some(filter) = &self.name_filter {
                if !name.to_lowercase().contains(filter.as_str()) {
                    debug!("Skipping {} ({}): filtered out", address, name);
                    continue;
                }
            }

            devices.push(DeviceDescriptor { address, name });
        }

        info!("Found {} devices", devices.len());
        Ok(devices)
    }
}

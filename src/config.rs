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

//! Configuration module.
//!
//! Handles loading and saving application settings. The settings file is a
//! flat JSON object; keys the monitor does not know about (theme, window
//! geometry) are kept as-is so a round trip through `save` never drops them.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Name of the settings file inside the config directory.
pub const CONFIG_FILE: &str = "config.json";

/// Wire format of the data sent by the remote device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    /// Plain text, optionally `key:value` pairs.
    #[default]
    Text,
    /// One JSON object per message.
    Json,
    /// Fixed byte layout described by `binary_fields`.
    Binary,
    /// Short-code tokens such as `T:24.8;H:62.1`.
    Custom,
    /// Anything else; the payload is kept as a single raw text field.
    #[serde(other)]
    Raw,
}

/// One entry of the binary byte-offset table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryField {
    /// Field name in the decoded record.
    pub name: String,
    /// Byte offset inside the chunk.
    pub offset: usize,
    /// Value reported for byte 0x00.
    #[serde(default)]
    pub min: f64,
    /// Value reported for byte 0xFF.
    #[serde(default = "default_binary_max")]
    pub max: f64,
}

fn default_binary_max() -> f64 {
    100.0
}

impl BinaryField {
    pub fn percent(name: impl Into<String>, offset: usize) -> Self {
        Self {
            name: name.into(),
            offset,
            min: 0.0,
            max: default_binary_max(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// File this configuration was loaded from.
    #[serde(skip)]
    pub path: Option<PathBuf>,

    /// Inquiry scan duration in seconds.
    pub scan_timeout: u64,

    /// Upper bound for opening an RFCOMM channel, in seconds.
    pub connect_timeout: u64,

    /// RFCOMM channel used when a diagnosis did not suggest one.
    pub rfcomm_port: u8,

    /// Start a new session when the link drops without a user disconnect.
    pub auto_reconnect: bool,

    /// Seconds between reconnect attempts.
    pub reconnect_interval: u64,

    /// Only report devices whose name contains this text.
    pub device_name_filter: Option<String>,

    /// Connect straight to this address instead of scanning.
    pub device_address: Option<String>,

    /// Number of decoded records kept in memory.
    pub data_buffer_size: usize,

    /// UI refresh period in milliseconds.
    pub update_interval: u64,

    /// Export the history on shutdown.
    pub save_data: bool,

    /// CSV file used when `save_data` is set.
    pub data_file: PathBuf,

    pub data_format: DataFormat,

    /// Message separator used for framing and trimming.
    pub data_separator: String,

    /// Reassemble chunks into separator-delimited messages before decoding.
    pub frame_messages: bool,

    /// Text encoding label (`utf-8`, `latin-1`, `ascii`).
    pub encoding: String,

    /// Token delimiter for the custom format.
    pub custom_delimiter: String,

    /// Short-code to field-name table for the custom format.
    pub custom_fields: BTreeMap<String, String>,

    /// Byte-offset table for the binary format.
    pub binary_fields: Vec<BinaryField>,

    /// Keys owned by the UI layer.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        let custom_fields = [("T", "temperatura"), ("H", "humedad"), ("P", "presion")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let mut extra = Map::new();
        extra.insert("appearance_mode".into(), Value::from("dark"));
        extra.insert("color_theme".into(), Value::from("blue"));
        extra.insert("window_title".into(), Value::from("Monitor Bluetooth"));
        extra.insert("window_width".into(), Value::from(900));
        extra.insert("window_height".into(), Value::from(600));

        Self {
            path: None,
            scan_timeout: 10,
            connect_timeout: 10,
            rfcomm_port: 1,
            auto_reconnect: true,
            reconnect_interval: 5,
            device_name_filter: None,
            device_address: None,
            data_buffer_size: 100,
            update_interval: 100,
            save_data: false,
            data_file: PathBuf::from("bluetooth_data.csv"),
            data_format: DataFormat::Text,
            data_separator: "\n".to_string(),
            frame_messages: false,
            encoding: "utf-8".to_string(),
            custom_delimiter: ";".to_string(),
            custom_fields,
            binary_fields: vec![
                BinaryField::percent("temperatura", 0),
                BinaryField::percent("humedad", 1),
            ],
            extra,
        }
    }
}

impl Config {
    /// Directory holding the settings file.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sppmon")
    }

    /// Load configuration from the user config directory, creating a default
    /// file on first start.
    pub fn load() -> Result<Self> {
        let config_dir = Self::config_dir();
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            let mut config = Self::default();
            config.path = Some(config_path);
            if let Err(e) = config.save() {
                warn!("Could not write default configuration: {}", e);
            }
            return Ok(config);
        }

        Ok(Self::load_from(&config_path))
    }

    /// Load configuration from an explicit path.
    ///
    /// A missing file yields the defaults; a malformed one is logged and
    /// also yields the defaults.
    pub fn load_from(path: &Path) -> Self {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Config>(&content) {
                Ok(config) => {
                    info!("Configuration loaded from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Malformed configuration {:?}: {}; using defaults", path, e);
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!("Cannot read configuration {:?}: {}; using defaults", path, e);
                Self::default()
            }
        };

        config.path = Some(path.to_path_buf());
        config.sanitize();
        config
    }

    /// Restore UI keys the file does not mention.
    fn merge_default_extras(&mut self) {
        for (key, value) in Self::default().extra {
            self.extra.entry(key).or_insert(value);
        }
    }

    /// Save configuration to the file it was loaded from.
    pub fn save(&self) -> Result<()> {
        let config_path = match &self.path {
            Some(path) => path.clone(),
            None => Self::config_dir().join(CONFIG_FILE),
        };

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        info!("Configuration saved to {:?}", config_path);

        Ok(())
    }

    /// Clamp values that would make the pipeline unusable.
    fn sanitize(&mut self) {
        self.merge_default_extras();
        if self.data_buffer_size == 0 {
            warn!("data_buffer_size must be positive, using 1");
            self.data_buffer_size = 1;
        }
        if self.scan_timeout == 0 {
            warn!("scan_timeout must be positive, using 1");
            self.scan_timeout = 1;
        }
        if self.custom_delimiter.is_empty() {
            self.custom_delimiter = ";".to_string();
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout.max(1))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval.max(1))
    }
}

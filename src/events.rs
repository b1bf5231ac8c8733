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

//! Event processing between a session and the outside world.

use chrono::Local;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tracing::{debug, error, info, warn};

use crate::bluetooth::{DeviceDescriptor, DiagnosisResult, DisconnectReason, SessionEvent};
use crate::data::{DecodedRecord, FrameSplitter, RecordDecoder};
use crate::error::ErrorCategory;
use crate::state::{AppState, DeviceInfo};
use crate::storage::HistoryBuffer;

/// Events published by the controller.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// Link came up or went down.
    ConnectionChanged {
        connected: bool,
        device: Option<DeviceInfo>,
    },
    /// One decoded record, in receive order.
    DataReceived(DecodedRecord),
    Error {
        message: String,
        category: ErrorCategory,
    },
    ScanCompleted(Vec<DeviceDescriptor>),
    DiagnosisCompleted {
        address: String,
        result: DiagnosisResult,
    },
    /// The reconnect supervisor is about to try again.
    Reconnecting { attempt: u32 },
}

impl ControllerEvent {
    pub fn error(message: impl Into<String>, category: ErrorCategory) -> Self {
        ControllerEvent::Error {
            message: message.into(),
            category,
        }
    }
}

/// How long a publish waits for room in the controller channel.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Publish an event. A consumer that stops draining loses events after
/// `PUBLISH_TIMEOUT` instead of stalling the pipeline.
pub(crate) async fn publish(tx: &mpsc::Sender<ControllerEvent>, event: ControllerEvent) {
    match tx.send_timeout(event, PUBLISH_TIMEOUT).await {
        Ok(()) => {}
        Err(SendTimeoutError::Timeout(_)) => {
            warn!("Controller event consumer is not draining, event dropped")
        }
        Err(SendTimeoutError::Closed(_)) => debug!("No controller event consumer"),
    }
}

/// Turns the events of one session into records and controller events.
pub struct EventPump {
    decoder: RecordDecoder,
    framer: Option<FrameSplitter>,
    history: Arc<RwLock<HistoryBuffer>>,
    status: Arc<AppState>,
    device: DeviceInfo,
    out_tx: mpsc::Sender<ControllerEvent>,
}

impl EventPump {
    pub fn new(
        decoder: RecordDecoder,
        history: Arc<RwLock<HistoryBuffer>>,
        status: Arc<AppState>,
        device: DeviceInfo,
        out_tx: mpsc::Sender<ControllerEvent>,
    ) -> Self {
        Self {
            decoder,
            framer: None,
            history,
            status,
            device,
            out_tx,
        }
    }

    /// Reassemble chunks into messages on `separator` before decoding.
    pub fn with_framing(mut self, separator: &str) -> Self {
        self.framer = Some(FrameSplitter::new(separator));
        self
    }

    /// Process a single event.
    ///
    /// Returns the reason once the session has ended.
    pub async fn process_event(&mut self, event: SessionEvent) -> Option<DisconnectReason> {
        match event {
            SessionEvent::Connected { address, port } => {
                info!("Device connected: {} channel {}", address, port);
                self.device.port = port;
                self.status.set_connected(self.device.clone());
                publish(
                    &self.out_tx,
                    ControllerEvent::ConnectionChanged {
                        connected: true,
                        device: Some(self.device.clone()),
                    },
                )
                .await;
                None
            }
            SessionEvent::Chunk(bytes) => {
                match self.framer.as_mut() {
                    Some(framer) => {
                        for frame in framer.push(&bytes) {
                            self.record(frame).await;
                        }
                    }
                    None => self.record(bytes).await,
                }
                None
            }
            SessionEvent::Disconnected { reason } => {
                if let Some(rest) = self.framer.as_mut().and_then(FrameSplitter::flush) {
                    debug!("Recording {} unterminated bytes", rest.len());
                    self.record(rest).await;
                }

                self.status.set_disconnected();
                publish(
                    &self.out_tx,
                    ControllerEvent::ConnectionChanged {
                        connected: false,
                        device: None,
                    },
                )
                .await;

                match &reason {
                    DisconnectReason::Requested => info!("Device disconnected"),
                    DisconnectReason::RemoteClosed => info!("Device closed the connection"),
                    DisconnectReason::ChannelError(e) => {
                        error!("Connection error: {}", e);
                        self.status.set_error(e.clone());
                        publish(
                            &self.out_tx,
                            ControllerEvent::error(
                                format!("connection to {} lost: {}", self.device.address, e),
                                ErrorCategory::Connection,
                            ),
                        )
                        .await;
                    }
                }
                Some(reason)
            }
        }
    }

    async fn record(&mut self, bytes: Vec<u8>) {
        let decoded = self.decoder.decode(&bytes);
        if let Some(e) = &decoded.decode_error {
            warn!("Could not fully decode {} bytes: {}", bytes.len(), e);
        }

        let record = self.history.write().append(Local::now(), bytes, decoded);
        debug!("Record #{} stored", record.sequence_number);
        publish(&self.out_tx, ControllerEvent::DataReceived(record)).await;
    }
}

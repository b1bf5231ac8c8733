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

//! In-memory radio for tests and offline runs.
//!
//! Every successful `open_channel` creates a `tokio::io::duplex` pair; the
//! session gets one end and the other is queued as the "remote device" for
//! the test to drive.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Mutex};

use super::radio::{BoxedChannel, Radio, ServiceRecord};
use crate::error::{ConnectionError, DiagnosisError, DiscoveryError};

const DUPLEX_BUFFER: usize = 8 * 1024;

#[derive(Debug, Clone)]
struct MockDevice {
    address: String,
    name: Option<String>,
}

/// Channel whose reads always fail, as after a link reset.
struct BrokenChannel {
    message: String,
}

impl AsyncRead for BrokenChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            self.message.clone(),
        )))
    }
}

impl AsyncWrite for BrokenChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Scriptable radio.
pub struct MockRadio {
    devices: Vec<MockDevice>,
    services: HashMap<String, Result<Vec<ServiceRecord>, DiagnosisError>>,
    inquiry_error: Option<DiscoveryError>,
    connect_error: Option<ConnectionError>,
    connect_delay: Option<Duration>,
    read_error: Option<String>,
    connect_attempts: AtomicUsize,
    remote_tx: mpsc::UnboundedSender<DuplexStream>,
    remote_rx: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRadio {
    pub fn new() -> Self {
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        Self {
            devices: Vec::new(),
            services: HashMap::new(),
            inquiry_error: None,
            connect_error: None,
            connect_delay: None,
            read_error: None,
            connect_attempts: AtomicUsize::new(0),
            remote_tx,
            remote_rx: Mutex::new(remote_rx),
        }
    }

    /// A radio with one SPP sensor and one headset in range.
    pub fn with_sample_data() -> Self {
        Self::new()
            .with_device("00:11:22:33:44:55", "HC-05")
            .with_services(
                "00:11:22:33:44:55",
                vec![ServiceRecord::serial("Serial Port", 1, "00:11:22:33:44:55")],
            )
            .with_device("AA:BB:CC:DD:EE:FF", "Headphones")
            .with_services(
                "AA:BB:CC:DD:EE:FF",
                vec![
                    ServiceRecord::other("Audio Sink", "L2CAP", "AA:BB:CC:DD:EE:FF"),
                    ServiceRecord::other("Handsfree", "RFCOMM", "AA:BB:CC:DD:EE:FF"),
                ],
            )
    }

    pub fn with_device(mut self, address: &str, name: &str) -> Self {
        self.devices.push(MockDevice {
            address: address.to_string(),
            name: Some(name.to_string()),
        });
        self
    }

    /// A device whose name lookup fails.
    pub fn with_unnamed_device(mut self, address: &str) -> Self {
        self.devices.push(MockDevice {
            address: address.to_string(),
            name: None,
        });
        self
    }

    pub fn with_services(mut self, address: &str, services: Vec<ServiceRecord>) -> Self {
        self.services.insert(address.to_string(), Ok(services));
        self
    }

    pub fn with_service_error(mut self, address: &str, message: &str) -> Self {
        self.services
            .insert(address.to_string(), Err(DiagnosisError(message.to_string())));
        self
    }

    pub fn with_inquiry_error(mut self, error: DiscoveryError) -> Self {
        self.inquiry_error = Some(error);
        self
    }

    pub fn with_connect_error(mut self, error: ConnectionError) -> Self {
        self.connect_error = Some(error);
        self
    }

    /// Delay every connect; used to observe the `Connecting` state.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Open channels that fail on the first read with `message`.
    pub fn with_read_error(mut self, message: &str) -> Self {
        self.read_error = Some(message.to_string());
        self
    }

    /// Number of `open_channel` calls so far.
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Wait for the remote end of the next opened channel.
    pub async fn next_remote(&self) -> Option<DuplexStream> {
        self.remote_rx.lock().await.recv().await
    }
}

#[async_trait]
impl Radio for MockRadio {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    async fn inquiry(&self, _duration: Duration) -> Result<Vec<String>, DiscoveryError> {
        if let Some(e) = &self.inquiry_error {
            return Err(e.clone());
        }
        Ok(self.devices.iter().map(|d| d.address.clone()).collect())
    }

    async fn resolve_name(&self, address: &str) -> Result<Option<String>, DiscoveryError> {
        match self.devices.iter().find(|d| d.address == address) {
            Some(MockDevice { name: Some(name), .. }) => Ok(Some(name.clone())),
            Some(_) => Err(DiscoveryError::Radio(format!(
                "name request to {} timed out",
                address
            ))),
            None => Ok(None),
        }
    }

    async fn services(&self, address: &str) -> Result<Vec<ServiceRecord>, DiagnosisError> {
        self.services
            .get(address)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn open_channel(
        &self,
        address: &str,
        _port: u8,
    ) -> Result<BoxedChannel, ConnectionError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = &self.connect_error {
            return Err(e.clone());
        }
        if !self.devices.iter().any(|d| d.address == address) {
            return Err(ConnectionError::Timeout(format!("{} not in range", address)));
        }

        if let Some(message) = &self.read_error {
            return Ok(Box::new(BrokenChannel {
                message: message.clone(),
            }));
        }

        let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
        self.remote_tx
            .send(remote)
            .map_err(|_| ConnectionError::RadioUnavailable("mock radio closed".into()))?;
        Ok(Box::new(local))
    }
}

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

//! Orchestration of discovery, diagnosis and the active session.
//!
//! The controller owns at most one [`ConnectionSession`]. Each session gets
//! an event pump task that decodes its chunks into the shared history and
//! republishes everything as [`ControllerEvent`]s on a single channel.

use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bluetooth::{
    ConnectionSession, DeviceDescriptor, DeviceDiscovery, DiagnosisResult, DisconnectReason,
    Radio, ServiceInspector, SessionEvent, SessionState, DISCONNECT_TIMEOUT, UNKNOWN_NAME,
};
use crate::config::Config;
use crate::data::{DecodedRecord, RecordDecoder};
use crate::error::{ControllerError, DiscoveryError, ErrorCategory, ExportError, SessionError};
use crate::events::{publish, ControllerEvent, EventPump};
use crate::state::{AppState, ConnectionState, DeviceInfo};
use crate::storage::HistoryBuffer;

/// Capacity of the controller event channel.
const EVENT_BUFFER: usize = 256;

/// Capacity of each session's event channel.
const SESSION_EVENT_BUFFER: usize = 64;

/// Reconnect behaviour after a link is lost.
#[derive(Debug, Clone, Copy)]
struct ReconnectPolicy {
    enabled: bool,
    interval: Duration,
}

struct ActiveSession {
    session: Arc<ConnectionSession>,
    pump: JoinHandle<()>,
    device: DeviceInfo,
}

impl ActiveSession {
    /// Drop the session and wait for its pump to drain.
    async fn retire(self) {
        drop(self.session);
        let mut pump = self.pump;
        if timeout(DISCONNECT_TIMEOUT, &mut pump).await.is_err() {
            warn!("Event pump for {} did not finish, aborting", self.device.address);
            pump.abort();
        }
    }
}

/// Owns the session and the data pipeline behind it.
pub struct SessionController {
    radio: Arc<dyn Radio>,
    discovery: DeviceDiscovery,
    inspector: ServiceInspector,
    decoder: RecordDecoder,
    framing: Option<String>,
    scan_secs: u64,
    connect_timeout: Duration,
    reconnect_policy: ReconnectPolicy,
    history: Arc<RwLock<HistoryBuffer>>,
    status: Arc<AppState>,
    active: AsyncMutex<Option<ActiveSession>>,
    opening: Mutex<Option<Arc<ConnectionSession>>>,
    reconnect: Mutex<Option<CancellationToken>>,
    event_tx: mpsc::Sender<ControllerEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<ControllerEvent>>>,
}

impl SessionController {
    pub fn new(radio: Arc<dyn Radio>, config: &Config) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

        Arc::new(Self {
            discovery: DeviceDiscovery::new(radio.clone())
                .with_name_filter(config.device_name_filter.clone()),
            inspector: ServiceInspector::new(radio.clone()),
            radio,
            decoder: RecordDecoder::from_config(config),
            framing: config
                .frame_messages
                .then(|| config.data_separator.clone()),
            scan_secs: config.scan_timeout,
            connect_timeout: config.connect_timeout(),
            reconnect_policy: ReconnectPolicy {
                enabled: config.auto_reconnect,
                interval: config.reconnect_interval(),
            },
            history: Arc::new(RwLock::new(HistoryBuffer::new(config.data_buffer_size))),
            status: AppState::new(),
            active: AsyncMutex::new(None),
            opening: Mutex::new(None),
            reconnect: Mutex::new(None),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        })
    }

    /// Take the event receiver. Only the first call gets it.
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<ControllerEvent>> {
        self.event_rx.lock().take()
    }

    pub fn status(&self) -> Arc<AppState> {
        self.status.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.get_state()
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    /// Scan for nearby devices.
    pub async fn scan(&self) -> Result<Vec<DeviceDescriptor>, DiscoveryError> {
        self.discovery.scan(self.scan_secs).await
    }

    /// Scan on a background task and publish the outcome.
    pub fn spawn_scan(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            let event = match controller.scan().await {
                Ok(devices) => {
                    info!("Scan found {} device(s)", devices.len());
                    ControllerEvent::ScanCompleted(devices)
                }
                Err(e) => {
                    warn!("Scan failed: {}", e);
                    ControllerEvent::error(e.to_string(), ErrorCategory::Discovery)
                }
            };
            publish(&controller.event_tx, event).await;
        })
    }

    pub async fn diagnose(&self, address: &str) -> DiagnosisResult {
        self.inspector.diagnose(address).await
    }

    /// Diagnose on a background task and publish the outcome.
    pub fn spawn_diagnose(self: &Arc<Self>, address: &str) -> JoinHandle<()> {
        let controller = self.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            let result = controller.diagnose(&address).await;
            if let Some(e) = &result.error {
                publish(
                    &controller.event_tx,
                    ControllerEvent::error(e.to_string(), ErrorCategory::Diagnosis),
                )
                .await;
            }
            publish(
                &controller.event_tx,
                ControllerEvent::DiagnosisCompleted { address, result },
            )
            .await;
        })
    }

    /// Connect to `address` on RFCOMM channel `port`.
    ///
    /// Fails with `AlreadyConnected` while a session is live. A pending
    /// reconnect loop is abandoned in favour of this request.
    pub async fn connect(self: &Arc<Self>, address: &str, port: u8) -> Result<(), ControllerError> {
        self.stop_reconnect();
        self.open_session(address, port).await
    }

    async fn open_session(self: &Arc<Self>, address: &str, port: u8) -> Result<(), ControllerError> {
        let mut active = self.active.lock().await;

        if let Some(current) = active.as_ref() {
            if current.session.state() != SessionState::Idle {
                let err = ControllerError::AlreadyConnected(current.device.address.clone());
                publish(
                    &self.event_tx,
                    ControllerEvent::error(err.to_string(), err.category()),
                )
                .await;
                return Err(err);
            }
        }
        if let Some(previous) = active.take() {
            debug!("Releasing finished session to {}", previous.device.address);
            previous.retire().await;
        }

        let device = DeviceInfo {
            address: address.to_string(),
            name: self.resolve_name(address).await,
            port,
        };
        self.status.set_connecting(device.clone());

        let (session_tx, session_rx) = mpsc::channel(SESSION_EVENT_BUFFER);
        let session = Arc::new(ConnectionSession::new(
            self.radio.clone(),
            session_tx,
            self.connect_timeout,
        ));

        let mut pump = EventPump::new(
            self.decoder.clone(),
            self.history.clone(),
            self.status.clone(),
            device.clone(),
            self.event_tx.clone(),
        );
        if let Some(separator) = &self.framing {
            pump = pump.with_framing(separator);
        }
        let pump = tokio::spawn(run_pump(
            Arc::downgrade(self),
            session_rx,
            pump,
            device.clone(),
        ));

        *self.opening.lock() = Some(session.clone());
        let result = session.connect(address, port).await;
        self.opening.lock().take();

        match result {
            Ok(()) => {
                *active = Some(ActiveSession {
                    session,
                    pump,
                    device,
                });
                Ok(())
            }
            Err(e) => {
                ActiveSession {
                    session,
                    pump,
                    device,
                }
                .retire()
                .await;

                if e != SessionError::Cancelled {
                    self.status.set_error(e.to_string());
                    publish(
                        &self.event_tx,
                        ControllerEvent::error(e.to_string(), e.category()),
                    )
                    .await;
                }
                Err(e.into())
            }
        }
    }

    async fn resolve_name(&self, address: &str) -> String {
        match self.radio.resolve_name(address).await {
            Ok(Some(name)) => name,
            Ok(None) => UNKNOWN_NAME.to_string(),
            Err(e) => {
                debug!("Name lookup for {} failed: {}", address, e);
                UNKNOWN_NAME.to_string()
            }
        }
    }

    /// Tear down the current session, if any.
    ///
    /// Also stops the reconnect loop and cancels a connect in progress. When
    /// this returns no further events from the old session are published.
    pub async fn disconnect(&self) {
        self.stop_reconnect();

        let opening = self.opening.lock().clone();
        if let Some(session) = opening {
            info!("Cancelling connection attempt");
            session.disconnect().await;
        }

        let active = self.active.lock().await.take();
        match active {
            Some(active) => {
                active.session.disconnect().await;
                active.retire().await;
                self.status.set_disconnected();
            }
            None => debug!("Disconnect requested with no session"),
        }
    }

    /// Write raw bytes to the connected device.
    pub async fn send(&self, data: &[u8]) -> Result<(), ControllerError> {
        let session = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|active| active.session.clone())
            .ok_or(SessionError::NotConnected)?;
        session.send(data).await.map_err(ControllerError::from)
    }

    /// Snapshot of the whole history, oldest first.
    pub fn history(&self) -> Vec<DecodedRecord> {
        self.history.read().query(None)
    }

    /// Newest `count` records, oldest first.
    pub fn recent(&self, count: usize) -> Vec<DecodedRecord> {
        self.history.read().query(Some(count))
    }

    pub fn clear_history(&self) {
        self.history.write().clear();
        info!("History cleared");
    }

    pub fn export_csv(&self, path: &Path) -> Result<usize, ExportError> {
        let snapshot = self.history.read().clone();
        snapshot.export_csv(path)
    }

    fn stop_reconnect(&self) {
        if let Some(token) = self.reconnect.lock().take() {
            debug!("Stopping reconnect loop");
            token.cancel();
        }
    }

    /// Start the reconnect loop for a link that dropped on its own.
    fn on_link_lost(self: &Arc<Self>, device: DeviceInfo) {
        let policy = self.reconnect_policy;
        if !policy.enabled {
            return;
        }

        let token = CancellationToken::new();
        if let Some(previous) = self.reconnect.lock().replace(token.clone()) {
            previous.cancel();
        }

        info!(
            "Link to {} lost, reconnecting every {:?}",
            device.address, policy.interval
        );
        tokio::spawn(reconnect_loop(Arc::downgrade(self), device, policy, token));
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(token) = self.reconnect.get_mut().take() {
            token.cancel();
        }
    }
}

/// Feed one session's events through its pump.
async fn run_pump(
    controller: Weak<SessionController>,
    mut session_rx: mpsc::Receiver<SessionEvent>,
    mut pump: EventPump,
    device: DeviceInfo,
) {
    while let Some(event) = session_rx.recv().await {
        let Some(reason) = pump.process_event(event).await else {
            continue;
        };

        if reason != DisconnectReason::Requested {
            if let Some(controller) = controller.upgrade() {
                controller.on_link_lost(device);
            }
        }
        break;
    }
    debug!("Event pump finished");
}

async fn reconnect_loop(
    controller: Weak<SessionController>,
    device: DeviceInfo,
    policy: ReconnectPolicy,
    token: CancellationToken,
) {
    let mut attempt = 0u32;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(policy.interval) => {}
        }
        let Some(controller) = controller.upgrade() else {
            break;
        };

        attempt += 1;
        info!("Reconnect attempt {} to {}", attempt, device.address);
        publish(&controller.event_tx, ControllerEvent::Reconnecting { attempt }).await;

        match controller.open_session(&device.address, device.port).await {
            Ok(()) => {
                info!("Reconnected to {}", device.address);
                break;
            }
            Err(ControllerError::AlreadyConnected(_)) => break,
            Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
        }
        if token.is_cancelled() {
            break;
        }
    }
    debug!("Reconnect loop for {} finished", device.address);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::MockRadio;
    use crate::data::FieldValue;
    use crate::error::ConnectionError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const HC05: &str = "00:11:22:33:44:55";

    fn quiet_config() -> Config {
        Config {
            auto_reconnect: false,
            ..Config::default()
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<ControllerEvent>) -> ControllerEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_connect_decode_and_store() {
        let radio = Arc::new(MockRadio::with_sample_data());
        let controller = SessionController::new(radio.clone(), &quiet_config());
        let mut rx = controller.take_event_receiver().unwrap();
        assert!(controller.take_event_receiver().is_none());

        controller.connect(HC05, 1).await.unwrap();
        match next_event(&mut rx).await {
            ControllerEvent::ConnectionChanged {
                connected: true,
                device: Some(device),
            } => {
                assert_eq!(device.name, "HC-05");
                assert_eq!(device.port, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(controller.state(), ConnectionState::Connected);

        let mut remote = radio.next_remote().await.unwrap();
        remote.write_all(b"temperatura:25.5,humedad:60.2").await.unwrap();

        match next_event(&mut rx).await {
            ControllerEvent::DataReceived(record) => {
                assert_eq!(record.sequence_number, 1);
                assert_eq!(
                    record.fields.get("temperatura"),
                    Some(&FieldValue::Number(25.5))
                );
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(controller.history().len(), 1);

        controller.disconnect().await;
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let radio = Arc::new(MockRadio::with_sample_data());
        let controller = SessionController::new(radio.clone(), &quiet_config());
        let _rx = controller.take_event_receiver();

        controller.connect(HC05, 1).await.unwrap();
        let err = controller.connect(HC05, 1).await.unwrap_err();

        assert_eq!(err, ControllerError::AlreadyConnected(HC05.to_string()));
        assert_eq!(err.category(), ErrorCategory::InvalidState);
        assert_eq!(radio.connect_attempts(), 1);

        controller.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_publishes_once() {
        let radio = Arc::new(MockRadio::with_sample_data());
        let controller = SessionController::new(radio, &quiet_config());
        let mut rx = controller.take_event_receiver().unwrap();

        controller.connect(HC05, 1).await.unwrap();
        next_event(&mut rx).await;

        controller.disconnect().await;
        assert!(matches!(
            next_event(&mut rx).await,
            ControllerEvent::ConnectionChanged {
                connected: false,
                ..
            }
        ));
        assert_eq!(controller.state(), ConnectionState::Disconnected);

        controller.disconnect().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error() {
        let radio = Arc::new(
            MockRadio::with_sample_data()
                .with_connect_error(ConnectionError::Refused("host is down".to_string())),
        );
        let controller = SessionController::new(radio, &quiet_config());
        let mut rx = controller.take_event_receiver().unwrap();

        let err = controller.connect(HC05, 1).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Connection);
        assert_eq!(controller.state(), ConnectionState::Error);
        assert!(matches!(
            next_event(&mut rx).await,
            ControllerEvent::Error {
                category: ErrorCategory::Connection,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_connect_after_remote_close() {
        let radio = Arc::new(MockRadio::with_sample_data());
        let controller = SessionController::new(radio.clone(), &quiet_config());
        let mut rx = controller.take_event_receiver().unwrap();

        controller.connect(HC05, 1).await.unwrap();
        next_event(&mut rx).await;
        drop(radio.next_remote().await.unwrap());

        assert!(matches!(
            next_event(&mut rx).await,
            ControllerEvent::ConnectionChanged {
                connected: false,
                ..
            }
        ));

        controller.connect(HC05, 1).await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            ControllerEvent::ConnectionChanged {
                connected: true,
                ..
            }
        ));
        controller.disconnect().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_link_loss() {
        let radio = Arc::new(MockRadio::with_sample_data());
        let config = Config {
            auto_reconnect: true,
            reconnect_interval: 1,
            ..Config::default()
        };
        let controller = SessionController::new(radio.clone(), &config);
        let mut rx = controller.take_event_receiver().unwrap();

        controller.connect(HC05, 1).await.unwrap();
        next_event(&mut rx).await;
        drop(radio.next_remote().await.unwrap());

        assert!(matches!(
            next_event(&mut rx).await,
            ControllerEvent::ConnectionChanged {
                connected: false,
                ..
            }
        ));
        assert!(matches!(
            next_event(&mut rx).await,
            ControllerEvent::Reconnecting { attempt: 1 }
        ));
        assert!(matches!(
            next_event(&mut rx).await,
            ControllerEvent::ConnectionChanged {
                connected: true,
                ..
            }
        ));
        assert_eq!(radio.connect_attempts(), 2);

        controller.disconnect().await;
    }

    #[tokio::test]
    async fn test_no_reconnect_after_user_disconnect() {
        let radio = Arc::new(MockRadio::with_sample_data());
        let config = Config {
            auto_reconnect: true,
            reconnect_interval: 1,
            ..Config::default()
        };
        let controller = SessionController::new(radio.clone(), &config);
        let _rx = controller.take_event_receiver();

        controller.connect(HC05, 1).await.unwrap();
        controller.disconnect().await;
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(radio.connect_attempts(), 1);
        assert!(!controller.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_with_undrained_receiver() {
        let radio = Arc::new(MockRadio::with_sample_data());
        let controller = SessionController::new(radio.clone(), &quiet_config());
        let _rx = controller.take_event_receiver();

        controller.connect(HC05, 1).await.unwrap();
        let mut remote = radio.next_remote().await.unwrap();
        tokio::spawn(async move {
            for _ in 0..500 {
                if remote.write_all(&[b'x'; 1024]).await.is_err() {
                    break;
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        timeout(Duration::from_secs(10), controller.disconnect())
            .await
            .expect("disconnect must not wait on the event consumer");
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert!(!controller.history().is_empty());
    }

    #[tokio::test]
    async fn test_channel_error_reported() {
        let radio = Arc::new(MockRadio::with_sample_data().with_read_error("reset"));
        let controller = SessionController::new(radio, &quiet_config());
        let mut rx = controller.take_event_receiver().unwrap();

        controller.connect(HC05, 1).await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            ControllerEvent::ConnectionChanged {
                connected: true,
                ..
            }
        ));
        assert!(matches!(
            next_event(&mut rx).await,
            ControllerEvent::ConnectionChanged {
                connected: false,
                ..
            }
        ));
        match next_event(&mut rx).await {
            ControllerEvent::Error { message, category } => {
                assert_eq!(category, ErrorCategory::Connection);
                assert!(message.contains("reset"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(controller.state(), ConnectionState::Error);
        assert_eq!(controller.status().get_last_error().as_deref(), Some("reset"));
    }

    #[tokio::test]
    async fn test_send_reaches_remote() {
        let radio = Arc::new(MockRadio::with_sample_data());
        let controller = SessionController::new(radio.clone(), &quiet_config());
        let _rx = controller.take_event_receiver();

        assert_eq!(
            controller.send(b"ping").await,
            Err(ControllerError::Session(SessionError::NotConnected))
        );

        controller.connect(HC05, 1).await.unwrap();
        let mut remote = radio.next_remote().await.unwrap();
        controller.send(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        controller.disconnect().await;
    }

    #[tokio::test]
    async fn test_spawned_scan_and_diagnose() {
        let radio = Arc::new(MockRadio::with_sample_data());
        let controller = SessionController::new(radio, &quiet_config());
        let mut rx = controller.take_event_receiver().unwrap();

        controller.spawn_scan().await.unwrap();
        match next_event(&mut rx).await {
            ControllerEvent::ScanCompleted(devices) => assert_eq!(devices.len(), 2),
            other => panic!("unexpected event: {:?}", other),
        }

        controller.spawn_diagnose(HC05).await.unwrap();
        match next_event(&mut rx).await {
            ControllerEvent::DiagnosisCompleted { address, result } => {
                assert_eq!(address, HC05);
                assert!(result.compatible);
                assert_eq!(result.suggested_port, Some(1));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clear_keeps_sequence() {
        let radio = Arc::new(MockRadio::with_sample_data());
        let controller = SessionController::new(radio.clone(), &quiet_config());
        let mut rx = controller.take_event_receiver().unwrap();

        controller.connect(HC05, 1).await.unwrap();
        next_event(&mut rx).await;
        let mut remote = radio.next_remote().await.unwrap();

        remote.write_all(b"a").await.unwrap();
        next_event(&mut rx).await;
        controller.clear_history();
        assert!(controller.history().is_empty());

        remote.write_all(b"b").await.unwrap();
        match next_event(&mut rx).await {
            ControllerEvent::DataReceived(record) => assert_eq!(record.sequence_number, 2),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(controller.recent(10).len(), 1);

        controller.disconnect().await;
    }
}

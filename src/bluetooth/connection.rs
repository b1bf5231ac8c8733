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

//! Single-use connection to one remote device.
//!
//! A session goes `Idle -> Connecting -> Connected -> Disconnecting -> Idle`
//! exactly once. The receive loop runs on its own task and is the only
//! producer of chunk events, so chunks and state changes reach the consumer
//! in the order they happened.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::radio::{BoxedChannel, Radio};
use crate::error::{ConnectionError, SessionError};

/// Maximum bytes per read.
pub const READ_CHUNK_SIZE: usize = 1024;

/// How long `disconnect` waits for the receive loop before aborting it.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// State of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Connecting => "Connecting",
            SessionState::Connected => "Connected",
            SessionState::Disconnecting => "Disconnecting",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect` was called.
    Requested,
    /// The remote side closed the channel.
    RemoteClosed,
    /// The channel failed while connected.
    ChannelError(String),
}

/// Events emitted by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Channel open, receive loop running.
    Connected { address: String, port: u8 },
    /// One read's worth of bytes.
    Chunk(Vec<u8>),
    /// Session is back to idle.
    Disconnected { reason: DisconnectReason },
}

#[derive(Debug)]
struct Lifecycle {
    state: SessionState,
    used: bool,
}

type Writer = Arc<AsyncMutex<Option<WriteHalf<BoxedChannel>>>>;

/// Everything the receive loop shares with its session.
struct LoopContext {
    lifecycle: Arc<Mutex<Lifecycle>>,
    writer: Writer,
    event_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
}

impl LoopContext {
    /// Deliver an event unless the session is being torn down.
    async fn emit(&self, event: SessionEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = self.event_tx.send(event) => {
                if res.is_err() {
                    warn!("Session event consumer is gone");
                }
                res.is_ok()
            }
        }
    }

    /// End the session after `emit` failed. Cancellation means `disconnect`
    /// owns the teardown.
    async fn consumer_gone(&self) {
        if !self.cancel.is_cancelled() {
            self.finish(DisconnectReason::ChannelError(
                "event consumer closed".to_string(),
            ))
            .await;
        }
    }

    /// Move to idle after the channel ended on its own.
    async fn finish(&self, reason: DisconnectReason) {
        let won = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == SessionState::Connected {
                lifecycle.state = SessionState::Idle;
                true
            } else {
                false
            }
        };
        if !won {
            return;
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!("Session dropped before its disconnect was delivered");
            }
            res = self.event_tx.send(SessionEvent::Disconnected { reason }) => {
                if res.is_err() {
                    debug!("Session event consumer is gone");
                }
            }
        }
    }
}

/// Handler for a single Bluetooth connection.
pub struct ConnectionSession {
    radio: Arc<dyn Radio>,
    connect_timeout: Duration,
    lifecycle: Arc<Mutex<Lifecycle>>,
    writer: Writer,
    receiver: Mutex<Option<JoinHandle<()>>>,
    event_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
}

impl ConnectionSession {
    /// Create an idle session that reports to `event_tx`.
    pub fn new(
        radio: Arc<dyn Radio>,
        event_tx: mpsc::Sender<SessionEvent>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            radio,
            connect_timeout,
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: SessionState::Idle,
                used: false,
            })),
            writer: Arc::new(AsyncMutex::new(None)),
            receiver: Mutex::new(None),
            event_tx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Open the channel and start the receive loop.
    ///
    /// The `Connected` event is the first event the receive loop emits. A
    /// session can only be connected once; create a new one to reconnect.
    pub async fn connect(&self, address: &str, port: u8) -> Result<(), SessionError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != SessionState::Idle || lifecycle.used {
                let state = if lifecycle.state == SessionState::Idle {
                    "already used".to_string()
                } else {
                    lifecycle.state.to_string()
                };
                return Err(SessionError::InvalidState {
                    operation: "connect",
                    state,
                });
            }
            lifecycle.state = SessionState::Connecting;
            lifecycle.used = true;
        }
        info!("Connecting to {} channel {}", address, port);

        let opened = tokio::select! {
            _ = self.cancel.cancelled() => Err(SessionError::Cancelled),
            res = timeout(self.connect_timeout, self.radio.open_channel(address, port)) => {
                match res {
                    Ok(Ok(channel)) => Ok(channel),
                    Ok(Err(e)) => Err(SessionError::Connection(e)),
                    Err(_) => Err(SessionError::Connection(ConnectionError::Timeout(format!(
                        "{} channel {} did not answer within {:?}",
                        address, port, self.connect_timeout
                    )))),
                }
            }
        };

        let channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Connection to {} failed: {}", address, e);
                let mut lifecycle = self.lifecycle.lock();
                if lifecycle.state == SessionState::Connecting {
                    lifecycle.state = SessionState::Idle;
                }
                return Err(e);
            }
        };

        let (reader, writer) = tokio::io::split(channel);
        *self.writer.lock().await = Some(writer);

        let context = LoopContext {
            lifecycle: self.lifecycle.clone(),
            writer: self.writer.clone(),
            event_tx: self.event_tx.clone(),
            cancel: self.cancel.clone(),
        };

        let accepted = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == SessionState::Connecting && !self.cancel.is_cancelled() {
                lifecycle.state = SessionState::Connected;
                let handle = tokio::spawn(receive_loop(
                    reader,
                    context,
                    address.to_string(),
                    port,
                ));
                *self.receiver.lock() = Some(handle);
                true
            } else {
                false
            }
        };

        if !accepted {
            debug!("Connect to {} superseded by disconnect", address);
            self.writer.lock().await.take();
            return Err(SessionError::Cancelled);
        }

        info!("Connected to {} channel {}", address, port);
        Ok(())
    }

    /// Stop the receive loop, release the channel and return to idle.
    ///
    /// Does nothing when already idle. When it returns the receive loop has
    /// exited, so no further events are produced by this session.
    pub async fn disconnect(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.state {
                SessionState::Idle | SessionState::Disconnecting => return,
                SessionState::Connecting | SessionState::Connected => {
                    lifecycle.state = SessionState::Disconnecting;
                }
            }
        }

        info!("Disconnecting session");
        self.cancel.cancel();

        let handle = self.receiver.lock().take();
        if let Some(mut handle) = handle {
            match timeout(DISCONNECT_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!("Receive loop stopped"),
                Ok(Err(e)) => warn!("Receive loop ended abnormally: {}", e),
                Err(_) => {
                    warn!(
                        "Receive loop did not stop within {:?}, aborting",
                        DISCONNECT_TIMEOUT
                    );
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Channel shutdown: {}", e);
            }
        }

        self.lifecycle.lock().state = SessionState::Idle;
        let delivered = self
            .event_tx
            .send_timeout(
                SessionEvent::Disconnected {
                    reason: DisconnectReason::Requested,
                },
                DISCONNECT_TIMEOUT,
            )
            .await;
        if let Err(e) = delivered {
            warn!("Disconnect event not delivered: {}", e);
        }
        info!("Disconnected");
    }

    /// Write `data` to the remote device.
    ///
    /// The whole buffer is written or the call fails.
    pub async fn send(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }

        let mut guard = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SessionError::NotConnected),
            guard = self.writer.lock() => guard,
        };
        let writer = guard.as_mut().ok_or(SessionError::NotConnected)?;

        let written = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SessionError::NotConnected),
            res = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => res,
        };
        written.map_err(|e| SessionError::Write(e.to_string()))?;

        debug!("Sent {} bytes", data.len());
        Ok(())
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Read until cancelled, closed or failed.
async fn receive_loop(
    mut reader: ReadHalf<BoxedChannel>,
    context: LoopContext,
    address: String,
    port: u8,
) {
    info!("Receive loop started for {}", address);

    if !context
        .emit(SessionEvent::Connected {
            address: address.clone(),
            port,
        })
        .await
    {
        context.consumer_gone().await;
        return;
    }

    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            biased;
            _ = context.cancel.cancelled() => {
                debug!("Receive loop cancelled");
                break;
            }
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                info!("Connection closed by remote");
                context.finish(DisconnectReason::RemoteClosed).await;
                break;
            }
            Ok(n) => {
                debug!("Received {} bytes", n);
                if !context.emit(SessionEvent::Chunk(buf[..n].to_vec())).await {
                    context.consumer_gone().await;
                    break;
                }
            }
            Err(e) => {
                error!("Read error: {}", e);
                context
                    .finish(DisconnectReason::ChannelError(e.to_string()))
                    .await;
                break;
            }
        }
    }

    info!("Receive loop for {} finished", address);
}

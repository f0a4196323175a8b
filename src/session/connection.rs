//! WebSocket session connection
//!
//! One connection per upgraded socket, bound to a single device. Two loops
//! run per connection:
//!
//! - the read loop decodes client frames and forwards commands to the broker
//! - the write loop drains the outbound queue, turns device events into
//!   frames, and sends keepalive pings
//!
//! Both stop on the connection's cancellation token. Everything the client
//! receives goes through a bounded outbound queue; when it is full the new
//! frame is dropped and counted, so the broker never waits on a slow client.

use super::hub::SessionHub;
use super::message::{codes, command_payload, ClientMessage, FrameKind, ServerFrame};
use crate::broker::{DeviceBus, DeviceEvent, SubscriptionId};
use crate::config::BridgeConfig;
use crate::error::{BrokerError, SessionError};
use crate::identity::{self, IdentifierKind};
use axum::extract::ws::Message;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-connection limits and timers
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub send_buffer: usize,
    /// Depth of the broker-to-session device event channel
    pub event_buffer: usize,
    pub max_message_size: usize,
    pub ping_interval: Duration,
    pub pong_wait: Duration,
    pub write_wait: Duration,
}

impl From<&BridgeConfig> for SessionOptions {
    fn from(config: &BridgeConfig) -> Self {
        let ws = &config.websocket;
        Self {
            send_buffer: ws.send_buffer.max(1),
            event_buffer: config.broker.subscriber_queue_size.max(1),
            max_message_size: ws.max_message_size,
            ping_interval: ws.ping_interval(),
            pong_wait: ws.pong_wait(),
            write_wait: ws.write_wait(),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

type Receivers = (mpsc::Receiver<String>, mpsc::Receiver<DeviceEvent>);

/// A client session bound to one device
pub struct SessionConnection {
    id: String,
    user_id: String,
    /// Device id as the client addressed it, normalized
    device_id: String,
    identifier_kind: IdentifierKind,
    /// Key the broker knows the device by
    device_key: String,
    bus: Arc<dyn DeviceBus>,
    options: SessionOptions,
    outbound: mpsc::Sender<String>,
    events: mpsc::Sender<DeviceEvent>,
    receivers: Mutex<Option<Receivers>>,
    subscription: Mutex<Option<SubscriptionId>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    last_activity: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl SessionConnection {
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        identifier_kind: IdentifierKind,
        device_key: impl Into<String>,
        bus: Arc<dyn DeviceBus>,
        options: SessionOptions,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(options.send_buffer.max(1));
        let (events, events_rx) = mpsc::channel(options.event_buffer.max(1));
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            device_id: device_id.into(),
            identifier_kind,
            device_key: device_key.into(),
            bus,
            options,
            outbound,
            events,
            receivers: Mutex::new(Some((outbound_rx, events_rx))),
            subscription: Mutex::new(None),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            dropped_messages: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn identifier_kind(&self) -> IdentifierKind {
        self.identifier_kind
    }

    pub fn device_key(&self) -> &str {
        &self.device_key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record client activity (any frame or pong).
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Frames waiting in the outbound queue.
    pub fn queue_len(&self) -> usize {
        self.outbound.max_capacity() - self.outbound.capacity()
    }

    pub fn queue_capacity(&self) -> usize {
        self.outbound.max_capacity()
    }

    /// Frames shed because the outbound queue was full.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Queue a frame for the client without waiting.
    pub fn send(&self, frame: &ServerFrame) -> Result<(), SessionError> {
        let text = frame
            .to_json()
            .map_err(|e| SessionError::Encode(e.to_string()))?;
        self.enqueue(text)
    }

    fn enqueue(&self, text: String) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        match self.outbound.try_send(text) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                warn!(
                    connection_id = %self.id,
                    device_id = %self.device_id,
                    dropped = self.dropped_messages(),
                    "Outbound queue full, message dropped"
                );
                Err(SessionError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SessionError::Closed),
        }
    }

    fn reply(&self, frame: ServerFrame) {
        if let Err(e) = self.send(&frame) {
            debug!(connection_id = %self.id, error = %e, "Reply not queued");
        }
    }

    fn reply_error(&self, error: &str, code: &str, details: Option<String>) {
        self.reply(ServerFrame::error(&self.device_id, error, code, details));
    }

    /// Subscribe to the bound device's uplink on the broker.
    pub fn subscribe(&self) -> Result<(), BrokerError> {
        let id = self
            .bus
            .subscribe_to_device(&self.device_key, self.events.clone())?;
        *self.subscription.lock() = Some(id);
        Ok(())
    }

    /// Turn a device publish into a frame on the outbound queue.
    pub fn handle_device_event(&self, event: &DeviceEvent) {
        let frame = ServerFrame::device_event(&self.device_id, &event.topic, &event.payload);
        if self.send(&frame).is_ok() {
            debug!(
                connection_id = %self.id,
                device_id = %self.device_id,
                topic = %event.topic,
                "Device event queued"
            );
        }
    }

    /// Handle one text frame from the client. Protocol errors are answered
    /// with an error frame; the session stays open.
    pub fn handle_text(&self, text: &str) {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                self.reply_error(
                    "Invalid message format",
                    codes::INVALID_FORMAT,
                    Some(e.to_string()),
                );
                return;
            }
        };

        match message {
            ClientMessage::DeviceCommand { device_id, data } => {
                self.handle_command(&device_id, data.as_ref())
            }
            ClientMessage::Ping => self.reply(ServerFrame::pong(&self.device_id)),
            ClientMessage::Unknown(kind) => {
                debug!(connection_id = %self.id, kind = %kind, "Unknown message type");
                self.reply_error("Unknown message type", codes::UNKNOWN_TYPE, Some(kind));
            }
        }
    }

    fn handle_command(&self, device_id: &str, data: Option<&serde_json::Value>) {
        if !identity::equals(device_id, &self.device_id) {
            warn!(
                connection_id = %self.id,
                device_id = %self.device_id,
                requested = %device_id,
                "Command for foreign device rejected"
            );
            self.reply_error(
                "Device ID mismatch",
                codes::DEVICE_MISMATCH,
                Some("Message device ID does not match connection device ID".to_string()),
            );
            return;
        }

        let payload = match command_payload(data) {
            Ok(payload) => payload,
            Err(e) => {
                self.reply_error("Invalid message data", codes::INVALID_DATA, Some(e.to_string()));
                return;
            }
        };

        match self.bus.publish_to_device(&self.device_key, Bytes::from(payload)) {
            Ok(()) => {
                info!(
                    connection_id = %self.id,
                    user_id = %self.user_id,
                    device_id = %self.device_id,
                    "Command forwarded to device"
                );
                self.reply(ServerFrame::command_ack(&self.device_id));
            }
            Err(e) => {
                warn!(
                    connection_id = %self.id,
                    device_id = %self.device_id,
                    error = %e,
                    "Command publish failed"
                );
                self.reply_error(
                    "Failed to send command to device",
                    codes::MQTT_ERROR,
                    Some(e.to_string()),
                );
            }
        }
    }

    /// Run both loops over `socket` until either ends, then unregister from
    /// `hub` and release the broker subscription.
    pub async fn run<S, E>(self: Arc<Self>, socket: S, hub: Arc<SessionHub>)
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message> + Send + 'static,
        E: Display,
        <S as Sink<Message>>::Error: Display,
    {
        let Some((outbound_rx, events_rx)) = self.receivers.lock().take() else {
            warn!(connection_id = %self.id, "Session already running");
            return;
        };

        info!(
            connection_id = %self.id,
            user_id = %self.user_id,
            device_id = %self.device_id,
            by = %self.identifier_kind,
            "Session started"
        );

        let (sink, stream) = socket.split();
        let writer = tokio::spawn(self.clone().write_loop(sink, outbound_rx, events_rx));
        self.read_loop(stream).await;
        self.close();
        let _ = writer.await;

        hub.unregister(&self);
        if let Some(id) = self.subscription.lock().take() {
            self.bus.unsubscribe_from_device(&self.device_key, id);
        }

        info!(
            connection_id = %self.id,
            user_id = %self.user_id,
            device_id = %self.device_id,
            dropped = self.dropped_messages(),
            "Session ended"
        );
    }

    async fn read_loop<R, E>(&self, mut stream: R)
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return,
                next = tokio::time::timeout(self.options.pong_wait, stream.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    info!(connection_id = %self.id, "Session idle timeout");
                    return;
                }
                Ok(None) => return,
                Ok(Some(Err(e))) => {
                    debug!(connection_id = %self.id, error = %e, "Session read failed");
                    return;
                }
                Ok(Some(Ok(message))) => message,
            };

            self.touch();
            match message {
                Message::Text(text) => {
                    if let Err(e) = self.check_size(text.as_str().len()) {
                        warn!(connection_id = %self.id, error = %e, "Closing session");
                        return;
                    }
                    self.handle_text(text.as_str());
                }
                Message::Binary(data) => {
                    if let Err(e) = self.check_size(data.len()) {
                        warn!(connection_id = %self.id, error = %e, "Closing session");
                        return;
                    }
                    self.handle_text(&String::from_utf8_lossy(&data));
                }
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(_) => return,
            }
        }
    }

    fn check_size(&self, size: usize) -> Result<(), SessionError> {
        if size > self.options.max_message_size {
            return Err(SessionError::MessageTooLarge {
                size,
                max: self.options.max_message_size,
            });
        }
        Ok(())
    }

    async fn write_loop<W>(
        self: Arc<Self>,
        mut sink: W,
        mut outbound: mpsc::Receiver<String>,
        mut events: mpsc::Receiver<DeviceEvent>,
    ) where
        W: Sink<Message> + Unpin,
        W::Error: Display,
    {
        let period = self.options.ping_interval;
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let close = sink.send(Message::Close(None));
                    let _ = tokio::time::timeout(self.options.write_wait, close).await;
                    break;
                }
                text = outbound.recv() => {
                    let Some(text) = text else { break };
                    if let Err(e) = self.write(&mut sink, Message::Text(text.into())).await {
                        debug!(connection_id = %self.id, error = %e, "Session write failed");
                        break;
                    }
                }
                Some(event) = events.recv() => self.handle_device_event(&event),
                _ = ping.tick() => {
                    if let Err(e) = self.write(&mut sink, Message::Ping(Bytes::new())).await {
                        debug!(connection_id = %self.id, error = %e, "Session ping failed");
                        break;
                    }
                }
            }
        }

        self.close();
        let _ = sink.close().await;
    }

    async fn write<W>(&self, sink: &mut W, message: Message) -> Result<(), String>
    where
        W: Sink<Message> + Unpin,
        W::Error: Display,
    {
        match tokio::time::timeout(self.options.write_wait, sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("write deadline exceeded".to_string()),
        }
    }

    /// Stop both loops. Safe to call any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        debug!(connection_id = %self.id, "Session closed");
    }
}

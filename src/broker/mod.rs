//! MQTT device broker
//!
//! Accepts device connections over TCP, authenticates them against the shared
//! device username and their hardware address, enforces the device topic
//! contract, and exposes a small publish/subscribe API to the session layer.
//!
//! Shared state is two maps behind reader/writer locks: connected clients
//! (client id to bound device key) and device event subscribers (device key to
//! a bounded channel). Delivery to subscribers uses `try_send` so a slow
//! session never stalls a device connection.

mod client;
mod lifecycle;

pub use lifecycle::{LifecycleTracker, RegistrationPayload, RegistrationSettings};

use crate::acl::{TopicAcl, MAX_DOWNLINK_QOS};
use crate::auth::DeviceAuthenticator;
use crate::config::BrokerConfig;
use crate::directory::DeviceDirectory;
use crate::error::BrokerError;
use crate::identity;
use crate::mqtt::{device_topic, TopicKind};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// An accepted device publish, as delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub device_key: String,
    pub topic: String,
    pub kind: TopicKind,
    pub payload: Bytes,
}

/// Handle returned by [`DeviceBus::subscribe_to_device`]
pub type SubscriptionId = u64;

/// Command bound for a device's down topic
#[derive(Debug, Clone)]
pub(crate) struct Downlink {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
}

/// Broker surface used by WebSocket sessions
pub trait DeviceBus: Send + Sync {
    /// Publish `payload` on `devices/<key>/down`.
    fn publish_to_device(&self, device_key: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Route every accepted uplink publish of `device_key` into `sender`.
    /// One subscriber per device: the last registration wins.
    fn subscribe_to_device(
        &self,
        device_key: &str,
        sender: mpsc::Sender<DeviceEvent>,
    ) -> Result<SubscriptionId, BrokerError>;

    /// Remove the subscriber for `device_key` if it is still `id`.
    fn unsubscribe_from_device(&self, device_key: &str, id: SubscriptionId);
}

struct ClientHandle {
    device_key: String,
    session_id: u64,
    kick: CancellationToken,
    downlink: mpsc::Sender<Downlink>,
    /// Granted QoS on the client's own down topic, if subscribed
    down_qos: Option<u8>,
}

struct Subscriber {
    id: SubscriptionId,
    sender: mpsc::Sender<DeviceEvent>,
}

/// Broker status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    pub status: &'static str,
    pub listen_addr: Option<String>,
    pub device_username: String,
    pub connected_clients: usize,
    pub subscribed_devices: usize,
}

/// MQTT broker for device clients
pub struct DeviceBroker {
    config: BrokerConfig,
    authenticator: DeviceAuthenticator,
    acl: TopicAcl,
    lifecycle: LifecycleTracker,
    log_packets: bool,
    running: AtomicBool,
    next_id: AtomicU64,
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown: Mutex<Option<CancellationToken>>,
    clients: RwLock<HashMap<String, ClientHandle>>,
    subscribers: RwLock<HashMap<String, Subscriber>>,
}

impl DeviceBroker {
    pub fn new(config: BrokerConfig, directory: Arc<dyn DeviceDirectory>) -> Self {
        let lifecycle = LifecycleTracker::new(
            directory,
            RegistrationSettings {
                allow_registration: config.allow_registration,
                default_project_id: config.default_project_id.clone(),
            },
        );

        Self {
            authenticator: DeviceAuthenticator::new(config.device_username.clone()),
            acl: TopicAcl::new(),
            lifecycle,
            log_packets: false,
            running: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            local_addr: RwLock::new(None),
            shutdown: Mutex::new(None),
            clients: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Log every MQTT packet at debug level
    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.log_packets = enabled;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Address the listener is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener, BrokerError> {
        TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|source| BrokerError::Bind {
                addr: self.config.listen_addr.clone(),
                source,
            })
    }

    /// Bind and serve until `cancel` fires or [`stop`](Self::stop) is called.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), BrokerError> {
        let listener = self.bind().await?;
        self.serve(listener, cancel).await
    }

    /// Serve device connections on an already bound listener.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        let shutdown = cancel.child_token();
        *self.shutdown.lock() = Some(shutdown.clone());
        *self.local_addr.write() = listener.local_addr().ok();
        self.lifecycle.start();
        self.running.store(true, Ordering::Release);

        info!(
            addr = ?self.local_addr(),
            device_username = %self.config.device_username,
            "MQTT broker listening"
        );

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Accepted device connection");
                        let broker = self.clone();
                        let client_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            client::handle_connection(broker, stream, peer, client_shutdown).await;
                        });
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!(error = %e, "Transient accept failure");
                    }
                    Err(e) => {
                        error!(error = %e, "MQTT listener failed");
                        break Err(BrokerError::Accept(e));
                    }
                },
            }
        };

        self.running.store(false, Ordering::Release);
        shutdown.cancel();
        *self.local_addr.write() = None;
        info!("MQTT broker stopped");
        result
    }

    /// Stop accepting and disconnect every client.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(token) = self.shutdown.lock().take() {
            token.cancel();
        }
    }

    /// Force-disconnect every client bound to `normalize(raw_id)`.
    pub fn kick(&self, raw_id: &str) -> Result<usize, BrokerError> {
        self.ensure_running()?;
        let device_key = identity::normalize(raw_id);

        let clients = self.clients.read();
        let mut kicked = 0;
        for (client_id, handle) in clients.iter() {
            if handle.device_key == device_key {
                info!(client_id = %client_id, device_id = %device_key, "Kicking device client");
                handle.kick.cancel();
                kicked += 1;
            }
        }
        Ok(kicked)
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            status: if self.is_running() { "running" } else { "stopped" },
            listen_addr: self.local_addr().map(|a| a.to_string()),
            device_username: self.config.device_username.clone(),
            connected_clients: self.clients.read().len(),
            subscribed_devices: self.subscribers.read().len(),
        }
    }

    /// Whether any client is currently bound to `device_key`
    pub fn is_device_connected(&self, device_key: &str) -> bool {
        self.clients
            .read()
            .values()
            .any(|handle| handle.device_key == device_key)
    }

    fn ensure_running(&self) -> Result<(), BrokerError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(BrokerError::NotRunning)
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Bind a client id, returning the kick token of a client it took over.
    fn register_client(&self, client_id: &str, handle: ClientHandle) -> Option<CancellationToken> {
        self.clients
            .write()
            .insert(client_id.to_string(), handle)
            .map(|previous| previous.kick)
    }

    fn unregister_client(&self, client_id: &str, session_id: u64) {
        let mut clients = self.clients.write();
        if clients
            .get(client_id)
            .is_some_and(|handle| handle.session_id == session_id)
        {
            clients.remove(client_id);
        }
    }

    fn set_down_qos(&self, client_id: &str, session_id: u64, qos: Option<u8>) {
        if let Some(handle) = self.clients.write().get_mut(client_id) {
            if handle.session_id == session_id {
                handle.down_qos = qos.map(|q| q.min(MAX_DOWNLINK_QOS));
            }
        }
    }

    /// Post-accept handling of an uplink publish.
    fn on_published(&self, device_key: &str, topic: &str, kind: TopicKind, payload: Bytes) {
        self.lifecycle.published(device_key, kind, payload.clone());
        self.dispatch(DeviceEvent {
            device_key: device_key.to_string(),
            topic: topic.to_string(),
            kind,
            payload,
        });
    }

    fn dispatch(&self, event: DeviceEvent) {
        let (id, sender) = {
            let subscribers = self.subscribers.read();
            match subscribers.get(&event.device_key) {
                Some(sub) => (sub.id, sub.sender.clone()),
                None => return,
            }
        };

        let device_key = event.device_key.clone();
        match sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(device_id = %device_key, "Subscriber queue full, dropping device event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(device_id = %device_key, "Subscriber gone, removing");
                self.unsubscribe_from_device(&device_key, id);
            }
        }
    }
}

impl DeviceBus for DeviceBroker {
    fn publish_to_device(&self, device_key: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.ensure_running()?;
        let device_key = identity::normalize(device_key);
        let topic = device_topic(&device_key, TopicKind::Down);

        let clients = self.clients.read();
        let mut delivered = 0;
        for (client_id, handle) in clients.iter() {
            let Some(qos) = handle.down_qos else {
                continue;
            };
            if handle.device_key != device_key {
                continue;
            }

            let downlink = Downlink {
                topic: topic.clone(),
                payload: payload.clone(),
                qos,
            };
            match handle.downlink.try_send(downlink) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    client_id = %client_id,
                    device_id = %device_key,
                    error = %e,
                    "Downlink dropped"
                ),
            }
        }

        debug!(device_id = %device_key, topic = %topic, delivered, "Published to device");
        Ok(())
    }

    fn subscribe_to_device(
        &self,
        device_key: &str,
        sender: mpsc::Sender<DeviceEvent>,
    ) -> Result<SubscriptionId, BrokerError> {
        self.ensure_running()?;
        let device_key = identity::normalize(device_key);
        let id = self.next_id();

        let replaced = self
            .subscribers
            .write()
            .insert(device_key.clone(), Subscriber { id, sender })
            .is_some();

        debug!(
            device_id = %device_key,
            subscription = id,
            replaced,
            "Device subscriber registered"
        );
        Ok(id)
    }

    fn unsubscribe_from_device(&self, device_key: &str, id: SubscriptionId) {
        let device_key = identity::normalize(device_key);
        let mut subscribers = self.subscribers.write();
        if subscribers.get(&device_key).is_some_and(|sub| sub.id == id) {
            subscribers.remove(&device_key);
            debug!(device_id = %device_key, subscription = id, "Device subscriber removed");
        }
    }
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDeviceDirectory;

    fn broker() -> Arc<DeviceBroker> {
        let config = BrokerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        };
        Arc::new(DeviceBroker::new(config, Arc::new(MemoryDeviceDirectory::new())))
    }

    async fn start(broker: &Arc<DeviceBroker>) -> CancellationToken {
        let cancel = CancellationToken::new();
        let listener = broker.bind().await.unwrap();
        tokio::spawn(broker.clone().serve(listener, cancel.clone()));
        while !broker.is_running() {
            tokio::task::yield_now().await;
        }
        cancel
    }

    fn bind_client(
        broker: &DeviceBroker,
        client_id: &str,
        key: &str,
    ) -> (u64, mpsc::Receiver<Downlink>) {
        let (tx, rx) = mpsc::channel(4);
        let session_id = broker.next_id();
        broker.register_client(
            client_id,
            ClientHandle {
                device_key: key.to_string(),
                session_id,
                kick: CancellationToken::new(),
                downlink: tx,
                down_qos: None,
            },
        );
        (session_id, rx)
    }

    #[tokio::test]
    async fn test_not_running_errors() {
        let broker = broker();
        assert!(matches!(
            broker.publish_to_device("AABBCCDDEEFF", Bytes::from_static(b"x")),
            Err(BrokerError::NotRunning)
        ));
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            broker.subscribe_to_device("AABBCCDDEEFF", tx),
            Err(BrokerError::NotRunning)
        ));
        assert!(matches!(broker.kick("AABBCCDDEEFF"), Err(BrokerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_stop_makes_api_unavailable() {
        let broker = broker();
        let _cancel = start(&broker).await;
        assert!(broker.local_addr().is_some());
        assert_eq!(broker.stats().status, "running");

        broker.stop();
        assert!(matches!(
            broker.publish_to_device("AABBCCDDEEFF", Bytes::new()),
            Err(BrokerError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let first = broker();
        let listener = first.bind().await.unwrap();
        let taken = listener.local_addr().unwrap().to_string();

        let second = Arc::new(DeviceBroker::new(
            BrokerConfig {
                listen_addr: taken,
                ..Default::default()
            },
            Arc::new(MemoryDeviceDirectory::new()),
        ));
        let result = second.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(BrokerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_last_subscriber_wins() {
        let broker = broker();
        let _cancel = start(&broker).await;

        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let first = broker.subscribe_to_device("aa:bb:cc:dd:ee:ff", tx1).unwrap();
        let _second = broker.subscribe_to_device("AABBCCDDEEFF", tx2).unwrap();

        broker.on_published(
            "AABBCCDDEEFF",
            "devices/AABBCCDDEEFF/up",
            TopicKind::Up,
            Bytes::from_static(b"{}"),
        );
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap().topic, "devices/AABBCCDDEEFF/up");

        // Stale handle does not remove the current subscriber
        broker.unsubscribe_from_device("AABBCCDDEEFF", first);
        assert_eq!(broker.stats().subscribed_devices, 1);
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_removed() {
        let broker = broker();
        let _cancel = start(&broker).await;

        let (tx, rx) = mpsc::channel(1);
        broker.subscribe_to_device("AABBCCDDEEFF", tx).unwrap();
        drop(rx);

        broker.on_published(
            "AABBCCDDEEFF",
            "devices/AABBCCDDEEFF/up",
            TopicKind::Up,
            Bytes::new(),
        );
        assert_eq!(broker.stats().subscribed_devices, 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribed_clients_only() {
        let broker = broker();
        let _cancel = start(&broker).await;

        let (sub_session, mut subscribed) = bind_client(&broker, "c1", "AABBCCDDEEFF");
        let (_, mut unsubscribed) = bind_client(&broker, "c2", "AABBCCDDEEFF");
        let (other_session, mut other) = bind_client(&broker, "c3", "112233445566");
        broker.set_down_qos("c1", sub_session, Some(2));
        broker.set_down_qos("c3", other_session, Some(0));

        broker
            .publish_to_device("aa-bb-cc-dd-ee-ff", Bytes::from_static(b"{\"cmd\":\"reboot\"}"))
            .unwrap();

        let downlink = subscribed.try_recv().unwrap();
        assert_eq!(downlink.topic, "devices/AABBCCDDEEFF/down");
        assert_eq!(downlink.qos, 1);
        assert!(unsubscribed.try_recv().is_err());
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_kick_matches_normalized_key() {
        let broker = broker();
        let _cancel = start(&broker).await;

        let (tx, _rx) = mpsc::channel(1);
        let kick = CancellationToken::new();
        broker.register_client(
            "c1",
            ClientHandle {
                device_key: "AABBCCDDEEFF".to_string(),
                session_id: 1,
                kick: kick.clone(),
                downlink: tx,
                down_qos: None,
            },
        );
        bind_client(&broker, "c2", "112233445566");

        assert_eq!(broker.kick("aa:bb:cc:dd:ee:ff").unwrap(), 1);
        assert!(kick.is_cancelled());
    }

    #[test]
    fn test_takeover_keeps_newer_session() {
        let broker = broker();
        let (first, _rx1) = bind_client(&broker, "c1", "AABBCCDDEEFF");
        let (second, _rx2) = bind_client(&broker, "c1", "AABBCCDDEEFF");

        broker.unregister_client("c1", first);
        assert!(broker.is_device_connected("AABBCCDDEEFF"));
        broker.unregister_client("c1", second);
        assert!(!broker.is_device_connected("AABBCCDDEEFF"));
    }
}

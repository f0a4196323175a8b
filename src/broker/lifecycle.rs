//! Device lifecycle side channel
//!
//! Connect, disconnect and accepted publishes translate into device status
//! writes. These are fire-and-forget: events are queued without waiting, a
//! single worker applies them in order, and every failure is logged and
//! swallowed so a directory outage never affects a device's MQTT session.

use crate::directory::{DeviceDirectory, DeviceStatus, DeviceType, RegistrationRequest};
use crate::error::DirectoryError;
use crate::identity::IdentifierKind;
use crate::mqtt::TopicKind;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const LIFECYCLE_QUEUE_SIZE: usize = 1024;

/// Self-registration policy
#[derive(Debug, Clone, Default)]
pub struct RegistrationSettings {
    pub allow_registration: bool,
    pub default_project_id: Option<String>,
}

/// Optional body of a `register` publish
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistrationPayload {
    pub imei: Option<String>,
    pub display_name: Option<String>,
    pub device_type: Option<DeviceType>,
}

impl RegistrationPayload {
    /// Lenient parse: anything that is not the expected JSON object yields defaults.
    pub fn parse(payload: &[u8]) -> Self {
        serde_json::from_slice(payload).unwrap_or_default()
    }
}

#[derive(Debug)]
pub(crate) enum LifecycleEvent {
    Connected { device_key: String },
    Disconnected { device_key: String },
    Published {
        device_key: String,
        kind: TopicKind,
        payload: Bytes,
    },
}

/// Status a publish of `kind` with `payload` implies.
pub(crate) fn status_for_publish(kind: TopicKind, payload: &[u8]) -> DeviceStatus {
    if kind == TopicKind::Status
        && String::from_utf8_lossy(payload)
            .trim()
            .to_lowercase()
            .contains("offline")
    {
        DeviceStatus::Offline
    } else {
        DeviceStatus::Online
    }
}

/// Queues lifecycle events for the background worker
pub struct LifecycleTracker {
    tx: mpsc::Sender<LifecycleEvent>,
    worker: Mutex<Option<(LifecycleWorker, mpsc::Receiver<LifecycleEvent>)>>,
}

impl LifecycleTracker {
    pub fn new(directory: Arc<dyn DeviceDirectory>, settings: RegistrationSettings) -> Self {
        let (tx, rx) = mpsc::channel(LIFECYCLE_QUEUE_SIZE);
        Self {
            tx,
            worker: Mutex::new(Some((LifecycleWorker { directory, settings }, rx))),
        }
    }

    /// Spawn the worker. Later calls are no-ops.
    pub fn start(&self) {
        let Some((worker, mut rx)) = self.worker.lock().take() else {
            return;
        };
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                worker.apply(event).await;
            }
            debug!("Lifecycle worker stopped");
        });
    }

    pub fn connected(&self, device_key: &str) {
        self.submit(LifecycleEvent::Connected {
            device_key: device_key.to_string(),
        });
    }

    pub fn disconnected(&self, device_key: &str) {
        self.submit(LifecycleEvent::Disconnected {
            device_key: device_key.to_string(),
        });
    }

    pub fn published(&self, device_key: &str, kind: TopicKind, payload: Bytes) {
        self.submit(LifecycleEvent::Published {
            device_key: device_key.to_string(),
            kind,
            payload,
        });
    }

    fn submit(&self, event: LifecycleEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "Lifecycle update dropped");
        }
    }
}

pub(crate) struct LifecycleWorker {
    directory: Arc<dyn DeviceDirectory>,
    settings: RegistrationSettings,
}

impl LifecycleWorker {
    pub(crate) async fn apply(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Connected { device_key } => {
                self.set_status(&device_key, DeviceStatus::Online).await;
            }
            LifecycleEvent::Disconnected { device_key } => {
                self.set_status(&device_key, DeviceStatus::Offline).await;
            }
            LifecycleEvent::Published {
                device_key,
                kind,
                payload,
            } => {
                let status = status_for_publish(kind, &payload);
                let known = self.set_status(&device_key, status).await;
                if !known && kind == TopicKind::Register && self.settings.allow_registration {
                    self.register(&device_key, &payload).await;
                }
            }
        }
    }

    /// Returns whether the device exists.
    async fn set_status(&self, device_key: &str, status: DeviceStatus) -> bool {
        let device = match self
            .directory
            .get_device_by_identifier(device_key, IdentifierKind::Mac)
            .await
        {
            Ok(device) => device,
            Err(DirectoryError::NotFound) => {
                debug!(device_id = %device_key, "Lifecycle update for unknown device");
                return false;
            }
            Err(e) => {
                warn!(device_id = %device_key, error = %e, "Device lookup failed");
                return false;
            }
        };

        if let Err(e) = self.directory.update_device_status(device.id, status).await {
            warn!(device_id = %device_key, status = %status, error = %e, "Status update failed");
        } else {
            debug!(device_id = %device_key, status = %status, "Device status updated");
        }
        true
    }

    async fn register(&self, device_key: &str, payload: &[u8]) {
        let body = RegistrationPayload::parse(payload);
        let request = RegistrationRequest {
            mac: device_key.to_string(),
            imei: body.imei,
            display_name: body.display_name.unwrap_or_default(),
            device_type: body.device_type.unwrap_or_default(),
            default_project_id: self.settings.default_project_id.clone(),
            allow_create: true,
        };

        match self.directory.find_or_create_for_registration(request).await {
            Ok((device, created)) => {
                info!(device_id = %device_key, record = %device.id, created, "Device registered");
                if let Err(e) = self
                    .directory
                    .update_device_status(device.id, DeviceStatus::Online)
                    .await
                {
                    warn!(device_id = %device_key, error = %e, "Status update failed");
                }
            }
            Err(e) => {
                warn!(device_id = %device_key, error = %e, "Device registration failed");
            }
        }
    }
}

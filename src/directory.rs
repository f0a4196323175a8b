//! Device directory and policy collaborators
//!
//! The bridge does not own device storage or the authorization engine. It
//! talks to them through [`DeviceDirectory`] and [`PolicyEnforcer`]. The
//! in-memory implementations here back the standalone binary and the tests.

use crate::config::PolicyGrant;
use crate::error::DirectoryError;
use crate::identity::{self, IdentifierKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

/// Device lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Unbound,
    Online,
    Offline,
    Maintenance,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unbound => "unbound",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Radio/network class of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    LteNr,
    WifiEth,
    #[default]
    Other,
}

/// A device as the directory stores it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: Uuid,
    /// 12 char uppercase hex, empty when only the IMEI is known
    pub mac: String,
    pub imei: Option<String>,
    pub device_type: DeviceType,
    pub project_id: Option<Uuid>,
    pub partition_id: Option<Uuid>,
    pub display_name: String,
    pub status: DeviceStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    pub fn new(mac: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mac: mac.into(),
            imei: None,
            device_type: DeviceType::Other,
            project_id: None,
            partition_id: None,
            display_name: String::new(),
            status: DeviceStatus::Unbound,
            last_seen_at: None,
        }
    }

    /// Most specific policy domain the device belongs to.
    pub fn policy_domain(&self) -> Option<String> {
        if let Some(partition) = self.partition_id {
            return Some(format!("partition:{partition}"));
        }
        self.project_id.map(|project| format!("project:{project}"))
    }
}

/// Input to [`DeviceDirectory::find_or_create_for_registration`]
#[derive(Debug, Clone, Default)]
pub struct RegistrationRequest {
    /// Raw hardware address, may be empty
    pub mac: String,
    /// Raw equipment number from the registration payload
    pub imei: Option<String>,
    pub display_name: String,
    pub device_type: DeviceType,
    pub default_project_id: Option<String>,
    pub allow_create: bool,
}

/// Device persistence interface
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Look up a device by an already normalized identifier.
    async fn get_device_by_identifier(
        &self,
        id: &str,
        kind: IdentifierKind,
    ) -> Result<DeviceRecord, DirectoryError>;

    async fn update_device_status(
        &self,
        device_id: Uuid,
        status: DeviceStatus,
    ) -> Result<(), DirectoryError>;

    /// Returns the device and whether it was created by this call.
    async fn find_or_create_for_registration(
        &self,
        request: RegistrationRequest,
    ) -> Result<(DeviceRecord, bool), DirectoryError>;
}

/// Domain-scoped authorization interface
#[async_trait]
pub trait PolicyEnforcer: Send + Sync {
    async fn enforce(
        &self,
        subject: &str,
        domain: &str,
        object: &str,
        action: &str,
    ) -> Result<bool, DirectoryError>;
}

/// Device directory held in process memory
#[derive(Debug, Default)]
pub struct MemoryDeviceDirectory {
    devices: DashMap<Uuid, DeviceRecord>,
}

impl MemoryDeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: DeviceRecord) -> Uuid {
        let id = record.id;
        self.devices.insert(id, record);
        id
    }

    pub fn get(&self, id: Uuid) -> Option<DeviceRecord> {
        self.devices.get(&id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn find_by(&self, kind: IdentifierKind, key: &str) -> Option<DeviceRecord> {
        self.devices
            .iter()
            .find(|entry| match kind {
                IdentifierKind::Mac => entry.mac == key,
                IdentifierKind::Imei => entry.imei.as_deref() == Some(key),
            })
            .map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl DeviceDirectory for MemoryDeviceDirectory {
    async fn get_device_by_identifier(
        &self,
        id: &str,
        kind: IdentifierKind,
    ) -> Result<DeviceRecord, DirectoryError> {
        self.find_by(kind, id).ok_or(DirectoryError::NotFound)
    }

    async fn update_device_status(
        &self,
        device_id: Uuid,
        status: DeviceStatus,
    ) -> Result<(), DirectoryError> {
        let mut record = self
            .devices
            .get_mut(&device_id)
            .ok_or(DirectoryError::NotFound)?;
        record.status = status;
        record.last_seen_at = Some(Utc::now());
        Ok(())
    }

    async fn find_or_create_for_registration(
        &self,
        request: RegistrationRequest,
    ) -> Result<(DeviceRecord, bool), DirectoryError> {
        let mac = if request.mac.is_empty() {
            String::new()
        } else {
            identity::normalize_mac(&request.mac)?
        };
        let imei = match request.imei.as_deref() {
            Some(raw) if !raw.is_empty() => Some(identity::normalize_imei(raw)?),
            _ => None,
        };

        if !mac.is_empty() {
            if let Some(existing) = self.find_by(IdentifierKind::Mac, &mac) {
                let mut record = self
                    .devices
                    .get_mut(&existing.id)
                    .ok_or(DirectoryError::NotFound)?;
                if record.imei.is_none() && imei.is_some() {
                    record.imei = imei.clone();
                }
                if record.display_name.is_empty() && !request.display_name.is_empty() {
                    record.display_name = request.display_name.clone();
                }
                return Ok((record.value().clone(), false));
            }
        }

        if let Some(ref imei) = imei {
            if let Some(existing) = self.find_by(IdentifierKind::Imei, imei) {
                let mut record = self
                    .devices
                    .get_mut(&existing.id)
                    .ok_or(DirectoryError::NotFound)?;
                if record.mac.is_empty() && !mac.is_empty() {
                    record.mac = mac.clone();
                }
                return Ok((record.value().clone(), false));
            }
        }

        if !request.allow_create {
            return Err(DirectoryError::NotFound);
        }

        let project = request
            .default_project_id
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or(DirectoryError::RegistrationUnavailable)?;
        let project_id = Uuid::parse_str(project)
            .map_err(|e| DirectoryError::Backend(format!("invalid default project id: {e}")))?;

        let record = DeviceRecord {
            imei,
            device_type: request.device_type,
            project_id: Some(project_id),
            display_name: request.display_name,
            ..DeviceRecord::new(mac)
        };

        debug!(device_id = %record.id, mac = %record.mac, "Device created by registration");
        self.insert(record.clone());
        Ok((record, true))
    }
}

/// Policy backed by a fixed list of grants
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    grants: Vec<PolicyGrant>,
}

impl StaticPolicy {
    pub fn new(grants: Vec<PolicyGrant>) -> Self {
        Self { grants }
    }

    /// Grants every request. For tests and local development.
    pub fn allow_all() -> Self {
        Self::new(vec![PolicyGrant {
            subject: "*".to_string(),
            domain: "*".to_string(),
            object: "*".to_string(),
            action: "*".to_string(),
        }])
    }

    pub fn deny_all() -> Self {
        Self::default()
    }

    fn allows(&self, subject: &str, domain: &str, object: &str, action: &str) -> bool {
        let field = |pattern: &str, value: &str| pattern == "*" || pattern == value;
        self.grants.iter().any(|g| {
            field(&g.subject, subject)
                && field(&g.domain, domain)
                && field(&g.object, object)
                && field(&g.action, action)
        })
    }
}

#[async_trait]
impl PolicyEnforcer for StaticPolicy {
    async fn enforce(
        &self,
        subject: &str,
        domain: &str,
        object: &str,
        action: &str,
    ) -> Result<bool, DirectoryError> {
        Ok(self.allows(subject, domain, object, action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJECT: &str = "6f1c1f0e-4d4b-4b7e-9c55-1f6a2b3c4d5e";

    fn registration(mac: &str) -> RegistrationRequest {
        RegistrationRequest {
            mac: mac.to_string(),
            default_project_id: Some(PROJECT.to_string()),
            allow_create: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_lookup_by_mac_and_imei() {
        let directory = MemoryDeviceDirectory::new();
        directory.insert(DeviceRecord {
            imei: Some("861234567890123".to_string()),
            ..DeviceRecord::new("AABBCCDDEEFF")
        });

        let by_mac = directory
            .get_device_by_identifier("AABBCCDDEEFF", IdentifierKind::Mac)
            .await
            .unwrap();
        let by_imei = directory
            .get_device_by_identifier("861234567890123", IdentifierKind::Imei)
            .await
            .unwrap();
        assert_eq!(by_mac.id, by_imei.id);

        assert_eq!(
            directory
                .get_device_by_identifier("112233445566", IdentifierKind::Mac)
                .await,
            Err(DirectoryError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_update_status_stamps_last_seen() {
        let directory = MemoryDeviceDirectory::new();
        let id = directory.insert(DeviceRecord::new("AABBCCDDEEFF"));

        directory.update_device_status(id, DeviceStatus::Online).await.unwrap();
        let record = directory.get(id).unwrap();
        assert_eq!(record.status, DeviceStatus::Online);
        assert!(record.last_seen_at.is_some());

        assert_eq!(
            directory.update_device_status(Uuid::new_v4(), DeviceStatus::Offline).await,
            Err(DirectoryError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_registration_creates_once() {
        let directory = MemoryDeviceDirectory::new();

        let (first, created) = directory
            .find_or_create_for_registration(registration("aa:bb:cc:dd:ee:ff"))
            .await
            .unwrap();
        assert!(created);
        assert_eq!(first.mac, "AABBCCDDEEFF");
        assert_eq!(first.status, DeviceStatus::Unbound);
        assert_eq!(first.project_id, Some(Uuid::parse_str(PROJECT).unwrap()));

        let (second, created) = directory
            .find_or_create_for_registration(RegistrationRequest {
                imei: Some("861234567890123".to_string()),
                display_name: "Line 3".to_string(),
                ..registration("AABBCCDDEEFF")
            })
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.imei.as_deref(), Some("861234567890123"));
        assert_eq!(second.display_name, "Line 3");
        assert_eq!(directory.len(), 1);
    }

    #[tokio::test]
    async fn test_registration_requires_project() {
        let directory = MemoryDeviceDirectory::new();
        let result = directory
            .find_or_create_for_registration(RegistrationRequest {
                default_project_id: None,
                ..registration("AABBCCDDEEFF")
            })
            .await;
        assert_eq!(result, Err(DirectoryError::RegistrationUnavailable));

        let result = directory
            .find_or_create_for_registration(RegistrationRequest {
                allow_create: false,
                ..registration("AABBCCDDEEFF")
            })
            .await;
        assert_eq!(result, Err(DirectoryError::NotFound));
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn test_registration_rejects_bad_identifiers() {
        let directory = MemoryDeviceDirectory::new();
        let result = directory
            .find_or_create_for_registration(registration("not-a-mac"))
            .await;
        assert!(matches!(result, Err(DirectoryError::Invalid(_))));
    }

    #[test]
    fn test_policy_domain_prefers_partition() {
        let project = Uuid::new_v4();
        let partition = Uuid::new_v4();
        let mut record = DeviceRecord::new("AABBCCDDEEFF");
        assert_eq!(record.policy_domain(), None);

        record.project_id = Some(project);
        assert_eq!(record.policy_domain(), Some(format!("project:{project}")));

        record.partition_id = Some(partition);
        assert_eq!(record.policy_domain(), Some(format!("partition:{partition}")));
    }

    #[tokio::test]
    async fn test_static_policy() {
        let policy = StaticPolicy::new(vec![PolicyGrant {
            subject: "alice".to_string(),
            domain: "project:p1".to_string(),
            object: "devices".to_string(),
            action: "*".to_string(),
        }]);

        assert!(policy.enforce("alice", "project:p1", "devices", "read").await.unwrap());
        assert!(!policy.enforce("bob", "project:p1", "devices", "read").await.unwrap());
        assert!(!policy.enforce("alice", "project:p2", "devices", "read").await.unwrap());
        assert!(StaticPolicy::allow_all().enforce("x", "y", "z", "w").await.unwrap());
        assert!(!StaticPolicy::deny_all().enforce("x", "y", "z", "w").await.unwrap());
    }
}

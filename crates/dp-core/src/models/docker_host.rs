use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerHost {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DockerHost {
    pub fn new(name: String, host: String, user: String, password: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            host,
            user,
            password: password.filter(|p| !p.is_empty()),
            description: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn target(&self) -> HostTarget {
        HostTarget {
            host_id: Some(self.id),
            address: self.host.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }
}

impl fmt::Debug for DockerHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DockerHost")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("is_active", &self.is_active)
            .finish()
    }
}

/// Resolved SSH connection details for one remote command.
#[derive(Clone, PartialEq, Eq)]
pub struct HostTarget {
    /// `None` when the target comes from process-level defaults.
    pub host_id: Option<Uuid>,
    pub address: String,
    pub user: String,
    pub password: Option<String>,
}

impl HostTarget {
    pub fn new(address: impl Into<String>, user: impl Into<String>, password: Option<String>) -> Self {
        Self {
            host_id: None,
            address: address.into(),
            user: user.into(),
            password: password.filter(|p| !p.is_empty()),
        }
    }

    /// `user@address`, also the key transports are cached under.
    pub fn login(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }

    pub fn public_url(&self, port: u16) -> String {
        format!("http://{}:{port}", self.address)
    }
}

impl fmt::Debug for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTarget")
            .field("host_id", &self.host_id)
            .field("login", &self.login())
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_password() {
        let host = DockerHost::new(
            "edge-1".into(),
            "10.0.0.5".into(),
            "deploy".into(),
            Some("hunter2".into()),
        );
        let rendered = format!("{host:?} {:?}", host.target());
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("deploy@10.0.0.5"));
    }

    #[test]
    fn empty_password_means_key_auth() {
        let target = HostTarget::new("10.0.0.5", "deploy", Some(String::new()));
        assert!(target.password.is_none());
        assert_eq!(target.public_url(8001), "http://10.0.0.5:8001");
    }
}

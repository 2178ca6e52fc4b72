//! Registry wire types

use serde::{Deserialize, Serialize};

/// One discoverable backend instance.
///
/// Identity is `(name, id)`; `name` alone is shared by every instance of a
/// service. The capitalized aliases accept Consul-style agent payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(alias = "ID", alias = "Id")]
    pub id: String,
    #[serde(alias = "Address")]
    pub address: String,
    #[serde(alias = "Port")]
    pub port: u16,
    #[serde(alias = "Tags", default)]
    pub tags: Vec<String>,
}

impl ServiceRegistration {
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            address: address.into(),
            port,
            tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Checks the fields a registration cannot do without.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name is required".to_string());
        }
        if self.id.trim().is_empty() {
            return Err("id is required".to_string());
        }
        if self.address.trim().is_empty() {
            return Err("address is required".to_string());
        }
        if self.port == 0 {
            return Err("port must be between 1 and 65535".to_string());
        }
        Ok(())
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// `http://address:port`, the form the router forwards to.
    pub fn base_url(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            // Bare IPv6 literal
            format!("http://[{}]:{}", self.address, self.port)
        } else {
            format!("http://{}:{}", self.address, self.port)
        }
    }
}

/// Result of a registration or deregistration call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterReply {
    pub success: bool,
    pub message: String,
}

impl RegisterReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetServicesReply {
    pub services: Vec<ServiceRegistration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeregisterRequest {
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(alias = "ID", alias = "Id")]
    pub id: String,
}

use std::collections::HashMap;
use serde::{Deserialize, Serialize};

/// Free-form service metadata, e.g. `{"proto": "http", "zone": "eu-1"}`
pub type Attrs = HashMap<String, String>;

/// One event of a service's update stream.
///
/// A subscription first yields every instance registered at subscribe time as
/// `Enumerated`, then exactly one `SyncComplete`, then `Online`/`Offline`
/// diffs for as long as it stays open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceUpdate {
    /// Instance that was already registered when the subscription started
    Enumerated {
        name: String,
        addr: String,
        #[serde(default)]
        attrs: Attrs,
    },

    /// Initial enumeration is complete, live diffs follow
    SyncComplete,

    /// Instance registered or re-registered
    Online {
        name: String,
        addr: String,
        #[serde(default)]
        attrs: Attrs,
    },

    /// Instance unregistered or expired
    Offline { name: String, addr: String },
}

impl ServiceUpdate {
    /// Service name, `None` for `SyncComplete`
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Enumerated { name, .. }
            | Self::Online { name, .. }
            | Self::Offline { name, .. } => Some(name),
            Self::SyncComplete => None,
        }
    }

    /// Instance address, `None` for `SyncComplete`
    pub fn addr(&self) -> Option<&str> {
        match self {
            Self::Enumerated { addr, .. }
            | Self::Online { addr, .. }
            | Self::Offline { addr, .. } => Some(addr),
            Self::SyncComplete => None,
        }
    }

    /// Attributes of an instance that is online
    pub fn attrs(&self) -> Option<&Attrs> {
        match self {
            Self::Enumerated { attrs, .. } | Self::Online { attrs, .. } => Some(attrs),
            _ => None,
        }
    }

    /// True for `Enumerated` and `Online`
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Enumerated { .. } | Self::Online { .. })
    }
}

/// An online service instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub addr: String,
    pub attrs: Attrs,
}

/// Body of `POST /v1/register`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub attrs: Attrs,
}

/// Body of `POST /v1/unregister` and `POST /v1/heartbeat`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub name: String,
    pub addr: String,
}

/// Error body returned by the agent for any failed call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

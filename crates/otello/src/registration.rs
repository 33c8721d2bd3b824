use alloc::string::String;

use core::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::description::NodeDescription;
use crate::topic::DeviceId;

/// The message through which an end node requests its registration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct RegistrationRequest {
    /// URL of the node's capability description.
    pub manifest: String,
    /// Opaque data forwarded to the controller factory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl RegistrationRequest {
    /// Creates a [`RegistrationRequest`].
    #[must_use]
    #[inline]
    pub fn new(manifest: impl Into<String>) -> Self {
        Self {
            manifest: manifest.into(),
            extra: None,
        }
    }

    /// Attaches opaque data to the request.
    #[must_use]
    #[inline]
    pub fn extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// The phase announced by a registration reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    /// The request has been received and is being processed.
    Ack,
    /// The node is registered.
    Success,
    /// The registration failed.
    Error,
}

impl RegistrationStatus {
    /// Returns a [`RegistrationStatus`] name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name().fmt(f)
    }
}

/// A reply published by a connector on the registration reply topic.
///
/// Every handshake starts with an `ack` and ends with either a `success`
/// carrying the assigned identifier or an `error` carrying a message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct RegistrationReply {
    /// The announced phase.
    pub status: RegistrationStatus,
    /// The identifier under which the node is registered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<DeviceId>,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RegistrationReply {
    /// Creates the `ack` [`RegistrationReply`].
    #[must_use]
    pub const fn ack() -> Self {
        Self {
            status: RegistrationStatus::Ack,
            id: None,
            message: None,
        }
    }

    /// Creates the `success` [`RegistrationReply`] carrying the assigned
    /// identifier.
    #[must_use]
    pub const fn success(id: DeviceId) -> Self {
        Self {
            status: RegistrationStatus::Success,
            id: Some(id),
            message: None,
        }
    }

    /// Creates the `error` [`RegistrationReply`] carrying a failure
    /// description.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: RegistrationStatus::Error,
            id: None,
            message: Some(message.into()),
        }
    }
}

/// A registered end node.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct EndNode {
    /// The node identifier.
    pub id: DeviceId,
    /// The node's capability description.
    pub description: NodeDescription,
    /// Opaque data carried by the registration request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl EndNode {
    /// Creates an [`EndNode`].
    #[must_use]
    pub const fn new(id: DeviceId, description: NodeDescription, extra: Option<Value>) -> Self {
        Self {
            id,
            description,
            extra,
        }
    }
}

#[cfg(test)]
#[cfg(feature = "deserialize")]
mod tests {
    use serde_json::json;

    use crate::topic::DeviceId;
    use crate::{deserialize, serialize};

    use super::{RegistrationReply, RegistrationRequest, RegistrationStatus};

    #[test]
    fn request_wire_shape() {
        let request = RegistrationRequest::new("http://10.0.0.7/description.json");
        assert_eq!(
            serialize(&request),
            json!({ "manifest": "http://10.0.0.7/description.json" })
        );

        let request = request.extra(json!({ "room": "kitchen" }));
        assert_eq!(
            deserialize::<RegistrationRequest>(serialize(&request)),
            request
        );
    }

    #[test]
    fn reply_phases() {
        assert_eq!(serialize(RegistrationReply::ack()), json!({ "status": "ack" }));

        assert_eq!(
            serialize(RegistrationReply::success(DeviceId::from("dev-3"))),
            json!({ "status": "success", "id": "dev-3" })
        );

        let error = RegistrationReply::error("manifest unreachable");
        assert_eq!(
            serialize(&error),
            json!({ "status": "error", "message": "manifest unreachable" })
        );
        assert_eq!(error.status, RegistrationStatus::Error);
    }
}
